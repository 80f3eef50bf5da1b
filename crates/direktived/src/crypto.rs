//! Symmetric encryption of JSON payloads exchanged with the cloud service.
//!
//! The wire format is AES-256-CBC with PKCS#7 padding: a random 16-byte IV is
//! prepended to the ciphertext and the whole envelope is base64-encoded. The
//! key itself travels as base64 of 32 random bytes.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use serde_json::Value;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES block size; also the IV length of the envelope.
const IV_LENGTH: usize = 16;

/// Key length for AES-256.
const KEY_LENGTH: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("encryption key must be {KEY_LENGTH} bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("envelope too short: {0} bytes")]
    TruncatedEnvelope(usize),

    #[error("decryption failed (bad key or corrupted ciphertext)")]
    Decrypt,

    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Generate a fresh base64-encoded 256-bit encryption key.
pub fn generate_key() -> String {
    let mut key = [0u8; KEY_LENGTH];
    rand::thread_rng().fill_bytes(&mut key);
    BASE64.encode(key)
}

/// Generate a fresh hex-encoded webhook secret (32 random bytes).
pub fn generate_webhook_secret() -> String {
    let mut secret = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    secret.iter().map(|b| format!("{b:02x}")).collect()
}

fn decode_key(encryption_key: &str) -> Result<[u8; KEY_LENGTH], CryptoError> {
    let raw = BASE64.decode(encryption_key)?;
    raw.try_into()
        .map_err(|raw: Vec<u8>| CryptoError::InvalidKeyLength(raw.len()))
}

/// Encrypt a JSON value, returning the base64 `IV || ciphertext` envelope.
pub fn encrypt_value(data: &Value, encryption_key: &str) -> Result<String, CryptoError> {
    let key = decode_key(encryption_key)?;

    let mut iv = [0u8; IV_LENGTH];
    rand::thread_rng().fill_bytes(&mut iv);

    let plaintext = serde_json::to_vec(data)?;
    let ciphertext = Aes256CbcEnc::new(&key.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(&plaintext);

    let mut envelope = Vec::with_capacity(IV_LENGTH + ciphertext.len());
    envelope.extend_from_slice(&iv);
    envelope.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(envelope))
}

/// Decrypt a base64 `IV || ciphertext` envelope back into a JSON value.
pub fn decrypt_value(encrypted: &str, encryption_key: &str) -> Result<Value, CryptoError> {
    let key = decode_key(encryption_key)?;

    let envelope = BASE64.decode(encrypted)?;
    if envelope.len() < IV_LENGTH {
        return Err(CryptoError::TruncatedEnvelope(envelope.len()));
    }
    let (iv, ciphertext) = envelope.split_at(IV_LENGTH);

    let iv: [u8; IV_LENGTH] = iv.try_into().expect("split_at guarantees length");
    let plaintext = Aes256CbcDec::new(&key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::Decrypt)?;

    Ok(serde_json::from_slice(&plaintext)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_round_trip() {
        let key = generate_key();
        let data = json!({
            "entities": [
                {"entity_id": "light.kitchen", "state": "on", "attributes": {"brightness": 128}}
            ]
        });

        let encrypted = encrypt_value(&data, &key).unwrap();
        let decrypted = decrypt_value(&encrypted, &key).unwrap();
        assert_eq!(decrypted, data);
    }

    #[test]
    fn test_envelope_layout() {
        let key = generate_key();
        let data = json!({"message": "turn the lights off at midnight"});

        let encrypted = encrypt_value(&data, &key).unwrap();
        let envelope = BASE64.decode(encrypted).unwrap();

        // IV followed by whole AES blocks.
        assert!(envelope.len() > IV_LENGTH);
        assert_eq!((envelope.len() - IV_LENGTH) % 16, 0);
    }

    #[test]
    fn test_wrong_key_fails() {
        let data = json!({"ok": true});
        let encrypted = encrypt_value(&data, &generate_key()).unwrap();
        assert!(decrypt_value(&encrypted, &generate_key()).is_err());
    }

    #[test]
    fn test_invalid_key_length() {
        let short_key = BASE64.encode([0u8; 16]);
        let err = encrypt_value(&json!({}), &short_key).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidKeyLength(16)));
    }

    #[test]
    fn test_webhook_secret_is_hex() {
        let secret = generate_webhook_secret();
        assert_eq!(secret.len(), 64);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
