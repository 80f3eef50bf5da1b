//! WebSocket command surface for the dashboard panel.
//!
//! One JSON text frame per request, one per reply, correlated by `id`.
//! Frames that do not parse at all are answered with an error result
//! carrying id 0.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::AppState;

#[derive(Debug, Deserialize)]
struct WsRequest {
    id: u64,
    #[serde(flatten)]
    command: Command,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum Command {
    #[serde(rename = "direktive/get_directives")]
    GetDirectives,
    #[serde(rename = "direktive/create_directive")]
    CreateDirective { message: String },
    #[serde(rename = "direktive/update_directive")]
    UpdateDirective { directive_id: String, message: String },
    #[serde(rename = "direktive/delete_directive")]
    DeleteDirective { directive_id: String },
    #[serde(rename = "direktive/download_directive")]
    DownloadDirective { directive_id: String },
    #[serde(rename = "direktive/get_conversation")]
    GetConversation { directive_id: String },
    #[serde(rename = "direktive/send_conversation_message")]
    SendConversationMessage { directive_id: String, prompt: String },
}

fn result_ok(id: u64, extra: Value) -> String {
    let mut reply = Map::new();
    reply.insert("id".to_string(), json!(id));
    reply.insert("type".to_string(), json!("result"));
    reply.insert("success".to_string(), json!(true));
    if let Value::Object(extra) = extra {
        reply.extend(extra);
    }
    Value::Object(reply).to_string()
}

fn result_err(id: u64, code: &str, message: &str) -> String {
    json!({
        "id": id,
        "type": "result",
        "success": false,
        "error": {"code": code, "message": message},
    })
    .to_string()
}

pub async fn handle(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(|socket| run(socket, state))
}

async fn run(mut socket: WebSocket, state: AppState) {
    while let Some(message) = socket.recv().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "websocket receive error");
                break;
            }
        };

        match message {
            Message::Text(text) => {
                let reply = process(&state, &text).await;
                if socket.send(Message::Text(reply)).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            // Pings are answered by the protocol layer.
            _ => {}
        }
    }
    debug!("websocket connection closed");
}

/// Execute one command frame and build its reply.
pub(super) async fn process(state: &AppState, raw: &str) -> String {
    let request: WsRequest = match serde_json::from_str(raw) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "unparseable websocket frame");
            return result_err(0, "invalid_format", &e.to_string());
        }
    };

    let id = request.id;
    debug!(id, command = ?request.command, "websocket command");
    let coordinator = &state.coordinator;

    let outcome = match request.command {
        Command::GetDirectives => coordinator.refresh().await.map(|()| {
            json!({"directives": coordinator.store().snapshot()})
        }),

        Command::CreateDirective { message } => coordinator
            .create(&message)
            .await
            .map(|directive_id| json!({"directive_id": directive_id})),

        Command::UpdateDirective {
            directive_id,
            message,
        } => coordinator
            .update(&directive_id, &message)
            .await
            .map(|()| json!({})),

        Command::DeleteDirective { directive_id } => {
            coordinator.delete(&directive_id).await.map(|()| json!({}))
        }

        Command::DownloadDirective { directive_id } => {
            coordinator.download(&directive_id).await.map(|()| json!({}))
        }

        Command::GetConversation { directive_id } => coordinator
            .get_conversation(&directive_id)
            .await
            .map(|response| json!({"messages": response.messages})),

        Command::SendConversationMessage {
            directive_id,
            prompt,
        } => coordinator
            .send_conversation_message(&directive_id, &prompt)
            .await
            .map(|response| json!({"messages": response.messages, "pull": response.pull})),
    };

    match outcome {
        Ok(extra) => result_ok(id, extra),
        Err(e) => result_err(id, "api_error", &e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::test_state;
    use super::*;

    #[tokio::test]
    async fn test_get_directives_reply_shape() {
        let server = test_state();

        let reply = process(
            &server.state,
            &json!({"id": 7, "type": "direktive/get_directives"}).to_string(),
        )
        .await;

        let value: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(value["id"], json!(7));
        assert_eq!(value["type"], json!("result"));
        assert_eq!(value["success"], json!(true));
        assert!(value["directives"].is_array());
    }

    #[tokio::test]
    async fn test_create_returns_directive_id() {
        let server = test_state();

        let reply = process(
            &server.state,
            &json!({
                "id": 3,
                "type": "direktive/create_directive",
                "message": "dim the lights at sunset",
            })
            .to_string(),
        )
        .await;

        let value: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(value["success"], json!(true));
        assert_eq!(value["directive_id"], json!("d-new"));
    }

    #[tokio::test]
    async fn test_unparseable_frame_gets_error_with_id_zero() {
        let server = test_state();

        let reply = process(&server.state, "{{{").await;
        let value: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(value["id"], json!(0));
        assert_eq!(value["success"], json!(false));
        assert_eq!(value["error"]["code"], json!("invalid_format"));
    }

    #[tokio::test]
    async fn test_unknown_command_is_rejected() {
        let server = test_state();

        let reply = process(
            &server.state,
            &json!({"id": 4, "type": "direktive/reboot"}).to_string(),
        )
        .await;

        let value: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(value["success"], json!(false));
    }

    #[tokio::test]
    async fn test_missing_required_field_is_rejected() {
        let server = test_state();

        let reply = process(
            &server.state,
            &json!({"id": 5, "type": "direktive/create_directive"}).to_string(),
        )
        .await;

        let value: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(value["success"], json!(false));
    }

    #[tokio::test]
    async fn test_command_error_keyed_by_request_id() {
        let server = test_state();

        let reply = process(
            &server.state,
            &json!({
                "id": 9,
                "type": "direktive/download_directive",
                "directive_id": "missing",
            })
            .to_string(),
        )
        .await;

        let value: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(value["id"], json!(9));
        assert_eq!(value["success"], json!(false));
        assert_eq!(value["error"]["code"], json!("api_error"));
    }
}
