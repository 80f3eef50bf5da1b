//! Directive model, shared store and the poll/reconcile coordinator.

use serde::{Deserialize, Serialize};
use serde_json::Value;

mod coordinator;
mod store;

pub use coordinator::{Coordinator, DirectiveError, POLL_INTERVAL, POLL_TIMEOUT};
pub use store::DirectiveStore;

/// Progress of the cloud-side directive build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreationStage {
    Pending,
    Completed,
    Failed,
    /// Service-defined intermediate stages pass through verbatim.
    #[serde(untagged)]
    Other(String),
}

impl Default for CreationStage {
    fn default() -> Self {
        CreationStage::Pending
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectiveStatus {
    Creating,
    Error,
    Deleting,
    #[serde(untagged)]
    Other(String),
}

impl Default for DirectiveStatus {
    fn default() -> Self {
        DirectiveStatus::Creating
    }
}

/// A single automation directive as held locally. Mutated in place by the
/// poll loop, the CRUD flows and the conversation fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Directive {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub creation_stage: CreationStage,
    #[serde(default)]
    pub creation_message: Option<String>,
    #[serde(default)]
    pub status: DirectiveStatus,
    #[serde(default)]
    pub discovery: bool,
    /// Conversation turns, kept opaque.
    #[serde(default)]
    pub messages: Vec<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stage_passthrough() {
        let stage: CreationStage = serde_json::from_value(json!("generating_plan")).unwrap();
        assert_eq!(stage, CreationStage::Other("generating_plan".to_string()));
        assert_eq!(serde_json::to_value(&stage).unwrap(), json!("generating_plan"));

        let stage: CreationStage = serde_json::from_value(json!("completed")).unwrap();
        assert_eq!(stage, CreationStage::Completed);
    }

    #[test]
    fn test_directive_defaults() {
        let directive: Directive = serde_json::from_value(json!({"id": "d1"})).unwrap();
        assert_eq!(directive.creation_stage, CreationStage::Pending);
        assert_eq!(directive.status, DirectiveStatus::Creating);
        assert!(!directive.discovery);
        assert!(directive.messages.is_empty());
    }
}
