use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::watch;

use crate::cloud::StageInfo;

use super::{CreationStage, Directive, DirectiveStatus};

/// Shared directive collection, keyed by id.
///
/// All mutation goes through per-key merge methods under one internal mutex,
/// so two concurrent polls can never clobber each other's updates. The mutex
/// is never held across an await point. Every mutation publishes a full
/// snapshot on a watch channel; observers treat each snapshot as
/// authoritative for the whole set.
pub struct DirectiveStore {
    inner: Mutex<BTreeMap<String, Directive>>,
    tx: watch::Sender<Arc<Vec<Directive>>>,
}

impl DirectiveStore {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Arc::new(Vec::new()));
        DirectiveStore {
            inner: Mutex::new(BTreeMap::new()),
            tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<Directive>>> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> Vec<Directive> {
        self.inner.lock().unwrap().values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<Directive> {
        self.inner.lock().unwrap().get(id).cloned()
    }

    fn publish(&self, inner: &BTreeMap<String, Directive>) {
        let snapshot = Arc::new(inner.values().cloned().collect::<Vec<_>>());
        let _ = self.tx.send(snapshot);
    }

    /// Replace the whole collection from a fresh list fetch.
    pub fn replace_all(&self, directives: Vec<Directive>) {
        let mut inner = self.inner.lock().unwrap();
        *inner = directives.into_iter().map(|d| (d.id.clone(), d)).collect();
        self.publish(&inner);
    }

    /// Merge an intermediate stage-poll result into one entry, synthesizing
    /// the entry if the list fetch has not seen it yet.
    pub fn merge_stage(&self, id: &str, info: &StageInfo) {
        let mut inner = self.inner.lock().unwrap();
        match inner.get_mut(id) {
            Some(directive) => {
                directive.creation_stage = info.stage.clone();
                directive.creation_message = info.stage_message.clone();
                if let Some(status) = &info.status {
                    directive.status = status.clone();
                }
            }
            None => {
                inner.insert(
                    id.to_string(),
                    Directive {
                        id: id.to_string(),
                        title: info.title.clone(),
                        message: info.message.clone(),
                        creation_stage: info.stage.clone(),
                        creation_message: info.stage_message.clone(),
                        status: DirectiveStatus::Creating,
                        discovery: false,
                        messages: Vec::new(),
                    },
                );
            }
        }
        self.publish(&inner);
    }

    /// Replace one entry with a freshly fetched directive, preserving any
    /// conversation messages already held locally.
    pub fn replace(&self, mut directive: Directive) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.get(&directive.id) {
            directive.messages = existing.messages.clone();
        }
        inner.insert(directive.id.clone(), directive);
        self.publish(&inner);
    }

    pub fn set_status(&self, id: &str, status: DirectiveStatus) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(directive) = inner.get_mut(id) {
            directive.status = status;
            self.publish(&inner);
        }
    }

    /// Reset an entry for re-creation before its message is re-submitted.
    pub fn mark_recreating(&self, id: &str) -> Option<Directive> {
        let mut inner = self.inner.lock().unwrap();
        let directive = inner.get_mut(id)?;
        directive.status = DirectiveStatus::Creating;
        directive.discovery = false;
        let directive = directive.clone();
        self.publish(&inner);
        Some(directive)
    }

    pub fn set_messages(&self, id: &str, messages: Vec<Value>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(directive) = inner.get_mut(id) {
            directive.messages = messages;
            self.publish(&inner);
        }
    }

    /// Terminal mutation applied when the poll loop exhausts its deadline.
    pub fn mark_timed_out(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(directive) = inner.get_mut(id) {
            directive.creation_stage = CreationStage::Failed;
            directive.creation_message = Some("timed out".to_string());
            directive.status = DirectiveStatus::Error;
            self.publish(&inner);
        }
    }
}

impl Default for DirectiveStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stage(stage: CreationStage, message: &str) -> StageInfo {
        StageInfo {
            stage,
            stage_message: Some(message.to_string()),
            message: None,
            title: None,
            status: None,
        }
    }

    fn directive(id: &str) -> Directive {
        Directive {
            id: id.to_string(),
            title: Some(format!("title-{id}")),
            message: Some("lights off at midnight".to_string()),
            creation_stage: CreationStage::Completed,
            creation_message: None,
            status: DirectiveStatus::Other("active".to_string()),
            discovery: true,
            messages: Vec::new(),
        }
    }

    #[test]
    fn test_merge_stage_synthesizes_missing_entry() {
        let store = DirectiveStore::new();
        store.merge_stage("d1", &stage(CreationStage::Pending, "queued"));

        let entry = store.get("d1").unwrap();
        assert_eq!(entry.creation_stage, CreationStage::Pending);
        assert_eq!(entry.status, DirectiveStatus::Creating);
        assert!(!entry.discovery);
    }

    #[test]
    fn test_concurrent_entries_do_not_clobber() {
        let store = DirectiveStore::new();
        store.merge_stage("d1", &stage(CreationStage::Pending, "queued"));
        store.merge_stage("d2", &stage(CreationStage::Pending, "queued"));
        store.merge_stage(
            "d1",
            &stage(CreationStage::Other("building".to_string()), "building"),
        );

        assert_eq!(store.get("d2").unwrap().creation_stage, CreationStage::Pending);
        assert_eq!(
            store.get("d1").unwrap().creation_stage,
            CreationStage::Other("building".to_string())
        );
    }

    #[test]
    fn test_replace_preserves_messages() {
        let store = DirectiveStore::new();
        store.replace_all(vec![directive("d1")]);
        store.set_messages("d1", vec![json!({"role": "user", "content": "hi"})]);

        store.replace(directive("d1"));
        assert_eq!(store.get("d1").unwrap().messages.len(), 1);
    }

    #[test]
    fn test_timeout_mutation() {
        let store = DirectiveStore::new();
        store.merge_stage("d1", &stage(CreationStage::Pending, "queued"));
        store.mark_timed_out("d1");

        let entry = store.get("d1").unwrap();
        assert_eq!(entry.creation_stage, CreationStage::Failed);
        assert_eq!(entry.creation_message.as_deref(), Some("timed out"));
        assert_eq!(entry.status, DirectiveStatus::Error);
    }

    #[test]
    fn test_snapshot_published_on_mutation() {
        let store = DirectiveStore::new();
        let rx = store.subscribe();
        store.replace_all(vec![directive("d1"), directive("d2")]);
        assert_eq!(rx.borrow().len(), 2);
    }
}
