use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::cloud::{ApiError, CloudApi, ConversationResponse};

use super::{CreationStage, Directive, DirectiveStatus, DirectiveStore};

/// The cloud gives up on directive builds after this long; so do we.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(380);
pub const POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum DirectiveError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("directive {0} not found")]
    NotFound(String),
}

/// Drives the directive lifecycle: CRUD calls against the cloud, the
/// stage-poll loop for in-flight creations, and conversation turns.
///
/// Poll loops run as spawned tasks tracked by directive id; [`shutdown`]
/// aborts whatever is still in flight.
///
/// [`shutdown`]: Coordinator::shutdown
pub struct Coordinator {
    api: Arc<dyn CloudApi>,
    store: Arc<DirectiveStore>,
    polls: Arc<Mutex<HashMap<String, PollEntry>>>,
    poll_generation: AtomicU64,
}

/// A tracked poll task. The generation distinguishes a finished task from a
/// re-poll that replaced it under the same directive id.
struct PollEntry {
    generation: u64,
    handle: JoinHandle<()>,
}

impl Coordinator {
    pub fn new(api: Arc<dyn CloudApi>, store: Arc<DirectiveStore>) -> Self {
        Coordinator {
            api,
            store,
            polls: Arc::new(Mutex::new(HashMap::new())),
            poll_generation: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<DirectiveStore> {
        &self.store
    }

    /// Fetch the full directive list and replace the local collection.
    pub async fn refresh(&self) -> Result<(), DirectiveError> {
        let directives = self.api.list_directives().await?;
        self.store.replace_all(directives);
        Ok(())
    }

    /// Poll the creation stage of one directive until it reaches a terminal
    /// stage or the deadline passes.
    ///
    /// Terminal stages resolve by fetching the full directive, which replaces
    /// the local entry (keeping its conversation messages). Intermediate
    /// stages merge into the entry in place. On timeout the entry is marked
    /// failed and `Ok(None)` is returned; stage-fetch errors propagate.
    pub async fn poll_directive(&self, id: &str) -> Result<Option<Directive>, DirectiveError> {
        poll_loop(self.api.as_ref(), &self.store, id).await
    }

    /// Run the poll loop as a detached background task, replacing any poll
    /// already tracked for the same directive.
    pub fn spawn_poll(&self, id: String) {
        let generation = self.poll_generation.fetch_add(1, Ordering::Relaxed);
        let api = Arc::clone(&self.api);
        let store = Arc::clone(&self.store);
        let polls = Arc::clone(&self.polls);
        let handle = tokio::spawn({
            let id = id.clone();
            async move {
                if let Err(e) = poll_loop(api.as_ref(), &store, &id).await {
                    error!(directive = %id, error = %e, "directive poll failed");
                }

                // Drop our own tracking entry, unless a re-poll has already
                // replaced it.
                let mut polls = polls.lock().unwrap();
                if polls.get(&id).is_some_and(|entry| entry.generation == generation) {
                    polls.remove(&id);
                }
            }
        });

        let mut polls = self.polls.lock().unwrap();
        if let Some(previous) = polls.insert(id, PollEntry { generation, handle }) {
            previous.handle.abort();
        }
    }

    /// Create a directive from a natural-language message and start polling
    /// its build.
    pub async fn create(&self, message: &str) -> Result<String, DirectiveError> {
        let id = self.api.create_directive(message).await?;
        debug!(directive = %id, "created directive");
        self.spawn_poll(id.clone());
        Ok(id)
    }

    /// Rewrite a directive's message, then refresh the collection.
    pub async fn update(&self, id: &str, message: &str) -> Result<(), DirectiveError> {
        let result = self.api.update_directive(id, message).await;
        // Refresh either way so the local view matches whatever the service
        // now holds.
        if let Err(e) = self.refresh().await {
            error!(error = %e, "refresh after update failed");
        }
        result.map_err(Into::into)
    }

    /// Ask the service to delete a directive. The local entry is marked
    /// `deleting` up front and stays in the collection until a refresh stops
    /// returning it.
    pub async fn delete(&self, id: &str) -> Result<(), DirectiveError> {
        self.store.set_status(id, DirectiveStatus::Deleting);
        self.api.delete_directive(id).await?;
        self.refresh().await
    }

    /// Re-submit a directive's stored message for a fresh build and poll it.
    pub async fn download(&self, id: &str) -> Result<(), DirectiveError> {
        let directive = self
            .store
            .mark_recreating(id)
            .ok_or_else(|| DirectiveError::NotFound(id.to_string()))?;

        self.api
            .update_directive(id, directive.message.as_deref().unwrap_or_default())
            .await?;
        self.spawn_poll(id.to_string());
        Ok(())
    }

    /// Fetch the conversation for a directive and merge its messages locally.
    pub async fn get_conversation(&self, id: &str) -> Result<ConversationResponse, DirectiveError> {
        fetch_conversation(self.api.as_ref(), &self.store, id).await
    }

    /// Post a conversation turn. The reply arrives asynchronously, so a
    /// conversation fetch is spawned; when the service says the directive
    /// itself changed (`pull`), a stage poll is spawned too.
    pub async fn send_conversation_message(
        &self,
        id: &str,
        prompt: &str,
    ) -> Result<ConversationResponse, DirectiveError> {
        let response = self.api.send_conversation_message(id, prompt).await?;

        let api = Arc::clone(&self.api);
        let store = Arc::clone(&self.store);
        let fetch_id = id.to_string();
        tokio::spawn(async move {
            if let Err(e) = fetch_conversation(api.as_ref(), &store, &fetch_id).await {
                error!(directive = %fetch_id, error = %e, "conversation fetch failed");
            }
        });

        if response.pull {
            self.spawn_poll(id.to_string());
        }
        Ok(response)
    }

    /// Abort every in-flight poll task.
    pub fn shutdown(&self) {
        let mut polls = self.polls.lock().unwrap();
        for (id, entry) in polls.drain() {
            debug!(directive = %id, "aborting directive poll");
            entry.handle.abort();
        }
    }
}

async fn poll_loop(
    api: &dyn CloudApi,
    store: &DirectiveStore,
    id: &str,
) -> Result<Option<Directive>, DirectiveError> {
    let start = Instant::now();

    while start.elapsed() < POLL_TIMEOUT {
        let info = api.directive_stage(id).await?;
        debug!(directive = id, stage = ?info.stage, "polled directive stage");

        match info.stage {
            CreationStage::Completed | CreationStage::Failed => {
                if info.stage == CreationStage::Failed {
                    error!(directive = id, message = ?info.stage_message, "directive build failed");
                }
                let directive = api.get_directive(id).await?;
                store.replace(directive.clone());
                return Ok(Some(directive));
            }
            _ => store.merge_stage(id, &info),
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }

    error!(directive = id, "directive build timed out");
    store.mark_timed_out(id);
    Ok(None)
}

async fn fetch_conversation(
    api: &dyn CloudApi,
    store: &DirectiveStore,
    id: &str,
) -> Result<ConversationResponse, DirectiveError> {
    let response = api.get_conversation(id).await?;
    if !response.messages.is_empty() {
        store.set_messages(id, response.messages.clone());
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::Value;

    use crate::cloud::{
        ConversationResponse, EntityStatePayload, PublishResponse, StageInfo, SubscriptionInfo,
        WebhookRegistration,
    };

    /// Serves a scripted queue of stage responses and counts fetches. Once
    /// the queue is empty it keeps answering `pending`.
    struct ScriptedCloud {
        stages: Mutex<VecDeque<StageInfo>>,
        stage_fetches: AtomicUsize,
        directive_fetches: AtomicUsize,
        fail_delete: Mutex<bool>,
    }

    impl ScriptedCloud {
        fn new(stages: Vec<CreationStage>) -> Self {
            ScriptedCloud {
                stages: Mutex::new(
                    stages
                        .into_iter()
                        .map(|stage| StageInfo {
                            stage,
                            stage_message: Some("working".to_string()),
                            message: None,
                            title: None,
                            status: None,
                        })
                        .collect(),
                ),
                stage_fetches: AtomicUsize::new(0),
                directive_fetches: AtomicUsize::new(0),
                fail_delete: Mutex::new(false),
            }
        }
    }

    #[async_trait]
    impl CloudApi for ScriptedCloud {
        async fn health(&self) -> Result<(), ApiError> {
            Ok(())
        }

        async fn subscription(&self) -> Result<SubscriptionInfo, ApiError> {
            Ok(SubscriptionInfo::default())
        }

        async fn register_webhook(&self, _: &WebhookRegistration) -> Result<(), ApiError> {
            Ok(())
        }

        async fn update_entity_state(
            &self,
            _: &EntityStatePayload,
        ) -> Result<PublishResponse, ApiError> {
            Ok(PublishResponse::default())
        }

        async fn list_directives(&self) -> Result<Vec<Directive>, ApiError> {
            Ok(Vec::new())
        }

        async fn create_directive(&self, _: &str) -> Result<String, ApiError> {
            Ok("d1".to_string())
        }

        async fn get_directive(&self, id: &str) -> Result<Directive, ApiError> {
            self.directive_fetches.fetch_add(1, Ordering::SeqCst);
            Ok(Directive {
                id: id.to_string(),
                title: Some("done".to_string()),
                message: None,
                creation_stage: CreationStage::Completed,
                creation_message: None,
                status: DirectiveStatus::Other("active".to_string()),
                discovery: false,
                messages: Vec::new(),
            })
        }

        async fn update_directive(&self, _: &str, _: &str) -> Result<(), ApiError> {
            Ok(())
        }

        async fn delete_directive(&self, _: &str) -> Result<(), ApiError> {
            if *self.fail_delete.lock().unwrap() {
                return Err(ApiError::Status {
                    status: 500,
                    body: "boom".to_string(),
                });
            }
            Ok(())
        }

        async fn directive_stage(&self, _: &str) -> Result<StageInfo, ApiError> {
            self.stage_fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.stages.lock().unwrap().pop_front().unwrap_or(StageInfo {
                stage: CreationStage::Pending,
                stage_message: None,
                message: None,
                title: None,
                status: None,
            }))
        }

        async fn get_conversation(&self, _: &str) -> Result<ConversationResponse, ApiError> {
            Ok(ConversationResponse::default())
        }

        async fn send_conversation_message(
            &self,
            _: &str,
            _: &str,
        ) -> Result<ConversationResponse, ApiError> {
            Ok(ConversationResponse {
                messages: Vec::new(),
                pull: true,
            })
        }
    }

    fn coordinator(stages: Vec<CreationStage>) -> (Arc<Coordinator>, Arc<ScriptedCloud>) {
        let cloud = Arc::new(ScriptedCloud::new(stages));
        let store = Arc::new(DirectiveStore::new());
        (
            Arc::new(Coordinator::new(cloud.clone(), store)),
            cloud,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_resolves_on_completed() {
        let (coordinator, cloud) =
            coordinator(vec![CreationStage::Pending, CreationStage::Completed]);

        let resolved = coordinator.poll_directive("d1").await.unwrap().unwrap();
        assert_eq!(resolved.creation_stage, CreationStage::Completed);
        assert_eq!(cloud.stage_fetches.load(Ordering::SeqCst), 2);
        assert_eq!(cloud.directive_fetches.load(Ordering::SeqCst), 1);

        let entry = coordinator.store().get("d1").unwrap();
        assert_eq!(entry.title.as_deref(), Some("done"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_times_out_and_marks_failed() {
        let (coordinator, cloud) = coordinator(vec![]);
        let start = Instant::now();

        let resolved = coordinator.poll_directive("d1").await.unwrap();
        assert!(resolved.is_none());
        assert!(start.elapsed() >= POLL_TIMEOUT);
        // Never resolves to a full fetch.
        assert_eq!(cloud.directive_fetches.load(Ordering::SeqCst), 0);

        let entry = coordinator.store().get("d1").unwrap();
        assert_eq!(entry.creation_stage, CreationStage::Failed);
        assert_eq!(entry.status, DirectiveStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_stage_still_fetches_directive() {
        let (coordinator, cloud) = coordinator(vec![CreationStage::Failed]);

        coordinator.poll_directive("d1").await.unwrap();
        assert_eq!(cloud.directive_fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_polls() {
        let (coordinator, _) = coordinator(vec![]);
        coordinator.spawn_poll("d1".to_string());
        tokio::task::yield_now().await;

        coordinator.shutdown();
        assert!(coordinator.polls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_poll_drops_its_handle() {
        let (coordinator, cloud) = coordinator(vec![CreationStage::Completed]);
        coordinator.spawn_poll("d1".to_string());

        // Lets the spawned poll run to completion.
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(cloud.directive_fetches.load(Ordering::SeqCst), 1);
        assert!(coordinator.polls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_marks_deleting_before_remote_call() {
        let (coordinator, cloud) = coordinator(vec![]);
        *cloud.fail_delete.lock().unwrap() = true;
        coordinator.store().replace_all(vec![Directive {
            id: "d1".to_string(),
            title: None,
            message: None,
            creation_stage: CreationStage::Completed,
            creation_message: None,
            status: DirectiveStatus::Other("active".to_string()),
            discovery: false,
            messages: Vec::new(),
        }]);

        assert!(coordinator.delete("d1").await.is_err());
        // The local marker lands before the remote call, so it sticks
        // when the call fails.
        assert_eq!(
            coordinator.store().get("d1").unwrap().status,
            DirectiveStatus::Deleting
        );
    }

    #[tokio::test]
    async fn test_download_unknown_directive() {
        let (coordinator, _) = coordinator(vec![]);
        assert!(matches!(
            coordinator.download("missing").await,
            Err(DirectiveError::NotFound(_))
        ));
    }
}
