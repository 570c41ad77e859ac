//! The offline worker: one instance per running background process.

use std::sync::{Arc, RwLock as StdRwLock};

use albumkit_net::{NetworkClient, Request};
use albumkit_store::{DurableCache, DurableKeyValueStore};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

use crate::cache::VersionedCacheStore;
use crate::clients::{Client, Clients};
use crate::codec::RequestCodec;
use crate::config::WorkerConfig;
use crate::context::{CacheGeneration, WorkerContext};
use crate::lifecycle::{ActivateReport, InstallReport, LifecycleController, UpdateCheck};
use crate::policy::{FetchOutcome, FetchPolicy};
use crate::replay::{DrainReport, ReplayQueue};
use crate::{FetchError, ServiceWorkerError};

// ==================== Types ====================

/// Worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WorkerState {
    /// Created, no lifecycle event yet.
    #[default]
    Parsed,
    /// Install event running.
    Installing,
    /// Installed, waiting for activation.
    Installed,
    /// Activate event running.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Install failed.
    Redundant,
}

/// Events delivered by the host.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Install,
    Activate,
    Fetch(Request),
    Message(JsonValue),
}

/// Result of a handled event.
#[derive(Debug)]
pub enum EventOutcome {
    Installed(InstallReport),
    Activated(ActivateReport),
    Fetch(Result<FetchOutcome, FetchError>),
    /// The `useCache` value applied, if the message was a control message.
    Message(Option<bool>),
}

/// Notifications for the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerNotification {
    /// State changed.
    StateChange { new_state: WorkerState },
    /// A newer generation is available.
    UpdateFound { generation: CacheGeneration },
    /// Controller changed.
    ControllerChange { client_id: String },
}

// ==================== Offline Worker ====================

/// Wires the lifecycle controller and fetch policy to shared state.
pub struct OfflineWorker {
    state: StdRwLock<WorkerState>,
    context: Arc<WorkerContext>,
    config: Arc<WorkerConfig>,
    lifecycle: LifecycleController,
    policy: FetchPolicy,
    replay: ReplayQueue,
    network: Arc<dyn NetworkClient>,
    clients: Arc<RwLock<Clients>>,
    event_tx: mpsc::UnboundedSender<WorkerNotification>,
}

impl OfflineWorker {
    /// Create a worker over the given capabilities.
    pub fn new(
        config: WorkerConfig,
        cache: Arc<dyn DurableCache>,
        kv: Arc<dyn DurableKeyValueStore>,
        network: Arc<dyn NetworkClient>,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerNotification>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let config = Arc::new(config);
        let context = Arc::new(WorkerContext::new());
        let clients = Arc::new(RwLock::new(Clients::new()));
        let cache = VersionedCacheStore::new(cache);
        let replay = ReplayQueue::new(
            Arc::clone(&kv),
            config.replay_store.clone(),
            config.persist_mutation_responses,
        );

        let lifecycle = LifecycleController::new(
            cache.clone(),
            kv,
            Arc::clone(&network),
            Arc::clone(&context),
            Arc::clone(&config),
            Arc::clone(&clients),
        );
        let policy = FetchPolicy::new(
            cache,
            replay.clone(),
            Arc::clone(&network),
            Arc::clone(&context),
            Arc::clone(&config),
        );

        (
            Self {
                state: StdRwLock::new(WorkerState::Parsed),
                context,
                config,
                lifecycle,
                policy,
                replay,
                network,
                clients,
                event_tx,
            },
            event_rx,
        )
    }

    /// Current state.
    pub fn state(&self) -> WorkerState {
        match self.state.read() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn context(&self) -> &WorkerContext {
        &self.context
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn replay_queue(&self) -> &ReplayQueue {
        &self.replay
    }

    /// Dispatch one host event.
    pub async fn handle(&self, event: WorkerEvent) -> Result<EventOutcome, ServiceWorkerError> {
        match event {
            WorkerEvent::Install => self.install().await.map(EventOutcome::Installed),
            WorkerEvent::Activate => self.activate().await.map(EventOutcome::Activated),
            WorkerEvent::Fetch(request) => Ok(EventOutcome::Fetch(self.fetch(request).await)),
            WorkerEvent::Message(message) => Ok(EventOutcome::Message(self.post_message(&message))),
        }
    }

    /// Run the install event.
    pub async fn install(&self) -> Result<InstallReport, ServiceWorkerError> {
        self.transition(&[WorkerState::Parsed], WorkerState::Installing)?;
        match self.lifecycle.on_install().await {
            Ok(report) => {
                self.set_state(WorkerState::Installed);
                Ok(report)
            }
            Err(e) => {
                warn!(error = %e, "Install failed");
                self.set_state(WorkerState::Redundant);
                Err(e)
            }
        }
    }

    /// Run the activate event.
    pub async fn activate(&self) -> Result<ActivateReport, ServiceWorkerError> {
        self.transition(&[WorkerState::Installed], WorkerState::Activating)?;
        match self.lifecycle.on_activate().await {
            Ok(report) => {
                self.set_state(WorkerState::Activated);
                for client_id in &report.claimed {
                    let _ = self.event_tx.send(WorkerNotification::ControllerChange {
                        client_id: client_id.clone(),
                    });
                }
                Ok(report)
            }
            Err(e) => {
                warn!(error = %e, "Activate failed");
                // Activation may be retried.
                self.set_state(WorkerState::Installed);
                Err(e)
            }
        }
    }

    /// Handle an intercepted request. Until activation the worker does not
    /// control any page, so requests pass through.
    pub async fn fetch(&self, request: Request) -> Result<FetchOutcome, FetchError> {
        if self.state() != WorkerState::Activated {
            return Ok(FetchOutcome::Passthrough);
        }
        self.policy.handle_fetch(request).await
    }

    /// Deliver a control-channel message.
    pub fn post_message(&self, message: &JsonValue) -> Option<bool> {
        if self.state() == WorkerState::Redundant {
            return None;
        }
        self.lifecycle.on_control_message(message)
    }

    /// Check for a newer version, notifying the host when one exists.
    pub async fn check_for_update(&self) -> Result<UpdateCheck, ServiceWorkerError> {
        let check = self.lifecycle.check_for_update().await?;
        if check.update_found() {
            info!(generation = %check.available, "Update found");
            let _ = self.event_tx.send(WorkerNotification::UpdateFound {
                generation: check.available.clone(),
            });
        }
        Ok(check)
    }

    /// Replay pending mutations once.
    ///
    /// Opt-in for the host; fetch handling never drains the queue.
    pub async fn drain_replay_queue(&self) -> Result<DrainReport, ServiceWorkerError> {
        let codec = RequestCodec::new(self.config.mutation_marker.clone());
        self.replay.drain(self.network.as_ref(), &codec).await
    }

    /// Register a page. Pages opened after activation are controlled at once.
    pub async fn add_client(&self, mut client: Client) -> String {
        let id = client.id.clone();
        let controlled = self.state() == WorkerState::Activated
            && client.url.as_str().starts_with(self.config.scope.as_str());
        client.controlled = controlled;
        self.clients.write().await.add(client);
        if controlled {
            let _ = self.event_tx.send(WorkerNotification::ControllerChange {
                client_id: id.clone(),
            });
        }
        id
    }

    pub async fn remove_client(&self, id: &str) -> Option<Client> {
        self.clients.write().await.remove(id)
    }

    pub fn clients(&self) -> Arc<RwLock<Clients>> {
        Arc::clone(&self.clients)
    }

    fn transition(&self, from: &[WorkerState], to: WorkerState) -> Result<(), ServiceWorkerError> {
        let mut state = match self.state.write() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !from.contains(&*state) {
            return Err(ServiceWorkerError::StateError(format!(
                "cannot move from {:?} to {:?}",
                *state, to
            )));
        }
        *state = to;
        drop(state);
        self.notify_state(to);
        Ok(())
    }

    fn set_state(&self, new_state: WorkerState) {
        {
            let mut state = match self.state.write() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            *state = new_state;
        }
        self.notify_state(new_state);
    }

    fn notify_state(&self, new_state: WorkerState) {
        info!(state = ?new_state, "Worker state changed");
        let _ = self
            .event_tx
            .send(WorkerNotification::StateChange { new_state });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockNetwork;
    use albumkit_net::Response;
    use albumkit_store::{MemoryCacheStorage, MemoryKeyValueStore};
    use serde_json::json;

    fn worker(network: Arc<MockNetwork>) -> (OfflineWorker, mpsc::UnboundedReceiver<WorkerNotification>) {
        OfflineWorker::new(
            WorkerConfig::for_scope("https://albums.example/").unwrap(),
            Arc::new(MemoryCacheStorage::new()),
            Arc::new(MemoryKeyValueStore::new()),
            network,
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<WorkerNotification>) -> Vec<WorkerNotification> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    #[tokio::test]
    async fn test_lifecycle_order_is_enforced() {
        let network = Arc::new(MockNetwork::new());
        network.respond("https://albums.example/version.json", Response::new(200, r#"{"version":"3"}"#));
        let (worker, mut rx) = worker(network);

        assert!(matches!(
            worker.activate().await,
            Err(ServiceWorkerError::StateError(_))
        ));
        assert_eq!(worker.state(), WorkerState::Parsed);

        worker.install().await.unwrap();
        assert!(worker.install().await.is_err());
        worker.activate().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Activated);

        let states: Vec<WorkerState> = drain(&mut rx)
            .into_iter()
            .filter_map(|n| match n {
                WorkerNotification::StateChange { new_state } => Some(new_state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                WorkerState::Installing,
                WorkerState::Installed,
                WorkerState::Activating,
                WorkerState::Activated
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_install_is_redundant() {
        let network = Arc::new(MockNetwork::new());
        let (worker, _rx) = worker(network);

        assert!(worker.install().await.is_err());
        assert_eq!(worker.state(), WorkerState::Redundant);
        assert_eq!(worker.post_message(&json!({"useCache": false})), None);
    }

    #[tokio::test]
    async fn test_fetch_passes_through_before_activation() {
        let network = Arc::new(MockNetwork::new());
        let (worker, _rx) = worker(network.clone());

        let request = Request::get_str("https://albums.example/app.js").unwrap();
        let outcome = worker.fetch(request).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::Passthrough));
        assert_eq!(network.call_count("https://albums.example/app.js"), 0);
    }

    #[tokio::test]
    async fn test_activation_claims_clients() {
        let network = Arc::new(MockNetwork::new());
        network.respond("https://albums.example/version.json", Response::new(200, r#"{"version":"3"}"#));
        let (worker, mut rx) = worker(network);

        let early = worker
            .add_client(Client::window(url::Url::parse("https://albums.example/").unwrap()))
            .await;
        worker.install().await.unwrap();
        let report = worker.activate().await.unwrap();
        assert_eq!(report.claimed, vec![early.clone()]);

        let late = worker
            .add_client(Client::window(url::Url::parse("https://albums.example/login").unwrap()))
            .await;

        let changed: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|n| match n {
                WorkerNotification::ControllerChange { client_id } => Some(client_id),
                _ => None,
            })
            .collect();
        assert_eq!(changed, vec![early, late]);
    }

    #[tokio::test]
    async fn test_message_event_toggles_cache_writes() {
        let network = Arc::new(MockNetwork::new());
        let (worker, _rx) = worker(network);

        let outcome = worker
            .handle(WorkerEvent::Message(json!({"useCache": false})))
            .await
            .unwrap();
        assert!(matches!(outcome, EventOutcome::Message(Some(false))));
        assert!(!worker.context().use_cache());

        let outcome = worker
            .handle(WorkerEvent::Message(json!({"type": "SKIP_WAITING"})))
            .await
            .unwrap();
        assert!(matches!(outcome, EventOutcome::Message(None)));
        assert!(!worker.context().use_cache());
    }
}
