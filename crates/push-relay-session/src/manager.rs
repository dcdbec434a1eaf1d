//! Notification service: the single-session state machine.

use std::sync::Arc;

use futures::{StreamExt, stream::BoxStream};
use push_relay_core::{
    BackendConfig, Credentials, DeliveryHandler, Endpoint, ListenHandle, MessagingClient,
    SessionEvent, SessionOwner, SessionPhase,
    traits::{ListenError, RegistrationError, StoreError},
};
use tokio::sync::{Mutex, broadcast};
use tokio_stream::wrappers::BroadcastStream;

use crate::{CredentialStore, NotificationRelay};

const PHASE_CHANNEL_CAPACITY: usize = 64;

/// Start failure. Reported as a `service-error` event, never returned.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error(transparent)]
    Listen(#[from] ListenError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A claimed start, to be finished with [`NotificationService::complete`].
#[derive(Debug)]
#[must_use = "a claimed start holds the session in `Starting` until completed or stopped"]
pub struct StartAttempt {
    generation: u64,
    owner: SessionOwner,
    config: BackendConfig,
}

impl StartAttempt {
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub const fn owner(&self) -> &SessionOwner {
        &self.owner
    }
}

/// The one open session.
struct ActiveSession {
    owner: SessionOwner,
    credentials: Credentials,
    handle: Box<dyn ListenHandle>,
    relay: Arc<NotificationRelay>,
}

impl ActiveSession {
    fn teardown(self) {
        self.relay.close();
        self.handle.destroy();
        tracing::info!(owner = %self.owner, "Listen handle destroyed");
    }
}

struct State {
    phase: SessionPhase,
    /// Bumped by every start attempt and every stop.
    generation: u64,
    /// Token of the session being started or running.
    token: Option<String>,
    /// Contexts waiting for the outcome of the start in flight.
    waiters: Vec<Arc<dyn Endpoint>>,
    active: Option<ActiveSession>,
}

fn notify(endpoints: &[Arc<dyn Endpoint>], event: &SessionEvent) {
    for endpoint in endpoints {
        if let Err(e) = endpoint.send(event.clone()) {
            tracing::warn!("Failed to deliver {event:?}: {e}");
        }
    }
}

/// Owns the lifecycle of the single push-listening session.
///
/// At most one session exists. A `start` while one is starting or running
/// only re-announces it; `stop` is valid in every phase and makes any start
/// still in flight discard its result.
pub struct NotificationService<M>
where
    M: MessagingClient,
{
    client: M,
    store: CredentialStore,
    state: Mutex<State>,
    phases: broadcast::Sender<SessionPhase>,
}

impl<M> NotificationService<M>
where
    M: MessagingClient,
{
    /// Create a new idle service.
    #[must_use]
    pub fn new(client: M, store: CredentialStore) -> Self {
        let (phases, _) = broadcast::channel(PHASE_CHANNEL_CAPACITY);
        Self {
            client,
            store,
            state: Mutex::new(State {
                phase: SessionPhase::Idle,
                generation: 0,
                token: None,
                waiters: Vec::new(),
                active: None,
            }),
            phases,
        }
    }

    /// Current phase.
    pub async fn phase(&self) -> SessionPhase {
        self.state.lock().await.phase
    }

    /// Credentials of the running session.
    pub async fn credentials(&self) -> Option<Credentials> {
        self.state
            .lock()
            .await
            .active
            .as_ref()
            .map(|s| s.credentials.clone())
    }

    /// Owner of the running session.
    pub async fn active_owner(&self) -> Option<SessionOwner> {
        self.state
            .lock()
            .await
            .active
            .as_ref()
            .map(|s| s.owner.clone())
    }

    /// Receiver for every phase transition, including transient `Failed`.
    #[must_use]
    pub fn subscribe_phases(&self) -> broadcast::Receiver<SessionPhase> {
        self.phases.subscribe()
    }

    /// Phase transitions as a stream. Lagged receivers skip missed phases.
    #[must_use]
    pub fn phase_stream(&self) -> BoxStream<'static, SessionPhase> {
        BroadcastStream::new(self.subscribe_phases())
            .filter_map(|res| async move { res.ok() })
            .boxed()
    }

    /// Start listening for `owner`, reporting to `endpoint`.
    ///
    /// Registers first when no credentials are stored or the stored sender
    /// identity differs from `config.sender_id`. All outcomes are reported
    /// as events; nothing is returned.
    pub async fn start(
        &self,
        owner: SessionOwner,
        config: BackendConfig,
        endpoint: Arc<dyn Endpoint>,
    ) {
        if let Some(attempt) = self.claim(owner, config, endpoint).await {
            self.complete(attempt).await;
        }
    }

    /// First half of [`start`](Self::start): claim the session.
    ///
    /// Returns `None` when a session is already starting or running. A
    /// running session is re-announced to `endpoint`; a starting one queues
    /// `endpoint` for its outcome, success or error.
    pub async fn claim(
        &self,
        owner: SessionOwner,
        config: BackendConfig,
        endpoint: Arc<dyn Endpoint>,
    ) -> Option<StartAttempt> {
        let mut state = self.state.lock().await;

        if state.phase.is_active() {
            if let (SessionPhase::Listening, Some(token)) = (state.phase, state.token.clone()) {
                tracing::debug!(%owner, "Service already listening, re-announcing token");
                notify(&[endpoint], &SessionEvent::started(token));
            } else {
                tracing::debug!(%owner, "Service starting, queueing context for the outcome");
                state.waiters.push(endpoint);
            }
            return None;
        }

        state.generation += 1;
        state.waiters = vec![endpoint];
        self.transition(&mut state, SessionPhase::Starting);

        tracing::info!(
            %owner,
            generation = state.generation,
            sender_id = %config.sender_id,
            "Starting notification service"
        );
        Some(StartAttempt {
            generation: state.generation,
            owner,
            config,
        })
    }

    /// Second half of [`start`](Self::start): register or reuse, then listen.
    ///
    /// A no-op in effect if `stop` ran since the attempt was claimed.
    pub async fn complete(&self, attempt: StartAttempt) {
        let StartAttempt {
            generation,
            owner,
            config,
        } = attempt;

        if let Err(e) = self.run_start(generation, &owner, &config).await {
            let mut state = self.state.lock().await;
            if state.generation == generation {
                self.fail(&mut state, &e);
            } else {
                tracing::warn!(%owner, generation, "Discarding failure of superseded start: {e}");
            }
        }
    }

    /// Tear down the session, if any, and return to `Idle`.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        state.generation += 1;
        state.token = None;
        state.waiters.clear();

        if let Some(active) = state.active.take() {
            active.teardown();
        }
        self.transition(&mut state, SessionPhase::Idle);
        tracing::info!(generation = state.generation, "Notification service stopped");
    }

    async fn run_start(
        &self,
        generation: u64,
        owner: &SessionOwner,
        config: &BackendConfig,
    ) -> Result<(), StartError> {
        if self.starter(generation).await.is_none() {
            return Ok(());
        }
        let stored = self.store.get_credentials(owner)?;
        let stored_sender = self.store.get_sender_id(owner)?;

        let credentials = match stored {
            Some(credentials) if stored_sender.as_deref() == Some(config.sender_id.as_str()) => {
                let mut state = self.state.lock().await;
                if state.generation != generation {
                    tracing::warn!(%owner, generation, "Start superseded before listening");
                    return Ok(());
                }
                state.token = Some(credentials.token.clone());
                credentials
            }
            _ => {
                tracing::info!(
                    %owner,
                    stored_sender = ?stored_sender,
                    sender_id = %config.sender_id,
                    "Registering with messaging backend"
                );
                let registered = self.client.register(config).await;

                let mut state = self.state.lock().await;
                if state.generation != generation {
                    tracing::warn!(
                        %owner,
                        generation,
                        "Discarding registration of superseded start"
                    );
                    return Ok(());
                }
                let credentials = registered?;
                self.store.put_credentials(owner, &credentials)?;
                self.store.put_sender_id(owner, &config.sender_id)?;

                state.token = Some(credentials.token.clone());
                notify(&state.waiters, &SessionEvent::token_updated(credentials.token.clone()));
                credentials
            }
        };

        let checkpoints = self.store.get_checkpoints(owner)?;
        let Some(endpoint) = self.starter(generation).await else {
            return Ok(());
        };
        let relay = Arc::new(NotificationRelay::new(
            owner.clone(),
            self.store.clone(),
            endpoint,
        ));

        let handler: Arc<dyn DeliveryHandler> = relay.clone();
        let opened = self
            .client
            .listen(&credentials, &checkpoints, handler)
            .await;

        let mut state = self.state.lock().await;
        if state.generation != generation {
            relay.close();
            if let Ok(handle) = opened {
                handle.destroy();
            }
            tracing::warn!(%owner, generation, "Discarding listen handle of superseded start");
            return Ok(());
        }
        let handle = opened?;

        let token = credentials.token.clone();
        state.active = Some(ActiveSession {
            owner: owner.clone(),
            credentials,
            handle,
            relay,
        });
        self.transition(&mut state, SessionPhase::Listening);

        let waiters = std::mem::take(&mut state.waiters);
        notify(&waiters, &SessionEvent::started(token));
        tracing::info!(
            %owner,
            generation,
            checkpoints = checkpoints.len(),
            "Listening for notifications"
        );
        Ok(())
    }

    /// Context that issued the start of `generation`, if still current.
    async fn starter(&self, generation: u64) -> Option<Arc<dyn Endpoint>> {
        let state = self.state.lock().await;
        if state.generation != generation {
            tracing::warn!(generation, "Start superseded before listening");
            return None;
        }
        state.waiters.first().cloned()
    }

    fn fail(&self, state: &mut State, error: &StartError) {
        tracing::error!(generation = state.generation, "Error while starting the service: {error}");
        self.transition(state, SessionPhase::Failed);

        let waiters = std::mem::take(&mut state.waiters);
        notify(&waiters, &SessionEvent::error(error.to_string()));

        state.token = None;
        self.transition(state, SessionPhase::Idle);
    }

    fn transition(&self, state: &mut State, phase: SessionPhase) {
        if state.phase == phase {
            return;
        }
        tracing::debug!(from = ?state.phase, to = ?phase, "Phase transition");
        state.phase = phase;
        let _ = self.phases.send(phase);
    }
}

impl<M> Drop for NotificationService<M>
where
    M: MessagingClient,
{
    fn drop(&mut self) {
        if let Some(active) = self.state.get_mut().active.take() {
            active.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex as StdMutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use push_relay_core::{DeliveryEvent, KeyValueStore, traits::TransportError};
    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;
    use crate::storage::MemoryStore;

    #[derive(Default)]
    struct MockState {
        register_calls: AtomicUsize,
        listen_calls: AtomicUsize,
        destroyed: AtomicUsize,
        register_gate: StdMutex<Option<Arc<Notify>>>,
        listen_gate: StdMutex<Option<Arc<Notify>>>,
        register_error: StdMutex<Option<RegistrationError>>,
        listen_error: StdMutex<Option<ListenError>>,
        handler: StdMutex<Option<Arc<dyn DeliveryHandler>>>,
        checkpoints: StdMutex<Vec<String>>,
    }

    #[derive(Clone, Default)]
    struct MockClient(Arc<MockState>);

    impl MockClient {
        fn registers(&self) -> usize {
            self.0.register_calls.load(Ordering::SeqCst)
        }

        fn listens(&self) -> usize {
            self.0.listen_calls.load(Ordering::SeqCst)
        }

        fn destroyed(&self) -> usize {
            self.0.destroyed.load(Ordering::SeqCst)
        }

        fn gate_register(&self) -> Arc<Notify> {
            let gate = Arc::new(Notify::new());
            *self.0.register_gate.lock().unwrap() = Some(Arc::clone(&gate));
            gate
        }

        fn gate_listen(&self) -> Arc<Notify> {
            let gate = Arc::new(Notify::new());
            *self.0.listen_gate.lock().unwrap() = Some(Arc::clone(&gate));
            gate
        }

        fn deliver(&self, id: &str) {
            let handler = self.0.handler.lock().unwrap().clone().unwrap();
            handler.on_delivery(DeliveryEvent::new(id, json!({ "id": id })));
        }
    }

    struct MockHandle(Arc<MockState>);

    impl ListenHandle for MockHandle {
        fn destroy(self: Box<Self>) {
            self.0.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl MessagingClient for MockClient {
        async fn register(&self, config: &BackendConfig) -> Result<Credentials, RegistrationError> {
            let n = self.0.register_calls.fetch_add(1, Ordering::SeqCst) + 1;
            let gate = self.0.register_gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            if let Some(e) = self.0.register_error.lock().unwrap().take() {
                return Err(e);
            }
            Ok(Credentials::new(format!("token-{n}"), config.sender_id.clone()))
        }

        async fn listen(
            &self,
            _credentials: &Credentials,
            checkpoints: &[String],
            handler: Arc<dyn DeliveryHandler>,
        ) -> Result<Box<dyn ListenHandle>, ListenError> {
            self.0.listen_calls.fetch_add(1, Ordering::SeqCst);
            let gate = self.0.listen_gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            if let Some(e) = self.0.listen_error.lock().unwrap().take() {
                return Err(e);
            }
            *self.0.checkpoints.lock().unwrap() = checkpoints.to_vec();
            *self.0.handler.lock().unwrap() = Some(handler);
            Ok(Box::new(MockHandle(Arc::clone(&self.0))))
        }
    }

    struct RecordingEndpoint {
        alive: AtomicBool,
        events: StdMutex<Vec<SessionEvent>>,
    }

    impl RecordingEndpoint {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                alive: AtomicBool::new(true),
                events: StdMutex::new(Vec::new()),
            })
        }

        fn events(&self) -> Vec<SessionEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl Endpoint for RecordingEndpoint {
        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn send(&self, event: SessionEvent) -> Result<(), TransportError> {
            if !self.is_alive() {
                return Err(TransportError::Unreachable);
            }
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    fn service() -> (MockClient, Arc<MemoryStore>, NotificationService<MockClient>) {
        let client = MockClient::default();
        let kv = Arc::new(MemoryStore::new());
        let store = CredentialStore::new(kv.clone());
        (client.clone(), kv, NotificationService::new(client, store))
    }

    fn seed(kv: &Arc<MemoryStore>, owner: &str, token: &str, sender: &str) {
        let store = CredentialStore::new(kv.clone());
        let owner = SessionOwner::from(owner);
        store
            .put_credentials(&owner, &Credentials::new(token, sender))
            .unwrap();
        store.put_sender_id(&owner, sender).unwrap();
    }

    #[tokio::test]
    async fn test_fresh_owner_registers() {
        let (client, kv, service) = service();
        let endpoint = RecordingEndpoint::new();

        service
            .start("u1".into(), BackendConfig::new("S1"), endpoint.clone())
            .await;

        assert_eq!(
            endpoint.events(),
            vec![
                SessionEvent::token_updated("token-1"),
                SessionEvent::started("token-1"),
            ]
        );
        assert_eq!(service.phase().await, SessionPhase::Listening);
        assert_eq!(client.registers(), 1);
        assert_eq!(kv.get("u1-senderId").unwrap(), Some(json!("S1")));
        assert_eq!(service.active_owner().await, Some(SessionOwner::from("u1")));
    }

    #[tokio::test]
    async fn test_stored_credentials_are_reused() {
        let (client, kv, service) = service();
        seed(&kv, "u1", "stored-token", "S1");
        let endpoint = RecordingEndpoint::new();

        service
            .start("u1".into(), BackendConfig::new("S1"), endpoint.clone())
            .await;

        assert_eq!(endpoint.events(), vec![SessionEvent::started("stored-token")]);
        assert_eq!(client.registers(), 0);
        assert_eq!(client.listens(), 1);
        assert_eq!(
            service.credentials().await.map(|c| c.token),
            Some("stored-token".to_string())
        );
    }

    #[tokio::test]
    async fn test_sender_change_forces_registration() {
        let (client, kv, service) = service();
        seed(&kv, "u1", "old-token", "A");
        let endpoint = RecordingEndpoint::new();

        service
            .start("u1".into(), BackendConfig::new("B"), endpoint.clone())
            .await;
        assert_eq!(client.registers(), 1);
        assert_eq!(kv.get("u1-senderId").unwrap(), Some(json!("B")));

        service.stop().await;
        service
            .start("u1".into(), BackendConfig::new("B"), endpoint.clone())
            .await;
        assert_eq!(client.registers(), 1);
        assert_eq!(
            endpoint.events().last(),
            Some(&SessionEvent::started("token-1"))
        );
    }

    #[tokio::test]
    async fn test_missing_sender_record_forces_registration() {
        let (client, kv, service) = service();
        CredentialStore::new(kv.clone())
            .put_credentials(&"u1".into(), &Credentials::new("orphan", "S1"))
            .unwrap();

        service
            .start("u1".into(), BackendConfig::new("S1"), RecordingEndpoint::new())
            .await;

        assert_eq!(client.registers(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_start_registers_once() {
        let (client, _, service) = service();
        let gate = client.gate_register();
        let (first, second) = (RecordingEndpoint::new(), RecordingEndpoint::new());

        tokio::join!(
            service.start("u1".into(), BackendConfig::new("S1"), first.clone()),
            async {
                assert_eq!(service.phase().await, SessionPhase::Starting);
                service
                    .start("u1".into(), BackendConfig::new("S1"), second.clone())
                    .await;
                gate.notify_one();
            }
        );

        assert_eq!(client.registers(), 1);
        assert_eq!(client.listens(), 1);
        assert_eq!(
            first.events(),
            vec![
                SessionEvent::token_updated("token-1"),
                SessionEvent::started("token-1"),
            ]
        );
        assert_eq!(second.events().last(), Some(&SessionEvent::started("token-1")));
    }

    #[tokio::test]
    async fn test_start_while_listening_reannounces() {
        let (client, _, service) = service();
        let endpoint = RecordingEndpoint::new();
        service
            .start("u1".into(), BackendConfig::new("S1"), endpoint.clone())
            .await;

        let other = RecordingEndpoint::new();
        service
            .start("u1".into(), BackendConfig::new("S2"), other.clone())
            .await;

        assert_eq!(other.events(), vec![SessionEvent::started("token-1")]);
        assert_eq!(client.registers(), 1);
        assert_eq!(client.listens(), 1);
    }

    #[tokio::test]
    async fn test_registration_failure_reports_and_allows_retry() {
        let (client, kv, service) = service();
        *client.0.register_error.lock().unwrap() =
            Some(RegistrationError::Unreachable("timeout".into()));
        let mut phases = service.subscribe_phases();
        let endpoint = RecordingEndpoint::new();

        service
            .start("u1".into(), BackendConfig::new("S1"), endpoint.clone())
            .await;

        assert_eq!(
            endpoint.events(),
            vec![SessionEvent::error("Backend unreachable: timeout")]
        );
        assert_eq!(service.phase().await, SessionPhase::Idle);
        assert_eq!(phases.recv().await.unwrap(), SessionPhase::Starting);
        assert_eq!(phases.recv().await.unwrap(), SessionPhase::Failed);
        assert_eq!(phases.recv().await.unwrap(), SessionPhase::Idle);
        assert_eq!(client.listens(), 0);
        assert_eq!(kv.get("u1-credentials").unwrap(), None);

        service
            .start("u1".into(), BackendConfig::new("S1"), endpoint.clone())
            .await;
        assert_eq!(service.phase().await, SessionPhase::Listening);
        assert_eq!(client.registers(), 2);
    }

    #[tokio::test]
    async fn test_listen_failure_reports_and_releases_guard() {
        let (client, kv, service) = service();
        seed(&kv, "u1", "stored-token", "S1");
        *client.0.listen_error.lock().unwrap() = Some(ListenError::Connect("refused".into()));
        let endpoint = RecordingEndpoint::new();

        service
            .start("u1".into(), BackendConfig::new("S1"), endpoint.clone())
            .await;

        assert_eq!(
            endpoint.events(),
            vec![SessionEvent::error("Failed to open delivery channel: refused")]
        );
        assert_eq!(service.phase().await, SessionPhase::Idle);
        assert!(service.credentials().await.is_none());

        service
            .start("u1".into(), BackendConfig::new("S1"), endpoint.clone())
            .await;
        assert_eq!(service.phase().await, SessionPhase::Listening);
    }

    #[tokio::test]
    async fn test_context_joining_during_listen_hears_failure() {
        let (client, kv, service) = service();
        seed(&kv, "u1", "stored-token", "S1");
        let gate = client.gate_listen();
        *client.0.listen_error.lock().unwrap() = Some(ListenError::Connect("refused".into()));
        let (first, second) = (RecordingEndpoint::new(), RecordingEndpoint::new());

        tokio::join!(
            service.start("u1".into(), BackendConfig::new("S1"), first.clone()),
            async {
                while client.listens() == 0 {
                    tokio::task::yield_now().await;
                }
                service
                    .start("u1".into(), BackendConfig::new("S1"), second.clone())
                    .await;
                gate.notify_one();
            }
        );

        let expected = vec![SessionEvent::error("Failed to open delivery channel: refused")];
        assert_eq!(first.events(), expected);
        assert_eq!(second.events(), expected);
        assert_eq!(service.phase().await, SessionPhase::Idle);
        assert_eq!(client.listens(), 1);
    }

    #[tokio::test]
    async fn test_store_write_failure_reports_and_allows_retry() {
        struct FlakyStore {
            inner: MemoryStore,
            fail_writes: AtomicBool,
        }

        impl KeyValueStore for FlakyStore {
            fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
                self.inner.get(key)
            }

            fn set(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError> {
                if self.fail_writes.load(Ordering::SeqCst) {
                    return Err(StoreError::Internal("disk full".into()));
                }
                self.inner.set(key, value)
            }
        }

        let kv = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            fail_writes: AtomicBool::new(true),
        });
        let client = MockClient::default();
        let store = CredentialStore::new(kv.clone());
        let service = NotificationService::new(client.clone(), store);
        let endpoint = RecordingEndpoint::new();

        service
            .start("u1".into(), BackendConfig::new("S1"), endpoint.clone())
            .await;

        assert_eq!(endpoint.events(), vec![SessionEvent::error("Storage error: disk full")]);
        assert_eq!(service.phase().await, SessionPhase::Idle);
        assert_eq!(client.listens(), 0);

        kv.fail_writes.store(false, Ordering::SeqCst);
        service
            .start("u1".into(), BackendConfig::new("S1"), endpoint.clone())
            .await;
        assert_eq!(service.phase().await, SessionPhase::Listening);
        assert_eq!(kv.get("u1-senderId").unwrap(), Some(json!("S1")));
    }

    #[tokio::test]
    async fn test_stop_during_registration_discards_attempt() {
        let (client, kv, service) = service();
        let gate = client.gate_register();
        let endpoint = RecordingEndpoint::new();

        tokio::join!(
            service.start("u1".into(), BackendConfig::new("S1"), endpoint.clone()),
            async {
                service.stop().await;
                gate.notify_one();
            }
        );

        assert_eq!(service.phase().await, SessionPhase::Idle);
        assert_eq!(client.registers(), 1);
        assert_eq!(client.listens(), 0);
        assert!(endpoint.events().is_empty());
        assert_eq!(kv.get("u1-credentials").unwrap(), None);
    }

    #[tokio::test]
    async fn test_stop_during_listen_destroys_late_handle() {
        let (client, kv, service) = service();
        seed(&kv, "u1", "stored-token", "S1");
        let gate = client.gate_listen();
        let endpoint = RecordingEndpoint::new();

        tokio::join!(
            service.start("u1".into(), BackendConfig::new("S1"), endpoint.clone()),
            async {
                service.stop().await;
                gate.notify_one();
            }
        );

        assert_eq!(service.phase().await, SessionPhase::Idle);
        assert_eq!(client.listens(), 1);
        assert_eq!(client.destroyed(), 1);
        assert!(service.credentials().await.is_none());
        assert!(endpoint.events().is_empty());

        client.deliver("late");
        assert!(
            CredentialStore::new(kv.clone())
                .get_checkpoints(&"u1".into())
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_completing_stale_claim_is_a_noop() {
        let (client, _, service) = service();
        let endpoint = RecordingEndpoint::new();

        let attempt = service
            .claim("u1".into(), BackendConfig::new("S1"), endpoint.clone())
            .await
            .unwrap();
        assert_eq!(attempt.generation(), 1);
        assert_eq!(attempt.owner(), &SessionOwner::from("u1"));

        service.stop().await;
        service.complete(attempt).await;

        assert_eq!(service.phase().await, SessionPhase::Idle);
        assert_eq!(client.registers(), 0);
        assert_eq!(client.listens(), 0);
        assert!(endpoint.events().is_empty());
    }

    #[tokio::test]
    async fn test_stop_destroys_handle_and_is_idempotent() {
        let (client, _, service) = service();
        service
            .start("u1".into(), BackendConfig::new("S1"), RecordingEndpoint::new())
            .await;

        service.stop().await;
        service.stop().await;

        assert_eq!(client.destroyed(), 1);
        assert_eq!(service.phase().await, SessionPhase::Idle);
        assert!(service.active_owner().await.is_none());
    }

    #[tokio::test]
    async fn test_deliveries_are_checkpointed_in_order() {
        let (client, kv, service) = service();
        let endpoint = RecordingEndpoint::new();
        service
            .start("u1".into(), BackendConfig::new("S1"), endpoint.clone())
            .await;

        for id in ["d1", "d2", "d3"] {
            client.deliver(id);
        }

        let store = CredentialStore::new(kv.clone());
        assert_eq!(store.get_checkpoints(&"u1".into()).unwrap(), ["d1", "d2", "d3"]);
        let notifications: Vec<_> = endpoint.events().into_iter().skip(2).collect();
        assert_eq!(
            notifications,
            ["d1", "d2", "d3"]
                .map(|id| SessionEvent::notification(json!({ "id": id })))
                .to_vec()
        );

        service.stop().await;
        service
            .start("u1".into(), BackendConfig::new("S1"), endpoint.clone())
            .await;
        assert_eq!(*client.0.checkpoints.lock().unwrap(), ["d1", "d2", "d3"]);
    }

    #[tokio::test]
    async fn test_dead_endpoint_keeps_session_listening() {
        let (client, kv, service) = service();
        let endpoint = RecordingEndpoint::new();
        service
            .start("u1".into(), BackendConfig::new("S1"), endpoint.clone())
            .await;

        endpoint.alive.store(false, Ordering::SeqCst);
        client.deliver("d1");

        assert_eq!(service.phase().await, SessionPhase::Listening);
        assert_eq!(
            CredentialStore::new(kv.clone())
                .get_checkpoints(&"u1".into())
                .unwrap(),
            ["d1"]
        );
        assert_eq!(endpoint.events().len(), 2);
    }

    #[tokio::test]
    async fn test_phase_stream_reports_transitions() {
        let (_, _, service) = service();
        let mut stream = service.phase_stream();

        service
            .start("u1".into(), BackendConfig::new("S1"), RecordingEndpoint::new())
            .await;
        service.stop().await;

        assert_eq!(stream.next().await, Some(SessionPhase::Starting));
        assert_eq!(stream.next().await, Some(SessionPhase::Listening));
        assert_eq!(stream.next().await, Some(SessionPhase::Idle));
    }

    #[tokio::test]
    async fn test_drop_destroys_active_handle() {
        let (client, _, service) = service();
        service
            .start("u1".into(), BackendConfig::new("S1"), RecordingEndpoint::new())
            .await;

        drop(service);

        assert_eq!(client.destroyed(), 1);
    }
}
