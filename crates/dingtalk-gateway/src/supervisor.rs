//! Connection supervisor.
//!
//! Owns the single stream connection a gateway process holds. Each successful
//! [`ConnectionSupervisor::start`] records one session and spawns a task that
//! exclusively owns the transport handle. The task is the only place a session
//! is torn down, so teardown runs once no matter how many of {caller
//! cancellation, [`ConnectionSupervisor::stop`], transport failure} fire.
//!
//! ```text
//!  Idle ──start──▶ Starting ──connected──▶ Active
//!   ▲                  │                     │
//!   │                  └──────┬──────────────┘
//!   │                 cancel / stop / error / end of stream
//!   │                         ▼
//!   └───── cleared ◀──── Stopping (disconnect, drain dispatches)
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use dingtalk_gateway_protocol::BOT_MESSAGE_TOPIC;

use crate::config::GatewayConfig;
use crate::dedup::{DedupSizes, Deduplicator};
use crate::dispatch::MessageProcessor;
use crate::error::{GatewayError, TransportError};
use crate::ingest::{IngestCounts, IngestHandler, IngestStats, SessionScope};
use crate::transport::{Connector, StreamConnection};

/// How long teardown waits for in-flight dispatches.
const DISPATCH_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Public types
// ============================================================================

/// Lifecycle phase of the supervised connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Starting,
    Active,
    Stopping,
}

/// Why a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The caller's cancellation token fired.
    Cancelled,
    /// [`ConnectionSupervisor::stop`] was called.
    Stopped,
    /// The transport reached a clean end of stream.
    Closed,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShutdownReason::Cancelled => "cancelled",
            ShutdownReason::Stopped => "stopped",
            ShutdownReason::Closed => "closed",
        };
        f.write_str(s)
    }
}

pub type SessionResult = Result<ShutdownReason, TransportError>;

/// Resolves once when a session is torn down. Clones observe the same session.
#[derive(Debug, Clone)]
pub struct Completion {
    session_id: String,
    rx: watch::Receiver<Option<SessionResult>>,
}

impl Completion {
    fn pending(session_id: String) -> (watch::Sender<Option<SessionResult>>, Self) {
        let (tx, rx) = watch::channel(None);
        (tx, Self { session_id, rx })
    }

    fn resolved(session_id: String, result: SessionResult) -> Self {
        let (tx, completion) = Self::pending(session_id);
        tx.send_replace(Some(result));
        completion
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_finished(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// The result, if the session has already ended.
    pub fn try_result(&self) -> Option<SessionResult> {
        self.rx.borrow().clone()
    }

    /// Wait for the session to end.
    pub async fn wait(&self) -> SessionResult {
        let mut rx = self.rx.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(result) => result.clone().unwrap_or(Ok(ShutdownReason::Closed)),
            // The sender only drops unsent if the session task panicked.
            Err(_) => Err(TransportError::Closed(
                "session task ended without reporting".to_string(),
            )),
        }
    }
}

impl PartialEq for Completion {
    fn eq(&self, other: &Self) -> bool {
        self.session_id == other.session_id
    }
}

/// Diagnostics snapshot.
#[derive(Debug, Clone)]
pub struct SupervisorStatus {
    pub state: ConnectionState,
    pub account_id: Option<String>,
    pub session_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ingest: IngestCounts,
    pub dedup: DedupSizes,
}

// ============================================================================
// Session bookkeeping
// ============================================================================

struct ActiveSession {
    id: String,
    account_id: String,
    phase: ConnectionState,
    token: CancellationToken,
    completion: Completion,
    started_at: DateTime<Utc>,
}

type SessionSlot = Arc<Mutex<Option<ActiveSession>>>;

fn lock_slot(slot: &SessionSlot) -> MutexGuard<'_, Option<ActiveSession>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Set the phase of session `id`, if it is still the recorded one.
fn set_phase(slot: &SessionSlot, id: &str, phase: ConnectionState) {
    if let Some(session) = lock_slot(slot).as_mut()
        && session.id == id
    {
        session.phase = phase;
    }
}

/// Clears the slot when the session task exits, including by panic.
///
/// A newer session may already occupy the slot; it is left alone.
struct SlotGuard {
    slot: SessionSlot,
    id: String,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut slot = lock_slot(&self.slot);
        if slot.as_ref().is_some_and(|s| s.id == self.id) {
            *slot = None;
        }
    }
}

// ============================================================================
// ConnectionSupervisor
// ============================================================================

pub struct ConnectionSupervisor {
    config: Arc<GatewayConfig>,
    connector: Arc<dyn Connector>,
    processor: Arc<dyn MessageProcessor>,
    dedup: Arc<Deduplicator>,
    stats: Arc<IngestStats>,
    session: SessionSlot,
}

impl ConnectionSupervisor {
    pub fn new(
        config: GatewayConfig,
        connector: Arc<dyn Connector>,
        processor: Arc<dyn MessageProcessor>,
    ) -> Self {
        let dedup = Arc::new(Deduplicator::new(&config.dedup));
        Self {
            config: Arc::new(config),
            connector,
            processor,
            dedup,
            stats: Arc::new(IngestStats::default()),
            session: Arc::new(Mutex::new(None)),
        }
    }

    /// Start monitoring `account_id`.
    ///
    /// Returns a [`Completion`] that resolves when the connection is torn down
    /// and its in-flight dispatches have finished. Starting an account that is
    /// already connected joins the existing session. Must be called from within
    /// a Tokio runtime.
    ///
    /// The connection is built without holding the session lock, so a slow
    /// [`Connector`] does not block [`stop`](Self::stop) or
    /// [`status`](Self::status). If another start records a session first, the
    /// unopened connection is dropped and this call joins or conflicts with it.
    pub fn start(
        &self,
        account_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Completion, GatewayError> {
        let account = self
            .config
            .account(account_id)
            .ok_or_else(|| GatewayError::MissingAccount {
                account_id: account_id.to_string(),
            })?;
        if !account.enabled {
            return Err(GatewayError::AccountDisabled {
                account_id: account_id.to_string(),
            });
        }
        let runtime = Handle::try_current().map_err(|_| GatewayError::NoRuntime)?;

        if let Some(existing) = join_existing(lock_slot(&self.session).as_ref(), account_id)? {
            return Ok(existing);
        }

        let session_id = generate_session_id();
        if cancel.is_cancelled() {
            info!(account = %account_id, "Cancelled before start, not connecting");
            return Ok(Completion::resolved(
                session_id,
                Ok(ShutdownReason::Cancelled),
            ));
        }

        let mut connection = self.connector.build(account_id, account)?;

        let token = cancel.child_token();
        let scope = SessionScope::new(runtime.clone(), token.clone());
        let tasks = scope.tasks.clone();
        let handler = IngestHandler::new(
            account_id,
            Arc::new(account.clone()),
            self.dedup.clone(),
            self.processor.clone(),
            scope,
            self.stats.clone(),
        );
        connection.register_callback(BOT_MESSAGE_TOPIC, Arc::new(handler).into_callback());

        let mut slot = lock_slot(&self.session);
        if let Some(existing) = join_existing(slot.as_ref(), account_id)? {
            debug!(account = %account_id, "Lost start race, dropping unopened connection");
            return Ok(existing);
        }

        let (tx, completion) = Completion::pending(session_id.clone());
        *slot = Some(ActiveSession {
            id: session_id.clone(),
            account_id: account_id.to_string(),
            phase: ConnectionState::Starting,
            token: token.clone(),
            completion: completion.clone(),
            started_at: Utc::now(),
        });
        drop(slot);

        info!(account = %account_id, session = %session_id, "Starting stream connection");

        runtime.spawn(run_session(SessionTask {
            id: session_id,
            account_id: account_id.to_string(),
            connection,
            token,
            cancel: cancel.clone(),
            tasks,
            slot: self.session.clone(),
            tx,
        }));

        Ok(completion)
    }

    /// Request shutdown of the active session. Returns `false` if there was none.
    pub fn stop(&self) -> bool {
        let mut slot = lock_slot(&self.session);
        match slot.as_mut() {
            Some(session) => {
                if session.phase != ConnectionState::Stopping {
                    info!(account = %session.account_id, session = %session.id, "Stopping stream connection");
                    session.phase = ConnectionState::Stopping;
                }
                session.token.cancel();
                true
            }
            None => {
                debug!("Stop requested with no active connection");
                false
            }
        }
    }

    /// Stop the active session and wait for teardown to finish.
    pub async fn shutdown(&self) -> Option<SessionResult> {
        let completion = lock_slot(&self.session)
            .as_ref()
            .map(|s| s.completion.clone());
        self.stop();
        match completion {
            Some(completion) => Some(completion.wait().await),
            None => None,
        }
    }

    pub fn is_active(&self) -> bool {
        lock_slot(&self.session).is_some()
    }

    pub fn current_account_id(&self) -> Option<String> {
        lock_slot(&self.session)
            .as_ref()
            .map(|s| s.account_id.clone())
    }

    pub fn state(&self) -> ConnectionState {
        lock_slot(&self.session)
            .as_ref()
            .map_or(ConnectionState::Idle, |s| s.phase)
    }

    pub fn status(&self) -> SupervisorStatus {
        let slot = lock_slot(&self.session);
        SupervisorStatus {
            state: slot.as_ref().map_or(ConnectionState::Idle, |s| s.phase),
            account_id: slot.as_ref().map(|s| s.account_id.clone()),
            session_id: slot.as_ref().map(|s| s.id.clone()),
            started_at: slot.as_ref().map(|s| s.started_at),
            ingest: self.stats.snapshot(),
            dedup: self.dedup.sizes(),
        }
    }

    /// Empty both dedup caches. The connection is unaffected.
    pub fn clear_dedup_state(&self) {
        self.dedup.clear();
        info!("Cleared dedup state");
    }
}

// ============================================================================
// Session task
// ============================================================================

struct SessionTask {
    id: String,
    account_id: String,
    connection: Box<dyn StreamConnection>,
    /// Session token: fires on stop or caller cancellation.
    token: CancellationToken,
    /// The caller's token, to tell cancellation apart from stop.
    cancel: CancellationToken,
    /// Dispatches spawned by the session's ingest handler.
    tasks: TaskTracker,
    slot: SessionSlot,
    tx: watch::Sender<Option<SessionResult>>,
}

enum Exit {
    Cancelled,
    Closed,
}

async fn run_session(task: SessionTask) {
    let SessionTask {
        id,
        account_id,
        mut connection,
        token,
        cancel,
        tasks,
        slot,
        tx,
    } = task;
    let guard = SlotGuard {
        slot: slot.clone(),
        id: id.clone(),
    };

    let exit = tokio::select! {
        _ = token.cancelled() => Ok(Exit::Cancelled),
        result = async {
            connection.connect().await?;
            set_phase(&slot, &id, ConnectionState::Active);
            info!(account = %account_id, session = %id, "Stream connection established");
            connection.closed().await
        } => result.map(|()| Exit::Closed),
    };

    let result: SessionResult = match exit {
        Ok(Exit::Cancelled) if cancel.is_cancelled() => Ok(ShutdownReason::Cancelled),
        Ok(Exit::Cancelled) => Ok(ShutdownReason::Stopped),
        Ok(Exit::Closed) => Ok(ShutdownReason::Closed),
        Err(e) => {
            warn!(account = %account_id, session = %id, error = %e, "Stream connection failed");
            Err(e)
        }
    };

    // Stop accepting events before the handle goes away.
    set_phase(&slot, &id, ConnectionState::Stopping);
    token.cancel();

    if let Err(e) = connection.disconnect().await {
        warn!(account = %account_id, session = %id, error = %e, "Disconnect failed");
    }
    drop(connection);

    // Let processing of already accepted messages finish before reporting.
    tasks.close();
    if !tasks.is_empty() {
        debug!(account = %account_id, session = %id, in_flight = tasks.len(), "Waiting for dispatches");
    }
    if tokio::time::timeout(DISPATCH_DRAIN_TIMEOUT, tasks.wait())
        .await
        .is_err()
    {
        warn!(
            account = %account_id,
            session = %id,
            in_flight = tasks.len(),
            "Dispatches still running after drain timeout"
        );
    }
    drop(guard);

    match &result {
        Ok(reason) => {
            info!(account = %account_id, session = %id, %reason, "Stream connection closed")
        }
        Err(_) => info!(account = %account_id, session = %id, "Stream connection torn down"),
    }
    tx.send_replace(Some(result));
}

/// The completion to join, or a conflict, if a session is already recorded.
fn join_existing(
    active: Option<&ActiveSession>,
    account_id: &str,
) -> Result<Option<Completion>, GatewayError> {
    let Some(active) = active else {
        return Ok(None);
    };
    if active.account_id != account_id {
        return Err(GatewayError::Conflict {
            active: active.account_id.clone(),
            requested: account_id.to_string(),
        });
    }
    debug!(account = %account_id, session = %active.id, "Joining existing session");
    Ok(Some(active.completion.clone()))
}

/// Generate a unique session ID.
fn generate_session_id() -> String {
    ulid::Ulid::new().to_string().to_lowercase()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::{Notify, mpsc, oneshot};

    use dingtalk_gateway_protocol::GatewayEvent;

    use super::*;
    use crate::config::{AccountConfig, DedupConfig};
    use crate::dispatch::{DispatchRequest, JsonLinesForwarder};
    use crate::transport::{Delivery, EventCallback, JsonLinesConnection};

    // ------------------------------------------------------------------------
    // Mocks
    // ------------------------------------------------------------------------

    #[derive(Default)]
    struct Spy {
        builds: AtomicUsize,
        connects: AtomicUsize,
        disconnects: AtomicUsize,
        callback: Mutex<Option<EventCallback>>,
        close_tx: Mutex<Option<oneshot::Sender<Result<(), TransportError>>>>,
    }

    impl Spy {
        fn deliver(&self, id: &str, sender: &str, text: &str) -> bool {
            let callback = self.callback.lock().unwrap().clone().expect("no callback");
            let ack = callback(Delivery {
                topic: BOT_MESSAGE_TOPIC.to_string(),
                message_id: Some(id.to_string()),
                data: json!({
                    "msgtype": "text",
                    "text": { "content": text },
                    "senderId": sender,
                    "conversationId": "cid-1",
                })
                .to_string(),
            });
            ack.is_success()
        }

        fn close_with(&self, result: Result<(), TransportError>) {
            let tx = self.close_tx.lock().unwrap().take().expect("not connected");
            let _ = tx.send(result);
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Behavior {
        Ok,
        FailBuild,
        FailConnect,
        FailDisconnect,
    }

    struct MockConnector {
        spy: Arc<Spy>,
        behavior: Behavior,
    }

    impl Connector for MockConnector {
        fn build(
            &self,
            _account_id: &str,
            _account: &AccountConfig,
        ) -> Result<Box<dyn StreamConnection>, TransportError> {
            self.spy.builds.fetch_add(1, Ordering::SeqCst);
            if self.behavior == Behavior::FailBuild {
                return Err(TransportError::Construct("bad credentials".to_string()));
            }
            let (close_tx, close_rx) = oneshot::channel();
            *self.spy.close_tx.lock().unwrap() = Some(close_tx);
            Ok(Box::new(MockConnection {
                spy: self.spy.clone(),
                behavior: self.behavior,
                close_rx: Some(close_rx),
            }))
        }
    }

    struct MockConnection {
        spy: Arc<Spy>,
        behavior: Behavior,
        close_rx: Option<oneshot::Receiver<Result<(), TransportError>>>,
    }

    #[async_trait]
    impl StreamConnection for MockConnection {
        fn register_callback(&mut self, _topic: &str, callback: EventCallback) {
            *self.spy.callback.lock().unwrap() = Some(callback);
        }

        async fn connect(&mut self) -> Result<(), TransportError> {
            self.spy.connects.fetch_add(1, Ordering::SeqCst);
            if self.behavior == Behavior::FailConnect {
                return Err(TransportError::Connect("refused".to_string()));
            }
            Ok(())
        }

        async fn closed(&mut self) -> Result<(), TransportError> {
            // A dropped sender means a later build replaced it; stay open.
            match self.close_rx.take() {
                Some(rx) => match rx.await {
                    Ok(result) => result,
                    Err(_) => std::future::pending().await,
                },
                None => std::future::pending().await,
            }
        }

        async fn disconnect(&mut self) -> Result<(), TransportError> {
            self.spy.disconnects.fetch_add(1, Ordering::SeqCst);
            if self.behavior == Behavior::FailDisconnect {
                return Err(TransportError::Disconnect("socket already gone".to_string()));
            }
            Ok(())
        }
    }

    struct Recorder {
        tx: mpsc::UnboundedSender<DispatchRequest>,
    }

    #[async_trait]
    impl MessageProcessor for Recorder {
        async fn process(&self, request: DispatchRequest) -> anyhow::Result<()> {
            self.tx.send(request)?;
            Ok(())
        }
    }

    /// Blocks the first build until released.
    struct GatedConnector {
        entered: Arc<Notify>,
        gate: Mutex<Option<std_mpsc::Receiver<()>>>,
        inner: MockConnector,
    }

    impl Connector for GatedConnector {
        fn build(
            &self,
            account_id: &str,
            account: &AccountConfig,
        ) -> Result<Box<dyn StreamConnection>, TransportError> {
            let gate = self.gate.lock().unwrap().take();
            if let Some(gate) = gate {
                self.entered.notify_one();
                let _ = gate.recv();
            }
            self.inner.build(account_id, account)
        }
    }

    /// Serves a fixed JSON Lines input, once.
    struct FrameConnector {
        input: Mutex<Option<Vec<u8>>>,
    }

    impl Connector for FrameConnector {
        fn build(
            &self,
            _account_id: &str,
            _account: &AccountConfig,
        ) -> Result<Box<dyn StreamConnection>, TransportError> {
            let input = self
                .input
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| TransportError::Construct("input consumed".to_string()))?;
            Ok(Box::new(JsonLinesConnection::new(Cursor::new(input))))
        }
    }

    /// Forwards after a short delay, so dispatches outlive the input.
    struct SlowForwarder(Arc<JsonLinesForwarder<Vec<u8>>>);

    #[async_trait]
    impl MessageProcessor for SlowForwarder {
        async fn process(&self, request: DispatchRequest) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.0.process(request).await
        }
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn account(enabled: bool) -> AccountConfig {
        AccountConfig {
            client_id: "ding-app".to_string(),
            client_secret: "secret".to_string(),
            robot_code: None,
            enabled,
        }
    }

    fn config() -> GatewayConfig {
        GatewayConfig {
            accounts: HashMap::from([
                ("default".to_string(), account(true)),
                ("ops".to_string(), account(true)),
                ("off".to_string(), account(false)),
            ]),
            dedup: DedupConfig::default(),
        }
    }

    struct Fixture {
        supervisor: ConnectionSupervisor,
        spy: Arc<Spy>,
        dispatched: mpsc::UnboundedReceiver<DispatchRequest>,
    }

    fn fixture(behavior: Behavior) -> Fixture {
        let spy = Arc::new(Spy::default());
        let (tx, dispatched) = mpsc::unbounded_channel();
        let supervisor = ConnectionSupervisor::new(
            config(),
            Arc::new(MockConnector {
                spy: spy.clone(),
                behavior,
            }),
            Arc::new(Recorder { tx }),
        );
        Fixture {
            supervisor,
            spy,
            dispatched,
        }
    }

    async fn wait_for_state(supervisor: &ConnectionSupervisor, state: ConnectionState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while supervisor.state() != state {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("state never reached");
    }

    async fn finish(completion: &Completion) -> SessionResult {
        tokio::time::timeout(Duration::from_secs(5), completion.wait())
            .await
            .expect("completion never resolved")
    }

    // ------------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn missing_account_fails_without_connecting() {
        let f = fixture(Behavior::Ok);
        let result = f.supervisor.start("nobody", &CancellationToken::new());

        assert!(matches!(result, Err(GatewayError::MissingAccount { .. })));
        assert_eq!(f.spy.builds.load(Ordering::SeqCst), 0);
        assert!(!f.supervisor.is_active());
    }

    #[tokio::test]
    async fn disabled_account_is_rejected() {
        let f = fixture(Behavior::Ok);
        let result = f.supervisor.start("off", &CancellationToken::new());

        assert!(matches!(result, Err(GatewayError::AccountDisabled { .. })));
        assert_eq!(f.spy.builds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn same_account_joins_existing_session() {
        let f = fixture(Behavior::Ok);
        let cancel = CancellationToken::new();

        let first = f.supervisor.start("default", &cancel).unwrap();
        let second = f.supervisor.start("default", &cancel).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.session_id(), second.session_id());
        assert_eq!(f.spy.builds.load(Ordering::SeqCst), 1);

        cancel.cancel();
        assert_eq!(finish(&second).await, Ok(ShutdownReason::Cancelled));
    }

    #[tokio::test]
    async fn different_account_conflicts() {
        let f = fixture(Behavior::Ok);
        let cancel = CancellationToken::new();
        let completion = f.supervisor.start("default", &cancel).unwrap();
        wait_for_state(&f.supervisor, ConnectionState::Active).await;

        let result = f.supervisor.start("ops", &cancel);
        match result {
            Err(GatewayError::Conflict { active, requested }) => {
                assert_eq!(active, "default");
                assert_eq!(requested, "ops");
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        assert_eq!(f.supervisor.state(), ConnectionState::Active);
        assert_eq!(f.supervisor.current_account_id().as_deref(), Some("default"));
        assert!(!completion.is_finished());
        assert_eq!(f.spy.builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_resolves_once_and_disconnects() {
        let f = fixture(Behavior::Ok);
        let cancel = CancellationToken::new();
        let completion = f.supervisor.start("default", &cancel).unwrap();
        wait_for_state(&f.supervisor, ConnectionState::Active).await;

        cancel.cancel();
        cancel.cancel();
        f.supervisor.stop();

        assert_eq!(finish(&completion).await, Ok(ShutdownReason::Cancelled));
        assert!(!f.supervisor.is_active());
        assert_eq!(f.supervisor.state(), ConnectionState::Idle);
        assert_eq!(f.supervisor.current_account_id(), None);
        assert_eq!(f.spy.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_tears_down_session() {
        let f = fixture(Behavior::Ok);
        let cancel = CancellationToken::new();
        let completion = f.supervisor.start("default", &cancel).unwrap();
        wait_for_state(&f.supervisor, ConnectionState::Active).await;

        assert!(f.supervisor.stop());
        assert_eq!(finish(&completion).await, Ok(ShutdownReason::Stopped));
        assert!(!f.supervisor.is_active());
        assert!(!cancel.is_cancelled());
        assert_eq!(f.spy.disconnects.load(Ordering::SeqCst), 1);

        // Nothing left to stop.
        assert!(!f.supervisor.stop());
    }

    #[tokio::test]
    async fn stop_when_idle_is_noop() {
        let f = fixture(Behavior::Ok);
        assert!(!f.supervisor.stop());
        assert_eq!(f.supervisor.shutdown().await, None);
        assert_eq!(f.supervisor.state(), ConnectionState::Idle);
        assert_eq!(f.spy.disconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn shutdown_waits_for_teardown() {
        let f = fixture(Behavior::Ok);
        f.supervisor
            .start("default", &CancellationToken::new())
            .unwrap();
        wait_for_state(&f.supervisor, ConnectionState::Active).await;

        assert_eq!(
            f.supervisor.shutdown().await,
            Some(Ok(ShutdownReason::Stopped))
        );
        assert!(!f.supervisor.is_active());
    }

    #[tokio::test]
    async fn pre_cancelled_token_skips_connecting() {
        let f = fixture(Behavior::Ok);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let completion = f.supervisor.start("default", &cancel).unwrap();
        assert_eq!(
            completion.try_result(),
            Some(Ok(ShutdownReason::Cancelled))
        );
        assert_eq!(finish(&completion).await, Ok(ShutdownReason::Cancelled));
        assert_eq!(f.spy.builds.load(Ordering::SeqCst), 0);
        assert!(!f.supervisor.is_active());
    }

    #[tokio::test]
    async fn construction_failure_records_nothing() {
        let f = fixture(Behavior::FailBuild);
        let result = f.supervisor.start("default", &CancellationToken::new());

        assert!(matches!(
            result,
            Err(GatewayError::Transport(TransportError::Construct(_)))
        ));
        assert!(!f.supervisor.is_active());
        assert_eq!(f.spy.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn connect_failure_rejects_completion_and_cleans_up() {
        let f = fixture(Behavior::FailConnect);
        let completion = f
            .supervisor
            .start("default", &CancellationToken::new())
            .unwrap();

        assert_eq!(
            finish(&completion).await,
            Err(TransportError::Connect("refused".to_string()))
        );
        assert!(!f.supervisor.is_active());
        assert_eq!(f.spy.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transport_end_resolves_completion() {
        let f = fixture(Behavior::Ok);
        let completion = f
            .supervisor
            .start("default", &CancellationToken::new())
            .unwrap();
        wait_for_state(&f.supervisor, ConnectionState::Active).await;

        f.spy.close_with(Ok(()));
        assert_eq!(finish(&completion).await, Ok(ShutdownReason::Closed));
        assert!(!f.supervisor.is_active());
    }

    #[tokio::test]
    async fn transport_failure_rejects_completion() {
        let f = fixture(Behavior::Ok);
        let completion = f
            .supervisor
            .start("default", &CancellationToken::new())
            .unwrap();
        wait_for_state(&f.supervisor, ConnectionState::Active).await;

        f.spy
            .close_with(Err(TransportError::Closed("heartbeat lost".to_string())));
        assert!(matches!(
            finish(&completion).await,
            Err(TransportError::Closed(_))
        ));
        assert_eq!(f.spy.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disconnect_failure_still_resolves() {
        let f = fixture(Behavior::FailDisconnect);
        let completion = f
            .supervisor
            .start("default", &CancellationToken::new())
            .unwrap();
        wait_for_state(&f.supervisor, ConnectionState::Active).await;

        f.supervisor.stop();
        assert_eq!(finish(&completion).await, Ok(ShutdownReason::Stopped));
        assert!(!f.supervisor.is_active());
    }

    #[tokio::test]
    async fn restart_after_stop_opens_new_session() {
        let f = fixture(Behavior::Ok);
        let cancel = CancellationToken::new();
        let first = f.supervisor.start("default", &cancel).unwrap();
        wait_for_state(&f.supervisor, ConnectionState::Active).await;
        f.supervisor.stop();
        finish(&first).await.unwrap();

        let second = f.supervisor.start("ops", &cancel).unwrap();
        assert_ne!(first, second);
        assert_eq!(f.supervisor.current_account_id().as_deref(), Some("ops"));
        assert_eq!(f.spy.builds.load(Ordering::SeqCst), 2);

        cancel.cancel();
        assert_eq!(finish(&second).await, Ok(ShutdownReason::Cancelled));
    }

    #[tokio::test]
    async fn events_flow_through_dedup_to_processor() {
        let mut f = fixture(Behavior::Ok);
        let cancel = CancellationToken::new();
        let completion = f.supervisor.start("default", &cancel).unwrap();
        wait_for_state(&f.supervisor, ConnectionState::Active).await;

        assert!(f.spy.deliver("m1", "alice", "hello"));
        assert!(f.spy.deliver("m1", "alice", "hello"));
        assert!(f.spy.deliver("m2", "alice", "hello"));
        assert!(f.spy.deliver("m3", "bob", "hello"));

        let first = f.dispatched.recv().await.unwrap();
        let second = f.dispatched.recv().await.unwrap();
        assert_eq!(first.message.message_id.as_deref(), Some("m1"));
        assert_eq!(second.message.sender_id, "bob");

        let status = f.supervisor.status();
        assert_eq!(status.state, ConnectionState::Active);
        assert_eq!(status.account_id.as_deref(), Some("default"));
        assert_eq!(status.session_id.as_deref(), Some(completion.session_id()));
        assert_eq!(status.ingest.received, 4);
        assert_eq!(status.ingest.duplicates, 2);
        assert_eq!(status.ingest.dispatched, 2);

        // Reset keeps the connection up and lets the same id through again.
        f.supervisor.clear_dedup_state();
        assert_eq!(f.supervisor.status().dedup.identity, 0);
        assert!(f.spy.deliver("m1", "alice", "hello"));
        assert_eq!(
            f.dispatched.recv().await.unwrap().message.message_id.as_deref(),
            Some("m1")
        );
        assert!(f.supervisor.is_active());

        cancel.cancel();
        finish(&completion).await.unwrap();

        // Late deliveries after teardown are acked and dropped.
        assert!(f.spy.deliver("m9", "carol", "late"));
        assert_eq!(f.supervisor.status().ingest.dropped, 1);
    }

    #[test]
    fn start_outside_runtime_fails() {
        let f = fixture(Behavior::Ok);
        let result = f.supervisor.start("default", &CancellationToken::new());
        assert!(matches!(result, Err(GatewayError::NoRuntime)));
        assert_eq!(f.spy.builds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn end_of_stream_waits_for_in_flight_dispatches() {
        const FRAMES: usize = 200;
        let mut input = String::new();
        for i in 0..FRAMES {
            let data = json!({
                "msgtype": "text",
                "text": { "content": format!("message {i}") },
                "senderId": "alice",
                "conversationId": "cid-1",
            });
            let frame = json!({
                "type": "CALLBACK",
                "headers": { "topic": BOT_MESSAGE_TOPIC, "messageId": format!("m{i}") },
                "data": data.to_string(),
            });
            input.push_str(&frame.to_string());
            input.push('\n');
        }

        let forwarder = Arc::new(JsonLinesForwarder::new(Vec::new()));
        let supervisor = ConnectionSupervisor::new(
            config(),
            Arc::new(FrameConnector {
                input: Mutex::new(Some(input.into_bytes())),
            }),
            Arc::new(SlowForwarder(forwarder.clone())),
        );

        let completion = supervisor
            .start("default", &CancellationToken::new())
            .unwrap();
        assert_eq!(finish(&completion).await, Ok(ShutdownReason::Closed));
        forwarder
            .emit(&GatewayEvent::Disconnected {
                account_id: "default".to_string(),
                reason: ShutdownReason::Closed.to_string(),
            })
            .await
            .unwrap();

        assert_eq!(supervisor.status().ingest.dispatched, FRAMES as u64);
        drop(supervisor);
        let output = Arc::try_unwrap(forwarder)
            .ok()
            .expect("forwarder still shared")
            .into_inner();
        let kinds: Vec<String> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| {
                let event: serde_json::Value = serde_json::from_str(l).unwrap();
                event["type"].as_str().unwrap().to_string()
            })
            .collect();

        assert_eq!(kinds.len(), FRAMES + 1);
        assert!(kinds[..FRAMES].iter().all(|k| k == "message_received"));
        assert_eq!(kinds[FRAMES], "disconnected");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_build_does_not_hold_session_lock() {
        let entered = Arc::new(Notify::new());
        let (release, gate) = std_mpsc::channel();
        let spy = Arc::new(Spy::default());
        let (tx, _dispatched) = mpsc::unbounded_channel();
        let supervisor = Arc::new(ConnectionSupervisor::new(
            config(),
            Arc::new(GatedConnector {
                entered: entered.clone(),
                gate: Mutex::new(Some(gate)),
                inner: MockConnector {
                    spy: spy.clone(),
                    behavior: Behavior::Ok,
                },
            }),
            Arc::new(Recorder { tx }),
        ));

        let slow_start = {
            let supervisor = supervisor.clone();
            tokio::task::spawn_blocking(move || {
                supervisor.start("default", &CancellationToken::new())
            })
        };
        tokio::time::timeout(Duration::from_secs(5), entered.notified())
            .await
            .expect("build never started");

        // Readers and stop are served while the connector is busy.
        assert!(supervisor.session.try_lock().is_ok());
        assert_eq!(supervisor.state(), ConnectionState::Idle);
        assert!(!supervisor.stop());

        // A start that finishes first wins the slot.
        let cancel = CancellationToken::new();
        let winner = supervisor.start("ops", &cancel).unwrap();

        release.send(()).unwrap();
        match slow_start.await.unwrap() {
            Err(GatewayError::Conflict { active, requested }) => {
                assert_eq!(active, "ops");
                assert_eq!(requested, "default");
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        wait_for_state(&supervisor, ConnectionState::Active).await;
        assert_eq!(spy.builds.load(Ordering::SeqCst), 2);
        assert_eq!(spy.connects.load(Ordering::SeqCst), 1);

        cancel.cancel();
        assert_eq!(finish(&winner).await, Ok(ShutdownReason::Cancelled));
    }
}
