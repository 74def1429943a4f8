//! Connection lifecycle and reconnection.
//!
//! [`ConnectionHandle`] wraps one open socket together with the state that
//! lives exactly as long as that socket: outstanding calls and in-flight
//! transits. Handlers receive it through their
//! [`RequestContext`](crate::handler::RequestContext).
//!
//! The connection manager drives the dialing side:
//!
//! ```text
//! Disconnected ─connect()─► Connecting ─open─► Open ─close─► Disconnected
//!                               │                                  │
//!                               └──handshake error──► Disconnected │
//!                                                                  ▼
//!                                  retry after delay ◄── attempts left?
//!                                                                  │ no
//!                                                                  ▼
//!                                                                Closed
//! ```
//!
//! Attempts are counted per `connect()` sequence, the initial dial
//! included. A retry runs on its own task; `connect()` and `close()` abort
//! it and bump a generation counter so a task that already started can no
//! longer install its socket.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::caller::PendingCalls;
use crate::config::{ChunkingConfig, ReconnectPolicy};
use crate::error::{Result, SockRpcError};
use crate::protocol::{
    encode_data, encode_error, encode_frames, CallId, Response, TransitReassembler,
};
use crate::transport::{Connected, Connector, Socket, SocketEvent};

static CONNECTION_IDS: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of the dialing side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket; a retry may be pending.
    Disconnected,
    /// Dialing.
    Connecting,
    /// Socket open.
    Open,
    /// No socket and nothing scheduled: retries exhausted, reconnection
    /// disabled, or `close()` called.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

struct DetachedSocket;

impl Socket for DetachedSocket {
    fn send(&self, _frame: String) -> Result<()> {
        Err(SockRpcError::NotConnected)
    }

    fn close(&self) {}
}

struct HandleInner {
    id: u64,
    socket: Arc<dyn Socket>,
    chunking: ChunkingConfig,
    pending: Arc<PendingCalls>,
    transits: Mutex<TransitReassembler>,
}

/// One open socket plus its outstanding calls and in-flight transits.
///
/// Cheap to clone; all clones refer to the same connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    /// Wrap an open socket.
    pub fn new(socket: Arc<dyn Socket>, chunking: ChunkingConfig, correlate: bool) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: CONNECTION_IDS.fetch_add(1, Ordering::Relaxed),
                socket,
                chunking,
                pending: Arc::new(PendingCalls::new(correlate)),
                transits: Mutex::new(TransitReassembler::with_limit(chunking.max_transits)),
            }),
        }
    }

    /// Handle with no socket behind it. Every send fails with
    /// [`SockRpcError::NotConnected`]. Given to lifecycle hooks that fire
    /// while no connection exists.
    pub fn detached() -> Self {
        Self::new(Arc::new(DetachedSocket), ChunkingConfig::default(), true)
    }

    /// Process-unique connection number, for logs.
    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Send one raw text frame.
    pub fn send(&self, frame: String) -> Result<()> {
        self.inner.socket.send(frame)
    }

    /// Send a `{"data"}` response frame.
    pub fn send_data<T: Serialize + ?Sized>(&self, data: &T, call_id: Option<CallId>) -> Result<()> {
        self.send(encode_data(data, call_id)?)
    }

    /// Send an `{"error", "details"?}` response frame.
    pub fn send_error(
        &self,
        message: &str,
        details: Option<&Value>,
        call_id: Option<CallId>,
    ) -> Result<()> {
        self.send(encode_error(message, details, call_id)?)
    }

    /// Call a method on the remote peer and wait for its response.
    ///
    /// Oversized inputs are chunked according to the connection's chunking
    /// config. There is no timeout; wrap the future in
    /// `tokio::time::timeout` if one is needed.
    pub async fn call<T, R>(&self, method: &str, input: &T) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let input = serde_json::to_value(input)?;
        let waiter = self.inner.pending.register()?;
        let frames = encode_frames(method, &input, waiter.wire_id(), &self.inner.chunking)?;

        tracing::debug!(
            "Calling {} on connection {} ({} frames)",
            method,
            self.id(),
            frames.len()
        );
        for frame in frames {
            self.send(frame)?;
        }

        let data = waiter.wait().await?;
        Ok(serde_json::from_value(data)?)
    }

    /// Close the socket.
    pub fn close(&self) {
        self.inner.socket.close();
    }

    /// Number of calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Number of chunked transfers being reassembled.
    pub fn transits_in_flight(&self) -> usize {
        self.lock_transits().len()
    }

    pub(crate) fn lock_transits(&self) -> MutexGuard<'_, TransitReassembler> {
        self.inner
            .transits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn resolve(&self, response: Response) -> bool {
        self.inner.pending.resolve(response)
    }

    /// Drop connection-scoped state once the socket is gone.
    pub(crate) fn release(&self) {
        let failed = self.inner.pending.close();
        let dropped = self.lock_transits().clear();
        if failed > 0 || dropped > 0 {
            tracing::debug!(
                "Connection {} released: {} pending calls failed, {} transits dropped",
                self.id(),
                failed,
                dropped
            );
        }
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("chunking", &self.inner.chunking)
            .finish()
    }
}

/// Callbacks from the socket machinery into the peer.
pub(crate) trait ConnectionEvents: Send + Sync + 'static {
    fn on_open(&self, conn: &ConnectionHandle);
    fn on_message(&self, frame: String, conn: &ConnectionHandle);
    fn on_error(&self, message: &str, conn: Option<&ConnectionHandle>);
    fn on_close(&self, conn: Option<&ConnectionHandle>);
}

/// Deliver socket events until the socket closes or the channel ends.
async fn pump(
    events: &dyn ConnectionEvents,
    conn: &ConnectionHandle,
    rx: &mut mpsc::UnboundedReceiver<SocketEvent>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            SocketEvent::Message(frame) => events.on_message(frame, conn),
            SocketEvent::Error(message) => {
                tracing::warn!("Socket error on connection {}: {}", conn.id(), message);
                events.on_error(&message, Some(conn));
            }
            SocketEvent::Close => break,
        }
    }
}

/// Drive an already-open socket without reconnection (accepting side).
pub(crate) fn serve(
    events: Arc<dyn ConnectionEvents>,
    conn: ConnectionHandle,
    mut rx: mpsc::UnboundedReceiver<SocketEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        events.on_open(&conn);
        pump(events.as_ref(), &conn, &mut rx).await;
        tracing::debug!("Served connection {} closed", conn.id());
        conn.release();
        events.on_close(Some(&conn));
    })
}

#[derive(Default)]
struct Session {
    generation: u64,
    url: String,
    policy: ReconnectPolicy,
    attempts: u32,
    current: Option<ConnectionHandle>,
    reader: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
}

impl Session {
    /// Invalidate every task of the current sequence and hand back its socket.
    fn invalidate(&mut self) -> Option<ConnectionHandle> {
        self.generation += 1;
        if let Some(retry) = self.retry.take() {
            retry.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.current.take()
    }
}

struct ManagerInner {
    connector: Arc<dyn Connector>,
    events: Arc<dyn ConnectionEvents>,
    chunking: ChunkingConfig,
    correlate: bool,
    state: watch::Sender<ConnectionState>,
    session: Mutex<Session>,
}

impl ManagerInner {
    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!("Connection state {} -> {}", previous, state);
        }
    }

    /// Adopt a freshly opened socket if its sequence is still current.
    fn install(
        inner: &Arc<ManagerInner>,
        generation: u64,
        connected: Connected,
    ) -> Option<ConnectionHandle> {
        let Connected { socket, events } = connected;
        let conn = ConnectionHandle::new(socket, inner.chunking, inner.correlate);

        let mut session = inner.lock();
        if session.generation != generation {
            drop(session);
            tracing::debug!("Discarding superseded connection {}", conn.id());
            conn.close();
            return None;
        }

        if session.policy.reset_on_open {
            session.attempts = 1;
        }
        session.current = Some(conn.clone());
        session.reader = Some(tokio::spawn(Self::read_loop(
            Arc::clone(inner),
            generation,
            conn.clone(),
            events,
        )));
        inner.set_state(ConnectionState::Open);
        tracing::info!(
            "Connection {} open to {} (attempt {})",
            conn.id(),
            session.url,
            session.attempts
        );
        drop(session);

        inner.events.on_open(&conn);
        Some(conn)
    }

    async fn read_loop(
        inner: Arc<ManagerInner>,
        generation: u64,
        conn: ConnectionHandle,
        mut rx: mpsc::UnboundedReceiver<SocketEvent>,
    ) {
        pump(inner.events.as_ref(), &conn, &mut rx).await;
        Self::connection_lost(&inner, generation, &conn);
    }

    fn connection_lost(inner: &Arc<ManagerInner>, generation: u64, conn: &ConnectionHandle) {
        conn.release();

        {
            let mut session = inner.lock();
            let is_current = session
                .current
                .as_ref()
                .is_some_and(|current| current.id() == conn.id());
            if session.generation != generation || !is_current {
                return;
            }
            session.current = None;
            session.reader = None;
            inner.set_state(ConnectionState::Disconnected);
        }

        tracing::info!("Connection {} closed", conn.id());
        inner.events.on_close(Some(conn));
        Self::schedule_retry(inner, generation);
    }

    /// Schedule the next attempt, or give up.
    fn schedule_retry(inner: &Arc<ManagerInner>, generation: u64) {
        let mut session = inner.lock();
        if session.generation != generation {
            return;
        }

        let policy = session.policy;
        if !policy.reconnect {
            inner.set_state(ConnectionState::Closed);
            return;
        }

        if session.attempts >= policy.max_attempts {
            tracing::warn!(
                "Giving up on {} after {} connection attempts",
                session.url,
                session.attempts
            );
            inner.set_state(ConnectionState::Closed);
            return;
        }

        session.attempts += 1;
        let attempt = session.attempts;
        tracing::debug!(
            "Reconnecting to {} in {:?} (attempt {}/{})",
            session.url,
            policy.delay,
            attempt,
            policy.max_attempts
        );

        let task_inner = Arc::clone(inner);
        session.retry = Some(tokio::spawn(async move {
            tokio::time::sleep(policy.delay).await;
            Self::retry(task_inner, generation, attempt).await;
        }));
    }

    async fn retry(inner: Arc<ManagerInner>, generation: u64, attempt: u32) {
        let url = {
            let mut session = inner.lock();
            if session.generation != generation {
                return;
            }
            // Detach our own handle; the generation check guards us from here on
            session.retry = None;
            inner.set_state(ConnectionState::Connecting);
            session.url.clone()
        };

        match inner.connector.connect(&url).await {
            Ok(connected) => {
                let _ = Self::install(&inner, generation, connected);
            }
            Err(e) => {
                tracing::warn!("Reconnection attempt {} to {} failed: {}", attempt, url, e);
                {
                    let session = inner.lock();
                    if session.generation != generation {
                        return;
                    }
                    inner.set_state(ConnectionState::Disconnected);
                }
                inner.events.on_error(&e.to_string(), None);
                inner.events.on_close(None);
                Self::schedule_retry(&inner, generation);
            }
        }
    }
}

/// Owns the dialing side's socket and its reconnection sequence.
pub(crate) struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub(crate) fn new(
        connector: Arc<dyn Connector>,
        events: Arc<dyn ConnectionEvents>,
        chunking: ChunkingConfig,
        correlate: bool,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(ManagerInner {
                connector,
                events,
                chunking,
                correlate,
                state,
                session: Mutex::new(Session::default()),
            }),
        }
    }

    /// Start a new connect sequence, replacing any current one.
    ///
    /// Resolves once the socket is open. A handshake failure rejects and is
    /// not retried.
    pub(crate) async fn connect(
        &self,
        url: &str,
        policy: ReconnectPolicy,
    ) -> Result<ConnectionHandle> {
        let inner = &self.inner;
        let (generation, replaced) = {
            let mut session = inner.lock();
            let replaced = session.invalidate();
            session.url = url.to_string();
            session.policy = policy;
            session.attempts = 1;
            inner.set_state(ConnectionState::Connecting);
            (session.generation, replaced)
        };

        if let Some(old) = replaced {
            tracing::debug!("Closing connection {} for new connect", old.id());
            old.close();
            old.release();
            inner.events.on_close(Some(&old));
        }

        tracing::debug!("Connecting to {}", url);
        match inner.connector.connect(url).await {
            Ok(connected) => {
                ManagerInner::install(inner, generation, connected).ok_or(SockRpcError::Superseded)
            }
            Err(e) => {
                tracing::warn!("Connection to {} failed: {}", url, e);
                {
                    let session = inner.lock();
                    if session.generation == generation {
                        inner.set_state(ConnectionState::Disconnected);
                    }
                }
                inner.events.on_error(&e.to_string(), None);
                Err(e)
            }
        }
    }

    /// Close the socket and stop reconnecting.
    pub(crate) fn close(&self) {
        let closed = {
            let mut session = self.inner.lock();
            let closed = session.invalidate();
            self.inner.set_state(ConnectionState::Closed);
            closed
        };

        if let Some(conn) = closed {
            tracing::info!("Connection {} closed by request", conn.id());
            conn.close();
            conn.release();
            self.inner.events.on_close(Some(&conn));
        }
    }

    pub(crate) fn current(&self) -> Option<ConnectionHandle> {
        self.inner.lock().current.clone()
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.inner.lock().attempts
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let current = self.inner.lock().invalidate();
        if let Some(conn) = current {
            conn.close();
            conn.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::BoxFuture;
    use crate::transport::MemorySocket;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        opens: AtomicUsize,
        closes: AtomicUsize,
        errors: AtomicUsize,
        messages: Mutex<Vec<String>>,
    }

    impl ConnectionEvents for Recorder {
        fn on_open(&self, _conn: &ConnectionHandle) {
            self.opens.fetch_add(1, Ordering::SeqCst);
        }

        fn on_message(&self, frame: String, _conn: &ConnectionHandle) {
            self.messages.lock().unwrap().push(frame);
        }

        fn on_error(&self, _message: &str, _conn: Option<&ConnectionHandle>) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }

        fn on_close(&self, _conn: Option<&ConnectionHandle>) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// How each dial behaves.
    #[derive(Clone, Copy)]
    enum Dial {
        /// Open, then close straight away.
        OpenThenClose,
        /// Handshake error.
        Refuse,
        /// Open and stay open; the far end is kept alive.
        Stay,
    }

    struct ScriptedConnector {
        dials: Arc<AtomicUsize>,
        script: Vec<Dial>,
        fallback: Dial,
        keep: Arc<Mutex<Vec<Connected>>>,
    }

    impl ScriptedConnector {
        fn new(script: Vec<Dial>, fallback: Dial) -> Self {
            Self {
                dials: Arc::new(AtomicUsize::new(0)),
                script,
                fallback,
                keep: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl Connector for ScriptedConnector {
        fn connect(&self, _url: &str) -> BoxFuture<'static, Result<Connected>> {
            let n = self.dials.fetch_add(1, Ordering::SeqCst);
            let dial = self.script.get(n).copied().unwrap_or(self.fallback);
            let keep = self.keep.clone();
            Box::pin(async move {
                match dial {
                    Dial::Refuse => Err(SockRpcError::Transport("refused".to_string())),
                    Dial::OpenThenClose => {
                        let (local, remote) = MemorySocket::pair();
                        remote.socket.close();
                        Ok(local)
                    }
                    Dial::Stay => {
                        let (local, remote) = MemorySocket::pair();
                        keep.lock().unwrap().push(remote);
                        Ok(local)
                    }
                }
            })
        }
    }

    fn manager(connector: ScriptedConnector) -> (ConnectionManager, Arc<Recorder>, Arc<AtomicUsize>) {
        let dials = connector.dials.clone();
        let recorder = Arc::new(Recorder::default());
        let manager = ConnectionManager::new(
            Arc::new(connector),
            recorder.clone(),
            ChunkingConfig::default(),
            true,
        );
        (manager, recorder, dials)
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let (manager, recorder, dials) =
            manager(ScriptedConnector::new(vec![], Dial::OpenThenClose));

        manager
            .connect("mem://flaky", ReconnectPolicy::fixed(3, Duration::from_millis(10)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(dials.load(Ordering::SeqCst), 3);
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(recorder.opens.load(Ordering::SeqCst), 3);
        assert_eq!(recorder.closes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_for_delay() {
        let (manager, _recorder, dials) =
            manager(ScriptedConnector::new(vec![Dial::OpenThenClose], Dial::Stay));

        manager
            .connect("mem://x", ReconnectPolicy::fixed(5, Duration::from_secs(30)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(dials.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(dials.load(Ordering::SeqCst), 2);
        assert_eq!(manager.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_error_is_not_retried() {
        let (manager, recorder, dials) = manager(ScriptedConnector::new(vec![], Dial::Refuse));

        let result = manager
            .connect("mem://down", ReconnectPolicy::fixed(5, Duration::from_millis(1)))
            .await;
        assert!(matches!(result, Err(SockRpcError::Transport(_))));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(dials.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(recorder.errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reconnection_counts_as_attempt() {
        let script = vec![Dial::OpenThenClose, Dial::Refuse, Dial::Refuse];
        let (manager, recorder, dials) = manager(ScriptedConnector::new(script, Dial::Stay));

        manager
            .connect("mem://x", ReconnectPolicy::fixed(3, Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(dials.load(Ordering::SeqCst), 3);
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(recorder.errors.load(Ordering::SeqCst), 2);
        // one real close plus one per failed attempt
        assert_eq!(recorder.closes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_accumulate_across_successful_reopens() {
        let (manager, _recorder, dials) =
            manager(ScriptedConnector::new(vec![], Dial::OpenThenClose));

        manager
            .connect("mem://x", ReconnectPolicy::fixed(4, Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        // every reopen succeeded, yet the cap still applies to the whole sequence
        assert_eq!(dials.load(Ordering::SeqCst), 4);
        assert_eq!(manager.attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_on_open_keeps_retrying() {
        // refuse, then open-and-close, repeatedly
        let script = vec![
            Dial::OpenThenClose,
            Dial::Refuse,
            Dial::OpenThenClose,
            Dial::Refuse,
            Dial::OpenThenClose,
            Dial::Refuse,
            Dial::Refuse,
        ];
        let (manager, _recorder, dials) = manager(ScriptedConnector::new(script, Dial::Refuse));

        let policy = ReconnectPolicy::fixed(3, Duration::from_millis(10)).reset_on_open(true);
        manager.connect("mem://x", policy).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        // each open resets the counter; the final outage gets two retries
        assert_eq!(dials.load(Ordering::SeqCst), 7);
        assert_eq!(manager.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_disabled_closes() {
        let (manager, recorder, dials) =
            manager(ScriptedConnector::new(vec![], Dial::OpenThenClose));

        manager
            .connect("mem://x", ReconnectPolicy::disabled())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(dials.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_connect_cancels_pending_retry() {
        let script = vec![Dial::OpenThenClose, Dial::Stay];
        let (manager, _recorder, dials) = manager(ScriptedConnector::new(script, Dial::Stay));

        manager
            .connect("mem://a", ReconnectPolicy::fixed(5, Duration::from_secs(10)))
            .await
            .unwrap();

        // let the close land and the retry get scheduled
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        manager
            .connect("mem://b", ReconnectPolicy::fixed(5, Duration::from_secs(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;

        // the cancelled retry never dialed
        assert_eq!(dials.load(Ordering::SeqCst), 2);
        assert_eq!(manager.state(), ConnectionState::Open);
        assert_eq!(manager.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_stops_everything() {
        let (manager, recorder, dials) = manager(ScriptedConnector::new(vec![], Dial::Stay));

        let conn = manager
            .connect("mem://x", ReconnectPolicy::fixed(5, Duration::from_millis(10)))
            .await
            .unwrap();
        manager.close();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(dials.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert!(manager.current().is_none());
        assert!(conn.send("x".to_string()).is_err());
        assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_messages_reach_events() {
        let connector = ScriptedConnector::new(vec![], Dial::Stay);
        let keep = connector.keep.clone();
        let (manager, recorder, _dials) = manager(connector);

        manager
            .connect("mem://x", ReconnectPolicy::disabled())
            .await
            .unwrap();

        let remote = keep.lock().unwrap().pop().unwrap();
        remote.socket.send("frame-1".to_string()).unwrap();

        for _ in 0..100 {
            if !recorder.messages.lock().unwrap().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(*recorder.messages.lock().unwrap(), vec!["frame-1".to_string()]);
    }

    #[tokio::test]
    async fn test_detached_handle_refuses_to_send() {
        let conn = ConnectionHandle::detached();
        assert!(matches!(
            conn.send_data(&1, None),
            Err(SockRpcError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_call_fails_when_connection_released() {
        let (local, _remote) = MemorySocket::pair();
        let conn = ConnectionHandle::new(local.socket, ChunkingConfig::default(), true);

        let caller = conn.clone();
        let call = tokio::spawn(async move { caller.call::<_, Value>("m", &1).await });

        while conn.pending_calls() == 0 {
            tokio::task::yield_now().await;
        }
        conn.release();

        assert!(matches!(
            call.await.unwrap(),
            Err(SockRpcError::ConnectionClosed)
        ));
    }
}
