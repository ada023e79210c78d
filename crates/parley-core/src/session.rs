//! Client session lifecycle.
//!
//! A session starts once the handshake has identified the user. From then on
//! exactly two tasks own it: the read loop, which runs in the task that
//! called [`Session::run`], and the write pump, which it spawns. The read loop
//! dispatches every envelope inline, so a client's messages are handled in
//! arrival order. The write pump is the only writer on the socket; everything
//! destined for the client, including the session's own replies, goes
//! through the inbox it drains.
//!
//! ```text
//! Connecting ─▶ Authorized ─▶ Active ─▶ Closing ─▶ Closed
//! ```

use crate::directory::UserProfile;
use crate::hub::{HubHandle, SessionId};
use crate::metrics;
use async_trait::async_trait;
use parley_protocol::Envelope;
use parley_transport::{Connection, FrameSink, FrameSource, Inbound, TransportError};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default time allowed between heartbeat answers.
pub const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(30);

/// Default capacity of a session inbox.
pub const DEFAULT_INBOX_CAPACITY: usize = 64;

/// Default time allowed for a single write to the client.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

const MIN_PING_INTERVAL: Duration = Duration::from_millis(1);

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport accepted, handshake pending.
    Connecting,
    /// Handshake verified, not yet registered.
    Authorized,
    /// Registered and exchanging envelopes.
    Active,
    /// Tearing down.
    Closing,
    /// Gone.
    Closed,
}

impl ConnectionState {
    /// Whether moving to `next` is a legal transition.
    ///
    /// `Authorized` may go straight to `Closing` when registration fails, and
    /// `Connecting` straight to `Closed` when the handshake is refused.
    #[must_use]
    pub fn can_advance_to(self, next: ConnectionState) -> bool {
        use ConnectionState::{Active, Authorized, Closed, Closing, Connecting};
        matches!(
            (self, next),
            (Connecting, Authorized)
                | (Connecting, Closed)
                | (Authorized, Active)
                | (Authorized, Closing)
                | (Active, Closing)
                | (Closing, Closed)
        )
    }

    fn advance(&mut self, next: ConnectionState) {
        if self.can_advance_to(next) {
            *self = next;
        } else {
            error!(from = ?self, to = ?next, "Illegal connection state transition");
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client closed the connection.
    ClientClosed,
    /// The client sent an oversized or undecodable frame.
    ProtocolError,
    /// No heartbeat answer within the pong timeout.
    HeartbeatTimeout,
    /// Reading from the connection failed.
    TransportError,
    /// Writing to the connection failed.
    WriteFailed,
    /// The server is shutting down.
    Shutdown,
    /// The hub refused or could not register the session.
    HubUnavailable,
}

impl CloseReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client_closed",
            CloseReason::ProtocolError => "protocol_error",
            CloseReason::HeartbeatTimeout => "heartbeat_timeout",
            CloseReason::TransportError => "transport_error",
            CloseReason::WriteFailed => "write_failed",
            CloseReason::Shutdown => "shutdown",
            CloseReason::HubUnavailable => "hub_unavailable",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of a finished session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    /// Hub-assigned id, 0 if the session never registered.
    pub session_id: SessionId,
    pub reason: CloseReason,
    pub state: ConnectionState,
}

/// Business logic invoked by a session.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// The session became active. Returns an envelope to send first.
    async fn connected(&self, user: &UserProfile) -> Option<Envelope>;

    /// The client answered a heartbeat.
    async fn heartbeat(&self, user: &UserProfile);

    /// Handle one client envelope. Returns a reply for the same client.
    async fn dispatch(&self, user: &UserProfile, envelope: Envelope) -> Option<Envelope>;

    /// The session is tearing down.
    async fn disconnected(&self, user: &UserProfile);
}

/// Session timing and buffering.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Time allowed between heartbeat answers.
    pub pong_timeout: Duration,
    /// Capacity of the inbox between the hub and the write pump.
    pub inbox_capacity: usize,
    /// Time allowed for one write, ping or close. A client that stops
    /// reading is disconnected once it is exceeded.
    pub write_timeout: Duration,
}

impl SessionConfig {
    /// Heartbeat period, half the pong timeout and never zero.
    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        (self.pong_timeout / 2).max(MIN_PING_INTERVAL)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pong_timeout: DEFAULT_PONG_TIMEOUT,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

/// One authorized client connection.
pub struct Session {
    user: UserProfile,
    connection: Box<dyn Connection>,
    hub: HubHandle,
    dispatcher: Arc<dyn Dispatcher>,
    config: SessionConfig,
    state: ConnectionState,
}

impl Session {
    /// Create a session for a connection whose handshake succeeded.
    #[must_use]
    pub fn new(
        user: UserProfile,
        connection: Box<dyn Connection>,
        hub: HubHandle,
        dispatcher: Arc<dyn Dispatcher>,
        config: SessionConfig,
    ) -> Self {
        let mut state = ConnectionState::Connecting;
        state.advance(ConnectionState::Authorized);
        Self {
            user,
            connection,
            hub,
            dispatcher,
            config,
            state,
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Run the session to completion.
    ///
    /// Teardown always runs every step, whatever ended the session:
    /// unregister from the hub, mark the user offline and tell their
    /// contacts, then let the write pump drain and close the connection.
    pub async fn run(self, shutdown: CancellationToken) -> SessionOutcome {
        let Session {
            user,
            connection,
            hub,
            dispatcher,
            config,
            mut state,
        } = self;
        let remote = connection.remote_addr();

        let (inbox_tx, inbox_rx) = mpsc::channel(config.inbox_capacity.max(1));
        let session_id = match hub.register(&user.username, inbox_tx.clone()).await {
            Ok(id) => id,
            Err(e) => {
                error!(user = %user.username, error = %e, "Failed to register session");
                state.advance(ConnectionState::Closing);
                let (_, mut sink) = connection.split();
                if let Err(e) = sink.close().await {
                    debug!(error = %e, "Failed to close refused connection");
                }
                state.advance(ConnectionState::Closed);
                metrics::record_session_closed(CloseReason::HubUnavailable.as_str());
                return SessionOutcome {
                    session_id: 0,
                    reason: CloseReason::HubUnavailable,
                    state,
                };
            }
        };

        state.advance(ConnectionState::Active);
        info!(
            session = session_id,
            user = %user.username,
            remote = remote.as_deref().unwrap_or("unknown"),
            "Session active"
        );

        if let Some(snapshot) = dispatcher.connected(&user).await {
            if inbox_tx.try_send(snapshot).is_err() {
                warn!(session = session_id, "Inbox full before session start");
            }
        }

        let (source, sink) = connection.split();
        let closing = shutdown.child_token();
        let writer = tokio::spawn(write_pump(
            session_id,
            sink,
            inbox_rx,
            config.ping_interval(),
            config.write_timeout,
            closing.clone(),
        ));

        let reason = receive(
            session_id,
            &user,
            source,
            dispatcher.as_ref(),
            &inbox_tx,
            &config,
            &closing,
            &shutdown,
        )
        .await;

        state.advance(ConnectionState::Closing);
        info!(session = session_id, user = %user.username, reason = %reason, "Session closing");

        if let Err(e) = hub.unregister(session_id).await {
            warn!(session = session_id, error = %e, "Failed to unregister session");
        }
        dispatcher.disconnected(&user).await;

        drop(inbox_tx);
        closing.cancel();
        if let Err(e) = writer.await {
            error!(session = session_id, error = %e, "Write pump panicked");
        }

        state.advance(ConnectionState::Closed);
        metrics::record_session_closed(reason.as_str());
        debug!(session = session_id, "Session closed");

        SessionOutcome {
            session_id,
            reason,
            state,
        }
    }
}

/// Read loop. Returns once the session must end.
#[allow(clippy::too_many_arguments)]
async fn receive(
    session_id: SessionId,
    user: &UserProfile,
    mut source: Box<dyn FrameSource>,
    dispatcher: &dyn Dispatcher,
    inbox: &mpsc::Sender<Envelope>,
    config: &SessionConfig,
    closing: &CancellationToken,
    shutdown: &CancellationToken,
) -> CloseReason {
    let deadline = tokio::time::sleep(config.pong_timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;

            _ = closing.cancelled() => {
                return if shutdown.is_cancelled() {
                    CloseReason::Shutdown
                } else {
                    CloseReason::WriteFailed
                };
            }

            _ = &mut deadline => {
                warn!(session = session_id, user = %user.username, "Heartbeat timeout");
                return CloseReason::HeartbeatTimeout;
            }

            inbound = source.recv() => match inbound {
                Ok(Some(Inbound::Envelope(envelope))) => {
                    metrics::record_envelope_in(envelope.kind());
                    if let Some(reply) = dispatcher.dispatch(user, envelope).await {
                        // A full inbox means the writer is behind; keep watching
                        // for teardown while waiting on it.
                        tokio::select! {
                            biased;
                            _ = closing.cancelled() => {
                                return if shutdown.is_cancelled() {
                                    CloseReason::Shutdown
                                } else {
                                    CloseReason::WriteFailed
                                };
                            }
                            _ = &mut deadline => {
                                warn!(session = session_id, user = %user.username, "Heartbeat timeout");
                                return CloseReason::HeartbeatTimeout;
                            }
                            sent = inbox.send(reply) => {
                                if sent.is_err() {
                                    return CloseReason::WriteFailed;
                                }
                            }
                        }
                    }
                }
                Ok(Some(Inbound::Pong)) => {
                    deadline.as_mut().reset(Instant::now() + config.pong_timeout);
                    metrics::record_heartbeat();
                    dispatcher.heartbeat(user).await;
                }
                Ok(None) => {
                    debug!(session = session_id, "Client closed connection");
                    return CloseReason::ClientClosed;
                }
                Err(e) if e.is_protocol() => {
                    warn!(session = session_id, user = %user.username, error = %e, "Protocol error");
                    return CloseReason::ProtocolError;
                }
                Err(e) => {
                    warn!(session = session_id, user = %user.username, error = %e, "Read failed");
                    return CloseReason::TransportError;
                }
            },
        }
    }
}

/// Write pump. The only writer on the connection.
///
/// On cancellation whatever is already queued is still written before the
/// connection is closed. A failed or timed out write cancels `closing` so the
/// read loop ends too.
async fn write_pump(
    session_id: SessionId,
    mut sink: Box<dyn FrameSink>,
    mut inbox: mpsc::Receiver<Envelope>,
    ping_interval: Duration,
    write_timeout: Duration,
    closing: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut healthy = true;

    loop {
        tokio::select! {
            biased;

            _ = closing.cancelled() => break,

            _ = ticker.tick() => {
                if let Err(e) = bounded(write_timeout, sink.ping()).await {
                    debug!(session = session_id, error = %e, "Ping failed");
                    healthy = false;
                    break;
                }
            }

            envelope = inbox.recv() => match envelope {
                Some(envelope) => {
                    if let Err(e) = bounded(write_timeout, write(sink.as_mut(), &envelope)).await {
                        debug!(session = session_id, error = %e, "Write failed");
                        healthy = false;
                        break;
                    }
                }
                None => break,
            },
        }
    }

    if healthy {
        inbox.close();
        while let Ok(envelope) = inbox.try_recv() {
            if let Err(e) = bounded(write_timeout, write(sink.as_mut(), &envelope)).await {
                debug!(session = session_id, error = %e, "Write failed while draining");
                break;
            }
        }
    } else {
        closing.cancel();
    }

    if let Err(e) = bounded(write_timeout, sink.close()).await {
        debug!(session = session_id, error = %e, "Failed to close connection");
    }
}

async fn bounded<F>(limit: Duration, op: F) -> Result<(), TransportError>
where
    F: std::future::Future<Output = Result<(), TransportError>>,
{
    tokio::time::timeout(limit, op)
        .await
        .unwrap_or(Err(TransportError::Timeout(limit)))
}

/// Encode and send one envelope. Errors are returned, never retried.
///
/// # Errors
///
/// Returns an error if encoding or the transport write fails.
pub async fn write(sink: &mut dyn FrameSink, envelope: &Envelope) -> Result<(), TransportError> {
    sink.send(envelope).await?;
    metrics::record_envelope_out(envelope.kind());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{Hub, HubConfig};
    use parley_transport::memory::{self, MemoryClient, Outbound};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        connected: AtomicUsize,
        heartbeats: AtomicUsize,
        dispatched: AtomicUsize,
        disconnected: AtomicUsize,
    }

    #[async_trait]
    impl Dispatcher for Recorder {
        async fn connected(&self, _user: &UserProfile) -> Option<Envelope> {
            self.connected.fetch_add(1, Ordering::SeqCst);
            Some(Envelope::private_chat("server", "alice", "welcome"))
        }

        async fn heartbeat(&self, _user: &UserProfile) {
            self.heartbeats.fetch_add(1, Ordering::SeqCst);
        }

        async fn dispatch(&self, _user: &UserProfile, envelope: Envelope) -> Option<Envelope> {
            self.dispatched.fetch_add(1, Ordering::SeqCst);
            Some(envelope.with_error("echo"))
        }

        async fn disconnected(&self, _user: &UserProfile) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn alice() -> UserProfile {
        UserProfile::new("1", "alice", "alice@example.com")
    }

    fn start(
        pong_timeout: Duration,
    ) -> (
        tokio::task::JoinHandle<SessionOutcome>,
        MemoryClient,
        Arc<Recorder>,
        HubHandle,
        CancellationToken,
    ) {
        let (hub, handle) = Hub::new(HubConfig::default());
        let shutdown = CancellationToken::new();
        tokio::spawn(hub.run(shutdown.clone()));

        let (conn, client) = memory::pair(1024);
        let recorder = Arc::new(Recorder::default());
        let session = Session::new(
            alice(),
            Box::new(conn),
            handle.clone(),
            Arc::clone(&recorder) as Arc<dyn Dispatcher>,
            SessionConfig {
                pong_timeout,
                inbox_capacity: 8,
                ..SessionConfig::default()
            },
        );
        assert_eq!(session.state(), ConnectionState::Authorized);
        let task = tokio::spawn(session.run(shutdown.clone()));
        (task, client, recorder, handle, shutdown)
    }

    #[test]
    fn test_state_transitions() {
        use ConnectionState::*;
        assert!(Connecting.can_advance_to(Authorized));
        assert!(Active.can_advance_to(Closing));
        assert!(Closing.can_advance_to(Closed));
        assert!(!Connecting.can_advance_to(Active));
        assert!(!Authorized.can_advance_to(Closed));
        assert!(!Closed.can_advance_to(Active));
    }

    #[tokio::test]
    async fn test_snapshot_then_replies_then_clean_close() {
        let (task, mut client, recorder, hub, _shutdown) = start(DEFAULT_PONG_TIMEOUT);

        match client.recv_envelope().await.unwrap() {
            Envelope::PrivateChat(m) => assert_eq!(m.content, "welcome"),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(hub.live_count(), 1);

        client.send(&Envelope::private_chat("", "bob", "hi")).unwrap();
        match client.recv_envelope().await.unwrap() {
            Envelope::PrivateChat(m) => assert_eq!(m.content, "echo"),
            other => panic!("unexpected: {other:?}"),
        }

        client.close();
        let outcome = task.await.unwrap();
        assert_eq!(outcome.session_id, 1);
        assert_eq!(outcome.reason, CloseReason::ClientClosed);
        assert_eq!(outcome.state, ConnectionState::Closed);
        assert_eq!(recorder.connected.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.dispatched.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.disconnected.load(Ordering::SeqCst), 1);
        assert!(hub.sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_protocol_error_ends_session() {
        let (task, client, recorder, _hub, _shutdown) = start(DEFAULT_PONG_TIMEOUT);

        client.send_text("{not json").unwrap();
        let outcome = task.await.unwrap();
        assert_eq!(outcome.reason, CloseReason::ProtocolError);
        assert_eq!(recorder.dispatched.load(Ordering::SeqCst), 0);
        assert_eq!(recorder.disconnected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_oversized_frame_ends_session() {
        let (task, client, _recorder, _hub, _shutdown) = start(DEFAULT_PONG_TIMEOUT);

        let big = "x".repeat(2048);
        client.send(&Envelope::private_chat("", "bob", big)).unwrap();
        assert_eq!(task.await.unwrap().reason, CloseReason::ProtocolError);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_client_times_out() {
        let (task, mut client, recorder, _hub, _shutdown) = start(Duration::from_secs(10));

        let outcome = task.await.unwrap();
        assert_eq!(outcome.reason, CloseReason::HeartbeatTimeout);
        assert_eq!(recorder.disconnected.load(Ordering::SeqCst), 1);

        // Snapshot first, at least one ping, close last.
        let mut frames = Vec::new();
        while let Some(frame) = client.recv().await {
            frames.push(frame);
        }
        assert!(matches!(frames.first(), Some(Outbound::Envelope(_))));
        assert!(frames.contains(&Outbound::Ping));
        assert_eq!(frames.last(), Some(&Outbound::Close));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pongs_keep_session_alive() {
        let (task, mut client, recorder, _hub, _shutdown) = start(Duration::from_secs(10));

        let mut pongs = 0;
        while pongs < 5 {
            match client.recv().await {
                Some(Outbound::Ping) => {
                    client.pong().unwrap();
                    pongs += 1;
                }
                Some(_) => {}
                None => panic!("session ended early"),
            }
        }
        client.close();

        let outcome = task.await.unwrap();
        assert_eq!(outcome.reason, CloseReason::ClientClosed);
        assert_eq!(recorder.heartbeats.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_shutdown_drains_inbox() {
        let (task, mut client, _recorder, hub, shutdown) = start(DEFAULT_PONG_TIMEOUT);

        // Wait until registered.
        assert!(client.recv_envelope().await.is_some());
        hub.deliver(Envelope::private_chat("bob", "alice", "late"))
            .await
            .unwrap();
        hub.sessions().await.unwrap();
        shutdown.cancel();

        let outcome = task.await.unwrap();
        assert_eq!(outcome.reason, CloseReason::Shutdown);
        match client.recv_envelope().await.unwrap() {
            Envelope::PrivateChat(m) => assert_eq!(m.content, "late"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_write_failure_tears_down() {
        let (task, mut client, recorder, _hub, _shutdown) = start(DEFAULT_PONG_TIMEOUT);
        assert!(client.recv_envelope().await.is_some());

        // Ask for a reply, then vanish before it can be written.
        client.send(&Envelope::private_chat("", "bob", "hi")).unwrap();
        drop(client);

        let outcome = task.await.unwrap();
        assert!(matches!(
            outcome.reason,
            CloseReason::WriteFailed | CloseReason::ClientClosed
        ));
        assert_eq!(recorder.disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.state, ConnectionState::Closed);
    }

    /// A client that keeps sending but never reads: every write blocks.
    struct StalledConnection {
        frames: mpsc::UnboundedReceiver<Inbound>,
    }

    struct StalledSource {
        frames: mpsc::UnboundedReceiver<Inbound>,
    }

    struct StalledSink;

    impl Connection for StalledConnection {
        fn split(self: Box<Self>) -> (Box<dyn FrameSource>, Box<dyn FrameSink>) {
            (
                Box::new(StalledSource {
                    frames: self.frames,
                }),
                Box::new(StalledSink),
            )
        }
    }

    #[async_trait]
    impl FrameSource for StalledSource {
        async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
            match self.frames.recv().await {
                Some(frame) => Ok(Some(frame)),
                None => std::future::pending().await,
            }
        }
    }

    #[async_trait]
    impl FrameSink for StalledSink {
        async fn send(&mut self, _envelope: &Envelope) -> Result<(), TransportError> {
            std::future::pending().await
        }

        async fn ping(&mut self) -> Result<(), TransportError> {
            std::future::pending().await
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_writer_ends_session() {
        let (hub, handle) = Hub::new(HubConfig::default());
        let shutdown = CancellationToken::new();
        tokio::spawn(hub.run(shutdown.clone()));

        let (frames_tx, frames) = mpsc::unbounded_channel();
        // More replies than the inbox holds, none of which can be written.
        for _ in 0..8 {
            frames_tx
                .send(Inbound::Envelope(Envelope::private_chat("", "bob", "hi")))
                .unwrap();
        }

        let recorder = Arc::new(Recorder::default());
        let session = Session::new(
            alice(),
            Box::new(StalledConnection { frames }),
            handle.clone(),
            Arc::clone(&recorder) as Arc<dyn Dispatcher>,
            SessionConfig {
                pong_timeout: Duration::from_secs(600),
                inbox_capacity: 1,
                write_timeout: Duration::from_secs(1),
            },
        );

        let outcome = tokio::time::timeout(Duration::from_secs(60), session.run(shutdown.clone()))
            .await
            .expect("session stuck on a stalled writer");
        assert_eq!(outcome.reason, CloseReason::WriteFailed);
        assert_eq!(outcome.state, ConnectionState::Closed);
        assert_eq!(recorder.disconnected.load(Ordering::SeqCst), 1);
        assert!(handle.sessions().await.unwrap().is_empty());
        drop(frames_tx);
    }

    #[test]
    fn test_ping_interval_is_never_zero() {
        let config = SessionConfig {
            pong_timeout: Duration::ZERO,
            ..SessionConfig::default()
        };
        assert!(config.ping_interval() > Duration::ZERO);
        assert_eq!(
            SessionConfig::default().ping_interval(),
            DEFAULT_PONG_TIMEOUT / 2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_pong_timeout_does_not_panic_writer() {
        let (task, mut client, recorder, _hub, _shutdown) = start(Duration::ZERO);
        let outcome = task.await.unwrap();
        assert_eq!(outcome.reason, CloseReason::HeartbeatTimeout);
        // The writer survived long enough to flush the queued snapshot.
        assert!(client.recv_envelope().await.is_some());
        assert_eq!(outcome.state, ConnectionState::Closed);
        assert_eq!(recorder.disconnected.load(Ordering::SeqCst), 1);
    }
}
