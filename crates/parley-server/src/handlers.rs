//! HTTP and WebSocket handlers for the Parley server.
//!
//! The WebSocket endpoint performs the handshake (capacity check, one-time
//! code, user lookup) before upgrading, then hands the connection to a
//! [`Session`].

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json,
};
use parley_core::metrics::record_handshake_rejected;
use parley_core::{
    AuthError, BusForwarder, ContactDirectory, DirectoryError, DisabledGenerator, Hub,
    HubConfig, HubError, HubHandle, IdGenerator, MemoryBus, MemoryDirectory, MemoryMessageStore,
    MemoryOtpStore, MemoryPresenceStore, NodeId, OtpVerifier, Router, RouterConfig, Services,
    Session, SessionConfig, UserProfile,
};
use parley_transport::websocket::WebSocketConnection;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Identity of this node.
    pub node: NodeId,
    /// Machine id stamped into message ids.
    pub machine_id: u16,
    /// Registry of live sessions.
    pub hub: HubHandle,
    /// Message router, also the dispatcher of every session.
    pub router: Arc<Router>,
    /// Users, contacts and groups.
    pub directory: Arc<MemoryDirectory>,
    /// One-time codes for the handshake.
    pub otp: Arc<MemoryOtpStore>,
    /// Root token; every session runs on a child of it.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Seed the directory and start the node's background tasks: the hub
    /// loop, the bus forwarder and expiry of presence flags and codes.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is out of range, the seed data
    /// is inconsistent or the node's bus channel cannot be subscribed.
    pub async fn start(config: Config, shutdown: CancellationToken) -> Result<Arc<Self>> {
        config.validate()?;
        let directory = Arc::new(seed_directory(&config)?);

        let node = config
            .node
            .id
            .clone()
            .map_or_else(NodeId::generate, NodeId::from);
        let machine_id = match config.node.machine_id {
            Some(id) => id,
            None => {
                let derived = node.machine_id();
                warn!(
                    node = %node,
                    machine_id = derived,
                    "Machine id derived from node id; set node.machine_id on every node of a cluster"
                );
                derived
            }
        };

        let (hub, handle) = Hub::new(HubConfig {
            command_capacity: config.limits.hub_capacity,
        });
        tokio::spawn(hub.run(shutdown.clone()));

        let bus = Arc::new(MemoryBus::new());
        let forwarder = BusForwarder::subscribe(bus.as_ref(), node.clone())
            .await
            .with_context(|| format!("Failed to subscribe to channel for {node}"))?;
        tokio::spawn(forwarder.run(handle.clone(), shutdown.clone()));

        let presence = Arc::new(MemoryPresenceStore::new(config.presence.online_ttl()));
        let otp = Arc::new(MemoryOtpStore::new(config.auth.otp_ttl()));
        tokio::spawn(prune_expired(
            Arc::clone(&presence),
            Arc::clone(&otp),
            config.presence.online_ttl(),
            shutdown.clone(),
        ));

        let services = Services {
            presence,
            bus,
            contacts: directory.clone(),
            groups: directory.clone(),
            messages: Arc::new(MemoryMessageStore::new()),
            generator: Arc::new(DisabledGenerator),
            ids: Arc::new(IdGenerator::new(machine_id)),
        };
        let router = Arc::new(Router::new(
            node.clone(),
            handle.clone(),
            services,
            RouterConfig {
                bot_name: config.bot.display_name.clone(),
            },
        ));

        info!(
            node = %node,
            machine_id,
            users = directory.user_count(),
            "Node started"
        );

        Ok(Arc::new(Self {
            config,
            node,
            machine_id,
            hub: handle,
            router,
            directory,
            otp,
            shutdown,
        }))
    }

    /// Per-session settings derived from the configuration.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            pong_timeout: self.config.heartbeat.pong_timeout(),
            inbox_capacity: self.config.limits.inbox_capacity,
            write_timeout: self.config.heartbeat.write_timeout(),
        }
    }
}

fn seed_directory(config: &Config) -> Result<MemoryDirectory> {
    let directory = MemoryDirectory::new();
    for user in &config.seed.users {
        directory.add_user(UserProfile::new(
            user.id.clone(),
            user.username.clone(),
            user.email.clone(),
        ));
    }
    for (a, b) in &config.seed.contacts {
        directory
            .add_contact(a, b)
            .with_context(|| format!("Invalid seed contact {a} <-> {b}"))?;
    }
    for group in &config.seed.groups {
        directory
            .add_group(&group.name, &group.members)
            .with_context(|| format!("Invalid seed group {}", group.name))?;
    }
    Ok(directory)
}

/// Clears online flags that were not refreshed in time and codes that were
/// never presented.
async fn prune_expired(
    presence: Arc<MemoryPresenceStore>,
    otp: Arc<MemoryOtpStore>,
    period: std::time::Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let expired = presence.prune_expired();
                if !expired.is_empty() {
                    debug!(count = expired.len(), "Pruned expired presence");
                }
                let codes = otp.prune_expired();
                if codes > 0 {
                    debug!(count = codes, "Pruned unused one-time codes");
                }
            }
        }
    }
}

/// Errors returned by the HTTP endpoints.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Server is at capacity")]
    AtCapacity,

    #[error(transparent)]
    Unauthorized(#[from] AuthError),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Directory unavailable: {0}")]
    Directory(String),

    #[error(transparent)]
    Hub(#[from] HubError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::AtCapacity | ApiError::Directory(_) | ApiError::Hub(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::UserNotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

impl From<DirectoryError> for ApiError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::UnknownUser(name) => ApiError::UserNotFound(name),
            other => ApiError::Directory(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Build the HTTP application.
pub fn app(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/otp", post(otp_handler))
        .route("/health", get(health_handler))
        .route("/sessions", get(sessions_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns an error if the node cannot start or the listener cannot bind.
pub async fn run_server(config: Config, shutdown: CancellationToken) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        }
    }

    let addr = config.bind_addr()?;
    let state = AppState::start(config, shutdown.clone()).await?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Parley server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, state.config.transport.websocket_path
    );

    serve(listener, state, shutdown).await
}

/// Serve on an already bound listener.
///
/// # Errors
///
/// Returns an error if accepting connections fails.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> Result<()> {
    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;

    info!("Server stopped");
    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "node": state.node.as_str(),
        "sessions": state.hub.live_count(),
    }))
}

/// Live sessions on this node.
async fn sessions_handler(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let sessions: Vec<Value> = state
        .hub
        .sessions()
        .await?
        .into_iter()
        .map(|s| json!({ "id": s.id, "username": s.username }))
        .collect();
    Ok(Json(json!({ "node": state.node.as_str(), "sessions": sessions })))
}

#[derive(Debug, Deserialize)]
pub struct OtpRequest {
    pub username: String,
}

/// Issue a one-time code for a known user.
async fn otp_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<OtpRequest>,
) -> Result<Json<Value>, ApiError> {
    let user = state.directory.resolve_user(&request.username).await?;
    let otp = state.otp.issue(&user.username);
    Ok(Json(json!({ "otp": otp })))
}

/// Query parameters of the WebSocket handshake.
#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    #[serde(default)]
    pub otp: String,
    #[serde(default)]
    pub username: String,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let user = authorize(&state, &params).await.map_err(|e| {
        warn!(remote = %addr, user = %params.username, error = %e, "Handshake rejected");
        e
    })?;

    debug!(remote = %addr, user = %user.username, "Handshake accepted");
    // Stop reading at the frame limit instead of buffering the whole message.
    let limit = state.config.limits.max_frame_size;
    Ok(ws
        .max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| handle_websocket(socket, addr, user, state))
        .into_response())
}

async fn authorize(state: &AppState, params: &ConnectParams) -> Result<UserProfile, ApiError> {
    if state.hub.live_count() >= state.config.limits.max_connections {
        record_handshake_rejected("capacity");
        return Err(ApiError::AtCapacity);
    }

    if let Err(e) = state.otp.verify(&params.otp, &params.username).await {
        record_handshake_rejected("otp");
        return Err(e.into());
    }

    match state.directory.resolve_user(&params.username).await {
        Ok(user) => Ok(user),
        Err(DirectoryError::UnknownUser(name)) => {
            record_handshake_rejected("unknown_user");
            Err(AuthError::UnknownUser(name).into())
        }
        Err(e) => Err(e.into()),
    }
}

/// Handle an upgraded WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    addr: SocketAddr,
    user: UserProfile,
    state: Arc<AppState>,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection =
        WebSocketConnection::new(socket, state.config.limits.max_frame_size).with_remote_addr(addr);
    let session = Session::new(
        user,
        Box::new(connection),
        state.hub.clone(),
        state.router.clone(),
        state.session_config(),
    );

    let outcome = session.run(state.shutdown.child_token()).await;
    debug!(
        remote = %addr,
        session = outcome.session_id,
        reason = %outcome.reason,
        "WebSocket disconnected"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SeedGroup, SeedUser};
    use futures_util::{SinkExt, StreamExt};
    use parley_protocol::Envelope;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::{self, Message};
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.port = 0;
        config.metrics.enabled = false;
        config.node.id = Some("chat-server-test".into());
        config.seed.users = vec![
            SeedUser {
                id: "1".into(),
                username: "alice".into(),
                email: "alice@example.com".into(),
            },
            SeedUser {
                id: "2".into(),
                username: "bob".into(),
                email: "bob@example.com".into(),
            },
        ];
        config.seed.contacts = vec![("alice".into(), "bob".into())];
        config.seed.groups = vec![SeedGroup {
            name: "rust".into(),
            members: vec!["alice".into(), "bob".into()],
        }];
        config
    }

    async fn spawn_server(config: Config) -> (SocketAddr, Arc<AppState>, CancellationToken) {
        let shutdown = CancellationToken::new();
        let state = AppState::start(config, shutdown.clone()).await.unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, Arc::clone(&state), shutdown.clone()));
        (addr, state, shutdown)
    }

    async fn connect(addr: SocketAddr, state: &AppState, username: &str) -> Client {
        let otp = state.otp.issue(username);
        let url = format!("ws://{addr}/ws?otp={otp}&username={username}");
        let (ws, _) = connect_async(url).await.unwrap();
        ws
    }

    async fn next_envelope(ws: &mut Client) -> Envelope {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("timed out waiting for message")
                .expect("connection closed")
                .unwrap();
            if let Message::Text(text) = message {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn next_chat(ws: &mut Client) -> Envelope {
        loop {
            let envelope = next_envelope(ws).await;
            if !matches!(envelope, Envelope::Presence(_)) {
                return envelope;
            }
        }
    }

    #[tokio::test]
    async fn test_valid_code_receives_contacts_presence() {
        let (addr, state, shutdown) = spawn_server(test_config()).await;
        let mut ws = connect(addr, &state, "alice").await;

        match next_envelope(&mut ws).await {
            Envelope::ContactsPresence(snapshot) => {
                assert_eq!(snapshot.contacts.len(), 1);
                assert_eq!(snapshot.contacts[0].contact.username, "bob");
                assert!(!snapshot.contacts[0].online);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(state.hub.live_count(), 1);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_invalid_code_is_rejected() {
        let (addr, state, shutdown) = spawn_server(test_config()).await;

        let url = format!("ws://{addr}/ws?otp=bogus&username=alice");
        match connect_async(url).await {
            Err(tungstenite::Error::Http(response)) => {
                assert_eq!(response.status().as_u16(), 401);
            }
            other => panic!("expected HTTP error, got {:?}", other.map(|_| ())),
        }

        // A code issued to someone else does not open alice's session.
        let otp = state.otp.issue("bob");
        let url = format!("ws://{addr}/ws?otp={otp}&username=alice");
        assert!(connect_async(url).await.is_err());
        assert_eq!(state.hub.live_count(), 0);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_capacity_limit_refuses_connection() {
        let mut config = test_config();
        config.limits.max_connections = 1;
        let (addr, state, shutdown) = spawn_server(config).await;

        let mut alice = connect(addr, &state, "alice").await;
        next_envelope(&mut alice).await;

        let otp = state.otp.issue("bob");
        let url = format!("ws://{addr}/ws?otp={otp}&username=bob");
        match connect_async(url).await {
            Err(tungstenite::Error::Http(response)) => {
                assert_eq!(response.status().as_u16(), 503);
            }
            other => panic!("expected HTTP error, got {:?}", other.map(|_| ())),
        }
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_private_chat_over_websocket() {
        let (addr, state, shutdown) = spawn_server(test_config()).await;
        let mut alice = connect(addr, &state, "alice").await;
        next_envelope(&mut alice).await;
        let mut bob = connect(addr, &state, "bob").await;
        next_envelope(&mut bob).await;

        let hello = serde_json::to_string(&Envelope::private_chat("", "bob", "hi bob")).unwrap();
        alice.send(Message::Text(hello)).await.unwrap();

        match next_chat(&mut bob).await {
            Envelope::PrivateChat(m) => {
                assert_eq!(m.sender, "alice");
                assert_eq!(m.content, "hi bob");
            }
            other => panic!("unexpected: {other:?}"),
        }
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_session() {
        let (addr, state, shutdown) = spawn_server(test_config()).await;
        let mut alice = connect(addr, &state, "alice").await;
        next_envelope(&mut alice).await;

        alice.send(Message::Text("not json".into())).await.unwrap();

        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match alice.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_oversized_message_closes_session() {
        let (addr, state, shutdown) = spawn_server(test_config()).await;
        let mut alice = connect(addr, &state, "alice").await;
        next_envelope(&mut alice).await;

        let content = "x".repeat(64 * 1024);
        let big = serde_json::to_string(&Envelope::private_chat("", "bob", content)).unwrap();
        // The server may hang up before the whole frame is written.
        let _ = alice.send(Message::Text(big)).await;

        let unregistered = tokio::time::timeout(Duration::from_secs(2), async {
            while state.hub.live_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(unregistered.is_ok());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_machine_id_from_config_or_node() {
        let mut config = test_config();
        config.node.machine_id = Some(7);
        let shutdown = CancellationToken::new();
        let state = AppState::start(config, shutdown.clone()).await.unwrap();
        assert_eq!(state.machine_id, 7);

        let state = AppState::start(test_config(), shutdown.clone())
            .await
            .unwrap();
        assert_eq!(state.machine_id, state.node.machine_id());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_health_reports_node() {
        let shutdown = CancellationToken::new();
        let state = AppState::start(test_config(), shutdown.clone())
            .await
            .unwrap();

        let Json(body) = health_handler(State(state)).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["node"], "chat-server-test");
        assert_eq!(body["sessions"], 0);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_otp_requires_known_user() {
        let shutdown = CancellationToken::new();
        let state = AppState::start(test_config(), shutdown.clone())
            .await
            .unwrap();

        let Json(body) = otp_handler(
            State(Arc::clone(&state)),
            Json(OtpRequest {
                username: "alice".into(),
            }),
        )
        .await
        .unwrap();
        assert!(body["otp"].as_str().is_some_and(|otp| !otp.is_empty()));
        assert_eq!(state.otp.pending(), 1);

        let err = otp_handler(
            State(Arc::clone(&state)),
            Json(OtpRequest {
                username: "mallory".into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_out_of_range_config_fails_startup() {
        let mut config = test_config();
        config.presence.online_ttl_ms = 0;
        assert!(AppState::start(config, CancellationToken::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_inconsistent_seed_fails_startup() {
        let mut config = test_config();
        config.seed.contacts.push(("alice".into(), "mallory".into()));
        assert!(AppState::start(config, CancellationToken::new())
            .await
            .is_err());
    }
}
