//! Gateway server: accepts upgrades, authenticates, registers connections,
//! runs per-connection readers, and dispatches bus commands.

use std::sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
};

use {
    anyhow::Context,
    axum::{
        Router,
        extract::{
            State,
            ws::{Message, WebSocket, WebSocketUpgrade, close_code},
        },
        http::{HeaderMap, StatusCode, header::SEC_WEBSOCKET_PROTOCOL},
        response::{IntoResponse, Response},
        routing::get,
    },
    futures::stream::{SplitStream, StreamExt},
    tokio::{net::TcpListener, sync::mpsc},
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

use {
    wsbridge_auth::TokenValidator,
    wsbridge_bus::Bus,
    wsbridge_config::GatewayConfig,
    wsbridge_protocol::{
        AdminCommand, BusMessage, ConnectionId, DeviceId, EventMethod, EventParams, INPUT_CHANNEL,
        MessageType, OUTPUT_CHANNEL, UserId, pack_event,
    },
};

use crate::{
    commands,
    connection::{self, Connection, ConnectionInfo},
    registry::Registry,
};

/// Subprotocol prefix carrying the bearer token:
/// `Sec-WebSocket-Protocol: token, <JWT>`.
const TOKEN_PREFIX: &str = "token,";
/// Subprotocol echoed back in the upgrade response.
const TOKEN_PROTOCOL: &str = "token";

// ── Server ───────────────────────────────────────────────────────────────────

pub struct GatewayServer {
    config: GatewayConfig,
    bus: Arc<dyn Bus>,
    registry: Registry,
    validator: Option<TokenValidator>,
    last_connection_number: AtomicI64,
    shutdown: CancellationToken,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, bus: Arc<dyn Bus>) -> Arc<Self> {
        let validator = config
            .jwt_secret
            .as_deref()
            .map(|secret| TokenValidator::with_options(secret, config.jwt_validate_expiry));
        Arc::new(Self {
            config,
            bus,
            registry: Registry::new(),
            validator,
            last_connection_number: AtomicI64::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Ask the server to stop. `run` closes remaining connections and
    /// returns.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/", get(upgrade_handler))
            .with_state(Arc::clone(self))
    }

    /// Serve until shut down.
    ///
    /// Subscribes to the bus input channel before accepting traffic; a
    /// failure there leaves the process unhealthy and is propagated. On
    /// shutdown the listener stops and every remaining connection is closed
    /// with `1001` (going away).
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        let inbox = self
            .bus
            .subscribe(INPUT_CHANNEL)
            .await
            .context("subscribing to bus input channel")?;
        let dispatcher = Arc::clone(&self);
        tokio::spawn(async move { dispatcher.dispatch_commands(inbox).await });

        if let Some(max_connections) = self.config.max_connections {
            info!(max_connections, "advisory connection ceiling");
        }
        let addr = listener.local_addr().context("reading listener address")?;
        info!(%addr, "gateway listening");

        let closer = Arc::clone(&self);
        let shutdown = self.shutdown.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                // Close before axum waits for in-flight connections, so the
                // readers observe the close and the wait can finish.
                closer.close_all(close_code::AWAY, "GoingAway");
            })
            .await
            .context("serving websocket gateway")?;

        info!("gateway stopped");
        Ok(())
    }

    // ── Bus command dispatch ─────────────────────────────────────────────

    async fn dispatch_commands(self: Arc<Self>, mut inbox: mpsc::UnboundedReceiver<BusMessage>) {
        while let Some(message) = inbox.recv().await {
            match AdminCommand::decode(&message) {
                Ok(command) => commands::apply(&self.registry, command),
                Err(e) => error!(error = %e, "dropping bus command"),
            }
        }
        info!("bus command stream ended");
    }

    fn close_all(&self, code: u16, reason: &str) {
        self.registry.remove_if(
            |_| true,
            |removed| {
                for connection in removed {
                    connection.close(code, reason);
                }
                if !removed.is_empty() {
                    info!(closed = removed.len(), "closed remaining connections");
                }
            },
        );
    }

    // ── Handshake ────────────────────────────────────────────────────────

    fn next_connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.last_connection_number.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Authenticate an upgrade request from its subprotocol header.
    ///
    /// `Ok(None)` admits an anonymous connection; any policy violation is a
    /// plain 401 with an empty body.
    fn authenticate(
        &self,
        headers: &HeaderMap,
    ) -> Result<Option<(UserId, DeviceId)>, StatusCode> {
        let mut values = headers.get_all(SEC_WEBSOCKET_PROTOCOL).iter();
        let (Some(raw), None) = (values.next(), values.next()) else {
            return Err(StatusCode::UNAUTHORIZED);
        };
        let raw = raw.to_str().map_err(|_| StatusCode::UNAUTHORIZED)?;
        let Some(token) = raw.strip_prefix(TOKEN_PREFIX) else {
            return Err(StatusCode::UNAUTHORIZED);
        };
        let token = token.trim();

        let identity = match &self.validator {
            Some(validator) if !token.is_empty() => match validator.validate(token) {
                Ok((user_id, device_id)) => Some((user_id, device_id)),
                Err(e) => {
                    warn!(error = %e, "rejected handshake token");
                    return Err(StatusCode::UNAUTHORIZED);
                },
            },
            _ => None,
        };

        if self.config.only_authorized_requests && identity.is_none() {
            return Err(StatusCode::UNAUTHORIZED);
        }
        Ok(identity)
    }

    // ── Connection lifecycle ─────────────────────────────────────────────

    async fn handle_connection(
        self: Arc<Self>,
        socket: WebSocket,
        identity: Option<(UserId, DeviceId)>,
    ) {
        let id = self.next_connection_id();
        let (sink, stream) = socket.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(connection::write_loop(sink, outbound_rx));

        let conn = Arc::new(Connection::new(id, outbound));
        // Identity is bound before the connection becomes visible in the
        // registry, so the not-logged counter never drifts.
        if let Some((user_id, device_id)) = identity {
            if let Err(e) = conn.login(user_id, device_id) {
                warn!(conn_id = %id, error = %e, "handshake identity rejected");
            }
        }
        if let Err(e) = self.registry.add(Arc::clone(&conn)) {
            error!(conn_id = %id, error = %e, "failed to register connection");
            conn.close(close_code::ERROR, "ServerError");
            return;
        }

        let info = conn.info();
        info!(
            conn_id = %id,
            user_id = %info.user_id,
            device_id = %info.device_id,
            "connection registered"
        );

        self.publish_event(EventMethod::Connect, &info, MessageType::Text, Vec::new())
            .await;
        self.sweep_stale_anonymous();
        self.read_loop(&conn, stream).await;
    }

    /// The connection's only reader. Every frame becomes a bus envelope, in
    /// read order.
    async fn read_loop(&self, conn: &Arc<Connection>, mut stream: SplitStream<WebSocket>) {
        loop {
            let Some(message) = stream.next().await else {
                break;
            };
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    debug!(conn_id = %conn.info().id, error = %e, "socket read failed");
                    conn.close(close_code::ERROR, "ServerError");
                    break;
                },
            };

            conn.touch_last_ping();
            match message {
                Message::Text(text) => {
                    let info = conn.info();
                    self.publish_event(
                        EventMethod::TextMessage,
                        &info,
                        MessageType::Text,
                        text.as_str().as_bytes().to_vec(),
                    )
                    .await;
                },
                Message::Binary(body) => {
                    let info = conn.info();
                    self.publish_event(
                        EventMethod::BinaryMessage,
                        &info,
                        MessageType::Binary,
                        body.to_vec(),
                    )
                    .await;
                },
                Message::Close(_) => break,
                // axum answers pings itself; both directions only feed the
                // activity clock.
                Message::Ping(_) | Message::Pong(_) => {},
            }
        }
        self.finish_connection(conn).await;
    }

    /// Runs once per reader exit. Admin commands and the sweeper remove
    /// connections themselves; the tombstone suppresses a second removal and
    /// the `onClose` envelope for those paths.
    async fn finish_connection(&self, conn: &Arc<Connection>) {
        let info = conn.info();
        if info.id.is_tombstone() {
            return;
        }
        if !self.registry.remove(conn) {
            return;
        }
        self.publish_event(EventMethod::Close, &info, MessageType::Text, Vec::new())
            .await;
        info!(conn_id = %info.id, "connection closed");
    }

    // ── Admission sweeper ────────────────────────────────────────────────

    /// Cull anonymous connections that have outstayed the auth grace window.
    /// Runs synchronously after each successful upgrade, only once the
    /// anonymous count crosses the configured threshold.
    fn sweep_stale_anonymous(&self) {
        let stats = self.registry.stats();
        if stats.not_logged <= self.config.sweep_not_logged_threshold {
            return;
        }
        let min_age = self.config.sweep_min_age;
        let mut culled = 0;
        self.registry.remove_if(
            |conn| !conn.is_logged_in() && conn.age() > min_age,
            |removed| {
                culled = removed.len();
                for conn in removed {
                    conn.close(close_code::POLICY, "Auth");
                }
            },
        );
        if culled > 0 {
            info!(
                culled,
                not_logged = stats.not_logged,
                "swept stale anonymous connections"
            );
        }
    }

    // ── Outbound envelopes ───────────────────────────────────────────────

    async fn publish_event(
        &self,
        method: EventMethod,
        info: &ConnectionInfo,
        message_type: MessageType,
        body: Vec<u8>,
    ) {
        let user_id = (!info.user_id.is_unknown()).then_some(&info.user_id);
        let device_id = (!info.device_id.is_unknown()).then_some(&info.device_id);
        let params = EventParams::now(user_id, device_id, message_type, body);
        let message = match pack_event(method, &params) {
            Ok(message) => message,
            Err(e) => {
                warn!(method = %method, error = %e, "failed to encode envelope");
                return;
            },
        };
        // At-most-once: a publish failure drops the event.
        if let Err(e) = self.bus.publish(OUTPUT_CHANNEL, message).await {
            warn!(method = %method, error = %e, "bus publish failed; event dropped");
        }
    }
}

// ── Upgrade handler ──────────────────────────────────────────────────────────

async fn upgrade_handler(
    State(gateway): State<Arc<GatewayServer>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if gateway.config.dev {
        info!(headers = ?headers, "upgrade request");
    }

    let identity = match gateway.authenticate(&headers) {
        Ok(identity) => identity,
        Err(status) => return status.into_response(),
    };

    let max_frame_bytes = gateway.config.max_frame_bytes;
    ws.protocols([TOKEN_PROTOCOL])
        .max_message_size(max_frame_bytes)
        .max_frame_size(max_frame_bytes)
        .on_upgrade(move |socket| gateway.handle_connection(socket, identity))
        .into_response()
}
