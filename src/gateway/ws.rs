//! WebSocket bridge.
//!
//! One upstream WebSocket per authenticated client, admitted only within
//! the per-user and per-tenant connection caps. Clients speak a JSON
//! control protocol (`welcome`, `subscribe`, `unsubscribe`, `proxy`,
//! `downstream`, `ping`/`pong`, `error`); `proxy` frames are forwarded to a
//! lazily-opened downstream WebSocket carrying the session's identity
//! headers, and downstream frames flow back as `downstream`.
//!
//! The registry is in-process: the node that owns the client owns its
//! downstream socket. Outbound writes that would block beyond the channel
//! bound close the connection with 1011; the idle reaper closes
//! connections with no activity inside the idle window; terminated
//! sessions cascade to 4401 closes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::WsConfig;
use crate::logout::TerminationHook;
use crate::metrics::Metrics;
use crate::ratelimit::{Limit, RateLimiter};
use crate::{Error, Result};

use super::middleware::Auth;
use super::proxy::IdentityContext;
use super::router::AppState;

/// Close code sent when a session is terminated server-side.
pub const CLOSE_SESSION_REVOKED: u16 = 4401;
/// Close code for backpressure overflow.
pub const CLOSE_OVERLOADED: u16 = 1011;

/// Bound on the per-connection outbound queue.
const OUTBOUND_QUEUE: usize = 64;

/// JSON control frames exchanged with the upstream client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlFrame {
    /// Sent once on connect.
    Welcome {
        /// Connection id.
        #[serde(rename = "connectionId")]
        connection_id: String,
        /// Server clock, ms since epoch.
        #[serde(rename = "serverTime")]
        server_time: i64,
        /// Safe user profile.
        user: Value,
    },
    /// Client requests a channel subscription.
    Subscribe {
        /// Channel name.
        channel: String,
    },
    /// Client drops a channel subscription.
    Unsubscribe {
        /// Channel name.
        channel: String,
    },
    /// Client payload forwarded to the downstream socket.
    Proxy {
        /// Arbitrary payload.
        payload: Value,
    },
    /// Frame received from the downstream socket.
    Downstream {
        /// Arbitrary payload.
        payload: Value,
    },
    /// Keepalive.
    Ping,
    /// Keepalive reply.
    Pong,
    /// Error notification.
    Error {
        /// Gateway error code.
        code: String,
        /// Human-readable message.
        message: String,
        /// Ms since epoch.
        timestamp: i64,
    },
}

impl ControlFrame {
    fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// One registered upstream connection.
pub struct ConnectionHandle {
    /// Connection id.
    pub id: String,
    /// Owning session.
    pub sid: String,
    /// User subject.
    pub sub: String,
    /// Tenant.
    pub tenant_id: String,
    /// Role claims (channel permission checks).
    pub roles: Vec<String>,
    tx: mpsc::Sender<ControlFrame>,
    close: watch::Sender<Option<u16>>,
    last_activity: Arc<AtomicI64>,
}

impl ConnectionHandle {
    /// Queue a frame; closes the connection with 1011 when the outbound
    /// queue is full (backpressure bound).
    pub fn send(&self, frame: ControlFrame) {
        if self.tx.try_send(frame).is_err() {
            warn!(connection = %self.id, "Outbound queue full, closing connection");
            let _ = self.close.send(Some(CLOSE_OVERLOADED));
        }
    }

    /// Request a close with `code`.
    pub fn close(&self, code: u16) {
        let _ = self.close.send(Some(code));
    }

    fn touch(&self) {
        self.last_activity
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}

/// Shared connection registry and channel index.
pub struct WsRegistry {
    config: WsConfig,
    connections: DashMap<String, Arc<ConnectionHandle>>,
    /// channel name → subscribed connection ids.
    channels: RwLock<HashMap<String, HashSet<String>>>,
    metrics: Arc<Metrics>,
}

impl WsRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(config: WsConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            connections: DashMap::new(),
            channels: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Admission control: per-user and per-tenant caps.
    pub fn check_connection_limit(&self, tenant_id: &str, sub: &str) -> Result<()> {
        let mut user_count = 0;
        let mut tenant_count = 0;
        for entry in &self.connections {
            let conn = entry.value();
            if conn.tenant_id == tenant_id {
                tenant_count += 1;
                if conn.sub == sub {
                    user_count += 1;
                }
            }
        }
        if user_count >= self.config.max_user_connections {
            return Err(Error::Forbidden("user connection limit reached".to_string()));
        }
        if tenant_count >= self.config.max_tenant_connections {
            return Err(Error::Forbidden(
                "tenant connection limit reached".to_string(),
            ));
        }
        Ok(())
    }

    fn register(&self, handle: Arc<ConnectionHandle>) {
        self.connections.insert(handle.id.clone(), handle);
        self.update_gauge();
    }

    fn unregister(&self, connection_id: &str) {
        self.connections.remove(connection_id);
        let mut channels = self.channels.write();
        for members in channels.values_mut() {
            members.remove(connection_id);
        }
        channels.retain(|_, members| !members.is_empty());
        self.update_gauge();
    }

    fn update_gauge(&self) {
        #[allow(clippy::cast_possible_wrap)]
        self.metrics.set_gauge(
            "keyfront_ws_connections",
            &vec![],
            self.connections.len() as i64,
        );
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Channel permission: `tenant:{own}:*`, `user:{self}`, `admin:*` for
    /// the `ADMIN` role, `public:*` for anyone.
    #[must_use]
    pub fn channel_allowed(handle: &ConnectionHandle, channel: &str) -> bool {
        if channel.starts_with("public:") {
            return true;
        }
        if let Some(rest) = channel.strip_prefix("tenant:") {
            return rest
                .strip_prefix(&handle.tenant_id)
                .is_some_and(|suffix| suffix.starts_with(':'));
        }
        if let Some(sub) = channel.strip_prefix("user:") {
            return sub == handle.sub;
        }
        if channel.starts_with("admin:") {
            return handle.roles.iter().any(|r| r == "ADMIN");
        }
        false
    }

    /// Subscribe `connection_id` to `channel` after a permission check.
    pub fn subscribe(&self, connection_id: &str, channel: &str) -> Result<()> {
        let Some(handle) = self.connections.get(connection_id) else {
            return Err(Error::Internal("unknown connection".to_string()));
        };
        if !Self::channel_allowed(&handle, channel) {
            return Err(Error::Forbidden(format!("channel {channel} denied")));
        }
        drop(handle);
        self.channels
            .write()
            .entry(channel.to_string())
            .or_default()
            .insert(connection_id.to_string());
        Ok(())
    }

    /// Drop a subscription.
    pub fn unsubscribe(&self, connection_id: &str, channel: &str) {
        let mut channels = self.channels.write();
        if let Some(members) = channels.get_mut(channel) {
            members.remove(connection_id);
            if members.is_empty() {
                channels.remove(channel);
            }
        }
    }

    /// Publish a frame to every member of `channel`.
    pub fn publish(&self, channel: &str, frame: &ControlFrame) -> usize {
        let members: Vec<String> = self
            .channels
            .read()
            .get(channel)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();

        let mut delivered = 0;
        for id in members {
            if let Some(handle) = self.connections.get(&id) {
                handle.send(frame.clone());
                delivered += 1;
            }
        }
        delivered
    }

    /// Close every connection belonging to the given sessions.
    pub async fn close_sessions(&self, sids: &[String], code: u16) {
        let targets: Vec<Arc<ConnectionHandle>> = self
            .connections
            .iter()
            .filter(|e| sids.contains(&e.value().sid))
            .map(|e| Arc::clone(e.value()))
            .collect();
        for handle in targets {
            debug!(connection = %handle.id, code, "Closing connection for terminated session");
            handle.close(code);
        }
    }

    /// Close connections idle beyond the configured window.
    pub fn reap_idle(&self) -> usize {
        #[allow(clippy::cast_possible_wrap)]
        let cutoff = chrono::Utc::now().timestamp_millis()
            - (self.config.idle_timeout_secs as i64) * 1000;
        let mut reaped = 0;
        for entry in &self.connections {
            let handle = entry.value();
            if handle.last_activity.load(Ordering::Relaxed) < cutoff {
                handle.close(1000);
                reaped += 1;
            }
        }
        reaped
    }
}

#[async_trait::async_trait]
impl TerminationHook for WsRegistry {
    async fn sessions_terminated(&self, sids: &[String]) {
        self.close_sessions(sids, CLOSE_SESSION_REVOKED).await;
    }
}

/// Spawn the registry's idle reaper.
pub fn spawn_idle_reaper(
    registry: Arc<WsRegistry>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = registry.reap_idle();
                    if reaped > 0 {
                        debug!(count = reaped, "Reaped idle WebSocket connections");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    });
}

/// `GET /api/ws` — authenticated upgrade into the bridge.
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Auth(ctx): Auth,
    upgrade: WebSocketUpgrade,
) -> Result<Response> {
    state
        .ws
        .check_connection_limit(&ctx.session.tenant_id, &ctx.session.sub)?;

    let Some(access_token) = state.sessions.access_token(&ctx.session).await? else {
        return Err(Error::SessionExpired);
    };
    let identity = IdentityContext {
        access_token,
        tenant_id: ctx.session.tenant_id.clone(),
        user_id: ctx.session.sub.clone(),
        roles: ctx.session.roles.clone(),
    };

    Ok(upgrade.on_upgrade(move |socket| run_connection(state, ctx, identity, socket)))
}

/// Drive one upstream connection to completion.
async fn run_connection(
    state: Arc<AppState>,
    ctx: super::middleware::AuthContext,
    identity: IdentityContext,
    socket: WebSocket,
) {
    let connection_id = Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::channel::<ControlFrame>(OUTBOUND_QUEUE);
    let (close_tx, mut close_rx) = watch::channel::<Option<u16>>(None);

    let handle = Arc::new(ConnectionHandle {
        id: connection_id.clone(),
        sid: ctx.sid.clone(),
        sub: ctx.session.sub.clone(),
        tenant_id: ctx.session.tenant_id.clone(),
        roles: ctx.session.roles.clone(),
        tx: tx.clone(),
        close: close_tx,
        last_activity: Arc::new(AtomicI64::new(chrono::Utc::now().timestamp_millis())),
    });
    state.ws.register(Arc::clone(&handle));

    handle.send(ControlFrame::Welcome {
        connection_id: connection_id.clone(),
        server_time: chrono::Utc::now().timestamp_millis(),
        user: serde_json::to_value(ctx.session.profile()).unwrap_or(Value::Null),
    });

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer: drains the outbound queue; a close request wins.
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = close_rx.changed() => {
                    let code = *close_rx.borrow();
                    if changed.is_err() || code.is_some() {
                        let code = code.unwrap_or(1000);
                        let _ = ws_tx
                            .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                                code,
                                reason: axum::extract::ws::Utf8Bytes::from_static("closed"),
                            })))
                            .await;
                        break;
                    }
                }
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    let Ok(text) = serde_json::to_string(&frame) else { continue };
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Keepalive: server pings on the configured interval.
    let ping_tx = tx.clone();
    let ping_interval = state.config.websocket.ping_interval_secs;
    let pinger = tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(ping_interval.max(1)));
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            ticker.tick().await;
            if ping_tx.send(ControlFrame::Ping).await.is_err() {
                break;
            }
        }
    });

    // Downstream socket, opened lazily on the first proxy frame.
    let mut downstream: Option<mpsc::Sender<String>> = None;
    let mut downstream_reader: Option<tokio::task::JoinHandle<()>> = None;

    // Per-user proxy frame limiter.
    let proxy_limit = Limit::new(
        format!("ws:proxy:{}:{}", handle.tenant_id, handle.sub),
        std::time::Duration::from_secs(60),
        state.config.websocket.proxy_messages_per_minute,
    );

    while let Some(message) = ws_rx.next().await {
        let Ok(message) = message else { break };
        handle.touch();

        match message {
            Message::Text(text) => {
                let frame: ControlFrame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        handle.send(ControlFrame::error(
                            "VALIDATION_FAILED",
                            format!("malformed frame: {e}"),
                        ));
                        continue;
                    }
                };
                handle_frame(
                    &state,
                    &handle,
                    frame,
                    &identity,
                    &proxy_limit,
                    &mut downstream,
                    &mut downstream_reader,
                    &tx,
                )
                .await;
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
        }
    }

    // Teardown: leave every channel, close the downstream socket.
    state.ws.unregister(&connection_id);
    drop(downstream);
    if let Some(reader) = downstream_reader {
        reader.abort();
    }
    pinger.abort();
    drop(tx);
    let _ = writer.await;
    debug!(connection = %connection_id, "Connection closed");
}

/// Dispatch one inbound control frame.
#[allow(clippy::too_many_arguments)]
async fn handle_frame(
    state: &Arc<AppState>,
    handle: &Arc<ConnectionHandle>,
    frame: ControlFrame,
    identity: &IdentityContext,
    proxy_limit: &Limit,
    downstream: &mut Option<mpsc::Sender<String>>,
    downstream_reader: &mut Option<tokio::task::JoinHandle<()>>,
    client_tx: &mpsc::Sender<ControlFrame>,
) {
    match frame {
        ControlFrame::Subscribe { channel } => {
            match state.ws.subscribe(&handle.id, &channel) {
                Ok(()) => debug!(connection = %handle.id, channel = %channel, "Subscribed"),
                Err(e) => handle.send(ControlFrame::error(e.code(), e.to_string())),
            }
        }
        ControlFrame::Unsubscribe { channel } => {
            state.ws.unsubscribe(&handle.id, &channel);
        }
        ControlFrame::Proxy { payload } => {
            let decision = state.limiter.check(proxy_limit).await;
            if !decision.allowed {
                handle.send(ControlFrame::error(
                    "RATE_LIMIT_EXCEEDED",
                    "proxy message rate exceeded",
                ));
                return;
            }

            if downstream.is_none() {
                match open_downstream(state, identity, client_tx.clone()).await {
                    Ok((sender, reader)) => {
                        *downstream = Some(sender);
                        *downstream_reader = Some(reader);
                    }
                    Err(e) => {
                        handle.send(ControlFrame::error("PROXY_FAILED", e.to_string()));
                        return;
                    }
                }
            }
            if let Some(sender) = downstream {
                let text = payload.to_string();
                if sender.send(text).await.is_err() {
                    // Downstream went away; drop it so the next frame reopens.
                    *downstream = None;
                    handle.send(ControlFrame::error("PROXY_FAILED", "downstream closed"));
                }
            }
        }
        ControlFrame::Ping => handle.send(ControlFrame::Pong),
        ControlFrame::Pong => {}
        // Server-only frames arriving from a client are protocol errors.
        ControlFrame::Welcome { .. } | ControlFrame::Downstream { .. } | ControlFrame::Error { .. } => {
            handle.send(ControlFrame::error(
                "VALIDATION_FAILED",
                "unexpected frame type",
            ));
        }
    }
}

/// Open the downstream WebSocket with identity headers; returns the writer
/// channel and the reader task.
async fn open_downstream(
    state: &Arc<AppState>,
    identity: &IdentityContext,
    client_tx: mpsc::Sender<ControlFrame>,
) -> Result<(mpsc::Sender<String>, tokio::task::JoinHandle<()>)> {
    let url = &state.config.downstream.ws_url;
    if url.is_empty() {
        return Err(Error::ProxyFailed("downstream WebSocket not configured".into()));
    }

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| Error::ProxyFailed(e.to_string()))?;
    let headers = request.headers_mut();
    let bearer = format!("Bearer {}", identity.access_token);
    if let Ok(v) = bearer.parse() {
        headers.insert("authorization", v);
    }
    if let Ok(v) = identity.tenant_id.parse() {
        headers.insert("x-tenant-id", v);
    }
    if let Ok(v) = identity.user_id.parse() {
        headers.insert("x-user-id", v);
    }
    if let Ok(v) = "true".parse() {
        headers.insert("x-keyfront-gateway", v);
    }

    let (socket, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| Error::ProxyFailed(e.to_string()))?;
    let (mut down_tx, mut down_rx) = socket.split();

    let (sender, mut receiver) = mpsc::channel::<String>(OUTBOUND_QUEUE);

    // Writer half: client proxy frames → downstream.
    tokio::spawn(async move {
        while let Some(text) = receiver.recv().await {
            if down_tx
                .send(tokio_tungstenite::tungstenite::Message::text(text))
                .await
                .is_err()
            {
                break;
            }
        }
        let _ = down_tx.close().await;
    });

    // Reader half: downstream frames → client as `downstream`.
    let reader = tokio::spawn(async move {
        while let Some(Ok(message)) = down_rx.next().await {
            if let tokio_tungstenite::tungstenite::Message::Text(text) = message {
                let payload = serde_json::from_str::<Value>(&text)
                    .unwrap_or_else(|_| Value::String(text.to_string()));
                if client_tx
                    .send(ControlFrame::Downstream { payload })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    });

    Ok((sender, reader))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WsConfig;
    use serde_json::json;

    fn registry() -> WsRegistry {
        WsRegistry::new(WsConfig::default(), Arc::new(Metrics::new()))
    }

    fn handle(id: &str, sid: &str, sub: &str, tenant: &str, roles: &[&str]) -> Arc<ConnectionHandle> {
        let (tx, rx) = mpsc::channel(8);
        std::mem::forget(rx); // keep the queue alive for send() tests
        let (close, _) = watch::channel(None);
        Arc::new(ConnectionHandle {
            id: id.to_string(),
            sid: sid.to_string(),
            sub: sub.to_string(),
            tenant_id: tenant.to_string(),
            roles: roles.iter().map(ToString::to_string).collect(),
            tx,
            close,
            last_activity: Arc::new(AtomicI64::new(chrono::Utc::now().timestamp_millis())),
        })
    }

    #[test]
    fn channel_permissions() {
        let user = handle("c1", "s1", "alice", "t1", &["USER"]);
        let admin = handle("c2", "s2", "root", "t1", &["ADMIN"]);

        // Own tenant broadcast
        assert!(WsRegistry::channel_allowed(&user, "tenant:t1:orders"));
        // Another tenant's broadcast
        assert!(!WsRegistry::channel_allowed(&user, "tenant:t2:orders"));
        // Prefix trickery must not leak tenant t1x into t1
        assert!(!WsRegistry::channel_allowed(&user, "tenant:t1x:orders"));
        // Own user channel
        assert!(WsRegistry::channel_allowed(&user, "user:alice"));
        assert!(!WsRegistry::channel_allowed(&user, "user:bob"));
        // Admin channels
        assert!(!WsRegistry::channel_allowed(&user, "admin:alerts"));
        assert!(WsRegistry::channel_allowed(&admin, "admin:alerts"));
        // Public channels
        assert!(WsRegistry::channel_allowed(&user, "public:status"));
        // Anything else is denied
        assert!(!WsRegistry::channel_allowed(&user, "internal:queue"));
    }

    #[test]
    fn connection_limits_per_user_and_tenant() {
        let mut config = WsConfig::default();
        config.max_user_connections = 2;
        config.max_tenant_connections = 3;
        let registry = WsRegistry::new(config, Arc::new(Metrics::new()));

        registry.register(handle("c1", "s1", "alice", "t1", &[]));
        registry.register(handle("c2", "s2", "alice", "t1", &[]));

        // Alice is at her cap; Bob still fits.
        assert!(registry.check_connection_limit("t1", "alice").is_err());
        assert!(registry.check_connection_limit("t1", "bob").is_ok());

        registry.register(handle("c3", "s3", "bob", "t1", &[]));
        // Tenant t1 is now full for everyone.
        assert!(registry.check_connection_limit("t1", "carol").is_err());
        // Another tenant is unaffected.
        assert!(registry.check_connection_limit("t2", "carol").is_ok());
    }

    #[test]
    fn subscribe_respects_permissions() {
        let registry = registry();
        registry.register(handle("c1", "s1", "alice", "t1", &["USER"]));

        assert!(registry.subscribe("c1", "public:status").is_ok());
        assert!(registry.subscribe("c1", "tenant:t2:orders").is_err());
    }

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let registry = registry();
        let (tx, mut rx) = mpsc::channel(8);
        let (close, _) = watch::channel(None);
        registry.register(Arc::new(ConnectionHandle {
            id: "c1".to_string(),
            sid: "s1".to_string(),
            sub: "alice".to_string(),
            tenant_id: "t1".to_string(),
            roles: vec![],
            tx,
            close,
            last_activity: Arc::new(AtomicI64::new(0)),
        }));
        registry.subscribe("c1", "public:status").unwrap();

        let delivered = registry.publish("public:status", &ControlFrame::Ping);
        assert_eq!(delivered, 1);
        assert_eq!(rx.recv().await, Some(ControlFrame::Ping));

        // Nobody on this channel.
        assert_eq!(registry.publish("public:other", &ControlFrame::Ping), 0);
    }

    #[tokio::test]
    async fn close_sessions_signals_matching_connections() {
        let registry = registry();
        let h1 = handle("c1", "sess-a", "alice", "t1", &[]);
        let h2 = handle("c2", "sess-b", "alice", "t1", &[]);
        let mut close_rx1 = h1.close.subscribe();
        let close_rx2 = h2.close.subscribe();
        registry.register(Arc::clone(&h1));
        registry.register(Arc::clone(&h2));

        registry
            .close_sessions(&["sess-a".to_string()], CLOSE_SESSION_REVOKED)
            .await;

        close_rx1.changed().await.unwrap();
        assert_eq!(*close_rx1.borrow(), Some(CLOSE_SESSION_REVOKED));
        assert_eq!(*close_rx2.borrow(), None);
    }

    #[test]
    fn unregister_cleans_channel_index() {
        let registry = registry();
        registry.register(handle("c1", "s1", "alice", "t1", &[]));
        registry.subscribe("c1", "public:status").unwrap();

        registry.unregister("c1");
        assert_eq!(registry.publish("public:status", &ControlFrame::Ping), 0);
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn backpressure_overflow_requests_close() {
        // GIVEN: a handle with a tiny queue and no reader
        let (tx, _rx) = mpsc::channel(1);
        let (close, close_rx) = watch::channel(None);
        let handle = ConnectionHandle {
            id: "c1".to_string(),
            sid: "s1".to_string(),
            sub: "alice".to_string(),
            tenant_id: "t1".to_string(),
            roles: vec![],
            tx,
            close,
            last_activity: Arc::new(AtomicI64::new(0)),
        };

        // WHEN: the queue overflows
        handle.send(ControlFrame::Ping);
        handle.send(ControlFrame::Ping);

        // THEN: the connection is asked to close with 1011
        assert_eq!(*close_rx.borrow(), Some(CLOSE_OVERLOADED));
    }

    #[test]
    fn idle_reaper_closes_stale_connections() {
        let registry = registry();
        let stale = handle("c1", "s1", "alice", "t1", &[]);
        stale.last_activity.store(0, Ordering::Relaxed); // long ago
        let close_rx = stale.close.subscribe();
        registry.register(stale);

        let fresh = handle("c2", "s2", "bob", "t1", &[]);
        let fresh_close = fresh.close.subscribe();
        registry.register(fresh);

        let reaped = registry.reap_idle();
        assert_eq!(reaped, 1);
        assert_eq!(*close_rx.borrow(), Some(1000));
        assert_eq!(*fresh_close.borrow(), None);
    }

    #[test]
    fn control_frames_serialize_with_type_tag() {
        let frame = ControlFrame::Welcome {
            connection_id: "c1".to_string(),
            server_time: 123,
            user: json!({"id": "alice"}),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "welcome");
        assert_eq!(value["connectionId"], "c1");

        let parsed: ControlFrame =
            serde_json::from_str(r#"{"type":"subscribe","channel":"public:a"}"#).unwrap();
        assert_eq!(
            parsed,
            ControlFrame::Subscribe {
                channel: "public:a".to_string()
            }
        );
    }
}
