//! Core server: accept loop, per-connection tasks, periodic GC.

use crate::config::ServerConfig;
use crate::handshake::{ConnectionState, HandshakeGate, Lifecycle};
use crate::relay::{ConnectionHandle, ConnectionRegistry, DeliveryTracker, MessageRouter};
use crate::transport::websocket::{self, WebSocketConnection};
use courier_core::{
    CourierError, CourierResult, PassthroughCipher, PayloadCipher, SealedCipher, TokenService,
};
use futures_util::{Stream, StreamExt};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

const GC_INTERVAL: Duration = Duration::from_secs(60);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a connection's read loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CloseReason {
    ClientClosed,
    Superseded,
    ServerClosed,
    ReadError(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ClientClosed => f.write_str("client closed"),
            CloseReason::Superseded => f.write_str("superseded"),
            CloseReason::ServerClosed => f.write_str("closed by server"),
            CloseReason::ReadError(e) => write!(f, "read error: {e}"),
        }
    }
}

/// The relay server.
pub struct CourierServer {
    config: ServerConfig,
    gate: Arc<HandshakeGate>,
    registry: Arc<ConnectionRegistry>,
    deliveries: Arc<DeliveryTracker>,
    router: Arc<MessageRouter>,
    next_conn_id: AtomicU64,
    /// Broadcast sender for server shutdown notification.
    shutdown_tx: broadcast::Sender<()>,
}

impl CourierServer {
    pub fn new(config: ServerConfig, tokens: Arc<TokenService>) -> CourierResult<Self> {
        let cipher: Arc<dyn PayloadCipher> = if config.encrypt_payloads {
            info!("payload encryption enabled");
            Arc::new(SealedCipher::generate()?)
        } else {
            Arc::new(PassthroughCipher)
        };

        let registry = Arc::new(ConnectionRegistry::new());
        let deliveries = Arc::new(DeliveryTracker::with_max_records(config.max_tracked_messages));
        let router = MessageRouter::new(registry.clone(), deliveries.clone(), cipher)
            .with_undeliverable_notices(config.notify_undeliverable);

        Ok(Self {
            gate: Arc::new(HandshakeGate::new(tokens, config.max_handshakes_per_minute)),
            registry,
            deliveries,
            router: Arc::new(router),
            next_conn_id: AtomicU64::new(1),
            shutdown_tx: broadcast::channel(1).0,
            config,
        })
    }

    /// Sender that stops the server when signalled.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    /// Bind the listener and spawn the accept loop.
    pub async fn start(self) -> CourierResult<(SocketAddr, JoinHandle<CourierResult<()>>)> {
        let (local_addr, conn_rx) = websocket::start_listener(
            self.config.bind_addr,
            self.gate.clone(),
            websocket::ws_config(self.config.max_frame_size),
        )
        .await?;

        info!(
            addr = %local_addr,
            encrypt_payloads = self.config.encrypt_payloads,
            notify_undeliverable = self.config.notify_undeliverable,
            "courier-server ready"
        );

        let server = Arc::new(self);
        Ok((local_addr, tokio::spawn(server.serve(conn_rx))))
    }

    /// Run until shutdown.
    pub async fn run(self) -> CourierResult<()> {
        let (_, task) = self.start().await?;
        task.await
            .map_err(|e| CourierError::Other(format!("server task failed: {e}")))?
    }

    async fn serve(
        self: Arc<Self>,
        mut conn_rx: mpsc::Receiver<WebSocketConnection>,
    ) -> CourierResult<()> {
        self.spawn_gc();

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("shutdown requested, no longer accepting connections");
                    break;
                }
                conn = conn_rx.recv() => match conn {
                    Some(conn) => {
                        let srv = self.clone();
                        tokio::spawn(async move { srv.handle_connection(conn).await });
                    }
                    None => {
                        info!("listener closed, shutting down");
                        break;
                    }
                },
            }
        }

        drop(conn_rx);
        let _ = self.shutdown_tx.send(());
        self.drain().await;
        Ok(())
    }

    fn spawn_gc(&self) {
        let gate = self.gate.clone();
        let deliveries = self.deliveries.clone();
        let receipt_ttl = self.config.receipt_ttl;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(GC_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let limits = gate.gc().await;
                        let receipts = deliveries.gc(receipt_ttl);
                        debug!(limits, receipts, "GC pass complete");
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    /// Close every live connection and wait briefly for them to unregister.
    async fn drain(&self) {
        let handles = self.registry.handles();
        info!(connections = handles.len(), "closing connections");
        for handle in handles {
            handle.close();
        }

        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while !self.registry.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        if !self.registry.is_empty() {
            warn!(remaining = self.registry.len(), "connections still open after drain timeout");
        }
    }

    async fn handle_connection(&self, conn: WebSocketConnection) {
        let WebSocketConnection {
            ws_stream,
            remote_addr,
            principal,
        } = conn;
        let identity = principal.identity;
        let mut lifecycle = Lifecycle::authenticated(identity);

        let (sink, stream) = ws_stream.split();
        let (tx, rx) = mpsc::channel(self.config.outbound_buffer);
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(ConnectionHandle::new(conn_id, identity, tx));

        info!(
            connection = conn_id,
            identity = %identity,
            role = %principal.role,
            remote = %remote_addr,
            "client connected"
        );

        self.registry.put(handle.clone());
        let writer = tokio::spawn(websocket::write_loop(sink, rx, handle.clone()));

        let reason = match lifecycle
            .advance(ConnectionState::Registered)
            .and_then(|()| lifecycle.advance(ConnectionState::Active))
        {
            Ok(()) => self.read_loop(stream, &handle).await,
            Err(e) => CloseReason::ReadError(e.to_string()),
        };

        lifecycle.close();
        self.registry.release(&handle);
        handle.close();
        let _ = writer.await;

        info!(
            connection = conn_id,
            identity = %identity,
            reason = %reason,
            dropped_frames = handle.dropped_count(),
            duration_secs = handle.age().as_secs(),
            "client disconnected"
        );
    }

    /// Read frames until the peer goes away or the handle is closed.
    async fn read_loop<S>(&self, mut stream: S, handle: &ConnectionHandle) -> CloseReason
    where
        S: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        loop {
            tokio::select! {
                _ = handle.closed() => {
                    return if handle.was_superseded() {
                        CloseReason::Superseded
                    } else {
                        CloseReason::ServerClosed
                    };
                }
                next = stream.next() => match next {
                    Some(Ok(Message::Text(text))) => {
                        self.router.route(handle, text.as_str());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!(connection = handle.id(), len = data.len(), "binary frame ignored");
                    }
                    Some(Ok(Message::Close(_))) | None => return CloseReason::ClientClosed,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(connection = handle.id(), error = %e, "read failed");
                        return CloseReason::ReadError(e.to_string());
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::Identity;
    use futures_util::SinkExt;
    use serde_json::{json, Value};
    use tokio::net::TcpStream;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
    use tokio_tungstenite::tungstenite::http::StatusCode;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct TestServer {
        addr: SocketAddr,
        tokens: Arc<TokenService>,
        registry: Arc<ConnectionRegistry>,
        shutdown: broadcast::Sender<()>,
        task: JoinHandle<CourierResult<()>>,
    }

    fn test_config() -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            max_frame_size: 64 * 1024,
            outbound_buffer: 32,
            jwt_secret: Some(b"server-test-secret".to_vec()),
            access_ttl: Duration::from_secs(900),
            refresh_ttl: Duration::from_secs(3600),
            reset_ttl: Duration::from_secs(3600),
            max_handshakes_per_minute: 0,
            encrypt_payloads: false,
            notify_undeliverable: false,
            receipt_ttl: Duration::from_secs(60),
            max_tracked_messages: 1000,
        }
    }

    async fn spawn_server(config: ServerConfig) -> TestServer {
        let tokens = Arc::new(config.token_service().unwrap());
        let server = CourierServer::new(config, tokens.clone()).unwrap();
        let registry = server.registry();
        let shutdown = server.shutdown_handle();
        let (addr, task) = server.start().await.unwrap();
        TestServer {
            addr,
            tokens,
            registry,
            shutdown,
            task,
        }
    }

    impl TestServer {
        fn token_for(&self, identity: Identity) -> String {
            self.tokens
                .issue(identity, "user", Duration::from_secs(60))
                .unwrap()
        }

        async fn connect_raw(&self, authorization: Option<String>) -> Result<Client, WsError> {
            let mut request = format!("ws://{}/ws", self.addr).into_client_request()?;
            if let Some(value) = authorization {
                request
                    .headers_mut()
                    .insert(AUTHORIZATION, value.parse().unwrap());
            }
            tokio_tungstenite::connect_async(request)
                .await
                .map(|(ws, _)| ws)
        }

        async fn connect(&self, identity: Identity) -> Client {
            let token = self.token_for(identity);
            let ws = self
                .connect_raw(Some(format!("Bearer {token}")))
                .await
                .expect("upgrade failed");
            self.wait_until(|registry| {
                registry
                    .get(&identity)
                    .is_some_and(|handle| !handle.is_closed())
            })
            .await;
            ws
        }

        async fn wait_until(&self, condition: impl Fn(&ConnectionRegistry) -> bool) {
            timeout(Duration::from_secs(5), async {
                while !condition(&self.registry) {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .expect("condition not reached in time");
        }
    }

    async fn next_message(ws: &mut Client) -> Message {
        timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("read error")
    }

    async fn next_json(ws: &mut Client) -> Value {
        loop {
            if let Message::Text(text) = next_message(ws).await {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn next_close_code(ws: &mut Client) -> Option<CloseCode> {
        loop {
            match timeout(Duration::from_secs(5), ws.next()).await.expect("timed out") {
                Some(Ok(Message::Close(frame))) => return frame.map(|f| f.code),
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return None,
            }
        }
    }

    async fn send_json(ws: &mut Client, value: Value) {
        ws.send(Message::Text(value.to_string().into())).await.unwrap();
    }

    fn rejected_status(result: Result<Client, WsError>) -> StatusCode {
        match result {
            Err(WsError::Http(response)) => response.status(),
            Err(other) => panic!("expected HTTP rejection, got {other}"),
            Ok(_) => panic!("expected HTTP rejection, upgrade succeeded"),
        }
    }

    #[tokio::test]
    async fn message_is_relayed_and_acknowledged() {
        let server = spawn_server(test_config()).await;
        let (a, b) = (Identity::new_v4(), Identity::new_v4());
        let mut alice = server.connect(a).await;
        let mut bob = server.connect(b).await;

        send_json(
            &mut alice,
            json!({"type": "message", "receiver_id": b, "content": "hello bob"}),
        )
        .await;

        let delivered = next_json(&mut bob).await;
        assert_eq!(delivered["type"], "message");
        assert_eq!(delivered["content"], "hello bob");
        assert_eq!(delivered["sender_id"], a.to_string());
        assert_eq!(delivered["status"], "sent");

        let ack = next_json(&mut alice).await;
        assert_eq!(ack["type"], "ack");
        assert_eq!(ack["id"], delivered["id"]);
        assert_eq!(ack["status"], "sent");

        send_json(
            &mut bob,
            json!({"type": "ack", "id": delivered["id"], "receiver_id": a, "status": "read"}),
        )
        .await;
        let receipt = next_json(&mut alice).await;
        assert_eq!(receipt["status"], "read");
        assert_eq!(receipt["sender_id"], b.to_string());
    }

    #[tokio::test]
    async fn call_signal_arrives_verbatim() {
        let server = spawn_server(test_config()).await;
        let (a, b) = (Identity::new_v4(), Identity::new_v4());
        let mut alice = server.connect(a).await;
        let mut bob = server.connect(b).await;

        let raw = format!(r#"{{"type":"call","sender_id":"{a}","receiver_id":"{b}","sdp":"v=0"}}"#);
        alice.send(Message::Text(raw.clone().into())).await.unwrap();

        match next_message(&mut bob).await {
            Message::Text(text) => assert_eq!(text.as_str(), raw),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn garbage_frames_do_not_close_the_connection() {
        let server = spawn_server(test_config()).await;
        let (a, b) = (Identity::new_v4(), Identity::new_v4());
        let mut alice = server.connect(a).await;
        let mut bob = server.connect(b).await;

        alice.send(Message::Text("not json".into())).await.unwrap();
        send_json(&mut alice, json!({"type": "typing", "receiver_id": b})).await;
        send_json(
            &mut alice,
            json!({"type": "message", "receiver_id": b, "content": "after garbage"}),
        )
        .await;

        assert_eq!(next_json(&mut bob).await["content"], "after garbage");
    }

    #[tokio::test]
    async fn upgrade_without_valid_token_is_unauthorized() {
        let server = spawn_server(test_config()).await;

        assert_eq!(
            rejected_status(server.connect_raw(None).await),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            rejected_status(server.connect_raw(Some("Bearer nope".into())).await),
            StatusCode::UNAUTHORIZED
        );

        let foreign = TokenService::new(b"another-secret")
            .issue(Identity::new_v4(), "user", Duration::from_secs(60))
            .unwrap();
        assert_eq!(
            rejected_status(server.connect_raw(Some(format!("Bearer {foreign}"))).await),
            StatusCode::UNAUTHORIZED
        );
        assert!(server.registry.is_empty());
    }

    #[tokio::test]
    async fn upgrades_are_rate_limited() {
        let mut config = test_config();
        config.max_handshakes_per_minute = 1;
        let server = spawn_server(config).await;

        let _first = server.connect(Identity::new_v4()).await;
        let token = server.token_for(Identity::new_v4());
        assert_eq!(
            rejected_status(server.connect_raw(Some(format!("Bearer {token}"))).await),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[tokio::test]
    async fn newer_connection_supersedes_older() {
        let server = spawn_server(test_config()).await;
        let (a, b) = (Identity::new_v4(), Identity::new_v4());
        let mut first = server.connect(a).await;
        let first_id = server.registry.get(&a).unwrap().id();

        let token = server.token_for(a);
        let mut second = server
            .connect_raw(Some(format!("Bearer {token}")))
            .await
            .expect("upgrade failed");
        server
            .wait_until(|registry| registry.get(&a).is_some_and(|h| h.id() != first_id))
            .await;
        assert_eq!(next_close_code(&mut first).await, Some(CloseCode::Policy));

        let mut bob = server.connect(b).await;
        send_json(
            &mut bob,
            json!({"type": "message", "receiver_id": a, "content": "to the new one"}),
        )
        .await;
        assert_eq!(next_json(&mut second).await["content"], "to the new one");
        assert_eq!(server.registry.len(), 2);
    }

    #[tokio::test]
    async fn disconnect_releases_registration() {
        let server = spawn_server(test_config()).await;
        let a = Identity::new_v4();
        let mut alice = server.connect(a).await;
        alice.close(None).await.unwrap();

        server.wait_until(|registry| registry.get(&a).is_none()).await;
    }

    #[tokio::test]
    async fn offline_receiver_gets_nothing_and_sender_stays_connected() {
        let server = spawn_server(test_config()).await;
        let a = Identity::new_v4();
        let mut alice = server.connect(a).await;

        send_json(
            &mut alice,
            json!({"type": "message", "receiver_id": Identity::new_v4(), "content": "void"}),
        )
        .await;
        assert!(timeout(Duration::from_millis(200), alice.next()).await.is_err());
        assert!(server.registry.get(&a).is_some());
    }

    #[tokio::test]
    async fn shutdown_closes_clients_and_stops() {
        let server = spawn_server(test_config()).await;
        let mut alice = server.connect(Identity::new_v4()).await;

        server.shutdown.send(()).unwrap();
        assert_eq!(next_close_code(&mut alice).await, Some(CloseCode::Normal));
        timeout(Duration::from_secs(5), server.task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}
