//! WebSocket listener and per-connection writer using tokio-tungstenite.
//!
//! The listener authenticates each upgrade through the [`HandshakeGate`]
//! and yields only connections that carry a verified principal.

use crate::handshake::{HandshakeGate, Principal};
use crate::relay::ConnectionHandle;
use courier_core::{CourierError, CourierResult};
use futures_util::{Sink, SinkExt};
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// An authenticated WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
    pub principal: Principal,
}

/// Upgrade settings with frames and messages capped at `max_frame_size`.
pub fn ws_config(max_frame_size: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_frame_size = Some(max_frame_size);
    config.max_message_size = Some(max_frame_size);
    config
}

/// Bind and start accepting.
///
/// Returns the bound address (useful with port 0) and a receiver that
/// yields authenticated connections. Dropping the receiver stops the
/// listener.
pub async fn start_listener(
    bind_addr: SocketAddr,
    gate: Arc<HandshakeGate>,
    config: WebSocketConfig,
) -> CourierResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| CourierError::Config(format!("bind {bind_addr} failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = tx.closed() => {
                    debug!("connection channel closed, listener stopping");
                    break;
                }
                accepted = tcp_listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    let gate = gate.clone();
                    let config = config.clone();
                    tokio::spawn(async move {
                        match gate.upgrade(stream, addr, config).await {
                            Ok((ws_stream, principal)) => {
                                debug!(remote = %addr, identity = %principal.identity, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                    principal,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(CourierError::TransportRead(e)) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                            Err(e) => {
                                info!(remote = %addr, error = %e, "upgrade rejected");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok((local_addr, rx))
}

/// Drain `rx` into `sink` until the handle closes or a write fails.
///
/// Queued frames are flushed before the close frame goes out. A
/// superseded connection is closed with a policy-violation code so the
/// client can tell it was replaced.
pub async fn write_loop<S>(mut sink: S, mut rx: mpsc::Receiver<String>, handle: Arc<ConnectionHandle>)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    loop {
        tokio::select! {
            biased;
            next = rx.recv() => match next {
                Some(text) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        warn!(connection = handle.id(), identity = %handle.identity(), error = %e, "write failed, closing connection");
                        handle.close();
                        return;
                    }
                }
                None => break,
            },
            _ = handle.closed() => {
                while let Ok(text) = rx.try_recv() {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        return;
                    }
                }
                break;
            }
        }
    }

    let frame = if handle.was_superseded() {
        CloseFrame {
            code: CloseCode::Policy,
            reason: "superseded by a newer connection".into(),
        }
    } else {
        CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        }
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
    let _ = sink.close().await;
}
