//! Connection lifecycle: the bearer-token gate in front of the upgrade.
//!
//! A connection moves through
//! `Unauthenticated -> Authenticated -> Registered -> Active -> Closed`.
//! Authentication happens inside the HTTP upgrade, so a rejected client
//! receives an HTTP error and never holds an open WebSocket.

use crate::auth::RateLimiter;
use courier_core::{token_fingerprint, CourierError, CourierResult, Identity, TokenKind, TokenService};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};

/// Where a connection is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unauthenticated,
    Authenticated,
    Registered,
    Active,
    Closed,
}

impl ConnectionState {
    /// Any state may close; otherwise states only move one step forward.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Unauthenticated, Authenticated)
                | (Authenticated, Registered)
                | (Registered, Active)
                | (Unauthenticated | Authenticated | Registered | Active, Closed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Unauthenticated => "unauthenticated",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::Registered => "registered",
            ConnectionState::Active => "active",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks one connection's state and enforces legal transitions.
#[derive(Debug)]
pub struct Lifecycle {
    state: ConnectionState,
    identity: Option<Identity>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Unauthenticated,
            identity: None,
        }
    }

    /// A lifecycle whose upgrade has already been authenticated.
    pub fn authenticated(identity: Identity) -> Self {
        Self {
            state: ConnectionState::Authenticated,
            identity: Some(identity),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity
    }

    pub fn authenticate(&mut self, identity: Identity) -> CourierResult<()> {
        self.advance(ConnectionState::Authenticated)?;
        self.identity = Some(identity);
        Ok(())
    }

    pub fn advance(&mut self, next: ConnectionState) -> CourierResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(CourierError::Other(format!(
                "illegal connection transition {} -> {}",
                self.state, next
            )));
        }
        debug!(identity = ?self.identity, from = %self.state, to = %next, "connection state");
        self.state = next;
        Ok(())
    }

    /// Move to `Closed` from wherever we are. Idempotent.
    pub fn close(&mut self) {
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Closed;
        }
    }
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub identity: Identity,
    pub role: String,
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
///
/// The value must be exactly two space-separated parts.
pub fn extract_bearer(header: &str) -> CourierResult<&str> {
    let mut parts = header.split(' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("Bearer"), Some(token), None) if !token.is_empty() => Ok(token),
        _ => Err(CourierError::AuthRejected(
            "authorization header must be 'Bearer <token>'".into(),
        )),
    }
}

/// Admission control and token validation for WebSocket upgrades.
pub struct HandshakeGate {
    tokens: Arc<TokenService>,
    limiter: Mutex<RateLimiter>,
}

impl HandshakeGate {
    pub fn new(tokens: Arc<TokenService>, max_upgrades_per_minute: u32) -> Self {
        Self {
            tokens,
            limiter: Mutex::new(RateLimiter::per_minute(max_upgrades_per_minute)),
        }
    }

    /// Authenticate an upgrade from its `Authorization` header value.
    pub fn authenticate(&self, authorization: Option<&str>) -> CourierResult<Principal> {
        let header = authorization
            .ok_or_else(|| CourierError::AuthRejected("missing authorization header".into()))?;
        let token = extract_bearer(header)?;
        let fingerprint = token_fingerprint(token);

        let claims = self.tokens.validate_claims(token).map_err(|e| {
            info!(token = %fingerprint, error = %e, "token rejected");
            CourierError::Token(e)
        })?;
        if claims.kind != TokenKind::Access {
            info!(token = %fingerprint, kind = claims.kind.as_str(), "non-access token presented");
            return Err(CourierError::AuthRejected(format!(
                "{} tokens cannot open a connection",
                claims.kind.as_str()
            )));
        }

        debug!(identity = %claims.user_id, token = %fingerprint, "token accepted");
        Ok(Principal {
            identity: claims.user_id,
            role: claims.role,
        })
    }

    /// Record an upgrade attempt from `ip`. `false` when rate limited.
    pub async fn admit(&self, ip: IpAddr) -> bool {
        self.limiter.lock().await.check_and_record(ip)
    }

    /// Forget idle rate-limit entries.
    pub async fn gc(&self) -> usize {
        self.limiter.lock().await.gc()
    }

    /// Perform the WebSocket upgrade, rejecting it with 401 or 429 unless
    /// the request carries a valid access token.
    pub async fn upgrade<S>(
        &self,
        stream: S,
        remote: SocketAddr,
        config: WebSocketConfig,
    ) -> CourierResult<(WebSocketStream<S>, Principal)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let admitted = self.admit(remote.ip()).await;
        let mut verdict: Option<CourierResult<Principal>> = None;

        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            if !admitted {
                verdict = Some(Err(CourierError::AuthRejected(format!(
                    "too many upgrade attempts from {}",
                    remote.ip()
                ))));
                return Err(reject(StatusCode::TOO_MANY_REQUESTS, "too many requests"));
            }
            let header = request
                .headers()
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok());
            match self.authenticate(header) {
                Ok(principal) => {
                    verdict = Some(Ok(principal));
                    Ok(response)
                }
                Err(e) => {
                    verdict = Some(Err(e));
                    Err(reject(StatusCode::UNAUTHORIZED, "unauthorized"))
                }
            }
        };

        let upgraded =
            tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(config)).await;

        match (upgraded, verdict) {
            (_, Some(Err(e))) => Err(e),
            (Ok(ws), Some(Ok(principal))) => Ok((ws, principal)),
            (Err(e), _) => Err(CourierError::TransportRead(format!(
                "websocket handshake failed: {e}"
            ))),
            (Ok(_), None) => Err(CourierError::AuthRejected(
                "upgrade completed without authentication".into(),
            )),
        }
    }
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}
