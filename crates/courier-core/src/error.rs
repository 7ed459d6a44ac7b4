use thiserror::Error;

use crate::identity::Identity;

/// Errors produced by the courier protocol layer.
#[derive(Debug, Error)]
pub enum CourierError {
    #[error("authorization rejected: {0}")]
    AuthRejected(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("receiver not connected: {0}")]
    RouteMiss(Identity),

    #[error("transport write failed: {0}")]
    TransportWrite(String),

    #[error("transport read failed: {0}")]
    TransportRead(String),

    #[error("token error: {0}")]
    Token(#[from] TokenError),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Session-credential failures. Each variant maps to a distinct client-facing
/// outcome even when the transport reports them with the same status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("token expired")]
    Expired,

    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("token signature mismatch")]
    SignatureMismatch,

    #[error("unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("token signing failed: {0}")]
    Signing(String),

    #[error("expected a {expected} token, got {actual}")]
    WrongKind { expected: String, actual: String },

    #[error("reset token is invalid or has been superseded")]
    ResetTokenInvalid,
}

impl From<serde_json::Error> for CourierError {
    fn from(e: serde_json::Error) -> Self {
        CourierError::Decode(e.to_string())
    }
}

pub type CourierResult<T> = Result<T, CourierError>;
