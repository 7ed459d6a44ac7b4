//! Signed session credentials (HS256 JWT).
//!
//! Claims: `{user_id, role, exp, iat, jti, kind}`. The signing algorithm is
//! fixed; a token whose header names any other algorithm is rejected before
//! signature verification is attempted.

use crate::error::{CourierError, CourierResult, TokenError};
use crate::identity::Identity;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::time::Duration;
use uuid::Uuid;

/// Access tokens live 15 minutes.
pub const ACCESS_TTL: Duration = Duration::from_secs(15 * 60);
/// Refresh tokens live 7 days.
pub const REFRESH_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// Password-reset tokens live 1 hour.
pub const RESET_TTL: Duration = Duration::from_secs(60 * 60);

const SIGNING_ALGORITHM: Algorithm = Algorithm::HS256;
const SIGNING_ALGORITHM_NAME: &str = "HS256";

/// What a token may be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
    Reset,
}

impl TokenKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenKind::Access => "access",
            TokenKind::Refresh => "refresh",
            TokenKind::Reset => "reset",
        }
    }
}

impl std::str::FromStr for TokenKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "access" => Ok(TokenKind::Access),
            "refresh" => Ok(TokenKind::Refresh),
            "reset" => Ok(TokenKind::Reset),
            other => Err(format!("unknown token kind: {other}")),
        }
    }
}

// Tokens minted before `kind` existed carry none; treat them as access tokens.
fn default_kind() -> TokenKind {
    TokenKind::Access
}

/// JWT claim set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: Identity,
    pub role: String,
    pub exp: i64,
    pub iat: i64,
    pub jti: String,
    #[serde(default = "default_kind")]
    pub kind: TokenKind,
}

/// Access + refresh token pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

/// A token together with its expiry instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RawHeader {
    alg: String,
}

/// Issues, validates and refreshes session credentials. Stateless.
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    access_ttl: Duration,
    refresh_ttl: Duration,
    reset_ttl: Duration,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .field("reset_ttl", &self.reset_ttl)
            .finish_non_exhaustive()
    }
}

impl TokenService {
    /// Create a service signing with `secret` and the default lifetimes.
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(SIGNING_ALGORITHM);
        // Expiry is checked against our own clock so `exp == now` is already expired.
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.required_spec_claims = HashSet::from(["exp".to_string()]);

        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            access_ttl: ACCESS_TTL,
            refresh_ttl: REFRESH_TTL,
            reset_ttl: RESET_TTL,
        }
    }

    /// Override the token lifetimes.
    pub fn with_ttls(mut self, access: Duration, refresh: Duration, reset: Duration) -> Self {
        self.access_ttl = access;
        self.refresh_ttl = refresh;
        self.reset_ttl = reset;
        self
    }

    pub fn reset_ttl(&self) -> Duration {
        self.reset_ttl
    }

    /// Configured lifetime for tokens of `kind`.
    pub fn ttl_for(&self, kind: TokenKind) -> Duration {
        match kind {
            TokenKind::Access => self.access_ttl,
            TokenKind::Refresh => self.refresh_ttl,
            TokenKind::Reset => self.reset_ttl,
        }
    }

    /// Issue an access token valid for `ttl`.
    pub fn issue(&self, identity: Identity, role: &str, ttl: Duration) -> Result<String, TokenError> {
        self.issue_kind(identity, role, TokenKind::Access, ttl)
    }

    /// Issue a token of a given kind valid for `ttl`.
    pub fn issue_kind(
        &self,
        identity: Identity,
        role: &str,
        kind: TokenKind,
        ttl: Duration,
    ) -> Result<String, TokenError> {
        self.issue_at(identity, role, kind, ttl, Utc::now().timestamp())
            .map(|issued| issued.token)
    }

    fn issue_at(
        &self,
        identity: Identity,
        role: &str,
        kind: TokenKind,
        ttl: Duration,
        now: i64,
    ) -> Result<IssuedToken, TokenError> {
        let ttl_secs = i64::try_from(ttl.as_secs())
            .map_err(|_| TokenError::Signing("ttl out of range".into()))?;
        let exp = now.saturating_add(ttl_secs);
        let claims = Claims {
            user_id: identity,
            role: role.to_string(),
            exp,
            iat: now,
            jti: Uuid::new_v4().to_string(),
            kind,
        };

        let token = jsonwebtoken::encode(&Header::new(SIGNING_ALGORITHM), &claims, &self.encoding_key)
            .map_err(|e| TokenError::Signing(e.to_string()))?;
        let expires_at = Utc
            .timestamp_opt(exp, 0)
            .single()
            .ok_or_else(|| TokenError::Signing("expiry out of range".into()))?;
        Ok(IssuedToken { token, expires_at })
    }

    /// Issue a 15-minute access token and a 7-day refresh token.
    pub fn issue_pair(&self, identity: Identity, role: &str) -> Result<TokenPair, TokenError> {
        Ok(TokenPair {
            access: self.issue_kind(identity, role, TokenKind::Access, self.access_ttl)?,
            refresh: self.issue_kind(identity, role, TokenKind::Refresh, self.refresh_ttl)?,
        })
    }

    /// Issue a 1-hour password-reset token.
    ///
    /// The caller must persist the token value and expiry against the
    /// identity, overwriting any earlier one (see [`crate::reset::ResetTokens`]).
    pub fn issue_reset_token(&self, identity: Identity, role: &str) -> Result<IssuedToken, TokenError> {
        self.issue_at(identity, role, TokenKind::Reset, self.reset_ttl, Utc::now().timestamp())
    }

    /// Validate a token and return `(identity, role)`.
    pub fn validate(&self, token: &str) -> Result<(Identity, String), TokenError> {
        let claims = self.validate_claims(token)?;
        Ok((claims.user_id, claims.role))
    }

    /// Validate a token and return its full claim set.
    pub fn validate_claims(&self, token: &str) -> Result<Claims, TokenError> {
        self.validate_claims_at(token, Utc::now().timestamp())
    }

    fn validate_claims_at(&self, token: &str, now: i64) -> Result<Claims, TokenError> {
        let alg = header_algorithm(token)?;
        if alg != SIGNING_ALGORITHM_NAME {
            return Err(TokenError::UnsupportedAlgorithm(alg));
        }

        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature => TokenError::SignatureMismatch,
                ErrorKind::InvalidAlgorithm => TokenError::UnsupportedAlgorithm(alg.clone()),
                ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Malformed(e.to_string()),
            })?;

        if data.claims.exp <= now {
            return Err(TokenError::Expired);
        }
        Ok(data.claims)
    }

    /// Exchange a refresh token for a new access/refresh pair.
    pub fn refresh(&self, refresh_token: &str) -> Result<TokenPair, TokenError> {
        let claims = self.validate_claims(refresh_token)?;
        if claims.kind != TokenKind::Refresh {
            return Err(TokenError::WrongKind {
                expected: TokenKind::Refresh.as_str().into(),
                actual: claims.kind.as_str().into(),
            });
        }
        self.issue_pair(claims.user_id, &claims.role)
    }
}

/// Read the `alg` field of a compact JWT header without verifying anything.
fn header_algorithm(token: &str) -> Result<String, TokenError> {
    let mut parts = token.split('.');
    let (Some(header), Some(_), Some(_), None) = (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(TokenError::Malformed("expected three dot-separated segments".into()));
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(header)
        .map_err(|e| TokenError::Malformed(format!("header is not base64url: {e}")))?;
    let raw: RawHeader = serde_json::from_slice(&bytes)
        .map_err(|e| TokenError::Malformed(format!("header is not valid JSON: {e}")))?;
    Ok(raw.alg)
}

/// Generate a random 32-byte signing secret.
pub fn generate_secret() -> CourierResult<Vec<u8>> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    let mut secret = vec![0u8; 32];
    rng.fill(&mut secret)
        .map_err(|_| CourierError::Crypto("RNG failure while generating secret".into()))?;
    Ok(secret)
}

/// Short, log-safe fingerprint of a token.
pub fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..6])
}
