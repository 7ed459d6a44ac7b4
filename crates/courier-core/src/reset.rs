//! Password-reset token bookkeeping.
//!
//! Reset tokens are the one stateful credential: only the most recently
//! issued value for an identity is valid, and it is usable once.

use crate::error::{CourierResult, TokenError};
use crate::identity::Identity;
use crate::token::TokenService;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;

/// The persisted reset-token value and expiry for one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetRecord {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Narrow persistence interface for reset tokens, normally backed by the
/// user table of the relational store.
pub trait ResetTokenStore: Send + Sync {
    /// Persist `record` for `identity`, replacing any previous one.
    fn save_reset_token(&self, identity: Identity, record: ResetRecord) -> CourierResult<()>;

    /// Load the current record for `identity`, if any.
    fn reset_token(&self, identity: Identity) -> CourierResult<Option<ResetRecord>>;

    /// Remove the record for `identity` only if it still holds `token`.
    ///
    /// Returns `true` if a record was removed.
    fn clear_reset_token(&self, identity: Identity, token: &str) -> CourierResult<bool>;
}

/// In-memory [`ResetTokenStore`].
#[derive(Debug, Default)]
pub struct MemoryResetStore {
    records: DashMap<Identity, ResetRecord>,
}

impl MemoryResetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResetTokenStore for MemoryResetStore {
    fn save_reset_token(&self, identity: Identity, record: ResetRecord) -> CourierResult<()> {
        self.records.insert(identity, record);
        Ok(())
    }

    fn reset_token(&self, identity: Identity) -> CourierResult<Option<ResetRecord>> {
        Ok(self.records.get(&identity).map(|r| r.value().clone()))
    }

    fn clear_reset_token(&self, identity: Identity, token: &str) -> CourierResult<bool> {
        Ok(self
            .records
            .remove_if(&identity, |_, record| record.token == token)
            .is_some())
    }
}

impl<T: ResetTokenStore + ?Sized> ResetTokenStore for Arc<T> {
    fn save_reset_token(&self, identity: Identity, record: ResetRecord) -> CourierResult<()> {
        (**self).save_reset_token(identity, record)
    }

    fn reset_token(&self, identity: Identity) -> CourierResult<Option<ResetRecord>> {
        (**self).reset_token(identity)
    }

    fn clear_reset_token(&self, identity: Identity, token: &str) -> CourierResult<bool> {
        (**self).clear_reset_token(identity, token)
    }
}

/// Issues and checks reset tokens against the persisted value.
pub struct ResetTokens<S> {
    tokens: Arc<TokenService>,
    store: S,
}

impl<S: ResetTokenStore> ResetTokens<S> {
    pub fn new(tokens: Arc<TokenService>, store: S) -> Self {
        Self { tokens, store }
    }

    /// Issue a reset token for `identity`, superseding any earlier one.
    pub fn issue(&self, identity: Identity, role: &str) -> CourierResult<String> {
        let issued = self.tokens.issue_reset_token(identity, role)?;
        self.store.save_reset_token(
            identity,
            ResetRecord {
                token: issued.token.clone(),
                expires_at: issued.expires_at,
            },
        )?;
        Ok(issued.token)
    }

    /// Check a reset token: it must validate cryptographically, equal the
    /// persisted value for its identity, and the persisted expiry must not
    /// have elapsed.
    pub fn validate(&self, token: &str) -> CourierResult<Identity> {
        self.validate_at(token, Utc::now())
    }

    fn validate_at(&self, token: &str, now: DateTime<Utc>) -> CourierResult<Identity> {
        let claims = self.tokens.validate_claims(token)?;
        let record = self
            .store
            .reset_token(claims.user_id)?
            .ok_or(TokenError::ResetTokenInvalid)?;

        if record.token != token || now >= record.expires_at {
            return Err(TokenError::ResetTokenInvalid.into());
        }
        Ok(claims.user_id)
    }

    /// Validate and invalidate a reset token in one step.
    pub fn consume(&self, token: &str) -> CourierResult<Identity> {
        let identity = self.validate(token)?;
        if !self.store.clear_reset_token(identity, token)? {
            // Superseded or consumed concurrently.
            return Err(TokenError::ResetTokenInvalid.into());
        }
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CourierError;
    use chrono::Duration;

    fn reset_tokens() -> (ResetTokens<Arc<MemoryResetStore>>, Arc<MemoryResetStore>) {
        let store = Arc::new(MemoryResetStore::new());
        let tokens = Arc::new(TokenService::new(b"reset-test-secret"));
        (ResetTokens::new(tokens, store.clone()), store)
    }

    fn is_invalid(result: CourierResult<Identity>) -> bool {
        matches!(result, Err(CourierError::Token(TokenError::ResetTokenInvalid)))
    }

    #[test]
    fn issued_token_validates() {
        let (resets, store) = reset_tokens();
        let id = Identity::new_v4();
        let token = resets.issue(id, "user").unwrap();
        assert_eq!(resets.validate(&token).unwrap(), id);

        let record = store.reset_token(id).unwrap().unwrap();
        assert_eq!(record.token, token);
        assert!(record.expires_at > Utc::now() + Duration::minutes(59));
    }

    #[test]
    fn reissue_supersedes_previous_token() {
        let (resets, _) = reset_tokens();
        let id = Identity::new_v4();
        let first = resets.issue(id, "user").unwrap();
        let second = resets.issue(id, "user").unwrap();

        assert!(is_invalid(resets.validate(&first)));
        assert_eq!(resets.validate(&second).unwrap(), id);
    }

    #[test]
    fn token_is_single_use() {
        let (resets, _) = reset_tokens();
        let id = Identity::new_v4();
        let token = resets.issue(id, "user").unwrap();
        assert_eq!(resets.consume(&token).unwrap(), id);
        assert!(is_invalid(resets.validate(&token)));
        assert!(is_invalid(resets.consume(&token)));
    }

    #[test]
    fn never_persisted_token_is_rejected() {
        let (resets, _) = reset_tokens();
        let tokens = TokenService::new(b"reset-test-secret");
        let stray = tokens.issue_reset_token(Identity::new_v4(), "user").unwrap();
        assert!(is_invalid(resets.validate(&stray.token)));
    }

    #[test]
    fn access_token_is_not_a_reset_token() {
        let (resets, _) = reset_tokens();
        let id = Identity::new_v4();
        let _ = resets.issue(id, "user").unwrap();
        let access = TokenService::new(b"reset-test-secret")
            .issue(id, "user", std::time::Duration::from_secs(60))
            .unwrap();
        assert!(is_invalid(resets.validate(&access)));
    }

    #[test]
    fn elapsed_persisted_expiry_is_rejected() {
        let (resets, store) = reset_tokens();
        let id = Identity::new_v4();
        let token = resets.issue(id, "user").unwrap();
        let record = store.reset_token(id).unwrap().unwrap();
        assert!(is_invalid(resets.validate_at(&token, record.expires_at)));
    }

    #[test]
    fn forged_reset_token_fails_signature_check() {
        let (resets, _) = reset_tokens();
        let forged = TokenService::new(b"attacker")
            .issue_reset_token(Identity::new_v4(), "admin")
            .unwrap();
        assert!(matches!(
            resets.validate(&forged.token),
            Err(CourierError::Token(TokenError::SignatureMismatch))
        ));
    }

    #[test]
    fn clear_only_removes_matching_value() {
        let store = MemoryResetStore::new();
        let id = Identity::new_v4();
        let record = ResetRecord {
            token: "current".into(),
            expires_at: Utc::now() + Duration::hours(1),
        };
        store.save_reset_token(id, record.clone()).unwrap();
        assert!(!store.clear_reset_token(id, "stale").unwrap());
        assert_eq!(store.reset_token(id).unwrap(), Some(record));
        assert!(store.clear_reset_token(id, "current").unwrap());
        assert_eq!(store.reset_token(id).unwrap(), None);
    }
}
