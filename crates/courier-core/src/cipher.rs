//! Pluggable payload cipher.
//!
//! The relay routes on the plaintext outer envelope of a frame; a cipher
//! only ever transforms the inner `content`. The default is
//! [`PassthroughCipher`], which leaves bytes untouched.

use crate::error::{CourierError, CourierResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};

/// Symmetric transform applied to frame content before transmission and
/// reversed on receipt.
pub trait PayloadCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> CourierResult<Vec<u8>>;

    fn decrypt(&self, ciphertext: &[u8]) -> CourierResult<Vec<u8>>;

    /// True when `encrypt`/`decrypt` are the identity function.
    fn is_passthrough(&self) -> bool {
        false
    }
}

/// Seal a text payload and encode it as base64 for a JSON string field.
pub fn seal_text(cipher: &dyn PayloadCipher, plaintext: &str) -> CourierResult<String> {
    let sealed = cipher.encrypt(plaintext.as_bytes())?;
    Ok(STANDARD.encode(sealed))
}

/// Reverse [`seal_text`].
pub fn open_text(cipher: &dyn PayloadCipher, encoded: &str) -> CourierResult<String> {
    let sealed = STANDARD
        .decode(encoded)
        .map_err(|e| CourierError::Crypto(format!("invalid base64 payload: {e}")))?;
    let plain = cipher.decrypt(&sealed)?;
    String::from_utf8(plain).map_err(|_| CourierError::Crypto("payload is not UTF-8".into()))
}

/// No-op cipher.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughCipher;

impl PayloadCipher for PassthroughCipher {
    fn encrypt(&self, plaintext: &[u8]) -> CourierResult<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> CourierResult<Vec<u8>> {
        Ok(ciphertext.to_vec())
    }

    fn is_passthrough(&self) -> bool {
        true
    }
}

/// ChaCha20-Poly1305 authenticated encryption with a per-process key.
///
/// Output layout: `[12-byte nonce][ciphertext || 16-byte tag]`.
pub struct SealedCipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl SealedCipher {
    /// Create a cipher with a freshly generated random key.
    pub fn generate() -> CourierResult<Self> {
        let rng = SystemRandom::new();
        let mut key_bytes = [0u8; 32];
        rng.fill(&mut key_bytes)
            .map_err(|_| CourierError::Crypto("failed to generate payload key".into()))?;
        Self::from_key(&key_bytes)
    }

    /// Create a cipher from a 32-byte key.
    pub fn from_key(key_bytes: &[u8]) -> CourierResult<Self> {
        let unbound = UnboundKey::new(&CHACHA20_POLY1305, key_bytes)
            .map_err(|_| CourierError::Crypto("payload key must be 32 bytes".into()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }
}

impl std::fmt::Debug for SealedCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedCipher").finish_non_exhaustive()
    }
}

impl PayloadCipher for SealedCipher {
    fn encrypt(&self, plaintext: &[u8]) -> CourierResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| CourierError::Crypto("nonce generation failed".into()))?;

        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| CourierError::Crypto("seal failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend(in_out);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> CourierResult<Vec<u8>> {
        let min_len = NONCE_LEN + CHACHA20_POLY1305.tag_len();
        if ciphertext.len() < min_len {
            return Err(CourierError::Crypto(format!(
                "ciphertext too short: {} bytes (min {min_len})",
                ciphertext.len()
            )));
        }

        let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| CourierError::Crypto("invalid nonce".into()))?;
        let mut buf = sealed.to_vec();
        let plain = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut buf)
            .map_err(|_| CourierError::Crypto("payload authentication failed".into()))?;
        Ok(plain.to_vec())
    }
}
