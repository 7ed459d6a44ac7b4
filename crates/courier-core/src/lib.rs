//! courier-core: Shared protocol library for the courier relay.
//!
//! Provides the identity type, JSON wire frames, the optional payload
//! cipher, signed session tokens and reset-token bookkeeping.

pub mod cipher;
pub mod error;
pub mod frame;
pub mod identity;
pub mod reset;
pub mod token;

// Re-export commonly used items at crate root.
pub use cipher::{open_text, seal_text, PassthroughCipher, PayloadCipher, SealedCipher};
pub use error::{CourierError, CourierResult, TokenError};
pub use frame::{decode_frame, encode_frame, Ack, ChatMessage, Decoded, Frame, FrameKind, MessageStatus, Signal};
pub use identity::Identity;
pub use reset::{MemoryResetStore, ResetRecord, ResetTokenStore, ResetTokens};
pub use token::{generate_secret, token_fingerprint, Claims, IssuedToken, TokenKind, TokenPair, TokenService};
