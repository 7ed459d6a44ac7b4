//! Relay core: who is connected, and where each frame goes.

pub mod connection;
pub mod delivery;
pub mod registry;
pub mod router;

pub use connection::ConnectionHandle;
pub use delivery::DeliveryTracker;
pub use registry::ConnectionRegistry;
pub use router::MessageRouter;
