//! hems-core: Frame decoding and identity tracking for the wattmeter relay.
//!
//! No async, no network outside the optional `notify` feature. This crate
//! is the shared core used by both `hems-feeder` (serial line owner) and
//! `hems-server` (consumer + CLI).

pub mod config;
pub mod decode;
pub mod device;
pub mod frame;
pub mod identity;
pub mod liveness;
#[cfg(feature = "notify")]
pub mod notify;
pub mod slot;
pub mod types;

// Re-export commonly used types at crate root
pub use decode::PacketDecoder;
pub use frame::{FrameReader, RawFrame, ReadOutcome, RelayMessage};
pub use identity::{FileIdentityStore, IdentityMap, IdentityStore, MemoryIdentityStore};
pub use types::*;
