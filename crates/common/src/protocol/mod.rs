// Wire protocol for the trellis-sync.v1 WebSocket channel.

pub mod error;
pub mod message;

pub const CURRENT_PROTOCOL_VERSION: &str = "trellis-sync.v1";
