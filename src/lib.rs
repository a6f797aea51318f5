//! rtc-engine-core - connection core of a real-time media client
//!
//! Joins a media room through a websocket signaling server and keeps a
//! publisher and a subscriber WebRTC transport alive, recovering dropped
//! sessions with quick (ICE restart) or full (rejoin) reconnects.

pub mod config;
pub mod engine;
pub mod error;
pub mod rtc;
pub mod signal;
pub mod state;
pub mod support;

#[cfg(test)]
mod testing;

// Re-exports
pub use config::{ConnectOptions, EngineConfig, RoomOptions, RtcConfiguration, Timeouts};
pub use engine::{Engine, EngineEvent, EngineSnapshot, Reliability, UserPacket};
pub use error::{Error, Result};
pub use signal::{SignalClient, SignalEvent};
pub use state::{ConnectionState, DisconnectReason, ReconnectMode};
