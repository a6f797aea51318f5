//! Error taxonomy for the connection core
//!
//! Every variant carries a readable detail string so errors can be cloned
//! into connection state and fanned out to several waiters.

use thiserror::Error;

/// Errors raised by the engine, signal client and transports
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Operation invoked in a state that does not allow it
    #[error("invalid state: {0}")]
    State(String),
    /// A rendezvous wait exceeded its bound
    #[error("timed out: {0}")]
    Timeout(String),
    /// Network-level failure (connect, validation, HTTP)
    #[error("network error: {0}")]
    Network(String),
    /// Signaling socket failure
    #[error("socket error: {0}")]
    Socket(String),
    /// Peer connection operation failed
    #[error("webrtc error: {0}")]
    WebRtc(String),
    /// Payload could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Unexpected or malformed server message
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A pending wait was cancelled by a reset
    #[error("resetting pending promise")]
    Reset,
    /// Server ended the session and does not allow reconnecting
    #[error("disconnected: {0}")]
    Disconnected(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn state(msg: impl Into<String>) -> Self {
        Error::State(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Error::Timeout(msg.into())
    }

    pub fn webrtc(msg: impl Into<String>) -> Self {
        Error::WebRtc(msg.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::Protocol(format!("invalid url: {}", e))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Socket(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Network(e.to_string())
    }
}

#[cfg(feature = "webrtc-rs")]
impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::WebRtc(e.to_string())
    }
}
