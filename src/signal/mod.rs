//! Signaling: wire protocol, socket, validation probe and the signal client

pub mod client;
pub mod endpoint;
pub mod protocol;
pub mod validate;
pub mod websocket;

pub use client::{SignalClient, SignalEvent};
pub use protocol::{JoinResponse, SignalRequest, SignalResponse, SignalTarget};
pub use validate::{HttpValidator, Validator};
pub use websocket::{Frame, SignalConnector, SignalSocket, SocketEvent, WebSocketConnector};
