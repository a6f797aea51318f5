//! Engine state
//!
//! `EngineState` lives in a `StateSync` owned by the engine. Its completers
//! are scoped to one connection attempt and are reset on every cleanup.

use crate::config::ConnectOptions;
use crate::state::{ConnectionState, DisconnectReason, ReconnectMode};
use crate::support::Completer;

#[derive(Clone)]
pub(crate) struct EngineState {
    pub connect_options: ConnectOptions,
    pub url: Option<String>,
    pub token: Option<String>,
    /// One-shot override for the next reconnect attempt
    pub next_preferred_reconnect_mode: Option<ReconnectMode>,
    pub reconnect_mode: Option<ReconnectMode>,
    pub connection_state: ConnectionState,
    pub has_published: bool,
    /// Advanced by every cleanup that ends the session
    pub session: u64,
    pub primary_transport_connected: Completer<()>,
    pub publisher_transport_connected: Completer<()>,
    pub publisher_reliable_open: Completer<()>,
    pub publisher_lossy_open: Completer<()>,
}

impl EngineState {
    pub fn new(connect_options: ConnectOptions) -> Self {
        Self {
            connect_options,
            url: None,
            token: None,
            next_preferred_reconnect_mode: None,
            reconnect_mode: None,
            connection_state: ConnectionState::Disconnected,
            has_published: false,
            session: 0,
            primary_transport_connected: Completer::new(),
            publisher_transport_connected: Completer::new(),
            publisher_reliable_open: Completer::new(),
            publisher_lossy_open: Completer::new(),
        }
    }

    /// Fresh state for a cleanup
    ///
    /// Fails every pending wait. A full reconnect keeps the session
    /// coordinates and the reconnect bookkeeping; any other cleanup keeps only
    /// the connect options and starts a new session.
    pub fn after_cleanup(&self, reason: Option<DisconnectReason>, full_reconnect: bool) -> Self {
        self.primary_transport_connected.reset();
        self.publisher_transport_connected.reset();
        self.publisher_reliable_open.reset();
        self.publisher_lossy_open.reset();

        let mut fresh = EngineState::new(self.connect_options.clone());
        if full_reconnect {
            fresh.url = self.url.clone();
            fresh.token = self.token.clone();
            fresh.next_preferred_reconnect_mode = self.next_preferred_reconnect_mode;
            fresh.reconnect_mode = self.reconnect_mode;
            fresh.connection_state = self.connection_state.clone();
            fresh.session = self.session;
        } else {
            fresh.connection_state = self.connection_state.after_cleanup(reason);
            fresh.session = self.session + 1;
        }
        fresh
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            connection_state: self.connection_state.clone(),
            reconnect_mode: self.reconnect_mode,
            next_preferred_reconnect_mode: self.next_preferred_reconnect_mode,
            has_published: self.has_published,
            url: self.url.clone(),
        }
    }
}

/// Observable part of the engine state
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EngineSnapshot {
    pub connection_state: ConnectionState,
    pub reconnect_mode: Option<ReconnectMode>,
    pub next_preferred_reconnect_mode: Option<ReconnectMode>,
    pub has_published: bool,
    pub url: Option<String>,
}
