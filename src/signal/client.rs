//! Signal client
//!
//! Owns one signaling socket at a time. Outbound requests go through a
//! serialized request queue that can hold enqueable requests while the socket
//! reconnects. Inbound responses go through a response queue that is
//! suspended from the join response until the engine has configured its
//! transports, so nothing that refers to them is dispatched early.

use super::endpoint::build_url;
use super::protocol::{
    AddTrackRequest, JoinResponse, SignalRequest, SignalResponse, SignalTarget, SimulateScenario,
    SubscriptionPermission, SyncState, TrackInfo, UpdateSubscription, UpdateTrackSettings,
    VideoLayer,
};
use super::protocol::{
    ConnectionQualityInfo, ParticipantInfo, RoomInfo, SpeakerInfo, StreamStateInfo,
    SubscribedQuality, SubscriptionPermissionUpdate, TrackPublishedResponse,
};
use super::validate::Validator;
use super::websocket::{Frame, SignalConnector, SignalSocket, SocketEvent};
use crate::config::{ConnectOptions, Timeouts};
use crate::error::{Error, Result};
use crate::rtc::peer::{IceCandidate, SessionDescription};
use crate::state::{ConnectionState, DisconnectReason, ReconnectMode};
use crate::support::{Completer, ObserverId, Observers, StateSync};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

/// Server version whose subscribed-quality updates are known to be bogus
const IGNORED_QUALITY_UPDATE_VERSION: &str = "0.15.1";

/// Notifications fanned out to signal client observers
#[derive(Debug, Clone)]
pub enum SignalEvent {
    StateChanged {
        new: ConnectionState,
        old: ConnectionState,
    },
    Join(Box<JoinResponse>),
    Answer(SessionDescription),
    Offer(SessionDescription),
    Trickle {
        candidate: IceCandidate,
        target: SignalTarget,
    },
    ParticipantUpdate(Vec<ParticipantInfo>),
    RoomUpdate(RoomInfo),
    TrackPublished(TrackPublishedResponse),
    TrackUnpublished {
        track_sid: String,
    },
    SpeakersChanged(Vec<SpeakerInfo>),
    ConnectionQuality(Vec<ConnectionQualityInfo>),
    RemoteMuteChanged {
        track_sid: String,
        muted: bool,
    },
    StreamStateUpdate(Vec<StreamStateInfo>),
    SubscribedQualityUpdate {
        track_sid: String,
        qualities: Vec<SubscribedQuality>,
    },
    SubscriptionPermissionUpdate(SubscriptionPermissionUpdate),
    TokenRefreshed(String),
    Leave {
        can_reconnect: bool,
    },
}

#[derive(Clone)]
struct SignalClientState {
    reconnect_mode: Option<ReconnectMode>,
    connection_state: ConnectionState,
    join_response: Completer<JoinResponse>,
    add_track: HashMap<String, Completer<TrackInfo>>,
}

impl SignalClientState {
    fn new() -> Self {
        Self {
            reconnect_mode: None,
            connection_state: ConnectionState::Disconnected,
            join_response: Completer::new(),
            add_track: HashMap::new(),
        }
    }
}

#[derive(Default)]
struct ResponseQueue {
    suspended: bool,
    buffered: Vec<SignalResponse>,
}

struct Inner {
    state: StateSync<SignalClientState>,
    connector: Arc<dyn SignalConnector>,
    validator: Arc<dyn Validator>,
    timeouts: Timeouts,
    socket: Mutex<Option<Arc<dyn SignalSocket>>>,
    /// Bumped on every connect and cleanup; readers of older sockets stop
    generation: AtomicU64,
    connect_lock: tokio::sync::Mutex<()>,
    request_queue: tokio::sync::Mutex<Vec<SignalRequest>>,
    responses: tokio::sync::Mutex<ResponseQueue>,
    latest_join: Mutex<Option<JoinResponse>>,
    observers: Arc<Observers<SignalEvent>>,
}

#[derive(Clone)]
pub struct SignalClient {
    inner: Arc<Inner>,
}

impl SignalClient {
    pub fn new(
        connector: Arc<dyn SignalConnector>,
        validator: Arc<dyn Validator>,
        timeouts: Timeouts,
    ) -> Self {
        let observers: Arc<Observers<SignalEvent>> = Arc::new(Observers::new());
        let state = StateSync::new(SignalClientState::new());

        let hook_observers = observers.clone();
        state.set_on_mutate(Box::new(move |new: &SignalClientState, old: &SignalClientState| {
            if new.connection_state != old.connection_state {
                debug!(
                    "Signal state {} -> {}",
                    old.connection_state, new.connection_state
                );
                hook_observers.notify(SignalEvent::StateChanged {
                    new: new.connection_state.clone(),
                    old: old.connection_state.clone(),
                });
            }
        }));

        Self {
            inner: Arc::new(Inner {
                state,
                connector,
                validator,
                timeouts,
                socket: Mutex::new(None),
                generation: AtomicU64::new(0),
                connect_lock: tokio::sync::Mutex::new(()),
                request_queue: tokio::sync::Mutex::new(Vec::new()),
                responses: tokio::sync::Mutex::new(ResponseQueue::default()),
                latest_join: Mutex::new(None),
                observers,
            }),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.read(|s| s.connection_state.clone())
    }

    pub fn reconnect_mode(&self) -> Option<ReconnectMode> {
        self.inner.state.read(|s| s.reconnect_mode)
    }

    /// Last join response seen on the current socket
    pub fn latest_join_response(&self) -> Option<JoinResponse> {
        self.inner.latest_join.lock().clone()
    }

    pub fn subscribe(&self) -> (ObserverId, mpsc::UnboundedReceiver<SignalEvent>) {
        self.inner.observers.subscribe()
    }

    pub fn register(
        &self,
        sink: impl Fn(SignalEvent) -> bool + Send + Sync + 'static,
    ) -> ObserverId {
        self.inner.observers.register(sink)
    }

    pub fn unsubscribe(&self, id: ObserverId) {
        self.inner.observers.unsubscribe(id);
    }

    /// Open the signaling socket
    ///
    /// On a first connect a failed socket is explained by probing the
    /// validation endpoint. Reconnects surface the socket error as is.
    pub async fn connect(
        &self,
        url: &str,
        token: &str,
        options: &ConnectOptions,
        adaptive_stream: bool,
        reconnect_mode: Option<ReconnectMode>,
    ) -> Result<()> {
        let _serial = self.inner.connect_lock.lock().await;
        self.clean_up(None).await;

        debug!("Signal connect, reconnect mode: {:?}", reconnect_mode);
        let socket_url = build_url(url, token, options, adaptive_stream, reconnect_mode, false)?;

        self.inner.state.mutate(|s| {
            s.reconnect_mode = reconnect_mode;
            s.connection_state = if reconnect_mode.is_some() {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Connecting
            };
        });

        let attempt = tokio::time::timeout(
            self.inner.timeouts.socket_connect(),
            self.inner.connector.connect(&socket_url),
        )
        .await
        .unwrap_or_else(|_| Err(Error::timeout("signal socket didn't connect")));

        match attempt {
            Ok((socket, events)) => {
                let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
                *self.inner.socket.lock() = Some(socket);
                self.inner
                    .state
                    .mutate(|s| s.connection_state = ConnectionState::Connected);
                tokio::spawn(read_loop(Arc::downgrade(&self.inner), generation, events));
                info!("Signal socket connected");
                Ok(())
            }
            Err(e) => {
                warn!("Signal socket connect failed: {}", e);
                let error = if reconnect_mode.is_some() {
                    e
                } else {
                    self.explain_failure(url, token, options, adaptive_stream, e)
                        .await
                };
                self.clean_up(Some(DisconnectReason::NetworkError(error.clone())))
                    .await;
                Err(error)
            }
        }
    }

    async fn explain_failure(
        &self,
        url: &str,
        token: &str,
        options: &ConnectOptions,
        adaptive_stream: bool,
        error: Error,
    ) -> Error {
        let validate_url = match build_url(url, token, options, adaptive_stream, None, true) {
            Ok(u) => u,
            Err(_) => return error,
        };
        match self.inner.validator.validate(&validate_url).await {
            Ok(message) => Error::Network(message),
            Err(validation_error) => validation_error,
        }
    }

    /// Close the socket and reset everything; safe to call repeatedly
    pub async fn clean_up(&self, reason: Option<DisconnectReason>) {
        debug!("Signal cleanup, reason: {:?}", reason);
        self.inner.generation.fetch_add(1, Ordering::SeqCst);

        let socket = self.inner.socket.lock().take();
        if let Some(socket) = socket {
            socket.close();
        }
        *self.inner.latest_join.lock() = None;

        self.inner.state.mutate(|s| {
            s.join_response.reset();
            for completer in s.add_track.values() {
                completer.reset();
            }
            let connection_state = s.connection_state.after_cleanup(reason);
            *s = SignalClientState {
                connection_state,
                ..SignalClientState::new()
            };
        });

        self.inner.request_queue.lock().await.clear();
        let mut responses = self.inner.responses.lock().await;
        responses.buffered.clear();
        responses.suspended = false;
    }

    /// Wait for the join response of the current socket
    pub async fn wait_join_response(&self) -> Result<JoinResponse> {
        let completer = self.inner.state.read(|s| s.join_response.clone());
        completer
            .wait(
                self.inner.timeouts.join_response(),
                Error::timeout("failed to receive join response"),
            )
            .await
    }

    /// Dispatch responses buffered since the join response, then resume
    pub async fn resume_response_queue(&self) {
        let mut responses = self.inner.responses.lock().await;
        let buffered = std::mem::take(&mut responses.buffered);
        if !buffered.is_empty() {
            debug!("Dispatching {} buffered responses", buffered.len());
        }
        for response in buffered {
            self.on_signal_response(&mut responses, response);
        }
        responses.suspended = false;
    }

    /// Flush requests held back while reconnecting, in issue order
    pub async fn send_queued_requests(&self) {
        let mut queue = self.inner.request_queue.lock().await;
        if queue.is_empty() {
            debug!("No queued requests");
            return;
        }
        let pending = std::mem::take(&mut *queue);
        debug!("Sending {} queued requests", pending.len());
        for request in pending {
            if let Err(e) = self.transmit(&request) {
                warn!("Failed to send queued {} request: {}", request.name(), e);
            }
        }
    }

    async fn send_request(&self, request: SignalRequest) -> Result<()> {
        let mut queue = self.inner.request_queue.lock().await;
        let state = self.connection_state();
        // keep FIFO order behind anything still waiting for the flush
        if request.can_enqueue() && (state.is_reconnecting() || !queue.is_empty()) {
            debug!("Queueing {} request", request.name());
            queue.push(request);
            return Ok(());
        }
        self.transmit(&request)
    }

    fn transmit(&self, request: &SignalRequest) -> Result<()> {
        if !self.connection_state().is_connected() {
            return Err(Error::state(format!(
                "not connected, cannot send {} request",
                request.name()
            )));
        }
        let socket = self
            .inner
            .socket
            .lock()
            .clone()
            .ok_or_else(|| Error::state("signal socket is not open"))?;
        socket.send(Frame::Text(request.to_json()?))
    }

    pub async fn send_offer(&self, offer: SessionDescription) -> Result<()> {
        self.send_request(SignalRequest::Offer { description: offer })
            .await
    }

    pub async fn send_answer(&self, answer: SessionDescription) -> Result<()> {
        self.send_request(SignalRequest::Answer {
            description: answer,
        })
        .await
    }

    pub async fn send_candidate(&self, candidate: &IceCandidate, target: SignalTarget) -> Result<()> {
        self.send_request(SignalRequest::Trickle {
            candidate_init: candidate.to_json()?,
            target,
        })
        .await
    }

    pub async fn send_mute_track(&self, track_sid: &str, muted: bool) -> Result<()> {
        self.send_request(SignalRequest::Mute {
            sid: track_sid.to_string(),
            muted,
        })
        .await
    }

    /// Announce a local track and wait for the server to publish it
    pub async fn send_add_track(&self, request: AddTrackRequest) -> Result<TrackInfo> {
        let completer = self.prepare_add_track(&request.cid);
        self.send_request(SignalRequest::AddTrack(request)).await?;
        completer
            .wait(
                self.inner.timeouts.publish(),
                Error::timeout("server didn't respond to addTrack request"),
            )
            .await
    }

    fn prepare_add_track(&self, cid: &str) -> Completer<TrackInfo> {
        self.inner.state.mutate(|s| {
            if let Some(existing) = s.add_track.get(cid) {
                existing.reset();
                return existing.clone();
            }
            let completer = Completer::new();
            s.add_track.insert(cid.to_string(), completer.clone());
            completer
        })
    }

    pub async fn send_update_track_settings(&self, settings: UpdateTrackSettings) -> Result<()> {
        self.send_request(SignalRequest::UpdateTrackSettings(settings))
            .await
    }

    pub async fn send_update_video_layers(
        &self,
        track_sid: &str,
        layers: Vec<VideoLayer>,
    ) -> Result<()> {
        self.send_request(SignalRequest::UpdateVideoLayers {
            track_sid: track_sid.to_string(),
            layers,
        })
        .await
    }

    pub async fn send_update_subscription(&self, subscription: UpdateSubscription) -> Result<()> {
        self.send_request(SignalRequest::Subscription(subscription))
            .await
    }

    pub async fn send_update_subscription_permission(
        &self,
        permission: SubscriptionPermission,
    ) -> Result<()> {
        self.send_request(SignalRequest::SubscriptionPermission(permission))
            .await
    }

    pub async fn send_sync_state(&self, sync_state: SyncState) -> Result<()> {
        self.send_request(SignalRequest::SyncState(sync_state))
            .await
    }

    pub async fn send_leave(&self) -> Result<()> {
        self.send_request(SignalRequest::Leave).await
    }

    pub async fn send_simulate(&self, scenario: SimulateScenario) -> Result<()> {
        self.send_request(SignalRequest::Simulate { scenario }).await
    }

    async fn on_frame(&self, frame: Frame) {
        let parsed = match &frame {
            Frame::Text(text) => SignalResponse::from_json(text),
            Frame::Binary(data) => SignalResponse::from_bytes(data),
        };
        let response = match parsed {
            Ok(response) => response,
            Err(e) => {
                warn!("Dropping undecodable signal frame: {}", e);
                return;
            }
        };

        let mut responses = self.inner.responses.lock().await;
        if responses.suspended {
            debug!("Buffering response while queue is suspended");
            responses.buffered.push(response);
            return;
        }
        self.on_signal_response(&mut responses, response);
    }

    fn on_signal_response(&self, responses: &mut ResponseQueue, response: SignalResponse) {
        if !self.connection_state().is_connected() {
            warn!("Not connected, dropping signal response");
            return;
        }

        let observers = &self.inner.observers;
        match response {
            SignalResponse::Join(join) => {
                responses.suspended = true;
                info!(
                    "Joined room {} as {} (server {})",
                    join.room.name, join.participant.identity, join.server_version
                );
                *self.inner.latest_join.lock() = Some(join.clone());
                let completer = self.inner.state.read(|s| s.join_response.clone());
                observers.notify(SignalEvent::Join(Box::new(join.clone())));
                completer.set(join);
            }
            SignalResponse::Answer { description } => {
                observers.notify(SignalEvent::Answer(description));
            }
            SignalResponse::Offer { description } => {
                observers.notify(SignalEvent::Offer(description));
            }
            SignalResponse::Trickle {
                candidate_init,
                target,
            } => match IceCandidate::from_json(&candidate_init) {
                Ok(candidate) => observers.notify(SignalEvent::Trickle { candidate, target }),
                Err(e) => warn!("Dropping trickle for {:?}: {}", target, e),
            },
            SignalResponse::Update { participants } => {
                observers.notify(SignalEvent::ParticipantUpdate(participants));
            }
            SignalResponse::RoomUpdate { room } => {
                observers.notify(SignalEvent::RoomUpdate(room));
            }
            SignalResponse::TrackPublished(published) => {
                let completer = self
                    .inner
                    .state
                    .read(|s| s.add_track.get(&published.cid).cloned());
                observers.notify(SignalEvent::TrackPublished(published.clone()));
                match completer {
                    Some(completer) => completer.set(published.track),
                    None => warn!("No pending addTrack for cid {}", published.cid),
                }
            }
            SignalResponse::TrackUnpublished { track_sid } => {
                observers.notify(SignalEvent::TrackUnpublished { track_sid });
            }
            SignalResponse::SpeakersChanged { speakers } => {
                observers.notify(SignalEvent::SpeakersChanged(speakers));
            }
            SignalResponse::ConnectionQuality { updates } => {
                observers.notify(SignalEvent::ConnectionQuality(updates));
            }
            SignalResponse::Mute { sid, muted } => {
                observers.notify(SignalEvent::RemoteMuteChanged {
                    track_sid: sid,
                    muted,
                });
            }
            SignalResponse::Leave { can_reconnect } => {
                observers.notify(SignalEvent::Leave { can_reconnect });
            }
            SignalResponse::StreamStateUpdate { stream_states } => {
                observers.notify(SignalEvent::StreamStateUpdate(stream_states));
            }
            SignalResponse::SubscribedQualityUpdate {
                track_sid,
                subscribed_qualities,
            } => {
                let ignored = self
                    .inner
                    .latest_join
                    .lock()
                    .as_ref()
                    .map(|j| j.server_version == IGNORED_QUALITY_UPDATE_VERSION)
                    .unwrap_or(false);
                if ignored {
                    debug!("Ignoring subscribed quality update from server {}", IGNORED_QUALITY_UPDATE_VERSION);
                } else {
                    observers.notify(SignalEvent::SubscribedQualityUpdate {
                        track_sid,
                        qualities: subscribed_qualities,
                    });
                }
            }
            SignalResponse::SubscriptionPermissionUpdate(update) => {
                observers.notify(SignalEvent::SubscriptionPermissionUpdate(update));
            }
            SignalResponse::RefreshToken { token } => {
                observers.notify(SignalEvent::TokenRefreshed(token));
            }
            SignalResponse::Pong { timestamp } => {
                debug!("Pong {}", timestamp);
            }
        }
    }
}

async fn read_loop(
    inner: Weak<Inner>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<SocketEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if inner.generation.load(Ordering::SeqCst) != generation {
            debug!("Ignoring event from a stale signal socket");
            return;
        }
        let client = SignalClient { inner };
        match event {
            SocketEvent::Message(frame) => client.on_frame(frame).await,
            SocketEvent::Closed(error) => {
                let error = error.unwrap_or_else(|| Error::Socket("socket closed".to_string()));
                info!("Signal socket closed: {}", error);
                client
                    .clean_up(Some(DisconnectReason::NetworkError(error)))
                    .await;
                return;
            }
        }
    }
}
