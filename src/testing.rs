//! In-memory signal server and peer connection fakes for unit tests

use crate::config::RtcConfiguration;
use crate::error::{Error, Result};
use crate::rtc::peer::{
    DataChannel, DataChannelEvent, DataChannelEventHandler, DataChannelInit, DataChannelState,
    IceCandidate, PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent,
    PeerEventHandler, RtpStreamSample, SdpType, SessionDescription, SignalingState,
};
use crate::signal::protocol::{JoinResponse, ParticipantInfo, RoomInfo, SignalRequest, SignalResponse};
use crate::signal::validate::Validator;
use crate::signal::websocket::{Frame, SignalConnector, SignalSocket, SocketEvent};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use url::Url;

pub type Responder = Arc<dyn Fn(&SignalRequest) -> Vec<SignalResponse> + Send + Sync>;

pub fn join_response(subscriber_primary: bool) -> JoinResponse {
    JoinResponse {
        room: RoomInfo {
            sid: "RM_test".into(),
            name: "test-room".into(),
            metadata: String::new(),
        },
        participant: ParticipantInfo {
            sid: "PA_local".into(),
            identity: "local".into(),
            ..Default::default()
        },
        server_version: "1.5.0".into(),
        subscriber_primary,
        ..Default::default()
    }
}

/// Responder that answers every publisher offer
pub fn answer_offers() -> Responder {
    Arc::new(|request: &SignalRequest| match request {
        SignalRequest::Offer { description } => vec![SignalResponse::Answer {
            description: SessionDescription::answer(format!("answer-to-{}", description.sdp)),
        }],
        _ => vec![],
    })
}

pub struct FakeConnection {
    pub url: Url,
    events: mpsc::UnboundedSender<SocketEvent>,
    sent: Mutex<Vec<SignalRequest>>,
    closed: AtomicBool,
    responder: Option<Responder>,
}

impl FakeConnection {
    pub fn push(&self, response: SignalResponse) {
        let text = response.to_json().unwrap();
        let _ = self.events.send(SocketEvent::Message(Frame::Text(text)));
    }

    pub fn drop_connection(&self) {
        let _ = self
            .events
            .send(SocketEvent::Closed(Some(Error::Socket("connection reset".into()))));
    }

    pub fn sent(&self) -> Vec<SignalRequest> {
        self.sent.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_quick_reconnect(&self) -> bool {
        self.url
            .query_pairs()
            .any(|(k, v)| k == "reconnect" && v == "1")
    }
}

impl SignalSocket for FakeConnection {
    fn send(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Socket("socket is closed".into()));
        }
        let request = match frame {
            Frame::Text(text) => SignalRequest::from_json(&text)?,
            Frame::Binary(_) => return Err(Error::Protocol("unexpected binary frame".into())),
        };
        self.sent.lock().push(request.clone());
        if let Some(responder) = &self.responder {
            for response in responder(&request) {
                self.push(response);
            }
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakeServerState {
    fail_connects: usize,
    attempts: usize,
    attempted_urls: Vec<Url>,
    join: Option<JoinResponse>,
    responder: Option<Responder>,
    connections: Vec<Arc<FakeConnection>>,
}

/// Scripted signal server; also the connector handed to the client
pub struct FakeServer {
    state: Mutex<FakeServerState>,
    hold: watch::Sender<bool>,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        let (hold, _) = watch::channel(false);
        Arc::new(Self {
            state: Mutex::new(FakeServerState::default()),
            hold,
        })
    }

    /// Server that greets every non-quick connect with `join`
    pub fn with_join(join: JoinResponse) -> Arc<Self> {
        let server = Self::new();
        server.state.lock().join = Some(join);
        server
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.state.lock().fail_connects = count;
    }

    pub fn set_responder(&self, responder: Responder) {
        self.state.lock().responder = Some(responder);
    }

    /// Park connect attempts until released
    pub fn hold_connects(&self, hold: bool) {
        self.hold.send_replace(hold);
    }

    pub fn attempts(&self) -> usize {
        self.state.lock().attempts
    }

    /// Whether each connect attempt so far asked for a quick reconnect
    pub fn quick_attempts(&self) -> Vec<bool> {
        self.state
            .lock()
            .attempted_urls
            .iter()
            .map(|url| url.query_pairs().any(|(k, v)| k == "reconnect" && v == "1"))
            .collect()
    }

    pub fn connections(&self) -> Vec<Arc<FakeConnection>> {
        self.state.lock().connections.clone()
    }

    pub fn last_connection(&self) -> Option<Arc<FakeConnection>> {
        self.state.lock().connections.last().cloned()
    }
}

#[async_trait]
impl SignalConnector for FakeServer {
    async fn connect(
        &self,
        url: &Url,
    ) -> Result<(Arc<dyn SignalSocket>, mpsc::UnboundedReceiver<SocketEvent>)> {
        let mut hold = self.hold.subscribe();
        while *hold.borrow_and_update() {
            if hold.changed().await.is_err() {
                break;
            }
        }

        let mut state = self.state.lock();
        state.attempts += 1;
        state.attempted_urls.push(url.clone());
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(Error::Socket("connection refused".into()));
        }

        let (events, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(FakeConnection {
            url: url.clone(),
            events,
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            responder: state.responder.clone(),
        });
        if !connection.is_quick_reconnect() {
            if let Some(join) = &state.join {
                connection.push(SignalResponse::Join(join.clone()));
            }
        }
        state.connections.push(connection.clone());
        Ok((connection, rx))
    }
}

pub struct FakeValidator {
    outcome: Result<String>,
    calls: Arc<AtomicUsize>,
}

impl FakeValidator {
    pub fn message(message: &str) -> Self {
        Self {
            outcome: Ok(message.to_string()),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl Validator for FakeValidator {
    async fn validate(&self, _url: &Url) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.outcome.clone()
    }
}

pub struct FakeDataChannel {
    label: String,
    id: u16,
    state: Mutex<DataChannelState>,
    handler: Mutex<Option<DataChannelEventHandler>>,
    sent: Mutex<Vec<Bytes>>,
}

impl FakeDataChannel {
    pub fn new(label: &str, id: u16) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            id,
            state: Mutex::new(DataChannelState::Connecting),
            handler: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn set_state(&self, state: DataChannelState) {
        *self.state.lock() = state;
        self.emit(DataChannelEvent::StateChanged(state));
    }

    pub fn receive(&self, data: &[u8]) {
        self.emit(DataChannelEvent::Message(Bytes::copy_from_slice(data)));
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    pub fn has_handler(&self) -> bool {
        self.handler.lock().is_some()
    }

    fn emit(&self, event: DataChannelEvent) {
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }
}

#[async_trait]
impl DataChannel for FakeDataChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn id(&self) -> Option<u16> {
        Some(self.id)
    }

    fn ready_state(&self) -> DataChannelState {
        *self.state.lock()
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        if self.ready_state() != DataChannelState::Open {
            return Err(Error::webrtc("data channel is not open"));
        }
        self.sent.lock().push(data);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        *self.state.lock() = DataChannelState::Closed;
        Ok(())
    }

    fn set_event_handler(&self, handler: Option<DataChannelEventHandler>) {
        *self.handler.lock() = handler;
    }
}

#[derive(Default)]
struct FakePeerState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    signaling: Option<SignalingState>,
    connection: Option<PeerConnectionState>,
    offers: usize,
    ice_restarts: usize,
    answers: usize,
    candidates: Vec<IceCandidate>,
    /// operations in the order they were applied
    log: Vec<String>,
    channels: Vec<Arc<FakeDataChannel>>,
    stats: Vec<RtpStreamSample>,
    closed: bool,
}

pub struct FakePeer {
    state: Mutex<FakePeerState>,
    handler: Mutex<Option<PeerEventHandler>>,
    auto_connect: bool,
}

impl FakePeer {
    pub fn new(auto_connect: bool) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakePeerState::default()),
            handler: Mutex::new(None),
            auto_connect,
        })
    }

    pub fn emit(&self, event: PeerEvent) {
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }

    /// Change the connection state and notify, opening channels on connect
    pub fn set_connection_state(&self, state: PeerConnectionState) {
        let channels = {
            let mut inner = self.state.lock();
            inner.connection = Some(state);
            inner.channels.clone()
        };
        self.emit(PeerEvent::ConnectionStateChanged(state));
        if state == PeerConnectionState::Connected && self.auto_connect {
            for channel in channels {
                if channel.ready_state() != DataChannelState::Open {
                    channel.set_state(DataChannelState::Open);
                }
            }
        }
    }

    pub fn has_handler(&self) -> bool {
        self.handler.lock().is_some()
    }

    pub fn offers(&self) -> usize {
        self.state.lock().offers
    }

    pub fn ice_restarts(&self) -> usize {
        self.state.lock().ice_restarts
    }

    pub fn answers(&self) -> usize {
        self.state.lock().answers
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().candidates.clone()
    }

    pub fn log(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    pub fn channels(&self) -> Vec<Arc<FakeDataChannel>> {
        self.state.lock().channels.clone()
    }

    pub fn channel(&self, label: &str) -> Option<Arc<FakeDataChannel>> {
        self.channels().into_iter().find(|c| c.label == label)
    }

    pub fn set_stats(&self, stats: Vec<RtpStreamSample>) {
        self.state.lock().stats = stats;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn maybe_auto_connect(&self) {
        let ready = {
            let inner = self.state.lock();
            self.auto_connect
                && inner.local.is_some()
                && inner.remote.is_some()
                && inner.signaling == Some(SignalingState::Stable)
                && inner.connection != Some(PeerConnectionState::Connected)
                && !inner.closed
        };
        if ready {
            self.set_connection_state(PeerConnectionState::Connected);
        }
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let mut inner = self.state.lock();
        inner.offers += 1;
        if ice_restart {
            inner.ice_restarts += 1;
        }
        let sdp = format!("offer-{}", inner.offers);
        inner.log.push(format!("create_offer:{}", sdp));
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let mut inner = self.state.lock();
        if inner.remote.is_none() {
            return Err(Error::webrtc("no remote offer"));
        }
        inner.answers += 1;
        Ok(SessionDescription::answer(format!("answer-{}", inner.answers)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        {
            let mut inner = self.state.lock();
            inner.signaling = Some(match description.sdp_type {
                SdpType::Offer => SignalingState::HaveLocalOffer,
                _ => SignalingState::Stable,
            });
            inner.log.push(format!("local:{}", description.sdp));
            inner.local = Some(description);
        }
        self.maybe_auto_connect();
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        {
            let mut inner = self.state.lock();
            inner.signaling = Some(match description.sdp_type {
                SdpType::Offer => SignalingState::HaveRemoteOffer,
                _ => SignalingState::Stable,
            });
            inner.log.push(format!("remote:{}", description.sdp));
            inner.remote = Some(description);
        }
        self.maybe_auto_connect();
        Ok(())
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    fn signaling_state(&self) -> SignalingState {
        self.state
            .lock()
            .signaling
            .unwrap_or(SignalingState::Stable)
    }

    fn connection_state(&self) -> PeerConnectionState {
        self.state
            .lock()
            .connection
            .unwrap_or(PeerConnectionState::New)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut inner = self.state.lock();
        if inner.remote.is_none() {
            return Err(Error::webrtc("candidate before remote description"));
        }
        inner.log.push(format!("candidate:{}", candidate.candidate));
        inner.candidates.push(candidate);
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        _init: DataChannelInit,
    ) -> Result<Arc<dyn DataChannel>> {
        let mut inner = self.state.lock();
        let channel = FakeDataChannel::new(label, inner.channels.len() as u16);
        inner.channels.push(channel.clone());
        Ok(channel)
    }

    async fn remove_all_senders(&self) -> Result<()> {
        Ok(())
    }

    async fn stats(&self) -> Result<Vec<RtpStreamSample>> {
        Ok(self.state.lock().stats.clone())
    }

    fn set_event_handler(&self, handler: Option<PeerEventHandler>) {
        *self.handler.lock() = handler;
    }

    async fn close(&self) -> Result<()> {
        let mut inner = self.state.lock();
        inner.closed = true;
        inner.connection = Some(PeerConnectionState::Closed);
        Ok(())
    }
}

/// Hands out `FakePeer`s and remembers them in creation order
pub struct FakePeerFactory {
    peers: Mutex<Vec<Arc<FakePeer>>>,
    configs: Mutex<Vec<RtcConfiguration>>,
    auto_connect: bool,
}

impl FakePeerFactory {
    pub fn new(auto_connect: bool) -> Arc<Self> {
        Arc::new(Self {
            peers: Mutex::new(Vec::new()),
            configs: Mutex::new(Vec::new()),
            auto_connect,
        })
    }

    pub fn peers(&self) -> Vec<Arc<FakePeer>> {
        self.peers.lock().clone()
    }

    pub fn configs(&self) -> Vec<RtcConfiguration> {
        self.configs.lock().clone()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(&self, config: &RtcConfiguration) -> Result<Arc<dyn PeerConnection>> {
        let peer = FakePeer::new(self.auto_connect);
        self.peers.lock().push(peer.clone());
        self.configs.lock().push(config.clone());
        Ok(peer)
    }
}
