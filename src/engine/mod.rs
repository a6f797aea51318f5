//! Engine
//!
//! Owns the signal client and the publisher/subscriber transports. Drives the
//! connect sequence, recovers broken sessions with quick or full reconnects
//! and gates the data channel send path on transport readiness.
//!
//! Signal, transport and data channel events are funneled through one worker
//! task so they are handled one at a time, in arrival order. `connect` and
//! reconnects are serialized against each other; cleanups are not, so a
//! cleanup can always interrupt a pending wait. Every cleanup that ends the
//! session advances a session counter, and an interrupted sequence checks it
//! after each step so it never revives a session the user already left.

pub mod data;
mod state;

pub use data::{
    ActiveSpeakerUpdate, DataPacket, DataPacketValue, Reliability, UserPacket, LOSSY_LABEL,
    RELIABLE_LABEL,
};
pub use state::EngineSnapshot;

use crate::config::{ConnectOptions, EngineConfig, IceTransportPolicy};
use crate::error::{Error, Result};
use crate::rtc::peer::{
    DataChannel, DataChannelEvent, DataChannelState, PeerConnectionFactory, PeerConnectionState,
    PeerEvent, RemoteTrack, SessionDescription,
};
use crate::rtc::stats::TrackStats;
use crate::rtc::transport::{Transport, TransportEvent, TransportEventHandler, TransportOptions};
use crate::signal::protocol::{DataChannelInfo, JoinResponse, SignalTarget, SpeakerInfo};
use crate::signal::validate::Validator;
use crate::signal::websocket::SignalConnector;
use crate::signal::{SignalClient, SignalEvent};
use crate::state::{ConnectionState, DisconnectReason, ReconnectMode};
use crate::support::condition_queue::{Action, Condition};
use crate::support::{retry, ConditionQueue, ObserverId, Observers, StateSync};
use futures::FutureExt;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use state::EngineState;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

/// Notifications fanned out to engine observers
#[derive(Debug, Clone)]
pub enum EngineEvent {
    StateChanged {
        new: EngineSnapshot,
        old: EngineSnapshot,
    },
    /// Remote track on the subscriber; held back until the engine is connected
    TrackAdded(RemoteTrack),
    TrackRemoved(RemoteTrack),
    DataReceived(UserPacket),
    SpeakersChanged(Vec<SpeakerInfo>),
    DataChannelStateChanged {
        target: SignalTarget,
        reliability: Reliability,
        state: DataChannelState,
    },
    StatsGenerated {
        target: SignalTarget,
        stats: Vec<TrackStats>,
    },
    /// Room-level signaling the engine does not consume itself
    Signal(SignalEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChannelSlot {
    target: SignalTarget,
    reliability: Reliability,
}

enum EngineInput {
    Signal(SignalEvent),
    Transport {
        generation: u64,
        target: SignalTarget,
        event: TransportEvent,
    },
    DataChannel {
        generation: u64,
        slot: ChannelSlot,
        event: DataChannelEvent,
    },
}

#[derive(Default)]
struct RtcObjects {
    publisher: Option<Arc<Transport>>,
    subscriber: Option<Arc<Transport>>,
    subscriber_primary: bool,
    reliable_pub: Option<Arc<dyn DataChannel>>,
    lossy_pub: Option<Arc<dyn DataChannel>>,
    reliable_sub: Option<Arc<dyn DataChannel>>,
    lossy_sub: Option<Arc<dyn DataChannel>>,
}

struct Inner {
    config: EngineConfig,
    state: StateSync<EngineState>,
    signal: SignalClient,
    peer_factory: Arc<dyn PeerConnectionFactory>,
    rtc: Mutex<RtcObjects>,
    /// Bumped whenever transports are created or torn down
    transport_generation: AtomicU64,
    op_lock: tokio::sync::Mutex<()>,
    reconnecting: AtomicBool,
    queue: Arc<ConditionQueue<EngineSnapshot>>,
    observers: Arc<Observers<EngineEvent>>,
    input: mpsc::UnboundedSender<EngineInput>,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Engine over tokio-tungstenite signaling and webrtc-rs peers
    ///
    /// Must be called inside a tokio runtime.
    #[cfg(feature = "webrtc-rs")]
    pub fn new(config: EngineConfig) -> Result<Self> {
        use crate::rtc::webrtc_peer::WebRtcPeerFactory;
        use crate::signal::{HttpValidator, WebSocketConnector};

        let validator = HttpValidator::new(config.timeouts.http_validate())?;
        Ok(Self::with_seams(
            config,
            Arc::new(WebSocketConnector),
            Arc::new(validator),
            Arc::new(WebRtcPeerFactory::new()),
        ))
    }

    /// Must be called inside a tokio runtime.
    pub fn with_seams(
        config: EngineConfig,
        connector: Arc<dyn SignalConnector>,
        validator: Arc<dyn Validator>,
        peer_factory: Arc<dyn PeerConnectionFactory>,
    ) -> Self {
        let signal = SignalClient::new(connector, validator, config.timeouts.clone());
        let observers: Arc<Observers<EngineEvent>> = Arc::new(Observers::new());
        let queue: Arc<ConditionQueue<EngineSnapshot>> = Arc::new(ConditionQueue::new());
        let state = StateSync::new(EngineState::new(config.connect.clone()));

        let hook_queue = queue.clone();
        let hook_observers = observers.clone();
        state.set_on_mutate(Box::new(move |new: &EngineState, old: &EngineState| {
            let (new, old) = (new.snapshot(), old.snapshot());
            if new == old {
                return;
            }
            if new.connection_state != old.connection_state {
                info!(
                    "Engine state {} -> {} (reconnect mode {:?})",
                    old.connection_state, new.connection_state, new.reconnect_mode
                );
            }
            hook_observers.notify(EngineEvent::StateChanged {
                new: new.clone(),
                old: old.clone(),
            });
            hook_queue.process(&new, &old);
        }));

        let (input, rx) = mpsc::unbounded_channel();
        let signal_input = input.clone();
        signal.register(move |event| signal_input.send(EngineInput::Signal(event)).is_ok());

        let inner = Arc::new(Inner {
            config,
            state,
            signal,
            peer_factory,
            rtc: Mutex::new(RtcObjects::default()),
            transport_generation: AtomicU64::new(0),
            op_lock: tokio::sync::Mutex::new(()),
            reconnecting: AtomicBool::new(false),
            queue,
            observers,
            input,
        });
        tokio::spawn(run_worker(Arc::downgrade(&inner), rx));
        Self { inner }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn signal_client(&self) -> &SignalClient {
        &self.inner.signal
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.read(|s| s.connection_state.clone())
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.inner.state.read(|s| s.snapshot())
    }

    pub fn publisher(&self) -> Option<Arc<Transport>> {
        self.inner.rtc.lock().publisher.clone()
    }

    pub fn subscriber(&self) -> Option<Arc<Transport>> {
        self.inner.rtc.lock().subscriber.clone()
    }

    pub fn subscribe(&self) -> (ObserverId, mpsc::UnboundedReceiver<EngineEvent>) {
        self.inner.observers.subscribe()
    }

    pub fn unsubscribe(&self, id: ObserverId) {
        self.inner.observers.unsubscribe(id);
    }

    /// Connect to `url`, replacing any previous session
    ///
    /// `options` replaces the stored connect options when given; they are
    /// kept for later connects and reconnects.
    pub async fn connect(
        &self,
        url: &str,
        token: &str,
        options: Option<ConnectOptions>,
    ) -> Result<()> {
        if let Some(options) = options {
            self.inner.state.mutate(|s| s.connect_options = options);
        }

        let _serial = self.inner.op_lock.lock().await;
        self.clean_up_internal(None, false).await;
        let session = self.inner.state.mutate(|s| {
            s.connection_state = ConnectionState::Connecting;
            s.session
        });

        match self.full_connect_sequence(url, token, session).await {
            Ok(()) => {
                let current = self.inner.state.mutate(|s| {
                    if s.session != session {
                        return false;
                    }
                    s.url = Some(url.to_string());
                    s.token = Some(token.to_string());
                    s.connection_state = ConnectionState::Connected;
                    true
                });
                if !current {
                    return Err(self.abandon_sequence().await);
                }
                info!("Connect sequence completed");
                Ok(())
            }
            Err(_) if !self.is_current(session) => Err(self.abandon_sequence().await),
            Err(e) => {
                error!("Connect sequence failed: {}", e);
                self.clean_up_internal(Some(DisconnectReason::NetworkError(e.clone())), false)
                    .await;
                Err(e)
            }
        }
    }

    /// Leave the session and tear everything down
    pub async fn disconnect(&self) {
        if !self.connection_state().is_disconnected() {
            if let Err(e) = self.inner.signal.send_leave().await {
                warn!("Failed to send leave: {}", e);
            }
        }
        self.clean_up(Some(DisconnectReason::User)).await;
    }

    /// Reset signal client, transports and engine state; safe to repeat
    pub async fn clean_up(&self, reason: Option<DisconnectReason>) {
        self.clean_up_internal(reason, false).await;
    }

    async fn clean_up_internal(&self, reason: Option<DisconnectReason>, full_reconnect: bool) {
        debug!(
            "Engine cleanup, reason: {:?}, full reconnect: {}",
            reason, full_reconnect
        );
        self.inner
            .state
            .mutate(|s| *s = s.after_cleanup(reason.clone(), full_reconnect));
        self.inner.signal.clean_up(reason).await;
        self.clean_up_rtc().await;
    }

    async fn clean_up_rtc(&self) {
        self.inner.transport_generation.fetch_add(1, Ordering::SeqCst);
        let rtc = std::mem::take(&mut *self.inner.rtc.lock());

        let channels = [rtc.reliable_pub, rtc.lossy_pub, rtc.reliable_sub, rtc.lossy_sub];
        for channel in channels.into_iter().flatten() {
            channel.set_event_handler(None);
            if let Err(e) = channel.close().await {
                debug!("Closing data channel {} failed: {}", channel.label(), e);
            }
        }

        for transport in [rtc.publisher, rtc.subscriber].into_iter().flatten() {
            if let Err(e) = transport.close().await {
                warn!("{}", e);
            }
        }
        self.inner.state.mutate(|s| s.has_published = false);
    }

    fn is_current(&self, session: u64) -> bool {
        self.inner.state.read(|s| s.session == session)
    }

    /// Fails once a cleanup has ended `session`
    async fn ensure_current(&self, session: u64) -> Result<()> {
        if self.is_current(session) {
            return Ok(());
        }
        Err(self.abandon_sequence().await)
    }

    /// Close whatever an interrupted sequence opened after the cleanup ran
    async fn abandon_sequence(&self) -> Error {
        info!("Session ended by a cleanup, abandoning sequence");
        self.inner.signal.clean_up(None).await;
        self.clean_up_rtc().await;
        Error::state("session was cleaned up")
    }

    async fn full_connect_sequence(&self, url: &str, token: &str, session: u64) -> Result<()> {
        let (options, reconnect_mode) = self
            .inner
            .state
            .read(|s| (s.connect_options.clone(), s.reconnect_mode));

        self.inner
            .signal
            .connect(
                url,
                token,
                &options,
                self.inner.config.room.adaptive_stream,
                reconnect_mode,
            )
            .await?;
        self.ensure_current(session).await?;

        let join = self.inner.signal.wait_join_response().await?;
        self.ensure_current(session).await?;
        self.configure_transports(&join, &options).await?;
        self.ensure_current(session).await?;
        self.inner.signal.resume_response_queue().await;

        let primary = self
            .inner
            .state
            .read(|s| s.primary_transport_connected.clone());
        primary
            .wait(
                self.inner.config.timeouts.transport_state(),
                Error::timeout("primary transport didn't connect"),
            )
            .await?;
        self.ensure_current(session).await
    }

    async fn configure_transports(
        &self,
        join: &JoinResponse,
        options: &ConnectOptions,
    ) -> Result<()> {
        let mut rtc_config = options.rtc_configuration.clone();
        rtc_config.apply_ice_servers(&join.ice_servers);
        if join.forces_relay() {
            rtc_config.ice_transport_policy = IceTransportPolicy::Relay;
        }
        let subscriber_primary = join.subscriber_primary;
        info!(
            "Configuring transports, subscriber primary: {}, relay only: {}",
            subscriber_primary,
            rtc_config.ice_transport_policy == IceTransportPolicy::Relay
        );

        let generation = self.inner.transport_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let transport_options = TransportOptions::from(&self.inner.config.timeouts);

        let publisher_pc = self.inner.peer_factory.create(&rtc_config).await?;
        let subscriber_pc = self.inner.peer_factory.create(&rtc_config).await?;
        let publisher = Transport::new(
            publisher_pc,
            SignalTarget::Publisher,
            !subscriber_primary,
            transport_options,
            self.transport_handler(generation, SignalTarget::Publisher),
        );
        let subscriber = Transport::new(
            subscriber_pc,
            SignalTarget::Subscriber,
            subscriber_primary,
            transport_options,
            self.transport_handler(generation, SignalTarget::Subscriber),
        );

        let signal = self.inner.signal.clone();
        publisher.set_on_offer(Arc::new(move |offer: SessionDescription| {
            let signal = signal.clone();
            async move { signal.send_offer(offer).await }.boxed()
        }));

        let report_stats = self.inner.config.room.report_stats;
        publisher.set_report_stats(report_stats);
        subscriber.set_report_stats(report_stats);

        {
            let mut rtc = self.inner.rtc.lock();
            rtc.publisher = Some(publisher.clone());
            rtc.subscriber = Some(subscriber);
            rtc.subscriber_primary = subscriber_primary;
        }

        // always created, older servers expect them on the publisher
        let reliable = publisher
            .create_data_channel(RELIABLE_LABEL, Reliability::Reliable.channel_init())
            .await?;
        let lossy = publisher
            .create_data_channel(LOSSY_LABEL, Reliability::Lossy.channel_init())
            .await?;
        for (channel, reliability) in [
            (&reliable, Reliability::Reliable),
            (&lossy, Reliability::Lossy),
        ] {
            self.attach_data_channel(
                channel,
                generation,
                ChannelSlot {
                    target: SignalTarget::Publisher,
                    reliability,
                },
            );
        }
        {
            let mut rtc = self.inner.rtc.lock();
            rtc.reliable_pub = Some(reliable);
            rtc.lossy_pub = Some(lossy);
        }

        if !subscriber_primary {
            // nothing else would trigger the first publisher offer
            self.ensure_publisher_negotiated()?;
        }
        Ok(())
    }

    fn transport_handler(&self, generation: u64, target: SignalTarget) -> TransportEventHandler {
        let input = self.inner.input.clone();
        Arc::new(move |event: TransportEvent| {
            let _ = input.send(EngineInput::Transport {
                generation,
                target,
                event,
            });
        })
    }

    fn attach_data_channel(
        &self,
        channel: &Arc<dyn DataChannel>,
        generation: u64,
        slot: ChannelSlot,
    ) {
        let input = self.inner.input.clone();
        channel.set_event_handler(Some(Arc::new(move |event: DataChannelEvent| {
            let _ = input.send(EngineInput::DataChannel {
                generation,
                slot,
                event,
            });
        })));
    }

    /// Mark the session as publishing and schedule a publisher offer
    pub fn ensure_publisher_negotiated(&self) -> Result<()> {
        let publisher = self
            .publisher()
            .ok_or_else(|| Error::state("publisher is missing"))?;
        self.inner.state.mutate(|s| s.has_published = true);
        publisher.negotiate();
        Ok(())
    }

    /// Send a user packet on the publisher's reliable or lossy channel
    ///
    /// Unless the subscriber is primary, waits for the publisher transport and
    /// the matching channel to be ready first.
    pub async fn send(&self, packet: UserPacket, reliability: Reliability) -> Result<()> {
        let (publisher, subscriber_primary) = {
            let rtc = self.inner.rtc.lock();
            (rtc.publisher.clone(), rtc.subscriber_primary)
        };

        if !subscriber_primary {
            let publisher = publisher.ok_or_else(|| Error::state("publisher is missing"))?;
            if publisher.connection_state() != PeerConnectionState::Connected {
                self.ensure_publisher_negotiated()?;
            }

            let (transport_ready, channel_open) = self.inner.state.read(|s| {
                let channel = match reliability {
                    Reliability::Reliable => s.publisher_reliable_open.clone(),
                    Reliability::Lossy => s.publisher_lossy_open.clone(),
                };
                (s.publisher_transport_connected.clone(), channel)
            });
            let timeouts = &self.inner.config.timeouts;
            tokio::try_join!(
                transport_ready.wait(
                    timeouts.transport_state(),
                    Error::timeout("publisher didn't connect")
                ),
                channel_open.wait(
                    timeouts.publisher_data_channel_open(),
                    Error::timeout("publisher data channel didn't open")
                ),
            )?;
        }

        let channel = {
            let rtc = self.inner.rtc.lock();
            match reliability {
                Reliability::Reliable => rtc.reliable_pub.clone(),
                Reliability::Lossy => rtc.lossy_pub.clone(),
            }
        }
        .ok_or_else(|| Error::state("data channel is missing"))?;

        let data = DataPacket::user(packet, reliability).encode()?;
        channel.send(data).await
    }

    /// Publisher channel labels and ids, for sync-state after a migration
    pub fn data_channel_info(&self) -> Vec<DataChannelInfo> {
        let channels = {
            let rtc = self.inner.rtc.lock();
            [rtc.lossy_pub.clone(), rtc.reliable_pub.clone()]
        };
        channels
            .into_iter()
            .flatten()
            .filter_map(|channel| {
                channel.id().map(|id| DataChannelInfo {
                    label: channel.label(),
                    id,
                    target: SignalTarget::Publisher,
                })
            })
            .collect()
    }

    /// Run `action` once the engine is connected, or drop it on disconnect
    pub fn execute_if_connected(&self, action: impl FnOnce() + Send + 'static) {
        self.execute(
            Box::new(|s: &EngineSnapshot, _: Option<&EngineSnapshot>| {
                s.connection_state.is_connected()
            }),
            Box::new(|s: &EngineSnapshot, _: Option<&EngineSnapshot>| {
                s.connection_state.is_disconnected()
            }),
            Box::new(action),
        );
    }

    pub fn execute(
        &self,
        execute: Condition<EngineSnapshot>,
        remove: Condition<EngineSnapshot>,
        action: Action,
    ) {
        // queued under the state lock so no transition slips in between
        let ready = self.inner.state.read(|s| {
            let current = s.snapshot();
            if execute(&current, None) {
                return Some(action);
            }
            self.inner.queue.execute(&current, execute, remove, action);
            None
        });
        if let Some(action) = ready {
            action();
        }
    }

    fn transport(&self, target: SignalTarget) -> Option<Arc<Transport>> {
        let rtc = self.inner.rtc.lock();
        match target {
            SignalTarget::Publisher => rtc.publisher.clone(),
            SignalTarget::Subscriber => rtc.subscriber.clone(),
        }
    }

    fn primary_target(&self) -> SignalTarget {
        if self.inner.rtc.lock().subscriber_primary {
            SignalTarget::Subscriber
        } else {
            SignalTarget::Publisher
        }
    }

    async fn on_signal_event(&self, event: SignalEvent) {
        match event {
            SignalEvent::StateChanged { new, old } => {
                let lost = new != old
                    && new
                        .reason()
                        .map(|reason| reason.is_network_error())
                        .unwrap_or(false);
                if lost {
                    info!("Signal connection lost: {}", new);
                    self.start_reconnect();
                }
            }
            SignalEvent::Answer(answer) => match self.transport(SignalTarget::Publisher) {
                Some(publisher) => {
                    if let Err(e) = publisher.set_remote_description(answer).await {
                        error!("Failed to apply publisher answer: {}", e);
                    }
                }
                None => warn!("Answer received without a publisher"),
            },
            SignalEvent::Offer(offer) => match self.transport(SignalTarget::Subscriber) {
                Some(subscriber) => {
                    if let Err(e) = self.answer_offer(&subscriber, offer).await {
                        error!("Failed to answer subscriber offer: {}", e);
                    }
                }
                None => warn!("Offer received without a subscriber"),
            },
            SignalEvent::Trickle { candidate, target } => match self.transport(target) {
                Some(transport) => {
                    if let Err(e) = transport.add_ice_candidate(candidate).await {
                        error!("Failed to add {:?} candidate: {}", target, e);
                    }
                }
                None => warn!("Candidate received without a {:?} transport", target),
            },
            SignalEvent::TokenRefreshed(token) => {
                debug!("Token refreshed");
                self.inner.state.mutate(|s| s.token = Some(token.clone()));
                self.inner
                    .observers
                    .notify(EngineEvent::Signal(SignalEvent::TokenRefreshed(token)));
            }
            SignalEvent::Leave { can_reconnect } => {
                info!("Server requested leave, can reconnect: {}", can_reconnect);
                if can_reconnect {
                    self.inner.state.mutate(|s| {
                        s.next_preferred_reconnect_mode = Some(ReconnectMode::Full)
                    });
                } else {
                    let engine = self.clone();
                    tokio::spawn(async move {
                        let error = Error::Disconnected("server requested leave".to_string());
                        engine
                            .clean_up(Some(DisconnectReason::NetworkError(error)))
                            .await;
                    });
                }
                self.inner
                    .observers
                    .notify(EngineEvent::Signal(SignalEvent::Leave { can_reconnect }));
            }
            other => self.inner.observers.notify(EngineEvent::Signal(other)),
        }
    }

    async fn answer_offer(
        &self,
        subscriber: &Transport,
        offer: SessionDescription,
    ) -> Result<()> {
        subscriber.set_remote_description(offer).await?;
        let answer = subscriber.create_answer().await?;
        self.inner.signal.send_answer(answer).await
    }

    async fn on_transport_event(
        &self,
        generation: u64,
        target: SignalTarget,
        event: TransportEvent,
    ) {
        if generation != self.inner.transport_generation.load(Ordering::SeqCst) {
            debug!("Ignoring event from a stale {:?} transport", target);
            return;
        }

        let peer_event = match event {
            TransportEvent::Stats(stats) => {
                self.inner
                    .observers
                    .notify(EngineEvent::StatsGenerated { target, stats });
                return;
            }
            TransportEvent::Peer(peer_event) => peer_event,
        };

        match peer_event {
            PeerEvent::ConnectionStateChanged(pc_state) => {
                self.on_transport_state(target, pc_state)
            }
            PeerEvent::IceCandidate(candidate) => {
                if let Err(e) = self.inner.signal.send_candidate(&candidate, target).await {
                    warn!("Failed to trickle {:?} candidate: {}", target, e);
                }
            }
            PeerEvent::DataChannel(channel) => {
                self.on_remote_data_channel(generation, target, channel)
            }
            PeerEvent::TrackAdded(track) => {
                debug!("Remote track {} added on {:?}", track.track_id, target);
                let observers = self.inner.observers.clone();
                self.execute_if_connected(move || {
                    observers.notify(EngineEvent::TrackAdded(track));
                });
            }
            PeerEvent::TrackRemoved(track) => {
                self.inner.observers.notify(EngineEvent::TrackRemoved(track));
            }
            PeerEvent::NegotiationNeeded => debug!("{:?} reports negotiation needed", target),
        }
    }

    fn on_transport_state(&self, target: SignalTarget, pc_state: PeerConnectionState) {
        debug!("{:?} transport {:?}", target, pc_state);
        let primary = self.primary_target() == target;
        let connected = (pc_state == PeerConnectionState::Connected).then_some(());

        let (primary_connected, publisher_connected, has_published, engine_connected) =
            self.inner.state.read(|s| {
                (
                    s.primary_transport_connected.clone(),
                    s.publisher_transport_connected.clone(),
                    s.has_published,
                    s.connection_state.is_connected(),
                )
            });
        if primary {
            primary_connected.set_opt(connected);
        }
        if target == SignalTarget::Publisher {
            publisher_connected.set_opt(connected);
        }

        let watched = primary || (target == SignalTarget::Publisher && has_published);
        if engine_connected && watched && pc_state.is_lost() {
            info!("{:?} transport lost ({:?})", target, pc_state);
            self.start_reconnect();
        }
    }

    fn on_remote_data_channel(
        &self,
        generation: u64,
        target: SignalTarget,
        channel: Arc<dyn DataChannel>,
    ) {
        let label = channel.label();
        if target != SignalTarget::Subscriber || !self.inner.rtc.lock().subscriber_primary {
            debug!("Ignoring data channel {} on {:?}", label, target);
            return;
        }
        let Some(reliability) = Reliability::from_label(&label) else {
            warn!("Unknown data channel label {}", label);
            return;
        };

        info!("Server opened data channel {}", label);
        self.attach_data_channel(
            &channel,
            generation,
            ChannelSlot {
                target: SignalTarget::Subscriber,
                reliability,
            },
        );
        let mut rtc = self.inner.rtc.lock();
        match reliability {
            Reliability::Reliable => rtc.reliable_sub = Some(channel),
            Reliability::Lossy => rtc.lossy_sub = Some(channel),
        }
    }

    fn on_data_channel_event(&self, generation: u64, slot: ChannelSlot, event: DataChannelEvent) {
        if generation != self.inner.transport_generation.load(Ordering::SeqCst) {
            return;
        }

        match event {
            DataChannelEvent::StateChanged(state) => {
                debug!("Data channel {} {:?}", slot.reliability.label(), state);
                if slot.target == SignalTarget::Publisher {
                    let completer = self.inner.state.read(|s| match slot.reliability {
                        Reliability::Reliable => s.publisher_reliable_open.clone(),
                        Reliability::Lossy => s.publisher_lossy_open.clone(),
                    });
                    completer.set_opt((state == DataChannelState::Open).then_some(()));
                }
                self.inner.observers.notify(EngineEvent::DataChannelStateChanged {
                    target: slot.target,
                    reliability: slot.reliability,
                    state,
                });
            }
            DataChannelEvent::Message(data) => match DataPacket::decode(&data) {
                Ok(packet) => match packet.value {
                    DataPacketValue::User(user) => {
                        self.inner.observers.notify(EngineEvent::DataReceived(user))
                    }
                    DataPacketValue::Speaker(update) => self
                        .inner
                        .observers
                        .notify(EngineEvent::SpeakersChanged(update.speakers)),
                },
                Err(e) => warn!("Dropping data packet: {}", e),
            },
        }
    }

    fn start_reconnect(&self) {
        if !self.connection_state().is_connected() {
            return;
        }
        if self.inner.reconnecting.swap(true, Ordering::SeqCst) {
            debug!("Reconnect already running");
            return;
        }
        let engine = self.clone();
        tokio::spawn(async move {
            engine.reconnect().await;
            engine.inner.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    async fn reconnect(&self) {
        let _serial = self.inner.op_lock.lock().await;
        let current = self.inner.state.read(|s| {
            if !s.connection_state.is_connected() {
                return None;
            }
            let (url, token) = s.url.clone().zip(s.token.clone())?;
            Some((url, token, s.session))
        });
        let Some((url, token, session)) = current else {
            debug!("Session is gone, skipping reconnect");
            return;
        };

        let timeouts = &self.inner.config.timeouts;
        let result = retry(
            timeouts.reconnect_attempts,
            timeouts.quick_reconnect_retry(),
            || {
                let mode = self.inner.state.mutate(|s| {
                    if s.session != session {
                        return None;
                    }
                    let full = s.next_preferred_reconnect_mode == Some(ReconnectMode::Full)
                        || s.reconnect_mode == Some(ReconnectMode::Full);
                    let mode = if full {
                        ReconnectMode::Full
                    } else {
                        ReconnectMode::Quick
                    };
                    s.connection_state = ConnectionState::Reconnecting;
                    s.reconnect_mode = Some(mode);
                    s.next_preferred_reconnect_mode = None;
                    Some(mode)
                });
                let engine = self.clone();
                let (url, token) = (url.clone(), token.clone());
                async move {
                    match mode {
                        Some(ReconnectMode::Quick) => {
                            engine.quick_reconnect_sequence(&url, &token, session).await
                        }
                        Some(ReconnectMode::Full) => engine.full_reconnect_sequence(session).await,
                        None => Err(Error::state("session was cleaned up")),
                    }
                }
            },
            |remaining, error| {
                let (reconnecting, mode, preferred) = self.inner.state.read(|s| {
                    (
                        s.connection_state.is_reconnecting(),
                        s.reconnect_mode,
                        s.next_preferred_reconnect_mode,
                    )
                });
                if !reconnecting || mode == Some(ReconnectMode::Full) {
                    return false;
                }
                info!(
                    "Reconnect attempt failed ({}), retrying in {:?}, {} tries left",
                    error,
                    timeouts.quick_reconnect_retry(),
                    remaining
                );
                if remaining == 1 && preferred.is_none() {
                    // last try goes full
                    self.inner.state.mutate(|s| {
                        s.next_preferred_reconnect_mode = Some(ReconnectMode::Full)
                    });
                }
                true
            },
        )
        .await;

        match result {
            Ok(()) => {
                let current = self.inner.state.mutate(|s| {
                    if s.session != session {
                        return false;
                    }
                    if s.connection_state.is_reconnecting() {
                        s.connection_state = ConnectionState::Connected;
                        s.reconnect_mode = None;
                    }
                    true
                });
                if !current {
                    self.abandon_sequence().await;
                    return;
                }
                info!("Reconnect sequence completed");
            }
            Err(e) => {
                warn!("Reconnect sequence failed: {}", e);
                if !self.is_current(session) {
                    self.abandon_sequence().await;
                } else if self.connection_state().is_reconnecting() {
                    self.clean_up_internal(Some(DisconnectReason::NetworkError(e)), false)
                        .await;
                }
            }
        }
    }

    async fn quick_reconnect_sequence(&self, url: &str, token: &str, session: u64) -> Result<()> {
        info!("Starting quick reconnect");
        let options = self.inner.state.read(|s| s.connect_options.clone());
        self.inner
            .signal
            .connect(
                url,
                token,
                &options,
                self.inner.config.room.adaptive_stream,
                Some(ReconnectMode::Quick),
            )
            .await?;
        self.ensure_current(session).await?;

        let timeouts = &self.inner.config.timeouts;
        let primary = self
            .inner
            .state
            .read(|s| s.primary_transport_connected.clone());
        primary
            .wait(
                timeouts.transport_state(),
                Error::timeout("primary transport didn't connect"),
            )
            .await?;
        self.ensure_current(session).await?;

        if let Some(subscriber) = self.transport(SignalTarget::Subscriber) {
            subscriber.set_restarting_ice(false);
        }

        let has_published = self.inner.state.read(|s| s.has_published);
        if let (Some(publisher), true) = (self.transport(SignalTarget::Publisher), has_published) {
            publisher.create_and_send_offer(true).await?;
            let publisher_connected = self
                .inner
                .state
                .read(|s| s.publisher_transport_connected.clone());
            publisher_connected
                .wait(
                    timeouts.transport_state(),
                    Error::timeout("publisher transport didn't connect"),
                )
                .await?;
            self.ensure_current(session).await?;
        }

        self.inner.signal.send_queued_requests().await;
        Ok(())
    }

    async fn full_reconnect_sequence(&self, session: u64) -> Result<()> {
        info!("Starting full reconnect");
        self.clean_up_internal(None, true).await;
        self.ensure_current(session).await?;

        let (url, token) = self
            .inner
            .state
            .read(|s| s.url.clone().zip(s.token.clone()))
            .ok_or_else(|| Error::state("url or token is missing"))?;

        self.full_connect_sequence(&url, &token, session).await?;
        self.inner.signal.send_queued_requests().await;
        Ok(())
    }
}

async fn run_worker(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<EngineInput>) {
    while let Some(input) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let engine = Engine { inner };
        match input {
            EngineInput::Signal(event) => engine.on_signal_event(event).await,
            EngineInput::Transport {
                generation,
                target,
                event,
            } => engine.on_transport_event(generation, target, event).await,
            EngineInput::DataChannel {
                generation,
                slot,
                event,
            } => engine.on_data_channel_event(generation, slot, event),
        }
    }
    debug!("Engine worker stopped");
}
