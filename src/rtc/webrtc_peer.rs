//! webrtc-rs backed peer connections

use super::peer::{
    DataChannel, DataChannelEvent, DataChannelEventHandler, DataChannelInit, DataChannelState,
    IceCandidate, PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent,
    PeerEventHandler, RemoteTrack, RtpStreamSample, SdpType, SessionDescription, SignalingState,
    TrackKind,
};
use crate::config::{IceTransportPolicy, RtcConfiguration};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, warn};
use parking_lot::RwLock;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::stats::StatsReportType;

/// Builds peer connections with the default codecs and interceptors
#[derive(Default)]
pub struct WebRtcPeerFactory;

impl WebRtcPeerFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    async fn create(&self, config: &RtcConfiguration) -> Result<Arc<dyn PeerConnection>> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        // RTCP feedback
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ice_transport_policy: match config.ice_transport_policy {
                IceTransportPolicy::All => RTCIceTransportPolicy::All,
                IceTransportPolicy::Relay => RTCIceTransportPolicy::Relay,
            },
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(rtc_config).await?);
        Ok(WebRtcPeer::new(pc))
    }
}

/// Adapter from `RTCPeerConnection` to the engine's peer seam
pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    handler: Arc<RwLock<Option<PeerEventHandler>>>,
}

impl WebRtcPeer {
    fn new(pc: Arc<RTCPeerConnection>) -> Arc<Self> {
        let peer = Arc::new(Self {
            pc,
            handler: Arc::new(RwLock::new(None)),
        });
        peer.install_callbacks();
        peer
    }

    fn install_callbacks(&self) {
        let handler = self.handler.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                emit(&handler, PeerEvent::ConnectionStateChanged(map_connection_state(state)));
                Box::pin(async {})
            }));

        let handler = self.handler.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            let handler = handler.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => emit(
                        &handler,
                        PeerEvent::IceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }),
                    ),
                    Err(e) => warn!("Failed to serialize local candidate: {}", e),
                }
            })
        }));

        let handler = self.handler.clone();
        self.pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            debug!("Remote data channel announced: {}", channel.label());
            emit(&handler, PeerEvent::DataChannel(WebRtcDataChannel::new(channel)));
            Box::pin(async {})
        }));

        let handler = self.handler.clone();
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                _ => TrackKind::Video,
            };
            emit(
                &handler,
                PeerEvent::TrackAdded(RemoteTrack {
                    track_id: track.id(),
                    stream_ids: vec![track.stream_id()],
                    kind,
                }),
            );
            Box::pin(async {})
        }));

        let handler = self.handler.clone();
        self.pc.on_negotiation_needed(Box::new(move || {
            emit(&handler, PeerEvent::NegotiationNeeded);
            Box::pin(async {})
        }));
    }
}

fn emit(handler: &RwLock<Option<PeerEventHandler>>, event: PeerEvent) {
    let handler = handler.read().clone();
    if let Some(handler) = handler {
        handler(event);
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
        _ => PeerConnectionState::New,
    }
}

fn map_signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        _ => SignalingState::Stable,
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    let sdp = description.sdp;
    let converted = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(sdp)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(sdp)?,
        SdpType::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            rollback
        }
    };
    Ok(converted)
}

fn from_rtc_description(description: RTCSessionDescription) -> SessionDescription {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        _ => SdpType::Offer,
    };
    SessionDescription {
        sdp_type,
        sdp: description.sdp,
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self.pc.create_offer(options).await?;
        Ok(from_rtc_description(offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        Ok(from_rtc_description(answer))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc_description(description)?)
            .await?;
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc_description(description)?)
            .await?;
        Ok(())
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        self.pc.remote_description().await.map(from_rtc_description)
    }

    fn signaling_state(&self) -> SignalingState {
        map_signaling_state(self.pc.signaling_state())
    }

    fn connection_state(&self) -> PeerConnectionState {
        map_connection_state(self.pc.connection_state())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        init: DataChannelInit,
    ) -> Result<Arc<dyn DataChannel>> {
        let options = RTCDataChannelInit {
            ordered: Some(init.ordered),
            max_retransmits: init.max_retransmits,
            ..Default::default()
        };
        let channel = self.pc.create_data_channel(label, Some(options)).await?;
        Ok(WebRtcDataChannel::new(channel))
    }

    async fn remove_all_senders(&self) -> Result<()> {
        for sender in self.pc.get_senders().await {
            if let Err(e) = self.pc.remove_track(&sender).await {
                warn!("Failed to remove sender: {}", e);
            }
        }
        Ok(())
    }

    async fn stats(&self) -> Result<Vec<RtpStreamSample>> {
        let report = self.pc.get_stats().await;

        let mut video_codec = None;
        let mut audio_codec = None;
        for entry in report.reports.values() {
            if let StatsReportType::Codec(codec) = entry {
                let mime = codec.mime_type.clone();
                if mime.starts_with("video/") && video_codec.is_none() {
                    video_codec = Some(mime);
                } else if mime.starts_with("audio/") && audio_codec.is_none() {
                    audio_codec = Some(mime);
                }
            }
        }
        let codec_for = |kind: &str| match kind {
            "audio" => audio_codec.clone(),
            _ => video_codec.clone(),
        };

        let mut samples = Vec::new();
        for entry in report.reports.values() {
            match entry {
                StatsReportType::InboundRTP(inbound) => {
                    let kind = inbound.kind.to_string();
                    samples.push(RtpStreamSample {
                        ssrc: inbound.ssrc.to_string(),
                        track_id: inbound.track_identifier.clone(),
                        codec: codec_for(&kind),
                        kind,
                        bytes_sent: 0,
                        bytes_received: inbound.bytes_received,
                    });
                }
                StatsReportType::OutboundRTP(outbound) => {
                    let kind = outbound.kind.to_string();
                    samples.push(RtpStreamSample {
                        ssrc: outbound.ssrc.to_string(),
                        track_id: outbound.track_identifier.clone(),
                        codec: codec_for(&kind),
                        kind,
                        bytes_sent: outbound.bytes_sent,
                        bytes_received: 0,
                    });
                }
                _ => {}
            }
        }
        Ok(samples)
    }

    fn set_event_handler(&self, handler: Option<PeerEventHandler>) {
        *self.handler.write() = handler;
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

/// Adapter from `RTCDataChannel` to the engine's data channel seam
pub struct WebRtcDataChannel {
    channel: Arc<RTCDataChannel>,
    handler: Arc<RwLock<Option<DataChannelEventHandler>>>,
}

impl WebRtcDataChannel {
    fn new(channel: Arc<RTCDataChannel>) -> Arc<Self> {
        let handler: Arc<RwLock<Option<DataChannelEventHandler>>> = Arc::new(RwLock::new(None));

        let on_open = handler.clone();
        channel.on_open(Box::new(move || {
            emit_channel(&on_open, DataChannelEvent::StateChanged(DataChannelState::Open));
            Box::pin(async {})
        }));

        let on_close = handler.clone();
        channel.on_close(Box::new(move || {
            emit_channel(&on_close, DataChannelEvent::StateChanged(DataChannelState::Closed));
            Box::pin(async {})
        }));

        let on_message = handler.clone();
        channel.on_message(Box::new(move |msg| {
            emit_channel(&on_message, DataChannelEvent::Message(msg.data));
            Box::pin(async {})
        }));

        Arc::new(Self { channel, handler })
    }
}

fn emit_channel(handler: &RwLock<Option<DataChannelEventHandler>>, event: DataChannelEvent) {
    let handler = handler.read().clone();
    if let Some(handler) = handler {
        handler(event);
    }
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn label(&self) -> String {
        self.channel.label().to_string()
    }

    fn id(&self) -> Option<u16> {
        Some(self.channel.id())
    }

    fn ready_state(&self) -> DataChannelState {
        match self.channel.ready_state() {
            RTCDataChannelState::Open => DataChannelState::Open,
            RTCDataChannelState::Closing => DataChannelState::Closing,
            RTCDataChannelState::Closed => DataChannelState::Closed,
            _ => DataChannelState::Connecting,
        }
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        if self.ready_state() != DataChannelState::Open {
            return Err(Error::state(format!(
                "data channel {} is not open",
                self.channel.label()
            )));
        }
        self.channel.send(&data).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.channel.close().await?;
        Ok(())
    }

    fn set_event_handler(&self, handler: Option<DataChannelEventHandler>) {
        *self.handler.write() = handler;
    }
}
