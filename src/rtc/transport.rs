//! Peer transport
//!
//! Wraps one peer connection in the publisher or subscriber role. Offer
//! creation, remote description application and candidate application run
//! one at a time, so candidates that arrive before the remote description (or
//! during an ICE restart) are buffered and applied in arrival order right
//! after it.

use super::peer::{
    DataChannel, DataChannelInit, IceCandidate, PeerConnection, PeerConnectionState, PeerEvent,
    SessionDescription, SignalingState,
};
use super::stats::TrackStats;
use crate::config::Timeouts;
use crate::error::{Error, Result};
use crate::signal::protocol::SignalTarget;
use crate::support::Debouncer;
use futures::future::BoxFuture;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub type OfferHandler = Arc<dyn Fn(SessionDescription) -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub type TransportEventHandler = Arc<dyn Fn(TransportEvent) + Send + Sync>;

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Peer(PeerEvent),
    Stats(Vec<TrackStats>),
}

#[derive(Debug, Clone, Copy)]
pub struct TransportOptions {
    pub negotiation_debounce: Duration,
    pub stats_interval: Duration,
}

impl From<&Timeouts> for TransportOptions {
    fn from(timeouts: &Timeouts) -> Self {
        Self {
            negotiation_debounce: timeouts.negotiation_debounce(),
            stats_interval: timeouts.stats_interval(),
        }
    }
}

pub struct Transport {
    target: SignalTarget,
    primary: bool,
    pc: Arc<dyn PeerConnection>,
    restarting_ice: AtomicBool,
    renegotiate: AtomicBool,
    pending_candidates: Mutex<Vec<IceCandidate>>,
    on_offer: RwLock<Option<OfferHandler>>,
    negotiation: Debouncer,
    op_lock: tokio::sync::Mutex<()>,
    events: TransportEventHandler,
    stats_interval: Duration,
    stats_task: Mutex<Option<JoinHandle<()>>>,
    previous_stats: Mutex<HashMap<String, TrackStats>>,
    closed: AtomicBool,
    weak_self: Weak<Transport>,
}

impl Transport {
    pub fn new(
        pc: Arc<dyn PeerConnection>,
        target: SignalTarget,
        primary: bool,
        options: TransportOptions,
        events: TransportEventHandler,
    ) -> Arc<Self> {
        let transport = Arc::new_cyclic(|weak| Transport {
            target,
            primary,
            pc,
            restarting_ice: AtomicBool::new(false),
            renegotiate: AtomicBool::new(false),
            pending_candidates: Mutex::new(Vec::new()),
            on_offer: RwLock::new(None),
            negotiation: Debouncer::new(options.negotiation_debounce),
            op_lock: tokio::sync::Mutex::new(()),
            events,
            stats_interval: options.stats_interval,
            stats_task: Mutex::new(None),
            previous_stats: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            weak_self: weak.clone(),
        });

        let sink = transport.events.clone();
        transport
            .pc
            .set_event_handler(Some(Arc::new(move |event: PeerEvent| {
                sink(TransportEvent::Peer(event))
            })));
        transport
    }

    pub fn target(&self) -> SignalTarget {
        self.target
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn connection_state(&self) -> PeerConnectionState {
        self.pc.connection_state()
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.pc.signaling_state()
    }

    pub fn is_restarting_ice(&self) -> bool {
        self.restarting_ice.load(Ordering::SeqCst)
    }

    pub fn set_restarting_ice(&self, restarting: bool) {
        self.restarting_ice.store(restarting, Ordering::SeqCst);
    }

    pub fn set_on_offer(&self, handler: OfferHandler) {
        *self.on_offer.write() = Some(handler);
    }

    /// Apply a remote candidate, or hold it until the remote description lands
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let _serial = self.op_lock.lock().await;
        if self.pc.remote_description().await.is_some() && !self.is_restarting_ice() {
            return self.pc.add_ice_candidate(candidate).await;
        }
        debug!("[{:?}] buffering candidate", self.target);
        self.pending_candidates.lock().push(candidate);
        Ok(())
    }

    pub async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let _serial = self.op_lock.lock().await;
        self.pc.set_remote_description(description).await?;

        let pending = std::mem::take(&mut *self.pending_candidates.lock());
        for candidate in pending {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                warn!("[{:?}] failed to apply buffered candidate: {}", self.target, e);
            }
        }
        self.restarting_ice.store(false, Ordering::SeqCst);

        if self.renegotiate.swap(false, Ordering::SeqCst) {
            debug!("[{:?}] renegotiating after deferred offer", self.target);
            self.create_and_send_offer_locked(false).await?;
        }
        Ok(())
    }

    /// Answer the remote offer currently applied
    pub async fn create_answer(&self) -> Result<SessionDescription> {
        let _serial = self.op_lock.lock().await;
        let answer = self.pc.create_answer().await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    /// Debounced offer; a burst of calls yields one offer
    pub fn negotiate(&self) {
        if self.closed.load(Ordering::SeqCst) {
            debug!("[{:?}] closed, skipping negotiation", self.target);
            return;
        }
        let weak = self.weak_self.clone();
        self.negotiation.schedule(async move {
            if let Some(transport) = weak.upgrade() {
                if let Err(e) = transport.create_and_send_offer(false).await {
                    warn!("[{:?}] negotiation failed: {}", transport.target, e);
                }
            }
        });
    }

    pub async fn create_and_send_offer(&self, ice_restart: bool) -> Result<()> {
        let _serial = self.op_lock.lock().await;
        self.create_and_send_offer_locked(ice_restart).await
    }

    async fn create_and_send_offer_locked(&self, ice_restart: bool) -> Result<()> {
        let handler = self.on_offer.read().clone();
        let on_offer = match handler {
            Some(handler) => handler,
            None => {
                warn!("[{:?}] no offer handler set", self.target);
                return Ok(());
            }
        };

        if ice_restart {
            info!("[{:?}] restarting ICE", self.target);
            self.restarting_ice.store(true, Ordering::SeqCst);
        }

        if self.pc.signaling_state() == SignalingState::HaveLocalOffer {
            match (ice_restart, self.pc.remote_description().await) {
                (true, Some(remote)) => {
                    // settle the outstanding offer before restarting
                    self.pc.set_remote_description(remote).await?;
                }
                _ => {
                    debug!("[{:?}] offer outstanding, deferring", self.target);
                    self.renegotiate.store(true, Ordering::SeqCst);
                    return Ok(());
                }
            }
        }

        let offer = self.pc.create_offer(ice_restart).await?;
        self.pc.set_local_description(offer.clone()).await?;
        on_offer(offer).await
    }

    pub async fn create_data_channel(
        &self,
        label: &str,
        init: DataChannelInit,
    ) -> Result<Arc<dyn DataChannel>> {
        self.pc.create_data_channel(label, init).await
    }

    /// Start or stop the periodic stats sampler
    pub fn set_report_stats(&self, enabled: bool) {
        let mut task = self.stats_task.lock();
        if !enabled {
            if let Some(handle) = task.take() {
                handle.abort();
            }
            return;
        }
        if task.is_some() || self.closed.load(Ordering::SeqCst) {
            return;
        }

        let weak = self.weak_self.clone();
        let interval = self.stats_interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(transport) = weak.upgrade() else {
                    break;
                };
                if transport.closed.load(Ordering::SeqCst) {
                    break;
                }
                match transport.collect_stats().await {
                    Ok(stats) if !stats.is_empty() => (transport.events)(TransportEvent::Stats(stats)),
                    Ok(_) => {}
                    Err(e) => debug!("[{:?}] stats unavailable: {}", transport.target, e),
                }
            }
        }));
    }

    /// Sample the peer connection once and derive rates against the last sample
    pub async fn collect_stats(&self) -> Result<Vec<TrackStats>> {
        let samples = self.pc.stats().await?;
        let now = Instant::now();
        let mut previous = self.previous_stats.lock();
        let stats: Vec<TrackStats> = samples
            .iter()
            .map(|sample| TrackStats::from_sample(sample, previous.get(&sample.ssrc), now))
            .collect();
        *previous = stats
            .iter()
            .map(|s| (s.ssrc.clone(), s.clone()))
            .collect();
        Ok(stats)
    }

    /// Idempotent; detaches listeners and senders before closing
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.negotiation.cancel();
        if let Some(handle) = self.stats_task.lock().take() {
            handle.abort();
        }

        let _serial = self.op_lock.lock().await;
        self.pc.set_event_handler(None);
        if let Err(e) = self.pc.remove_all_senders().await {
            debug!("[{:?}] removing senders failed: {}", self.target, e);
        }
        self.pc
            .close()
            .await
            .map_err(|e| Error::webrtc(format!("closing {:?} transport: {}", self.target, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtc::peer::RtpStreamSample;
    use crate::testing::FakePeer;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;

    fn options() -> TransportOptions {
        TransportOptions {
            negotiation_debounce: Duration::from_millis(100),
            stats_interval: Duration::from_secs(1),
        }
    }

    fn candidate(name: &str) -> IceCandidate {
        IceCandidate {
            candidate: name.to_string(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    fn transport(peer: &Arc<FakePeer>) -> (Arc<Transport>, Arc<Mutex<Vec<TransportEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let transport = Transport::new(
            peer.clone(),
            SignalTarget::Subscriber,
            true,
            options(),
            Arc::new(move |event: TransportEvent| sink.lock().push(event)),
        );
        (transport, events)
    }

    fn counting_offers(transport: &Transport) -> Arc<AtomicUsize> {
        let sent = Arc::new(AtomicUsize::new(0));
        let counter = sent.clone();
        transport.set_on_offer(Arc::new(move |_offer: SessionDescription| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<(), Error>(()) }.boxed()
        }));
        sent
    }

    #[tokio::test]
    async fn test_candidates_buffered_until_remote_description() {
        let peer = FakePeer::new(false);
        let (transport, _) = transport(&peer);

        transport.add_ice_candidate(candidate("c1")).await.unwrap();
        transport.add_ice_candidate(candidate("c2")).await.unwrap();
        assert!(peer.candidates().is_empty());

        transport
            .set_remote_description(SessionDescription::offer("remote"))
            .await
            .unwrap();
        transport.add_ice_candidate(candidate("c3")).await.unwrap();

        assert_eq!(
            peer.log(),
            vec!["remote:remote", "candidate:c1", "candidate:c2", "candidate:c3"]
        );
    }

    #[tokio::test]
    async fn test_candidates_buffered_while_restarting_ice() {
        let peer = FakePeer::new(false);
        let (transport, _) = transport(&peer);
        let _offers = counting_offers(&transport);

        transport
            .set_remote_description(SessionDescription::answer("first"))
            .await
            .unwrap();
        transport.create_and_send_offer(true).await.unwrap();
        assert!(transport.is_restarting_ice());

        transport.add_ice_candidate(candidate("late")).await.unwrap();
        assert!(peer.candidates().is_empty());

        transport
            .set_remote_description(SessionDescription::answer("second"))
            .await
            .unwrap();
        assert!(!transport.is_restarting_ice());
        assert_eq!(peer.candidates(), vec![candidate("late")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiate_burst_sends_one_offer() {
        let peer = FakePeer::new(false);
        let (transport, _) = transport(&peer);
        let sent = counting_offers(&transport);

        for _ in 0..5 {
            transport.negotiate();
        }
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(sent.load(Ordering::SeqCst), 1);
        assert_eq!(peer.offers(), 1);
    }

    #[tokio::test]
    async fn test_offer_deferred_while_outstanding() {
        let peer = FakePeer::new(false);
        let (transport, _) = transport(&peer);
        let sent = counting_offers(&transport);

        transport.create_and_send_offer(false).await.unwrap();
        assert_eq!(transport.signaling_state(), SignalingState::HaveLocalOffer);

        transport.create_and_send_offer(false).await.unwrap();
        assert_eq!(sent.load(Ordering::SeqCst), 1);

        // the answer triggers the deferred renegotiation
        transport
            .set_remote_description(SessionDescription::answer("a1"))
            .await
            .unwrap();
        assert_eq!(sent.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_ice_restart_settles_outstanding_offer_first() {
        let peer = FakePeer::new(false);
        let (transport, _) = transport(&peer);
        let sent = counting_offers(&transport);

        transport.create_and_send_offer(false).await.unwrap();
        transport
            .set_remote_description(SessionDescription::answer("a1"))
            .await
            .unwrap();
        transport.create_and_send_offer(false).await.unwrap();
        assert_eq!(transport.signaling_state(), SignalingState::HaveLocalOffer);

        transport.create_and_send_offer(true).await.unwrap();
        assert_eq!(sent.load(Ordering::SeqCst), 3);
        assert_eq!(peer.ice_restarts(), 1);
        let log = peer.log();
        let reapplied = log.iter().rposition(|l| l == "remote:a1").unwrap();
        let restart_offer = log.iter().rposition(|l| l == "create_offer:offer-3").unwrap();
        assert!(reapplied < restart_offer);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_detaches() {
        let peer = FakePeer::new(false);
        let (transport, _) = transport(&peer);
        assert!(peer.has_handler());

        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(peer.is_closed());
        assert!(!peer.has_handler());
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiate_after_close_is_ignored() {
        let peer = FakePeer::new(false);
        let (transport, _) = transport(&peer);
        let sent = counting_offers(&transport);

        transport.close().await.unwrap();
        transport.negotiate();
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(sent.load(Ordering::SeqCst), 0);
        assert_eq!(peer.offers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_sampler_reports_rates() {
        let peer = FakePeer::new(false);
        let (transport, events) = transport(&peer);
        peer.set_stats(vec![RtpStreamSample {
            ssrc: "42".into(),
            bytes_sent: 0,
            ..Default::default()
        }]);

        transport.set_report_stats(true);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        peer.set_stats(vec![RtpStreamSample {
            ssrc: "42".into(),
            bytes_sent: 125_000,
            ..Default::default()
        }]);
        tokio::time::sleep(Duration::from_secs(1)).await;
        transport.set_report_stats(false);

        let events = events.lock();
        let last = events
            .iter()
            .rev()
            .find_map(|e| match e {
                TransportEvent::Stats(stats) => Some(stats.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(last[0].bps_sent, 1_000_000);
    }
}
