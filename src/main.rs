//! rtc-probe - connect an engine to a signaling server and watch it

mod args;

use args::Args;
use clap::Parser;
use log::{debug, error, info, warn};
use rtc_engine_core::engine::{Engine, EngineEvent, Reliability, UserPacket};
use rtc_engine_core::signal::SignalEvent;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Config first: it carries the default log level
    let config = args.load_config()?;

    let log_level = if args.verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    env_logger::Builder::new()
        .parse_filters(&std::env::var("RTC_ENGINE_LOG").unwrap_or(log_level))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .filter_module("webrtc_sctp", log::LevelFilter::Error)
        .init();

    info!("rtc-probe v{}", env!("CARGO_PKG_VERSION"));
    info!("Using configuration {:?}", args.config);

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e);
    }

    let engine = Engine::new(config)?;
    let (_observer, events) = engine.subscribe();
    let reporter = tokio::spawn(report_events(events));

    if let Err(e) = engine.connect(&args.url, &args.token, None).await {
        error!("Failed to connect to {}: {}", args.url, e);
        reporter.abort();
        return Err(e.into());
    }
    info!("Connected to {}", args.url);

    if let Some(text) = args.send.as_ref() {
        let packet = UserPacket::new(text.clone().into_bytes());
        match engine.send(packet, Reliability::Reliable).await {
            Ok(()) => info!("Sent {} bytes on the reliable channel", text.len()),
            Err(e) => warn!("Send failed: {}", e),
        }
    }

    // Wait for shutdown signal
    let shutdown = async {
        match args.duration {
            Some(secs) => {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                info!("Probe duration elapsed");
            }
            None => {
                let _ = signal::ctrl_c().await;
                info!("Shutdown signal received");
            }
        }
    };
    shutdown.await;

    engine.disconnect().await;
    reporter.abort();
    info!("Disconnected");
    Ok(())
}

async fn report_events(mut events: mpsc::UnboundedReceiver<EngineEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::StateChanged { new, old } => {
                if new.connection_state != old.connection_state {
                    info!("Engine {} -> {}", old.connection_state, new.connection_state);
                }
            }
            EngineEvent::TrackAdded(track) => {
                info!("Track added: {} ({:?})", track.track_id, track.kind)
            }
            EngineEvent::TrackRemoved(track) => info!("Track removed: {}", track.track_id),
            EngineEvent::DataReceived(packet) => info!(
                "Data from {}: {} bytes (topic {:?})",
                packet.participant_sid,
                packet.payload.len(),
                packet.topic
            ),
            EngineEvent::SpeakersChanged(speakers) => {
                let active: Vec<&str> = speakers
                    .iter()
                    .filter(|s| s.active)
                    .map(|s| s.sid.as_str())
                    .collect();
                info!("Active speakers: {:?}", active);
            }
            EngineEvent::DataChannelStateChanged {
                target,
                reliability,
                state,
            } => debug!("{:?} {:?} channel {:?}", target, reliability, state),
            EngineEvent::StatsGenerated { target, stats } => {
                for s in &stats {
                    info!(
                        "[{:?}] {} {} up {} down {}",
                        target,
                        s.kind,
                        s.track_id,
                        s.formatted_bps_sent(),
                        s.formatted_bps_received()
                    );
                }
            }
            EngineEvent::Signal(SignalEvent::Join(join)) => info!(
                "Joined {} as {} ({} other participants)",
                join.room.name,
                join.participant.identity,
                join.other_participants.len()
            ),
            EngineEvent::Signal(SignalEvent::Leave { can_reconnect }) => {
                warn!("Server asked us to leave (can reconnect: {})", can_reconnect)
            }
            EngineEvent::Signal(other) => debug!("Signal event: {:?}", other),
        }
    }
}
