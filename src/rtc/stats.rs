//! Per-stream transfer statistics

use super::peer::RtpStreamSample;
use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackStats {
    #[serde(skip)]
    pub created: Instant,
    pub ssrc: String,
    pub track_id: String,
    pub kind: String,
    pub codec_name: Option<String>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub bps_sent: u64,
    pub bps_received: u64,
}

impl TrackStats {
    /// Build stats for `sample`, deriving rates from the previous sample of
    /// the same stream
    pub fn from_sample(sample: &RtpStreamSample, previous: Option<&TrackStats>, now: Instant) -> Self {
        let (bps_sent, bps_received) = match previous {
            Some(prev) => {
                let secs = now.saturating_duration_since(prev.created).as_secs_f64();
                (
                    rate(sample.bytes_sent, prev.bytes_sent, secs),
                    rate(sample.bytes_received, prev.bytes_received, secs),
                )
            }
            None => (0, 0),
        };

        Self {
            created: now,
            ssrc: sample.ssrc.clone(),
            track_id: sample.track_id.clone(),
            kind: sample.kind.clone(),
            codec_name: sample.codec.clone(),
            bytes_sent: sample.bytes_sent,
            bytes_received: sample.bytes_received,
            bps_sent,
            bps_received,
        }
    }

    pub fn formatted_bps_sent(&self) -> String {
        format_bps(self.bps_sent)
    }

    pub fn formatted_bps_received(&self) -> String {
        format_bps(self.bps_received)
    }
}

fn rate(current: u64, previous: u64, secs: f64) -> u64 {
    if secs <= 0.0 {
        return 0;
    }
    (current.saturating_sub(previous) as f64 * 8.0 / secs) as u64
}

/// Human readable bitrate, e.g. `1.5Mbps`
pub fn format_bps(bps: u64) -> String {
    const ORDINALS: [&str; 5] = ["", "K", "M", "G", "T"];

    let mut value = bps as f64;
    let mut ordinal = 0;
    while value >= 1000.0 && ordinal < ORDINALS.len() - 1 {
        value /= 1000.0;
        ordinal += 1;
    }
    let rounded = (value * 100.0).round() / 100.0;
    format!("{}{}bps", rounded, ORDINALS[ordinal])
}
