//! Connection Quality Scoring
//!
//! Folds per-layer loss, jitter and RTT from the ingestion buffers into a
//! single score for a published track.
//!
//! ## Quality Score
//! - 5: Excellent (RTT < 200ms, loss < 5%, jitter < 30ms)
//! - 4: Good
//! - 3: Fair
//! - 2: Poor
//! - 1: Bad
//! - 0: Unknown / No data yet
//!
//! While a video track is missing simulcast layers the score is capped at 3.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::buffer::{QualityInfo, StreamStats};
use crate::types::{TrackId, TrackKind};

/// Best score a track can reach while some of its layers are not flowing
const REDUCED_QUALITY_MAX_SCORE: u8 = 3;

/// Application-level statistics snapshot for one quality cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsStat {
    pub track_id: TrackId,
    pub kind: TrackKind,
    pub timestamp: DateTime<Utc>,
    pub score: u8,
    pub rtt_ms: u32,
    /// Packet loss rate (0.0 - 1.0)
    pub packet_loss_rate: f32,
    pub jitter_ms: f64,
    /// Delta since the previous cycle
    pub stats: StreamStats,
}

struct Sample {
    at: Instant,
    loss_rate: f32,
    rtt_ms: u32,
    jitter_ms: f64,
}

struct ConnectionState {
    score: u8,
    samples: Vec<Sample>,
}

/// Rolling quality aggregate for one track
pub struct ConnectionStats {
    track_id: TrackId,
    kind: TrackKind,
    window: Duration,
    state: Mutex<ConnectionState>,
}

impl ConnectionStats {
    #[must_use]
    pub fn new(track_id: TrackId, kind: TrackKind) -> Self {
        Self::with_window(track_id, kind, Duration::from_secs(30))
    }

    #[must_use]
    pub fn with_window(track_id: TrackId, kind: TrackKind, window: Duration) -> Self {
        Self {
            track_id,
            kind,
            window,
            state: Mutex::new(ConnectionState {
                score: 0,
                samples: Vec::new(),
            }),
        }
    }

    #[must_use]
    pub fn score(&self) -> u8 {
        self.state.lock().score
    }

    /// Fold one cycle of per-layer quality. Emits a snapshot only when media flowed.
    pub fn update(
        &self,
        layers: &[QualityInfo],
        delta: Option<StreamStats>,
        reduced_quality: bool,
    ) -> Option<AnalyticsStat> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let expected: u64 = layers.iter().map(|q| u64::from(q.packets_expected)).sum();
        if expected > 0 {
            let lost: u64 = layers.iter().map(|q| u64::from(q.packets_lost)).sum();
            state.samples.push(Sample {
                at: now,
                loss_rate: lost.min(expected) as f32 / expected as f32,
                rtt_ms: layers.iter().map(|q| q.rtt_max).max().unwrap_or(0),
                jitter_ms: layers.iter().map(|q| q.jitter_max).fold(0.0, f64::max) / 1000.0,
            });
        }

        let window = self.window;
        state
            .samples
            .retain(|s| now.saturating_duration_since(s.at) <= window);

        let (rtt_ms, loss_rate, jitter_ms) = averages(&state.samples);
        if !state.samples.is_empty() {
            state.score = calculate_quality_score(rtt_ms, loss_rate, jitter_ms);
            if reduced_quality {
                state.score = state.score.min(REDUCED_QUALITY_MAX_SCORE);
            }
        }

        let stats = delta?;
        Some(AnalyticsStat {
            track_id: self.track_id.clone(),
            kind: self.kind,
            timestamp: Utc::now(),
            score: state.score,
            rtt_ms,
            packet_loss_rate: loss_rate,
            jitter_ms,
            stats,
        })
    }
}

fn averages(samples: &[Sample]) -> (u32, f32, f64) {
    if samples.is_empty() {
        return (0, 0.0, 0.0);
    }
    let n = samples.len();
    let rtt = samples.iter().map(|s| u64::from(s.rtt_ms)).sum::<u64>() / n as u64;
    let loss = samples.iter().map(|s| s.loss_rate).sum::<f32>() / n as f32;
    let jitter = samples.iter().map(|s| s.jitter_ms).sum::<f64>() / n as f64;
    (u32::try_from(rtt).unwrap_or(u32::MAX), loss, jitter)
}

/// Calculate quality score (1-5) based on network conditions
#[must_use]
pub fn calculate_quality_score(rtt_ms: u32, packet_loss_rate: f32, jitter_ms: f64) -> u8 {
    let mut score: i8 = 5;

    // RTT penalties
    if rtt_ms >= 300 {
        score -= 2;
    } else if rtt_ms >= 200 {
        score -= 1;
    }

    // Packet loss penalties
    if packet_loss_rate >= 0.15 {
        score -= 3;
    } else if packet_loss_rate >= 0.10 {
        score -= 2;
    } else if packet_loss_rate >= 0.05 {
        score -= 1;
    }

    // Jitter penalties
    if jitter_ms >= 100.0 {
        score -= 2;
    } else if jitter_ms >= 30.0 {
        score -= 1;
    }

    score.clamp(1, 5) as u8
}
