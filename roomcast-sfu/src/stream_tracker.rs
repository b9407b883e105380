//! Simulcast layer availability tracking
//!
//! One [`StreamTracker`] per spatial layer watches packet cadence and payload
//! sizes. The [`StreamTrackerManager`] folds tracker state into the list of
//! available layers and per-layer bitrates. Changes are handed back to the
//! caller so it can notify down tracks; nothing here stores callbacks.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::StreamTrackerConfig;
use crate::types::{MAX_SPATIAL_LAYER, MAX_TEMPORAL_LAYER};

/// Consecutive out-of-window packets after which the sequence is taken as restarted
const RESYNC_AFTER_LATE: u32 = 3;

/// Bits per second, indexed by `[spatial][temporal]`
pub type Bitrates = [[i64; MAX_TEMPORAL_LAYER + 1]; MAX_SPATIAL_LAYER + 1];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Stopped,
    Active,
}

/// Outcome of one periodic tracker check
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickOutcome {
    pub status: Option<StreamStatus>,
    pub bitrate_availability_changed: bool,
}

#[derive(Debug)]
struct TrackerState {
    status: StreamStatus,
    paused: bool,
    cycle_started: Instant,
    cycle_samples: u32,
    silent_cycles: u32,
    last_sn: Option<u16>,
    late_run: u32,
    window_started: Instant,
    window_bytes: [u64; MAX_TEMPORAL_LAYER + 1],
    bitrate: [i64; MAX_TEMPORAL_LAYER + 1],
}

/// Tracks whether one spatial layer is flowing and at what bitrate
#[derive(Debug)]
pub struct StreamTracker {
    layer: i32,
    samples_required: u32,
    cycles_required: u32,
    cycle_duration: Duration,
    bitrate_interval: Duration,
    state: Mutex<TrackerState>,
}

impl StreamTracker {
    #[must_use]
    pub fn new(layer: i32, config: &StreamTrackerConfig) -> Self {
        let now = Instant::now();
        Self {
            layer,
            samples_required: config.samples_required.max(1),
            cycles_required: config.cycles_required.max(1),
            cycle_duration: Duration::from_millis(config.cycle_duration_ms),
            bitrate_interval: Duration::from_millis(config.bitrate_report_interval_ms),
            state: Mutex::new(TrackerState {
                status: StreamStatus::Stopped,
                paused: false,
                cycle_started: now,
                cycle_samples: 0,
                silent_cycles: 0,
                last_sn: None,
                late_run: 0,
                window_started: now,
                window_bytes: [0; MAX_TEMPORAL_LAYER + 1],
                bitrate: [0; MAX_TEMPORAL_LAYER + 1],
            }),
        }
    }

    #[must_use]
    pub const fn layer(&self) -> i32 {
        self.layer
    }

    #[must_use]
    pub fn status(&self) -> StreamStatus {
        self.state.lock().status
    }

    pub fn set_paused(&self, paused: bool) {
        let mut state = self.state.lock();
        state.paused = paused;
        state.silent_cycles = 0;
    }

    /// Record one received packet. Returns the new status when it changed.
    pub fn observe(
        &self,
        sn: u16,
        temporal_layer: i32,
        _raw_size: usize,
        payload_size: usize,
    ) -> Option<StreamStatus> {
        let mut state = self.state.lock();
        if state.paused {
            return None;
        }

        if let Some(last) = state.last_sn {
            // duplicates and late arrivals do not count towards liveness
            let diff = sn.wrapping_sub(last);
            if diff == 0 {
                return None;
            }
            if diff >= 0x8000 {
                state.late_run += 1;
                if state.late_run < RESYNC_AFTER_LATE {
                    return None;
                }
                debug!(layer = self.layer, last, sn, "sequence number jump, resyncing");
            }
        }
        state.late_run = 0;
        state.last_sn = Some(sn);

        let now = Instant::now();
        if now.duration_since(state.cycle_started) >= self.cycle_duration {
            state.cycle_started = now;
            state.cycle_samples = 0;
        }
        state.cycle_samples += 1;
        state.silent_cycles = 0;

        // padding-only packets carry no media
        if payload_size > 0 {
            let temporal = usize::try_from(temporal_layer)
                .unwrap_or(0)
                .min(MAX_TEMPORAL_LAYER);
            state.window_bytes[temporal] += payload_size as u64;
        }

        if state.status == StreamStatus::Stopped && state.cycle_samples >= self.samples_required {
            state.status = StreamStatus::Active;
            debug!(layer = self.layer, "stream tracker active");
            return Some(StreamStatus::Active);
        }
        None
    }

    /// Close out elapsed cycles and bitrate windows as of `now`
    pub fn tick(&self, now: Instant) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        let mut state = self.state.lock();

        if now.saturating_duration_since(state.cycle_started) >= self.cycle_duration {
            if state.cycle_samples == 0 && !state.paused {
                state.silent_cycles += 1;
                if state.silent_cycles >= self.cycles_required
                    && state.status == StreamStatus::Active
                {
                    state.status = StreamStatus::Stopped;
                    outcome.status = Some(StreamStatus::Stopped);
                    debug!(layer = self.layer, "stream tracker stopped");
                }
            }
            state.cycle_started = now;
            state.cycle_samples = 0;
        }

        let elapsed = now.saturating_duration_since(state.window_started);
        if elapsed >= self.bitrate_interval || outcome.status == Some(StreamStatus::Stopped) {
            let secs = elapsed.as_secs_f64();
            let mut bitrate = [0i64; MAX_TEMPORAL_LAYER + 1];
            if state.status == StreamStatus::Active && secs > 0.0 {
                for (rate, bytes) in bitrate.iter_mut().zip(state.window_bytes.iter()) {
                    *rate = (*bytes as f64 * 8.0 / secs) as i64;
                }
            }

            let was_available = state.bitrate.iter().any(|b| *b > 0);
            let is_available = bitrate.iter().any(|b| *b > 0);
            outcome.bitrate_availability_changed = was_available != is_available
                || state
                    .bitrate
                    .iter()
                    .zip(bitrate.iter())
                    .any(|(old, new)| (*old == 0) != (*new == 0));

            state.bitrate = bitrate;
            state.window_bytes = [0; MAX_TEMPORAL_LAYER + 1];
            state.window_started = now;
        }

        outcome
    }

    /// Latest bitrate per temporal layer (not cumulative)
    #[must_use]
    pub fn bitrate(&self) -> [i64; MAX_TEMPORAL_LAYER + 1] {
        self.state.lock().bitrate
    }
}

/// Result of a periodic check across all trackers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerUpdate {
    /// New available layer list, when it changed
    pub available_layers: Option<Vec<i32>>,
    pub bitrate_availability_changed: bool,
}

struct ManagerState {
    trackers: [Option<Arc<StreamTracker>>; MAX_SPATIAL_LAYER + 1],
    available_layers: Vec<i32>,
    max_expected_layer: i32,
    paused: bool,
}

/// Folds per-layer trackers into simulcast layer availability
pub struct StreamTrackerManager {
    config: StreamTrackerConfig,
    state: RwLock<ManagerState>,
}

fn layer_index(layer: i32) -> Option<usize> {
    usize::try_from(layer)
        .ok()
        .filter(|l| *l <= MAX_SPATIAL_LAYER)
}

impl StreamTrackerManager {
    #[must_use]
    pub fn new(config: StreamTrackerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(ManagerState {
                trackers: [None, None, None],
                available_layers: Vec::new(),
                max_expected_layer: MAX_SPATIAL_LAYER as i32,
                paused: false,
            }),
        }
    }

    /// Create the tracker for `layer`, replacing any previous one
    pub fn add_tracker(&self, layer: i32) -> Option<Arc<StreamTracker>> {
        let idx = layer_index(layer)?;
        let tracker = Arc::new(StreamTracker::new(layer, &self.config));

        let mut state = self.state.write();
        tracker.set_paused(state.paused);
        state.trackers[idx] = Some(Arc::clone(&tracker));
        Some(tracker)
    }

    /// Drop the tracker for `layer`. Returns the new available layers if they changed.
    pub fn remove_tracker(&self, layer: i32) -> Option<Vec<i32>> {
        let idx = layer_index(layer)?;
        let mut state = self.state.write();
        state.trackers[idx] = None;
        Self::refresh_available(&mut state)
    }

    /// Fold a status change reported by a tracker
    pub fn on_status_change(&self, layer: i32, status: StreamStatus) -> Option<Vec<i32>> {
        debug!(layer, ?status, "stream status changed");
        Self::refresh_available(&mut self.state.write())
    }

    /// Tick every tracker as of `now`
    pub fn check(&self, now: Instant) -> TrackerUpdate {
        let trackers: Vec<Arc<StreamTracker>> =
            self.state.read().trackers.iter().flatten().cloned().collect();

        let mut status_changed = false;
        let mut bitrate_availability_changed = false;
        for tracker in trackers {
            let outcome = tracker.tick(now);
            status_changed |= outcome.status.is_some();
            bitrate_availability_changed |= outcome.bitrate_availability_changed;
        }

        let available_layers = if status_changed {
            Self::refresh_available(&mut self.state.write())
        } else {
            None
        };

        TrackerUpdate {
            available_layers,
            bitrate_availability_changed,
        }
    }

    fn refresh_available(state: &mut ManagerState) -> Option<Vec<i32>> {
        let layers: Vec<i32> = state
            .trackers
            .iter()
            .flatten()
            .filter(|t| t.status() == StreamStatus::Active)
            .map(|t| t.layer())
            .collect();

        if layers == state.available_layers {
            return None;
        }
        state.available_layers = layers.clone();
        Some(layers)
    }

    /// Currently available spatial layers, ascending
    #[must_use]
    pub fn available_layers(&self) -> Vec<i32> {
        self.state.read().available_layers.clone()
    }

    /// Bitrates where each temporal entry includes all lower temporal layers
    #[must_use]
    pub fn bitrate_temporal_cumulative(&self) -> Bitrates {
        let state = self.state.read();
        let mut bitrates: Bitrates = [[0; MAX_TEMPORAL_LAYER + 1]; MAX_SPATIAL_LAYER + 1];
        for (spatial, tracker) in state.trackers.iter().enumerate() {
            let Some(tracker) = tracker else { continue };
            let mut running = 0i64;
            for (temporal, rate) in tracker.bitrate().iter().enumerate() {
                running += rate;
                bitrates[spatial][temporal] = if *rate > 0 { running } else { 0 };
            }
        }
        bitrates
    }

    /// Pause trackers while the publisher is muted so layers are not declared stopped
    pub fn set_paused(&self, paused: bool) {
        let mut state = self.state.write();
        state.paused = paused;
        for tracker in state.trackers.iter().flatten() {
            tracker.set_paused(paused);
        }
    }

    pub fn set_max_expected_spatial_layer(&self, layer: i32) {
        self.state.write().max_expected_layer = layer;
    }

    #[must_use]
    pub fn max_expected_spatial_layer(&self) -> i32 {
        self.state.read().max_expected_layer
    }

    /// True when the best flowing layer is below what subscribers expect
    #[must_use]
    pub fn is_reduced_quality(&self) -> bool {
        let state = self.state.read();
        if state.trackers.iter().all(Option::is_none) {
            return false;
        }
        match state.available_layers.last() {
            Some(best) => *best < state.max_expected_layer,
            None => true,
        }
    }
}
