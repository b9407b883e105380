//! Up track ingestion and forwarding
//!
//! A [`Receiver`] owns the simulcast layers of one published track. Each
//! bound layer gets its own forwarding task that reads ordered packets from
//! the layer's [`IngestionBuffer`] and hands them to the track's
//! [`DownTrackSpreader`]. The only way a forwarding task ends is its buffer
//! returning end-of-stream, so [`Receiver::close`] closes the buffers first.
//!
//! Lifecycle and statistics are reported through a [`ReceiverEvent`]
//! channel returned by [`Receiver::new`].

use parking_lot::RwLock;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::buffer::{AudioLevelParams, IngestionBuffer, StreamStats};
use crate::config::SfuConfig;
use crate::connection_quality::{AnalyticsStat, ConnectionStats};
use crate::error::{Error, ReadError, Result};
use crate::metrics::{Direction, MetricsSink};
use crate::spreader::{DownTrackSpreader, TrackSender};
use crate::stream_tracker::{Bitrates, StreamTracker, StreamTrackerManager};
use crate::types::{
    rid_to_layer, ParticipantId, TrackId, TrackKind, MAX_SPATIAL_LAYER, MAX_TEMPORAL_LAYER,
};

/// Notifications from a receiver to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiverEvent {
    /// One connection quality cycle completed with media flowing
    StatsUpdate(AnalyticsStat),
    /// The receiver closed. Sent exactly once.
    Closed,
}

pub struct ReceiverParams {
    pub track_id: TrackId,
    pub publisher_id: ParticipantId,
    pub kind: TrackKind,
    pub config: Arc<SfuConfig>,
    pub metrics: Arc<dyn MetricsSink>,
}

struct LayerState {
    buffers: [Option<Arc<dyn IngestionBuffer>>; MAX_SPATIAL_LAYER + 1],
    rids: [Option<String>; MAX_SPATIAL_LAYER + 1],
    rtt: u32,
}

/// Ingestion side of one published track
pub struct Receiver {
    track_id: TrackId,
    publisher_id: ParticipantId,
    kind: TrackKind,
    config: Arc<SfuConfig>,
    metrics: Arc<dyn MetricsSink>,
    layers: RwLock<LayerState>,
    spreader: DownTrackSpreader,
    stream_trackers: Option<StreamTrackerManager>,
    connection_stats: ConnectionStats,
    closed: AtomicBool,
    shutdown: CancellationToken,
    events: mpsc::UnboundedSender<ReceiverEvent>,
}

fn layer_index(layer: i32) -> Option<usize> {
    usize::try_from(layer)
        .ok()
        .filter(|l| *l <= MAX_SPATIAL_LAYER)
}

impl Receiver {
    /// Create a receiver and start its periodic quality task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(params: ReceiverParams) -> (Arc<Self>, mpsc::UnboundedReceiver<ReceiverEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let ReceiverParams {
            track_id,
            publisher_id,
            kind,
            config,
            metrics,
        } = params;

        let stream_trackers = (kind == TrackKind::Video && config.use_stream_trackers)
            .then(|| StreamTrackerManager::new(config.stream_tracker));

        let receiver = Arc::new(Self {
            spreader: DownTrackSpreader::new(
                track_id.clone(),
                config.load_balance_threshold,
                Arc::clone(&metrics),
            ),
            connection_stats: ConnectionStats::new(track_id.clone(), kind),
            track_id,
            publisher_id,
            kind,
            metrics,
            layers: RwLock::new(LayerState {
                buffers: [None, None, None],
                rids: [None, None, None],
                rtt: 0,
            }),
            stream_trackers,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            events,
            config,
        });

        info!(
            track_id = %receiver.track_id,
            publisher_id = %receiver.publisher_id,
            kind = %receiver.kind,
            "Creating receiver"
        );

        tokio::spawn(run_periodic(
            Arc::downgrade(&receiver),
            receiver.shutdown.clone(),
            receiver
                .config
                .connection_quality_interval()
                .max(Duration::from_millis(1)),
            Duration::from_millis(receiver.config.stream_tracker.cycle_duration_ms.max(1)),
        ));

        (receiver, events_rx)
    }

    #[must_use]
    pub fn track_id(&self) -> &TrackId {
        &self.track_id
    }

    #[must_use]
    pub fn publisher_id(&self) -> &ParticipantId {
        &self.publisher_id
    }

    #[must_use]
    pub const fn kind(&self) -> TrackKind {
        self.kind
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Bind an ingestion buffer to the layer named by `rid` and start forwarding it.
    ///
    /// Audio and non-simulcast video use layer 0.
    pub fn add_up_track_layer(
        self: &Arc<Self>,
        rid: &str,
        buffer: Arc<dyn IngestionBuffer>,
    ) -> Result<i32> {
        if self.is_closed() {
            return Err(Error::ReceiverClosed);
        }

        let layer = if self.kind == TrackKind::Audio {
            0
        } else {
            rid_to_layer(rid)
        };
        let idx = layer_index(layer)
            .ok_or_else(|| Error::Internal(format!("invalid layer {layer}")))?;

        let rtt = {
            let mut state = self.layers.write();
            if state.buffers[idx].is_some() {
                return Err(Error::Internal(format!("layer {layer} already bound")));
            }
            state.buffers[idx] = Some(Arc::clone(&buffer));
            state.rids[idx] = Some(rid.to_string());
            state.rtt
        };
        if self.is_closed() {
            buffer.close();
            return Err(Error::ReceiverClosed);
        }

        buffer.set_rtt(rtt);
        buffer.set_pli_throttle(self.config.pli_throttle.for_rid(rid));
        if self.kind == TrackKind::Audio {
            buffer.set_audio_level_params(AudioLevelParams::from(&self.config.audio));
        }

        let tracker = self
            .stream_trackers
            .as_ref()
            .and_then(|trackers| trackers.add_tracker(layer));

        debug!(
            track_id = %self.track_id,
            layer,
            rid,
            ssrc = buffer.ssrc(),
            "up track layer added"
        );

        tokio::spawn(Arc::clone(self).forward_rtp(layer, buffer, tracker));
        Ok(layer)
    }

    async fn forward_rtp(
        self: Arc<Self>,
        layer: i32,
        buffer: Arc<dyn IngestionBuffer>,
        tracker: Option<Arc<StreamTracker>>,
    ) {
        loop {
            let packet = match buffer.read_extended().await {
                Ok(packet) => packet,
                Err(ReadError::Eof) => {
                    debug!(track_id = %self.track_id, layer, "up track layer ended");
                    break;
                }
                Err(e) => {
                    warn!(track_id = %self.track_id, layer, error = %e, "up track read failed");
                    break;
                }
            };

            self.metrics.increment_packets(Direction::Incoming, 1);
            self.metrics
                .increment_bytes(Direction::Incoming, packet.raw_size() as u64);

            if let Some(tracker) = &tracker {
                let status = tracker.observe(
                    packet.sequence_number(),
                    packet.temporal_layer,
                    packet.raw_size(),
                    packet.payload_size(),
                );
                if let (Some(status), Some(trackers)) = (status, &self.stream_trackers) {
                    if let Some(layers) = trackers.on_status_change(layer, status) {
                        self.notify_layers_change(&layers);
                    }
                }
            }

            trace!(
                track_id = %self.track_id,
                layer,
                sn = packet.sequence_number(),
                "forwarding packet"
            );
            self.spreader.broadcast(layer, Arc::new(packet)).await;
        }

        if let Some(trackers) = &self.stream_trackers {
            if let Some(layers) = trackers.remove_tracker(layer) {
                self.notify_layers_change(&layers);
            }
        }
        self.close_once();
    }

    /// Register a subscriber's sender
    pub fn add_down_track(&self, sender: Arc<dyn TrackSender>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ReceiverClosed);
        }

        let subscriber_id = sender.subscriber_id();
        self.spreader.store(Arc::clone(&sender))?;

        // lost a race with close: the reset already ran
        if self.is_closed() {
            self.spreader.free(&subscriber_id);
            return Err(Error::ReceiverClosed);
        }

        if let Some(trackers) = &self.stream_trackers {
            let layers = trackers.available_layers();
            if !layers.is_empty() {
                sender.up_track_layers_change(&layers);
            }
        }

        debug!(
            track_id = %self.track_id,
            subscriber_id = %subscriber_id,
            "down track added"
        );
        Ok(())
    }

    /// Remove a subscriber's sender. No-op once closed.
    pub fn delete_down_track(&self, subscriber_id: &ParticipantId) {
        if self.is_closed() {
            return;
        }
        if self.spreader.free(subscriber_id).is_some() {
            debug!(
                track_id = %self.track_id,
                subscriber_id = %subscriber_id,
                "down track removed"
            );
        }
    }

    #[must_use]
    pub fn has_down_track(&self, subscriber_id: &ParticipantId) -> bool {
        self.spreader.has_down_track(subscriber_id)
    }

    #[must_use]
    pub fn get_down_tracks(&self) -> Vec<Arc<dyn TrackSender>> {
        self.spreader.get_down_tracks()
    }

    #[must_use]
    pub fn down_track_count(&self) -> usize {
        self.spreader.down_track_count()
    }

    /// Ask the publisher for a keyframe on `layer`. Returns false when throttled or unbound.
    pub fn send_pli(&self, layer: i32) -> bool {
        let Some(buffer) = self.buffer(layer) else {
            return false;
        };
        let sent = buffer.send_pli();
        if sent {
            self.metrics.increment_rtcp(Direction::Outgoing, 0, 1, 0);
        }
        sent
    }

    fn buffer(&self, layer: i32) -> Option<Arc<dyn IngestionBuffer>> {
        let idx = layer_index(layer)?;
        self.layers.read().buffers[idx].clone()
    }

    fn bound_buffers(&self) -> Vec<Arc<dyn IngestionBuffer>> {
        self.layers.read().buffers.iter().flatten().cloned().collect()
    }

    pub fn set_rtt(&self, rtt: u32) {
        let buffers = {
            let mut state = self.layers.write();
            if state.rtt == rtt {
                return;
            }
            state.rtt = rtt;
            state.buffers.iter().flatten().cloned().collect::<Vec<_>>()
        };
        for buffer in buffers {
            buffer.set_rtt(rtt);
        }
    }

    /// Pause layer tracking while the publisher is muted
    pub fn set_up_track_paused(&self, paused: bool) {
        if let Some(trackers) = &self.stream_trackers {
            trackers.set_paused(paused);
        }
    }

    pub fn set_max_expected_spatial_layer(&self, layer: i32) {
        if let Some(trackers) = &self.stream_trackers {
            trackers.set_max_expected_spatial_layer(layer);
        }
    }

    #[must_use]
    pub fn available_layers(&self) -> Vec<i32> {
        self.stream_trackers
            .as_ref()
            .map(StreamTrackerManager::available_layers)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_reduced_quality(&self) -> bool {
        self.stream_trackers
            .as_ref()
            .is_some_and(StreamTrackerManager::is_reduced_quality)
    }

    #[must_use]
    pub fn bitrate_temporal_cumulative(&self) -> Bitrates {
        self.stream_trackers.as_ref().map_or(
            [[0; MAX_TEMPORAL_LAYER + 1]; MAX_SPATIAL_LAYER + 1],
            StreamTrackerManager::bitrate_temporal_cumulative,
        )
    }

    /// Smoothed audio level of the publisher, if speaking
    #[must_use]
    pub fn audio_level(&self) -> Option<f64> {
        if self.kind != TrackKind::Audio {
            return None;
        }
        self.bound_buffers().first()?.audio_level()
    }

    /// Cumulative stats across all bound layers
    #[must_use]
    pub fn track_stats(&self) -> Option<StreamStats> {
        let stats: Vec<StreamStats> = self
            .bound_buffers()
            .iter()
            .filter_map(|b| b.stats())
            .collect();
        StreamStats::aggregate(&stats)
    }

    #[must_use]
    pub fn connection_score(&self) -> u8 {
        self.connection_stats.score()
    }

    #[must_use]
    pub fn debug_info(&self) -> serde_json::Value {
        let layers: Vec<serde_json::Value> = {
            let state = self.layers.read();
            state
                .buffers
                .iter()
                .zip(state.rids.iter())
                .enumerate()
                .filter_map(|(layer, (buffer, rid))| {
                    buffer.as_ref().map(|b| {
                        json!({
                            "layer": layer,
                            "rid": rid,
                            "ssrc": b.ssrc(),
                        })
                    })
                })
                .collect()
        };

        json!({
            "track_id": self.track_id,
            "publisher_id": self.publisher_id,
            "kind": self.kind,
            "closed": self.is_closed(),
            "down_tracks": self.down_track_count(),
            "available_layers": self.available_layers(),
            "layers": layers,
        })
    }

    /// Close every bound buffer, then tear the receiver down
    pub fn close(&self) {
        for buffer in self.bound_buffers() {
            buffer.close();
        }
        self.close_once();
    }

    fn close_once(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.shutdown.cancel();
        let down_tracks = self.spreader.reset_and_get_down_tracks();
        for down_track in &down_tracks {
            down_track.close(false);
        }

        info!(
            track_id = %self.track_id,
            down_tracks = down_tracks.len(),
            "Receiver closed"
        );
        self.emit(ReceiverEvent::Closed);
    }

    fn emit(&self, event: ReceiverEvent) {
        if self.events.send(event).is_err() {
            trace!(track_id = %self.track_id, "receiver event dropped, owner gone");
        }
    }

    fn notify_layers_change(&self, layers: &[i32]) {
        debug!(track_id = %self.track_id, ?layers, "available layers changed");
        for down_track in self.spreader.get_down_tracks() {
            down_track.up_track_layers_change(layers);
        }
    }

    fn update_quality(&self) {
        let bound: Vec<(i32, Arc<dyn IngestionBuffer>)> = {
            let layers = self.layers.read();
            (0i32..)
                .zip(layers.buffers.iter())
                .filter_map(|(layer, buffer)| Some((layer, buffer.clone()?)))
                .collect()
        };
        let quality: Vec<_> = bound.iter().filter_map(|(_, b)| b.quality_info()).collect();
        // each buffer reports under layer 0; key its delta by the layer it is bound to
        let deltas: Vec<_> = bound
            .iter()
            .filter_map(|(layer, b)| Some(b.delta_stats()?.for_layer(*layer)))
            .collect();

        if let Some(stat) = self.connection_stats.update(
            &quality,
            StreamStats::aggregate(&deltas),
            self.is_reduced_quality(),
        ) {
            self.emit(ReceiverEvent::StatsUpdate(stat));
        }
    }

    fn check_stream_trackers(&self, now: Instant) {
        let Some(trackers) = &self.stream_trackers else {
            return;
        };
        let update = trackers.check(now);
        if let Some(layers) = update.available_layers {
            self.notify_layers_change(&layers);
        }
        if update.bitrate_availability_changed {
            for down_track in self.spreader.get_down_tracks() {
                down_track.up_track_bitrate_availability_change();
            }
        }
    }
}

async fn run_periodic(
    receiver: Weak<Receiver>,
    shutdown: CancellationToken,
    quality_interval: Duration,
    tracker_interval: Duration,
) {
    let mut quality = tokio::time::interval(quality_interval);
    quality.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut trackers = tokio::time::interval(tracker_interval);
    trackers.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // both intervals fire immediately; skip that first tick
    quality.tick().await;
    trackers.tick().await;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = quality.tick() => {
                let Some(receiver) = receiver.upgrade() else { break };
                receiver.update_quality();
            }
            _ = trackers.tick() => {
                let Some(receiver) = receiver.upgrade() else { break };
                receiver.check_stream_trackers(Instant::now());
            }
        }
    }
}
