//! Down track fan-out for one published track

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::buffer::ExtPacket;
use crate::error::{Error, Result};
use crate::metrics::{Direction, MetricsSink};
use crate::types::{ParticipantId, TrackId};

/// Outbound leg towards one subscriber
#[async_trait]
pub trait TrackSender: Send + Sync {
    fn subscriber_id(&self) -> ParticipantId;

    /// Deliver one packet received on spatial `layer`
    async fn write_rtp(&self, packet: Arc<ExtPacket>, layer: i32) -> Result<()>;

    /// Available spatial layers of the up track changed
    fn up_track_layers_change(&self, layers: &[i32]);

    fn up_track_bitrate_availability_change(&self);

    /// `resume` is true when the sender is torn down for renegotiation
    fn close(&self, resume: bool);
}

type SenderList = Arc<Vec<Arc<dyn TrackSender>>>;

#[derive(Default)]
struct SpreaderState {
    by_participant: HashMap<ParticipantId, Arc<dyn TrackSender>>,
    // rebuilt on every change so broadcasts never touch the map
    list: SenderList,
}

impl SpreaderState {
    fn rebuild(&mut self) {
        self.list = Arc::new(self.by_participant.values().cloned().collect());
    }
}

/// Set of active senders for one track, keyed by subscriber participant
pub struct DownTrackSpreader {
    track_id: TrackId,
    threshold: usize,
    metrics: Arc<dyn MetricsSink>,
    state: RwLock<SpreaderState>,
}

impl DownTrackSpreader {
    /// `threshold` is the sender count at which delivery goes parallel (0 = never)
    pub fn new(track_id: TrackId, threshold: usize, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            track_id,
            threshold,
            metrics,
            state: RwLock::new(SpreaderState::default()),
        }
    }

    /// Add a sender. A participant may hold at most one sender per track.
    pub fn store(&self, sender: Arc<dyn TrackSender>) -> Result<()> {
        let subscriber_id = sender.subscriber_id();
        let mut state = self.state.write();
        if state.by_participant.contains_key(&subscriber_id) {
            return Err(Error::DownTrackAlreadyExists(subscriber_id));
        }
        state.by_participant.insert(subscriber_id, sender);
        state.rebuild();
        Ok(())
    }

    pub fn free(&self, subscriber_id: &ParticipantId) -> Option<Arc<dyn TrackSender>> {
        let mut state = self.state.write();
        let removed = state.by_participant.remove(subscriber_id);
        if removed.is_some() {
            state.rebuild();
        }
        removed
    }

    #[must_use]
    pub fn has_down_track(&self, subscriber_id: &ParticipantId) -> bool {
        self.state.read().by_participant.contains_key(subscriber_id)
    }

    #[must_use]
    pub fn get_down_tracks(&self) -> Vec<Arc<dyn TrackSender>> {
        self.state.read().list.as_ref().clone()
    }

    /// Empty the set and hand back everything it held
    pub fn reset_and_get_down_tracks(&self) -> Vec<Arc<dyn TrackSender>> {
        let mut state = self.state.write();
        let drained = std::mem::take(&mut state.by_participant);
        state.list = Arc::default();
        drained.into_values().collect()
    }

    #[must_use]
    pub fn down_track_count(&self) -> usize {
        self.state.read().list.len()
    }

    /// Deliver `packet` to every stored sender. Returns the number of successful writes.
    pub async fn broadcast(&self, layer: i32, packet: Arc<ExtPacket>) -> usize {
        let senders = Arc::clone(&self.state.read().list);
        if senders.is_empty() {
            return 0;
        }

        if self.threshold == 0 || senders.len() < self.threshold {
            let mut delivered = 0;
            for sender in senders.iter() {
                if write_one(&self.track_id, self.metrics.as_ref(), sender, &packet, layer).await {
                    delivered += 1;
                }
            }
            return delivered;
        }

        self.broadcast_parallel(layer, packet, senders).await
    }

    // Workers pull senders off a shared cursor, so a stalled sender only
    // holds up the worker that picked it.
    async fn broadcast_parallel(
        &self,
        layer: i32,
        packet: Arc<ExtPacket>,
        senders: SenderList,
    ) -> usize {
        let workers = senders.len().div_ceil(self.threshold.max(1)).max(2);
        let cursor = Arc::new(AtomicUsize::new(0));
        trace!(track_id = %self.track_id, workers, senders = senders.len(), "parallel broadcast");

        let handles = (0..workers).map(|_| {
            let senders = Arc::clone(&senders);
            let cursor = Arc::clone(&cursor);
            let packet = Arc::clone(&packet);
            let metrics = Arc::clone(&self.metrics);
            let track_id = self.track_id.clone();
            tokio::spawn(async move {
                let mut delivered = 0usize;
                loop {
                    let idx = cursor.fetch_add(1, Ordering::Relaxed);
                    let Some(sender) = senders.get(idx) else { break };
                    if write_one(&track_id, metrics.as_ref(), sender, &packet, layer).await {
                        delivered += 1;
                    }
                }
                delivered
            })
        });

        let mut delivered = 0;
        for result in join_all(handles).await {
            match result {
                Ok(count) => delivered += count,
                Err(e) => warn!(
                    track_id = %self.track_id,
                    layer,
                    error = %e,
                    "broadcast worker failed"
                ),
            }
        }
        delivered
    }
}

async fn write_one(
    track_id: &TrackId,
    metrics: &dyn MetricsSink,
    sender: &Arc<dyn TrackSender>,
    packet: &Arc<ExtPacket>,
    layer: i32,
) -> bool {
    match sender.write_rtp(Arc::clone(packet), layer).await {
        Ok(()) => {
            metrics.increment_packets(Direction::Outgoing, 1);
            metrics.increment_bytes(Direction::Outgoing, packet.raw_size() as u64);
            true
        }
        Err(e) => {
            debug!(
                track_id = %track_id,
                subscriber_id = %sender.subscriber_id(),
                error = %e,
                "down track write failed"
            );
            false
        }
    }
}
