//! Subscriber participant collaborator and its outbound permission queue

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::Result;
use crate::spreader::TrackSender;
use crate::types::{ParticipantId, ParticipantIdentity, ParticipantState, TrackId, TrackInfo};

/// A participant that can subscribe to published tracks
pub trait LocalParticipant: Send + Sync {
    fn id(&self) -> ParticipantId;

    fn identity(&self) -> ParticipantIdentity;

    fn state(&self) -> ParticipantState;

    /// Tell the participant its access to a track changed. Must not block.
    fn subscription_permission_update(
        &self,
        publisher_id: &ParticipantId,
        track_id: &TrackId,
        allowed: bool,
    );

    /// Build the outbound sender that will carry `track` to this participant
    fn new_down_track(&self, track: &TrackInfo) -> Result<Arc<dyn TrackSender>>;
}

/// One access change destined for a subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionUpdate {
    pub publisher_id: ParticipantId,
    pub track_id: TrackId,
    pub allowed: bool,
}

/// Bounded per-participant queue of permission updates.
/// Enqueueing never blocks; a full queue drops the update.
pub struct PermissionUpdateQueue {
    participant_id: ParticipantId,
    tx: mpsc::Sender<PermissionUpdate>,
    /// Taken once by whatever drains updates towards the client
    rx: Mutex<Option<mpsc::Receiver<PermissionUpdate>>>,
    dropped: AtomicU64,
}

impl PermissionUpdateQueue {
    #[must_use]
    pub fn new(participant_id: ParticipantId, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            participant_id,
            tx,
            rx: Mutex::new(Some(rx)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Returns false if the queue is full or nobody is draining it anymore
    pub fn try_enqueue(&self, update: PermissionUpdate) -> bool {
        match self.tx.try_send(update) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(update)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    participant_id = %self.participant_id,
                    track_id = %update.track_id,
                    allowed = update.allowed,
                    "permission update queue full, dropping update"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Take the receiving end (can only be called once)
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<PermissionUpdate>> {
        self.rx.lock().take()
    }

    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
