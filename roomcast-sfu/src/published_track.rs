//! Published track handle
//!
//! [`MediaTrack`] is the surface the up track manager drives. [`PublishedTrack`]
//! implements it over a [`Receiver`], tracking which participants are
//! subscribed and running close hooks once the receiver shuts down.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::SfuConfig;
use crate::connection_quality::AnalyticsStat;
use crate::error::Result;
use crate::metrics::MetricsSink;
use crate::participant::LocalParticipant;
use crate::receiver::{Receiver, ReceiverEvent, ReceiverParams};
use crate::spreader::TrackSender;
use crate::types::{
    NodeId, ParticipantId, ParticipantIdentity, TrackId, TrackInfo, TrackKind, VideoLayer,
    VideoQuality, MAX_SPATIAL_LAYER,
};

pub type CloseHook = Box<dyn FnOnce() + Send>;

/// A track published by one participant, as seen by its up track manager
pub trait MediaTrack: Send + Sync {
    fn id(&self) -> TrackId;

    fn kind(&self) -> TrackKind;

    fn publisher_id(&self) -> ParticipantId;

    fn is_muted(&self) -> bool;

    fn set_muted(&self, muted: bool);

    /// Descriptor for signaling
    fn to_info(&self) -> TrackInfo;

    /// Start forwarding to `subscriber`. Already subscribed is not an error.
    fn add_subscriber(&self, subscriber: Arc<dyn LocalParticipant>) -> Result<()>;

    fn remove_subscriber(&self, subscriber_id: &ParticipantId, resume: bool);

    fn remove_all_subscribers(&self);

    fn is_subscriber(&self, subscriber_id: &ParticipantId) -> bool;

    /// Unsubscribe everyone whose identity is not in `allowed`; returns who was removed
    fn revoke_disallowed_subscribers(
        &self,
        allowed: &[ParticipantIdentity],
    ) -> Vec<ParticipantIdentity>;

    fn update_video_layers(&self, layers: Vec<VideoLayer>);

    /// Highest quality any subscriber on `node_id` wants
    fn notify_subscriber_node_max_quality(&self, node_id: &NodeId, quality: VideoQuality);

    /// Loss fraction (0-255) reported by subscribers on `node_id`
    fn notify_subscriber_node_media_loss(&self, node_id: &NodeId, fraction_lost: u8);

    /// Run `hook` once when the track's media ends. Runs immediately if it already has.
    fn add_on_close(&self, hook: CloseHook);

    fn restart(&self);
}

pub struct PublishedTrackParams {
    pub track_id: TrackId,
    pub name: String,
    pub kind: TrackKind,
    pub publisher_id: ParticipantId,
    pub config: Arc<SfuConfig>,
    pub metrics: Arc<dyn MetricsSink>,
}

struct Subscription {
    identity: ParticipantIdentity,
    sender: Arc<dyn TrackSender>,
}

#[derive(Default)]
struct CloseState {
    closed: bool,
    hooks: Vec<CloseHook>,
}

pub struct PublishedTrack {
    track_id: TrackId,
    name: String,
    kind: TrackKind,
    publisher_id: ParticipantId,
    receiver: Arc<Receiver>,
    muted: AtomicBool,
    layers: RwLock<Vec<VideoLayer>>,
    subscribers: RwLock<HashMap<ParticipantId, Subscription>>,
    node_max_quality: DashMap<NodeId, VideoQuality>,
    node_media_loss: DashMap<NodeId, u8>,
    last_stat: Mutex<Option<AnalyticsStat>>,
    close_state: Mutex<CloseState>,
}

impl PublishedTrack {
    /// Create the track and its receiver. Must be called from within a tokio runtime.
    pub fn new(params: PublishedTrackParams) -> Arc<Self> {
        let (receiver, events) = Receiver::new(ReceiverParams {
            track_id: params.track_id.clone(),
            publisher_id: params.publisher_id.clone(),
            kind: params.kind,
            config: params.config,
            metrics: params.metrics,
        });

        let track = Arc::new(Self {
            track_id: params.track_id,
            name: params.name,
            kind: params.kind,
            publisher_id: params.publisher_id,
            receiver,
            muted: AtomicBool::new(false),
            layers: RwLock::new(Vec::new()),
            subscribers: RwLock::new(HashMap::new()),
            node_max_quality: DashMap::new(),
            node_media_loss: DashMap::new(),
            last_stat: Mutex::new(None),
            close_state: Mutex::new(CloseState::default()),
        });

        tokio::spawn(watch_receiver(Arc::downgrade(&track), events));
        track
    }

    #[must_use]
    pub fn receiver(&self) -> &Arc<Receiver> {
        &self.receiver
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.close_state.lock().closed
    }

    /// Most recent connection quality snapshot
    #[must_use]
    pub fn last_analytics_stat(&self) -> Option<AnalyticsStat> {
        self.last_stat.lock().clone()
    }

    /// Worst loss any subscriber node reported
    #[must_use]
    pub fn max_media_loss(&self) -> u8 {
        self.node_media_loss
            .iter()
            .map(|entry| *entry.value())
            .max()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    fn refresh_max_expected_layer(&self) {
        let max_layer = if self.node_max_quality.is_empty() {
            MAX_SPATIAL_LAYER as i32
        } else {
            self.node_max_quality
                .iter()
                .filter_map(|entry| entry.value().spatial_layer())
                .max()
                .unwrap_or(-1)
        };
        self.receiver.set_max_expected_spatial_layer(max_layer);
    }

    fn handle_closed(&self) {
        self.subscribers.write().clear();
        let hooks = {
            let mut state = self.close_state.lock();
            state.closed = true;
            std::mem::take(&mut state.hooks)
        };

        info!(
            track_id = %self.track_id,
            publisher_id = %self.publisher_id,
            hooks = hooks.len(),
            "published track closed"
        );
        for hook in hooks {
            hook();
        }
    }

    fn detach(&self, subscriber_id: &ParticipantId, subscription: Subscription, resume: bool) {
        self.receiver.delete_down_track(subscriber_id);
        subscription.sender.close(resume);
        debug!(
            track_id = %self.track_id,
            subscriber_id = %subscriber_id,
            resume,
            "subscriber removed"
        );
    }
}

impl MediaTrack for PublishedTrack {
    fn id(&self) -> TrackId {
        self.track_id.clone()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn publisher_id(&self) -> ParticipantId {
        self.publisher_id.clone()
    }

    fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    fn set_muted(&self, muted: bool) {
        if self.muted.swap(muted, Ordering::AcqRel) == muted {
            return;
        }
        debug!(track_id = %self.track_id, muted, "track mute changed");
        self.receiver.set_up_track_paused(muted);
    }

    fn to_info(&self) -> TrackInfo {
        let layers = self.layers.read().clone();
        TrackInfo {
            sid: self.track_id.clone(),
            kind: self.kind,
            name: self.name.clone(),
            muted: self.is_muted(),
            simulcast: layers.len() > 1,
            layers,
        }
    }

    fn add_subscriber(&self, subscriber: Arc<dyn LocalParticipant>) -> Result<()> {
        let subscriber_id = subscriber.id();
        let mut subscribers = self.subscribers.write();
        if subscribers.contains_key(&subscriber_id) {
            return Ok(());
        }

        let sender = subscriber.new_down_track(&self.to_info())?;
        if let Err(e) = self.receiver.add_down_track(Arc::clone(&sender)) {
            sender.close(false);
            return Err(e);
        }

        subscribers.insert(
            subscriber_id.clone(),
            Subscription {
                identity: subscriber.identity(),
                sender,
            },
        );
        debug!(
            track_id = %self.track_id,
            subscriber_id = %subscriber_id,
            "subscriber added"
        );
        Ok(())
    }

    fn remove_subscriber(&self, subscriber_id: &ParticipantId, resume: bool) {
        let removed = self.subscribers.write().remove(subscriber_id);
        if let Some(subscription) = removed {
            self.detach(subscriber_id, subscription, resume);
        }
    }

    fn remove_all_subscribers(&self) {
        let drained: Vec<_> = self.subscribers.write().drain().collect();
        for (subscriber_id, subscription) in drained {
            self.detach(&subscriber_id, subscription, false);
        }
    }

    fn is_subscriber(&self, subscriber_id: &ParticipantId) -> bool {
        self.subscribers.read().contains_key(subscriber_id)
    }

    fn revoke_disallowed_subscribers(
        &self,
        allowed: &[ParticipantIdentity],
    ) -> Vec<ParticipantIdentity> {
        let revoked: Vec<(ParticipantId, Subscription)> = {
            let mut subscribers = self.subscribers.write();
            let disallowed: Vec<ParticipantId> = subscribers
                .iter()
                .filter(|(_, s)| !allowed.contains(&s.identity))
                .map(|(id, _)| id.clone())
                .collect();
            disallowed
                .into_iter()
                .filter_map(|id| subscribers.remove(&id).map(|s| (id, s)))
                .collect()
        };

        revoked
            .into_iter()
            .map(|(subscriber_id, subscription)| {
                let identity = subscription.identity.clone();
                self.detach(&subscriber_id, subscription, false);
                identity
            })
            .collect()
    }

    fn update_video_layers(&self, layers: Vec<VideoLayer>) {
        debug!(track_id = %self.track_id, count = layers.len(), "video layers updated");
        *self.layers.write() = layers;
    }

    fn notify_subscriber_node_max_quality(&self, node_id: &NodeId, quality: VideoQuality) {
        self.node_max_quality.insert(node_id.clone(), quality);
        self.refresh_max_expected_layer();
    }

    fn notify_subscriber_node_media_loss(&self, node_id: &NodeId, fraction_lost: u8) {
        self.node_media_loss.insert(node_id.clone(), fraction_lost);
    }

    fn add_on_close(&self, hook: CloseHook) {
        let mut state = self.close_state.lock();
        if state.closed {
            drop(state);
            hook();
            return;
        }
        state.hooks.push(hook);
    }

    fn restart(&self) {
        info!(track_id = %self.track_id, "restarting published track");
        self.node_max_quality.clear();
        self.node_media_loss.clear();
        self.refresh_max_expected_layer();
        for layer in self.receiver.available_layers() {
            self.receiver.send_pli(layer);
        }
    }
}

async fn watch_receiver(
    track: Weak<PublishedTrack>,
    mut events: mpsc::UnboundedReceiver<ReceiverEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(track) = track.upgrade() else { break };
        match event {
            ReceiverEvent::StatsUpdate(stat) => {
                *track.last_stat.lock() = Some(stat);
            }
            ReceiverEvent::Closed => {
                track.handle_closed();
                break;
            }
        }
    }
}
