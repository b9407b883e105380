//! Published track registry and subscription gate for one participant
//!
//! The [`UpTrackManager`] owns every track a participant publishes and
//! decides who may subscribe to them. Subscribers without permission are
//! parked as pending and reinstated when a later permission update allows
//! them; subscribers that lose permission are revoked back to pending.
//!
//! Permission changes towards subscribers go through
//! [`LocalParticipant::subscription_permission_update`], which must not
//! block. They are collected while the manager lock is held and dispatched
//! after it is released.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::error::{AddSubscriberError, Error, Result};
use crate::participant::LocalParticipant;
use crate::permission::{
    ParticipantResolverById, ParticipantResolverByIdentity, SubscriberGrants,
    SubscriptionPermission,
};
use crate::published_track::MediaTrack;
use crate::types::{
    NodeId, ParticipantId, ParticipantIdentity, ParticipantState, TrackId, TrackInfo, VideoLayer,
    VideoQuality,
};

/// Notifications from the manager to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpTrackEvent {
    /// A published track changed. `only_if_ready` is set when the track ended
    /// on its own and the owner should only signal it to a ready client.
    TrackUpdated {
        track_id: TrackId,
        only_if_ready: bool,
    },
    /// The manager is closed and holds no tracks. Sent exactly once.
    Closed,
}

/// Which tracks an [`UpTrackManager::add_subscriber`] call targets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddSubscriberParams {
    pub all_tracks: bool,
    /// Ignored when `all_tracks` is set. Unknown IDs are skipped.
    pub track_ids: Vec<TrackId>,
}

impl AddSubscriberParams {
    #[must_use]
    pub fn all_tracks() -> Self {
        Self {
            all_tracks: true,
            track_ids: Vec::new(),
        }
    }

    #[must_use]
    pub fn tracks(track_ids: Vec<TrackId>) -> Self {
        Self {
            all_tracks: false,
            track_ids,
        }
    }
}

struct PermissionNotice {
    subscriber: Arc<dyn LocalParticipant>,
    track_id: TrackId,
    allowed: bool,
}

#[derive(Default)]
struct ManagerState {
    closed: bool,
    close_notified: bool,
    published_tracks: HashMap<TrackId, Arc<dyn MediaTrack>>,
    /// Last permission as received, kept for migration
    permission: Option<SubscriptionPermission>,
    grants: SubscriberGrants,
    pending: HashMap<TrackId, HashSet<ParticipantIdentity>>,
}

impl ManagerState {
    /// Returns true when the identity was not already pending
    fn add_pending(&mut self, track_id: &TrackId, identity: &ParticipantIdentity) -> bool {
        self.pending
            .entry(track_id.clone())
            .or_default()
            .insert(identity.clone())
    }

    fn remove_pending(&mut self, track_id: &TrackId, identity: &ParticipantIdentity) {
        if let Some(pending) = self.pending.get_mut(track_id) {
            pending.remove(identity);
            if pending.is_empty() {
                self.pending.remove(track_id);
            }
        }
    }

    /// True exactly once: the first time the manager is closed and empty
    fn take_close_notification(&mut self) -> bool {
        if self.closed && self.published_tracks.is_empty() && !self.close_notified {
            self.close_notified = true;
            return true;
        }
        false
    }

    fn process_pending(
        &mut self,
        resolve_by_identity: ParticipantResolverByIdentity<'_>,
        notices: &mut Vec<PermissionNotice>,
    ) {
        let pending = std::mem::take(&mut self.pending);
        for (track_id, identities) in pending {
            let Some(track) = self.published_tracks.get(&track_id).cloned() else {
                continue;
            };

            let mut still_pending = HashSet::new();
            for identity in identities {
                let Some(subscriber) = resolve_by_identity(&identity) else {
                    debug!(track_id = %track_id, subscriber = %identity, "dropping pending subscription, subscriber gone");
                    continue;
                };
                if subscriber.state() == ParticipantState::Disconnected {
                    debug!(track_id = %track_id, subscriber = %identity, "dropping pending subscription, subscriber disconnected");
                    continue;
                }

                if !self.grants.has_permission(&track_id, &identity) {
                    still_pending.insert(identity);
                    continue;
                }

                match track.add_subscriber(Arc::clone(&subscriber)) {
                    Ok(()) => {
                        info!(track_id = %track_id, subscriber = %identity, "reinstated pending subscription");
                        notices.push(PermissionNotice {
                            subscriber,
                            track_id: track_id.clone(),
                            allowed: true,
                        });
                    }
                    Err(e) => {
                        // may be transient, retry on the next update
                        warn!(
                            track_id = %track_id,
                            subscriber = %identity,
                            error = %e,
                            "error reinstating pending subscription"
                        );
                        still_pending.insert(identity);
                    }
                }
            }

            if !still_pending.is_empty() {
                self.pending.insert(track_id, still_pending);
            }
        }
    }

    fn revoke_disallowed(
        &mut self,
        resolve_by_identity: ParticipantResolverByIdentity<'_>,
        notices: &mut Vec<PermissionNotice>,
    ) {
        let tracks: Vec<Arc<dyn MediaTrack>> = self.published_tracks.values().cloned().collect();
        for track in tracks {
            let track_id = track.id();
            let Some(allowed) = self.grants.allowed_subscribers(&track_id) else {
                continue;
            };

            for identity in track.revoke_disallowed_subscribers(&allowed) {
                info!(track_id = %track_id, subscriber = %identity, "revoked subscription");
                let Some(subscriber) = resolve_by_identity(&identity) else {
                    continue;
                };
                if self.add_pending(&track_id, &identity) {
                    notices.push(PermissionNotice {
                        subscriber,
                        track_id: track_id.clone(),
                        allowed: false,
                    });
                }
            }
        }
    }
}

pub struct UpTrackManager {
    participant_id: ParticipantId,
    state: RwLock<ManagerState>,
    events: mpsc::UnboundedSender<UpTrackEvent>,
}

impl UpTrackManager {
    pub fn new(participant_id: ParticipantId) -> (Arc<Self>, mpsc::UnboundedReceiver<UpTrackEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            participant_id,
            state: RwLock::new(ManagerState::default()),
            events,
        });
        (manager, events_rx)
    }

    #[must_use]
    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    fn emit(&self, event: UpTrackEvent) {
        if self.events.send(event).is_err() {
            trace!(participant_id = %self.participant_id, "up track event dropped, owner gone");
        }
    }

    fn track_updated(&self, track_id: TrackId, only_if_ready: bool) {
        self.emit(UpTrackEvent::TrackUpdated {
            track_id,
            only_if_ready,
        });
    }

    fn dispatch(&self, notices: Vec<PermissionNotice>) {
        for notice in notices {
            notice.subscriber.subscription_permission_update(
                &self.participant_id,
                &notice.track_id,
                notice.allowed,
            );
        }
    }

    /// Register a track. A second call for a registered ID changes nothing.
    pub fn add_published_track(self: &Arc<Self>, track: Arc<dyn MediaTrack>) {
        let track_id = track.id();
        {
            let mut state = self.state.write();
            if state.published_tracks.contains_key(&track_id) {
                debug!(participant_id = %self.participant_id, track_id = %track_id, "track already published");
                return;
            }
            state
                .published_tracks
                .insert(track_id.clone(), Arc::clone(&track));
        }

        info!(participant_id = %self.participant_id, track_id = %track_id, kind = %track.kind(), "track published");

        let manager = Arc::downgrade(self);
        let instance = Arc::downgrade(&track);
        track.add_on_close(Box::new(move || {
            if let Some(manager) = manager.upgrade() {
                manager.on_track_closed(&track_id, &instance);
            }
        }));
    }

    fn on_track_closed(&self, track_id: &TrackId, instance: &Weak<dyn MediaTrack>) {
        let (removed, notify_close) = {
            let mut state = self.state.write();
            let is_current = state
                .published_tracks
                .get(track_id)
                .is_some_and(|t| Weak::ptr_eq(instance, &Arc::downgrade(t)));
            if is_current {
                state.published_tracks.remove(track_id);
                state.pending.remove(track_id);
            }
            (is_current, state.take_close_notification())
        };

        if removed {
            info!(participant_id = %self.participant_id, track_id = %track_id, "published track ended");
            self.track_updated(track_id.clone(), true);
        }
        if notify_close {
            self.emit(UpTrackEvent::Closed);
        }
    }

    /// Detach every subscriber from `track` and deregister it
    pub fn remove_published_track(&self, track: &Arc<dyn MediaTrack>) {
        track.remove_all_subscribers();

        let track_id = track.id();
        let (is_current, notify_close) = {
            let mut state = self.state.write();
            let is_current = state
                .published_tracks
                .get(&track_id)
                .is_some_and(|t| Arc::ptr_eq(t, track));
            if is_current {
                state.published_tracks.remove(&track_id);
                state.pending.remove(&track_id);
            }
            (is_current, state.take_close_notification())
        };

        if is_current {
            info!(participant_id = %self.participant_id, track_id = %track_id, "published track removed");
        } else {
            debug!(participant_id = %self.participant_id, track_id = %track_id, "ignoring removal of a replaced track");
        }
        if notify_close {
            self.emit(UpTrackEvent::Closed);
        }
    }

    /// Subscribe to the targeted tracks, or park the subscriber as pending
    /// where it lacks permission. Returns how many tracks were subscribed.
    pub fn add_subscriber(
        &self,
        subscriber: Arc<dyn LocalParticipant>,
        params: AddSubscriberParams,
    ) -> std::result::Result<usize, AddSubscriberError> {
        let identity = subscriber.identity();
        let mut notices = Vec::new();

        let result = {
            let mut state = self.state.write();
            let tracks: Vec<Arc<dyn MediaTrack>> = if params.all_tracks {
                state.published_tracks.values().cloned().collect()
            } else {
                params
                    .track_ids
                    .iter()
                    .filter_map(|id| state.published_tracks.get(id).cloned())
                    .collect()
            };
            if tracks.is_empty() {
                return Ok(0);
            }

            debug!(
                participant_id = %self.participant_id,
                subscriber = %identity,
                subscriber_id = %subscriber.id(),
                tracks = tracks.len(),
                "subscribing participant to tracks"
            );

            let mut subscribed = 0;
            let mut failure = None;
            for track in tracks {
                let track_id = track.id();
                if !state.grants.has_permission(&track_id, &identity) {
                    if state.add_pending(&track_id, &identity) {
                        debug!(track_id = %track_id, subscriber = %identity, "subscription pending permission");
                        notices.push(PermissionNotice {
                            subscriber: Arc::clone(&subscriber),
                            track_id,
                            allowed: false,
                        });
                    }
                    continue;
                }

                if let Err(e) = track.add_subscriber(Arc::clone(&subscriber)) {
                    failure = Some(AddSubscriberError {
                        subscribed,
                        source: e,
                    });
                    break;
                }
                state.remove_pending(&track_id, &identity);
                subscribed += 1;
            }

            failure.map_or(Ok(subscribed), Err)
        };

        self.dispatch(notices);
        result
    }

    /// Detach `subscriber` from one track and forget any pending request for it
    pub fn remove_subscriber(
        &self,
        subscriber: &Arc<dyn LocalParticipant>,
        track_id: &TrackId,
        resume: bool,
    ) {
        if let Some(track) = self.published_track(track_id) {
            track.remove_subscriber(&subscriber.id(), resume);
        }
        self.state
            .write()
            .remove_pending(track_id, &subscriber.identity());
    }

    /// Apply a publisher's permission update.
    ///
    /// `None` is stored as-is and leaves the derived grants untouched. A
    /// permission that fails to parse is rejected and the previous one stays
    /// in force.
    pub fn update_subscription_permission(
        &self,
        permission: Option<SubscriptionPermission>,
        resolve_by_identity: ParticipantResolverByIdentity<'_>,
        resolve_by_id: ParticipantResolverById<'_>,
    ) -> Result<()> {
        let mut notices = Vec::new();
        {
            let mut state = self.state.write();
            let Some(permission) = permission else {
                debug!(participant_id = %self.participant_id, "subscription permission cleared");
                state.permission = None;
                return Ok(());
            };

            let grants = match SubscriberGrants::parse(&permission, resolve_by_id) {
                Ok(grants) => grants,
                Err(e) => {
                    warn!(
                        participant_id = %self.participant_id,
                        error = %e,
                        "rejecting subscription permission"
                    );
                    return Err(e);
                }
            };
            state.permission = Some(permission);
            state.grants = grants;

            state.process_pending(resolve_by_identity, &mut notices);
            state.revoke_disallowed(resolve_by_identity, &mut notices);
        }

        self.dispatch(notices);
        Ok(())
    }

    #[must_use]
    pub fn subscription_permission(&self) -> Option<SubscriptionPermission> {
        self.state.read().permission.clone()
    }

    #[must_use]
    pub fn has_permission(&self, track_id: &TrackId, identity: &ParticipantIdentity) -> bool {
        self.state.read().grants.has_permission(track_id, identity)
    }

    /// Identities waiting for permission on `track_id`
    #[must_use]
    pub fn pending_subscribers(&self, track_id: &TrackId) -> Vec<ParticipantIdentity> {
        self.state
            .read()
            .pending
            .get(track_id)
            .map(|p| p.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn require_track(&self, track_id: &TrackId) -> Result<Arc<dyn MediaTrack>> {
        self.published_track(track_id).ok_or_else(|| {
            warn!(participant_id = %self.participant_id, track_id = %track_id, "could not find track");
            Error::TrackNotFound(track_id.clone())
        })
    }

    pub fn set_published_track_muted(
        &self,
        track_id: &TrackId,
        muted: bool,
    ) -> Result<Arc<dyn MediaTrack>> {
        let track = self.require_track(track_id)?;
        let was_muted = track.is_muted();
        track.set_muted(muted);
        if was_muted != muted {
            debug!(track_id = %track_id, muted, "mute status changed");
        }
        self.track_updated(track_id.clone(), false);
        Ok(track)
    }

    pub fn update_video_layers(&self, track_id: &TrackId, layers: Vec<VideoLayer>) -> Result<()> {
        let track = self.require_track(track_id)?;
        track.update_video_layers(layers);
        self.track_updated(track_id.clone(), false);
        Ok(())
    }

    pub fn update_subscribed_quality(
        &self,
        node_id: &NodeId,
        track_id: &TrackId,
        max_quality: VideoQuality,
    ) -> Result<()> {
        let track = self.require_track(track_id)?;
        track.notify_subscriber_node_max_quality(node_id, max_quality);
        self.track_updated(track_id.clone(), false);
        Ok(())
    }

    /// `fractional_loss` is the RTCP fraction lost (0-255); larger values saturate
    pub fn update_media_loss(
        &self,
        node_id: &NodeId,
        track_id: &TrackId,
        fractional_loss: u32,
    ) -> Result<()> {
        let track = self.require_track(track_id)?;
        track.notify_subscriber_node_media_loss(
            node_id,
            u8::try_from(fractional_loss).unwrap_or(u8::MAX),
        );
        self.track_updated(track_id.clone(), false);
        Ok(())
    }

    #[must_use]
    pub fn published_track(&self, track_id: &TrackId) -> Option<Arc<dyn MediaTrack>> {
        self.state.read().published_tracks.get(track_id).cloned()
    }

    #[must_use]
    pub fn published_tracks(&self) -> Vec<Arc<dyn MediaTrack>> {
        self.state.read().published_tracks.values().cloned().collect()
    }

    #[must_use]
    pub fn published_track_infos(&self) -> Vec<TrackInfo> {
        self.published_tracks()
            .iter()
            .map(|t| t.to_info())
            .collect()
    }

    /// Mark closing and detach all subscribers. The owner hears `Closed` once
    /// the last track is gone.
    pub fn close(&self) {
        let notify_close = {
            let mut state = self.state.write();
            state.closed = true;
            state.take_close_notification()
        };

        for track in self.published_tracks() {
            track.remove_all_subscribers();
        }

        info!(participant_id = %self.participant_id, "up track manager closing");
        if notify_close {
            self.emit(UpTrackEvent::Closed);
        }
    }

    pub fn restart(&self) {
        for track in self.published_tracks() {
            track.restart();
        }
    }

    #[must_use]
    pub fn debug_info(&self) -> serde_json::Value {
        let state = self.state.read();
        let tracks: serde_json::Map<String, serde_json::Value> = state
            .published_tracks
            .iter()
            .map(|(id, track)| {
                (
                    id.to_string(),
                    json!({
                        "id": id,
                        "kind": track.kind(),
                        "muted": track.is_muted(),
                    }),
                )
            })
            .collect();
        let pending: serde_json::Map<String, serde_json::Value> = state
            .pending
            .iter()
            .map(|(id, identities)| (id.to_string(), json!(identities)))
            .collect();

        json!({
            "participant_id": self.participant_id,
            "closed": state.closed,
            "published_tracks": tracks,
            "pending_subscriptions": pending,
        })
    }
}
