// Integration tests for the subscription permission gate
//
// Drives an UpTrackManager over real PublishedTracks:
// - pending subscriptions and their reinstatement
// - revocation back to pending
// - absent and malformed permission updates
// - close notification under concurrent track teardown

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use roomcast_sfu::{
    AddSubscriberParams, Error, ExtPacket, LocalParticipant, MediaTrack, NoopMetrics,
    ParticipantId, ParticipantIdentity, ParticipantState, PublishedTrack, PublishedTrackParams,
    SfuConfig, SubscriptionPermission, TrackId, TrackInfo, TrackKind, TrackPermission,
    TrackSender, UpTrackEvent, UpTrackManager,
};

struct ViewerSender {
    subscriber_id: ParticipantId,
    packets: AtomicUsize,
    closed: Mutex<Vec<bool>>,
}

#[async_trait]
impl TrackSender for ViewerSender {
    fn subscriber_id(&self) -> ParticipantId {
        self.subscriber_id.clone()
    }

    async fn write_rtp(&self, _packet: Arc<ExtPacket>, _layer: i32) -> roomcast_sfu::Result<()> {
        self.packets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn up_track_layers_change(&self, _layers: &[i32]) {}

    fn up_track_bitrate_availability_change(&self) {}

    fn close(&self, resume: bool) {
        self.closed.lock().push(resume);
    }
}

struct Viewer {
    id: ParticipantId,
    identity: ParticipantIdentity,
    disconnected: AtomicBool,
    updates: Mutex<Vec<(TrackId, bool)>>,
    senders: Mutex<Vec<Arc<ViewerSender>>>,
}

impl Viewer {
    fn new(identity: &str) -> Arc<Self> {
        Arc::new(Self {
            id: ParticipantId::new(format!("PA_{identity}")),
            identity: ParticipantIdentity::new(identity),
            disconnected: AtomicBool::new(false),
            updates: Mutex::new(Vec::new()),
            senders: Mutex::new(Vec::new()),
        })
    }

    fn updates(&self) -> Vec<(TrackId, bool)> {
        self.updates.lock().clone()
    }

    fn participant(self: &Arc<Self>) -> Arc<dyn LocalParticipant> {
        Arc::clone(self) as Arc<dyn LocalParticipant>
    }
}

impl LocalParticipant for Viewer {
    fn id(&self) -> ParticipantId {
        self.id.clone()
    }

    fn identity(&self) -> ParticipantIdentity {
        self.identity.clone()
    }

    fn state(&self) -> ParticipantState {
        if self.disconnected.load(Ordering::SeqCst) {
            ParticipantState::Disconnected
        } else {
            ParticipantState::Active
        }
    }

    fn subscription_permission_update(
        &self,
        _publisher_id: &ParticipantId,
        track_id: &TrackId,
        allowed: bool,
    ) {
        self.updates.lock().push((track_id.clone(), allowed));
    }

    fn new_down_track(&self, _track: &TrackInfo) -> roomcast_sfu::Result<Arc<dyn TrackSender>> {
        let sender = Arc::new(ViewerSender {
            subscriber_id: self.id.clone(),
            packets: AtomicUsize::new(0),
            closed: Mutex::new(Vec::new()),
        });
        self.senders.lock().push(Arc::clone(&sender));
        Ok(sender as Arc<dyn TrackSender>)
    }
}

/// Live participants the resolvers can find
struct Directory(Vec<Arc<Viewer>>);

impl Directory {
    fn by_identity(&self, identity: &ParticipantIdentity) -> Option<Arc<dyn LocalParticipant>> {
        self.0
            .iter()
            .find(|v| v.identity == *identity)
            .map(Viewer::participant)
    }

    fn by_id(&self, id: &ParticipantId) -> Option<Arc<dyn LocalParticipant>> {
        self.0.iter().find(|v| v.id == *id).map(Viewer::participant)
    }

    fn apply(
        &self,
        manager: &UpTrackManager,
        permission: Option<SubscriptionPermission>,
    ) -> roomcast_sfu::Result<()> {
        manager.update_subscription_permission(
            permission,
            &|identity: &ParticipantIdentity| self.by_identity(identity),
            &|id: &ParticipantId| self.by_id(id),
        )
    }
}

fn publish(manager: &Arc<UpTrackManager>, track_id: &str) -> Arc<PublishedTrack> {
    let track = PublishedTrack::new(PublishedTrackParams {
        track_id: TrackId::new(track_id),
        name: format!("{track_id} camera"),
        kind: TrackKind::Video,
        publisher_id: manager.participant_id().clone(),
        config: Arc::new(SfuConfig::default()),
        metrics: Arc::new(NoopMetrics),
    });
    manager.add_published_track(Arc::clone(&track) as Arc<dyn MediaTrack>);
    track
}

fn only(identity: &str, tracks: &[&str]) -> SubscriptionPermission {
    SubscriptionPermission {
        all_participants: false,
        track_permissions: vec![TrackPermission {
            participant_identity: Some(ParticipantIdentity::new(identity)),
            participant_sid: None,
            all_tracks: false,
            track_sids: tracks.iter().map(|t| TrackId::new(*t)).collect(),
        }],
    }
}

fn everyone() -> SubscriptionPermission {
    SubscriptionPermission {
        all_participants: true,
        track_permissions: Vec::new(),
    }
}

/// Events received until the channel stays quiet for a short while
async fn drain_events(events: &mut mpsc::UnboundedReceiver<UpTrackEvent>) -> Vec<UpTrackEvent> {
    let mut received = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(200), events.recv()).await
    {
        received.push(event);
    }
    received
}

#[tokio::test]
async fn test_pending_subscriber_reinstated_by_widened_permission() {
    let (manager, _events) = UpTrackManager::new(ParticipantId::new("PA_pub"));
    let track = publish(&manager, "TR_cam");
    let bob = Viewer::new("bob");
    let dir = Directory(vec![Arc::clone(&bob)]);

    dir.apply(&manager, Some(only("bob", &["TR_screen"]))).unwrap();

    let subscribed = manager
        .add_subscriber(bob.participant(), AddSubscriberParams::all_tracks())
        .unwrap();
    assert_eq!(subscribed, 0);
    assert_eq!(
        manager.pending_subscribers(&TrackId::new("TR_cam")),
        vec![ParticipantIdentity::new("bob")]
    );
    assert_eq!(bob.updates(), vec![(TrackId::new("TR_cam"), false)]);
    assert!(!track.is_subscriber(&bob.id));

    dir.apply(&manager, Some(everyone())).unwrap();

    assert!(track.is_subscriber(&bob.id));
    assert_eq!(track.receiver().down_track_count(), 1);
    assert!(manager.pending_subscribers(&TrackId::new("TR_cam")).is_empty());
    assert_eq!(
        bob.updates(),
        vec![
            (TrackId::new("TR_cam"), false),
            (TrackId::new("TR_cam"), true)
        ]
    );
}

#[tokio::test]
async fn test_revoked_subscriber_reinstated_exactly_once() {
    let (manager, _events) = UpTrackManager::new(ParticipantId::new("PA_pub"));
    let track = publish(&manager, "TR_cam");
    let bob = Viewer::new("bob");
    let carol = Viewer::new("carol");
    let dir = Directory(vec![Arc::clone(&bob), Arc::clone(&carol)]);

    for viewer in [&bob, &carol] {
        assert_eq!(
            manager
                .add_subscriber(viewer.participant(), AddSubscriberParams::all_tracks())
                .unwrap(),
            1
        );
    }

    dir.apply(&manager, Some(only("carol", &["TR_cam"]))).unwrap();
    assert!(!track.is_subscriber(&bob.id));
    assert!(track.is_subscriber(&carol.id));
    assert_eq!(bob.senders.lock()[0].closed.lock().clone(), vec![false]);
    assert_eq!(bob.updates(), vec![(TrackId::new("TR_cam"), false)]);

    // reapplying the same restriction must not notify again
    dir.apply(&manager, Some(only("carol", &["TR_cam"]))).unwrap();
    assert_eq!(bob.updates().len(), 1);

    dir.apply(&manager, Some(everyone())).unwrap();
    dir.apply(&manager, Some(everyone())).unwrap();
    assert!(track.is_subscriber(&bob.id));
    assert_eq!(
        bob.updates(),
        vec![
            (TrackId::new("TR_cam"), false),
            (TrackId::new("TR_cam"), true)
        ]
    );
    assert!(carol.updates().is_empty());
}

#[tokio::test]
async fn test_absent_permission_keeps_restriction() {
    let (manager, _events) = UpTrackManager::new(ParticipantId::new("PA_pub"));
    publish(&manager, "TR_cam");
    let bob = Viewer::new("bob");
    let dir = Directory(vec![Arc::clone(&bob)]);

    dir.apply(&manager, Some(only("carol", &["TR_cam"]))).unwrap();
    dir.apply(&manager, None).unwrap();

    assert!(manager.subscription_permission().is_none());
    assert!(!manager.has_permission(&TrackId::new("TR_cam"), &bob.identity));
    assert_eq!(
        manager
            .add_subscriber(bob.participant(), AddSubscriberParams::all_tracks())
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_malformed_permission_is_rejected() {
    let (manager, _events) = UpTrackManager::new(ParticipantId::new("PA_pub"));
    publish(&manager, "TR_cam");
    let dir = Directory(Vec::new());

    let previous = only("carol", &["TR_cam"]);
    dir.apply(&manager, Some(previous.clone())).unwrap();

    let mut malformed = everyone();
    malformed.all_participants = false;
    malformed.track_permissions.push(TrackPermission {
        all_tracks: true,
        ..TrackPermission::default()
    });
    assert_eq!(
        dir.apply(&manager, Some(malformed)).unwrap_err(),
        Error::PermissionNeedsIdentifier
    );

    assert_eq!(manager.subscription_permission(), Some(previous));
    let cam = TrackId::new("TR_cam");
    assert!(manager.has_permission(&cam, &ParticipantIdentity::new("carol")));
    assert!(!manager.has_permission(&cam, &ParticipantIdentity::new("bob")));
}

#[tokio::test]
async fn test_all_participants_overrides_grant_list() {
    let (manager, _events) = UpTrackManager::new(ParticipantId::new("PA_pub"));
    let track = publish(&manager, "TR_cam");
    let bob = Viewer::new("bob");
    let dir = Directory(vec![Arc::clone(&bob)]);

    let mut permission = only("carol", &[]);
    permission.all_participants = true;
    dir.apply(&manager, Some(permission)).unwrap();

    assert_eq!(
        manager
            .add_subscriber(bob.participant(), AddSubscriberParams::all_tracks())
            .unwrap(),
        1
    );
    assert!(track.is_subscriber(&bob.id));
    assert!(bob.updates().is_empty());
}

#[tokio::test]
async fn test_sid_only_grant_resolves_identity() {
    let (manager, _events) = UpTrackManager::new(ParticipantId::new("PA_pub"));
    let track = publish(&manager, "TR_cam");
    let bob = Viewer::new("bob");
    let dir = Directory(vec![Arc::clone(&bob)]);

    dir.apply(
        &manager,
        Some(SubscriptionPermission {
            all_participants: false,
            track_permissions: vec![TrackPermission {
                participant_identity: None,
                participant_sid: Some(bob.id.clone()),
                all_tracks: true,
                track_sids: Vec::new(),
            }],
        }),
    )
    .unwrap();

    assert_eq!(
        manager
            .add_subscriber(bob.participant(), AddSubscriberParams::all_tracks())
            .unwrap(),
        1
    );
    assert!(track.is_subscriber(&bob.id));
}

#[tokio::test]
async fn test_disconnected_pending_subscriber_is_dropped() {
    let (manager, _events) = UpTrackManager::new(ParticipantId::new("PA_pub"));
    let track = publish(&manager, "TR_cam");
    let bob = Viewer::new("bob");
    let dir = Directory(vec![Arc::clone(&bob)]);

    dir.apply(&manager, Some(only("carol", &["TR_cam"]))).unwrap();
    manager
        .add_subscriber(bob.participant(), AddSubscriberParams::all_tracks())
        .unwrap();
    bob.disconnected.store(true, Ordering::SeqCst);

    dir.apply(&manager, Some(everyone())).unwrap();
    assert!(!track.is_subscriber(&bob.id));
    assert!(manager.pending_subscribers(&TrackId::new("TR_cam")).is_empty());
    assert_eq!(bob.updates(), vec![(TrackId::new("TR_cam"), false)]);
}

#[tokio::test]
async fn test_remove_subscriber_forgets_pending() {
    let (manager, _events) = UpTrackManager::new(ParticipantId::new("PA_pub"));
    publish(&manager, "TR_cam");
    let bob = Viewer::new("bob");
    let dir = Directory(vec![Arc::clone(&bob)]);

    dir.apply(&manager, Some(only("carol", &["TR_cam"]))).unwrap();
    manager
        .add_subscriber(bob.participant(), AddSubscriberParams::all_tracks())
        .unwrap();
    manager.remove_subscriber(&bob.participant(), &TrackId::new("TR_cam"), false);

    dir.apply(&manager, Some(everyone())).unwrap();
    assert!(bob.senders.lock().is_empty());
    assert_eq!(bob.updates().len(), 1);
}

#[tokio::test]
async fn test_ended_track_reports_update_once() {
    let (manager, mut events) = UpTrackManager::new(ParticipantId::new("PA_pub"));
    let track = publish(&manager, "TR_cam");
    manager.add_published_track(Arc::clone(&track) as Arc<dyn MediaTrack>);

    track.receiver().close();

    let received = drain_events(&mut events).await;
    assert_eq!(
        received,
        vec![UpTrackEvent::TrackUpdated {
            track_id: TrackId::new("TR_cam"),
            only_if_ready: true,
        }]
    );
    assert!(manager.published_track(&TrackId::new("TR_cam")).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_closed_once_under_concurrent_teardown() {
    let (manager, mut events) = UpTrackManager::new(ParticipantId::new("PA_pub"));
    let tracks: Vec<Arc<PublishedTrack>> = (0..8)
        .map(|i| publish(&manager, &format!("TR_{i}")))
        .collect();

    manager.close();

    let mut tasks = Vec::new();
    for (i, track) in tracks.iter().enumerate() {
        let manager = Arc::clone(&manager);
        let track = Arc::clone(track);
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                manager.remove_published_track(&(Arc::clone(&track) as Arc<dyn MediaTrack>));
            }
            track.receiver().close();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let received = drain_events(&mut events).await;
    let closed = received
        .iter()
        .filter(|e| **e == UpTrackEvent::Closed)
        .count();
    assert_eq!(closed, 1);
    assert!(manager.published_tracks().is_empty());
    assert!(tracks.iter().all(|t| t.is_closed()));
}
