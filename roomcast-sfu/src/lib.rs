//! Roomcast SFU (Selective Forwarding Unit)
//!
//! Track management core of a WebRTC SFU: ingestion of a publisher's
//! simulcast layers and permission-gated fan-out of every received packet
//! to the subscribers of that track.
//!
//! ## Architecture
//!
//! - **`UpTrackManager`**: Registry of one participant's published tracks and
//!   the permission gate for subscriptions to them
//! - **`PublishedTrack`**: A published track handle over one `Receiver`
//! - **`Receiver`**: Per-layer forwarding tasks reading from `IngestionBuffer`s
//! - **`DownTrackSpreader`**: Fan-out to subscriber `TrackSender`s, split
//!   across tasks for large audiences
//! - **`StreamTrackerManager`**: Simulcast layer availability and bitrates
//!
//! Lifecycle notifications travel over event channels returned by the
//! constructors (`UpTrackEvent`, `ReceiverEvent`); counters go to an
//! injected `MetricsSink`.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use roomcast_sfu::{AddSubscriberParams, PublishedTrack, PublishedTrackParams, UpTrackManager};
//!
//! let (manager, mut events) = UpTrackManager::new(publisher_id.clone());
//! let track = PublishedTrack::new(PublishedTrackParams { .. });
//! track.receiver().add_up_track_layer("f", buffer)?;
//! manager.add_published_track(track);
//!
//! let subscribed = manager.add_subscriber(subscriber, AddSubscriberParams::all_tracks())?;
//! ```

pub mod buffer;
pub mod config;
pub mod connection_quality;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod participant;
pub mod permission;
pub mod published_track;
pub mod receiver;
pub mod spreader;
pub mod stream_tracker;
pub mod types;
pub mod up_track_manager;

pub use buffer::{BufferWriter, ChannelBuffer, ExtPacket, IngestionBuffer};
pub use config::SfuConfig;
pub use error::{AddSubscriberError, Error, ReadError, Result};
pub use metrics::{MetricsSink, NoopMetrics, PacketCounters, PrometheusMetrics};
pub use participant::{LocalParticipant, PermissionUpdate, PermissionUpdateQueue};
pub use permission::{SubscriberGrants, SubscriptionPermission, TrackPermission};
pub use published_track::{MediaTrack, PublishedTrack, PublishedTrackParams};
pub use receiver::{Receiver, ReceiverEvent, ReceiverParams};
pub use spreader::{DownTrackSpreader, TrackSender};
pub use types::{
    NodeId, ParticipantId, ParticipantIdentity, ParticipantState, TrackId, TrackInfo, TrackKind,
    VideoLayer, VideoQuality,
};
pub use up_track_manager::{AddSubscriberParams, UpTrackEvent, UpTrackManager};
