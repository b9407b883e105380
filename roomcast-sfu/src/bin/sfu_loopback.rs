use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use prometheus::{Encoder, Registry, TextEncoder};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;

use roomcast_sfu::metrics::Direction;
use roomcast_sfu::{
    logging, AddSubscriberParams, BufferWriter, ChannelBuffer, ExtPacket, LocalParticipant,
    MediaTrack, MetricsSink, PacketCounters, ParticipantId, ParticipantIdentity, ParticipantState,
    PermissionUpdate, PermissionUpdateQueue, PrometheusMetrics, PublishedTrack,
    PublishedTrackParams, SfuConfig, SubscriptionPermission, TrackId, TrackInfo, TrackKind,
    TrackPermission, TrackSender, UpTrackEvent, UpTrackManager, VideoLayer, VideoQuality,
};

#[derive(Parser, Debug)]
#[command(name = "sfu-loopback")]
#[command(about = "Publish a synthetic simulcast track and fan it out in-process", long_about = None)]
struct Args {
    /// Config file (TOML/YAML/JSON)
    #[arg(long, env = "ROOMCAST_CONFIG")]
    config: Option<String>,

    /// Number of in-process subscribers
    #[arg(long, default_value = "4")]
    subscribers: usize,

    /// Packets to publish per simulcast layer
    #[arg(long, default_value = "200")]
    packets: u16,

    /// Interval between packet bursts (ms)
    #[arg(long, default_value = "5")]
    interval_ms: u64,

    /// Node ID used as the metrics const label
    #[arg(long, env = "NODE_ID", default_value = "loopback")]
    node_id: String,

    /// Print Prometheus text exposition at the end
    #[arg(long)]
    prometheus: bool,
}

/// Sends every count to both sinks
struct TeeMetrics {
    counters: Arc<PacketCounters>,
    prometheus: PrometheusMetrics,
}

impl MetricsSink for TeeMetrics {
    fn increment_packets(&self, direction: Direction, count: u64) {
        self.counters.increment_packets(direction, count);
        self.prometheus.increment_packets(direction, count);
    }

    fn increment_bytes(&self, direction: Direction, count: u64) {
        self.counters.increment_bytes(direction, count);
        self.prometheus.increment_bytes(direction, count);
    }

    fn increment_rtcp(&self, direction: Direction, nack: u32, pli: u32, fir: u32) {
        self.counters.increment_rtcp(direction, nack, pli, fir);
        self.prometheus.increment_rtcp(direction, nack, pli, fir);
    }
}

struct LoopbackSender {
    subscriber_id: ParticipantId,
    packets: AtomicU64,
}

#[async_trait]
impl TrackSender for LoopbackSender {
    fn subscriber_id(&self) -> ParticipantId {
        self.subscriber_id.clone()
    }

    async fn write_rtp(&self, _packet: Arc<ExtPacket>, _layer: i32) -> roomcast_sfu::Result<()> {
        self.packets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn up_track_layers_change(&self, layers: &[i32]) {
        info!(subscriber_id = %self.subscriber_id, ?layers, "available layers changed");
    }

    fn up_track_bitrate_availability_change(&self) {}

    fn close(&self, resume: bool) {
        info!(
            subscriber_id = %self.subscriber_id,
            packets = self.packets.load(Ordering::Relaxed),
            resume,
            "down track closed"
        );
    }
}

struct LoopbackSubscriber {
    id: ParticipantId,
    identity: ParticipantIdentity,
    queue: PermissionUpdateQueue,
    senders: parking_lot::Mutex<Vec<Arc<LoopbackSender>>>,
}

impl LoopbackSubscriber {
    fn new(index: usize, queue_capacity: usize) -> Arc<Self> {
        let id = ParticipantId::generate();
        Arc::new(Self {
            identity: ParticipantIdentity::new(format!("viewer-{index}")),
            queue: PermissionUpdateQueue::new(id.clone(), queue_capacity),
            id,
            senders: parking_lot::Mutex::new(Vec::new()),
        })
    }

    fn packets_received(&self) -> u64 {
        self.senders
            .lock()
            .iter()
            .map(|s| s.packets.load(Ordering::Relaxed))
            .sum()
    }
}

impl LocalParticipant for LoopbackSubscriber {
    fn id(&self) -> ParticipantId {
        self.id.clone()
    }

    fn identity(&self) -> ParticipantIdentity {
        self.identity.clone()
    }

    fn state(&self) -> ParticipantState {
        ParticipantState::Active
    }

    fn subscription_permission_update(
        &self,
        publisher_id: &ParticipantId,
        track_id: &TrackId,
        allowed: bool,
    ) {
        self.queue.try_enqueue(PermissionUpdate {
            publisher_id: publisher_id.clone(),
            track_id: track_id.clone(),
            allowed,
        });
    }

    fn new_down_track(&self, _track: &TrackInfo) -> roomcast_sfu::Result<Arc<dyn TrackSender>> {
        let sender = Arc::new(LoopbackSender {
            subscriber_id: self.id.clone(),
            packets: AtomicU64::new(0),
        });
        self.senders.lock().push(Arc::clone(&sender));
        Ok(sender as Arc<dyn TrackSender>)
    }
}

fn synthetic_packet(ssrc: u32, sn: u16, temporal_layer: i32, payload_len: usize) -> ExtPacket {
    ExtPacket::new(Packet {
        header: Header {
            version: 2,
            payload_type: 96,
            ssrc,
            sequence_number: sn,
            timestamp: u32::from(sn).wrapping_mul(3000),
            ..Default::default()
        },
        payload: Bytes::from(vec![0u8; payload_len]),
    })
    .with_temporal_layer(temporal_layer)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = SfuConfig::load(args.config.as_deref())?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }
    logging::init_logging(&config.logging)?;
    let config = Arc::new(config);

    let registry = Registry::new();
    let counters = Arc::new(PacketCounters::new());
    let metrics = Arc::new(TeeMetrics {
        counters: Arc::clone(&counters),
        prometheus: PrometheusMetrics::new(&registry, &args.node_id)?,
    });

    let publisher_id = ParticipantId::generate();
    let (manager, mut manager_events) = UpTrackManager::new(publisher_id.clone());

    let track = PublishedTrack::new(PublishedTrackParams {
        track_id: TrackId::generate(),
        name: "loopback camera".to_string(),
        kind: TrackKind::Video,
        publisher_id: publisher_id.clone(),
        config: Arc::clone(&config),
        metrics,
    });
    let track_id = track.id();

    let mut writers: Vec<(u32, BufferWriter)> = Vec::new();
    let mut layers = Vec::new();
    for (ssrc, quality, width, height) in [
        (1000u32, VideoQuality::Low, 320u32, 180u32),
        (1001, VideoQuality::Medium, 640, 360),
        (1002, VideoQuality::High, 1280, 720),
    ] {
        let (buffer, writer) = ChannelBuffer::new(ssrc, 90_000, 512);
        track.receiver().add_up_track_layer(quality.rid(), buffer)?;
        writers.push((ssrc, writer));
        layers.push(VideoLayer {
            quality,
            width,
            height,
            bitrate: width * height,
            ssrc,
        });
    }
    manager.add_published_track(track.clone());
    manager.update_video_layers(&track_id, layers)?;

    let subscribers: Vec<Arc<LoopbackSubscriber>> = (0..args.subscribers)
        .map(|i| LoopbackSubscriber::new(i, config.subscriber_queue_capacity))
        .collect();
    let by_identity: HashMap<ParticipantIdentity, Arc<dyn LocalParticipant>> = subscribers
        .iter()
        .map(|s| (s.identity.clone(), Arc::clone(s) as Arc<dyn LocalParticipant>))
        .collect();
    let by_id: HashMap<ParticipantId, Arc<dyn LocalParticipant>> = subscribers
        .iter()
        .map(|s| (s.id.clone(), Arc::clone(s) as Arc<dyn LocalParticipant>))
        .collect();
    let resolve_identity = |identity: &ParticipantIdentity| by_identity.get(identity).cloned();
    let resolve_id = |id: &ParticipantId| by_id.get(id).cloned();

    // only the first viewer is allowed in at first
    if let Some(first) = subscribers.first() {
        manager.update_subscription_permission(
            Some(SubscriptionPermission {
                all_participants: false,
                track_permissions: vec![TrackPermission {
                    participant_identity: Some(first.identity.clone()),
                    participant_sid: None,
                    all_tracks: true,
                    track_sids: Vec::new(),
                }],
            }),
            &resolve_identity,
            &resolve_id,
        )?;
    }
    for subscriber in &subscribers {
        let subscribed = manager.add_subscriber(
            Arc::clone(subscriber) as Arc<dyn LocalParticipant>,
            AddSubscriberParams::all_tracks(),
        )?;
        info!(subscriber = %subscriber.identity, subscribed, "subscriber joined");
    }
    info!(
        pending = manager.pending_subscribers(&track_id).len(),
        "waiting for permission"
    );

    manager.update_subscription_permission(
        Some(SubscriptionPermission {
            all_participants: true,
            track_permissions: Vec::new(),
        }),
        &resolve_identity,
        &resolve_id,
    )?;

    for sn in 0..args.packets {
        for (ssrc, writer) in &writers {
            let temporal = i32::from(sn % 4 != 0);
            if !writer.write(synthetic_packet(*ssrc, sn, temporal, 1000)).await {
                warn!(ssrc, "ingestion buffer closed early");
            }
        }
        tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
    }
    track.receiver().send_pli(2);

    info!(
        available_layers = ?track.receiver().available_layers(),
        bitrates = ?track.receiver().bitrate_temporal_cumulative(),
        "publishing done"
    );

    manager.close();
    track.receiver().close();
    while let Some(event) = manager_events.recv().await {
        info!(?event, "up track manager event");
        if event == UpTrackEvent::Closed {
            break;
        }
    }

    for subscriber in &subscribers {
        let updates = subscriber
            .queue
            .take_receiver()
            .map(|mut rx| {
                let mut updates = Vec::new();
                while let Ok(update) = rx.try_recv() {
                    updates.push(update);
                }
                updates
            })
            .unwrap_or_default();
        println!(
            "{}: {} packets, permission updates {:?}",
            subscriber.identity,
            subscriber.packets_received(),
            updates.iter().map(|u| u.allowed).collect::<Vec<_>>()
        );
    }

    println!("{}", serde_json::to_string_pretty(&counters.snapshot())?);

    if args.prometheus {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
        println!("{}", String::from_utf8(buffer)?);
    }

    Ok(())
}
