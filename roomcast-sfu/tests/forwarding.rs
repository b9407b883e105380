// Integration tests for the forwarding path
//
// Feeds synthetic RTP through ChannelBuffers into a Receiver and checks:
// - fan-out to every down track, sequential and split across workers
// - ingress/egress counters
// - close semantics and rejection of late registrations

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;

use roomcast_sfu::{
    BufferWriter, ChannelBuffer, Error, ExtPacket, IngestionBuffer, MetricsSink, PacketCounters,
    ParticipantId, Receiver, ReceiverEvent, ReceiverParams, SfuConfig, TrackId, TrackKind,
    TrackSender,
};

struct CountingSender {
    subscriber_id: ParticipantId,
    packets: AtomicUsize,
    layers_seen: Mutex<Vec<i32>>,
    closed: Mutex<Vec<bool>>,
}

impl CountingSender {
    fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            subscriber_id: ParticipantId::new(id),
            packets: AtomicUsize::new(0),
            layers_seen: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl TrackSender for CountingSender {
    fn subscriber_id(&self) -> ParticipantId {
        self.subscriber_id.clone()
    }

    async fn write_rtp(&self, _packet: Arc<ExtPacket>, layer: i32) -> roomcast_sfu::Result<()> {
        self.packets.fetch_add(1, Ordering::SeqCst);
        let mut seen = self.layers_seen.lock();
        if !seen.contains(&layer) {
            seen.push(layer);
        }
        Ok(())
    }

    fn up_track_layers_change(&self, _layers: &[i32]) {}

    fn up_track_bitrate_availability_change(&self) {}

    fn close(&self, resume: bool) {
        self.closed.lock().push(resume);
    }
}

fn rtp(ssrc: u32, sn: u16, payload_len: usize) -> ExtPacket {
    ExtPacket::new(Packet {
        header: Header {
            version: 2,
            payload_type: 96,
            sequence_number: sn,
            timestamp: u32::from(sn) * 3000,
            ssrc,
            ..Default::default()
        },
        payload: Bytes::from(vec![1u8; payload_len]),
    })
}

fn video_receiver(
    threshold: usize,
    counters: &Arc<PacketCounters>,
) -> (Arc<Receiver>, mpsc::UnboundedReceiver<ReceiverEvent>) {
    Receiver::new(ReceiverParams {
        track_id: TrackId::new("TR_cam"),
        publisher_id: ParticipantId::new("PA_pub"),
        kind: TrackKind::Video,
        config: Arc::new(SfuConfig {
            load_balance_threshold: threshold,
            ..SfuConfig::default()
        }),
        metrics: Arc::clone(counters) as Arc<dyn MetricsSink>,
    })
}

/// Bind q/h/f layers and return their writers
fn bind_simulcast(receiver: &Arc<Receiver>) -> Vec<(u32, BufferWriter)> {
    ["q", "h", "f"]
        .iter()
        .zip(1000u32..)
        .map(|(rid, ssrc)| {
            let (buffer, writer) = ChannelBuffer::new(ssrc, 90_000, 64);
            receiver.add_up_track_layer(rid, buffer).unwrap();
            (ssrc, writer)
        })
        .collect()
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn next_closed(events: &mut mpsc::UnboundedReceiver<ReceiverEvent>) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            if event == ReceiverEvent::Closed {
                return;
            }
        }
        panic!("event channel ended without Closed");
    })
    .await
    .expect("no Closed event");
}

async fn fan_out(threshold: usize, subscribers: usize) {
    const PACKETS: u16 = 12;
    const PAYLOAD: usize = 200;

    let counters = Arc::new(PacketCounters::new());
    let (receiver, _events) = video_receiver(threshold, &counters);
    let writers = bind_simulcast(&receiver);

    let senders: Vec<Arc<CountingSender>> = (0..subscribers)
        .map(|i| CountingSender::new(&format!("PA_sub{i}")))
        .collect();
    for sender in &senders {
        receiver
            .add_down_track(Arc::clone(sender) as Arc<dyn TrackSender>)
            .unwrap();
    }

    let mut bytes_in = 0;
    for sn in 0..PACKETS {
        for (ssrc, writer) in &writers {
            let packet = rtp(*ssrc, sn, PAYLOAD);
            bytes_in += packet.raw_size() as u64;
            assert!(writer.write(packet).await);
        }
    }

    let per_sender = usize::from(PACKETS) * writers.len();
    let expected_out = (per_sender * subscribers) as u64;
    wait_until(|| counters.snapshot().packets_out == expected_out).await;

    for sender in &senders {
        assert_eq!(sender.packets.load(Ordering::SeqCst), per_sender);
        let mut layers = sender.layers_seen.lock().clone();
        layers.sort_unstable();
        assert_eq!(layers, vec![0, 1, 2]);
    }

    let snapshot = counters.snapshot();
    assert_eq!(snapshot.packets_in, per_sender as u64);
    assert_eq!(snapshot.bytes_in, bytes_in);
    assert_eq!(snapshot.bytes_out, bytes_in * subscribers as u64);
    assert_eq!(receiver.available_layers(), vec![0, 1, 2]);
}

#[tokio::test]
async fn test_fan_out_sequential() {
    fan_out(0, 3).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fan_out_split_across_workers() {
    fan_out(2, 7).await;
}

#[tokio::test]
async fn test_duplicate_down_track_rejected() {
    let counters = Arc::new(PacketCounters::new());
    let (receiver, _events) = video_receiver(0, &counters);

    let first = CountingSender::new("PA_sub");
    let second = CountingSender::new("PA_sub");
    receiver.add_down_track(first as Arc<dyn TrackSender>).unwrap();
    assert_eq!(
        receiver
            .add_down_track(second as Arc<dyn TrackSender>)
            .unwrap_err(),
        Error::DownTrackAlreadyExists(ParticipantId::new("PA_sub"))
    );
    assert_eq!(receiver.down_track_count(), 1);

    receiver.delete_down_track(&ParticipantId::new("PA_sub"));
    assert!(!receiver.has_down_track(&ParticipantId::new("PA_sub")));
}

#[tokio::test]
async fn test_close_is_final() {
    let counters = Arc::new(PacketCounters::new());
    let (receiver, mut events) = video_receiver(0, &counters);
    let _writers = bind_simulcast(&receiver);
    let sender = CountingSender::new("PA_sub");
    receiver
        .add_down_track(Arc::clone(&sender) as Arc<dyn TrackSender>)
        .unwrap();

    receiver.close();
    receiver.close();
    next_closed(&mut events).await;

    assert!(receiver.is_closed());
    assert_eq!(sender.closed.lock().clone(), vec![false]);
    assert_eq!(receiver.down_track_count(), 0);

    assert_eq!(
        receiver
            .add_down_track(CountingSender::new("PA_late") as Arc<dyn TrackSender>)
            .unwrap_err(),
        Error::ReceiverClosed
    );
    let (buffer, _writer) = ChannelBuffer::new(2000, 90_000, 8);
    assert_eq!(
        receiver
            .add_up_track_layer("f", Arc::clone(&buffer) as Arc<dyn IngestionBuffer>)
            .unwrap_err(),
        Error::ReceiverClosed
    );
    assert!(!buffer.is_closed());

    // the forwarding tasks also try to close once their buffers end
    let extra = tokio::time::timeout(Duration::from_millis(200), async {
        loop {
            match events.recv().await {
                Some(ReceiverEvent::Closed) => return true,
                Some(_) => continue,
                None => return false,
            }
        }
    })
    .await;
    assert!(!matches!(extra, Ok(true)));
}

#[tokio::test]
async fn test_publisher_hangup_closes_receiver() {
    let counters = Arc::new(PacketCounters::new());
    let (receiver, mut events) = video_receiver(0, &counters);
    let writers = bind_simulcast(&receiver);
    let sender = CountingSender::new("PA_sub");
    receiver
        .add_down_track(Arc::clone(&sender) as Arc<dyn TrackSender>)
        .unwrap();

    // one layer ending tears the whole receiver down
    let mut writers = writers.into_iter();
    drop(writers.next());
    next_closed(&mut events).await;

    assert!(receiver.is_closed());
    assert_eq!(sender.closed.lock().clone(), vec![false]);
}

#[tokio::test]
async fn test_keyframe_requests_are_throttled_and_counted() {
    let counters = Arc::new(PacketCounters::new());
    let (receiver, _events) = video_receiver(0, &counters);
    let (buffer, _writer) = ChannelBuffer::new(1000, 90_000, 8);
    receiver
        .add_up_track_layer("q", Arc::clone(&buffer) as Arc<dyn IngestionBuffer>)
        .unwrap();

    assert!(receiver.send_pli(0));
    assert!(!receiver.send_pli(0));
    assert!(!receiver.send_pli(2));

    assert_eq!(buffer.pli_count(), 1);
    assert_eq!(counters.snapshot().pli_total, 1);
}

#[tokio::test]
async fn test_quality_cycle_reports_stats() {
    let counters = Arc::new(PacketCounters::new());
    let (receiver, mut events) = Receiver::new(ReceiverParams {
        track_id: TrackId::new("TR_cam"),
        publisher_id: ParticipantId::new("PA_pub"),
        kind: TrackKind::Video,
        config: Arc::new(SfuConfig {
            connection_quality_interval_ms: 50,
            ..SfuConfig::default()
        }),
        metrics: Arc::clone(&counters) as Arc<dyn MetricsSink>,
    });
    let (buffer, writer) = ChannelBuffer::new(1000, 90_000, 64);
    receiver.add_up_track_layer("f", buffer).unwrap();

    // sequence 5 never arrives
    for sn in (0..10u16).filter(|sn| *sn != 5) {
        assert!(writer.write(rtp(1000, sn, 100)).await);
    }

    let stat = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(ReceiverEvent::StatsUpdate(stat)) if stat.stats.packets > 0 => return stat,
                Some(_) => continue,
                None => panic!("receiver events ended"),
            }
        }
    })
    .await
    .expect("no stats update");

    assert_eq!(stat.track_id, TrackId::new("TR_cam"));
    assert_eq!(stat.stats.packets, 9);
    assert_eq!(stat.stats.packets_lost, 1);
    assert!(stat.packet_loss_rate > 0.0);
    assert!((1..=5).contains(&stat.score));
    assert_eq!(receiver.connection_score(), stat.score);
}

#[tokio::test]
async fn test_quality_stats_keep_simulcast_layers() {
    let counters = Arc::new(PacketCounters::new());
    let (receiver, mut events) = Receiver::new(ReceiverParams {
        track_id: TrackId::new("TR_cam"),
        publisher_id: ParticipantId::new("PA_pub"),
        kind: TrackKind::Video,
        config: Arc::new(SfuConfig {
            connection_quality_interval_ms: 50,
            ..SfuConfig::default()
        }),
        metrics: Arc::clone(&counters) as Arc<dyn MetricsSink>,
    });
    let (low, low_writer) = ChannelBuffer::new(1000, 90_000, 64);
    let (high, high_writer) = ChannelBuffer::new(1002, 90_000, 64);
    receiver.add_up_track_layer("q", low).unwrap();
    receiver.add_up_track_layer("f", high).unwrap();

    for sn in 0..4u16 {
        assert!(low_writer.write(rtp(1000, sn, 100)).await);
    }
    for sn in 0..6u16 {
        assert!(high_writer.write(rtp(1002, sn, 300)).await);
    }
    wait_until(|| counters.snapshot().packets_in == 10).await;

    // a cycle may land between the two writers; sum until everything is seen
    let mut per_layer = std::collections::BTreeMap::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while per_layer.values().sum::<u32>() < 10 {
            match events.recv().await {
                Some(ReceiverEvent::StatsUpdate(stat)) => {
                    for (layer, stats) in stat.stats.layers {
                        *per_layer.entry(layer).or_insert(0) += stats.packets;
                    }
                }
                Some(ReceiverEvent::Closed) | None => panic!("receiver closed"),
            }
        }
    })
    .await
    .expect("no stats update");

    assert_eq!(per_layer.into_iter().collect::<Vec<_>>(), vec![(0, 4), (2, 6)]);
}
