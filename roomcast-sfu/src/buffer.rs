//! Ingestion buffer boundary
//!
//! A receiver consumes one [`IngestionBuffer`] per simulcast layer: an ordered
//! packet source that also owns keyframe-request throttling and per-layer
//! statistics. Jitter-buffer reordering lives behind this trait.
//! [`ChannelBuffer`] is an in-process implementation fed by a
//! [`BufferWriter`], used by loopback deployments and tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use webrtc::rtp::packet::Packet;
use webrtc::util::marshal::MarshalSize;

use crate::config::AudioConfig;
use crate::error::ReadError;

/// RTP packet with the metadata the forwarding path needs
#[derive(Debug, Clone)]
pub struct ExtPacket {
    pub packet: Packet,
    pub arrival: Instant,
    pub temporal_layer: i32,
    pub key_frame: bool,
    /// Audio level extension value (dBov, 0 = loudest), when present
    pub audio_level: Option<u8>,
}

impl ExtPacket {
    #[must_use]
    pub fn new(packet: Packet) -> Self {
        Self {
            packet,
            arrival: Instant::now(),
            temporal_layer: 0,
            key_frame: false,
            audio_level: None,
        }
    }

    #[must_use]
    pub fn with_temporal_layer(mut self, temporal_layer: i32) -> Self {
        self.temporal_layer = temporal_layer;
        self
    }

    #[must_use]
    pub fn with_audio_level(mut self, level: u8) -> Self {
        self.audio_level = Some(level);
        self
    }

    #[must_use]
    pub fn sequence_number(&self) -> u16 {
        self.packet.header.sequence_number
    }

    /// Size of the packet on the wire
    #[must_use]
    pub fn raw_size(&self) -> usize {
        self.packet.header.marshal_size() + self.packet.payload.len()
    }

    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.packet.payload.len()
    }
}

/// Active speaker detection parameters handed to a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioLevelParams {
    pub active_level: u8,
    pub min_percentile: u8,
    pub observe_duration_ms: u32,
    pub smooth_intervals: u32,
}

impl From<&AudioConfig> for AudioLevelParams {
    fn from(config: &AudioConfig) -> Self {
        Self {
            active_level: config.active_level,
            min_percentile: config.min_percentile,
            observe_duration_ms: config.update_interval_ms,
            smooth_intervals: config.smooth_intervals,
        }
    }
}

/// Inputs to connection quality scoring, per layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityInfo {
    pub packets_expected: u32,
    pub packets_lost: u32,
    /// Maximum interarrival jitter in microseconds
    pub jitter_max: f64,
    pub rtt_max: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerStats {
    pub packets: u32,
    pub bytes: u64,
}

/// Stream statistics, either cumulative or a delta since the last report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamStats {
    pub packets: u32,
    pub bytes: u64,
    pub packets_lost: u32,
    pub jitter: f64,
    pub layers: BTreeMap<i32, LayerStats>,
}

impl StreamStats {
    /// Sum counters across streams, keeping the worst jitter
    #[must_use]
    pub fn aggregate(stats: &[StreamStats]) -> Option<Self> {
        if stats.is_empty() {
            return None;
        }

        let mut total = Self::default();
        for s in stats {
            total.packets += s.packets;
            total.bytes += s.bytes;
            total.packets_lost += s.packets_lost;
            total.jitter = total.jitter.max(s.jitter);
            for (layer, layer_stats) in &s.layers {
                let entry = total.layers.entry(*layer).or_default();
                entry.packets += layer_stats.packets;
                entry.bytes += layer_stats.bytes;
            }
        }
        Some(total)
    }

    /// Fold every per-layer entry under `layer`
    #[must_use]
    pub fn for_layer(mut self, layer: i32) -> Self {
        let merged = self
            .layers
            .values()
            .fold(LayerStats::default(), |acc, l| LayerStats {
                packets: acc.packets + l.packets,
                bytes: acc.bytes + l.bytes,
            });
        self.layers = BTreeMap::from([(layer, merged)]);
        self
    }
}

/// Ordered per-layer packet source with statistics
#[async_trait]
pub trait IngestionBuffer: Send + Sync {
    /// Next packet in order. Blocks until one is available; returns
    /// [`ReadError::Eof`] once the source has completed.
    async fn read_extended(&self) -> Result<ExtPacket, ReadError>;

    fn ssrc(&self) -> u32;

    fn set_rtt(&self, rtt: u32);

    fn set_pli_throttle(&self, throttle: Duration);

    fn set_audio_level_params(&self, params: AudioLevelParams);

    /// Request a keyframe upstream. Returns false when throttled.
    fn send_pli(&self) -> bool;

    fn quality_info(&self) -> Option<QualityInfo>;

    /// Statistics accumulated since the previous call
    fn delta_stats(&self) -> Option<StreamStats>;

    fn stats(&self) -> Option<StreamStats>;

    /// Linear audio level when the source is currently speaking
    fn audio_level(&self) -> Option<f64>;

    /// Complete the source so pending and future reads return end-of-stream
    fn close(&self);
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    packets: u32,
    bytes: u64,
    lost: u32,
    expected: u32,
}

#[derive(Debug)]
struct BufferState {
    rtt: u32,
    pli_throttle: Duration,
    last_pli: Option<Instant>,
    pli_count: u64,
    audio_params: Option<AudioLevelParams>,
    audio_levels: Vec<u8>,
    clock_rate: u32,

    base_sn: Option<u32>,
    highest_sn: u32,
    cycles: u32,
    counters: Counters,
    last_delta: Counters,

    jitter: f64,
    jitter_max: f64,
    last_transit: Option<f64>,
    first_arrival: Option<Instant>,
}

impl BufferState {
    fn new(clock_rate: u32) -> Self {
        Self {
            rtt: 0,
            pli_throttle: Duration::ZERO,
            last_pli: None,
            pli_count: 0,
            audio_params: None,
            audio_levels: Vec::new(),
            clock_rate,
            base_sn: None,
            highest_sn: 0,
            cycles: 0,
            counters: Counters::default(),
            last_delta: Counters::default(),
            jitter: 0.0,
            jitter_max: 0.0,
            last_transit: None,
            first_arrival: None,
        }
    }

    fn observe(&mut self, pkt: &ExtPacket) {
        let sn = u32::from(pkt.sequence_number());
        match self.base_sn {
            None => {
                self.base_sn = Some(sn);
                self.highest_sn = sn;
            }
            Some(_) => {
                let highest = self.highest_sn & 0xFFFF;
                let diff = sn.wrapping_sub(highest) & 0xFFFF;
                if diff != 0 && diff < 0x8000 {
                    if sn < highest {
                        self.cycles += 1 << 16;
                    }
                    self.highest_sn = self.cycles | sn;
                }
            }
        }

        self.counters.packets += 1;
        self.counters.bytes += pkt.raw_size() as u64;
        let base = self.base_sn.unwrap_or(sn);
        self.counters.expected = self.highest_sn.wrapping_sub(base) + 1;
        self.counters.lost = self.counters.expected.saturating_sub(self.counters.packets);

        let first = *self.first_arrival.get_or_insert(pkt.arrival);
        if self.clock_rate > 0 {
            let arrival_us = pkt.arrival.duration_since(first).as_secs_f64() * 1_000_000.0;
            let rtp_us =
                f64::from(pkt.packet.header.timestamp) * 1_000_000.0 / f64::from(self.clock_rate);
            let transit = arrival_us - rtp_us;
            if let Some(last) = self.last_transit {
                let d = (transit - last).abs();
                self.jitter += (d - self.jitter) / 16.0;
                self.jitter_max = self.jitter_max.max(self.jitter);
            }
            self.last_transit = Some(transit);
        }

        if let (Some(level), Some(_)) = (pkt.audio_level, self.audio_params) {
            self.audio_levels.push(level);
        }
    }
}

/// In-process [`IngestionBuffer`] fed through a [`BufferWriter`]
pub struct ChannelBuffer {
    ssrc: u32,
    rx: tokio::sync::Mutex<mpsc::Receiver<ExtPacket>>,
    closed: CancellationToken,
    state: Mutex<BufferState>,
}

/// Producer half of a [`ChannelBuffer`]. Dropping it ends the stream.
#[derive(Clone)]
pub struct BufferWriter {
    tx: mpsc::Sender<ExtPacket>,
}

impl BufferWriter {
    /// Queue a packet, waiting for room. Returns false once the buffer is gone.
    pub async fn write(&self, packet: ExtPacket) -> bool {
        self.tx.send(packet).await.is_ok()
    }

    /// Queue a packet without waiting. Returns false when full or closed.
    pub fn try_write(&self, packet: ExtPacket) -> bool {
        self.tx.try_send(packet).is_ok()
    }
}

impl ChannelBuffer {
    /// Create a buffer for `ssrc` holding up to `capacity` unread packets.
    /// `clock_rate` is the RTP clock used for jitter (0 disables jitter).
    #[must_use]
    pub fn new(ssrc: u32, clock_rate: u32, capacity: usize) -> (std::sync::Arc<Self>, BufferWriter) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let buffer = std::sync::Arc::new(Self {
            ssrc,
            rx: tokio::sync::Mutex::new(rx),
            closed: CancellationToken::new(),
            state: Mutex::new(BufferState::new(clock_rate)),
        });
        (buffer, BufferWriter { tx })
    }

    /// Keyframe requests that passed the throttle
    #[must_use]
    pub fn pli_count(&self) -> u64 {
        self.state.lock().pli_count
    }

    #[must_use]
    pub fn rtt(&self) -> u32 {
        self.state.lock().rtt
    }

    #[must_use]
    pub fn pli_throttle(&self) -> Duration {
        self.state.lock().pli_throttle
    }

    #[must_use]
    pub fn audio_level_params(&self) -> Option<AudioLevelParams> {
        self.state.lock().audio_params
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl IngestionBuffer for ChannelBuffer {
    async fn read_extended(&self) -> Result<ExtPacket, ReadError> {
        let mut rx = tokio::select! {
            () = self.closed.cancelled() => return Err(ReadError::Eof),
            rx = self.rx.lock() => rx,
        };

        tokio::select! {
            () = self.closed.cancelled() => Err(ReadError::Eof),
            packet = rx.recv() => match packet {
                Some(packet) => {
                    trace!(ssrc = self.ssrc, sn = packet.sequence_number(), "buffer read");
                    self.state.lock().observe(&packet);
                    Ok(packet)
                }
                None => Err(ReadError::Eof),
            },
        }
    }

    fn ssrc(&self) -> u32 {
        self.ssrc
    }

    fn set_rtt(&self, rtt: u32) {
        self.state.lock().rtt = rtt;
    }

    fn set_pli_throttle(&self, throttle: Duration) {
        self.state.lock().pli_throttle = throttle;
    }

    fn set_audio_level_params(&self, params: AudioLevelParams) {
        self.state.lock().audio_params = Some(params);
    }

    fn send_pli(&self) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        if let Some(last) = state.last_pli {
            if now.duration_since(last) < state.pli_throttle {
                return false;
            }
        }
        state.last_pli = Some(now);
        state.pli_count += 1;
        debug!(ssrc = self.ssrc, "sending PLI");
        true
    }

    fn quality_info(&self) -> Option<QualityInfo> {
        let state = self.state.lock();
        state.base_sn?;
        Some(QualityInfo {
            packets_expected: state.counters.expected,
            packets_lost: state.counters.lost,
            jitter_max: state.jitter_max,
            rtt_max: state.rtt,
        })
    }

    fn delta_stats(&self) -> Option<StreamStats> {
        let mut state = self.state.lock();
        state.base_sn?;

        let now = state.counters;
        let last = std::mem::replace(&mut state.last_delta, now);
        let packets = now.packets - last.packets;
        let bytes = now.bytes - last.bytes;

        let mut layers = BTreeMap::new();
        layers.insert(0, LayerStats { packets, bytes });

        Some(StreamStats {
            packets,
            bytes,
            packets_lost: now.lost.saturating_sub(last.lost),
            jitter: state.jitter,
            layers,
        })
    }

    fn stats(&self) -> Option<StreamStats> {
        let state = self.state.lock();
        state.base_sn?;

        let mut layers = BTreeMap::new();
        layers.insert(
            0,
            LayerStats {
                packets: state.counters.packets,
                bytes: state.counters.bytes,
            },
        );

        Some(StreamStats {
            packets: state.counters.packets,
            bytes: state.counters.bytes,
            packets_lost: state.counters.lost,
            jitter: state.jitter,
            layers,
        })
    }

    fn audio_level(&self) -> Option<f64> {
        let mut state = self.state.lock();
        let params = state.audio_params?;
        let levels = std::mem::take(&mut state.audio_levels);
        if levels.is_empty() {
            return None;
        }

        let active: Vec<u8> = levels
            .iter()
            .copied()
            .filter(|l| *l <= params.active_level)
            .collect();
        let percentile = active.len() * 100 / levels.len();
        if active.is_empty() || percentile < usize::from(params.min_percentile) {
            return None;
        }

        let mean = active.iter().map(|l| f64::from(*l)).sum::<f64>() / active.len() as f64;
        Some(10f64.powf(-mean / 20.0))
    }

    fn close(&self) {
        self.closed.cancel();
    }
}
