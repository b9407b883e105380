//! Packet metrics for the forwarding path
//!
//! Receivers and spreaders take an injected [`MetricsSink`] instead of
//! touching process-wide counters, so independent instances never collide
//! and tests can observe exactly what one receiver forwarded.

use prometheus::{opts, CounterVec, Registry};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Packet flow direction relative to the SFU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Incoming => "incoming",
            Self::Outgoing => "outgoing",
        }
    }
}

/// Sink for hot-path counters. Implementations must never block.
pub trait MetricsSink: Send + Sync {
    fn increment_packets(&self, direction: Direction, count: u64);
    fn increment_bytes(&self, direction: Direction, count: u64);
    fn increment_rtcp(&self, direction: Direction, nack: u32, pli: u32, fir: u32);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment_packets(&self, _direction: Direction, _count: u64) {}
    fn increment_bytes(&self, _direction: Direction, _count: u64) {}
    fn increment_rtcp(&self, _direction: Direction, _nack: u32, _pli: u32, _fir: u32) {}
}

/// In-memory atomic counters
#[derive(Debug, Default)]
pub struct PacketCounters {
    packets_in: AtomicU64,
    packets_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    nack_total: AtomicU64,
    pli_total: AtomicU64,
    fir_total: AtomicU64,
}

/// Point-in-time copy of [`PacketCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketCountersSnapshot {
    pub packets_in: u64,
    pub packets_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub nack_total: u64,
    pub pli_total: u64,
    pub fir_total: u64,
}

impl PacketCounters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn snapshot(&self) -> PacketCountersSnapshot {
        PacketCountersSnapshot {
            packets_in: self.packets_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            nack_total: self.nack_total.load(Ordering::Relaxed),
            pli_total: self.pli_total.load(Ordering::Relaxed),
            fir_total: self.fir_total.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSink for PacketCounters {
    fn increment_packets(&self, direction: Direction, count: u64) {
        match direction {
            Direction::Incoming => self.packets_in.fetch_add(count, Ordering::Relaxed),
            Direction::Outgoing => self.packets_out.fetch_add(count, Ordering::Relaxed),
        };
    }

    fn increment_bytes(&self, direction: Direction, count: u64) {
        match direction {
            Direction::Incoming => self.bytes_in.fetch_add(count, Ordering::Relaxed),
            Direction::Outgoing => self.bytes_out.fetch_add(count, Ordering::Relaxed),
        };
    }

    fn increment_rtcp(&self, _direction: Direction, nack: u32, pli: u32, fir: u32) {
        self.nack_total.fetch_add(u64::from(nack), Ordering::Relaxed);
        self.pli_total.fetch_add(u64::from(pli), Ordering::Relaxed);
        self.fir_total.fetch_add(u64::from(fir), Ordering::Relaxed);
    }
}

/// Prometheus counter vectors labelled by direction
pub struct PrometheusMetrics {
    packet_total: CounterVec,
    packet_bytes: CounterVec,
    nack_total: CounterVec,
    pli_total: CounterVec,
    fir_total: CounterVec,
}

const NAMESPACE: &str = "roomcast";
const DIRECTION_LABEL: &[&str] = &["direction"];

fn counter_vec(
    registry: &Registry,
    node_id: &str,
    subsystem: &str,
    name: &str,
    help: &str,
) -> prometheus::Result<CounterVec> {
    let counter = CounterVec::new(
        opts!(name, help)
            .namespace(NAMESPACE)
            .subsystem(subsystem)
            .const_label("node_id", node_id),
        DIRECTION_LABEL,
    )?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl PrometheusMetrics {
    /// Register the packet counters into `registry`
    pub fn new(registry: &Registry, node_id: &str) -> prometheus::Result<Self> {
        Ok(Self {
            packet_total: counter_vec(registry, node_id, "packet", "total", "Total RTP packets")?,
            packet_bytes: counter_vec(registry, node_id, "packet", "bytes", "Total RTP bytes")?,
            nack_total: counter_vec(registry, node_id, "nack", "total", "Total NACKs")?,
            pli_total: counter_vec(registry, node_id, "pli", "total", "Total PLIs")?,
            fir_total: counter_vec(registry, node_id, "fir", "total", "Total FIRs")?,
        })
    }
}

impl MetricsSink for PrometheusMetrics {
    fn increment_packets(&self, direction: Direction, count: u64) {
        self.packet_total
            .with_label_values(&[direction.as_str()])
            .inc_by(count as f64);
    }

    fn increment_bytes(&self, direction: Direction, count: u64) {
        self.packet_bytes
            .with_label_values(&[direction.as_str()])
            .inc_by(count as f64);
    }

    fn increment_rtcp(&self, direction: Direction, nack: u32, pli: u32, fir: u32) {
        if nack > 0 {
            self.nack_total
                .with_label_values(&[direction.as_str()])
                .inc_by(f64::from(nack));
        }
        if pli > 0 {
            self.pli_total
                .with_label_values(&[direction.as_str()])
                .inc_by(f64::from(pli));
        }
        if fir > 0 {
            self.fir_total
                .with_label_values(&[direction.as_str()])
                .inc_by(f64::from(fir));
        }
    }
}
