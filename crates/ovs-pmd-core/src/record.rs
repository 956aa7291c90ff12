//! Per-PMD-thread performance records.
//!
//! Every counter is an `Option`: `None` means the diagnostic text never
//! mentioned the field. That distinction drives both the derived-field
//! back-fill at finalization and the fill-only-missing enrichment merge, so
//! a genuinely observed zero is never overwritten.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

/// Identity of a PMD thread. The core id doubles as the thread id and is
/// the join key across diagnostic commands.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ThreadIdentity {
    pub numa_id: String,
    pub core_id: String,
}

impl ThreadIdentity {
    pub fn new(numa_id: impl Into<String>, core_id: impl Into<String>) -> Self {
        Self {
            numa_id: numa_id.into(),
            core_id: core_id.into(),
        }
    }
}

impl fmt::Display for ThreadIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "numa {} core {}", self.numa_id, self.core_id)
    }
}

/// Flow cache tiers, fastest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTierKind {
    /// Exact match cache (EMC).
    Exact,
    /// Signature match cache (SMC).
    Signature,
    /// Megaflow (dpcls) classifier.
    Megaflow,
}

impl CacheTierKind {
    pub const ALL: [CacheTierKind; 3] = [Self::Exact, Self::Signature, Self::Megaflow];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "emc",
            Self::Signature => "smc",
            Self::Megaflow => "megaflow",
        }
    }

    /// Map the name printed by OVS (`emc`, `smc`, `megaflow`) to a tier.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.to_ascii_lowercase().as_str() {
            "emc" | "exact" => Some(Self::Exact),
            "smc" | "signature" => Some(Self::Signature),
            "megaflow" | "dpcls" => Some(Self::Megaflow),
            _ => None,
        }
    }
}

impl fmt::Display for CacheTierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters for one cache tier.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheTier {
    pub hits: Option<u64>,
    pub inserts: Option<u64>,
    /// Ratio in `[0, 1]`.
    pub hit_ratio: Option<f64>,
}

impl CacheTier {
    fn fill_missing(&mut self, other: &CacheTier) {
        fill(&mut self.hits, other.hits);
        fill(&mut self.inserts, other.inserts);
        fill(&mut self.hit_ratio, other.hit_ratio);
    }
}

/// Named distributions printed in the histogram sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HistogramKind {
    Cycles,
    Packets,
    BatchSize,
}

impl HistogramKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cycles => "cycles",
            Self::Packets => "packets",
            Self::BatchSize => "batch_size",
        }
    }

    /// Map a histogram section name (`cycles`, `packets`, `batch`,
    /// `batch size`) to a kind.
    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.to_ascii_lowercase();
        match label.split_whitespace().collect::<Vec<_>>().as_slice() {
            ["cycles"] => Some(Self::Cycles),
            ["packets"] => Some(Self::Packets),
            ["batch"] | ["batch", "size"] => Some(Self::BatchSize),
            _ => None,
        }
    }
}

/// Bucket label (`"0-10"`, `"1000+"`) to occurrence count.
pub type Histogram = BTreeMap<String, u64>;

/// One poll's worth of performance data for a single PMD thread.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerThreadRecord {
    pub numa_id: String,
    pub core_id: String,

    // Cycle accounting
    /// Busy share of used cycles, as a ratio in `[0, 1]`.
    pub cpu_utilization: Option<f64>,
    pub iterations: Option<u64>,
    pub sleep_iterations: Option<u64>,
    pub busy_iterations: Option<u64>,
    pub us_per_iteration: Option<f64>,
    pub busy_cycles: Option<u64>,
    pub idle_cycles: Option<u64>,
    pub total_cycles: Option<u64>,
    pub cycles_per_iteration: Option<f64>,
    pub cycles_per_packet: Option<f64>,

    // Throughput
    pub packets_per_iteration: Option<f64>,
    pub packets_per_batch: Option<f64>,
    pub total_packets: Option<u64>,
    pub rx_batches: Option<u64>,
    pub rx_packets: Option<u64>,
    pub avg_rx_batch_size: Option<f64>,
    pub max_rx_batch_size: Option<u64>,
    pub tx_batches: Option<u64>,
    pub tx_packets: Option<u64>,
    pub avg_tx_batch_size: Option<f64>,

    // Queueing
    pub max_vhost_queue_length: Option<u64>,
    pub avg_vhost_queue_length: Option<f64>,
    pub vhost_queue_full: Option<u64>,
    pub vhost_tx_retries: Option<u64>,
    pub vhost_tx_contention: Option<u64>,
    pub vhost_tx_irqs: Option<u64>,

    // Control-plane interaction
    pub upcalls: Option<u64>,
    pub upcall_cycles: Option<u64>,
    pub avg_upcall_cycles: Option<f64>,

    // Cache performance
    pub exact_match_hit: Option<u64>,
    pub masked_hit: Option<u64>,
    pub miss: Option<u64>,
    pub lost: Option<u64>,
    pub cache_tiers: BTreeMap<CacheTierKind, CacheTier>,

    // Anomaly detection
    pub suspicious_iterations: Option<u64>,
    /// Ratio in `[0, 1]`.
    pub suspicious_ratio: Option<f64>,

    pub histograms: BTreeMap<HistogramKind, Histogram>,
}

impl WorkerThreadRecord {
    /// A zero-valued record carrying only its identity.
    pub fn new(numa_id: impl Into<String>, core_id: impl Into<String>) -> Self {
        Self {
            numa_id: numa_id.into(),
            core_id: core_id.into(),
            ..Default::default()
        }
    }

    pub fn identity(&self) -> ThreadIdentity {
        ThreadIdentity::new(self.numa_id.clone(), self.core_id.clone())
    }

    pub fn is_same_thread(&self, other: &WorkerThreadRecord) -> bool {
        self.numa_id == other.numa_id && self.core_id == other.core_id
    }

    pub fn cache_tier(&self, kind: CacheTierKind) -> Option<&CacheTier> {
        self.cache_tiers.get(&kind)
    }

    pub(crate) fn cache_tier_mut(&mut self, kind: CacheTierKind) -> &mut CacheTier {
        self.cache_tiers.entry(kind).or_default()
    }

    pub fn histogram(&self, kind: HistogramKind) -> Option<&Histogram> {
        self.histograms.get(&kind)
    }

    /// Compute derived fields. Only fields that were never observed are
    /// filled in.
    pub fn finalize(&mut self) {
        if self.total_cycles.is_none() && (self.busy_cycles.is_some() || self.idle_cycles.is_some())
        {
            let busy = self.busy_cycles.unwrap_or(0);
            let idle = self.idle_cycles.unwrap_or(0);
            self.total_cycles = Some(busy.saturating_add(idle));
        }

        if self.total_packets.is_none() {
            if let (Some(iterations), Some(per_it)) = (self.iterations, self.packets_per_iteration)
            {
                let product = iterations as f64 * per_it;
                if product.is_finite() && product >= 0.0 && product < u64::MAX as f64 {
                    self.total_packets = Some(product.floor() as u64);
                }
            }
        }

        if self.busy_iterations.is_none() {
            if let (Some(total), Some(sleep)) = (self.iterations, self.sleep_iterations) {
                self.busy_iterations = Some(total.saturating_sub(sleep));
            }
        }

        if let Some(lookups) = self.rx_packets.filter(|&n| n > 0) {
            for tier in self.cache_tiers.values_mut() {
                if tier.hit_ratio.is_none() {
                    if let Some(hits) = tier.hits {
                        tier.hit_ratio = Some((hits as f64 / lookups as f64).min(1.0));
                    }
                }
            }
        }
    }

    /// Copy every field that `other` observed and `self` did not.
    ///
    /// Fields already populated in `self` are never overwritten; histogram
    /// buckets and cache tiers are merged entry by entry under the same rule.
    pub fn fill_missing(&mut self, other: &WorkerThreadRecord) {
        fill(&mut self.cpu_utilization, other.cpu_utilization);
        fill(&mut self.iterations, other.iterations);
        fill(&mut self.sleep_iterations, other.sleep_iterations);
        fill(&mut self.busy_iterations, other.busy_iterations);
        fill(&mut self.us_per_iteration, other.us_per_iteration);
        fill(&mut self.busy_cycles, other.busy_cycles);
        fill(&mut self.idle_cycles, other.idle_cycles);
        fill(&mut self.total_cycles, other.total_cycles);
        fill(&mut self.cycles_per_iteration, other.cycles_per_iteration);
        fill(&mut self.cycles_per_packet, other.cycles_per_packet);

        fill(&mut self.packets_per_iteration, other.packets_per_iteration);
        fill(&mut self.packets_per_batch, other.packets_per_batch);
        fill(&mut self.total_packets, other.total_packets);
        fill(&mut self.rx_batches, other.rx_batches);
        fill(&mut self.rx_packets, other.rx_packets);
        fill(&mut self.avg_rx_batch_size, other.avg_rx_batch_size);
        fill(&mut self.max_rx_batch_size, other.max_rx_batch_size);
        fill(&mut self.tx_batches, other.tx_batches);
        fill(&mut self.tx_packets, other.tx_packets);
        fill(&mut self.avg_tx_batch_size, other.avg_tx_batch_size);

        fill(&mut self.max_vhost_queue_length, other.max_vhost_queue_length);
        fill(&mut self.avg_vhost_queue_length, other.avg_vhost_queue_length);
        fill(&mut self.vhost_queue_full, other.vhost_queue_full);
        fill(&mut self.vhost_tx_retries, other.vhost_tx_retries);
        fill(&mut self.vhost_tx_contention, other.vhost_tx_contention);
        fill(&mut self.vhost_tx_irqs, other.vhost_tx_irqs);

        fill(&mut self.upcalls, other.upcalls);
        fill(&mut self.upcall_cycles, other.upcall_cycles);
        fill(&mut self.avg_upcall_cycles, other.avg_upcall_cycles);

        fill(&mut self.exact_match_hit, other.exact_match_hit);
        fill(&mut self.masked_hit, other.masked_hit);
        fill(&mut self.miss, other.miss);
        fill(&mut self.lost, other.lost);
        for (kind, tier) in &other.cache_tiers {
            self.cache_tiers
                .entry(*kind)
                .or_default()
                .fill_missing(tier);
        }

        fill(&mut self.suspicious_iterations, other.suspicious_iterations);
        fill(&mut self.suspicious_ratio, other.suspicious_ratio);

        for (kind, buckets) in &other.histograms {
            let mine = self.histograms.entry(*kind).or_default();
            for (label, count) in buckets {
                mine.entry(label.clone()).or_insert(*count);
            }
        }
    }
}

fn fill<T: Copy>(slot: &mut Option<T>, value: Option<T>) {
    if slot.is_none() {
        *slot = value;
    }
}
