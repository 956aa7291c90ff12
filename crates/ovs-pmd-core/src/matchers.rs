//! Field Matcher Set: the ordered table of line patterns recognised inside
//! a PMD thread block.
//!
//! Each [`FieldMatcher`] pairs a regex with a plain function that writes the
//! captured values into a [`WorkerThreadRecord`]. The table is data: new
//! field families are added by extending [`FieldMatcherSet::standard`] (or
//! building a custom set), never by touching the scanning loop.
//!
//! Patterns are case-insensitive, anchored at the start of the line after
//! leading whitespace and an optional `- ` bullet, and the first matcher in
//! declaration order wins. Values that fail numeric conversion leave their
//! field untouched.

use std::fmt;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::record::{CacheTierKind, WorkerThreadRecord};

/// Prefix applied to every built-in field pattern.
const LINE_PREFIX: &str = r"(?i)^\s*(?:-\s*)?";

/// Metric family a matched line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldFamily {
    CpuUtilization,
    BusyCycles,
    IdleCycles,
    TotalCycles,
    SuspiciousIterations,
    SleepIterations,
    BusyIterations,
    Iterations,
    CyclesPerIteration,
    PacketsPerIteration,
    CyclesPerPacket,
    PacketsPerBatch,
    RxBatches,
    TxBatches,
    RxPackets,
    TxPackets,
    TotalPackets,
    MaxVhostQueueLength,
    AvgVhostQueueLength,
    VhostQueueFull,
    Upcalls,
    AvgUpcallCycles,
    VhostTxRetries,
    VhostTxContention,
    VhostTxIrqs,
    ExactMatchHit,
    MaskedHit,
    Miss,
    Lost,
    CacheTierHits,
    CacheTierInserts,
}

impl fmt::Display for FieldFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Writes captured values into a record.
pub type ApplyFn = fn(&Captures<'_>, &mut WorkerThreadRecord);

/// One recognised line shape.
pub struct FieldMatcher {
    family: FieldFamily,
    pattern: Regex,
    apply: ApplyFn,
}

impl FieldMatcher {
    pub fn new(family: FieldFamily, pattern: &str, apply: ApplyFn) -> Result<Self, regex::Error> {
        Ok(Self {
            family,
            pattern: Regex::new(pattern)?,
            apply,
        })
    }

    pub fn family(&self) -> FieldFamily {
        self.family
    }

    pub fn pattern(&self) -> &Regex {
        &self.pattern
    }
}

impl fmt::Debug for FieldMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldMatcher")
            .field("family", &self.family)
            .field("pattern", &self.pattern.as_str())
            .finish()
    }
}

/// Ordered list of field matchers.
#[derive(Debug)]
pub struct FieldMatcherSet {
    matchers: Vec<FieldMatcher>,
}

static STANDARD: LazyLock<FieldMatcherSet> = LazyLock::new(|| {
    FieldMatcherSet::build_standard().expect("built-in PMD field patterns are valid")
});

impl FieldMatcherSet {
    pub fn new(matchers: Vec<FieldMatcher>) -> Self {
        Self { matchers }
    }

    /// The built-in table covering `pmd-perf-show` and `pmd-stats-show`.
    pub fn standard() -> &'static FieldMatcherSet {
        &STANDARD
    }

    pub fn len(&self) -> usize {
        self.matchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    pub fn families(&self) -> impl Iterator<Item = FieldFamily> + '_ {
        self.matchers.iter().map(|m| m.family)
    }

    /// Find the first matcher accepting `line`.
    pub fn find<'l>(&self, line: &'l str) -> Option<(&FieldMatcher, Captures<'l>)> {
        self.matchers
            .iter()
            .find_map(|m| m.pattern.captures(line).map(|caps| (m, caps)))
    }

    /// Offer `line` to the table and apply the winning matcher to `record`.
    ///
    /// Returns the family that matched, if any. A match whose values fail to
    /// convert still counts as a match; it simply leaves the record alone.
    pub fn apply_line(&self, line: &str, record: &mut WorkerThreadRecord) -> Option<FieldFamily> {
        let (matcher, caps) = self.find(line)?;
        (matcher.apply)(&caps, record);
        Some(matcher.family)
    }

    fn build_standard() -> Result<Self, regex::Error> {
        use FieldFamily::*;

        let table: [(FieldFamily, &str, ApplyFn); 31] = [
            (
                CpuUtilization,
                r"(?:cpu|processor) utilization:\s+([\d.]+)\s*%",
                |c, r| set(&mut r.cpu_utilization, percent(c, 1)),
            ),
            (
                BusyCycles,
                r"busy cycles:\s+([\d.]+)\s*%.*?\(\s*([\d.]+)\s*Mcycles",
                |c, r| {
                    set_if_none(&mut r.cpu_utilization, percent(c, 1));
                    set(&mut r.busy_cycles, mcycles(c, 2));
                },
            ),
            (
                IdleCycles,
                r"idle cycles:\s+([\d.]+)\s*%.*?\(\s*([\d.]+)\s*Mcycles",
                |c, r| set(&mut r.idle_cycles, mcycles(c, 2)),
            ),
            (
                IdleCycles,
                r"idle cycles:\s+(\d+)\s*\(\s*[\d.]+\s*%\s*\)",
                |c, r| set(&mut r.idle_cycles, int(c, 1)),
            ),
            (
                BusyCycles,
                r"processing cycles:\s+(\d+)\s*\(\s*([\d.]+)\s*%\s*\)",
                |c, r| {
                    set(&mut r.busy_cycles, int(c, 1));
                    set_if_none(&mut r.cpu_utilization, percent(c, 2));
                },
            ),
            (
                TotalCycles,
                r"(?:used tsc|total) cycles:\s+(\d+)",
                |c, r| set(&mut r.total_cycles, int(c, 1)),
            ),
            (
                SuspiciousIterations,
                r"suspicious iterations:\s+(\d+)(?:\s*\(\s*([\d.]+)\s*%\s*\))?",
                |c, r| {
                    set(&mut r.suspicious_iterations, int(c, 1));
                    set(&mut r.suspicious_ratio, percent(c, 2));
                },
            ),
            (
                SleepIterations,
                r"sleep iterations:\s+(\d+)",
                |c, r| set(&mut r.sleep_iterations, int(c, 1)),
            ),
            (
                BusyIterations,
                r"busy iterations:\s+(\d+)",
                |c, r| set(&mut r.busy_iterations, int(c, 1)),
            ),
            (
                Iterations,
                r"iterations:\s+(\d+)(?:\s*\(\s*([\d.]+)\s*us/it\s*\))?",
                |c, r| {
                    set(&mut r.iterations, int(c, 1));
                    set(&mut r.us_per_iteration, float(c, 2));
                },
            ),
            (
                CyclesPerIteration,
                r"cycles/it:\s+([\d.]+)",
                |c, r| set(&mut r.cycles_per_iteration, float(c, 1)),
            ),
            (
                PacketsPerIteration,
                r"pkts/it:\s+([\d.]+)",
                |c, r| set(&mut r.packets_per_iteration, float(c, 1)),
            ),
            (
                CyclesPerPacket,
                r"cycles/pkt:\s+([\d.]+)",
                |c, r| set(&mut r.cycles_per_packet, float(c, 1)),
            ),
            (
                PacketsPerBatch,
                r"avg\.? pkts/batch:\s+([\d.]+)",
                |c, r| set(&mut r.packets_per_batch, float(c, 1)),
            ),
            (
                RxBatches,
                r"rx batches:\s+(\d+)(?:.*?avg:\s+([\d.]+))?(?:.*?max:\s+(\d+))?",
                |c, r| {
                    set(&mut r.rx_batches, int(c, 1));
                    set(&mut r.avg_rx_batch_size, float(c, 2));
                    set(&mut r.max_rx_batch_size, int(c, 3));
                },
            ),
            (
                TxBatches,
                r"tx batches:\s+(\d+)(?:.*?avg:\s+([\d.]+))?",
                |c, r| {
                    set(&mut r.tx_batches, int(c, 1));
                    set(&mut r.avg_tx_batch_size, float(c, 2));
                },
            ),
            (
                RxPackets,
                r"(?:rx packets|packets received):\s+(\d+)",
                |c, r| set(&mut r.rx_packets, int(c, 1)),
            ),
            (
                TxPackets,
                r"tx packets:\s+(\d+)",
                |c, r| set(&mut r.tx_packets, int(c, 1)),
            ),
            (
                TotalPackets,
                r"total packets:\s+(\d+)",
                |c, r| set(&mut r.total_packets, int(c, 1)),
            ),
            (
                MaxVhostQueueLength,
                r"(?:avg\.? )?max vhost qlen:\s+(\d+)",
                |c, r| set(&mut r.max_vhost_queue_length, int(c, 1)),
            ),
            (
                AvgVhostQueueLength,
                r"avg\.? vhost qlen:\s+([\d.]+)",
                |c, r| set(&mut r.avg_vhost_queue_length, float(c, 1)),
            ),
            (
                VhostQueueFull,
                r"vhost queue full:\s+(\d+)",
                |c, r| set(&mut r.vhost_queue_full, int(c, 1)),
            ),
            (
                Upcalls,
                r"upcalls:\s+(\d+)(?:\s*\(\s*[\d.]+\s*us\s+([\d.]+)\s*Mcycles\s*\))?",
                |c, r| {
                    set(&mut r.upcalls, int(c, 1));
                    set(&mut r.upcall_cycles, mcycles(c, 2));
                },
            ),
            (
                AvgUpcallCycles,
                r"avg\.? upcall cycles:\s+([\d.]+)",
                |c, r| set(&mut r.avg_upcall_cycles, float(c, 1)),
            ),
            (
                VhostTxRetries,
                r"vhost tx retries:\s+(\d+)",
                |c, r| set(&mut r.vhost_tx_retries, int(c, 1)),
            ),
            (
                VhostTxContention,
                r"vhost tx contention:\s+(\d+)",
                |c, r| set(&mut r.vhost_tx_contention, int(c, 1)),
            ),
            (
                VhostTxIrqs,
                r"vhost tx irqs:\s+(\d+)",
                |c, r| set(&mut r.vhost_tx_irqs, int(c, 1)),
            ),
            (
                ExactMatchHit,
                r"exact match hit:\s+(\d+)",
                |c, r| set(&mut r.exact_match_hit, int(c, 1)),
            ),
            (
                MaskedHit,
                r"masked hit:\s+(\d+)",
                |c, r| set(&mut r.masked_hit, int(c, 1)),
            ),
            (Miss, r"miss:\s+(\d+)", |c, r| set(&mut r.miss, int(c, 1))),
            (Lost, r"lost:\s+(\d+)", |c, r| set(&mut r.lost, int(c, 1))),
        ];

        let tiers: [(FieldFamily, &str, ApplyFn); 2] = [
            (
                CacheTierHits,
                r"(emc|smc|megaflow) hits:\s+(\d+)(?:\s*\(\s*([\d.]+)\s*%\s*\))?",
                |c, r| {
                    let Some(kind) = c.get(1).and_then(|m| CacheTierKind::from_label(m.as_str()))
                    else {
                        return;
                    };
                    let hits = int(c, 2);
                    let ratio = percent(c, 3);
                    if hits.is_none() && ratio.is_none() {
                        return;
                    }
                    let tier = r.cache_tier_mut(kind);
                    set(&mut tier.hits, hits);
                    set(&mut tier.hit_ratio, ratio);
                },
            ),
            (
                CacheTierInserts,
                r"(emc|smc|megaflow) inserts:\s+(\d+)",
                |c, r| {
                    let Some(kind) = c.get(1).and_then(|m| CacheTierKind::from_label(m.as_str()))
                    else {
                        return;
                    };
                    if let Some(n) = int(c, 2) {
                        r.cache_tier_mut(kind).inserts = Some(n);
                    }
                },
            ),
        ];

        let matchers = table
            .into_iter()
            .chain(tiers)
            .map(|(family, body, apply)| {
                FieldMatcher::new(family, &format!("{LINE_PREFIX}{body}"), apply)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::new(matchers))
    }
}

// ---------------------------------------------------------------------------
// Capture conversion
// ---------------------------------------------------------------------------

fn set<T>(slot: &mut Option<T>, value: Option<T>) {
    if let Some(v) = value {
        *slot = Some(v);
    }
}

fn set_if_none<T>(slot: &mut Option<T>, value: Option<T>) {
    if slot.is_none() {
        set(slot, value);
    }
}

/// Parse capture `i` as an unsigned integer.
pub fn int(caps: &Captures<'_>, i: usize) -> Option<u64> {
    caps.get(i)?.as_str().parse().ok()
}

/// Parse capture `i` as a finite, non-negative float.
pub fn float(caps: &Captures<'_>, i: usize) -> Option<f64> {
    let v: f64 = caps.get(i)?.as_str().parse().ok()?;
    (v.is_finite() && v >= 0.0).then_some(v)
}

/// Parse a percentage capture into a ratio.
pub fn percent(caps: &Captures<'_>, i: usize) -> Option<f64> {
    float(caps, i).map(|p| p / 100.0)
}

/// Parse a mega-cycles capture into a whole cycle count (truncated).
pub fn mcycles(caps: &Captures<'_>, i: usize) -> Option<u64> {
    mcycles_to_cycles(float(caps, i)?)
}

/// Convert mega-cycles to cycles, truncating. `None` on overflow.
pub fn mcycles_to_cycles(mcycles: f64) -> Option<u64> {
    let cycles = mcycles * 1_000_000.0;
    (cycles.is_finite() && cycles >= 0.0 && cycles < u64::MAX as f64).then(|| cycles as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::HistogramKind;

    fn apply(line: &str) -> (Option<FieldFamily>, WorkerThreadRecord) {
        let mut rec = WorkerThreadRecord::new("0", "2");
        let family = FieldMatcherSet::standard().apply_line(line, &mut rec);
        (family, rec)
    }

    #[test]
    fn standard_table_compiles() {
        assert_eq!(FieldMatcherSet::standard().len(), 33);
    }

    #[test]
    fn iterations_with_us_per_it() {
        let (family, rec) = apply("  iterations:        12345678 (123.45 us/it)");
        assert_eq!(family, Some(FieldFamily::Iterations));
        assert_eq!(rec.iterations, Some(12_345_678));
        assert_eq!(rec.us_per_iteration, Some(123.45));
    }

    #[test]
    fn iterations_without_qualifier() {
        let (_, rec) = apply("Iterations:   42");
        assert_eq!(rec.iterations, Some(42));
        assert_eq!(rec.us_per_iteration, None);
    }

    #[test]
    fn sleep_and_suspicious_iterations_do_not_hit_iterations() {
        let (family, rec) = apply("  sleep iterations:  40 (12.5 %)");
        assert_eq!(family, Some(FieldFamily::SleepIterations));
        assert_eq!(rec.sleep_iterations, Some(40));
        assert_eq!(rec.iterations, None);

        let (family, rec) = apply("  suspicious iterations: 3 (0.25%)");
        assert_eq!(family, Some(FieldFamily::SuspiciousIterations));
        assert_eq!(rec.suspicious_iterations, Some(3));
        assert_eq!(rec.suspicious_ratio, Some(0.0025));
        assert_eq!(rec.iterations, None);
    }

    #[test]
    fn busy_cycles_converts_mcycles() {
        let (_, rec) = apply("  busy cycles:       75.2% (2345.5 Mcycles, 1234 us/it)");
        assert_eq!(rec.busy_cycles, Some(2_345_500_000));
        assert!((rec.cpu_utilization.unwrap() - 0.752).abs() < 1e-9);
    }

    #[test]
    fn mcycles_truncate() {
        assert_eq!(mcycles_to_cycles(0.05), Some(50_000));
        assert_eq!(mcycles_to_cycles(1.0000009), Some(1_000_000));
        assert_eq!(mcycles_to_cycles(1e300), None);
    }

    #[test]
    fn stats_show_cycle_lines() {
        let (family, rec) = apply("  idle cycles: 1917412924 (98.58%)");
        assert_eq!(family, Some(FieldFamily::IdleCycles));
        assert_eq!(rec.idle_cycles, Some(1_917_412_924));

        let (family, rec) = apply("  processing cycles: 27607268 (1.42%)");
        assert_eq!(family, Some(FieldFamily::BusyCycles));
        assert_eq!(rec.busy_cycles, Some(27_607_268));
        assert!((rec.cpu_utilization.unwrap() - 0.0142).abs() < 1e-9);
    }

    #[test]
    fn cycles_per_iteration_ignores_trailing_mcycles() {
        let (family, rec) = apply("  cycles/it: 500.0 (0.05 Mcycles)");
        assert_eq!(family, Some(FieldFamily::CyclesPerIteration));
        assert_eq!(rec.cycles_per_iteration, Some(500.0));
    }

    #[test]
    fn batch_lines() {
        let (_, rec) = apply("  rx batches: 1000 (avg: 31.5, max: 32)");
        assert_eq!(rec.rx_batches, Some(1000));
        assert_eq!(rec.avg_rx_batch_size, Some(31.5));
        assert_eq!(rec.max_rx_batch_size, Some(32));

        let (_, rec) = apply("  tx batches: 900 (avg: 12.0)");
        assert_eq!(rec.tx_batches, Some(900));
        assert_eq!(rec.avg_tx_batch_size, Some(12.0));

        let (_, rec) = apply("  avg pkts/batch:    32.1");
        assert_eq!(rec.packets_per_batch, Some(32.1));
    }

    #[test]
    fn vhost_queue_lines() {
        let (family, rec) = apply("  avg max vhost qlen: 128");
        assert_eq!(family, Some(FieldFamily::MaxVhostQueueLength));
        assert_eq!(rec.max_vhost_queue_length, Some(128));

        let (family, rec) = apply("  avg vhost qlen: 3.5");
        assert_eq!(family, Some(FieldFamily::AvgVhostQueueLength));
        assert_eq!(rec.avg_vhost_queue_length, Some(3.5));

        let (_, rec) = apply("  vhost queue full: 17");
        assert_eq!(rec.vhost_queue_full, Some(17));
    }

    #[test]
    fn upcalls_with_cycles() {
        let (_, rec) = apply("  upcalls:           1234 (567.8 us 89.0 Mcycles)");
        assert_eq!(rec.upcalls, Some(1234));
        assert_eq!(rec.upcall_cycles, Some(89_000_000));

        let (family, rec) = apply("  avg upcall cycles: 7200.5");
        assert_eq!(family, Some(FieldFamily::AvgUpcallCycles));
        assert_eq!(rec.avg_upcall_cycles, Some(7200.5));
        assert_eq!(rec.upcalls, None);
    }

    #[test]
    fn lost_upcalls_is_not_upcalls() {
        let (family, rec) = apply("  - Lost upcalls:   5");
        assert_eq!(family, None);
        assert_eq!(rec.upcalls, None);
    }

    #[test]
    fn hit_miss_lines_are_anchored() {
        let (family, rec) = apply("  megaflow miss: 12");
        assert_eq!(family, None);
        assert_eq!(rec.miss, None);

        let (_, rec) = apply("  miss: 12");
        assert_eq!(rec.miss, Some(12));
        let (_, rec) = apply("  exact match hit: 4");
        assert_eq!(rec.exact_match_hit, Some(4));
        let (_, rec) = apply("  masked hit: 9");
        assert_eq!(rec.masked_hit, Some(9));
        let (_, rec) = apply("  lost: 1");
        assert_eq!(rec.lost, Some(1));
    }

    #[test]
    fn cache_tier_hits_and_inserts() {
        let (family, rec) = apply("  emc hits: 1500 (75.0%)");
        assert_eq!(family, Some(FieldFamily::CacheTierHits));
        let emc = rec.cache_tier(CacheTierKind::Exact).unwrap();
        assert_eq!(emc.hits, Some(1500));
        assert_eq!(emc.hit_ratio, Some(0.75));

        let (_, rec) = apply("  - Megaflow hits:   20");
        let mf = rec.cache_tier(CacheTierKind::Megaflow).unwrap();
        assert_eq!(mf.hits, Some(20));
        assert_eq!(mf.hit_ratio, None);

        let (_, rec) = apply("  smc inserts: 8");
        assert_eq!(rec.cache_tier(CacheTierKind::Signature).unwrap().inserts, Some(8));
    }

    #[test]
    fn overflow_skips_field_but_still_matches() {
        let (family, rec) = apply("  iterations: 99999999999999999999999 (1.0 us/it)");
        assert_eq!(family, Some(FieldFamily::Iterations));
        assert_eq!(rec.iterations, None);
        assert_eq!(rec.us_per_iteration, Some(1.0));
    }

    #[test]
    fn malformed_float_skips_field() {
        let (family, rec) = apply("  pkts/it: 1.2.3");
        assert_eq!(family, Some(FieldFamily::PacketsPerIteration));
        assert_eq!(rec.packets_per_iteration, None);
    }

    #[test]
    fn prose_and_blank_lines_match_nothing() {
        for line in ["", "Time: 13:34:40.160", "Measurement duration: 1.074 s", "   "] {
            let (family, rec) = apply(line);
            assert_eq!(family, None, "line {line:?}");
            assert_eq!(rec, WorkerThreadRecord::new("0", "2"));
        }
    }

    #[test]
    fn custom_set_is_injectable() {
        let set = FieldMatcherSet::new(vec![
            FieldMatcher::new(FieldFamily::Lost, r"^dropped=(\d+)$", |c, r| {
                r.lost = int(c, 1);
            })
            .unwrap(),
        ]);
        let mut rec = WorkerThreadRecord::new("1", "1");
        assert_eq!(set.apply_line("dropped=5", &mut rec), Some(FieldFamily::Lost));
        assert_eq!(rec.lost, Some(5));
        assert_eq!(set.apply_line("  lost: 9", &mut rec), None);
        assert!(rec.histogram(HistogramKind::Cycles).is_none());
    }
}
