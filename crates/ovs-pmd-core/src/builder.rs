//! Record Builder: a two-state line scanner over PMD diagnostic text.
//!
//! ```text
//!  NoActiveRecord ──thread header──▶ BuildingRecord ──thread header──▶ BuildingRecord (new)
//!        ▲                                 │
//!        └──────── main thread header ─────┘
//! ```
//!
//! While building, each line is checked against the structural patterns
//! (thread header, `main thread:`, histogram section header, histogram
//! entry) and then offered to the [`FieldMatcherSet`]. Anything else is
//! ignored. Parsing never fails: unreadable text simply yields fewer
//! records.

use std::sync::LazyLock;

use log::debug;
use regex::Regex;

use crate::matchers::FieldMatcherSet;
use crate::record::{HistogramKind, WorkerThreadRecord};

static THREAD_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*pmd thread numa_id\s+(\d+)\s+core_id\s+(\d+)\s*:")
        .expect("thread header pattern is valid")
});

static MAIN_THREAD_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*main thread\s*:").expect("main thread pattern is valid")
});

static HISTOGRAM_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:-\s*)?([a-z][a-z ]*?)\s+histogram\s*:")
        .expect("histogram header pattern is valid")
});

static HISTOGRAM_ENTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d+\s*-\s*\d+|\d+\s*\+)\s*:\s*(\d+)\b")
        .expect("histogram entry pattern is valid")
});

/// Scanner state between lines.
#[derive(Debug)]
enum ScanState {
    NoActiveRecord,
    BuildingRecord {
        record: WorkerThreadRecord,
        histogram: Option<HistogramKind>,
    },
}

impl ScanState {
    /// Move the record under construction, if any, into `out`.
    fn close(self, out: &mut Vec<WorkerThreadRecord>) {
        if let ScanState::BuildingRecord { record, .. } = self {
            out.push(record);
        }
    }
}

/// Turns diagnostic text into finalized [`WorkerThreadRecord`]s.
///
/// The builder holds no per-parse state, so one instance can be shared and
/// reused across polls.
#[derive(Debug, Clone, Copy)]
pub struct RecordBuilder<'m> {
    matchers: &'m FieldMatcherSet,
}

impl Default for RecordBuilder<'static> {
    fn default() -> Self {
        Self::new(FieldMatcherSet::standard())
    }
}

impl<'m> RecordBuilder<'m> {
    pub fn new(matchers: &'m FieldMatcherSet) -> Self {
        Self { matchers }
    }

    /// Parse `text` into finalized records in header-encounter order.
    pub fn parse(&self, text: &str) -> Vec<WorkerThreadRecord> {
        let mut out = self.parse_observed(text);
        out.iter_mut().for_each(WorkerThreadRecord::finalize);
        out
    }

    /// Like [`parse`](Self::parse) but without derived fields, so the
    /// records can still be merged with another source before
    /// [`WorkerThreadRecord::finalize`] runs.
    pub fn parse_observed(&self, text: &str) -> Vec<WorkerThreadRecord> {
        let mut out = Vec::new();
        let mut state = ScanState::NoActiveRecord;
        for line in text.lines() {
            state = self.step(state, line, &mut out);
        }
        state.close(&mut out);
        out
    }

    fn step(&self, state: ScanState, line: &str, out: &mut Vec<WorkerThreadRecord>) -> ScanState {
        if let Some(caps) = THREAD_HEADER.captures(line) {
            state.close(out);
            return ScanState::BuildingRecord {
                record: WorkerThreadRecord::new(&caps[1], &caps[2]),
                histogram: None,
            };
        }

        let ScanState::BuildingRecord {
            mut record,
            mut histogram,
        } = state
        else {
            return ScanState::NoActiveRecord;
        };

        if MAIN_THREAD_HEADER.is_match(line) {
            ScanState::BuildingRecord { record, histogram }.close(out);
            return ScanState::NoActiveRecord;
        }

        if let Some(caps) = HISTOGRAM_HEADER.captures(line) {
            histogram = HistogramKind::from_label(&caps[1]);
            if histogram.is_none() {
                debug!(
                    "ignoring unknown histogram section {:?} for {}",
                    &caps[1],
                    record.identity()
                );
            }
        } else if let Some(caps) = HISTOGRAM_ENTRY.captures(line) {
            if let (Some(kind), Ok(count)) = (histogram, caps[2].parse::<u64>()) {
                let label: String = caps[1].split_whitespace().collect();
                record
                    .histograms
                    .entry(kind)
                    .or_default()
                    .insert(label, count);
            }
        } else {
            self.matchers.apply_line(line, &mut record);
        }

        ScanState::BuildingRecord { record, histogram }
    }
}

/// Parse `text` with the standard field table.
pub fn parse_records(text: &str) -> Vec<WorkerThreadRecord> {
    RecordBuilder::default().parse(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matchers::{FieldFamily, FieldMatcher};
    use crate::record::CacheTierKind;

    const PERF_SHOW: &str = "\
Time: 13:34:40.160
Measurement duration: 1.074 s

pmd thread numa_id 0 core_id 1:

  Iterations:        12345678 (123.45 us/it)
  - Used TSC cycles: 2690000000 (100.0 % of total cycles)
  - idle iterations:  12300000 ( 99.6 % of used cycles)
  - busy cycles:       75.2% (2345.5 Mcycles, 1234 us/it)
  - idle cycles:       24.8% (772.25 Mcycles)
  - sleep iterations:  40 (12.5 %)
  Rx packets:          1024000
  - pkts/it:           2.5
  - cycles/pkt:        1780.2
  - avg pkts/batch:    32.1
  - avg max vhost qlen: 128
  - upcalls:           1234 (567.8 us 89.0 Mcycles)
  - suspicious iterations: 3 (0.25%)
  Tx packets:          1000000
  - emc hits:          768000 (75.0%)
  - megaflow hits:     200000

  cycles histogram:
    0-1000: 500
    1000-5000: 300
    5000+: 10
  packets histogram:
    0-32: 900
    32+: 100

pmd thread numa_id 1 core_id 3:

  Iterations:        42 (1.0 us/it)
";

    #[test]
    fn single_thread_block() {
        let text = "pmd thread numa_id 0 core_id 2:\n  iterations: 100 (1.0 us/it)\n  cycles/it: 500.0 (0.05 Mcycles)\n";
        let records = parse_records(text);
        assert_eq!(records.len(), 1);
        let rec = &records[0];
        assert_eq!(rec.numa_id, "0");
        assert_eq!(rec.core_id, "2");
        assert_eq!(rec.iterations, Some(100));
        assert_eq!(rec.cycles_per_iteration, Some(500.0));
    }

    #[test]
    fn consecutive_headers_yield_zero_valued_records() {
        let records = parse_records("pmd thread numa_id 0 core_id 1:\npmd thread numa_id 0 core_id 2:\n");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], WorkerThreadRecord::new("0", "1"));
        assert_eq!(records[1], WorkerThreadRecord::new("0", "2"));
    }

    #[test]
    fn empty_and_unrecognized_text_yield_nothing() {
        assert!(parse_records("").is_empty());
        assert!(parse_records("\n\n   \n").is_empty());
        assert!(parse_records("ovs-appctl: command not found\niterations: 5\n").is_empty());
    }

    #[test]
    fn full_perf_show_block() {
        let records = parse_records(PERF_SHOW);
        assert_eq!(records.len(), 2);

        let rec = &records[0];
        assert_eq!(rec.identity().to_string(), "numa 0 core 1");
        assert_eq!(rec.iterations, Some(12_345_678));
        assert_eq!(rec.total_cycles, Some(2_690_000_000));
        assert_eq!(rec.busy_cycles, Some(2_345_500_000));
        assert_eq!(rec.idle_cycles, Some(772_250_000));
        assert_eq!(rec.sleep_iterations, Some(40));
        assert_eq!(rec.busy_iterations, Some(12_345_638));
        assert_eq!(rec.rx_packets, Some(1_024_000));
        assert_eq!(rec.tx_packets, Some(1_000_000));
        assert_eq!(rec.max_vhost_queue_length, Some(128));
        assert_eq!(rec.upcalls, Some(1234));
        assert_eq!(rec.upcall_cycles, Some(89_000_000));
        assert_eq!(rec.suspicious_iterations, Some(3));

        // pkts/it 2.5 x 12345678 iterations
        assert_eq!(rec.total_packets, Some(30_864_195));

        let emc = rec.cache_tier(CacheTierKind::Exact).unwrap();
        assert_eq!(emc.hit_ratio, Some(0.75));
        let mf = rec.cache_tier(CacheTierKind::Megaflow).unwrap();
        assert_eq!(mf.hits, Some(200_000));
        // derived from rx packets
        assert_eq!(mf.hit_ratio, Some(200_000.0 / 1_024_000.0));

        let cycles = rec.histogram(HistogramKind::Cycles).unwrap();
        assert_eq!(cycles.len(), 3);
        assert_eq!(cycles["5000+"], 10);
        let packets = rec.histogram(HistogramKind::Packets).unwrap();
        assert_eq!(packets["0-32"], 900);
        assert_eq!(packets["32+"], 100);

        let second = &records[1];
        assert_eq!(second.identity().to_string(), "numa 1 core 3");
        assert_eq!(second.iterations, Some(42));
        assert!(second.histograms.is_empty());
    }

    #[test]
    fn used_total_cycles_wins_over_derivation() {
        let text = "pmd thread numa_id 0 core_id 1:\n  total cycles: 0\n  busy cycles: 10% (1.0 Mcycles)\n";
        let records = parse_records(text);
        assert_eq!(records[0].total_cycles, Some(0));
    }

    #[test]
    fn histogram_entries_reset_on_new_thread() {
        let text = "\
pmd thread numa_id 0 core_id 1:
  cycles histogram:
    0-10: 4
pmd thread numa_id 0 core_id 2:
    0-10: 99
    10+: 1
";
        let records = parse_records(text);
        assert_eq!(records[0].histogram(HistogramKind::Cycles).unwrap()["0-10"], 4);
        assert!(records[1].histograms.is_empty());
    }

    #[test]
    fn histogram_entries_follow_latest_section() {
        let text = "\
pmd thread numa_id 0 core_id 1:
  cycles histogram:
    0-10: 4
  batch size histogram:
    0-10: 7
  iterations: 3
    10+: 2
";
        let rec = &parse_records(text)[0];
        let cycles = rec.histogram(HistogramKind::Cycles).unwrap();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles["0-10"], 4);
        let batch = rec.histogram(HistogramKind::BatchSize).unwrap();
        assert_eq!(batch["0-10"], 7);
        assert_eq!(batch["10+"], 2);
        assert_eq!(rec.iterations, Some(3));
    }

    #[test]
    fn unknown_histogram_section_drops_its_entries() {
        let text = "\
pmd thread numa_id 0 core_id 1:
  cycles histogram:
    0-10: 4
  upcall histogram:
    0-10: 8
";
        let rec = &parse_records(text)[0];
        assert_eq!(rec.histograms.len(), 1);
        assert_eq!(rec.histogram(HistogramKind::Cycles).unwrap()["0-10"], 4);
    }

    #[test]
    fn repeated_bucket_keeps_latest_count() {
        let text = "\
pmd thread numa_id 0 core_id 1:
  cycles histogram:
    0-10: 4
    0-10: 9
";
        let rec = &parse_records(text)[0];
        assert_eq!(rec.histogram(HistogramKind::Cycles).unwrap()["0-10"], 9);
    }

    #[test]
    fn observed_parse_leaves_derived_fields_unset() {
        let text = "\
pmd thread numa_id 0 core_id 1:
  - busy cycles: 10.0% (1.0 Mcycles)
  iterations: 100
  - sleep iterations: 40 (40.0 %)
";
        let builder = RecordBuilder::default();
        let observed = &builder.parse_observed(text)[0];
        assert_eq!(observed.busy_cycles, Some(1_000_000));
        assert_eq!(observed.total_cycles, None);
        assert_eq!(observed.busy_iterations, None);

        let finalized = &builder.parse(text)[0];
        assert_eq!(finalized.total_cycles, Some(1_000_000));
        assert_eq!(finalized.busy_iterations, Some(60));
    }

    #[test]
    fn main_thread_closes_worker_block() {
        let text = "\
pmd thread numa_id 0 core_id 1:
  packets received: 10
main thread:
  packets received: 999
  emc hits: 5
pmd thread numa_id 0 core_id 2:
  packets received: 20
";
        let records = parse_records(text);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].rx_packets, Some(10));
        assert!(records[0].cache_tiers.is_empty());
        assert_eq!(records[1].rx_packets, Some(20));
    }

    #[test]
    fn lines_before_first_header_are_ignored() {
        let text = "iterations: 77\n  cycles histogram:\n    0-10: 4\npmd thread numa_id 2 core_id 9:\n";
        let records = parse_records(text);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0], WorkerThreadRecord::new("2", "9"));
    }

    #[test]
    fn parse_is_idempotent() {
        let builder = RecordBuilder::default();
        assert_eq!(builder.parse(PERF_SHOW), builder.parse(PERF_SHOW));
    }

    #[test]
    fn n_headers_give_n_records_in_order() {
        let text: String = (0..7)
            .map(|i| {
                format!(
                    "pmd thread numa_id {} core_id {}:\n  iterations: {}\n",
                    i % 2,
                    i,
                    i * 10
                )
            })
            .collect();
        let records = parse_records(&text);
        assert_eq!(records.len(), 7);
        for (i, rec) in records.iter().enumerate() {
            assert_eq!(rec.core_id, i.to_string());
            assert_eq!(rec.numa_id, (i % 2).to_string());
            assert_eq!(rec.iterations, Some(i as u64 * 10));
        }
    }

    #[test]
    fn custom_matcher_set_drives_the_scan() {
        let set = FieldMatcherSet::new(vec![
            FieldMatcher::new(FieldFamily::Upcalls, r"^\s*escalations=(\d+)", |c, r| {
                r.upcalls = crate::matchers::int(c, 1);
            })
            .unwrap(),
        ]);
        let builder = RecordBuilder::new(&set);
        let records =
            builder.parse("pmd thread numa_id 0 core_id 4:\n escalations=12\n  iterations: 5\n");
        assert_eq!(records[0].upcalls, Some(12));
        assert_eq!(records[0].iterations, None);
    }
}
