//! Multi-Source Merger: primary PMD records, best-effort enrichment, and
//! drop counters.
//!
//! Source precedence:
//!
//! 1. `dpif-netdev/pmd-perf-show` is the primary source. If the command is
//!    unavailable the PMD feature is treated as inactive and the result is
//!    empty, not an error.
//! 2. On any other primary failure, `dpif-netdev/pmd-stats-show` becomes the
//!    base source instead. If that fails too the result is empty.
//! 3. With a primary base, `pmd-stats-show` only fills fields the base never
//!    observed. Its failure is logged and swallowed.
//!
//! Derived fields are computed once, after the merge, so a value derived
//! from the primary alone never masks what the secondary observed.
//! 4. `coverage/show` feeds the drop counters; its failure is propagated.

use log::{debug, warn};

use crate::builder::RecordBuilder;
use crate::command::Appctl;
use crate::drops::{DropCounterSet, parse_drop_counters};
use crate::error::CollectError;
use crate::matchers::FieldMatcherSet;
use crate::record::WorkerThreadRecord;

pub const PMD_PERF_SHOW: &str = "dpif-netdev/pmd-perf-show";
pub const PMD_STATS_SHOW: &str = "dpif-netdev/pmd-stats-show";
pub const COVERAGE_SHOW: &str = "coverage/show";

/// Collects PMD thread records and drop counters through `ovs-appctl`.
#[derive(Clone)]
pub struct PmdCollector {
    appctl: Appctl,
    matchers: &'static FieldMatcherSet,
}

impl PmdCollector {
    pub fn new(appctl: Appctl) -> Self {
        Self::with_matchers(appctl, FieldMatcherSet::standard())
    }

    pub fn with_matchers(appctl: Appctl, matchers: &'static FieldMatcherSet) -> Self {
        Self { appctl, matchers }
    }

    pub fn appctl(&self) -> &Appctl {
        &self.appctl
    }

    /// Build the merged PMD record list for one poll.
    pub fn build_records(&self) -> Result<Vec<WorkerThreadRecord>, CollectError> {
        let builder = RecordBuilder::new(self.matchers);

        let (base_text, from_primary) = match self.appctl.call(PMD_PERF_SHOW, &[]) {
            Ok(text) => (text, true),
            Err(e) if e.is_unavailable() => {
                debug!("{PMD_PERF_SHOW} unavailable ({e}), PMD metrics inactive");
                return Ok(Vec::new());
            }
            Err(e) => {
                warn!("{PMD_PERF_SHOW} failed: {e}; falling back to {PMD_STATS_SHOW}");
                match self.appctl.call(PMD_STATS_SHOW, &[]) {
                    Ok(text) => (text, false),
                    Err(e) if e.is_unavailable() => {
                        debug!("{PMD_STATS_SHOW} unavailable ({e}), PMD metrics inactive");
                        return Ok(Vec::new());
                    }
                    Err(e) => {
                        warn!("{PMD_STATS_SHOW} fallback failed: {e}; no PMD metrics this poll");
                        return Ok(Vec::new());
                    }
                }
            }
        };

        let mut records = dedupe_by_identity(builder.parse_observed(&base_text));
        debug!(
            "parsed {} PMD thread records from {}",
            records.len(),
            if from_primary { PMD_PERF_SHOW } else { PMD_STATS_SHOW }
        );

        if from_primary && !records.is_empty() {
            match self.appctl.call(PMD_STATS_SHOW, &[]) {
                Ok(text) => {
                    let extra = builder.parse_observed(&text);
                    let enriched = merge_enrichment(&mut records, &extra);
                    debug!("enriched {enriched} PMD thread records from {PMD_STATS_SHOW}");
                }
                Err(e) => warn!("PMD enrichment from {PMD_STATS_SHOW} skipped: {e}"),
            }
        }

        records.iter_mut().for_each(WorkerThreadRecord::finalize);
        Ok(records)
    }

    /// Read the drop counters from `coverage/show`.
    pub fn drop_counters(&self) -> Result<DropCounterSet, CollectError> {
        let text = self.appctl.call(COVERAGE_SHOW, &[])?;
        Ok(parse_drop_counters(&text))
    }
}

/// Fill gaps in `base` from `extra`, matching records by thread identity.
///
/// Both sides should come from [`RecordBuilder::parse_observed`]; finalize
/// the base afterwards. Fields already set in a base record are kept. Extra
/// records with no base counterpart are dropped. Returns how many base
/// records were touched.
pub fn merge_enrichment(base: &mut [WorkerThreadRecord], extra: &[WorkerThreadRecord]) -> usize {
    let mut touched = 0;
    for rec in base.iter_mut() {
        let matches: Vec<&WorkerThreadRecord> =
            extra.iter().filter(|o| o.is_same_thread(rec)).collect();
        for other in &matches {
            rec.fill_missing(other);
        }
        if !matches.is_empty() {
            touched += 1;
        }
    }
    touched
}

/// Parse a primary text and an optional secondary one into a single,
/// finalized record list: duplicates collapsed, gaps filled, then derived
/// fields computed.
pub fn merge_texts(
    builder: &RecordBuilder<'_>,
    primary: &str,
    secondary: Option<&str>,
) -> Vec<WorkerThreadRecord> {
    let mut records = dedupe_by_identity(builder.parse_observed(primary));
    if let Some(text) = secondary {
        let touched = merge_enrichment(&mut records, &builder.parse_observed(text));
        debug!("enriched {touched} of {} records", records.len());
    }
    records.iter_mut().for_each(WorkerThreadRecord::finalize);
    records
}

/// Collapse records sharing an identity. The first occurrence wins; later
/// ones only fill its gaps.
pub fn dedupe_by_identity(records: Vec<WorkerThreadRecord>) -> Vec<WorkerThreadRecord> {
    let mut out: Vec<WorkerThreadRecord> = Vec::with_capacity(records.len());
    for rec in records {
        match out.iter_mut().find(|r| r.is_same_thread(&rec)) {
            Some(first) => first.fill_missing(&rec),
            None => out.push(rec),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::command::fake::{FakeInvoker, Reply};
    use crate::drops::DropReason;

    const PERF: &str = "\
pmd thread numa_id 0 core_id 1:
  Iterations: 1000 (2.0 us/it)
  - Rx packets: 500
pmd thread numa_id 0 core_id 2:
  Iterations: 2000 (1.5 us/it)
";

    const STATS: &str = "\
pmd thread numa_id 0 core_id 1:
  packets received: 999
  emc hits: 300
  megaflow hits: 100
  miss with success upcall: 4
  idle cycles: 900 (90.00%)
  processing cycles: 100 (10.00%)
pmd thread numa_id 1 core_id 7:
  packets received: 42
main thread:
  packets received: 0
";

    fn collector(fake: &Arc<FakeInvoker>) -> PmdCollector {
        PmdCollector::new(Appctl::new(fake.clone(), "ovs-appctl"))
    }

    #[test]
    fn unavailable_primary_is_feature_absent() {
        let fake = Arc::new(FakeInvoker::new().with(PMD_PERF_SHOW, Reply::Unavailable));
        let records = collector(&fake).build_records().unwrap();
        assert!(records.is_empty());
        assert_eq!(fake.calls(), vec![PMD_PERF_SHOW.to_string()]);
    }

    #[test]
    fn enrichment_fills_only_missing_fields() {
        let fake = Arc::new(
            FakeInvoker::new()
                .text(PMD_PERF_SHOW, PERF)
                .text(PMD_STATS_SHOW, STATS),
        );
        let records = collector(&fake).build_records().unwrap();
        assert_eq!(records.len(), 2);

        let first = &records[0];
        // perf-show value kept
        assert_eq!(first.rx_packets, Some(500));
        assert_eq!(first.iterations, Some(1000));
        // stats-show fills the gaps
        assert_eq!(first.idle_cycles, Some(900));
        assert_eq!(first.busy_cycles, Some(100));
        assert_eq!(first.total_cycles, Some(1000));
        assert_eq!(first.cpu_utilization, Some(0.1));
        let emc = first.cache_tier(crate::record::CacheTierKind::Exact).unwrap();
        assert_eq!(emc.hits, Some(300));

        // no base for numa 1 core 7: not added
        assert!(records.iter().all(|r| r.core_id != "7"));
        assert_eq!(records[1].idle_cycles, None);
    }

    #[test]
    fn enrichment_failure_is_swallowed() {
        let fake = Arc::new(
            FakeInvoker::new()
                .text(PMD_PERF_SHOW, PERF)
                .with(PMD_STATS_SHOW, Reply::Spawn),
        );
        let records = collector(&fake).build_records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].idle_cycles, None);
    }

    #[test]
    fn empty_base_skips_enrichment() {
        let fake = Arc::new(FakeInvoker::new().text(PMD_PERF_SHOW, "no PMD threads\n"));
        let records = collector(&fake).build_records().unwrap();
        assert!(records.is_empty());
        assert_eq!(fake.call_count(), 1);
    }

    #[test]
    fn transport_failure_falls_back_to_stats() {
        let fake = Arc::new(
            FakeInvoker::new()
                .with(PMD_PERF_SHOW, Reply::Spawn)
                .text(PMD_STATS_SHOW, STATS),
        );
        let records = collector(&fake).build_records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].rx_packets, Some(999));
        assert_eq!(records[1].identity().to_string(), "numa 1 core 7");
        // no second enrichment round against the same source
        assert_eq!(fake.call_count(), 2);
    }

    #[test]
    fn both_sources_failing_yields_no_records() {
        let fake = Arc::new(
            FakeInvoker::new()
                .with(PMD_PERF_SHOW, Reply::Spawn)
                .with(PMD_STATS_SHOW, Reply::Spawn),
        );
        let records = collector(&fake).build_records().unwrap();
        assert!(records.is_empty());
        assert_eq!(fake.call_count(), 2);
    }

    #[test]
    fn derived_total_waits_for_enrichment() {
        let fake = Arc::new(
            FakeInvoker::new()
                .text(
                    PMD_PERF_SHOW,
                    "pmd thread numa_id 0 core_id 1:\n  - busy cycles: 10.0% (1.0 Mcycles)\n",
                )
                .text(
                    PMD_STATS_SHOW,
                    "pmd thread numa_id 0 core_id 1:\n  idle cycles: 9000000 (90.00%)\n",
                ),
        );
        let records = collector(&fake).build_records().unwrap();
        assert_eq!(records[0].busy_cycles, Some(1_000_000));
        assert_eq!(records[0].idle_cycles, Some(9_000_000));
        assert_eq!(records[0].total_cycles, Some(10_000_000));
    }

    #[test]
    fn merge_texts_dedupes_and_finalizes_once() {
        let primary = "\
pmd thread numa_id 0 core_id 3:
  iterations: 10
pmd thread numa_id 0 core_id 3:
  iterations: 20
  - sleep iterations: 4 (40.0 %)
";
        let secondary = "pmd thread numa_id 0 core_id 3:\n  iterations: 99\n  upcalls: 7\n";
        let records = merge_texts(&RecordBuilder::default(), primary, Some(secondary));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].iterations, Some(10));
        assert_eq!(records[0].upcalls, Some(7));
        assert_eq!(records[0].busy_iterations, Some(6));
    }

    #[test]
    fn fallback_unavailable_is_feature_absent() {
        let fake = Arc::new(FakeInvoker::new().with(PMD_PERF_SHOW, Reply::Spawn));
        let records = collector(&fake).build_records().unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn duplicate_identities_collapse_first_wins() {
        let perf = "\
pmd thread numa_id 0 core_id 1:
  iterations: 10
pmd thread numa_id 0 core_id 1:
  iterations: 20
  upcalls: 3
";
        let fake = Arc::new(FakeInvoker::new().text(PMD_PERF_SHOW, perf));
        let records = collector(&fake).build_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].iterations, Some(10));
        assert_eq!(records[0].upcalls, Some(3));
    }

    #[test]
    fn merge_enrichment_counts_touched_records() {
        let mut base = vec![WorkerThreadRecord::new("0", "1"), WorkerThreadRecord::new("0", "2")];
        base[0].miss = Some(0);
        let mut extra = WorkerThreadRecord::new("0", "1");
        extra.miss = Some(50);
        extra.lost = Some(2);
        assert_eq!(merge_enrichment(&mut base, &[extra]), 1);
        assert_eq!(base[0].miss, Some(0));
        assert_eq!(base[0].lost, Some(2));
        assert_eq!(base[1], WorkerThreadRecord::new("0", "2"));
    }

    #[test]
    fn drop_counters_parse_and_propagate() {
        let fake = Arc::new(FakeInvoker::new().text(
            COVERAGE_SHOW,
            "datapath_drop_meter   0.0/sec 0.000/sec 0.0000/sec   total: 42\nother_counter 7\n",
        ));
        let drops = collector(&fake).drop_counters().unwrap();
        assert_eq!(drops.len(), 1);
        assert_eq!(drops[&DropReason::DatapathDropMeter], 42);

        let failing = Arc::new(FakeInvoker::new());
        assert!(collector(&failing).drop_counters().is_err());
    }
}
