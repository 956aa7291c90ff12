//! Snapshot Cache: rate-limited rebuilds published by atomic swap.
//!
//! Readers call [`SnapshotCache::snapshot`] and get the last fully built
//! [`Snapshot`] without ever blocking. Scrapes call
//! [`SnapshotCache::refresh`], which rebuilds at most once per poll
//! interval. A rebuild already in flight makes concurrent callers return
//! immediately; the rebuild itself runs to completion.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use log::{debug, error};
use serde::Serialize;

use crate::database::{
    CoverageRecord, DatabaseAccessor, DatapathRecord, InterfaceRecord, MemoryRecord, ProcessInfo,
    SystemInfo,
};
use crate::drops::DropCounterSet;
use crate::error::CollectError;
use crate::merge::PmdCollector;
use crate::record::WorkerThreadRecord;

/// Immutable result of one poll cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    pub collected_unix_ms: u64,
    /// False when system info or any tracked daemon could not be read.
    pub up: bool,
    pub system: Option<SystemInfo>,
    pub processes: Vec<ProcessInfo>,
    pub interfaces: Vec<InterfaceRecord>,
    pub datapaths: Vec<DatapathRecord>,
    pub coverage: Vec<CoverageRecord>,
    pub memory: Vec<MemoryRecord>,
    pub pmd_threads: Vec<WorkerThreadRecord>,
    pub drops: DropCounterSet,
    /// Cumulative failed sub-collections since startup.
    pub request_errors: u64,
    /// Cumulative sub-collections attempted since startup.
    pub requests_total: u64,
    pub next_poll_unix_ms: u64,
}

impl Snapshot {
    /// The placeholder published before the first rebuild.
    pub fn empty() -> Self {
        Self::default()
    }

    /// System id for metric labels; empty until system info has been read.
    pub fn system_id(&self) -> &str {
        self.system
            .as_ref()
            .map(|s| s.system_id.as_str())
            .unwrap_or("")
    }
}

/// What a call to [`SnapshotCache::refresh`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The poll interval has not elapsed since the last rebuild.
    NotDue,
    /// Another caller is rebuilding right now.
    InFlight,
    /// A new snapshot was published; `failures` sub-collections failed.
    Rebuilt { failures: usize },
}

pub struct SnapshotCache {
    db: Arc<dyn DatabaseAccessor>,
    pmd: PmdCollector,
    components: Vec<String>,
    poll_interval: Duration,
    published: ArcSwap<Snapshot>,
    next_allowed_ms: AtomicU64,
    rebuild_lock: Mutex<()>,
    requests: AtomicU64,
    errors: AtomicU64,
}

impl SnapshotCache {
    pub fn new(db: Arc<dyn DatabaseAccessor>, pmd: PmdCollector, poll_interval: Duration) -> Self {
        Self {
            db,
            pmd,
            components: vec!["ovsdb-server".to_string(), "ovs-vswitchd".to_string()],
            poll_interval,
            published: ArcSwap::from_pointee(Snapshot::empty()),
            next_allowed_ms: AtomicU64::new(0),
            rebuild_lock: Mutex::new(()),
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Daemons queried for process, coverage and memory data.
    pub fn with_components(mut self, components: Vec<String>) -> Self {
        self.components = components;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// The last published snapshot. Never blocks.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.published.load_full()
    }

    /// Rebuild and publish a new snapshot if the poll interval has elapsed.
    pub fn refresh(&self, now: SystemTime) -> RefreshOutcome {
        let now_ms = unix_ms(now);
        if now_ms < self.next_allowed_ms.load(Ordering::Acquire) {
            return RefreshOutcome::NotDue;
        }

        let _guard = match self.rebuild_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                debug!("snapshot rebuild already in flight");
                return RefreshOutcome::InFlight;
            }
            // The guarded data is `()`, nothing to repair.
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        // A rebuild may have finished between the check above and the lock.
        if now_ms < self.next_allowed_ms.load(Ordering::Acquire) {
            return RefreshOutcome::NotDue;
        }

        let next_ms = now_ms.saturating_add(self.poll_interval.as_millis() as u64);
        let (snapshot, failures) = self.collect(now_ms, next_ms);
        self.published.store(Arc::new(snapshot));
        self.next_allowed_ms.store(next_ms, Ordering::Release);

        debug!("published snapshot ({failures} failed sub-collections)");
        RefreshOutcome::Rebuilt { failures }
    }

    /// Count one sub-collection request and, on failure, one error.
    fn track<T>(
        &self,
        what: &str,
        failures: &mut usize,
        result: Result<T, CollectError>,
    ) -> Option<T> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                *failures += 1;
                error!("{what} failed: {e}");
                None
            }
        }
    }

    fn collect(&self, now_ms: u64, next_ms: u64) -> (Snapshot, usize) {
        let mut failures = 0;

        let system = self.track("system info", &mut failures, self.db.system_info());
        let mut up = system.is_some();

        let mut processes = Vec::new();
        let mut coverage = Vec::new();
        let mut memory = Vec::new();
        for component in &self.components {
            let what = format!("process info for {component}");
            match self.track(&what, &mut failures, self.db.process_info(component)) {
                Some(p) => processes.push(p),
                None => up = false,
            }
            let what = format!("coverage for {component}");
            if let Some(c) = self.track(&what, &mut failures, self.db.coverage(component)) {
                coverage.extend(c);
            }
            let what = format!("memory for {component}");
            if let Some(m) = self.track(&what, &mut failures, self.db.memory(component)) {
                memory.extend(m);
            }
        }

        let interfaces = self
            .track("interfaces", &mut failures, self.db.interfaces())
            .unwrap_or_default();
        let datapaths = self
            .track("datapaths", &mut failures, self.db.datapaths())
            .unwrap_or_default();

        // Enrichment needs the base records, so PMD records come before
        // the drop counters.
        let pmd_threads = self
            .track("PMD records", &mut failures, self.pmd.build_records())
            .unwrap_or_default();
        let drops = self
            .track("drop counters", &mut failures, self.pmd.drop_counters())
            .unwrap_or_default();

        let snapshot = Snapshot {
            collected_unix_ms: now_ms,
            up,
            system,
            processes,
            interfaces,
            datapaths,
            coverage,
            memory,
            pmd_threads,
            drops,
            request_errors: self.errors.load(Ordering::Relaxed),
            requests_total: self.requests.load(Ordering::Relaxed),
            next_poll_unix_ms: next_ms,
        };
        (snapshot, failures)
    }
}

pub fn unix_ms(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
