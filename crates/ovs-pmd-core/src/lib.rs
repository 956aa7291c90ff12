//! # ovs-pmd-core
//!
//! Turns Open vSwitch diagnostic text into typed, point-in-time snapshots of
//! per-PMD-thread performance, datapath drop counters and database state.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::SystemTime;
//!
//! use ovs_pmd_core::{
//!     Appctl, ExporterConfig, OvsCtlDatabase, PmdCollector, SnapshotCache,
//!     SystemCommandInvoker,
//! };
//!
//! let config = ExporterConfig::default();
//! let invoker = Arc::new(SystemCommandInvoker::new(config.command_timeout()));
//! let db = Arc::new(OvsCtlDatabase::new(invoker.clone(), &config));
//! let pmd = PmdCollector::new(Appctl::new(invoker, config.appctl_path.clone()));
//!
//! let cache = SnapshotCache::new(db, pmd, config.poll_interval());
//! cache.refresh(SystemTime::now());
//! for thread in &cache.snapshot().pmd_threads {
//!     println!("{} iterations={:?}", thread.identity(), thread.iterations);
//! }
//! ```
//!
//! ## Architecture
//!
//! Field Matcher Set → Record Builder → Multi-Source Merger → Snapshot Cache
//!
//! - [`FieldMatcherSet`] is an ordered table of line patterns, one per field
//!   family.
//! - [`RecordBuilder`] scans `pmd-perf-show` / `pmd-stats-show` text with an
//!   explicit two-state machine and produces [`WorkerThreadRecord`]s.
//! - [`PmdCollector`] merges the two commands (primary wins, the other only
//!   fills gaps) and reads the drop counters.
//! - [`SnapshotCache`] runs every sub-collection, then publishes the result
//!   with a single atomic swap.
//!
//! Parsing never fails; only failing to obtain text is an error.

pub mod builder;
pub mod command;
pub mod config;
pub mod database;
pub mod drops;
pub mod error;
pub mod matchers;
pub mod merge;
pub mod record;
pub mod snapshot;

pub use builder::{RecordBuilder, parse_records};
pub use command::{Appctl, CommandInvoker, DEFAULT_COMMAND_TIMEOUT, SystemCommandInvoker};
pub use config::{DEFAULT_PORT, ExporterConfig};
pub use database::{
    CoverageRecord, DatabaseAccessor, DatapathRecord, InterfaceRecord, MemoryRecord,
    OvsCtlDatabase, ProcessInfo, SystemInfo,
};
pub use drops::{DropCounterSet, DropReason, parse_drop_counters};
pub use error::{CollectError, CommandError};
pub use matchers::{FieldFamily, FieldMatcher, FieldMatcherSet};
pub use merge::{PmdCollector, dedupe_by_identity, merge_enrichment, merge_texts};
pub use record::{
    CacheTier, CacheTierKind, Histogram, HistogramKind, ThreadIdentity, WorkerThreadRecord,
};
pub use snapshot::{RefreshOutcome, Snapshot, SnapshotCache};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
