//! `ovs-pmd-exporter parse`: offline record building from captured text.

use std::path::Path;

use ovs_pmd_core::{RecordBuilder, WorkerThreadRecord, merge_texts};

pub fn run(file: &Path, enrich: Option<&Path>) {
    let records = build(&super::read_input(file), enrich.map(super::read_input).as_deref());
    if records.is_empty() {
        log::info!("no pmd thread sections found in {}", file.display());
    }
    super::print_json(&records);
}

/// Parse the primary text, then let the secondary fill its gaps.
fn build(primary: &str, secondary: Option<&str>) -> Vec<WorkerThreadRecord> {
    merge_texts(&RecordBuilder::default(), primary, secondary)
}
