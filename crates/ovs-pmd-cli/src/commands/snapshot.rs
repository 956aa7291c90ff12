//! `ovs-pmd-exporter snapshot`: one rebuild, printed as JSON.

use std::time::SystemTime;

use ovs_pmd_core::{ExporterConfig, RefreshOutcome};

pub fn run(config: &ExporterConfig) {
    let cache = super::build_cache(config);
    if let RefreshOutcome::Rebuilt { failures } = cache.refresh(SystemTime::now()) {
        if failures > 0 {
            log::warn!("{failures} sub-collections failed; snapshot is partial");
        }
    }
    super::print_json(&*cache.snapshot());
}
