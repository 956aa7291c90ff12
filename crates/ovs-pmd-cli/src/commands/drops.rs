//! `ovs-pmd-exporter drops`: drop counters from captured `coverage/show`.

use std::path::Path;

use ovs_pmd_core::parse_drop_counters;

pub fn run(file: &Path) {
    let counters = parse_drop_counters(&super::read_input(file));
    super::print_json(&counters);
}
