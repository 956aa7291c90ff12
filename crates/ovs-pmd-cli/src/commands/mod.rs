pub mod drops;
pub mod parse;
pub mod serve;
pub mod snapshot;

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use ovs_pmd_core::{
    Appctl, ExporterConfig, OvsCtlDatabase, PmdCollector, SnapshotCache, SystemCommandInvoker,
};

/// Load the config file if one was given, otherwise use the defaults.
/// Exits on an unreadable or invalid file.
pub fn load_config(path: Option<&Path>) -> ExporterConfig {
    let Some(path) = path else {
        return ExporterConfig::default();
    };
    match ExporterConfig::load(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

/// Wire the system command invoker, database accessor and PMD collector
/// into a snapshot cache.
pub fn build_cache(config: &ExporterConfig) -> SnapshotCache {
    let invoker = Arc::new(SystemCommandInvoker::new(config.command_timeout()));
    let db = Arc::new(OvsCtlDatabase::new(invoker.clone(), config));
    let pmd = PmdCollector::new(Appctl::new(invoker, config.appctl_path.clone()));
    SnapshotCache::new(db, pmd, config.poll_interval()).with_components(config.components.clone())
}

/// Read a whole file, or stdin for `-`. Exits on failure.
pub fn read_input(path: &Path) -> String {
    let result = if path == Path::new("-") {
        let mut text = String::new();
        std::io::stdin().read_to_string(&mut text).map(|_| text)
    } else {
        std::fs::read_to_string(path)
    };
    match result {
        Ok(text) => text,
        Err(e) => {
            eprintln!("Failed to read {}: {e}", path.display());
            std::process::exit(1);
        }
    }
}

/// Print a value as pretty JSON on stdout. Exits on failure.
pub fn print_json<T: serde::Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            eprintln!("Failed to encode JSON: {e}");
            std::process::exit(1);
        }
    }
}
