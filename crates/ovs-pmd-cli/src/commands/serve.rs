//! `ovs-pmd-exporter serve`: run the HTTP exporter.

use std::sync::Arc;

use ovs_pmd_core::ExporterConfig;
use ovs_pmd_server::MetricTable;

/// Apply CLI flags on top of the loaded config. Exits if the result is invalid.
pub fn apply_overrides(
    config: &mut ExporterConfig,
    host: Option<String>,
    port: Option<u16>,
    poll_interval: Option<u64>,
) {
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(secs) = poll_interval {
        config.poll_interval_secs = secs;
    }
    if let Err(e) = config.validate() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

pub fn run(config: ExporterConfig) {
    let cache = Arc::new(super::build_cache(&config));
    let table = MetricTable::new(config.namespace.clone());
    let base = format!("http://{}:{}", config.host, config.port);

    println!("ovs-pmd-exporter v{}", ovs_pmd_core::VERSION);
    println!("   {base}");
    println!(
        "   polling every {}s, tracking {}",
        config.poll_interval_secs,
        config.components.join(", ")
    );
    println!();
    println!("   Endpoints:");
    println!("     GET /          API index");
    println!("     GET /metrics   Prometheus exposition (metric prefix: {}_)", config.namespace);
    println!("     GET /snapshot  Last published snapshot as JSON");
    println!("     GET /health    Overall up/down status");
    println!();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start async runtime: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = rt.block_on(ovs_pmd_server::run_server(
        cache,
        table,
        &config.host,
        config.port,
    )) {
        eprintln!("Server error on {base}: {e}");
        std::process::exit(1);
    }
}
