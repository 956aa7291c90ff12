//! CLI for ovs-pmd-exporter: Open vSwitch PMD telemetry for Prometheus.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "ovs-pmd-exporter")]
#[command(about = "Export Open vSwitch PMD thread telemetry in the Prometheus format")]
#[command(version = ovs_pmd_core::VERSION)]
struct Cli {
    /// TOML config file (every key optional)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. "info" or "ovs_pmd_core=debug" (default: $RUST_LOG, then info)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve /metrics, /snapshot and /health over HTTP
    Serve {
        /// Bind address (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port (overrides config)
        #[arg(long)]
        port: Option<u16>,

        /// Minimum seconds between snapshot rebuilds (overrides config)
        #[arg(long)]
        poll_interval: Option<u64>,
    },

    /// Collect one snapshot and print it as JSON
    Snapshot,

    /// Parse captured pmd-perf-show / pmd-stats-show output ("-" reads stdin)
    Parse {
        /// Primary diagnostic text
        file: PathBuf,

        /// Secondary text whose values only fill fields the primary lacks
        #[arg(long)]
        enrich: Option<PathBuf>,
    },

    /// Extract datapath drop counters from captured coverage/show output
    Drops {
        /// Captured text ("-" reads stdin)
        file: PathBuf,
    },
}

fn init_logging(level: Option<&str>) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(level) = level {
        builder.parse_filters(level);
    }
    builder.init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    match cli.command {
        Commands::Serve {
            host,
            port,
            poll_interval,
        } => {
            let mut config = commands::load_config(cli.config.as_deref());
            commands::serve::apply_overrides(&mut config, host, port, poll_interval);
            commands::serve::run(config);
        }
        Commands::Snapshot => {
            let config = commands::load_config(cli.config.as_deref());
            commands::snapshot::run(&config);
        }
        Commands::Parse { file, enrich } => commands::parse::run(&file, enrich.as_deref()),
        Commands::Drops { file } => commands::drops::run(&file),
    }
}
