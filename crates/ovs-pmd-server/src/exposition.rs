//! Exposition Adapter: snapshot → Prometheus text format.
//!
//! [`MetricTable`] is built once at startup and passed to the server. Each
//! render creates a fresh [`Registry`] so the output reflects exactly one
//! published [`Snapshot`] and nothing lingers from a previous poll.

use prometheus::{CounterVec, Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};

use ovs_pmd_core::{Snapshot, WorkerThreadRecord};

/// Labels carried by every per-thread metric.
const PMD_LABELS: [&str; 3] = ["system_id", "pmd_id", "numa_id"];

/// One per-thread gauge: `<namespace>_pmd_<name>{system_id, pmd_id, numa_id}`.
#[derive(Clone, Copy)]
pub struct PmdMetric {
    pub name: &'static str,
    pub help: &'static str,
    pub value: fn(&WorkerThreadRecord) -> Option<f64>,
}

impl std::fmt::Debug for PmdMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PmdMetric")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

fn pmd(
    name: &'static str,
    help: &'static str,
    value: fn(&WorkerThreadRecord) -> Option<f64>,
) -> PmdMetric {
    PmdMetric { name, help, value }
}

/// One metric per [`WorkerThreadRecord`] counter.
pub fn standard_pmd_metrics() -> Vec<PmdMetric> {
    vec![
        pmd("cpu_utilization", "Busy share of used cycles (0-1).", |r| r.cpu_utilization),
        pmd("iterations", "Poll loop iterations.", |r| r.iterations.map(|v| v as f64)),
        pmd("sleep_iterations", "Iterations that ended in a sleep.", |r| {
            r.sleep_iterations.map(|v| v as f64)
        }),
        pmd("busy_iterations", "Iterations that processed packets.", |r| {
            r.busy_iterations.map(|v| v as f64)
        }),
        pmd("us_per_iteration", "Average microseconds per iteration.", |r| {
            r.us_per_iteration
        }),
        pmd("busy_cycles", "CPU cycles spent processing packets.", |r| {
            r.busy_cycles.map(|v| v as f64)
        }),
        pmd("idle_cycles", "CPU cycles spent polling without work.", |r| {
            r.idle_cycles.map(|v| v as f64)
        }),
        pmd("total_cycles", "Total used TSC cycles.", |r| r.total_cycles.map(|v| v as f64)),
        pmd("cycles_per_iteration", "Average cycles per iteration.", |r| {
            r.cycles_per_iteration
        }),
        pmd("cycles_per_packet", "Average processing cycles per packet.", |r| {
            r.cycles_per_packet
        }),
        pmd("packets_per_iteration", "Average packets per iteration.", |r| {
            r.packets_per_iteration
        }),
        pmd("packets_per_batch", "Average packets per receive batch.", |r| {
            r.packets_per_batch
        }),
        pmd("total_packets", "Packets processed.", |r| r.total_packets.map(|v| v as f64)),
        pmd("rx_batches", "Receive batches.", |r| r.rx_batches.map(|v| v as f64)),
        pmd("rx_packets", "Received packets.", |r| r.rx_packets.map(|v| v as f64)),
        pmd("avg_rx_batch_size", "Average receive batch size.", |r| r.avg_rx_batch_size),
        pmd("max_rx_batch_size", "Largest receive batch.", |r| {
            r.max_rx_batch_size.map(|v| v as f64)
        }),
        pmd("tx_batches", "Transmit batches.", |r| r.tx_batches.map(|v| v as f64)),
        pmd("tx_packets", "Transmitted packets.", |r| r.tx_packets.map(|v| v as f64)),
        pmd("avg_tx_batch_size", "Average transmit batch size.", |r| r.avg_tx_batch_size),
        pmd("max_vhost_queue_length", "Longest vhost queue seen.", |r| {
            r.max_vhost_queue_length.map(|v| v as f64)
        }),
        pmd("avg_vhost_queue_length", "Average vhost queue length.", |r| {
            r.avg_vhost_queue_length
        }),
        pmd("vhost_queue_full", "Iterations with a full vhost queue.", |r| {
            r.vhost_queue_full.map(|v| v as f64)
        }),
        pmd("vhost_tx_retries", "vhost transmit retries.", |r| {
            r.vhost_tx_retries.map(|v| v as f64)
        }),
        pmd("vhost_tx_contention", "vhost transmit lock contention.", |r| {
            r.vhost_tx_contention.map(|v| v as f64)
        }),
        pmd("vhost_tx_irqs", "vhost guest notifications.", |r| {
            r.vhost_tx_irqs.map(|v| v as f64)
        }),
        pmd("upcalls", "Upcalls to the slow path.", |r| r.upcalls.map(|v| v as f64)),
        pmd("upcall_cycles", "Cycles spent in upcalls.", |r| r.upcall_cycles.map(|v| v as f64)),
        pmd("avg_upcall_cycles", "Average cycles per upcall.", |r| r.avg_upcall_cycles),
        pmd("exact_match_hit", "Exact match cache hits.", |r| {
            r.exact_match_hit.map(|v| v as f64)
        }),
        pmd("masked_hit", "Megaflow classifier hits.", |r| r.masked_hit.map(|v| v as f64)),
        pmd("miss", "Lookups that missed every cache.", |r| r.miss.map(|v| v as f64)),
        pmd("lost", "Packets lost on failed upcalls.", |r| r.lost.map(|v| v as f64)),
        pmd("suspicious_iterations", "Iterations flagged as suspicious.", |r| {
            r.suspicious_iterations.map(|v| v as f64)
        }),
        pmd("suspicious_ratio", "Share of suspicious iterations (0-1).", |r| {
            r.suspicious_ratio
        }),
    ]
}

// ---------------------------------------------------------------------------
// Metric table
// ---------------------------------------------------------------------------

/// Explicit set of metric descriptors, constructed at startup.
#[derive(Debug, Clone)]
pub struct MetricTable {
    namespace: String,
    pmd: Vec<PmdMetric>,
}

impl MetricTable {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self::with_pmd_metrics(namespace, standard_pmd_metrics())
    }

    /// A table with a custom per-thread metric list.
    pub fn with_pmd_metrics(namespace: impl Into<String>, pmd: Vec<PmdMetric>) -> Self {
        Self {
            namespace: namespace.into(),
            pmd,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn pmd_metrics(&self) -> &[PmdMetric] {
        &self.pmd
    }

    /// Encode one snapshot in the Prometheus text exposition format.
    pub fn render(&self, snap: &Snapshot) -> Result<String, prometheus::Error> {
        let registry = Registry::new();
        let scope = Scope {
            registry: &registry,
            namespace: &self.namespace,
        };
        let sid = snap.system_id();

        render_status(&scope, snap, sid)?;
        render_database(&scope, snap, sid)?;
        self.render_pmd(&scope, snap, sid)?;

        let drops = scope.counter(
            "datapath_drops_total",
            "Packets dropped by the datapath, by reason.",
            &["system_id", "drop_reason"],
        )?;
        for (reason, count) in &snap.drops {
            drops
                .with_label_values(&[sid, reason.as_str()])
                .inc_by(*count as f64);
        }

        let mut buf = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    fn render_pmd(
        &self,
        scope: &Scope<'_>,
        snap: &Snapshot,
        sid: &str,
    ) -> Result<(), prometheus::Error> {
        let mut families = Vec::with_capacity(self.pmd.len());
        for m in &self.pmd {
            let name = format!("pmd_{}", m.name);
            families.push((m, scope.gauge(&name, m.help, &PMD_LABELS)?));
        }

        let tier_labels = ["system_id", "pmd_id", "numa_id", "tier"];
        let tier_hits = scope.gauge("pmd_cache_hits", "Flow cache hits by tier.", &tier_labels)?;
        let tier_inserts = scope.gauge(
            "pmd_cache_inserts",
            "Flow cache inserts by tier.",
            &tier_labels,
        )?;
        let tier_ratio = scope.gauge(
            "pmd_cache_hit_ratio",
            "Share of packets hitting each cache tier (0-1).",
            &tier_labels,
        )?;
        let buckets = scope.gauge(
            "pmd_histogram_bucket",
            "Occurrences per histogram bucket.",
            &["system_id", "pmd_id", "numa_id", "histogram", "bucket"],
        )?;

        for rec in &snap.pmd_threads {
            let ids = [sid, rec.core_id.as_str(), rec.numa_id.as_str()];
            for (m, family) in &families {
                let value = (m.value)(rec).unwrap_or(0.0);
                family.with_label_values(&ids).set(value);
            }

            // Only tiers the text actually mentioned.
            for (kind, tier) in &rec.cache_tiers {
                let labels = [ids[0], ids[1], ids[2], kind.as_str()];
                tier_hits
                    .with_label_values(&labels)
                    .set(tier.hits.unwrap_or(0) as f64);
                tier_inserts
                    .with_label_values(&labels)
                    .set(tier.inserts.unwrap_or(0) as f64);
                tier_ratio
                    .with_label_values(&labels)
                    .set(tier.hit_ratio.unwrap_or(0.0));
            }

            for (kind, histogram) in &rec.histograms {
                for (bucket, count) in histogram {
                    buckets
                        .with_label_values(&[ids[0], ids[1], ids[2], kind.as_str(), bucket])
                        .set(*count as f64);
                }
            }
        }
        Ok(())
    }
}

fn render_status(
    scope: &Scope<'_>,
    snap: &Snapshot,
    sid: &str,
) -> Result<(), prometheus::Error> {
    let up = Gauge::with_opts(
        Opts::new("up", "Is Open vSwitch up (1) or down (0).").namespace(scope.namespace),
    )?;
    scope.registry.register(Box::new(up.clone()))?;
    up.set(if snap.up { 1.0 } else { 0.0 });

    let failed = scope.counter(
        "failed_req_count",
        "Sub-collections that failed since startup.",
        &["system_id"],
    )?;
    failed
        .with_label_values(&[sid])
        .inc_by(snap.request_errors as f64);
    let reqs = scope.counter(
        "req_count",
        "Sub-collections attempted since startup.",
        &["system_id"],
    )?;
    reqs.with_label_values(&[sid])
        .inc_by(snap.requests_total as f64);

    let next = scope.gauge(
        "next_poll",
        "Unix time (seconds) of the earliest next rebuild.",
        &["system_id"],
    )?;
    next.with_label_values(&[sid])
        .set(snap.next_poll_unix_ms as f64 / 1000.0);

    if let Some(sys) = &snap.system {
        let info = scope.gauge(
            "info",
            "Open vSwitch system information.",
            &[
                "system_id",
                "hostname",
                "rundir",
                "ovs_version",
                "db_version",
                "system_type",
                "system_version",
            ],
        )?;
        info.with_label_values(&[
            sid,
            &sys.hostname,
            &sys.run_dir,
            sys.ovs_version.as_deref().unwrap_or(""),
            sys.db_version.as_deref().unwrap_or(""),
            sys.system_type.as_deref().unwrap_or(""),
            sys.system_version.as_deref().unwrap_or(""),
        ])
        .set(1.0);
    }

    let pid = scope.gauge(
        "pid",
        "Process id of a running Open vSwitch daemon.",
        &["system_id", "component", "user", "group"],
    )?;
    for p in &snap.processes {
        let uid = p.uid.map(|u| u.to_string()).unwrap_or_default();
        let gid = p.gid.map(|g| g.to_string()).unwrap_or_default();
        pid.with_label_values(&[sid, &p.component, &uid, &gid])
            .set(f64::from(p.pid));
    }
    Ok(())
}

fn render_database(scope: &Scope<'_>, snap: &Snapshot, sid: &str) -> Result<(), prometheus::Error> {
    let coverage = scope.counter(
        "coverage_total",
        "Coverage event counts since daemon start.",
        &["system_id", "component", "event"],
    )?;
    let coverage_avg = scope.gauge(
        "coverage_avg",
        "Coverage event rate per second over a trailing interval.",
        &["system_id", "component", "event", "interval"],
    )?;
    for c in &snap.coverage {
        coverage
            .with_label_values(&[sid, &c.component, &c.event])
            .inc_by(c.total as f64);
        for (interval, rate) in [("5s", c.avg_5s), ("1m", c.avg_1m), ("1h", c.avg_1h)] {
            coverage_avg
                .with_label_values(&[sid, &c.component, &c.event, interval])
                .set(rate);
        }
    }

    let memory = scope.gauge(
        "memory_usage",
        "Objects tracked by each daemon facility.",
        &["system_id", "component", "facility"],
    )?;
    for m in &snap.memory {
        memory
            .with_label_values(&[sid, &m.component, &m.facility])
            .set(m.value);
    }

    let if_labels = ["system_id", "uuid", "name"];
    let if_info = scope.gauge(
        "interface",
        "Interface description.",
        &["system_id", "uuid", "name", "type", "mac_in_use", "duplex"],
    )?;
    let admin = scope.gauge(
        "interface_admin_state",
        "Administrative state (1 up, 0 down).",
        &if_labels,
    )?;
    let link = scope.gauge(
        "interface_link_state",
        "Link state (1 up, 0 down).",
        &if_labels,
    )?;
    let mtu = scope.gauge("interface_mtu", "Interface MTU.", &if_labels)?;
    let ofport = scope.gauge("interface_of_port", "OpenFlow port number.", &if_labels)?;
    let ifindex = scope.gauge("interface_if_index", "Kernel interface index.", &if_labels)?;
    let speed = scope.gauge(
        "interface_link_speed",
        "Negotiated link speed in bits per second.",
        &if_labels,
    )?;
    let resets = scope.counter(
        "interface_link_resets",
        "Link state changes observed by the daemon.",
        &if_labels,
    )?;
    let stats = scope.counter(
        "interface_statistics_total",
        "Interface statistics counters.",
        &["system_id", "uuid", "name", "statistic"],
    )?;
    for i in &snap.interfaces {
        let ids = [sid, i.uuid.as_str(), i.name.as_str()];
        if_info
            .with_label_values(&[
                sid,
                &i.uuid,
                &i.name,
                &i.interface_type,
                i.mac_in_use.as_deref().unwrap_or(""),
                i.duplex.as_deref().unwrap_or(""),
            ])
            .set(1.0);
        admin.with_label_values(&ids).set(state_value(i.admin_state.as_deref()));
        link.with_label_values(&ids).set(state_value(i.link_state.as_deref()));
        set_opt(&mtu, &ids, i.mtu.map(|v| v as f64));
        set_opt(&ofport, &ids, i.ofport.map(|v| v as f64));
        set_opt(&ifindex, &ids, i.ifindex.map(|v| v as f64));
        set_opt(&speed, &ids, i.link_speed.map(|v| v as f64));
        if let Some(n) = i.link_resets {
            resets.with_label_values(&ids).inc_by(n as f64);
        }
        for (name, value) in &i.statistics {
            stats
                .with_label_values(&[sid, &i.uuid, &i.name, name])
                .inc_by(*value as f64);
        }
    }

    let dp_labels = ["system_id", "datapath"];
    let lookups = scope.counter(
        "dp_lookups_total",
        "Datapath flow table lookups by result.",
        &["system_id", "datapath", "result"],
    )?;
    let flows = scope.gauge("dp_flows", "Flows installed in the datapath.", &dp_labels)?;
    let masks_hit = scope.counter("dp_masks_hit", "Mask lookups that hit.", &dp_labels)?;
    let masks_total = scope.gauge("dp_masks_total", "Masks in the datapath.", &dp_labels)?;
    let masks_per_pkt = scope.gauge(
        "dp_masks_hit_ratio",
        "Average masks visited per packet.",
        &dp_labels,
    )?;
    for d in &snap.datapaths {
        let ids = [sid, d.name.as_str()];
        for (result, n) in [
            ("hit", d.lookups_hit),
            ("missed", d.lookups_missed),
            ("lost", d.lookups_lost),
        ] {
            lookups
                .with_label_values(&[sid, &d.name, result])
                .inc_by(n as f64);
        }
        flows.with_label_values(&ids).set(d.flows as f64);
        masks_hit.with_label_values(&ids).inc_by(d.masks_hit as f64);
        masks_total.with_label_values(&ids).set(d.masks_total as f64);
        masks_per_pkt
            .with_label_values(&ids)
            .set(d.masks_hit_per_packet);
    }
    Ok(())
}

fn state_value(state: Option<&str>) -> f64 {
    match state {
        Some(s) if s.eq_ignore_ascii_case("up") => 1.0,
        _ => 0.0,
    }
}

fn set_opt(family: &GaugeVec, labels: &[&str], value: Option<f64>) {
    if let Some(v) = value {
        family.with_label_values(labels).set(v);
    }
}

/// A registry plus the name prefix for every family registered in it.
struct Scope<'r> {
    registry: &'r Registry,
    namespace: &'r str,
}

impl Scope<'_> {
    fn gauge(
        &self,
        name: &str,
        help: &str,
        labels: &[&str],
    ) -> Result<GaugeVec, prometheus::Error> {
        let family = GaugeVec::new(Opts::new(name, help).namespace(self.namespace), labels)?;
        self.registry.register(Box::new(family.clone()))?;
        Ok(family)
    }

    fn counter(
        &self,
        name: &str,
        help: &str,
        labels: &[&str],
    ) -> Result<CounterVec, prometheus::Error> {
        let family = CounterVec::new(Opts::new(name, help).namespace(self.namespace), labels)?;
        self.registry.register(Box::new(family.clone()))?;
        Ok(family)
    }
}
