//! Typed access to Open vSwitch database and daemon state.
//!
//! [`DatabaseAccessor`] is the seam the snapshot cache depends on. The
//! default [`OvsCtlDatabase`] answers each query with `ovs-vsctl` /
//! `ovs-appctl` plus a few files under the OVS run directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::command::{Appctl, CommandInvoker};
use crate::config::ExporterConfig;
use crate::error::{CollectError, CommandError};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemInfo {
    pub system_id: String,
    pub hostname: String,
    pub run_dir: String,
    pub ovs_version: Option<String>,
    pub db_version: Option<String>,
    pub system_type: Option<String>,
    pub system_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessInfo {
    pub component: String,
    pub pid: u32,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InterfaceRecord {
    pub uuid: String,
    pub name: String,
    pub interface_type: String,
    pub admin_state: Option<String>,
    pub link_state: Option<String>,
    pub mtu: Option<u64>,
    /// `-1` when OVS failed to assign a port number.
    pub ofport: Option<i64>,
    pub ifindex: Option<u64>,
    pub link_speed: Option<u64>,
    pub link_resets: Option<u64>,
    pub duplex: Option<String>,
    pub mac_in_use: Option<String>,
    pub statistics: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DatapathRecord {
    pub name: String,
    pub lookups_hit: u64,
    pub lookups_missed: u64,
    pub lookups_lost: u64,
    pub flows: u64,
    pub masks_hit: u64,
    pub masks_total: u64,
    pub masks_hit_per_packet: f64,
}

/// One `coverage/show` event for a daemon.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageRecord {
    pub component: String,
    pub event: String,
    /// Per-second averages over the last 5 s, minute and hour.
    pub avg_5s: f64,
    pub avg_1m: f64,
    pub avg_1h: f64,
    pub total: u64,
}

/// One `memory/show` facility for a daemon.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryRecord {
    pub component: String,
    pub facility: String,
    pub value: f64,
}

/// Source of the non-PMD parts of a snapshot.
pub trait DatabaseAccessor: Send + Sync {
    fn system_info(&self) -> Result<SystemInfo, CollectError>;
    fn process_info(&self, component: &str) -> Result<ProcessInfo, CollectError>;
    fn interfaces(&self) -> Result<Vec<InterfaceRecord>, CollectError>;
    fn datapaths(&self) -> Result<Vec<DatapathRecord>, CollectError>;
    fn coverage(&self, component: &str) -> Result<Vec<CoverageRecord>, CollectError>;
    fn memory(&self, component: &str) -> Result<Vec<MemoryRecord>, CollectError>;
}

// ---------------------------------------------------------------------------
// ovs-vsctl / ovs-appctl implementation
// ---------------------------------------------------------------------------

const INTERFACE_COLUMNS: &str = "--columns=_uuid,name,type,admin_state,link_state,mtu,ofport,ifindex,link_speed,link_resets,duplex,mac_in_use,statistics";

pub struct OvsCtlDatabase {
    invoker: Arc<dyn CommandInvoker>,
    appctl: Appctl,
    vsctl_path: String,
    run_dir: PathBuf,
    system_id_file: PathBuf,
}

impl OvsCtlDatabase {
    pub fn new(invoker: Arc<dyn CommandInvoker>, config: &ExporterConfig) -> Self {
        Self {
            appctl: Appctl::new(invoker.clone(), config.appctl_path.clone()),
            invoker,
            vsctl_path: config.vsctl_path.clone(),
            run_dir: config.run_dir.clone(),
            system_id_file: config.system_id_file.clone(),
        }
    }

    fn vsctl(&self, args: &[&str]) -> Result<String, CommandError> {
        self.invoker.run(&self.vsctl_path, args)
    }

    /// `ovs-vsctl get Open_vSwitch . <column>`, unquoted. Empty values are
    /// `None`.
    fn vsctl_get(&self, column: &str) -> Result<Option<String>, CommandError> {
        let raw = self.vsctl(&["get", "Open_vSwitch", ".", column])?;
        let value = raw.trim().trim_matches('"').trim();
        Ok((!value.is_empty() && value != "[]").then(|| value.to_string()))
    }

    fn system_id(&self) -> Result<String, CollectError> {
        match self.vsctl_get("external-ids:system-id") {
            Ok(Some(id)) => return Ok(id),
            Ok(None) => debug!("system-id is empty in the database, trying file"),
            Err(e) => debug!("system-id lookup failed ({e}), trying file"),
        }
        read_system_id_file(&self.system_id_file)
    }
}

impl DatabaseAccessor for OvsCtlDatabase {
    fn system_info(&self) -> Result<SystemInfo, CollectError> {
        let system_id = self.system_id()?;
        let optional = |column: &str| self.vsctl_get(column).ok().flatten();
        Ok(SystemInfo {
            system_id,
            hostname: hostname(),
            run_dir: self.run_dir.display().to_string(),
            ovs_version: optional("ovs_version"),
            db_version: optional("db_version"),
            system_type: optional("system_type"),
            system_version: optional("system_version"),
        })
    }

    fn process_info(&self, component: &str) -> Result<ProcessInfo, CollectError> {
        let pid_file = self.run_dir.join(format!("{component}.pid"));
        let pid = read_pid_file(&pid_file)?;
        if !process_alive(pid) {
            return Err(CollectError::database(
                "process",
                format!("{component} (pid {pid}) is not running"),
            ));
        }
        let (uid, gid) = process_owner(pid);
        Ok(ProcessInfo {
            component: component.to_string(),
            pid,
            uid,
            gid,
        })
    }

    fn interfaces(&self) -> Result<Vec<InterfaceRecord>, CollectError> {
        let text = self.vsctl(&["--format=json", INTERFACE_COLUMNS, "list", "Interface"])?;
        parse_interface_table(&text)
    }

    fn datapaths(&self) -> Result<Vec<DatapathRecord>, CollectError> {
        let text = self.appctl.call("dpif/show", &[])?;
        Ok(parse_dpif_show(&text))
    }

    fn coverage(&self, component: &str) -> Result<Vec<CoverageRecord>, CollectError> {
        let text = self.appctl.call_target(component, "coverage/show")?;
        Ok(parse_coverage_show(component, &text))
    }

    fn memory(&self, component: &str) -> Result<Vec<MemoryRecord>, CollectError> {
        let text = self.appctl.call_target(component, "memory/show")?;
        Ok(parse_memory_show(component, &text))
    }
}

// ---------------------------------------------------------------------------
// Files and processes
// ---------------------------------------------------------------------------

/// First non-empty line of the system-id file.
pub fn read_system_id_file(path: &Path) -> Result<String, CollectError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        CollectError::database("system-id", format!("failed to read {}: {e}", path.display()))
    })?;
    content
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            CollectError::database("system-id", format!("{} is empty", path.display()))
        })
}

pub fn read_pid_file(path: &Path) -> Result<u32, CollectError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        CollectError::database("process", format!("failed to read {}: {e}", path.display()))
    })?;
    content.trim().parse::<u32>().map_err(|e| {
        CollectError::database("process", format!("bad pid in {}: {e}", path.display()))
    })
}

/// Signal 0 check: true if the process exists, even when owned by another
/// user.
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs existence and permission checks only.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(unix)]
fn process_owner(pid: u32) -> (Option<u32>, Option<u32>) {
    use std::os::unix::fs::MetadataExt;

    match std::fs::metadata(format!("/proc/{pid}")) {
        Ok(meta) => (Some(meta.uid()), Some(meta.gid())),
        Err(_) => (None, None),
    }
}

#[cfg(not(unix))]
fn process_owner(_pid: u32) -> (Option<u32>, Option<u32>) {
    (None, None)
}

fn read_trimmed(path: &str) -> Option<String> {
    let raw = std::fs::read_to_string(path).ok()?;
    let v = raw.trim();
    if v.is_empty() { None } else { Some(v.to_string()) }
}

fn hostname() -> String {
    read_trimmed("/proc/sys/kernel/hostname")
        .or_else(|| read_trimmed("/etc/hostname"))
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "unknown".to_string())
}

// ---------------------------------------------------------------------------
// OVSDB JSON table decoding
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct OvsdbTable {
    headings: Vec<String>,
    data: Vec<Vec<Value>>,
}

/// Unwrap OVSDB's `["set", [...]]` encoding of optional columns.
fn ovsdb_atom(value: &Value) -> Option<&Value> {
    match value.as_array().map(Vec::as_slice) {
        Some([tag, Value::Array(items)]) if tag.as_str() == Some("set") => match items.as_slice() {
            [single] => Some(single),
            _ => None,
        },
        _ => Some(value),
    }
}

fn ovsdb_string(value: &Value) -> Option<String> {
    ovsdb_atom(value)?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn ovsdb_u64(value: &Value) -> Option<u64> {
    ovsdb_atom(value)?.as_u64()
}

fn ovsdb_i64(value: &Value) -> Option<i64> {
    ovsdb_atom(value)?.as_i64()
}

fn ovsdb_uuid(value: &Value) -> Option<String> {
    match value.as_array().map(Vec::as_slice) {
        Some([tag, Value::String(id)]) if tag.as_str() == Some("uuid") => Some(id.clone()),
        _ => None,
    }
}

fn ovsdb_map(value: &Value) -> impl Iterator<Item = (&str, &Value)> {
    let pairs = match value.as_array().map(Vec::as_slice) {
        Some([tag, Value::Array(pairs)]) if tag.as_str() == Some("map") => pairs.as_slice(),
        _ => &[],
    };
    pairs.iter().filter_map(|pair| match pair.as_array().map(Vec::as_slice) {
        Some([Value::String(k), v]) => Some((k.as_str(), v)),
        _ => None,
    })
}

/// Decode `ovs-vsctl --format=json list Interface` output.
pub fn parse_interface_table(text: &str) -> Result<Vec<InterfaceRecord>, CollectError> {
    let table: OvsdbTable = serde_json::from_str(text)
        .map_err(|e| CollectError::parse("Interface table", e.to_string()))?;

    let mut out = Vec::with_capacity(table.data.len());
    for row in &table.data {
        let mut rec = InterfaceRecord::default();
        for (heading, value) in table.headings.iter().zip(row) {
            match heading.as_str() {
                "_uuid" => rec.uuid = ovsdb_uuid(value).unwrap_or_default(),
                "name" => rec.name = ovsdb_string(value).unwrap_or_default(),
                "type" => rec.interface_type = ovsdb_string(value).unwrap_or_default(),
                "admin_state" => rec.admin_state = ovsdb_string(value),
                "link_state" => rec.link_state = ovsdb_string(value),
                "mtu" => rec.mtu = ovsdb_u64(value),
                "ofport" => rec.ofport = ovsdb_i64(value),
                "ifindex" => rec.ifindex = ovsdb_u64(value),
                "link_speed" => rec.link_speed = ovsdb_u64(value),
                "link_resets" => rec.link_resets = ovsdb_u64(value),
                "duplex" => rec.duplex = ovsdb_string(value),
                "mac_in_use" => rec.mac_in_use = ovsdb_string(value),
                "statistics" => {
                    rec.statistics = ovsdb_map(value)
                        .filter_map(|(k, v)| v.as_u64().map(|n| (k.to_string(), n)))
                        .collect();
                }
                _ => {}
            }
        }
        if rec.name.is_empty() {
            debug!("skipping Interface row without a name");
            continue;
        }
        out.push(rec);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// ovs-appctl text decoding
// ---------------------------------------------------------------------------

static DATAPATH_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\S+@\S+?):(.*)$").expect("datapath header pattern is valid")
});

static KEY_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([a-z/]+):\s*(\d+(?:\.\d+)?)").expect("key value pattern is valid")
});

static FLOWS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*flows:\s*(\d+)").expect("flows pattern is valid"));

static COVERAGE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\S+)\s+([\d.]+)/sec\s+([\d.]+)/sec\s+([\d.]+)/sec\s+total:\s*(\d+)")
        .expect("coverage line pattern is valid")
});

static MEMORY_ENTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([A-Za-z][A-Za-z0-9_ -]*?):(\d+(?:\.\d+)?)")
        .expect("memory entry pattern is valid")
});

fn apply_lookups(dp: &mut DatapathRecord, text: &str) {
    for caps in KEY_VALUE.captures_iter(text) {
        let n = caps[2].parse::<u64>().ok();
        match (&caps[1], n) {
            ("hit", Some(n)) => dp.lookups_hit = n,
            ("missed", Some(n)) => dp.lookups_missed = n,
            ("lost", Some(n)) => dp.lookups_lost = n,
            _ => {}
        }
    }
}

fn apply_masks(dp: &mut DatapathRecord, text: &str) {
    for caps in KEY_VALUE.captures_iter(text) {
        match &caps[1] {
            "hit" => dp.masks_hit = caps[2].parse().unwrap_or(dp.masks_hit),
            "total" => dp.masks_total = caps[2].parse().unwrap_or(dp.masks_total),
            "hit/pkt" => {
                dp.masks_hit_per_packet = caps[2].parse().unwrap_or(dp.masks_hit_per_packet)
            }
            _ => {}
        }
    }
}

/// Decode the datapath sections of `dpif/show`. Bridge and port lines are
/// ignored.
pub fn parse_dpif_show(text: &str) -> Vec<DatapathRecord> {
    let mut out: Vec<DatapathRecord> = Vec::new();
    for line in text.lines() {
        if let Some(caps) = DATAPATH_HEADER.captures(line) {
            let mut dp = DatapathRecord {
                name: caps[1].to_string(),
                ..Default::default()
            };
            apply_lookups(&mut dp, &caps[2]);
            out.push(dp);
            continue;
        }
        let Some(dp) = out.last_mut() else {
            continue;
        };
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("lookups:") {
            apply_lookups(dp, rest);
        } else if let Some(rest) = trimmed.strip_prefix("masks:") {
            apply_masks(dp, rest);
        } else if let Some(caps) = FLOWS.captures(line) {
            dp.flows = caps[1].parse().unwrap_or(dp.flows);
        }
    }
    out
}

pub fn parse_coverage_show(component: &str, text: &str) -> Vec<CoverageRecord> {
    text.lines()
        .filter_map(|line| {
            let caps = COVERAGE_LINE.captures(line.trim())?;
            Some(CoverageRecord {
                component: component.to_string(),
                event: caps[1].to_string(),
                avg_5s: caps[2].parse().ok()?,
                avg_1m: caps[3].parse().ok()?,
                avg_1h: caps[4].parse().ok()?,
                total: caps[5].parse().ok()?,
            })
        })
        .collect()
}

/// `memory/show` prints `facility:value` pairs separated by spaces; some
/// facility names (`udpif keys`) contain a space themselves.
pub fn parse_memory_show(component: &str, text: &str) -> Vec<MemoryRecord> {
    MEMORY_ENTRY
        .captures_iter(text)
        .filter_map(|caps| {
            Some(MemoryRecord {
                component: component.to_string(),
                facility: caps[1].trim().to_string(),
                value: caps[2].parse().ok()?,
            })
        })
        .collect()
}
