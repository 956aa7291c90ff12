//! Datapath drop counters extracted from `coverage/show`.
//!
//! Only the fixed set of [`DropReason`]s is recognised. A reason that does
//! not appear in the output is absent from the [`DropCounterSet`], which is
//! not the same as a zero count.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// Known drop reasons reported by ovs-vswitchd coverage counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    DatapathDropUpcallError,
    DatapathDropLockError,
    DatapathDropRxInvalidPacket,
    DatapathDropMeter,
    DatapathDropUserspaceActionError,
    DatapathDropTunnelPushError,
    DatapathDropTunnelPopError,
    DatapathDropRecircError,
    DatapathDropInvalidPort,
    DatapathDropInvalidTnlPort,
    DatapathDropSampleError,
    DatapathDropNshDecapError,
    DropActionOfPipeline,
    DropActionBridgeNotFound,
    DropActionRecursionTooDeep,
    DropActionTooManyResubmit,
    DropActionStackTooDeep,
    DropActionNoRecirculation,
    DropActionRecirculationConflict,
    DropActionTooManyMplsLabels,
    DropActionInvalidTunnelMetadata,
    DropActionUnsupportedPacketType,
    DropActionCongestion,
    DropActionForwardingDisabled,
}

impl DropReason {
    pub const ALL: [DropReason; 24] = [
        Self::DatapathDropUpcallError,
        Self::DatapathDropLockError,
        Self::DatapathDropRxInvalidPacket,
        Self::DatapathDropMeter,
        Self::DatapathDropUserspaceActionError,
        Self::DatapathDropTunnelPushError,
        Self::DatapathDropTunnelPopError,
        Self::DatapathDropRecircError,
        Self::DatapathDropInvalidPort,
        Self::DatapathDropInvalidTnlPort,
        Self::DatapathDropSampleError,
        Self::DatapathDropNshDecapError,
        Self::DropActionOfPipeline,
        Self::DropActionBridgeNotFound,
        Self::DropActionRecursionTooDeep,
        Self::DropActionTooManyResubmit,
        Self::DropActionStackTooDeep,
        Self::DropActionNoRecirculation,
        Self::DropActionRecirculationConflict,
        Self::DropActionTooManyMplsLabels,
        Self::DropActionInvalidTunnelMetadata,
        Self::DropActionUnsupportedPacketType,
        Self::DropActionCongestion,
        Self::DropActionForwardingDisabled,
    ];

    /// Coverage counter name as printed by OVS.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DatapathDropUpcallError => "datapath_drop_upcall_error",
            Self::DatapathDropLockError => "datapath_drop_lock_error",
            Self::DatapathDropRxInvalidPacket => "datapath_drop_rx_invalid_packet",
            Self::DatapathDropMeter => "datapath_drop_meter",
            Self::DatapathDropUserspaceActionError => "datapath_drop_userspace_action_error",
            Self::DatapathDropTunnelPushError => "datapath_drop_tunnel_push_error",
            Self::DatapathDropTunnelPopError => "datapath_drop_tunnel_pop_error",
            Self::DatapathDropRecircError => "datapath_drop_recirc_error",
            Self::DatapathDropInvalidPort => "datapath_drop_invalid_port",
            Self::DatapathDropInvalidTnlPort => "datapath_drop_invalid_tnl_port",
            Self::DatapathDropSampleError => "datapath_drop_sample_error",
            Self::DatapathDropNshDecapError => "datapath_drop_nsh_decap_error",
            Self::DropActionOfPipeline => "drop_action_of_pipeline",
            Self::DropActionBridgeNotFound => "drop_action_bridge_not_found",
            Self::DropActionRecursionTooDeep => "drop_action_recursion_too_deep",
            Self::DropActionTooManyResubmit => "drop_action_too_many_resubmit",
            Self::DropActionStackTooDeep => "drop_action_stack_too_deep",
            Self::DropActionNoRecirculation => "drop_action_no_recirculation",
            Self::DropActionRecirculationConflict => "drop_action_recirculation_conflict",
            Self::DropActionTooManyMplsLabels => "drop_action_too_many_mpls_labels",
            Self::DropActionInvalidTunnelMetadata => "drop_action_invalid_tunnel_metadata",
            Self::DropActionUnsupportedPacketType => "drop_action_unsupported_packet_type",
            Self::DropActionCongestion => "drop_action_congestion",
            Self::DropActionForwardingDisabled => "drop_action_forwarding_disabled",
        }
    }
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a counter name is not one of the known drop reasons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownDropReason(pub String);

impl std::fmt::Display for UnknownDropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown drop reason: {}", self.0)
    }
}

impl std::error::Error for UnknownDropReason {}

impl std::str::FromStr for DropReason {
    type Err = UnknownDropReason;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| UnknownDropReason(s.to_string()))
    }
}

/// Drop reason to occurrence count. Unobserved reasons are absent.
pub type DropCounterSet = BTreeMap<DropReason, u64>;

static TOTAL_COLUMN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\btotal:\s*(\d+)").expect("total column pattern is valid"));

/// Extract known drop counters from `coverage/show` style text.
///
/// A line counts only if its first token is a known reason. The value is
/// taken from the `total:` column when present, otherwise from the second
/// whitespace-separated token, which must be a whole number.
pub fn parse_drop_counters(text: &str) -> DropCounterSet {
    let mut counters = DropCounterSet::new();
    for line in text.lines() {
        let mut tokens = line.split_whitespace();
        let Some(reason) = tokens.next().and_then(|t| t.parse::<DropReason>().ok()) else {
            continue;
        };

        let value = match TOTAL_COLUMN.captures(line) {
            Some(caps) => caps[1].parse::<u64>().ok(),
            None => tokens.next().and_then(|t| t.parse::<u64>().ok()),
        };

        if let Some(v) = value {
            counters.insert(reason, v);
        }
    }
    counters
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_reason_with_plain_count() {
        let drops = parse_drop_counters("datapath_drop_meter 42\nother_counter 7\n");
        assert_eq!(drops.len(), 1);
        assert_eq!(drops[&DropReason::DatapathDropMeter], 42);
    }

    #[test]
    fn coverage_show_total_column() {
        let text = "\
Event coverage, avg rate over last: 5 seconds, last minute, last hour,  hash=1a2b3c4d:
datapath_drop_upcall_error   0.0/sec     0.017/sec        0.0003/sec   total: 61
drop_action_of_pipeline      1.2/sec     1.100/sec        1.0500/sec   total: 3780
netdev_sent                 12.0/sec    11.000/sec       10.0000/sec   total: 99999
81 events never hit
";
        let drops = parse_drop_counters(text);
        assert_eq!(drops.len(), 2);
        assert_eq!(drops[&DropReason::DatapathDropUpcallError], 61);
        assert_eq!(drops[&DropReason::DropActionOfPipeline], 3780);
    }

    #[test]
    fn absent_is_not_zero() {
        let drops = parse_drop_counters("drop_action_congestion 0\n");
        assert_eq!(drops.get(&DropReason::DropActionCongestion), Some(&0));
        assert_eq!(drops.get(&DropReason::DatapathDropMeter), None);
    }

    #[test]
    fn reason_must_lead_the_line() {
        let drops = parse_drop_counters("counter datapath_drop_meter 5\nxdatapath_drop_meter 9\n");
        assert!(drops.is_empty());
    }

    #[test]
    fn non_integer_value_skips_line() {
        let drops = parse_drop_counters("datapath_drop_meter 4.5/sec\ndatapath_drop_lock_error 99999999999999999999999\n");
        assert!(drops.is_empty());
    }

    #[test]
    fn names_round_trip_through_from_str() {
        for reason in DropReason::ALL {
            assert_eq!(reason.as_str().parse::<DropReason>(), Ok(reason));
        }
        assert!("datapath_drop_everything".parse::<DropReason>().is_err());
    }

    #[test]
    fn serializes_with_coverage_names() {
        let mut drops = DropCounterSet::new();
        drops.insert(DropReason::DatapathDropInvalidTnlPort, 3);
        let json = serde_json::to_string(&drops).unwrap();
        assert_eq!(json, r#"{"datapath_drop_invalid_tnl_port":3}"#);
    }
}
