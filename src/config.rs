use std::time::Duration;

use serde::Deserialize;

/// Per-vhost tuning for RTC sessions.
///
/// Mirrors the `rtc_*` vhost directives of the server configuration. All
/// fields have conservative defaults so a missing section behaves sanely.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RtcConfig {
    /// Whether to negotiate NACK/PLI feedback and answer NACK with
    /// retransmits from the send-track ring buffer.
    pub nack_enabled: bool,

    /// Whether to negotiate transport-wide congestion control.
    pub twcc_enabled: bool,

    /// Whether to feed TWCC feedback into the congestion controller
    /// readouts on play connections.
    pub gcc_enabled: bool,

    /// ICE keep-alive timeout. A connection with no binding request for
    /// this long is garbage collected by the server sweep.
    pub stun_timeout: Duration,

    /// Reject binding requests that carry ICE-CONTROLLED. An ice-lite
    /// server is always controlling, so a controlled peer is a role
    /// conflict.
    pub stun_strict_check: bool,

    /// Drop inbound packets with this payload type. Fault injection,
    /// 0 disables.
    pub drop_for_pt: u8,

    /// Collect per-batch performance statistics on the play path.
    pub server_perf_stat: bool,

    /// Prefer latency over batching on the play path.
    pub realtime_enabled: bool,

    /// How many packets the play loop waits for per consumer batch.
    /// Ignored (treated as 0) when `realtime_enabled` is set.
    pub mw_msgs: usize,
}

impl RtcConfig {
    /// The effective batch size for the play consumer.
    pub fn effective_mw_msgs(&self) -> usize {
        if self.realtime_enabled {
            0
        } else {
            self.mw_msgs
        }
    }
}

impl Default for RtcConfig {
    fn default() -> Self {
        RtcConfig {
            nack_enabled: true,
            twcc_enabled: true,
            gcc_enabled: false,
            stun_timeout: Duration::from_secs(30),
            stun_strict_check: false,
            drop_for_pt: 0,
            server_perf_stat: false,
            realtime_enabled: true,
            mw_msgs: 0,
        }
    }
}
