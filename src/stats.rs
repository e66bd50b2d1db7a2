//! Per-connection counters.

use std::fmt;
use std::time::Instant;

/// Lifetime counters for one connection, printed at teardown.
#[derive(Debug)]
pub struct ConnectionStats {
    pub born: Instant,

    pub nn_publishers: u64,
    pub nn_subscribers: u64,

    pub nn_rr: u64,
    pub nn_xr: u64,
    pub nn_sr: u64,
    pub nn_nack: u64,
    pub nn_pli: u64,

    pub nn_in_twcc: u64,
    pub nn_in_rtp: u64,
    pub nn_out_twcc: u64,
    pub nn_out_rtp: u64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        ConnectionStats {
            born: Instant::now(),
            nn_publishers: 0,
            nn_subscribers: 0,
            nn_rr: 0,
            nn_xr: 0,
            nn_sr: 0,
            nn_nack: 0,
            nn_pli: 0,
            nn_in_twcc: 0,
            nn_in_rtp: 0,
            nn_out_twcc: 0,
            nn_out_rtp: 0,
        }
    }

    /// One line summary, omitting zero counters.
    pub fn summary(&self) -> String {
        let mut s = format!("alive={}ms", self.born.elapsed().as_millis());

        let mut add = |name: &str, v: u64| {
            if v > 0 {
                s.push_str(&format!(", {}={}", name, v));
            }
        };

        add("npub", self.nn_publishers);
        add("nsub", self.nn_subscribers);
        add("nrr", self.nn_rr);
        add("nxr", self.nn_xr);
        add("nsr", self.nn_sr);
        add("nnack", self.nn_nack);
        add("npli", self.nn_pli);
        add("in_ntwcc", self.nn_in_twcc);
        add("in_nrtp", self.nn_in_rtp);
        add("out_ntwcc", self.nn_out_twcc);
        add("out_nrtp", self.nn_out_rtp);

        s
    }
}

impl fmt::Display for ConnectionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn summary_omits_zeroes() {
        let mut stats = ConnectionStats::new();
        stats.nn_pli = 2;
        let s = stats.summary();
        assert!(s.contains("npli=2"));
        assert!(!s.contains("nrr"));
    }
}
