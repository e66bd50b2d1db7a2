use std::fmt;
use std::time::{Duration, SystemTime};

use tokio::sync::watch;

/// Seconds between 1900-01-01 (NTP epoch) and 1970-01-01 (unix epoch).
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Current wall clock as a 64 bit NTP timestamp (32.32 fixed point).
pub(crate) fn now_ntp_64() -> u64 {
    let unix = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("clock after unix epoch");

    to_ntp_64(unix + Duration::from_secs(NTP_UNIX_OFFSET))
}

fn to_ntp_64(since_ntp_epoch: Duration) -> u64 {
    let secs = since_ntp_epoch.as_secs();
    // nanos scaled to the 32 bit fraction.
    let frac = (since_ntp_epoch.subsec_nanos() as u64) * (1 << 32) / 1_000_000_000;
    (secs << 32) | frac
}

/// The middle 32 bits of a 64 bit NTP timestamp (16.16 fixed point), as used
/// by LSR/DLRR fields.
pub(crate) fn compact_ntp(ntp: u64) -> u32 {
    ((ntp >> 16) & 0xffff_ffff) as u32
}

/// RTT in milliseconds from a compact NTP difference `now - lrr - dlrr`.
///
/// All three values are 16.16 fixed point seconds; the subtraction is
/// wrapping since the peer clock and ours share no epoch.
pub(crate) fn rtt_from_compact_ntp(now: u32, lrr: u32, dlrr: u32) -> u32 {
    let rtt_ntp = now.wrapping_sub(lrr).wrapping_sub(dlrr);
    ((rtt_ntp & 0xffff) * 1000 >> 16) + ((rtt_ntp >> 16) * 1000)
}

/// A DLSR value (16.16 fixed point seconds) from a duration.
pub(crate) fn duration_to_compact_ntp(d: Duration) -> u32 {
    let ms = d.as_millis() as u64;
    (((ms / 1000) << 16) | ((ms % 1000) << 16) / 1000) as u32
}

/// The play loop should exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("interrupted")
    }
}

/// Pull-style cancellation handle polled by long running loops.
#[derive(Debug, Clone)]
pub struct Cancel {
    rx: watch::Receiver<bool>,
}

/// The owning side of a [`Cancel`]. Dropping it also cancels.
#[derive(Debug)]
pub struct Canceller {
    tx: watch::Sender<bool>,
}

pub fn cancel_pair() -> (Canceller, Cancel) {
    let (tx, rx) = watch::channel(false);
    (Canceller { tx }, Cancel { rx })
}

impl Cancel {
    /// Check for cancellation without waiting.
    pub fn pull(&self) -> Result<(), Interrupted> {
        if *self.rx.borrow() || self.rx.has_changed().is_err() {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }
}

impl Canceller {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Random alphanumeric string, for ufrag/pwd/cname generation.
pub(crate) fn random_id(len: usize) -> String {
    const CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    (0..len)
        .map(|_| CHARS[fastrand::usize(..CHARS.len())] as char)
        .collect()
}
