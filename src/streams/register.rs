use std::time::Instant;

use crate::rtp::{NackEntry, ReceptionReport, SeqNo};

const MAX_DROPOUT: u64 = 3000;
const MAX_MISORDER: u64 = 100;
const MIN_SEQUENTIAL: u64 = 2;
const MISORDER_DELAY: u64 = 1;

/// Receive state for one SSRC: sequence tracking, loss accounting, jitter
/// and NACK bookkeeping. Arithmetic per RFC 3550 appendix A.
#[derive(Debug)]
pub(crate) struct ReceiverRegister {
    /// Per-sequence status, ring indexed by seq % MAX_DROPOUT.
    packet_status: Vec<PacketStatus>,

    /// First ever sequence number observed.
    base_seq: SeqNo,

    /// Max ever observed sequence number (extended, "newer-than" modular rule).
    max_seq: SeqNo,

    /// last 'bad' seq number + 1.
    ///
    /// Set when we observe a large jump in sequence numbers (MAX_DROPOUT)
    /// that could indicate a restart of the sender.
    bad_seq: Option<SeqNo>,

    /// Sequential packets remaining until source is valid.
    probation: u64,

    /// Counter of received packets.
    received: i64,

    /// Expected at last reception report generation.
    expected_prior: i64,

    /// Received at last reception report generation.
    received_prior: i64,

    /// Estimated jitter in media time base units.
    jitter: f32,

    /// Check nacks from this point. We've reported nacks up to here.
    nack_check_from: SeqNo,

    /// Previously received time point, for jitter.
    time_point_prior: Option<TimePoint>,
}

#[derive(Debug, Clone, Copy, Default)]
struct PacketStatus {
    received: bool,
    nack_count: u8,
}

impl PacketStatus {
    fn should_nack(&self) -> bool {
        !self.received && self.nack_count < 5
    }
}

#[derive(Debug, Clone, Copy)]
struct TimePoint {
    arrival: Instant,
    rtp_time: u32,
    clock_rate: u32,
}

impl TimePoint {
    fn is_same(&self, other: TimePoint) -> bool {
        self.rtp_time == other.rtp_time
    }

    fn delta(&self, other: TimePoint) -> f32 {
        // All packets are supposed to be at the same clock rate.
        let secs = (self.arrival - other.arrival).as_secs_f32();
        let transit = secs * self.clock_rate as f32;
        let rtp_diff = self.rtp_time.wrapping_sub(other.rtp_time) as f32;
        (transit - rtp_diff).abs()
    }
}

impl ReceiverRegister {
    pub fn new(base_seq: SeqNo) -> Self {
        ReceiverRegister {
            packet_status: vec![PacketStatus::default(); MAX_DROPOUT as usize],
            base_seq,
            // ensure the first update_seq considers the first packet sequential
            max_seq: (base_seq.wrapping_sub(1)).into(),
            bad_seq: None,
            probation: MIN_SEQUENTIAL,
            received: 1,
            expected_prior: 0,
            received_prior: 0,
            jitter: 0.0,
            nack_check_from: base_seq,
            time_point_prior: None,
        }
    }

    fn init_seq(&mut self, seq: SeqNo) {
        self.base_seq = seq;
        self.max_seq = seq;
        self.bad_seq = None;
        self.received = 0;
        self.received_prior = 0;
        self.expected_prior = 0;
        self.jitter = 0.0;
        self.packet_status.fill(PacketStatus::default());
        self.nack_check_from = seq;
        self.time_point_prior = None;
        self.record_received(seq);
    }

    fn packet_index(&self, seq: u64) -> usize {
        (seq % self.packet_status.len() as u64) as usize
    }

    /// Mark a sequence as received and move the nack window forward.
    fn record_received(&mut self, seq: SeqNo) {
        if *seq < *self.nack_check_from {
            // Already nacked past this point.
            return;
        }

        let pos = self.packet_index(*seq);
        let was_set = self.packet_status[pos].received;
        self.packet_status[pos].received = true;

        if !was_set && self.packet_status[pos].nack_count > 0 {
            debug!(
                "Received packet {} after {} NACKs",
                seq, self.packet_status[pos].nack_count
            );
        }

        // Move nack_check_from forward on a consecutive run, or force it
        // forward if it trails too far.
        let check_up_to = (*self.max_seq).saturating_sub(MISORDER_DELAY);
        let new_nack_check_from: Option<SeqNo> = {
            let consecutive_until = (*self.nack_check_from..=check_up_to)
                .take_while(|seq| self.packet_status[self.packet_index(*seq)].received)
                .last()
                .map(Into::into);

            match consecutive_until {
                Some(new) if new != self.nack_check_from => Some(new),
                _ => {
                    if check_up_to.saturating_sub(*self.nack_check_from) > MAX_MISORDER {
                        Some((check_up_to - MAX_MISORDER).into())
                    } else {
                        None
                    }
                }
            }
        };

        if let Some(new_nack_check_from) = new_nack_check_from {
            for seq in *self.nack_check_from..*new_nack_check_from {
                let index = self.packet_index(seq);
                self.packet_status[index] = PacketStatus::default();
            }
            self.nack_check_from = new_nack_check_from;
        }

        // dupe packets (true -> true) are not counted; they can happen
        // due to resends.
        if !was_set {
            self.received += 1;
        }
    }

    pub fn update_seq(&mut self, seq: SeqNo) {
        if self.probation > 0 {
            // Source is not valid until MIN_SEQUENTIAL packets with
            // sequential sequence numbers have been received.
            if *seq == self.max_seq.wrapping_add(1) {
                self.probation -= 1;
                self.max_seq = seq;
                if self.probation == 0 {
                    self.init_seq(seq);
                }
            } else {
                self.probation = MIN_SEQUENTIAL - 1;
                self.max_seq = seq;
            }
        } else if *self.max_seq < *seq {
            // Incoming seq is larger than we've seen before. The normal case.
            let udelta = *seq - *self.max_seq;

            if udelta < MAX_DROPOUT {
                // in order, with permissible gap
                self.max_seq = seq;
                self.bad_seq = None;
                self.record_received(seq);
            } else {
                // the sequence number made a very large jump
                self.maybe_seq_jump(seq)
            }
        } else {
            // duplicate or out of order packet
            let udelta = *self.max_seq - *seq;

            if udelta < MAX_MISORDER {
                self.record_received(seq);
            } else {
                // the sequence number is too far in the past
                self.maybe_seq_jump(seq);
            }
        }
    }

    fn maybe_seq_jump(&mut self, seq: SeqNo) {
        if self.bad_seq == Some(seq) {
            // Two sequential packets -- assume the other side restarted
            // without telling us, so just re-sync.
            self.init_seq(seq);
        } else {
            self.bad_seq = Some((*seq + 1).into());
        }
    }

    pub fn max_seq(&self) -> SeqNo {
        self.max_seq
    }

    pub fn update_time(&mut self, arrival: Instant, rtp_time: u32, clock_rate: u32) {
        let tp = TimePoint {
            arrival,
            rtp_time,
            clock_rate,
        };

        if let Some(prior) = self.time_point_prior {
            // rtp_time not moving forward is normal when multiple packets
            // make up one frame. Only the first counts for jitter.
            if !tp.is_same(prior) {
                let d = tp.delta(prior);
                self.jitter += (1.0 / 16.0) * (d - self.jitter);
            }
        }

        self.time_point_prior = Some(tp);
    }

    pub fn has_nack_report(&self) -> bool {
        // No nack report during probation.
        if self.probation > 0 {
            return false;
        }

        let start = *self.nack_check_from;
        // MISORDER_DELAY gives a grace period for out of order arrival
        // before we report a loss.
        let stop = (*self.max_seq).saturating_sub(MISORDER_DELAY);

        if stop < start {
            return false;
        }

        (start..stop).any(|seq| self.packet_status[self.packet_index(seq)].should_nack())
    }

    /// Create NACK entries for currently missing sequence numbers.
    pub fn nack_reports(&mut self) -> Vec<NackEntry> {
        if self.probation > 0 {
            return vec![];
        }

        let start = *self.nack_check_from;
        let stop = (*self.max_seq).saturating_sub(MISORDER_DELAY);
        let u16max = u16::MAX as u64 + 1_u64;

        if stop < start {
            return vec![];
        }

        let mut nacks = vec![];
        let mut first_missing = None;
        let mut bitmask = 0;

        for i in start..stop {
            let j = self.packet_index(i);

            let should_nack = self.packet_status[j].should_nack();

            if let Some(first) = first_missing {
                if should_nack {
                    let o = (i - (first + 1)) as u16;
                    bitmask |= 1 << o;
                    self.packet_status[j].nack_count += 1;
                }

                if i - first == 16 {
                    nacks.push(NackEntry {
                        pid: (first % u16max) as u16,
                        blp: bitmask,
                    });
                    bitmask = 0;
                    first_missing = None;
                }
            } else if should_nack {
                self.packet_status[j].nack_count += 1;
                first_missing = Some(i);
            }
        }

        if let Some(first) = first_missing {
            nacks.push(NackEntry {
                pid: (first % u16max) as u16,
                blp: bitmask,
            });
        }

        nacks
    }

    /// Create a new reception report.
    ///
    /// This modifies state: fraction_lost is calculated against the
    /// previous call.
    pub fn reception_report(&mut self) -> ReceptionReport {
        ReceptionReport {
            ssrc: 0.into(),
            fraction_lost: self.fraction_lost(),
            packets_lost: self.packets_lost(),
            max_seq: (*self.max_seq % ((u32::MAX as u64) + 1_u64)) as u32,
            jitter: self.jitter as u32,
            last_sr_time: 0,
            last_sr_delay: 0,
        }
    }

    /// Number of packets expected from base to highest.
    fn expected(&self) -> i64 {
        *self.max_seq as i64 - *self.base_seq as i64 + 1
    }

    /// Fraction lost since last call, 8 bit fixed point.
    fn fraction_lost(&mut self) -> u8 {
        let expected = self.expected();
        let expected_interval = expected - self.expected_prior;
        self.expected_prior = expected;

        let received = self.received;
        let received_interval = received - self.received_prior;
        self.received_prior = received;

        let lost_interval = expected_interval - received_interval;

        let lost = if expected_interval == 0 || lost_interval <= 0 {
            0
        } else {
            (lost_interval << 8) / expected_interval
        } as u8;

        trace!("Reception fraction lost: {}", lost);

        lost
    }

    /// Absolute number of lost packets, clamped to the 24 bit carrier.
    fn packets_lost(&self) -> u32 {
        // Since this signed number is carried in 24 bits, it should be
        // clamped at 0x7fffff for positive loss and 0x800000 for negative
        // loss rather than wrapping around.
        let lost_t = self.expected() - self.received;
        if lost_t > 0x7fffff {
            0x7fffff_u32
        } else if lost_t < 0 {
            0x800000_u32
        } else {
            lost_t as u32
        }
    }
}

trait WrappingHelpers {
    fn wrapping_add(&self, n: u64) -> u64;
    fn wrapping_sub(&self, n: u64) -> u64;
}

impl WrappingHelpers for SeqNo {
    fn wrapping_add(&self, n: u64) -> u64 {
        (**self).wrapping_add(n)
    }
    fn wrapping_sub(&self, n: u64) -> u64 {
        (**self).wrapping_sub(n)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn reg_with(seqs: &[u64]) -> ReceiverRegister {
        let mut r = ReceiverRegister::new(seqs[0].into());
        for s in seqs {
            r.update_seq((*s).into());
        }
        r
    }

    #[test]
    fn in_order_has_no_nacks() {
        let mut r = reg_with(&[10, 11, 12, 13, 14]);
        assert!(!r.has_nack_report());
        assert!(r.nack_reports().is_empty());
        assert_eq!(*r.max_seq(), 14);
    }

    #[test]
    fn wrap_updates_highest_without_spurious_nacks() {
        // The track extends 16 bit numbers before the register; feeding
        // the extended progression across the u16 boundary.
        let mut r = reg_with(&[65_533, 65_534, 65_535, 65_536, 65_537]);
        assert_eq!(*r.max_seq(), 65_537);
        assert!(!r.has_nack_report());
        assert!(r.nack_reports().is_empty());
    }

    #[test]
    fn gap_produces_nack_with_blp() {
        // 13..=20 missing after 12, then 21 arrives.
        let mut r = reg_with(&[10, 11, 12, 21, 22]);
        assert!(r.has_nack_report());
        let nacks = r.nack_reports();
        assert_eq!(nacks.len(), 1);
        assert_eq!(nacks[0].pid, 13);
        // 14..=20 are the next bits: 7 bits set
        assert_eq!(nacks[0].blp, 0b0111_1111);
    }

    #[test]
    fn cumulative_loss_matches_expected_minus_received() {
        let mut r = reg_with(&[100, 101, 102, 105, 106]);
        // probation consumes 100; expected = 106 - 101 + 1 = 6, received = 4
        let rr = r.reception_report();
        assert_eq!(rr.packets_lost, 2);
        assert_eq!(rr.max_seq, 106);
    }

    #[test]
    fn fraction_lost_is_interval_based() {
        let mut r = reg_with(&[100, 101, 102, 103]);
        let rr = r.reception_report();
        assert_eq!(rr.fraction_lost, 0);

        // lose half of the next interval
        r.update_seq(105.into());
        r.update_seq(107.into());
        let rr = r.reception_report();
        // expected interval 4 (104..107), received 2 -> 50%
        assert_eq!(rr.fraction_lost, 128);
    }

    #[test]
    fn jitter_counts_once_per_frame() {
        let now = Instant::now();
        let mut r = reg_with(&[1, 2]);
        r.update_time(now, 3000, 90_000);
        r.update_time(now + std::time::Duration::from_millis(10), 3000, 90_000);
        // same rtp_time -> no jitter contribution
        assert_eq!(r.reception_report().jitter, 0);
    }
}
