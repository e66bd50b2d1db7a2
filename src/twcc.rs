//! Connection-scoped transport-wide congestion control state.
//!
//! One allocator/register pair per connection: inbound arrivals are
//! collected for periodic feedback (publish side), outbound packets are
//! stamped with a monotone transport sequence and matched against remote
//! feedback for loss/bitrate/RTT readouts (play side).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::rtp::rtcp::{Delta, PacketChunk, PacketStatus};
use crate::rtp::{extend_u16, Ssrc, Twcc};

/// How many acked/lost send records we keep for readouts.
const MAX_SEND_RECORDS: usize = 4096;

/// How many reported receipts we keep to re-anchor the next report.
const KEEP_REPORTED: usize = 100;

/// Readout for a congestion controller.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NetworkStatus {
    /// Fraction of packets lost in the last feedback window.
    pub loss_rate: f32,
    /// Acked send bitrate over the local send-time span.
    pub bitrate_bps: u64,
    /// Acked bitrate over the remote receive-time span.
    pub delay_bitrate_bps: u64,
    /// Round trip estimated from feedback arrival.
    pub rtt_ms: u32,
}

#[derive(Debug, Clone, Copy)]
struct Receipt {
    seq: u64,
    time: Instant,
}

#[derive(Debug, Clone, Copy)]
struct SendRecord {
    twcc_sn: u64,
    /// Size on the wire, after SRTP.
    size: usize,
    ssrc: Ssrc,
    rtp_sn: u16,
    queued_at: Option<Instant>,
    sent_at: Option<Instant>,
    remote_recv_at: Option<Instant>,
    lost: bool,
}

/// Per-connection TWCC sequence allocator, ingress arrival register and
/// egress feedback consumer.
#[derive(Debug)]
pub struct TwccController {
    /// Next outgoing transport sequence number (extended).
    next_sn: u64,

    /// Arrivals of inbound media, ordered by extended sequence.
    queue: VecDeque<Receipt>,

    /// Index into queue from where the next report starts.
    report_from: usize,

    /// Last extended inbound sequence, to undo the 16 bit truncation.
    last_recv_sn: Option<u64>,

    /// The zero point all reference times are offset from.
    time_start: Option<Instant>,

    /// Monotone counter stamped into each feedback packet.
    feedback_count: u8,

    /// Outbound send records awaiting remote feedback.
    sends: VecDeque<SendRecord>,

    /// Last extended sequence acked by remote feedback.
    last_acked_sn: Option<u64>,

    status: NetworkStatus,
}

impl TwccController {
    pub fn new() -> Self {
        TwccController {
            next_sn: 0,
            queue: VecDeque::new(),
            report_from: 0,
            last_recv_sn: None,
            time_start: None,
            feedback_count: 0,
            sends: VecDeque::new(),
            last_acked_sn: None,
            status: NetworkStatus::default(),
        }
    }

    /// Allocate the transport sequence number for the next outgoing packet.
    /// Strictly monotone (mod 2^16 on the wire).
    pub fn allocate_twcc_sn(&mut self) -> u16 {
        let sn = self.next_sn;
        self.next_sn += 1;
        sn as u16
    }

    /// Record the arrival of an inbound packet carrying `sn` in its
    /// transport-cc header extension.
    pub fn recv_packet(&mut self, sn: u16, now: Instant) {
        let ext = extend_u16(self.last_recv_sn, sn);
        self.last_recv_sn = Some(ext);

        match self.queue.binary_search_by_key(&ext, |r| r.seq) {
            Ok(_) => {
                // Same twcc sn twice. The sender reused a number, ignore.
            }
            Err(idx) => {
                self.queue.insert(idx, Receipt { seq: ext, time: now });

                if idx < self.report_from {
                    self.report_from = idx;
                }
            }
        }
    }

    /// Whether there are arrivals not yet covered by a feedback packet.
    pub fn has_unreported(&self) -> bool {
        self.queue.len() > self.report_from
    }

    /// Build a feedback packet from accumulated arrivals. The caller still
    /// needs to fill sender/media SSRC. Increments the feedback count.
    pub fn build_feedback(&mut self) -> Option<Twcc> {
        let first = *self.queue.get(self.report_from)?;

        if self.time_start.is_none() {
            self.time_start = Some(first.time);
        }
        let time_start = self.time_start.expect("a start time");

        // The value is interpreted in multiples of 64ms.
        let first_time_rel = first.time.saturating_duration_since(time_start);
        let reference_time = (first_time_rel.as_micros() as u64 / 64_000) as u32;

        // Reference time is in steps of 64ms, the first reported packet
        // might have an offset against that (packet resolution is 250us).
        let base_time = time_start + Duration::from_millis(reference_time as u64 * 64);

        let mut twcc = Twcc {
            sender_ssrc: 0.into(),
            ssrc: 0.into(),
            feedback_count: self.feedback_count,
            base_seq: first.seq as u16,
            reference_time,
            status_count: 0,
            chunks: VecDeque::new(),
            delta: VecDeque::new(),
        };

        // Runs of one status each. Run-length chunks are always legal;
        // we don't bother with the vector chunk forms when building.
        let mut prev = (first.seq.wrapping_sub(1), base_time);
        let mut run: Option<(PacketStatus, u16)> = None;

        fn flush(twcc: &mut Twcc, run: &mut Option<(PacketStatus, u16)>) {
            if let Some((status, n)) = run.take() {
                twcc.chunks.push_back(PacketChunk::Run(status, n));
            }
        }

        let mut reported = 0;
        for r in self.queue.iter().skip(self.report_from) {
            let diff_seq = r.seq - prev.0;

            if diff_seq > 1 {
                // missing packets in between
                let mut todo = diff_seq - 1;
                flush(&mut twcc, &mut run);
                while todo > 0 {
                    let n = todo.min(8191) as u16;
                    twcc.chunks.push_back(PacketChunk::Run(PacketStatus::NotReceived, n));
                    twcc.status_count += n;
                    todo -= n as u64;
                }
            }

            let diff_time = if r.time < prev.1 {
                -((prev.1 - r.time).as_micros() as i64)
            } else {
                (r.time - prev.1).as_micros() as i64
            };

            let (status, delta) = if diff_time < -8_192_000 || diff_time > 8_191_750 {
                // Too large to be representable in deltas. Report what we
                // got; the rest goes in the next report.
                break;
            } else if diff_time < 0 || diff_time > 63_750 {
                let t = (diff_time / 250) as i16;
                (PacketStatus::ReceivedLargeOrNegativeDelta, Delta::Large(t))
            } else {
                let t = (diff_time / 250) as u8;
                (PacketStatus::ReceivedSmallDelta, Delta::Small(t))
            };

            match &mut run {
                Some((s, n)) if *s == status && *n < 8191 => *n += 1,
                _ => {
                    flush(&mut twcc, &mut run);
                    run = Some((status, 1));
                }
            }
            twcc.delta.push_back(delta);
            twcc.status_count += 1;

            reported += 1;
            prev = (r.seq, r.time);
        }
        flush(&mut twcc, &mut run);

        if twcc.chunks.is_empty() {
            return None;
        }

        self.report_from += reported;
        self.feedback_count = self.feedback_count.wrapping_add(1);

        // clean up
        if self.report_from > KEEP_REPORTED {
            let to_remove = self.report_from - KEEP_REPORTED;
            self.queue.drain(..to_remove);
            self.report_from -= to_remove;
        }

        Some(twcc)
    }

    /// The current feedback packet count (next value to be stamped).
    pub fn feedback_count(&self) -> u8 {
        self.feedback_count
    }

    /// Record send intent of an outgoing packet, before SRTP protect.
    pub fn on_pre_send_packet(&mut self, ssrc: Ssrc, rtp_sn: u16, twcc_sn: u16, size: usize) {
        let ext = extend_u16(Some(self.next_sn), twcc_sn);

        self.sends.push_back(SendRecord {
            twcc_sn: ext,
            size,
            ssrc,
            rtp_sn,
            queued_at: Some(Instant::now()),
            sent_at: None,
            remote_recv_at: None,
            lost: false,
        });

        while self.sends.len() > MAX_SEND_RECORDS {
            self.sends.pop_front();
        }
    }

    /// Record the actual send event.
    pub fn on_sent_packet(&mut self, twcc_sn: u16, now: Instant) {
        let ext = extend_u16(Some(self.next_sn), twcc_sn);
        if let Some(r) = self.sends.iter_mut().rev().find(|r| r.twcc_sn == ext) {
            r.sent_at = Some(now);
        }
    }

    /// Consume inbound TWCC feedback and update the network status readout.
    pub fn on_received_rtcp(&mut self, twcc: Twcc, now: Instant) {
        let extend_from = self.last_acked_sn.unwrap_or(0);

        // Anchor the remote reference times at our first send time, which
        // is only used for spans, not absolute comparison.
        let time_zero = self
            .sends
            .front()
            .and_then(|r| r.sent_at.or(r.queued_at))
            .unwrap_or(now);

        let mut expected = 0_u64;
        let mut received = 0_u64;
        let mut acked_bytes = 0_u64;
        let mut first_send: Option<Instant> = None;
        let mut last_send: Option<Instant> = None;
        let mut first_remote: Option<Instant> = None;
        let mut last_remote: Option<Instant> = None;
        let mut newest_acked: Option<SendRecord> = None;

        for (seq, status, remote_time) in twcc.into_iter(time_zero, extend_from) {
            expected += 1;

            let Some(record) = self.sends.iter_mut().find(|r| r.twcc_sn == seq) else {
                continue;
            };

            match status {
                PacketStatus::NotReceived => {
                    record.lost = true;
                }
                _ => {
                    received += 1;
                    record.remote_recv_at = remote_time;
                    acked_bytes += record.size as u64;

                    let send_time = record.sent_at.or(record.queued_at);
                    if first_send.is_none() {
                        first_send = send_time;
                    }
                    last_send = send_time;
                    if first_remote.is_none() {
                        first_remote = remote_time;
                    }
                    last_remote = remote_time;
                    newest_acked = Some(*record);

                    self.last_acked_sn = Some(seq);
                }
            }
        }

        if expected > 0 {
            self.status.loss_rate = (expected - received) as f32 / expected as f32;
        }

        if let (Some(a), Some(b)) = (first_send, last_send) {
            let span = b.saturating_duration_since(a);
            if !span.is_zero() {
                self.status.bitrate_bps = acked_bytes * 8 * 1000 / span.as_millis().max(1) as u64;
            }
        }

        if let (Some(a), Some(b)) = (first_remote, last_remote) {
            let span = b.saturating_duration_since(a);
            if !span.is_zero() {
                self.status.delay_bitrate_bps =
                    acked_bytes * 8 * 1000 / span.as_millis().max(1) as u64;
            }
        }

        if let Some(r) = newest_acked {
            if let Some(sent) = r.sent_at.or(r.queued_at) {
                let rtt = now.saturating_duration_since(sent);
                self.status.rtt_ms = rtt.as_millis() as u32;
            }
        }
    }

    /// Current readout for a congestion controller.
    pub fn get_network_status(&self) -> NetworkStatus {
        self.status
    }
}
