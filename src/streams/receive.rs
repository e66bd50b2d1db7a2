use std::time::Instant;

use crate::negotiate::TrackDescription;
use crate::packet::RtpPacket;
use crate::rtp::{extend_u16, Nack, NackEntry, ReceiverReport, Rrtr, SeqNo, Ssrc};
use crate::rtp::{ExtendedReport, ReportBlock};
use crate::util::{compact_ntp, duration_to_compact_ntp, now_ntp_64};

use super::{ReceiverRegister, TrackKind};

/// Inbound per-SSRC track on the publish side.
///
/// Tracks sequence/loss state for receiver reports and NACK generation,
/// and remembers the last sender report for LSR/DLSR.
#[derive(Debug)]
pub struct ReceiveTrack {
    kind: TrackKind,
    ssrc: Ssrc,
    rtx_ssrc: Option<Ssrc>,
    track_id: String,

    /// Set on first ever packet.
    register: Option<ReceiverRegister>,

    /// Last seen extended sequence, to undo the 16 bit truncation.
    last_ext_seq: Option<u64>,

    /// Last received sender report NTP and when we got it.
    last_sender_report: Option<(u64, Instant)>,

    /// RTT against the remote, from XR DLRR.
    rtt_ms: Option<u32>,

    /// Pending PLI to be relayed by the publish stream.
    pending_pli: bool,

    /// Cumulative in-counters.
    pub(crate) nn_packets: u64,
    pub(crate) nn_bytes: u64,
    pub(crate) nn_nacks: u64,
}

impl ReceiveTrack {
    pub fn new(desc: &TrackDescription) -> Self {
        ReceiveTrack {
            kind: desc.kind,
            ssrc: desc.ssrc,
            rtx_ssrc: desc.rtx_ssrc,
            track_id: desc.id.clone(),
            register: None,
            last_ext_seq: None,
            last_sender_report: None,
            rtt_ms: None,
            pending_pli: false,
            nn_packets: 0,
            nn_bytes: 0,
            nn_nacks: 0,
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn ssrc(&self) -> Ssrc {
        self.ssrc
    }

    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    /// Whether this track claims the SSRC, either primary or RTX.
    pub fn has_ssrc(&self, ssrc: Ssrc) -> bool {
        self.ssrc == ssrc || self.rtx_ssrc == Some(ssrc)
    }

    /// Account one inbound packet.
    pub fn on_rtp(&mut self, pkt: &RtpPacket, now: Instant) {
        let seq = extend_u16(self.last_ext_seq, pkt.header.sequence_number);
        self.last_ext_seq = Some(seq);
        let seq: SeqNo = seq.into();

        let register = self
            .register
            .get_or_insert_with(|| ReceiverRegister::new(seq));
        register.update_seq(seq);
        register.update_time(now, pkt.header.timestamp, self.kind.clock_rate());

        self.nn_packets += 1;
        self.nn_bytes += pkt.payload.byte_len() as u64;
    }

    /// Whether the register has missing packets to nack.
    pub fn has_nack_report(&self) -> bool {
        self.register
            .as_ref()
            .map(|r| r.has_nack_report())
            .unwrap_or(false)
    }

    /// Build NACKs for missing packets, at most 31 entries per packet.
    pub fn nack_reports(&mut self) -> Vec<Nack> {
        let Some(register) = self.register.as_mut() else {
            return vec![];
        };

        let entries = register.nack_reports();
        if entries.is_empty() {
            return vec![];
        }

        self.nn_nacks += entries.len() as u64;

        entries
            .chunks(31)
            .map(|chunk: &[NackEntry]| Nack {
                sender_ssrc: self.ssrc,
                ssrc: self.ssrc,
                reports: chunk.to_vec(),
            })
            .collect()
    }

    /// Build a receiver report with one report block for this SSRC.
    pub fn receiver_report(&mut self, now: Instant) -> Option<ReceiverReport> {
        let register = self.register.as_mut()?;

        let mut report = register.reception_report();
        report.ssrc = self.ssrc;

        if let Some((ntp, received_at)) = self.last_sender_report {
            report.last_sr_time = compact_ntp(ntp);
            let dlsr = now.saturating_duration_since(received_at);
            report.last_sr_delay = duration_to_compact_ntp(dlsr);
        }

        Some(ReceiverReport {
            sender_ssrc: self.ssrc,
            reports: vec![report],
        })
    }

    /// Build an XR with a Receiver Reference Time block (BT=4).
    pub fn xr_rrtr(&self) -> ExtendedReport {
        ExtendedReport {
            ssrc: self.ssrc,
            blocks: vec![ReportBlock::Rrtr(Rrtr {
                ntp_time: now_ntp_64(),
            })],
        }
    }

    /// Remember the sender report NTP for LSR/DLSR in subsequent RR/XR.
    pub fn update_sender_report(&mut self, ntp: u64, now: Instant) {
        self.last_sender_report = Some((ntp, now));
    }

    pub fn update_rtt(&mut self, rtt_ms: u32) {
        self.rtt_ms = Some(rtt_ms);
    }

    pub fn rtt_ms(&self) -> Option<u32> {
        self.rtt_ms
    }

    /// Flag a key-frame request to be relayed upstream. Only meaningful
    /// for video.
    pub fn request_keyframe(&mut self) {
        if self.kind == TrackKind::Video {
            self.pending_pli = true;
        }
    }

    /// Consume the pending PLI flag.
    pub fn take_pending_pli(&mut self) -> bool {
        std::mem::take(&mut self.pending_pli)
    }

    pub fn has_pending_pli(&self) -> bool {
        self.pending_pli
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::packet::RtpPayload;
    use crate::rtp::RtpHeader;

    fn desc(kind: TrackKind, ssrc: u32, rtx: Option<u32>) -> TrackDescription {
        let mut d = TrackDescription::for_test(kind, ssrc.into());
        d.rtx_ssrc = rtx.map(Into::into);
        d
    }

    fn packet(kind: TrackKind, ssrc: u32, seq: u16) -> RtpPacket {
        RtpPacket {
            kind,
            header: RtpHeader {
                ssrc: ssrc.into(),
                sequence_number: seq,
                timestamp: seq as u32 * 960,
                ..Default::default()
            },
            payload: RtpPayload::Raw(vec![0; 100]),
        }
    }

    #[test]
    fn ssrc_match_includes_rtx() {
        let t = ReceiveTrack::new(&desc(TrackKind::Video, 3000, Some(3001)));
        assert!(t.has_ssrc(3000.into()));
        assert!(t.has_ssrc(3001.into()));
        assert!(!t.has_ssrc(3002.into()));
    }

    #[test]
    fn rr_carries_lsr_dlsr() {
        let mut t = ReceiveTrack::new(&desc(TrackKind::Audio, 1001, None));
        let now = Instant::now();

        for seq in 0..5 {
            t.on_rtp(&packet(TrackKind::Audio, 1001, seq), now);
        }

        let ntp: u64 = 0x11223344_55667788;
        t.update_sender_report(ntp, now);

        let rr = t
            .receiver_report(now + std::time::Duration::from_millis(500))
            .unwrap();
        assert_eq!(rr.reports.len(), 1);
        let block = rr.reports[0];
        assert_eq!(block.ssrc, 1001.into());
        assert_eq!(block.last_sr_time, 0x3344_5566);
        // 500ms in 16.16: 0x8000
        assert_eq!(block.last_sr_delay, 0x8000);
    }

    #[test]
    fn keyframe_request_only_for_video() {
        let mut audio = ReceiveTrack::new(&desc(TrackKind::Audio, 1, None));
        audio.request_keyframe();
        assert!(!audio.has_pending_pli());

        let mut video = ReceiveTrack::new(&desc(TrackKind::Video, 2, None));
        video.request_keyframe();
        assert!(video.has_pending_pli());
        assert!(video.take_pending_pli());
        assert!(!video.has_pending_pli());
    }

    #[test]
    fn sequence_wrap_keeps_highest_monotone() {
        let mut t = ReceiveTrack::new(&desc(TrackKind::Audio, 1, None));
        let now = Instant::now();

        for seq in [65_533_u16, 65_534, 65_535, 0, 1] {
            t.on_rtp(&packet(TrackKind::Audio, 1, seq), now);
        }

        let rr = t.receiver_report(now).unwrap();
        // extended highest: one rollover + 1
        assert_eq!(rr.reports[0].max_seq, 65_536 + 1);
        assert!(!t.has_nack_report());
    }
}
