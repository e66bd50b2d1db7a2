use crate::negotiate::TrackDescription;
use crate::packet::RtpPacket;
use crate::rtp::{Pt, SeqNo, Ssrc};

use super::{RtxCache, TrackKind};

/// Outbound per-SSRC track on the play side.
///
/// Re-stamps packets from the shared fan-out with this track's SSRC and a
/// strictly monotone sequence, and keeps a ring of sent packets for NACK.
#[derive(Debug)]
pub struct SendTrack {
    kind: TrackKind,
    ssrc: Ssrc,
    rtx_ssrc: Option<Ssrc>,
    pt: Pt,
    track_id: String,

    /// Output sequence counter (extended). Wire value is the low 16 bits.
    next_seq: SeqNo,

    /// Whether on_rtp emits or drops.
    active: bool,

    /// Ring of sent packets for NACK responses.
    rtx_cache: RtxCache,

    pub(crate) nn_packets: u64,
    pub(crate) nn_bytes: u64,
    pub(crate) nn_retransmits: u64,
}

impl SendTrack {
    pub fn new(desc: &TrackDescription) -> Self {
        debug!("Create SendTrack for SSRC: {}", desc.ssrc);

        SendTrack {
            kind: desc.kind,
            ssrc: desc.ssrc,
            rtx_ssrc: desc.rtx_ssrc,
            pt: desc.media.pt,
            track_id: desc.id.clone(),
            next_seq: SeqNo::default(),
            active: false,
            rtx_cache: RtxCache::new(),
            nn_packets: 0,
            nn_bytes: 0,
            nn_retransmits: 0,
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

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Toggle whether `on_rtp` emits or drops.
    pub fn set_track_status(&mut self, active: bool) {
        if self.active != active {
            debug!(
                "SendTrack {} SSRC={} active={}",
                self.track_id, self.ssrc, active
            );
        }
        self.active = active;
    }

    /// Stamp an outbound packet with this track's identity and cache it
    /// for retransmission. Returns `None` when the track is inactive.
    ///
    /// The returned extended sequence doubles as the SRTP index.
    pub fn on_rtp(&mut self, mut pkt: RtpPacket) -> Option<(RtpPacket, SeqNo)> {
        if !self.active {
            return None;
        }

        let seq = self.next_seq.inc();

        pkt.header.ssrc = self.ssrc;
        pkt.header.payload_type = self.pt;
        pkt.header.sequence_number = seq.as_u16();

        self.nn_packets += 1;
        self.nn_bytes += pkt.payload.byte_len() as u64;

        self.rtx_cache.cache_sent_packet(seq, pkt.clone());

        Some((pkt, seq))
    }

    /// Fetch a previously sent packet for a NACK response.
    pub fn fetch_rtp_packet(&mut self, seq: u16) -> Option<(RtpPacket, SeqNo)> {
        let (seq_no, pkt) = self.rtx_cache.get_cached_packet(seq)?;
        self.nn_retransmits += 1;
        Some((pkt.clone(), seq_no))
    }

    /// Drop the retransmit ring, e.g. on a stream switch.
    pub fn clear_cache(&mut self) {
        self.rtx_cache.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::packet::RtpPayload;
    use crate::rtp::RtpHeader;

    fn desc(ssrc: u32) -> TrackDescription {
        TrackDescription::for_test(TrackKind::Video, ssrc.into())
    }

    fn source_packet(source_ssrc: u32, seq: u16) -> RtpPacket {
        RtpPacket {
            kind: TrackKind::Video,
            header: RtpHeader {
                ssrc: source_ssrc.into(),
                sequence_number: seq,
                ..Default::default()
            },
            payload: RtpPayload::Raw(vec![1, 2, 3]),
        }
    }

    #[test]
    fn inactive_drops() {
        let mut t = SendTrack::new(&desc(5000));
        assert!(t.on_rtp(source_packet(3000, 7)).is_none());

        t.set_track_status(true);
        assert!(t.on_rtp(source_packet(3000, 8)).is_some());
    }

    #[test]
    fn output_seq_is_monotone_and_restamped() {
        let mut t = SendTrack::new(&desc(5000));
        t.set_track_status(true);

        let mut prev: Option<u16> = None;
        // source sequence numbers are all over the place
        for seq in [100_u16, 5, 70, 65_535, 3] {
            let (pkt, _) = t.on_rtp(source_packet(3000, seq)).unwrap();
            assert_eq!(*pkt.header.ssrc, 5000);
            if let Some(p) = prev {
                assert_eq!(pkt.header.sequence_number, p.wrapping_add(1));
            }
            prev = Some(pkt.header.sequence_number);
        }
    }

    #[test]
    fn nack_fetch_returns_cached() {
        let mut t = SendTrack::new(&desc(5000));
        t.set_track_status(true);

        let mut sent = vec![];
        for seq in 0..10_u16 {
            let (pkt, _) = t.on_rtp(source_packet(3000, seq)).unwrap();
            sent.push(pkt);
        }

        let wire_seq = sent[4].header.sequence_number;
        let (pkt, seq_no) = t.fetch_rtp_packet(wire_seq).unwrap();
        assert_eq!(pkt, sent[4]);
        assert_eq!(seq_no.as_u16(), wire_seq);

        // never sent -> nothing cached
        assert!(t.fetch_rtp_packet(wire_seq.wrapping_add(999)).is_none());
    }
}
