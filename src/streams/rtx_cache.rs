use crate::packet::RtpPacket;
use crate::rtp::SeqNo;

/// How many packets the retransmit ring retains. Must cover the worst
/// case NACK window.
const RTX_CACHE_SIZE: usize = 1024;

/// Ring of recently sent packets keyed by their 16-bit output sequence.
///
/// Slots are addressed modulo the capacity, so entries older than the ring
/// are evicted in FIFO order simply by being overwritten.
#[derive(Debug)]
pub(crate) struct RtxCache {
    packets: Vec<Option<(SeqNo, RtpPacket)>>,
}

impl RtxCache {
    pub fn new() -> Self {
        let mut packets = Vec::with_capacity(RTX_CACHE_SIZE);
        packets.resize_with(RTX_CACHE_SIZE, || None);
        RtxCache { packets }
    }

    pub fn cache_sent_packet(&mut self, seq_no: SeqNo, packet: RtpPacket) {
        let slot = (*seq_no as usize) % self.packets.len();
        self.packets[slot] = Some((seq_no, packet));
    }

    /// Fetch a cached packet by its 16-bit wire sequence.
    pub fn get_cached_packet(&self, seq: u16) -> Option<(SeqNo, &RtpPacket)> {
        let slot = (seq as usize) % self.packets.len();
        let (seq_no, packet) = self.packets[slot].as_ref()?;
        if seq_no.as_u16() != seq {
            // the slot has been reused by a newer packet
            return None;
        }
        Some((*seq_no, packet))
    }

    pub fn clear(&mut self) {
        self.packets.iter_mut().for_each(|p| *p = None);
    }
}
