use super::{read_ssrc, RtcpError, RtcpHeader, RtcpPacket, RtcpType};
use crate::rtp::Ssrc;

/// Picture loss indication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pli {
    /// Sender of this feedback.
    pub sender_ssrc: Ssrc,
    /// The SSRC this picture loss indication is for.
    pub ssrc: Ssrc,
}

impl RtcpPacket for Pli {
    fn header(&self) -> RtcpHeader {
        RtcpHeader {
            rtcp_type: RtcpType::PayloadSpecificFeedback,
            fmt: 1,
            words_less_one: (self.length_words() - 1) as u16,
        }
    }

    fn length_words(&self) -> usize {
        // header
        // sender SSRC
        // media SSRC
        3
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        self.header().write_to(&mut buf[..4]);
        buf[4..8].copy_from_slice(&self.sender_ssrc.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        12
    }
}

impl Pli {
    pub(crate) fn parse(buf: &[u8]) -> Result<Pli, RtcpError> {
        if buf.len() < 8 {
            return Err(RtcpError::InvalidLength(
                RtcpType::PayloadSpecificFeedback as u8,
                buf.len(),
            ));
        }

        let sender_ssrc = read_ssrc(buf, 0);
        let ssrc = read_ssrc(buf, 4);

        Ok(Pli { sender_ssrc, ssrc })
    }
}
