use super::{read_ssrc, RtcpError, RtcpHeader, RtcpPacket, RtcpType};
use crate::rtp::Ssrc;

/// A receiver report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverReport {
    /// Sender of this feedback.
    pub sender_ssrc: Ssrc,
    /// The individual reports for received SSRC.
    pub reports: Vec<ReceptionReport>,
}

/// An individual report of reception.
///
/// See [RFC 3550 6.4.2](https://www.rfc-editor.org/rfc/rfc3550#section-6.4.2)
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceptionReport {
    pub ssrc: Ssrc,
    pub fraction_lost: u8,
    /// 24 bit two's complement, clamped.
    pub packets_lost: u32,
    /// Extended highest sequence number received.
    pub max_seq: u32,
    pub jitter: u32,
    pub last_sr_time: u32,
    pub last_sr_delay: u32,
}

impl RtcpPacket for ReceiverReport {
    fn header(&self) -> RtcpHeader {
        RtcpHeader {
            rtcp_type: RtcpType::ReceiverReport,
            fmt: self.reports.len() as u8,
            words_less_one: (self.length_words() - 1) as u16,
        }
    }

    fn length_words(&self) -> usize {
        // header: 1, sender SSRC: 1, reports: x 6
        1 + 1 + 6 * self.reports.len()
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        self.header().write_to(buf);

        buf[4..8].copy_from_slice(&self.sender_ssrc.to_be_bytes());

        for (i, r) in self.reports.iter().enumerate() {
            r.write_to(&mut buf[8 + i * 24..]);
        }

        self.length_words() * 4
    }
}

impl ReceiverReport {
    /// Parse the body (after the common header).
    ///
    /// The original wire check: `(length + 1) * 4 == RC * 24 + 8`.
    pub(crate) fn parse(header: &RtcpHeader, buf: &[u8]) -> Result<ReceiverReport, RtcpError> {
        let rc = header.fmt as usize;

        if header.length_bytes() != rc * 24 + 8 {
            return Err(RtcpError::InvalidSemantics("receiver report length vs rc"));
        }
        if buf.len() < 4 + rc * 24 {
            return Err(RtcpError::InvalidLength(
                RtcpType::ReceiverReport as u8,
                buf.len(),
            ));
        }

        let sender_ssrc = read_ssrc(buf, 0);

        let mut reports = Vec::with_capacity(rc);
        let mut buf = &buf[4..];
        for _ in 0..rc {
            reports.push(ReceptionReport::parse(buf)?);
            buf = &buf[24..];
        }

        Ok(ReceiverReport {
            sender_ssrc,
            reports,
        })
    }
}

impl ReceptionReport {
    pub(crate) fn write_to(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.ssrc.to_be_bytes());
        buf[4..8].copy_from_slice(&self.packets_lost.to_be_bytes());
        buf[4] = self.fraction_lost;
        buf[8..12].copy_from_slice(&self.max_seq.to_be_bytes());
        buf[12..16].copy_from_slice(&self.jitter.to_be_bytes());
        buf[16..20].copy_from_slice(&self.last_sr_time.to_be_bytes());
        buf[20..24].copy_from_slice(&self.last_sr_delay.to_be_bytes());
    }

    pub(crate) fn parse(buf: &[u8]) -> Result<ReceptionReport, RtcpError> {
        if buf.len() < 24 {
            return Err(RtcpError::InvalidLength(0, buf.len()));
        }

        let ssrc = read_ssrc(buf, 0);
        let fraction_lost = buf[4];
        let packets_lost = u32::from_be_bytes([0, buf[5], buf[6], buf[7]]);
        let max_seq = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let jitter = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
        let last_sr_time = u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]);
        let last_sr_delay = u32::from_be_bytes([buf[20], buf[21], buf[22], buf[23]]);

        Ok(ReceptionReport {
            ssrc,
            fraction_lost,
            packets_lost,
            max_seq,
            jitter,
            last_sr_time,
            last_sr_delay,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip() {
        let rr = ReceiverReport {
            sender_ssrc: 42.into(),
            reports: vec![ReceptionReport {
                ssrc: 3.into(),
                fraction_lost: 8,
                packets_lost: 0x00_0a_0b_0c,
                max_seq: 0x0102_0304,
                jitter: 77,
                last_sr_time: 0xdead_beef,
                last_sr_delay: 65_536,
            }],
        };

        let mut buf = vec![0_u8; rr.length_words() * 4];
        rr.write_to(&mut buf);

        let header = RtcpHeader {
            rtcp_type: RtcpType::ReceiverReport,
            fmt: 1,
            words_less_one: (rr.length_words() - 1) as u16,
        };
        let back = ReceiverReport::parse(&header, &buf[4..]).unwrap();
        assert_eq!(back, rr);
    }
}
