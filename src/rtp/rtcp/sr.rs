use super::{read_ssrc, ReceptionReport, RtcpError, RtcpHeader, RtcpPacket, RtcpType};
use crate::rtp::Ssrc;

/// A report of packets sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderReport {
    /// Information about the sender of this report.
    pub sender_info: SenderInfo,
    /// A sender report is implicitly also a receiver report. This might
    /// hold data that would otherwise come in a separate RR.
    pub reports: Vec<ReceptionReport>,
}

/// Information about a stream being sent.
///
/// See [RFC 3550 6.4.1](https://www.rfc-editor.org/rfc/rfc3550#section-6.4.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderInfo {
    /// The SSRC of the SR originator.
    pub ssrc: Ssrc,
    /// 64 bit NTP timestamp (32.32 fixed point).
    pub ntp_time: u64,
    /// The RTP timestamp corresponding to the same instant as `ntp_time`.
    pub rtp_time: u32,
    /// Total packets the sender had sent when this was generated.
    pub sender_packet_count: u32,
    /// Total payload octets the sender had sent when this was generated.
    pub sender_octet_count: u32,
}

impl RtcpPacket for SenderReport {
    fn header(&self) -> RtcpHeader {
        RtcpHeader {
            rtcp_type: RtcpType::SenderReport,
            fmt: self.reports.len() as u8,
            words_less_one: (self.length_words() - 1) as u16,
        }
    }

    fn length_words(&self) -> usize {
        // header: 1, sender info: 6, reports: x 6
        1 + 6 + 6 * self.reports.len()
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        self.header().write_to(buf);

        self.sender_info.write_to(&mut buf[4..]);

        for (i, r) in self.reports.iter().enumerate() {
            r.write_to(&mut buf[28 + i * 24..]);
        }

        self.length_words() * 4
    }
}

impl SenderInfo {
    fn write_to(&self, buf: &mut [u8]) {
        buf[..4].copy_from_slice(&self.ssrc.to_be_bytes());
        buf[4..12].copy_from_slice(&self.ntp_time.to_be_bytes());
        buf[12..16].copy_from_slice(&self.rtp_time.to_be_bytes());
        buf[16..20].copy_from_slice(&self.sender_packet_count.to_be_bytes());
        buf[20..24].copy_from_slice(&self.sender_octet_count.to_be_bytes());
    }
}

impl SenderReport {
    /// Parse the body (after the common header).
    ///
    /// The original wire check: `(length + 1) * 4 == RC * 24 + 28`.
    pub(crate) fn parse(header: &RtcpHeader, buf: &[u8]) -> Result<SenderReport, RtcpError> {
        let rc = header.fmt as usize;

        if header.length_bytes() != rc * 24 + 28 {
            return Err(RtcpError::InvalidSemantics("sender report length vs rc"));
        }
        if buf.len() < 24 + rc * 24 {
            return Err(RtcpError::InvalidLength(
                RtcpType::SenderReport as u8,
                buf.len(),
            ));
        }

        let sender_info = SenderInfo {
            ssrc: read_ssrc(buf, 0),
            ntp_time: u64::from_be_bytes(buf[4..12].try_into().unwrap()),
            rtp_time: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
            sender_packet_count: u32::from_be_bytes(buf[16..20].try_into().unwrap()),
            sender_octet_count: u32::from_be_bytes(buf[20..24].try_into().unwrap()),
        };

        let mut reports = Vec::with_capacity(rc);
        let mut buf = &buf[24..];
        for _ in 0..rc {
            reports.push(ReceptionReport::parse(buf)?);
            buf = &buf[24..];
        }

        Ok(SenderReport {
            sender_info,
            reports,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip_with_report_block() {
        let sr = SenderReport {
            sender_info: SenderInfo {
                ssrc: 1001.into(),
                ntp_time: 0x0102_0304_0506_0708,
                rtp_time: 90_000,
                sender_packet_count: 5,
                sender_octet_count: 6,
            },
            reports: vec![ReceptionReport {
                ssrc: 2002.into(),
                fraction_lost: 3,
                packets_lost: 1234,
                max_seq: 4000,
                jitter: 5,
                last_sr_time: 12,
                last_sr_delay: 1,
            }],
        };

        let mut buf = vec![0_u8; sr.length_words() * 4];
        let n = sr.write_to(&mut buf);
        assert_eq!(n, 52); // 28 + 24

        let header = RtcpHeader {
            rtcp_type: RtcpType::SenderReport,
            fmt: 1,
            words_less_one: (n / 4 - 1) as u16,
        };
        let back = SenderReport::parse(&header, &buf[4..]).unwrap();
        assert_eq!(back, sr);
    }
}
