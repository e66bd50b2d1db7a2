use super::{read_ssrc, RtcpError, RtcpHeader, RtcpPacket, RtcpType};
use crate::rtp::Ssrc;

//   0                   1                   2                   3
//   0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//   |V=2|P|reserved |   PT=XR=207   |             length            |
//   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//   |                              SSRC                             |
//   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//   :                         report blocks                         :
//   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+

/// Extended receiver report (XR).
///
/// RFC 3611: <https://datatracker.ietf.org/doc/html/rfc3611>
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedReport {
    /// The SSRC this report is for.
    pub ssrc: Ssrc,
    /// The blocks reported.
    pub blocks: Vec<ReportBlock>,
}

/// Parts of an extended report XR.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ReportBlock {
    Rrtr(Rrtr),
    Dlrr(Dlrr),
}

/// Receiver Reference Time Report Block (BT=4, block length 2).
///
/// <https://datatracker.ietf.org/doc/html/rfc3611#section-4.4>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rrtr {
    /// 64 bit NTP timestamp (32.32 fixed point).
    pub ntp_time: u64,
}

/// DLRR Report Block (BT=5).
///
/// <https://datatracker.ietf.org/doc/html/rfc3611#section-4.5>
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dlrr {
    pub items: Vec<DlrrItem>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DlrrItem {
    pub ssrc: Ssrc,
    pub last_rr_time: u32,
    pub last_rr_delay: u32,
}

impl RtcpPacket for ExtendedReport {
    fn header(&self) -> RtcpHeader {
        RtcpHeader {
            rtcp_type: RtcpType::ExtendedReport,
            fmt: 0,
            words_less_one: (self.length_words() - 1) as u16,
        }
    }

    fn length_words(&self) -> usize {
        let header = 1;
        let ssrc = 1;
        let blocks: usize = self.blocks.iter().map(|b| b.len() / 4).sum();
        header + ssrc + blocks
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        let mut len = self.header().write_to(buf);

        buf[4..8].copy_from_slice(&self.ssrc.to_be_bytes());
        len += 4;

        for block in self.blocks.iter() {
            len += match block {
                ReportBlock::Rrtr(b) => b.write_to(&mut buf[len..]),
                ReportBlock::Dlrr(b) => b.write_to(&mut buf[len..]),
            };
        }

        len
    }
}

impl ReportBlock {
    pub(crate) fn len(&self) -> usize {
        match self {
            Self::Rrtr(_) => Rrtr::len(),
            Self::Dlrr(v) => v.len(),
        }
    }
}

impl Rrtr {
    fn write_to(&self, buf: &mut [u8]) -> usize {
        // block type
        buf[0] = 4_u8;
        // reserved
        buf[1] = 0_u8;
        // block length
        buf[2..4].copy_from_slice(&2_u16.to_be_bytes());

        buf[4..12].copy_from_slice(&self.ntp_time.to_be_bytes());

        12
    }

    fn len() -> usize {
        12
    }
}

impl Dlrr {
    fn write_to(&self, buf: &mut [u8]) -> usize {
        // block type
        buf[0] = 5_u8;
        // reserved
        buf[1] = 0_u8;
        // block length in words
        let len: u16 = self.items.len() as u16 * 3;
        buf[2..4].copy_from_slice(&len.to_be_bytes());

        let mut buf = &mut buf[4..];

        for item in self.items.iter() {
            buf[0..4].copy_from_slice(&item.ssrc.to_be_bytes());
            buf[4..8].copy_from_slice(&item.last_rr_time.to_be_bytes());
            buf[8..12].copy_from_slice(&item.last_rr_delay.to_be_bytes());
            buf = &mut buf[12..];
        }

        self.len()
    }

    fn len(&self) -> usize {
        4 + self.items.len() * 12
    }
}

impl ExtendedReport {
    pub(crate) fn parse(buf: &[u8]) -> Result<ExtendedReport, RtcpError> {
        if buf.len() < 4 {
            return Err(RtcpError::InvalidLength(
                RtcpType::ExtendedReport as u8,
                buf.len(),
            ));
        }

        let ssrc = read_ssrc(buf, 0);

        let mut blocks: Vec<ReportBlock> = Vec::new();
        let mut buf = &buf[4..];

        while buf.len() >= 4 {
            let block_type = buf[0];
            let block_len = (u16::from_be_bytes([buf[2], buf[3]]) as usize + 1) * 4;

            if block_len > buf.len() {
                return Err(RtcpError::InvalidSemantics("XR block length overruns"));
            }

            match block_type {
                4 => blocks.push(ReportBlock::Rrtr(Rrtr::parse(&buf[..block_len])?)),
                5 => blocks.push(ReportBlock::Dlrr(Dlrr::parse(&buf[..block_len])?)),
                _ => {
                    // unknown block types are skipped by their declared length
                    trace!("Skip XR block type: {}", block_type);
                }
            }

            buf = &buf[block_len..];
        }

        Ok(ExtendedReport { ssrc, blocks })
    }
}

impl Rrtr {
    fn parse(buf: &[u8]) -> Result<Rrtr, RtcpError> {
        if buf.len() < 12 {
            return Err(RtcpError::InvalidSemantics("RRTR block too short"));
        }

        let ntp_time = u64::from_be_bytes(buf[4..12].try_into().unwrap());

        Ok(Rrtr { ntp_time })
    }
}

impl Dlrr {
    fn parse(buf: &[u8]) -> Result<Dlrr, RtcpError> {
        if buf.len() < 4 {
            return Err(RtcpError::InvalidSemantics("DLRR block too short"));
        }

        let blocks = (buf.len() - 4) / 12;
        let mut items: Vec<DlrrItem> = Vec::with_capacity(blocks);

        let mut buf = &buf[4..];

        for _ in 0..blocks {
            let ssrc = read_ssrc(buf, 0);
            let last_rr_time = u32::from_be_bytes(buf[4..8].try_into().unwrap());
            let last_rr_delay = u32::from_be_bytes(buf[8..12].try_into().unwrap());
            items.push(DlrrItem {
                ssrc,
                last_rr_time,
                last_rr_delay,
            });
            buf = &buf[12..];
        }

        Ok(Dlrr { items })
    }
}
