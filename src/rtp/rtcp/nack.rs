use super::{read_ssrc, RtcpError, RtcpHeader, RtcpPacket, RtcpType};
use crate::rtp::Ssrc;

/// A NACK indicating packets missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nack {
    /// Sender of this feedback.
    pub sender_ssrc: Ssrc,
    /// The SSRC this nack reports missing packets for.
    pub ssrc: Ssrc,
    /// The missing sequence ranges. This can be multiple segments.
    pub reports: Vec<NackEntry>,
}

/// A range of sequence numbers missing.
///
/// The set of missing numbers is `{pid}` plus `{pid + i + 1}` for every bit
/// `i` set in `blp`.
#[allow(missing_docs)]
#[derive(Debug, PartialEq, Eq, Default, Clone, Copy)]
pub struct NackEntry {
    pub pid: u16,
    pub blp: u16,
}

impl RtcpPacket for Nack {
    fn header(&self) -> RtcpHeader {
        RtcpHeader {
            rtcp_type: RtcpType::TransportLayerFeedback,
            fmt: 1,
            words_less_one: (self.length_words() - 1) as u16,
        }
    }

    fn length_words(&self) -> usize {
        // header
        // sender SSRC
        // media SSRC
        // 1 word per entry
        1 + 2 + self.reports.len()
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        self.header().write_to(&mut buf[..4]);
        buf[4..8].copy_from_slice(&self.sender_ssrc.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        let mut buf = &mut buf[12..];
        for r in &self.reports {
            buf[0..2].copy_from_slice(&r.pid.to_be_bytes());
            buf[2..4].copy_from_slice(&r.blp.to_be_bytes());
            buf = &mut buf[4..];
        }
        self.length_words() * 4
    }
}

impl Nack {
    pub(crate) fn parse(buf: &[u8]) -> Result<Nack, RtcpError> {
        if buf.len() < 12 {
            return Err(RtcpError::InvalidLength(
                RtcpType::TransportLayerFeedback as u8,
                buf.len(),
            ));
        }

        let sender_ssrc = read_ssrc(buf, 0);
        let ssrc = read_ssrc(buf, 4);

        let mut reports = Vec::new();

        let mut buf = &buf[8..];
        let count = buf.len() / 4;
        let max = count.min(31);

        for _ in 0..max {
            let pid = u16::from_be_bytes([buf[0], buf[1]]);
            let blp = u16::from_be_bytes([buf[2], buf[3]]);
            reports.push(NackEntry { pid, blp });
            buf = &buf[4..];
        }

        Ok(Nack {
            sender_ssrc,
            ssrc,
            reports,
        })
    }
}

impl NackEntry {
    /// Iterator over the 16-bit sequence numbers missing.
    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        let pid = self.pid;
        let blp = self.blp;
        std::iter::once(pid).chain(
            (0..16_u16)
                .filter(move |i| blp & (1 << i) > 0)
                .map(move |i| pid.wrapping_add(i + 1)),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn entry_iter_honors_blp() {
        let entry = NackEntry {
            pid: 100,
            blp: 0b1000_0000_0000_1001,
        };

        let seqs: Vec<_> = entry.iter().collect();
        assert_eq!(seqs, vec![100, 101, 104, 116]);
    }

    #[test]
    fn entry_iter_wraps() {
        let entry = NackEntry {
            pid: 65_535,
            blp: 0b1,
        };

        let seqs: Vec<_> = entry.iter().collect();
        assert_eq!(seqs, vec![65_535, 0]);
    }

    #[test]
    fn roundtrip() {
        let nack = Nack {
            sender_ssrc: 1.into(),
            ssrc: 2.into(),
            reports: vec![NackEntry {
                pid: 100,
                blp: 0x00ff,
            }],
        };

        let mut buf = vec![0_u8; nack.length_words() * 4];
        nack.write_to(&mut buf);

        let back = Nack::parse(&buf[4..]).unwrap();
        assert_eq!(back, nack);
    }
}
