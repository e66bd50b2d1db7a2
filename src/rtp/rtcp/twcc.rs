use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use super::{read_ssrc, RtcpError, RtcpHeader, RtcpPacket, RtcpType};
use crate::rtp::{extend_u16, Ssrc};

/// Transport Wide Congestion Control feedback
/// (draft-holmer-rmcat-transport-wide-cc-extensions-01, PT 205 fmt 15).
#[derive(Clone, PartialEq, Eq)]
pub struct Twcc {
    /// Sender of this feedback.
    pub sender_ssrc: Ssrc,
    /// The media SSRC this report nominally is for.
    pub ssrc: Ssrc,
    /// First transport sequence number covered.
    pub base_seq: u16,
    /// Number of reported statuses.
    pub status_count: u16,
    /// Time this report was produced, in 64 ms steps (24 bit).
    pub reference_time: u32,
    /// Increasing counter for each TWCC. For deduping.
    pub feedback_count: u8,
    /// Status chunks.
    pub chunks: VecDeque<PacketChunk>,
    /// Receive time deltas for the received statuses.
    pub delta: VecDeque<Delta>,
}

/// One status chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketChunk {
    /// Run of a single status. (status, run length up to 8191)
    Run(PacketStatus, u16),
    /// 14 one-bit symbols: received-small-delta or not.
    VectorSingle(u16, u16),
    /// 7 two-bit symbols.
    VectorDouble(u16, u16),
}

/// Per packet status in a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketStatus {
    NotReceived = 0b00,
    ReceivedSmallDelta = 0b01,
    ReceivedLargeOrNegativeDelta = 0b10,
    Unknown = 0b11,
}

impl From<u8> for PacketStatus {
    fn from(v: u8) -> Self {
        match v {
            0b00 => PacketStatus::NotReceived,
            0b01 => PacketStatus::ReceivedSmallDelta,
            0b10 => PacketStatus::ReceivedLargeOrNegativeDelta,
            _ => PacketStatus::Unknown,
        }
    }
}

/// Receive time delta in 250 us units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delta {
    /// 0 - 63.75 ms, one byte.
    Small(u8),
    /// Negative or up to 8191.75 ms, two bytes.
    Large(i16),
}

impl Delta {
    fn byte_len(&self) -> usize {
        match self {
            Delta::Small(_) => 1,
            Delta::Large(_) => 2,
        }
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        match self {
            Delta::Small(v) => {
                buf[0] = *v;
                1
            }
            Delta::Large(v) => {
                buf[0..2].copy_from_slice(&v.to_be_bytes());
                2
            }
        }
    }
}

impl PacketChunk {
    fn write_to(&self, buf: &mut [u8]) {
        let v: u16 = match self {
            PacketChunk::Run(status, len) => {
                assert!(*len <= 0x1fff);
                ((*status as u16) << 13) | len
            }
            PacketChunk::VectorSingle(bits, _) => 0x8000 | bits,
            PacketChunk::VectorDouble(bits, _) => 0xc000 | bits,
        };
        buf[0..2].copy_from_slice(&v.to_be_bytes());
    }

    /// How many symbols this chunk covers.
    fn symbol_count(&self) -> u16 {
        match self {
            PacketChunk::Run(_, n) => *n,
            PacketChunk::VectorSingle(_, n) => *n,
            PacketChunk::VectorDouble(_, n) => *n,
        }
    }
}

impl Twcc {
    fn chunks_byte_len(&self) -> usize {
        self.chunks.len() * 2
    }

    fn delta_byte_len(&self) -> usize {
        self.delta.iter().map(|d| d.byte_len()).sum()
    }

    /// Iterate over the reported sequences, resolving receive times.
    ///
    /// `time_zero` anchors the 24-bit reference time; `extend_from` is a
    /// nearby extended sequence number used to undo the 16 bit truncation.
    pub fn into_iter(self, time_zero: Instant, extend_from: u64) -> TwccIter {
        let millis = self.reference_time as u64 * 64;
        let time_base = time_zero + Duration::from_millis(millis);
        let base_seq = extend_u16(Some(extend_from), self.base_seq);
        let last_seq = base_seq + self.status_count as u64;

        TwccIter {
            base_seq,
            last_seq,
            time_base,
            index: 0,
            twcc: self,
        }
    }

    pub(crate) fn parse(buf: &[u8]) -> Result<Twcc, RtcpError> {
        if buf.len() < 16 {
            return Err(RtcpError::InvalidLength(
                RtcpType::TransportLayerFeedback as u8,
                buf.len(),
            ));
        }

        let sender_ssrc = read_ssrc(buf, 0);
        let ssrc = read_ssrc(buf, 4);
        let base_seq = u16::from_be_bytes([buf[8], buf[9]]);
        let status_count = u16::from_be_bytes([buf[10], buf[11]]);
        let reference_time = u32::from_be_bytes([0, buf[12], buf[13], buf[14]]);
        let feedback_count = buf[15];

        let mut chunks = VecDeque::new();
        let mut delta = VecDeque::new();

        let mut todo = status_count;
        let mut statuses: Vec<PacketStatus> = Vec::with_capacity(status_count as usize);
        let mut buf = &buf[16..];

        while todo > 0 {
            if buf.len() < 2 {
                return Err(RtcpError::InvalidSemantics("twcc chunks out of data"));
            }
            let v = u16::from_be_bytes([buf[0], buf[1]]);
            buf = &buf[2..];

            let chunk = if v & 0x8000 == 0 {
                // run length chunk
                let status = PacketStatus::from(((v >> 13) & 0b11) as u8);
                let len = (v & 0x1fff).min(todo);
                for _ in 0..len {
                    statuses.push(status);
                }
                PacketChunk::Run(status, len)
            } else if v & 0x4000 == 0 {
                // one bit vector
                let n = 14.min(todo);
                for i in 0..n {
                    let received = v & (1 << (13 - i)) > 0;
                    statuses.push(if received {
                        PacketStatus::ReceivedSmallDelta
                    } else {
                        PacketStatus::NotReceived
                    });
                }
                PacketChunk::VectorSingle(v & 0x3fff, n)
            } else {
                // two bit vector
                let n = 7.min(todo);
                for i in 0..n {
                    let e = ((v >> (12 - i * 2)) & 0b11) as u8;
                    statuses.push(PacketStatus::from(e));
                }
                PacketChunk::VectorDouble(v & 0x3fff, n)
            };

            todo -= chunk.symbol_count().min(todo);
            chunks.push_back(chunk);
        }

        for status in &statuses {
            match status {
                PacketStatus::ReceivedSmallDelta => {
                    if buf.is_empty() {
                        return Err(RtcpError::InvalidSemantics("twcc deltas out of data"));
                    }
                    delta.push_back(Delta::Small(buf[0]));
                    buf = &buf[1..];
                }
                PacketStatus::ReceivedLargeOrNegativeDelta => {
                    if buf.len() < 2 {
                        return Err(RtcpError::InvalidSemantics("twcc deltas out of data"));
                    }
                    delta.push_back(Delta::Large(i16::from_be_bytes([buf[0], buf[1]])));
                    buf = &buf[2..];
                }
                _ => {}
            }
        }

        Ok(Twcc {
            sender_ssrc,
            ssrc,
            base_seq,
            status_count,
            reference_time,
            feedback_count,
            chunks,
            delta,
        })
    }
}

impl RtcpPacket for Twcc {
    fn header(&self) -> RtcpHeader {
        RtcpHeader {
            rtcp_type: RtcpType::TransportLayerFeedback,
            fmt: 15,
            words_less_one: (self.length_words() - 1) as u16,
        }
    }

    fn length_words(&self) -> usize {
        // header: 1
        // sender ssrc: 1
        // ssrc: 1
        // base seq + status count: 1
        // ref time + feedback count: 1
        // chunks byte len + delta byte len + padding

        let mut total = self.chunks_byte_len() + self.delta_byte_len();

        let pad = 4 - total % 4;
        if pad < 4 {
            total += pad;
        }

        assert!(total % 4 == 0);

        5 + total / 4
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        let mut total = {
            self.header().write_to(buf);
            buf[4..8].copy_from_slice(&self.sender_ssrc.to_be_bytes());
            buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

            buf[12..14].copy_from_slice(&self.base_seq.to_be_bytes());
            buf[14..16].copy_from_slice(&self.status_count.to_be_bytes());

            let ref_time = self.reference_time.to_be_bytes();
            buf[16..19].copy_from_slice(&ref_time[1..4]);
            buf[19] = self.feedback_count;

            let mut off = 20;
            for p in &self.chunks {
                p.write_to(&mut buf[off..]);
                off += 2;
            }

            for d in &self.delta {
                off += d.write_to(&mut buf[off..]);
            }

            off
        };

        let pad = 4 - total % 4;
        if pad < 4 {
            for i in 0..pad {
                buf[total + i] = 0;
            }
            buf[total + pad - 1] = pad as u8;

            total += pad;
            // Toggle padding bit
            buf[0] |= 0b00_1_00000;
        }

        total
    }
}

/// Iterator over (extended seq, status, receive time).
pub struct TwccIter {
    base_seq: u64,
    last_seq: u64,
    time_base: Instant,
    index: usize,
    twcc: Twcc,
}

impl Iterator for TwccIter {
    type Item = (u64, PacketStatus, Option<Instant>);

    fn next(&mut self) -> Option<Self::Item> {
        let seq = self.base_seq + self.index as u64;

        if seq == self.last_seq {
            return None;
        }

        let head = self.twcc.chunks.front()?;

        let (status, amount) = match head {
            PacketChunk::Run(s, n) => {
                use PacketStatus::*;
                let status = match s {
                    NotReceived | Unknown => NotReceived,
                    ReceivedSmallDelta => ReceivedSmallDelta,
                    ReceivedLargeOrNegativeDelta => ReceivedLargeOrNegativeDelta,
                };
                (status, *n)
            }
            PacketChunk::VectorSingle(v, n) => {
                let status = if 1 << (13 - self.index) & v > 0 {
                    PacketStatus::ReceivedSmallDelta
                } else {
                    PacketStatus::NotReceived
                };
                (status, *n)
            }
            PacketChunk::VectorDouble(v, n) => {
                let e = ((v >> (12 - self.index * 2)) & 0b11) as u8;
                (PacketStatus::from(e), *n)
            }
        };

        let instant = match status {
            PacketStatus::NotReceived => None,
            PacketStatus::ReceivedSmallDelta => match self.twcc.delta.pop_front()? {
                Delta::Small(v) => Some(self.time_base + Duration::from_micros(250 * v as u64)),
                Delta::Large(_) => return None,
            },
            PacketStatus::ReceivedLargeOrNegativeDelta => match self.twcc.delta.pop_front()? {
                Delta::Small(_) => return None,
                Delta::Large(v) => {
                    let dur = Duration::from_micros(250 * v.unsigned_abs() as u64);
                    Some(if v < 0 {
                        self.time_base.checked_sub(dur)?
                    } else {
                        self.time_base + dur
                    })
                }
            },
            _ => return None,
        };

        if let Some(new_timebase) = instant {
            self.time_base = new_timebase;
        }

        self.index += 1;
        if self.index == amount as usize {
            self.twcc.chunks.pop_front();
            self.base_seq = seq + 1;
            self.index = 0;
        }

        Some((seq, status, instant))
    }
}

impl fmt::Debug for Twcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Twcc")
            .field("base_seq", &self.base_seq)
            .field("status_count", &self.status_count)
            .field("reference_time", &self.reference_time)
            .field("feedback_count", &self.feedback_count)
            .field("chunks", &self.chunks.len())
            .field("delta", &self.delta.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn run_chunk_roundtrip() {
        let mut twcc = Twcc {
            sender_ssrc: 1.into(),
            ssrc: 0.into(),
            base_seq: 82,
            status_count: 3,
            reference_time: 25,
            feedback_count: 17,
            chunks: VecDeque::new(),
            delta: VecDeque::new(),
        };
        twcc.chunks
            .push_back(PacketChunk::Run(PacketStatus::ReceivedSmallDelta, 3));
        twcc.delta.push_back(Delta::Small(0x7c));
        twcc.delta.push_back(Delta::Small(0x93));
        twcc.delta.push_back(Delta::Small(0x84));

        let mut buf = vec![0_u8; twcc.length_words() * 4];
        let n = twcc.write_to(&mut buf);
        buf.truncate(n);

        assert_eq!(
            &buf,
            &[
                // TWCC 0xaf got padding bit set
                0xaf, 0xcd, 0x00, 0x06, //
                0x00, 0x00, 0x00, 0x01, // sender SSRC
                0x00, 0x00, 0x00, 0x00, // media SSRC
                0x00, 0x52, // base seq
                0x00, 0x03, // status count
                0x00, 0x00, 0x19, // reference time
                0x11, // feedback count
                0x20, 0x03, // run of 3
                0x7c, 0x93, 0x84, // three small delta
                0x00, 0x00, 0x03 // padding
            ]
        );

        let back = Twcc::parse(&buf[4..buf.len() - 3]).unwrap();
        assert_eq!(back.base_seq, 82);
        assert_eq!(back.status_count, 3);
        assert_eq!(back.feedback_count, 17);
        assert_eq!(back.delta.len(), 3);
    }

    #[test]
    fn iter_resolves_times() {
        let mut chunks = VecDeque::new();
        chunks.push_back(PacketChunk::Run(PacketStatus::ReceivedSmallDelta, 2));
        chunks.push_back(PacketChunk::Run(PacketStatus::NotReceived, 1));
        let mut delta = VecDeque::new();
        delta.push_back(Delta::Small(4)); // 1ms
        delta.push_back(Delta::Small(8)); // 2ms

        let twcc = Twcc {
            sender_ssrc: 0.into(),
            ssrc: 0.into(),
            base_seq: 100,
            status_count: 3,
            reference_time: 1, // 64ms
            feedback_count: 0,
            chunks,
            delta,
        };

        let t0 = Instant::now();
        let all: Vec<_> = twcc.into_iter(t0, 90).collect();
        assert_eq!(all.len(), 3);

        assert_eq!(all[0].0, 100);
        assert_eq!(all[0].2, Some(t0 + Duration::from_millis(65)));
        assert_eq!(all[1].2, Some(t0 + Duration::from_millis(67)));
        assert_eq!(all[2].1, PacketStatus::NotReceived);
        assert_eq!(all[2].2, None);
    }

    #[test]
    fn parse_one_bit_vector() {
        // sender ssrc 0, media 0, base seq 10, count 3, ref 0, fb 1,
        // vector single: bits 10 1000 0000 0000 -> recv, not, recv? we use
        // 3 of 14 symbols: 1,0,1 at the top.
        let mut body = vec![0_u8; 16];
        body[9] = 10; // base seq
        body[11] = 3; // status count
        body[15] = 1; // feedback count
        let chunk: u16 = 0x8000 | (1 << 13) | (1 << 11);
        body.extend_from_slice(&chunk.to_be_bytes());
        body.extend_from_slice(&[4, 8]); // two small deltas

        let twcc = Twcc::parse(&body).unwrap();
        assert_eq!(twcc.status_count, 3);
        assert_eq!(twcc.delta.len(), 2);

        let statuses: Vec<_> = twcc
            .into_iter(Instant::now(), 0)
            .map(|(_, s, _)| s)
            .collect();
        assert_eq!(
            statuses,
            vec![
                PacketStatus::ReceivedSmallDelta,
                PacketStatus::NotReceived,
                PacketStatus::ReceivedSmallDelta,
            ]
        );
    }
}
