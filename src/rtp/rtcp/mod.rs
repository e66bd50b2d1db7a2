#![allow(clippy::unusual_byte_groupings)]

//! RTCP wire formats.
//!
//! Compound packets are walked by the 4-byte length prefix. Payload types:
//! 200 SR, 201 RR, 202 SDES (ignored), 203 BYE (ignored), 204 APP
//! (ignored), 205 RTP-FB (NACK fmt=1, TWCC fmt=15), 206 PS-FB (PLI fmt=1),
//! 207 XR (RRTR, DLRR).

use thiserror::Error;

mod sr;
pub use sr::{SenderInfo, SenderReport};

mod rr;
pub use rr::{ReceiverReport, ReceptionReport};

mod xr;
pub use xr::{Dlrr, DlrrItem, ExtendedReport, ReportBlock, Rrtr};

mod nack;
pub use nack::{Nack, NackEntry};

mod pli;
pub use pli::Pli;

mod twcc;
pub use twcc::{Delta, PacketChunk, PacketStatus, Twcc};

use super::Ssrc;

/// Errors arising from RTCP parsing.
#[derive(Debug, Error)]
pub enum RtcpError {
    /// A (sub) packet length field disagrees with the buffer.
    #[error("invalid rtcp packet, type={0}, length={1}")]
    InvalidLength(u8, usize),

    /// A packet is structurally valid but semantically broken.
    #[error("invalid rtcp: {0}")]
    InvalidSemantics(&'static str),

    /// A payload type outside 200-207.
    #[error("unknown rtcp type={0}")]
    UnknownType(u8),
}

pub(crate) const LEN_HEADER: usize = 4;

/// Kind of RTCP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcpType {
    SenderReport = 200,
    ReceiverReport = 201,
    SourceDescription = 202,
    Goodbye = 203,
    ApplicationDefined = 204,
    TransportLayerFeedback = 205,
    PayloadSpecificFeedback = 206,
    ExtendedReport = 207,
}

impl TryFrom<u8> for RtcpType {
    type Error = RtcpError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        use RtcpType::*;
        match v {
            200 => Ok(SenderReport),
            201 => Ok(ReceiverReport),
            202 => Ok(SourceDescription),
            203 => Ok(Goodbye),
            204 => Ok(ApplicationDefined),
            205 => Ok(TransportLayerFeedback),
            206 => Ok(PayloadSpecificFeedback),
            207 => Ok(ExtendedReport),
            _ => Err(RtcpError::UnknownType(v)),
        }
    }
}

/// The header of one RTCP (sub) packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcpHeader {
    pub rtcp_type: RtcpType,
    /// FMT / RC / subtype depending on type.
    pub fmt: u8,
    /// Length of the entire packet in words, minus one.
    pub words_less_one: u16,
}

impl RtcpHeader {
    /// Length of entire RTCP packet (including header) in bytes.
    pub fn length_bytes(&self) -> usize {
        (self.words_less_one as usize + 1) * 4
    }

    pub(crate) fn write_to(&self, buf: &mut [u8]) -> usize {
        assert!(self.fmt <= 31, "rtcp fmt must be <= 31");
        buf[0] = 0b10_0_00000 | self.fmt;
        buf[1] = self.rtcp_type as u8;
        buf[2..4].copy_from_slice(&self.words_less_one.to_be_bytes());
        LEN_HEADER
    }

    fn parse(buf: &[u8]) -> Result<RtcpHeader, RtcpError> {
        if buf.len() < 4 {
            return Err(RtcpError::InvalidLength(0, buf.len()));
        }

        let version = (buf[0] & 0b11_0_00000) >> 6;
        if version != 2 {
            return Err(RtcpError::InvalidSemantics("version is not 2"));
        }

        let fmt = buf[0] & 0b00_0_11111;
        let rtcp_type: RtcpType = buf[1].try_into()?;
        let words_less_one = u16::from_be_bytes([buf[2], buf[3]]);

        Ok(RtcpHeader {
            rtcp_type,
            fmt,
            words_less_one,
        })
    }
}

/// Serializing helper implemented by each RTCP packet form.
pub trait RtcpPacket {
    fn header(&self) -> RtcpHeader;

    /// Length of entire RTCP packet (including header) in words (4 bytes).
    fn length_words(&self) -> usize;

    /// Write this packet to the buffer.
    ///
    /// Panics if the buffer can't hold `length_words * 4` bytes.
    fn write_to(&self, buf: &mut [u8]) -> usize;
}

/// RTCP packets we act on.
#[allow(clippy::large_enum_variant)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rtcp {
    SenderReport(SenderReport),
    ReceiverReport(ReceiverReport),
    ExtendedReport(ExtendedReport),
    Nack(Nack),
    Pli(Pli),
    Twcc(Twcc),
}

impl Rtcp {
    /// Walk a compound packet. Ignored types (SDES, BYE, APP, and feedback
    /// formats we don't act on) are skipped; an unknown payload type or a
    /// bad length is an error.
    pub fn read_compound(buf: &[u8]) -> Result<Vec<Rtcp>, RtcpError> {
        let mut packets = vec![];
        let mut buf = buf;

        while !buf.is_empty() {
            let header = RtcpHeader::parse(buf)?;
            let full_length = header.length_bytes();

            if full_length > buf.len() {
                return Err(RtcpError::InvalidLength(
                    header.rtcp_type as u8,
                    full_length,
                ));
            }

            let has_padding = buf[0] & 0b00_1_00000 > 0;
            let unpadded_length = if has_padding {
                let pad = buf[full_length - 1] as usize;
                if full_length < pad {
                    return Err(RtcpError::InvalidSemantics("padding larger than packet"));
                }
                full_length - pad
            } else {
                full_length
            };

            if let Some(packet) = Rtcp::parse_one(&header, &buf[..unpadded_length])? {
                packets.push(packet);
            }

            buf = &buf[full_length..];
        }

        Ok(packets)
    }

    fn parse_one(header: &RtcpHeader, buf: &[u8]) -> Result<Option<Rtcp>, RtcpError> {
        // past the 4 byte header, contained to this sub packet.
        let rest = &buf[LEN_HEADER..];

        let packet = match header.rtcp_type {
            RtcpType::SenderReport => Some(Rtcp::SenderReport(SenderReport::parse(header, rest)?)),
            RtcpType::ReceiverReport => {
                Some(Rtcp::ReceiverReport(ReceiverReport::parse(header, rest)?))
            }
            RtcpType::SourceDescription => None,
            RtcpType::Goodbye => None,
            RtcpType::ApplicationDefined => None,
            RtcpType::TransportLayerFeedback => match header.fmt {
                1 => Some(Rtcp::Nack(Nack::parse(rest)?)),
                15 => Some(Rtcp::Twcc(Twcc::parse(rest)?)),
                f => {
                    debug!("Ignore RTP-FB fmt={}", f);
                    None
                }
            },
            RtcpType::PayloadSpecificFeedback => match header.fmt {
                1 => Some(Rtcp::Pli(Pli::parse(rest)?)),
                // SLI, RPSI, FIR, AFB, ...: logged and ignored.
                f => {
                    debug!("Ignore PS-FB fmt={}", f);
                    None
                }
            },
            RtcpType::ExtendedReport => {
                Some(Rtcp::ExtendedReport(ExtendedReport::parse(rest)?))
            }
        };

        Ok(packet)
    }

    /// Serialize one packet into a fresh buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = vec![0_u8; self.length_words() * 4];
        let n = self.write_to(&mut buf);
        assert_eq!(n, buf.len(), "length_words equals write_to length");
        buf
    }
}

impl RtcpPacket for Rtcp {
    fn header(&self) -> RtcpHeader {
        match self {
            Rtcp::SenderReport(v) => v.header(),
            Rtcp::ReceiverReport(v) => v.header(),
            Rtcp::ExtendedReport(v) => v.header(),
            Rtcp::Nack(v) => v.header(),
            Rtcp::Pli(v) => v.header(),
            Rtcp::Twcc(v) => v.header(),
        }
    }

    fn length_words(&self) -> usize {
        match self {
            Rtcp::SenderReport(v) => v.length_words(),
            Rtcp::ReceiverReport(v) => v.length_words(),
            Rtcp::ExtendedReport(v) => v.length_words(),
            Rtcp::Nack(v) => v.length_words(),
            Rtcp::Pli(v) => v.length_words(),
            Rtcp::Twcc(v) => v.length_words(),
        }
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        match self {
            Rtcp::SenderReport(v) => v.write_to(buf),
            Rtcp::ReceiverReport(v) => v.write_to(buf),
            Rtcp::ExtendedReport(v) => v.write_to(buf),
            Rtcp::Nack(v) => v.write_to(buf),
            Rtcp::Pli(v) => v.write_to(buf),
            Rtcp::Twcc(v) => v.write_to(buf),
        }
    }
}

pub(crate) fn read_ssrc(buf: &[u8], at: usize) -> Ssrc {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]).into()
}
