//! UDP datagram demultiplexing and the STUN wire format.
//!
//! A connection receives every datagram for its 5-tuple and splits by the
//! first byte: 0-3 STUN, 20-63 DTLS, 128-191 SRTP/SRTCP (RTCP payload
//! types look like 64-95 in the second byte).

use std::io;

mod stun;
pub use stun::{StunClass, StunError, StunMessage, StunMessageBuilder, StunMethod, TransId};

/// MTU to keep DTLS records and RTP packets under.
pub const DATAGRAM_MTU: usize = 1150;

/// Warn when a produced datagram exceeds this.
pub const DATAGRAM_MTU_WARN: usize = 1280;

/// Max UDP packet size we ever deal with.
pub const DATAGRAM_MAX_PACKET_SIZE: usize = 2000;

/// A parsed-enough inbound datagram.
pub enum DatagramRecv<'a> {
    Stun(StunMessage<'a>),
    Dtls(&'a [u8]),
    Rtp(&'a [u8]),
    Rtcp(&'a [u8]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MultiplexKind {
    Stun,
    Dtls,
    Rtp,
    Rtcp,
}

impl<'a> TryFrom<&'a [u8]> for MultiplexKind {
    type Error = io::Error;

    fn try_from(value: &'a [u8]) -> Result<Self, io::Error> {
        if value.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "Empty datagram"));
        }

        let byte0 = value[0];
        let len = value.len();

        if byte0 < 4 && len >= 20 {
            Ok(MultiplexKind::Stun)
        } else if byte0 >= 20 && byte0 < 64 {
            Ok(MultiplexKind::Dtls)
        } else if byte0 >= 128 && byte0 < 192 && len > 2 {
            let byte1 = value[1];
            let payload_type = byte1 & 0x7f;

            // RTCP payload types 200-207 have the marker-bit position set,
            // masking to 64..96. Everything else on this range is RTP.
            Ok(if payload_type >= 64 && payload_type < 96 {
                MultiplexKind::Rtcp
            } else {
                MultiplexKind::Rtp
            })
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Unknown datagram",
            ))
        }
    }
}

impl<'a> TryFrom<&'a [u8]> for DatagramRecv<'a> {
    type Error = NetError;

    fn try_from(value: &'a [u8]) -> Result<Self, Self::Error> {
        use DatagramRecv::*;

        let kind = MultiplexKind::try_from(value)?;

        Ok(match kind {
            MultiplexKind::Stun => Stun(StunMessage::parse(value)?),
            MultiplexKind::Dtls => Dtls(value),
            MultiplexKind::Rtp => Rtp(value),
            MultiplexKind::Rtcp => Rtcp(value),
        })
    }
}

/// Errors from the datagram layer.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("{0}")]
    Stun(#[from] StunError),

    #[error("{0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn demux_by_first_byte() {
        let stun = [0_u8; 20];
        assert_eq!(
            MultiplexKind::try_from(&stun[..]).unwrap(),
            MultiplexKind::Stun
        );

        let dtls = [22_u8, 0, 0];
        assert_eq!(
            MultiplexKind::try_from(&dtls[..]).unwrap(),
            MultiplexKind::Dtls
        );

        // pt 111 -> RTP
        let rtp = [0x80_u8, 111, 0];
        assert_eq!(
            MultiplexKind::try_from(&rtp[..]).unwrap(),
            MultiplexKind::Rtp
        );

        // pt 200 (SR) masks to 72 -> RTCP
        let rtcp = [0x80_u8, 200, 0];
        assert_eq!(
            MultiplexKind::try_from(&rtcp[..]).unwrap(),
            MultiplexKind::Rtcp
        );

        let junk = [99_u8, 0, 0];
        assert!(MultiplexKind::try_from(&junk[..]).is_err());
    }
}
