//! RTP/RTCP wire formats and identifiers.

use std::fmt;
use std::ops::Deref;
use std::str::from_utf8;

mod header;
pub use header::{extend_u16, extend_u32, RtpHeader};

mod ext;
pub use ext::{Extension, ExtensionMap, ExtensionValues, PICTURE_ID_URI, TWCC_URI};

pub mod rtcp;
pub use rtcp::{
    Dlrr, DlrrItem, ExtendedReport, Nack, NackEntry, Pli, ReceiverReport, ReceptionReport,
    ReportBlock, Rrtr, Rtcp, RtcpError, RtcpPacket, SenderInfo, SenderReport, Twcc,
};

/// Media identifier.
///
/// In SDP this is found per m-line with the attribute `a=mid:<mid>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mid([u8; 16]);

impl Mid {
    /// Converts an array of bytes to an id.
    pub const fn from_array(a: [u8; 16]) -> Mid {
        Mid(a)
    }
}

impl fmt::Display for Mid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s: &str = self;
        write!(f, "{}", s)
    }
}

impl fmt::Debug for Mid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s: &str = self;
        write!(f, "Mid({})", s)
    }
}

impl Deref for Mid {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        from_utf8(&self.0).expect("ascii id").trim()
    }
}

impl<'a> From<&'a str> for Mid {
    fn from(v: &'a str) -> Self {
        let bytes = v.as_bytes();
        let bytes = &bytes[0..16.min(bytes.len())];

        // pad with space.
        let mut array = [b' '; 16];

        let max = bytes.len().min(array.len());
        array[0..max].copy_from_slice(bytes);

        Mid(array)
    }
}

macro_rules! num_id {
    ($id:ident, $t:tt) => {
        impl $id {
            /// Creates a new random id.
            pub fn new() -> Self {
                $id(fastrand::$t(..))
            }
        }

        impl Deref for $id {
            type Target = $t;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl From<$t> for $id {
            fn from(v: $t) -> Self {
                $id(v)
            }
        }

        impl fmt::Display for $id {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

/// Synchronization source.
///
/// Uniquely identifies a sending source of data. Multiple sources for the
/// same media happens for RTX (resend) and FEC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ssrc(u32);
num_id!(Ssrc, u32);

impl Ssrc {
    pub fn to_be_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

/// Payload type.
///
/// Identifies which codec and format parameters a stream is sent with.
/// The Pt-codec mapping is negotiated in the SDP OFFER/ANSWER.
///
/// PTs in RTP headers are 7 bits. Values >= 128 are not valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pt(u8);
num_id!(Pt, u8);

/// Sequence number of an RTP packet.
///
/// In the RTP header the sequence number is a `u16` that quickly rolls
/// over. To uniquely identify a packet we track the roll-overs and extend
/// the `u16` to a `u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeqNo(u64);
num_id!(SeqNo, u64);

impl SeqNo {
    /// Increase (mutate) this sequence number and return the previous value.
    #[inline(always)]
    pub fn inc(&mut self) -> SeqNo {
        let n = SeqNo(self.0);
        self.0 += 1;
        n
    }

    /// The RTP header value (discarding the ROC).
    #[inline(always)]
    pub fn as_u16(&self) -> u16 {
        self.0 as u16
    }

    /// Get the rollover counter (ROC) value.
    #[inline(always)]
    pub fn roc(&self) -> u64 {
        self.0 >> 16
    }
}

impl Default for SeqNo {
    fn default() -> Self {
        // https://www.rfc-editor.org/rfc/rfc3550#page-13
        // The initial value of the sequence number SHOULD be random
        // (unpredictable) to make known-plaintext attacks on encryption
        // more difficult. The upper half of the range is avoided to
        // prevent SRTP wraparound issues during startup.
        Self((fastrand::u16(..) % 32767 + 1) as u64)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mid_from_str_pads() {
        let mid: Mid = "0".into();
        assert_eq!(&*mid, "0");
        assert_eq!(mid.to_string(), "0");
    }

    #[test]
    fn seq_no_inc_is_post() {
        let mut s: SeqNo = 9.into();
        assert_eq!(*s.inc(), 9);
        assert_eq!(*s, 10);
    }

    #[test]
    fn seq_no_u16_and_roc() {
        let s: SeqNo = (65_536 + 5).into();
        assert_eq!(s.as_u16(), 5);
        assert_eq!(s.roc(), 1);
    }
}
