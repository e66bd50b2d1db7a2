//! RTP payload handling.
//!
//! The payload of a depacketized RTP packet is a tagged sum: raw bytes for
//! audio, and STAP-A / FU-A aware variants for H.264 video.

use thiserror::Error;

use crate::rtp::{ExtensionMap, RtpHeader};
use crate::streams::TrackKind;

mod h264;
pub use h264::{FuA, StapA};
pub(crate) use h264::{is_keyframe_nalu, FUA_NALU_TYPE, NALU_TYPE_BITMASK, STAPA_NALU_TYPE};

/// Errors from payload depacketizing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("payload too short for {0}")]
    ErrShortPacket(&'static str),

    #[error("STAP-A declared NALU size overruns the payload")]
    StapASizeOverrun,
}

/// Payload of an RTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtpPayload {
    /// Unstructured payload; all audio, and video NALUs sent whole.
    Raw(Vec<u8>),
    /// H.264 aggregation packet (NALU type 24).
    StapA(StapA),
    /// H.264 fragmentation unit (NALU type 28).
    FuA(FuA),
}

impl RtpPayload {
    /// Depacketize by media kind: audio is always raw, video dispatches on
    /// the NALU type octet.
    pub fn decode(kind: TrackKind, payload: Vec<u8>) -> Result<RtpPayload, PacketError> {
        if kind == TrackKind::Audio || payload.is_empty() {
            return Ok(RtpPayload::Raw(payload));
        }

        let nalu_type = payload[0] & NALU_TYPE_BITMASK;
        match nalu_type {
            STAPA_NALU_TYPE => Ok(RtpPayload::StapA(StapA::parse(&payload)?)),
            FUA_NALU_TYPE => Ok(RtpPayload::FuA(FuA::parse(&payload)?)),
            _ => Ok(RtpPayload::Raw(payload)),
        }
    }

    /// Serialize back to payload bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            RtpPayload::Raw(v) => v.clone(),
            RtpPayload::StapA(v) => v.to_bytes(),
            RtpPayload::FuA(v) => v.to_bytes(),
        }
    }

    /// Payload length on the wire.
    pub fn byte_len(&self) -> usize {
        match self {
            RtpPayload::Raw(v) => v.len(),
            RtpPayload::StapA(v) => v.byte_len(),
            RtpPayload::FuA(v) => v.byte_len(),
        }
    }

    /// Whether this payload starts key-frame data (IDR slice or SPS).
    pub fn is_keyframe(&self) -> bool {
        match self {
            RtpPayload::Raw(v) => !v.is_empty() && is_keyframe_nalu(v[0]),
            RtpPayload::StapA(v) => v.contains_keyframe(),
            RtpPayload::FuA(v) => v.start && is_keyframe_nalu(v.nalu_type),
        }
    }
}

/// A complete media packet flowing through the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    /// The media kind, decided by the track this packet belongs to.
    pub kind: TrackKind,
    /// Parsed RTP header.
    pub header: RtpHeader,
    /// Depacketized payload.
    pub payload: RtpPayload,
}

impl RtpPacket {
    /// Depacketize header + payload bytes.
    pub fn decode(
        kind: TrackKind,
        header: RtpHeader,
        payload: Vec<u8>,
    ) -> Result<RtpPacket, PacketError> {
        let payload = RtpPayload::decode(kind, payload)?;
        Ok(RtpPacket {
            kind,
            header,
            payload,
        })
    }

    /// Serialize header and payload into `buf`. Returns bytes written.
    pub fn encode(&self, buf: &mut [u8], exts: &ExtensionMap) -> usize {
        let n = self.header.write_to(buf, exts);
        let body = self.payload.to_bytes();
        buf[n..n + body.len()].copy_from_slice(&body);
        n + body.len()
    }

    /// Whether this packet carries the start of a key-frame.
    pub fn is_keyframe(&self) -> bool {
        self.kind == TrackKind::Video && self.payload.is_keyframe()
    }
}
