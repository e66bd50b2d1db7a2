//! WebRTC peer-connection session core for a real-time media server.
//!
//! This crate implements the per-connection state machine that negotiates an
//! SDP session with a browser-class peer, performs the ICE/DTLS/SRTP
//! handshake and then ingests (publish) or emits (play) encrypted RTP/RTCP
//! on a single multiplexed UDP 5-tuple.
//!
//! The crate deliberately does *not* own the UDP demultiplexer, the
//! cross-connection stream registry or any signaling ingress. Those are
//! external collaborators injected through the traits in [`source`].
//!
//! A connection is driven by exactly one tokio task. All per-connection
//! state is owned by that task; the only shared resource is the stream
//! registry, which provides its own synchronization.

#![allow(clippy::new_without_default)]

#[macro_use]
extern crate tracing;

use thiserror::Error;

pub mod config;
pub mod connection;
pub mod crypto;
pub mod format;
pub mod io;
pub mod negotiate;
pub mod packet;
pub mod play;
pub mod publish;
pub mod rtp;
pub mod sdp;
pub mod source;
pub mod stats;
pub mod streams;
pub mod transport;
pub mod twcc;
pub(crate) mod util;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::RtcConfig;
pub use connection::{Connection, ConnectionHandle, ConnectionInput, ConnectionState};
pub use negotiate::{StreamDescription, TrackConfig, TrackDescription};
pub use source::Request;

use rtp::{Pt, RtcpError, Ssrc};

/// Errors for the whole session engine.
///
/// Per-packet errors in the receive/send paths are logged and dropped by the
/// connection loop; they never tear down the session. Handshake errors are
/// fatal. SDP-time errors fail the signaling call before a session exists.
#[derive(Debug, Error)]
pub enum RtcError {
    /// Some problem with the remote SDP beyond a parse failure.
    #[error("remote sdp: {0}")]
    RemoteSdp(String),

    /// SDP parse errors.
    #[error("{0}")]
    Sdp(#[from] sdp::SdpError),

    /// The remote offer contains no codec we can use.
    #[error("no compatible codec: {0}")]
    NoCompatibleCodec(&'static str),

    /// Play negotiation produced no subscribe relations.
    #[error("no play relations for {0}")]
    NoRelations(String),

    /// RTCP wire format errors.
    #[error("{0}")]
    Rtcp(#[from] RtcpError),

    /// RTP arrived for an SSRC no track claims.
    #[error("unknown ssrc {0}")]
    UnknownSsrc(Ssrc),

    /// An RTP header that doesn't parse.
    #[error("invalid rtp header, {0} bytes")]
    InvalidRtpHeader(usize),

    /// SRTP protect/unprotect attempted before the DTLS handshake finished.
    #[error("srtp not ready, dtls handshake incomplete")]
    SrtpNotReady,

    /// SRTP protect failed.
    #[error("srtp protect failed, {0} bytes")]
    SrtpProtect(usize),

    /// SRTP unprotect failed. Carries the header of the offending packet,
    /// since retransmissions and padding legitimately fail unprotect and the
    /// log line is all we get to tell those apart from key mismatches.
    #[error(
        "srtp unprotect failed, marker={marker}, pt={pt}, seq={seq}, ts={ts}, \
         ssrc={ssrc}, pad={pad}, {len} bytes"
    )]
    SrtpUnprotect {
        marker: bool,
        pt: Pt,
        seq: u16,
        ts: u32,
        ssrc: Ssrc,
        pad: bool,
        len: usize,
    },

    /// SRTCP unprotect failed.
    #[error("srtcp unprotect failed, {0} bytes")]
    SrtcpUnprotect(usize),

    /// The DTLS handshake failed. Fatal for the connection.
    #[error("dtls handshake: {0}")]
    DtlsHandshake(String),

    /// Binding request carried ICE-CONTROLLED while we are ice-lite
    /// (and therefore always controlling).
    #[error("peer must not be ice-controlled against an ice-lite server")]
    StunRoleConflict,

    /// Binding request failed the MESSAGE-INTEGRITY check.
    #[error("stun message-integrity check failed")]
    StunIntegrity,

    /// STUN wire format errors.
    #[error("{0}")]
    Stun(#[from] io::StunError),

    /// DTLS/SRTP crypto layer errors.
    #[error("{0}")]
    Crypto(#[from] crypto::CryptoError),

    /// RTP payload depacketizing errors.
    #[error("{0}")]
    Packet(#[from] packet::PacketError),

    /// The stream registry could not produce a source for the request.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// An operation that requires a started player arrived before one exists.
    #[error("player not started")]
    PlayerNotStarted,

    /// Other IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}
