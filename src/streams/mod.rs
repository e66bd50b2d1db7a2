//! Per-SSRC media tracks: receive (publish) and send (play).

use std::fmt;

mod register;
pub(crate) use register::ReceiverRegister;

mod receive;
pub use receive::ReceiveTrack;

mod rtx_cache;
pub(crate) use rtx_cache::RtxCache;

mod send;
pub use send::SendTrack;

mod switch;
pub use switch::StreamSwitchContext;

/// Kind of media a track carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }

    /// RTP clock rate for the codecs we carry (opus / H.264).
    pub fn clock_rate(&self) -> u32 {
        match self {
            TrackKind::Audio => 48_000,
            TrackKind::Video => 90_000,
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
