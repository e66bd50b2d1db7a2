//! Media formats and payload parameters.

use std::fmt;

use crate::rtp::Pt;

/// Codecs this server understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Opus,
    H264,
    /// Redundancy encoding (RFC 2198).
    Red,
    /// Resends (RFC 4588).
    Rtx,
    /// Forward error correction (RFC 5109).
    Ulpfec,
    /// Reed-Solomon FEC.
    Rsfec,
    Unknown,
}

impl Codec {
    pub fn is_audio(&self) -> bool {
        matches!(self, Codec::Opus)
    }

    pub fn is_video(&self) -> bool {
        matches!(self, Codec::H264)
    }

    /// Auxiliary payloads riding along a primary codec.
    pub fn is_auxiliary(&self) -> bool {
        matches!(self, Codec::Red | Codec::Rtx | Codec::Ulpfec | Codec::Rsfec)
    }

    /// The name as used in `a=rtpmap` (case insensitive on parse).
    pub fn sdp_name(&self) -> &'static str {
        match self {
            Codec::Opus => "opus",
            Codec::H264 => "H264",
            Codec::Red => "red",
            Codec::Rtx => "rtx",
            Codec::Ulpfec => "ulpfec",
            Codec::Rsfec => "rsfec",
            Codec::Unknown => "unknown",
        }
    }
}

impl<'a> From<&'a str> for Codec {
    fn from(v: &'a str) -> Self {
        let lc = v.to_ascii_lowercase();
        match lc.as_str() {
            "opus" => Codec::Opus,
            "h264" => Codec::H264,
            "red" => Codec::Red,
            "rtx" => Codec::Rtx,
            "ulpfec" => Codec::Ulpfec,
            "rsfec" => Codec::Rsfec,
            _ => Codec::Unknown,
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sdp_name())
    }
}

/// Codec specific format parameters from an `a=fmtp` line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct FormatParams {
    /// Opus: minimum duration of media per packet.
    pub min_p_time: Option<u8>,

    /// Opus: the decoder can do in-band FEC.
    pub use_inband_fec: Option<bool>,

    /// Opus: stereo preferred.
    pub stereo: Option<bool>,

    /// H.264: whether asymmetric levels between the two directions are ok.
    pub level_asymmetry_allowed: Option<bool>,

    /// H.264 packetization mode.
    ///
    /// * 0 - single NAL.
    /// * 1 - STAP-A and FU-A allowed. Non-interleaved.
    pub packetization_mode: Option<u8>,

    /// H.264 profile level.
    ///
    /// * 42 00 1f - baseline (B),              1f = level 3.1
    /// * 42 e0 1f - constrained baseline (CB), 1f = level 3.1
    /// * 4d 00 1f - main (M),                  1f = level 3.1
    /// * 64 00 1f - high (H),                  1f = level 3.1
    pub profile_level_id: Option<u32>,

    /// RTX: which payload type this is a resend stream for.
    pub apt: Option<Pt>,
}

impl FormatParams {
    /// Parse an fmtp line, e.g. `minptime=10;useinbandfec=1`.
    pub fn parse_line(line: &str) -> Self {
        let mut p = FormatParams::default();

        for pair in line.split(';') {
            let mut kv = pair.split('=');
            let (Some(k), Some(v)) = (kv.next(), kv.next()) else {
                continue;
            };
            p.set_param(k.trim(), v.trim());
        }

        p
    }

    fn set_param(&mut self, k: &str, v: &str) {
        match k {
            "minptime" => self.min_p_time = v.parse().ok(),
            "useinbandfec" => self.use_inband_fec = Some(v == "1"),
            "stereo" => self.stereo = Some(v == "1"),
            "level-asymmetry-allowed" => self.level_asymmetry_allowed = Some(v == "1"),
            "packetization-mode" => self.packetization_mode = v.parse().ok(),
            "profile-level-id" => self.profile_level_id = u32::from_str_radix(v, 16).ok(),
            "apt" => self.apt = v.parse::<u8>().ok().map(Pt::from),
            _ => {
                trace!("Unknown fmtp param: {}={}", k, v);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == FormatParams::default()
    }
}

impl fmt::Display for FormatParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = vec![];
        if let Some(v) = self.min_p_time {
            parts.push(format!("minptime={}", v));
        }
        if let Some(v) = self.use_inband_fec {
            parts.push(format!("useinbandfec={}", v as u8));
        }
        if let Some(v) = self.stereo {
            parts.push(format!("stereo={}", v as u8));
        }
        if let Some(v) = self.level_asymmetry_allowed {
            parts.push(format!("level-asymmetry-allowed={}", v as u8));
        }
        if let Some(v) = self.packetization_mode {
            parts.push(format!("packetization-mode={}", v));
        }
        if let Some(v) = self.profile_level_id {
            parts.push(format!("profile-level-id={:06x}", v));
        }
        if let Some(v) = self.apt {
            parts.push(format!("apt={}", v));
        }
        write!(f, "{}", parts.join(";"))
    }
}

/// Group of parameters for one payload type (PT).
///
/// In the SDP a payload type has a number of associated parameters:
///
/// ```text
/// a=rtpmap:102 H264/90000
/// a=rtcp-fb:102 nack
/// a=rtcp-fb:102 nack pli
/// a=rtcp-fb:102 transport-cc
/// a=fmtp:102 level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadParams {
    /// The payload type that groups these parameters.
    pub pt: Pt,
    /// The codec for this payload type.
    pub codec: Codec,
    /// Clock rate from the rtpmap.
    pub clock_rate: u32,
    /// Number of audio channels, when present.
    pub channels: Option<u8>,
    /// Parsed fmtp parameters.
    pub format: FormatParams,
    /// The rtcp-fb lines, verbatim ("nack", "nack pli", "transport-cc", ...).
    pub rtcp_fbs: Vec<String>,
}

impl PayloadParams {
    pub fn new(pt: Pt, codec: Codec, clock_rate: u32) -> Self {
        PayloadParams {
            pt,
            codec,
            clock_rate,
            channels: None,
            format: FormatParams::default(),
            rtcp_fbs: vec![],
        }
    }

    /// Keep only the feedback mechanisms the server is willing to do:
    /// nack/nack pli when `nack`, transport-cc when `twcc`.
    pub fn filter_rtcp_fbs(&mut self, nack: bool, twcc: bool) {
        self.rtcp_fbs.retain(|fb| match fb.as_str() {
            "nack" | "nack pli" => nack,
            "transport-cc" => twcc,
            _ => false,
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn codec_name_case_insensitive() {
        assert_eq!(Codec::from("OPUS"), Codec::Opus);
        assert_eq!(Codec::from("h264"), Codec::H264);
        assert_eq!(Codec::from("vp8"), Codec::Unknown);
    }

    #[test]
    fn fmtp_parse_h264() {
        let p =
            FormatParams::parse_line("level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f");
        assert_eq!(p.level_asymmetry_allowed, Some(true));
        assert_eq!(p.packetization_mode, Some(1));
        assert_eq!(p.profile_level_id, Some(0x42e01f));
    }

    #[test]
    fn fmtp_display_roundtrip() {
        let p = FormatParams::parse_line("minptime=10;useinbandfec=1");
        assert_eq!(p.to_string(), "minptime=10;useinbandfec=1");

        let p2 = FormatParams::parse_line(&p.to_string());
        assert_eq!(p, p2);
    }

    #[test]
    fn filter_feedback() {
        let mut p = PayloadParams::new(102.into(), Codec::H264, 90_000);
        p.rtcp_fbs = vec![
            "nack".into(),
            "nack pli".into(),
            "transport-cc".into(),
            "goog-remb".into(),
            "ccm fir".into(),
        ];

        let mut only_nack = p.clone();
        only_nack.filter_rtcp_fbs(true, false);
        assert_eq!(only_nack.rtcp_fbs, vec!["nack", "nack pli"]);

        let mut both = p.clone();
        both.filter_rtcp_fbs(true, true);
        assert_eq!(both.rtcp_fbs, vec!["nack", "nack pli", "transport-cc"]);

        p.filter_rtcp_fbs(false, false);
        assert!(p.rtcp_fbs.is_empty());
    }
}
