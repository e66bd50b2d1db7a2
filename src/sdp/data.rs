#![allow(clippy::single_match)]

use std::fmt;

use crate::crypto::Fingerprint;
use crate::format::{Codec, FormatParams, PayloadParams};
use crate::rtp::{Mid, Pt, Ssrc};

/// A parsed SDP document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sdp {
    pub session: Session,
    pub media_lines: Vec<MediaLine>,
}

/// The session section, before the first m= line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: u64,
    pub attrs: Vec<SessionAttribute>,
}

/// Attributes before the first m= line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAttribute {
    Group {
        typ: String,    // BUNDLE
        mids: Vec<Mid>, // 0 1 2 3
    },
    MsidSemantic {
        semantic: String, // WMS
        stream_ids: Vec<String>,
    },
    IceLite,
    IceUfrag(String),
    IcePwd(String),
    IceOptions(String),
    Fingerprint(Fingerprint),
    Setup(Setup),
    Unused(String),
}

/// The a=setup value, giving the local DTLS role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setup {
    ActPass,
    Active,
    Passive,
}

impl Setup {
    pub fn as_str(&self) -> &'static str {
        match self {
            Setup::ActPass => "actpass",
            Setup::Active => "active",
            Setup::Passive => "passive",
        }
    }

    /// Our answer to a remote setup. An offer of `actpass` lets us pick;
    /// we prefer active so the DTLS handshake starts from our side
    /// directly after the first STUN exchange.
    pub fn invert(&self) -> Setup {
        match self {
            Setup::ActPass => Setup::Active,
            Setup::Active => Setup::Passive,
            Setup::Passive => Setup::Active,
        }
    }
}

impl fmt::Display for Setup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// m= line media type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaType {
    Audio,
    Video,
    Application,
    Unknown(String),
}

impl Default for MediaType {
    fn default() -> Self {
        MediaType::Unknown(String::new())
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaType::Audio => f.write_str("audio"),
            MediaType::Video => f.write_str("video"),
            MediaType::Application => f.write_str("application"),
            MediaType::Unknown(v) => f.write_str(v),
        }
    }
}

/// m= line transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Proto {
    #[default]
    Srtp,
    Sctp,
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proto::Srtp => f.write_str("UDP/TLS/RTP/SAVPF"),
            Proto::Sctp => f.write_str("UDP/DTLS/SCTP"),
        }
    }
}

/// Media direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SendOnly,
    RecvOnly,
    SendRecv,
    Inactive,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Direction::SendOnly => "sendonly",
            Direction::RecvOnly => "recvonly",
            Direction::SendRecv => "sendrecv",
            Direction::Inactive => "inactive",
        };
        f.write_str(s)
    }
}

/// An m-line with its attributes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MediaLine {
    pub typ: MediaType,
    pub disabled: bool,
    pub proto: Proto,
    /// Payload types from the m= line: 96 97 125 107.
    pub pts: Vec<Pt>,
    pub attrs: Vec<MediaAttribute>,
}

/// Attributes of an m-line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaAttribute {
    // a=rtcp:9 IN IP4 0.0.0.0
    Rtcp(String),
    IceUfrag(String),
    IcePwd(String),
    IceOptions(String),
    Fingerprint(Fingerprint),
    Setup(Setup),
    Mid(Mid),
    // a=extmap:3 http://...
    ExtMap {
        id: u8,
        uri: String,
    },
    RecvOnly,
    SendRecv,
    SendOnly,
    Inactive,
    // a=msid:<stream> <track>
    Msid {
        stream_id: String,
        track_id: String,
    },
    RtcpMux,
    RtcpRsize,
    // a=rtpmap:111 opus/48000/2
    RtpMap {
        pt: Pt,
        codec: String,
        clock_rate: u32,
        channels: Option<u8>,
    },
    // a=rtcp-fb:111 nack / nack pli / transport-cc
    RtcpFb {
        pt: Pt,
        value: String,
    },
    // a=fmtp:111 minptime=10;useinbandfec=1
    Fmtp {
        pt: Pt,
        value: String,
    },
    // a=ssrc-group:FID 659652645 98148385
    SsrcGroup {
        semantics: String,
        ssrcs: Vec<Ssrc>,
    },
    // a=ssrc:3948621874 cname:xeXs3aE9AOBn00yJ
    Ssrc {
        ssrc: Ssrc,
        attr: String,
        value: String,
    },
    Candidate(String),
    EndOfCandidates,
    Unused(String),
}

/// Aggregated a=ssrc info per SSRC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsrcInfo {
    pub ssrc: Ssrc,
    pub cname: Option<String>,
    /// The msid stream part ("m" in "msid:m t").
    pub stream_id: Option<String>,
    /// The msid tracker part ("t" in "msid:m t").
    pub track_id: Option<String>,
}

impl Sdp {
    pub fn ice_creds(&self) -> Option<(String, String)> {
        let sess_ufrag = self.session.attrs.iter().find_map(|a| {
            if let SessionAttribute::IceUfrag(v) = a {
                Some(v.clone())
            } else {
                None
            }
        });
        let sess_pwd = self.session.attrs.iter().find_map(|a| {
            if let SessionAttribute::IcePwd(v) = a {
                Some(v.clone())
            } else {
                None
            }
        });

        let media_ufrag = self.media_lines.iter().find_map(|m| m.ice_ufrag());
        let media_pwd = self.media_lines.iter().find_map(|m| m.ice_pwd());

        let ufrag = sess_ufrag.or(media_ufrag)?;
        let pwd = sess_pwd.or(media_pwd)?;
        Some((ufrag, pwd))
    }

    pub fn setup(&self) -> Option<Setup> {
        let sess = self.session.attrs.iter().find_map(|a| {
            if let SessionAttribute::Setup(v) = a {
                Some(*v)
            } else {
                None
            }
        });
        sess.or_else(|| self.media_lines.iter().find_map(|m| m.setup()))
    }

    pub fn fingerprint(&self) -> Option<Fingerprint> {
        let sess = self.session.attrs.iter().find_map(|a| {
            if let SessionAttribute::Fingerprint(v) = a {
                Some(v.clone())
            } else {
                None
            }
        });
        sess.or_else(|| self.media_lines.iter().find_map(|m| m.fingerprint()))
    }
}

impl MediaLine {
    pub fn is_audio(&self) -> bool {
        self.typ == MediaType::Audio
    }

    pub fn is_video(&self) -> bool {
        self.typ == MediaType::Video
    }

    pub fn mid(&self) -> Mid {
        self.attrs
            .iter()
            .find_map(|a| {
                if let MediaAttribute::Mid(m) = a {
                    Some(*m)
                } else {
                    None
                }
            })
            // only use mid() after check_consistent
            .expect("missing a=mid")
    }

    pub fn direction(&self) -> Direction {
        for a in &self.attrs {
            match a {
                MediaAttribute::SendRecv => return Direction::SendRecv,
                MediaAttribute::SendOnly => return Direction::SendOnly,
                MediaAttribute::RecvOnly => return Direction::RecvOnly,
                MediaAttribute::Inactive => return Direction::Inactive,
                _ => {}
            }
        }
        Direction::Inactive
    }

    pub fn ice_ufrag(&self) -> Option<String> {
        self.attrs.iter().find_map(|a| {
            if let MediaAttribute::IceUfrag(v) = a {
                Some(v.clone())
            } else {
                None
            }
        })
    }

    pub fn ice_pwd(&self) -> Option<String> {
        self.attrs.iter().find_map(|a| {
            if let MediaAttribute::IcePwd(v) = a {
                Some(v.clone())
            } else {
                None
            }
        })
    }

    pub fn setup(&self) -> Option<Setup> {
        self.attrs.iter().find_map(|a| {
            if let MediaAttribute::Setup(v) = a {
                Some(*v)
            } else {
                None
            }
        })
    }

    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.attrs.iter().find_map(|a| {
            if let MediaAttribute::Fingerprint(v) = a {
                Some(v.clone())
            } else {
                None
            }
        })
    }

    /// All a=extmap registrations, (id, uri).
    pub fn extmaps(&self) -> Vec<(u8, &str)> {
        let mut ret = vec![];

        for a in &self.attrs {
            if let MediaAttribute::ExtMap { id, uri } = a {
                ret.push((*id, uri.as_str()));
            }
        }

        ret
    }

    /// Collect payload params for every PT carrying the wanted codec.
    pub fn payloads_for(&self, codec: Codec) -> Vec<PayloadParams> {
        let mut params: Vec<PayloadParams> = vec![];

        for a in &self.attrs {
            if let MediaAttribute::RtpMap {
                pt,
                codec: name,
                clock_rate,
                channels,
            } = a
            {
                if Codec::from(name.as_str()) != codec {
                    continue;
                }
                let mut p = PayloadParams::new(*pt, codec, *clock_rate);
                p.channels = *channels;
                params.push(p);
            }
        }

        for p in &mut params {
            for a in &self.attrs {
                match a {
                    MediaAttribute::Fmtp { pt, value } if *pt == p.pt => {
                        p.format = FormatParams::parse_line(value);
                    }
                    MediaAttribute::RtcpFb { pt, value } if *pt == p.pt => {
                        p.rtcp_fbs.push(value.clone());
                    }
                    _ => {}
                }
            }
        }

        params
    }

    /// a=ssrc lines aggregated per SSRC, in order of first appearance.
    pub fn ssrc_info(&self) -> Vec<SsrcInfo> {
        let mut v: Vec<SsrcInfo> = vec![];

        fn by_ssrc(v: &mut Vec<SsrcInfo>, ssrc: Ssrc) -> &mut SsrcInfo {
            if let Some(pos) = v.iter().position(|i| i.ssrc == ssrc) {
                &mut v[pos]
            } else {
                v.push(SsrcInfo {
                    ssrc,
                    cname: None,
                    stream_id: None,
                    track_id: None,
                });
                v.last_mut().unwrap()
            }
        }

        for a in &self.attrs {
            match a {
                MediaAttribute::Ssrc { ssrc, attr, value } => {
                    let info = by_ssrc(&mut v, *ssrc);

                    // a=ssrc:2147603131 cname:TbS1Ajv9obq6/63I
                    // a=ssrc:2147603131 msid:- 7a08dda6-...
                    match attr.to_lowercase().as_str() {
                        "cname" => info.cname = Some(value.clone()),
                        "msid" => {
                            let mut iter = value.split(' ');

                            fn trim_and_no_minus(s: &str) -> Option<String> {
                                let s = s.trim();
                                if s == "-" {
                                    None
                                } else {
                                    Some(s.into())
                                }
                            }

                            if let Some(stream_id) = iter.next() {
                                info.stream_id = trim_and_no_minus(stream_id);
                            }
                            if let Some(track_id) = iter.next() {
                                info.track_id = trim_and_no_minus(track_id);
                            }
                        }
                        "mslabel" => {
                            if info.stream_id.is_none() {
                                info.stream_id = Some(value.clone());
                            }
                        }
                        "label" => {
                            if info.track_id.is_none() {
                                info.track_id = Some(value.clone());
                            }
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }

        v
    }

    /// All a=ssrc-group lines, (semantics, ssrcs).
    pub fn ssrc_groups(&self) -> Vec<(String, Vec<Ssrc>)> {
        self.attrs
            .iter()
            .filter_map(|a| {
                if let MediaAttribute::SsrcGroup { semantics, ssrcs } = a {
                    Some((semantics.clone(), ssrcs.clone()))
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn check_consistent(&self) -> Option<String> {
        let mid_count = self
            .attrs
            .iter()
            .filter(|a| matches!(a, MediaAttribute::Mid(_)))
            .count();

        if mid_count != 1 {
            return Some(format!(
                "Expected exactly one a=mid, got {} for: {}",
                mid_count, self.typ
            ));
        }

        if self.proto == Proto::Srtp && self.pts.is_empty() {
            return Some(format!("Expected at least one PT for mid: {}", self.mid()));
        }

        None
    }
}

impl fmt::Display for Sdp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.session)?;
        for m in &self.media_lines {
            write!(f, "{}", m)?;
        }
        Ok(())
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v=0\r\n")?;
        write!(f, "o=- {} 2 IN IP4 0.0.0.0\r\n", self.id)?;
        write!(f, "s=-\r\n")?;
        write!(f, "t=0 0\r\n")?;
        for a in &self.attrs {
            write!(f, "{}", a)?;
        }
        Ok(())
    }
}

impl fmt::Display for SessionAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use SessionAttribute::*;
        match self {
            Group { typ, mids } => {
                let m: Vec<String> = mids.iter().map(|m| m.to_string()).collect();
                write!(f, "a=group:{} {}\r\n", typ, m.join(" "))?;
            }
            MsidSemantic {
                semantic,
                stream_ids,
            } => {
                write!(f, "a=msid-semantic: {} {}\r\n", semantic, stream_ids.join(" "))?;
            }
            IceLite => write!(f, "a=ice-lite\r\n")?,
            IceUfrag(v) => write!(f, "a=ice-ufrag:{}\r\n", v)?,
            IcePwd(v) => write!(f, "a=ice-pwd:{}\r\n", v)?,
            IceOptions(v) => write!(f, "a=ice-options:{}\r\n", v)?,
            Fingerprint(v) => write!(f, "a=fingerprint:{}\r\n", v)?,
            Setup(v) => write!(f, "a=setup:{}\r\n", v)?,
            Unused(v) => write!(f, "a={}\r\n", v)?,
        }
        Ok(())
    }
}

impl fmt::Display for MediaLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let port = if self.disabled { 0 } else { 9 };
        write!(f, "m={} {} {}", self.typ, port, self.proto)?;
        for pt in &self.pts {
            write!(f, " {}", pt)?;
        }
        write!(f, "\r\n")?;
        write!(f, "c=IN IP4 0.0.0.0\r\n")?;
        for a in &self.attrs {
            write!(f, "{}", a)?;
        }
        Ok(())
    }
}

impl fmt::Display for MediaAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use MediaAttribute::*;
        match self {
            Rtcp(v) => write!(f, "a=rtcp:{}\r\n", v)?,
            IceUfrag(v) => write!(f, "a=ice-ufrag:{}\r\n", v)?,
            IcePwd(v) => write!(f, "a=ice-pwd:{}\r\n", v)?,
            IceOptions(v) => write!(f, "a=ice-options:{}\r\n", v)?,
            Fingerprint(v) => write!(f, "a=fingerprint:{}\r\n", v)?,
            Setup(v) => write!(f, "a=setup:{}\r\n", v)?,
            Mid(v) => write!(f, "a=mid:{}\r\n", v)?,
            ExtMap { id, uri } => write!(f, "a=extmap:{} {}\r\n", id, uri)?,
            RecvOnly => write!(f, "a=recvonly\r\n")?,
            SendRecv => write!(f, "a=sendrecv\r\n")?,
            SendOnly => write!(f, "a=sendonly\r\n")?,
            Inactive => write!(f, "a=inactive\r\n")?,
            Msid {
                stream_id,
                track_id,
            } => write!(f, "a=msid:{} {}\r\n", stream_id, track_id)?,
            RtcpMux => write!(f, "a=rtcp-mux\r\n")?,
            RtcpRsize => write!(f, "a=rtcp-rsize\r\n")?,
            RtpMap {
                pt,
                codec,
                clock_rate,
                channels,
            } => {
                write!(f, "a=rtpmap:{} {}/{}", pt, codec, clock_rate)?;
                if let Some(c) = channels {
                    write!(f, "/{}", c)?;
                }
                write!(f, "\r\n")?;
            }
            RtcpFb { pt, value } => write!(f, "a=rtcp-fb:{} {}\r\n", pt, value)?,
            Fmtp { pt, value } => write!(f, "a=fmtp:{} {}\r\n", pt, value)?,
            SsrcGroup { semantics, ssrcs } => {
                let s: Vec<String> = ssrcs.iter().map(|s| s.to_string()).collect();
                write!(f, "a=ssrc-group:{} {}\r\n", semantics, s.join(" "))?;
            }
            Ssrc { ssrc, attr, value } => write!(f, "a=ssrc:{} {}:{}\r\n", ssrc, attr, value)?,
            Candidate(v) => write!(f, "a=candidate:{}\r\n", v)?,
            EndOfCandidates => write!(f, "a=end-of-candidates\r\n")?,
            Unused(v) => write!(f, "a={}\r\n", v)?,
        }
        Ok(())
    }
}
