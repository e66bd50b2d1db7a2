//! SDP offer/answer negotiation.
//!
//! Publish: intersect the remote offer with what the server accepts
//! (opus, H.264, auxiliary payloads, feedback per config) and enumerate
//! the offered SSRCs into track descriptions.
//!
//! Play: copy the published tracks, intersect feedback, assign fresh play
//! SSRCs (one shared per merge group) and emit a plan-B style answer.

use std::collections::BTreeMap;

use crate::config::RtcConfig;
use crate::crypto::Fingerprint;
use crate::format::{Codec, PayloadParams};
use crate::rtp::{Mid, Ssrc, PICTURE_ID_URI, TWCC_URI};
use crate::sdp::{MediaAttribute, MediaLine, MediaType, Proto, Sdp, Session, SessionAttribute, Setup};
use crate::source::{MediaSource, MergeGroupPolicy, Request, SsrcAllocator};
use crate::streams::TrackKind;
use crate::util::random_id;
use crate::RtcError;

use crate::sdp::Direction;

/// Semantic description of one negotiated track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackDescription {
    pub kind: TrackKind,
    /// Track id ("label"), the msid tracker part.
    pub id: String,
    /// Stream id, the msid part.
    pub msid: String,
    pub mid: Mid,
    pub direction: Direction,
    /// Primary SSRC.
    pub ssrc: Ssrc,
    /// Resend SSRC from an FID group.
    pub rtx_ssrc: Option<Ssrc>,
    /// FEC SSRC from an FEC group.
    pub fec_ssrc: Option<Ssrc>,
    /// The media payload (opus or H.264).
    pub media: PayloadParams,
    /// Auxiliary payloads when offered.
    pub red: Option<PayloadParams>,
    pub rtx: Option<PayloadParams>,
    pub ulpfec: Option<PayloadParams>,
    pub rsfec: Option<PayloadParams>,
    /// Registered RTP header extensions, (id, uri).
    pub extmaps: Vec<(u8, String)>,
}

impl TrackDescription {
    /// The extension id registered for a uri, if any.
    pub fn extension_id(&self, uri: &str) -> Option<u8> {
        self.extmaps
            .iter()
            .find(|(_, u)| u == uri)
            .map(|(id, _)| *id)
    }

    /// Whether this track references the SSRC (primary, rtx or fec).
    pub fn has_ssrc(&self, ssrc: Ssrc) -> bool {
        self.ssrc == ssrc || self.rtx_ssrc == Some(ssrc) || self.fec_ssrc == Some(ssrc)
    }

    #[cfg(test)]
    pub(crate) fn for_test(kind: TrackKind, ssrc: Ssrc) -> TrackDescription {
        let (codec, clock) = match kind {
            TrackKind::Audio => (Codec::Opus, 48_000),
            TrackKind::Video => (Codec::H264, 90_000),
        };
        TrackDescription {
            kind,
            id: format!("{}0", kind),
            msid: "test".into(),
            mid: "0".into(),
            direction: Direction::RecvOnly,
            ssrc,
            rtx_ssrc: None,
            fec_ssrc: None,
            media: PayloadParams::new(
                match kind {
                    TrackKind::Audio => 111.into(),
                    TrackKind::Video => 102.into(),
                },
                codec,
                clock,
            ),
            red: None,
            rtx: None,
            ulpfec: None,
            rsfec: None,
            extmaps: vec![],
        }
    }
}

/// Composition of one optional audio track and a list of video tracks.
#[derive(Debug, Clone, Default)]
pub struct StreamDescription {
    pub audio: Option<TrackDescription>,
    pub video: Vec<TrackDescription>,
}

impl StreamDescription {
    pub fn find_track_by_ssrc_mut(&mut self, ssrc: Ssrc) -> Option<&mut TrackDescription> {
        if let Some(a) = &mut self.audio {
            if a.ssrc == ssrc {
                return Some(a);
            }
        }
        self.video.iter_mut().find(|t| t.ssrc == ssrc)
    }

    /// All tracks, audio first.
    pub fn tracks(&self) -> impl Iterator<Item = &TrackDescription> {
        self.audio.iter().chain(self.video.iter())
    }
}

/// One entry of a `set_track_active` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackConfig {
    pub kind: TrackKind,
    pub label: String,
    pub active: bool,
}

/// Parameters common to every answer we produce.
pub struct AnswerParams<'a> {
    pub req: &'a Request,
    pub ice_ufrag: &'a str,
    pub ice_pwd: &'a str,
    pub fingerprint: &'a Fingerprint,
    /// Local DTLS role for `a=setup`.
    pub setup: Setup,
}

/// Offer→answer negotiation over the per-vhost config.
pub struct SdpNegotiator<'a> {
    pub config: &'a RtcConfig,
}

impl<'a> SdpNegotiator<'a> {
    pub fn new(config: &'a RtcConfig) -> Self {
        SdpNegotiator { config }
    }

    /// Negotiate what a publisher offers down to the stream description
    /// the server will receive.
    pub fn negotiate_publish(&self, remote: &Sdp) -> Result<StreamDescription, RtcError> {
        let mut desc = StreamDescription::default();

        for remote_media in &remote.media_lines {
            let kind = match remote_media.typ {
                MediaType::Audio => TrackKind::Audio,
                MediaType::Video => TrackKind::Video,
                _ => continue,
            };
            if remote_media.disabled {
                continue;
            }

            // Whether features are enabled in the remote extmap.
            let remote_twcc_id = find_extmap(remote_media, TWCC_URI);
            let picture_id = find_extmap(remote_media, PICTURE_ID_URI);

            let mut extmaps = vec![];
            if self.config.twcc_enabled {
                if let Some(id) = remote_twcc_id {
                    extmaps.push((id, TWCC_URI.to_string()));
                }
            }
            if let Some(id) = picture_id {
                extmaps.push((id, PICTURE_ID_URI.to_string()));
            }

            let media = match kind {
                TrackKind::Audio => self.pick_audio_payload(remote_media, remote_twcc_id)?,
                TrackKind::Video => self.pick_video_payload(remote_media, remote_twcc_id)?,
            };

            let template = TrackDescription {
                kind,
                id: String::new(),
                msid: String::new(),
                mid: remote_media.mid(),
                direction: Direction::RecvOnly,
                ssrc: 0.into(),
                rtx_ssrc: None,
                fec_ssrc: None,
                media,
                red: first_payload(remote_media, Codec::Red),
                rtx: first_payload(remote_media, Codec::Rtx),
                ulpfec: first_payload(remote_media, Codec::Ulpfec),
                rsfec: first_payload(remote_media, Codec::Rsfec),
                extmaps,
            };

            // Enumerate SSRCs. Consecutive infos with the same msid tracker
            // belong to the same track (rtx/fec ride along and resolve via
            // the ssrc-group lines below).
            let mut prev_track_id: Option<String> = None;
            for info in remote_media.ssrc_info() {
                if prev_track_id != info.track_id || info.track_id.is_none() {
                    let mut track = template.clone();
                    track.ssrc = info.ssrc;
                    track.id = info.track_id.clone().unwrap_or_default();
                    track.msid = info.stream_id.clone().unwrap_or_default();

                    if kind == TrackKind::Audio {
                        if desc.audio.is_none() {
                            desc.audio = Some(track);
                        }
                    } else {
                        desc.video.push(track);
                    }
                }
                prev_track_id = info.track_id;
            }

            // Resolve rtx/fec SSRCs from the group lines.
            for (semantics, ssrcs) in remote_media.ssrc_groups() {
                if ssrcs.len() < 2 {
                    continue;
                }
                let Some(track) = desc.find_track_by_ssrc_mut(ssrcs[0]) else {
                    warn!(
                        "ssrc-group:{} references unknown ssrc {}",
                        semantics, ssrcs[0]
                    );
                    continue;
                };

                match semantics.as_str() {
                    "FID" => track.rtx_ssrc = Some(ssrcs[1]),
                    "FEC" => track.fec_ssrc = Some(ssrcs[1]),
                    _ => {}
                }
            }
        }

        Ok(desc)
    }

    /// Negotiate a play session against the published tracks of `source`.
    ///
    /// Returns the subscribe relations: publish SSRC → play track.
    pub fn negotiate_play(
        &self,
        remote: &Sdp,
        source: &dyn MediaSource,
        ssrcs: &dyn SsrcAllocator,
        merge: &dyn MergeGroupPolicy,
        req: &Request,
    ) -> Result<BTreeMap<Ssrc, TrackDescription>, RtcError> {
        // Merged tracks alternate on the wire, so they share one SSRC.
        let merged_ssrc = ssrcs.allocate();

        let mut relations = BTreeMap::new();

        for remote_media in &remote.media_lines {
            let (kind, codec) = match remote_media.typ {
                MediaType::Audio => (TrackKind::Audio, Codec::Opus),
                MediaType::Video => (TrackKind::Video, Codec::H264),
                _ => continue,
            };
            if remote_media.disabled {
                continue;
            }

            let remote_twcc_id = find_extmap(remote_media, TWCC_URI);

            let remote_payloads = remote_media.payloads_for(codec);
            let Some(remote_payload) = remote_payloads.first() else {
                return Err(RtcError::NoCompatibleCodec(codec.sdp_name()));
            };
            let remote_fbs = &remote_payload.rtcp_fbs;

            for track in source.track_descs(kind, codec) {
                let mut track = track;
                track.mid = remote_media.mid();

                let publish_ssrc = track.ssrc;

                // Intersect the published feedback set with what the
                // subscriber offered and what config allows.
                track.media.rtcp_fbs.retain(|fb| remote_fbs.contains(fb));
                track.media.filter_rtcp_fbs(
                    self.config.nack_enabled,
                    self.config.twcc_enabled && remote_twcc_id.is_some(),
                );

                // Extensions are negotiated per subscriber; the publisher's
                // ids don't apply here.
                track.extmaps.clear();
                if self.config.twcc_enabled {
                    if let Some(id) = remote_twcc_id {
                        track.extmaps.push((id, TWCC_URI.to_string()));
                    }
                }

                self.assign_play_ssrc(&mut track, merged_ssrc, ssrcs, merge);

                relations.insert(publish_ssrc, track);
            }
        }

        if relations.is_empty() {
            return Err(RtcError::NoRelations(req.stream_url()));
        }

        Ok(relations)
    }

    /// Like [`negotiate_play`] but without a remote offer: derive the play
    /// session straight from the source capability.
    pub fn fetch_source_capability(
        &self,
        source: &dyn MediaSource,
        ssrcs: &dyn SsrcAllocator,
        merge: &dyn MergeGroupPolicy,
        req: &Request,
    ) -> Result<BTreeMap<Ssrc, TrackDescription>, RtcError> {
        let merged_ssrc = ssrcs.allocate();

        let mut relations = BTreeMap::new();

        let mut tracks = source.track_descs(TrackKind::Audio, Codec::Opus);
        tracks.extend(source.track_descs(TrackKind::Video, Codec::H264));

        for mut track in tracks {
            let publish_ssrc = track.ssrc;
            let local_twcc_id = track.extension_id(TWCC_URI);

            track.media.filter_rtcp_fbs(
                self.config.nack_enabled,
                self.config.twcc_enabled && local_twcc_id.is_some(),
            );

            self.assign_play_ssrc(&mut track, merged_ssrc, ssrcs, merge);

            relations.insert(publish_ssrc, track);
        }

        if relations.is_empty() {
            return Err(RtcError::NoRelations(req.stream_url()));
        }

        Ok(relations)
    }

    fn assign_play_ssrc(
        &self,
        track: &mut TrackDescription,
        merged_ssrc: Ssrc,
        ssrcs: &dyn SsrcAllocator,
        merge: &dyn MergeGroupPolicy,
    ) {
        if merge.merged_track_id(&track.id) != track.id {
            track.ssrc = merged_ssrc;
        } else {
            track.ssrc = ssrcs.allocate();
        }

        // No downlink RTX or FEC.
        track.rtx = None;
        track.rtx_ssrc = None;
        track.fec_ssrc = None;

        track.direction = Direction::SendOnly;
    }

    fn pick_audio_payload(
        &self,
        m: &MediaLine,
        remote_twcc_id: Option<u8>,
    ) -> Result<PayloadParams, RtcError> {
        let mut payloads = m.payloads_for(Codec::Opus);
        if payloads.is_empty() {
            return Err(RtcError::NoCompatibleCodec("opus"));
        }

        // Only choose one matching opus codec.
        let mut payload = payloads.remove(0);
        payload.filter_rtcp_fbs(
            self.config.nack_enabled,
            self.config.twcc_enabled && remote_twcc_id.is_some(),
        );
        Ok(payload)
    }

    fn pick_video_payload(
        &self,
        m: &MediaLine,
        remote_twcc_id: Option<u8>,
    ) -> Result<PayloadParams, RtcError> {
        let payloads = m.payloads_for(Codec::H264);
        if payloads.is_empty() {
            return Err(RtcError::NoCompatibleCodec("H264"));
        }

        // Pick the best match H.264 payload type: packetization-mode=1
        // and level-asymmetry-allowed=1, else the first with a valid
        // fmtp, else any.
        let best = payloads.iter().find(|p| {
            p.format.packetization_mode == Some(1) && p.format.level_asymmetry_allowed == Some(true)
        });
        let backup = payloads.iter().find(|p| !p.format.is_empty());

        let mut payload = best
            .or(backup)
            .or(payloads.first())
            .cloned()
            .expect("at least one H264 payload");

        if best.is_none() {
            warn!("choose backup H.264 payload type={}", payload.pt);
        }

        payload.filter_rtcp_fbs(
            self.config.nack_enabled,
            self.config.twcc_enabled && remote_twcc_id.is_some(),
        );
        Ok(payload)
    }
}

fn find_extmap(m: &MediaLine, uri: &str) -> Option<u8> {
    m.extmaps()
        .into_iter()
        .find(|(_, u)| *u == uri)
        .map(|(id, _)| id)
}

fn first_payload(m: &MediaLine, codec: Codec) -> Option<PayloadParams> {
    m.payloads_for(codec).into_iter().next()
}

/// The answer to a publish offer: every negotiated section as recvonly.
pub fn answer_publish(params: &AnswerParams, desc: &StreamDescription) -> Sdp {
    let mut media_lines = vec![];
    let mut mids = vec![];

    if let Some(audio) = &desc.audio {
        let m = media_section(params, audio, MediaType::Audio, vec![], None);
        mids.push(audio.mid);
        media_lines.push(m);
    }

    // Video tracks of one publisher share a media section; the section
    // settings come from the first.
    if let Some(video) = desc.video.first() {
        let m = media_section(params, video, MediaType::Video, vec![], None);
        mids.push(video.mid);
        media_lines.push(m);
    }

    Sdp {
        session: session_for(params, mids),
        media_lines,
    }
}

/// The answer for a play request. Plan-B: all video tracks collapse into
/// one media section with distinct ssrc infos.
pub fn answer_play(
    params: &AnswerParams,
    desc: &StreamDescription,
    merge: &dyn MergeGroupPolicy,
) -> Sdp {
    let cname = random_id(16);

    let mut media_lines = vec![];
    let mut mids = vec![];

    if let Some(audio) = &desc.audio {
        let ssrc_attrs = ssrc_attrs_for(audio, &cname, params.req);
        let m = media_section(params, audio, MediaType::Audio, ssrc_attrs, None);
        mids.push(audio.mid);
        media_lines.push(m);
    }

    if let Some(first) = desc.video.first() {
        let mut ssrc_attrs = vec![];
        let mut merged_done = false;

        for track in &desc.video {
            // Merged alternatives share one SSRC; only the group id shows
            // up in the answer.
            let merged_id = merge.merged_track_id(&track.id);
            if merged_id != track.id {
                if merged_done {
                    continue;
                }
                let mut t = track.clone();
                t.id = merged_id;
                ssrc_attrs.extend(ssrc_attrs_for(&t, &cname, params.req));
                merged_done = true;
            } else {
                ssrc_attrs.extend(ssrc_attrs_for(track, &cname, params.req));
            }
        }

        let m = media_section(params, first, MediaType::Video, ssrc_attrs, None);
        mids.push(first.mid);
        media_lines.push(m);
    }

    Sdp {
        session: session_for(params, mids),
        media_lines,
    }
}

fn session_for(params: &AnswerParams, mids: Vec<Mid>) -> Session {
    Session {
        id: fastrand::u64(..i64::MAX as u64),
        attrs: vec![
            SessionAttribute::Group {
                typ: "BUNDLE".into(),
                mids,
            },
            SessionAttribute::MsidSemantic {
                semantic: "WMS".into(),
                stream_ids: vec![params.req.stream_url()],
            },
            SessionAttribute::IceLite,
        ],
    }
}

fn media_section(
    params: &AnswerParams,
    track: &TrackDescription,
    typ: MediaType,
    ssrc_attrs: Vec<MediaAttribute>,
    override_direction: Option<Direction>,
) -> MediaLine {
    // The primary payload plus every auxiliary payload present.
    let payloads: Vec<&PayloadParams> = [
        Some(&track.media),
        track.red.as_ref(),
        track.rtx.as_ref(),
        track.ulpfec.as_ref(),
        track.rsfec.as_ref(),
    ]
    .into_iter()
    .flatten()
    .collect();

    let pts = payloads.iter().map(|p| p.pt).collect();

    let mut attrs = vec![
        MediaAttribute::IceUfrag(params.ice_ufrag.to_string()),
        MediaAttribute::IcePwd(params.ice_pwd.to_string()),
        MediaAttribute::Fingerprint(params.fingerprint.clone()),
        MediaAttribute::Setup(params.setup),
        MediaAttribute::Mid(track.mid),
    ];

    for (id, uri) in &track.extmaps {
        attrs.push(MediaAttribute::ExtMap {
            id: *id,
            uri: uri.clone(),
        });
    }

    let direction = override_direction.unwrap_or(track.direction);
    attrs.push(match direction {
        Direction::SendOnly => MediaAttribute::SendOnly,
        Direction::RecvOnly => MediaAttribute::RecvOnly,
        Direction::SendRecv => MediaAttribute::SendRecv,
        Direction::Inactive => MediaAttribute::Inactive,
    });

    attrs.push(MediaAttribute::RtcpMux);
    attrs.push(MediaAttribute::RtcpRsize);

    for p in &payloads {
        attrs.push(MediaAttribute::RtpMap {
            pt: p.pt,
            codec: p.codec.sdp_name().to_string(),
            clock_rate: p.clock_rate,
            channels: p.channels,
        });
        for fb in &p.rtcp_fbs {
            attrs.push(MediaAttribute::RtcpFb {
                pt: p.pt,
                value: fb.clone(),
            });
        }
        if !p.format.is_empty() {
            attrs.push(MediaAttribute::Fmtp {
                pt: p.pt,
                value: p.format.to_string(),
            });
        }
    }

    attrs.extend(ssrc_attrs);

    MediaLine {
        typ,
        disabled: false,
        proto: Proto::Srtp,
        pts,
        attrs,
    }
}

fn ssrc_attrs_for(track: &TrackDescription, cname: &str, req: &Request) -> Vec<MediaAttribute> {
    let msid = if track.msid.is_empty() {
        req.stream_url()
    } else {
        track.msid.clone()
    };

    let mut attrs = vec![];

    fn push_info(
        attrs: &mut Vec<MediaAttribute>,
        ssrc: Ssrc,
        cname: &str,
        msid: &str,
        track: &TrackDescription,
    ) {
        attrs.push(MediaAttribute::Ssrc {
            ssrc,
            attr: "cname".into(),
            value: cname.to_string(),
        });
        attrs.push(MediaAttribute::Ssrc {
            ssrc,
            attr: "msid".into(),
            value: format!("{} {}", msid, track.id),
        });
        attrs.push(MediaAttribute::Ssrc {
            ssrc,
            attr: "mslabel".into(),
            value: msid.to_string(),
        });
        attrs.push(MediaAttribute::Ssrc {
            ssrc,
            attr: "label".into(),
            value: track.id.clone(),
        });
    }

    push_info(&mut attrs, track.ssrc, cname, &msid, track);

    if let Some(rtx_ssrc) = track.rtx_ssrc {
        if track.rtx.is_some() {
            attrs.insert(
                0,
                MediaAttribute::SsrcGroup {
                    semantics: "FID".into(),
                    ssrcs: vec![track.ssrc, rtx_ssrc],
                },
            );
            push_info(&mut attrs, rtx_ssrc, cname, &msid, track);
        }
    }

    if let Some(fec_ssrc) = track.fec_ssrc {
        if track.ulpfec.is_some() || track.rsfec.is_some() {
            attrs.insert(
                0,
                MediaAttribute::SsrcGroup {
                    semantics: "FEC".into(),
                    ssrcs: vec![track.ssrc, fec_ssrc],
                },
            );
            push_info(&mut attrs, fec_ssrc, cname, &msid, track);
        }
    }

    attrs
}

#[cfg(test)]
mod test {
    use super::*;

    const OFFER: &str ="v=0\r\n\
o=- 100 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0 1\r\n\
a=msid-semantic: WMS m\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 0.0.0.0\r\n\
a=ice-ufrag:S5hk\r\n\
a=ice-pwd:0zV7Cu3mH45t2cbr0hIS7G5A\r\n\
a=fingerprint:sha-256 45:AD:5C:82:F8:BE:B5:2A:D1:74:A6:16:D0:50:CD:86:9C:97:9D:BD:06:8C:C9:85:C9:CD:AB:2B:A8:56:03:CD\r\n\
a=setup:actpass\r\n\
a=mid:0\r\n\
a=sendonly\r\n\
a=rtcp-mux\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=rtcp-fb:111 nack\r\n\
a=rtcp-fb:111 transport-cc\r\n\
a=fmtp:111 minptime=10;useinbandfec=1\r\n\
a=ssrc:1001 cname:c1\r\n\
a=ssrc:1001 msid:m t\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 102 98\r\n\
c=IN IP4 0.0.0.0\r\n\
a=ice-ufrag:S5hk\r\n\
a=ice-pwd:0zV7Cu3mH45t2cbr0hIS7G5A\r\n\
a=fingerprint:sha-256 45:AD:5C:82:F8:BE:B5:2A:D1:74:A6:16:D0:50:CD:86:9C:97:9D:BD:06:8C:C9:85:C9:CD:AB:2B:A8:56:03:CD\r\n\
a=setup:actpass\r\n\
a=mid:1\r\n\
a=sendonly\r\n\
a=rtcp-mux\r\n\
a=rtcp-rsize\r\n\
a=rtpmap:102 H264/90000\r\n\
a=rtcp-fb:102 nack\r\n\
a=rtcp-fb:102 nack pli\r\n\
a=rtcp-fb:102 transport-cc\r\n\
a=fmtp:102 profile-level-id=42e01f;level-asymmetry-allowed=1;packetization-mode=1\r\n\
a=rtpmap:98 H264/90000\r\n\
a=fmtp:98 profile-level-id=42e01f;level-asymmetry-allowed=1;packetization-mode=0\r\n\
a=ssrc:1002 cname:c1\r\n\
a=ssrc:1002 msid:m t\r\n";

    fn fingerprint() -> Fingerprint {
        Fingerprint {
            hash_func: "sha-256".into(),
            bytes: vec![0xab; 32],
        }
    }

    #[test]
    fn publish_negotiation_scenario() {
        // Offer has opus PT 111 and H.264 PT 102 (packetization-mode=1),
        // SSRCs 1001/1002 with msid "m/t"-style info. NACK on, TWCC off.
        let config = RtcConfig {
            nack_enabled: true,
            twcc_enabled: false,
            ..Default::default()
        };
        let remote = Sdp::parse(OFFER).unwrap();

        let neg = SdpNegotiator::new(&config);
        let desc = neg.negotiate_publish(&remote).unwrap();

        let audio = desc.audio.as_ref().unwrap();
        assert_eq!(*audio.media.pt, 111);
        assert_eq!(audio.ssrc, 1001.into());
        assert_eq!(audio.id, "t");
        assert_eq!(audio.msid, "m");
        assert_eq!(audio.media.rtcp_fbs, vec!["nack"]);

        assert_eq!(desc.video.len(), 1);
        let video = &desc.video[0];
        assert_eq!(*video.media.pt, 102);
        assert_eq!(video.media.format.packetization_mode, Some(1));
        assert_eq!(video.media.rtcp_fbs, vec!["nack", "nack pli"]);
        assert_eq!(video.ssrc, 1002.into());

        let req = Request::new("__defaultVhost__", "live", "show");
        let params = AnswerParams {
            req: &req,
            ice_ufrag: "srsufrag",
            ice_pwd: "srspwd4567890123456789012",
            fingerprint: &fingerprint(),
            setup: Setup::Active,
        };

        let answer = answer_publish(&params, &desc);
        let out = answer.to_string();

        // one audio + one video m-section, BUNDLE of both mids
        assert_eq!(answer.media_lines.len(), 2);
        assert!(out.contains("a=group:BUNDLE 0 1\r\n"));
        assert!(out.contains("a=setup:active\r\n"));
        assert!(out.contains("a=ice-lite\r\n"));
        assert!(out.contains("a=rtcp-mux\r\n"));
        assert!(out.contains("a=rtcp-rsize\r\n"));
        assert!(out.contains("a=rtcp-fb:111 nack\r\n"));
        assert!(out.contains("a=rtcp-fb:102 nack\r\n"));
        assert!(out.contains("a=rtcp-fb:102 nack pli\r\n"));
        assert!(!out.contains("transport-cc"));
        assert!(out.contains("a=recvonly\r\n"));

        // the answer parses back to the same codec set
        let back = Sdp::parse(&out).unwrap();
        let h264 = back.media_lines[1].payloads_for(Codec::H264);
        assert_eq!(*h264[0].pt, 102);
        assert_eq!(h264[0].format.packetization_mode, Some(1));
        assert_eq!(h264[0].format.profile_level_id, Some(0x42e01f));
    }

    #[test]
    fn publish_without_opus_fails() {
        let offer = OFFER.replace("opus/48000/2", "PCMU/8000");
        let remote = Sdp::parse(&offer).unwrap();

        let config = RtcConfig::default();
        let neg = SdpNegotiator::new(&config);
        let err = neg.negotiate_publish(&remote).unwrap_err();
        assert!(matches!(err, RtcError::NoCompatibleCodec("opus")));
    }

    #[test]
    fn track_description_sdp_roundtrip() {
        let config = RtcConfig {
            nack_enabled: true,
            twcc_enabled: true,
            ..Default::default()
        };
        let remote = Sdp::parse(OFFER).unwrap();
        let neg = SdpNegotiator::new(&config);
        let desc = neg.negotiate_publish(&remote).unwrap();

        // Render the description as a play-style answer (sendonly with
        // ssrc lines) and parse it back.
        let mut play_desc = desc.clone();
        for t in play_desc
            .audio
            .iter_mut()
            .chain(play_desc.video.iter_mut())
        {
            t.direction = Direction::SendOnly;
        }

        let req = Request::new("v", "live", "show");
        let params = AnswerParams {
            req: &req,
            ice_ufrag: "uf",
            ice_pwd: "pw",
            fingerprint: &fingerprint(),
            setup: Setup::Active,
        };
        let sdp = answer_play(&params, &play_desc, &crate::source::NoMerge);
        let back = Sdp::parse(&sdp.to_string()).unwrap();

        // audio section round trip
        let audio = &back.media_lines[0];
        let opus = audio.payloads_for(Codec::Opus);
        let orig = play_desc.audio.as_ref().unwrap();
        assert_eq!(opus[0].pt, orig.media.pt);
        assert_eq!(opus[0].rtcp_fbs, orig.media.rtcp_fbs);
        assert_eq!(opus[0].format, orig.media.format);
        let infos = audio.ssrc_info();
        assert_eq!(infos[0].ssrc, orig.ssrc);
        assert_eq!(infos[0].track_id.as_deref(), Some(orig.id.as_str()));

        // video section round trip
        let video = &back.media_lines[1];
        let h264 = video.payloads_for(Codec::H264);
        let orig = &play_desc.video[0];
        assert_eq!(h264[0].pt, orig.media.pt);
        assert_eq!(h264[0].format, orig.media.format);
        assert_eq!(video.extmaps().len(), orig.extmaps.len());
        let infos = video.ssrc_info();
        assert_eq!(infos[0].ssrc, orig.ssrc);
    }
}
