//! The play side of a connection: server → peer media.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::RtcConfig;
use crate::negotiate::{TrackConfig, TrackDescription};
use crate::packet::RtpPacket;
use crate::rtp::{Extension, ExtensionMap, Rtcp, SeqNo, Ssrc, Twcc, TWCC_URI};
use crate::source::{Consumer, MediaSource, MergeGroupPolicy, Request, SourceRegistry};
use crate::streams::{SendTrack, StreamSwitchContext, TrackKind};
use crate::RtcError;

/// What inbound RTCP on the play side asks the connection to do.
#[derive(Default)]
pub struct PlayFeedback {
    /// Cached packets to retransmit through the egress chokepoint.
    pub resends: Vec<(RtpPacket, SeqNo)>,
    /// TWCC feedback to hand to the congestion controller.
    pub twcc: Vec<Twcc>,
    pub nn_nacks: u64,
    pub nn_plis: u64,
    pub nn_srs: u64,
    pub nn_rrs: u64,
    pub nn_xrs: u64,
}

/// Owns the send tracks of one subscriber, consuming from the shared
/// stream fan-out and answering its RTCP.
pub struct PlayStream {
    req: Request,

    /// Keyed by *publish* SSRC: packets arrive from the fan-out carrying
    /// the publisher's SSRCs and are re-stamped by the tracks.
    audio_tracks: BTreeMap<Ssrc, SendTrack>,
    video_tracks: BTreeMap<Ssrc, SendTrack>,

    switch: StreamSwitchContext,

    nack_enabled: bool,
    mw_msgs: usize,

    /// Send-side extension mapping (TWCC id negotiated with this peer).
    extmap: ExtensionMap,
    twcc_id: u8,

    consumer: Option<Consumer>,
    source: Option<Arc<dyn MediaSource>>,
    started: bool,
}

impl PlayStream {
    pub fn new(
        req: Request,
        relations: BTreeMap<Ssrc, TrackDescription>,
        config: &RtcConfig,
        merge: Arc<dyn MergeGroupPolicy>,
    ) -> Self {
        let mut switch = StreamSwitchContext::new(merge);

        let mut audio_tracks = BTreeMap::new();
        let mut video_tracks = BTreeMap::new();
        let mut extmap = ExtensionMap::empty();
        let mut twcc_id = 0;

        for (publish_ssrc, desc) in relations {
            if let Some(id) = desc.extension_id(TWCC_URI) {
                twcc_id = id;
            }

            let mut track = SendTrack::new(&desc);
            match desc.kind {
                TrackKind::Audio => {
                    track.set_track_status(true);
                    audio_tracks.insert(publish_ssrc, track);
                }
                TrackKind::Video => {
                    switch.register(&mut track);
                    video_tracks.insert(publish_ssrc, track);
                }
            }
        }

        if twcc_id > 0 {
            extmap.set(twcc_id, Extension::TransportSequenceNumber);
        }

        info!("RTC player nack={}", config.nack_enabled);

        PlayStream {
            req,
            audio_tracks,
            video_tracks,
            switch,
            nack_enabled: config.nack_enabled,
            mw_msgs: config.effective_mw_msgs(),
            extmap,
            twcc_id,
            consumer: None,
            source: None,
            started: false,
        }
    }

    /// Attach to the stream registry: create a consumer and seed it from
    /// the GOP cache. For merge-group tracks that start out preparing,
    /// request a key-frame so the switch can happen soon.
    ///
    /// Idempotent: DTLS may retransmit the final flight.
    pub fn start(&mut self, registry: &dyn SourceRegistry) -> Result<(), RtcError> {
        if self.started {
            return Ok(());
        }

        let source = registry.fetch_or_create(&self.req)?;

        let consumer = source.subscribe();
        source.dump_gop_cache(&consumer);

        // A preparing track can't go live before a key-frame; ask for one.
        for (publish_ssrc, track) in &self.video_tracks {
            if self.switch.is_track_preparing(track) {
                source.request_keyframe(*publish_ssrc);
            }
        }

        info!(
            "RTC start play url={}, mw_msgs={}",
            self.req.stream_url(),
            self.mw_msgs
        );

        self.consumer = Some(consumer);
        self.source = Some(source);
        self.started = true;

        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn mw_msgs(&self) -> usize {
        self.mw_msgs
    }

    pub fn extmap(&self) -> &ExtensionMap {
        &self.extmap
    }

    /// The negotiated TWCC extension id, 0 when disabled.
    pub fn twcc_id(&self) -> u8 {
        self.twcc_id
    }

    pub fn consumer_mut(&mut self) -> Option<&mut Consumer> {
        self.consumer.as_mut()
    }

    /// Move the consumer out, so the connection task can wait on it
    /// without borrowing the play stream.
    pub fn take_consumer(&mut self) -> Option<Consumer> {
        self.consumer.take()
    }

    /// Route one consumer batch to the tracks, re-stamping identity.
    ///
    /// Packets whose SSRC none of our tracks subscribe to are skipped.
    /// Video packets go through the switch context first, so a key-frame
    /// on the preparing track flips the active track before forwarding.
    pub fn stamp_batch(&mut self, pkts: Vec<RtpPacket>) -> Vec<(RtpPacket, SeqNo)> {
        let mut out = Vec::with_capacity(pkts.len());

        for pkt in pkts {
            let publish_ssrc = pkt.header.ssrc;

            if let Some(track) = self.audio_tracks.get_mut(&publish_ssrc) {
                if let Some(stamped) = track.on_rtp(pkt) {
                    out.push(stamped);
                }
                continue;
            }

            let Some(track) = self.video_tracks.get_mut(&publish_ssrc) else {
                continue;
            };

            // If this is a key-frame on the preparing track, switch to it
            // and disable the previously active one.
            let deactivate = self.switch.try_switch_stream(track, &pkt);
            if let Some(id) = deactivate {
                for other in self.video_tracks.values_mut() {
                    if other.track_id() == id {
                        other.set_track_status(false);
                    }
                }
            }

            let track = self.video_tracks.get_mut(&publish_ssrc).expect("track");
            if let Some(stamped) = track.on_rtp(pkt) {
                out.push(stamped);
            }
        }

        out
    }

    /// Inbound RTCP from the subscriber (already unprotected and parsed).
    pub fn on_rtcp(&mut self, packets: &[Rtcp]) -> PlayFeedback {
        let mut feedback = PlayFeedback::default();

        for packet in packets {
            match packet {
                Rtcp::Nack(nack) => {
                    self.handle_nack(nack, &mut feedback);
                }
                Rtcp::Pli(pli) => {
                    feedback.nn_plis += 1;

                    // Resolve the publish SSRC from the play-side SSRC and
                    // relay the key-frame request upstream.
                    let Some(publish_ssrc) = self.video_publish_ssrc(pli.ssrc) else {
                        debug!("PLI for unknown play ssrc {}", pli.ssrc);
                        continue;
                    };
                    if let Some(source) = &self.source {
                        info!("RTC request PLI, play={}, publish={}", pli.ssrc, publish_ssrc);
                        source.request_keyframe(publish_ssrc);
                    }
                }
                Rtcp::Twcc(twcc) => {
                    feedback.twcc.push(twcc.clone());
                }
                Rtcp::SenderReport(_) => feedback.nn_srs += 1,
                Rtcp::ReceiverReport(_) => feedback.nn_rrs += 1,
                Rtcp::ExtendedReport(_) => feedback.nn_xrs += 1,
            }
        }

        feedback
    }

    fn handle_nack(&mut self, nack: &crate::rtp::Nack, feedback: &mut PlayFeedback) {
        feedback.nn_nacks += 1;

        // If NACK is disabled by config, print a log.
        if !self.nack_enabled {
            trace!("RTC NACK ssrc={}, ignored", nack.ssrc);
            return;
        }

        let media_ssrc = nack.ssrc;
        let Some(track) = self
            .audio_tracks
            .values_mut()
            .chain(self.video_tracks.values_mut())
            .find(|t| t.has_ssrc(media_ssrc))
        else {
            debug!("NACK for unknown ssrc {}", media_ssrc);
            return;
        };

        for entry in &nack.reports {
            for seq in entry.iter() {
                if let Some((pkt, seq_no)) = track.fetch_rtp_packet(seq) {
                    trace!(
                        "RTC NACK ARQ seq={}, ssrc={}, {} bytes",
                        seq,
                        media_ssrc,
                        pkt.payload.byte_len()
                    );
                    feedback.resends.push((pkt, seq_no));
                }
            }
        }
    }

    /// Map a play-side (wire) SSRC back to the publish SSRC keying the track.
    pub fn video_publish_ssrc(&self, play_ssrc: Ssrc) -> Option<Ssrc> {
        self.video_tracks
            .iter()
            .find(|(_, t)| t.has_ssrc(play_ssrc))
            .map(|(publish_ssrc, _)| *publish_ssrc)
    }

    /// Activate/deactivate tracks. First every video track not held
    /// immutable by the switch context goes inactive, then every audio
    /// track; then the config entries are applied. A merge-group member
    /// that can't go live mid-GOP gets a PLI upstream and activates on
    /// the next key-frame.
    pub fn set_track_active(&mut self, cfgs: &[TrackConfig]) {
        for track in self.video_tracks.values_mut() {
            if self.switch.is_track_immutable(track) {
                continue;
            }
            track.set_track_status(false);
        }

        for track in self.audio_tracks.values_mut() {
            track.set_track_status(false);
        }

        for cfg in cfgs {
            match cfg.kind {
                TrackKind::Audio => {
                    for track in self.audio_tracks.values_mut() {
                        if track.track_id() == cfg.label {
                            track.set_track_status(cfg.active);
                        }
                    }
                }
                TrackKind::Video => {
                    for (publish_ssrc, track) in self.video_tracks.iter_mut() {
                        if track.track_id() != cfg.label {
                            continue;
                        }

                        // If the stream will be merged, activate it on the
                        // next key-frame instead.
                        if cfg.active && self.switch.activate_in_future(track) {
                            if let Some(source) = &self.source {
                                source.request_keyframe(*publish_ssrc);
                            }
                            continue;
                        }

                        track.set_track_status(cfg.active);
                    }
                }
            }
        }
    }

    pub fn stream_url(&self) -> String {
        self.req.stream_url()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::packet::RtpPayload;
    use crate::rtp::{NackEntry, RtpHeader};
    use crate::source::NoMerge;
    use crate::testutil::TestRegistry;

    fn relations() -> BTreeMap<Ssrc, TrackDescription> {
        let mut audio = TrackDescription::for_test(TrackKind::Audio, 5000.into());
        audio.id = "audio0".into();
        let mut video = TrackDescription::for_test(TrackKind::Video, 5001.into());
        video.id = "video0".into();

        let mut m = BTreeMap::new();
        m.insert(1001.into(), audio); // publish ssrc -> play track
        m.insert(3000.into(), video);
        m
    }

    fn play() -> PlayStream {
        let req = Request::new("v", "live", "show");
        let mut play = PlayStream::new(
            req,
            relations(),
            &RtcConfig::default(),
            Arc::new(NoMerge),
        );
        play.start(&TestRegistry::new()).unwrap();
        play
    }

    fn source_packet(publish_ssrc: u32, seq: u16) -> RtpPacket {
        let kind = if publish_ssrc == 1001 {
            TrackKind::Audio
        } else {
            TrackKind::Video
        };
        RtpPacket {
            kind,
            header: RtpHeader {
                ssrc: publish_ssrc.into(),
                sequence_number: seq,
                ..Default::default()
            },
            payload: RtpPayload::Raw(vec![0x41, 1, 2]),
        }
    }

    #[test]
    fn batch_routes_by_publish_ssrc() {
        let mut play = play();

        let batch = vec![
            source_packet(1001, 1),
            source_packet(3000, 2),
            source_packet(9999, 3), // unknown, skipped
        ];

        let out = play.stamp_batch(batch);
        assert_eq!(out.len(), 2);
        assert_eq!(*out[0].0.header.ssrc, 5000);
        assert_eq!(*out[1].0.header.ssrc, 5001);
    }

    #[test]
    fn nack_resends_cached_in_order() {
        let mut play = play();

        let mut sent = vec![];
        for seq in 0..10_u16 {
            sent.extend(play.stamp_batch(vec![source_packet(3000, seq)]));
        }
        assert_eq!(sent.len(), 10);

        let pid = sent[0].0.header.sequence_number;
        let nack = crate::rtp::Nack {
            sender_ssrc: 1.into(),
            ssrc: 5001.into(),
            reports: vec![NackEntry { pid, blp: 0x00ff }],
        };

        let feedback = play.on_rtcp(&[Rtcp::Nack(nack)]);
        assert_eq!(feedback.nn_nacks, 1);
        // pid plus 8 blp bits: 9 packets, seq 109-equivalent not requested
        assert_eq!(feedback.resends.len(), 9);
        for (i, (pkt, _)) in feedback.resends.iter().enumerate() {
            assert_eq!(pkt.header.sequence_number, pid.wrapping_add(i as u16));
        }
    }

    #[test]
    fn nack_disabled_is_logged_and_dropped() {
        let req = Request::new("v", "live", "show");
        let config = RtcConfig {
            nack_enabled: false,
            ..Default::default()
        };
        let mut play = PlayStream::new(req, relations(), &config, Arc::new(NoMerge));
        play.start(&TestRegistry::new()).unwrap();

        let sent = play.stamp_batch(vec![source_packet(3000, 1)]);
        let nack = crate::rtp::Nack {
            sender_ssrc: 1.into(),
            ssrc: 5001.into(),
            reports: vec![NackEntry {
                pid: sent[0].0.header.sequence_number,
                blp: 0,
            }],
        };

        let feedback = play.on_rtcp(&[Rtcp::Nack(nack)]);
        assert!(feedback.resends.is_empty());
    }

    #[test]
    fn pli_relays_to_publish_ssrc() {
        let req = Request::new("v", "live", "show");
        let registry = TestRegistry::new();
        let mut play = PlayStream::new(
            req,
            relations(),
            &RtcConfig::default(),
            Arc::new(NoMerge),
        );
        play.start(&registry).unwrap();

        let pli = crate::rtp::Pli {
            sender_ssrc: 1.into(),
            ssrc: 5001.into(), // play ssrc
        };
        let feedback = play.on_rtcp(&[Rtcp::Pli(pli)]);
        assert_eq!(feedback.nn_plis, 1);

        // mapped to publish ssrc 3000
        assert_eq!(registry.source().keyframe_requests(), vec![3000.into()]);
    }

    #[test]
    fn set_track_active_exactly_one_per_label() {
        let mut play = play();

        // both start active (standalone tracks)
        play.set_track_active(&[TrackConfig {
            kind: TrackKind::Video,
            label: "video0".into(),
            active: true,
        }]);

        // audio not listed -> inactive, video listed -> active
        let audio_active: Vec<_> = play
            .audio_tracks
            .values()
            .map(|t| t.is_active())
            .collect();
        assert_eq!(audio_active, vec![false]);

        let video_active: Vec<_> = play
            .video_tracks
            .values()
            .map(|t| t.is_active())
            .collect();
        assert_eq!(video_active, vec![true]);
    }
}
