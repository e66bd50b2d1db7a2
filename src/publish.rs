//! The publish side of a connection: peer → server media.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::config::RtcConfig;
use crate::negotiate::StreamDescription;
use crate::packet::RtpPacket;
use crate::rtp::{Extension, ExtensionMap, Rtcp, RtpHeader, Ssrc, PICTURE_ID_URI, TWCC_URI};
use crate::source::{MediaSource, PacketTap, PublisherHandle, Request, SourceRegistry};
use crate::streams::{ReceiveTrack, TrackKind};
use crate::transport::SecurityTransport;
use crate::twcc::TwccController;
use crate::util::{compact_ntp, now_ntp_64, rtt_from_compact_ntp};
use crate::RtcError;

/// Minimum spacing of TWCC feedback packets.
const TWCC_FEEDBACK_INTERVAL: Duration = Duration::from_millis(50);

/// Owns the receive tracks of one publishing peer, parses its inbound
/// RTP/RTCP and emits periodic receiver feedback.
pub struct PublishStream {
    req: Request,

    audio_tracks: Vec<ReceiveTrack>,
    video_tracks: Vec<ReceiveTrack>,

    /// Extension mapping for inbound header parsing.
    extmap: ExtensionMap,

    /// TWCC extension id, 0 = disabled.
    twcc_id: u8,

    /// The media SSRC stamped into TWCC feedback.
    media_ssrc: Ssrc,

    nack_enabled: bool,

    /// Drop inbound packets of this payload type (fault injection).
    pt_to_drop: u8,

    /// NACK simulator: drop the next n inbound packets.
    nn_simulate_nack_drop: u32,

    /// Gate for periodic TWCC feedback.
    last_twcc_feedback: Option<Instant>,

    source: Option<Arc<dyn MediaSource>>,
    started: bool,
}

impl PublishStream {
    pub fn new(req: Request, desc: &StreamDescription, config: &RtcConfig) -> Self {
        let audio_tracks: Vec<_> = desc.audio.iter().map(ReceiveTrack::new).collect();
        let video_tracks: Vec<_> = desc.video.iter().map(ReceiveTrack::new).collect();

        // The audio track description has no twcc id (browsers only offer
        // it per-video in plan-B publishes); fetch from the video tracks.
        let mut extmap = ExtensionMap::empty();
        let mut twcc_id = 0;
        let mut media_ssrc: Ssrc = 0.into();
        let mut picture_id = 0;

        if let Some(video) = desc.video.first() {
            media_ssrc = video.ssrc;
            if let Some(id) = video.extension_id(TWCC_URI) {
                twcc_id = id;
            }
            if let Some(id) = video.extension_id(PICTURE_ID_URI) {
                picture_id = id;
            }
        }

        if twcc_id > 0 {
            extmap.set(twcc_id, Extension::TransportSequenceNumber);
        }
        if picture_id > 0 {
            extmap.set(picture_id, Extension::PictureId);
        }

        let nack_enabled = config.nack_enabled;
        let pt_to_drop = config.drop_for_pt;

        info!(
            "RTC publisher nack={}, pt-drop={}, twcc={}/{}, picture_id={}",
            nack_enabled, pt_to_drop, config.twcc_enabled, twcc_id, picture_id
        );

        PublishStream {
            req,
            audio_tracks,
            video_tracks,
            extmap,
            twcc_id,
            media_ssrc,
            nack_enabled,
            pt_to_drop,
            nn_simulate_nack_drop: 0,
            last_twcc_feedback: None,
            source: None,
            started: false,
        }
    }

    /// Attach to the stream registry and take the publish slot.
    ///
    /// Idempotent: DTLS may retransmit the final flight, which triggers
    /// `start` a second time.
    pub fn start(
        &mut self,
        registry: &dyn SourceRegistry,
        keyframe_tx: mpsc::UnboundedSender<Ssrc>,
    ) -> Result<(), RtcError> {
        if self.started {
            return Ok(());
        }

        let source = registry.fetch_or_create(&self.req)?;
        source.on_publish()?;
        source.set_publish_stream(Some(PublisherHandle::new(keyframe_tx)));

        self.source = Some(source);
        self.started = true;

        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Clear the publish slot on the source.
    pub fn stop(&mut self) {
        if let Some(source) = self.source.take() {
            source.set_publish_stream(None);
            source.on_unpublish();
        }
    }

    pub fn simulate_nack_drop(&mut self, n: u32) {
        self.nn_simulate_nack_drop = n;
    }

    /// The per-packet receive algorithm. Returns feedback (NACK/PLI) to
    /// send to the publishing peer.
    ///
    /// TWCC MUST be observable even for packets that later fail SRTP,
    /// because retransmissions and padding may fail unprotect yet still
    /// need congestion accounting. Hence the header decode happens first.
    pub fn on_rtp(
        &mut self,
        data: &[u8],
        transport: &mut SecurityTransport,
        twcc: &mut TwccController,
        tap: &dyn PacketTap,
        now: Instant,
    ) -> Result<Vec<Rtcp>, RtcError> {
        // For the NACK simulator, drop the packet.
        if self.nn_simulate_nack_drop > 0 {
            if let Some(h) = RtpHeader::parse(data, &self.extmap) {
                warn!(
                    "RTC NACK simulator #{} drop seq={}, ssrc={}, ts={}, {} bytes",
                    self.nn_simulate_nack_drop,
                    h.sequence_number,
                    h.ssrc,
                    h.timestamp,
                    data.len()
                );
            }
            self.nn_simulate_nack_drop -= 1;
            return Ok(vec![]);
        }

        let Some(header) = RtpHeader::parse(data, &self.extmap) else {
            return Err(RtcError::InvalidRtpHeader(data.len()));
        };

        // TWCC accounting before SRTP unprotect.
        if self.twcc_id > 0 {
            if let Some(sn) = header.ext_vals.transport_cc {
                twcc.recv_packet(sn, now);
            }
        }

        // If the payload type is configured to drop, ignore this packet.
        if self.pt_to_drop > 0 && self.pt_to_drop == *header.payload_type {
            return Ok(vec![]);
        }

        // Decrypt the cipher into a fresh plaintext buffer.
        let mut payload = transport.unprotect_rtp(data, &header)?;

        tap.tap(&payload);

        if header.has_padding && !RtpHeader::unpad_payload(&mut payload) {
            return Err(RtcError::InvalidRtpHeader(data.len()));
        }

        // Dispatch to the receive track keyed by SSRC. The track kind
        // decides the payload decoder: audio raw, video by NALU type.
        let ssrc = header.ssrc;
        let Some(track) = self.track_by_ssrc_mut(ssrc) else {
            return Err(RtcError::UnknownSsrc(ssrc));
        };
        let kind = track.kind();

        let pkt = RtpPacket::decode(kind, header, payload)?;
        track.on_rtp(&pkt, now);

        let mut feedback = vec![];

        // Missing packets are nacked as soon as the gap is observed.
        if self.nack_enabled {
            let Some(track) = self.track_by_ssrc_mut(ssrc) else {
                unreachable!()
            };
            if track.has_nack_report() {
                for nack in track.nack_reports() {
                    feedback.push(Rtcp::Nack(nack));
                }
            }
        }

        // A pending key-frame request rides on the next packet arrival.
        feedback.extend(self.drain_pending_plis());

        // For the source to consume the packet.
        if let Some(source) = &self.source {
            source.on_rtp(pkt)?;
        }

        Ok(feedback)
    }

    /// RTCP from the publishing peer (already unprotected and parsed).
    pub fn on_rtcp(&mut self, packets: &[Rtcp], now: Instant) {
        for packet in packets {
            match packet {
                Rtcp::SenderReport(sr) => {
                    // Update per-SSRC last-SR NTP so subsequent RR/XR carry
                    // the correct LSR.
                    let ssrc = sr.sender_info.ssrc;
                    if let Some(track) = self.track_by_ssrc_mut(ssrc) {
                        track.update_sender_report(sr.sender_info.ntp_time, now);
                    }
                }
                Rtcp::ExtendedReport(xr) => {
                    for block in &xr.blocks {
                        let crate::rtp::ReportBlock::Dlrr(dlrr) = block else {
                            continue;
                        };
                        for item in &dlrr.items {
                            // RTT = compact_ntp(now) - lrr - dlrr, 16.16.
                            let now_compact = compact_ntp(now_ntp_64());
                            let rtt = rtt_from_compact_ntp(
                                now_compact,
                                item.last_rr_time,
                                item.last_rr_delay,
                            );
                            if let Some(track) = self.track_by_ssrc_mut(item.ssrc) {
                                track.update_rtt(rtt);
                            }
                        }
                    }
                }
                Rtcp::ReceiverReport(_) => {
                    // The publisher sends media towards us only via the
                    // fan-out; nothing to update from its RRs.
                }
                Rtcp::Pli(_) | Rtcp::Nack(_) | Rtcp::Twcc(_) => {
                    // Feedback about our sending; the publish connection
                    // sends only RTCP, so these are logged and dropped.
                    trace!("Ignore feedback on publish stream: {:?}", packet);
                }
            }
        }
    }

    /// Relay a key-frame request from a subscriber to the remote encoder.
    pub fn request_keyframe(&mut self, ssrc: Ssrc) {
        trace!("RTC request PLI for publish ssrc {}", ssrc);
        if let Some(track) = self
            .video_tracks
            .iter_mut()
            .find(|t| t.has_ssrc(ssrc))
        {
            track.request_keyframe();
        }
    }

    /// The 200 ms hour-glass tick: RR and XR-RRTR for every receive
    /// track, pending PLIs, and TWCC feedback at >= 50 ms spacing.
    pub fn tick(&mut self, twcc: &mut TwccController, now: Instant) -> Vec<Rtcp> {
        let mut out = vec![];

        for track in self
            .video_tracks
            .iter_mut()
            .chain(self.audio_tracks.iter_mut())
        {
            if let Some(rr) = track.receiver_report(now) {
                out.push(Rtcp::ReceiverReport(rr));
                out.push(Rtcp::ExtendedReport(track.xr_rrtr()));
            }
        }

        out.extend(self.drain_pending_plis());

        if let Some(feedback) = self.periodic_twcc(twcc, now) {
            out.push(feedback);
        }

        out
    }

    /// We should not depend on received packets for feedback pacing;
    /// instead feedback goes out every >= 50ms from the tick.
    fn periodic_twcc(&mut self, twcc: &mut TwccController, now: Instant) -> Option<Rtcp> {
        if self.twcc_id == 0 {
            return None;
        }

        let Some(last) = self.last_twcc_feedback else {
            self.last_twcc_feedback = Some(now);
            return None;
        };

        if now.saturating_duration_since(last) < TWCC_FEEDBACK_INTERVAL {
            return None;
        }

        let mut feedback = twcc.build_feedback()?;
        self.last_twcc_feedback = Some(now);

        feedback.sender_ssrc = self.media_ssrc;
        feedback.ssrc = self.media_ssrc;
        Some(Rtcp::Twcc(feedback))
    }

    fn drain_pending_plis(&mut self) -> Vec<Rtcp> {
        let mut out = vec![];
        for track in &mut self.video_tracks {
            if track.take_pending_pli() {
                out.push(Rtcp::Pli(crate::rtp::Pli {
                    sender_ssrc: track.ssrc(),
                    ssrc: track.ssrc(),
                }));
            }
        }
        out
    }

    fn track_by_ssrc_mut(&mut self, ssrc: Ssrc) -> Option<&mut ReceiveTrack> {
        self.audio_tracks
            .iter_mut()
            .chain(self.video_tracks.iter_mut())
            .find(|t| t.has_ssrc(ssrc))
    }

    /// The video track for an SSRC, used for PLI relay bookkeeping.
    pub fn video_track_ssrcs(&self) -> Vec<Ssrc> {
        self.video_tracks.iter().map(|t| t.ssrc()).collect()
    }

    pub fn kind_of_ssrc(&self, ssrc: Ssrc) -> Option<TrackKind> {
        self.audio_tracks
            .iter()
            .chain(self.video_tracks.iter())
            .find(|t| t.has_ssrc(ssrc))
            .map(|t| t.kind())
    }

    /// Whether any video track has recorded a pending keyframe request.
    pub fn has_pending_pli(&self) -> bool {
        self.video_tracks.iter().any(|t| t.has_pending_pli())
    }

    pub fn stream_url(&self) -> String {
        self.req.stream_url()
    }
}

impl Drop for PublishStream {
    fn drop(&mut self) {
        self.stop();
    }
}
