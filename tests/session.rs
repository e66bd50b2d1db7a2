//! End-to-end session tests: a connection against a scripted remote peer
//! exchanging real STUN/DTLS/SRTP bytes through the public API.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use rtc_session::config::RtcConfig;
use rtc_session::connection::{ConnDeps, Connection, ConnectionState};
use rtc_session::crypto::DtlsCert;
use rtc_session::format::Codec;
use rtc_session::io::{StunMessage, StunMessageBuilder, TransId};
use rtc_session::negotiate::{StreamDescription, TrackDescription};
use rtc_session::packet::{RtpPacket, RtpPayload};
use rtc_session::rtp::{Extension, ExtensionMap, Nack, NackEntry, Rtcp, RtcpPacket, RtpHeader, Ssrc};
use rtc_session::sdp::Sdp;
use rtc_session::source::{
    consumer_channel, Consumer, ConsumerSender, KeyframeSink, MediaSource, NoMerge, NoTap,
    PublisherHandle, Request, SessionIndex, SourceRegistry, SsrcAllocator,
};
use rtc_session::streams::TrackKind;
use rtc_session::transport::{DtlsRole, SecurityTransport};
use rtc_session::RtcError;

// //////////////////////////////////////////////// test collaborators

struct MiniSource {
    desc: Mutex<StreamDescription>,
    publisher: Mutex<Option<PublisherHandle>>,
    consumers: Mutex<Vec<ConsumerSender>>,
    keyframe_requests: Mutex<Vec<Ssrc>>,
    packets: AtomicU64,
}

impl MiniSource {
    fn new() -> Self {
        MiniSource {
            desc: Mutex::new(StreamDescription::default()),
            publisher: Mutex::new(None),
            consumers: Mutex::new(vec![]),
            keyframe_requests: Mutex::new(vec![]),
            packets: AtomicU64::new(0),
        }
    }
}

impl KeyframeSink for MiniSource {
    fn request_keyframe(&self, ssrc: Ssrc) {
        self.keyframe_requests.lock().unwrap().push(ssrc);
        if let Some(p) = self.publisher.lock().unwrap().as_ref() {
            p.request_keyframe(ssrc);
        }
    }
}

impl MediaSource for MiniSource {
    fn on_publish(&self) -> Result<(), RtcError> {
        Ok(())
    }

    fn on_unpublish(&self) {}

    fn set_publish_stream(&self, publisher: Option<PublisherHandle>) {
        *self.publisher.lock().unwrap() = publisher;
    }

    fn set_stream_desc(&self, desc: StreamDescription) {
        *self.desc.lock().unwrap() = desc;
    }

    fn track_descs(&self, kind: TrackKind, codec: Codec) -> Vec<TrackDescription> {
        self.desc
            .lock()
            .unwrap()
            .tracks()
            .filter(|t| t.kind == kind && t.media.codec == codec)
            .cloned()
            .collect()
    }

    fn subscribe(&self) -> Consumer {
        let (tx, rx) = consumer_channel(256);
        self.consumers.lock().unwrap().push(tx);
        rx
    }

    fn dump_gop_cache(&self, _consumer: &Consumer) {}

    fn on_rtp(&self, pkt: RtpPacket) -> Result<(), RtcError> {
        self.packets.fetch_add(1, Ordering::Relaxed);
        for c in self.consumers.lock().unwrap().iter() {
            c.send(pkt.clone());
        }
        Ok(())
    }
}

struct MiniRegistry(Arc<MiniSource>);

impl SourceRegistry for MiniRegistry {
    fn fetch_or_create(&self, _req: &Request) -> Result<Arc<dyn MediaSource>, RtcError> {
        Ok(self.0.clone())
    }
}

struct Ssrcs(AtomicU32);

impl SsrcAllocator for Ssrcs {
    fn allocate(&self) -> Ssrc {
        self.0.fetch_add(1, Ordering::Relaxed).into()
    }
}

struct Index;

impl SessionIndex for Index {
    fn insert(&self, _peer_id: &str) {}
    fn remove(&self, _peer_id: &str) {}
}

fn deps(source: Arc<MiniSource>) -> ConnDeps {
    ConnDeps {
        registry: Arc::new(MiniRegistry(source)),
        ssrc_alloc: Arc::new(Ssrcs(AtomicU32::new(5000))),
        merge: Arc::new(NoMerge),
        tap: Arc::new(NoTap),
        index: Arc::new(Index),
    }
}

// //////////////////////////////////////////////// the scripted peer

const PEER_UFRAG: &str = "peerufrag";

fn peer_addr() -> SocketAddr {
    "198.51.100.7:40000".parse().unwrap()
}

/// Run STUN + DTLS against the connection until SRTP keys exist on both
/// sides. Returns the peer's transport.
fn establish(conn: &mut Connection) -> SecurityTransport {
    // STUN binding request, keyed with the connection's ICE password.
    let username = format!("{}:{}", conn.local_ice().ufrag, PEER_UFRAG);
    let msg = StunMessageBuilder::new()
        .binding()
        .request()
        .username(&username)
        .prio(1234)
        .build(TransId::new());
    let mut buf = [0_u8; 512];
    let n = msg
        .to_bytes(conn.local_ice().pwd.as_bytes(), &mut buf)
        .unwrap();

    conn.handle_datagram(&buf[..n], peer_addr(), Instant::now())
        .unwrap();
    assert_eq!(conn.state(), ConnectionState::DoingDtlsHandshake);

    // First transmit is the binding response.
    let (reply, _) = conn.poll_transmit().unwrap();
    let parsed = StunMessage::parse(&reply).unwrap();
    assert_eq!(parsed.mapped_address(), Some(peer_addr()));

    // The connection is the active DTLS side; the scripted peer accepts.
    let cert = DtlsCert::new().unwrap();
    let mut peer = SecurityTransport::new(&cert, DtlsRole::Passive).unwrap();

    // Shuffle datagrams until both sides go quiet.
    for round in 0.. {
        assert!(round < 40, "handshake did not converge");

        let mut any = false;
        while let Some((data, _)) = conn.poll_transmit() {
            any = true;
            if data[0] >= 20 && data[0] < 64 {
                peer.on_dtls(&data).unwrap();
            }
        }
        while let Some(data) = peer.poll_datagram() {
            any = true;
            conn.handle_datagram(&data, peer_addr(), Instant::now())
                .unwrap();
        }
        if !any {
            break;
        }
    }

    assert!(peer.is_established());
    assert_eq!(conn.state(), ConnectionState::Established);

    peer
}

const PUBLISH_OFFER: &str = "v=0\r\n\
o=- 100 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0 1\r\n\
a=msid-semantic: WMS m\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 0.0.0.0\r\n\
a=ice-ufrag:peerufrag\r\n\
a=ice-pwd:peerpwd8901234567890123456\r\n\
a=fingerprint:sha-256 45:AD:5C:82:F8:BE:B5:2A:D1:74:A6:16:D0:50:CD:86:9C:97:9D:BD:06:8C:C9:85:C9:CD:AB:2B:A8:56:03:CD\r\n\
a=setup:actpass\r\n\
a=mid:0\r\n\
a=sendonly\r\n\
a=rtcp-mux\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=rtcp-fb:111 nack\r\n\
a=ssrc:1001 cname:c1\r\n\
a=ssrc:1001 msid:m audio0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 102\r\n\
c=IN IP4 0.0.0.0\r\n\
a=ice-ufrag:peerufrag\r\n\
a=ice-pwd:peerpwd8901234567890123456\r\n\
a=fingerprint:sha-256 45:AD:5C:82:F8:BE:B5:2A:D1:74:A6:16:D0:50:CD:86:9C:97:9D:BD:06:8C:C9:85:C9:CD:AB:2B:A8:56:03:CD\r\n\
a=setup:actpass\r\n\
a=mid:1\r\n\
a=sendonly\r\n\
a=rtcp-mux\r\n\
a=rtcp-rsize\r\n\
a=rtpmap:102 H264/90000\r\n\
a=rtcp-fb:102 nack\r\n\
a=rtcp-fb:102 nack pli\r\n\
a=fmtp:102 level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f\r\n\
a=ssrc:3000 cname:c1\r\n\
a=ssrc:3000 msid:m video0\r\n";

const PLAY_OFFER: &str = "v=0\r\n\
o=- 200 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0 1\r\n\
a=msid-semantic: WMS m\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 0.0.0.0\r\n\
a=ice-ufrag:peerufrag\r\n\
a=ice-pwd:peerpwd8901234567890123456\r\n\
a=fingerprint:sha-256 45:AD:5C:82:F8:BE:B5:2A:D1:74:A6:16:D0:50:CD:86:9C:97:9D:BD:06:8C:C9:85:C9:CD:AB:2B:A8:56:03:CD\r\n\
a=setup:actpass\r\n\
a=mid:0\r\n\
a=recvonly\r\n\
a=rtcp-mux\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=rtcp-fb:111 nack\r\n\
a=rtcp-fb:111 transport-cc\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 102\r\n\
c=IN IP4 0.0.0.0\r\n\
a=ice-ufrag:peerufrag\r\n\
a=ice-pwd:peerpwd8901234567890123456\r\n\
a=fingerprint:sha-256 45:AD:5C:82:F8:BE:B5:2A:D1:74:A6:16:D0:50:CD:86:9C:97:9D:BD:06:8C:C9:85:C9:CD:AB:2B:A8:56:03:CD\r\n\
a=setup:actpass\r\n\
a=mid:1\r\n\
a=extmap:3 http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01\r\n\
a=recvonly\r\n\
a=rtcp-mux\r\n\
a=rtcp-rsize\r\n\
a=rtpmap:102 H264/90000\r\n\
a=rtcp-fb:102 nack\r\n\
a=rtcp-fb:102 nack pli\r\n\
a=rtcp-fb:102 transport-cc\r\n\
a=fmtp:102 level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f\r\n";

fn published_track(kind: TrackKind, ssrc: Ssrc, id: &str) -> TrackDescription {
    use rtc_session::format::PayloadParams;
    use rtc_session::sdp::Direction;

    let (pt, codec, clock) = match kind {
        TrackKind::Audio => (111, Codec::Opus, 48_000),
        TrackKind::Video => (102, Codec::H264, 90_000),
    };

    TrackDescription {
        kind,
        id: id.into(),
        msid: "m".into(),
        mid: "0".into(),
        direction: Direction::RecvOnly,
        ssrc,
        rtx_ssrc: None,
        fec_ssrc: None,
        media: PayloadParams::new(pt.into(), codec, clock),
        red: None,
        rtx: None,
        ulpfec: None,
        rsfec: None,
        extmaps: vec![],
    }
}

fn published_tracks() -> StreamDescription {
    let mut audio = published_track(TrackKind::Audio, 1001.into(), "audio0");
    audio.media.rtcp_fbs = vec!["nack".into(), "transport-cc".into()];
    let mut video = published_track(TrackKind::Video, 3000.into(), "video0");
    video.media.rtcp_fbs = vec!["nack".into(), "nack pli".into(), "transport-cc".into()];

    StreamDescription {
        audio: Some(audio),
        video: vec![video],
    }
}

#[tokio::test]
async fn publish_media_reaches_the_source() {
    let source = Arc::new(MiniSource::new());
    let cert = DtlsCert::new().unwrap();
    let mut conn = Connection::new(
        Request::new("v", "live", "show"),
        RtcConfig::default(),
        deps(source.clone()),
        cert,
    );

    let offer = Sdp::parse(PUBLISH_OFFER).unwrap();
    let answer = conn.add_publisher(&offer).unwrap();
    assert!(answer.to_string().contains("a=recvonly"));

    let mut peer = establish(&mut conn);

    // The publishing browser sends an opus packet on SSRC 1001.
    let plain: Vec<u8> = vec![
        0x80, 111, 0x00, 0x64, 0, 0, 0x03, 0xc0, 0, 0, 0x03, 0xe9, // seq 100, ssrc 1001
        0xde, 0xad, 0xbe, 0xef,
    ];
    let header = RtpHeader::parse(&plain, &ExtensionMap::empty()).unwrap();
    let protected = peer.protect_rtp(&plain, &header, 100.into()).unwrap();

    conn.handle_datagram(&protected, peer_addr(), Instant::now())
        .unwrap();

    assert_eq!(source.packets.load(Ordering::Relaxed), 1);

    // The periodic tick produces RR + XR, protected as SRTCP, sendable.
    conn.tick(Instant::now()).unwrap();
    let (rtcp, _) = conn.poll_transmit().expect("rtcp out");
    let plain = peer.unprotect_rtcp(&rtcp).unwrap();
    let packets = Rtcp::read_compound(&plain).unwrap();
    assert!(matches!(packets[0], Rtcp::ReceiverReport(_)));
}

#[tokio::test]
async fn play_nack_retransmits_with_fresh_twcc() {
    let source = Arc::new(MiniSource::new());
    source.set_stream_desc(published_tracks());

    let cert = DtlsCert::new().unwrap();
    let config = RtcConfig {
        gcc_enabled: true,
        ..Default::default()
    };
    let mut conn = Connection::new(
        Request::new("v", "live", "show"),
        config,
        deps(source.clone()),
        cert,
    );

    let offer = Sdp::parse(PLAY_OFFER).unwrap();
    let answer = conn.add_player(&offer).unwrap();
    let answer_str = answer.to_string();
    assert!(answer_str.contains("a=sendonly"));
    assert!(answer_str.contains("transport-cc"));
    assert!(answer_str.contains("a=extmap:3 "));

    let mut peer = establish(&mut conn);

    let mut exts = ExtensionMap::empty();
    exts.set(3, Extension::TransportSequenceNumber);

    // Send 10 video packets through the play path.
    let mut wire_seqs = vec![];
    let mut twcc_sns = vec![];
    let mut play_ssrc = None;

    for i in 0..10_u16 {
        let src = RtpPacket {
            kind: TrackKind::Video,
            header: RtpHeader {
                ssrc: 3000.into(), // publish ssrc from the fan-out
                sequence_number: 100 + i,
                timestamp: 90_000 + i as u32,
                ..Default::default()
            },
            payload: RtpPayload::Raw(vec![0x41, i as u8]),
        };

        let stamped = conn.player_mut().unwrap().stamp_batch(vec![src]);
        assert_eq!(stamped.len(), 1);
        conn.do_send_packets(stamped).unwrap();

        let (wire, _) = conn.poll_transmit().expect("media out");
        let header = RtpHeader::parse(&wire, &exts).unwrap();
        let payload = peer.unprotect_rtp(&wire, &header).unwrap();
        assert_eq!(payload, vec![0x41, i as u8]);

        play_ssrc = Some(header.ssrc);
        wire_seqs.push(header.sequence_number);
        twcc_sns.push(header.ext_vals.transport_cc.expect("twcc tagged"));
    }

    // Outbound RTP sequence and TWCC sequence are both strictly monotone.
    for w in wire_seqs.windows(2) {
        assert_eq!(w[1], w[0].wrapping_add(1));
    }
    for w in twcc_sns.windows(2) {
        assert_eq!(w[1], w[0].wrapping_add(1));
    }

    // The subscriber nacks pid..pid+8 (blp 0x00ff). 9 packets come back,
    // in order, each tagged with a fresh TWCC sequence number.
    let nack = Nack {
        sender_ssrc: 1.into(),
        ssrc: play_ssrc.unwrap(),
        reports: vec![NackEntry {
            pid: wire_seqs[0],
            blp: 0x00ff,
        }],
    };
    let mut buf = vec![0_u8; nack.length_words() * 4];
    nack.write_to(&mut buf);
    let protected = peer.protect_rtcp(&buf).unwrap();

    conn.handle_datagram(&protected, peer_addr(), Instant::now())
        .unwrap();

    let mut resent = vec![];
    while let Some((wire, _)) = conn.poll_transmit() {
        let header = RtpHeader::parse(&wire, &exts).unwrap();
        peer.unprotect_rtp(&wire, &header).unwrap();
        resent.push(header);
    }

    assert_eq!(resent.len(), 9);
    for (i, header) in resent.iter().enumerate() {
        // the retransmit carries the original media sequence...
        assert_eq!(header.sequence_number, wire_seqs[0].wrapping_add(i as u16));
        // ...but a fresh, still monotone transport sequence.
        let sn = header.ext_vals.transport_cc.expect("twcc tagged");
        assert_eq!(sn, twcc_sns[9].wrapping_add(1 + i as u16));
    }
}

#[tokio::test]
async fn subscriber_pli_reaches_the_publisher_track() {
    // A publisher connection and a player connection sharing one source.
    let source = Arc::new(MiniSource::new());

    let pub_cert = DtlsCert::new().unwrap();
    let mut pub_conn = Connection::new(
        Request::new("v", "live", "show"),
        RtcConfig::default(),
        deps(source.clone()),
        pub_cert,
    );
    let offer = Sdp::parse(PUBLISH_OFFER).unwrap();
    pub_conn.add_publisher(&offer).unwrap();
    let _pub_peer = establish(&mut pub_conn);

    let play_cert = DtlsCert::new().unwrap();
    let mut play_conn = Connection::new(
        Request::new("v", "live", "show"),
        RtcConfig::default(),
        deps(source.clone()),
        play_cert,
    );
    let offer = Sdp::parse(PLAY_OFFER).unwrap();
    play_conn.add_player(&offer).unwrap();
    let mut play_peer = establish(&mut play_conn);

    // Find the play-side video SSRC by pushing one packet through.
    let src = RtpPacket {
        kind: TrackKind::Video,
        header: RtpHeader {
            ssrc: 3000.into(),
            sequence_number: 1,
            ..Default::default()
        },
        payload: RtpPayload::Raw(vec![0x41, 0]),
    };
    let stamped = play_conn.player_mut().unwrap().stamp_batch(vec![src]);
    let play_ssrc = stamped[0].0.header.ssrc;

    // Subscriber sends PS-FB fmt=1 (PLI) on the play SSRC.
    let pli = rtc_session::rtp::Pli {
        sender_ssrc: 1.into(),
        ssrc: play_ssrc,
    };
    let mut buf = vec![0_u8; pli.length_words() * 4];
    pli.write_to(&mut buf);
    let protected = play_peer.protect_rtcp(&buf).unwrap();

    play_conn
        .handle_datagram(&protected, peer_addr(), Instant::now())
        .unwrap();

    // The source saw the request mapped back to the publish SSRC...
    assert_eq!(
        source.keyframe_requests.lock().unwrap().clone(),
        vec![Ssrc::from(3000)]
    );
    // ...and the player connection counted it.
    assert_eq!(play_conn.stats().nn_pli, 1);

    // The publisher's receive track records the pending key-frame request
    // once the relay channel is drained.
    pub_conn.pump_keyframe_requests();
    assert!(pub_conn.publisher_mut().unwrap().has_pending_pli());

    // On the next tick the publisher sends the PLI to the encoder.
    pub_conn.tick(Instant::now()).unwrap();
    assert!(pub_conn.stats().nn_pli >= 1);
}
