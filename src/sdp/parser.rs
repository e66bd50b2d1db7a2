use combine::error::StreamError;
use combine::stream::StreamErrorFor;
use combine::parser::char::*;
use combine::*;
use combine::{ParseError, Parser, Stream};

use crate::crypto::Fingerprint;
use crate::rtp::{Mid, Pt, Ssrc};

use super::data::*;

/// Creates a parser of SDP.
pub fn sdp_parser<Input>() -> impl Parser<Input, Output = Sdp>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    (session_parser(), many::<Vec<_>, _, _>(media_parser())).map(|(session, media)| Sdp {
        session,
        media_lines: media,
    })
}

// ///////////////////////////////////////////////// Session description

/// 1. First line must be v=0
/// 2. The second line MUST be "o=" with a sess-id representable as u64.
/// 3. Third line is the session name, by convention "s=-".
///
/// The session section is over at the "t=" line.
fn session_parser<Input>() -> impl Parser<Input, Output = Session>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    (
        typed_line('v', token('0')),            // v=0
        originator_line(),                      // o=- 6564425948916445306 2 IN IP4 127.0.0.1
        typed_line('s', any_value()),           // s=-
        many::<Vec<_>, _, _>(ignored_session_line()),
        optional(typed_line('b', any_value())), // b=CT:1234
        typed_line('t', any_value()),           // t=0 0
        many::<Vec<_>, _, _>(typed_line('r', any_value())), // r should never appear
        //
        many::<Vec<_>, _, _>(session_attribute_line()),
    )
        .map(|(_, id, _, _, _, _, _, attrs)| Session { id, attrs })
}

/// `o=<username> <sess-id> <sess-version> <nettype> <addrtype> <unicast-address>`
fn originator_line<Input>() -> impl Parser<Input, Output = u64>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    let session_string = typed_line(
        'o',
        (
            not_sp(),
            token(' '),
            many1::<String, _, _>(digit()),
            token(' '),
            any_value(),
        )
            .map(|(_, _, sess, _, _)| sess),
    );
    from_str(session_string)
}

/// a=foo:bar lines belonging before the first m= line
fn session_attribute_line<Input>() -> impl Parser<Input, Output = SessionAttribute>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    // a=group:BUNDLE 0 1
    let group = attribute_line(
        "group",
        (
            not_sp(),
            token(' '),
            sep_by1(not_sp().map(|m: String| Mid::from(m.as_str())), token(' ')),
        ),
    )
    .map(|(typ, _, mids)| SessionAttribute::Group { typ, mids });

    // a=msid-semantic: WMS live/show
    let msid_semantic = attribute_line(
        "msid-semantic",
        (
            optional(token(' ')),
            not_sp(),
            optional(attempt((token(' '), sep_by1(not_sp(), token(' '))))),
        ),
    )
    .map(|(_, semantic, rest)| SessionAttribute::MsidSemantic {
        semantic,
        stream_ids: rest.map(|(_, ids)| ids).unwrap_or_default(),
    });

    // a=ice-lite
    let ice_lite = attribute_line_flag("ice-lite").map(|_| SessionAttribute::IceLite);

    // a=ice-ufrag:IdNYTNL1fjvjyEzL
    let ice_ufrag = attribute_line("ice-ufrag", any_value()).map(SessionAttribute::IceUfrag);

    // a=ice-pwd:4d64pT3T1xfwbZvi9fQKjoPb
    let ice_pwd = attribute_line("ice-pwd", any_value()).map(SessionAttribute::IcePwd);

    // a=ice-options:trickle
    let ice_opt = attribute_line("ice-options", any_value()).map(SessionAttribute::IceOptions);

    let finger = fingerprint_value().map(SessionAttribute::Fingerprint);

    // a=setup:actpass
    let setup = attribute_line("setup", setup_value()).map(SessionAttribute::Setup);

    let unused = typed_line('a', any_value()).map(SessionAttribute::Unused);

    choice((
        attempt(group),
        attempt(msid_semantic),
        attempt(ice_lite),
        attempt(ice_ufrag),
        attempt(ice_pwd),
        attempt(ice_opt),
        attempt(finger),
        attempt(setup),
        unused,
    ))
}

// a=fingerprint:sha-256 45:AD:...
fn fingerprint_value<Input>() -> impl Parser<Input, Output = Fingerprint>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    let hex_byte = count_min_max(2, 2, hex_digit()).and_then(|x: String| {
        u8::from_str_radix(&x, 16).map_err(StreamErrorFor::<Input>::message_format)
    });
    attribute_line(
        "fingerprint",
        (not_sp(), token(' '), sep_by1(hex_byte, token(':'))),
    )
    .map(|(hash_func, _, bytes)| Fingerprint { hash_func, bytes })
}

fn setup_value<Input>() -> impl Parser<Input, Output = Setup>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    choice((
        attempt(string("actpass").map(|_| Setup::ActPass)),
        attempt(string("active").map(|_| Setup::Active)),
        attempt(string("passive").map(|_| Setup::Passive)),
    ))
}

/// Session line with a key we ignore.
fn ignored_session_line<Input>() -> impl Parser<Input, Output = ()>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    let ignored = choice((
        token('i'),
        token('u'),
        token('e'),
        token('p'),
        token('c'),
        token('z'),
        token('k'),
    ));
    line(ignored, any_value()).map(|_| ())
}

// ///////////////////////////////////////////////// Media description

/// A m= section with attributes, until next m= or EOF.
fn media_parser<Input>() -> impl Parser<Input, Output = MediaLine>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    (
        media_line(),
        optional(typed_line('c', any_value())), // c=IN IP4 0.0.0.0
        optional(typed_line('b', any_value())), // b=AS:2500
        many::<Vec<_>, _, _>(media_attribute_line()),
    )
        .map(|((typ, port, proto, pts), _, _, attrs)| MediaLine {
            typ,
            disabled: port == "0",
            proto,
            pts,
            attrs,
        })
}

/// The m= line:
// m=audio 9 UDP/TLS/RTP/SAVPF 111
// m=video 9 UDP/TLS/RTP/SAVPF 96 97 125 107 100 101
// m=application 54055 UDP/DTLS/SCTP webrtc-datachannel
fn media_line<Input>() -> impl Parser<Input, Output = (MediaType, String, Proto, Vec<Pt>)>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    let media_type = choice((
        attempt(string("audio").map(|_| MediaType::Audio)),
        attempt(string("video").map(|_| MediaType::Video)),
        attempt(string("application").map(|_| MediaType::Application)),
        not_sp().map(MediaType::Unknown),
    ));

    let proto_line = choice((
        attempt(string("UDP/TLS/RTP/SAVPF").map(|_| Proto::Srtp)),
        attempt(string("UDP/DTLS/SCTP").map(|_| Proto::Sctp)),
        attempt(string("DTLS/SCTP").map(|_| Proto::Sctp)),
    ));

    let parse_pt = not_sp().and_then(|s: String| {
        s.parse::<u8>()
            .map(Pt::from)
            .map_err(StreamErrorFor::<Input>::message_format)
    });

    typed_line(
        'm',
        (
            media_type,
            token(' '),
            not_sp(), // port: just set to 9 or something
            token(' '),
            proto_line,
            token(' '),
            choice((
                attempt(sep_by(parse_pt, token(' '))),
                any_value().map(|_| vec![]),
            )),
        ),
    )
    .map(|(typ, _, port, _, proto, _, pts)| (typ, port, proto, pts))
}

/// a=foo:bar lines belonging to an m= line
fn media_attribute_line<Input>() -> impl Parser<Input, Output = MediaAttribute>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    // a=rtcp:9 IN IP4 0.0.0.0
    let rtcp = attribute_line("rtcp", any_value()).map(MediaAttribute::Rtcp);

    let ice_ufrag = attribute_line("ice-ufrag", any_value()).map(MediaAttribute::IceUfrag);
    let ice_pwd = attribute_line("ice-pwd", any_value()).map(MediaAttribute::IcePwd);
    let ice_opt = attribute_line("ice-options", any_value()).map(MediaAttribute::IceOptions);

    let finger = fingerprint_value().map(MediaAttribute::Fingerprint);
    let setup = attribute_line("setup", setup_value()).map(MediaAttribute::Setup);

    // a=mid:0
    let mid = attribute_line("mid", any_value())
        .map(|m| Mid::from(m.as_str()))
        .map(MediaAttribute::Mid);

    // a=extmap:3 http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01
    // a=extmap:<id>["/"<direction>] <URI> <extensionattributes>
    let extmap = attribute_line(
        "extmap",
        (
            many1::<String, _, _>(satisfy(|c| c != '/' && c != ' ')).and_then(|s| {
                s.parse::<u8>()
                    .map_err(StreamErrorFor::<Input>::message_format)
            }),
            optional((token('/'), not_sp())),
            token(' '),
            not_sp(),
            optional((token(' '), any_value())),
        ),
    )
    .map(|(id, _dir_opt, _, uri, _ext_opt)| MediaAttribute::ExtMap { id, uri });

    let direction = choice((
        attempt(attribute_line_flag("recvonly").map(|_| MediaAttribute::RecvOnly)),
        attempt(attribute_line_flag("sendrecv").map(|_| MediaAttribute::SendRecv)),
        attempt(attribute_line_flag("sendonly").map(|_| MediaAttribute::SendOnly)),
        attempt(attribute_line_flag("inactive").map(|_| MediaAttribute::Inactive)),
    ));

    // a=msid:5UUdwiuY7OML2EkQtF38pJtNP5v7In1LhjEK f78dde68-7055-...
    let msid = attribute_line("msid", (not_sp(), token(' '), any_value())).map(
        |(stream_id, _, track_id)| MediaAttribute::Msid {
            stream_id,
            track_id,
        },
    );

    let rtcpmux = attribute_line_flag("rtcp-mux").map(|_| MediaAttribute::RtcpMux);
    let rtcprsize = attribute_line_flag("rtcp-rsize").map(|_| MediaAttribute::RtcpRsize);

    // a=candidate:1 1 udp 2113929471 203.0.113.100 10100 typ host
    let cand = attribute_line("candidate", any_value()).map(MediaAttribute::Candidate);

    // a=end-of-candidates
    let endof = attribute_line_flag("end-of-candidates").map(|_| MediaAttribute::EndOfCandidates);

    let pt = || {
        not_sp().and_then(|s: String| {
            s.parse::<u8>()
                .map(Pt::from)
                .map_err(StreamErrorFor::<Input>::message_format)
        })
    };

    // a=rtpmap:111 opus/48000/2
    let rtpmap = attribute_line(
        "rtpmap",
        (
            pt(),
            token(' '),
            many1::<String, _, _>(satisfy(|c| c != '/' && c != '\r' && c != '\n')),
            token('/'),
            many1::<String, _, _>(satisfy(|c| c != '/' && c != '\r' && c != '\n')).and_then(|s| {
                s.parse::<u32>()
                    .map_err(StreamErrorFor::<Input>::message_format)
            }),
            optional((
                token('/'),
                any_value().and_then(|s| {
                    s.parse::<u8>()
                        .map_err(StreamErrorFor::<Input>::message_format)
                }),
            )), // only audio has the trailing /2 (channels)
        ),
    )
    .map(|(pt, _, codec, _, clock_rate, opt_channels)| {
        let channels = opt_channels.map(|(_, e)| e);
        MediaAttribute::RtpMap {
            pt,
            codec,
            clock_rate,
            channels,
        }
    });

    // a=rtcp-fb:111 transport-cc
    // a=rtcp-fb:111 nack
    // a=rtcp-fb:111 nack pli
    let rtcp_fb = attribute_line("rtcp-fb", (pt(), token(' '), any_value()))
        .map(|(pt, _, value)| MediaAttribute::RtcpFb { pt, value });

    // a=fmtp:111 minptime=10;useinbandfec=1
    let fmtp = attribute_line("fmtp", (pt(), token(' '), any_value()))
        .map(|(pt, _, value)| MediaAttribute::Fmtp { pt, value });

    // a=ssrc-group:FID 1111 2222
    let ssrc_group = attribute_line(
        "ssrc-group",
        (
            not_sp(),
            token(' '),
            sep_by1(
                not_sp().and_then(|s: String| {
                    s.parse::<u32>()
                        .map(Ssrc::from)
                        .map_err(StreamErrorFor::<Input>::message_format)
                }),
                token(' '),
            ),
        ),
    )
    .map(|(semantics, _, ssrcs)| MediaAttribute::SsrcGroup { semantics, ssrcs });

    // a=ssrc:3948621874 cname:xeXs3aE9AOBn00yJ
    // a=ssrc:3948621874 msid:5UUdwiuY7OML2EkQtF38pJtNP5v7In1LhjEK f78dde68-...
    let ssrc = attribute_line(
        "ssrc",
        (
            not_sp().and_then(|s: String| {
                s.parse::<u32>()
                    .map(Ssrc::from)
                    .map_err(StreamErrorFor::<Input>::message_format)
            }),
            token(' '),
            many1::<String, _, _>(satisfy(|c| c != ':' && c != '\r' && c != '\n')),
            token(':'),
            any_value(),
        ),
    )
    .map(|(ssrc, _, attr, _, value)| MediaAttribute::Ssrc { ssrc, attr, value });

    let unused = typed_line('a', any_value()).map(MediaAttribute::Unused);

    choice((
        attempt(ice_ufrag),
        attempt(ice_pwd),
        attempt(ice_opt),
        attempt(finger),
        attempt(setup),
        attempt(mid),
        attempt(extmap),
        attempt(direction),
        attempt(msid),
        attempt(rtcp),
        attempt(rtcpmux),
        attempt(rtcprsize),
        attempt(cand),
        attempt(endof),
        attempt(rtpmap),
        attempt(rtcp_fb),
        attempt(fmtp),
        attempt(ssrc_group),
        attempt(ssrc),
        unused,
    ))
}

// ///////////////////////////////////////////////// Generic things below

/// A specific line
fn typed_line<Input, Pval, Out>(expected: char, val: Pval) -> impl Parser<Input, Output = Out>
where
    Input: Stream<Token = char>,
    Pval: Parser<Input, Output = Out>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    line(token(expected), val)
}

/// A line with some parser for value and parser for type.
fn line<Input, Ptyp, Pval, Out>(typ: Ptyp, val: Pval) -> impl Parser<Input, Output = Out>
where
    Ptyp: Parser<Input, Output = char>,
    Pval: Parser<Input, Output = Out>,
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    attempt((typ, token('='), val, line_end()))
        .map(|(_, _, value, _)| value)
        .message("sdp line")
}

/// An a= line with a value like: `a=<attribute>:<value>`.
fn attribute_line<Input, Pval, Out>(
    attribute: &'static str,
    val: Pval,
) -> impl Parser<Input, Output = Out>
where
    Input: Stream<Token = char>,
    Pval: Parser<Input, Output = Out>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    typed_line('a', (string(attribute), token(':'), val)).map(|(_, _, val)| val)
}

/// An a= line with no value like: `a=ice-lite`.
fn attribute_line_flag<Input>(attribute: &'static str) -> impl Parser<Input, Output = ()>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    typed_line('a', (string(attribute)).map(|_| ()))
}

/// Not SP, \r or \n
fn not_sp<Input>() -> impl Parser<Input, Output = String>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    many1(satisfy(|c| c != ' ' && c != '\r' && c != '\n'))
}

/// Any value that isn't \r or \n.
fn any_value<Input>() -> impl Parser<Input, Output = String>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    many1(satisfy(|c| c != '\r' && c != '\n'))
}

/// Line end handling \r\n, \n or EOF (a stray \n has been seen from Safari).
fn line_end<Input>() -> impl Parser<Input, Output = ()>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    choice((crlf().map(|_| ()), newline().map(|_| ()), eof()))
}

#[cfg(test)]
mod test {
    use super::super::Sdp;
    use super::*;

    #[test]
    fn line_a() {
        assert_eq!(
            line(letter(), any_value()).parse("a=mid:0"),
            Ok(("mid:0".to_string(), ""))
        )
    }

    #[test]
    fn typed_line_v() {
        assert_eq!(typed_line('v', token('0')).parse("v=0"), Ok(('0', "")))
    }

    #[test]
    fn attribute_line_flag_foo() {
        assert_eq!(attribute_line_flag("foo").parse("a=foo"), Ok(((), "")))
    }

    const CHROME_OFFER: &str = "v=0\r\n\
o=- 6564425948916445306 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0 1\r\n\
a=msid-semantic: WMS live/show\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111 103\r\n\
c=IN IP4 0.0.0.0\r\n\
a=rtcp:9 IN IP4 0.0.0.0\r\n\
a=ice-ufrag:S5hk\r\n\
a=ice-pwd:0zV7Cu3mH45t2cbr0hIS7G5A\r\n\
a=ice-options:trickle\r\n\
a=fingerprint:sha-256 45:AD:5C:82:F8:BE:B5:2A:D1:74:A6:16:D0:50:CD:86:9C:97:9D:BD:06:8C:C9:85:C9:CD:AB:2B:A8:56:03:CD\r\n\
a=setup:actpass\r\n\
a=mid:0\r\n\
a=extmap:2 http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01\r\n\
a=sendonly\r\n\
a=msid:live/show audio0\r\n\
a=rtcp-mux\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=rtcp-fb:111 transport-cc\r\n\
a=rtcp-fb:111 nack\r\n\
a=fmtp:111 minptime=10;useinbandfec=1\r\n\
a=rtpmap:103 ISAC/16000\r\n\
a=ssrc:1001 cname:Taj1/YGmbWP7Jhxz\r\n\
a=ssrc:1001 msid:live/show audio0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 102 121\r\n\
c=IN IP4 0.0.0.0\r\n\
a=rtcp:9 IN IP4 0.0.0.0\r\n\
a=ice-ufrag:S5hk\r\n\
a=ice-pwd:0zV7Cu3mH45t2cbr0hIS7G5A\r\n\
a=fingerprint:sha-256 45:AD:5C:82:F8:BE:B5:2A:D1:74:A6:16:D0:50:CD:86:9C:97:9D:BD:06:8C:C9:85:C9:CD:AB:2B:A8:56:03:CD\r\n\
a=setup:actpass\r\n\
a=mid:1\r\n\
a=extmap:2 http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01\r\n\
a=sendonly\r\n\
a=msid:live/show video0\r\n\
a=rtcp-mux\r\n\
a=rtcp-rsize\r\n\
a=rtpmap:102 H264/90000\r\n\
a=rtcp-fb:102 nack\r\n\
a=rtcp-fb:102 nack pli\r\n\
a=rtcp-fb:102 transport-cc\r\n\
a=fmtp:102 level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f\r\n\
a=rtpmap:121 rtx/90000\r\n\
a=fmtp:121 apt=102\r\n\
a=ssrc-group:FID 1002 1003\r\n\
a=ssrc:1002 cname:Taj1/YGmbWP7Jhxz\r\n\
a=ssrc:1002 msid:live/show video0\r\n\
a=ssrc:1003 cname:Taj1/YGmbWP7Jhxz\r\n\
a=ssrc:1003 msid:live/show video0\r\n";

    #[test]
    fn parse_chrome_offer() {
        let sdp = Sdp::parse(CHROME_OFFER).unwrap();

        assert_eq!(sdp.session.id, 6564425948916445306);
        assert_eq!(sdp.media_lines.len(), 2);

        let audio = &sdp.media_lines[0];
        assert!(audio.is_audio());
        assert_eq!(&*audio.mid(), "0");
        assert_eq!(audio.extmaps(), vec![(2, crate::rtp::TWCC_URI)]);

        let opus = audio.payloads_for(crate::format::Codec::Opus);
        assert_eq!(opus.len(), 1);
        assert_eq!(*opus[0].pt, 111);
        assert_eq!(opus[0].clock_rate, 48_000);
        assert_eq!(opus[0].channels, Some(2));
        assert_eq!(opus[0].format.min_p_time, Some(10));
        assert!(opus[0].rtcp_fbs.contains(&"nack".to_string()));

        let video = &sdp.media_lines[1];
        assert!(video.is_video());
        let h264 = video.payloads_for(crate::format::Codec::H264);
        assert_eq!(h264.len(), 1);
        assert_eq!(*h264[0].pt, 102);
        assert_eq!(h264[0].format.packetization_mode, Some(1));
        assert_eq!(h264[0].format.profile_level_id, Some(0x42e01f));

        let rtx = video.payloads_for(crate::format::Codec::Rtx);
        assert_eq!(rtx.len(), 1);
        assert_eq!(rtx[0].format.apt, Some(102.into()));

        let infos = video.ssrc_info();
        assert_eq!(infos.len(), 2);
        assert_eq!(*infos[0].ssrc, 1002);
        assert_eq!(infos[0].track_id.as_deref(), Some("video0"));

        let groups = video.ssrc_groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].0, "FID");
        assert_eq!(groups[0].1, vec![1002.into(), 1003.into()]);

        let (ufrag, pwd) = sdp.ice_creds().unwrap();
        assert_eq!(ufrag, "S5hk");
        assert_eq!(pwd, "0zV7Cu3mH45t2cbr0hIS7G5A");

        assert_eq!(sdp.setup(), Some(Setup::ActPass));
        assert!(sdp.fingerprint().is_some());
    }

    #[test]
    fn display_parse_roundtrip() {
        let sdp = Sdp::parse(CHROME_OFFER).unwrap();
        let out = sdp.to_string();
        let back = Sdp::parse(&out).unwrap();
        assert_eq!(back, sdp);
    }
}
