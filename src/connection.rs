//! The per-connection state machine.
//!
//! A connection is created by the server on the first STUN binding request
//! carrying its ICE user-fragment (signaling negotiates the SDP before
//! that), transitions `INIT → WAITING_STUN → DOING_DTLS_HANDSHAKE →
//! ESTABLISHED`, and is destroyed on ICE keep-alive timeout.
//!
//! All state is owned by one tokio task driving [`Connection::run`]; the
//! sync entry points exist for the task itself and for tests.

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::config::RtcConfig;
use crate::crypto::{DtlsCert, Fingerprint};
use crate::io::{MultiplexKind, StunMessage, StunMessageBuilder, DATAGRAM_MAX_PACKET_SIZE};
use crate::negotiate::{
    answer_play, answer_publish, AnswerParams, SdpNegotiator, StreamDescription, TrackConfig,
    TrackDescription,
};
use crate::packet::RtpPacket;
use crate::play::PlayStream;
use crate::publish::PublishStream;
use crate::rtp::{Rtcp, RtpHeader, SeqNo, Ssrc, Twcc};
use crate::sdp::{Sdp, Setup};
use crate::source::{
    Consumer, MergeGroupPolicy, PacketTap, Request, SessionIndex, SourceRegistry, SsrcAllocator,
};
use crate::stats::ConnectionStats;
use crate::streams::TrackKind;
use crate::transport::{DtlsRole, SecurityTransport};
use crate::twcc::TwccController;
use crate::util::{cancel_pair, random_id, Cancel, Canceller};
use crate::RtcError;

/// The report timer granularity (the "hour-glass" tick).
const TICK_INTERVAL: Duration = Duration::from_millis(200);

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Init,
    WaitingStun,
    DoingDtlsHandshake,
    Established,
    Closed,
}

/// Inputs fed to the connection task.
#[derive(Debug)]
pub enum ConnectionInput {
    /// A datagram routed to this connection by the server demultiplexer.
    Datagram(Vec<u8>, SocketAddr),
    /// Activate/deactivate play tracks.
    SetTrackActive(Vec<TrackConfig>),
    /// Drop the next n packets (publish inbound and play outbound).
    SimulateNackDrop(u32),
    /// Tear the connection down.
    Close,
}

/// Cheap handle for feeding a running connection task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    tx: mpsc::Sender<ConnectionInput>,
    cancel: Arc<Canceller>,
}

impl ConnectionHandle {
    pub fn new(tx: mpsc::Sender<ConnectionInput>, cancel: Arc<Canceller>) -> Self {
        ConnectionHandle { tx, cancel }
    }

    pub async fn datagram(&self, data: Vec<u8>, from: SocketAddr) {
        let _ = self.tx.send(ConnectionInput::Datagram(data, from)).await;
    }

    pub async fn set_track_active(&self, cfgs: Vec<TrackConfig>) {
        let _ = self.tx.send(ConnectionInput::SetTrackActive(cfgs)).await;
    }

    /// Interrupt the task loop and tear the connection down.
    pub async fn close(&self) {
        self.cancel.cancel();
        let _ = self.tx.send(ConnectionInput::Close).await;
    }
}

/// External collaborators, injected at construction.
pub struct ConnDeps {
    pub registry: Arc<dyn SourceRegistry>,
    pub ssrc_alloc: Arc<dyn SsrcAllocator>,
    pub merge: Arc<dyn MergeGroupPolicy>,
    pub tap: Arc<dyn PacketTap>,
    pub index: Arc<dyn SessionIndex>,
}

/// Local ICE credentials.
#[derive(Debug, Clone)]
pub struct IceCreds {
    pub ufrag: String,
    pub pwd: String,
}

/// One WebRTC peer connection of the media server.
pub struct Connection {
    req: Request,
    config: RtcConfig,
    deps: ConnDeps,

    state: ConnectionState,

    local_ice: IceCreds,
    remote_ufrag: Option<String>,
    fingerprint: Fingerprint,
    cert: DtlsCert,
    local_setup: Setup,

    transport: Option<SecurityTransport>,
    publisher: Option<PublishStream>,
    player: Option<PlayStream>,

    twcc: TwccController,
    /// TWCC extension id for egress tagging, 0 = disabled.
    twcc_id: u8,

    /// Whether outgoing media is SRTP protected. Only ever off in tests.
    encrypt: bool,

    /// Current peer 5-tuple and the datagrams queued towards it.
    peer_addr: Option<SocketAddr>,
    out: VecDeque<(Vec<u8>, SocketAddr)>,

    last_stun_time: Instant,
    session_timeout: Duration,

    stats: ConnectionStats,
    nn_simulate_player_nack_drop: u32,

    /// PLI relay channel: sources hold the sender via PublisherHandle.
    keyframe_tx: mpsc::UnboundedSender<Ssrc>,
    keyframe_rx: Option<mpsc::UnboundedReceiver<Ssrc>>,

    /// Pull-style cancellation, polled each loop iteration.
    cancel: Cancel,
    canceller: Option<Canceller>,
}

impl Connection {
    pub fn new(req: Request, config: RtcConfig, deps: ConnDeps, cert: DtlsCert) -> Self {
        let local_ice = IceCreds {
            ufrag: random_id(8),
            pwd: random_id(32),
        };

        let fingerprint = cert.fingerprint();
        let session_timeout = config.stun_timeout;
        let (keyframe_tx, keyframe_rx) = mpsc::unbounded_channel();
        let (canceller, cancel) = cancel_pair();

        Connection {
            req,
            config,
            deps,
            state: ConnectionState::Init,
            local_ice,
            remote_ufrag: None,
            fingerprint,
            cert,
            local_setup: Setup::Active,
            transport: None,
            publisher: None,
            player: None,
            twcc: TwccController::new(),
            twcc_id: 0,
            encrypt: true,
            peer_addr: None,
            out: VecDeque::new(),
            last_stun_time: Instant::now(),
            session_timeout,
            stats: ConnectionStats::new(),
            nn_simulate_player_nack_drop: 0,
            keyframe_tx,
            keyframe_rx: Some(keyframe_rx),
            cancel,
            canceller: Some(canceller),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn local_ice(&self) -> &IceCreds {
        &self.local_ice
    }

    /// `local_ufrag:remote_ufrag`, the identity the server indexes by.
    pub fn username(&self) -> Option<String> {
        let remote = self.remote_ufrag.as_ref()?;
        Some(format!("{}:{}", self.local_ice.ufrag, remote))
    }

    pub fn set_encrypt(&mut self, v: bool) {
        self.encrypt = v;
    }

    /// Keep-alive check. When true the server drops the connection on its
    /// next sweep.
    pub fn is_stun_timeout(&self, now: Instant) -> bool {
        self.last_stun_time + self.session_timeout < now
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn simulate_nack_drop(&mut self, n: u32) {
        if let Some(publisher) = &mut self.publisher {
            publisher.simulate_nack_drop(n);
        }
        self.nn_simulate_player_nack_drop = n;
    }

    // ///////////////////////////////////////////////// signaling

    /// Negotiate a publish session from the remote offer. Produces the
    /// answer and leaves the connection in WAITING_STUN.
    pub fn add_publisher(&mut self, remote_sdp: &Sdp) -> Result<Sdp, RtcError> {
        let negotiator = SdpNegotiator::new(&self.config);
        let desc = negotiator.negotiate_publish(remote_sdp)?;

        self.init_transport(remote_sdp)?;

        let answer = answer_publish(&self.answer_params(), &desc);

        // The stream entry learns the publisher's track layout so players
        // can negotiate against it.
        let source = self.deps.registry.fetch_or_create(&self.req)?;
        source.set_stream_desc(desc.clone());

        self.publisher = Some(PublishStream::new(self.req.clone(), &desc, &self.config));
        self.stats.nn_publishers += 1;

        self.set_state(ConnectionState::WaitingStun);

        Ok(answer)
    }

    /// Negotiate a play session from the remote offer against the
    /// published stream. Produces the answer and leaves the connection in
    /// WAITING_STUN.
    pub fn add_player(&mut self, remote_sdp: &Sdp) -> Result<Sdp, RtcError> {
        let negotiator = SdpNegotiator::new(&self.config);
        let source = self.deps.registry.fetch_or_create(&self.req)?;

        let relations = negotiator.negotiate_play(
            remote_sdp,
            source.as_ref(),
            self.deps.ssrc_alloc.as_ref(),
            self.deps.merge.as_ref(),
            &self.req,
        )?;

        self.init_transport(remote_sdp)?;

        let desc = stream_desc_of(&relations);
        let answer = answer_play(&self.answer_params(), &desc, self.deps.merge.as_ref());

        let player = PlayStream::new(
            self.req.clone(),
            relations,
            &self.config,
            self.deps.merge.clone(),
        );

        // The TWCC id in the local answer enables GCC; whatever the
        // ext-map, GCC stays off when config disables it.
        if self.config.gcc_enabled {
            self.twcc_id = player.twcc_id();
        }
        info!(
            "RTC connection player gcc={}/{}",
            self.config.gcc_enabled,
            player.twcc_id()
        );

        self.player = Some(player);
        self.stats.nn_subscribers += 1;

        self.set_state(ConnectionState::WaitingStun);

        Ok(answer)
    }

    fn init_transport(&mut self, remote_sdp: &Sdp) -> Result<(), RtcError> {
        if self.transport.is_some() {
            return Ok(());
        }

        let (remote_ufrag, _) = remote_sdp
            .ice_creds()
            .ok_or_else(|| RtcError::RemoteSdp("missing ice credentials".into()))?;
        self.remote_ufrag = Some(remote_ufrag);

        let remote_setup = remote_sdp.setup().unwrap_or(Setup::ActPass);
        self.local_setup = remote_setup.invert();

        let role = match self.local_setup {
            Setup::Active => DtlsRole::Active,
            _ => DtlsRole::Passive,
        };

        self.transport = Some(SecurityTransport::new(&self.cert, role)?);

        info!(
            "RTC init session, DTLS(role={}), timeout={}ms",
            self.local_setup,
            self.session_timeout.as_millis()
        );

        Ok(())
    }

    fn answer_params(&self) -> AnswerParams<'_> {
        AnswerParams {
            req: &self.req,
            ice_ufrag: &self.local_ice.ufrag,
            ice_pwd: &self.local_ice.pwd,
            fingerprint: &self.fingerprint,
            setup: self.local_setup,
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("RTC state {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    // ///////////////////////////////////////////////// datagram entry

    /// Demultiplex one datagram by its first byte.
    pub fn handle_datagram(
        &mut self,
        data: &[u8],
        from: SocketAddr,
        now: Instant,
    ) -> Result<(), RtcError> {
        let kind = MultiplexKind::try_from(data)?;

        match kind {
            MultiplexKind::Stun => {
                let msg = StunMessage::parse(data)?;
                self.on_stun(from, &msg, now)
            }
            MultiplexKind::Dtls => self.on_dtls(data),
            MultiplexKind::Rtp => self.on_rtp(data, now),
            MultiplexKind::Rtcp => self.on_rtcp(data, now),
        }
    }

    /// Binding requests only. Refreshes the keep-alive, migrates the
    /// sendonly socket on a peer tuple change, answers with
    /// XOR-MAPPED-ADDRESS and moves WAITING_STUN on.
    pub fn on_stun(
        &mut self,
        from: SocketAddr,
        msg: &StunMessage,
        now: Instant,
    ) -> Result<(), RtcError> {
        if !msg.is_binding_request() {
            return Ok(());
        }

        self.last_stun_time = now;

        // We run ice-lite and are therefore always controlling; a
        // controlled peer is a role conflict.
        if self.config.stun_strict_check && msg.ice_controlled().is_some() {
            return Err(RtcError::StunRoleConflict);
        }

        if !msg.verify(self.local_ice.pwd.as_bytes()) {
            return Err(RtcError::StunIntegrity);
        }

        // The client may have multiple network interfaces; we follow the
        // candidate pair the client selects.
        if self.peer_addr != Some(from) {
            self.update_sendonly_socket(from);
        }

        // Mirror the transaction id, swap the ufrag order.
        let username = match msg.split_username() {
            Some((local, remote)) => format!("{}:{}", remote, local),
            None => String::new(),
        };

        let reply = StunMessageBuilder::new()
            .binding()
            .success()
            .username(&username)
            .xor_mapped_address(from)
            .build(msg.trans_id());

        let mut buf = [0_u8; DATAGRAM_MAX_PACKET_SIZE];
        let n = reply.to_bytes(self.local_ice.pwd.as_bytes(), &mut buf)?;

        self.deps.tap.tap(&buf[..n]);
        self.out.push_back((buf[..n].to_vec(), from));

        if self.state == ConnectionState::WaitingStun {
            self.set_state(ConnectionState::DoingDtlsHandshake);
            info!("RTC STUN done, waiting DTLS handshake");

            if let Some(transport) = &mut self.transport {
                transport.start_active_handshake()?;
            }
            self.flush_dtls();
        }

        Ok(())
    }

    fn update_sendonly_socket(&mut self, addr: SocketAddr) {
        let old_peer_id = self.peer_addr.map(|a| a.to_string());

        if let Some(old) = &old_peer_id {
            info!("RTC address changed, update {} -> {}", old, addr);
        }

        self.peer_addr = Some(addr);
        self.deps.index.insert(&addr.to_string());

        if let Some(old) = old_peer_id {
            self.deps.index.remove(&old);
        }
    }

    /// Feed inbound DTLS; on (first) handshake completion, start the
    /// publish or play stream.
    pub fn on_dtls(&mut self, data: &[u8]) -> Result<(), RtcError> {
        let Some(transport) = &mut self.transport else {
            debug!("DTLS before SDP negotiation, dropped");
            return Ok(());
        };

        let established = transport.on_dtls(data)?;
        self.flush_dtls();

        if established {
            self.on_connection_established()?;
        }

        Ok(())
    }

    fn flush_dtls(&mut self) {
        let Some(transport) = &mut self.transport else {
            return;
        };
        let Some(peer) = self.peer_addr else {
            return;
        };
        while let Some(d) = transport.poll_datagram() {
            self.out.push_back((d, peer));
        }
    }

    fn on_connection_established(&mut self) -> Result<(), RtcError> {
        self.set_state(ConnectionState::Established);

        info!(
            "RTC {} session established, to={}ms",
            if self.publisher.is_some() {
                "Publisher"
            } else {
                "Subscriber"
            },
            self.session_timeout.as_millis()
        );

        if let Some(publisher) = &mut self.publisher {
            publisher.start(self.deps.registry.as_ref(), self.keyframe_tx.clone())?;
        }

        if let Some(player) = &mut self.player {
            player.start(self.deps.registry.as_ref())?;
        }

        Ok(())
    }

    /// Inbound SRTP, publish side.
    pub fn on_rtp(&mut self, data: &[u8], now: Instant) -> Result<(), RtcError> {
        let Some(publisher) = &mut self.publisher else {
            return Err(RtcError::PlayerNotStarted);
        };
        let Some(transport) = &mut self.transport else {
            return Err(RtcError::SrtpNotReady);
        };

        self.stats.nn_in_rtp += 1;

        let feedback = publisher.on_rtp(data, transport, &mut self.twcc, self.deps.tap.as_ref(), now)?;

        for rtcp in feedback {
            match &rtcp {
                Rtcp::Nack(_) => self.stats.nn_nack += 1,
                Rtcp::Pli(_) => self.stats.nn_pli += 1,
                _ => {}
            }
            self.send_rtcp(&rtcp)?;
        }

        Ok(())
    }

    /// Inbound SRTCP, either side.
    pub fn on_rtcp(&mut self, data: &[u8], now: Instant) -> Result<(), RtcError> {
        let Some(transport) = &mut self.transport else {
            return Err(RtcError::SrtpNotReady);
        };

        let plain = transport.unprotect_rtcp(data)?;
        self.deps.tap.tap(&plain);

        let packets = Rtcp::read_compound(&plain)?;

        if let Some(player) = &mut self.player {
            let feedback = player.on_rtcp(&packets);

            self.stats.nn_nack += feedback.nn_nacks;
            self.stats.nn_pli += feedback.nn_plis;
            self.stats.nn_sr += feedback.nn_srs;
            self.stats.nn_rr += feedback.nn_rrs;
            self.stats.nn_xr += feedback.nn_xrs;

            if !feedback.resends.is_empty() {
                self.do_send_packets(feedback.resends)?;
            }

            for twcc in feedback.twcc {
                self.on_rtcp_feedback(twcc, now);
            }
        } else if let Some(publisher) = &mut self.publisher {
            for p in &packets {
                match p {
                    Rtcp::SenderReport(_) => self.stats.nn_sr += 1,
                    Rtcp::ExtendedReport(_) => self.stats.nn_xr += 1,
                    _ => {}
                }
            }
            publisher.on_rtcp(&packets, now);
        }

        Ok(())
    }

    /// TWCC feedback for the congestion controller.
    fn on_rtcp_feedback(&mut self, twcc: Twcc, now: Instant) {
        if self.twcc_id == 0 {
            return;
        }

        self.stats.nn_in_twcc += 1;
        self.twcc.on_received_rtcp(twcc, now);

        let s = self.twcc.get_network_status();
        trace!(
            "twcc - lossrate:{}, bitrate:{}, delay_bitrate:{}, rtt:{}",
            s.loss_rate,
            s.bitrate_bps,
            s.delay_bitrate_bps,
            s.rtt_ms
        );
    }

    // ///////////////////////////////////////////////// egress

    /// The single egress chokepoint for media: TWCC tag → encode → SRTP
    /// protect → socket queue.
    pub fn do_send_packets(&mut self, pkts: Vec<(RtpPacket, SeqNo)>) -> Result<(), RtcError> {
        let Some(peer) = self.peer_addr else {
            // No verified peer tuple yet, nowhere to send.
            return Ok(());
        };

        let extmap = self
            .player
            .as_ref()
            .map(|p| *p.extmap())
            .unwrap_or_default();

        for (mut pkt, seq_no) in pkts {
            // Set the twcc sn before the packet is encoded.
            let mut twcc_sn = 0_u16;
            if self.twcc_id > 0 {
                twcc_sn = self.twcc.allocate_twcc_sn();
                pkt.header.ext_vals.transport_cc = Some(twcc_sn);
            }

            let mut buf = vec![0_u8; DATAGRAM_MAX_PACKET_SIZE];
            let n = pkt.encode(&mut buf, &extmap);
            buf.truncate(n);

            // The encoded header (fresh extensions) is what SRTP sees.
            let header = RtpHeader::parse(&buf, &extmap)
                .ok_or(RtcError::InvalidRtpHeader(n))?;

            if self.twcc_id > 0 {
                self.twcc
                    .on_pre_send_packet(pkt.header.ssrc, pkt.header.sequence_number, twcc_sn, n);
            }

            // Whether to encrypt the RTP bytes.
            let wire = if self.encrypt {
                let Some(transport) = &mut self.transport else {
                    return Err(RtcError::SrtpNotReady);
                };
                transport.protect_rtp(&buf, &header, seq_no)?
            } else {
                buf
            };

            // For the NACK simulator, drop the packet.
            if self.nn_simulate_player_nack_drop > 0 {
                warn!(
                    "RTC NACK simulator #{} player drop seq={}, ssrc={}, {} bytes",
                    self.nn_simulate_player_nack_drop,
                    pkt.header.sequence_number,
                    pkt.header.ssrc,
                    wire.len()
                );
                self.nn_simulate_player_nack_drop -= 1;
                continue;
            }

            self.stats.nn_out_rtp += 1;
            self.out.push_back((wire, peer));

            if self.twcc_id > 0 {
                self.twcc.on_sent_packet(twcc_sn, Instant::now());
            }
        }

        Ok(())
    }

    fn send_rtcp(&mut self, rtcp: &Rtcp) -> Result<(), RtcError> {
        let Some(peer) = self.peer_addr else {
            return Ok(());
        };

        let buf = rtcp.to_vec();
        self.deps.tap.tap(&buf);

        let wire = if self.encrypt {
            let Some(transport) = &mut self.transport else {
                return Err(RtcError::SrtpNotReady);
            };
            transport.protect_rtcp(&buf)?
        } else {
            buf
        };

        self.out.push_back((wire, peer));
        Ok(())
    }

    /// The periodic report tick.
    pub fn tick(&mut self, now: Instant) -> Result<(), RtcError> {
        if self.state != ConnectionState::Established {
            return Ok(());
        }

        let Some(publisher) = &mut self.publisher else {
            return Ok(());
        };

        let reports = publisher.tick(&mut self.twcc, now);

        for rtcp in reports {
            match &rtcp {
                Rtcp::ReceiverReport(_) => self.stats.nn_rr += 1,
                Rtcp::ExtendedReport(_) => self.stats.nn_xr += 1,
                Rtcp::Twcc(_) => self.stats.nn_out_twcc += 1,
                Rtcp::Pli(_) => self.stats.nn_pli += 1,
                _ => {}
            }
            self.send_rtcp(&rtcp)?;
        }

        Ok(())
    }

    /// Next queued outbound datagram, for the run loop (or tests).
    pub fn poll_transmit(&mut self) -> Option<(Vec<u8>, SocketAddr)> {
        self.out.pop_front()
    }

    pub fn publisher_mut(&mut self) -> Option<&mut PublishStream> {
        self.publisher.as_mut()
    }

    /// Drain key-frame requests relayed from subscribers into the
    /// publisher tracks. The run loop does this through its select; this
    /// entry point exists for driving a connection without the task.
    pub fn pump_keyframe_requests(&mut self) {
        let Some(rx) = &mut self.keyframe_rx else {
            return;
        };
        while let Ok(ssrc) = rx.try_recv() {
            if let Some(publisher) = &mut self.publisher {
                publisher.request_keyframe(ssrc);
            }
        }
    }

    pub fn player_mut(&mut self) -> Option<&mut PlayStream> {
        self.player.as_mut()
    }

    pub fn set_play_track_active(&mut self, cfgs: &[TrackConfig]) -> Result<(), RtcError> {
        let Some(player) = &mut self.player else {
            return Err(RtcError::PlayerNotStarted);
        };
        player.set_track_active(cfgs);
        Ok(())
    }

    fn close(&mut self) {
        self.set_state(ConnectionState::Closed);

        if let Some(publisher) = &mut self.publisher {
            publisher.stop();
        }

        if let Some(peer) = self.peer_addr {
            self.deps.index.remove(&peer.to_string());
        }

        info!("RTC session closed, {}", self.stats.summary());
    }

    // ///////////////////////////////////////////////// task

    /// Spawn the connection task. All further interaction goes through
    /// the returned handle.
    pub fn spawn(mut self, socket: Arc<UdpSocket>) -> ConnectionHandle {
        let canceller = Arc::new(self.canceller.take().expect("spawn called once"));
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(self.run(socket, rx));
        ConnectionHandle::new(tx, canceller)
    }

    /// The connection task: one cooperative loop owning all state.
    ///
    /// Selects over inbound datagrams, the play consumer, the PLI relay
    /// channel and the 200 ms report tick. Exits on `Close`, on channel
    /// teardown, on source exhaustion and on keep-alive timeout.
    pub async fn run(mut self, socket: Arc<UdpSocket>, mut rx: mpsc::Receiver<ConnectionInput>) {
        let mut keyframe_rx = self.keyframe_rx.take().expect("run called once");

        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // The consumer is moved out of the play stream so the select
        // below holds no borrow of `self`.
        let mut consumer: Option<Consumer> = None;
        let mut mw_msgs = 0;

        loop {
            if self.cancel.pull().is_err() {
                break;
            }

            // Flush queued datagrams before suspending.
            while let Some((buf, addr)) = self.poll_transmit() {
                if let Err(e) = socket.send_to(&buf, addr).await {
                    warn!("UDP send failed: {}", e);
                }
            }

            if consumer.is_none() {
                if let Some(player) = &mut self.player {
                    if player.is_started() {
                        mw_msgs = player.mw_msgs();
                        consumer = player.take_consumer();
                    }
                }
            }

            tokio::select! {
                biased;

                input = rx.recv() => {
                    match input {
                        Some(ConnectionInput::Datagram(data, from)) => {
                            let now = Instant::now();
                            if let Err(e) = self.handle_datagram(&data, from, now) {
                                if self.is_fatal(&e) {
                                    warn!("RTC fatal: {}", e);
                                    break;
                                }
                                // Per-packet errors are logged and dropped.
                                debug!("Drop packet: {}", e);
                            }
                        }
                        Some(ConnectionInput::SetTrackActive(cfgs)) => {
                            if let Err(e) = self.set_play_track_active(&cfgs) {
                                warn!("set_track_active: {}", e);
                            }
                        }
                        Some(ConnectionInput::SimulateNackDrop(n)) => {
                            self.simulate_nack_drop(n);
                        }
                        Some(ConnectionInput::Close) | None => break,
                    }
                }

                ssrc = keyframe_rx.recv() => {
                    if let (Some(ssrc), Some(publisher)) = (ssrc, &mut self.publisher) {
                        publisher.request_keyframe(ssrc);
                    }
                }

                batch = wait_media(consumer.as_mut(), mw_msgs) => {
                    match batch {
                        Some(pkts) => {
                            let stamped = match &mut self.player {
                                Some(player) => player.stamp_batch(pkts),
                                None => vec![],
                            };
                            if let Err(e) = self.do_send_packets(stamped) {
                                debug!("Drop batch: {}", e);
                            }
                        }
                        None => {
                            info!("RTC source gone, stop play");
                            break;
                        }
                    }
                }

                _ = tick.tick() => {
                    let now = Instant::now();
                    if self.is_stun_timeout(now) {
                        info!("RTC session timeout");
                        break;
                    }
                    if let Err(e) = self.tick(now) {
                        debug!("tick: {}", e);
                    }
                }
            }
        }

        // Final flush so the last feedback isn't stranded.
        while let Some((buf, addr)) = self.poll_transmit() {
            let _ = socket.send_to(&buf, addr).await;
        }

        self.close();
    }

    /// Handshake errors kill the connection; per-packet errors don't.
    fn is_fatal(&self, e: &RtcError) -> bool {
        matches!(
            e,
            RtcError::DtlsHandshake(_) | RtcError::StunRoleConflict | RtcError::StunIntegrity
        )
    }
}

/// Wait on the consumer when there is one; pend forever otherwise (the
/// select is then driven by the other arms).
async fn wait_media(consumer: Option<&mut Consumer>, mw_msgs: usize) -> Option<Vec<RtpPacket>> {
    match consumer {
        Some(c) => c.wait(mw_msgs).await,
        None => std::future::pending().await,
    }
}

/// Compose the stream description of a play answer from the negotiated
/// relations.
fn stream_desc_of(relations: &BTreeMap<Ssrc, TrackDescription>) -> StreamDescription {
    let mut desc = StreamDescription::default();

    for track in relations.values() {
        match track.kind {
            TrackKind::Audio => {
                if desc.audio.is_none() {
                    desc.audio = Some(track.clone());
                }
            }
            TrackKind::Video => desc.video.push(track.clone()),
        }
    }

    desc
}
