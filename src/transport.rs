//! The per-connection security transport: DTLS handshake state plus SRTP
//! protect/unprotect, gated on handshake completion.

use std::collections::{HashMap, VecDeque};

use crate::crypto::{Dtls, DtlsCert, DtlsEvent, Fingerprint, SrtpContext};
use crate::rtp::{extend_u16, RtpHeader, SeqNo, Ssrc};
use crate::RtcError;

/// DTLS role for the session, from the SDP `a=setup` negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsRole {
    /// We connect (normal for an ice-lite server answering `actpass`).
    Active,
    /// We accept.
    Passive,
}

/// DTLS state machine + SRTP contexts for one connection.
///
/// `protect_*` and `unprotect_*` fail with [`RtcError::SrtpNotReady`]
/// until the handshake has completed and keys are extracted.
pub struct SecurityTransport {
    dtls: Dtls,
    role: DtlsRole,
    handshake_done: bool,
    srtp_tx: Option<SrtpContext>,
    srtp_rx: Option<SrtpContext>,
    remote_fingerprint: Option<Fingerprint>,

    /// Last extended rx sequence per SSRC, for the SRTP index (ROC).
    ext_rx: HashMap<Ssrc, u64>,
}

impl SecurityTransport {
    pub fn new(cert: &DtlsCert, role: DtlsRole) -> Result<Self, RtcError> {
        let mut dtls = Dtls::new(cert)?;
        dtls.set_active(role == DtlsRole::Active);

        debug!("SecurityTransport role: {:?}", role);

        Ok(SecurityTransport {
            dtls,
            role,
            handshake_done: false,
            srtp_tx: None,
            srtp_rx: None,
            remote_fingerprint: None,
            ext_rx: HashMap::new(),
        })
    }

    pub fn role(&self) -> DtlsRole {
        self.role
    }

    pub fn is_established(&self) -> bool {
        self.handshake_done
    }

    pub fn remote_fingerprint(&self) -> Option<&Fingerprint> {
        self.remote_fingerprint.as_ref()
    }

    /// If we are the active side, emit the first handshake flight. The
    /// datagrams are collected via [`poll_datagram`][Self::poll_datagram].
    pub fn start_active_handshake(&mut self) -> Result<(), RtcError> {
        if self.role != DtlsRole::Active {
            return Ok(());
        }

        let mut events = VecDeque::new();
        self.dtls
            .handle_handshake(&mut events)
            .map_err(|e| RtcError::DtlsHandshake(e.to_string()))?;
        self.apply_events(events);

        Ok(())
    }

    /// Feed one inbound DTLS record. Returns true the first time the
    /// handshake completes; later completions (retransmitted final
    /// flights) report false.
    pub fn on_dtls(&mut self, data: &[u8]) -> Result<bool, RtcError> {
        let mut events = VecDeque::new();
        self.dtls
            .handle_receive(data, &mut events)
            .map_err(|e| RtcError::DtlsHandshake(e.to_string()))?;

        Ok(self.apply_events(events))
    }

    fn apply_events(&mut self, events: VecDeque<DtlsEvent>) -> bool {
        let mut established = false;

        for ev in events {
            match ev {
                DtlsEvent::Connected => {
                    debug!("DTLS connected");
                }
                DtlsEvent::RemoteFingerprint(f) => {
                    self.remote_fingerprint = Some(f);
                }
                DtlsEvent::SrtpKeyingMaterial(mat, profile) => {
                    // Idempotent after first completion.
                    if self.handshake_done {
                        continue;
                    }

                    debug!("DTLS keying material, profile: {}", profile);

                    // The keying material layout is client-write first; the
                    // active (client) side sends with the left half.
                    let left = self.role == DtlsRole::Active;
                    self.srtp_tx = Some(SrtpContext::new(&mat, left));
                    self.srtp_rx = Some(SrtpContext::new(&mat, !left));

                    self.handshake_done = true;
                    established = true;
                }
                DtlsEvent::Data(v) => {
                    // No datachannel; nothing consumes DTLS application data.
                    trace!("Discard {} bytes of DTLS application data", v.len());
                }
            }
        }

        established
    }

    /// Outgoing DTLS datagram to put on the wire, if any.
    pub fn poll_datagram(&mut self) -> Option<Vec<u8>> {
        self.dtls.poll_datagram()
    }

    /// Protect a complete plain RTP packet. `seq_no` is the extended
    /// output sequence of the packet (carries the ROC).
    pub fn protect_rtp(
        &mut self,
        buf: &[u8],
        header: &RtpHeader,
        seq_no: SeqNo,
    ) -> Result<Vec<u8>, RtcError> {
        let Some(srtp) = self.srtp_tx.as_mut() else {
            return Err(RtcError::SrtpNotReady);
        };

        Ok(srtp.protect_rtp(buf, header, *seq_no))
    }

    /// Protect a complete plain RTCP packet.
    pub fn protect_rtcp(&mut self, buf: &[u8]) -> Result<Vec<u8>, RtcError> {
        let Some(srtp) = self.srtp_tx.as_mut() else {
            return Err(RtcError::SrtpNotReady);
        };

        Ok(srtp.protect_rtcp(buf))
    }

    /// Unprotect an inbound SRTP packet. Returns the decrypted payload
    /// (the header is not encrypted). Failure carries header diagnostics.
    pub fn unprotect_rtp(&mut self, buf: &[u8], header: &RtpHeader) -> Result<Vec<u8>, RtcError> {
        let Some(srtp) = self.srtp_rx.as_mut() else {
            return Err(RtcError::SrtpNotReady);
        };

        let prev = self.ext_rx.get(&header.ssrc).copied();
        let ext_seq = extend_u16(prev, header.sequence_number);

        match srtp.unprotect_rtp(buf, header, ext_seq) {
            Some(payload) => {
                self.ext_rx.insert(header.ssrc, ext_seq);
                Ok(payload)
            }
            None => Err(RtcError::SrtpUnprotect {
                marker: header.marker,
                pt: header.payload_type,
                seq: header.sequence_number,
                ts: header.timestamp,
                ssrc: header.ssrc,
                pad: header.has_padding,
                len: buf.len(),
            }),
        }
    }

    /// Unprotect an inbound SRTCP packet into the plain compound packet.
    pub fn unprotect_rtcp(&mut self, buf: &[u8]) -> Result<Vec<u8>, RtcError> {
        let Some(srtp) = self.srtp_rx.as_mut() else {
            return Err(RtcError::SrtpNotReady);
        };

        srtp.unprotect_rtcp(buf)
            .ok_or(RtcError::SrtcpUnprotect(buf.len()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::rtp::ExtensionMap;

    fn pair() -> (SecurityTransport, SecurityTransport) {
        let ca = DtlsCert::new().unwrap();
        let cb = DtlsCert::new().unwrap();
        let a = SecurityTransport::new(&ca, DtlsRole::Active).unwrap();
        let b = SecurityTransport::new(&cb, DtlsRole::Passive).unwrap();
        (a, b)
    }

    fn run_handshake(a: &mut SecurityTransport, b: &mut SecurityTransport) {
        a.start_active_handshake().unwrap();
        for _ in 0..20 {
            if a.is_established() && b.is_established() {
                return;
            }
            while let Some(d) = a.poll_datagram() {
                b.on_dtls(&d).unwrap();
            }
            while let Some(d) = b.poll_datagram() {
                a.on_dtls(&d).unwrap();
            }
        }
        panic!("handshake did not complete");
    }

    #[test]
    fn protect_fails_before_handshake() {
        let (mut a, _b) = pair();

        let plain: &[u8] = &[
            0x80, 0x6f, 0x00, 0x01, 0, 0, 0, 0, 0, 0, 0, 7, 1, 2, 3,
        ];
        let header = RtpHeader::parse(plain, &ExtensionMap::empty()).unwrap();

        assert!(matches!(
            a.protect_rtp(plain, &header, 1.into()),
            Err(RtcError::SrtpNotReady)
        ));
        assert!(matches!(
            a.protect_rtcp(&[0x80, 200, 0, 0]),
            Err(RtcError::SrtpNotReady)
        ));
        assert!(matches!(
            a.unprotect_rtp(plain, &header),
            Err(RtcError::SrtpNotReady)
        ));
        assert!(matches!(
            a.unprotect_rtcp(plain),
            Err(RtcError::SrtpNotReady)
        ));
    }

    #[test]
    fn protect_unprotect_after_handshake() {
        let (mut a, mut b) = pair();
        run_handshake(&mut a, &mut b);

        let plain: Vec<u8> = vec![
            0x80, 0x6f, 0x00, 0x2a, 0, 0, 0x10, 0, 0, 0, 0, 7, // header, ssrc 7
            9, 8, 7, 6, 5,
        ];
        let header = RtpHeader::parse(&plain, &ExtensionMap::empty()).unwrap();

        let protected = a.protect_rtp(&plain, &header, 42.into()).unwrap();
        assert_ne!(&protected[12..17], &plain[12..17]);

        let header2 = RtpHeader::parse(&protected, &ExtensionMap::empty()).unwrap();
        let payload = b.unprotect_rtp(&protected, &header2).unwrap();
        assert_eq!(payload, &plain[12..]);
    }

    #[test]
    fn unprotect_failure_carries_diagnostics() {
        let (mut a, mut b) = pair();
        run_handshake(&mut a, &mut b);

        let plain: Vec<u8> = vec![
            0x80, 0x6f, 0x00, 0x2a, 0, 0, 0x10, 0, 0, 0, 0, 7, 1, 2, 3,
        ];
        let header = RtpHeader::parse(&plain, &ExtensionMap::empty()).unwrap();
        let mut protected = a.protect_rtp(&plain, &header, 42.into()).unwrap();
        // break the auth tag
        let n = protected.len();
        protected[n - 1] ^= 0xff;

        let header2 = RtpHeader::parse(&protected, &ExtensionMap::empty()).unwrap();
        let err = b.unprotect_rtp(&protected, &header2).unwrap_err();

        match err {
            RtcError::SrtpUnprotect { seq, ssrc, len, .. } => {
                assert_eq!(seq, 0x2a);
                assert_eq!(*ssrc, 7);
                assert_eq!(len, protected.len());
            }
            e => panic!("wrong error: {}", e),
        }
    }
}
