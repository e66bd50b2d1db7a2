use std::collections::VecDeque;
use std::io::{self, Read};
use std::mem;

use openssl::asn1::{Asn1Integer, Asn1Time, Asn1Type};
use openssl::bn::BigNum;
use openssl::ec::EcKey;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::srtp::SrtpProfileId;
use openssl::ssl::{
    HandshakeError, MidHandshakeSslStream, Ssl, SslContext, SslContextBuilder, SslMethod,
    SslOptions, SslStream, SslVerifyMode,
};
use openssl::x509::{X509Name, X509};

use crate::io::{DATAGRAM_MTU, DATAGRAM_MTU_WARN};

use super::{CryptoError, Fingerprint, KeyingMaterial, SrtpProfile};

const DTLS_CIPHERS: &str = "EECDH+AESGCM:EDH+AESGCM:AES256+EECDH:AES256+EDH";
const DTLS_EC_CURVE: Nid = Nid::X9_62_PRIME256V1;
const DTLS_KEY_LABEL: &str = "EXTRACTOR-dtls_srtp";
const RSA_F4: u32 = 0x10001;

// libWebRTC and pion both use "WebRTC" as the certificate identity, so we
// blend in with the herd.
const DTLS_CERT_IDENTITY: &str = "WebRTC";

/// Events arising from a [`Dtls`] instance.
pub enum DtlsEvent {
    /// The DTLS handshake finished.
    Connected,

    /// Keying material for the SRTP master keys and the selected profile.
    SrtpKeyingMaterial(KeyingMaterial, SrtpProfile),

    /// The fingerprint of the remote peer's certificate.
    ///
    /// Should be checked against the fingerprint communicated in the SDP.
    RemoteFingerprint(Fingerprint),

    /// Decrypted application data from incoming DTLS traffic.
    Data(Vec<u8>),
}

/// Self-signed certificate used as DTLS identity.
#[derive(Debug, Clone)]
pub struct DtlsCert {
    pkey: PKey<Private>,
    x509: X509,
}

impl DtlsCert {
    /// Creates a new (self signed) DTLS certificate.
    pub fn new() -> Result<Self, CryptoError> {
        let f4 = BigNum::from_u32(RSA_F4)?;
        let key = Rsa::generate_with_e(2048, &f4)?;
        let pkey = PKey::from_rsa(key)?;

        let mut x509b = X509::builder()?;
        x509b.set_version(2)?; // X509.V3 (zero indexed)

        // Firefox requires the serial to be unique across all certificates
        // it has ever seen, including from other machines.
        let mut serial_buf = [0u8; 16];
        openssl::rand::rand_bytes(&mut serial_buf)?;
        let serial_bn = BigNum::from_slice(&serial_buf)?;
        let serial = Asn1Integer::from_bn(&serial_bn)?;
        x509b.set_serial_number(&serial)?;

        let before = Asn1Time::days_from_now(0)?;
        x509b.set_not_before(&before)?;
        let after = Asn1Time::days_from_now(7)?;
        x509b.set_not_after(&after)?;
        x509b.set_pubkey(&pkey)?;

        let mut nameb = X509Name::builder()?;
        nameb.append_entry_by_nid_with_type(
            Nid::COMMONNAME,
            DTLS_CERT_IDENTITY,
            Asn1Type::UTF8STRING,
        )?;
        let name = nameb.build();

        x509b.set_subject_name(&name)?;
        x509b.set_issuer_name(&name)?;

        x509b.sign(&pkey, MessageDigest::sha1())?;
        let x509 = x509b.build();

        Ok(DtlsCert { pkey, x509 })
    }

    /// Produce the (public) fingerprint of the cert.
    ///
    /// Sent via SDP to the other peer to pin the DTLS handshake to this
    /// specific certificate.
    pub fn fingerprint(&self) -> Fingerprint {
        let digest: &[u8] = &self
            .x509
            .digest(MessageDigest::sha256())
            .expect("digest to fingerprint");

        Fingerprint {
            hash_func: "sha-256".into(),
            bytes: digest.to_vec(),
        }
    }
}

/// A DTLS session over an in-memory datagram buffer.
pub struct Dtls {
    /// Kept alive since it pins the openssl context `Ssl` is created from.
    _context: SslContext,

    /// The actual openssl TLS stream.
    tls: TlsStream<IoBuffer>,
}

impl Dtls {
    pub fn new(cert: &DtlsCert) -> Result<Self, CryptoError> {
        let context = dtls_create_ctx(cert)?;
        let ssl = dtls_ssl_create(&context)?;
        Ok(Dtls {
            _context: context,
            tls: TlsStream::new(ssl, IoBuffer::default()),
        })
    }

    /// Set whether we are the connecting (active) or accepting (passive)
    /// side. Must be called exactly once before any traffic.
    pub fn set_active(&mut self, active: bool) {
        self.tls.set_active(active);
    }

    pub fn is_active(&self) -> Option<bool> {
        self.tls.is_active()
    }

    pub fn is_connected(&self) -> bool {
        self.tls.is_connected()
    }

    /// Drive the handshake forward. Returns `true` while still handshaking.
    pub fn handle_handshake(
        &mut self,
        output: &mut VecDeque<DtlsEvent>,
    ) -> Result<bool, CryptoError> {
        if self.tls.is_connected() {
            // Nice. Nothing to do.
            Ok(false)
        } else if self.tls.complete_handshake_until_block()? {
            output.push_back(DtlsEvent::Connected);

            let (keying_material, srtp_profile, fingerprint) = self
                .tls
                .take_srtp_keying_material()
                .expect("Exported keying material");

            output.push_back(DtlsEvent::RemoteFingerprint(fingerprint));
            output.push_back(DtlsEvent::SrtpKeyingMaterial(keying_material, srtp_profile));
            Ok(false)
        } else {
            Ok(true)
        }
    }

    /// Feed one received DTLS datagram.
    pub fn handle_receive(
        &mut self,
        m: &[u8],
        output: &mut VecDeque<DtlsEvent>,
    ) -> Result<(), CryptoError> {
        self.tls.inner_mut().set_incoming(m);

        if self.handle_handshake(output)? {
            // early return as long as we're handshaking
            return Ok(());
        }

        let mut buf = vec![0; 2000];
        let n = match self.tls.read(&mut buf) {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        buf.truncate(n);

        output.push_back(DtlsEvent::Data(buf));

        Ok(())
    }

    /// Poll the next outgoing DTLS datagram to put on the wire.
    pub fn poll_datagram(&mut self) -> Option<Vec<u8>> {
        let x = self.tls.inner_mut().pop_outgoing();
        if let Some(x) = &x {
            if x.len() > DATAGRAM_MTU_WARN {
                warn!("DTLS above MTU {}: {}", DATAGRAM_MTU_WARN, x.len());
            }
            trace!("Poll datagram: {}", x.len());
        }
        x
    }
}

fn dtls_create_ctx(cert: &DtlsCert) -> Result<SslContext, CryptoError> {
    // Technically we want to disallow DTLS < 1.2, but browsers already do,
    // and NO_DTLSV1 covers the worst of it.
    let mut ctx = SslContextBuilder::new(SslMethod::dtls())?;

    ctx.set_cipher_list(DTLS_CIPHERS)?;
    ctx.set_tlsext_use_srtp(SrtpProfile::Aes128CmSha1_80.openssl_name())?;

    let mut mode = SslVerifyMode::empty();
    mode.insert(SslVerifyMode::PEER);
    mode.insert(SslVerifyMode::FAIL_IF_NO_PEER_CERT);
    ctx.set_verify_callback(mode, |_ok, _ctx| true);

    ctx.set_private_key(&cert.pkey)?;
    ctx.set_certificate(&cert.x509)?;

    let mut options = SslOptions::empty();
    options.insert(SslOptions::SINGLE_ECDH_USE);
    options.insert(SslOptions::NO_DTLSV1);
    ctx.set_options(options);

    let ctx = ctx.build();

    Ok(ctx)
}

fn dtls_ssl_create(ctx: &SslContext) -> Result<Ssl, CryptoError> {
    let mut ssl = Ssl::new(ctx)?;
    ssl.set_mtu(DATAGRAM_MTU as u32)?;

    let eckey = EcKey::from_curve_name(DTLS_EC_CURVE)?;
    ssl.set_tmp_ecdh(&eckey)?;

    Ok(ssl)
}

#[derive(Default)]
struct IoBuffer {
    incoming: Vec<u8>,
    outgoing: VecDeque<Vec<u8>>,
}

impl IoBuffer {
    fn set_incoming(&mut self, buf: &[u8]) {
        self.incoming.extend_from_slice(buf);

        // Each packet ought to be ~MTU sized. If openssl is not consuming
        // the incoming data, something is badly wrong.
        assert!(
            self.incoming.len() < 30_000,
            "Incoming DTLS data is not being consumed"
        );
    }

    fn pop_outgoing(&mut self) -> Option<Vec<u8>> {
        self.outgoing.pop_front()
    }
}

impl io::Read for IoBuffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.incoming.len();

        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "WouldBlock"));
        }

        let max = buf.len().min(n);

        buf[..max].copy_from_slice(&self.incoming[..max]);

        if max == self.incoming.len() {
            // The typical case is that the entire input is consumed at once.
            self.incoming.truncate(0);
        } else {
            self.incoming.drain(..max);
        }

        Ok(max)
    }
}

impl io::Write for IoBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outgoing.push_back(buf.to_vec());

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct TlsStream<S> {
    active: Option<bool>,
    state: State<S>,
    keying_mat: Option<(KeyingMaterial, SrtpProfile, Fingerprint)>,
    exported: bool,
}

enum State<S> {
    Init(Ssl, S),
    Handshaking(MidHandshakeSslStream<S>),
    Established(SslStream<S>),
    Empty,
}

impl<S> TlsStream<S>
where
    S: io::Read + io::Write,
{
    fn new(ssl: Ssl, stream: S) -> Self {
        TlsStream {
            active: None,
            state: State::Init(ssl, stream),
            keying_mat: None,
            exported: false,
        }
    }

    fn is_active(&self) -> Option<bool> {
        self.active
    }

    fn set_active(&mut self, active: bool) {
        assert!(
            self.active.is_none(),
            "set_active should be called exactly once"
        );
        self.active = Some(active);
    }

    fn complete_handshake_until_block(&mut self) -> Result<bool, CryptoError> {
        if let Err(e) = self.handshaken() {
            if e.kind() == io::ErrorKind::WouldBlock {
                Ok(false)
            } else {
                Err(e.into())
            }
        } else {
            Ok(true)
        }
    }

    fn is_connected(&self) -> bool {
        matches!(self.state, State::Established(_))
    }

    fn handshaken(&mut self) -> Result<&mut SslStream<S>, io::Error> {
        let active = self.is_active().expect("set_active must be called");
        let v = self.state.handshaken(active)?;

        // First time we complete the handshake, we extract the keying
        // material for SRTP.
        if !self.exported {
            let keying_mat = export_srtp_keying_material(v)?;
            self.exported = true;
            self.keying_mat = Some(keying_mat);
        }

        Ok(v)
    }

    fn take_srtp_keying_material(&mut self) -> Option<(KeyingMaterial, SrtpProfile, Fingerprint)> {
        self.keying_mat.take()
    }

    fn inner_mut(&mut self) -> &mut S {
        match &mut self.state {
            State::Init(_, s) => s,
            State::Handshaking(v) => v.get_mut(),
            State::Established(v) => v.get_mut(),
            State::Empty => panic!("inner_mut on empty dtls state"),
        }
    }
}

impl<S> State<S>
where
    S: io::Read + io::Write,
{
    fn handshaken(&mut self, active: bool) -> Result<&mut SslStream<S>, io::Error> {
        if let State::Established(v) = self {
            return Ok(v);
        }

        let taken = mem::replace(self, State::Empty);

        let result = match taken {
            State::Empty | State::Established(_) => unreachable!(),
            State::Init(ssl, stream) => {
                if active {
                    debug!("Connect");
                    ssl.connect(stream)
                } else {
                    debug!("Accept");
                    ssl.accept(stream)
                }
            }
            State::Handshaking(mid) => mid.handshake(),
        };

        match result {
            Ok(v) => {
                debug!("Established version: {}", v.ssl().version_str());

                let _ = mem::replace(self, State::Established(v));

                // recursively return the &mut SslStream.
                self.handshaken(active)
            }
            Err(e) => Err(match e {
                HandshakeError::WouldBlock(e) => {
                    let _ = mem::replace(self, State::Handshaking(e));
                    io::Error::new(io::ErrorKind::WouldBlock, "WouldBlock")
                }
                HandshakeError::SetupFailure(e) => {
                    debug!("DTLS setup failed: {:?}", e);
                    io::Error::new(io::ErrorKind::InvalidInput, e)
                }
                HandshakeError::Failure(e) => {
                    let e = e.into_error();
                    debug!("DTLS failure: {:?}", e);
                    io::Error::new(io::ErrorKind::InvalidData, e)
                }
            }),
        }
    }
}

fn export_srtp_keying_material<S>(
    stream: &mut SslStream<S>,
) -> Result<(KeyingMaterial, SrtpProfile, Fingerprint), io::Error> {
    let ssl = stream.ssl();

    // remote peer certificate fingerprint
    let x509 = ssl
        .peer_certificate()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "No remote X509 cert"))?;
    let digest: &[u8] = &x509.digest(MessageDigest::sha256())?;

    let fp = Fingerprint {
        hash_func: "sha-256".into(),
        bytes: digest.to_vec(),
    };

    let srtp_profile_id = ssl
        .selected_srtp_profile()
        .map(|s| s.id())
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "Failed to negotiate SRTP profile"))?;
    let srtp_profile = match srtp_profile_id {
        SrtpProfileId::SRTP_AES128_CM_SHA1_80 => SrtpProfile::Aes128CmSha1_80,
        x => {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("Unsupported SRTP profile {:x}", x.as_raw()),
            ))
        }
    };

    // extract SRTP keying material
    let mut buf = vec![0_u8; srtp_profile.keying_material_len()];
    ssl.export_keying_material(&mut buf, DTLS_KEY_LABEL, None)?;

    let mat = KeyingMaterial::new(buf);

    Ok((mat, srtp_profile, fp))
}

impl<S> io::Read for TlsStream<S>
where
    S: io::Read + io::Write,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.handshaken()?.read(buf)
    }
}

impl<S> io::Write for TlsStream<S>
where
    S: io::Read + io::Write,
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.handshaken()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.handshaken()?.flush()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cert_fingerprint_is_sha256() {
        let cert = DtlsCert::new().unwrap();
        let f = cert.fingerprint();
        assert_eq!(f.hash_func, "sha-256");
        assert_eq!(f.bytes.len(), 32);
    }

    #[test]
    fn handshake_loopback() {
        let ca = DtlsCert::new().unwrap();
        let cb = DtlsCert::new().unwrap();

        let mut a = Dtls::new(&ca).unwrap();
        let mut b = Dtls::new(&cb).unwrap();
        a.set_active(true);
        b.set_active(false);

        let mut events = VecDeque::new();

        // kick off the client flight
        a.handle_handshake(&mut events).unwrap();

        for _ in 0..20 {
            if a.is_connected() && b.is_connected() {
                break;
            }
            while let Some(d) = a.poll_datagram() {
                b.handle_receive(&d, &mut events).unwrap();
            }
            while let Some(d) = b.poll_datagram() {
                a.handle_receive(&d, &mut events).unwrap();
            }
        }

        assert!(a.is_connected());
        assert!(b.is_connected());

        let mats: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, DtlsEvent::SrtpKeyingMaterial(_, _)))
            .collect();
        assert_eq!(mats.len(), 2);
    }
}
