use std::fmt;
use std::net::SocketAddr;

use crc::{Crc, CRC_32_ISO_HDLC};
use thiserror::Error;

use crate::crypto::sha1_hmac;

const MAGIC: &[u8] = &[0x21, 0x12, 0xA4, 0x42];
const FINGERPRINT_XOR: u32 = 0x5354_554e;

const ATTR_USERNAME: u16 = 0x0006;
const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_PRIORITY: u16 = 0x0024;
const ATTR_USE_CANDIDATE: u16 = 0x0025;
const ATTR_FINGERPRINT: u16 = 0x8028;
const ATTR_ICE_CONTROLLED: u16 = 0x8029;
const ATTR_ICE_CONTROLLING: u16 = 0x802a;

/// Possible errors when handling STUN messages.
#[derive(Debug, Error)]
pub enum StunError {
    /// A STUN message could not be parsed.
    #[error("STUN parse error: {0}")]
    Parse(String),

    /// An IO error occurred while handling a STUN message.
    #[error("STUN io: {0}")]
    Io(#[from] std::io::Error),
}

/// STUN transaction ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransId([u8; 12]);

impl TransId {
    /// A new random transaction id.
    pub fn new() -> Self {
        let mut t = [0_u8; 12];
        for v in &mut t {
            *v = fastrand::u8(..);
        }
        TransId(t)
    }

    fn from_slice(s: &[u8]) -> Self {
        let mut t = [0_u8; 12];
        t[..].copy_from_slice(s);
        TransId(t)
    }
}

/// STUN message class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunClass {
    Request,
    Indication,
    Success,
    Failure,
}

impl StunClass {
    // typ is method and class
    // |M11|M10|M9|M8|M7|C1|M6|M5|M4|C0|M3|M2|M1|M0|
    fn from_typ(typ: u16) -> Self {
        let c = ((typ & 0x0100) >> 7) | ((typ & 0x0010) >> 4);
        match c {
            0b00 => StunClass::Request,
            0b01 => StunClass::Indication,
            0b10 => StunClass::Success,
            _ => StunClass::Failure,
        }
    }

    fn to_typ(self) -> u16 {
        match self {
            StunClass::Request => 0x0000,
            StunClass::Indication => 0x0010,
            StunClass::Success => 0x0100,
            StunClass::Failure => 0x0110,
        }
    }
}

/// STUN method. We only ever deal with BINDING.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunMethod {
    Binding,
    Unknown(u16),
}

impl StunMethod {
    fn from_typ(typ: u16) -> Self {
        let m = ((typ & 0x3e00) >> 2) | ((typ & 0x00e0) >> 1) | (typ & 0x000f);
        match m {
            0x001 => StunMethod::Binding,
            x => StunMethod::Unknown(x),
        }
    }

    fn to_typ(self) -> u16 {
        let m = match self {
            StunMethod::Binding => 0x001_u16,
            StunMethod::Unknown(x) => x,
        };
        ((m & 0xf80) << 2) | ((m & 0x070) << 1) | (m & 0x00f)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Attributes<'a> {
    username: Option<&'a str>,
    message_integrity: Option<&'a [u8]>,
    priority: Option<u32>,
    use_candidate: bool,
    ice_controlled: Option<u64>,
    ice_controlling: Option<u64>,
    xor_mapped_address: Option<SocketAddr>,
}

/// A STUN message as fit for an ice-lite server.
///
/// STUN is a very flexible protocol; this only provides what binding
/// request/response handling needs.
#[derive(Clone, Copy)]
pub struct StunMessage<'a> {
    method: StunMethod,
    class: StunClass,
    trans_id: TransId,
    attrs: Attributes<'a>,
    integrity: &'a [u8],
    integrity_len: u16,
}

impl<'a> StunMessage<'a> {
    /// Parse a STUN message from a slice of bytes.
    pub fn parse(buf: &[u8]) -> Result<StunMessage, StunError> {
        if buf.len() < 20 {
            return Err(StunError::Parse("Buffer too short".into()));
        }

        let typ = (buf[0] as u16 & 0b0011_1111) << 8 | buf[1] as u16;
        let len = (buf[2] as u16) << 8 | buf[3] as u16;
        if len & 0b0000_0011 > 0 {
            return Err(StunError::Parse("len is not a multiple of 4".into()));
        }
        if len as usize != buf.len() - 20 {
            return Err(StunError::Parse(
                "STUN length vs UDP packet mismatch".into(),
            ));
        }
        if &buf[4..8] != MAGIC {
            return Err(StunError::Parse("magic cookie mismatch".into()));
        }

        let class = StunClass::from_typ(typ);
        let method = StunMethod::from_typ(typ);
        let trans_id = TransId::from_slice(&buf[8..20]);

        let mut message_integrity_offset = 0;

        let attrs = Attributes::parse(&buf[20..], &mut message_integrity_offset)?;

        // length including message integrity attribute
        let (integrity_len, integrity) = if attrs.message_integrity.is_some() {
            let integrity_len = (message_integrity_offset + 4 + 20) as u16;

            // password as key is called "short-term credentials".
            // buffer from beginning including header (+20) to where
            // message-integrity starts.
            let integrity = &buf[0..(message_integrity_offset + 20)];

            (integrity_len, integrity)
        } else {
            (0_u16, [].as_slice())
        };

        if method == StunMethod::Binding && class == StunClass::Request {
            if attrs.message_integrity.is_none() {
                return Err(StunError::Parse(
                    "No message integrity in incoming STUN binding request".into(),
                ));
            }
            if attrs.split_username().is_none() {
                return Err(StunError::Parse("STUN packet missing username".into()));
            }
        }

        Ok(StunMessage {
            class,
            method,
            trans_id,
            attrs,
            integrity,
            integrity_len,
        })
    }

    /// Whether this STUN message is a BINDING request.
    pub fn is_binding_request(&self) -> bool {
        self.method == StunMethod::Binding && self.class == StunClass::Request
    }

    /// The transaction ID of this STUN message.
    pub fn trans_id(&self) -> TransId {
        self.trans_id
    }

    /// Returns the value of the USERNAME attribute, if present.
    pub fn username(&self) -> Option<&'a str> {
        self.attrs.username
    }

    /// If present, splits USERNAME into local and remote (separated by `:`).
    pub fn split_username(&self) -> Option<(&str, &str)> {
        self.attrs.split_username()
    }

    /// Returns the value of the PRIORITY attribute (ICE), if present.
    pub fn prio(&self) -> Option<u32> {
        self.attrs.priority
    }

    /// Returns whether the USE-CANDIDATE attribute (ICE) is present.
    pub fn use_candidate(&self) -> bool {
        self.attrs.use_candidate
    }

    /// Returns the value of the ICE-CONTROLLED attribute, if present.
    pub fn ice_controlled(&self) -> Option<u64> {
        self.attrs.ice_controlled
    }

    /// Returns the value of the ICE-CONTROLLING attribute, if present.
    pub fn ice_controlling(&self) -> Option<u64> {
        self.attrs.ice_controlling
    }

    /// Returns the value of the XOR-MAPPED-ADDRESS attribute, if present.
    pub fn mapped_address(&self) -> Option<SocketAddr> {
        self.attrs.xor_mapped_address
    }

    /// Verify the integrity of this message against the provided password.
    #[must_use]
    pub fn verify(&self, password: &[u8]) -> bool {
        if let Some(integ) = self.attrs.message_integrity {
            let comp = sha1_hmac(
                password,
                &[
                    &self.integrity[..2],
                    &[(self.integrity_len >> 8) as u8, self.integrity_len as u8],
                    &self.integrity[4..],
                ],
            );

            comp == integ
        } else {
            false
        }
    }

    /// Serialize this message into the provided buffer, returning the final
    /// length of the message.
    ///
    /// The password keys the `MESSAGE-INTEGRITY` attribute; a `FINGERPRINT`
    /// is always appended.
    pub fn to_bytes(self, password: &[u8], buf: &mut [u8]) -> Result<usize, StunError> {
        const HDR: usize = 20;

        let typ = self.method.to_typ() | self.class.to_typ();
        buf[0..2].copy_from_slice(&typ.to_be_bytes());
        buf[4..8].copy_from_slice(MAGIC);
        buf[8..20].copy_from_slice(&self.trans_id.0);

        let mut off = 0; // offset into the attribute area

        if let Some(username) = self.attrs.username {
            off += write_attr(&mut buf[HDR + off..], ATTR_USERNAME, username.as_bytes());
        }
        if let Some(prio) = self.attrs.priority {
            off += write_attr(&mut buf[HDR + off..], ATTR_PRIORITY, &prio.to_be_bytes());
        }
        if self.attrs.use_candidate {
            off += write_attr(&mut buf[HDR + off..], ATTR_USE_CANDIDATE, &[]);
        }
        if let Some(tie) = self.attrs.ice_controlled {
            off += write_attr(&mut buf[HDR + off..], ATTR_ICE_CONTROLLED, &tie.to_be_bytes());
        }
        if let Some(tie) = self.attrs.ice_controlling {
            off += write_attr(
                &mut buf[HDR + off..],
                ATTR_ICE_CONTROLLING,
                &tie.to_be_bytes(),
            );
        }
        if let Some(addr) = self.attrs.xor_mapped_address {
            let mut v = [0_u8; 8];
            let SocketAddr::V4(v4) = addr else {
                return Err(StunError::Parse("Only IPv4 XOR-MAPPED-ADDRESS".into()));
            };
            v[1] = 0x01; // family IPv4
            let port = v4.port() ^ 0x2112;
            v[2..4].copy_from_slice(&port.to_be_bytes());
            let ip = v4.ip().octets();
            for i in 0..4 {
                v[4 + i] = ip[i] ^ MAGIC[i];
            }
            off += write_attr(&mut buf[HDR + off..], ATTR_XOR_MAPPED_ADDRESS, &v);
        }

        // message-integrity is computed over the message with the length
        // field covering up to and including the integrity attribute.
        let integrity_len = (off + 4 + 20) as u16;
        buf[2..4].copy_from_slice(&integrity_len.to_be_bytes());
        let hmac = sha1_hmac(password, &[&buf[..HDR + off]]);
        off += write_attr(&mut buf[HDR + off..], ATTR_MESSAGE_INTEGRITY, &hmac);

        // fingerprint covers everything before it, with the length field
        // including the fingerprint attribute itself.
        let total_len = (off + 8) as u16;
        buf[2..4].copy_from_slice(&total_len.to_be_bytes());
        let crc = Crc::<u32>::new(&CRC_32_ISO_HDLC).checksum(&buf[..HDR + off]) ^ FINGERPRINT_XOR;
        off += write_attr(&mut buf[HDR + off..], ATTR_FINGERPRINT, &crc.to_be_bytes());

        Ok(HDR + off)
    }
}

/// Writes one attribute TLV, padded to a word boundary. Returns bytes used.
fn write_attr(buf: &mut [u8], typ: u16, val: &[u8]) -> usize {
    buf[0..2].copy_from_slice(&typ.to_be_bytes());
    buf[2..4].copy_from_slice(&(val.len() as u16).to_be_bytes());
    buf[4..4 + val.len()].copy_from_slice(val);
    let mut len = 4 + val.len();
    while len % 4 != 0 {
        buf[len] = 0;
        len += 1;
    }
    len
}

impl<'a> Attributes<'a> {
    fn split_username(&self) -> Option<(&'a str, &'a str)> {
        let u = self.username?;
        u.split_once(':')
    }

    fn parse(
        mut buf: &'a [u8],
        msg_integrity_off: &mut usize,
    ) -> Result<Attributes<'a>, StunError> {
        let mut attrs = Attributes::default();
        let mut off = 0;

        while !buf.is_empty() {
            if buf.len() < 4 {
                return Err(StunError::Parse("attribute too short".into()));
            }
            let typ = u16::from_be_bytes([buf[0], buf[1]]);
            let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
            let pad = (4 - len % 4) % 4;
            if buf.len() < 4 + len {
                return Err(StunError::Parse("attribute value too short".into()));
            }
            if buf.len() < 4 + len + pad {
                return Err(StunError::Parse("attribute padding too short".into()));
            }
            let val = &buf[4..4 + len];

            match typ {
                ATTR_USERNAME => {
                    attrs.username = Some(
                        std::str::from_utf8(val)
                            .map_err(|_| StunError::Parse("username not utf-8".into()))?,
                    );
                }
                ATTR_MESSAGE_INTEGRITY => {
                    if len != 20 {
                        return Err(StunError::Parse("message-integrity not 20 bytes".into()));
                    }
                    attrs.message_integrity = Some(val);
                    *msg_integrity_off = off;
                }
                ATTR_PRIORITY => {
                    if len == 4 {
                        attrs.priority = Some(u32::from_be_bytes(val.try_into().unwrap()));
                    }
                }
                ATTR_USE_CANDIDATE => {
                    attrs.use_candidate = true;
                }
                ATTR_ICE_CONTROLLED => {
                    if len == 8 {
                        attrs.ice_controlled = Some(u64::from_be_bytes(val.try_into().unwrap()));
                    }
                }
                ATTR_ICE_CONTROLLING => {
                    if len == 8 {
                        attrs.ice_controlling = Some(u64::from_be_bytes(val.try_into().unwrap()));
                    }
                }
                ATTR_XOR_MAPPED_ADDRESS => {
                    if len >= 8 && val[1] == 0x01 {
                        let port = u16::from_be_bytes([val[2], val[3]]) ^ 0x2112;
                        let ip = [
                            val[4] ^ MAGIC[0],
                            val[5] ^ MAGIC[1],
                            val[6] ^ MAGIC[2],
                            val[7] ^ MAGIC[3],
                        ];
                        attrs.xor_mapped_address = Some(SocketAddr::from((ip, port)));
                    }
                }
                ATTR_FINGERPRINT => {
                    // trailing checksum, not validated (we sit behind a
                    // UDP checksum already)
                }
                _ => {
                    trace!("Ignore STUN attribute type: {:#06x}", typ);
                }
            }

            buf = &buf[4 + len + pad..];
            off += 4 + len + pad;
        }

        Ok(attrs)
    }
}

/// Builder for outgoing STUN messages.
pub struct StunMessageBuilder<'a> {
    method: StunMethod,
    class: StunClass,
    attrs: Attributes<'a>,
}

impl<'a> StunMessageBuilder<'a> {
    pub fn new() -> Self {
        StunMessageBuilder {
            method: StunMethod::Binding,
            class: StunClass::Request,
            attrs: Attributes::default(),
        }
    }

    pub fn binding(mut self) -> Self {
        self.method = StunMethod::Binding;
        self
    }

    pub fn request(mut self) -> Self {
        self.class = StunClass::Request;
        self
    }

    pub fn success(mut self) -> Self {
        self.class = StunClass::Success;
        self
    }

    pub fn username(mut self, username: &'a str) -> Self {
        self.attrs.username = Some(username);
        self
    }

    pub fn prio(mut self, prio: u32) -> Self {
        self.attrs.priority = Some(prio);
        self
    }

    pub fn ice_controlled(mut self, tie_breaker: u64) -> Self {
        self.attrs.ice_controlled = Some(tie_breaker);
        self
    }

    pub fn ice_controlling(mut self, tie_breaker: u64) -> Self {
        self.attrs.ice_controlling = Some(tie_breaker);
        self
    }

    pub fn xor_mapped_address(mut self, addr: SocketAddr) -> Self {
        self.attrs.xor_mapped_address = Some(addr);
        self
    }

    pub fn build(self, trans_id: TransId) -> StunMessage<'a> {
        StunMessage {
            method: self.method,
            class: self.class,
            trans_id,
            attrs: self.attrs,
            integrity: &[],
            integrity_len: 0,
        }
    }
}

impl<'a> fmt::Debug for StunMessage<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StunMessage")
            .field("method", &self.method)
            .field("class", &self.class)
            .field("username", &self.attrs.username)
            .field("mapped_address", &self.attrs.xor_mapped_address)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn roundtrip(msg: StunMessage, password: &str) -> Vec<u8> {
        let mut buf = [0_u8; 512];
        let n = msg.to_bytes(password.as_bytes(), &mut buf).unwrap();
        buf[..n].to_vec()
    }

    #[test]
    fn binding_request_roundtrip() {
        let trans_id = TransId::new();
        let msg = StunMessageBuilder::new()
            .binding()
            .request()
            .username("abcd:wxyz")
            .prio(1234)
            .build(trans_id);

        let bytes = roundtrip(msg, "thepassword");

        let parsed = StunMessage::parse(&bytes).unwrap();
        assert!(parsed.is_binding_request());
        assert_eq!(parsed.trans_id(), trans_id);
        assert_eq!(parsed.split_username(), Some(("abcd", "wxyz")));
        assert_eq!(parsed.prio(), Some(1234));
        assert!(parsed.verify(b"thepassword"));
        assert!(!parsed.verify(b"wrong"));
    }

    #[test]
    fn binding_reply_has_xor_mapped_address() {
        let trans_id = TransId::new();
        let peer: SocketAddr = "203.0.113.9:52123".parse().unwrap();
        let msg = StunMessageBuilder::new()
            .binding()
            .success()
            .username("wxyz:abcd")
            .xor_mapped_address(peer)
            .build(trans_id);

        let bytes = roundtrip(msg, "pw");
        let parsed = StunMessage::parse(&bytes).unwrap();
        assert_eq!(parsed.mapped_address(), Some(peer));
        assert!(parsed.verify(b"pw"));
    }

    #[test]
    fn ice_controlled_survives() {
        let msg = StunMessageBuilder::new()
            .binding()
            .request()
            .username("a:b")
            .ice_controlled(77)
            .build(TransId::new());

        let bytes = roundtrip(msg, "pw");
        let parsed = StunMessage::parse(&bytes).unwrap();
        assert_eq!(parsed.ice_controlled(), Some(77));
        assert_eq!(parsed.ice_controlling(), None);
    }

    #[test]
    fn reject_short_or_bad_magic() {
        assert!(StunMessage::parse(&[0_u8; 8]).is_err());

        let mut bytes = roundtrip(
            StunMessageBuilder::new()
                .binding()
                .request()
                .username("a:b")
                .build(TransId::new()),
            "pw",
        );
        bytes[4] = 0xff;
        assert!(StunMessage::parse(&bytes).is_err());
    }
}
