use std::fmt;

use openssl::cipher;
use openssl::cipher_ctx::CipherCtx;
use openssl::error::ErrorStack;
use openssl::symm::{Cipher, Crypter, Mode};

use crate::rtp::RtpHeader;

use super::{sha1_hmac, KeyingMaterial};

// Key derivation labels defined in RFC 3711 section 4.3.
const LABEL_RTP_AES: u8 = 0;
const LABEL_RTP_AUTHENTICATION_KEY: u8 = 1;
const LABEL_RTP_SALT: u8 = 2;

const LABEL_RTCP_AES: u8 = 3;
const LABEL_RTCP_AUTHENTICATION_KEY: u8 = 4;
const LABEL_RTCP_SALT: u8 = 5;

// SRTP_AES128_CM_HMAC_SHA1_80
//    cipher: AES_128_CM
//    cipher_key_length: 128
//    cipher_salt_length: 112
//    auth_function: HMAC-SHA1
//    auth_key_length: 160
//    auth_tag_length: 80
const KEY_LEN: usize = 16;
const SALT_LEN: usize = 14;
const HMAC_KEY_LEN: usize = 20;
const HMAC_TAG_LEN: usize = 10;

const SRTCP_INDEX_LEN: usize = 4;

/// Bytes SRTP adds to an RTP packet.
pub const SRTP_OVERHEAD: usize = HMAC_TAG_LEN;

/// Bytes SRTCP adds to an RTCP packet.
pub const SRTCP_OVERHEAD: usize = HMAC_TAG_LEN + SRTCP_INDEX_LEN;

type AesKey = [u8; KEY_LEN];
type RtpSalt = [u8; SALT_LEN];
type RtpIv = [u8; 16];

/// SRTP/SRTCP context for one direction, keyed from DTLS keying material.
pub struct SrtpContext {
    /// Encryption/decryption derived from the master key for RTP.
    rtp: Derived,
    /// Encryption/decryption derived from the master key for RTCP.
    rtcp: Derived,
    /// Counter for outgoing SRTCP packets.
    srtcp_index: u32,
}

impl SrtpContext {
    /// Create an SRTP context using the provided keying material.
    ///
    /// `left` selects the first (client write) halves of the keying
    /// material; the DTLS-active side sends with `left == true`.
    pub fn new(mat: &KeyingMaterial, left: bool) -> Self {
        let key = SrtpKey::new(mat, left);

        let (rtp, rtcp) = Derived::from_key(&key);

        SrtpContext {
            rtp,
            rtcp,
            srtcp_index: 0,
        }
    }

    /// Protect an RTP packet. `buf` is the complete plain packet
    /// (header included); the result is the complete protected packet.
    ///
    /// `srtp_index` is the extended sequence number (ROC × 2^16 + SEQ).
    pub fn protect_rtp(&mut self, buf: &[u8], header: &RtpHeader, srtp_index: u64) -> Vec<u8> {
        let hlen = header.header_len;
        let input = &buf[hlen..];

        let iv = self.rtp.salt_iv(*header.ssrc, srtp_index);

        let mut output = vec![0_u8; buf.len() + HMAC_TAG_LEN];
        self.rtp
            .enc
            .crypt(&iv, input, &mut output[hlen..])
            .expect("rtp encrypt");

        output[..hlen].copy_from_slice(&buf[..hlen]);

        let hmac_start = buf.len();
        let roc = (srtp_index >> 16) as u32;
        let tag = sha1_hmac(
            &self.rtp.hmac,
            &[&output[..hmac_start], &roc.to_be_bytes()],
        );
        output[hmac_start..(hmac_start + HMAC_TAG_LEN)].copy_from_slice(&tag[0..HMAC_TAG_LEN]);

        output
    }

    /// Unprotect an RTP packet. Returns the decrypted payload, without
    /// the (unencrypted) header.
    pub fn unprotect_rtp(
        &mut self,
        buf: &[u8],
        header: &RtpHeader,
        srtp_index: u64,
    ) -> Option<Vec<u8>> {
        if buf.len() < HMAC_TAG_LEN + header.header_len {
            return None;
        }

        let hmac_start = buf.len() - HMAC_TAG_LEN;

        let roc = (srtp_index >> 16) as u32;
        let tag = sha1_hmac(&self.rtp.hmac, &[&buf[..hmac_start], &roc.to_be_bytes()]);
        if tag[0..HMAC_TAG_LEN] != buf[hmac_start..] {
            trace!("unprotect_rtp hmac verify fail");
            return None;
        }

        let iv = self.rtp.salt_iv(*header.ssrc, srtp_index);

        let input = &buf[header.header_len..hmac_start];
        let mut output = vec![0; input.len()];

        if let Err(e) = self.rtp.dec.crypt(&iv, input, &mut output) {
            warn!("Failed to decrypt SRTP: {:?}", e);
            return None;
        };

        Some(output)
    }

    /// Protect a complete plain RTCP packet.
    pub fn protect_rtcp(&mut self, buf: &[u8]) -> Vec<u8> {
        let srtcp_index = self.srtcp_index;

        // https://tools.ietf.org/html/rfc3711#page-15
        // The SRTCP index MUST be set to zero before the first SRTCP
        // packet is sent, and MUST be incremented by one,
        // modulo 2^31, after each SRTCP packet is sent.
        self.srtcp_index = (self.srtcp_index + 1) % 2_u32.pow(31);

        // e is always encrypted, rest is 31 bit index.
        let e_and_si = 0x8000_0000 | srtcp_index;
        let ssrc = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);

        if ssrc == 0 {
            warn!("SSRC 0 does not make a good SRTCP IV");
        }

        let iv = self.rtcp.salt_iv(ssrc, srtcp_index as u64);

        let mut output = vec![0_u8; buf.len() + SRTCP_INDEX_LEN + HMAC_TAG_LEN];
        output[0..8].copy_from_slice(&buf[0..8]);
        let input = &buf[8..];
        let encout = &mut output[8..(8 + input.len())];

        self.rtcp.enc.crypt(&iv, input, encout).expect("rtcp encrypt");

        let to = &mut output[buf.len()..];
        to[0..4].copy_from_slice(&e_and_si.to_be_bytes());

        let hmac_index = output.len() - HMAC_TAG_LEN;
        let tag = sha1_hmac(&self.rtcp.hmac, &[&output[0..hmac_index]]);
        output[hmac_index..].copy_from_slice(&tag[0..HMAC_TAG_LEN]);

        output
    }

    // SRTCP layout
    // ["header", ssrc, payload, ...], ssrtcp_index, tag]
    //
    // |------------------------------------------------|
    //                  authenticated
    //
    //                 |---------------|
    //                 encrypted (aes)
    /// Unprotect a complete SRTCP packet. Returns the plain compound packet.
    pub fn unprotect_rtcp(&mut self, buf: &[u8]) -> Option<Vec<u8>> {
        if buf.len() < HMAC_TAG_LEN + SRTCP_INDEX_LEN + 8 {
            return None;
        }

        let hmac_start = buf.len() - HMAC_TAG_LEN;

        let tag = sha1_hmac(&self.rtcp.hmac, &[&buf[..hmac_start]]);
        if tag[0..HMAC_TAG_LEN] != buf[hmac_start..] {
            trace!("unprotect_rtcp hmac verify fail");
            return None;
        }

        let idx_start = hmac_start - SRTCP_INDEX_LEN;

        let srtcp_index_be = [
            buf[idx_start],
            buf[idx_start + 1],
            buf[idx_start + 2],
            buf[idx_start + 3],
        ];

        // E-flag and SRTCP index.
        let e_and_si = u32::from_be_bytes(srtcp_index_be);

        let is_encrypted = e_and_si & 0x8000_0000 > 0;

        if !is_encrypted {
            // Non-encrypted we can just return.
            return Some(buf[0..idx_start].to_vec());
        }

        // The SRTCP index is a 31-bit counter for the SRTCP packet.
        let srtcp_index = e_and_si & 0x7fff_ffff;
        let ssrc = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);

        let iv = self.rtcp.salt_iv(ssrc, srtcp_index as u64);

        // The Encrypted Portion of an SRTCP packet consists of the
        // encryption of the RTCP payload of the equivalent compound RTCP
        // packet, from the ninth (9) octet to the end of the compound packet.
        let input = &buf[8..idx_start];
        let mut output = vec![0_u8; input.len() + 8];
        output[0..8].copy_from_slice(&buf[0..8]);

        if let Err(e) = self.rtcp.dec.crypt(&iv, input, &mut output[8..]) {
            warn!("Failed to decrypt SRTCP: {:?}", e);
            return None;
        }

        Some(output)
    }
}

/// SrtpKeys created from the DTLS keying material.
#[derive(Debug)]
struct SrtpKey {
    master: [u8; KEY_LEN],
    salt: [u8; SALT_LEN],
}

impl SrtpKey {
    fn new(mat: &KeyingMaterial, left: bool) -> Self {
        // layout in the keying material is
        // [key_input, key_output, salt_input, salt_output]

        // Invariant
        assert!(
            mat.len() == KEY_LEN * 2 + SALT_LEN * 2,
            "KeyingMaterial length must match the negotiated profile"
        );

        // offset 0, offset 1
        let (o0, o1) = if left { (0, 0) } else { (KEY_LEN, SALT_LEN) };

        let mut master = [0; KEY_LEN];
        let mut salt = [0; SALT_LEN];

        master[0..KEY_LEN].copy_from_slice(&mat[o0..(o0 + KEY_LEN)]);
        salt[0..SALT_LEN]
            .copy_from_slice(&mat[(KEY_LEN + KEY_LEN + o1)..(KEY_LEN + KEY_LEN + o1 + SALT_LEN)]);

        SrtpKey { master, salt }
    }

    fn derive(&self, label: u8, out: &mut [u8]) {
        // AES-CM (128 bits) defined in RFC 3711.
        let mut i = 0; // index in out

        // input layout: [salt[SALT_LEN] || label, round[2]] (|| is xor 7th byte)
        let mut input = [0; KEY_LEN];

        input[0..SALT_LEN].copy_from_slice(&self.salt[..]);
        input[7] ^= label;

        let mut buf = [0; 16 + 16]; // output from each AES
        let mut round: u16 = 0; // counter for each AES round

        loop {
            if i == out.len() {
                break;
            }

            // splice in round at bottom of input
            input[14..].copy_from_slice(&round.to_be_bytes()[..]);

            // default key derivation function, which uses AES-128 in Counter Mode
            let mut aes = Crypter::new(Cipher::aes_128_ecb(), Mode::Encrypt, &self.master, None)
                .expect("AES deriver");

            // Run AES
            let count = aes.update(&input[..], &mut buf[..]).expect("AES update");
            let rest = aes.finalize(&mut buf[count..]).expect("AES finalize");
            assert_eq!(count + rest, 16 + 16); // input len + block size

            // Even if we get 32 bytes of output with AES 128 ECB, we only
            // use the first 16. That matches the tests in the RFC.
            for j in buf.iter().take(16) {
                if i == out.len() {
                    break;
                }
                out[i] = *j;
                i += 1;
            }

            round += 1;
        }
    }
}

/// Session keys derived from the master key.
struct Derived {
    hmac: [u8; HMAC_KEY_LEN],
    salt: RtpSalt,
    enc: AesCtr,
    dec: AesCtr,
}

impl Derived {
    fn from_key(srtp_key: &SrtpKey) -> (Self, Self) {
        // RTP AES Counter
        let mut rtp_aes = [0; KEY_LEN];
        srtp_key.derive(LABEL_RTP_AES, &mut rtp_aes[..]);

        // RTP SHA1 HMAC
        let mut rtp_hmac = [0; HMAC_KEY_LEN];
        srtp_key.derive(LABEL_RTP_AUTHENTICATION_KEY, &mut rtp_hmac[..]);

        // RTP IV SALT
        let mut rtp_salt = [0; SALT_LEN];
        srtp_key.derive(LABEL_RTP_SALT, &mut rtp_salt[..]);

        // RTCP AES Counter
        let mut rtcp_aes = [0; KEY_LEN];
        srtp_key.derive(LABEL_RTCP_AES, &mut rtcp_aes[..]);

        // RTCP SHA1 HMAC
        let mut rtcp_hmac = [0; HMAC_KEY_LEN];
        srtp_key.derive(LABEL_RTCP_AUTHENTICATION_KEY, &mut rtcp_hmac[..]);

        // RTCP IV SALT
        let mut rtcp_salt = [0; SALT_LEN];
        srtp_key.derive(LABEL_RTCP_SALT, &mut rtcp_salt[..]);

        let rtp = Derived {
            hmac: rtp_hmac,
            salt: rtp_salt,
            enc: AesCtr::new(rtp_aes, true),
            dec: AesCtr::new(rtp_aes, false),
        };

        let rtcp = Derived {
            hmac: rtcp_hmac,
            salt: rtcp_salt,
            enc: AesCtr::new(rtcp_aes, true),
            dec: AesCtr::new(rtcp_aes, false),
        };

        (rtp, rtcp)
    }

    fn salt_iv(&self, ssrc: u32, srtp_index: u64) -> RtpIv {
        let mut iv = [0; 16];

        let ssrc_be = ssrc.to_be_bytes();
        let srtp_be = srtp_index.to_be_bytes();

        iv[4..8].copy_from_slice(&ssrc_be);

        for i in 0..8 {
            iv[i + 6] ^= srtp_be[i];
        }
        for i in 0..14 {
            iv[i] ^= self.salt[i];
        }

        iv
    }
}

struct AesCtr {
    ctx: CipherCtx,
    encrypt: bool,
}

impl AesCtr {
    fn new(key: AesKey, encrypt: bool) -> Self {
        let t = cipher::Cipher::aes_128_ctr();
        let mut ctx = CipherCtx::new().expect("a reusable cipher context");
        if encrypt {
            ctx.encrypt_init(Some(t), Some(&key[..]), None)
                .expect("enc init");
        } else {
            ctx.decrypt_init(Some(t), Some(&key[..]), None)
                .expect("dec init");
        }
        AesCtr { ctx, encrypt }
    }

    fn crypt(&mut self, iv: &RtpIv, input: &[u8], output: &mut [u8]) -> Result<(), ErrorStack> {
        if self.encrypt {
            self.ctx.encrypt_init(None, None, Some(iv))?;
        } else {
            self.ctx.decrypt_init(None, None, Some(iv))?;
        }
        let count = self.ctx.cipher_update(input, Some(output))?;
        self.ctx.cipher_final(&mut output[count..])?;
        Ok(())
    }
}

impl fmt::Debug for SrtpContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SrtpContext")
            .field("srtcp_index", &self.srtcp_index)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use crate::rtp::ExtensionMap;

    use super::*;

    #[test]
    fn derive_key() {
        // https://tools.ietf.org/html/rfc3711#appendix-B.3
        //
        // Key Derivation Test Vectors.

        let master = [
            0xE1, 0xF9, 0x7A, 0x0D, 0x3E, 0x01, 0x8B, 0xE0, //
            0xD6, 0x4F, 0xA3, 0x2C, 0x06, 0xDE, 0x41, 0x39,
        ];

        let salt = [
            0x0E, 0xC6, 0x75, 0xAD, 0x49, 0x8A, 0xFE, //
            0xEB, 0xB6, 0x96, 0x0B, 0x3A, 0xAB, 0xE6,
        ];

        let sk = SrtpKey { master, salt };

        // aes crypto key
        let mut out = [0_u8; 16];
        sk.derive(0, &mut out[..]);

        assert_eq!(
            out,
            [
                0xC6, 0x1E, 0x7A, 0x93, 0x74, 0x4F, 0x39, 0xEE, //
                0x10, 0x73, 0x4A, 0xFE, 0x3F, 0xF7, 0xA0, 0x87
            ]
        );

        // hmac
        let mut out = [0_u8; 20];
        sk.derive(1, &mut out[..]);

        assert_eq!(
            out,
            [
                0xCE, 0xBE, 0x32, 0x1F, 0x6F, 0xF7, 0x71, 0x6B, //
                0x6F, 0xD4, 0xAB, 0x49, 0xAF, 0x25, 0x6A, 0x15, //
                0x6D, 0x38, 0xBA, 0xA4
            ]
        );

        // salt
        let mut out = [0_u8; 14];
        sk.derive(2, &mut out[..]);

        assert_eq!(
            out,
            [
                0x30, 0xCB, 0xBC, 0x08, 0x86, 0x3D, 0x8C, //
                0x85, 0xD4, 0x9D, 0xB3, 0x4A, 0x9A, 0xE1
            ]
        );
    }

    const MAT: [u8; 60] = [
        0x2C, 0xB0, 0x23, 0x46, 0xB4, 0x22, 0x76, 0xA6, 0x72, 0xCF, 0xD1, 0x43, 0xAE, 0xC2, 0xD5,
        0xEE, 0xDD, 0xDE, 0x55, 0xF0, 0xAD, 0x7B, 0xCA, 0xC2, 0x26, 0x66, 0xF1, 0xC6, 0x38, 0x61,
        0x73, 0xED, 0x6E, 0xB2, 0x5C, 0xB7, 0xD2, 0x6A, 0x61, 0xA1, 0xEE, 0x2C, 0x21, 0x0A, 0xDA,
        0xE7, 0x60, 0xAA, 0xA2, 0xFD, 0x67, 0xB6, 0x72, 0xC4, 0x1A, 0xED, 0x10, 0x5F, 0x9D, 0x36,
    ];

    const SRTCP: &[u8] = &[
        // header
        0x80, 0xC8, 0x00, 0x06, //
        // ssrc
        0x3C, 0xD7, 0xCC, 0x13, //
        // encrypted payload
        0xB7, 0xC8, 0x31, 0xDC, 0xB7, 0x76, 0xCD, 0x8D, 0xC2, 0x6F, 0xDA, 0x1D, 0x9B, 0xFC, 0x8E,
        0xE6, 0x58, 0x9A, 0x1A, 0x8A, 0x49, 0x28, 0x9C, 0xAE, 0xB2, 0x64, 0x20, 0x0C, 0x37, 0xD2,
        0xD0, 0xA4, 0xAF, 0xAC, 0x63, 0x85, 0xFF, 0xC6, 0x0D, 0xEC, 0x7D, 0x06, 0xD4, 0x87, 0x3D,
        0xD3, 0xA8, 0xCC, //
        // E flag and srtcp index (1)
        0x80, 0x00, 0x00, 0x01, //
        // hmac
        0xB7, 0xBB, 0x52, 0x65, 0x21, 0xD1, 0xE7, 0x3C, 0x0F, 0xC0,
    ];

    #[test]
    fn unprotect_rtcp_vector() {
        let key_mat = KeyingMaterial::new(MAT.to_vec());
        let mut ctx_rx = SrtpContext::new(&key_mat, true);
        ctx_rx.srtcp_index = 1;

        let decrypted = ctx_rx.unprotect_rtcp(SRTCP).unwrap();

        // check srtcp_index in incoming was indeed 1
        let srtcp_index = SRTCP.len() - HMAC_TAG_LEN - SRTCP_INDEX_LEN;
        let e_and_i = &SRTCP[srtcp_index..(srtcp_index + 4)];
        assert_eq!(e_and_i, &0x8000_0001_u32.to_be_bytes());

        // Take us back to where we started.
        let encrypted = ctx_rx.protect_rtcp(&decrypted);
        assert_eq!(encrypted, SRTCP);
    }

    #[test]
    fn protect_unprotect_rtp_roundtrip() {
        let key_mat = KeyingMaterial::new(MAT.to_vec());
        let mut tx = SrtpContext::new(&key_mat, true);
        let mut rx = SrtpContext::new(&key_mat, true);

        // plain RTP packet with a 12 byte header
        let plain: &[u8] = &[
            0x80, 0x6f, 0x12, 0x34, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x30, 0x39, // header
            0xde, 0xad, 0xbe, 0xef, 0x01, 0x02, 0x03, 0x04, 0x05,
        ];

        let header = RtpHeader::parse(plain, &ExtensionMap::empty()).unwrap();

        let protected = tx.protect_rtp(plain, &header, 0x1234);
        assert_eq!(protected.len(), plain.len() + SRTP_OVERHEAD);
        assert_ne!(&protected[12..plain.len()], &plain[12..]);

        let header2 = RtpHeader::parse(&protected, &ExtensionMap::empty()).unwrap();
        let payload = rx.unprotect_rtp(&protected, &header2, 0x1234).unwrap();
        assert_eq!(payload, &plain[12..]);
    }

    #[test]
    fn unprotect_rtp_fails_on_tamper() {
        let key_mat = KeyingMaterial::new(MAT.to_vec());
        let mut tx = SrtpContext::new(&key_mat, true);
        let mut rx = SrtpContext::new(&key_mat, true);

        let plain: &[u8] = &[
            0x80, 0x6f, 0x12, 0x34, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x30, 0x39, //
            0xaa, 0xbb, 0xcc,
        ];
        let header = RtpHeader::parse(plain, &ExtensionMap::empty()).unwrap();
        let mut protected = tx.protect_rtp(plain, &header, 7);
        protected[13] ^= 0xff;

        let header2 = RtpHeader::parse(&protected, &ExtensionMap::empty()).unwrap();
        assert!(rx.unprotect_rtp(&protected, &header2, 7).is_none());
    }
}
