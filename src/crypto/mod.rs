//! DTLS and SRTP, consumed through a narrow interface.
//!
//! The DTLS side wraps openssl; the SRTP side implements the
//! AES-CM-128 HMAC-SHA1-80 profile directly on top of openssl ciphers.

use core::fmt;

use thiserror::Error;

mod dtls;
pub use dtls::{Dtls, DtlsCert, DtlsEvent};

mod srtp;
pub use srtp::SrtpContext;

/// SHA1 HMAC as used for STUN message integrity and SRTP authentication.
pub fn sha1_hmac(key: &[u8], payloads: &[&[u8]]) -> [u8; 20] {
    use hmac::Hmac;
    use hmac::Mac;
    use sha1::Sha1;

    let mut hmac = Hmac::<Sha1>::new_from_slice(key).expect("hmac to normalize size to 20");

    for payload in payloads {
        hmac.update(payload);
    }

    hmac.finalize().into_bytes().into()
}

/// Errors that can arise in the crypto layer.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Some error from the OpenSSL layer (used for DTLS).
    #[error("{0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    /// Other IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Keying material used as master key for SRTP.
pub struct KeyingMaterial(Vec<u8>);

impl KeyingMaterial {
    pub fn new(m: Vec<u8>) -> Self {
        KeyingMaterial(m)
    }
}

impl std::ops::Deref for KeyingMaterial {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for KeyingMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyingMaterial")
    }
}

/// The single SRTP profile we negotiate via `use_srtp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrtpProfile {
    Aes128CmSha1_80,
}

impl SrtpProfile {
    /// The length of keying material to extract from the DTLS session.
    pub(crate) fn keying_material_len(&self) -> usize {
        match self {
            // MASTER_KEY_LEN * 2 + MASTER_SALT * 2
            SrtpProfile::Aes128CmSha1_80 => 16 * 2 + 14 * 2,
        }
    }

    pub(crate) fn openssl_name(&self) -> &'static str {
        match self {
            SrtpProfile::Aes128CmSha1_80 => "SRTP_AES128_CM_SHA1_80",
        }
    }
}

impl fmt::Display for SrtpProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.openssl_name())
    }
}

/// Certificate fingerprint.
///
/// DTLS uses self signed certificates, and the fingerprint is communicated
/// via SDP to let the remote peer verify who is connecting.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    /// Hash function used to produce the `bytes`. Normally `sha-256`.
    pub hash_func: String,

    /// Digest of the certificate by the algorithm in `hash_func`.
    pub bytes: Vec<u8>,
}

// DO NOT CHANGE!
// This format is exactly what's needed in an SDP.
impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.hash_func)?;
        for (i, b) in self.bytes.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Fingerprint {
    type Err = String;

    fn from_str(hex_string: &str) -> Result<Self, Self::Err> {
        let (hash_func, hex_with_colons) = hex_string
            .split_once(' ')
            .ok_or_else(|| "Failed to split once".to_owned())?;

        let mut bytes = Vec::new();
        for hex in hex_with_colons.split(':') {
            let byte = u8::from_str_radix(hex, 16)
                .map_err(|e| format!("Failed to parse fingerprint: {}", e))?;
            bytes.push(byte);
        }

        Ok(Self {
            hash_func: hash_func.to_owned(),
            bytes,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fingerprint_display_parse() {
        let f = Fingerprint {
            hash_func: "sha-256".into(),
            bytes: vec![0x45, 0xad, 0x5c, 0x01],
        };
        let s = f.to_string();
        assert_eq!(s, "sha-256 45:AD:5C:01");
        let back: Fingerprint = s.parse().unwrap();
        assert_eq!(back, f);
    }

    #[test]
    fn sha1_hmac_rfc2202() {
        // RFC 2202 test case 2.
        let digest = sha1_hmac(b"Jefe", &[b"what do ya want ", b"for nothing?"]);
        assert_eq!(
            digest,
            [
                0xef, 0xfc, 0xdf, 0x6a, 0xe5, 0xeb, 0x2f, 0xa2, 0xd2, 0x74, 0x16, 0xd5, 0xf1,
                0x84, 0xdf, 0x9c, 0x25, 0x9a, 0x7c, 0x79
            ]
        );
    }
}
