use std::fmt;

/// Transport-wide congestion control sequence number extension.
pub const TWCC_URI: &str =
    "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01";

/// Picture id extension.
pub const PICTURE_ID_URI: &str = "http://www.webrtc.org/experiments/rtp-hdrext/picture-id";

/// RTP header extensions we understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extension {
    /// Transport-wide sequence number, stamped on every outgoing packet
    /// and read off every incoming one when negotiated.
    TransportSequenceNumber,
    /// Codec-independent picture id.
    PictureId,
}

impl Extension {
    pub fn from_sdp_uri(uri: &str) -> Option<Extension> {
        match uri {
            TWCC_URI => Some(Extension::TransportSequenceNumber),
            PICTURE_ID_URI => Some(Extension::PictureId),
            _ => None,
        }
    }

    pub fn as_sdp_uri(&self) -> &'static str {
        match self {
            Extension::TransportSequenceNumber => TWCC_URI,
            Extension::PictureId => PICTURE_ID_URI,
        }
    }
}

impl fmt::Display for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sdp_uri())
    }
}

/// Mapping of extension id (1-14) to extension type, negotiated per BUNDLE.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtensionMap([Option<Extension>; 14]);

/// Values parsed from the extension fields of an RTP header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtensionValues {
    /// The transport-wide sequence number of this packet.
    pub transport_cc: Option<u16>,
    /// The picture id of this packet.
    pub picture_id: Option<u16>,
}

impl ExtensionMap {
    /// An empty mapping with no registered extensions.
    pub fn empty() -> Self {
        ExtensionMap([None; 14])
    }

    /// Register an extension at an id. Ids are 1-14 in the one-byte form.
    pub fn set(&mut self, id: u8, ext: Extension) {
        if id < 1 || id > 14 {
            debug!("Extension id out of range 1-14: {}", id);
            return;
        }
        self.0[id as usize - 1] = Some(ext);
    }

    /// The id an extension is registered at, if any.
    pub fn id_of(&self, ext: Extension) -> Option<u8> {
        self.0
            .iter()
            .position(|x| *x == Some(ext))
            .map(|p| p as u8 + 1)
    }

    pub(crate) fn lookup(&self, id: u8) -> Option<Extension> {
        if id >= 1 && id <= 14 {
            self.0[id as usize - 1]
        } else {
            None
        }
    }

    /// Parse a BEDE extension block (after the 4 byte "defined by profile"
    /// header) into values.
    pub(crate) fn parse(&self, mut buf: &[u8], two_byte_form: bool, ext: &mut ExtensionValues) {
        loop {
            if buf.is_empty() {
                return;
            }

            if buf[0] == 0 {
                // padding
                buf = &buf[1..];
                continue;
            }

            let (id, len) = if two_byte_form {
                if buf.len() < 2 {
                    return;
                }
                let id = buf[0];
                let len = buf[1] as usize;
                buf = &buf[2..];
                (id, len)
            } else {
                let id = buf[0] >> 4;
                let len = (buf[0] & 0xf) as usize + 1;
                buf = &buf[1..];

                if id == 15 {
                    // If the ID value 15 is encountered, its length field
                    // should be ignored, processing of the entire extension
                    // should terminate at that point.
                    return;
                }
                (id, len)
            };

            if buf.len() < len {
                trace!("Bad RTP ext, out of buffer");
                return;
            }

            if let Some(x) = self.lookup(id) {
                x.parse_value(&buf[..len], ext);
            }

            buf = &buf[len..];
        }
    }

    /// Write registered extensions that have values, in one-byte form.
    /// Returns the number of bytes used (not padded to a word boundary).
    pub(crate) fn write_to(&self, buf: &mut [u8], ev: &ExtensionValues) -> usize {
        let mut offset = 0;
        for (idx, x) in self.0.iter().enumerate() {
            let Some(x) = x else {
                continue;
            };
            let Some(n) = x.write_value(&mut buf[offset + 1..], ev) else {
                continue;
            };
            let id = idx as u8 + 1;
            buf[offset] = id << 4 | (n as u8 - 1);
            offset += 1 + n;
        }
        offset
    }
}

impl Extension {
    fn parse_value(&self, buf: &[u8], v: &mut ExtensionValues) {
        match self {
            Extension::TransportSequenceNumber => {
                if buf.len() >= 2 {
                    v.transport_cc = Some(u16::from_be_bytes([buf[0], buf[1]]));
                }
            }
            Extension::PictureId => {
                if buf.len() >= 2 {
                    v.picture_id = Some(u16::from_be_bytes([buf[0], buf[1]]));
                } else if buf.len() == 1 {
                    v.picture_id = Some(buf[0] as u16);
                }
            }
        }
    }

    fn write_value(&self, buf: &mut [u8], v: &ExtensionValues) -> Option<usize> {
        match self {
            Extension::TransportSequenceNumber => {
                let sn = v.transport_cc?;
                buf[0..2].copy_from_slice(&sn.to_be_bytes());
                Some(2)
            }
            Extension::PictureId => {
                let id = v.picture_id?;
                buf[0..2].copy_from_slice(&id.to_be_bytes());
                Some(2)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn id_registration() {
        let mut map = ExtensionMap::empty();
        map.set(3, Extension::TransportSequenceNumber);
        map.set(9, Extension::PictureId);

        assert_eq!(map.id_of(Extension::TransportSequenceNumber), Some(3));
        assert_eq!(map.id_of(Extension::PictureId), Some(9));
        assert_eq!(map.lookup(3), Some(Extension::TransportSequenceNumber));
        assert_eq!(map.lookup(1), None);
    }

    #[test]
    fn write_parse_roundtrip() {
        let mut map = ExtensionMap::empty();
        map.set(3, Extension::TransportSequenceNumber);

        let values = ExtensionValues {
            transport_cc: Some(0xabcd),
            ..Default::default()
        };

        let mut buf = [0_u8; 32];
        let n = map.write_to(&mut buf, &values);
        assert_eq!(n, 3);

        let mut back = ExtensionValues::default();
        map.parse(&buf[..n], false, &mut back);
        assert_eq!(back.transport_cc, Some(0xabcd));
    }

    #[test]
    fn parse_skips_unknown_ids() {
        let map = ExtensionMap::empty();
        // id 5, len 2, value; then stop
        let buf = [0x51, 0xaa, 0xbb];
        let mut v = ExtensionValues::default();
        map.parse(&buf, false, &mut v);
        assert_eq!(v, ExtensionValues::default());
    }
}
