//! Transport-level framing and header exchange
//!
//! Before any frame flows, peers exchange 8-byte protocol headers: first
//! for the SASL layer, then again for AMQP proper once authentication
//! finished. This endpoint speaks exactly AMQP 1.0.0 and treats anything
//! else, including a TLS header, as a negotiation failure. Below the
//! frame codecs sits a [`LengthDelimitedCodec`] handling the 4-byte
//! frame size, which counts itself.

use fe2o3_amqp_types::definitions::{MAJOR, MINOR, REVISION};
use tokio_util::codec::LengthDelimitedCodec;

/// Maximum frame size advertised in Open and enforced by the length codec
pub(crate) const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// The protocol layers whose 8-byte headers this endpoint exchanges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProtocolHeader {
    Amqp,
    Sasl,
}

impl ProtocolHeader {
    pub(crate) const SIZE: usize = 8;

    const AMQP_ID: u8 = 0x00;
    const SASL_ID: u8 = 0x03;

    pub(crate) fn to_bytes(self) -> [u8; Self::SIZE] {
        let id = match self {
            ProtocolHeader::Amqp => Self::AMQP_ID,
            ProtocolHeader::Sasl => Self::SASL_ID,
        };
        [b'A', b'M', b'Q', b'P', id, MAJOR, MINOR, REVISION]
    }

    /// Recognize a header; anything but plain SASL or AMQP 1.0.0 is None
    pub(crate) fn parse(bytes: [u8; Self::SIZE]) -> Option<Self> {
        match bytes {
            [b'A', b'M', b'Q', b'P', Self::AMQP_ID, MAJOR, MINOR, REVISION] => {
                Some(ProtocolHeader::Amqp)
            }
            [b'A', b'M', b'Q', b'P', Self::SASL_ID, MAJOR, MINOR, REVISION] => {
                Some(ProtocolHeader::Sasl)
            }
            _ => None,
        }
    }
}

/// Creates a LengthDelimitedCodec that can frame AMQP and SASL traffic
pub(crate) fn length_delimited_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .big_endian()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_SIZE)
        // The AMQP size field counts itself
        .length_adjustment(-4)
        .new_codec()
}

#[cfg(test)]
mod tests {
    use super::ProtocolHeader;

    #[test]
    fn headers_roundtrip() {
        assert_eq!(&ProtocolHeader::Sasl.to_bytes(), b"AMQP\x03\x01\x00\x00");
        assert_eq!(&ProtocolHeader::Amqp.to_bytes(), b"AMQP\x00\x01\x00\x00");
        for header in [ProtocolHeader::Amqp, ProtocolHeader::Sasl] {
            assert_eq!(ProtocolHeader::parse(header.to_bytes()), Some(header));
        }
    }

    #[test]
    fn foreign_headers_are_rejected() {
        assert_eq!(ProtocolHeader::parse(*b"HTTP/1.1"), None);
        // TLS layer is out of scope
        assert_eq!(ProtocolHeader::parse(*b"AMQP\x02\x01\x00\x00"), None);
        // Wrong protocol version
        assert_eq!(ProtocolHeader::parse(*b"AMQP\x00\x02\x00\x00"), None);
    }
}
