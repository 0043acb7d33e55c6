//! AMQP frame codec
//!
//! The 4-byte frame size lives one layer below, in the
//! [`LengthDelimitedCodec`](tokio_util::codec::LengthDelimitedCodec) the
//! transport sets up; this module sees a frame from its `doff` byte on.
//! A frame is kept as the performative the type crate already defines
//! plus the trailing payload bytes a transfer carries; there is no
//! intermediate body enum to map in and out of. An empty body (the
//! heartbeat peers send to reset an idle timeout) decodes to a frame
//! with no performative.

use bytes::{Buf, BufMut, BytesMut};
use fe2o3_amqp_types::performatives::Performative;
use serde::{Deserialize, Serialize};
use serde_amqp::{de::Deserializer, read::IoReader, ser::Serializer};

use crate::Payload;

const FRAME_TYPE_AMQP: u8 = 0x00;

/// A decoded or staged AMQP frame
#[derive(Debug)]
pub(crate) struct Frame {
    /// Session multiplexing channel
    pub(crate) channel: u16,

    /// `None` only for the empty heartbeat frame
    pub(crate) performative: Option<Performative>,

    /// Trailing opaque bytes; non-empty only on transfers
    pub(crate) payload: Payload,
}

impl Frame {
    /// Stages a payload-less performative
    pub(crate) fn performative(channel: u16, performative: Performative) -> Self {
        Self {
            channel,
            performative: Some(performative),
            payload: Payload::new(),
        }
    }

    /// Stages a transfer with its message bytes
    pub(crate) fn transfer(
        channel: u16,
        transfer: fe2o3_amqp_types::performatives::Transfer,
        payload: Payload,
    ) -> Self {
        Self {
            channel,
            performative: Some(Performative::Transfer(transfer)),
            payload,
        }
    }
}

/// Encode a frame after the length field: doff, type, channel,
/// performative, payload
pub(crate) fn encode_frame(frame: Frame, dst: &mut BytesMut) -> Result<(), serde_amqp::Error> {
    // No extended header is ever written
    dst.put_u8(2);
    dst.put_u8(FRAME_TYPE_AMQP);
    dst.put_u16(frame.channel);
    if let Some(performative) = &frame.performative {
        let mut serializer = Serializer::from(dst.writer());
        performative.serialize(&mut serializer)?;
    }
    dst.put(frame.payload);
    Ok(())
}

/// Decode one length-delimited frame body
pub(crate) fn decode_frame(mut src: BytesMut) -> Result<Frame, serde_amqp::Error> {
    if src.len() < 4 {
        return Err(malformed("truncated frame header"));
    }
    let doff = src.get_u8();
    let ftype = src.get_u8();
    let channel = src.get_u16();

    if ftype != FRAME_TYPE_AMQP {
        return Err(malformed("not an AMQP frame"));
    }
    // Skip an extended header if the peer sent one
    let extended = (doff as usize)
        .checked_sub(2)
        .ok_or_else(|| malformed("invalid data offset"))?
        * 4;
    if src.len() < extended {
        return Err(malformed("truncated extended header"));
    }
    src.advance(extended);

    if src.is_empty() {
        return Ok(Frame {
            channel,
            performative: None,
            payload: Payload::new(),
        });
    }

    let reader = IoReader::new((&mut src).reader());
    let mut deserializer = Deserializer::new(reader);
    let performative = Performative::deserialize(&mut deserializer)?;
    let payload = src.split().freeze();

    Ok(Frame {
        channel,
        performative: Some(performative),
        payload,
    })
}

fn malformed(msg: &str) -> serde_amqp::Error {
    serde::de::Error::custom(msg)
}

#[cfg(test)]
mod tests {
    use fe2o3_amqp_types::definitions::Handle;
    use fe2o3_amqp_types::performatives::{ChannelMax, MaxFrameSize, Open, Transfer};
    use serde_amqp::primitives::Binary;

    use super::*;

    #[test]
    fn open_roundtrip() {
        let open = Open {
            container_id: "messenger-test".into(),
            hostname: Some("127.0.0.1".into()),
            max_frame_size: MaxFrameSize(512),
            channel_max: ChannelMax(9),
            idle_time_out: None,
            outgoing_locales: None,
            incoming_locales: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        };

        let mut dst = BytesMut::new();
        encode_frame(Frame::performative(0, Performative::Open(open)), &mut dst).unwrap();

        let frame = decode_frame(dst).unwrap();
        assert_eq!(frame.channel, 0);
        match frame.performative {
            Some(Performative::Open(open)) => {
                assert_eq!(open.container_id, "messenger-test");
                assert_eq!(open.channel_max.0, 9);
            }
            other => panic!("expected an Open frame, got {:?}", other),
        }
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn transfer_keeps_trailing_payload() {
        let transfer = Transfer {
            handle: Handle(0),
            delivery_id: Some(0),
            delivery_tag: Some(Binary::from(b"0".to_vec())),
            message_format: Some(0),
            settled: Some(false),
            more: false,
            rcv_settle_mode: None,
            state: None,
            resume: false,
            aborted: false,
            batchable: false,
        };
        let payload = Payload::from(&b"encoded message"[..]);

        let mut dst = BytesMut::new();
        encode_frame(Frame::transfer(1, transfer, payload), &mut dst).unwrap();

        let frame = decode_frame(dst).unwrap();
        assert_eq!(frame.channel, 1);
        assert!(matches!(
            frame.performative,
            Some(Performative::Transfer(_))
        ));
        assert_eq!(&frame.payload[..], b"encoded message");
    }

    #[test]
    fn empty_body_is_a_heartbeat() {
        let src = BytesMut::from(&[0x02, 0x00, 0x00, 0x00][..]);
        let frame = decode_frame(src).unwrap();
        assert!(frame.performative.is_none());
    }
}
