//! Messenger-level message and its codec
//!
//! A [`Message`] is the standard AMQP 1.0 section stack with a
//! dynamically typed body. Sections are encoded in canonical order
//! through `serde_amqp`; the body travels as a described value with the
//! standard section codes. Encoding targets a caller-supplied buffer and
//! reports overflow so the messenger can double its scratch buffer and
//! retry.

use std::io;

use fe2o3_amqp_types::messaging::{
    ApplicationProperties, DeliveryAnnotations, Footer, Header, MessageAnnotations, Properties,
};
use serde::Serialize;
use serde_amqp::{
    described::Described, descriptor::Descriptor, from_value, primitives::Binary, ser::Serializer,
    Value,
};

const CODE_HEADER: u64 = 0x70;
const CODE_DELIVERY_ANNOTATIONS: u64 = 0x71;
const CODE_MESSAGE_ANNOTATIONS: u64 = 0x72;
const CODE_PROPERTIES: u64 = 0x73;
const CODE_APPLICATION_PROPERTIES: u64 = 0x74;
const CODE_DATA: u64 = 0x75;
const CODE_AMQP_SEQUENCE: u64 = 0x76;
const CODE_AMQP_VALUE: u64 = 0x77;
const CODE_FOOTER: u64 = 0x78;

/// Body section of a [`Message`]
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Body {
    /// No body section at all
    #[default]
    Empty,

    /// A single data section of opaque binary
    Data(Binary),

    /// A single amqp-sequence section
    Sequence(Vec<Value>),

    /// A single amqp-value section
    Value(Value),
}

/// An application message
#[derive(Debug, Clone, Default)]
pub struct Message {
    /// Transport headers
    pub header: Option<Header>,

    /// Delivery-specific non-standard properties
    pub delivery_annotations: Option<DeliveryAnnotations>,

    /// Infrastructure-aimed properties propagated across delivery steps
    pub message_annotations: Option<MessageAnnotations>,

    /// Immutable properties of the bare message
    pub properties: Option<Properties>,

    /// Structured application data usable for filtering or routing
    pub application_properties: Option<ApplicationProperties>,

    /// The body
    pub body: Body,

    /// Footer
    pub footer: Option<Footer>,
}

impl Message {
    /// Creates an empty message
    pub fn new() -> Self {
        Self::default()
    }

    /// The node address this message is sent to
    pub fn address(&self) -> Option<&str> {
        self.properties.as_ref()?.to.as_deref()
    }

    /// Sets the node address this message is sent to
    pub fn set_address(&mut self, address: impl Into<String>) {
        self.properties.get_or_insert_with(Properties::default).to = Some(address.into());
    }

    /// The reply-to address
    pub fn reply_to(&self) -> Option<&str> {
        self.properties.as_ref()?.reply_to.as_deref()
    }

    /// Sets the reply-to address
    pub fn set_reply_to(&mut self, reply_to: impl Into<String>) {
        self.properties
            .get_or_insert_with(Properties::default)
            .reply_to = Some(reply_to.into());
    }

    /// Sets the body to a single amqp-value section
    pub fn set_body(&mut self, value: Value) {
        self.body = Body::Value(value);
    }

    /// Encode the message into `buf`, returning the encoded size.
    ///
    /// Returns [`EncodeError::Overflow`] when the buffer is too small;
    /// the caller is expected to grow it and retry.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, EncodeError> {
        let mut writer = SliceWriter { buf, pos: 0 };
        let mut serializer = Serializer::from(&mut writer);

        if let Some(header) = &self.header {
            header.serialize(&mut serializer)?;
        }
        if let Some(delivery_annotations) = &self.delivery_annotations {
            delivery_annotations.serialize(&mut serializer)?;
        }
        if let Some(message_annotations) = &self.message_annotations {
            message_annotations.serialize(&mut serializer)?;
        }
        if let Some(properties) = &self.properties {
            properties.serialize(&mut serializer)?;
        }
        if let Some(application_properties) = &self.application_properties {
            application_properties.serialize(&mut serializer)?;
        }
        match &self.body {
            Body::Empty => {}
            Body::Data(data) => {
                Described {
                    descriptor: Descriptor::Code(CODE_DATA),
                    value: data,
                }
                .serialize(&mut serializer)?;
            }
            Body::Sequence(sequence) => {
                Described {
                    descriptor: Descriptor::Code(CODE_AMQP_SEQUENCE),
                    value: sequence,
                }
                .serialize(&mut serializer)?;
            }
            Body::Value(value) => {
                Described {
                    descriptor: Descriptor::Code(CODE_AMQP_VALUE),
                    value,
                }
                .serialize(&mut serializer)?;
            }
        }
        if let Some(footer) = &self.footer {
            footer.serialize(&mut serializer)?;
        }

        Ok(writer.pos)
    }

    /// Decode a message from its encoded sections
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_amqp::Error> {
        let mut message = Message::default();
        let len = bytes.len() as u64;
        let mut cursor = io::Cursor::new(bytes);
        while cursor.position() < len {
            let value: Value = serde_amqp::from_reader(&mut cursor)?;
            let Value::Described(described) = value else {
                return Err(malformed("expecting a described section"));
            };
            match section_code(&described.descriptor) {
                Some(CODE_HEADER) => {
                    message.header = Some(from_value(Value::Described(described))?);
                }
                Some(CODE_DELIVERY_ANNOTATIONS) => {
                    message.delivery_annotations =
                        Some(from_value(Value::Described(described))?);
                }
                Some(CODE_MESSAGE_ANNOTATIONS) => {
                    message.message_annotations = Some(from_value(Value::Described(described))?);
                }
                Some(CODE_PROPERTIES) => {
                    message.properties = Some(from_value(Value::Described(described))?);
                }
                Some(CODE_APPLICATION_PROPERTIES) => {
                    message.application_properties =
                        Some(from_value(Value::Described(described))?);
                }
                Some(CODE_DATA) => match described.value {
                    Value::Binary(binary) => message.body = Body::Data(binary),
                    _ => return Err(malformed("data section must be binary")),
                },
                Some(CODE_AMQP_SEQUENCE) => match described.value {
                    Value::List(list) => message.body = Body::Sequence(list),
                    _ => return Err(malformed("amqp-sequence section must be a list")),
                },
                Some(CODE_AMQP_VALUE) => message.body = Body::Value(described.value),
                Some(CODE_FOOTER) => {
                    message.footer = Some(from_value(Value::Described(described))?);
                }
                // Unknown sections are skipped
                _ => {}
            }
        }
        Ok(message)
    }
}

fn section_code(descriptor: &Descriptor) -> Option<u64> {
    match descriptor {
        Descriptor::Code(code) => Some(*code),
        Descriptor::Name(name) => match name.as_str() {
            "amqp:header:list" => Some(CODE_HEADER),
            "amqp:delivery-annotations:map" => Some(CODE_DELIVERY_ANNOTATIONS),
            "amqp:message-annotations:map" => Some(CODE_MESSAGE_ANNOTATIONS),
            "amqp:properties:list" => Some(CODE_PROPERTIES),
            "amqp:application-properties:map" => Some(CODE_APPLICATION_PROPERTIES),
            "amqp:data:binary" => Some(CODE_DATA),
            "amqp:amqp-sequence:list" => Some(CODE_AMQP_SEQUENCE),
            "amqp:amqp-value:*" => Some(CODE_AMQP_VALUE),
            "amqp:footer:map" => Some(CODE_FOOTER),
            _ => None,
        },
    }
}

fn malformed(msg: &str) -> serde_amqp::Error {
    serde::de::Error::custom(msg)
}

/// Message encoding errors
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// The target buffer is too small for the encoded message
    #[error("Encoded message exceeds the buffer")]
    Overflow,

    /// The message could not be serialized at all
    #[error("Codec Error: {0}")]
    Codec(serde_amqp::Error),
}

impl From<serde_amqp::Error> for EncodeError {
    fn from(err: serde_amqp::Error) -> Self {
        match &err {
            serde_amqp::Error::Io(io_err) if io_err.kind() == io::ErrorKind::WriteZero => {
                EncodeError::Overflow
            }
            _ => EncodeError::Codec(err),
        }
    }
}

/// Writes into a fixed slice, failing with `WriteZero` once full
struct SliceWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl io::Write for SliceWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let remaining = self.buf.len() - self.pos;
        if remaining == 0 && !data.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "message buffer is full",
            ));
        }
        let n = remaining.min(data.len());
        self.buf[self.pos..self.pos + n].copy_from_slice(&data[..n]);
        self.pos += n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_and_body_roundtrip() {
        let mut message = Message::new();
        message.set_address("amqp://127.0.0.1/q1");
        message.set_reply_to("amqp://replies");
        message.set_body(Value::String(String::from("hello AMQP")));

        let mut buf = vec![0u8; 512];
        let size = message.encode(&mut buf).unwrap();
        assert!(size > 0);

        let decoded = Message::decode(&buf[..size]).unwrap();
        assert_eq!(decoded.address(), Some("amqp://127.0.0.1/q1"));
        assert_eq!(decoded.reply_to(), Some("amqp://replies"));
        assert_eq!(
            decoded.body,
            Body::Value(Value::String(String::from("hello AMQP")))
        );
    }

    #[test]
    fn empty_body_roundtrip() {
        let mut message = Message::new();
        message.set_address("amqp://127.0.0.1/q1");

        let mut buf = vec![0u8; 256];
        let size = message.encode(&mut buf).unwrap();
        let decoded = Message::decode(&buf[..size]).unwrap();
        assert_eq!(decoded.body, Body::Empty);
    }

    #[test]
    fn overflow_reports_and_retry_fits() {
        let mut message = Message::new();
        message.set_body(Value::Binary(Binary::from(vec![0x5au8; 4096])));

        let mut buf = vec![0u8; 16];
        assert!(matches!(
            message.encode(&mut buf),
            Err(EncodeError::Overflow)
        ));

        let mut buf = vec![0u8; 8192];
        let size = message.encode(&mut buf).unwrap();
        let decoded = Message::decode(&buf[..size]).unwrap();
        assert_eq!(
            decoded.body,
            Body::Value(Value::Binary(Binary::from(vec![0x5au8; 4096])))
        );
    }
}
