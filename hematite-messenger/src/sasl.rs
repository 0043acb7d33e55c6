//! Anonymous SASL negotiation
//!
//! The messenger only supports the ANONYMOUS mechanism: outbound
//! connections offer it, accepted connections advertise exactly
//! `{"ANONYMOUS"}` and answer with an OK outcome. Only the three frames
//! that exchange needs exist here; a challenge or response from a peer
//! insisting on a real mechanism is a negotiation failure.
//!
//! SASL frames ride the same length-delimited framing as AMQP frames,
//! with their own type byte. Decoding reads the body as a described
//! value and dispatches on the descriptor, the same way the message
//! codec picks its sections apart.

use bytes::{Buf, BufMut, BytesMut};
use fe2o3_amqp_types::sasl::{SaslCode, SaslInit, SaslMechanisms, SaslOutcome};
use serde::Serialize;
use serde_amqp::{descriptor::Descriptor, from_value, primitives::Symbol, ser::Serializer, Value};

pub(crate) const ANONYMOUS: &str = "ANONYMOUS";

const FRAME_TYPE_SASL: u8 = 0x01;

const CODE_MECHANISMS: u64 = 0x40;
const CODE_INIT: u64 = 0x41;
const CODE_OUTCOME: u64 = 0x44;

/// The SASL frames an anonymous-only endpoint exchanges
#[derive(Debug)]
pub(crate) enum SaslFrame {
    Mechanisms(SaslMechanisms),
    Init(SaslInit),
    Outcome(SaslOutcome),
}

/// Encode a SASL frame after the length field
pub(crate) fn encode_frame(frame: SaslFrame, dst: &mut BytesMut) -> Result<(), serde_amqp::Error> {
    dst.put_u8(2); // doff
    dst.put_u8(FRAME_TYPE_SASL);
    // Bytes 6 and 7 of a SASL frame header are ignored
    dst.put_u16(0);
    let mut serializer = Serializer::from(dst.writer());
    match frame {
        SaslFrame::Mechanisms(mechanisms) => mechanisms.serialize(&mut serializer),
        SaslFrame::Init(init) => init.serialize(&mut serializer),
        SaslFrame::Outcome(outcome) => outcome.serialize(&mut serializer),
    }
}

/// Decode one length-delimited SASL frame body
pub(crate) fn decode_frame(mut src: BytesMut) -> Result<SaslFrame, serde_amqp::Error> {
    if src.len() < 4 {
        return Err(malformed("truncated frame header"));
    }
    let _doff = src.get_u8();
    let ftype = src.get_u8();
    let _ignored = src.get_u16();
    if ftype != FRAME_TYPE_SASL {
        return Err(malformed("not a SASL frame"));
    }

    let value: Value = serde_amqp::from_reader((&mut src).reader())?;
    let Value::Described(described) = value else {
        return Err(malformed("expecting a described SASL frame body"));
    };
    let code = match &described.descriptor {
        Descriptor::Code(code) => Some(*code),
        Descriptor::Name(name) => match name.as_str() {
            "amqp:sasl-mechanisms:list" => Some(CODE_MECHANISMS),
            "amqp:sasl-init:list" => Some(CODE_INIT),
            "amqp:sasl-outcome:list" => Some(CODE_OUTCOME),
            _ => None,
        },
    };
    match code {
        Some(CODE_MECHANISMS) => Ok(SaslFrame::Mechanisms(from_value(Value::Described(
            described,
        ))?)),
        Some(CODE_INIT) => Ok(SaslFrame::Init(from_value(Value::Described(described))?)),
        Some(CODE_OUTCOME) => Ok(SaslFrame::Outcome(from_value(Value::Described(described))?)),
        _ => Err(malformed("unsupported SASL frame")),
    }
}

fn malformed(msg: &str) -> serde_amqp::Error {
    serde::de::Error::custom(msg)
}

/// SASL negotiation errors
#[derive(Debug, thiserror::Error)]
pub(crate) enum NegotiationError {
    #[error("Unexpected SASL frame")]
    UnexpectedFrame,

    #[error("ANONYMOUS mechanism is not offered by the peer")]
    MechanismNotSupported,

    #[error("SASL outcome code {0:?}")]
    Declined(SaslCode),
}

#[derive(Debug, PartialEq)]
enum ClientState {
    Mechanisms,
    Outcome,
    Done,
}

/// Client side negotiator: picks ANONYMOUS out of the server offer
#[derive(Debug)]
pub(crate) struct SaslClient {
    state: ClientState,
}

impl SaslClient {
    pub(crate) fn new() -> Self {
        Self {
            state: ClientState::Mechanisms,
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state == ClientState::Done
    }

    pub(crate) fn on_frame(
        &mut self,
        frame: SaslFrame,
    ) -> Result<Option<SaslFrame>, NegotiationError> {
        match (&self.state, frame) {
            (ClientState::Mechanisms, SaslFrame::Mechanisms(mechanisms)) => {
                if !mechanisms
                    .sasl_server_mechanisms
                    .0
                    .iter()
                    .any(|m| m.as_str() == ANONYMOUS)
                {
                    return Err(NegotiationError::MechanismNotSupported);
                }
                self.state = ClientState::Outcome;
                Ok(Some(SaslFrame::Init(SaslInit {
                    mechanism: Symbol::from(ANONYMOUS),
                    initial_response: None,
                    hostname: None,
                })))
            }
            (ClientState::Outcome, SaslFrame::Outcome(outcome)) => {
                if !matches!(outcome.code, SaslCode::Ok) {
                    return Err(NegotiationError::Declined(outcome.code));
                }
                self.state = ClientState::Done;
                Ok(None)
            }
            _ => Err(NegotiationError::UnexpectedFrame),
        }
    }
}

#[derive(Debug, PartialEq)]
enum ServerState {
    Init,
    Done,
}

/// Server side negotiator: offers ANONYMOUS and accepts any init for it
#[derive(Debug)]
pub(crate) struct SaslServer {
    state: ServerState,
}

impl SaslServer {
    pub(crate) fn new() -> Self {
        Self {
            state: ServerState::Init,
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state == ServerState::Done
    }

    /// The advertisement sent together with the server SASL header
    pub(crate) fn mechanisms() -> SaslFrame {
        // SaslMechanisms advertises ANONYMOUS by default
        SaslFrame::Mechanisms(SaslMechanisms::default())
    }

    pub(crate) fn on_frame(
        &mut self,
        frame: SaslFrame,
    ) -> Result<Option<SaslFrame>, NegotiationError> {
        match (&self.state, frame) {
            (ServerState::Init, SaslFrame::Init(init)) => {
                if init.mechanism.as_str() != ANONYMOUS {
                    return Err(NegotiationError::MechanismNotSupported);
                }
                self.state = ServerState::Done;
                Ok(Some(SaslFrame::Outcome(SaslOutcome {
                    code: SaslCode::Ok,
                    additional_data: None,
                })))
            }
            _ => Err(NegotiationError::UnexpectedFrame),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_amqp::primitives::Array;

    use super::*;

    #[test]
    fn anonymous_exchange_completes() {
        let mut client = SaslClient::new();
        let mut server = SaslServer::new();

        let init = client.on_frame(SaslServer::mechanisms()).unwrap().unwrap();
        let outcome = server.on_frame(init).unwrap().unwrap();
        assert!(server.is_done());

        assert!(client.on_frame(outcome).unwrap().is_none());
        assert!(client.is_done());
    }

    #[test]
    fn missing_anonymous_is_refused() {
        let mut client = SaslClient::new();
        let offer = SaslFrame::Mechanisms(SaslMechanisms {
            sasl_server_mechanisms: Array::from(vec![Symbol::from("PLAIN")]),
        });
        assert!(matches!(
            client.on_frame(offer),
            Err(NegotiationError::MechanismNotSupported)
        ));
    }

    #[test]
    fn frames_roundtrip_through_the_codec() {
        let mut dst = BytesMut::new();
        encode_frame(SaslServer::mechanisms(), &mut dst).unwrap();
        match decode_frame(dst).unwrap() {
            SaslFrame::Mechanisms(mechanisms) => {
                assert!(mechanisms
                    .sasl_server_mechanisms
                    .0
                    .iter()
                    .any(|m| m.as_str() == ANONYMOUS));
            }
            other => panic!("expected a mechanisms frame, got {:?}", other),
        }

        let mut dst = BytesMut::new();
        encode_frame(
            SaslFrame::Outcome(SaslOutcome {
                code: SaslCode::Ok,
                additional_data: None,
            }),
            &mut dst,
        )
        .unwrap();
        assert!(matches!(
            decode_frame(dst).unwrap(),
            SaslFrame::Outcome(SaslOutcome {
                code: SaslCode::Ok,
                ..
            })
        ));
    }
}
