//! One transport endpoint: a socket, its framing state and its connection

use std::io::{self, Read, Write};

use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};
use tracing::trace;

use crate::engine::{Connection, EndpointState, EngineError};
use crate::frames::{self, Frame};
use crate::sasl::{self, NegotiationError, SaslClient, SaslFrame, SaslServer};
use crate::transport::{length_delimited_codec, ProtocolHeader};

/// Faults raised while processing a connector.
///
/// Any of these degrades the single connector: the caller logs the error,
/// the transport is marked failed and the processor reaps it.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ProcessError {
    #[error("IO Error {0:?}")]
    Io(#[from] io::Error),

    #[error("Codec Error: {0}")]
    Codec(#[from] serde_amqp::Error),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Unexpected protocol header {0:?}")]
    UnexpectedHeader([u8; ProtocolHeader::SIZE]),
}

/// Transport negotiation progress
#[derive(Debug, Clone, Copy, PartialEq)]
enum Negotiation {
    /// Waiting for the peer's SASL protocol header
    SaslHeader,

    /// SASL frames are being exchanged
    Sasl,

    /// Waiting for the peer's AMQP protocol header
    AmqpHeader,

    /// AMQP phase; staged frames flow
    Open,
}

#[derive(Debug)]
enum Negotiator {
    Client(SaslClient),
    Server(SaslServer),
}

/// A non-blocking socket bound to an engine [`Connection`].
///
/// `process` never blocks: it reads whatever the socket has, advances the
/// handshake and the state machines, and writes whatever fits.
#[derive(Debug)]
pub(crate) struct Connector {
    stream: TcpStream,
    connection: Connection,

    state: Negotiation,
    negotiator: Negotiator,

    read_buf: BytesMut,
    write_buf: BytesMut,
    framing: LengthDelimitedCodec,

    /// Peer is gone at the socket level
    eof: bool,

    /// A processing fault occurred; the connector only awaits reaping
    failed: bool,
}

impl Connector {
    /// Connector for an outbound connection; the SASL header goes out
    /// immediately
    pub(crate) fn client(
        stream: TcpStream,
        container: &str,
        hostname: &str,
        service: String,
    ) -> Self {
        let mut connection = Connection::new(container, Some(hostname.to_owned()));
        connection.context = Some(service);
        let mut connector = Self::new(stream, connection, Negotiator::Client(SaslClient::new()));
        connector
            .write_buf
            .extend_from_slice(&ProtocolHeader::Sasl.to_bytes());
        connector
    }

    /// Connector for an accepted connection; it answers the client's
    /// headers as they arrive
    pub(crate) fn server(stream: TcpStream, container: &str) -> Self {
        let connection = Connection::new(container, None);
        Self::new(stream, connection, Negotiator::Server(SaslServer::new()))
    }

    fn new(stream: TcpStream, connection: Connection, negotiator: Negotiator) -> Self {
        Self {
            stream,
            connection,
            state: Negotiation::SaslHeader,
            negotiator,
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
            framing: length_delimited_codec(),
            eof: false,
            failed: false,
        }
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.connection
    }

    pub(crate) fn connection_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }

    pub(crate) fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Mark the connector failed after a processing fault
    pub(crate) fn fail(&mut self) {
        self.failed = true;
        self.connection.transport_failed();
    }

    /// Fully closed: both endpoint halves closed and everything flushed,
    /// or the transport failed underneath
    pub(crate) fn is_closed(&self) -> bool {
        if self.failed {
            return true;
        }
        self.connection.local_state == EndpointState::Closed
            && self.connection.remote_state == EndpointState::Closed
            && !self.connection.has_staged_frames()
            && self.write_buf.is_empty()
    }

    /// Whether anything staged or buffered still awaits the wire
    pub(crate) fn has_queued_frames(&self) -> bool {
        self.connection.has_staged_frames() || !self.write_buf.is_empty()
    }

    /// Advance I/O and the state machines as far as they go without
    /// blocking
    pub(crate) fn process(&mut self) -> Result<(), ProcessError> {
        if self.failed {
            return Ok(());
        }
        let result = self.try_process();
        if result.is_err() {
            self.fail();
        }
        result
    }

    fn try_process(&mut self) -> Result<(), ProcessError> {
        self.fill_read_buf()?;
        self.dispatch()?;
        self.connection.pump();
        if self.state == Negotiation::Open {
            while let Some(frame) = self.connection.take_frame() {
                self.queue_amqp_frame(frame)?;
            }
        }
        self.flush()?;
        if self.eof {
            self.connection.transport_failed();
        }
        Ok(())
    }

    fn fill_read_buf(&mut self) -> io::Result<()> {
        let mut chunk = [0u8; 16 * 1024];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(());
                }
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                // Connect still in progress
                Err(err) if err.kind() == io::ErrorKind::NotConnected => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    fn dispatch(&mut self) -> Result<(), ProcessError> {
        loop {
            match self.state {
                Negotiation::SaslHeader => {
                    let Some(header) = self.take_header()? else {
                        return Ok(());
                    };
                    if header != ProtocolHeader::Sasl {
                        return Err(ProcessError::UnexpectedHeader(header.to_bytes()));
                    }
                    if let Negotiator::Server(_) = self.negotiator {
                        self.write_buf
                            .extend_from_slice(&ProtocolHeader::Sasl.to_bytes());
                        self.queue_sasl_frame(SaslServer::mechanisms())?;
                    }
                    self.state = Negotiation::Sasl;
                }
                Negotiation::Sasl => {
                    let Some(body) = self.framing.decode(&mut self.read_buf)? else {
                        return Ok(());
                    };
                    let frame = sasl::decode_frame(body)?;
                    let reply = match &mut self.negotiator {
                        Negotiator::Client(client) => client.on_frame(frame)?,
                        Negotiator::Server(server) => server.on_frame(frame)?,
                    };
                    if let Some(reply) = reply {
                        self.queue_sasl_frame(reply)?;
                    }
                    let done = match &self.negotiator {
                        Negotiator::Client(client) => client.is_done(),
                        Negotiator::Server(server) => server.is_done(),
                    };
                    if done {
                        if let Negotiator::Client(_) = self.negotiator {
                            self.write_buf
                                .extend_from_slice(&ProtocolHeader::Amqp.to_bytes());
                        }
                        self.state = Negotiation::AmqpHeader;
                    }
                }
                Negotiation::AmqpHeader => {
                    let Some(header) = self.take_header()? else {
                        return Ok(());
                    };
                    if header != ProtocolHeader::Amqp {
                        return Err(ProcessError::UnexpectedHeader(header.to_bytes()));
                    }
                    if let Negotiator::Server(_) = self.negotiator {
                        self.write_buf
                            .extend_from_slice(&ProtocolHeader::Amqp.to_bytes());
                    }
                    self.state = Negotiation::Open;
                }
                Negotiation::Open => {
                    let Some(body) = self.framing.decode(&mut self.read_buf)? else {
                        return Ok(());
                    };
                    let frame = frames::decode_frame(body)?;
                    self.connection.on_frame(frame)?;
                }
            }
        }
    }

    fn take_header(&mut self) -> Result<Option<ProtocolHeader>, ProcessError> {
        if self.read_buf.len() < ProtocolHeader::SIZE {
            return Ok(None);
        }
        let mut bytes = [0u8; ProtocolHeader::SIZE];
        bytes.copy_from_slice(&self.read_buf[..ProtocolHeader::SIZE]);
        self.read_buf.advance(ProtocolHeader::SIZE);
        let header =
            ProtocolHeader::parse(bytes).ok_or(ProcessError::UnexpectedHeader(bytes))?;
        Ok(Some(header))
    }

    fn queue_sasl_frame(&mut self, frame: SaslFrame) -> Result<(), ProcessError> {
        let mut body = BytesMut::new();
        sasl::encode_frame(frame, &mut body)?;
        self.framing
            .encode(body.freeze(), &mut self.write_buf)
            .map_err(ProcessError::Io)
    }

    fn queue_amqp_frame(&mut self, frame: Frame) -> Result<(), ProcessError> {
        trace!(channel = frame.channel, frame = ?frame.performative, "SEND");
        let mut body = BytesMut::new();
        frames::encode_frame(frame, &mut body)?;
        self.framing
            .encode(body.freeze(), &mut self.write_buf)
            .map_err(ProcessError::Io)
    }

    fn flush(&mut self) -> io::Result<()> {
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(());
                }
                Ok(n) => {
                    self.write_buf.advance(n);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::NotConnected => return Ok(()),
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}
