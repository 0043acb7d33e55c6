//! Accepting side of the driver

use std::io;

use mio::net::{TcpListener, TcpStream};

/// A bound, non-blocking acceptor
#[derive(Debug)]
pub(crate) struct Listener {
    listener: TcpListener,
}

impl Listener {
    pub(crate) fn new(listener: TcpListener) -> Self {
        Self { listener }
    }

    pub(crate) fn socket_mut(&mut self) -> &mut TcpListener {
        &mut self.listener
    }

    /// Accept one pending connection, if any
    pub(crate) fn accept(&mut self) -> io::Result<Option<TcpStream>> {
        match self.listener.accept() {
            Ok((stream, _addr)) => Ok(Some(stream)),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }
}
