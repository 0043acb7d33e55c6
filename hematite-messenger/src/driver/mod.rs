//! Non-blocking socket pump
//!
//! The driver owns every socket: outbound connectors, accepted
//! connectors and listeners. Its only suspension point is
//! [`Driver::wait`], a bounded readiness poll; everything else returns
//! immediately. Each processor pass drains every live endpoint exactly
//! once. Processing a quiescent connector is a no-op, so this is
//! equivalent to readiness-driven draining without missed wakeups.

use std::collections::VecDeque;
use std::io;
use std::net::ToSocketAddrs;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;

mod connector;
mod listener;

pub(crate) use connector::Connector;
use listener::Listener;

/// Token space offset separating listeners from connectors
const LISTENER_TOKEN_BASE: usize = 1 << 20;

#[derive(Debug)]
pub(crate) struct Driver {
    poll: Poll,
    events: Events,
    connectors: Slab<Connector>,
    listeners: Slab<Listener>,
    pass_connectors: VecDeque<usize>,
    pass_listeners: VecDeque<usize>,
}

impl Driver {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(256),
            connectors: Slab::new(),
            listeners: Slab::new(),
            pass_connectors: VecDeque::new(),
            pass_listeners: VecDeque::new(),
        })
    }

    /// Block until socket readiness or the timeout elapses; `None` waits
    /// indefinitely
    pub(crate) fn wait(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Open an outbound connector to (host, port)
    pub(crate) fn connect(
        &mut self,
        host: &str,
        port: u16,
        container: &str,
    ) -> io::Result<usize> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no address"))?;
        let mut stream = TcpStream::connect(addr)?;
        let entry = self.connectors.vacant_entry();
        let key = entry.key();
        self.poll.registry().register(
            &mut stream,
            Token(key),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        let service = format!("{}:{}", host, port);
        entry.insert(Connector::client(stream, container, host, service));
        Ok(key)
    }

    /// Bind a listener on (host, port)
    pub(crate) fn listen(&mut self, host: &str, port: u16) -> io::Result<usize> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no address"))?;
        let mut listener = TcpListener::bind(addr)?;
        let entry = self.listeners.vacant_entry();
        let key = entry.key();
        self.poll.registry().register(
            &mut listener,
            Token(LISTENER_TOKEN_BASE + key),
            Interest::READABLE,
        )?;
        entry.insert(Listener::new(listener));
        Ok(key)
    }

    /// Accept one pending connection on a listener into a server-mode
    /// connector
    pub(crate) fn accept(&mut self, listener: usize, container: &str) -> io::Result<Option<usize>> {
        let Some(listener) = self.listeners.get_mut(listener) else {
            return Ok(None);
        };
        let Some(mut stream) = listener.accept()? else {
            return Ok(None);
        };
        let entry = self.connectors.vacant_entry();
        let key = entry.key();
        self.poll.registry().register(
            &mut stream,
            Token(key),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        entry.insert(Connector::server(stream, container));
        Ok(Some(key))
    }

    /// Begin a drain pass over the current endpoints
    pub(crate) fn start_pass(&mut self) {
        self.pass_listeners = self.listeners.iter().map(|(key, _)| key).collect();
        self.pass_connectors = self.connectors.iter().map(|(key, _)| key).collect();
    }

    /// Next listener of the current pass
    pub(crate) fn next_listener(&mut self) -> Option<usize> {
        while let Some(key) = self.pass_listeners.pop_front() {
            if self.listeners.contains(key) {
                return Some(key);
            }
        }
        None
    }

    /// Next connector of the current pass
    pub(crate) fn next_connector(&mut self) -> Option<usize> {
        while let Some(key) = self.pass_connectors.pop_front() {
            if self.connectors.contains(key) {
                return Some(key);
            }
        }
        None
    }

    pub(crate) fn connector(&self, id: usize) -> Option<&Connector> {
        self.connectors.get(id)
    }

    pub(crate) fn connector_mut(&mut self, id: usize) -> Option<&mut Connector> {
        self.connectors.get_mut(id)
    }

    pub(crate) fn connector_ids(&self) -> Vec<usize> {
        self.connectors.iter().map(|(key, _)| key).collect()
    }

    pub(crate) fn connector_count(&self) -> usize {
        self.connectors.len()
    }

    /// Deregister and drop a connector
    pub(crate) fn remove_connector(&mut self, id: usize) {
        if !self.connectors.contains(id) {
            return;
        }
        let mut connector = self.connectors.remove(id);
        let _ = self.poll.registry().deregister(connector.stream_mut());
    }

    /// Deregister and drop every listener
    pub(crate) fn close_listeners(&mut self) -> io::Result<()> {
        let keys: Vec<usize> = self.listeners.iter().map(|(key, _)| key).collect();
        for key in keys {
            let mut listener = self.listeners.remove(key);
            self.poll.registry().deregister(listener.socket_mut())?;
        }
        Ok(())
    }
}
