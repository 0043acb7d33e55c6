//! The messenger endpoint
//!
//! One [`Messenger`] multiplexes many AMQP conversations: it keeps a
//! registry of connections keyed by peer service, matches or creates
//! links by node path, distributes receive credit across active
//! receivers, and tracks delivery outcomes through two bounded-window
//! queues. All progress is made cooperatively from the calling thread;
//! blocking operations drive the event processor until a predicate holds
//! or the configured timeout expires.

use std::time::{Duration, Instant};

use fe2o3_amqp_types::messaging::{
    Accepted, DeliveryState, Modified, Rejected, Released, Source, Target,
};
use serde_amqp::primitives::Binary;
use tracing::{error, warn};

use crate::driver::Driver;
use crate::engine::{Connection, DeliveryId, EndpointState, LinkId, StateSet};
use crate::error::Error;
use crate::message::{EncodeError, Message};

mod address;
mod builder;
mod store;

use address::Address;
pub use builder::Builder;
use store::{Direction, TrackerStore};
pub use store::{Status, Tracker};

/// Default operation timeout: wait forever
pub(crate) const DEFAULT_TIMEOUT: i64 = -1;

/// Receive credit granted per receiver and pass in unlimited mode
const CREDIT_BATCH: i32 = 10;

/// Initial scratch buffer size; the buffer grows by doubling and never
/// shrinks
const INITIAL_BUFFER_SIZE: usize = 1024;

/// A high-level messaging endpoint multiplexing AMQP 1.0 conversations.
///
/// The messenger is single-owner: one thread drives all of its
/// operations, and all I/O happens inside them.
#[derive(Debug)]
pub struct Messenger {
    name: String,
    timeout: i64,

    driver: Option<Driver>,

    /// Scratch buffer shared by message encode and decode
    buffer: Vec<u8>,

    /// Tag counter; tags are its decimal ASCII digits
    next_tag: u64,

    /// Receive credit not yet issued to any receiver
    credit: i32,

    /// Receive credit issued and not yet consumed or reclaimed
    distributed: i32,

    unlimited_credit: bool,

    incoming: TrackerStore,
    outgoing: TrackerStore,
}

impl Messenger {
    /// Creates a messenger with the given container name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout: DEFAULT_TIMEOUT,
            driver: None,
            buffer: vec![0; INITIAL_BUFFER_SIZE],
            next_tag: 0,
            credit: 0,
            distributed: 0,
            unlimited_credit: false,
            incoming: TrackerStore::new(Direction::Incoming),
            outgoing: TrackerStore::new(Direction::Outgoing),
        }
    }

    /// Creates a builder
    pub fn builder() -> Builder {
        Builder::new()
    }

    /* ----------------------------- settings ------------------------------ */

    /// Container name of this endpoint
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Timeout in milliseconds; negative means wait forever
    pub fn timeout(&self) -> i64 {
        self.timeout
    }

    /// Sets the timeout bounding every blocking operation
    pub fn set_timeout(&mut self, timeout: i64) {
        self.timeout = timeout;
    }

    /// Incoming tracker window
    pub fn incoming_window(&self) -> usize {
        self.incoming.window()
    }

    /// Sets the incoming tracker window
    pub fn set_incoming_window(&mut self, window: usize) {
        self.incoming.set_window(window);
    }

    /// Outgoing tracker window
    pub fn outgoing_window(&self) -> usize {
        self.outgoing.window()
    }

    /// Sets the outgoing tracker window
    pub fn set_outgoing_window(&mut self, window: usize) {
        self.outgoing.set_window(window);
    }

    /* -------------------------- start and stop ---------------------------- */

    /// Start the messenger, creating the driver
    pub fn start(&mut self) -> Result<(), Error> {
        if self.driver.is_none() {
            self.driver = Some(Driver::new()?);
        }
        Ok(())
    }

    /// Stop the messenger: close every connection, flush the closes,
    /// drop the listeners and wait until all connectors are gone.
    ///
    /// A timeout while waiting is logged, not raised.
    pub fn stop(&mut self) -> Result<(), Error> {
        let Some(driver) = self.driver.as_mut() else {
            return Ok(());
        };
        for id in driver.connector_ids() {
            let connector = driver.connector_mut(id).expect("connector id just listed");
            connector.connection_mut().close();
            if let Err(err) = connector.process() {
                warn!(connector = id, error = %err, "I/O error while flushing close");
            }
        }
        if let Err(err) = driver.close_listeners() {
            warn!(error = %err, "I/O error while closing listeners");
        }
        match self.wait_until(|messenger| messenger.all_closed()) {
            Ok(()) => {}
            Err(Error::Timeout) => warn!("timed out waiting for connections to close"),
            Err(err) => warn!(error = %err, "error while stopping"),
        }
        self.driver = None;
        Ok(())
    }

    /* -------------------------- public operations ------------------------- */

    /// Stage an outbound message on the sender link for its address.
    ///
    /// The message address must carry a host. An empty reply-to defaults
    /// to `amqp://<name>`; a reply-to of `~/path` expands to
    /// `amqp://<name>/path`. The returned tracker addresses the delivery
    /// in the outgoing queue.
    pub fn put(&mut self, mut message: Message) -> Result<Tracker, Error> {
        let address = match message.address() {
            Some(address) => Address::parse(address)?,
            None => return Err(Error::InvalidAddress(String::new())),
        };
        let (connector, link) = self.resolve_link(&address, LinkMatch::sender(&address))?;

        match message.reply_to() {
            None => message.set_reply_to(format!("amqp://{}", self.name)),
            Some("") => message.set_reply_to(format!("amqp://{}", self.name)),
            Some(reply_to) => {
                if let Some(rest) = reply_to.strip_prefix("~/") {
                    let rest = rest.to_owned();
                    message.set_reply_to(format!("amqp://{}/{}", self.name, rest));
                }
            }
        }

        let tag = Binary::from(self.next_tag.to_string().into_bytes());
        self.next_tag += 1;

        let size = loop {
            match message.encode(&mut self.buffer) {
                Ok(size) => break size,
                Err(EncodeError::Overflow) => {
                    let grown = self.buffer.len().max(INITIAL_BUFFER_SIZE) * 2;
                    self.buffer.resize(grown, 0);
                }
                Err(EncodeError::Codec(err)) => return Err(Error::Codec(err)),
            }
        };

        let driver = self.driver.as_mut().ok_or(Error::Unstarted)?;
        let connection = driver
            .connector_mut(connector)
            .expect("connector just resolved")
            .connection_mut();
        let delivery = connection.create_delivery(link, tag, &self.buffer[..size]);
        let serial = connection
            .delivery(delivery)
            .expect("delivery just created")
            .serial;
        let tracker = self.outgoing.add(connector, delivery, serial);
        connection
            .delivery_mut(delivery)
            .expect("delivery just created")
            .context = Some(tracker.sequence);
        connection.pump();
        Ok(tracker)
    }

    /// Block until every outgoing delivery is settled or its connection
    /// is gone
    pub fn send(&mut self) -> Result<(), Error> {
        self.wait_until(|messenger| messenger.sent_settled())
    }

    /// Adjust the receive credit pool and block until a message is
    /// available.
    ///
    /// `n` adds to the pool; `-1` switches to unlimited credit, where
    /// every active receiver is topped up to a fixed batch each pass.
    pub fn recv(&mut self, n: i32) -> Result<(), Error> {
        if self.driver.is_none() {
            return Err(Error::Unstarted);
        }
        if n < 0 {
            self.unlimited_credit = true;
        } else {
            self.credit += n;
            self.unlimited_credit = false;
        }
        self.distribute();
        self.wait_until(|messenger| messenger.message_available())
    }

    /// Take the next readable incoming message, if any
    pub fn get(&mut self) -> Result<Option<Message>, Error> {
        let Some(driver) = self.driver.as_mut() else {
            return Err(Error::Unstarted);
        };
        for id in driver.connector_ids() {
            let connection = driver
                .connector_mut(id)
                .expect("connector id just listed")
                .connection_mut();
            for delivery_id in connection.work() {
                let Some(delivery) = connection.delivery(delivery_id) else {
                    continue;
                };
                if !delivery.is_readable() {
                    continue;
                }
                if !connection
                    .link(delivery.link)
                    .map_or(false, |link| link.is_receiver())
                {
                    continue;
                }

                let len = delivery.payload.len();
                while self.buffer.len() < len {
                    let grown = self.buffer.len().max(INITIAL_BUFFER_SIZE) * 2;
                    self.buffer.resize(grown, 0);
                }
                self.buffer[..len].copy_from_slice(&delivery.payload);
                let serial = delivery.serial;

                let message = Message::decode(&self.buffer[..len])?;
                let tracker = self.incoming.add(id, delivery_id, serial);
                connection
                    .delivery_mut(delivery_id)
                    .expect("delivery is readable")
                    .context = Some(tracker.sequence);
                connection.consume_readable(delivery_id);
                self.distributed -= 1;
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    /// Subscribe to a source.
    ///
    /// A source containing `~` binds a listener on the named host and
    /// port; anything else attaches a receiving link to the remote
    /// source node.
    pub fn subscribe(&mut self, source: &str) -> Result<(), Error> {
        if self.driver.is_none() {
            return Err(Error::Unstarted);
        }
        if source.contains('~') {
            let address = Address::parse(&source.replacen('~', "", 1))?;
            let driver = self.driver.as_mut().expect("checked above");
            driver.listen(&address.host, address.port)?;
            Ok(())
        } else {
            let address = Address::parse(source)?;
            self.resolve_link(&address, LinkMatch::receiver(&address))?;
            Ok(())
        }
    }

    /// Accept deliveries up to the tracker; cumulative accepts everything
    /// from the tail through the tracker
    pub fn accept(&mut self, tracker: Tracker, cumulative: bool) {
        self.dispose(tracker, cumulative, Status::Accepted);
    }

    /// Reject deliveries up to the tracker; cumulative rejects everything
    /// from the tail through the tracker
    pub fn reject(&mut self, tracker: Tracker, cumulative: bool) {
        self.dispose(tracker, cumulative, Status::Rejected);
    }

    /// Settle deliveries up to the tracker, finalizing them locally
    pub fn settle(&mut self, tracker: Tracker, cumulative: bool) {
        let store = match tracker.direction {
            Direction::Incoming => &mut self.incoming,
            Direction::Outgoing => &mut self.outgoing,
        };
        let mut targets = Vec::new();
        for sequence in store.selection(tracker, cumulative) {
            let Some(entry) = store.entry_mut_by_sequence(sequence) else {
                continue;
            };
            if entry.settled {
                continue;
            }
            entry.settled = true;
            targets.push((entry.connector, entry.delivery, entry.serial));
        }
        for (connector, delivery, serial) in targets {
            self.with_live_delivery(connector, delivery, serial, |connection, delivery| {
                connection.settle(delivery);
            });
        }
    }

    /// Status of the delivery a tracker refers to
    pub fn status(&self, tracker: Tracker) -> Status {
        match tracker.direction {
            Direction::Incoming => self.incoming.status(tracker),
            Direction::Outgoing => self.outgoing.status(tracker),
        }
    }

    /// Tracker of the most recently put message
    pub fn outgoing_tracker(&self) -> Option<Tracker> {
        self.outgoing.last_tracker()
    }

    /// Tracker of the most recently gotten message
    pub fn incoming_tracker(&self) -> Option<Tracker> {
        self.incoming.last_tracker()
    }

    /// Messages staged on active senders and not yet written out
    pub fn outgoing(&self) -> usize {
        let Some(driver) = self.driver.as_ref() else {
            return 0;
        };
        let mut queued = 0;
        for id in driver.connector_ids() {
            let connection = driver
                .connector(id)
                .expect("connector id just listed")
                .connection();
            for link_id in connection.links(StateSet::ACTIVE, StateSet::ANY) {
                let link = connection.link(link_id).expect("link id just listed");
                if link.is_sender() {
                    queued += link.queued();
                }
            }
        }
        queued
    }

    /// Messages received and not yet taken with [`get`](Self::get)
    pub fn incoming(&self) -> usize {
        let Some(driver) = self.driver.as_ref() else {
            return 0;
        };
        let mut readable = 0;
        for id in driver.connector_ids() {
            let connection = driver
                .connector(id)
                .expect("connector id just listed")
                .connection();
            for delivery_id in connection.work() {
                let Some(delivery) = connection.delivery(delivery_id) else {
                    continue;
                };
                if delivery.is_readable()
                    && connection
                        .link(delivery.link)
                        .map_or(false, |link| link.is_receiver())
                {
                    readable += 1;
                }
            }
        }
        readable
    }

    /* ----------------------------- dispositions --------------------------- */

    fn dispose(&mut self, tracker: Tracker, cumulative: bool, status: Status) {
        let state = match status {
            Status::Accepted => DeliveryState::Accepted(Accepted {}),
            Status::Rejected => DeliveryState::Rejected(Rejected { error: None }),
            Status::Released => DeliveryState::Released(Released {}),
            Status::Modified => DeliveryState::Modified(Modified {
                delivery_failed: None,
                undeliverable_here: None,
                message_annotations: None,
            }),
            _ => return,
        };
        let store = match tracker.direction {
            Direction::Incoming => &mut self.incoming,
            Direction::Outgoing => &mut self.outgoing,
        };
        let mut targets = Vec::new();
        for sequence in store.selection(tracker, cumulative) {
            let Some(entry) = store.entry_mut_by_sequence(sequence) else {
                continue;
            };
            if entry.settled {
                continue;
            }
            entry.disposition = Some(status);
            targets.push((entry.connector, entry.delivery, entry.serial));
        }
        for (connector, delivery, serial) in targets {
            let state = state.clone();
            self.with_live_delivery(connector, delivery, serial, move |connection, delivery| {
                connection.update_disposition(delivery, state);
            });
        }
    }

    /// Run `f` against an engine delivery if it is still the one the
    /// store entry was created for
    fn with_live_delivery(
        &mut self,
        connector: usize,
        delivery: DeliveryId,
        serial: u64,
        f: impl FnOnce(&mut Connection, DeliveryId),
    ) {
        let Some(driver) = self.driver.as_mut() else {
            return;
        };
        let Some(connector) = driver.connector_mut(connector) else {
            return;
        };
        let connection = connector.connection_mut();
        match connection.delivery(delivery) {
            Some(live) if live.serial == serial => f(connection, delivery),
            _ => {}
        }
    }

    /* ------------------------ registry and finders ------------------------ */

    /// Find or create the link for (host, port, path).
    ///
    /// Connections are matched by their service context; a new connector
    /// is opened when none matches. Links are matched by direction and
    /// local terminus path, each new link on a session of its own.
    fn resolve_link(
        &mut self,
        address: &Address,
        finder: LinkMatch,
    ) -> Result<(usize, LinkId), Error> {
        let driver = self.driver.as_mut().ok_or(Error::Unstarted)?;
        let service = address.service();

        let existing = driver.connector_ids().into_iter().find(|&id| {
            let connection = driver
                .connector(id)
                .expect("connector id just listed")
                .connection();
            connection.local_state != EndpointState::Closed
                && connection.context.as_deref() == Some(service.as_str())
        });
        let connector = match existing {
            Some(id) => id,
            None => {
                let id = driver.connect(&address.host, address.port, &self.name)?;
                let connector = driver.connector_mut(id).expect("connector just created");
                connector.connection_mut().open();
                if let Err(err) = connector.process() {
                    error!(connector = id, error = %err, "failure while opening connection");
                }
                id
            }
        };

        let connection = driver
            .connector_mut(connector)
            .expect("connector just resolved")
            .connection_mut();
        for link_id in connection.links(StateSet::ACTIVE, StateSet::ANY) {
            if finder.test(connection, link_id) {
                return Ok((connector, link_id));
            }
        }
        let session = connection.create_session();
        connection.open_session(session);
        let link = finder.create(connection, session);
        connection.open_link(link);
        Ok((connector, link))
    }

    /* ----------------------------- credit --------------------------------- */

    /// Distribute the credit pool across active receivers.
    ///
    /// Every receiver is topped up towards `max(1, credit / receivers)`;
    /// unlimited mode refills the pool to a fixed batch per receiver
    /// first, bounding growth while keeping every receiver served.
    fn distribute(&mut self) {
        let Some(driver) = self.driver.as_mut() else {
            return;
        };
        let mut receivers: Vec<(usize, LinkId, u32)> = Vec::new();
        for id in driver.connector_ids() {
            let connection = driver
                .connector(id)
                .expect("connector id just listed")
                .connection();
            for link_id in connection.links(StateSet::ACTIVE, StateSet::ANY) {
                let link = connection.link(link_id).expect("link id just listed");
                if link.is_receiver() {
                    receivers.push((id, link_id, link.credit));
                }
            }
        }
        if receivers.is_empty() {
            return;
        }
        if self.unlimited_credit {
            self.credit = receivers.len() as i32 * CREDIT_BATCH;
        }
        let batch = std::cmp::max(1, self.credit / receivers.len() as i32);
        for (connector, link, have) in receivers {
            if self.credit <= 0 {
                break;
            }
            let have = have as i32;
            if have < batch {
                let amount = std::cmp::min(self.credit, batch - have);
                driver
                    .connector_mut(connector)
                    .expect("receiver collected above")
                    .connection_mut()
                    .flow(link, amount as u32);
                self.distributed += amount;
                self.credit -= amount;
            }
        }
    }

    /// Return the credit still held by a dying connection's receivers to
    /// the pool
    fn reclaim_credit(&mut self, connector: usize) {
        let Some(driver) = self.driver.as_mut() else {
            return;
        };
        let Some(connector) = driver.connector_mut(connector) else {
            return;
        };
        let connection = connector.connection_mut();
        for link_id in connection.links(StateSet::ANY, StateSet::ANY) {
            let link = connection.link_mut(link_id).expect("link id just listed");
            if link.is_receiver() && link.credit > 0 {
                let held = link.credit as i32;
                link.credit = 0;
                self.credit += held;
                self.distributed -= held;
            }
        }
    }

    /* -------------------------- event processor --------------------------- */

    /// Pass A: advance every connector's I/O
    fn process_driver(&mut self) {
        let Some(driver) = self.driver.as_mut() else {
            return;
        };
        for id in driver.connector_ids() {
            let connector = driver.connector_mut(id).expect("connector id just listed");
            if let Err(err) = connector.process() {
                error!(connector = id, error = %err, "I/O failure while processing connector");
            }
        }
    }

    /// Pass B: accept pending sockets, answer remote opens, settle sender
    /// updates, distribute credit and reap finished connectors
    fn process_events(&mut self) {
        if self.driver.is_none() {
            return;
        }
        let name = self.name.clone();

        self.driver.as_mut().expect("checked above").start_pass();
        while let Some(listener) = self.driver.as_mut().expect("checked above").next_listener() {
            loop {
                match self
                    .driver
                    .as_mut()
                    .expect("checked above")
                    .accept(listener, &name)
                {
                    Ok(Some(connector)) => {
                        let driver = self.driver.as_mut().expect("checked above");
                        driver
                            .connector_mut(connector)
                            .expect("connector just accepted")
                            .connection_mut()
                            .open();
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(listener, error = %err, "failed to accept connection");
                        break;
                    }
                }
            }
        }

        while let Some(connector) = self.driver.as_mut().expect("checked above").next_connector() {
            self.process_connector(connector);
        }

        self.outgoing.slide();
        self.incoming.slide();
    }

    fn process_connector(&mut self, id: usize) {
        // Advance I/O, open the connection if the peer spoke first, and
        // mirror updated remote dispositions onto sends
        let mut disposition_updates: Vec<(u64, Option<Status>)> = Vec::new();
        {
            let driver = self.driver.as_mut().expect("driver present in pass");
            let Some(connector) = driver.connector_mut(id) else {
                return;
            };
            if let Err(err) = connector.process() {
                error!(connector = id, error = %err, "I/O failure while processing connector");
            }
            let connection = connector.connection_mut();
            if connection.local_state == EndpointState::Uninitialized {
                connection.open();
            }
            for delivery_id in connection.work() {
                let Some(delivery) = connection.delivery(delivery_id) else {
                    continue;
                };
                let from_sender = connection
                    .link(delivery.link)
                    .map_or(false, |link| link.is_sender());
                if from_sender && delivery.updated {
                    let update = (
                        delivery.context,
                        delivery.remote_state.as_ref().map(terminal_status),
                    );
                    if let (Some(sequence), Some(status)) = update {
                        disposition_updates.push((sequence, status));
                    }
                    connection.mirror_remote_state(delivery_id);
                }
            }
        }
        for (sequence, status) in disposition_updates {
            if let Some(entry) = self.outgoing.entry_mut_by_sequence(sequence) {
                if let Some(status) = status {
                    entry.disposition = Some(status);
                }
            }
        }
        self.outgoing.slide();

        // Open whatever the peer initiated, adopting its termini
        {
            let driver = self.driver.as_mut().expect("driver present in pass");
            let Some(connector) = driver.connector_mut(id) else {
                return;
            };
            let connection = connector.connection_mut();
            for session in connection.sessions(StateSet::UNINITIALIZED, StateSet::ANY) {
                connection.open_session(session);
            }
            for link_id in connection.links(StateSet::UNINITIALIZED, StateSet::ANY) {
                let link = connection.link_mut(link_id).expect("link id just listed");
                link.source = link.remote_source.clone();
                link.target = link.remote_target.clone();
                connection.open_link(link_id);
            }
        }

        self.distribute();

        // Echo remote closes and run the connection half-close handshake
        {
            let driver = self.driver.as_mut().expect("driver present in pass");
            let Some(connector) = driver.connector_mut(id) else {
                return;
            };
            let connection = connector.connection_mut();
            for link_id in connection.links(StateSet::ACTIVE, StateSet::CLOSED) {
                connection.close_link(link_id);
            }
            for session in connection.sessions(StateSet::ACTIVE, StateSet::CLOSED) {
                connection.close_session(session);
            }
            if connection.remote_state == EndpointState::Closed
                && connection.local_state == EndpointState::Active
            {
                connection.close();
            }
        }

        // Reap the connector once the close handshake has finished
        let closed = self
            .driver
            .as_ref()
            .expect("driver present in pass")
            .connector(id)
            .map_or(false, |connector| connector.is_closed());
        if closed {
            self.reclaim_credit(id);
            self.driver
                .as_mut()
                .expect("driver present in pass")
                .remove_connector(id);
        } else {
            let driver = self.driver.as_mut().expect("driver present in pass");
            if let Some(connector) = driver.connector_mut(id) {
                if let Err(err) = connector.process() {
                    error!(connector = id, error = %err, "I/O failure while processing connector");
                }
            }
        }
    }

    /* ----------------------------- wait loop ------------------------------ */

    /// Drive the processor until the predicate holds or the timeout
    /// expires
    fn wait_until(&mut self, predicate: fn(&mut Messenger) -> bool) -> Result<(), Error> {
        if self.driver.is_none() {
            return Err(Error::Unstarted);
        }
        self.process_driver();
        let deadline = if self.timeout < 0 {
            None
        } else {
            Some(Instant::now() + Duration::from_millis(self.timeout as u64))
        };
        loop {
            self.process_events();
            if predicate(self) {
                // Settles done by the predicate become window-visible now
                self.outgoing.slide();
                self.incoming.slide();
                return Ok(());
            }
            let remaining = match deadline {
                None => None,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout);
                    }
                    Some(deadline - now)
                }
            };
            let Some(driver) = self.driver.as_mut() else {
                return Err(Error::Unstarted);
            };
            if let Err(err) = driver.wait(remaining) {
                warn!(error = %err, "driver wait failed");
            }
        }
    }

    /* ----------------------------- predicates ----------------------------- */

    /// Every outgoing delivery is terminally disposed or remotely
    /// settled (then settled locally), or lives on a remotely closed
    /// connection; and no active sender has anything queued
    fn sent_settled(&mut self) -> bool {
        let Some(driver) = self.driver.as_mut() else {
            return true;
        };
        for id in driver.connector_ids() {
            let connector = driver.connector(id).expect("connector id just listed");
            if connector.has_queued_frames() {
                return false;
            }
            let connection = connector.connection();
            for link_id in connection.links(StateSet::ACTIVE, StateSet::ANY) {
                let link = connection.link(link_id).expect("link id just listed");
                if link.is_sender() && link.queued() > 0 {
                    return false;
                }
            }
        }

        let mut to_settle: Vec<(u64, usize, DeliveryId, u64)> = Vec::new();
        for (sequence, entry) in self.outgoing.entries() {
            if entry.settled {
                continue;
            }
            let Some(connector) = driver.connector(entry.connector) else {
                // The connection is gone; nothing will settle this
                continue;
            };
            let connection = connector.connection();
            if connection.remote_state == EndpointState::Closed {
                continue;
            }
            match connection.delivery(entry.delivery) {
                Some(delivery) if delivery.serial == entry.serial => {
                    let terminal = delivery
                        .remote_state
                        .as_ref()
                        .map_or(false, |state| terminal_status(state).is_some());
                    if terminal || delivery.remotely_settled {
                        to_settle.push((sequence, entry.connector, entry.delivery, entry.serial));
                    } else {
                        return false;
                    }
                }
                // Delivery already freed
                _ => continue,
            }
        }

        for (sequence, connector, delivery, serial) in to_settle {
            self.with_live_delivery(connector, delivery, serial, |connection, delivery| {
                connection.settle(delivery);
            });
            if let Some(entry) = self.outgoing.entry_mut_by_sequence(sequence) {
                entry.settled = true;
            }
        }
        true
    }

    /// Any connection holds a complete readable delivery
    fn message_available(&mut self) -> bool {
        let Some(driver) = self.driver.as_ref() else {
            return false;
        };
        for id in driver.connector_ids() {
            let connection = driver
                .connector(id)
                .expect("connector id just listed")
                .connection();
            for delivery_id in connection.work() {
                if connection
                    .delivery(delivery_id)
                    .map_or(false, |delivery| delivery.is_readable())
                {
                    return true;
                }
            }
        }
        false
    }

    /// The driver has no connectors left
    fn all_closed(&mut self) -> bool {
        self.driver
            .as_ref()
            .map_or(true, |driver| driver.connector_count() == 0)
    }
}

/// Map a terminal remote delivery state onto a tracker status
fn terminal_status(state: &DeliveryState) -> Option<Status> {
    match state {
        DeliveryState::Accepted(_) => Some(Status::Accepted),
        DeliveryState::Rejected(_) => Some(Status::Rejected),
        DeliveryState::Released(_) => Some(Status::Released),
        DeliveryState::Modified(_) => Some(Status::Modified),
        DeliveryState::Received(_) => None,
        #[allow(unreachable_patterns)]
        _ => None,
    }
}

/// Match-or-create strategy for the link serving a node path
#[derive(Debug)]
enum LinkMatch {
    Sender { path: String },
    Receiver { path: String },
}

impl LinkMatch {
    fn sender(address: &Address) -> Self {
        LinkMatch::Sender {
            path: address.path.clone(),
        }
    }

    fn receiver(address: &Address) -> Self {
        LinkMatch::Receiver {
            path: address.path.clone(),
        }
    }

    /// Whether an existing link serves this path in the right direction.
    ///
    /// A null terminus address matches the empty path.
    fn test(&self, connection: &Connection, link_id: LinkId) -> bool {
        let Some(link) = connection.link(link_id) else {
            return false;
        };
        match self {
            LinkMatch::Sender { path } => {
                link.is_sender()
                    && link
                        .target
                        .as_ref()
                        .and_then(|target| target.address.as_deref())
                        .unwrap_or("")
                        == path
            }
            LinkMatch::Receiver { path } => {
                link.is_receiver()
                    && link
                        .source
                        .as_ref()
                        .and_then(|source| source.address.as_deref())
                        .unwrap_or("")
                        == path
            }
        }
    }

    /// Create the link on a fresh session, named by its path
    fn create(&self, connection: &mut Connection, session: crate::engine::SessionId) -> LinkId {
        match self {
            LinkMatch::Sender { path } => {
                let link = connection.create_sender(session, path.clone());
                let target = Target::builder().address(path.clone()).build();
                connection
                    .link_mut(link)
                    .expect("link just created")
                    .target = Some(target);
                link
            }
            LinkMatch::Receiver { path } => {
                let link = connection.create_receiver(session, path.clone());
                let source = Source::builder().address(path.clone()).build();
                connection
                    .link_mut(link)
                    .expect("link just created")
                    .source = Some(source);
                link
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use serde_amqp::Value;

    use super::*;

    /// A bound port whose owner never talks; connects complete through
    /// the backlog and then stay silent
    fn silent_port() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    fn started(name: &str) -> Messenger {
        let mut messenger = Messenger::builder().name(name).timeout(0).build();
        messenger.start().unwrap();
        messenger
    }

    #[test]
    fn put_without_host_leaves_state_unchanged() {
        let mut messenger = started("no-host");

        let message = Message::new();
        assert!(matches!(
            messenger.put(message),
            Err(Error::InvalidAddress(_))
        ));

        let mut message = Message::new();
        message.set_address("amqp:///q");
        assert!(matches!(
            messenger.put(message),
            Err(Error::InvalidAddress(_))
        ));

        assert_eq!(messenger.outgoing(), 0);
        assert!(messenger.outgoing_tracker().is_none());
    }

    #[test]
    fn unlimited_credit_tops_up_every_receiver() {
        let (_listener, port) = silent_port();
        let mut messenger = started("credit");
        for path in ["a", "b", "c"] {
            messenger
                .subscribe(&format!("amqp://127.0.0.1:{}/{}", port, path))
                .unwrap();
        }

        // Nothing will ever arrive; the zero timeout turns recv into a
        // single distribute-and-look pass
        assert!(matches!(messenger.recv(-1), Err(Error::Timeout)));

        let driver = messenger.driver.as_ref().unwrap();
        let ids = driver.connector_ids();
        assert_eq!(ids.len(), 1);
        let connection = driver.connector(ids[0]).unwrap().connection();
        let receivers = connection.links(StateSet::ACTIVE, StateSet::ANY);
        assert_eq!(receivers.len(), 3);
        for link_id in receivers {
            assert_eq!(connection.link(link_id).unwrap().credit, 10);
        }
        assert_eq!(messenger.distributed, 30);
    }

    #[test]
    fn bounded_credit_splits_across_receivers() {
        let (_listener, port) = silent_port();
        let mut messenger = started("batch");
        for path in ["a", "b"] {
            messenger
                .subscribe(&format!("amqp://127.0.0.1:{}/{}", port, path))
                .unwrap();
        }

        assert!(matches!(messenger.recv(6), Err(Error::Timeout)));

        let driver = messenger.driver.as_ref().unwrap();
        let connection = driver
            .connector(driver.connector_ids()[0])
            .unwrap()
            .connection();
        for link_id in connection.links(StateSet::ACTIVE, StateSet::ANY) {
            assert_eq!(connection.link(link_id).unwrap().credit, 3);
        }
        assert_eq!(messenger.credit, 0);
        assert_eq!(messenger.distributed, 6);
    }

    #[test]
    fn scratch_buffer_grows_and_never_shrinks() {
        let (_listener, port) = silent_port();
        let mut messenger = started("scratch");

        let mut message = Message::new();
        message.set_address(format!("amqp://127.0.0.1:{}/big", port));
        message.set_body(Value::Binary(Binary::from(vec![7u8; 20 * 1024])));
        let tracker = messenger.put(message).unwrap();
        assert!(messenger.buffer.len() >= 20 * 1024);
        assert_eq!(messenger.status(tracker), Status::Pending);

        let grown = messenger.buffer.len();
        let mut message = Message::new();
        message.set_address(format!("amqp://127.0.0.1:{}/big", port));
        message.set_body(Value::Binary(Binary::from(vec![7u8; 3 * 1024])));
        messenger.put(message).unwrap();
        assert_eq!(messenger.buffer.len(), grown);

        // Both deliveries are queued behind credit on the same sender
        assert_eq!(messenger.outgoing(), 2);
    }

    #[test]
    fn links_are_reused_by_path() {
        let (_listener, port) = silent_port();
        let mut messenger = started("reuse");
        let address = Address::parse(&format!("amqp://127.0.0.1:{}/q", port)).unwrap();

        let (connector_a, link_a) = messenger
            .resolve_link(&address, LinkMatch::sender(&address))
            .unwrap();
        let (connector_b, link_b) = messenger
            .resolve_link(&address, LinkMatch::sender(&address))
            .unwrap();
        assert_eq!(connector_a, connector_b);
        assert_eq!(link_a, link_b);

        // Same path, other direction: a different link
        let (connector_c, link_c) = messenger
            .resolve_link(&address, LinkMatch::receiver(&address))
            .unwrap();
        assert_eq!(connector_a, connector_c);
        assert_ne!(link_a, link_c);
    }

    #[test]
    fn operations_require_start() {
        let mut messenger = Messenger::builder().name("stopped").build();
        let mut message = Message::new();
        message.set_address("amqp://127.0.0.1:5672/q");
        assert!(matches!(messenger.put(message), Err(Error::Unstarted)));
        assert!(matches!(messenger.recv(1), Err(Error::Unstarted)));
        assert!(matches!(
            messenger.subscribe("amqp://127.0.0.1:5672/q"),
            Err(Error::Unstarted)
        ));
        // Stopping a never-started messenger is fine
        messenger.stop().unwrap();
    }
}
