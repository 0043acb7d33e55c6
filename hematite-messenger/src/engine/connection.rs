//! Connection endpoint state and frame dispatch

use std::collections::{BTreeMap, VecDeque};

use bytes::BytesMut;
use fe2o3_amqp_types::{
    definitions::{DeliveryTag, Handle, Role},
    messaging::{DeliveryState, TargetArchetype},
    performatives::{
        Attach, Begin, ChannelMax, Close, Detach, Disposition, End, Flow, MaxFrameSize, Open,
        Performative, Transfer,
    },
};
use slab::Slab;
use tracing::trace;

use crate::frames::Frame;
use crate::transport::MAX_FRAME_SIZE;

use super::{
    Delivery, DeliveryId, EndpointState, EngineError, Link, LinkId, Session, SessionId, StateSet,
};

/// An AMQP connection endpoint and everything nested under it.
///
/// The connection owns its sessions, links and deliveries in slab arenas;
/// the driver and the messenger refer to them through copyable ids. All
/// locally initiated operations stage frames on `outgoing`; the driver
/// drains them with [`Connection::take_frame`] once the transport is
/// ready.
#[derive(Debug)]
pub(crate) struct Connection {
    pub(crate) local_state: EndpointState,
    pub(crate) remote_state: EndpointState,

    container: String,
    hostname: Option<String>,

    /// Opaque user slot; the messenger stores the "host:port" service
    /// string of outbound connections here
    pub(crate) context: Option<String>,

    pub(crate) remote_container: Option<String>,

    sessions: Slab<Session>,
    session_order: Vec<usize>,
    sessions_by_remote_channel: BTreeMap<u16, usize>,

    links: Slab<Link>,
    link_order: Vec<usize>,

    deliveries: Slab<Delivery>,
    next_serial: u64,

    /// Deliveries needing user attention: readable incoming ones and
    /// outgoing ones whose remote disposition changed
    work: VecDeque<usize>,

    outgoing: VecDeque<Frame>,
}

impl Connection {
    pub(crate) fn new(container: impl Into<String>, hostname: Option<String>) -> Self {
        Self {
            local_state: EndpointState::Uninitialized,
            remote_state: EndpointState::Uninitialized,
            container: container.into(),
            hostname,
            context: None,
            remote_container: None,
            sessions: Slab::new(),
            session_order: Vec::new(),
            sessions_by_remote_channel: BTreeMap::new(),
            links: Slab::new(),
            link_order: Vec::new(),
            deliveries: Slab::new(),
            next_serial: 0,
            work: VecDeque::new(),
            outgoing: VecDeque::new(),
        }
    }

    /* ----------------------------- accessors ----------------------------- */

    pub(crate) fn link(&self, id: LinkId) -> Option<&Link> {
        self.links.get(id.0)
    }

    pub(crate) fn link_mut(&mut self, id: LinkId) -> Option<&mut Link> {
        self.links.get_mut(id.0)
    }

    pub(crate) fn delivery(&self, id: DeliveryId) -> Option<&Delivery> {
        self.deliveries.get(id.0)
    }

    pub(crate) fn delivery_mut(&mut self, id: DeliveryId) -> Option<&mut Delivery> {
        self.deliveries.get_mut(id.0)
    }

    /// Sessions filtered by (local, remote) state, in creation order
    pub(crate) fn sessions(&self, local: StateSet, remote: StateSet) -> Vec<SessionId> {
        self.session_order
            .iter()
            .copied()
            .filter(|&key| {
                let session = &self.sessions[key];
                local.contains(session.local_state) && remote.contains(session.remote_state)
            })
            .map(SessionId)
            .collect()
    }

    /// Links filtered by (local, remote) state, in creation order
    pub(crate) fn links(&self, local: StateSet, remote: StateSet) -> Vec<LinkId> {
        self.link_order
            .iter()
            .copied()
            .filter(|&key| {
                let link = &self.links[key];
                local.contains(link.local_state) && remote.contains(link.remote_state)
            })
            .map(LinkId)
            .collect()
    }

    /// Snapshot of the work list in arrival order
    pub(crate) fn work(&self) -> Vec<DeliveryId> {
        self.work.iter().copied().map(DeliveryId).collect()
    }

    /* ------------------------- local operations -------------------------- */

    /// Open the connection locally, staging an Open frame
    pub(crate) fn open(&mut self) {
        if self.local_state != EndpointState::Uninitialized {
            return;
        }
        self.local_state = EndpointState::Active;
        let open = Open {
            container_id: self.container.clone(),
            hostname: self.hostname.clone(),
            max_frame_size: MaxFrameSize(MAX_FRAME_SIZE as u32),
            channel_max: ChannelMax(u16::MAX),
            idle_time_out: None,
            outgoing_locales: None,
            incoming_locales: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        };
        self.outgoing
            .push_back(Frame::performative(0, Performative::Open(open)));
    }

    /// Close the connection locally, staging a Close frame
    pub(crate) fn close(&mut self) {
        if self.local_state == EndpointState::Closed {
            return;
        }
        self.local_state = EndpointState::Closed;
        self.outgoing.push_back(Frame::performative(
            0,
            Performative::Close(Close { error: None }),
        ));
    }

    /// Create a session; begin is staged separately by [`open_session`]
    pub(crate) fn create_session(&mut self) -> SessionId {
        let entry = self.sessions.vacant_entry();
        let key = entry.key();
        entry.insert(Session::new(key as u16));
        self.session_order.push(key);
        SessionId(key)
    }

    /// Open a session locally, staging a Begin frame.
    ///
    /// A session answering a remotely initiated begin echoes the remote
    /// channel.
    pub(crate) fn open_session(&mut self, id: SessionId) {
        let session = &mut self.sessions[id.0];
        if session.local_state != EndpointState::Uninitialized {
            return;
        }
        session.local_state = EndpointState::Active;
        let begin = Begin {
            remote_channel: session.remote_channel,
            next_outgoing_id: session.next_outgoing_id,
            incoming_window: session.incoming_window,
            outgoing_window: session.outgoing_window,
            handle_max: Handle(u32::MAX),
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        };
        self.outgoing.push_back(Frame::performative(
            session.local_channel,
            Performative::Begin(begin),
        ));
    }

    /// End a session locally, staging an End frame
    pub(crate) fn close_session(&mut self, id: SessionId) {
        let session = &mut self.sessions[id.0];
        if session.local_state != EndpointState::Active {
            return;
        }
        session.local_state = EndpointState::Closed;
        self.outgoing.push_back(Frame::performative(
            session.local_channel,
            Performative::End(End { error: None }),
        ));
    }

    /// Create a sending link on a session
    pub(crate) fn create_sender(&mut self, session: SessionId, name: impl Into<String>) -> LinkId {
        self.create_link(session, name.into(), Role::Sender)
    }

    /// Create a receiving link on a session
    pub(crate) fn create_receiver(
        &mut self,
        session: SessionId,
        name: impl Into<String>,
    ) -> LinkId {
        self.create_link(session, name.into(), Role::Receiver)
    }

    fn create_link(&mut self, session: SessionId, name: String, role: Role) -> LinkId {
        let output_handle = self.sessions[session.0].alloc_output_handle();
        let key = self.links.insert(Link::new(session, name, role, output_handle));
        self.link_order.push(key);
        LinkId(key)
    }

    /// Open a link locally, staging an Attach frame
    pub(crate) fn open_link(&mut self, id: LinkId) {
        let link = &mut self.links[id.0];
        if link.local_state != EndpointState::Uninitialized {
            return;
        }
        link.local_state = EndpointState::Active;
        let initial_delivery_count = match link.role {
            Role::Sender => Some(link.delivery_count),
            Role::Receiver => None,
        };
        let attach = Attach {
            name: link.name.clone(),
            handle: Handle(link.output_handle),
            role: link.role.clone(),
            snd_settle_mode: Default::default(),
            rcv_settle_mode: Default::default(),
            source: link.source.clone().map(Box::new),
            target: link.target.clone().map(Into::into).map(Box::new),
            unsettled: None,
            incomplete_unsettled: false,
            initial_delivery_count,
            max_message_size: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        };
        let channel = self.sessions[link.session.0].local_channel;
        self.outgoing
            .push_back(Frame::performative(channel, Performative::Attach(attach)));
    }

    /// Close a link locally, staging a closing Detach frame
    pub(crate) fn close_link(&mut self, id: LinkId) {
        let link = &mut self.links[id.0];
        if link.local_state != EndpointState::Active {
            return;
        }
        link.local_state = EndpointState::Closed;
        let detach = Detach {
            handle: Handle(link.output_handle),
            closed: true,
            error: None,
        };
        let channel = self.sessions[link.session.0].local_channel;
        self.outgoing
            .push_back(Frame::performative(channel, Performative::Detach(detach)));
    }

    /// Grant credit on a receiving link, staging a Flow frame.
    ///
    /// Every flow also tops the session incoming window back up.
    pub(crate) fn flow(&mut self, id: LinkId, credit: u32) {
        let link = &mut self.links[id.0];
        link.credit += credit;
        let session = &mut self.sessions[link.session.0];
        session.incoming_window = super::session::SESSION_WINDOW;
        let flow = Flow {
            next_incoming_id: Some(session.next_incoming_id),
            incoming_window: session.incoming_window,
            next_outgoing_id: session.next_outgoing_id,
            outgoing_window: session.outgoing_window,
            handle: Some(Handle(link.output_handle)),
            delivery_count: Some(link.delivery_count),
            link_credit: Some(link.credit),
            available: None,
            drain: false,
            echo: false,
            properties: None,
        };
        self.outgoing.push_back(Frame::performative(
            session.local_channel,
            Performative::Flow(flow),
        ));
    }

    /// Create an outgoing delivery holding the encoded message bytes.
    ///
    /// The delivery sits queued on the link until [`pump`](Self::pump)
    /// can emit it against available credit.
    pub(crate) fn create_delivery(
        &mut self,
        link: LinkId,
        tag: DeliveryTag,
        payload: &[u8],
    ) -> DeliveryId {
        let serial = self.next_serial;
        self.next_serial += 1;
        let mut delivery = Delivery::new(link, serial, tag);
        delivery.payload = BytesMut::from(payload);
        let key = self.deliveries.insert(delivery);
        self.links[link.0].unsent.push_back(DeliveryId(key));
        DeliveryId(key)
    }

    /// Apply a local disposition to a delivery, staging a Disposition
    /// frame when the delivery is known to the peer
    pub(crate) fn update_disposition(&mut self, id: DeliveryId, state: DeliveryState) {
        let Some(delivery) = self.deliveries.get_mut(id.0) else {
            return;
        };
        delivery.local_state = Some(state.clone());
        let (delivery_id, link) = (delivery.delivery_id, delivery.link);
        if let Some(delivery_id) = delivery_id {
            let role = self.links[link.0].role.clone();
            let channel = self.sessions[self.links[link.0].session.0].local_channel;
            let disposition = Disposition {
                role,
                first: delivery_id,
                last: Some(delivery_id),
                settled: false,
                state: Some(state),
                batchable: false,
            };
            self.outgoing.push_back(Frame::performative(
                channel,
                Performative::Disposition(disposition),
            ));
        }
    }

    /// Settle a delivery locally and free it.
    ///
    /// A settling Disposition is staged unless the peer already settled.
    pub(crate) fn settle(&mut self, id: DeliveryId) {
        let Some(delivery) = self.deliveries.get(id.0) else {
            return;
        };
        let link = delivery.link;
        if !delivery.remotely_settled {
            if let Some(delivery_id) = delivery.delivery_id {
                let role = self.links[link.0].role.clone();
                let channel = self.sessions[self.links[link.0].session.0].local_channel;
                let disposition = Disposition {
                    role,
                    first: delivery_id,
                    last: Some(delivery_id),
                    settled: true,
                    state: delivery.local_state.clone(),
                    batchable: false,
                };
                self.outgoing.push_back(Frame::performative(
                    channel,
                    Performative::Disposition(disposition),
                ));
            }
        }
        self.free_delivery(id);
    }

    fn free_delivery(&mut self, id: DeliveryId) {
        if !self.deliveries.contains(id.0) {
            return;
        }
        let delivery = self.deliveries.remove(id.0);
        let link = &mut self.links[delivery.link.0];
        link.unsent.retain(|&d| d != id);
        if link.in_progress == Some(id) {
            link.in_progress = None;
        }
        self.work.retain(|&key| key != id.0);
    }

    /// Emit Transfer frames for queued sender deliveries against
    /// available credit
    pub(crate) fn pump(&mut self) {
        for index in 0..self.link_order.len() {
            let key = self.link_order[index];
            loop {
                let link = &self.links[key];
                if !link.is_sender()
                    || link.local_state != EndpointState::Active
                    || link.credit == 0
                {
                    break;
                }
                let Some(&delivery_id) = link.unsent.front() else {
                    break;
                };
                let session_key = link.session.0;

                let link = &mut self.links[key];
                link.unsent.pop_front();
                link.credit -= 1;
                link.delivery_count = link.delivery_count.wrapping_add(1);
                let output_handle = link.output_handle;

                let session = &mut self.sessions[session_key];
                let id = session.next_outgoing_id;
                session.next_outgoing_id = session.next_outgoing_id.wrapping_add(1);
                let channel = session.local_channel;

                let delivery = &mut self.deliveries[delivery_id.0];
                delivery.delivery_id = Some(id);
                delivery.sent = true;
                let payload = delivery.payload.split().freeze();

                let transfer = Transfer {
                    handle: Handle(output_handle),
                    delivery_id: Some(id),
                    delivery_tag: Some(delivery.tag.clone()),
                    message_format: Some(0),
                    settled: Some(false),
                    more: false,
                    rcv_settle_mode: None,
                    state: None,
                    resume: false,
                    aborted: false,
                    batchable: false,
                };
                self.outgoing
                    .push_back(Frame::transfer(channel, transfer, payload));
            }
        }
    }

    /// Take the next staged frame, if any
    pub(crate) fn take_frame(&mut self) -> Option<Frame> {
        self.outgoing.pop_front()
    }

    pub(crate) fn has_staged_frames(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /* ------------------------- incoming frames --------------------------- */

    /// Apply one incoming frame to the endpoint state machines
    pub(crate) fn on_frame(&mut self, frame: Frame) -> Result<(), EngineError> {
        trace!(channel = frame.channel, frame = ?frame.performative, "RECV");
        let Frame {
            channel,
            performative,
            payload,
        } = frame;
        match performative {
            Some(Performative::Open(open)) => self.on_open(open),
            Some(Performative::Begin(begin)) => self.on_begin(channel, begin),
            Some(Performative::Attach(attach)) => self.on_attach(channel, attach),
            Some(Performative::Flow(flow)) => self.on_flow(channel, flow),
            Some(Performative::Transfer(transfer)) => self.on_transfer(channel, transfer, payload),
            Some(Performative::Disposition(disposition)) => {
                self.on_disposition(channel, disposition)
            }
            Some(Performative::Detach(detach)) => self.on_detach(channel, detach),
            Some(Performative::End(end)) => self.on_end(channel, end),
            Some(Performative::Close(close)) => self.on_close(close),
            // An empty frame only resets the peer's idle timeout
            None => Ok(()),
        }
    }

    fn on_open(&mut self, open: Open) -> Result<(), EngineError> {
        if self.remote_state == EndpointState::Uninitialized {
            self.remote_state = EndpointState::Active;
        }
        self.remote_container = Some(open.container_id);
        Ok(())
    }

    fn on_close(&mut self, _close: Close) -> Result<(), EngineError> {
        self.remote_state = EndpointState::Closed;
        Ok(())
    }

    fn on_begin(&mut self, channel: u16, begin: Begin) -> Result<(), EngineError> {
        let key = match begin.remote_channel {
            // Answer to a begin this side initiated
            Some(local_channel) => {
                let key = local_channel as usize;
                if !self.sessions.contains(key) {
                    return Err(EngineError::UnknownBeginReply(local_channel));
                }
                key
            }
            // Remotely initiated session
            None => self.create_session().0,
        };
        let session = &mut self.sessions[key];
        session.remote_channel = Some(channel);
        session.remote_state = EndpointState::Active;
        session.next_incoming_id = begin.next_outgoing_id;
        session.remote_incoming_window = begin.incoming_window;
        session.remote_outgoing_window = begin.outgoing_window;
        self.sessions_by_remote_channel.insert(channel, key);
        Ok(())
    }

    fn on_end(&mut self, channel: u16, _end: End) -> Result<(), EngineError> {
        let key = self.session_by_channel(channel)?;
        self.sessions[key].remote_state = EndpointState::Closed;
        Ok(())
    }

    fn on_attach(&mut self, channel: u16, attach: Attach) -> Result<(), EngineError> {
        let session_key = self.session_by_channel(channel)?;
        let input_handle = attach.handle.0;

        // Links pair by name; an unmatched attach creates the
        // remotely-initiated half
        let existing = self.link_order.iter().copied().find(|&key| {
            let link = &self.links[key];
            link.session.0 == session_key
                && link.input_handle.is_none()
                && link.name == attach.name
        });
        let key = match existing {
            Some(key) => key,
            None => {
                let role = match attach.role {
                    // The peer names its own role; ours is the opposite
                    Role::Sender => Role::Receiver,
                    Role::Receiver => Role::Sender,
                };
                let key = self
                    .create_link(SessionId(session_key), attach.name.clone(), role)
                    .0;
                key
            }
        };

        let link = &mut self.links[key];
        link.input_handle = Some(input_handle);
        link.remote_state = EndpointState::Active;
        link.remote_source = attach.source.map(|source| *source);
        link.remote_target = attach.target.and_then(|target| match *target {
            TargetArchetype::Target(target) => Some(target),
            #[allow(unreachable_patterns)]
            _ => None,
        });
        if link.is_receiver() {
            // The sender declares where its delivery-count starts
            link.delivery_count = attach.initial_delivery_count.unwrap_or(0);
        }
        self.sessions[session_key]
            .links_by_input_handle
            .insert(input_handle, LinkId(key));
        Ok(())
    }

    fn on_detach(&mut self, channel: u16, detach: Detach) -> Result<(), EngineError> {
        let session_key = self.session_by_channel(channel)?;
        let link = self.link_by_handle(session_key, detach.handle.0)?;
        self.links[link.0].remote_state = EndpointState::Closed;
        Ok(())
    }

    fn on_flow(&mut self, channel: u16, flow: Flow) -> Result<(), EngineError> {
        let session_key = self.session_by_channel(channel)?;
        {
            let session = &mut self.sessions[session_key];
            session.remote_incoming_window = flow.incoming_window;
            session.remote_outgoing_window = flow.outgoing_window;
        }
        if let Some(handle) = flow.handle {
            let link_id = self.link_by_handle(session_key, handle.0)?;
            let link = &mut self.links[link_id.0];
            if link.is_sender() {
                // Part 2.6.7: link-credit(snd) =
                //   delivery-count(rcv) + link-credit(rcv) - delivery-count(snd)
                let delivery_count = flow.delivery_count.unwrap_or(0);
                let link_credit = flow.link_credit.unwrap_or(0);
                link.credit = delivery_count
                    .wrapping_add(link_credit)
                    .wrapping_sub(link.delivery_count);
            }
        }
        Ok(())
    }

    fn on_transfer(
        &mut self,
        channel: u16,
        transfer: Transfer,
        payload: crate::Payload,
    ) -> Result<(), EngineError> {
        let session_key = self.session_by_channel(channel)?;
        let link_id = self.link_by_handle(session_key, transfer.handle.0)?;

        let session = &mut self.sessions[session_key];
        session.next_incoming_id = session.next_incoming_id.wrapping_add(1);
        session.incoming_window = session.incoming_window.saturating_sub(1);

        let in_progress = self.links[link_id.0].in_progress;
        let key = match in_progress {
            Some(delivery_id) => delivery_id.0,
            None => {
                let tag = transfer.delivery_tag.ok_or(EngineError::MalformedTransfer)?;
                let serial = self.next_serial;
                self.next_serial += 1;
                let mut delivery = Delivery::new(link_id, serial, tag);
                delivery.delivery_id = transfer.delivery_id;
                delivery.readable = true;
                delivery.remotely_settled = transfer.settled.unwrap_or(false);
                let key = self.deliveries.insert(delivery);

                let link = &mut self.links[link_id.0];
                link.credit = link.credit.saturating_sub(1);
                link.delivery_count = link.delivery_count.wrapping_add(1);
                key
            }
        };

        let delivery = &mut self.deliveries[key];
        delivery.payload.extend_from_slice(&payload);
        delivery.partial = transfer.more;
        if transfer.more {
            self.links[link_id.0].in_progress = Some(DeliveryId(key));
        } else {
            self.links[link_id.0].in_progress = None;
            self.push_work(key);
        }
        Ok(())
    }

    fn on_disposition(
        &mut self,
        channel: u16,
        disposition: Disposition,
    ) -> Result<(), EngineError> {
        let session_key = self.session_by_channel(channel)?;
        let first = disposition.first;
        let last = disposition.last.unwrap_or(first);
        // The disposition names the role of its sender: a frame from the
        // receiver updates this side's sending deliveries and vice versa.
        // Delivery-ids are session-scoped.
        let updates_our_role = match disposition.role {
            Role::Receiver => Role::Sender,
            Role::Sender => Role::Receiver,
        };
        let keys: Vec<usize> = self
            .deliveries
            .iter()
            .filter(|(_, delivery)| {
                let link = &self.links[delivery.link.0];
                delivery
                    .delivery_id
                    .map_or(false, |id| id >= first && id <= last)
                    && link.role == updates_our_role
                    && link.session.0 == session_key
            })
            .map(|(key, _)| key)
            .collect();
        for key in keys {
            let delivery = &mut self.deliveries[key];
            if let Some(state) = disposition.state.clone() {
                delivery.remote_state = Some(state);
            }
            delivery.remotely_settled |= disposition.settled;
            if self.links[self.deliveries[key].link.0].role == Role::Sender {
                self.deliveries[key].updated = true;
                self.push_work(key);
            }
        }
        Ok(())
    }

    fn push_work(&mut self, key: usize) {
        let delivery = &mut self.deliveries[key];
        if !delivery.in_work {
            delivery.in_work = true;
            self.work.push_back(key);
        }
    }

    /// Mirror the updated remote disposition onto the local one and drop
    /// the delivery from the work list
    pub(crate) fn mirror_remote_state(&mut self, id: DeliveryId) {
        let Some(delivery) = self.deliveries.get_mut(id.0) else {
            return;
        };
        delivery.local_state = delivery.remote_state.clone();
        delivery.updated = false;
        if !delivery.is_readable() {
            delivery.in_work = false;
            self.work.retain(|&key| key != id.0);
        }
    }

    /// Mark a readable delivery consumed and drop it from the work list
    pub(crate) fn consume_readable(&mut self, id: DeliveryId) {
        let Some(delivery) = self.deliveries.get_mut(id.0) else {
            return;
        };
        delivery.readable = false;
        delivery.in_work = false;
        self.work.retain(|&key| key != id.0);
    }

    /// Force the remote state closed; used when the transport fails
    /// underneath a connection that will never see a Close frame
    pub(crate) fn transport_failed(&mut self) {
        self.remote_state = EndpointState::Closed;
    }

    fn session_by_channel(&self, channel: u16) -> Result<usize, EngineError> {
        self.sessions_by_remote_channel
            .get(&channel)
            .copied()
            .ok_or(EngineError::UnknownChannel(channel))
    }

    fn link_by_handle(&self, session_key: usize, handle: u32) -> Result<LinkId, EngineError> {
        self.sessions[session_key]
            .links_by_input_handle
            .get(&handle)
            .copied()
            .ok_or(EngineError::UnknownHandle(handle))
    }
}

#[cfg(test)]
mod tests {
    use fe2o3_amqp_types::messaging::{Accepted, Target};
    use serde_amqp::primitives::Binary;

    use super::*;

    /// Exchange staged frames between two connections until quiescent
    fn shuttle(a: &mut Connection, b: &mut Connection) {
        loop {
            a.pump();
            b.pump();
            let mut progressed = false;
            while let Some(frame) = a.take_frame() {
                b.on_frame(frame).unwrap();
                progressed = true;
            }
            while let Some(frame) = b.take_frame() {
                a.on_frame(frame).unwrap();
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
    }

    /// Minimal server-side pass: open whatever the peer initiated
    fn serve(conn: &mut Connection) {
        if conn.local_state == EndpointState::Uninitialized {
            conn.open();
        }
        for sid in conn.sessions(StateSet::UNINITIALIZED, StateSet::ANY) {
            conn.open_session(sid);
        }
        for lid in conn.links(StateSet::UNINITIALIZED, StateSet::ANY) {
            let link = conn.link_mut(lid).unwrap();
            link.source = link.remote_source.clone();
            link.target = link.remote_target.clone();
            conn.open_link(lid);
        }
    }

    fn attach_sender(client: &mut Connection, path: &str) -> LinkId {
        let session = client.create_session();
        client.open_session(session);
        let sender = client.create_sender(session, path);
        let target = Target::builder().address(path).build();
        client.link_mut(sender).unwrap().target = Some(target);
        client.open_link(sender);
        sender
    }

    fn connected_pair() -> (Connection, Connection) {
        let mut client = Connection::new("client", Some("127.0.0.1".into()));
        let mut server = Connection::new("server", None);
        client.open();
        shuttle(&mut client, &mut server);
        serve(&mut server);
        shuttle(&mut client, &mut server);
        (client, server)
    }

    #[test]
    fn open_handshake_mirrors_state() {
        let (client, server) = connected_pair();
        assert_eq!(client.local_state, EndpointState::Active);
        assert_eq!(client.remote_state, EndpointState::Active);
        assert_eq!(server.remote_state, EndpointState::Active);
        assert_eq!(client.remote_container.as_deref(), Some("server"));
        assert_eq!(server.remote_container.as_deref(), Some("client"));
    }

    #[test]
    fn attach_echo_creates_receiving_half() {
        let (mut client, mut server) = connected_pair();
        let sender = attach_sender(&mut client, "q");
        shuttle(&mut client, &mut server);
        serve(&mut server);
        shuttle(&mut client, &mut server);

        let receivers = server.links(StateSet::ACTIVE, StateSet::ACTIVE);
        assert_eq!(receivers.len(), 1);
        let receiver = server.link(receivers[0]).unwrap();
        assert!(receiver.is_receiver());
        assert_eq!(receiver.name, "q");
        assert_eq!(
            receiver.source.as_ref().and_then(|s| s.address.as_deref()),
            None
        );
        assert_eq!(
            receiver.target.as_ref().and_then(|t| t.address.as_deref()),
            Some("q")
        );
        assert_eq!(client.link(sender).unwrap().remote_state, EndpointState::Active);
    }

    #[test]
    fn transfer_flows_against_credit() {
        let (mut client, mut server) = connected_pair();
        let sender = attach_sender(&mut client, "q");
        shuttle(&mut client, &mut server);
        serve(&mut server);
        shuttle(&mut client, &mut server);

        let delivery = client.create_delivery(sender, Binary::from(b"0".to_vec()), b"payload");
        client.pump();
        // No credit yet: the delivery stays queued
        assert_eq!(client.link(sender).unwrap().queued(), 1);

        let receiver = server.links(StateSet::ACTIVE, StateSet::ANY)[0];
        server.flow(receiver, 10);
        shuttle(&mut client, &mut server);

        assert_eq!(client.link(sender).unwrap().queued(), 0);
        assert!(client.delivery(delivery).unwrap().sent);

        let work = server.work();
        assert_eq!(work.len(), 1);
        let received = server.delivery(work[0]).unwrap();
        assert!(received.is_readable());
        assert_eq!(&received.payload[..], b"payload");
        assert_eq!(server.link(receiver).unwrap().credit, 9);
    }

    #[test]
    fn disposition_updates_sender_delivery() {
        let (mut client, mut server) = connected_pair();
        let sender = attach_sender(&mut client, "q");
        shuttle(&mut client, &mut server);
        serve(&mut server);
        shuttle(&mut client, &mut server);

        let delivery = client.create_delivery(sender, Binary::from(b"0".to_vec()), b"hi");
        let receiver = server.links(StateSet::ACTIVE, StateSet::ANY)[0];
        server.flow(receiver, 1);
        shuttle(&mut client, &mut server);

        let incoming = server.work()[0];
        server.update_disposition(incoming, DeliveryState::Accepted(Accepted {}));
        shuttle(&mut client, &mut server);

        let outgoing = client.delivery(delivery).unwrap();
        assert!(outgoing.updated);
        assert!(matches!(
            outgoing.remote_state,
            Some(DeliveryState::Accepted(_))
        ));
        assert_eq!(client.work(), vec![delivery]);

        // Settling frees the delivery on both sides
        server.settle(incoming);
        client.settle(delivery);
        shuttle(&mut client, &mut server);
        assert!(client.delivery(delivery).is_none());
        assert!(server.delivery(incoming).is_none());
    }

    #[test]
    fn close_handshake_half_closes() {
        let (mut client, mut server) = connected_pair();
        client.close();
        shuttle(&mut client, &mut server);
        assert_eq!(server.remote_state, EndpointState::Closed);

        server.close();
        shuttle(&mut client, &mut server);
        assert_eq!(client.remote_state, EndpointState::Closed);
    }
}

