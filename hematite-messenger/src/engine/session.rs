//! Session endpoint state

use std::collections::BTreeMap;

use super::{EndpointState, LinkId};

/// Default incoming and outgoing session window, in transfer frames
pub(crate) const SESSION_WINDOW: u32 = 2048;

/// A channel-multiplexed container of links.
///
/// Flow-state bookkeeping follows AMQP 1.0 Part 2.5.6; the messenger
/// advertises a fixed window and refreshes it with every link flow.
#[derive(Debug)]
pub(crate) struct Session {
    pub(crate) local_state: EndpointState,
    pub(crate) remote_state: EndpointState,

    pub(crate) local_channel: u16,
    pub(crate) remote_channel: Option<u16>,

    pub(crate) next_outgoing_id: u32,
    pub(crate) next_incoming_id: u32,
    pub(crate) incoming_window: u32,
    pub(crate) outgoing_window: u32,
    pub(crate) remote_incoming_window: u32,
    pub(crate) remote_outgoing_window: u32,

    pub(crate) next_output_handle: u32,

    /// Peer handle -> link
    pub(crate) links_by_input_handle: BTreeMap<u32, LinkId>,
}

impl Session {
    pub(crate) fn new(local_channel: u16) -> Self {
        Self {
            local_state: EndpointState::Uninitialized,
            remote_state: EndpointState::Uninitialized,
            local_channel,
            remote_channel: None,
            next_outgoing_id: 0,
            next_incoming_id: 0,
            incoming_window: SESSION_WINDOW,
            outgoing_window: SESSION_WINDOW,
            remote_incoming_window: 0,
            remote_outgoing_window: 0,
            next_output_handle: 0,
            links_by_input_handle: BTreeMap::new(),
        }
    }

    pub(crate) fn alloc_output_handle(&mut self) -> u32 {
        let handle = self.next_output_handle;
        self.next_output_handle += 1;
        handle
    }
}
