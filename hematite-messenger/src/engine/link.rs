//! Link endpoint state

use std::collections::VecDeque;

use fe2o3_amqp_types::{
    definitions::Role,
    messaging::{Source, Target},
};

use super::{DeliveryId, EndpointState, SessionId};

/// One half-duplex route for deliveries within a session.
///
/// The link name doubles as the node path: the messenger names sender
/// links after the target path and receiver links after the source path.
#[derive(Debug)]
pub(crate) struct Link {
    pub(crate) session: SessionId,
    pub(crate) name: String,
    pub(crate) role: Role,

    pub(crate) local_state: EndpointState,
    pub(crate) remote_state: EndpointState,

    /// Handle this side assigned, carried in our Attach
    pub(crate) output_handle: u32,

    /// Handle the peer assigned, carried in its Attach
    pub(crate) input_handle: Option<u32>,

    pub(crate) source: Option<Source>,
    pub(crate) target: Option<Target>,
    pub(crate) remote_source: Option<Source>,
    pub(crate) remote_target: Option<Target>,

    /// Sender: credit granted by the peer. Receiver: credit issued and
    /// not yet consumed by an incoming delivery.
    pub(crate) credit: u32,
    pub(crate) delivery_count: u32,

    /// Sender: deliveries awaiting credit, in submission order
    pub(crate) unsent: VecDeque<DeliveryId>,

    /// Receiver: delivery whose transfer frames are still arriving
    pub(crate) in_progress: Option<DeliveryId>,
}

impl Link {
    pub(crate) fn new(session: SessionId, name: String, role: Role, output_handle: u32) -> Self {
        Self {
            session,
            name,
            role,
            local_state: EndpointState::Uninitialized,
            remote_state: EndpointState::Uninitialized,
            output_handle,
            input_handle: None,
            source: None,
            target: None,
            remote_source: None,
            remote_target: None,
            credit: 0,
            delivery_count: 0,
            unsent: VecDeque::new(),
            in_progress: None,
        }
    }

    pub(crate) fn is_sender(&self) -> bool {
        self.role == Role::Sender
    }

    pub(crate) fn is_receiver(&self) -> bool {
        self.role == Role::Receiver
    }

    /// Number of frames submitted but not yet written to the session
    pub(crate) fn queued(&self) -> usize {
        self.unsent.len()
    }
}
