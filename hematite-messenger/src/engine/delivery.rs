//! Message deliveries

use bytes::BytesMut;
use fe2o3_amqp_types::{
    definitions::{DeliveryNumber, DeliveryTag},
    messaging::DeliveryState,
};

use super::LinkId;

/// A single message in flight, identified by its tag.
///
/// Outgoing deliveries are created with their full payload and emitted as
/// a Transfer once link credit allows; incoming deliveries accumulate
/// payload until the final Transfer frame arrives.
#[derive(Debug)]
pub(crate) struct Delivery {
    pub(crate) link: LinkId,

    /// Creation serial, never reused. Guards against a slab slot being
    /// reoccupied after settlement.
    pub(crate) serial: u64,

    pub(crate) tag: DeliveryTag,

    /// Transfer number; assigned on emission for outgoing deliveries,
    /// taken from the wire for incoming ones
    pub(crate) delivery_id: Option<DeliveryNumber>,

    pub(crate) payload: BytesMut,

    /// Incoming: more Transfer frames are expected
    pub(crate) partial: bool,

    /// Incoming: payload is complete and has not been read yet
    pub(crate) readable: bool,

    /// Outgoing: the Transfer frame has been emitted
    pub(crate) sent: bool,

    /// Remote disposition changed since last observed
    pub(crate) updated: bool,

    pub(crate) in_work: bool,

    pub(crate) local_state: Option<DeliveryState>,
    pub(crate) remote_state: Option<DeliveryState>,
    pub(crate) remotely_settled: bool,

    /// Opaque user slot; the messenger stores the tracker sequence here
    pub(crate) context: Option<u64>,
}

impl Delivery {
    pub(crate) fn new(link: LinkId, serial: u64, tag: DeliveryTag) -> Self {
        Self {
            link,
            serial,
            tag,
            delivery_id: None,
            payload: BytesMut::new(),
            partial: false,
            readable: false,
            sent: false,
            updated: false,
            in_work: false,
            local_state: None,
            remote_state: None,
            remotely_settled: false,
            context: None,
        }
    }

    /// Complete, readable and not yet consumed
    pub(crate) fn is_readable(&self) -> bool {
        self.readable && !self.partial
    }
}
