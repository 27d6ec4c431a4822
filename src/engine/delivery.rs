use actix_derive::Message;
use crate::proc_id::ProcId;
use crate::wire::{MembershipId, Service};

use bytes::Bytes;

/// The events handed to the layer above the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Message)]
#[rtype(result = "()")]
pub enum Delivery {
    /// A reassembled message, in the order its service requires
    Message { sender: ProcId, service: Service, payload: Bytes },
    /// The daemons that moved on from my previous ring together with me
    Transitional { members: Vec<ProcId>, memb_id: MembershipId },
    /// A newly installed ring
    Regular { members: Vec<ProcId>, memb_id: MembershipId },
}

impl Delivery {
    pub fn is_view(&self) -> bool {
        match self {
            Delivery::Message { .. } => false,
            _ => true,
        }
    }
}
