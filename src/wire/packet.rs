use super::{MemberList, MembershipId, Rep, RepList, Seq};

use crate::proc_id::ProcId;

use bytes::Bytes;

/// Delivery guarantee requested for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Service {
    Unreliable,
    Reliable,
    Fifo,
    Causal,
    Agreed,
    Safe,
}

impl Service {
    /// Reliable messages may be delivered as soon as they arrive, without waiting for order.
    pub fn is_reliable(self) -> bool {
        match self {
            Service::Unreliable | Service::Reliable => true,
            _ => false,
        }
    }

    /// Safe messages wait until every daemon in the ring has them.
    pub fn is_safe(self) -> bool {
        self == Service::Safe
    }
}

/// What a packet carries. The variant determines the membership-class bits of the type word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Data { service: Service, bytes: Bytes },
    /// Liveness announcement of a daemon that lost its token, with the members it has gathered
    Alive(MemberList),
    /// Solicitation by a would-be representative
    Join { members: MemberList, reps: RepList },
    /// Points the receiver at a known representative
    Refer(Rep),
    /// Asks the ring leader to release a held token
    Hurry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    /// Set while the packet still needs to be re-broadcast by the receiving segment leader
    pub routed: bool,
    /// The daemon that put this datagram on the wire
    pub transmitter: ProcId,
    /// The daemon that created the packet
    pub proc_id: ProcId,
    pub memb_id: MembershipId,
    pub seq: Seq,
    pub token_round: u32,
    /// Fragment position: positive for inner fragments, negated fragment count on the last one
    pub packet_index: i16,
}

impl PacketHeader {
    pub fn new(proc_id: ProcId, memb_id: MembershipId) -> Self {
        PacketHeader {
            routed: false,
            transmitter: proc_id,
            proc_id,
            memb_id,
            seq: 0,
            token_round: 0,
            packet_index: -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub body: Body,
}

impl Packet {
    pub fn is_data(&self) -> bool {
        match self.body {
            Body::Data { .. } => true,
            _ => false,
        }
    }

    pub fn service(&self) -> Option<Service> {
        match self.body {
            Body::Data { service, .. } => Some(service),
            _ => None,
        }
    }

    pub fn data(&self) -> Option<&Bytes> {
        match &self.body {
            Body::Data { bytes, .. } => Some(bytes),
            _ => None,
        }
    }

    /// A whole message in one packet, deliverable on arrival when reliable.
    pub fn is_single_fragment(&self) -> bool {
        self.header.packet_index == -1
    }

    pub fn is_last_fragment(&self) -> bool {
        self.header.packet_index < 0
    }
}
