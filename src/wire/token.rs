use super::{MemberList, MembershipId, RepList, RingInfo, Seq};

use crate::proc_id::ProcId;

/// Number of distinct ARQ values before they wrap.
pub const ARQ_MODULUS: u8 = 16;
/// The retransmission counter saturates at this value.
pub const MAX_RETRANS: u8 = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenHeader {
    pub transmitter: ProcId,
    pub seq: Seq,
    pub proc_id: ProcId,
    pub memb_id: MembershipId,
    pub aru: Seq,
    /// The daemon that last lowered `aru`
    pub aru_last_id: Option<ProcId>,
    /// Packets injected during the last rotation, as tracked by flow control
    pub flow_control: i16,
    /// Round identifier, incremented by the leader, used to discard stale copies
    pub arq: u8,
    /// How many times the current copy has been re-sent by a hurry
    pub retrans: u8,
}

impl TokenHeader {
    /// The blank token a daemon remembers before it has seen any token of a ring.
    pub fn blank(me: ProcId) -> Self {
        TokenHeader {
            transmitter: me,
            seq: 0,
            proc_id: me,
            memb_id: MembershipId::default(),
            aru: 0,
            aru_last_id: None,
            flow_control: 0,
            arq: 0,
            retrans: 0,
        }
    }

    pub fn next_arq(&self) -> u8 {
        (self.arq + 1) % ARQ_MODULUS
    }
}

/// Retransmission requests of one ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingRtr {
    pub memb_id: MembershipId,
    /// Answer by unicast to this daemon, when only it is known to miss the packets
    pub proc_id: Option<ProcId>,
    /// Answer by segment cast to this segment, when only it is known to miss the packets
    pub seg_index: Option<u16>,
    pub seqs: Vec<Seq>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Form1 {
    pub members: MemberList,
    pub reps: RepList,
    pub rings: Vec<RingInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Form2 {
    pub members: MemberList,
    /// Identifier of the ring being installed
    pub memb_id: MembershipId,
    pub rings: Vec<RingInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenBody {
    Regular(Vec<RingRtr>),
    Form1(Form1),
    Form2(Form2),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub header: TokenHeader,
    pub body: TokenBody,
}

impl Token {
    pub fn is_form(&self) -> bool {
        match self.body {
            TokenBody::Regular(_) => false,
            _ => true,
        }
    }
}
