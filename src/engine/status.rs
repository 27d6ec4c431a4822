use actix_derive::MessageResponse;
use crate::membership::State;
use crate::proc_id::ProcId;
use crate::wire::{MembershipId, Seq};

/// Running totals kept by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    /// New packets injected on token visits
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_delivered: u64,
    pub messages_delivered: u64,
    /// Retransmissions answered, whatever the route
    pub retrans: u64,
    pub retrans_unicast: u64,
    pub retrans_segment: u64,
    pub retrans_broadcast: u64,
    pub token_hurries: u64,
    pub token_rounds: u64,
    pub membership_changes: u64,
    pub token_losses: u64,
    /// Rounds in which the ring aru went back
    pub aru_decreases: u64,
}

/// A snapshot of the engine, answered to status queries and dumped on fatal errors.
#[derive(Debug, Clone, Serialize, Deserialize, MessageResponse)]
pub struct Status {
    pub me: ProcId,
    pub state: State,
    pub membership_id: MembershipId,
    pub members: Vec<ProcId>,
    pub highest_seq: Seq,
    pub aru: Seq,
    pub my_aru: Seq,
    pub last_discarded: Seq,
    pub last_delivered: Seq,
    pub down_queue: usize,
    pub stored: usize,
    pub counters: Counters,
}
