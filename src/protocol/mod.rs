//! Packet store, watermarks and the ordered delivery rules of one ring.
//!
//! The `Protocol` struct holds the state; the handlers that move packets and tokens live in
//! `impl Engine` blocks in the submodules since they also drive the network and membership.

mod broadcast;
mod delivery;
pub mod queues;
pub mod store;
mod token;

use crate::proc_id::ProcId;
use crate::wire::{Seq, TokenHeader};

use queues::{DownQueue, UpQueue};
use store::PacketStore;

#[derive(Debug)]
pub struct Protocol {
    pub store: PacketStore,
    pub down_queue: DownQueue,
    pub up_queue: UpQueue,
    /// Highest sequence number seen on a packet or token of the ring
    pub highest_seq: Seq,
    /// Every packet up to here is present locally
    pub my_aru: Seq,
    /// Every packet up to here is present at every member of the ring
    pub aru: Seq,
    /// The token aru this daemon lowered on its previous visit, if it is still lowering it
    pub set_aru: Option<Seq>,
    pub last_discarded: Seq,
    pub last_delivered: Seq,
    /// Sequence number of the FORM2 token; the local aru is raised to it once EVS has
    /// recovered everything
    pub last_seq: Seq,
    /// The last regular token this daemon sent
    pub last_token: TokenHeader,
    /// Consecutive rounds in which the ring had nothing new to order
    pub token_counter: u32,
    pub token_rounds: u32,
}

impl Protocol {
    pub fn new(me: ProcId) -> Self {
        Protocol {
            store: PacketStore::new(),
            down_queue: DownQueue::new(),
            up_queue: UpQueue::new(),
            highest_seq: 0,
            my_aru: 0,
            aru: 0,
            set_aru: None,
            last_discarded: 0,
            last_delivered: 0,
            last_seq: 0,
            last_token: TokenHeader::blank(me),
            token_counter: 0,
            token_rounds: 0,
        }
    }

    /// Raises `my_aru` over every contiguous packet present.
    pub fn advance_my_aru(&mut self) {
        while self.my_aru < self.highest_seq && self.store.exists(self.my_aru + 1) {
            self.my_aru += 1;
        }
    }

    /// Up to `limit` sequence numbers above `from` that are not present.
    pub fn missing_from(&self, from: Seq, limit: usize) -> Vec<Seq> {
        if from >= self.highest_seq {
            return vec![];
        }
        (from + 1..=self.highest_seq).filter(|seq| !self.store.exists(*seq)).take(limit).collect()
    }

    /// Forgets the last token, so that the next token of any ring is accepted.
    pub fn forget_last_token(&mut self) {
        self.last_token.seq = 0;
        self.last_token.aru = 0;
        self.last_token.arq = 0;
        self.last_token.retrans = 0;
    }

    /// Starts the sequence space of a freshly installed ring.
    pub fn start_ring(&mut self) {
        self.last_token.aru = 0;
        self.highest_seq = 0;
        self.my_aru = 0;
        self.aru = 0;
        self.set_aru = None;
        self.last_discarded = 0;
        self.last_delivered = 0;
        self.token_counter = 0;
    }

    /// Undoes the hole placeholders of a ring that failed in EVS and recomputes the
    /// watermarks of the old ring.
    pub fn backoff(&mut self) {
        let mut seq = self.last_discarded + 1;
        while seq <= self.highest_seq {
            self.store.revert_hole(seq);
            seq += 1;
        }
        self.aru = self.last_discarded;
        self.my_aru = self.last_discarded;
        self.advance_my_aru();
    }
}
