//! Structures exchanged while a ring is being formed.

use super::{MembershipId, Seq};

use crate::proc_id::ProcId;

/// A list of daemons: the first `active` are confirmed, the rest are pending.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemberList {
    pub ids: Vec<ProcId>,
    pub active: usize,
}

impl MemberList {
    pub fn new() -> Self {
        MemberList { ids: vec![], active: 0 }
    }

    /// A list in which every entry is active.
    pub fn from_active(ids: Vec<ProcId>) -> Self {
        let active = ids.len();
        MemberList { ids, active }
    }

    pub fn active(&self) -> &[ProcId] {
        &self.ids[..self.active]
    }

    pub fn pending(&self) -> &[ProcId] {
        &self.ids[self.active..]
    }

    pub fn num_pending(&self) -> usize {
        self.ids.len() - self.active
    }

    /// The first pending daemon, which is the next hop of a FORM1 token.
    pub fn next_pending(&self) -> Option<ProcId> {
        self.ids.get(self.active).cloned()
    }

    pub fn contains(&self, id: ProcId) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepKind {
    /// A daemon that may turn out to be a representative
    Potential,
    /// Speaks for the daemons of its segment that lost their ring
    Seg,
    /// Speaks for a ring whose token is still alive
    Ring,
}

impl RepKind {
    pub fn to_wire(self) -> u16 {
        match self {
            RepKind::Potential => 0,
            RepKind::Seg => 1,
            RepKind::Ring => 2,
        }
    }

    pub fn from_wire(v: u16) -> Option<RepKind> {
        match v {
            0 => Some(RepKind::Potential),
            1 => Some(RepKind::Seg),
            2 => Some(RepKind::Ring),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rep {
    pub proc_id: ProcId,
    pub kind: RepKind,
    pub seg_index: u16,
}

/// Representatives known to a daemon. On a FORM1 token `index` is the next rep to visit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RepList {
    pub reps: Vec<Rep>,
    pub index: usize,
}

impl RepList {
    pub fn new() -> Self {
        RepList { reps: vec![], index: 0 }
    }

    pub fn len(&self) -> usize {
        self.reps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reps.is_empty()
    }

    pub fn clear(&mut self) {
        self.reps.clear();
        self.index = 0;
    }
}

/// Recovery state of one old ring, carried on FORM1/FORM2 tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingInfo {
    pub memb_id: MembershipId,
    /// Time of the transitional membership, assigned by the first daemon of the ring to see FORM2
    pub trans_time: u32,
    pub aru: Seq,
    pub highest_seq: Seq,
    /// Sequence numbers nobody in the ring has
    pub holes: Vec<Seq>,
    /// Daemons of the old ring taking part; the first `num_trans` have already been visited
    pub commit: Vec<ProcId>,
    pub num_trans: usize,
}

impl RingInfo {
    pub fn trans(&self) -> &[ProcId] {
        &self.commit[..self.num_trans]
    }
}
