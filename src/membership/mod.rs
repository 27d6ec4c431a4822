//! Daemon membership: detects token loss, gathers the reachable daemons, forms a new ring
//! with FORM1/FORM2 tokens and installs it through extended virtual synchrony.
//!
//! The state lives in `Membership`; the transitions are `impl Engine` blocks since every
//! one of them also drives the network, the timers and the packet store.

mod form;
mod handlers;
mod reps;
mod transitions;

pub use reps::{insert_member, insert_rep, smallest_member, smallest_rep, sort_members, sort_reps};

use crate::conf::{Configuration, MembershipView};
use crate::proc_id::ProcId;
use crate::wire::{MemberList, MembershipId, RepList};
use crate::Result;

use derive_more::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum State {
    /// Installed ring, token circulating
    #[display(fmt = "OP")]
    Op,
    /// Token lost, probing the local segment
    #[display(fmt = "SEG")]
    Seg,
    /// Following another daemon of the segment who gathers on our behalf
    #[display(fmt = "REPRESENTED")]
    Represented,
    /// Collecting representatives of other segments and rings
    #[display(fmt = "GATHER")]
    Gather,
    /// A FORM1 token is travelling
    #[display(fmt = "FORM")]
    Form,
    /// The new ring recovers the messages of the old rings before it is installed
    #[display(fmt = "EVS")]
    Evs,
}

#[derive(Debug)]
pub struct Membership {
    pub state: State,
    /// A regular token of my ring is expected
    pub token_alive: bool,
    /// The installed ring
    pub membership: MembershipView,
    pub membership_id: MembershipId,
    /// The ring being installed while in EVS
    pub future: MembershipView,
    pub future_id: MembershipId,
    /// Last regular view delivered
    pub reg_membership: MembershipView,
    pub trans_membership: MembershipView,
    pub trans_memb_id: MembershipId,
    /// Daemons of my old ring that take part in the new one, with those of the transitional
    /// view in front
    pub commit_membership: MembershipView,
    pub commit_set: MemberList,
    pub future_commit_set: MemberList,
    pub future_trans_time: u32,
    /// Daemons of my segment gathered while probing
    pub f_members: MemberList,
    /// Representatives gathered while in GATHER
    pub f_reps: RepList,
    /// Representatives to solicit with JOIN
    pub potential_reps: RepList,
    pub my_seg_rep: Option<ProcId>,
    /// Identifier of the last FORM1 token filled, which a FORM2 must carry
    pub form1_memb_id: MembershipId,
    /// A foreign packet was already forwarded to the ring leader
    pub foreign_found: bool,
    /// Logical time used for the last membership identifier
    pub last_time_used: u32,
    /// The transitional view was delivered and the regular one is pending
    pub transitional: bool,
}

impl Membership {
    pub fn new(conf: &Configuration, me: ProcId) -> Result<Self> {
        let singleton = MembershipView::singleton(conf, me)?;
        let initial_id = MembershipId::new(me, 0);
        Ok(Membership {
            state: State::Op,
            token_alive: false,
            membership: singleton.clone(),
            membership_id: initial_id,
            future: singleton.clone(),
            future_id: initial_id,
            reg_membership: singleton.clone(),
            trans_membership: singleton.clone(),
            trans_memb_id: initial_id,
            commit_membership: singleton,
            commit_set: MemberList::from_active(vec![me]),
            future_commit_set: MemberList::from_active(vec![me]),
            future_trans_time: 0,
            f_members: MemberList::from_active(vec![me]),
            f_reps: RepList::new(),
            potential_reps: RepList::new(),
            my_seg_rep: None,
            form1_memb_id: MembershipId::default(),
            foreign_found: false,
            last_time_used: 0,
            transitional: false,
        })
    }

    /// The view the token is expected to circulate in.
    pub fn active(&self) -> &MembershipView {
        if self.state == State::Evs {
            &self.future
        } else {
            &self.membership
        }
    }

    pub fn active_id(&self) -> MembershipId {
        if self.state == State::Evs {
            self.future_id
        } else {
            self.membership_id
        }
    }

    /// Members of the transitional view: the old ring's daemons that already visited the form
    /// tokens.
    pub fn commit_trans(&self) -> &[ProcId] {
        self.commit_set.active()
    }
}
