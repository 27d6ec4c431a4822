use super::{insert_rep, smallest_member, smallest_rep, State};

use crate::colored::Colorize;
use crate::conf::MembershipView;
use crate::engine::Engine;
use crate::proc_id::ProcId;
use crate::timers::TimerKind;
use crate::wire::{Body, MemberList, MembershipId, Packet, PacketHeader, Rep, RepKind};
use crate::{Error, Result};

use tracing::{debug, info, warn};

impl Engine {
    /// The token of my ring is gone: remember who to solicit, drop back to my segment and
    /// start probing it.
    pub(crate) fn token_loss(&mut self) -> Result<()> {
        let state = self.memb.state;
        match state {
            State::Seg | State::Represented => {
                return Err(Error::InvalidState { operation: "token_loss", state });
            }
            State::Op => {
                self.memb.potential_reps.clear();
                let view = self.memb.membership.clone();
                self.add_potential_reps(&view);
            }
            State::Gather => {
                if !self.memb.token_alive {
                    return Err(Error::InvalidState { operation: "token_loss", state });
                }
                let gathered: Vec<Rep> = self.memb.f_reps.reps.iter().skip(1).cloned().collect();
                self.memb.potential_reps.clear();
                for rep in gathered {
                    insert_rep(&self.conf, &mut self.memb.potential_reps, rep);
                }
                let view = self.memb.membership.clone();
                self.add_potential_reps(&view);
            }
            State::Form => (),
            State::Evs => {
                self.backoff_membership();
                self.memb.potential_reps.clear();
                let view = self.memb.future.clone();
                self.add_potential_reps(&view);
            }
        }

        self.memb.token_alive = false;
        self.memb.transitional = false;
        for kind in &[
            TimerKind::TokenLoss,
            TimerKind::SendJoin,
            TimerKind::FormOrFail,
            TimerKind::TokenHurry,
            TimerKind::LookupNewMembers,
        ] {
            self.timers.cancel(*kind);
        }
        self.prot.forget_last_token();
        // routes stay as they were until a new ring is installed
        self.memb.membership = MembershipView::singleton(&self.conf, self.me)?;
        self.counters.token_losses += 1;
        warn!("[{}] token lost in {}, probing segment {}", "memb".magenta(), state, self.my_seg);
        self.shift_to_seg()
    }

    /// Adds, for every other segment, the daemon most likely to represent it.
    fn add_potential_reps(&mut self, view: &MembershipView) {
        for seg_index in 0..self.conf.num_segments() {
            if seg_index == self.my_seg {
                continue;
            }
            let candidate = view
                .segment_leader(seg_index)
                .or_else(|| self.conf.segment(seg_index).procs.first().map(|p| p.id));
            if let Some(proc_id) = candidate {
                let rep = Rep { proc_id, kind: RepKind::Potential, seg_index: seg_index as u16 };
                insert_rep(&self.conf, &mut self.memb.potential_reps, rep);
            }
        }
    }

    pub(crate) fn shift_to_seg(&mut self) -> Result<()> {
        self.memb.state = State::Seg;
        self.memb.f_members = MemberList::from_active(vec![self.me]);
        self.memb.my_seg_rep = None;
        self.timers.cancel(TimerKind::ShiftToSeg);
        self.schedule(TimerKind::GatherOrRepresented, self.timeouts.seg);
        debug!("[{}] state {}", "memb".magenta(), State::Seg);
        self.scast_alive(true)
    }

    /// End of the probing period: the smallest daemon heard from gathers for the segment.
    pub(crate) fn gather_or_represented(&mut self) -> Result<()> {
        if self.memb.state != State::Seg {
            return Ok(());
        }
        if smallest_member(&self.conf, &self.memb.f_members) == Some(self.me) {
            self.shift_to_gather()
        } else {
            self.shift_to_represented();
            Ok(())
        }
    }

    pub(crate) fn shift_to_gather(&mut self) -> Result<()> {
        self.memb.state = State::Gather;
        let kind = if self.memb.token_alive { RepKind::Ring } else { RepKind::Seg };
        self.memb.f_reps.clear();
        let me = Rep { proc_id: self.me, kind, seg_index: self.my_seg as u16 };
        insert_rep(&self.conf, &mut self.memb.f_reps, me);
        for kind in &[
            TimerKind::ScastAlive,
            TimerKind::GatherOrRepresented,
            TimerKind::ShiftToSeg,
            TimerKind::LookupNewMembers,
        ] {
            self.timers.cancel(*kind);
        }
        self.schedule(TimerKind::FormOrFail, self.timeouts.gather);
        debug!(
            "[{}] state {} as {:?} rep, soliciting {} reps",
            "memb".magenta(),
            State::Gather,
            kind,
            self.memb.potential_reps.len()
        );
        self.send_join()
    }

    pub(crate) fn shift_to_represented(&mut self) {
        self.memb.state = State::Represented;
        self.timers.cancel(TimerKind::ScastAlive);
        self.timers.cancel(TimerKind::GatherOrRepresented);
        self.schedule(TimerKind::ShiftToSeg, self.timeouts.rep);
        debug!("[{}] state {}, rep {:?}", "memb".magenta(), State::Represented, self.memb.my_seg_rep);
    }

    /// Back to normal operation after gathering on behalf of a ring whose token never stopped.
    pub(crate) fn shift_to_op(&mut self) {
        self.timers.cancel(TimerKind::SendJoin);
        self.timers.cancel(TimerKind::FormOrFail);
        self.memb.state = State::Op;
        self.memb.f_reps.clear();
        if self.is_ring_leader() {
            self.schedule(TimerKind::LookupNewMembers, self.timeouts.lookup);
        }
        debug!("[{}] state {}", "memb".magenta(), State::Op);
    }

    /// End of the gathering period. The smallest representative starts the FORM1 token;
    /// the others wait for it and gather again if it never came.
    pub(crate) fn form_or_fail(&mut self) -> Result<()> {
        if self.memb.state != State::Gather {
            return Ok(());
        }
        let smallest = smallest_rep(&self.conf, &self.memb.f_reps).map(|rep| rep.proc_id);
        if smallest == Some(self.me) {
            if self.memb.token_alive && self.memb.f_reps.len() == 1 {
                debug!("[{}] nobody answered, keeping my ring", "memb".magenta());
                self.shift_to_op();
                Ok(())
            } else {
                self.create_form1()
            }
        } else if self.memb.token_alive {
            self.shift_to_op();
            Ok(())
        } else {
            debug!("[{}] no FORM1 from {:?}, gathering again", "memb".magenta(), smallest);
            let gathered: Vec<Rep> = self.memb.f_reps.reps.iter().skip(1).cloned().collect();
            for rep in gathered {
                insert_rep(&self.conf, &mut self.memb.potential_reps, rep);
            }
            self.memb.f_members = MemberList::from_active(vec![self.me]);
            self.shift_to_gather()
        }
    }

    /// Announces the daemons gathered so far on my segment.
    pub(crate) fn scast_alive(&mut self, reschedule: bool) -> Result<()> {
        let packet = Packet {
            header: PacketHeader::new(self.me, self.memb.membership_id),
            body: Body::Alive(self.memb.f_members.clone()),
        };
        self.network.segment_cast(self.my_seg, &packet)?;
        if reschedule {
            self.schedule(TimerKind::ScastAlive, self.timeouts.alive);
        }
        Ok(())
    }

    pub(crate) fn send_join(&mut self) -> Result<()> {
        let packet = Packet {
            header: PacketHeader::new(self.me, self.memb.membership_id),
            body: Body::Join { members: self.memb.f_members.clone(), reps: self.memb.f_reps.clone() },
        };
        if !self.memb.token_alive {
            self.network.segment_cast(self.my_seg, &packet)?;
        }
        let targets: Vec<ProcId> =
            self.memb.potential_reps.reps.iter().map(|rep| rep.proc_id).filter(|id| *id != self.me).collect();
        for proc_id in targets {
            self.network.unicast(proc_id, &packet)?;
        }
        self.schedule(TimerKind::SendJoin, self.timeouts.join);
        Ok(())
    }

    /// The ring leader periodically solicits configured daemons that are not in the ring.
    pub(crate) fn lookup_new_members(&mut self) -> Result<()> {
        if self.memb.state != State::Op {
            return Ok(());
        }
        let absent: Vec<ProcId> =
            self.conf.procs().map(|p| p.id).filter(|id| !self.memb.reg_membership.contains(*id)).collect();
        if absent.is_empty() {
            self.schedule(TimerKind::LookupNewMembers, self.timeouts.lookup);
            return Ok(());
        }

        self.memb.potential_reps.clear();
        self.memb.f_reps.clear();
        let me = Rep { proc_id: self.me, kind: RepKind::Ring, seg_index: self.my_seg as u16 };
        insert_rep(&self.conf, &mut self.memb.f_reps, me);
        self.memb.f_members = MemberList::new();
        let packet = Packet {
            header: PacketHeader::new(self.me, self.memb.membership_id),
            body: Body::Join { members: self.memb.f_members.clone(), reps: self.memb.f_reps.clone() },
        };

        let mut solicited = false;
        if self.conf.num_segments() == 1 {
            solicited = self.network.segment_cast(self.my_seg, &packet)?;
        } else {
            for proc_id in absent {
                solicited |= self.network.unicast(proc_id, &packet)?;
            }
        }
        if solicited {
            debug!("[{}] looking up new members", "memb".magenta());
            self.shift_to_gather()
        } else {
            self.schedule(TimerKind::LookupNewMembers, self.timeouts.lookup);
            Ok(())
        }
    }

    /// The ring being installed failed in EVS: undo its holes.
    pub(crate) fn backoff_membership(&mut self) {
        debug!("[{}] backing off ring {}", "memb".magenta(), self.memb.future_id);
        self.prot.backoff();
    }

    /// Every packet of my old ring is here; members of the new ring now know I will deliver
    /// the transitional view.
    pub(crate) fn commit(&mut self) {
        self.memb.commit_set = self.memb.future_commit_set.clone();
    }

    /// Computes the transitional view: the daemons of my old ring that move on with me.
    pub(crate) fn transitional(&mut self) -> Result<()> {
        self.memb.transitional = true;
        let trans = self.memb.commit_trans().to_vec();
        self.memb.trans_membership = MembershipView::from_ids(&self.conf, trans)?;
        let leader = self.memb.trans_membership.leader_of().unwrap_or(self.me);
        self.memb.trans_memb_id = MembershipId::new(leader, self.memb.future_trans_time);
        let commit = self.memb.commit_set.ids.clone();
        self.memb.commit_membership = MembershipView::from_ids(&self.conf, commit)?;
        info!(
            "[{}] transitional membership {} {:?}",
            "memb".magenta(),
            self.memb.trans_memb_id,
            self.memb.trans_membership.members()
        );
        Ok(())
    }

    /// Installs the new ring.
    pub(crate) fn regular(&mut self) -> Result<()> {
        self.memb.membership = self.memb.future.clone();
        self.memb.membership_id = self.memb.future_id;
        self.memb.last_time_used = self.memb.last_time_used.max(self.memb.membership_id.time);
        self.memb.reg_membership = self.memb.membership.clone();
        self.memb.commit_set = MemberList::from_active(vec![self.me]);
        self.memb.transitional = false;
        self.memb.foreign_found = false;
        self.memb.f_reps.clear();
        self.memb.potential_reps.clear();
        self.memb.state = State::Op;
        self.counters.membership_changes += 1;
        if self.is_ring_leader() {
            self.schedule(TimerKind::LookupNewMembers, self.timeouts.lookup);
        }
        info!(
            "[{}] regular membership {} {:?}",
            "memb".magenta(),
            self.memb.membership_id,
            self.memb.reg_membership.members()
        );
        Ok(())
    }
}
