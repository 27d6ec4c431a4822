use super::{insert_member, insert_rep, smallest_rep, State};

use crate::colored::Colorize;
use crate::engine::Engine;
use crate::proc_id::ProcId;
use crate::timers::TimerKind;
use crate::wire::{Body, Form1, Form2, MemberList, Packet, PacketHeader, Rep, RepKind, RepList, TokenHeader};
use crate::Result;

use tracing::{debug, warn};

impl Engine {
    pub(crate) fn handle_alive(&mut self, from: ProcId, _members: MemberList) -> Result<()> {
        match self.memb.state {
            State::Op => {
                if self.memb.membership.contains(from) {
                    debug!("[{}] ALIVE from ring member {}", "memb".magenta(), from);
                    self.token_loss()?;
                    insert_member(&self.conf, &mut self.memb.f_members, from);
                }
            }
            State::Seg => {
                insert_member(&self.conf, &mut self.memb.f_members, from);
            }
            State::Represented => {
                self.schedule(TimerKind::ShiftToSeg, self.timeouts.rep);
            }
            State::Gather => {
                if !self.memb.token_alive {
                    insert_member(&self.conf, &mut self.memb.f_members, from);
                } else if self.memb.membership.contains(from) {
                    self.token_loss()?;
                    insert_member(&self.conf, &mut self.memb.f_members, from);
                }
            }
            State::Form => (),
            State::Evs => {
                if self.memb.future.contains(from) {
                    self.token_loss()?;
                    insert_member(&self.conf, &mut self.memb.f_members, from);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn handle_join(&mut self, from: ProcId, _members: MemberList, reps: RepList) -> Result<()> {
        let rep = match reps.reps.first() {
            Some(rep) => *rep,
            None => {
                debug!("[{}] JOIN without representative from {}", "memb".magenta(), from);
                return Ok(());
            }
        };
        let rep_seg = match self.conf.segment_of(rep.proc_id) {
            Some(seg_index) => seg_index,
            None => {
                warn!("[{}] JOIN for unknown representative {}", "memb".magenta(), rep.proc_id);
                return Ok(());
            }
        };
        match self.memb.state {
            State::Op => {
                if self.memb.membership.contains(from) {
                    // a single segment is announced with JOINs that reach the ring too
                    if self.conf.num_segments() > 1 {
                        self.token_loss()?;
                    }
                } else if self.is_ring_leader() {
                    debug!("[{}] JOIN from {}, gathering", "memb".magenta(), from);
                    self.memb.potential_reps.clear();
                    insert_rep(&self.conf, &mut self.memb.potential_reps, rep);
                    self.memb.f_members = MemberList::new();
                    self.shift_to_gather()?;
                } else if rep_seg != self.my_seg || self.network.is_segment_leader() {
                    if let Some(leader) = self.memb.membership.leader_of() {
                        let seg_index = self.conf.segment_of(leader).unwrap_or(self.my_seg) as u16;
                        self.send_refer(from, Rep { proc_id: leader, kind: RepKind::Ring, seg_index })?;
                    }
                }
            }
            State::Seg => {
                if rep_seg == self.my_seg && rep.kind == RepKind::Seg {
                    self.memb.my_seg_rep = Some(from);
                    self.shift_to_represented();
                    self.scast_alive(false)?;
                }
            }
            State::Represented => {
                if rep_seg == self.my_seg && rep.kind == RepKind::Seg {
                    self.memb.my_seg_rep = Some(from);
                    self.schedule(TimerKind::ShiftToSeg, self.timeouts.rep);
                    self.scast_alive(false)?;
                } else if let Some(seg_rep) = self.memb.my_seg_rep {
                    let refer = Rep { proc_id: seg_rep, kind: RepKind::Seg, seg_index: self.my_seg as u16 };
                    self.send_refer(from, refer)?;
                }
            }
            State::Gather => {
                insert_rep(&self.conf, &mut self.memb.f_reps, rep);
                let me = self.me;
                for other in reps.reps.iter().filter(|r| r.proc_id != me) {
                    insert_rep(&self.conf, &mut self.memb.potential_reps, *other);
                }
                if smallest_rep(&self.conf, &self.memb.f_reps).map(|r| r.proc_id) == Some(rep.proc_id) {
                    // give the smallest rep a full period to send FORM1
                    self.schedule(TimerKind::FormOrFail, self.timeouts.gather);
                }
            }
            State::Form => (),
            State::Evs => {
                if self.memb.future.contains(from) {
                    self.token_loss()?;
                    insert_member(&self.conf, &mut self.memb.f_members, from);
                }
            }
        }
        Ok(())
    }

    fn send_refer(&mut self, to: ProcId, rep: Rep) -> Result<()> {
        debug!("[{}] referring {} to {}", "memb".magenta(), to, rep.proc_id);
        let packet = Packet { header: PacketHeader::new(self.me, self.memb.membership_id), body: Body::Refer(rep) };
        self.network.unicast(to, &packet)?;
        Ok(())
    }

    pub(crate) fn handle_refer(&mut self, from: ProcId, rep: Rep) -> Result<()> {
        if self.memb.state != State::Gather || rep.proc_id == self.me {
            return Ok(());
        }
        debug!("[{}] {} refers to {:?} rep {}", "memb".magenta(), from, rep.kind, rep.proc_id);
        insert_rep(&self.conf, &mut self.memb.potential_reps, rep);
        Ok(())
    }

    /// Data of another ring: some daemon is reachable but not in my ring.
    pub(crate) fn handle_foreign(&mut self, packet: Packet) -> Result<()> {
        if self.memb.state != State::Op {
            return Ok(());
        }
        let from = packet.header.proc_id;
        if self.conf.lookup_process(from).is_none() {
            warn!("[{}] foreign packet from unknown daemon {}", "memb".magenta(), from);
            return Ok(());
        }
        if self.is_ring_leader() {
            debug!("[{}] foreign packet from {} of ring {}", "memb".magenta(), from, packet.header.memb_id);
            self.lookup_new_members()
        } else if self.network.is_segment_leader() && !self.memb.foreign_found {
            self.memb.foreign_found = true;
            if let Some(leader) = self.memb.membership.leader_of() {
                debug!("[{}] forwarding foreign packet from {} to {}", "memb".magenta(), from, leader);
                self.network.unicast(leader, &packet)?;
                self.network.unicast(leader, &packet)?;
            }
            Ok(())
        } else {
            Ok(())
        }
    }

    pub(crate) fn handle_form1(&mut self, header: TokenHeader, form: Form1) -> Result<()> {
        match self.memb.state {
            State::Op if self.is_ring_leader() => {
                debug!("[{}] ring leader swallowing FORM1 of {}", "memb".magenta(), header.memb_id);
                Ok(())
            }
            State::Op | State::Represented | State::Gather => self.fill_form1(header, form),
            state => {
                debug!("[{}] FORM1 swallowed in {}", "memb".magenta(), state);
                Ok(())
            }
        }
    }

    pub(crate) fn handle_form2(&mut self, header: TokenHeader, form: Form2) -> Result<()> {
        if self.memb.state != State::Form {
            debug!("[{}] FORM2 swallowed in {}", "memb".magenta(), self.memb.state);
            return Ok(());
        }
        self.read_form2(header, form)
    }
}
