//! Ring formation: the FORM1 token collects members and the recovery state of every old
//! ring, the FORM2 token installs the result on each member and seeds the first regular token.

use super::{insert_rep, sort_members, sort_reps, State};

use crate::colored::Colorize;
use crate::conf::MembershipView;
use crate::constants::{FORM_SEQ_GAP, MAX_FORM_RINGS, MAX_PROCS_RING, MAX_SEQ_GAP};
use crate::engine::Engine;
use crate::proc_id::ProcId;
use crate::timers::TimerKind;
use crate::wire::{
    Form1, Form2, MemberList, MembershipId, Rep, RepKind, RingInfo, Seq, Token, TokenBody, TokenHeader,
};
use crate::Result;

use tracing::{debug, info, warn};

impl Engine {
    /// Started by the smallest representative at the end of GATHER.
    pub(crate) fn create_form1(&mut self) -> Result<()> {
        let form_id = MembershipId::new(self.me, self.next_memb_time());
        self.memb.form1_memb_id = form_id;

        let mut header = TokenHeader::blank(self.me);
        header.memb_id = form_id;
        header.seq = self.prot.highest_seq + FORM_SEQ_GAP;

        let ring_rep = self.memb.f_reps.reps.first().map(|rep| rep.kind) == Some(RepKind::Ring);
        let gathered = if ring_rep { self.memb.membership.members() } else { self.memb.f_members.active().to_vec() };
        let rep_ids: Vec<ProcId> = self.memb.f_reps.reps.iter().map(|rep| rep.proc_id).collect();
        let mut members = MemberList::from_active(vec![self.me]);
        for id in gathered {
            // other representatives announce their own daemons
            if id != self.me && !rep_ids.contains(&id) && !members.contains(id) {
                members.ids.push(id);
            }
        }
        members.ids.truncate(MAX_PROCS_RING);

        let mut reps = self.memb.f_reps.clone();
        sort_reps(&self.conf, &mut reps);
        reps.index = 1;
        self.memb.potential_reps.clear();
        let my_seg = self.my_seg;
        for rep in reps.reps.iter().filter(|rep| rep.seg_index as usize != my_seg) {
            let potential = Rep { kind: RepKind::Potential, ..*rep };
            insert_rep(&self.conf, &mut self.memb.potential_reps, potential);
        }

        let mut commit = vec![self.me];
        commit.extend(self.memb.commit_set.ids.iter().filter(|id| **id != self.me));
        let ring = RingInfo {
            memb_id: self.memb.membership_id,
            trans_time: 0,
            aru: self.prot.aru,
            highest_seq: self.prot.highest_seq,
            holes: self.prot.missing_from(self.prot.my_aru, usize::MAX),
            commit,
            num_trans: 1,
        };

        let next = members.next_pending().or_else(|| reps.reps.get(reps.index).map(|rep| rep.proc_id));
        let (to, token) = match next {
            Some(next) => (next, Token { header, body: TokenBody::Form1(Form1 { members, reps, rings: vec![ring] }) }),
            None => {
                // nobody else to visit: install a ring of one
                let members = MemberList { ids: vec![self.me], active: 0 };
                let form = Form2 { members, memb_id: MembershipId::default(), rings: vec![ring] };
                (self.me, Token { header, body: TokenBody::Form2(form) })
            }
        };
        info!("[{}] sending FORM1 {} to {}", "memb".magenta(), form_id, to);
        self.network.unicast_token(to, &token)?;
        self.network.unicast_token(to, &token)?;
        self.shift_to_form();
        Ok(())
    }

    /// Adds this daemon (and, for a representative, the daemons it speaks for) to a FORM1 token
    /// and passes it on. The last visit turns it into a FORM2.
    pub(crate) fn fill_form1(&mut self, mut header: TokenHeader, mut form: Form1) -> Result<()> {
        let state = self.memb.state;
        if state == State::Gather {
            let expected = form.reps.reps.get(form.reps.index).cloned();
            let valid = match expected {
                Some(rep) => rep.proc_id == self.me && (rep.kind == RepKind::Ring) == self.memb.token_alive,
                None => false,
            };
            if !valid || form.members.num_pending() > 0 || form.members.contains(self.me) {
                debug!("[{}] FORM1 {} not for me as a representative", "memb".magenta(), header.memb_id);
                return Ok(());
            }
            let ring_rep = expected.map(|rep| rep.kind) == Some(RepKind::Ring);
            let candidates =
                if ring_rep { self.memb.membership.members() } else { self.memb.f_members.active().to_vec() };
            let token_reps: Vec<ProcId> = form.reps.reps.iter().map(|rep| rep.proc_id).collect();
            let my_reps: Vec<ProcId> = self.memb.f_reps.reps.iter().map(|rep| rep.proc_id).collect();
            let mut joining = vec![self.me];
            for id in candidates {
                if id != self.me
                    && !form.members.contains(id)
                    && !token_reps.contains(&id)
                    && !my_reps.contains(&id)
                    && !joining.contains(&id)
                {
                    joining.push(id);
                }
            }
            if form.members.len() + joining.len() > MAX_PROCS_RING {
                warn!("[{}] FORM1 {} has no room for {} more daemons", "memb".magenta(), header.memb_id, joining.len());
                return Ok(());
            }
            form.members.ids.extend(joining);
            form.members.active += 1;
            form.reps.index += 1;
        } else {
            if form.members.next_pending() != Some(self.me) {
                debug!("[{}] FORM1 {} not addressed to me", "memb".magenta(), header.memb_id);
                return Ok(());
            }
            form.members.active += 1;
        }

        header.seq = header.seq.max(self.prot.highest_seq + FORM_SEQ_GAP);
        header.proc_id = self.me;
        self.memb.form1_memb_id = header.memb_id;

        self.memb.potential_reps.clear();
        let my_seg = self.my_seg;
        for rep in form.reps.reps.iter().filter(|rep| rep.seg_index as usize != my_seg) {
            let potential = Rep { kind: RepKind::Potential, ..*rep };
            insert_rep(&self.conf, &mut self.memb.potential_reps, potential);
        }

        if !self.merge_ring_info(&mut form) {
            return Ok(());
        }

        let next = form.members.next_pending().or_else(|| form.reps.reps.get(form.reps.index).map(|rep| rep.proc_id));
        let (to, token) = match next {
            Some(next) => (next, Token { header, body: TokenBody::Form1(form) }),
            None => {
                let Form1 { mut members, rings, .. } = form;
                sort_members(&self.conf, &mut members);
                members.active = 0;
                let first = match members.ids.first() {
                    Some(first) => *first,
                    None => {
                        warn!("[{}] FORM1 {} ended without members", "memb".magenta(), header.memb_id);
                        return Ok(());
                    }
                };
                let form = Form2 { members, memb_id: MembershipId::default(), rings };
                (first, Token { header, body: TokenBody::Form2(form) })
            }
        };
        debug!("[{}] passing {} token {} to {}", "memb".magenta(), kind_name(&token), token.header.memb_id, to);
        self.network.unicast_token(to, &token)?;
        self.network.unicast_token(to, &token)?;
        self.shift_to_form();
        Ok(())
    }

    /// Folds my view of my old ring into the token. Returns false when the token must be dropped.
    fn merge_ring_info(&mut self, form: &mut Form1) -> bool {
        let my_ring = self.memb.membership_id;
        let at = form.rings.iter().position(|ring| ring.memb_id == my_ring);
        let mut ring = match at {
            Some(at) => form.rings.remove(at),
            None => {
                if form.rings.len() + 1 > MAX_FORM_RINGS {
                    warn!("[{}] too many rings on FORM1, leaving it", "memb".magenta());
                    if let Some(pos) = form.members.ids.iter().position(|id| *id == self.me) {
                        form.members.ids.remove(pos);
                        if pos < form.members.active {
                            form.members.active -= 1;
                        }
                    }
                    return true;
                }
                let mut commit = vec![self.me];
                commit.extend(self.memb.commit_set.ids.iter().filter(|id| **id != self.me));
                form.rings.push(RingInfo {
                    memb_id: my_ring,
                    trans_time: 0,
                    aru: self.prot.aru,
                    highest_seq: self.prot.highest_seq,
                    holes: self.prot.missing_from(self.prot.my_aru, usize::MAX),
                    commit,
                    num_trans: 1,
                });
                return true;
            }
        };
        if ring.trans().contains(&self.me) {
            warn!("[{}] already visited FORM1 {}", "memb".magenta(), my_ring);
            return false;
        }

        // a hole stays one only if nobody visited so far has it
        let store = &self.prot.store;
        let mut holes: Vec<Seq> = ring.holes.iter().cloned().filter(|seq| !store.exists(*seq)).collect();
        if self.prot.highest_seq > ring.highest_seq {
            holes.extend((ring.highest_seq + 1..=self.prot.highest_seq).filter(|seq| !store.exists(*seq)));
        }
        let mut commit = ring.trans().to_vec();
        commit.push(self.me);
        let num_trans = commit.len();
        for id in ring.commit[ring.num_trans..].iter().chain(self.memb.commit_set.ids.iter()) {
            if !commit.contains(id) {
                commit.push(*id);
            }
        }
        ring.aru = ring.aru.max(self.prot.aru);
        ring.highest_seq = ring.highest_seq.max(self.prot.highest_seq);
        ring.holes = holes;
        ring.commit = commit;
        ring.num_trans = num_trans;
        form.rings.push(ring);
        true
    }

    fn shift_to_form(&mut self) {
        for kind in &[
            TimerKind::SendJoin,
            TimerKind::FormOrFail,
            TimerKind::ShiftToSeg,
            TimerKind::ScastAlive,
            TimerKind::GatherOrRepresented,
            TimerKind::TokenHurry,
            TimerKind::LookupNewMembers,
        ] {
            self.timers.cancel(*kind);
        }
        self.schedule(TimerKind::TokenLoss, self.timeouts.form);
        self.memb.token_alive = false;
        self.memb.state = State::Form;
    }

    /// Installs the ring announced by FORM2 as the future membership and enters EVS.
    pub(crate) fn read_form2(&mut self, mut header: TokenHeader, mut form: Form2) -> Result<()> {
        if header.memb_id != self.memb.form1_memb_id {
            warn!(
                "[{}] FORM2 of {} does not match FORM1 {}",
                "memb".magenta(),
                header.memb_id,
                self.memb.form1_memb_id
            );
            return Ok(());
        }
        if form.members.next_pending() != Some(self.me) || form.members.len() > MAX_PROCS_RING {
            warn!("[{}] FORM2 {} not addressed to me", "memb".magenta(), header.memb_id);
            return Ok(());
        }
        let malformed = form.rings.iter().any(|ring| {
            ring.num_trans == 0
                || ring.num_trans > ring.commit.len()
                || ring.commit.len() > MAX_PROCS_RING
                || ring.holes.len() > MAX_SEQ_GAP
        });
        if malformed {
            warn!("[{}] FORM2 {} carries malformed ring info", "memb".magenta(), header.memb_id);
            return Ok(());
        }
        let my_ring = match form.rings.iter().position(|ring| ring.memb_id == self.memb.membership_id) {
            Some(at) => at,
            None => {
                warn!("[{}] FORM2 {} lacks my ring {}", "memb".magenta(), header.memb_id, self.memb.membership_id);
                return Ok(());
            }
        };
        let future = match MembershipView::from_ids(&self.conf, form.members.ids.iter().cloned()) {
            Ok(view) => view,
            Err(e) => {
                warn!("[{}] FORM2 {} names an unknown daemon: {}", "memb".magenta(), header.memb_id, e);
                return Ok(());
            }
        };

        form.members.active += 1;
        let mut trans_time = None;
        if form.members.active == 1 {
            trans_time = Some(self.next_memb_time());
            form.memb_id = MembershipId::new(self.me, self.next_memb_time());
        }
        self.prot.last_seq = header.seq;
        header.proc_id = self.me;

        self.memb.future_id = form.memb_id;
        self.memb.future = future;
        self.network.set_membership(&self.memb.future);
        self.flow.new_configuration();

        let ring = &form.rings[my_ring];
        let (ring_aru, ring_highest, holes) = (ring.aru, ring.highest_seq, ring.holes.clone());
        self.memb.future_commit_set = MemberList { ids: ring.commit.clone(), active: ring.num_trans };
        if self.prot.highest_seq < ring_highest {
            self.prot.highest_seq = ring_highest;
        }
        if self.prot.aru < ring_aru {
            self.prot.aru = ring_aru;
        }
        self.discard_packets()?;
        for seq in holes {
            if let Some(dropped) = self.prot.store.mark_hole(seq) {
                warn!("[{}] dropping packet {} from {} marked as a hole", "memb".magenta(), seq, dropped.header.proc_id);
            }
        }
        self.prot.advance_my_aru();

        if form.rings[my_ring].trans_time == 0 {
            let time = match trans_time {
                Some(time) => time,
                None => self.next_memb_time(),
            };
            form.rings[my_ring].trans_time = time;
        }
        self.memb.future_trans_time = form.rings[my_ring].trans_time;

        if self.memb.future.last_of() != Some(self.me) {
            let token = Token { header, body: TokenBody::Form2(form) };
            self.network.send_token(&token)?;
            self.network.send_token(&token)?;
            self.prot.token_rounds = 0;
        } else {
            let mut first = TokenHeader::blank(self.me);
            first.memb_id = self.memb.future_id;
            first.aru = Seq::MAX;
            let token = Token { header: first, body: TokenBody::Regular(vec![]) };
            self.network.send_token(&token)?;
            self.network.send_token(&token)?;
            self.prot.token_rounds = 1;
        }

        self.memb.token_alive = true;
        self.schedule(TimerKind::TokenLoss, self.timeouts.token);
        self.prot.forget_last_token();
        self.prot.aru = 0;
        self.prot.set_aru = None;
        self.memb.state = State::Evs;
        info!(
            "[{}] state {} for ring {} {:?}",
            "memb".magenta(),
            State::Evs,
            self.memb.future_id,
            self.memb.future.members()
        );
        Ok(())
    }
}

fn kind_name(token: &Token) -> &'static str {
    match token.body {
        TokenBody::Regular(_) => "regular",
        TokenBody::Form1(_) => "FORM1",
        TokenBody::Form2(_) => "FORM2",
    }
}
