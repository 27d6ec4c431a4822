//! Bounded member and representative lists, and the deterministic elections over them.

use crate::colored::Colorize;
use crate::conf::Configuration;
use crate::constants::{MAX_PROCS_RING, MAX_REPS};
use crate::proc_id::ProcId;
use crate::wire::{MemberList, Rep, RepKind, RepList};

use tracing::warn;

/// Adds a confirmed member. Returns whether the list changed.
pub fn insert_member(conf: &Configuration, members: &mut MemberList, id: ProcId) -> bool {
    if members.active().contains(&id) {
        return false;
    }
    if conf.lookup_process(id).is_none() {
        warn!("[{}] ignoring unknown member {}", "memb".magenta(), id);
        return false;
    }
    if members.len() >= MAX_PROCS_RING {
        warn!("[{}] member list full, ignoring {}", "memb".magenta(), id);
        return false;
    }
    members.ids.insert(members.active, id);
    members.active += 1;
    true
}

/// Adds a representative, merging it with what is already known about its segment:
///
/// * a potential rep is only kept for a segment nobody else represents yet
/// * a seg or ring rep replaces the potential rep of its segment
/// * a ring rep that lost its ring becomes a seg rep, and the other way around
pub fn insert_rep(conf: &Configuration, reps: &mut RepList, rep: Rep) -> bool {
    let seg_index = match conf.segment_of(rep.proc_id) {
        Some(seg_index) => seg_index as u16,
        None => {
            warn!("[{}] ignoring unknown representative {}", "memb".magenta(), rep.proc_id);
            return false;
        }
    };
    let rep = Rep { seg_index, ..rep };
    for known in reps.reps.iter_mut().filter(|r| r.seg_index == seg_index) {
        match (rep.kind, known.kind) {
            (RepKind::Potential, _) => return false,
            (_, RepKind::Potential) => {
                *known = rep;
                return true;
            }
            (RepKind::Seg, RepKind::Seg) | (RepKind::Ring, RepKind::Ring) if known.proc_id == rep.proc_id => {
                return false
            }
            (RepKind::Seg, RepKind::Ring) | (RepKind::Ring, RepKind::Seg) if known.proc_id == rep.proc_id => {
                known.kind = rep.kind;
                return true;
            }
            _ => (),
        }
    }
    if reps.len() >= MAX_REPS {
        warn!("[{}] representative list full, ignoring {}", "memb".magenta(), rep.proc_id);
        return false;
    }
    reps.reps.push(rep);
    true
}

/// The smallest confirmed member in configuration order.
pub fn smallest_member(conf: &Configuration, members: &MemberList) -> Option<ProcId> {
    conf.smallest(members.active().iter().cloned())
}

// Seg reps come first, then ring reps, then potential ones; each ordered by position.
fn rep_order(conf: &Configuration, rep: &Rep) -> (u8, u16, usize) {
    let index = conf.lookup_process(rep.proc_id).map(|p| p.index_in_seg).unwrap_or(usize::MAX);
    match rep.kind {
        RepKind::Seg => (0, rep.seg_index, index),
        RepKind::Ring => (1, rep.seg_index, index),
        RepKind::Potential => (2, rep.seg_index, index),
    }
}

/// The representative that creates the FORM1 token.
pub fn smallest_rep(conf: &Configuration, reps: &RepList) -> Option<Rep> {
    reps.reps.iter().min_by_key(|rep| rep_order(conf, rep)).cloned()
}

/// Orders reps the way the FORM1 token visits them.
pub fn sort_reps(conf: &Configuration, reps: &mut RepList) {
    reps.reps.sort_by_key(|rep| rep_order(conf, rep));
}

/// Orders members in configuration order, the order the new ring's token takes.
pub fn sort_members(conf: &Configuration, members: &mut MemberList) {
    members.ids.sort_by_key(|id| conf.ordered_position(*id));
    // unknown ids sort first as `None`; they are rejected before a FORM2 is accepted
}
