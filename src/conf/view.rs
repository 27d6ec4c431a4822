use super::configuration::Configuration;

use crate::proc_id::ProcId;
use crate::{Error, Result};

/// The subset of configured daemons currently present, kept per segment in configuration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipView {
    segments: Vec<Vec<ProcId>>,
}

impl MembershipView {
    pub fn empty(conf: &Configuration) -> Self {
        MembershipView { segments: vec![vec![]; conf.num_segments()] }
    }

    pub fn singleton(conf: &Configuration, id: ProcId) -> Result<Self> {
        let mut view = MembershipView::empty(conf);
        view.append(conf, id)?;
        Ok(view)
    }

    pub fn from_ids<I>(conf: &Configuration, ids: I) -> Result<Self>
    where
        I: IntoIterator<Item = ProcId>,
    {
        let mut view = MembershipView::empty(conf);
        for id in ids {
            view.append(conf, id)?;
        }
        Ok(view)
    }

    /// Adds `id` at its configuration position. Adding a present daemon is a no-op.
    pub fn append(&mut self, conf: &Configuration, id: ProcId) -> Result<()> {
        let pos = conf.ordered_position(id).ok_or(Error::UnknownProc(id))?;
        let seg = &mut self.segments[pos.seg_index];
        if seg.contains(&id) {
            return Ok(());
        }
        let at = seg
            .iter()
            .position(|other| conf.ordered_position(*other).map(|p| p.index > pos.index).unwrap_or(false))
            .unwrap_or(seg.len());
        seg.insert(at, id);
        Ok(())
    }

    pub fn clear(&mut self) {
        for seg in self.segments.iter_mut() {
            seg.clear();
        }
    }

    pub fn contains(&self, id: ProcId) -> bool {
        self.segments.iter().any(|s| s.contains(&id))
    }

    pub fn num_procs(&self) -> usize {
        self.segments.iter().map(|s| s.len()).sum()
    }

    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }

    pub fn segment(&self, seg_index: usize) -> &[ProcId] {
        self.segments.get(seg_index).map(|s| s.as_slice()).unwrap_or(&[])
    }

    /// The first present daemon in configuration order.
    pub fn leader_of(&self) -> Option<ProcId> {
        self.ring_order().next()
    }

    /// The last present daemon in configuration order.
    pub fn last_of(&self) -> Option<ProcId> {
        self.segments.iter().rev().find_map(|s| s.last().cloned())
    }

    pub fn segment_leader(&self, seg_index: usize) -> Option<ProcId> {
        self.segment(seg_index).first().cloned()
    }

    pub fn segment_last(&self, seg_index: usize) -> Option<ProcId> {
        self.segment(seg_index).last().cloned()
    }

    /// Present daemons in the order the token visits them.
    pub fn ring_order(&self) -> impl Iterator<Item = ProcId> + '_ {
        self.segments.iter().flat_map(|s| s.iter().cloned())
    }

    pub fn members(&self) -> Vec<ProcId> {
        self.ring_order().collect()
    }

    /// The daemon after `id` on the ring, wrapping around.
    pub fn successor(&self, id: ProcId) -> Option<ProcId> {
        let ring = self.members();
        let at = ring.iter().position(|p| *p == id)?;
        Some(ring[(at + 1) % ring.len()])
    }

    /// The daemon before `id` on the ring, wrapping around.
    pub fn predecessor(&self, id: ProcId) -> Option<ProcId> {
        let ring = self.members();
        let at = ring.iter().position(|p| *p == id)?;
        Some(ring[(at + ring.len() - 1) % ring.len()])
    }
}
