//! Timer wheel for the protocol timeouts.
//!
//! Each kind of timer is pending at most once. Scheduling a pending kind moves its deadline,
//! and a transition that supersedes a state cancels the timers guarding it explicitly.

use priority_queue::PriorityQueue;
use tokio::time::{Duration, Instant};

use std::cmp::Reverse;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// No token seen for too long
    TokenLoss,
    /// The leader re-sends its last token
    TokenHurry,
    /// Re-broadcast the ALIVE announcement while in SEG
    ScastAlive,
    /// End of the SEG probing period
    GatherOrRepresented,
    /// The representative followed in REPRESENTED went quiet
    ShiftToSeg,
    /// Re-send JOIN while in GATHER
    SendJoin,
    /// End of the GATHER period
    FormOrFail,
    /// The ring leader looks for daemons outside the ring
    LookupNewMembers,
}

#[derive(Debug, Default)]
pub struct Timers {
    queue: PriorityQueue<TimerKind, Reverse<(Instant, u64)>>,
    sequence: u64,
}

impl Timers {
    pub fn new() -> Self {
        Timers { queue: PriorityQueue::new(), sequence: 0 }
    }

    /// Arms `kind` to fire at `at`, replacing any pending deadline.
    pub fn schedule(&mut self, kind: TimerKind, at: Instant) {
        self.sequence += 1;
        self.queue.push(kind, Reverse((at, self.sequence)));
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        let _ = self.queue.remove(&kind);
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn is_scheduled(&self, kind: TimerKind) -> bool {
        self.queue.get_priority(&kind).is_some()
    }

    pub fn deadline(&self, kind: TimerKind) -> Option<Instant> {
        self.queue.get_priority(&kind).map(|Reverse((at, _))| *at)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.peek().map(|(_, Reverse((at, _)))| *at)
    }

    /// Removes and returns the earliest timer due at `now`, if any. Timers due at the same
    /// instant fire in the order they were scheduled.
    pub fn pop_expired(&mut self, now: Instant) -> Option<TimerKind> {
        match self.next_deadline() {
            Some(at) if at <= now => self.queue.pop().map(|(kind, _)| kind),
            _ => None,
        }
    }
}

/// Membership timeouts. Either all are configured or the defaults for the network are used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    pub token: Duration,
    pub hurry: Duration,
    pub alive: Duration,
    pub join: Duration,
    pub rep: Duration,
    pub seg: Duration,
    pub gather: Duration,
    pub form: Duration,
    pub lookup: Duration,
}

impl Timeouts {
    /// Defaults for daemons sharing a local network.
    pub fn local() -> Self {
        Timeouts {
            token: Duration::from_millis(1250),
            hurry: Duration::from_millis(500),
            alive: Duration::from_millis(250),
            join: Duration::from_millis(250),
            rep: Duration::from_millis(625),
            seg: Duration::from_millis(500),
            gather: Duration::from_millis(1250),
            form: Duration::from_millis(1250),
            lookup: Duration::from_secs(30),
        }
    }

    /// Defaults when segments are far apart.
    pub fn wide() -> Self {
        Timeouts {
            token: Duration::from_secs(5),
            hurry: Duration::from_millis(1500),
            alive: Duration::from_millis(250),
            join: Duration::from_millis(250),
            rep: Duration::from_millis(1250),
            seg: Duration::from_millis(500),
            gather: Duration::from_millis(2500),
            form: Duration::from_millis(2500),
            lookup: Duration::from_secs(45),
        }
    }

    pub fn for_network(wide: bool) -> Self {
        if wide {
            Timeouts::wide()
        } else {
            Timeouts::local()
        }
    }
}
