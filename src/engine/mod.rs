//! The synchronous core of a daemon.
//!
//! `Engine` owns the protocol and membership state, the network fan-out layer, flow control
//! and the timer wheel. Every entry point takes the current instant, runs to completion and
//! leaves outbound datagrams and deliveries behind for the driver to drain, so the same engine
//! runs inside the daemon actor and inside the deterministic test cluster.

mod delivery;
mod status;

#[cfg(test)]
mod tests;

pub use delivery::Delivery;
pub use status::{Counters, Status};

use crate::colored::Colorize;
use crate::conf::{Configuration, MembershipView};
use crate::constants::{DEFAULT_PERSONAL_WINDOW, DEFAULT_WINDOW};
use crate::flow_control::FlowControl;
use crate::membership::{Membership, State};
use crate::network::{Datagram, Network};
use crate::proc_id::ProcId;
use crate::protocol::Protocol;
use crate::timers::{TimerKind, Timeouts, Timers};
use crate::wire::{Body, MemberList, MembershipId, Packet, PacketHeader, Rep, RepKind, RepList, Service};
use crate::wire::{Token, TokenBody, TokenHeader};
use crate::{Error, Result};

use bytes::Bytes;
use tokio::time::{Duration, Instant};
use tracing::{debug, info};

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// The socket a datagram arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Broadcast,
    Token,
}

/// Which channel the driver should read first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    BroadcastFirst,
    TokenFirst,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub window: i32,
    pub personal_window: i32,
    /// Overrides the defaults picked for the network
    pub timeouts: Option<Timeouts>,
    /// Overrides the address prefix heuristic
    pub wide_network: Option<bool>,
    pub accelerated_ring: Option<bool>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            window: DEFAULT_WINDOW,
            personal_window: DEFAULT_PERSONAL_WINDOW,
            timeouts: None,
            wide_network: None,
            accelerated_ring: None,
        }
    }
}

pub struct Engine {
    pub(crate) conf: Arc<Configuration>,
    pub(crate) me: ProcId,
    pub(crate) my_seg: usize,
    pub(crate) timeouts: Timeouts,
    pub(crate) timers: Timers,
    pub(crate) network: Network,
    pub(crate) flow: FlowControl,
    pub(crate) prot: Protocol,
    pub(crate) memb: Membership,
    pub(crate) deliveries: Vec<Delivery>,
    pub(crate) counters: Counters,
    pub(crate) wide: bool,
    /// The token is forwarded before new broadcasts and the read priority follows the ring
    pub(crate) accelerated: bool,
    pub(crate) now: Instant,
}

impl Engine {
    pub fn new(conf: Arc<Configuration>, me: ProcId, options: EngineOptions) -> Result<Self> {
        let my_seg = conf.segment_of(me).ok_or(Error::UnknownProc(me))?;
        let wide = options.wide_network.unwrap_or_else(|| conf.is_wide());
        let timeouts = options.timeouts.unwrap_or_else(|| Timeouts::for_network(wide));
        let accelerated = options.accelerated_ring.unwrap_or(true) && !wide;
        let network = Network::new(conf.clone(), me)?;
        let memb = Membership::new(&conf, me)?;
        info!(
            "[{}] daemon {} in segment {} ({} network, accelerated ring {})",
            "memb".magenta(),
            me,
            my_seg,
            if wide { "wide" } else { "local" },
            accelerated
        );
        Ok(Engine {
            conf,
            me,
            my_seg,
            timeouts,
            timers: Timers::new(),
            network,
            flow: FlowControl::new(options.window, options.personal_window),
            prot: Protocol::new(me),
            memb,
            deliveries: vec![],
            counters: Counters::default(),
            wide,
            accelerated,
            now: Instant::now(),
        })
    }

    /// Brings the daemon up. Alone in its segment configuration it installs a ring of one
    /// right away; otherwise it starts by probing its segment.
    pub fn start(&mut self, now: Instant) -> Result<()> {
        self.now = now;
        if self.conf.num_segments() == 1 {
            self.install_singleton()
        } else {
            self.token_loss()
        }
    }

    fn install_singleton(&mut self) -> Result<()> {
        let trans_time = self.next_memb_time();
        let memb_id = MembershipId::new(self.me, self.next_memb_time());
        let view = MembershipView::singleton(&self.conf, self.me)?;
        self.memb.membership = view.clone();
        self.memb.future = view.clone();
        self.memb.reg_membership = view.clone();
        self.memb.trans_membership = view.clone();
        self.memb.commit_membership = view.clone();
        self.memb.membership_id = memb_id;
        self.memb.future_id = memb_id;
        self.memb.trans_memb_id = MembershipId::new(self.me, trans_time);
        self.network.set_membership(&view);
        self.flow.new_configuration();

        self.deliveries.push(Delivery::Transitional { members: vec![self.me], memb_id: self.memb.trans_memb_id });
        self.deliveries.push(Delivery::Regular { members: vec![self.me], memb_id });
        self.counters.membership_changes += 1;
        self.memb.token_alive = true;
        self.memb.state = State::Op;
        self.prot.forget_last_token();
        info!("[{}] regular membership {} {:?}", "memb".magenta(), memb_id, view.members());

        let mut header = TokenHeader::blank(self.me);
        header.memb_id = memb_id;
        self.network.send_token(&Token { header, body: TokenBody::Regular(vec![]) })?;
        self.schedule(TimerKind::TokenLoss, self.timeouts.token);
        self.schedule(TimerKind::LookupNewMembers, self.timeouts.lookup);

        // daemons of the segment already up answer by gathering
        let mut reps = RepList::new();
        reps.reps.push(Rep { proc_id: self.me, kind: RepKind::Ring, seg_index: self.my_seg as u16 });
        let packet = Packet {
            header: PacketHeader::new(self.me, memb_id),
            body: Body::Join { members: MemberList::new(), reps },
        };
        self.network.segment_cast(self.my_seg, &packet)?;
        Ok(())
    }

    /// Processes one datagram read from `channel`.
    pub fn handle_datagram(&mut self, now: Instant, channel: Channel, bytes: &[u8]) -> Result<()> {
        self.now = now;
        match channel {
            Channel::Broadcast => {
                let packets = match self.network.recv_packets(bytes) {
                    Some(packets) => packets,
                    None => return Ok(()),
                };
                for packet in packets {
                    self.receive_packet(packet)?;
                }
                Ok(())
            }
            Channel::Token => {
                let Token { header, body } = match self.network.recv_token(bytes) {
                    Some(token) => token,
                    None => return Ok(()),
                };
                match body {
                    TokenBody::Regular(rtr) => self.receive_token(header, rtr),
                    TokenBody::Form1(form) => self.handle_form1(header, form),
                    TokenBody::Form2(form) => self.handle_form2(header, form),
                }
            }
        }
    }

    /// Queues a message from the layer above.
    pub fn submit(&mut self, now: Instant, service: Service, payload: Bytes) -> Result<()> {
        self.now = now;
        self.new_message(service, payload)
    }

    /// Fires every timer due at `now`.
    pub fn handle_timers(&mut self, now: Instant) -> Result<()> {
        self.now = now;
        while let Some(kind) = self.timers.pop_expired(now) {
            debug!("[{}] {:?} expired in {}", "memb".magenta(), kind, self.memb.state);
            match kind {
                TimerKind::TokenLoss => self.token_loss()?,
                TimerKind::TokenHurry => self.token_hurry()?,
                TimerKind::ScastAlive => self.scast_alive(true)?,
                TimerKind::GatherOrRepresented => self.gather_or_represented()?,
                TimerKind::ShiftToSeg => {
                    if self.memb.state == State::Represented {
                        self.shift_to_seg()?;
                    }
                }
                TimerKind::SendJoin => {
                    if self.memb.state == State::Gather {
                        self.send_join()?;
                    }
                }
                TimerKind::FormOrFail => self.form_or_fail()?,
                TimerKind::LookupNewMembers => self.lookup_new_members()?,
            }
        }
        Ok(())
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn drain_outbound(&mut self) -> Vec<Datagram> {
        self.network.drain()
    }

    pub fn drain_deliveries(&mut self) -> Vec<Delivery> {
        std::mem::replace(&mut self.deliveries, vec![])
    }

    /// With the accelerated ring, the token is read first unless the last token announced
    /// packets still on their way.
    pub fn priority(&self) -> Priority {
        if self.accelerated && self.prot.my_aru >= self.prot.highest_seq {
            Priority::TokenFirst
        } else {
            Priority::BroadcastFirst
        }
    }

    pub fn state(&self) -> State {
        self.memb.state
    }

    pub fn me(&self) -> ProcId {
        self.me
    }

    pub fn status(&self) -> Status {
        Status {
            me: self.me,
            state: self.memb.state,
            membership_id: self.memb.membership_id,
            members: self.memb.reg_membership.members(),
            highest_seq: self.prot.highest_seq,
            aru: self.prot.aru,
            my_aru: self.prot.my_aru,
            last_discarded: self.prot.last_discarded,
            last_delivered: self.prot.last_delivered,
            down_queue: self.prot.down_queue.len(),
            stored: self.prot.store.occupied(),
            counters: self.counters.clone(),
        }
    }

    pub(crate) fn schedule(&mut self, kind: TimerKind, after: Duration) {
        self.timers.schedule(kind, self.now + after);
    }

    pub(crate) fn active_view(&self) -> &MembershipView {
        self.memb.active()
    }

    pub(crate) fn active_id(&self) -> MembershipId {
        self.memb.active_id()
    }

    pub(crate) fn is_ring_leader(&self) -> bool {
        self.active_view().leader_of() == Some(self.me)
    }

    /// Logical time for a new membership identifier: wall clock seconds, strictly above the
    /// last time this daemon used.
    pub(crate) fn next_memb_time(&mut self) -> u32 {
        let wall = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as u32).unwrap_or(0);
        let time = wall.max(self.memb.last_time_used + 1);
        self.memb.last_time_used = time;
        time
    }
}
