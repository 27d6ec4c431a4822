//! Mechanical fan-out of packets and tokens onto datagrams.
//!
//! The network layer turns ring-level addressing (whole ring, one segment, one daemon, ring
//! successor) into the minimum set of physical sends, stamps the configuration hash, and on
//! receipt rejects traffic from daemons configured differently. It knows which daemons are
//! present but nothing about membership rules.

use crate::colored::Colorize;
use crate::conf::{Configuration, MembershipView};
use crate::constants::MAX_PACKET_SIZE;
use crate::proc_id::ProcId;
use crate::wire::{self, Packet, Token};
use crate::{Error, Result};

use bytes::Bytes;
use tracing::{debug, warn};

use std::net::SocketAddr;
use std::sync::Arc;

/// One physical send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub to: SocketAddr,
    pub bytes: Bytes,
}

pub struct Network {
    conf: Arc<Configuration>,
    me: ProcId,
    my_seg: usize,
    /// More than one daemon is configured in my segment
    bcast_needed: bool,
    /// First present daemon of every other segment
    remote_leaders: Vec<ProcId>,
    segment_leader: bool,
    token_next: Option<ProcId>,
    token_prev: Option<ProcId>,
    /// Present daemons, used to route segment casts
    membership: MembershipView,
    pending: Vec<Packet>,
    pending_len: usize,
    outbox: Vec<Datagram>,
}

impl Network {
    pub fn new(conf: Arc<Configuration>, me: ProcId) -> Result<Self> {
        let proc = conf.lookup_process(me).ok_or(Error::UnknownProc(me))?;
        let my_seg = proc.seg_index;
        let bcast_needed = conf.segment(my_seg).procs.len() > 1;
        let membership = MembershipView::singleton(&conf, me)?;
        let mut network = Network {
            conf,
            me,
            my_seg,
            bcast_needed,
            remote_leaders: vec![],
            segment_leader: true,
            token_next: None,
            token_prev: None,
            membership: membership.clone(),
            pending: vec![],
            pending_len: 0,
            outbox: vec![],
        };
        network.set_membership(&membership);
        Ok(network)
    }

    /// Recomputes every physical route from the daemons now present.
    pub fn set_membership(&mut self, view: &MembershipView) {
        self.membership = view.clone();
        self.remote_leaders = (0..self.conf.num_segments())
            .filter(|seg| *seg != self.my_seg)
            .filter_map(|seg| view.segment_leader(seg))
            .collect();
        self.segment_leader = view.segment_leader(self.my_seg) == Some(self.me);
        self.token_next = view.successor(self.me);
        self.token_prev = view.predecessor(self.me);
        debug!(
            "[{}] routes: bcast={} remote={:?} next={:?} prev={:?}",
            "net".cyan(),
            self.bcast_needed,
            self.remote_leaders,
            self.token_next,
            self.token_prev
        );
    }

    pub fn bcast_needed(&self) -> bool {
        self.bcast_needed
    }

    pub fn is_segment_leader(&self) -> bool {
        self.segment_leader
    }

    pub fn token_next(&self) -> Option<ProcId> {
        self.token_next
    }

    /// The daemon regular tokens are expected from.
    pub fn token_prev(&self) -> Option<ProcId> {
        self.token_prev
    }

    pub fn conf_hash(&self) -> u32 {
        self.conf.hash()
    }

    /// Sends to every daemon of the ring: a routed unicast to each remote segment leader and
    /// a local broadcast. Returns whether anything was put on the wire.
    pub fn broadcast(&mut self, packet: &Packet) -> Result<bool> {
        self.fan_out(std::slice::from_ref(packet))
    }

    /// Batches data packets into as few datagrams as fit `MAX_PACKET_SIZE`. Returns whether a
    /// full batch was sent to make room.
    pub fn queue_broadcast(&mut self, packet: Packet) -> Result<bool> {
        let len = wire::packed_len(&packet);
        let mut sent = false;
        if !self.pending.is_empty() && self.pending_len + len > MAX_PACKET_SIZE {
            sent = self.flush_broadcast()?;
        }
        self.pending_len += len;
        self.pending.push(packet);
        Ok(sent)
    }

    pub fn flush_broadcast(&mut self) -> Result<bool> {
        if self.pending.is_empty() {
            return Ok(false);
        }
        let packets = std::mem::replace(&mut self.pending, vec![]);
        self.pending_len = 0;
        self.fan_out(&packets)
    }

    fn fan_out(&mut self, packets: &[Packet]) -> Result<bool> {
        let mut sent = false;
        if !self.remote_leaders.is_empty() {
            let routed = self.stamp(packets, true)?;
            for leader in self.remote_leaders.clone() {
                sent |= self.push_unicast(leader, routed.clone());
            }
        }
        if self.bcast_needed {
            let local = self.stamp(packets, false)?;
            let to = self.conf.segment(self.my_seg).broadcast_addr();
            self.outbox.push(Datagram { to, bytes: local });
            sent = true;
        }
        // alone in the configuration: the packet reached everyone it could
        Ok(sent || (!self.bcast_needed && self.remote_leaders.is_empty()))
    }

    /// Sends to every daemon of one segment.
    pub fn segment_cast(&mut self, seg_index: usize, packet: &Packet) -> Result<bool> {
        if seg_index == self.my_seg {
            if !self.bcast_needed {
                return Ok(false);
            }
            let bytes = self.stamp(std::slice::from_ref(packet), false)?;
            let to = self.conf.segment(self.my_seg).broadcast_addr();
            self.outbox.push(Datagram { to, bytes });
            return Ok(true);
        }
        match self.membership.segment_leader(seg_index) {
            Some(leader) => {
                let bytes = self.stamp(std::slice::from_ref(packet), true)?;
                Ok(self.push_unicast(leader, bytes))
            }
            None => Ok(false),
        }
    }

    pub fn unicast(&mut self, proc_id: ProcId, packet: &Packet) -> Result<bool> {
        let bytes = self.stamp(std::slice::from_ref(packet), false)?;
        Ok(self.push_unicast(proc_id, bytes))
    }

    fn push_unicast(&mut self, proc_id: ProcId, bytes: Bytes) -> bool {
        match self.conf.unicast_addr(proc_id) {
            Some(to) => {
                self.outbox.push(Datagram { to, bytes });
                true
            }
            None => {
                warn!("[{}] unicast to unknown daemon {}", "net".cyan(), proc_id);
                false
            }
        }
    }

    fn stamp(&self, packets: &[Packet], routed: bool) -> Result<Bytes> {
        let stamped: Vec<Packet> = packets
            .iter()
            .cloned()
            .map(|mut p| {
                p.header.routed = routed;
                p.header.transmitter = self.me;
                p
            })
            .collect();
        Ok(wire::encode_datagram(&stamped, self.conf.hash())?)
    }

    /// Sends the token to the ring successor.
    pub fn send_token(&mut self, token: &Token) -> Result<bool> {
        match self.token_next {
            Some(next) => self.unicast_token(next, token),
            None => {
                warn!("[{}] no successor to pass the token to", "net".cyan());
                Ok(false)
            }
        }
    }

    pub fn unicast_token(&mut self, proc_id: ProcId, token: &Token) -> Result<bool> {
        let mut token = token.clone();
        token.header.transmitter = self.me;
        let bytes = match wire::encode_token(&token, self.conf.hash()) {
            Ok(bytes) => bytes,
            Err(wire::Error::TooLarge(len)) => return Err(Error::TokenOverflow(len)),
            Err(e) => return Err(Error::Wire(e)),
        };
        if bytes.len() > MAX_PACKET_SIZE {
            warn!("[{}] token of {} bytes exceeds one datagram", "net".cyan(), bytes.len());
        }
        match self.conf.token_addr(proc_id) {
            Some(to) => {
                self.outbox.push(Datagram { to, bytes });
                Ok(true)
            }
            None => {
                warn!("[{}] token to unknown daemon {}", "net".cyan(), proc_id);
                Ok(false)
            }
        }
    }

    /// Decodes and validates a broadcast-channel datagram. Routed packets are re-broadcast on
    /// this segment first.
    pub fn recv_packets(&mut self, bytes: &[u8]) -> Option<Vec<Packet>> {
        let stamped = match wire::decode_datagram(bytes) {
            Ok(stamped) => stamped,
            Err(e) => {
                warn!("[{}] malformed datagram: {:?}", "net".cyan(), e);
                debug!("[{}] {}", "net".cyan(), hex::encode(&bytes[..bytes.len().min(64)]));
                return None;
            }
        };
        if stamped.conf_hash != self.conf.hash() {
            warn!(
                "[{}] configuration hash mismatch ({:08x} != {:08x}), dropping",
                "net".cyan(),
                stamped.conf_hash,
                self.conf.hash()
            );
            return None;
        }
        let mut packets = stamped.inner;
        if packets.iter().any(|p| p.header.transmitter == self.me) {
            return None;
        }
        if packets.iter().any(|p| p.header.routed) {
            for p in packets.iter_mut() {
                p.header.routed = false;
            }
            if self.bcast_needed {
                match self.stamp(&packets, false) {
                    Ok(local) => {
                        let to = self.conf.segment(self.my_seg).broadcast_addr();
                        self.outbox.push(Datagram { to, bytes: local });
                    }
                    Err(e) => warn!("[{}] could not forward routed packets: {:?}", "net".cyan(), e),
                }
            }
        }
        Some(packets)
    }

    pub fn recv_token(&self, bytes: &[u8]) -> Option<Token> {
        let stamped = match wire::decode_token(bytes) {
            Ok(stamped) => stamped,
            Err(e) => {
                warn!("[{}] malformed token: {:?}", "net".cyan(), e);
                debug!("[{}] {}", "net".cyan(), hex::encode(&bytes[..bytes.len().min(64)]));
                return None;
            }
        };
        if stamped.conf_hash != self.conf.hash() {
            warn!("[{}] token with configuration hash {:08x}, dropping", "net".cyan(), stamped.conf_hash);
            return None;
        }
        Some(stamped.inner)
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    /// Takes the datagrams queued after position `mark`.
    pub fn split_outbox(&mut self, mark: usize) -> Vec<Datagram> {
        self.outbox.split_off(mark.min(self.outbox.len()))
    }

    pub fn extend_outbox(&mut self, datagrams: Vec<Datagram>) {
        self.outbox.extend(datagrams);
    }

    pub fn drain(&mut self) -> Vec<Datagram> {
        std::mem::replace(&mut self.outbox, vec![])
    }
}
