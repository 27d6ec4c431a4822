use crate::colored::Colorize;
use crate::constants::{MAX_EVS_ROUNDS, MAX_TOKEN_BODY, MAX_WRAP_SEQUENCE_VALUE, PACKET_STORE_SIZE};
use crate::engine::Engine;
use crate::membership::State;
use crate::proc_id::ProcId;
use crate::timers::TimerKind;
use crate::wire::{
    self, Body, Packet, PacketHeader, RingRtr, Seq, Service, Token, TokenBody, TokenHeader, MAX_RETRANS,
    RING_RTR_FIXED,
};
use crate::{Error, Result};

use bytes::Bytes;
use tracing::{debug, error, warn};

/// Outcome of answering the retransmission requests found on a token.
struct Answered {
    num_retrans: usize,
    /// Requests of other rings, passed on untouched
    foreign: Vec<RingRtr>,
    /// Where my own requests may be answered, narrowed while others miss packets too
    proc_id: Option<ProcId>,
    seg_index: Option<u16>,
}

impl Engine {
    /// Processes a regular token: answers retransmissions, injects new packets within the flow
    /// control budget, updates the aru and passes the token on.
    pub(crate) fn receive_token(&mut self, mut header: TokenHeader, rtr: Vec<RingRtr>) -> Result<()> {
        if !self.memb.token_alive {
            debug!("[{}] token vetoed, ring not alive", "prot".yellow());
            return Ok(());
        }
        let evs = self.memb.state == State::Evs;
        if !evs && header.seq > MAX_WRAP_SEQUENCE_VALUE {
            warn!("[{}] token sequence {} near wrap, forcing a new ring", "prot".yellow(), header.seq);
            return Ok(());
        }
        if header.memb_id != self.active_id() {
            debug!("[{}] token of ring {} is not mine", "prot".yellow(), header.memb_id);
            return Ok(());
        }
        if Some(header.transmitter) != self.network.token_prev() {
            debug!("[{}] token from {} who is not my predecessor", "prot".yellow(), header.transmitter);
            return Ok(());
        }
        if !evs && header.aru > header.seq {
            // first rounds of a new ring still carry the aru of its EVS phase
            debug!("[{}] token aru {} above its seq {}, restarting the aru", "prot".yellow(), header.aru, header.seq);
            header.aru = header.seq;
            header.aru_last_id = None;
        }

        let leader = self.is_ring_leader();
        if leader {
            if header.arq != self.prot.last_token.arq {
                debug!(
                    "[{}] leader swallowing token arq={} retrans={} (last arq={})",
                    "prot".yellow(),
                    header.arq,
                    header.retrans,
                    self.prot.last_token.arq
                );
                return Ok(());
            }
        } else if header.arq == self.prot.last_token.arq {
            if header.retrans > self.prot.last_token.retrans {
                debug!("[{}] asked to resend token {} {}", "prot".yellow(), header.arq, header.retrans);
                self.prot.last_token.retrans = header.retrans;
                self.token_hurry()?;
            }
            return Ok(());
        } else if header.arq != self.prot.last_token.next_arq() {
            debug!(
                "[{}] swallowing outdated token arq={} (last arq={})",
                "prot".yellow(),
                header.arq,
                self.prot.last_token.arq
            );
            return Ok(());
        }

        if self.prot.highest_seq < header.seq {
            self.prot.highest_seq = header.seq;
        }

        let answered = self.answer_retrans(rtr)?;
        self.counters.retrans += answered.num_retrans as u64;

        let fresh_mark = self.network.outbox_len();
        let allowed = if evs { 0 } else { self.flow.allowed(header.flow_control, answered.num_retrans) };
        let num_sent = self.send_new_packets(allowed)?;
        header.flow_control = self.flow.update_counter(header.flow_control, answered.num_retrans, num_sent);

        self.prot.advance_my_aru();
        let mut rtr = answered.foreign;
        if self.prot.my_aru < self.prot.highest_seq {
            let used: usize = rtr.iter().map(wire::ring_rtr_len).sum();
            let budget = MAX_TOKEN_BODY.saturating_sub(used + RING_RTR_FIXED) / 4;
            if budget > 1 {
                let seqs = self.prot.missing_from(self.prot.my_aru, budget);
                rtr.push(RingRtr {
                    memb_id: self.memb.membership_id,
                    proc_id: answered.proc_id,
                    seg_index: answered.seg_index,
                    seqs,
                });
            }
        }

        if evs && self.prot.my_aru == self.prot.highest_seq {
            self.prot.my_aru = self.prot.last_seq;
            self.commit();
        }

        if Some(header.aru) == self.prot.set_aru
            || header.aru_last_id == Some(self.me)
            || header.aru == header.seq
        {
            header.aru = self.prot.my_aru;
            header.aru_last_id = Some(self.me);
            self.prot.set_aru =
                if self.prot.my_aru < self.prot.highest_seq { Some(self.prot.my_aru) } else { None };
        } else if header.aru > self.prot.my_aru {
            header.aru = self.prot.my_aru;
            header.aru_last_id = Some(self.me);
            self.prot.set_aru = Some(self.prot.my_aru);
        } else {
            self.prot.set_aru = None;
        }

        header.proc_id = self.me;
        if !evs {
            header.seq = self.prot.highest_seq;
        }
        if leader {
            header.arq = header.next_arq();
            header.retrans = 0;
        }

        // decided on the previous round's aru and counter
        let hold = leader && self.is_token_hold();
        let token = Token { header: header.clone(), body: TokenBody::Regular(rtr) };
        let fresh = self.network.split_outbox(fresh_mark);
        let fresh = if self.accelerated {
            fresh
        } else {
            self.network.extend_outbox(fresh);
            vec![]
        };
        if hold {
            debug!("[{}] ring idle, holding the token", "prot".yellow());
        } else {
            self.network.send_token(&token)?;
            if header.retrans > 1 {
                self.network.send_token(&token)?;
                self.network.send_token(&token)?;
            }
        }
        self.network.extend_outbox(fresh);

        self.prot.token_rounds += 1;
        self.counters.token_rounds += 1;
        if leader {
            self.schedule(TimerKind::TokenHurry, self.timeouts.hurry);
        }
        self.schedule(TimerKind::TokenLoss, self.timeouts.token);

        let new_aru = header.aru.min(self.prot.last_token.aru);
        if !evs && new_aru < self.prot.aru {
            warn!("[{}] ring aru went back from {} to {}", "prot".yellow(), self.prot.aru, new_aru);
            self.counters.aru_decreases += 1;
        }
        self.prot.aru = new_aru;
        if self.prot.highest_seq == self.prot.aru {
            self.prot.token_counter += 1;
        } else {
            self.prot.token_counter = 0;
        }
        self.prot.last_token = header;

        self.discard_packets()?;
        self.deliver_agreed()?;
        if num_sent > 0 {
            let first = (self.prot.highest_seq + 1).saturating_sub(num_sent as Seq);
            self.deliver_reliable(first, num_sent as Seq)?;
        }

        if self.memb.state == State::Evs && self.prot.token_rounds > MAX_EVS_ROUNDS {
            error!(
                "[{}] {} token rounds in EVS, giving up: aru={} my_aru={} highest={} discarded={} delivered={} last_seq={} last token={:?}",
                "prot".yellow(),
                self.prot.token_rounds,
                self.prot.aru,
                self.prot.my_aru,
                self.prot.highest_seq,
                self.prot.last_discarded,
                self.prot.last_delivered,
                self.prot.last_seq,
                self.prot.last_token
            );
            self.token_loss()?;
        }
        Ok(())
    }

    fn answer_retrans(&mut self, rtr: Vec<RingRtr>) -> Result<Answered> {
        let mut answered = Answered {
            num_retrans: 0,
            foreign: vec![],
            proc_id: Some(self.me),
            seg_index: Some(self.my_seg as u16),
        };
        for request in rtr {
            if request.memb_id != self.memb.membership_id {
                debug!("[{}] passing on requests of ring {}", "prot".yellow(), request.memb_id);
                answered.foreign.push(request);
                continue;
            }
            for seq in request.seqs.iter().cloned() {
                if seq < self.prot.aru {
                    return Err(Error::RetransBelowAru { seq, aru: self.prot.aru });
                }
                let packet = match self.prot.store.get(seq) {
                    Some(packet) => packet.clone(),
                    // nobody has it, the new ring agreed to skip it
                    None if self.prot.store.is_hole(seq) => continue,
                    None => {
                        answered.proc_id = None;
                        if request.seg_index != Some(self.my_seg as u16) {
                            answered.seg_index = None;
                        }
                        continue;
                    }
                };
                let sent = match (request.proc_id, request.seg_index) {
                    (Some(proc_id), _) => {
                        self.counters.retrans_unicast += 1;
                        self.network.unicast(proc_id, &packet)?
                    }
                    (None, Some(seg_index)) => {
                        self.counters.retrans_segment += 1;
                        self.network.segment_cast(seg_index as usize, &packet)?
                    }
                    (None, None) => {
                        self.counters.retrans_broadcast += 1;
                        self.network.queue_broadcast(packet)?;
                        true
                    }
                };
                if sent {
                    answered.num_retrans += 1;
                }
            }
        }
        self.network.flush_broadcast()?;
        Ok(answered)
    }

    fn send_new_packets(&mut self, allowed: usize) -> Result<usize> {
        let mut num_sent = 0;
        while num_sent < allowed {
            if (self.prot.highest_seq + 1 - self.prot.last_discarded) as usize > PACKET_STORE_SIZE {
                debug!("[{}] packet store full up to {}", "prot".yellow(), self.prot.highest_seq);
                break;
            }
            let (service, bytes, packet_index) = match self.prot.down_queue.next_fragment() {
                Some(fragment) => fragment,
                None => break,
            };
            self.prot.highest_seq += 1;
            let mut header = PacketHeader::new(self.me, self.memb.membership_id);
            header.seq = self.prot.highest_seq;
            header.token_round = self.prot.token_rounds;
            header.packet_index = packet_index;
            let packet = Packet { header, body: Body::Data { service, bytes } };
            self.prot.store.insert(packet.clone())?;
            self.network.queue_broadcast(packet)?;
            num_sent += 1;
        }
        self.network.flush_broadcast()?;
        self.counters.packets_sent += num_sent as u64;
        Ok(num_sent)
    }

    /// Re-sends the last token. The leader also raises its retransmission counter so the
    /// rest of the ring re-sends theirs.
    pub(crate) fn token_hurry(&mut self) -> Result<()> {
        if self.is_ring_leader() {
            self.prot.last_token.retrans = (self.prot.last_token.retrans + 1).min(MAX_RETRANS);
            self.schedule(TimerKind::TokenHurry, self.timeouts.hurry);
            self.counters.token_hurries += 1;
        }
        let token = Token { header: self.prot.last_token.clone(), body: TokenBody::Regular(vec![]) };
        self.network.send_token(&token)?;
        if self.wide && self.active_view().segment_last(self.my_seg) == Some(self.me) {
            // the next hop is in another segment
            self.network.send_token(&token)?;
        }
        if token.header.retrans > 1 {
            self.network.send_token(&token)?;
            self.network.send_token(&token)?;
        }
        debug!("[{}] token resent arq={} retrans={}", "prot".yellow(), token.header.arq, token.header.retrans);
        Ok(())
    }

    /// Whether the ring is idle enough for the leader to keep the token.
    pub(crate) fn is_token_hold(&self) -> bool {
        let state = self.memb.state;
        (state == State::Op || (state == State::Gather && self.memb.token_alive))
            && self.prot.last_token.retrans <= 1
            && self.prot.aru == self.prot.highest_seq
            && self.prot.token_counter > 1
    }

    /// A ring member has something to send while the leader may be holding the token.
    pub(crate) fn handle_hurry(&mut self, from: ProcId) -> Result<()> {
        if self.is_ring_leader() && self.is_token_hold() && self.active_view().contains(from) {
            debug!("[{}] hurried by {}, releasing the token", "prot".yellow(), from);
            self.prot.token_counter = 0;
            self.token_hurry()?;
        }
        Ok(())
    }

    /// Queues a locally submitted message for the next token visits.
    pub(crate) fn new_message(&mut self, service: Service, payload: Bytes) -> Result<()> {
        self.prot.down_queue.push(service, payload)?;
        if self.prot.down_queue.above_water_mark() {
            warn!("[{}] {} messages waiting for the token", "prot".yellow(), self.prot.down_queue.len());
        }
        if self.prot.down_queue.len() == 1 && self.is_token_hold() {
            match self.active_view().leader_of() {
                Some(leader) if leader == self.me => self.handle_hurry(self.me)?,
                Some(leader) => {
                    let packet =
                        Packet { header: PacketHeader::new(self.me, self.memb.membership_id), body: Body::Hurry };
                    self.network.unicast(leader, &packet)?;
                }
                None => (),
            }
        }
        Ok(())
    }
}
