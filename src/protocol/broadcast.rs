use crate::colored::Colorize;
use crate::constants::PACKET_STORE_SIZE;
use crate::engine::Engine;
use crate::timers::TimerKind;
use crate::wire::{Body, Packet};
use crate::Result;

use tracing::{debug, warn};

impl Engine {
    /// Dispatches one packet received on the broadcast channel.
    pub(crate) fn receive_packet(&mut self, packet: Packet) -> Result<()> {
        let Packet { header, body } = packet;
        match body {
            Body::Alive(members) => self.handle_alive(header.proc_id, members),
            Body::Join { members, reps } => self.handle_join(header.proc_id, members, reps),
            Body::Refer(rep) => self.handle_refer(header.proc_id, rep),
            Body::Hurry => self.handle_hurry(header.proc_id),
            body => {
                let packet = Packet { header, body };
                if packet.header.memb_id != self.memb.membership_id {
                    self.handle_foreign(packet)
                } else {
                    self.receive_data(packet)
                }
            }
        }
    }

    fn receive_data(&mut self, packet: Packet) -> Result<()> {
        if self.memb.token_alive {
            self.schedule(TimerKind::TokenLoss, self.timeouts.token);
            if self.is_ring_leader() {
                self.schedule(TimerKind::TokenHurry, self.timeouts.hurry);
            }
        }

        let seq = packet.header.seq;
        if seq <= self.prot.aru.max(self.prot.last_discarded) {
            debug!("[{}] delayed packet {} (aru {})", "prot".yellow(), seq, self.prot.aru);
            return Ok(());
        }
        if (seq - self.prot.last_discarded) as usize > PACKET_STORE_SIZE {
            warn!(
                "[{}] packet {} is beyond the store window (discarded up to {})",
                "prot".yellow(),
                seq,
                self.prot.last_discarded
            );
            return Ok(());
        }
        if self.prot.store.exists(seq) {
            debug!("[{}] packet {} already exists", "prot".yellow(), seq);
            return Ok(());
        }
        if self.conf.lookup_process(packet.header.proc_id).is_none() {
            warn!("[{}] packet {} from unknown daemon {}", "prot".yellow(), seq, packet.header.proc_id);
            return Ok(());
        }

        self.prot.store.insert(packet)?;
        self.counters.packets_received += 1;
        if self.prot.highest_seq < seq {
            self.prot.highest_seq = seq;
        }
        if seq == self.prot.my_aru + 1 {
            self.prot.advance_my_aru();
            self.deliver_agreed()
        } else {
            self.deliver_reliable(seq, 1)
        }
    }
}
