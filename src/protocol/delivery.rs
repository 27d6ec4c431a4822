use super::store::Slot;

use crate::colored::Colorize;
use crate::engine::{Delivery, Engine};
use crate::membership::State;
use crate::wire::{Packet, Seq};
use crate::{Error, Result};

use tracing::{debug, info};

impl Engine {
    /// Hands one packet to reassembly, emitting the message once its last fragment is in.
    fn deliver(&mut self, packet: &Packet) -> Result<()> {
        self.counters.packets_delivered += 1;
        if let Some(message) = self.prot.up_queue.push(packet)? {
            self.counters.messages_delivered += 1;
            self.deliveries.push(Delivery::Message {
                sender: message.sender,
                service: message.service,
                payload: message.payload,
            });
        }
        Ok(())
    }

    /// Delivers reliable single-fragment packets among `count` packets starting at `start`,
    /// without waiting for the ones before them.
    pub(crate) fn deliver_reliable(&mut self, start: Seq, count: Seq) -> Result<()> {
        if self.memb.state == State::Evs {
            return Ok(());
        }
        let first = start.max(self.prot.last_delivered + 1);
        for seq in first..start.saturating_add(count) {
            let packet = match self.prot.store.slot(seq) {
                Slot::Stored { packet, delivered: false }
                    if packet.is_single_fragment() && packet.service().map(|s| s.is_reliable()).unwrap_or(false) =>
                {
                    packet.clone()
                }
                _ => continue,
            };
            self.deliver(&packet)?;
            self.prot.store.mark_delivered(seq);
        }
        Ok(())
    }

    /// Delivers in sequence order up to the local aru, stopping at the first safe packet.
    pub(crate) fn deliver_agreed(&mut self) -> Result<()> {
        if self.memb.state == State::Evs || self.prot.my_aru <= self.prot.last_delivered {
            return Ok(());
        }
        let mut seq = self.prot.last_delivered + 1;
        while seq <= self.prot.my_aru {
            match self.prot.store.slot(seq) {
                Slot::Stored { delivered: true, .. } => (),
                Slot::Stored { packet, .. } => {
                    if packet.service().map(|s| s.is_safe()).unwrap_or(false) {
                        break;
                    }
                    let packet = packet.clone();
                    self.deliver(&packet)?;
                    self.prot.store.mark_delivered(seq);
                }
                _ => return Err(Error::MissingPacket(seq)),
            }
            self.prot.last_delivered = seq;
            seq += 1;
        }
        Ok(())
    }

    /// Frees every slot up to the ring aru, delivering what is still undelivered. In EVS this
    /// is where the old ring ends and the new one is installed.
    pub(crate) fn discard_packets(&mut self) -> Result<()> {
        if self.prot.aru <= self.prot.last_discarded {
            return Ok(());
        }
        if self.memb.state == State::Evs {
            return self.discard_evs();
        }
        let mut seq = self.prot.last_discarded + 1;
        while seq <= self.prot.aru {
            match self.prot.store.take(seq) {
                Slot::Stored { packet, delivered } => {
                    if !delivered {
                        self.deliver(&packet)?;
                    }
                }
                _ => return Err(Error::MissingPacket(seq)),
            }
            seq += 1;
        }
        debug!("[{}] discarded {}-{}", "prot".yellow(), self.prot.last_discarded + 1, self.prot.aru);
        self.prot.last_discarded = self.prot.aru;
        if self.prot.last_delivered < self.prot.last_discarded {
            self.prot.last_delivered = self.prot.last_discarded;
        }
        Ok(())
    }

    fn discard_evs(&mut self) -> Result<()> {
        if self.prot.aru != self.prot.last_seq {
            return Ok(());
        }

        // what precedes the first hole or safe packet belongs before the transitional view
        let mut seq = self.prot.last_discarded + 1;
        while seq <= self.prot.highest_seq {
            match self.prot.store.slot(seq) {
                Slot::Empty => return Err(Error::MissingPacket(seq)),
                Slot::Hole(_) => {
                    info!("[{}] first hole at {}", "prot".yellow(), seq);
                    break;
                }
                Slot::Stored { packet, .. } if packet.service().map(|s| s.is_safe()).unwrap_or(false) => {
                    info!("[{}] first safe packet at {}", "prot".yellow(), seq);
                    break;
                }
                _ => (),
            }
            if let Slot::Stored { packet, delivered: false } = self.prot.store.take(seq) {
                self.deliver(&packet)?;
            }
            self.prot.last_discarded = seq;
            seq += 1;
        }

        self.transitional()?;
        self.deliveries.push(Delivery::Transitional {
            members: self.memb.trans_membership.members(),
            memb_id: self.memb.trans_memb_id,
        });

        // past a hole only daemons that committed to the new ring have their packets delivered
        let mut found_hole = false;
        let mut seq = self.prot.last_discarded + 1;
        while seq <= self.prot.highest_seq {
            match self.prot.store.take(seq) {
                Slot::Empty => return Err(Error::MissingPacket(seq)),
                Slot::Hole(_) => {
                    debug!("[{}] hole at {}", "prot".yellow(), seq);
                    found_hole = true;
                }
                Slot::Stored { packet, delivered } => {
                    if !found_hole || self.memb.commit_membership.contains(packet.header.proc_id) {
                        if !delivered {
                            self.deliver(&packet)?;
                        }
                    } else {
                        debug!("[{}] not delivering {} past a hole", "prot".yellow(), seq);
                    }
                }
            }
            seq += 1;
        }

        self.prot.down_queue.restart();
        self.prot.up_queue.clear();

        self.regular()?;
        self.deliveries.push(Delivery::Regular {
            members: self.memb.reg_membership.members(),
            memb_id: self.memb.membership_id,
        });
        self.prot.start_ring();
        Ok(())
    }
}
