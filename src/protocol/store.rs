use crate::constants::PACKET_STORE_SIZE;
use crate::wire::{Packet, Seq};
use crate::{Error, Result};

/// One position of the circular packet store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    Empty,
    Stored { packet: Packet, delivered: bool },
    /// A sequence number the new ring agreed nobody has. Counts as present for the local aru
    /// and is never delivered.
    Hole(Seq),
}

/// Packets of the current ring indexed by `seq mod PACKET_STORE_SIZE`.
#[derive(Debug)]
pub struct PacketStore {
    slots: Vec<Slot>,
    occupied: usize,
}

fn index(seq: Seq) -> usize {
    seq as usize & (PACKET_STORE_SIZE - 1)
}

impl PacketStore {
    pub fn new() -> Self {
        PacketStore { slots: vec![Slot::Empty; PACKET_STORE_SIZE], occupied: 0 }
    }

    pub fn slot(&self, seq: Seq) -> &Slot {
        &self.slots[index(seq)]
    }

    pub fn exists(&self, seq: Seq) -> bool {
        *self.slot(seq) != Slot::Empty
    }

    pub fn is_hole(&self, seq: Seq) -> bool {
        match self.slot(seq) {
            Slot::Hole(_) => true,
            _ => false,
        }
    }

    pub fn get(&self, seq: Seq) -> Option<&Packet> {
        match self.slot(seq) {
            Slot::Stored { packet, .. } => Some(packet),
            _ => None,
        }
    }

    pub fn is_delivered(&self, seq: Seq) -> bool {
        match self.slot(seq) {
            Slot::Stored { delivered, .. } => *delivered,
            _ => false,
        }
    }

    /// Stores a packet in its slot. A slot holds at most one live packet.
    pub fn insert(&mut self, packet: Packet) -> Result<()> {
        let seq = packet.header.seq;
        let slot = &mut self.slots[index(seq)];
        if *slot != Slot::Empty {
            return Err(Error::SlotOccupied(seq));
        }
        *slot = Slot::Stored { packet, delivered: false };
        self.occupied += 1;
        Ok(())
    }

    pub fn mark_delivered(&mut self, seq: Seq) {
        if let Slot::Stored { delivered, .. } = &mut self.slots[index(seq)] {
            *delivered = true;
        }
    }

    /// Turns the slot into a hole placeholder, returning the packet it held, if any.
    pub fn mark_hole(&mut self, seq: Seq) -> Option<Packet> {
        let slot = &mut self.slots[index(seq)];
        if *slot == Slot::Empty {
            self.occupied += 1;
        }
        match std::mem::replace(slot, Slot::Hole(seq)) {
            Slot::Stored { packet, .. } => Some(packet),
            _ => None,
        }
    }

    /// Turns a hole placeholder back into an empty slot.
    pub fn revert_hole(&mut self, seq: Seq) {
        let slot = &mut self.slots[index(seq)];
        if let Slot::Hole(_) = slot {
            *slot = Slot::Empty;
            self.occupied -= 1;
        }
    }

    /// Frees the slot and returns what it held.
    pub fn take(&mut self, seq: Seq) -> Slot {
        let slot = std::mem::replace(&mut self.slots[index(seq)], Slot::Empty);
        if slot != Slot::Empty {
            self.occupied -= 1;
        }
        slot
    }

    pub fn occupied(&self) -> usize {
        self.occupied
    }
}
