//! Outgoing fragmentation and incoming reassembly.

use crate::constants::{DOWN_QUEUE_WATER_MARK, MAX_MESSAGE_SIZE, MAX_PACKET_SIZE};
use crate::proc_id::ProcId;
use crate::wire::{Body, Packet, Service, PACKET_HEADER_SIZE};
use crate::{Error, Result};

use bytes::{Bytes, BytesMut};

use std::collections::{HashMap, VecDeque};

/// Largest payload carried by one packet, so that a packet fills at most one datagram.
pub const FRAGMENT_SIZE: usize = MAX_PACKET_SIZE - PACKET_HEADER_SIZE;

#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub service: Service,
    pub fragments: Vec<Bytes>,
}

impl OutgoingMessage {
    pub fn new(service: Service, payload: Bytes) -> Self {
        let mut fragments = vec![];
        let mut rest = payload;
        while rest.len() > FRAGMENT_SIZE {
            fragments.push(rest.split_to(FRAGMENT_SIZE));
        }
        fragments.push(rest);
        OutgoingMessage { service, fragments }
    }
}

/// Messages submitted locally and not yet fully put on the ring.
#[derive(Debug, Default)]
pub struct DownQueue {
    messages: VecDeque<OutgoingMessage>,
    /// Next fragment of the head message
    cur_fragment: usize,
}

impl DownQueue {
    pub fn new() -> Self {
        DownQueue { messages: VecDeque::new(), cur_fragment: 0 }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn above_water_mark(&self) -> bool {
        self.messages.len() >= DOWN_QUEUE_WATER_MARK
    }

    pub fn push(&mut self, service: Service, payload: Bytes) -> Result<()> {
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge(payload.len()));
        }
        self.messages.push_back(OutgoingMessage::new(service, payload));
        Ok(())
    }

    /// The next fragment to send with its fragment index: `1..n-1` for inner fragments and
    /// `-n` for the last one. The head message is dropped once its last fragment is taken.
    pub fn next_fragment(&mut self) -> Option<(Service, Bytes, i16)> {
        let head = self.messages.front()?;
        let total = head.fragments.len();
        let bytes = head.fragments[self.cur_fragment].clone();
        let service = head.service;
        self.cur_fragment += 1;
        if self.cur_fragment < total {
            return Some((service, bytes, self.cur_fragment as i16));
        }
        self.messages.pop_front();
        self.cur_fragment = 0;
        Some((service, bytes, -(total as i16)))
    }

    /// Fragments of a partially sent message belong to the old ring; resend it whole.
    pub fn restart(&mut self) {
        self.cur_fragment = 0;
    }
}

/// A message reassembled from its fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassembled {
    pub sender: ProcId,
    pub service: Service,
    pub payload: Bytes,
}

/// Per-sender reassembly of fragmented messages.
#[derive(Debug, Default)]
pub struct UpQueue {
    partial: HashMap<ProcId, Vec<Bytes>>,
}

impl UpQueue {
    pub fn new() -> Self {
        UpQueue { partial: HashMap::new() }
    }

    /// Adds a delivered packet. Returns the message once its last fragment arrives.
    pub fn push(&mut self, packet: &Packet) -> Result<Option<Reassembled>> {
        let (service, bytes) = match &packet.body {
            Body::Data { service, bytes } => (*service, bytes.clone()),
            _ => return Ok(None),
        };
        let sender = packet.header.proc_id;
        // reliable single-fragment messages skip the queue
        if service.is_reliable() && packet.is_single_fragment() {
            return Ok(Some(Reassembled { sender, service, payload: bytes }));
        }
        let index = (packet.header.packet_index as i32).abs() as usize;
        let fragments = self.partial.entry(sender).or_insert_with(Vec::new);
        if fragments.len() + 1 != index {
            return Err(Error::FragmentOutOfOrder { proc_id: sender, index: packet.header.packet_index });
        }
        fragments.push(bytes);
        if !packet.is_last_fragment() {
            return Ok(None);
        }
        let fragments = self.partial.remove(&sender).unwrap_or_default();
        let payload = if fragments.len() == 1 {
            fragments[0].clone()
        } else {
            let mut buf = BytesMut::with_capacity(fragments.iter().map(|f| f.len()).sum());
            for f in fragments.iter() {
                buf.extend_from_slice(f);
            }
            buf.freeze()
        };
        Ok(Some(Reassembled { sender, service, payload }))
    }

    pub fn pending(&self) -> usize {
        self.partial.len()
    }

    pub fn clear(&mut self) {
        self.partial.clear();
    }
}
