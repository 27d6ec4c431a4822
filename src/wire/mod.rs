//! Packet and token types together with their wire encoding.
//!
//! Every datagram starts with a 32-bit type word carrying an endian marker. Decoding reads the
//! marker and then the whole datagram in the sender's byte order, so daemons of either
//! endianness interoperate without per-structure flipping.

mod codec;
mod form;
mod packet;
mod token;

pub use codec::*;
pub use form::*;
pub use packet::*;
pub use token::*;

use crate::proc_id::ProcId;

use std::fmt;

/// Ring sequence number.
pub type Seq = u32;

/// Identifies one installed ring: the daemon that installed it and its logical time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MembershipId {
    pub proc_id: ProcId,
    pub time: u32,
}

impl MembershipId {
    pub fn new(proc_id: ProcId, time: u32) -> Self {
        MembershipId { proc_id, time }
    }
}

impl fmt::Display for MembershipId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.proc_id, self.time)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    Truncated { needed: usize, available: usize },
    BadEndianMarker(u32),
    UnknownType(u32),
    LengthMismatch { declared: usize, actual: usize },
    TooMany { what: &'static str, count: usize, limit: usize },
    InvalidRepKind(u16),
    InvalidRing(&'static str),
    TooLarge(usize),
    /// Packets of one datagram stamped with different configuration hashes
    MixedHashes,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
