#[macro_use]
extern crate serde_derive;
extern crate colored;

pub mod conf;
pub mod constants;
pub mod engine;
pub mod flow_control;
pub mod membership;
pub mod network;
pub mod proc_id;
pub mod protocol;
pub mod server;
pub mod timers;
pub mod wire;

#[cfg(test)]
mod testing;

use membership::State;
use proc_id::ProcId;
use wire::Seq;

#[derive(Debug)]
pub enum Error {
    IO(std::io::Error),
    Config(config::ConfigError),
    Actix(actix::MailboxError),
    Wire(wire::Error),

    // configuration errors
    UnknownProc(ProcId),
    DuplicateProc(ProcId),
    InvalidConfiguration(String),
    /// Some, but not all, of the membership timeouts were configured
    PartialTimeouts,
    /// Error caused by converting from a `String` to a `ProcId`
    TryFromStringError,

    // protocol invariants
    SlotOccupied(Seq),
    RetransBelowAru { seq: Seq, aru: Seq },
    MissingPacket(Seq),
    FragmentOutOfOrder { proc_id: ProcId, index: i16 },
    TokenOverflow(usize),
    MessageTooLarge(usize),

    // membership invariants
    InvalidState { operation: &'static str, state: State },
}

impl std::error::Error for Error {}

impl std::convert::From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::IO(error)
    }
}

impl std::convert::From<config::ConfigError> for Error {
    fn from(error: config::ConfigError) -> Self {
        Error::Config(error)
    }
}

impl std::convert::From<actix::MailboxError> for Error {
    fn from(error: actix::MailboxError) -> Self {
        Error::Actix(error)
    }
}

impl std::convert::From<wire::Error> for Error {
    fn from(error: wire::Error) -> Self {
        Error::Wire(error)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
