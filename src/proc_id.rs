//! Daemon identifiers
//!
//! A daemon is identified by the 32-bit IPv4 address it listens on. See the documentation
//! of [ProcId] for details.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// 32-bit daemon identifier derived from the daemon's IPv4 address.
///
/// Displayed in dotted-quad form.
#[derive(Hash, Eq, PartialEq, Ord, PartialOrd, Copy, Clone, Serialize, Deserialize, Default)]
pub struct ProcId(u32);

impl std::fmt::Debug for ProcId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.ip())
    }
}

impl std::fmt::Display for ProcId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.ip())
    }
}

impl FromStr for ProcId {
    type Err = crate::Error;

    /// Parses a dotted-quad address into a `ProcId`
    fn from_str(s: &str) -> Result<Self, crate::Error> {
        let ip = Ipv4Addr::from_str(s).map_err(|_| crate::Error::TryFromStringError)?;
        Ok(ProcId::from(ip))
    }
}

impl From<Ipv4Addr> for ProcId {
    fn from(ip: Ipv4Addr) -> Self {
        ProcId(u32::from(ip))
    }
}

impl ProcId {
    /// Wraps a raw wire value
    pub const fn new(raw: u32) -> ProcId {
        ProcId(raw)
    }

    /// The raw 32-bit value carried on the wire
    pub fn raw(&self) -> u32 {
        self.0
    }

    /// The address this id was derived from
    pub fn ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.0)
    }

    /// The top 16 bits of the address, used to guess whether two segments are far apart
    pub fn prefix16(&self) -> u16 {
        (self.0 >> 16) as u16
    }
}
