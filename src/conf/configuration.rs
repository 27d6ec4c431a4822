use crate::constants::{MAX_PROCS_RING, MAX_SEGMENTS};
use crate::proc_id::ProcId;
use crate::{Error, Result};

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// The place of a daemon in the configuration: segment first, then rank inside the segment.
///
/// The derived ordering is the total order used for every leader and representative election.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub seg_index: usize,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proc {
    /// Human readable name, used to pick "this" daemon out of a shared configuration
    pub name: String,
    pub id: ProcId,
    pub seg_index: usize,
    pub index_in_seg: usize,
}

impl Proc {
    pub fn position(&self) -> Position {
        Position { seg_index: self.seg_index, index: self.index_in_seg }
    }
}

/// A broadcast domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub broadcast: Ipv4Addr,
    /// Broadcast channel port. The token channel listens on `port + 1`.
    pub port: u16,
    pub procs: Vec<Proc>,
}

impl Segment {
    pub fn broadcast_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.broadcast, self.port))
    }
}

/// The static description of every segment and daemon that may ever take part in a ring.
#[derive(Debug, Clone)]
pub struct Configuration {
    segments: Vec<Segment>,
    by_id: HashMap<ProcId, Position>,
    hash: u32,
}

impl Configuration {
    pub fn builder() -> ConfigurationBuilder {
        ConfigurationBuilder { segments: vec![] }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn segment(&self, seg_index: usize) -> &Segment {
        &self.segments[seg_index]
    }

    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }

    pub fn num_procs(&self) -> usize {
        self.by_id.len()
    }

    /// 32-bit digest of the layout, stamped on every packet and token.
    pub fn hash(&self) -> u32 {
        self.hash
    }

    pub fn procs(&self) -> impl Iterator<Item = &Proc> {
        self.segments.iter().flat_map(|s| s.procs.iter())
    }

    pub fn lookup_process(&self, id: ProcId) -> Option<&Proc> {
        let pos = self.by_id.get(&id)?;
        Some(&self.segments[pos.seg_index].procs[pos.index])
    }

    pub fn lookup_name(&self, name: &str) -> Option<&Proc> {
        self.procs().find(|p| p.name == name)
    }

    pub fn segment_of(&self, id: ProcId) -> Option<usize> {
        self.by_id.get(&id).map(|pos| pos.seg_index)
    }

    pub fn ordered_position(&self, id: ProcId) -> Option<Position> {
        self.by_id.get(&id).cloned()
    }

    /// Index of the daemon in configuration order, across all segments.
    pub fn proc_index(&self, id: ProcId) -> Option<usize> {
        let pos = self.by_id.get(&id)?;
        let before: usize = self.segments[..pos.seg_index].iter().map(|s| s.procs.len()).sum();
        Some(before + pos.index)
    }

    /// The smallest known id of `candidates` in configuration order. Unknown ids are ignored.
    pub fn smallest<I>(&self, candidates: I) -> Option<ProcId>
    where
        I: IntoIterator<Item = ProcId>,
    {
        candidates
            .into_iter()
            .filter_map(|id| self.by_id.get(&id).map(|pos| (*pos, id)))
            .min()
            .map(|(_, id)| id)
    }

    /// Segments whose first daemons differ in the top 16 bits of their address are treated as
    /// geographically far apart.
    pub fn is_wide(&self) -> bool {
        let mut prefixes = self.segments.iter().filter_map(|s| s.procs.first()).map(|p| p.id.prefix16());
        match prefixes.next() {
            Some(first) => prefixes.any(|p| p != first),
            None => false,
        }
    }

    /// Address of the daemon's broadcast channel, used for unicast packets.
    pub fn unicast_addr(&self, id: ProcId) -> Option<SocketAddr> {
        let proc = self.lookup_process(id)?;
        let port = self.segments[proc.seg_index].port;
        Some(SocketAddr::V4(SocketAddrV4::new(id.ip(), port)))
    }

    /// Address of the daemon's token channel.
    pub fn token_addr(&self, id: ProcId) -> Option<SocketAddr> {
        let proc = self.lookup_process(id)?;
        let port = self.segments[proc.seg_index].port + 1;
        Some(SocketAddr::V4(SocketAddrV4::new(id.ip(), port)))
    }
}

pub struct ConfigurationBuilder {
    segments: Vec<Segment>,
}

impl ConfigurationBuilder {
    /// Opens a new segment; subsequent `proc` calls add to it.
    pub fn segment(mut self, broadcast: Ipv4Addr, port: u16) -> Self {
        self.segments.push(Segment { broadcast, port, procs: vec![] });
        self
    }

    pub fn proc(mut self, name: &str, ip: Ipv4Addr) -> Self {
        if let Some(seg) = self.segments.last_mut() {
            seg.procs.push(Proc {
                name: name.to_string(),
                id: ProcId::from(ip),
                seg_index: 0,
                index_in_seg: 0,
            });
        }
        self
    }

    pub fn build(mut self) -> Result<Configuration> {
        if self.segments.is_empty() {
            return Err(Error::InvalidConfiguration("no segments".to_string()));
        }
        if self.segments.len() > MAX_SEGMENTS {
            return Err(Error::InvalidConfiguration(format!(
                "{} segments exceed the limit of {}",
                self.segments.len(),
                MAX_SEGMENTS
            )));
        }
        let mut by_id = HashMap::new();
        for (seg_index, segment) in self.segments.iter_mut().enumerate() {
            if segment.procs.is_empty() {
                return Err(Error::InvalidConfiguration(format!("segment {} is empty", seg_index)));
            }
            if segment.port == u16::MAX {
                return Err(Error::InvalidConfiguration("port leaves no room for the token channel".to_string()));
            }
            for (index, proc) in segment.procs.iter_mut().enumerate() {
                proc.seg_index = seg_index;
                proc.index_in_seg = index;
                if by_id.insert(proc.id, Position { seg_index, index }).is_some() {
                    return Err(Error::DuplicateProc(proc.id));
                }
            }
        }
        if by_id.len() > MAX_PROCS_RING {
            return Err(Error::InvalidConfiguration(format!(
                "{} daemons exceed the limit of {}",
                by_id.len(),
                MAX_PROCS_RING
            )));
        }
        let hash = layout_hash(&self.segments)?;
        Ok(Configuration { segments: self.segments, by_id, hash })
    }
}

fn layout_hash(segments: &[Segment]) -> Result<u32> {
    let encoded =
        bincode::serialize(segments).map_err(|e| Error::InvalidConfiguration(format!("{:?}", e)))?;
    let digest = blake3::hash(&encoded);
    let b = digest.as_bytes();
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}
