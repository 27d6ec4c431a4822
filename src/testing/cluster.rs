use crate::conf::Configuration;
use crate::engine::{Channel, Delivery, Engine, EngineOptions};
use crate::membership::State;
use crate::network::Datagram;
use crate::proc_id::ProcId;
use crate::wire::{MembershipId, Service};

use bytes::Bytes;
use tokio::time::{Duration, Instant};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

/// Simulated one-hop latency.
const TICK: Duration = Duration::from_millis(1);

/// One datagram on its way to one daemon.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: ProcId,
    pub to: ProcId,
    pub channel: Channel,
    pub bytes: Bytes,
}

type Filter = Box<dyn FnMut(&Envelope) -> bool>;

/// Engines wired together through an in-memory network and a manual clock.
///
/// Datagrams sent during one tick are delivered on the next one, broadcast channel first.
/// When nothing is in flight the clock jumps to the next timer.
pub struct Cluster {
    pub conf: Arc<Configuration>,
    engines: BTreeMap<ProcId, Engine>,
    up: HashSet<ProcId>,
    in_flight: Vec<Envelope>,
    deliveries: HashMap<ProcId, Vec<Delivery>>,
    /// Returns whether an envelope gets through
    filter: Option<Filter>,
    pub now: Instant,
}

impl Cluster {
    pub fn new(conf: Configuration) -> Self {
        Cluster::with_options(conf, EngineOptions::default())
    }

    pub fn with_options(conf: Configuration, options: EngineOptions) -> Self {
        let conf = Arc::new(conf);
        let engines = conf
            .procs()
            .map(|p| (p.id, Engine::new(conf.clone(), p.id, options.clone()).unwrap()))
            .collect();
        Cluster {
            conf,
            engines,
            up: HashSet::new(),
            in_flight: vec![],
            deliveries: HashMap::new(),
            filter: None,
            now: Instant::now(),
        }
    }

    pub fn start(&mut self, id: ProcId) {
        self.up.insert(id);
        let now = self.now;
        self.engines.get_mut(&id).unwrap().start(now).unwrap();
        self.collect(id);
    }

    pub fn start_all(&mut self) {
        let ids: Vec<ProcId> = self.engines.keys().cloned().collect();
        for id in ids {
            self.start(id);
        }
    }

    /// Stops a daemon dead: it neither receives nor sends from now on.
    pub fn crash(&mut self, id: ProcId) {
        self.up.remove(&id);
        self.in_flight.retain(|e| e.from != id && e.to != id);
    }

    pub fn set_filter<F>(&mut self, filter: F)
    where
        F: FnMut(&Envelope) -> bool + 'static,
    {
        self.filter = Some(Box::new(filter));
    }

    pub fn clear_filter(&mut self) {
        self.filter = None;
    }

    pub fn submit(&mut self, id: ProcId, service: Service, payload: &str) {
        let now = self.now;
        let engine = self.engines.get_mut(&id).unwrap();
        engine.submit(now, service, Bytes::from(payload.to_string())).unwrap();
        self.collect(id);
    }

    pub fn run_for(&mut self, duration: Duration) {
        let end = self.now + duration;
        while self.now < end {
            if self.in_flight.is_empty() {
                let next = self
                    .up
                    .iter()
                    .filter_map(|id| self.engines[id].next_deadline())
                    .min()
                    .unwrap_or(end);
                self.now = next.max(self.now + TICK).min(end);
            } else {
                self.deliver_in_flight();
                self.now += TICK;
            }
            self.fire_timers();
        }
    }

    /// Runs until `done` holds, for at most `limit`. Returns whether it held.
    pub fn run_until<F>(&mut self, limit: Duration, mut done: F) -> bool
    where
        F: FnMut(&Cluster) -> bool,
    {
        let end = self.now + limit;
        while self.now < end {
            if done(self) {
                return true;
            }
            self.run_for(TICK);
        }
        done(self)
    }

    pub fn engine(&self, id: ProcId) -> &Engine {
        &self.engines[&id]
    }

    pub fn state(&self, id: ProcId) -> State {
        self.engines[&id].state()
    }

    pub fn deliveries(&self, id: ProcId) -> &[Delivery] {
        self.deliveries.get(&id).map(|d| d.as_slice()).unwrap_or(&[])
    }

    /// Payloads delivered to `id`, in delivery order.
    pub fn messages(&self, id: ProcId) -> Vec<(ProcId, String)> {
        self.deliveries(id)
            .iter()
            .filter_map(|d| match d {
                Delivery::Message { sender, payload, .. } => {
                    Some((*sender, String::from_utf8_lossy(payload).to_string()))
                }
                _ => None,
            })
            .collect()
    }

    /// Payloads delivered to `id`, grouped under the view delivered right before them.
    pub fn messages_by_view(&self, id: ProcId) -> Vec<(Delivery, Vec<(ProcId, String)>)> {
        let mut grouped: Vec<(Delivery, Vec<(ProcId, String)>)> = vec![];
        for delivery in self.deliveries(id) {
            match delivery {
                Delivery::Message { sender, payload, .. } => {
                    if let Some((_, messages)) = grouped.last_mut() {
                        messages.push((*sender, String::from_utf8_lossy(payload).to_string()));
                    }
                }
                view => grouped.push((view.clone(), vec![])),
            }
        }
        grouped
    }

    pub fn last_regular(&self, id: ProcId) -> Option<(Vec<ProcId>, MembershipId)> {
        self.deliveries(id).iter().rev().find_map(|d| match d {
            Delivery::Regular { members, memb_id } => Some((members.clone(), *memb_id)),
            _ => None,
        })
    }

    /// Every up daemon is in OP with a regular view of exactly `members`.
    pub fn installed(&self, members: &[ProcId]) -> bool {
        members.iter().all(|id| {
            self.up.contains(id)
                && self.state(*id) == State::Op
                && self.last_regular(*id).map(|(view, _)| view == members).unwrap_or(false)
        })
    }

    fn deliver_in_flight(&mut self) {
        let mut batch = std::mem::replace(&mut self.in_flight, vec![]);
        batch.sort_by_key(|e| match e.channel {
            Channel::Broadcast => 0,
            Channel::Token => 1,
        });
        for envelope in batch {
            if !self.up.contains(&envelope.to) {
                continue;
            }
            if let Some(filter) = self.filter.as_mut() {
                if !filter(&envelope) {
                    continue;
                }
            }
            let now = self.now;
            let engine = self.engines.get_mut(&envelope.to).unwrap();
            engine.handle_datagram(now, envelope.channel, &envelope.bytes).unwrap();
            self.collect(envelope.to);
        }
    }

    fn fire_timers(&mut self) {
        let now = self.now;
        let mut ids: Vec<ProcId> = self.up.iter().cloned().collect();
        ids.sort();
        for id in ids {
            self.engines.get_mut(&id).unwrap().handle_timers(now).unwrap();
            self.collect(id);
        }
    }

    fn collect(&mut self, id: ProcId) {
        let engine = self.engines.get_mut(&id).unwrap();
        let outbound = engine.drain_outbound();
        let delivered = engine.drain_deliveries();
        self.deliveries.entry(id).or_insert_with(Vec::new).extend(delivered);
        for datagram in outbound {
            let receivers = self.route(&datagram);
            for (to, channel) in receivers {
                self.in_flight.push(Envelope { from: id, to, channel, bytes: datagram.bytes.clone() });
            }
        }
    }

    /// `bcast:port` reaches every daemon of the segment, `ip:port` one daemon's broadcast
    /// channel and `ip:port+1` its token channel.
    fn route(&self, datagram: &Datagram) -> Vec<(ProcId, Channel)> {
        let (ip, port) = match datagram.to {
            SocketAddr::V4(addr) => (*addr.ip(), addr.port()),
            SocketAddr::V6(_) => return vec![],
        };
        for segment in self.conf.segments() {
            if segment.broadcast == ip && segment.port == port {
                return segment.procs.iter().map(|p| (p.id, Channel::Broadcast)).collect();
            }
        }
        let id = ProcId::from(ip);
        let seg_index = match self.conf.segment_of(id) {
            Some(seg_index) => seg_index,
            None => return vec![],
        };
        let seg_port = self.conf.segment(seg_index).port;
        if port == seg_port {
            vec![(id, Channel::Broadcast)]
        } else if port == seg_port + 1 {
            vec![(id, Channel::Token)]
        } else {
            vec![]
        }
    }
}

impl Cluster {
    /// Puts a hand-made datagram on the wire.
    pub fn inject(&mut self, envelope: Envelope) {
        self.in_flight.push(envelope);
    }
}
