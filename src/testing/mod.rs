//! Deterministic in-memory daemons for tests.

mod cluster;

pub use cluster::{Cluster, Envelope};

use crate::conf::Configuration;
use crate::proc_id::ProcId;

use std::net::Ipv4Addr;

pub const PORT: u16 = 4803;

/// `segments[s]` daemons in segment `s`, with addresses `10.0.s.1..` and names `d{s}{i}`.
pub fn conf(segments: &[usize]) -> Configuration {
    let mut builder = Configuration::builder();
    for (s, count) in segments.iter().enumerate() {
        builder = builder.segment(Ipv4Addr::new(10, 0, s as u8, 255), PORT);
        for i in 0..*count {
            builder = builder.proc(&format!("d{}{}", s, i), Ipv4Addr::new(10, 0, s as u8, i as u8 + 1));
        }
    }
    builder.build().unwrap()
}

pub fn id(seg: u8, index: u8) -> ProcId {
    ProcId::from(Ipv4Addr::new(10, 0, seg, index + 1))
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
