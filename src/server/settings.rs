use crate::conf::Configuration;
use crate::constants::{DEFAULT_PERSONAL_WINDOW, DEFAULT_WINDOW};
use crate::engine::EngineOptions;
use crate::proc_id::ProcId;
use crate::timers::Timeouts;
use crate::{Error, Result};

use config::{Config, Environment, File};
use serde::Deserialize;
use tokio::time::Duration;

use std::net::Ipv4Addr;
use std::path::Path;

/// Environment variables with this prefix override the configuration file, e.g. `RINGCAST_NAME`.
pub const ENV_PREFIX: &str = "RINGCAST";

fn default_window() -> i32 {
    DEFAULT_WINDOW
}
fn default_personal_window() -> i32 {
    DEFAULT_PERSONAL_WINDOW
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProcSettings {
    pub name: String,
    pub ip: Ipv4Addr,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SegmentSettings {
    pub broadcast: Ipv4Addr,
    pub port: u16,
    pub procs: Vec<ProcSettings>,
}

/// Membership timeouts in milliseconds. Either all of them are given or none.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TimeoutSettings {
    pub token: Option<u64>,
    pub hurry: Option<u64>,
    pub alive: Option<u64>,
    pub join: Option<u64>,
    pub rep: Option<u64>,
    pub seg: Option<u64>,
    pub gather: Option<u64>,
    pub form: Option<u64>,
    pub lookup: Option<u64>,
}

impl TimeoutSettings {
    fn all(&self) -> [Option<u64>; 9] {
        [
            self.token, self.hurry, self.alive, self.join, self.rep, self.seg, self.gather, self.form,
            self.lookup,
        ]
    }

    pub fn timeouts(&self) -> Result<Option<Timeouts>> {
        let all = self.all();
        if all.iter().all(|t| t.is_none()) {
            return Ok(None);
        }
        if all.iter().any(|t| t.is_none()) {
            return Err(Error::PartialTimeouts);
        }
        let ms = |t: Option<u64>| Duration::from_millis(t.unwrap_or(0));
        Ok(Some(Timeouts {
            token: ms(self.token),
            hurry: ms(self.hurry),
            alive: ms(self.alive),
            join: ms(self.join),
            rep: ms(self.rep),
            seg: ms(self.seg),
            gather: ms(self.gather),
            form: ms(self.form),
            lookup: ms(self.lookup),
        }))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Name of this daemon in `segments`
    pub name: String,
    pub segments: Vec<SegmentSettings>,
    #[serde(default = "default_window")]
    pub window: i32,
    #[serde(default = "default_personal_window")]
    pub personal_window: i32,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub wide_network: Option<bool>,
    #[serde(default)]
    pub accelerated_ring: Option<bool>,
}

impl Settings {
    /// Reads the settings from `path`, then the `RINGCAST_*` environment. A `name` given on
    /// the command line wins over both.
    pub fn new(path: &Path, name: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::from(path))
            .add_source(Environment::with_prefix(ENV_PREFIX));
        if let Some(name) = name {
            builder = builder.set_override("name", name)?;
        }
        let settings = builder.build()?.try_deserialize()?;
        Ok(settings)
    }

    /// The immutable daemon layout shared by every daemon of the configuration.
    pub fn configuration(&self) -> Result<Configuration> {
        let mut builder = Configuration::builder();
        for segment in self.segments.iter() {
            builder = builder.segment(segment.broadcast, segment.port);
            for proc in segment.procs.iter() {
                builder = builder.proc(&proc.name, proc.ip);
            }
        }
        builder.build()
    }

    /// Resolves this daemon's id by name.
    pub fn me(&self, conf: &Configuration) -> Result<ProcId> {
        conf.lookup_name(&self.name)
            .map(|p| p.id)
            .ok_or_else(|| Error::InvalidConfiguration(format!("no daemon named {}", self.name)))
    }

    pub fn engine_options(&self) -> Result<EngineOptions> {
        if self.window <= 0 || self.personal_window <= 0 {
            return Err(Error::InvalidConfiguration(format!(
                "windows must be positive (window {}, personal {})",
                self.window, self.personal_window
            )));
        }
        Ok(EngineOptions {
            window: self.window,
            personal_window: self.personal_window,
            timeouts: self.timeouts.timeouts()?,
            wide_network: self.wide_network,
            accelerated_ring: self.accelerated_ring,
        })
    }
}
