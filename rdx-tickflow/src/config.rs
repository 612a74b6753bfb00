//! Defines all configuration structures for the Tickflow engine.
//!
//! These structs are designed to be deserialized from a configuration file
//! (e.g., a TOML file) using `serde`. This allows the engine's tick speed and
//! per-tick work bounds to be defined externally from the application code.

use crate::error::{Result, TickflowError};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Default bound on how many `Immediate` hand-offs a path may chain in one tick.
pub const DEFAULT_IMMEDIATE_CHAIN: usize = 64;

/// The top-level configuration for the `TickflowEngine`.
#[derive(Debug, Clone, Deserialize)]
pub struct TickflowConfig {
    /// The tick speed of the `SystemClock` used by `TickflowEngine::run`.
    #[serde(default = "default_resolution")]
    pub resolution: ClockResolution,

    /// Upper bound on timed-queue entries processed per tick.
    /// `None` processes a snapshot of the whole queue.
    #[serde(default)]
    pub max_events_per_tick: Option<usize>,

    /// How many steps a path may resolve back to back through `Immediate`
    /// within a single `update` call before yielding to the next tick.
    #[serde(default = "default_immediate_chain")]
    pub max_immediate_chain: usize,
}

/// Defines the operational speed of the `SystemClock`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockResolution {
    /// ~60 ticks per second. Suitable for real-time applications.
    High,
    /// ~30 ticks per second. Suitable for general purpose simulations.
    Medium,
    /// ~1 tick per second. Suitable for strategic or turn-based logic.
    Low,
    /// A user-defined speed in ticks per second.
    Custom { ticks_per_second: u64 },
}

impl ClockResolution {
    /// The wall-clock period between two ticks.
    pub fn tick_interval(&self) -> Result<Duration> {
        let ticks_per_second = match self {
            ClockResolution::High => 60,
            ClockResolution::Medium => 30,
            ClockResolution::Low => 1,
            ClockResolution::Custom { ticks_per_second } => *ticks_per_second,
        };
        if ticks_per_second == 0 {
            return Err(TickflowError::InvalidTickRate);
        }
        Ok(Duration::from_secs_f64(1.0 / ticks_per_second as f64))
    }
}

impl TickflowConfig {
    /// Loads the configuration from an optional TOML file, then lets
    /// `TICKFLOW_*` environment variables override individual fields.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let config = builder
            .add_source(Environment::with_prefix("TICKFLOW"))
            .build()?;
        Ok(config.try_deserialize::<Self>()?)
    }
}

impl Default for TickflowConfig {
    fn default() -> Self {
        Self {
            resolution: default_resolution(),
            max_events_per_tick: None,
            max_immediate_chain: default_immediate_chain(),
        }
    }
}

// --- Default value functions for serde ---

fn default_resolution() -> ClockResolution {
    ClockResolution::Medium
}

fn default_immediate_chain() -> usize {
    DEFAULT_IMMEDIATE_CHAIN
}
