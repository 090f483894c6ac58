//! Defines all configuration structures for the Tickclock engine.
//!
//! These structs are deserialized with `serde`. [`TickclockConfig::load`]
//! layers an optional TOML file under `TICKCLOCK__*` environment variables
//! using the `config` crate, so a tempo can be set with e.g.
//! `TICKCLOCK__TEMPO_BPM=90`.

use crate::common::Bpm;
use crate::error::TickError;
use serde::Deserialize;
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// The top-level configuration for the `MetronomeEngine`.
#[derive(Debug, Clone, Deserialize)]
pub struct TickclockConfig {
    /// The tempo used when the metronome is started without an explicit one.
    #[serde(default = "default_tempo_bpm")]
    pub tempo_bpm: f64,

    /// Preset tempos offered by front ends.
    #[serde(default = "default_presets")]
    pub presets: Vec<f64>,

    /// Fallback log filter when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Capacities of the engine's channels.
    #[serde(default)]
    pub channels: ChannelConfig,
}

/// Buffer sizes for the engine's event streams and command queue.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    #[serde(default = "default_beat_capacity")]
    pub beat_capacity: usize,
    #[serde(default = "default_system_capacity")]
    pub system_capacity: usize,
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,
}

impl TickclockConfig {
    /// Loads configuration from `path` (if given and present) and the
    /// environment, then validates it.
    pub fn load(path: Option<&Path>) -> Result<Self, TickError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let config: Self = builder
            .add_source(
                config::Environment::with_prefix("TICKCLOCK")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every tempo, the log level and the channel capacities.
    pub fn validate(&self) -> Result<(), TickError> {
        Bpm::new(self.tempo_bpm)?;
        self.fallback_filter()?;
        for preset in &self.presets {
            Bpm::new(*preset)?;
        }
        let channels = &self.channels;
        if channels.beat_capacity == 0
            || channels.system_capacity == 0
            || channels.command_capacity == 0
        {
            return Err(TickError::Config(config::ConfigError::Message(
                "channel capacities must be greater than zero".to_string(),
            )));
        }
        Ok(())
    }

    /// The configured tempo.
    pub fn tempo(&self) -> Result<Bpm, TickError> {
        Bpm::new(self.tempo_bpm)
    }

    /// The log filter for a binary: `RUST_LOG` if it is set and valid,
    /// otherwise `log_level`.
    pub fn log_filter(&self) -> Result<EnvFilter, TickError> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => self.fallback_filter(),
        }
    }

    #[doc(hidden)]
    fn fallback_filter(&self) -> Result<EnvFilter, TickError> {
        EnvFilter::try_new(&self.log_level).map_err(|e| {
            TickError::Config(config::ConfigError::Message(format!(
                "invalid log_level '{}': {}",
                self.log_level, e
            )))
        })
    }
}

// --- Default value functions for serde ---

fn default_tempo_bpm() -> f64 {
    60.0
}

fn default_presets() -> Vec<f64> {
    vec![60.0, 90.0]
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_beat_capacity() -> usize {
    256
}

fn default_system_capacity() -> usize {
    64
}

fn default_command_capacity() -> usize {
    32
}

impl Default for TickclockConfig {
    fn default() -> Self {
        Self {
            tempo_bpm: default_tempo_bpm(),
            presets: default_presets(),
            log_level: default_log_level(),
            channels: ChannelConfig::default(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            beat_capacity: default_beat_capacity(),
            system_capacity: default_system_capacity(),
            command_capacity: default_command_capacity(),
        }
    }
}
