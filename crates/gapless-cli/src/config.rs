//! Player configuration.
//!
//! An optional TOML file supplies defaults; command-line flags override it.
//!
//! ```toml
//! gapless = true
//! device = "USB DAC"
//! prepare_timeout_ms = 10000
//! replay_gain_db = -6.0
//!
//! [output]
//! chunk_frames = 1024
//! refill_max_frames = 4096
//! buffer_seconds = 2.0
//! sample_rate = 48000
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use gapless_engine::EngineConfig;
use gapless_output::OutputConfig;
use serde::Deserialize;

use crate::cli::Args;

/// Top-level player configuration loaded from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlayerConfig {
    /// Enable gapless handoff between tracks (default: true).
    pub gapless: Option<bool>,
    /// Output device substring match.
    pub device: Option<String>,
    /// Prepare timeout in milliseconds (default: 10000).
    pub prepare_timeout_ms: Option<u64>,
    /// Replay gain in dB applied to every track.
    pub replay_gain_db: Option<f32>,
    /// Output tuning.
    pub output: Option<OutputSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputSection {
    pub chunk_frames: Option<usize>,
    pub refill_max_frames: Option<usize>,
    pub buffer_seconds: Option<f32>,
    pub sample_rate: Option<u32>,
}

impl PlayerConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        Self::parse(&raw).with_context(|| format!("parse config {:?}", path))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str::<PlayerConfig>(raw)?)
    }
}

/// Fully resolved settings for one run.
#[derive(Clone, Debug)]
pub struct Settings {
    pub gapless: bool,
    pub device: Option<String>,
    pub replay_gain_db: Option<f32>,
    pub engine: EngineConfig,
    pub output: OutputConfig,
}

impl Settings {
    pub fn resolve(args: &Args, file: PlayerConfig) -> Self {
        let out_file = file.output.unwrap_or_default();
        let defaults = OutputConfig::default();
        let engine_defaults = EngineConfig::default();

        let prepare_timeout = args
            .prepare_timeout_ms
            .or(file.prepare_timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(engine_defaults.prepare_timeout);

        Self {
            gapless: !args.no_gapless && file.gapless.unwrap_or(true),
            device: args.device.clone().or(file.device),
            replay_gain_db: args.replay_gain_db.or(file.replay_gain_db),
            engine: EngineConfig { prepare_timeout },
            output: OutputConfig {
                chunk_frames: args
                    .chunk_frames
                    .or(out_file.chunk_frames)
                    .unwrap_or(defaults.chunk_frames),
                refill_max_frames: args
                    .refill_max_frames
                    .or(out_file.refill_max_frames)
                    .unwrap_or(defaults.refill_max_frames),
                buffer_seconds: args
                    .buffer_seconds
                    .or(out_file.buffer_seconds)
                    .unwrap_or(defaults.buffer_seconds),
                target_rate_hz: out_file.sample_rate.or(defaults.target_rate_hz),
            },
        }
    }
}
