use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "gapless-play", version)]
pub struct Args {
    /// Audio files (or file:// URIs) to play in order
    pub paths: Vec<String>,

    /// TOML config file; flags given on the command line win over file values
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Disable gapless handoff (tracks still play back to back, with a short gap)
    #[arg(long)]
    pub no_gapless: bool,

    /// Replay gain in dB applied to every track
    #[arg(long, allow_negative_numbers = true)]
    pub replay_gain_db: Option<f32>,

    /// Resampler input chunk size in frames (higher => more latency, lower => more overhead)
    #[arg(long)]
    pub chunk_frames: Option<usize>,

    /// Playback callback refill cap (frames). Larger reduces lock churn but can add latency.
    #[arg(long)]
    pub refill_max_frames: Option<usize>,

    /// Decoded audio buffered ahead per track, in seconds
    #[arg(long)]
    pub buffer_seconds: Option<f32>,

    /// Give up preparing a track after this many milliseconds
    #[arg(long)]
    pub prepare_timeout_ms: Option<u64>,
}
