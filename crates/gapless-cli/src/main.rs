//! gapless-play: plays a list of audio files back to back with no gap between tracks.
//!
//! ## Pipeline
//! 1. **Engine**: `gapless-engine` keeps a playing `current` handle and a prepared `next`
//!    handle chained behind it.
//! 2. **Handles**: `gapless-output` decodes each track with Symphonia and resamples it with
//!    Rubato on its own worker thread.
//! 3. **Output**: one CPAL stream switches from a finished track to the chained one inside
//!    the audio callback.
//!
//! The queue controller picks what plays next; stdin accepts transport commands
//! (`pause`, `play`, `next`, `seek <secs>`, `duck <factor>`, `gapless on|off`, `status`, `quit`).

mod cli;
mod config;
mod controller;
mod hooks;

use std::io::BufRead;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use cpal::traits::DeviceTrait;
use crossbeam_channel::Sender;
use gapless_engine::{EngineDeps, NoContentResolver, PlaybackEngine, replay_gain_from_db};
use gapless_output::CpalBackend;
use tracing_subscriber::EnvFilter;

use crate::config::{PlayerConfig, Settings};
use crate::controller::{ChannelCallbacks, Command, ControllerMsg, Playlist, QueueController};
use crate::hooks::{LogNotifier, LoggingEffects};

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,gapless_engine=info,gapless_output=info")
        }))
        .init();
    let host = cpal::default_host();

    if args.list_devices {
        for (i, d) in gapless_output::list_devices(&host)?.iter().enumerate() {
            println!("#{i}: {} ({}-{} Hz)", d.name, d.min_rate, d.max_rate);
        }
        return Ok(());
    }

    if args.paths.is_empty() {
        return Err(anyhow!("no tracks given"));
    }

    let file_cfg = match &args.config {
        Some(path) => PlayerConfig::load(path)?,
        None => PlayerConfig::default(),
    };
    let settings = Settings::resolve(&args, file_cfg);

    let device = gapless_output::pick_device(&host, settings.device.as_deref())?;
    tracing::info!(device = %device.description()?, "output device");
    let backend = CpalBackend::open(device, settings.output.clone())?;

    let (tx, rx) = crossbeam_channel::unbounded();
    let gapless = Arc::new(AtomicBool::new(settings.gapless));
    let deps = EngineDeps {
        gapless: gapless.clone(),
        resolver: Arc::new(NoContentResolver),
        notifier: Arc::new(LogNotifier::new(tx.clone())),
        effects: Arc::new(LoggingEffects),
    };
    let engine = PlaybackEngine::new(backend, deps, settings.engine.clone())
        .context("create playback engine")?;
    if let Some(db) = settings.replay_gain_db {
        engine.set_replay_gain(replay_gain_from_db(db));
    }

    engine.set_callbacks(Some(Arc::new(ChannelCallbacks::new(tx.clone()))));
    let dispatcher = engine
        .spawn_event_dispatcher()
        .context("spawn event dispatcher")?;

    let engine_for_signal = engine.clone();
    let tx_for_signal = tx.clone();
    let _ = ctrlc::set_handler(move || {
        engine_for_signal.release();
        let _ = tx_for_signal.send(ControllerMsg::Command(Command::Quit));
    });

    spawn_stdin_reader(tx)?;

    tracing::info!(
        tracks = args.paths.len(),
        gapless = settings.gapless,
        prepare_timeout = ?settings.engine.prepare_timeout,
        "starting playback"
    );
    let result = QueueController::new(
        engine.clone(),
        Playlist::new(args.paths.clone()),
        gapless,
        rx,
    )
    .run();

    engine.release();
    let _ = dispatcher.join();
    result
}

/// Forward parsed stdin lines to the controller. EOF on stdin leaves playback running.
fn spawn_stdin_reader(tx: Sender<ControllerMsg>) -> Result<()> {
    thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<Command>() {
                    Ok(cmd) => {
                        if tx.send(ControllerMsg::Command(cmd)).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("{e:#}"),
                }
            }
        })
        .context("spawn stdin reader")?;
    Ok(())
}
