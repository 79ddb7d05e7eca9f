//! Queue manager driving the engine over an ordered track list.
//!
//! The engine decides nothing about *what* plays next; this controller does. Engine callbacks
//! arrive on the dispatcher thread and are forwarded here over a channel, so every engine call
//! is made from the controller's own thread.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, anyhow};
use crossbeam_channel::{Receiver, Sender};
use gapless_engine::{HandleBackend, PlaybackCallbacks, PlaybackEngine, TIME_UNKNOWN};

/// Transport command typed on stdin.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Command {
    Pause,
    Play,
    Next,
    /// Absolute position in milliseconds.
    Seek(u64),
    Duck(f32),
    Gapless(bool),
    Status,
    Quit,
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let cmd = parts.next().ok_or_else(|| anyhow!("empty command"))?;
        let arg = parts.next();
        let parsed = match (cmd.to_ascii_lowercase().as_str(), arg) {
            ("pause", None) => Command::Pause,
            ("play", None) => Command::Play,
            ("next", None) => Command::Next,
            ("status", None) => Command::Status,
            ("quit" | "exit", None) => Command::Quit,
            ("seek", Some(secs)) => {
                let secs: f64 = secs.parse().map_err(|_| anyhow!("bad seek time: {secs}"))?;
                if !secs.is_finite() || secs < 0.0 {
                    return Err(anyhow!("bad seek time: {secs}"));
                }
                Command::Seek((secs * 1000.0).round() as u64)
            }
            ("duck", Some(factor)) => Command::Duck(
                factor
                    .parse()
                    .map_err(|_| anyhow!("bad duck factor: {factor}"))?,
            ),
            ("gapless", Some("on")) => Command::Gapless(true),
            ("gapless", Some("off")) => Command::Gapless(false),
            _ => return Err(anyhow!("unknown command: {}", line.trim())),
        };
        if parts.next().is_some() {
            return Err(anyhow!("too many arguments: {}", line.trim()));
        }
        Ok(parsed)
    }
}

/// Everything the controller reacts to.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ControllerMsg {
    TrackAdvanced,
    TrackEnded,
    /// The engine gave up on a track; it may have been the playing one.
    Unplayable,
    Command(Command),
}

/// Forwards engine callbacks into the controller's channel.
pub struct ChannelCallbacks {
    tx: Sender<ControllerMsg>,
}

impl ChannelCallbacks {
    pub fn new(tx: Sender<ControllerMsg>) -> Self {
        Self { tx }
    }
}

impl PlaybackCallbacks for ChannelCallbacks {
    fn on_track_advanced(&self) {
        let _ = self.tx.send(ControllerMsg::TrackAdvanced);
    }

    fn on_track_ended(&self) {
        let _ = self.tx.send(ControllerMsg::TrackEnded);
    }
}

/// Ordered track list with a cursor on the track that `current` holds.
#[derive(Debug, Default)]
pub struct Playlist {
    tracks: Vec<String>,
    index: Option<usize>,
}

impl Playlist {
    pub fn new(tracks: Vec<String>) -> Self {
        Self {
            tracks,
            index: None,
        }
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn current(&self) -> Option<&str> {
        self.index.and_then(|i| self.tracks.get(i)).map(String::as_str)
    }

    /// Track after the cursor, if any.
    pub fn peek_next(&self) -> Option<&str> {
        self.tracks.get(self.next_index()).map(String::as_str)
    }

    pub fn next_index(&self) -> usize {
        self.index.map_or(0, |i| i + 1)
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.tracks.get(index).map(String::as_str)
    }

    pub fn set_index(&mut self, index: usize) {
        self.index = Some(index.min(self.tracks.len().saturating_sub(1)));
    }

    /// Move the cursor forward after a gapless handoff.
    pub fn advance(&mut self) {
        let next = self.next_index();
        if next < self.tracks.len() {
            self.index = Some(next);
        }
    }
}

enum Flow {
    Continue,
    Finished,
}

pub struct QueueController<B: HandleBackend> {
    engine: PlaybackEngine<B>,
    playlist: Playlist,
    gapless: Arc<AtomicBool>,
    rx: Receiver<ControllerMsg>,
}

impl<B: HandleBackend> QueueController<B> {
    pub fn new(
        engine: PlaybackEngine<B>,
        playlist: Playlist,
        gapless: Arc<AtomicBool>,
        rx: Receiver<ControllerMsg>,
    ) -> Self {
        Self {
            engine,
            playlist,
            gapless,
            rx,
        }
    }

    /// Play the list to its end (or until `quit`).
    pub fn run(mut self) -> Result<()> {
        if !self.load_from(0) {
            return Err(anyhow!("none of the {} track(s) could be played", self.playlist.len()));
        }

        while let Ok(msg) = self.rx.recv() {
            if self.engine.is_released() {
                break;
            }
            if let Flow::Finished = self.handle(msg) {
                break;
            }
        }
        Ok(())
    }

    fn handle(&mut self, msg: ControllerMsg) -> Flow {
        match msg {
            ControllerMsg::TrackAdvanced => {
                self.playlist.advance();
                tracing::info!(
                    track = self.playlist.current().unwrap_or_default(),
                    index = ?self.playlist.index(),
                    "now playing (gapless)"
                );
                self.preload_next();
                Flow::Continue
            }
            ControllerMsg::TrackEnded => self.skip_forward(),
            // A failed `current` with nothing prefetched leaves the engine uninitialized.
            ControllerMsg::Unplayable if !self.engine.is_initialized() => self.skip_forward(),
            ControllerMsg::Unplayable => Flow::Continue,
            ControllerMsg::Command(cmd) => self.command(cmd),
        }
    }

    fn command(&mut self, cmd: Command) -> Flow {
        match cmd {
            Command::Pause => self.engine.pause(),
            Command::Play => self.engine.start(),
            Command::Next => return self.skip_forward(),
            Command::Seek(ms) => self.engine.seek(ms),
            Command::Duck(factor) => self.engine.set_ducking_factor(factor),
            Command::Gapless(on) => {
                self.gapless.store(on, Ordering::Relaxed);
                tracing::info!(gapless = on, "gapless setting changed");
                self.preload_next();
            }
            Command::Status => self.print_status(),
            Command::Quit => return Flow::Finished,
        }
        Flow::Continue
    }

    fn skip_forward(&mut self) -> Flow {
        if self.load_from(self.playlist.next_index()) {
            Flow::Continue
        } else {
            tracing::info!("end of queue");
            Flow::Finished
        }
    }

    /// Bind the first playable track at or after `start` and play it.
    fn load_from(&mut self, start: usize) -> bool {
        for index in start..self.playlist.len() {
            let Some(track) = self.playlist.get(index) else {
                break;
            };
            if self.engine.set_source(track) {
                tracing::info!(track, index, "now playing");
                self.playlist.set_index(index);
                self.engine.start();
                self.preload_next();
                return true;
            }
            tracing::warn!(track, index, "skipping unplayable track");
        }
        false
    }

    fn preload_next(&self) {
        self.engine.set_next_source(self.playlist.peek_next());
    }

    fn print_status(&self) {
        let fmt = |ms: i64| {
            if ms == TIME_UNKNOWN {
                "--:--".to_string()
            } else {
                format!("{}:{:02}", ms / 60_000, (ms / 1000) % 60)
            }
        };
        println!(
            "{:?} [{}/{}] {} {} / {} volume={:.2} gapless={}",
            self.engine.engine_state(),
            self.playlist.index().map_or(0, |i| i + 1),
            self.playlist.len(),
            self.playlist.current().unwrap_or("-"),
            fmt(self.engine.position()),
            fmt(self.engine.duration()),
            self.engine.effective_volume(),
            self.gapless.load(Ordering::Relaxed),
        );
    }
}
