//! CPAL-backed rendering handles.
//!
//! Every handle of a [`CpalBackend`] renders through the backend's single [`OutputBus`].
//! A handle owns at most one [`Voice`] plus the decode worker feeding it; chaining a
//! prepared handle with `set_next` hands its voice to the bus for a gapless switch.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::Sender;
use gapless_engine::{
    AudioSessionId, EventSink, HandleBackend, HandleError, HandleId, HandleState, MediaSource,
    RenderingHandle,
};

use crate::bus::{BusShared, OutputBus, Voice, VoicePhase};
use crate::config::OutputConfig;
use crate::decode::{DecodeWorker, OpenedSource, WorkerCommand, open_source, probe_with_timeout};
use crate::queue::{SharedAudio, calc_max_buffered_samples};
use crate::resample::StreamResampler;

/// Handle factory bound to one output device.
pub struct CpalBackend {
    bus: OutputBus,
    cfg: OutputConfig,
    next_id: AtomicU64,
    next_session: AtomicU32,
}

impl CpalBackend {
    pub fn open(device: cpal::Device, cfg: OutputConfig) -> Result<Self> {
        let bus = OutputBus::open(device, &cfg)?;
        Ok(Self {
            bus,
            cfg,
            next_id: AtomicU64::new(1),
            next_session: AtomicU32::new(1),
        })
    }

    pub fn bus(&self) -> &Arc<BusShared> {
        self.bus.shared()
    }
}

impl HandleBackend for CpalBackend {
    type Handle = CpalHandle;

    fn create_handle(&self) -> Result<CpalHandle, HandleError> {
        let id = HandleId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let session = AudioSessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(handle = %id, %session, "handle created");
        Ok(CpalHandle::new(id, session, self.bus.shared().clone(), self.cfg.clone()))
    }
}

struct PreparedVoice {
    voice: Arc<Voice>,
    ctrl: Sender<WorkerCommand>,
    _worker: JoinHandle<()>,
    duration_ms: Option<u64>,
}

enum Slot {
    Idle,
    SourceBound(OpenedSource),
    Prepared(PreparedVoice),
    /// Bind or prepare failed; only `reset`/`release` get out of here.
    Error,
    Released,
}

pub struct CpalHandle {
    id: HandleId,
    session: AudioSessionId,
    bus: Arc<BusShared>,
    cfg: OutputConfig,
    slot: Slot,
    sink: Option<EventSink>,
    volume: (f32, f32),
}

impl CpalHandle {
    pub(crate) fn new(
        id: HandleId,
        session: AudioSessionId,
        bus: Arc<BusShared>,
        cfg: OutputConfig,
    ) -> Self {
        Self {
            id,
            session,
            bus,
            cfg,
            slot: Slot::Idle,
            sink: None,
            volume: (1.0, 1.0),
        }
    }

    #[cfg(test)]
    pub(crate) fn voice(&self) -> Option<&Arc<Voice>> {
        match &self.slot {
            Slot::Prepared(p) => Some(&p.voice),
            _ => None,
        }
    }

    fn prepared(&self, op: &'static str) -> Result<&PreparedVoice, HandleError> {
        match &self.slot {
            Slot::Prepared(p) if p.voice.phase() != VoicePhase::Failed => Ok(p),
            _ => Err(HandleError::invalid_state(op, self.state())),
        }
    }

    fn frames_to_ms(&self, frames: u64) -> u64 {
        frames.saturating_mul(1000) / u64::from(self.bus.rate_hz().max(1))
    }

    fn seek_voice(&self, p: &PreparedVoice, ms: u64) {
        let ms = p.duration_ms.map_or(ms, |d| ms.min(d));
        let frame = ms.saturating_mul(u64::from(self.bus.rate_hz())) / 1000;
        p.voice.begin_seek(frame);
        self.bus.discard_buffered(self.id);
        // Ended by the worker's `reopen()`.
        p.voice.queue().discard_until_reopen();
        if p.ctrl.send(WorkerCommand::Seek(ms)).is_err() {
            p.voice.finish_seek();
        }
    }

    /// Stop the worker and make sure the bus never plays this voice again.
    fn teardown(&mut self) {
        if let Slot::Prepared(p) = std::mem::replace(&mut self.slot, Slot::Idle) {
            let _ = p.ctrl.send(WorkerCommand::Stop);
            p.voice.sink().set(None);
            p.voice.set_next(None);
            if p.voice.phase() != VoicePhase::Failed {
                p.voice.set_phase(VoicePhase::Completed);
            }
            p.voice.queue().close();
            self.bus.deactivate(self.id);
        }
    }
}

impl RenderingHandle for CpalHandle {
    fn id(&self) -> HandleId {
        self.id
    }

    fn state(&self) -> HandleState {
        match &self.slot {
            Slot::Idle => HandleState::Idle,
            Slot::SourceBound(_) => HandleState::SourceBound,
            Slot::Error => HandleState::Failed,
            Slot::Released => HandleState::Released,
            Slot::Prepared(p) => match p.voice.phase() {
                VoicePhase::Prepared => HandleState::Prepared,
                VoicePhase::Started => HandleState::Started,
                VoicePhase::Paused => HandleState::Paused,
                VoicePhase::Completed => HandleState::Completed,
                VoicePhase::Failed => HandleState::Failed,
            },
        }
    }

    fn reset(&mut self) {
        if matches!(self.slot, Slot::Released) {
            return;
        }
        self.teardown();
        self.slot = Slot::Idle;
        self.sink = None;
    }

    fn set_source(&mut self, source: MediaSource) -> Result<(), HandleError> {
        if !matches!(self.slot, Slot::Idle) {
            return Err(HandleError::invalid_state("set_source", self.state()));
        }
        match open_source(source) {
            Ok(opened) => {
                tracing::debug!(handle = %self.id, source = %opened.label(), "source bound");
                self.slot = Slot::SourceBound(opened);
                Ok(())
            }
            Err(e) => {
                self.slot = Slot::Error;
                Err(e)
            }
        }
    }

    fn prepare(&mut self, timeout: Duration) -> Result<(), HandleError> {
        let opened = match std::mem::replace(&mut self.slot, Slot::Error) {
            Slot::SourceBound(opened) => opened,
            other => {
                self.slot = other;
                return Err(HandleError::invalid_state("prepare", self.state()));
            }
        };
        let label = opened.label().to_string();

        let track = probe_with_timeout(opened, timeout)?;
        let dst_rate = self.bus.rate_hz();
        let resampler =
            StreamResampler::new(track.rate, dst_rate, track.channels, self.cfg.chunk_frames)
                .map_err(|e| HandleError::Prepare(format!("{label}: {e:#}")))?;

        let max_samples =
            calc_max_buffered_samples(dst_rate, track.channels, self.cfg.buffer_seconds);
        let queue = Arc::new(SharedAudio::new(track.channels, max_samples));
        let voice = Arc::new(Voice::new(self.id, queue));
        voice.gain().set(self.volume.0, self.volume.1);
        voice.sink().set(self.sink.clone());

        tracing::info!(
            handle = %self.id,
            source = %label,
            codec = track.codec.unwrap_or("unknown"),
            src_rate_hz = track.rate,
            dst_rate_hz = dst_rate,
            channels = track.channels,
            duration_ms = ?track.duration_ms,
            "prepared"
        );

        let duration_ms = track.duration_ms;
        let (ctrl_tx, ctrl_rx) = crossbeam_channel::unbounded();
        let worker = DecodeWorker::new(track, resampler, voice.clone(), ctrl_rx).spawn()?;

        self.slot = Slot::Prepared(PreparedVoice {
            voice,
            ctrl: ctrl_tx,
            _worker: worker,
            duration_ms,
        });
        Ok(())
    }

    fn start(&mut self) -> Result<(), HandleError> {
        let p = self.prepared("start")?;
        if p.voice.phase() == VoicePhase::Completed {
            self.seek_voice(p, 0);
        }
        p.voice.set_phase(VoicePhase::Started);
        self.bus.activate(p.voice.clone());
        Ok(())
    }

    fn pause(&mut self) -> Result<(), HandleError> {
        let p = self.prepared("pause")?;
        match p.voice.phase() {
            VoicePhase::Started | VoicePhase::Paused => {
                p.voice.set_phase(VoicePhase::Paused);
                Ok(())
            }
            _ => Err(HandleError::invalid_state("pause", self.state())),
        }
    }

    fn is_playing(&self) -> bool {
        self.state() == HandleState::Started
    }

    fn seek_to(&mut self, ms: u64) -> Result<(), HandleError> {
        let p = self.prepared("seek")?;
        self.seek_voice(p, ms);
        Ok(())
    }

    fn position_ms(&self) -> Result<u64, HandleError> {
        let p = self.prepared("position")?;
        let ms = self.frames_to_ms(p.voice.played_frames());
        Ok(p.duration_ms.map_or(ms, |d| ms.min(d)))
    }

    fn duration_ms(&self) -> Result<u64, HandleError> {
        self.prepared("duration")?
            .duration_ms
            .ok_or(HandleError::Unavailable("duration"))
    }

    fn set_volume(&mut self, left: f32, right: f32) -> Result<(), HandleError> {
        match &self.slot {
            Slot::Released | Slot::Error => {
                return Err(HandleError::invalid_state("set_volume", self.state()));
            }
            Slot::Prepared(p) => p.voice.gain().set(left, right),
            Slot::Idle | Slot::SourceBound(_) => {}
        }
        self.volume = (left, right);
        Ok(())
    }

    fn audio_session_id(&self) -> AudioSessionId {
        self.session
    }

    fn set_audio_session_id(&mut self, id: AudioSessionId) -> Result<(), HandleError> {
        if !matches!(self.slot, Slot::Idle) {
            return Err(HandleError::invalid_state("set_audio_session_id", self.state()));
        }
        self.session = id;
        Ok(())
    }

    fn set_next(&mut self, next: Option<&Self>) -> Result<(), HandleError> {
        let p = self.prepared("set_next")?;
        if !matches!(
            p.voice.phase(),
            VoicePhase::Prepared | VoicePhase::Started | VoicePhase::Paused
        ) {
            return Err(HandleError::invalid_state("set_next", self.state()));
        }

        let Some(next) = next else {
            p.voice.set_next(None);
            return Ok(());
        };
        if next.id == self.id {
            return Err(HandleError::InvalidArgument("cannot chain to self".to_string()));
        }
        let next_voice = match &next.slot {
            Slot::Prepared(n) if n.voice.phase() == VoicePhase::Prepared => n.voice.clone(),
            _ => {
                return Err(HandleError::InvalidArgument(format!(
                    "next handle {} is {:?}, not prepared",
                    next.id,
                    next.state()
                )));
            }
        };

        tracing::debug!(handle = %self.id, next = %next.id, "chained");
        p.voice.set_next(Some(next_voice));
        Ok(())
    }

    fn set_event_sink(&mut self, sink: Option<EventSink>) {
        if let Slot::Prepared(p) = &self.slot {
            p.voice.sink().set(sink.clone());
        }
        self.sink = sink;
    }

    fn release(&mut self) {
        if matches!(self.slot, Slot::Released) {
            return;
        }
        self.teardown();
        self.slot = Slot::Released;
        self.sink = None;
        tracing::debug!(handle = %self.id, "released");
    }
}

impl Drop for CpalHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::tests::wav_source;
    use gapless_engine::{BindToken, HandleEvent};
    use std::thread;
    use std::time::Instant;

    const RATE: u32 = 8_000;
    const TIMEOUT: Duration = Duration::from_secs(5);

    fn bus() -> Arc<BusShared> {
        Arc::new(BusShared::new(1, RATE, 256))
    }

    fn handle(id: u64, bus: &Arc<BusShared>) -> CpalHandle {
        CpalHandle::new(
            HandleId(id),
            AudioSessionId(id as u32),
            bus.clone(),
            OutputConfig::default(),
        )
    }

    fn prepared(id: u64, bus: &Arc<BusShared>, frames: u32) -> CpalHandle {
        let mut h = handle(id, bus);
        h.set_source(wav_source(RATE, 1, frames)).unwrap();
        h.prepare(TIMEOUT).unwrap();
        wait_decoded(&h);
        h
    }

    fn wait_decoded(h: &CpalHandle) {
        let q = h.voice().unwrap().queue().clone();
        let deadline = Instant::now() + TIMEOUT;
        while !q.is_done() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(q.is_done());
    }

    fn render_frames(bus: &BusShared, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0; frames];
        bus.render(&mut out);
        out
    }

    #[test]
    fn lifecycle_reaches_completed_and_posts_event() {
        let bus = bus();
        let mut h = prepared(1, &bus, 200);
        let (tx, rx) = crossbeam_channel::unbounded();
        h.set_event_sink(Some(EventSink::new(tx, BindToken(7))));
        assert_eq!(h.state(), HandleState::Prepared);
        assert_eq!(h.duration_ms().unwrap(), 25);

        h.start().unwrap();
        assert!(h.is_playing());
        let out = render_frames(&bus, 300);
        assert!(out[..200].iter().all(|s| (s - 0.25).abs() < 1e-3));
        assert!(out[200..].iter().all(|s| *s == 0.0));

        assert_eq!(h.state(), HandleState::Completed);
        let posted = rx.try_recv().unwrap();
        assert_eq!(posted.bind, BindToken(7));
        assert_eq!(posted.event, HandleEvent::Completed(HandleId(1)));
        assert_eq!(h.position_ms().unwrap(), 25);
    }

    #[test]
    fn chained_handle_plays_without_gap() {
        let bus = bus();
        let mut first = prepared(1, &bus, 100);
        let second = prepared(2, &bus, 100);
        first.set_next(Some(&second)).unwrap();

        first.start().unwrap();
        let out = render_frames(&bus, 150);
        assert!(out.iter().all(|s| (s - 0.25).abs() < 1e-3));
        assert_eq!(first.state(), HandleState::Completed);
        assert_eq!(second.state(), HandleState::Started);
        assert_eq!(second.position_ms().unwrap(), 6);
    }

    #[test]
    fn set_next_rejects_self_and_unprepared() {
        let bus = bus();
        let mut first = prepared(1, &bus, 100);
        let idle = handle(2, &bus);
        assert!(matches!(
            first.set_next(Some(&idle)),
            Err(HandleError::InvalidArgument(_))
        ));

        let mut lone = handle(3, &bus);
        assert!(matches!(
            lone.set_next(None),
            Err(HandleError::InvalidState { .. })
        ));
        first.set_next(None).unwrap();
    }

    #[test]
    fn pause_holds_position() {
        let bus = bus();
        let mut h = prepared(1, &bus, 800);
        h.start().unwrap();
        render_frames(&bus, 80);
        h.pause().unwrap();
        render_frames(&bus, 80);
        assert_eq!(h.state(), HandleState::Paused);
        assert_eq!(h.position_ms().unwrap(), 10);
    }

    #[test]
    fn start_after_completion_restarts_from_zero() {
        let bus = bus();
        let mut h = prepared(1, &bus, 80);
        h.start().unwrap();
        render_frames(&bus, 100);
        assert_eq!(h.state(), HandleState::Completed);

        h.start().unwrap();
        assert_eq!(h.position_ms().unwrap(), 0);
        let deadline = Instant::now() + TIMEOUT;
        while h.voice().unwrap().is_seeking() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        wait_decoded(&h);
        let out = render_frames(&bus, 40);
        assert!(out.iter().all(|s| (s - 0.25).abs() < 1e-3));
        assert_eq!(h.state(), HandleState::Started);
    }

    #[test]
    fn seek_keeps_audio_refilled_by_worker() {
        let bus = bus();
        let mut h = prepared(1, &bus, 800);
        let voice = h.voice().unwrap().clone();
        h.seek_to(0).unwrap();

        let deadline = Instant::now() + TIMEOUT;
        while voice.is_seeking() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        wait_decoded(&h);
        assert_eq!(voice.queue().len_frames(), 800);
        assert_eq!(h.position_ms().unwrap(), 0);
    }

    #[test]
    fn seek_is_clamped_to_duration() {
        let bus = bus();
        let mut h = prepared(1, &bus, 800);
        h.seek_to(60_000).unwrap();
        assert_eq!(h.position_ms().unwrap(), 100);
    }

    #[test]
    fn session_id_only_settable_while_idle() {
        let bus = bus();
        let mut h = handle(1, &bus);
        h.set_audio_session_id(AudioSessionId(77)).unwrap();
        h.set_source(wav_source(RATE, 1, 10)).unwrap();
        assert!(h.set_audio_session_id(AudioSessionId(5)).is_err());
        h.reset();
        assert_eq!(h.state(), HandleState::Idle);
        assert_eq!(h.audio_session_id(), AudioSessionId(77));
    }

    #[test]
    fn missing_file_leaves_handle_failed() {
        let bus = bus();
        let mut h = handle(1, &bus);
        let err = h
            .set_source(MediaSource::Path("/no/such/track.flac".into()))
            .unwrap_err();
        assert!(matches!(err, HandleError::Bind(_)));
        assert_eq!(h.state(), HandleState::Failed);
        h.reset();
        assert_eq!(h.state(), HandleState::Idle);
    }

    #[test]
    fn volume_before_prepare_carries_over() {
        let bus = bus();
        let mut h = handle(1, &bus);
        h.set_volume(0.5, 0.5).unwrap();
        h.set_source(wav_source(RATE, 1, 100)).unwrap();
        h.prepare(TIMEOUT).unwrap();
        assert_eq!(h.voice().unwrap().gain().get(), (0.5, 0.5));
    }

    #[test]
    fn release_is_idempotent_and_silences_bus() {
        let bus = bus();
        let mut h = prepared(1, &bus, 800);
        h.start().unwrap();
        assert_eq!(bus.active_id(), Some(HandleId(1)));
        h.release();
        h.release();
        assert_eq!(h.state(), HandleState::Released);
        assert_eq!(bus.active_id(), None);
        assert!(matches!(h.start(), Err(HandleError::Released)));
    }
}
