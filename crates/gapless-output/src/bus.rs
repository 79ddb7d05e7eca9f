//! Output bus: one CPAL stream shared by every handle of a backend.
//!
//! Exactly one [`Voice`] is audible at a time. The real-time callback:
//! - refills a small local buffer from the active voice's queue without blocking
//! - applies per-channel gain and basic channel mapping (mono↔stereo, best-effort otherwise)
//! - converts `f32` samples to the device sample format
//!
//! When the active voice's queue is closed and drained, the callback posts
//! [`HandleEvent::Completed`] for it and switches to its chained voice inside the same
//! callback, so the chained track's first frame directly follows the last frame of the
//! previous one.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::Sender;
use gapless_engine::{EventSink, HandleEvent, HandleId};

use crate::config::OutputConfig;
use crate::device::pick_buffer_size;
use crate::queue::SharedAudio;

/// Failure code for source read errors.
pub const ERROR_IO: i32 = -1004;
/// Failure code for undecodable media.
pub const ERROR_MALFORMED: i32 = -1007;
/// Failure code for output device errors and anything else.
pub const ERROR_UNKNOWN: i32 = 1;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Playback phase of a voice as driven by its handle and the bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum VoicePhase {
    Prepared = 0,
    Started = 1,
    Paused = 2,
    Completed = 3,
    Failed = 4,
}

impl VoicePhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => VoicePhase::Started,
            2 => VoicePhase::Paused,
            3 => VoicePhase::Completed,
            4 => VoicePhase::Failed,
            _ => VoicePhase::Prepared,
        }
    }
}

/// Where a voice posts its asynchronous events. Replaced or cleared by the owning handle.
#[derive(Default)]
pub struct VoiceSink(Mutex<Option<EventSink>>);

impl VoiceSink {
    pub fn set(&self, sink: Option<EventSink>) {
        *lock(&self.0) = sink;
    }

    pub fn post(&self, event: HandleEvent) -> bool {
        match lock(&self.0).as_ref() {
            Some(sink) => sink.post(event),
            None => false,
        }
    }
}

/// Left/right gain stored as `f32` bits so the callback reads it lock-free.
pub struct StereoGain {
    left: AtomicU32,
    right: AtomicU32,
}

impl Default for StereoGain {
    fn default() -> Self {
        Self {
            left: AtomicU32::new(1.0f32.to_bits()),
            right: AtomicU32::new(1.0f32.to_bits()),
        }
    }
}

impl StereoGain {
    pub fn set(&self, left: f32, right: f32) {
        self.left.store(left.to_bits(), Ordering::Relaxed);
        self.right.store(right.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> (f32, f32) {
        (
            f32::from_bits(self.left.load(Ordering::Relaxed)),
            f32::from_bits(self.right.load(Ordering::Relaxed)),
        )
    }
}

/// One prepared track as the bus sees it.
pub struct Voice {
    id: HandleId,
    queue: Arc<SharedAudio>,
    phase: AtomicU8,
    seeking: AtomicBool,
    played_frames: AtomicU64,
    gain: StereoGain,
    sink: VoiceSink,
    next: Mutex<Option<Arc<Voice>>>,
}

impl Voice {
    pub fn new(id: HandleId, queue: Arc<SharedAudio>) -> Self {
        Self {
            id,
            queue,
            phase: AtomicU8::new(VoicePhase::Prepared as u8),
            seeking: AtomicBool::new(false),
            played_frames: AtomicU64::new(0),
            gain: StereoGain::default(),
            sink: VoiceSink::default(),
            next: Mutex::new(None),
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn queue(&self) -> &Arc<SharedAudio> {
        &self.queue
    }

    pub fn phase(&self) -> VoicePhase {
        VoicePhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn set_phase(&self, phase: VoicePhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    pub fn played_frames(&self) -> u64 {
        self.played_frames.load(Ordering::Relaxed)
    }

    /// Reposition the frame counter and hold output until the worker has refilled.
    pub fn begin_seek(&self, frame: u64) {
        self.seeking.store(true, Ordering::Release);
        self.played_frames.store(frame, Ordering::Relaxed);
    }

    pub fn finish_seek(&self) {
        self.seeking.store(false, Ordering::Release);
    }

    pub fn is_seeking(&self) -> bool {
        self.seeking.load(Ordering::Acquire)
    }

    pub fn gain(&self) -> &StereoGain {
        &self.gain
    }

    pub fn sink(&self) -> &VoiceSink {
        &self.sink
    }

    pub fn set_next(&self, next: Option<Arc<Voice>>) {
        *lock(&self.next) = next;
    }

    pub fn next(&self) -> Option<Arc<Voice>> {
        lock(&self.next).clone()
    }

    /// Mark failed and notify the owner. Only the first failure is posted.
    pub fn fail(&self, code: i32) {
        let prev = self.phase.swap(VoicePhase::Failed as u8, Ordering::AcqRel);
        if prev == VoicePhase::Failed as u8 {
            return;
        }
        tracing::warn!(handle = %self.id, code, "voice failed");
        self.sink.post(HandleEvent::Failed {
            handle: self.id,
            code,
        });
    }
}

/// Callback-side mixing state, shared between the CPAL callback and the handles.
pub struct BusShared {
    channels: usize,
    rate_hz: u32,
    refill_max_frames: usize,
    active: Mutex<Option<Arc<Voice>>>,
    local: Mutex<LocalBuffer>,
    underrun_frames: AtomicU64,
    underrun_events: AtomicU64,
}

/// Interleaved samples already pulled from the active voice's queue.
#[derive(Default)]
struct LocalBuffer {
    pos: usize,
    src_channels: usize,
    src: Vec<f32>,
}

impl LocalBuffer {
    fn is_empty(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn clear(&mut self) {
        self.pos = 0;
        self.src.clear();
    }
}

impl BusShared {
    pub fn new(channels: usize, rate_hz: u32, refill_max_frames: usize) -> Self {
        Self {
            channels: channels.max(1),
            rate_hz,
            refill_max_frames: refill_max_frames.max(1),
            active: Mutex::new(None),
            local: Mutex::new(LocalBuffer::default()),
            underrun_frames: AtomicU64::new(0),
            underrun_events: AtomicU64::new(0),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn rate_hz(&self) -> u32 {
        self.rate_hz
    }

    pub fn underruns(&self) -> (u64, u64) {
        (
            self.underrun_events.load(Ordering::Relaxed),
            self.underrun_frames.load(Ordering::Relaxed),
        )
    }

    /// Make `voice` the audible one, replacing whatever was active.
    pub fn activate(&self, voice: Arc<Voice>) {
        let mut active = lock(&self.active);
        if active.as_ref().is_some_and(|v| Arc::ptr_eq(v, &voice)) {
            return;
        }
        lock(&self.local).clear();
        *active = Some(voice);
    }

    /// Silence `id` if it is the active voice.
    pub fn deactivate(&self, id: HandleId) {
        let mut active = lock(&self.active);
        if active.as_ref().is_some_and(|v| v.id() == id) {
            lock(&self.local).clear();
            *active = None;
        }
    }

    /// Drop locally buffered samples of `id` (after a seek).
    pub fn discard_buffered(&self, id: HandleId) {
        let active = lock(&self.active);
        if active.as_ref().is_some_and(|v| v.id() == id) {
            lock(&self.local).clear();
        }
    }

    pub fn active_id(&self) -> Option<HandleId> {
        lock(&self.active).as_ref().map(|v| v.id())
    }

    /// Fill `out` (interleaved, bus channel count) from the active voice.
    pub fn render(&self, out: &mut [f32]) {
        let channels_out = self.channels;
        let frames = out.len() / channels_out;
        let mut active = lock(&self.active);
        let mut st = lock(&self.local);

        let mut frame = 0usize;
        while frame < frames {
            let Some(voice) = (*active).clone() else {
                out[frame * channels_out..].fill(0.0);
                return;
            };

            if voice.phase() != VoicePhase::Started || voice.is_seeking() {
                out[frame * channels_out..].fill(0.0);
                return;
            }

            if st.is_empty() {
                st.clear();
                if let Some(v) = voice.queue().pop_up_to(self.refill_max_frames) {
                    st.src = v;
                    st.src_channels = voice.queue().channels();
                } else if voice.queue().is_drained() {
                    voice.set_phase(VoicePhase::Completed);
                    let next = voice.next();
                    voice.sink().post(HandleEvent::Completed(voice.id()));
                    match next {
                        Some(next) if next.phase() == VoicePhase::Prepared => {
                            next.set_phase(VoicePhase::Started);
                            tracing::debug!(from = %voice.id(), to = %next.id(), "gapless switch");
                            *active = Some(next);
                        }
                        _ => *active = None,
                    }
                    continue;
                } else {
                    self.underrun_events.fetch_add(1, Ordering::Relaxed);
                    self.underrun_frames
                        .fetch_add((frames - frame) as u64, Ordering::Relaxed);
                    out[frame * channels_out..].fill(0.0);
                    return;
                }
            }

            let (left, right) = voice.gain().get();
            let start = frame;
            while frame < frames && !st.is_empty() {
                for ch in 0..channels_out {
                    let gain = if ch % 2 == 0 { left } else { right };
                    out[frame * channels_out + ch] =
                        next_sample_mapped(&mut st, channels_out, ch) * gain;
                }
                frame += 1;
            }
            voice
                .played_frames
                .fetch_add((frame - start) as u64, Ordering::Relaxed);
        }
    }
}

/// Read one output sample for `dst_ch`, applying a simple channel mapping.
///
/// - mono → stereo: duplicate channel 0
/// - stereo → mono: average L/R
/// - other layouts: clamp to the available source channels
///
/// `st.pos` advances once per destination frame (after the last channel).
fn next_sample_mapped(st: &mut LocalBuffer, dst_channels: usize, dst_ch: usize) -> f32 {
    if st.pos >= st.src.len() {
        return 0.0;
    }

    let frame_start = st.pos;
    let src_channels = st.src_channels.max(1);
    let get = |ch: usize| -> f32 {
        if ch < src_channels && frame_start + ch < st.src.len() {
            st.src[frame_start + ch]
        } else {
            0.0
        }
    };

    let out = match (src_channels, dst_channels) {
        (2, 1) => 0.5 * (get(0) + get(1)),
        (1, _) => get(0),
        _ => get(dst_ch.min(src_channels - 1)),
    };

    if dst_ch + 1 == dst_channels {
        st.pos += src_channels;
    }
    out
}

/// Owns the CPAL stream. The stream lives on a dedicated thread because `cpal::Stream`
/// cannot be moved across threads on every host; dropping the bus stops that thread.
pub struct OutputBus {
    shared: Arc<BusShared>,
    stop_tx: Sender<()>,
    thread: Option<thread::JoinHandle<()>>,
}

impl OutputBus {
    /// Open `device` and start an always-running output stream.
    pub fn open(device: cpal::Device, cfg: &OutputConfig) -> Result<Self> {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<Arc<BusShared>>>(1);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let cfg = cfg.clone();

        let thread = thread::Builder::new()
            .name("gapless-output".to_string())
            .spawn(move || {
                let opened = open_stream(&device, &cfg);
                let (stream, shared) = match opened {
                    Ok(v) => v,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(shared));
                let _ = stop_rx.recv();
                drop(stream);
                tracing::debug!("output stream closed");
            })
            .context("spawn output thread")?;

        let shared = ready_rx
            .recv()
            .map_err(|_| anyhow!("output thread exited during setup"))??;

        Ok(Self {
            shared,
            stop_tx,
            thread: Some(thread),
        })
    }

    pub fn shared(&self) -> &Arc<BusShared> {
        &self.shared
    }
}

impl Drop for OutputBus {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

fn open_stream(device: &cpal::Device, cfg: &OutputConfig) -> Result<(cpal::Stream, Arc<BusShared>)> {
    let supported = crate::device::pick_output_config(device, cfg.target_rate_hz)?;
    let sample_format = supported.sample_format();
    let mut config: cpal::StreamConfig = supported.clone().into();
    if let Some(buffer_size) = pick_buffer_size(&supported) {
        config.buffer_size = buffer_size;
    }

    let shared = Arc::new(BusShared::new(
        config.channels as usize,
        config.sample_rate,
        cfg.refill_max_frames,
    ));

    let stream = match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, &config, &shared),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, &config, &shared),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, &config, &shared),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, &config, &shared),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }?;
    stream.play().context("start output stream")?;

    tracing::info!(
        rate_hz = config.sample_rate,
        channels = config.channels,
        format = ?sample_format,
        buffer = ?config.buffer_size,
        "output bus open"
    );

    Ok((stream, shared))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    shared: &Arc<BusShared>,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let shared_cb = shared.clone();
    let shared_err = shared.clone();
    let mut mix: Vec<f32> = Vec::new();

    let err_fn = move |err: cpal::StreamError| {
        tracing::warn!("stream error: {err}");
        if let Some(voice) = lock(&shared_err.active).as_ref().cloned() {
            voice.fail(ERROR_UNKNOWN);
        }
    };

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            mix.resize(data.len(), 0.0);
            shared_cb.render(&mut mix);
            for (dst, src) in data.iter_mut().zip(mix.iter()) {
                *dst = <T as cpal::Sample>::from_sample::<f32>(*src);
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}
