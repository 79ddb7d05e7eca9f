//! Per-voice decode stage.
//!
//! Uses Symphonia to:
//! - open and probe the bound source (bounded by the prepare timeout)
//! - decode packets into interleaved `f32` samples
//! - resample to the bus rate and push into the voice's bounded [`SharedAudio`] queue
//!
//! The worker thread stays alive after end of media so a completed voice can be seeked
//! and restarted; it exits on [`WorkerCommand::Stop`] or when its control channel closes.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use gapless_engine::{HandleError, SourceStream};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, CodecParameters, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;

use crate::bus::{ERROR_IO, ERROR_MALFORMED, ERROR_UNKNOWN, Voice};
use crate::resample::StreamResampler;

/// Consecutive undecodable packets tolerated before the voice is failed.
const MAX_DECODE_ERRORS: usize = 16;

/// Adapts a resolver-provided stream to Symphonia's [`MediaSource`].
pub struct StreamSource {
    inner: Box<dyn SourceStream>,
    byte_len: Option<u64>,
}

impl StreamSource {
    pub fn new(inner: Box<dyn SourceStream>, byte_len: Option<u64>) -> Self {
        Self { inner, byte_len }
    }
}

impl Read for StreamSource {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Seek for StreamSource {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl MediaSource for StreamSource {
    fn is_seekable(&self) -> bool {
        true
    }

    fn byte_len(&self) -> Option<u64> {
        self.byte_len
    }
}

/// A bound, not yet probed source.
pub struct OpenedSource {
    source: Box<dyn MediaSource>,
    hint: Hint,
    label: String,
}

impl OpenedSource {
    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Open the bytes behind `source`. Missing files fail here, not at prepare.
pub fn open_source(source: gapless_engine::MediaSource) -> Result<OpenedSource, HandleError> {
    let mut hint = Hint::new();
    match source {
        gapless_engine::MediaSource::Path(path) => {
            let file = File::open(&path)
                .map_err(|e| HandleError::Bind(format!("open {}: {e}", path.display())))?;
            if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
                hint.with_extension(ext);
            }
            Ok(OpenedSource {
                source: Box::new(file),
                hint,
                label: path.display().to_string(),
            })
        }
        gapless_engine::MediaSource::Stream {
            stream,
            hint: ext,
            byte_len,
        } => {
            if let Some(ext) = ext.as_deref() {
                hint.with_extension(ext);
            }
            Ok(OpenedSource {
                source: Box::new(StreamSource::new(stream, byte_len)),
                hint,
                label: format!("stream.{}", ext.unwrap_or_default()),
            })
        }
    }
}

/// Probed container with a ready decoder for its default track.
pub struct ProbedTrack {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    pub rate: u32,
    pub channels: usize,
    pub duration_ms: Option<u64>,
    pub codec: Option<&'static str>,
}

/// Probe and build the decoder on a helper thread, giving up after `timeout`.
///
/// A probe that times out keeps running in the background and its result is dropped.
pub fn probe_with_timeout(
    opened: OpenedSource,
    timeout: Duration,
) -> Result<ProbedTrack, HandleError> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    let label = opened.label.clone();
    thread::Builder::new()
        .name("gapless-probe".to_string())
        .spawn(move || {
            let _ = tx.send(probe(opened));
        })?;

    match rx.recv_timeout(timeout) {
        Ok(Ok(track)) => Ok(track),
        Ok(Err(e)) => Err(HandleError::Prepare(format!("{label}: {e:#}"))),
        Err(RecvTimeoutError::Timeout) => {
            tracing::warn!(source = %label, ?timeout, "prepare timed out");
            Err(HandleError::PrepareTimeout(timeout))
        }
        Err(RecvTimeoutError::Disconnected) => {
            Err(HandleError::Prepare(format!("{label}: probe thread exited")))
        }
    }
}

fn probe(opened: OpenedSource) -> Result<ProbedTrack> {
    let mss = MediaSourceStream::new(opened.source, Default::default());
    let probed = symphonia::default::get_probe().format(
        &opened.hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| anyhow!("No audio track"))?;
    let track_id = track.id;

    let codec_params: CodecParameters = track.codec_params.clone();
    let channels = codec_params
        .channels
        .ok_or_else(|| anyhow!("Unknown channels"))?
        .count();
    let rate = codec_params
        .sample_rate
        .ok_or_else(|| anyhow!("Unknown sample rate"))?;
    let decoder = symphonia::default::get_codecs().make(&codec_params, &DecoderOptions::default())?;

    Ok(ProbedTrack {
        track_id,
        format,
        decoder,
        rate,
        channels,
        duration_ms: duration_ms_from_codec_params(&codec_params),
        codec: codec_name_from_params(&codec_params),
    })
}

/// Messages from the owning handle to its decode worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerCommand {
    Seek(u64),
    Stop,
}

enum Step {
    Continue,
    EndOfMedia,
    /// Queue was closed by the owner.
    Halted,
    Failed(i32),
}

/// Decodes one track into its voice's queue.
pub struct DecodeWorker {
    track: ProbedTrack,
    resampler: StreamResampler,
    voice: Arc<Voice>,
    ctrl: Receiver<WorkerCommand>,
    scratch: Vec<f32>,
    decode_errors: usize,
}

impl DecodeWorker {
    pub fn new(
        track: ProbedTrack,
        resampler: StreamResampler,
        voice: Arc<Voice>,
        ctrl: Receiver<WorkerCommand>,
    ) -> Self {
        Self {
            track,
            resampler,
            voice,
            ctrl,
            scratch: Vec::new(),
            decode_errors: 0,
        }
    }

    pub fn spawn(self) -> Result<thread::JoinHandle<()>, HandleError> {
        let name = format!("decode-{}", self.voice.id());
        Ok(thread::Builder::new().name(name).spawn(move || self.run())?)
    }

    fn run(mut self) {
        loop {
            match self.ctrl.try_recv() {
                Ok(WorkerCommand::Seek(ms)) => self.seek(ms),
                Ok(WorkerCommand::Stop) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }

            match self.step() {
                Step::Continue => {}
                Step::EndOfMedia => {
                    self.finish();
                    if !self.wait_for_seek() {
                        break;
                    }
                }
                Step::Halted => {
                    if !self.wait_for_seek() {
                        break;
                    }
                }
                Step::Failed(code) => {
                    self.voice.queue().close();
                    self.voice.fail(code);
                    break;
                }
            }
        }
        tracing::debug!(handle = %self.voice.id(), "decode worker exit");
    }

    fn step(&mut self) -> Step {
        let packet = match self.track.format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Step::EndOfMedia;
            }
            Err(SymphoniaError::ResetRequired) => return Step::EndOfMedia,
            Err(e) => {
                tracing::warn!(handle = %self.voice.id(), "read error: {e}");
                return Step::Failed(ERROR_IO);
            }
        };

        if packet.track_id() != self.track.track_id {
            return Step::Continue;
        }

        let decoded = match self.track.decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(msg)) => {
                self.decode_errors += 1;
                tracing::debug!(handle = %self.voice.id(), "skipping bad packet: {msg}");
                if self.decode_errors > MAX_DECODE_ERRORS {
                    return Step::Failed(ERROR_MALFORMED);
                }
                return Step::Continue;
            }
            Err(SymphoniaError::IoError(e)) => {
                tracing::warn!(handle = %self.voice.id(), "decode io error: {e}");
                return Step::Failed(ERROR_IO);
            }
            Err(e) => {
                tracing::warn!(handle = %self.voice.id(), "decode error: {e}");
                return Step::Failed(ERROR_MALFORMED);
            }
        };
        self.decode_errors = 0;

        let mut sample_buf = SampleBuffer::<f32>::new(decoded.frames() as u64, *decoded.spec());
        sample_buf.copy_interleaved_ref(decoded);

        self.scratch.clear();
        if let Err(e) = self.resampler.process(sample_buf.samples(), &mut self.scratch) {
            tracing::warn!(handle = %self.voice.id(), "resample error: {e:#}");
            return Step::Failed(ERROR_UNKNOWN);
        }
        if !self.voice.queue().push_interleaved_blocking(&self.scratch) {
            return Step::Halted;
        }
        Step::Continue
    }

    /// Flush the resampler tail and mark the queue complete.
    fn finish(&mut self) {
        self.scratch.clear();
        if let Err(e) = self.resampler.flush(&mut self.scratch) {
            tracing::warn!(handle = %self.voice.id(), "resample flush error: {e:#}");
        }
        self.voice.queue().push_interleaved_blocking(&self.scratch);
        self.voice.queue().close();
        tracing::debug!(handle = %self.voice.id(), "end of media");
    }

    /// Park until the owner seeks (returns `true`) or stops (returns `false`).
    fn wait_for_seek(&mut self) -> bool {
        match self.ctrl.recv() {
            Ok(WorkerCommand::Seek(ms)) => {
                self.seek(ms);
                true
            }
            Ok(WorkerCommand::Stop) | Err(_) => false,
        }
    }

    fn seek(&mut self, ms: u64) {
        let time = Time::new(ms / 1000, (ms % 1000) as f64 / 1000.0);
        if let Err(e) = self.track.format.seek(
            SeekMode::Accurate,
            SeekTo::Time {
                time,
                track_id: Some(self.track.track_id),
            },
        ) {
            tracing::warn!(handle = %self.voice.id(), ms, "seek failed: {e}");
        }
        self.track.decoder.reset();
        self.resampler.reset();
        self.decode_errors = 0;
        self.voice.queue().reopen();
        self.voice.finish_seek();
    }
}

/// Best-effort duration in milliseconds from codec metadata.
fn duration_ms_from_codec_params(codec_params: &CodecParameters) -> Option<u64> {
    let frames = codec_params.n_frames?;
    let rate = codec_params.sample_rate? as u64;
    if rate == 0 {
        return None;
    }
    Some(frames.saturating_mul(1000) / rate)
}

fn codec_name_from_params(params: &CodecParameters) -> Option<&'static str> {
    use symphonia::core::codecs::*;
    let name = match params.codec {
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_AAC => "AAC",
        CODEC_TYPE_ALAC => "ALAC",
        CODEC_TYPE_VORBIS => "VORBIS",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "PCM_S32",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        _ => return None,
    };
    Some(name)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    /// Minimal 16-bit PCM WAV with `frames` frames of a constant value.
    pub(crate) fn wav_bytes(rate: u32, channels: u16, frames: u32) -> Vec<u8> {
        let block_align = channels * 2;
        let data_len = frames * block_align as u32;
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVEfmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&rate.to_le_bytes());
        out.extend_from_slice(&(rate * block_align as u32).to_le_bytes());
        out.extend_from_slice(&block_align.to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        for _ in 0..frames * channels as u32 {
            out.extend_from_slice(&8192i16.to_le_bytes());
        }
        out
    }

    pub(crate) fn wav_source(rate: u32, channels: u16, frames: u32) -> gapless_engine::MediaSource {
        gapless_engine::MediaSource::Stream {
            stream: Box::new(Cursor::new(wav_bytes(rate, channels, frames))),
            hint: Some("wav".to_string()),
            byte_len: None,
        }
    }

    #[test]
    fn duration_ms_from_codec_params_handles_zero_rate() {
        let mut params = CodecParameters::new();
        params.sample_rate = Some(0);
        params.n_frames = Some(100);
        assert!(duration_ms_from_codec_params(&params).is_none());
    }

    #[test]
    fn duration_ms_from_codec_params_computes() {
        let mut params = CodecParameters::new();
        params.sample_rate = Some(48_000);
        params.n_frames = Some(96_000);
        assert_eq!(duration_ms_from_codec_params(&params), Some(2000));
    }

    #[test]
    fn missing_file_fails_to_open() {
        let err = open_source(gapless_engine::MediaSource::Path(
            "/definitely/not/here.flac".into(),
        ))
        .err()
        .unwrap();
        assert!(matches!(err, HandleError::Bind(_)));
    }

    #[test]
    fn stream_source_reports_length_and_reads() {
        let mut src = StreamSource::new(Box::new(Cursor::new(vec![1u8, 2, 3])), Some(3));
        assert!(src.is_seekable());
        assert_eq!(src.byte_len(), Some(3));
        src.seek(SeekFrom::Start(1)).unwrap();
        let mut buf = [0u8; 2];
        src.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [2, 3]);
    }

    #[test]
    fn probes_wav_stream() {
        let opened = open_source(wav_source(8_000, 2, 800)).unwrap();
        let track = probe_with_timeout(opened, Duration::from_secs(5)).unwrap();
        assert_eq!(track.rate, 8_000);
        assert_eq!(track.channels, 2);
        assert_eq!(track.duration_ms, Some(100));
        assert_eq!(track.codec, Some("PCM_S16"));
    }

    #[test]
    fn garbage_fails_prepare() {
        let opened = open_source(gapless_engine::MediaSource::Stream {
            stream: Box::new(Cursor::new(vec![0u8; 64])),
            hint: None,
            byte_len: Some(64),
        })
        .unwrap();
        let err = probe_with_timeout(opened, Duration::from_secs(5)).err().unwrap();
        assert!(matches!(err, HandleError::Prepare(_)));
    }

    #[test]
    fn worker_decodes_to_end_and_stops() {
        let opened = open_source(wav_source(8_000, 1, 400)).unwrap();
        let track = probe_with_timeout(opened, Duration::from_secs(5)).unwrap();
        let resampler = StreamResampler::new(track.rate, track.rate, track.channels, 256).unwrap();
        let queue = Arc::new(crate::queue::SharedAudio::new(1, 4096));
        let voice = Arc::new(Voice::new(gapless_engine::HandleId(1), queue.clone()));
        let (ctrl_tx, ctrl_rx) = crossbeam_channel::unbounded();

        let worker = DecodeWorker::new(track, resampler, voice, ctrl_rx).spawn().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !queue.is_done() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(queue.is_done());
        assert_eq!(queue.len_frames(), 400);
        let first = queue.pop_up_to(1).unwrap();
        assert!((first[0] - 0.25).abs() < 1e-3);

        ctrl_tx.send(WorkerCommand::Stop).unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn seek_after_end_refills_queue() {
        let opened = open_source(wav_source(8_000, 1, 400)).unwrap();
        let track = probe_with_timeout(opened, Duration::from_secs(5)).unwrap();
        let resampler = StreamResampler::new(track.rate, track.rate, track.channels, 256).unwrap();
        let queue = Arc::new(crate::queue::SharedAudio::new(1, 4096));
        let voice = Arc::new(Voice::new(gapless_engine::HandleId(2), queue.clone()));
        let (ctrl_tx, ctrl_rx) = crossbeam_channel::unbounded();
        let worker = DecodeWorker::new(track, resampler, voice.clone(), ctrl_rx)
            .spawn()
            .unwrap();

        let wait_done = |q: &crate::queue::SharedAudio| {
            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            while !q.is_done() && std::time::Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
        };
        wait_done(&queue);
        queue.pop_up_to(400);
        assert!(queue.is_drained());

        voice.begin_seek(0);
        ctrl_tx.send(WorkerCommand::Seek(0)).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while voice.is_seeking() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        wait_done(&queue);
        assert!(!voice.is_seeking());
        assert_eq!(queue.len_frames(), 400);

        drop(ctrl_tx);
        worker.join().unwrap();
    }
}
