//! In-line resampling for a voice's decode worker.
//!
//! Converts decoded interleaved `f32` audio from the source rate to the bus rate with
//! Rubato's streaming sinc resampler. Input is accumulated into fixed-size chunks; the
//! partial tail is pushed through on [`StreamResampler::flush`] at end of media.

use anyhow::{Result, anyhow};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

pub struct StreamResampler {
    channels: usize,
    chunk_frames: usize,
    /// `None` when source and destination rates match.
    inner: Option<Box<dyn Resampler<f32>>>,
    pending: Vec<f32>,
    scratch: Vec<f32>,
}

impl StreamResampler {
    pub fn new(src_rate: u32, dst_rate: u32, channels: usize, chunk_frames: usize) -> Result<Self> {
        let channels = channels.max(1);
        let chunk_frames = chunk_frames.max(1);

        if src_rate == 0 || dst_rate == 0 {
            return Err(anyhow!("invalid sample rate {src_rate} -> {dst_rate}"));
        }

        let inner: Option<Box<dyn Resampler<f32>>> = if src_rate == dst_rate {
            None
        } else {
            let sinc_len = 128;
            let window = WindowFunction::BlackmanHarris2;
            let params = SincInterpolationParameters {
                sinc_len,
                f_cutoff: calculate_cutoff(sinc_len, window),
                interpolation: SincInterpolationType::Cubic,
                oversampling_factor: 256,
                window,
            };
            let resampler = Async::<f32>::new_sinc(
                dst_rate as f64 / src_rate as f64,
                1.1,
                &params,
                chunk_frames,
                channels,
                FixedAsync::Input,
            )
            .map_err(|e| anyhow!("resampler init: {e}"))?;
            Some(Box::new(resampler))
        };

        let scratch_frames = inner
            .as_ref()
            .map(|r| r.output_frames_max())
            .unwrap_or(chunk_frames);

        tracing::debug!(
            src_rate_hz = src_rate,
            dst_rate_hz = dst_rate,
            channels,
            chunk_frames,
            passthrough = inner.is_none(),
            "resampler ready"
        );

        Ok(Self {
            channels,
            chunk_frames,
            inner,
            pending: Vec::with_capacity(chunk_frames * channels),
            scratch: vec![0.0; scratch_frames * channels],
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    /// Feed interleaved input; converted output is appended to `out`.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) -> Result<()> {
        if self.inner.is_none() {
            out.extend_from_slice(input);
            return Ok(());
        }

        self.pending.extend_from_slice(input);
        let chunk_samples = self.chunk_frames * self.channels;
        let mut consumed = 0;
        while self.pending.len() - consumed >= chunk_samples {
            let chunk = self.pending[consumed..consumed + chunk_samples].to_vec();
            self.run(&chunk, None, out)?;
            consumed += chunk_samples;
        }
        self.pending.drain(..consumed);
        Ok(())
    }

    /// Push any partial chunk through the resampler. Call once at end of media.
    pub fn flush(&mut self, out: &mut Vec<f32>) -> Result<()> {
        if self.inner.is_none() {
            return Ok(());
        }
        let tail_frames = self.pending.len() / self.channels;
        if tail_frames == 0 {
            self.pending.clear();
            return Ok(());
        }

        let mut tail = std::mem::take(&mut self.pending);
        tail.truncate(tail_frames * self.channels);
        tail.resize(self.chunk_frames * self.channels, 0.0);
        self.run(&tail, Some(tail_frames), out)
    }

    /// Drop buffered input and filter state (after a seek).
    pub fn reset(&mut self) {
        self.pending.clear();
        if let Some(r) = self.inner.as_mut() {
            r.reset();
        }
    }

    fn run(&mut self, chunk: &[f32], partial_len: Option<usize>, out: &mut Vec<f32>) -> Result<()> {
        let Some(resampler) = self.inner.as_mut() else {
            return Ok(());
        };

        let input = InterleavedSlice::new(chunk, self.channels, self.chunk_frames)
            .map_err(|e| anyhow!("interleaved slice (input): {e}"))?;
        let out_capacity_frames = self.scratch.len() / self.channels;
        let mut output =
            InterleavedSlice::new_mut(&mut self.scratch, self.channels, out_capacity_frames)
                .map_err(|e| anyhow!("interleaved slice (output): {e}"))?;

        let indexing = Indexing {
            input_offset: 0,
            output_offset: 0,
            active_channels_mask: None,
            partial_len,
        };

        let (_nbr_in, nbr_out) = resampler
            .process_into_buffer(&input, &mut output, Some(&indexing))
            .map_err(|e| anyhow!("resampler process: {e}"))?;

        out.extend_from_slice(&self.scratch[..nbr_out * self.channels]);
        Ok(())
    }
}
