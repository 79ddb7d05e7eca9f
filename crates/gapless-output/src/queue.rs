//! Bounded queue of interleaved samples between a voice's decode worker and the output bus.
//!
//! - the decode worker pushes (blocking when full)
//! - the bus callback pops without blocking
//! - `close()` marks end of media; a closed queue that drains to empty means "completed"
//! - `discard_until_reopen()`/`reopen()` support seeking, including seeking back after end of media

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};

/// Thread-safe bounded queue for interleaved `f32` audio samples.
///
/// The `done` flag lives under the same mutex as the samples so "closed and empty" is
/// observed atomically by the bus.
pub struct SharedAudio {
    channels: usize,
    inner: Mutex<SharedInner>,
    cv: Condvar,
    max_buffered_samples: usize,
}

struct SharedInner {
    queue: VecDeque<f32>,
    done: bool,
    /// Pushes are dropped until the producer reopens the queue.
    discarding: bool,
}

/// Queue capacity in **samples** for `buffer_seconds` of audio at `(rate, channels)`.
///
/// Non-finite or non-positive `buffer_seconds` falls back to 2 seconds.
pub fn calc_max_buffered_samples(rate_hz: u32, channels: usize, buffer_seconds: f32) -> usize {
    let secs = if buffer_seconds.is_finite() && buffer_seconds > 0.0 {
        buffer_seconds
    } else {
        2.0
    };

    let frames = (rate_hz as f32 * secs).ceil() as usize;
    frames.saturating_mul(channels)
}

impl SharedAudio {
    pub fn new(channels: usize, max_buffered_samples: usize) -> Self {
        let channels = channels.max(1);
        Self {
            channels,
            inner: Mutex::new(SharedInner {
                queue: VecDeque::new(),
                done: false,
                discarding: false,
            }),
            cv: Condvar::new(),
            max_buffered_samples: max_buffered_samples.max(channels),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SharedInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Capacity in frames.
    pub fn max_frames(&self) -> usize {
        self.max_buffered_samples / self.channels
    }

    /// Buffered frames (best-effort snapshot).
    pub fn len_frames(&self) -> usize {
        self.lock().queue.len() / self.channels
    }

    pub fn is_done(&self) -> bool {
        self.lock().done
    }

    /// Closed by the producer and fully consumed.
    pub fn is_drained(&self) -> bool {
        let g = self.lock();
        g.done && g.queue.len() < self.channels
    }

    /// Mark end of media and wake blocked pushers. Idempotent.
    pub fn close(&self) {
        let mut g = self.lock();
        g.done = true;
        drop(g);
        self.cv.notify_all();
    }

    /// Drop all buffered samples and swallow pushes until the next `reopen()`.
    ///
    /// Wakes a blocked pusher so it can pick up its next command.
    pub fn discard_until_reopen(&self) {
        let mut g = self.lock();
        g.queue.clear();
        g.discarding = true;
        drop(g);
        self.cv.notify_all();
    }

    /// Clear and accept pushes again after `close()` or `discard_until_reopen()`.
    pub fn reopen(&self) {
        let mut g = self.lock();
        g.queue.clear();
        g.done = false;
        g.discarding = false;
        drop(g);
        self.cv.notify_all();
    }

    /// Push interleaved samples, blocking while the queue is full.
    ///
    /// Returns `false` if the queue was closed before everything was pushed. While
    /// discarding, the samples are dropped and the push reports success.
    pub fn push_interleaved_blocking(&self, samples: &[f32]) -> bool {
        let mut offset = 0;

        while offset < samples.len() {
            let mut g = self.lock();

            while g.queue.len() >= self.max_buffered_samples && !g.done && !g.discarding {
                g = self.cv.wait(g).unwrap_or_else(|e| e.into_inner());
            }
            if g.done {
                return false;
            }
            if g.discarding {
                return true;
            }

            let room = self.max_buffered_samples - g.queue.len();
            let take = room.min(samples.len() - offset);
            g.queue.extend(&samples[offset..offset + take]);
            offset += take;

            drop(g);
            self.cv.notify_all();
        }
        true
    }

    /// Pop up to `max_frames` whole frames without blocking. `None` when no full frame is buffered.
    pub fn pop_up_to(&self, max_frames: usize) -> Option<Vec<f32>> {
        let mut g = self.lock();

        let available_frames = g.queue.len() / self.channels;
        let take_samples = available_frames.min(max_frames) * self.channels;
        if take_samples == 0 {
            return None;
        }

        let out: Vec<f32> = g.queue.drain(..take_samples).collect();
        drop(g);
        self.cv.notify_all();
        Some(out)
    }
}
