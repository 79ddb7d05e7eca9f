/// Output tuning shared by the decode/resample workers and the output bus.
#[derive(Clone, Debug)]
pub struct OutputConfig {
    /// Resampler chunk size in frames.
    pub chunk_frames: usize,
    /// Max frames pulled from a voice per output callback refill.
    pub refill_max_frames: usize,
    /// Decoded audio buffered ahead per voice, in seconds.
    pub buffer_seconds: f32,
    /// Preferred device sample rate; `None` takes the highest the device supports.
    pub target_rate_hz: Option<u32>,
}

impl Default for OutputConfig {
    /// Defaults tuned for low-risk playback across common devices.
    fn default() -> Self {
        Self {
            chunk_frames: 1024,
            refill_max_frames: 4096,
            buffer_seconds: 2.0,
            target_rate_hz: None,
        }
    }
}
