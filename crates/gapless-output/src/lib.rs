//! CPAL + Symphonia rendering backend for `gapless-engine`.
//!
//! Each [`CpalHandle`] decodes one source on its own worker thread (Symphonia decode,
//! Rubato resample to the device rate) into a bounded queue. All handles of a
//! [`CpalBackend`] share one always-running output stream, which switches from a
//! completed voice to its chained successor inside the audio callback.

pub mod bus;
pub mod config;
pub mod decode;
pub mod device;
pub mod handle;
pub mod queue;
pub mod resample;

pub use bus::{ERROR_IO, ERROR_MALFORMED, ERROR_UNKNOWN};
pub use config::OutputConfig;
pub use device::{DeviceInfo, list_devices, pick_device};
pub use handle::{CpalBackend, CpalHandle};
