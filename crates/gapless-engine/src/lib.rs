//! Gapless dual-handle playback engine.
//!
//! Drives a `current` and a prefetched `next` rendering handle so consecutive tracks play
//! back without a gap, composes output volume from replay gain and ducking, and recovers
//! from handle failures without stalling playback.
//!
//! Decoding and output live behind [`RenderingHandle`]/[`HandleBackend`]; what to play next
//! is decided by an external controller that receives [`PlaybackCallbacks`].

pub mod collaborators;
pub mod engine;
pub mod handle;
pub mod locator;
pub mod volume;

#[cfg(test)]
mod testing;

pub use collaborators::{
    EffectSessions, EngineDeps, GaplessSetting, NoopEffectSessions, NoopNotifier, Notifier,
    PlaybackCallbacks,
};
pub use engine::{EngineConfig, EngineState, PlaybackEngine, TIME_UNKNOWN};
pub use handle::{
    AudioSessionId, BindToken, BoundEvent, EventSink, HandleBackend, HandleError, HandleEvent,
    HandleId, HandleState, MediaSource, RenderingHandle, SourceStream,
};
pub use locator::{ContentResolver, Locator, NoContentResolver};
pub use volume::{VolumeComposer, replay_gain_from_db};
