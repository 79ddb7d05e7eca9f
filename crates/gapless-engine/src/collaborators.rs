//! External collaborators the engine talks to.
//!
//! None of these decide anything about playback mechanics; they are the seams to the
//! queue manager, live configuration, user notices and audio-effect routing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::handle::AudioSessionId;
use crate::locator::{ContentResolver, NoContentResolver};

/// Controller-side sink for engine events.
pub trait PlaybackCallbacks: Send + Sync {
    /// `next` was promoted to `current` (gapless handoff or skip-forward after a failure).
    fn on_track_advanced(&self);
    /// `current` reached its end and there was no prepared `next`.
    fn on_track_ended(&self);
}

/// Live "gapless playback enabled" switch, read on every `set_next_source`.
pub trait GaplessSetting: Send + Sync {
    fn gapless_enabled(&self) -> bool;
}

impl GaplessSetting for bool {
    fn gapless_enabled(&self) -> bool {
        *self
    }
}

impl GaplessSetting for AtomicBool {
    fn gapless_enabled(&self) -> bool {
        self.load(Ordering::Relaxed)
    }
}

impl<T: GaplessSetting + ?Sized> GaplessSetting for Arc<T> {
    fn gapless_enabled(&self) -> bool {
        (**self).gapless_enabled()
    }
}

/// User-visible notice channel.
pub trait Notifier: Send + Sync {
    /// A file could not be played. Carries no detail on purpose.
    fn notify_unplayable(&self);
}

/// Best-effort announcement that an audio-effect session may attach to `session`.
pub trait EffectSessions: Send + Sync {
    fn open_session(&self, session: AudioSessionId);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify_unplayable(&self) {}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopEffectSessions;

impl EffectSessions for NoopEffectSessions {
    fn open_session(&self, _session: AudioSessionId) {}
}

/// Collaborators injected into a [`crate::PlaybackEngine`].
#[derive(Clone)]
pub struct EngineDeps {
    pub gapless: Arc<dyn GaplessSetting>,
    pub resolver: Arc<dyn ContentResolver>,
    pub notifier: Arc<dyn Notifier>,
    pub effects: Arc<dyn EffectSessions>,
}

impl Default for EngineDeps {
    /// Gapless on, no content resolver, silent notices.
    fn default() -> Self {
        Self {
            gapless: Arc::new(true),
            resolver: Arc::new(NoContentResolver),
            notifier: Arc::new(NoopNotifier),
            effects: Arc::new(NoopEffectSessions),
        }
    }
}
