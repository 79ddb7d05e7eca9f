//! Gapless dual-handle playback engine.
//!
//! The engine owns at most two rendering handles:
//! - `current`: the handle driving output
//! - `next`: a prepared handle chained to `current` for zero-gap handoff
//!
//! Both live in a two-slot arena with an `active` tag. Every mutation of the slots, the
//! `initialized` flag and the volume inputs happens under one mutex, so promotion of
//! `next` to `current` is atomic with respect to queries and to handle events.
//!
//! Handles report completion/failure as [`HandleEvent`]s on a channel owned by the engine.
//! Each successful bind registers a sink with a fresh [`BindToken`]; a slot only accepts
//! events carrying the token of its latest bind, so anything queued before a `set_source`,
//! `stop` or promotion is dropped. Events are processed either synchronously via
//! [`PlaybackEngine::dispatch_pending`] or by the worker started with
//! [`PlaybackEngine::spawn_event_dispatcher`]. Collaborators are always invoked after the
//! engine lock is dropped.
//!
//! Nothing here propagates errors to the caller: failures are logged and absorbed, and the
//! engine always ends a failure path in a usable state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::collaborators::{EngineDeps, PlaybackCallbacks};
use crate::handle::{
    AudioSessionId, BindToken, BoundEvent, EventSink, HandleBackend, HandleError, HandleEvent,
    HandleId, HandleState, RenderingHandle,
};
use crate::locator;
use crate::volume::VolumeComposer;

/// Returned by position/duration queries when no value is available.
pub const TIME_UNKNOWN: i64 = -1;

const DISPATCH_POLL: Duration = Duration::from_millis(200);

/// Engine tuning.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Upper bound for the blocking prepare step of a handle.
    pub prepare_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            prepare_timeout: Duration::from_secs(10),
        }
    }
}

/// Engine-level state, derived from `initialized` and the current handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Ready,
    Playing,
    Paused,
    Released,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Current,
    Next,
}

/// Two handle slots; `active` indexes the current one, the other holds `next`.
///
/// `binds[i]` is the token of the sink registered on `slots[i]`, `None` while the handle is
/// not observed.
struct Slots<H> {
    slots: [Option<H>; 2],
    binds: [Option<BindToken>; 2],
    active: usize,
}

impl<H: RenderingHandle> Slots<H> {
    fn new(current: Option<H>) -> Self {
        Self {
            slots: [current, None],
            binds: [None, None],
            active: 0,
        }
    }

    fn current(&self) -> Option<&H> {
        self.slots[self.active].as_ref()
    }

    fn current_mut(&mut self) -> Option<&mut H> {
        self.slots[self.active].as_mut()
    }

    fn has_next(&self) -> bool {
        self.slots[1 - self.active].is_some()
    }

    fn take_current(&mut self) -> Option<H> {
        self.binds[self.active] = None;
        self.slots[self.active].take()
    }

    fn take_next(&mut self) -> Option<H> {
        self.binds[1 - self.active] = None;
        self.slots[1 - self.active].take()
    }

    /// Install an unobserved handle as `current`.
    fn put_current(&mut self, handle: H) {
        self.slots[self.active] = Some(handle);
        self.binds[self.active] = None;
    }

    fn put_next(&mut self, handle: H, bind: BindToken) {
        self.slots[1 - self.active] = Some(handle);
        self.binds[1 - self.active] = Some(bind);
    }

    fn set_current_bind(&mut self, bind: Option<BindToken>) {
        self.binds[self.active] = bind;
    }

    /// Flip the active tag: `next` becomes `current`. Returns the previous current.
    fn promote(&mut self) -> Option<H> {
        let old = self.take_current();
        self.active = 1 - self.active;
        old
    }

    /// Which slot `posted` belongs to, if it was posted under that slot's latest bind.
    fn role_of(&self, posted: &BoundEvent) -> Option<Role> {
        let id = posted.event.handle();
        let matches = |i: usize| {
            self.slots[i].as_ref().map(|h| h.id()) == Some(id)
                && self.binds[i] == Some(posted.bind)
        };
        if matches(self.active) {
            Some(Role::Current)
        } else if matches(1 - self.active) {
            Some(Role::Next)
        } else {
            None
        }
    }
}

struct Inner<H> {
    slots: Slots<H>,
    initialized: bool,
    volume: VolumeComposer,
    /// Set by `start`, cleared by `pause`/`stop`/new source.
    play_intent: bool,
    released: bool,
}

/// What to tell the outside world once the lock is dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    Ignored,
    Advanced,
    Ended,
    Unplayable { advanced: bool },
}

struct Shared<B: HandleBackend> {
    backend: B,
    deps: EngineDeps,
    config: EngineConfig,
    inner: Mutex<Inner<B::Handle>>,
    callbacks: Mutex<Option<Arc<dyn PlaybackCallbacks>>>,
    next_bind: AtomicU64,
    events_tx: Sender<BoundEvent>,
    events_rx: Receiver<BoundEvent>,
}

/// Gapless playback engine over handles produced by `B`.
///
/// Cloning yields another reference to the same engine.
pub struct PlaybackEngine<B: HandleBackend> {
    shared: Arc<Shared<B>>,
}

impl<B: HandleBackend> Clone for PlaybackEngine<B> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<B: HandleBackend> PlaybackEngine<B> {
    /// Create an engine with a fresh idle `current` handle.
    pub fn new(backend: B, deps: EngineDeps, config: EngineConfig) -> Result<Self, HandleError> {
        let current = backend.create_handle()?;
        tracing::debug!(handle = %current.id(), "engine created");
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        Ok(Self {
            shared: Arc::new(Shared {
                backend,
                deps,
                config,
                inner: Mutex::new(Inner {
                    slots: Slots::new(Some(current)),
                    initialized: false,
                    volume: VolumeComposer::new(),
                    play_intent: false,
                    released: false,
                }),
                callbacks: Mutex::new(None),
                next_bind: AtomicU64::new(1),
                events_tx,
                events_rx,
            }),
        })
    }

    /// Register (or clear) the controller callback sink.
    pub fn set_callbacks(&self, callbacks: Option<Arc<dyn PlaybackCallbacks>>) {
        let mut g = self
            .shared
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *g = callbacks;
    }

    fn lock(&self) -> MutexGuard<'_, Inner<B::Handle>> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Bind `current` to `locator` and prepare it. Clears any stale `next` on success.
    pub fn set_source(&self, locator: &str) -> bool {
        let opened = {
            let mut inner = self.lock();
            self.set_source_locked(&mut *inner, locator)
        };
        match opened {
            Some(session) => {
                self.shared.deps.effects.open_session(session);
                true
            }
            None => false,
        }
    }

    fn set_source_locked(
        &self,
        inner: &mut Inner<B::Handle>,
        locator: &str,
    ) -> Option<AudioSessionId> {
        if inner.released {
            tracing::debug!("set_source ignored: engine released");
            return None;
        }
        inner.initialized = false;
        inner.play_intent = false;
        inner.slots.set_current_bind(None);

        if inner.slots.current().is_none() {
            match self.shared.backend.create_handle() {
                Ok(h) => inner.slots.put_current(h),
                Err(e) => {
                    tracing::error!("cannot allocate rendering handle: {e}");
                    return None;
                }
            }
        }

        let (bind, session) = self.bind_and_prepare(inner.slots.current_mut()?, locator)?;
        inner.slots.set_current_bind(Some(bind));
        inner.initialized = true;
        tracing::info!(locator, %bind, "source prepared");
        apply_volume(inner);
        self.set_next_source_locked(inner, None);
        Some(session)
    }

    /// Reset `handle`, bind it to `locator`, prepare it and register the engine as observer
    /// under a fresh bind token. Returns the token and the session to announce.
    ///
    /// Any failure leaves the handle reset with no event sink.
    fn bind_and_prepare(
        &self,
        handle: &mut B::Handle,
        locator: &str,
    ) -> Option<(BindToken, AudioSessionId)> {
        handle.reset();

        let source = match locator::resolve(locator, self.shared.deps.resolver.as_ref()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(locator, handle = %handle.id(), "resolve failed: {e:#}");
                return None;
            }
        };
        if let Err(e) = handle.set_source(source) {
            tracing::warn!(locator, handle = %handle.id(), "bind failed: {e}");
            handle.reset();
            return None;
        }
        if let Err(e) = handle.prepare(self.shared.config.prepare_timeout) {
            tracing::warn!(locator, handle = %handle.id(), "prepare failed: {e}");
            handle.reset();
            return None;
        }

        let bind = BindToken(self.shared.next_bind.fetch_add(1, Ordering::Relaxed));
        handle.set_event_sink(Some(EventSink::new(self.shared.events_tx.clone(), bind)));
        Some((bind, handle.audio_session_id()))
    }

    /// Prefetch `locator` into `next` and chain it for gapless handoff. Best-effort.
    pub fn set_next_source(&self, locator: Option<&str>) {
        let opened = {
            let mut inner = self.lock();
            if inner.released {
                tracing::debug!("set_next_source ignored: engine released");
                return;
            }
            self.set_next_source_locked(&mut *inner, locator)
        };
        if let Some(session) = opened {
            self.shared.deps.effects.open_session(session);
        }
    }

    /// Returns the session of a newly chained `next`, to be announced once unlocked.
    fn set_next_source_locked(
        &self,
        inner: &mut Inner<B::Handle>,
        locator: Option<&str>,
    ) -> Option<AudioSessionId> {
        let session = {
            let Some(current) = inner.slots.current_mut() else {
                tracing::warn!("set_next_source: no current handle");
                return None;
            };
            match current.set_next(None) {
                Ok(()) => {}
                Err(HandleError::InvalidArgument(msg)) => {
                    tracing::debug!("no chain to detach: {msg}");
                }
                Err(e) => {
                    tracing::warn!("set_next_source: current handle not ready: {e}");
                    return None;
                }
            }
            current.audio_session_id()
        };

        if let Some(mut old) = inner.slots.take_next() {
            tracing::debug!(handle = %old.id(), "dropping previous next handle");
            old.release();
        }

        let locator = locator?;
        if !self.shared.deps.gapless.gapless_enabled() {
            tracing::debug!(locator, "gapless disabled; not prefetching");
            return None;
        }

        let mut next = match self.shared.backend.create_handle() {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!("cannot allocate next handle: {e}");
                return None;
            }
        };
        if let Err(e) = next.set_audio_session_id(session) {
            tracing::warn!(session = %session, "next handle rejected audio session: {e}");
            next.release();
            return None;
        }
        let Some((bind, opened)) = self.bind_and_prepare(&mut next, locator) else {
            next.release();
            return None;
        };

        let gain = inner.volume.effective();
        if let Err(e) = next.set_volume(gain, gain) {
            tracing::debug!("volume on next handle: {e}");
        }

        let chained = match inner.slots.current_mut() {
            Some(current) => current.set_next(Some(&next)),
            None => Err(HandleError::Released),
        };
        match chained {
            Ok(()) => {
                tracing::info!(locator, handle = %next.id(), %bind, "next source chained");
                inner.slots.put_next(next, bind);
                Some(opened)
            }
            Err(e) => {
                tracing::warn!(locator, "chaining next handle failed: {e}");
                next.release();
                None
            }
        }
    }

    pub fn start(&self) {
        let mut inner = self.lock();
        if inner.released {
            return;
        }
        let Some(current) = inner.slots.current_mut() else {
            return;
        };
        match current.start() {
            Ok(()) => inner.play_intent = true,
            Err(e) => tracing::warn!("start: {e}"),
        }
    }

    pub fn pause(&self) {
        let mut inner = self.lock();
        if inner.released {
            return;
        }
        inner.play_intent = false;
        if let Some(current) = inner.slots.current_mut() {
            if let Err(e) = current.pause() {
                tracing::warn!("pause: {e}");
            }
        }
    }

    /// Reset `current` to idle. `next` is left alone.
    pub fn stop(&self) {
        let mut inner = self.lock();
        if inner.released {
            return;
        }
        stop_locked(&mut *inner);
    }

    /// Stop and release both handles. Terminal.
    pub fn release(&self) {
        let mut inner = self.lock();
        if inner.released {
            return;
        }
        stop_locked(&mut *inner);
        if let Some(mut current) = inner.slots.take_current() {
            current.release();
        }
        if let Some(mut next) = inner.slots.take_next() {
            next.release();
        }
        inner.released = true;
        tracing::info!("engine released");
    }

    pub fn is_released(&self) -> bool {
        self.lock().released
    }

    pub fn is_initialized(&self) -> bool {
        let inner = self.lock();
        !inner.released && inner.initialized
    }

    pub fn is_playing(&self) -> bool {
        let inner = self.lock();
        if inner.released || !inner.initialized {
            return false;
        }
        inner.slots.current().is_some_and(|h| h.is_playing())
    }

    pub fn engine_state(&self) -> EngineState {
        let inner = self.lock();
        if inner.released {
            return EngineState::Released;
        }
        if !inner.initialized {
            return EngineState::Uninitialized;
        }
        match inner.slots.current().map(|h| h.state()) {
            Some(HandleState::Started) => EngineState::Playing,
            Some(HandleState::Paused) => EngineState::Paused,
            _ => EngineState::Ready,
        }
    }

    /// Duration of `current` in milliseconds, or [`TIME_UNKNOWN`].
    pub fn duration(&self) -> i64 {
        let inner = self.lock();
        if inner.released || !inner.initialized {
            return TIME_UNKNOWN;
        }
        match inner.slots.current().map(|h| h.duration_ms()) {
            Some(Ok(ms)) => i64::try_from(ms).unwrap_or(i64::MAX),
            Some(Err(e)) => {
                tracing::debug!("duration: {e}");
                TIME_UNKNOWN
            }
            None => TIME_UNKNOWN,
        }
    }

    /// Position of `current` in milliseconds, or [`TIME_UNKNOWN`].
    pub fn position(&self) -> i64 {
        let inner = self.lock();
        if inner.released || !inner.initialized {
            return TIME_UNKNOWN;
        }
        match inner.slots.current().map(|h| h.position_ms()) {
            Some(Ok(ms)) => i64::try_from(ms).unwrap_or(i64::MAX),
            Some(Err(e)) => {
                tracing::debug!("position: {e}");
                TIME_UNKNOWN
            }
            None => TIME_UNKNOWN,
        }
    }

    pub fn seek(&self, ms: u64) {
        let mut inner = self.lock();
        if inner.released || !inner.initialized {
            return;
        }
        if let Some(current) = inner.slots.current_mut() {
            if let Err(e) = current.seek_to(ms) {
                tracing::debug!(ms, "seek: {e}");
            }
        }
    }

    pub fn set_audio_session_id(&self, session: AudioSessionId) -> bool {
        let mut inner = self.lock();
        if inner.released {
            return false;
        }
        let Some(current) = inner.slots.current_mut() else {
            return false;
        };
        match current.set_audio_session_id(session) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(session = %session, "set_audio_session_id: {e}");
                false
            }
        }
    }

    pub fn audio_session_id(&self) -> AudioSessionId {
        let inner = self.lock();
        if inner.released {
            return AudioSessionId::NONE;
        }
        inner
            .slots
            .current()
            .map(|h| h.audio_session_id())
            .unwrap_or(AudioSessionId::NONE)
    }

    /// Linear replay gain for the loaded track; NaN clears it.
    pub fn set_replay_gain(&self, gain: f32) {
        let mut inner = self.lock();
        if inner.released {
            return;
        }
        inner.volume.set_replay_gain(gain);
        apply_volume(&mut *inner);
    }

    pub fn set_ducking_factor(&self, factor: f32) {
        let mut inner = self.lock();
        if inner.released {
            return;
        }
        inner.volume.set_ducking(factor);
        apply_volume(&mut *inner);
    }

    /// The gain currently applied to `current`.
    pub fn effective_volume(&self) -> f32 {
        self.lock().volume.effective()
    }

    /// Process one handle event. Callbacks fire after the engine lock is released.
    pub fn handle_event(&self, posted: BoundEvent) {
        let outcome = {
            let mut inner = self.lock();
            if inner.released {
                tracing::debug!(?posted, "event after release ignored");
                return;
            }
            let role = inner.slots.role_of(&posted);
            match posted.event {
                HandleEvent::Completed(id) => self.on_completion(&mut *inner, role, id),
                HandleEvent::Failed { handle, code } => {
                    self.on_failure(&mut *inner, role, handle, code)
                }
            }
        };
        self.emit(outcome);
    }

    fn on_completion(
        &self,
        inner: &mut Inner<B::Handle>,
        role: Option<Role>,
        id: HandleId,
    ) -> Outcome {
        match role {
            Some(Role::Current) if inner.slots.has_next() => {
                // Output already switched at the platform level; only bookkeeping remains.
                promote(inner);
                tracing::info!(completed = %id, "gapless handoff");
                Outcome::Advanced
            }
            Some(Role::Current) => {
                tracing::info!(completed = %id, "track ended");
                Outcome::Ended
            }
            Some(Role::Next) => {
                tracing::warn!(handle = %id, "completion from prefetched handle ignored");
                Outcome::Ignored
            }
            None => {
                tracing::debug!(handle = %id, "completion from stale handle ignored");
                Outcome::Ignored
            }
        }
    }

    fn on_failure(
        &self,
        inner: &mut Inner<B::Handle>,
        role: Option<Role>,
        id: HandleId,
        code: i32,
    ) -> Outcome {
        match role {
            Some(Role::Current) => {
                tracing::warn!(handle = %id, code, "current handle failed");
                inner.initialized = false;
                if inner.slots.has_next() {
                    promote(inner);
                    if inner.play_intent {
                        if let Some(current) = inner.slots.current_mut() {
                            if let Err(e) = current.start() {
                                tracing::warn!("starting promoted handle: {e}");
                            }
                        }
                    }
                    Outcome::Unplayable { advanced: true }
                } else {
                    let session = match inner.slots.take_current() {
                        Some(mut failed) => {
                            let session = failed.audio_session_id();
                            failed.release();
                            session
                        }
                        None => AudioSessionId::NONE,
                    };
                    inner.play_intent = false;
                    match self.shared.backend.create_handle() {
                        Ok(mut fresh) => {
                            if !session.is_none() {
                                if let Err(e) = fresh.set_audio_session_id(session) {
                                    tracing::debug!("replacement handle kept its own session: {e}");
                                }
                            }
                            tracing::debug!(handle = %fresh.id(), "replacement handle allocated");
                            inner.slots.put_current(fresh);
                        }
                        Err(e) => tracing::error!("cannot allocate replacement handle: {e}"),
                    }
                    Outcome::Unplayable { advanced: false }
                }
            }
            Some(Role::Next) => {
                tracing::warn!(handle = %id, code, "prefetched handle failed");
                if let Some(current) = inner.slots.current_mut() {
                    if let Err(e) = current.set_next(None) {
                        tracing::debug!("detaching failed next: {e}");
                    }
                }
                if let Some(mut next) = inner.slots.take_next() {
                    next.release();
                }
                Outcome::Unplayable { advanced: false }
            }
            None => {
                tracing::debug!(handle = %id, code, "failure from stale handle ignored");
                Outcome::Ignored
            }
        }
    }

    fn emit(&self, outcome: Outcome) {
        let callbacks = self
            .shared
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match outcome {
            Outcome::Ignored => {}
            Outcome::Advanced => {
                if let Some(cb) = callbacks {
                    cb.on_track_advanced();
                }
            }
            Outcome::Ended => {
                if let Some(cb) = callbacks {
                    cb.on_track_ended();
                }
            }
            Outcome::Unplayable { advanced } => {
                self.shared.deps.notifier.notify_unplayable();
                if advanced {
                    if let Some(cb) = callbacks {
                        cb.on_track_advanced();
                    }
                }
            }
        }
    }

    /// Process every queued handle event without blocking. Returns how many were handled.
    pub fn dispatch_pending(&self) -> usize {
        let mut n = 0;
        while let Ok(event) = self.shared.events_rx.try_recv() {
            self.handle_event(event);
            n += 1;
        }
        n
    }

    /// Run event dispatch on a dedicated thread until the engine is released.
    pub fn spawn_event_dispatcher(&self) -> std::io::Result<thread::JoinHandle<()>> {
        let engine = self.clone();
        thread::Builder::new()
            .name("gapless-events".to_string())
            .spawn(move || {
                loop {
                    match engine.shared.events_rx.recv_timeout(DISPATCH_POLL) {
                        Ok(event) => engine.handle_event(event),
                        Err(RecvTimeoutError::Timeout) => {
                            if engine.is_released() {
                                break;
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::debug!("event dispatcher stopped");
            })
    }
}

fn apply_volume<H: RenderingHandle>(inner: &mut Inner<H>) {
    let gain = inner.volume.effective();
    if let Some(current) = inner.slots.current_mut() {
        if let Err(e) = current.set_volume(gain, gain) {
            tracing::debug!(gain, "set_volume: {e}");
        }
    }
}

fn stop_locked<H: RenderingHandle>(inner: &mut Inner<H>) {
    inner.slots.set_current_bind(None);
    if let Some(current) = inner.slots.current_mut() {
        current.reset();
    }
    inner.initialized = false;
    inner.play_intent = false;
}

/// Release the old `current` and make `next` current.
fn promote<H: RenderingHandle>(inner: &mut Inner<H>) {
    if let Some(mut old) = inner.slots.promote() {
        old.release();
    }
    inner.initialized = true;
    apply_volume(inner);
}
