//! Rendering handle abstraction.
//!
//! A rendering handle is one decode+output pipeline bound to exactly one media source.
//! The engine never looks inside a handle; it drives it through [`RenderingHandle`] and
//! learns about asynchronous completion/failure through [`HandleEvent`]s posted on an
//! [`EventSink`] it registers after a successful prepare.
//!
//! A handle is reused across sources, so its id alone does not say which source an event
//! belongs to. Every sink carries a [`BindToken`] and stamps it onto what it posts; the
//! engine drops events whose token is not the one it registered for that slot.
//!
//! Handle lifecycle:
//! `Idle -> SourceBound -> Prepared -> Started <-> Paused -> (Completed | Failed) -> Released`

use std::fmt;
use std::io::{Read, Seek};
use std::path::PathBuf;
use std::time::Duration;

use crossbeam_channel::Sender;

/// Backend-assigned identity of a handle.
///
/// Events carry this id instead of a reference so the engine can match them against its
/// current/next slots without comparing possibly-stale pointers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Opaque audio session identifier shared by handles that belong to one effect group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct AudioSessionId(pub u32);

impl AudioSessionId {
    /// Not assigned.
    pub const NONE: AudioSessionId = AudioSessionId(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for AudioSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle-level state as observed by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleState {
    Idle,
    SourceBound,
    Prepared,
    Started,
    Paused,
    Completed,
    Failed,
    Released,
}

impl HandleState {
    /// Whether duration/position are meaningful in this state.
    pub fn is_prepared_or_later(self) -> bool {
        matches!(
            self,
            HandleState::Prepared
                | HandleState::Started
                | HandleState::Paused
                | HandleState::Completed
        )
    }
}

/// Readable, seekable byte stream produced by a content resolver.
pub trait SourceStream: Read + Seek + Send + Sync {}

impl<T: Read + Seek + Send + Sync> SourceStream for T {}

/// What a handle gets bound to.
pub enum MediaSource {
    /// Local file.
    Path(PathBuf),
    /// Stream opened by a [`crate::ContentResolver`].
    Stream {
        stream: Box<dyn SourceStream>,
        /// File extension / container hint for probing, if known.
        hint: Option<String>,
        /// Total length in bytes, if known.
        byte_len: Option<u64>,
    },
}

impl fmt::Debug for MediaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaSource::Path(path) => f.debug_tuple("Path").field(path).finish(),
            MediaSource::Stream { hint, byte_len, .. } => f
                .debug_struct("Stream")
                .field("hint", hint)
                .field("byte_len", byte_len)
                .finish_non_exhaustive(),
        }
    }
}

/// Asynchronous signal posted by a handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleEvent {
    /// Natural end of media.
    Completed(HandleId),
    /// Runtime failure during playback. `code` is backend-defined.
    Failed { handle: HandleId, code: i32 },
}

impl HandleEvent {
    pub fn handle(&self) -> HandleId {
        match self {
            HandleEvent::Completed(id) => *id,
            HandleEvent::Failed { handle, .. } => *handle,
        }
    }
}

/// Identifies one bind/prepare cycle of a handle. Allocated by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BindToken(pub u64);

impl fmt::Display for BindToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// A [`HandleEvent`] stamped with the bind it was posted under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundEvent {
    pub bind: BindToken,
    pub event: HandleEvent,
}

/// Where a handle posts events for its current bind.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: Sender<BoundEvent>,
    bind: BindToken,
}

impl EventSink {
    pub fn new(tx: Sender<BoundEvent>, bind: BindToken) -> Self {
        Self { tx, bind }
    }

    pub fn bind(&self) -> BindToken {
        self.bind
    }

    /// Best-effort: a dropped receiver just means nobody is listening anymore.
    pub fn post(&self, event: HandleEvent) -> bool {
        self.tx
            .send(BoundEvent {
                bind: self.bind,
                event,
            })
            .is_ok()
    }
}

/// Errors returned by handle operations.
#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    #[error("{op} not allowed in state {state:?}")]
    InvalidState {
        op: &'static str,
        state: HandleState,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("bind failed: {0}")]
    Bind(String),
    #[error("prepare failed: {0}")]
    Prepare(String),
    #[error("prepare timed out after {0:?}")]
    PrepareTimeout(Duration),
    #[error("{0} unavailable")]
    Unavailable(&'static str),
    #[error("handle released")]
    Released,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl HandleError {
    pub fn invalid_state(op: &'static str, state: HandleState) -> Self {
        if state == HandleState::Released {
            HandleError::Released
        } else {
            HandleError::InvalidState { op, state }
        }
    }
}

/// One decode+render pipeline.
///
/// Implementations must tolerate `release` being called more than once.
pub trait RenderingHandle: Send + 'static {
    fn id(&self) -> HandleId;
    fn state(&self) -> HandleState;

    /// Return to `Idle`, dropping the bound source, any chain and the event sink.
    fn reset(&mut self);
    fn set_source(&mut self, source: MediaSource) -> Result<(), HandleError>;
    /// Blocking prepare, bounded by `timeout`.
    fn prepare(&mut self, timeout: Duration) -> Result<(), HandleError>;

    fn start(&mut self) -> Result<(), HandleError>;
    fn pause(&mut self) -> Result<(), HandleError>;
    fn is_playing(&self) -> bool;
    fn seek_to(&mut self, ms: u64) -> Result<(), HandleError>;
    fn position_ms(&self) -> Result<u64, HandleError>;
    fn duration_ms(&self) -> Result<u64, HandleError>;
    fn set_volume(&mut self, left: f32, right: f32) -> Result<(), HandleError>;

    fn audio_session_id(&self) -> AudioSessionId;
    /// Only valid while `Idle`.
    fn set_audio_session_id(&mut self, id: AudioSessionId) -> Result<(), HandleError>;

    /// Chain `next` so output switches to it with no gap when `self` completes naturally.
    /// `None` detaches any existing chain.
    fn set_next(&mut self, next: Option<&Self>) -> Result<(), HandleError>
    where
        Self: Sized;

    fn set_event_sink(&mut self, sink: Option<EventSink>);
    fn release(&mut self);
}

/// Factory for handles of one backend.
pub trait HandleBackend: Send + Sync + 'static {
    type Handle: RenderingHandle;

    fn create_handle(&self) -> Result<Self::Handle, HandleError>;
}
