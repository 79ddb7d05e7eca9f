//! In-memory rendering backend used by the engine tests.
//!
//! Handles follow the same state rules as a platform media player. Every call made on a
//! released handle is counted so tests can assert the engine never touches freed handles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::collaborators::PlaybackCallbacks;
use crate::handle::{
    AudioSessionId, EventSink, HandleBackend, HandleError, HandleEvent, HandleId, HandleState,
    MediaSource, RenderingHandle,
};

const TRACK_MS: u64 = 180_000;

/// Observable state of one mock handle.
#[derive(Clone, Debug)]
pub(crate) struct MockRecord {
    pub(crate) state: HandleState,
    pub(crate) source: Option<String>,
    pub(crate) volume: (f32, f32),
    pub(crate) position: u64,
    pub(crate) session: AudioSessionId,
    pub(crate) chained: Option<HandleId>,
    pub(crate) has_sink: bool,
    pub(crate) release_count: u32,
    sink: Option<EventSink>,
}

#[derive(Default)]
struct World {
    next_id: u64,
    records: HashMap<HandleId, Arc<Mutex<MockRecord>>>,
    created: Vec<HandleId>,
    refuse_chaining: bool,
    last_prepare_timeout: Option<Duration>,
}

#[derive(Clone, Default)]
pub(crate) struct MockBackend {
    world: Arc<Mutex<World>>,
    ops_after_release: Arc<AtomicUsize>,
}

impl MockBackend {
    fn rec(&self, id: HandleId) -> Arc<Mutex<MockRecord>> {
        self.world.lock().unwrap().records[&id].clone()
    }

    pub(crate) fn record(&self, id: HandleId) -> MockRecord {
        self.rec(id).lock().unwrap().clone()
    }

    pub(crate) fn created(&self) -> Vec<HandleId> {
        self.world.lock().unwrap().created.clone()
    }

    pub(crate) fn refuse_chaining(&self, refuse: bool) {
        self.world.lock().unwrap().refuse_chaining = refuse;
    }

    pub(crate) fn last_prepare_timeout(&self) -> Option<Duration> {
        self.world.lock().unwrap().last_prepare_timeout
    }

    pub(crate) fn ops_after_release(&self) -> usize {
        self.ops_after_release.load(Ordering::SeqCst)
    }

    /// Natural end of media: switch output to the chained handle, then signal.
    pub(crate) fn complete(&self, id: HandleId) -> bool {
        let rec = self.rec(id);
        let (sink, chained) = {
            let mut r = rec.lock().unwrap();
            r.state = HandleState::Completed;
            (r.sink.clone(), r.chained)
        };
        if let Some(next) = chained {
            self.rec(next).lock().unwrap().state = HandleState::Started;
        }
        match sink {
            Some(sink) => sink.post(HandleEvent::Completed(id)),
            None => false,
        }
    }

    pub(crate) fn fail(&self, id: HandleId, code: i32) -> bool {
        let rec = self.rec(id);
        let sink = {
            let mut r = rec.lock().unwrap();
            r.state = HandleState::Failed;
            r.sink.clone()
        };
        match sink {
            Some(sink) => sink.post(HandleEvent::Failed { handle: id, code }),
            None => false,
        }
    }
}

impl HandleBackend for MockBackend {
    type Handle = MockHandle;

    fn create_handle(&self) -> Result<MockHandle, HandleError> {
        let mut w = self.world.lock().unwrap();
        w.next_id += 1;
        let id = HandleId(w.next_id);
        let rec = Arc::new(Mutex::new(MockRecord {
            state: HandleState::Idle,
            source: None,
            volume: (1.0, 1.0),
            position: 0,
            session: AudioSessionId(1000 + w.next_id as u32),
            chained: None,
            has_sink: false,
            release_count: 0,
            sink: None,
        }));
        w.records.insert(id, rec.clone());
        w.created.push(id);
        Ok(MockHandle {
            id,
            rec,
            backend: self.clone(),
        })
    }
}

pub(crate) struct MockHandle {
    id: HandleId,
    rec: Arc<Mutex<MockRecord>>,
    backend: MockBackend,
}

impl MockHandle {
    /// Lock the record, counting the call if the handle is already released.
    fn live(&self) -> std::sync::MutexGuard<'_, MockRecord> {
        let r = self.rec.lock().unwrap();
        if r.state == HandleState::Released {
            self.backend.ops_after_release.fetch_add(1, Ordering::SeqCst);
        }
        r
    }
}

impl RenderingHandle for MockHandle {
    fn id(&self) -> HandleId {
        self.id
    }

    fn state(&self) -> HandleState {
        self.rec.lock().unwrap().state
    }

    fn reset(&mut self) {
        let mut r = self.live();
        if r.state == HandleState::Released {
            return;
        }
        r.state = HandleState::Idle;
        r.source = None;
        r.position = 0;
        r.chained = None;
        r.sink = None;
        r.has_sink = false;
    }

    fn set_source(&mut self, source: MediaSource) -> Result<(), HandleError> {
        let mut r = self.live();
        if r.state != HandleState::Idle {
            return Err(HandleError::invalid_state("set_source", r.state));
        }
        let name = match source {
            MediaSource::Path(p) => p.to_string_lossy().into_owned(),
            MediaSource::Stream { hint, .. } => format!("stream.{}", hint.unwrap_or_default()),
        };
        if name.contains("missing") {
            return Err(HandleError::Bind(format!("{name} not found")));
        }
        r.source = Some(name);
        r.state = HandleState::SourceBound;
        Ok(())
    }

    fn prepare(&mut self, timeout: Duration) -> Result<(), HandleError> {
        self.backend.world.lock().unwrap().last_prepare_timeout = Some(timeout);
        let mut r = self.live();
        if r.state != HandleState::SourceBound {
            return Err(HandleError::invalid_state("prepare", r.state));
        }
        let source = r.source.clone().unwrap_or_default();
        if source.contains("bad") {
            return Err(HandleError::Prepare("unsupported format".to_string()));
        }
        if source.contains("slow") {
            return Err(HandleError::PrepareTimeout(timeout));
        }
        r.state = HandleState::Prepared;
        Ok(())
    }

    fn start(&mut self) -> Result<(), HandleError> {
        let mut r = self.live();
        match r.state {
            HandleState::Prepared
            | HandleState::Started
            | HandleState::Paused
            | HandleState::Completed => {
                r.state = HandleState::Started;
                Ok(())
            }
            s => Err(HandleError::invalid_state("start", s)),
        }
    }

    fn pause(&mut self) -> Result<(), HandleError> {
        let mut r = self.live();
        match r.state {
            HandleState::Started | HandleState::Paused => {
                r.state = HandleState::Paused;
                Ok(())
            }
            s => Err(HandleError::invalid_state("pause", s)),
        }
    }

    fn is_playing(&self) -> bool {
        self.live().state == HandleState::Started
    }

    fn seek_to(&mut self, ms: u64) -> Result<(), HandleError> {
        let mut r = self.live();
        if !r.state.is_prepared_or_later() {
            return Err(HandleError::invalid_state("seek", r.state));
        }
        r.position = ms.min(TRACK_MS);
        Ok(())
    }

    fn position_ms(&self) -> Result<u64, HandleError> {
        let r = self.live();
        if !r.state.is_prepared_or_later() {
            return Err(HandleError::invalid_state("position", r.state));
        }
        Ok(r.position)
    }

    fn duration_ms(&self) -> Result<u64, HandleError> {
        let r = self.live();
        if !r.state.is_prepared_or_later() {
            return Err(HandleError::invalid_state("duration", r.state));
        }
        Ok(TRACK_MS)
    }

    fn set_volume(&mut self, left: f32, right: f32) -> Result<(), HandleError> {
        let mut r = self.live();
        if matches!(r.state, HandleState::Released | HandleState::Failed) {
            return Err(HandleError::invalid_state("set_volume", r.state));
        }
        r.volume = (left, right);
        Ok(())
    }

    fn audio_session_id(&self) -> AudioSessionId {
        self.live().session
    }

    fn set_audio_session_id(&mut self, id: AudioSessionId) -> Result<(), HandleError> {
        let mut r = self.live();
        if r.state != HandleState::Idle {
            return Err(HandleError::invalid_state("set_audio_session_id", r.state));
        }
        r.session = id;
        Ok(())
    }

    fn set_next(&mut self, next: Option<&Self>) -> Result<(), HandleError> {
        let refuse = self.backend.world.lock().unwrap().refuse_chaining;
        let mut r = self.live();
        if !matches!(
            r.state,
            HandleState::Prepared | HandleState::Started | HandleState::Paused
        ) {
            return Err(HandleError::invalid_state("set_next", r.state));
        }
        let Some(next) = next else {
            r.chained = None;
            return Ok(());
        };
        if next.id == self.id {
            return Err(HandleError::InvalidArgument("cannot chain to self".to_string()));
        }
        if next.state() != HandleState::Prepared {
            return Err(HandleError::InvalidArgument("next is not prepared".to_string()));
        }
        if refuse {
            return Err(HandleError::InvalidArgument("chaining refused".to_string()));
        }
        r.chained = Some(next.id);
        Ok(())
    }

    fn set_event_sink(&mut self, sink: Option<EventSink>) {
        let mut r = self.live();
        r.has_sink = sink.is_some();
        r.sink = sink;
    }

    fn release(&mut self) {
        let mut r = self.rec.lock().unwrap();
        r.release_count += 1;
        r.state = HandleState::Released;
        r.sink = None;
        r.has_sink = false;
        r.chained = None;
    }
}

/// Counts controller callbacks.
#[derive(Default)]
pub(crate) struct RecordingCallbacks {
    advanced: AtomicUsize,
    ended: AtomicUsize,
}

impl RecordingCallbacks {
    pub(crate) fn advanced(&self) -> usize {
        self.advanced.load(Ordering::SeqCst)
    }

    pub(crate) fn ended(&self) -> usize {
        self.ended.load(Ordering::SeqCst)
    }

    pub(crate) fn wait_advanced(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.advanced() >= n {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        self.advanced() >= n
    }
}

impl PlaybackCallbacks for RecordingCallbacks {
    fn on_track_advanced(&self) {
        self.advanced.fetch_add(1, Ordering::SeqCst);
    }

    fn on_track_ended(&self) {
        self.ended.fetch_add(1, Ordering::SeqCst);
    }
}
