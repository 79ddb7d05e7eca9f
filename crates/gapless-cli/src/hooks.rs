//! Logging implementations of the engine's notice and effect-session collaborators.

use crossbeam_channel::Sender;
use gapless_engine::{AudioSessionId, EffectSessions, Notifier};

use crate::controller::ControllerMsg;

/// Surfaces "can't play this file" notices in the log and lets the controller react.
pub struct LogNotifier {
    tx: Sender<ControllerMsg>,
}

impl LogNotifier {
    pub fn new(tx: Sender<ControllerMsg>) -> Self {
        Self { tx }
    }
}

impl Notifier for LogNotifier {
    fn notify_unplayable(&self) {
        tracing::warn!("unable to play file");
        let _ = self.tx.send(ControllerMsg::Unplayable);
    }
}

/// No effect processors are attached in the CLI; session announcements are only traced.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingEffects;

impl EffectSessions for LoggingEffects {
    fn open_session(&self, session: AudioSessionId) {
        tracing::debug!(%session, "audio effect session opened");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notifier_forwards_to_controller() {
        let (tx, rx) = crossbeam_channel::unbounded();
        LogNotifier::new(tx).notify_unplayable();
        assert_eq!(rx.try_recv().unwrap(), ControllerMsg::Unplayable);
    }
}
