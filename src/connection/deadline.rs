//! One-shot timers that feed an event back into the link loop

use sensorlink_shared::state_machine::LinkEvent;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// A single cancellable timer. Arming it again replaces the pending one.
pub struct Deadline {
    events: mpsc::Sender<LinkEvent>,
    pending: Option<JoinHandle<()>>,
}

impl Deadline {
    pub fn new(events: mpsc::Sender<LinkEvent>) -> Self {
        Self {
            events,
            pending: None,
        }
    }

    /// Deliver `event` once `after` has elapsed
    pub fn arm(&mut self, after: Duration, event: LinkEvent) {
        self.cancel();

        let events = self.events.clone();
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(event).await;
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(task) = self.pending.take() {
            task.abort();
        }
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.cancel();
    }
}
