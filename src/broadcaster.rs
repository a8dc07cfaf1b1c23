//! Fan-out of session snapshots to push-channel observers.

use crate::models::PushMessage;
use crate::registry::SessionRegistry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Frames an observer may have queued before it counts as slow.
const OBSERVER_BUFFER: usize = 8;

/// Receiving side of one observer; dropping it unsubscribes.
pub struct Observer {
    id: u64,
    frames: mpsc::Receiver<Arc<str>>,
    broadcaster: Arc<Broadcaster>,
}

impl Observer {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next serialized frame; `None` once the broadcaster dropped this observer.
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        self.frames.recv().await
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(self.id);
    }
}

#[derive(Default)]
pub struct Broadcaster {
    observers: Mutex<HashMap<u64, mpsc::Sender<Arc<str>>>>,
    next_id: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().map(|o| o.len()).unwrap_or(0)
    }

    /// Registers an observer and queues the current snapshot for it at once.
    pub async fn connect(self: &Arc<Self>, registry: &SessionRegistry) -> Observer {
        let (tx, frames) = mpsc::channel(OBSERVER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let snapshot = PushMessage::Progress {
            sessions: registry.list().await,
        };
        if let Some(frame) = encode(&snapshot) {
            let _ = tx.try_send(frame);
        }
        if let Ok(mut observers) = self.observers.lock() {
            observers.insert(id, tx);
        }
        debug!(observer = id, "observer connected");

        Observer {
            id,
            frames,
            broadcaster: self.clone(),
        }
    }

    fn unsubscribe(&self, id: u64) {
        if let Ok(mut observers) = self.observers.lock() {
            if observers.remove(&id).is_some() {
                debug!(observer = id, "observer disconnected");
            }
        }
    }

    /// Sends `message` to every observer with room in its buffer.
    ///
    /// Slow observers miss this frame; closed ones are dropped.
    pub fn push(&self, message: &PushMessage) {
        let Some(frame) = encode(message) else {
            return;
        };
        let Ok(mut observers) = self.observers.lock() else {
            return;
        };
        observers.retain(|id, tx| match tx.try_send(frame.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                trace!(observer = id, "observer is slow, frame skipped");
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!(observer = id, "observer channel closed");
                false
            }
        });
    }

    /// Pushes a fresh snapshot every `period` until `shutdown` fires.
    ///
    /// Sessions whose storage vanished from disk are pruned before each tick.
    pub async fn run(
        self: Arc<Self>,
        registry: Arc<SessionRegistry>,
        period: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            registry.prune_vanished().await;
            if self.observer_count() == 0 {
                continue;
            }
            let sessions = registry.list().await;
            self.push(&PushMessage::Progress { sessions });
        }
        debug!("broadcaster stopped");
    }
}

fn encode(message: &PushMessage) -> Option<Arc<str>> {
    match serde_json::to_string(message) {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            warn!(error = %e, "failed to serialize push frame");
            None
        }
    }
}
