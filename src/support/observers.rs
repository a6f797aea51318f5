//! Multicast event registry
//!
//! Sinks return `false` once their receiving side is gone and are pruned on
//! the next notification.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

pub type ObserverId = u64;

type Sink<E> = Arc<dyn Fn(E) -> bool + Send + Sync>;

pub struct Observers<E> {
    next_id: AtomicU64,
    sinks: Mutex<Vec<(ObserverId, Sink<E>)>>,
}

impl<E> Default for Observers<E> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            sinks: Mutex::new(Vec::new()),
        }
    }
}

impl<E: Clone + Send + 'static> Observers<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sink: impl Fn(E) -> bool + Send + Sync + 'static) -> ObserverId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sinks.lock().push((id, Arc::new(sink)));
        id
    }

    /// Register a channel-backed observer
    pub fn subscribe(&self) -> (ObserverId, mpsc::UnboundedReceiver<E>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.register(move |event| tx.send(event).is_ok());
        (id, rx)
    }

    pub fn unsubscribe(&self, id: ObserverId) {
        self.sinks.lock().retain(|(sink_id, _)| *sink_id != id);
    }

    pub fn clear(&self) {
        self.sinks.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.sinks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.lock().is_empty()
    }

    pub fn notify(&self, event: E) {
        let sinks: Vec<(ObserverId, Sink<E>)> = self.sinks.lock().clone();
        let mut gone = Vec::new();
        for (id, sink) in sinks {
            if !sink(event.clone()) {
                gone.push(id);
            }
        }
        if !gone.is_empty() {
            self.sinks.lock().retain(|(id, _)| !gone.contains(id));
        }
    }
}
