//! Fan-out of progress events to websocket observers.
//!
//! Every event goes to the global channel and to the topic of the object it
//! concerns. Topics are created on first subscription and pruned once their
//! last subscriber goes away.

use crate::models::progress::{Operation, ProgressEvent};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 256;

pub struct ProgressHub {
    all: broadcast::Sender<ProgressEvent>,
    topics: RwLock<HashMap<String, broadcast::Sender<ProgressEvent>>>,
    shutdown: CancellationToken,
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressHub {
    pub fn new() -> Self {
        let (all, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            all,
            topics: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Deliver an event. Events nobody listens to are dropped.
    pub fn publish(&self, event: ProgressEvent) {
        if let Some(topic) = self.topics.read().get(event.file_id()) {
            let _ = topic.send(event.clone());
        }
        let _ = self.all.send(event);
    }

    /// Receive events for every object.
    pub fn subscribe_all(self: &Arc<Self>) -> Subscription {
        Subscription {
            rx: Some(self.all.subscribe()),
            hub: Arc::clone(self),
            topic: None,
        }
    }

    /// Receive events for one object only.
    pub fn subscribe(self: &Arc<Self>, file_id: &str) -> Subscription {
        let rx = self
            .topics
            .write()
            .entry(file_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();
        Subscription {
            rx: Some(rx),
            hub: Arc::clone(self),
            topic: Some(file_id.to_string()),
        }
    }

    pub fn topic_count(&self) -> usize {
        self.topics.read().len()
    }

    /// Tell every observer to disconnect.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn prune(&self, topic: &str) {
        let mut topics = self.topics.write();
        if topics.get(topic).is_some_and(|tx| tx.receiver_count() == 0) {
            topics.remove(topic);
            debug!(topic, "dropped idle progress topic");
        }
    }
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    rx: Option<broadcast::Receiver<ProgressEvent>>,
    hub: Arc<ProgressHub>,
    topic: Option<String>,
}

impl Subscription {
    /// Next event, or `None` once the hub is gone. Events missed by a slow
    /// reader are skipped.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "progress subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // The receiver must be gone before the count is checked.
        drop(self.rx.take());
        if let Some(topic) = &self.topic {
            self.hub.prune(topic);
        }
    }
}

/// Progress reporting for one running operation.
///
/// Exactly one terminal event is published: `completed` or `failed` when
/// the operation says so, `cancelled` when the reporter is dropped first.
pub struct OperationReporter {
    hub: Arc<ProgressHub>,
    file_id: String,
    operation: Operation,
    finished: bool,
}

impl OperationReporter {
    pub fn new(hub: Arc<ProgressHub>, file_id: impl Into<String>, operation: Operation) -> Self {
        Self {
            hub,
            file_id: file_id.into(),
            operation,
            finished: false,
        }
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn publish(&self, event: ProgressEvent) {
        self.hub.publish(event);
    }

    pub fn complete(mut self) {
        self.finished = true;
        self.hub.publish(ProgressEvent::Completed {
            file_id: self.file_id.clone(),
            operation: self.operation,
        });
    }

    pub fn fail(mut self, error: impl ToString) {
        self.finished = true;
        self.hub.publish(ProgressEvent::Failed {
            file_id: self.file_id.clone(),
            operation: self.operation,
            error: error.to_string(),
        });
    }
}

impl Drop for OperationReporter {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                file_id = %self.file_id,
                operation = ?self.operation,
                "operation dropped before finishing"
            );
            self.hub.publish(ProgressEvent::Cancelled {
                file_id: std::mem::take(&mut self.file_id),
                operation: self.operation,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(file_id: &str, chunk_index: usize) -> ProgressEvent {
        ProgressEvent::UploadProgress {
            file_id: file_id.to_string(),
            chunk_index,
            total_chunks: 3,
        }
    }

    #[tokio::test]
    async fn topic_subscribers_only_see_their_object() {
        let hub = Arc::new(ProgressHub::new());
        let mut all = hub.subscribe_all();
        let mut only_a = hub.subscribe("a");

        hub.publish(upload("b", 1));
        hub.publish(upload("a", 1));

        assert_eq!(all.recv().await, Some(upload("b", 1)));
        assert_eq!(all.recv().await, Some(upload("a", 1)));
        assert_eq!(only_a.recv().await, Some(upload("a", 1)));
    }

    #[tokio::test]
    async fn dropping_the_last_subscriber_prunes_the_topic() {
        let hub = Arc::new(ProgressHub::new());
        let first = hub.subscribe("a");
        let second = hub.subscribe("a");
        assert_eq!(hub.topic_count(), 1);

        drop(first);
        assert_eq!(hub.topic_count(), 1);
        drop(second);
        assert_eq!(hub.topic_count(), 0);
    }

    #[tokio::test]
    async fn dropped_reporter_publishes_cancelled() {
        let hub = Arc::new(ProgressHub::new());
        let mut sub = hub.subscribe("a");

        let reporter = OperationReporter::new(Arc::clone(&hub), "a", Operation::Download);
        reporter.publish(upload("a", 1));
        drop(reporter);

        assert_eq!(sub.recv().await, Some(upload("a", 1)));
        assert_eq!(
            sub.recv().await,
            Some(ProgressEvent::Cancelled {
                file_id: "a".into(),
                operation: Operation::Download,
            })
        );
    }

    #[tokio::test]
    async fn finished_reporter_publishes_one_terminal_event() {
        let hub = Arc::new(ProgressHub::new());
        let mut sub = hub.subscribe("a");

        OperationReporter::new(Arc::clone(&hub), "a", Operation::Upload).complete();
        OperationReporter::new(Arc::clone(&hub), "a", Operation::Upload).fail("boom");

        assert_eq!(
            sub.recv().await,
            Some(ProgressEvent::Completed {
                file_id: "a".into(),
                operation: Operation::Upload,
            })
        );
        assert_eq!(
            sub.recv().await,
            Some(ProgressEvent::Failed {
                file_id: "a".into(),
                operation: Operation::Upload,
                error: "boom".into(),
            })
        );
        assert!(sub.rx.as_mut().unwrap().try_recv().is_err());
    }

    #[tokio::test]
    async fn close_wakes_waiters() {
        let hub = Arc::new(ProgressHub::new());
        let waiter = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move { hub.closed().await })
        };
        hub.close();
        waiter.await.unwrap();
        assert!(hub.is_closed());
    }
}
