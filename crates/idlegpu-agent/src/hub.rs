//! Fan-out of status events to live observers

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use idlegpu_core::StatusEvent;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Identity of a registered observer
pub type ObserverId = Uuid;

/// Delivery to one observer failed
#[derive(Debug, Error)]
pub enum ObserverError {
    #[error("Observer connection closed")]
    Closed,

    #[error("Send failed: {0}")]
    Send(String),
}

/// One connected client
#[async_trait]
pub trait Observer: Send + Sync {
    fn id(&self) -> ObserverId;

    /// Deliver one serialized message
    async fn send(&self, message: &str) -> std::result::Result<(), ObserverError>;

    /// Close the underlying channel, best effort
    async fn close(&self) {}
}

/// Outcome of one publish pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub delivered: usize,
    pub removed: usize,
}

/// Best-effort broadcaster.
///
/// Each publish serializes once and sends to every observer concurrently;
/// observers whose send fails or times out are removed once the pass is over.
pub struct BroadcastHub {
    observers: DashMap<ObserverId, Arc<dyn Observer>>,
    send_timeout: Duration,
}

impl BroadcastHub {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            observers: DashMap::new(),
            send_timeout,
        }
    }

    /// Confirm the connection to an observer, then add it.
    ///
    /// Broadcasts only reach the observer after its confirmation. Returns
    /// `false` if the confirmation could not be delivered; the observer is
    /// not kept in that case.
    pub async fn register(&self, observer: Arc<dyn Observer>) -> bool {
        let id = observer.id();

        match serde_json::to_string(&StatusEvent::connected()) {
            Ok(confirmation) => {
                if !self.deliver(observer.as_ref(), &confirmation).await {
                    observer.close().await;
                    warn!("Observer {} dropped before confirmation", id);
                    return false;
                }
            }
            Err(e) => error!("Failed to serialize connection confirmation: {}", e),
        }

        self.observers.insert(id, observer);
        info!("Observer {} registered ({} connected)", id, self.observers.len());
        true
    }

    /// Remove an observer. Returns whether it was registered.
    pub fn unregister(&self, id: ObserverId) -> bool {
        let removed = self.observers.remove(&id).is_some();
        if removed {
            info!("Observer {} unregistered ({} connected)", id, self.observers.len());
        }
        removed
    }

    /// Send an event to every registered observer
    pub async fn publish<E: Serialize + ?Sized>(&self, event: &E) -> PublishReport {
        if self.observers.is_empty() {
            return PublishReport::default();
        }

        let message = match serde_json::to_string(event) {
            Ok(message) => message,
            Err(e) => {
                error!("Failed to serialize event for broadcast: {}", e);
                return PublishReport::default();
            }
        };

        // snapshot so no map guard is held across the sends
        let targets: Vec<Arc<dyn Observer>> = self
            .observers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let results = join_all(targets.iter().map(|observer| {
            let message = message.as_str();
            async move { (observer, self.deliver(observer.as_ref(), message).await) }
        }))
        .await;

        let mut report = PublishReport::default();
        let mut failed = Vec::new();
        for (observer, ok) in results {
            if ok {
                report.delivered += 1;
            } else {
                failed.push(Arc::clone(observer));
            }
        }

        for observer in failed {
            if self.observers.remove(&observer.id()).is_some() {
                report.removed += 1;
            }
            observer.close().await;
        }

        if report.removed > 0 {
            info!(
                "Removed {} dead observer(s), {} remaining",
                report.removed,
                self.observers.len()
            );
        }
        debug!("Published to {} observer(s)", report.delivered);
        report
    }

    async fn deliver(&self, observer: &dyn Observer, message: &str) -> bool {
        match tokio::time::timeout(self.send_timeout, observer.send(message)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("Send to observer {} failed: {}", observer.id(), e);
                false
            }
            Err(_) => {
                warn!("Send to observer {} timed out after {:?}", observer.id(), self.send_timeout);
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn contains(&self, id: ObserverId) -> bool {
        self.observers.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{FailingObserver, RecordingObserver, StalledObserver};

    fn hub() -> BroadcastHub {
        BroadcastHub::new(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_register_sends_confirmation() {
        let hub = hub();
        let observer = Arc::new(RecordingObserver::new());

        assert!(hub.register(observer.clone()).await);
        assert_eq!(hub.len(), 1);

        let messages = observer.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["type"], "connected");
        assert_eq!(messages[0]["status"], "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmation_precedes_broadcasts() {
        let hub = hub();
        let observer = Arc::new(RecordingObserver::with_send_delay(Duration::from_millis(200)));

        let (registered, report) = tokio::join!(hub.register(observer.clone()), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            hub.publish(&StatusEvent::gpu_status(true, 2.0)).await
        });
        assert!(registered);
        assert_eq!(report.delivered, 0);
        assert_eq!(observer.messages().len(), 1);

        hub.publish(&StatusEvent::gpu_status(false, 2.0)).await;
        let messages = observer.messages();
        assert_eq!(messages[0]["type"], "connected");
        assert_eq!(messages[1]["type"], "gpu_status_update");
    }

    #[tokio::test]
    async fn test_register_failing_observer_is_not_kept() {
        let hub = hub();
        let observer = Arc::new(FailingObserver::new());

        assert!(!hub.register(observer.clone()).await);
        assert!(hub.is_empty());
        assert!(observer.is_closed());
    }

    #[tokio::test]
    async fn test_publish_without_observers() {
        let hub = hub();
        let report = hub.publish(&StatusEvent::gpu_status(false, 3.0)).await;
        assert_eq!(report, PublishReport::default());
    }

    #[tokio::test]
    async fn test_publish_removes_exactly_failed_observers() {
        let hub = hub();
        let healthy: Vec<Arc<RecordingObserver>> =
            (0..3).map(|_| Arc::new(RecordingObserver::new())).collect();
        for observer in &healthy {
            hub.register(observer.clone()).await;
        }

        let flaky: Vec<Arc<RecordingObserver>> =
            (0..2).map(|_| Arc::new(RecordingObserver::new())).collect();
        for observer in &flaky {
            hub.register(observer.clone()).await;
            observer.disconnect();
        }
        assert_eq!(hub.len(), 5);

        let report = hub.publish(&StatusEvent::title_changed("s-1", "Trip planning")).await;
        assert_eq!(report.delivered, 3);
        assert_eq!(report.removed, 2);
        assert_eq!(hub.len(), 3);

        for observer in &healthy {
            assert!(hub.contains(observer.id()));
            let last = observer.messages().pop().unwrap();
            assert_eq!(last["type"], "session_title_update");
            assert_eq!(last["title"], "Trip planning");
        }
        for observer in &flaky {
            assert!(!hub.contains(observer.id()));
            assert!(observer.is_closed());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_observer_times_out() {
        let hub = BroadcastHub::new(Duration::from_millis(100));
        let healthy = Arc::new(RecordingObserver::new());
        hub.register(healthy.clone()).await;

        let stalled = Arc::new(StalledObserver::new());
        hub.observers.insert(stalled.id(), stalled.clone());

        let report = hub.publish(&StatusEvent::gpu_status(true, 1.0)).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.removed, 1);
        assert!(!hub.contains(stalled.id()));
        assert_eq!(healthy.messages().len(), 2);
    }

    #[tokio::test]
    async fn test_unregister() {
        let hub = hub();
        let observer = Arc::new(RecordingObserver::new());
        hub.register(observer.clone()).await;

        assert!(hub.unregister(observer.id()));
        assert!(!hub.unregister(observer.id()));

        hub.publish(&StatusEvent::gpu_status(false, 0.0)).await;
        assert_eq!(observer.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_arbitrary_payload() {
        let hub = hub();
        let observer = Arc::new(RecordingObserver::new());
        hub.register(observer.clone()).await;

        let report = hub.publish(&serde_json::json!({"type": "custom", "n": 1})).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(observer.messages()[1]["n"], 1);
    }
}
