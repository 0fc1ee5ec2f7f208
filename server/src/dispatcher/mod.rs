//! Message Dispatcher (§4.2): the single queueing/routing layer between
//! the orchestrator and agents.

pub mod collector;
pub mod distributor;
pub mod queue;
pub mod status;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use shared::model::Message;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use self::queue::PriorityQueue;

const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_RETRIES: u32 = 3;

pub type MessageHandler = Arc<dyn Fn(Message) -> anyhow::Result<()> + Send + Sync>;

/// Invoked with a message that exhausted its retries (§4.2.5 step 3).
pub type FailureCallback = Arc<dyn Fn(Message) + Send + Sync>;

pub struct MessageDispatcher {
    pub queue: Arc<PriorityQueue>,
    handlers: RwLock<HashMap<String, MessageHandler>>,
    on_failure: RwLock<Option<FailureCallback>>,
}

impl MessageDispatcher {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(PriorityQueue::new()),
            handlers: RwLock::new(HashMap::new()),
            on_failure: RwLock::new(None),
        }
    }

    pub async fn register_handler(&self, message_type: impl Into<String>, handler: MessageHandler) {
        self.handlers.write().await.insert(message_type.into(), handler);
    }

    pub async fn set_failure_callback(&self, callback: FailureCallback) {
        *self.on_failure.write().await = Some(callback);
    }

    pub async fn enqueue(&self, message: Message) -> bool {
        self.queue.enqueue(message).await
    }

    /// One iteration of the dispatch loop (§4.2.5): dequeue with a 1s
    /// blocking timeout, route by type, apply the retry policy on
    /// handler failure.
    async fn tick(self: &Arc<Self>) {
        let Some(message) = self.queue.dequeue_blocking(DEQUEUE_TIMEOUT).await else {
            return;
        };

        let handler = self.handlers.read().await.get(&message.message_type).cloned();
        let Some(handler) = handler else {
            warn!(message_type = %message.message_type, "no handler registered, discarding message");
            return;
        };

        if let Err(e) = handler(message.clone()) {
            warn!(error = %e, message_type = %message.message_type, "dispatch handler failed");
            if message.retry_count < message.max_retries {
                let mut retried = message;
                retried.retry_count += 1;
                self.queue.enqueue(retried).await;
            } else {
                if let Some(callback) = self.on_failure.read().await.as_ref() {
                    callback(message);
                } else {
                    warn!("message exhausted retries with no failure callback registered");
                }
            }
        }
    }

    /// Spawns the single dispatch-loop consumer; stops on shutdown.
    pub fn spawn_loop(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = dispatcher.tick() => {}
                    _ = shutdown.recv() => {
                        debug!("dispatch loop received shutdown signal");
                        break;
                    }
                }
            }
        })
    }
}

impl Default for MessageDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::model::MessagePriority;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    fn message(message_type: &str) -> Message {
        Message {
            id: Uuid::new_v4(),
            message_type: message_type.to_string(),
            priority: MessagePriority::Normal,
            sender: "test".to_string(),
            recipient: None,
            payload: serde_json::json!({}),
            created_at: chrono::Utc::now(),
            expires_at: None,
            retry_count: 0,
            max_retries: 2,
        }
    }

    #[tokio::test]
    async fn failing_handler_retries_then_invokes_failure_callback() {
        let dispatcher = Arc::new(MessageDispatcher::new());
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);
        dispatcher
            .register_handler(
                "flaky",
                Arc::new(move |_msg| {
                    attempts_clone.fetch_add(1, Ordering::SeqCst);
                    Err(anyhow::anyhow!("boom"))
                }),
            )
            .await;

        let failed = Arc::new(AtomicU32::new(0));
        let failed_clone = Arc::clone(&failed);
        dispatcher
            .set_failure_callback(Arc::new(move |_msg| {
                failed_clone.fetch_add(1, Ordering::SeqCst);
            }))
            .await;

        dispatcher.enqueue(message("flaky")).await;
        for _ in 0..3 {
            dispatcher.tick().await;
        }

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(failed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unregistered_message_type_is_discarded() {
        let dispatcher = Arc::new(MessageDispatcher::new());
        dispatcher.enqueue(message("unknown_type")).await;
        dispatcher.tick().await;
        assert!(dispatcher.queue.is_empty().await);
    }
}
