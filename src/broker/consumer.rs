//! Long-lived consumer loop shared by every stage.

use super::{Broker, Delivery, Subscription, dead_letter_queue};
use crate::error::{Error, Result};
use crate::health::StageStats;
use crate::retry::Backoff;
use async_trait::async_trait;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Stage logic for one message type.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Decoded message type.
    type Message: DeserializeOwned + Send + Sync + 'static;

    /// Stage name used in logs and failure notices.
    fn stage(&self) -> &'static str;

    /// Process one message. Errors are classified with
    /// [`Error::is_transient`] to decide between retry and dead-letter.
    async fn handle(&self, message: &Self::Message) -> Result<()>;

    /// Called once when a message is given up on.
    async fn abandon(&self, _message: &Self::Message, _error: &Error) {}
}

/// Consumer loop settings.
#[derive(Debug, Clone, Copy)]
pub struct ConsumerOptions {
    /// Maximum unacknowledged deliveries.
    pub prefetch: usize,
    /// Deliveries per message before dead-lettering.
    pub max_attempts: u32,
    /// Requeue delay schedule.
    pub backoff: Backoff,
}

/// Declare `queue` and its dead-letter queue, then subscribe to `queue`.
///
/// Subscribing before the consumer task is spawned means a broker closed
/// right after startup ends the loop cleanly instead of failing it.
pub async fn subscribe(
    broker: &dyn Broker,
    queue: &str,
    prefetch: usize,
) -> Result<Box<dyn Subscription>> {
    broker.declare(queue).await?;
    broker.declare(&dead_letter_queue(queue)).await?;
    broker.consume(queue, prefetch).await
}

/// Consume `subscription` until the broker closes.
///
/// Up to `prefetch` messages are handled concurrently. In-flight messages are
/// allowed to finish before this returns.
pub async fn run_consumer<H: Handler>(
    broker: Arc<dyn Broker>,
    queue: String,
    mut subscription: Box<dyn Subscription>,
    handler: Arc<H>,
    options: ConsumerOptions,
    stats: Arc<StageStats>,
) -> Result<()> {
    let dead_letters = dead_letter_queue(&queue);
    info!(
        stage = handler.stage(),
        queue = %queue,
        prefetch = options.prefetch,
        "consumer started"
    );

    let mut in_flight = JoinSet::new();
    loop {
        tokio::select! {
            delivery = subscription.next() => {
                let Some(delivery) = delivery else { break };
                stats.record_received();
                let ctx = DeliveryContext {
                    broker: Arc::clone(&broker),
                    queue: queue.clone(),
                    dead_letters: dead_letters.clone(),
                    handler: Arc::clone(&handler),
                    options,
                    stats: Arc::clone(&stats),
                };
                in_flight.spawn(ctx.process(delivery));
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    error!(queue = %queue, "delivery task panicked: {e}");
                }
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            error!(queue = %queue, "delivery task panicked: {e}");
        }
    }

    info!(stage = handler.stage(), queue = %queue, "consumer stopped");
    Ok(())
}

struct DeliveryContext<H> {
    broker: Arc<dyn Broker>,
    queue: String,
    dead_letters: String,
    handler: Arc<H>,
    options: ConsumerOptions,
    stats: Arc<StageStats>,
}

impl<H: Handler> DeliveryContext<H> {
    async fn process(self, delivery: Delivery) {
        let stage = self.handler.stage();

        let message: H::Message = match serde_json::from_slice(&delivery.body) {
            Ok(message) => message,
            Err(source) => {
                let err = Error::MalformedMessage {
                    queue: self.queue.clone(),
                    source,
                };
                // Poison messages are never retried.
                warn!(stage, "{err}; moving to {}", self.dead_letters);
                self.stats.record_malformed();
                self.dead_letter(delivery).await;
                return;
            }
        };

        let outcome = if delivery.attempt > self.options.max_attempts {
            // Only reachable through unsettled redeliveries.
            Err(Error::Internal {
                message: format!(
                    "delivery limit of {} attempts exceeded",
                    self.options.max_attempts
                ),
            })
        } else {
            AssertUnwindSafe(self.handler.handle(&message))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(Error::Internal {
                        message: format!("handler panicked: {}", panic_message(&*panic)),
                    })
                })
        };

        match outcome {
            Ok(()) => {
                self.stats.record_succeeded();
                settle(delivery.ack().await, &self.queue);
            }
            Err(err) if err.is_transient() && delivery.attempt < self.options.max_attempts => {
                let delay = self.options.backoff.delay(delivery.attempt);
                warn!(
                    stage,
                    attempt = delivery.attempt,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "transient failure, requeueing"
                );
                self.stats.record_retried();
                settle(delivery.requeue(delay).await, &self.queue);
            }
            Err(err) => {
                error!(
                    stage,
                    attempt = delivery.attempt,
                    error = %err,
                    "giving up on message"
                );
                self.handler.abandon(&message, &err).await;
                self.dead_letter(delivery).await;
            }
        }
    }

    async fn dead_letter(&self, delivery: Delivery) {
        match self
            .broker
            .publish(&self.dead_letters, delivery.body.clone())
            .await
        {
            Ok(()) => {
                self.stats.record_dead_lettered();
                settle(delivery.ack().await, &self.queue);
            }
            Err(e) => {
                // Keep the message rather than lose it.
                error!(queue = %self.dead_letters, "dead-letter publish failed: {e}");
                settle(
                    delivery.requeue(self.options.backoff.max).await,
                    &self.queue,
                );
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

fn settle(result: Result<()>, queue: &str) {
    if let Err(e) = result {
        warn!(queue, "failed to settle delivery: {e}");
    } else {
        debug!(queue, "delivery settled");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use serde::Deserialize;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Debug, Deserialize)]
    struct Ping {
        id: u32,
    }

    #[derive(Default)]
    struct Flaky {
        failures_before_success: u32,
        transient: bool,
        calls: AtomicU32,
        abandoned: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl Handler for Flaky {
        type Message = Ping;

        fn stage(&self) -> &'static str {
            "test"
        }

        async fn handle(&self, _message: &Ping) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                if self.transient {
                    return Err(Error::HttpStatus {
                        url: "u".to_string(),
                        status: 503,
                    });
                }
                return Err(Error::Detection {
                    reason: "broken".to_string(),
                });
            }
            Ok(())
        }

        async fn abandon(&self, message: &Ping, _error: &Error) {
            self.abandoned.lock().unwrap().push(message.id);
        }
    }

    fn options(max_attempts: u32) -> ConsumerOptions {
        ConsumerOptions {
            prefetch: 2,
            max_attempts,
            backoff: Backoff {
                initial: Duration::from_millis(1),
                max: Duration::from_millis(5),
            },
        }
    }

    struct Panicky {
        calls: AtomicU32,
        abandoned: AtomicU32,
    }

    #[async_trait]
    impl Handler for Panicky {
        type Message = Ping;

        fn stage(&self) -> &'static str {
            "test"
        }

        async fn handle(&self, message: &Ping) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            panic!("boom on {}", message.id);
        }

        async fn abandon(&self, _message: &Ping, _error: &Error) {
            self.abandoned.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn run_until_idle<H: Handler>(
        broker: &MemoryBroker,
        handler: Arc<H>,
        max_attempts: u32,
    ) -> Arc<StageStats> {
        let stats = Arc::new(StageStats::default());
        let subscription = subscribe(broker, "q", 2).await.unwrap();
        let task = tokio::spawn(run_consumer(
            Arc::new(broker.clone()),
            "q".to_string(),
            subscription,
            handler,
            options(max_attempts),
            Arc::clone(&stats),
        ));

        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if broker.stats("q").is_idle() {
                break;
            }
        }
        broker.close();
        task.await.unwrap().unwrap();
        stats
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let broker = MemoryBroker::new();
        broker.publish("q", br#"{"id": 1}"#.to_vec()).await.unwrap();
        let handler = Arc::new(Flaky {
            failures_before_success: 1,
            transient: true,
            ..Flaky::default()
        });

        let stats = run_until_idle(&broker, Arc::clone(&handler), 3).await;

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.retried, 1);
        assert_eq!(snapshot.succeeded, 1);
        assert!(broker.drain("q.dead").is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter_and_abandon() {
        let broker = MemoryBroker::new();
        broker.publish("q", br#"{"id": 9}"#.to_vec()).await.unwrap();
        let handler = Arc::new(Flaky {
            failures_before_success: u32::MAX,
            transient: true,
            ..Flaky::default()
        });

        let stats = run_until_idle(&broker, Arc::clone(&handler), 2).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(*handler.abandoned.lock().unwrap(), vec![9]);
        assert_eq!(stats.snapshot().dead_lettered, 1);
        assert_eq!(broker.drain("q.dead").len(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let broker = MemoryBroker::new();
        broker.publish("q", br#"{"id": 3}"#.to_vec()).await.unwrap();
        let handler = Arc::new(Flaky {
            failures_before_success: u32::MAX,
            transient: false,
            ..Flaky::default()
        });

        run_until_idle(&broker, Arc::clone(&handler), 5).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*handler.abandoned.lock().unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn test_malformed_message_is_dead_lettered_without_handling() {
        let broker = MemoryBroker::new();
        broker.publish("q", b"not json".to_vec()).await.unwrap();
        let handler = Arc::new(Flaky::default());

        let stats = run_until_idle(&broker, Arc::clone(&handler), 3).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert_eq!(stats.snapshot().malformed, 1);
        assert_eq!(broker.drain("q.dead"), vec![b"not json".to_vec()]);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_dead_lettered_once() {
        let broker = MemoryBroker::new();
        broker.publish("q", br#"{"id": 4}"#.to_vec()).await.unwrap();
        let handler = Arc::new(Panicky {
            calls: AtomicU32::new(0),
            abandoned: AtomicU32::new(0),
        });

        let stats = run_until_idle(&broker, Arc::clone(&handler), 3).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(handler.abandoned.load(Ordering::SeqCst), 1);
        assert_eq!(stats.snapshot().dead_lettered, 1);
        assert_eq!(broker.drain("q.dead"), vec![br#"{"id": 4}"#.to_vec()]);
        assert!(broker.drain("q").is_empty());
    }

    #[tokio::test]
    async fn test_redelivery_past_the_limit_is_not_handled() {
        let broker = MemoryBroker::new();
        broker.declare("q").await.unwrap();
        broker.publish("q", br#"{"id": 5}"#.to_vec()).await.unwrap();
        {
            let mut subscription = broker.consume("q", 1).await.unwrap();
            // Dropping unsettled redelivers with one more attempt.
            drop(subscription.next().await.unwrap());
        }
        let handler = Arc::new(Flaky::default());

        let stats = run_until_idle(&broker, Arc::clone(&handler), 1).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert_eq!(*handler.abandoned.lock().unwrap(), vec![5]);
        assert_eq!(stats.snapshot().dead_lettered, 1);
        assert_eq!(broker.drain("q.dead").len(), 1);
    }
}
