//! Durable message queues.
//!
//! Stages only see the [`Broker`] trait. Deliveries are at-least-once: a
//! delivery that is neither acknowledged nor requeued before it is dropped
//! goes back to the queue.

mod consumer;
mod memory;

pub use consumer::{ConsumerOptions, Handler, run_consumer, subscribe};
pub use memory::{MemoryBroker, QueueStats};

use crate::constants::queues::DEAD_LETTER_SUFFIX;
use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

/// Message broker with per-queue prefetch and explicit acknowledgement.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Create the queue if it does not exist.
    async fn declare(&self, queue: &str) -> Result<()>;

    /// Publish a persistent message.
    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<()>;

    /// Start consuming with at most `prefetch` unacknowledged deliveries.
    async fn consume(&self, queue: &str, prefetch: usize) -> Result<Box<dyn Subscription>>;
}

/// Stream of deliveries from one queue.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivery. `None` once the broker is closed.
    async fn next(&mut self) -> Option<Delivery>;
}

/// Settles a delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send {
    /// Remove the message from the queue.
    async fn ack(self: Box<Self>) -> Result<()>;

    /// Return the message to the queue after `delay`, counting one more attempt.
    async fn requeue(self: Box<Self>, delay: Duration) -> Result<()>;
}

/// One message handed to a consumer.
pub struct Delivery {
    /// Raw JSON body.
    pub body: Vec<u8>,
    /// Delivery attempt, starting at 1.
    pub attempt: u32,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Wrap a body with the broker's acknowledger.
    pub fn new(body: Vec<u8>, attempt: u32, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            body,
            attempt,
            acker,
        }
    }

    /// Acknowledge the delivery.
    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    /// Requeue the delivery after `delay`.
    pub async fn requeue(self, delay: Duration) -> Result<()> {
        self.acker.requeue(delay).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("bytes", &self.body.len())
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

/// Name of the dead-letter queue for `queue`.
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{queue}{DEAD_LETTER_SUFFIX}")
}

/// Serialize `message` as JSON and publish it.
pub async fn publish_json<T: Serialize + Sync>(
    broker: &dyn Broker,
    queue: &str,
    message: &T,
) -> Result<()> {
    let body = serde_json::to_vec(message)?;
    broker.publish(queue, body).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dead_letter_queue_name() {
        assert_eq!(dead_letter_queue("image_tasks"), "image_tasks.dead");
    }
}
