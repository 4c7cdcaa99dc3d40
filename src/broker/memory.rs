//! In-process broker with durable-queue semantics.
//!
//! Messages survive consumer failures (unsettled deliveries are requeued),
//! attempts are counted per message, and prefetch is enforced with a
//! semaphore per subscription. Messages do not survive the process.

use super::{Acknowledger, Broker, Delivery, Subscription};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, watch};
use tracing::trace;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct Message {
    body: Vec<u8>,
    attempt: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: Mutex<VecDeque<Message>>,
    unacked: AtomicUsize,
    delayed: AtomicUsize,
    notify: Notify,
}

impl QueueState {
    fn push(&self, message: Message) {
        lock(&self.ready).push_back(message);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Message> {
        let mut ready = lock(&self.ready);
        let message = ready.pop_front();
        if message.is_some() && !ready.is_empty() {
            // Hand the remaining backlog to the next waiting subscriber.
            self.notify.notify_one();
        }
        message
    }
}

/// Point-in-time counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Messages waiting for a consumer.
    pub ready: usize,
    /// Messages delivered but not yet settled.
    pub unacked: usize,
    /// Messages waiting out a requeue delay.
    pub delayed: usize,
}

impl QueueStats {
    /// No message is waiting, in flight, or scheduled.
    pub const fn is_idle(&self) -> bool {
        self.ready == 0 && self.unacked == 0 && self.delayed == 0
    }
}

struct Inner {
    queues: Mutex<HashMap<String, Arc<QueueState>>>,
    closed: watch::Sender<bool>,
}

/// In-process [`Broker`].
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queues: Vec<String> = lock(&self.inner.queues).keys().cloned().collect();
        f.debug_struct("MemoryBroker")
            .field("queues", &queues)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                queues: Mutex::new(HashMap::new()),
                closed,
            }),
        }
    }

    /// Stop all subscriptions and refuse further publishes.
    pub fn close(&self) {
        self.inner.closed.send_replace(true);
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Current counts for `queue`.
    pub fn stats(&self, queue: &str) -> QueueStats {
        lock(&self.inner.queues)
            .get(queue)
            .map(|state| QueueStats {
                ready: lock(&state.ready).len(),
                unacked: state.unacked.load(Ordering::SeqCst),
                delayed: state.delayed.load(Ordering::SeqCst),
            })
            .unwrap_or_default()
    }

    /// Remove and return every ready message on `queue`.
    ///
    /// Used to inspect dead-letter queues.
    pub fn drain(&self, queue: &str) -> Vec<Vec<u8>> {
        lock(&self.inner.queues)
            .get(queue)
            .map(|state| lock(&state.ready).drain(..).map(|m| m.body).collect())
            .unwrap_or_default()
    }

    fn queue(&self, name: &str) -> Arc<QueueState> {
        Arc::clone(
            lock(&self.inner.queues)
                .entry(name.to_string())
                .or_default(),
        )
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare(&self, queue: &str) -> Result<()> {
        self.queue(queue);
        Ok(())
    }

    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::BrokerClosed);
        }
        trace!(queue, bytes = body.len(), "publish");
        self.queue(queue).push(Message { body, attempt: 1 });
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: usize) -> Result<Box<dyn Subscription>> {
        if self.is_closed() {
            return Err(Error::BrokerClosed);
        }
        Ok(Box::new(MemorySubscription {
            state: self.queue(queue),
            permits: Arc::new(Semaphore::new(prefetch.max(1))),
            closed: self.inner.closed.subscribe(),
        }))
    }
}

struct MemorySubscription {
    state: Arc<QueueState>,
    permits: Arc<Semaphore>,
    closed: watch::Receiver<bool>,
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    // A dropped sender means the broker is gone, which also ends the stream.
    let _ = closed.wait_for(|c| *c).await;
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Option<Delivery> {
        let permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok()?,
            () = wait_closed(&mut self.closed) => return None,
        };

        loop {
            if *self.closed.borrow() {
                return None;
            }

            let notified = self.state.notify.notified();
            if let Some(message) = self.state.pop() {
                self.state.unacked.fetch_add(1, Ordering::SeqCst);
                let attempt = message.attempt;
                let body = message.body.clone();
                let acker = MemoryAck {
                    state: Arc::clone(&self.state),
                    message: Some(message),
                    _permit: permit,
                };
                return Some(Delivery::new(body, attempt, Box::new(acker)));
            }

            tokio::select! {
                () = notified => {}
                () = wait_closed(&mut self.closed) => return None,
            }
        }
    }
}

struct MemoryAck {
    state: Arc<QueueState>,
    message: Option<Message>,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl Acknowledger for MemoryAck {
    async fn ack(mut self: Box<Self>) -> Result<()> {
        self.message = None;
        Ok(())
    }

    async fn requeue(mut self: Box<Self>, delay: Duration) -> Result<()> {
        if let Some(mut message) = self.message.take() {
            message.attempt += 1;
            if delay.is_zero() {
                self.state.push(message);
            } else {
                let state = Arc::clone(&self.state);
                state.delayed.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    state.push(message);
                    state.delayed.fetch_sub(1, Ordering::SeqCst);
                });
            }
        }
        Ok(())
    }
}

impl Drop for MemoryAck {
    fn drop(&mut self) {
        self.state.unacked.fetch_sub(1, Ordering::SeqCst);
        // Unsettled: behave like a broker whose consumer channel closed.
        if let Some(mut message) = self.message.take() {
            message.attempt += 1;
            self.state.push(message);
        }
    }
}
