//! Message transport abstraction
//!
//! The consumer drives a transport through connect, bind, receive and
//! settle (ack / nack). [`InMemoryTransport`] implements the same contract
//! for tests, with scripted connection failures.

use crate::error::TransportError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

/// Subscription to every topic starting with `prefix`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBinding {
    pub prefix: String,
}

impl TopicBinding {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn matches(&self, topic: &str) -> bool {
        topic.starts_with(&self.prefix)
    }
}

/// Identifies one message on the transport; stable across redeliveries
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTag {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub payload: Vec<u8>,
    pub tag: DeliveryTag,
    /// Set when the transport knows this is not the first delivery
    pub redelivered: bool,
}

#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;

    /// Subscribe to all bindings; called after every successful connect
    async fn bind(&self, bindings: &[TopicBinding]) -> Result<(), TransportError>;

    /// Next message; `Ok(None)` when the transport has been closed for good
    async fn next_delivery(&self) -> Result<Option<Delivery>, TransportError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError>;

    /// Negative acknowledgement; `requeue` asks for redelivery
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError>;

    fn disconnect(&self);
}

#[derive(Debug, Default)]
struct InMemoryState {
    queue: VecDeque<Delivery>,
    next_offset: i64,
    connected: bool,
    bindings: Vec<TopicBinding>,
    connect_attempts: usize,
    bind_calls: usize,
    fail_connects: usize,
    fail_receives: usize,
    close_when_drained: bool,
    acked: Vec<DeliveryTag>,
    nacked: Vec<(DeliveryTag, bool)>,
}

/// Queue-backed transport; clones share one queue
#[derive(Clone)]
pub struct InMemoryTransport {
    state: Arc<Mutex<InMemoryState>>,
    notify: Arc<Notify>,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    /// Transport that reports closed once its queue is empty
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryState {
                close_when_drained: true,
                ..InMemoryState::default()
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Transport that waits for more messages when its queue is empty
    pub fn open_ended() -> Self {
        let transport = Self::new();
        transport.state.lock().close_when_drained = false;
        transport
    }

    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> DeliveryTag {
        let mut state = self.state.lock();
        let tag = DeliveryTag {
            topic: topic.to_string(),
            partition: 0,
            offset: state.next_offset,
        };
        state.next_offset += 1;
        state.queue.push_back(Delivery {
            topic: topic.to_string(),
            payload: payload.into(),
            tag: tag.clone(),
            redelivered: false,
        });
        drop(state);
        self.notify.notify_one();
        tag
    }

    /// Fail the next `n` connect attempts
    pub fn fail_next_connects(&self, n: usize) {
        self.state.lock().fail_connects = n;
    }

    /// Fail the next `n` receives, as if the connection dropped
    pub fn fail_next_receives(&self, n: usize) {
        self.state.lock().fail_receives = n;
        self.notify.notify_one();
    }

    pub fn acked(&self) -> Vec<DeliveryTag> {
        self.state.lock().acked.clone()
    }

    pub fn nacked(&self) -> Vec<(DeliveryTag, bool)> {
        self.state.lock().nacked.clone()
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.lock().connect_attempts
    }

    pub fn bind_calls(&self) -> usize {
        self.state.lock().bind_calls
    }

    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }
}

#[async_trait]
impl EventTransport for InMemoryTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(TransportError::Connection("broker unreachable".to_string()));
        }
        state.connected = true;
        // Subscriptions do not survive a reconnect
        state.bindings.clear();
        Ok(())
    }

    async fn bind(&self, bindings: &[TopicBinding]) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        state.bind_calls += 1;
        state.bindings = bindings.to_vec();
        Ok(())
    }

    async fn next_delivery(&self) -> Result<Option<Delivery>, TransportError> {
        loop {
            {
                let mut state = self.state.lock();
                if !state.connected {
                    return Err(TransportError::NotConnected);
                }
                if state.fail_receives > 0 {
                    state.fail_receives -= 1;
                    state.connected = false;
                    return Err(TransportError::Receive("connection reset".to_string()));
                }
                // Messages on unbound topics stay queued for a later binding
                let next = state
                    .queue
                    .iter()
                    .position(|d| state.bindings.iter().any(|b| b.matches(&d.topic)));
                if let Some(at) = next {
                    return Ok(state.queue.remove(at));
                }
                if state.close_when_drained {
                    if !state.queue.is_empty() {
                        debug!(unbound = state.queue.len(), "Closing with messages on unbound topics");
                    }
                    return Ok(None);
                }
            }
            self.notify.notified().await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        self.state.lock().acked.push(delivery.tag.clone());
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.nacked.push((delivery.tag.clone(), requeue));
        if requeue {
            state.queue.push_front(Delivery {
                redelivered: true,
                ..delivery.clone()
            });
        }
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    fn disconnect(&self) {
        let mut state = self.state.lock();
        state.connected = false;
        state.bindings.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_only_bound_topics_are_delivered() {
        let transport = InMemoryTransport::new();
        transport.publish("job.created", "a");
        transport.publish("billing.paid", "b");
        transport.publish("profile.updated", "c");

        transport.connect().await.unwrap();
        transport
            .bind(&[TopicBinding::prefix("job."), TopicBinding::prefix("profile.")])
            .await
            .unwrap();

        let first = transport.next_delivery().await.unwrap().unwrap();
        let second = transport.next_delivery().await.unwrap().unwrap();
        assert_eq!(first.topic, "job.created");
        assert_eq!(second.topic, "profile.updated");
        assert!(transport.next_delivery().await.unwrap().is_none());
        assert_eq!(transport.pending(), 1);

        // A later binding picks up what was left behind
        transport.bind(&[TopicBinding::prefix("billing.")]).await.unwrap();
        let third = transport.next_delivery().await.unwrap().unwrap();
        assert_eq!(third.topic, "billing.paid");
        assert_eq!(third.payload, b"b");
    }

    #[tokio::test]
    async fn test_nack_requeue_redelivers_same_tag() {
        let transport = InMemoryTransport::new();
        let tag = transport.publish("job.updated", "x");
        transport.connect().await.unwrap();
        transport.bind(&[TopicBinding::prefix("job.")]).await.unwrap();

        let delivery = transport.next_delivery().await.unwrap().unwrap();
        transport.nack(&delivery, true).await.unwrap();
        let again = transport.next_delivery().await.unwrap().unwrap();
        assert_eq!(again.tag, tag);
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn test_reconnect_drops_bindings() {
        let transport = InMemoryTransport::new();
        transport.connect().await.unwrap();
        transport.bind(&[TopicBinding::prefix("job.")]).await.unwrap();
        transport.publish("job.created", "x");

        transport.disconnect();
        assert!(transport.next_delivery().await.is_err());

        transport.connect().await.unwrap();
        // Not yet resubscribed, so the message is not routed to us
        assert!(transport.next_delivery().await.unwrap().is_none());
    }
}
