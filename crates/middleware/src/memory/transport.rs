use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::transport::{Subscription, Transport, TransportMessage};

type MessageSender = mpsc::UnboundedSender<TransportMessage>;

/// Members of one queue group, served round-robin.
#[derive(Default)]
struct QueueGroup {
    members: Vec<MessageSender>,
    next: usize,
}

impl QueueGroup {
    /// Deliver to exactly one live member. Returns false when none is left.
    fn deliver(&mut self, msg: TransportMessage) -> bool {
        self.members.retain(|tx| !tx.is_closed());
        if self.members.is_empty() {
            return false;
        }
        let idx = self.next % self.members.len();
        self.next = idx + 1;
        self.members[idx].send(msg).is_ok()
    }
}

#[derive(Default)]
struct Route {
    subscribers: Vec<MessageSender>,
    groups: HashMap<String, QueueGroup>,
}

/// In-process bus with exact subject matching (no wildcards).
///
/// Plain subscribers get every message; queue-group members compete for them.
/// Messages published before anyone subscribes are dropped, as on a core
/// NATS subject.
pub struct InMemoryTransport {
    routes: DashMap<String, Route>,
    sequence: AtomicU64,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self {
            routes: DashMap::new(),
            sequence: AtomicU64::new(0),
        }
    }

    #[inline]
    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn register(&self, subject: &str, queue_group: Option<&str>) -> InMemorySubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut route = self.routes.entry(subject.to_string()).or_default();
        match queue_group {
            Some(group) => route
                .groups
                .entry(group.to_string())
                .or_default()
                .members
                .push(tx),
            None => route.subscribers.push(tx),
        }
        InMemorySubscription {
            subject: subject.to_string(),
            rx,
        }
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

struct InMemorySubscription {
    subject: String,
    rx: mpsc::UnboundedReceiver<TransportMessage>,
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn next(&mut self) -> Result<TransportMessage, TransportError> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| TransportError::Closed(self.subject.clone()))
    }

    async fn unsubscribe(mut self: Box<Self>) -> Result<(), TransportError> {
        self.rx.close();
        Ok(())
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), TransportError> {
        let msg = TransportMessage {
            subject: subject.to_string(),
            payload,
            sequence: Some(self.next_sequence()),
        };

        let Some(mut route) = self.routes.get_mut(subject) else {
            return Ok(());
        };

        route.subscribers.retain(|tx| !tx.is_closed());
        for tx in &route.subscribers {
            let _ = tx.send(msg.clone());
        }
        for group in route.groups.values_mut() {
            group.deliver(msg.clone());
        }
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<Box<dyn Subscription>, TransportError> {
        Ok(Box::new(self.register(subject, None)))
    }

    async fn queue_subscribe(
        &self,
        subject: &str,
        queue_group: &str,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        if queue_group.is_empty() {
            return Err(TransportError::SubscribeFailed(
                "queue group name must not be empty".to_string(),
            ));
        }
        Ok(Box::new(self.register(subject, Some(queue_group))))
    }
}
