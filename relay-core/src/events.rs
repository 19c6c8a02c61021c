//! Typed pub/sub event bus with per-client bounded outbound buffers.
//!
//! Grounded on `dwctl::webhooks::events`'s typed-event-enum shape (`as_str`,
//! `from_status`-style classification) and spec.md §4.8's explicit backpressure
//! requirement: a slow consumer is disconnected rather than given an unbounded
//! queue.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::ids::RequestId;
use crate::provider::{BackendVariant, HealthStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Requests,
    Providers,
    Cli,
    Stream,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Event {
    RequestSubmitted {
        request_id: RequestId,
        provider: String,
        priority: i64,
        at: DateTime<Utc>,
    },
    RequestProcessing {
        request_id: RequestId,
        provider: String,
        at: DateTime<Utc>,
    },
    RequestCompleted {
        request_id: RequestId,
        provider_used: Option<String>,
        cached: bool,
        at: DateTime<Utc>,
    },
    RequestFailed {
        request_id: RequestId,
        error_code: &'static str,
        at: DateTime<Utc>,
    },
    RequestCancelled {
        request_id: RequestId,
        at: DateTime<Utc>,
    },
    /// Named `cli-executing` is the wire tag this carries (spec.md's "`cli-executing`
    /// (backend-variant-only)" event), even though it fires for every backend
    /// variant, not only CLI — it records which provider was actually invoked for a
    /// given attempt so fallback chains are observable.
    #[serde(rename = "cli-executing")]
    ProviderInvoked {
        request_id: RequestId,
        provider: String,
        backend_variant: BackendVariant,
        attempt: u32,
        at: DateTime<Utc>,
    },
    ProviderHealthChanged {
        provider: String,
        status: HealthStatus,
        at: DateTime<Utc>,
    },
    ProviderInFlightChanged {
        provider: String,
        in_flight: usize,
        at: DateTime<Utc>,
    },
    StreamChunk {
        request_id: RequestId,
        seq: u32,
        text: String,
        at: DateTime<Utc>,
    },
}

impl Event {
    pub fn channel(&self) -> Channel {
        match self {
            Event::RequestSubmitted { .. }
            | Event::RequestProcessing { .. }
            | Event::RequestCompleted { .. }
            | Event::RequestFailed { .. }
            | Event::RequestCancelled { .. } => Channel::Requests,
            Event::ProviderInvoked { .. } => Channel::Cli,
            Event::ProviderHealthChanged { .. } | Event::ProviderInFlightChanged { .. } => Channel::Providers,
            Event::StreamChunk { .. } => Channel::Stream,
        }
    }

    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Event::RequestSubmitted { request_id, .. }
            | Event::RequestProcessing { request_id, .. }
            | Event::RequestCompleted { request_id, .. }
            | Event::RequestFailed { request_id, .. }
            | Event::RequestCancelled { request_id, .. }
            | Event::ProviderInvoked { request_id, .. }
            | Event::StreamChunk { request_id, .. } => Some(*request_id),
            Event::ProviderHealthChanged { .. } | Event::ProviderInFlightChanged { .. } => None,
        }
    }
}

struct Subscriber {
    channels: HashSet<Channel>,
    sender: mpsc::Sender<Event>,
}

/// A lock-free-on-the-fast-path fan-out: each subscriber owns a bounded mpsc
/// channel; `publish` does a non-blocking `try_send` per matching subscriber and
/// drops (disconnects) any whose buffer is full.
pub struct EventBus {
    subscribers: DashMap<u64, Subscriber>,
    next_id: AtomicU64,
    buffer_size: usize,
}

impl EventBus {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            buffer_size,
        }
    }

    pub fn subscribe(&self, channels: HashSet<Channel>) -> (u64, mpsc::Receiver<Event>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer_size);
        self.subscribers.insert(id, Subscriber { channels, sender: tx });
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Publishes to every subscriber of `event.channel()`. A subscriber whose
    /// buffer is full (or already dropped its receiver) is disconnected here,
    /// which is the `slow_consumer` behavior from spec.md §4.8.
    pub fn publish(&self, event: Event) {
        let channel = event.channel();
        let mut slow = Vec::new();
        for entry in self.subscribers.iter() {
            if entry.value().channels.contains(&channel) && entry.value().sender.try_send(event.clone()).is_err() {
                slow.push(*entry.key());
            }
        }
        for id in slow {
            self.subscribers.remove(&id);
            tracing::warn!(subscriber_id = id, "slow_consumer: disconnecting websocket client");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req_event(id: RequestId) -> Event {
        Event::RequestSubmitted {
            request_id: id,
            provider: "p".to_string(),
            priority: 0,
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn delivers_only_to_matching_channel() {
        let bus = EventBus::new(8);
        let (_id, mut rx_requests) = bus.subscribe(HashSet::from([Channel::Requests]));
        let (_id2, mut rx_providers) = bus.subscribe(HashSet::from([Channel::Providers]));

        bus.publish(req_event(RequestId::new()));

        assert!(rx_requests.try_recv().is_ok());
        assert!(rx_providers.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnects_slow_consumer_on_overflow() {
        let bus = EventBus::new(1);
        let (id, _rx) = bus.subscribe(HashSet::from([Channel::Requests]));
        // buffer holds 1; second publish overflows and disconnects the subscriber.
        bus.publish(req_event(RequestId::new()));
        bus.publish(req_event(RequestId::new()));
        assert_eq!(bus.subscriber_count(), 0);
        let _ = id;
    }

    #[tokio::test]
    async fn preserves_publication_order_per_subscriber() {
        let bus = EventBus::new(8);
        let (_id, mut rx) = bus.subscribe(HashSet::from([Channel::Requests]));
        let a = RequestId::new();
        let b = RequestId::new();
        bus.publish(req_event(a));
        bus.publish(req_event(b));
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.request_id(), Some(a));
        assert_eq!(second.request_id(), Some(b));
    }
}
