//! # Event Fan-out
//!
//! In-process publish/subscribe over successful [`crate::message_store::MessageStore::put`]
//! calls. Delivery is synchronous and in `put`-completion order;
//! a subscriber that blocks blocks the publisher, by design.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::query::{Filter, matches_any};
use crate::scalar::Scalar;

/// One `put`, delivered to every subscriber whose filters it satisfies.
#[derive(Clone, Debug)]
pub struct Event {
    /// The tenant the message was written under.
    pub tenant: String,
    /// The message's content address.
    pub message_cid: String,
    /// The message's indexed properties.
    pub indexes: BTreeMap<String, Scalar>,
}

/// A registered event listener.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Handle one matching event. Must not panic; an error a subscriber
    /// wants surfaced should be logged internally, since a subscriber
    /// failure must never fail the `put` that triggered it.
    async fn on_event(&self, event: &Event);
}

struct Registration {
    id: u64,
    tenant: String,
    filters: Vec<Filter>,
    subscriber: Arc<dyn Subscriber>,
}

/// The in-process event bus. Cheap to clone (wrap in an `Arc`); a single
/// instance is expected to be shared by one [`crate::message_store::MessageStore`].
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// An event bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `subscriber` for every event in `tenant` whose indexes
    /// satisfy at least one of `filters`. `filters` follows the same OR of
    /// AND-conjuncts shape as a query (an empty list matches nothing).
    pub async fn subscribe(
        self: &Arc<Self>,
        tenant: &str,
        filters: Vec<Filter>,
        subscriber: Arc<dyn Subscriber>,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        // Locking here means a subscribe() that arrives mid-`publish()`
        // waits for delivery to finish rather than racing it: subscribe and
        // unsubscribe must not observe a delivery in progress.
        self.subscribers.lock().await.push(Registration { id, tenant: tenant.to_string(), filters, subscriber });
        Subscription { bus: self.clone(), id }
    }

    async fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().await.retain(|reg| reg.id != id);
    }

    /// Deliver `indexes` to every subscriber of `tenant` whose filters
    /// match, in registration-independent, publish-call order. Holds the
    /// subscriber lock for the whole delivery so a concurrent
    /// subscribe/unsubscribe queues behind it rather than observing a
    /// partially-delivered event.
    pub(crate) async fn publish(&self, tenant: &str, message_cid: &str, indexes: &BTreeMap<String, Scalar>) {
        let event = Event { tenant: tenant.to_string(), message_cid: message_cid.to_string(), indexes: indexes.clone() };
        let subscribers = self.subscribers.lock().await;
        for reg in subscribers.iter() {
            if reg.tenant != tenant || !matches_any(indexes, &reg.filters) {
                continue;
            }
            reg.subscriber.on_event(&event).await;
        }
    }
}

/// A handle to a live subscription. Dropping it does not unsubscribe;
/// callers must [`Self::close`] explicitly.
pub struct Subscription {
    bus: Arc<EventBus>,
    id: u64,
}

impl Subscription {
    /// Remove this subscription. Synchronous with respect to subsequent
    /// `publish` calls: once this returns, the subscriber will not be
    /// invoked again.
    pub async fn close(self) {
        self.bus.unsubscribe(self.id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use crate::query::FilterValue;

    struct Collector(StdMutex<Vec<Event>>);

    impl Collector {
        fn new() -> Arc<Self> {
            Arc::new(Self(StdMutex::new(Vec::new())))
        }

        fn received(&self) -> Vec<Event> {
            self.0.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Subscriber for Collector {
        async fn on_event(&self, event: &Event) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    fn indexes(pairs: &[(&str, Scalar)]) -> BTreeMap<String, Scalar> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn subscriber_receives_only_matching_events() {
        let bus = Arc::new(EventBus::new());
        let collector = Collector::new();
        let filter: Filter = [("schema".to_string(), FilterValue::Equal(Scalar::from("foo")))].into();
        let _sub = bus.subscribe("did:example:alice", vec![filter], collector.clone()).await;

        bus.publish("did:example:alice", "bafy1", &indexes(&[("schema", Scalar::from("foo"))])).await;
        bus.publish("did:example:alice", "bafy2", &indexes(&[("schema", Scalar::from("bar"))])).await;
        bus.publish("did:example:bob", "bafy3", &indexes(&[("schema", Scalar::from("foo"))])).await;

        let received = collector.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].message_cid, "bafy1");
    }

    #[tokio::test]
    async fn closed_subscription_stops_receiving_events() {
        let bus = Arc::new(EventBus::new());
        let collector = Collector::new();
        let filter: Filter = [("schema".to_string(), FilterValue::Equal(Scalar::from("foo")))].into();
        let sub = bus.subscribe("did:example:alice", vec![filter], collector.clone()).await;

        bus.publish("did:example:alice", "bafy1", &indexes(&[("schema", Scalar::from("foo"))])).await;
        sub.close().await;
        bus.publish("did:example:alice", "bafy2", &indexes(&[("schema", Scalar::from("foo"))])).await;

        assert_eq!(collector.received().len(), 1);
    }
}
