//! Subscription registry.
//!
//! Subscriptions are keyed by queue name, `{full_topic}#{consumer_group}`.
//! Registering the same pair again replaces the previous entry.
//!
//! The registry is shared between caller tasks (subscribe/unsubscribe) and the
//! transport's inbound path (lookup). A single mutex guards the map; lookups
//! and snapshots hand out clones so handlers always run outside the lock.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use folkmq_proto::queue_name;

use crate::error::HandlerError;
use crate::received::ReceivedMessage;

/// Callback invoked for every delivery of a subscription.
pub type ConsumeHandler = Arc<dyn Fn(&ReceivedMessage) -> Result<(), HandlerError> + Send + Sync>;

/// An active subscription.
#[derive(Clone)]
pub struct Subscription {
    topic: String,
    consumer_group: String,
    queue_name: String,
    auto_ack: bool,
    handler: ConsumeHandler,
}

impl Subscription {
    /// Create a subscription on an already qualified topic.
    #[must_use]
    pub fn new(
        full_topic: impl Into<String>,
        consumer_group: impl Into<String>,
        auto_ack: bool,
        handler: ConsumeHandler,
    ) -> Self {
        let topic = full_topic.into();
        let consumer_group = consumer_group.into();
        Self {
            queue_name: queue_name(&topic, &consumer_group),
            topic,
            consumer_group,
            auto_ack,
            handler,
        }
    }

    /// Qualified topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Consumer group.
    #[must_use]
    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    /// Queue name.
    #[must_use]
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Whether deliveries are acknowledged after the handler returns.
    #[must_use]
    pub fn is_auto_ack(&self) -> bool {
        self.auto_ack
    }

    /// Run the handler.
    ///
    /// # Errors
    ///
    /// Returns whatever the handler returns.
    pub fn consume(&self, message: &ReceivedMessage) -> Result<(), HandlerError> {
        (self.handler)(message)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("consumer_group", &self.consumer_group)
            .field("auto_ack", &self.auto_ack)
            .finish_non_exhaustive()
    }
}

/// In-memory map of active subscriptions.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: Mutex<HashMap<String, Subscription>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Subscription>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace the subscription for `(full_topic, consumer_group)`.
    pub fn add(
        &self,
        full_topic: &str,
        consumer_group: &str,
        auto_ack: bool,
        handler: ConsumeHandler,
    ) -> Subscription {
        let subscription = Subscription::new(full_topic, consumer_group, auto_ack, handler);
        self.entries()
            .insert(subscription.queue_name.clone(), subscription.clone());
        subscription
    }

    /// Remove the subscription for `(full_topic, consumer_group)`, if any.
    pub fn remove(&self, full_topic: &str, consumer_group: &str) -> Option<Subscription> {
        self.entries()
            .remove(&queue_name(full_topic, consumer_group))
    }

    /// Find the subscription for `(full_topic, consumer_group)`.
    #[must_use]
    pub fn lookup(&self, full_topic: &str, consumer_group: &str) -> Option<Subscription> {
        self.entries()
            .get(&queue_name(full_topic, consumer_group))
            .cloned()
    }

    /// Copy of every subscription.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Subscription> {
        self.entries().values().cloned().collect()
    }

    /// Number of subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether there are no subscriptions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Queue names grouped by topic, the body of the resync subscribe.
    #[must_use]
    pub fn queues_by_topic(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut grouped = BTreeMap::<String, BTreeSet<String>>::new();
        for subscription in self.entries().values() {
            grouped
                .entry(subscription.topic.clone())
                .or_default()
                .insert(subscription.queue_name.clone());
        }
        grouped
    }
}
