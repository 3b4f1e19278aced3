//! Protocol events, metadata keys and outbound messages.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::entity::Entity;

/// Metadata keys and routing targets.
pub mod metas {
    /// Message id
    pub const TID: &str = "t0";
    /// Qualified topic
    pub const TOPIC: &str = "t1";
    /// Consumer group, or the target client name of a request
    pub const CONSUMER_GROUP: &str = "c1";
    /// Scheduled delivery time (epoch millis, `0` for immediate)
    pub const SCHEDULED: &str = "s1";
    /// Expiration time (epoch millis)
    pub const EXPIRATION: &str = "e1";
    /// Sequence (ordered) message flag
    pub const SEQUENCE: &str = "s2";
    /// Explicit sequence sharding key
    pub const SHARDING: &str = "p1";
    /// Delivery count
    pub const TIMES: &str = "t2";
    /// Quality of service (`0` or `1`)
    pub const QOS: &str = "q1";
    /// Transaction id of a transactional message
    pub const TRANSACTION: &str = "t4";
    /// Message key
    pub const KEY: &str = "k1";
    /// Sender client name
    pub const SENDER: &str = "s3";

    /// Confirmation flag on QoS 1 responses (`1` = confirmed)
    pub const CONFIRM: &str = "mq.confirm";
    /// Acknowledgment flag on replies to deliveries
    pub const ACK: &str = "mq.ack";
    /// Rollback flag on `publish2` (`1` = rollback, `0` = commit)
    pub const ROLLBACK: &str = "mq.rollback";
    /// Batch flag on the resync subscribe
    pub const BATCH: &str = "mq.batch";
    /// Protocol version code, attached at connect time
    pub const VERSION: &str = "folkmq.version";
    /// Client namespace, attached at connect time
    pub const NAMESPACE: &str = "folkmq.namespace";
    /// Routing target, also carries the client name at connect time
    pub const AT: &str = "@";

    /// Prefix of user attributes
    pub const ATTR_PREFIX: &str = "!";

    /// Route to one broker
    pub const BROKER_AT_SERVER: &str = "folkmq-server";
    /// Route to every broker
    pub const BROKER_AT_SERVER_ALL: &str = "folkmq-server*";
    /// Route to a broker chosen by hash
    pub const BROKER_AT_SERVER_HASH: &str = "folkmq-server!";
}

/// Wire-level event identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MqEvent {
    /// Register a subscription (single or batched)
    Subscribe,
    /// Drop a subscription
    Unsubscribe,
    /// Publish a message to a topic
    Publish,
    /// Withdraw a published message by key
    Unpublish,
    /// Commit or roll back the keys of a transaction
    Publish2,
    /// Addressed request between named clients, or a transaction checkback
    Request,
    /// Broker delivery of a subscribed message
    Distribute,
}

impl MqEvent {
    /// Wire identifier.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Publish => "publish",
            Self::Unpublish => "unpublish",
            Self::Publish2 => "publish2",
            Self::Request => "request",
            Self::Distribute => "distribute",
        }
    }

    /// Parse a wire identifier.
    #[must_use]
    pub fn parse(event: &str) -> Option<Self> {
        match event {
            "subscribe" => Some(Self::Subscribe),
            "unsubscribe" => Some(Self::Unsubscribe),
            "publish" => Some(Self::Publish),
            "unpublish" => Some(Self::Unpublish),
            "publish2" => Some(Self::Publish2),
            "request" => Some(Self::Request),
            "distribute" => Some(Self::Distribute),
            _ => None,
        }
    }
}

impl fmt::Display for MqEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Qos {
    /// Fire-and-forget
    AtMostOnce,
    /// Wait for an explicit confirmation
    #[default]
    AtLeastOnce,
}

impl Qos {
    /// Metadata encoding.
    #[must_use]
    pub fn as_meta(self) -> &'static str {
        match self {
            Self::AtMostOnce => "0",
            Self::AtLeastOnce => "1",
        }
    }

    /// Decode from metadata. Anything but `0` is treated as QoS 1.
    #[must_use]
    pub fn from_meta(value: &str) -> Self {
        if value.trim() == "0" {
            Self::AtMostOnce
        } else {
            Self::AtLeastOnce
        }
    }
}

/// An outbound message.
#[derive(Debug, Clone)]
pub struct MqMessage {
    tid: String,
    body: Vec<u8>,
    key: String,
    qos: Qos,
    tmid: Option<String>,
    sequence: bool,
    sequence_sharding: Option<String>,
    scheduled: Option<DateTime<Utc>>,
    expiration: Option<DateTime<Utc>>,
    sender: Option<String>,
    attrs: BTreeMap<String, String>,
}

impl MqMessage {
    /// Create a QoS 1 message. The key defaults to the generated message id.
    #[must_use]
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        let tid = Uuid::new_v4().simple().to_string();
        Self {
            key: tid.clone(),
            tid,
            body: body.into(),
            qos: Qos::AtLeastOnce,
            tmid: None,
            sequence: false,
            sequence_sharding: None,
            scheduled: None,
            expiration: None,
            sender: None,
            attrs: BTreeMap::new(),
        }
    }

    /// Set the message key.
    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Set the delivery guarantee.
    #[must_use]
    pub fn qos(mut self, qos: Qos) -> Self {
        self.qos = qos;
        self
    }

    /// Mark the message as ordered within its topic.
    #[must_use]
    pub fn sequence(mut self, sequence: bool) -> Self {
        self.sequence = sequence;
        self
    }

    /// Mark the message as ordered within an explicit sharding key.
    #[must_use]
    pub fn sequence_sharding(mut self, sharding: impl Into<String>) -> Self {
        self.sequence = true;
        self.sequence_sharding = Some(sharding.into());
        self
    }

    /// Deliver no earlier than `at`.
    #[must_use]
    pub fn scheduled(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled = Some(at);
        self
    }

    /// Drop the message if undelivered at `at`.
    #[must_use]
    pub fn expiration(mut self, at: DateTime<Utc>) -> Self {
        self.expiration = Some(at);
        self
    }

    /// Attach a user attribute.
    #[must_use]
    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    /// Tag the message as part of transaction `tmid`.
    #[must_use]
    pub fn transaction(mut self, tmid: impl Into<String>) -> Self {
        self.tmid = Some(tmid.into());
        self
    }

    /// Record the sending client name.
    #[must_use]
    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Message id.
    #[must_use]
    pub fn tid(&self) -> &str {
        &self.tid
    }

    /// Message key.
    #[must_use]
    pub fn get_key(&self) -> &str {
        &self.key
    }

    /// Message body.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Delivery guarantee.
    #[must_use]
    pub fn get_qos(&self) -> Qos {
        self.qos
    }

    /// Transaction id, when the message belongs to a transaction.
    #[must_use]
    pub fn tmid(&self) -> Option<&str> {
        self.tmid.as_deref()
    }

    /// Whether the message belongs to a transaction.
    #[must_use]
    pub fn is_transaction(&self) -> bool {
        self.tmid.is_some()
    }

    /// Whether the message is ordered.
    #[must_use]
    pub fn is_sequence(&self) -> bool {
        self.sequence
    }

    /// Explicit sequence sharding key.
    #[must_use]
    pub fn get_sequence_sharding(&self) -> Option<&str> {
        self.sequence_sharding.as_deref()
    }

    /// Build the publish entity for `full_topic`.
    ///
    /// Direct requests pass an empty topic.
    #[must_use]
    pub fn to_publish_entity(&self, full_topic: &str) -> Entity {
        let mut entity = Entity::from_bytes(self.body.clone())
            .meta_put(metas::TID, &self.tid)
            .meta_put(metas::KEY, &self.key)
            .meta_put(metas::TOPIC, full_topic)
            .meta_put(metas::QOS, self.qos.as_meta())
            .meta_put(
                metas::SCHEDULED,
                self.scheduled
                    .map_or_else(|| "0".to_string(), |at| at.timestamp_millis().to_string()),
            );

        if let Some(expiration) = self.expiration {
            entity.put_meta(metas::EXPIRATION, expiration.timestamp_millis().to_string());
        }

        if self.sequence {
            entity.put_meta(metas::SEQUENCE, "1");
            if let Some(sharding) = &self.sequence_sharding {
                entity.put_meta(metas::SHARDING, sharding);
            }
        }

        if let Some(tmid) = &self.tmid {
            entity.put_meta(metas::TRANSACTION, tmid);
        }

        if let Some(sender) = &self.sender {
            entity.put_meta(metas::SENDER, sender);
        }

        for (name, value) in &self.attrs {
            entity.put_meta(format!("{}{name}", metas::ATTR_PREFIX), value);
        }

        entity.at(metas::BROKER_AT_SERVER)
    }
}

/// Whether a QoS 1 response carries a positive confirmation.
///
/// The flag defaults to `0`; anything other than the integer `1` is a failure.
#[must_use]
pub fn is_confirmed(response: &Entity) -> bool {
    response
        .meta_or_default(metas::CONFIRM, "0")
        .trim()
        .parse::<i64>()
        .is_ok_and(|flag| flag == 1)
}

/// Build the batched subscribe issued when a session opens.
///
/// The body maps each qualified topic to the queue names subscribed on it.
///
/// # Errors
///
/// Returns error if the payload cannot be serialized.
pub fn batch_subscribe_entity(
    queues: &BTreeMap<String, BTreeSet<String>>,
) -> Result<Entity, MessageError> {
    let json = serde_json::to_string(queues).map_err(|e| MessageError::Serialize(e.to_string()))?;

    Ok(Entity::from_string(json)
        .meta_put(metas::BATCH, "1")
        .at(metas::BROKER_AT_SERVER))
}

/// Decode the body of a batched subscribe.
///
/// # Errors
///
/// Returns error if the body is not a topic to queue-name map.
pub fn parse_batch_subscribe(
    entity: &Entity,
) -> Result<BTreeMap<String, BTreeSet<String>>, MessageError> {
    serde_json::from_slice(entity.data()).map_err(|e| MessageError::Deserialize(e.to_string()))
}

/// Errors for message serialization/deserialization.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
}
