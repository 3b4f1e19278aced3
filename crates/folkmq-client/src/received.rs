//! Inbound messages handed to user handlers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use folkmq_proto::{bare_topic, metas, Qos, ReplyEntity};

use crate::error::TransportError;
use crate::transport::{Frame, Session};

/// A message received from the broker or from another client.
///
/// Keeps the originating session and frame so handlers can acknowledge or
/// answer it.
pub struct ReceivedMessage {
    session: Arc<dyn Session>,
    frame: Frame,
    qos: Qos,
    times: u32,
}

impl ReceivedMessage {
    /// Wrap an inbound frame.
    #[must_use]
    pub fn new(session: Arc<dyn Session>, frame: Frame) -> Self {
        let entity = &frame.entity;
        let qos = Qos::from_meta(entity.meta_or_default(metas::QOS, "1"));
        let times = entity
            .meta_or_default(metas::TIMES, "0")
            .parse()
            .unwrap_or(0);

        Self {
            session,
            frame,
            qos,
            times,
        }
    }

    fn meta(&self, name: &str) -> &str {
        self.frame.entity.meta_or_default(name, "")
    }

    /// Message id.
    #[must_use]
    pub fn tid(&self) -> &str {
        self.meta(metas::TID)
    }

    /// Qualified topic.
    #[must_use]
    pub fn full_topic(&self) -> &str {
        self.meta(metas::TOPIC)
    }

    /// Topic without its namespace.
    #[must_use]
    pub fn topic(&self) -> &str {
        bare_topic(self.full_topic())
    }

    /// Consumer group the delivery is addressed to.
    #[must_use]
    pub fn consumer_group(&self) -> &str {
        self.meta(metas::CONSUMER_GROUP)
    }

    /// Message key.
    #[must_use]
    pub fn key(&self) -> &str {
        self.meta(metas::KEY)
    }

    /// Sending client name, for direct requests.
    #[must_use]
    pub fn sender(&self) -> Option<&str> {
        self.frame.entity.meta(metas::SENDER)
    }

    /// Transaction id, when the message is a transaction checkback.
    #[must_use]
    pub fn tmid(&self) -> Option<&str> {
        self.frame
            .entity
            .meta(metas::TRANSACTION)
            .filter(|tmid| !tmid.is_empty())
    }

    /// Whether the message belongs to a transaction.
    #[must_use]
    pub fn is_transaction(&self) -> bool {
        self.tmid().is_some()
    }

    /// Delivery guarantee.
    #[must_use]
    pub fn qos(&self) -> Qos {
        self.qos
    }

    /// How many times the broker already delivered this message.
    #[must_use]
    pub fn times(&self) -> u32 {
        self.times
    }

    /// User attribute.
    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.frame
            .entity
            .meta(&format!("{}{name}", metas::ATTR_PREFIX))
    }

    /// Every user attribute.
    #[must_use]
    pub fn attrs(&self) -> BTreeMap<&str, &str> {
        self.frame
            .entity
            .metas()
            .iter()
            .filter_map(|(name, value)| {
                name.strip_prefix(metas::ATTR_PREFIX)
                    .map(|name| (name, value.as_str()))
            })
            .collect()
    }

    /// Message body.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        self.frame.entity.data()
    }

    /// Message body as text.
    #[must_use]
    pub fn body_as_string(&self) -> String {
        self.frame.entity.data_as_string()
    }

    /// Originating frame.
    #[must_use]
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Originating session.
    #[must_use]
    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    /// Acknowledge (`true`) or reject (`false`) the message.
    ///
    /// # Errors
    ///
    /// Returns error if the reply cannot be sent.
    pub fn acknowledge(&self, is_ok: bool) -> Result<(), TransportError> {
        self.acknowledge_with(is_ok, ReplyEntity::default())
    }

    /// Acknowledge with a reply body, or answer with an alarm.
    ///
    /// QoS 0 messages have no reply channel; the call is then a no-op.
    ///
    /// # Errors
    ///
    /// Returns error if the reply cannot be sent.
    pub fn acknowledge_with(
        &self,
        is_ok: bool,
        reply: impl Into<ReplyEntity>,
    ) -> Result<(), TransportError> {
        if self.qos == Qos::AtMostOnce {
            return Ok(());
        }

        if !self.session.is_valid() {
            tracing::debug!(
                session_id = %self.session.session_id(),
                key = %self.key(),
                "Session invalid, reply dropped"
            );
            return Ok(());
        }

        match reply.into() {
            ReplyEntity::Alarm(text) => self.session.reply_alarm(&self.frame, &text),
            ReplyEntity::Plain(entity) => self.session.reply_ack(
                &self.frame,
                entity.meta_put(metas::ACK, if is_ok { "1" } else { "0" }),
            ),
        }
    }
}

impl fmt::Debug for ReceivedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedMessage")
            .field("sid", &self.frame.sid)
            .field("tid", &self.tid())
            .field("full_topic", &self.full_topic())
            .field("consumer_group", &self.consumer_group())
            .field("key", &self.key())
            .field("qos", &self.qos)
            .field("times", &self.times)
            .finish_non_exhaustive()
    }
}
