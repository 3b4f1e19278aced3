//! Publish engine.
//!
//! Routes each message to a session by its diversion key and applies the QoS
//! contract: QoS 0 is a fire-and-forget send, QoS 1 waits for the broker's
//! confirmation and fails unless the confirm flag is exactly `1`.

use std::sync::Arc;

use folkmq_proto::{is_confirmed, metas, Entity, MqEvent, MqMessage, Qos};

use crate::connection::Connection;
use crate::error::MqError;

/// Routing key of a message.
///
/// Transactional messages route by transaction id so the commit or rollback
/// reaches the session that carried them. Sequence messages route by their
/// sharding key, or by topic when none is set. Everything else may use any
/// session.
#[must_use]
pub fn diversion_key<'a>(full_topic: &'a str, message: &'a MqMessage) -> Option<&'a str> {
    if let Some(tmid) = message.tmid() {
        return Some(tmid);
    }

    if message.is_sequence() {
        return Some(
            message
                .get_sequence_sharding()
                .filter(|sharding| !sharding.is_empty())
                .unwrap_or(full_topic),
        );
    }

    None
}

/// Check the confirm flag of a QoS 1 response.
///
/// # Errors
///
/// Returns `MqError::ConfirmFailed` carrying the response body when the flag is
/// missing, not an integer, or not `1`.
pub fn ensure_confirmed(operation: &'static str, response: &Entity) -> Result<(), MqError> {
    if is_confirmed(response) {
        Ok(())
    } else {
        Err(MqError::ConfirmFailed {
            operation,
            message: response.data_as_string(),
        })
    }
}

/// Sends publish and unpublish requests.
pub struct PublishEngine {
    connection: Arc<Connection>,
}

impl PublishEngine {
    /// Create an engine over a shared connection.
    #[must_use]
    pub fn new(connection: Arc<Connection>) -> Self {
        Self { connection }
    }

    /// Publish `message` on an already qualified topic.
    ///
    /// # Errors
    ///
    /// Returns a connectivity error if no session is reachable, or
    /// `MqError::ConfirmFailed` if the broker rejects a QoS 1 message.
    pub async fn publish(&self, full_topic: &str, message: &MqMessage) -> Result<(), MqError> {
        let session = self
            .connection
            .session(diversion_key(full_topic, message))?;
        let entity = message.to_publish_entity(full_topic);

        match message.get_qos() {
            Qos::AtLeastOnce => {
                let timeout = self.connection.request_timeout()?;
                let response = session
                    .send_and_request(MqEvent::Publish, entity, timeout)
                    .await?;
                ensure_confirmed("publish", &response)?;
            }
            Qos::AtMostOnce => session.send(MqEvent::Publish, entity)?,
        }

        tracing::debug!(
            topic = full_topic,
            key = message.get_key(),
            session_id = %session.session_id(),
            "Message published"
        );
        Ok(())
    }

    /// Withdraw a message that has not been delivered yet.
    ///
    /// # Errors
    ///
    /// Returns a connectivity error if no session is reachable, or
    /// `MqError::ConfirmFailed` if the broker rejects the request.
    pub async fn unpublish(&self, full_topic: &str, key: &str) -> Result<(), MqError> {
        let session = self.connection.session(None)?;
        let entity = Entity::new()
            .meta_put(metas::TOPIC, full_topic)
            .meta_put(metas::KEY, key)
            .at(metas::BROKER_AT_SERVER_ALL);

        let timeout = self.connection.request_timeout()?;
        let response = session
            .send_and_request(MqEvent::Unpublish, entity, timeout)
            .await?;
        ensure_confirmed("unpublish", &response)?;

        tracing::debug!(topic = full_topic, key, "Message unpublished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::error::TransportError;
    use crate::memory::{MemorySession, MemorySessionGroup, Outbound};
    use crate::transport::{Frame, Session, SessionListener};

    struct Quiet;

    #[async_trait::async_trait]
    impl SessionListener for Quiet {
        async fn on_open(&self, _session: Arc<dyn Session>) {}
        fn on_message(&self, _session: Arc<dyn Session>, _frame: Frame) {}
        fn on_close(&self, _session: &dyn Session) {}
        fn on_error(&self, _session: &dyn Session, _error: &TransportError) {}
    }

    fn connected(session: Arc<MemorySession>) -> (PublishEngine, Arc<MemorySessionGroup>) {
        let group = Arc::new(MemorySessionGroup::new(vec![session], Arc::new(Quiet)));
        let connection = Arc::new(Connection::new());
        connection.attach(group.clone(), Duration::from_millis(50));
        (PublishEngine::new(connection), group)
    }

    #[test]
    fn diversion_prefers_transaction() {
        let plain = MqMessage::new("x");
        assert_eq!(diversion_key("ns:t", &plain), None);

        let sequenced = MqMessage::new("x").sequence(true);
        assert_eq!(diversion_key("ns:t", &sequenced), Some("ns:t"));

        let sharded = MqMessage::new("x").sequence_sharding("user-7");
        assert_eq!(diversion_key("ns:t", &sharded), Some("user-7"));

        let transactional = MqMessage::new("x").sequence_sharding("user-7").transaction("tm-1");
        assert_eq!(diversion_key("ns:t", &transactional), Some("tm-1"));
    }

    #[test]
    fn confirm_flag_must_be_one() {
        assert_ok!(ensure_confirmed("publish", &Entity::new().meta_put(metas::CONFIRM, "1")));

        for flag in ["0", "2", "yes", ""] {
            let response = Entity::from_string("queue full").meta_put(metas::CONFIRM, flag);
            let err = assert_err!(ensure_confirmed("publish", &response));
            assert!(matches!(
                err,
                MqError::ConfirmFailed { operation: "publish", ref message } if message == "queue full"
            ));
        }

        assert_err!(ensure_confirmed("publish", &Entity::new()));
    }

    #[tokio::test]
    async fn qos0_sends_without_waiting() {
        let session = MemorySession::with_responder("s0", Arc::new(|_, _| None));
        let (engine, _group) = connected(session.clone());

        let message = MqMessage::new("hello").qos(Qos::AtMostOnce);
        assert_ok!(engine.publish("ns:demo", &message).await);

        let outbound = session.outbound();
        assert_eq!(outbound.len(), 1);
        assert!(matches!(
            &outbound[0],
            Outbound::Send { event: MqEvent::Publish, entity } if entity.meta(metas::TOPIC) == Some("ns:demo")
        ));
    }

    #[tokio::test]
    async fn qos1_rejection_carries_body() {
        let session = MemorySession::with_responder(
            "s0",
            Arc::new(|_, _| Some(Entity::from_string("no such topic").meta_put(metas::CONFIRM, "0"))),
        );
        let (engine, _group) = connected(session);

        let err = assert_err!(engine.publish("ns:demo", &MqMessage::new("hello")).await);
        assert_eq!(
            err.to_string(),
            "client message publish confirm failed: no such topic"
        );
        assert!(!err.is_connectivity());
    }

    #[tokio::test]
    async fn unpublish_targets_every_broker() {
        let session = MemorySession::new("s0");
        let (engine, _group) = connected(session.clone());

        assert_ok!(engine.unpublish("ns:demo", "order-1").await);

        let outbound = session.outbound();
        let Outbound::Request { event, entity } = &outbound[0] else {
            panic!("expected a request, got {outbound:?}");
        };
        assert_eq!(*event, MqEvent::Unpublish);
        assert_eq!(entity.meta(metas::KEY), Some("order-1"));
        assert_eq!(entity.meta(metas::AT), Some(metas::BROKER_AT_SERVER_ALL));
    }

    #[tokio::test]
    async fn unconnected_engine_fails_fast() {
        let engine = PublishEngine::new(Arc::new(Connection::new()));

        let err = assert_err!(engine.publish("ns:demo", &MqMessage::new("x")).await);
        assert!(matches!(err, MqError::NotConnected));
    }
}
