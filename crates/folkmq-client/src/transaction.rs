//! Two-phase publish.
//!
//! Messages published under a transaction are held by the broker until the
//! client sends a `publish2` naming their keys, either to commit them or to
//! roll them back. Both the messages and the `publish2` route by transaction
//! id, so they reach the same session.

use std::sync::{Arc, Mutex, PoisonError};

use folkmq_proto::{metas, Entity, MqEvent, MqMessage};
use uuid::Uuid;

use crate::connection::Connection;
use crate::error::MqError;
use crate::publish::ensure_confirmed;

/// Sends commit and rollback requests.
pub struct TransactionCoordinator {
    connection: Arc<Connection>,
}

impl TransactionCoordinator {
    /// Create a coordinator over a shared connection.
    #[must_use]
    pub fn new(connection: Arc<Connection>) -> Self {
        Self { connection }
    }

    /// Commit (`rollback == false`) or roll back the messages with `keys`.
    ///
    /// An empty key list completes immediately without touching the network.
    ///
    /// # Errors
    ///
    /// Returns a connectivity error if no session is reachable, or
    /// `MqError::ConfirmFailed` if the broker rejects the request.
    pub async fn publish2(&self, tmid: &str, keys: &[String], rollback: bool) -> Result<(), MqError> {
        if keys.is_empty() {
            return Ok(());
        }

        let session = self.connection.session(Some(tmid))?;
        let entity = Entity::from_string(keys.join(","))
            .meta_put(metas::ROLLBACK, if rollback { "1" } else { "0" })
            .at(metas::BROKER_AT_SERVER_HASH);

        let timeout = self.connection.request_timeout()?;
        let response = session
            .send_and_request(MqEvent::Publish2, entity, timeout)
            .await?;
        ensure_confirmed("publish2", &response)?;

        tracing::info!(
            tmid,
            keys = keys.len(),
            rollback,
            session_id = %session.session_id(),
            "Transaction completed"
        );
        Ok(())
    }
}

/// A transaction in progress.
///
/// Bind each message with `bind` before publishing it, then finish with
/// `commit` or `rollback`.
pub struct MqTransaction {
    tmid: String,
    keys: Mutex<Vec<String>>,
    coordinator: Arc<TransactionCoordinator>,
}

impl MqTransaction {
    /// Start a transaction with a fresh id.
    #[must_use]
    pub fn new(coordinator: Arc<TransactionCoordinator>) -> Self {
        Self {
            tmid: Uuid::new_v4().simple().to_string(),
            keys: Mutex::new(Vec::new()),
            coordinator,
        }
    }

    /// Transaction id.
    #[must_use]
    pub fn tmid(&self) -> &str {
        &self.tmid
    }

    /// Tag `message` with this transaction and record its key.
    #[must_use]
    pub fn bind(&self, message: MqMessage) -> MqMessage {
        let message = message.transaction(&self.tmid);
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.get_key().to_string());
        message
    }

    /// Keys bound so far.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Release every bound message to its subscribers.
    ///
    /// # Errors
    ///
    /// See `TransactionCoordinator::publish2`.
    pub async fn commit(self) -> Result<(), MqError> {
        self.finish(false).await
    }

    /// Discard every bound message.
    ///
    /// # Errors
    ///
    /// See `TransactionCoordinator::publish2`.
    pub async fn rollback(self) -> Result<(), MqError> {
        self.finish(true).await
    }

    async fn finish(self, rollback: bool) -> Result<(), MqError> {
        let keys = self.keys.into_inner().unwrap_or_else(PoisonError::into_inner);
        self.coordinator
            .publish2(&self.tmid, &keys, rollback)
            .await
    }
}
