//! Session transport contract.
//!
//! The client does not implement connection management, clustering, heartbeats
//! or framing. It drives a transport through the traits below:
//!
//! - `Connector` opens a `SessionGroup` over a set of server urls
//! - `SessionGroup` selects sessions, optionally by diversion key
//! - `Session` sends frames and correlates request/response pairs
//! - `SessionListener` receives session lifecycle events and inbound frames
//!
//! Fire-and-forget sends and replies are synchronous enqueues; only
//! `send_and_request` suspends.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use folkmq_proto::{Entity, MqEvent};

use crate::error::TransportError;

/// An inbound frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Stream id used to correlate replies
    pub sid: String,
    /// Raw event identifier
    pub event: String,
    /// Frame payload
    pub entity: Entity,
}

impl Frame {
    /// Create a frame for a known event.
    #[must_use]
    pub fn new(sid: impl Into<String>, event: MqEvent, entity: Entity) -> Self {
        Self {
            sid: sid.into(),
            event: event.as_str().to_string(),
            entity,
        }
    }
}

/// Transport settings assembled on every connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Metadata announced to the broker on handshake
    pub metas: BTreeMap<String, String>,
    /// Heartbeat interval
    pub heartbeat_interval: Duration,
    /// Default timeout for `send_and_request`
    pub request_timeout: Duration,
    /// IO worker count
    pub io_threads: usize,
    /// Codec worker count
    pub codec_threads: usize,
    /// Exchange worker count
    pub exchange_threads: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            metas: BTreeMap::new(),
            heartbeat_interval: Duration::from_secs(6),
            request_timeout: Duration::from_secs(10),
            io_threads: 1,
            codec_threads: 1,
            exchange_threads: 1,
        }
    }
}

impl SessionConfig {
    /// Add a handshake metadata entry.
    pub fn meta_put(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.metas.insert(name.into(), value.into());
        self
    }
}

/// A single connection to a broker.
#[async_trait]
pub trait Session: Send + Sync {
    /// Session identifier, for logging.
    fn session_id(&self) -> &str;

    /// Whether the session can carry frames.
    fn is_valid(&self) -> bool;

    /// Send without waiting for a response.
    ///
    /// # Errors
    ///
    /// Returns error if the frame cannot be enqueued.
    fn send(&self, event: MqEvent, entity: Entity) -> Result<(), TransportError>;

    /// Send and wait for the correlated response.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Timeout` if no response arrives within
    /// `timeout`, or a connectivity error if the session fails.
    async fn send_and_request(
        &self,
        event: MqEvent,
        entity: Entity,
        timeout: Duration,
    ) -> Result<Entity, TransportError>;

    /// Reply to an inbound frame, ending its stream.
    ///
    /// # Errors
    ///
    /// Returns error if the reply cannot be enqueued.
    fn reply_ack(&self, frame: &Frame, entity: Entity) -> Result<(), TransportError>;

    /// Answer an inbound frame with an alarm.
    ///
    /// # Errors
    ///
    /// Returns error if the alarm cannot be enqueued.
    fn reply_alarm(&self, frame: &Frame, text: &str) -> Result<(), TransportError>;
}

/// A set of sessions over one or more brokers.
#[async_trait]
pub trait SessionGroup: Send + Sync {
    /// Select a valid session. Equal diversion keys select the same session
    /// while the group membership is stable.
    fn select_any(&self, diversion: Option<&str>) -> Option<Arc<dyn Session>>;

    /// Every session of the group.
    fn all_sessions(&self) -> Vec<Arc<dyn Session>>;

    /// Close every session.
    async fn close(&self);
}

/// Receives session events from the transport.
#[async_trait]
pub trait SessionListener: Send + Sync {
    /// A session was established. The transport treats the session as ready
    /// once this returns.
    async fn on_open(&self, session: Arc<dyn Session>);

    /// An inbound frame arrived.
    fn on_message(&self, session: Arc<dyn Session>, frame: Frame);

    /// A session was closed.
    fn on_close(&self, session: &dyn Session);

    /// A session reported an error.
    fn on_error(&self, session: &dyn Session, error: &TransportError);
}

/// Opens session groups.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a session group over `urls`, suspending until the initial
    /// connection state is established.
    ///
    /// # Errors
    ///
    /// Returns error if no connection can be established.
    async fn open(
        &self,
        urls: &[String],
        config: SessionConfig,
        listener: Arc<dyn SessionListener>,
    ) -> Result<Arc<dyn SessionGroup>, TransportError>;
}
