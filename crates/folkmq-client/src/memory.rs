//! In-memory transport.
//!
//! Implements the transport traits without a network: outbound traffic is
//! recorded per session, QoS 1 requests are answered by a scripted responder,
//! and inbound frames are injected with `MemorySessionGroup::deliver`.
//!
//! Diversion keys are hashed onto the valid sessions, so equal keys land on
//! the same session while the membership is stable.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use folkmq_proto::{metas, Entity, MqEvent};

use crate::error::TransportError;
use crate::transport::{
    Connector, Frame, Session, SessionConfig, SessionGroup, SessionListener,
};

/// Computes the response to a QoS 1 request. `None` leaves the request
/// unanswered until it times out.
pub type Responder = Arc<dyn Fn(MqEvent, &Entity) -> Option<Entity> + Send + Sync>;

/// Responder confirming every request.
#[must_use]
pub fn confirm_all() -> Responder {
    Arc::new(|_, _| Some(Entity::new().meta_put(metas::CONFIRM, "1")))
}

/// Traffic recorded by a `MemorySession`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Fire-and-forget frame
    Send {
        /// Event
        event: MqEvent,
        /// Payload
        entity: Entity,
    },
    /// QoS 1 request
    Request {
        /// Event
        event: MqEvent,
        /// Payload
        entity: Entity,
    },
    /// Acknowledgment of an inbound frame
    Ack {
        /// Stream id of the acknowledged frame
        sid: String,
        /// Reply payload
        entity: Entity,
    },
    /// Alarm answering an inbound frame
    Alarm {
        /// Stream id of the answered frame
        sid: String,
        /// Alarm text
        text: String,
    },
}

/// A session that records what it sends.
pub struct MemorySession {
    id: String,
    valid: AtomicBool,
    fail_replies: AtomicBool,
    responder: RwLock<Responder>,
    outbox: Mutex<Vec<Outbound>>,
}

impl MemorySession {
    /// Create a valid session confirming every request.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Self::with_responder(id, confirm_all())
    }

    /// Create a valid session with a custom responder.
    #[must_use]
    pub fn with_responder(id: impl Into<String>, responder: Responder) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            valid: AtomicBool::new(true),
            fail_replies: AtomicBool::new(false),
            responder: RwLock::new(responder),
            outbox: Mutex::new(Vec::new()),
        })
    }

    /// Replace the responder.
    pub fn set_responder(&self, responder: Responder) {
        *self.responder.write().unwrap_or_else(PoisonError::into_inner) = responder;
    }

    /// Mark the session valid or invalid.
    pub fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::SeqCst);
    }

    /// Make acknowledgments and alarms fail.
    pub fn fail_replies(&self, fail: bool) {
        self.fail_replies.store(fail, Ordering::SeqCst);
    }

    /// Recorded traffic.
    #[must_use]
    pub fn outbound(&self) -> Vec<Outbound> {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drain recorded traffic.
    pub fn take_outbound(&self) -> Vec<Outbound> {
        std::mem::take(&mut *self.outbox.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn record(&self, outbound: Outbound) {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(outbound);
    }

    fn ensure_valid(&self) -> Result<(), TransportError> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    fn ensure_replies(&self) -> Result<(), TransportError> {
        self.ensure_valid()?;
        if self.fail_replies.load(Ordering::SeqCst) {
            return Err(TransportError::Connection(format!(
                "reply rejected by session {}",
                self.id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Session for MemorySession {
    fn session_id(&self) -> &str {
        &self.id
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    fn send(&self, event: MqEvent, entity: Entity) -> Result<(), TransportError> {
        self.ensure_valid()?;
        self.record(Outbound::Send { event, entity });
        Ok(())
    }

    async fn send_and_request(
        &self,
        event: MqEvent,
        entity: Entity,
        timeout: Duration,
    ) -> Result<Entity, TransportError> {
        self.ensure_valid()?;

        let responder = self
            .responder
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let response = responder(event, &entity);
        self.record(Outbound::Request { event, entity });

        match response {
            Some(response) => Ok(response),
            None => {
                tokio::time::sleep(timeout).await;
                Err(TransportError::Timeout(timeout))
            }
        }
    }

    fn reply_ack(&self, frame: &Frame, entity: Entity) -> Result<(), TransportError> {
        self.ensure_replies()?;
        self.record(Outbound::Ack {
            sid: frame.sid.clone(),
            entity,
        });
        Ok(())
    }

    fn reply_alarm(&self, frame: &Frame, text: &str) -> Result<(), TransportError> {
        self.ensure_replies()?;
        self.record(Outbound::Alarm {
            sid: frame.sid.clone(),
            text: text.to_string(),
        });
        Ok(())
    }
}

/// A group of in-memory sessions bound to one listener.
pub struct MemorySessionGroup {
    sessions: Vec<Arc<MemorySession>>,
    listener: Arc<dyn SessionListener>,
    cursor: AtomicUsize,
}

impl MemorySessionGroup {
    /// Create a group over `sessions`.
    #[must_use]
    pub fn new(sessions: Vec<Arc<MemorySession>>, listener: Arc<dyn SessionListener>) -> Self {
        Self {
            sessions,
            listener,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Session by position.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    #[must_use]
    pub fn session(&self, index: usize) -> &Arc<MemorySession> {
        &self.sessions[index]
    }

    /// Every session, valid or not.
    #[must_use]
    pub fn sessions(&self) -> &[Arc<MemorySession>] {
        &self.sessions
    }

    /// Inject an inbound frame on session `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn deliver(&self, index: usize, frame: Frame) {
        let session: Arc<dyn Session> = self.sessions[index].clone();
        self.listener.on_message(session, frame);
    }

    /// Re-establish session `index`, running the listener's open path.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub async fn reopen(&self, index: usize) {
        let session = self.sessions[index].clone();
        session.set_valid(true);
        self.listener.on_open(session).await;
    }

    fn valid_sessions(&self) -> Vec<&Arc<MemorySession>> {
        self.sessions.iter().filter(|s| s.is_valid()).collect()
    }
}

#[async_trait]
impl SessionGroup for MemorySessionGroup {
    fn select_any(&self, diversion: Option<&str>) -> Option<Arc<dyn Session>> {
        let valid = self.valid_sessions();
        if valid.is_empty() {
            return None;
        }

        let index = match diversion {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                usize::try_from(hasher.finish() % valid.len() as u64).unwrap_or(0)
            }
            None => self.cursor.fetch_add(1, Ordering::Relaxed) % valid.len(),
        };

        let session: Arc<dyn Session> = valid[index].clone();
        Some(session)
    }

    fn all_sessions(&self) -> Vec<Arc<dyn Session>> {
        self.valid_sessions()
            .into_iter()
            .map(|s| -> Arc<dyn Session> { s.clone() })
            .collect()
    }

    async fn close(&self) {
        for session in &self.sessions {
            session.set_valid(false);
            self.listener.on_close(session.as_ref());
        }
    }
}

struct Opened {
    urls: Vec<String>,
    config: SessionConfig,
    group: Arc<MemorySessionGroup>,
}

/// Opens `MemorySessionGroup`s.
pub struct MemoryConnector {
    session_count: usize,
    responder: Responder,
    opened: Mutex<Vec<Opened>>,
}

impl MemoryConnector {
    /// Connector producing groups of `session_count` confirming sessions.
    #[must_use]
    pub fn new(session_count: usize) -> Self {
        Self {
            session_count,
            responder: confirm_all(),
            opened: Mutex::new(Vec::new()),
        }
    }

    /// Use `responder` for the sessions of every group opened from now on.
    #[must_use]
    pub fn with_responder(mut self, responder: Responder) -> Self {
        self.responder = responder;
        self
    }

    /// Number of groups opened so far.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Most recently opened group.
    #[must_use]
    pub fn last_group(&self) -> Option<Arc<MemorySessionGroup>> {
        self.with_last(|opened| opened.group.clone())
    }

    /// Configuration passed to the most recent open.
    #[must_use]
    pub fn last_config(&self) -> Option<SessionConfig> {
        self.with_last(|opened| opened.config.clone())
    }

    /// Urls passed to the most recent open.
    #[must_use]
    pub fn last_urls(&self) -> Option<Vec<String>> {
        self.with_last(|opened| opened.urls.clone())
    }

    fn with_last<T>(&self, f: impl FnOnce(&Opened) -> T) -> Option<T> {
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .map(f)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(
        &self,
        urls: &[String],
        config: SessionConfig,
        listener: Arc<dyn SessionListener>,
    ) -> Result<Arc<dyn SessionGroup>, TransportError> {
        if self.session_count == 0 {
            return Err(TransportError::Connection("no server reachable".to_string()));
        }

        let generation = self.open_count();
        let sessions = (0..self.session_count)
            .map(|i| {
                MemorySession::with_responder(format!("mem-{generation}-{i}"), self.responder.clone())
            })
            .collect::<Vec<_>>();

        let group = Arc::new(MemorySessionGroup::new(sessions, listener.clone()));
        for session in group.sessions() {
            listener.on_open(session.clone()).await;
        }

        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Opened {
                urls: urls.to_vec(),
                config,
                group: group.clone(),
            });

        let group: Arc<dyn SessionGroup> = group;
        Ok(group)
    }
}
