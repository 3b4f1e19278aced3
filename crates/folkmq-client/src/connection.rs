//! Shared view of the active session group.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::error::MqError;
use crate::transport::{Session, SessionGroup};

#[derive(Clone)]
struct Attached {
    group: Arc<dyn SessionGroup>,
    request_timeout: Duration,
}

/// Holds the session group between `connect` and `disconnect`.
///
/// Outbound calls only read it; session selection is a lookup and never blocks
/// on the network.
#[derive(Default)]
pub struct Connection {
    attached: RwLock<Option<Attached>>,
}

impl Connection {
    /// Create an unconnected holder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn current(&self) -> Result<Attached, MqError> {
        self.attached
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(MqError::NotConnected)
    }

    /// Install the group opened by `connect`.
    pub fn attach(&self, group: Arc<dyn SessionGroup>, request_timeout: Duration) {
        *self.attached.write().unwrap_or_else(PoisonError::into_inner) = Some(Attached {
            group,
            request_timeout,
        });
    }

    /// Remove the group, returning it for closing.
    pub fn detach(&self) -> Option<Arc<dyn SessionGroup>> {
        self.attached
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map(|attached| attached.group)
    }

    /// Whether a group is installed.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.attached
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Timeout applied to QoS 1 requests of the current connection.
    ///
    /// # Errors
    ///
    /// Returns `MqError::NotConnected` when no group is installed.
    pub fn request_timeout(&self) -> Result<Duration, MqError> {
        self.current().map(|attached| attached.request_timeout)
    }

    /// Select a valid session, routed by `diversion` when given.
    ///
    /// # Errors
    ///
    /// Returns `MqError::NotConnected` without a group and
    /// `MqError::NoSessionAvailable` when the group has no valid session.
    pub fn session(&self, diversion: Option<&str>) -> Result<Arc<dyn Session>, MqError> {
        self.current()?
            .group
            .select_any(diversion)
            .filter(|session| session.is_valid())
            .ok_or(MqError::NoSessionAvailable)
    }

    /// Every session of the group, or none when unconnected.
    #[must_use]
    pub fn all_sessions(&self) -> Vec<Arc<dyn Session>> {
        self.current()
            .map(|attached| attached.group.all_sessions())
            .unwrap_or_default()
    }
}
