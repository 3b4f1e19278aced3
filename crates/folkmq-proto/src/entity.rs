//! Frame entities.

use std::collections::BTreeMap;

use crate::metas;

/// Key/value metadata plus a binary body.
///
/// Every outbound request, inbound delivery and reply is carried by an entity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entity {
    metas: BTreeMap<String, String>,
    data: Vec<u8>,
}

impl Entity {
    /// Create an empty entity.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an entity with a binary body.
    #[must_use]
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Self {
            metas: BTreeMap::new(),
            data: data.into(),
        }
    }

    /// Create an entity with a text body.
    #[must_use]
    pub fn from_string(data: impl Into<String>) -> Self {
        Self::from_bytes(data.into().into_bytes())
    }

    /// Add a metadata entry, builder style.
    #[must_use]
    pub fn meta_put(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.put_meta(name, value);
        self
    }

    /// Add or replace a metadata entry.
    pub fn put_meta(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.metas.insert(name.into(), value.into());
    }

    /// Route the entity to a named peer or broker target.
    #[must_use]
    pub fn at(self, target: impl Into<String>) -> Self {
        self.meta_put(metas::AT, target)
    }

    /// Metadata value, if present.
    #[must_use]
    pub fn meta(&self, name: &str) -> Option<&str> {
        self.metas.get(name).map(String::as_str)
    }

    /// Metadata value, or `default` when absent.
    #[must_use]
    pub fn meta_or_default<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.meta(name).unwrap_or(default)
    }

    /// All metadata entries.
    #[must_use]
    pub fn metas(&self) -> &BTreeMap<String, String> {
        &self.metas
    }

    /// Raw body.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    #[must_use]
    pub fn data_as_string(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

impl From<&str> for Entity {
    fn from(value: &str) -> Self {
        Self::from_string(value)
    }
}

impl From<String> for Entity {
    fn from(value: String) -> Self {
        Self::from_string(value)
    }
}

/// Body of a reply to an inbound frame.
///
/// A plain entity is sent as an acknowledgment carrying the ack flag; an alarm
/// is sent through the alarm path instead. The two are mutually exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyEntity {
    /// Acknowledgment with an optional body
    Plain(Entity),
    /// Error-carrying reply
    Alarm(String),
}

impl Default for ReplyEntity {
    fn default() -> Self {
        Self::Plain(Entity::new())
    }
}

impl From<Entity> for ReplyEntity {
    fn from(value: Entity) -> Self {
        Self::Plain(value)
    }
}
