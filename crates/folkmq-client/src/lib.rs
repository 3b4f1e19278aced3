//! # FolkMQ Client
//!
//! Client-side coordination for FolkMQ over a pluggable session transport.
//!
//! This crate provides:
//! - The transport contract (`Connector`, `SessionGroup`, `Session`,
//!   `SessionListener`) and an in-memory implementation
//! - A subscription registry restored on every session open
//! - Publishing with QoS 0 and QoS 1 semantics
//! - Two-phase transactional publishing (`publish2` commit/rollback)
//! - Inbound dispatch of deliveries, requests and transaction checkbacks
//! - The `MqClient` facade composing all of the above

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod memory;
pub mod publish;
pub mod received;
pub mod subscription;
pub mod transaction;
pub mod transport;

pub use client::{rewrite_url, ClientIdentity, ConfigHook, MqClient};
pub use config::{ClientSettings, ConfigError};
pub use dispatcher::{Dispatcher, RequestHandler};
pub use error::{HandlerError, MqError, TransportError};
pub use memory::{MemoryConnector, MemorySession, MemorySessionGroup, Outbound};
pub use received::ReceivedMessage;
pub use subscription::{ConsumeHandler, Subscription, SubscriptionRegistry};
pub use transaction::{MqTransaction, TransactionCoordinator};
pub use transport::{Connector, Frame, Session, SessionConfig, SessionGroup, SessionListener};

pub use folkmq_proto::{Entity, MqMessage, Qos, ReplyEntity};
