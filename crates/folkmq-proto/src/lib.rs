//! # FolkMQ Protocol
//!
//! Wire vocabulary shared by every FolkMQ client component.
//!
//! ## Contents
//!
//! - `MqEvent`: the closed set of event identifiers exchanged with the broker
//! - `metas`: metadata keys and routing targets
//! - `Entity`: key/value metadata plus a binary body, the carrier of every frame
//! - `MqMessage`: an outbound message and its publish-entity encoding
//! - `topics`: namespace qualification of topic strings

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod entity;
pub mod messages;
pub mod topics;

pub use entity::{Entity, ReplyEntity};
pub use messages::{
    batch_subscribe_entity, is_confirmed, metas, parse_batch_subscribe, MessageError, MqEvent,
    MqMessage, Qos,
};
pub use topics::{bare_topic, check_meta, full_topic, queue_name};

/// Protocol version code announced to the broker at connect time.
pub const VERSION_CODE: u32 = 2;

/// Human readable version of this client.
pub const VERSION_NAME: &str = env!("CARGO_PKG_VERSION");
