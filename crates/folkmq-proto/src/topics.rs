//! Topic namespacing.
//!
//! A namespaced topic has the form `{namespace}:{topic}`. Topics are qualified
//! once on the client side; every registry key and every wire frame carries the
//! qualified form.
//!
//! A subscription is identified on the broker by its queue name,
//! `{full_topic}#{consumer_group}`.

/// Separator between namespace and topic.
pub const NAMESPACE_SEPARATOR: char = ':';

/// Separator between topic and consumer group in a queue name.
pub const QUEUE_SEPARATOR: &str = "#";

/// Qualify `topic` with `namespace`.
///
/// An empty namespace leaves the topic unchanged.
#[must_use]
pub fn full_topic(namespace: &str, topic: &str) -> String {
    if namespace.is_empty() {
        topic.to_string()
    } else {
        format!("{namespace}{NAMESPACE_SEPARATOR}{topic}")
    }
}

/// Strip the namespace from a qualified topic.
///
/// Returns the input unchanged when it carries no namespace, which covers both
/// a missing separator and a separator in leading position.
#[must_use]
pub fn bare_topic(full_topic: &str) -> &str {
    match full_topic.find(NAMESPACE_SEPARATOR) {
        Some(idx) if idx > 0 => &full_topic[idx + 1..],
        _ => full_topic,
    }
}

/// Queue name of the subscription `(full_topic, consumer_group)`.
#[must_use]
pub fn queue_name(full_topic: &str, consumer_group: &str) -> String {
    format!("{full_topic}{QUEUE_SEPARATOR}{consumer_group}")
}

/// Characters a topic, consumer group, key or client name may not contain.
pub const RESERVED_CHARS: &[char] = &['@', ',', ';', ':', '#', '!'];

/// Check that a metadata-bound parameter is non-empty and free of reserved
/// characters.
///
/// # Errors
///
/// Returns a description of the violation.
pub fn check_meta(value: &str, name: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("param '{name}' can't be empty"));
    }

    if let Some(ch) = value.chars().find(|c| RESERVED_CHARS.contains(c)) {
        return Err(format!("param '{name}' can't contain '{ch}'"));
    }

    Ok(())
}
