//! Topic names, topic filters and the linear filter matcher.
//!
//! [`matches`] compares one topic against one filter by walking both
//! segment by segment. The broker uses the trie in [`crate::trie`] for
//! fan-out; this matcher serves the client, which only holds a handful of
//! filters, and acts as the reference the trie is tested against.

use crate::error::{Error, Result};

/// Check whether `topic` matches `filter`.
///
/// - `+` matches exactly one level and must fill a whole segment.
/// - `#` matches any number of remaining levels, including none, so
///   `"sport"` matches `"sport/#"`. It must be the final segment.
/// - A leading wildcard never matches a topic starting with `$`.
///
/// Malformed filters never match anything.
pub fn matches(topic: &str, filter: &str) -> bool {
    if topic.is_empty() || filter.is_empty() {
        return false;
    }
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/').peekable();
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.peek().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) => {
                if f.contains(['+', '#']) || f != t {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Validate a topic filter as carried in SUBSCRIBE / UNSUBSCRIBE.
pub fn validate_filter(filter: &str) -> Result<()> {
    check_common(filter, "topic filter")?;

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        match level {
            "+" => {}
            "#" if levels.peek().is_none() => {}
            "#" => {
                return Err(Error::protocol(format!(
                    "'#' must be the last level in filter {:?}",
                    filter
                )));
            }
            _ if level.contains(['+', '#']) => {
                return Err(Error::protocol(format!(
                    "wildcard must occupy a whole level in filter {:?}",
                    filter
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Validate a topic name as carried in PUBLISH. Wildcards are not allowed.
pub fn validate_topic(topic: &str) -> Result<()> {
    check_common(topic, "topic")?;
    if topic.contains(['+', '#']) {
        return Err(Error::protocol(format!(
            "topic {:?} must not contain wildcards",
            topic
        )));
    }
    Ok(())
}

fn check_common(value: &str, what: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::protocol(format!("{} must not be empty", what)));
    }
    if value.len() > u16::MAX as usize {
        return Err(Error::protocol(format!("{} longer than 65535 bytes", what)));
    }
    if value.contains('\0') {
        return Err(Error::protocol(format!("{} must not contain NUL", what)));
    }
    Ok(())
}
