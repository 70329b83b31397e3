//! Topic filter matching and topic construction
//!
//! Filters use the two MQTT wildcards:
//!
//! - `+` matches exactly one non-empty path segment
//! - `#` matches everything from its position to the end of the topic,
//!   including separators, as long as at least one character follows
//!
//! Matching is tokenized: filter and topic are split on `/` and compared
//! segment by segment. No other character is special and nothing is
//! case-normalized.
//!
//! # Trailing `#` boundary
//!
//! `a/#` does **not** match the bare topic `a`, nor `a/`. At least one
//! character has to follow the separator in front of the `#`. Gateways that
//! share subscriptions with this agent rely on that behavior, so the matcher
//! keeps it instead of the full multi-level semantics some brokers apply.

use thiserror::Error;

/// Path separator between topic segments
pub const TOPIC_SEPARATOR: char = '/';

/// Single-level wildcard token
pub const SINGLE_LEVEL_WILDCARD: &str = "+";

/// Multi-level wildcard token
pub const MULTI_LEVEL_WILDCARD: &str = "#";

/// Check whether `topic` matches the subscription `filter`.
///
/// Misplaced wildcard characters (`a+`, `#/b`) compare literally; use
/// [`validate_filter`] to reject such filters up front.
pub fn topic_matches(topic: &str, filter: &str) -> bool {
    let topic_segments: Vec<&str> = topic.split(TOPIC_SEPARATOR).collect();
    let filter_segments: Vec<&str> = filter.split(TOPIC_SEPARATOR).collect();
    matches_segments(&topic_segments, &filter_segments)
}

/// Segment-level matcher shared by [`topic_matches`] and callers that split
/// the topic once for many filters.
pub fn matches_segments(topic_segments: &[&str], filter_segments: &[&str]) -> bool {
    let last_filter_index = filter_segments.len().saturating_sub(1);

    for (index, filter_segment) in filter_segments.iter().enumerate() {
        if *filter_segment == MULTI_LEVEL_WILDCARD && index == last_filter_index {
            let rest = topic_segments.get(index..).unwrap_or_default();
            return match rest {
                [] => false,
                [only] => !only.is_empty(),
                _ => true,
            };
        }

        let Some(topic_segment) = topic_segments.get(index) else {
            return false;
        };

        if *filter_segment == SINGLE_LEVEL_WILDCARD {
            if topic_segment.is_empty() {
                return false;
            }
        } else if filter_segment != topic_segment {
            return false;
        }
    }

    topic_segments.len() == filter_segments.len()
}

/// Reject filters a broker would refuse.
pub fn validate_filter(filter: &str) -> Result<(), FilterError> {
    if filter.is_empty() {
        return Err(FilterError::Empty);
    }

    let segments: Vec<&str> = filter.split(TOPIC_SEPARATOR).collect();
    let last_index = segments.len() - 1;

    for (index, segment) in segments.iter().enumerate() {
        if segment.contains('#') && (*segment != MULTI_LEVEL_WILDCARD || index != last_index) {
            return Err(FilterError::MisplacedMultiLevel);
        }
        if segment.contains('+') && *segment != SINGLE_LEVEL_WILDCARD {
            return Err(FilterError::MixedSingleLevel {
                segment: (*segment).to_string(),
            });
        }
    }

    Ok(())
}

/// Build the fully-qualified publish topic `<logical_topic>/<agent_id>`
pub fn publish_topic(logical_topic: &str, agent_id: &str) -> String {
    format!("{logical_topic}{TOPIC_SEPARATOR}{agent_id}")
}

/// Default liveness topic for an agent: `agents/<agent_id>/status/connection`
pub fn default_status_topic(agent_id: &str) -> String {
    format!("agents/{agent_id}/status/connection")
}

/// Validate agent identifier format `[a-zA-Z0-9._-]+`
pub fn validate_agent_id(agent_id: &str) -> Result<(), ValidationError> {
    if agent_id.is_empty() {
        return Err(ValidationError::EmptyAgentId);
    }

    for ch in agent_id.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(ValidationError::InvalidAgentIdChar(ch));
        }
    }

    Ok(())
}

/// Filter validation errors
#[derive(Debug, Error, PartialEq)]
pub enum FilterError {
    #[error("filter is empty")]
    Empty,
    #[error("'#' must be the last segment on its own")]
    MisplacedMultiLevel,
    #[error("'+' must occupy a whole segment, found '{segment}'")]
    MixedSingleLevel { segment: String },
}

/// Agent identifier validation errors
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Agent ID cannot be empty")]
    EmptyAgentId,
    #[error("Agent ID contains invalid character: '{0}'")]
    InvalidAgentIdChar(char),
}
