//! Parser for the `x-data-override` header
//!
//! Syntax: `OP(member);OP(member);...` where `OP` is one of `ADD`, `REMOVE`,
//! `CHECK_INCLUDE`, `CHECK_EXCLUDE`. Overrides apply to one exchange only
//! and ignore phases.

use super::{Operation, PolicyError};
use crate::labels::{is_label, DELIMITER};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Handling of override tokens that do not parse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideMode {
    /// Drop malformed tokens and apply the rest
    #[default]
    Ignore,
    /// Reject the exchange on the first malformed token
    Reject,
}

/// Result of parsing an override header
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedOverrides {
    /// Parsed actions, in header order
    pub actions: Vec<(Operation, String)>,
    /// Tokens dropped as malformed
    pub dropped: usize,
}

/// Parse an override header value
///
/// Empty tokens (from `;;` or a trailing `;`) are skipped silently and do
/// not count as malformed.
pub fn parse_overrides(text: &str, mode: OverrideMode) -> Result<ParsedOverrides, PolicyError> {
    let mut parsed = ParsedOverrides::default();

    for token in text.split(DELIMITER).map(str::trim) {
        if token.is_empty() {
            continue;
        }
        match parse_token(token) {
            Some(action) => parsed.actions.push(action),
            None => match mode {
                OverrideMode::Ignore => {
                    debug!(token = token, "Dropping malformed override");
                    parsed.dropped += 1;
                }
                OverrideMode::Reject => {
                    return Err(PolicyError::MalformedOverride {
                        token: token.to_string(),
                    });
                }
            },
        }
    }

    Ok(parsed)
}

/// Split `OP(member)` into its operation and member
fn parse_token(token: &str) -> Option<(Operation, String)> {
    let open = token.find('(')?;
    let close = token.rfind(')')?;
    if close <= open {
        return None;
    }

    let operation = token[..open].trim().parse::<Operation>().ok()?;
    let member = &token[open + 1..close];
    if !is_label(member) {
        return None;
    }
    Some((operation, member.to_string()))
}
