//! YAML policy parser
//!
//! Parses policy files of the form:
//!
//! ```yaml
//! version: "1"
//! actions:
//!   - phase: INBOUND
//!     operation: ADD
//!     member: pii
//! ```

use super::{Operation, Phase, Policy, PolicyAction};
use crate::labels::{is_label, DELIMITER};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Policy parsing errors
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid action #{index}: {reason}")]
    InvalidAction { index: usize, reason: String },
}

/// A complete policy file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyFile {
    /// File version (for future compatibility)
    #[serde(default = "default_version")]
    pub version: String,

    /// Ordered actions
    #[serde(default)]
    pub actions: Vec<PolicyAction>,
}

fn default_version() -> String {
    "1".to_string()
}

impl PolicyFile {
    pub fn into_policy(self) -> Policy {
        Policy::new(self.actions)
    }
}

/// Check that every member can round-trip through a label payload
pub fn validate_actions(actions: &[PolicyAction]) -> Result<(), ParseError> {
    for (index, action) in actions.iter().enumerate() {
        if !is_label(&action.member) {
            return Err(ParseError::InvalidAction {
                index,
                reason: format!("member {:?} is empty or reserved", action.member),
            });
        }
        if action.member.contains(DELIMITER) {
            return Err(ParseError::InvalidAction {
                index,
                reason: format!(
                    "member {:?} contains the label delimiter {:?}",
                    action.member, DELIMITER
                ),
            });
        }
    }
    Ok(())
}

/// Parse a policy from a YAML string
pub fn parse_policy(yaml: &str) -> Result<PolicyFile, ParseError> {
    let file: PolicyFile = serde_yaml::from_str(yaml)?;
    validate_actions(&file.actions)?;
    Ok(file)
}

/// Parse a policy from a file
pub fn parse_policy_file(path: &Path) -> Result<PolicyFile, ParseError> {
    let content = std::fs::read_to_string(path)?;
    parse_policy(&content)
}

/// Example policy, used for documentation and `example-config`
pub fn example_policy() -> Policy {
    Policy::new(vec![
        PolicyAction::new(Phase::Inbound, Operation::Add, "pii"),
        PolicyAction::new(Phase::Inbound, Operation::CheckExclude, "blocked"),
        PolicyAction::new(Phase::Outbound, Operation::Remove, "internal"),
    ])
}
