//! Label policy engine
//!
//! A policy is an ordered list of `(phase, operation, member)` actions. The
//! order is the authority order: actions run strictly as configured, and the
//! phase only decides whether an action applies to the current evaluation.
//!
//! - [`evaluator`]: applies a policy and per-exchange overrides to a label set
//! - [`overrides`]: parses the `x-data-override` header
//! - [`parser`]: loads policies from YAML files

pub mod evaluator;
pub mod overrides;
pub mod parser;

pub use evaluator::{Evaluation, PolicyEvaluator};
pub use overrides::{parse_overrides, OverrideMode, ParsedOverrides};
pub use parser::{parse_policy, parse_policy_file, ParseError, PolicyFile};

use crate::labels::LabelSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Policy evaluation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    /// A CHECK_INCLUDE or CHECK_EXCLUDE action failed
    #[error("Policy rejected exchange: {operation}({member})")]
    Rejected { operation: Operation, member: String },

    /// An override token could not be parsed (strict override mode only)
    #[error("Malformed override: {token:?}")]
    MalformedOverride { token: String },
}

/// Which side of a trace an evaluation runs on
///
/// INBOUND covers the parent's request and a child's response. OUTBOUND
/// covers the parent's response and a child's request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    #[serde(alias = "inbound")]
    Inbound,
    #[serde(alias = "outbound")]
    Outbound,
}

impl Phase {
    pub fn opposite(self) -> Self {
        match self {
            Phase::Inbound => Phase::Outbound,
            Phase::Outbound => Phase::Inbound,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Inbound => "INBOUND",
            Phase::Outbound => "OUTBOUND",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INBOUND" => Ok(Phase::Inbound),
            "OUTBOUND" => Ok(Phase::Outbound),
            _ => Err(format!("unknown phase: {}", s)),
        }
    }
}

/// Set operation applied to a label set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    #[serde(alias = "add")]
    Add,
    #[serde(alias = "remove")]
    Remove,
    #[serde(alias = "check_include")]
    CheckInclude,
    #[serde(alias = "check_exclude")]
    CheckExclude,
}

impl Operation {
    /// Wire name, as used in override headers
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Add => "ADD",
            Operation::Remove => "REMOVE",
            Operation::CheckInclude => "CHECK_INCLUDE",
            Operation::CheckExclude => "CHECK_EXCLUDE",
        }
    }

    /// Apply the operation to `labels`
    ///
    /// Checks leave the set untouched and fail with [`PolicyError::Rejected`].
    pub fn apply(self, labels: &mut LabelSet, member: &str) -> Result<(), PolicyError> {
        match self {
            Operation::Add => labels.add(member),
            Operation::Remove => {
                labels.remove(member);
            }
            Operation::CheckInclude => {
                if !labels.contains(member) {
                    return Err(self.rejected(member));
                }
            }
            Operation::CheckExclude => {
                if labels.contains(member) {
                    return Err(self.rejected(member));
                }
            }
        }
        Ok(())
    }

    fn rejected(self, member: &str) -> PolicyError {
        PolicyError::Rejected {
            operation: self,
            member: member.to_string(),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    /// Parses the exact upper-case wire names only
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADD" => Ok(Operation::Add),
            "REMOVE" => Ok(Operation::Remove),
            "CHECK_INCLUDE" => Ok(Operation::CheckInclude),
            "CHECK_EXCLUDE" => Ok(Operation::CheckExclude),
            _ => Err(format!("unknown operation: {}", s)),
        }
    }
}

/// A single configured action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyAction {
    pub phase: Phase,
    pub operation: Operation,
    pub member: String,
}

impl PolicyAction {
    pub fn new(phase: Phase, operation: Operation, member: impl Into<String>) -> Self {
        Self {
            phase,
            operation,
            member: member.into(),
        }
    }
}

impl fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}({})", self.phase, self.operation, self.member)
    }
}

/// Ordered, immutable list of policy actions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Policy {
    actions: Vec<PolicyAction>,
}

impl Policy {
    pub fn new(actions: Vec<PolicyAction>) -> Self {
        Self { actions }
    }

    pub fn actions(&self) -> &[PolicyAction] {
        &self.actions
    }

    /// Actions applying to `phase`, in configured order
    pub fn actions_for(&self, phase: Phase) -> impl Iterator<Item = &PolicyAction> {
        self.actions.iter().filter(move |action| action.phase == phase)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl FromIterator<PolicyAction> for Policy {
    fn from_iter<I: IntoIterator<Item = PolicyAction>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
