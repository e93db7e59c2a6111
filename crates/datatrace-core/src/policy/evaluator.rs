//! Policy evaluator - applies a policy and overrides to a label payload
//!
//! The evaluator:
//! 1. Parses the label text into a label set
//! 2. Applies the configured actions for the current phase, in order
//! 3. Applies any override actions, regardless of phase
//! 4. Serializes the resulting set
//!
//! The first failed check aborts the evaluation and the working set is
//! discarded. Evaluation does no I/O and takes no locks.

use super::overrides::{parse_overrides, OverrideMode};
use super::{Phase, Policy, PolicyError};
use crate::labels::{LabelSet, DELIMITER};
use tracing::trace;

/// Result of a successful evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    /// Serialized label set
    pub labels: String,
    /// Configured actions applied
    pub policy_actions: usize,
    /// Override actions applied
    pub override_actions: usize,
    /// Override tokens dropped as malformed
    pub dropped_overrides: usize,
}

/// Evaluates label payloads against an immutable policy
#[derive(Debug, Clone, Default)]
pub struct PolicyEvaluator {
    policy: Policy,
    override_mode: OverrideMode,
}

impl PolicyEvaluator {
    pub fn new(policy: Policy) -> Self {
        Self {
            policy,
            override_mode: OverrideMode::default(),
        }
    }

    /// Builder: set how malformed override tokens are handled
    pub fn with_override_mode(mut self, mode: OverrideMode) -> Self {
        self.override_mode = mode;
        self
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn override_mode(&self) -> OverrideMode {
        self.override_mode
    }

    /// Evaluate `labels` for `phase`, then apply `overrides` if given
    pub fn evaluate(
        &self,
        labels: &str,
        phase: Phase,
        overrides: Option<&str>,
    ) -> Result<Evaluation, PolicyError> {
        let mut set = LabelSet::parse(labels, DELIMITER);
        let mut policy_actions = 0;

        for action in self.policy.actions_for(phase) {
            trace!(phase = %phase, action = %action, "Applying policy action");
            action.operation.apply(&mut set, &action.member)?;
            policy_actions += 1;
        }

        let mut override_actions = 0;
        let mut dropped_overrides = 0;
        if let Some(text) = overrides {
            let parsed = parse_overrides(text, self.override_mode)?;
            dropped_overrides = parsed.dropped;
            for (operation, member) in &parsed.actions {
                trace!(operation = %operation, member = member.as_str(), "Applying override");
                operation.apply(&mut set, member)?;
                override_actions += 1;
            }
        }

        Ok(Evaluation {
            labels: set.serialize(),
            policy_actions,
            override_actions,
            dropped_overrides,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::NO_DATA;
    use crate::policy::{Operation, PolicyAction};

    fn evaluator(actions: Vec<PolicyAction>) -> PolicyEvaluator {
        PolicyEvaluator::new(Policy::new(actions))
    }

    #[test]
    fn test_empty_policy_normalizes() {
        let result = evaluator(vec![]).evaluate("b;a;a;", Phase::Inbound, None).unwrap();
        assert_eq!(result.labels, "a;b");
        assert_eq!(result.policy_actions, 0);

        let result = evaluator(vec![]).evaluate("", Phase::Inbound, None).unwrap();
        assert_eq!(result.labels, NO_DATA);
    }

    #[test]
    fn test_phase_filter() {
        let eval = evaluator(vec![
            PolicyAction::new(Phase::Inbound, Operation::Add, "in"),
            PolicyAction::new(Phase::Outbound, Operation::Add, "out"),
        ]);

        let inbound = eval.evaluate(NO_DATA, Phase::Inbound, None).unwrap();
        assert_eq!(inbound.labels, "in");
        assert_eq!(inbound.policy_actions, 1);

        let outbound = eval.evaluate(NO_DATA, Phase::Outbound, None).unwrap();
        assert_eq!(outbound.labels, "out");
    }

    #[test]
    fn test_configured_order_is_authoritative() {
        // ADD then CHECK_INCLUDE passes; the reverse order rejects.
        let add_then_check = evaluator(vec![
            PolicyAction::new(Phase::Inbound, Operation::Add, "pii"),
            PolicyAction::new(Phase::Inbound, Operation::CheckInclude, "pii"),
        ]);
        assert!(add_then_check.evaluate("", Phase::Inbound, None).is_ok());

        let check_then_add = evaluator(vec![
            PolicyAction::new(Phase::Inbound, Operation::CheckInclude, "pii"),
            PolicyAction::new(Phase::Inbound, Operation::Add, "pii"),
        ]);
        assert!(check_then_add.evaluate("", Phase::Inbound, None).is_err());
    }

    #[test]
    fn test_check_exclude_rejects() {
        let eval = evaluator(vec![PolicyAction::new(
            Phase::Inbound,
            Operation::CheckExclude,
            "blocked",
        )]);
        let err = eval.evaluate("blocked;ok", Phase::Inbound, None).unwrap_err();
        assert_eq!(
            err,
            PolicyError::Rejected {
                operation: Operation::CheckExclude,
                member: "blocked".to_string(),
            }
        );
        assert!(eval.evaluate("ok", Phase::Inbound, None).is_ok());
        // Checks for the other phase never fire.
        assert!(eval.evaluate("blocked", Phase::Outbound, None).is_ok());
    }

    #[test]
    fn test_overrides_apply_after_policy_without_phase_filter() {
        let eval = evaluator(vec![PolicyAction::new(
            Phase::Outbound,
            Operation::Add,
            "policy",
        )]);
        let result = eval
            .evaluate("base", Phase::Inbound, Some("ADD(extra);REMOVE(base)"))
            .unwrap();
        assert_eq!(result.labels, "extra");
        assert_eq!(result.policy_actions, 0);
        assert_eq!(result.override_actions, 2);
    }

    #[test]
    fn test_override_check_rejects() {
        let eval = evaluator(vec![PolicyAction::new(
            Phase::Inbound,
            Operation::Add,
            "pii",
        )]);
        let err = eval
            .evaluate("", Phase::Inbound, Some("CHECK_EXCLUDE(pii)"))
            .unwrap_err();
        assert!(matches!(err, PolicyError::Rejected { .. }));
    }

    #[test]
    fn test_override_mode() {
        let lenient = evaluator(vec![]);
        let result = lenient
            .evaluate("a", Phase::Inbound, Some("BOGUS(x);ADD(b)"))
            .unwrap();
        assert_eq!(result.labels, "a;b");
        assert_eq!(result.dropped_overrides, 1);

        let strict = evaluator(vec![]).with_override_mode(OverrideMode::Reject);
        let err = strict
            .evaluate("a", Phase::Inbound, Some("BOGUS(x);ADD(b)"))
            .unwrap_err();
        assert!(matches!(err, PolicyError::MalformedOverride { .. }));
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let eval = evaluator(vec![
            PolicyAction::new(Phase::Inbound, Operation::Add, "x"),
            PolicyAction::new(Phase::Inbound, Operation::Remove, "y"),
        ]);
        let first = eval.evaluate("y;z", Phase::Inbound, Some("ADD(w)"));
        for _ in 0..10 {
            assert_eq!(eval.evaluate("y;z", Phase::Inbound, Some("ADD(w)")), first);
        }
    }
}
