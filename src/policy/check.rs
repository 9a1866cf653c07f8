//! Decision resolution across a rule set.

use rayon::prelude::*;
use serde::Serialize;

use super::{Decision, PreparedRule};
use crate::config::EngineConfig;
use crate::message::Message;

/// The result of checking a message against a rule set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckOutcome {
    /// Highest decision of any rule.
    pub decision: Decision,

    /// Display string of `decision`.
    pub decision_label: &'static str,

    /// Lowest index that produced `decision`; `None` if no rule applied.
    pub rule_index: Option<usize>,

    /// Per-rule decisions, indexed like the rule set.
    pub results: Vec<Decision>,

    /// Every index whose decision is above `Default`.
    pub applied: Vec<usize>,
}

impl CheckOutcome {
    /// Resolve per-rule results into an outcome.
    pub fn from_results(results: Vec<Decision>) -> Self {
        let mut decision = Decision::Default;
        let mut rule_index = None;
        let mut applied = Vec::new();
        for (i, result) in results.iter().enumerate() {
            if *result > Decision::Default {
                applied.push(i);
            }
            if *result > decision {
                decision = *result;
                rule_index = Some(i);
            }
        }
        Self {
            decision,
            decision_label: decision.as_str(),
            rule_index,
            results,
            applied,
        }
    }
}

/// Check with default settings.
pub fn check(message: &Message, rules: &[PreparedRule]) -> CheckOutcome {
    check_with_config(message, rules, &EngineConfig::default())
}

/// Evaluate every rule and resolve the outcome.
///
/// All rules are evaluated even once a BLOCK is seen, so `applied` is
/// complete. Large rule sets are evaluated on the rayon pool; the outcome is
/// the same either way.
pub fn check_with_config(
    message: &Message,
    rules: &[PreparedRule],
    config: &EngineConfig,
) -> CheckOutcome {
    let mut results = Vec::with_capacity(rules.len());
    if config.use_parallel(rules.len()) {
        rules
            .par_iter()
            .map(|rule| rule.evaluate(message))
            .collect_into_vec(&mut results);
    } else {
        results.extend(rules.iter().map(|rule| rule.evaluate(message)));
    }

    let outcome = CheckOutcome::from_results(results);
    log::debug!(
        "Checked {} rules: {} (rule {:?}, {} applied)",
        rules.len(),
        outcome.decision_label,
        outcome.rule_index,
        outcome.applied.len()
    );
    outcome
}
