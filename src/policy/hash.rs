//! Rule fingerprints for deduplication.

use md5::{Digest, Md5};

use super::RawRule;
use crate::conditions::Node;

/// Canonical text of a rule.
///
/// Built from the authored fields and the tree's canonical string, so two
/// rules that differ only in AND / OR child order render identically. Each
/// field has `\` and `|` escaped before joining, so a separator inside a
/// value cannot shift it into the next field.
pub fn rule_canonical_string(rule: &RawRule, conditions: Option<&Node>) -> String {
    let tree = conditions.map(ToString::to_string).unwrap_or_default();
    [
        rule.sender.name.as_str(),
        rule.sender.kind.as_str(),
        rule.receiver.name.as_str(),
        rule.receiver.kind.as_str(),
        rule.resource.kind.as_str(),
        rule.resource.name.as_str(),
        rule.operation.as_str(),
        rule.protocol.as_str(),
        rule.decision.as_str(),
        tree.as_str(),
    ]
    .iter()
    .map(|field| escape_field(field))
    .collect::<Vec<_>>()
    .join("|")
}

fn escape_field(field: &str) -> String {
    field.replace('\\', "\\\\").replace('|', "\\|")
}

/// Compute the rule hash (MD5 of the canonical text).
pub fn rule_md5_hash(rule: &RawRule, conditions: Option<&Node>) -> String {
    let mut hasher = Md5::new();
    hasher.update(rule_canonical_string(rule, conditions).as_bytes());
    format!("{:x}", hasher.finalize())
}
