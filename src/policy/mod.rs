//! # Policy Rules
//!
//! Rule-level matching and decisions.
//!
//! A rule names who may talk to whom (sender / receiver), over what
//! (protocol, resource, operation), under which extra conditions, and what
//! happens when it applies:
//!
//! ```yaml
//! rules:
//!   - rule_id: block-admin-from-outside
//!     sender: {senderName: "0.0.0.0/0", senderType: subnet}
//!     receiver: {receiverName: admin-*, receiverType: workload}
//!     protocol: http
//!     resource: {resourceType: path, resourceName: /admin/*}
//!     operation: "*"
//!     decision: block
//! ```
//!
//! Rules are authored as [`RawRule`] and become evaluable only through
//! [`RawRule::prepare`], which compiles every matcher and the conditions
//! tree once and caches the rule hash.
//!
//! ## Decisions
//!
//! Each rule yields one [`Decision`]. Across a rule set the highest one
//! wins, see [`check`]:
//!
//! ```text
//! DEFAULT < ALLOW < ALERT < BLOCK
//! ```

pub mod check;
pub mod hash;
pub mod matcher;

use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use check::{check, check_with_config, CheckOutcome};
pub use hash::{rule_canonical_string, rule_md5_hash};
pub use matcher::{EndpointKind, EndpointMatcher, EndpointRule, ResourceMatcher};

use crate::conditions::{parse_conditions_tree_with_depth, MongoQuery, Node};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::message::Message;
use crate::predefined::PredefinedStringsAndLists;

// ============================================================================
// Decision
// ============================================================================

/// Outcome of one rule, or of a whole check. Ordered by precedence.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    /// No rule authorized the request.
    #[default]
    Default = 0,
    Allow = 1,
    Alert = 2,
    Block = 3,
}

impl Decision {
    /// Map a rule's decision string, case-insensitively.
    ///
    /// Anything other than allow / alert / block is `Default`.
    pub fn from_rule(decision: &str) -> Self {
        match decision.trim().to_lowercase().as_str() {
            "allow" => Decision::Allow,
            "alert" => Decision::Alert,
            "block" => Decision::Block,
            _ => Decision::Default,
        }
    }

    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Default => "DEFAULT",
            Decision::Allow => "ALLOW",
            Decision::Alert => "ALERT",
            Decision::Block => "BLOCK",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// RawRule
// ============================================================================

/// Sender clause.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SenderSpec {
    #[serde(rename = "senderName", default)]
    pub name: String,
    #[serde(rename = "senderType", default)]
    pub kind: String,
}

/// Receiver clause.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReceiverSpec {
    #[serde(rename = "receiverName", default)]
    pub name: String,
    #[serde(rename = "receiverType", default)]
    pub kind: String,
}

/// Resource clause.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(rename = "resourceType", default)]
    pub kind: String,
    #[serde(rename = "resourceName", default)]
    pub name: String,
}

/// A rule as written in a rules document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRule {
    #[serde(default)]
    pub rule_id: String,

    #[serde(default)]
    pub sender: SenderSpec,

    #[serde(default)]
    pub receiver: ReceiverSpec,

    /// Protocol; empty or `*` matches any.
    #[serde(default)]
    pub protocol: String,

    #[serde(default)]
    pub resource: ResourceSpec,

    /// Request method wildcard(s); empty or `*` matches any.
    #[serde(default)]
    pub operation: String,

    /// Conditions tree, untyped until prepared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Value>,

    /// `allow`, `alert` or `block`.
    #[serde(default)]
    pub decision: String,

    /// Free-form, carried through untouched.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl RawRule {
    /// Prepare with default settings.
    pub fn prepare(self, predefined: &PredefinedStringsAndLists) -> Result<PreparedRule> {
        self.prepare_with_config(predefined, &EngineConfig::default())
    }

    /// Compile matchers and the conditions tree.
    ///
    /// Any failure is reported against this rule's id.
    pub fn prepare_with_config(
        self,
        predefined: &PredefinedStringsAndLists,
        config: &EngineConfig,
    ) -> Result<PreparedRule> {
        let rule_id = self.rule_id.clone();
        PreparedRule::build(self, predefined, config).map_err(|e| {
            log::debug!("Rejecting rule '{}': {}", rule_id, e);
            e.in_rule(&rule_id)
        })
    }
}

// ============================================================================
// PreparedRule
// ============================================================================

/// A rule with every matcher compiled. Only obtainable via [`RawRule::prepare`].
#[derive(Debug, Clone)]
pub struct PreparedRule {
    raw: RawRule,
    sender: EndpointRule,
    receiver: EndpointRule,
    resource: ResourceMatcher,
    operation: Option<Regex>,
    conditions: Option<Node>,
    decision: Decision,
    hash: String,
}

impl PreparedRule {
    fn build(
        raw: RawRule,
        predefined: &PredefinedStringsAndLists,
        config: &EngineConfig,
    ) -> Result<Self> {
        let sender = EndpointRule::build(&raw.sender.kind, &raw.sender.name, predefined)?;
        let receiver = EndpointRule::build(&raw.receiver.kind, &raw.receiver.name, predefined)?;
        let resource = ResourceMatcher::build(&raw.protocol, &raw.resource.kind, &raw.resource.name)?;
        let operation = matcher::operation_regex(&raw.operation)?;

        let conditions = match &raw.conditions {
            None | Some(Value::Null) => None,
            Some(doc) => {
                let mut tree = parse_conditions_tree_with_depth(doc, config.max_tree_depth)?;
                tree.prepare_and_validate(predefined)?;
                Some(tree)
            }
        };

        let decision = Decision::from_rule(&raw.decision);
        if decision == Decision::Default {
            log::debug!(
                "Rule '{}' has decision '{}', which never raises the outcome",
                raw.rule_id,
                raw.decision
            );
        }
        let hash = hash::rule_md5_hash(&raw, conditions.as_ref());

        Ok(Self {
            raw,
            sender,
            receiver,
            resource,
            operation,
            conditions,
            decision,
            hash,
        })
    }

    pub fn rule_id(&self) -> &str {
        &self.raw.rule_id
    }

    pub fn raw(&self) -> &RawRule {
        &self.raw
    }

    /// Give the authored rule back, e.g. to edit and prepare it again.
    pub fn into_raw(self) -> RawRule {
        self.raw
    }

    pub fn decision(&self) -> Decision {
        self.decision
    }

    pub fn conditions(&self) -> Option<&Node> {
        self.conditions.as_ref()
    }

    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.raw.metadata
    }

    /// MD5 of the canonical rule text, computed at preparation.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// The canonical text the hash is computed from.
    pub fn canonical_string(&self) -> String {
        hash::rule_canonical_string(&self.raw, self.conditions.as_ref())
    }

    /// Evaluate against a message.
    ///
    /// Checks, in order and stopping at the first miss: sender, receiver,
    /// operation, resource / protocol, conditions. A miss is `Default`.
    pub fn evaluate(&self, message: &Message) -> Decision {
        if self.rule_matches(message) {
            self.decision
        } else {
            Decision::Default
        }
    }

    /// Check if the rule applies to a message
    fn rule_matches(&self, message: &Message) -> bool {
        // Check sender
        if !self.sender.matches(&message.sender) {
            return false;
        }

        // Check receiver
        if !self.receiver.matches(&message.receiver) {
            return false;
        }

        // Check operation
        if let Some(operation) = &self.operation {
            if !operation.is_match(&message.request.method) {
                return false;
            }
        }

        // Check resource and protocol
        if !self.resource.matches(message) {
            return false;
        }

        // Check conditions
        self.conditions
            .as_ref()
            .map_or(true, |tree| tree.matches(message))
    }

    /// Compile the conditions tree for MongoDB.
    ///
    /// A rule without conditions matches every document.
    pub fn to_mongo_query(&self, base_path: &str) -> Result<MongoQuery> {
        match &self.conditions {
            Some(tree) => tree
                .to_mongo(base_path)
                .map_err(|e| e.in_rule(&self.raw.rule_id)),
            None => Ok(MongoQuery::Simple(serde_json::json!({}))),
        }
    }
}
