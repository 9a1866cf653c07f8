//! Conditions trees.
//!
//! A rule may carry a boolean tree of leaf conditions, combined with
//! AND / OR / NOT and quantified over JSON arrays with ANY / ALL:
//!
//! ```yaml
//! conditions:
//!   AND:
//!     - attribute: senderLabel[app]
//!       method: EQ
//!       value: web
//!     - ANY:
//!         parentJsonpathAttribute: jsonpath:$.items
//!         condition:
//!           attribute: jsonpath:$RELATIVE.price
//!           method: GT
//!           value: "100"
//! ```
//!
//! Trees are parsed by [`parse_conditions_tree`], prepared once with
//! [`Node::prepare_and_validate`], evaluated in process by [`Node::eval`]
//! and compiled for MongoDB by [`Node::to_mongo_query`].

pub mod condition;
pub mod eval;
pub mod mongo;
pub mod parser;
pub mod units;

use std::collections::BTreeMap;
use std::fmt;

pub use condition::{Attribute, AttributeKind, Condition, JsonQuery, JsonTarget, Method};
pub use eval::{EvalContext, ExtraData, Scope};
pub use mongo::MongoQuery;
pub use parser::{parse_conditions_tree, parse_conditions_tree_with_depth};

use crate::error::{PolicyError, Result};
use crate::predefined::PredefinedStringsAndLists;
use condition::JSONPATH_PREFIX;

/// An ANY / ALL quantifier.
#[derive(Debug, Clone)]
pub struct Quantifier {
    /// Authored `parentJsonpathAttribute`.
    pub parent_attribute: String,
    /// Authored `returnValueJsonpath` entries, name to `jsonpath:$RELATIVE...`.
    pub return_values: BTreeMap<String, String>,
    pub child: Box<Node>,
    parent: Option<(JsonQuery, bool)>,
    projections: BTreeMap<String, JsonQuery>,
}

impl Quantifier {
    pub fn new(parent_attribute: impl Into<String>, child: Node) -> Self {
        Self {
            parent_attribute: parent_attribute.into(),
            return_values: BTreeMap::new(),
            child: Box::new(child),
            parent: None,
            projections: BTreeMap::new(),
        }
    }

    /// Builder: add a projected value returned for matched elements.
    pub fn with_return_value(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.return_values.insert(name.into(), path.into());
        self
    }

    /// Prepared parent query and whether it is relative to an outer scope.
    pub fn parent(&self) -> Option<(&JsonQuery, bool)> {
        self.parent.as_ref().map(|(q, relative)| (q, *relative))
    }

    pub fn projections(&self) -> &BTreeMap<String, JsonQuery> {
        &self.projections
    }

    fn prepare_and_validate(&mut self, predefined: &PredefinedStringsAndLists) -> Result<()> {
        if self.parent.is_none() {
            let expr = self
                .parent_attribute
                .trim()
                .strip_prefix(JSONPATH_PREFIX)
                .ok_or_else(|| {
                    PolicyError::invalid(format!(
                        "parentJsonpathAttribute '{}' must start with '{}'",
                        self.parent_attribute, JSONPATH_PREFIX
                    ))
                })?;
            let (query, relative) = JsonQuery::parse(expr)?;
            if matches!(query.target, JsonTarget::Key) {
                return Err(PolicyError::invalid(
                    "parentJsonpathAttribute cannot be $KEY",
                ));
            }
            self.parent = Some((query, relative));

            let mut projections = BTreeMap::new();
            for (name, path) in &self.return_values {
                let expr = path
                    .trim()
                    .strip_prefix(JSONPATH_PREFIX)
                    .filter(|s| s.starts_with(condition::RELATIVE_MARKER))
                    .ok_or_else(|| {
                        PolicyError::invalid(format!(
                            "returnValueJsonpath '{}' must start with 'jsonpath:$RELATIVE'",
                            name
                        ))
                    })?;
                let (query, _) = JsonQuery::parse(expr)?;
                projections.insert(name.clone(), query);
            }
            self.projections = projections;
        }
        self.child.prepare_and_validate(predefined)
    }
}

/// A node of a conditions tree.
#[derive(Debug, Clone)]
pub enum Node {
    And(Vec<Node>),
    Or(Vec<Node>),
    Not(Box<Node>),
    Any(Quantifier),
    All(Quantifier),
    Condition(Condition),
    True,
    False,
}

impl Node {
    pub fn name(&self) -> &'static str {
        match self {
            Node::And(_) => "AND",
            Node::Or(_) => "OR",
            Node::Not(_) => "NOT",
            Node::Any(_) => "ANY",
            Node::All(_) => "ALL",
            Node::Condition(_) => "CONDITION",
            Node::True => "TRUE",
            Node::False => "FALSE",
        }
    }

    /// Add a child to an AND / OR node.
    ///
    /// NOT and the quantifiers take their single child at construction.
    pub fn append(&mut self, child: Node) -> Result<()> {
        match self {
            Node::And(children) | Node::Or(children) => {
                children.push(child);
                Ok(())
            }
            other => Err(PolicyError::document(format!(
                "cannot append a child to {}",
                other.name()
            ))),
        }
    }

    /// Resolve references, validate and compile every condition in the tree.
    ///
    /// Idempotent: already prepared conditions are left alone.
    pub fn prepare_and_validate(&mut self, predefined: &PredefinedStringsAndLists) -> Result<()> {
        let name = self.name();
        match self {
            Node::And(children) | Node::Or(children) => {
                if children.is_empty() {
                    return Err(PolicyError::document(format!("{} without children", name)));
                }
                for child in children.iter_mut() {
                    child.prepare_and_validate(predefined)?;
                }
                Ok(())
            }
            Node::Not(child) => child.prepare_and_validate(predefined),
            Node::Any(q) | Node::All(q) => q.prepare_and_validate(predefined),
            Node::Condition(c) => c.prepare_and_validate(predefined),
            Node::True | Node::False => Ok(()),
        }
    }

    /// Number of nodes on the longest root-to-leaf path.
    pub fn depth(&self) -> usize {
        match self {
            Node::And(children) | Node::Or(children) => {
                1 + children.iter().map(Node::depth).max().unwrap_or(0)
            }
            Node::Not(child) => 1 + child.depth(),
            Node::Any(q) | Node::All(q) => 1 + q.child.depth(),
            _ => 1,
        }
    }

    /// Visit every leaf condition.
    pub fn conditions(&self) -> Vec<&Condition> {
        let mut out = Vec::new();
        self.collect_conditions(&mut out);
        out
    }

    fn collect_conditions<'a>(&'a self, out: &mut Vec<&'a Condition>) {
        match self {
            Node::And(children) | Node::Or(children) => {
                children.iter().for_each(|c| c.collect_conditions(out))
            }
            Node::Not(child) => child.collect_conditions(out),
            Node::Any(q) | Node::All(q) => q.child.collect_conditions(out),
            Node::Condition(c) => out.push(c),
            Node::True | Node::False => {}
        }
    }
}

impl fmt::Display for Node {
    /// Canonical text of the tree.
    ///
    /// AND / OR children are sorted, so reordering them does not change the
    /// text. Conditions render their authored attribute, method and value.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::And(children) | Node::Or(children) => {
                let separator = if matches!(self, Node::And(_)) { "&&" } else { "||" };
                let mut parts: Vec<String> = children.iter().map(ToString::to_string).collect();
                parts.sort();
                write!(f, "({})", parts.join(separator))
            }
            Node::Not(child) => write!(f, "!({})", child),
            Node::Any(q) | Node::All(q) => {
                let projections: Vec<String> = q
                    .return_values
                    .iter()
                    .map(|(name, path)| format!("{}={}", name, path))
                    .collect();
                write!(
                    f,
                    "[{}<{};{}>:{}]",
                    self.name(),
                    q.parent_attribute,
                    projections.join(","),
                    q.child
                )
            }
            Node::Condition(c) => write!(f, "{}", c),
            Node::True => f.write_str("true"),
            Node::False => f.write_str("false"),
        }
    }
}
