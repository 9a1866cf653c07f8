//! In-process evaluation of conditions trees.
//!
//! Evaluation never fails. Anything that cannot be read (a missing body, a
//! JSONPath without results, a label that is not set) counts as absent:
//! `NEX` is true for absent values, every other method is false.

use std::collections::BTreeMap;

use serde_json::Value;
use serde_json_path::JsonPath;

use super::condition::{
    Attribute, AttributeKind, AttributeValue, Derived, JsonQuery, JsonTarget, Method,
};
use super::units;
use super::{Condition, Node, Quantifier};
use crate::message::Message;

/// Values projected from matched quantifier elements, by name.
pub type ExtraData = BTreeMap<String, Value>;

/// The element a relative JSONPath is evaluated against.
#[derive(Debug, Clone, Copy)]
pub enum Scope<'a> {
    /// An array element, or one of several matched nodes. `$VALUE` is the
    /// element itself and `$KEY` is absent.
    Element(&'a Value),
    /// An object entry, exposed as `$KEY` / `$VALUE`.
    Entry { key: &'a str, value: &'a Value },
}

impl<'a> Scope<'a> {
    fn value(&self) -> &'a Value {
        match *self {
            Scope::Element(value) => value,
            Scope::Entry { value, .. } => value,
        }
    }
}

/// Everything an evaluation can read: the message and the current scope.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub message: &'a Message,
    pub scope: Option<Scope<'a>>,
}

impl<'a> EvalContext<'a> {
    pub fn new(message: &'a Message) -> Self {
        Self {
            message,
            scope: None,
        }
    }

    /// A context for evaluating inside a quantifier element.
    pub fn with_scope(&self, scope: Scope<'a>) -> Self {
        Self {
            message: self.message,
            scope: Some(scope),
        }
    }
}

impl Node {
    /// Evaluate against a message, ignoring projections.
    pub fn matches(&self, message: &Message) -> bool {
        self.eval(&EvalContext::new(message)).0
    }

    /// Evaluate, returning the result and any values projected by ANY / ALL.
    pub fn eval(&self, ctx: &EvalContext<'_>) -> (bool, Vec<ExtraData>) {
        match self {
            Node::And(children) => {
                let mut extra = Vec::new();
                for child in children {
                    let (ok, data) = child.eval(ctx);
                    if !ok {
                        return (false, Vec::new());
                    }
                    extra.extend(data);
                }
                (true, extra)
            }
            // Every child is evaluated so each matching branch can project.
            Node::Or(children) => {
                let mut any = false;
                let mut extra = Vec::new();
                for child in children {
                    let (ok, data) = child.eval(ctx);
                    if ok {
                        any = true;
                        extra.extend(data);
                    }
                }
                (any, extra)
            }
            Node::Not(child) => (!child.eval(ctx).0, Vec::new()),
            Node::Any(q) => eval_any(q, ctx),
            Node::All(q) => eval_all(q, ctx),
            Node::Condition(c) => (c.eval(ctx), Vec::new()),
            Node::True => (true, Vec::new()),
            Node::False => (false, Vec::new()),
        }
    }
}

fn eval_any(q: &Quantifier, ctx: &EvalContext<'_>) -> (bool, Vec<ExtraData>) {
    let projecting = !q.projections().is_empty();
    let mut found = false;
    let mut extra = Vec::new();
    for scope in elements(q, ctx) {
        let inner = ctx.with_scope(scope);
        let (ok, data) = q.child.eval(&inner);
        if !ok {
            continue;
        }
        found = true;
        if !projecting {
            return (true, data);
        }
        extra.push(project(q, scope));
        extra.extend(data);
    }
    (found, extra)
}

fn eval_all(q: &Quantifier, ctx: &EvalContext<'_>) -> (bool, Vec<ExtraData>) {
    let scopes = elements(q, ctx);
    if scopes.is_empty() {
        return (false, Vec::new());
    }
    let projecting = !q.projections().is_empty();
    let mut extra = Vec::new();
    for scope in scopes {
        let (ok, data) = q.child.eval(&ctx.with_scope(scope));
        if !ok {
            return (false, Vec::new());
        }
        if projecting {
            extra.push(project(q, scope));
        }
        extra.extend(data);
    }
    (true, extra)
}

/// The elements a quantifier ranges over.
///
/// A single array yields its items and a single object its entries. Several
/// matched nodes are the elements themselves. A scalar or no match yields
/// nothing.
fn elements<'a>(q: &Quantifier, ctx: &EvalContext<'a>) -> Vec<Scope<'a>> {
    let Some((query, relative)) = q.parent() else {
        return Vec::new();
    };
    let nodes = select(query, relative, ctx);
    if nodes.len() == 1 {
        let node: &'a Value = nodes[0];
        return match node {
            Value::Array(items) => items.iter().map(Scope::Element).collect(),
            Value::Object(map) => map
                .iter()
                .map(|(key, value)| Scope::Entry {
                    key: key.as_str(),
                    value,
                })
                .collect(),
            _ => Vec::new(),
        };
    }
    nodes.into_iter().map(Scope::Element).collect()
}

fn project(q: &Quantifier, scope: Scope<'_>) -> ExtraData {
    q.projections()
        .iter()
        .map(|(name, query)| {
            let nodes = select_in_scope(query, scope);
            let value = match nodes.as_slice() {
                [] => match (&query.target, scope) {
                    (JsonTarget::Key, Scope::Entry { key, .. }) => Value::String(key.to_string()),
                    _ => Value::Null,
                },
                [single] => (*single).clone(),
                many => Value::Array(many.iter().map(|v| (*v).clone()).collect()),
            };
            (name.clone(), value)
        })
        .collect()
}

fn run<'v>(path: &JsonPath, value: &'v Value) -> Vec<&'v Value> {
    path.query(value).all()
}

/// Nodes selected by a query. `$KEY` never selects nodes.
fn select<'a>(query: &JsonQuery, relative: bool, ctx: &EvalContext<'a>) -> Vec<&'a Value> {
    if relative {
        return match ctx.scope {
            Some(scope) => select_in_scope(query, scope),
            None => Vec::new(),
        };
    }
    match (&query.target, ctx.message.json_document()) {
        (JsonTarget::Path(path), Some(doc)) => run(path, doc),
        _ => Vec::new(),
    }
}

fn select_in_scope<'a>(query: &JsonQuery, scope: Scope<'a>) -> Vec<&'a Value> {
    match &query.target {
        JsonTarget::Path(path) => run(path, scope.value()),
        JsonTarget::Key => Vec::new(),
        JsonTarget::Value(None) => vec![scope.value()],
        JsonTarget::Value(Some(path)) => run(path, scope.value()),
    }
}

/// Text of a JSONPath result, or `None` when it counts as absent.
fn extract_text(query: &JsonQuery, relative: bool, ctx: &EvalContext<'_>) -> Option<String> {
    if let (JsonTarget::Key, Some(Scope::Entry { key, .. })) = (&query.target, ctx.scope) {
        return Some(key.to_string());
    }
    let nodes = select(query, relative, ctx);
    let text = match nodes.as_slice() {
        [] => return None,
        [Value::String(s)] => s.clone(),
        [single] => units::strip_quotes(&single.to_string()).to_string(),
        many => Value::Array(many.iter().map(|v| (*v).clone()).collect()).to_string(),
    };
    if text.is_empty() || text == "[]" {
        None
    } else {
        Some(text)
    }
}

impl Condition {
    /// Evaluate this condition. Unprepared conditions are false.
    pub fn eval(&self, ctx: &EvalContext<'_>) -> bool {
        let Some(derived) = self.derived() else {
            log::debug!("Condition {} evaluated before preparation", self);
            return false;
        };
        match &derived.kind {
            AttributeKind::Plain(attribute) => eval_plain(*attribute, derived, ctx.message),
            AttributeKind::Label(side, key) => {
                let labels = &ctx.message.endpoint(*side).labels;
                compare_text(derived, labels.get(key).map(String::as_str))
            }
            AttributeKind::Object(side, field) => {
                compare_text(derived, ctx.message.endpoint(*side).field(field).as_deref())
            }
            AttributeKind::JsonPathAbsolute(query) => {
                compare_json(derived, extract_text(query, false, ctx))
            }
            AttributeKind::JsonPathRelative(query) => {
                compare_json(derived, extract_text(query, true, ctx))
            }
        }
    }
}

fn eval_plain(attribute: Attribute, d: &Derived, message: &Message) -> bool {
    match attribute.read(message) {
        AttributeValue::Text(text) => compare_text(d, text),
        AttributeValue::Integer(value) => match (d.method, value, d.int) {
            (Method::Ex, v, _) => v.is_some(),
            (Method::Nex, v, _) => v.is_none(),
            (_, None, _) => false,
            (m, Some(actual), Some(expected)) if m.is_numeric() => m.compare(actual, expected),
            (_, Some(actual), _) => compare_text(d, Some(&actual.to_string())),
        },
        AttributeValue::Float(value) => match (d.method, value, d.float) {
            (Method::Ex, v, _) => v.is_some(),
            (Method::Nex, v, _) => v.is_none(),
            (m, Some(actual), Some(expected)) => m.compare(actual, expected),
            _ => false,
        },
    }
}

/// String semantics shared by every attribute kind.
fn compare_text(d: &Derived, actual: Option<&str>) -> bool {
    let Some(actual) = actual else {
        return d.method == Method::Nex;
    };
    match d.method {
        Method::Ex => true,
        Method::Nex => false,
        Method::Eq => text_equals(d, actual),
        Method::Neq => !text_equals(d, actual),
        Method::Re | Method::In => d.regex.as_ref().is_some_and(|re| re.is_match(actual)),
        Method::Nre | Method::Nin => d.regex.as_ref().is_some_and(|re| !re.is_match(actual)),
        m => match (units::parse_with_units(actual), d.float) {
            (Some(a), Some(e)) => m.compare(a, e),
            _ => false,
        },
    }
}

fn text_equals(d: &Derived, actual: &str) -> bool {
    match &d.wildcard {
        Some(re) => re.is_match(actual),
        None => actual == d.value,
    }
}

/// JSON values compare numerically (with unit suffixes) when both sides
/// parse, and as text otherwise.
fn compare_json(d: &Derived, actual: Option<String>) -> bool {
    let Some(actual) = actual else {
        return d.method == Method::Nex;
    };
    if matches!(d.method, Method::Eq | Method::Neq) && d.wildcard.is_none() {
        if let (Some(a), Some(e)) = (units::parse_with_units(&actual), d.float) {
            return d.method.compare(a, e);
        }
    }
    compare_text(d, Some(&actual))
}
