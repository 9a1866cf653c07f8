//! MongoDB query compilation.
//!
//! A prepared tree over JSON document attributes compiles to a MongoDB
//! filter with the same truth value as in-process evaluation. Trees that
//! read `$KEY` / `$VALUE` also need an aggregation stage that turns the
//! quantified field into an array of `{k, v}` entries first.
//!
//! Constructs with no MongoDB equivalent are rejected with
//! [`PolicyError::Unsupported`] rather than compiled approximately.

use serde::Serialize;
use serde_json::{json, Map, Value};

use super::condition::{AttributeKind, Derived, JsonQuery, JsonTarget, Method, VALUE_MARKER};
use super::{Condition, Node, Quantifier};
use crate::error::{PolicyError, Result};

const ENTRY_KEY_FIELD: &str = "k";
const ENTRY_VALUE_FIELD: &str = "v";
const ENTRY_ARRAY_PREFIX: &str = "__entries_";

/// A compiled query: a plain filter, or an aggregation pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "query", rename_all = "lowercase")]
pub enum MongoQuery {
    Simple(Value),
    Aggregate(Vec<Value>),
}

impl MongoQuery {
    /// Combine a filter and the stages it depends on.
    pub fn from_parts(filter: Value, mut stages: Vec<Value>) -> Self {
        if stages.is_empty() {
            MongoQuery::Simple(filter)
        } else {
            stages.push(json!({ "$match": filter }));
            MongoQuery::Aggregate(stages)
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MongoQuery::Simple(_) => "simple",
            MongoQuery::Aggregate(_) => "aggregate",
        }
    }

    /// The filter or pipeline as a single JSON value.
    pub fn query(&self) -> Value {
        match self {
            MongoQuery::Simple(filter) => filter.clone(),
            MongoQuery::Aggregate(stages) => Value::Array(stages.clone()),
        }
    }
}

impl Node {
    /// Compile a prepared tree.
    ///
    /// `base_path` prefixes absolute paths (the field the JSON body is stored
    /// under, or empty). `parent_field_path` is the array field of the
    /// enclosing quantifier and `array_depth` the number of enclosing
    /// quantifiers; pass `""` and `0` at the root.
    ///
    /// Returns the filter and the aggregation stages it needs, if any.
    pub fn to_mongo_query(
        &self,
        base_path: &str,
        parent_field_path: &str,
        array_depth: usize,
    ) -> Result<(Value, Vec<Value>)> {
        let frame = Frame {
            field: parent_field_path,
            entries: false,
            depth: array_depth,
        };
        self.compile(base_path, &frame)
    }

    /// Compile from the root.
    pub fn to_mongo(&self, base_path: &str) -> Result<MongoQuery> {
        let (filter, stages) = self.to_mongo_query(base_path, "", 0)?;
        Ok(MongoQuery::from_parts(filter, stages))
    }

    fn compile(&self, base_path: &str, frame: &Frame<'_>) -> Result<(Value, Vec<Value>)> {
        match self {
            Node::And(children) | Node::Or(children) => {
                let combinator = if matches!(self, Node::And(_)) { "$and" } else { "$or" };
                let mut filters = Vec::with_capacity(children.len());
                let mut stages = Vec::new();
                for child in children {
                    let (filter, child_stages) = child.compile(base_path, frame)?;
                    filters.push(filter);
                    stages.extend(child_stages);
                }
                Ok((json!({ combinator: filters }), stages))
            }
            Node::Not(child) => {
                let (filter, stages) = child.compile(base_path, frame)?;
                Ok((json!({ "$nor": [filter] }), stages))
            }
            Node::Any(q) | Node::All(q) => compile_quantifier(self, q, base_path, frame),
            Node::Condition(c) => Ok((compile_condition(c, base_path, frame)?, Vec::new())),
            Node::True => Ok((json!({}), Vec::new())),
            Node::False => Ok((json!({ "$nor": [{}] }), Vec::new())),
        }
    }

    /// Whether conditions directly under this node (not inside a nested
    /// quantifier) read `$KEY` / `$VALUE`.
    fn reads_entries(&self) -> bool {
        match self {
            Node::And(children) | Node::Or(children) => children.iter().any(Node::reads_entries),
            Node::Not(child) => child.reads_entries(),
            Node::Condition(c) => {
                matches!(c.kind(), Some(AttributeKind::JsonPathRelative(q)) if q.is_entry())
            }
            _ => false,
        }
    }
}

/// The enclosing quantifier while compiling.
struct Frame<'a> {
    /// Array field the current elements come from.
    field: &'a str,
    /// Elements are `{k, v}` entries; relative paths read `v`.
    entries: bool,
    depth: usize,
}

impl Frame<'_> {
    /// Field path of a relative query inside this frame.
    fn relative(&self, path: &str) -> String {
        if self.entries {
            join(ENTRY_VALUE_FIELD, path)
        } else {
            path.to_string()
        }
    }
}

fn compile_quantifier(
    node: &Node,
    q: &Quantifier,
    base_path: &str,
    frame: &Frame<'_>,
) -> Result<(Value, Vec<Value>)> {
    let (query, relative) = q.parent().ok_or_else(|| {
        PolicyError::Unsupported(format!("{} was not prepared", q.parent_attribute))
    })?;
    let (prefix, path) = match (relative, frame.depth) {
        (false, 0) => (base_path.to_string(), dot_path(query)?),
        (false, _) => {
            return Err(PolicyError::Unsupported(format!(
                "absolute parent '{}' inside ANY/ALL",
                q.parent_attribute
            )))
        }
        (true, 0) => {
            return Err(PolicyError::Unsupported(format!(
                "relative parent '{}' outside ANY/ALL",
                q.parent_attribute
            )))
        }
        (true, _) if query.is_entry() => {
            return Err(PolicyError::Unsupported(format!(
                "quantifier over '{}'",
                query.text
            )))
        }
        (true, _) => (String::new(), frame.relative(&dot_path(query)?)),
    };
    let field = join(&prefix, &path);
    let mut guards = array_guards(&prefix, &path);

    let mut stages = Vec::new();
    let entries = q.child.reads_entries();
    let array_field = if entries {
        if frame.depth > 0 {
            return Err(PolicyError::Unsupported(format!(
                "nested $KEY/$VALUE under '{}'",
                frame.field
            )));
        }
        let name = format!("{}{}", ENTRY_ARRAY_PREFIX, field.replace('.', "_"));
        stages.push(json!({ "$addFields": { name.as_str(): entries_expression(&field) } }));
        name
    } else {
        field
    };

    let inner = Frame {
        field: &array_field,
        entries,
        depth: frame.depth + 1,
    };
    let (child, child_stages) = q.child.compile(base_path, &inner)?;
    stages.extend(child_stages);

    let filter = match node {
        Node::All(_) => json!({
            "$and": [
                { array_field.as_str(): { "$type": "array", "$ne": [] } },
                { "$nor": [{ array_field.as_str(): { "$elemMatch": { "$nor": [child] } } }] }
            ]
        }),
        _ => json!({ array_field.as_str(): { "$elemMatch": child } }),
    };
    if guards.is_empty() {
        Ok((filter, stages))
    } else {
        guards.push(filter);
        Ok((json!({ "$and": guards }), stages))
    }
}

/// Expression turning `field` into the array a `$KEY` / `$VALUE` quantifier
/// ranges over: `{k, v}` per object entry, `{v}` per array item (array
/// items have no key), and null for anything else.
fn entries_expression(field: &str) -> Value {
    let source = format!("${}", field);
    json!({
        "$switch": {
            "branches": [
                {
                    "case": { "$isArray": source },
                    "then": { "$map": { "input": source, "in": { ENTRY_VALUE_FIELD: "$$this" } } }
                },
                {
                    "case": { "$eq": [{ "$type": source }, "object"] },
                    "then": { "$objectToArray": source }
                }
            ],
            "default": null
        }
    })
}

fn compile_condition(c: &Condition, base_path: &str, frame: &Frame<'_>) -> Result<Value> {
    let d = c
        .derived()
        .ok_or_else(|| PolicyError::Unsupported(format!("condition {} was not prepared", c)))?;
    let (prefix, path) = match (&d.kind, frame.depth) {
        (AttributeKind::JsonPathAbsolute(query), 0) => (base_path.to_string(), dot_path(query)?),
        (AttributeKind::JsonPathAbsolute(_), _) => {
            return Err(PolicyError::Unsupported(format!(
                "absolute JSONPath '{}' inside ANY/ALL",
                c.attribute
            )))
        }
        (AttributeKind::JsonPathRelative(_), 0) => {
            return Err(PolicyError::Unsupported(format!(
                "relative JSONPath '{}' outside ANY/ALL",
                c.attribute
            )))
        }
        (AttributeKind::JsonPathRelative(query), _) => {
            let path = match &query.target {
                JsonTarget::Key if frame.entries => ENTRY_KEY_FIELD.to_string(),
                JsonTarget::Value(None) if frame.entries => ENTRY_VALUE_FIELD.to_string(),
                JsonTarget::Value(Some(_)) if frame.entries => {
                    let rest = query.text.trim_start_matches(VALUE_MARKER);
                    join(ENTRY_VALUE_FIELD, &segments(&format!("${}", rest), &query.text)?)
                }
                JsonTarget::Key | JsonTarget::Value(_) => {
                    return Err(PolicyError::Unsupported(format!(
                        "'{}' outside a $KEY/$VALUE quantifier",
                        c.attribute
                    )))
                }
                JsonTarget::Path(_) => frame.relative(&dot_path(query)?),
            };
            (String::new(), path)
        }
        _ => {
            return Err(PolicyError::Unsupported(format!(
                "attribute '{}' is not part of the JSON document",
                c.attribute
            )))
        }
    };

    let field = json!({ join(&prefix, &path): operator(d) });
    let mut guards = array_guards(&prefix, &path);
    if guards.is_empty() {
        return Ok(field);
    }
    // A guarded path is absent when a guard fails, which only NEX accepts.
    if d.method == Method::Nex {
        Ok(json!({ "$or": [{ "$nor": [{ "$and": guards }] }, field] }))
    } else {
        guards.push(field);
        Ok(json!({ "$and": guards }))
    }
}

/// JSONPath member access does not step into arrays the way MongoDB dotted
/// paths do, so every intermediate field of `path` must not be an array.
fn array_guards(prefix: &str, path: &str) -> Vec<Value> {
    let parts: Vec<&str> = path.split('.').collect();
    (1..parts.len())
        .map(|i| {
            let field = join(prefix, &parts[..i].join("."));
            json!({ field: { "$not": { "$type": "array" } } })
        })
        .collect()
}

/// The operator document for one field.
fn operator(d: &Derived) -> Value {
    let text = Value::String(d.value.clone());
    let number = d.float.and_then(number_value);
    match d.method {
        Method::Eq => match (&d.wildcard, number) {
            (Some(re), _) => json!({ "$regex": re.as_str() }),
            (None, Some(n)) => json!({ "$in": [n, text] }),
            (None, None) => json!({ "$eq": text }),
        },
        Method::Neq => match (&d.wildcard, number) {
            (Some(re), _) => json!({ "$exists": true, "$not": { "$regex": re.as_str() } }),
            (None, Some(n)) => json!({ "$exists": true, "$nin": [n, text] }),
            (None, None) => json!({ "$exists": true, "$ne": text }),
        },
        Method::Lt | Method::Le | Method::Gt | Method::Ge => {
            let key = match d.method {
                Method::Lt => "$lt",
                Method::Le => "$lte",
                Method::Gt => "$gt",
                _ => "$gte",
            };
            let mut op = Map::new();
            op.insert(key.to_string(), number.unwrap_or(Value::Null));
            Value::Object(op)
        }
        Method::Re => json!({ "$regex": d.value }),
        Method::Nre => json!({ "$exists": true, "$not": { "$regex": d.value } }),
        Method::In => json!({ "$in": in_values(&d.items) }),
        Method::Nin => json!({ "$exists": true, "$nin": in_values(&d.items) }),
        Method::Ex => json!({ "$exists": true }),
        Method::Nex => json!({ "$exists": false }),
    }
}

/// Items as strings, plus their numeric form where they parse.
fn in_values(items: &[String]) -> Vec<Value> {
    let mut values = Vec::with_capacity(items.len() * 2);
    for item in items {
        values.push(Value::String(item.clone()));
        if let Some(n) = item.trim().parse::<f64>().ok().and_then(number_value) {
            values.push(n);
        }
    }
    values
}

/// Integral floats become integers so `5` and `5.0` compare alike.
fn number_value(f: f64) -> Option<Value> {
    if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Some(json!(f as i64))
    } else {
        serde_json::Number::from_f64(f).map(Value::Number)
    }
}

fn dot_path(query: &JsonQuery) -> Result<String> {
    segments(&query.text, &query.text)
}

/// `$.a.b` to `a.b`; anything beyond plain member access is rejected.
fn segments(path: &str, original: &str) -> Result<String> {
    if path.starts_with("$..") {
        return Err(PolicyError::Unsupported(format!(
            "deep scan in JSONPath '{}'",
            original
        )));
    }
    let Some(rest) = path.strip_prefix("$.") else {
        return Err(PolicyError::Unsupported(format!(
            "JSONPath '{}' does not name a field",
            original
        )));
    };
    let parts: Vec<&str> = rest.split('.').collect();
    let plain = parts.iter().all(|p| {
        !p.is_empty()
            && p.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    });
    if !plain {
        return Err(PolicyError::Unsupported(format!(
            "JSONPath '{}' has no dot-notation equivalent",
            original
        )));
    }
    Ok(parts.join("."))
}

fn join(base: &str, path: &str) -> String {
    if base.is_empty() {
        path.to_string()
    } else {
        format!("{}.{}", base, path)
    }
}
