//! Conditions tree parser.
//!
//! Turns an untyped YAML/JSON document into a [`Node`] tree. Only the shape
//! is checked here; attributes, methods and values are validated later by
//! [`Node::prepare_and_validate`].

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use super::{Condition, Node, Quantifier};
use crate::error::{PolicyError, Result};

/// Default limit on nesting, see [`crate::config::EngineConfig::max_tree_depth`].
pub const DEFAULT_MAX_DEPTH: usize = 64;

const PARENT_KEY: &str = "parentjsonpathattribute";
const RETURN_VALUES_KEY: &str = "returnvaluejsonpath";
const PARENT_PREFIXES: &[&str] = &["jsonpath:$.", "jsonpath:.", "jsonpath:$RELATIVE"];
const LEAF_KEYS: &[&str] = &["attribute", "method", "value", "valueint", "valuefloat"];

/// Where a document appears; part of every error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Parent {
    Root,
    And,
    Or,
    Not,
    Any,
    All,
}

impl Parent {
    fn as_str(&self) -> &'static str {
        match self {
            Parent::Root => "root",
            Parent::And => "AND",
            Parent::Or => "OR",
            Parent::Not => "NOT",
            Parent::Any => "ANY",
            Parent::All => "ALL",
        }
    }
}

/// Parse a conditions document with the default depth limit.
pub fn parse_conditions_tree(doc: &Value) -> Result<Node> {
    parse_conditions_tree_with_depth(doc, DEFAULT_MAX_DEPTH)
}

/// Parse a conditions document, rejecting trees nested deeper than `max_depth`.
pub fn parse_conditions_tree_with_depth(doc: &Value, max_depth: usize) -> Result<Node> {
    TreeParser { max_depth }.parse(doc, Parent::Root, 1)
}

struct TreeParser {
    max_depth: usize,
}

impl TreeParser {
    fn parse(&self, doc: &Value, parent: Parent, depth: usize) -> Result<Node> {
        if depth > self.max_depth {
            return Err(PolicyError::document(format!(
                "conditions tree is deeper than {} levels",
                self.max_depth
            )));
        }
        match doc {
            Value::Bool(true) => Ok(Node::True),
            Value::Bool(false) => Ok(Node::False),
            Value::Array(items) => match (parent, items.as_slice()) {
                (Parent::Root | Parent::Not, [single]) => self.parse(single, parent, depth + 1),
                (Parent::Root, _) => Err(PolicyError::document(
                    "node type not supported under root: array of conditions without AND,OR parent",
                )),
                (_, _) => Err(PolicyError::document(format!(
                    "node type not supported under {}: nested array",
                    parent.as_str()
                ))),
            },
            Value::Object(map) if is_leaf(map) => condition_from_map(map).map(Node::Condition),
            Value::Object(map) => {
                let mut entries = map.iter();
                match (entries.next(), entries.next()) {
                    (Some((key, value)), None) => self.parse_keyed(key, value, parent, depth),
                    _ => Err(PolicyError::document(format!(
                        "node type not supported under {}: expected one of AND, OR, NOT, ANY, ALL, condition; got keys [{}]",
                        parent.as_str(),
                        map.keys().cloned().collect::<Vec<_>>().join(", ")
                    ))),
                }
            }
            other => Err(PolicyError::document(format!(
                "node type not supported under {}: {}",
                parent.as_str(),
                other
            ))),
        }
    }

    fn parse_keyed(&self, key: &str, value: &Value, parent: Parent, depth: usize) -> Result<Node> {
        match key.to_uppercase().as_str() {
            "AND" => self.parse_children(value, Parent::And, depth).map(Node::And),
            "OR" => self.parse_children(value, Parent::Or, depth).map(Node::Or),
            "NOT" => {
                if let Value::Object(map) = value {
                    if map.len() != 1 {
                        return Err(PolicyError::document(format!(
                            "NOT must have exactly one key, got {}",
                            map.len()
                        )));
                    }
                }
                self.parse(value, Parent::Not, depth + 1)
                    .map(|child| Node::Not(Box::new(child)))
            }
            "ANY" => self.parse_quantifier(value, Parent::Any, depth).map(Node::Any),
            "ALL" => self.parse_quantifier(value, Parent::All, depth).map(Node::All),
            "CONDITION" => match value {
                Value::Object(map) if is_leaf(map) => condition_from_map(map).map(Node::Condition),
                _ => Err(PolicyError::document(format!(
                    "condition under {} needs attribute and method",
                    parent.as_str()
                ))),
            },
            _ => Err(PolicyError::document(format!(
                "node type not supported under {}: key '{}'",
                parent.as_str(),
                key
            ))),
        }
    }

    fn parse_children(&self, value: &Value, parent: Parent, depth: usize) -> Result<Vec<Node>> {
        match value {
            Value::Array(items) if items.is_empty() => Err(PolicyError::document(format!(
                "{} without children",
                parent.as_str()
            ))),
            Value::Array(items) => items
                .iter()
                .map(|item| self.parse(item, parent, depth + 1))
                .collect(),
            Value::Object(_) => Ok(vec![self.parse(value, parent, depth + 1)?]),
            other => Err(PolicyError::document(format!(
                "{} expects a list or a map, got {}",
                parent.as_str(),
                other
            ))),
        }
    }

    fn parse_quantifier(&self, value: &Value, parent: Parent, depth: usize) -> Result<Quantifier> {
        let Value::Object(map) = value else {
            return Err(PolicyError::document(format!(
                "{} expects a map",
                parent.as_str()
            )));
        };

        let mut parent_attribute = None;
        let mut return_values = BTreeMap::new();
        let mut child = None;
        for (key, item) in map {
            match normalize_key(key).as_str() {
                PARENT_KEY => {
                    let text = item.as_str().ok_or_else(|| {
                        PolicyError::document("parentJsonpathAttribute must be a string")
                    })?;
                    if !PARENT_PREFIXES.iter().any(|p| text.starts_with(p)) {
                        return Err(PolicyError::document(format!(
                            "parentJsonpathAttribute '{}' must start with jsonpath:$., jsonpath:. or jsonpath:$RELATIVE",
                            text
                        )));
                    }
                    parent_attribute = Some(text.to_string());
                }
                RETURN_VALUES_KEY => return_values = parse_return_values(item)?,
                _ => {
                    if child.is_some() {
                        return Err(PolicyError::document(format!(
                            "{} must have exactly one child",
                            parent.as_str()
                        )));
                    }
                    child = Some(self.parse_keyed(key, item, parent, depth + 1)?);
                }
            }
        }

        let parent_attribute = parent_attribute.ok_or_else(|| {
            PolicyError::document(format!(
                "{} requires parentJsonpathAttribute",
                parent.as_str()
            ))
        })?;
        let child = child.ok_or_else(|| {
            PolicyError::document(format!("{} must have exactly one child", parent.as_str()))
        })?;

        let mut quantifier = Quantifier::new(parent_attribute, child);
        quantifier.return_values = return_values;
        Ok(quantifier)
    }
}

fn parse_return_values(value: &Value) -> Result<BTreeMap<String, String>> {
    let Value::Object(map) = value else {
        return Err(PolicyError::document("returnValueJsonpath must be a map"));
    };
    map.iter()
        .map(|(name, path)| match path.as_str() {
            Some(path) if path.starts_with("jsonpath:$RELATIVE") => {
                Ok((name.clone(), path.to_string()))
            }
            _ => Err(PolicyError::document(format!(
                "returnValueJsonpath '{}' must be a string starting with jsonpath:$RELATIVE",
                name
            ))),
        })
        .collect()
}

/// Lowercase with underscores removed, so `value_int` and `valueInt` agree.
fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

fn is_leaf(map: &Map<String, Value>) -> bool {
    let keys: Vec<String> = map.keys().map(|k| normalize_key(k)).collect();
    keys.iter().any(|k| k == "attribute")
        && keys.iter().any(|k| k == "method")
        && keys.iter().all(|k| LEAF_KEYS.contains(&k.as_str()))
}

fn condition_from_map(map: &Map<String, Value>) -> Result<Condition> {
    let mut attribute = String::new();
    let mut method = String::new();
    let mut value = None;
    let mut value_int = None;
    let mut value_float = None;

    for (key, item) in map {
        match normalize_key(key).as_str() {
            "attribute" => attribute = scalar_text(item, key)?,
            "method" => method = scalar_text(item, key)?,
            "value" => value = Some(value_text(item)?),
            "valueint" => {
                value_int = Some(item.as_i64().ok_or_else(|| {
                    PolicyError::document(format!("valueInt must be an integer, got {}", item))
                })?)
            }
            "valuefloat" => {
                value_float = Some(item.as_f64().ok_or_else(|| {
                    PolicyError::document(format!("valueFloat must be a number, got {}", item))
                })?)
            }
            _ => {}
        }
    }

    let value = value
        .or_else(|| value_int.map(|i| i.to_string()))
        .or_else(|| value_float.map(|f| f.to_string()))
        .unwrap_or_default();
    let mut condition = Condition::new(attribute, method, value);
    condition.value_int = value_int;
    condition.value_float = value_float;
    Ok(condition)
}

fn scalar_text(value: &Value, key: &str) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(PolicyError::document(format!(
            "'{}' must be a scalar, got {}",
            key, other
        ))),
    }
}

/// Condition values may be scalars or lists; lists are joined with `,`.
fn value_text(value: &Value) -> Result<String> {
    match value {
        Value::Null => Ok(String::new()),
        Value::Array(items) => items
            .iter()
            .map(|item| scalar_text(item, "value"))
            .collect::<Result<Vec<_>>>()
            .map(|items| items.join(",")),
        other => scalar_text(other, "value"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_yaml(yaml: &str) -> Result<Node> {
        let doc: Value = serde_yaml::from_str(yaml).unwrap();
        parse_conditions_tree(&doc)
    }

    #[test]
    fn test_leaf_at_root() {
        let node = parse_yaml("attribute: senderName\nmethod: EQ\nvalue: web\n").unwrap();
        assert_eq!(node.to_string(), "<senderName-EQ-web>");
    }

    #[test]
    fn test_combinators() {
        let node = parse_yaml(
            r#"
AND:
  - attribute: senderName
    method: EQ
    value: web
  - OR:
      - condition:
          attribute: path
          method: RE
          value: ^/api
      - NOT:
          condition:
            attribute: method
            method: EQ
            value: DELETE
"#,
        )
        .unwrap();
        assert_eq!(
            node.to_string(),
            "((!(<method-EQ-DELETE>)||<path-RE-^/api>)&&<senderName-EQ-web>)"
        );
    }

    #[test]
    fn test_single_map_child_and_booleans() {
        let node = parse_yaml("or:\n  condition: {attribute: path, method: EX}\n").unwrap();
        assert!(matches!(&node, Node::Or(c) if c.len() == 1));
        assert!(matches!(parse_yaml("true").unwrap(), Node::True));
        assert!(matches!(parse_yaml("[false]").unwrap(), Node::False));
    }

    #[test]
    fn test_value_forms() {
        let node = parse_yaml("attribute: method\nmethod: IN\nvalue: [GET, POST]\n").unwrap();
        assert_eq!(node.to_string(), "<method-IN-GET,POST>");

        let node = parse_yaml("attribute: receiverPort\nmethod: GT\nvalue_int: 1024\n").unwrap();
        match node {
            Node::Condition(c) => {
                assert_eq!(c.value, "1024");
                assert_eq!(c.value_int, Some(1024));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_quantifier() {
        let node = parse_yaml(
            r#"
ANY:
  parentJsonpathAttribute: jsonpath:$.items
  returnValueJsonpath:
    sku: jsonpath:$RELATIVE.sku
  condition:
    attribute: jsonpath:$RELATIVE.qty
    method: GT
    value: "3"
"#,
        )
        .unwrap();
        match node {
            Node::Any(q) => {
                assert_eq!(q.parent_attribute, "jsonpath:$.items");
                assert_eq!(q.return_values["sku"], "jsonpath:$RELATIVE.sku");
                assert!(matches!(*q.child, Node::Condition(_)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_shape_errors() {
        let err = parse_yaml(
            "- {attribute: path, method: EX}\n- {attribute: method, method: EX}\n",
        )
        .unwrap_err();
        assert!(err
            .to_string()
            .contains("array of conditions without AND,OR parent"));

        assert!(parse_yaml("AND: []").is_err());
        assert!(parse_yaml("XOR: [true]").is_err());
        assert!(parse_yaml("attribute: path\nmethod: EQ\nextra: 1\n").is_err());
        assert!(parse_yaml("NOT:\n  AND: [true]\n  OR: [true]\n").is_err());
        assert!(parse_yaml("42").is_err());
        // Quantifiers need a parent, a valid prefix, and exactly one child.
        assert!(parse_yaml("ANY:\n  condition: {attribute: path, method: EX}\n").is_err());
        assert!(parse_yaml(
            "ALL:\n  parentJsonpathAttribute: $.items\n  condition: {attribute: path, method: EX}\n"
        )
        .is_err());
        assert!(parse_yaml(
            "ALL:\n  parentJsonpathAttribute: jsonpath:$.items\n  AND: [true]\n  OR: [true]\n"
        )
        .is_err());
        assert!(parse_yaml(
            "ANY:\n  parentJsonpathAttribute: jsonpath:$.items\n  returnValueJsonpath: {a: \"jsonpath:$.a\"}\n  condition: {attribute: path, method: EX}\n"
        )
        .is_err());
    }

    #[test]
    fn test_depth_limit() {
        let doc: Value = serde_yaml::from_str("NOT:\n  NOT:\n    NOT: true\n").unwrap();
        assert!(parse_conditions_tree_with_depth(&doc, 4).is_ok());
        assert!(parse_conditions_tree_with_depth(&doc, 3).is_err());
    }
}
