//! Predefined strings and lists referenced as `#name` from rules.
//!
//! ```yaml
//! predefinedStrings:
//!   internalNet: 10.0.0.0/8
//! predefinedLists:
//!   trusted: ["#internalNet", 192.168.1.7]
//! ```
//!
//! List entries starting with `#` point into `predefinedStrings` and are
//! resolved when the table is built, so lookups never fail later on.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{PolicyError, Result};

/// What a raw string resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    /// Not a reference, or a reference to a predefined string.
    Literal(String),
    /// A reference to a predefined list.
    List(Vec<String>),
}

/// Lookup table for `#name` references.
///
/// Passed explicitly into rule preparation; there is no process-wide table,
/// so rule sets with different tables can coexist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PredefinedStringsAndLists {
    strings: HashMap<String, String>,
    lists: HashMap<String, Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct PredefinedRaw {
    #[serde(default, rename = "predefinedStrings")]
    strings: HashMap<String, String>,
    #[serde(default, rename = "predefinedLists")]
    lists: HashMap<String, Vec<String>>,
}

impl PredefinedStringsAndLists {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table, resolving `#` entries of lists eagerly.
    pub fn from_parts(
        strings: HashMap<String, String>,
        lists: HashMap<String, Vec<String>>,
    ) -> Result<Self> {
        let mut resolved_lists = HashMap::with_capacity(lists.len());
        for (name, items) in lists {
            let mut resolved = Vec::with_capacity(items.len());
            for item in items {
                match item.strip_prefix('#') {
                    Some(reference) => {
                        let value = strings
                            .get(reference)
                            .ok_or_else(|| PolicyError::UndefinedReference(reference.to_string()))?;
                        resolved.push(value.clone());
                    }
                    None => resolved.push(item),
                }
            }
            resolved_lists.insert(name, resolved);
        }
        Ok(Self {
            strings,
            lists: resolved_lists,
        })
    }

    /// Parse a `predefinedStrings` / `predefinedLists` document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let raw: PredefinedRaw = serde_yaml::from_str(yaml)?;
        Self::from_parts(raw.strings, raw.lists)
    }

    /// Load a table from a YAML file.
    pub fn from_yaml_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn string(&self, name: &str) -> Option<&str> {
        self.strings.get(name).map(String::as_str)
    }

    pub fn list(&self, name: &str) -> Option<&[String]> {
        self.lists.get(name).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty() && self.lists.is_empty()
    }

    /// Resolve `raw` if it is a `#name` reference.
    ///
    /// Strings take precedence over lists of the same name. An undefined
    /// name is an error; anything not starting with `#` is returned as is.
    pub fn resolve(&self, raw: &str) -> Result<Resolved> {
        let Some(name) = raw.strip_prefix('#') else {
            return Ok(Resolved::Literal(raw.to_string()));
        };
        if let Some(value) = self.strings.get(name) {
            return Ok(Resolved::Literal(value.clone()));
        }
        if let Some(items) = self.lists.get(name) {
            return Ok(Resolved::List(items.clone()));
        }
        Err(PolicyError::UndefinedReference(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = r##"
predefinedStrings:
  internalNet: 10.0.0.0/8
  admin: admin-svc
predefinedLists:
  trusted: ["#internalNet", "192.168.1.7"]
  methods: [GET, HEAD]
"##;

    #[test]
    fn test_lists_resolve_string_references() {
        let table = PredefinedStringsAndLists::from_yaml(TABLE).unwrap();
        assert_eq!(
            table.list("trusted").unwrap(),
            &["10.0.0.0/8".to_string(), "192.168.1.7".to_string()]
        );
        assert_eq!(table.string("admin"), Some("admin-svc"));
    }

    #[test]
    fn test_undefined_list_reference_is_load_error() {
        let yaml = "predefinedLists:\n  l: [\"#missing\"]\n";
        let err = PredefinedStringsAndLists::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, PolicyError::UndefinedReference(ref n) if n == "missing"));
    }

    #[test]
    fn test_resolve() {
        let table = PredefinedStringsAndLists::from_yaml(TABLE).unwrap();
        assert_eq!(
            table.resolve("plain").unwrap(),
            Resolved::Literal("plain".into())
        );
        assert_eq!(
            table.resolve("#admin").unwrap(),
            Resolved::Literal("admin-svc".into())
        );
        assert_eq!(
            table.resolve("#methods").unwrap(),
            Resolved::List(vec!["GET".into(), "HEAD".into()])
        );
        assert!(table.resolve("#nope").is_err());
    }

    #[test]
    fn test_empty_document() {
        let table = PredefinedStringsAndLists::from_yaml("{}").unwrap();
        assert!(table.is_empty());
    }
}
