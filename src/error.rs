//! Policy engine errors.

use thiserror::Error;

/// Errors raised while loading, preparing or compiling rules.
///
/// Evaluation itself never fails: anything that could go wrong at request
/// time is rejected here, at load time.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// YAML parsing or serialization failed.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON parsing or serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// File I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A regular expression did not compile.
    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    /// A conditions document does not match any node shape.
    #[error("Document error: {0}")]
    Document(String),

    /// An attribute / method / value combination is not acceptable.
    #[error("Validation error in rule '{rule}': {message}")]
    Validation { rule: String, message: String },

    /// A `#name` reference that the predefined table does not define.
    #[error("Undefined predefined reference: #{0}")]
    UndefinedReference(String),

    /// The Mongo backend cannot express this construct.
    #[error("Unsupported in Mongo query: {0}")]
    Unsupported(String),

    /// A reference or query error raised while handling one rule.
    #[error("Error in rule '{rule}': {source}")]
    InRule {
        rule: String,
        #[source]
        source: Box<PolicyError>,
    },
}

impl PolicyError {
    /// Shorthand for a document (shape) error.
    pub fn document(message: impl Into<String>) -> Self {
        PolicyError::Document(message.into())
    }

    /// Shorthand for a validation error not yet attributed to a rule.
    pub fn invalid(message: impl Into<String>) -> Self {
        PolicyError::Validation {
            rule: String::new(),
            message: message.into(),
        }
    }

    /// Attach a rule id to an error raised below rule level.
    ///
    /// Shape and regex errors become validation errors; undefined references
    /// and unsupported constructs keep their variant inside [`PolicyError::InRule`].
    pub fn in_rule(self, rule_id: &str) -> Self {
        match self {
            PolicyError::Validation { rule, message } if rule.is_empty() => {
                PolicyError::Validation {
                    rule: rule_id.to_string(),
                    message,
                }
            }
            PolicyError::Document(message) => PolicyError::Validation {
                rule: rule_id.to_string(),
                message: format!("conditions: {}", message),
            },
            PolicyError::Regex(e) => PolicyError::Validation {
                rule: rule_id.to_string(),
                message: format!("regex: {}", e),
            },
            e @ (PolicyError::UndefinedReference(_) | PolicyError::Unsupported(_)) => {
                PolicyError::InRule {
                    rule: rule_id.to_string(),
                    source: Box::new(e),
                }
            }
            other => other,
        }
    }
}

/// Result alias for policy operations.
pub type Result<T> = std::result::Result<T, PolicyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_rule_attributes_validation_errors() {
        let err = PolicyError::invalid("bad method").in_rule("r-7");
        assert_eq!(
            err.to_string(),
            "Validation error in rule 'r-7': bad method"
        );
    }

    #[test]
    fn test_in_rule_keeps_existing_rule_and_other_variants() {
        let err = PolicyError::Validation {
            rule: "first".into(),
            message: "m".into(),
        }
        .in_rule("second");
        assert!(err.to_string().contains("'first'"));

        let err = PolicyError::InRule {
            rule: "first".into(),
            source: Box::new(PolicyError::Unsupported("x".into())),
        }
        .in_rule("second");
        assert!(err.to_string().contains("'first'"));

        let err = PolicyError::Yaml(serde_yaml::from_str::<u8>("[").unwrap_err()).in_rule("r");
        assert!(matches!(err, PolicyError::Yaml(_)));
    }

    #[test]
    fn test_references_and_unsupported_carry_rule_id() {
        let err = PolicyError::UndefinedReference("nets".into()).in_rule("r");
        assert_eq!(
            err.to_string(),
            "Error in rule 'r': Undefined predefined reference: #nets"
        );
        assert!(matches!(
            err,
            PolicyError::InRule { ref source, .. } if matches!(**source, PolicyError::UndefinedReference(_))
        ));

        let err = PolicyError::Unsupported("deep scan".into()).in_rule("m1");
        assert!(err.to_string().starts_with("Error in rule 'm1': Unsupported"));
    }

    #[test]
    fn test_document_errors_become_rule_errors() {
        let err = PolicyError::document("empty AND").in_rule("r1");
        assert!(matches!(err, PolicyError::Validation { ref rule, .. } if rule == "r1"));
    }
}
