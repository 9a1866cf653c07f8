//! Rule set and message loading.
//!
//! Rules documents are YAML (or JSON) with a top-level `rules:` list; message
//! documents carry a `messages:` list. Every rule is prepared while loading,
//! so a [`RuleSet`] only ever holds evaluable rules.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::config::EngineConfig;
use crate::error::{PolicyError, Result};
use crate::message::Message;
use crate::policy::{self, CheckOutcome, PreparedRule, RawRule};
use crate::predefined::PredefinedStringsAndLists;

#[derive(Debug, Default, Deserialize)]
struct RulesDocument {
    #[serde(default)]
    rules: Vec<RawRule>,
}

#[derive(Debug, Default, Deserialize)]
struct MessagesDocument {
    #[serde(default)]
    messages: Vec<Message>,
}

/// An ordered list of prepared rules.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<PreparedRule>,
    config: EngineConfig,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepare every rule; the first failure aborts.
    pub fn prepare(
        raw: Vec<RawRule>,
        predefined: &PredefinedStringsAndLists,
        config: EngineConfig,
    ) -> Result<Self> {
        let rules = raw
            .into_iter()
            .map(|rule| rule.prepare_with_config(predefined, &config))
            .collect::<Result<Vec<_>>>()?;
        log::debug!("Prepared {} rules", rules.len());
        Ok(Self { rules, config })
    }

    // ----- Loading -----

    /// Load a rules document. JSON is accepted too.
    pub fn from_yaml(text: &str, predefined: &PredefinedStringsAndLists) -> Result<Self> {
        Self::from_yaml_with_config(text, predefined, EngineConfig::default())
    }

    pub fn from_yaml_with_config(
        text: &str,
        predefined: &PredefinedStringsAndLists,
        config: EngineConfig,
    ) -> Result<Self> {
        Self::prepare(parse_rules(text)?, predefined, config)
    }

    /// Load a rules document from a file.
    pub fn from_yaml_file(
        path: impl AsRef<Path>,
        predefined: &PredefinedStringsAndLists,
    ) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content, predefined)
    }

    /// Load a rules document, skipping rules that fail to prepare.
    ///
    /// Returns the rules that loaded plus one error per skipped rule. A
    /// document that does not parse at all is still an error.
    pub fn load_lenient(
        text: &str,
        predefined: &PredefinedStringsAndLists,
        config: EngineConfig,
    ) -> Result<(Self, Vec<PolicyError>)> {
        let mut rules = Vec::new();
        let mut skipped = Vec::new();
        for raw in parse_rules(text)? {
            let rule_id = raw.rule_id.clone();
            match raw.prepare_with_config(predefined, &config) {
                Ok(rule) => rules.push(rule),
                Err(e) => {
                    log::warn!("Skipping rule '{}': {}", rule_id, e);
                    skipped.push(e);
                }
            }
        }
        Ok((Self { rules, config }, skipped))
    }

    // ----- Access -----

    pub fn rules(&self) -> &[PreparedRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&PreparedRule> {
        self.rules.get(index)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Append an already prepared rule.
    pub fn push(&mut self, rule: PreparedRule) {
        self.rules.push(rule);
    }

    /// Groups of rule indices sharing a hash, for groups of two or more.
    pub fn duplicates(&self) -> Vec<Vec<usize>> {
        let mut by_hash: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (i, rule) in self.rules.iter().enumerate() {
            by_hash.entry(rule.hash()).or_default().push(i);
        }
        let mut groups: Vec<Vec<usize>> = by_hash
            .into_values()
            .filter(|indices| indices.len() > 1)
            .collect();
        groups.sort();
        groups
    }

    // ----- Checking -----

    /// Check a message using this set's configuration.
    pub fn check(&self, message: &Message) -> CheckOutcome {
        policy::check_with_config(message, &self.rules, &self.config)
    }

    pub fn check_with_config(&self, message: &Message, config: &EngineConfig) -> CheckOutcome {
        policy::check_with_config(message, &self.rules, config)
    }
}

fn parse_rules(text: &str) -> Result<Vec<RawRule>> {
    let doc: Option<RulesDocument> = serde_yaml::from_str(text)?;
    Ok(doc.unwrap_or_default().rules)
}

/// Parse a `messages:` document.
///
/// Raw JSON bodies are not part of the document; attach them afterwards with
/// [`Message::with_json_raw`] or [`Message::with_json_object`].
pub fn load_messages_yaml(text: &str) -> Result<Vec<Message>> {
    let doc: Option<MessagesDocument> = serde_yaml::from_str(text)?;
    Ok(doc.unwrap_or_default().messages)
}

/// Load a `messages:` document from a file.
pub fn load_messages_file(path: impl AsRef<Path>) -> Result<Vec<Message>> {
    let content = std::fs::read_to_string(path.as_ref())?;
    load_messages_yaml(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Decision;
    use serde_json::json;

    const RULES: &str = r#"
rules:
  - rule_id: allow-front
    sender: {senderName: frontend}
    receiver: {receiverName: orders}
    operation: GET
    decision: allow
  - rule_id: block-big-orders
    receiver: {receiverName: orders}
    operation: POST
    conditions:
      ANY:
        parentJsonpathAttribute: "jsonpath:$.items"
        AND:
          - {attribute: "jsonpath:$RELATIVE.qty", method: GT, value: "100"}
          - {attribute: "jsonpath:$RELATIVE.sku", method: RE, value: "^X-"}
    decision: block
  - rule_id: alert-admin
    resource: {resourceType: path, resourceName: /admin/*}
    decision: alert
"#;

    const MESSAGES: &str = r#"
messages:
  - sender_service: frontend
    receiver_service: orders
    request_method: GET
    request_path: /orders/1
    request_protocol: http
    sender_labels: "app=web,tier=front"
  - sender_service: frontend
    receiver_service: orders
    request_method: POST
    request_path: /orders
    request_protocol: http
    receiver_port: "8080"
"#;

    #[test]
    fn test_load_rules_yaml() {
        let set = RuleSet::from_yaml(RULES, &PredefinedStringsAndLists::new()).unwrap();
        assert_eq!(set.len(), 3);
        assert!(!set.is_empty());
        assert_eq!(set.get(1).unwrap().rule_id(), "block-big-orders");
        assert!(set.get(3).is_none());
    }

    #[test]
    fn test_load_messages_yaml() {
        let messages = load_messages_yaml(MESSAGES).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].sender.service, "frontend");
        assert_eq!(messages[0].sender.labels.get("tier").map(String::as_str), Some("front"));
        assert_eq!(messages[1].request.method, "POST");
        assert_eq!(messages[1].receiver.port, Some(8080));
        assert!(messages[1].json_document().is_none());
    }

    #[test]
    fn test_end_to_end() {
        let set = RuleSet::from_yaml(RULES, &PredefinedStringsAndLists::new()).unwrap();
        let messages = load_messages_yaml(MESSAGES).unwrap();

        let outcome = set.check(&messages[0]);
        assert_eq!(outcome.decision, Decision::Allow);
        assert_eq!(outcome.rule_index, Some(0));

        let big = messages[1].clone().with_json_object(json!({
            "items": [
                {"sku": "A-1", "qty": 5},
                {"sku": "X-9", "qty": 500}
            ]
        }));
        let outcome = set.check(&big);
        assert_eq!(outcome.decision, Decision::Block);
        assert_eq!(outcome.rule_index, Some(1));
        assert_eq!(outcome.applied, vec![1]);

        let small = messages[1]
            .clone()
            .with_json_object(json!({"items": [{"sku": "X-9", "qty": 1}]}));
        assert_eq!(set.check(&small).decision, Decision::Default);

        // Without a body the quantifier has nothing to visit.
        assert_eq!(set.check(&messages[1]).decision, Decision::Default);
    }

    #[test]
    fn test_json_rules_document() {
        let text = r#"{"rules": [{"rule_id": "j1", "operation": "DELETE", "decision": "block"}]}"#;
        let set = RuleSet::from_yaml(text, &PredefinedStringsAndLists::new()).unwrap();
        let message = Message::new().with_request("delete", "/x", "http");
        assert_eq!(set.check(&message).decision, Decision::Block);
    }

    #[test]
    fn test_invalid_rule_aborts_with_rule_id() {
        let text = r#"
rules:
  - rule_id: good
    decision: allow
  - rule_id: bad-method
    conditions: {attribute: path, method: GT, value: "/x"}
    decision: block
"#;
        let err = RuleSet::from_yaml(text, &PredefinedStringsAndLists::new()).unwrap_err();
        assert!(err.to_string().contains("bad-method"));
    }

    #[test]
    fn test_load_lenient_skips_invalid_rules() {
        let _ = env_logger::builder().is_test(true).try_init();
        let text = r##"
rules:
  - rule_id: good
    decision: allow
  - rule_id: bad-ref
    sender: {senderName: "#missing"}
    decision: block
  - rule_id: bad-tree
    conditions: {AND: []}
    decision: block
  - rule_id: bad-cond
    conditions: {attribute: path, method: EQ, value: "#nope"}
    decision: alert
"##;
        let (set, skipped) =
            RuleSet::load_lenient(text, &PredefinedStringsAndLists::new(), EngineConfig::default())
                .unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.rules()[0].rule_id(), "good");
        assert_eq!(skipped.len(), 3);
        for (err, id) in skipped.iter().zip(["bad-ref", "bad-tree", "bad-cond"]) {
            assert!(err.to_string().contains(id), "{}", err);
        }
        assert!(skipped[0].to_string().contains("#missing"));
        assert!(skipped[2].to_string().contains("#nope"));
    }

    #[test]
    fn test_invalid_document() {
        let predefined = PredefinedStringsAndLists::new();
        assert!(RuleSet::from_yaml("rules: [[[", &predefined).is_err());
        assert!(RuleSet::from_yaml("rules: 3", &predefined).is_err());
        assert!(load_messages_yaml("messages: {").is_err());
    }

    #[test]
    fn test_empty_documents() {
        let predefined = PredefinedStringsAndLists::new();
        assert!(RuleSet::from_yaml("", &predefined).unwrap().is_empty());
        assert!(RuleSet::from_yaml("rules: []", &predefined).unwrap().is_empty());
        assert!(load_messages_yaml("").unwrap().is_empty());
    }

    #[test]
    fn test_predefined_references_in_rules() {
        let predefined = PredefinedStringsAndLists::from_yaml(
            r#"
predefinedStrings:
  office: 10.0.0.0/8
predefinedLists:
  verbs: [PUT, PATCH]
"#,
        )
        .unwrap();
        let text = r##"
rules:
  - rule_id: office-writes
    sender: {senderName: "#office", senderType: subnet}
    conditions: {attribute: method, method: IN, value: "#verbs"}
    decision: alert
"##;
        let set = RuleSet::from_yaml(text, &predefined).unwrap();
        let put = Message::new()
            .with_sender_ip("10.4.4.4")
            .with_request("PUT", "/a", "http");
        assert_eq!(set.check(&put).decision, Decision::Alert);
        let get = put.clone().with_request("GET", "/a", "http");
        assert_eq!(set.check(&get).decision, Decision::Default);
    }

    #[test]
    fn test_duplicates() {
        let text = r#"
rules:
  - rule_id: a
    conditions:
      OR:
        - {attribute: method, method: EQ, value: GET}
        - {attribute: method, method: EQ, value: HEAD}
    decision: allow
  - rule_id: b
    decision: block
  - rule_id: c
    metadata: {note: copy of a}
    conditions:
      OR:
        - {attribute: method, method: EQ, value: HEAD}
        - {attribute: method, method: EQ, value: GET}
    decision: allow
"#;
        let set = RuleSet::from_yaml(text, &PredefinedStringsAndLists::new()).unwrap();
        assert_eq!(set.duplicates(), vec![vec![0, 2]]);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let rules_path = dir.path().join("rules.yaml");
        let messages_path = dir.path().join("messages.yaml");
        std::fs::write(&rules_path, RULES).unwrap();
        std::fs::write(&messages_path, MESSAGES).unwrap();

        let set = RuleSet::from_yaml_file(&rules_path, &PredefinedStringsAndLists::new()).unwrap();
        let messages = load_messages_file(&messages_path).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.check(&messages[0]).decision, Decision::Allow);
    }

    #[test]
    fn test_load_missing_file() {
        let predefined = PredefinedStringsAndLists::new();
        let result = RuleSet::from_yaml_file("/nonexistent/rules.yaml", &predefined);
        assert!(matches!(result, Err(PolicyError::Io(_))));
    }

    #[test]
    fn test_config_is_carried() {
        let config = EngineConfig::default().with_parallel(false);
        let set = RuleSet::from_yaml_with_config(RULES, &PredefinedStringsAndLists::new(), config)
            .unwrap();
        assert!(!set.config().parallel);
        let message = Message::new().with_request("GET", "/admin/users", "http");
        let outcome = set.check_with_config(&message, &EngineConfig::default());
        assert_eq!(outcome.decision, Decision::Alert);
    }
}
