//! Leaf conditions: `attribute METHOD value`.
//!
//! A condition is parsed with its authored text only. Preparation resolves
//! `#name` references, validates and classifies the attribute, and compiles
//! the derived numeric and regex forms that evaluation reads.

use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde_json_path::JsonPath;

use super::units;
use crate::error::{PolicyError, Result};
use crate::message::{Endpoint, Message, Side};
use crate::predefined::{PredefinedStringsAndLists, Resolved};

pub const JSONPATH_PREFIX: &str = "jsonpath:";
pub const RELATIVE_MARKER: &str = "$RELATIVE";
pub const KEY_MARKER: &str = "$KEY";
pub const VALUE_MARKER: &str = "$VALUE";
const SENDER_LABEL_PREFIX: &str = "senderLabel[";
const RECEIVER_LABEL_PREFIX: &str = "receiverLabel[";
const SENDER_OBJECT_PREFIX: &str = "$sender.";
const RECEIVER_OBJECT_PREFIX: &str = "$receiver.";

/// Comparison method of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    Re,
    Nre,
    In,
    Nin,
    Ex,
    Nex,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Eq => "EQ",
            Method::Neq => "NEQ",
            Method::Lt => "LT",
            Method::Le => "LE",
            Method::Gt => "GT",
            Method::Ge => "GE",
            Method::Re => "RE",
            Method::Nre => "NRE",
            Method::In => "IN",
            Method::Nin => "NIN",
            Method::Ex => "EX",
            Method::Nex => "NEX",
        }
    }

    /// LT, LE, GT, GE.
    pub fn is_ordering(&self) -> bool {
        matches!(self, Method::Lt | Method::Le | Method::Gt | Method::Ge)
    }

    /// Methods that compare numerically when both sides parse as numbers.
    pub fn is_numeric(&self) -> bool {
        self.is_ordering() || matches!(self, Method::Eq | Method::Neq)
    }

    pub fn is_existence(&self) -> bool {
        matches!(self, Method::Ex | Method::Nex)
    }

    /// Apply an ordering / equality method to two numbers.
    pub fn compare<T: PartialOrd>(&self, actual: T, expected: T) -> bool {
        match self {
            Method::Eq => actual == expected,
            Method::Neq => actual != expected,
            Method::Lt => actual < expected,
            Method::Le => actual <= expected,
            Method::Gt => actual > expected,
            Method::Ge => actual >= expected,
            _ => false,
        }
    }
}

impl FromStr for Method {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self> {
        let method = match s.trim().to_uppercase().as_str() {
            "EQ" => Method::Eq,
            "NEQ" => Method::Neq,
            "LT" => Method::Lt,
            "LE" => Method::Le,
            "GT" => Method::Gt,
            "GE" => Method::Ge,
            "RE" => Method::Re,
            "NRE" => Method::Nre,
            "IN" => Method::In,
            "NIN" => Method::Nin,
            "EX" => Method::Ex,
            "NEX" => Method::Nex,
            _ => return Err(PolicyError::invalid(format!("unsupported method '{}'", s))),
        };
        Ok(method)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value type of a bare attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeType {
    Text,
    Integer,
    Float,
}

/// Bare (unprefixed) message attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    SenderName,
    SenderIp,
    SenderNamespace,
    SenderHost,
    ReceiverName,
    ReceiverIp,
    ReceiverNamespace,
    ReceiverHost,
    ReceiverPort,
    Protocol,
    ContextType,
    Path,
    Method,
    RequestSize,
    UserAgent,
    Hour,
    MinuteParity,
    EncryptionType,
    EncryptionVersion,
}

const ATTRIBUTES: &[(&str, Attribute)] = &[
    ("senderName", Attribute::SenderName),
    ("senderIp", Attribute::SenderIp),
    ("senderNamespace", Attribute::SenderNamespace),
    ("senderHost", Attribute::SenderHost),
    ("receiverName", Attribute::ReceiverName),
    ("receiverIp", Attribute::ReceiverIp),
    ("receiverNamespace", Attribute::ReceiverNamespace),
    ("receiverHost", Attribute::ReceiverHost),
    ("receiverPort", Attribute::ReceiverPort),
    ("protocol", Attribute::Protocol),
    ("contextType", Attribute::ContextType),
    ("path", Attribute::Path),
    ("method", Attribute::Method),
    ("requestSize", Attribute::RequestSize),
    ("userAgent", Attribute::UserAgent),
    ("hour", Attribute::Hour),
    ("minuteParity", Attribute::MinuteParity),
    ("encryptionType", Attribute::EncryptionType),
    ("encryptionVersion", Attribute::EncryptionVersion),
];

/// The value of a bare attribute on a particular message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AttributeValue<'a> {
    Text(Option<&'a str>),
    Integer(Option<i64>),
    Float(Option<f64>),
}

impl Attribute {
    /// Case-insensitive lookup by authored name.
    pub fn from_name(name: &str) -> Option<Self> {
        ATTRIBUTES
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, a)| *a)
    }

    pub fn name(&self) -> &'static str {
        ATTRIBUTES
            .iter()
            .find(|(_, a)| a == self)
            .map(|(n, _)| *n)
            .unwrap_or("unknown")
    }

    pub fn value_type(&self) -> AttributeType {
        match self {
            Attribute::ReceiverPort
            | Attribute::RequestSize
            | Attribute::Hour
            | Attribute::MinuteParity => AttributeType::Integer,
            Attribute::EncryptionVersion => AttributeType::Float,
            _ => AttributeType::Text,
        }
    }

    /// Read this attribute from a message. Empty strings count as absent.
    pub fn read<'a>(&self, message: &'a Message) -> AttributeValue<'a> {
        fn text(s: &str) -> AttributeValue<'_> {
            AttributeValue::Text(if s.is_empty() { None } else { Some(s) })
        }
        let request = &message.request;
        match self {
            Attribute::SenderName => text(&message.sender.service),
            Attribute::SenderIp => text(&message.sender.ip),
            Attribute::SenderNamespace => text(&message.sender.namespace),
            Attribute::SenderHost => text(&message.sender.host),
            Attribute::ReceiverName => text(&message.receiver.service),
            Attribute::ReceiverIp => text(&message.receiver.ip),
            Attribute::ReceiverNamespace => text(&message.receiver.namespace),
            Attribute::ReceiverHost => text(&message.receiver.host),
            Attribute::ReceiverPort => AttributeValue::Integer(message.receiver.port),
            Attribute::Protocol => text(&request.protocol),
            Attribute::ContextType => text(&message.context_type),
            Attribute::Path => text(&request.path),
            Attribute::Method => text(&request.method),
            Attribute::RequestSize => AttributeValue::Integer(request.size),
            Attribute::UserAgent => text(&request.user_agent),
            Attribute::Hour => AttributeValue::Integer(request.hour),
            Attribute::MinuteParity => AttributeValue::Integer(request.minute_parity),
            Attribute::EncryptionType => text(&request.encryption_type),
            Attribute::EncryptionVersion => AttributeValue::Float(request.encryption_version),
        }
    }
}

/// What a JSONPath attribute selects.
#[derive(Debug, Clone)]
pub enum JsonTarget {
    /// A regular query, evaluated against the document or the scope element.
    Path(JsonPath),
    /// The key of the current object entry.
    Key,
    /// The value of the current object entry (or the current array element),
    /// optionally queried further.
    Value(Option<JsonPath>),
}

/// A prepared JSONPath attribute.
#[derive(Debug, Clone)]
pub struct JsonQuery {
    /// Normalized query text (`$.a.b`, `$KEY`, `$VALUE.x`).
    pub text: String,
    pub target: JsonTarget,
}

impl JsonQuery {
    /// Prepare the part after `jsonpath:`.
    ///
    /// Returns the query and whether it is relative to the quantifier scope.
    pub fn parse(expr: &str) -> Result<(Self, bool)> {
        let expr = expr.trim();
        let (rest, relative) = match expr.strip_prefix(RELATIVE_MARKER) {
            Some(rest) => (rest, true),
            None => (expr, false),
        };

        // `$RELATIVE.$KEY` and bare `$KEY` are the same thing.
        let entry = if relative {
            rest.strip_prefix('.').filter(|r| r.starts_with("$KEY") || r.starts_with("$VALUE"))
        } else {
            Some(rest).filter(|r| r.starts_with("$KEY") || r.starts_with("$VALUE"))
        };
        if let Some(entry) = entry {
            return Self::parse_entry(entry).map(|q| (q, true));
        }

        let text = if relative {
            format!("${}", rest)
        } else if rest.starts_with('$') {
            rest.to_string()
        } else if rest.starts_with('.') || rest.starts_with('[') {
            format!("${}", rest)
        } else {
            return Err(PolicyError::invalid(format!(
                "JSONPath '{}' must start with '$', '.' or '{}'",
                expr, RELATIVE_MARKER
            )));
        };
        let path = compile_path(&text)?;
        Ok((
            JsonQuery {
                text,
                target: JsonTarget::Path(path),
            },
            relative,
        ))
    }

    fn parse_entry(entry: &str) -> Result<Self> {
        if entry == KEY_MARKER {
            return Ok(JsonQuery {
                text: KEY_MARKER.to_string(),
                target: JsonTarget::Key,
            });
        }
        let Some(rest) = entry.strip_prefix(VALUE_MARKER) else {
            return Err(PolicyError::invalid(format!(
                "'{}' cannot be queried further",
                KEY_MARKER
            )));
        };
        if rest.is_empty() {
            return Ok(JsonQuery {
                text: VALUE_MARKER.to_string(),
                target: JsonTarget::Value(None),
            });
        }
        if !(rest.starts_with('.') || rest.starts_with('[')) {
            return Err(PolicyError::invalid(format!("invalid JSONPath '{}'", entry)));
        }
        let path = compile_path(&format!("${}", rest))?;
        Ok(JsonQuery {
            text: entry.to_string(),
            target: JsonTarget::Value(Some(path)),
        })
    }

    pub fn is_entry(&self) -> bool {
        matches!(self.target, JsonTarget::Key | JsonTarget::Value(_))
    }
}

fn compile_path(text: &str) -> Result<JsonPath> {
    JsonPath::parse(text)
        .map_err(|e| PolicyError::invalid(format!("invalid JSONPath '{}': {}", text, e)))
}

/// Classification of a condition attribute. Exactly one applies.
#[derive(Debug, Clone)]
pub enum AttributeKind {
    Plain(Attribute),
    Label(Side, String),
    Object(Side, String),
    JsonPathAbsolute(JsonQuery),
    JsonPathRelative(JsonQuery),
}

impl AttributeKind {
    /// Classify an authored attribute name, stripping its prefix.
    pub fn classify(attribute: &str) -> Result<Self> {
        let attribute = attribute.trim();
        if let Some(expr) = attribute.strip_prefix(JSONPATH_PREFIX) {
            let (query, relative) = JsonQuery::parse(expr)?;
            return Ok(if relative {
                AttributeKind::JsonPathRelative(query)
            } else {
                AttributeKind::JsonPathAbsolute(query)
            });
        }
        for (prefix, side) in [
            (SENDER_LABEL_PREFIX, Side::Sender),
            (RECEIVER_LABEL_PREFIX, Side::Receiver),
        ] {
            if let Some(rest) = attribute.strip_prefix(prefix) {
                let key = rest.strip_suffix(']').ok_or_else(|| {
                    PolicyError::invalid(format!("label attribute '{}' is missing ']'", attribute))
                })?;
                if key.is_empty() {
                    return Err(PolicyError::invalid(format!(
                        "label attribute '{}' has an empty key",
                        attribute
                    )));
                }
                return Ok(AttributeKind::Label(side, key.to_string()));
            }
        }
        for (prefix, side) in [
            (SENDER_OBJECT_PREFIX, Side::Sender),
            (RECEIVER_OBJECT_PREFIX, Side::Receiver),
        ] {
            if let Some(field) = attribute.strip_prefix(prefix) {
                if !Endpoint::known_fields(side).contains(&field) {
                    return Err(PolicyError::invalid(format!(
                        "unsupported {} object attribute '{}'",
                        side.as_str(),
                        field
                    )));
                }
                return Ok(AttributeKind::Object(side, field.to_string()));
            }
        }
        Attribute::from_name(attribute)
            .map(AttributeKind::Plain)
            .ok_or_else(|| PolicyError::invalid(format!("unsupported attribute '{}'", attribute)))
    }

    pub fn is_jsonpath(&self) -> bool {
        matches!(
            self,
            AttributeKind::JsonPathAbsolute(_) | AttributeKind::JsonPathRelative(_)
        )
    }
}

/// Forms derived from the authored text during preparation.
#[derive(Debug, Clone)]
pub struct Derived {
    pub method: Method,
    pub kind: AttributeKind,
    /// The value after `#name` resolution.
    pub value: String,
    pub int: Option<i64>,
    pub float: Option<f64>,
    /// RE/NRE pattern, or the IN/NIN alternation.
    pub regex: Option<Regex>,
    /// EQ/NEQ wildcard pattern, when the value has `*` or `?`.
    pub wildcard: Option<Regex>,
    /// IN/NIN items.
    pub items: Vec<String>,
}

/// A leaf condition.
#[derive(Debug, Clone)]
pub struct Condition {
    /// Authored attribute, kept verbatim for display and hashing.
    pub attribute: String,
    /// Authored method.
    pub method: String,
    /// Authored value (a `#name` reference stays a reference here).
    pub value: String,
    pub value_int: Option<i64>,
    pub value_float: Option<f64>,
    derived: Option<Derived>,
}

impl Condition {
    pub fn new(
        attribute: impl Into<String>,
        method: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            attribute: attribute.into(),
            method: method.into(),
            value: value.into(),
            value_int: None,
            value_float: None,
            derived: None,
        }
    }

    pub fn is_prepared(&self) -> bool {
        self.derived.is_some()
    }

    pub fn derived(&self) -> Option<&Derived> {
        self.derived.as_ref()
    }

    pub fn kind(&self) -> Option<&AttributeKind> {
        self.derived.as_ref().map(|d| &d.kind)
    }

    /// Resolve, validate, classify and compile. Idempotent.
    pub fn prepare_and_validate(&mut self, predefined: &PredefinedStringsAndLists) -> Result<()> {
        if self.derived.is_some() {
            return Ok(());
        }

        let method: Method = self.method.parse()?;

        // 1. `#name` references.
        let (value, items) = match predefined.resolve(self.value.trim())? {
            Resolved::Literal(v) => {
                let items = if matches!(method, Method::In | Method::Nin) {
                    units::split_list(&v)
                } else {
                    Vec::new()
                };
                (v, items)
            }
            Resolved::List(list) => {
                if !matches!(method, Method::In | Method::Nin) {
                    return Err(PolicyError::invalid(format!(
                        "list reference '{}' is only allowed with IN/NIN",
                        self.value
                    )));
                }
                (list.join(","), list)
            }
        };

        // 2. + 3. Attribute / method validation and classification.
        let kind = AttributeKind::classify(&self.attribute)?;
        let int = value.trim().parse::<i64>().ok().or(self.value_int);
        let float = units::parse_with_units(&value).or(self.value_float);
        self.validate_method(&kind, method, &value, int, float, &items)?;

        // 4. Derived regex forms.
        let regex = match method {
            Method::In | Method::Nin => Some(Regex::new(&units::alternation(&items))?),
            Method::Re | Method::Nre => Some(Regex::new(&value)?),
            _ => None,
        };
        let wildcard = match method {
            Method::Eq | Method::Neq if units::has_wildcards(&value) => {
                Some(Regex::new(&units::wildcard_to_regex(&value))?)
            }
            _ => None,
        };

        self.derived = Some(Derived {
            method,
            kind,
            value,
            int,
            float,
            regex,
            wildcard,
            items,
        });
        Ok(())
    }

    fn validate_method(
        &self,
        kind: &AttributeKind,
        method: Method,
        value: &str,
        int: Option<i64>,
        float: Option<f64>,
        items: &[String],
    ) -> Result<()> {
        if matches!(method, Method::In | Method::Nin) && items.is_empty() {
            return Err(PolicyError::invalid(format!(
                "{} on '{}' needs at least one value",
                method, self.attribute
            )));
        }
        match kind {
            AttributeKind::Label(..) | AttributeKind::Object(..) if method.is_ordering() => {
                Err(PolicyError::invalid(format!(
                    "numeric method {} is not allowed on '{}'",
                    method, self.attribute
                )))
            }
            AttributeKind::Plain(attribute) => match attribute.value_type() {
                AttributeType::Text if method.is_ordering() => Err(PolicyError::invalid(format!(
                    "numeric method {} on non-numeric attribute '{}'",
                    method, self.attribute
                ))),
                AttributeType::Integer if method.is_numeric() && int.is_none() => {
                    Err(PolicyError::invalid(format!(
                        "'{}' needs an integer value, got '{}'",
                        self.attribute, value
                    )))
                }
                AttributeType::Float if !method.is_numeric() => Err(PolicyError::invalid(format!(
                    "'{}' only supports EQ, NEQ, LT, LE, GT, GE",
                    self.attribute
                ))),
                AttributeType::Float if float.is_none() => Err(PolicyError::invalid(format!(
                    "'{}' needs a numeric value, got '{}'",
                    self.attribute, value
                ))),
                _ => Ok(()),
            },
            AttributeKind::JsonPathAbsolute(_) | AttributeKind::JsonPathRelative(_)
                if method.is_ordering() && float.is_none() =>
            {
                Err(PolicyError::invalid(format!(
                    "{} on '{}' needs a numeric value, got '{}'",
                    method, self.attribute, value
                )))
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Condition {
    /// `<attribute-method-value>` over the authored text.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}-{}-{}>", self.attribute, self.method, self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prepared(attribute: &str, method: &str, value: &str) -> Result<Condition> {
        let mut c = Condition::new(attribute, method, value);
        c.prepare_and_validate(&PredefinedStringsAndLists::new())?;
        Ok(c)
    }

    #[test]
    fn test_method_parse() {
        assert_eq!("eq".parse::<Method>().unwrap(), Method::Eq);
        assert_eq!(" NIN ".parse::<Method>().unwrap(), Method::Nin);
        assert!("LIKE".parse::<Method>().is_err());
    }

    #[test]
    fn test_classification() {
        let c = prepared("senderLabel[app]", "EQ", "web").unwrap();
        assert!(matches!(c.kind(), Some(AttributeKind::Label(Side::Sender, k)) if k == "app"));

        let c = prepared("$receiver.namespace", "EQ", "prod").unwrap();
        assert!(matches!(c.kind(), Some(AttributeKind::Object(Side::Receiver, f)) if f == "namespace"));

        let c = prepared("jsonpath:.spec.replicas", "GT", "2").unwrap();
        match c.kind() {
            Some(AttributeKind::JsonPathAbsolute(q)) => assert_eq!(q.text, "$.spec.replicas"),
            other => panic!("unexpected {:?}", other),
        }

        let c = prepared("jsonpath:$RELATIVE.name", "EQ", "x").unwrap();
        match c.kind() {
            Some(AttributeKind::JsonPathRelative(q)) => assert_eq!(q.text, "$.name"),
            other => panic!("unexpected {:?}", other),
        }

        let c = prepared("jsonpath:$KEY", "EQ", "app").unwrap();
        assert!(matches!(c.kind(), Some(AttributeKind::JsonPathRelative(q)) if matches!(q.target, JsonTarget::Key)));

        let c = prepared("jsonpath:$RELATIVE.$VALUE.port", "GT", "80").unwrap();
        assert!(matches!(c.kind(), Some(AttributeKind::JsonPathRelative(q)) if q.text == "$VALUE.port"));

        let c = prepared("Method", "EQ", "GET").unwrap();
        assert!(matches!(c.kind(), Some(AttributeKind::Plain(Attribute::Method))));
        // Display keeps the authored attribute.
        assert_eq!(c.to_string(), "<Method-EQ-GET>");
    }

    #[test]
    fn test_validation_failures() {
        assert!(prepared("bogus", "EQ", "x").is_err());
        assert!(prepared("senderName", "LIKE", "x").is_err());
        assert!(prepared("senderName", "GT", "3").is_err());
        assert!(prepared("senderLabel[app]", "GE", "3").is_err());
        assert!(prepared("senderLabel[]", "EQ", "3").is_err());
        assert!(prepared("senderLabel[app", "EQ", "3").is_err());
        assert!(prepared("$sender.port", "EQ", "3").is_err());
        assert!(prepared("receiverPort", "EQ", "eighty").is_err());
        assert!(prepared("encryptionVersion", "RE", "1.*").is_err());
        assert!(prepared("encryptionVersion", "GE", "tls").is_err());
        assert!(prepared("jsonpath:$.a", "GT", "many").is_err());
        assert!(prepared("jsonpath:a.b", "EQ", "x").is_err());
        assert!(prepared("path", "RE", "(unclosed").is_err());
        assert!(prepared("path", "IN", " , ").is_err());
    }

    #[test]
    fn test_numeric_and_regex_forms() {
        let c = prepared("encryptionVersion", "GE", "1.2").unwrap();
        let d = c.derived().unwrap();
        assert_eq!(d.float, Some(1.2));
        assert_eq!(d.int, None);

        let c = prepared("jsonpath:$.mem", "LT", "512Mi").unwrap();
        assert_eq!(c.derived().unwrap().float, Some(512.0 * 1024.0 * 1024.0));

        let c = prepared("method", "IN", "GET,POST").unwrap();
        let re = c.derived().unwrap().regex.as_ref().unwrap();
        assert!(re.is_match("POST"));
        assert!(!re.is_match("POSTX"));

        let c = prepared("senderName", "EQ", "srv-*").unwrap();
        let wildcard = c.derived().unwrap().wildcard.as_ref().unwrap();
        assert!(wildcard.is_match("srv-abc"));
        assert!(c.derived().unwrap().regex.is_none());
    }

    #[test]
    fn test_predefined_references() {
        let table = PredefinedStringsAndLists::from_yaml(
            "predefinedStrings:\n  svc: api\npredefinedLists:\n  verbs: [GET, PUT]\n",
        )
        .unwrap();

        let mut c = Condition::new("senderName", "EQ", "#svc");
        c.prepare_and_validate(&table).unwrap();
        assert_eq!(c.derived().unwrap().value, "api");
        assert_eq!(c.to_string(), "<senderName-EQ-#svc>");

        let mut c = Condition::new("method", "NIN", "#verbs");
        c.prepare_and_validate(&table).unwrap();
        assert_eq!(c.derived().unwrap().items, vec!["GET", "PUT"]);

        let mut c = Condition::new("method", "EQ", "#verbs");
        assert!(c.prepare_and_validate(&table).is_err());

        let mut c = Condition::new("method", "EQ", "#missing");
        assert!(matches!(
            c.prepare_and_validate(&table),
            Err(PolicyError::UndefinedReference(_))
        ));
    }

    #[test]
    fn test_prepare_is_idempotent() {
        let mut c = Condition::new("path", "RE", "^/api");
        let table = PredefinedStringsAndLists::new();
        c.prepare_and_validate(&table).unwrap();
        c.prepare_and_validate(&table).unwrap();
        assert!(c.is_prepared());
    }
}
