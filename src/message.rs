//! Request attributes ("messages") that rules are checked against.
//!
//! A [`Message`] is built once per request and only read afterwards. The
//! optional JSON body may be supplied either as raw bytes, parsed lazily on
//! first use and cached, or as an already parsed [`Value`].

use std::collections::HashMap;

use chrono::{DateTime, Timelike, Utc};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use serde_json::Value;

/// Which end of the request an attribute refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Sender,
    Receiver,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Sender => "sender",
            Side::Receiver => "receiver",
        }
    }
}

/// Identity of one end of the request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Endpoint {
    /// Workload / service name.
    pub service: String,
    pub ip: String,
    pub namespace: String,
    pub host: String,
    /// Only meaningful on the receiver.
    pub port: Option<i64>,
    pub labels: HashMap<String, String>,
}

impl Endpoint {
    /// Field lookup for `$sender.<field>` / `$receiver.<field>` attributes.
    ///
    /// Empty string fields count as absent.
    pub fn field(&self, name: &str) -> Option<String> {
        let value = match name {
            "name" => self.service.clone(),
            "ip" => self.ip.clone(),
            "namespace" => self.namespace.clone(),
            "host" => self.host.clone(),
            "port" => return self.port.map(|p| p.to_string()),
            _ => return None,
        };
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    }

    /// Object fields known for the given side.
    pub fn known_fields(side: Side) -> &'static [&'static str] {
        match side {
            Side::Sender => &["name", "ip", "namespace", "host"],
            Side::Receiver => &["name", "ip", "namespace", "host", "port"],
        }
    }
}

/// Request metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub protocol: String,
    pub size: Option<i64>,
    pub user_agent: String,
    /// UTC hour of the request timestamp.
    pub hour: Option<i64>,
    /// Minute of the request timestamp, mod 2.
    pub minute_parity: Option<i64>,
    pub encryption_type: String,
    pub encryption_version: Option<f64>,
}

/// A request as seen by the policy engine.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(from = "MessageRaw")]
pub struct Message {
    pub sender: Endpoint,
    pub receiver: Endpoint,
    pub request: Request,
    pub context_type: String,
    json_raw: Option<Vec<u8>>,
    json_object: Option<Value>,
    parsed_raw: OnceCell<Option<Value>>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: sender service name.
    pub fn with_sender(mut self, service: impl Into<String>) -> Self {
        self.sender.service = service.into();
        self
    }

    /// Builder: receiver service name.
    pub fn with_receiver(mut self, service: impl Into<String>) -> Self {
        self.receiver.service = service.into();
        self
    }

    pub fn with_sender_ip(mut self, ip: impl Into<String>) -> Self {
        self.sender.ip = ip.into();
        self
    }

    pub fn with_receiver_ip(mut self, ip: impl Into<String>) -> Self {
        self.receiver.ip = ip.into();
        self
    }

    pub fn with_sender_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.sender.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_receiver_label(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.receiver.labels.insert(key.into(), value.into());
        self
    }

    /// Builder: method, path and protocol in one go.
    pub fn with_request(
        mut self,
        method: impl Into<String>,
        path: impl Into<String>,
        protocol: impl Into<String>,
    ) -> Self {
        self.request.method = method.into();
        self.request.path = path.into();
        self.request.protocol = protocol.into();
        self
    }

    /// Builder: attach the request body as raw bytes.
    ///
    /// The bytes are parsed at most once, on first JSONPath access.
    pub fn with_json_raw(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.json_raw = Some(bytes.into());
        self.json_object = None;
        self.parsed_raw = OnceCell::new();
        self
    }

    /// Builder: attach an already parsed request body.
    pub fn with_json_object(mut self, value: Value) -> Self {
        self.json_object = Some(value);
        self.json_raw = None;
        self.parsed_raw = OnceCell::new();
        self
    }

    /// The request body, if any and if it parses.
    ///
    /// A body that is not valid JSON behaves exactly like a missing one.
    pub fn json_document(&self) -> Option<&Value> {
        if let Some(object) = &self.json_object {
            return Some(object);
        }
        let raw = self.json_raw.as_ref()?;
        self.parsed_raw
            .get_or_init(|| match serde_json::from_slice::<Value>(raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    log::debug!("Request body is not valid JSON: {}", e);
                    None
                }
            })
            .as_ref()
    }

    pub fn endpoint(&self, side: Side) -> &Endpoint {
        match side {
            Side::Sender => &self.sender,
            Side::Receiver => &self.receiver,
        }
    }

    /// Set hour and minute parity from a request timestamp.
    pub fn set_timestamp(&mut self, time: DateTime<Utc>) {
        self.request.hour = Some(time.hour() as i64);
        self.request.minute_parity = Some((time.minute() % 2) as i64);
    }
}

/// Parse a delimited label string (`"app=web,tier=front"`) into a map.
///
/// Pairs may be separated by `,` or `;` and split by `=` or `:`. Pairs
/// without a separator become keys with an empty value.
pub fn parse_labels(raw: &str) -> HashMap<String, String> {
    raw.split(|c| c == ',' || c == ';')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let split = pair.find('=').or_else(|| pair.find(':'));
            match split {
                Some(i) => (
                    pair[..i].trim().to_string(),
                    pair[i + 1..].trim().to_string(),
                ),
                None => (pair.to_string(), String::new()),
            }
        })
        .collect()
}

/// A YAML scalar that may be written as a number or a string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Int(i) => Some(*i),
            Scalar::Float(f) => Some(*f as i64),
            Scalar::Text(s) => s.trim().parse().ok(),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(i) => Some(*i as f64),
            Scalar::Float(f) => Some(*f),
            Scalar::Text(s) => s.trim().parse().ok(),
        }
    }

    fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Scalar::Int(secs) => DateTime::<Utc>::from_timestamp(*secs, 0),
            Scalar::Float(secs) => DateTime::<Utc>::from_timestamp(*secs as i64, 0),
            Scalar::Text(s) => DateTime::parse_from_rfc3339(s.trim())
                .map(|t| t.with_timezone(&Utc))
                .ok()
                .or_else(|| {
                    let secs: i64 = s.trim().parse().ok()?;
                    DateTime::<Utc>::from_timestamp(secs, 0)
                }),
        }
    }
}

/// Wire shape of a message document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct MessageRaw {
    sender_service: String,
    sender_ip: String,
    sender_namespace: String,
    sender_host: String,
    sender_labels: String,
    receiver_service: String,
    receiver_ip: String,
    receiver_namespace: String,
    receiver_host: String,
    receiver_port: Option<Scalar>,
    receiver_labels: String,
    request_method: String,
    request_path: String,
    request_protocol: String,
    request_size: Option<Scalar>,
    request_user_agent: String,
    request_time: Option<Scalar>,
    context_type: String,
    encryption_type: String,
    encryption_version: Option<Scalar>,
}

impl From<MessageRaw> for Message {
    fn from(raw: MessageRaw) -> Self {
        let mut message = Message {
            sender: Endpoint {
                service: raw.sender_service,
                ip: raw.sender_ip,
                namespace: raw.sender_namespace,
                host: raw.sender_host,
                port: None,
                labels: parse_labels(&raw.sender_labels),
            },
            receiver: Endpoint {
                service: raw.receiver_service,
                ip: raw.receiver_ip,
                namespace: raw.receiver_namespace,
                host: raw.receiver_host,
                port: raw.receiver_port.as_ref().and_then(Scalar::as_i64),
                labels: parse_labels(&raw.receiver_labels),
            },
            request: Request {
                method: raw.request_method,
                path: raw.request_path,
                protocol: raw.request_protocol,
                size: raw.request_size.as_ref().and_then(Scalar::as_i64),
                user_agent: raw.request_user_agent,
                hour: None,
                minute_parity: None,
                encryption_type: raw.encryption_type,
                encryption_version: raw.encryption_version.as_ref().and_then(Scalar::as_f64),
            },
            context_type: raw.context_type,
            ..Message::default()
        };
        match raw.request_time.as_ref().map(|t| (t, t.as_time())) {
            Some((_, Some(time))) => message.set_timestamp(time),
            Some((original, None)) => {
                log::debug!("Ignoring unparseable request_time {:?}", original)
            }
            None => {}
        }
        message
    }
}
