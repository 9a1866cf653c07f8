//! Sender / receiver, resource and operation matchers.
//!
//! Built once when a rule is prepared; matching is read-only.

use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;
use regex::{Regex, RegexBuilder};

use crate::conditions::units;
use crate::error::{PolicyError, Result};
use crate::message::{Endpoint, Message};
use crate::predefined::{PredefinedStringsAndLists, Resolved};

// ============================================================================
// Endpoints
// ============================================================================

/// How a sender / receiver name is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EndpointKind {
    /// Wildcard over the service name.
    #[default]
    Workload,
    /// Wildcard over the host name.
    Hostname,
    /// IP address or CIDR over the endpoint IP.
    Subnet,
}

impl EndpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointKind::Workload => "workload",
            EndpointKind::Hostname => "hostname",
            EndpointKind::Subnet => "subnet",
        }
    }

    /// The endpoint field this kind matches against.
    fn target<'a>(&self, endpoint: &'a Endpoint) -> &'a str {
        match self {
            EndpointKind::Workload => &endpoint.service,
            EndpointKind::Hostname => &endpoint.host,
            EndpointKind::Subnet => &endpoint.ip,
        }
    }
}

impl FromStr for EndpointKind {
    type Err = PolicyError;

    /// Empty means `workload`.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "workload" => Ok(EndpointKind::Workload),
            "hostname" => Ok(EndpointKind::Hostname),
            "subnet" => Ok(EndpointKind::Subnet),
            other => Err(PolicyError::invalid(format!("unsupported endpoint type '{}'", other))),
        }
    }
}

/// One expanded sender / receiver matcher.
#[derive(Debug, Clone)]
pub enum EndpointMatcher {
    Any,
    Pattern(Regex),
    Ip(IpAddr),
    Cidr(IpNet),
}

impl EndpointMatcher {
    /// Build a matcher for a single name.
    pub fn build(kind: EndpointKind, name: &str) -> Result<Self> {
        let name = name.trim();
        if name.is_empty() || name == "*" {
            return Ok(EndpointMatcher::Any);
        }
        match kind {
            EndpointKind::Workload | EndpointKind::Hostname => {
                Ok(EndpointMatcher::Pattern(Regex::new(&units::wildcard_to_regex(name))?))
            }
            EndpointKind::Subnet => {
                if let Ok(ip) = name.parse::<IpAddr>() {
                    Ok(EndpointMatcher::Ip(ip))
                } else if let Ok(net) = name.parse::<IpNet>() {
                    Ok(EndpointMatcher::Cidr(net))
                } else {
                    Err(PolicyError::invalid(format!(
                        "'{}' is neither an IP address nor a CIDR",
                        name
                    )))
                }
            }
        }
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            EndpointMatcher::Any => true,
            EndpointMatcher::Pattern(re) => re.is_match(value),
            EndpointMatcher::Ip(ip) => value.trim().parse::<IpAddr>().is_ok_and(|v| v == *ip),
            EndpointMatcher::Cidr(net) => {
                value.trim().parse::<IpAddr>().is_ok_and(|v| net.contains(&v))
            }
        }
    }
}

/// A sender or receiver clause: every name expanded to a matcher.
#[derive(Debug, Clone)]
pub struct EndpointRule {
    pub kind: EndpointKind,
    pub matchers: Vec<EndpointMatcher>,
}

impl EndpointRule {
    /// Expand `name` (a literal, a comma list, or a `#name` reference).
    pub fn build(
        kind: &str,
        name: &str,
        predefined: &PredefinedStringsAndLists,
    ) -> Result<Self> {
        let kind: EndpointKind = kind.parse()?;
        let names = match predefined.resolve(name.trim())? {
            Resolved::Literal(value) => units::split_list(&value),
            Resolved::List(items) => items,
        };
        let matchers = if names.is_empty() {
            vec![EndpointMatcher::Any]
        } else {
            names
                .iter()
                .map(|n| EndpointMatcher::build(kind, n))
                .collect::<Result<Vec<_>>>()?
        };
        Ok(Self { kind, matchers })
    }

    /// True if any matcher accepts the endpoint.
    pub fn matches(&self, endpoint: &Endpoint) -> bool {
        let value = self.kind.target(endpoint);
        self.matchers.iter().any(|m| m.matches(value))
    }
}

// ============================================================================
// Resource and operation
// ============================================================================

/// What the resource name is compared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Any,
    Path,
    Port,
}

/// Resource clause: protocol plus a typed name pattern.
#[derive(Debug, Clone)]
pub struct ResourceMatcher {
    /// Lowercased protocol; `None` matches any.
    protocol: Option<String>,
    kind: ResourceKind,
    pattern: Option<Regex>,
}

impl ResourceMatcher {
    pub fn build(protocol: &str, resource_type: &str, resource_name: &str) -> Result<Self> {
        let protocol = match protocol.trim() {
            "" | "*" => None,
            p => Some(p.to_lowercase()),
        };
        let kind = match resource_type.trim().to_lowercase().as_str() {
            "" | "*" => ResourceKind::Any,
            "path" => ResourceKind::Path,
            "port" => ResourceKind::Port,
            other => {
                return Err(PolicyError::invalid(format!(
                    "unsupported resource type '{}'",
                    other
                )))
            }
        };
        let name = resource_name.trim();
        let pattern = if kind == ResourceKind::Any || name.is_empty() || name == "*" {
            None
        } else {
            Some(Regex::new(&units::wildcard_to_regex(name))?)
        };
        Ok(Self {
            protocol,
            kind,
            pattern,
        })
    }

    pub fn matches(&self, message: &Message) -> bool {
        if let Some(protocol) = &self.protocol {
            if !message.request.protocol.eq_ignore_ascii_case(protocol) {
                return false;
            }
        }
        let Some(pattern) = &self.pattern else {
            return true;
        };
        match self.kind {
            ResourceKind::Any => true,
            ResourceKind::Path => pattern.is_match(&message.request.path),
            ResourceKind::Port => message
                .receiver
                .port
                .is_some_and(|port| pattern.is_match(&port.to_string())),
        }
    }
}

/// Case-insensitive wildcard over the request method. `None` matches any.
pub fn operation_regex(operation: &str) -> Result<Option<Regex>> {
    let items = units::split_list(operation);
    if items.is_empty() || items.iter().any(|i| i == "*") {
        return Ok(None);
    }
    let pattern = items
        .iter()
        .map(|i| units::wildcard_to_regex(i))
        .collect::<Vec<_>>()
        .join("|");
    Ok(Some(
        RegexBuilder::new(&pattern).case_insensitive(true).build()?,
    ))
}
