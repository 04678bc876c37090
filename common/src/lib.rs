//! cflb Common Types
//!
//! Core data structures shared by the controller: resource keys, ingress
//! records and the helpers that derive public hostnames and internal
//! addresses from a Service.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Separator between name and namespace in a generated hostname
pub const HOSTNAME_SEPARATOR: char = '-';

/// Separator between namespace and name in a canonical key
pub const KEY_SEPARATOR: char = '/';

/// Errors produced when parsing a canonical `namespace/name` key
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("unexpected key format: {0:?}")]
    Malformed(String),

    #[error("key {0:?} has an empty name")]
    EmptyName(String),
}

/// Identifier of a reconciled resource (`namespace/name`)
///
/// Cluster-scoped resources have an empty namespace and render as `name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    namespace: String,
    name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}{}{}", self.namespace, KEY_SEPARATOR, self.name)
        }
    }
}

impl FromStr for ResourceKey {
    type Err = KeyError;

    /// Accepts `name` or `namespace/name`; anything with more separators is rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(KEY_SEPARATOR);
        let key = match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) => ResourceKey::new("", name),
            (Some(namespace), Some(name), None) => ResourceKey::new(namespace, name),
            _ => return Err(KeyError::Malformed(s.to_string())),
        };

        if key.name.is_empty() {
            return Err(KeyError::EmptyName(s.to_string()));
        }
        Ok(key)
    }
}

/// One public hostname -> internal address mapping
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IngressRecord {
    /// Public hostname served by the tunnel
    pub hostname: String,
    /// Internal cluster address, `host:port`
    pub internal_address: String,
}

impl IngressRecord {
    pub fn new(hostname: impl Into<String>, internal_address: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            internal_address: internal_address.into(),
        }
    }
}

/// Deterministic public hostname for a Service: `<name>-<namespace>`
pub fn service_hostname(name: &str, namespace: &str) -> String {
    let mut hostname = String::with_capacity(name.len() + namespace.len() + 1);
    hostname.push_str(name);
    hostname.push(HOSTNAME_SEPARATOR);
    hostname.push_str(namespace);
    hostname
}

/// Join host and port, bracketing IPv6 literals (`[fd00::1]:80`)
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
