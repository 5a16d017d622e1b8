//! Composite rate limit keys and their resolution from requests.
//!
//! A key always starts with the client IP. Each further source configured for
//! a route (header, path parameter, body field) appends one component when it
//! resolves and is skipped when it does not, so the key degrades gracefully
//! but is never empty.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use tracing::debug;

use super::request::RequestAccessor;

/// Separator between key components.
///
/// Resolved values are escaped (`\\`, `\|`, `\,`) before joining, so a
/// value containing a separator cannot impersonate two components.
pub const KEY_SEPARATOR: &str = "|";
/// Separator between values of one source that lists several names.
pub const SUB_SEPARATOR: &str = ",";
const ESCAPE: char = '\\';
/// Header consulted for the original client address.
pub const DEFAULT_FORWARDED_HEADER: &str = "X-Forwarded-For";
/// IP component used when the host knows neither a forwarded nor a peer address.
pub const UNKNOWN_IP: &str = "unknown";

/// Where a key component comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    /// Client address; always the first component
    Ip,
    /// Request header by name
    Header,
    /// Route parameter captured by the router
    PathVariable,
    /// Field of a JSON body, dot-separated for nesting
    BodyField,
}

impl fmt::Display for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeySource::Ip => "ip",
            KeySource::Header => "header",
            KeySource::PathVariable => "path_variable",
            KeySource::BodyField => "body_field",
        };
        f.write_str(name)
    }
}

/// One configured source with the names to look up, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySourceSpec {
    pub source: KeySource,
    #[serde(default)]
    pub names: Vec<String>,
}

/// Ordered key sources for a protected operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeySpec {
    sources: Vec<KeySourceSpec>,
}

impl KeySpec {
    /// A spec keyed on the client IP only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a source.
    pub fn with_source<I, S>(mut self, source: KeySource, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources.push(KeySourceSpec {
            source,
            names: names.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Append a header source.
    pub fn header<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_source(KeySource::Header, names)
    }

    /// Append a path variable source.
    pub fn path_variable<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_source(KeySource::PathVariable, names)
    }

    /// Append a body field source.
    pub fn body_field<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_source(KeySource::BodyField, names)
    }

    /// The configured sources in declaration order.
    pub fn sources(&self) -> &[KeySourceSpec] {
        &self.sources
    }
}

/// The identity a request is rate limited against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A rate limit key scoped to the route it was resolved for.
///
/// Buckets are stored per route so two protected operations never share a
/// quota for the same client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    /// The route identifier
    pub route: String,
    /// The composite key resolved for the request
    pub key: RateLimitKey,
}

impl BucketKey {
    pub fn new(route: &str, key: RateLimitKey) -> Self {
        Self {
            route: route.to_string(),
            key,
        }
    }

    /// Key string for an external store.
    /// Format: "{prefix}{route}:{key}"
    pub fn to_store_key(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self)
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.route, self.key)
    }
}

/// Why one source contributed nothing to a key.
#[derive(Debug, Error)]
enum KeyResolutionFailure {
    #[error("not present")]
    Missing,
    #[error("blank value")]
    Blank,
    #[error("request has no body")]
    NoBody,
    #[error("body is not valid JSON: {0}")]
    MalformedBody(String),
    #[error("path segment '{0}' not found")]
    PathNotFound(String),
    #[error("value is not a string, number or boolean")]
    NotScalar,
}

/// Lazily parsed request body, shared by all body-field lookups of one key.
enum BodyJson {
    Unparsed,
    Absent,
    Parsed(Value),
    Invalid(String),
}

impl BodyJson {
    fn get(&mut self, request: &dyn RequestAccessor) -> Result<&Value, KeyResolutionFailure> {
        if let BodyJson::Unparsed = self {
            *self = match request.body() {
                None => BodyJson::Absent,
                Some(bytes) => match serde_json::from_slice::<Value>(bytes) {
                    Ok(value) => BodyJson::Parsed(value),
                    Err(e) => BodyJson::Invalid(e.to_string()),
                },
            };
        }

        match self {
            BodyJson::Parsed(value) => Ok(value),
            BodyJson::Invalid(reason) => Err(KeyResolutionFailure::MalformedBody(reason.clone())),
            BodyJson::Unparsed | BodyJson::Absent => Err(KeyResolutionFailure::NoBody),
        }
    }
}

/// Builds composite keys from requests.
#[derive(Debug, Clone)]
pub struct KeyResolver {
    forwarded_header: String,
}

impl KeyResolver {
    /// Create a resolver reading the client address from `X-Forwarded-For`.
    pub fn new() -> Self {
        Self::with_forwarded_header(DEFAULT_FORWARDED_HEADER)
    }

    /// Create a resolver reading the client address from a custom header.
    pub fn with_forwarded_header(header: impl Into<String>) -> Self {
        Self {
            forwarded_header: header.into(),
        }
    }

    /// Resolve the composite key for a request.
    ///
    /// Never fails: sources that cannot be resolved are logged and skipped.
    pub fn resolve(&self, request: &dyn RequestAccessor, spec: &KeySpec) -> RateLimitKey {
        let mut components = vec![escape(&self.resolve_ip(request)).into_owned()];
        let mut body = BodyJson::Unparsed;

        for entry in spec.sources() {
            if entry.source == KeySource::Ip {
                // Already the first component
                continue;
            }

            let values: Vec<String> = entry
                .names
                .iter()
                .filter_map(|name| match resolve_one(request, entry.source, name, &mut body) {
                    Ok(value) => Some(escape(&value).into_owned()),
                    Err(reason) => {
                        debug!(
                            source = %entry.source,
                            name = %name,
                            reason = %reason,
                            "Key source unresolved, skipping"
                        );
                        None
                    }
                })
                .collect();

            if !values.is_empty() {
                components.push(values.join(SUB_SEPARATOR));
            }
        }

        RateLimitKey(components.join(KEY_SEPARATOR))
    }

    /// First forwarded address if present, else the peer address.
    fn resolve_ip(&self, request: &dyn RequestAccessor) -> String {
        let forwarded = request
            .header(&self.forwarded_header)
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty());

        if let Some(ip) = forwarded {
            return ip.to_string();
        }

        match request.peer_addr() {
            Some(addr) => addr.ip().to_string(),
            None => {
                debug!("No forwarded or peer address on request");
                UNKNOWN_IP.to_string()
            }
        }
    }
}

impl Default for KeyResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve_one(
    request: &dyn RequestAccessor,
    source: KeySource,
    name: &str,
    body: &mut BodyJson,
) -> Result<String, KeyResolutionFailure> {
    let value = match source {
        KeySource::Ip => return Err(KeyResolutionFailure::Missing),
        KeySource::Header => request
            .header(name)
            .map(str::to_string)
            .ok_or(KeyResolutionFailure::Missing)?,
        KeySource::PathVariable => request
            .path_param(name)
            .map(str::to_string)
            .ok_or(KeyResolutionFailure::Missing)?,
        KeySource::BodyField => body_field(body.get(request)?, name)?,
    };

    if value.trim().is_empty() {
        return Err(KeyResolutionFailure::Blank);
    }
    Ok(value)
}

/// Backslash-escape separators and the escape character itself.
fn escape(value: &str) -> Cow<'_, str> {
    let needs_escape =
        |c: char| c == ESCAPE || KEY_SEPARATOR.contains(c) || SUB_SEPARATOR.contains(c);
    if !value.contains(needs_escape) {
        return Cow::Borrowed(value);
    }

    let mut escaped = String::with_capacity(value.len() + 4);
    for c in value.chars() {
        if needs_escape(c) {
            escaped.push(ESCAPE);
        }
        escaped.push(c);
    }
    Cow::Owned(escaped)
}

/// Walk a dot-separated path into a JSON value and render the leaf as text.
///
/// Numeric segments index into arrays.
fn body_field(root: &Value, path: &str) -> Result<String, KeyResolutionFailure> {
    let mut current = root;
    for segment in path.split('.') {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        current = next.ok_or_else(|| KeyResolutionFailure::PathNotFound(segment.to_string()))?;
    }

    match current {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null | Value::Object(_) | Value::Array(_) => Err(KeyResolutionFailure::NotScalar),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::request::RequestParts;
    use std::net::SocketAddr;

    fn peer(ip: &str) -> SocketAddr {
        format!("{}:40000", ip).parse().unwrap()
    }

    #[test]
    fn test_ip_only_key_uses_peer_address() {
        let resolver = KeyResolver::new();
        let request = RequestParts::new().with_peer_addr(peer("1.2.3.4"));

        let key = resolver.resolve(&request, &KeySpec::new());
        assert_eq!(key.as_str(), "1.2.3.4");
    }

    #[test]
    fn test_forwarded_header_first_entry_wins() {
        let resolver = KeyResolver::new();
        let request = RequestParts::new()
            .with_peer_addr(peer("10.0.0.1"))
            .with_header("X-Forwarded-For", " 203.0.113.7 , 10.0.0.1");

        let key = resolver.resolve(&request, &KeySpec::new());
        assert_eq!(key.as_str(), "203.0.113.7");
    }

    #[test]
    fn test_blank_forwarded_header_falls_back_to_peer() {
        let resolver = KeyResolver::new();
        let request = RequestParts::new()
            .with_peer_addr(peer("10.0.0.1"))
            .with_header("X-Forwarded-For", "   ");

        let key = resolver.resolve(&request, &KeySpec::new());
        assert_eq!(key.as_str(), "10.0.0.1");
    }

    #[test]
    fn test_custom_forwarded_header() {
        let resolver = KeyResolver::with_forwarded_header("X-Real-IP");
        let request = RequestParts::new()
            .with_peer_addr(peer("10.0.0.1"))
            .with_header("X-Forwarded-For", "1.1.1.1")
            .with_header("X-Real-IP", "2.2.2.2");

        assert_eq!(resolver.resolve(&request, &KeySpec::new()).as_str(), "2.2.2.2");
    }

    #[test]
    fn test_key_never_blank_without_any_address() {
        let resolver = KeyResolver::new();
        let spec = KeySpec::new()
            .header(["X-Client-Id"])
            .path_variable(["tenant"])
            .body_field(["user.id"]);

        let key = resolver.resolve(&RequestParts::new(), &spec);
        assert_eq!(key.as_str(), UNKNOWN_IP);
    }

    #[test]
    fn test_components_in_declared_order() {
        let resolver = KeyResolver::new();
        let spec = KeySpec::new()
            .path_variable(["tenant"])
            .header(["X-Client-Id"])
            .body_field(["username"]);
        let request = RequestParts::new()
            .with_peer_addr(peer("1.2.3.4"))
            .with_header("X-Client-Id", "alice-client")
            .with_path_param("tenant", "acme")
            .with_body(r#"{"username":"alice"}"#);

        let key = resolver.resolve(&request, &spec);
        assert_eq!(key.as_str(), "1.2.3.4|acme|alice-client|alice");
    }

    #[test]
    fn test_unresolved_sources_are_skipped() {
        let resolver = KeyResolver::new();
        let spec = KeySpec::new()
            .header(["X-Missing"])
            .header(["X-Client-Id"])
            .path_variable(["missing"]);
        let request = RequestParts::new()
            .with_peer_addr(peer("1.2.3.4"))
            .with_header("X-Client-Id", "bob-client");

        let key = resolver.resolve(&request, &spec);
        assert_eq!(key.as_str(), "1.2.3.4|bob-client");
    }

    #[test]
    fn test_blank_header_is_unresolved() {
        let resolver = KeyResolver::new();
        let spec = KeySpec::new().header(["X-Client-Id"]);
        let request = RequestParts::new()
            .with_peer_addr(peer("1.2.3.4"))
            .with_header("X-Client-Id", "  ");

        assert_eq!(resolver.resolve(&request, &spec).as_str(), "1.2.3.4");
    }

    #[test]
    fn test_multiple_names_concatenate_in_order() {
        let resolver = KeyResolver::new();
        let spec = KeySpec::new().header(["X-Tenant", "X-Missing", "X-Client-Id"]);
        let request = RequestParts::new()
            .with_peer_addr(peer("1.2.3.4"))
            .with_header("X-Client-Id", "alice-client")
            .with_header("X-Tenant", "acme");

        let key = resolver.resolve(&request, &spec);
        assert_eq!(key.as_str(), "1.2.3.4|acme,alice-client");
    }

    #[test]
    fn test_separators_in_values_do_not_collide() {
        let resolver = KeyResolver::new();
        let one_source = KeySpec::new().header(["X-Client-Id"]);
        let two_sources = KeySpec::new().header(["X-Client-Id"]).header(["X-Tenant"]);

        let joined = RequestParts::new()
            .with_peer_addr(peer("1.2.3.4"))
            .with_header("X-Client-Id", "alice|acme");
        let split = RequestParts::new()
            .with_peer_addr(peer("1.2.3.4"))
            .with_header("X-Client-Id", "alice")
            .with_header("X-Tenant", "acme");

        let joined_key = resolver.resolve(&joined, &one_source);
        let split_key = resolver.resolve(&split, &two_sources);
        assert_eq!(joined_key.as_str(), r"1.2.3.4|alice\|acme");
        assert_eq!(split_key.as_str(), "1.2.3.4|alice|acme");
        assert_ne!(joined_key, split_key);
    }

    #[test]
    fn test_sub_separator_and_escape_are_escaped() {
        let resolver = KeyResolver::new();
        let spec = KeySpec::new().header(["X-A", "X-B"]);
        let request = RequestParts::new()
            .with_peer_addr(peer("1.2.3.4"))
            .with_header("X-A", "a,b")
            .with_header("X-B", r"c\");

        let key = resolver.resolve(&request, &spec);
        assert_eq!(key.as_str(), r"1.2.3.4|a\,b,c\\");
    }

    #[test]
    fn test_nested_body_field() {
        let resolver = KeyResolver::new();
        let spec = KeySpec::new().body_field(["user.id", "user.roles.0", "user.active"]);
        let request = RequestParts::new()
            .with_peer_addr(peer("1.2.3.4"))
            .with_body(r#"{"user":{"id":42,"roles":["admin"],"active":true}}"#);

        let key = resolver.resolve(&request, &spec);
        assert_eq!(key.as_str(), "1.2.3.4|42,admin,true");
    }

    #[test]
    fn test_body_field_non_scalar_and_missing_unresolved() {
        let resolver = KeyResolver::new();
        let spec = KeySpec::new().body_field(["user", "user.name.first", "nothing", "gone"]);
        let request = RequestParts::new()
            .with_peer_addr(peer("1.2.3.4"))
            .with_body(r#"{"user":{"name":"alice"},"gone":null}"#);

        assert_eq!(resolver.resolve(&request, &spec).as_str(), "1.2.3.4");
    }

    #[test]
    fn test_malformed_body_degrades_to_remaining_components() {
        let resolver = KeyResolver::new();
        let spec = KeySpec::new().body_field(["username"]).header(["X-Client-Id"]);
        let request = RequestParts::new()
            .with_peer_addr(peer("1.2.3.4"))
            .with_header("X-Client-Id", "alice-client")
            .with_body("{not json");

        assert_eq!(resolver.resolve(&request, &spec).as_str(), "1.2.3.4|alice-client");
    }

    #[test]
    fn test_explicit_ip_source_not_duplicated() {
        let resolver = KeyResolver::new();
        let spec = KeySpec::new().with_source(KeySource::Ip, Vec::<String>::new());
        let request = RequestParts::new().with_peer_addr(peer("1.2.3.4"));

        assert_eq!(resolver.resolve(&request, &spec).as_str(), "1.2.3.4");
    }

    #[test]
    fn test_bucket_key_store_format() {
        let resolver = KeyResolver::new();
        let request = RequestParts::new().with_peer_addr(peer("1.2.3.4"));
        let key = BucketKey::new("login", resolver.resolve(&request, &KeySpec::new()));

        assert_eq!(key.to_string(), "login:1.2.3.4");
        assert_eq!(key.to_store_key("ratekeeper:"), "ratekeeper:login:1.2.3.4");
    }

    #[test]
    fn test_key_spec_deserializes_from_yaml() {
        let yaml = r#"
- source: header
  names: [X-Client-Id]
- source: body_field
  names: [user.id, username]
"#;
        let spec: KeySpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.sources().len(), 2);
        assert_eq!(spec.sources()[0].source, KeySource::Header);
        assert_eq!(spec.sources()[1].names, vec!["user.id", "username"]);
    }
}
