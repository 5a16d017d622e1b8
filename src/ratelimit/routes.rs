//! Protected operations and their rate limit metadata.
//!
//! The table is built once at startup, from configuration or the builder,
//! and only read afterwards. A route missing from the table is not rate
//! limited.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::key::KeySpec;
use super::policy::RateLimitPolicy;
use crate::error::{RateKeeperError, Result};

/// Rate limit metadata of one protected operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSpec {
    /// Route identifier, as the routing layer names it
    pub route: String,
    /// Inline policy taking precedence over the registry
    #[serde(default)]
    pub limit: Option<RateLimitPolicy>,
    /// Key sources beyond the client IP
    #[serde(default)]
    pub keys: KeySpec,
}

impl RouteSpec {
    pub fn new(route: impl Into<String>, keys: KeySpec) -> Self {
        Self {
            route: route.into(),
            limit: None,
            keys,
        }
    }

    /// Attach an inline policy.
    pub fn with_limit(mut self, limit: RateLimitPolicy) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Lookup table from route identifier to its metadata.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, RouteSpec>,
}

impl RouteTable {
    /// Start building a table.
    pub fn builder() -> RouteTableBuilder {
        RouteTableBuilder::default()
    }

    /// Build a table from route specs, validating inline policies.
    ///
    /// Declaring the same route twice is a configuration error.
    pub fn from_specs(specs: impl IntoIterator<Item = RouteSpec>) -> Result<Self> {
        let mut routes = HashMap::new();
        for spec in specs {
            if spec.route.trim().is_empty() {
                return Err(RateKeeperError::Config("route identifier must not be empty".into()));
            }
            if let Some(limit) = &spec.limit {
                limit.validate().map_err(|e| {
                    RateKeeperError::InvalidPolicy(format!("route {}: {}", spec.route, e))
                })?;
            }
            if routes.contains_key(&spec.route) {
                return Err(RateKeeperError::Config(format!(
                    "route {} declared more than once",
                    spec.route
                )));
            }
            routes.insert(spec.route.clone(), spec);
        }
        Ok(Self { routes })
    }

    /// Metadata for a route, if it is protected.
    pub fn get(&self, route: &str) -> Option<&RouteSpec> {
        self.routes.get(route)
    }

    /// All protected routes, sorted by identifier.
    pub fn routes(&self) -> Vec<&RouteSpec> {
        let mut routes: Vec<&RouteSpec> = self.routes.values().collect();
        routes.sort_by(|a, b| a.route.cmp(&b.route));
        routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Builder for [`RouteTable`].
#[derive(Debug, Default)]
pub struct RouteTableBuilder {
    specs: Vec<RouteSpec>,
}

impl RouteTableBuilder {
    /// Protect a route with the registry policy.
    pub fn route(mut self, route: impl Into<String>, keys: KeySpec) -> Self {
        self.specs.push(RouteSpec::new(route, keys));
        self
    }

    /// Protect a route with an inline policy.
    pub fn route_with_limit(
        mut self,
        route: impl Into<String>,
        keys: KeySpec,
        limit: RateLimitPolicy,
    ) -> Self {
        self.specs.push(RouteSpec::new(route, keys).with_limit(limit));
        self
    }

    /// Add a prepared spec.
    pub fn spec(mut self, spec: RouteSpec) -> Self {
        self.specs.push(spec);
        self
    }

    pub fn build(self) -> Result<RouteTable> {
        RouteTable::from_specs(self.specs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_lookup() {
        let table = RouteTable::builder()
            .route("login", KeySpec::new().header(["X-Client-Id"]))
            .route_with_limit(
                "signup",
                KeySpec::new(),
                RateLimitPolicy::new(2, 2, 60).unwrap(),
            )
            .build()
            .unwrap();

        assert_eq!(table.len(), 2);
        assert!(table.get("login").unwrap().limit.is_none());
        assert_eq!(table.get("signup").unwrap().limit.unwrap().capacity, 2);
        assert!(table.get("health").is_none());
    }

    #[test]
    fn test_duplicate_route_rejected() {
        let result = RouteTable::builder()
            .route("login", KeySpec::new())
            .route("login", KeySpec::new())
            .build();
        assert!(matches!(result, Err(RateKeeperError::Config(_))));
    }

    #[test]
    fn test_invalid_inline_limit_rejected() {
        let result = RouteTable::builder()
            .spec(RouteSpec {
                route: "login".into(),
                limit: Some(RateLimitPolicy {
                    capacity: 1,
                    refill_tokens: 1,
                    refill_period_secs: 0,
                }),
                keys: KeySpec::new(),
            })
            .build();
        assert!(matches!(result, Err(RateKeeperError::InvalidPolicy(_))));
    }

    #[test]
    fn test_routes_sorted() {
        let table = RouteTable::builder()
            .route("b", KeySpec::new())
            .route("a", KeySpec::new())
            .build()
            .unwrap();

        let names: Vec<&str> = table.routes().iter().map(|r| r.route.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_route_spec_from_yaml() {
        let yaml = r#"
route: login
limit:
  capacity: 3
  refill_tokens: 1
  refill_period_secs: 20
keys:
  - source: body_field
    names: [username]
"#;
        let spec: RouteSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.route, "login");
        assert_eq!(spec.limit, Some(RateLimitPolicy::new(3, 1, 20).unwrap()));
        assert_eq!(spec.keys.sources().len(), 1);
    }
}
