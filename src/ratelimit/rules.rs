//! Rate limit policies and first-match route lookup.
//!
//! Policies are defined once at startup from a static, ordered list of
//! `(method, path_prefix, interval, max_requests)` rules. Lookup is a linear
//! scan: the first policy whose method matches (case-insensitively) and whose
//! path prefix is a literal prefix of the request path wins, so registration
//! order is part of the configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, TurnstileError};

/// A validated `(interval, max_requests)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quota {
    interval_ms: u64,
    max_requests: u64,
}

impl Quota {
    /// Create a quota allowing `max_requests` calls per trailing `interval`.
    ///
    /// Fails when the interval is shorter than one millisecond or the
    /// capacity is zero.
    pub fn new(interval: Duration, max_requests: u64) -> Result<Self> {
        let interval_ms = u64::try_from(interval.as_millis()).map_err(|_| {
            TurnstileError::Config(format!("interval {:?} is too large", interval))
        })?;
        if interval_ms == 0 {
            return Err(TurnstileError::Config(format!(
                "interval must be at least 1ms, got {:?}",
                interval
            )));
        }
        if max_requests == 0 {
            return Err(TurnstileError::Config(
                "max_requests must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            interval_ms,
            max_requests,
        })
    }

    /// Convenience constructor for whole-second windows.
    pub fn per_seconds(interval_secs: u64, max_requests: u64) -> Result<Self> {
        Self::new(Duration::from_secs(interval_secs), max_requests)
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }
}

/// A policy rule as written in configuration files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// HTTP method to match (case-insensitive)
    pub method: String,
    /// Literal prefix of the request path
    pub path_prefix: String,
    /// Window length in seconds
    pub interval_secs: u64,
    /// Maximum admissions inside the window
    pub max_requests: u64,
}

/// An immutable route policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    method: String,
    path_prefix: String,
    quota: Quota,
}

impl Policy {
    pub fn new(
        method: impl Into<String>,
        path_prefix: impl Into<String>,
        interval: Duration,
        max_requests: u64,
    ) -> Result<Self> {
        let method = method.into().trim().to_ascii_uppercase();
        if method.is_empty() {
            return Err(TurnstileError::Config("policy method must not be empty".to_string()));
        }
        Ok(Self {
            method,
            path_prefix: path_prefix.into(),
            quota: Quota::new(interval, max_requests)?,
        })
    }

    /// Upper-cased HTTP method.
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path_prefix(&self) -> &str {
        &self.path_prefix
    }

    pub fn quota(&self) -> Quota {
        self.quota
    }

    /// Whether this policy applies to a call.
    pub fn matches(&self, method: &str, path: &str) -> bool {
        self.method.eq_ignore_ascii_case(method) && path.starts_with(&self.path_prefix)
    }
}

impl TryFrom<&PolicyRule> for Policy {
    type Error = TurnstileError;

    fn try_from(rule: &PolicyRule) -> Result<Self> {
        Policy::new(
            rule.method.as_str(),
            rule.path_prefix.as_str(),
            Duration::from_secs(rule.interval_secs),
            rule.max_requests,
        )
        .map_err(|e| match e {
            TurnstileError::Config(msg) => TurnstileError::Config(format!(
                "invalid policy {} {}: {}",
                rule.method, rule.path_prefix, msg
            )),
            other => other,
        })
    }
}

/// Ordered, immutable list of route policies.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    policies: Vec<Policy>,
}

impl PolicyRegistry {
    pub fn new(policies: Vec<Policy>) -> Self {
        Self { policies }
    }

    /// Build a registry from configuration rules, failing on the first
    /// malformed rule.
    pub fn from_rules(rules: &[PolicyRule]) -> Result<Self> {
        let policies = rules.iter().map(Policy::try_from).collect::<Result<Vec<_>>>()?;
        Ok(Self::new(policies))
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules: Vec<PolicyRule> = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse policies: {}", e)))?;
        Self::from_rules(&rules)
    }

    /// Find the first policy that applies to `method` and `path`.
    ///
    /// `None` means the call is not rate limited.
    pub fn find_policy(&self, method: &str, path: &str) -> Option<&Policy> {
        self.policies.iter().find(|p| p.matches(method, path))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Policy> {
        self.policies.iter()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(method: &str, path_prefix: &str, interval_secs: u64, max_requests: u64) -> PolicyRule {
        PolicyRule {
            method: method.to_string(),
            path_prefix: path_prefix.to_string(),
            interval_secs,
            max_requests,
        }
    }

    #[test]
    fn test_prefix_and_method_matching() {
        let registry = PolicyRegistry::from_rules(&[rule("GET", "/a/", 10, 5)]).unwrap();

        let policy = registry.find_policy("GET", "/a/b").unwrap();
        assert_eq!(policy.quota().max_requests(), 5);
        assert_eq!(policy.quota().interval_ms(), 10_000);

        assert!(registry.find_policy("POST", "/a/b").is_none());
        assert!(registry.find_policy("GET", "/b").is_none());
    }

    #[test]
    fn test_method_is_case_insensitive() {
        let registry = PolicyRegistry::from_rules(&[rule("get", "/a/", 10, 5)]).unwrap();

        assert!(registry.find_policy("GET", "/a/x").is_some());
        assert!(registry.find_policy("Get", "/a/x").is_some());
        assert_eq!(registry.iter().next().unwrap().method(), "GET");
    }

    #[test]
    fn test_first_match_wins() {
        let registry = PolicyRegistry::from_rules(&[
            rule("GET", "/api/", 60, 100),
            rule("GET", "/api/search", 60, 10),
        ])
        .unwrap();

        let policy = registry.find_policy("GET", "/api/search?q=x").unwrap();
        assert_eq!(policy.path_prefix(), "/api/");
        assert_eq!(policy.quota().max_requests(), 100);
    }

    #[test]
    fn test_empty_registry_matches_nothing() {
        let registry = PolicyRegistry::default();
        assert!(registry.is_empty());
        assert!(registry.find_policy("GET", "/").is_none());
    }

    #[test]
    fn test_invalid_rules_fail_fast() {
        let err = PolicyRegistry::from_rules(&[rule("GET", "/a/", 0, 5)]).unwrap_err();
        assert!(matches!(err, TurnstileError::Config(ref msg) if msg.contains("GET /a/")));

        assert!(PolicyRegistry::from_rules(&[rule("GET", "/a/", 10, 0)]).is_err());
        assert!(PolicyRegistry::from_rules(&[rule(" ", "/a/", 10, 1)]).is_err());
    }

    #[test]
    fn test_parse_yaml_rules() {
        let yaml = r#"
- method: GET
  path_prefix: /openapi/v1/product/
  interval_secs: 60
  max_requests: 60
- method: POST
  path_prefix: /login
  interval_secs: 300
  max_requests: 5
"#;
        let registry = PolicyRegistry::from_yaml(yaml).unwrap();
        assert_eq!(registry.len(), 2);

        let login = registry.find_policy("post", "/login/otp").unwrap();
        assert_eq!(login.quota().interval(), Duration::from_secs(300));
    }

    #[test]
    fn test_quota_validation() {
        assert!(Quota::new(Duration::from_micros(500), 1).is_err());
        assert!(Quota::per_seconds(0, 1).is_err());
        assert!(Quota::per_seconds(1, 0).is_err());

        let quota = Quota::new(Duration::from_millis(1500), 3).unwrap();
        assert_eq!(quota.interval_ms(), 1500);
        assert_eq!(quota.max_requests(), 3);
    }
}
