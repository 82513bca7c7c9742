//! Rate limit key generation.

use std::fmt::Write as _;

use crate::error::{Result, TurnstileError};

use super::rules::Policy;

/// A key that uniquely identifies one sliding window in the shared store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    /// Wrap an already-composed key.
    pub fn from_raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Composes rate limit keys from a namespace prefix, a separator, and the
/// per-call components.
///
/// Components are escaped before joining: `%` and the first character of
/// the separator are percent-encoded. A component therefore never contains
/// the separator, and two different component lists never produce the same
/// key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBuilder {
    prefix: String,
    separator: String,
}

impl KeyBuilder {
    /// Create a key builder.
    ///
    /// The prefix and separator must be non-empty and the separator must not
    /// contain `%`.
    pub fn new(prefix: impl Into<String>, separator: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        let separator = separator.into();

        if prefix.is_empty() {
            return Err(TurnstileError::Config("key prefix must not be empty".to_string()));
        }
        if separator.is_empty() {
            return Err(TurnstileError::Config("key separator must not be empty".to_string()));
        }
        if separator.contains('%') {
            return Err(TurnstileError::Config(format!(
                "key separator {:?} must not contain '%'",
                separator
            )));
        }

        Ok(Self { prefix, separator })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Key of a per-identity window: `prefix SEP identity`.
    pub fn for_identity(&self, identity: &str) -> RateLimitKey {
        self.compose(&[identity])
    }

    /// Key of a per-route window: `prefix SEP METHOD SEP path_prefix SEP identity`.
    pub fn for_route(&self, policy: &Policy, identity: &str) -> RateLimitKey {
        self.compose(&[policy.method(), policy.path_prefix(), identity])
    }

    fn compose(&self, components: &[&str]) -> RateLimitKey {
        let mut key = self.escape(&self.prefix);
        for component in components {
            key.push_str(&self.separator);
            key.push_str(&self.escape(component));
        }
        RateLimitKey(key)
    }

    fn escape(&self, component: &str) -> String {
        let reserved = self.separator.chars().next();
        let mut escaped = String::with_capacity(component.len());
        for c in component.chars() {
            if c == '%' || Some(c) == reserved {
                let mut buf = [0u8; 4];
                for byte in c.encode_utf8(&mut buf).bytes() {
                    // Writing to a String cannot fail.
                    let _ = write!(escaped, "%{:02X}", byte);
                }
            } else {
                escaped.push(c);
            }
        }
        escaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn builder() -> KeyBuilder {
        KeyBuilder::new("rate_limit_sliding_window", ":").unwrap()
    }

    #[test]
    fn test_identity_key() {
        let keys = KeyBuilder::new("product_list", ":").unwrap();
        assert_eq!(keys.for_identity("42").as_str(), "product_list:42");
    }

    #[test]
    fn test_route_key() {
        let policy = Policy::new("GET", "/openapi/v1/product/", Duration::from_secs(60), 60).unwrap();
        let key = builder().for_route(&policy, "1.2.3.4");
        assert_eq!(
            key.as_str(),
            "rate_limit_sliding_window:GET:/openapi/v1/product/:1.2.3.4"
        );
    }

    #[test]
    fn test_prefix_is_escaped_too() {
        let keys = KeyBuilder::new("rate_limit", "_").unwrap();
        assert_eq!(keys.for_identity("7").as_str(), "rate%5Flimit_7");
    }

    #[test]
    fn test_same_window_same_key() {
        let keys = builder();
        assert_eq!(keys.for_identity("alice"), keys.for_identity("alice"));
    }

    #[test]
    fn test_separator_in_component_cannot_collide() {
        let keys = KeyBuilder::new("p", "_").unwrap();
        let policy_a = Policy::new("GET", "/a_b", Duration::from_secs(1), 1).unwrap();
        let policy_b = Policy::new("GET", "/a", Duration::from_secs(1), 1).unwrap();

        let a = keys.for_route(&policy_a, "c");
        let b = keys.for_route(&policy_b, "b_c");
        assert_ne!(a, b);
    }

    #[test]
    fn test_escaped_percent_cannot_forge_separator() {
        let keys = KeyBuilder::new("p", ":").unwrap();
        assert_ne!(keys.for_identity("a%3Ab"), keys.for_identity("a:b"));
        assert_eq!(keys.for_identity("a:b").as_str(), "p:a%3Ab");
        assert_eq!(keys.for_identity("a%3Ab").as_str(), "p:a%253Ab");
    }

    #[test]
    fn test_user_and_route_keys_are_distinct() {
        let keys = KeyBuilder::new("p", ":").unwrap();
        let policy = Policy::new("GET", "/x", Duration::from_secs(1), 1).unwrap();
        assert_ne!(keys.for_identity("GET:/x:ip"), keys.for_route(&policy, "ip"));
    }

    #[test]
    fn test_invalid_builders_rejected() {
        assert!(KeyBuilder::new("", "_").is_err());
        assert!(KeyBuilder::new("p", "").is_err());
        assert!(matches!(
            KeyBuilder::new("p", "%"),
            Err(TurnstileError::Config(_))
        ));
    }
}
