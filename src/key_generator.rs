//! # Request-Key Derivation
//!
//! Derives a rate-limit key from request context when a caller embeds the
//! engine directly instead of going through the `/v1/:bucket_type/:key/...`
//! HTTP façade, which already takes an explicit key from the path. Kept
//! separate from [`crate::engine::Engine`] so callers can pick a strategy
//! without the engine itself knowing anything about headers or client IPs.

use std::collections::HashMap;

use crate::error::{validation_code, ThrottlerError};

/// How to derive a key from request context.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyStrategy {
    IpAddress,
    ApiKey,
    UserId,
    Composite(Vec<KeyStrategy>),
}

pub struct KeyGenerator {
    default_strategy: KeyStrategy,
}

impl KeyGenerator {
    pub fn new(strategy: KeyStrategy) -> Self {
        Self { default_strategy: strategy }
    }

    pub fn generate_key(
        &self,
        headers: &HashMap<String, String>,
        client_ip: &str,
        path: &str,
    ) -> Result<String, ThrottlerError> {
        self.generate_key_with_strategy(&self.default_strategy, headers, client_ip, path)
    }

    pub fn generate_key_with_strategy(
        &self,
        strategy: &KeyStrategy,
        headers: &HashMap<String, String>,
        client_ip: &str,
        path: &str,
    ) -> Result<String, ThrottlerError> {
        match strategy {
            KeyStrategy::IpAddress => Ok(format!("ip:{client_ip}:{path}")),
            KeyStrategy::ApiKey => {
                let api_key = headers
                    .get("x-api-key")
                    .or_else(|| headers.get("authorization"))
                    .ok_or_else(|| ThrottlerError::validation(validation_code::MISSING_KEY, "no api key header present"))?;
                Ok(format!("api:{api_key}:{path}"))
            }
            KeyStrategy::UserId => {
                let user_id = headers
                    .get("x-user-id")
                    .ok_or_else(|| ThrottlerError::validation(validation_code::MISSING_KEY, "no x-user-id header present"))?;
                Ok(format!("user:{user_id}:{path}"))
            }
            KeyStrategy::Composite(strategies) => {
                let mut parts = Vec::new();
                for sub in strategies {
                    let part = match sub {
                        KeyStrategy::IpAddress => client_ip.to_string(),
                        KeyStrategy::ApiKey => headers
                            .get("x-api-key")
                            .or_else(|| headers.get("authorization"))
                            .ok_or_else(|| ThrottlerError::validation(validation_code::MISSING_KEY, "no api key header present"))?
                            .clone(),
                        KeyStrategy::UserId => headers
                            .get("x-user-id")
                            .ok_or_else(|| ThrottlerError::validation(validation_code::MISSING_KEY, "no x-user-id header present"))?
                            .clone(),
                        KeyStrategy::Composite(_) => {
                            return Err(ThrottlerError::validation(validation_code::MISSING_KEY, "nested composite key strategies are not supported"));
                        }
                    };
                    parts.push(part);
                }
                Ok(format!("composite:{}:{}", parts.join(":"), path))
            }
        }
    }

    /// Best-effort client IP extraction from common proxy headers.
    pub fn extract_client_ip(headers: &HashMap<String, String>) -> String {
        headers
            .get("x-forwarded-for")
            .and_then(|xff| xff.split(',').next().map(|ip| ip.trim()))
            .or_else(|| headers.get("x-real-ip").map(String::as_str))
            .or_else(|| headers.get("cf-connecting-ip").map(String::as_str))
            .unwrap_or("unknown")
            .to_string()
    }

    /// Replaces characters a bucket key must not contain so the derived
    /// string is always a safe `key` path segment.
    pub fn sanitize_key(key: &str) -> String {
        key.chars()
            .map(|c| if c.is_alphanumeric() || c == ':' || c == '-' || c == '_' { c } else { '_' })
            .collect()
    }
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::new(KeyStrategy::IpAddress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers() -> HashMap<String, String> {
        let mut h = HashMap::new();
        h.insert("x-api-key".to_string(), "test-api-key".to_string());
        h.insert("x-user-id".to_string(), "user123".to_string());
        h.insert("x-forwarded-for".to_string(), "192.168.1.1, 10.0.0.1".to_string());
        h
    }

    #[test]
    fn ip_address_strategy() {
        let gen = KeyGenerator::new(KeyStrategy::IpAddress);
        let key = gen.generate_key(&headers(), "192.168.1.1", "/api/test").unwrap();
        assert_eq!(key, "ip:192.168.1.1:/api/test");
    }

    #[test]
    fn api_key_strategy() {
        let gen = KeyGenerator::new(KeyStrategy::ApiKey);
        let key = gen.generate_key(&headers(), "192.168.1.1", "/api/test").unwrap();
        assert_eq!(key, "api:test-api-key:/api/test");
    }

    #[test]
    fn missing_header_is_validation_error() {
        let gen = KeyGenerator::new(KeyStrategy::UserId);
        let err = gen.generate_key(&HashMap::new(), "1.2.3.4", "/x").unwrap_err();
        assert!(matches!(err, ThrottlerError::Validation { .. }));
    }

    #[test]
    fn composite_strategy_joins_parts() {
        let strategy = KeyStrategy::Composite(vec![KeyStrategy::UserId, KeyStrategy::IpAddress]);
        let gen = KeyGenerator::new(strategy);
        let key = gen.generate_key(&headers(), "192.168.1.1", "/api/test").unwrap();
        assert_eq!(key, "composite:user123:192.168.1.1:/api/test");
    }

    #[test]
    fn extract_client_ip_prefers_forwarded_for() {
        assert_eq!(KeyGenerator::extract_client_ip(&headers()), "192.168.1.1");
    }

    #[test]
    fn sanitize_key_replaces_unsafe_characters() {
        assert_eq!(KeyGenerator::sanitize_key("test@key#with$chars"), "test_key_with_chars");
    }
}
