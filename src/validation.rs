//! # Request Validation
//!
//! Shape checks the HTTP façade runs before a request reaches
//! [`crate::engine::Engine`]: key charset/length and a sane `count`, so a
//! malformed request gets a clear `400` without spending a store round
//! trip. `Engine` still re-validates presence on its own path - this module
//! only tightens what the façade additionally rejects.

use crate::engine::{Count, TakeOptions};
use crate::error::{validation_code, ThrottlerError};

const MAX_KEY_LEN: usize = 256;

pub struct RequestValidator;

impl RequestValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate_key(&self, key: &str) -> Result<(), ThrottlerError> {
        if key.is_empty() {
            return Err(ThrottlerError::validation(validation_code::MISSING_KEY, "key must not be empty"));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(ThrottlerError::validation(validation_code::MISSING_KEY, format!("key exceeds {MAX_KEY_LEN} characters")));
        }
        if !key.chars().all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | ':' | '.' | '@')) {
            return Err(ThrottlerError::validation(validation_code::MISSING_KEY, "key contains characters that are not safe in a store key"));
        }
        Ok(())
    }

    pub fn validate_take_options(&self, opts: &TakeOptions) -> Result<(), ThrottlerError> {
        if let Some(Count::N(n)) = opts.count {
            if n == 0 {
                return Err(ThrottlerError::validation(validation_code::BAD_COUNT, "count must be at least 1"));
            }
        }
        Ok(())
    }
}

impl Default for RequestValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_key_is_rejected() {
        assert!(RequestValidator::new().validate_key("").is_err());
    }

    #[test]
    fn key_with_disallowed_characters_is_rejected() {
        assert!(RequestValidator::new().validate_key("bad key!").is_err());
    }

    #[test]
    fn ordinary_key_is_accepted() {
        assert!(RequestValidator::new().validate_key("user-123:session.7").is_ok());
    }

    #[test]
    fn zero_count_is_rejected() {
        let opts = TakeOptions { count: Some(Count::N(0)), config_override: None };
        assert!(RequestValidator::new().validate_take_options(&opts).is_err());
    }

    #[test]
    fn default_count_is_accepted() {
        assert!(RequestValidator::new().validate_take_options(&TakeOptions::default()).is_ok());
    }
}
