//! Normalization of the key endpoint's response shapes.
//!
//! Two shapes are accepted, detected by field presence (first match wins):
//!
//! ```text
//! { "token": "...", "age_seconds": 1700 }      poller snapshot format
//! { "api_key": "...", "expires_in": 1800 }     standard format
//! ```

use serde_json::Value;

use crate::error::{RelayError, Result};

/// Lower bound on the lifetime derived from `age_seconds`.
pub const MIN_EXPIRES_IN_SECS: f64 = 60.0;

/// Upper bound on any lifetime the endpoint can hand us (one year).
pub const MAX_EXPIRES_IN_SECS: f64 = 365.0 * 24.0 * 3600.0;

/// A key plus how long it may be cached.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyGrant {
    pub key: String,
    pub expires_in: f64,
}

/// Turn a raw 2xx response body into a [`KeyGrant`].
///
/// `default_secs` applies when the body carries no lifetime hint;
/// `cadence_secs` is the nominal rotation period used with `age_seconds`.
pub fn normalize(
    provider: &str,
    body: &str,
    default_secs: u64,
    cadence_secs: u64,
) -> Result<KeyGrant> {
    let invalid = || RelayError::InvalidKeyResponse {
        provider: provider.to_string(),
        body: body.to_string(),
    };

    let data: Value = serde_json::from_str(body).map_err(|_| invalid())?;
    let obj = data.as_object().ok_or_else(invalid)?;
    let default_secs = default_secs as f64;

    let (key, expires_in) = if let Some(token) = obj.get("token") {
        let expires_in = match obj.get("age_seconds").and_then(Value::as_f64) {
            Some(age) => (cadence_secs as f64 - age).max(MIN_EXPIRES_IN_SECS),
            None => default_secs,
        };
        (token, expires_in)
    } else if let Some(api_key) = obj.get("api_key") {
        let expires_in = obj
            .get("expires_in")
            .and_then(Value::as_f64)
            .unwrap_or(default_secs)
            .max(0.0);
        (api_key, expires_in)
    } else {
        return Err(invalid());
    };

    match key.as_str() {
        Some(k) if !k.is_empty() => Ok(KeyGrant {
            key: k.to_string(),
            expires_in: expires_in.min(MAX_EXPIRES_IN_SECS),
        }),
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_with_age_uses_remaining_cadence() {
        let grant = normalize("anthropic", r#"{"token": "abc", "age_seconds": 1700}"#, 300, 1800).unwrap();
        assert_eq!(grant.key, "abc");
        assert_eq!(grant.expires_in, 100.0);
    }

    #[test]
    fn test_token_age_floor_is_one_minute() {
        let grant = normalize("p", r#"{"token": "abc", "age_seconds": 1790.5}"#, 300, 1800).unwrap();
        assert_eq!(grant.expires_in, 60.0);
    }

    #[test]
    fn test_huge_lifetimes_are_capped() {
        let grant = normalize("p", r#"{"api_key": "K", "expires_in": 1e15}"#, 900, 1800).unwrap();
        assert_eq!(grant.expires_in, MAX_EXPIRES_IN_SECS);

        let grant = normalize("p", r#"{"token": "T", "age_seconds": -1e20}"#, 900, 1800).unwrap();
        assert_eq!(grant.expires_in, MAX_EXPIRES_IN_SECS);
    }

    #[test]
    fn test_token_without_age_uses_default() {
        let grant = normalize("p", r#"{"token": "abc"}"#, 1800, 1800).unwrap();
        assert_eq!(grant.expires_in, 1800.0);
    }

    #[test]
    fn test_api_key_shape() {
        let grant = normalize("p", r#"{"api_key": "xyz"}"#, 900, 1800).unwrap();
        assert_eq!(grant, KeyGrant { key: "xyz".into(), expires_in: 900.0 });

        let grant = normalize("p", r#"{"api_key": "xyz", "expires_in": 120}"#, 900, 1800).unwrap();
        assert_eq!(grant.expires_in, 120.0);
    }

    #[test]
    fn test_token_wins_over_api_key() {
        let grant = normalize("p", r#"{"api_key": "second", "token": "first"}"#, 900, 1800).unwrap();
        assert_eq!(grant.key, "first");
    }

    #[test]
    fn test_unrecognized_shape_carries_body() {
        let body = r#"{"unexpected": "field"}"#;
        match normalize("anthropic", body, 900, 1800) {
            Err(RelayError::InvalidKeyResponse { provider, body: b }) => {
                assert_eq!(provider, "anthropic");
                assert_eq!(b, body);
            }
            other => panic!("expected InvalidKeyResponse, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_or_non_string_key_rejected() {
        assert!(normalize("p", r#"{"api_key": ""}"#, 900, 1800).is_err());
        assert!(normalize("p", r#"{"token": null}"#, 900, 1800).is_err());
        assert!(normalize("p", r#"{"token": 42}"#, 900, 1800).is_err());
    }

    #[test]
    fn test_non_json_body_rejected() {
        assert!(matches!(
            normalize("p", "<html>oops</html>", 900, 1800),
            Err(RelayError::InvalidKeyResponse { .. })
        ));
        assert!(normalize("p", r#"["token"]"#, 900, 1800).is_err());
    }
}
