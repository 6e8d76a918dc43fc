//! Bearer-token validation for the WebSocket handshake.
//!
//! Tokens are JWTs signed with HMAC-SHA-512 over a shared secret. The
//! gateway only validates; issuing tokens belongs to an upstream service.
//! Expiration is the issuer's policy and is checked only when explicitly
//! enabled in configuration.

use std::collections::HashSet;

use {
    jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header},
    serde::Deserialize,
};

use wsbridge_protocol::{DeviceId, UserId};

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("empty token")]
    EmptyToken,
    #[error("token is not signed with HS512")]
    BadAlgorithm,
    #[error("token signature is invalid")]
    BadSignature,
    #[error("token claims are missing userId or deviceId")]
    BadClaims,
    #[error("token is expired")]
    Expired,
    #[error("malformed token: {0}")]
    Malformed(String),
}

// ── Claims ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TokenClaims {
    #[serde(rename = "userId")]
    user_id: String,
    #[serde(rename = "deviceId")]
    device_id: String,
}

// ── Validator ────────────────────────────────────────────────────────────────

/// Validates handshake tokens against a shared secret.
pub struct TokenValidator {
    key: DecodingKey,
    validation: Validation,
}

impl TokenValidator {
    /// Validator with no expiration check (the default policy).
    pub fn new(secret: &str) -> Self {
        Self::with_options(secret, false)
    }

    /// `validate_expiry` turns on the optional `exp` claim check.
    pub fn with_options(secret: &str, validate_expiry: bool) -> Self {
        let mut validation = Validation::new(Algorithm::HS512);
        validation.validate_exp = validate_expiry;
        validation.validate_aud = false;
        validation.required_spec_claims = if validate_expiry {
            HashSet::from(["exp".to_string()])
        } else {
            HashSet::new()
        };
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Validate `token` and extract its identity claims.
    pub fn validate(&self, token: &str) -> Result<(UserId, DeviceId), AuthError> {
        if token.is_empty() {
            return Err(AuthError::EmptyToken);
        }

        // Reject foreign algorithms up front so an HS256 token against the
        // same secret reads as a policy violation, not a bad signature.
        let header = decode_header(token).map_err(map_error)?;
        if header.alg != Algorithm::HS512 {
            return Err(AuthError::BadAlgorithm);
        }

        let data = decode::<TokenClaims>(token, &self.key, &self.validation).map_err(map_error)?;
        Ok((
            UserId::new(data.claims.user_id),
            DeviceId::new(data.claims.device_id),
        ))
    }
}

fn map_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;

    match err.kind() {
        ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => AuthError::BadAlgorithm,
        ErrorKind::InvalidSignature => AuthError::BadSignature,
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::Json(_) | ErrorKind::MissingRequiredClaim(_) => AuthError::BadClaims,
        _ => AuthError::Malformed(err.to_string()),
    }
}

/// One-shot validation with the default (no-expiry) policy.
pub fn validate_token(token: &str, secret: &str) -> Result<(UserId, DeviceId), AuthError> {
    TokenValidator::new(secret).validate(token)
}

#[cfg(test)]
mod tests {
    use {
        jsonwebtoken::{EncodingKey, Header, encode},
        serde_json::json,
    };

    use super::*;

    fn issue(secret: &str, algorithm: Algorithm, claims: serde_json::Value) -> String {
        encode(
            &Header::new(algorithm),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn hs512_token_round_trips() {
        let token = issue("s", Algorithm::HS512, json!({"userId": "u1", "deviceId": "d1"}));
        let (user, device) = validate_token(&token, "s").unwrap();
        assert_eq!(user.as_str(), "u1");
        assert_eq!(device.as_str(), "d1");
    }

    #[test]
    fn empty_token_is_rejected() {
        assert!(matches!(validate_token("", "s"), Err(AuthError::EmptyToken)));
    }

    #[test]
    fn foreign_algorithm_is_rejected() {
        let token = issue("s", Algorithm::HS256, json!({"userId": "u1", "deviceId": "d1"}));
        assert!(matches!(
            validate_token(&token, "s"),
            Err(AuthError::BadAlgorithm)
        ));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = issue("s", Algorithm::HS512, json!({"userId": "u1", "deviceId": "d1"}));
        assert!(matches!(
            validate_token(&token, "other"),
            Err(AuthError::BadSignature)
        ));
    }

    #[test]
    fn missing_claim_is_rejected() {
        let token = issue("s", Algorithm::HS512, json!({"userId": "u1"}));
        assert!(matches!(validate_token(&token, "s"), Err(AuthError::BadClaims)));
    }

    #[test]
    fn non_string_claim_is_rejected() {
        let token = issue("s", Algorithm::HS512, json!({"userId": "u1", "deviceId": 7}));
        assert!(matches!(validate_token(&token, "s"), Err(AuthError::BadClaims)));
    }

    #[test]
    fn garbage_token_is_malformed() {
        assert!(matches!(
            validate_token("not-a-jwt", "s"),
            Err(AuthError::Malformed(_))
        ));
    }

    #[test]
    fn expiry_is_ignored_unless_enabled() {
        let expired = issue(
            "s",
            Algorithm::HS512,
            json!({"userId": "u1", "deviceId": "d1", "exp": 1}),
        );
        assert!(validate_token(&expired, "s").is_ok());

        let strict = TokenValidator::with_options("s", true);
        assert!(matches!(strict.validate(&expired), Err(AuthError::Expired)));
    }
}
