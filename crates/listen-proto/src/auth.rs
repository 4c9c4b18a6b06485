//! Local validation of LISTEN.moe session tokens.
//!
//! Tokens are JWTs.  We never verify the signature (the server does that);
//! we only read the `exp` claim so an expired token is caught before a
//! favourite mutation goes out.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use crate::error::ClientError;

#[derive(Debug, Deserialize)]
struct Claims {
    exp: i64,
}

/// Expiry timestamp carried by `token`.
pub fn token_expiry(token: &str) -> Result<DateTime<Utc>, ClientError> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| ClientError::Authentication("token is not a JWT".to_string()))?;

    let raw = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| ClientError::Authentication(format!("token payload: {}", e)))?;
    let claims: Claims = serde_json::from_slice(&raw)
        .map_err(|e| ClientError::Authentication(format!("token claims: {}", e)))?;

    Utc.timestamp_opt(claims.exp, 0)
        .single()
        .ok_or_else(|| ClientError::Authentication("token exp out of range".to_string()))
}

/// True when `token` decodes and has not expired at `now`.
pub fn token_is_valid(token: &str, now: DateTime<Utc>) -> bool {
    match token_expiry(token) {
        Ok(exp) => now < exp,
        Err(_) => false,
    }
}

#[cfg(test)]
pub(crate) fn make_token(exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = URL_SAFE_NO_PAD.encode(format!(r#"{{"id":1,"exp":{}}}"#, exp));
    format!("{}.{}.signature", header, claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_is_read_from_claims() {
        let token = make_token(1_700_000_000);
        let exp = token_expiry(&token).unwrap();
        assert_eq!(exp.timestamp(), 1_700_000_000);
    }

    #[test]
    fn validity_compares_against_now() {
        let token = make_token(1_700_000_000);
        let before = Utc.timestamp_opt(1_699_999_000, 0).unwrap();
        let after = Utc.timestamp_opt(1_700_000_001, 0).unwrap();
        assert!(token_is_valid(&token, before));
        assert!(!token_is_valid(&token, after));
    }

    #[test]
    fn garbage_is_never_valid() {
        assert!(!token_is_valid("not-a-token", Utc::now()));
        assert!(matches!(
            token_expiry("a.!!!.c"),
            Err(ClientError::Authentication(_))
        ));
    }
}
