//! Signs and verifies short-lived session tokens, implemented with
//! `jsonwebtoken` (HS256) the way services elsewhere in this corpus
//! hand out bearer tokens.

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::RelayError;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sid: String,
    exp: u64,
}

pub struct TokenIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl TokenIssuer {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Issues a token binding `session_id` to an expiry `ttl` from now.
    pub fn issue(&self, session_id: &str, ttl: std::time::Duration) -> String {
        let exp = now_epoch_seconds() + ttl.as_secs();
        let claims = Claims {
            sid: session_id.to_string(),
            exp,
        };
        // Signing with a process-wide HS256 key cannot fail for well-formed claims.
        encode(&Header::default(), &claims, &self.encoding_key)
            .expect("token encoding is infallible for these claims")
    }

    /// Verifies `token` and checks that it was issued for `expected_session_id`.
    ///
    /// Rejects invalid signatures, expired tokens, and tokens issued for
    /// a different session (`TokenInvalid`/`TokenExpired`).
    pub fn verify(&self, token: &str, expected_session_id: &str) -> Result<(), RelayError> {
        let mut validation = Validation::new(jsonwebtoken::Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        let data = decode::<Claims>(token, &self.decoding_key, &validation).map_err(|e| {
            use jsonwebtoken::errors::ErrorKind;
            match e.kind() {
                ErrorKind::ExpiredSignature => RelayError::TokenExpired,
                _ => RelayError::TokenInvalid,
            }
        })?;

        if !data.claims.sid.eq_ignore_ascii_case(expected_session_id) {
            return Err(RelayError::TokenInvalid);
        }
        Ok(())
    }
}

fn now_epoch_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is after the epoch")
        .as_secs()
}
