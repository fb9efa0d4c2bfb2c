//! Session-identity cookie. The `Session` row (`xctf_core::model::Session`)
//! carries no token of its own, it's keyed by `(user_id, ip_address)`, so
//! the HTTP layer needs its own way to carry "who is making this request"
//! across a stateless cookie. Grounded in the teacher's `crates/api`
//! `jwt.rs`/`config.rs` use of `jsonwebtoken`, minus the base64-encoded-key
//! wrapper (`JwtKeys`): a plain HMAC secret is enough here since there's no
//! key-rotation story in scope.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User id, as a string because that's what `jsonwebtoken`'s registered
    /// claim conventions expect for `sub`.
    pub sub: String,
    pub exp: usize,
}

impl Claims {
    pub fn user_id(&self) -> Result<i64> {
        self.sub
            .parse()
            .map_err(|_| Error::Unauthenticated)
    }
}

pub fn generate_jwt(secret: &str, user_id: i64, ttl: Duration) -> Result<String> {
    let claims = Claims {
        sub: user_id.to_string(),
        exp: (Utc::now() + ttl).timestamp() as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
        .map_err(|_| Error::Unauthenticated)
}

pub fn decode_jwt(secret: &str, token: &str) -> Result<Claims> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|_| Error::Unauthenticated)
}
