//! `POST /api/auth/login`. Password verification itself is an
//! out-of-scope collaborator (registration/credential storage live outside
//! this lifecycle controller); `Authenticator` is the injected interface a
//! deployment plugs its real credential check into. `Argon2Authenticator`
//! is the default, grounded in `examples/Jungley8-openfang`'s use of the
//! `argon2` crate for password hashes.

use argon2::password_hash::PasswordHash;
use argon2::{Argon2, PasswordVerifier};
use async_trait::async_trait;
use axum::extract::State as StateE;
use axum_extra::extract::cookie::{Cookie, SameSite};
use axum_extra::extract::CookieJar;
use axum::http::HeaderMap;
use axum::Json;
use chrono::Duration;
use log::warn;
use serde::Deserialize;
use xctf_core::firewall::client_ip;
use xctf_core::model::User;

use crate::error::{Error, Result};
use crate::jwt::generate_jwt;
use crate::State;

/// Verifies a plaintext password against a user's stored credential.
/// Swappable so a deployment can back it with whatever identity provider
/// actually owns registration.
#[async_trait]
pub trait Authenticator {
    async fn verify(&self, user: &User, password: &str) -> bool;
}

pub struct Argon2Authenticator;

#[async_trait]
impl Authenticator for Argon2Authenticator {
    async fn verify(&self, user: &User, password: &str) -> bool {
        let Ok(hash) = PasswordHash::new(&user.password_hash) else {
            warn!("user {} has an unparseable password hash", user.id);
            return false;
        };
        Argon2::default()
            .verify_password(password.as_bytes(), &hash)
            .is_ok()
    }
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// `original_source/user_auth/views.py`'s login view: resolve the user,
/// check the password, then hand off to C5 for session replacement and IP
/// handoff, and set the session-identity cookie for subsequent requests.
pub async fn login(
    StateE(state): StateE<State>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(payload): Json<LoginRequest>,
) -> Result<CookieJar> {
    let user = state
        .store
        .get_user_by_username(&payload.username)
        .await
        .map_err(|_| Error::InvalidCredentials)?;

    if user.banned {
        return Err(Error::Banned);
    }

    if !state.authenticator.verify(&user, &payload.password).await {
        return Err(Error::InvalidCredentials);
    }

    let ip = client_ip(
        header_str(&headers, "x-forwarded-for"),
        header_str(&headers, "x-real-ip"),
        None,
    );

    state.sessions.login(user.id, &ip).await?;

    let token = generate_jwt(&state.config.jwt_secret, user.id, Duration::hours(24))?;
    let mut cookie = Cookie::new("token", token);
    cookie.set_path("/");
    cookie.set_http_only(true);
    cookie.set_same_site(SameSite::Lax);
    cookie.set_max_age(time::Duration::hours(24));

    Ok(jar.add(cookie))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
