//! Request-scoped identity, pulled from the session-identity cookie. Mirrors
//! the shape of the teacher's `Admin`/`Auth` extractors in
//! `crates/api/src/extractors.rs` (referenced by `admin/auth.rs` but not
//! present in the retrieved pack): a `FromRequestParts` impl per
//! authorization tier, so handlers declare what they need as a parameter
//! instead of checking inline.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::extract::CookieJar;

use crate::error::Error;
use crate::jwt::decode_jwt;
use crate::State;

/// The caller's user id, proven by a valid session-identity cookie. Does
/// **not** check the ban flag or the IP-session match. That's
/// `middleware::require_session`'s job, run ahead of this extractor on any
/// route that needs it.
pub struct AuthUser(pub i64);

impl FromRequestParts<State> for AuthUser {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &State) -> Result<Self, Self::Rejection> {
        let jar = CookieJar::from_headers(&parts.headers);
        let token = jar.get("token").ok_or(Error::Unauthenticated)?;
        let claims = decode_jwt(&state.config.jwt_secret, token.value())?;
        Ok(AuthUser(claims.user_id()?))
    }
}

/// Like [`AuthUser`] but additionally requires `is_admin`.
pub struct AdminUser(pub i64);

impl FromRequestParts<State> for AdminUser {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &State) -> Result<Self, Self::Rejection> {
        let AuthUser(user_id) = AuthUser::from_request_parts(parts, state).await?;
        let user = state
            .store
            .get_user(user_id)
            .await
            .map_err(|_| Error::Unauthenticated)?;
        if !user.is_admin {
            return Err(Error::NotAdmin);
        }
        Ok(AdminUser(user_id))
    }
}
