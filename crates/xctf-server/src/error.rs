//! Same shape as `crates/api/src/error.rs`: a `thiserror` enum with an
//! `IntoResponse` impl that maps each variant to a status code and a small
//! `{error, message}` JSON envelope.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] xctf_core::Error),
    #[error("not authenticated")]
    Unauthenticated,
    #[error("account is banned")]
    Banned,
    #[error("admin access required")]
    NotAdmin,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("flag must be between 1 and 500 characters")]
    InvalidFlagLength,
}

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Serialize)]
struct ErrorResponse<'a> {
    error: &'a str,
    message: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let message = self.to_string();
        let (status, error) = match &self {
            Error::Core(xctf_core::Error::NotFound(_)) => (StatusCode::NOT_FOUND, "not_found"),
            Error::Core(xctf_core::Error::ValidationError(_)) => (StatusCode::BAD_REQUEST, "validation_error"),
            Error::Core(xctf_core::Error::SandboxCreateTimeout) => {
                (StatusCode::SERVICE_UNAVAILABLE, "sandbox_create_timeout")
            }
            Error::Core(xctf_core::Error::SandboxLockTimeout(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "sandbox_lock_timeout")
            }
            Error::Core(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
            Error::Unauthenticated => (StatusCode::UNAUTHORIZED, "unauthenticated"),
            Error::Banned => (StatusCode::FORBIDDEN, "banned"),
            Error::NotAdmin => (StatusCode::FORBIDDEN, "not_admin"),
            Error::InvalidCredentials => (StatusCode::UNAUTHORIZED, "invalid_credentials"),
            Error::InvalidFlagLength => (StatusCode::BAD_REQUEST, "invalid_flag_length"),
        };

        (status, Json(ErrorResponse { error, message })).into_response()
    }
}
