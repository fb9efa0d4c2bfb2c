//! Minimal admin-only endpoints: flip a flag inside a transaction, then
//! drive C8's hooks from the before/after values, since there's no ORM
//! signal to do it implicitly the way `original_source/events/signals.py`
//! does.

use axum::extract::{Path, State as StateE};
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;

use crate::error::Result;
use crate::extractors::AdminUser;
use crate::State;

pub fn router() -> Router<State> {
    Router::new()
        .route("/challenges/{id}/deactivate", post(deactivate_challenge))
        .route("/users/{id}/ban", post(ban_user))
}

#[derive(Serialize)]
struct AdminActionResponse {
    ok: bool,
}

async fn deactivate_challenge(
    StateE(state): StateE<State>,
    AdminUser(_admin_id): AdminUser,
    Path(id): Path<i64>,
) -> Result<Json<AdminActionResponse>> {
    let was_active = state.store.set_challenge_active(id, false).await?;
    let challenge = state.store.get_challenge(id).await?;
    state.hooks.on_challenge_active_changed(was_active, &challenge).await?;
    Ok(Json(AdminActionResponse { ok: true }))
}

async fn ban_user(
    StateE(state): StateE<State>,
    AdminUser(_admin_id): AdminUser,
    Path(id): Path<i64>,
) -> Result<Json<AdminActionResponse>> {
    let was_banned = state.store.set_user_banned(id, true).await?;
    state.hooks.on_user_banned_changed(was_banned, id, true).await?;
    Ok(Json(AdminActionResponse { ok: true }))
}
