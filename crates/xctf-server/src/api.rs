use axum::routing::post;
use axum::{Router, middleware};

use crate::auth::login;
use crate::{admin, challenges, middleware::require_session, State};

pub fn router(state: State) -> Router<State> {
    Router::new()
        .route("/auth/login", post(login))
        .nest("/challenges", challenges::router())
        .nest("/admin", admin::router())
        .layer(middleware::from_fn_with_state(state, require_session))
}
