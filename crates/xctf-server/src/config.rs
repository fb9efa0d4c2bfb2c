use std::sync::Arc;

use envconfig::Envconfig;
use xctf_core::engine::SandboxEngine;
use xctf_core::hooks::EventHooks;
use xctf_core::queue::TaskQueue;
use xctf_core::session::SessionRegistry;
use xctf_core::store::Store;

use crate::auth::Authenticator;

#[derive(Envconfig, Debug, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_ADDR", default = "0.0.0.0:8080")]
    pub bind_addr: String,

    #[envconfig(from = "CORS_ORIGIN", default = "*")]
    pub cors_origin: String,

    /// HMAC secret for the session-identity cookie (see `jwt.rs`). Unrelated
    /// to the `Session` row, which has no token of its own.
    #[envconfig(from = "JWT_SECRET")]
    pub jwt_secret: String,

    #[envconfig(nested)]
    pub core: xctf_core::config::Config,
}

pub struct StateInner {
    pub config: Config,
    pub store: Store,
    pub engine: SandboxEngine,
    pub sessions: SessionRegistry,
    pub hooks: EventHooks,
    pub queue: TaskQueue,
    pub authenticator: Arc<dyn Authenticator + Send + Sync>,
}

pub type State = Arc<StateInner>;
