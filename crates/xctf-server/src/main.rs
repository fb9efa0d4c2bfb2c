//! Binary entry point: wires C1-C8 together behind a minimal axum HTTP
//! surface. Grounded in `crates/api/src/main.rs` (CORS layer, graceful
//! shutdown via ctrl-c/SIGTERM, `pretty_env_logger` + `dotenvy` + `envconfig`
//! boot sequence) and `crates/deployer-server/src/main.rs` (the
//! `TaskTracker`/`CancellationToken` background-task wiring, here driving
//! `xctf_core::scheduler::Scheduler` instead of a deploy/destroy task pair).

use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderValue;
use axum::Router;
use envconfig::Envconfig;
use eyre::Context;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

mod admin;
mod api;
mod auth;
mod challenges;
mod config;
mod error;
mod extractors;
mod jwt;
mod middleware;

use auth::Argon2Authenticator;
use config::{Config, State, StateInner};
use xctf_core::engine::SandboxEngine;
use xctf_core::firewall::FirewallController;
use xctf_core::hooks::EventHooks;
use xctf_core::lock::DistributedMutex;
use xctf_core::notify::Notifier;
use xctf_core::queue::TaskQueue;
use xctf_core::runtime::ContainerRuntime;
use xctf_core::scheduler::Scheduler;
use xctf_core::session::SessionRegistry;
use xctf_core::store::Store;
use xctf_core::volume::VolumeManager;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    pretty_env_logger::init();
    dotenvy::dotenv().ok();

    let cfg = Config::init_from_env().context("initialize config from environment")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&cfg.core.database_url)
        .await?;
    sqlx::migrate!("../../migrations").run(&pool).await?;

    let store = Store::new(pool);
    let mutex = DistributedMutex::new(&cfg.core.redis_url)?;
    let volumes = VolumeManager::new(cfg.core.volume_base_dir.clone(), cfg.core.volume_size_mb);
    let runtime = ContainerRuntime::connect_local()?;
    let firewall = FirewallController::new(cfg.core.firewall_rules_file.clone());
    firewall.ensure_initialized().await.context("initialize firewall table")?;

    let engine = SandboxEngine::new(
        store.clone(),
        mutex,
        volumes,
        runtime,
        firewall.clone(),
        Duration::from_secs(cfg.core.sandbox_lock_ttl_secs),
        Duration::from_secs(cfg.core.health_wait_timeout_secs),
    );
    let sessions = SessionRegistry::new(store.clone(), firewall.clone(), cfg.core.session_ttl_secs);
    let notifier = Notifier::new(&cfg.core.redis_url, store.clone())?;
    let hooks = EventHooks::new(store.clone(), engine.clone(), sessions.clone(), notifier.clone());
    let scheduler = Scheduler::new(
        store.clone(),
        engine.clone(),
        firewall.clone(),
        sessions.clone(),
        notifier.clone(),
        cfg.core.sandbox_max_lifetime_secs,
    );

    // Cold-start rebuild (§4.7): reconcile the firewall with the database
    // before accepting traffic, the way `XctfConfig.ready` does from a
    // startup thread.
    scheduler
        .rebuild_firewall_from_state()
        .await
        .context("rebuild firewall from persisted state")?;

    let queue = TaskQueue::new();
    scheduler.spawn_periodic(&queue, Vec::new());

    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_origin([cfg.cors_origin.parse::<HeaderValue>().unwrap_or(HeaderValue::from_static("*"))])
        .allow_headers(Any);

    let bind_addr = cfg.bind_addr.clone();
    let state: State = Arc::new(StateInner {
        config: cfg,
        store,
        engine,
        sessions,
        hooks,
        queue: queue.clone(),
        authenticator: Arc::new(Argon2Authenticator),
    });

    let app = Router::<State>::new()
        .nest("/api", api::router(state.clone()))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    queue.cancel_all();
    queue.close_and_wait().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install terminate signal handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = async {};

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
