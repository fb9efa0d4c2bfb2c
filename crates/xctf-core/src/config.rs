use std::path::PathBuf;

use envconfig::Envconfig;

/// Process-wide configuration, loaded once at boot via `envconfig`, the same
/// shape as `crates/deployer-server/src/config.rs` and
/// `crates/api/src/config.rs` in the teacher repo.
#[derive(Envconfig, Debug, Clone)]
pub struct Config {
    #[envconfig(from = "DATABASE_URL")]
    pub database_url: String,

    #[envconfig(from = "REDIS_URL", default = "redis://127.0.0.1:6379/0")]
    pub redis_url: String,

    /// Base directory under which per-sandbox loopback volume images and
    /// mount points are created (C2).
    #[envconfig(from = "VOLUME_BASE_DIR", default = "/var/lib/xctf/volumes")]
    pub volume_base_dir: PathBuf,

    /// Size of each sandbox's loopback filesystem image, in MiB.
    #[envconfig(from = "VOLUME_SIZE_MB", default = "100")]
    pub volume_size_mb: u64,

    /// Name of the nftables table the firewall controller owns (C4).
    #[envconfig(from = "FIREWALL_TABLE", default = "xctf")]
    pub firewall_table: String,

    #[envconfig(from = "FIREWALL_RULES_FILE", default = "/etc/nftables/xctf-rules.conf")]
    pub firewall_rules_file: PathBuf,

    /// Default lifetime of a non-static sandbox before the reaper collects
    /// it, in seconds (§4.7 `destroy_non_static_sandboxes`).
    #[envconfig(from = "SANDBOX_MAX_LIFETIME_SECS", default = "7200")]
    pub sandbox_max_lifetime_secs: i64,

    /// TTL for the distributed sandbox-creation lock (C1), in seconds.
    #[envconfig(from = "SANDBOX_LOCK_TTL_SECS", default = "10")]
    pub sandbox_lock_ttl_secs: u64,

    /// How long to poll for container health before giving up (C3), in seconds.
    #[envconfig(from = "HEALTH_WAIT_TIMEOUT_SECS", default = "60")]
    pub health_wait_timeout_secs: u64,

    /// Session lifetime set on login (C5), in seconds.
    #[envconfig(from = "SESSION_TTL_SECS", default = "86400")]
    pub session_ttl_secs: i64,
}
