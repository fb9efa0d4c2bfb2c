use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Redis(#[from] redis::RedisError),
    #[error("timed out waiting for container to become healthy")]
    SandboxCreateTimeout,
    #[error("timed out acquiring sandbox lock {0}")]
    SandboxLockTimeout(String),
    #[error("volume provisioning failed: {0}")]
    VolumeProvisioningError(String),
    #[error("container runtime error: {0}")]
    ContainerRuntimeError(String),
    #[error("firewall rule error: {0}")]
    FirewallRuleError(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("validation error: {0}")]
    ValidationError(String),
}

pub type Result<T> = core::result::Result<T, Error>;

impl From<bollard::errors::Error> for Error {
    fn from(e: bollard::errors::Error) -> Self {
        Error::ContainerRuntimeError(e.to_string())
    }
}
