//! C2: per-sandbox loopback filesystem volumes.
//!
//! Grounded in `original_source/challenge/utils.py`: `create_loop_device`
//! (`dd` a zero-filled image, `mkfs.ext4` it) and `mount_volume` /
//! `unmount_volume` / `clean_up_volume`. Shelling out to `dd`/`mkfs.ext4`/
//! `mount`/`umount` is kept as-is rather than reimplemented, the same way
//! the teacher shells out to the `docker` CLI only where `bollard` has no
//! equivalent call.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{Error, Result};

/// A provisioned volume: the backing image file and the directory it is
/// mounted at. `unmount_and_remove` tears both down; dropping without
/// calling it leaks the volume, same as leaking a `File` leaks an fd.
pub struct Volume {
    pub image_path: PathBuf,
    pub mount_path: PathBuf,
}

/// C2's capability surface. Split out so tests can swap in
/// [`fake::FakeVolumes`], which skips `dd`/`mkfs.ext4`/`mount` entirely,
/// since those need loop-device privileges CI rarely grants.
#[async_trait]
pub trait Volumes: Send + Sync {
    async fn provision(&self, sandbox_name: &str) -> Result<Volume>;
    async fn unmount_and_remove(&self, volume: &Volume) -> Result<()>;
    fn mount_path_for(&self, sandbox_name: &str) -> PathBuf;
}

#[derive(Clone)]
pub struct VolumeManager {
    base_dir: PathBuf,
    size_mb: u64,
}

impl VolumeManager {
    pub fn new(base_dir: impl Into<PathBuf>, size_mb: u64) -> Self {
        Self {
            base_dir: base_dir.into(),
            size_mb,
        }
    }

    /// Creates `{sandbox_name}.img`, formats it ext4, and mounts it under
    /// `base_dir/{sandbox_name}`.
    async fn provision_impl(&self, sandbox_name: &str) -> Result<Volume> {
        tokio::fs::create_dir_all(&self.base_dir)
            .await
            .map_err(|e| Error::VolumeProvisioningError(e.to_string()))?;

        let image_path = self.base_dir.join(format!("{sandbox_name}.img"));
        let mount_path = self.base_dir.join(sandbox_name);
        tokio::fs::create_dir_all(&mount_path)
            .await
            .map_err(|e| Error::VolumeProvisioningError(e.to_string()))?;

        run(
            "dd",
            &[
                "if=/dev/zero".to_string(),
                format!("of={}", image_path.display()),
                "bs=1M".to_string(),
                format!("count={}", self.size_mb),
            ],
        )
        .await?;

        run("mkfs.ext4", &["-F".to_string(), image_path.display().to_string()]).await?;

        run(
            "mount",
            &["-o".to_string(), "loop".to_string(), image_path.display().to_string(), mount_path.display().to_string()],
        )
        .await?;

        Ok(Volume {
            image_path,
            mount_path,
        })
    }

    /// Best-effort teardown: an already-unmounted volume is not an error,
    /// matching `clean_up_volume`'s tolerance for "not mounted" from
    /// `umount`'s stderr in the original.
    async fn unmount_and_remove_impl(&self, volume: &Volume) -> Result<()> {
        let output = Command::new("umount")
            .arg(&volume.mount_path)
            .output()
            .await
            .map_err(|e| Error::VolumeProvisioningError(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("not mounted") {
                return Err(Error::VolumeProvisioningError(stderr.trim().to_string()));
            }
        }
        let _ = tokio::fs::remove_dir(&volume.mount_path).await;
        let _ = tokio::fs::remove_file(&volume.image_path).await;
        Ok(())
    }
}

#[async_trait]
impl Volumes for VolumeManager {
    async fn provision(&self, sandbox_name: &str) -> Result<Volume> {
        self.provision_impl(sandbox_name).await
    }

    async fn unmount_and_remove(&self, volume: &Volume) -> Result<()> {
        self.unmount_and_remove_impl(volume).await
    }

    fn mount_path_for(&self, sandbox_name: &str) -> PathBuf {
        self.base_dir.join(sandbox_name)
    }
}

async fn run(program: &str, args: &[String]) -> Result<()> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| Error::VolumeProvisioningError(format!("{program}: {e}")))?;
    if !output.status.success() {
        return Err(Error::VolumeProvisioningError(format!(
            "{program} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

pub fn handshake_path(mount_path: &Path) -> PathBuf {
    mount_path.join(".xctf_port_mappings.json")
}

/// In-memory stand-in for [`VolumeManager`]: creates a bare directory
/// instead of a loopback ext4 image, so `engine` tests don't need root or a
/// loop device.
pub mod fake {
    use super::*;
    use std::sync::Mutex as StdMutex;

    pub struct FakeVolumes {
        base_dir: PathBuf,
        pub provisioned: StdMutex<Vec<String>>,
        pub provision_fails: bool,
    }

    impl FakeVolumes {
        pub fn new(base_dir: impl Into<PathBuf>) -> Self {
            Self {
                base_dir: base_dir.into(),
                provisioned: StdMutex::new(Vec::new()),
                provision_fails: false,
            }
        }

        pub fn failing(mut self) -> Self {
            self.provision_fails = true;
            self
        }
    }

    #[async_trait]
    impl Volumes for FakeVolumes {
        async fn provision(&self, sandbox_name: &str) -> Result<Volume> {
            if self.provision_fails {
                return Err(Error::VolumeProvisioningError("fake provisioning failure".into()));
            }
            let mount_path = self.base_dir.join(sandbox_name);
            tokio::fs::create_dir_all(&mount_path)
                .await
                .map_err(|e| Error::VolumeProvisioningError(e.to_string()))?;
            self.provisioned.lock().unwrap().push(sandbox_name.to_string());
            Ok(Volume {
                image_path: self.base_dir.join(format!("{sandbox_name}.img")),
                mount_path,
            })
        }

        async fn unmount_and_remove(&self, volume: &Volume) -> Result<()> {
            let _ = tokio::fs::remove_dir_all(&volume.mount_path).await;
            Ok(())
        }

        fn mount_path_for(&self, sandbox_name: &str) -> PathBuf {
            self.base_dir.join(sandbox_name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_path_is_hidden_file_under_mount() {
        let p = handshake_path(Path::new("/var/lib/xctf/volumes/sb-1"));
        assert_eq!(
            p,
            PathBuf::from("/var/lib/xctf/volumes/sb-1/.xctf_port_mappings.json")
        );
    }
}
