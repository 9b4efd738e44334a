//! Software RAID (mdadm) Backend
//!
//! Provisions Linux md arrays. Unlike the hardware controllers there is no
//! drive enumeration surface: the array is observed through its OS device
//! path, and activity is read from the kernel's `/proc/mdstat` file.

use crate::backends::ProvisionerConfig;
use crate::domain::ports::{
    CommandRunner, RaidBackend, RaidSpec, ReadinessState, VirtualDrive,
};
use crate::error::{Error, Result};
use crate::hardware::BlockDeviceEnumerator;
use crate::reconcile;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const TOOL: &str = "mdadm";

// =============================================================================
// mdstat Parsing
// =============================================================================

/// Readiness of one array according to the kernel's mdstat text.
///
/// The file starts with a `Personalities` header line, then one blank-line
/// separated section per array. A running resync/rebuild task prints an
/// estimated `finish` time inside the array's section.
fn array_readiness(mdstat: &str, array: &str) -> ReadinessState {
    let body = mdstat.split_once('\n').map(|(_, rest)| rest).unwrap_or("");
    for section in body.split("\n\n") {
        let matches = section
            .strip_prefix(array)
            .map_or(false, |rest| rest.starts_with(' ') || rest.starts_with(':'));
        if matches {
            return if section.contains("finish") {
                ReadinessState::Busy
            } else {
                ReadinessState::Ready
            };
        }
    }
    ReadinessState::Unknown
}

// =============================================================================
// mdadm Backend
// =============================================================================

/// Adapter for Linux software RAID via mdadm.
pub struct MdadmBackend {
    spec: RaidSpec,
    config: ProvisionerConfig,
    runner: Arc<dyn CommandRunner>,
    enumerator: BlockDeviceEnumerator,
    util: Option<PathBuf>,
}

impl MdadmBackend {
    pub fn new(
        spec: RaidSpec,
        config: ProvisionerConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let enumerator = BlockDeviceEnumerator::new(runner.clone());
        Self {
            spec,
            config,
            runner,
            enumerator,
            util: None,
        }
    }

    fn util(&self) -> Result<&Path> {
        self.util
            .as_deref()
            .ok_or_else(|| Error::Internal("mdadm backend used before initialize".into()))
    }

    fn create_args(&self) -> Vec<String> {
        let mut args = vec![
            "--create".to_string(),
            self.spec.device_path.display().to_string(),
            "--quiet".to_string(),
            "--metadata=default".to_string(),
            format!("--level={}", self.spec.level),
            format!("--raid-devices={}", self.spec.devices.len()),
        ];
        for dev in &self.spec.devices {
            args.push(dev.as_str().to_string());
        }
        args
    }
}

#[async_trait]
impl RaidBackend for MdadmBackend {
    fn name(&self) -> &'static str {
        TOOL
    }

    async fn initialize(&mut self) -> Result<()> {
        self.util = Some(crate::exec::locate_tool(&[TOOL])?);
        Ok(())
    }

    /// A software array is 1:1 with its fixed device path; existence is a
    /// stat check that the path is a block device.
    async fn path_exists(&mut self) -> Result<bool> {
        debug!(path = %self.spec.device_path.display(), "checking for array device");
        let meta = match tokio::fs::symlink_metadata(&self.spec.device_path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        use std::os::unix::fs::FileTypeExt;
        Ok(meta.file_type().is_block_device())
    }

    /// Arrays are inferred through the OS device path; there is nothing to
    /// enumerate on a controller.
    async fn list_virtual_drives(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn create_virtual_drive(&mut self) -> Result<VirtualDrive> {
        let util = self.util()?.to_path_buf();
        let before = self.enumerator.snapshot().await?;

        let args = self.create_args();
        info!(command = ?args, "creating software RAID array");
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self.runner.run(&util, &arg_refs).await?;
        // mdadm reports some fatal conditions on stderr with exit code 0
        if !out.stderr.trim().is_empty() {
            return Err(Error::command_failed(TOOL, out.code, &out.stderr));
        }
        out.check(TOOL)?;

        let settle = self.config.settle.clone();
        let mut created = None;
        for attempt in 1..=settle.attempts {
            settle.pause().await;
            let after = self.enumerator.snapshot().await?;
            let fresh = reconcile::new_elements(before.names(), after.names());
            if let Some(name) =
                reconcile::confirm_new_block_device(&fresh, &self.spec.device_path)?
            {
                created = Some(name);
                break;
            }
            debug!(attempt, "array device not yet visible");
        }
        let name = created.ok_or_else(|| {
            settle.timeout(format!(
                "array device {}",
                self.spec.device_path.display()
            ))
        })?;

        info!(array = %name, "created software RAID array");
        Ok(VirtualDrive {
            id: name,
            devices: self.spec.devices.clone(),
            device_path: self.spec.device_path.clone(),
            state: ReadinessState::Unknown,
            created_at: chrono::Utc::now(),
        })
    }

    async fn delete_virtual_drive(&mut self, vd: &VirtualDrive) -> Result<()> {
        let util = self.util()?.to_path_buf();
        let path = vd.device_path.display().to_string();

        info!(array = %path, "stopping software RAID array");
        let out = self.runner.run(&util, &["--stop", &path]).await?;
        out.check(TOOL)?;

        // A member that was fully overwritten before teardown has no
        // superblock left; a failed wipe on it is expected.
        for dev in &self.spec.devices {
            debug!(device = %dev, "wiping member superblock");
            let out = self
                .runner
                .run(&util, &["--zero-superblock", dev.as_str()])
                .await?;
            if !out.success() {
                warn!(
                    device = %dev,
                    code = out.code,
                    stderr = %out.stderr.trim(),
                    "superblock wipe failed, continuing"
                );
            }
        }
        Ok(())
    }

    async fn is_ready(&self) -> Result<ReadinessState> {
        let name = self.spec.os_name()?;
        debug!(array = %name, "reading array status");
        let mdstat = tokio::fs::read_to_string(&self.config.mdstat_path).await?;
        Ok(array_readiness(&mdstat, name))
    }

    fn bound_vd(&self) -> Option<&str> {
        None
    }
}
