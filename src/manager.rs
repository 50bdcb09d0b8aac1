//! Box lifecycle: creation with self-healing, teardown, and version probing.

use crate::condition::{classify, Condition};
use crate::config::SandboxConfig;
use crate::error::{BoxError, Result};
use crate::sandbox::BoxHandle;
use nix::unistd::{chown, Gid, Uid};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{info, warn};

/// Reported when isolate is missing or does not print a version.
pub const UNKNOWN_VERSION: &str = "precompiled?";

/// Creates and destroys isolate boxes.
#[derive(Debug, Clone)]
pub struct BoxManager {
    config: Arc<SandboxConfig>,
}

impl BoxManager {
    /// Fails fast if the configured isolate binary does not exist.
    pub fn new(config: SandboxConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Initializes box `id`.
    ///
    /// A box left behind by an earlier run, or created without `--cg`, is
    /// cleaned up and initialization is retried. If isolate asks for root, the
    /// binary is chowned to root first. The number of cycles is bounded by
    /// `max_init_attempts`.
    pub async fn create(&self, id: u32) -> Result<BoxHandle> {
        let box_flag = format!("--box-id={id}");
        for _ in 0..self.config.max_init_attempts {
            let output = isolate_command(&self.config)
                .args(["--cg", box_flag.as_str(), "--init"])
                .output()
                .await
                .map_err(BoxError::Spawn)?;
            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            let combined = format!("{stdout}{}", String::from_utf8_lossy(&output.stderr));

            match classify(&combined) {
                Some(Condition::BoxAlreadyExists) => {
                    info!(box_id = id, "Box reset");
                    if let Err(e) = cleanup_box(&self.config, id, true).await {
                        warn!(box_id = id, error = %e, "Cleanup of existing box failed");
                    }
                    continue;
                }
                Some(Condition::IncompatibleCgroupMode) => {
                    info!(box_id = id, "Box reset (created without --cg)");
                    if let Err(e) = cleanup_box(&self.config, id, false).await {
                        warn!(box_id = id, error = %e, "Cleanup of non-cg box failed");
                    }
                    continue;
                }
                Some(Condition::RequiresRoot) => {
                    grant_root(&self.config.isolate_path)?;
                    continue;
                }
                _ => {}
            }

            if !output.status.success() {
                return Err(BoxError::Init {
                    id,
                    code: output.status.code(),
                    output: combined,
                });
            }

            let Some(root) = stdout.lines().map(str::trim).filter(|l| !l.is_empty()).last()
            else {
                return Err(BoxError::Init {
                    id,
                    code: output.status.code(),
                    output: "isolate did not print a box path".to_string(),
                });
            };
            info!(box_id = id, root, "Box initialized");
            return Ok(BoxHandle::new(id, PathBuf::from(root), self.config.clone()));
        }

        Err(BoxError::InitAttemptsExhausted {
            id,
            attempts: self.config.max_init_attempts,
        })
    }

    /// Destroys a box, consuming its handle.
    pub async fn teardown(&self, handle: BoxHandle) -> Result<()> {
        handle.close().await
    }

    /// First line of `isolate --version`, or [`UNKNOWN_VERSION`].
    pub async fn isolate_version(&self) -> String {
        let output = match isolate_command(&self.config).arg("--version").output().await {
            Ok(output) if output.status.success() => output,
            _ => return UNKNOWN_VERSION.to_string(),
        };
        let text = String::from_utf8_lossy(&output.stdout);
        let line = text.lines().next().unwrap_or_default();
        line.strip_prefix("The process isolator ")
            .unwrap_or(line)
            .to_string()
    }
}

pub(crate) fn isolate_command(config: &SandboxConfig) -> Command {
    Command::new(&config.isolate_path)
}

/// Runs `isolate --cleanup` for a box. `cgroup` selects the `--cg` form.
pub(crate) async fn cleanup_box(config: &SandboxConfig, id: u32, cgroup: bool) -> Result<()> {
    let mut cmd = isolate_command(config);
    if cgroup {
        cmd.arg("--cg");
    }
    let output = cmd
        .arg(format!("--box-id={id}"))
        .arg("--cleanup")
        .output()
        .await
        .map_err(BoxError::Spawn)?;
    if output.status.success() {
        return Ok(());
    }
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Err(BoxError::Cleanup {
        id,
        code: output.status.code(),
        output: text,
    })
}

fn grant_root(isolate_path: &Path) -> Result<()> {
    warn!(path = %isolate_path.display(), "isolate must run as root, chowning binary");
    chown(isolate_path, Some(Uid::from_raw(0)), Some(Gid::from_raw(0)))
        .map_err(|e| BoxError::Chown(e.to_string()))
}
