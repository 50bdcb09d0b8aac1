//! Box handles: file staging and command execution inside one isolate box.

use crate::condition::{classify, Condition};
use crate::config::SandboxConfig;
use crate::error::{BoxError, Result};
use crate::flags::{build_run_flags, RunConfig};
use crate::manager::{cleanup_box, isolate_command};
use crate::meta::{parse_meta, RunResult};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Prefix of paths that live inside the box working directory.
pub const BOX_DIR: &str = "/box";

/// One isolate box.
///
/// Every file and run operation takes the box lock, so operations against a
/// single box never overlap while different boxes proceed in parallel.
#[derive(Debug)]
pub struct BoxHandle {
    id: u32,
    root: PathBuf,
    config: Arc<SandboxConfig>,
    lock: Mutex<()>,
}

impl BoxHandle {
    pub(crate) fn new(id: u32, root: PathBuf, config: Arc<SandboxConfig>) -> Self {
        Self {
            id,
            root,
            config,
            lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Host path of the box, as printed by `isolate --init`.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a box path such as `/box/prog.in` to its location on the host.
    pub fn host_path(&self, box_path: &str) -> Result<PathBuf> {
        let relative = Path::new(box_path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(BoxError::InvalidPath(box_path.to_string()));
        }
        Ok(self.root.join(relative))
    }

    /// Writes `content` to a box path, creating or truncating the file.
    pub async fn write_file<R>(&self, path: &str, mut content: R, mode: u32) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let _guard = self.lock.lock().await;
        let full_path = self.host_path(path)?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(&full_path)
            .await?;
        tokio::io::copy(&mut content, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let _guard = self.lock.lock().await;
        let full_path = self.host_path(path)?;
        Ok(fs::read(&full_path).await?)
    }

    pub async fn file_exists(&self, path: &str) -> bool {
        let _guard = self.lock.lock().await;
        let Ok(full_path) = self.host_path(path) else {
            return false;
        };
        match fs::metadata(&full_path).await {
            Ok(_) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => {
                warn!(path = %full_path.display(), error = %e, "File stat returned weird error");
                false
            }
        }
    }

    /// Runs `command` inside the box.
    ///
    /// Attempts whose meta file is missing or reports an isolate failure
    /// (`XX`) are retried, as are programs that could not be exec'd. When
    /// every attempt fails the last result is returned, possibly `None`,
    /// without an error; callers must check for that.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        command: &[String],
        config: &RunConfig,
    ) -> Result<Option<RunResult>> {
        let program = command.first().ok_or(BoxError::EmptyCommand)?;
        let _guard = self.lock.lock().await;

        if program.starts_with(BOX_DIR) {
            self.check_executable(program).await;
        }
        debug!(box_id = self.id, command = ?command, config = ?config.with_defaults(), "Running command");

        let retries = self.config.run_retries;
        let mut last = None;
        for attempt in 1..=retries {
            let meta_file = match tempfile::Builder::new().prefix("sandbox-meta-").tempfile() {
                Ok(file) => file,
                Err(e) => {
                    warn!(box_id = self.id, error = %e, "Could not create meta file");
                    continue;
                }
            };

            let mut args = build_run_flags(self.id, config, Some(meta_file.path()));
            args.extend(command.iter().cloned());
            let result = self.run_isolate(cancel, &args, meta_file.path()).await?;
            drop(meta_file);

            match result {
                Some(result) if !result.is_internal_error() => {
                    let exec_failed = result.exit_code == 127
                        && classify(&result.internal_message) == Some(Condition::TextFileBusy);
                    if !exec_failed {
                        return Ok(Some(result));
                    }
                    debug!(box_id = self.id, attempt, "Program could not be executed, retrying");
                    last = Some(result);
                }
                other => {
                    last = other;
                    // The first failure is common enough in production to stay quiet.
                    if attempt > 1 {
                        warn!(box_id = self.id, attempt, retries, "Run error, retrying");
                    }
                }
            }
            self.backoff(cancel).await?;
        }

        Ok(last)
    }

    /// Destroys the box. The handle must not be used afterwards.
    pub async fn close(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        cleanup_box(&self.config, self.id, true).await
    }

    async fn check_executable(&self, program: &str) {
        let path = match self.host_path(program) {
            Ok(path) => path,
            Err(e) => {
                warn!(box_id = self.id, error = %e, "Executable path is not inside the box");
                return;
            }
        };
        match fs::metadata(&path).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(
                    box_id = self.id,
                    program, "Executable does not exist in sandbox and will probably error"
                );
            }
            Err(e) => warn!(box_id = self.id, program, error = %e, "Could not stat executable"),
        }
    }

    async fn run_isolate(
        &self,
        cancel: &CancellationToken,
        args: &[String],
        meta_path: &Path,
    ) -> Result<Option<RunResult>> {
        if cancel.is_cancelled() {
            return Err(BoxError::Cancelled);
        }
        let child = isolate_command(&self.config)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(BoxError::Spawn)?;

        // A non-zero isolate exit only reflects the program under test.
        let output = tokio::select! {
            output = child.wait_with_output() => output.map_err(BoxError::Spawn)?,
            _ = cancel.cancelled() => return Err(BoxError::Cancelled),
        };
        let mut internal = String::from_utf8_lossy(&output.stdout).into_owned();
        internal.push_str(&String::from_utf8_lossy(&output.stderr));

        match fs::read(meta_path).await {
            Ok(contents) => Ok(Some(parse_meta(&String::from_utf8_lossy(&contents), internal))),
            Err(e) => {
                warn!(box_id = self.id, error = %e, "Could not read meta file");
                Ok(None)
            }
        }
    }

    async fn backoff(&self, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(self.config.retry_backoff) => Ok(()),
            _ = cancel.cancelled() => Err(BoxError::Cancelled),
        }
    }
}
