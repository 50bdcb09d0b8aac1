//! Driver configuration.

use crate::error::{BoxError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default install location of the isolate binary.
pub const DEFAULT_ISOLATE_PATH: &str = "/usr/local/bin/isolate";

/// Attempts made by a single run before giving up.
pub const DEFAULT_RUN_RETRIES: u32 = 3;

/// Sleep between run attempts.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Upper bound on self-healing init cycles per box creation.
pub const DEFAULT_MAX_INIT_ATTEMPTS: u32 = 5;

/// How the driver talks to the isolation primitive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub isolate_path: PathBuf,
    pub run_retries: u32,
    #[serde(with = "duration_ms")]
    pub retry_backoff: Duration,
    pub max_init_attempts: u32,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            isolate_path: PathBuf::from(DEFAULT_ISOLATE_PATH),
            run_retries: DEFAULT_RUN_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            max_init_attempts: DEFAULT_MAX_INIT_ATTEMPTS,
        }
    }
}

impl SandboxConfig {
    pub fn new(isolate_path: impl Into<PathBuf>) -> Self {
        Self {
            isolate_path: isolate_path.into(),
            ..Self::default()
        }
    }

    /// Fails fast when the isolate binary is not an existing file.
    pub fn validate(&self) -> Result<()> {
        match std::fs::metadata(&self.isolate_path) {
            Ok(meta) if meta.is_file() => Ok(()),
            _ => Err(BoxError::IsolateMissing(self.isolate_path.clone())),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
