//! Decoding of the isolate meta file.
//!
//! The meta file is line oriented `key:value` text. Known keys fill in a
//! [`RunResult`]; unknown keys are logged and skipped so newer isolate
//! versions keep working. Malformed numbers decode as zero.

use serde::{Serialize, Serializer};
use std::fmt;
use tracing::warn;

/// Status code reported by isolate for a finished run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RunStatus {
    /// Normal exit. Isolate omits the status line in this case.
    #[default]
    Ok,
    /// Non-zero exit code.
    RuntimeError,
    /// Terminated by a signal.
    Signaled,
    /// CPU or wall time limit exceeded.
    TimedOut,
    /// Isolate itself failed; the run says nothing about the program.
    InternalError,
    /// A code this driver does not know about.
    Other(String),
}

impl RunStatus {
    pub fn from_code(code: &str) -> Self {
        match code {
            "OK" => Self::Ok,
            "RE" => Self::RuntimeError,
            "SG" => Self::Signaled,
            "TO" => Self::TimedOut,
            "XX" => Self::InternalError,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn code(&self) -> &str {
        match self {
            Self::Ok => "OK",
            Self::RuntimeError => "RE",
            Self::Signaled => "SG",
            Self::TimedOut => "TO",
            Self::InternalError => "XX",
            Self::Other(code) => code,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl Serialize for RunStatus {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.code())
    }
}

/// Result of one command run inside a box.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunResult {
    /// Peak cgroup memory in KiB.
    pub memory: u64,
    pub exit_code: i32,
    /// Terminating signal, 0 when the program was not signaled.
    pub exit_signal: i32,
    pub killed: bool,
    pub message: String,
    pub status: RunStatus,
    /// CPU time in seconds.
    pub time: f64,
    /// Combined stdout/stderr of isolate itself, not of the sandboxed program.
    #[serde(rename = "internal_msg")]
    pub internal_message: String,
}

impl RunResult {
    pub fn signal(&self) -> Option<i32> {
        (self.exit_signal != 0).then_some(self.exit_signal)
    }

    pub fn is_internal_error(&self) -> bool {
        self.status == RunStatus::InternalError
    }
}

/// Parses meta file contents. `internal_message` is the captured isolate output.
pub fn parse_meta(contents: &str, internal_message: String) -> RunResult {
    let mut result = RunResult {
        internal_message,
        ..RunResult::default()
    };

    for line in contents.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key {
            "cg-mem" => result.memory = value.trim().parse().unwrap_or(0),
            "exitcode" => result.exit_code = value.trim().parse().unwrap_or(0),
            "exitsig" => result.exit_signal = value.trim().parse().unwrap_or(0),
            "killed" => result.killed = true,
            "message" => result.message = value.to_string(),
            "status" => result.status = RunStatus::from_code(value.trim()),
            "time" => result.time = value.trim().parse().unwrap_or(0.0),
            "time-wall" | "max-rss" | "csw-voluntary" | "csw-forced" | "cg-enabled"
            | "cg-oom-killed" => {}
            _ => warn!(key, value, "Unknown isolate stat"),
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_basic_report() {
        let result = parse_meta("status:OK\nexitcode:0\ntime:0.042\ncg-mem:2048\n", String::new());
        assert_eq!(result.status, RunStatus::Ok);
        assert_eq!(result.status.code(), "OK");
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.time, 0.042);
        assert_eq!(result.memory, 2048);
        assert!(!result.killed);
    }

    #[test]
    fn missing_status_means_ok() {
        let result = parse_meta("time:0.001\n", String::new());
        assert_eq!(result.status, RunStatus::Ok);
    }

    #[test]
    fn unknown_key_does_not_corrupt_later_fields() {
        let result = parse_meta(
            "exitcode:3\nfuture-field:17\nstatus:RE\ncg-mem:512\n",
            String::new(),
        );
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.status, RunStatus::RuntimeError);
        assert_eq!(result.memory, 512);
    }

    #[test]
    fn malformed_numbers_decode_as_zero() {
        let result = parse_meta("cg-mem:lots\ntime:fast\nexitcode:x\nstatus:TO\n", String::new());
        assert_eq!(result.memory, 0);
        assert_eq!(result.time, 0.0);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.status, RunStatus::TimedOut);
    }

    #[test]
    fn killed_marker_needs_no_value() {
        let result = parse_meta("killed:\nexitsig:9\nstatus:SG\n", String::new());
        assert!(result.killed);
        assert_eq!(result.signal(), Some(9));
        assert_eq!(result.status, RunStatus::Signaled);
    }

    #[test]
    fn lines_without_separator_are_skipped() {
        let result = parse_meta("garbage\n\nexitcode:1\n", String::new());
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.signal(), None);
    }

    #[test]
    fn message_keeps_colons() {
        let result = parse_meta("message:Caught fatal signal 11: SIGSEGV\n", String::new());
        assert_eq!(result.message, "Caught fatal signal 11: SIGSEGV");
    }

    #[test]
    fn internal_error_status_is_flagged() {
        let result = parse_meta("status:XX\n", "isolate crashed".to_string());
        assert!(result.is_internal_error());
        assert_eq!(result.internal_message, "isolate crashed");
    }

    #[test]
    fn ignored_keys_are_silently_dropped() {
        let result = parse_meta(
            "time-wall:1.2\nmax-rss:900\ncsw-voluntary:3\ncsw-forced:1\ncg-enabled:1\ncg-oom-killed:1\n",
            String::new(),
        );
        assert_eq!(result, RunResult::default());
    }

    #[test]
    fn status_serializes_as_code() {
        let json = serde_json::to_value(RunStatus::InternalError).unwrap();
        assert_eq!(json, serde_json::json!("XX"));
        assert_eq!(RunStatus::from_code("ZZ").code(), "ZZ");
    }
}
