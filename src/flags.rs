//! Translation of a [`RunConfig`] into isolate command-line flags.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Stdio default for anything the caller leaves unset.
pub const NULL_DEVICE: &str = "/dev/null";

/// A directory rule exposing (or hiding) a path inside the box.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirRule {
    /// Path inside the box.
    #[serde(rename = "in")]
    pub inside: String,
    /// Path outside the box. Defaults to `inside` unless `verbatim` is set.
    #[serde(rename = "out")]
    pub outside: Option<String>,
    /// Mount options such as `rw`, `noexec` or `maybe`.
    pub opts: Option<String>,
    /// Revoke `inside` instead of binding it.
    pub removes: bool,
    /// Do not substitute `inside` for a missing `outside`.
    pub verbatim: bool,
}

impl DirRule {
    pub fn bind(inside: impl Into<String>) -> Self {
        Self {
            inside: inside.into(),
            ..Self::default()
        }
    }

    pub fn remove(inside: impl Into<String>) -> Self {
        Self {
            inside: inside.into(),
            removes: true,
            ..Self::default()
        }
    }

    pub fn outside(mut self, outside: impl Into<String>) -> Self {
        self.outside = Some(outside.into());
        self
    }

    pub fn opts(mut self, opts: impl Into<String>) -> Self {
        self.opts = Some(opts.into());
        self
    }

    pub fn verbatim(mut self) -> Self {
        self.verbatim = true;
        self
    }

    /// Parses the `IN[=OUT][:OPTS]` shorthand; `IN=` alone removes the path.
    pub fn parse(rule: &str) -> Self {
        let (target, opts) = match rule.split_once(':') {
            Some((target, opts)) if !opts.is_empty() => (target, Some(opts.to_string())),
            Some((target, _)) => (target, None),
            None => (rule, None),
        };
        match target.split_once('=') {
            Some((inside, "")) => Self::remove(inside),
            Some((inside, outside)) => Self {
                inside: inside.to_string(),
                outside: Some(outside.to_string()),
                opts,
                ..Self::default()
            },
            None => Self {
                inside: target.to_string(),
                opts,
                ..Self::default()
            },
        }
    }

    fn to_flag(&self) -> String {
        if self.removes {
            return format!("--dir={}=", self.inside);
        }
        let mut flag = format!("--dir={}", self.inside);
        match self.outside.as_deref().filter(|out| !out.is_empty()) {
            Some(outside) => {
                flag.push('=');
                flag.push_str(outside);
            }
            None if !self.verbatim => {
                flag.push('=');
                flag.push_str(&self.inside);
            }
            None => {}
        }
        if let Some(opts) = self.opts.as_deref().filter(|opts| !opts.is_empty()) {
            flag.push(':');
            flag.push_str(opts);
        }
        flag
    }
}

/// Declarative description of a single run.
///
/// Empty stdio paths resolve to [`NULL_DEVICE`], never to an inherited stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub stderr_to_stdout: bool,

    pub input_path: String,
    pub output_path: String,
    pub stderr_path: String,

    /// Memory limit in KiB, 0 for none.
    pub memory_limit: u64,

    /// CPU time limit in seconds, 0 for none.
    pub time_limit: f64,
    /// Wall clock limit in seconds, 0 for none.
    pub wall_time_limit: f64,

    pub inherit_env: bool,
    pub env_to_inherit: Vec<String>,
    pub env_to_set: BTreeMap<String, String>,

    pub directories: Vec<DirRule>,
}

impl RunConfig {
    /// Copy of this config with empty stdio paths replaced by the null device.
    pub fn with_defaults(&self) -> RunConfig {
        let mut effective = self.clone();
        for path in [
            &mut effective.input_path,
            &mut effective.output_path,
            &mut effective.stderr_path,
        ] {
            if path.is_empty() {
                *path = NULL_DEVICE.to_string();
            }
        }
        effective
    }
}

/// Builds the flags for `isolate --run`, without the command itself.
///
/// Flag order is significant: identity and cgroup flags, directory rules in
/// list order, environment, limits, stdio, meta file, then `--silent --run --`.
pub fn build_run_flags(box_id: u32, config: &RunConfig, meta_path: Option<&Path>) -> Vec<String> {
    let config = config.with_defaults();
    let mut flags = vec![
        format!("--box-id={box_id}"),
        "--cg".to_string(),
        "--processes".to_string(),
    ];

    flags.extend(config.directories.iter().map(DirRule::to_flag));

    if config.inherit_env {
        flags.push("--full-env".to_string());
    }
    flags.extend(config.env_to_inherit.iter().map(|name| format!("--env={name}")));
    flags.extend(
        config
            .env_to_set
            .iter()
            .map(|(key, val)| format!("--env={key}={val}")),
    );

    if config.time_limit != 0.0 {
        flags.push(format!("--time={}", config.time_limit));
    }
    if config.wall_time_limit != 0.0 {
        flags.push(format!("--wall-time={}", config.wall_time_limit));
    }
    if config.memory_limit != 0 {
        flags.push(format!("--cg-mem={}", config.memory_limit));
    }

    flags.push(format!("--stdin={}", config.input_path));
    flags.push(format!("--stdout={}", config.output_path));
    if config.stderr_to_stdout {
        flags.push("--stderr-to-stdout".to_string());
    } else {
        flags.push(format!("--stderr={}", config.stderr_path));
    }

    if let Some(meta) = meta_path {
        flags.push(format!("--meta={}", meta.display()));
    }

    flags.extend(["--silent", "--run", "--"].map(String::from));
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(config: &RunConfig) -> Vec<String> {
        build_run_flags(7, config, None)
    }

    #[test]
    fn unset_stdio_goes_to_null_device() {
        let out = flags(&RunConfig::default());
        assert!(out.contains(&"--stdin=/dev/null".to_string()));
        assert!(out.contains(&"--stdout=/dev/null".to_string()));
        assert!(out.contains(&"--stderr=/dev/null".to_string()));
        assert!(!out.iter().any(|f| f == "--stdin=" || f == "--stdout=" || f == "--stderr="));
    }

    #[test]
    fn defaults_do_not_mutate_caller_config() {
        let config = RunConfig::default();
        let effective = config.with_defaults();
        let _ = flags(&config);
        assert!(config.input_path.is_empty());
        assert_eq!(effective.input_path, NULL_DEVICE);
        assert_eq!(effective.stderr_path, NULL_DEVICE);
    }

    #[test]
    fn minimal_invocation_layout() {
        let out = build_run_flags(3, &RunConfig::default(), Some(Path::new("/tmp/meta")));
        assert_eq!(
            out,
            vec![
                "--box-id=3",
                "--cg",
                "--processes",
                "--stdin=/dev/null",
                "--stdout=/dev/null",
                "--stderr=/dev/null",
                "--meta=/tmp/meta",
                "--silent",
                "--run",
                "--",
            ]
        );
    }

    #[test]
    fn directory_rules_keep_order() {
        let config = RunConfig {
            directories: vec![
                DirRule::bind("/etc"),
                DirRule::remove("/tmp"),
                DirRule::bind("/data").outside("/srv/data").opts("rw"),
                DirRule::bind("/opt").verbatim(),
                DirRule::bind("/usr").opts("noexec"),
            ],
            ..RunConfig::default()
        };
        let dirs: Vec<String> = flags(&config)
            .into_iter()
            .filter(|f| f.starts_with("--dir="))
            .collect();
        assert_eq!(
            dirs,
            vec![
                "--dir=/etc=/etc",
                "--dir=/tmp=",
                "--dir=/data=/srv/data:rw",
                "--dir=/opt",
                "--dir=/usr=/usr:noexec",
            ]
        );
    }

    #[test]
    fn remove_rule_ignores_outside_and_opts() {
        let rule = DirRule::remove("/box").outside("/elsewhere").opts("rw");
        assert_eq!(rule.to_flag(), "--dir=/box=");
    }

    #[test]
    fn environment_flags_are_additive() {
        let mut env_to_set = BTreeMap::new();
        env_to_set.insert("LANG".to_string(), "C".to_string());
        let config = RunConfig {
            inherit_env: true,
            env_to_inherit: vec!["PATH".to_string()],
            env_to_set,
            ..RunConfig::default()
        };
        let out = flags(&config);
        let env: Vec<&String> = out
            .iter()
            .filter(|f| f.starts_with("--env") || f.starts_with("--full-env"))
            .collect();
        assert_eq!(env, vec!["--full-env", "--env=PATH", "--env=LANG=C"]);
    }

    #[test]
    fn limits_render_minimally() {
        let config = RunConfig {
            time_limit: 1.5,
            wall_time_limit: 3.0,
            memory_limit: 262144,
            ..RunConfig::default()
        };
        let out = flags(&config);
        assert!(out.contains(&"--time=1.5".to_string()));
        assert!(out.contains(&"--wall-time=3".to_string()));
        assert!(out.contains(&"--cg-mem=262144".to_string()));
    }

    #[test]
    fn zero_limits_emit_nothing() {
        let out = flags(&RunConfig::default());
        assert!(!out.iter().any(|f| f.starts_with("--time")
            || f.starts_with("--wall-time")
            || f.starts_with("--cg-mem")));
    }

    #[test]
    fn stderr_merge_replaces_stderr_path() {
        let config = RunConfig {
            output_path: "/box/out".to_string(),
            stderr_to_stdout: true,
            stderr_path: "/box/err".to_string(),
            ..RunConfig::default()
        };
        let out = flags(&config);
        assert!(out.contains(&"--stderr-to-stdout".to_string()));
        assert!(!out.iter().any(|f| f.starts_with("--stderr=")));
        assert!(out.contains(&"--stdout=/box/out".to_string()));
    }

    #[test]
    fn parses_rule_shorthand() {
        assert_eq!(DirRule::parse("/etc"), DirRule::bind("/etc"));
        assert_eq!(DirRule::parse("/tmp="), DirRule::remove("/tmp"));
        assert_eq!(
            DirRule::parse("/data=/srv/data:rw"),
            DirRule::bind("/data").outside("/srv/data").opts("rw")
        );
        assert_eq!(DirRule::parse("/usr:noexec"), DirRule::bind("/usr").opts("noexec"));
    }

    #[test]
    fn deserializes_toml_style_keys() {
        let rule: DirRule = serde_json::from_str(r#"{"in": "/etc", "opts": "noexec"}"#).unwrap();
        assert_eq!(rule.to_flag(), "--dir=/etc=/etc:noexec");
    }
}
