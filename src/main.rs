//! minbox - drive the isolate sandbox from the command line or over HTTP.
//!
//! Usage:
//!   minbox serve [--port 8080]                  # Start HTTP server
//!   minbox run --box-id 1 [--stdin FILE] [limits] -- <cmd...>  # One-off run
//!   minbox demo [--box-id 50]                   # Run a python echo program
//!   minbox version                              # Print the isolate version

use clap::{Args, Parser, Subcommand};
use minbox::state::AppState;
use minbox::{http_server, resolve_command, BoxManager, DirRule, RunConfig, SandboxConfig};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "minbox")]
#[command(about = "Driver for the isolate sandbox")]
struct Cli {
    /// Path to the isolate binary
    #[arg(long, global = true, default_value = minbox::config::DEFAULT_ISOLATE_PATH)]
    isolate_path: PathBuf,

    /// Attempts per run before giving up
    #[arg(long, global = true, default_value_t = minbox::config::DEFAULT_RUN_RETRIES)]
    retries: u32,

    /// Sleep between run attempts in milliseconds
    #[arg(long, global = true, default_value = "200")]
    backoff_ms: u64,

    /// Self-healing init cycles before box creation fails
    #[arg(long, global = true, default_value_t = minbox::config::DEFAULT_MAX_INIT_ATTEMPTS)]
    init_attempts: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "8080")]
        port: u16,
    },
    /// Run one command in a fresh box
    Run(RunArgs),
    /// Run a small python program that echoes its input
    Demo {
        #[arg(long, default_value = "50")]
        box_id: u32,
    },
    /// Print the isolate version
    Version,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long, default_value = "0")]
    box_id: u32,

    /// Host file staged as the program's standard input
    #[arg(long, visible_alias = "input")]
    stdin: Option<PathBuf>,

    /// CPU time limit in seconds
    #[arg(long, default_value = "0")]
    time: f64,

    /// Wall clock limit in seconds
    #[arg(long, default_value = "0")]
    wall_time: f64,

    /// Memory limit in KB
    #[arg(long, default_value = "0")]
    mem: u64,

    /// Directory rule, IN[=OUT][:OPTS]
    #[arg(long = "dir")]
    dirs: Vec<String>,

    /// Inherit the full environment
    #[arg(long)]
    full_env: bool,

    /// Environment variable to set, KEY=VALUE
    #[arg(long = "env")]
    env: Vec<String>,

    /// Environment variable to pass through from the host
    #[arg(long = "env-inherit")]
    env_inherit: Vec<String>,

    /// Command and arguments to run
    #[arg(last = true, required = true)]
    cmd_args: Vec<String>,
}

const STDIN_FILE: &str = "/box/stdin.txt";
const STDOUT_FILE: &str = "/box/stdout.txt";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    if !nix::unistd::geteuid().is_root() {
        warn!("Not running as root, isolate may refuse to start");
    }

    let config = SandboxConfig {
        isolate_path: cli.isolate_path,
        run_retries: cli.retries,
        retry_backoff: Duration::from_millis(cli.backoff_ms),
        max_init_attempts: cli.init_attempts,
    };
    let manager = match BoxManager::new(config) {
        Ok(manager) => manager,
        Err(e) => {
            error!("{}", e);
            exit(1);
        }
    };

    let outcome = match cli.command {
        Commands::Serve { port } => http_server::run_server(port, AppState::new(manager))
            .await
            .map_err(|e| e.to_string()),
        Commands::Run(args) => run_once(&manager, args).await,
        Commands::Demo { box_id } => demo(&manager, box_id).await,
        Commands::Version => {
            println!("{}", manager.isolate_version().await);
            Ok(())
        }
    };

    if let Err(e) = outcome {
        error!("{}", e);
        exit(1);
    }
}

async fn run_once(manager: &BoxManager, args: RunArgs) -> Result<(), String> {
    let command = resolve_command(&args.cmd_args).map_err(|e| e.to_string())?;
    let mut env_to_set = BTreeMap::new();
    for pair in &args.env {
        match pair.split_once('=') {
            Some((key, val)) => env_to_set.insert(key.to_string(), val.to_string()),
            None => return Err(format!("invalid --env {pair:?}, expected KEY=VALUE")),
        };
    }
    let handle = manager.create(args.box_id).await.map_err(|e| e.to_string())?;

    let mut config = RunConfig {
        output_path: STDOUT_FILE.to_string(),
        stderr_to_stdout: true,
        time_limit: args.time,
        wall_time_limit: args.wall_time,
        memory_limit: args.mem,
        inherit_env: args.full_env,
        env_to_inherit: args.env_inherit.clone(),
        env_to_set,
        directories: args.dirs.iter().map(|d| DirRule::parse(d)).collect(),
        ..RunConfig::default()
    };

    let result = async {
        if let Some(input) = &args.stdin {
            let file = tokio::fs::File::open(input).await?;
            handle.write_file(STDIN_FILE, file, 0o644).await?;
            config.input_path = STDIN_FILE.to_string();
        }
        let report = handle.run(&CancellationToken::new(), &command, &config).await?;
        let output = handle.read_file(STDOUT_FILE).await.unwrap_or_default();
        Ok::<_, minbox::BoxError>((report, output))
    }
    .await;

    if let Err(e) = manager.teardown(handle).await {
        warn!("Box cleanup failed: {}", e);
    }

    let (report, output) = result.map_err(|e| e.to_string())?;
    print!("{}", String::from_utf8_lossy(&output));
    match report {
        Some(report) => {
            let json = serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?;
            eprintln!("{json}");
            Ok(())
        }
        None => Err("isolate kept failing, no result".to_string()),
    }
}

async fn demo(manager: &BoxManager, box_id: u32) -> Result<(), String> {
    let handle = manager.create(box_id).await.map_err(|e| e.to_string())?;

    let result = async {
        handle
            .write_file("/box/prog.in", &b"hello from the host"[..], 0o644)
            .await?;
        handle
            .write_file("/box/main.py", &b"print(input())"[..], 0o644)
            .await?;

        let command = resolve_command(&["python3".to_string(), "/box/main.py".to_string()])?;
        let config = RunConfig {
            input_path: "/box/prog.in".to_string(),
            output_path: "/box/prog.out".to_string(),
            stderr_to_stdout: true,
            memory_limit: 1024 * 1024,
            time_limit: 1.5,
            wall_time_limit: 3.0,
            inherit_env: true,
            directories: vec![DirRule::bind("/etc")],
            ..RunConfig::default()
        };
        let report = handle.run(&CancellationToken::new(), &command, &config).await?;
        let output = handle.read_file("/box/prog.out").await?;
        Ok::<_, minbox::BoxError>((report, output))
    }
    .await;

    if let Err(e) = manager.teardown(handle).await {
        warn!("Box cleanup failed: {}", e);
    }

    let (report, output) = result.map_err(|e| e.to_string())?;
    info!(report = ?report, "Run finished");
    info!("Got response from sandbox: {}", String::from_utf8_lossy(&output));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(argv: &[&str]) -> RunArgs {
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Run(args) => args,
            other => panic!("parsed {other:?}"),
        }
    }

    #[test]
    fn run_accepts_stdin_and_inherited_env() {
        let args = run_args(&[
            "minbox", "run", "--stdin", "in.txt", "--env-inherit", "PATH",
            "--env-inherit", "HOME", "--env", "A=1", "--", "/bin/cat",
        ]);
        assert_eq!(args.stdin, Some(PathBuf::from("in.txt")));
        assert_eq!(args.env_inherit, vec!["PATH", "HOME"]);
        assert_eq!(args.env, vec!["A=1"]);
        assert_eq!(args.cmd_args, vec!["/bin/cat"]);
    }

    #[test]
    fn input_is_an_alias_for_stdin() {
        let args = run_args(&["minbox", "run", "--input", "in.txt", "--", "/bin/cat"]);
        assert_eq!(args.stdin, Some(PathBuf::from("in.txt")));
    }
}
