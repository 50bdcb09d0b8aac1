//! End-to-end run against a real isolate install.
//!
//! Needs root and isolate at the default path:
//!   sudo -E cargo test --test isolate_e2e -- --ignored

use minbox::{BoxManager, RunConfig, RunStatus, SandboxConfig};
use tokio_util::sync::CancellationToken;

#[tokio::test]
#[ignore]
async fn echoes_staged_input() {
    let manager = BoxManager::new(SandboxConfig::default()).unwrap();
    let handle = manager.create(97).await.unwrap();

    handle
        .write_file("/box/prog.in", &b"hello"[..], 0o644)
        .await
        .unwrap();
    handle
        .write_file("/box/echo.sh", &b"read line\necho \"$line\"\n"[..], 0o755)
        .await
        .unwrap();

    let config = RunConfig {
        input_path: "/box/prog.in".to_string(),
        output_path: "/box/prog.out".to_string(),
        stderr_to_stdout: true,
        time_limit: 1.0,
        wall_time_limit: 2.0,
        ..RunConfig::default()
    };
    let command = vec!["/bin/sh".to_string(), "/box/echo.sh".to_string()];
    let result = handle
        .run(&CancellationToken::new(), &command, &config)
        .await
        .unwrap()
        .expect("isolate kept failing");

    assert_eq!(result.status, RunStatus::Ok);
    assert_eq!(result.exit_code, 0);
    assert_eq!(handle.read_file("/box/prog.out").await.unwrap(), b"hello\n");

    manager.teardown(handle).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn recreating_a_box_drops_stale_files() {
    let manager = BoxManager::new(SandboxConfig::default()).unwrap();
    let handle = manager.create(98).await.unwrap();
    handle
        .write_file("/box/stale.txt", &b"old"[..], 0o644)
        .await
        .unwrap();

    let again = manager.create(98).await.unwrap();
    assert!(!again.file_exists("/box/stale.txt").await);

    manager.teardown(again).await.unwrap();
}
