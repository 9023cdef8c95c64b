//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::path::Path;
use std::time::{Duration, Instant};

use analysis_bridge::config::ServerConfig;
use analysis_bridge::{ProcessState, Supervisor};

/// Config launching the bundled mock server with tight timeouts
pub fn mock_config(args: &[&str]) -> ServerConfig {
    let mut config = ServerConfig::for_command(
        env!("CARGO_BIN_EXE_mock-analyzer"),
        args.iter().map(|a| a.to_string()).collect(),
    );
    config.timeouts.request_ms = 2_000;
    config.timeouts.initialize_ms = 5_000;
    config.timeouts.shutdown_ms = 1_000;
    config.timeouts.exit_grace_ms = 500;
    config.timeouts.kill_grace_ms = 500;
    config.timeouts.spawn_confirm_ms = 50;
    config.restart.base_delay_ms = 100;
    config
}

/// Poll `check` until it holds or `timeout` elapses
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Wait for the supervisor to publish `state`
pub async fn wait_for_state(supervisor: &Supervisor, state: ProcessState, timeout: Duration) -> bool {
    let mut rx = supervisor.subscribe();
    let reached = tokio::time::timeout(timeout, rx.wait_for(|s| *s == state))
        .await
        .is_ok_and(|r| r.is_ok());
    reached
}

pub fn start_count(log: &Path) -> usize {
    std::fs::read_to_string(log)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}
