//! Resident Service
//!
//! Keeps the relay running until signalled:
//! - guards against a second instance with a PID file
//! - restores state and starts the maintenance loop
//! - logs a health summary periodically
//! - reloads credential seeds on `SIGHUP`
//! - flushes state and removes the PID file on `SIGTERM` / `SIGINT`

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use relay_core::{load_config_from_path, RequestOrchestrator};

/// How often the resident service logs a health summary
const STATUS_INTERVAL: Duration = Duration::from_secs(300);

/// Get the default PID file path
///
/// Uses `XDG_RUNTIME_DIR` if available, otherwise `/tmp/chat-relay-$UID/`
pub fn default_pid_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir)
            .join("chat-relay")
            .join("relay.pid")
    } else {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/chat-relay-{uid}/relay.pid"))
    }
}

/// Write PID file
fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create PID directory: {parent:?}"))?;
    }

    let pid = std::process::id();
    let mut file =
        fs::File::create(path).with_context(|| format!("Failed to create PID file: {path:?}"))?;
    writeln!(file, "{pid}")?;

    info!(pid = pid, path = ?path, "PID file created");
    Ok(())
}

/// Remove PID file
fn remove_pid_file(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!(error = %e, path = ?path, "Failed to remove PID file");
        } else {
            info!(path = ?path, "PID file removed");
        }
    }
}

/// Check if another relay is running by checking the PID file
fn check_existing_daemon(pid_path: &Path) -> Result<()> {
    if !pid_path.exists() {
        return Ok(());
    }

    let pid_str = fs::read_to_string(pid_path)
        .with_context(|| format!("Failed to read PID file: {pid_path:?}"))?;

    let pid: i32 = pid_str
        .trim()
        .parse()
        .with_context(|| "Invalid PID in file")?;

    // Signal 0 only checks existence
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        anyhow::bail!(
            "Another relay-daemon is already running (PID: {pid}). \
             Stop it first or remove {pid_path:?} if it's stale."
        );
    }

    warn!(pid = pid, "Removing stale PID file");
    fs::remove_file(pid_path)?;
    Ok(())
}

/// Run resident until `SIGTERM` or `SIGINT`
pub async fn run(
    relay: RequestOrchestrator,
    config_path: Option<PathBuf>,
    pid_path: PathBuf,
) -> Result<()> {
    info!(pid_path = ?pid_path, "PID file path");
    if let Some(ref path) = config_path {
        info!(config_path = ?path, "Config file");
    }

    check_existing_daemon(&pid_path)?;
    write_pid_file(&pid_path)?;

    let result = serve(&relay, config_path.as_deref()).await;

    info!("Shutting down...");
    relay.shutdown().await;
    remove_pid_file(&pid_path);

    match result {
        Ok(()) => {
            info!("Relay daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Relay daemon stopped with error");
            Err(e)
        }
    }
}

async fn serve(relay: &RequestOrchestrator, config_path: Option<&Path>) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    relay.start().await.context("failed to start relay")?;
    info!("Relay ready");

    let mut status = tokio::time::interval(STATUS_INTERVAL);
    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating shutdown");
                break;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating shutdown");
                break;
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading credential seeds");
                reload_seeds(relay, config_path);
            }
            _ = status.tick() => log_health(relay),
        }
    }
    Ok(())
}

/// Re-read the config and add any credential seeds not yet in the pool
///
/// Other settings only take effect on restart.
fn reload_seeds(relay: &RequestOrchestrator, config_path: Option<&Path>) -> usize {
    match load_config_from_path(config_path.map(Path::to_path_buf)) {
        Ok(config) => {
            let added = relay.add_seeds(&config.credentials);
            info!(
                seeds = config.credentials.len(),
                added, "Credential seeds reloaded"
            );
            added
        }
        Err(e) => {
            warn!(error = %e, "Config reload failed, keeping current credentials");
            0
        }
    }
}

fn log_health(relay: &RequestOrchestrator) {
    let health = relay.health();
    if health.status == "ok" {
        info!(
            credentials = health.pool.total,
            active = health.pool.active,
            cooling = health.pool.cooling,
            disabled = health.pool.disabled,
            sessions = health.sessions.sessions,
            requests = health.metrics.requests,
            uptime_secs = health.uptime_secs,
            "Relay status"
        );
    } else {
        warn!(
            credentials = health.pool.total,
            cooling = health.pool.cooling,
            disabled = health.pool.disabled,
            sessions = health.sessions.sessions,
            "Relay degraded: no active credential"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use relay_core::{MemoryStore, RelayConfig, ScriptedUpstream};
    use tempfile::TempDir;

    #[test]
    fn test_pid_file_lifecycle() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("relay.pid");

        write_pid_file(&path).unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written.trim(), std::process::id().to_string());

        remove_pid_file(&path);
        assert!(!path.exists());
    }

    #[test]
    fn test_running_instance_is_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("relay.pid");
        write_pid_file(&path).unwrap();

        let err = check_existing_daemon(&path).unwrap_err();
        assert!(err.to_string().contains("already running"));
        assert!(path.exists());
    }

    #[test]
    fn test_stale_pid_file_is_removed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("relay.pid");
        fs::write(&path, format!("{}\n", i32::MAX)).unwrap();

        check_existing_daemon(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_garbage_pid_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("relay.pid");
        fs::write(&path, "not a pid").unwrap();
        assert!(check_existing_daemon(&path).is_err());
    }

    #[tokio::test]
    async fn test_reload_adds_new_seeds_only() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("relay.toml");
        fs::write(
            &config_path,
            r#"
[[credentials]]
secret = "secret-one-0123456789"
name = "one"
"#,
        )
        .unwrap();

        let relay = RequestOrchestrator::builder(RelayConfig::default())
            .upstream(Arc::new(ScriptedUpstream::new()))
            .state_store(Arc::new(MemoryStore::new()))
            .build()
            .unwrap();
        assert_eq!(reload_seeds(&relay, Some(&config_path)), 1);
        assert_eq!(reload_seeds(&relay, Some(&config_path)), 0);

        fs::write(
            &config_path,
            r#"
[[credentials]]
secret = "secret-one-0123456789"

[[credentials]]
secret = "secret-two-0123456789"
tier = "super"
"#,
        )
        .unwrap();
        assert_eq!(reload_seeds(&relay, Some(&config_path)), 1);
        assert_eq!(relay.pool().len(), 2);
    }

    #[tokio::test]
    async fn test_reload_with_broken_config_keeps_pool() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("relay.toml");
        fs::write(&config_path, "[[credentials]\nsecret = ").unwrap();

        let relay = RequestOrchestrator::builder(RelayConfig::default())
            .upstream(Arc::new(ScriptedUpstream::new()))
            .state_store(Arc::new(MemoryStore::new()))
            .build()
            .unwrap();
        relay
            .add_credential("secret-kept-0123456789", "kept", relay_core::Tier::Free)
            .unwrap();
        assert_eq!(reload_seeds(&relay, Some(&config_path)), 0);
        assert_eq!(relay.pool().len(), 1);
    }
}
