//! Daemon lifecycle
//!
//! Startup opens the store, resets work orphaned by a previous crash, records
//! the daemon as running and hands control to the scheduler. A SIGINT or
//! SIGTERM stops dispatch, winds the workers down and records the daemon as
//! stopped.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};

use crate::{
    config::Config,
    scheduler::Scheduler,
    shared_state::SharedState,
    store::{RecoveryReport, TicketStore},
};

/// Run the daemon until a termination signal arrives.
pub async fn run_daemon(cfg: Config) -> anyhow::Result<()> {
    crate::telemetry::init_tracing();
    cfg.print_config();

    info!("Starting ticket orchestration daemon");

    let store = Arc::new(TicketStore::open(&cfg.database_path, cfg.db_pool_size)?);
    log_recovery(&store.recover_orphans()?);
    check_agent_program(&cfg.runner.agent_command);

    let pid = std::process::id();
    let _pid_file = cfg.pid_file.as_deref().map(PidFile::create).transpose()?;
    store.set_daemon_status("running", Some(pid))?;
    info!(pid, "Daemon running");

    let state = Arc::new(SharedState::from_config(cfg, Arc::clone(&store)));
    let scheduler = Arc::new(Scheduler::new(Arc::clone(&state)));

    let stopper = Arc::clone(&scheduler);
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(name) => {
                info!("Received {}, shutting down", name);
                stopper.stop();
            }
            Err(e) => error!("Failed to install signal handlers: {}", e),
        }
    });

    scheduler.run().await;

    if let Err(e) = store.set_daemon_status("stopped", None) {
        warn!("Failed to record daemon status: {:#}", e);
    }
    state.log_counters();
    info!("Daemon stopped");
    Ok(())
}

/// Run startup recovery on its own, without starting the scheduler.
pub fn recover(cfg: &Config) -> anyhow::Result<RecoveryReport> {
    let store = TicketStore::open(&cfg.database_path, cfg.db_pool_size)?;
    let report = store.recover_orphans()?;
    log_recovery(&report);
    Ok(report)
}

/// Human-readable daemon status plus ticket counts.
pub fn status_lines(store: &TicketStore) -> anyhow::Result<Vec<String>> {
    let mut lines = Vec::new();
    match store.daemon_status()? {
        Some(status) => {
            let mut line = format!("Daemon: {}", status.status);
            if let Some(pid) = status.pid {
                line.push_str(&format!(" (PID {})", pid));
            }
            lines.push(line);
            if let Some(started_at) = status.started_at {
                lines.push(format!("Started: {}", started_at.to_rfc3339()));
            }
            lines.push(format!("Updated: {}", status.updated_at.to_rfc3339()));
        }
        None => lines.push("Daemon: never started".to_string()),
    }

    let counts = store.tickets.count_by_status()?;
    if counts.is_empty() {
        lines.push("Tickets: none".to_string());
    } else {
        lines.push("Tickets:".to_string());
        for (status, count) in counts {
            lines.push(format!("  {:<15} {}", status.as_str(), count));
        }
    }
    Ok(lines)
}

fn log_recovery(report: &RecoveryReport) {
    if report.is_noop() {
        info!("Startup recovery: nothing to reset");
    } else {
        warn!(
            tickets_reset = report.tickets_reset,
            sessions_marked_stuck = report.sessions_marked_stuck,
            "Startup recovery reset orphaned work"
        );
    }
}

fn check_agent_program(command: &[String]) {
    let Some(program) = command.first() else {
        return;
    };
    match which::which(program) {
        Ok(path) => info!("Agent program: {}", path.display()),
        Err(_) => warn!("Agent program {} not found on PATH; ticket runs will fail", program),
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.map(|_| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|_| "Ctrl-C")
}

/// PID file removed again when dropped.
struct PidFile {
    path: PathBuf,
}

impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        std::fs::write(path, std::process::id().to_string())
            .with_context(|| format!("writing pid file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove pid file {}: {}", self.path.display(), e);
        }
    }
}
