//! Scheduler - dispatches one worker per project with runnable tickets
//!
//! The registry holds at most one live worker per project id. Each pass reaps
//! finished workers, auto-closes tickets whose review window lapsed, then
//! starts workers for waiting projects up to the parallelism cap.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::shared_state::SharedState;
use crate::worker::ProjectWorker;

const AUTO_CLOSE_ACTOR: &str = "system";
const JOIN_POLL: Duration = Duration::from_millis(50);

struct WorkerHandle {
    project_code: String,
    thread: JoinHandle<()>,
    started_at: Instant,
}

/// Counts from one maintenance pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub reaped: usize,
    pub auto_closed: usize,
    pub spawned: usize,
    pub active: usize,
}

pub struct Scheduler {
    state: Arc<SharedState>,
    workers: DashMap<i64, WorkerHandle>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(state: Arc<SharedState>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            state,
            workers: DashMap::new(),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Ask the scheduler and every worker to stop.
    pub fn stop(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_stopping(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    pub fn active_projects(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.workers.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Poll until stopped, then wind down the workers.
    pub async fn run(&self) {
        let poll = self.state.config.scheduler.poll_interval;
        let mut shutdown = self.shutdown_rx.clone();
        info!(
            max_parallel = self.state.config.scheduler.max_parallel_projects,
            "Scheduler started"
        );

        while !self.is_stopping() {
            let report = self.run_pass();
            if report.spawned > 0 || report.reaped > 0 || report.auto_closed > 0 {
                debug!(?report, "maintenance pass");
            }
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = shutdown.changed() => {}
            }
        }

        let abandoned = self.shutdown_workers().await;
        if abandoned > 0 {
            warn!(abandoned, "Some workers did not stop in time");
        }
        info!("Scheduler stopped");
    }

    /// One maintenance pass. Errors are logged and the step skipped.
    pub fn run_pass(&self) -> PassReport {
        let mut report = PassReport {
            reaped: self.reap_finished(),
            ..Default::default()
        };

        match self.state.store.tickets.auto_close_expired(Utc::now(), AUTO_CLOSE_ACTOR) {
            Ok(closed) if !closed.is_empty() => {
                info!(tickets = ?closed, "Auto-closed tickets past their review deadline");
                report.auto_closed = closed.len();
            }
            Ok(_) => {}
            Err(e) => warn!("Auto-close pass failed: {:#}", e),
        }

        if !self.is_stopping() {
            report.spawned = self.spawn_workers();
        }
        report.active = self.workers.len();
        report
    }

    fn reap_finished(&self) -> usize {
        let finished: Vec<i64> = self
            .workers
            .iter()
            .filter(|entry| entry.value().thread.is_finished())
            .map(|entry| *entry.key())
            .collect();

        for project_id in &finished {
            if let Some((_, handle)) = self.workers.remove(project_id) {
                Self::join(project_id, handle);
            }
        }
        finished.len()
    }

    fn join(project_id: &i64, handle: WorkerHandle) {
        let ran_for = handle.started_at.elapsed();
        match handle.thread.join() {
            Ok(()) => debug!(project_id, project = %handle.project_code, ?ran_for, "Worker finished"),
            Err(_) => error!(project_id, project = %handle.project_code, "Worker thread panicked"),
        }
    }

    fn spawn_workers(&self) -> usize {
        let cap = self.state.config.scheduler.max_parallel_projects;
        if self.workers.len() >= cap {
            return 0;
        }

        let projects = match self.state.store.tickets.projects_with_runnable_tickets() {
            Ok(projects) => projects,
            Err(e) => {
                warn!("Failed to list projects with tickets: {:#}", e);
                return 0;
            }
        };

        let mut spawned = 0;
        for project in projects {
            if self.workers.len() >= cap {
                break;
            }
            let Entry::Vacant(slot) = self.workers.entry(project.id) else {
                continue;
            };
            let worker = ProjectWorker::new(Arc::clone(&self.state), &project, self.shutdown_rx.clone());
            match worker.spawn() {
                Ok(thread) => {
                    info!(project_id = project.id, project = %project.code, "Started worker");
                    slot.insert(WorkerHandle {
                        project_code: project.code.clone(),
                        thread,
                        started_at: Instant::now(),
                    });
                    spawned += 1;
                }
                Err(e) => error!(project = %project.code, "Failed to start worker: {:#}", e),
            }
        }
        spawned
    }

    /// Wait up to the join timeout for each worker; unresponsive ones are
    /// abandoned. Returns how many were abandoned.
    pub async fn shutdown_workers(&self) -> usize {
        self.stop();
        let timeout = self.state.config.scheduler.worker_join_timeout;
        let ids = self.active_projects();
        let mut abandoned = 0;

        for project_id in ids {
            let Some((_, handle)) = self.workers.remove(&project_id) else {
                continue;
            };
            let waited = Instant::now();
            while !handle.thread.is_finished() && waited.elapsed() < timeout {
                tokio::time::sleep(JOIN_POLL).await;
            }
            if handle.thread.is_finished() {
                Self::join(&project_id, handle);
            } else {
                warn!(project_id, project = %handle.project_code, "Abandoning unresponsive worker");
                abandoned += 1;
            }
        }
        abandoned
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context_engine::Summarizer;
    use crate::services::Services;
    use crate::store::test_support::{seed_project, seed_ticket, temp_store};
    use crate::store::{Priority, SessionStatus, TicketStatus, TicketStore};
    use async_trait::async_trait;

    struct NoSummaries;

    #[async_trait]
    impl Summarizer for NoSummaries {
        async fn summarize(&self, _prompt: &str) -> anyhow::Result<String> {
            anyhow::bail!("unused")
        }
    }

    fn state(dir: &std::path::Path, store: Arc<TicketStore>, max_parallel: usize) -> Arc<SharedState> {
        let script = dir.join("agent.sh");
        std::fs::write(&script, "sleep 30\n").unwrap();

        let mut config = Config::default();
        config.scheduler.max_parallel_projects = max_parallel;
        config.scheduler.poll_interval = Duration::from_millis(50);
        config.scheduler.worker_join_timeout = Duration::from_secs(5);
        config.worker.poll_interval = Duration::from_millis(50);
        config.worker.projects_root = dir.join("projects");
        config.runner.agent_command = vec!["/bin/sh".into(), script.display().to_string()];
        config.runner.watchdog_interval = Duration::from_millis(50);
        Arc::new(SharedState::new(config, store, Arc::new(NoSummaries), Services::disabled()))
    }

    async fn wait_for_running(store: &TicketStore, ticket_id: i64) {
        for _ in 0..100 {
            let status = store.tickets.get_ticket(ticket_id).unwrap().unwrap().status;
            if status == TicketStatus::InProgress {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("ticket {} never started", ticket_id);
    }

    #[tokio::test]
    async fn test_pass_respects_cap_and_single_worker_per_project() {
        let (dir, store) = temp_store();
        let store = Arc::new(store);
        let mut tickets = Vec::new();
        for code in ["A", "B", "C", "D"] {
            let project = seed_project(&store, code, None);
            tickets.push(seed_ticket(&store, project.id, &format!("{}-1", code), Priority::Medium));
            seed_ticket(&store, project.id, &format!("{}-2", code), Priority::Low);
        }

        let scheduler = Scheduler::new(state(dir.path(), Arc::clone(&store), 3));
        let first = scheduler.run_pass();
        assert_eq!(first.spawned, 3);
        assert_eq!(first.active, 3);

        let second = scheduler.run_pass();
        assert_eq!(second.spawned, 0);
        assert_eq!(scheduler.active_projects().len(), 3);

        for ticket in &tickets[..3] {
            wait_for_running(&store, ticket.id).await;
            assert_eq!(store.sessions.running_session_count(ticket.id).unwrap(), 1);
        }

        assert_eq!(scheduler.shutdown_workers().await, 0);
        assert!(scheduler.active_projects().is_empty());

        for ticket in &tickets[..3] {
            let ticket = store.tickets.get_ticket(ticket.id).unwrap().unwrap();
            assert_eq!(ticket.status, TicketStatus::Pending);
            let sessions = store.sessions.sessions_for_ticket(ticket.id).unwrap();
            assert_eq!(sessions[0].status, SessionStatus::Stopped);
        }
        let untouched = store.tickets.get_ticket(tickets[3].id).unwrap().unwrap();
        assert_eq!(untouched.status, TicketStatus::Open);
    }

    #[tokio::test]
    async fn test_pass_auto_closes_expired_reviews() {
        let (dir, store) = temp_store();
        let store = Arc::new(store);
        let project = seed_project(&store, "REV", None);
        let ticket = seed_ticket(&store, project.id, "REV-1", Priority::Medium);
        store
            .tickets
            .mark_awaiting_input(ticket.id, Some("done"), Utc::now() - chrono::Duration::hours(1))
            .unwrap();

        let scheduler = Scheduler::new(state(dir.path(), Arc::clone(&store), 3));
        let report = scheduler.run_pass();
        assert_eq!(report.auto_closed, 1);
        assert_eq!(report.spawned, 0);

        let ticket = store.tickets.get_ticket(ticket.id).unwrap().unwrap();
        assert_eq!(ticket.status, TicketStatus::Done);
        assert_eq!(ticket.close_reason.as_deref(), Some("auto_closed_7days"));
        assert_eq!(ticket.closed_by.as_deref(), Some("system"));
    }

    #[tokio::test]
    async fn test_run_returns_after_stop() {
        let (dir, store) = temp_store();
        let store = Arc::new(store);
        let scheduler = Arc::new(Scheduler::new(state(dir.path(), store, 2)));

        let stopper = Arc::clone(&scheduler);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            stopper.stop();
        });
        tokio::time::timeout(Duration::from_secs(5), scheduler.run())
            .await
            .expect("scheduler stops promptly");
        assert!(scheduler.is_stopping());
    }
}
