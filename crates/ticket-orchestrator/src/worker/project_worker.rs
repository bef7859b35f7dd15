//! One worker thread per project, draining its ticket queue in priority order

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use anyhow::Context;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::agent_runtime::{RunOutcome, RunRequest};
use crate::context_engine::TicketContext;
use crate::shared_state::{AtomicCounters, SharedState};
use crate::store::{MessageRole, Project, SessionStatus, Ticket, TicketStatus, UsageTotals};
use crate::worker::prompt::{build_prompt, PromptInput};

/// Where a ticket ends up once an attempt is over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    AwaitingReview,
    /// Back to `open`, session ended with the given status.
    Reopened(SessionStatus),
    /// Daemon stopping; back to `pending`.
    Requeued,
    Stuck,
    Failed(String),
}

impl Disposition {
    fn ticket_status(&self) -> TicketStatus {
        match self {
            Disposition::AwaitingReview => TicketStatus::AwaitingInput,
            Disposition::Reopened(_) => TicketStatus::Open,
            Disposition::Requeued => TicketStatus::Pending,
            Disposition::Stuck => TicketStatus::Stuck,
            Disposition::Failed(_) => TicketStatus::Failed,
        }
    }

    fn session_status(&self) -> SessionStatus {
        match self {
            Disposition::AwaitingReview => SessionStatus::Completed,
            Disposition::Reopened(status) => *status,
            Disposition::Requeued => SessionStatus::Stopped,
            Disposition::Stuck => SessionStatus::Stuck,
            Disposition::Failed(_) => SessionStatus::Failed,
        }
    }
}

pub struct ProjectWorker {
    state: Arc<SharedState>,
    project_id: i64,
    project_code: String,
    shutdown: watch::Receiver<bool>,
}

impl ProjectWorker {
    pub fn new(state: Arc<SharedState>, project: &Project, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            state,
            project_id: project.id,
            project_code: project.code.clone(),
            shutdown,
        }
    }

    /// Run the worker on a dedicated thread with its own single-threaded runtime.
    pub fn spawn(self) -> anyhow::Result<JoinHandle<()>> {
        let name = format!("project-{}", self.project_code);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Failed to create worker runtime: {}", e);
                        return;
                    }
                };
                rt.block_on(self.run());
            })
            .with_context(|| format!("spawning worker thread {}", name))?;
        info!("Spawned worker thread: {}", name);
        Ok(handle)
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }

    /// Sleep one poll interval, waking early on shutdown.
    async fn idle(&mut self) {
        let poll = self.state.config.worker.poll_interval;
        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            _ = self.shutdown.changed() => {}
        }
    }

    /// Process tickets until the queue stays empty for one poll interval or
    /// the daemon stops.
    pub async fn run(mut self) {
        info!(project = %self.project_code, "Worker started");
        let mut idle_rounds = 0;

        while !self.stopping() {
            match self.state.store.tickets.next_ticket(self.project_id) {
                Ok(Some(ticket)) => {
                    idle_rounds = 0;
                    self.process_ticket(ticket).await;
                }
                Ok(None) if idle_rounds == 0 => {
                    idle_rounds += 1;
                    self.idle().await;
                }
                Ok(None) => {
                    info!(project = %self.project_code, "No more tickets, worker stopping");
                    break;
                }
                Err(e) => {
                    error!(project = %self.project_code, "Failed to fetch next ticket: {:#}", e);
                    self.idle().await;
                }
            }
        }
        info!(project = %self.project_code, "Worker stopped");
    }

    /// One ticket from `in_progress` to a terminal disposition. Errors are
    /// contained here and turn into a failed ticket.
    pub async fn process_ticket(&mut self, ticket: Ticket) {
        let store = Arc::clone(&self.state.store);
        let session = match store.sessions.create_session(ticket.id) {
            Ok(session) => session,
            Err(e) => {
                error!(ticket_id = ticket.id, "Failed to create session: {:#}", e);
                self.idle().await;
                return;
            }
        };
        AtomicCounters::inc(&self.state.counters.tickets_started);
        info!(ticket_id = ticket.id, session_id = session.id, "Processing: {} - {}", ticket.ticket_number, ticket.title);

        let started = Instant::now();
        let mut usage = UsageTotals::default();
        let disposition = match self.attempt(&ticket, session.id, &mut usage).await {
            Ok(disposition) => disposition,
            Err(e) => {
                error!(ticket_id = ticket.id, "Ticket processing failed: {:#}", e);
                Disposition::Failed(format!("{:#}", e))
            }
        };
        self.finish(&ticket, session.id, &disposition, &usage, started.elapsed().as_secs() as i64)
            .await;
        self.state.compactor.refresh_project_map(ticket.project_id);
    }

    async fn attempt(&mut self, ticket: &Ticket, session_id: i64, usage: &mut UsageTotals) -> anyhow::Result<Disposition> {
        let state = Arc::clone(&self.state);
        let store = &state.store;
        let project = store
            .tickets
            .get_project(ticket.project_id)?
            .with_context(|| format!("project {} not found", ticket.project_id))?;

        match state.services.backup.backup(&project).await {
            Ok(Some(path)) => self.log(session_id, "info", &format!("Backup created: {}", path.display())),
            Ok(None) => {}
            Err(e) => {
                warn!(project = %project.code, "Backup failed: {:#}", e);
                self.log(session_id, "error", &format!("Backup failed: {:#}", e));
            }
        }

        store.tickets.update_ticket_status(ticket.id, TicketStatus::InProgress, None)?;
        self.log(session_id, "info", &format!("Starting: {}", ticket.ticket_number));

        if store.conversations.message_count(ticket.id)? == 0 {
            let seed = format!(
                "Task: {}\n\n{}",
                ticket.title,
                ticket.description.as_deref().unwrap_or_default()
            );
            store
                .conversations
                .add_message(ticket.id, Some(session_id), MessageRole::User, seed.trim_end(), None)?;
        }

        let work_dir = self.work_dir(&project);
        loop {
            let context = match state.compactor.build_context(&project, ticket).await {
                Ok(context) => context,
                Err(e) => {
                    warn!(ticket_id = ticket.id, "Context build failed, using bare history: {:#}", e);
                    TicketContext {
                        history: store.conversations.unsummarized(ticket.id)?,
                        ..Default::default()
                    }
                }
            };
            let prompt = build_prompt(&PromptInput {
                project: &project,
                ticket,
                context: &context,
                global_context: state.config.global_context.as_deref(),
                completion_marker: &state.config.runner.completion_marker,
                work_dir: &work_dir,
            });
            debug!(ticket_id = ticket.id, prompt_chars = prompt.len(), history = context.history.len(), "prompt built");

            let request = RunRequest {
                ticket,
                session_id,
                work_dir: &work_dir,
                prompt: &prompt,
            };
            let report = state.runner.run(&request, &mut self.shutdown).await;
            usage.add(&report.usage);
            let had_feedback = !report.feedback.is_empty();

            let finished = matches!(report.outcome, RunOutcome::Completed | RunOutcome::Success);
            if finished && (had_feedback || self.collect_feedback(ticket.id, session_id) > 0) {
                info!(ticket_id = ticket.id, "Processing user feedback before completing");
                continue;
            }

            let disposition = match report.outcome {
                RunOutcome::Completed | RunOutcome::Done => Disposition::AwaitingReview,
                RunOutcome::Success => {
                    Disposition::Failed("agent exited without completion marker".to_string())
                }
                RunOutcome::Interrupted => {
                    tokio::time::sleep(state.config.worker.feedback_grace).await;
                    if had_feedback || self.collect_feedback(ticket.id, session_id) > 0 {
                        info!(ticket_id = ticket.id, "Continuing with user feedback");
                        continue;
                    }
                    Disposition::Reopened(SessionStatus::Stopped)
                }
                RunOutcome::Skipped => Disposition::Reopened(SessionStatus::Skipped),
                RunOutcome::Stopped => Disposition::Requeued,
                RunOutcome::Stuck => Disposition::Stuck,
                RunOutcome::Failed(reason) => Disposition::Failed(reason),
            };
            return Ok(disposition);
        }
    }

    /// Move pending non-command inbox messages into the conversation.
    fn collect_feedback(&self, ticket_id: i64, session_id: i64) -> usize {
        let store = &self.state.store;
        let pending = match store.conversations.take_pending_messages(ticket_id) {
            Ok(pending) => pending,
            Err(e) => {
                warn!(ticket_id, "Inbox read failed: {:#}", e);
                return 0;
            }
        };

        let mut added = 0;
        for message in pending {
            let content = message.content.trim();
            if content.is_empty() || content.starts_with('/') {
                debug!(ticket_id, content, "ignoring command outside a run");
                continue;
            }
            match store
                .conversations
                .add_message(ticket_id, Some(session_id), MessageRole::User, content, None)
            {
                Ok(_) => {
                    added += 1;
                    self.log(session_id, "info", &format!("User message: {}", content));
                }
                Err(e) => warn!(ticket_id, "Failed to save feedback: {:#}", e),
            }
        }
        added
    }

    async fn finish(&self, ticket: &Ticket, session_id: i64, disposition: &Disposition, usage: &UsageTotals, duration: i64) {
        let state = &self.state;
        let store = &state.store;

        let written = match disposition {
            Disposition::AwaitingReview => {
                let deadline = Utc::now() + chrono::Duration::days(state.config.worker.review_period_days);
                AtomicCounters::inc(&state.counters.tickets_awaiting_review);
                store
                    .tickets
                    .mark_awaiting_input(ticket.id, Some("Completed successfully"), deadline)
            }
            Disposition::Failed(reason) => {
                AtomicCounters::inc(&state.counters.tickets_failed);
                store
                    .tickets
                    .update_ticket_status(ticket.id, TicketStatus::Failed, Some(reason))
            }
            other => store.tickets.update_ticket_status(ticket.id, other.ticket_status(), None),
        };
        if let Err(e) = written {
            error!(ticket_id = ticket.id, "Failed to update ticket status: {:#}", e);
        }

        if *disposition == Disposition::Stuck {
            AtomicCounters::inc(&state.counters.tickets_stuck);
            let minutes = state.config.runner.stuck_timeout.as_secs() / 60;
            let subject = format!("Stuck on {}", ticket.ticket_number);
            let body = format!("Ticket: {}\nNo activity for {} minutes.", ticket.title, minutes);
            if let Err(e) = state.services.notifier.notify(&subject, &body).await {
                warn!(ticket_id = ticket.id, "Stuck alert not delivered: {:#}", e);
            }
        }

        if let Err(e) = store
            .sessions
            .record_usage(session_id, ticket.id, ticket.project_id, usage, duration)
            .and_then(|_| store.tickets.add_usage(ticket.id, ticket.project_id, usage.total_tokens(), duration))
        {
            warn!(ticket_id = ticket.id, "Failed to record usage: {:#}", e);
        }
        if let Err(e) = store
            .sessions
            .end_session(session_id, disposition.session_status(), usage.total_tokens())
        {
            error!(session_id, "Failed to end session: {:#}", e);
        }

        match disposition {
            Disposition::AwaitingReview => info!(ticket_id = ticket.id, "Completed: {} (awaiting review)", ticket.ticket_number),
            Disposition::Failed(reason) => error!(ticket_id = ticket.id, "Failed: {}: {}", ticket.ticket_number, reason),
            other => info!(ticket_id = ticket.id, status = %other.ticket_status(), "Finished attempt on {}", ticket.ticket_number),
        }
    }

    fn work_dir(&self, project: &Project) -> PathBuf {
        project
            .work_path()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.state.config.worker.projects_root.join(&project.code))
    }

    fn log(&self, session_id: i64, log_type: &str, message: &str) {
        if let Err(e) = self.state.store.sessions.log(session_id, log_type, message) {
            debug!(session_id, "execution log write failed: {:#}", e);
        }
    }
}
