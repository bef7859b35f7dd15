//! Runs one agent process for a ticket and watches it

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::agent_runtime::events::{AgentEvent, AssistantEvent};
use crate::config::RunnerConfig;
use crate::services::Broadcaster;
use crate::store::{ConversationMessage, MessageRole, Ticket, TicketStore, UsageTotals};
use crate::utils::TextUtils;

const LOG_PREVIEW_CHARS: usize = 200;

/// How an agent run ended. The first control signal wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// `/skip` from the inbox.
    Skipped,
    /// Completion marker seen.
    Completed,
    /// `/done` from the inbox.
    Done,
    /// `/stop` from the inbox.
    Interrupted,
    /// Daemon shutdown.
    Stopped,
    Stuck,
    /// Exit code 0 without a completion marker.
    Success,
    Failed(String),
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Skipped => "skipped",
            RunOutcome::Completed => "completed",
            RunOutcome::Done => "done",
            RunOutcome::Interrupted => "interrupted",
            RunOutcome::Stopped => "stopped",
            RunOutcome::Stuck => "stuck",
            RunOutcome::Success => "success",
            RunOutcome::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub usage: UsageTotals,
    /// Non-command inbox messages consumed (and persisted) during the run.
    pub feedback: Vec<String>,
    pub elapsed: Duration,
}

pub struct RunRequest<'a> {
    pub ticket: &'a Ticket,
    pub session_id: i64,
    pub work_dir: &'a Path,
    pub prompt: &'a str,
}

struct RunState {
    usage: UsageTotals,
    marker_seen: bool,
    last_activity: Instant,
    feedback: Vec<String>,
    /// Persisted messages, broadcast in insertion order by one task per run.
    broadcasts: mpsc::UnboundedSender<ConversationMessage>,
}

pub struct AgentRunner {
    config: RunnerConfig,
    store: Arc<TicketStore>,
    broadcaster: Arc<dyn Broadcaster>,
}

impl AgentRunner {
    pub fn new(config: RunnerConfig, store: Arc<TicketStore>, broadcaster: Arc<dyn Broadcaster>) -> Self {
        Self {
            config,
            store,
            broadcaster,
        }
    }

    fn command(&self, request: &RunRequest<'_>) -> anyhow::Result<Command> {
        let (program, leading) = self
            .config
            .agent_command
            .split_first()
            .context("agent command is empty")?;

        let mut cmd = Command::new(program);
        cmd.args(leading)
            .arg("--model")
            .arg(&self.config.model)
            .arg("--verbose")
            .args(["--output-format", "stream-json"])
            .arg("--dangerously-skip-permissions")
            .arg("-p")
            .arg(request.prompt)
            .current_dir(request.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }

    /// Run the agent to an outcome. Never returns an error: spawn and I/O
    /// failures become `RunOutcome::Failed`.
    pub async fn run(&self, request: &RunRequest<'_>, shutdown: &mut watch::Receiver<bool>) -> RunReport {
        let started = Instant::now();
        let (broadcasts, mut queue) = mpsc::unbounded_channel::<ConversationMessage>();
        let broadcaster = Arc::clone(&self.broadcaster);
        tokio::spawn(async move {
            while let Some(message) = queue.recv().await {
                broadcaster.broadcast(&message).await;
            }
        });

        let mut state = RunState {
            usage: UsageTotals::default(),
            marker_seen: false,
            last_activity: Instant::now(),
            feedback: Vec::new(),
            broadcasts,
        };

        let outcome = match self.drive(request, shutdown, &mut state).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(ticket_id = request.ticket.id, "agent run failed: {:#}", e);
                self.log(request.session_id, "error", &format!("{:#}", e));
                RunOutcome::Failed(format!("{:#}", e))
            }
        };

        info!(
            ticket_id = request.ticket.id,
            session_id = request.session_id,
            outcome = outcome.as_str(),
            tokens = state.usage.total_tokens(),
            "agent run finished"
        );
        RunReport {
            outcome,
            usage: state.usage,
            feedback: state.feedback,
            elapsed: started.elapsed(),
        }
    }

    async fn drive(
        &self,
        request: &RunRequest<'_>,
        shutdown: &mut watch::Receiver<bool>,
        state: &mut RunState,
    ) -> anyhow::Result<RunOutcome> {
        std::fs::create_dir_all(request.work_dir)
            .with_context(|| format!("creating work dir {}", request.work_dir.display()))?;

        let mut child = self
            .command(request)?
            .spawn()
            .with_context(|| format!("spawning agent {}", self.config.agent_command.join(" ")))?;
        debug!(ticket_id = request.ticket.id, pid = ?child.id(), "agent spawned");

        let stdout = child.stdout.take().context("agent stdout not captured")?;
        let stderr = child.stderr.take().context("agent stderr not captured")?;
        let mut stdout = BufReader::new(stdout).lines();
        let mut stderr = BufReader::new(stderr).lines();
        let (mut stdout_open, mut stderr_open, mut shutdown_open) = (true, true, true);

        let mut watchdog = tokio::time::interval(self.config.watchdog_interval);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if let Some(outcome) = self.check_interrupts(request, shutdown, state) {
                self.terminate(&mut child).await;
                return Ok(outcome);
            }

            tokio::select! {
                line = stdout.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => self.handle_line(request, state, &line),
                    Ok(None) => stdout_open = false,
                    Err(e) => {
                        warn!(ticket_id = request.ticket.id, "agent stdout read failed: {}", e);
                        stdout_open = false;
                    }
                },
                line = stderr.next_line(), if stderr_open => match line {
                    Ok(Some(line)) => self.handle_line(request, state, &line),
                    Ok(None) => stderr_open = false,
                    Err(e) => {
                        warn!(ticket_id = request.ticket.id, "agent stderr read failed: {}", e);
                        stderr_open = false;
                    }
                },
                status = child.wait(), if !stdout_open && !stderr_open => {
                    let status = status.context("waiting for agent exit")?;
                    return Ok(self.exit_outcome(request, state, status));
                }
                _ = watchdog.tick() => {}
                changed = shutdown.changed(), if shutdown_open => {
                    if changed.is_err() {
                        shutdown_open = false;
                    }
                }
            }
        }
    }

    /// Inbox commands, then the stop flag, then the stuck window.
    fn check_interrupts(
        &self,
        request: &RunRequest<'_>,
        shutdown: &watch::Receiver<bool>,
        state: &mut RunState,
    ) -> Option<RunOutcome> {
        if let Some(outcome) = self.poll_inbox(request, state) {
            return Some(outcome);
        }
        if *shutdown.borrow() {
            self.log(request.session_id, "info", "Daemon stopping, agent terminated");
            return Some(RunOutcome::Stopped);
        }

        let idle = state.last_activity.elapsed();
        if idle > self.config.stuck_timeout {
            warn!(ticket_id = request.ticket.id, idle_secs = idle.as_secs(), "STUCK detected");
            self.log(
                request.session_id,
                "error",
                &format!("No activity for {} seconds, agent terminated", idle.as_secs()),
            );
            return Some(RunOutcome::Stuck);
        }
        None
    }

    fn poll_inbox(&self, request: &RunRequest<'_>, state: &mut RunState) -> Option<RunOutcome> {
        let pending = match self.store.conversations.take_pending_messages(request.ticket.id) {
            Ok(pending) => pending,
            Err(e) => {
                warn!(ticket_id = request.ticket.id, "inbox poll failed: {:#}", e);
                return None;
            }
        };

        let mut control = None;
        for message in pending {
            let content = message.content.trim();
            let command = match content {
                "/skip" => Some(RunOutcome::Skipped),
                "/done" => Some(RunOutcome::Done),
                "/stop" => Some(RunOutcome::Interrupted),
                _ => None,
            };
            match command {
                Some(outcome) => {
                    info!(ticket_id = request.ticket.id, command = content, "control command received");
                    if outcome == RunOutcome::Interrupted {
                        self.log(request.session_id, "info", "Stopped by user - waiting for new instructions");
                    }
                    control.get_or_insert(outcome);
                }
                None if content.is_empty() => {}
                None => {
                    self.persist(request, state, MessageRole::User, content, None);
                    self.log(
                        request.session_id,
                        "info",
                        &format!("User message: {}", TextUtils::truncate_with_ellipsis(content, 100)),
                    );
                    state.feedback.push(content.to_string());
                }
            }
        }
        control
    }

    fn handle_line(&self, request: &RunRequest<'_>, state: &mut RunState, line: &str) {
        match AgentEvent::parse(line) {
            None => {}
            Some(AgentEvent::Assistant(event)) => self.handle_assistant(request, state, &event),
            Some(AgentEvent::Result(result)) => {
                self.persist(request, state, MessageRole::ToolResult, &result, None);
            }
            Some(AgentEvent::Error(message)) => {
                warn!(ticket_id = request.ticket.id, "agent error: {}", message);
                self.persist(request, state, MessageRole::System, &format!("Error: {}", message), None);
                self.log(request.session_id, "error", &message);
            }
            Some(AgentEvent::Other(kind)) => debug!(kind = %kind, "ignoring agent event"),
            Some(AgentEvent::RawLine(raw)) => {
                debug!(ticket_id = request.ticket.id, "agent: {}", raw);
                self.log(request.session_id, "output", &raw);
            }
        }
    }

    fn handle_assistant(&self, request: &RunRequest<'_>, state: &mut RunState, event: &AssistantEvent) {
        if let Some(usage) = &event.usage {
            state.usage.add(usage);
        }

        for (name, input) in event.tool_uses() {
            let input = if input.is_null() { String::new() } else { input.to_string() };
            self.persist(request, state, MessageRole::ToolUse, &input, Some(name));
            self.log(request.session_id, "output", &format!("Tool: {}", name));
        }

        let text = event.text();
        if text.is_empty() {
            return;
        }
        self.persist(request, state, MessageRole::Assistant, &text, None);
        self.log(
            request.session_id,
            "output",
            &TextUtils::truncate_with_ellipsis(&text, LOG_PREVIEW_CHARS),
        );
        if !state.marker_seen && TextUtils::contains_ignore_case(&text, &self.config.completion_marker) {
            info!(ticket_id = request.ticket.id, "completion marker seen");
            state.marker_seen = true;
        }
    }

    /// Store a message, refresh the activity clock and queue it for broadcast.
    fn persist(
        &self,
        request: &RunRequest<'_>,
        state: &mut RunState,
        role: MessageRole,
        content: &str,
        tool_name: Option<&str>,
    ) {
        match self
            .store
            .conversations
            .add_message(request.ticket.id, Some(request.session_id), role, content, tool_name)
        {
            Ok(message) => {
                state.last_activity = Instant::now();
                if state.broadcasts.send(message).is_err() {
                    debug!(ticket_id = request.ticket.id, "broadcast queue closed");
                }
            }
            Err(e) => warn!(ticket_id = request.ticket.id, "failed to save {} message: {:#}", role, e),
        }
    }

    fn log(&self, session_id: i64, log_type: &str, message: &str) {
        if let Err(e) = self.store.sessions.log(session_id, log_type, message) {
            debug!(session_id, "execution log write failed: {:#}", e);
        }
    }

    fn exit_outcome(&self, request: &RunRequest<'_>, state: &RunState, status: ExitStatus) -> RunOutcome {
        debug!(ticket_id = request.ticket.id, %status, "agent exited");
        if state.marker_seen {
            RunOutcome::Completed
        } else if status.success() {
            RunOutcome::Success
        } else {
            self.log(request.session_id, "error", &format!("Agent exited with {}", status));
            RunOutcome::Failed(format!("agent exited with {}", status))
        }
    }

    async fn terminate(&self, child: &mut Child) {
        if let Err(e) = child.start_kill() {
            debug!("agent already gone: {}", e);
        }
        match tokio::time::timeout(self.config.kill_timeout, child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "agent terminated"),
            Ok(Err(e)) => warn!("waiting for terminated agent failed: {}", e),
            Err(_) => warn!("agent did not exit within {:?} of kill", self.config.kill_timeout),
        }
    }
}
