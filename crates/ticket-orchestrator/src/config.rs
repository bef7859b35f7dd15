// ticket-orchestrator/crates/ticket-orchestrator/src/config.rs

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::store::KnowledgeCaps;

/// Daemon configuration. Built once at startup and never mutated.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: PathBuf,
    pub db_pool_size: u32,
    pub pid_file: Option<PathBuf>,
    /// Server-environment notes injected into every prompt.
    pub global_context: Option<String>,
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
    pub runner: RunnerConfig,
    pub compactor: CompactorConfig,
    pub services: ServicesConfig,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub max_parallel_projects: usize,
    pub worker_join_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            max_parallel_projects: 3,
            worker_join_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub review_period_days: i64,
    /// Wait after `/stop` before checking for follow-up feedback.
    pub feedback_grace: Duration,
    /// Fallback work directory root for projects without paths.
    pub projects_root: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            review_period_days: 7,
            feedback_grace: Duration::from_secs(1),
            projects_root: PathBuf::from("/var/www/projects"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Program followed by any leading arguments.
    pub agent_command: Vec<String>,
    pub model: String,
    pub stuck_timeout: Duration,
    pub watchdog_interval: Duration,
    pub completion_marker: String,
    pub kill_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            agent_command: vec!["claude".to_string()],
            model: "sonnet".to_string(),
            stuck_timeout: Duration::from_secs(30 * 60),
            watchdog_interval: Duration::from_secs(2),
            completion_marker: "TASK COMPLETED".to_string(),
            kill_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompactorConfig {
    pub extraction_threshold: usize,
    pub recent_tokens_budget: usize,
    pub max_single_message: usize,
    pub knowledge: KnowledgeCaps,
    pub project_map_expiry_days: i64,
    pub summarizer_model: String,
    pub summarizer_timeout: Duration,
    pub runbooks_dir: Option<PathBuf>,
    pub user_id: Option<String>,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            extraction_threshold: 50_000,
            recent_tokens_budget: 50_000,
            max_single_message: 10_000,
            knowledge: KnowledgeCaps::default(),
            project_map_expiry_days: 7,
            summarizer_model: "haiku".to_string(),
            summarizer_timeout: Duration::from_secs(30),
            runbooks_dir: None,
            user_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServicesConfig {
    pub backup_dir: Option<PathBuf>,
    pub max_backups: usize,
    pub broadcast_url: Option<String>,
    pub alert_webhook_url: Option<String>,
    pub alert_recipient: Option<String>,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            backup_dir: None,
            max_backups: 30,
            broadcast_url: None,
            alert_webhook_url: None,
            alert_recipient: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./data/tickets.db"),
            db_pool_size: 10,
            pid_file: None,
            global_context: None,
            scheduler: SchedulerConfig::default(),
            worker: WorkerConfig::default(),
            runner: RunnerConfig::default(),
            compactor: CompactorConfig::default(),
            services: ServicesConfig::default(),
        }
    }
}

fn env_parse<T>(key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(key)
        .unwrap_or_else(|_| default.into())
        .trim()
        .parse()
        .with_context(|| format!("invalid value for {}", key))
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self> {
        match env_opt("DAEMON_CONFIG_FILE") {
            Some(path) => {
                dotenvy::from_path(&path)
                    .with_context(|| format!("loading config file {}", path))?;
                info!("Loaded environment variables from {}", path);
            }
            None => {
                if let Err(e) = dotenvy::dotenv() {
                    warn!("Failed to load .env file: {}. Using system environment variables.", e);
                } else {
                    info!("Loaded environment variables from .env file");
                }
            }
        }

        let global_context = match env_opt("GLOBAL_CONTEXT_FILE") {
            Some(path) => match std::fs::read_to_string(&path) {
                Ok(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
                Ok(_) => None,
                Err(e) => {
                    warn!("Failed to read GLOBAL_CONTEXT_FILE {}: {}", path, e);
                    None
                }
            },
            None => None,
        };

        let agent_command: Vec<String> = env::var("AGENT_COMMAND")
            .unwrap_or_else(|_| "claude".into())
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let config = Self {
            database_path: PathBuf::from(
                env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/tickets.db".into()),
            ),
            db_pool_size: env_parse("DB_POOL_SIZE", "10")?,
            pid_file: env_opt("PID_FILE").map(PathBuf::from),
            global_context,
            scheduler: SchedulerConfig {
                poll_interval: Duration::from_secs(env_parse("POLL_INTERVAL_SECS", "3")?),
                max_parallel_projects: env_parse("MAX_PARALLEL_PROJECTS", "3")?,
                worker_join_timeout: Duration::from_secs(env_parse("WORKER_JOIN_TIMEOUT_SECS", "5")?),
            },
            worker: WorkerConfig {
                poll_interval: Duration::from_secs(env_parse("POLL_INTERVAL_SECS", "3")?),
                review_period_days: env_parse("REVIEW_PERIOD_DAYS", "7")?,
                feedback_grace: Duration::from_millis(env_parse("FEEDBACK_GRACE_MS", "1000")?),
                projects_root: PathBuf::from(
                    env::var("PROJECTS_ROOT").unwrap_or_else(|_| "/var/www/projects".into()),
                ),
            },
            runner: RunnerConfig {
                agent_command,
                model: env::var("AGENT_MODEL").unwrap_or_else(|_| "sonnet".into()),
                stuck_timeout: Duration::from_secs(env_parse("STUCK_TIMEOUT_SECS", "1800")?),
                watchdog_interval: Duration::from_millis(env_parse("WATCHDOG_INTERVAL_MS", "2000")?),
                completion_marker: env::var("COMPLETION_MARKER")
                    .unwrap_or_else(|_| "TASK COMPLETED".into()),
                kill_timeout: Duration::from_secs(5),
            },
            compactor: CompactorConfig {
                extraction_threshold: env_parse("EXTRACTION_THRESHOLD", "50000")?,
                recent_tokens_budget: env_parse("RECENT_TOKENS_BUDGET", "50000")?,
                max_single_message: env_parse("MAX_SINGLE_MESSAGE_TOKENS", "10000")?,
                knowledge: KnowledgeCaps {
                    list_cap: env_parse("KNOWLEDGE_LIST_CAP", "20")?,
                    ticket_cap: env_parse("KNOWLEDGE_TICKET_CAP", "50")?,
                },
                project_map_expiry_days: env_parse("PROJECT_MAP_EXPIRY_DAYS", "7")?,
                summarizer_model: env::var("SUMMARIZER_MODEL").unwrap_or_else(|_| "haiku".into()),
                summarizer_timeout: Duration::from_secs(env_parse("SUMMARIZER_TIMEOUT_SECS", "30")?),
                runbooks_dir: env_opt("RUNBOOKS_DIR").map(PathBuf::from),
                user_id: env_opt("DAEMON_USER_ID"),
            },
            services: ServicesConfig {
                backup_dir: env_opt("BACKUP_DIR").map(PathBuf::from),
                max_backups: env_parse("MAX_BACKUPS", "30")?,
                broadcast_url: env_opt("BROADCAST_URL"),
                alert_webhook_url: env_opt("ALERT_WEBHOOK_URL"),
                alert_recipient: env_opt("ALERT_RECIPIENT"),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.runner.agent_command.is_empty() {
            anyhow::bail!("AGENT_COMMAND must name a program");
        }
        if self.scheduler.max_parallel_projects == 0 {
            anyhow::bail!("MAX_PARALLEL_PROJECTS must be at least 1");
        }
        if self.compactor.recent_tokens_budget == 0 || self.compactor.max_single_message == 0 {
            anyhow::bail!("token budgets must be positive");
        }
        if self.runner.watchdog_interval.is_zero() {
            anyhow::bail!("WATCHDOG_INTERVAL_MS must be positive");
        }
        if self.compactor.max_single_message > self.compactor.recent_tokens_budget {
            warn!(
                "MAX_SINGLE_MESSAGE_TOKENS ({}) exceeds RECENT_TOKENS_BUDGET ({}); the newest message may overflow the budget",
                self.compactor.max_single_message, self.compactor.recent_tokens_budget
            );
        }
        Ok(())
    }

    pub fn print_config(&self) {
        info!("Daemon configuration:");
        info!("  Database: {} (pool {})", self.database_path.display(), self.db_pool_size);
        info!(
            "  Scheduler: poll {:?}, max {} parallel projects",
            self.scheduler.poll_interval, self.scheduler.max_parallel_projects
        );
        info!(
            "  Agent: {} (model {}), stuck after {:?}",
            self.runner.agent_command.join(" "),
            self.runner.model,
            self.runner.stuck_timeout
        );
        info!(
            "  Compaction: threshold {}, recent budget {}, single-message cap {}",
            self.compactor.extraction_threshold,
            self.compactor.recent_tokens_budget,
            self.compactor.max_single_message
        );
        info!(
            "  Backups: {}",
            self.services
                .backup_dir
                .as_ref()
                .map(|d| d.display().to_string())
                .unwrap_or_else(|| "disabled".into())
        );
        if self.global_context.is_some() {
            info!("  Global context: loaded");
        }
    }
}
