//! Row types and enums for the ticket store

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

/// Stored timestamps are fixed-precision UTC RFC 3339 so they order lexically.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_ts() -> String {
    format_ts(Utc::now())
}

pub(crate) fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(idx, &raw)
}

pub(crate) fn opt_ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub(crate) fn json_list_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<String>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        Some(s) if !s.trim().is_empty() => serde_json::from_str(&s).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        }),
        _ => Ok(Vec::new()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown value '{}'", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

/// Text-backed enum columns.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant(other.to_string())),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: UnknownVariant| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

text_enum!(TicketStatus {
    New => "new",
    Open => "open",
    Pending => "pending",
    InProgress => "in_progress",
    AwaitingInput => "awaiting_input",
    Done => "done",
    Stuck => "stuck",
    Failed => "failed",
});

text_enum!(Priority {
    Critical => "critical",
    High => "high",
    Medium => "medium",
    Low => "low",
});

text_enum!(SessionStatus {
    Running => "running",
    Completed => "completed",
    Stuck => "stuck",
    Failed => "failed",
    Skipped => "skipped",
    Stopped => "stopped",
});

text_enum!(MessageRole {
    User => "user",
    Assistant => "assistant",
    ToolUse => "tool_use",
    ToolResult => "tool_result",
    System => "system",
});

text_enum!(ProjectStatus {
    Active => "active",
    Archived => "archived",
});

impl TicketStatus {
    /// Statuses a worker may dequeue.
    pub const RUNNABLE: [TicketStatus; 3] = [TicketStatus::Open, TicketStatus::New, TicketStatus::Pending];

    pub fn is_runnable(&self) -> bool {
        Self::RUNNABLE.contains(self)
    }
}

impl Priority {
    /// Lower rank is dequeued first.
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Critical => 1,
            Priority::High => 2,
            Priority::Medium => 3,
            Priority::Low => 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub code: String,
    pub web_path: Option<String>,
    pub app_path: Option<String>,
    pub project_type: Option<String>,
    pub tech_stack: Vec<String>,
    pub context: Option<String>,
    pub status: ProjectStatus,
    pub total_tokens: i64,
    pub total_duration_seconds: i64,
}

impl Project {
    /// Directory the agent works in.
    pub fn work_path(&self) -> Option<&str> {
        self.web_path
            .as_deref()
            .filter(|p| !p.is_empty())
            .or_else(|| self.app_path.as_deref().filter(|p| !p.is_empty()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: i64,
    pub project_id: i64,
    pub ticket_number: String,
    pub title: String,
    pub description: Option<String>,
    pub context: Option<String>,
    pub priority: Priority,
    pub status: TicketStatus,
    pub result_summary: Option<String>,
    pub review_deadline: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub closed_by: Option<String>,
    pub close_reason: Option<String>,
    pub total_tokens: i64,
    pub total_duration_seconds: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: i64,
    pub ticket_id: i64,
    pub session_id: Option<i64>,
    pub role: MessageRole,
    pub content: String,
    pub tool_name: Option<String>,
    pub token_count: i64,
    pub is_summarized: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSession {
    pub id: i64,
    pub ticket_id: i64,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub tokens_used: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionSummary {
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub problems_solved: Vec<String>,
    #[serde(default)]
    pub current_status: String,
    #[serde(default)]
    pub key_info: Option<String>,
    #[serde(default)]
    pub important_notes: Vec<String>,
    #[serde(default)]
    pub files_referenced: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationExtraction {
    pub id: i64,
    pub ticket_id: i64,
    pub from_message_id: i64,
    pub to_message_id: i64,
    pub messages_summarized: i64,
    pub summary: ExtractionSummary,
    pub tokens_before: i64,
    pub tokens_after: i64,
    pub created_at: DateTime<Utc>,
}

/// Usage counters reported by the agent's assistant events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_creation_tokens: i64,
    pub api_calls: i64,
}

impl UsageTotals {
    pub fn total_tokens(&self) -> i64 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: &UsageTotals) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
        self.api_calls += other.api_calls;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMessage {
    pub id: i64,
    pub ticket_id: i64,
    pub content: String,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub status: String,
    pub pid: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectMap {
    pub project_id: i64,
    pub structure_summary: String,
    pub entry_points: Vec<String>,
    pub tech_stack: Vec<String>,
    pub primary_language: Option<String>,
    pub fingerprint: String,
    pub generated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserPreferences {
    pub user_id: String,
    pub language: Option<String>,
    pub response_style: Option<String>,
    pub skill_level: Option<String>,
    pub custom_instructions: Option<String>,
    pub learned_quirks: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub tickets_reset: usize,
    pub sessions_marked_stuck: usize,
}

impl RecoveryReport {
    pub fn is_noop(&self) -> bool {
        self.tickets_reset == 0 && self.sessions_marked_stuck == 0
    }
}

/// Insert payloads used by external producers and tests.
#[derive(Debug, Clone)]
pub struct NewProject {
    pub name: String,
    pub code: String,
    pub web_path: Option<String>,
    pub app_path: Option<String>,
    pub project_type: Option<String>,
    pub tech_stack: Vec<String>,
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewTicket {
    pub project_id: i64,
    pub ticket_number: String,
    pub title: String,
    pub description: Option<String>,
    pub context: Option<String>,
    pub priority: Priority,
    pub status: TicketStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_text() {
        for status in [TicketStatus::InProgress, TicketStatus::AwaitingInput, TicketStatus::Done] {
            assert_eq!(status.as_str().parse::<TicketStatus>(), Ok(status));
        }
        assert!("bogus".parse::<TicketStatus>().is_err());
    }

    #[test]
    fn test_priority_rank_orders_critical_first() {
        let mut all = vec![Priority::Low, Priority::Critical, Priority::Medium, Priority::High];
        all.sort_by_key(|p| p.rank());
        assert_eq!(all, vec![Priority::Critical, Priority::High, Priority::Medium, Priority::Low]);
    }

    #[test]
    fn test_work_path_prefers_web_path() {
        let mut project = Project {
            id: 1,
            name: "Shop".into(),
            code: "shop".into(),
            web_path: Some(String::new()),
            app_path: Some("/srv/shop-app".into()),
            project_type: None,
            tech_stack: vec![],
            context: None,
            status: ProjectStatus::Active,
            total_tokens: 0,
            total_duration_seconds: 0,
        };
        assert_eq!(project.work_path(), Some("/srv/shop-app"));
        project.web_path = Some("/srv/shop".into());
        assert_eq!(project.work_path(), Some("/srv/shop"));
    }

    #[test]
    fn test_format_ts_is_fixed_width() {
        let ts = DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z").unwrap().with_timezone(&Utc);
        assert_eq!(format_ts(ts), "2026-01-02T03:04:05.000Z");
    }
}
