//! Structured summaries of older conversation messages
//!
//! A lightweight secondary agent call turns the messages that fell out of the
//! recent window into decisions, solved problems, standing notes and a status
//! line. Any failure degrades to a trivial summary so the ticket pipeline is
//! never blocked by extraction.

use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::store::{ConversationMessage, ExtractionSummary, MessageRole};
use crate::utils::TextUtils;

const MAX_DECISIONS: usize = 10;
const MAX_PROBLEMS: usize = 10;
const MAX_FILES: usize = 20;
const MAX_NOTES: usize = 15;
const PROMPT_MESSAGE_CHARS: usize = 2000;
const PROMPT_MAX_ENTRIES: usize = 30;

/// Something that can answer a summarization prompt with raw text.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, prompt: &str) -> anyhow::Result<String>;
}

/// Runs the agent CLI in print mode with the prompt on stdin.
pub struct AgentSummarizer {
    command: Vec<String>,
    model: String,
    timeout: Duration,
}

impl AgentSummarizer {
    pub fn new(command: Vec<String>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command,
            model: model.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Summarizer for AgentSummarizer {
    async fn summarize(&self, prompt: &str) -> anyhow::Result<String> {
        let (program, leading) = self
            .command
            .split_first()
            .context("summarizer command is empty")?;

        let mut child = Command::new(program)
            .args(leading)
            .arg("--model")
            .arg(&self.model)
            .arg("--print")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning summarizer {}", program))?;

        // Written from its own task so a child that never reads cannot hold
        // the caller past the timeout.
        if let Some(mut stdin) = child.stdin.take() {
            let input = prompt.as_bytes().to_vec();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&input).await {
                    debug!("summarizer stdin closed early: {}", e);
                    return;
                }
                let _ = stdin.shutdown().await;
            });
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow::anyhow!("summarizer timed out after {:?}", self.timeout))??;

        if !output.status.success() {
            anyhow::bail!(
                "summarizer exited with {}: {}",
                output.status,
                TextUtils::truncate_with_ellipsis(String::from_utf8_lossy(&output.stderr).trim(), 300)
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Outcome of summarizing a run of older messages.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub summary: ExtractionSummary,
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub used_fallback: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RawSummary {
    #[serde(default)]
    decisions: Vec<Value>,
    #[serde(default)]
    problems_solved: Vec<Value>,
    #[serde(default)]
    current_status: Option<Value>,
    #[serde(default)]
    key_info: Option<Value>,
    #[serde(default)]
    important_notes: Vec<Value>,
}

/// Summarize `messages`, falling back to a trivial summary on any failure.
pub async fn extract(summarizer: &dyn Summarizer, messages: &[ConversationMessage]) -> Extraction {
    let tokens_before = messages
        .iter()
        .map(|m| TextUtils::estimate_tokens(&m.content))
        .sum();

    let mut files = Vec::new();
    for message in messages {
        for path in TextUtils::file_references(&message.content) {
            if files.len() >= MAX_FILES {
                break;
            }
            if !files.contains(&path) {
                files.push(path);
            }
        }
    }

    let prompt = build_prompt(messages);
    let parsed = match summarizer.summarize(&prompt).await {
        Ok(reply) => parse_reply(&reply),
        Err(e) => Err(e),
    };

    let (mut summary, used_fallback) = match parsed {
        Ok(summary) => (summary, false),
        Err(e) => {
            warn!("extraction fell back to trivial summary: {:#}", e);
            (fallback_summary(messages.len()), true)
        }
    };
    summary.files_referenced = files;

    let tokens_after = summary_tokens(&summary);
    debug!(tokens_before, tokens_after, used_fallback, "extracted conversation summary");
    Extraction {
        summary,
        tokens_before,
        tokens_after,
        used_fallback,
    }
}

pub fn fallback_summary(message_count: usize) -> ExtractionSummary {
    ExtractionSummary {
        current_status: format!("Processed {} messages", message_count),
        ..Default::default()
    }
}

fn summary_tokens(summary: &ExtractionSummary) -> usize {
    let decisions = serde_json::to_string(&summary.decisions).unwrap_or_default();
    let problems = serde_json::to_string(&summary.problems_solved).unwrap_or_default();
    TextUtils::estimate_tokens(&decisions)
        + TextUtils::estimate_tokens(&problems)
        + TextUtils::estimate_tokens(&summary.current_status)
}

pub fn build_prompt(messages: &[ConversationMessage]) -> String {
    let lines: Vec<String> = messages
        .iter()
        .filter(|m| matches!(m.role, MessageRole::User | MessageRole::Assistant))
        .map(|m| {
            let speaker = if m.role == MessageRole::User { "USER" } else { "ASSISTANT" };
            format!("{}: {}", speaker, TextUtils::take_chars(&m.content, PROMPT_MESSAGE_CHARS))
        })
        .collect();
    let start = lines.len().saturating_sub(PROMPT_MAX_ENTRIES);
    let conversation = lines[start..].join("\n\n");

    format!(
        "You are compressing the history of a software task so work can continue later.\n\
         Read the conversation below and reply with ONLY one JSON object, no prose, with keys:\n\
         \"decisions\": technical decisions that were made (list of strings),\n\
         \"problems_solved\": problems hit and how each was solved (list of strings),\n\
         \"current_status\": one sentence on where the task stands (string),\n\
         \"key_info\": credentials-free facts worth keeping such as URLs, commands or names (string or object),\n\
         \"important_notes\": standing rules or preferences the user stated (list of strings).\n\n\
         CONVERSATION:\n{}\n",
        conversation
    )
}

/// Parse the secondary agent's reply into a capped summary.
pub fn parse_reply(reply: &str) -> anyhow::Result<ExtractionSummary> {
    let body = TextUtils::strip_code_fences(reply);
    let raw: RawSummary = serde_json::from_str(&body).context("summary reply is not a JSON object")?;

    Ok(ExtractionSummary {
        decisions: flatten_list(raw.decisions, MAX_DECISIONS),
        problems_solved: flatten_list(raw.problems_solved, MAX_PROBLEMS),
        current_status: raw.current_status.map(value_to_text).unwrap_or_default(),
        key_info: raw.key_info.map(value_to_text).filter(|s| !s.is_empty()),
        important_notes: flatten_list(raw.important_notes, MAX_NOTES),
        files_referenced: Vec::new(),
    })
}

fn flatten_list(values: Vec<Value>, cap: usize) -> Vec<String> {
    values
        .into_iter()
        .map(value_to_text)
        .filter(|s| !s.is_empty())
        .take(cap)
        .collect()
}

/// Render a JSON value as a single line of text.
fn value_to_text(value: Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        Value::Object(map) => map
            .into_iter()
            .map(|(k, v)| format!("{}: {}", k, value_to_text(v)))
            .collect::<Vec<_>>()
            .join("; "),
        Value::Array(items) => items
            .into_iter()
            .map(value_to_text)
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}
