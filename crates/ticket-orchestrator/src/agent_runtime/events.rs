//! Line-delimited JSON events emitted by the coding agent

use serde::Deserialize;
use serde_json::Value;

use crate::store::UsageTotals;

/// One line of agent output.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Assistant(AssistantEvent),
    Result(String),
    Error(String),
    /// Well-formed JSON of a kind the daemon does not act on.
    Other(String),
    /// Not JSON at all.
    RawLine(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssistantEvent {
    pub blocks: Vec<ContentBlock>,
    pub usage: Option<UsageTotals>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    Assistant {
        #[serde(default)]
        message: WireMessage,
    },
    Result {
        #[serde(default)]
        result: Value,
    },
    Error {
        #[serde(default)]
        error: Option<WireError>,
    },
}

#[derive(Debug, Default, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
    #[serde(default)]
    cache_read_input_tokens: i64,
    #[serde(default)]
    cache_creation_input_tokens: i64,
}

impl From<WireUsage> for UsageTotals {
    fn from(usage: WireUsage) -> Self {
        UsageTotals {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_read_tokens: usage.cache_read_input_tokens,
            cache_creation_tokens: usage.cache_creation_input_tokens,
            api_calls: 1,
        }
    }
}

impl AgentEvent {
    /// Parse a single output line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Option<AgentEvent> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let value: Value = match serde_json::from_str(line) {
            Ok(value @ Value::Object(_)) => value,
            _ => return Some(AgentEvent::RawLine(line.to_string())),
        };
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let event = match serde_json::from_value::<WireEvent>(value) {
            Ok(WireEvent::Assistant { message }) => AgentEvent::Assistant(AssistantEvent {
                blocks: message.content,
                usage: message.usage.map(UsageTotals::from),
            }),
            Ok(WireEvent::Result { result }) => AgentEvent::Result(match result {
                Value::Null => String::new(),
                Value::String(text) => text,
                other => other.to_string(),
            }),
            Ok(WireEvent::Error { error }) => AgentEvent::Error(
                error
                    .and_then(|e| e.message)
                    .unwrap_or_else(|| "Unknown error".to_string()),
            ),
            Err(_) => AgentEvent::Other(kind),
        };
        Some(event)
    }
}

impl AssistantEvent {
    /// Concatenated text blocks.
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn tool_uses(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.blocks.iter().filter_map(|block| match block {
            ContentBlock::ToolUse { name, input } => Some((name.as_str(), input)),
            _ => None,
        })
    }
}
