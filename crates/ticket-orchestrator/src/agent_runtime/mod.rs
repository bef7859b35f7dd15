//! Agent runtime - spawning the coding agent and interpreting its output

pub mod events;
pub mod runner;

pub use events::{AgentEvent, AssistantEvent, ContentBlock};
pub use runner::{AgentRunner, RunOutcome, RunReport, RunRequest};
