//! Context engine - keeps ticket prompts inside a token budget
//!
//! Older conversation is summarized into extractions, extractions feed the
//! long-lived project knowledge, and the builder stitches preferences, project
//! map, knowledge, runbooks and the latest extraction into a system context.

pub mod budget;
pub mod extractor;
pub mod knowledge;
pub mod project_map;
pub mod context_builder;
pub mod orchestrator;

pub use budget::{HistoryWindow, TokenBudget};
pub use extractor::{AgentSummarizer, Extraction, Summarizer};
pub use context_builder::{ContextBuilder, ContextSections};
pub use orchestrator::{Compactor, TicketContext};
pub use project_map::ProjectMapper;
