//! Project workers - sequential ticket processing, one thread per project

pub mod project_worker;
pub mod prompt;

pub use project_worker::{Disposition, ProjectWorker};
pub use prompt::{build_prompt, PromptInput};
