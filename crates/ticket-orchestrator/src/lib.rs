// ticket-orchestrator/crates/ticket-orchestrator/src/lib.rs

pub mod agent_runtime;
pub mod config;
pub mod context_engine;
pub mod daemon;
pub mod scheduler;
pub mod services;
pub mod shared_state;
pub mod store;
pub mod telemetry;
pub mod utils;
pub mod worker;

// Public API exports
pub use config::Config;
pub use daemon::run_daemon;
pub use scheduler::Scheduler;
pub use store::TicketStore;
