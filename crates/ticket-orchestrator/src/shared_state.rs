//! State shared by the scheduler and every project worker thread

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::{
    agent_runtime::AgentRunner,
    config::Config,
    context_engine::{AgentSummarizer, Compactor, Summarizer},
    services::Services,
    store::TicketStore,
};

/// Process-wide ticket counters, logged on shutdown.
#[derive(Default)]
pub struct AtomicCounters {
    pub tickets_started: AtomicUsize,
    pub tickets_awaiting_review: AtomicUsize,
    pub tickets_failed: AtomicUsize,
    pub tickets_stuck: AtomicUsize,
}

impl AtomicCounters {
    pub fn inc(counter: &AtomicUsize) -> usize {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self) -> [usize; 4] {
        [
            self.tickets_started.load(Ordering::Relaxed),
            self.tickets_awaiting_review.load(Ordering::Relaxed),
            self.tickets_failed.load(Ordering::Relaxed),
            self.tickets_stuck.load(Ordering::Relaxed),
        ]
    }
}

/// Immutable config plus the long-lived components built from it.
pub struct SharedState {
    pub config: Arc<Config>,
    pub store: Arc<TicketStore>,
    pub compactor: Arc<Compactor>,
    pub runner: Arc<AgentRunner>,
    pub services: Services,
    pub counters: AtomicCounters,
}

impl SharedState {
    pub fn new(config: Config, store: Arc<TicketStore>, summarizer: Arc<dyn Summarizer>, services: Services) -> Self {
        let config = Arc::new(config);
        let compactor = Arc::new(Compactor::new(
            Arc::clone(&store),
            config.compactor.clone(),
            summarizer,
        ));
        let runner = Arc::new(AgentRunner::new(
            config.runner.clone(),
            Arc::clone(&store),
            Arc::clone(&services.broadcaster),
        ));
        info!("Shared state initialized");
        Self {
            config,
            store,
            compactor,
            runner,
            services,
            counters: AtomicCounters::default(),
        }
    }

    /// Production wiring: the agent CLI doubles as the summarizer.
    pub fn from_config(config: Config, store: Arc<TicketStore>) -> Self {
        let summarizer = Arc::new(AgentSummarizer::new(
            config.runner.agent_command.clone(),
            config.compactor.summarizer_model.clone(),
            config.compactor.summarizer_timeout,
        ));
        let services = Services::from_config(&config.services);
        Self::new(config, store, summarizer, services)
    }

    pub fn log_counters(&self) {
        let [started, review, failed, stuck] = self.counters.snapshot();
        info!(started, awaiting_review = review, failed, stuck, "ticket counters");
    }
}
