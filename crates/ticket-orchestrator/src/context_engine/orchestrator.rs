use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::CompactorConfig;
use crate::context_engine::{
    budget::TokenBudget,
    context_builder::{ContextBuilder, ContextSections},
    extractor::{self, Extraction, Summarizer},
    knowledge::{merge_extraction, render_knowledge},
    project_map::ProjectMapper,
};
use crate::store::{ConversationExtraction, ConversationMessage, Project, Ticket, TicketStore};

/// Everything the prompt needs from the compactor for one agent run.
#[derive(Debug, Clone, Default)]
pub struct TicketContext {
    pub system_context: String,
    /// Verbatim recent history, oldest first, contents capped.
    pub history: Vec<ConversationMessage>,
    pub extraction: Option<ConversationExtraction>,
    pub backlog_tokens: usize,
}

/// Keeps each ticket's prompt inside the token budget by summarizing older
/// messages and folding what was learned into project knowledge.
pub struct Compactor {
    store: Arc<TicketStore>,
    config: CompactorConfig,
    budget: TokenBudget,
    summarizer: Arc<dyn Summarizer>,
    mapper: ProjectMapper,
}

impl Compactor {
    pub fn new(store: Arc<TicketStore>, config: CompactorConfig, summarizer: Arc<dyn Summarizer>) -> Self {
        let budget = TokenBudget::from_config(&config);
        let mapper = ProjectMapper::new(config.project_map_expiry_days);
        info!(
            extraction_threshold = budget.extraction_threshold,
            recent_budget = budget.recent_tokens_budget,
            "compactor initialized"
        );
        Self {
            store,
            config,
            budget,
            summarizer,
            mapper,
        }
    }

    /// Working history for a ticket, extracting the overflow when the
    /// backlog is over the threshold.
    pub async fn compact_history(&self, project: &Project, ticket: &Ticket) -> anyhow::Result<(Vec<ConversationMessage>, usize)> {
        let backlog = self.store.conversations.unsummarized(ticket.id)?;
        let window = self.budget.partition(backlog);

        if !window.older.is_empty() {
            debug!(
                ticket_id = ticket.id,
                older = window.older.len(),
                recent = window.recent.len(),
                backlog_tokens = window.backlog_tokens,
                "backlog over threshold, extracting"
            );
            let extraction = extractor::extract(self.summarizer.as_ref(), &window.older).await;
            let ids: Vec<i64> = window.older.iter().map(|m| m.id).collect();
            self.persist_extraction(project.id, ticket.id, &ids, &extraction);
        }

        Ok((window.recent, window.backlog_tokens))
    }

    /// Save the extraction and flag its messages; one retry, then leave the
    /// messages unsummarized for the next build.
    fn persist_extraction(&self, project_id: i64, ticket_id: i64, ids: &[i64], extraction: &Extraction) {
        let save = || {
            self.store.extractions.save_extraction(
                ticket_id,
                ids,
                &extraction.summary,
                extraction.tokens_before as i64,
                extraction.tokens_after as i64,
            )
        };

        let saved = match save() {
            Ok(saved) => saved,
            Err(first) => {
                warn!(ticket_id, "saving extraction failed, retrying: {:#}", first);
                match save() {
                    Ok(saved) => saved,
                    Err(e) => {
                        warn!(ticket_id, "extraction not saved, messages stay pending: {:#}", e);
                        return;
                    }
                }
            }
        };

        info!(
            ticket_id,
            extraction_id = saved.id,
            messages = saved.messages_summarized,
            tokens_before = saved.tokens_before,
            tokens_after = saved.tokens_after,
            fallback = extraction.used_fallback,
            "summarized older messages"
        );

        let caps = self.config.knowledge;
        if let Err(e) = self
            .store
            .knowledge
            .update(project_id, caps, |k| merge_extraction(k, ticket_id, &saved.summary))
        {
            warn!(project_id, ticket_id, "knowledge merge failed: {:#}", e);
        }
    }

    /// Assemble the system context and recent history for a ticket run.
    pub async fn build_context(&self, project: &Project, ticket: &Ticket) -> anyhow::Result<TicketContext> {
        let (history, backlog_tokens) = self.compact_history(project, ticket).await?;

        let extraction = self.store.extractions.latest_extraction(ticket.id)?;
        let knowledge = self.store.knowledge.load(project.id, self.config.knowledge)?;

        let project_map = match self.mapper.map_for(&self.store.knowledge, project) {
            Ok(map) => map,
            Err(e) => {
                warn!(project_id = project.id, "project map unavailable: {:#}", e);
                None
            }
        };

        let preferences = match &self.config.user_id {
            Some(user_id) => self.store.knowledge.user_preferences(user_id)?,
            None => None,
        };

        let environment = self
            .config
            .runbooks_dir
            .as_deref()
            .zip(project.project_type.as_deref())
            .and_then(|(dir, kind)| load_runbook(dir, kind));

        let system_context = ContextBuilder::build(&ContextSections {
            preferences: preferences.as_ref(),
            project_map: project_map.as_deref(),
            knowledge: render_knowledge(&knowledge),
            environment,
            extraction: extraction.as_ref(),
        });

        Ok(TicketContext {
            system_context,
            history,
            extraction,
            backlog_tokens,
        })
    }

    /// Drop the cached project map so the next build rescans the tree.
    pub fn refresh_project_map(&self, project_id: i64) {
        self.mapper.invalidate(project_id);
    }
}

fn runbook_path(dir: &Path, project_type: &str) -> Option<PathBuf> {
    let valid = !project_type.is_empty()
        && project_type
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    valid.then(|| dir.join(format!("{}.md", project_type)))
}

fn load_runbook(dir: &Path, project_type: &str) -> Option<String> {
    let path = runbook_path(dir, project_type)?;
    match std::fs::read_to_string(&path) {
        Ok(text) if !text.trim().is_empty() => Some(text),
        Ok(_) => None,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!("cannot read runbook {}: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::{seed_project, seed_ticket, temp_store};
    use crate::store::{MessageRole, Priority};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticSummarizer {
        reply: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Summarizer for StaticSummarizer {
        async fn summarize(&self, _prompt: &str) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply.to_string())
        }
    }

    fn compactor(store: Arc<TicketStore>, config: CompactorConfig) -> (Compactor, Arc<StaticSummarizer>) {
        let summarizer = Arc::new(StaticSummarizer {
            reply: r#"{"decisions": ["use sqlite"], "problems_solved": ["slow build -> cache deps"],
                       "current_status": "api half done", "important_notes": ["tabs not spaces"]}"#,
            calls: AtomicUsize::new(0),
        });
        (Compactor::new(store, config, summarizer.clone()), summarizer)
    }

    fn add_messages(store: &TicketStore, ticket_id: i64, count: usize, tokens: usize) {
        for i in 0..count {
            let role = if i % 2 == 0 { MessageRole::User } else { MessageRole::Assistant };
            store
                .conversations
                .add_message(ticket_id, None, role, &"y".repeat(tokens * 4), None)
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_backlog_over_threshold_is_extracted_and_flagged() {
        let (_dir, store) = temp_store();
        let store = Arc::new(store);
        let project = seed_project(&store, "ACME", None);
        let ticket = seed_ticket(&store, project.id, "ACME-1", Priority::Medium);
        add_messages(&store, ticket.id, 60, 1_000);

        let (compactor, summarizer) = compactor(Arc::clone(&store), CompactorConfig::default());
        let context = compactor.build_context(&project, &ticket).await.unwrap();

        assert_eq!(context.history.len(), 50);
        assert_eq!(context.backlog_tokens, 60_000);
        let extraction = context.extraction.expect("extraction saved");
        assert_eq!(extraction.messages_summarized, 10);
        assert_eq!(extraction.to_message_id + 1, context.history[0].id);
        assert!(context.system_context.contains("!!! tabs not spaces"));
        assert!(context.system_context.contains("=== PROJECT KNOWLEDGE ==="));

        let pending = store.conversations.unsummarized(ticket.id).unwrap();
        assert_eq!(pending.len(), 50);
        let all = store.conversations.history(ticket.id).unwrap();
        let flagged: Vec<i64> = all.iter().filter(|m| m.is_summarized).map(|m| m.id).collect();
        assert_eq!(flagged, (extraction.from_message_id..=extraction.to_message_id).collect::<Vec<_>>());

        let knowledge = store.knowledge.load(project.id, Default::default()).unwrap();
        assert_eq!(knowledge.learned_from_tickets.to_vec(), vec![ticket.id]);

        // Second build sits exactly at the budget and does not extract again.
        let again = compactor.build_context(&project, &ticket).await.unwrap();
        assert_eq!(again.history.len(), 50);
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_small_backlog_needs_no_extraction() {
        let (_dir, store) = temp_store();
        let store = Arc::new(store);
        let project = seed_project(&store, "SMALL", None);
        let ticket = seed_ticket(&store, project.id, "SMALL-1", Priority::High);
        add_messages(&store, ticket.id, 5, 100);

        let (compactor, summarizer) = compactor(Arc::clone(&store), CompactorConfig::default());
        let context = compactor.build_context(&project, &ticket).await.unwrap();

        assert_eq!(context.history.len(), 5);
        assert!(context.extraction.is_none());
        assert_eq!(context.system_context, "");
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_runbook_and_project_map_are_included() {
        let (dir, store) = temp_store();
        let store = Arc::new(store);

        let work = dir.path().join("site");
        std::fs::create_dir_all(work.join("src")).unwrap();
        std::fs::write(work.join("Cargo.toml"), "[package]\n").unwrap();
        std::fs::write(work.join("src/main.rs"), "fn main() {}\n").unwrap();
        let runbooks = dir.path().join("runbooks");
        std::fs::create_dir_all(&runbooks).unwrap();
        std::fs::write(runbooks.join("android.md"), "Use adb logcat for device logs.\n").unwrap();

        let mut project = seed_project(&store, "DROID", Some(work.to_str().unwrap()));
        project.project_type = Some("android".into());
        let ticket = seed_ticket(&store, project.id, "DROID-1", Priority::Low);

        let config = CompactorConfig {
            runbooks_dir: Some(runbooks),
            ..Default::default()
        };
        let (compactor, _) = compactor(Arc::clone(&store), config);
        let context = compactor.build_context(&project, &ticket).await.unwrap();

        assert!(context.system_context.contains("=== PROJECT STRUCTURE ==="));
        assert!(context.system_context.contains("Use adb logcat"));
    }

    #[test]
    fn test_runbook_path_rejects_traversal() {
        let dir = Path::new("/etc/runbooks");
        assert!(runbook_path(dir, "../secrets").is_none());
        assert!(runbook_path(dir, "").is_none());
        assert_eq!(runbook_path(dir, "web-php"), Some(dir.join("web-php.md")));
    }
}
