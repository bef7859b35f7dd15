//! Token budget policies for conversation history

use crate::config::CompactorConfig;
use crate::store::ConversationMessage;
use crate::utils::TextUtils;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBudget {
    pub extraction_threshold: usize,
    pub recent_tokens_budget: usize,
    pub max_single_message: usize,
}

/// Unsummarized history split into a verbatim suffix and an older prefix.
#[derive(Debug, Clone, Default)]
pub struct HistoryWindow {
    /// Newest messages, contents already capped.
    pub recent: Vec<ConversationMessage>,
    /// Older messages that need extraction, contents untouched.
    pub older: Vec<ConversationMessage>,
    pub backlog_tokens: usize,
    pub recent_tokens: usize,
}

impl TokenBudget {
    pub fn from_config(config: &CompactorConfig) -> Self {
        Self {
            extraction_threshold: config.extraction_threshold,
            recent_tokens_budget: config.recent_tokens_budget,
            max_single_message: config.max_single_message,
        }
    }

    /// Estimated cost of a message once capped.
    pub fn message_cost(&self, message: &ConversationMessage) -> usize {
        TextUtils::estimate_tokens(&message.content).min(self.max_single_message)
    }

    /// Uncapped estimate of the whole backlog.
    pub fn backlog_tokens(&self, messages: &[ConversationMessage]) -> usize {
        messages
            .iter()
            .map(|m| TextUtils::estimate_tokens(&m.content))
            .sum()
    }

    /// Apply the single-message cap to a message's content.
    pub fn cap_message(&self, mut message: ConversationMessage) -> ConversationMessage {
        if let std::borrow::Cow::Owned(truncated) =
            TextUtils::truncate_middle(&message.content, self.max_single_message)
        {
            message.content = truncated;
        }
        message
    }

    /// Split the unsummarized backlog (oldest first).
    ///
    /// Below the extraction threshold everything stays verbatim. Otherwise the
    /// newest messages that fit the recent budget are kept and the rest is
    /// handed back for extraction. The newest message is always kept, even
    /// when its capped cost alone exceeds the budget.
    pub fn partition(&self, messages: Vec<ConversationMessage>) -> HistoryWindow {
        let backlog_tokens = self.backlog_tokens(&messages);

        if backlog_tokens < self.extraction_threshold {
            let recent_tokens = messages.iter().map(|m| self.message_cost(m)).sum();
            return HistoryWindow {
                recent: messages.into_iter().map(|m| self.cap_message(m)).collect(),
                older: Vec::new(),
                backlog_tokens,
                recent_tokens,
            };
        }

        let mut split = messages.len();
        let mut used = 0usize;
        for (idx, message) in messages.iter().enumerate().rev() {
            let cost = self.message_cost(message);
            if used + cost > self.recent_tokens_budget {
                if split == messages.len() {
                    split = idx;
                    used += cost;
                }
                break;
            }
            used += cost;
            split = idx;
        }

        let mut older = messages;
        let recent = older.split_off(split);
        HistoryWindow {
            recent: recent.into_iter().map(|m| self.cap_message(m)).collect(),
            older,
            backlog_tokens,
            recent_tokens: used,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MessageRole;
    use chrono::Utc;
    use proptest::prelude::*;

    fn message(id: i64, tokens: usize) -> ConversationMessage {
        ConversationMessage {
            id,
            ticket_id: 1,
            session_id: None,
            role: if id % 2 == 0 { MessageRole::User } else { MessageRole::Assistant },
            content: "x".repeat(tokens * 4),
            tool_name: None,
            token_count: tokens as i64,
            is_summarized: false,
            created_at: Utc::now(),
        }
    }

    fn budget() -> TokenBudget {
        TokenBudget {
            extraction_threshold: 50_000,
            recent_tokens_budget: 50_000,
            max_single_message: 10_000,
        }
    }

    #[test]
    fn test_small_backlog_is_returned_whole() {
        let messages: Vec<_> = (1..=10).map(|i| message(i, 1_000)).collect();
        let window = budget().partition(messages);
        assert_eq!(window.recent.len(), 10);
        assert!(window.older.is_empty());
        assert_eq!(window.backlog_tokens, 10_000);
    }

    #[test]
    fn test_over_threshold_keeps_newest_fitting_budget() {
        let messages: Vec<_> = (1..=60).map(|i| message(i, 1_000)).collect();
        let window = budget().partition(messages);

        assert_eq!(window.backlog_tokens, 60_000);
        assert_eq!(window.recent.len(), 50);
        assert_eq!(window.recent_tokens, 50_000);
        assert_eq!(window.older.len(), 10);
        assert_eq!(window.older.last().unwrap().id, 10);
        assert_eq!(window.recent.first().unwrap().id, 11);
    }

    #[test]
    fn test_oversized_message_is_capped_in_place() {
        let big = message(1, 12_000);
        let original = big.content.clone();
        let budget = budget();
        assert_eq!(budget.message_cost(&big), 10_000);

        let window = budget.partition(vec![big]);
        let capped = &window.recent[0].content;
        let keep = 10_000 * 4 * 2 / 5;
        assert!(capped.starts_with(&original[..keep]));
        assert!(capped.ends_with(&original[original.len() - keep..]));
        assert!(capped.contains("[... truncated 2000 tokens ...]"));
        assert_eq!(window.recent_tokens, 10_000);
    }

    #[test]
    fn test_newest_message_kept_when_it_alone_exceeds_budget() {
        let tight = TokenBudget {
            extraction_threshold: 10,
            recent_tokens_budget: 100,
            max_single_message: 500,
        };
        let window = tight.partition(vec![message(1, 50), message(2, 400)]);
        assert_eq!(window.recent.len(), 1);
        assert_eq!(window.recent[0].id, 2);
        assert_eq!(window.older.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_partition_covers_backlog_without_overlap(
            sizes in proptest::collection::vec(0usize..3_000, 0..80),
            threshold in 1usize..20_000,
            recent_budget in 1_000usize..20_000,
        ) {
            let budget = TokenBudget {
                extraction_threshold: threshold,
                recent_tokens_budget: recent_budget,
                max_single_message: 1_000,
            };
            let messages: Vec<_> = sizes.iter().enumerate().map(|(i, s)| message(i as i64 + 1, *s)).collect();
            let window = budget.partition(messages);

            let ids: Vec<i64> = window.older.iter().chain(window.recent.iter()).map(|m| m.id).collect();
            let expected: Vec<i64> = (1..=sizes.len() as i64).collect();
            prop_assert_eq!(ids, expected);

            let recent_cost: usize = window.recent.iter().map(|m| budget.message_cost(m)).sum();
            if !window.older.is_empty() {
                prop_assert!(recent_cost <= budget.recent_tokens_budget);
            }
            for m in &window.recent {
                prop_assert!(TextUtils::estimate_tokens(&m.content) <= budget.max_single_message + 16);
            }
        }
    }
}
