use crate::store::schema::*;
use crate::store::{get_conn, DbPool, PooledConn};
use crate::utils::TextUtils;
use rusqlite::{params, Row};
use tracing::debug;

/// Message content is capped before it is stored.
pub const MAX_MESSAGE_CHARS: usize = 50_000;
/// Tool results are far noisier; they get a tighter cap.
pub const MAX_TOOL_RESULT_CHARS: usize = 5_000;

const MESSAGE_COLUMNS: &str =
    "id, ticket_id, session_id, role, content, tool_name, token_count, is_summarized, created_at";

/// Conversation messages and the user-message inbox.
pub struct ConversationStore {
    pool: DbPool,
}

impl ConversationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<PooledConn> {
        get_conn(&self.pool)
    }

    /// Append a message. Content is capped per role and its token estimate recorded.
    pub fn add_message(
        &self,
        ticket_id: i64,
        session_id: Option<i64>,
        role: MessageRole,
        content: &str,
        tool_name: Option<&str>,
    ) -> anyhow::Result<ConversationMessage> {
        let cap = match role {
            MessageRole::ToolResult => MAX_TOOL_RESULT_CHARS,
            _ => MAX_MESSAGE_CHARS,
        };
        let content = TextUtils::take_chars(content, cap);
        let token_count = TextUtils::estimate_tokens(content) as i64;
        let now = chrono::Utc::now();

        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO conversation_messages
             (ticket_id, session_id, role, content, tool_name, token_count, is_summarized, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
            params![ticket_id, session_id, role, content, tool_name, token_count, format_ts(now)],
        )?;

        Ok(ConversationMessage {
            id: conn.last_insert_rowid(),
            ticket_id,
            session_id,
            role,
            content: content.to_string(),
            tool_name: tool_name.map(str::to_string),
            token_count,
            is_summarized: false,
            created_at: now,
        })
    }

    /// Every message of a ticket in insertion order.
    pub fn history(&self, ticket_id: i64) -> anyhow::Result<Vec<ConversationMessage>> {
        self.query_messages(ticket_id, false)
    }

    /// Messages not yet covered by an extraction, in insertion order.
    pub fn unsummarized(&self, ticket_id: i64) -> anyhow::Result<Vec<ConversationMessage>> {
        self.query_messages(ticket_id, true)
    }

    fn query_messages(&self, ticket_id: i64, only_unsummarized: bool) -> anyhow::Result<Vec<ConversationMessage>> {
        let conn = self.get_conn()?;
        let filter = if only_unsummarized { "AND is_summarized = 0" } else { "" };
        let sql = format!(
            "SELECT {} FROM conversation_messages WHERE ticket_id = ?1 {} ORDER BY id ASC",
            MESSAGE_COLUMNS, filter
        );
        let mut stmt = conn.prepare(&sql)?;
        let messages = stmt
            .query_map([ticket_id], row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }

    pub fn message_count(&self, ticket_id: i64) -> anyhow::Result<i64> {
        let conn = self.get_conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM conversation_messages WHERE ticket_id = ?1",
            [ticket_id],
            |row| row.get(0),
        )?)
    }

    /// Queue a message from the UI for the worker processing `ticket_id`.
    pub fn push_user_message(&self, ticket_id: i64, content: &str) -> anyhow::Result<i64> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO user_messages (ticket_id, content, processed, created_at) VALUES (?1, ?2, 0, ?3)",
            params![ticket_id, content, now_ts()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Take every unprocessed inbox message for a ticket, marking them processed.
    pub fn take_pending_messages(&self, ticket_id: i64) -> anyhow::Result<Vec<UserMessage>> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let pending = {
            let mut stmt = tx.prepare(
                "SELECT id, ticket_id, content, processed, created_at FROM user_messages
                 WHERE ticket_id = ?1 AND processed = 0
                 ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map([ticket_id], row_to_user_message)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        if pending.is_empty() {
            return Ok(pending);
        }

        {
            let mut mark = tx.prepare("UPDATE user_messages SET processed = 1 WHERE id = ?1")?;
            for message in &pending {
                mark.execute([message.id])?;
            }
        }
        tx.commit()?;

        debug!(ticket_id, count = pending.len(), "consumed inbox messages");
        Ok(pending)
    }
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<ConversationMessage> {
    Ok(ConversationMessage {
        id: row.get(0)?,
        ticket_id: row.get(1)?,
        session_id: row.get(2)?,
        role: row.get(3)?,
        content: row.get(4)?,
        tool_name: row.get(5)?,
        token_count: row.get(6)?,
        is_summarized: row.get(7)?,
        created_at: ts_column(row, 8)?,
    })
}

fn row_to_user_message(row: &Row<'_>) -> rusqlite::Result<UserMessage> {
    Ok(UserMessage {
        id: row.get(0)?,
        ticket_id: row.get(1)?,
        content: row.get(2)?,
        processed: row.get(3)?,
        created_at: ts_column(row, 4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::*;

    #[test]
    fn test_messages_keep_insertion_order_and_caps() {
        let (_dir, store) = temp_store();
        let project = seed_project(&store, "alpha", None);
        let ticket = seed_ticket(&store, project.id, "T-1", Priority::Medium);

        store.conversations.add_message(ticket.id, None, MessageRole::User, "first", None).unwrap();
        let big = "r".repeat(20_000);
        let result = store
            .conversations
            .add_message(ticket.id, None, MessageRole::ToolResult, &big, None)
            .unwrap();
        assert_eq!(result.content.len(), MAX_TOOL_RESULT_CHARS);
        assert_eq!(result.token_count, (MAX_TOOL_RESULT_CHARS / 4) as i64);

        let history = store.conversations.history(ticket.id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "first");
        assert!(history[0].id < history[1].id);
        assert_eq!(store.conversations.message_count(ticket.id).unwrap(), 2);
    }

    #[test]
    fn test_take_pending_messages_consumes_once() {
        let (_dir, store) = temp_store();
        let project = seed_project(&store, "alpha", None);
        let ticket = seed_ticket(&store, project.id, "T-1", Priority::Medium);
        let other = seed_ticket(&store, project.id, "T-2", Priority::Medium);

        store.conversations.push_user_message(ticket.id, "please also add tests").unwrap();
        store.conversations.push_user_message(ticket.id, "/stop").unwrap();
        store.conversations.push_user_message(other.id, "/skip").unwrap();

        let pending = store.conversations.take_pending_messages(ticket.id).unwrap();
        let contents: Vec<&str> = pending.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["please also add tests", "/stop"]);
        assert!(store.conversations.take_pending_messages(ticket.id).unwrap().is_empty());
        assert_eq!(store.conversations.take_pending_messages(other.id).unwrap().len(), 1);
    }
}
