use crate::store::schema::*;
use crate::store::{get_conn, DbPool, PooledConn};
use rusqlite::{params, OptionalExtension, Row};
use tracing::info;

const EXTRACTION_COLUMNS: &str =
    "id, ticket_id, from_message_id, to_message_id, messages_summarized, decisions,
     problems_solved, current_status, key_info, important_notes, files_referenced,
     tokens_before, tokens_after, created_at";

/// Conversation extractions.
pub struct ExtractionStore {
    pool: DbPool,
}

impl ExtractionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<PooledConn> {
        get_conn(&self.pool)
    }

    /// Persist an extraction and flag the messages it covers as summarized.
    ///
    /// Both writes share one transaction. If any covered message was already
    /// summarized the whole write is rolled back.
    pub fn save_extraction(
        &self,
        ticket_id: i64,
        covered_ids: &[i64],
        summary: &ExtractionSummary,
        tokens_before: i64,
        tokens_after: i64,
    ) -> anyhow::Result<ConversationExtraction> {
        let (Some(&from_id), Some(&to_id)) = (covered_ids.iter().min(), covered_ids.iter().max()) else {
            anyhow::bail!("extraction for ticket {} covers no messages", ticket_id);
        };

        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let now = chrono::Utc::now();

        tx.execute(
            "INSERT INTO conversation_extractions
             (ticket_id, from_message_id, to_message_id, messages_summarized, decisions,
              problems_solved, current_status, key_info, important_notes, files_referenced,
              tokens_before, tokens_after, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                ticket_id,
                from_id,
                to_id,
                covered_ids.len() as i64,
                serde_json::to_string(&summary.decisions)?,
                serde_json::to_string(&summary.problems_solved)?,
                summary.current_status,
                summary.key_info,
                serde_json::to_string(&summary.important_notes)?,
                serde_json::to_string(&summary.files_referenced)?,
                tokens_before,
                tokens_after,
                format_ts(now),
            ],
        )?;
        let id = tx.last_insert_rowid();

        let mut flagged = 0;
        {
            let mut mark = tx.prepare(
                "UPDATE conversation_messages SET is_summarized = 1
                 WHERE id = ?1 AND ticket_id = ?2 AND is_summarized = 0",
            )?;
            for message_id in covered_ids {
                flagged += mark.execute(params![message_id, ticket_id])?;
            }
        }
        if flagged != covered_ids.len() {
            anyhow::bail!(
                "extraction for ticket {} expected to flag {} messages but flagged {}",
                ticket_id,
                covered_ids.len(),
                flagged
            );
        }
        tx.commit()?;

        info!(ticket_id, from_id, to_id, messages = flagged, "saved conversation extraction");
        Ok(ConversationExtraction {
            id,
            ticket_id,
            from_message_id: from_id,
            to_message_id: to_id,
            messages_summarized: flagged as i64,
            summary: summary.clone(),
            tokens_before,
            tokens_after,
            created_at: now,
        })
    }

    pub fn latest_extraction(&self, ticket_id: i64) -> anyhow::Result<Option<ConversationExtraction>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM conversation_extractions WHERE ticket_id = ?1 ORDER BY id DESC LIMIT 1",
            EXTRACTION_COLUMNS
        );
        Ok(conn.query_row(&sql, [ticket_id], row_to_extraction).optional()?)
    }

    pub fn extractions_for_ticket(&self, ticket_id: i64) -> anyhow::Result<Vec<ConversationExtraction>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM conversation_extractions WHERE ticket_id = ?1 ORDER BY id ASC",
            EXTRACTION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let extractions = stmt
            .query_map([ticket_id], row_to_extraction)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(extractions)
    }
}

fn row_to_extraction(row: &Row<'_>) -> rusqlite::Result<ConversationExtraction> {
    Ok(ConversationExtraction {
        id: row.get(0)?,
        ticket_id: row.get(1)?,
        from_message_id: row.get(2)?,
        to_message_id: row.get(3)?,
        messages_summarized: row.get(4)?,
        summary: ExtractionSummary {
            decisions: json_list_column(row, 5)?,
            problems_solved: json_list_column(row, 6)?,
            current_status: row.get(7)?,
            key_info: row.get(8)?,
            important_notes: json_list_column(row, 9)?,
            files_referenced: json_list_column(row, 10)?,
        },
        tokens_before: row.get(11)?,
        tokens_after: row.get(12)?,
        created_at: ts_column(row, 13)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::*;

    #[test]
    fn test_save_extraction_flags_covered_messages() {
        let (_dir, store) = temp_store();
        let project = seed_project(&store, "alpha", None);
        let ticket = seed_ticket(&store, project.id, "T-1", Priority::Medium);
        let ids: Vec<i64> = (0..4)
            .map(|i| {
                store
                    .conversations
                    .add_message(ticket.id, None, MessageRole::User, &format!("msg {}", i), None)
                    .unwrap()
                    .id
            })
            .collect();

        let summary = ExtractionSummary {
            decisions: vec!["use sqlite".into()],
            current_status: "halfway".into(),
            ..Default::default()
        };
        let saved = store
            .extractions
            .save_extraction(ticket.id, &ids[..3], &summary, 400, 20)
            .unwrap();
        assert_eq!((saved.from_message_id, saved.to_message_id), (ids[0], ids[2]));

        let remaining = store.conversations.unsummarized(ticket.id).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, ids[3]);

        let latest = store.extractions.latest_extraction(ticket.id).unwrap().unwrap();
        assert_eq!(latest.summary, summary);
        assert_eq!(latest.messages_summarized, 3);
    }

    #[test]
    fn test_overlapping_extraction_rolls_back() {
        let (_dir, store) = temp_store();
        let project = seed_project(&store, "alpha", None);
        let ticket = seed_ticket(&store, project.id, "T-1", Priority::Medium);
        let a = store.conversations.add_message(ticket.id, None, MessageRole::User, "a", None).unwrap();
        let b = store.conversations.add_message(ticket.id, None, MessageRole::User, "b", None).unwrap();

        let summary = ExtractionSummary::default();
        store.extractions.save_extraction(ticket.id, &[a.id], &summary, 1, 1).unwrap();
        assert!(store.extractions.save_extraction(ticket.id, &[a.id, b.id], &summary, 1, 1).is_err());

        assert_eq!(store.extractions.extractions_for_ticket(ticket.id).unwrap().len(), 1);
        assert_eq!(store.conversations.unsummarized(ticket.id).unwrap().len(), 1);
        assert!(store.extractions.save_extraction(ticket.id, &[], &summary, 0, 0).is_err());
    }
}
