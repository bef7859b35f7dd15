use crate::store::schema::*;
use crate::store::{get_conn, DbPool, PooledConn};
use rusqlite::{params, OptionalExtension, Row};
use tracing::warn;

/// Execution sessions, their logs and usage rows.
pub struct SessionStore {
    pool: DbPool,
}

impl SessionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<PooledConn> {
        get_conn(&self.pool)
    }

    /// Start a new `running` session for a ticket.
    ///
    /// Any session still marked running for the same ticket is stopped in the
    /// same transaction, so a ticket never has two running sessions.
    pub fn create_session(&self, ticket_id: i64) -> anyhow::Result<ExecutionSession> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let now = chrono::Utc::now();
        let now_str = format_ts(now);

        let stray = tx.execute(
            "UPDATE execution_sessions SET status = 'stopped', ended_at = ?1
             WHERE ticket_id = ?2 AND status = 'running'",
            params![now_str, ticket_id],
        )?;
        if stray > 0 {
            warn!(ticket_id, stray, "stopped stray running sessions before starting a new one");
        }

        tx.execute(
            "INSERT INTO execution_sessions (ticket_id, status, started_at, tokens_used)
             VALUES (?1, 'running', ?2, 0)",
            params![ticket_id, now_str],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(ExecutionSession {
            id,
            ticket_id,
            status: SessionStatus::Running,
            started_at: now,
            ended_at: None,
            tokens_used: 0,
        })
    }

    pub fn end_session(&self, session_id: i64, status: SessionStatus, tokens_used: i64) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE execution_sessions SET status = ?1, ended_at = ?2, tokens_used = ?3 WHERE id = ?4",
            params![status, now_ts(), tokens_used, session_id],
        )?;
        Ok(())
    }

    pub fn get_session(&self, session_id: i64) -> anyhow::Result<Option<ExecutionSession>> {
        let conn = self.get_conn()?;
        Ok(conn
            .query_row(
                "SELECT id, ticket_id, status, started_at, ended_at, tokens_used
                 FROM execution_sessions WHERE id = ?1",
                [session_id],
                row_to_session,
            )
            .optional()?)
    }

    pub fn sessions_for_ticket(&self, ticket_id: i64) -> anyhow::Result<Vec<ExecutionSession>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, ticket_id, status, started_at, ended_at, tokens_used
             FROM execution_sessions WHERE ticket_id = ?1 ORDER BY id ASC",
        )?;
        let sessions = stmt
            .query_map([ticket_id], row_to_session)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sessions)
    }

    pub fn running_session_count(&self, ticket_id: i64) -> anyhow::Result<i64> {
        let conn = self.get_conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM execution_sessions WHERE ticket_id = ?1 AND status = 'running'",
            [ticket_id],
            |row| row.get(0),
        )?)
    }

    /// Append a line to a session's execution log.
    pub fn log(&self, session_id: i64, log_type: &str, message: &str) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO execution_logs (session_id, log_type, message, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![session_id, log_type, message, now_ts()],
        )?;
        Ok(())
    }

    pub fn logs(&self, session_id: i64) -> anyhow::Result<Vec<(String, String)>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT log_type, message FROM execution_logs WHERE session_id = ?1 ORDER BY id ASC",
        )?;
        let logs = stmt
            .query_map([session_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(logs)
    }

    pub fn record_usage(
        &self,
        session_id: i64,
        ticket_id: i64,
        project_id: i64,
        usage: &UsageTotals,
        duration_seconds: i64,
    ) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO usage_stats
             (session_id, ticket_id, project_id, input_tokens, output_tokens, cache_read_tokens,
              cache_creation_tokens, api_calls, duration_seconds, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                session_id,
                ticket_id,
                project_id,
                usage.input_tokens,
                usage.output_tokens,
                usage.cache_read_tokens,
                usage.cache_creation_tokens,
                usage.api_calls,
                duration_seconds,
                now_ts(),
            ],
        )?;
        Ok(())
    }

    /// Summed usage across every session of a ticket.
    pub fn ticket_usage(&self, ticket_id: i64) -> anyhow::Result<UsageTotals> {
        let conn = self.get_conn()?;
        Ok(conn.query_row(
            "SELECT COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0),
                    COALESCE(SUM(cache_read_tokens), 0), COALESCE(SUM(cache_creation_tokens), 0),
                    COALESCE(SUM(api_calls), 0)
             FROM usage_stats WHERE ticket_id = ?1",
            [ticket_id],
            |row| {
                Ok(UsageTotals {
                    input_tokens: row.get(0)?,
                    output_tokens: row.get(1)?,
                    cache_read_tokens: row.get(2)?,
                    cache_creation_tokens: row.get(3)?,
                    api_calls: row.get(4)?,
                })
            },
        )?)
    }
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<ExecutionSession> {
    Ok(ExecutionSession {
        id: row.get(0)?,
        ticket_id: row.get(1)?,
        status: row.get(2)?,
        started_at: ts_column(row, 3)?,
        ended_at: opt_ts_column(row, 4)?,
        tokens_used: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::*;

    #[test]
    fn test_only_one_running_session_per_ticket() {
        let (_dir, store) = temp_store();
        let project = seed_project(&store, "alpha", None);
        let ticket = seed_ticket(&store, project.id, "T-1", Priority::Medium);

        let first = store.sessions.create_session(ticket.id).unwrap();
        let second = store.sessions.create_session(ticket.id).unwrap();
        assert_eq!(store.sessions.running_session_count(ticket.id).unwrap(), 1);
        assert_eq!(
            store.sessions.get_session(first.id).unwrap().unwrap().status,
            SessionStatus::Stopped
        );

        store.sessions.end_session(second.id, SessionStatus::Completed, 321).unwrap();
        let ended = store.sessions.get_session(second.id).unwrap().unwrap();
        assert_eq!(ended.status, SessionStatus::Completed);
        assert_eq!(ended.tokens_used, 321);
        assert!(ended.ended_at.is_some());
        assert_eq!(store.sessions.running_session_count(ticket.id).unwrap(), 0);
    }

    #[test]
    fn test_usage_and_logs_are_recorded() {
        let (_dir, store) = temp_store();
        let project = seed_project(&store, "alpha", None);
        let ticket = seed_ticket(&store, project.id, "T-1", Priority::Medium);
        let session = store.sessions.create_session(ticket.id).unwrap();

        let usage = UsageTotals {
            input_tokens: 100,
            output_tokens: 50,
            cache_read_tokens: 10,
            cache_creation_tokens: 5,
            api_calls: 2,
        };
        store.sessions.record_usage(session.id, ticket.id, project.id, &usage, 12).unwrap();
        store.sessions.record_usage(session.id, ticket.id, project.id, &usage, 3).unwrap();
        let total = store.sessions.ticket_usage(ticket.id).unwrap();
        assert_eq!(total.total_tokens(), 300);
        assert_eq!(total.api_calls, 4);

        store.sessions.log(session.id, "output", "compiling").unwrap();
        assert_eq!(
            store.sessions.logs(session.id).unwrap(),
            vec![("output".to_string(), "compiling".to_string())]
        );
    }
}
