use crate::store::schema::*;
use crate::store::{get_conn, DbPool, PooledConn};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

/// Result summaries are capped before they are stored.
pub const MAX_RESULT_SUMMARY_CHARS: usize = 1000;

const PROJECT_COLUMNS: &str =
    "id, name, code, web_path, app_path, project_type, tech_stack, context, status,
     total_tokens, total_duration_seconds";

const TICKET_COLUMNS: &str =
    "id, project_id, ticket_number, title, description, context, priority, status,
     result_summary, review_deadline, closed_at, closed_by, close_reason,
     total_tokens, total_duration_seconds, created_at, updated_at";

/// SQL ordering expression for ticket priority.
const PRIORITY_RANK_SQL: &str =
    "CASE priority WHEN 'critical' THEN 1 WHEN 'high' THEN 2 WHEN 'medium' THEN 3 WHEN 'low' THEN 4 ELSE 5 END";

/// Projects and tickets.
pub struct TicketRepository {
    pool: DbPool,
}

impl TicketRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<PooledConn> {
        get_conn(&self.pool)
    }

    pub fn insert_project(&self, project: &NewProject) -> anyhow::Result<i64> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO projects (name, code, web_path, app_path, project_type, tech_stack, context)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                project.name,
                project.code,
                project.web_path,
                project.app_path,
                project.project_type,
                serde_json::to_string(&project.tech_stack)?,
                project.context,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_ticket(&self, ticket: &NewTicket) -> anyhow::Result<i64> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO tickets (project_id, ticket_number, title, description, context, priority, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                ticket.project_id,
                ticket.ticket_number,
                ticket.title,
                ticket.description,
                ticket.context,
                ticket.priority,
                ticket.status,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_project(&self, project_id: i64) -> anyhow::Result<Option<Project>> {
        let conn = self.get_conn()?;
        let sql = format!("SELECT {} FROM projects WHERE id = ?1", PROJECT_COLUMNS);
        Ok(conn.query_row(&sql, [project_id], row_to_project).optional()?)
    }

    pub fn set_project_status(&self, project_id: i64, status: ProjectStatus) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE projects SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status, now_ts(), project_id],
        )?;
        Ok(())
    }

    /// Active projects with at least one runnable ticket, most urgent first.
    pub fn projects_with_runnable_tickets(&self) -> anyhow::Result<Vec<Project>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT p.id, p.name, p.code, p.web_path, p.app_path, p.project_type, p.tech_stack,
                    p.context, p.status, p.total_tokens, p.total_duration_seconds
             FROM projects p
             JOIN (
                SELECT project_id, MIN({rank}) AS best_rank, MIN(created_at) AS oldest
                FROM tickets
                WHERE status IN ('open', 'new', 'pending')
                GROUP BY project_id
             ) t ON t.project_id = p.id
             WHERE p.status = 'active'
             ORDER BY t.best_rank ASC, t.oldest ASC, p.id ASC",
            rank = PRIORITY_RANK_SQL
        );
        let mut stmt = conn.prepare(&sql)?;
        let projects = stmt
            .query_map([], row_to_project)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(projects)
    }

    /// Next runnable ticket for a project: highest priority, then oldest.
    pub fn next_ticket(&self, project_id: i64) -> anyhow::Result<Option<Ticket>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {cols} FROM tickets
             WHERE project_id = ?1 AND status IN ('open', 'new', 'pending')
             ORDER BY {rank} ASC, created_at ASC, id ASC
             LIMIT 1",
            cols = TICKET_COLUMNS,
            rank = PRIORITY_RANK_SQL
        );
        Ok(conn.query_row(&sql, [project_id], row_to_ticket).optional()?)
    }

    pub fn get_ticket(&self, ticket_id: i64) -> anyhow::Result<Option<Ticket>> {
        let conn = self.get_conn()?;
        let sql = format!("SELECT {} FROM tickets WHERE id = ?1", TICKET_COLUMNS);
        Ok(conn.query_row(&sql, [ticket_id], row_to_ticket).optional()?)
    }

    /// Set a ticket's status. Any status change clears the review deadline.
    pub fn update_ticket_status(
        &self,
        ticket_id: i64,
        status: TicketStatus,
        result_summary: Option<&str>,
    ) -> anyhow::Result<()> {
        self.write_status(ticket_id, status, result_summary, None)
    }

    /// Park a ticket for review until `deadline`.
    pub fn mark_awaiting_input(
        &self,
        ticket_id: i64,
        result_summary: Option<&str>,
        deadline: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.write_status(ticket_id, TicketStatus::AwaitingInput, result_summary, Some(deadline))
    }

    fn write_status(
        &self,
        ticket_id: i64,
        status: TicketStatus,
        result_summary: Option<&str>,
        deadline: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        let summary = result_summary
            .map(|s| crate::utils::TextUtils::take_chars(s, MAX_RESULT_SUMMARY_CHARS).to_string());
        conn.execute(
            "UPDATE tickets
             SET status = ?1,
                 result_summary = COALESCE(?2, result_summary),
                 review_deadline = ?3,
                 updated_at = ?4
             WHERE id = ?5",
            params![status, summary, deadline.map(format_ts), now_ts(), ticket_id],
        )?;
        debug!(ticket_id, status = %status, "ticket status updated");
        Ok(())
    }

    /// Close every `awaiting_input` ticket whose review deadline is before `now`.
    pub fn auto_close_expired(&self, now: DateTime<Utc>, closed_by: &str) -> anyhow::Result<Vec<i64>> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let now_str = format_ts(now);

        let ids = {
            let mut stmt = tx.prepare(
                "SELECT id FROM tickets
                 WHERE status = 'awaiting_input'
                   AND review_deadline IS NOT NULL
                   AND review_deadline < ?1",
            )?;
            let ids = stmt
                .query_map([&now_str], |row| row.get::<_, i64>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ids
        };

        for id in &ids {
            tx.execute(
                "UPDATE tickets
                 SET status = 'done', closed_at = ?1, closed_by = ?2,
                     close_reason = 'auto_closed_7days', review_deadline = NULL, updated_at = ?1
                 WHERE id = ?3",
                params![now_str, closed_by, id],
            )?;
        }
        tx.commit()?;
        Ok(ids)
    }

    /// Add a finished session's usage to the ticket and project totals.
    pub fn add_usage(
        &self,
        ticket_id: i64,
        project_id: i64,
        tokens: i64,
        duration_seconds: i64,
    ) -> anyhow::Result<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE tickets SET total_tokens = total_tokens + ?1,
                total_duration_seconds = total_duration_seconds + ?2
             WHERE id = ?3",
            params![tokens, duration_seconds, ticket_id],
        )?;
        tx.execute(
            "UPDATE projects SET total_tokens = total_tokens + ?1,
                total_duration_seconds = total_duration_seconds + ?2
             WHERE id = ?3",
            params![tokens, duration_seconds, project_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Ticket counts grouped by status.
    pub fn count_by_status(&self) -> anyhow::Result<Vec<(TicketStatus, i64)>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tickets GROUP BY status ORDER BY status")?;
        let counts = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(counts)
    }
}

/// Accepts both JSON arrays and comma-separated text.
fn tech_stack_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<String>> {
    let raw: Option<String> = row.get(idx)?;
    let Some(raw) = raw else { return Ok(Vec::new()) };
    if let Ok(list) = serde_json::from_str::<Vec<String>>(&raw) {
        return Ok(list);
    }
    Ok(raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect())
}

fn row_to_project(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        code: row.get(2)?,
        web_path: row.get(3)?,
        app_path: row.get(4)?,
        project_type: row.get(5)?,
        tech_stack: tech_stack_column(row, 6)?,
        context: row.get(7)?,
        status: row.get(8)?,
        total_tokens: row.get(9)?,
        total_duration_seconds: row.get(10)?,
    })
}

fn row_to_ticket(row: &Row<'_>) -> rusqlite::Result<Ticket> {
    Ok(Ticket {
        id: row.get(0)?,
        project_id: row.get(1)?,
        ticket_number: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        context: row.get(5)?,
        priority: row.get(6)?,
        status: row.get(7)?,
        result_summary: row.get(8)?,
        review_deadline: opt_ts_column(row, 9)?,
        closed_at: opt_ts_column(row, 10)?,
        closed_by: row.get(11)?,
        close_reason: row.get(12)?,
        total_tokens: row.get(13)?,
        total_duration_seconds: row.get(14)?,
        created_at: ts_column(row, 15)?,
        updated_at: ts_column(row, 16)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::*;
    use chrono::Duration;

    #[test]
    fn test_next_ticket_prefers_priority_over_age() {
        let (_dir, store) = temp_store();
        let project = seed_project(&store, "alpha", None);
        let low = seed_ticket(&store, project.id, "T-1", Priority::Low);
        let critical = seed_ticket(&store, project.id, "T-2", Priority::Critical);

        let next = store.tickets.next_ticket(project.id).unwrap().unwrap();
        assert_eq!(next.id, critical.id);

        store.tickets.update_ticket_status(critical.id, TicketStatus::InProgress, None).unwrap();
        let next = store.tickets.next_ticket(project.id).unwrap().unwrap();
        assert_eq!(next.id, low.id);
    }

    #[test]
    fn test_projects_ordered_by_most_urgent_ticket() {
        let (_dir, store) = temp_store();
        let calm = seed_project(&store, "calm", None);
        let urgent = seed_project(&store, "urgent", None);
        let archived = seed_project(&store, "old", None);
        seed_ticket(&store, calm.id, "C-1", Priority::Low);
        seed_ticket(&store, urgent.id, "U-1", Priority::High);
        seed_ticket(&store, archived.id, "O-1", Priority::Critical);
        store.tickets.set_project_status(archived.id, ProjectStatus::Archived).unwrap();

        let ids: Vec<i64> = store
            .tickets
            .projects_with_runnable_tickets()
            .unwrap()
            .iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec![urgent.id, calm.id]);
    }

    #[test]
    fn test_status_update_clears_review_deadline() {
        let (_dir, store) = temp_store();
        let project = seed_project(&store, "alpha", None);
        let ticket = seed_ticket(&store, project.id, "T-1", Priority::Medium);

        let deadline = Utc::now() + Duration::days(7);
        store.tickets.mark_awaiting_input(ticket.id, Some("done"), deadline).unwrap();
        let parked = store.tickets.get_ticket(ticket.id).unwrap().unwrap();
        assert_eq!(parked.status, TicketStatus::AwaitingInput);
        assert!(parked.review_deadline.is_some());
        assert_eq!(parked.result_summary.as_deref(), Some("done"));

        store.tickets.update_ticket_status(ticket.id, TicketStatus::InProgress, None).unwrap();
        let resumed = store.tickets.get_ticket(ticket.id).unwrap().unwrap();
        assert!(resumed.review_deadline.is_none());
        assert_eq!(resumed.result_summary.as_deref(), Some("done"));
    }

    #[test]
    fn test_auto_close_only_expired_reviews() {
        let (_dir, store) = temp_store();
        let project = seed_project(&store, "alpha", None);
        let expired = seed_ticket(&store, project.id, "T-1", Priority::Medium);
        let fresh = seed_ticket(&store, project.id, "T-2", Priority::Medium);
        let now = Utc::now();
        store.tickets.mark_awaiting_input(expired.id, None, now - Duration::hours(1)).unwrap();
        store.tickets.mark_awaiting_input(fresh.id, None, now + Duration::days(3)).unwrap();

        let closed = store.tickets.auto_close_expired(now, "daemon").unwrap();
        assert_eq!(closed, vec![expired.id]);

        let done = store.tickets.get_ticket(expired.id).unwrap().unwrap();
        assert_eq!(done.status, TicketStatus::Done);
        assert_eq!(done.close_reason.as_deref(), Some("auto_closed_7days"));
        assert_eq!(done.closed_by.as_deref(), Some("daemon"));
        assert!(done.review_deadline.is_none());
        assert_eq!(
            store.tickets.get_ticket(fresh.id).unwrap().unwrap().status,
            TicketStatus::AwaitingInput
        );
    }

    #[test]
    fn test_result_summary_is_capped() {
        let (_dir, store) = temp_store();
        let project = seed_project(&store, "alpha", None);
        let ticket = seed_ticket(&store, project.id, "T-1", Priority::Medium);
        let long = "x".repeat(5000);
        store.tickets.update_ticket_status(ticket.id, TicketStatus::Failed, Some(&long)).unwrap();
        let failed = store.tickets.get_ticket(ticket.id).unwrap().unwrap();
        assert_eq!(failed.result_summary.unwrap().len(), MAX_RESULT_SUMMARY_CHARS);
    }

    #[test]
    fn test_add_usage_rolls_up() {
        let (_dir, store) = temp_store();
        let project = seed_project(&store, "alpha", None);
        let ticket = seed_ticket(&store, project.id, "T-1", Priority::Medium);
        store.tickets.add_usage(ticket.id, project.id, 1200, 30).unwrap();
        store.tickets.add_usage(ticket.id, project.id, 800, 10).unwrap();

        let ticket = store.tickets.get_ticket(ticket.id).unwrap().unwrap();
        assert_eq!((ticket.total_tokens, ticket.total_duration_seconds), (2000, 40));
        let project = store.tickets.get_project(project.id).unwrap().unwrap();
        assert_eq!(project.total_tokens, 2000);
        assert_eq!(project.tech_stack, vec!["rust".to_string()]);
    }
}
