//! Ticket store - SQLite-backed persistence for projects, tickets, conversations,
//! sessions, extractions and project knowledge.
//!
//! Every sub-store shares one r2d2 pool; connections are safe to use from the
//! scheduler and all project worker threads at once.

pub mod schema;
pub mod migration;
pub mod ticket_store;
pub mod conversation_store;
pub mod session_store;
pub mod extraction_store;
pub mod knowledge_store;

pub use schema::*;
pub use migration::MigrationManager;
pub use ticket_store::TicketRepository;
pub use conversation_store::ConversationStore;
pub use session_store::SessionStore;
pub use extraction_store::ExtractionStore;
pub use knowledge_store::{KnowledgeCaps, KnowledgeStore, ProjectKnowledge};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use tracing::info;

pub type DbPool = Arc<Pool<SqliteConnectionManager>>;
pub type PooledConn = r2d2::PooledConnection<SqliteConnectionManager>;

pub(crate) fn get_conn(pool: &DbPool) -> anyhow::Result<PooledConn> {
    pool.get()
        .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
}

pub struct TicketStore {
    pub tickets: TicketRepository,
    pub conversations: ConversationStore,
    pub sessions: SessionStore,
    pub extractions: ExtractionStore,
    pub knowledge: KnowledgeStore,
    pool: DbPool,
}

impl TicketStore {
    /// Open (creating if needed) the store at `db_path` and apply migrations.
    pub fn open(db_path: &Path, pool_size: u32) -> anyhow::Result<Self> {
        info!("Opening ticket store at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| {
                conn.busy_timeout(Duration::from_secs(5))?;
                conn.execute_batch(
                    "PRAGMA foreign_keys = ON;
                     PRAGMA synchronous = NORMAL;",
                )
            });
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;

        {
            let mut conn = pool.get()?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
            let mut migrator = MigrationManager::new(&mut conn);
            migrator.initialize_database()?;
        }

        info!("Ticket store initialized successfully");
        Ok(Self::from_pool(Arc::new(pool)))
    }

    fn from_pool(pool: DbPool) -> Self {
        Self {
            tickets: TicketRepository::new(Arc::clone(&pool)),
            conversations: ConversationStore::new(Arc::clone(&pool)),
            sessions: SessionStore::new(Arc::clone(&pool)),
            extractions: ExtractionStore::new(Arc::clone(&pool)),
            knowledge: KnowledgeStore::new(Arc::clone(&pool)),
            pool,
        }
    }

    /// Reset work orphaned by an unclean shutdown.
    ///
    /// Tickets left `in_progress` go back to `open` and sessions left `running`
    /// are marked `stuck`. Running it on a clean store changes nothing.
    pub fn recover_orphans(&self) -> anyhow::Result<RecoveryReport> {
        let mut conn = get_conn(&self.pool)?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let now = now_ts();

        let tickets_reset = tx.execute(
            "UPDATE tickets SET status = 'open', review_deadline = NULL, updated_at = ?1
             WHERE status = 'in_progress'",
            [&now],
        )?;
        let sessions_marked_stuck = tx.execute(
            "UPDATE execution_sessions SET status = 'stuck', ended_at = ?1
             WHERE status = 'running'",
            [&now],
        )?;
        tx.commit()?;

        Ok(RecoveryReport {
            tickets_reset,
            sessions_marked_stuck,
        })
    }

    pub fn set_daemon_status(&self, status: &str, pid: Option<u32>) -> anyhow::Result<()> {
        let conn = get_conn(&self.pool)?;
        let now = now_ts();
        let started_at = (status == "running").then(|| now.clone());
        conn.execute(
            "INSERT INTO daemon_status (id, status, pid, started_at, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                pid = excluded.pid,
                started_at = COALESCE(excluded.started_at, daemon_status.started_at),
                updated_at = excluded.updated_at",
            rusqlite::params![status, pid.map(i64::from), started_at, now],
        )?;
        Ok(())
    }

    pub fn daemon_status(&self) -> anyhow::Result<Option<DaemonStatus>> {
        use rusqlite::OptionalExtension;
        let conn = get_conn(&self.pool)?;
        let status = conn
            .query_row(
                "SELECT status, pid, started_at, updated_at FROM daemon_status WHERE id = 1",
                [],
                |row| {
                    Ok(DaemonStatus {
                        status: row.get(0)?,
                        pid: row.get(1)?,
                        started_at: opt_ts_column(row, 2)?,
                        updated_at: ts_column(row, 3)?,
                    })
                },
            )
            .optional()?;
        Ok(status)
    }
}

impl Drop for TicketStore {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    /// File-backed store in a temp dir; keep the dir alive for the test.
    pub fn temp_store() -> (TempDir, TicketStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TicketStore::open(&dir.path().join("tickets.db"), 4).unwrap();
        (dir, store)
    }

    pub fn seed_project(store: &TicketStore, code: &str, web_path: Option<&str>) -> Project {
        let id = store
            .tickets
            .insert_project(&NewProject {
                name: format!("Project {}", code),
                code: code.to_string(),
                web_path: web_path.map(str::to_string),
                app_path: None,
                project_type: None,
                tech_stack: vec!["rust".into()],
                context: None,
            })
            .unwrap();
        store.tickets.get_project(id).unwrap().unwrap()
    }

    pub fn seed_ticket(store: &TicketStore, project_id: i64, number: &str, priority: Priority) -> Ticket {
        let id = store
            .tickets
            .insert_ticket(&NewTicket {
                project_id,
                ticket_number: number.to_string(),
                title: format!("Ticket {}", number),
                description: Some("Fix the thing".into()),
                context: None,
                priority,
                status: TicketStatus::Open,
            })
            .unwrap();
        store.tickets.get_ticket(id).unwrap().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_recovery_resets_orphans_then_is_noop() {
        let (_dir, store) = temp_store();
        let project = seed_project(&store, "alpha", None);
        let ticket = seed_ticket(&store, project.id, "T-1", Priority::Medium);
        store.tickets.update_ticket_status(ticket.id, TicketStatus::InProgress, None).unwrap();
        store.sessions.create_session(ticket.id).unwrap();

        let first = store.recover_orphans().unwrap();
        assert_eq!(first, RecoveryReport { tickets_reset: 1, sessions_marked_stuck: 1 });

        let ticket = store.tickets.get_ticket(ticket.id).unwrap().unwrap();
        assert_eq!(ticket.status, TicketStatus::Open);
        assert_eq!(store.sessions.running_session_count(ticket.id).unwrap(), 0);

        let second = store.recover_orphans().unwrap();
        assert!(second.is_noop());
    }

    #[test]
    fn test_daemon_status_upsert() {
        let (_dir, store) = temp_store();
        assert!(store.daemon_status().unwrap().is_none());

        store.set_daemon_status("running", Some(42)).unwrap();
        let running = store.daemon_status().unwrap().unwrap();
        assert_eq!(running.status, "running");
        assert_eq!(running.pid, Some(42));
        assert!(running.started_at.is_some());

        store.set_daemon_status("stopped", None).unwrap();
        let stopped = store.daemon_status().unwrap().unwrap();
        assert_eq!(stopped.status, "stopped");
        assert_eq!(stopped.started_at, running.started_at);
    }
}
