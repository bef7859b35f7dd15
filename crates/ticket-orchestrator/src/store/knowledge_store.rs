use crate::store::schema::*;
use crate::store::{get_conn, DbPool, PooledConn};
use crate::utils::BoundedList;
use rusqlite::{params, Connection, OptionalExtension, Row};

/// Capacities applied when knowledge lists are loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnowledgeCaps {
    pub list_cap: usize,
    pub ticket_cap: usize,
}

impl Default for KnowledgeCaps {
    fn default() -> Self {
        Self {
            list_cap: 20,
            ticket_cap: 50,
        }
    }
}

/// Long-lived per-project knowledge accumulated from extractions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectKnowledge {
    pub project_id: i64,
    pub known_gotchas: BoundedList<String>,
    pub error_solutions: BoundedList<String>,
    pub architecture_decisions: BoundedList<String>,
    pub learned_from_tickets: BoundedList<i64>,
}

impl ProjectKnowledge {
    pub fn empty(project_id: i64, caps: KnowledgeCaps) -> Self {
        Self {
            project_id,
            known_gotchas: BoundedList::new(caps.list_cap),
            error_solutions: BoundedList::new(caps.list_cap),
            architecture_decisions: BoundedList::new(caps.list_cap),
            learned_from_tickets: BoundedList::new(caps.ticket_cap),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.known_gotchas.is_empty()
            && self.error_solutions.is_empty()
            && self.architecture_decisions.is_empty()
    }
}

/// Project knowledge, project maps and user preferences.
pub struct KnowledgeStore {
    pool: DbPool,
}

impl KnowledgeStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<PooledConn> {
        get_conn(&self.pool)
    }

    pub fn load(&self, project_id: i64, caps: KnowledgeCaps) -> anyhow::Result<ProjectKnowledge> {
        let conn = self.get_conn()?;
        load_knowledge(&conn, project_id, caps)
    }

    /// Read-modify-write the project's knowledge inside one transaction.
    pub fn update<F>(&self, project_id: i64, caps: KnowledgeCaps, f: F) -> anyhow::Result<ProjectKnowledge>
    where
        F: FnOnce(&mut ProjectKnowledge),
    {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let mut knowledge = load_knowledge(&tx, project_id, caps)?;
        f(&mut knowledge);

        tx.execute(
            "INSERT INTO project_knowledge
             (project_id, known_gotchas, error_solutions, architecture_decisions, learned_from_tickets, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(project_id) DO UPDATE SET
                known_gotchas = excluded.known_gotchas,
                error_solutions = excluded.error_solutions,
                architecture_decisions = excluded.architecture_decisions,
                learned_from_tickets = excluded.learned_from_tickets,
                updated_at = excluded.updated_at",
            params![
                project_id,
                serde_json::to_string(&knowledge.known_gotchas.to_vec())?,
                serde_json::to_string(&knowledge.error_solutions.to_vec())?,
                serde_json::to_string(&knowledge.architecture_decisions.to_vec())?,
                serde_json::to_string(&knowledge.learned_from_tickets.to_vec())?,
                now_ts(),
            ],
        )?;
        tx.commit()?;
        Ok(knowledge)
    }

    pub fn project_map(&self, project_id: i64) -> anyhow::Result<Option<ProjectMap>> {
        let conn = self.get_conn()?;
        Ok(conn
            .query_row(
                "SELECT project_id, structure_summary, entry_points, tech_stack, primary_language,
                        fingerprint, generated_at, expires_at
                 FROM project_maps WHERE project_id = ?1",
                [project_id],
                row_to_project_map,
            )
            .optional()?)
    }

    pub fn save_project_map(&self, map: &ProjectMap) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO project_maps
             (project_id, structure_summary, entry_points, tech_stack, primary_language,
              fingerprint, generated_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                map.project_id,
                map.structure_summary,
                serde_json::to_string(&map.entry_points)?,
                serde_json::to_string(&map.tech_stack)?,
                map.primary_language,
                map.fingerprint,
                format_ts(map.generated_at),
                format_ts(map.expires_at),
            ],
        )?;
        Ok(())
    }

    pub fn user_preferences(&self, user_id: &str) -> anyhow::Result<Option<UserPreferences>> {
        let conn = self.get_conn()?;
        Ok(conn
            .query_row(
                "SELECT user_id, language, response_style, skill_level, custom_instructions, learned_quirks
                 FROM user_preferences WHERE user_id = ?1",
                [user_id],
                |row| {
                    Ok(UserPreferences {
                        user_id: row.get(0)?,
                        language: row.get(1)?,
                        response_style: row.get(2)?,
                        skill_level: row.get(3)?,
                        custom_instructions: row.get(4)?,
                        learned_quirks: json_list_column(row, 5)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn save_user_preferences(&self, prefs: &UserPreferences) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO user_preferences
             (user_id, language, response_style, skill_level, custom_instructions, learned_quirks, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                prefs.user_id,
                prefs.language,
                prefs.response_style,
                prefs.skill_level,
                prefs.custom_instructions,
                serde_json::to_string(&prefs.learned_quirks)?,
                now_ts(),
            ],
        )?;
        Ok(())
    }
}

fn load_knowledge(conn: &Connection, project_id: i64, caps: KnowledgeCaps) -> anyhow::Result<ProjectKnowledge> {
    let row = conn
        .query_row(
            "SELECT known_gotchas, error_solutions, architecture_decisions, learned_from_tickets
             FROM project_knowledge WHERE project_id = ?1",
            [project_id],
            |row| {
                Ok((
                    json_list_column(row, 0)?,
                    json_list_column(row, 1)?,
                    json_list_column(row, 2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            },
        )
        .optional()?;

    let Some((gotchas, solutions, decisions, tickets_json)) = row else {
        return Ok(ProjectKnowledge::empty(project_id, caps));
    };
    let tickets: Vec<i64> = match tickets_json {
        Some(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)?,
        _ => Vec::new(),
    };

    Ok(ProjectKnowledge {
        project_id,
        known_gotchas: BoundedList::from_vec(gotchas, caps.list_cap),
        error_solutions: BoundedList::from_vec(solutions, caps.list_cap),
        architecture_decisions: BoundedList::from_vec(decisions, caps.list_cap),
        learned_from_tickets: BoundedList::from_vec(tickets, caps.ticket_cap),
    })
}

fn row_to_project_map(row: &Row<'_>) -> rusqlite::Result<ProjectMap> {
    Ok(ProjectMap {
        project_id: row.get(0)?,
        structure_summary: row.get(1)?,
        entry_points: json_list_column(row, 2)?,
        tech_stack: json_list_column(row, 3)?,
        primary_language: row.get(4)?,
        fingerprint: row.get(5)?,
        generated_at: ts_column(row, 6)?,
        expires_at: ts_column(row, 7)?,
    })
}
