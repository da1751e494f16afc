//! Advisory memory: the agent decision audit trail and the symbol registry.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::instrument;

use keel_core::advisory::{AgentDecision, SymbolEntry};
use keel_core::ids::{DecisionId, SessionId, SymbolId};

use crate::error::StoreError;
use crate::row_helpers::{self, ts};

const DECISION_COLUMNS: &str =
    "id, agent, action, session_id, input, decision, success, created_at, completed_at";
const SYMBOL_COLUMNS: &str =
    "id, project, concept, name, context_type, confidence, usage_count, first_seen, last_seen";

pub struct DecisionRepo;

impl DecisionRepo {
    #[instrument(skip(conn, decision), fields(agent = %decision.agent, action = %decision.action))]
    pub fn append(conn: &Connection, decision: &AgentDecision) -> Result<(), StoreError> {
        conn.execute(
            &format!("INSERT INTO agent_memory ({DECISION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
            params![
                decision.id.as_str(),
                decision.agent,
                decision.action,
                decision.session_id.as_ref().map(|s| s.as_str()),
                serde_json::to_string(&decision.input)?,
                decision.decision,
                decision.success,
                ts(&decision.created_at),
                decision.completed_at.as_ref().map(ts),
            ],
        )?;
        Ok(())
    }

    /// Decisions for a session, oldest first, optionally filtered by action.
    pub fn for_session(
        conn: &Connection,
        session_id: &SessionId,
        action: Option<&str>,
    ) -> Result<Vec<AgentDecision>, StoreError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {DECISION_COLUMNS} FROM agent_memory
             WHERE session_id = ?1 AND (?2 IS NULL OR action = ?2)
             ORDER BY created_at ASC, rowid ASC"
        ))?;
        let mut rows = stmt.query(params![session_id.as_str(), action])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_decision(row)?);
        }
        Ok(out)
    }
}

pub struct SymbolRepo;

impl SymbolRepo {
    /// Register a name for a concept. An existing `(project, concept, name)`
    /// triple bumps its usage count and keeps the highest confidence seen.
    #[instrument(skip(conn))]
    pub fn register(
        conn: &Connection,
        project: &str,
        concept: &str,
        name: &str,
        context_type: &str,
        confidence: f64,
        at: DateTime<Utc>,
    ) -> Result<SymbolEntry, StoreError> {
        let now = ts(&at);
        conn.execute(
            "INSERT INTO symbol_registry
                (id, project, concept, name, context_type, confidence, usage_count, first_seen, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?7)
             ON CONFLICT (project, concept, name) DO UPDATE SET
                usage_count = usage_count + 1,
                confidence = MAX(confidence, excluded.confidence),
                last_seen = excluded.last_seen",
            params![
                SymbolId::new().as_str(),
                project,
                concept,
                name,
                context_type,
                confidence,
                now,
            ],
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {SYMBOL_COLUMNS} FROM symbol_registry
             WHERE project = ?1 AND concept = ?2 AND name = ?3"
        ))?;
        let mut rows = stmt.query(params![project, concept, name])?;
        match rows.next()? {
            Some(row) => row_to_symbol(row),
            None => Err(StoreError::NotFound(format!("symbol {concept}/{name}"))),
        }
    }

    /// Every symbol of a project, grouped by concept, most used first.
    pub fn for_project(conn: &Connection, project: &str) -> Result<Vec<SymbolEntry>, StoreError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {SYMBOL_COLUMNS} FROM symbol_registry WHERE project = ?1
             ORDER BY concept ASC, usage_count DESC, first_seen ASC"
        ))?;
        let mut rows = stmt.query([project])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_symbol(row)?);
        }
        Ok(out)
    }
}

fn row_to_decision(row: &rusqlite::Row<'_>) -> Result<AgentDecision, StoreError> {
    const T: &str = "agent_memory";
    let input: String = row_helpers::get(row, 4, T, "input")?;
    let created_at: String = row_helpers::get(row, 7, T, "created_at")?;
    Ok(AgentDecision {
        id: DecisionId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        agent: row_helpers::get(row, 1, T, "agent")?,
        action: row_helpers::get(row, 2, T, "action")?,
        session_id: row_helpers::get_opt::<String>(row, 3, T, "session_id")?.map(SessionId::from_raw),
        input: row_helpers::parse_json(&input, T, "input")?,
        decision: row_helpers::get(row, 5, T, "decision")?,
        success: row_helpers::get(row, 6, T, "success")?,
        created_at: row_helpers::parse_time(&created_at, T, "created_at")?,
        completed_at: row_helpers::parse_time_opt(row_helpers::get_opt(row, 8, T, "completed_at")?, T, "completed_at")?,
    })
}

fn row_to_symbol(row: &rusqlite::Row<'_>) -> Result<SymbolEntry, StoreError> {
    const T: &str = "symbol_registry";
    let first_seen: String = row_helpers::get(row, 7, T, "first_seen")?;
    let last_seen: String = row_helpers::get(row, 8, T, "last_seen")?;
    Ok(SymbolEntry {
        id: SymbolId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        project: row_helpers::get(row, 1, T, "project")?,
        concept: row_helpers::get(row, 2, T, "concept")?,
        name: row_helpers::get(row, 3, T, "name")?,
        context_type: row_helpers::get(row, 4, T, "context_type")?,
        confidence: row_helpers::get(row, 5, T, "confidence")?,
        usage_count: row_helpers::get_u64(row, 6, T, "usage_count")?,
        first_seen: row_helpers::parse_time(&first_seen, T, "first_seen")?,
        last_seen: row_helpers::parse_time(&last_seen, T, "last_seen")?,
    })
}
