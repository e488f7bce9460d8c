//! SQLite-backed runtime store.
//!
//! One store instance backs every repository interface the engine
//! consumes: events, cursors, runs, transitions, catalog, concepts,
//! misconceptions, decision traces, and policy snapshots. The engine is
//! single-writer per user, so a page transaction is expressed as
//! `BEGIN IMMEDIATE .. COMMIT` on the shared connection.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::path::Path as FsPath;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::catalog::{NodeActivity, Path, PathNode, PathStatus, RuntimePlan};
use crate::concept::{
    Concept, ConceptEdge, ConceptState, EdgeType, MisconceptionInstance, MisconceptionStatus,
    MisconceptionResolutionState, MisconceptionSupport, ResolutionStatus,
};
use crate::document::NodeDocument;
use crate::error::{Error, Result};
use crate::event::{Event, EventType};
use crate::ids::{ActivityId, ConceptId, EventId, NodeId, PathId, TraceId, UserId};
use crate::policy::{ModelParams, ModelSnapshot, PolicyEvalSnapshot};
use crate::state::{
    ActivityRun, ActivityRunState, NodeRun, NodeRunState, PathRun, PathRunState, PathRunTransition,
};
use crate::storage::schema::{initialize_schema, is_initialized};
use crate::trace::{ChosenTrace, ChosenUpdate, DecisionTrace};

/// Fixed-width UTC timestamp; lexicographic order matches time order.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(idx: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_opt_ts(idx: usize, text: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    text.map(|t| parse_ts(idx, &t)).transpose()
}

fn parse_uuid<T: From<Uuid>>(idx: usize, text: &str) -> rusqlite::Result<T> {
    Uuid::parse_str(text)
        .map(T::from)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_opt_uuid<T: From<Uuid>>(idx: usize, text: Option<String>) -> rusqlite::Result<Option<T>> {
    text.map(|t| parse_uuid(idx, &t)).transpose()
}

fn parse_json<T: DeserializeOwned>(idx: usize, text: &str) -> rusqlite::Result<T> {
    serde_json::from_str(text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Wire text of a snake_case unit enum.
fn enum_text<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn parse_enum<T: DeserializeOwned>(idx: usize, text: &str) -> rusqlite::Result<T> {
    serde_json::from_value(Value::String(text.to_string())).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
    })
}

/// Placeholder list `?,?,...` for an IN clause.
fn placeholders(n: usize) -> String {
    let mut s = String::with_capacity(n * 2);
    for i in 0..n {
        if i > 0 {
            s.push(',');
        }
        s.push('?');
    }
    s
}

/// SQLite-backed store for every engine repository.
pub struct SqliteRuntimeStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRuntimeStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<FsPath>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::apply(e.to_string()))?;
        if !is_initialized(&conn) {
            initialize_schema(&conn).map_err(|e| Error::apply(e.to_string()))?;
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::apply(e.to_string()))?;
        initialize_schema(&conn).map_err(|e| Error::apply(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock connection: {}", e)))?;
        f(&conn).map_err(|e| Error::apply(e.to_string()))
    }

    // ==================== Transactions ====================

    /// Begin the page transaction.
    pub fn begin(&self) -> Result<()> {
        self.with_conn(|conn| conn.execute_batch("BEGIN IMMEDIATE"))
    }

    /// Commit the page transaction.
    pub fn commit(&self) -> Result<()> {
        self.with_conn(|conn| conn.execute_batch("COMMIT"))
    }

    /// Roll back the page transaction.
    pub fn rollback(&self) -> Result<()> {
        self.with_conn(|conn| conn.execute_batch("ROLLBACK"))
    }

    /// Run `f` inside one transaction; commit on success, roll back on
    /// error. The single-writer-per-user contract means no other writer
    /// interleaves between the statements.
    pub fn with_transaction<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.begin()?;
        match f() {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback() {
                    tracing::warn!(error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }

    // ==================== Events ====================

    /// Append an event to the log.
    pub fn insert_event(&self, event: &Event) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO events (
                    id, user_id, event_type, occurred_at, created_at,
                    session_id, path_id, node_id, activity_id, data
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    event.id.to_string(),
                    event.user_id.to_string(),
                    event.event_type.as_str(),
                    fmt_ts(event.occurred_at),
                    fmt_ts(event.created_at),
                    event.session_id,
                    event.path_id.map(|p| p.to_string()),
                    event.node_id.map(|n| n.to_string()),
                    event.activity_id.map(|a| a.to_string()),
                    serde_json::to_string(&event.data).unwrap_or_else(|_| "{}".to_string()),
                ],
            )?;
            Ok(())
        })
    }

    /// Events strictly after the cursor, in `(created_at, id)` order.
    pub fn events_after_cursor(
        &self,
        user_id: UserId,
        after: Option<(DateTime<Utc>, EventId)>,
        limit: u32,
    ) -> Result<Vec<Event>> {
        self.with_conn(|conn| {
            let mut out = Vec::new();
            let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<Event> {
                let data_text: String = row.get(9)?;
                Ok(Event {
                    id: parse_uuid(0, &row.get::<_, String>(0)?)?,
                    user_id: parse_uuid(1, &row.get::<_, String>(1)?)?,
                    event_type: EventType::parse(&row.get::<_, String>(2)?),
                    occurred_at: parse_ts(3, &row.get::<_, String>(3)?)?,
                    created_at: parse_ts(4, &row.get::<_, String>(4)?)?,
                    session_id: row.get(5)?,
                    path_id: parse_opt_uuid(6, row.get(6)?)?,
                    node_id: parse_opt_uuid(7, row.get(7)?)?,
                    activity_id: parse_opt_uuid(8, row.get(8)?)?,
                    data: parse_json(9, &data_text)?,
                })
            };
            const COLS: &str = "id, user_id, event_type, occurred_at, created_at,
                 session_id, path_id, node_id, activity_id, data";
            match after {
                Some((at, id)) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {COLS} FROM events
                         WHERE user_id = ?1
                           AND (created_at > ?2 OR (created_at = ?2 AND id > ?3))
                         ORDER BY created_at, id LIMIT ?4"
                    ))?;
                    let rows = stmt.query_map(
                        params![user_id.to_string(), fmt_ts(at), id.to_string(), limit],
                        map_row,
                    )?;
                    for row in rows {
                        out.push(row?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {COLS} FROM events
                         WHERE user_id = ?1
                         ORDER BY created_at, id LIMIT ?2"
                    ))?;
                    let rows = stmt.query_map(params![user_id.to_string(), limit], map_row)?;
                    for row in rows {
                        out.push(row?);
                    }
                }
            }
            Ok(out)
        })
    }

    // ==================== Event cursors ====================

    /// The cursor for a consumer, when one exists.
    pub fn get_cursor(
        &self,
        user_id: UserId,
        consumer: &str,
    ) -> Result<Option<(DateTime<Utc>, EventId)>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT last_created_at, last_event_id FROM event_cursors
                 WHERE user_id = ?1 AND consumer = ?2",
                params![user_id.to_string(), consumer],
                |row| {
                    Ok((
                        parse_ts(0, &row.get::<_, String>(0)?)?,
                        parse_uuid(1, &row.get::<_, String>(1)?)?,
                    ))
                },
            )
            .optional()
        })
    }

    /// Advance the cursor.
    pub fn upsert_cursor(
        &self,
        user_id: UserId,
        consumer: &str,
        last_created_at: DateTime<Utc>,
        last_event_id: EventId,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO event_cursors (user_id, consumer, last_created_at, last_event_id)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (user_id, consumer) DO UPDATE SET
                     last_created_at = excluded.last_created_at,
                     last_event_id = excluded.last_event_id",
                params![
                    user_id.to_string(),
                    consumer,
                    fmt_ts(last_created_at),
                    last_event_id.to_string()
                ],
            )?;
            Ok(())
        })
    }

    // ==================== Runs ====================

    /// Load a path run.
    pub fn get_path_run(&self, user_id: UserId, path_id: PathId) -> Result<Option<PathRun>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT state, active_node_id, active_activity_id, runtime, updated_at
                 FROM path_runs WHERE user_id = ?1 AND path_id = ?2",
                params![user_id.to_string(), path_id.to_string()],
                |row| {
                    Ok(PathRun {
                        user_id,
                        path_id,
                        state: parse_enum::<PathRunState>(0, &row.get::<_, String>(0)?)?,
                        active_node_id: parse_opt_uuid(1, row.get(1)?)?,
                        active_activity_id: parse_opt_uuid(2, row.get(2)?)?,
                        runtime: parse_json(3, &row.get::<_, String>(3)?)?,
                        updated_at: parse_ts(4, &row.get::<_, String>(4)?)?,
                    })
                },
            )
            .optional()
        })
    }

    /// Insert or replace a path run.
    pub fn upsert_path_run(&self, run: &PathRun) -> Result<()> {
        let runtime = serde_json::to_string(&run.runtime)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO path_runs (
                    user_id, path_id, state, active_node_id, active_activity_id,
                    runtime, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (user_id, path_id) DO UPDATE SET
                     state = excluded.state,
                     active_node_id = excluded.active_node_id,
                     active_activity_id = excluded.active_activity_id,
                     runtime = excluded.runtime,
                     updated_at = excluded.updated_at",
                params![
                    run.user_id.to_string(),
                    run.path_id.to_string(),
                    enum_text(&run.state),
                    run.active_node_id.map(|n| n.to_string()),
                    run.active_activity_id.map(|a| a.to_string()),
                    runtime,
                    fmt_ts(run.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    /// The user's most recently updated path run, if any.
    pub fn latest_path_run(&self, user_id: UserId) -> Result<Option<PathRun>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT path_id, state, active_node_id, active_activity_id, runtime, updated_at
                 FROM path_runs WHERE user_id = ?1
                 ORDER BY updated_at DESC LIMIT 1",
                params![user_id.to_string()],
                |row| {
                    Ok(PathRun {
                        user_id,
                        path_id: parse_uuid(0, &row.get::<_, String>(0)?)?,
                        state: parse_enum::<PathRunState>(1, &row.get::<_, String>(1)?)?,
                        active_node_id: parse_opt_uuid(2, row.get(2)?)?,
                        active_activity_id: parse_opt_uuid(3, row.get(3)?)?,
                        runtime: parse_json(4, &row.get::<_, String>(4)?)?,
                        updated_at: parse_ts(5, &row.get::<_, String>(5)?)?,
                    })
                },
            )
            .optional()
        })
    }

    /// Load a node run.
    pub fn get_node_run(&self, user_id: UserId, node_id: NodeId) -> Result<Option<NodeRun>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT state, attempt_count, last_score, started_at, completed_at,
                        last_seen_at, runtime, updated_at
                 FROM node_runs WHERE user_id = ?1 AND node_id = ?2",
                params![user_id.to_string(), node_id.to_string()],
                |row| {
                    Ok(NodeRun {
                        user_id,
                        node_id,
                        state: parse_enum::<NodeRunState>(0, &row.get::<_, String>(0)?)?,
                        attempt_count: row.get(1)?,
                        last_score: row.get(2)?,
                        started_at: parse_opt_ts(3, row.get(3)?)?,
                        completed_at: parse_opt_ts(4, row.get(4)?)?,
                        last_seen_at: parse_opt_ts(5, row.get(5)?)?,
                        runtime: parse_json(6, &row.get::<_, String>(6)?)?,
                        updated_at: parse_ts(7, &row.get::<_, String>(7)?)?,
                    })
                },
            )
            .optional()
        })
    }

    /// Insert or replace a node run.
    pub fn upsert_node_run(&self, run: &NodeRun) -> Result<()> {
        let runtime = serde_json::to_string(&run.runtime)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO node_runs (
                    user_id, node_id, state, attempt_count, last_score,
                    started_at, completed_at, last_seen_at, runtime, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT (user_id, node_id) DO UPDATE SET
                     state = excluded.state,
                     attempt_count = excluded.attempt_count,
                     last_score = excluded.last_score,
                     started_at = excluded.started_at,
                     completed_at = excluded.completed_at,
                     last_seen_at = excluded.last_seen_at,
                     runtime = excluded.runtime,
                     updated_at = excluded.updated_at",
                params![
                    run.user_id.to_string(),
                    run.node_id.to_string(),
                    enum_text(&run.state),
                    run.attempt_count,
                    run.last_score,
                    run.started_at.map(fmt_ts),
                    run.completed_at.map(fmt_ts),
                    run.last_seen_at.map(fmt_ts),
                    runtime,
                    fmt_ts(run.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    /// Load an activity run.
    pub fn get_activity_run(
        &self,
        user_id: UserId,
        activity_id: ActivityId,
    ) -> Result<Option<ActivityRun>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT state, attempts, last_score, last_attempt_at, completed_at, updated_at
                 FROM activity_runs WHERE user_id = ?1 AND activity_id = ?2",
                params![user_id.to_string(), activity_id.to_string()],
                |row| {
                    Ok(ActivityRun {
                        user_id,
                        activity_id,
                        state: parse_enum::<ActivityRunState>(0, &row.get::<_, String>(0)?)?,
                        attempts: row.get(1)?,
                        last_score: row.get(2)?,
                        last_attempt_at: parse_opt_ts(3, row.get(3)?)?,
                        completed_at: parse_opt_ts(4, row.get(4)?)?,
                        updated_at: parse_ts(5, &row.get::<_, String>(5)?)?,
                    })
                },
            )
            .optional()
        })
    }

    /// Insert or replace an activity run.
    pub fn upsert_activity_run(&self, run: &ActivityRun) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO activity_runs (
                    user_id, activity_id, state, attempts, last_score,
                    last_attempt_at, completed_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (user_id, activity_id) DO UPDATE SET
                     state = excluded.state,
                     attempts = excluded.attempts,
                     last_score = excluded.last_score,
                     last_attempt_at = excluded.last_attempt_at,
                     completed_at = excluded.completed_at,
                     updated_at = excluded.updated_at",
                params![
                    run.user_id.to_string(),
                    run.activity_id.to_string(),
                    enum_text(&run.state),
                    run.attempts,
                    run.last_score,
                    run.last_attempt_at.map(fmt_ts),
                    run.completed_at.map(fmt_ts),
                    fmt_ts(run.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    // ==================== Transitions ====================

    /// Whether a transition already exists for the event.
    pub fn transition_exists(&self, user_id: UserId, event_id: EventId) -> Result<bool> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT 1 FROM path_run_transitions WHERE user_id = ?1 AND event_id = ?2",
                params![user_id.to_string(), event_id.to_string()],
                |_| Ok(()),
            )
            .optional()
            .map(|found| found.is_some())
        })
    }

    /// Insert the idempotency transition row.
    pub fn insert_transition(&self, transition: &PathRunTransition) -> Result<()> {
        let payload = serde_json::to_string(&transition.payload)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO path_run_transitions (
                    user_id, event_id, path_id, event_type, from_state, to_state,
                    occurred_at, payload
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    transition.user_id.to_string(),
                    transition.event_id.to_string(),
                    transition.path_id.to_string(),
                    transition.event_type.as_str(),
                    enum_text(&transition.from_state),
                    enum_text(&transition.to_state),
                    fmt_ts(transition.occurred_at),
                    payload,
                ],
            )?;
            Ok(())
        })
    }

    /// Count of transition rows for a user. Test and ops helper.
    pub fn count_transitions(&self, user_id: UserId) -> Result<u32> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM path_run_transitions WHERE user_id = ?1",
                params![user_id.to_string()],
                |row| row.get(0),
            )
        })
    }

    // ==================== Catalog ====================

    /// Insert or replace a path.
    pub fn upsert_path(&self, path: &Path) -> Result<()> {
        let plan = serde_json::to_string(&path.runtime_plan)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO paths (id, status, material_set_id, runtime_plan)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (id) DO UPDATE SET
                     status = excluded.status,
                     material_set_id = excluded.material_set_id,
                     runtime_plan = excluded.runtime_plan",
                params![
                    path.id.to_string(),
                    enum_text(&path.status),
                    path.material_set_id,
                    plan,
                ],
            )?;
            Ok(())
        })
    }

    /// Load a path.
    pub fn get_path(&self, path_id: PathId) -> Result<Option<Path>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT status, material_set_id, runtime_plan FROM paths WHERE id = ?1",
                params![path_id.to_string()],
                |row| {
                    Ok(Path {
                        id: path_id,
                        status: parse_enum::<PathStatus>(0, &row.get::<_, String>(0)?)?,
                        material_set_id: row.get(1)?,
                        runtime_plan: parse_json::<RuntimePlan>(2, &row.get::<_, String>(2)?)?,
                    })
                },
            )
            .optional()
        })
    }

    /// Insert or replace a path node.
    pub fn upsert_path_node(&self, node: &PathNode) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO path_nodes (id, path_id, position, title)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (id) DO UPDATE SET
                     path_id = excluded.path_id,
                     position = excluded.position,
                     title = excluded.title",
                params![
                    node.id.to_string(),
                    node.path_id.to_string(),
                    node.position,
                    node.title,
                ],
            )?;
            Ok(())
        })
    }

    /// Load a path node.
    pub fn get_path_node(&self, node_id: NodeId) -> Result<Option<PathNode>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT path_id, position, title FROM path_nodes WHERE id = ?1",
                params![node_id.to_string()],
                |row| {
                    Ok(PathNode {
                        id: node_id,
                        path_id: parse_uuid(0, &row.get::<_, String>(0)?)?,
                        position: row.get(1)?,
                        title: row.get(2)?,
                    })
                },
            )
            .optional()
        })
    }

    /// All nodes of a path, ordered by position.
    pub fn path_nodes_by_path(&self, path_id: PathId) -> Result<Vec<PathNode>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, position, title FROM path_nodes
                 WHERE path_id = ?1 ORDER BY position",
            )?;
            let rows = stmt.query_map(params![path_id.to_string()], |row| {
                Ok(PathNode {
                    id: parse_uuid(0, &row.get::<_, String>(0)?)?,
                    path_id,
                    position: row.get(1)?,
                    title: row.get(2)?,
                })
            })?;
            rows.collect()
        })
    }

    /// Insert or replace a node activity.
    pub fn upsert_node_activity(&self, activity: &NodeActivity) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO node_activities (id, node_id, path_id)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (id) DO UPDATE SET
                     node_id = excluded.node_id,
                     path_id = excluded.path_id",
                params![
                    activity.id.to_string(),
                    activity.node_id.to_string(),
                    activity.path_id.to_string(),
                ],
            )?;
            Ok(())
        })
    }

    /// Resolve an activity to its node and path.
    pub fn get_node_activity(&self, activity_id: ActivityId) -> Result<Option<NodeActivity>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT node_id, path_id FROM node_activities WHERE id = ?1",
                params![activity_id.to_string()],
                |row| {
                    Ok(NodeActivity {
                        id: activity_id,
                        node_id: parse_uuid(0, &row.get::<_, String>(0)?)?,
                        path_id: parse_uuid(1, &row.get::<_, String>(1)?)?,
                    })
                },
            )
            .optional()
        })
    }

    /// Insert or replace a node document.
    pub fn upsert_node_document(&self, document: &NodeDocument) -> Result<()> {
        let doc = serde_json::to_string(document)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO node_documents (node_id, doc) VALUES (?1, ?2)
                 ON CONFLICT (node_id) DO UPDATE SET doc = excluded.doc",
                params![document.node_id.to_string(), doc],
            )?;
            Ok(())
        })
    }

    /// Load a node document.
    pub fn get_node_document(&self, node_id: NodeId) -> Result<Option<NodeDocument>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT doc FROM node_documents WHERE node_id = ?1",
                params![node_id.to_string()],
                |row| parse_json::<NodeDocument>(0, &row.get::<_, String>(0)?),
            )
            .optional()
        })
    }

    /// Whether a node document exists.
    pub fn node_document_exists(&self, node_id: NodeId) -> Result<bool> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT 1 FROM node_documents WHERE node_id = ?1",
                params![node_id.to_string()],
                |_| Ok(()),
            )
            .optional()
            .map(|found| found.is_some())
        })
    }

    // ==================== Concepts ====================

    /// Insert or replace a concept.
    pub fn upsert_concept(&self, concept: &Concept) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO concepts (id, key, scope_id, canonical_concept_id)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (id) DO UPDATE SET
                     key = excluded.key,
                     scope_id = excluded.scope_id,
                     canonical_concept_id = excluded.canonical_concept_id",
                params![
                    concept.id.to_string(),
                    concept.key,
                    concept.scope_id.to_string(),
                    concept.canonical_concept_id.map(|c| c.to_string()),
                ],
            )?;
            Ok(())
        })
    }

    fn map_concept(row: &rusqlite::Row<'_>) -> rusqlite::Result<Concept> {
        Ok(Concept {
            id: parse_uuid(0, &row.get::<_, String>(0)?)?,
            key: row.get(1)?,
            scope_id: parse_uuid(2, &row.get::<_, String>(2)?)?,
            canonical_concept_id: parse_opt_uuid(3, row.get(3)?)?,
        })
    }

    /// Concepts in a path scope matching the given keys.
    pub fn concepts_by_scope_and_keys(
        &self,
        scope_id: PathId,
        keys: &[String],
    ) -> Result<Vec<Concept>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT id, key, scope_id, canonical_concept_id FROM concepts
                 WHERE scope_id = ? AND key IN ({})",
                placeholders(keys.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut bind: Vec<String> = vec![scope_id.to_string()];
            bind.extend(keys.iter().cloned());
            let rows = stmt.query_map(params_from_iter(bind), Self::map_concept)?;
            rows.collect()
        })
    }

    /// Concepts by id.
    pub fn concepts_by_ids(&self, ids: &[ConceptId]) -> Result<Vec<Concept>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT id, key, scope_id, canonical_concept_id FROM concepts
                 WHERE id IN ({})",
                placeholders(ids.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let bind: Vec<String> = ids.iter().map(|i| i.to_string()).collect();
            let rows = stmt.query_map(params_from_iter(bind), Self::map_concept)?;
            rows.collect()
        })
    }

    /// Insert or replace a concept edge.
    pub fn upsert_concept_edge(&self, edge: &ConceptEdge) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO concept_edges (from_concept_id, to_concept_id, edge_type, strength)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (from_concept_id, to_concept_id, edge_type) DO UPDATE SET
                     strength = excluded.strength",
                params![
                    edge.from_concept_id.to_string(),
                    edge.to_concept_id.to_string(),
                    enum_text(&edge.edge_type),
                    edge.strength,
                ],
            )?;
            Ok(())
        })
    }

    /// Edges pointing at any of the given concepts.
    pub fn concept_edges_by_to_ids(&self, ids: &[ConceptId]) -> Result<Vec<ConceptEdge>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT from_concept_id, to_concept_id, edge_type, strength
                 FROM concept_edges WHERE to_concept_id IN ({})",
                placeholders(ids.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let bind: Vec<String> = ids.iter().map(|i| i.to_string()).collect();
            let rows = stmt.query_map(params_from_iter(bind), |row| {
                Ok(ConceptEdge {
                    from_concept_id: parse_uuid(0, &row.get::<_, String>(0)?)?,
                    to_concept_id: parse_uuid(1, &row.get::<_, String>(1)?)?,
                    edge_type: parse_enum::<EdgeType>(2, &row.get::<_, String>(2)?)?,
                    strength: row.get(3)?,
                })
            })?;
            rows.collect()
        })
    }

    /// Insert or replace a concept state.
    pub fn upsert_concept_state(&self, state: &ConceptState) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO concept_states (
                    user_id, concept_id, mastery, confidence,
                    epistemic_uncertainty, aleatoric_uncertainty,
                    half_life_days, last_seen_at, next_review_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT (user_id, concept_id) DO UPDATE SET
                     mastery = excluded.mastery,
                     confidence = excluded.confidence,
                     epistemic_uncertainty = excluded.epistemic_uncertainty,
                     aleatoric_uncertainty = excluded.aleatoric_uncertainty,
                     half_life_days = excluded.half_life_days,
                     last_seen_at = excluded.last_seen_at,
                     next_review_at = excluded.next_review_at",
                params![
                    state.user_id.to_string(),
                    state.concept_id.to_string(),
                    state.mastery,
                    state.confidence,
                    state.epistemic_uncertainty,
                    state.aleatoric_uncertainty,
                    state.half_life_days,
                    state.last_seen_at.map(fmt_ts),
                    state.next_review_at.map(fmt_ts),
                ],
            )?;
            Ok(())
        })
    }

    /// Concept states for a user over the given concepts.
    pub fn concept_states(
        &self,
        user_id: UserId,
        ids: &[ConceptId],
    ) -> Result<Vec<ConceptState>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT concept_id, mastery, confidence, epistemic_uncertainty,
                        aleatoric_uncertainty, half_life_days, last_seen_at, next_review_at
                 FROM concept_states WHERE user_id = ? AND concept_id IN ({})",
                placeholders(ids.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut bind: Vec<String> = vec![user_id.to_string()];
            bind.extend(ids.iter().map(|i| i.to_string()));
            let rows = stmt.query_map(params_from_iter(bind), |row| {
                Ok(ConceptState {
                    user_id,
                    concept_id: parse_uuid(0, &row.get::<_, String>(0)?)?,
                    mastery: row.get(1)?,
                    confidence: row.get(2)?,
                    epistemic_uncertainty: row.get(3)?,
                    aleatoric_uncertainty: row.get(4)?,
                    half_life_days: row.get(5)?,
                    last_seen_at: parse_opt_ts(6, row.get(6)?)?,
                    next_review_at: parse_opt_ts(7, row.get(7)?)?,
                })
            })?;
            rows.collect()
        })
    }

    // ==================== Misconceptions ====================

    /// Insert or replace a misconception instance.
    pub fn upsert_misconception(&self, instance: &MisconceptionInstance) -> Result<()> {
        let support = serde_json::to_string(&instance.support)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO misconceptions (
                    user_id, canonical_concept_id, status, confidence, pattern_id, support
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (user_id, canonical_concept_id) DO UPDATE SET
                     status = excluded.status,
                     confidence = excluded.confidence,
                     pattern_id = excluded.pattern_id,
                     support = excluded.support",
                params![
                    instance.user_id.to_string(),
                    instance.canonical_concept_id.to_string(),
                    enum_text(&instance.status),
                    instance.confidence,
                    instance.pattern_id,
                    support,
                ],
            )?;
            Ok(())
        })
    }

    /// Misconceptions still requiring attention (active or relapsed) for
    /// the given concepts.
    pub fn active_misconceptions(
        &self,
        user_id: UserId,
        ids: &[ConceptId],
    ) -> Result<Vec<MisconceptionInstance>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT canonical_concept_id, status, confidence, pattern_id, support
                 FROM misconceptions
                 WHERE user_id = ? AND status IN ('active', 'relapsed', 'resolving')
                   AND canonical_concept_id IN ({})",
                placeholders(ids.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut bind: Vec<String> = vec![user_id.to_string()];
            bind.extend(ids.iter().map(|i| i.to_string()));
            let rows = stmt.query_map(params_from_iter(bind), |row| {
                Ok(MisconceptionInstance {
                    user_id,
                    canonical_concept_id: parse_uuid(0, &row.get::<_, String>(0)?)?,
                    status: parse_enum::<MisconceptionStatus>(1, &row.get::<_, String>(1)?)?,
                    confidence: row.get(2)?,
                    pattern_id: row.get(3)?,
                    support: parse_json::<MisconceptionSupport>(4, &row.get::<_, String>(4)?)?,
                })
            })?;
            rows.collect()
        })
    }

    /// Every tracked misconception for the given concepts, regardless of
    /// status. The resolver needs resolved instances to detect relapse.
    pub fn tracked_misconceptions(
        &self,
        user_id: UserId,
        ids: &[ConceptId],
    ) -> Result<Vec<MisconceptionInstance>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT canonical_concept_id, status, confidence, pattern_id, support
                 FROM misconceptions
                 WHERE user_id = ? AND canonical_concept_id IN ({})",
                placeholders(ids.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut bind: Vec<String> = vec![user_id.to_string()];
            bind.extend(ids.iter().map(|i| i.to_string()));
            let rows = stmt.query_map(params_from_iter(bind), |row| {
                Ok(MisconceptionInstance {
                    user_id,
                    canonical_concept_id: parse_uuid(0, &row.get::<_, String>(0)?)?,
                    status: parse_enum::<MisconceptionStatus>(1, &row.get::<_, String>(1)?)?,
                    confidence: row.get(2)?,
                    pattern_id: row.get(3)?,
                    support: parse_json::<MisconceptionSupport>(4, &row.get::<_, String>(4)?)?,
                })
            })?;
            rows.collect()
        })
    }

    /// Insert or replace a resolution track.
    pub fn upsert_resolution_state(&self, state: &MisconceptionResolutionState) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO misconception_resolutions (
                    user_id, concept_id, status, correct_count, required_correct,
                    incorrect_count, last_correct_at, last_incorrect_at,
                    resolved_at, relapsed_at, next_review_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT (user_id, concept_id) DO UPDATE SET
                     status = excluded.status,
                     correct_count = excluded.correct_count,
                     required_correct = excluded.required_correct,
                     incorrect_count = excluded.incorrect_count,
                     last_correct_at = excluded.last_correct_at,
                     last_incorrect_at = excluded.last_incorrect_at,
                     resolved_at = excluded.resolved_at,
                     relapsed_at = excluded.relapsed_at,
                     next_review_at = excluded.next_review_at",
                params![
                    state.user_id.to_string(),
                    state.concept_id.to_string(),
                    enum_text(&state.status),
                    state.correct_count,
                    state.required_correct,
                    state.incorrect_count,
                    state.last_correct_at.map(fmt_ts),
                    state.last_incorrect_at.map(fmt_ts),
                    state.resolved_at.map(fmt_ts),
                    state.relapsed_at.map(fmt_ts),
                    state.next_review_at.map(fmt_ts),
                ],
            )?;
            Ok(())
        })
    }

    /// Resolution tracks for a user over the given concepts.
    pub fn resolution_states(
        &self,
        user_id: UserId,
        ids: &[ConceptId],
    ) -> Result<Vec<MisconceptionResolutionState>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT concept_id, status, correct_count, required_correct, incorrect_count,
                        last_correct_at, last_incorrect_at, resolved_at, relapsed_at,
                        next_review_at
                 FROM misconception_resolutions
                 WHERE user_id = ? AND concept_id IN ({})",
                placeholders(ids.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut bind: Vec<String> = vec![user_id.to_string()];
            bind.extend(ids.iter().map(|i| i.to_string()));
            let rows = stmt.query_map(params_from_iter(bind), |row| {
                Ok(MisconceptionResolutionState {
                    user_id,
                    concept_id: parse_uuid(0, &row.get::<_, String>(0)?)?,
                    status: parse_enum::<ResolutionStatus>(1, &row.get::<_, String>(1)?)?,
                    correct_count: row.get(2)?,
                    required_correct: row.get(3)?,
                    incorrect_count: row.get(4)?,
                    last_correct_at: parse_opt_ts(5, row.get(5)?)?,
                    last_incorrect_at: parse_opt_ts(6, row.get(6)?)?,
                    resolved_at: parse_opt_ts(7, row.get(7)?)?,
                    relapsed_at: parse_opt_ts(8, row.get(8)?)?,
                    next_review_at: parse_opt_ts(9, row.get(9)?)?,
                })
            })?;
            rows.collect()
        })
    }

    // ==================== Decision traces ====================

    /// Insert a decision trace.
    pub fn insert_decision_trace(&self, trace: &DecisionTrace) -> Result<()> {
        let inputs = serde_json::to_string(&trace.inputs)?;
        let candidates = serde_json::to_string(&trace.candidates)?;
        let chosen = serde_json::to_string(&trace.chosen)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO decision_traces (
                    id, user_id, occurred_at, decision_type, path_id,
                    inputs, candidates, chosen
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    trace.id.to_string(),
                    trace.user_id.to_string(),
                    fmt_ts(trace.occurred_at),
                    trace.decision_type,
                    trace.path_id.to_string(),
                    inputs,
                    candidates,
                    chosen,
                ],
            )?;
            Ok(())
        })
    }

    /// Load a decision trace.
    pub fn get_decision_trace(&self, trace_id: TraceId) -> Result<Option<DecisionTrace>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT user_id, occurred_at, decision_type, path_id, inputs, candidates, chosen
                 FROM decision_traces WHERE id = ?1",
                params![trace_id.to_string()],
                |row| {
                    Ok(DecisionTrace {
                        id: trace_id,
                        user_id: parse_uuid(0, &row.get::<_, String>(0)?)?,
                        occurred_at: parse_ts(1, &row.get::<_, String>(1)?)?,
                        decision_type: row.get(2)?,
                        path_id: parse_uuid(3, &row.get::<_, String>(3)?)?,
                        inputs: parse_json(4, &row.get::<_, String>(4)?)?,
                        candidates: parse_json(5, &row.get::<_, String>(5)?)?,
                        chosen: parse_json(6, &row.get::<_, String>(6)?)?,
                    })
                },
            )
            .optional()
        })
    }

    /// Load several decision traces at once. Missing ids are omitted.
    pub fn decision_traces_by_ids(&self, ids: &[TraceId]) -> Result<Vec<DecisionTrace>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT id, user_id, occurred_at, decision_type, path_id,
                        inputs, candidates, chosen
                 FROM decision_traces WHERE id IN ({})",
                placeholders(ids.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let bind: Vec<String> = ids.iter().map(|i| i.to_string()).collect();
            let rows = stmt.query_map(params_from_iter(bind), |row| {
                Ok(DecisionTrace {
                    id: parse_uuid(0, &row.get::<_, String>(0)?)?,
                    user_id: parse_uuid(1, &row.get::<_, String>(1)?)?,
                    occurred_at: parse_ts(2, &row.get::<_, String>(2)?)?,
                    decision_type: row.get(3)?,
                    path_id: parse_uuid(4, &row.get::<_, String>(4)?)?,
                    inputs: parse_json(5, &row.get::<_, String>(5)?)?,
                    candidates: parse_json(6, &row.get::<_, String>(6)?)?,
                    chosen: parse_json(7, &row.get::<_, String>(7)?)?,
                })
            })?;
            rows.collect()
        })
    }

    /// Merge an outcome into a trace's `chosen` record. Returns whether
    /// the record advanced; closed outcomes never reopen.
    pub fn update_chosen(&self, trace_id: TraceId, update: &ChosenUpdate) -> Result<bool> {
        let chosen_text: Option<String> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT chosen FROM decision_traces WHERE id = ?1",
                params![trace_id.to_string()],
                |row| row.get(0),
            )
            .optional()
        })?;
        let Some(chosen_text) = chosen_text else {
            return Ok(false);
        };
        let mut chosen: ChosenTrace = serde_json::from_str(&chosen_text)?;
        if !update.apply_to(&mut chosen) {
            return Ok(false);
        }
        let updated = serde_json::to_string(&chosen)?;
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE decision_traces SET chosen = ?1 WHERE id = ?2",
                params![updated, trace_id.to_string()],
            )?;
            Ok(())
        })?;
        Ok(true)
    }

    // ==================== Policy snapshots ====================

    /// Insert or replace a model snapshot version.
    pub fn upsert_model_snapshot(&self, snapshot: &ModelSnapshot) -> Result<()> {
        let params_json = serde_json::to_string(&snapshot.params)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO model_snapshots (key, version, active, params)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (key, version) DO UPDATE SET
                     active = excluded.active,
                     params = excluded.params",
                params![
                    snapshot.key,
                    snapshot.version,
                    snapshot.active as i32,
                    params_json,
                ],
            )?;
            Ok(())
        })
    }

    /// The most recent `limit` snapshots for a key, newest first.
    pub fn model_snapshots_by_key(&self, key: &str, limit: u32) -> Result<Vec<ModelSnapshot>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT version, active, params FROM model_snapshots
                 WHERE key = ?1 ORDER BY version DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![key, limit], |row| {
                Ok(ModelSnapshot {
                    key: key.to_string(),
                    version: row.get(0)?,
                    active: row.get::<_, i32>(1)? != 0,
                    params: parse_json::<ModelParams>(2, &row.get::<_, String>(2)?)?,
                })
            })?;
            rows.collect()
        })
    }

    /// Record off-policy evaluation metrics.
    pub fn insert_policy_eval(&self, snapshot: &PolicyEvalSnapshot) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO policy_eval_snapshots (key, samples, ips, lift)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    snapshot.key,
                    snapshot.samples as i64,
                    snapshot.ips,
                    snapshot.lift
                ],
            )?;
            Ok(())
        })
    }

    /// The latest evaluation metrics for a key.
    pub fn latest_policy_eval(&self, key: &str) -> Result<Option<PolicyEvalSnapshot>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT samples, ips, lift FROM policy_eval_snapshots
                 WHERE key = ?1 ORDER BY id DESC LIMIT 1",
                params![key],
                |row| {
                    Ok(PolicyEvalSnapshot {
                        key: key.to_string(),
                        samples: row.get::<_, i64>(0)? as u64,
                        ips: row.get(1)?,
                        lift: row.get(2)?,
                    })
                },
            )
            .optional()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::PathRuntimeState;
    use chrono::Duration;

    fn store() -> SqliteRuntimeStore {
        SqliteRuntimeStore::in_memory().unwrap()
    }

    #[test]
    fn test_event_paging_order_and_cursor() {
        let s = store();
        let user = UserId::new();
        let base = Utc::now();
        let mut ids = Vec::new();
        for i in 0..5 {
            let event = Event::new(user, EventType::BlockRead, base + Duration::seconds(i));
            ids.push(event.id);
            s.insert_event(&event).unwrap();
        }
        // An event for someone else never shows up
        s.insert_event(&Event::new(UserId::new(), EventType::BlockRead, base))
            .unwrap();

        let first = s.events_after_cursor(user, None, 3).unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(first[0].id, ids[0]);

        let last = first.last().unwrap();
        s.upsert_cursor(user, "runtime_update", last.created_at, last.id)
            .unwrap();
        let cursor = s.get_cursor(user, "runtime_update").unwrap().unwrap();
        let rest = s.events_after_cursor(user, Some(cursor), 10).unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].id, ids[3]);
    }

    #[test]
    fn test_same_timestamp_events_tiebreak_on_id() {
        let s = store();
        let user = UserId::new();
        let now = Utc::now();
        for _ in 0..4 {
            s.insert_event(&Event::new(user, EventType::BlockViewed, now))
                .unwrap();
        }
        let all = s.events_after_cursor(user, None, 10).unwrap();
        assert_eq!(all.len(), 4);
        let cursor = (all[1].created_at, all[1].id);
        let rest = s.events_after_cursor(user, Some(cursor), 10).unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].id, all[2].id);
    }

    #[test]
    fn test_path_run_round_trip() {
        let s = store();
        let user = UserId::new();
        let path = PathId::new();
        let now = Utc::now();
        let mut run = PathRun::not_started(user, path, now);
        run.state = PathRunState::InNode;
        run.runtime = PathRuntimeState {
            prompts_in_window: 2,
            session_started_at: Some(now),
            ..PathRuntimeState::default()
        };
        s.upsert_path_run(&run).unwrap();
        let loaded = s.get_path_run(user, path).unwrap().unwrap();
        assert_eq!(loaded.state, PathRunState::InNode);
        assert_eq!(loaded.runtime.prompts_in_window, 2);

        // Upsert overwrites
        run.state = PathRunState::Paused;
        s.upsert_path_run(&run).unwrap();
        assert_eq!(
            s.get_path_run(user, path).unwrap().unwrap().state,
            PathRunState::Paused
        );
    }

    #[test]
    fn test_transition_idempotency_key() {
        let s = store();
        let user = UserId::new();
        let event_id = EventId::new();
        let transition = PathRunTransition {
            user_id: user,
            event_id,
            path_id: PathId::new(),
            event_type: EventType::NodeOpened,
            from_state: PathRunState::NotStarted,
            to_state: PathRunState::InNode,
            occurred_at: Utc::now(),
            payload: Default::default(),
        };
        assert!(!s.transition_exists(user, event_id).unwrap());
        s.insert_transition(&transition).unwrap();
        assert!(s.transition_exists(user, event_id).unwrap());
        // Double insert violates the primary key
        assert!(s.insert_transition(&transition).is_err());
    }

    #[test]
    fn test_concept_queries() {
        let s = store();
        let path = PathId::new();
        let c1 = Concept {
            id: ConceptId::new(),
            key: "c1".to_string(),
            scope_id: path,
            canonical_concept_id: None,
        };
        let c2 = Concept {
            id: ConceptId::new(),
            key: "c2".to_string(),
            scope_id: path,
            canonical_concept_id: None,
        };
        s.upsert_concept(&c1).unwrap();
        s.upsert_concept(&c2).unwrap();

        let found = s
            .concepts_by_scope_and_keys(path, &["c1".to_string(), "missing".to_string()])
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key, "c1");

        s.upsert_concept_edge(&ConceptEdge {
            from_concept_id: c2.id,
            to_concept_id: c1.id,
            edge_type: EdgeType::Prereq,
            strength: 0.8,
        })
        .unwrap();
        let edges = s.concept_edges_by_to_ids(&[c1.id]).unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].from_concept_id, c2.id);
    }

    #[test]
    fn test_misconception_active_filter() {
        let s = store();
        let user = UserId::new();
        let concept = ConceptId::new();
        let mut instance = MisconceptionInstance::new(user, concept, 0.9);
        s.upsert_misconception(&instance).unwrap();
        assert_eq!(s.active_misconceptions(user, &[concept]).unwrap().len(), 1);

        instance.status = MisconceptionStatus::Resolved;
        s.upsert_misconception(&instance).unwrap();
        assert!(s.active_misconceptions(user, &[concept]).unwrap().is_empty());
    }

    #[test]
    fn test_model_snapshot_ordering() {
        let s = store();
        for version in 1..=3 {
            s.upsert_model_snapshot(&ModelSnapshot {
                key: "runtime_prompt".to_string(),
                version,
                active: version == 2,
                params: ModelParams::default(),
            })
            .unwrap();
        }
        let snapshots = s.model_snapshots_by_key("runtime_prompt", 10).unwrap();
        assert_eq!(snapshots.len(), 3);
        assert_eq!(snapshots[0].version, 3);
        assert!(snapshots[1].active);
    }

    #[test]
    fn test_policy_eval_latest() {
        let s = store();
        for samples in [10u64, 20, 30] {
            s.insert_policy_eval(&PolicyEvalSnapshot {
                key: "runtime_prompt".to_string(),
                samples,
                ips: 1.0,
                lift: 0.1,
            })
            .unwrap();
        }
        let latest = s.latest_policy_eval("runtime_prompt").unwrap().unwrap();
        assert_eq!(latest.samples, 30);
    }

    #[test]
    fn test_transaction_rollback_discards_writes() {
        let s = store();
        let user = UserId::new();
        let path = PathId::new();
        let now = Utc::now();
        let result: Result<()> = s.with_transaction(|| {
            s.upsert_path_run(&PathRun::not_started(user, path, now))?;
            Err(Error::apply("boom"))
        });
        assert!(result.is_err());
        assert!(s.get_path_run(user, path).unwrap().is_none());
    }

    #[test]
    fn test_open_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("runtime.db");
        let path_id = PathId::new();
        {
            let s = SqliteRuntimeStore::open(&db_path).unwrap();
            s.upsert_path(&Path::new(path_id)).unwrap();
        }
        let s = SqliteRuntimeStore::open(&db_path).unwrap();
        assert!(s.get_path(path_id).unwrap().is_some());
    }

    #[test]
    fn test_transaction_commit_persists() {
        let s = store();
        let user = UserId::new();
        let path = PathId::new();
        let now = Utc::now();
        s.with_transaction(|| s.upsert_path_run(&PathRun::not_started(user, path, now)))
            .unwrap();
        assert!(s.get_path_run(user, path).unwrap().is_some());
    }
}
