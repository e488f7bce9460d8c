//! SQLite schema and migrations for the runtime store.

use rusqlite::{Connection, Result as SqliteResult};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema.
pub fn initialize_schema(conn: &Connection) -> SqliteResult<()> {
    // WAL keeps readers unblocked while a page transaction commits
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        apply_v1_schema(conn)?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version) VALUES (1)",
            [],
        )?;
    }

    Ok(())
}

/// Whether the schema has been initialized.
pub fn is_initialized(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT name FROM sqlite_master WHERE type='table' AND name='schema_version'",
        [],
        |_| Ok(()),
    )
    .is_ok()
}

/// Apply version 1 schema.
fn apply_v1_schema(conn: &Connection) -> SqliteResult<()> {
    // Append-only event log
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            occurred_at TEXT NOT NULL,
            created_at TEXT NOT NULL,
            session_id TEXT,
            path_id TEXT,
            node_id TEXT,
            activity_id TEXT,
            data TEXT NOT NULL DEFAULT '{}'
        )",
        [],
    )?;

    // Per-(user, consumer) high-water mark into the event log
    conn.execute(
        "CREATE TABLE IF NOT EXISTS event_cursors (
            user_id TEXT NOT NULL,
            consumer TEXT NOT NULL,
            last_created_at TEXT NOT NULL,
            last_event_id TEXT NOT NULL,
            PRIMARY KEY (user_id, consumer)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS path_runs (
            user_id TEXT NOT NULL,
            path_id TEXT NOT NULL,
            state TEXT NOT NULL,
            active_node_id TEXT,
            active_activity_id TEXT,
            runtime TEXT NOT NULL DEFAULT '{}',
            updated_at TEXT NOT NULL,
            PRIMARY KEY (user_id, path_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS node_runs (
            user_id TEXT NOT NULL,
            node_id TEXT NOT NULL,
            state TEXT NOT NULL,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            last_score REAL,
            started_at TEXT,
            completed_at TEXT,
            last_seen_at TEXT,
            runtime TEXT NOT NULL DEFAULT '{}',
            updated_at TEXT NOT NULL,
            PRIMARY KEY (user_id, node_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS activity_runs (
            user_id TEXT NOT NULL,
            activity_id TEXT NOT NULL,
            state TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_score REAL,
            last_attempt_at TEXT,
            completed_at TEXT,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (user_id, activity_id)
        )",
        [],
    )?;

    // The idempotency ledger: one row per processed event
    conn.execute(
        "CREATE TABLE IF NOT EXISTS path_run_transitions (
            user_id TEXT NOT NULL,
            event_id TEXT NOT NULL,
            path_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            from_state TEXT NOT NULL,
            to_state TEXT NOT NULL,
            occurred_at TEXT NOT NULL,
            payload TEXT NOT NULL DEFAULT '{}',
            PRIMARY KEY (user_id, event_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS paths (
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            material_set_id TEXT,
            runtime_plan TEXT NOT NULL DEFAULT '{}'
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS path_nodes (
            id TEXT PRIMARY KEY,
            path_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            title TEXT NOT NULL DEFAULT ''
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS node_activities (
            id TEXT PRIMARY KEY,
            node_id TEXT NOT NULL,
            path_id TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS node_documents (
            node_id TEXT PRIMARY KEY,
            doc TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS concepts (
            id TEXT PRIMARY KEY,
            key TEXT NOT NULL,
            scope_id TEXT NOT NULL,
            canonical_concept_id TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS concept_edges (
            from_concept_id TEXT NOT NULL,
            to_concept_id TEXT NOT NULL,
            edge_type TEXT NOT NULL,
            strength REAL NOT NULL,
            PRIMARY KEY (from_concept_id, to_concept_id, edge_type)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS concept_states (
            user_id TEXT NOT NULL,
            concept_id TEXT NOT NULL,
            mastery REAL NOT NULL,
            confidence REAL NOT NULL,
            epistemic_uncertainty REAL NOT NULL DEFAULT 0,
            aleatoric_uncertainty REAL NOT NULL DEFAULT 0,
            half_life_days REAL,
            last_seen_at TEXT,
            next_review_at TEXT,
            PRIMARY KEY (user_id, concept_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS misconceptions (
            user_id TEXT NOT NULL,
            canonical_concept_id TEXT NOT NULL,
            status TEXT NOT NULL,
            confidence REAL NOT NULL,
            pattern_id TEXT,
            support TEXT NOT NULL DEFAULT '{}',
            PRIMARY KEY (user_id, canonical_concept_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS misconception_resolutions (
            user_id TEXT NOT NULL,
            concept_id TEXT NOT NULL,
            status TEXT NOT NULL,
            correct_count INTEGER NOT NULL DEFAULT 0,
            required_correct INTEGER NOT NULL,
            incorrect_count INTEGER NOT NULL DEFAULT 0,
            last_correct_at TEXT,
            last_incorrect_at TEXT,
            resolved_at TEXT,
            relapsed_at TEXT,
            next_review_at TEXT,
            PRIMARY KEY (user_id, concept_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS decision_traces (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            occurred_at TEXT NOT NULL,
            decision_type TEXT NOT NULL,
            path_id TEXT NOT NULL,
            inputs TEXT NOT NULL,
            candidates TEXT NOT NULL,
            chosen TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS model_snapshots (
            key TEXT NOT NULL,
            version INTEGER NOT NULL,
            active INTEGER NOT NULL DEFAULT 0,
            params TEXT NOT NULL,
            PRIMARY KEY (key, version)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS policy_eval_snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            key TEXT NOT NULL,
            samples INTEGER NOT NULL,
            ips REAL NOT NULL,
            lift REAL NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    // Indexes for the hot paths
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_user_order
         ON events(user_id, created_at, id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_path_nodes_path
         ON path_nodes(path_id, position)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_concepts_scope_key
         ON concepts(scope_id, key)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_concept_edges_to
         ON concept_edges(to_concept_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_traces_user
         ON decision_traces(user_id, occurred_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_policy_eval_key
         ON policy_eval_snapshots(key, id)",
        [],
    )?;

    Ok(())
}
