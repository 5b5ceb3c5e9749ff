use rusqlite::Connection;

use crate::Result;

// Schema version (increment when changing table definitions)
pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<()> {
    let current_version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if current_version != 0 && current_version != SCHEMA_VERSION {
        drop_all_tables(conn)?;
    }

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS nodes (
            id TEXT PRIMARY KEY,
            version INTEGER NOT NULL,
            node_type TEXT NOT NULL,
            project TEXT NOT NULL,
            language TEXT,
            outcome TEXT NOT NULL,
            summary TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            session_file TEXT NOT NULL,
            segment_boundary TEXT NOT NULL,
            prompt_version TEXT NOT NULL,
            needs_review INTEGER NOT NULL DEFAULT 0,
            tokens_input INTEGER,
            tokens_output INTEGER,
            cost_usd REAL,
            json_path TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE VIRTUAL TABLE IF NOT EXISTS nodes_fts USING fts5(
            id UNINDEXED,
            body
        );

        CREATE TABLE IF NOT EXISTS embeddings (
            node_id TEXT PRIMARY KEY,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            vector BLOB NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (node_id) REFERENCES nodes(id)
        );

        CREATE TABLE IF NOT EXISTS edges (
            source TEXT NOT NULL,
            target TEXT NOT NULL,
            kind TEXT NOT NULL,
            weight REAL NOT NULL,
            evidence TEXT,
            node_version INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            PRIMARY KEY (source, target, kind)
        );

        CREATE TABLE IF NOT EXISTS jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            session_file TEXT,
            segment_boundary TEXT,
            state TEXT NOT NULL DEFAULT 'pending',
            worker_id TEXT,
            lease_expires_at TEXT,
            not_before TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            error_category TEXT,
            prompt_version TEXT,
            enqueued_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_unique_open
            ON jobs(kind, ifnull(session_file, ''), ifnull(segment_boundary, ''))
            WHERE state IN ('pending', 'leased');

        CREATE TABLE IF NOT EXISTS prompt_versions (
            label TEXT PRIMARY KEY,
            seq INTEGER NOT NULL,
            content_hash TEXT NOT NULL UNIQUE,
            archived_path TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS insights (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            insight_type TEXT NOT NULL,
            model TEXT,
            tool TEXT,
            pattern TEXT NOT NULL,
            frequency INTEGER NOT NULL DEFAULT 1,
            confidence REAL NOT NULL DEFAULT 0,
            severity REAL NOT NULL DEFAULT 0,
            examples TEXT NOT NULL DEFAULT '[]',
            prompt_text TEXT,
            prompt_included INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_insights_unique
            ON insights(insight_type, ifnull(model, ''), ifnull(tool, ''), pattern);

        CREATE TABLE IF NOT EXISTS insight_effectiveness (
            insight_id INTEGER NOT NULL,
            recorded_at TEXT NOT NULL,
            score REAL NOT NULL,
            FOREIGN KEY (insight_id) REFERENCES insights(id)
        );

        CREATE TABLE IF NOT EXISTS decisions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            decision TEXT NOT NULL,
            reasoning TEXT NOT NULL,
            source_project TEXT,
            user_feedback TEXT
        );

        CREATE TABLE IF NOT EXISTS clusters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            label TEXT NOT NULL,
            node_ids TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS connection_runs (
            node_id TEXT PRIMARY KEY,
            last_run_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_nodes_project ON nodes(project);
        CREATE INDEX IF NOT EXISTS idx_nodes_ts ON nodes(timestamp DESC);
        CREATE INDEX IF NOT EXISTS idx_nodes_session ON nodes(session_file);
        CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state, enqueued_at);
        CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(source);
        CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target);
        "#,
    )?;

    conn.execute(&format!("PRAGMA user_version = {}", SCHEMA_VERSION), [])?;

    Ok(())
}

fn drop_all_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        DROP TABLE IF EXISTS insight_effectiveness;
        DROP TABLE IF EXISTS insights;
        DROP TABLE IF EXISTS decisions;
        DROP TABLE IF EXISTS clusters;
        DROP TABLE IF EXISTS connection_runs;
        DROP TABLE IF EXISTS prompt_versions;
        DROP TABLE IF EXISTS jobs;
        DROP TABLE IF EXISTS edges;
        DROP TABLE IF EXISTS embeddings;
        DROP TABLE IF EXISTS nodes_fts;
        DROP TABLE IF EXISTS nodes;
        "#,
    )?;
    Ok(())
}
