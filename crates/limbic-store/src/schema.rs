use rusqlite::Connection;

use crate::error::Result;

pub const SCHEMA_VERSION: i64 = 2;

/// Default lock wait when the caller does not configure one.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

pub fn initialize(conn: &Connection) -> Result<()> {
    initialize_with(conn, DEFAULT_BUSY_TIMEOUT_MS)
}

pub fn initialize_with(conn: &Connection, busy_timeout_ms: u64) -> Result<()> {
    configure(conn, busy_timeout_ms)?;

    // Fold any WAL left behind by a crashed process back into the main file.
    // In-memory databases fail this harmlessly.
    if conn
        .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
        .is_ok()
    {
        tracing::info!("startup WAL checkpoint complete");
    }

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS memory_nodes (
            id              TEXT PRIMARY KEY,
            timestamp_ms    INTEGER NOT NULL,
            layer           TEXT NOT NULL,
            text            TEXT NOT NULL DEFAULT '',
            summary         TEXT NOT NULL DEFAULT '',
            speaker         TEXT NOT NULL DEFAULT '',
            affect          TEXT,
            turn_id         TEXT NOT NULL,
            identity        TEXT NOT NULL DEFAULT '',
            conversation_id TEXT,
            session_id      TEXT,
            novelty_score   REAL NOT NULL DEFAULT 0.5,
            UNIQUE (turn_id, layer)
        );

        CREATE TABLE IF NOT EXISTS memory_edges (
            source   TEXT NOT NULL REFERENCES memory_nodes(id),
            target   TEXT NOT NULL REFERENCES memory_nodes(id),
            relation TEXT NOT NULL,
            weight   REAL NOT NULL DEFAULT 1.0,
            PRIMARY KEY (source, target, relation)
        );

        CREATE TABLE IF NOT EXISTS memory_turns (
            turn_id           TEXT PRIMARY KEY,
            input_node        TEXT NOT NULL REFERENCES memory_nodes(id),
            deliberation_node TEXT REFERENCES memory_nodes(id),
            output_node       TEXT NOT NULL REFERENCES memory_nodes(id),
            timestamp_ms      INTEGER NOT NULL,
            affect            TEXT,
            novelty_score     REAL NOT NULL DEFAULT 0.5,
            identity          TEXT NOT NULL DEFAULT '',
            conversation_id   TEXT
        );

        CREATE TABLE IF NOT EXISTS memory_embeddings (
            turn_id TEXT PRIMARY KEY REFERENCES memory_turns(turn_id),
            model   TEXT NOT NULL,
            dims    INTEGER NOT NULL,
            vector  BLOB NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_nodes_turn ON memory_nodes(turn_id);
        CREATE INDEX IF NOT EXISTS idx_nodes_timestamp ON memory_nodes(timestamp_ms);
        CREATE INDEX IF NOT EXISTS idx_nodes_conversation ON memory_nodes(conversation_id);
        CREATE INDEX IF NOT EXISTS idx_edges_target ON memory_edges(target);
        CREATE INDEX IF NOT EXISTS idx_turns_timestamp ON memory_turns(timestamp_ms);
        ",
    )?;

    // v1 databases predate session scoping
    if conn
        .prepare("SELECT session_id FROM memory_nodes LIMIT 0")
        .is_err()
    {
        conn.execute_batch("ALTER TABLE memory_nodes ADD COLUMN session_id TEXT;")?;
    }

    create_fts(conn)?;

    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

/// Connection-level pragmas. Safe on read-only handles; creates nothing.
pub fn configure(conn: &Connection, busy_timeout_ms: u64) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.pragma_update(None, "busy_timeout", busy_timeout_ms as i64)?;
    // ~400KB WAL between automatic checkpoints
    conn.pragma_update(None, "wal_autocheckpoint", 100)?;
    Ok(())
}

/// External-content FTS5 index over node text and summary. The triggers keep
/// it in the same transaction as every node insert, update and delete.
fn create_fts(conn: &Connection) -> Result<()> {
    let existed = fts_enabled(conn)?;
    conn.execute_batch(
        "
        CREATE VIRTUAL TABLE IF NOT EXISTS memory_fts USING fts5(
            text,
            summary,
            content='memory_nodes',
            content_rowid='rowid'
        );

        CREATE TRIGGER IF NOT EXISTS memory_nodes_ai AFTER INSERT ON memory_nodes BEGIN
            INSERT INTO memory_fts(rowid, text, summary)
            VALUES (new.rowid, new.text, new.summary);
        END;

        CREATE TRIGGER IF NOT EXISTS memory_nodes_ad AFTER DELETE ON memory_nodes BEGIN
            INSERT INTO memory_fts(memory_fts, rowid, text, summary)
            VALUES ('delete', old.rowid, old.text, old.summary);
        END;

        CREATE TRIGGER IF NOT EXISTS memory_nodes_au AFTER UPDATE ON memory_nodes BEGIN
            INSERT INTO memory_fts(memory_fts, rowid, text, summary)
            VALUES ('delete', old.rowid, old.text, old.summary);
            INSERT INTO memory_fts(rowid, text, summary)
            VALUES (new.rowid, new.text, new.summary);
        END;
        ",
    )?;

    // Nodes written before the index existed
    if !existed {
        let nodes: i64 = conn.query_row("SELECT COUNT(*) FROM memory_nodes", [], |row| row.get(0))?;
        if nodes > 0 {
            conn.execute_batch("INSERT INTO memory_fts(memory_fts) VALUES ('rebuild');")?;
            tracing::info!(nodes, "rebuilt full-text index");
        }
    }
    Ok(())
}

pub fn fts_enabled(conn: &Connection) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'memory_fts'",
        [],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn get_schema_version(conn: &Connection) -> Result<Option<i64>> {
    let mut stmt = conn.prepare("SELECT value FROM metadata WHERE key = 'schema_version'")?;
    let version = stmt
        .query_row([], |row| {
            let v: String = row.get(0)?;
            Ok(v.parse::<i64>().unwrap_or(0))
        })
        .ok();
    Ok(version)
}
