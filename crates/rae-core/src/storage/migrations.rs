//! Database migrations
//!
//! Schema migration definitions for the SQLite backend.

use rusqlite::Connection;

use crate::error::Result;

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Initial schema: memories, embeddings, FTS5, graph, audit, blobs",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "Staged-consolidation column and decay stamp indexes",
        up: MIGRATION_V2_UP,
    },
];

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// V1: Initial schema
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS memories (
    id TEXT NOT NULL,
    tenant TEXT NOT NULL,
    layer TEXT NOT NULL DEFAULT 'sensory',
    content TEXT NOT NULL,
    tags TEXT NOT NULL DEFAULT '[]',
    source TEXT,
    importance REAL NOT NULL DEFAULT 0.5,
    usage_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    last_accessed_at TEXT NOT NULL,
    info_class TEXT NOT NULL DEFAULT 'internal',
    content_hash TEXT NOT NULL,
    parents TEXT NOT NULL DEFAULT '[]',
    PRIMARY KEY (tenant, id)
);

CREATE INDEX IF NOT EXISTS idx_memories_tenant ON memories(tenant);
CREATE INDEX IF NOT EXISTS idx_memories_tenant_layer ON memories(tenant, layer);
CREATE INDEX IF NOT EXISTS idx_memories_tenant_hash ON memories(tenant, content_hash);
CREATE INDEX IF NOT EXISTS idx_memories_tenant_created ON memories(tenant, created_at);

-- Federated embeddings: one row per (memory, model) projection
CREATE TABLE IF NOT EXISTS memory_embeddings (
    tenant TEXT NOT NULL,
    memory_id TEXT NOT NULL,
    model_name TEXT NOT NULL,
    dim INTEGER NOT NULL,
    vector BLOB NOT NULL,
    content_hash TEXT NOT NULL,
    created_at TEXT NOT NULL,
    stale INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (tenant, memory_id, model_name),
    FOREIGN KEY (tenant, memory_id) REFERENCES memories(tenant, id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_embeddings_model ON memory_embeddings(tenant, model_name);

-- FTS5 virtual table for full-text search
CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    id,
    tenant,
    content,
    tags,
    content='memories',
    content_rowid='rowid'
);

-- Triggers to keep FTS in sync
CREATE TRIGGER IF NOT EXISTS memories_ai AFTER INSERT ON memories BEGIN
    INSERT INTO memories_fts(rowid, id, tenant, content, tags)
    VALUES (NEW.rowid, NEW.id, NEW.tenant, NEW.content, NEW.tags);
END;

CREATE TRIGGER IF NOT EXISTS memories_ad AFTER DELETE ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, id, tenant, content, tags)
    VALUES ('delete', OLD.rowid, OLD.id, OLD.tenant, OLD.content, OLD.tags);
END;

CREATE TRIGGER IF NOT EXISTS memories_au AFTER UPDATE ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, id, tenant, content, tags)
    VALUES ('delete', OLD.rowid, OLD.id, OLD.tenant, OLD.content, OLD.tags);
    INSERT INTO memories_fts(rowid, id, tenant, content, tags)
    VALUES (NEW.rowid, NEW.id, NEW.tenant, NEW.content, NEW.tags);
END;

-- Typed semantic graph
CREATE TABLE IF NOT EXISTS semantic_nodes (
    tenant TEXT NOT NULL,
    id TEXT NOT NULL,
    label TEXT NOT NULL,
    node_type TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (tenant, id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_nodes_tenant_label
    ON semantic_nodes(tenant, lower(label));

CREATE TABLE IF NOT EXISTS graph_edges (
    tenant TEXT NOT NULL,
    id TEXT NOT NULL,
    src TEXT NOT NULL,
    predicate TEXT NOT NULL,
    dst TEXT NOT NULL,
    confidence REAL NOT NULL,
    corroborations INTEGER NOT NULL DEFAULT 1,
    provenance TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (tenant, src, predicate, dst)
);

CREATE INDEX IF NOT EXISTS idx_edges_tenant_src ON graph_edges(tenant, src);
CREATE INDEX IF NOT EXISTS idx_edges_tenant_dst ON graph_edges(tenant, dst);

CREATE TABLE IF NOT EXISTS node_mentions (
    tenant TEXT NOT NULL,
    node_id TEXT NOT NULL,
    record_id TEXT NOT NULL,
    PRIMARY KEY (tenant, node_id, record_id)
);

CREATE INDEX IF NOT EXISTS idx_mentions_record ON node_mentions(tenant, record_id);

-- Append-only audit trail, partitioned by tenant and day
CREATE TABLE IF NOT EXISTS audit_events (
    event_id TEXT PRIMARY KEY,
    tenant TEXT NOT NULL,
    day TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    actor TEXT NOT NULL DEFAULT '',
    request_id TEXT NOT NULL DEFAULT '',
    operation TEXT NOT NULL,
    info_class TEXT,
    outcome TEXT NOT NULL,
    latency_ms INTEGER,
    cost_usd REAL,
    detail TEXT,
    critical INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_audit_tenant_day ON audit_events(tenant, day);
CREATE INDEX IF NOT EXISTS idx_audit_tenant_op ON audit_events(tenant, operation);

-- Large artifacts from summarization and dreaming
CREATE TABLE IF NOT EXISTS blobs (
    tenant TEXT NOT NULL,
    key TEXT NOT NULL,
    bytes BLOB NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (tenant, key)
);

-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, datetime('now'));
"#;

/// V2: staged consolidation outputs, decay stamps, reflection metadata
const MIGRATION_V2_UP: &str = r#"
ALTER TABLE memories ADD COLUMN staged INTEGER NOT NULL DEFAULT 0;
ALTER TABLE memories ADD COLUMN last_decayed_at TEXT;
ALTER TABLE memories ADD COLUMN reflection TEXT;

CREATE INDEX IF NOT EXISTS idx_memories_staged ON memories(tenant, staged);
"#;

/// Apply all pending migrations on the writer connection.
pub fn apply_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
            row.get(0)
        })
        .unwrap_or(0);

    for migration in MIGRATIONS {
        if migration.version > current {
            tracing::debug!(
                version = migration.version,
                description = migration.description,
                "applying migration"
            );
            conn.execute_batch(migration.up)?;
            conn.execute(
                "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (?1, datetime('now'))",
                [migration.version],
            )?;
        }
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_apply_cleanly() {
        let conn = Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();

        let version: u32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, MIGRATIONS.last().unwrap().version);
    }

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();
        apply_migrations(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count as usize, MIGRATIONS.len());
    }

    #[test]
    fn versions_are_strictly_increasing() {
        let mut last = 0;
        for m in MIGRATIONS {
            assert!(m.version > last, "non-monotonic migration version");
            last = m.version;
        }
    }
}
