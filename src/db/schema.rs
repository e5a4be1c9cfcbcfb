/// Pending mutations, one row per queue entry.
pub const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS mutation_queue (
    id TEXT PRIMARY KEY,
    path TEXT NOT NULL,
    method TEXT NOT NULL,
    body TEXT,
    headers TEXT NOT NULL DEFAULT '{}',
    resources TEXT NOT NULL DEFAULT '[]',
    attempts INTEGER NOT NULL DEFAULT 0,
    next_eligible_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_mutation_queue_created
    ON mutation_queue(created_at, id);

-- Rows that could no longer be decoded, kept for inspection.
CREATE TABLE IF NOT EXISTS mutation_queue_dead (
    id TEXT NOT NULL,
    path TEXT NOT NULL,
    method TEXT NOT NULL,
    body TEXT,
    headers TEXT NOT NULL,
    resources TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    next_eligible_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    last_error TEXT,
    reason TEXT NOT NULL,
    moved_at TEXT NOT NULL
);
"#;

/// Revalidation metadata for idempotent reads.
pub const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS http_cache (
    key_hash TEXT PRIMARY KEY,
    request_key TEXT NOT NULL,
    token TEXT,
    payload BLOB NOT NULL,
    cached_at TEXT NOT NULL
);
"#;
