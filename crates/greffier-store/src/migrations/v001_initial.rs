//! v001 -- Initial schema creation.
//!
//! Creates the three core tables: `meetings`, `meeting_keys`, and
//! `revisions`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Meetings
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS meetings (
    id               TEXT PRIMARY KEY NOT NULL,  -- provider bot id
    user_id          TEXT NOT NULL,
    created_at       INTEGER NOT NULL,           -- epoch ms
    process_state    TEXT NOT NULL,
    updated_at       INTEGER NOT NULL,           -- epoch ms, bumped on every transition
    duration_seconds INTEGER,
    file_paths       TEXT NOT NULL DEFAULT '{}', -- JSON: artifact kind -> vault path
    active_version   INTEGER
);

CREATE INDEX IF NOT EXISTS idx_meetings_user
    ON meetings(user_id, created_at DESC);

-- ----------------------------------------------------------------
-- Meeting keys (wrapped; at most one per meeting)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS meeting_keys (
    meeting_id  TEXT PRIMARY KEY NOT NULL,       -- FK -> meetings(id)
    file_iv     TEXT NOT NULL,                   -- 16 bytes, hex
    wrapped_key TEXT NOT NULL,                   -- "<wrapper_iv_hex>:<ciphertext_hex>"
    auth_tag    TEXT NOT NULL,                   -- 16-byte GCM tag, hex

    FOREIGN KEY (meeting_id) REFERENCES meetings(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Revisions (append-only audit log)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS revisions (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    meeting_id   TEXT NOT NULL,                  -- FK -> meetings(id)
    version      INTEGER NOT NULL,
    kind         TEXT NOT NULL,                  -- 'transcript' | 'summary'
    content_hash TEXT NOT NULL,                  -- SHA-256 hex
    file_path    TEXT NOT NULL,                  -- vault path of the snapshot
    created_at   TEXT NOT NULL,                  -- ISO-8601 / RFC-3339

    UNIQUE (meeting_id, kind, version),
    FOREIGN KEY (meeting_id) REFERENCES meetings(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_revisions_hash ON revisions(content_hash);
CREATE INDEX IF NOT EXISTS idx_revisions_meeting
    ON revisions(meeting_id, kind, version DESC);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
