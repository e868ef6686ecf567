use chrono::{DateTime, Utc};
use rusqlite::params;

use greffier_shared::ArtifactKind;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Revision;

const REVISION_COLUMNS: &str =
    "id, meeting_id, version, kind, content_hash, file_path, created_at";

impl Database {
    /// Append one audit entry. Versions are assigned by the caller from
    /// [`latest_version`](Self::latest_version) under the store's
    /// serialization; the UNIQUE constraint backstops a racing writer.
    pub fn add_revision(
        &self,
        meeting_id: &str,
        version: i64,
        content_hash: &str,
        file_path: &str,
        kind: ArtifactKind,
    ) -> Result<Revision> {
        self.conn().execute(
            "INSERT INTO revisions (meeting_id, version, kind, content_hash, file_path, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                meeting_id,
                version,
                kind.as_str(),
                content_hash,
                file_path,
                Utc::now().to_rfc3339(),
            ],
        )?;
        let id = self.conn().last_insert_rowid();
        self.get_revision(id)
    }

    /// Append the transcript and summary rows for one version in a single
    /// transaction. Either both rows land or neither does; a checkout can
    /// never observe a half-written pair.
    pub fn add_revision_pair(
        &mut self,
        meeting_id: &str,
        version: i64,
        transcript_hash: &str,
        transcript_path: &str,
        summary_hash: &str,
        summary_path: &str,
    ) -> Result<()> {
        let created_at = Utc::now().to_rfc3339();
        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "INSERT INTO revisions (meeting_id, version, kind, content_hash, file_path, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                meeting_id,
                version,
                ArtifactKind::Transcript.as_str(),
                transcript_hash,
                transcript_path,
                created_at,
            ],
        )?;
        tx.execute(
            "INSERT INTO revisions (meeting_id, version, kind, content_hash, file_path, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                meeting_id,
                version,
                ArtifactKind::Summary.as_str(),
                summary_hash,
                summary_path,
                created_at,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Highest version for (meeting, kind); 0 when no revision exists yet.
    pub fn latest_version(&self, meeting_id: &str, kind: ArtifactKind) -> Result<i64> {
        let version: i64 = self.conn().query_row(
            "SELECT COALESCE(MAX(version), 0) FROM revisions WHERE meeting_id = ?1 AND kind = ?2",
            params![meeting_id, kind.as_str()],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    pub fn get_revision(&self, id: i64) -> Result<Revision> {
        self.conn()
            .query_row(
                &format!("SELECT {REVISION_COLUMNS} FROM revisions WHERE id = ?1"),
                params![id],
                row_to_revision,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Exact content-hash lookup, backed by `idx_revisions_hash`.
    pub fn find_revision_by_hash(&self, content_hash: &str) -> Result<Option<Revision>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {REVISION_COLUMNS} FROM revisions WHERE content_hash = ?1
             ORDER BY version DESC LIMIT 1"
        ))?;
        let mut rows = stmt.query_map(params![content_hash], row_to_revision)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn list_revisions(&self, meeting_id: &str, kind: ArtifactKind) -> Result<Vec<Revision>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {REVISION_COLUMNS} FROM revisions
             WHERE meeting_id = ?1 AND kind = ?2 ORDER BY version DESC"
        ))?;
        let rows = stmt.query_map(params![meeting_id, kind.as_str()], row_to_revision)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// Every revision of a meeting, both kinds. Used by the fuzzy hash
    /// fallback and by the delete path collecting snapshot files.
    pub fn list_all_revisions(&self, meeting_id: &str) -> Result<Vec<Revision>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {REVISION_COLUMNS} FROM revisions
             WHERE meeting_id = ?1 ORDER BY version DESC"
        ))?;
        let rows = stmt.query_map(params![meeting_id], row_to_revision)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }
}

fn row_to_revision(row: &rusqlite::Row<'_>) -> rusqlite::Result<Revision> {
    let id: i64 = row.get(0)?;
    let meeting_id: String = row.get(1)?;
    let version: i64 = row.get(2)?;
    let kind_str: String = row.get(3)?;
    let content_hash: String = row.get(4)?;
    let file_path: String = row.get(5)?;
    let created_str: String = row.get(6)?;

    let kind = ArtifactKind::parse(&kind_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown artifact kind '{kind_str}'").into(),
        )
    })?;

    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&created_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Revision {
        id,
        meeting_id,
        version,
        kind,
        content_hash,
        file_path,
        created_at,
    })
}
