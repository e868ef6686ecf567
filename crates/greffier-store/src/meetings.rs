use std::collections::HashMap;

use chrono::Utc;
use rusqlite::params;

use greffier_shared::ProcessState;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Meeting;

const MEETING_COLUMNS: &str =
    "id, user_id, created_at, process_state, updated_at, duration_seconds, file_paths, active_version";

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl Database {
    /// Insert a fresh meeting in state `initializing`.
    pub fn create_meeting(&self, user_id: &str, bot_id: &str) -> Result<Meeting> {
        let now = now_ms();
        self.conn().execute(
            "INSERT INTO meetings (id, user_id, created_at, process_state, updated_at, file_paths)
             VALUES (?1, ?2, ?3, ?4, ?5, '{}')",
            params![
                bot_id,
                user_id,
                now,
                ProcessState::Initializing.as_str(),
                now,
            ],
        )?;
        self.get_meeting(bot_id)
    }

    pub fn get_meeting(&self, id: &str) -> Result<Meeting> {
        self.conn()
            .query_row(
                &format!("SELECT {MEETING_COLUMNS} FROM meetings WHERE id = ?1"),
                params![id],
                row_to_meeting,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    pub fn list_meetings_by_user(&self, user_id: &str) -> Result<Vec<Meeting>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MEETING_COLUMNS} FROM meetings WHERE user_id = ?1 ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map(params![user_id], row_to_meeting)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// Partial update: always rewrites the state and bumps `updated_at`;
    /// artifact paths and duration only when supplied.
    pub fn update_process_state(
        &self,
        id: &str,
        state: ProcessState,
        artifact_paths: Option<&HashMap<String, String>>,
        duration_seconds: Option<i64>,
    ) -> Result<()> {
        let affected = match (artifact_paths, duration_seconds) {
            (Some(paths), Some(duration)) => self.conn().execute(
                "UPDATE meetings
                 SET process_state = ?2, updated_at = ?3, file_paths = ?4, duration_seconds = ?5
                 WHERE id = ?1",
                params![
                    id,
                    state.as_str(),
                    now_ms(),
                    serde_json::to_string(paths)?,
                    duration,
                ],
            )?,
            (Some(paths), None) => self.conn().execute(
                "UPDATE meetings SET process_state = ?2, updated_at = ?3, file_paths = ?4
                 WHERE id = ?1",
                params![id, state.as_str(), now_ms(), serde_json::to_string(paths)?],
            )?,
            (None, Some(duration)) => self.conn().execute(
                "UPDATE meetings
                 SET process_state = ?2, updated_at = ?3, duration_seconds = ?4
                 WHERE id = ?1",
                params![id, state.as_str(), now_ms(), duration],
            )?,
            (None, None) => self.conn().execute(
                "UPDATE meetings SET process_state = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, state.as_str(), now_ms()],
            )?,
        };
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Compare-and-swap state transition.
    ///
    /// Returns `true` iff this caller observed `from` and moved the meeting
    /// to `to`. Concurrent pollers racing on `audio_ready` both call this;
    /// exactly one wins and dispatches the download.
    pub fn try_transition(&self, id: &str, from: ProcessState, to: ProcessState) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE meetings SET process_state = ?3, updated_at = ?4
             WHERE id = ?1 AND process_state = ?2",
            params![id, from.as_str(), to.as_str(), now_ms()],
        )?;
        Ok(affected > 0)
    }

    /// Point the UI at a revision version without touching state.
    pub fn set_active_version(&self, id: &str, version: i64) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE meetings SET active_version = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, version, now_ms()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Rewrite the meeting's head pointers to the snapshot paths registered
    /// at `version`. Paths for kinds with no revision at that version (the
    /// audio blob in particular) are preserved. Does not create a revision.
    pub fn checkout_version(&self, meeting_id: &str, version: i64) -> Result<()> {
        let meeting = self.get_meeting(meeting_id)?;

        let mut stmt = self.conn().prepare(
            "SELECT kind, file_path FROM revisions WHERE meeting_id = ?1 AND version = ?2",
        )?;
        let snapshots: Vec<(String, String)> = stmt
            .query_map(params![meeting_id, version], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if snapshots.is_empty() {
            return Err(StoreError::NotFound);
        }

        let mut file_paths = meeting.file_paths;
        for (kind, path) in snapshots {
            file_paths.insert(kind, path);
        }

        let affected = self.conn().execute(
            "UPDATE meetings SET file_paths = ?2, active_version = ?3, updated_at = ?4
             WHERE id = ?1",
            params![
                meeting_id,
                serde_json::to_string(&file_paths)?,
                version,
                now_ms(),
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Cascading delete: key record first, then revisions, then the meeting
    /// row, in one transaction. Once the key row is gone the vault blobs are
    /// unrecoverable regardless of whether their unlink succeeds.
    pub fn delete_meeting(&mut self, id: &str) -> Result<bool> {
        let tx = self.conn_mut().transaction()?;
        tx.execute("DELETE FROM meeting_keys WHERE meeting_id = ?1", params![id])?;
        tx.execute("DELETE FROM revisions WHERE meeting_id = ?1", params![id])?;
        let affected = tx.execute("DELETE FROM meetings WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(affected > 0)
    }
}

fn row_to_meeting(row: &rusqlite::Row<'_>) -> rusqlite::Result<Meeting> {
    let id: String = row.get(0)?;
    let user_id: String = row.get(1)?;
    let created_at: i64 = row.get(2)?;
    let state_str: String = row.get(3)?;
    let updated_at: i64 = row.get(4)?;
    let duration_seconds: Option<i64> = row.get(5)?;
    let paths_json: String = row.get(6)?;
    let active_version: Option<i64> = row.get(7)?;

    let process_state = ProcessState::parse(&state_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown process state '{state_str}'").into(),
        )
    })?;

    let file_paths: HashMap<String, String> = serde_json::from_str(&paths_json)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Meeting {
        id,
        user_id,
        created_at,
        process_state,
        updated_at,
        duration_seconds,
        file_paths,
        active_version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (Database, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db"), &[0x11u8; 32]).unwrap();
        (db, dir)
    }

    #[test]
    fn create_and_get() {
        let (db, _dir) = test_db();
        let meeting = db.create_meeting("user-a", "bot-1").unwrap();

        assert_eq!(meeting.id, "bot-1");
        assert_eq!(meeting.user_id, "user-a");
        assert_eq!(meeting.process_state, ProcessState::Initializing);
        assert!(meeting.file_paths.is_empty());
        assert!(meeting.duration_seconds.is_none());
    }

    #[test]
    fn get_missing_is_not_found() {
        let (db, _dir) = test_db();
        assert!(matches!(db.get_meeting("nope"), Err(StoreError::NotFound)));
    }

    #[test]
    fn list_is_per_user_newest_first() {
        let (db, _dir) = test_db();
        db.create_meeting("user-a", "bot-1").unwrap();
        db.create_meeting("user-b", "bot-2").unwrap();
        db.create_meeting("user-a", "bot-3").unwrap();

        let meetings = db.list_meetings_by_user("user-a").unwrap();
        assert_eq!(meetings.len(), 2);
        assert!(meetings.iter().all(|m| m.user_id == "user-a"));
    }

    #[test]
    fn partial_update_bumps_timestamp() {
        let (db, _dir) = test_db();
        let before = db.create_meeting("user-a", "bot-1").unwrap();

        let mut paths = HashMap::new();
        paths.insert("audio".to_string(), "audio/bot-1.enc".to_string());
        db.update_process_state("bot-1", ProcessState::Downloaded, Some(&paths), None)
            .unwrap();

        let after = db.get_meeting("bot-1").unwrap();
        assert_eq!(after.process_state, ProcessState::Downloaded);
        assert_eq!(after.file_paths.get("audio").unwrap(), "audio/bot-1.enc");
        assert!(after.updated_at >= before.updated_at);
        // Duration untouched by a partial update.
        assert!(after.duration_seconds.is_none());
    }

    #[test]
    fn cas_transition_single_winner() {
        let (db, _dir) = test_db();
        db.create_meeting("user-a", "bot-1").unwrap();

        let first = db
            .try_transition("bot-1", ProcessState::Initializing, ProcessState::Downloading)
            .unwrap();
        let second = db
            .try_transition("bot-1", ProcessState::Initializing, ProcessState::Downloading)
            .unwrap();

        assert!(first);
        assert!(!second);
        assert_eq!(
            db.get_meeting("bot-1").unwrap().process_state,
            ProcessState::Downloading
        );
    }

    #[test]
    fn delete_meeting_removes_row() {
        let (mut db, _dir) = test_db();
        db.create_meeting("user-a", "bot-1").unwrap();

        assert!(db.delete_meeting("bot-1").unwrap());
        assert!(matches!(db.get_meeting("bot-1"), Err(StoreError::NotFound)));
        assert!(!db.delete_meeting("bot-1").unwrap());
    }
}
