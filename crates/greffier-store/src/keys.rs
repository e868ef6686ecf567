//! Wrapped meeting-key records.
//!
//! The raw 32-byte data key exists in memory only. It is GCM-wrapped under
//! the process master key before insertion and unwrapped on read; deleting
//! the row is the authoritative crypto-shred for everything the key ever
//! encrypted.

use rusqlite::params;

use greffier_shared::crypto::{self, DataKey, FileIv};

use crate::database::Database;
use crate::error::{Result, StoreError};

impl Database {
    /// Wrap and persist the meeting's data key. Upsert by primary key so a
    /// retried ingestion is idempotent.
    pub fn store_meeting_key(&self, meeting_id: &str, raw_key: &DataKey, file_iv: &FileIv) -> Result<()> {
        let wrapped = crypto::wrap_data_key(self.master_key(), raw_key)?;
        self.conn().execute(
            "INSERT OR REPLACE INTO meeting_keys (meeting_id, file_iv, wrapped_key, auth_tag)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                meeting_id,
                hex::encode(file_iv),
                wrapped.payload,
                wrapped.tag,
            ],
        )?;
        Ok(())
    }

    /// Unwrap and return the meeting's (data key, file IV) pair.
    pub fn get_meeting_key(&self, meeting_id: &str) -> Result<(DataKey, FileIv)> {
        let (iv_hex, payload, tag): (String, String, String) = self
            .conn()
            .query_row(
                "SELECT file_iv, wrapped_key, auth_tag FROM meeting_keys WHERE meeting_id = ?1",
                params![meeting_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })?;

        let key = crypto::unwrap_data_key(self.master_key(), &payload, &tag)?;

        let iv_bytes = hex::decode(&iv_hex)?;
        let iv: FileIv = iv_bytes
            .try_into()
            .map_err(|_| greffier_shared::CryptoError::MalformedWrappedKey)
            .map_err(StoreError::KeyUnwrap)?;

        Ok((key, iv))
    }

    pub fn has_meeting_key(&self, meeting_id: &str) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM meeting_keys WHERE meeting_id = ?1",
            params![meeting_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}
