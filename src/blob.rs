//! Opaque blob handles and the compressed blob table.
//!
//! Logs, reports, reproducers, patches and configs are written once and
//! referenced by handle from crashes and jobs. Contents are zlib-compressed.

use crate::storage::Storage;
use crate::{Error, Result};
use chrono::Utc;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};

/// Handle to a stored blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobHandle(pub i64);

impl fmt::Display for BlobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blob-{}", self.0)
    }
}

/// What a blob holds. Stored alongside the data for diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    CrashLog,
    CrashReport,
    ReproSyz,
    ReproC,
    MachineInfo,
    Patch,
    KernelConfig,
    JobLog,
    JobError,
}

impl BlobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlobKind::CrashLog => "crash_log",
            BlobKind::CrashReport => "crash_report",
            BlobKind::ReproSyz => "repro_syz",
            BlobKind::ReproC => "repro_c",
            BlobKind::MachineInfo => "machine_info",
            BlobKind::Patch => "patch",
            BlobKind::KernelConfig => "kernel_config",
            BlobKind::JobLog => "job_log",
            BlobKind::JobError => "job_error",
        }
    }
}

/// Write-once storage for opaque byte blobs.
pub trait BlobStore {
    fn put_blob(&self, kind: BlobKind, data: &[u8]) -> Result<BlobHandle>;
    fn get_blob(&self, handle: BlobHandle) -> Result<Vec<u8>>;

    /// Store `data` unless it is empty.
    fn put_optional(&self, kind: BlobKind, data: &[u8]) -> Result<Option<BlobHandle>> {
        if data.is_empty() {
            return Ok(None);
        }
        self.put_blob(kind, data).map(Some)
    }
}

impl BlobStore for Storage {
    fn put_blob(&self, kind: BlobKind, data: &[u8]) -> Result<BlobHandle> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data)?;
        let compressed = encoder.finish()?;
        let size = i64::try_from(data.len())
            .map_err(|_| Error::InvalidInput(format!("{} blob too large", kind.as_str())))?;
        self.conn().execute(
            "INSERT INTO blobs (kind, size, data, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                kind.as_str(),
                size,
                compressed,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(BlobHandle(self.conn().last_insert_rowid()))
    }

    fn get_blob(&self, handle: BlobHandle) -> Result<Vec<u8>> {
        let compressed: Option<Vec<u8>> = self
            .conn()
            .query_row(
                "SELECT data FROM blobs WHERE id = ?1",
                params![handle.0],
                |row| row.get(0),
            )
            .optional()?;
        let compressed =
            compressed.ok_or_else(|| Error::NotFound(format!("{} not found", handle)))?;
        let mut data = Vec::new();
        ZlibDecoder::new(compressed.as_slice()).read_to_end(&mut data)?;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_put_get() {
        let storage = Storage::open_in_memory().unwrap();
        let log = b"BUG: KASAN: use-after-free in foo\n".repeat(50);
        let handle = storage.put_blob(BlobKind::CrashLog, &log).unwrap();
        assert_eq!(storage.get_blob(handle).unwrap(), log);
    }

    #[test]
    fn test_blob_missing_is_not_found() {
        let storage = Storage::open_in_memory().unwrap();
        assert!(matches!(
            storage.get_blob(BlobHandle(42)),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_put_optional_skips_empty() {
        let storage = Storage::open_in_memory().unwrap();
        assert!(storage.put_optional(BlobKind::ReproC, b"").unwrap().is_none());
        assert!(storage.put_optional(BlobKind::ReproC, b"int main(){}").unwrap().is_some());
    }
}
