//! Filesystem-backed spool queue (§4.D): a bounded FIFO of fetched WAL
//! segments plus `.ok` / `.error` status markers, swept by a
//! preserve-or-evict policy keyed on the current ideal queue.

use crate::error::{ArchiveError, ErrorCode};
use crate::pack::{PackReader, PackWriter};
use crate::segment::WalSegment;
use crate::storage::{move_cross_fs, ListOptions, LocalFsStorage, ReadOptions, RepositoryStorage, SortOrder, WriteOptions};
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::Path;
use tokio::io::AsyncReadExt;

const SPOOL_SUBDIR: &str = "archive/in";
const GLOBAL_ERROR_NAME: &str = "global.error";

fn segment_path(name: &str) -> String {
    format!("{SPOOL_SUBDIR}/{name}")
}

fn ok_marker_path(name: &str) -> String {
    format!("{SPOOL_SUBDIR}/{name}.ok")
}

fn error_marker_path(name: &str) -> String {
    format!("{SPOOL_SUBDIR}/{name}.error")
}

fn global_error_path() -> String {
    format!("{SPOOL_SUBDIR}/{GLOBAL_ERROR_NAME}")
}

/// Outcome of consulting the spool for one segment (§4.G `CHECK` state).
#[derive(Debug, Clone)]
pub enum SpoolStatus {
    /// The segment file itself is present and ready to deliver.
    Present,
    /// Checked absent by a prior async run; zero or more soft warnings.
    Ok { warnings: Vec<String> },
    /// A prior async run hit an error fetching this segment specifically.
    Error(ArchiveError),
}

pub struct SpoolQueue {
    storage: LocalFsStorage,
}

impl SpoolQueue {
    pub fn new(spool_root: impl Into<std::path::PathBuf>) -> Self {
        SpoolQueue {
            storage: LocalFsStorage::new(spool_root),
        }
    }

    /// Gives [`crate::archive_get`] direct access to stage a segment file
    /// (as opposed to a status marker, which this module writes itself).
    pub fn storage(&self) -> &LocalFsStorage {
        &self.storage
    }

    /// Consults `<spool>/archive/in` for `seg`: the segment file, an `.ok`
    /// marker, or an `.error` marker, in that preference order (I2: at most
    /// one of the three exists at steady state, so order only matters
    /// during the narrow window a worker is actively writing).
    pub async fn check(&self, seg: WalSegment) -> Result<Option<SpoolStatus>> {
        let name = seg.to_string();
        if self.storage.exists(&segment_path(&name)).await? {
            return Ok(Some(SpoolStatus::Present));
        }
        if let Some(mut r) = self.storage.new_read(&ok_marker_path(&name), ReadOptions::default()).await? {
            let mut bytes = Vec::new();
            r.read_to_end(&mut bytes).await.context("reading .ok marker")?;
            let mut pr = PackReader::new(&bytes);
            let warnings = pr.read_string_array(1).unwrap_or_default();
            return Ok(Some(SpoolStatus::Ok { warnings }));
        }
        if let Some(mut r) = self.storage.new_read(&error_marker_path(&name), ReadOptions::default()).await? {
            let mut bytes = Vec::new();
            r.read_to_end(&mut bytes).await.context("reading .error marker")?;
            let mut pr = PackReader::new(&bytes);
            let err = ArchiveError::read_pack(&mut pr).context("decoding .error marker")?;
            return Ok(Some(SpoolStatus::Error(err)));
        }
        Ok(None)
    }

    pub async fn read_global_error(&self) -> Result<Option<ArchiveError>> {
        match self.storage.new_read(&global_error_path(), ReadOptions::default()).await? {
            None => Ok(None),
            Some(mut r) => {
                let mut bytes = Vec::new();
                r.read_to_end(&mut bytes).await.context("reading global.error marker")?;
                let mut pr = PackReader::new(&bytes);
                Ok(Some(ArchiveError::read_pack(&mut pr).context("decoding global.error marker")?))
            }
        }
    }

    pub async fn clear_error(&self, seg: WalSegment) -> Result<()> {
        self.storage.remove(&error_marker_path(&seg.to_string()), false).await
    }

    /// Writes the `.ok` marker, removing any stale `.error` for the same
    /// segment first (I2: the two are mutually exclusive at steady state).
    pub async fn write_ok(&self, seg: WalSegment, warnings: &[String]) -> Result<()> {
        let name = seg.to_string();
        self.storage.remove(&error_marker_path(&name), false).await?;
        let mut w = PackWriter::new();
        w.write_string_array(1, &warnings.iter().cloned().collect::<Vec<_>>())?;
        self.write_marker(&ok_marker_path(&name), w.into_bytes()).await
    }

    /// Writes the `.error` marker, removing any stale `.ok` first.
    pub async fn write_error(&self, seg: WalSegment, code: i32, message: &str) -> Result<()> {
        let name = seg.to_string();
        self.storage.remove(&ok_marker_path(&name), false).await?;
        let err = ArchiveError::new(ErrorCode::from_i32(code), message);
        self.write_marker(&error_marker_path(&name), err.to_pack_bytes()).await
    }

    pub async fn write_global_error(&self, err: &ArchiveError) -> Result<()> {
        self.write_marker(&global_error_path(), err.to_pack_bytes()).await
    }

    async fn write_marker(&self, path: &str, bytes: Vec<u8>) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        let mut w = self
            .storage
            .new_write(
                path,
                WriteOptions {
                    create_path: true,
                    sync_file: true,
                    sync_path: true,
                    atomic: true,
                    mode_file: 0o640,
                },
            )
            .await?;
        w.write_all(&bytes).await.context("writing marker body")?;
        w.finish().await
    }

    /// Delivers `<spool>/archive/in/<seg>` to `dest`, permitting a
    /// cross-filesystem copy fallback (§4.G `DELIVER`), then removes the
    /// spool entry.
    pub async fn deliver(&self, seg: WalSegment, dest: &Path, spool_root: &Path) -> Result<()> {
        let src = spool_root.join(SPOOL_SUBDIR).join(seg.to_string());
        move_cross_fs(&src, dest).await
    }

    /// Counts bytes currently staged in the spool (segment files only),
    /// used by §4.G's "queue half-full" heuristic.
    pub async fn staged_bytes(&self, segment_size: u64) -> Result<u64> {
        let names = self
            .storage
            .list(
                SPOOL_SUBDIR,
                ListOptions {
                    regex: Some(regex::Regex::new(r"^[0-9A-Fa-f]{24}$").unwrap()),
                    error_on_missing: false,
                    sort_order: SortOrder::Asc,
                },
            )
            .await?;
        Ok(names.len() as u64 * segment_size)
    }

    /// Preserve-or-evict sweep (§4.D, I1): preserves every entry whose base
    /// segment name is a member of `ideal_queue`, deletes everything else —
    /// including stale `.ok`/`.error` markers for segments no longer of
    /// interest. Returns the names evicted, for logging.
    pub async fn preserve_or_evict(&self, ideal_queue: &[WalSegment]) -> Result<Vec<String>> {
        let wanted: HashSet<String> = ideal_queue.iter().map(|s| s.to_string()).collect();
        let entries = self
            .storage
            .list(SPOOL_SUBDIR, ListOptions { regex: None, error_on_missing: false, sort_order: SortOrder::Asc })
            .await?;
        let mut evicted = Vec::new();
        for entry in entries {
            if entry == GLOBAL_ERROR_NAME {
                self.storage.remove(&format!("{SPOOL_SUBDIR}/{entry}"), false).await?;
                evicted.push(entry);
                continue;
            }
            let base = entry.strip_suffix(".ok").or_else(|| entry.strip_suffix(".error")).unwrap_or(&entry);
            if !wanted.contains(base) {
                self.storage.remove(&format!("{SPOOL_SUBDIR}/{entry}"), false).await?;
                evicted.push(entry);
            }
        }
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(n: &str) -> WalSegment {
        WalSegment::parse(n).unwrap()
    }

    #[tokio::test]
    async fn ok_marker_round_trips_with_warnings() {
        let dir = tempfile::tempdir().unwrap();
        let spool = SpoolQueue::new(dir.path());
        let s = seg("000000010000000000000005");
        spool.write_ok(s, &["archive ambiguous".to_string()]).await.unwrap();
        match spool.check(s).await.unwrap().unwrap() {
            SpoolStatus::Ok { warnings } => assert_eq!(warnings, vec!["archive ambiguous".to_string()]),
            other => panic!("expected Ok marker, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn error_marker_clears_stale_ok_and_vice_versa() {
        let dir = tempfile::tempdir().unwrap();
        let spool = SpoolQueue::new(dir.path());
        let s = seg("000000010000000000000009");
        spool.write_ok(s, &[]).await.unwrap();
        spool.write_error(s, 4, "transient failure").await.unwrap();
        match spool.check(s).await.unwrap().unwrap() {
            SpoolStatus::Error(err) => assert_eq!(err.message, "transient failure"),
            other => panic!("expected Error marker, got {other:?}"),
        }
        spool.write_ok(s, &[]).await.unwrap();
        match spool.check(s).await.unwrap().unwrap() {
            SpoolStatus::Ok { .. } => {}
            other => panic!("expected Ok marker after re-check, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn preserve_or_evict_keeps_only_ideal_queue_members() {
        let dir = tempfile::tempdir().unwrap();
        let spool = SpoolQueue::new(dir.path());
        let s05 = seg("000000010000000000000005");
        let s09 = seg("000000010000000000000009");
        spool.write_ok(s05, &[]).await.unwrap();
        spool.write_error(s09, 4, "boom").await.unwrap();

        let ideal = vec![
            seg("000000010000000000000007"),
            seg("000000010000000000000008"),
            s09,
            seg("00000001000000000000000A"),
        ];
        let evicted = spool.preserve_or_evict(&ideal).await.unwrap();
        assert!(evicted.iter().any(|e| e.contains("000000010000000000000005")));
        assert!(spool.check(s05).await.unwrap().is_none());
        assert!(spool.check(s09).await.unwrap().is_some());
    }
}
