//! Repository storage capability (§4.C): uniform read/write/list/remove/
//! exists/info over a backend, returning streams that compose with the
//! filter chain in [`crate::io`].
//!
//! Shaped after `bottomless2::storage::Storage` (an async trait over
//! generic read/write, one associated `Config` type, default-able methods)
//! but with the synchronous-feeling method names §4.C specifies. Only
//! `LocalFsStorage` is implemented; cloud object-store drivers are
//! explicitly out of scope (§1) and are "consumed abstractly" through this
//! trait.

use crate::io::BoxAsyncRead;
use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::SystemTime;
use tokio::fs::File;
use tokio::io::{AsyncWrite, BufReader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    File,
    Path,
    Link,
    Special,
}

#[derive(Debug, Clone, Default)]
pub struct NodeInfo {
    pub exists: bool,
    pub node_type: Option<NodeType>,
    pub size: u64,
    pub mtime: Option<SystemTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    pub ignore_missing: bool,
    pub limit: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct WriteOptions {
    pub create_path: bool,
    pub sync_file: bool,
    pub sync_path: bool,
    pub atomic: bool,
    pub mode_file: u32,
}

impl Default for WriteOptions {
    fn default() -> Self {
        WriteOptions {
            create_path: true,
            sync_file: true,
            sync_path: true,
            atomic: true,
            mode_file: 0o640,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListOptions {
    pub regex: Option<Regex>,
    pub error_on_missing: bool,
    pub sort_order: SortOrder,
}

impl Default for ListOptions {
    fn default() -> Self {
        ListOptions {
            regex: None,
            error_on_missing: false,
            sort_order: SortOrder::Asc,
        }
    }
}

/// A write handle that stages content at a `.tmp` sibling and only becomes
/// visible at `path` once [`RepoWriter::finish`] renames it into place
/// (§4.C atomic write; §4.D invariant 2: segment content writes are always
/// atomic + fsynced file + fsynced parent directory).
pub struct RepoWriter {
    file: File,
    tmp_path: Option<PathBuf>,
    final_path: PathBuf,
    sync_file: bool,
    sync_path: bool,
}

impl RepoWriter {
    pub async fn finish(mut self) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        if self.sync_file {
            self.file.sync_all().await.context("fsync staged file")?;
        }
        if let Some(tmp) = self.tmp_path.take() {
            tokio::fs::rename(&tmp, &self.final_path)
                .await
                .with_context(|| format!("rename {} into place", self.final_path.display()))?;
        }
        if self.sync_path {
            if let Some(parent) = self.final_path.parent() {
                if let Ok(dir) = File::open(parent).await {
                    let _ = dir.sync_all().await;
                }
            }
        }
        Ok(())
    }
}

impl AsyncWrite for RepoWriter {
    fn poll_write(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        Pin::new(&mut this.file).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.file).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.file).poll_shutdown(cx)
    }
}

#[async_trait]
pub trait RepositoryStorage: Send + Sync {
    async fn new_read(&self, path: &str, opts: ReadOptions) -> Result<Option<BoxAsyncRead>>;
    async fn new_write(&self, path: &str, opts: WriteOptions) -> Result<RepoWriter>;
    async fn list(&self, path: &str, opts: ListOptions) -> Result<Vec<String>>;
    async fn info(&self, path: &str) -> Result<NodeInfo>;
    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.info(path).await?.exists)
    }
    async fn remove(&self, path: &str, error_on_missing: bool) -> Result<()>;
    async fn path_create(&self, path: &str) -> Result<()>;
    /// Copy-then-unlink fallback when `src`/`dst` span filesystems (§4.C).
    async fn mv(&self, src: &str, dst: &str) -> Result<()>;
}

/// Local filesystem repository root. The only concrete backend this crate
/// ships; cloud drivers are out of scope (§1).
pub struct LocalFsStorage {
    root: PathBuf,
}

impl LocalFsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalFsStorage { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

#[async_trait]
impl RepositoryStorage for LocalFsStorage {
    async fn new_read(&self, path: &str, opts: ReadOptions) -> Result<Option<BoxAsyncRead>> {
        let full = self.resolve(path);
        match File::open(&full).await {
            Ok(file) => {
                let reader: BoxAsyncRead = match opts.limit {
                    Some(limit) => Box::pin(tokio::io::AsyncReadExt::take(BufReader::new(file), limit)),
                    None => Box::pin(BufReader::new(file)),
                };
                Ok(Some(reader))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && opts.ignore_missing => Ok(None),
            Err(e) => Err(e).with_context(|| format!("opening {}", full.display())),
        }
    }

    async fn new_write(&self, path: &str, opts: WriteOptions) -> Result<RepoWriter> {
        let final_path = self.resolve(path);
        if opts.create_path {
            if let Some(parent) = final_path.parent() {
                tokio::fs::create_dir_all(parent).await.context("creating parent directory")?;
            }
        }
        let (open_path, tmp_path) = if opts.atomic {
            let tmp = final_path.with_extension(match final_path.extension() {
                Some(ext) => format!("{}.tmp", ext.to_string_lossy()),
                None => "tmp".to_string(),
            });
            (tmp.clone(), Some(tmp))
        } else {
            (final_path.clone(), None)
        };
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode_or_default(opts.mode_file)
            .open(&open_path)
            .await
            .with_context(|| format!("opening {}", open_path.display()))?;
        Ok(RepoWriter {
            file,
            tmp_path,
            final_path,
            sync_file: opts.sync_file,
            sync_path: opts.sync_path,
        })
    }

    async fn list(&self, path: &str, opts: ListOptions) -> Result<Vec<String>> {
        let full = self.resolve(path);
        let mut entries = Vec::new();
        let mut read_dir = match tokio::fs::read_dir(&full).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !opts.error_on_missing => return Ok(entries),
            Err(e) => return Err(e).with_context(|| format!("listing {}", full.display())),
        };
        while let Some(entry) = read_dir.next_entry().await.context("reading directory entry")? {
            let name = entry.file_name().to_string_lossy().into_owned();
            match &opts.regex {
                Some(re) if !re.is_match(&name) => continue,
                _ => {}
            }
            entries.push(name);
        }
        match opts.sort_order {
            SortOrder::Asc => entries.sort(),
            SortOrder::Desc => {
                entries.sort();
                entries.reverse();
            }
        }
        Ok(entries)
    }

    async fn info(&self, path: &str) -> Result<NodeInfo> {
        let full = self.resolve(path);
        match tokio::fs::symlink_metadata(&full).await {
            Ok(meta) => {
                let node_type = if meta.is_dir() {
                    NodeType::Path
                } else if meta.is_symlink() {
                    NodeType::Link
                } else if meta.is_file() {
                    NodeType::File
                } else {
                    NodeType::Special
                };
                Ok(NodeInfo {
                    exists: true,
                    node_type: Some(node_type),
                    size: meta.len(),
                    mtime: meta.modified().ok(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(NodeInfo::default()),
            Err(e) => Err(e).with_context(|| format!("stat {}", full.display())),
        }
    }

    async fn remove(&self, path: &str, error_on_missing: bool) -> Result<()> {
        let full = self.resolve(path);
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !error_on_missing => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", full.display())),
        }
    }

    async fn path_create(&self, path: &str) -> Result<()> {
        let full = self.resolve(path);
        tokio::fs::create_dir_all(&full).await.with_context(|| format!("creating {}", full.display()))
    }

    async fn mv(&self, src: &str, dst: &str) -> Result<()> {
        move_cross_fs(&self.resolve(src), &self.resolve(dst)).await
    }
}

/// `tokio::fs::rename` first; on `EXDEV` (cross-device link), copy then
/// unlink the source (§4.C). Full file syncs are skipped on the copy path
/// deliberately: the database re-requests anything not yet durably
/// delivered, so the cheap path-sync guarantee is enough (§4.C rationale).
pub async fn move_cross_fs(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent).await.context("creating destination parent")?;
    }
    match tokio::fs::rename(src, dst).await {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            let mut reader = File::open(src).await.context("opening move source")?;
            let mut writer = File::create(dst).await.context("creating move destination")?;
            tokio::io::copy(&mut reader, &mut writer).await.context("copying across filesystems")?;
            drop(writer);
            tokio::fs::remove_file(src).await.context("removing move source after copy")?;
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("renaming {} to {}", src.display(), dst.display())),
    }
}

/// Small extension so `OpenOptionsExt::mode` reads naturally at the call
/// site above without importing the unix-only trait by name everywhere.
trait OpenOptionsModeExt {
    fn mode_or_default(&mut self, mode: u32) -> &mut Self;
}

impl OpenOptionsModeExt for tokio::fs::OpenOptions {
    #[cfg(unix)]
    fn mode_or_default(&mut self, mode: u32) -> &mut Self {
        use std::os::unix::fs::OpenOptionsExt;
        self.mode(mode)
    }

    #[cfg(not(unix))]
    fn mode_or_default(&mut self, _mode: u32) -> &mut Self {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalFsStorage::new(dir.path());
        let mut w = storage.new_write("seg/FILE", WriteOptions::default()).await.unwrap();
        w.write_all(b"segment bytes").await.unwrap();
        w.finish().await.unwrap();

        let mut r = storage.new_read("seg/FILE", ReadOptions::default()).await.unwrap().unwrap();
        let mut buf = Vec::new();
        r.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"segment bytes");
    }

    #[tokio::test]
    async fn missing_read_with_ignore_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalFsStorage::new(dir.path());
        let r = storage
            .new_read("absent", ReadOptions { ignore_missing: true, limit: None })
            .await
            .unwrap();
        assert!(r.is_none());
    }

    #[tokio::test]
    async fn list_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalFsStorage::new(dir.path());
        for name in ["b.ok", "a.ok", "c.error"] {
            storage.new_write(name, WriteOptions::default()).await.unwrap().finish().await.unwrap();
        }
        let names = storage
            .list(
                "",
                ListOptions {
                    regex: Some(Regex::new(r"\.ok$").unwrap()),
                    error_on_missing: false,
                    sort_order: SortOrder::Asc,
                },
            )
            .await
            .unwrap();
        assert_eq!(names, vec!["a.ok".to_string(), "b.ok".to_string()]);
    }

    #[tokio::test]
    async fn mv_same_filesystem_is_atomic_rename() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        tokio::fs::write(&src, b"payload").await.unwrap();
        move_cross_fs(&src, &dst).await.unwrap();
        assert!(!src.exists());
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), b"payload");
    }
}
