//! Local database verification (§4.H step 1): before the async role fetches
//! anything, confirm it can read `pg-path`'s control file directly off this
//! filesystem. Grounded on `pgIsLocalVerify()`, called at the top of
//! `cmdArchiveGetAsync` in `examples/original_source/src/command/archive/get/get.c` —
//! a database reached only through a remote exec boundary, or a `pg-path`
//! that simply isn't a cluster directory, has no such file to read.

use crate::error::ArchiveError;
use anyhow::Result;
use std::path::Path;

const CONTROL_FILE_REL: &str = "global/pg_control";

/// Fails with `ErrorCode::InvalidArgument` if `pg_path` does not look like a
/// locally-readable PostgreSQL cluster directory.
pub async fn verify_local(pg_path: &Path) -> Result<()> {
    let control_path = pg_path.join(CONTROL_FILE_REL);
    let bytes = tokio::fs::read(&control_path).await.map_err(|e| {
        ArchiveError::invalid_argument(format!(
            "database is not local or control file is unreadable at {}: {e}",
            control_path.display()
        ))
    })?;
    if bytes.is_empty() {
        return Err(ArchiveError::invalid_argument(format!("control file at {} is empty", control_path.display())).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fails_when_control_file_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = verify_local(dir.path()).await.unwrap_err();
        assert!(err.downcast_ref::<ArchiveError>().is_some());
    }

    #[tokio::test]
    async fn fails_when_control_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("global")).await.unwrap();
        tokio::fs::write(dir.path().join(CONTROL_FILE_REL), b"").await.unwrap();
        let err = verify_local(dir.path()).await.unwrap_err();
        let archive_err = err.downcast_ref::<ArchiveError>().unwrap();
        assert_eq!(archive_err.code, crate::error::ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn succeeds_when_control_file_is_present_and_non_empty() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("global")).await.unwrap();
        tokio::fs::write(dir.path().join(CONTROL_FILE_REL), b"not a real control file, just non-empty").await.unwrap();
        verify_local(dir.path()).await.unwrap();
    }
}
