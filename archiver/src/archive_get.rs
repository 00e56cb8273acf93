//! Archive-get file operation (§4.F): locate a WAL segment (or history file)
//! across eligible archives, verify it, and deliver it. Used by both the
//! foreground's synchronous fallback and the worker role (§4.E).

use crate::context::RepoCandidate;
use crate::io::{wrap_decompress, wrap_decrypt, wrap_verify_sha1, CompressionKind};
use crate::segment::WalSegment;
use crate::spool::SpoolQueue;
use crate::storage::{ListOptions, LocalFsStorage, ReadOptions, RepositoryStorage, SortOrder, WriteOptions};
use anyhow::{Context as _, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::AsyncWriteExt;

/// Outcome of one §4.F invocation — never an error on its own for "not
/// found"; only I/O, decrypt, or hash failures propagate as `Err` (§4.F
/// "Errors that abort the operation").
pub enum FetchOutcome {
    Found { actual_idx: u32, warnings: Vec<String> },
    NotFound,
}

static CANDIDATE_SUFFIX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?:-([0-9A-Fa-f]{40}))?(?:\.(gz|bz2|lz4|zst|xz))?$").unwrap());

fn build_candidate_regex(name: &str) -> Result<Regex> {
    Ok(Regex::new(&format!(r"^{}(-[0-9A-Fa-f]{{40}})?(\.(gz|bz2|lz4|zst|xz))?$", regex::escape(name)))?)
}

/// `<archiveId>/<SEG[0:16]>/<SEG>` for segments, `<archiveId>/<SEG>` for
/// anything else (history files, `.backup` labels) — §4.F step 1a.
fn archive_dir(archive_id: &str, name: &str) -> String {
    match WalSegment::parse(name) {
        Some(seg) => format!("{archive_id}/{}", seg.archive_subdir()),
        None => archive_id.to_string(),
    }
}

/// Splits a matched listing entry's suffix into `(sha1_hex, compression_ext)`.
fn parse_suffix<'a>(name: &str, matched: &'a str) -> (Option<&'a str>, Option<&'a str>) {
    let suffix = &matched[name.len()..];
    match CANDIDATE_SUFFIX_RE.captures(suffix) {
        Some(caps) => (
            caps.get(1).map(|m| m.as_str()),
            caps.get(2).map(|m| m.as_str()),
        ),
        None => (None, None),
    }
}

/// Core §4.F loop: tries `candidates` strictly in order (I7), opens the
/// filter chain for the first match, and streams it into `sink`. `sink`
/// receives the fully composed plaintext reader and is responsible for
/// writing it to wherever the caller wants it materialized (spool, for
/// segments pre-fetched by a worker; the database destination directly, for
/// the synchronous non-segment fallback — §3 "History files ... bypass the
/// async pipeline").
async fn locate_and_stream<F, Fut>(
    name: &str,
    candidates: &[RepoCandidate],
    mut sink: F,
) -> Result<FetchOutcome>
where
    F: FnMut(crate::io::BoxAsyncRead) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let list_regex = build_candidate_regex(name)?;
    for candidate in candidates {
        let storage = LocalFsStorage::new(&candidate.repo_path);
        let dir = archive_dir(&candidate.archive_id, name);
        let matches = storage
            .list(
                &dir,
                ListOptions {
                    regex: Some(list_regex.clone()),
                    error_on_missing: false,
                    sort_order: SortOrder::Asc,
                },
            )
            .await
            .with_context(|| format!("listing {dir} in repo {}", candidate.repo_index))?;
        if matches.is_empty() {
            continue;
        }
        let mut warnings = Vec::new();
        if matches.len() > 1 {
            warnings.push(format!(
                "multiple candidates for {name} in repo {}: selected {} (ascending lexical order)",
                candidate.repo_index, matches[0]
            ));
        }
        let chosen = &matches[0];
        let (sha1_hex, ext) = parse_suffix(name, chosen);

        let raw = storage
            .new_read(&format!("{dir}/{chosen}"), ReadOptions::default())
            .await
            .with_context(|| format!("opening {dir}/{chosen}"))?
            .expect("just listed this entry, it must exist");

        let verified = wrap_verify_sha1(raw, sha1_hex);
        let decrypted = wrap_decrypt(candidate.cipher_type, candidate.cipher_pass.as_deref(), verified)
            .await
            .context("decrypting archive content")?;
        let compression = ext.and_then(CompressionKind::from_extension).unwrap_or_default();
        let decompressed = wrap_decompress(compression, decrypted).context("decompressing archive content")?;

        sink(decompressed).await.context("materializing fetched content")?;

        return Ok(FetchOutcome::Found {
            actual_idx: candidate.repo_index,
            warnings,
        });
    }
    Ok(FetchOutcome::NotFound)
}

/// Fetches a segment into `<spool>/archive/in/<SEG>.tmp`, then renames it
/// atomically (§4.F step e; §4.D invariant 2: atomic + fsync file + fsync
/// path). This is the path both the worker role and the async-disabled
/// sync fallback use when the target parses as a real segment.
pub async fn fetch_segment_into_spool(seg: WalSegment, candidates: &[RepoCandidate], spool: &SpoolQueue) -> Result<FetchOutcome> {
    let name = seg.to_string();
    let spool_target = format!("archive/in/{name}");
    locate_and_stream(&name, candidates, |mut reader| {
        let spool = spool.storage();
        let target = spool_target.clone();
        async move {
            let mut writer = spool
                .new_write(
                    &target,
                    WriteOptions {
                        create_path: true,
                        sync_file: true,
                        sync_path: true,
                        atomic: true,
                        mode_file: 0o640,
                    },
                )
                .await?;
            tokio::io::copy(&mut reader, &mut writer).await.context("streaming segment into spool")?;
            writer.finish().await
        }
    })
    .await
}

/// Fetches a non-segment target (history file, `.backup` label) directly to
/// `dest_path`, bypassing the spool entirely (§3).
pub async fn fetch_name_into_path(name: &str, candidates: &[RepoCandidate], dest_path: &std::path::Path) -> Result<FetchOutcome> {
    locate_and_stream(name, candidates, |mut reader| {
        let dest_path = dest_path.to_path_buf();
        async move {
            if let Some(parent) = dest_path.parent() {
                tokio::fs::create_dir_all(parent).await.context("creating destination parent")?;
            }
            let tmp_path = dest_path.with_extension("tmp");
            let mut tmp = tokio::fs::File::create(&tmp_path).await.context("creating destination tmp file")?;
            tokio::io::copy(&mut reader, &mut tmp).await.context("streaming content to destination")?;
            tmp.flush().await?;
            tokio::fs::rename(&tmp_path, &dest_path).await.context("renaming into final destination")?;
            Ok(())
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::CipherType;
    use sha1::{Digest, Sha1};

    fn candidate(idx: u32, repo_path: &std::path::Path) -> RepoCandidate {
        RepoCandidate {
            repo_index: idx,
            repo_path: repo_path.to_path_buf(),
            archive_id: "10-1".to_string(),
            cipher_type: CipherType::None,
            cipher_pass: None,
        }
    }

    #[tokio::test]
    async fn tries_candidates_in_order_and_stops_at_first_hit() {
        let repo0 = tempfile::tempdir().unwrap();
        let repo1 = tempfile::tempdir().unwrap();
        let seg = WalSegment::parse("000000010000000100000005").unwrap();
        let dir = format!("10-1/{}", seg.archive_subdir());
        let body = vec![7u8; 64];
        let sha1 = hex::encode(Sha1::digest(&body));
        let full_dir = repo1.path().join(&dir);
        tokio::fs::create_dir_all(&full_dir).await.unwrap();
        tokio::fs::write(full_dir.join(format!("{seg}-{sha1}")), &body).await.unwrap();

        let spool_dir = tempfile::tempdir().unwrap();
        let spool = SpoolQueue::new(spool_dir.path());
        let candidates = vec![candidate(0, repo0.path()), candidate(1, repo1.path())];

        let outcome = fetch_segment_into_spool(seg, &candidates, &spool).await.unwrap();
        match outcome {
            FetchOutcome::Found { actual_idx, warnings } => {
                assert_eq!(actual_idx, 1);
                assert!(warnings.is_empty());
            }
            FetchOutcome::NotFound => panic!("expected a hit on repo 1"),
        }
        let staged = tokio::fs::read(spool_dir.path().join("archive/in").join(seg.to_string())).await.unwrap();
        assert_eq!(staged, body);
    }

    #[tokio::test]
    async fn not_found_when_no_candidate_matches() {
        let repo0 = tempfile::tempdir().unwrap();
        let seg = WalSegment::parse("000000010000000100000005").unwrap();
        let spool_dir = tempfile::tempdir().unwrap();
        let spool = SpoolQueue::new(spool_dir.path());
        let candidates = vec![candidate(0, repo0.path())];
        let outcome = fetch_segment_into_spool(seg, &candidates, &spool).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::NotFound));
    }
}
