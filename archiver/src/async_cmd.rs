//! Async `archive-get:async` command (§4.H): fetches an ordered list of
//! segments (the ideal queue) in parallel across a worker pool and records
//! the outcome of each as a spool status marker.

use crate::context::Context;
use crate::error::ArchiveError;
use crate::segment::WalSegment;
use crate::spool::SpoolQueue;
use crate::worker::{JobItem, JobOutcome, WorkerPool};
use anyhow::{Context as _, Result};

/// What happened to the overall async run, for the CLI's exit-code mapping
/// (§6: "Always exits 0 once markers have been written ... unless the
/// failure precedes marker creation").
pub enum AsyncOutcome {
    /// Ran to completion; per-segment markers (if any) were written normally.
    Completed,
    /// A top-level failure occurred, but `global.error` was written to
    /// report it — the caller should still exit 0.
    GlobalError,
}

/// Runs the async role to completion against `segments` (already in ideal
/// queue order; see §4.H step 3 — the job generator is just this list plus
/// an implicit shutdown once exhausted, modeled directly by
/// [`WorkerPool::run`]). Returns `Err` only when a top-level failure could
/// not even be recorded as `global.error` (failure precedes marker
/// creation); otherwise the failure is captured in the returned
/// [`AsyncOutcome`] (§4.H step 6, §7 propagation policy).
pub async fn run(ctx: &Context, segments: &[WalSegment]) -> Result<AsyncOutcome> {
    let opts = &ctx.options;
    let spool = SpoolQueue::new(&opts.spool_path);

    match run_inner(ctx, segments, &spool).await {
        Ok(()) => Ok(AsyncOutcome::Completed),
        Err(e) => {
            let archive_err = top_level_error(&e);
            match spool.write_global_error(&archive_err).await {
                Ok(()) => {
                    tracing::error!(error = %e, "archive-get:async: top-level failure, recorded in global.error");
                    Ok(AsyncOutcome::GlobalError)
                }
                Err(write_err) => Err(write_err.context(format!("also failed to write global.error after: {e}"))),
            }
        }
    }
}

async fn run_inner(ctx: &Context, segments: &[WalSegment], spool: &SpoolQueue) -> Result<()> {
    let opts = &ctx.options;
    crate::pg_control::verify_local(&opts.pg_path)
        .await
        .context("verifying database is local before starting the async run (§4.H step 1)")?;
    let self_exe = std::env::current_exe().context("resolving current executable path")?;
    let argv = crate::context::render_argv("worker", opts);
    let mut pool = WorkerPool::spawn(&self_exe, opts.process_max, &argv).await.context("spawning worker pool")?;

    let jobs: Vec<JobItem> = segments
        .iter()
        .map(|seg| JobItem {
            key: seg.to_string(),
            params: crate::worker::ArchiveGetParams {
                segment_name: seg.to_string(),
                candidates: opts.repositories.clone(),
            },
        })
        .collect();

    let outcomes = match pool.run(jobs, opts.protocol_timeout).await {
        Ok(outcomes) => outcomes,
        Err(e) => {
            pool.shutdown_all().await;
            return Err(e);
        }
    };

    for outcome in outcomes {
        record_outcome(spool, outcome).await?;
    }
    Ok(())
}

/// Per-completed-job bookkeeping (§4.H step 5). A successful delivery needs
/// no marker at all: the worker already renamed the segment into
/// `<spool>/archive/in/<SEG>` and the foreground's `CHECK` state will find
/// it there directly.
async fn record_outcome(spool: &SpoolQueue, outcome: JobOutcome) -> Result<()> {
    match outcome {
        JobOutcome::Result { key, actual_idx: Some(_), warnings: _ } => {
            let seg = WalSegment::parse(&key).context("worker returned a key that is not a segment name")?;
            tracing::info!(segment = %seg, "archive-get:async: segment delivered");
            Ok(())
        }
        JobOutcome::Result { key, actual_idx: None, warnings } => {
            let seg = WalSegment::parse(&key).context("worker returned a key that is not a segment name")?;
            spool.write_ok(seg, &warnings).await.context("writing .ok marker")
        }
        JobOutcome::Error { key, error } => {
            let seg = WalSegment::parse(&key).context("worker returned a key that is not a segment name")?;
            tracing::warn!(segment = %seg, code = ?error.code, message = %error.message, "archive-get:async: job failed");
            spool.write_error(seg, error.code as i32, &error.message).await.context("writing .error marker")
        }
    }
}

fn top_level_error(e: &anyhow::Error) -> ArchiveError {
    match e.downcast_ref::<ArchiveError>() {
        Some(archive_err) => archive_err.clone(),
        None => ArchiveError::protocol(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_level_error_preserves_archive_error_code() {
        let err: anyhow::Error = anyhow::anyhow!(ArchiveError::integrity("hash mismatch"));
        let converted = top_level_error(&err);
        assert_eq!(converted.code, crate::error::ErrorCode::Integrity);
    }

    #[test]
    fn top_level_error_wraps_other_errors_as_protocol() {
        let err: anyhow::Error = anyhow::anyhow!("disk unmounted");
        let converted = top_level_error(&err);
        assert_eq!(converted.code, crate::error::ErrorCode::Protocol);
    }
}
