//! Foreground `archive-get` command (§4.G): a deadline loop with states
//! `CHECK → FORK? → WAIT → {DELIVER, CHECK, NOT_FOUND_SOFT}`. Single-threaded,
//! blocking only on sleeps and filesystem/IPC I/O (§5).

use crate::archive_get;
use crate::context::Context;
use crate::lock::StanzaLock;
use crate::segment::{ideal_queue, WalSegment};
use crate::spool::{SpoolQueue, SpoolStatus};
use anyhow::{bail, Context as _, Result};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Poll tick between `WAIT` iterations (§5 "sleep between poll ticks ... at
/// millisecond granularity").
const POLL_TICK: Duration = Duration::from_millis(200);

pub enum ForegroundResult {
    /// Exit 0: segment delivered to the destination path.
    Delivered,
    /// Exit 1: segment definitively absent, no error (`NOT_FOUND_SOFT`).
    NotFound,
}

/// Runs the full deadline loop for one `<SEG> <DEST>` invocation.
pub async fn run(ctx: &Context, seg_name: &str, dest: &Path) -> Result<ForegroundResult> {
    let opts = &ctx.options;

    // Synchronous fallback: async disabled, or the target does not parse as
    // a segment (history file, `.backup` label, ...) — §4.G "Synchronous
    // fallback", boundary behavior "non-segment input".
    let segment = WalSegment::parse(seg_name);
    if !opts.archive_async || segment.is_none() {
        return run_sync_fallback(ctx, seg_name, dest).await;
    }
    let seg = segment.expect("checked above");

    let spool = SpoolQueue::new(&opts.spool_path);
    let deadline = Instant::now() + opts.archive_timeout;
    let mut forked = false;
    // Whether SEG itself is already known (via a marker observed earlier in
    // this same loop) to have been handled by a prior async run, so a fresh
    // fork should start its queue at SEG+1 instead of refetching SEG. Since
    // `CHECK` returns this function as soon as SEG is `Present` or `Ok`,
    // this can only flip within one foreground invocation via a stale
    // `.error` marker for SEG that we chose not to throw on yet.
    let mut found = false;
    let mut throw_on_error = false;

    loop {
        // CHECK
        if let Some(status) = spool.check(seg).await? {
            match status {
                SpoolStatus::Present => return deliver(&spool, seg, dest, &opts.spool_path).await,
                SpoolStatus::Ok { warnings } => {
                    for w in &warnings {
                        tracing::warn!(segment = %seg, warning = %w, "archive-get: async run reported a warning");
                    }
                    return Ok(ForegroundResult::NotFound);
                }
                SpoolStatus::Error(err) => {
                    if throw_on_error {
                        bail!(err);
                    }
                    // A prior attempt's stale error: ignored this iteration
                    // (we might still see the segment land), but it tells us
                    // SEG was already attempted, so the next fork's queue
                    // should start past it.
                    found = true;
                }
            }
        }
        if let Some(global_err) = spool.read_global_error().await? {
            if throw_on_error {
                bail!(global_err);
            }
        }

        // FORK?
        if !forked {
            let queue_bytes = spool.staged_bytes(opts.segment_size as u64).await?;
            let queue_half_full = queue_bytes > opts.archive_get_queue_max / 2;
            if should_fork_now(queue_half_full, found) {
                if let Some(lock) = StanzaLock::try_acquire(&opts.lock_path, &opts.stanza)? {
                    let start = if found { seg.next(opts.segments_per_log()) } else { seg };
                    let queue = ideal_queue(start, opts.archive_get_queue_max, opts.segment_size, opts.segments_per_log());
                    spool.clear_error(seg).await?;
                    fork_async(ctx, &queue).context("forking async archive-get run")?;
                    forked = true;
                    drop(lock);
                }
                // Lock contention (§7 "expected, not fatal"): simply skip the
                // fork this CHECK cycle, fall through to WAIT.
            }
        }

        // WAIT
        if Instant::now() >= deadline {
            return Ok(ForegroundResult::NotFound);
        }
        tokio::time::sleep(POLL_TICK).await;
        throw_on_error = true;
    }
}

/// FORK? decision (§4.G): skip forking when the queue is already at least
/// half full *and* `SEG` has already been found by a prior async run —
/// forking again would just be wasted work for a segment that's already
/// on its way.
fn should_fork_now(queue_half_full: bool, found: bool) -> bool {
    !queue_half_full || !found
}

async fn deliver(spool: &SpoolQueue, seg: WalSegment, dest: &Path, spool_root: &Path) -> Result<ForegroundResult> {
    spool.deliver(seg, dest, spool_root).await.context("delivering spooled segment")?;
    Ok(ForegroundResult::Delivered)
}

async fn run_sync_fallback(ctx: &Context, name: &str, dest: &Path) -> Result<ForegroundResult> {
    match WalSegment::parse(name) {
        Some(seg) => {
            let spool = SpoolQueue::new(&ctx.options.spool_path);
            match archive_get::fetch_segment_into_spool(seg, &ctx.options.repositories, &spool).await? {
                archive_get::FetchOutcome::Found { .. } => deliver(&spool, seg, dest, &ctx.options.spool_path).await,
                archive_get::FetchOutcome::NotFound => Ok(ForegroundResult::NotFound),
            }
        }
        None => match archive_get::fetch_name_into_path(name, &ctx.options.repositories, dest).await? {
            archive_get::FetchOutcome::Found { .. } => Ok(ForegroundResult::Delivered),
            archive_get::FetchOutcome::NotFound => Ok(ForegroundResult::NotFound),
        },
    }
}

/// Re-execs this binary with the hidden `archive-get:async` role and the
/// ideal queue as positional arguments (§9 "Worker lifecycle" — argv
/// re-serialization — applies equally to the async role, not just workers).
/// Detached: the foreground does not wait on it (§4.G "fork async").
fn fork_async(ctx: &Context, queue: &[WalSegment]) -> Result<()> {
    let self_exe = std::env::current_exe().context("resolving current executable path")?;
    let mut argv = crate::context::render_argv("archive-get:async", &ctx.options);
    argv.extend(queue.iter().map(|seg| seg.to_string()));
    let mut cmd = Command::new(self_exe);
    cmd.args(&argv);
    cmd.stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    cmd.spawn().context("spawning archive-get:async")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn does_not_fork_when_already_found_and_queue_busy() {
        assert!(!should_fork_now(true, true));
    }

    #[test]
    fn forks_when_queue_not_half_full_even_if_already_found() {
        assert!(should_fork_now(false, true));
    }

    #[test]
    fn forks_when_not_yet_found_even_if_queue_busy() {
        assert!(should_fork_now(true, false));
    }
}
