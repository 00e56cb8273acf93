//! Process-wide state modeled as an explicit value (§9 DESIGN NOTES): the
//! source keeps timing, command-line echo, and spool path helpers as
//! globals; here they live on one `Context` built once and threaded through
//! the core, with no hidden singletons.

use crate::io::CipherType;
use std::path::PathBuf;
use std::time::Instant;

/// One configured candidate repository (§3 Job; §6 required options).
#[derive(Debug, Clone)]
pub struct RepoCandidate {
    pub repo_index: u32,
    pub repo_path: PathBuf,
    pub archive_id: String,
    pub cipher_type: CipherType,
    pub cipher_pass: Option<String>,
}

/// Options recognized by the `archive-get` command family (§6 "Required
/// options"). Config-file merging across stanzas is out of scope (§1); this
/// struct is populated directly from parsed CLI flags by `archiver-cli`.
#[derive(Debug, Clone)]
pub struct Options {
    pub stanza: String,
    pub pg_path: PathBuf,
    pub repositories: Vec<RepoCandidate>,
    pub spool_path: PathBuf,
    pub archive_async: bool,
    pub archive_timeout: std::time::Duration,
    pub protocol_timeout: std::time::Duration,
    pub archive_get_queue_max: u64,
    pub process_max: u32,
    pub lock_path: PathBuf,
    pub segment_size: u32,
}

impl Options {
    /// `0x100000000 / segment_size`: how many segments make up one logical
    /// log file before the log number itself advances (§3 `WalSegment::next`).
    pub fn segments_per_log(&self) -> u32 {
        (0x1_0000_0000u64 / self.segment_size as u64) as u32
    }
}

/// Threaded explicitly through the core (no globals): process start time for
/// deadline math, plus the resolved options for this invocation.
pub struct Context {
    pub options: Options,
    pub started_at: Instant,
}

impl Context {
    pub fn new(options: Options) -> Self {
        Context {
            options,
            started_at: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }
}

/// Re-serializes `opts` as argv for a child re-exec of this same binary
/// under `role` (§9 "Worker lifecycle": `renderArgv(role, overrides)`).
/// Children are always rendered `--quiet`, the equivalent of the source's
/// `log-level-console=off`/`log-level-stderr=off` overrides: their own
/// stdout/stderr aren't the operator's terminal.
pub fn render_argv(role: &str, opts: &Options) -> Vec<String> {
    let mut argv = vec![role.to_string()];
    argv.push("--stanza".to_string());
    argv.push(opts.stanza.clone());
    argv.push("--pg-path".to_string());
    argv.push(opts.pg_path.display().to_string());
    argv.push("--spool-path".to_string());
    argv.push(opts.spool_path.display().to_string());
    argv.push("--lock-path".to_string());
    argv.push(opts.lock_path.display().to_string());
    argv.push("--process-max".to_string());
    argv.push(opts.process_max.to_string());
    argv.push("--archive-timeout".to_string());
    argv.push(opts.archive_timeout.as_secs_f64().to_string());
    argv.push("--protocol-timeout".to_string());
    argv.push(opts.protocol_timeout.as_secs_f64().to_string());
    argv.push("--archive-get-queue-max".to_string());
    argv.push(opts.archive_get_queue_max.to_string());
    argv.push("--segment-size".to_string());
    argv.push(opts.segment_size.to_string());
    if opts.archive_async {
        argv.push("--archive-async".to_string());
    }
    for repo in &opts.repositories {
        argv.push("--repo-path".to_string());
        argv.push(repo.repo_path.display().to_string());
        argv.push("--repo-cipher-type".to_string());
        argv.push(
            match repo.cipher_type {
                CipherType::None => "none",
                CipherType::Aes256Cbc => "aes-256-cbc",
            }
            .to_string(),
        );
        if let Some(pass) = &repo.cipher_pass {
            argv.push("--repo-cipher-pass".to_string());
            argv.push(pass.clone());
        }
        argv.push("--archive-id".to_string());
        argv.push(repo.archive_id.clone());
    }
    argv.push("--quiet".to_string());
    argv
}
