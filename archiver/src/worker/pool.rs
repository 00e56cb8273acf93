//! Worker pool / parallel executor (§4.E): one parent, `process_max`
//! children launched once per async run, communicating over framed pack
//! messages on piped stdio.
//!
//! Children are literal OS processes (`tokio::process::Command` re-execing
//! this same binary with a hidden `worker` subcommand), not `tokio::task`s —
//! §5 states "one OS process per role". This mirrors how `neon`'s
//! `pageserver::walredo` launches and manages a child `postgres` process
//! over piped stdio for its own redo protocol; the primary teacher's own
//! worker model is in-process (`tokio::task::JoinSet` fanning out S3
//! uploads in `bottomless::replicator`), which is where the fan-in polling
//! shape below is borrowed from instead.

use super::protocol::{self, ArchiveGetParams, Request, Response};
use crate::error::ArchiveError;
use anyhow::{anyhow, Context, Result};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use std::collections::VecDeque;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

pub struct JobItem {
    pub key: String,
    pub params: ArchiveGetParams,
}

#[derive(Debug)]
pub enum JobOutcome {
    Result { key: String, actual_idx: Option<u32>, warnings: Vec<String> },
    Error { key: String, error: ArchiveError },
}

enum InFlight {
    Idle,
    Job(String),
    ShuttingDown,
    Done,
}

impl InFlight {
    fn is_idle(&self) -> bool {
        matches!(self, InFlight::Idle)
    }
}

struct ChildProc {
    #[allow(dead_code)] // kept alive for its Drop (kill_on_drop) and for diagnostics
    child: Child,
    stdin: ChildStdin,
    stdout: Option<ChildStdout>,
}

pub struct WorkerPool {
    children: Vec<ChildProc>,
}

type ReadOutcome = (usize, ChildStdout, std::result::Result<std::io::Result<Option<Vec<u8>>>, tokio::time::error::Elapsed>);
type ReadFuture = Pin<Box<dyn Future<Output = ReadOutcome> + Send>>;

async fn read_one(idx: usize, mut stdout: ChildStdout, timeout: Duration) -> ReadOutcome {
    let res = tokio::time::timeout(timeout, protocol::read_frame(&mut stdout)).await;
    (idx, stdout, res)
}

impl WorkerPool {
    /// Re-execs `self_exe` with the hidden `worker` subcommand (argv
    /// rendered by [`crate::context::render_argv`]), `count` times, each
    /// with a fresh piped stdin/stdout pair.
    pub async fn spawn(self_exe: &Path, count: u32, argv: &[String]) -> Result<Self> {
        let mut children = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut child = Command::new(self_exe)
                .args(argv)
                .stdin(std::process::Stdio::piped())
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::inherit())
                .kill_on_drop(true)
                .spawn()
                .context("spawning worker child process")?;
            let stdin = child.stdin.take().expect("piped stdin");
            let stdout = child.stdout.take().expect("piped stdout");
            children.push(ChildProc { child, stdin, stdout: Some(stdout) });
        }
        Ok(WorkerPool { children })
    }

    /// Runs `jobs` to completion (§4.E scheduler steps 1-5). Jobs may
    /// complete in any order; each `JobOutcome` carries its original key.
    pub async fn run(&mut self, jobs: Vec<JobItem>, protocol_timeout: Duration) -> Result<Vec<JobOutcome>> {
        let tick = protocol_timeout / 2;
        let n = self.children.len();
        let mut pending: VecDeque<JobItem> = jobs.into();
        let mut in_flight: Vec<InFlight> = (0..n).map(|_| InFlight::Idle).collect();
        let mut results = Vec::new();
        let mut reads: FuturesUnordered<ReadFuture> = FuturesUnordered::new();

        loop {
            for idx in 0..n {
                if !in_flight[idx].is_idle() {
                    continue;
                }
                if let Some(job) = pending.pop_front() {
                    let bytes = protocol::encode_request(&Request::ArchiveGet(job.params));
                    protocol::write_frame(&mut self.children[idx].stdin, &bytes)
                        .await
                        .with_context(|| format!("writing request to child {idx}"))?;
                    in_flight[idx] = InFlight::Job(job.key);
                    let stdout = self.children[idx].stdout.take().expect("idle child owns its stdout");
                    reads.push(Box::pin(read_one(idx, stdout, tick)));
                } else {
                    let bytes = protocol::encode_request(&Request::Shutdown);
                    // Best-effort: a child that already exited will fail this write; that's fine.
                    let _ = protocol::write_frame(&mut self.children[idx].stdin, &bytes).await;
                    in_flight[idx] = InFlight::ShuttingDown;
                    if let Some(stdout) = self.children[idx].stdout.take() {
                        reads.push(Box::pin(read_one(idx, stdout, tick)));
                    }
                }
            }

            if reads.is_empty() {
                break;
            }

            match reads.next().await {
                Some((idx, stdout, Ok(Ok(Some(bytes))))) => match std::mem::replace(&mut in_flight[idx], InFlight::Idle) {
                    InFlight::Job(key) => {
                        let response = protocol::decode_response(&bytes).unwrap_or_else(Response::Error);
                        results.push(match response {
                            Response::Result { actual_idx, warnings } => JobOutcome::Result { key, actual_idx, warnings },
                            Response::Error(error) => JobOutcome::Error { key, error },
                        });
                        self.children[idx].stdout = Some(stdout);
                    }
                    InFlight::ShuttingDown => {
                        in_flight[idx] = InFlight::ShuttingDown;
                    }
                    other => in_flight[idx] = other,
                },
                Some((idx, _stdout, Ok(Ok(None)))) => {
                    // Clean EOF: the child exited after (or instead of) acking shutdown.
                    in_flight[idx] = InFlight::Done;
                }
                Some((idx, _stdout, Ok(Err(io_err)))) => {
                    return Err(anyhow!(ArchiveError::protocol(format!("child {idx} IPC error: {io_err}"))));
                }
                Some((idx, _stdout, Err(_elapsed))) => {
                    return Err(anyhow!(ArchiveError::protocol(format!(
                        "child {idx} produced no response within {tick:?}"
                    ))));
                }
                None => break,
            }
        }

        Ok(results)
    }

    /// Cancellation (§5): on any parent exception, shutdown is sent best
    /// effort and children are reaped via `kill_on_drop` when this pool is
    /// dropped.
    pub async fn shutdown_all(&mut self) {
        let bytes = protocol::encode_request(&Request::Shutdown);
        for child in &mut self.children {
            let _ = protocol::write_frame(&mut child.stdin, &bytes).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_flight_idle_detection() {
        assert!(InFlight::Idle.is_idle());
        assert!(!InFlight::Job("x".to_string()).is_idle());
        assert!(!InFlight::ShuttingDown.is_idle());
        assert!(!InFlight::Done.is_idle());
    }
}
