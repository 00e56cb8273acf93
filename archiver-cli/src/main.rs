use anyhow::{bail, Context as _, Result};
use archiver::context::{Context, Options, RepoCandidate};
use archiver::io::CipherType;
use archiver::worker::protocol::{self, Request, Response};
use archiver::{archive_get, async_cmd, foreground, segment::WalSegment, spool::SpoolQueue};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "pgwal-archive-get")]
#[command(about = "Fetch write-ahead-log segments from a repository archive", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true)]
    stanza: String,
    #[arg(long, global = true)]
    pg_path: PathBuf,
    #[arg(long = "repo-path", global = true)]
    repo_path: Vec<PathBuf>,
    #[arg(long = "repo-type", global = true, default_value = "posix")]
    repo_type: String,
    #[arg(long = "repo-cipher-type", global = true)]
    repo_cipher_type: Vec<String>,
    #[arg(long = "repo-cipher-pass", global = true)]
    repo_cipher_pass: Vec<String>,
    #[arg(long = "archive-id", global = true)]
    archive_id: Vec<String>,
    #[arg(long, global = true)]
    spool_path: PathBuf,
    #[arg(long, global = true)]
    archive_async: bool,
    #[arg(long, global = true, default_value_t = 60.0)]
    archive_timeout: f64,
    #[arg(long, global = true, default_value_t = 60.0)]
    protocol_timeout: f64,
    #[arg(long, global = true, default_value_t = 16 * 1024 * 1024 * 4)]
    archive_get_queue_max: u64,
    #[arg(long, global = true, default_value_t = 1)]
    process_max: u32,
    #[arg(long, global = true)]
    lock_path: PathBuf,
    #[arg(long, global = true, default_value_t = 16 * 1024 * 1024)]
    segment_size: u32,
    /// Quiets console logging; set automatically on re-exec'd child roles.
    #[arg(long, global = true, hide = true)]
    quiet: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch one segment (or history file) to a destination path.
    #[command(name = "archive-get")]
    ArchiveGet { seg_name: String, dest_path: PathBuf },
    /// Internal: fetch an ideal queue of segments into the spool.
    #[command(name = "archive-get-async", visible_alias = "archive-get:async", hide = true)]
    ArchiveGetAsync { segments: Vec<String> },
    /// Internal: worker role, speaks the pack protocol over stdio.
    #[command(hide = true)]
    Worker,
}

fn build_context(cli: &Cli) -> Result<Context> {
    if cli.repo_type != "posix" {
        bail!("unsupported repo-type '{}': only 'posix' is implemented", cli.repo_type);
    }
    if cli.repo_path.is_empty() {
        bail!("at least one --repo-path is required");
    }
    let mut repositories = Vec::with_capacity(cli.repo_path.len());
    for (i, repo_path) in cli.repo_path.iter().enumerate() {
        let cipher_type = match cli.repo_cipher_type.get(i).map(String::as_str) {
            None | Some("none") => CipherType::None,
            Some("aes-256-cbc") => CipherType::Aes256Cbc,
            Some(other) => bail!("unknown repo-cipher-type '{other}'"),
        };
        let cipher_pass = cli.repo_cipher_pass.get(i).cloned();
        if cipher_type == CipherType::Aes256Cbc && cipher_pass.is_none() {
            bail!("repo-cipher-pass is required when repo-cipher-type is aes-256-cbc");
        }
        let archive_id = cli.archive_id.get(i).cloned().unwrap_or_else(|| format!("{}-1", cli.stanza));
        repositories.push(RepoCandidate {
            repo_index: i as u32,
            repo_path: repo_path.clone(),
            archive_id,
            cipher_type,
            cipher_pass,
        });
    }
    let options = Options {
        stanza: cli.stanza.clone(),
        pg_path: cli.pg_path.clone(),
        repositories,
        spool_path: cli.spool_path.clone(),
        archive_async: cli.archive_async,
        archive_timeout: Duration::from_secs_f64(cli.archive_timeout),
        protocol_timeout: Duration::from_secs_f64(cli.protocol_timeout),
        archive_get_queue_max: cli.archive_get_queue_max,
        process_max: cli.process_max,
        lock_path: cli.lock_path.clone(),
        segment_size: cli.segment_size,
    };
    Ok(Context::new(options))
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();
    if cli.quiet {
        tracing_subscriber::fmt().with_env_filter("error").init();
    } else {
        tracing_subscriber::fmt::init();
    }

    match &cli.command {
        Commands::ArchiveGet { seg_name, dest_path } => {
            let ctx = build_context(&cli)?;
            match foreground::run(&ctx, seg_name, dest_path).await? {
                foreground::ForegroundResult::Delivered => Ok(0),
                foreground::ForegroundResult::NotFound => Ok(1),
            }
        }
        Commands::ArchiveGetAsync { segments } => {
            let ctx = build_context(&cli)?;
            let segs: Vec<WalSegment> = segments
                .iter()
                .map(|s| WalSegment::parse(s).with_context(|| format!("'{s}' is not a valid segment name")))
                .collect::<Result<_>>()?;
            // Exits 0 for both outcomes: a `GlobalError` means the failure
            // was already recorded as a marker, which per §6 is not a fatal
            // exit for this role. Only a failure that precedes any marker
            // creation propagates through `?` to the `Err` branch in `main`.
            match async_cmd::run(&ctx, &segs).await? {
                async_cmd::AsyncOutcome::Completed | async_cmd::AsyncOutcome::GlobalError => Ok(0),
            }
        }
        Commands::Worker => {
            let ctx = build_context(&cli)?;
            run_worker(&ctx).await?;
            Ok(0)
        }
    }
}

/// Worker role (§4.E): reads framed requests from stdin, dispatches each
/// through §4.F, and writes a framed response to stdout, until a shutdown
/// request or a clean EOF.
async fn run_worker(ctx: &Context) -> Result<()> {
    let spool = SpoolQueue::new(&ctx.options.spool_path);
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();

    loop {
        let bytes = match protocol::read_frame(&mut stdin).await.context("reading request frame")? {
            Some(bytes) => bytes,
            None => return Ok(()),
        };
        let request = protocol::decode_request(&bytes).context("decoding request")?;
        match request {
            Request::Shutdown => return Ok(()),
            Request::ArchiveGet(params) => {
                let response = handle_archive_get(&spool, &params).await;
                let encoded = protocol::encode_response(&response);
                protocol::write_frame(&mut stdout, &encoded).await.context("writing response frame")?;
            }
        }
    }
}

async fn handle_archive_get(spool: &SpoolQueue, params: &protocol::ArchiveGetParams) -> Response {
    let outcome = match WalSegment::parse(&params.segment_name) {
        Some(seg) => archive_get::fetch_segment_into_spool(seg, &params.candidates, spool).await,
        None => {
            return Response::Error(archiver::error::ArchiveError::protocol(format!(
                "worker received a non-segment name: {}",
                params.segment_name
            )))
        }
    };
    match outcome {
        Ok(archive_get::FetchOutcome::Found { actual_idx, warnings }) => Response::Result { actual_idx: Some(actual_idx), warnings },
        Ok(archive_get::FetchOutcome::NotFound) => Response::Result { actual_idx: None, warnings: vec![] },
        Err(e) => Response::Error(
            e.downcast::<archiver::error::ArchiveError>()
                .unwrap_or_else(|e| archiver::error::ArchiveError::transient_io(e.to_string())),
        ),
    }
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("archive-get: {e}");
            std::process::exit(errno_for(&e))
        }
    }
}

/// Fatal exit codes (§6): any value other than 0 or 1. 2 is used uniformly;
/// the taxonomy in §7 distinguishes error *kinds* for logging/markers, not
/// for the foreground's exit status.
fn errno_for(_e: &anyhow::Error) -> i32 {
    2
}
