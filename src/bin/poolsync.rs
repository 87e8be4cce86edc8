use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use poolsync::config::ManifestLoader;
use poolsync::error::SyncError;
use poolsync::method::{CancelToken, SubprocessProtocol};
use poolsync::session::{DownloadSession, RegisterOutcome};

#[derive(Parser)]
#[command(name = "poolsync")]
#[command(about = "Mirror package-repository files into a local pool")]
#[command(version, author)]
struct Cli {
    /// Manifest file (defaults to poolsync.json in the current directory)
    #[arg(long, global = true)]
    manifest: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Fetch all wanted files that are not yet in the pool")]
    Sync(SyncArgs),
    #[command(about = "Report wanted vs. already-present files without fetching")]
    Status,
}

#[derive(Args)]
struct SyncArgs {
    /// Treat checksum conflicts between upstreams as fatal
    #[arg(long)]
    strict: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(sync) = report.downcast_ref::<SyncError>() {
            return ExitCode::from(map_exit_code(sync));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &SyncError) -> u8 {
    match error {
        SyncError::MissingManifest
        | SyncError::ManifestRead(_)
        | SyncError::ManifestParse(_)
        | SyncError::ChecksumConflict { .. } => 2,
        SyncError::ProtocolInit(_)
        | SyncError::BackendOpen { .. }
        | SyncError::Submit { .. }
        | SyncError::Execute(_)
        | SyncError::Cancelled => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Sync(args) => run_sync(cli.manifest.as_deref(), args.strict),
        Commands::Status => run_status(cli.manifest.as_deref()),
    }
}

#[derive(Debug, Default)]
struct RegisterTally {
    added: usize,
    satisfied: usize,
    conflicts: usize,
}

fn register_manifest(
    session: &mut DownloadSession,
    upstreams: &[poolsync::config::ResolvedUpstream],
    strict: bool,
) -> Result<RegisterTally, SyncError> {
    let mut tally = RegisterTally::default();
    for entry in upstreams {
        let upstream = session.add_upstream(&entry.method, entry.config.as_deref());
        for file in &entry.files {
            match session.register_file(
                upstream,
                &file.source,
                file.key.clone(),
                file.digest.clone(),
            ) {
                Ok(RegisterOutcome::Added) => tally.added += 1,
                Ok(RegisterOutcome::AlreadySatisfied) => tally.satisfied += 1,
                Err(err @ SyncError::ChecksumConflict { .. }) => {
                    if strict {
                        return Err(err);
                    }
                    tracing::warn!("{err}, skipping");
                    tally.conflicts += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
    Ok(tally)
}

fn run_sync(manifest: Option<&str>, strict: bool) -> miette::Result<()> {
    let manifest = ManifestLoader::resolve(manifest).map_err(miette::Report::from)?;
    let mut session =
        DownloadSession::open(&manifest.db_dir, &manifest.pool_dir).map_err(miette::Report::from)?;

    let tally = match register_manifest(&mut session, &manifest.upstreams, strict) {
        Ok(tally) => tally,
        Err(err) => {
            let _ = session.close();
            return Err(err.into());
        }
    };

    if session.queued_len() > 0 {
        let outcome = session.run(
            &SubprocessProtocol,
            &manifest.method_dir,
            &CancelToken::new(),
        );
        if let Err(err) = outcome {
            let _ = session.close();
            return Err(err.into());
        }
    }
    session.close().map_err(miette::Report::from)?;

    println!(
        "fetched {} file(s), {} already present, {} conflict(s) skipped",
        tally.added, tally.satisfied, tally.conflicts
    );
    Ok(())
}

fn run_status(manifest: Option<&str>) -> miette::Result<()> {
    let manifest = ManifestLoader::resolve(manifest).map_err(miette::Report::from)?;
    let mut session =
        DownloadSession::open(&manifest.db_dir, &manifest.pool_dir).map_err(miette::Report::from)?;

    let tally = match register_manifest(&mut session, &manifest.upstreams, false) {
        Ok(tally) => tally,
        Err(err) => {
            let _ = session.close();
            return Err(err.into());
        }
    };

    for upstream in session.upstreams() {
        println!(
            "{} ({}): {} file(s) to fetch",
            upstream.method(),
            upstream.config().unwrap_or("-"),
            upstream.queued().len()
        );
    }
    println!(
        "{} wanted, {} already present, {} conflict(s)",
        tally.added, tally.satisfied, tally.conflicts
    );

    session.close().map_err(miette::Report::from)?;
    Ok(())
}
