use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use odyssey_adapters::FixtureSource;
use odyssey_core::RunType;
use odyssey_sync::{connect_store, dry_run, live_source, run_once, RunResult, SyncConfig};

#[derive(Debug, Parser)]
#[command(name = "odyssey")]
#[command(about = "Mirror subreddit comment trees into a versioned store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every thread and reconcile it into the store.
    Sync {
        #[arg(long, default_value = "scheduled")]
        run_type: RunType,
    },
    /// Walk the source end to end and print counts; writes nothing.
    DryRun {
        #[arg(long)]
        thread_limit: Option<usize>,
    },
    /// Reconcile an archived snapshot bundle into the store.
    Replay {
        #[arg(long)]
        bundle: PathBuf,
        #[arg(long, default_value = "initial")]
        run_type: RunType,
    },
    /// Apply database migrations.
    Migrate,
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("odyssey: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = SyncConfig::from_env();
    let command = cli.command.unwrap_or(Commands::Sync {
        run_type: RunType::Scheduled,
    });

    match command {
        Commands::Sync { run_type } => {
            let source = live_source(&config)?;
            let store = connect_store(&config).await?;
            let result = run_once(&source, &store, run_type, &config.run_options()).await;
            print_summary(&result);
            result.into_result()?;
        }
        Commands::DryRun { thread_limit } => {
            let source = live_source(&config)?;
            let report = dry_run(&source, thread_limit.or(config.thread_limit), &config.retry_policy()).await?;
            println!("threads_found={}", report.threads_found);
            println!("threads_with_comments={}", report.threads_with_comments);
            println!("comments_found={}", report.comments_found);
        }
        Commands::Replay { bundle, run_type } => {
            let source = FixtureSource::from_path(&bundle)
                .with_context(|| format!("loading bundle {}", bundle.display()))?;
            let store = connect_store(&config).await?;
            let mut options = config.run_options();
            options.archive = None;
            let result = run_once(&source, &store, run_type, &options).await;
            print_summary(&result);
            result.into_result()?;
        }
        Commands::Migrate => {
            let store = connect_store(&config).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}

fn print_summary(result: &RunResult) {
    let Some(apply) = result.apply else {
        return;
    };
    println!(
        "{} run complete: threads={} comments={} inserted={} demoted={} pointers={}",
        result.run_type,
        result.threads_found,
        result.number_of_comments_processed,
        apply.versions_inserted,
        apply.versions_demoted,
        apply.pointers_bulk + apply.pointers_fallback,
    );
}
