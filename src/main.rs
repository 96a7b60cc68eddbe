use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use course_podcaster::batch::{discover, BatchReport};
use course_podcaster::cli::{menu, LogFormat};
use course_podcaster::{
    output, utils, BatchCoordinator, Cli, Collaborators, Commands, Config, OutputFormat,
    PipelineRunner, StageExecutor, StatusStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = Config::load(cli.config.as_deref()).await?;
    let options = Options {
        config_path: cli.config.clone(),
        quiet: cli.quiet,
        format: cli.format,
    };

    // Ctrl-C stops the batch between lessons
    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Interrupt received, finishing the current lesson...");
                cancel.store(true, Ordering::SeqCst);
            }
        });
    }

    match cli.command {
        Commands::Menu => {
            let term = console::Term::stdout();
            let mut last_dir: Option<PathBuf> = None;
            while let Some(command) = menu::prompt(&term, last_dir.as_ref())? {
                if let Commands::Run { dir, .. } | Commands::Stage { dir, .. } | Commands::Status { dir } =
                    &command
                {
                    last_dir = Some(dir.clone());
                }
                // A failing action returns to the menu instead of exiting
                if let Err(e) = execute(command, &config, &options, cancel.clone()).await {
                    eprintln!("Error: {:#}", e);
                }
                cancel.store(false, Ordering::SeqCst);
            }
        }
        command => execute(command, &config, &options, cancel).await?,
    }

    Ok(())
}

/// Global flags shared by every command
struct Options {
    config_path: Option<PathBuf>,
    quiet: bool,
    format: OutputFormat,
}

fn init_tracing(cli: &Cli) {
    let default = if cli.verbose {
        "course_podcaster=debug"
    } else {
        "course_podcaster=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into());
    let registry = tracing_subscriber::registry().with(filter);

    match cli.log_format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

async fn execute(
    command: Commands,
    config: &Config,
    options: &Options,
    cancel: Arc<AtomicBool>,
) -> Result<()> {
    match command {
        Commands::Run { dir, until } => {
            let (root, items) = lessons(&dir, config)?;
            warn_missing_dependencies().await;
            let coordinator = coordinator(config, options.quiet, cancel).await?;
            let report = coordinator.run_batch(&items, until).await?;
            print_report(&report, &root, options.format)?;
        }
        Commands::Stage { stage, dir } => {
            let (root, items) = lessons(&dir, config)?;
            warn_missing_dependencies().await;
            let coordinator = coordinator(config, options.quiet, cancel).await?;
            let report = coordinator
                .run_batch_scoped(&items, &stage.requirements())
                .await?;
            print_report(&report, &root, options.format)?;
        }
        Commands::Status { dir } => {
            let store = StatusStore::new();
            let (root, items) = lessons(&dir, config)?;
            let descriptors = items
                .iter()
                .map(|item| store.inspect(item))
                .collect::<Result<Vec<_>, _>>()?;
            print!("{}", output::render_status(&descriptors, &root, options.format)?);
        }
        Commands::Reset { dir, stage } => {
            let store = StatusStore::new();
            let (root, items) = lessons(&dir, config)?;
            let reset = items
                .iter()
                .map(|item| store.reset_stages(item, &stage))
                .collect::<Result<Vec<_>, _>>()?;
            print!("{}", output::render_reset(&reset, &root, options.format)?);
        }
        Commands::Config { show } => {
            let path = Config::resolve_path(options.config_path.as_deref())?;
            if show {
                println!("# {}", path.display());
                print!("{}", config.display()?);
            } else {
                println!("Configuration file: {}", path.display());
                println!("Edit it and run `podcaster config --show` to check the result.");
            }
        }
        Commands::Menu => anyhow::bail!("Menu cannot be nested"),
    }

    Ok(())
}

/// Absolute course root and the lessons under it
fn lessons(dir: &Path, config: &Config) -> Result<(PathBuf, Vec<PathBuf>)> {
    let discovery = discover(dir, &config.discovery, &config.pipeline.workspace_dir)?;
    if discovery.items.is_empty() {
        tracing::warn!("No lesson videos found under {}", dir.display());
    }
    Ok((discovery.root, discovery.items))
}

async fn coordinator(config: &Config, quiet: bool, cancel: Arc<AtomicBool>) -> Result<BatchCoordinator> {
    let collaborators = Collaborators::from_config(config).await;
    let executor = StageExecutor::new(config.clone(), collaborators)
        .context("Failed to set up the pipeline")?;
    let runner = PipelineRunner::new(config, executor);

    Ok(BatchCoordinator::new(runner)
        .with_cancel_flag(cancel)
        .with_progress(!quiet))
}

fn print_report(report: &BatchReport, root: &Path, format: OutputFormat) -> Result<()> {
    print!("{}", output::render_report(report, root, format)?);
    Ok(())
}

async fn warn_missing_dependencies() {
    let missing_deps = utils::check_dependencies().await;
    if !missing_deps.is_empty() {
        eprintln!("⚠️  Dependency check warnings:");
        for dep in missing_deps {
            eprintln!("   • {}", dep);
        }
        eprintln!("   (Continuing anyway - stages needing them will fail)");
    }
}
