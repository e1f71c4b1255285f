use anyhow::Result;
use clap::{Parser, Subcommand};
use nanoclaw::channels::{Channel, CliChannel};
use nanoclaw::config::{Config, MAIN_GROUP_FOLDER};
use nanoclaw::container::{ContainerRunner, ContainerRuntime};
use nanoclaw::ipc::IpcWatcher;
use nanoclaw::queue::GroupQueue;
use nanoclaw::store::{now_timestamp, GroupConfig, RegisteredGroup, Store};
use nanoclaw::supervisor::Supervisor;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "nanoclaw", about = "Chat-driven AI agent supervisor")]
struct Cli {
    /// Root data directory (config, database, IPC drop dirs).
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the supervisor daemon (default).
    Run,
    /// Check the environment: container runtime, store, credentials.
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let cli = Cli::parse();
    let config = Config::load_or_init(&cli.data_dir)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(Arc::new(config)).await,
        Commands::Doctor => doctor(&config).await,
    }
}

async fn run(config: Arc<Config>) -> Result<()> {
    // Both are fatal at startup: without the store or a container runtime the
    // supervisor cannot make progress.
    let store = Arc::new(Store::open(&config.db_path())?);
    let runtime = Arc::new(ContainerRuntime::detect()?);
    runtime.verify().await?;

    match runtime.cleanup_stale().await {
        Ok(0) => {}
        Ok(count) => tracing::info!(count, "removed stale agent containers"),
        Err(error) => tracing::warn!(%error, "stale container cleanup failed"),
    }

    ensure_main_group(&config, &store)?;

    let queue = GroupQueue::new(config.container.max_concurrent, Some(Arc::clone(&runtime)));
    let channel: Arc<dyn Channel> = Arc::new(CliChannel::new(&config.main_channel_id));
    let runner = Arc::new(ContainerRunner::new(
        Arc::clone(&runtime),
        Arc::clone(&config),
        Arc::clone(&store),
    ));
    let supervisor = Supervisor::new(
        Arc::clone(&config),
        Arc::clone(&store),
        Arc::clone(&queue),
        Arc::clone(&channel),
        runner,
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));

    // Recovery runs before the poll loop so nothing slips through the window
    // between the global cursor and per-channel processing.
    supervisor.startup_recovery()?;

    let (event_tx, event_rx) = tokio::sync::mpsc::channel(256);
    {
        let channel = Arc::clone(&channel);
        tokio::spawn(async move {
            if let Err(error) = channel.listen(event_tx).await {
                tracing::error!(%error, "channel listener stopped");
            }
        });
    }
    {
        let supervisor = Arc::clone(&supervisor);
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            supervisor.run_intake(event_rx, shutdown).await;
        });
    }
    tokio::spawn(Arc::clone(&supervisor).run_poll_loop(Arc::clone(&shutdown)));
    tokio::spawn(nanoclaw::scheduler::run(
        Arc::clone(&store),
        Arc::clone(&queue),
        Arc::clone(&supervisor),
        config.tz(),
        Duration::from_secs(config.intervals.scheduler_secs),
        Arc::clone(&shutdown),
    ));
    {
        let refresh_supervisor = Arc::clone(&supervisor);
        let watcher = Arc::new(IpcWatcher::new(
            Arc::clone(&config),
            Arc::clone(&store),
            Arc::clone(&channel),
            Arc::new(move || {
                if let Err(error) = refresh_supervisor.refresh_groups() {
                    tracing::warn!(%error, "group refresh failed");
                }
            }),
        ));
        tokio::spawn(watcher.run(Arc::clone(&shutdown)));
    }

    tracing::info!(
        assistant = %config.assistant_name,
        main_channel = %config.main_channel_id,
        "nanoclaw is up"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    shutdown.store(true, Ordering::SeqCst);
    queue
        .shutdown(Duration::from_millis(config.intervals.shutdown_grace_ms))
        .await;
    Ok(())
}

/// The privileged main group must exist before anything can be registered
/// through it; bootstrap it on first boot.
fn ensure_main_group(config: &Config, store: &Store) -> Result<()> {
    if store.get_group(&config.main_channel_id)?.is_some() {
        return Ok(());
    }
    store.register_group(&RegisteredGroup {
        channel_id: config.main_channel_id.clone(),
        config: GroupConfig {
            name: "Main".into(),
            folder: MAIN_GROUP_FOLDER.into(),
            trigger: None,
            requires_trigger: false,
            added_at: now_timestamp(),
            container: None,
        },
    })?;
    tracing::info!(channel = %config.main_channel_id, "registered main group");
    Ok(())
}

async fn doctor(config: &Config) -> Result<()> {
    println!("nanoclaw doctor");
    println!();

    match ContainerRuntime::detect() {
        Ok(runtime) => {
            println!("  ✓ container runtime: {}", runtime.program().display());
            match runtime.verify().await {
                Ok(()) => println!("  ✓ runtime daemon healthy"),
                Err(error) => println!("  ✗ runtime daemon: {error}"),
            }
        }
        Err(error) => println!("  ✗ container runtime: {error}"),
    }

    match Store::open(&config.db_path()) {
        Ok(_) => println!("  ✓ store: {}", config.db_path().display()),
        Err(error) => println!("  ✗ store: {error}"),
    }

    if config.gemini_api_key().is_ok() {
        println!("  ✓ GEMINI_API_KEY is set");
    } else {
        println!("  ✗ GEMINI_API_KEY is not set");
    }
    println!("  · model: {}", config.gemini.model);
    println!("  · timezone: {}", config.timezone);
    println!(
        "  · max concurrent containers: {}",
        config.container.max_concurrent
    );

    Ok(())
}
