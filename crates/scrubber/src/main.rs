//! The scrubber daemon: drains delayed deletes against the catalog and the
//! configured object stores.

use std::{
    fs,
    path::PathBuf,
    sync::Arc,
};

use clap::{
    Parser,
    Subcommand,
};
use cmd_util::logging::{
    init_service_logging,
    init_tool_logging,
};
use runtime::prod::ProdRuntime;
use scrubber::Scrubber;
use store::{
    FilesystemStore,
    HttpStore,
    StoreDispatcher,
    FILESYSTEM_SCHEME,
    HTTPS_SCHEME,
    HTTP_SCHEME,
};

#[derive(Parser)]
#[command(name = "scrubber", about = "Reclaims storage for delayed-deleted images")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to the catalog database.
    #[arg(long, default_value = "registry.sqlite")]
    catalog: PathBuf,

    /// Data directory of the filesystem object store.
    #[arg(long, default_value = "/var/lib/images")]
    datadir: PathBuf,

    /// Keep running, sweeping every scrub interval. Without this a single
    /// sweep is performed and the process exits.
    #[arg(long)]
    daemon: bool,

    /// Seconds between sweeps in daemon mode.
    #[arg(long = "scrub_time")]
    scrub_time: Option<u64>,

    /// Force delayed-delete mode for services sharing this configuration.
    #[arg(long = "delayed_delete")]
    delayed_delete: bool,

    /// Also write logs to this file.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Where to record the daemon pid.
    #[arg(long, default_value = "/var/run/scrubber.pid")]
    pid_file: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scrubber.
    Start,
    /// Signal a running scrubber to stop.
    Stop,
    /// Stop a running scrubber, then run a fresh one.
    Restart,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let _guard = match args.command {
        Command::Stop => init_tool_logging()?,
        Command::Start | Command::Restart => init_service_logging(args.log_file.as_deref())?,
    };

    // Command-line settings become knob overrides before any knob is read.
    if let Some(scrub_time) = args.scrub_time {
        std::env::set_var("SCRUB_TIME_SECS", scrub_time.to_string());
    }
    if args.delayed_delete {
        std::env::set_var("DELAYED_DELETE", "true");
    }

    match args.command {
        Command::Start => start(&args),
        Command::Stop => stop(&args),
        Command::Restart => {
            if let Err(e) = stop(&args) {
                tracing::warn!("No running scrubber to stop: {e}");
            }
            start(&args)
        },
    }
}

fn start(args: &Args) -> anyhow::Result<()> {
    write_pid_file(&args.pid_file)?;

    let tokio = ProdRuntime::init_tokio()?;
    let rt = ProdRuntime::new(&tokio);
    let inner_rt = rt.clone();

    let result = rt.block_on("scrubber", async move {
        let catalog = catalog::CatalogStore::new(inner_rt.clone(), &args.catalog)?;
        let stores = StoreDispatcher::new()
            .register(
                FILESYSTEM_SCHEME,
                Arc::new(FilesystemStore::new_at_path(
                    inner_rt.clone(),
                    args.datadir.clone(),
                )?),
            )
            .register(HTTP_SCHEME, Arc::new(HttpStore::new()))
            .register(HTTPS_SCHEME, Arc::new(HttpStore::new()))
            .with_default(FILESYSTEM_SCHEME);

        if args.daemon {
            let scrubber = Scrubber::start(inner_rt, catalog, stores);
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = sigterm.recv() => {},
            }
            tracing::info!("Shutting down scrubber");
            scrubber.shutdown().await?;
        } else {
            let mut worker = scrubber::ScrubberInner::new(inner_rt, catalog, stores);
            let completed = worker.scrub_cycle().await?;
            tracing::info!("Single sweep finished; scrubbed {completed} images");
        }
        anyhow::Ok(())
    });

    let _ = fs::remove_file(&args.pid_file);
    result
}

fn stop(args: &Args) -> anyhow::Result<()> {
    let pid: i32 = fs::read_to_string(&args.pid_file)?.trim().parse()?;
    // SIGTERM lets the daemon finish its current image before exiting.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    anyhow::ensure!(rc == 0, "Could not signal pid {pid}");
    fs::remove_file(&args.pid_file)?;
    Ok(())
}

fn write_pid_file(pid_file: &PathBuf) -> anyhow::Result<()> {
    if let Some(parent) = pid_file.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(pid_file, std::process::id().to_string())?;
    Ok(())
}
