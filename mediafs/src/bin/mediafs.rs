use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use mediafs::cache::{self, CacheStore};
use mediafs::control::Refresher;
use mediafs::fetch::{FetchClient, HttpTransport};
use mediafs::nodes::Generation;
use mediafs::scanner::{ScanMode, Scanner};
use mediafs::status::Status;
use mediafs::tree::TreeManager;
use mediafs::{Instance, Settings};
use mediafs_tracing::LogFormat;
use tracing::{info, Level};
use url::Url;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Whether to log in JSON
    #[arg(long, global = true, env = "MEDIAFS_LOG_JSON")]
    json: bool,

    #[arg(long, global = true, env = "MEDIAFS_LOG_LEVEL")]
    log_level: Option<Level>,

    #[command(subcommand)]
    command: Commands,
}

/// Where the catalog comes from, and how it's scanned and cached.
#[derive(Args)]
struct InstanceArgs {
    #[arg(long, env = "MEDIAFS_INSTANCE_NAME", default_value = "default")]
    instance_name: String,

    #[arg(long, env = "MEDIAFS_SERVER_URL")]
    server_url: Url,

    #[arg(long, env = "MEDIAFS_TOKEN", hide_env_values = true)]
    token: String,

    #[arg(
        long,
        env = "MEDIAFS_CACHE_ADDR",
        default_value = "redb:///var/lib/mediafs/cache.redb"
    )]
    cache_addr: String,

    #[arg(long, env = "MEDIAFS_WORKERS", default_value_t = 25)]
    workers: usize,

    /// Pending scan tasks before submitters wait, 0 picks four per worker.
    #[arg(long, env = "MEDIAFS_QUEUE_CAPACITY", default_value_t = 0)]
    queue_capacity: usize,

    #[arg(long, env = "MEDIAFS_TASK_RETRIES", default_value_t = 3)]
    task_retries: u32,

    #[arg(long, env = "MEDIAFS_BACKOFF_BASE_MS", default_value_t = 500)]
    backoff_base_ms: u64,

    #[arg(long, env = "MEDIAFS_BACKOFF_MAX_MS", default_value_t = 30_000)]
    backoff_max_ms: u64,

    /// Consecutive failures before the remote is considered down.
    #[arg(long, env = "MEDIAFS_MAX_FAILURES", default_value_t = 5)]
    max_failures: u32,

    #[arg(long, env = "MEDIAFS_RECONNECT_AFTER_SECS", default_value_t = 30)]
    reconnect_after_secs: u64,

    #[arg(long, env = "MEDIAFS_REQUEST_TIMEOUT_SECS", default_value_t = 60)]
    request_timeout_secs: u64,

    /// Interval of periodic incremental scans, 0 disables them.
    #[arg(long, env = "MEDIAFS_REFRESH_INTERVAL_SECS", default_value_t = 3600)]
    refresh_interval_secs: u64,

    #[arg(long, env = "MEDIAFS_CACHE_TTL_SECS", default_value_t = 86_400)]
    cache_ttl_secs: u64,

    #[arg(long, env = "MEDIAFS_KEEP_RECORDS", default_value_t = 3)]
    keep_records: usize,
}

impl InstanceArgs {
    fn settings(self) -> Settings {
        Settings {
            instance_name: self.instance_name,
            server_url: self.server_url.to_string(),
            token: self.token,
            cache_addr: self.cache_addr,
            workers: self.workers,
            queue_capacity: self.queue_capacity,
            task_retries: self.task_retries,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
            max_failures: self.max_failures,
            reconnect_after: Duration::from_secs(self.reconnect_after_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            refresh_interval: Duration::from_secs(self.refresh_interval_secs),
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            keep_records: self.keep_records,
            ..Default::default()
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Mounts the catalog at the given mountpoint, and keeps it fresh until
    /// interrupted.
    ///
    /// SIGHUP requests an incremental rescan, SIGUSR1 a full one.
    #[cfg(feature = "fuse")]
    Mount {
        #[clap(value_name = "PATH")]
        dest: PathBuf,

        #[command(flatten)]
        instance: InstanceArgs,

        /// Number of FUSE threads to spawn.
        #[arg(long, env = "MEDIAFS_FUSE_THREADS", default_value_t = 4)]
        threads: usize,

        /// Allow other users to access the mount.
        #[arg(long, env = "MEDIAFS_ALLOW_OTHER", default_value_t = false)]
        allow_other: bool,

        /// Also scan on startup if the cached generation is still fresh.
        #[arg(long, env = "MEDIAFS_SCAN_ON_START", default_value_t = true, action = clap::ArgAction::Set)]
        scan_on_start: bool,
    },
    /// Scans the catalog once, persists the result and prints the status as
    /// JSON.
    Scan {
        #[command(flatten)]
        instance: InstanceArgs,

        /// Reuse unchanged sections of the latest cached generation.
        #[arg(long)]
        incremental: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let tracing_handle = mediafs_tracing::TracingBuilder::default()
        .level(cli.log_level.unwrap_or(Level::INFO))
        .format(if cli.json {
            LogFormat::Json
        } else {
            LogFormat::Compact
        })
        .progress(std::io::stderr().is_terminal())
        .build()?;

    match cli.command {
        #[cfg(feature = "fuse")]
        Commands::Mount {
            dest,
            instance,
            threads,
            allow_other,
            scan_on_start,
        } => {
            use mediafs::fs::fuse::{FuseDaemon, MountOptions};
            use tokio::signal::unix::{signal, SignalKind};

            let settings = Settings {
                mount_path: dest,
                fuse_threads: threads,
                allow_other,
                scan_on_start,
                ..instance.settings()
            };
            settings.validate()?;

            let transport = Arc::new(HttpTransport::new(
                &Url::parse(&settings.server_url)?,
                &settings.token,
            )?);
            let backend = cache::from_addr(&settings.cache_addr).await?;

            let mount_options = MountOptions::from(&settings);
            let instance = Instance::start(settings, transport, backend).await?;

            // without anything recovered, there's nothing to mount yet.
            instance.wait_until_ready().await?;

            let fuse_daemon = tokio::task::spawn_blocking({
                let fs = instance.filesystem();
                move || FuseDaemon::mount(fs, &mount_options)
            })
            .await??;

            let mut hangup = signal(SignalKind::hangup())?;
            let mut user_defined1 = signal(SignalKind::user_defined1())?;
            let mut terminate = signal(SignalKind::terminate())?;

            loop {
                tokio::select! {
                    _ = hangup.recv() => instance.request_rescan(ScanMode::Incremental),
                    _ = user_defined1.recv() => instance.request_rescan(ScanMode::Full),
                    _ = terminate.recv() => break,
                    res = tokio::signal::ctrl_c() => {
                        res?;
                        break;
                    }
                }
            }

            info!("interrupted, unmounting");
            tokio::task::spawn_blocking(move || fuse_daemon.unmount()).await??;
            instance.shutdown().await;
        }
        Commands::Scan {
            instance,
            incremental,
        } => {
            let settings = instance.settings();
            settings.validate()?;

            let transport = Arc::new(HttpTransport::new(
                &Url::parse(&settings.server_url)?,
                &settings.token,
            )?);
            let fetch = Arc::new(FetchClient::new(transport, settings.fetch_config()));

            let cache = Arc::new(CacheStore::new(
                cache::from_addr(&settings.cache_addr).await?,
                settings.keep_records,
            ));
            let status = Arc::new(Status::new(cache.backend_name()));
            let tree = Arc::new(TreeManager::new(
                cache.load_latest().await?.unwrap_or_else(Generation::empty),
            ));

            let refresher = Refresher::new(
                Scanner::new(fetch.clone(), settings.scan_config()),
                cache,
                tree,
                status.clone(),
            );
            let mode = if incremental {
                ScanMode::Incremental
            } else {
                ScanMode::Full
            };
            let generation = refresher.run_pass(mode).await?;

            let snapshot = status.snapshot(
                generation.sequence(),
                generation.node_count(),
                fetch.connection(),
            );
            writeln!(
                tracing_handle.stdout(),
                "{}",
                serde_json::to_string_pretty(&snapshot)?
            )?;
        }
    };
    Ok(())
}
