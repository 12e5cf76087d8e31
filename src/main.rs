use confgate::acme::AcmeSh;
use confgate::certificates::CertificateReconciler;
use confgate::config::Config;
use confgate::db::Database;
use confgate::events::ChangeNotifier;
use confgate::jobs::Orchestrator;
use confgate::models::CertificatePaths;
use confgate::nginx::{NginxApplier, NginxReloader};
use confgate::queue::TaskQueue;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("confgate=debug".parse()?))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.clone();
    let _pid_file = match pid_file_path {
        Some(ref path) => {
            let pid_file = PidFile::create(path)?;
            info!(path = %path.display(), "PID file written and locked");
            Some(pid_file)
        }
        None => None,
    };

    for dir in [
        config.server.data_dir.clone(),
        config.nginx.hosts_dir(),
        config.nginx.upstreams_dir(),
        config.acme.cert_home.clone(),
        config.acme.webroot.clone(),
    ] {
        std::fs::create_dir_all(&dir)
            .map_err(|e| anyhow::anyhow!("Failed to create directory '{}': {}", dir.display(), e))?;
    }
    if let Some(parent) = config.acme.log_file.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db = Arc::new(Database::open(config.server.database_path())?);
    let events = ChangeNotifier::default();
    let paths = CertificatePaths {
        data_dir: config.server.data_dir.clone(),
        cert_home: config.acme.cert_home.clone(),
    };

    let applier = Arc::new(NginxApplier::new(
        db.clone(),
        Arc::new(NginxReloader::new(&config.nginx)),
        events.clone(),
        config.nginx.clone(),
        paths.clone(),
    ));
    let reconciler = Arc::new(CertificateReconciler::new(
        db.clone(),
        Arc::new(AcmeSh::new(config.acme.clone())),
        events,
        paths,
    ));

    let queue = Arc::new(TaskQueue::new(config.queue.capacity));
    queue.start()?;

    let orchestrator = Orchestrator::new(db, queue.clone(), applier, reconciler);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Pending work is enqueued from a task: a backlog larger than the queue
    // would otherwise block the signal loop below
    let startup = orchestrator.clone();
    tokio::spawn(async move {
        if let Err(e) = startup.add_pending_jobs().await {
            error!(error = %format!("{:#}", e), "Failed to enqueue pending work");
        }
    });

    let sweep_handle = orchestrator.spawn_certificate_sweep(config.certificates.sweep_interval(), shutdown_rx);

    // Wait for shutdown signal (Ctrl+C or SIGTERM); SIGHUP re-enqueues pending work
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, enqueueing pending work...");
                    let resync = orchestrator.clone();
                    tokio::spawn(async move {
                        if let Err(e) = resync.add_pending_jobs().await {
                            error!(error = %format!("{:#}", e), "Failed to enqueue pending work");
                        }
                    });
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // The in-flight task always runs to completion; only the sweep is bounded
    let (sweep, queue_stopped) = tokio::join!(
        tokio::time::timeout(Duration::from_secs(5), sweep_handle),
        queue.shutdown()
    );
    if sweep.is_err() {
        warn!("Timed out waiting for the certificate sweep to stop");
    }
    if let Err(e) = queue_stopped {
        warn!(error = %e, "Task queue was not running");
    }

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Non-blocking: a second daemon must fail fast, not wait
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        writeln!(&file, "{}", std::process::id())?;
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;

        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting configuration orchestrator");
    info!(
        data_dir = %config.server.data_dir.display(),
        database = %config.server.database_path().display(),
        "Storage"
    );
    info!(
        conf_dir = %config.nginx.conf_dir.display(),
        binary = %config.nginx.binary,
        reload_args = ?config.nginx.reload_args,
        "Nginx"
    );
    info!(
        script = %config.acme.script,
        cert_home = %config.acme.cert_home.display(),
        webroot = %config.acme.webroot.display(),
        "acme.sh"
    );
    info!(
        queue_capacity = config.queue.capacity,
        sweep_interval_secs = config.certificates.sweep_interval_secs,
        "Orchestration"
    );
}
