//! swiftnbd server binary
//!
//! Publishes every set-up container in the secrets file as an NBD export.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;

use swiftnbd::cache::Cache;
use swiftnbd::client::{ObjectStore, StoreError, SwiftClient};
use swiftnbd::config::Secrets;
use swiftnbd::nbd::server::{Export, NbdServer};
use swiftnbd::stats::{ExportStats, StatsReporter, STATS_DELAY};
use swiftnbd::storage::SwiftStorage;
use swiftnbd::{logging, meta, DEFAULT_AUTH_URL, DEFAULT_SECRETS_FILE};

#[derive(Parser, Debug)]
#[command(
    name = "swiftnbd-server",
    version,
    about = "NBD server for OpenStack Object Storage (Swift)"
)]
struct Args {
    /// File containing the export credentials
    #[arg(long = "secrets", default_value = DEFAULT_SECRETS_FILE)]
    secrets_file: PathBuf,

    /// Default authentication URL
    #[arg(short = 'a', long = "auth-url", default_value = DEFAULT_AUTH_URL)]
    authurl: String,

    /// Bind address
    #[arg(short = 'b', long = "bind-address", default_value = "127.0.0.1")]
    bind_address: String,

    /// Bind port
    #[arg(short = 'p', long = "bind-port", default_value_t = 10809)]
    bind_port: u16,

    /// Cache memory limit in MB
    #[arg(short = 'c', long = "cache-limit", default_value_t = 64)]
    cache_limit: u64,

    /// Log into the provided file
    #[arg(short = 'l', long = "log-file")]
    log_file: Option<PathBuf>,

    /// Log to the system logger (local0)
    #[arg(long)]
    syslog: bool,

    /// Don't detach from terminal (foreground mode)
    #[arg(short = 'f', long)]
    foreground: bool,

    /// Filename to store the PID
    #[arg(long = "pid-file", default_value = "/tmp/swiftnbd.pid")]
    pid_file: PathBuf,

    /// Enable verbose logging
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    if args.cache_limit < 1 {
        eprintln!("Cache limit can't be less than 1MB");
        process::exit(1);
    }

    if let Err(err) = logging::init(args.verbose, args.syslog, args.log_file.as_deref()) {
        eprintln!("Failed to set up logging: {}", err);
        process::exit(1);
    }

    if let Err(err) = run(args) {
        log::error!("{:#}", err);
        process::exit(1);
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    if args.pid_file.is_file() {
        bail!(
            "{} found: is the server already running?",
            args.pid_file.display()
        );
    }

    let secrets = Secrets::load(&args.secrets_file, &args.authurl).with_context(|| {
        format!(
            "failed to load secrets from {}",
            args.secrets_file.display()
        )
    })?;

    let cache_bytes = args.cache_limit * 1024 * 1024;
    let exports = build_exports(&secrets, cache_bytes)?;
    if exports.is_empty() {
        log::warn!("no exports available");
    }

    if !args.foreground {
        match fork::daemon(false, false) {
            Ok(fork::Fork::Child) => {}
            Ok(fork::Fork::Parent(_)) => process::exit(0),
            Err(errno) => bail!("failed to daemonize: errno {}", errno),
        }
    }

    let mut pid_file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&args.pid_file)
        .with_context(|| format!("failed to create the pidfile {}", args.pid_file.display()))?;
    writeln!(pid_file, "{}", process::id())?;

    let stop = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGTERM, signal_hook::consts::SIGINT] {
        signal_hook::flag::register(signal, Arc::clone(&stop))
            .context("failed to install signal handlers")?;
    }

    let stats = exports
        .values()
        .map(|export| Arc::clone(&export.stats))
        .collect();
    let reporter = StatsReporter::new(
        stats,
        Duration::from_secs(STATS_DELAY),
        Arc::clone(&stop),
    )
    .spawn();

    let addr = format!("{}:{}", args.bind_address, args.bind_port);
    log::info!("Starting to serve on {}", addr);

    let server = NbdServer::new(&addr, exports, Arc::clone(&stop));
    let served = server.run();

    let _ = reporter.join();
    let _ = fs::remove_file(&args.pid_file);
    served.context("server error")?;

    log::info!("Exiting...");
    Ok(())
}

/// Build one storage per set-up container in the secrets file. Containers
/// that are missing or not set up are skipped; transport errors abort
/// startup.
fn build_exports(
    secrets: &Secrets,
    cache_bytes: u64,
) -> anyhow::Result<HashMap<String, Export<SwiftClient>>> {
    let mut exports = HashMap::new();

    for (container, values) in secrets.iter() {
        let client = SwiftClient::new(&values.authurl, &values.username, &values.password)?;

        let headers = match client.get_container(container, None, None) {
            Ok((headers, _)) => headers,
            Err(StoreError::NotFound) => {
                log::warn!("{} doesn't exist, skipping", container);
                continue;
            }
            Err(err) => bail!("{}: {}", container, err),
        };

        let meta = meta::get_meta(&headers);
        if meta.is_empty() {
            log::warn!("{} doesn't appear to be setup, skipping", container);
            continue;
        }
        log::debug!("{} meta: {:?}", container, meta);

        let (object_size, objects) = meta::export_geometry(&meta)
            .with_context(|| format!("{} doesn't appear to be correct", container))?;

        let version = meta.get("version").map(String::as_str).unwrap_or("");
        if !meta::version_compatible(version) {
            log::error!(
                "{}: disk version {} is not supported, skipping",
                container,
                version
            );
            continue;
        }
        if version != meta::DISK_VERSION {
            log::warn!(
                "Version mismatch {} != {} in {}",
                version,
                meta::DISK_VERSION,
                container
            );
        }

        let cache = Cache::new((cache_bytes / object_size).max(1) as usize);
        let stats = Arc::new(ExportStats::new(container, object_size, cache.limit()));
        let storage = SwiftStorage::new(
            client,
            container,
            object_size,
            objects,
            cache,
            values.read_only,
            Arc::clone(&stats),
        );

        exports.insert(
            container.to_string(),
            Export {
                storage: Mutex::new(storage),
                stats,
            },
        );
    }

    Ok(exports)
}
