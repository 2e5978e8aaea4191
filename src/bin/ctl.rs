//! swiftnbd control tool
//!
//! Container management: list, setup, lock, unlock, download, delete.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use swiftnbd::cache::Cache;
use swiftnbd::client::{ObjectStore, StoreError, SwiftClient};
use swiftnbd::config::Secrets;
use swiftnbd::stats::ExportStats;
use swiftnbd::storage::SwiftStorage;
use swiftnbd::{logging, meta, DEFAULT_AUTH_URL, DEFAULT_OBJECT_SIZE, DEFAULT_SECRETS_FILE};

// default object listing page served by swift
const LISTING_LIMIT: usize = 10000;

#[derive(Parser, Debug)]
#[command(name = "swiftnbd-ctl", version, about = "swiftnbd control tool")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// File containing the export credentials
    #[arg(long = "secrets", global = true, default_value = DEFAULT_SECRETS_FILE)]
    secrets_file: PathBuf,

    /// Default authentication URL
    #[arg(short = 'a', long = "auth-url", global = true, default_value = DEFAULT_AUTH_URL)]
    authurl: String,

    /// Enable verbose logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List all containers and their information
    List {
        /// Write simplified output to stdout
        #[arg(short = 's', long = "simple-output")]
        simple: bool,
    },
    /// Setup a container to be used by the server
    Setup {
        /// Container to setup
        container: String,
        /// Number of objects
        objects: u64,
        /// Object size in bytes
        #[arg(long = "object-size", default_value_t = DEFAULT_OBJECT_SIZE)]
        object_size: u64,
        /// Force operation
        #[arg(short = 'f', long)]
        force: bool,
    },
    /// Lock a container
    Lock {
        /// Container to lock
        container: String,
    },
    /// Unlock a container
    Unlock {
        /// Container to unlock
        container: String,
    },
    /// Download a container as a raw image
    Download {
        /// Container to download
        container: String,
        /// Local file to store the image
        image: PathBuf,
        /// Don't show the progress bar
        #[arg(short = 'q', long)]
        quiet: bool,
    },
    /// Delete a container
    Delete {
        /// Container to delete
        container: String,
    },
}

fn main() {
    let args = Args::parse();

    if let Err(err) = logging::init(args.verbose, false, None) {
        eprintln!("Failed to set up logging: {}", err);
        process::exit(1);
    }

    let secrets = match Secrets::load(&args.secrets_file, &args.authurl) {
        Ok(secrets) => secrets,
        Err(err) => {
            log::error!("Failed to load secrets: {}", err);
            process::exit(1);
        }
    };

    let code = match &args.command {
        Command::List { simple } => do_list(&secrets, *simple),
        Command::Setup {
            container,
            objects,
            object_size,
            force,
        } => do_setup(&secrets, container, *objects, *object_size, *force),
        Command::Lock { container } => do_lock(&secrets, container),
        Command::Unlock { container } => do_unlock(&secrets, container),
        Command::Download {
            container,
            image,
            quiet,
        } => do_download(&secrets, container, image, *quiet),
        Command::Delete { container } => do_delete(&secrets, container),
    };
    process::exit(code);
}

/// Connect to a container, returning the client and its swiftnbd metadata.
/// With `create` set, a missing or un-setup container is acceptable and
/// yields empty metadata.
fn setup_client(
    secrets: &Secrets,
    container: &str,
    create: bool,
) -> Option<(SwiftClient, HashMap<String, String>)> {
    let values = match secrets.get(container) {
        Ok(values) => values,
        Err(err) => {
            log::error!("{}", err);
            return None;
        }
    };

    let client = match SwiftClient::new(&values.authurl, &values.username, &values.password) {
        Ok(client) => client,
        Err(err) => {
            log::error!("{}", err);
            return None;
        }
    };

    let headers = match client.get_container(container, None, None) {
        Ok((headers, _)) => headers,
        Err(StoreError::NotFound) => {
            if create {
                log::warn!("{} doesn't exist, will be created", container);
                return Some((client, HashMap::new()));
            }
            log::error!("{} doesn't exist", container);
            return None;
        }
        Err(err) => {
            log::error!("{}", err);
            return None;
        }
    };

    let meta = meta::get_meta(&headers);
    if meta.is_empty() && !create {
        log::error!("{} hasn't been setup to be used with swiftnbd", container);
        return None;
    }
    Some((client, meta))
}

fn do_list(secrets: &Secrets, simple: bool) -> i32 {
    for (container, values) in secrets.iter() {
        let client = match SwiftClient::new(&values.authurl, &values.username, &values.password) {
            Ok(client) => client,
            Err(err) => {
                log::error!("{}: {}", container, err);
                continue;
            }
        };

        let headers = match client.get_container(container, None, None) {
            Ok((headers, _)) => headers,
            Err(StoreError::NotFound) => {
                output(simple, &format!("{} doesn't exist", container));
                continue;
            }
            Err(err) => {
                log::error!("{}: {}", container, err);
                continue;
            }
        };

        let meta = meta::get_meta(&headers);
        if meta.is_empty() {
            output(simple, &format!("{} is not a swiftnbd container", container));
            continue;
        }

        let lock = match meta.get("client") {
            Some(holder) if !holder.is_empty() => format!("locked by {}", holder),
            _ => "unlocked".to_string(),
        };
        output(
            simple,
            &format!(
                "{} objects={} size={} (version={}, {})",
                container,
                meta.get("objects").map(String::as_str).unwrap_or(""),
                meta.get("object-size").map(String::as_str).unwrap_or(""),
                meta.get("version").map(String::as_str).unwrap_or(""),
                lock
            ),
        );
    }
    0
}

fn output(simple: bool, line: &str) {
    if simple {
        println!("{}", line);
    } else {
        log::info!("{}", line);
    }
}

fn do_setup(secrets: &Secrets, container: &str, objects: u64, object_size: u64, force: bool) -> i32 {
    log::debug!("setting up {}", container);

    let (client, meta) = match setup_client(secrets, container, true) {
        Some(found) => found,
        None => return 1,
    };
    if !meta.is_empty() && !force {
        log::error!("{} has already been setup", container);
        return 1;
    }

    let mut new_meta = HashMap::new();
    new_meta.insert("version".to_string(), meta::DISK_VERSION.to_string());
    new_meta.insert("objects".to_string(), objects.to_string());
    new_meta.insert("object-size".to_string(), object_size.to_string());
    new_meta.insert("client".to_string(), String::new());
    new_meta.insert("last".to_string(), String::new());

    if let Err(err) = client.put_container(container, &meta::set_meta(&new_meta)) {
        log::error!("{}", err);
        return 1;
    }

    log::info!("Done, {}", container);
    0
}

fn do_lock(secrets: &Secrets, container: &str) -> i32 {
    log::debug!("locking {}", container);

    let (client, mut meta) = match setup_client(secrets, container, false) {
        Some(found) => found,
        None => return 1,
    };
    if let Some(holder) = meta.get("client") {
        log::warn!("{} is already locked: {}", container, holder);
        return 1;
    }

    meta.insert("client".to_string(), meta::lock_value("ctl"));
    if let Err(err) = client.put_container(container, &meta::set_meta(&meta)) {
        log::error!("{}", err);
        return 1;
    }

    log::info!("Done, {} is locked", container);
    0
}

fn do_unlock(secrets: &Secrets, container: &str) -> i32 {
    log::debug!("unlocking {}", container);

    let (client, mut meta) = match setup_client(secrets, container, false) {
        Some(found) => found,
        None => return 1,
    };
    let holder = match meta.get("client") {
        Some(holder) => holder.clone(),
        None => {
            log::warn!("{} is not locked, nothing to do", container);
            return 1;
        }
    };
    log::info!("{} lock is: {}", container, holder);

    meta.insert("last".to_string(), holder);
    meta.insert("client".to_string(), String::new());
    if let Err(err) = client.put_container(container, &meta::set_meta(&meta)) {
        log::error!("{}", err);
        return 1;
    }

    log::info!("Done, {} is unlocked", container);
    0
}

fn do_download(secrets: &Secrets, container: &str, image: &Path, quiet: bool) -> i32 {
    log::debug!("downloading {}", container);

    let (client, meta) = match setup_client(secrets, container, false) {
        Some(found) => found,
        None => return 1,
    };
    if meta.get("client").is_some() {
        log::error!(
            "{} is locked, downloading a container in use is unreliable",
            container
        );
        return 1;
    }

    let (object_size, objects) = match meta::export_geometry(&meta) {
        Some(geometry) => geometry,
        None => {
            log::error!("{} doesn't appear to be correct", container);
            return 1;
        }
    };

    let cache = Cache::new(((1024 * 1024) / object_size).max(1) as usize);
    let stats = Arc::new(ExportStats::new(container, object_size, cache.limit()));
    let mut store = SwiftStorage::new(client, container, object_size, objects, cache, false, stats);

    if let Err(err) = store.lock("ctl-download") {
        log::error!("{}", err);
        return 1;
    }

    let result = download_image(&mut store, image, quiet, object_size, objects);

    if let Err(err) = store.unlock() {
        log::warn!("Failed to unlock {}: {}", container, err);
    }

    match result {
        Ok(size) => {
            if !quiet {
                println!();
            }
            log::info!("Done, {} bytes written", size);
            0
        }
        Err(err) => {
            log::error!("{}", err);
            1
        }
    }
}

fn download_image(
    store: &mut SwiftStorage<SwiftClient>,
    image: &Path,
    quiet: bool,
    object_size: u64,
    objects: u64,
) -> anyhow::Result<u64> {
    let mut file = File::create(image)?;
    let mut size = 0u64;

    loop {
        let data = store.read(object_size)?;
        if data.is_empty() {
            break;
        }
        file.write_all(&data)?;
        size += data.len() as u64;

        if !quiet {
            print!(
                "\rDownloading {} [{:02}%]",
                store.container(),
                100 * size / (objects * object_size)
            );
            let _ = std::io::stdout().flush();
        }
    }

    Ok(size)
}

fn do_delete(secrets: &Secrets, container: &str) -> i32 {
    log::debug!("deleting {}", container);

    let (client, meta) = match setup_client(secrets, container, false) {
        Some(found) => found,
        None => return 1,
    };
    if meta.get("client").is_some() {
        log::error!("{} is locked", container);
        return 1;
    }

    let mut marker: Option<String> = None;
    loop {
        let (_, objects) =
            match client.get_container(container, Some(LISTING_LIMIT), marker.as_deref()) {
                Ok(listing) => listing,
                Err(err) => {
                    log::error!("{}", err);
                    return 1;
                }
            };

        for name in &objects {
            if let Err(err) = client.delete_object(container, name) {
                log::error!("Failed to delete {}: {}", name, err);
                return 1;
            }
        }

        if objects.len() < LISTING_LIMIT {
            break;
        }
        marker = objects.last().cloned();
        log::debug!("More than {} objects, marker={:?}", LISTING_LIMIT, marker);
    }

    if let Err(err) = client.delete_container(container) {
        log::error!("Failed to delete {}: {}", container, err);
        return 1;
    }

    log::info!("Done, {} has been deleted", container);
    0
}
