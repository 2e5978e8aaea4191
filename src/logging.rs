//! Log wiring shared by the server and control binaries.

use std::fs::OpenOptions;
use std::path::Path;

use env_logger::{Builder, Env, Target};
use log::LevelFilter;

/// Initialize the global logger.
///
/// `verbose` lowers the default level to debug. With `use_syslog` records go
/// to the system logger (facility local0); otherwise they go to stderr, or
/// to `log_file` when one is given.
pub fn init(verbose: bool, use_syslog: bool, log_file: Option<&Path>) -> anyhow::Result<()> {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    if use_syslog {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_LOCAL0,
            hostname: None,
            process: "swiftnbd".to_string(),
            pid: std::process::id(),
        };
        let logger = syslog::unix(formatter).map_err(|err| anyhow::anyhow!("syslog: {}", err))?;
        log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))?;
        log::set_max_level(level);
    } else {
        let mut builder = Builder::from_env(
            Env::default().default_filter_or(if verbose { "debug" } else { "info" }),
        );
        if let Some(path) = log_file {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder.target(Target::Pipe(Box::new(file)));
        }
        builder.init();
    }

    if verbose {
        log::debug!("Verbose log enabled");
    }
    Ok(())
}
