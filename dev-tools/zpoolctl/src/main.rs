// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Inspect and manage ZFS storage pools through the `zpool` command.

use anyhow::{bail, Context, Result};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use serde::Serialize;
use slog::{debug, o, Drain, Level, Logger};
use slog_term::{FullFormat, TermDecorator};
use std::collections::BTreeMap;
use zpool_utils::config::ZpoolConfig;
use zpool_utils::host::HostExecutor;
use zpool_utils::zpool::{ByteUnits, Zpool, ZpoolName};

/// Inspect and manage ZFS storage pools.
///
/// Results are printed to stdout as JSON. Logs go to stderr.
#[derive(Parser)]
#[command(version)]
struct Args {
    /// TOML file describing how to run `zpool`
    #[clap(long, env = "ZPOOLCTL_CONFIG")]
    config: Option<Utf8PathBuf>,

    /// Minimum level of log messages to print
    #[clap(long, default_value = "warning", value_parser = parse_level)]
    log_level: Level,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Describe every pool on the system
    List,

    /// Describe a single pool
    Get { name: ZpoolName },

    /// Create a pool
    Create {
        /// Pool property to set at creation time, as `key=value`
        #[clap(short = 'o', long = "property", value_parser = parse_property)]
        properties: Vec<(String, String)>,

        name: ZpoolName,

        /// Vdev specification passed through to `zpool create`, such as
        /// `mirror sdb sdc`
        #[clap(required = true, num_args = 1.., allow_hyphen_values = true)]
        vdevs: Vec<String>,
    },

    /// Destroy a pool
    Destroy { name: ZpoolName },

    /// Report pool health and the vdev tree
    Status {
        /// Only report this pool (default: all pools)
        name: Option<ZpoolName>,

        /// Print space values as exact byte counts
        #[clap(long)]
        exact_bytes: bool,
    },
}

fn parse_level(s: &str) -> Result<Level> {
    let level = match s.to_ascii_lowercase().as_str() {
        "critical" | "crit" => Level::Critical,
        "error" => Level::Error,
        "warn" | "warning" => Level::Warning,
        "info" => Level::Info,
        "debug" => Level::Debug,
        "trace" => Level::Trace,
        _ => bail!("unknown log level '{s}'"),
    };
    Ok(level)
}

fn parse_property(s: &str) -> Result<(String, String)> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => {
            Ok((key.to_string(), value.to_string()))
        }
        _ => bail!("expected `key=value`, found '{s}'"),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .context("failed to serialize output")?;
    println!("{json}");
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let decorator = TermDecorator::new().stderr().build();
    let drain = FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = slog::LevelFilter::new(drain, args.log_level).fuse();
    let log = Logger::root(drain, o!("component" => "zpoolctl"));

    let config = match &args.config {
        Some(path) => ZpoolConfig::from_file(path)
            .with_context(|| format!("failed to load config from {path}"))?,
        None => ZpoolConfig::default(),
    };
    let executor = HostExecutor::new(log.new(o!("component" => "executor")));
    let zpool = Zpool::new(executor.as_executor(), config);
    debug!(
        log,
        "using zpool config";
        "binary" => %zpool.config().binary,
        "privilege_wrapper" => ?zpool.config().privilege_wrapper,
    );

    match args.command {
        Cmd::List => print_json(&zpool.list()?),
        Cmd::Get { name } => print_json(&zpool.get_info(&name)?),
        Cmd::Create { properties, name, vdevs } => {
            let properties: BTreeMap<String, String> =
                properties.into_iter().collect();
            let name = zpool.create(&name, &properties, vdevs.as_slice())?;
            print_json(&zpool.get_info(&name)?)
        }
        Cmd::Destroy { name } => {
            zpool.destroy(&name)?;
            debug!(log, "destroyed pool"; "name" => %name);
            Ok(())
        }
        Cmd::Status { name, exact_bytes } => {
            let units =
                if exact_bytes { ByteUnits::Exact } else { ByteUnits::Rounded };
            match name {
                Some(name) => print_json(&zpool.status(&name, units)?),
                None => print_json(&zpool.status_all(units)?),
            }
        }
    }
}
