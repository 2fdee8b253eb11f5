// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Utilities for managing Zpools.

use crate::config::{ZpoolConfig, ZPOOL_LOCALE};
use crate::host::{BoxedExecutor, ExecutionError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::num::ParseIntError;
use std::process::Command;
use std::str::FromStr;

mod status;

pub use status::{
    parse_status_output, OutputVersion, PoolStatus, StatusOutput, Vdev,
    VdevWalk,
};

/// Properties requested from `zpool list` to describe a pool, in column order.
pub const POOL_INFO_COLUMNS: [&str; 10] = [
    "name",
    "health",
    "allocated",
    "size",
    "free",
    "fragmentation",
    "readonly",
    "freeing",
    "leaked",
    "dedupratio",
];

// Longest pool name ZFS accepts, not counting the terminating NUL.
const ZPOOL_NAME_MAX_LEN: usize = 255;

// Words that `zpool create` treats as vdev types.
const ZPOOL_RESERVED_NAMES: [&str; 5] =
    ["mirror", "raidz", "draid", "spare", "log"];
const ZPOOL_RESERVED_PREFIXES: [&str; 4] =
    ["mirror", "raidz", "draid", "spare"];

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("Failed to parse output: {0}")]
pub struct ParseError(pub(crate) String);

impl ParseError {
    pub fn new<S: Into<String>>(msg: S) -> Self {
        ParseError(msg.into())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Zpool execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Zpool '{name}' not found")]
    NotFound { name: String },

    #[error(
        "Invalid zpool property '{0}': expected a non-empty key without '='"
    )]
    InvalidProperty(String),
}

impl Error {
    // `zpool` exits with status 1 for every failure, so the only way to tell
    // a missing pool apart is the message it prints.
    fn from_execution(name: &ZpoolName, err: ExecutionError) -> Error {
        match err.stderr() {
            Some(stderr) if stderr.contains("no such pool") => {
                Error::NotFound { name: name.to_string() }
            }
            _ => Error::Execution(err),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

#[derive(thiserror::Error, Debug)]
#[error("Failed to create zpool '{name}': {err}")]
pub struct CreateError {
    name: String,
    #[source]
    pub err: Error,
}

#[derive(thiserror::Error, Debug)]
#[error("Failed to destroy zpool '{name}': {err}")]
pub struct DestroyError {
    name: String,
    #[source]
    pub err: Error,
}

#[derive(thiserror::Error, Debug)]
pub enum ListError {
    #[error("Failed to list zpools: {0}")]
    Names(#[from] Error),

    #[error("Failed to list zpools: {0}")]
    Info(#[from] GetInfoError),
}

#[derive(thiserror::Error, Debug)]
#[error("Failed to get info for zpool '{name}': {err}")]
pub struct GetInfoError {
    name: String,
    #[source]
    pub err: Error,
}

#[derive(thiserror::Error, Debug)]
#[error("Failed to get status for {target}: {err}")]
pub struct StatusError {
    target: String,
    #[source]
    pub err: Error,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum ZpoolHealth {
    /// The device is online and functioning.
    Online,
    /// One or more components are degraded or faulted, but sufficient
    /// replicas exist to continue functioning.
    Degraded,
    /// One or more components are degraded or faulted, and insufficient
    /// replicas exist to continue functioning.
    Faulted,
    /// The device was explicitly taken offline by "zpool offline".
    Offline,
    /// The device was physically removed.
    Removed,
    /// The device could not be opened.
    #[serde(rename = "UNAVAIL")]
    Unavailable,
}

impl ZpoolHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZpoolHealth::Online => "ONLINE",
            ZpoolHealth::Degraded => "DEGRADED",
            ZpoolHealth::Faulted => "FAULTED",
            ZpoolHealth::Offline => "OFFLINE",
            ZpoolHealth::Removed => "REMOVED",
            ZpoolHealth::Unavailable => "UNAVAIL",
        }
    }
}

impl fmt::Display for ZpoolHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ZpoolHealth {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ONLINE" => Ok(ZpoolHealth::Online),
            "DEGRADED" => Ok(ZpoolHealth::Degraded),
            "FAULTED" => Ok(ZpoolHealth::Faulted),
            "OFFLINE" => Ok(ZpoolHealth::Offline),
            "REMOVED" => Ok(ZpoolHealth::Removed),
            "UNAVAIL" => Ok(ZpoolHealth::Unavailable),
            _ => Err(ParseError(format!("Unrecognized zpool 'health': {}", s))),
        }
    }
}

/// A validated zpool name.
///
/// This is also the handle returned by [Zpool::create]: it names the pool,
/// and [Zpool::get_info] fetches everything else.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ZpoolName(String);

impl ZpoolName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ZpoolName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for ZpoolName {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid =
            |why: &str| ParseError(format!("Bad zpool name '{s}': {why}"));

        if s.is_empty() {
            return Err(invalid("name is empty"));
        }
        if s.len() > ZPOOL_NAME_MAX_LEN {
            return Err(invalid("name is too long"));
        }
        if !s.starts_with(|c: char| c.is_ascii_alphabetic()) {
            return Err(invalid("name must begin with a letter"));
        }
        if let Some(c) = s.chars().find(|&c| {
            !(c.is_ascii_alphanumeric()
                || matches!(c, '_' | '-' | '.' | ':' | ' '))
        }) {
            return Err(invalid(&format!("invalid character '{c}'")));
        }
        if ZPOOL_RESERVED_NAMES.contains(&s)
            || ZPOOL_RESERVED_PREFIXES.iter().any(|p| s.starts_with(p))
        {
            return Err(invalid("name is reserved"));
        }
        let mut chars = s.chars();
        if chars.next() == Some('c')
            && chars.next().is_some_and(|c| c.is_ascii_digit())
        {
            return Err(invalid("name may not begin with c[0-9]"));
        }

        Ok(ZpoolName(s.to_string()))
    }
}

impl fmt::Display for ZpoolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ZpoolName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ZpoolName::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl Serialize for ZpoolName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

/// Parses a counter printed by `zpool`.
///
/// An empty value, or the `-` placeholder, means zero.
pub fn parse_error_count(s: &str) -> Result<u64, ParseIntError> {
    if s.is_empty() || s == "-" {
        return Ok(0);
    }
    s.parse::<u64>()
}

/// Whether byte quantities should be exact (`zpool ... -p`) or rounded to
/// human-readable units.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ByteUnits {
    #[default]
    Exact,
    Rounded,
}

/// Describes a Zpool.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ZpoolInfo {
    name: ZpoolName,
    health: ZpoolHealth,
    allocated: u64,
    size: u64,
    free: u64,
    fragmentation: u64,
    readonly: bool,
    freeing: u64,
    leaked: u64,
    dedup_ratio: f64,
}

impl ZpoolInfo {
    pub fn name(&self) -> &ZpoolName {
        &self.name
    }

    pub fn health(&self) -> ZpoolHealth {
        self.health
    }

    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn free(&self) -> u64 {
        self.free
    }

    /// Free space fragmentation, as a percentage.
    pub fn fragmentation(&self) -> u64 {
        self.fragmentation
    }

    pub fn readonly(&self) -> bool {
        self.readonly
    }

    /// Bytes still being reclaimed from destroyed datasets.
    pub fn freeing(&self) -> u64 {
        self.freeing
    }

    /// Bytes leaked by the pool and not reclaimable.
    pub fn leaked(&self) -> u64 {
        self.leaked
    }

    pub fn dedup_ratio(&self) -> f64 {
        self.dedup_ratio
    }
}

impl FromStr for ZpoolInfo {
    type Err = ParseError;

    /// Parses one row of `zpool list -Hpo` output, with the columns in
    /// [POOL_INFO_COLUMNS] order.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Lambda helpers for error handling.
        let expected_field = |name: &str| {
            ParseError(format!("Missing '{}' value in zpool list output", name))
        };
        let failed_to_parse = |name: &str, err: String| {
            ParseError(format!("Failed to parse field '{}': {}", name, err))
        };
        let parse_bytes = |name: &str, value: &str| {
            parse_error_count(value.trim_end_matches('%'))
                .map_err(|e| failed_to_parse(name, e.to_string()))
        };

        let mut values = s.trim_end_matches(&['\r', '\n'][..]).split('\t');
        let mut next =
            |name: &str| values.next().ok_or_else(|| expected_field(name));

        let name = next("name")?
            .parse::<ZpoolName>()
            .map_err(|e| failed_to_parse("name", e.to_string()))?;
        let health = next("health")?.parse::<ZpoolHealth>()?;
        let allocated = parse_bytes("allocated", next("allocated")?)?;
        let size = parse_bytes("size", next("size")?)?;
        let free = parse_bytes("free", next("free")?)?;
        let fragmentation =
            parse_bytes("fragmentation", next("fragmentation")?)?;
        let readonly = match next("readonly")? {
            "on" => true,
            "off" => false,
            other => {
                return Err(failed_to_parse(
                    "readonly",
                    format!("expected 'on' or 'off', saw '{other}'"),
                ))
            }
        };
        let freeing = parse_bytes("freeing", next("freeing")?)?;
        let leaked = parse_bytes("leaked", next("leaked")?)?;
        let dedup_ratio = match next("dedupratio")?.trim_end_matches('x') {
            // No ratio reported means nothing was deduplicated.
            "" | "-" => 1.0,
            ratio => ratio
                .parse::<f64>()
                .map_err(|e| failed_to_parse("dedupratio", e.to_string()))?,
        };

        if let Some(extra) = values.next() {
            return Err(ParseError(format!(
                "Unexpected extra value '{}' in zpool list output \
                 (expected {} columns)",
                extra,
                POOL_INFO_COLUMNS.len()
            )));
        }

        Ok(ZpoolInfo {
            name,
            health,
            allocated,
            size,
            free,
            fragmentation,
            readonly,
            freeing,
            leaked,
            dedup_ratio,
        })
    }
}

/// Wraps commands for interacting with ZFS pools.
///
/// Every operation runs one `zpool` command to completion (`list` runs one
/// more per pool) and either fully succeeds or returns an error.
pub struct Zpool {
    executor: BoxedExecutor,
    config: ZpoolConfig,
}

impl Zpool {
    pub fn new(executor: BoxedExecutor, config: ZpoolConfig) -> Self {
        Self { executor, config }
    }

    pub fn config(&self) -> &ZpoolConfig {
        &self.config
    }

    fn command(&self) -> Command {
        let mut cmd = match &self.config.privilege_wrapper {
            Some(wrapper) => {
                let mut cmd = Command::new(wrapper);
                cmd.arg(&self.config.binary);
                cmd
            }
            None => Command::new(&self.config.binary),
        };
        cmd.env("LC_ALL", ZPOOL_LOCALE);
        cmd
    }

    /// Returns the names of every pool on the system.
    pub fn list_names(&self) -> Result<Vec<ZpoolName>, ListError> {
        let mut command = self.command();
        let cmd = command.args(["list", "-Ho", "name"]);

        let output = self.executor.execute(cmd).map_err(Error::from)?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        // Names may contain spaces, so lines are not trimmed.
        let names = stdout
            .lines()
            .filter(|line| !line.is_empty())
            .map(ZpoolName::from_str)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Error::from)?;
        Ok(names)
    }

    /// Describes every pool on the system.
    pub fn list(&self) -> Result<Vec<ZpoolInfo>, ListError> {
        let mut pools = Vec::new();
        for name in self.list_names()? {
            pools.push(self.get_info(&name)?);
        }
        Ok(pools)
    }

    pub fn get_info(
        &self,
        name: &ZpoolName,
    ) -> Result<ZpoolInfo, GetInfoError> {
        let columns = POOL_INFO_COLUMNS.join(",");
        let mut command = self.command();
        let cmd = command.args(["list", "-Hpo", &columns, name.as_str()]);

        let err = |err| GetInfoError { name: name.to_string(), err };
        let output = self
            .executor
            .execute(cmd)
            .map_err(|e| err(Error::from_execution(name, e)))?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        let mut rows = stdout.lines().filter(|line| !line.trim().is_empty());
        let row = rows.next().ok_or_else(|| {
            err(ParseError::new("Empty zpool list output").into())
        })?;
        if rows.next().is_some() {
            return Err(err(ParseError::new(
                "Expected a single row of zpool list output",
            )
            .into()));
        }
        let info = row.parse::<ZpoolInfo>().map_err(|e| err(e.into()))?;
        if info.name != *name {
            return Err(err(ParseError(format!(
                "Asked about zpool '{name}', but output describes '{}'",
                info.name
            ))
            .into()));
        }
        Ok(info)
    }

    /// `zpool create [-o key=value]... <name> [args]...`
    ///
    /// The returned name is all that is known about the new pool; use
    /// [Self::get_info] to learn the rest.
    pub fn create<S: AsRef<str>>(
        &self,
        name: &ZpoolName,
        properties: &BTreeMap<String, String>,
        args: &[S],
    ) -> Result<ZpoolName, CreateError> {
        let err = |err| CreateError { name: name.to_string(), err };

        let mut command = self.command();
        command.arg("create");
        for (key, value) in properties {
            if key.is_empty() || key.contains('=') {
                return Err(err(Error::InvalidProperty(key.clone())));
            }
            command.arg("-o").arg(format!("{key}={value}"));
        }
        command.arg(name.as_str());
        command.args(args.iter().map(|arg| arg.as_ref()));

        self.executor.execute(&mut command).map_err(|e| err(e.into()))?;
        Ok(name.clone())
    }

    pub fn destroy(&self, name: &ZpoolName) -> Result<(), DestroyError> {
        let mut command = self.command();
        let cmd = command.args(["destroy", name.as_str()]);
        self.executor.execute(cmd).map_err(|e| DestroyError {
            name: name.to_string(),
            err: Error::from_execution(name, e),
        })?;
        Ok(())
    }

    fn status_command(&self, units: ByteUnits) -> Command {
        let mut command = self.command();
        command.args(["status", "--json"]);
        if units == ByteUnits::Exact {
            command.arg("-p");
        }
        command
    }

    /// Reports the status and vdev tree of a single pool.
    pub fn status(
        &self,
        name: &ZpoolName,
        units: ByteUnits,
    ) -> Result<PoolStatus, StatusError> {
        let err = |err| StatusError { target: format!("zpool '{name}'"), err };

        let mut command = self.status_command(units);
        let cmd = command.arg(name.as_str());
        let output = self
            .executor
            .execute(cmd)
            .map_err(|e| err(Error::from_execution(name, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut parsed =
            parse_status_output(&stdout).map_err(|e| err(e.into()))?;
        parsed
            .pools
            .remove(name.as_str())
            .ok_or_else(|| err(Error::NotFound { name: name.to_string() }))
    }

    /// Reports the status of every pool, keyed by pool name.
    pub fn status_all(
        &self,
        units: ByteUnits,
    ) -> Result<BTreeMap<String, PoolStatus>, StatusError> {
        let err = |err| StatusError { target: "all zpools".to_string(), err };

        let mut command = self.status_command(units);
        let output = self
            .executor
            .execute(&mut command)
            .map_err(|e| err(e.into()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let parsed = parse_status_output(&stdout).map_err(|e| err(e.into()))?;
        Ok(parsed.pools)
    }
}
