// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-memory stand-in for the `zpool` command.
//!
//! [FakeZpoolHost] understands the invocations made by [crate::zpool::Zpool]
//! and answers them from a table of pools, failing the same way `zpool` does
//! when a pool is missing or already exists.

use crate::config::ZPOOL;
use crate::host::{BoxedExecuteFn, Input, Output, OutputExt, PFEXEC};
use crate::zpool::POOL_INFO_COLUMNS;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Size reported for every fake disk.
pub const FAKE_DISK_SIZE: u64 = 10 << 30;

// Disks lose a little space to labels and metaslab alignment.
const FAKE_USABLE_SIZE: u64 = FAKE_DISK_SIZE - (256 << 20);

#[derive(Clone, Debug)]
enum FakeVdev {
    Disk(String),
    Mirror(Vec<String>),
}

impl FakeVdev {
    fn disks(&self) -> &[String] {
        match self {
            FakeVdev::Disk(disk) => std::slice::from_ref(disk),
            FakeVdev::Mirror(disks) => disks,
        }
    }

    fn usable_size(&self) -> u64 {
        // A mirror holds one copy's worth of data.
        FAKE_USABLE_SIZE
    }
}

#[derive(Clone, Debug)]
struct FakePool {
    guid: u64,
    properties: BTreeMap<String, String>,
    vdevs: Vec<FakeVdev>,
}

impl FakePool {
    fn size(&self) -> u64 {
        self.vdevs.iter().map(FakeVdev::usable_size).sum()
    }
}

enum ZpoolCommand {
    List { properties: Vec<String>, pools: Vec<String> },
    Create {
        properties: BTreeMap<String, String>,
        pool: String,
        vdevs: Vec<String>,
    },
    Destroy { pool: String },
    Status { exact: bool, pool: Option<String> },
}

// Consumes arguments from the front of an [Input].
struct InputParser {
    args: std::collections::VecDeque<String>,
}

impl InputParser {
    fn new(input: Input) -> Self {
        Self { args: input.args.into() }
    }

    fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    fn shift_arg(&mut self) -> Result<String, String> {
        self.args.pop_front().ok_or_else(|| "Missing argument".to_string())
    }

    fn peek_flag(&self) -> Option<&str> {
        self.args.front().map(String::as_str).filter(|a| a.starts_with('-'))
    }

    fn no_args_remaining(&self) -> Result<(), String> {
        if !self.args.is_empty() {
            return Err(format!("Unexpected extra arguments: {:?}", self.args));
        }
        Ok(())
    }

    fn remaining(self) -> Vec<String> {
        self.args.into()
    }
}

impl TryFrom<Input> for ZpoolCommand {
    type Error = String;

    fn try_from(mut input: Input) -> Result<Self, Self::Error> {
        while input.program == PFEXEC {
            if input.args.is_empty() {
                return Err(format!("Failed to parse {input}"));
            }
            input.program = input.args.remove(0);
        }
        if !input.program.ends_with(ZPOOL) {
            return Err(format!("Not zpool command: {}", input.program));
        }

        let mut input = InputParser::new(input);
        match input.shift_arg()?.as_str() {
            "list" => {
                let mut scripting = false;
                let mut properties = vec!["name".to_string()];
                while let Some(flag) = input.peek_flag() {
                    let flag = flag.to_string();
                    input.shift_arg()?;
                    // Flags may be grouped, as in "-Hpo".
                    for c in flag.chars().skip(1) {
                        match c {
                            'H' => scripting = true,
                            'p' => (),
                            'o' => {
                                properties = input
                                    .shift_arg()?
                                    .split(',')
                                    .map(str::to_string)
                                    .collect();
                            }
                            c => {
                                return Err(format!(
                                    "Unrecognized option '-{c}'"
                                ))
                            }
                        }
                    }
                }
                if !scripting {
                    return Err(
                        "'zpool list' must be run with '-H'".to_string()
                    );
                }
                Ok(ZpoolCommand::List { properties, pools: input.remaining() })
            }
            "create" => {
                let mut properties = BTreeMap::new();
                while let Some(flag) = input.peek_flag() {
                    if flag != "-o" {
                        return Err(format!("Unrecognized option '{flag}'"));
                    }
                    input.shift_arg()?;
                    let prop = input.shift_arg()?;
                    let (k, v) = prop
                        .split_once('=')
                        .ok_or_else(|| format!("Bad property: {prop}"))?;
                    properties.insert(k.to_string(), v.to_string());
                }
                let pool = input.shift_arg()?;
                Ok(ZpoolCommand::Create {
                    properties,
                    pool,
                    vdevs: input.remaining(),
                })
            }
            "destroy" => {
                let pool = input.shift_arg()?;
                input.no_args_remaining()?;
                Ok(ZpoolCommand::Destroy { pool })
            }
            "status" => {
                let mut json = false;
                let mut exact = false;
                while let Some(flag) = input.peek_flag() {
                    match flag {
                        "--json" => json = true,
                        "-p" => exact = true,
                        flag => {
                            return Err(format!("Unrecognized option '{flag}'"))
                        }
                    }
                    input.shift_arg()?;
                }
                if !json {
                    return Err(
                        "'zpool status' must be run with '--json'".to_string()
                    );
                }
                let pool = if input.is_empty() {
                    None
                } else {
                    Some(input.shift_arg()?)
                };
                input.no_args_remaining()?;
                Ok(ZpoolCommand::Status { exact, pool })
            }
            command => Err(format!("Unexpected command: {command}")),
        }
    }
}

fn no_such_pool(pool: &str) -> Output {
    Output::failure()
        .set_stderr(format!("cannot open '{pool}': no such pool\n"))
}

fn cannot_create(pool: &str, why: &str) -> Output {
    Output::failure().set_stderr(format!("cannot create '{pool}': {why}\n"))
}

// Mirrors the unit scaling `zpool` applies without `-p`.
fn format_bytes(bytes: u64, exact: bool) -> String {
    if exact || bytes < 1024 {
        return bytes.to_string();
    }
    const SUFFIXES: [&str; 6] = ["K", "M", "G", "T", "P", "E"];
    let mut value = bytes as f64 / 1024.0;
    let mut suffix = 0;
    while value >= 1024.0 && suffix + 1 < SUFFIXES.len() {
        value /= 1024.0;
        suffix += 1;
    }
    format!("{value:.2}{}", SUFFIXES[suffix])
}

/// Pools held in memory, manipulated through `zpool` invocations.
pub struct FakeZpoolHost {
    pools: Mutex<BTreeMap<String, FakePool>>,
    // Never reused, even after a pool is destroyed.
    pools_created: AtomicU64,
}

impl FakeZpoolHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pools: Mutex::new(BTreeMap::new()),
            pools_created: AtomicU64::new(0),
        })
    }

    /// Returns a handler for [crate::host::FakeExecutorBuilder::handler].
    pub fn as_handler(self: Arc<Self>) -> BoxedExecuteFn {
        Box::new(move |command: &Command| self.execute(Input::from(command)))
    }

    /// Names of every pool currently on the fake host.
    pub fn pool_names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Runs a single `zpool` invocation.
    ///
    /// Commands which are not understood fail with the reason on stderr.
    pub fn execute(&self, input: Input) -> Output {
        let command = match ZpoolCommand::try_from(input) {
            Ok(command) => command,
            Err(err) => return Output::failure().set_stderr(err),
        };
        match command {
            ZpoolCommand::List { properties, pools } => {
                self.list(&properties, &pools)
            }
            ZpoolCommand::Create { properties, pool, vdevs } => {
                self.create(properties, pool, &vdevs)
            }
            ZpoolCommand::Destroy { pool } => self.destroy(&pool),
            ZpoolCommand::Status { exact, pool } => {
                self.status(exact, pool.as_deref())
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, FakePool>> {
        self.pools.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn list(&self, properties: &[String], names: &[String]) -> Output {
        let pools = self.lock();
        let selected: Vec<(&String, &FakePool)> = if names.is_empty() {
            pools.iter().collect()
        } else {
            let mut selected = vec![];
            for name in names {
                match pools.get_key_value(name) {
                    Some(entry) => selected.push(entry),
                    None => return no_such_pool(name),
                }
            }
            selected
        };

        let mut stdout = String::new();
        for (name, pool) in selected {
            let mut row = vec![];
            for property in properties {
                let value = match property.as_str() {
                    "name" => name.clone(),
                    "health" => "ONLINE".to_string(),
                    "allocated" | "fragmentation" | "freeing" | "leaked" => {
                        "0".to_string()
                    }
                    "size" | "free" => pool.size().to_string(),
                    "readonly" => "off".to_string(),
                    "dedupratio" => "1.00".to_string(),
                    other => match pool.properties.get(other) {
                        Some(value) => value.clone(),
                        None => {
                            return Output::failure().set_stderr(format!(
                                "bad property list: \
                                 invalid property '{other}'\n"
                            ))
                        }
                    },
                };
                row.push(value);
            }
            stdout.push_str(&row.join("\t"));
            stdout.push('\n');
        }
        Output::success().set_stdout(stdout)
    }

    fn create(
        &self,
        properties: BTreeMap<String, String>,
        name: String,
        args: &[String],
    ) -> Output {
        let mut pools = self.lock();
        if pools.contains_key(&name) {
            return cannot_create(&name, "pool already exists");
        }
        if let Some(bad) =
            properties.keys().find(|k| POOL_INFO_COLUMNS.contains(&k.as_str()))
        {
            return cannot_create(
                &name,
                &format!("property '{bad}' is readonly"),
            );
        }

        let mut vdevs = vec![];
        let mut args = args.iter().peekable();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "mirror" => {
                    let mut disks = vec![];
                    while let Some(disk) = args.next_if(|a| *a != "mirror") {
                        disks.push(disk.clone());
                    }
                    if disks.len() < 2 {
                        return cannot_create(
                            &name,
                            "mirror requires at least two devices",
                        );
                    }
                    vdevs.push(FakeVdev::Mirror(disks));
                }
                "raidz" | "raidz1" | "raidz2" | "raidz3" | "draid" | "spare"
                | "log" | "cache" | "special" | "dedup" => {
                    return cannot_create(
                        &name,
                        &format!("vdev type '{arg}' is not supported here"),
                    );
                }
                disk => vdevs.push(FakeVdev::Disk(disk.to_string())),
            }
        }
        if vdevs.is_empty() {
            return cannot_create(&name, "missing vdev specification");
        }

        let requested: Vec<&String> =
            vdevs.iter().flat_map(FakeVdev::disks).collect();
        for (i, disk) in requested.iter().enumerate() {
            if requested[..i].contains(disk) {
                return cannot_create(
                    &name,
                    "one or more vdevs refer to the same device",
                );
            }
            if let Some((owner, _)) = pools.iter().find(|(_, pool)| {
                pool.vdevs.iter().any(|v| v.disks().contains(disk))
            }) {
                return cannot_create(
                    &name,
                    &format!("{disk} is part of active pool '{owner}'"),
                );
            }
        }

        // Leaves room for the vdev GUIDs derived from it.
        let index = self.pools_created.fetch_add(1, Ordering::SeqCst) + 1;
        let guid = 0x5a5a_0000_0000_0000 + (index << 16);
        pools.insert(name, FakePool { guid, properties, vdevs });
        Output::success()
    }

    fn destroy(&self, name: &str) -> Output {
        match self.lock().remove(name) {
            Some(_) => Output::success(),
            None => no_such_pool(name),
        }
    }

    fn status(&self, exact: bool, name: Option<&str>) -> Output {
        let pools = self.lock();
        let mut out = Map::new();
        match name {
            Some(name) => match pools.get(name) {
                Some(pool) => {
                    out.insert(name.to_string(), pool_json(name, pool, exact));
                }
                None => return no_such_pool(name),
            },
            None => {
                for (name, pool) in pools.iter() {
                    out.insert(name.clone(), pool_json(name, pool, exact));
                }
            }
        }

        let doc = json!({
            "output_version": {
                "command": "zpool status",
                "vers_major": 0,
                "vers_minor": 1,
            },
            "pools": out,
        });
        Output::success().set_stdout(doc.to_string())
    }
}

fn zero_counters(vdev: &mut Map<String, Value>) {
    for counter in ["read_errors", "write_errors", "checksum_errors"] {
        vdev.insert(counter.to_string(), json!("0"));
    }
}

fn disk_json(disk: &str, guid: u64, exact: bool) -> Value {
    let name = disk.rsplit('/').next().unwrap_or(disk);
    let path = if disk.starts_with('/') {
        disk.to_string()
    } else {
        format!("/dev/{disk}")
    };
    let mut vdev = json!({
        "name": name,
        "vdev_type": "disk",
        "guid": guid.to_string(),
        "path": path,
        "class": "normal",
        "state": "ONLINE",
        "rep_dev_size": format_bytes(FAKE_USABLE_SIZE, exact),
        "phys_space": format_bytes(FAKE_DISK_SIZE, exact),
        "slow_ios": "0",
    });
    if let Value::Object(map) = &mut vdev {
        zero_counters(map);
    }
    vdev
}

fn pool_json(name: &str, pool: &FakePool, exact: bool) -> Value {
    let mut guid = pool.guid;
    let mut next_guid = || {
        guid += 1;
        guid
    };

    let mut top = Map::new();
    let mut mirrors = 0;
    for vdev in &pool.vdevs {
        match vdev {
            FakeVdev::Disk(disk) => {
                let value = disk_json(disk, next_guid(), exact);
                let key = value["name"].as_str().unwrap_or(disk).to_string();
                top.insert(key, value);
            }
            FakeVdev::Mirror(disks) => {
                let mirror_name = format!("mirror-{mirrors}");
                mirrors += 1;
                let mut children = Map::new();
                for disk in disks {
                    let value = disk_json(disk, next_guid(), exact);
                    let key =
                        value["name"].as_str().unwrap_or(disk).to_string();
                    children.insert(key, value);
                }
                let mut mirror = Map::new();
                mirror.insert("name".to_string(), json!(mirror_name));
                mirror.insert("vdev_type".to_string(), json!("mirror"));
                mirror.insert(
                    "guid".to_string(),
                    json!(next_guid().to_string()),
                );
                mirror.insert("class".to_string(), json!("normal"));
                mirror.insert("state".to_string(), json!("ONLINE"));
                mirror.insert(
                    "alloc_space".to_string(),
                    json!(format_bytes(0, exact)),
                );
                mirror.insert(
                    "total_space".to_string(),
                    json!(format_bytes(vdev.usable_size(), exact)),
                );
                zero_counters(&mut mirror);
                mirror.insert("vdevs".to_string(), Value::Object(children));
                top.insert(mirror_name, Value::Object(mirror));
            }
        }
    }

    let mut root = Map::new();
    root.insert("name".to_string(), json!(name));
    root.insert("vdev_type".to_string(), json!("root"));
    root.insert("guid".to_string(), json!(pool.guid.to_string()));
    root.insert("class".to_string(), json!("normal"));
    root.insert("state".to_string(), json!("ONLINE"));
    root.insert("alloc_space".to_string(), json!(format_bytes(0, exact)));
    root.insert(
        "total_space".to_string(),
        json!(format_bytes(pool.size(), exact)),
    );
    zero_counters(&mut root);
    root.insert("vdevs".to_string(), Value::Object(top));

    json!({
        "name": name,
        "state": "ONLINE",
        "pool_guid": pool.guid.to_string(),
        "txg": "4",
        "spa_version": "5000",
        "zpl_version": "5",
        "vdevs": { name: Value::Object(root) },
        "error_count": "0",
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::zpool::{parse_status_output, ZpoolInfo};

    fn run(host: &FakeZpoolHost, command: &str) -> Output {
        host.execute(Input::shell(command))
    }

    fn stdout(output: &Output) -> String {
        assert!(output.status.success(), "{:?}", output);
        String::from_utf8(output.stdout.clone()).unwrap()
    }

    fn stderr(output: &Output) -> String {
        assert!(!output.status.success(), "{:?}", output);
        String::from_utf8(output.stderr.clone()).unwrap()
    }

    #[test]
    fn list_and_destroy() {
        let host = FakeZpoolHost::new();
        assert_eq!(stdout(&run(&host, "zpool list -Ho name")), "");

        stdout(&run(&host, "zpool create tank sdb sdc"));
        stdout(&run(
            &host,
            "/usr/bin/pfexec zpool create -o ashift=12 rpool sda",
        ));
        assert_eq!(stdout(&run(&host, "zpool list -Ho name")), "rpool\ntank\n");
        assert_eq!(host.pool_names(), ["rpool", "tank"]);

        let query =
            format!("zpool list -Hpo {} tank", POOL_INFO_COLUMNS.join(","));
        let row = stdout(&run(&host, &query));
        let info: ZpoolInfo = row.parse().unwrap();
        assert_eq!(info.size(), 2 * FAKE_USABLE_SIZE);
        assert_eq!(info.free(), info.size());

        assert_eq!(
            stdout(&run(&host, "zpool list -Hpo name,ashift rpool")),
            "rpool\t12\n"
        );

        stdout(&run(&host, "zpool destroy tank"));
        assert_eq!(
            stderr(&run(&host, "zpool destroy tank")),
            "cannot open 'tank': no such pool\n"
        );
        assert!(stderr(&run(&host, &query)).contains("no such pool"));
    }

    #[test]
    fn create_failures() {
        let host = FakeZpoolHost::new();
        stdout(&run(&host, "zpool create tank mirror sdb sdc"));

        let cases = [
            ("zpool create tank sdd", "pool already exists"),
            ("zpool create data sdb", "sdb is part of active pool 'tank'"),
            ("zpool create data sdd sdd", "refer to the same device"),
            ("zpool create data mirror sdd", "at least two devices"),
            ("zpool create data raidz sdd sde sdf", "not supported"),
            ("zpool create data", "missing vdev specification"),
            ("zpool create -o health=ONLINE data sdd", "readonly"),
        ];
        for (command, message) in cases {
            let err = stderr(&run(&host, command));
            assert!(err.contains(message), "{command}: {err}");
        }
        assert_eq!(host.pool_names(), ["tank"]);
    }

    #[test]
    fn status_document() {
        let host = FakeZpoolHost::new();
        stdout(&run(
            &host,
            "zpool create tank mirror sdb sdc mirror sdd /dev/sde",
        ));
        stdout(&run(&host, "zpool create rpool sda"));

        let exact = stdout(&run(&host, "zpool status --json -p tank"));
        let parsed = parse_status_output(&exact).unwrap();
        assert_eq!(parsed.pools.len(), 1);
        let tank = &parsed.pools["tank"];
        let walked: Vec<_> = tank
            .root_vdev()
            .unwrap()
            .walk()
            .map(|v| v.name.as_str())
            .collect();
        assert_eq!(
            walked,
            ["tank", "mirror-0", "sdb", "sdc", "mirror-1", "sdd", "sde"]
        );
        let sde = &tank.root_vdev().unwrap().vdevs["mirror-1"].vdevs["sde"];
        assert_eq!(sde.path.as_deref(), Some("/dev/sde"));
        assert_eq!(sde.phys_space, Some(FAKE_DISK_SIZE.to_string()));

        let rounded = stdout(&run(&host, "zpool status --json rpool"));
        let parsed = parse_status_output(&rounded).unwrap();
        let sda = &parsed.pools["rpool"].root_vdev().unwrap().vdevs["sda"];
        assert_eq!(sda.phys_space.as_deref(), Some("10.00G"));

        let all = stdout(&run(&host, "zpool status --json"));
        let parsed = parse_status_output(&all).unwrap();
        assert_eq!(parsed.pools.keys().collect::<Vec<_>>(), ["rpool", "tank"]);

        assert!(stderr(&run(&host, "zpool status --json nope"))
            .contains("no such pool"));
        assert!(stderr(&run(&host, "zpool status tank")).contains("--json"));
    }

    #[test]
    fn pool_guids_are_not_reused() {
        let host = FakeZpoolHost::new();
        stdout(&run(&host, "zpool create tank sdb"));
        stdout(&run(&host, "zpool create rpool sda"));
        stdout(&run(&host, "zpool destroy tank"));
        stdout(&run(&host, "zpool create data sdc"));

        let all = stdout(&run(&host, "zpool status --json -p"));
        let parsed = parse_status_output(&all).unwrap();
        let guids: Vec<&str> =
            parsed.pools.values().map(|p| p.pool_guid.as_str()).collect();
        assert_eq!(guids.len(), 2);
        assert_ne!(guids[0], guids[1]);
    }

    #[test]
    fn rejects_unknown_commands() {
        let host = FakeZpoolHost::new();
        assert!(stderr(&run(&host, "zfs list")).contains("Not zpool"));
        assert!(stderr(&run(&host, "zpool scrub tank")).contains("Unexpected"));
        assert!(stderr(&run(&host, "zpool list -o name")).contains("-H"));
        assert!(stderr(&run(&host, "zpool list -Hx")).contains("-x"));
    }

    #[test]
    fn rounded_bytes() {
        assert_eq!(format_bytes(512, false), "512");
        assert_eq!(format_bytes(1536, false), "1.50K");
        assert_eq!(format_bytes(FAKE_DISK_SIZE, false), "10.00G");
        assert_eq!(format_bytes(FAKE_DISK_SIZE, true), "10737418240");
    }
}
