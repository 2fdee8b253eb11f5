// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types describing the output of `zpool status --json`.

use super::{parse_error_count, ParseError, ZpoolHealth};
use serde::de;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Version header emitted by every `zpool ... --json` command.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct OutputVersion {
    pub command: String,
    pub vers_major: u32,
    pub vers_minor: u32,
}

/// The full document printed by `zpool status --json`.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct StatusOutput {
    pub output_version: OutputVersion,
    #[serde(default)]
    pub pools: BTreeMap<String, PoolStatus>,
}

/// Status of a single pool.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub name: String,
    pub state: String,
    #[serde(default)]
    pub pool_guid: String,
    #[serde(default)]
    pub txg: String,
    #[serde(default)]
    pub spa_version: String,
    #[serde(default)]
    pub zpl_version: String,
    /// Top-level vdev tree. The root is keyed by the pool's own name.
    #[serde(default)]
    pub vdevs: BTreeMap<String, Vdev>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub logs: BTreeMap<String, Vdev>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub l2cache: BTreeMap<String, Vdev>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub spares: BTreeMap<String, Vdev>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub special: BTreeMap<String, Vdev>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dedup: BTreeMap<String, Vdev>,
    /// Number of known data errors.
    #[serde(default, deserialize_with = "deserialize_count")]
    pub error_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msgid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moreinfo: Option<String>,
}

impl PoolStatus {
    pub fn health(&self) -> Option<ZpoolHealth> {
        self.state.parse().ok()
    }

    /// The vdev at the top of the pool's configuration.
    pub fn root_vdev(&self) -> Option<&Vdev> {
        self.vdevs.get(&self.name)
    }

    /// The summary line `zpool status` prints under "errors:".
    pub fn errors_summary(&self) -> String {
        match self.error_count {
            0 => "No known data errors".to_string(),
            n => format!("{n} data errors"),
        }
    }

    /// Every vdev the pool reported, across all device classes.
    pub fn walk_vdevs(&self) -> impl Iterator<Item = &Vdev> + '_ {
        [
            &self.vdevs,
            &self.logs,
            &self.l2cache,
            &self.spares,
            &self.special,
            &self.dedup,
        ]
        .into_iter()
        .flat_map(|class| class.values())
        .flat_map(Vdev::walk)
    }
}

/// A node in a pool's device tree.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct Vdev {
    pub name: String,
    #[serde(default)]
    pub vdev_type: String,
    #[serde(default)]
    pub guid: String,
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phys_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alloc_space: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_space: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub def_space: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rep_dev_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phys_space: Option<String>,
    #[serde(default, deserialize_with = "deserialize_count")]
    pub read_errors: u64,
    #[serde(default, deserialize_with = "deserialize_count")]
    pub write_errors: u64,
    #[serde(default, deserialize_with = "deserialize_count")]
    pub checksum_errors: u64,
    #[serde(default, deserialize_with = "deserialize_count")]
    pub slow_ios: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vdevs: BTreeMap<String, Vdev>,
}

impl Vdev {
    /// `None` for states outside [ZpoolHealth], like a spare's `AVAIL`.
    pub fn health(&self) -> Option<ZpoolHealth> {
        self.state.parse().ok()
    }

    pub fn children(&self) -> impl Iterator<Item = &Vdev> + '_ {
        self.vdevs.values()
    }

    pub fn is_leaf(&self) -> bool {
        self.vdevs.is_empty()
    }

    /// Sum of read, write, and checksum errors on this vdev alone.
    pub fn error_total(&self) -> u64 {
        self.read_errors
            .saturating_add(self.write_errors)
            .saturating_add(self.checksum_errors)
    }

    /// Depth-first, pre-order traversal of this vdev and its descendants.
    pub fn walk(&self) -> VdevWalk<'_> {
        VdevWalk { stack: vec![self] }
    }
}

/// Iterator returned by [Vdev::walk].
pub struct VdevWalk<'a> {
    stack: Vec<&'a Vdev>,
}

impl<'a> Iterator for VdevWalk<'a> {
    type Item = &'a Vdev;

    fn next(&mut self) -> Option<Self::Item> {
        let vdev = self.stack.pop()?;
        self.stack.extend(vdev.vdevs.values().rev());
        Some(vdev)
    }
}

/// Parses the document printed by `zpool status --json`.
pub fn parse_status_output(json: &str) -> Result<StatusOutput, ParseError> {
    serde_json::from_str(json).map_err(|e| {
        ParseError(format!("Invalid 'zpool status --json' output: {e}"))
    })
}

// Counters are strings in the JSON output, or integers with `--json-int`.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawCount {
    Int(u64),
    Text(String),
}

fn deserialize_count<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<RawCount>::deserialize(deserializer)? {
        None => Ok(0),
        Some(RawCount::Int(n)) => Ok(n),
        Some(RawCount::Text(s)) => parse_count(&s).map_err(de::Error::custom),
    }
}

/// Parses a counter which may have been rounded for humans (e.g. `1.2K`).
///
/// Without `-p`, `zpool` scales large values by powers of 1024 and keeps one
/// or two decimal places, so the result is only as precise as the output.
fn parse_count(s: &str) -> Result<u64, ParseError> {
    if let Ok(n) = parse_error_count(s) {
        return Ok(n);
    }

    let invalid = || ParseError(format!("Invalid counter value '{s}'"));
    let Some(suffix) = s.chars().last() else {
        return Err(invalid());
    };
    let number = &s[..s.len() - suffix.len_utf8()];
    let exponent = match suffix {
        'K' => 1,
        'M' => 2,
        'G' => 3,
        'T' => 4,
        'P' => 5,
        'E' => 6,
        _ => return Err(invalid()),
    };
    let value = number.parse::<f64>().map_err(|_| invalid())?;
    if !value.is_finite() || value < 0.0 {
        return Err(invalid());
    }
    let scaled = value * 1024f64.powi(exponent);
    if scaled >= u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(scaled.round() as u64)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::Value;

    const MIRROR: &str =
        include_str!("../../test-data/zpool-status-mirror.json");
    const DEGRADED: &str =
        include_str!("../../test-data/zpool-status-degraded.json");

    // Collects every vdev name straight from the JSON, without going through
    // the typed model.
    fn raw_vdev_names(vdevs: &Value, out: &mut Vec<String>) {
        let Some(map) = vdevs.as_object() else {
            return;
        };
        for (key, vdev) in map {
            assert_eq!(vdev["name"].as_str(), Some(key.as_str()));
            out.push(key.clone());
            if let Some(children) = vdev.get("vdevs") {
                raw_vdev_names(children, out);
            }
        }
    }

    #[test]
    fn test_parse_count() {
        assert_eq!(parse_count(""), Ok(0));
        assert_eq!(parse_count("-"), Ok(0));
        assert_eq!(parse_count("42"), Ok(42));
        assert_eq!(parse_count("1K"), Ok(1024));
        assert_eq!(parse_count("1.5K"), Ok(1536));
        assert_eq!(parse_count("2M"), Ok(2 * 1024 * 1024));
        assert!(parse_count("K").is_err());
        assert!(parse_count("1.5Q").is_err());
        assert!(parse_count("-1K").is_err());
        assert!(parse_count("abc").is_err());
    }

    #[test]
    fn test_parse_mirror_status() {
        let output = parse_status_output(MIRROR).unwrap();
        assert_eq!(output.output_version.command, "zpool status");
        assert_eq!(output.output_version.vers_major, 0);
        assert_eq!(output.output_version.vers_minor, 1);
        assert_eq!(output.pools.len(), 1);

        let tank = &output.pools["tank"];
        assert_eq!(tank.name, "tank");
        assert_eq!(tank.health(), Some(ZpoolHealth::Online));
        assert_eq!(tank.pool_guid, "10479536238532451935");
        assert_eq!(tank.txg, "2426");
        assert_eq!(tank.spa_version, "5000");
        assert_eq!(tank.zpl_version, "5");
        assert_eq!(tank.error_count, 0);
        assert_eq!(tank.errors_summary(), "No known data errors");

        let root = tank.root_vdev().expect("missing root vdev");
        assert_eq!(root.vdev_type, "root");
        assert_eq!(root.alloc_space.as_deref(), Some("1146880"));
        let mirrors: Vec<_> = root.children().map(|v| &v.name).collect();
        assert_eq!(mirrors, ["mirror-0", "mirror-1"]);

        let sdb = &root.vdevs["mirror-0"].vdevs["sdb"];
        assert!(sdb.is_leaf());
        assert_eq!(sdb.vdev_type, "disk");
        assert_eq!(sdb.path.as_deref(), Some("/dev/sdb1"));
        assert_eq!(sdb.read_errors, 0);
        assert_eq!(sdb.slow_ios, 0);

        let walked: Vec<_> = root.walk().map(|v| v.name.as_str()).collect();
        assert_eq!(
            walked,
            ["tank", "mirror-0", "sdb", "sdc", "mirror-1", "sdd", "sde"]
        );
    }

    #[test]
    fn test_parse_degraded_status() {
        let output = parse_status_output(DEGRADED).unwrap();
        assert_eq!(output.pools.len(), 2);

        let data = &output.pools["data"];
        assert_eq!(data.health(), Some(ZpoolHealth::Degraded));
        assert_eq!(data.error_count, 3);
        assert_eq!(data.errors_summary(), "3 data errors");
        assert!(data.status.is_some());
        assert!(data.action.is_some());
        assert_eq!(data.msgid.as_deref(), Some("ZFS-8000-9P"));

        let raidz = &data.root_vdev().unwrap().vdevs["raidz1-0"];
        assert_eq!(raidz.health(), Some(ZpoolHealth::Degraded));
        let bad = &raidz.vdevs["sdh"];
        assert_eq!(bad.health(), Some(ZpoolHealth::Faulted));
        assert_eq!(bad.read_errors, 0);
        // "1.2K" in rounded output.
        assert_eq!(bad.write_errors, 1229);
        assert_eq!(bad.checksum_errors, 12);
        assert_eq!(bad.error_total(), 1241);
        // Empty and "-" counters are zero.
        assert_eq!(raidz.vdevs["sdf"].slow_ios, 0);
        assert_eq!(raidz.vdevs["sdg"].read_errors, 0);

        let spare = &data.spares["sdi"];
        assert_eq!(spare.state, "AVAIL");
        assert_eq!(spare.health(), None);
        assert_eq!(data.logs["sdj"].vdev_type, "disk");

        let scratch = &output.pools["scratch"];
        assert_eq!(scratch.health(), Some(ZpoolHealth::Online));
        assert!(scratch.status.is_none());
        // Counters encoded as integers.
        let nvme = &scratch.root_vdev().unwrap().vdevs["nvme0n1"];
        assert_eq!(nvme.read_errors, 7);
    }

    #[test]
    fn test_every_vdev_appears_once() {
        for payload in [MIRROR, DEGRADED] {
            let raw: Value = serde_json::from_str(payload).unwrap();
            let output = parse_status_output(payload).unwrap();

            for (name, pool) in &output.pools {
                let raw_pool = &raw["pools"][name];
                let mut expected = Vec::new();
                for class in
                    ["vdevs", "logs", "l2cache", "spares", "special", "dedup"]
                {
                    raw_vdev_names(&raw_pool[class], &mut expected);
                }

                let mut walked: Vec<String> =
                    pool.walk_vdevs().map(|v| v.name.clone()).collect();
                expected.sort();
                walked.sort();
                assert_eq!(walked, expected, "pool {name}");
            }
        }
    }

    #[test]
    fn test_empty_pools() {
        let json = r#"{"output_version": {
            "command": "zpool status", "vers_major": 0, "vers_minor": 1
        }}"#;
        let output = parse_status_output(json).unwrap();
        assert!(output.pools.is_empty());
    }

    #[test]
    fn test_invalid_documents() {
        let bad = [
            "",
            "no pools available",
            r#"{"pools":{}}"#,
            r#"{"output_version": {
                    "command": "zpool status", "vers_major": 0, "vers_minor": 1
                },
                "pools": {"tank": {
                    "name": "tank", "state": "ONLINE", "error_count": "many"
                }}}"#,
        ];
        for payload in bad {
            assert!(
                parse_status_output(payload).is_err(),
                "{payload:?} should not parse"
            );
        }
    }

    #[test]
    fn test_serialize_skips_empty() {
        let output = parse_status_output(MIRROR).unwrap();
        let json = serde_json::to_value(&output.pools["tank"]).unwrap();
        assert!(json.get("spares").is_none());
        assert!(json.get("status").is_none());
        assert_eq!(json["error_count"], 0);
        let sdb = &json["vdevs"]["tank"]["vdevs"]["mirror-0"]["vdevs"]["sdb"];
        assert!(sdb.get("vdevs").is_none());
        assert_eq!(sdb["read_errors"], 0);
    }
}
