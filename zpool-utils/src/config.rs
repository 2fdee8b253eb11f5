// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration describing how to reach the `zpool` binary

use camino::Utf8Path;
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default program used to manage pools; resolved through `$PATH`.
pub const ZPOOL: &str = "zpool";

/// Locale forced on every invocation, so numbers and messages are stable.
pub const ZPOOL_LOCALE: &str = "C.UTF-8";

/// Configuration for invoking `zpool`
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ZpoolConfig {
    /// Path (or bare name) of the `zpool` binary.
    pub binary: Utf8PathBuf,
    /// Optional program to run `zpool` through, such as `pfexec` or `sudo`.
    pub privilege_wrapper: Option<Utf8PathBuf>,
}

impl Default for ZpoolConfig {
    fn default() -> Self {
        Self { binary: Utf8PathBuf::from(ZPOOL), privilege_wrapper: None }
    }
}

impl ZpoolConfig {
    /// Load a `ZpoolConfig` from the given TOML file
    pub fn from_file(path: &Utf8Path) -> Result<ZpoolConfig, LoadError> {
        let file_contents = std::fs::read_to_string(path)
            .map_err(|err| LoadError::Io { path: path.into(), err })?;
        let config_parsed: ZpoolConfig = toml::from_str(&file_contents)
            .map_err(|err| LoadError::Parse { path: path.into(), err })?;
        Ok(config_parsed)
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("error reading \"{path}\": {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("error parsing \"{path}\": {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
}

#[cfg(test)]
mod test {
    use super::*;
    use camino_tempfile::Utf8TempDir;

    fn write_config(dir: &Utf8TempDir, contents: &str) -> Utf8PathBuf {
        let path = dir.path().join("zpool.toml");
        std::fs::write(&path, contents).expect("failed to write config");
        path
    }

    #[test]
    fn load_full_config() {
        let dir = Utf8TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
            binary = "/usr/sbin/zpool"
            privilege_wrapper = "/usr/bin/pfexec"
            "#,
        );

        let config = ZpoolConfig::from_file(&path).unwrap();
        assert_eq!(config.binary, "/usr/sbin/zpool");
        assert_eq!(
            config.privilege_wrapper.as_deref(),
            Some(Utf8Path::new("/usr/bin/pfexec"))
        );
    }

    #[test]
    fn empty_config_uses_defaults() {
        let dir = Utf8TempDir::new().unwrap();
        let path = write_config(&dir, "");

        let config = ZpoolConfig::from_file(&path).unwrap();
        assert_eq!(config, ZpoolConfig::default());
        assert_eq!(config.binary, ZPOOL);
        assert!(config.privilege_wrapper.is_none());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = Utf8TempDir::new().unwrap();
        let path = write_config(&dir, "zfs = \"/usr/sbin/zfs\"\n");

        let err = ZpoolConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, LoadError::Parse { .. }), "{err}");
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("does-not-exist.toml");

        let err = ZpoolConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, LoadError::Io { .. }), "{err}");
    }
}
