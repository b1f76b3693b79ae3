//! Persisted user settings and the on-disk layout of app data.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::config::BuildOptions;
use crate::engine_log::DEFAULT_LOG_CAP;
use crate::error::SettingsError;
use crate::probe::DEFAULT_PROBE_TIMEOUT;
use crate::supervisor::{EngineArgs, EngineSpec};

const SETTINGS_FILE: &str = "settings.json";
const CONFIG_DIR: &str = "xray/configs";
const LOG_DIR: &str = "logs";
const ENGINE_LOG_FILE: &str = "xray.log";
const ENGINE_DIR: &str = "xray-core";
const ENGINE_NAME: &str = "xray";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    root: PathBuf,
}

impl AppPaths {
    /// Per-user data directory for the current platform.
    pub fn discover() -> Result<Self, SettingsError> {
        let dirs = ProjectDirs::from("", "", "xray-shell").ok_or(SettingsError::NoDataDir)?;
        Ok(Self::at(dirs.data_dir()))
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join(CONFIG_DIR)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join(LOG_DIR)
    }

    pub fn engine_log(&self) -> PathBuf {
        self.log_dir().join(ENGINE_LOG_FILE)
    }

    pub fn settings(&self) -> PathBuf {
        self.root.join(SETTINGS_FILE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Folder holding the engine binary and its geo databases.
    pub engine_dir: Option<PathBuf>,
    pub engine_args: EngineArgs,
    pub socks_host: String,
    pub socks_port: u16,
    pub allow_insecure: bool,
    pub domestic_region: Option<String>,
    pub engine_log_level: String,
    pub dns_servers: Vec<String>,
    pub log_cap_lines: usize,
    pub probe_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let build = BuildOptions::default();
        Self {
            engine_dir: None,
            engine_args: EngineArgs::default(),
            socks_host: build.socks_host,
            socks_port: build.socks_port,
            allow_insecure: build.allow_insecure,
            domestic_region: build.domestic_region,
            engine_log_level: build.log_level,
            dns_servers: build.dns_servers,
            log_cap_lines: DEFAULT_LOG_CAP,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT.as_millis() as u64,
        }
    }
}

impl Settings {
    /// Defaults when the file is missing or unreadable.
    pub fn load(paths: &AppPaths) -> Self {
        let path = paths.settings();
        if !path.exists() {
            return Self::default();
        }
        let raw = match fs::read_to_string(&path) {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(%error, path = %path.display(), "settings unreadable, using defaults");
                return Self::default();
            }
        };
        serde_json::from_str(&raw).unwrap_or_else(|error| {
            tracing::warn!(%error, "settings invalid, using defaults");
            Self::default()
        })
    }

    pub fn save(&self, paths: &AppPaths) -> Result<(), SettingsError> {
        let path = paths.settings();
        let io_err = |source| SettingsError::Io {
            path: path.clone(),
            source,
        };
        fs::create_dir_all(paths.root()).map_err(io_err)?;
        let content = serde_json::to_string_pretty(self)?;
        fs::write(&path, content).map_err(io_err)?;
        Ok(())
    }

    pub fn build_options(&self) -> BuildOptions {
        BuildOptions {
            socks_host: self.socks_host.clone(),
            socks_port: self.socks_port,
            allow_insecure: self.allow_insecure,
            domestic_region: self
                .domestic_region
                .as_ref()
                .map(|region| region.trim().to_ascii_lowercase())
                .filter(|region| !region.is_empty()),
            log_level: self.engine_log_level.clone(),
            dns_servers: self.dns_servers.clone(),
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms.max(1))
    }

    pub fn engine_dir(&self) -> PathBuf {
        self.engine_dir.clone().unwrap_or_else(default_engine_dir)
    }

    pub fn engine_binary(&self) -> PathBuf {
        self.engine_dir()
            .join(format!("{ENGINE_NAME}{}", std::env::consts::EXE_SUFFIX))
    }

    pub fn engine_spec(&self, paths: &AppPaths) -> EngineSpec {
        EngineSpec {
            binary: self.engine_binary(),
            args: self.engine_args.clone(),
            log_path: paths.engine_log(),
            log_cap: self.log_cap_lines.max(1),
        }
    }
}

fn default_engine_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(ENGINE_DIR)))
        .unwrap_or_else(|| PathBuf::from(ENGINE_DIR))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_under_root() {
        let paths = AppPaths::at("/data");
        assert_eq!(paths.config_dir(), Path::new("/data/xray/configs"));
        assert_eq!(paths.engine_log(), Path::new("/data/logs/xray.log"));
        assert_eq!(paths.settings(), Path::new("/data/settings.json"));
    }

    #[test]
    fn missing_file_gives_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = Settings::load(&AppPaths::at(tmp.path()));
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.socks_port, 10808);
        assert!(settings.allow_insecure);
    }

    #[test]
    fn garbage_file_gives_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = AppPaths::at(tmp.path());
        fs::write(paths.settings(), "{not json").unwrap();
        assert_eq!(Settings::load(&paths), Settings::default());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = AppPaths::at(tmp.path());
        fs::write(
            paths.settings(),
            r#"{"socksPort": 2080, "engineArgs": "legacy", "domesticRegion": null}"#,
        )
        .unwrap();
        let settings = Settings::load(&paths);
        assert_eq!(settings.socks_port, 2080);
        assert_eq!(settings.engine_args, EngineArgs::Legacy);
        assert_eq!(settings.domestic_region, None);
        assert_eq!(settings.socks_host, "127.0.0.1");
    }

    #[test]
    fn save_then_load() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = AppPaths::at(tmp.path().join("nested"));
        let settings = Settings {
            engine_dir: Some(PathBuf::from("/opt/xray")),
            allow_insecure: false,
            ..Settings::default()
        };
        settings.save(&paths).unwrap();
        let raw = fs::read_to_string(paths.settings()).unwrap();
        assert!(raw.contains("\"allowInsecure\": false"));
        assert_eq!(Settings::load(&paths), settings);
    }

    #[test]
    fn engine_spec_uses_paths() {
        let settings = Settings {
            engine_dir: Some(PathBuf::from("/opt/xray")),
            ..Settings::default()
        };
        let spec = settings.engine_spec(&AppPaths::at("/data"));
        assert!(spec.binary.starts_with("/opt/xray"));
        assert_eq!(spec.log_path, Path::new("/data/logs/xray.log"));
    }

    #[test]
    fn blank_region_disables_domestic_rules() {
        let settings = Settings {
            domestic_region: Some("  ".to_string()),
            ..Settings::default()
        };
        assert_eq!(settings.build_options().domestic_region, None);
    }
}
