use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unsupported share link scheme: {0}")]
    UnsupportedScheme(String),
    #[error("malformed link: {0}")]
    MalformedUri(String),
    #[error("vmess payload is not valid base64")]
    InvalidBase64,
    #[error("vmess payload is not valid json: {0}")]
    InvalidVmessJson(String),
    #[error("invalid port: {0}")]
    InvalidPort(String),
    #[error("missing {0}")]
    MissingField(&'static str),
    #[error("unsupported transport network: {0}")]
    UnsupportedNetwork(String),
    #[error("unsupported transport security: {0}")]
    UnsupportedSecurity(String),
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("no server descriptors to build a config from")]
    EmptyInput,
    #[error("config io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("config serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("engine binary not found: {}", .0.display())]
    EngineMissing(PathBuf),
    #[error("config file not found: {}", .0.display())]
    ConfigMissing(PathBuf),
    #[error("failed to spawn engine: {0}")]
    Spawn(#[source] io::Error),
    #[error("failed to open engine log: {0}")]
    LogFile(#[source] io::Error),
}

#[derive(Debug, Error)]
pub enum ToggleError {
    #[error("system proxy command failed: {0}")]
    Command(String),
    #[error("system proxy io error: {0}")]
    Io(#[from] io::Error),
    #[cfg(target_os = "windows")]
    #[error("registry call {call} failed with code {code}")]
    Registry { call: &'static str, code: u32 },
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("account is not active (status: {0})")]
    InactiveAccount(String),
    #[error("no server at index {0}")]
    NoSelection(usize),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Toggle(#[from] ToggleError),
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("no home directory to place app data in")]
    NoDataDir,
    #[error("settings io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("settings serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}
