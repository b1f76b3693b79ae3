//! Connect and disconnect as single operations over parser, builder,
//! supervisor and system proxy.
//!
//! A failed connect leaves the proxy disabled and no engine running.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};

use serde::{Deserialize, Serialize};

use crate::config::{build, ConfigWriter};
use crate::error::{BuildError, ConnectError, ToggleError};
use crate::link::{parse_share_link, Endpoint, Protocol};
use crate::probe::{measure, measure_all, ProbeOutcome};
use crate::settings::{AppPaths, Settings};
use crate::supervisor::{EngineSpec, Supervisor, SupervisorEvent};
use crate::system_proxy::SystemProxy;

const ACTIVE_STATUS: &str = "active";

/// What the account panel reports: a status word and the share links the
/// account may use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountStatus {
    pub status: String,
    #[serde(default)]
    pub links: Vec<String>,
}

impl AccountStatus {
    pub fn is_active(&self) -> bool {
        self.status.trim().eq_ignore_ascii_case(ACTIVE_STATUS)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub tag: String,
    pub protocol: Protocol,
    pub server: Endpoint,
    pub config_path: PathBuf,
    pub pid: u32,
}

pub struct Session {
    settings: Settings,
    writer: ConfigWriter,
    supervisor: Arc<Supervisor>,
    proxy: Arc<dyn SystemProxy>,
    // Serializes connect, disconnect and crash handling.
    active: Arc<Mutex<Option<Connection>>>,
}

impl Session {
    pub fn new(
        settings: Settings,
        paths: &AppPaths,
        proxy: Arc<dyn SystemProxy>,
    ) -> Result<Self, BuildError> {
        let spec = settings.engine_spec(paths);
        Self::with_engine(settings, paths, spec, proxy)
    }

    pub fn with_engine(
        settings: Settings,
        paths: &AppPaths,
        spec: EngineSpec,
        proxy: Arc<dyn SystemProxy>,
    ) -> Result<Self, BuildError> {
        Ok(Self {
            writer: ConfigWriter::new(paths.config_dir())?,
            settings,
            supervisor: Arc::new(Supervisor::new(spec)),
            proxy,
            active: Arc::new(Mutex::new(None)),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn connect(
        &self,
        status: &AccountStatus,
        selected: usize,
    ) -> Result<Connection, ConnectError> {
        let mut active = lock(&self.active);
        let mut written = None;
        match self.try_connect(status, selected, &mut written) {
            Ok(connection) => {
                tracing::info!(
                    tag = %connection.tag,
                    server = %connection.server,
                    pid = connection.pid,
                    "connected"
                );
                *active = Some(connection.clone());
                Ok(connection)
            }
            Err(error) => {
                tracing::warn!(%error, "connect failed, rolling back");
                self.teardown(&mut active);
                if let Some(path) = written {
                    let _ = fs::remove_file(path);
                }
                Err(error)
            }
        }
    }

    fn try_connect(
        &self,
        status: &AccountStatus,
        selected: usize,
        written: &mut Option<PathBuf>,
    ) -> Result<Connection, ConnectError> {
        if !status.is_active() {
            return Err(ConnectError::InactiveAccount(status.status.clone()));
        }
        let link = status
            .links
            .get(selected)
            .ok_or(ConnectError::NoSelection(selected))?;
        let descriptor = parse_share_link(link)?;

        let options = self.settings.build_options();
        let document = build(std::slice::from_ref(&descriptor), &options)?;
        let config_path = self.writer.write(&document)?;
        *written = Some(config_path.clone());

        let pid = self.supervisor.start(&config_path)?;
        self.proxy.enable(&options.socks_host, options.socks_port)?;

        Ok(Connection {
            tag: descriptor.tag().to_string(),
            protocol: descriptor.protocol(),
            server: descriptor.endpoint().clone(),
            config_path,
            pid,
        })
    }

    /// Disables the system proxy, then stops the engine. The engine is
    /// stopped even when the proxy could not be reset.
    pub fn disconnect(&self) -> Result<(), ToggleError> {
        let mut active = lock(&self.active);
        let result = self.proxy.disable();
        self.supervisor.stop();
        if active.take().is_some() {
            tracing::info!("disconnected");
        }
        result
    }

    pub fn is_connected(&self) -> bool {
        let active = lock(&self.active);
        active.is_some() && self.supervisor.is_running()
    }

    pub fn connection(&self) -> Option<Connection> {
        lock(&self.active).clone()
    }

    /// Disables the system proxy whenever the engine dies on its own, then
    /// calls `on_crash` with the exit code. The thread ends with the session.
    pub fn watch_crashes<F>(&self, on_crash: F) -> JoinHandle<()>
    where
        F: Fn(Option<i32>) + Send + 'static,
    {
        let events = self.supervisor.subscribe();
        let supervisor: Weak<Supervisor> = Arc::downgrade(&self.supervisor);
        let proxy = self.proxy.clone();
        let active = self.active.clone();
        thread::spawn(move || {
            for event in events {
                let SupervisorEvent::Crashed { code } = event else {
                    continue;
                };
                {
                    let mut active = lock(&active);
                    let Some(supervisor) = supervisor.upgrade() else {
                        return;
                    };
                    // A reconnect may have won the lock first.
                    if supervisor.is_running() {
                        continue;
                    }
                    if let Err(error) = proxy.disable() {
                        tracing::error!(%error, "could not reset system proxy after crash");
                    }
                    active.take();
                }
                on_crash(code);
            }
        })
    }

    pub fn probe_selected(&self, status: &AccountStatus, selected: usize) -> ProbeOutcome {
        match status.links.get(selected) {
            Some(link) => measure(link, self.settings.probe_timeout()),
            None => ProbeOutcome::Failed,
        }
    }

    pub fn probe_all(&self, status: &AccountStatus) -> Vec<ProbeOutcome> {
        measure_all(&status.links, self.settings.probe_timeout())
    }

    fn teardown(&self, active: &mut Option<Connection>) {
        if let Err(error) = self.proxy.disable() {
            tracing::error!(%error, "could not reset system proxy");
        }
        self.supervisor.stop();
        active.take();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let mut active = lock(&self.active);
        if active.is_some() {
            self.teardown(&mut active);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
