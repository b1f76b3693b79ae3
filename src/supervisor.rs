//! Lifecycle of the external Xray process.
//!
//! One supervisor owns at most one child. `start` while running stops the
//! old child first, under the same lock, so two concurrent starts can never
//! leave two engines behind. Output lines and unexpected exits are published
//! to subscribers over channels.

use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::{ProcessRefreshKind, RefreshKind, System, UpdateKind};

#[cfg(target_os = "windows")]
use std::os::windows::io::AsRawHandle;
#[cfg(target_os = "windows")]
use std::os::windows::process::CommandExt;
#[cfg(target_os = "windows")]
use windows_sys::Win32::Foundation::CloseHandle;
#[cfg(target_os = "windows")]
use windows_sys::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, JobObjectExtendedLimitInformation,
    SetInformationJobObject, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
    JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
};

use crate::engine_log::{EngineLog, LogLine, LogStream};
use crate::error::SpawnError;

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

const MONITOR_INTERVAL: Duration = Duration::from_millis(500);
const CONFIG_PLACEHOLDER: &str = "{config}";

/// How the config path is handed to the engine. Xray releases differ here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineArgs {
    /// `xray run -c <path>`
    #[default]
    Run,
    /// `xray -config <path>`
    Legacy,
    /// Arbitrary arguments; `{config}` is replaced with the config path.
    Custom(Vec<String>),
}

impl EngineArgs {
    fn apply(&self, cmd: &mut Command, config_path: &Path) {
        match self {
            EngineArgs::Run => {
                cmd.arg("run").arg("-c").arg(config_path);
            }
            EngineArgs::Legacy => {
                cmd.arg("-config").arg(config_path);
            }
            EngineArgs::Custom(args) => {
                for arg in args {
                    if arg == CONFIG_PLACEHOLDER {
                        cmd.arg(config_path);
                    } else {
                        cmd.arg(arg);
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineSpec {
    pub binary: PathBuf,
    pub args: EngineArgs,
    pub log_path: PathBuf,
    pub log_cap: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Log(LogLine),
    /// The engine exited without `stop` being called. Sent once per exit.
    Crashed { code: Option<i32> },
}

#[cfg(target_os = "windows")]
#[derive(Debug)]
struct JobHandle(isize);

#[cfg(target_os = "windows")]
impl Drop for JobHandle {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.0);
        }
    }
}

#[cfg(target_os = "windows")]
fn create_job_object() -> std::io::Result<JobHandle> {
    let handle = unsafe { CreateJobObjectW(std::ptr::null_mut(), std::ptr::null()) };
    if handle == 0 {
        return Err(std::io::Error::last_os_error());
    }
    let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe { std::mem::zeroed() };
    info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
    let result = unsafe {
        SetInformationJobObject(
            handle,
            JobObjectExtendedLimitInformation,
            &mut info as *mut _ as *mut _,
            std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
        )
    };
    if result == 0 {
        let error = std::io::Error::last_os_error();
        unsafe {
            CloseHandle(handle);
        }
        return Err(error);
    }
    Ok(JobHandle(handle))
}

struct Running {
    child: Child,
    pid: u32,
}

#[derive(Default)]
struct SupervisorState {
    running: Option<Running>,
    log: Option<Arc<EngineLog>>,
    last_exit: Option<i32>,
    watch_token: u64,
    #[cfg(target_os = "windows")]
    job: Option<JobHandle>,
}

type SharedState = Arc<Mutex<SupervisorState>>;
type Subscribers = Arc<Mutex<Vec<Sender<SupervisorEvent>>>>;

pub struct Supervisor {
    spec: EngineSpec,
    state: SharedState,
    subscribers: Subscribers,
}

impl Supervisor {
    pub fn new(spec: EngineSpec) -> Self {
        Self {
            spec,
            state: Arc::new(Mutex::new(SupervisorState::default())),
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Log lines and crash notifications, in emission order.
    pub fn subscribe(&self) -> Receiver<SupervisorEvent> {
        let (tx, rx) = mpsc::channel();
        lock(&self.subscribers).push(tx);
        rx
    }

    pub fn start(&self, config_path: &Path) -> Result<u32, SpawnError> {
        if !self.spec.binary.is_file() {
            return Err(SpawnError::EngineMissing(self.spec.binary.clone()));
        }
        if !config_path.is_file() {
            return Err(SpawnError::ConfigMissing(config_path.to_path_buf()));
        }

        let mut guard = lock(&self.state);
        if stop_locked(&mut guard) {
            tracing::info!("replaced running engine");
        }

        let log = match guard.log.clone() {
            Some(log) => log,
            None => {
                let log = Arc::new(
                    EngineLog::open(&self.spec.log_path, self.spec.log_cap)
                        .map_err(SpawnError::LogFile)?,
                );
                guard.log = Some(log.clone());
                log
            }
        };
        log.note(&format!(
            "starting {} with {}",
            self.spec.binary.display(),
            config_path.display()
        ));

        let mut cmd = Command::new(&self.spec.binary);
        self.spec.args.apply(&mut cmd, config_path);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(target_os = "windows")]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let mut child = cmd.spawn().map_err(|e| {
            log.note(&format!("spawn failed: {e}"));
            SpawnError::Spawn(e)
        })?;

        #[cfg(target_os = "windows")]
        {
            if guard.job.is_none() {
                match create_job_object() {
                    Ok(job) => guard.job = Some(job),
                    Err(error) => tracing::warn!(%error, "job object unavailable"),
                }
            }
            if let Some(job) = guard.job.as_ref() {
                let _ = unsafe { AssignProcessToJobObject(job.0, child.as_raw_handle() as isize) };
            }
        }

        let pid = child.id();
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, LogStream::Stdout, log.clone(), self.subscribers.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, LogStream::Stderr, log, self.subscribers.clone());
        }

        guard.running = Some(Running {
            child,
            pid,
        });
        guard.last_exit = None;
        guard.watch_token = guard.watch_token.wrapping_add(1);
        let token = guard.watch_token;
        drop(guard);

        spawn_monitor(self.state.clone(), self.subscribers.clone(), token);
        tracing::info!(pid, config = %config_path.display(), "engine started");
        Ok(pid)
    }

    /// Kills the engine if it is running. Safe to call at any time.
    pub fn stop(&self) {
        let mut guard = lock(&self.state);
        if stop_locked(&mut guard) {
            tracing::info!("engine stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        let mut guard = lock(&self.state);
        if let Some(code) = reap_exited(&mut guard) {
            drop(guard);
            publish(&self.subscribers, SupervisorEvent::Crashed { code });
            return false;
        }
        guard.running.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        lock(&self.state).running.as_ref().map(|running| running.pid)
    }

    pub fn last_exit(&self) -> Option<i32> {
        lock(&self.state).last_exit
    }

    /// The most recent engine output lines, oldest first.
    pub fn recent_logs(&self) -> Vec<String> {
        lock(&self.state)
            .log
            .as_ref()
            .map(|log| log.recent())
            .unwrap_or_default()
    }

    /// Kills engine processes left behind by an earlier session, matched by
    /// executable path. Our own child is never touched.
    pub fn sweep_orphans(&self) -> usize {
        let own_pid = self.pid();
        let target = fs::canonicalize(&self.spec.binary).unwrap_or_else(|_| self.spec.binary.clone());
        let system = System::new_with_specifics(
            RefreshKind::new().with_processes(
                ProcessRefreshKind::new().with_exe(UpdateKind::OnlyIfNotSet),
            ),
        );

        let mut killed = 0;
        for (pid, process) in system.processes() {
            if Some(pid.as_u32()) == own_pid {
                continue;
            }
            let Some(exe) = process.exe() else {
                continue;
            };
            if exe == target.as_path() && process.kill() {
                tracing::warn!(pid = pid.as_u32(), "killed orphaned engine");
                killed += 1;
            }
        }
        killed
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn publish(subscribers: &Subscribers, event: SupervisorEvent) {
    lock(subscribers).retain(|tx| tx.send(event.clone()).is_ok());
}

fn stop_locked(state: &mut SupervisorState) -> bool {
    state.watch_token = state.watch_token.wrapping_add(1);
    let Some(mut running) = state.running.take() else {
        return false;
    };
    let _ = running.child.kill();
    let status = running.child.wait().ok();
    state.last_exit = status.and_then(|status| status.code());
    if let Some(log) = state.log.as_ref() {
        log.note(&format!("engine {} stopped", running.pid));
    }
    true
}

/// Takes the child out of the state if it has exited. The caller that gets
/// `Some` owns the crash notification.
fn reap_exited(state: &mut SupervisorState) -> Option<Option<i32>> {
    let running = state.running.as_mut()?;
    let code = match running.child.try_wait() {
        Ok(Some(status)) => status.code(),
        Ok(None) => return None,
        Err(error) => {
            tracing::warn!(%error, "engine wait failed");
            None
        }
    };
    let pid = running.pid;
    state.running = None;
    state.last_exit = code;
    state.watch_token = state.watch_token.wrapping_add(1);
    if let Some(log) = state.log.as_ref() {
        log.note(&format!("engine {pid} exited unexpectedly (code {code:?})"));
    }
    tracing::error!(pid, ?code, "engine exited unexpectedly");
    Some(code)
}

fn spawn_monitor(state: SharedState, subscribers: Subscribers, token: u64) {
    thread::spawn(move || loop {
        thread::sleep(MONITOR_INTERVAL);
        let code = {
            let mut guard = lock(&state);
            if guard.watch_token != token || guard.running.is_none() {
                return;
            }
            match reap_exited(&mut guard) {
                Some(code) => code,
                None => continue,
            }
        };
        publish(&subscribers, SupervisorEvent::Crashed { code });
        return;
    });
}

fn spawn_reader<R: Read + Send + 'static>(
    source: R,
    stream: LogStream,
    log: Arc<EngineLog>,
    subscribers: Subscribers,
) {
    thread::spawn(move || {
        let reader = BufReader::new(source);
        for chunk in reader.split(b'\n') {
            let Ok(bytes) = chunk else {
                return;
            };
            let text = String::from_utf8_lossy(&bytes);
            let text = text.trim_end_matches('\r');
            if text.is_empty() {
                continue;
            }
            let line = LogLine {
                stream,
                text: text.to_string(),
            };
            match stream {
                LogStream::Stdout => tracing::info!(target: "engine", "{}", line.text),
                LogStream::Stderr => tracing::warn!(target: "engine", "{}", line.text),
            }
            log.append(&line);
            publish(&subscribers, SupervisorEvent::Log(line));
        }
    });
}
