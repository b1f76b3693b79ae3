pub mod config;
pub mod engine_log;
pub mod error;
pub mod link;
pub mod logging;
pub mod probe;
pub mod session;
pub mod settings;
pub mod supervisor;
pub mod system_proxy;

/// Where the engine's SOCKS inbound listens unless settings say otherwise.
pub const LOCAL_PROXY_HOST: &str = "127.0.0.1";
pub const LOCAL_PROXY_PORT: u16 = 10808;

pub use config::{build, read_config, BuildOptions, ConfigWriter, ProxyConfigDocument};
pub use error::{BuildError, ConnectError, ParseError, SettingsError, SpawnError, ToggleError};
pub use link::{endpoint_of, parse_links, parse_share_link, Endpoint, ParsedBatch, Protocol, ServerDescriptor};
pub use probe::{measure, measure_all, ProbeOutcome};
pub use session::{AccountStatus, Connection, Session};
pub use settings::{AppPaths, Settings};
pub use supervisor::{EngineArgs, EngineSpec, Supervisor, SupervisorEvent};
pub use system_proxy::{platform_proxy, NoopProxy, SystemProxy};
