#![cfg(unix)]

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use xray_shell::{
    read_config, AccountStatus, AppPaths, ConnectError, EngineArgs, EngineSpec, NoopProxy,
    ProbeOutcome, Session, Settings, SpawnError,
};

fn shell_engine(paths: &AppPaths, script: &str) -> EngineSpec {
    EngineSpec {
        binary: PathBuf::from("/bin/sh"),
        args: EngineArgs::Custom(vec![
            "-c".to_string(),
            script.to_string(),
            "{config}".to_string(),
        ]),
        log_path: paths.engine_log(),
        log_cap: 20,
    }
}

fn account(links: Vec<String>) -> AccountStatus {
    AccountStatus {
        status: "active".to_string(),
        links,
    }
}

#[test]
fn connect_writes_single_server_config() {
    let tmp = tempfile::tempdir().unwrap();
    let paths = AppPaths::at(tmp.path());
    let session = Session::with_engine(
        Settings::default(),
        &paths,
        shell_engine(&paths, "echo engine up; exec sleep 30"),
        Arc::new(NoopProxy),
    )
    .unwrap();

    let status = account(vec![
        "trojan://a@one.example.com:443#one".to_string(),
        "trojan://b@two.example.com:443#two".to_string(),
    ]);
    let connection = session.connect(&status, 1).unwrap();
    assert!(connection.config_path.starts_with(paths.config_dir()));

    let document = read_config(&connection.config_path).unwrap();
    assert_eq!(document.catch_all_tag(), Some("two"));
    assert!(document.outbound("one").is_none());
    assert_eq!(document.inbounds[0].port, 10808);

    // Reconnecting replaces the engine rather than adding a second one.
    let again = session.connect(&status, 0).unwrap();
    assert_ne!(again.pid, connection.pid);
    assert_eq!(session.supervisor().pid(), Some(again.pid));

    session.disconnect().unwrap();
    assert!(!session.is_connected());
    assert!(paths.engine_log().is_file());
}

#[test]
fn failed_connect_after_success_leaves_nothing_running() {
    let tmp = tempfile::tempdir().unwrap();
    let paths = AppPaths::at(tmp.path());
    let session = Session::with_engine(
        Settings::default(),
        &paths,
        shell_engine(&paths, "exec sleep 30"),
        Arc::new(NoopProxy),
    )
    .unwrap();

    let status = account(vec![
        "trojan://a@one.example.com:443#one".to_string(),
        "vless://@broken.example.com:443".to_string(),
    ]);
    session.connect(&status, 0).unwrap();
    assert!(session.is_connected());

    let err = session.connect(&status, 1).unwrap_err();
    assert!(matches!(err, ConnectError::Parse(_)));
    assert!(!session.is_connected());
    assert!(!session.supervisor().is_running());
}

#[test]
fn missing_engine_binary_is_a_spawn_error() {
    let tmp = tempfile::tempdir().unwrap();
    let paths = AppPaths::at(tmp.path());
    let settings = Settings {
        engine_dir: Some(tmp.path().join("xray-core")),
        ..Settings::default()
    };
    let session = Session::new(settings, &paths, Arc::new(NoopProxy)).unwrap();
    let err = session
        .connect(&account(vec!["trojan://a@one.example.com:443#one".to_string()]), 0)
        .unwrap_err();
    assert!(matches!(err, ConnectError::Spawn(SpawnError::EngineMissing(_))));
}

#[test]
fn probes_follow_link_order() {
    let tmp = tempfile::tempdir().unwrap();
    let paths = AppPaths::at(tmp.path());
    let settings = Settings {
        probe_timeout_ms: 1000,
        ..Settings::default()
    };
    let session = Session::new(settings, &paths, Arc::new(NoopProxy)).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let open = listener.local_addr().unwrap().port();
    let closed = {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };
    let status = account(vec![
        format!("trojan://a@127.0.0.1:{open}#open"),
        format!("trojan://a@127.0.0.1:{closed}#closed"),
    ]);

    assert!(session.probe_selected(&status, 0).is_success());
    let outcomes = session.probe_all(&status);
    assert!(outcomes[0].is_success());
    assert!(!outcomes[1].is_success());
    assert_eq!(outcomes[1].as_millis_or_sentinel(), -1);
    assert!(session.settings().probe_timeout() <= Duration::from_secs(1));
    assert_ne!(outcomes[1], ProbeOutcome::Latency(Duration::ZERO));
}
