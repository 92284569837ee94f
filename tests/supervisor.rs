use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
    thread,
    time::{Duration, Instant},
};

use assert_cmd::prelude::*;
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use pman::{
    config::{ConfigBuilder, ProgramConfigBuilder},
    control::{Client, RequestOp},
    program::Status,
    service::StatusEntry,
    signal::SignalFlags,
    Supervisor,
};

fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(25));
    }
}

fn entry(name: &str, status: Status) -> StatusEntry {
    StatusEntry {
        name: name.to_string(),
        status,
    }
}

#[test]
fn remote_control_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("pman.sock");
    let pidfile = dir.path().join("pman.pid");

    let config = ConfigBuilder::default()
        .pidfile(&pidfile)
        .logfile(dir.path().join("pman.log"))
        .socket(&socket)
        .poll_interval(Duration::from_millis(50))
        .stop_grace(Duration::from_secs(2))
        .daemonize(false)
        .program(
            ProgramConfigBuilder::default()
                .name("web")
                .command(vec!["/bin/sleep".to_string(), "30".to_string()])
                .logfile(dir.path().join("web.log"))
                .autorestart(true)
                .build()
                .unwrap(),
        )
        .program(
            ProgramConfigBuilder::default()
                .name("worker")
                .command(vec!["/bin/sleep".to_string(), "30".to_string()])
                .logfile(dir.path().join("worker.log"))
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();

    let flags: &'static SignalFlags = Box::leak(Box::new(SignalFlags::new()));
    let supervisor = Supervisor::with_flags(config, flags);
    let running = thread::spawn(move || supervisor.run());

    let client = Client::new(&socket);
    let all_running = vec![entry("web", Status::Running), entry("worker", Status::Running)];
    eventually("both programs to run", || {
        client.request(RequestOp::Status, "").ok() == Some(all_running.clone())
    });
    assert!(pidfile.exists());

    assert_eq!(
        client.request(RequestOp::Stop, "web").unwrap(),
        vec![entry("web", Status::Stopped)]
    );
    assert_eq!(
        client.request(RequestOp::Status, "all").unwrap(),
        vec![entry("web", Status::Stopped), entry("worker", Status::Running)]
    );

    // stopping twice is harmless
    assert_eq!(
        client.request(RequestOp::Stop, "web").unwrap(),
        vec![entry("web", Status::Stopped)]
    );

    assert_eq!(
        client.request(RequestOp::Start, "all").unwrap(),
        all_running
    );
    assert!(client.request(RequestOp::Status, "ghost").unwrap().is_empty());

    flags.raise_terminate();
    running.join().unwrap().unwrap();

    assert!(!pidfile.exists());
    assert!(!socket.exists());
}

fn write_config(dir: &Path) -> PathBuf {
    let path = dir.join("pman.toml");
    fs::write(
        &path,
        r#"
            pidfile = "pman.pid"
            logfile = "pman.log"
            socket = "pman.sock"
            poll_interval_ms = 50

            [[program]]
            name = "web"
            command = ["/bin/sh", "-c", "echo hello; exec sleep 30"]
            logfile = "web.log"
            autorestart = true
        "#,
    )
    .unwrap();
    path
}

fn pman(config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("pman").unwrap();
    cmd.arg("-c").arg(config);
    cmd
}

#[test]
fn foreground_daemon_answers_and_exits_on_sigterm() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    let mut daemon = pman(&config).arg("--foreground").spawn().unwrap();

    eventually("web to be reported running", || {
        let output = pman(&config).arg("status").output().unwrap();
        output.status.success() && output.stdout == b"web\tRUNNING\n"
    });

    let rival = pman(&config).arg("--foreground").output().unwrap();
    assert_eq!(rival.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&rival.stderr).contains("already running"));

    for op in &["status", "start", "stop"] {
        let unknown = pman(&config).arg(op).arg("ghost").output().unwrap();
        assert!(unknown.status.success(), "{} ghost", op);
        assert!(unknown.stdout.is_empty(), "{} ghost", op);
        assert!(
            String::from_utf8_lossy(&unknown.stderr).contains("no program named \"ghost\""),
            "{} ghost",
            op
        );
    }

    let log = dir.path().join("web.log");
    eventually("program output in its log", || {
        fs::read_to_string(&log).map_or(false, |s| s.contains("hello"))
    });

    #[allow(clippy::cast_possible_wrap)]
    let pid = Pid::from_raw(daemon.id() as i32);
    kill(pid, Signal::SIGTERM).unwrap();
    assert!(daemon.wait().unwrap().success());

    assert!(!dir.path().join("pman.pid").exists());
    assert!(!dir.path().join("pman.sock").exists());
}
