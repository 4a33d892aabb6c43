//! End-to-end daemon tests over a real UNIX socket.

use std::io::Cursor;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use coffre_agent::client::Client;
use coffre_agent::server::AgentServer;
use coffre_agent::subcommand::{RmArgs, Subcommand};
use coffre_agent::AgentError;
use coffre_repository::snapshot::{self, BackupOptions};
use coffre_repository::{CreateOptions, Repository, Secret};
use coffre_storage::backend::StoreConfig;
use coffre_storage::{cancel_pair, CancelHandle, CancelToken};

struct TestDaemon {
    socket: PathBuf,
    handle: CancelHandle,
    thread: std::thread::JoinHandle<Result<(), AgentError>>,
}

fn start_daemon(dir: &Path, teardown: Duration) -> TestDaemon {
    let cache_dir = dir.join("cache");
    std::fs::create_dir_all(&cache_dir).unwrap();
    let socket = cache_dir.join("agent.sock");

    let server = AgentServer {
        socket_path: socket.clone(),
        teardown,
        cache_dir,
        config_dir: dir.join("config"),
    };
    let (token, handle) = cancel_pair();
    let thread = std::thread::spawn(move || server.listen_and_serve(&token));

    let deadline = Instant::now() + Duration::from_secs(5);
    while !socket.exists() {
        assert!(Instant::now() < deadline, "daemon never bound its socket");
        std::thread::sleep(Duration::from_millis(10));
    }
    TestDaemon {
        socket,
        handle,
        thread,
    }
}

fn repo_config(dir: &Path) -> StoreConfig {
    let mut config = StoreConfig::new();
    config.insert(
        "location".into(),
        format!("fs://{}", dir.join("repo").display()),
    );
    config
}

fn seeded_repository(dir: &Path) -> StoreConfig {
    let token = CancelToken::never();
    let config = repo_config(dir);
    let repo = Repository::create(&token, &config, CreateOptions::default()).unwrap();

    let source = dir.join("source");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(source.join("file.txt"), b"snapshot me").unwrap();
    snapshot::backup(&token, &repo, &source, &BackupOptions::default()).unwrap();
    repo.close().unwrap();
    config
}

/// S4: `rm --latest --apply` through the agent removes the only snapshot.
#[test]
fn rm_latest_apply_through_agent() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(dir.path(), Duration::from_secs(600));
    let store_config = seeded_repository(dir.path());

    let rm = Subcommand::Rm(RmArgs {
        latest: true,
        apply: true,
        ..Default::default()
    });
    let mut client = Client::connect(&daemon.socket, false).unwrap();
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let (exit_code, err) = client
        .run(
            &rm,
            &store_config,
            &mut Cursor::new(Vec::new()),
            &mut stdout,
            &mut stderr,
        )
        .unwrap();
    assert_eq!(exit_code, 0, "stderr: {}", String::from_utf8_lossy(&stderr));
    assert!(err.is_none());

    // a fresh opener sees no snapshots
    let token = CancelToken::never();
    let repo = Repository::open(&token, &store_config, Secret::None).unwrap();
    assert!(repo.list_snapshots().is_empty());

    daemon.handle.cancel();
    daemon.thread.join().unwrap().unwrap();
}

/// The plan path does not delete anything.
#[test]
fn rm_without_apply_only_plans() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(dir.path(), Duration::from_secs(600));
    let store_config = seeded_repository(dir.path());

    let rm = Subcommand::Rm(RmArgs {
        latest: true,
        ..Default::default()
    });
    let mut client = Client::connect(&daemon.socket, false).unwrap();
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let (exit_code, _err) = client
        .run(
            &rm,
            &store_config,
            &mut Cursor::new(Vec::new()),
            &mut stdout,
            &mut stderr,
        )
        .unwrap();
    assert_eq!(exit_code, 0);
    let plan = String::from_utf8_lossy(&stdout);
    assert!(plan.contains("would remove"), "plan output: {plan}");

    let token = CancelToken::never();
    let repo = Repository::open(&token, &store_config, Secret::None).unwrap();
    assert_eq!(repo.list_snapshots().len(), 1);

    daemon.handle.cancel();
    daemon.thread.join().unwrap().unwrap();
}

/// S5: a second daemon on the same socket exits with AlreadyRunning while
/// the first keeps accepting clients.
#[test]
fn second_daemon_exits_already_running() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(dir.path(), Duration::from_secs(600));

    let second = AgentServer {
        socket_path: daemon.socket.clone(),
        teardown: Duration::from_secs(600),
        cache_dir: dir.path().join("cache"),
        config_dir: dir.path().join("config"),
    };
    let (token, _handle) = cancel_pair();
    match second.listen_and_serve(&token) {
        Err(AgentError::AlreadyRunning) => {}
        other => panic!("expected AlreadyRunning, got {other:?}"),
    }

    // the first daemon still serves
    let store_config = seeded_repository(dir.path());
    let rm = Subcommand::Rm(RmArgs {
        latest: true,
        ..Default::default()
    });
    let mut client = Client::connect(&daemon.socket, false).unwrap();
    let (exit_code, _) = client
        .run(
            &rm,
            &store_config,
            &mut Cursor::new(Vec::new()),
            &mut Vec::new(),
            &mut Vec::new(),
        )
        .unwrap();
    assert_eq!(exit_code, 0);

    daemon.handle.cancel();
    daemon.thread.join().unwrap().unwrap();
}

/// S6: a client that hangs up mid-protocol does not take the daemon down;
/// the next client is served normally.
#[test]
fn daemon_survives_client_hangup() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(dir.path(), Duration::from_secs(600));

    // connect and vanish before even handshaking
    drop(UnixStream::connect(&daemon.socket).unwrap());

    // connect, handshake, then hang up before sending a request
    {
        let _client = Client::connect(&daemon.socket, false).unwrap();
    }

    // a well-behaved client still gets service
    let store_config = seeded_repository(dir.path());
    let rm = Subcommand::Rm(RmArgs {
        latest: true,
        apply: true,
        ..Default::default()
    });
    let mut client = Client::connect(&daemon.socket, false).unwrap();
    let (exit_code, err) = client
        .run(
            &rm,
            &store_config,
            &mut Cursor::new(Vec::new()),
            &mut Vec::new(),
            &mut Vec::new(),
        )
        .unwrap();
    assert_eq!(exit_code, 0, "err: {err:?}");

    daemon.handle.cancel();
    daemon.thread.join().unwrap().unwrap();
}

/// The daemon retires on its own once the idle grace expires after the
/// last connection.
#[test]
fn idle_grace_tears_daemon_down() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(dir.path(), Duration::from_millis(50));
    let store_config = seeded_repository(dir.path());

    let rm = Subcommand::Rm(RmArgs {
        latest: true,
        ..Default::default()
    });
    let mut client = Client::connect(&daemon.socket, false).unwrap();
    let _ = client
        .run(
            &rm,
            &store_config,
            &mut Cursor::new(Vec::new()),
            &mut Vec::new(),
            &mut Vec::new(),
        )
        .unwrap();
    drop(client);

    // no cancel from us: the teardown timer must end the daemon
    let result = daemon.thread.join().unwrap();
    assert!(result.is_ok());
    let _ = daemon.handle;
}

/// `agent stop` through the RPC path shuts the daemon down cleanly.
#[test]
fn agent_stop_shuts_daemon_down() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(dir.path(), Duration::from_secs(600));

    let mut client = Client::connect(&daemon.socket, false).unwrap();
    let (exit_code, err) = client
        .run(
            &Subcommand::AgentStop,
            &StoreConfig::new(),
            &mut Cursor::new(Vec::new()),
            &mut Vec::new(),
            &mut Vec::new(),
        )
        .unwrap();
    assert_eq!(exit_code, 0, "err: {err:?}");

    daemon.thread.join().unwrap().unwrap();
    let _ = daemon.handle;
}

/// An unknown command produces an error exit packet, not a dead daemon.
#[test]
fn unknown_repository_reports_through_exit_packet() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(dir.path(), Duration::from_secs(600));

    let mut missing = StoreConfig::new();
    missing.insert(
        "location".into(),
        format!("fs://{}", dir.path().join("nothing-here").display()),
    );
    let rm = Subcommand::Rm(RmArgs {
        latest: true,
        ..Default::default()
    });
    let mut client = Client::connect(&daemon.socket, false).unwrap();
    let (exit_code, err) = client
        .run(
            &rm,
            &missing,
            &mut Cursor::new(Vec::new()),
            &mut Vec::new(),
            &mut Vec::new(),
        )
        .unwrap();
    assert_eq!(exit_code, 1);
    assert!(err.is_some());

    daemon.handle.cancel();
    daemon.thread.join().unwrap().unwrap();
}
