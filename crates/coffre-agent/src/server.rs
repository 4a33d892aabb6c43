//! The agent daemon: singleton acquisition, accept loop, connection
//! handling, and the idle-grace teardown.

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use coffre_repository::Repository;
use coffre_storage::{CancelHandle, CancelToken};

use crate::commands::open_repository;
use crate::context::ExecContext;
use crate::error::{AgentError, AgentResult};
use crate::flock::FileLock;
use crate::packet::{self, Packet, PacketKind, Request};
use crate::subcommand::{flags, Subcommand};

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const STDIN_POLL: Duration = Duration::from_millis(100);

/// The daemon's listening half.
pub struct AgentServer {
    /// UNIX socket the daemon serves on.
    pub socket_path: PathBuf,
    /// Idle grace before the daemon exits after its last connection.
    pub teardown: Duration,
    /// Cache directory propagated to command contexts.
    pub cache_dir: PathBuf,
    /// Config directory propagated to command contexts.
    pub config_dir: PathBuf,
}

/// Packet encoder shared between the connection handler and the command's
/// output streams. One mutex serializes every write to the socket.
#[derive(Clone)]
struct SharedWriter {
    stream: Arc<Mutex<UnixStream>>,
    failed: Arc<AtomicBool>,
}

impl SharedWriter {
    fn new(stream: UnixStream) -> Self {
        SharedWriter {
            stream: Arc::new(Mutex::new(stream)),
            failed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn send(&self, packet: &Packet) {
        if self.failed.load(Ordering::SeqCst) {
            return;
        }
        let mut stream = self.stream.lock().unwrap();
        if let Err(e) = packet::encode(&mut *stream, packet) {
            self.failed.store(true, Ordering::SeqCst);
            warn!(error = %e, "client write error");
        }
    }
}

/// `Write` adapter turning command output into stdout/stderr packets.
struct PacketWriter {
    kind: PacketKind,
    writer: SharedWriter,
}

impl Write for PacketWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.writer
            .send(&Packet::output(self.kind, buf.to_vec()));
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// `Read` adapter pulling stdin from the client on demand.
struct StdinReader {
    writer: SharedWriter,
    rx: Receiver<Packet>,
    token: CancelToken,
    buf: Vec<u8>,
}

impl Read for StdinReader {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if !self.buf.is_empty() {
                let n = out.len().min(self.buf.len());
                out[..n].copy_from_slice(&self.buf[..n]);
                self.buf.drain(..n);
                return Ok(n);
            }

            self.writer.send(&Packet::stdin_pull());
            loop {
                if self.token.is_cancelled() {
                    return Ok(0);
                }
                match self.rx.recv_timeout(STDIN_POLL) {
                    Ok(packet) => {
                        if !packet.err.is_empty() {
                            return Err(std::io::Error::new(
                                std::io::ErrorKind::Other,
                                packet.err,
                            ));
                        }
                        if packet.eof && packet.data.is_empty() {
                            return Ok(0);
                        }
                        self.buf.extend_from_slice(&packet.data);
                        break;
                    }
                    Err(mpsc::RecvTimeoutError::Timeout) => continue,
                    Err(mpsc::RecvTimeoutError::Disconnected) => return Ok(0),
                }
            }
        }
    }
}

impl AgentServer {
    /// Binds the socket and serves until the token fires, another daemon
    /// is detected, or the idle grace expires.
    pub fn listen_and_serve(&self, token: &CancelToken) -> AgentResult<()> {
        let lock = FileLock::acquire(&self.socket_path.with_extension("sock.agent-lock"))?;

        // someone may already be serving: a successful dial settles it
        if UnixStream::connect(&self.socket_path).is_ok() {
            lock.unlock();
            return Err(AgentError::AlreadyRunning);
        }
        let _ = std::fs::remove_file(&self.socket_path);

        let listener = UnixListener::bind(&self.socket_path)?;
        listener.set_nonblocking(true)?;
        lock.unlock();
        info!(socket = %self.socket_path.display(), "agent listening");

        // the daemon's own stop signal: fired by `agent stop`, the idle
        // teardown, or cancellation of the caller's token
        let (stop_token, stop_handle) = token.child();
        let inflight = Arc::new(AtomicI64::new(0));
        let next_id = Arc::new(AtomicI64::new(0));

        loop {
            if stop_token.is_cancelled() {
                break;
            }
            match listener.accept() {
                Ok((stream, _addr)) => {
                    stream.set_nonblocking(false)?;
                    inflight.fetch_add(1, Ordering::SeqCst);
                    let my_id = next_id.fetch_add(1, Ordering::SeqCst) + 1;

                    let conn = Connection {
                        stream,
                        stop_token: stop_token.clone(),
                        stop_handle: stop_handle.clone(),
                        cache_dir: self.cache_dir.clone(),
                        config_dir: self.config_dir.clone(),
                    };
                    let inflight = inflight.clone();
                    let next_id = next_id.clone();
                    let stop_token = stop_token.clone();
                    let stop_handle = stop_handle.clone();
                    let teardown = self.teardown;
                    std::thread::spawn(move || {
                        conn.handle();
                        let remaining = inflight.fetch_sub(1, Ordering::SeqCst) - 1;
                        if remaining == 0 && !stop_token.wait_timeout(teardown) {
                            // nobody showed up during the grace period and
                            // we are still the newest connection: retire
                            if next_id.load(Ordering::SeqCst) == my_id
                                && inflight.load(Ordering::SeqCst) == 0
                            {
                                debug!("idle grace expired, tearing down");
                                stop_handle.cancel();
                            }
                        }
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if stop_token.wait_timeout(ACCEPT_POLL) {
                        break;
                    }
                }
                Err(e) => {
                    let _ = std::fs::remove_file(&self.socket_path);
                    return Err(e.into());
                }
            }
        }

        let _ = std::fs::remove_file(&self.socket_path);
        Ok(())
    }
}

struct Connection {
    stream: UnixStream,
    stop_token: CancelToken,
    stop_handle: CancelHandle,
    cache_dir: PathBuf,
    config_dir: PathBuf,
}

impl Connection {
    fn handle(mut self) {
        // handshake: client sends its version first
        let mut reader = match self.stream.try_clone() {
            Ok(reader) => reader,
            Err(e) => {
                warn!(error = %e, "failed to clone connection stream");
                return;
            }
        };
        if packet::exchange_versions(&mut reader, &mut self.stream, false).is_err() {
            return;
        }

        let request: Request = match packet::decode(&mut reader) {
            Ok(request) => request,
            Err(e) if e.is_disconnect() => {
                warn!("client disconnected during initial request");
                return;
            }
            Err(e) => {
                warn!(error = %e, "failed to decode request");
                return;
            }
        };

        let writer = SharedWriter::new(match self.stream.try_clone() {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "failed to clone connection stream");
                return;
            }
        });

        // per-connection cancellation, fired when the client goes away
        let (conn_token, conn_handle) = self.stop_token.child();
        let stdin_token = conn_token.clone();

        // pump the read side: stdin pushes flow to the channel; any decode
        // failure means the client disconnected and cancels the command
        let (stdin_tx, stdin_rx): (SyncSender<Packet>, Receiver<Packet>) = mpsc::sync_channel(1);
        let pump_stderr = writer.clone();
        std::thread::spawn(move || {
            pump_packets(reader, stdin_tx, conn_handle, pump_stderr);
        });

        info!(
            command = %request.name.join(" "),
            location = request
                .store_config
                .get("location")
                .map(String::as_str)
                .unwrap_or("-"),
            "serving request"
        );

        let mut ctx = ExecContext {
            token: conn_token,
            store_config: request.store_config.clone(),
            cache_dir: self.cache_dir,
            config_dir: self.config_dir,
            stdin: Box::new(StdinReader {
                writer: writer.clone(),
                rx: stdin_rx,
                token: stdin_token,
                buf: Vec::new(),
            }),
            stdout: Box::new(PacketWriter {
                kind: PacketKind::Stdout,
                writer: writer.clone(),
            }),
            stderr: Box::new(PacketWriter {
                kind: PacketKind::Stderr,
                writer: writer.clone(),
            }),
            shutdown: Some(self.stop_handle),
        };

        let (exit_code, err) = execute_request(&mut ctx, &request);
        writer.send(&Packet::exit(exit_code, err));
    }
}

fn pump_packets(
    mut reader: UnixStream,
    stdin_tx: SyncSender<Packet>,
    conn_handle: CancelHandle,
    writer: SharedWriter,
) {
    loop {
        match packet::decode::<Packet>(&mut reader) {
            Ok(packet) => {
                if packet.kind == PacketKind::Stdin && stdin_tx.send(packet).is_err() {
                    return;
                }
            }
            Err(e) => {
                if !e.is_disconnect() {
                    writer.send(&Packet::output(
                        PacketKind::Stderr,
                        format!("failed to decode: {e}\n").into_bytes(),
                    ));
                } else {
                    debug!("client disconnected");
                }
                conn_handle.cancel();
                return;
            }
        }
    }
}

/// Decodes and runs one request, converting every failure into an exit
/// status. The listener never goes down on a subcommand error.
fn execute_request(ctx: &mut ExecContext, request: &Request) -> (i32, Option<String>) {
    let subcommand = match Subcommand::decode(&request.name, &request.subcommand) {
        Ok(subcommand) => subcommand,
        Err(e) => return (1, Some(e.to_string())),
    };

    let cmd_flags = subcommand.flags();
    let repo: Option<Repository> = if cmd_flags
        & (flags::BEFORE_REPOSITORY_OPEN | flags::BEFORE_REPOSITORY_WITH_STORAGE)
        != 0
    {
        None
    } else {
        match open_repository(&ctx.token, &ctx.store_config) {
            Ok(repo) => Some(repo),
            Err(e) => return (1, Some(format!("failed to open repository: {e}"))),
        }
    };

    let result = subcommand.execute(ctx, repo.as_ref());
    if let Some(repo) = repo {
        if let Err(e) = repo.close() {
            warn!(error = %e, "failed to close repository");
        }
    }
    match result {
        Ok(exit_code) => (exit_code, None),
        Err(e) => (1, Some(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_writer_reports_full_writes() {
        let (a, _b) = UnixStream::pair().unwrap();
        let writer = SharedWriter::new(a);
        let mut stdout = PacketWriter {
            kind: PacketKind::Stdout,
            writer,
        };
        assert_eq!(stdout.write(b"hello").unwrap(), 5);
    }

    #[test]
    fn test_shared_writer_survives_peer_hangup() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(b);
        let writer = SharedWriter::new(a);
        // large enough to overflow socket buffers and surface the error
        for _ in 0..64 {
            writer.send(&Packet::output(PacketKind::Stdout, vec![0u8; 1 << 16]));
        }
        assert!(writer.failed.load(Ordering::SeqCst));
        // further sends are no-ops, not panics
        writer.send(&Packet::exit(0, None));
    }
}
