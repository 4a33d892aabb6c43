//! Agent client: dial, spawn-if-needed, and the packet pump.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, warn};

use coffre_storage::backend::StoreConfig;

use crate::context::ExecContext;
use crate::error::{AgentError, AgentResult};
use crate::flock::FileLock;
use crate::packet::{self, Packet, PacketKind, Request, STDIN_CHUNK};
use crate::subcommand::{flags, Subcommand};

const MAX_DIAL_ATTEMPTS: u32 = 1000;
const DIAL_RETRY: Duration = Duration::from_millis(5);

/// A connected, handshaken agent client.
pub struct Client {
    stream: UnixStream,
}

impl Client {
    /// Dials the agent socket. If nothing listens: takes the dial lock,
    /// retries, spawns `coffre agent start` once, and keeps polling with a
    /// short delay up to a bounded number of attempts.
    pub fn connect(socket_path: &Path, ignore_version: bool) -> AgentResult<Client> {
        let mut lock: Option<FileLock> = None;
        let mut spawned = false;
        let mut attempt = 0u32;

        let stream = loop {
            match UnixStream::connect(socket_path) {
                Ok(stream) => break stream,
                Err(_) => {
                    attempt += 1;
                    if attempt > MAX_DIAL_ATTEMPTS {
                        return Err(AgentError::AgentUnavailable);
                    }

                    if lock.is_none() {
                        let lock_path = socket_path.with_extension("sock.lock");
                        lock = Some(FileLock::acquire(&lock_path)?);
                        // always retry at least once more: another client
                        // may have started the agent and released the lock
                        // between our dial and the acquisition
                        continue;
                    }

                    if !spawned {
                        spawn_agent()?;
                        spawned = true;
                    }
                    std::thread::sleep(DIAL_RETRY);
                }
            }
        };
        drop(lock);

        let mut client = Client { stream };
        client.handshake(ignore_version)?;
        Ok(client)
    }

    fn handshake(&mut self, ignore_version: bool) -> AgentResult<()> {
        let mut reader = self.stream.try_clone()?;
        let theirs = packet::exchange_versions(&mut reader, &mut self.stream, true)?;
        if !ignore_version && theirs != packet::VERSION.as_bytes() {
            return Err(AgentError::WrongVersion {
                theirs: String::from_utf8_lossy(&theirs).to_string(),
            });
        }
        Ok(())
    }

    /// Sends the request and pumps packets until the terminal exit.
    /// Returns the exit code and the daemon-reported error, if any.
    pub fn run(
        &mut self,
        subcommand: &Subcommand,
        store_config: &StoreConfig,
        stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
    ) -> AgentResult<(i32, Option<String>)> {
        if subcommand.flags() & flags::AGENT_SUPPORT == 0 {
            return Err(AgentError::NoAgentSupport(subcommand.name().join(" ")));
        }

        let request = Request {
            name: subcommand.name(),
            store_config: store_config.clone(),
            subcommand: subcommand.encode_args()?,
        };
        packet::encode(&mut self.stream, &request)?;

        let mut reader = self.stream.try_clone()?;
        loop {
            let packet: Packet = match packet::decode(&mut reader) {
                Ok(packet) => packet,
                Err(e) if e.is_disconnect() => break,
                Err(e) => return Err(e),
            };
            match packet.kind {
                PacketKind::Stdin => {
                    let mut buf = [0u8; STDIN_CHUNK];
                    let mut push = Packet::output(PacketKind::Stdin, Vec::new());
                    match stdin.read(&mut buf) {
                        Ok(0) => push.eof = true,
                        Ok(n) => push.data = buf[..n].to_vec(),
                        Err(e) => {
                            push.eof = true;
                            push.err = e.to_string();
                        }
                    }
                    packet::encode(&mut self.stream, &push)?;
                }
                PacketKind::Stdout => stdout.write_all(&packet.data)?,
                PacketKind::Stderr => stderr.write_all(&packet.data)?,
                PacketKind::Exit => {
                    let err = if packet.err.is_empty() {
                        None
                    } else {
                        Some(packet.err)
                    };
                    return Ok((packet.exit_code, err));
                }
            }
        }
        debug!("agent closed the connection without an exit packet");
        Ok((0, None))
    }
}

fn spawn_agent() -> AgentResult<()> {
    let exe = std::env::current_exe()?;
    match std::process::Command::new(exe)
        .args(["agent", "start"])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
    {
        Ok(_child) => Ok(()),
        Err(e) => {
            warn!(error = %e, "failed to spawn the agent");
            Err(AgentError::Io(e))
        }
    }
}

/// Runs a subcommand through the agent using the context's streams,
/// surfacing the daemon's exit code.
pub fn execute_rpc(
    ctx: &mut ExecContext,
    subcommand: &Subcommand,
    store_config: &StoreConfig,
) -> AgentResult<i32> {
    let ignore_version = subcommand.flags() & flags::IGNORE_VERSION != 0;
    let mut client = Client::connect(&ctx.agent_socket(), ignore_version)?;
    let (exit_code, err) = client.run(
        subcommand,
        store_config,
        ctx.stdin.as_mut(),
        ctx.stdout.as_mut(),
        ctx.stderr.as_mut(),
    )?;
    if let Some(err) = err {
        writeln!(ctx.stderr, "{}: {err}", subcommand.name().join(" "))?;
    }
    Ok(exit_code)
}
