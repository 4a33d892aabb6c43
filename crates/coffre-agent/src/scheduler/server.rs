//! Scheduler control socket.
//!
//! A separate UNIX socket speaking one msgpack verb: `stop`, which drains
//! every task worker and ends the scheduler process.

use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use coffre_storage::{CancelHandle, CancelToken};

use crate::error::AgentResult;
use crate::packet;

const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Control request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    /// Verb; only `stop` is understood.
    pub verb: String,
}

/// Control response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    /// Process-style exit code.
    pub exit_code: i32,
    /// Error text, empty on success.
    pub err: String,
}

/// Serves the control socket until `stop` arrives or the token fires.
/// `tasks_handle` cancels the task workers.
pub fn listen_and_serve(
    token: &CancelToken,
    socket_path: &Path,
    tasks_handle: CancelHandle,
) -> AgentResult<()> {
    let _ = std::fs::remove_file(socket_path);
    let listener = UnixListener::bind(socket_path)?;
    listener.set_nonblocking(true)?;
    info!(socket = %socket_path.display(), "scheduler control listening");

    let mut stopping = false;
    while !stopping {
        if token.is_cancelled() {
            break;
        }
        match listener.accept() {
            Ok((stream, _addr)) => {
                stream.set_nonblocking(false)?;
                match handle_control(stream, &tasks_handle) {
                    Ok(stop) => stopping = stop,
                    Err(e) => debug!(error = %e, "control connection ended"),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if token.wait_timeout(ACCEPT_POLL) {
                    break;
                }
            }
            Err(e) => {
                let _ = std::fs::remove_file(socket_path);
                return Err(e.into());
            }
        }
    }

    tasks_handle.cancel();
    let _ = std::fs::remove_file(socket_path);
    Ok(())
}

fn handle_control(mut stream: UnixStream, tasks_handle: &CancelHandle) -> AgentResult<bool> {
    let mut reader = stream.try_clone()?;
    packet::exchange_versions(&mut reader, &mut stream, false)?;

    let request: ControlRequest = packet::decode(&mut reader)?;
    let (response, stop) = match request.verb.as_str() {
        "stop" => {
            info!("scheduler stop requested");
            tasks_handle.cancel();
            (
                ControlResponse {
                    exit_code: 0,
                    err: String::new(),
                },
                true,
            )
        }
        other => {
            warn!(verb = other, "unknown scheduler control verb");
            (
                ControlResponse {
                    exit_code: 1,
                    err: format!("unknown command: {other}"),
                },
                false,
            )
        }
    };
    packet::encode(&mut stream, &response)?;
    Ok(stop)
}
