//! Scheduler control client.

use std::os::unix::net::UnixStream;
use std::path::Path;

use crate::error::{AgentError, AgentResult};
use crate::packet;

use super::server::{ControlRequest, ControlResponse};

/// A connected scheduler control client.
pub struct SchedulerClient {
    stream: UnixStream,
}

impl SchedulerClient {
    /// Dials the control socket and performs the version handshake.
    pub fn connect(socket_path: &Path, ignore_version: bool) -> AgentResult<SchedulerClient> {
        let stream = UnixStream::connect(socket_path)
            .map_err(|e| AgentError::SchedulerUnavailable(e.to_string()))?;

        let mut client = SchedulerClient { stream };
        let mut reader = client.stream.try_clone()?;
        let theirs = packet::exchange_versions(&mut reader, &mut client.stream, true)?;
        if !ignore_version && theirs != packet::VERSION.as_bytes() {
            return Err(AgentError::WrongVersion {
                theirs: String::from_utf8_lossy(&theirs).to_string(),
            });
        }
        Ok(client)
    }

    /// Sends `stop`, returning the scheduler's exit code and error text.
    pub fn stop(&mut self) -> AgentResult<(i32, Option<String>)> {
        packet::encode(
            &mut self.stream,
            &ControlRequest {
                verb: "stop".to_string(),
            },
        )?;
        let mut reader = self.stream.try_clone()?;
        let response: ControlResponse = packet::decode(&mut reader)?;
        let err = if response.err.is_empty() {
            None
        } else {
            Some(response.err)
        };
        Ok((response.exit_code, err))
    }
}
