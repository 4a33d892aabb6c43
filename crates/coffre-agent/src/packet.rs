//! Wire types for the agent protocol.
//!
//! A connection starts with an exchange of version bytes, one msgpack
//! message each way. The client then sends one [`Request`]; the daemon
//! streams [`Packet`]s back until a terminal `exit` packet. stdin is
//! pull-based: the daemon asks, the client answers with up to
//! [`STDIN_CHUNK`] bytes per push.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use coffre_storage::backend::StoreConfig;

use crate::error::{AgentError, AgentResult};

/// Protocol version exchanged during the handshake.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum bytes per stdin push packet.
pub const STDIN_CHUNK: usize = 8 * 1024;

/// The one framed request a client sends after the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Subcommand name path, e.g. `["agent", "stop"]`.
    pub name: Vec<String>,
    /// Backend configuration for the repository the command targets.
    pub store_config: StoreConfig,
    /// msgpack-encoded subcommand arguments.
    pub subcommand: Vec<u8>,
}

/// Packet kinds streamed over a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketKind {
    /// Daemon pulls input; client pushes it back with data/eof set.
    Stdin,
    /// Bytes for the client's stdout.
    Stdout,
    /// Bytes for the client's stderr.
    Stderr,
    /// Terminal packet carrying the exit status.
    Exit,
}

/// One streamed packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    /// Packet kind.
    pub kind: PacketKind,
    /// Payload for stdin/stdout/stderr packets.
    #[serde(default)]
    pub data: Vec<u8>,
    /// Exit status for exit packets.
    #[serde(default)]
    pub exit_code: i32,
    /// End-of-input marker on stdin pushes.
    #[serde(default)]
    pub eof: bool,
    /// Error text on exit packets and failed stdin pushes.
    #[serde(default)]
    pub err: String,
}

impl Packet {
    /// An output packet.
    pub fn output(kind: PacketKind, data: Vec<u8>) -> Self {
        Packet {
            kind,
            data,
            exit_code: 0,
            eof: false,
            err: String::new(),
        }
    }

    /// A stdin pull request.
    pub fn stdin_pull() -> Self {
        Packet::output(PacketKind::Stdin, Vec::new())
    }

    /// The terminal exit packet.
    pub fn exit(exit_code: i32, err: Option<String>) -> Self {
        Packet {
            kind: PacketKind::Exit,
            data: Vec::new(),
            exit_code,
            eof: false,
            err: err.unwrap_or_default(),
        }
    }
}

/// Encodes one msgpack message to the stream.
pub fn encode<T: Serialize>(w: &mut dyn Write, value: &T) -> AgentResult<()> {
    let bytes = rmp_serde::to_vec(value).map_err(|e| AgentError::Wire(e.to_string()))?;
    w.write_all(&bytes)?;
    w.flush()?;
    Ok(())
}

/// Decodes one msgpack message from the stream.
pub fn decode<T: for<'de> Deserialize<'de>>(r: &mut dyn Read) -> AgentResult<T> {
    rmp_serde::from_read(r).map_err(|e| AgentError::Wire(e.to_string()))
}

/// Sends our version bytes and reads the peer's.
pub fn exchange_versions(
    r: &mut dyn Read,
    w: &mut dyn Write,
    send_first: bool,
) -> AgentResult<Vec<u8>> {
    let ours = VERSION.as_bytes().to_vec();
    if send_first {
        encode(w, &ours)?;
        decode(r)
    } else {
        let theirs: Vec<u8> = decode(r)?;
        encode(w, &ours)?;
        Ok(theirs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_round_trip() {
        let packet = Packet::output(PacketKind::Stdout, b"hello".to_vec());
        let mut wire = Vec::new();
        encode(&mut wire, &packet).unwrap();
        let back: Packet = decode(&mut &wire[..]).unwrap();
        assert_eq!(back.kind, PacketKind::Stdout);
        assert_eq!(back.data, b"hello");
    }

    #[test]
    fn test_exit_packet_carries_error() {
        let packet = Packet::exit(1, Some("boom".into()));
        let mut wire = Vec::new();
        encode(&mut wire, &packet).unwrap();
        let back: Packet = decode(&mut &wire[..]).unwrap();
        assert_eq!(back.kind, PacketKind::Exit);
        assert_eq!(back.exit_code, 1);
        assert_eq!(back.err, "boom");
    }

    #[test]
    fn test_request_round_trip() {
        let mut store_config = StoreConfig::new();
        store_config.insert("location".into(), "fs:///tmp/repo".into());
        let request = Request {
            name: vec!["agent".into(), "stop".into()],
            store_config,
            subcommand: vec![0x90],
        };
        let mut wire = Vec::new();
        encode(&mut wire, &request).unwrap();
        let back: Request = decode(&mut &wire[..]).unwrap();
        assert_eq!(back.name, vec!["agent", "stop"]);
        assert_eq!(back.store_config["location"], "fs:///tmp/repo");
    }

    #[test]
    fn test_multiple_messages_stream_back_to_back() {
        let mut wire = Vec::new();
        encode(&mut wire, &Packet::stdin_pull()).unwrap();
        encode(&mut wire, &Packet::exit(0, None)).unwrap();

        let mut rd: &[u8] = &wire;
        let first: Packet = decode(&mut rd).unwrap();
        let second: Packet = decode(&mut rd).unwrap();
        assert_eq!(first.kind, PacketKind::Stdin);
        assert_eq!(second.kind, PacketKind::Exit);
    }
}
