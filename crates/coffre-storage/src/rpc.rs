//! Remote store speaking the streaming storage RPC.
//!
//! The `rpc` protocol fulfils the network-RPC backend slot: a remote
//! daemon exposes a local backend over a UNIX or TCP socket (see
//! [`crate::rpc_server`]), and this client-side backend forwards every
//! contract operation to it. The wire format is msgpack: self-delimiting
//! frames, with blob payloads streamed as chunked `Data` frames between a
//! request and its terminal `End`.
//!
//! Locations: `rpc://host:port` dials TCP, `rpc:///path/to/socket` dials a
//! UNIX socket. An `exec` configuration key instead launches the named
//! executable as a subprocess and wires its stdin/stdout to the RPC
//! channel; that is the connector contract storage plugins implement (the
//! plugin's main serves the channel with
//! [`crate::rpc_server::serve_stdio`]).

use std::io::{Cursor, Read, Write};
use std::net::TcpStream;
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::backend::{split_location, Backend, Mode, Namespace, StoreConfig};
use crate::cancel::CancelToken;
use crate::error::{StorageError, StorageResult};
use crate::mac::Mac;

/// Size of one streamed data frame.
pub const DATA_FRAME_LEN: usize = 64 * 1024;

/// One wire frame. Every frame is a single msgpack value.
#[derive(Debug, Serialize, Deserialize)]
pub enum Frame {
    /// Client request.
    Request(Request),
    /// Server response.
    Response(Response),
    /// A chunk of blob payload.
    Data(Vec<u8>),
    /// End of a payload stream.
    End,
}

/// Storage contract operations on the wire.
#[derive(Debug, Serialize, Deserialize)]
pub enum Request {
    /// Create a repository; config payload follows as Data frames.
    Create,
    /// Read the configuration blob.
    Open,
    /// Best-effort store size.
    Size,
    /// List one namespace.
    List {
        /// Namespace to enumerate.
        ns: Namespace,
    },
    /// Fetch a whole blob; payload streams back.
    Get {
        /// Namespace of the blob.
        ns: Namespace,
        /// Blob address.
        mac: Mac,
    },
    /// Fetch a packfile range; payload streams back.
    GetBlob {
        /// Packfile address.
        mac: Mac,
        /// Start offset.
        offset: u64,
        /// Byte count, 0 meaning "to EOF".
        length: u32,
    },
    /// Install a blob; payload follows as Data frames.
    Put {
        /// Namespace of the blob.
        ns: Namespace,
        /// Blob address.
        mac: Mac,
    },
    /// Delete a blob.
    Delete {
        /// Namespace of the blob.
        ns: Namespace,
        /// Blob address.
        mac: Mac,
    },
}

/// Typed operation outcomes on the wire.
#[derive(Debug, Serialize, Deserialize)]
pub enum Response {
    /// Operation succeeded with nothing to return.
    Ok,
    /// Configuration blob (for `Open`).
    Config(Vec<u8>),
    /// Store size (for `Size`).
    Size(Option<u64>),
    /// Namespace listing.
    Macs(Vec<Mac>),
    /// Bytes written by a `Put`.
    Written(u64),
    /// A payload stream follows as Data frames.
    Blob,
    /// The operation failed.
    Error(WireError),
}

/// Storage errors carried across the wire.
#[derive(Debug, Serialize, Deserialize)]
pub enum WireError {
    /// No repository at the served root.
    NotConfigured,
    /// The served root is occupied.
    AlreadyExists,
    /// Blob missing.
    NotFound(Mac),
    /// Packfile missing.
    PackfileNotFound(Mac),
    /// Anything else, stringly.
    Message(String),
}

impl From<StorageError> for WireError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotConfigured => WireError::NotConfigured,
            StorageError::AlreadyExists { .. } => WireError::AlreadyExists,
            StorageError::NotFound { mac } => WireError::NotFound(mac),
            StorageError::PackfileNotFound { mac } => WireError::PackfileNotFound(mac),
            other => WireError::Message(other.to_string()),
        }
    }
}

impl WireError {
    fn into_storage(self, location: &str) -> StorageError {
        match self {
            WireError::NotConfigured => StorageError::NotConfigured,
            WireError::AlreadyExists => StorageError::AlreadyExists {
                location: location.to_string(),
            },
            WireError::NotFound(mac) => StorageError::NotFound { mac },
            WireError::PackfileNotFound(mac) => StorageError::PackfileNotFound { mac },
            WireError::Message(msg) => StorageError::Remote(msg),
        }
    }
}

/// Writes one frame as a msgpack value.
pub fn write_frame(w: &mut dyn Write, frame: &Frame) -> StorageResult<()> {
    let bytes = rmp_serde::to_vec(frame).map_err(|e| StorageError::Malformed(e.to_string()))?;
    w.write_all(&bytes)?;
    w.flush()?;
    Ok(())
}

/// Reads one frame. msgpack values are self-delimiting, so this consumes
/// exactly one.
pub fn read_frame(r: &mut dyn Read) -> StorageResult<Frame> {
    rmp_serde::from_read(r).map_err(|e| StorageError::Malformed(e.to_string()))
}

/// Streams `rd` as Data frames followed by End.
pub fn write_payload(w: &mut dyn Write, rd: &mut dyn Read) -> StorageResult<u64> {
    let mut buf = vec![0u8; DATA_FRAME_LEN];
    let mut total = 0u64;
    loop {
        let n = rd.read(&mut buf)?;
        if n == 0 {
            break;
        }
        write_frame(w, &Frame::Data(buf[..n].to_vec()))?;
        total += n as u64;
    }
    write_frame(w, &Frame::End)?;
    Ok(total)
}

/// Collects a Data/End payload stream into a buffer.
pub fn read_payload(r: &mut dyn Read) -> StorageResult<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        match read_frame(r)? {
            Frame::Data(chunk) => out.extend_from_slice(&chunk),
            Frame::End => return Ok(out),
            other => {
                return Err(StorageError::Malformed(format!(
                    "unexpected frame in payload stream: {other:?}"
                )))
            }
        }
    }
}

enum Conn {
    #[cfg(unix)]
    Unix(UnixStream),
    Tcp(TcpStream),
    Child {
        child: Child,
        stdin: ChildStdin,
        stdout: ChildStdout,
    },
}

impl Drop for Conn {
    fn drop(&mut self) {
        if let Conn::Child { child, .. } = self {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Read for Conn {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            #[cfg(unix)]
            Conn::Unix(s) => s.read(buf),
            Conn::Tcp(s) => s.read(buf),
            Conn::Child { stdout, .. } => stdout.read(buf),
        }
    }
}

impl Write for Conn {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            #[cfg(unix)]
            Conn::Unix(s) => s.write(buf),
            Conn::Tcp(s) => s.write(buf),
            Conn::Child { stdin, .. } => stdin.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            #[cfg(unix)]
            Conn::Unix(s) => s.flush(),
            Conn::Tcp(s) => s.flush(),
            Conn::Child { stdin, .. } => stdin.flush(),
        }
    }
}

/// Client-side remote store.
pub struct RpcStore {
    location: String,
    target: String,
    exec: Option<String>,
    conn: Mutex<Option<Conn>>,
}

/// Backend factory for the `rpc` protocol.
pub fn new_store(config: &StoreConfig) -> StorageResult<Box<dyn Backend>> {
    let location = config.get("location").cloned().unwrap_or_default();
    let (_, target) = split_location(&location);
    let target = target.to_string();
    Ok(Box::new(RpcStore {
        location,
        target,
        exec: config.get("exec").cloned(),
        conn: Mutex::new(None),
    }))
}

impl RpcStore {
    fn dial(&self) -> StorageResult<Conn> {
        if let Some(exec) = &self.exec {
            let mut child = Command::new(exec)
                .env("COFFRE_STORE_LOCATION", &self.location)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .spawn()?;
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| StorageError::Remote("connector has no stdin".into()))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| StorageError::Remote("connector has no stdout".into()))?;
            return Ok(Conn::Child {
                child,
                stdin,
                stdout,
            });
        }
        if self.target.starts_with('/') {
            #[cfg(unix)]
            {
                return Ok(Conn::Unix(UnixStream::connect(&self.target)?));
            }
            #[cfg(not(unix))]
            {
                return Err(StorageError::Remote(
                    "unix socket targets need a unix host".into(),
                ));
            }
        }
        Ok(Conn::Tcp(TcpStream::connect(&self.target)?))
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Conn) -> StorageResult<T>) -> StorageResult<T> {
        let mut guard = self.conn.lock().unwrap();
        if guard.is_none() {
            *guard = Some(self.dial()?);
        }
        let result = f(guard.as_mut().expect("connection just dialed"));
        if result.is_err() {
            // a failed exchange may leave the stream desynchronized
            *guard = None;
        }
        result
    }

    fn expect_ok(&self, resp: Response) -> StorageResult<()> {
        match resp {
            Response::Ok => Ok(()),
            Response::Error(e) => Err(e.into_storage(&self.location)),
            other => Err(StorageError::Malformed(format!(
                "unexpected response: {other:?}"
            ))),
        }
    }

    fn roundtrip(&self, token: &CancelToken, request: Request) -> StorageResult<Response> {
        token.check()?;
        self.with_conn(|conn| {
            trace!(?request, "rpc request");
            write_frame(conn, &Frame::Request(request))?;
            match read_frame(conn)? {
                Frame::Response(resp) => Ok(resp),
                other => Err(StorageError::Malformed(format!(
                    "expected response frame, got {other:?}"
                ))),
            }
        })
    }

    fn fetch(&self, token: &CancelToken, request: Request) -> StorageResult<Vec<u8>> {
        token.check()?;
        self.with_conn(|conn| {
            write_frame(conn, &Frame::Request(request))?;
            match read_frame(conn)? {
                Frame::Response(Response::Blob) => read_payload(conn),
                Frame::Response(Response::Error(e)) => Err(e.into_storage(&self.location)),
                other => Err(StorageError::Malformed(format!(
                    "expected blob response, got {other:?}"
                ))),
            }
        })
    }

    fn store(
        &self,
        token: &CancelToken,
        request: Request,
        rd: &mut dyn Read,
    ) -> StorageResult<u64> {
        token.check()?;
        self.with_conn(|conn| {
            write_frame(conn, &Frame::Request(request))?;
            write_payload(conn, rd)?;
            match read_frame(conn)? {
                Frame::Response(Response::Written(n)) => Ok(n),
                Frame::Response(Response::Ok) => Ok(0),
                Frame::Response(Response::Error(e)) => Err(e.into_storage(&self.location)),
                other => Err(StorageError::Malformed(format!(
                    "expected write ack, got {other:?}"
                ))),
            }
        })
    }

    fn list_ns(&self, token: &CancelToken, ns: Namespace) -> StorageResult<Vec<Mac>> {
        match self.roundtrip(token, Request::List { ns })? {
            Response::Macs(macs) => Ok(macs),
            Response::Error(e) => Err(e.into_storage(&self.location)),
            other => Err(StorageError::Malformed(format!(
                "expected listing, got {other:?}"
            ))),
        }
    }

    fn get_ns(
        &self,
        token: &CancelToken,
        ns: Namespace,
        mac: Mac,
    ) -> StorageResult<Box<dyn Read + Send>> {
        let bytes = self.fetch(token, Request::Get { ns, mac })?;
        Ok(Box::new(Cursor::new(bytes)))
    }
}

impl Backend for RpcStore {
    fn create(&self, token: &CancelToken, config: &[u8]) -> StorageResult<()> {
        let mut rd: &[u8] = config;
        let resp = self.with_conn(|conn| {
            write_frame(conn, &Frame::Request(Request::Create))?;
            write_payload(conn, &mut rd)?;
            match read_frame(conn)? {
                Frame::Response(resp) => Ok(resp),
                other => Err(StorageError::Malformed(format!(
                    "expected response frame, got {other:?}"
                ))),
            }
        })?;
        token.check()?;
        self.expect_ok(resp)
    }

    fn open(&self, token: &CancelToken) -> StorageResult<Vec<u8>> {
        match self.roundtrip(token, Request::Open)? {
            Response::Config(bytes) => Ok(bytes),
            Response::Error(e) => Err(e.into_storage(&self.location)),
            other => Err(StorageError::Malformed(format!(
                "expected config, got {other:?}"
            ))),
        }
    }

    fn location(&self) -> String {
        self.location.clone()
    }

    fn mode(&self) -> Mode {
        Mode::ReadWrite
    }

    fn size(&self, token: &CancelToken) -> StorageResult<Option<u64>> {
        match self.roundtrip(token, Request::Size)? {
            Response::Size(size) => Ok(size),
            Response::Error(e) => Err(e.into_storage(&self.location)),
            other => Err(StorageError::Malformed(format!(
                "expected size, got {other:?}"
            ))),
        }
    }

    fn list_packfiles(&self, token: &CancelToken) -> StorageResult<Vec<Mac>> {
        self.list_ns(token, Namespace::Packfile)
    }

    fn get_packfile(&self, token: &CancelToken, mac: Mac) -> StorageResult<Box<dyn Read + Send>> {
        self.get_ns(token, Namespace::Packfile, mac)
    }

    fn get_packfile_blob(
        &self,
        token: &CancelToken,
        mac: Mac,
        offset: u64,
        length: u32,
    ) -> StorageResult<Box<dyn Read + Send>> {
        let bytes = self.fetch(
            token,
            Request::GetBlob {
                mac,
                offset,
                length,
            },
        )?;
        Ok(Box::new(Cursor::new(bytes)))
    }

    fn put_packfile(
        &self,
        token: &CancelToken,
        mac: Mac,
        rd: &mut dyn Read,
    ) -> StorageResult<u64> {
        self.store(
            token,
            Request::Put {
                ns: Namespace::Packfile,
                mac,
            },
            rd,
        )
    }

    fn delete_packfile(&self, token: &CancelToken, mac: Mac) -> StorageResult<()> {
        let resp = self.roundtrip(
            token,
            Request::Delete {
                ns: Namespace::Packfile,
                mac,
            },
        )?;
        self.expect_ok(resp)
    }

    fn list_states(&self, token: &CancelToken) -> StorageResult<Vec<Mac>> {
        self.list_ns(token, Namespace::State)
    }

    fn get_state(&self, token: &CancelToken, mac: Mac) -> StorageResult<Box<dyn Read + Send>> {
        self.get_ns(token, Namespace::State, mac)
    }

    fn put_state(&self, token: &CancelToken, mac: Mac, rd: &mut dyn Read) -> StorageResult<u64> {
        self.store(
            token,
            Request::Put {
                ns: Namespace::State,
                mac,
            },
            rd,
        )
    }

    fn delete_state(&self, token: &CancelToken, mac: Mac) -> StorageResult<()> {
        let resp = self.roundtrip(
            token,
            Request::Delete {
                ns: Namespace::State,
                mac,
            },
        )?;
        self.expect_ok(resp)
    }

    fn list_locks(&self, token: &CancelToken) -> StorageResult<Vec<Mac>> {
        self.list_ns(token, Namespace::Lock)
    }

    fn get_lock(&self, token: &CancelToken, mac: Mac) -> StorageResult<Box<dyn Read + Send>> {
        self.get_ns(token, Namespace::Lock, mac)
    }

    fn put_lock(&self, token: &CancelToken, mac: Mac, rd: &mut dyn Read) -> StorageResult<u64> {
        self.store(
            token,
            Request::Put {
                ns: Namespace::Lock,
                mac,
            },
            rd,
        )
    }

    fn delete_lock(&self, token: &CancelToken, mac: Mac) -> StorageResult<()> {
        let resp = self.roundtrip(
            token,
            Request::Delete {
                ns: Namespace::Lock,
                mac,
            },
        )?;
        self.expect_ok(resp)
    }

    fn close(&self) -> StorageResult<()> {
        *self.conn.lock().unwrap() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip() {
        let frame = Frame::Request(Request::GetBlob {
            mac: Mac([9u8; 32]),
            offset: 42,
            length: 7,
        });
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).unwrap();
        match read_frame(&mut &buf[..]).unwrap() {
            Frame::Request(Request::GetBlob {
                mac,
                offset,
                length,
            }) => {
                assert_eq!(mac, Mac([9u8; 32]));
                assert_eq!(offset, 42);
                assert_eq!(length, 7);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_payload_round_trip() {
        let payload: Vec<u8> = (0..200_000u32).map(|i| i as u8).collect();
        let mut wire = Vec::new();
        let n = write_payload(&mut wire, &mut &payload[..]).unwrap();
        assert_eq!(n, payload.len() as u64);
        assert_eq!(read_payload(&mut &wire[..]).unwrap(), payload);
    }

    #[test]
    fn test_empty_payload() {
        let mut wire = Vec::new();
        write_payload(&mut wire, &mut &[][..]).unwrap();
        assert!(read_payload(&mut &wire[..]).unwrap().is_empty());
    }

    #[test]
    fn test_wire_error_mapping() {
        let mac = Mac([1u8; 32]);
        let wire: WireError = StorageError::PackfileNotFound { mac }.into();
        match wire.into_storage("rpc://x") {
            StorageError::PackfileNotFound { mac: m } => assert_eq!(m, mac),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
