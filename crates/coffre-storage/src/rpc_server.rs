//! Serving half of the storage RPC.
//!
//! Exposes any local [`Backend`] over a UNIX or TCP listener speaking the
//! frame protocol of [`crate::rpc`]. One thread per connection; the accept
//! loop polls the cancellation token so shutdown does not wait on a new
//! client.

use std::io::{Read, Write};
use std::net::TcpListener;
#[cfg(unix)]
use std::os::unix::net::UnixListener;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::backend::{Backend, Namespace};
use crate::cancel::CancelToken;
use crate::error::{StorageError, StorageResult};
use crate::rpc::{
    read_frame, read_payload, write_frame, write_payload, Frame, Request, Response,
};

const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Anything we can accept byte streams from.
pub trait Acceptor: Send {
    /// Accepts one connection; the listener must be in non-blocking mode.
    fn accept_stream(&self) -> std::io::Result<Box<dyn Stream>>;
}

/// A bidirectional byte stream.
pub trait Stream: Read + Write + Send {}
impl<T: Read + Write + Send> Stream for T {}

#[cfg(unix)]
impl Acceptor for UnixListener {
    fn accept_stream(&self) -> std::io::Result<Box<dyn Stream>> {
        let (stream, _addr) = self.accept()?;
        stream.set_nonblocking(false)?;
        Ok(Box::new(stream))
    }
}

impl Acceptor for TcpListener {
    fn accept_stream(&self) -> std::io::Result<Box<dyn Stream>> {
        let (stream, _addr) = self.accept()?;
        stream.set_nonblocking(false)?;
        Ok(Box::new(stream))
    }
}

/// Serves `store` over `listener` until the token fires. The listener must
/// already be bound and set non-blocking. Connection threads are detached:
/// one idle client never delays shutdown.
pub fn serve(
    token: &CancelToken,
    listener: impl Acceptor + 'static,
    store: Arc<dyn Backend>,
) -> StorageResult<()> {
    loop {
        if token.is_cancelled() {
            return Ok(());
        }
        match listener.accept_stream() {
            Ok(stream) => {
                let store = store.clone();
                let conn_token = token.clone();
                std::thread::spawn(move || {
                    if let Err(e) = handle_connection(&conn_token, stream, store) {
                        debug!(error = %e, "storage rpc connection ended");
                    }
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if token.wait_timeout(ACCEPT_POLL) {
                    return Ok(());
                }
            }
            Err(e) => {
                warn!(error = %e, "storage rpc accept failed");
                return Err(e.into());
            }
        }
    }
}

/// Serves one RPC channel over the process's own stdin/stdout. This is
/// the entry point a storage connector subprocess calls from its main:
/// the parent wires the channel up via the `exec` store configuration.
pub fn serve_stdio(token: &CancelToken, store: Arc<dyn Backend>) -> StorageResult<()> {
    struct StdioStream {
        stdin: std::io::Stdin,
        stdout: std::io::Stdout,
    }
    impl Read for StdioStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.stdin.read(buf)
        }
    }
    impl Write for StdioStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.stdout.write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            self.stdout.flush()
        }
    }

    let stream = Box::new(StdioStream {
        stdin: std::io::stdin(),
        stdout: std::io::stdout(),
    });
    handle_connection(token, stream, store)
}

fn handle_connection(
    token: &CancelToken,
    mut stream: Box<dyn Stream>,
    store: Arc<dyn Backend>,
) -> StorageResult<()> {
    loop {
        token.check()?;
        let request = match read_frame(stream.as_mut()) {
            Ok(Frame::Request(request)) => request,
            Ok(other) => {
                return Err(StorageError::Malformed(format!(
                    "expected request frame, got {other:?}"
                )))
            }
            // client hung up between requests
            Err(_) => return Ok(()),
        };
        dispatch(token, stream.as_mut(), &*store, request)?;
    }
}

fn send_error(stream: &mut dyn Stream, err: StorageError) -> StorageResult<()> {
    write_frame(stream, &Frame::Response(Response::Error(err.into())))
}

fn dispatch(
    token: &CancelToken,
    stream: &mut dyn Stream,
    store: &dyn Backend,
    request: Request,
) -> StorageResult<()> {
    match request {
        Request::Create => {
            let config = read_payload(stream)?;
            match store.create(token, &config) {
                Ok(()) => write_frame(stream, &Frame::Response(Response::Ok)),
                Err(e) => send_error(stream, e),
            }
        }
        Request::Open => match store.open(token) {
            Ok(config) => write_frame(stream, &Frame::Response(Response::Config(config))),
            Err(e) => send_error(stream, e),
        },
        Request::Size => match store.size(token) {
            Ok(size) => write_frame(stream, &Frame::Response(Response::Size(size))),
            Err(e) => send_error(stream, e),
        },
        Request::List { ns } => {
            let result = match ns {
                Namespace::Packfile => store.list_packfiles(token),
                Namespace::State => store.list_states(token),
                Namespace::Lock => store.list_locks(token),
            };
            match result {
                Ok(macs) => write_frame(stream, &Frame::Response(Response::Macs(macs))),
                Err(e) => send_error(stream, e),
            }
        }
        Request::Get { ns, mac } => {
            let result = match ns {
                Namespace::Packfile => store.get_packfile(token, mac),
                Namespace::State => store.get_state(token, mac),
                Namespace::Lock => store.get_lock(token, mac),
            };
            match result {
                Ok(mut rd) => {
                    write_frame(stream, &Frame::Response(Response::Blob))?;
                    write_payload(stream, rd.as_mut())?;
                    Ok(())
                }
                Err(e) => send_error(stream, e),
            }
        }
        Request::GetBlob {
            mac,
            offset,
            length,
        } => match store.get_packfile_blob(token, mac, offset, length) {
            Ok(mut rd) => {
                write_frame(stream, &Frame::Response(Response::Blob))?;
                write_payload(stream, rd.as_mut())?;
                Ok(())
            }
            Err(e) => send_error(stream, e),
        },
        Request::Put { ns, mac } => {
            // the payload must be drained even if the put will fail, to
            // keep the stream synchronized
            let payload = read_payload(stream)?;
            let mut rd: &[u8] = &payload;
            let result = match ns {
                Namespace::Packfile => store.put_packfile(token, mac, &mut rd),
                Namespace::State => store.put_state(token, mac, &mut rd),
                Namespace::Lock => store.put_lock(token, mac, &mut rd),
            };
            match result {
                Ok(n) => write_frame(stream, &Frame::Response(Response::Written(n))),
                Err(e) => send_error(stream, e),
            }
        }
        Request::Delete { ns, mac } => {
            let result = match ns {
                Namespace::Packfile => store.delete_packfile(token, mac),
                Namespace::State => store.delete_state(token, mac),
                Namespace::Lock => store.delete_lock(token, mac),
            };
            match result {
                Ok(()) => write_frame(stream, &Frame::Response(Response::Ok)),
                Err(e) => send_error(stream, e),
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::backend::{new_store, StoreConfig};
    use crate::cancel::cancel_pair;
    use crate::mac::Mac;
    use std::io::Cursor;

    /// Spins up an fs-backed rpc server on a temp unix socket and returns
    /// a client store dialing it.
    fn served_pair(
        dir: &std::path::Path,
    ) -> (
        crate::cancel::CancelHandle,
        std::thread::JoinHandle<()>,
        Box<dyn Backend>,
    ) {
        let socket = dir.join("storage.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        listener.set_nonblocking(true).unwrap();

        let mut backing = StoreConfig::new();
        backing.insert(
            "location".into(),
            format!("fs://{}", dir.join("backing").display()),
        );
        let backing: Arc<dyn Backend> = Arc::from(new_store(&backing).unwrap());

        let (token, handle) = cancel_pair();
        let server = std::thread::spawn(move || {
            serve(&token, listener, backing).unwrap();
        });

        let mut client = StoreConfig::new();
        client.insert("location".into(), format!("rpc://{}", socket.display()));
        let client = new_store(&client).unwrap();
        (handle, server, client)
    }

    #[test]
    fn test_full_contract_over_rpc() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, server, client) = served_pair(dir.path());
        let token = CancelToken::never();

        client.create(&token, b"remote-config").unwrap();
        assert_eq!(client.open(&token).unwrap(), b"remote-config");

        let mac = Mac::random();
        let payload: Vec<u8> = (0u8..=255).cycle().take(100_000).collect();
        let n = client
            .put_packfile(&token, mac, &mut Cursor::new(payload.clone()))
            .unwrap();
        assert_eq!(n, payload.len() as u64);

        assert_eq!(client.list_packfiles(&token).unwrap(), vec![mac]);

        let mut out = Vec::new();
        client
            .get_packfile_blob(&token, mac, 500, 16)
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, &payload[500..516]);

        client.delete_packfile(&token, mac).unwrap();
        assert!(matches!(
            client.get_packfile(&token, mac),
            Err(StorageError::PackfileNotFound { .. })
        ));

        handle.cancel();
        server.join().unwrap();
    }

    #[test]
    fn test_error_crosses_the_wire_typed() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, server, client) = served_pair(dir.path());
        let token = CancelToken::never();

        assert!(matches!(
            client.open(&token),
            Err(StorageError::NotConfigured)
        ));

        handle.cancel();
        server.join().unwrap();
    }

    #[test]
    fn test_server_survives_client_hangup() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, server, client) = served_pair(dir.path());
        let token = CancelToken::never();

        client.create(&token, b"cfg").unwrap();
        client.close().unwrap(); // drops the connection

        // a fresh connection still works
        let mut config = StoreConfig::new();
        config.insert(
            "location".into(),
            format!("rpc://{}", dir.path().join("storage.sock").display()),
        );
        let second = new_store(&config).unwrap();
        assert_eq!(second.open(&token).unwrap(), b"cfg");

        handle.cancel();
        server.join().unwrap();
    }
}
