//! Blocking FastCGI client for a serially-contacted local worker.

use crate::proto::{FcgiRequest, FcgiResponse, ProtocolError, RecordHeader, ResponseDecoder};
use slog::{debug, Logger};
use std::error;
use std::fmt::{self, Display, Formatter};
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

/// Budget for establishing the connection. A local worker either accepts
/// immediately or its backlog is full, which surfaces as `WouldBlock` and is
/// retried until the budget runs out.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Overall budget for reading the complete response, not per record.
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

const CONNECT_RETRY: Duration = Duration::from_millis(5);

/// The request id used on every connection. Connections are serial, so the
/// protocol allows reuse.
const REQUEST_ID: u16 = 1;

#[derive(Debug)]
pub enum TransportError {
    ConnectFailed(io::Error),
    WriteFailed(io::Error),
    ReadFailed(io::Error),
    /// The overall read budget ran out.
    Timeout,
    Protocol(ProtocolError),
}

impl Display for TransportError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            TransportError::ConnectFailed(err) => write!(f, "connecting to worker: {err}"),
            TransportError::WriteFailed(err) => write!(f, "writing request: {err}"),
            TransportError::ReadFailed(err) => write!(f, "reading response: {err}"),
            TransportError::Timeout => write!(f, "timed out reading response"),
            TransportError::Protocol(err) => write!(f, "protocol error: {err}"),
        }
    }
}

impl error::Error for TransportError {}

impl From<ProtocolError> for TransportError {
    fn from(err: ProtocolError) -> Self {
        TransportError::Protocol(err)
    }
}

/// A second handle to an in-flight connection. Shutting it down unblocks a
/// reader on the primary handle; the read then fails and the caller decides
/// what the failure means.
#[derive(Debug)]
pub struct ShutdownHandle(UnixStream);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.0.shutdown(Shutdown::Both);
    }
}

impl From<UnixStream> for ShutdownHandle {
    fn from(stream: UnixStream) -> Self {
        ShutdownHandle(stream)
    }
}

/// FastCGI client bound to one socket path. Connects per request; the worker
/// is never spoken to concurrently.
pub struct Client {
    socket_path: PathBuf,
    log: Logger,
}

impl Client {
    pub fn new(socket_path: impl Into<PathBuf>, log: Logger) -> Self {
        Client {
            socket_path: socket_path.into(),
            log,
        }
    }

    /// Connect, send `request`, and read records until `END_REQUEST`. `watch`
    /// is handed a [`ShutdownHandle`] to the fresh connection before any byte
    /// moves, so a deadline timer can unblock the read underfoot.
    ///
    /// Never retries; retry policy belongs to the caller.
    pub fn send_request(
        &self,
        request: &FcgiRequest,
        watch: impl FnOnce(ShutdownHandle),
    ) -> Result<FcgiResponse, TransportError> {
        let mut stream = connect_with_timeout(&self.socket_path, CONNECT_TIMEOUT)
            .map_err(TransportError::ConnectFailed)?;
        watch(ShutdownHandle::from(
            stream.try_clone().map_err(TransportError::ConnectFailed)?,
        ));

        debug!(self.log, "sending request";
            "params" => request.params.len(), "stdin_bytes" => request.stdin.len());
        stream
            .write_all(&request.encode(REQUEST_ID))
            .map_err(TransportError::WriteFailed)?;

        let deadline = Instant::now() + READ_TIMEOUT;
        let mut decoder = ResponseDecoder::new(REQUEST_ID);
        while !decoder.done() {
            let mut header_buf = [0; RecordHeader::LEN];
            read_exact_by(
                &mut stream,
                &mut header_buf,
                deadline,
                ProtocolError::MissingEndRequest,
            )?;
            let header = RecordHeader::parse(&header_buf)?;
            let mut content =
                vec![0; header.content_length as usize + header.padding_length as usize];
            read_exact_by(&mut stream, &mut content, deadline, ProtocolError::Truncated)?;
            content.truncate(header.content_length as usize);
            debug!(self.log, "received record";
                "type" => ?header.record_type, "bytes" => header.content_length);
            decoder.push_record(&header, &content)?;
        }
        Ok(decoder.finish()?)
    }
}

fn connect_with_timeout(path: &Path, timeout: Duration) -> io::Result<UnixStream> {
    let give_up = Instant::now() + timeout;
    loop {
        match UnixStream::connect(path) {
            Err(err) if err.kind() == io::ErrorKind::WouldBlock && Instant::now() < give_up => {
                thread::sleep(CONNECT_RETRY);
            }
            other => return other,
        }
    }
}

/// `read_exact` against an absolute deadline. `on_eof` names the protocol
/// error a peer close at this point amounts to.
fn read_exact_by(
    stream: &mut UnixStream,
    buf: &mut [u8],
    deadline: Instant,
    on_eof: ProtocolError,
) -> Result<(), TransportError> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err(TransportError::Timeout);
    }
    stream
        .set_read_timeout(Some(remaining))
        .map_err(TransportError::ReadFailed)?;
    match stream.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
            Err(TransportError::Protocol(on_eof))
        }
        Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
            Err(TransportError::Timeout)
        }
        Err(err) => Err(TransportError::ReadFailed(err)),
    }
}
