//! Capability traits over the device transport.
//!
//! The real USB/lockdown plumbing is an external library; the session only
//! needs these seams, which also make the whole protocol testable against
//! scripted in-memory implementations.

use crate::error::{ProtocolError, TransportError};
use crate::message::ProtocolMessage;
use std::io::{self, Read, Write};
use std::time::Duration;

pub const SERVICE_MOBILEBACKUP2: &str = "com.apple.mobilebackup2";
pub const SERVICE_AFC: &str = "com.apple.afc";
pub const SERVICE_NOTIFICATION_PROXY: &str = "com.apple.mobile.notification_proxy";

/// Sentinel file locked for session exclusivity, shared with Finder/iTunes.
pub const LOCK_FILE: &str = "/com.apple.itunes.lock_sync";
pub const NOTIFICATION_SYNC_FINISHED: &str = "com.apple.itunes-mobdev.syncDidFinish";

/// Quiet receive timeout slice; retried silently by the dispatch loop.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Trusted,
    /// Passcode locked; the caller must prompt and retry.
    Locked,
    /// Trust dialog showing on the device.
    TrustPending,
    Failed(String),
}

/// One opened device service: blocking raw byte exchange.
pub trait ServiceLink {
    fn send_raw(&mut self, data: &[u8]) -> io::Result<()>;
    /// Fills `buf` completely or fails; a `TimedOut` error means no data
    /// arrived within `timeout` and the call may simply be retried.
    fn receive_raw(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<()>;
}

/// Minimal AFC surface: just what the lock file needs.
pub trait AfcClient {
    fn open(&mut self, path: &str) -> Result<u64, TransportError>;
    /// `Ok(false)` means the lock is currently held elsewhere.
    fn lock_exclusive(&mut self, handle: u64) -> Result<bool, TransportError>;
    fn unlock(&mut self, handle: u64) -> Result<(), TransportError>;
    fn close(&mut self, handle: u64) -> Result<(), TransportError>;
}

/// One connected device.
pub trait DeviceTransport {
    fn handshake(&mut self) -> Result<HandshakeOutcome, TransportError>;
    fn start_service(&mut self, name: &str) -> Result<Box<dyn ServiceLink>, TransportError>;
    fn open_afc(&mut self) -> Result<Box<dyn AfcClient>, TransportError>;
    /// Best-effort; failures are ignored.
    fn post_notification(&mut self, name: &str);
}

/// Device enumeration and connection, the outermost seam.
pub trait TransportProvider {
    fn discover(&self) -> Vec<crate::device::DeviceInfo>;
    fn connect(&self, udid: &str) -> Result<Box<dyn DeviceTransport>, TransportError>;
}

/// Protocol messages ride the raw link as a 4-byte big-endian length
/// followed by one binary plist.
pub fn send_message(link: &mut dyn ServiceLink, value: &plist::Value) -> Result<(), TransportError> {
    let mut body = Vec::new();
    value
        .to_writer_binary(&mut body)
        .map_err(|e| TransportError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    link.send_raw(&out).map_err(TransportError::Io)
}

/// Receive one plist message. `Ok(None)` on a quiet timeout while waiting
/// for the length prefix; a timeout mid-body is a protocol error.
pub fn receive_message(
    link: &mut dyn ServiceLink,
    timeout: Duration,
) -> Result<Option<plist::Value>, ProtocolError> {
    let mut len_buf = [0u8; 4];
    match link.receive_raw(&mut len_buf, timeout) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(None),
        Err(e) => return Err(ProtocolError::MalformedFrame(format!("receive: {e}"))),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(ProtocolError::MalformedFrame("zero-length message".into()));
    }
    let mut body = vec![0u8; len];
    link.receive_raw(&mut body, timeout)
        .map_err(|e| ProtocolError::MalformedFrame(format!("short message body: {e}")))?;
    let value = plist::Value::from_reader(io::Cursor::new(body))?;
    Ok(Some(value))
}

/// Receive and decode the next DLMessage, retrying quiet timeouts away from
/// the caller is the session's job; this just maps one frame.
pub fn receive_protocol_message(
    link: &mut dyn ServiceLink,
    timeout: Duration,
) -> Result<Option<ProtocolMessage>, ProtocolError> {
    match receive_message(link, timeout)? {
        Some(value) => Ok(Some(ProtocolMessage::decode(value)?)),
        None => Ok(None),
    }
}

/// Adapter presenting a `ServiceLink` as `Read`/`Write` for the chunked
/// file-transfer codec, which interleaves with plist messages on the same
/// service connection.
pub struct LinkStream<'a> {
    link: &'a mut dyn ServiceLink,
    read_timeout: Duration,
    cancel: Option<&'a crate::session::CancelFlag>,
}

impl<'a> LinkStream<'a> {
    pub fn new(link: &'a mut dyn ServiceLink, read_timeout: Duration) -> Self {
        Self {
            link,
            read_timeout,
            cancel: None,
        }
    }

    /// Break out of timeout retries once the session is cancelled.
    pub fn with_cancel(mut self, cancel: &'a crate::session::CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

impl Read for LinkStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        // Chunk reads are all-or-nothing on the underlying link; retry
        // quiet timeouts so mid-transfer stalls do not surface as errors.
        loop {
            match self.link.receive_raw(buf, self.read_timeout) {
                Ok(()) => return Ok(buf.len()),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    if self.cancel.map_or(false, |c| c.is_cancelled()) {
                        return Err(io::Error::from(io::ErrorKind::Interrupted));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Write for LinkStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.link.send_raw(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
