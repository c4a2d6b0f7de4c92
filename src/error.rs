//! Error taxonomy for the backup engine.
//!
//! Batch handlers report per-path failures through multi-status replies and
//! never abort the session; only the variants here end a session or a load.

use std::io;
use thiserror::Error;

/// Manifest.mbdb decode failures.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("bad manifest signature")]
    BadSignature,
    #[error("truncated record while reading {0}")]
    Truncated(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Local filesystem failures, mapped once from the OS error and carried both
/// as a variant and as the device-side error code the protocol expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LocalIoError {
    #[error("no such file or directory")]
    NotFound,
    #[error("file exists")]
    AlreadyExists,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("too many levels of symbolic links")]
    TooManySymlinks,
    #[error("input/output error")]
    IoFailure,
    #[error("no space left on device")]
    OutOfSpace,
    #[error("unknown error")]
    Unknown,
}

impl LocalIoError {
    /// Single errno-to-variant mapping used everywhere a filesystem call
    /// feeds a protocol reply.
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => return LocalIoError::NotFound,
            io::ErrorKind::AlreadyExists => return LocalIoError::AlreadyExists,
            _ => {}
        }
        #[cfg(unix)]
        if let Some(code) = err.raw_os_error() {
            return match code {
                libc::ENOTDIR => LocalIoError::NotADirectory,
                libc::EISDIR => LocalIoError::IsADirectory,
                libc::ELOOP => LocalIoError::TooManySymlinks,
                libc::EIO => LocalIoError::IoFailure,
                libc::ENOSPC => LocalIoError::OutOfSpace,
                _ => LocalIoError::Unknown,
            };
        }
        LocalIoError::Unknown
    }

    /// The negative error code reported to the device in status replies.
    pub fn device_code(self) -> i64 {
        match self {
            LocalIoError::NotFound => -6,
            LocalIoError::AlreadyExists => -7,
            LocalIoError::NotADirectory => -8,
            LocalIoError::IsADirectory => -9,
            LocalIoError::TooManySymlinks => -10,
            LocalIoError::IoFailure => -11,
            LocalIoError::OutOfSpace => -15,
            LocalIoError::Unknown => -1,
        }
    }
}

/// Shorthand: map an `io::Error` straight to the device error code.
pub fn device_error_code(err: &io::Error) -> i64 {
    LocalIoError::from_io(err).device_code()
}

/// Device-transport failures, including the handshake outcomes the caller
/// must resolve interactively before retrying.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("device is locked with a passcode")]
    Locked,
    #[error("trust dialog pending on device")]
    TrustPending,
    #[error("pairing failed: {0}")]
    PairingFailed(String),
    #[error("could not start service {service}: {reason}")]
    ServiceStart { service: String, reason: String },
    #[error("transport i/o: {0}")]
    Io(#[from] io::Error),
}

/// Wire-protocol failures. Any of these aborts the session.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("device link version {0} not supported")]
    VersionMismatch(u64),
    #[error("device refused {context}: {reply}")]
    NotOk { context: &'static str, reply: String },
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("plist: {0}")]
    Plist(#[from] plist::Error),
}

/// Fatal live-backup session errors. Normal terminations (finished,
/// cancelled, device-reported failure) are `SessionOutcome`s, not errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("backup lock held by another sync client after {0} attempts")]
    LockTimeout(u32),
    #[error("local i/o: {0}")]
    Io(#[from] io::Error),
    /// Internal marker: cancellation observed while blocked on the device.
    /// Mapped to `SessionOutcome::Cancelled` before callers see it.
    #[error("cancelled while waiting for the device")]
    Interrupted,
}
