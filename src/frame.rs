//! Chunk framing for the file-transfer sub-protocol.
//!
//! Every unit on the wire is a 4-byte big-endian length `L` followed by `L`
//! bytes whose first byte is a status code; `FILE_DATA` chunks carry `L-1`
//! payload bytes and a zero `L` terminates a stream. Filenames use the same
//! length prefix without a status byte. The codec is symmetric: the writer
//! side here produces exactly what the reader side consumes.

use crate::error::ProtocolError;
use crate::session::CancelFlag;
use std::io::{Read, Write};

pub const CODE_SUCCESS: u8 = 0x00;
pub const CODE_ERROR_LOCAL: u8 = 0x06;
pub const CODE_ERROR_REMOTE: u8 = 0x0b;
pub const CODE_FILE_DATA: u8 = 0x0c;

/// Outgoing file data is cut into chunks of this size.
pub const SEND_CHUNK: usize = 32 * 1024;
/// Filenames longer than this mean a corrupt stream; bail out early.
pub const MAX_NAME_LEN: usize = 4096;

/// One decoded unit of a per-file stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// `FILE_DATA` payload bytes.
    Data(Vec<u8>),
    /// `SUCCESS` terminator: file completed.
    Success,
    /// Our own side reported a local failure.
    ErrorLocal(String),
    /// Device-side failure message.
    ErrorRemote(String),
    /// Unrecognized status code, payload preserved.
    Other(u8, Vec<u8>),
    /// Zero-length terminator.
    End,
}

pub fn read_chunk(r: &mut impl Read) -> Result<Chunk, ProtocolError> {
    let len = read_u32(r)?;
    if len == 0 {
        return Ok(Chunk::End);
    }
    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body)
        .map_err(|e| ProtocolError::MalformedFrame(format!("short chunk body: {e}")))?;
    let code = body[0];
    let payload = body.split_off(1);
    Ok(match code {
        CODE_FILE_DATA => Chunk::Data(payload),
        CODE_SUCCESS => Chunk::Success,
        CODE_ERROR_LOCAL => Chunk::ErrorLocal(String::from_utf8_lossy(&payload).into_owned()),
        CODE_ERROR_REMOTE => Chunk::ErrorRemote(String::from_utf8_lossy(&payload).into_owned()),
        other => Chunk::Other(other, payload),
    })
}

pub fn write_chunk(w: &mut impl Write, code: u8, payload: &[u8]) -> std::io::Result<()> {
    w.write_all(&((payload.len() as u32 + 1).to_be_bytes()))?;
    w.write_all(&[code])?;
    w.write_all(payload)
}

/// Zero-length terminator ending a stream (or a whole file list).
pub fn write_terminator(w: &mut impl Write) -> std::io::Result<()> {
    w.write_all(&0u32.to_be_bytes())
}

/// Length-prefixed filename, no status byte.
pub fn write_name(w: &mut impl Write, name: &str) -> std::io::Result<()> {
    w.write_all(&(name.len() as u32).to_be_bytes())?;
    w.write_all(name.as_bytes())
}

/// Reads a filename; `None` when the zero-length list terminator arrives.
pub fn read_name(r: &mut impl Read) -> Result<Option<String>, ProtocolError> {
    let len = read_u32(r)? as usize;
    if len == 0 {
        return Ok(None);
    }
    if len > MAX_NAME_LEN {
        return Err(ProtocolError::MalformedFrame(format!(
            "filename length {len} exceeds {MAX_NAME_LEN}"
        )));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)
        .map_err(|e| ProtocolError::MalformedFrame(format!("short filename: {e}")))?;
    String::from_utf8(buf)
        .map(Some)
        .map_err(|_| ProtocolError::MalformedFrame("filename is not UTF-8".into()))
}

/// Result of streaming one file's bytes out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Completed(u64),
    /// Cancellation observed between chunks; byte count covers what was
    /// already flushed.
    Cancelled(u64),
}

/// Stream `src` as `FILE_DATA` chunks. The cancel flag is polled at every
/// chunk boundary; the caller still owns the terminator/status chunk.
pub fn send_file(
    w: &mut impl Write,
    src: &mut impl Read,
    cancel: &CancelFlag,
    mut on_bytes: impl FnMut(u64),
) -> std::io::Result<SendOutcome> {
    let mut buf = vec![0u8; SEND_CHUNK];
    let mut total = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Ok(SendOutcome::Cancelled(total));
        }
        let n = src.read(&mut buf)?;
        if n == 0 {
            return Ok(SendOutcome::Completed(total));
        }
        write_chunk(w, CODE_FILE_DATA, &buf[..n])?;
        total += n as u64;
        on_bytes(n as u64);
    }
}

fn read_u32(r: &mut impl Read) -> Result<u32, ProtocolError> {
    let mut len = [0u8; 4];
    r.read_exact(&mut len)
        .map_err(|e| ProtocolError::MalformedFrame(format!("short length prefix: {e}")))?;
    Ok(u32::from_be_bytes(len))
}
