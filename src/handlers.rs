//! One handler per DLMessage kind.
//!
//! Handlers are stateless functions of (message, backup root, filesystem,
//! context); each returns the status reply the session sends back. Batch
//! operations collect per-path failures into a multi-status reply and keep
//! going; only transport-level failures (or cancellation) escape.

use crate::error::{device_error_code, ProtocolError, SessionError, TransportError};
use crate::frame::{self, Chunk, SendOutcome};
use crate::fsutil;
use crate::index::ArchiveIndex;
use crate::logger::Logger;
use crate::message::{MultiStatus, ProtocolMessage};
use crate::session::CancelFlag;
use crate::transport::{LinkStream, ServiceLink, RECEIVE_TIMEOUT};
use plist::{Dictionary, Value};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// Telemetry counters threaded through the dispatch chain instead of
/// global statics.
#[derive(Debug, Default, Clone)]
pub struct Counters {
    pub zero_size_backfills: u64,
    pub files_sent: u64,
    pub bytes_sent: u64,
    pub files_received: u64,
    pub bytes_received: u64,
    pub batch_failures: u64,
}

/// Everything a handler may touch besides the message itself.
pub struct HandlerCtx<'a> {
    /// On-disk backup root the device messages are relative to.
    pub root: &'a Path,
    /// Index of the existing snapshot, for size backfills.
    pub index: Option<&'a ArchiveIndex>,
    /// Known sizes by UDID-stripped relative path; fed by receives,
    /// consulted by directory listings.
    pub sizes: &'a mut HashMap<String, u64>,
    pub counters: &'a mut Counters,
    pub logger: &'a dyn Logger,
    pub cancel: &'a CancelFlag,
    /// Receive filter: true skips writing that incoming path (the stream
    /// is still drained to stay in sync).
    pub skip: Option<&'a dyn Fn(&str) -> bool>,
    /// Receive-progress sink, percentage of the declared batch total.
    pub progress: &'a mut dyn FnMut(f64),
}

#[derive(Debug)]
pub struct Reply {
    pub code: i64,
    pub status: Option<String>,
    pub extra: Value,
}

impl Reply {
    fn ok() -> Self {
        Reply {
            code: 0,
            status: None,
            extra: Value::Dictionary(Dictionary::new()),
        }
    }

    fn from_multi(ms: MultiStatus) -> Self {
        let (code, status, extra) = ms.into_reply();
        Reply {
            code,
            status,
            extra,
        }
    }
}

#[derive(Debug)]
pub enum HandlerOutcome {
    Reply(Reply),
    /// Cancellation observed mid-operation; the session terminates.
    Cancelled,
}

/// Strip a leading `<udid>/` component (40 hex characters) so paths match
/// the size-index keys. Length-gated only; UDID-like substrings deeper in
/// the path are left alone.
pub fn strip_udid_prefix(path: &str) -> &str {
    if let Some((first, rest)) = path.split_once('/') {
        if first.len() == 40 && first.bytes().all(|b| b.is_ascii_hexdigit()) {
            return rest;
        }
    }
    path
}

pub fn contents_of_directory(
    msg: &ProtocolMessage,
    ctx: &mut HandlerCtx,
) -> Result<HandlerOutcome, SessionError> {
    let rel = msg.string_arg(1)?;
    let dir = fsutil::join_relative(ctx.root, rel);
    let mut listing = Dictionary::new();

    if let Ok(entries) = fs::read_dir(&dir) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Ok(meta) = entry.metadata() else {
                continue; // per-entry failures never abort a listing
            };
            let mut info = Dictionary::new();
            let file_type = if meta.is_dir() {
                "DLFileTypeDirectory"
            } else if meta.is_file() {
                "DLFileTypeRegular"
            } else {
                "DLFileTypeUnknown"
            };
            info.insert("DLFileType".into(), Value::String(file_type.into()));

            let mut size = meta.len();
            if meta.is_file() && size == 0 {
                // Devices report placeholder entries as empty; fall back
                // to the size recorded at receive time or in the index.
                let joined = format!("{}/{}", fsutil::normalize_separators(rel), name);
                let key = strip_udid_prefix(joined.trim_start_matches('/'));
                if let Some(known) = ctx
                    .sizes
                    .get(key)
                    .copied()
                    .or_else(|| ctx.index.and_then(|ix| ix.size_by_content_path(key)))
                {
                    size = known;
                    ctx.counters.zero_size_backfills += 1;
                }
            }
            info.insert("DLFileSize".into(), Value::Integer(size.into()));
            if let Ok(modified) = meta.modified() {
                info.insert("DLFileModificationDate".into(), Value::Date(modified.into()));
            }
            listing.insert(name, Value::Dictionary(info));
        }
    }

    Ok(HandlerOutcome::Reply(Reply {
        code: 0,
        status: None,
        extra: Value::Dictionary(listing),
    }))
}

pub fn create_directory(
    msg: &ProtocolMessage,
    ctx: &mut HandlerCtx,
) -> Result<HandlerOutcome, SessionError> {
    let rel = msg.string_arg(1)?;
    let dir = fsutil::join_relative(ctx.root, rel);
    let reply = match fs::create_dir_all(&dir) {
        Ok(()) => Reply::ok(),
        Err(e) => {
            ctx.logger.error("mkdir", rel, &e.to_string());
            Reply {
                code: device_error_code(&e),
                status: Some(e.to_string()),
                extra: Value::Dictionary(Dictionary::new()),
            }
        }
    };
    Ok(HandlerOutcome::Reply(reply))
}

/// `DLMessageDownloadFiles`: the device asks the host to push an ordered
/// list of files over the chunk codec. Local open failures are recorded
/// per-path and the batch continues; only transport errors abort.
pub fn send_files(
    link: &mut dyn ServiceLink,
    msg: &ProtocolMessage,
    ctx: &mut HandlerCtx,
) -> Result<HandlerOutcome, SessionError> {
    let paths: Vec<String> = msg
        .array_arg(1)?
        .iter()
        .filter_map(|v| v.as_string().map(str::to_string))
        .collect();

    let mut errs = MultiStatus::new();
    let mut cancelled = false;
    let mut stream = LinkStream::new(link, RECEIVE_TIMEOUT).with_cancel(ctx.cancel);

    for path in &paths {
        if ctx.cancel.is_cancelled() {
            cancelled = true;
            break;
        }
        frame::write_name(&mut stream, path).map_err(TransportError::from)?;
        match File::open(fsutil::join_relative(ctx.root, path)) {
            Ok(mut f) => {
                let sent = frame::send_file(&mut stream, &mut f, ctx.cancel, |_| {})
                    .map_err(TransportError::from)?;
                match sent {
                    SendOutcome::Completed(bytes) => {
                        frame::write_chunk(&mut stream, frame::CODE_SUCCESS, &[])
                            .map_err(TransportError::from)?;
                        ctx.counters.files_sent += 1;
                        ctx.counters.bytes_sent += bytes;
                        ctx.logger.file_sent(path, bytes);
                    }
                    SendOutcome::Cancelled(_) => {
                        frame::write_chunk(&mut stream, frame::CODE_ERROR_LOCAL, b"Cancelled")
                            .map_err(TransportError::from)?;
                        cancelled = true;
                        break;
                    }
                }
            }
            Err(e) => {
                let desc = e.to_string();
                frame::write_chunk(&mut stream, frame::CODE_ERROR_LOCAL, desc.as_bytes())
                    .map_err(TransportError::from)?;
                errs.add(path, device_error_code(&e), &desc);
                ctx.counters.batch_failures += 1;
                ctx.logger.error("send", path, &desc);
            }
        }
    }
    frame::write_terminator(&mut stream).map_err(TransportError::from)?;

    if cancelled {
        return Ok(HandlerOutcome::Cancelled);
    }
    Ok(HandlerOutcome::Reply(Reply::from_multi(errs)))
}

/// `DLMessageUploadFiles`: the device streams (directory, file) name pairs
/// followed by chunked contents. Local write failures populate the
/// multi-status but the stream is always drained to stay in sync.
pub fn receive_files(
    link: &mut dyn ServiceLink,
    msg: &ProtocolMessage,
    ctx: &mut HandlerCtx,
) -> Result<HandlerOutcome, SessionError> {
    let declared_total = msg.uint_arg(3).unwrap_or(0);
    let mut running_total = 0u64;
    let mut errs = MultiStatus::new();
    let mut stream = LinkStream::new(link, RECEIVE_TIMEOUT).with_cancel(ctx.cancel);

    loop {
        if ctx.cancel.is_cancelled() {
            return Ok(HandlerOutcome::Cancelled);
        }
        let Some(_device_dir) = frame::read_name(&mut stream)? else {
            break; // zero-length name terminates the batch
        };
        let fname = frame::read_name(&mut stream)?.ok_or_else(|| {
            ProtocolError::MalformedFrame("missing target filename in upload pair".into())
        })?;

        let skip = ctx.skip.map_or(false, |f| f(&fname));
        let mut file_err: Option<(i64, String)> = None;
        let mut out = if skip {
            None
        } else {
            let target = fsutil::join_relative(ctx.root, &fname);
            match fsutil::ensure_parent(&target).and_then(|_| File::create(&target)) {
                Ok(f) => Some(f),
                Err(e) => {
                    file_err = Some((device_error_code(&e), e.to_string()));
                    None
                }
            }
        };

        let mut received = 0u64;
        let mut got_data = false;
        loop {
            if ctx.cancel.is_cancelled() {
                // Partial destination file stays as flushed; the handle
                // closes on drop.
                return Ok(HandlerOutcome::Cancelled);
            }
            match frame::read_chunk(&mut stream)? {
                Chunk::Data(data) => {
                    got_data = true;
                    received += data.len() as u64;
                    if let Some(f) = out.as_mut() {
                        if let Err(e) = f.write_all(&data) {
                            file_err = Some((device_error_code(&e), e.to_string()));
                            out = None; // keep draining
                        }
                    }
                }
                Chunk::Success => break,
                Chunk::ErrorRemote(m) => {
                    // Informational after data (device aborted the tail);
                    // a real failure when it arrives in place of data.
                    if got_data {
                        ctx.logger.error("receive", &fname, &m);
                    } else {
                        errs.add(&fname, -1, &m);
                        ctx.counters.batch_failures += 1;
                    }
                    break;
                }
                Chunk::ErrorLocal(m) => {
                    errs.add(&fname, -1, &m);
                    ctx.counters.batch_failures += 1;
                    break;
                }
                Chunk::Other(_, _) => break,
                Chunk::End => break,
            }
        }

        if let Some((code, desc)) = file_err {
            errs.add(&fname, code, &desc);
            ctx.counters.batch_failures += 1;
            ctx.logger.error("receive", &fname, &desc);
        } else if out.is_some() || skip {
            if !skip {
                ctx.counters.files_received += 1;
                ctx.counters.bytes_received += received;
                ctx.logger.file_received(&fname, received);
                ctx.sizes
                    .insert(strip_udid_prefix(&fname).to_string(), received);
            }
        }

        running_total += received;
        if declared_total > 0 {
            (ctx.progress)((running_total as f64 / declared_total as f64) * 100.0);
        }
    }

    Ok(HandlerOutcome::Reply(Reply::from_multi(errs)))
}

/// Renames a dict of old->new relative paths. Any pre-existing destination
/// is deleted first. The first failure stops the batch and is reported as
/// the single error.
pub fn move_items(
    msg: &ProtocolMessage,
    ctx: &mut HandlerCtx,
) -> Result<HandlerOutcome, SessionError> {
    let moves = msg.dict_arg(1)?.clone();
    for (old, new_value) in moves.iter() {
        let Some(new) = new_value.as_string() else {
            return Err(ProtocolError::MalformedMessage(
                "move target is not a string".into(),
            )
            .into());
        };
        let from = fsutil::join_relative(ctx.root, old);
        let to = fsutil::join_relative(ctx.root, new);
        if to.exists() {
            fsutil::remove_tree(&to).ok();
        }
        if let Err(e) = fs::rename(&from, &to) {
            ctx.logger.error("move", old, &e.to_string());
            return Ok(HandlerOutcome::Reply(Reply {
                code: device_error_code(&e),
                status: Some(e.to_string()),
                extra: Value::Dictionary(Dictionary::new()),
            }));
        }
        let old_key = strip_udid_prefix(old).to_string();
        if let Some(size) = ctx.sizes.remove(&old_key) {
            ctx.sizes.insert(strip_udid_prefix(new).to_string(), size);
        }
    }
    Ok(HandlerOutcome::Reply(Reply::ok()))
}

/// Deletes each listed path, recursively for directories. Failures are
/// collected per-path and the batch continues. `Manifest.mbdx` is a
/// known-noisy leftover; its failure is reported but not logged.
pub fn remove_items(
    msg: &ProtocolMessage,
    ctx: &mut HandlerCtx,
) -> Result<HandlerOutcome, SessionError> {
    let mut errs = MultiStatus::new();
    for value in msg.array_arg(1)? {
        let Some(path) = value.as_string() else {
            continue;
        };
        let target = fsutil::join_relative(ctx.root, path);
        match fsutil::remove_tree(&target) {
            Ok(()) => ctx.logger.removed(path),
            Err(e) => {
                errs.add(path, device_error_code(&e), &e.to_string());
                ctx.counters.batch_failures += 1;
                if !path.ends_with("Manifest.mbdx") {
                    ctx.logger.error("remove", path, &e.to_string());
                }
            }
        }
    }
    Ok(HandlerOutcome::Reply(Reply::from_multi(errs)))
}

/// Copies one file or directory tree. The reply is an empty multi-status
/// regardless of outcome; failures are only logged.
pub fn copy_item(
    msg: &ProtocolMessage,
    ctx: &mut HandlerCtx,
) -> Result<HandlerOutcome, SessionError> {
    let src_rel = msg.string_arg(1)?;
    let dst_rel = msg.string_arg(2)?;
    let src = fsutil::join_relative(ctx.root, src_rel);
    let dst = fsutil::join_relative(ctx.root, dst_rel);
    if let Err(e) = fsutil::copy_tree(&src, &dst) {
        ctx.logger.error("copy", src_rel, &e.to_string());
    }
    Ok(HandlerOutcome::Reply(Reply::ok()))
}

pub fn free_disk_space(
    _msg: &ProtocolMessage,
    ctx: &mut HandlerCtx,
) -> Result<HandlerOutcome, SessionError> {
    let reply = match fsutil::free_space(ctx.root) {
        Some(space) => Reply {
            code: 0,
            status: None,
            extra: Value::Integer(space.into()),
        },
        None => Reply {
            code: -1,
            status: None,
            extra: Value::Integer(0u64.into()),
        },
    };
    Ok(HandlerOutcome::Reply(reply))
}

pub fn purge_disk_space(
    _msg: &ProtocolMessage,
    _ctx: &mut HandlerCtx,
) -> Result<HandlerOutcome, SessionError> {
    Ok(HandlerOutcome::Reply(Reply {
        code: -1,
        status: Some("Operation not supported".to_string()),
        extra: Value::Dictionary(Dictionary::new()),
    }))
}
