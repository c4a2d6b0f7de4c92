//! Live-backup session state machine.
//!
//! One session drives one device over the mobilebackup2 service, single
//! threaded and blocking: handshake, service startup, sync-lock
//! acquisition, version exchange, backup request, then the dispatch loop
//! that answers device messages until disconnect. Cancellation is
//! cooperative through a shared flag polled at every loop and chunk
//! boundary. Whatever happens, the AFC lock is released and the
//! sync-finished notification posted on the way out.

use crate::device::DeviceInfo;
use crate::error::{ProtocolError, SessionError, TransportError};
use crate::handlers::{self, Counters, HandlerCtx, HandlerOutcome};
use crate::index::{blob_size, ArchiveIndex, LoadOptions};
use crate::logger::Logger;
use crate::message::{status_response, MessageKind, ProtocolMessage};
use crate::transport::{
    receive_protocol_message, send_message, AfcClient, DeviceTransport, HandshakeOutcome,
    ServiceLink, TransportProvider, LOCK_FILE, NOTIFICATION_SYNC_FINISHED, RECEIVE_TIMEOUT,
    SERVICE_MOBILEBACKUP2, SERVICE_NOTIFICATION_PROXY,
};
use plist::{Dictionary, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const LOCK_ATTEMPTS: u32 = 50;
pub const LOCK_WAIT: Duration = Duration::from_millis(200);

/// Highest device-link exchange version we answer for.
const DEVICE_LINK_VERSION_MAJOR: u64 = 400;
const PROTOCOL_VERSIONS: [f64; 2] = [2.0, 2.1];

/// Shared cooperative cancellation flag, settable from any thread.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    ServicesStarting,
    LockAcquiring,
    VersionExchange,
    BackupRequested,
    MessageLoop,
    Finished,
    Cancelled,
    Failed,
}

impl SessionState {
    pub fn name(self) -> &'static str {
        match self {
            SessionState::Connecting => "Connecting",
            SessionState::Handshaking => "Handshaking",
            SessionState::ServicesStarting => "ServicesStarting",
            SessionState::LockAcquiring => "LockAcquiring",
            SessionState::VersionExchange => "VersionExchange",
            SessionState::BackupRequested => "BackupRequested",
            SessionState::MessageLoop => "MessageLoop",
            SessionState::Finished => "Finished",
            SessionState::Cancelled => "Cancelled",
            SessionState::Failed => "Failed",
        }
    }
}

/// How a completed session run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Finished,
    Cancelled,
    /// Last protocol result code/description from the device.
    Failed { code: i64, message: String },
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Ask the device for a full, non-incremental backup.
    pub force_full_backup: bool,
    /// Inter-attempt delay during sync-lock acquisition.
    pub lock_wait: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            force_full_backup: false,
            lock_wait: LOCK_WAIT,
        }
    }
}

pub struct BackupSession<'a> {
    device: &'a mut DeviceInfo,
    output: PathBuf,
    options: SessionOptions,
    logger: &'a dyn Logger,
    cancel: CancelFlag,
    on_progress: Option<&'a (dyn Fn(f64) + Sync)>,
    /// Receive filter; paths it accepts are skipped (sandbox-private
    /// domains the export pipeline must not mirror).
    skip: Option<&'a (dyn Fn(&str) -> bool + Sync)>,
    state: SessionState,
    overall_progress: f64,
    sizes: HashMap<String, u64>,
    counters: Counters,
    final_result: Option<(i64, String)>,
}

impl<'a> BackupSession<'a> {
    pub fn new(device: &'a mut DeviceInfo, output: impl Into<PathBuf>, logger: &'a dyn Logger) -> Self {
        Self {
            device,
            output: output.into(),
            options: SessionOptions::default(),
            logger,
            cancel: CancelFlag::new(),
            on_progress: None,
            skip: None,
            state: SessionState::Connecting,
            overall_progress: 0.0,
            sizes: HashMap::new(),
            counters: Counters::default(),
            final_result: None,
        }
    }

    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, on_progress: &'a (dyn Fn(f64) + Sync)) -> Self {
        self.on_progress = Some(on_progress);
        self
    }

    pub fn with_skip(mut self, skip: &'a (dyn Fn(&str) -> bool + Sync)) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn overall_progress(&self) -> f64 {
        self.overall_progress
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        self.logger.state(state.name());
    }

    /// Drive a full backup over an already-connected transport.
    pub fn run(&mut self, transport: &mut dyn DeviceTransport) -> Result<SessionOutcome, SessionError> {
        self.set_state(SessionState::Handshaking);
        let outcome = transport.handshake()?;
        self.device.apply_handshake(&outcome);
        match outcome {
            HandshakeOutcome::Trusted => {}
            HandshakeOutcome::Locked => return self.fail(TransportError::Locked.into()),
            HandshakeOutcome::TrustPending => {
                return self.fail(TransportError::TrustPending.into())
            }
            HandshakeOutcome::Failed(m) => {
                return self.fail(TransportError::PairingFailed(m).into())
            }
        }

        self.set_state(SessionState::ServicesStarting);
        let _proxy = transport.start_service(SERVICE_NOTIFICATION_PROXY)?;
        let mut afc = transport.open_afc()?;
        let mut link = transport.start_service(SERVICE_MOBILEBACKUP2)?;

        let result = self.run_with_services(afc.as_mut(), link.as_mut());
        // Finder/iTunes parity: the device hears about the end of the sync
        // whether it succeeded, failed, or was cancelled.
        transport.post_notification(NOTIFICATION_SYNC_FINISHED);

        match &result {
            Ok(SessionOutcome::Finished) => self.set_state(SessionState::Finished),
            Ok(SessionOutcome::Cancelled) => self.set_state(SessionState::Cancelled),
            Ok(SessionOutcome::Failed { .. }) | Err(_) => self.set_state(SessionState::Failed),
        }
        result
    }

    fn fail(&mut self, err: SessionError) -> Result<SessionOutcome, SessionError> {
        self.set_state(SessionState::Failed);
        Err(err)
    }

    fn run_with_services(
        &mut self,
        afc: &mut dyn AfcClient,
        link: &mut dyn ServiceLink,
    ) -> Result<SessionOutcome, SessionError> {
        self.set_state(SessionState::LockAcquiring);
        let lock = match self.acquire_lock(afc)? {
            Some(handle) => handle,
            None => return Ok(SessionOutcome::Cancelled),
        };
        let result = self.run_locked(link);
        afc.unlock(lock).ok();
        afc.close(lock).ok();
        match result {
            Err(SessionError::Interrupted) => Ok(SessionOutcome::Cancelled),
            other => other,
        }
    }

    /// Bounded exclusive-lock attempts against the sync sentinel file.
    /// `Ok(None)` means cancellation; exhausting the attempts closes the
    /// handle and is fatal.
    fn acquire_lock(&mut self, afc: &mut dyn AfcClient) -> Result<Option<u64>, SessionError> {
        let handle = afc.open(LOCK_FILE)?;
        for _ in 0..LOCK_ATTEMPTS {
            if self.cancel.is_cancelled() {
                afc.close(handle).ok();
                return Ok(None);
            }
            match afc.lock_exclusive(handle) {
                Ok(true) => return Ok(Some(handle)),
                Ok(false) => std::thread::sleep(self.options.lock_wait),
                Err(e) => {
                    afc.close(handle).ok();
                    return Err(e.into());
                }
            }
        }
        afc.close(handle).ok();
        Err(SessionError::LockTimeout(LOCK_ATTEMPTS))
    }

    fn run_locked(&mut self, link: &mut dyn ServiceLink) -> Result<SessionOutcome, SessionError> {
        self.set_state(SessionState::VersionExchange);
        self.version_exchange(link)?;

        self.set_state(SessionState::BackupRequested);
        let snapshot_dir = self.output.join(&self.device.udid);
        fs::create_dir_all(&snapshot_dir)?;
        let index = self.prime_sizes(&snapshot_dir);
        self.send_backup_request(link)?;

        self.set_state(SessionState::MessageLoop);
        self.message_loop(link, index.as_ref())
    }

    /// Known file sizes from an existing snapshot, for the zero-size
    /// listing backfill. A missing or unreadable index is simply absent.
    fn prime_sizes(&mut self, snapshot_dir: &Path) -> Option<ArchiveIndex> {
        let index = ArchiveIndex::load(
            snapshot_dir,
            &LoadOptions {
                domain: None,
                only_files: true,
                keep: None,
            },
        )
        .ok()?;
        for rec in index.records() {
            if self.skip.map_or(false, |f| f(&rec.relative_path)) {
                continue;
            }
            if let Some(size) = rec.meta.as_deref().and_then(blob_size) {
                // Keyed like every other sizes entry: by the on-disk name
                // device listings walk, not the virtual path.
                self.sizes
                    .insert(index.content_relative_path(&rec.file_id), size);
            }
        }
        Some(index)
    }

    /// Device-link handshake followed by the mobilebackup2 Hello exchange.
    /// Any mismatch or non-OK reply here is fatal before files move.
    fn version_exchange(&mut self, link: &mut dyn ServiceLink) -> Result<(), SessionError> {
        let greeting = self.expect_raw(link)?;
        let parts = greeting
            .as_array()
            .ok_or_else(|| ProtocolError::MalformedMessage("version exchange".into()))?;
        if parts.first().and_then(|v| v.as_string()) != Some("DLMessageVersionExchange") {
            return Err(ProtocolError::NotOk {
                context: "version exchange",
                reply: format!("{greeting:?}"),
            }
            .into());
        }
        let major = parts
            .get(1)
            .and_then(|v| v.as_unsigned_integer())
            .ok_or_else(|| ProtocolError::MalformedMessage("version exchange major".into()))?;
        if major > DEVICE_LINK_VERSION_MAJOR {
            return Err(ProtocolError::VersionMismatch(major).into());
        }
        send_message(
            link,
            &Value::Array(vec![
                Value::String("DLMessageVersionExchange".into()),
                Value::String("DLVersionsOk".into()),
                Value::Integer(major.into()),
            ]),
        )?;

        let ready = self.expect_raw(link)?;
        let is_ready = ready
            .as_array()
            .and_then(|a| a.first())
            .and_then(|v| v.as_string())
            == Some("DLMessageDeviceReady");
        if !is_ready {
            return Err(ProtocolError::NotOk {
                context: "device ready",
                reply: format!("{ready:?}"),
            }
            .into());
        }

        let mut hello = Dictionary::new();
        hello.insert("MessageName".into(), Value::String("Hello".into()));
        hello.insert(
            "SupportedProtocolVersions".into(),
            Value::Array(PROTOCOL_VERSIONS.iter().map(|v| Value::Real(*v)).collect()),
        );
        send_message(
            link,
            &Value::Array(vec![
                Value::String("DLMessageProcessMessage".into()),
                Value::Dictionary(hello),
            ]),
        )?;

        let reply = self.expect_raw(link)?;
        let error_code = reply
            .as_array()
            .and_then(|a| a.get(1))
            .and_then(|v| v.as_dictionary())
            .and_then(|d| d.get("ErrorCode"))
            .and_then(|v| v.as_signed_integer());
        if error_code != Some(0) {
            return Err(ProtocolError::NotOk {
                context: "hello",
                reply: format!("{reply:?}"),
            }
            .into());
        }
        Ok(())
    }

    fn send_backup_request(&mut self, link: &mut dyn ServiceLink) -> Result<(), SessionError> {
        let mut options = Dictionary::new();
        options.insert(
            "ForceFullBackup".into(),
            Value::Boolean(self.options.force_full_backup),
        );
        let mut request = Dictionary::new();
        request.insert("MessageName".into(), Value::String("Backup".into()));
        request.insert(
            "TargetIdentifier".into(),
            Value::String(self.device.udid.clone()),
        );
        request.insert(
            "SourceIdentifier".into(),
            Value::String(self.device.udid.clone()),
        );
        request.insert("Options".into(), Value::Dictionary(options));
        send_message(
            link,
            &Value::Array(vec![
                Value::String("DLMessageProcessMessage".into()),
                Value::Dictionary(request),
            ]),
        )?;
        Ok(())
    }

    fn message_loop(
        &mut self,
        link: &mut dyn ServiceLink,
        index: Option<&ArchiveIndex>,
    ) -> Result<SessionOutcome, SessionError> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(SessionOutcome::Cancelled);
            }
            let msg = match receive_protocol_message(link, RECEIVE_TIMEOUT) {
                Ok(Some(msg)) => msg,
                Ok(None) => continue, // quiet timeout, retried silently
                Err(e) => {
                    if self.cancel.is_cancelled() {
                        return Ok(SessionOutcome::Cancelled);
                    }
                    return Err(e.into());
                }
            };

            if let Some(p) = msg.overall_progress() {
                self.report_progress(p);
            }

            match msg.kind {
                MessageKind::Disconnect => break,
                MessageKind::ProcessMessage => {
                    let dict = msg.dict_arg(1)?;
                    let code = dict
                        .get("ErrorCode")
                        .and_then(|v| v.as_signed_integer())
                        .unwrap_or(-1);
                    let message = dict
                        .get("ErrorDescription")
                        .and_then(|v| v.as_string())
                        .unwrap_or_default()
                        .to_string();
                    self.final_result = Some((code, message));
                    break;
                }
                _ => match self.dispatch(link, &msg, index)? {
                    HandlerOutcome::Cancelled => return Ok(SessionOutcome::Cancelled),
                    HandlerOutcome::Reply(reply) => {
                        send_message(
                            link,
                            &status_response(reply.code, reply.status.as_deref(), reply.extra),
                        )?;
                    }
                },
            }
        }

        match self.final_result.take() {
            Some((code, message)) if code != 0 => Ok(SessionOutcome::Failed { code, message }),
            _ => Ok(self.check_snapshot()),
        }
    }

    fn dispatch(
        &mut self,
        link: &mut dyn ServiceLink,
        msg: &ProtocolMessage,
        index: Option<&ArchiveIndex>,
    ) -> Result<HandlerOutcome, SessionError> {
        let forward = self.on_progress;
        let mut latest = 0.0f64;
        let mut progress_sink = |p: f64| {
            latest = p;
            if let Some(cb) = forward {
                cb(p);
            }
        };
        let mut ctx = HandlerCtx {
            root: &self.output,
            index,
            sizes: &mut self.sizes,
            counters: &mut self.counters,
            logger: self.logger,
            cancel: &self.cancel,
            skip: match self.skip {
                Some(f) => Some(f),
                None => None,
            },
            progress: &mut progress_sink,
        };
        let out = match msg.kind {
            MessageKind::ContentsOfDirectory => handlers::contents_of_directory(msg, &mut ctx),
            MessageKind::CreateDirectory => handlers::create_directory(msg, &mut ctx),
            MessageKind::DownloadFiles => handlers::send_files(link, msg, &mut ctx),
            MessageKind::UploadFiles => handlers::receive_files(link, msg, &mut ctx),
            MessageKind::MoveFiles | MessageKind::MoveItems => handlers::move_items(msg, &mut ctx),
            MessageKind::RemoveFiles | MessageKind::RemoveItems => {
                handlers::remove_items(msg, &mut ctx)
            }
            MessageKind::CopyItem => handlers::copy_item(msg, &mut ctx),
            MessageKind::GetFreeDiskSpace => handlers::free_disk_space(msg, &mut ctx),
            MessageKind::PurgeDiskSpace => handlers::purge_disk_space(msg, &mut ctx),
            MessageKind::Disconnect | MessageKind::ProcessMessage => {
                // Terminal kinds are consumed by the loop before dispatch.
                return Err(ProtocolError::MalformedMessage(format!(
                    "{} reached the handler table",
                    msg.kind.name()
                ))
                .into());
            }
        }?;
        if latest > 0.0 {
            self.overall_progress = latest;
        }
        Ok(out)
    }

    /// Only strictly positive reports move the needle; there is no
    /// monotonicity guarantee across message kinds.
    fn report_progress(&mut self, p: f64) {
        if p > 0.0 {
            self.overall_progress = p;
            if let Some(cb) = self.on_progress {
                cb(p);
            }
        }
    }

    /// Post-hoc snapshot check against the on-disk Status.plist.
    fn check_snapshot(&self) -> SessionOutcome {
        let status = self
            .output
            .join(&self.device.udid)
            .join("Status.plist");
        let state = plist::Value::from_file(&status).ok().and_then(|v| {
            v.as_dictionary()
                .and_then(|d| d.get("SnapshotState"))
                .and_then(|s| s.as_string())
                .map(str::to_string)
        });
        match state.as_deref() {
            Some("finished") => SessionOutcome::Finished,
            Some(other) => SessionOutcome::Failed {
                code: -1,
                message: format!("snapshot state {other}"),
            },
            None => SessionOutcome::Failed {
                code: -1,
                message: "Status.plist missing or unreadable".to_string(),
            },
        }
    }

    /// Receive one raw plist, retrying quiet timeouts, bailing out on
    /// cancellation.
    fn expect_raw(&self, link: &mut dyn ServiceLink) -> Result<Value, SessionError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(SessionError::Interrupted);
            }
            match crate::transport::receive_message(link, RECEIVE_TIMEOUT)
                .map_err(SessionError::from)?
            {
                Some(value) => return Ok(value),
                None => continue,
            }
        }
    }
}

/// Connect to a device and run one backup: the one-call entry point.
pub fn run_backup(
    provider: &dyn TransportProvider,
    device: &mut DeviceInfo,
    output: &Path,
    options: SessionOptions,
    logger: &dyn Logger,
    on_progress: Option<&(dyn Fn(f64) + Sync)>,
    cancel: CancelFlag,
) -> Result<SessionOutcome, SessionError> {
    let mut transport = provider.connect(&device.udid)?;
    let mut session = BackupSession::new(device, output, logger)
        .with_options(options)
        .with_cancel(cancel);
    if let Some(cb) = on_progress {
        session = session.with_progress(cb);
    }
    session.run(transport.as_mut())
}
