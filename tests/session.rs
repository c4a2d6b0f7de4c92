//! Scripted end-to-end session runs: a fake device transport feeds a
//! pre-recorded message stream and the test asserts every reply the
//! engine puts on the wire.

use mobilesync::device::DeviceInfo;
use mobilesync::error::{ProtocolError, SessionError, TransportError};
use mobilesync::logger::NoopLogger;
use mobilesync::message::CODE_MULTI_STATUS;
use mobilesync::session::{BackupSession, CancelFlag, SessionOptions, SessionState};
use mobilesync::session::SessionOutcome;
use mobilesync::transport::{
    AfcClient, DeviceTransport, HandshakeOutcome, ServiceLink, NOTIFICATION_SYNC_FINISHED,
};
use parking_lot::Mutex;
use plist::{Dictionary, Value};
use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const UDID: &str = "0011223344556677889900aabbccddeeff001122";

#[derive(Default)]
struct Wire {
    inbound: VecDeque<u8>,
    outbound: Vec<u8>,
    notifications: Vec<String>,
}

struct ScriptLink(Arc<Mutex<Wire>>);

impl ServiceLink for ScriptLink {
    fn send_raw(&mut self, data: &[u8]) -> io::Result<()> {
        self.0.lock().outbound.extend_from_slice(data);
        Ok(())
    }

    fn receive_raw(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<()> {
        let mut wire = self.0.lock();
        if wire.inbound.len() < buf.len() {
            return Err(io::Error::from(io::ErrorKind::TimedOut));
        }
        for slot in buf.iter_mut() {
            *slot = wire.inbound.pop_front().unwrap();
        }
        Ok(())
    }
}

struct OpenAfc;

impl AfcClient for OpenAfc {
    fn open(&mut self, _path: &str) -> Result<u64, TransportError> {
        Ok(1)
    }
    fn lock_exclusive(&mut self, _handle: u64) -> Result<bool, TransportError> {
        Ok(true)
    }
    fn unlock(&mut self, _handle: u64) -> Result<(), TransportError> {
        Ok(())
    }
    fn close(&mut self, _handle: u64) -> Result<(), TransportError> {
        Ok(())
    }
}

struct ScriptTransport {
    wire: Arc<Mutex<Wire>>,
    handshake: HandshakeOutcome,
}

impl ScriptTransport {
    fn new(wire: Arc<Mutex<Wire>>) -> Self {
        Self {
            wire,
            handshake: HandshakeOutcome::Trusted,
        }
    }
}

impl DeviceTransport for ScriptTransport {
    fn handshake(&mut self) -> Result<HandshakeOutcome, TransportError> {
        Ok(self.handshake.clone())
    }

    fn start_service(&mut self, _name: &str) -> Result<Box<dyn ServiceLink>, TransportError> {
        Ok(Box::new(ScriptLink(self.wire.clone())))
    }

    fn open_afc(&mut self) -> Result<Box<dyn AfcClient>, TransportError> {
        Ok(Box::new(OpenAfc))
    }

    fn post_notification(&mut self, name: &str) {
        self.wire.lock().notifications.push(name.to_string());
    }
}

fn push_message(wire: &Arc<Mutex<Wire>>, value: &Value) {
    let mut body = Vec::new();
    value.to_writer_binary(&mut body).unwrap();
    let mut w = wire.lock();
    w.inbound.extend((body.len() as u32).to_be_bytes());
    w.inbound.extend(body);
}

fn push_raw(wire: &Arc<Mutex<Wire>>, bytes: &[u8]) {
    wire.lock().inbound.extend(bytes.iter().copied());
}

fn decode_outbound(wire: &Arc<Mutex<Wire>>) -> Vec<Value> {
    let bytes = wire.lock().outbound.clone();
    let mut out = Vec::new();
    let mut at = 0usize;
    while at + 4 <= bytes.len() {
        let len = u32::from_be_bytes(bytes[at..at + 4].try_into().unwrap()) as usize;
        at += 4;
        out.push(Value::from_reader(io::Cursor::new(&bytes[at..at + len])).unwrap());
        at += len;
    }
    out
}

fn push_version_exchange(wire: &Arc<Mutex<Wire>>) {
    push_message(
        wire,
        &Value::Array(vec![
            Value::String("DLMessageVersionExchange".into()),
            Value::Integer(300u64.into()),
            Value::Integer(0u64.into()),
        ]),
    );
    push_message(
        wire,
        &Value::Array(vec![Value::String("DLMessageDeviceReady".into())]),
    );
    let mut ok = Dictionary::new();
    ok.insert("ErrorCode".into(), Value::Integer(0u64.into()));
    push_message(
        wire,
        &Value::Array(vec![
            Value::String("DLMessageProcessMessage".into()),
            Value::Dictionary(ok),
        ]),
    );
}

/// Raw upload stream for one (directory, file, contents) triple, ending
/// the batch with the zero terminator.
fn upload_stream(dname: &str, fname: &str, contents: &[u8]) -> Vec<u8> {
    let mut wire = Vec::new();
    let mut name = |w: &mut Vec<u8>, s: &str| {
        w.extend((s.len() as u32).to_be_bytes());
        w.extend(s.as_bytes());
    };
    name(&mut wire, dname);
    name(&mut wire, fname);
    wire.extend((contents.len() as u32 + 1).to_be_bytes());
    wire.push(0x0c); // FILE_DATA
    wire.extend(contents);
    wire.extend(1u32.to_be_bytes());
    wire.push(0x00); // SUCCESS
    wire.extend(0u32.to_be_bytes()); // end of batch
    wire
}

fn write_status_plist(dir: &Path, state: &str) {
    let mut dict = Dictionary::new();
    dict.insert("SnapshotState".into(), Value::String(state.into()));
    std::fs::create_dir_all(dir).unwrap();
    Value::Dictionary(dict)
        .to_file_binary(dir.join("Status.plist"))
        .unwrap();
}

fn fast_options() -> SessionOptions {
    SessionOptions {
        force_full_backup: false,
        lock_wait: Duration::from_millis(0),
    }
}

#[test]
fn scripted_backup_runs_to_finished() {
    let tmp = TempDir::new().unwrap();
    let snapshot = tmp.path().join(UDID);
    write_status_plist(&snapshot, "finished");
    std::fs::write(snapshot.join("old.bin"), b"stale").unwrap();

    let wire = Arc::new(Mutex::new(Wire::default()));
    push_version_exchange(&wire);
    push_message(
        &wire,
        &Value::Array(vec![
            Value::String("DLMessageCreateDirectory".into()),
            Value::String(format!("{UDID}/Snapshot")),
        ]),
    );
    push_message(
        &wire,
        &Value::Array(vec![
            Value::String("DLMessageUploadFiles".into()),
            Value::Array(vec![]),
            Value::Real(0.0),
            Value::Integer(6u64.into()),
        ]),
    );
    push_raw(
        &wire,
        &upload_stream(UDID, &format!("{UDID}/Snapshot/file.bin"), b"abcdef"),
    );
    push_message(
        &wire,
        &Value::Array(vec![
            Value::String("DLMessageRemoveFiles".into()),
            Value::Array(vec![
                Value::String(format!("{UDID}/old.bin")),
                Value::String(format!("{UDID}/missing.bin")),
            ]),
            Value::String(String::new()),
            Value::Real(50.0),
        ]),
    );
    push_message(
        &wire,
        &Value::Array(vec![Value::String("DLMessageDisconnect".into())]),
    );

    let mut transport = ScriptTransport::new(wire.clone());
    let mut device = DeviceInfo::new(UDID, "phone", true);
    let logger = NoopLogger;
    let mut session = BackupSession::new(&mut device, tmp.path(), &logger)
        .with_options(fast_options());
    let outcome = session.run(&mut transport).unwrap();

    assert_eq!(outcome, SessionOutcome::Finished);
    assert_eq!(session.state(), SessionState::Finished);
    assert_eq!(session.overall_progress(), 50.0);
    assert_eq!(session.counters().files_received, 1);
    assert_eq!(session.counters().batch_failures, 1);

    // Effects on disk: the upload landed, the listed path is gone.
    assert_eq!(
        std::fs::read(snapshot.join("Snapshot/file.bin")).unwrap(),
        b"abcdef"
    );
    assert!(!snapshot.join("old.bin").exists());

    // Host side of the wire, in order: version ack, hello, backup
    // request, then one status response per filesystem message.
    let sent = decode_outbound(&wire);
    assert_eq!(sent.len(), 6);
    let versions_ok = sent[0].as_array().unwrap();
    assert_eq!(versions_ok[1].as_string(), Some("DLVersionsOk"));
    let hello = sent[1].as_array().unwrap();
    assert_eq!(
        hello[1]
            .as_dictionary()
            .unwrap()
            .get("MessageName")
            .and_then(|v| v.as_string()),
        Some("Hello")
    );
    let backup = sent[2].as_array().unwrap();
    let req = backup[1].as_dictionary().unwrap();
    assert_eq!(
        req.get("MessageName").and_then(|v| v.as_string()),
        Some("Backup")
    );
    assert_eq!(
        req.get("TargetIdentifier").and_then(|v| v.as_string()),
        Some(UDID)
    );

    for reply in &sent[3..5] {
        let parts = reply.as_array().unwrap();
        assert_eq!(parts[0].as_string(), Some("DLMessageStatusResponse"));
        assert_eq!(parts[1].as_signed_integer(), Some(0));
    }
    let multi = sent[5].as_array().unwrap();
    assert_eq!(multi[1].as_signed_integer(), Some(CODE_MULTI_STATUS));
    let errors = multi[3].as_dictionary().unwrap();
    assert_eq!(errors.len(), 1);
    let entry = errors
        .get(&format!("{UDID}/missing.bin"))
        .and_then(|v| v.as_dictionary())
        .unwrap();
    assert_eq!(
        entry.get("DLFileErrorCode").and_then(|v| v.as_signed_integer()),
        Some(-6)
    );

    assert_eq!(
        wire.lock().notifications,
        vec![NOTIFICATION_SYNC_FINISHED.to_string()]
    );
}

#[test]
fn device_reported_failure_becomes_failed_outcome() {
    let tmp = TempDir::new().unwrap();
    let wire = Arc::new(Mutex::new(Wire::default()));
    push_version_exchange(&wire);
    let mut result = Dictionary::new();
    result.insert("ErrorCode".into(), Value::Integer(102i64.into()));
    result.insert(
        "ErrorDescription".into(),
        Value::String("not enough free space".into()),
    );
    push_message(
        &wire,
        &Value::Array(vec![
            Value::String("DLMessageProcessMessage".into()),
            Value::Dictionary(result),
        ]),
    );

    let mut transport = ScriptTransport::new(wire);
    let mut device = DeviceInfo::new(UDID, "phone", true);
    let logger = NoopLogger;
    let outcome = BackupSession::new(&mut device, tmp.path(), &logger)
        .with_options(fast_options())
        .run(&mut transport)
        .unwrap();
    assert_eq!(
        outcome,
        SessionOutcome::Failed {
            code: 102,
            message: "not enough free space".to_string()
        }
    );
}

#[test]
fn unfinished_snapshot_state_is_a_failure() {
    let tmp = TempDir::new().unwrap();
    write_status_plist(&tmp.path().join(UDID), "uploading");

    let wire = Arc::new(Mutex::new(Wire::default()));
    push_version_exchange(&wire);
    push_message(
        &wire,
        &Value::Array(vec![Value::String("DLMessageDisconnect".into())]),
    );

    let mut transport = ScriptTransport::new(wire);
    let mut device = DeviceInfo::new(UDID, "phone", true);
    let logger = NoopLogger;
    let outcome = BackupSession::new(&mut device, tmp.path(), &logger)
        .with_options(fast_options())
        .run(&mut transport)
        .unwrap();
    assert!(matches!(outcome, SessionOutcome::Failed { code: -1, .. }));
}

#[test]
fn newer_device_link_version_aborts() {
    let tmp = TempDir::new().unwrap();
    let wire = Arc::new(Mutex::new(Wire::default()));
    push_message(
        &wire,
        &Value::Array(vec![
            Value::String("DLMessageVersionExchange".into()),
            Value::Integer(500u64.into()),
            Value::Integer(0u64.into()),
        ]),
    );

    let mut transport = ScriptTransport::new(wire.clone());
    let mut device = DeviceInfo::new(UDID, "phone", true);
    let logger = NoopLogger;
    let mut session = BackupSession::new(&mut device, tmp.path(), &logger)
        .with_options(fast_options());
    let err = session.run(&mut transport).unwrap_err();
    assert!(matches!(
        err,
        SessionError::Protocol(ProtocolError::VersionMismatch(500))
    ));
    assert_eq!(session.state(), SessionState::Failed);
    // The sync-finished notification goes out even on failure.
    assert_eq!(wire.lock().notifications.len(), 1);
}

#[test]
fn locked_device_fails_before_services() {
    let tmp = TempDir::new().unwrap();
    let wire = Arc::new(Mutex::new(Wire::default()));
    let mut transport = ScriptTransport::new(wire);
    transport.handshake = HandshakeOutcome::Locked;

    let mut device = DeviceInfo::new(UDID, "phone", true);
    let logger = NoopLogger;
    let err = BackupSession::new(&mut device, tmp.path(), &logger)
        .run(&mut transport)
        .unwrap_err();
    assert!(matches!(err, SessionError::Transport(TransportError::Locked)));
    assert!(device.locked);
}

#[test]
fn pre_cancelled_session_never_talks_to_the_device() {
    let tmp = TempDir::new().unwrap();
    let wire = Arc::new(Mutex::new(Wire::default()));
    let cancel = CancelFlag::new();
    cancel.cancel();

    let mut transport = ScriptTransport::new(wire.clone());
    let mut device = DeviceInfo::new(UDID, "phone", true);
    let logger = NoopLogger;
    let mut session = BackupSession::new(&mut device, tmp.path(), &logger)
        .with_options(fast_options())
        .with_cancel(cancel);
    let outcome = session.run(&mut transport).unwrap();
    assert_eq!(outcome, SessionOutcome::Cancelled);
    assert_eq!(session.state(), SessionState::Cancelled);
    assert!(wire.lock().outbound.is_empty());
    assert_eq!(wire.lock().notifications.len(), 1);
}
