//! DLMessage decoding and reply construction.
//!
//! Messages travel as plist arrays whose first element is the literal
//! message name. Replies are `DLMessageStatusResponse` arrays carrying an
//! error code, a description (or the conventional empty-parameter marker),
//! and either a payload value or a multi-status dictionary.

use crate::error::ProtocolError;
use plist::{Dictionary, Value};

pub const EMPTY_PARAMETER: &str = "___EmptyParameterString___";
pub const STATUS_RESPONSE: &str = "DLMessageStatusResponse";

/// Multi-status replies use this code with one entry per failed path.
pub const CODE_MULTI_STATUS: i64 = -13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    DownloadFiles,
    UploadFiles,
    ContentsOfDirectory,
    CreateDirectory,
    MoveFiles,
    MoveItems,
    RemoveFiles,
    RemoveItems,
    CopyItem,
    GetFreeDiskSpace,
    PurgeDiskSpace,
    Disconnect,
    ProcessMessage,
}

impl MessageKind {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "DLMessageDownloadFiles" => MessageKind::DownloadFiles,
            "DLMessageUploadFiles" => MessageKind::UploadFiles,
            "DLContentsOfDirectory" => MessageKind::ContentsOfDirectory,
            "DLMessageCreateDirectory" => MessageKind::CreateDirectory,
            "DLMessageMoveFiles" => MessageKind::MoveFiles,
            "DLMessageMoveItems" => MessageKind::MoveItems,
            "DLMessageRemoveFiles" => MessageKind::RemoveFiles,
            "DLMessageRemoveItems" => MessageKind::RemoveItems,
            "DLMessageCopyItem" => MessageKind::CopyItem,
            "DLMessageGetFreeDiskSpace" => MessageKind::GetFreeDiskSpace,
            "DLMessagePurgeDiskSpace" => MessageKind::PurgeDiskSpace,
            "DLMessageDisconnect" => MessageKind::Disconnect,
            "DLMessageProcessMessage" => MessageKind::ProcessMessage,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageKind::DownloadFiles => "DLMessageDownloadFiles",
            MessageKind::UploadFiles => "DLMessageUploadFiles",
            MessageKind::ContentsOfDirectory => "DLContentsOfDirectory",
            MessageKind::CreateDirectory => "DLMessageCreateDirectory",
            MessageKind::MoveFiles => "DLMessageMoveFiles",
            MessageKind::MoveItems => "DLMessageMoveItems",
            MessageKind::RemoveFiles => "DLMessageRemoveFiles",
            MessageKind::RemoveItems => "DLMessageRemoveItems",
            MessageKind::CopyItem => "DLMessageCopyItem",
            MessageKind::GetFreeDiskSpace => "DLMessageGetFreeDiskSpace",
            MessageKind::PurgeDiskSpace => "DLMessagePurgeDiskSpace",
            MessageKind::Disconnect => "DLMessageDisconnect",
            MessageKind::ProcessMessage => "DLMessageProcessMessage",
        }
    }

    /// Array slot carrying the device's overall-progress report, for the
    /// kinds that include one.
    fn progress_index(self) -> Option<usize> {
        match self {
            MessageKind::DownloadFiles => Some(3),
            MessageKind::UploadFiles => Some(2),
            MessageKind::MoveFiles | MessageKind::MoveItems => Some(3),
            MessageKind::RemoveFiles | MessageKind::RemoveItems => Some(3),
            _ => None,
        }
    }
}

/// One decoded inbound message; ephemeral, dispatched and discarded.
#[derive(Debug, Clone)]
pub struct ProtocolMessage {
    pub kind: MessageKind,
    body: Vec<Value>,
}

impl ProtocolMessage {
    pub fn decode(value: Value) -> Result<Self, ProtocolError> {
        let body = match value {
            Value::Array(items) => items,
            other => {
                return Err(ProtocolError::MalformedMessage(format!(
                    "expected array, got {other:?}"
                )))
            }
        };
        let name = body
            .first()
            .and_then(|v| v.as_string())
            .ok_or_else(|| ProtocolError::MalformedMessage("missing message name".into()))?;
        let kind = MessageKind::from_name(name)
            .ok_or_else(|| ProtocolError::MalformedMessage(format!("unknown message {name}")))?;
        Ok(Self { kind, body })
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.body.get(index)
    }

    pub fn string_arg(&self, index: usize) -> Result<&str, ProtocolError> {
        self.arg(index).and_then(|v| v.as_string()).ok_or_else(|| {
            ProtocolError::MalformedMessage(format!(
                "{}: argument {index} is not a string",
                self.kind.name()
            ))
        })
    }

    pub fn array_arg(&self, index: usize) -> Result<&[Value], ProtocolError> {
        self.arg(index)
            .and_then(|v| v.as_array())
            .map(|v| v.as_slice())
            .ok_or_else(|| {
                ProtocolError::MalformedMessage(format!(
                    "{}: argument {index} is not an array",
                    self.kind.name()
                ))
            })
    }

    pub fn dict_arg(&self, index: usize) -> Result<&Dictionary, ProtocolError> {
        self.arg(index).and_then(|v| v.as_dictionary()).ok_or_else(|| {
            ProtocolError::MalformedMessage(format!(
                "{}: argument {index} is not a dictionary",
                self.kind.name()
            ))
        })
    }

    pub fn uint_arg(&self, index: usize) -> Option<u64> {
        match self.arg(index)? {
            Value::Integer(i) => i.as_unsigned(),
            Value::Real(r) if *r >= 0.0 => Some(*r as u64),
            _ => None,
        }
    }

    /// Overall-progress report carried by this message, if its kind has
    /// one and the value is present.
    pub fn overall_progress(&self) -> Option<f64> {
        let at = self.kind.progress_index()?;
        match self.arg(at)? {
            Value::Real(r) => Some(*r),
            Value::Integer(i) => i.as_signed().map(|v| v as f64),
            _ => None,
        }
    }
}

/// Build a `DLMessageStatusResponse` array. `status` defaults to the empty
/// parameter marker; `extra` is the payload slot (multi-status dictionary,
/// directory listing, free-space integer...).
pub fn status_response(code: i64, status: Option<&str>, extra: Value) -> Value {
    Value::Array(vec![
        Value::String(STATUS_RESPONSE.into()),
        Value::Integer(code.into()),
        Value::String(status.unwrap_or(EMPTY_PARAMETER).into()),
        extra,
    ])
}

/// Per-path error accumulator for batch handlers; serializes to the
/// multi-status dictionary the device expects.
#[derive(Debug, Default)]
pub struct MultiStatus {
    entries: Dictionary,
}

impl MultiStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, path: &str, code: i64, message: &str) {
        let mut entry = Dictionary::new();
        entry.insert("DLFileErrorString".into(), Value::String(message.into()));
        entry.insert("DLFileErrorCode".into(), Value::Integer(code.into()));
        self.entries.insert(path.into(), Value::Dictionary(entry));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn into_value(self) -> Value {
        Value::Dictionary(self.entries)
    }

    /// The standard reply for a batch: all-clear, or multi-status with one
    /// entry per failed path.
    pub fn into_reply(self) -> (i64, Option<String>, Value) {
        if self.is_empty() {
            (0, None, Value::Dictionary(Dictionary::new()))
        } else {
            (
                CODE_MULTI_STATUS,
                Some("Multi status".to_string()),
                self.into_value(),
            )
        }
    }
}
