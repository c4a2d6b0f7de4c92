//! Connected-device description.

use crate::transport::{HandshakeOutcome, TransportProvider};
use std::path::PathBuf;

/// One discovered device. The trust flags are filled in during the session
/// handshake and read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub udid: String,
    pub name: String,
    pub usb: bool,
    pub locked: bool,
    pub trust_pending: bool,
    pub trusted: bool,
    /// WeChat app sandbox, when the export pipeline has resolved it.
    pub wechat_container_path: Option<PathBuf>,
    pub wechat_container_uuid: Option<String>,
}

impl DeviceInfo {
    pub fn new(udid: impl Into<String>, name: impl Into<String>, usb: bool) -> Self {
        Self {
            udid: udid.into(),
            name: name.into(),
            usb,
            ..Default::default()
        }
    }

    /// Record a handshake result on the device flags.
    pub fn apply_handshake(&mut self, outcome: &HandshakeOutcome) {
        self.locked = matches!(outcome, HandshakeOutcome::Locked);
        self.trust_pending = matches!(outcome, HandshakeOutcome::TrustPending);
        self.trusted = matches!(outcome, HandshakeOutcome::Trusted);
    }
}

pub fn discover_devices(provider: &dyn TransportProvider) -> Vec<DeviceInfo> {
    provider.discover()
}
