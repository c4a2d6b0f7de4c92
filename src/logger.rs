use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Session/scan event sink. Implementations must be cheap; the dispatch loop
/// calls these inline.
pub trait Logger: Send + Sync {
    fn state(&self, _state: &str) {}
    fn file_sent(&self, _path: &str, _bytes: u64) {}
    fn file_received(&self, _path: &str, _bytes: u64) {}
    fn removed(&self, _path: &str) {}
    fn error(&self, _context: &str, _path: &str, _msg: &str) {}
    fn finished(&self, _files: u64, _bytes: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl Logger for TextLogger {
    fn state(&self, state: &str) {
        self.line(&format!("STATE {state}"));
    }
    fn file_sent(&self, path: &str, bytes: u64) {
        self.line(&format!("SEND path={path} bytes={bytes}"));
    }
    fn file_received(&self, path: &str, bytes: u64) {
        self.line(&format!("RECV path={path} bytes={bytes}"));
    }
    fn removed(&self, path: &str) {
        self.line(&format!("REMOVE path={path}"));
    }
    fn error(&self, context: &str, path: &str, msg: &str) {
        self.line(&format!("ERROR ctx={context} path={path} msg={msg}"));
    }
    fn finished(&self, files: u64, bytes: u64, seconds: f64) {
        self.line(&format!("DONE files={files} bytes={bytes} seconds={seconds:.3}"));
    }
}
