//! Backup directory discovery and validation.
//!
//! A scan accepts three root shapes: an iTunes/Finder `MobileSync`
//! container (descend into `Backup/` and check each child), a single
//! backup directory, or a plain directory of backup-id subdirectories.
//! Validation failures append human-readable lines to the scan log instead
//! of aborting, so one broken subdirectory never hides valid siblings.

use chrono::{DateTime, Local};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Metadata of one discovered backup directory.
#[derive(Debug, Clone)]
pub struct BackupManifest {
    pub path: PathBuf,
    pub device_name: String,
    pub display_name: String,
    pub itunes_version: String,
    pub ios_version: String,
    pub build_version: String,
    pub backup_time: Option<DateTime<Local>>,
    pub encrypted: bool,
}

/// Scan result: discovered backups plus the accumulated diagnostic log.
#[derive(Debug, Default)]
pub struct BackupScan {
    pub backups: Vec<BackupManifest>,
    pub log: Vec<String>,
}

pub fn scan_backups(root: &Path) -> BackupScan {
    let mut scan = BackupScan::default();

    // "<...>/MobileSync" containers keep backups under a Backup subdir.
    let effective = if root.file_name().map_or(false, |n| n == "MobileSync") {
        root.join("Backup")
    } else {
        root.to_path_buf()
    };

    if looks_like_backup(&effective) {
        scan_one(&effective, &mut scan);
        return scan;
    }

    let entries = match fs::read_dir(&effective) {
        Ok(entries) => entries,
        Err(e) => {
            scan.log
                .push(format!("{}: {}", effective.display(), e));
            return scan;
        }
    };
    for entry in entries.flatten() {
        let child = entry.path();
        if child.is_dir() {
            scan_one(&child, &mut scan);
        }
    }
    scan.backups
        .sort_by(|a, b| b.backup_time.cmp(&a.backup_time));
    scan
}

fn scan_one(dir: &Path, scan: &mut BackupScan) {
    if !is_valid_backup_item(dir, &mut scan.log) {
        return;
    }
    match read_backup_manifest(dir) {
        Some(m) => scan.backups.push(m),
        None => scan
            .log
            .push(format!("{}: unreadable backup metadata", dir.display())),
    }
}

fn looks_like_backup(dir: &Path) -> bool {
    dir.join("Info.plist").is_file()
}

/// Required files, checked in order; every missing one is logged.
pub fn is_valid_backup_item(dir: &Path, log: &mut Vec<String>) -> bool {
    let mut valid = true;
    if !dir.join("Info.plist").is_file() {
        log.push(format!("{}: Info.plist not found", dir.display()));
        valid = false;
    }
    if !dir.join("Manifest.plist").is_file() {
        log.push(format!("{}: Manifest.plist not found", dir.display()));
        valid = false;
    }
    if !dir.join("Manifest.db").is_file() && !dir.join("Manifest.mbdb").is_file() {
        log.push(format!(
            "{}: neither Manifest.db nor Manifest.mbdb found",
            dir.display()
        ));
        valid = false;
    }
    valid
}

fn read_backup_manifest(dir: &Path) -> Option<BackupManifest> {
    let info = plist::Value::from_file(dir.join("Info.plist")).ok()?;
    let info = info.as_dictionary()?;

    let get = |key: &str| -> String {
        info.get(key)
            .and_then(|v| v.as_string())
            .unwrap_or_default()
            .to_string()
    };

    let backup_time = info
        .get("Last Backup Date")
        .and_then(|v| v.as_date())
        .map(|d| DateTime::<Local>::from(SystemTime::from(d)));

    let mut manifest = BackupManifest {
        path: dir.to_path_buf(),
        device_name: get("Device Name"),
        display_name: get("Display Name"),
        itunes_version: get("iTunes Version"),
        ios_version: get("Product Version"),
        build_version: get("Build Version"),
        backup_time,
        encrypted: false,
    };

    // Manifest.plist supplies the encryption flag and, when Info.plist is
    // missing one, a fallback iOS version from the lockdown snapshot.
    if let Ok(extra) = plist::Value::from_file(dir.join("Manifest.plist")) {
        if let Some(dict) = extra.as_dictionary() {
            manifest.encrypted = dict
                .get("IsEncrypted")
                .and_then(|v| v.as_boolean())
                .unwrap_or(false);
            if manifest.ios_version.is_empty() {
                if let Some(ver) = dict
                    .get("Lockdown")
                    .and_then(|v| v.as_dictionary())
                    .and_then(|l| l.get("ProductVersion"))
                    .and_then(|v| v.as_string())
                {
                    manifest.ios_version = ver.to_string();
                }
            }
        }
    }

    Some(manifest)
}
