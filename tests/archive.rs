//! End-to-end archive reading over real on-disk backup directories, built
//! from scratch in a tempdir for both manifest generations.

use mobilesync::discover::{is_valid_backup_item, scan_backups};
use mobilesync::index::{ArchiveIndex, LoadOptions, ManifestKind};
use sha1::{Digest, Sha1};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const STAT_LEN: usize = 40;

fn push_str(buf: &mut Vec<u8>, s: &[u8]) {
    buf.extend_from_slice(&(s.len() as u16).to_be_bytes());
    buf.extend_from_slice(s);
}

fn push_empty(buf: &mut Vec<u8>) {
    buf.extend_from_slice(&0xFFFFu16.to_be_bytes());
}

fn mbdb_bytes(records: &[(&str, &str, u16, u32)]) -> Vec<u8> {
    let mut buf = b"mbdb\x05\x00".to_vec();
    for (domain, path, mode, mtime) in records {
        push_str(&mut buf, domain.as_bytes());
        push_str(&mut buf, path.as_bytes());
        push_empty(&mut buf); // linkTarget
        push_empty(&mut buf); // dataHash
        push_empty(&mut buf); // alwaysNull
        let mut stat = [0u8; STAT_LEN];
        stat[0..2].copy_from_slice(&mode.to_be_bytes());
        stat[22..26].copy_from_slice(&mtime.to_be_bytes());
        buf.extend_from_slice(&stat);
    }
    buf
}

fn sha1_hex(input: &str) -> String {
    let mut h = Sha1::new();
    h.update(input.as_bytes());
    h.finalize().iter().map(|b| format!("{:02x}", b)).collect()
}

fn keyed_archive_blob(size: u64, last_modified: i64) -> Vec<u8> {
    let mut obj = plist::Dictionary::new();
    obj.insert("Size".into(), plist::Value::Integer(size.into()));
    obj.insert(
        "LastModified".into(),
        plist::Value::Integer(last_modified.into()),
    );
    let mut top = plist::Dictionary::new();
    top.insert(
        "$objects".into(),
        plist::Value::Array(vec![
            plist::Value::String("$null".into()),
            plist::Value::Dictionary(obj),
        ]),
    );
    let mut buf = Vec::new();
    plist::Value::Dictionary(top)
        .to_writer_binary(&mut buf)
        .unwrap();
    buf
}

fn sqlite_manifest(dir: &Path, rows: &[(&str, &str, &str, i64, Option<Vec<u8>>)]) {
    let conn = rusqlite::Connection::open(dir.join("Manifest.db")).unwrap();
    conn.execute_batch(
        "CREATE TABLE Files (fileID TEXT PRIMARY KEY, domain TEXT, relativePath TEXT, \
         flags INTEGER, file BLOB)",
    )
    .unwrap();
    for (file_id, domain, rel, flags, blob) in rows {
        conn.execute(
            "INSERT INTO Files (fileID, domain, relativePath, flags, file) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![file_id, domain, rel, flags, blob],
        )
        .unwrap();
    }
}

fn default_opts() -> LoadOptions<'static> {
    LoadOptions {
        domain: None,
        only_files: false,
        keep: None,
    }
}

#[test]
fn mbdb_backup_resolves_flat_content_addresses() {
    let tmp = TempDir::new().unwrap();
    let domain = "AppDomain-com.tencent.xin";
    fs::write(
        tmp.path().join("Manifest.mbdb"),
        mbdb_bytes(&[
            (domain, "Documents/chat.db", 0o100644, 1_500_000_000),
            (domain, "Documents", 0o040755, 0),
        ]),
    )
    .unwrap();
    let id = sha1_hex(&format!("{domain}-Documents/chat.db"));
    fs::write(tmp.path().join(&id), b"sqlite payload").unwrap();

    let index = ArchiveIndex::load(tmp.path(), &default_opts()).unwrap();
    assert_eq!(index.kind(), ManifestKind::Mbdb);
    assert_eq!(index.len(), 2);

    // Flat layout: the id itself, directly under the backup root.
    let real = index.find_real_path("Documents/chat.db").unwrap();
    assert_eq!(real, tmp.path().join(&id));
    assert_eq!(fs::read(&real).unwrap(), b"sqlite payload");
}

#[test]
fn mbdb_copy_applies_record_mtime() {
    let tmp = TempDir::new().unwrap();
    let domain = "HomeDomain";
    fs::write(
        tmp.path().join("Manifest.mbdb"),
        mbdb_bytes(&[(domain, "Library/notes.txt", 0o100644, 1_600_000_000)]),
    )
    .unwrap();
    let id = sha1_hex(&format!("{domain}-Library/notes.txt"));
    fs::write(tmp.path().join(&id), b"hello").unwrap();

    let index = ArchiveIndex::load(tmp.path(), &default_opts()).unwrap();
    let dest = tmp.path().join("out/notes.txt");
    assert!(index.copy_file("Library/notes.txt", &dest, false));
    assert_eq!(fs::read(&dest).unwrap(), b"hello");
    let mtime = filetime::FileTime::from_last_modification_time(&fs::metadata(&dest).unwrap());
    assert_eq!(mtime.unix_seconds(), 1_600_000_000);

    // Same virtual path again without overwrite is refused.
    assert!(!index.copy_file("Library/notes.txt", &dest, false));
    assert!(index.copy_file("Library/notes.txt", &dest, true));
}

#[test]
fn sqlite_backup_resolves_sharded_content_addresses() {
    let tmp = TempDir::new().unwrap();
    let id = "ab11223344556677889900aabbccddeeff001122";
    sqlite_manifest(
        tmp.path(),
        &[
            (
                id,
                "AppDomain-com.tencent.xin",
                "Documents\\MM.sqlite",
                1,
                Some(keyed_archive_blob(5, 1_600_000_000)),
            ),
            (
                "cd00000000000000000000000000000000000000",
                "AppDomain-com.tencent.xin",
                "Documents",
                2,
                None,
            ),
        ],
    );
    fs::create_dir(tmp.path().join("ab")).unwrap();
    fs::write(tmp.path().join("ab").join(id), b"MMsql").unwrap();

    let index = ArchiveIndex::load(tmp.path(), &default_opts()).unwrap();
    assert_eq!(index.kind(), ManifestKind::Sqlite);

    // Backslash separators are normalized before lookup, and lookups may
    // use either separator.
    let real = index.find_real_path("Documents/MM.sqlite").unwrap();
    assert_eq!(real, tmp.path().join("ab").join(id));
    assert_eq!(
        index.find_real_path("Documents\\MM.sqlite").unwrap(),
        real
    );

    assert_eq!(index.known_size("Documents/MM.sqlite"), Some(5));

    let dest = tmp.path().join("out/MM.sqlite");
    assert!(index.copy_file("Documents/MM.sqlite", &dest, false));
    let mtime = filetime::FileTime::from_last_modification_time(&fs::metadata(&dest).unwrap());
    assert_eq!(mtime.unix_seconds(), 1_600_000_000);
}

#[test]
fn both_generations_agree_through_the_index_api() {
    let domain = "AppDomain-com.tencent.xin";
    let rel = "Documents/chat.db";

    let mbdb_dir = TempDir::new().unwrap();
    fs::write(
        mbdb_dir.path().join("Manifest.mbdb"),
        mbdb_bytes(&[(domain, rel, 0o100644, 1)]),
    )
    .unwrap();

    let db_dir = TempDir::new().unwrap();
    sqlite_manifest(
        db_dir.path(),
        &[("ff00000000000000000000000000000000000000", domain, rel, 1, None)],
    );

    let opts = LoadOptions {
        domain: Some(domain),
        only_files: true,
        keep: None,
    };
    for dir in [mbdb_dir.path(), db_dir.path()] {
        let index = ArchiveIndex::load(dir, &opts).unwrap();
        assert_eq!(index.len(), 1);
        let rec = &index.records()[0];
        assert_eq!(rec.domain, domain);
        assert_eq!(rec.relative_path, rel);
        assert_eq!(rec.flags, 1);
    }
}

#[test]
fn domain_and_keep_filters_restrict_the_load() {
    let tmp = TempDir::new().unwrap();
    fs::write(
        tmp.path().join("Manifest.mbdb"),
        mbdb_bytes(&[
            ("AppDomain-com.tencent.xin", "Documents/a", 0o100644, 0),
            ("AppDomain-com.tencent.xin", "tmp/b", 0o100644, 0),
            ("CameraRollDomain", "Media/c.jpg", 0o100644, 0),
        ]),
    )
    .unwrap();

    let keep = |rel: &str, _flags: u8| !rel.starts_with("tmp/");
    let opts = LoadOptions {
        domain: Some("AppDomain-com.tencent.xin"),
        only_files: true,
        keep: Some(&keep),
    };
    let index = ArchiveIndex::load(tmp.path(), &opts).unwrap();
    assert_eq!(index.len(), 1);
    assert_eq!(index.records()[0].relative_path, "Documents/a");
}

#[test]
fn validator_names_each_missing_piece() {
    let tmp = TempDir::new().unwrap();
    let mut log = Vec::new();
    assert!(!is_valid_backup_item(tmp.path(), &mut log));
    assert!(log.iter().any(|l| l.ends_with("Info.plist not found")));
    assert!(log.iter().any(|l| l.ends_with("Manifest.plist not found")));
    assert!(log
        .iter()
        .any(|l| l.ends_with("neither Manifest.db nor Manifest.mbdb found")));

    fs::write(tmp.path().join("Info.plist"), b"x").unwrap();
    fs::write(tmp.path().join("Manifest.plist"), b"x").unwrap();
    fs::write(tmp.path().join("Manifest.mbdb"), b"x").unwrap();
    let mut log = Vec::new();
    assert!(is_valid_backup_item(tmp.path(), &mut log));
    assert!(log.is_empty());
}

#[test]
fn scan_descends_into_mobilesync_container() {
    let tmp = TempDir::new().unwrap();
    let container = tmp.path().join("MobileSync");
    let backup = container.join("Backup").join("00aa");
    fs::create_dir_all(&backup).unwrap();

    let mut info = plist::Dictionary::new();
    info.insert(
        "Device Name".into(),
        plist::Value::String("test phone".into()),
    );
    info.insert(
        "Product Version".into(),
        plist::Value::String("9.3.5".into()),
    );
    plist::Value::Dictionary(info)
        .to_file_xml(backup.join("Info.plist"))
        .unwrap();
    let manifest = plist::Dictionary::new();
    plist::Value::Dictionary(manifest)
        .to_file_xml(backup.join("Manifest.plist"))
        .unwrap();
    fs::write(backup.join("Manifest.mbdb"), mbdb_bytes(&[])).unwrap();

    let scan = scan_backups(&container);
    assert_eq!(scan.backups.len(), 1);
    assert_eq!(scan.backups[0].device_name, "test phone");
    assert_eq!(scan.backups[0].ios_version, "9.3.5");
    assert!(!scan.backups[0].encrypted);
}
