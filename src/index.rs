//! Unified virtual-path index over both historical backup manifest formats.
//!
//! `Manifest.mbdb` (pre-iOS-10) and `Manifest.db` (SQLite) are loaded into
//! the same sorted record collection, so the export pipeline can resolve a
//! virtual path like `Documents/x.txt` to the content-addressed file on
//! disk without caring which format the backup uses. An index is built once
//! by `load` and read-only afterwards; concurrent queries need no locking.

use crate::fsutil;
use crate::mbdb::{MbdbReader, FLAG_FILE};
use anyhow::{anyhow, Context, Result};
use rusqlite::{Connection, OpenFlags};
use std::fs::{self, File};
use std::io::{BufReader, Cursor};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    Mbdb,
    Sqlite,
}

/// One file/directory/symlink entry of a loaded backup.
#[derive(Debug, Clone)]
pub struct ManifestRecord {
    pub domain: String,
    /// Separators normalized to `/`.
    pub relative_path: String,
    /// Content address: SHA-1 of domain+path (mbdb) or the backup tool's
    /// assigned id (SQLite).
    pub file_id: String,
    /// 1 = file, 2 = directory, 4 = symlink.
    pub flags: u8,
    /// `Files.file` blob for SQLite file rows; a keyed-archive plist
    /// carrying `Size` and `LastModified`.
    pub meta: Option<Vec<u8>>,
    /// mbdb stat mtime, when the manifest carries one.
    pub modified: Option<i64>,
}

/// Row selection applied during `load`.
#[derive(Default)]
pub struct LoadOptions<'a> {
    /// Restrict the pass to one backup domain.
    pub domain: Option<&'a str>,
    /// Drop directory rows after the fetch.
    pub only_files: bool,
    /// Keep-predicate over (relativePath, flags). On the mbdb path it runs
    /// with decoded flags; on SQLite flags are only known once the row is
    /// fetched, so it runs just before insertion either way.
    pub keep: Option<&'a dyn Fn(&str, u8) -> bool>,
}

impl<'a> LoadOptions<'a> {
    fn admits(&self, relative_path: &str, flags: u8) -> bool {
        if let Some(keep) = self.keep {
            if !keep(relative_path, flags) {
                return false;
            }
        }
        !(self.only_files && flags != FLAG_FILE)
    }
}

pub struct ArchiveIndex {
    root: PathBuf,
    kind: ManifestKind,
    records: Vec<ManifestRecord>,
}

impl ArchiveIndex {
    /// Load a backup directory. Probes `Manifest.mbdb` first, then
    /// `Manifest.db`. Any parse failure is an `Err`; callers treat that as
    /// "not a valid backup directory" and move on.
    pub fn load(root: impl Into<PathBuf>, opts: &LoadOptions) -> Result<Self> {
        let root = root.into();
        let mbdb_path = root.join("Manifest.mbdb");
        let db_path = root.join("Manifest.db");

        let (kind, mut records) = if mbdb_path.is_file() {
            (ManifestKind::Mbdb, load_mbdb(&mbdb_path, opts)?)
        } else if db_path.is_file() {
            (ManifestKind::Sqlite, load_sqlite(&db_path, opts)?)
        } else {
            return Err(anyhow!("no manifest found in {}", root.display()));
        };

        records.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        Ok(Self {
            root,
            kind,
            records,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn kind(&self) -> ManifestKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[ManifestRecord] {
        &self.records
    }

    /// Binary search by virtual path; separators normalized first.
    pub fn record(&self, virtual_path: &str) -> Option<&ManifestRecord> {
        let needle = fsutil::normalize_separators(virtual_path);
        let at = self
            .records
            .binary_search_by(|r| r.relative_path.as_str().cmp(needle.as_str()))
            .ok()?;
        Some(&self.records[at])
    }

    pub fn find_file_id(&self, virtual_path: &str) -> Option<&str> {
        self.record(virtual_path).map(|r| r.file_id.as_str())
    }

    /// On-disk path for a content id. Pure function of (root, id, kind):
    /// mbdb backups store flat `root/<id>`, SQLite backups shard into
    /// `root/<id[0..2]>/<id>`.
    pub fn file_id_to_real_path(&self, file_id: &str) -> PathBuf {
        match self.kind {
            ManifestKind::Mbdb => self.root.join(file_id),
            ManifestKind::Sqlite if file_id.len() >= 2 => {
                self.root.join(&file_id[0..2]).join(file_id)
            }
            ManifestKind::Sqlite => self.root.join(file_id),
        }
    }

    pub fn find_real_path(&self, virtual_path: &str) -> Option<PathBuf> {
        self.find_file_id(virtual_path)
            .map(|id| self.file_id_to_real_path(id))
    }

    /// Declared size of a file row, decoded from its metadata blob.
    pub fn known_size(&self, virtual_path: &str) -> Option<u64> {
        let rec = self.record(virtual_path)?;
        blob_size(rec.meta.as_deref()?)
    }

    /// Backup-relative on-disk name of a content id, matching what a
    /// directory listing of the backup itself shows: flat `<id>` for mbdb,
    /// sharded `<id[0..2]>/<id>` for SQLite backups.
    pub fn content_relative_path(&self, file_id: &str) -> String {
        match self.kind {
            ManifestKind::Sqlite if file_id.len() >= 2 => {
                format!("{}/{}", &file_id[0..2], file_id)
            }
            _ => file_id.to_string(),
        }
    }

    /// Declared size keyed by the backup-relative on-disk name (the final
    /// component is the content id). Listings walk the content-addressed
    /// tree, so this is the lookup the zero-size backfill needs.
    pub fn size_by_content_path(&self, local_path: &str) -> Option<u64> {
        let id = local_path.rsplit('/').next()?;
        let rec = self.records.iter().find(|r| r.file_id == id)?;
        blob_size(rec.meta.as_deref()?)
    }

    /// Copy a virtual file out of the backup. Returns false when the path
    /// is unknown, the destination already exists and `overwrite` is off,
    /// or the copy fails. A decodable last-modified timestamp is applied
    /// to the destination.
    pub fn copy_file(&self, virtual_path: &str, dest: &Path, overwrite: bool) -> bool {
        let Some(rec) = self.record(virtual_path) else {
            return false;
        };
        if dest.exists() && !overwrite {
            return false;
        }
        let real = self.file_id_to_real_path(&rec.file_id);
        if fsutil::ensure_parent(dest).is_err() || fs::copy(&real, dest).is_err() {
            return false;
        }
        let mtime = rec
            .meta
            .as_deref()
            .and_then(blob_last_modified)
            .or(rec.modified);
        if let Some(secs) = mtime {
            let ft = filetime::FileTime::from_unix_time(secs, 0);
            filetime::set_file_mtime(dest, ft).ok();
        }
        true
    }
}

fn load_mbdb(path: &Path, opts: &LoadOptions) -> Result<Vec<ManifestRecord>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut reader = MbdbReader::new(BufReader::new(file))?;
    let mut records = Vec::new();
    let domain = opts.domain;
    while let Some(rec) =
        reader.next_matching(|d, _| domain.map_or(true, |want| d == want))? {
        let flags = rec.flags();
        let relative_path = fsutil::normalize_separators(&rec.relative_path);
        if !opts.admits(&relative_path, flags) {
            continue;
        }
        records.push(ManifestRecord {
            file_id: rec.file_id(),
            domain: rec.domain,
            relative_path,
            flags,
            meta: None,
            modified: Some(rec.mtime as i64),
        });
    }
    Ok(records)
}

fn load_sqlite(path: &Path, opts: &LoadOptions) -> Result<Vec<ManifestRecord>> {
    // Strictly a reader: read-only URI open with immutable=1 so a backup on
    // read-only media (or one being written by Finder) never sees a writer.
    let uri = format!("file:{}?immutable=1", path.display());
    let conn = Connection::open_with_flags(
        uri,
        OpenFlags::SQLITE_OPEN_READ_ONLY
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("open {}", path.display()))?;

    let sql = if opts.domain.is_some() {
        "SELECT fileID, relativePath, domain, flags, file FROM Files WHERE domain = ?1"
    } else {
        "SELECT fileID, relativePath, domain, flags, file FROM Files"
    };
    let mut stmt = conn.prepare(sql).context("query Files table")?;

    let map_row = |row: &rusqlite::Row| -> rusqlite::Result<ManifestRecord> {
        let flags = row.get::<_, i64>(3)? as u8;
        Ok(ManifestRecord {
            file_id: row.get(0)?,
            relative_path: fsutil::normalize_separators(&row.get::<_, String>(1)?),
            domain: row.get(2)?,
            flags,
            meta: if flags == FLAG_FILE {
                row.get::<_, Option<Vec<u8>>>(4)?
            } else {
                None
            },
            modified: None,
        })
    };

    let rows: Vec<ManifestRecord> = if let Some(domain) = opts.domain {
        stmt.query_map([domain], map_row)?
            .collect::<rusqlite::Result<_>>()?
    } else {
        stmt.query_map([], map_row)?
            .collect::<rusqlite::Result<_>>()?
    };

    Ok(rows
        .into_iter()
        .filter(|r| opts.admits(&r.relative_path, r.flags))
        .collect())
}

/// `Files.file` blobs are NSKeyedArchiver plists: the interesting fields
/// live as plain integers in the dictionary at `$objects[1]`.
fn archived_object(blob: &[u8]) -> Option<plist::Dictionary> {
    let value = plist::Value::from_reader(Cursor::new(blob)).ok()?;
    let objects = value.as_dictionary()?.get("$objects")?.as_array()?;
    objects.get(1)?.as_dictionary().cloned()
}

pub fn blob_last_modified(blob: &[u8]) -> Option<i64> {
    archived_object(blob)?
        .get("LastModified")?
        .as_signed_integer()
}

pub fn blob_size(blob: &[u8]) -> Option<u64> {
    archived_object(blob)?.get("Size")?.as_unsigned_integer()
}
