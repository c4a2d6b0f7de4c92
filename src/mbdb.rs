//! Decoder for the pre-iOS-10 `Manifest.mbdb` binary manifest.
//!
//! The stream is a 6-byte signature followed by back-to-back records. Each
//! record carries five length-prefixed strings (domain, path, link target,
//! data hash, an always-null field), a fixed 40-byte stat block, and a run
//! of name/value property pairs. Strings use a big-endian u16 length where
//! `0x0000` and `0xFFFF` both mean "empty". The reader is single-pass; a
//! domain filter lets callers skip irrelevant records without materializing
//! their strings.

use crate::error::FormatError;
use sha1::{Digest, Sha1};
use std::io::Read;

pub const MBDB_SIGNATURE: [u8; 6] = *b"mbdb\x05\x00";

/// Stat-block offsets.
const STAT_LEN: usize = 40;
const OFF_MODE: usize = 0;
const OFF_ATIME: usize = 18;
const OFF_MTIME: usize = 22;
const OFF_CTIME: usize = 26;
const OFF_PROP_COUNT: usize = 39;

pub const FLAG_FILE: u8 = 1;
pub const FLAG_DIR: u8 = 2;
pub const FLAG_SYMLINK: u8 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MbdbRecord {
    pub domain: String,
    pub relative_path: String,
    pub link_target: String,
    /// Uppercase hex when the raw value is not printable text.
    pub data_hash: String,
    pub mode: u16,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub properties: Vec<(String, String)>,
}

impl MbdbRecord {
    /// Manifest flags derived from the stat mode: 1 file, 2 directory,
    /// 4 symlink, 0 anything else.
    pub fn flags(&self) -> u8 {
        match self.mode & 0xF000 {
            0x8000 => FLAG_FILE,
            0x4000 => FLAG_DIR,
            0xA000 => FLAG_SYMLINK,
            _ => 0,
        }
    }

    /// Content address of this record inside the backup directory:
    /// lowercase SHA-1 of `"<domain>-<relativePath>"`.
    pub fn file_id(&self) -> String {
        let mut hasher = Sha1::new();
        hasher.update(self.domain.as_bytes());
        hasher.update(b"-");
        hasher.update(self.relative_path.as_bytes());
        let digest = hasher.finalize();
        let mut out = String::with_capacity(40);
        for b in digest {
            out.push_str(&format!("{:02x}", b));
        }
        out
    }
}

/// Streaming reader over one `Manifest.mbdb`. Not restartable; reopen the
/// file for a second pass.
pub struct MbdbReader<R: Read> {
    inner: R,
}

impl<R: Read> MbdbReader<R> {
    /// Probes the signature; anything else is a `FormatError`.
    pub fn new(mut inner: R) -> Result<Self, FormatError> {
        let mut sig = [0u8; 6];
        inner
            .read_exact(&mut sig)
            .map_err(|_| FormatError::BadSignature)?;
        if sig != MBDB_SIGNATURE {
            return Err(FormatError::BadSignature);
        }
        Ok(Self { inner })
    }

    /// Next record whose (domain, path) passes `keep`, or `None` at end of
    /// stream. Rejected records are skipped without decoding their tail.
    pub fn next_matching(
        &mut self,
        keep: impl Fn(&str, &str) -> bool,
    ) -> Result<Option<MbdbRecord>, FormatError> {
        loop {
            let domain = match self.read_string_or_eof()? {
                Some(s) => s,
                None => return Ok(None),
            };
            let relative_path = self.read_string("path")?;
            if !keep(&domain, &relative_path) {
                self.skip_tail()?;
                continue;
            }
            let link_target = self.read_string("linkTarget")?;
            let data_hash = self.read_string("dataHash")?;
            let _always_null = self.read_string("alwaysNull")?;
            let stat = self.read_stat()?;
            let prop_count = stat[OFF_PROP_COUNT] as usize;
            let mut properties = Vec::with_capacity(prop_count);
            for _ in 0..prop_count {
                let name = self.read_string("property name")?;
                let value = self.read_string("property value")?;
                properties.push((name, value));
            }
            return Ok(Some(MbdbRecord {
                domain,
                relative_path,
                link_target,
                data_hash,
                mode: u16::from_be_bytes([stat[OFF_MODE], stat[OFF_MODE + 1]]),
                atime: read_u32_at(&stat, OFF_ATIME),
                mtime: read_u32_at(&stat, OFF_MTIME),
                ctime: read_u32_at(&stat, OFF_CTIME),
                properties,
            }));
        }
    }

    /// All remaining matching records, in stream order.
    pub fn collect_matching(
        &mut self,
        keep: impl Fn(&str, &str) -> bool,
    ) -> Result<Vec<MbdbRecord>, FormatError> {
        let mut out = Vec::new();
        while let Some(rec) = self.next_matching(&keep)? {
            out.push(rec);
        }
        Ok(out)
    }

    /// Skip linkTarget, dataHash, alwaysNull, stat block and properties of
    /// the current record.
    fn skip_tail(&mut self) -> Result<(), FormatError> {
        self.skip_string("linkTarget")?;
        self.skip_string("dataHash")?;
        self.skip_string("alwaysNull")?;
        let stat = self.read_stat()?;
        for _ in 0..stat[OFF_PROP_COUNT] {
            self.skip_string("property name")?;
            self.skip_string("property value")?;
        }
        Ok(())
    }

    fn read_stat(&mut self) -> Result<[u8; STAT_LEN], FormatError> {
        let mut stat = [0u8; STAT_LEN];
        self.inner
            .read_exact(&mut stat)
            .map_err(|_| FormatError::Truncated("stat block"))?;
        Ok(stat)
    }

    /// A record boundary is the only place where EOF is legal.
    fn read_string_or_eof(&mut self) -> Result<Option<String>, FormatError> {
        let mut len_bytes = [0u8; 2];
        match read_full(&mut self.inner, &mut len_bytes)? {
            0 => return Ok(None),
            2 => {}
            _ => return Err(FormatError::Truncated("domain length")),
        }
        let len = u16::from_be_bytes(len_bytes);
        self.read_string_body(len, "domain").map(Some)
    }

    fn read_string(&mut self, what: &'static str) -> Result<String, FormatError> {
        let len = self.read_len(what)?;
        self.read_string_body(len, what)
    }

    fn read_len(&mut self, what: &'static str) -> Result<u16, FormatError> {
        let mut len_bytes = [0u8; 2];
        self.inner
            .read_exact(&mut len_bytes)
            .map_err(|_| FormatError::Truncated(what))?;
        Ok(u16::from_be_bytes(len_bytes))
    }

    fn read_string_body(&mut self, len: u16, what: &'static str) -> Result<String, FormatError> {
        if len == 0x0000 || len == 0xFFFF {
            return Ok(String::new());
        }
        let mut buf = vec![0u8; len as usize];
        self.inner
            .read_exact(&mut buf)
            .map_err(|_| FormatError::Truncated(what))?;
        Ok(stringify(&buf))
    }

    fn skip_string(&mut self, what: &'static str) -> Result<(), FormatError> {
        let len = self.read_len(what)?;
        if len == 0x0000 || len == 0xFFFF {
            return Ok(());
        }
        let copied = std::io::copy(
            &mut self.inner.by_ref().take(len as u64),
            &mut std::io::sink(),
        )?;
        if copied != len as u64 {
            return Err(FormatError::Truncated(what));
        }
        Ok(())
    }
}

/// Read as many bytes as available into `buf`; short only at EOF.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<usize, FormatError> {
    let mut total = 0;
    while total < buf.len() {
        let n = r.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

fn read_u32_at(stat: &[u8; STAT_LEN], off: usize) -> u32 {
    u32::from_be_bytes([stat[off], stat[off + 1], stat[off + 2], stat[off + 3]])
}

/// Printable UTF-8 comes through untouched; anything else (hashes, binary
/// property values) becomes an uppercase hex dump, matching what the
/// historical tools print.
pub fn stringify(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) if !s.chars().any(|c| c.is_control()) => s.to_string(),
        _ => {
            let mut out = String::with_capacity(bytes.len() * 2);
            for b in bytes {
                out.push_str(&format!("{:02X}", b));
            }
            out
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::{push_record, synthetic_mbdb};
    use super::*;
    use std::io::Cursor;

    #[test]
    fn rejects_bad_signature() {
        let err = MbdbReader::new(Cursor::new(b"mbdx\x05\x00".to_vec())).err();
        assert!(matches!(err, Some(FormatError::BadSignature)));
    }

    #[test]
    fn decodes_records_in_order() {
        let buf = synthetic_mbdb(&[
            ("AppDomain-com.tencent.xin", "Documents/x.txt", 0o100644, 7),
            ("HomeDomain", "Library/a", 0o040755, 9),
        ]);
        let mut reader = MbdbReader::new(Cursor::new(buf)).unwrap();
        let recs = reader.collect_matching(|_, _| true).unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].relative_path, "Documents/x.txt");
        assert_eq!(recs[0].flags(), FLAG_FILE);
        assert_eq!(recs[0].mtime, 7);
        assert_eq!(recs[1].flags(), FLAG_DIR);
    }

    #[test]
    fn skip_mode_crosses_filtered_records() {
        let buf = synthetic_mbdb(&[
            ("CameraRollDomain", "Media/p.jpg", 0o100644, 1),
            ("AppDomain-com.tencent.xin", "Documents/x.txt", 0o100644, 2),
        ]);
        let mut reader = MbdbReader::new(Cursor::new(buf)).unwrap();
        let recs = reader
            .collect_matching(|d, _| d == "AppDomain-com.tencent.xin")
            .unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].relative_path, "Documents/x.txt");
    }

    #[test]
    fn empty_sentinels_and_hex_values() {
        let mut buf = MBDB_SIGNATURE.to_vec();
        push_record(
            &mut buf,
            "HomeDomain",
            "Library/f",
            0o100644,
            0,
            &[(b"checksum".as_slice(), b"\x01\xAB".as_slice())],
        );
        let mut reader = MbdbReader::new(Cursor::new(buf)).unwrap();
        let rec = reader.next_matching(|_, _| true).unwrap().unwrap();
        assert_eq!(rec.link_target, "");
        assert_eq!(rec.properties, vec![("checksum".into(), "01AB".into())]);
    }

    #[test]
    fn truncated_record_is_an_error() {
        let mut buf = synthetic_mbdb(&[("HomeDomain", "Library/f", 0o100644, 0)]);
        buf.truncate(buf.len() - 10);
        let mut reader = MbdbReader::new(Cursor::new(buf)).unwrap();
        assert!(reader.next_matching(|_, _| true).is_err());
    }

    #[test]
    fn file_id_is_sha1_of_domain_dash_path() {
        let rec = MbdbRecord {
            domain: "AppDomain-com.tencent.xin".into(),
            relative_path: "Documents/x.txt".into(),
            link_target: String::new(),
            data_hash: String::new(),
            mode: 0o100644,
            atime: 0,
            mtime: 0,
            ctime: 0,
            properties: vec![],
        };
        let mut h = Sha1::new();
        h.update(b"AppDomain-com.tencent.xin-Documents/x.txt");
        let expect: String = h.finalize().iter().map(|b| format!("{:02x}", b)).collect();
        assert_eq!(rec.file_id(), expect);
        assert_eq!(rec.file_id().len(), 40);
    }
}
