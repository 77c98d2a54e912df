//! Read-only view over an opened publication container (ZIP).
//!
//! Entry paths are normalized before lookup: leading slashes are stripped and
//! `.`/`..` segments are resolved, so callers may use the absolute
//! (leading-slash) path convention shared with the protection catalog.

use std::io::{Cursor, Read};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use zip::ZipArchive;

use crate::error::{AnalyzeError, ArchiveError};
use crate::security::{self, SecurityLimits};

/// Whether an entry should be surfaced as raw bytes or decoded text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Bytes,
    Text,
}

/// Entry payload in the shape the caller asked for.
#[derive(Debug, Clone)]
pub enum EntryData {
    Bytes(Vec<u8>),
    Text(String),
}

impl EntryData {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            EntryData::Bytes(b) => b,
            EntryData::Text(t) => t.into_bytes(),
        }
    }

    pub fn into_text(self) -> String {
        match self {
            EntryData::Bytes(b) => String::from_utf8_lossy(&b).into_owned(),
            EntryData::Text(t) => t,
        }
    }
}

/// An opened publication archive. Owned by one publication instance for the
/// duration of an analysis session; the underlying buffer never changes.
#[derive(Debug)]
pub struct PackageArchive {
    zip: ZipArchive<Cursor<Vec<u8>>>,
    limits: SecurityLimits,
}

impl PackageArchive {
    /// Open an archive from raw ZIP bytes, or from a base64-encoded archive
    /// (detected by sniffing the leading characters).
    pub fn open(input: &[u8]) -> Result<Self, AnalyzeError> {
        Self::open_with_limits(input, SecurityLimits::default())
    }

    pub fn open_with_limits(
        input: &[u8],
        limits: SecurityLimits,
    ) -> Result<Self, AnalyzeError> {
        let bytes = if looks_like_base64(input) {
            let compact: Vec<u8> = input
                .iter()
                .copied()
                .filter(|b| !b.is_ascii_whitespace())
                .collect();
            BASE64.decode(&compact).map_err(|e| {
                ArchiveError::InvalidArchive(format!("base64 input did not decode: {e}"))
            })?
        } else {
            input.to_vec()
        };

        if !bytes.starts_with(b"PK\x03\x04") {
            return Err(
                ArchiveError::InvalidArchive("missing ZIP signature".to_string()).into(),
            );
        }

        let zip = ZipArchive::new(Cursor::new(bytes))
            .map_err(|e| ArchiveError::InvalidArchive(e.to_string()))?;

        security::check_file_count(zip.len() as u64, &limits)?;

        Ok(Self { zip, limits })
    }

    /// Names of all entries, in archive order.
    pub fn entry_names(&self) -> Vec<String> {
        self.zip.file_names().map(String::from).collect()
    }

    pub fn has_entry(&mut self, path: &str) -> bool {
        let name = normalize_entry_path(path);
        self.zip.by_name(&name).is_ok()
    }

    /// Read an entry as raw bytes. The path is normalized before lookup.
    pub fn read_bytes(&mut self, path: &str) -> Result<Vec<u8>, AnalyzeError> {
        let name = normalize_entry_path(path);
        let mut file = self
            .zip
            .by_name(&name)
            .map_err(|_| ArchiveError::FileNotFound(name.clone()))?;

        security::check_resource_size(&name, file.size(), &self.limits)?;

        let mut buf = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut buf).map_err(|e| ArchiveError::Read {
            path: name,
            detail: e.to_string(),
        })?;
        Ok(buf)
    }

    /// Read an entry as UTF-8 text. Invalid sequences are replaced rather
    /// than rejected; real-world packages carry the occasional stray byte.
    pub fn read_text(&mut self, path: &str) -> Result<String, AnalyzeError> {
        let bytes = self.read_bytes(path)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn read_entry(&mut self, path: &str, mode: FetchMode) -> Result<EntryData, AnalyzeError> {
        match mode {
            FetchMode::Bytes => Ok(EntryData::Bytes(self.read_bytes(path)?)),
            FetchMode::Text => Ok(EntryData::Text(self.read_text(path)?)),
        }
    }
}

/// Resolve `.`/`..` segments and strip any leading slash so the result can be
/// looked up directly in the ZIP central directory.
pub fn normalize_entry_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    segments.join("/")
}

/// Join a relative href onto a base directory, then normalize.
pub fn join_and_normalize(base_dir: &str, href: &str) -> String {
    if href.starts_with('/') {
        normalize_entry_path(href)
    } else {
        normalize_entry_path(&format!("{base_dir}{href}"))
    }
}

const BASE64_SNIFF_LEN: usize = 64;

/// Sniff the leading characters for the base64 alphabet. A raw ZIP starts
/// with `PK`, which is also base64-legal, so the signature check wins first.
fn looks_like_base64(input: &[u8]) -> bool {
    if input.starts_with(b"PK\x03\x04") || input.is_empty() {
        return false;
    }
    let head = &input[..input.len().min(BASE64_SNIFF_LEN)];
    head.iter().all(|b| {
        b.is_ascii_alphanumeric()
            || matches!(b, b'+' | b'/' | b'=')
            || b.is_ascii_whitespace()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn tiny_zip() -> Vec<u8> {
        let cursor = Cursor::new(Vec::new());
        let mut zip = zip::ZipWriter::new(cursor);
        let opts: zip::write::FileOptions<'_, ()> = zip::write::FileOptions::default();
        zip.start_file("mimetype", opts).unwrap();
        zip.write_all(b"application/epub+zip").unwrap();
        zip.start_file("OEBPS/content.opf", opts).unwrap();
        zip.write_all(b"<package/>").unwrap();
        zip.finish().unwrap().into_inner()
    }

    #[test]
    fn test_open_rejects_non_zip() {
        let err = PackageArchive::open(b"definitely not a zip file ------").unwrap_err();
        assert!(matches!(
            err,
            AnalyzeError::Archive(ArchiveError::InvalidArchive(_))
        ));
    }

    #[test]
    fn test_open_raw_and_base64() {
        let raw = tiny_zip();
        let mut archive = PackageArchive::open(&raw).unwrap();
        assert_eq!(archive.read_text("mimetype").unwrap(), "application/epub+zip");

        let encoded = BASE64.encode(&raw);
        let mut archive = PackageArchive::open(encoded.as_bytes()).unwrap();
        assert_eq!(archive.read_text("mimetype").unwrap(), "application/epub+zip");
    }

    #[test]
    fn test_read_missing_entry() {
        let mut archive = PackageArchive::open(&tiny_zip()).unwrap();
        let err = archive.read_bytes("OEBPS/missing.xhtml").unwrap_err();
        assert!(matches!(
            err,
            AnalyzeError::Archive(ArchiveError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_path_normalization_on_lookup() {
        let mut archive = PackageArchive::open(&tiny_zip()).unwrap();
        assert!(archive.read_bytes("/OEBPS/content.opf").is_ok());
        assert!(archive.read_bytes("OEBPS/./sub/../content.opf").is_ok());
    }

    #[test]
    fn test_normalize_entry_path() {
        assert_eq!(normalize_entry_path("/OEBPS/ch1.xhtml"), "OEBPS/ch1.xhtml");
        assert_eq!(normalize_entry_path("a/./b/../c.x"), "a/c.x");
        assert_eq!(normalize_entry_path("../../etc/passwd"), "etc/passwd");
    }

    #[test]
    fn test_join_and_normalize() {
        assert_eq!(join_and_normalize("OEBPS/", "ch1.xhtml"), "OEBPS/ch1.xhtml");
        assert_eq!(
            join_and_normalize("OEBPS/text/", "../images/cover.jpg"),
            "OEBPS/images/cover.jpg"
        );
        assert_eq!(join_and_normalize("OEBPS/", "/root.xhtml"), "root.xhtml");
    }
}
