//! Publication variants and the analysis facade.
//!
//! `analyze` is the main entry point: it opens the container, resolves the
//! package document, walks the spine, and folds everything into one
//! [`Analysis`]. The [`Publication`] trait is the shared read surface over
//! the archive-backed, PDF-in-container, and URL-backed variants.

use std::io::{Cursor, Write};

use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::archive::{join_and_normalize, FetchMode, PackageArchive};
use crate::cover;
use crate::encryption::{ProtectionCatalog, ENCRYPTION_FILE};
use crate::error::{AnalyzeError, ArchiveError, DecipherError};
use crate::lcp::{LcpDecipher, License, UserKey, LICENSE_FILE};
use crate::package::{self, spine_cfi, ContentCounts, Metadata, SpineItem};
use crate::pagination::{self, Pagination};
use crate::spine::analyze_spine;
use crate::toc::Toc;

/// Container manifest used by PDF-in-LCP and web publications.
pub const MANIFEST_FILE: &str = "manifest.json";

/// The shared read surface over every publication variant.
pub trait Publication {
    fn metadata(&self) -> &Metadata;
    fn spine(&self) -> &[SpineItem];
    fn toc(&self) -> &Toc;
    fn license(&self) -> Option<&License>;
    fn pagination(&self) -> Option<&Pagination>;
    fn is_fixed_layout(&self) -> bool;
}

/// The reconciled output of one analysis run.
#[derive(Debug, Default)]
pub struct Analysis {
    pub metadata: Metadata,
    pub spine: Vec<SpineItem>,
    pub toc: Toc,
    pub license: Option<License>,
    pub pagination: Option<Pagination>,
    pub fixed_layout: bool,
}

impl Publication for Analysis {
    fn metadata(&self) -> &Metadata {
        &self.metadata
    }
    fn spine(&self) -> &[SpineItem] {
        &self.spine
    }
    fn toc(&self) -> &Toc {
        &self.toc
    }
    fn license(&self) -> Option<&License> {
        self.license.as_ref()
    }
    fn pagination(&self) -> Option<&Pagination> {
        self.pagination.as_ref()
    }
    fn is_fixed_layout(&self) -> bool {
        self.fixed_layout
    }
}

/// An EPUB opened from archive bytes.
pub struct ArchivePublication {
    analysis: Analysis,
}

impl ArchivePublication {
    pub fn open(
        source: &[u8],
        license: Option<License>,
        user_keys: &[UserKey],
    ) -> Result<Self, AnalyzeError> {
        Ok(Self {
            analysis: analyze(source, license, user_keys)?,
        })
    }

    pub fn into_analysis(self) -> Analysis {
        self.analysis
    }
}

impl Publication for ArchivePublication {
    fn metadata(&self) -> &Metadata {
        self.analysis.metadata()
    }
    fn spine(&self) -> &[SpineItem] {
        self.analysis.spine()
    }
    fn toc(&self) -> &Toc {
        self.analysis.toc()
    }
    fn license(&self) -> Option<&License> {
        self.analysis.license()
    }
    fn pagination(&self) -> Option<&Pagination> {
        self.analysis.pagination()
    }
    fn is_fixed_layout(&self) -> bool {
        self.analysis.is_fixed_layout()
    }
}

/// A PDF wrapped in an LCP container (`.lcpdf`): a `manifest.json`, the PDF
/// payload, and the usual `META-INF` entries. There is no package document
/// and no content analysis; the model is a single synthetic spine item.
pub struct PdfPublication {
    analysis: Analysis,
}

impl PdfPublication {
    pub fn open(source: &[u8], license: Option<License>) -> Result<Self, AnalyzeError> {
        let mut archive = PackageArchive::open(source)?;
        let license = license.or_else(|| load_license(&mut archive));
        Ok(Self {
            analysis: analyze_pdf_container(&mut archive, license)?,
        })
    }

    pub fn into_analysis(self) -> Analysis {
        self.analysis
    }
}

impl Publication for PdfPublication {
    fn metadata(&self) -> &Metadata {
        self.analysis.metadata()
    }
    fn spine(&self) -> &[SpineItem] {
        self.analysis.spine()
    }
    fn toc(&self) -> &Toc {
        self.analysis.toc()
    }
    fn license(&self) -> Option<&License> {
        self.analysis.license()
    }
    fn pagination(&self) -> Option<&Pagination> {
        self.analysis.pagination()
    }
    fn is_fixed_layout(&self) -> bool {
        self.analysis.is_fixed_layout()
    }
}

/// Analyze a publication from container bytes (raw ZIP or base64-wrapped).
///
/// A license passed in wins over the in-package `META-INF/license.lcpl`.
/// `user_keys` are candidate keys; the last one validating against the
/// license is used for deciphering.
pub fn analyze(
    source: &[u8],
    license: Option<License>,
    user_keys: &[UserKey],
) -> Result<Analysis, AnalyzeError> {
    let mut archive = PackageArchive::open(source)?;
    let license = license.or_else(|| load_license(&mut archive));

    if is_pdf_container(&mut archive) {
        return analyze_pdf_container(&mut archive, license);
    }

    let catalog = ProtectionCatalog::build(&mut archive)?;
    for (path, descriptor) in catalog.iter() {
        if descriptor.is_unsupported_scheme() {
            tracing::warn!(
                "Resource '{path}' uses an unsupported protection scheme ({})",
                descriptor.retrieval_type
            );
        }
    }

    let mut document = package::resolve(&mut archive)?;

    for item in document.spine.iter_mut() {
        item.protection = catalog.get(&item.absolute_path).cloned();
    }

    let mut toc = load_toc(&mut archive, &document);
    let fixed_layout = document.is_fixed_layout();

    let user_key = match (&license, user_keys) {
        (Some(license), keys) if !keys.is_empty() => LcpDecipher::find_valid_key(license, keys),
        _ => None,
    };

    let mut decipher = LcpDecipher::new();
    let pagination = if fixed_layout {
        tracing::debug!("Fixed-layout publication; skipping content analysis");
        None
    } else {
        analyze_spine(
            &mut archive,
            &mut decipher,
            license.as_ref(),
            user_key.as_ref(),
            &mut document.spine,
            &mut toc,
        );
        pagination::compute_toc_sizes(&mut toc);
        pagination::generate_pagination(&toc, &document.spine)
    };

    Ok(Analysis {
        metadata: document.metadata,
        spine: document.spine,
        toc,
        license,
        pagination,
        fixed_layout,
    })
}

/// Locate the cover image and return its bytes, deciphering when protected.
pub fn get_cover_image(
    source: &[u8],
    license: Option<License>,
    user_keys: &[UserKey],
) -> Result<Vec<u8>, AnalyzeError> {
    let mut archive = PackageArchive::open(source)?;
    let license = license.or_else(|| load_license(&mut archive));
    let catalog = ProtectionCatalog::build(&mut archive)?;
    let document = package::resolve(&mut archive)?;

    let path = cover::resolve_cover(&mut archive, &document)?;
    let bytes = archive.read_bytes(&path)?;

    let Some(protection) = catalog.get(&path) else {
        return Ok(bytes);
    };

    let license = license.ok_or(DecipherError::NoValidKey)?;
    let user_key =
        LcpDecipher::find_valid_key(&license, user_keys).ok_or(DecipherError::NoValidKey)?;
    let mut decipher = LcpDecipher::new();
    let data = decipher.decipher(FetchMode::Bytes, &bytes, protection, &license, &user_key)?;
    Ok(data.into_bytes())
}

/// Rewrite the whole container with every protected entry decrypted.
///
/// The output keeps `mimetype` stored first and uncompressed, drops the
/// encryption manifest and the license (the result is no longer protected),
/// and drops individual entries whose decryption fails. Only a license with
/// no validating user key is fatal.
pub fn decipher_whole_archive(
    source: &[u8],
    license: Option<License>,
    user_keys: &[UserKey],
) -> Result<Vec<u8>, AnalyzeError> {
    let mut archive = PackageArchive::open(source)?;
    let license = license.or_else(|| load_license(&mut archive));
    let catalog = ProtectionCatalog::build(&mut archive)?;

    let user_key = match &license {
        Some(license) => LcpDecipher::find_valid_key(license, user_keys),
        None => None,
    };
    if !catalog.is_empty() && (license.is_none() || user_key.is_none()) {
        return Err(DecipherError::NoValidKey.into());
    }

    let mut decipher = LcpDecipher::new();
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let stored: FileOptions<'_, ()> =
        FileOptions::default().compression_method(CompressionMethod::Stored);
    let deflated: FileOptions<'_, ()> = FileOptions::default();

    // The mimetype entry must come first, stored, so the MIME marker stays
    // readable in the leading bytes.
    if archive.has_entry("mimetype") {
        let bytes = archive.read_bytes("mimetype")?;
        writer
            .start_file("mimetype", stored)
            .map_err(zip_write_error)?;
        writer.write_all(&bytes)?;
    }

    for name in archive.entry_names() {
        if name == "mimetype" || name == ENCRYPTION_FILE || name == LICENSE_FILE {
            continue;
        }
        if name.ends_with('/') {
            continue;
        }

        let bytes = match archive.read_bytes(&name) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Dropping unreadable entry '{name}': {e}");
                continue;
            }
        };

        let output = match catalog.get(&format!("/{name}")) {
            Some(protection) => {
                // Checked above: a non-empty catalog implies both are set.
                let (Some(license), Some(user_key)) = (&license, &user_key) else {
                    continue;
                };
                match decipher.decipher(FetchMode::Bytes, &bytes, protection, license, user_key)
                {
                    Ok(data) => data.into_bytes(),
                    Err(e) => {
                        tracing::warn!("Dropping entry '{name}': decipher failed: {e}");
                        continue;
                    }
                }
            }
            None => bytes,
        };

        writer.start_file(&*name, deflated).map_err(zip_write_error)?;
        writer.write_all(&output)?;
    }

    let cursor = writer.finish().map_err(zip_write_error)?;
    Ok(cursor.into_inner())
}

fn zip_write_error(e: zip::result::ZipError) -> AnalyzeError {
    AnalyzeError::Archive(ArchiveError::InvalidArchive(e.to_string()))
}

/// Read and parse the in-package license, if any. Malformed licenses degrade
/// to "no license" with a warning.
fn load_license(archive: &mut PackageArchive) -> Option<License> {
    if !archive.has_entry(LICENSE_FILE) {
        return None;
    }
    let json = match archive.read_entry(LICENSE_FILE, FetchMode::Text) {
        Ok(data) => data.into_text(),
        Err(e) => {
            tracing::warn!("License document unreadable: {e}");
            return None;
        }
    };
    match License::parse(&json) {
        Ok(license) => Some(license),
        Err(e) => {
            tracing::warn!("License document did not parse: {e}");
            None
        }
    }
}

/// PDF-in-LCP containers carry a top-level `manifest.json` and no OPF
/// container descriptor.
fn is_pdf_container(archive: &mut PackageArchive) -> bool {
    archive.has_entry(MANIFEST_FILE) && !archive.has_entry(package::CONTAINER_FILE)
}

fn analyze_pdf_container(
    archive: &mut PackageArchive,
    license: Option<License>,
) -> Result<Analysis, AnalyzeError> {
    let manifest = archive.read_text(MANIFEST_FILE)?;
    let manifest: serde_json::Value = serde_json::from_str(&manifest).map_err(|e| {
        AnalyzeError::Archive(ArchiveError::InvalidArchive(format!(
            "container manifest did not parse: {e}"
        )))
    })?;

    let catalog = ProtectionCatalog::build(archive)?;
    let metadata = manifest_metadata(&manifest);

    let href = manifest["readingOrder"][0]["href"]
        .as_str()
        .unwrap_or("publication.pdf")
        .to_string();
    let absolute_path = format!("/{}", join_and_normalize("", &href));
    let media_type = manifest["readingOrder"][0]["type"]
        .as_str()
        .unwrap_or("application/pdf")
        .to_string();

    let spine = vec![SpineItem {
        idref: "pdf".to_string(),
        href,
        protection: catalog.get(&absolute_path).cloned(),
        absolute_path,
        media_type,
        spread: None,
        cfi: spine_cfi(0, "pdf"),
        counts: ContentCounts::ZERO,
    }];

    Ok(Analysis {
        metadata,
        spine,
        toc: Toc::default(),
        license,
        pagination: None,
        // PDF pages are pre-paginated by nature.
        fixed_layout: true,
    })
}

/// Fold the web-publication manifest's metadata object into the flat
/// Dublin-Core-keyed map the EPUB path produces.
pub(crate) fn manifest_metadata(manifest: &serde_json::Value) -> Metadata {
    let mut metadata = Metadata::new();
    let Some(object) = manifest.get("metadata").and_then(|m| m.as_object()) else {
        return metadata;
    };

    let mut put = |key: &str, value: Option<&serde_json::Value>| {
        if let Some(text) = value.and_then(json_text) {
            metadata.insert(key.to_string(), text);
        }
    };
    put("dc:title", object.get("title"));
    put("dc:identifier", object.get("identifier"));
    put("dc:creator", object.get("author"));
    put("dc:language", object.get("language"));
    put("dc:publisher", object.get("publisher"));
    put("dc:date", object.get("published"));
    metadata
}

/// Manifest values come as strings, localized-string objects, or arrays of
/// either; take the first textual representation.
fn json_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Array(items) => items.first().and_then(json_text),
        serde_json::Value::Object(map) => map
            .get("name")
            .or_else(|| map.values().next())
            .and_then(json_text),
        _ => None,
    }
}

/// Resolve the TOC document (EPUB3 NAV first, then the EPUB2 NCX pointed at
/// by the spine) and parse it. Everything here is best-effort: a missing or
/// broken navigation document yields an empty TOC.
fn load_toc(archive: &mut PackageArchive, document: &package::PackageDocument) -> Toc {
    let toc_href = document.nav_href.clone().or_else(|| {
        document
            .toc_id
            .as_ref()
            .and_then(|id| document.manifest.get(id))
            .map(|item| item.href.clone())
    });
    let Some(href) = toc_href else {
        tracing::debug!("Package has no navigation document");
        return Toc::default();
    };

    let path = join_and_normalize(&document.base_path, &href);
    let base_path = path
        .rfind('/')
        .map(|i| path[..i + 1].to_string())
        .unwrap_or_default();

    match archive.read_text(&path) {
        Ok(text) => Toc::parse(&base_path, &text),
        Err(e) => {
            tracing::warn!("Navigation document '{path}' unreadable: {e}");
            Toc::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_manifest_metadata_shapes() {
        let manifest = serde_json::json!({
            "metadata": {
                "title": "Sample PDF",
                "identifier": "urn:uuid:pdf-1",
                "author": [{"name": "A. Author"}, {"name": "B. Author"}],
                "language": ["fr", "en"]
            }
        });
        let metadata = manifest_metadata(&manifest);
        assert_eq!(metadata.get("dc:title").unwrap(), "Sample PDF");
        assert_eq!(metadata.get("dc:creator").unwrap(), "A. Author");
        assert_eq!(metadata.get("dc:language").unwrap(), "fr");
        assert!(!metadata.contains_key("dc:publisher"));
    }

    #[test]
    fn test_manifest_metadata_missing_block() {
        assert!(manifest_metadata(&serde_json::json!({})).is_empty());
    }
}
