//! Package-document resolution: container descriptor → OPF → unified model.
//!
//! Reconciles `META-INF/container.xml` and the package document into manifest
//! items, reading-order (spine) entries, and a flat metadata map. Spine order
//! is canonical: it is the reading order and the basis for CFI step values.

use std::collections::{BTreeMap, HashMap, HashSet};

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader as XmlReader;
use serde::Serialize;

use crate::archive::{join_and_normalize, PackageArchive};
use crate::encryption::ProtectionDescriptor;
use crate::error::{AnalyzeError, PackageError};

pub const CONTAINER_FILE: &str = "META-INF/container.xml";

/// Reading-equivalent weight of one image or video, in characters. Part of
/// the public pagination contract; readers depend on the exact value.
pub const MEDIA_WEIGHT: u64 = 300;

/// Per-document content counts. `ZERO` is the sentinel for "analysis failed
/// or not applicable" — items are degraded to it, never dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ContentCounts {
    pub characters: u64,
    pub images: u64,
    pub videos: u64,
    pub total: u64,
}

impl ContentCounts {
    pub const ZERO: Self = Self {
        characters: 0,
        images: 0,
        videos: 0,
        total: 0,
    };

    pub fn from_parts(characters: u64, images: u64, videos: u64) -> Self {
        Self {
            characters,
            images,
            videos,
            total: characters + MEDIA_WEIGHT * images + MEDIA_WEIGHT * videos,
        }
    }
}

/// One `<manifest><item>` entry.
#[derive(Debug, Clone, Serialize)]
pub struct ManifestItem {
    pub id: String,
    pub href: String,
    pub media_type: String,
    pub properties: HashSet<String>,
}

/// One reading-order entry, in package-document spine order.
#[derive(Debug, Clone, Serialize)]
pub struct SpineItem {
    pub idref: String,
    /// Manifest href, relative to the package document.
    pub href: String,
    /// Normalized absolute path with a leading slash; matches the protection
    /// catalog's path convention.
    pub absolute_path: String,
    pub media_type: String,
    /// Spread/layout hint from the itemref `properties` attribute.
    pub spread: Option<String>,
    #[serde(skip)]
    pub protection: Option<ProtectionDescriptor>,
    /// Best-effort CFI for the spine step: `/6/{2 + 2×index}[{idref}]`.
    pub cfi: String,
    pub counts: ContentCounts,
}

/// One `<guide><reference>` entry (EPUB2; still common in the wild).
#[derive(Debug, Clone, Serialize)]
pub struct GuideReference {
    pub ref_type: String,
    pub title: Option<String>,
    pub href: String,
}

/// Flat metadata map. Dublin-Core keys keep their prefixed tag name
/// (`dc:title`); `<meta>` entries are keyed by `property` (EPUB3) or `name`
/// (EPUB2).
pub type Metadata = BTreeMap<String, String>;

/// The reconciled package document.
#[derive(Debug, Default)]
pub struct PackageDocument {
    /// Directory of the package document, `""` or ending in `/`.
    pub base_path: String,
    pub manifest: HashMap<String, ManifestItem>,
    pub spine: Vec<SpineItem>,
    pub metadata: Metadata,
    pub guide: Vec<GuideReference>,
    /// `<meta name="cover">` content: a manifest item id.
    pub cover_meta_id: Option<String>,
    /// NCX manifest id from `<spine toc="...">` (EPUB2).
    pub toc_id: Option<String>,
    /// NAV document href from `properties="nav"` (EPUB3).
    pub nav_href: Option<String>,
}

impl PackageDocument {
    /// The publication's unique identifier, after the dedup fold.
    pub fn uid(&self) -> Option<&str> {
        self.metadata.get("dc:identifier").map(String::as_str)
    }

    /// Fixed-layout publications are pre-paginated: content analysis and
    /// pagination are disabled for them.
    pub fn is_fixed_layout(&self) -> bool {
        matches!(
            self.metadata.get("rendition:layout").map(String::as_str),
            Some("pre-paginated") | Some("fixed")
        ) || self.metadata.get("fixed-layout").map(String::as_str) == Some("true")
    }
}

/// Locate and parse the package document. Container or package-document
/// failures are fatal: there is no publication without them.
pub fn resolve(archive: &mut PackageArchive) -> Result<PackageDocument, AnalyzeError> {
    let container = archive.read_text(CONTAINER_FILE).map_err(|e| match e {
        AnalyzeError::Archive(inner) => AnalyzeError::Package(PackageError::Archive(inner)),
        other => other,
    })?;
    let opf_path = parse_container(&container)?;

    let base_path = opf_path
        .rfind('/')
        .map(|i| opf_path[..i + 1].to_string())
        .unwrap_or_default();

    let opf = archive.read_text(&opf_path).map_err(|e| match e {
        AnalyzeError::Archive(inner) => AnalyzeError::Package(PackageError::Archive(inner)),
        other => other,
    })?;

    let document = parse_package_document(&opf, base_path)?;
    Ok(document)
}

/// Extract the package-document path from the container descriptor.
pub fn parse_container(xml: &str) -> Result<String, PackageError> {
    let mut reader = XmlReader::from_str(xml);
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Empty(ref e)) | Ok(Event::Start(ref e))
                if e.local_name().as_ref() == b"rootfile" =>
            {
                if let Some(path) = attr_value(e, b"full-path") {
                    return Ok(path);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(PackageError::MalformedContainer(format!(
                    "container descriptor did not parse: {e}"
                )));
            }
            _ => {}
        }
        buf.clear();
    }

    Err(PackageError::MalformedContainer(
        "no rootfile element with a full-path attribute".to_string(),
    ))
}

/// Parse the OPF package document into the unified model.
pub fn parse_package_document(
    xml: &str,
    base_path: String,
) -> Result<PackageDocument, PackageError> {
    let mut reader = XmlReader::from_str(xml);
    let mut buf = Vec::new();

    let mut document = PackageDocument {
        base_path,
        ..Default::default()
    };

    let mut unique_identifier: Option<String> = None;
    let mut uid_identifier_locked = false;
    let mut spine_idrefs: Vec<(String, Option<String>)> = Vec::new();

    let mut in_metadata = false;
    let mut in_guide = false;
    // Pending text-bearing metadata element: (map key, id attribute, is dc:identifier)
    let mut current: Option<(String, Option<String>, bool)> = None;
    let mut current_text = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                match e.local_name().as_ref() {
                    b"package" => {
                        unique_identifier = attr_value(e, b"unique-identifier");
                    }
                    b"metadata" => in_metadata = true,
                    b"guide" => in_guide = true,
                    b"meta" if in_metadata => {
                        let property = attr_value(e, b"property");
                        let name = attr_value(e, b"name");
                        let content = attr_value(e, b"content");

                        if let Some(property) = property {
                            // EPUB3 form: value is the element text.
                            current = Some((property, None, false));
                            current_text.clear();
                        } else if let (Some(name), Some(content)) = (name, content) {
                            // EPUB2 form: value in the content attribute.
                            if name == "cover" {
                                document.cover_meta_id = Some(content.clone());
                            }
                            document.metadata.insert(name, content);
                        }
                    }
                    _ if in_metadata => {
                        let key = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                        let is_identifier = e.local_name().as_ref() == b"identifier";
                        let id_attr = attr_value(e, b"id");
                        current = Some((key, id_attr, is_identifier));
                        current_text.clear();
                    }
                    b"item" => {
                        let id = attr_value(e, b"id").unwrap_or_default();
                        let href = attr_value(e, b"href").unwrap_or_default();
                        let media_type = attr_value(e, b"media-type").unwrap_or_default();
                        let properties: HashSet<String> = attr_value(e, b"properties")
                            .map(|p| p.split_whitespace().map(String::from).collect())
                            .unwrap_or_default();

                        if properties.contains("nav") {
                            document.nav_href = Some(href.clone());
                        }

                        document.manifest.insert(
                            id.clone(),
                            ManifestItem {
                                id,
                                href,
                                media_type,
                                properties,
                            },
                        );
                    }
                    b"spine" => {
                        document.toc_id = attr_value(e, b"toc");
                    }
                    b"itemref" => {
                        if let Some(idref) = attr_value(e, b"idref") {
                            spine_idrefs.push((idref, attr_value(e, b"properties")));
                        }
                    }
                    b"reference" if in_guide => {
                        if let (Some(ref_type), Some(href)) =
                            (attr_value(e, b"type"), attr_value(e, b"href"))
                        {
                            document.guide.push(GuideReference {
                                ref_type,
                                title: attr_value(e, b"title"),
                                href,
                            });
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(ref e)) => {
                if current.is_some() {
                    current_text.push_str(&e.unescape().unwrap_or_default());
                }
            }
            Ok(Event::End(ref e)) => {
                match e.local_name().as_ref() {
                    b"metadata" => in_metadata = false,
                    b"guide" => in_guide = false,
                    _ => {}
                }

                if let Some((key, id_attr, is_identifier)) = current.take() {
                    let text = current_text.trim().to_string();
                    if !text.is_empty() {
                        if is_identifier {
                            // On duplicate dc:identifier, only the entry whose
                            // id matches the package unique-identifier wins.
                            let matches_uid = id_attr.as_deref() == unique_identifier.as_deref()
                                && unique_identifier.is_some();
                            if matches_uid {
                                document.metadata.insert(key, text);
                                uid_identifier_locked = true;
                            } else if !uid_identifier_locked
                                && !document.metadata.contains_key(&key)
                            {
                                document.metadata.insert(key, text);
                            }
                        } else {
                            document.metadata.insert(key, text);
                        }
                    }
                    current_text.clear();
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(PackageError::MalformedPackage(format!(
                    "package document did not parse: {e}"
                )));
            }
            _ => {}
        }
        buf.clear();
    }

    // Resolve the spine against the manifest. Dangling idrefs are skipped:
    // malformed packages exist in the wild and must degrade, not abort.
    for (idref, properties) in spine_idrefs {
        let Some(item) = document.manifest.get(&idref) else {
            tracing::warn!("Spine itemref '{idref}' has no manifest item, skipping");
            continue;
        };
        let index = document.spine.len();
        document.spine.push(SpineItem {
            idref: idref.clone(),
            href: item.href.clone(),
            absolute_path: format!(
                "/{}",
                join_and_normalize(&document.base_path, &item.href)
            ),
            media_type: item.media_type.clone(),
            spread: properties,
            protection: None,
            cfi: spine_cfi(index, &idref),
            counts: ContentCounts::ZERO,
        });
    }

    Ok(document)
}

/// CFI step for an ordered child: even steps address elements, so spine item
/// `i` sits at step `2 + 2×i` under the spine node.
pub fn spine_cfi(index: usize, idref: &str) -> String {
    format!("/6/{}[{}]", 2 + 2 * index, idref)
}

fn attr_value(e: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name)
        .map(|a| String::from_utf8_lossy(&a.value).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const OPF: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0" unique-identifier="uid">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:title>The Test Book</dc:title>
    <dc:creator>A. Author</dc:creator>
    <dc:identifier id="uid">urn:isbn:123</dc:identifier>
    <dc:identifier id="other">other-id</dc:identifier>
    <dc:language>en</dc:language>
    <meta property="rendition:layout">reflowable</meta>
    <meta name="cover" content="cover-img"/>
  </metadata>
  <manifest>
    <item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>
    <item id="c1" href="text/ch1.xhtml" media-type="application/xhtml+xml"/>
    <item id="c2" href="text/ch2.xhtml" media-type="application/xhtml+xml"/>
    <item id="cover-img" href="images/cover.jpg" media-type="image/jpeg"/>
    <item id="ncx" href="toc.ncx" media-type="application/x-dtbncx+xml"/>
  </manifest>
  <spine toc="ncx">
    <itemref idref="c1"/>
    <itemref idref="c2" properties="page-spread-left"/>
    <itemref idref="ghost"/>
  </spine>
  <guide>
    <reference type="cover" title="Cover" href="cover.xhtml"/>
  </guide>
</package>"#;

    #[test]
    fn test_parse_container() {
        let xml = r#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;
        assert_eq!(parse_container(xml).unwrap(), "OEBPS/content.opf");
    }

    #[test]
    fn test_parse_container_without_rootfile_is_fatal() {
        let err = parse_container("<container><rootfiles/></container>").unwrap_err();
        assert!(matches!(err, PackageError::MalformedContainer(_)));
    }

    #[test]
    fn test_spine_order_and_dangling_idref() {
        let doc = parse_package_document(OPF, "OEBPS/".to_string()).unwrap();
        let idrefs: Vec<&str> = doc.spine.iter().map(|s| s.idref.as_str()).collect();
        assert_eq!(idrefs, vec!["c1", "c2"]); // "ghost" silently skipped
        assert_eq!(doc.spine[0].absolute_path, "/OEBPS/text/ch1.xhtml");
        assert_eq!(doc.spine[1].spread.as_deref(), Some("page-spread-left"));
    }

    #[test]
    fn test_cfi_steps() {
        let doc = parse_package_document(OPF, "OEBPS/".to_string()).unwrap();
        assert_eq!(doc.spine[0].cfi, "/6/2[c1]");
        assert_eq!(doc.spine[1].cfi, "/6/4[c2]");
    }

    #[test]
    fn test_duplicate_identifier_dedup() {
        let doc = parse_package_document(OPF, "OEBPS/".to_string()).unwrap();
        assert_eq!(doc.metadata.get("dc:identifier").unwrap(), "urn:isbn:123");
        assert_eq!(doc.uid(), Some("urn:isbn:123"));
    }

    #[test]
    fn test_dedup_when_matching_identifier_comes_second() {
        let opf = OPF.replace(
            r#"<dc:identifier id="uid">urn:isbn:123</dc:identifier>
    <dc:identifier id="other">other-id</dc:identifier>"#,
            r#"<dc:identifier id="other">other-id</dc:identifier>
    <dc:identifier id="uid">urn:isbn:123</dc:identifier>"#,
        );
        let doc = parse_package_document(&opf, "OEBPS/".to_string()).unwrap();
        assert_eq!(doc.metadata.get("dc:identifier").unwrap(), "urn:isbn:123");
    }

    #[test]
    fn test_metadata_forms() {
        let doc = parse_package_document(OPF, "OEBPS/".to_string()).unwrap();
        assert_eq!(doc.metadata.get("dc:title").unwrap(), "The Test Book");
        assert_eq!(doc.metadata.get("rendition:layout").unwrap(), "reflowable");
        assert_eq!(doc.metadata.get("cover").unwrap(), "cover-img");
        assert_eq!(doc.cover_meta_id.as_deref(), Some("cover-img"));
    }

    #[test]
    fn test_nav_and_ncx_pointers() {
        let doc = parse_package_document(OPF, "OEBPS/".to_string()).unwrap();
        assert_eq!(doc.nav_href.as_deref(), Some("nav.xhtml"));
        assert_eq!(doc.toc_id.as_deref(), Some("ncx"));
    }

    #[test]
    fn test_guide_references() {
        let doc = parse_package_document(OPF, "OEBPS/".to_string()).unwrap();
        assert_eq!(doc.guide.len(), 1);
        assert_eq!(doc.guide[0].ref_type, "cover");
        assert_eq!(doc.guide[0].href, "cover.xhtml");
    }

    #[test]
    fn test_fixed_layout_detection() {
        let opf = OPF.replace(
            r#"<meta property="rendition:layout">reflowable</meta>"#,
            r#"<meta property="rendition:layout">pre-paginated</meta>"#,
        );
        let doc = parse_package_document(&opf, "OEBPS/".to_string()).unwrap();
        assert!(doc.is_fixed_layout());

        let doc = parse_package_document(OPF, "OEBPS/".to_string()).unwrap();
        assert!(!doc.is_fixed_layout());
    }

    #[test]
    fn test_content_counts_formula() {
        let counts = ContentCounts::from_parts(1000, 2, 1);
        assert_eq!(counts.total, 1000 + 300 * 2 + 300);
        assert_eq!(ContentCounts::ZERO.total, 0);
    }
}
