//! Protection catalog: `META-INF/encryption.xml` → per-resource descriptors.

use std::collections::HashMap;

use percent_encoding::percent_decode_str;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader as XmlReader;

use crate::archive::{normalize_entry_path, PackageArchive};
use crate::error::{AnalyzeError, ArchiveError};

pub const ENCRYPTION_FILE: &str = "META-INF/encryption.xml";

/// Sentinel for an entry whose key-retrieval scheme could not be determined.
/// Distinct from "not protected": an absent catalog entry means the resource
/// is in the clear.
pub const RETRIEVAL_UNKNOWN: &str = "unknown";

/// Marker inside an LCP retrieval URI.
const LCP_LICENSE_REF: &str = "license.lcpl";

/// Schemes we recognize but do not decrypt.
const ADOBE_ADEPT_NS: &str = "http://ns.adobe.com/adept";
const IDPF_OBFUSCATION: &str = "http://www.idpf.org/2008/embedding";
const ADOBE_OBFUSCATION: &str = "http://ns.adobe.com/pdf/enc#RC";

/// How one in-package resource is protected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectionDescriptor {
    /// Encryption algorithm URI from `EncryptionMethod`.
    pub algorithm: String,
    /// Compression applied before encryption: 0 = none, 8 = raw deflate.
    pub compression_method: u32,
    /// Declared plaintext length, when the manifest carries one.
    pub original_length: u64,
    /// Key-retrieval URI: `RetrievalMethod` URI, else the `resource` element
    /// namespace, else [`RETRIEVAL_UNKNOWN`]. Never the algorithm.
    pub retrieval_type: String,
}

impl ProtectionDescriptor {
    /// True iff the content key is retrieved through an LCP license.
    pub fn is_lcp(&self) -> bool {
        self.retrieval_type.contains(LCP_LICENSE_REF)
    }

    /// Adobe ADEPT and font-obfuscation entries are recognized but never
    /// deciphered here.
    pub fn is_unsupported_scheme(&self) -> bool {
        self.retrieval_type.starts_with(ADOBE_ADEPT_NS)
            || self.algorithm == IDPF_OBFUSCATION
            || self.algorithm == ADOBE_OBFUSCATION
    }
}

/// Mapping from absolute in-package path (leading `/`) to its descriptor.
#[derive(Debug, Default)]
pub struct ProtectionCatalog {
    entries: HashMap<String, ProtectionDescriptor>,
}

impl ProtectionCatalog {
    /// Build the catalog from the archive's encryption manifest. A missing
    /// manifest is not an error: the publication simply has no protected
    /// resources.
    pub fn build(archive: &mut PackageArchive) -> Result<Self, AnalyzeError> {
        let xml = match archive.read_text(ENCRYPTION_FILE) {
            Ok(xml) => xml,
            Err(AnalyzeError::Archive(ArchiveError::FileNotFound(_))) => {
                return Ok(Self::default());
            }
            Err(e) => return Err(e),
        };
        Ok(Self::parse(&xml))
    }

    /// Parse an encryption manifest. Malformed entries are skipped with a
    /// warning; one bad block must not hide the rest of the catalog.
    pub fn parse(xml: &str) -> Self {
        let mut reader = XmlReader::from_str(xml);
        let mut buf = Vec::new();

        let mut entries = HashMap::new();
        let mut current: Option<PendingEntry> = None;
        let mut in_key_info = false;

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                    let local = e.local_name();
                    match local.as_ref() {
                        b"EncryptedData" => {
                            current = Some(PendingEntry::default());
                        }
                        b"EncryptionMethod" => {
                            if let Some(entry) = current.as_mut() {
                                if let Some(alg) = attr_value(e, b"Algorithm") {
                                    entry.algorithm = alg;
                                }
                            }
                        }
                        b"KeyInfo" => in_key_info = true,
                        b"RetrievalMethod" if in_key_info => {
                            if let Some(entry) = current.as_mut() {
                                if let Some(uri) = attr_value(e, b"URI") {
                                    entry.retrieval_method = Some(uri);
                                }
                            }
                        }
                        b"resource" if in_key_info => {
                            if let Some(entry) = current.as_mut() {
                                if let Some(ns) = attr_value(e, b"xmlns") {
                                    entry.resource_namespace = Some(ns);
                                }
                            }
                        }
                        b"CipherReference" => {
                            if let Some(entry) = current.as_mut() {
                                if let Some(uri) = attr_value(e, b"URI") {
                                    entry.path = Some(uri);
                                }
                            }
                        }
                        b"Compression" => {
                            if let Some(entry) = current.as_mut() {
                                if let Some(m) = attr_value(e, b"Method") {
                                    entry.compression_method = m.parse().unwrap_or(0);
                                }
                                if let Some(len) = attr_value(e, b"OriginalLength") {
                                    entry.original_length = len.parse().unwrap_or(0);
                                }
                            }
                        }
                        _ => {}
                    }
                }
                Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                    b"KeyInfo" => in_key_info = false,
                    b"EncryptedData" => {
                        if let Some(entry) = current.take() {
                            match entry.finish() {
                                Some((path, descriptor)) => {
                                    entries.insert(path, descriptor);
                                }
                                None => {
                                    tracing::warn!(
                                        "Skipping encryption manifest entry without a cipher reference"
                                    );
                                }
                            }
                        }
                    }
                    _ => {}
                },
                Ok(Event::Eof) => break,
                Err(e) => {
                    tracing::warn!("Failed to parse encryption manifest: {e}");
                    break;
                }
                _ => {}
            }
            buf.clear();
        }

        Self { entries }
    }

    /// Look up a descriptor by absolute (leading-slash) path.
    pub fn get(&self, absolute_path: &str) -> Option<&ProtectionDescriptor> {
        self.entries.get(absolute_path)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ProtectionDescriptor)> {
        self.entries.iter()
    }
}

#[derive(Debug, Default)]
struct PendingEntry {
    algorithm: String,
    compression_method: u32,
    original_length: u64,
    retrieval_method: Option<String>,
    resource_namespace: Option<String>,
    path: Option<String>,
}

impl PendingEntry {
    fn finish(self) -> Option<(String, ProtectionDescriptor)> {
        let raw_path = self.path?;
        let decoded = percent_decode_str(&raw_path)
            .decode_utf8()
            .map(|s| s.into_owned())
            .unwrap_or(raw_path);
        let path = format!("/{}", normalize_entry_path(&decoded));

        let retrieval_type = self
            .retrieval_method
            .or(self.resource_namespace)
            .unwrap_or_else(|| RETRIEVAL_UNKNOWN.to_string());

        Some((
            path,
            ProtectionDescriptor {
                algorithm: self.algorithm,
                compression_method: self.compression_method,
                original_length: self.original_length,
                retrieval_type,
            },
        ))
    }
}

fn attr_value(e: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name)
        .map(|a| String::from_utf8_lossy(&a.value).into_owned())
}
