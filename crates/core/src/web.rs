//! URL-backed publications: an exploded container served over HTTP.
//!
//! The host exposes a `manifest.json` next to the content documents and,
//! for protected publications, the usual `META-INF` entries. Everything but
//! the manifest itself is best-effort; unreachable items degrade to the
//! zero-count sentinel like their in-archive counterparts.

use std::time::Duration;

use reqwest::blocking::Client;

use crate::encryption::{ProtectionCatalog, ENCRYPTION_FILE};
use crate::error::AnalyzeError;
use crate::lcp::{LcpDecipher, License, UserKey, LICENSE_FILE};
use crate::package::{spine_cfi, ContentCounts, Metadata, SpineItem};
use crate::pagination::{self, Pagination};
use crate::publication::{manifest_metadata, Analysis, Publication, MANIFEST_FILE};
use crate::spine::count_document;
use crate::toc::Toc;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// A publication analyzed in place over HTTP.
pub struct WebPublication {
    base_url: String,
    analysis: Analysis,
}

impl WebPublication {
    /// Fetch and analyze the publication rooted at `base_url`. Only the
    /// manifest fetch is fatal; it plays the role the container descriptor
    /// plays for archives.
    pub fn open(base_url: &str, user_keys: &[UserKey]) -> Result<Self, AnalyzeError> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| AnalyzeError::Network(e.to_string()))?;
        let fetcher = Fetcher {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        };

        let manifest = fetcher.text(MANIFEST_FILE)?;
        let manifest: serde_json::Value = serde_json::from_str(&manifest)
            .map_err(|e| AnalyzeError::Network(format!("manifest did not parse: {e}")))?;

        let license = fetcher.optional_text(LICENSE_FILE).and_then(|json| {
            License::parse(&json)
                .map_err(|e| tracing::warn!("Hosted license did not parse: {e}"))
                .ok()
        });
        let catalog = fetcher
            .optional_text(ENCRYPTION_FILE)
            .map(|xml| ProtectionCatalog::parse(&xml))
            .unwrap_or_default();

        let metadata = manifest_metadata(&manifest);
        let fixed_layout = manifest_is_fixed_layout(&manifest);
        let mut spine = reading_order_spine(&manifest, &catalog);
        let mut toc = manifest_toc(&manifest);

        let user_key = match &license {
            Some(license) => LcpDecipher::find_valid_key(license, user_keys),
            None => None,
        };

        let pagination = if fixed_layout {
            None
        } else {
            analyze_hosted_spine(&fetcher, license.as_ref(), user_key.as_ref(), &mut spine);
            cross_reference(&mut toc, &spine);
            pagination::compute_toc_sizes(&mut toc);
            pagination::generate_pagination(&toc, &spine)
        };

        Ok(Self {
            base_url: fetcher.base_url,
            analysis: Analysis {
                metadata,
                spine,
                toc,
                license,
                pagination,
                fixed_layout,
            },
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn into_analysis(self) -> Analysis {
        self.analysis
    }
}

impl Publication for WebPublication {
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

struct Fetcher {
    client: Client,
    base_url: String,
}

impl Fetcher {
    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn bytes(&self, path: &str) -> Result<Vec<u8>, AnalyzeError> {
        let url = self.url(path);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| AnalyzeError::Network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AnalyzeError::Network(format!(
                "GET {url} returned {}",
                response.status()
            )));
        }
        let body = response
            .bytes()
            .map_err(|e| AnalyzeError::Network(e.to_string()))?;
        Ok(body.to_vec())
    }

    fn text(&self, path: &str) -> Result<String, AnalyzeError> {
        let bytes = self.bytes(path)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn optional_text(&self, path: &str) -> Option<String> {
        match self.text(path) {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::debug!("Optional resource '{path}' not fetched: {e}");
                None
            }
        }
    }
}

fn manifest_is_fixed_layout(manifest: &serde_json::Value) -> bool {
    let layout = manifest["metadata"]["presentation"]["layout"]
        .as_str()
        .or_else(|| manifest["metadata"]["layout"].as_str());
    matches!(layout, Some("fixed") | Some("pre-paginated"))
}

fn reading_order_spine(
    manifest: &serde_json::Value,
    catalog: &ProtectionCatalog,
) -> Vec<SpineItem> {
    let Some(entries) = manifest["readingOrder"].as_array() else {
        tracing::warn!("Manifest has no readingOrder; spine is empty");
        return Vec::new();
    };

    entries
        .iter()
        .enumerate()
        .filter_map(|(index, entry)| {
            let href = entry["href"].as_str()?.to_string();
            let absolute_path = format!("/{}", href.trim_start_matches('/'));
            let idref = format!("r{index}");
            Some(SpineItem {
                cfi: spine_cfi(index, &idref),
                idref,
                protection: catalog.get(&absolute_path).cloned(),
                href,
                absolute_path,
                media_type: entry["type"].as_str().unwrap_or_default().to_string(),
                spread: None,
                counts: ContentCounts::ZERO,
            })
        })
        .collect()
}

/// Build the TOC tree from the manifest's `toc` link array.
fn manifest_toc(manifest: &serde_json::Value) -> Toc {
    let mut toc = Toc::default();
    if let Some(links) = manifest["toc"].as_array() {
        push_toc_links(&mut toc, None, links);
    }
    toc.number_nodes();
    toc
}

fn push_toc_links(toc: &mut Toc, parent: Option<usize>, links: &[serde_json::Value]) {
    for link in links {
        let Some(href) = link["href"].as_str() else {
            continue;
        };
        let index = toc.push_node(parent);
        toc.nodes[index].label = link["title"].as_str().unwrap_or(href).to_string();
        toc.nodes[index].href = format!("/{}", href.trim_start_matches('/'));

        if let Some(children) = link["children"].as_array() {
            push_toc_links(toc, Some(index), children);
        }
    }
}

fn analyze_hosted_spine(
    fetcher: &Fetcher,
    license: Option<&License>,
    user_key: Option<&UserKey>,
    spine: &mut [SpineItem],
) {
    let mut decipher = LcpDecipher::new();
    for item in spine.iter_mut() {
        let bytes = match fetcher.bytes(&item.href) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Skipping hosted item '{}': {e}", item.idref);
                item.counts = ContentCounts::ZERO;
                continue;
            }
        };

        let html = match (&item.protection, license, user_key) {
            (Some(protection), Some(license), Some(user_key)) => {
                match decipher.decipher(
                    crate::archive::FetchMode::Bytes,
                    &bytes,
                    protection,
                    license,
                    user_key,
                ) {
                    Ok(data) => crate::spine::redecode_html(data.into_bytes()),
                    Err(e) => {
                        tracing::warn!("Failed to decipher hosted item '{}': {e}", item.idref);
                        item.counts = ContentCounts::ZERO;
                        continue;
                    }
                }
            }
            (Some(_), _, _) => {
                tracing::warn!(
                    "Hosted item '{}' is protected but no valid license/key is available",
                    item.idref
                );
                item.counts = ContentCounts::ZERO;
                continue;
            }
            _ => String::from_utf8_lossy(&bytes).into_owned(),
        };

        item.counts = count_document(&html);
    }
}

/// Path-equality cross-reference, fragments ignored. Hosted analysis does
/// not compute fragment-anchored positions; nodes land at the start of
/// their item.
fn cross_reference(toc: &mut Toc, spine: &[SpineItem]) {
    for node in toc.nodes.iter_mut() {
        let path = node.href.split('#').next().unwrap_or_default();
        if let Some(index) = spine.iter().position(|item| item.absolute_path == path) {
            node.spine_index = Some(index);
            node.position_in_spine = 0.0;
        }
    }
}
