//! Per-spine-item content analysis: fetch, decipher, count, cross-reference.
//!
//! Each item is analyzed independently; one corrupt chapter degrades to the
//! zero-count sentinel and the walk continues. The resulting order always
//! matches package-document spine order.

use quick_xml::events::Event;
use quick_xml::Reader as XmlReader;
use scraper::{Html, Selector};

use crate::archive::{FetchMode, PackageArchive};
use crate::lcp::{LcpDecipher, License, UserKey};
use crate::package::{ContentCounts, SpineItem, MEDIA_WEIGHT};
use crate::toc::Toc;

/// Analyze every spine item in place and cross-reference the TOC tree.
pub fn analyze_spine(
    archive: &mut PackageArchive,
    decipher: &mut LcpDecipher,
    license: Option<&License>,
    user_key: Option<&UserKey>,
    spine: &mut [SpineItem],
    toc: &mut Toc,
) {
    for index in 0..spine.len() {
        let Some(html) = fetch_item_document(archive, decipher, license, user_key, &spine[index])
        else {
            spine[index].counts = ContentCounts::ZERO;
            continue;
        };

        if !is_well_formed_markup(&html) {
            tracing::warn!(
                "Spine item '{}' is not parseable, degrading to zero counts",
                spine[index].idref
            );
            spine[index].counts = ContentCounts::ZERO;
            continue;
        }

        let document = Html::parse_document(&html);
        spine[index].counts = count_document_tree(&document);
        cross_reference_toc(toc, &document, index, &spine[index]);
    }
}

/// Fetch one item's document text, deciphering when a protection descriptor
/// is attached. Every failure is soft: log and return `None`.
fn fetch_item_document(
    archive: &mut PackageArchive,
    decipher: &mut LcpDecipher,
    license: Option<&License>,
    user_key: Option<&UserKey>,
    item: &SpineItem,
) -> Option<String> {
    let bytes = match archive.read_bytes(&item.absolute_path) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!("Skipping spine item '{}': {e}", item.idref);
            return None;
        }
    };

    let Some(protection) = &item.protection else {
        return Some(String::from_utf8_lossy(&bytes).into_owned());
    };

    let (Some(license), Some(user_key)) = (license, user_key) else {
        tracing::warn!(
            "Spine item '{}' is protected but no valid license/key is available",
            item.idref
        );
        return None;
    };

    match decipher.decipher(FetchMode::Bytes, &bytes, protection, license, user_key) {
        Ok(data) => Some(redecode_html(data.into_bytes())),
        Err(e) => {
            tracing::warn!("Failed to decipher spine item '{}': {e}", item.idref);
            None
        }
    }
}

/// Decrypted LCP payloads are raw UTF-8 that must be reinterpreted as text;
/// a trailing truncated tag sequence after the last `>` is corrupt tail data
/// and is dropped.
pub fn redecode_html(bytes: Vec<u8>) -> String {
    let mut text = String::from_utf8_lossy(&bytes).into_owned();
    if let Some(end) = text.rfind('>') {
        text.truncate(end + 1);
    }
    text
}

/// Content documents are XML (XHTML); a well-formedness pass decides whether
/// the item is analyzable at all, since the HTML parser recovers from almost
/// anything.
fn is_well_formed_markup(text: &str) -> bool {
    let mut reader = XmlReader::from_str(text);
    reader.config_mut().check_end_names = true;
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Eof) => return true,
            Err(_) => return false,
            _ => {}
        }
        buf.clear();
    }
}

/// Count characters, images, and videos under `<body>`.
pub fn count_document(html: &str) -> ContentCounts {
    count_document_tree(&Html::parse_document(html))
}

fn count_document_tree(document: &Html) -> ContentCounts {
    let body_selector = Selector::parse("body").unwrap();
    let Some(body) = document.select(&body_selector).next() else {
        return ContentCounts::ZERO;
    };

    let mut characters = 0u64;
    let mut images = 0u64;
    let mut videos = 0u64;

    for node in body.descendants() {
        match node.value() {
            scraper::Node::Text(text) => {
                characters += text.chars().count() as u64;
            }
            scraper::Node::Element(element) => match element.name() {
                // `image` is the SVG form.
                "img" | "image" => images += 1,
                "video" => videos += 1,
                _ => {}
            },
            _ => {}
        }
    }

    ContentCounts::from_parts(characters, images, videos)
}

/// Attach every TOC node that falls inside this spine item and compute its
/// fractional position from the fragment anchor.
fn cross_reference_toc(toc: &mut Toc, document: &Html, spine_index: usize, item: &SpineItem) {
    for node_index in 0..toc.nodes.len() {
        let href = toc.nodes[node_index].href.clone();
        if href.is_empty() {
            continue;
        }
        let (path, fragment) = match href.split_once('#') {
            Some((p, f)) => (p, Some(f)),
            None => (href.as_str(), None),
        };
        if path != item.absolute_path {
            continue;
        }

        let node = &mut toc.nodes[node_index];
        node.spine_index = Some(spine_index);
        node.position_in_spine = match fragment {
            Some(fragment) if item.counts.total > 0 => {
                weighted_position_of(document, fragment)
                    .map(|weight| weight as f64 / item.counts.total as f64)
                    .unwrap_or(0.0)
            }
            _ => 0.0,
        };
    }
}

/// Character-weighted count of everything before the element whose id equals
/// the fragment, or `None` when the id does not appear.
fn weighted_position_of(document: &Html, fragment: &str) -> Option<u64> {
    let body_selector = Selector::parse("body").unwrap();
    let body = document.select(&body_selector).next()?;

    let mut weight = 0u64;
    for node in body.descendants() {
        match node.value() {
            scraper::Node::Element(element) => {
                if element.attr("id") == Some(fragment) {
                    return Some(weight);
                }
                if matches!(element.name(), "img" | "image" | "video") {
                    weight += MEDIA_WEIGHT;
                }
            }
            scraper::Node::Text(text) => {
                weight += text.chars().count() as u64;
            }
            _ => {}
        }
    }
    None
}
