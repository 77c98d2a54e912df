//! Cover-image discovery across the four places publishers put it.

use scraper::{Html, Selector};

use crate::archive::{join_and_normalize, PackageArchive};
use crate::error::CoverError;
use crate::package::PackageDocument;

/// How many leading spine items the last-resort page scan inspects.
const SPINE_SCAN_LIMIT: usize = 3;

/// Locate the cover image and return its absolute archive path.
///
/// Fallback chain, most to least authoritative:
/// 1. `<meta name="cover">` pointing at a manifest item,
/// 2. a manifest item with `properties="cover-image"` (EPUB3),
/// 3. the guide's `type="cover"` page, scanned for its image,
/// 4. the first few spine items, scanned the same way.
pub fn resolve_cover(
    archive: &mut PackageArchive,
    document: &PackageDocument,
) -> Result<String, CoverError> {
    if let Some(id) = &document.cover_meta_id {
        if let Some(item) = document.manifest.get(id) {
            if item.media_type.starts_with("image/") {
                return Ok(absolute(&document.base_path, &item.href));
            }
            // Some packages point the cover meta at an XHTML wrapper page.
            if let Some(path) = scan_page(archive, &absolute(&document.base_path, &item.href)) {
                return Ok(path);
            }
        }
    }

    if let Some(item) = document
        .manifest
        .values()
        .find(|item| item.properties.contains("cover-image"))
    {
        return Ok(absolute(&document.base_path, &item.href));
    }

    if let Some(reference) = document
        .guide
        .iter()
        .find(|r| r.ref_type.eq_ignore_ascii_case("cover"))
    {
        let page = absolute(&document.base_path, &reference.href);
        if let Some(path) = scan_page(archive, &page) {
            return Ok(path);
        }
    }

    for item in document.spine.iter().take(SPINE_SCAN_LIMIT) {
        if let Some(path) = scan_page(archive, &item.absolute_path) {
            return Ok(path);
        }
    }

    Err(CoverError::NotFound)
}

fn absolute(base_path: &str, href: &str) -> String {
    format!("/{}", join_and_normalize(base_path, href))
}

/// Scan an XHTML page for its first image element and resolve the reference
/// against the page's own directory.
fn scan_page(archive: &mut PackageArchive, page_path: &str) -> Option<String> {
    let html = match archive.read_text(page_path) {
        Ok(html) => html,
        Err(e) => {
            tracing::debug!("Cover candidate page '{page_path}' unreadable: {e}");
            return None;
        }
    };

    let src = first_image_reference(&html)?;
    let page_dir = page_path
        .trim_start_matches('/')
        .rfind('/')
        .map(|i| &page_path.trim_start_matches('/')[..i + 1])
        .unwrap_or("");
    Some(format!("/{}", join_and_normalize(page_dir, &src)))
}

/// First `<img src>` or SVG `<image href|xlink:href>` in the document.
fn first_image_reference(html: &str) -> Option<String> {
    let document = Html::parse_document(html);

    let img_selector = Selector::parse("img").ok()?;
    if let Some(img) = document.select(&img_selector).next() {
        if let Some(src) = img.value().attr("src") {
            return Some(src.to_string());
        }
    }

    let image_selector = Selector::parse("image").ok()?;
    if let Some(image) = document.select(&image_selector).next() {
        // `xlink:href` lands in the XLink namespace under the HTML parser, so
        // a plain attribute lookup misses it; match by local name instead.
        let href = image
            .value()
            .attrs()
            .find_map(|(name, value)| {
                (name == "href" || name.ends_with(":href")).then_some(value)
            })?;
        return Some(href.to_string());
    }

    None
}
