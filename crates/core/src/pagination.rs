//! Pagination estimation: TOC share sizes and book-relative percentages.

use serde::Serialize;

use crate::package::SpineItem;
use crate::toc::Toc;

#[derive(Debug, Clone, Serialize)]
pub struct Pagination {
    /// Sum of all spine items' weighted counts.
    pub total_count: u64,
    /// Deepest TOC level among matched nodes, minimum 1.
    pub max_level: u32,
    pub elements: Vec<PaginationElement>,
}

/// One pagination entry per spine item, in reading order.
#[derive(Debug, Clone, Serialize)]
pub struct PaginationElement {
    /// Arena indices of the TOC nodes inside this spine item.
    pub toc_items: Vec<usize>,
    pub label: String,
    /// Share of the whole book, 0–100.
    pub percentage_of_book: f64,
    /// Cumulative share of everything before this item; 0 at the first.
    pub position_in_book: f64,
}

/// Second depth-first pass over the TOC: each node's share of its spine item.
///
/// The size of a leaf is the distance to its next sibling in the same spine
/// item; the last leaf (or one whose neighbor lives in another item) takes
/// the remainder of the parent's own share. Negative results indicate
/// unordered TOC data and are clamped to zero.
pub fn compute_toc_sizes(toc: &mut Toc) {
    let roots = toc.roots.clone();
    compute_sizes(toc, &roots, 0.0, 1.0);
}

fn compute_sizes(toc: &mut Toc, siblings: &[usize], base_position: f64, base_size: f64) {
    for (i, &index) in siblings.iter().enumerate() {
        let position = toc.nodes[index].position_in_spine;

        let size = match siblings.get(i + 1) {
            Some(&next) if toc.nodes[next].spine_index == toc.nodes[index].spine_index => {
                toc.nodes[next].position_in_spine - position
            }
            _ => base_size + base_position - position,
        };
        let size = if size < 0.0 {
            tracing::warn!(
                "TOC entry '{}' has a negative computed share; clamping to zero",
                toc.nodes[index].label
            );
            0.0
        } else {
            size
        };

        toc.nodes[index].size_in_spine = size;
        toc.nodes[index].percentage_of_spine = 100.0 * size;

        let children = toc.nodes[index].children.clone();
        if !children.is_empty() {
            compute_sizes(toc, &children, position, size);
        }
    }
}

/// Flatten spine counts and TOC matches into the pagination index. Returns
/// `None` when the spine has no countable content at all (empty or
/// fixed-layout publication): pagination is unavailable rather than NaN.
pub fn generate_pagination(toc: &Toc, spine: &[SpineItem]) -> Option<Pagination> {
    let total_count: u64 = spine.iter().map(|item| item.counts.total).sum();
    if total_count == 0 {
        tracing::debug!("Spine has no countable content; pagination unavailable");
        return None;
    }

    let order = toc.document_order();
    let mut elements: Vec<PaginationElement> = Vec::with_capacity(spine.len());
    let mut position_in_book = 0.0;
    let max_level = toc.max_level().max(1);

    for (index, item) in spine.iter().enumerate() {
        let toc_items: Vec<usize> = order
            .iter()
            .copied()
            .filter(|&n| toc.nodes[n].spine_index == Some(index))
            .collect();

        // Label fallback chain: first matching node, else the previous
        // element's label, else the item's filename.
        let label = toc_items
            .first()
            .map(|&n| toc.nodes[n].label.clone())
            .or_else(|| elements.last().map(|e| e.label.clone()))
            .unwrap_or_else(|| filename_label(&item.href));

        let percentage_of_book = 100.0 * item.counts.total as f64 / total_count as f64;
        elements.push(PaginationElement {
            toc_items,
            label,
            percentage_of_book,
            position_in_book,
        });
        position_in_book += percentage_of_book;
    }

    Some(Pagination {
        total_count,
        max_level,
        elements,
    })
}

fn filename_label(href: &str) -> String {
    let name = href.rsplit('/').next().unwrap_or(href);
    name.split_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(name)
        .to_string()
}
