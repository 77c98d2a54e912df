//! Navigation-document parsing: EPUB2 NCX and EPUB3 NAV into one TOC tree.
//!
//! Nodes live in an arena (`Vec<TocNode>`) addressed by index; parents are
//! stored as back-reference indices, never owning pointers. A single
//! depth-first pass assigns `level` and the leaf `position` counter in
//! document order — that ordering is the canonical chapter numbering and
//! must stay deterministic.

use quick_xml::events::Event;
use quick_xml::Reader as XmlReader;
use serde::Serialize;

use crate::archive::join_and_normalize;

#[derive(Debug, Clone, Serialize)]
pub struct TocNode {
    pub label: String,
    /// Absolute (leading-slash) href, fragment preserved.
    pub href: String,
    /// 1-based depth; assigned by the numbering pass.
    pub level: u32,
    /// Non-owning back-reference into the arena.
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    /// True iff the node has no children.
    pub end_point: bool,
    /// Sequential chapter number, endpoints only, document order.
    pub position: Option<u32>,
    /// Spine item this node falls into; set during content analysis.
    pub spine_index: Option<usize>,
    /// Fractional position within its spine item (0..=1).
    pub position_in_spine: f64,
    /// Share of its spine item, derived by the pagination pass.
    pub size_in_spine: f64,
    pub percentage_of_spine: f64,
}

impl TocNode {
    fn new(parent: Option<usize>) -> Self {
        Self {
            label: String::new(),
            href: String::new(),
            level: 0,
            parent,
            children: Vec::new(),
            end_point: false,
            position: None,
            spine_index: None,
            position_in_spine: 0.0,
            size_in_spine: 0.0,
            percentage_of_spine: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Toc {
    pub nodes: Vec<TocNode>,
    pub roots: Vec<usize>,
}

impl Toc {
    /// Parse a navigation document. Any parse failure yields an empty TOC
    /// rather than aborting the analysis.
    pub fn parse(base_path: &str, document: &str) -> Toc {
        let mut toc = if document.contains("<navMap") || document.contains("<ncx") {
            parse_ncx(base_path, document)
        } else {
            parse_nav(base_path, document)
        };
        toc.number_nodes();
        toc
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Deepest level in the tree, 0 when empty.
    pub fn max_level(&self) -> u32 {
        self.nodes.iter().map(|n| n.level).max().unwrap_or(0)
    }

    /// Arena indices in document order (parents before children, siblings
    /// left to right).
    pub fn document_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<usize> = self.roots.iter().rev().copied().collect();
        while let Some(index) = stack.pop() {
            order.push(index);
            for &child in self.nodes[index].children.iter().rev() {
                stack.push(child);
            }
        }
        order
    }

    /// Assign `level`, `end_point`, and the shared endpoint `position`
    /// counter in one depth-first pass.
    pub(crate) fn number_nodes(&mut self) {
        let order = self.document_order();
        let mut next_position = 0u32;
        for index in order {
            let level = match self.nodes[index].parent {
                Some(parent) => self.nodes[parent].level + 1,
                None => 1,
            };
            let node = &mut self.nodes[index];
            node.level = level;
            node.end_point = node.children.is_empty();
            if node.end_point {
                next_position += 1;
                node.position = Some(next_position);
            }
        }
    }

    pub(crate) fn push_node(&mut self, parent: Option<usize>) -> usize {
        let index = self.nodes.len();
        self.nodes.push(TocNode::new(parent));
        match parent {
            Some(p) => self.nodes[p].children.push(index),
            None => self.roots.push(index),
        }
        index
    }
}

/// Resolve a TOC href against the navigation document's directory, keeping
/// any fragment.
fn absolute_href(base_path: &str, href: &str) -> String {
    let (path, fragment) = match href.split_once('#') {
        Some((p, f)) => (p, Some(f)),
        None => (href, None),
    };
    let mut resolved = format!("/{}", join_and_normalize(base_path, path));
    if let Some(fragment) = fragment {
        resolved.push('#');
        resolved.push_str(fragment);
    }
    resolved
}

/// EPUB2 NCX: `navMap > navPoint`, label from `navLabel > text` (element id
/// when absent), href from `content@src`.
fn parse_ncx(base_path: &str, xml: &str) -> Toc {
    let mut toc = Toc::default();
    let mut reader = XmlReader::from_str(xml);
    let mut buf = Vec::new();

    let mut stack: Vec<usize> = Vec::new();
    let mut in_nav_label = false;
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                b"navPoint" => {
                    let index = toc.push_node(stack.last().copied());
                    if let Some(id) = e
                        .attributes()
                        .flatten()
                        .find(|a| a.key.local_name().as_ref() == b"id")
                    {
                        // Fallback label until a navLabel shows up.
                        toc.nodes[index].label =
                            String::from_utf8_lossy(&id.value).into_owned();
                    }
                    stack.push(index);
                }
                b"navLabel" => in_nav_label = true,
                b"text" if in_nav_label => {
                    in_text = true;
                    if let Some(&index) = stack.last() {
                        toc.nodes[index].label.clear();
                    }
                }
                b"content" => {
                    set_ncx_href(&mut toc, &stack, base_path, e);
                }
                _ => {}
            },
            Ok(Event::Empty(ref e)) => {
                if e.local_name().as_ref() == b"content" {
                    set_ncx_href(&mut toc, &stack, base_path, e);
                }
            }
            Ok(Event::Text(ref e)) => {
                if in_text {
                    if let Some(&index) = stack.last() {
                        toc.nodes[index]
                            .label
                            .push_str(&e.unescape().unwrap_or_default());
                    }
                }
            }
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"navPoint" => {
                    if let Some(index) = stack.pop() {
                        toc.nodes[index].label = toc.nodes[index].label.trim().to_string();
                    }
                }
                b"navLabel" => in_nav_label = false,
                b"text" => in_text = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                tracing::warn!("NCX navigation document did not parse: {e}");
                return Toc::default();
            }
            _ => {}
        }
        buf.clear();
    }

    toc
}

fn set_ncx_href(
    toc: &mut Toc,
    stack: &[usize],
    base_path: &str,
    e: &quick_xml::events::BytesStart<'_>,
) {
    if let Some(&index) = stack.last() {
        if let Some(src) = e
            .attributes()
            .flatten()
            .find(|a| a.key.local_name().as_ref() == b"src")
        {
            toc.nodes[index].href =
                absolute_href(base_path, &String::from_utf8_lossy(&src.value));
        }
    }
}

/// EPUB3 NAV: `nav[epub:type=toc] > ol > li`, label/href from the anchor.
fn parse_nav(base_path: &str, html: &str) -> Toc {
    let document = scraper::Html::parse_document(html);

    let nav_selector = match scraper::Selector::parse(
        "nav[epub\\:type='toc'], nav[role='doc-toc'], nav",
    ) {
        Ok(s) => s,
        Err(_) => return Toc::default(),
    };
    let ol_selector = scraper::Selector::parse("ol").unwrap();

    let Some(nav) = document.select(&nav_selector).next() else {
        tracing::warn!("Navigation document has no nav element; TOC is empty");
        return Toc::default();
    };
    let Some(ol) = nav.select(&ol_selector).next() else {
        return Toc::default();
    };

    let mut toc = Toc::default();
    parse_nav_ol(&mut toc, None, base_path, &ol);
    toc
}

fn parse_nav_ol(
    toc: &mut Toc,
    parent: Option<usize>,
    base_path: &str,
    ol: &scraper::ElementRef<'_>,
) {
    let a_selector = scraper::Selector::parse("a, span").unwrap();
    let ol_selector = scraper::Selector::parse("ol").unwrap();

    for li in ol
        .children()
        .filter_map(scraper::ElementRef::wrap)
        .filter(|el| el.value().name() == "li")
    {
        let Some(anchor) = li.select(&a_selector).next() else {
            continue;
        };
        let label = anchor.text().collect::<String>().trim().to_string();
        let href = anchor.value().attr("href").unwrap_or("");

        let index = toc.push_node(parent);
        toc.nodes[index].label = label;
        if !href.is_empty() {
            toc.nodes[index].href = absolute_href(base_path, href);
        }

        if let Some(nested) = li.select(&ol_selector).next() {
            parse_nav_ol(toc, Some(index), base_path, &nested);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const NCX: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1">
  <navMap>
    <navPoint id="np-1" playOrder="1">
      <navLabel><text>Chapter One</text></navLabel>
      <content src="text/ch1.xhtml"/>
    </navPoint>
    <navPoint id="np-2" playOrder="2">
      <navLabel><text>Chapter Two</text></navLabel>
      <content src="text/ch2.xhtml"/>
    </navPoint>
    <navPoint id="np-3" playOrder="3">
      <navLabel><text>Chapter Three</text></navLabel>
      <content src="text/ch3.xhtml"/>
    </navPoint>
  </navMap>
</ncx>"#;

    const NCX_NESTED: &str = r#"<ncx>
  <navMap>
    <navPoint id="part1">
      <navLabel><text>Part I</text></navLabel>
      <content src="part1.xhtml"/>
      <navPoint id="ch1">
        <navLabel><text>One</text></navLabel>
        <content src="ch1.xhtml#start"/>
      </navPoint>
      <navPoint id="ch2">
        <navLabel><text>Two</text></navLabel>
        <content src="ch2.xhtml"/>
      </navPoint>
    </navPoint>
    <navPoint id="part2">
      <navLabel><text>Part II</text></navLabel>
      <content src="part2.xhtml"/>
      <navPoint id="ch3">
        <navLabel><text>Three</text></navLabel>
        <content src="ch3.xhtml"/>
      </navPoint>
    </navPoint>
  </navMap>
</ncx>"#;

    const NAV: &str = r#"<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
<body>
  <nav epub:type="toc">
    <ol>
      <li><a href="text/ch1.xhtml">Chapter One</a></li>
      <li><a href="text/ch2.xhtml">Chapter Two</a>
        <ol>
          <li><a href="text/ch2.xhtml#s1">Section 2.1</a></li>
        </ol>
      </li>
    </ol>
  </nav>
</body>
</html>"#;

    #[test]
    fn test_ncx_three_flat_chapters() {
        let toc = Toc::parse("OEBPS/", NCX);
        assert_eq!(toc.roots.len(), 3);
        let positions: Vec<u32> = toc
            .roots
            .iter()
            .map(|&i| toc.nodes[i].position.unwrap())
            .collect();
        assert_eq!(positions, vec![1, 2, 3]);
        assert!(toc.roots.iter().all(|&i| toc.nodes[i].level == 1));
        assert!(toc.roots.iter().all(|&i| toc.nodes[i].end_point));
        assert_eq!(toc.nodes[toc.roots[0]].label, "Chapter One");
        assert_eq!(toc.nodes[toc.roots[0]].href, "/OEBPS/text/ch1.xhtml");
    }

    #[test]
    fn test_ncx_nested_positions_share_one_counter() {
        let toc = Toc::parse("", NCX_NESTED);
        // Two roots, five nodes total.
        assert_eq!(toc.roots.len(), 2);
        assert_eq!(toc.len(), 5);

        let by_label = |label: &str| {
            toc.nodes
                .iter()
                .find(|n| n.label == label)
                .unwrap_or_else(|| panic!("missing node {label}"))
        };

        // Endpoints are numbered across the whole tree in document order.
        assert_eq!(by_label("One").position, Some(1));
        assert_eq!(by_label("Two").position, Some(2));
        assert_eq!(by_label("Three").position, Some(3));
        assert_eq!(by_label("Part I").position, None);

        assert_eq!(by_label("Part I").level, 1);
        assert_eq!(by_label("One").level, 2);
        assert!(!by_label("Part I").end_point);
        assert!(by_label("One").end_point);

        // Parent is a back-reference index, fragment survives resolution.
        let one = by_label("One");
        assert_eq!(toc.nodes[one.parent.unwrap()].label, "Part I");
        assert_eq!(one.href, "/ch1.xhtml#start");
    }

    #[test]
    fn test_ncx_label_falls_back_to_id() {
        let xml = r#"<ncx><navMap>
          <navPoint id="np-raw"><content src="x.xhtml"/></navPoint>
        </navMap></ncx>"#;
        let toc = Toc::parse("", xml);
        assert_eq!(toc.nodes[0].label, "np-raw");
    }

    #[test]
    fn test_nav_document() {
        let toc = Toc::parse("OEBPS/", NAV);
        assert_eq!(toc.roots.len(), 2);
        assert_eq!(toc.nodes[toc.roots[0]].label, "Chapter One");
        assert_eq!(toc.nodes[toc.roots[0]].position, Some(1));

        let ch2 = &toc.nodes[toc.roots[1]];
        assert_eq!(ch2.children.len(), 1);
        assert!(!ch2.end_point);
        let section = &toc.nodes[ch2.children[0]];
        assert_eq!(section.label, "Section 2.1");
        assert_eq!(section.href, "/OEBPS/text/ch2.xhtml#s1");
        assert_eq!(section.level, 2);
        assert_eq!(section.position, Some(2));
    }

    #[test]
    fn test_unparseable_document_yields_empty_toc() {
        let toc = Toc::parse("", "<html><body>no nav here</body></html>");
        assert!(toc.is_empty());
        assert_eq!(toc.max_level(), 0);
    }

    #[test]
    fn test_document_order() {
        let toc = Toc::parse("", NCX_NESTED);
        let labels: Vec<&str> = toc
            .document_order()
            .into_iter()
            .map(|i| toc.nodes[i].label.as_str())
            .collect();
        assert_eq!(labels, vec!["Part I", "One", "Two", "Part II", "Three"]);
    }
}
