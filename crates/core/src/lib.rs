pub mod archive;
pub mod cover;
pub mod detect;
pub mod encryption;
pub mod error;
pub mod lcp;
pub mod package;
pub mod pagination;
pub mod publication;
pub mod security;
pub mod spine;
pub mod toc;
pub mod web;

pub mod prelude {
    pub use crate::error::*;
    pub use crate::lcp::{License, UserKey};
    pub use crate::package::{ContentCounts, Metadata, SpineItem};
    pub use crate::pagination::{Pagination, PaginationElement};
    pub use crate::publication::{
        analyze, decipher_whole_archive, get_cover_image, Analysis, ArchivePublication,
        PdfPublication, Publication,
    };
    pub use crate::toc::{Toc, TocNode};
    pub use crate::web::WebPublication;
}
