//! Package signature checks: EPUB container vs. DRM fulfillment-token stub.

/// Marker string inside the leading bytes of a real EPUB: the `mimetype`
/// entry is required to be stored first and uncompressed, so the MIME type
/// appears in clear text near the start of the archive.
const EPUB_MIME_MARKER: &str = "application/epub+zip";

/// Root tag of an ACSM license-fulfillment stub. Download managers sometimes
/// hand these out under an `.epub` filename.
const FULFILLMENT_ROOT_TAG: &str = "<fulfillmentToken";

const VALID_PACKAGE_SNIFF_LEN: usize = 100;

/// True iff the bytes look like a real EPUB package: not a fulfillment stub,
/// and the EPUB MIME marker appears within the first 100 bytes.
pub fn is_valid_package(input: &[u8]) -> bool {
    if is_fulfillment_stub(input) {
        return false;
    }
    let head = &input[..input.len().min(VALID_PACKAGE_SNIFF_LEN)];
    let head = String::from_utf8_lossy(head);
    head.contains(EPUB_MIME_MARKER)
}

/// True iff the bytes are an ACSM fulfillment-token stub rather than a
/// package. Checked against the root tag after leading whitespace and an
/// optional XML declaration.
pub fn is_fulfillment_stub(input: &[u8]) -> bool {
    let head = &input[..input.len().min(512)];
    let Ok(text) = std::str::from_utf8(head) else {
        return false;
    };
    let mut rest = text.trim_start();
    if rest.starts_with("<?xml") {
        match rest.find("?>") {
            Some(end) => rest = rest[end + 2..].trim_start(),
            None => return false,
        }
    }
    rest.starts_with(FULFILLMENT_ROOT_TAG)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_package() {
        let mut bytes = b"PK\x03\x04".to_vec();
        bytes.extend_from_slice(&[0u8; 26]);
        bytes.extend_from_slice(b"mimetypeapplication/epub+zip");
        assert!(is_valid_package(&bytes));
    }

    #[test]
    fn test_marker_beyond_sniff_window() {
        let mut bytes = vec![b'x'; 200];
        bytes.extend_from_slice(b"application/epub+zip");
        assert!(!is_valid_package(&bytes));
    }

    #[test]
    fn test_fulfillment_stub() {
        let stub = br#"<?xml version="1.0"?>
<fulfillmentToken xmlns="http://ns.adobe.com/adept">
</fulfillmentToken>"#;
        assert!(is_fulfillment_stub(stub));
        assert!(!is_valid_package(stub));
    }

    #[test]
    fn test_stub_without_declaration() {
        assert!(is_fulfillment_stub(b"  <fulfillmentToken>"));
        assert!(!is_fulfillment_stub(b"<container/>"));
        assert!(!is_fulfillment_stub(b""));
    }
}
