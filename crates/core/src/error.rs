/// Top-level error type. All public API functions return this.
#[derive(Debug, thiserror::Error)]
pub enum AnalyzeError {
    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Package error: {0}")]
    Package(#[from] PackageError),

    #[error("Decipher error: {0}")]
    Decipher(#[from] DecipherError),

    #[error("Cover error: {0}")]
    Cover(#[from] CoverError),

    #[error("Security violation: {0}")]
    Security(#[from] SecurityError),

    #[error("Network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the archive-backed package reader.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// The input is not a valid ZIP-like container.
    #[error("Invalid archive: {0}")]
    InvalidArchive(String),

    /// A named entry is missing from the container.
    #[error("Entry not found in archive: {0}")]
    FileNotFound(String),

    #[error("Failed to read entry {path}: {detail}")]
    Read { path: String, detail: String },
}

/// Errors from container/package-document resolution. Both variants are
/// fatal to analysis: without the package document there is no publication.
#[derive(Debug, thiserror::Error)]
pub enum PackageError {
    #[error("Malformed container descriptor: {0}")]
    MalformedContainer(String),

    #[error("Malformed package document: {0}")]
    MalformedPackage(String),

    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

/// Errors from LCP key derivation and resource decryption. Per spine item
/// these are soft failures; only a totally invalid license is fatal to
/// whole-archive deciphering.
#[derive(Debug, thiserror::Error)]
pub enum DecipherError {
    #[error("No candidate user key validates against the license")]
    NoValidKey,

    #[error("Malformed license document: {0}")]
    MalformedLicense(String),

    #[error("Ciphertext is structurally invalid: {0}")]
    BadCiphertext(String),

    #[error("Unsupported protection scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Failed to inflate deflated payload: {0}")]
    Inflate(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CoverError {
    #[error("No cover image found after exhausting all fallback strategies")]
    NotFound,
}

#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    #[error("Archive contains {count} files, exceeding limit of {limit}")]
    TooManyFiles { count: u64, limit: u64 },

    #[error("Resource {name} is {size_mb}MB, exceeding limit of {limit_mb}MB")]
    OversizedResource {
        name: String,
        size_mb: u64,
        limit_mb: u64,
    },
}
