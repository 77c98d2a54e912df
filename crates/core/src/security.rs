//! Resource limits applied while reading publication archives.

use serde::{Deserialize, Serialize};

use crate::error::SecurityError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityLimits {
    /// Maximum number of files allowed in an archive.
    pub max_file_count: u64,
    /// Maximum size of a single resource in bytes.
    pub max_resource_size_bytes: u64,
}

impl Default for SecurityLimits {
    fn default() -> Self {
        Self {
            max_file_count: 10_000,
            max_resource_size_bytes: 200 * 1024 * 1024, // 200 MB
        }
    }
}

/// Check if the number of files in an archive exceeds the limit.
pub fn check_file_count(count: u64, limits: &SecurityLimits) -> Result<(), SecurityError> {
    if count > limits.max_file_count {
        return Err(SecurityError::TooManyFiles {
            count,
            limit: limits.max_file_count,
        });
    }
    Ok(())
}

/// Check if a single resource exceeds the size limit.
pub fn check_resource_size(
    name: &str,
    size_bytes: u64,
    limits: &SecurityLimits,
) -> Result<(), SecurityError> {
    if size_bytes > limits.max_resource_size_bytes {
        return Err(SecurityError::OversizedResource {
            name: name.to_string(),
            size_mb: size_bytes / (1024 * 1024),
            limit_mb: limits.max_resource_size_bytes / (1024 * 1024),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_count_ok() {
        let limits = SecurityLimits::default();
        assert!(check_file_count(100, &limits).is_ok());
        assert!(check_file_count(10_000, &limits).is_ok());
    }

    #[test]
    fn test_file_count_exceeded() {
        let limits = SecurityLimits::default();
        assert!(check_file_count(10_001, &limits).is_err());
    }

    #[test]
    fn test_resource_size_ok() {
        let limits = SecurityLimits::default();
        assert!(check_resource_size("image.jpg", 1024 * 1024, &limits).is_ok());
    }

    #[test]
    fn test_resource_size_exceeded() {
        let limits = SecurityLimits::default();
        let size = 201 * 1024 * 1024; // 201 MB
        assert!(check_resource_size("huge.png", size, &limits).is_err());
    }
}
