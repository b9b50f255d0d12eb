//! Upload error types.

use thiserror::Error;

/// Errors that abort a single image upload.
///
/// None of these are retried. A batch logs the failure and moves on to the
/// next image.
#[derive(Debug, Error)]
pub enum UploadError {
    /// Source extension (or explicit type token) is not recognized.
    #[error("unsupported image format for {url}, supported extensions are: {supported}")]
    UnsupportedImageFormat { url: String, supported: String },

    /// The catalog could not be queried (tool missing, auth rejected, timeout).
    #[error("catalog unavailable while checking '{name}': {reason}")]
    AuthOrAvailability { name: String, reason: String },

    /// No kernel found in the extracted bundle.
    #[error("no kernel found for '{name}' in {dir}")]
    KernelNotFound { name: String, dir: String },

    /// No initrd/loader found in the extracted bundle.
    #[error("no initrd found for '{name}' in {dir}")]
    InitrdNotFound { name: String, dir: String },

    /// No root disk image found in the extracted bundle.
    #[error("no disk image found for '{name}' in {dir}")]
    DiskImageNotFound { name: String, dir: String },

    /// Download, extraction or image-create failed.
    #[error("upload of '{name}' failed: {reason}")]
    UploadFailed { name: String, reason: String },
}

impl UploadError {
    /// Stable name of the failure kind, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            UploadError::UnsupportedImageFormat { .. } => "UnsupportedImageFormat",
            UploadError::AuthOrAvailability { .. } => "AuthOrAvailabilityError",
            UploadError::KernelNotFound { .. } => "KernelNotFound",
            UploadError::InitrdNotFound { .. } => "InitrdNotFound",
            UploadError::DiskImageNotFound { .. } => "DiskImageNotFound",
            UploadError::UploadFailed { .. } => "UploadFailed",
        }
    }

    pub(crate) fn upload_failed(name: &str, reason: impl ToString) -> Self {
        UploadError::UploadFailed {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for upload operations.
pub type Result<T> = std::result::Result<T, UploadError>;
