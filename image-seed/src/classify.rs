//! Image type classification
//!
//! Maps a source URL to the upload strategy and catalog formats it needs.

use std::fmt;
use std::str::FromStr;

use crate::error::{Result, UploadError};
use crate::source::file_name_of;

/// Extensions accepted by [`classify`], in the order they are reported.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[".gz", ".tgz", ".qcow2", ".img"];

/// Catalog disk format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiskFormat {
    Qcow2,
    Raw,
    Vhd,
    Vmdk,
    Vdi,
    Iso,
    Aki,
    Ari,
    Ami,
}

impl DiskFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
            DiskFormat::Vhd => "vhd",
            DiskFormat::Vmdk => "vmdk",
            DiskFormat::Vdi => "vdi",
            DiskFormat::Iso => "iso",
            DiskFormat::Aki => "aki",
            DiskFormat::Ari => "ari",
            DiskFormat::Ami => "ami",
        }
    }
}

impl fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Catalog container format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerFormat {
    Bare,
    Aki,
    Ari,
    Ami,
}

impl ContainerFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerFormat::Bare => "bare",
            ContainerFormat::Aki => "aki",
            ContainerFormat::Ari => "ari",
            ContainerFormat::Ami => "ami",
        }
    }
}

impl fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Image visibility in the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

impl Visibility {
    pub fn from_public(public: bool) -> Self {
        if public {
            Visibility::Public
        } else {
            Visibility::Private
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
        }
    }
}

/// How an image is uploaded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    /// Kernel + initrd + disk tarball, uploaded as three linked entries.
    Ami,
    /// Single qcow2 file.
    Qcow,
    /// Single file with an explicit disk format.
    Bare(DiskFormat),
}

impl ImageType {
    /// Container and disk format for single-file uploads.
    ///
    /// Returns `None` for [`ImageType::Ami`], which uses one format pair per
    /// part.
    pub fn formats(&self) -> Option<(ContainerFormat, DiskFormat)> {
        match self {
            ImageType::Ami => None,
            ImageType::Qcow => Some((ContainerFormat::Bare, DiskFormat::Qcow2)),
            ImageType::Bare(format) => Some((ContainerFormat::Bare, *format)),
        }
    }
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageType::Ami => f.write_str("ami"),
            ImageType::Qcow => f.write_str("qcow"),
            ImageType::Bare(format) => write!(f, "{}", format),
        }
    }
}

/// Type requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestedType {
    /// Derive the type from the source extension.
    #[default]
    Auto,
    Explicit(ImageType),
}

impl RequestedType {
    /// Parse a type token. `unknown`, `auto` and the empty string mean
    /// [`RequestedType::Auto`].
    pub fn parse(token: &str) -> Result<Self> {
        let token = token.trim();
        let image_type = match token.to_ascii_lowercase().as_str() {
            "" | "unknown" | "auto" => return Ok(RequestedType::Auto),
            "ami" => ImageType::Ami,
            "qcow" => ImageType::Qcow,
            "qcow2" => ImageType::Bare(DiskFormat::Qcow2),
            "raw" => ImageType::Bare(DiskFormat::Raw),
            "vhd" => ImageType::Bare(DiskFormat::Vhd),
            "vmdk" => ImageType::Bare(DiskFormat::Vmdk),
            "vdi" => ImageType::Bare(DiskFormat::Vdi),
            "iso" => ImageType::Bare(DiskFormat::Iso),
            _ => {
                return Err(UploadError::UnsupportedImageFormat {
                    url: format!("type '{}'", token),
                    supported: "unknown, ami, qcow, qcow2, raw, vhd, vmdk, vdi, iso".to_string(),
                });
            }
        };
        Ok(RequestedType::Explicit(image_type))
    }
}

impl FromStr for RequestedType {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self> {
        RequestedType::parse(s)
    }
}

/// Classify a source by its file extension.
pub fn classify(url: &str) -> Result<ImageType> {
    let extension = extension_of(url).map(|ext| ext.to_ascii_lowercase());

    match extension.as_deref() {
        Some(".gz") | Some(".tgz") => Ok(ImageType::Ami),
        Some(".qcow2") | Some(".img") => Ok(ImageType::Qcow),
        _ => Err(UploadError::UnsupportedImageFormat {
            url: url.to_string(),
            supported: SUPPORTED_EXTENSIONS.join(", "),
        }),
    }
}

/// Resolve the effective type: an explicit type wins, otherwise classify.
pub fn resolve(requested: RequestedType, url: &str) -> Result<ImageType> {
    match requested {
        RequestedType::Explicit(image_type) => Ok(image_type),
        RequestedType::Auto => classify(url),
    }
}

/// Last extension of the source file name, including the dot.
fn extension_of(url: &str) -> Option<&str> {
    let file_name = file_name_of(url);
    match file_name.rfind('.') {
        Some(0) | None => None,
        Some(idx) => Some(&file_name[idx..]),
    }
}
