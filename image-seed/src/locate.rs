//! Bundle artifact lookup
//!
//! Finds the kernel, initrd and root disk inside an extracted legacy bundle.

use std::path::{Path, PathBuf};

use crate::error::{Result, UploadError};

/// Files that make up a legacy AMI-style bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleArtifacts {
    pub kernel: PathBuf,
    pub initrd: PathBuf,
    pub disk_image: PathBuf,
}

/// Locates bundle artifacts in an extracted directory.
pub trait ArtifactLocator: Send + Sync {
    /// `name` is the image being uploaded, used for error reporting.
    fn locate(&self, name: &str, dir: &Path) -> Result<BundleArtifacts>;
}

/// Shell-style file name pattern with a single leading or trailing `*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    /// `*suffix`
    EndsWith(&'static str),
    /// `name`
    Exact(&'static str),
}

impl Pattern {
    pub fn matches(&self, file_name: &str) -> bool {
        match self {
            Pattern::EndsWith(suffix) => file_name.ends_with(suffix),
            Pattern::Exact(name) => file_name == *name,
        }
    }
}

/// Ordered pattern lists per artifact. Later patterns are fallbacks.
#[derive(Debug, Clone)]
pub struct GlobLocator {
    pub kernel: Vec<Pattern>,
    pub initrd: Vec<Pattern>,
    pub disk_image: Vec<Pattern>,
}

impl Default for GlobLocator {
    fn default() -> Self {
        Self {
            kernel: vec![
                Pattern::EndsWith("vmlinuz-virtual"),
                Pattern::EndsWith("vmlinuz"),
            ],
            initrd: vec![
                Pattern::EndsWith("-initrd"),
                Pattern::EndsWith("-loader"),
                Pattern::Exact("initrd"),
            ],
            disk_image: vec![Pattern::EndsWith(".img")],
        }
    }
}

impl ArtifactLocator for GlobLocator {
    fn locate(&self, name: &str, dir: &Path) -> Result<BundleArtifacts> {
        let files = list_files(dir).map_err(|e| {
            UploadError::upload_failed(name, format!("failed to list {}: {}", dir.display(), e))
        })?;
        let dir_str = dir.display().to_string();

        // Order matters: a missing kernel must stop the lookup before the
        // initrd and disk image are searched.
        let kernel = first_match(&files, &self.kernel).ok_or_else(|| {
            UploadError::KernelNotFound {
                name: name.to_string(),
                dir: dir_str.clone(),
            }
        })?;
        let initrd = first_match(&files, &self.initrd).ok_or_else(|| {
            UploadError::InitrdNotFound {
                name: name.to_string(),
                dir: dir_str.clone(),
            }
        })?;
        let disk_image = first_match(&files, &self.disk_image).ok_or_else(|| {
            UploadError::DiskImageNotFound {
                name: name.to_string(),
                dir: dir_str,
            }
        })?;

        Ok(BundleArtifacts {
            kernel,
            initrd,
            disk_image,
        })
    }
}

/// First file matching the first pattern that matches anything.
fn first_match(files: &[PathBuf], patterns: &[Pattern]) -> Option<PathBuf> {
    patterns.iter().find_map(|pattern| {
        files
            .iter()
            .find(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| pattern.matches(n))
            })
            .cloned()
    })
}

/// Regular files below `dir`, sorted by path.
fn list_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }

    files.sort();
    Ok(files)
}
