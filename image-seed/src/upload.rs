//! Image upload orchestration
//!
//! Classifies each request, checks the catalog for an image of the same name
//! and runs the bare or legacy bundle strategy when it is missing.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::catalog::{ArtifactRef, Catalog, CatalogImage, CreateImage, ImagePayload};
use crate::classify::{self, ContainerFormat, DiskFormat, RequestedType, Visibility};
use crate::error::{Result, UploadError};
use crate::locate::{ArtifactLocator, GlobLocator};
use crate::source::{ImageSource, derive_base, extract_tarball};

/// One image to upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub name: String,
    pub source: ImageSource,
    pub requested_type: RequestedType,
    pub visibility: Visibility,
    /// Catalog id for the final image.
    pub image_id: Option<String>,
}

impl UploadRequest {
    /// Public image with an auto-detected type.
    pub fn new(name: impl Into<String>, source: &str) -> Self {
        Self {
            name: name.into(),
            source: ImageSource::parse(source),
            requested_type: RequestedType::Auto,
            visibility: Visibility::Public,
            image_id: None,
        }
    }
}

/// Result of a successful upload request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The catalog already had an image with this name.
    Skipped { existing: CatalogImage },
    Uploaded { image: ArtifactRef },
}

/// Per-image results of a batch, in request order
#[derive(Debug, Default)]
pub struct BatchReport {
    pub results: Vec<(String, Result<UploadOutcome>)>,
}

impl BatchReport {
    pub fn failed(&self) -> impl Iterator<Item = (&str, &UploadError)> {
        self.results
            .iter()
            .filter_map(|(name, result)| result.as_ref().err().map(|e| (name.as_str(), e)))
    }

    pub fn uploaded_count(&self) -> usize {
        self.results
            .iter()
            .filter(|(_, r)| matches!(r, Ok(UploadOutcome::Uploaded { .. })))
            .count()
    }

    pub fn skipped_count(&self) -> usize {
        self.results
            .iter()
            .filter(|(_, r)| matches!(r, Ok(UploadOutcome::Skipped { .. })))
            .count()
    }

    pub fn is_success(&self) -> bool {
        self.failed().next().is_none()
    }
}

/// Uploads images into a catalog
pub struct ImageUploader {
    catalog: Arc<dyn Catalog>,
    locator: Box<dyn ArtifactLocator>,
    scratch_dir: PathBuf,
    download_timeout: Duration,
    http: reqwest::Client,
}

impl ImageUploader {
    pub fn new(catalog: Arc<dyn Catalog>, scratch_dir: PathBuf, download_timeout: Duration) -> Self {
        Self {
            catalog,
            locator: Box::new(GlobLocator::default()),
            scratch_dir,
            download_timeout,
            http: reqwest::Client::new(),
        }
    }

    /// Replace the bundle artifact lookup.
    pub fn with_locator(mut self, locator: Box<dyn ArtifactLocator>) -> Self {
        self.locator = locator;
        self
    }

    /// Whether the catalog already holds an image named `name`.
    pub async fn already_exists(&self, name: &str) -> Result<bool> {
        Ok(self.catalog.find_by_name(name).await?.is_some())
    }

    /// Upload a single image unless it already exists.
    pub async fn upload(&self, request: &UploadRequest) -> Result<UploadOutcome> {
        let run_id = Uuid::new_v4();
        let name = request.name.as_str();

        if name.trim().is_empty() {
            return Err(UploadError::upload_failed(name, "image name must not be empty"));
        }

        // Classify before touching the catalog so bad input has no side effects.
        let image_type = classify::resolve(request.requested_type, request.source.as_str())?;

        info!(
            run_id = %run_id,
            name = %name,
            source = %request.source.as_str(),
            image_type = %image_type,
            "Processing image"
        );

        if let Some(existing) = self.catalog.find_by_name(name).await? {
            info!(
                run_id = %run_id,
                name = %name,
                id = %existing.id,
                "Image already in catalog, skipping"
            );
            return Ok(UploadOutcome::Skipped { existing });
        }

        let image = match image_type.formats() {
            None => self.upload_legacy_bundle(request).await?,
            Some((_, disk_format)) => self.upload_bare(request, disk_format).await?,
        };

        info!(run_id = %run_id, name = %name, id = %image.id, "Image uploaded");
        Ok(UploadOutcome::Uploaded { image })
    }

    /// Upload requests one after another. A failed image is logged and the
    /// batch continues with the next one.
    pub async fn upload_all(&self, requests: &[UploadRequest]) -> BatchReport {
        let mut report = BatchReport::default();

        for request in requests {
            let result = self.upload(request).await;
            if let Err(ref e) = result {
                error!(name = %request.name, kind = e.kind(), error = %e, "Image upload failed");
            }
            report.results.push((request.name.clone(), result));
        }

        info!(
            total = report.results.len(),
            uploaded = report.uploaded_count(),
            skipped = report.skipped_count(),
            failed = report.failed().count(),
            "Image batch finished"
        );

        report
    }

    /// Single-file upload with container format `bare`.
    pub async fn upload_bare(
        &self,
        request: &UploadRequest,
        disk_format: DiskFormat,
    ) -> Result<ArtifactRef> {
        let image = CreateImage::new(
            &request.name,
            request.visibility,
            ContainerFormat::Bare,
            disk_format,
        )
        .id(request.image_id.clone());

        self.catalog
            .create_image(&image, ImagePayload::Source(request.source.clone()))
            .await
    }

    /// Kernel, initrd and disk image upload from a gzip tarball.
    ///
    /// Sub-uploads that succeeded before a later failure stay in the catalog.
    pub async fn upload_legacy_bundle(&self, request: &UploadRequest) -> Result<ArtifactRef> {
        let name = request.name.as_str();
        let base = derive_base(request.source.as_str());

        tokio::fs::create_dir_all(&self.scratch_dir)
            .await
            .map_err(|e| {
                UploadError::upload_failed(
                    name,
                    format!("failed to create {}: {}", self.scratch_dir.display(), e),
                )
            })?;

        // Removed when dropped, whichever way this function returns.
        let scratch = tempfile::Builder::new()
            .prefix(&format!("{}-", scratch_prefix(name)))
            .tempdir_in(&self.scratch_dir)
            .map_err(|e| {
                UploadError::upload_failed(name, format!("failed to create scratch directory: {}", e))
            })?;

        debug!(name = %name, scratch = %scratch.path().display(), "Created scratch directory");

        let extracted = tokio::time::timeout(
            self.download_timeout,
            self.fetch_and_extract(&request.source, scratch.path()),
        )
        .await
        .map_err(|_| {
            UploadError::upload_failed(
                name,
                format!(
                    "download timed out after {}s",
                    self.download_timeout.as_secs()
                ),
            )
        })?
        .map_err(|e| UploadError::upload_failed(name, format!("{:#}", e)))?;

        let artifacts = self.locator.locate(name, &extracted)?;

        info!(
            name = %name,
            base = %base,
            kernel = %artifacts.kernel.display(),
            initrd = %artifacts.initrd.display(),
            disk_image = %artifacts.disk_image.display(),
            "Located bundle artifacts"
        );

        let kernel = self
            .catalog
            .create_image(
                &CreateImage::new(
                    format!("{}-kernel", base),
                    request.visibility,
                    ContainerFormat::Aki,
                    DiskFormat::Aki,
                ),
                ImagePayload::File(artifacts.kernel),
            )
            .await?;

        let initrd = self
            .catalog
            .create_image(
                &CreateImage::new(
                    format!("{}-initrd", base),
                    request.visibility,
                    ContainerFormat::Ari,
                    DiskFormat::Ari,
                ),
                ImagePayload::File(artifacts.initrd),
            )
            .await?;

        let image = CreateImage::new(name, request.visibility, ContainerFormat::Ami, DiskFormat::Ami)
            .property("kernel_id", &kernel.id)
            .property("ramdisk_id", &initrd.id)
            .id(request.image_id.clone());

        self.catalog
            .create_image(&image, ImagePayload::File(artifacts.disk_image))
            .await
    }

    /// Download the bundle into `scratch` and unpack it, returning the
    /// extraction root.
    async fn fetch_and_extract(&self, source: &ImageSource, scratch: &Path) -> anyhow::Result<PathBuf> {
        let archive = scratch.join("bundle.tar.gz");
        let extracted = scratch.join("extracted");

        let bytes = source
            .fetch_to(&self.http, &archive)
            .await
            .with_context(|| format!("failed to fetch {}", source.as_str()))?;
        info!(source = %source.as_str(), bytes, "Bundle downloaded");

        tokio::fs::create_dir(&extracted)
            .await
            .context("failed to create extraction directory")?;
        extract_tarball(&archive, &extracted).await?;

        Ok(extracted)
    }
}

/// Image name reduced to characters safe in a directory name.
fn scratch_prefix(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_prefix_replaces_separators() {
        assert_eq!(scratch_prefix("cirros-0.3.2"), "cirros-0.3.2");
        assert_eq!(scratch_prefix("../etc/passwd"), ".._etc_passwd");
        assert_eq!(scratch_prefix("my image"), "my_image");
    }

    #[test]
    fn request_defaults() {
        let request = UploadRequest::new("cirros", "http://x/cirros.img");
        assert_eq!(request.requested_type, RequestedType::Auto);
        assert_eq!(request.visibility, Visibility::Public);
        assert!(matches!(request.source, ImageSource::HttpUrl(_)));
    }

    #[test]
    fn report_counts() {
        let report = BatchReport {
            results: vec![
                (
                    "a".to_string(),
                    Ok(UploadOutcome::Uploaded {
                        image: ArtifactRef { id: "1".to_string() },
                    }),
                ),
                (
                    "b".to_string(),
                    Ok(UploadOutcome::Skipped {
                        existing: CatalogImage {
                            id: "2".to_string(),
                            name: "b".to_string(),
                        },
                    }),
                ),
                ("c".to_string(), Err(UploadError::upload_failed("c", "boom"))),
            ],
        };

        assert_eq!(report.uploaded_count(), 1);
        assert_eq!(report.skipped_count(), 1);
        assert_eq!(report.failed().map(|(n, _)| n).collect::<Vec<_>>(), ["c"]);
        assert!(!report.is_success());
    }
}
