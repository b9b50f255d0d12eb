//! image-seed: seeds an OpenStack image catalog
//!
//! This library classifies image sources, checks the catalog for existing
//! images and uploads bare images or legacy kernel/initrd/disk bundles.

pub mod catalog;
pub mod classify;
pub mod config;
pub mod error;
pub mod locate;
pub mod source;
pub mod upload;

pub use catalog::{ArtifactRef, Catalog, CatalogImage, CreateImage, GlanceCli, ImagePayload};
pub use classify::{ContainerFormat, DiskFormat, ImageType, RequestedType, Visibility, classify};
pub use config::Config;
pub use error::UploadError;
pub use upload::{BatchReport, ImageUploader, UploadOutcome, UploadRequest};
