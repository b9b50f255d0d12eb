//! Image catalog access
//!
//! The [`Catalog`] trait is what the uploader talks to. [`GlanceCli`] backs it
//! with the `glance` command line client: reads parse its table output, writes
//! stream the image payload into its standard input.

use std::fmt;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::classify::{ContainerFormat, DiskFormat, Visibility};
use crate::config::Config;
use crate::error::{Result, UploadError};
use crate::source::ImageSource;

/// An image already present in the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogImage {
    pub id: String,
    pub name: String,
}

/// Identifier assigned by the catalog to a created image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub id: String,
}

/// Image data handed to a create call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImagePayload {
    /// Streamed from the request source (URL or local path).
    Source(ImageSource),
    /// A file extracted into the scratch directory.
    File(PathBuf),
}

impl ImagePayload {
    /// Stream the payload into `writer`, returning the number of bytes copied.
    async fn copy_to<W>(&self, client: &reqwest::Client, writer: &mut W) -> anyhow::Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        match self {
            ImagePayload::Source(source) => source.copy_to(client, writer).await,
            ImagePayload::File(path) => {
                let mut file = File::open(path)
                    .await
                    .with_context(|| format!("Failed to open {}", path.display()))?;
                let copied = tokio::io::copy(&mut file, writer)
                    .await
                    .context("Failed to copy image file")?;
                writer.flush().await?;
                Ok(copied)
            }
        }
    }
}

impl fmt::Display for ImagePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImagePayload::Source(source) => f.write_str(source.as_str()),
            ImagePayload::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Parameters of a single image-create call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateImage {
    pub name: String,
    pub visibility: Visibility,
    pub container_format: ContainerFormat,
    pub disk_format: DiskFormat,
    /// Extra `key=value` properties, in order.
    pub properties: Vec<(String, String)>,
    /// Catalog id to assign, if any.
    pub id: Option<String>,
}

impl CreateImage {
    pub fn new(
        name: impl Into<String>,
        visibility: Visibility,
        container_format: ContainerFormat,
        disk_format: DiskFormat,
    ) -> Self {
        Self {
            name: name.into(),
            visibility,
            container_format,
            disk_format,
            properties: Vec::new(),
            id: None,
        }
    }

    pub fn property(mut self, key: &str, value: &str) -> Self {
        self.properties.push((key.to_string(), value.to_string()));
        self
    }

    pub fn id(mut self, id: Option<String>) -> Self {
        self.id = id;
        self
    }
}

/// Remote image catalog
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Look up an active image by exact name.
    ///
    /// Failing to reach the catalog is an error, never `Ok(None)`.
    async fn find_by_name(&self, name: &str) -> Result<Option<CatalogImage>>;

    /// Create an image and upload its payload.
    async fn create_image(&self, image: &CreateImage, payload: ImagePayload) -> Result<ArtifactRef>;
}

/// Catalog backed by the `glance` command line client
pub struct GlanceCli {
    command: String,
    base_args: Vec<String>,
    image_api_version: u8,
    list_timeout: Duration,
    upload_timeout: Duration,
    http: reqwest::Client,
}

impl GlanceCli {
    pub fn new(config: &Config) -> Self {
        Self {
            command: config.catalog.command.clone(),
            base_args: base_args(config),
            image_api_version: config.catalog.api_version,
            list_timeout: config.catalog.list_timeout(),
            upload_timeout: config.catalog.upload_timeout(),
            http: reqwest::Client::new(),
        }
    }

    fn list_args(&self) -> Vec<String> {
        let mut args = self.base_args.clone();
        args.push("image-list".to_string());
        if self.image_api_version == 1 {
            args.extend(["--status".to_string(), "active".to_string()]);
        } else {
            args.extend(["--property-filter".to_string(), "status=active".to_string()]);
        }
        args
    }

    fn create_args(&self, image: &CreateImage) -> Vec<String> {
        let mut args = self.base_args.clone();
        args.extend(["image-create".to_string(), "--name".to_string(), image.name.clone()]);

        if self.image_api_version == 1 {
            let public = match image.visibility {
                Visibility::Public => "True",
                Visibility::Private => "False",
            };
            args.extend(["--is-public".to_string(), public.to_string()]);
        } else {
            args.extend([
                "--visibility".to_string(),
                image.visibility.as_str().to_string(),
            ]);
        }

        args.extend([
            "--container-format".to_string(),
            image.container_format.to_string(),
            "--disk-format".to_string(),
            image.disk_format.to_string(),
        ]);

        for (key, value) in &image.properties {
            args.extend(["--property".to_string(), format!("{}={}", key, value)]);
        }

        if let Some(id) = &image.id {
            args.extend(["--id".to_string(), id.clone()]);
        }

        args
    }
}

#[async_trait]
impl Catalog for GlanceCli {
    async fn find_by_name(&self, name: &str) -> Result<Option<CatalogImage>> {
        let unavailable = |reason: String| UploadError::AuthOrAvailability {
            name: name.to_string(),
            reason,
        };

        let child = Command::new(&self.command)
            .args(self.list_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| unavailable(format!("failed to run {}: {}", self.command, e)))?;

        let output = tokio::time::timeout(self.list_timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                unavailable(format!(
                    "image-list timed out after {}s",
                    self.list_timeout.as_secs()
                ))
            })?
            .map_err(|e| unavailable(format!("image-list failed: {}", e)))?;

        if !output.status.success() {
            return Err(unavailable(format!(
                "image-list failed: {}",
                stderr_of(&output)
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let found = parse_image_list(&stdout)
            .into_iter()
            .find(|image| image.name == name);

        debug!(name = %name, found = found.is_some(), "Checked catalog for image");
        Ok(found)
    }

    async fn create_image(&self, image: &CreateImage, payload: ImagePayload) -> Result<ArtifactRef> {
        let name = image.name.as_str();

        info!(
            name = %name,
            source = %payload,
            container_format = %image.container_format,
            disk_format = %image.disk_format,
            "Creating catalog image"
        );

        let upload = async {
            let mut child = Command::new(&self.command)
                .args(self.create_args(image))
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| {
                    UploadError::upload_failed(name, format!("failed to run {}: {}", self.command, e))
                })?;

            let (Some(mut stdin), stdout, stderr) =
                (child.stdin.take(), child.stdout.take(), child.stderr.take())
            else {
                return Err(UploadError::upload_failed(name, "image-create stdin unavailable"));
            };

            // Drain client output while the payload streams.
            let feed = async {
                let fed = payload.copy_to(&self.http, &mut stdin).await;
                if let Err(e) = &fed {
                    if !is_broken_pipe(e) {
                        // Do not let the client finish with a truncated payload.
                        if let Err(kill_err) = child.kill().await {
                            warn!(name = %name, error = %kill_err, "Failed to kill image-create");
                        }
                    }
                }
                drop(stdin);
                (fed, child.wait().await)
            };

            let ((fed, status), stdout, stderr) =
                tokio::join!(feed, read_all(stdout), read_all(stderr));

            let status = status
                .map_err(|e| UploadError::upload_failed(name, format!("image-create failed: {}", e)))?;
            let output = Output {
                status,
                stdout,
                stderr,
            };

            if let Err(e) = fed {
                let reason = if is_broken_pipe(&e) && !output.status.success() {
                    // Client quit before reading the payload.
                    format!("image-create failed: {}", stderr_of(&output))
                } else if output.stderr.is_empty() {
                    format!("failed to stream {}: {:#}", payload, e)
                } else {
                    format!(
                        "failed to stream {}: {:#} (image-create: {})",
                        payload,
                        e,
                        stderr_of(&output)
                    )
                };
                return Err(UploadError::upload_failed(name, reason));
            }

            Ok(output)
        };

        let output = tokio::time::timeout(self.upload_timeout, upload)
            .await
            .map_err(|_| {
                UploadError::upload_failed(
                    name,
                    format!(
                        "image-create timed out after {}s",
                        self.upload_timeout.as_secs()
                    ),
                )
            })??;

        if !output.status.success() {
            return Err(UploadError::upload_failed(
                name,
                format!("image-create failed: {}", stderr_of(&output)),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let id = parse_property(&stdout, "id").ok_or_else(|| {
            UploadError::upload_failed(name, "image-create output did not contain an id")
        })?;

        info!(name = %name, id = %id, "Catalog image created");
        Ok(ArtifactRef { id })
    }
}

/// Authentication and endpoint flags shared by every invocation.
fn base_args(config: &Config) -> Vec<String> {
    let identity = &config.identity;
    let mut args = Vec::new();

    if config.catalog.insecure {
        args.push("--insecure".to_string());
    }

    args.extend([
        "--os-username".to_string(),
        identity.username.clone(),
        "--os-password".to_string(),
        identity.password.clone(),
    ]);

    if identity.api_version == 2 {
        args.extend(["--os-tenant-name".to_string(), identity.project_name.clone()]);
    } else {
        args.extend(["--os-project-name".to_string(), identity.project_name.clone()]);
        if let Some(domain) = &identity.user_domain_name {
            args.extend(["--os-user-domain-name".to_string(), domain.clone()]);
        }
        if let Some(domain) = &identity.project_domain_name {
            args.extend(["--os-project-domain-name".to_string(), domain.clone()]);
        }
    }

    args.extend([
        "--os-image-url".to_string(),
        image_api_base(&config.catalog.image_api_url),
        "--os-auth-url".to_string(),
        identity.auth_url.clone(),
        "--os-image-api-version".to_string(),
        config.catalog.api_version.to_string(),
    ]);

    args
}

/// Image API endpoint without its version path (`http://host:9292/v2` ->
/// `http://host:9292`).
pub fn image_api_base(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_path("");
            parsed.set_query(None);
            parsed.set_fragment(None);
            parsed.as_str().trim_end_matches('/').to_string()
        }
        Err(_) => url.trim_end_matches('/').to_string(),
    }
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        if let Err(e) = reader.read_to_end(&mut buf).await {
            debug!(error = %e, "Failed to read client output");
        }
    }
    buf
}

fn is_broken_pipe(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .is_some_and(|e| e.kind() == ErrorKind::BrokenPipe)
    })
}

fn stderr_of(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        format!("exit status {}", output.status)
    } else {
        stderr
    }
}

/// Cells of an ASCII table row (`| a | b |`), or `None` for borders and
/// other lines.
fn table_cells(line: &str) -> Option<Vec<&str>> {
    let line = line.trim();
    if !line.starts_with('|') {
        return None;
    }
    let inner = line.trim_start_matches('|').trim_end_matches('|');
    Some(inner.split('|').map(str::trim).collect())
}

/// Parse `image-list` output into images.
pub fn parse_image_list(output: &str) -> Vec<CatalogImage> {
    let mut rows = output.lines().filter_map(table_cells);

    let Some(header) = rows.next() else {
        return Vec::new();
    };
    let column = |title: &str| header.iter().position(|h| h.eq_ignore_ascii_case(title));
    let (Some(id_col), Some(name_col)) = (column("ID"), column("Name")) else {
        return Vec::new();
    };

    rows.filter_map(|cells| {
        Some(CatalogImage {
            id: cells.get(id_col)?.to_string(),
            name: cells.get(name_col)?.to_string(),
        })
    })
    .collect()
}

/// Value of `key` in a `| Property | Value |` table.
pub fn parse_property(output: &str, key: &str) -> Option<String> {
    output
        .lines()
        .filter_map(table_cells)
        .find(|cells| cells.first() == Some(&key))
        .and_then(|cells| cells.get(1).map(|v| v.to_string()))
        .filter(|v| !v.is_empty())
}
