//! Image sources
//!
//! Handles reading image payloads from local files and HTTP(S) URLs, and
//! unpacking legacy kernel/initrd/disk bundles.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use flate2::read::GzDecoder;
use futures_util::StreamExt;
use tar::Archive;
use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

/// Where an image payload comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    LocalFile(String),
    HttpUrl(String),
}

impl ImageSource {
    pub fn parse(source: &str) -> Self {
        if source.starts_with("http://") || source.starts_with("https://") {
            ImageSource::HttpUrl(source.to_string())
        } else {
            ImageSource::LocalFile(source.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ImageSource::LocalFile(p) => p,
            ImageSource::HttpUrl(u) => u,
        }
    }

    /// Stream the payload into `writer`, returning the number of bytes copied.
    pub async fn copy_to<W>(&self, client: &reqwest::Client, writer: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        match self {
            ImageSource::LocalFile(path) => {
                let mut file = File::open(path)
                    .await
                    .with_context(|| format!("Failed to open {}", path))?;
                let copied = tokio::io::copy(&mut file, writer)
                    .await
                    .context("Failed to copy image file")?;
                writer.flush().await?;
                Ok(copied)
            }
            ImageSource::HttpUrl(url) => {
                let response = client
                    .get(url)
                    .send()
                    .await
                    .context("Failed to start HTTP request")?;

                if !response.status().is_success() {
                    return Err(anyhow!("HTTP request failed: {}", response.status()));
                }

                let mut stream = response.bytes_stream();
                let mut bytes_copied: u64 = 0;

                while let Some(chunk_result) = stream.next().await {
                    let chunk = chunk_result.context("Failed to read HTTP chunk")?;
                    writer.write_all(&chunk).await?;
                    bytes_copied += chunk.len() as u64;
                }

                writer.flush().await?;
                Ok(bytes_copied)
            }
        }
    }

    /// Download (or copy) the payload to `dest`.
    pub async fn fetch_to(&self, client: &reqwest::Client, dest: &Path) -> Result<u64> {
        let mut file = File::create(dest)
            .await
            .with_context(|| format!("Failed to create {}", dest.display()))?;
        let bytes = self.copy_to(client, &mut file).await?;
        file.sync_all().await?;

        debug!(source = %self.as_str(), dest = %dest.display(), bytes, "Fetched source");
        Ok(bytes)
    }
}

/// Last path segment of a URL or path, without query or fragment.
pub fn file_name_of(source: &str) -> &str {
    let without_query = source
        .split(['?', '#'])
        .next()
        .unwrap_or(source);
    without_query.rsplit('/').next().unwrap_or(without_query)
}

/// Base name for the kernel and initrd entries of a legacy bundle.
///
/// Strips the tarball extension, then a trailing `-multinic`.
pub fn derive_base(source: &str) -> String {
    let file_name = file_name_of(source);
    let stem = file_name
        .strip_suffix(".tar.gz")
        .or_else(|| file_name.strip_suffix(".tgz"))
        .unwrap_or(file_name);
    stem.strip_suffix("-multinic").unwrap_or(stem).to_string()
}

/// Unpack a gzip tarball into `dest` on a blocking thread.
pub async fn extract_tarball(archive: &Path, dest: &Path) -> Result<()> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();

    info!(archive = %archive.display(), dest = %dest.display(), "Extracting bundle");

    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = std::fs::File::open(&archive)
            .with_context(|| format!("Failed to open {}", archive.display()))?;
        let mut tarball = Archive::new(GzDecoder::new(file));
        tarball
            .unpack(&dest)
            .context("Failed to unpack gzip tarball")?;
        Ok(())
    })
    .await
    .context("Extraction task panicked")?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_distinguishes_urls_and_paths() {
        assert_eq!(
            ImageSource::parse("https://x/cirros.img"),
            ImageSource::HttpUrl("https://x/cirros.img".to_string())
        );
        assert_eq!(
            ImageSource::parse("/srv/cirros.img"),
            ImageSource::LocalFile("/srv/cirros.img".to_string())
        );
    }

    #[test]
    fn file_name_strips_query() {
        assert_eq!(file_name_of("http://x/a/b/disk.img?sig=1"), "disk.img");
        assert_eq!(file_name_of("disk.img"), "disk.img");
        assert_eq!(file_name_of("/srv/images/disk.img#v2"), "disk.img");
    }

    #[test]
    fn derive_base_strips_multinic_and_extension() {
        assert_eq!(
            derive_base("cirros-0.3.0-x86_64-uec-multinic.tar.gz"),
            "cirros-0.3.0-x86_64-uec"
        );
        assert_eq!(
            derive_base("http://x/images/cirros-0.3.0-x86_64-uec.tar.gz"),
            "cirros-0.3.0-x86_64-uec"
        );
        assert_eq!(derive_base("ttylinux-uec.tgz"), "ttylinux-uec");
    }

    #[test]
    fn derive_base_keeps_multinic_in_the_middle() {
        assert_eq!(derive_base("a-multinic-b.tar.gz"), "a-multinic-b");
    }

    #[tokio::test]
    async fn fetch_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.img");
        std::fs::write(&src, b"QFI\xfbpayload").unwrap();

        let source = ImageSource::LocalFile(src.to_str().unwrap().to_string());
        let dest = dir.path().join("dest.img");
        let bytes = source
            .fetch_to(&reqwest::Client::new(), &dest)
            .await
            .unwrap();

        assert_eq!(bytes, 11);
        assert_eq!(std::fs::read(&dest).unwrap(), b"QFI\xfbpayload");
    }

    #[tokio::test]
    async fn fetch_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let source = ImageSource::parse(dir.path().join("missing.img").to_str().unwrap());
        let result = source
            .fetch_to(&reqwest::Client::new(), &dir.path().join("out"))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn extract_gzip_tarball() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bundle.tar.gz");

        {
            let file = std::fs::File::create(&archive).unwrap();
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::fast());
            let mut builder = tar::Builder::new(encoder);
            let data = b"kernel";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "vmlinuz", &data[..])
                .unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let out = dir.path().join("out");
        std::fs::create_dir(&out).unwrap();
        extract_tarball(&archive, &out).await.unwrap();

        assert_eq!(std::fs::read(out.join("vmlinuz")).unwrap(), b"kernel");
    }

    #[tokio::test]
    async fn extract_rejects_non_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bundle.tar.gz");
        std::fs::write(&archive, b"not a tarball").unwrap();

        assert!(extract_tarball(&archive, dir.path()).await.is_err());
    }

    /// Serve a single canned HTTP response on a local port.
    async fn serve_once(response: &'static [u8]) -> String {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            socket.write_all(response).await.unwrap();
        });
        format!("http://{}/images/cirros.img", addr)
    }

    #[tokio::test]
    async fn fetch_http_url() {
        let url = serve_once(
            b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\nConnection: close\r\n\r\npayload",
        )
        .await;
        let source = ImageSource::parse(&url);
        assert!(matches!(source, ImageSource::HttpUrl(_)));

        let mut out = Vec::new();
        let bytes = source.copy_to(&reqwest::Client::new(), &mut out).await.unwrap();
        assert_eq!(bytes, 7);
        assert_eq!(out, b"payload");
    }

    #[tokio::test]
    async fn http_error_status_fails() {
        let url = serve_once(
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;

        let mut out = Vec::new();
        let err = ImageSource::parse(&url)
            .copy_to(&reqwest::Client::new(), &mut out)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("404"), "{}", err);
        assert!(out.is_empty());
    }
}
