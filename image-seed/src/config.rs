//! Configuration file schema
//!
//! A single TOML document holds the identity credentials, the catalog
//! endpoint and the list of images to seed.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::classify::{RequestedType, Visibility};
use crate::source::ImageSource;
use crate::upload::UploadRequest;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub images: Vec<ImageConfig>,
}

/// Identity service credentials
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityConfig {
    #[serde(default)]
    pub auth_url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub project_name: String,
    pub user_domain_name: Option<String>,
    pub project_domain_name: Option<String>,
    /// 2 uses tenant flags, 3 uses project and domain flags.
    #[serde(default = "default_identity_api_version")]
    pub api_version: u8,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            auth_url: String::new(),
            username: String::new(),
            password: String::new(),
            project_name: String::new(),
            user_domain_name: None,
            project_domain_name: None,
            api_version: default_identity_api_version(),
        }
    }
}

/// Image catalog endpoint and client settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CatalogConfig {
    #[serde(default = "default_image_api_url")]
    pub image_api_url: String,
    /// Catalog client executable.
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default = "default_true")]
    pub insecure: bool,
    /// 1 uses `--is-public`, 2 uses `--visibility`.
    #[serde(default = "default_image_api_version")]
    pub api_version: u8,
    #[serde(default = "default_list_timeout")]
    pub list_timeout_secs: u64,
    #[serde(default = "default_upload_timeout")]
    pub upload_timeout_secs: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            image_api_url: default_image_api_url(),
            command: default_command(),
            insecure: true,
            api_version: default_image_api_version(),
            list_timeout_secs: default_list_timeout(),
            upload_timeout_secs: default_upload_timeout(),
        }
    }
}

impl CatalogConfig {
    pub fn list_timeout(&self) -> Duration {
        Duration::from_secs(self.list_timeout_secs)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }
}

/// Local upload settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UploadConfig {
    /// Parent of the per-image scratch directories.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            scratch_dir: default_scratch_dir(),
            download_timeout_secs: default_download_timeout(),
        }
    }
}

impl UploadConfig {
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

/// One image to seed
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageConfig {
    pub name: String,
    pub url: String,
    #[serde(rename = "type", default)]
    pub image_type: Option<String>,
    #[serde(default = "default_true")]
    pub public: bool,
    #[serde(default)]
    pub id: Option<String>,
}

impl ImageConfig {
    pub fn to_request(&self) -> Result<UploadRequest> {
        let requested_type = RequestedType::parse(self.image_type.as_deref().unwrap_or(""))
            .with_context(|| format!("Invalid type for image '{}'", self.name))?;

        Ok(UploadRequest {
            name: self.name.clone(),
            source: ImageSource::parse(&self.url),
            requested_type,
            visibility: Visibility::from_public(self.public),
            image_id: self.id.clone().filter(|id| !id.trim().is_empty()),
        })
    }
}

fn default_identity_api_version() -> u8 {
    3
}

fn default_image_api_url() -> String {
    "http://127.0.0.1:9292".to_string()
}

fn default_command() -> String {
    "glance".to_string()
}

fn default_true() -> bool {
    true
}

fn default_image_api_version() -> u8 {
    2
}

fn default_list_timeout() -> u64 {
    60
}

fn default_upload_timeout() -> u64 {
    3600
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("/tmp/images")
}

fn default_download_timeout() -> u64 {
    1800
}

impl Config {
    /// Load and parse a configuration file. Call [`Config::validate`] after
    /// applying command line overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Check everything an upload run needs.
    pub fn validate(&self) -> Result<()> {
        let identity = &self.identity;
        for (field, value) in [
            ("identity.auth_url", &identity.auth_url),
            ("identity.username", &identity.username),
            ("identity.password", &identity.password),
            ("identity.project_name", &identity.project_name),
            ("catalog.image_api_url", &self.catalog.image_api_url),
            ("catalog.command", &self.catalog.command),
        ] {
            if value.trim().is_empty() {
                bail!("{} must be set", field);
            }
        }

        if !matches!(identity.api_version, 2 | 3) {
            bail!(
                "identity.api_version must be 2 or 3, got {}",
                identity.api_version
            );
        }
        if !matches!(self.catalog.api_version, 1 | 2) {
            bail!(
                "catalog.api_version must be 1 or 2, got {}",
                self.catalog.api_version
            );
        }

        let mut seen = HashSet::new();
        for image in &self.images {
            if image.name.trim().is_empty() {
                bail!("image with url {} has an empty name", image.url);
            }
            if image.url.trim().is_empty() {
                bail!("image '{}' has an empty url", image.name);
            }
            if !seen.insert(image.name.as_str()) {
                bail!("image '{}' is listed more than once", image.name);
            }
            image.to_request()?;
        }

        Ok(())
    }

    /// Upload requests for the configured images, in file order.
    pub fn requests(&self) -> Result<Vec<UploadRequest>> {
        self.images.iter().map(ImageConfig::to_request).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{DiskFormat, ImageType};

    const SAMPLE: &str = r#"
[identity]
auth_url = "http://127.0.0.1:5000/v3"
username = "admin"
password = "admin-pass"
project_name = "admin"
user_domain_name = "Default"
project_domain_name = "Default"

[catalog]
image_api_url = "http://127.0.0.1:9292/v2"

[upload]
scratch_dir = "/var/tmp/images"

[[images]]
name = "cirros"
url = "http://download.cirros-cloud.net/0.3.2/cirros-0.3.2-x86_64-disk.img"

[[images]]
name = "installer"
url = "/srv/images/installer.iso"
type = "iso"
public = false
id = "4b434528-3f4c-4b5c-8b2c-0c4f3e0a1c11"
"#;

    #[test]
    fn parses_sample() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.identity.api_version, 3);
        assert_eq!(config.catalog.command, "glance");
        assert!(config.catalog.insecure);
        assert_eq!(config.catalog.api_version, 2);
        assert_eq!(config.upload.scratch_dir, PathBuf::from("/var/tmp/images"));

        let requests = config.requests().unwrap();
        assert_eq!(requests.len(), 2);

        assert_eq!(requests[0].name, "cirros");
        assert_eq!(requests[0].requested_type, RequestedType::Auto);
        assert_eq!(requests[0].visibility, Visibility::Public);
        assert_eq!(requests[0].image_id, None);

        assert_eq!(
            requests[1].requested_type,
            RequestedType::Explicit(ImageType::Bare(DiskFormat::Iso))
        );
        assert_eq!(requests[1].visibility, Visibility::Private);
        assert_eq!(
            requests[1].image_id.as_deref(),
            Some("4b434528-3f4c-4b5c-8b2c-0c4f3e0a1c11")
        );
        assert!(matches!(requests[1].source, ImageSource::LocalFile(_)));
    }

    #[test]
    fn example_config_is_valid() {
        let config = Config::from_toml_str(include_str!("../config.example.toml")).unwrap();
        config.validate().unwrap();

        let requests = config.requests().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(
            requests[1].requested_type,
            RequestedType::Explicit(ImageType::Ami)
        );
    }

    #[test]
    fn empty_id_means_none() {
        let image = ImageConfig {
            name: "cirros".to_string(),
            url: "x.img".to_string(),
            image_type: Some("unknown".to_string()),
            public: true,
            id: Some(String::new()),
        };
        assert_eq!(image.to_request().unwrap().image_id, None);
    }

    #[test]
    fn rejects_duplicate_names() {
        let content = format!(
            "{}\n[[images]]\nname = \"cirros\"\nurl = \"other.img\"\n",
            SAMPLE
        );
        let config = Config::from_toml_str(&content).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn rejects_unknown_type_token() {
        let content = format!(
            "{}\n[[images]]\nname = \"floppy\"\nurl = \"a.flp\"\ntype = \"floppy\"\n",
            SAMPLE
        );
        let config = Config::from_toml_str(&content).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn requires_credentials() {
        let config = Config::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("identity.auth_url"));
    }

    #[test]
    fn rejects_unknown_fields() {
        assert!(Config::from_toml_str("[catalog]\nendpoint = \"x\"\n").is_err());
    }

    #[test]
    fn rejects_bad_api_version() {
        let mut config = Config::from_toml_str(SAMPLE).unwrap();
        config.catalog.api_version = 3;
        assert!(config.validate().is_err());
    }
}
