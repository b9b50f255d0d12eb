use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use image_seed::source::ImageSource;
use image_seed::{
    Config, GlanceCli, ImageUploader, RequestedType, UploadOutcome, UploadRequest, Visibility,
    classify,
};

#[derive(Parser)]
#[command(name = "image-seed")]
#[command(about = "Seed an OpenStack image catalog with disk images")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Identity user name
    #[arg(long, env = "OS_USERNAME")]
    os_username: Option<String>,

    /// Identity password
    #[arg(long, env = "OS_PASSWORD", hide_env_values = true)]
    os_password: Option<String>,

    /// Identity project (tenant) name
    #[arg(long, env = "OS_PROJECT_NAME")]
    os_project_name: Option<String>,

    /// Identity endpoint
    #[arg(long, env = "OS_AUTH_URL")]
    os_auth_url: Option<String>,

    /// Image API endpoint
    #[arg(long, env = "OS_IMAGE_URL")]
    os_image_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload the images listed in the configuration file
    Upload {
        /// Only upload these images (repeatable)
        #[arg(long)]
        only: Vec<String>,
    },

    /// Upload a single image
    Image {
        /// Catalog image name
        #[arg(long)]
        name: String,

        /// Source URL or local path
        #[arg(long)]
        url: String,

        /// Image type (unknown, ami, qcow, qcow2, raw, vhd, vmdk, vdi, iso)
        #[arg(long = "type", default_value = "unknown")]
        image_type: String,

        /// Upload as a private image
        #[arg(long)]
        private: bool,

        /// Catalog id to assign
        #[arg(long)]
        id: Option<String>,
    },

    /// Show how a source would be uploaded, without side effects
    Classify {
        /// Source URL or local path
        url: String,

        /// Explicit image type
        #[arg(long = "type", default_value = "unknown")]
        image_type: String,
    },
}

impl Cli {
    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        let identity = &mut config.identity;
        for (target, value) in [
            (&mut identity.username, &self.os_username),
            (&mut identity.password, &self.os_password),
            (&mut identity.project_name, &self.os_project_name),
            (&mut identity.auth_url, &self.os_auth_url),
        ] {
            if let Some(value) = value {
                *target = value.clone();
            }
        }
        if let Some(url) = &self.os_image_url {
            config.catalog.image_api_url = url.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("image_seed=info".parse()?))
        .init();

    let cli = Cli::parse();

    let (config, requests) = match &cli.command {
        Commands::Classify { url, image_type } => {
            let requested = RequestedType::parse(image_type)?;
            let resolved = classify::resolve(requested, url)?;
            match resolved.formats() {
                Some((container, disk)) => println!(
                    "{}: bare upload, container_format={} disk_format={}",
                    url, container, disk
                ),
                None => println!(
                    "{}: ami bundle, kernel aki/aki, initrd ari/ari, image ami/ami",
                    url
                ),
            }
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Upload { only } => {
            let config = cli.load_config()?;
            let mut requests = config.requests()?;
            if !only.is_empty() {
                for name in only {
                    if !requests.iter().any(|r| &r.name == name) {
                        bail!("image '{}' is not in the configuration", name);
                    }
                }
                requests.retain(|r| only.contains(&r.name));
            }
            if requests.is_empty() {
                warn!("No images configured");
            }
            (config, requests)
        }
        Commands::Image {
            name,
            url,
            image_type,
            private,
            id,
        } => {
            let config = cli.load_config()?;
            let request = UploadRequest {
                name: name.clone(),
                source: ImageSource::parse(url),
                requested_type: RequestedType::parse(image_type)
                    .with_context(|| format!("Invalid type for image '{}'", name))?,
                visibility: Visibility::from_public(!private),
                image_id: id.clone().filter(|id| !id.trim().is_empty()),
            };
            (config, vec![request])
        }
    };

    info!(
        images = requests.len(),
        image_api = %config.catalog.image_api_url,
        "Starting image upload"
    );

    let catalog = Arc::new(GlanceCli::new(&config));
    let uploader = ImageUploader::new(
        catalog,
        config.upload.scratch_dir.clone(),
        config.upload.download_timeout(),
    );

    let report = uploader.upload_all(&requests).await;

    for (name, result) in &report.results {
        match result {
            Ok(UploadOutcome::Uploaded { image }) => println!("{}: uploaded ({})", name, image.id),
            Ok(UploadOutcome::Skipped { existing }) => {
                println!("{}: already present ({})", name, existing.id)
            }
            Err(e) => eprintln!("{}: {}: {}", name, e.kind(), e),
        }
    }

    if report.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        error!(failed = report.failed().count(), "Some images failed to upload");
        Ok(ExitCode::FAILURE)
    }
}
