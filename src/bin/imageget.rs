use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use log::debug;
use tokio_util::sync::CancellationToken;

use imageget::{
    credentials::DockerConfigCredentials,
    oci_layout::OciLayoutStore,
    progress::{LogProgress, ProgressSink, TerminalProgress},
    skopeo::SkopeoTransfer,
    GetterConfig, ImageGetter, Platform, PlatformSet, PullPolicy,
};

/// imageget
#[derive(Debug, Parser)]
#[clap(name = "imageget", version)]
pub struct App {
    /// OCI image layout directory holding the local images
    #[clap(long, env = "IMAGEGET_STORE")]
    store: PathBuf,

    /// When to pull from the registry: always, missing or never
    #[clap(long, default_value = "missing")]
    pull: String,

    /// Platforms the image must have content for, like linux/arm64/v8 (default: all)
    #[clap(long, value_delimiter = ',')]
    platform: Vec<Platform>,

    /// Docker executable used for docker:// references
    #[clap(long, env = "DOCKER")]
    docker: Option<PathBuf>,

    /// Podman executable used for podman:// references
    #[clap(long, env = "PODMAN")]
    podman: Option<PathBuf>,

    /// skopeo executable used for pulls and imports
    #[clap(long, env = "SKOPEO", default_value = "skopeo")]
    skopeo: PathBuf,

    /// Check platform completeness again after pulling additional platforms
    #[clap(long)]
    verify_after_pull: bool,

    /// Log progress messages instead of drawing progress bars
    #[clap(long)]
    no_progress: bool,

    /// Image references, like nginx, quay.io/org/app:v1 or docker://local:dev
    #[clap(required = true)]
    images: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = App::parse();

    let policy: PullPolicy = args.pull.parse()?;
    let platforms = PlatformSet::new(args.platform);
    let config = GetterConfig {
        docker: args.docker.filter(|path| !path.as_os_str().is_empty()),
        podman: args.podman.filter(|path| !path.as_os_str().is_empty()),
        verify_after_corrective_pull: args.verify_after_pull,
    };

    std::fs::create_dir_all(&args.store)
        .with_context(|| format!("creating store at {}", args.store.display()))?;
    let store = Arc::new(OciLayoutStore::new(&args.store));
    let transfer = Arc::new(SkopeoTransfer::new(&args.store).with_skopeo(&args.skopeo));
    let progress: Arc<dyn ProgressSink> = if args.no_progress {
        Arc::new(LogProgress)
    } else {
        Arc::new(TerminalProgress::new())
    };
    let getter = ImageGetter::new(
        config,
        store,
        transfer,
        Arc::new(DockerConfigCredentials::from_env()),
        progress,
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                debug!("Interrupted");
                cancel.cancel();
            }
        }
    });

    for image in &args.images {
        let record = getter.get(image, &platforms, policy, &cancel).await?;
        println!(
            "{} {} {}",
            record.name,
            record.target.digest(),
            record.target.media_type()
        );
    }
    Ok(())
}
