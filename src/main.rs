use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use imgferry::config::AppConfig;
use imgferry::registry::RegistryClient;
use imgferry::{
    Artifact, ContentStore, Descriptor, ImageReference, MediaType, OciStore, Platform, PushStore,
    Resolver, TreeWalker,
};

/// Copy OCI images and indexes between registries and local stores
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Platform to pick from multi-platform indexes (os/arch[/variant])
    #[arg(short, long, global = true)]
    platform: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a reference and print its root descriptor
    Resolve { reference: String },

    /// Copy an image or index with all its blobs
    Copy {
        reference: String,

        /// Push to this registry reference instead of the configured store
        #[arg(long)]
        to: Option<String>,

        /// Name to record in the local store's index.json
        #[arg(long)]
        tag: Option<String>,

        /// Copy only the image matching the platform, not the whole index
        #[arg(long)]
        single: bool,
    },

    /// Upload a file as a blob
    Push {
        file: PathBuf,
        reference: String,

        #[arg(long, default_value = "application/octet-stream")]
        media_type: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    Registry::default()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .init();

    let cli = Cli::parse();

    let config = AppConfig::load()?;
    info!("Loaded configuration: {:?}", config);

    let platform = match &cli.platform {
        Some(platform) => Platform::from_str(platform).map_err(anyhow::Error::msg)?,
        None => config.platform()?,
    };

    let registry = Arc::new(RegistryClient::new(config.registry.clone()));
    let resolver = Resolver::new(registry.clone()).with_platform(platform);

    match cli.command {
        Commands::Resolve { reference } => {
            let (name, descriptor) = resolver.resolve(&reference).await?;
            println!("{}", name);
            println!("{}", serde_json::to_string_pretty(&descriptor)?);
        }
        Commands::Copy {
            reference,
            to,
            tag,
            single,
        } => {
            let resolvable = resolver.get(&reference).await?;
            let artifact = if single {
                Artifact::Image(resolvable.as_single_artifact().await?)
            } else {
                resolvable.resolve().await?
            };
            let descriptor = artifact.descriptor().clone();
            let walker = TreeWalker::default();

            match to {
                Some(destination) => {
                    let destination = ImageReference::from_str(&destination)?;
                    let store: Arc<dyn ContentStore> =
                        Arc::new(PushStore::new(resolver.pusher(&destination.to_string()).await?));
                    walker.transfer_artifact(artifact.clone(), &store).await?;
                    if destination.digest.is_none() {
                        let raw = artifact.raw_manifest().await?;
                        registry.tag(&destination, &descriptor, raw).await?;
                    }
                    info!(destination = %destination, digest = %descriptor.digest, "Copy complete");
                }
                None => {
                    let store = Arc::new(OciStore::new(&config.storage).await?);
                    let dyn_store: Arc<dyn ContentStore> = store.clone();
                    walker.transfer_artifact(artifact.clone(), &dyn_store).await?;
                    let name = tag.unwrap_or_else(|| resolvable.reference().identifier());
                    store.tag(&name, &descriptor).await?;
                    info!(%name, digest = %descriptor.digest, "Copy complete");
                }
            }
            println!("{}", descriptor.digest);
        }
        Commands::Push {
            file,
            reference,
            media_type,
        } => {
            let content = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let descriptor = Descriptor::for_content(MediaType::from(media_type), &content);
            let pusher = resolver.pusher(&reference).await?;

            let mut session = pusher.push(&descriptor).await?;
            for chunk in content.chunks(config.registry.chunk_size.max(1)) {
                session.write(chunk).await?;
            }
            info!(offset = session.status()?.offset, "Upload written");
            session.commit(descriptor.size, &descriptor.digest).await?;
            println!("{}", session.digest());
        }
    }

    Ok(())
}
