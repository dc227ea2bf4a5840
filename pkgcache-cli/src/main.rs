mod config;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use config::Config;
use pkgcache_core::{
    ChunkUtils, ContentAddressedResolver, ReaderResolver, S3Storage, StorageServer,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "pkgcache")]
#[command(about = "Store and fetch packages and build artifacts across storage backends")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "pkgcache.yaml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show whether an object exists and how it is stored
    Check {
        class: String,
        dir: String,
        address: String,
    },
    /// Write an object to stdout or a file
    Get {
        class: String,
        dir: String,
        address: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Store a local file
    Put {
        class: String,
        file: PathBuf,
        #[arg(long, default_value = "")]
        dir: String,
        #[arg(long, default_value = "")]
        address: String,
        /// Split the object into chunks readable while it is written
        #[arg(long)]
        chunked: bool,
        /// Name the object after the SHA256 of its content
        #[arg(long, conflicts_with_all = ["chunked", "dir", "address"])]
        content_addressed: bool,
    },
    /// Remove an object
    Rm {
        class: String,
        dir: String,
        address: String,
    },
    /// List stored objects as JSON lines
    Ls { class: String },
    /// Move an object to another class
    Mv {
        from: String,
        to: String,
        dir: String,
        address: String,
    },
    /// Copy an object to another class
    Cp {
        from: String,
        to: String,
        dir: String,
        address: String,
    },
    /// Report disk usage of a class
    Usage { class: String },
    /// Print where an object lives
    Locate {
        class: String,
        dir: String,
        address: String,
    },
    /// Check bucket permissions of an s3 class
    Validate { class: String },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pkgcache=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let cfg = match Config::from_file(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(&cfg, cli.command).await {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn open(
    cfg: &Config,
    chunker: &ChunkUtils,
    class: &str,
) -> anyhow::Result<Arc<dyn StorageServer>> {
    cfg.build_storage(class, chunker)
        .await
        .with_context(|| format!("opening storage class {}", class))
}

async fn run(cfg: &Config, command: Commands) -> anyhow::Result<()> {
    let chunker = cfg.chunker();

    match command {
        Commands::Check {
            class,
            dir,
            address,
        } => {
            let storage = open(cfg, &chunker, &class).await?;
            match storage.check(&dir, &address).await? {
                Some(info) => println!("{}", serde_json::to_string(&info)?),
                None => bail!("{} not found in {}", storage.locate(&dir, &address), class),
            }
        }
        Commands::Get {
            class,
            dir,
            address,
            output,
        } => {
            let storage = open(cfg, &chunker, &class).await?;
            let found = storage
                .get(&dir, &address)
                .await?
                .with_context(|| format!("{} not found", storage.locate(&dir, &address)))?;

            let mut reader = found.reader;
            let copied = match output {
                Some(path) => {
                    let mut file = tokio::fs::File::create(&path)
                        .await
                        .with_context(|| format!("creating {}", path.display()))?;
                    tokio::io::copy(&mut reader, &mut file).await?
                }
                None => tokio::io::copy(&mut reader, &mut tokio::io::stdout()).await?,
            };
            tracing::info!("Read {} bytes from {}", copied, storage.locate(&dir, &address));
        }
        Commands::Put {
            class,
            file,
            dir,
            address,
            chunked,
            content_addressed,
        } => {
            let storage = open(cfg, &chunker, &class).await?;
            let source = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("opening {}", file.display()))?;

            let key = if content_addressed {
                let mut resolver = ContentAddressedResolver::new(source);
                storage.put(&mut resolver, "", "").await?
            } else if chunked {
                let size = source.metadata().await?.len();
                let mut resolver = ReaderResolver::new(source);
                storage.put_chunked(&mut resolver, &dir, &address, size).await?
            } else {
                let mut resolver = ReaderResolver::new(source);
                storage.put(&mut resolver, &dir, &address).await?
            };
            tracing::info!("Stored {} in {}", key, class);
            println!("{}", storage.locate(&key.dir, &key.address));
        }
        Commands::Rm {
            class,
            dir,
            address,
        } => {
            let storage = open(cfg, &chunker, &class).await?;
            storage.remove(&dir, &address).await?;
        }
        Commands::Ls { class } => {
            let storage = open(cfg, &chunker, &class).await?;
            let mut items = storage.enumerate().await?;
            items.sort();
            for item in items {
                println!("{}", serde_json::to_string(&item)?);
            }
        }
        Commands::Mv {
            from,
            to,
            dir,
            address,
        } => {
            let source = open(cfg, &chunker, &from).await?;
            let dest = open(cfg, &chunker, &to).await?;
            source.move_to(&dir, &address, dest.as_ref()).await?;
            tracing::info!("Moved {}/{} from {} to {}", dir, address, from, to);
        }
        Commands::Cp {
            from,
            to,
            dir,
            address,
        } => {
            let source = open(cfg, &chunker, &from).await?;
            let dest = open(cfg, &chunker, &to).await?;
            source.copy_to(&dir, &address, dest.as_ref()).await?;
            tracing::info!("Copied {}/{} from {} to {}", dir, address, from, to);
        }
        Commands::Usage { class } => {
            let storage = open(cfg, &chunker, &class).await?;
            let usage = storage.calculate_usage().await?;
            println!("{}: {}", storage.dir(), usage);
        }
        Commands::Locate {
            class,
            dir,
            address,
        } => {
            let storage = open(cfg, &chunker, &class).await?;
            println!("{}", storage.locate(&dir, &address));
        }
        Commands::Validate { class } => {
            let storage = open(cfg, &chunker, &class).await?;
            let Some(s3) = storage.base().as_any().downcast_ref::<S3Storage>() else {
                bail!(
                    "class {} uses {} storage; only s3 classes can be validated",
                    class,
                    cfg.destination(&class)?
                );
            };
            s3.validate().await?;
            tracing::info!("Validated access to {}", storage.dir());
        }
    }

    Ok(())
}
