use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use tokio::io::AsyncWriteExt;

use ctrdisk::{
    archive::FilterSpec,
    config::StorageConfig,
    datastore::LocalDatastore,
    operation::Operation,
    placement::{Host, HostPolicy, RandomHostPolicy, StaticInventory},
    storage::{self, backend::ResourcePool, mount::locked_disk_filter, Resolver, Store},
    ContainerStore,
};

#[derive(Parser, Debug)]
#[command(name = "ctrdisk", about = "Resolve and export container disks")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, short, default_value = "ctrdisk.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the device address backing a container
    Resolve { id: String },
    /// List the powered-on holders of a container's disk
    Owners { id: String },
    /// Write a tar snapshot of a container's filesystem
    Export {
        id: String,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        exclude: Vec<String>,
        #[arg(long)]
        include: Vec<String>,
        #[arg(long)]
        strip: Option<String>,
        #[arg(long)]
        rebase: Option<String>,
        /// Write headers only
        #[arg(long)]
        headers_only: bool,
    },
    /// Print hosts in recommended placement order
    Hosts { names: Vec<String> },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("ctrdisk: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = if cli.config.exists() {
        StorageConfig::load(&cli.config)?
    } else {
        tracing::warn!(
            "config {} not found, using defaults",
            cli.config.display()
        );
        StorageConfig::default()
    };

    let mut op = Operation::new("ctrdisk");
    if let Some(timeout) = config.operation_timeout() {
        op = op.with_timeout(timeout);
    }
    let cancel = op.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    match cli.command {
        Command::Hosts { names } => hosts(&op, &config, names).await,
        Command::Resolve { id } => {
            let store = open_store(&op, config).await?;
            println!("{}", store.url(&op, &id).await?);
            Ok(())
        }
        Command::Owners { id } => {
            let store = open_store(&op, config).await?;
            let address = store.url(&op, &id).await?;
            for holder in store.owners(&op, &address, &locked_disk_filter).await? {
                println!("{}\t{}", holder.name, holder.power_state);
            }
            Ok(())
        }
        Command::Export {
            id,
            out,
            exclude,
            include,
            strip,
            rebase,
            headers_only,
        } => {
            let mut spec = FilterSpec {
                strip_path: strip.unwrap_or_default(),
                rebase_path: rebase.unwrap_or_default(),
                ..Default::default()
            };
            for p in exclude {
                spec.exclude(p);
            }
            for p in include {
                spec.include(p);
            }
            let store = open_store(&op, config).await?;
            export(&op, &store, &id, &spec, !headers_only, &out).await
        }
    }
}

async fn hosts(
    op: &Operation,
    config: &StorageConfig,
    names: Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let policy = RandomHostPolicy::new(Arc::new(StaticInventory::from_config(&config.cluster)));
    let candidates = if names.is_empty() {
        None
    } else {
        Some(names.into_iter().map(Host::new).collect())
    };
    for host in policy.recommend(op, candidates).await? {
        println!("{}", host.name);
    }
    Ok(())
}

async fn open_store(op: &Operation, config: StorageConfig) -> ctrdisk::Result<ContainerStore> {
    let backend = Arc::new(LocalDatastore::from_config(&config));
    let pool = ResourcePool(config.resource_pool.clone());
    storage::init(op, backend.as_ref(), &pool, config).await?;
    ContainerStore::new(backend)
}

async fn export(
    op: &Operation,
    store: &ContainerStore,
    id: &str,
    spec: &FilterSpec,
    data: bool,
    out: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let source = store.new_data_source(op, id).await?;
    let res = async {
        let mut stream = source.export(op, spec, data).await?;
        let mut file = tokio::fs::File::create(out).await?;
        let mut written = 0usize;
        while let Some(chunk) = stream.try_next().await? {
            file.write_all(&chunk).await?;
            written += chunk.len();
        }
        file.flush().await?;
        tracing::info!("exported {} bytes to {}", written, out.display());
        Ok::<_, Box<dyn std::error::Error>>(())
    }
    .await;
    source.close().await?;
    res
}
