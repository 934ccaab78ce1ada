//! newsvault - post files to Usenet and fetch them back

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use newsvault::codec::ObfuscationCodec;
use newsvault::config::Config;
use newsvault::download::{DownloadJob, DownloadRetriever, DownloadRunner};
use newsvault::network::{
    ArticleRateLimiter, BandwidthThrottle, ConnectionPool, NntpSession, ServerHealthTracker,
    TcpConnector, Transport,
};
use newsvault::queue::{Direction, EntityType, Priority, QueueState, TransferQueue, WorkerPool};
use newsvault::segment::{FileManifest, FilePacker};
use newsvault::store::SqliteStore;
use newsvault::upload::{UploadJob, UploadOptions, UploadPipeline, UploadRunner};
use newsvault::TransferError;

const MANIFEST_SUFFIX: &str = ".manifest.json";

#[derive(Parser)]
#[command(name = "newsvault")]
#[command(about = "Store files on Usenet with redundancy", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "newsvault.toml")]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Segment, protect and post files
    Upload {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Folder the files belong to (keys the internal subjects)
        #[arg(long)]
        folder: Option<String>,

        /// Where to write the manifests
        #[arg(short, long, default_value = ".")]
        manifest_dir: PathBuf,

        #[arg(long)]
        high_priority: bool,

        /// Bundle files smaller than half a segment together
        #[arg(long)]
        pack: bool,
    },

    /// Fetch, repair and reassemble files from their manifests
    Download {
        #[arg(required = true)]
        manifests: Vec<PathBuf>,

        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,
    },

    /// Check every configured server
    Health {
        /// Newsgroup to select on each server
        #[arg(short, long)]
        group: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
    newsvault::metrics::init_metrics();

    let config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let store = open_store(&config).await?;
    let transport = build_transport(&config, &store).await?;

    let result = match cli.command {
        Commands::Upload {
            files,
            folder,
            manifest_dir,
            high_priority,
            pack,
        } => {
            let priority = if high_priority {
                Priority::High
            } else {
                Priority::Normal
            };
            let options = UploadRequest {
                folder,
                manifest_dir,
                priority,
                pack,
            };
            upload(&config, &store, transport.clone(), &files, options).await
        }
        Commands::Download {
            manifests,
            output_dir,
        } => download(&config, &store, transport.clone(), &manifests, &output_dir).await,
        Commands::Health { group } => health(&config, &store, &transport, group).await,
    };

    transport.pool().close().await;
    result
}

/// The configured database, or a scratch in-memory one.
async fn open_store(config: &Config) -> Result<SqliteStore> {
    let store = match &config.store_path {
        Some(path) => SqliteStore::open(path)
            .await
            .with_context(|| format!("opening {}", path.display()))?,
        None => SqliteStore::new_in_memory().await?,
    };
    Ok(store)
}

async fn build_transport(config: &Config, store: &SqliteStore) -> Result<Arc<Transport>> {
    let health = Arc::new(ServerHealthTracker::new());
    health.restore(store.load_server_health().await?);

    let connector = TcpConnector::new(
        config.network.connect_timeout(),
        config.network.io_timeout(),
    )?;
    let pool = ConnectionPool::new(
        config.servers.clone(),
        config.network.max_connections,
        config.network.checkout_timeout(),
        Arc::new(connector),
        health,
    );
    Ok(Arc::new(Transport::new(
        Arc::new(pool),
        config.retry.clone(),
        Arc::new(BandwidthThrottle::new(config.network.max_rate_bytes())),
        ArticleRateLimiter::new(config.network.max_articles_per_second),
    )))
}

/// Pauses every unfinished item on Ctrl-C so workers stop at the next
/// segment boundary.
fn pause_on_interrupt<J: Send + Sync + 'static>(
    queue: Arc<TransferQueue<J>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!(queue = queue.name(), "Interrupted, pausing transfers");
        for item in queue.items() {
            if !item.state.is_terminal() {
                let _ = queue.pause(&item.queue_id);
            }
        }
        queue.close();
    })
}

/// Prints one line per item and fails if any item did not complete.
fn summarize<J: Send + Sync + 'static>(queue: &TransferQueue<J>) -> Result<()> {
    let mut unfinished = 0;
    for item in queue.items() {
        match item.state {
            QueueState::Completed => println!("{}  completed", item.entity_id),
            state => {
                unfinished += 1;
                match &item.error_message {
                    Some(message) => {
                        println!("{}  {}: {message}", item.entity_id, state.as_str())
                    }
                    None => println!("{}  {}", item.entity_id, state.as_str()),
                }
            }
        }
    }
    if unfinished > 0 {
        bail!("{unfinished} transfer(s) did not complete");
    }
    Ok(())
}

struct UploadRequest {
    folder: Option<String>,
    manifest_dir: PathBuf,
    priority: Priority,
    pack: bool,
}

async fn upload(
    config: &Config,
    store: &SqliteStore,
    transport: Arc<Transport>,
    files: &[PathBuf],
    request: UploadRequest,
) -> Result<()> {
    let UploadRequest {
        folder,
        manifest_dir,
        priority,
        pack,
    } = request;
    let secret = config
        .secret_key
        .as_deref()
        .ok_or(TransferError::MissingSecret)?;
    let codec = Arc::new(ObfuscationCodec::from_hex(secret)?);
    let pipeline = UploadPipeline::new(codec, transport, UploadOptions::from_config(config))?;
    let folder_id = folder.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let queue = TransferQueue::new("upload");
    let writer = store.persist_queue(queue.subscribe());

    let packer = pack
        .then(|| FilePacker::new(config.pipeline.segment_size))
        .transpose()?;
    let mut small = Vec::new();
    let mut names = Vec::with_capacity(files.len());
    for path in files {
        let data = Bytes::from(
            tokio::fs::read(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?,
        );
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        if packer.is_some_and(|p| p.should_pack(data.len())) {
            small.push((name, data));
            continue;
        }
        let file_id = uuid::Uuid::new_v4().to_string();
        info!(file = %path.display(), %file_id, bytes = data.len(), "Queued for upload");
        queue.enqueue(
            file_id.clone(),
            EntityType::File,
            Direction::Upload,
            priority,
            UploadJob::new(file_id.clone(), folder_id.clone(), data),
        )?;
        names.push((file_id, name));
    }
    let bundles = match packer {
        Some(packer) => packer.pack(&small)?,
        None => Vec::new(),
    };
    for bundle in bundles {
        let file_id = bundle.pack_id.clone();
        info!(%file_id, files = bundle.entries.len(), bytes = bundle.data.len(), "Queued bundle for upload");
        queue.enqueue(
            file_id.clone(),
            EntityType::File,
            Direction::Upload,
            priority,
            UploadJob::bundle(folder_id.clone(), bundle),
        )?;
        names.push((file_id.clone(), format!("pack-{file_id}")));
    }

    let runner = Arc::new(UploadRunner::new(Arc::new(pipeline), Some(store.clone())));
    let interrupt = pause_on_interrupt(queue.clone());
    WorkerPool::start(queue.clone(), runner, config.workers.upload_workers)
        .shutdown(&queue)
        .await;
    interrupt.abort();
    let _ = interrupt.await;

    tokio::fs::create_dir_all(&manifest_dir).await?;
    for (file_id, name) in &names {
        let Some(manifest) = store.load_manifest(file_id).await? else {
            continue;
        };
        let target = manifest_dir.join(format!("{name}{MANIFEST_SUFFIX}"));
        tokio::fs::write(&target, serde_json::to_vec_pretty(&manifest)?).await?;
        info!(manifest = %target.display(), posted = manifest.is_fully_posted(), "Manifest written");
    }

    let result = summarize(&queue);
    drop(queue);
    let _ = writer.await;
    result
}

async fn download(
    config: &Config,
    store: &SqliteStore,
    transport: Arc<Transport>,
    manifests: &[PathBuf],
    output_dir: &Path,
) -> Result<()> {
    let queue = TransferQueue::new("download");
    let writer = store.persist_queue(queue.subscribe());

    for path in manifests {
        let raw = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let manifest: FileManifest = serde_json::from_slice(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;
        // a bundle restores its members into the output directory
        let output = if manifest.is_packed() {
            output_dir.to_path_buf()
        } else {
            output_dir.join(output_name(path, &manifest))
        };
        queue.enqueue(
            manifest.file_id.clone(),
            EntityType::File,
            Direction::Download,
            Priority::Normal,
            DownloadJob::new(manifest, output),
        )?;
    }

    let mut retriever = DownloadRetriever::new(transport, config.workers.segment_concurrency);
    if let Some(cache) = config.cache.build() {
        retriever = retriever.with_cache(Arc::new(cache));
    }
    let retriever = Arc::new(retriever);
    let runner = Arc::new(DownloadRunner::new(retriever.clone(), Some(store.clone())));
    let interrupt = pause_on_interrupt(queue.clone());
    WorkerPool::start(queue.clone(), runner, config.workers.download_workers)
        .shutdown(&queue)
        .await;
    interrupt.abort();
    let _ = interrupt.await;

    if let Some(cache) = retriever.cache() {
        let stats = cache.stats();
        info!(
            hits = stats.hits,
            misses = stats.misses,
            evictions = stats.evictions,
            hit_rate = stats.hit_rate(),
            "Segment cache"
        );
    }

    let result = summarize(&queue);
    drop(queue);
    let _ = writer.await;
    result
}

/// `photo.jpg.manifest.json` restores to `photo.jpg`.
fn output_name(manifest_path: &Path, manifest: &FileManifest) -> String {
    manifest_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .and_then(|n| n.strip_suffix(MANIFEST_SUFFIX).map(str::to_string))
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| manifest.file_id.clone())
}

async fn health(
    config: &Config,
    store: &SqliteStore,
    transport: &Transport,
    group: Option<String>,
) -> Result<()> {
    let pool = transport.pool();
    let group = group.or_else(|| config.pipeline.newsgroups.first().cloned());

    for server in pool.servers() {
        let mut session = match pool.checkout_from(&server).await {
            Ok(session) => session,
            Err(e) => {
                println!("{server}  unreachable: {e}");
                continue;
            }
        };
        let started = std::time::Instant::now();
        let alive = session.session().is_alive().await;
        let elapsed = started.elapsed().as_millis() as u64;
        pool.health()
            .update_health(&server, alive, alive.then_some(elapsed));
        if !alive {
            session.mark_broken();
            println!("{server}  not responding");
            continue;
        }

        match &group {
            Some(name) => match session.session().group(name).await {
                Ok(info) => println!(
                    "{server}  ok  {} ms  {} has {} articles",
                    elapsed, info.name, info.count
                ),
                Err(e) => {
                    session.observe(&e);
                    println!("{server}  ok  {} ms  group {name}: {e}", elapsed);
                }
            },
            None => println!("{server}  ok  {elapsed} ms"),
        }
    }

    for record in pool.health().snapshot() {
        println!(
            "{}  {}  success {:.0}%  failures in a row {}",
            record.server,
            record.status.as_str(),
            record.success_rate() * 100.0,
            record.consecutive_failures
        );
    }
    store.save_health_snapshot(&pool.health().snapshot()).await?;
    Ok(())
}
