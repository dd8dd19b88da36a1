use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sequence_detection::SequenceDetector;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tag_db::TagDb;
use thumbnail_cache::decode::{ExrBackend, NativeExr};
use thumbnail_cache::formats::extension;
use thumbnail_cache::{
    AssetRef, CacheStatus, ColorspaceDetector, DiskThumbnailCache, SourceInfo, ThumbnailConfig,
    ThumbnailEvent, ThumbnailWorker,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "thumbtool")]
#[command(about = "Thumbnail generation and cache maintenance for production imagery")]
struct Cli {
    /// Config file (default: ~/.assetloupe/config.json when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate thumbnails for every file and image sequence in a folder
    Generate {
        /// Folder to scan (not recursive)
        dir: PathBuf,

        /// Longest edge in pixels
        #[arg(long)]
        size: Option<u32>,

        /// Exposure adjustment in stops for float sources
        #[arg(long, allow_negative_numbers = true)]
        exposure: Option<f32>,

        /// Tag database (default: ~/.assetloupe/tags.db)
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Show disk cache statistics
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete every cached thumbnail
    Clear,

    /// Classify the working color space of a file
    Detect {
        file: PathBuf,

        /// Persist the detected tag to the tag database
        #[arg(long)]
        tag: bool,

        /// Tag database (default: ~/.assetloupe/tags.db)
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Write a config file with every option at its default
    InitConfig { file: PathBuf },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::InitConfig { file } => init_config(&file),
        Commands::Generate {
            dir,
            size,
            exposure,
            db,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(size) = size {
                config.thumbnail_size = size;
            }
            if let Some(exposure) = exposure {
                config.exposure = exposure;
            }
            generate(config.validate()?, &dir, db)
        }
        Commands::Stats { json } => show_stats(&load_config(cli.config.as_deref())?, json),
        Commands::Clear => clear_cache(&load_config(cli.config.as_deref())?),
        Commands::Detect { file, tag, db } => detect(&file, tag, db),
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<ThumbnailConfig> {
    if let Some(path) = path {
        return ThumbnailConfig::load(path);
    }
    let default_path = dirs::home_dir().map(|home| home.join(".assetloupe").join("config.json"));
    match default_path {
        Some(path) if path.is_file() => ThumbnailConfig::load(&path),
        _ => Ok(ThumbnailConfig::default()),
    }
}

fn open_tag_db(db: Option<PathBuf>) -> Result<TagDb> {
    match db {
        Some(path) => TagDb::open_at(&path),
        None => TagDb::open(),
    }
}

#[derive(Default)]
struct Tally {
    ready: usize,
    generated: usize,
    placeholders: usize,
    encrypted: usize,
    failed: usize,
}

impl Tally {
    fn record(&mut self, event: &ThumbnailEvent) {
        match event {
            ThumbnailEvent::CacheStatus {
                status: CacheStatus::Generating,
                ..
            } => self.generated += 1,
            ThumbnailEvent::Ready { path, bitmap } => {
                self.ready += 1;
                println!("  ✅ {} ({}x{})", display_name(path), bitmap.width(), bitmap.height());
            }
            ThumbnailEvent::NoThumbnail { path, reason } => {
                self.placeholders += 1;
                match reason {
                    Some(reason) => println!("  ▫️  {} ({})", display_name(path), reason),
                    None => println!("  ▫️  {}", display_name(path)),
                }
            }
            ThumbnailEvent::Encrypted { path } => {
                self.encrypted += 1;
                println!("  🔒 {} is password protected", display_name(path));
            }
            ThumbnailEvent::Failed { path, message } => {
                self.failed += 1;
                println!("  ❌ {}: {}", display_name(path), message);
            }
            ThumbnailEvent::CacheStatus { .. } | ThumbnailEvent::Progress { .. } => {}
        }
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn generate(config: ThumbnailConfig, dir: &Path, db: Option<PathBuf>) -> Result<()> {
    if !dir.is_dir() {
        bail!("Path is not a directory: {}", dir.display());
    }
    println!("🔍 Scanning {}", dir.display());

    let scan = SequenceDetector::default().scan_directory(dir)?;
    let sequence_count = scan.sequences.len();
    let mut assets: Vec<AssetRef> = scan
        .sequences
        .into_iter()
        .map(AssetRef::from_sequence)
        .collect();
    for path in scan.singles {
        match AssetRef::from_path(&path) {
            Ok(asset) => assets.push(asset),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable file"),
        }
    }

    if assets.is_empty() {
        println!("⚠️  No files found in {}", dir.display());
        return Ok(());
    }
    println!(
        "📸 Found {} files and {} sequences",
        assets.len() - sequence_count,
        sequence_count
    );

    let pdf_count = assets
        .iter()
        .filter(|asset| extension(&asset.path) == "pdf")
        .count();
    if pdf_count > 0 {
        println!("ℹ️  No PDF renderer is built in, {pdf_count} PDF files will be reported as failed");
    }

    let tags = open_tag_db(db)?;
    let (worker, events) = ThumbnailWorker::with_config(&config, Arc::new(tags))?;

    let queued = worker.enqueue_all(assets);
    let expected = queued.saturating_sub(worker.dropped() as usize);
    worker.start()?;

    let mut tally = Tally::default();
    let mut finished = 0;
    while finished < expected {
        let event = events
            .recv()
            .context("Thumbnail worker stopped before finishing")?;
        if event.is_terminal() {
            finished += 1;
        }
        tally.record(&event);
    }
    worker.shutdown();

    println!("\n📈 RESULTS");
    println!("==========");
    println!("Thumbnails: {}", tally.ready);
    println!("Generated: {}", tally.generated);
    println!("Placeholders: {}", tally.placeholders + tally.encrypted);
    println!("Failed: {}", tally.failed);
    if worker.dropped() > 0 {
        println!("Dropped (queue full): {}", worker.dropped());
    }

    let stats = worker.pipeline().disk().stats()?;
    println!(
        "💾 Cache: {} files, {:.1} MB in {}",
        stats.file_count,
        stats.cache_size_mb,
        stats.cache_dir.display()
    );
    Ok(())
}

fn open_disk_cache(config: &ThumbnailConfig) -> Result<DiskThumbnailCache> {
    let cache_dir = config.resolved_cache_dir()?;
    DiskThumbnailCache::new(&cache_dir, config.disk_cache_mb)
        .with_context(|| format!("Failed to open thumbnail cache at {}", cache_dir.display()))
}

fn show_stats(config: &ThumbnailConfig, json: bool) -> Result<()> {
    let stats = open_disk_cache(config)?.stats()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("📊 THUMBNAIL CACHE");
    println!("==================");
    println!("Directory: {}", stats.cache_dir.display());
    println!("Files: {}", stats.file_count);
    println!("Size: {:.1} MB of {:.1} MB", stats.cache_size_mb, config.disk_cache_mb);
    println!("Hits: {}", stats.hits);
    println!("Misses: {}", stats.misses);
    println!("Generated: {}", stats.generated);
    println!("Hit rate: {:.1}%", stats.hit_rate() * 100.0);
    Ok(())
}

fn clear_cache(config: &ThumbnailConfig) -> Result<()> {
    let cache = open_disk_cache(config)?;
    let removed = cache.clear()?;
    println!("🧹 Removed {} thumbnails from {}", removed, cache.cache_dir().display());
    Ok(())
}

fn detect(file: &Path, tag: bool, db: Option<PathBuf>) -> Result<()> {
    let header = if extension(file) == "exr" {
        Some(
            NativeExr
                .read_header(file)
                .with_context(|| format!("Failed to read EXR header: {}", file.display()))?,
        )
    } else {
        None
    };
    let info = match &header {
        Some(header) => SourceInfo {
            channels: Some(header.channels.len()),
            width: Some(header.width),
            height: Some(header.height),
            metadata: Some(&header.attributes),
        },
        None => SourceInfo::default(),
    };

    let detector = ColorspaceDetector::new();
    let detection = detector.classify(file, info);
    println!("🎨 {}", file.display());
    println!("  Color space: {}", detection.color);
    println!("  Rule: {:?}", detection.rule);
    println!("  View transform: {}", detection.color.view_transform());
    if header.as_ref().is_some_and(|h| h.is_deep()) {
        println!("  ⚠️  Deep data, no thumbnail will be generated");
    }

    if tag {
        let db = open_tag_db(db)?;
        match detector.auto_tag(&db, file, info)? {
            Some(found) => println!("🏷️  Tagged as {}", found.color),
            None => println!("🏷️  Not tagged (already tagged or not a scene-linear format)"),
        }
    }
    Ok(())
}

fn init_config(file: &Path) -> Result<()> {
    if file.exists() {
        bail!("Refusing to overwrite existing file: {}", file.display());
    }
    ThumbnailConfig::default().save(file)?;
    println!("📝 Wrote default config to {}", file.display());
    Ok(())
}
