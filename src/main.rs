//! Pack Cache - card pack engine
//!
//! Keeps a bounded working set of card images cached across storage tiers and
//! deals rarity-weighted packs from it, either once from the command line or
//! over HTTP.

use clap::Parser;
use pack_cache::{
    Catalog, EngineConfig, LabelClassifier, ManifestCatalog, PackEngine, PackSpec,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Card pack engine - caches card images and deals rarity-weighted packs
#[derive(Parser, Debug)]
#[command(name = "pack_cache")]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory holding the card database and the mirror tiers
    #[arg(short, long, default_value_t = default_data_dir())]
    data_dir: String,

    /// CSV manifest of available cards (set_id,set_name,card_number,image_url,rarity,name)
    #[arg(short, long)]
    manifest: Option<PathBuf>,

    /// Base URL for rows without an image URL ({base}/{set_id}/{card_number}.png)
    #[arg(long)]
    image_base_url: Option<String>,

    /// Working-set ceiling
    #[arg(long, default_value_t = pack_cache::config::DEFAULT_CAP)]
    cap: usize,

    /// Cards per pack
    #[arg(long, default_value_t = pack_cache::config::DEFAULT_PACK_SIZE)]
    pack_size: usize,

    /// Unshown count that triggers a background refill
    #[arg(long, default_value_t = pack_cache::config::DEFAULT_REFILL_THRESHOLD)]
    refill_threshold: usize,

    /// Concurrent image fetches per wave
    #[arg(long, default_value_t = pack_cache::config::DEFAULT_WAVE_WIDTH)]
    wave_width: usize,

    /// Per-image fetch timeout in seconds
    #[arg(long, default_value_t = 10)]
    fetch_timeout_secs: u64,

    /// Byte quota of the file mirror tier
    #[arg(long, default_value_t = pack_cache::config::DEFAULT_MIRROR_QUOTA_BYTES)]
    mirror_quota_bytes: u64,

    /// Port for the HTTP API
    #[arg(long, default_value_t = 8080)]
    web_port: u16,

    /// Warm up, refill if needed, open one pack, print it and exit
    #[arg(long, default_value_t = false)]
    once: bool,
}

/// Returns the default data directory: ~/.local/share/pack_cache
fn default_data_dir() -> String {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pack_cache")
        .to_string_lossy()
        .to_string()
}

impl Args {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            cap: self.cap,
            pack_size: self.pack_size,
            refill_threshold: self.refill_threshold,
            wave_width: self.wave_width,
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            mirror_quota_bytes: self.mirror_quota_bytes,
            ..EngineConfig::default()
        }
    }
}

#[tokio::main]
async fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let data_dir = PathBuf::from(&args.data_dir);

    log::info!("Starting pack_cache...");
    log::info!("Data directory: {}", data_dir.display());

    let catalog: Arc<dyn Catalog> = match &args.manifest {
        Some(path) => match ManifestCatalog::from_path(path, args.image_base_url.as_deref()) {
            Ok(catalog) => Arc::new(catalog),
            Err(e) => {
                log::error!("Failed to load manifest {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => {
            log::warn!("No manifest given, only cached cards can be dealt");
            Arc::new(ManifestCatalog::default())
        }
    };

    let engine = match PackEngine::open(
        &data_dir,
        catalog,
        Arc::new(LabelClassifier),
        args.engine_config(),
    )
    .await
    {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            log::error!("Failed to open pack engine: {}", e);
            std::process::exit(1);
        }
    };

    if args.once {
        run_once(&engine).await;
        return;
    }

    match engine.start().await {
        Ok(decision) => log::info!("Refill policy on startup: {:?}", decision),
        Err(e) => log::error!("Warmup failed, serving from an empty mirror: {}", e),
    }

    tokio::select! {
        result = pack_cache::web::serve(Arc::clone(&engine), args.web_port) => {
            if let Err(e) = result {
                log::error!("Web server error: {}", e);
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down");
        }
    }
}

/// Single pass: warm up, refill if needed, deal one pack to stdout
async fn run_once(engine: &PackEngine) {
    match engine.warm_and_fill().await {
        Ok(Some(report)) => log::info!(
            "Refill acquired {} cards ({} failed)",
            report.acquired,
            report.failed
        ),
        Ok(None) => {}
        Err(e) => log::warn!("Refill failed: {}", e),
    }

    let spec = PackSpec::with_size(engine.config().pack_size);
    let pack = match engine.open_pack(&spec).await {
        Ok(pack) => pack,
        Err(e) => {
            log::error!("Failed to open pack: {}", e);
            std::process::exit(1);
        }
    };

    let summaries: Vec<_> = pack.cards.iter().map(|c| c.summary()).collect();
    match serde_json::to_string_pretty(&summaries) {
        Ok(json) => println!("{}", json),
        Err(e) => log::error!("Failed to serialize pack: {}", e),
    }

    if let Ok(status) = engine.status().await {
        log::info!(
            "{} of {} cached cards unshown (tier: {})",
            status.unshown_count,
            status.mirror_count,
            status.active_tier
        );
    }
}
