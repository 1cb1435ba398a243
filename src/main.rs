use std::{collections::HashSet, error::Error, path::PathBuf, process, sync::Arc};

use clap::{command, Parser, ValueHint};
use log::{debug, error, info, LevelFilter};
use url::Url;

use cadenza::{
    cache::ResolutionCache,
    cipher::ScriptTransformer,
    config::Config,
    db::MetadataStore,
    downloads::DownloadManager,
    platform::{HttpPlatform, Platform},
    resolver::StreamResolver,
    source::AudioSource,
    store::StreamStore,
    track::{Connectivity, Quality, QualityPreference, TrackId},
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when built in release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base URL of the platform API serving player responses.
    #[arg(long, value_name = "URL", value_hint = ValueHint::Url)]
    api_base: Url,

    /// Base URL the platform serves its player scripts from.
    #[arg(long, value_name = "URL", value_hint = ValueHint::Url)]
    script_base: Url,

    /// Directory for the byte-range store and metadata database.
    #[arg(long, value_name = "DIR", value_hint = ValueHint::DirPath, default_value = "cadenza-cache")]
    cache_dir: PathBuf,

    /// Byte-range store capacity in MiB.
    #[arg(long, value_name = "MIB", default_value_t = 512)]
    cache_capacity: u64,

    /// Maximum number of concurrent downloads.
    #[arg(long, value_name = "N", default_value_t = Config::DEFAULT_MAX_CONCURRENT_DOWNLOADS)]
    concurrency: usize,

    /// Fixed quality tier (basic, standard or high).
    ///
    /// Without this, the tier is picked automatically from the network
    /// class.
    #[arg(short = 'Q', long, value_name = "TIER")]
    quality: Option<Quality>,

    /// Treat the network as metered and prefer small streams.
    #[arg(long, default_value_t = false)]
    constrained: bool,

    /// Tracks to download.
    #[arg(value_name = "TRACK_ID", required = true)]
    track_ids: Vec<TrackId>,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence
/// from highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you
        // should probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            0 => {
                // Quiet and verbose are mutually exclusive, and
                // `verbose` is 0 by default. So this arm means: quiet
                // mode.
                LevelFilter::Warn
            }
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module("cadenza", level);
    }

    logger.init();
}

/// Main application loop: wires up the subsystem, queues the requested
/// tracks and follows their download events until every one settles.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let mut config = Config::with_cache_dir(args.api_base, args.script_base, args.cache_dir);
    config.cache_capacity = args.cache_capacity * 1024 * 1024;
    config.max_concurrent_downloads = args.concurrency;
    config.preference = args
        .quality
        .map_or(QualityPreference::Auto, QualityPreference::Fixed);
    config.connectivity = if args.constrained {
        Connectivity::Constrained
    } else {
        Connectivity::Unmetered
    };

    let platform: Arc<dyn Platform> = Arc::new(HttpPlatform::new(&config)?);
    let transformer = Arc::new(ScriptTransformer::new(Arc::clone(&platform)));
    let resolver = Arc::new(StreamResolver::new(Arc::clone(&platform), transformer));
    let cache = Arc::new(ResolutionCache::new(config.resolution_cache_ceiling));
    let store = Arc::new(StreamStore::open(&config.cache_dir.join("streams"), config.cache_capacity).await?);
    let db = Arc::new(MetadataStore::open(&config.db_path).await?);

    let source = Arc::new(AudioSource::new(
        store,
        cache,
        resolver,
        platform,
        Arc::clone(&db),
        config.preference,
        config.connectivity,
        config.resolve_timeout,
    ));

    let manager = Arc::new(DownloadManager::new(
        source,
        db,
        config.max_concurrent_downloads,
    ));
    manager.restore().await?;

    let mut events = manager.subscribe();
    for track_id in args.track_ids {
        manager.enqueue(track_id);
    }

    let mut pending: HashSet<TrackId> = manager
        .snapshot()
        .into_iter()
        .filter(|(_, state)| !state.is_terminal())
        .map(|(track_id, _)| track_id)
        .collect();

    while !pending.is_empty() {
        tokio::select! {
            // Prioritize shutdown signals.
            biased;

            _ = tokio::signal::ctrl_c() => {
                info!("shutting down gracefully");
                manager.shutdown();
                break;
            }

            event = events.recv() => match event {
                Ok(event) => {
                    info!("{}: {:?}", event.track_id, event.state);
                    if event.state.is_terminal() {
                        pending.remove(&event.track_id);
                    }
                }
                Err(e) => {
                    debug!("event stream closed: {e}");
                    break;
                }
            },
        }
    }

    for (track_id, state) in manager.snapshot() {
        info!("final state of {track_id}: {state:?}");
    }

    Ok(())
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command
/// line arguments, and starts the main application loop.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}
