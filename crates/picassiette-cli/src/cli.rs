//! Exposes the command line application.
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use picassiette::config::Config;
use picassiette::{Picassiette, Target, TargetHandle};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::logging;
use crate::producer::Loader;

/// Picassiette commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch keys through the caches and print one line per result.
    ///
    /// Keys are file paths or `http(s)://` URLs.
    Fetch {
        /// The keys to fetch.
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Wipe the persistent store.
    Clear,

    /// Print the state of the persistent store.
    Stats,
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Overrides the cache directory of the configuration file.
    #[arg(long, global = true, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::get(cli.config.as_deref()).context("failed loading config")?;
    if let Some(cache_dir) = cli.cache_dir {
        config.cache_dir = Some(cache_dir);
    }

    let dsn = config
        .sentry_dsn
        .as_deref()
        .map(str::parse::<sentry::types::Dsn>)
        .transpose()
        .context("invalid sentry DSN")?;
    let _sentry = sentry::init(sentry::ClientOptions {
        dsn,
        release: sentry::release_name!(),
        ..Default::default()
    });

    logging::init_logging(&config);
    if let Some(ref statsd) = config.metrics.statsd {
        picassiette::metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )
        .context("failed to configure statsd")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("picassiette")
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    runtime.block_on(async {
        let picassiette = build(&config)?;
        match cli.command {
            Command::Fetch { keys } => fetch(&picassiette, keys).await,
            Command::Clear => clear(&picassiette).await,
            Command::Stats => stats(&picassiette).await,
        }
    })
}

fn build(config: &Config) -> Result<Picassiette<Bytes>> {
    let loader = Loader::new(Handle::current())?;
    let picassiette = Picassiette::builder(move |key: &str, _: &()| loader.load(key))
        .config(config)
        .size_of(|_: &str, bytes: &Bytes| bytes.len() as u64)
        .build()
        .context("failed to set up the caches")?;
    Ok(picassiette)
}

/// Forwards every delivery into a channel.
#[derive(Debug)]
struct PrintTarget {
    key: String,
    handle: TargetHandle,
    results: mpsc::UnboundedSender<(String, Option<Bytes>)>,
}

impl Target<Bytes> for PrintTarget {
    fn handle(&self) -> &TargetHandle {
        &self.handle
    }

    fn on_receive(&self, value: Option<Bytes>) {
        let _ = self.results.send((self.key.clone(), value));
    }
}

async fn fetch(picassiette: &Picassiette<Bytes>, keys: Vec<String>) -> Result<()> {
    if let Some(cache) = picassiette.cache() {
        cache.ready().await;
    }

    let (sender, mut results) = mpsc::unbounded_channel();
    let targets: Vec<_> = keys
        .into_iter()
        .map(|key| {
            let target = Arc::new(PrintTarget {
                key: key.clone(),
                handle: TargetHandle::new(),
                results: sender.clone(),
            });
            picassiette.fetch(&key, (), &target);
            target
        })
        .collect();
    drop(sender);

    picassiette.wait_idle().await;
    drop(targets);

    let mut missing = 0;
    while let Some((key, value)) = results.recv().await {
        match value {
            Some(bytes) => println!("{key}\t{}", bytes.len()),
            None => {
                println!("{key}\tnone");
                missing += 1;
            }
        }
    }

    // persist everything for the next run
    if let Some(cache) = picassiette.cache() {
        cache.evict_all();
        cache.flush().await;
    }

    if missing > 0 {
        anyhow::bail!("{missing} keys could not be loaded");
    }
    Ok(())
}

async fn clear(picassiette: &Picassiette<Bytes>) -> Result<()> {
    let Some(cache) = picassiette.cache() else {
        anyhow::bail!("caching is disabled");
    };
    cache.ready().await;
    picassiette.clear_cache();
    cache.ready().await;

    if let Some(disk) = cache.disk() {
        tracing::info!(path = %disk.dir().display(), "Cleared persistent store");
    }
    Ok(())
}

async fn stats(picassiette: &Picassiette<Bytes>) -> Result<()> {
    let Some(disk) = picassiette.cache().and_then(|cache| cache.disk()) else {
        anyhow::bail!("no persistent store configured");
    };
    disk.ready().await;

    println!("path\t{}", disk.dir().display());
    println!("entries\t{}", disk.len());
    println!("size\t{}", disk.size());
    println!("capacity\t{}", disk.capacity());
    Ok(())
}
