//! Exposes the command line application.
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shardcache_service::caching::ShardCache;
use shardcache_service::config::Config;
use shardcache_service::metrics;
use shardcache_store::CacheKey;

use crate::logging;

/// Shardcache commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Recover the cache directory, evict down to capacity, and print the cache stats.
    Recover,

    /// Download remote files into the cache and print their local paths.
    Fetch {
        /// Remote paths of the files.
        #[arg(required = true, value_name = "PATH")]
        paths: Vec<String>,
    },

    /// Pin remote files in the cache, print their local paths, and release them again.
    Open {
        /// Remote paths of the files.
        #[arg(required = true, value_name = "PATH")]
        paths: Vec<String>,
    },
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(bin_name = "shardcache", version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: The runtime is created below, there are no other threads yet.
    unsafe { logging::init_logging(&config) };
    configure_metrics(&config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("shardcache")
        .enable_all()
        .build()
        .context("failed to create the runtime")?;

    let mut stdout = io::stdout().lock();
    runtime.block_on(run(&config, cli.command, &mut stdout))
}

fn configure_metrics(config: &Config) -> Result<()> {
    let Some(ref statsd) = config.metrics.statsd else {
        return Ok(());
    };

    let mut tags = config.metrics.custom_tags.clone();
    if let Some(tag) = config.metrics.hostname_tag.clone() {
        if let Some(hostname) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
            tags.insert(tag, hostname);
        }
    }

    metrics::configure_statsd(&config.metrics.prefix, statsd.as_str(), tags)
        .context("failed to configure statsd")
}

fn parse_key(path: &str) -> Result<CacheKey> {
    CacheKey::parse(path).with_context(|| format!("invalid remote path `{path}`"))
}

async fn run(config: &Config, command: Command, out: &mut impl Write) -> Result<()> {
    let store = config
        .store
        .as_ref()
        .context("no store configured! Did you provide a path to your config file?")?
        .build();
    let cache = ShardCache::initialize(config.cache_config()?, store)
        .context("failed to initialize the cache")?;

    match command {
        Command::Recover => {
            serde_json::to_writer_pretty(&mut *out, &cache.stats())?;
            writeln!(out)?;
        }
        Command::Fetch { paths } => {
            for path in paths {
                let key = parse_key(&path)?;
                let local_path = cache
                    .materialize_transient(&key)
                    .await
                    .with_context(|| format!("failed to fetch `{path}`"))?;
                writeln!(out, "{key}\t{}", local_path.display())?;
            }
        }
        Command::Open { paths } => {
            let mut handles = Vec::with_capacity(paths.len());
            for path in paths {
                let key = parse_key(&path)?;
                let handle = cache
                    .open_scoped(&key)
                    .await
                    .with_context(|| format!("failed to open `{path}`"))?;
                writeln!(out, "{}\t{}", handle.key(), handle.local_path().display())?;
                handles.push(handle);
            }
            for handle in handles {
                handle.close();
            }
        }
    }

    tracing::debug!(stats = ?cache.stats(), "Finished");
    Ok(())
}
