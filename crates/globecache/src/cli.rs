//! Exposes the command line application.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use globecache_service::config::Config;
use globecache_service::metrics;
use url::Url;

use crate::cache;
use crate::fetch;
use crate::logging;

/// The kind of tiles requested with `globecache tile`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum TileKind {
    Elevation,
    Texture,
}

impl TileKind {
    /// The file suffix of this kind of tile on a tile server.
    pub fn default_suffix(self) -> &'static str {
        match self {
            TileKind::Elevation => "bin",
            TileKind::Texture => "dds.gz",
        }
    }
}

/// Globecache commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch a document through the cache.
    Fetch {
        /// The URL of the document.
        url: Url,

        /// Write the document to this file instead of stdout.
        #[arg(long, short, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Load tiles of a tile pyramid through the cache.
    Tile {
        /// The base URL of the tile pyramid.
        #[arg(long, value_name = "URL")]
        base: Url,

        /// The kind of tiles.
        #[arg(long, value_enum)]
        kind: TileKind,

        /// The file suffix of the tiles, defaults to the one of the tile kind.
        #[arg(long)]
        suffix: Option<String>,

        /// Position codes of the tiles to load.
        #[arg(required = true, value_name = "POS_CODE")]
        tiles: Vec<String>,
    },

    /// Enforce the cache budget and remove stray files.
    Cleanup {
        /// Only report what would be removed.
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove all entries from the cache.
    Clear,

    /// Print a summary of the cache.
    Stats,
}

/// Command line interface parser.
#[derive(Parser, Debug)]
#[command(bin_name = "globecache", version)]
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
        release: Some(concat!("globecache@", env!("CARGO_PKG_VERSION")).into()),
        ..Default::default()
    });

    // SAFETY: we are still single-threaded at this point.
    unsafe { logging::init_logging(&config) };
    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone()
            && let Some(name) = hostname::get().ok().and_then(|s| s.into_string().ok())
        {
            tags.insert(tag, name);
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd, tags)
            .context("failed to configure metrics")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("globecache-io")
        .enable_all()
        .build()?;
    runtime.block_on(run(config, cli.command))
}

async fn run(config: Config, command: Command) -> Result<()> {
    match command {
        Command::Fetch { url, output } => fetch::fetch_document(config, &url, output.as_deref())
            .await
            .context("failed to fetch document")?,
        Command::Tile {
            base,
            kind,
            suffix,
            tiles,
        } => {
            let suffix = suffix.unwrap_or_else(|| kind.default_suffix().to_owned());
            fetch::load_tiles(config, base, kind, &suffix, &tiles)
                .await
                .context("failed to load tiles")?
        }
        Command::Cleanup { dry_run } => {
            cache::cleanup(&config, dry_run).context("failed to clean up the cache")?
        }
        Command::Clear => cache::clear(config).context("failed to clear the cache")?,
        Command::Stats => cache::stats(config)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_tile() {
        let cli = Cli::try_parse_from([
            "globecache",
            "tile",
            "--base",
            "http://example.com/elevation/",
            "--kind",
            "elevation",
            "103",
            "1032",
        ])
        .unwrap();
        assert!(cli.config().is_none());
        let Command::Tile {
            kind,
            suffix,
            tiles,
            ..
        } = cli.command
        else {
            panic!("expected the tile command");
        };
        assert_eq!(kind, TileKind::Elevation);
        assert_eq!(suffix, None);
        assert_eq!(tiles, ["103", "1032"]);
    }

    #[test]
    fn test_global_config() {
        let cli =
            Cli::try_parse_from(["globecache", "cleanup", "--dry-run", "-c", "a.yml"]).unwrap();
        assert_eq!(cli.config(), Some(Path::new("a.yml")));
        assert!(matches!(cli.command, Command::Cleanup { dry_run: true }));
    }
}
