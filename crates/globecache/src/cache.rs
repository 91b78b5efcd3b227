//! Maintenance of the cache directory.

use anyhow::{Result, bail};
use globecache_service::caching::{CacheStore, HasCacheManager};
use globecache_service::config::Config;
use globecache_service::services::GlobeServices;

/// Enforces the size budget and removes stray files from the configured cache.
///
/// A dry run only reports by how much the cache is over budget, and what else would be removed.
pub fn cleanup(config: &Config, dry_run: bool) -> Result<()> {
    let settings = &config.cache;
    if !settings.enabled() {
        bail!("the cache is disabled");
    }

    // opening an over-budget store evicts right away
    let budget = if dry_run { u64::MAX } else { settings.max_size() };
    let store = CacheStore::open(settings.dir(), budget)?;
    let stats = store.cleanup(dry_run)?;

    if dry_run {
        let excess = store.resident_size().saturating_sub(settings.max_size());
        println!("Would evict at least {excess} bytes to get under budget");
        println!(
            "Would remove {} files and {} directories, totaling {} bytes",
            stats.removed_files, stats.removed_dirs, stats.removed_bytes
        );
    } else {
        println!(
            "Removed {} files and {} directories, totaling {} bytes",
            stats.removed_files, stats.removed_dirs, stats.removed_bytes
        );
    }
    println!(
        "Retained {} files, totaling {} bytes",
        stats.retained_files, stats.retained_bytes
    );
    Ok(())
}

/// Removes all entries from the configured cache.
pub fn clear(config: Config) -> Result<()> {
    let services = GlobeServices::new(config)?;
    let before = services.cache_manager().stats();
    if !before.enabled {
        bail!("the cache is disabled");
    }
    services.cache_manager().clear()?;
    println!(
        "Removed {} entries, totaling {} bytes",
        before.entries, before.resident_bytes
    );
    Ok(())
}

/// Prints a summary of the configured cache.
pub fn stats(config: Config) -> Result<()> {
    let services = GlobeServices::new(config)?;
    let stats = services.cache_manager().stats();
    println!("directory: {}", stats.dir.display());
    println!("enabled:   {}", stats.enabled);
    println!("entries:   {}", stats.entries);
    println!("resident:  {} bytes", stats.resident_bytes);
    println!("budget:    {} bytes", stats.budget);
    Ok(())
}
