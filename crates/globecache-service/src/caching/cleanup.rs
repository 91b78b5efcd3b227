use std::fs::{read_dir, remove_dir, remove_file};
use std::io;
use std::path::Path;

use anyhow::Result;

use super::metadata;
use super::store::CacheStore;

/// Counters collected during [`CacheStore::cleanup`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupStats {
    pub removed_dirs: usize,
    pub removed_files: usize,
    pub removed_bytes: u64,

    pub retained_dirs: usize,
    pub retained_files: usize,
    pub retained_bytes: u64,
}

impl CacheStore {
    /// Runs a maintenance pass over the store.
    ///
    /// This enforces the size budget, and removes orphaned metadata files, stray temporary
    /// files and empty directories. If `dry_run` is `true`, no files will actually be deleted.
    pub fn cleanup(&self, dry_run: bool) -> Result<CleanupStats> {
        tracing::info!("Cleaning up cache at `{}`", self.root().display());
        let mut stats = CleanupStats::default();

        self.with_index(|index| {
            if dry_run {
                for relative in index.eviction_victims(None) {
                    if let Some(entry) = index.entries.get(&relative) {
                        tracing::debug!("Would evict `{relative}`");
                        stats.removed_files += 1;
                        stats.removed_bytes += entry.size;
                    }
                }
            } else {
                let (count, bytes) = self.evict(index, None);
                stats.removed_files += count;
                stats.removed_bytes += bytes;
            }
        });

        self.cleanup_tmp(&mut stats, dry_run)?;
        self.cleanup_directory_recursive(self.files_dir(), &mut stats, dry_run)?;

        tracing::info!(
            "Retained {} directories and {} files, totaling {} bytes",
            stats.retained_dirs,
            stats.retained_files,
            stats.retained_bytes,
        );
        tracing::info!(
            "Removed {} directories and {} files, totaling {} bytes",
            stats.removed_dirs,
            stats.removed_files,
            stats.removed_bytes
        );

        metric!(gauge("caches.size.files") = stats.retained_files as u64);
        metric!(gauge("caches.size.bytes") = stats.retained_bytes);
        metric!(counter("caches.size.files_removed") += stats.removed_files as i64);
        metric!(counter("caches.size.bytes_removed") += stats.removed_bytes as i64);

        Ok(stats)
    }

    /// Removes temporary files that survived a crash.
    fn cleanup_tmp(&self, stats: &mut CleanupStats, dry_run: bool) -> Result<()> {
        let entries = match catch_not_found(|| read_dir(self.tmp_dir()))? {
            Some(x) => x,
            None => return Ok(()),
        };
        for entry in entries {
            let path = entry?.path();
            let Some(md) = catch_not_found(|| path.metadata())? else {
                continue;
            };
            if !md.is_file() {
                continue;
            }
            tracing::debug!("Removing temp file `{}`", path.display());
            if !dry_run {
                catch_not_found(|| remove_file(&path))?;
            }
            stats.removed_files += 1;
            stats.removed_bytes += md.len();
        }
        Ok(())
    }

    /// Removes stray files below `path`.
    ///
    /// Returns `true` if nothing is left in the directory.
    fn cleanup_directory_recursive(
        &self,
        directory: &Path,
        stats: &mut CleanupStats,
        dry_run: bool,
    ) -> Result<bool> {
        let entries = match catch_not_found(|| read_dir(directory))? {
            Some(x) => x,
            None => {
                tracing::warn!("Directory not found: `{}`", directory.display());
                return Ok(true);
            }
        };
        tracing::debug!("Cleaning directory `{}`", directory.display());

        let mut is_empty = true;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                let mut dir_is_empty = self.cleanup_directory_recursive(&path, stats, dry_run)?;
                if dir_is_empty {
                    tracing::debug!("Removing directory `{}`", path.display());
                    if !dry_run && let Err(e) = remove_dir(&path) {
                        tracing::error!("Failed to clean cache directory: {:?}", e);
                        dir_is_empty = false;
                    }
                }
                if dir_is_empty {
                    stats.removed_dirs += 1;
                } else {
                    stats.retained_dirs += 1;
                }
                is_empty &= dir_is_empty;
            } else {
                match self.try_cleanup_path(&path, stats, dry_run) {
                    Err(e) => tracing::error!("Failed to clean cache file: {:?}", e),
                    Ok(file_removed) => is_empty &= file_removed,
                }
            }
        }

        Ok(is_empty)
    }

    /// Tries to clean up the file at `path`, returning `true` if it was removed.
    ///
    /// Blobs are only ever removed by eviction, this removes orphaned metadata files.
    fn try_cleanup_path(
        &self,
        path: &Path,
        stats: &mut CleanupStats,
        dry_run: bool,
    ) -> Result<bool> {
        tracing::trace!("Checking file `{}`", path.display());
        let Some(md) = catch_not_found(|| path.metadata())? else {
            return Ok(true);
        };
        anyhow::ensure!(md.is_file(), "not a file");
        let size = md.len();

        let is_orphan = metadata::is_metadata_path(path) && !metadata::blob_path(path).exists();
        if is_orphan {
            tracing::debug!("Removing orphaned metadata `{}`", path.display());
            if !dry_run {
                catch_not_found(|| remove_file(path))?;
            }
            stats.removed_bytes += size;
            stats.removed_files += 1;
            return Ok(true);
        }

        stats.retained_bytes += size;
        stats.retained_files += 1;
        Ok(false)
    }
}

fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
