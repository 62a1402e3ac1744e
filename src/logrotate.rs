//! Service log rotation using zstd.
//!
//! Before each launch, a log at or above `rotate_bytes` is compressed to
//! `{log}.{timestamp}.zst` and the original removed. Only the newest `keep`
//! archives survive.

use std::path::{Path, PathBuf};

/// Rotate `log` if it has grown past `rotate_bytes`. Returns the archive path.
///
/// Errors are logged, never returned: a log that cannot be rotated keeps
/// growing, which is no worse than not rotating at all.
pub fn rotate_if_needed(log: &Path, rotate_bytes: u64, keep: usize) -> Option<PathBuf> {
    if rotate_bytes == 0 {
        return None;
    }
    let size = std::fs::metadata(log).map(|m| m.len()).unwrap_or(0);
    if size < rotate_bytes {
        return None;
    }

    let stamp = chrono::Local::now().format("%Y%m%dT%H%M%S");
    let archive = archive_path(log, &stamp.to_string());
    match compress_file(log, &archive) {
        Ok(()) => {
            tracing::info!(
                log = %log.display(),
                archive = %archive.display(),
                bytes = size,
                "rotated service log"
            );
            prune_archives(log, keep);
            Some(archive)
        }
        Err(e) => {
            tracing::warn!(error = %e, log = %log.display(), "failed to rotate service log");
            None
        }
    }
}

fn archive_path(log: &Path, stamp: &str) -> PathBuf {
    let name = log
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "service.log".to_string());
    log.with_file_name(format!("{name}.{stamp}.zst"))
}

/// Compress `src` into `dest` and remove `src`. Streams, so the log is
/// never held in memory.
fn compress_file(src: &Path, dest: &Path) -> std::io::Result<()> {
    let input = std::fs::File::open(src)?;
    let output = std::fs::File::create(dest)?;
    if let Err(e) = zstd::stream::copy_encode(input, output, 3) {
        let _ = std::fs::remove_file(dest);
        return Err(e);
    }
    std::fs::remove_file(src)?;
    Ok(())
}

/// Archives of `log`, oldest first. Timestamps sort lexically.
fn archives(log: &Path) -> Vec<PathBuf> {
    let Some(dir) = log.parent() else {
        return Vec::new();
    };
    let Some(name) = log.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return Vec::new();
    };
    let prefix = format!("{name}.");
    let mut found: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(".zst"))
            })
            .collect(),
        Err(_) => return Vec::new(),
    };
    found.sort();
    found
}

fn prune_archives(log: &Path, keep: usize) {
    let all = archives(log);
    let excess = all.len().saturating_sub(keep);
    for old in &all[..excess] {
        if let Err(e) = std::fs::remove_file(old) {
            tracing::warn!(error = %e, file = %old.display(), "failed to remove old log archive");
        } else {
            tracing::debug!(file = %old.display(), "removed old log archive");
        }
    }
}
