//! Safelisted cache clearing.
//!
//! Only a fixed set of directories is ever touched: the image-gen cache root
//! and the `cache` and `uploads` children of the chat UI data directory. The
//! directories themselves are kept; only their contents are removed.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::CacheClearError;
use crate::logs::{LogSink, LogSource};

/// Children of the chat UI data directory that only hold regenerable data.
pub const CHAT_UI_CACHE_SUBDIRS: [&str; 2] = ["cache", "uploads"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTarget {
    pub label: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearOutcome {
    Cleared { removed: usize },
    Missing,
}

/// Builds the safelist from the configured roots.
pub fn safelisted_targets(image_cache_root: Option<&Path>, chat_data_dir: Option<&Path>) -> Vec<CacheTarget> {
    let mut targets = Vec::new();
    if let Some(root) = image_cache_root {
        targets.push(CacheTarget {
            label: "image-gen cache".into(),
            path: root.to_path_buf(),
        });
    }
    if let Some(data_dir) = chat_data_dir {
        for name in CHAT_UI_CACHE_SUBDIRS {
            targets.push(CacheTarget {
                label: format!("chat-ui {}", name),
                path: data_dir.join(name),
            });
        }
    }
    targets
}

/// Clears every target, logging one line per target. A failure on one target
/// does not stop the others.
pub fn clean(targets: &[CacheTarget], sink: &LogSink) -> Vec<Result<ClearOutcome, CacheClearError>> {
    let mut results = Vec::with_capacity(targets.len());
    for target in targets {
        let result = clear_contents(&target.path);
        match &result {
            Ok(ClearOutcome::Cleared { removed }) => sink.notice(
                LogSource::Supervisor,
                format!(
                    "cleared {} ({} entries removed from {})",
                    target.label,
                    removed,
                    target.path.display()
                ),
            ),
            Ok(ClearOutcome::Missing) => sink.notice(
                LogSource::Supervisor,
                format!("{} not present at {}, skipped", target.label, target.path.display()),
            ),
            Err(err) => sink.warning(LogSource::Supervisor, err.to_string()),
        }
        results.push(result);
    }
    results
}

/// Removes everything inside `dir` but keeps `dir` itself.
///
/// Every entry is attempted; the first failure is returned afterwards.
pub fn clear_contents(dir: &Path) -> Result<ClearOutcome, CacheClearError> {
    let clear_error = |path: &Path, source: io::Error| CacheClearError {
        path: path.to_path_buf(),
        source,
    };
    let meta = match fs::symlink_metadata(dir) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(ClearOutcome::Missing),
        Err(err) => return Err(clear_error(dir, err)),
    };
    if !meta.is_dir() {
        return Err(clear_error(
            dir,
            io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
        ));
    }

    let mut removed = 0;
    let mut first_error = None;
    for entry in fs::read_dir(dir).map_err(|err| clear_error(dir, err))? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                first_error.get_or_insert(clear_error(dir, err));
                continue;
            }
        };
        let path = entry.path();
        let result = match entry.file_type() {
            Ok(kind) if kind.is_dir() => fs::remove_dir_all(&path),
            Ok(_) => fs::remove_file(&path),
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => removed += 1,
            Err(err) => {
                first_error.get_or_insert(clear_error(&path, err));
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(ClearOutcome::Cleared { removed }),
    }
}
