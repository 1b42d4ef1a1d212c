//! Recursive folder scanner.
//!
//! Walks a watched root and yields entries for regular files. Symlinks are
//! never followed; entries the walker cannot stat are logged and skipped.
//! Cancellation is cooperative via a shared flag checked between entries.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use tracing::warn;
use walkdir::WalkDir;

use crate::mime;

const MAX_DEPTH: usize = 32;

/// A regular file discovered under a watched root.
#[derive(Debug, Clone)]
pub struct ScannedEntry {
    pub absolute_path: PathBuf,
    /// Path relative to the watched root, `/`-separated.
    pub relative_path: String,
    pub name: String,
    /// Lowercased extension without the dot; empty when absent.
    pub extension: String,
    pub size: i64,
    pub created_at: Option<i64>,
    pub modified_at: i64,
    /// Extension-based hint; refined later when bytes are read.
    pub mime_hint: String,
}

/// Lazily walk `root`, yielding scanned entries. The iterator is finite and
/// restartable (a fresh call starts a fresh walk).
pub fn scan(root: &Path, stop: Arc<AtomicBool>) -> impl Iterator<Item = ScannedEntry> {
    let root = root.to_path_buf();
    WalkDir::new(root.clone())
        .follow_links(false)
        .max_depth(MAX_DEPTH)
        .into_iter()
        .take_while(move |_| !stop.load(Ordering::SeqCst))
        .filter_map(move |entry| {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable entry");
                    return None;
                }
            };
            if !entry.file_type().is_file() {
                return None;
            }
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "stat failed");
                    return None;
                }
            };

            let relative_path = relative_slash_path(&root, entry.path())?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let extension = entry
                .path()
                .extension()
                .map(|e| e.to_string_lossy().to_ascii_lowercase())
                .unwrap_or_default();

            Some(ScannedEntry {
                mime_hint: mime::guess_from_name(&name),
                absolute_path: entry.path().to_path_buf(),
                relative_path,
                name,
                extension,
                size: metadata.len() as i64,
                created_at: metadata
                    .created()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64),
                modified_at: metadata
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0),
            })
        })
}

fn relative_slash_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            std::path::Component::Normal(os) => Some(os.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn yields_regular_files_with_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub/deeper")).unwrap();
        fs::write(dir.path().join("a.txt"), b"one").unwrap();
        fs::write(dir.path().join("sub/deeper/b.jpg"), b"two!").unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let mut entries: Vec<ScannedEntry> = scan(dir.path(), stop).collect();
        entries.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].relative_path, "a.txt");
        assert_eq!(entries[0].size, 3);
        assert_eq!(entries[0].extension, "txt");
        assert_eq!(entries[1].relative_path, "sub/deeper/b.jpg");
        assert_eq!(entries[1].name, "b.jpg");
        assert_eq!(entries[1].mime_hint, "image/jpeg");
        assert!(entries[1].modified_at > 0);
    }

    #[test]
    fn stop_flag_cuts_the_walk_short() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..20 {
            fs::write(dir.path().join(format!("f{i}.txt")), b"x").unwrap();
        }
        let stop = Arc::new(AtomicBool::new(false));
        let mut seen = 0;
        for _ in scan(dir.path(), stop.clone()) {
            seen += 1;
            if seen == 3 {
                stop.store(true, Ordering::SeqCst);
            }
        }
        assert!(seen < 20);
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("real");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("inside.txt"), b"x").unwrap();
        std::os::unix::fs::symlink(&target, dir.path().join("link")).unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let entries: Vec<ScannedEntry> = scan(dir.path(), stop).collect();
        assert!(entries
            .iter()
            .all(|e| !e.relative_path.starts_with("link/")));
    }
}
