//! Recursive directory scanner.
//!
//! Depth-first walk with an explicit stack, so depth is bounded and the
//! cancellation probe is trivial. Entries whose name begins with `.` are
//! skipped; non-directory entries are filtered through the factory and
//! handed to the caller's continuation.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::decoder::DecoderFactory;

pub fn scan_folder<F>(
    root: &Path,
    factory: &DecoderFactory,
    cancelled: &dyn Fn() -> bool,
    on_file: &mut F,
) where
    F: FnMut(PathBuf),
{
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        if cancelled() {
            debug!(dir = %dir.display(), "scan cancelled");
            return;
        }
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %dir.display(), %err, "cannot enumerate directory");
                continue;
            }
        };
        for entry in entries {
            if cancelled() {
                return;
            }
            let Ok(entry) = entry else { continue };
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let path = entry.path();
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if is_dir {
                stack.push(path);
            } else if factory.is_supported(&path) {
                on_file(path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::OpenMode;
    use std::fs::File;

    fn touch(path: &Path) {
        File::create(path).unwrap();
    }

    fn collect(root: &Path, cancelled: &dyn Fn() -> bool) -> Vec<PathBuf> {
        let factory = DecoderFactory::new(OpenMode::Direct);
        let mut found = Vec::new();
        scan_folder(root, &factory, cancelled, &mut |p| found.push(p));
        found.sort();
        found
    }

    #[test]
    fn walks_recursively_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("a.flac"));
        touch(&dir.path().join("b.mp3"));
        touch(&dir.path().join("cover.jpg"));
        touch(&dir.path().join("notes.txt"));
        let sub = dir.path().join("disc2");
        fs::create_dir(&sub).unwrap();
        touch(&sub.join("c.ogg"));
        touch(&sub.join("readme.md"));

        let found = collect(dir.path(), &|| false);
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["a.flac", "b.mp3", "c.ogg"]);
    }

    #[test]
    fn hidden_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join(".hidden.flac"));
        let hidden_dir = dir.path().join(".cache");
        fs::create_dir(&hidden_dir).unwrap();
        touch(&hidden_dir.join("d.mp3"));
        touch(&dir.path().join("visible.mp3"));

        let found = collect(dir.path(), &|| false);
        assert_eq!(found.len(), 1);
        assert!(found[0].ends_with("visible.mp3"));
    }

    #[test]
    fn cancellation_stops_the_walk() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..20 {
            touch(&dir.path().join(format!("{i:02}.mp3")));
        }
        let found = collect(dir.path(), &|| true);
        assert!(found.is_empty());
    }

    #[test]
    fn missing_directory_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("nope");
        let found = collect(&gone, &|| false);
        assert!(found.is_empty());
    }
}
