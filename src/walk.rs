//! Deterministic top-down directory traversal.

use std::{
    io,
    path::{Path, PathBuf},
};

use log::warn;
use walkdir::WalkDir;

/// What the walker should do after visiting a directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Descend,
    SkipSubtree,
}

/// One directory and the sorted names of everything in it that is not a
/// directory
#[derive(Debug)]
pub struct DirEntries {
    pub path: PathBuf,
    pub files: Vec<String>,
}

impl DirEntries {
    fn read(path: &Path) -> io::Result<Self> {
        let mut files = Vec::new();
        for entry in WalkDir::new(path)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry?;
            // symlinks are reported but never followed
            if !entry.file_type().is_dir() {
                files.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            files,
        })
    }

    pub fn has_file(&self, name: &str) -> bool {
        self.files.binary_search_by(|f| f.as_str().cmp(name)).is_ok()
    }
}

/// Walk the tree under `root` top-down in sorted order, calling `visit` on
/// every directory before any of its children. Returning
/// [Visit::SkipSubtree] keeps the walker out of that directory's children.
/// Failing to read `root` is an error; subdirectories that cannot be read
/// are logged and skipped.
pub fn walk<E, F>(root: &Path, mut visit: F) -> Result<(), E>
where
    E: From<io::Error>,
    F: FnMut(&DirEntries) -> Result<Visit, E>,
{
    let mut it = WalkDir::new(root).sort_by_file_name().into_iter();
    while let Some(entry) = it.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => return Err(io::Error::from(e).into()),
            Err(e) => {
                warn!("skipping part of the job tree: {e}");
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        let entries = match DirEntries::read(entry.path()) {
            Ok(entries) => entries,
            Err(e) if entry.depth() == 0 => return Err(e.into()),
            Err(e) => {
                warn!("skipping {}: {e}", entry.path().display());
                it.skip_current_dir();
                continue;
            }
        };
        if visit(&entries)? == Visit::SkipSubtree {
            it.skip_current_dir();
        }
    }
    Ok(())
}
