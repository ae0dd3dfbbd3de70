use std::cell::OnceCell;
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Every file below `root`, depth-first with entries sorted by name, so the
/// order is stable for an unchanged tree. Symlinks are never descended into;
/// a link to a file is listed, a link to a directory is skipped.
pub fn walk(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .min_depth(1)
    {
        let entry = entry?;
        let file_type = entry.file_type();
        if file_type.is_file() || (file_type.is_symlink() && entry.path().is_file()) {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// A local file whose size is read on first use and then kept for the
/// lifetime of one planning pass.
#[derive(Debug)]
pub struct LocalFileRef {
    path: PathBuf,
    len: OnceCell<u64>,
}

impl LocalFileRef {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            len: OnceCell::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> io::Result<u64> {
        if let Some(len) = self.len.get() {
            return Ok(*len);
        }
        let len = std::fs::metadata(&self.path)?.len();
        Ok(*self.len.get_or_init(|| len))
    }
}
