//! Work-directory path rebasing used when a checkpoint is resumed on a
//! different machine or scratch directory.

use std::path::{Path, PathBuf};

/// Re-resolve `path` for a new work directory.
///
/// Relative paths are joined onto `to`; absolute paths under `from` are
/// moved under `to`; any other absolute path (e.g. a file already copied to
/// its final destination) is returned unchanged.
#[must_use]
pub fn rebase_path(path: &Path, from: &Path, to: &Path) -> PathBuf {
    if path.is_relative() {
        return to.join(path);
    }
    match path.strip_prefix(from) {
        Ok(rest) if rest.as_os_str().is_empty() => to.to_path_buf(),
        Ok(rest) => to.join(rest),
        Err(_) => path.to_path_buf(),
    }
}

/// Types holding file paths that must follow the work directory on resume.
pub trait Rebase {
    /// Rewrite every contained path with [`rebase_path`].
    fn rebase(&mut self, from: &Path, to: &Path);
}

impl Rebase for PathBuf {
    fn rebase(&mut self, from: &Path, to: &Path) {
        *self = rebase_path(self, from, to);
    }
}

impl<T: Rebase> Rebase for Vec<T> {
    fn rebase(&mut self, from: &Path, to: &Path) {
        for item in self {
            item.rebase(from, to);
        }
    }
}

impl<T: Rebase> Rebase for Option<T> {
    fn rebase(&mut self, from: &Path, to: &Path) {
        if let Some(inner) = self {
            inner.rebase(from, to);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_resolve_against_new_dir() {
        let p = rebase_path(Path::new("Alignment/s1.bam"), Path::new("/old"), Path::new("/new"));
        assert_eq!(p, PathBuf::from("/new/Alignment/s1.bam"));
    }

    #[test]
    fn paths_under_old_dir_move() {
        let p = rebase_path(
            Path::new("/scratch/a/s1/s1.trim.fastq"),
            Path::new("/scratch/a"),
            Path::new("/scratch/b"),
        );
        assert_eq!(p, PathBuf::from("/scratch/b/s1/s1.trim.fastq"));
    }

    #[test]
    fn foreign_absolute_paths_are_left_alone() {
        let p = rebase_path(
            Path::new("/data/final/s1.bam"),
            Path::new("/scratch/a"),
            Path::new("/scratch/b"),
        );
        assert_eq!(p, PathBuf::from("/data/final/s1.bam"));
    }

    #[test]
    fn sibling_prefix_is_not_a_match() {
        let p = rebase_path(
            Path::new("/scratch/ab/file"),
            Path::new("/scratch/a"),
            Path::new("/scratch/b"),
        );
        assert_eq!(p, PathBuf::from("/scratch/ab/file"));
    }
}
