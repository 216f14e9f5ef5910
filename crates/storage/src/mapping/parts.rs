//! Part files: naming, creation and discovery in growth directories

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use pmobj_core::limits::PART_ALIGN;
use pmobj_core::{Error, Result};
use tracing::warn;

const PART_SUFFIX: &str = ".pmem";
const TEMP_SUFFIX: &str = ".pmem.tmp";

/// Name of part `index` inside a growth directory
pub fn part_file_name(index: usize) -> String {
    format!("{:06}{}", index, PART_SUFFIX)
}

fn temp_file_name(index: usize) -> String {
    format!(".{:06}{}", index, TEMP_SUFFIX)
}

/// Index encoded in a part file name, if it is one
pub fn parse_part_index(name: &str) -> Option<usize> {
    let digits = name.strip_suffix(PART_SUFFIX)?;
    if digits.len() != 6 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Open an existing file for mapping
pub(crate) fn open_rw(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().read(true).write(true).open(path)?)
}

/// Create a new file of `size` bytes, failing if it exists
pub(crate) fn create_sized(path: &Path, size: u64) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => Error::PoolExists(path.to_path_buf()),
            _ => Error::Io(e),
        })?;
    file.set_len(size)?;
    file.sync_all()?;
    Ok(file)
}

/// A part file staged under a temporary name
pub(crate) struct StagedPart {
    temp: PathBuf,
    target: PathBuf,
}

impl StagedPart {
    /// Create `dir/.NNNNNN.pmem.tmp` of `size` bytes, synced
    pub(crate) fn create(dir: &Path, index: usize, size: u64) -> Result<Self> {
        let temp = dir.join(temp_file_name(index));
        let target = dir.join(part_file_name(index));
        if target.exists() {
            return Err(Error::PoolExists(target));
        }
        // Left behind by an earlier grow that could not clean up.
        if temp.exists() {
            fs::remove_file(&temp)?;
        }
        create_sized(&temp, size)?;
        Ok(StagedPart { temp, target })
    }

    /// Rename into place; the part becomes visible to a reopen
    ///
    /// On failure the temporary file is removed.
    pub(crate) fn commit(self) -> Result<PathBuf> {
        if let Err(e) = fs::rename(&self.temp, &self.target) {
            self.abort();
            return Err(e.into());
        }
        Ok(self.target)
    }

    /// Remove the temporary file
    pub(crate) fn abort(self) {
        let _ = fs::remove_file(&self.temp);
    }
}

/// Rename every staged part into place, or none of them
///
/// If a rename fails, parts already renamed are unlinked and the rest are
/// aborted.
pub(crate) fn commit_staged(staged: Vec<StagedPart>) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::with_capacity(staged.len());
    let mut pending = staged.into_iter();
    while let Some(part) = pending.next() {
        match part.commit() {
            Ok(path) => paths.push(path),
            Err(e) => {
                remove_parts(&paths);
                pending.for_each(StagedPart::abort);
                return Err(e);
            }
        }
    }
    Ok(paths)
}

/// Unlink part files created by a grow that did not complete
pub(crate) fn remove_parts(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = fs::remove_file(path) {
            warn!(target: "pmobj::mapper", path = %path.display(), error = %e, "Failed to remove part");
        }
    }
}

/// Sync a directory so renames inside it are durable
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// A part file found in a growth directory
#[derive(Debug, Clone)]
pub(crate) struct FoundPart {
    pub(crate) index: usize,
    pub(crate) dir: usize,
    pub(crate) path: PathBuf,
    pub(crate) len: u64,
}

/// List the parts of one replica across its directories, in index order
///
/// Stray temporary files from an interrupted growth are removed.
///
/// # Errors
///
/// Returns `Corruption` if indices are not contiguous from zero or a part
/// size is not page aligned.
pub(crate) fn scan_directories(dirs: &[PathBuf]) -> Result<Vec<FoundPart>> {
    let mut found = Vec::new();
    for (d, dir) in dirs.iter().enumerate() {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(TEMP_SUFFIX) {
                warn!(target: "pmobj::mapper", path = %entry.path().display(), "Removing stray part from interrupted growth");
                fs::remove_file(entry.path())?;
                continue;
            }
            if let Some(index) = parse_part_index(&name) {
                found.push(FoundPart {
                    index,
                    dir: d,
                    path: entry.path(),
                    len: entry.metadata()?.len(),
                });
            }
        }
    }
    found.sort_by_key(|p| p.index);

    for (expected, part) in found.iter().enumerate() {
        if part.index != expected {
            return Err(Error::Corruption(format!(
                "part {} missing before {}",
                expected,
                part.path.display()
            )));
        }
        if part.len == 0 || part.len % PART_ALIGN != 0 {
            return Err(Error::Corruption(format!(
                "part {} has unaligned size {}",
                part.path.display(),
                part.len
            )));
        }
    }
    Ok(found)
}

/// True if any directory already holds part files
pub(crate) fn any_parts_exist(dirs: &[PathBuf]) -> Result<Option<PathBuf>> {
    for dir in dirs {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if parse_part_index(&entry.file_name().to_string_lossy()).is_some() {
                return Ok(Some(entry.path()));
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_names() {
        assert_eq!(part_file_name(3), "000003.pmem");
        assert_eq!(parse_part_index("000003.pmem"), Some(3));
        assert_eq!(parse_part_index("3.pmem"), None);
        assert_eq!(parse_part_index(".000003.pmem.tmp"), None);
    }

    #[test]
    fn test_scan_orders_across_directories_and_drops_temps() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        create_sized(&a.path().join(part_file_name(0)), 8192).unwrap();
        create_sized(&b.path().join(part_file_name(1)), 4096).unwrap();
        create_sized(&b.path().join(temp_file_name(2)), 4096).unwrap();

        let dirs = vec![a.path().to_path_buf(), b.path().to_path_buf()];
        let found = scan_directories(&dirs).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].dir, 0);
        assert_eq!(found[1].dir, 1);
        assert_eq!(found[1].len, 4096);
        assert!(!b.path().join(temp_file_name(2)).exists());
    }

    #[test]
    fn test_scan_detects_gap() {
        let a = tempfile::tempdir().unwrap();
        create_sized(&a.path().join(part_file_name(1)), 4096).unwrap();
        let dirs = vec![a.path().to_path_buf()];
        assert!(matches!(scan_directories(&dirs), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_staged_part_commit_and_abort() {
        let dir = tempfile::tempdir().unwrap();
        let staged = StagedPart::create(dir.path(), 0, 4096).unwrap();
        let path = staged.commit().unwrap();
        assert!(path.ends_with("000000.pmem"));

        let staged = StagedPart::create(dir.path(), 1, 4096).unwrap();
        staged.abort();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
