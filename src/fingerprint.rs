use std::fs;
use std::io::Read;
use std::path::Path;

use crc32fast::Hasher;
use walkdir::WalkDir;

use crate::error::{OrchestratorError, Result};

const SKIPPED_DIRS: &[&str] = &[".git", "work", ".svn", "CVS"];

pub fn fingerprint(port_dir: &Path) -> Result<u32> {
    let mut hasher = Hasher::new();
    let mut entries: Vec<_> = WalkDir::new(port_dir)
        .into_iter()
        .filter_entry(|e| !is_skipped(port_dir, e.path()))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .collect();

    entries.sort_by(|a, b| a.path().cmp(b.path()));

    for entry in entries {
        let rel = entry
            .path()
            .strip_prefix(port_dir)
            .map_err(|_| OrchestratorError::CRCError("path escaped port directory".to_string()))?;
        let rel_str = rel.to_string_lossy();
        hasher.update(rel_str.as_bytes());
        hasher.update(&[0u8]);

        let mut file = fs::File::open(entry.path())
            .map_err(|e| OrchestratorError::CRCError(format!("{}: {e}", entry.path().display())))?;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file
                .read(&mut buf)
                .map_err(|e| OrchestratorError::CRCError(format!("{}: {e}", entry.path().display())))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
    }

    Ok(hasher.finalize())
}

fn is_skipped(root: &Path, path: &Path) -> bool {
    if path == root {
        return false;
    }
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| SKIPPED_DIRS.contains(&n))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fingerprint_is_stable_across_calls() {
        let tmp = tempdir().unwrap();
        fs::write(tmp.path().join("Makefile"), "VERSION=1.0\n").unwrap();
        fs::write(tmp.path().join("distinfo"), "SHA256 (foo) = abc\n").unwrap();

        let a = fingerprint(tmp.path()).unwrap();
        let b = fingerprint(tmp.path()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_changes_on_content_change() {
        let tmp = tempdir().unwrap();
        let file = tmp.path().join("Makefile");
        fs::write(&file, "VERSION=1.0\n").unwrap();
        let before = fingerprint(tmp.path()).unwrap();
        fs::write(&file, "VERSION=1.1\n").unwrap();
        let after = fingerprint(tmp.path()).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn fingerprint_changes_on_rename() {
        let tmp = tempdir().unwrap();
        fs::write(tmp.path().join("a.txt"), "same contents").unwrap();
        let before = fingerprint(tmp.path()).unwrap();
        fs::rename(tmp.path().join("a.txt"), tmp.path().join("b.txt")).unwrap();
        let after = fingerprint(tmp.path()).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn skips_vcs_and_work_directories() {
        let tmp = tempdir().unwrap();
        fs::write(tmp.path().join("Makefile"), "VERSION=1.0\n").unwrap();
        let baseline = fingerprint(tmp.path()).unwrap();

        let work = tmp.path().join("work");
        fs::create_dir_all(&work).unwrap();
        fs::write(work.join("scratch.o"), "binary garbage").unwrap();

        let after = fingerprint(tmp.path()).unwrap();
        assert_eq!(baseline, after, "work/ contents must not affect the fingerprint");
    }
}
