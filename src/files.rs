use super::Result;
use eyre::WrapErr;
use std::io::ErrorKind;
use std::path::Path;

/// Removes everything inside `dir` while keeping the directory itself.
///
/// A missing directory has no content and is not an error.
pub fn remove_content(dir: &Path) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).wrap_err_with(|| format!("can't read directory {}", dir.display())),
    };

    for entry in entries {
        let entry = entry.wrap_err_with(|| format!("can't read directory {}", dir.display()))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .wrap_err_with(|| format!("can't stat {}", path.display()))?;
        let removed = if file_type.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        removed.wrap_err_with(|| format!("can't remove {}", path.display()))?;
    }
    Ok(())
}

/// Removes `path` recursively, treating a missing path as already removed.
pub fn remove_all(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).wrap_err_with(|| format!("can't remove {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_remove_content_keeps_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("service.log"), "line\n").unwrap();
        std::fs::create_dir_all(dir.path().join("nested/deeper")).unwrap();
        std::fs::write(dir.path().join("nested/deeper/file"), "x").unwrap();

        remove_content(dir.path()).unwrap();

        assert!(dir.path().is_dir());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_missing_paths_are_fine() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing");
        remove_content(&missing).unwrap();
        remove_all(&missing).unwrap();
    }

    #[test]
    fn test_remove_all() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("output");
        std::fs::create_dir_all(out.join("a")).unwrap();
        remove_all(&out).unwrap();
        assert!(!out.exists());
    }
}
