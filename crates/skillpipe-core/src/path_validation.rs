//! Path validation utilities.
//!
//! Keeps builtin file tools inside the configured workspace root.

use anyhow::Result;
use std::path::{Component, Path, PathBuf};

/// Resolve `path` against `root` and reject anything that escapes it.
///
/// Works for paths that do not exist yet (write targets): the deepest existing
/// ancestor is canonicalized and the remaining components are checked lexically.
pub fn resolve_under_root(root: &Path, path: &str) -> Result<PathBuf> {
    let root = root
        .canonicalize()
        .map_err(|e| anyhow::anyhow!("Invalid workspace root {}: {}", root.display(), e))?;
    let input = Path::new(path);
    let full = if input.is_absolute() {
        input.to_path_buf()
    } else {
        root.join(input)
    };

    let mut existing = full.as_path();
    let mut rest: Vec<&std::ffi::OsStr> = Vec::new();
    while !existing.exists() {
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                rest.push(name);
                existing = parent;
            }
            _ => anyhow::bail!("Path has no existing ancestor: {}", path),
        }
    }
    let mut resolved = existing.canonicalize()?;
    for part in rest.into_iter().rev() {
        match Path::new(part).components().next() {
            Some(Component::Normal(p)) => resolved.push(p),
            _ => anyhow::bail!("Path escapes workspace root: {}", path),
        }
    }
    if !resolved.starts_with(&root) {
        anyhow::bail!("Path escapes workspace root: {}", path);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_under_root_accepts_new_file() {
        let td = tempfile::tempdir().unwrap();
        let p = resolve_under_root(td.path(), "out/report.txt").unwrap();
        assert!(p.starts_with(td.path().canonicalize().unwrap()));
        assert!(p.ends_with("out/report.txt"));
    }

    #[test]
    fn test_resolve_under_root_rejects_traversal() {
        let td = tempfile::tempdir().unwrap();
        std::fs::create_dir(td.path().join("inner")).unwrap();
        let root = td.path().join("inner");
        assert!(resolve_under_root(&root, "../escape.txt").is_err());
        assert!(resolve_under_root(&root, "/etc/passwd").is_err());
    }
}
