//! Confine output paths to the output root. Every artifact write goes through
//! here so a hostile or buggy path can never land outside `<out_root>/`.

use std::path::{Component, Path, PathBuf};

use crate::error::{ControlError, Result};

/// Resolve `p` against `root`, guaranteeing the result stays inside it, and
/// create parent directories. Relative paths must not traverse upwards;
/// absolute paths must already be under the root.
pub fn ensure_out_path(root: &Path, p: &Path) -> Result<PathBuf> {
    let out = if p.is_absolute() {
        if !p.starts_with(root) {
            return Err(ControlError::Config(format!(
                "path {} escapes output root {}",
                p.display(),
                root.display()
            )));
        }
        p.to_path_buf()
    } else {
        if p.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(ControlError::Config(format!(
                "path {} escapes output root {}",
                p.display(),
                root.display()
            )));
        }
        root.join(p)
    };
    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_joins_root_and_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let out = ensure_out_path(dir.path(), Path::new("sess/live.final.en.txt")).unwrap();
        assert!(out.starts_with(dir.path()));
        assert!(out.parent().unwrap().is_dir());
    }

    #[test]
    fn parent_traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = ensure_out_path(dir.path(), Path::new("../escape.txt")).unwrap_err();
        assert!(matches!(err, ControlError::Config(_)));
    }

    #[test]
    fn absolute_path_outside_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = ensure_out_path(dir.path(), Path::new("/tmp/other/file.txt")).unwrap_err();
        assert!(matches!(err, ControlError::Config(_)));
    }

    #[test]
    fn absolute_path_inside_root_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let inside = dir.path().join("a/b.txt");
        let out = ensure_out_path(dir.path(), &inside).unwrap();
        assert_eq!(out, inside);
    }
}
