//! Path confinement.
//!
//! Containment is decided on normalised path components, never on string
//! prefixes: a root of `/tmp/root` must not admit `/tmp/root2`.

use std::path::{Component, Path, PathBuf};

use super::error::BoundaryError;

/// Fail unless `candidate` resolves to `root` or a path below it.
///
/// Relative paths are made absolute against the process working directory,
/// then both sides are normalised lexically (`.` dropped, `..` folded).
pub fn assert_confined(candidate: &Path, root: &Path) -> Result<(), BoundaryError> {
    let root_abs = normalize(&absolutize(root));
    let candidate_abs = normalize(&absolutize(candidate));
    let escape = || BoundaryError::PathEscape {
        candidate: candidate.to_path_buf(),
        root: root.to_path_buf(),
    };

    let relative = candidate_abs.strip_prefix(&root_abs).map_err(|_| escape())?;
    match relative.components().next() {
        None | Some(Component::Normal(_)) => Ok(()),
        Some(_) => Err(escape()),
    }
}

/// Resolve `path` against `root` (if relative) and confine the result.
///
/// Returns the normalised absolute path on success.
pub fn resolve_within(root: &Path, path: &Path) -> Result<PathBuf, BoundaryError> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };
    assert_confined(&joined, root)?;
    Ok(normalize(&joined))
}

/// Fail unless `path`, with symlinks resolved, stays below `root`.
///
/// Only meaningful on a real filesystem. The nearest existing ancestor of
/// `path` is canonicalised, so a link planted inside the root that points
/// outside it is caught even when the final file does not exist yet. A
/// dangling link is treated as an escape.
pub fn assert_resolved_confined(path: &Path, root: &Path) -> Result<(), BoundaryError> {
    let escape = || BoundaryError::PathEscape {
        candidate: path.to_path_buf(),
        root: root.to_path_buf(),
    };
    let root_real = root.canonicalize().map_err(|_| escape())?;

    let mut probe = path;
    loop {
        if probe.symlink_metadata().is_ok() {
            let real = probe.canonicalize().map_err(|_| escape())?;
            return if real.starts_with(&root_real) {
                Ok(())
            } else {
                Err(escape())
            };
        }
        probe = probe.parent().ok_or_else(escape)?;
    }
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::path::absolute(path).unwrap_or_else(|_| Path::new("/").join(path))
}

/// Lexically normalise an absolute path. `..` at the root stays at the root.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_confines_itself() {
        let root = Path::new("/tmp/root");
        assert_confined(root, root).expect("root is confined");
    }

    #[test]
    fn child_paths_are_confined() {
        let root = Path::new("/tmp/root");
        assert_confined(Path::new("/tmp/root/a/b.txt"), root).expect("child");
        assert_confined(Path::new("/tmp/root/a/../b"), root).expect("folded child");
        assert_confined(Path::new("/tmp/root/./c"), root).expect("curdir child");
    }

    #[test]
    fn sibling_prefix_is_rejected() {
        let root = Path::new("/tmp/root");
        let err = assert_confined(Path::new("/tmp/root2"), root).unwrap_err();
        assert!(matches!(err, BoundaryError::PathEscape { .. }));
        assert!(assert_confined(Path::new("/a/bc"), Path::new("/a/b")).is_err());
    }

    #[test]
    fn parent_traversal_is_rejected() {
        let root = Path::new("/tmp/root");
        assert!(assert_confined(&root.join(".."), root).is_err());
        assert!(assert_confined(Path::new("/tmp/root/a/../../etc"), root).is_err());
        assert!(assert_confined(Path::new("/etc/passwd"), root).is_err());
    }

    #[test]
    fn trailing_separator_on_root_is_ignored() {
        assert_confined(Path::new("/tmp/root/x"), Path::new("/tmp/root/")).expect("child");
    }

    #[test]
    fn resolve_within_joins_relative_paths() {
        let root = Path::new("/work/repo");
        let resolved = resolve_within(root, Path::new("src/./lib.rs")).expect("resolve");
        assert_eq!(resolved, PathBuf::from("/work/repo/src/lib.rs"));

        let err = resolve_within(root, Path::new("../other")).unwrap_err();
        assert!(err.to_string().contains("escapes sandbox root"));
    }

    #[cfg(unix)]
    #[test]
    fn resolved_check_follows_symlinks_out_of_root() {
        use std::os::unix::fs::symlink;

        let root = tempfile::tempdir().expect("root");
        let outside = tempfile::tempdir().expect("outside");
        symlink(outside.path(), root.path().join("link")).expect("symlink");
        std::fs::create_dir(root.path().join("real")).expect("dir");

        assert_resolved_confined(&root.path().join("real/new.txt"), root.path())
            .expect("plain subdir");
        assert_resolved_confined(&root.path().join("not/yet/there"), root.path())
            .expect("missing parents");
        let err = assert_resolved_confined(&root.path().join("link/x"), root.path()).unwrap_err();
        assert!(matches!(err, BoundaryError::PathEscape { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn resolved_check_rejects_dangling_links() {
        use std::os::unix::fs::symlink;

        let root = tempfile::tempdir().expect("root");
        symlink("/nonexistent/target", root.path().join("dangling")).expect("symlink");
        assert!(assert_resolved_confined(&root.path().join("dangling"), root.path()).is_err());
    }

    #[test]
    fn normalize_folds_parent_at_root() {
        assert_eq!(normalize(Path::new("/../a/./b/..")), PathBuf::from("/a"));
    }
}
