//! Virtual path resolution.
//!
//! Maps a path as seen through the mount point onto the source tree.
//! Nothing is validated or canonicalized here; symlinks are resolved only
//! by whatever host call later receives the result.

use std::path::{Path, PathBuf};

/// Resolves `virtual_path` against `root`.
///
/// Leading separators are stripped so the result always lands under
/// `root`; `""` and `"/"` resolve to `root` itself.
///
/// ```
/// use iofs_fuse::path::resolve;
/// use std::path::Path;
///
/// let root = Path::new("/srv/data");
/// assert_eq!(resolve(root, Path::new("/a/b.txt")), Path::new("/srv/data/a/b.txt"));
/// assert_eq!(resolve(root, Path::new("/")), root);
/// ```
#[inline]
pub fn resolve(root: &Path, virtual_path: &Path) -> PathBuf {
    match virtual_path.strip_prefix("/") {
        Ok(relative) => root.join(relative),
        Err(_) => root.join(virtual_path),
    }
}

/// Virtual path of `name` inside the directory at `parent`.
pub fn child(parent: &Path, name: &std::ffi::OsStr) -> PathBuf {
    parent.join(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::ffi::OsStr;

    #[test]
    fn test_resolve_rooted() {
        let root = Path::new("/src");
        assert_eq!(resolve(root, Path::new("/file")), Path::new("/src/file"));
        assert_eq!(resolve(root, Path::new("/a/b/c")), Path::new("/src/a/b/c"));
    }

    #[test]
    fn test_resolve_root_itself() {
        let root = Path::new("/src");
        assert_eq!(resolve(root, Path::new("/")), Path::new("/src"));
        assert_eq!(resolve(root, Path::new("")), Path::new("/src"));
    }

    #[test]
    fn test_resolve_unrooted() {
        let root = Path::new("/src");
        assert_eq!(resolve(root, Path::new("rel/x")), Path::new("/src/rel/x"));
    }

    #[test]
    fn test_resolve_does_not_canonicalize() {
        let root = Path::new("/src");
        assert_eq!(resolve(root, Path::new("/a/../b")), Path::new("/src/a/../b"));
    }

    #[test]
    fn test_child() {
        assert_eq!(child(Path::new("/"), OsStr::new("x")), Path::new("/x"));
        assert_eq!(child(Path::new("/d"), OsStr::new("x")), Path::new("/d/x"));
    }

    proptest! {
        #[test]
        fn prop_resolve_stays_under_root(parts in prop::collection::vec("[a-zA-Z0-9._-]{1,12}", 0..6)) {
            let root = Path::new("/src");
            let virtual_path: PathBuf = std::iter::once("/".to_string())
                .chain(parts.iter().filter(|p| *p != "." && *p != "..").cloned())
                .collect();
            let host = resolve(root, &virtual_path);
            prop_assert!(host.starts_with(root));
            prop_assert_eq!(host.strip_prefix(root).unwrap(), virtual_path.strip_prefix("/").unwrap());
        }
    }
}
