//! Confines a walk to the configured export root.
//!
//! Joins one path component at a time so an intermediate step can never
//! stray above the root, even transiently.

use std::path::{Path, PathBuf};

use ninep_fs::error::{Error, errno::*};

/// Joins `base` with `components`, one at a time, confined to `root`.
///
/// `.` is a no-op; `..` pops the last component unless doing so would rise
/// above `root`, in which case this fails with `EPERM`. Embedded separators
/// and empty components fail with `EINVAL`. The walk dispatcher calls this
/// once per path component so a would-be-escaping intermediate step is never
/// returned, even for a single step within a longer walk.
pub fn join(root: &Path, base: &Path, components: &[String]) -> ninep_fs::Result<PathBuf> {
    let mut path = base.to_path_buf();

    for component in components {
        if component.is_empty() || component.contains(std::path::MAIN_SEPARATOR) {
            return Err(Error::No(EINVAL));
        }

        match component.as_str() {
            "." => {}
            ".." => {
                if !path.pop() || !path.starts_with(root) {
                    return Err(Error::No(EPERM));
                }
            }
            _ => path.push(component),
        }
    }

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_plain_components() {
        let root = Path::new("/export");
        let got = join(root, root, &["a".to_owned(), "b.txt".to_owned()]).unwrap();
        assert_eq!(got, Path::new("/export/a/b.txt"));
    }

    #[test]
    fn dot_is_noop() {
        let root = Path::new("/export");
        let got = join(root, root, &["a".to_owned(), ".".to_owned()]).unwrap();
        assert_eq!(got, Path::new("/export/a"));
    }

    #[test]
    fn dotdot_within_root_pops() {
        let root = Path::new("/export");
        let base = Path::new("/export/a/b");
        let got = join(root, base, &["..".to_owned()]).unwrap();
        assert_eq!(got, Path::new("/export/a"));
    }

    #[test]
    fn dotdot_above_root_is_eperm() {
        let root = Path::new("/export");
        let err = join(root, root, &["..".to_owned()]).unwrap_err();
        assert_eq!(err.errno(), EPERM);
    }

    #[test]
    fn empty_component_is_einval() {
        let root = Path::new("/export");
        let err = join(root, root, &["".to_owned()]).unwrap_err();
        assert_eq!(err.errno(), EINVAL);
    }

    #[test]
    fn embedded_separator_is_einval() {
        let root = Path::new("/export");
        let err = join(root, root, &["a/b".to_owned()]).unwrap_err();
        assert_eq!(err.errno(), EINVAL);
    }

    #[test]
    fn partial_walk_stops_before_escape() {
        // A multi-component walk that would cross the root midway must be
        // driven one component at a time by the caller so it never returns
        // the escaping intermediate path; this confirms the building block.
        let root = Path::new("/export");
        let base = Path::new("/export");
        let step1 = join(root, base, &["a".to_owned()]).unwrap();
        assert!(join(root, &step1, &["..".to_owned(), "..".to_owned()]).is_err());
    }
}
