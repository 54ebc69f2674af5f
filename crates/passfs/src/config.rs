//! Backend configuration, built once from CLI arguments at startup.

use std::path::{Path, PathBuf};

/// An auxiliary subtree mounted by name.
///
/// Unused by op handlers today; retained as a future extension point.
#[derive(Clone, Debug)]
pub struct AuxTree {
    pub name: String,
    pub path: PathBuf,
}

/// Immutable backend configuration, constructed once at startup.
#[derive(Clone, Debug)]
pub struct PassFsConfig {
    pub root: PathBuf,
    pub read_only: bool,
    pub aux_trees: Vec<AuxTree>,
    pub max_depth: usize,
}

impl PassFsConfig {
    pub fn new(root: impl AsRef<Path>, read_only: bool, max_depth: usize) -> std::io::Result<Self> {
        Ok(PassFsConfig {
            root: root.as_ref().canonicalize()?,
            read_only,
            aux_trees: Vec::new(),
            max_depth,
        })
    }
}
