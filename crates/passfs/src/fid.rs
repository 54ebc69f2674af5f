//! Per-fid state: path, attach identity, and whatever handle it has open.
//!
//! 9P2000 has no separate readdir op, so an open directory accumulates a
//! point-in-time snapshot of its entries the first time it's read, since
//! POSIX seekdir/telldir aren't exposed through `tokio::fs`.

use std::path::PathBuf;

use nix::unistd::{Gid, Uid};
use tokio::fs::File;
use tokio::sync::{Mutex, RwLock};

/// What, if anything, a fid currently has open.
pub enum Handle {
    Idle,
    OpenFile(File),
    OpenDir {
        /// Snapshot of the directory's entries taken on the first read.
        entries: Vec<PathBuf>,
        /// Index of the next entry to pack into an `Rread` reply.
        pos: usize,
    },
}

impl Default for Handle {
    fn default() -> Self {
        Handle::Idle
    }
}

/// Per-fid state: the path it's walked to, the identity it was attached
/// under, and whatever it currently has open.
pub struct PassFid {
    pub path: RwLock<PathBuf>,
    pub identity: RwLock<(Uid, Gid)>,
    pub handle: Mutex<Handle>,
}

impl Default for PassFid {
    fn default() -> Self {
        PassFid {
            path: RwLock::new(PathBuf::new()),
            identity: RwLock::new((Uid::from_raw(0), Gid::from_raw(0))),
            handle: Mutex::new(Handle::Idle),
        }
    }
}

impl PassFid {
    pub fn new(path: PathBuf, uid: Uid, gid: Gid) -> Self {
        PassFid {
            path: RwLock::new(path),
            identity: RwLock::new((uid, gid)),
            handle: Mutex::new(Handle::Idle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_fid_starts_idle() {
        let fid = PassFid::new(PathBuf::from("/export"), Uid::from_raw(1000), Gid::from_raw(1000));
        match &*fid.handle.lock().await {
            Handle::Idle => {}
            _ => panic!("expected Idle"),
        }
    }

    #[tokio::test]
    async fn default_fid_is_idle_with_root_identity() {
        let fid = PassFid::default();
        assert_eq!(*fid.path.read().await, PathBuf::new());
        let (uid, gid) = *fid.identity.read().await;
        assert_eq!(uid.as_raw(), 0);
        assert_eq!(gid.as_raw(), 0);
    }

    #[tokio::test]
    async fn opendir_tracks_cursor_position() {
        let entries = vec![PathBuf::from("a"), PathBuf::from("b"), PathBuf::from("c")];
        let handle = Handle::OpenDir { entries, pos: 0 };
        match handle {
            Handle::OpenDir { entries, pos } => {
                assert_eq!(entries.len(), 3);
                assert_eq!(pos, 0);
            }
            _ => panic!("expected OpenDir"),
        }
    }
}
