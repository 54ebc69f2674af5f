//! Op dispatcher: implements the twelve classic 9P ops against the host
//! filesystem. Qid typing lives in `utils::qid_from_attr`, permission
//! evaluation in `perm::check`; `rremove` checks the parent directory's
//! write bit rather than the target's own, matching POSIX unlink.

use std::io::SeekFrom;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use nix::unistd::{Gid, Uid, User};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use ninep_fs::error::{Error, errno::*};
use ninep_fs::serialize::Encodable;
use ninep_fs::srv::{FId, Filesystem};
use ninep_fs::{Data, FCall, IOHDRSZ, NONUNAME, P92000U, Stat, StatData, VERSION_UNKNOWN, dm, om};

use crate::config::PassFsConfig;
use crate::fid::{Handle, PassFid};
use crate::identity::IdentityCache;
use crate::path;
use crate::perm::{self, AccessIntent};
use crate::statconv;
use crate::utils::qid_from_attr;

/// One `PassFs` value is cloned per accepted connection (see
/// `ninep_fs::srv::dispatch`), so `msize` below is connection-scoped even
/// though `config`/`identity` are shared process-wide: the manual `Clone`
/// impl shares the `Arc`s but starts every clone with a fresh, unnegotiated
/// `msize` of 0, exactly as a brand new connection should.
pub struct PassFs {
    config: Arc<PassFsConfig>,
    identity: Arc<IdentityCache>,
    msize: AtomicU32,
}

impl Clone for PassFs {
    fn clone(&self) -> Self {
        PassFs {
            config: self.config.clone(),
            identity: self.identity.clone(),
            msize: AtomicU32::new(0),
        }
    }
}

impl PassFs {
    pub fn new(config: PassFsConfig) -> Self {
        PassFs {
            config: Arc::new(config),
            identity: Arc::new(IdentityCache::new()),
            msize: AtomicU32::new(0),
        }
    }

    /// The per-fid `iounit` to advertise: the negotiated `msize` minus the
    /// 9P message header, or 0 (no recommendation) before `Tversion` has
    /// run or if the header wouldn't leave room for any payload.
    fn iounit(&self) -> u32 {
        self.msize.load(Ordering::Relaxed).saturating_sub(IOHDRSZ)
    }

    fn resolve_identity(&self, uname: &str, n_uname: u32) -> ninep_fs::Result<(Uid, Gid)> {
        if n_uname != NONUNAME {
            let uid = Uid::from_raw(n_uname);
            let gid = User::from_uid(uid)
                .ok()
                .flatten()
                .map(|u| u.gid)
                .unwrap_or(Gid::from_raw(n_uname));
            return Ok((uid, gid));
        }

        match User::from_name(uname) {
            Ok(Some(user)) => Ok((user.uid, user.gid)),
            _ => Err(Error::No(EPERM)),
        }
    }

    fn access_intent(mode: u8) -> AccessIntent {
        let base = match mode & 0x03 {
            x if x == om::READ => AccessIntent::READ,
            x if x == om::WRITE => AccessIntent::WRITE,
            x if x == om::RDWR => AccessIntent::RDWR,
            _ => AccessIntent::EXEC,
        };
        if mode & om::TRUNC != 0 {
            base | AccessIntent::TRUNC
        } else {
            base
        }
    }

    fn oflag(mode: u8) -> nix::fcntl::OFlag {
        use nix::fcntl::OFlag;
        let mut flags = match mode & 0x03 {
            x if x == om::WRITE => OFlag::O_WRONLY,
            x if x == om::RDWR => OFlag::O_RDWR,
            _ => OFlag::O_RDONLY,
        };
        if mode & om::TRUNC != 0 {
            flags |= OFlag::O_TRUNC;
        }
        flags
    }

    async fn groups_for(&self, uid: Uid) -> Vec<Gid> {
        self.identity.groups_of(uid)
    }

    fn depth_of(&self, path: &Path) -> usize {
        path.strip_prefix(&self.config.root)
            .map(|rel| rel.components().count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Filesystem for PassFs {
    type FId = PassFid;

    async fn rversion(&self, msize: u32, ver: &str) -> ninep_fs::Result<FCall> {
        self.msize.store(msize, Ordering::Relaxed);
        log::info!("version negotiated: {} msize={}", ver, msize);
        Ok(FCall::RVersion {
            msize,
            version: match ver {
                P92000U => ver.to_owned(),
                _ => VERSION_UNKNOWN.to_owned(),
            },
        })
    }

    async fn rattach(
        &self,
        fid: &FId<Self::FId>,
        _afid: Option<&FId<Self::FId>>,
        uname: &str,
        _aname: &str,
        n_uname: u32,
    ) -> ninep_fs::Result<FCall> {
        let (uid, gid) = self.resolve_identity(uname, n_uname)?;
        let meta = fs::symlink_metadata(&self.config.root).await?;

        *fid.aux.path.write().await = self.config.root.clone();
        *fid.aux.identity.write().await = (uid, gid);

        log::info!("attach: uname={} root={:?}", uname, self.config.root);

        Ok(FCall::RAttach {
            qid: qid_from_attr(&meta),
        })
    }

    async fn rwalk(
        &self,
        fid: &FId<Self::FId>,
        newfid: &FId<Self::FId>,
        wnames: &[String],
    ) -> ninep_fs::Result<FCall> {
        if !wnames.is_empty() && fid.fid() == newfid.fid() {
            return Err(Error::No(EINVAL));
        }

        let base_path = fid.aux.path.read().await.clone();
        let identity = *fid.aux.identity.read().await;

        if wnames.is_empty() {
            *newfid.aux.path.write().await = base_path;
            *newfid.aux.identity.write().await = identity;
            return Ok(FCall::RWalk { wqids: Vec::new() });
        }

        let mut path = base_path;
        let mut wqids = Vec::new();

        for (i, name) in wnames.iter().enumerate() {
            let step = std::slice::from_ref(name);
            let next = match path::join(&self.config.root, &path, step) {
                Ok(p) => p,
                Err(e) => {
                    if i == 0 {
                        return Err(e);
                    }
                    break;
                }
            };

            if self.depth_of(&next) > self.config.max_depth {
                if i == 0 {
                    return Err(Error::No(ELOOP));
                }
                break;
            }

            match fs::symlink_metadata(&next).await {
                Ok(meta) => {
                    wqids.push(qid_from_attr(&meta));
                    path = next;
                }
                Err(_) => {
                    if i == 0 {
                        return Err(Error::No(ENOENT));
                    }
                    break;
                }
            }
        }

        *newfid.aux.path.write().await = path;
        *newfid.aux.identity.write().await = identity;

        Ok(FCall::RWalk { wqids })
    }

    async fn ropen(&self, fid: &FId<Self::FId>, mode: u8) -> ninep_fs::Result<FCall> {
        {
            let handle = fid.aux.handle.lock().await;
            if !matches!(*handle, Handle::Idle) {
                return Err(Error::No(EBUSY));
            }
        }

        let path = fid.aux.path.read().await.clone();
        let meta = fs::symlink_metadata(&path).await?;
        let (uid, _gid) = *fid.aux.identity.read().await;
        let groups = self.groups_for(uid).await;
        let intent = Self::access_intent(mode);

        if !perm::check(&meta, uid, intent, &groups) {
            log::warn!("open denied: uid={} path={:?}", uid.as_raw(), path);
            return Err(Error::No(EACCES));
        }

        if meta.is_dir() {
            if mode & 0x03 != om::READ {
                return Err(Error::No(EISDIR));
            }
            let mut entries = Vec::new();
            let mut rd = fs::read_dir(&path).await?;
            while let Some(entry) = rd.next_entry().await? {
                entries.push(entry.path());
            }
            *fid.aux.handle.lock().await = Handle::OpenDir { entries, pos: 0 };
        } else {
            if self.config.read_only && intent.intersects(AccessIntent::WRITE) {
                log::warn!("open for write rejected, read-only export: {:?}", path);
                return Err(Error::No(EROFS));
            }
            let fd = nix::fcntl::open(&path, Self::oflag(mode), nix::sys::stat::Mode::empty())?;
            let file = fs::File::from_std(fd.into());
            *fid.aux.handle.lock().await = Handle::OpenFile(file);
        }

        Ok(FCall::ROpen {
            qid: qid_from_attr(&meta),
            iounit: self.iounit(),
        })
    }

    async fn rcreate(
        &self,
        fid: &FId<Self::FId>,
        name: &str,
        perm: u32,
        mode: u8,
    ) -> ninep_fs::Result<FCall> {
        if self.config.read_only {
            log::warn!("create rejected, read-only export: {}", name);
            return Err(Error::No(EROFS));
        }
        {
            let handle = fid.aux.handle.lock().await;
            if !matches!(*handle, Handle::Idle) {
                return Err(Error::No(EBUSY));
            }
        }
        if name.is_empty() || name.contains(std::path::MAIN_SEPARATOR) {
            return Err(Error::No(EINVAL));
        }

        let dir_path = fid.aux.path.read().await.clone();
        let (uid, gid) = *fid.aux.identity.read().await;
        let dir_meta = fs::symlink_metadata(&dir_path).await?;
        if !dir_meta.is_dir() {
            return Err(Error::No(ENOTDIR));
        }

        let groups = self.groups_for(uid).await;
        if !perm::check(&dir_meta, uid, AccessIntent::WRITE, &groups) {
            log::warn!("create denied: uid={} dir={:?}", uid.as_raw(), dir_path);
            return Err(Error::No(EACCES));
        }

        let new_path = dir_path.join(name);

        if perm & dm::DIR != 0 {
            fs::create_dir(&new_path).await?;
            fs::set_permissions(&new_path, PermissionsExt::from_mode(perm & 0o777)).await?;
            nix::unistd::chown(&new_path, Some(uid), Some(gid))?;
            let meta = fs::symlink_metadata(&new_path).await?;
            let mut rd = fs::read_dir(&new_path).await?;
            let mut entries = Vec::new();
            while let Some(entry) = rd.next_entry().await? {
                entries.push(entry.path());
            }
            *fid.aux.path.write().await = new_path;
            *fid.aux.handle.lock().await = Handle::OpenDir { entries, pos: 0 };
            Ok(FCall::RCreate {
                qid: qid_from_attr(&meta),
                iounit: self.iounit(),
            })
        } else {
            use nix::fcntl::OFlag;
            let oflag = Self::oflag(mode) | OFlag::O_CREAT | OFlag::O_EXCL;
            let host_mode = nix::sys::stat::Mode::from_bits_truncate(perm & 0o777);
            let fd = nix::fcntl::open(&new_path, oflag, host_mode)?;
            let file = fs::File::from_std(fd.into());
            nix::unistd::chown(&new_path, Some(uid), Some(gid))?;
            let meta = file.metadata().await?;
            *fid.aux.path.write().await = new_path;
            *fid.aux.handle.lock().await = Handle::OpenFile(file);
            Ok(FCall::RCreate {
                qid: qid_from_attr(&meta),
                iounit: self.iounit(),
            })
        }
    }

    async fn rread(
        &self,
        fid: &FId<Self::FId>,
        offset: u64,
        count: u32,
    ) -> ninep_fs::Result<FCall> {
        let mut handle = fid.aux.handle.lock().await;
        match &mut *handle {
            Handle::Idle => Err(Error::No(EBADF)),
            Handle::OpenFile(file) => {
                file.seek(SeekFrom::Start(offset)).await?;
                let mut buf = vec![0u8; count as usize];
                let n = file.read(&mut buf).await?;
                buf.truncate(n);
                Ok(FCall::RRead { data: Data(buf) })
            }
            Handle::OpenDir { entries, pos } => {
                let mut buf = Vec::new();
                let mut cursor = *pos;

                while cursor < entries.len() {
                    let entry_path = &entries[cursor];
                    let meta = match fs::symlink_metadata(entry_path).await {
                        Ok(m) => m,
                        Err(_) => {
                            cursor += 1;
                            continue;
                        }
                    };
                    let name = entry_path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    let stat = statconv::to_wire(&meta, &name, &self.identity);
                    let entry_size = stat.size() as u32 + 2;

                    if buf.len() as u32 + entry_size > count {
                        break;
                    }

                    let statdata = StatData(stat);
                    statdata.encode(&mut buf).map_err(Error::Io)?;
                    cursor += 1;
                }

                *pos = cursor;
                Ok(FCall::RRead { data: Data(buf) })
            }
        }
    }

    async fn rwrite(
        &self,
        fid: &FId<Self::FId>,
        offset: u64,
        data: &Data,
    ) -> ninep_fs::Result<FCall> {
        if self.config.read_only {
            log::warn!("write rejected, read-only export (fid={})", fid.fid());
            return Err(Error::No(EROFS));
        }

        let mut handle = fid.aux.handle.lock().await;
        match &mut *handle {
            Handle::Idle => Err(Error::No(EBADF)),
            Handle::OpenDir { .. } => Err(Error::No(EISDIR)),
            Handle::OpenFile(file) => {
                file.seek(SeekFrom::Start(offset)).await?;
                let n = file.write(&data.0).await?;
                Ok(FCall::RWrite { count: n as u32 })
            }
        }
    }

    async fn rclunk(&self, fid: &FId<Self::FId>) -> ninep_fs::Result<FCall> {
        *fid.aux.handle.lock().await = Handle::Idle;
        Ok(FCall::RClunk)
    }

    async fn rremove(&self, fid: &FId<Self::FId>) -> ninep_fs::Result<FCall> {
        let path = fid.aux.path.read().await.clone();
        let (uid, _) = *fid.aux.identity.read().await;

        let result = async {
            let parent = path.parent().unwrap_or(&self.config.root);
            let parent_meta = fs::symlink_metadata(parent).await?;
            let groups = self.groups_for(uid).await;
            if !perm::check(&parent_meta, uid, AccessIntent::WRITE, &groups) {
                log::warn!("remove denied: uid={} path={:?}", uid.as_raw(), path);
                return Err(Error::No(EACCES));
            }

            let meta = fs::symlink_metadata(&path).await?;
            if meta.is_dir() {
                fs::remove_dir(&path).await?;
            } else {
                fs::remove_file(&path).await?;
            }
            Ok(())
        }
        .await;

        *fid.aux.handle.lock().await = Handle::Idle;
        result.map(|_| FCall::RRemove)
    }

    async fn rstat(&self, fid: &FId<Self::FId>) -> ninep_fs::Result<FCall> {
        let path = fid.aux.path.read().await.clone();
        let meta = fs::symlink_metadata(&path).await?;
        let name = if path == self.config.root {
            "/".to_owned()
        } else {
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        };
        Ok(FCall::RStat {
            stat: StatData(statconv::to_wire(&meta, &name, &self.identity)),
        })
    }

    async fn rwstat(&self, fid: &FId<Self::FId>, want: &Stat) -> ninep_fs::Result<FCall> {
        let path = fid.aux.path.read().await.clone();
        let meta = fs::symlink_metadata(&path).await?;
        let (uid, _) = *fid.aux.identity.read().await;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let current = statconv::to_wire(&meta, &name, &self.identity);

        let mutating = want.mode != ninep_fs::wstat_sentinel::MODE
            || want.n_uid != ninep_fs::wstat_sentinel::N_UID
            || want.n_gid != ninep_fs::wstat_sentinel::N_GID
            || want.length != ninep_fs::wstat_sentinel::LENGTH
            || want.atime != ninep_fs::wstat_sentinel::ATIME
            || want.mtime != ninep_fs::wstat_sentinel::MTIME
            || !want.name.is_empty()
            || !want.muid.is_empty()
            || want.n_muid != ninep_fs::wstat_sentinel::N_MUID;

        if mutating && self.config.read_only {
            log::warn!("wstat rejected, read-only export: {:?}", path);
            return Err(Error::No(EROFS));
        }

        if mutating {
            let groups = self.groups_for(uid).await;
            if !perm::check(&meta, uid, AccessIntent::WRITE, &groups) {
                log::warn!("wstat denied: uid={} path={:?}", uid.as_raw(), path);
                return Err(Error::No(EACCES));
            }
        }

        let new_path = statconv::apply_wstat(&path, &current, want, meta.is_dir()).await?;
        if new_path != path {
            *fid.aux.path.write().await = new_path;
        }

        Ok(FCall::RWStat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_intent_maps_om_values_directly() {
        assert_eq!(PassFs::access_intent(om::READ), AccessIntent::READ);
        assert_eq!(PassFs::access_intent(om::WRITE), AccessIntent::WRITE);
        assert_eq!(PassFs::access_intent(om::RDWR), AccessIntent::RDWR);
        assert_eq!(PassFs::access_intent(om::EXEC), AccessIntent::EXEC);
    }

    #[test]
    fn access_intent_adds_trunc_flag() {
        let intent = PassFs::access_intent(om::WRITE | om::TRUNC);
        assert!(intent.contains(AccessIntent::WRITE));
        assert!(intent.contains(AccessIntent::TRUNC));
    }

    #[tokio::test]
    async fn depth_of_counts_components_below_root() {
        let config = PassFsConfig::new(std::env::temp_dir(), false, 200).unwrap();
        let backend = PassFs::new(config);
        let nested = backend.config.root.join("a").join("b");
        assert_eq!(backend.depth_of(&nested), 2);
        assert_eq!(backend.depth_of(&backend.config.root), 0);
    }

    fn root_fid(fid: u32, root: std::path::PathBuf) -> FId<PassFid> {
        FId::new(fid, PassFid::new(root, Uid::from_raw(0), Gid::from_raw(0)))
    }

    // Attach to a root holding `a/b.txt`, walk down to it, open, read its
    // contents back, then clunk.
    #[tokio::test]
    async fn attach_walk_open_read_clunk_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::create_dir(tmp.path().join("a")).await.unwrap();
        tokio::fs::write(tmp.path().join("a").join("b.txt"), b"hello")
            .await
            .unwrap();

        let config = PassFsConfig::new(tmp.path(), false, 200).unwrap();
        let backend = PassFs::new(config);

        let attach_fid = root_fid(0, std::path::PathBuf::new());
        backend
            .rattach(&attach_fid, None, "root", "", 0)
            .await
            .unwrap();

        let walk_fid = root_fid(1, std::path::PathBuf::new());
        let wnames = vec!["a".to_owned(), "b.txt".to_owned()];
        let reply = backend.rwalk(&attach_fid, &walk_fid, &wnames).await.unwrap();
        match reply {
            FCall::RWalk { wqids } => assert_eq!(wqids.len(), 2),
            other => panic!("unexpected reply: {:?}", other),
        }

        let reply = backend.ropen(&walk_fid, om::READ).await.unwrap();
        assert!(matches!(reply, FCall::ROpen { .. }));

        let reply = backend.rread(&walk_fid, 0, 64).await.unwrap();
        match reply {
            FCall::RRead { data } => assert_eq!(data.0, b"hello"),
            other => panic!("unexpected reply: {:?}", other),
        }

        let reply = backend.rclunk(&walk_fid).await.unwrap();
        assert!(matches!(reply, FCall::RClunk));
    }

    #[tokio::test]
    async fn directory_read_rewinds_before_an_entry_that_would_overflow() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::write(tmp.path().join("a"), b"").await.unwrap();
        tokio::fs::write(tmp.path().join("bb"), b"").await.unwrap();

        let config = PassFsConfig::new(tmp.path(), false, 200).unwrap();
        let backend = PassFs::new(config);

        let root = backend.config.root.clone();
        let fid = root_fid(0, root);
        backend.ropen(&fid, om::READ).await.unwrap();

        // First read with a generous budget packs both entries and leaves
        // the cursor at the end.
        let reply = backend.rread(&fid, 0, 4096).await.unwrap();
        let full_len = match reply {
            FCall::RRead { data } => data.0.len(),
            other => panic!("unexpected reply: {:?}", other),
        };
        assert!(full_len > 0);

        // Re-open and read with a budget too small for even the first
        // entry: the packer must return an empty reply rather than a
        // truncated record, and must not advance the cursor.
        backend.rclunk(&fid).await.unwrap();
        backend.ropen(&fid, om::READ).await.unwrap();
        let reply = backend.rread(&fid, 0, 1).await.unwrap();
        match reply {
            FCall::RRead { data } => assert!(data.0.is_empty()),
            other => panic!("unexpected reply: {:?}", other),
        }
        match &*fid.aux.handle.lock().await {
            Handle::OpenDir { pos, .. } => assert_eq!(*pos, 0),
            _ => panic!("expected OpenDir"),
        }
    }
}
