//! Stat adapter: converts host metadata to and from the wire `Stat` record.
//!
//! Mutations use the `wstat_sentinel` "don't change" convention: a field
//! equal to its sentinel value is left untouched rather than applied.

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use filetime::FileTime;
use nix::unistd::{Gid, Uid};
use tokio::fs;

use ninep_fs::error::{Error, errno::*};
use ninep_fs::{QId, Stat, wstat_sentinel};

use crate::identity::IdentityCache;
use crate::utils::qid_from_attr;

/// Builds the wire `Stat` for a path named `name` from its host metadata.
/// `name` is the final path component, or `"/"` for the root.
pub fn to_wire(meta: &std::fs::Metadata, name: &str, identity: &IdentityCache) -> Stat {
    let qid = qid_from_attr(meta);

    Stat {
        typ: 0,
        dev: 0,
        qid,
        mode: mode_to_wire(meta),
        atime: meta.atime() as u32,
        mtime: meta.mtime() as u32,
        length: if meta.is_dir() { 0 } else { meta.len() },
        name: name.to_owned(),
        uid: identity.uid_to_name(Uid::from_raw(meta.uid())),
        gid: identity.gid_to_name(Gid::from_raw(meta.gid())),
        muid: String::new(),
        n_uid: meta.uid(),
        n_gid: meta.gid(),
        n_muid: 0,
    }
}

fn mode_to_wire(meta: &std::fs::Metadata) -> u32 {
    let perm = meta.permissions().mode() & 0o777;
    if meta.is_dir() {
        perm | ninep_fs::dm::DIR
    } else {
        perm
    }
}

fn qid_matches(want: &QId, have: &QId) -> bool {
    want.path == have.path
}

/// Applies the wire-side fields of `want` that differ from `wstat_sentinel`
/// to the host file at `path`, returning the (possibly renamed) new path.
///
/// Fields whose wire value equals `wstat_sentinel`'s marker are left
/// unchanged, per the 9P wstat "don't touch" convention. Directory length
/// changes and `typ`/`dev`/`muid` changes are rejected; `qid` is checked
/// against the fid's current identity as a sanity guard before any mutation.
pub async fn apply_wstat(
    path: &Path,
    current: &Stat,
    want: &Stat,
    is_dir: bool,
) -> ninep_fs::Result<PathBuf> {
    if !qid_matches(&want.qid, &current.qid) && want.qid.path != 0 {
        return Err(Error::No(EPERM));
    }
    if want.typ != wstat_sentinel::TYP || want.dev != wstat_sentinel::DEV {
        return Err(Error::No(EPERM));
    }
    if !want.muid.is_empty() || want.n_muid != wstat_sentinel::N_MUID {
        return Err(Error::No(EPERM));
    }

    if !want.name.is_empty() && want.name.contains(std::path::MAIN_SEPARATOR) {
        return Err(Error::No(EINVAL));
    }

    if want.mode != wstat_sentinel::MODE {
        // chmod only takes permission bits; the S_IFDIR bit is fixed at
        // creation and can't be changed here even though the wire mode
        // carries ninep_fs::dm::DIR for directories.
        let perm = want.mode & 0o777;
        fs::set_permissions(path, PermissionsExt::from_mode(perm)).await?;
    }

    if want.n_uid != wstat_sentinel::N_UID || want.n_gid != wstat_sentinel::N_GID {
        let uid = if want.n_uid != wstat_sentinel::N_UID {
            Some(Uid::from_raw(want.n_uid))
        } else {
            None
        };
        let gid = if want.n_gid != wstat_sentinel::N_GID {
            Some(Gid::from_raw(want.n_gid))
        } else {
            None
        };
        nix::unistd::chown(path, uid, gid)?;
    }

    if want.length != wstat_sentinel::LENGTH {
        if is_dir {
            return Err(Error::No(EPERM));
        }
        fs::OpenOptions::new()
            .write(true)
            .open(path)
            .await?
            .set_len(want.length)
            .await?;
    }

    if want.atime != wstat_sentinel::ATIME || want.mtime != wstat_sentinel::MTIME {
        let meta = fs::metadata(path).await?;
        let atime = if want.atime != wstat_sentinel::ATIME {
            FileTime::from_unix_time(want.atime as i64, 0)
        } else {
            FileTime::from_last_access_time(&meta)
        };
        let mtime = if want.mtime != wstat_sentinel::MTIME {
            FileTime::from_unix_time(want.mtime as i64, 0)
        } else {
            FileTime::from_last_modification_time(&meta)
        };
        let target = path.to_path_buf();
        tokio::task::spawn_blocking(move || filetime::set_file_times(target, atime, mtime))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))??;
    }

    let mut new_path = path.to_path_buf();
    if !want.name.is_empty() && want.name != current.name {
        new_path.set_file_name(&want.name);
        fs::rename(path, &new_path).await?;
    }

    Ok(new_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_fields_are_distinguishable_from_real_values() {
        assert_ne!(wstat_sentinel::MODE, 0o644);
        assert_ne!(wstat_sentinel::ATIME, 0);
        assert_ne!(wstat_sentinel::LENGTH, 0);
    }

    #[test]
    fn qid_matches_compares_by_path_only() {
        let a = QId {
            typ: ninep_fs::QIdType::FILE,
            version: 1,
            path: 42,
        };
        let b = QId {
            typ: ninep_fs::QIdType::FILE,
            version: 99,
            path: 42,
        };
        assert!(qid_matches(&a, &b));
    }
}
