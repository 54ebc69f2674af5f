//! Maps host uids/gids to names and resolves supplementary groups, caching
//! both behind a shared table instead of calling `getpwuid`/`getgrgid`/
//! `getgrouplist` fresh on every request.

use std::collections::HashMap;
use std::ffi::CString;
use std::sync::Mutex;

use nix::unistd::{Gid, Group, Uid, User};

#[derive(Clone)]
struct CachedIdentity {
    groups: Vec<Gid>,
}

/// Caches uid→supplementary-groups lookups. One cache is built at startup
/// and shared process-wide across every connection, since uid→groups is a
/// host fact rather than anything scoped to a single session.
pub struct IdentityCache {
    groups: Mutex<HashMap<u32, CachedIdentity>>,
}

impl IdentityCache {
    pub fn new() -> Self {
        IdentityCache {
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves a uid to a user name, or the empty string if unresolvable.
    pub fn uid_to_name(&self, uid: Uid) -> String {
        User::from_uid(uid)
            .ok()
            .flatten()
            .map(|u| u.name)
            .unwrap_or_default()
    }

    /// Resolves a gid to a group name, or the empty string if unresolvable.
    pub fn gid_to_name(&self, gid: Gid) -> String {
        Group::from_gid(gid)
            .ok()
            .flatten()
            .map(|g| g.name)
            .unwrap_or_default()
    }

    /// Resolves the supplementary group list for `uid`, caching the result.
    pub fn groups_of(&self, uid: Uid) -> Vec<Gid> {
        if let Some(cached) = self.groups.lock().unwrap().get(&uid.as_raw()) {
            return cached.groups.clone();
        }

        let groups = lookup_groups(uid);
        self.groups.lock().unwrap().insert(
            uid.as_raw(),
            CachedIdentity {
                groups: groups.clone(),
            },
        );
        groups
    }
}

impl Default for IdentityCache {
    fn default() -> Self {
        Self::new()
    }
}

/// `nix` has no safe wrapper for `getgrouplist`; this is the crate's one
/// `unsafe` block, isolated here because `ninep-fs` forbids unsafe code.
fn lookup_groups(uid: Uid) -> Vec<Gid> {
    let user = match User::from_uid(uid) {
        Ok(Some(u)) => u,
        _ => return Vec::new(),
    };
    let name = match CString::new(user.name) {
        Ok(n) => n,
        Err(_) => return Vec::new(),
    };

    let mut ngroups: libc::c_int = 32;
    loop {
        let mut buf: Vec<libc::gid_t> = vec![0; ngroups as usize];
        let mut count = ngroups;

        // SAFETY: `name` is a valid NUL-terminated C string for the call's
        // duration, `buf` has `count` elements of capacity, and
        // `getgrouplist` writes at most `count` entries, updating `count` in
        // place to the number written (or the number needed, on failure).
        let rc = unsafe {
            libc::getgrouplist(
                name.as_ptr(),
                user.gid.as_raw() as libc::gid_t,
                buf.as_mut_ptr(),
                &mut count,
            )
        };

        if rc >= 0 {
            buf.truncate(count.max(0) as usize);
            return buf.into_iter().map(Gid::from_raw).collect();
        }
        if count <= ngroups {
            return Vec::new();
        }
        ngroups = count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unresolvable_uid_yields_empty_name() {
        let cache = IdentityCache::new();
        // A uid vanishingly unlikely to exist on any test host.
        let name = cache.uid_to_name(Uid::from_raw(u32::MAX - 1));
        assert_eq!(name, "");
    }

    #[test]
    fn groups_are_cached_after_first_lookup() {
        let cache = IdentityCache::new();
        let uid = Uid::from_raw(u32::MAX - 1);
        let first = cache.groups_of(uid);
        let second = cache.groups_of(uid);
        assert_eq!(first, second);
    }
}
