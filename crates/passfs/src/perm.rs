//! Evaluates POSIX permission bits, selecting exactly one of the owner,
//! group, or other classes rather than disjuncting across all three.

use std::os::unix::fs::MetadataExt;

use bitflags::bitflags;
use nix::unistd::{Gid, Uid};

bitflags! {
    /// 9P access intent, mirroring `ninep_fs::om`.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct AccessIntent: u8 {
        const READ  = 0b0001;
        const WRITE = 0b0010;
        const EXEC  = 0b0100;
        const TRUNC = 0b1000;
        const RDWR  = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// Evaluates whether `uid` (with supplementary `groups`) may perform `intent`
/// against a file whose metadata is `stat`.
///
/// Selects exactly one of the owner/group/other permission classes — never
/// disjuncts across all three — and requires every bit the intent implies to
/// be set within that single class.
pub fn check(stat: &std::fs::Metadata, uid: Uid, intent: AccessIntent, groups: &[Gid]) -> bool {
    if uid.is_root() {
        return true;
    }

    let mode = stat.mode();
    let class_bits = if stat.uid() == uid.as_raw() {
        (mode >> 6) & 0o7
    } else if groups.iter().any(|g| g.as_raw() == stat.gid()) {
        (mode >> 3) & 0o7
    } else {
        mode & 0o7
    };

    let mut required = 0u32;
    if intent.intersects(AccessIntent::READ) {
        required |= 0o4;
    }
    if intent.intersects(AccessIntent::WRITE) {
        required |= 0o2;
    }
    if intent.intersects(AccessIntent::EXEC) {
        required |= 0o1;
    }
    if intent.contains(AccessIntent::TRUNC) {
        required |= 0o2;
    }

    class_bits & required == required
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::Permissions;
    use std::os::unix::fs::PermissionsExt;

    // Metadata can't be constructed without a real file; these tests drive
    // the class-selection arithmetic directly instead of faking Metadata.
    fn class_bits(mode: u32, file_uid: u32, file_gid: u32, uid: u32, groups: &[u32]) -> u32 {
        if file_uid == uid {
            (mode >> 6) & 0o7
        } else if groups.contains(&file_gid) {
            (mode >> 3) & 0o7
        } else {
            mode & 0o7
        }
    }

    #[test]
    fn owner_class_selected_over_group_and_other() {
        // mode 0640: owner rw-, group r--, other ---
        let bits = class_bits(0o640, 1000, 100, 1000, &[100]);
        assert_eq!(bits, 0o6);
    }

    #[test]
    fn group_class_selected_when_not_owner() {
        let bits = class_bits(0o640, 1000, 100, 2000, &[100]);
        assert_eq!(bits, 0o4);
    }

    #[test]
    fn other_class_selected_when_neither_owner_nor_group() {
        let bits = class_bits(0o604, 1000, 100, 2000, &[200]);
        assert_eq!(bits, 0o4);
    }

    #[test]
    fn rdwr_requires_both_bits_in_same_class() {
        // group class has read but not write: RDWR must be denied, not
        // granted by disjuncting against another class that has write.
        let group_bits = class_bits(0o624, 1000, 100, 2000, &[100]);
        let required = 0o6;
        assert_ne!(group_bits & required, required);
    }

    #[test]
    fn permissions_helper_compiles() {
        // sanity: exercise the std API this module depends on indirectly
        let _ = Permissions::from_mode(0o644);
    }
}
