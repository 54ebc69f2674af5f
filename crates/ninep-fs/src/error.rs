//! Error type and POSIX errno constants used on the 9P wire.
//!
//! # Protocol
//! 9P2000/9P2000.u

use std::fmt;

/// POSIX errno values, re-exported from `nix::libc` so the numeric values
/// match the host rather than a hand-copied table.
pub mod errno {
    use nix::libc;

    pub const EPERM: i32 = libc::EPERM;
    pub const ENOENT: i32 = libc::ENOENT;
    pub const EIO: i32 = libc::EIO;
    pub const EBADF: i32 = libc::EBADF;
    pub const EACCES: i32 = libc::EACCES;
    pub const EBUSY: i32 = libc::EBUSY;
    pub const EEXIST: i32 = libc::EEXIST;
    pub const ENOTDIR: i32 = libc::ENOTDIR;
    pub const EISDIR: i32 = libc::EISDIR;
    pub const EINVAL: i32 = libc::EINVAL;
    pub const EROFS: i32 = libc::EROFS;
    pub const ENOTEMPTY: i32 = libc::ENOTEMPTY;
    pub const ELOOP: i32 = libc::ELOOP;
    pub const ERANGE: i32 = libc::ERANGE;
    pub const EPROTO: i32 = libc::EPROTO;
    pub const EOPNOTSUPP: i32 = libc::EOPNOTSUPP;
}

/// String form of an errno, used for the 9P2000 `Rerror.ename` field.
///
/// This backend only ever serves 9P2000.u-aware clients and always emits the
/// numeric `Rlerror.ecode` form, but the string table is kept for
/// completeness and for logging.
pub fn string(code: i32) -> &'static str {
    match nix::errno::Errno::from_raw(code) {
        nix::errno::Errno::UnknownErrno => "unknown error",
        e => e.desc(),
    }
}

/// Error type returned by `Filesystem` methods.
///
/// `No(errno)` signals a POSIX-style error to send back to the client
/// verbatim; `Io` wraps a syscall failure so its `raw_os_error` can be
/// forwarded the same way.
#[derive(Debug)]
pub enum Error {
    No(i32),
    Io(std::io::Error),
}

impl Error {
    /// The errno to put on the wire in `Rlerror.ecode`.
    pub fn errno(&self) -> i32 {
        match *self {
            Error::No(n) => n,
            Error::Io(ref e) => e.raw_os_error().unwrap_or(errno::EIO),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::No(n) => write!(f, "{}", string(n)),
            Error::Io(ref e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::No(e as i32)
    }
}
