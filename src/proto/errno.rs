//! errno → [`Status`] flavor tables.
//!
//! The remote side reports failures as POSIX errno magnitudes. Which
//! numbering those magnitudes use depends on the remote's compatibility
//! surface, so the mapping is carried as a plain function table. One
//! flavor ships; wiring in another numbering is a data change only.

use crate::error::Status;

/// An errno numbering flavor. Installed in the volume configuration.
pub type ErrnoTable = fn(i32) -> Status;

/// The default flavor: Linux errno numbering.
#[must_use]
pub fn linux(errno: i32) -> Status {
    // i32::MIN has no positive counterpart; treat it like any unknown code.
    let Ok(errno) = i32::try_from(errno.unsigned_abs()) else {
        return Status::IoError;
    };
    match errno {
        0 => Status::IoError, // zero is not an error; treat a misuse as I/O failure
        libc::ENOENT => Status::NotFound,
        libc::EACCES | libc::EPERM => Status::AccessDenied,
        libc::EEXIST => Status::NameCollision,
        libc::ENOTEMPTY => Status::DirectoryNotEmpty,
        libc::ENOTDIR => Status::NotADirectory,
        libc::EISDIR => Status::IsADirectory,
        libc::EINVAL => Status::InvalidParameter,
        libc::ENOSPC | libc::EDQUOT => Status::NoSpace,
        libc::ENAMETOOLONG => Status::NameTooLong,
        libc::EROFS => Status::WriteProtected,
        libc::ENOSYS | libc::EOPNOTSUPP => Status::NotSupported,
        libc::EINTR | libc::ECANCELED => Status::Cancelled,
        libc::EAGAIN | libc::EBUSY => Status::NotReady,
        libc::EFBIG | libc::EOVERFLOW => Status::BufferTooSmall,
        _ => Status::IoError,
    }
}
