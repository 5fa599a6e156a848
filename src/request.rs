//! Generic OS-level request/response records and the collaborator seams.
//!
//! These are the inbound/outbound types of the engine: the host delivers
//! [`FsRequest`] records, the engine answers with [`FsResponse`] records
//! through a [`ResponseSink`]. Nothing here is FUSE-specific — the wire
//! protocol lives in [`crate::proto`].

use bytes::Bytes;

use crate::error::Status;
use crate::proto::Attr;

/// Identity of the principal a request runs as.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Caller {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

bitflags::bitflags! {
    /// Generic access rights a caller may request on an object.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FileAccess: u32 {
        const READ_DATA        = 1 << 0;
        const WRITE_DATA       = 1 << 1;
        const APPEND_DATA      = 1 << 2;
        const EXECUTE          = 1 << 3;
        const DELETE           = 1 << 4;
        const READ_ATTRIBUTES  = 1 << 5;
        const WRITE_ATTRIBUTES = 1 << 6;
        const READ_SECURITY    = 1 << 7;
        const WRITE_SECURITY   = 1 << 8;
    }
}

bitflags::bitflags! {
    /// Options modifying create/open behavior.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CreateOptions: u32 {
        /// The object must be a directory.
        const DIRECTORY             = 1 << 0;
        /// The object must not be a directory.
        const NON_DIRECTORY         = 1 << 1;
        /// Delete the object when the last handle closes.
        const DELETE_ON_CLOSE       = 1 << 2;
        /// Open the parent of the named object instead of the object.
        const OPEN_TARGET_DIRECTORY = 1 << 3;
        /// Open a symlink itself rather than following it.
        const OPEN_REPARSE_POINT    = 1 << 4;
    }
}

/// What a create request should do when the target does or does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Replace if it exists, create if it does not.
    Supersede,
    /// Fail if it exists, create if it does not.
    Create,
    /// Open if it exists, fail if it does not.
    Open,
    /// Open if it exists, create if it does not.
    OpenIf,
    /// Truncate if it exists, fail if it does not.
    Overwrite,
    /// Truncate if it exists, create if it does not.
    OverwriteIf,
}

/// Sub-kinds of set-information.
#[derive(Debug, Clone)]
pub enum SetInfo {
    /// Change basic attributes; `None` fields are left untouched.
    Basic {
        mode: Option<u32>,
        atime: Option<u64>,
        mtime: Option<u64>,
    },
    /// Reserve space. Treated as a size change.
    AllocationSize { size: u64 },
    /// Truncate or extend the file.
    EndOfFile { size: u64 },
    /// Arm or disarm delete-on-close for an open handle.
    Disposition { delete: bool },
    /// Move the object to a new path.
    Rename {
        new_path: String,
        replace_if_exists: bool,
    },
}

/// One externally-submitted file-system operation.
#[derive(Debug, Clone)]
pub struct FsRequest {
    /// Correlation hint, echoed verbatim in the response so the host can
    /// route it.
    pub hint: u64,
    pub caller: Caller,
    pub op: FsOp,
}

/// Kind tag plus kind-specific payload of a request.
#[derive(Debug, Clone)]
pub enum FsOp {
    Create {
        path: String,
        access: FileAccess,
        disposition: Disposition,
        options: CreateOptions,
        /// POSIX mode for newly created objects (type bits included).
        mode: u32,
        /// Explicit security descriptor to apply at creation.
        security: Option<Bytes>,
    },
    Read {
        fh: u64,
        offset: u64,
        length: u32,
    },
    Write {
        fh: u64,
        offset: u64,
        data: Bytes,
        /// Write at end-of-file regardless of `offset`.
        append: bool,
        /// Never extend the file (constrained I/O).
        constrained: bool,
    },
    Flush {
        fh: u64,
    },
    QueryDirectory {
        fh: u64,
        /// Single-entry probe by literal name, when set.
        pattern: Option<String>,
        /// Opaque resume offset from a previous batch (0 = start).
        resume_offset: u64,
        /// Output budget in bytes; a batch ends when it would overflow.
        buffer_len: u32,
    },
    SetInformation {
        fh: u64,
        info: SetInfo,
    },
    Cleanup {
        fh: u64,
        /// Host-requested delete-on-close, in addition to any armed
        /// disposition.
        delete: bool,
    },
    Close {
        fh: u64,
    },
    QuerySecurity {
        fh: u64,
    },
    SetSecurity {
        fh: u64,
        descriptor: Bytes,
    },
    QueryVolumeInformation,
}

impl FsOp {
    /// Short name for logging.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            FsOp::Create { .. } => "create",
            FsOp::Read { .. } => "read",
            FsOp::Write { .. } => "write",
            FsOp::Flush { .. } => "flush",
            FsOp::QueryDirectory { .. } => "query-directory",
            FsOp::SetInformation { .. } => "set-information",
            FsOp::Cleanup { .. } => "cleanup",
            FsOp::Close { .. } => "close",
            FsOp::QuerySecurity { .. } => "query-security",
            FsOp::SetSecurity { .. } => "set-security",
            FsOp::QueryVolumeInformation => "query-volume-information",
        }
    }
}

/// One outward directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirInfo {
    pub name: String,
    pub attr: Attr,
}

/// Volume statistics for query-volume-information.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VolumeInfo {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub sector_size: u32,
    /// Allocation granularity, in bytes.
    pub allocation_unit: u32,
    pub max_component_length: u32,
    /// Network-style prefix the volume is addressed under; empty for
    /// local-style volumes.
    pub unc_prefix: String,
    pub fs_name: String,
}

/// Success payload of a completed operation.
#[derive(Debug, Clone)]
pub enum FsReply {
    Create {
        fh: u64,
        ino: u64,
        attr: Attr,
        granted: FileAccess,
    },
    Read {
        data: Bytes,
    },
    Write {
        written: u32,
        /// File size as tracked after the write.
        size: u64,
    },
    Dir {
        entries: Vec<DirInfo>,
        /// Resume offset for the next batch; `None` means end-of-directory.
        resume_offset: Option<u64>,
    },
    Security {
        descriptor: Bytes,
    },
    Volume(VolumeInfo),
    /// Operations with no payload.
    Unit,
}

/// Terminal outcome of one request.
#[derive(Debug, Clone)]
pub struct FsResponse {
    /// The request's correlation hint, echoed back.
    pub hint: u64,
    pub result: Result<FsReply, Status>,
}

/// Receives completed responses. Implemented by the host integration.
pub trait ResponseSink: Send + Sync {
    fn deliver(&self, response: FsResponse);
}

/// Translates POSIX ownership/mode to and from the host's opaque
/// security-descriptor representation.
pub trait SecurityMapper: Send + Sync {
    /// Build a descriptor blob from POSIX identity bits.
    fn descriptor_from_posix(&self, uid: u32, gid: u32, mode: u32) -> Result<Bytes, Status>;

    /// Extract the POSIX identity bits a descriptor encodes. `None`
    /// components were not present in the descriptor and must be left
    /// unchanged.
    fn posix_from_descriptor(
        &self,
        descriptor: &[u8],
    ) -> Result<(Option<u32>, Option<u32>, Option<u32>), Status>;
}
