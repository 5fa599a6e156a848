//! FUSE wire protocol: message layouts, encode/decode, version constants.
//!
//! All integers are little-endian. A request is a fixed 40-byte header
//! followed by an opcode-specific payload; a response is a fixed 16-byte
//! header (length, signed errno, correlation token) followed by its payload.
//! Error codes are magnitude-only: the sign carries no meaning beyond
//! "nonzero means error".

pub mod errno;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtoError;
use crate::request::Caller;

/// Protocol major version. Must match the remote side exactly.
pub const KERNEL_VERSION: u32 = 7;
/// Highest minor version this engine speaks.
pub const KERNEL_MINOR_VERSION: u32 = 31;
/// First minor version at which FORGET entries may be batched.
pub const BATCH_FORGET_MINOR: u32 = 16;

/// Node id of the volume root. Fixed by the protocol.
pub const ROOT_ID: u64 = 1;

/// Size of the fixed request header on the wire.
pub const REQUEST_HEADER_LEN: usize = 40;
/// Size of the fixed response header on the wire.
pub const RESPONSE_HEADER_LEN: usize = 16;

/// Setattr valid-field bits (`FATTR_*`).
pub const FATTR_MODE: u32 = 1 << 0;
pub const FATTR_UID: u32 = 1 << 1;
pub const FATTR_GID: u32 = 1 << 2;
pub const FATTR_SIZE: u32 = 1 << 3;
pub const FATTR_ATIME: u32 = 1 << 4;
pub const FATTR_MTIME: u32 = 1 << 5;
pub const FATTR_FH: u32 = 1 << 6;

/// Getattr flag: attributes should be fetched through the given file handle.
pub const GETATTR_FH: u32 = 1 << 0;

/// Operation codes, numbered per the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    Lookup = 1,
    Forget = 2,
    Getattr = 3,
    Setattr = 4,
    Mknod = 8,
    Mkdir = 9,
    Unlink = 10,
    Rmdir = 11,
    Rename = 12,
    Open = 14,
    Read = 15,
    Write = 16,
    Statfs = 17,
    Release = 18,
    Fsync = 20,
    Init = 26,
    Opendir = 27,
    Readdir = 28,
    Releasedir = 29,
    Fsyncdir = 30,
    Create = 35,
    Destroy = 38,
    BatchForget = 42,
}

impl TryFrom<u32> for Opcode {
    type Error = ProtoError;

    fn try_from(value: u32) -> Result<Self, ProtoError> {
        Ok(match value {
            1 => Opcode::Lookup,
            2 => Opcode::Forget,
            3 => Opcode::Getattr,
            4 => Opcode::Setattr,
            8 => Opcode::Mknod,
            9 => Opcode::Mkdir,
            10 => Opcode::Unlink,
            11 => Opcode::Rmdir,
            12 => Opcode::Rename,
            14 => Opcode::Open,
            15 => Opcode::Read,
            16 => Opcode::Write,
            17 => Opcode::Statfs,
            18 => Opcode::Release,
            20 => Opcode::Fsync,
            26 => Opcode::Init,
            27 => Opcode::Opendir,
            28 => Opcode::Readdir,
            29 => Opcode::Releasedir,
            30 => Opcode::Fsyncdir,
            35 => Opcode::Create,
            38 => Opcode::Destroy,
            42 => Opcode::BatchForget,
            other => return Err(ProtoError::UnknownOpcode(other)),
        })
    }
}

/// POSIX attributes of a remote object, as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Attr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub atimensec: u32,
    pub mtimensec: u32,
    pub ctimensec: u32,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
}

/// Wire size of [`Attr`].
pub const ATTR_LEN: usize = 88;

impl Attr {
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.ino);
        buf.put_u64_le(self.size);
        buf.put_u64_le(self.blocks);
        buf.put_u64_le(self.atime);
        buf.put_u64_le(self.mtime);
        buf.put_u64_le(self.ctime);
        buf.put_u32_le(self.atimensec);
        buf.put_u32_le(self.mtimensec);
        buf.put_u32_le(self.ctimensec);
        buf.put_u32_le(self.mode);
        buf.put_u32_le(self.nlink);
        buf.put_u32_le(self.uid);
        buf.put_u32_le(self.gid);
        buf.put_u32_le(self.rdev);
        buf.put_u32_le(self.blksize);
        buf.put_u32_le(0); // padding
    }

    fn get(buf: &mut impl Buf) -> Self {
        let attr = Self {
            ino: buf.get_u64_le(),
            size: buf.get_u64_le(),
            blocks: buf.get_u64_le(),
            atime: buf.get_u64_le(),
            mtime: buf.get_u64_le(),
            ctime: buf.get_u64_le(),
            atimensec: buf.get_u32_le(),
            mtimensec: buf.get_u32_le(),
            ctimensec: buf.get_u32_le(),
            mode: buf.get_u32_le(),
            nlink: buf.get_u32_le(),
            uid: buf.get_u32_le(),
            gid: buf.get_u32_le(),
            rdev: buf.get_u32_le(),
            blksize: buf.get_u32_le(),
        };
        buf.advance(4); // padding
        attr
    }

    /// Whether the mode bits describe a directory.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    /// Whether the mode bits describe a symbolic link.
    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFLNK
    }
}

/// Fields that can change in a SETATTR request. `valid` selects which of
/// the other fields the remote side should apply.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetattrIn {
    pub valid: u32,
    pub fh: u64,
    pub size: u64,
    pub atime: u64,
    pub mtime: u64,
    pub atimensec: u32,
    pub mtimensec: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// Outbound request payloads, one variant per opcode this engine sends.
#[derive(Debug)]
pub enum RequestBody<'a> {
    Lookup { name: &'a str },
    Forget { nlookup: u64 },
    BatchForget { items: &'a [(u64, u64)] },
    Getattr { flags: u32, fh: u64 },
    Setattr(SetattrIn),
    Mknod { mode: u32, rdev: u32, umask: u32, name: &'a str },
    Mkdir { mode: u32, umask: u32, name: &'a str },
    Unlink { name: &'a str },
    Rmdir { name: &'a str },
    Rename { newdir: u64, name: &'a str, newname: &'a str },
    Open { flags: u32 },
    Read { fh: u64, offset: u64, size: u32 },
    Write { fh: u64, offset: u64, flags: u32, data: &'a [u8] },
    Statfs,
    Release { fh: u64, flags: u32 },
    Fsync { fh: u64, datasync: bool },
    Init { max_readahead: u32, flags: u32 },
    Opendir { flags: u32 },
    Readdir { fh: u64, offset: u64, size: u32 },
    Releasedir { fh: u64, flags: u32 },
    Fsyncdir { fh: u64, datasync: bool },
    Create { flags: u32, mode: u32, umask: u32, name: &'a str },
    Destroy,
}

impl RequestBody<'_> {
    /// The opcode this payload is carried under.
    #[must_use]
    pub fn opcode(&self) -> Opcode {
        match self {
            RequestBody::Lookup { .. } => Opcode::Lookup,
            RequestBody::Forget { .. } => Opcode::Forget,
            RequestBody::BatchForget { .. } => Opcode::BatchForget,
            RequestBody::Getattr { .. } => Opcode::Getattr,
            RequestBody::Setattr(_) => Opcode::Setattr,
            RequestBody::Mknod { .. } => Opcode::Mknod,
            RequestBody::Mkdir { .. } => Opcode::Mkdir,
            RequestBody::Unlink { .. } => Opcode::Unlink,
            RequestBody::Rmdir { .. } => Opcode::Rmdir,
            RequestBody::Rename { .. } => Opcode::Rename,
            RequestBody::Open { .. } => Opcode::Open,
            RequestBody::Read { .. } => Opcode::Read,
            RequestBody::Write { .. } => Opcode::Write,
            RequestBody::Statfs => Opcode::Statfs,
            RequestBody::Release { .. } => Opcode::Release,
            RequestBody::Fsync { .. } => Opcode::Fsync,
            RequestBody::Init { .. } => Opcode::Init,
            RequestBody::Opendir { .. } => Opcode::Opendir,
            RequestBody::Readdir { .. } => Opcode::Readdir,
            RequestBody::Releasedir { .. } => Opcode::Releasedir,
            RequestBody::Fsyncdir { .. } => Opcode::Fsyncdir,
            RequestBody::Create { .. } => Opcode::Create,
            RequestBody::Destroy => Opcode::Destroy,
        }
    }
}

fn put_name(buf: &mut BytesMut, name: &str) {
    buf.put_slice(name.as_bytes());
    buf.put_u8(0);
}

/// Encode a complete outbound request: fixed header plus payload.
///
/// `unique` is the correlation token the response must echo; `nodeid` is
/// the target object; the caller identity rides in the header so the
/// remote side can apply its own checks.
#[must_use]
pub fn encode_request(unique: u64, nodeid: u64, caller: Caller, body: &RequestBody<'_>) -> Bytes {
    let mut buf = BytesMut::with_capacity(REQUEST_HEADER_LEN + 64);
    buf.put_u32_le(0); // length, patched below
    buf.put_u32_le(body.opcode() as u32);
    buf.put_u64_le(unique);
    buf.put_u64_le(nodeid);
    buf.put_u32_le(caller.uid);
    buf.put_u32_le(caller.gid);
    buf.put_u32_le(caller.pid);
    buf.put_u32_le(0); // padding
    debug_assert_eq!(buf.len(), REQUEST_HEADER_LEN);

    match *body {
        RequestBody::Lookup { name }
        | RequestBody::Unlink { name }
        | RequestBody::Rmdir { name } => put_name(&mut buf, name),
        RequestBody::Forget { nlookup } => buf.put_u64_le(nlookup),
        RequestBody::BatchForget { items } => {
            buf.put_u32_le(items.len() as u32);
            buf.put_u32_le(0);
            for &(ino, nlookup) in items {
                buf.put_u64_le(ino);
                buf.put_u64_le(nlookup);
            }
        }
        RequestBody::Getattr { flags, fh } => {
            buf.put_u32_le(flags);
            buf.put_u32_le(0);
            buf.put_u64_le(fh);
        }
        RequestBody::Setattr(attr) => {
            buf.put_u32_le(attr.valid);
            buf.put_u32_le(0);
            buf.put_u64_le(attr.fh);
            buf.put_u64_le(attr.size);
            buf.put_u64_le(0); // lock owner
            buf.put_u64_le(attr.atime);
            buf.put_u64_le(attr.mtime);
            buf.put_u64_le(0); // ctime
            buf.put_u32_le(attr.atimensec);
            buf.put_u32_le(attr.mtimensec);
            buf.put_u32_le(0); // ctimensec
            buf.put_u32_le(attr.mode);
            buf.put_u32_le(0);
            buf.put_u32_le(attr.uid);
            buf.put_u32_le(attr.gid);
            buf.put_u32_le(0);
        }
        RequestBody::Mknod {
            mode,
            rdev,
            umask,
            name,
        } => {
            buf.put_u32_le(mode);
            buf.put_u32_le(rdev);
            buf.put_u32_le(umask);
            buf.put_u32_le(0);
            put_name(&mut buf, name);
        }
        RequestBody::Mkdir { mode, umask, name } => {
            buf.put_u32_le(mode);
            buf.put_u32_le(umask);
            put_name(&mut buf, name);
        }
        RequestBody::Rename {
            newdir,
            name,
            newname,
        } => {
            buf.put_u64_le(newdir);
            put_name(&mut buf, name);
            put_name(&mut buf, newname);
        }
        RequestBody::Open { flags } | RequestBody::Opendir { flags } => {
            buf.put_u32_le(flags);
            buf.put_u32_le(0);
        }
        RequestBody::Read { fh, offset, size } | RequestBody::Readdir { fh, offset, size } => {
            buf.put_u64_le(fh);
            buf.put_u64_le(offset);
            buf.put_u32_le(size);
            buf.put_u32_le(0); // read flags
            buf.put_u64_le(0); // lock owner
            buf.put_u32_le(0); // open flags
            buf.put_u32_le(0);
        }
        RequestBody::Write {
            fh,
            offset,
            flags,
            data,
        } => {
            buf.put_u64_le(fh);
            buf.put_u64_le(offset);
            buf.put_u32_le(data.len() as u32);
            buf.put_u32_le(flags);
            buf.put_u64_le(0); // lock owner
            buf.put_u32_le(0); // open flags
            buf.put_u32_le(0);
            buf.put_slice(data);
        }
        RequestBody::Statfs | RequestBody::Destroy => {}
        RequestBody::Release { fh, flags } | RequestBody::Releasedir { fh, flags } => {
            buf.put_u64_le(fh);
            buf.put_u32_le(flags);
            buf.put_u32_le(0); // release flags
            buf.put_u64_le(0); // lock owner
        }
        RequestBody::Fsync { fh, datasync } | RequestBody::Fsyncdir { fh, datasync } => {
            buf.put_u64_le(fh);
            buf.put_u32_le(u32::from(datasync));
            buf.put_u32_le(0);
        }
        RequestBody::Init {
            max_readahead,
            flags,
        } => {
            buf.put_u32_le(KERNEL_VERSION);
            buf.put_u32_le(KERNEL_MINOR_VERSION);
            buf.put_u32_le(max_readahead);
            buf.put_u32_le(flags);
        }
        RequestBody::Create {
            flags,
            mode,
            umask,
            name,
        } => {
            buf.put_u32_le(flags);
            buf.put_u32_le(mode);
            buf.put_u32_le(umask);
            buf.put_u32_le(0);
            put_name(&mut buf, name);
        }
    }

    let len = buf.len() as u32;
    buf[0..4].copy_from_slice(&len.to_le_bytes());
    buf.freeze()
}

/// A decoded inbound response: header fields plus the raw payload.
#[derive(Debug, Clone)]
pub struct Response {
    /// Correlation token echoed from the request.
    pub unique: u64,
    /// Magnitude of the errno, zero on success.
    pub errno: i32,
    /// Opcode-specific payload bytes.
    pub payload: Bytes,
}

impl Response {
    /// Shorthand: the payload of a successful response, or the errno
    /// mapped through the configured flavor table.
    pub fn ok(&self, table: errno::ErrnoTable) -> Result<&Bytes, crate::error::Status> {
        if self.errno == 0 {
            Ok(&self.payload)
        } else {
            Err(table(self.errno))
        }
    }
}

/// Decode a response header and split off its payload.
///
/// The declared length must match the buffer exactly; anything else is a
/// transport error fatal to the request it belongs to.
pub fn decode_response(mut buf: Bytes) -> Result<Response, ProtoError> {
    if buf.len() < RESPONSE_HEADER_LEN {
        return Err(ProtoError::Truncated {
            got: buf.len(),
            need: RESPONSE_HEADER_LEN,
        });
    }
    let declared = buf.get_u32_le();
    if declared as usize != buf.len() + 4 {
        return Err(ProtoError::BadLength {
            declared,
            actual: buf.len() + 4,
        });
    }
    // Magnitude only; the one value with no positive counterpart maps to
    // an out-of-table code.
    let errno = i32::try_from(buf.get_i32_le().unsigned_abs()).unwrap_or(i32::MAX);
    let unique = buf.get_u64_le();
    Ok(Response {
        unique,
        errno,
        payload: buf,
    })
}

fn need(buf: &[u8], len: usize) -> Result<(), ProtoError> {
    if buf.len() < len {
        return Err(ProtoError::Truncated {
            got: buf.len(),
            need: len,
        });
    }
    Ok(())
}

/// LOOKUP/MKDIR/MKNOD response payload: resolved identity plus validity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryOut {
    pub nodeid: u64,
    pub generation: u64,
    /// Seconds the name→nodeid binding stays valid.
    pub entry_valid: u64,
    /// Seconds the attributes stay valid.
    pub attr_valid: u64,
    pub entry_valid_nsec: u32,
    pub attr_valid_nsec: u32,
    pub attr: Attr,
}

/// Wire size of [`EntryOut`].
pub const ENTRY_OUT_LEN: usize = 40 + ATTR_LEN;

impl EntryOut {
    pub fn decode(mut buf: &[u8]) -> Result<Self, ProtoError> {
        need(buf, ENTRY_OUT_LEN)?;
        Ok(Self {
            nodeid: buf.get_u64_le(),
            generation: buf.get_u64_le(),
            entry_valid: buf.get_u64_le(),
            attr_valid: buf.get_u64_le(),
            entry_valid_nsec: buf.get_u32_le(),
            attr_valid_nsec: buf.get_u32_le(),
            attr: Attr::get(&mut buf),
        })
    }

    /// Encode, for tests standing in for the remote server.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ENTRY_OUT_LEN);
        buf.put_u64_le(self.nodeid);
        buf.put_u64_le(self.generation);
        buf.put_u64_le(self.entry_valid);
        buf.put_u64_le(self.attr_valid);
        buf.put_u32_le(self.entry_valid_nsec);
        buf.put_u32_le(self.attr_valid_nsec);
        self.attr.put(&mut buf);
        buf.freeze()
    }
}

/// GETATTR/SETATTR response payload.
#[derive(Debug, Clone, Copy)]
pub struct AttrOut {
    pub attr_valid: u64,
    pub attr_valid_nsec: u32,
    pub attr: Attr,
}

/// Wire size of [`AttrOut`].
pub const ATTR_OUT_LEN: usize = 16 + ATTR_LEN;

impl AttrOut {
    pub fn decode(mut buf: &[u8]) -> Result<Self, ProtoError> {
        need(buf, ATTR_OUT_LEN)?;
        let attr_valid = buf.get_u64_le();
        let attr_valid_nsec = buf.get_u32_le();
        buf.advance(4); // dummy
        Ok(Self {
            attr_valid,
            attr_valid_nsec,
            attr: Attr::get(&mut buf),
        })
    }

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ATTR_OUT_LEN);
        buf.put_u64_le(self.attr_valid);
        buf.put_u32_le(self.attr_valid_nsec);
        buf.put_u32_le(0);
        self.attr.put(&mut buf);
        buf.freeze()
    }
}

/// OPEN/OPENDIR/CREATE(second half) response payload.
#[derive(Debug, Clone, Copy)]
pub struct OpenOut {
    pub fh: u64,
    pub open_flags: u32,
}

/// Wire size of [`OpenOut`].
pub const OPEN_OUT_LEN: usize = 16;

impl OpenOut {
    pub fn decode(mut buf: &[u8]) -> Result<Self, ProtoError> {
        need(buf, OPEN_OUT_LEN)?;
        let fh = buf.get_u64_le();
        let open_flags = buf.get_u32_le();
        Ok(Self { fh, open_flags })
    }

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(OPEN_OUT_LEN);
        buf.put_u64_le(self.fh);
        buf.put_u32_le(self.open_flags);
        buf.put_u32_le(0);
        buf.freeze()
    }
}

/// CREATE success payload: entry followed by open handle.
#[derive(Debug, Clone, Copy)]
pub struct CreateOut {
    pub entry: EntryOut,
    pub open: OpenOut,
}

impl CreateOut {
    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        need(buf, ENTRY_OUT_LEN + OPEN_OUT_LEN)?;
        Ok(Self {
            entry: EntryOut::decode(&buf[..ENTRY_OUT_LEN])?,
            open: OpenOut::decode(&buf[ENTRY_OUT_LEN..])?,
        })
    }

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ENTRY_OUT_LEN + OPEN_OUT_LEN);
        buf.put_slice(&self.entry.encode());
        buf.put_slice(&self.open.encode());
        buf.freeze()
    }
}

/// WRITE response payload.
#[derive(Debug, Clone, Copy)]
pub struct WriteOut {
    pub size: u32,
}

impl WriteOut {
    pub fn decode(mut buf: &[u8]) -> Result<Self, ProtoError> {
        need(buf, 8)?;
        Ok(Self {
            size: buf.get_u32_le(),
        })
    }

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u32_le(self.size);
        buf.put_u32_le(0);
        buf.freeze()
    }
}

/// STATFS response payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatfsOut {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// Wire size of [`StatfsOut`].
pub const STATFS_OUT_LEN: usize = 80;

impl StatfsOut {
    pub fn decode(mut buf: &[u8]) -> Result<Self, ProtoError> {
        need(buf, STATFS_OUT_LEN)?;
        Ok(Self {
            blocks: buf.get_u64_le(),
            bfree: buf.get_u64_le(),
            bavail: buf.get_u64_le(),
            files: buf.get_u64_le(),
            ffree: buf.get_u64_le(),
            bsize: buf.get_u32_le(),
            namelen: buf.get_u32_le(),
            frsize: buf.get_u32_le(),
        })
    }

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(STATFS_OUT_LEN);
        buf.put_u64_le(self.blocks);
        buf.put_u64_le(self.bfree);
        buf.put_u64_le(self.bavail);
        buf.put_u64_le(self.files);
        buf.put_u64_le(self.ffree);
        buf.put_u32_le(self.bsize);
        buf.put_u32_le(self.namelen);
        buf.put_u32_le(self.frsize);
        buf.put_u32_le(0); // padding
        buf.put_slice(&[0u8; 24]); // spare
        buf.freeze()
    }
}

/// INIT response payload. Only the fields this engine consumes are kept;
/// trailing fields added by later minors are tolerated and ignored.
#[derive(Debug, Clone, Copy)]
pub struct InitOut {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub flags: u32,
    pub max_write: u32,
}

impl InitOut {
    pub fn decode(mut buf: &[u8]) -> Result<Self, ProtoError> {
        need(buf, 24)?;
        let major = buf.get_u32_le();
        let minor = buf.get_u32_le();
        let max_readahead = buf.get_u32_le();
        let flags = buf.get_u32_le();
        buf.advance(4); // max_background / congestion_threshold
        let max_write = buf.get_u32_le();
        Ok(Self {
            major,
            minor,
            max_readahead,
            flags,
            max_write,
        })
    }

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(24);
        buf.put_u32_le(self.major);
        buf.put_u32_le(self.minor);
        buf.put_u32_le(self.max_readahead);
        buf.put_u32_le(self.flags);
        buf.put_u16_le(0); // max background
        buf.put_u16_le(0); // congestion threshold
        buf.put_u32_le(self.max_write);
        buf.freeze()
    }
}

/// One entry of a READDIR response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent {
    pub ino: u64,
    /// Opaque resume offset for the *next* READDIR call.
    pub off: u64,
    /// `DT_*`-style type code.
    pub typ: u32,
    pub name: String,
}

impl Dirent {
    /// Encode one dirent with its trailing 8-byte alignment padding,
    /// for tests standing in for the remote server.
    pub fn put(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.ino);
        buf.put_u64_le(self.off);
        buf.put_u32_le(self.name.len() as u32);
        buf.put_u32_le(self.typ);
        buf.put_slice(self.name.as_bytes());
        let padded = self.name.len().next_multiple_of(8);
        buf.put_bytes(0, padded - self.name.len());
    }
}

/// Iterator over the dirents packed into a READDIR payload.
///
/// Stops at the first truncated record; an empty payload signals
/// end-of-directory.
pub struct DirentIter<'a> {
    buf: &'a [u8],
}

impl<'a> DirentIter<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }
}

impl Iterator for DirentIter<'_> {
    type Item = Dirent;

    fn next(&mut self) -> Option<Dirent> {
        if self.buf.len() < 24 {
            return None;
        }
        let mut head = self.buf;
        let ino = head.get_u64_le();
        let off = head.get_u64_le();
        let namelen = head.get_u32_le() as usize;
        let typ = head.get_u32_le();
        if head.len() < namelen {
            return None;
        }
        let name = String::from_utf8_lossy(&head[..namelen]).into_owned();
        let advance = 24 + namelen.next_multiple_of(8);
        self.buf = &self.buf[advance.min(self.buf.len())..];
        Some(Dirent { ino, off, typ, name })
    }
}

/// Build a complete response buffer, for tests standing in for the remote
/// server: header (length, negated errno, token) plus payload.
#[must_use]
pub fn encode_response(unique: u64, errno: i32, payload: &[u8]) -> Bytes {
    let len = RESPONSE_HEADER_LEN + payload.len();
    let mut buf = BytesMut::with_capacity(len);
    buf.put_u32_le(len as u32);
    buf.put_i32_le(-errno.abs());
    buf.put_u64_le(unique);
    buf.put_slice(payload);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_header_layout() {
        let caller = Caller {
            uid: 1000,
            gid: 100,
            pid: 42,
        };
        let msg = encode_request(7, 1, caller, &RequestBody::Lookup { name: "file0" });
        assert_eq!(msg.len(), REQUEST_HEADER_LEN + "file0".len() + 1);
        assert_eq!(&msg[..4], &(msg.len() as u32).to_le_bytes());
        assert_eq!(&msg[4..8], &1u32.to_le_bytes()); // LOOKUP
        assert_eq!(&msg[8..16], &7u64.to_le_bytes());
        assert_eq!(&msg[16..24], &1u64.to_le_bytes());
        assert_eq!(msg[msg.len() - 1], 0, "name is NUL terminated");
    }

    #[test]
    fn init_request_size_and_version() {
        let msg = encode_request(
            1,
            0,
            Caller::default(),
            &RequestBody::Init {
                max_readahead: 0,
                flags: 0,
            },
        );
        assert_eq!(msg.len(), REQUEST_HEADER_LEN + 16);
        assert_eq!(&msg[40..44], &KERNEL_VERSION.to_le_bytes());
        assert_eq!(&msg[44..48], &KERNEL_MINOR_VERSION.to_le_bytes());
    }

    #[test]
    fn response_round_trip() {
        let payload = WriteOut { size: 512 }.encode();
        let wire = encode_response(99, 0, &payload);
        let resp = decode_response(wire).unwrap();
        assert_eq!(resp.unique, 99);
        assert_eq!(resp.errno, 0);
        assert_eq!(WriteOut::decode(&resp.payload).unwrap().size, 512);
    }

    #[test]
    fn response_errno_is_magnitude_only() {
        let wire = encode_response(3, libc::ENOENT, &[]);
        let resp = decode_response(wire).unwrap();
        assert_eq!(resp.errno, libc::ENOENT);
    }

    #[test]
    fn extreme_errno_survives_decoding() {
        let mut wire = BytesMut::new();
        wire.put_u32_le(16);
        wire.put_i32_le(i32::MIN);
        wire.put_u64_le(5);
        let resp = decode_response(wire.freeze()).unwrap();
        assert!(resp.errno > 0);
        assert_eq!(errno::linux(resp.errno), crate::error::Status::IoError);
    }

    #[test]
    fn unknown_opcodes_are_rejected() {
        assert_eq!(Opcode::try_from(26).unwrap(), Opcode::Init);
        assert!(Opcode::try_from(999).is_err());
    }

    #[test]
    fn bad_length_rejected() {
        let mut wire = BytesMut::new();
        wire.put_u32_le(64); // lies about its size
        wire.put_i32_le(0);
        wire.put_u64_le(1);
        assert!(matches!(
            decode_response(wire.freeze()),
            Err(ProtoError::BadLength { .. })
        ));
    }

    #[test]
    fn entry_out_round_trip() {
        let entry = EntryOut {
            nodeid: 17,
            generation: 2,
            entry_valid: 5,
            attr_valid: 3,
            entry_valid_nsec: 100,
            attr_valid_nsec: 200,
            attr: Attr {
                ino: 17,
                size: 4096,
                mode: libc::S_IFREG | 0o644,
                nlink: 1,
                uid: 1000,
                gid: 100,
                ..Attr::default()
            },
        };
        let decoded = EntryOut::decode(&entry.encode()).unwrap();
        assert_eq!(decoded, entry);
        assert!(!decoded.attr.is_dir());
    }

    #[test]
    fn dirent_iteration_with_padding() {
        let mut buf = BytesMut::new();
        for (i, name) in [".", "..", "somewhat-long-name"].iter().enumerate() {
            Dirent {
                ino: i as u64 + 1,
                off: i as u64 + 1,
                typ: libc::DT_REG as u32,
                name: (*name).to_owned(),
            }
            .put(&mut buf);
        }
        let names: Vec<_> = DirentIter::new(&buf).map(|d| d.name).collect();
        assert_eq!(names, [".", "..", "somewhat-long-name"]);
    }
}
