//! Operation handlers.
//!
//! Each handler is a plain function driven by the dispatcher through the
//! context's resumption stack: it is re-entered once per inbound response
//! until it returns [`Flow::Complete`]. Handlers stage outbound messages
//! with [`RequestContext::send`] and record their terminal outcome with
//! `fail`/`done`; the engine turns that into the host-facing response.

pub(crate) mod create;
pub(crate) mod dirquery;
pub(crate) mod misc;
pub(crate) mod reserved;
pub(crate) mod rw;
pub(crate) mod security;
pub(crate) mod setinfo;

use crate::context::{OpKind, RequestContext};
use crate::coro::Flow;
use crate::error::Status;
use crate::instance::Instance;
use crate::request::{FileAccess, FsOp};

/// Route a context to its handler. Called on every (re-)entry.
pub(crate) fn dispatch(inst: &Instance, ctx: &mut RequestContext) -> Flow {
    match ctx.kind {
        OpKind::Init => reserved::init(inst, ctx),
        OpKind::Destroy => reserved::destroy(inst, ctx),
        OpKind::Forget => reserved::forget(inst, ctx),
        OpKind::External => {
            let Some(request) = ctx.request.as_ref() else {
                ctx.fail(Status::InvalidParameter);
                return Flow::Complete;
            };
            match request.op {
                FsOp::Create { .. } => create::create(inst, ctx),
                FsOp::Read { .. } => rw::read(inst, ctx),
                FsOp::Write { .. } => rw::write(inst, ctx),
                FsOp::Flush { .. } => rw::flush(inst, ctx),
                FsOp::QueryDirectory { .. } => dirquery::query_directory(inst, ctx),
                FsOp::SetInformation { .. } => setinfo::set_information(inst, ctx),
                FsOp::Cleanup { .. } => misc::cleanup(inst, ctx),
                FsOp::Close { .. } => misc::close(inst, ctx),
                FsOp::QuerySecurity { .. } => security::query_security(inst, ctx),
                FsOp::SetSecurity { .. } => security::set_security(inst, ctx),
                FsOp::QueryVolumeInformation => misc::query_volume(inst, ctx),
            }
        }
    }
}

/// Clone the driving operation out of the context. Cheap: the bulky
/// payloads inside are reference-counted.
pub(crate) fn op_of(ctx: &RequestContext) -> Option<FsOp> {
    ctx.request.as_ref().map(|r| r.op.clone())
}

/// Load the open-file record for `fh` into the context, once.
pub(crate) fn load_file(inst: &Instance, ctx: &mut RequestContext, fh: u64) -> Result<(), Status> {
    if ctx.file.is_none() {
        ctx.file = inst.files.get(fh);
    }
    if ctx.file.is_some() {
        Ok(())
    } else {
        Err(Status::InvalidParameter)
    }
}

/// Map requested access rights to POSIX open flags.
#[must_use]
pub(crate) fn open_flags(access: FileAccess) -> u32 {
    let read = access.intersects(FileAccess::READ_DATA | FileAccess::EXECUTE);
    let write = access.intersects(FileAccess::WRITE_DATA | FileAccess::APPEND_DATA);
    let base = if read && write {
        libc::O_RDWR
    } else if write {
        libc::O_WRONLY
    } else {
        libc::O_RDONLY
    };
    base as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_to_open_flags() {
        assert_eq!(open_flags(FileAccess::READ_DATA), libc::O_RDONLY as u32);
        assert_eq!(open_flags(FileAccess::WRITE_DATA), libc::O_WRONLY as u32);
        assert_eq!(
            open_flags(FileAccess::READ_DATA | FileAccess::APPEND_DATA),
            libc::O_RDWR as u32
        );
        assert_eq!(open_flags(FileAccess::READ_ATTRIBUTES), libc::O_RDONLY as u32);
    }
}
