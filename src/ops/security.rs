//! Security descriptor queries and updates.
//!
//! Descriptors are opaque to the engine; the installed
//! [`SecurityMapper`](crate::request::SecurityMapper) translates between
//! them and POSIX uid/gid/mode. A set-security reads the current
//! attributes and computes the SETATTR in the same handler entry, so no
//! other turn can slip between the read and the decision.

use crate::context::RequestContext;
use crate::coro::Flow;
use crate::error::Status;
use crate::instance::Instance;
use crate::ops::{load_file, op_of};
use crate::proto::{AttrOut, RequestBody, SetattrIn, FATTR_GID, FATTR_MODE, FATTR_UID};
use crate::request::{FsOp, FsReply};

fn bad(ctx: &mut RequestContext, status: Status) -> Flow {
    ctx.fail(status);
    Flow::Complete
}

fn send_getattr(ctx: &mut RequestContext) -> Flow {
    let Some(file) = ctx.file.clone() else {
        return bad(ctx, Status::InvalidParameter);
    };
    let (flags, fh) = if file.is_reparse {
        (0, 0)
    } else {
        (crate::proto::GETATTR_FH, file.remote_fh)
    };
    ctx.send(file.ino, &RequestBody::Getattr { flags, fh });
    ctx.coro.suspend(1)
}

pub(crate) fn query_security(inst: &Instance, ctx: &mut RequestContext) -> Flow {
    match ctx.coro.point() {
        0 => {
            let Some(FsOp::QuerySecurity { fh }) = op_of(ctx) else {
                return bad(ctx, Status::InvalidParameter);
            };
            if let Err(status) = load_file(inst, ctx, fh) {
                return bad(ctx, status);
            }
            // Cached attributes may answer directly when descriptor
            // caching is enabled; their own validity bounds staleness.
            if inst.config().security_timeout > 0 {
                let cached = ctx
                    .file
                    .as_ref()
                    .and_then(|f| inst.cache.get_entry(f.parent, &f.name, inst.now()));
                if let Some((entry, _)) = cached {
                    return match inst.security().descriptor_from_posix(
                        entry.attr.uid,
                        entry.attr.gid,
                        entry.attr.mode,
                    ) {
                        Ok(descriptor) => {
                            ctx.done(FsReply::Security { descriptor });
                            Flow::Complete
                        }
                        Err(status) => bad(ctx, status),
                    };
                }
            }
            send_getattr(ctx)
        }
        _ => {
            let out = match ctx
                .take_payload(inst.errno_table())
                .and_then(|p| AttrOut::decode(&p).map_err(Status::from))
            {
                Ok(out) => out,
                Err(status) => return bad(ctx, status),
            };
            let descriptor = match inst
                .security()
                .descriptor_from_posix(out.attr.uid, out.attr.gid, out.attr.mode)
            {
                Ok(descriptor) => descriptor,
                Err(status) => return bad(ctx, status),
            };
            ctx.done(FsReply::Security { descriptor });
            Flow::Complete
        }
    }
}

pub(crate) fn set_security(inst: &Instance, ctx: &mut RequestContext) -> Flow {
    match ctx.coro.point() {
        0 => {
            let Some(FsOp::SetSecurity { fh, .. }) = op_of(ctx) else {
                return bad(ctx, Status::InvalidParameter);
            };
            if let Err(status) = load_file(inst, ctx, fh) {
                return bad(ctx, status);
            }
            send_getattr(ctx)
        }
        1 => {
            let out = match ctx
                .take_payload(inst.errno_table())
                .and_then(|p| AttrOut::decode(&p).map_err(Status::from))
            {
                Ok(out) => out,
                Err(status) => return bad(ctx, status),
            };
            let Some(FsOp::SetSecurity { descriptor, .. }) = op_of(ctx) else {
                return bad(ctx, Status::InvalidParameter);
            };
            let (uid, gid, mode) = match inst.security().posix_from_descriptor(&descriptor) {
                Ok(bits) => bits,
                Err(status) => return bad(ctx, status),
            };
            // Only fields the descriptor actually changes go on the wire.
            let mut attr = SetattrIn::default();
            if let Some(uid) = uid {
                if uid != out.attr.uid {
                    attr.valid |= FATTR_UID;
                    attr.uid = uid;
                }
            }
            if let Some(gid) = gid {
                if gid != out.attr.gid {
                    attr.valid |= FATTR_GID;
                    attr.gid = gid;
                }
            }
            if let Some(mode) = mode {
                if mode & 0o7777 != out.attr.mode & 0o7777 {
                    attr.valid |= FATTR_MODE;
                    attr.mode = mode & 0o7777;
                }
            }
            if attr.valid == 0 {
                ctx.done(FsReply::Unit);
                return Flow::Complete;
            }
            let Some(ino) = ctx.file.as_ref().map(|f| f.ino) else {
                return bad(ctx, Status::InvalidParameter);
            };
            ctx.send(ino, &RequestBody::Setattr(attr));
            ctx.coro.suspend(2)
        }
        _ => {
            if let Err(status) = ctx.take_errno(inst.errno_table()) {
                return bad(ctx, status);
            }
            if let Some(item) = ctx.file.as_ref().and_then(|f| f.item) {
                inst.cache.quick_expire_item(item);
            }
            ctx.done(FsReply::Unit);
            Flow::Complete
        }
    }
}
