//! Cleanup, close, and volume information.
//!
//! Cleanup and close are teardown: remote failures during them are
//! logged and swallowed, because the host has already moved on and has
//! nobody to report them to.

use tracing::debug;

use crate::context::RequestContext;
use crate::coro::Flow;
use crate::error::Status;
use crate::instance::Instance;
use crate::ops::{load_file, op_of};
use crate::proto::{self, RequestBody, StatfsOut};
use crate::request::{FsOp, FsReply, VolumeInfo};

fn bad(ctx: &mut RequestContext, status: Status) -> Flow {
    ctx.fail(status);
    Flow::Complete
}

/// Carry out a pending delete before the handle goes away.
pub(crate) fn cleanup(inst: &Instance, ctx: &mut RequestContext) -> Flow {
    match ctx.coro.point() {
        0 => {
            let Some(FsOp::Cleanup { fh, delete }) = op_of(ctx) else {
                return bad(ctx, Status::InvalidParameter);
            };
            if let Err(status) = load_file(inst, ctx, fh) {
                return bad(ctx, status);
            }
            let Some(file) = ctx.file.clone() else {
                return bad(ctx, Status::InvalidParameter);
            };
            let armed = delete || file.delete_pending;
            if !armed || file.name.is_empty() || file.is_reparse {
                ctx.done(FsReply::Unit);
                return Flow::Complete;
            }
            if file.is_dir {
                ctx.send(file.parent, &RequestBody::Rmdir { name: &file.name });
            } else {
                ctx.send(file.parent, &RequestBody::Unlink { name: &file.name });
            }
            ctx.coro.suspend(1)
        }
        _ => {
            if let Err(status) = ctx.take_errno(inst.errno_table()) {
                debug!(%status, "delete during cleanup failed");
            }
            let Some(FsOp::Cleanup { fh, .. }) = op_of(ctx) else {
                return bad(ctx, Status::InvalidParameter);
            };
            if let Some(file) = ctx.file.as_ref() {
                inst.cache.remove_entry(file.parent, &file.name);
            }
            inst.files.update(fh, |f| f.delete_pending = false);
            ctx.done(FsReply::Unit);
            Flow::Complete
        }
    }
}

/// Release the remote handle and drop the open-file record.
pub(crate) fn close(inst: &Instance, ctx: &mut RequestContext) -> Flow {
    match ctx.coro.point() {
        0 => {
            let Some(FsOp::Close { fh }) = op_of(ctx) else {
                return bad(ctx, Status::InvalidParameter);
            };
            let Some(mut file) = inst.files.remove(fh) else {
                return bad(ctx, Status::InvalidParameter);
            };
            // Park the record's cache pin where the context finalizer
            // releases it, whichever way the context ends.
            ctx.walk.item = file.item.take();
            if file.is_reparse {
                ctx.done(FsReply::Unit);
                return Flow::Complete;
            }
            if file.is_dir {
                ctx.send(
                    file.ino,
                    &RequestBody::Releasedir {
                        fh: file.remote_fh,
                        flags: 0,
                    },
                );
            } else {
                ctx.send(
                    file.ino,
                    &RequestBody::Release {
                        fh: file.remote_fh,
                        flags: 0,
                    },
                );
            }
            ctx.file = Some(file);
            ctx.coro.suspend(1)
        }
        _ => {
            if let Err(status) = ctx.take_errno(inst.errno_table()) {
                debug!(%status, "remote release failed");
            }
            ctx.done(FsReply::Unit);
            Flow::Complete
        }
    }
}

pub(crate) fn query_volume(inst: &Instance, ctx: &mut RequestContext) -> Flow {
    match ctx.coro.point() {
        0 => {
            if let Some(info) = inst.cached_volume_info() {
                ctx.done(FsReply::Volume(info));
                return Flow::Complete;
            }
            ctx.send(proto::ROOT_ID, &RequestBody::Statfs);
            ctx.coro.suspend(1)
        }
        _ => {
            let out = match ctx
                .take_payload(inst.errno_table())
                .and_then(|p| StatfsOut::decode(&p).map_err(Status::from))
            {
                Ok(out) => out,
                Err(status) => return bad(ctx, status),
            };
            let frsize = u64::from(if out.frsize != 0 { out.frsize } else { out.bsize.max(1) });
            let config = inst.config();
            let max_component = if out.namelen != 0 {
                out.namelen.min(config.max_component_length)
            } else {
                config.max_component_length
            };
            let info = VolumeInfo {
                total_bytes: out.blocks.saturating_mul(frsize),
                free_bytes: out.bavail.saturating_mul(frsize),
                sector_size: config.sector_size,
                allocation_unit: config.allocation_unit,
                max_component_length: max_component,
                unc_prefix: config.unc_prefix.clone(),
                fs_name: config.fs_name.clone(),
            };
            inst.store_volume_info(info.clone());
            ctx.done(FsReply::Volume(info));
            Flow::Complete
        }
    }
}
