//! Session-lifecycle handlers: INIT, DESTROY, and forget draining.
//!
//! These run on engine-internal contexts with no host request behind
//! them. INIT gates the whole session: until it completes, external
//! requests park; a major-version mismatch rejects the session for good.
//! Forget contexts drain their batch one wire turn at a time, batching
//! multiple records per turn once the negotiated minor allows it.

use tracing::{debug, info, warn};

use crate::context::RequestContext;
use crate::coro::Flow;
use crate::error::{ProtoError, Status};
use crate::instance::Instance;
use crate::proto::{InitOut, RequestBody, BATCH_FORGET_MINOR, KERNEL_MINOR_VERSION, KERNEL_VERSION};

pub(crate) fn init(inst: &Instance, ctx: &mut RequestContext) -> Flow {
    match ctx.coro.point() {
        0 => {
            ctx.send(
                0,
                &RequestBody::Init {
                    max_readahead: inst.config().max_readahead,
                    flags: 0,
                },
            );
            ctx.coro.suspend(1)
        }
        _ => {
            let out = match ctx
                .take_payload(inst.errno_table())
                .and_then(|p| InitOut::decode(&p).map_err(Status::from))
            {
                Ok(out) => out,
                Err(status) => {
                    warn!(%status, "session handshake failed");
                    inst.reject_session();
                    ctx.fail(status);
                    return Flow::Complete;
                }
            };
            if out.major != KERNEL_VERSION {
                let err = ProtoError::VersionMismatch {
                    remote: out.major,
                    local: KERNEL_VERSION,
                };
                warn!(%err, "session rejected");
                inst.reject_session();
                ctx.fail(err.into());
                return Flow::Complete;
            }
            let minor = out.minor.min(KERNEL_MINOR_VERSION);
            info!(
                major = out.major,
                minor,
                max_write = out.max_write,
                "session established"
            );
            inst.session_ready(minor, out.max_write);
            Flow::Complete
        }
    }
}

pub(crate) fn destroy(inst: &Instance, ctx: &mut RequestContext) -> Flow {
    match ctx.coro.point() {
        0 => {
            ctx.send(0, &RequestBody::Destroy);
            ctx.coro.suspend(1)
        }
        _ => {
            if let Err(status) = ctx.take_errno(inst.errno_table()) {
                debug!(%status, "remote destroy failed");
            }
            info!("session closed");
            inst.mark_stopped();
            Flow::Complete
        }
    }
}

/// Drain the batch carried in the context's scratch. FORGET turns expect
/// no response, so each send is flagged fire-and-forget and the handler
/// is resumed immediately after the message leaves.
pub(crate) fn forget(inst: &Instance, ctx: &mut RequestContext) -> Flow {
    let batched = inst.minor() >= BATCH_FORGET_MINOR;
    let s = ctx.scratch_forget();
    if s.batch.is_empty() {
        return Flow::Complete;
    }
    if batched && s.batch.len() > 1 {
        let items: Vec<(u64, u64)> = s.batch.drain(..).collect();
        ctx.fire_and_forget = true;
        ctx.send(0, &RequestBody::BatchForget { items: &items });
    } else {
        let Some((ino, nlookup)) = ctx.scratch_forget().batch.pop_front() else {
            return Flow::Complete;
        };
        ctx.fire_and_forget = true;
        ctx.send(ino, &RequestBody::Forget { nlookup });
    }
    ctx.coro.suspend(0)
}
