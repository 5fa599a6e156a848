//! Read, write, and flush.
//!
//! Reads and writes are chunked to the remote side's negotiated transfer
//! limits and looped until satisfied. A short read ends the loop (the
//! remote signalled end-of-data); a write starts with a handle-based
//! GETATTR so append and constrained modes can position against the
//! current file size without trusting possibly-stale cached attributes.

use tracing::debug;

use crate::context::RequestContext;
use crate::coro::Flow;
use crate::error::Status;
use crate::instance::Instance;
use crate::ops::{load_file, op_of};
use crate::proto::{AttrOut, RequestBody, WriteOut, GETATTR_FH};
use crate::request::{FsOp, FsReply};

fn bad(ctx: &mut RequestContext, status: Status) -> Flow {
    ctx.fail(status);
    Flow::Complete
}

pub(crate) fn read(inst: &Instance, ctx: &mut RequestContext) -> Flow {
    loop {
        match ctx.coro.point() {
            0 => {
                let Some(FsOp::Read { fh, offset, length }) = op_of(ctx) else {
                    return bad(ctx, Status::InvalidParameter);
                };
                if let Err(status) = load_file(inst, ctx, fh) {
                    return bad(ctx, status);
                }
                if ctx.file.as_ref().is_some_and(|f| f.is_dir || f.is_reparse) {
                    return bad(ctx, Status::InvalidParameter);
                }
                if length == 0 {
                    ctx.done(FsReply::Read {
                        data: bytes::Bytes::new(),
                    });
                    return Flow::Complete;
                }
                let s = ctx.scratch_read();
                s.offset = offset;
                s.remaining = length;
                s.data = bytes::BytesMut::with_capacity(length as usize);
                ctx.coro.jump(1);
            }
            1 => {
                let max = inst.max_read();
                let s = ctx.scratch_read();
                if s.remaining == 0 {
                    return finish_read(ctx);
                }
                let chunk = s.remaining.min(max);
                s.chunk = chunk;
                let (offset, chunk) = (s.offset, chunk);
                let Some((ino, remote_fh)) = ctx.file.as_ref().map(|f| (f.ino, f.remote_fh))
                else {
                    return bad(ctx, Status::InvalidParameter);
                };
                ctx.send(
                    ino,
                    &RequestBody::Read {
                        fh: remote_fh,
                        offset,
                        size: chunk,
                    },
                );
                return ctx.coro.suspend(2);
            }
            _ => {
                let payload = match ctx.take_payload(inst.errno_table()) {
                    Ok(payload) => payload,
                    Err(status) => {
                        // A failure after partial progress still returns
                        // the data already read.
                        if ctx.scratch_read().data.is_empty() {
                            return bad(ctx, status);
                        }
                        return finish_read(ctx);
                    }
                };
                let s = ctx.scratch_read();
                let got = (payload.len() as u32).min(s.chunk);
                s.data.extend_from_slice(&payload[..got as usize]);
                s.offset += u64::from(got);
                s.remaining -= got.min(s.remaining);
                if got < s.chunk {
                    // Short read: end of data.
                    return finish_read(ctx);
                }
                ctx.coro.jump(1);
            }
        }
    }
}

fn finish_read(ctx: &mut RequestContext) -> Flow {
    let data = ctx.scratch_read().data.split().freeze();
    if data.is_empty() {
        return bad(ctx, Status::EndOfFile);
    }
    ctx.done(FsReply::Read { data });
    Flow::Complete
}

pub(crate) fn write(inst: &Instance, ctx: &mut RequestContext) -> Flow {
    loop {
        match ctx.coro.point() {
            0 => {
                let Some(FsOp::Write {
                    fh, offset, data, ..
                }) = op_of(ctx)
                else {
                    return bad(ctx, Status::InvalidParameter);
                };
                if let Err(status) = load_file(inst, ctx, fh) {
                    return bad(ctx, status);
                }
                if ctx.file.as_ref().is_some_and(|f| f.is_dir || f.is_reparse) {
                    return bad(ctx, Status::InvalidParameter);
                }
                let s = ctx.scratch_write();
                s.offset = offset;
                s.data = data;
                // Current size first: append positions against it and
                // constrained mode must not extend past it.
                let Some((ino, remote_fh)) = ctx.file.as_ref().map(|f| (f.ino, f.remote_fh))
                else {
                    return bad(ctx, Status::InvalidParameter);
                };
                ctx.send(
                    ino,
                    &RequestBody::Getattr {
                        flags: GETATTR_FH,
                        fh: remote_fh,
                    },
                );
                return ctx.coro.suspend(1);
            }
            1 => {
                let payload = match ctx.take_payload(inst.errno_table()) {
                    Ok(payload) => payload,
                    Err(status) => return bad(ctx, status),
                };
                let out = match AttrOut::decode(&payload) {
                    Ok(out) => out,
                    Err(err) => return bad(ctx, err.into()),
                };
                let Some(FsOp::Write {
                    append,
                    constrained,
                    ..
                }) = op_of(ctx)
                else {
                    return bad(ctx, Status::InvalidParameter);
                };
                let s = ctx.scratch_write();
                s.size = out.attr.size;
                if append {
                    s.offset = s.size;
                }
                if constrained {
                    if s.offset >= s.size {
                        return finish_write(inst, ctx);
                    }
                    let room = s.size - s.offset;
                    if s.data.len() as u64 > room {
                        s.data.truncate(room as usize);
                    }
                }
                ctx.coro.jump(2);
            }
            2 => {
                let max = inst.max_write() as usize;
                let s = ctx.scratch_write();
                let done = s.written as usize;
                if done >= s.data.len() {
                    return finish_write(inst, ctx);
                }
                let chunk = (s.data.len() - done).min(max);
                let part = s.data.slice(done..done + chunk);
                let offset = s.offset + done as u64;
                let Some((ino, remote_fh)) = ctx.file.as_ref().map(|f| (f.ino, f.remote_fh))
                else {
                    return bad(ctx, Status::InvalidParameter);
                };
                ctx.send(
                    ino,
                    &RequestBody::Write {
                        fh: remote_fh,
                        offset,
                        flags: 0,
                        data: &part,
                    },
                );
                return ctx.coro.suspend(3);
            }
            _ => {
                let payload = match ctx.take_payload(inst.errno_table()) {
                    Ok(payload) => payload,
                    Err(status) => {
                        if ctx.scratch_write().written == 0 {
                            return bad(ctx, status);
                        }
                        return finish_write(inst, ctx);
                    }
                };
                let out = match WriteOut::decode(&payload) {
                    Ok(out) => out,
                    Err(err) => return bad(ctx, err.into()),
                };
                if out.size == 0 {
                    // Zero progress; bail rather than spin.
                    if ctx.scratch_write().written == 0 {
                        return bad(ctx, Status::NoSpace);
                    }
                    return finish_write(inst, ctx);
                }
                ctx.scratch_write().written += out.size;
                ctx.coro.jump(2);
            }
        }
    }
}

fn finish_write(inst: &Instance, ctx: &mut RequestContext) -> Flow {
    let (written, end, size) = {
        let s = ctx.scratch_write();
        (s.written, s.offset + u64::from(s.written), s.size)
    };
    // The remote attributes moved under the cache's feet.
    if let Some(item) = ctx.file.as_ref().and_then(|f| f.item) {
        inst.cache.quick_expire_item(item);
    }
    ctx.done(FsReply::Write {
        written,
        size: size.max(end),
    });
    Flow::Complete
}

pub(crate) fn flush(inst: &Instance, ctx: &mut RequestContext) -> Flow {
    match ctx.coro.point() {
        0 => {
            let Some(FsOp::Flush { fh }) = op_of(ctx) else {
                return bad(ctx, Status::InvalidParameter);
            };
            if let Err(status) = load_file(inst, ctx, fh) {
                return bad(ctx, status);
            }
            let Some(file) = ctx.file.clone() else {
                return bad(ctx, Status::InvalidParameter);
            };
            if file.is_reparse {
                ctx.done(FsReply::Unit);
                return Flow::Complete;
            }
            if file.is_dir {
                ctx.send(
                    file.ino,
                    &RequestBody::Fsyncdir {
                        fh: file.remote_fh,
                        datasync: false,
                    },
                );
            } else {
                ctx.send(
                    file.ino,
                    &RequestBody::Fsync {
                        fh: file.remote_fh,
                        datasync: false,
                    },
                );
            }
            ctx.coro.suspend(1)
        }
        _ => {
            match ctx.take_errno(inst.errno_table()) {
                Ok(()) => ctx.done(FsReply::Unit),
                // A remote without fsync support still flushed nothing
                // worse than we did.
                Err(Status::NotSupported) => {
                    debug!("remote does not support fsync; flush is a no-op");
                    ctx.done(FsReply::Unit);
                }
                Err(status) => ctx.fail(status),
            }
            Flow::Complete
        }
    }
}
