//! Directory queries: enumeration and single-name probes.
//!
//! Enumeration reads remote batches with READDIR and resolves each raw
//! dirent into a fully-attributed outward entry: dot entries through
//! GETATTR (reported against the directory's own id when the remote
//! leaves theirs blank), everything else through the entry cache with a
//! LOOKUP fallback. The output budget terminates a batch early; the
//! resume offset of the last included entry lets the host continue.

use tracing::debug;

use crate::context::RequestContext;
use crate::coro::Flow;
use crate::error::Status;
use crate::instance::Instance;
use crate::ops::{load_file, op_of};
use crate::proto::{AttrOut, Dirent, DirentIter, EntryOut, RequestBody};
use crate::request::{DirInfo, FsOp, FsReply};

/// Bytes one outward entry occupies in the host's buffer: fixed record
/// head plus the name.
const DIR_RECORD_BASE: usize = 104;

/// READDIR transfer size per remote turn.
const READDIR_CHUNK: u32 = 8192;

fn bad(ctx: &mut RequestContext, status: Status) -> Flow {
    ctx.fail(status);
    Flow::Complete
}

fn dir_args(ctx: &RequestContext) -> Option<(u64, Option<String>, u64, u32)> {
    match op_of(ctx)? {
        FsOp::QueryDirectory {
            fh,
            pattern,
            resume_offset,
            buffer_len,
        } => Some((fh, pattern, resume_offset, buffer_len)),
        _ => None,
    }
}

pub(crate) fn query_directory(inst: &Instance, ctx: &mut RequestContext) -> Flow {
    loop {
        match ctx.coro.point() {
            0 => {
                let Some((fh, pattern, resume_offset, _)) = dir_args(ctx) else {
                    return bad(ctx, Status::InvalidParameter);
                };
                if let Err(status) = load_file(inst, ctx, fh) {
                    return bad(ctx, status);
                }
                if !ctx.file.as_ref().is_some_and(|f| f.is_dir) {
                    return bad(ctx, Status::NotADirectory);
                }
                if pattern.is_some() {
                    ctx.coro.jump(6);
                    continue;
                }
                ctx.scratch_dir().next_offset = resume_offset;
                ctx.coro.jump(1);
            }
            // Pull the next queued dirent, or fetch another remote batch.
            1 => {
                let s = ctx.scratch_dir();
                if let Some(dirent) = s.queued.pop_front() {
                    s.current = Some(dirent);
                    ctx.coro.jump(3);
                    continue;
                }
                let offset = s.next_offset;
                let Some(file) = ctx.file.clone() else {
                    return bad(ctx, Status::InvalidParameter);
                };
                ctx.send(
                    file.ino,
                    &RequestBody::Readdir {
                        fh: file.remote_fh,
                        offset,
                        size: READDIR_CHUNK,
                    },
                );
                return ctx.coro.suspend(2);
            }
            // READDIR batch answered.
            2 => {
                let payload = match ctx.take_payload(inst.errno_table()) {
                    Ok(payload) => payload,
                    Err(status) => return bad(ctx, status),
                };
                if payload.is_empty() {
                    return finish_enum(ctx, None);
                }
                let s = ctx.scratch_dir();
                for dirent in DirentIter::new(&payload) {
                    s.next_offset = dirent.off;
                    s.queued.push_back(dirent);
                }
                if s.queued.is_empty() {
                    return finish_enum(ctx, None);
                }
                ctx.coro.jump(1);
            }
            // Resolve the current dirent into an attributed entry.
            3 => {
                let Some((_, _, _, buffer_len)) = dir_args(ctx) else {
                    return bad(ctx, Status::InvalidParameter);
                };
                let Some(dirent) = ctx.scratch_dir().current.clone() else {
                    return bad(ctx, Status::IoError);
                };
                let record = DIR_RECORD_BASE + dirent.name.len();
                {
                    let s = ctx.scratch_dir();
                    if !s.entries.is_empty() && s.bytes_used + record > buffer_len as usize {
                        // Buffer full; the host resumes from the last
                        // included entry.
                        let resume = s.resume;
                        return finish_enum(ctx, Some(resume));
                    }
                }
                let Some(dir_ino) = ctx.file.as_ref().map(|f| f.ino) else {
                    return bad(ctx, Status::InvalidParameter);
                };
                if dirent.name == "." || dirent.name == ".." {
                    let nodeid = if dirent.ino != 0 { dirent.ino } else { dir_ino };
                    ctx.send(nodeid, &RequestBody::Getattr { flags: 0, fh: 0 });
                    return ctx.coro.suspend(4);
                }
                if let Some((entry, _)) = inst.cache.get_entry(dir_ino, &dirent.name, inst.now())
                {
                    push_entry(ctx, &dirent, entry.attr, record);
                    ctx.coro.jump(1);
                    continue;
                }
                ctx.send(dir_ino, &RequestBody::Lookup { name: &dirent.name });
                return ctx.coro.suspend(5);
            }
            // GETATTR for a dot entry answered.
            4 => {
                let Some(dirent) = ctx.scratch_dir().current.clone() else {
                    return bad(ctx, Status::IoError);
                };
                let record = DIR_RECORD_BASE + dirent.name.len();
                match ctx
                    .take_payload(inst.errno_table())
                    .and_then(|p| AttrOut::decode(&p).map_err(Status::from))
                {
                    Ok(out) => {
                        let mut attr = out.attr;
                        if attr.ino == 0 {
                            attr.ino = dirent.ino;
                        }
                        push_entry(ctx, &dirent, attr, record);
                    }
                    Err(status) => {
                        debug!(name = %dirent.name, %status, "dot entry attributes unavailable; skipped");
                        ctx.scratch_dir().current = None;
                    }
                }
                ctx.coro.jump(1);
            }
            // LOOKUP for a regular entry answered.
            5 => {
                let Some(dirent) = ctx.scratch_dir().current.clone() else {
                    return bad(ctx, Status::IoError);
                };
                let record = DIR_RECORD_BASE + dirent.name.len();
                let Some(dir_ino) = ctx.file.as_ref().map(|f| f.ino) else {
                    return bad(ctx, Status::InvalidParameter);
                };
                match ctx
                    .take_payload(inst.errno_table())
                    .and_then(|p| EntryOut::decode(&p).map_err(Status::from))
                {
                    Ok(out) => {
                        let entry = inst.make_listed_entry(&out);
                        inst.cache.set_entry(dir_ino, &dirent.name, entry, inst.now());
                        push_entry(ctx, &dirent, entry.attr, record);
                    }
                    Err(status) => {
                        // The entry vanished between READDIR and LOOKUP.
                        debug!(name = %dirent.name, %status, "entry vanished mid-enumeration; skipped");
                        ctx.scratch_dir().current = None;
                    }
                }
                ctx.coro.jump(1);
            }
            // Single-name probe: cache first, then LOOKUP.
            6 => {
                let Some((_, Some(name), _, _)) = dir_args(ctx) else {
                    return bad(ctx, Status::InvalidParameter);
                };
                let Some(dir_ino) = ctx.file.as_ref().map(|f| f.ino) else {
                    return bad(ctx, Status::InvalidParameter);
                };
                if let Some((entry, _)) = inst.cache.get_entry(dir_ino, &name, inst.now()) {
                    ctx.done(FsReply::Dir {
                        entries: vec![DirInfo {
                            name,
                            attr: entry.attr,
                        }],
                        resume_offset: None,
                    });
                    return Flow::Complete;
                }
                ctx.send(dir_ino, &RequestBody::Lookup { name: &name });
                return ctx.coro.suspend(7);
            }
            // Probe LOOKUP answered.
            _ => {
                let payload = match ctx.take_payload(inst.errno_table()) {
                    Ok(payload) => payload,
                    Err(status) => return bad(ctx, status),
                };
                let out = match EntryOut::decode(&payload) {
                    Ok(out) => out,
                    Err(err) => return bad(ctx, err.into()),
                };
                let Some((_, Some(name), _, _)) = dir_args(ctx) else {
                    return bad(ctx, Status::InvalidParameter);
                };
                let Some(dir_ino) = ctx.file.as_ref().map(|f| f.ino) else {
                    return bad(ctx, Status::InvalidParameter);
                };
                let entry = inst.make_listed_entry(&out);
                inst.cache.set_entry(dir_ino, &name, entry, inst.now());
                ctx.done(FsReply::Dir {
                    entries: vec![DirInfo {
                        name,
                        attr: entry.attr,
                    }],
                    resume_offset: None,
                });
                return Flow::Complete;
            }
        }
    }
}

fn push_entry(ctx: &mut RequestContext, dirent: &Dirent, attr: crate::proto::Attr, record: usize) {
    let s = ctx.scratch_dir();
    s.entries.push(DirInfo {
        name: dirent.name.clone(),
        attr,
    });
    s.bytes_used += record;
    s.resume = dirent.off;
    s.current = None;
}

fn finish_enum(ctx: &mut RequestContext, resume_offset: Option<u64>) -> Flow {
    let entries = std::mem::take(&mut ctx.scratch_dir().entries);
    ctx.done(FsReply::Dir {
        entries,
        resume_offset,
    });
    Flow::Complete
}
