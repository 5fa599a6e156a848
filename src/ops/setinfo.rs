//! Set-information: attributes, sizes, delete disposition, rename.
//!
//! Delete disposition on a directory probes emptiness with one READDIR
//! turn before arming; renames resolve the destination parent through
//! the regular walk, probe the target name, and honor the rule that an
//! existing target is only replaced with the caller's explicit consent.

use crate::context::RequestContext;
use crate::coro::{awaited, Flow};
use crate::error::Status;
use crate::instance::Instance;
use crate::ops::{load_file, op_of};
use crate::path;
use crate::proto::{
    DirentIter, EntryOut, RequestBody, SetattrIn, FATTR_ATIME, FATTR_FH, FATTR_MODE, FATTR_MTIME,
    FATTR_SIZE,
};
use crate::request::{FileAccess, FsOp, FsReply, SetInfo};

fn bad(ctx: &mut RequestContext, status: Status) -> Flow {
    ctx.fail(status);
    Flow::Complete
}

pub(crate) fn set_information(inst: &Instance, ctx: &mut RequestContext) -> Flow {
    loop {
        match ctx.coro.point() {
            0 => {
                let Some(FsOp::SetInformation { fh, info }) = op_of(ctx) else {
                    return bad(ctx, Status::InvalidParameter);
                };
                if let Err(status) = load_file(inst, ctx, fh) {
                    return bad(ctx, status);
                }
                let Some(file) = ctx.file.clone() else {
                    return bad(ctx, Status::InvalidParameter);
                };
                match info {
                    SetInfo::Basic { mode, atime, mtime } => {
                        let mut attr = SetattrIn::default();
                        if let Some(mode) = mode {
                            attr.valid |= FATTR_MODE;
                            attr.mode = mode & 0o7777;
                        }
                        if let Some(atime) = atime {
                            attr.valid |= FATTR_ATIME;
                            attr.atime = atime;
                        }
                        if let Some(mtime) = mtime {
                            attr.valid |= FATTR_MTIME;
                            attr.mtime = mtime;
                        }
                        if attr.valid == 0 {
                            ctx.done(FsReply::Unit);
                            return Flow::Complete;
                        }
                        ctx.send(file.ino, &RequestBody::Setattr(attr));
                        return ctx.coro.suspend(1);
                    }
                    SetInfo::AllocationSize { size } | SetInfo::EndOfFile { size } => {
                        let attr = SetattrIn {
                            valid: FATTR_SIZE | FATTR_FH,
                            fh: file.remote_fh,
                            size,
                            ..SetattrIn::default()
                        };
                        ctx.send(file.ino, &RequestBody::Setattr(attr));
                        return ctx.coro.suspend(1);
                    }
                    SetInfo::Disposition { delete } => {
                        if !delete {
                            inst.files.update(fh, |f| f.delete_pending = false);
                            ctx.done(FsReply::Unit);
                            return Flow::Complete;
                        }
                        if file.is_dir {
                            // One batch is enough: an empty directory's
                            // dot entries always fit.
                            ctx.send(
                                file.ino,
                                &RequestBody::Readdir {
                                    fh: file.remote_fh,
                                    offset: 0,
                                    size: 8192,
                                },
                            );
                            return ctx.coro.suspend(2);
                        }
                        inst.files.update(fh, |f| f.delete_pending = true);
                        ctx.done(FsReply::Unit);
                        return Flow::Complete;
                    }
                    SetInfo::Rename { .. } => {
                        return awaited(ctx, |c| rename(inst, c));
                    }
                }
            }
            // SETATTR answered.
            1 => {
                if let Err(status) = ctx.take_errno(inst.errno_table()) {
                    return bad(ctx, status);
                }
                if let Some(item) = ctx.file.as_ref().and_then(|f| f.item) {
                    inst.cache.quick_expire_item(item);
                }
                ctx.done(FsReply::Unit);
                return Flow::Complete;
            }
            // READDIR emptiness probe answered.
            _ => {
                let payload = match ctx.take_payload(inst.errno_table()) {
                    Ok(payload) => payload,
                    Err(status) => return bad(ctx, status),
                };
                let occupied = DirentIter::new(&payload)
                    .any(|d| d.name != "." && d.name != "..");
                if occupied {
                    return bad(ctx, Status::DirectoryNotEmpty);
                }
                let Some(FsOp::SetInformation { fh, .. }) = op_of(ctx) else {
                    return bad(ctx, Status::InvalidParameter);
                };
                inst.files.update(fh, |f| f.delete_pending = true);
                ctx.done(FsReply::Unit);
                return Flow::Complete;
            }
        }
    }
}

fn rename_args(ctx: &RequestContext) -> Option<(u64, String, bool)> {
    match op_of(ctx)? {
        FsOp::SetInformation {
            fh,
            info:
                SetInfo::Rename {
                    new_path,
                    replace_if_exists,
                },
        } => Some((fh, new_path, replace_if_exists)),
        _ => None,
    }
}

fn rename(inst: &Instance, ctx: &mut RequestContext) -> Flow {
    loop {
        match ctx.coro.point() {
            0 => {
                let Some((_, new_path, _)) = rename_args(ctx) else {
                    return bad(ctx, Status::InvalidParameter);
                };
                let (dir, name) = path::split_suffix(&new_path);
                if name.is_empty() {
                    return bad(ctx, Status::InvalidParameter);
                }
                if name.len() > inst.config().max_component_length as usize {
                    return bad(ctx, Status::NameTooLong);
                }
                let (dir, name) = (dir.to_owned(), name.to_owned());
                ctx.scratch_rename().new_name = name;
                ctx.walk.begin(
                    &dir,
                    FileAccess::WRITE_DATA | FileAccess::EXECUTE,
                    true,
                );
                ctx.coro.jump(1);
            }
            1 => {
                if awaited(ctx, |c| crate::access::lookup_path(inst, c)) == Flow::Suspended {
                    return Flow::Suspended;
                }
                if ctx.status.is_some() {
                    return Flow::Complete;
                }
                let Some(new_parent) = ctx.walk.entry.map(|e| e.ino) else {
                    return bad(ctx, Status::IoError);
                };
                ctx.scratch_rename().new_parent = new_parent;
                let new_name = ctx.scratch_rename().new_name.clone();
                let Some(file) = ctx.file.clone() else {
                    return bad(ctx, Status::InvalidParameter);
                };
                if new_parent == file.parent && new_name == file.name {
                    // Renaming onto itself: nothing to do.
                    ctx.done(FsReply::Unit);
                    return Flow::Complete;
                }
                // Target existence probe, cache first.
                if inst
                    .cache
                    .get_entry(new_parent, &new_name, inst.now())
                    .is_some()
                {
                    let Some((_, _, replace)) = rename_args(ctx) else {
                        return bad(ctx, Status::InvalidParameter);
                    };
                    if !replace {
                        return bad(ctx, Status::NameCollision);
                    }
                    ctx.coro.jump(3);
                    continue;
                }
                ctx.send(new_parent, &RequestBody::Lookup { name: &new_name });
                return ctx.coro.suspend(2);
            }
            // Probe LOOKUP answered.
            2 => {
                let exists = match ctx.take_payload(inst.errno_table()) {
                    Ok(payload) => {
                        if let Ok(out) = EntryOut::decode(&payload) {
                            let entry = inst.make_entry(&out);
                            let (new_parent, new_name) = {
                                let s = ctx.scratch_rename();
                                (s.new_parent, s.new_name.clone())
                            };
                            inst.cache.set_entry(new_parent, &new_name, entry, inst.now());
                        }
                        true
                    }
                    Err(Status::NotFound) => false,
                    Err(status) => return bad(ctx, status),
                };
                let Some((_, _, replace)) = rename_args(ctx) else {
                    return bad(ctx, Status::InvalidParameter);
                };
                if exists && !replace {
                    return bad(ctx, Status::NameCollision);
                }
                ctx.coro.jump(3);
            }
            // Issue the RENAME.
            3 => {
                let Some(file) = ctx.file.clone() else {
                    return bad(ctx, Status::InvalidParameter);
                };
                let (new_parent, new_name) = {
                    let s = ctx.scratch_rename();
                    (s.new_parent, s.new_name.clone())
                };
                ctx.send(
                    file.parent,
                    &RequestBody::Rename {
                        newdir: new_parent,
                        name: &file.name,
                        newname: &new_name,
                    },
                );
                return ctx.coro.suspend(4);
            }
            // RENAME answered.
            _ => {
                if let Err(status) = ctx.take_errno(inst.errno_table()) {
                    return bad(ctx, status);
                }
                let Some((fh, new_path, _)) = rename_args(ctx) else {
                    return bad(ctx, Status::InvalidParameter);
                };
                let Some(file) = ctx.file.clone() else {
                    return bad(ctx, Status::InvalidParameter);
                };
                let (new_parent, new_name) = {
                    let s = ctx.scratch_rename();
                    (s.new_parent, s.new_name.clone())
                };
                // Both the old and the new binding are stale now.
                inst.cache.remove_entry(file.parent, &file.name);
                inst.cache.remove_entry(new_parent, &new_name);
                inst.files.update(fh, |f| {
                    f.parent = new_parent;
                    f.name = new_name.clone();
                    f.path = new_path.clone();
                });
                ctx.done(FsReply::Unit);
                return Flow::Complete;
            }
        }
    }
}
