//! Create/open: disposition-driven open, create, truncate, and the
//! open-target-directory variant.
//!
//! The top-level handler picks a sub-handler from the disposition and
//! options; fallback dispositions (open-if, overwrite-if, supersede)
//! chain sub-handlers, clearing the not-found failure of the first leg
//! before running the create leg. The failed walk leaves its parent and
//! component in place, and the entries it cached keep the second leg's
//! re-walk off the wire.

use tracing::debug;

use crate::cache::Entry;
use crate::context::{OpenFile, RequestContext};
use crate::coro::{awaited, Flow};
use crate::error::Status;
use crate::instance::Instance;
use crate::ops::{op_of, open_flags};
use crate::path;
use crate::proto::{
    CreateOut, EntryOut, OpenOut, RequestBody, SetattrIn, FATTR_FH, FATTR_SIZE,
};
use crate::request::{CreateOptions, Disposition, FileAccess, FsOp, FsReply};

pub(crate) fn create(inst: &Instance, ctx: &mut RequestContext) -> Flow {
    let Some(FsOp::Create {
        disposition,
        options,
        ..
    }) = op_of(ctx)
    else {
        ctx.fail(Status::InvalidParameter);
        return Flow::Complete;
    };
    let sub: fn(&Instance, &mut RequestContext) -> Flow =
        if options.contains(CreateOptions::OPEN_TARGET_DIRECTORY) {
            open_target_directory
        } else {
            match disposition {
                Disposition::Open => open_existing,
                Disposition::OpenIf => open_if,
                Disposition::Create => create_new,
                Disposition::Overwrite | Disposition::OverwriteIf | Disposition::Supersede => {
                    overwrite
                }
            }
        };
    awaited(ctx, |c| sub(inst, c))
}

/// The fields of the driving create operation, re-read on each entry.
struct CreateArgs {
    path: String,
    access: FileAccess,
    disposition: Disposition,
    options: CreateOptions,
    mode: u32,
    security: Option<bytes::Bytes>,
}

fn args(ctx: &RequestContext) -> Option<CreateArgs> {
    match op_of(ctx)? {
        FsOp::Create {
            path,
            access,
            disposition,
            options,
            mode,
            security,
        } => Some(CreateArgs {
            path,
            access,
            disposition,
            options,
            mode,
            security,
        }),
        _ => None,
    }
}

fn bad(ctx: &mut RequestContext, status: Status) -> Flow {
    ctx.fail(status);
    Flow::Complete
}

/// Install an open-file record for the entry the walk resolved, moving
/// the walk's pin into the record, and stage the success reply.
fn finish_from_walk(
    inst: &Instance,
    ctx: &mut RequestContext,
    entry: Entry,
    remote_fh: u64,
    is_reparse: bool,
    args: &CreateArgs,
) {
    let file = OpenFile {
        ino: entry.ino,
        remote_fh,
        is_dir: entry.attr.is_dir(),
        is_reparse,
        delete_pending: args.options.contains(CreateOptions::DELETE_ON_CLOSE),
        path: args.path.clone(),
        parent: ctx.walk.parent,
        name: ctx.walk.component.clone(),
        item: ctx.walk.item.take(),
    };
    let fh = inst.files.insert(file);
    let granted = ctx.walk.granted;
    ctx.done(FsReply::Create {
        fh,
        ino: entry.ino,
        attr: entry.attr,
        granted,
    });
}

/// Disposition `Open`: the object must exist.
fn open_existing(inst: &Instance, ctx: &mut RequestContext) -> Flow {
    loop {
        match ctx.coro.point() {
            0 => {
                let Some(a) = args(ctx) else {
                    return bad(ctx, Status::InvalidParameter);
                };
                let mut desired = a.access;
                if a.options.contains(CreateOptions::DELETE_ON_CLOSE) {
                    desired |= FileAccess::DELETE;
                }
                ctx.walk
                    .begin(&a.path, desired, a.options.contains(CreateOptions::DIRECTORY));
                ctx.coro.jump(1);
            }
            1 => {
                if awaited(ctx, |c| crate::access::lookup_path(inst, c)) == Flow::Suspended {
                    return Flow::Suspended;
                }
                if ctx.status.is_some() {
                    return Flow::Complete;
                }
                let Some(a) = args(ctx) else {
                    return bad(ctx, Status::InvalidParameter);
                };
                let Some(entry) = ctx.walk.entry else {
                    return bad(ctx, Status::IoError);
                };
                if a.options.contains(CreateOptions::NON_DIRECTORY) && entry.attr.is_dir() {
                    return bad(ctx, Status::IsADirectory);
                }
                if entry.attr.is_symlink() && a.options.contains(CreateOptions::OPEN_REPARSE_POINT)
                {
                    // The link itself is the object; it is never opened
                    // remotely.
                    finish_from_walk(inst, ctx, entry, 0, true, &a);
                    return Flow::Complete;
                }
                if entry.attr.is_dir() {
                    ctx.send(entry.ino, &RequestBody::Opendir { flags: 0 });
                } else {
                    let flags = open_flags(a.access);
                    ctx.send(entry.ino, &RequestBody::Open { flags });
                }
                return ctx.coro.suspend(2);
            }
            _ => {
                let payload = match ctx.take_payload(inst.errno_table()) {
                    Ok(payload) => payload,
                    Err(status) => return bad(ctx, status),
                };
                let open = match OpenOut::decode(&payload) {
                    Ok(open) => open,
                    Err(err) => return bad(ctx, err.into()),
                };
                let Some(a) = args(ctx) else {
                    return bad(ctx, Status::InvalidParameter);
                };
                let Some(entry) = ctx.walk.entry else {
                    return bad(ctx, Status::IoError);
                };
                finish_from_walk(inst, ctx, entry, open.fh, false, &a);
                return Flow::Complete;
            }
        }
    }
}

/// Disposition `Create`: the object must not exist yet.
fn create_new(inst: &Instance, ctx: &mut RequestContext) -> Flow {
    loop {
        match ctx.coro.point() {
            0 => {
                let Some(a) = args(ctx) else {
                    return bad(ctx, Status::InvalidParameter);
                };
                let (dir, name) = path::split_suffix(&a.path);
                if name.is_empty() {
                    return bad(ctx, Status::InvalidParameter);
                }
                if name.len() > inst.config().max_component_length as usize {
                    return bad(ctx, Status::NameTooLong);
                }
                let (dir, name) = (dir.to_owned(), name.to_owned());
                ctx.scratch_create().name = name;
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
                let Some(a) = args(ctx) else {
                    return bad(ctx, Status::InvalidParameter);
                };
                let Some(parent) = ctx.walk.entry.map(|e| e.ino) else {
                    return bad(ctx, Status::IoError);
                };
                let name = ctx.scratch_create().name.clone();
                let perm = a.mode & 0o7777;
                let kind = a.mode & libc::S_IFMT;
                if a.options.contains(CreateOptions::DIRECTORY) {
                    ctx.send(
                        parent,
                        &RequestBody::Mkdir {
                            mode: perm,
                            umask: 0,
                            name: &name,
                        },
                    );
                    return ctx.coro.suspend(2);
                }
                if kind == 0 || kind == libc::S_IFREG {
                    let flags = open_flags(a.access) | libc::O_CREAT as u32 | libc::O_EXCL as u32;
                    ctx.send(
                        parent,
                        &RequestBody::Create {
                            flags,
                            mode: libc::S_IFREG | perm,
                            umask: 0,
                            name: &name,
                        },
                    );
                    return ctx.coro.suspend(3);
                }
                ctx.send(
                    parent,
                    &RequestBody::Mknod {
                        mode: a.mode,
                        rdev: 0,
                        umask: 0,
                        name: &name,
                    },
                );
                return ctx.coro.suspend(4);
            }
            // MKDIR answered: the new directory still needs an open handle.
            2 => {
                let entry = match decode_entry(inst, ctx) {
                    Ok(entry) => entry,
                    Err(status) => return bad(ctx, status),
                };
                remember_created(inst, ctx, entry);
                ctx.send(entry.ino, &RequestBody::Opendir { flags: 0 });
                return ctx.coro.suspend(5);
            }
            // CREATE answered: entry and handle arrive together.
            3 => {
                let payload = match ctx.take_payload(inst.errno_table()) {
                    Ok(payload) => payload,
                    Err(status) => return bad(ctx, status),
                };
                let out = match CreateOut::decode(&payload) {
                    Ok(out) => out,
                    Err(err) => return bad(ctx, err.into()),
                };
                let entry = inst.make_entry(&out.entry);
                remember_created(inst, ctx, entry);
                ctx.scratch_create().remote_fh = out.open.fh;
                ctx.coro.jump(6);
            }
            // MKNOD answered: open the fresh node.
            4 => {
                let entry = match decode_entry(inst, ctx) {
                    Ok(entry) => entry,
                    Err(status) => return bad(ctx, status),
                };
                remember_created(inst, ctx, entry);
                let flags = args(ctx).map(|a| open_flags(a.access)).unwrap_or(0);
                ctx.send(entry.ino, &RequestBody::Open { flags });
                return ctx.coro.suspend(5);
            }
            // OPEN/OPENDIR answered.
            5 => {
                let payload = match ctx.take_payload(inst.errno_table()) {
                    Ok(payload) => payload,
                    Err(status) => return bad(ctx, status),
                };
                let open = match OpenOut::decode(&payload) {
                    Ok(open) => open,
                    Err(err) => return bad(ctx, err.into()),
                };
                ctx.scratch_create().remote_fh = open.fh;
                ctx.coro.jump(6);
            }
            // Apply an explicit security descriptor, when one was given.
            6 => {
                let Some(a) = args(ctx) else {
                    return bad(ctx, Status::InvalidParameter);
                };
                let Some(descriptor) = a.security else {
                    ctx.coro.jump(8);
                    continue;
                };
                let (uid, gid, mode) =
                    match inst.security().posix_from_descriptor(&descriptor) {
                        Ok(bits) => bits,
                        Err(status) => return compensate(inst, ctx, status),
                    };
                let mut attr = SetattrIn::default();
                if let Some(uid) = uid {
                    attr.valid |= crate::proto::FATTR_UID;
                    attr.uid = uid;
                }
                if let Some(gid) = gid {
                    attr.valid |= crate::proto::FATTR_GID;
                    attr.gid = gid;
                }
                if let Some(mode) = mode {
                    attr.valid |= crate::proto::FATTR_MODE;
                    attr.mode = mode;
                }
                if attr.valid == 0 {
                    ctx.coro.jump(8);
                    continue;
                }
                let Some(ino) = ctx.scratch_create().entry.map(|e| e.ino) else {
                    return bad(ctx, Status::IoError);
                };
                ctx.send(ino, &RequestBody::Setattr(attr));
                return ctx.coro.suspend(7);
            }
            // SETATTR answered; a failure here unwinds the open.
            7 => match ctx.take_errno(inst.errno_table()) {
                Ok(()) => ctx.coro.jump(8),
                Err(status) => return compensate(inst, ctx, status),
            },
            // Success: install the record and reply.
            8 => {
                let Some(a) = args(ctx) else {
                    return bad(ctx, Status::InvalidParameter);
                };
                let (entry, item, remote_fh) = {
                    let s = ctx.scratch_create();
                    (s.entry, s.item.take(), s.remote_fh)
                };
                let Some(entry) = entry else {
                    return bad(ctx, Status::IoError);
                };
                if let Some(item) = item {
                    inst.cache.reference_item(item);
                }
                let name = ctx.scratch_create().name.clone();
                let file = OpenFile {
                    ino: entry.ino,
                    remote_fh,
                    is_dir: entry.attr.is_dir(),
                    is_reparse: false,
                    delete_pending: a.options.contains(CreateOptions::DELETE_ON_CLOSE),
                    path: a.path.clone(),
                    parent: ctx.walk.entry.map(|e| e.ino).unwrap_or(crate::proto::ROOT_ID),
                    name,
                    item,
                };
                let fh = inst.files.insert(file);
                ctx.done(FsReply::Create {
                    fh,
                    ino: entry.ino,
                    attr: entry.attr,
                    granted: a.access,
                });
                return Flow::Complete;
            }
            // Compensating release answered: swallow its outcome, report
            // the original failure.
            _ => {
                if let Err(status) = ctx.take_errno(inst.errno_table()) {
                    debug!(%status, "release after failed create-fixup also failed");
                }
                let pending = ctx.scratch_create().pending.take();
                return bad(ctx, pending.unwrap_or(Status::IoError));
            }
        }
    }
}

/// Decode an entry-shaped reply and fold it into the cache.
fn decode_entry(inst: &Instance, ctx: &mut RequestContext) -> Result<Entry, Status> {
    let payload = ctx.take_payload(inst.errno_table())?;
    let out = EntryOut::decode(&payload)?;
    Ok(inst.make_entry(&out))
}

fn remember_created(inst: &Instance, ctx: &mut RequestContext, entry: Entry) {
    let Some(parent) = ctx.walk.entry.map(|e| e.ino) else {
        return;
    };
    let name = ctx.scratch_create().name.clone();
    let item = inst.cache.set_entry(parent, &name, entry, inst.now());
    let s = ctx.scratch_create();
    s.entry = Some(entry);
    s.item = Some(item);
}

/// The object was created and opened but a follow-up step failed: release
/// the remote handle before reporting the failure, so nothing leaks on
/// the remote side.
fn compensate(inst: &Instance, ctx: &mut RequestContext, status: Status) -> Flow {
    let (entry, remote_fh, item) = {
        let s = ctx.scratch_create();
        s.pending = Some(status);
        (s.entry, s.remote_fh, s.item)
    };
    // Whatever the cache holds for the half-created object is suspect.
    if let Some(item) = item {
        inst.cache.quick_expire_item(item);
    }
    let Some(entry) = entry else {
        return bad(ctx, status);
    };
    if entry.attr.is_dir() {
        ctx.send(
            entry.ino,
            &RequestBody::Releasedir {
                fh: remote_fh,
                flags: 0,
            },
        );
    } else {
        ctx.send(
            entry.ino,
            &RequestBody::Release {
                fh: remote_fh,
                flags: 0,
            },
        );
    }
    ctx.coro.suspend(9)
}

/// Disposition `OpenIf`: open, falling back to create on not-found.
fn open_if(inst: &Instance, ctx: &mut RequestContext) -> Flow {
    loop {
        match ctx.coro.point() {
            0 => {
                if awaited(ctx, |c| open_existing(inst, c)) == Flow::Suspended {
                    return Flow::Suspended;
                }
                if ctx.status != Some(Status::NotFound) {
                    return Flow::Complete;
                }
                ctx.status = None;
                // The walk may have resolved and pinned the entry before
                // the remote refused the OPEN itself (the object vanished
                // in between). The create leg walks afresh.
                if let Some(item) = ctx.walk.item.take() {
                    inst.cache.dereference_item(item);
                }
                ctx.walk.entry = None;
                ctx.coro.jump(1);
            }
            _ => return awaited(ctx, |c| create_new(inst, c)),
        }
    }
}

/// Dispositions `Overwrite`, `OverwriteIf`, `Supersede`: open and
/// truncate, with a create fallback for the `If`/`Supersede` flavors.
fn overwrite(inst: &Instance, ctx: &mut RequestContext) -> Flow {
    loop {
        match ctx.coro.point() {
            0 => {
                let Some(a) = args(ctx) else {
                    return bad(ctx, Status::InvalidParameter);
                };
                // Supersede destroys the existing object; the overwrite
                // flavors rewrite its data in place.
                let implied = if a.disposition == Disposition::Supersede {
                    FileAccess::DELETE
                } else {
                    FileAccess::WRITE_DATA
                };
                ctx.walk.begin(&a.path, a.access | implied, false);
                ctx.coro.jump(1);
            }
            1 => {
                if awaited(ctx, |c| crate::access::lookup_path(inst, c)) == Flow::Suspended {
                    return Flow::Suspended;
                }
                let Some(a) = args(ctx) else {
                    return bad(ctx, Status::InvalidParameter);
                };
                if let Some(status) = ctx.status {
                    let falls_back = matches!(
                        a.disposition,
                        Disposition::OverwriteIf | Disposition::Supersede
                    );
                    if status == Status::NotFound && falls_back {
                        ctx.status = None;
                        ctx.coro.jump(5);
                        continue;
                    }
                    return Flow::Complete;
                }
                let Some(entry) = ctx.walk.entry else {
                    return bad(ctx, Status::IoError);
                };
                if entry.attr.is_dir() {
                    return bad(ctx, Status::IsADirectory);
                }
                let flags = open_flags(a.access | FileAccess::WRITE_DATA);
                ctx.send(entry.ino, &RequestBody::Open { flags });
                return ctx.coro.suspend(2);
            }
            2 => {
                let payload = match ctx.take_payload(inst.errno_table()) {
                    Ok(payload) => payload,
                    Err(status) => return bad(ctx, status),
                };
                let open = match OpenOut::decode(&payload) {
                    Ok(open) => open,
                    Err(err) => return bad(ctx, err.into()),
                };
                let Some(ino) = ctx.walk.entry.map(|e| e.ino) else {
                    return bad(ctx, Status::IoError);
                };
                ctx.scratch_create().remote_fh = open.fh;
                let attr = SetattrIn {
                    valid: FATTR_SIZE | FATTR_FH,
                    fh: open.fh,
                    size: 0,
                    ..SetattrIn::default()
                };
                ctx.send(ino, &RequestBody::Setattr(attr));
                return ctx.coro.suspend(3);
            }
            3 => {
                let remote_fh = ctx.scratch_create().remote_fh;
                match ctx.take_errno(inst.errno_table()) {
                    Ok(()) => {
                        let Some(a) = args(ctx) else {
                            return bad(ctx, Status::InvalidParameter);
                        };
                        let Some(mut entry) = ctx.walk.entry else {
                            return bad(ctx, Status::IoError);
                        };
                        entry.attr.size = 0;
                        // The truncation invalidated the cached attributes.
                        if let Some(item) = ctx.walk.item {
                            inst.cache.quick_expire_item(item);
                        }
                        finish_from_walk(inst, ctx, entry, remote_fh, false, &a);
                        return Flow::Complete;
                    }
                    Err(status) => {
                        let Some(ino) = ctx.walk.entry.map(|e| e.ino) else {
                            return bad(ctx, status);
                        };
                        ctx.scratch_create().pending = Some(status);
                        ctx.send(
                            ino,
                            &RequestBody::Release {
                                fh: remote_fh,
                                flags: 0,
                            },
                        );
                        return ctx.coro.suspend(4);
                    }
                }
            }
            4 => {
                if let Err(status) = ctx.take_errno(inst.errno_table()) {
                    debug!(%status, "release after failed truncate also failed");
                }
                let pending = ctx.scratch_create().pending.take();
                return bad(ctx, pending.unwrap_or(Status::IoError));
            }
            _ => return awaited(ctx, |c| create_new(inst, c)),
        }
    }
}

/// Open the parent directory of the named object.
fn open_target_directory(inst: &Instance, ctx: &mut RequestContext) -> Flow {
    loop {
        match ctx.coro.point() {
            0 => {
                let Some(a) = args(ctx) else {
                    return bad(ctx, Status::InvalidParameter);
                };
                let (dir, _) = path::split_suffix(&a.path);
                let dir = dir.to_owned();
                ctx.walk.begin(&dir, a.access, true);
                ctx.coro.jump(1);
            }
            1 => {
                if awaited(ctx, |c| crate::access::lookup_path(inst, c)) == Flow::Suspended {
                    return Flow::Suspended;
                }
                if ctx.status.is_some() {
                    return Flow::Complete;
                }
                let Some(entry) = ctx.walk.entry else {
                    return bad(ctx, Status::IoError);
                };
                ctx.send(entry.ino, &RequestBody::Opendir { flags: 0 });
                return ctx.coro.suspend(2);
            }
            _ => {
                let payload = match ctx.take_payload(inst.errno_table()) {
                    Ok(payload) => payload,
                    Err(status) => return bad(ctx, status),
                };
                let open = match OpenOut::decode(&payload) {
                    Ok(open) => open,
                    Err(err) => return bad(ctx, err.into()),
                };
                let Some(mut a) = args(ctx) else {
                    return bad(ctx, Status::InvalidParameter);
                };
                let Some(entry) = ctx.walk.entry else {
                    return bad(ctx, Status::IoError);
                };
                // The record tracks the parent, not the named object.
                let (dir, _) = path::split_suffix(&a.path);
                a.path = dir.to_owned();
                a.options.remove(CreateOptions::DELETE_ON_CLOSE);
                finish_from_walk(inst, ctx, entry, open.fh, false, &a);
                return Flow::Complete;
            }
        }
    }
}
