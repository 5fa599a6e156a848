//! Path resolution and POSIX access checks.
//!
//! [`lookup_path`] is the shared sub-handler every path-taking operation
//! awaits: it resolves a slash-separated path component by component
//! against the entry cache, falling back to remote LOOKUP turns on a
//! miss, checks traverse access on each intermediate directory and the
//! requested access on the final object, and leaves the resolved entry
//! pinned in [`WalkState`](crate::context::WalkState).
//!
//! On a not-found failure the walk leaves the last parent id and
//! component name in place, so a create disposition can fall back to
//! creating exactly where the open failed.

use tracing::trace;

use crate::cache::{Entry, ItemHandle};
use crate::context::RequestContext;
use crate::coro::Flow;
use crate::error::Status;
use crate::instance::Instance;
use crate::path;
use crate::proto::{self, Attr, AttrOut, EntryOut, RequestBody};
use crate::request::{Caller, FileAccess};

pub(crate) const READ_BIT: u32 = 4;
pub(crate) const WRITE_BIT: u32 = 2;
pub(crate) const EXEC_BIT: u32 = 1;

/// Collapse generic access rights into the rwx bits they require.
///
/// Delete rides on the write bit; attribute and security reads are free
/// (the remote side answers GETATTR regardless of mode bits).
#[must_use]
pub(crate) fn rwx_wanted(access: FileAccess) -> u32 {
    let mut bits = 0;
    if access.intersects(FileAccess::READ_DATA) {
        bits |= READ_BIT;
    }
    if access.intersects(FileAccess::WRITE_DATA | FileAccess::APPEND_DATA | FileAccess::DELETE) {
        bits |= WRITE_BIT;
    }
    if access.intersects(FileAccess::EXECUTE) {
        bits |= EXEC_BIT;
    }
    bits
}

/// Classic owner/group/other mode-bit check. Uid 0 bypasses everything.
#[must_use]
pub(crate) fn posix_access(attr: &Attr, caller: Caller, wanted: u32) -> bool {
    if caller.uid == 0 {
        return true;
    }
    let granted = if caller.uid == attr.uid {
        (attr.mode >> 6) & 7
    } else if caller.gid == attr.gid {
        (attr.mode >> 3) & 7
    } else {
        attr.mode & 7
    };
    wanted & !granted == 0
}

/// Resolve `ctx.walk` to its final entry, checking access along the way.
///
/// Call [`WalkState::begin`](crate::context::WalkState::begin) first.
/// Completes with either `walk.entry`/`walk.item` populated (the item is
/// pinned) or `ctx.status` set.
pub(crate) fn lookup_path(inst: &Instance, ctx: &mut RequestContext) -> Flow {
    loop {
        match ctx.coro.point() {
            // Entry: take the generation reference and special-case the
            // root, which is never the child of anything.
            0 => {
                if ctx.gen_ref.is_none() {
                    ctx.gen_ref = Some(inst.cache.reference_gen(inst.now()));
                }
                if path::is_root(&ctx.walk.remaining) {
                    if let Some((entry, item)) =
                        inst.cache.get_entry(proto::ROOT_ID, "/", inst.now())
                    {
                        return finish(inst, ctx, entry, item);
                    }
                    ctx.send(proto::ROOT_ID, &RequestBody::Getattr { flags: 0, fh: 0 });
                    return ctx.coro.suspend(1);
                }
                ctx.coro.jump(2);
            }
            // Root GETATTR answered: synthesize and pin the root entry.
            // The remote side never vended it through a lookup, so it is
            // flagged to stay out of forget reporting.
            1 => {
                let payload = match ctx.take_payload(inst.errno_table()) {
                    Ok(payload) => payload,
                    Err(status) => return fail(ctx, status),
                };
                let out = match AttrOut::decode(&payload) {
                    Ok(out) => out,
                    Err(err) => return fail(ctx, err.into()),
                };
                let entry = inst.root_entry(&out);
                let item = inst.cache.set_entry(proto::ROOT_ID, "/", entry, inst.now());
                inst.cache.set_no_forget(item);
                return finish(inst, ctx, entry, item);
            }
            // Consume the next component, cache first.
            2 => {
                let (component, rest) = {
                    let (c, r) = path::split_prefix(&ctx.walk.remaining);
                    (c.to_owned(), r.to_owned())
                };
                if component.is_empty() {
                    return fail(ctx, Status::InvalidParameter);
                }
                ctx.walk.component = component;
                ctx.walk.remaining = rest;
                if let Some((entry, item)) =
                    inst.cache
                        .get_entry(ctx.walk.parent, &ctx.walk.component, inst.now())
                {
                    trace!(
                        parent = ctx.walk.parent,
                        component = %ctx.walk.component,
                        "walk: cache hit"
                    );
                    match step(inst, ctx, entry, item) {
                        Some(flow) => return flow,
                        None => continue,
                    }
                }
                let name = ctx.walk.component.clone();
                ctx.send(ctx.walk.parent, &RequestBody::Lookup { name: &name });
                return ctx.coro.suspend(3);
            }
            // LOOKUP answered: cache the binding and advance.
            _ => {
                let payload = match ctx.take_payload(inst.errno_table()) {
                    Ok(payload) => payload,
                    // walk.parent and walk.component stay put for a
                    // create fallback.
                    Err(status) => return fail(ctx, status),
                };
                let out = match EntryOut::decode(&payload) {
                    Ok(out) => out,
                    Err(err) => return fail(ctx, err.into()),
                };
                let entry = inst.make_entry(&out);
                let item =
                    inst.cache
                        .set_entry(ctx.walk.parent, &ctx.walk.component, entry, inst.now());
                match step(inst, ctx, entry, item) {
                    Some(flow) => return flow,
                    None => ctx.coro.jump(2),
                }
            }
        }
    }
}

fn fail(ctx: &mut RequestContext, status: Status) -> Flow {
    ctx.fail(status);
    Flow::Complete
}

/// Process one resolved component: either it is the final object (finish
/// the walk) or an intermediate directory (traverse-check and descend).
fn step(
    inst: &Instance,
    ctx: &mut RequestContext,
    entry: Entry,
    item: ItemHandle,
) -> Option<Flow> {
    if ctx.walk.remaining.is_empty() {
        return Some(finish(inst, ctx, entry, item));
    }
    if !entry.attr.is_dir() {
        return Some(fail(ctx, Status::NotADirectory));
    }
    if !posix_access(&entry.attr, ctx.caller, EXEC_BIT) {
        return Some(fail(ctx, Status::AccessDenied));
    }
    ctx.walk.parent = entry.ino;
    None
}

/// Final component resolved: apply the shape and access requirements and
/// pin the result.
fn finish(
    inst: &Instance,
    ctx: &mut RequestContext,
    entry: Entry,
    item: ItemHandle,
) -> Flow {
    if ctx.walk.want_dir && !entry.attr.is_dir() {
        return fail(ctx, Status::NotADirectory);
    }
    if !posix_access(&entry.attr, ctx.caller, rwx_wanted(ctx.walk.desired)) {
        return fail(ctx, Status::AccessDenied);
    }
    inst.cache.reference_item(item);
    ctx.walk.entry = Some(entry);
    ctx.walk.item = Some(item);
    ctx.walk.granted = ctx.walk.desired;
    Flow::Complete
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attr(uid: u32, gid: u32, mode: u32) -> Attr {
        Attr {
            uid,
            gid,
            mode: libc::S_IFREG | mode,
            ..Attr::default()
        }
    }

    #[test]
    fn owner_group_other_classes() {
        let a = attr(1000, 100, 0o640);
        let owner = Caller {
            uid: 1000,
            gid: 100,
            pid: 1,
        };
        let group = Caller {
            uid: 2000,
            gid: 100,
            pid: 1,
        };
        let other = Caller {
            uid: 2000,
            gid: 200,
            pid: 1,
        };
        assert!(posix_access(&a, owner, READ_BIT | WRITE_BIT));
        assert!(posix_access(&a, group, READ_BIT));
        assert!(!posix_access(&a, group, WRITE_BIT));
        assert!(!posix_access(&a, other, READ_BIT));
    }

    #[test]
    fn root_bypasses_mode_bits() {
        let a = attr(1000, 100, 0o000);
        let root = Caller {
            uid: 0,
            gid: 0,
            pid: 1,
        };
        assert!(posix_access(&a, root, READ_BIT | WRITE_BIT | EXEC_BIT));
    }

    #[test]
    fn delete_requires_write() {
        assert_eq!(rwx_wanted(FileAccess::DELETE), WRITE_BIT);
        assert_eq!(
            rwx_wanted(FileAccess::READ_DATA | FileAccess::EXECUTE),
            READ_BIT | EXEC_BIT
        );
        assert_eq!(rwx_wanted(FileAccess::READ_ATTRIBUTES), 0);
    }
}
