//! Per-request context and the open-handle table.
//!
//! A [`RequestContext`] is the single unit of state a request carries
//! across its suspend/resume cycles: the resumption stack, the outbound
//! message slot, the inbound response slot, per-operation scratch space,
//! and the cache references it holds. Contexts live in a `Box` and move
//! between the engine, the pending queue, and the processing table without
//! copying.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};

use crate::cache::{Entry, GenHandle, ItemHandle};
use crate::coro::{Coro, HasCoro};
use crate::error::Status;
use crate::ioq::Correlated;
use crate::proto::{self, errno::ErrnoTable, Dirent, RequestBody};
use crate::request::{Caller, DirInfo, FileAccess, FsReply, FsRequest};

/// What a context is doing, beyond the externally-submitted operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Driven by an [`FsRequest`] from the host.
    External,
    /// The session-opening INIT exchange.
    Init,
    /// The session-closing DESTROY exchange.
    Destroy,
    /// Draining forget records to the remote side.
    Forget,
}

/// Path-walk progress, shared by every handler that resolves a path.
#[derive(Debug, Default)]
pub struct WalkState {
    /// Path suffix not yet resolved.
    pub remaining: String,
    /// Directory currently being walked.
    pub parent: u64,
    /// Component currently being resolved. On a not-found failure this
    /// and `parent` survive, so a create fallback knows where to create.
    pub component: String,
    /// Rights to check on the final object.
    pub desired: FileAccess,
    /// The final object must be a directory.
    pub want_dir: bool,
    /// Resolved final entry.
    pub entry: Option<Entry>,
    /// Pinned cache handle of the final entry; released by the context
    /// finalizer unless ownership moves into an open-file record.
    pub item: Option<ItemHandle>,
    /// Rights actually granted.
    pub granted: FileAccess,
}

impl WalkState {
    /// Reset for a fresh walk.
    pub fn begin(&mut self, path: &str, desired: FileAccess, want_dir: bool) {
        self.remaining = path.to_owned();
        self.parent = proto::ROOT_ID;
        self.component.clear();
        self.desired = desired;
        self.want_dir = want_dir;
        self.entry = None;
        debug_assert!(self.item.is_none(), "walk restarted with a pinned item");
        self.granted = FileAccess::empty();
    }
}

#[derive(Debug, Default)]
pub struct CreateScratch {
    /// Final component to create.
    pub name: String,
    pub entry: Option<Entry>,
    pub item: Option<ItemHandle>,
    pub remote_fh: u64,
    /// Failure to report after a compensating release finishes.
    pub pending: Option<Status>,
}

#[derive(Debug, Default)]
pub struct ReadScratch {
    pub offset: u64,
    pub remaining: u32,
    pub chunk: u32,
    pub data: BytesMut,
}

#[derive(Debug, Default)]
pub struct WriteScratch {
    pub offset: u64,
    pub written: u32,
    /// File size as observed before the write, then as tracked after it.
    pub size: u64,
    pub data: Bytes,
}

#[derive(Debug, Default)]
pub struct RenameScratch {
    pub new_parent: u64,
    pub new_name: String,
}

#[derive(Debug, Default)]
pub struct DirScratch {
    pub entries: Vec<DirInfo>,
    /// Dirents decoded from the current batch, not yet resolved.
    pub queued: std::collections::VecDeque<Dirent>,
    /// Dirent whose attributes are being fetched across a suspension.
    pub current: Option<Dirent>,
    pub next_offset: u64,
    /// Offset of the last entry included in the output, for resumption.
    pub resume: u64,
    pub bytes_used: usize,
}

#[derive(Debug, Default)]
pub struct ForgetScratch {
    pub batch: std::collections::VecDeque<(u64, u64)>,
}

/// Operation-specific state surviving across suspensions.
#[derive(Debug, Default)]
pub enum Scratch {
    #[default]
    None,
    Create(CreateScratch),
    Read(ReadScratch),
    Write(WriteScratch),
    Rename(RenameScratch),
    Dir(DirScratch),
    Forget(ForgetScratch),
}

/// One open handle vended to the host.
#[derive(Debug, Clone)]
pub struct OpenFile {
    pub ino: u64,
    /// The remote side's handle; meaningless when `is_reparse`.
    pub remote_fh: u64,
    pub is_dir: bool,
    /// Opened as a reparse point (symlink itself): no remote open was
    /// performed, so no remote release happens either.
    pub is_reparse: bool,
    pub delete_pending: bool,
    /// Full path the handle was opened under; rename updates it.
    pub path: String,
    pub parent: u64,
    pub name: String,
    /// Pinned cache handle keeping the identity alive while open.
    pub item: Option<ItemHandle>,
}

/// Concurrent open-handle table. Handles are never reused within a
/// session.
#[derive(Debug, Default)]
pub struct FileTable {
    map: scc::HashMap<u64, OpenFile>,
    next: AtomicU64,
}

impl FileTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: scc::HashMap::default(),
            next: AtomicU64::new(1),
        }
    }

    pub fn insert(&self, file: OpenFile) -> u64 {
        let fh = self.next.fetch_add(1, Ordering::Relaxed);
        let _ = self.map.insert(fh, file);
        fh
    }

    #[must_use]
    pub fn get(&self, fh: u64) -> Option<OpenFile> {
        self.map.read(&fh, |_, file| file.clone())
    }

    /// Mutate a record in place. `false` when the handle is unknown.
    pub fn update(&self, fh: u64, f: impl FnOnce(&mut OpenFile)) -> bool {
        self.map.update(&fh, |_, file| f(file)).is_some()
    }

    pub fn remove(&self, fh: u64) -> Option<OpenFile> {
        self.map.remove(&fh).map(|(_, file)| file)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Everything one in-flight request owns.
pub struct RequestContext {
    /// Wire correlation token; unique for the life of the engine.
    pub token: u64,
    pub caller: Caller,
    pub kind: OpKind,
    /// The driving host request; `None` for engine-internal contexts.
    pub request: Option<FsRequest>,
    pub coro: Coro,
    /// Outbound wire message produced by the last handler entry.
    pub out: Option<Bytes>,
    /// Inbound response awaiting consumption by the next handler entry.
    pub response: Option<proto::Response>,
    /// Terminal failure, set at most once.
    pub status: Option<Status>,
    /// Terminal success payload.
    pub reply: Option<FsReply>,
    pub walk: WalkState,
    pub scratch: Scratch,
    /// Open-file record resolved at handler entry for handle-based ops.
    pub file: Option<OpenFile>,
    /// Generation reference held for the duration of the request.
    pub gen_ref: Option<GenHandle>,
    /// The just-emitted message expects no response; the dispatcher
    /// resumes the handler immediately after sending instead of parking
    /// the context.
    pub fire_and_forget: bool,
    /// Designated final context of an ordered shutdown.
    pub is_final: bool,
    /// Runs exactly once when the context is destroyed, whatever path
    /// destroys it; releases cache references.
    pub finalizer: Option<Box<dyn FnOnce(&mut RequestContext) + Send>>,
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("token", &self.token)
            .field("kind", &self.kind)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl RequestContext {
    #[must_use]
    pub fn new(token: u64, kind: OpKind, request: Option<FsRequest>) -> Box<Self> {
        let caller = request.as_ref().map(|r| r.caller).unwrap_or_default();
        Box::new(Self {
            token,
            caller,
            kind,
            request,
            coro: Coro::new(),
            out: None,
            response: None,
            status: None,
            reply: None,
            walk: WalkState::default(),
            scratch: Scratch::default(),
            file: None,
            gen_ref: None,
            fire_and_forget: false,
            is_final: false,
            finalizer: None,
        })
    }

    /// Record the terminal failure. First failure wins.
    pub fn fail(&mut self, status: Status) {
        if self.status.is_none() {
            self.status = Some(status);
        }
    }

    /// Record the terminal success payload.
    pub fn done(&mut self, reply: FsReply) {
        self.reply = Some(reply);
    }

    /// Stage an outbound request targeting `nodeid`.
    pub fn send(&mut self, nodeid: u64, body: &RequestBody<'_>) {
        debug_assert!(self.out.is_none(), "previous message not yet taken");
        self.out = Some(proto::encode_request(self.token, nodeid, self.caller, body));
    }

    /// Consume the inbound response: its payload on success, the mapped
    /// status on a remote error. A missing response (the handler was
    /// resumed without one) is a dispatch fault reported as I/O failure.
    pub fn take_payload(&mut self, table: ErrnoTable) -> Result<Bytes, Status> {
        let resp = self.response.take().ok_or(Status::IoError)?;
        match resp.ok(table) {
            Ok(payload) => Ok(payload.clone()),
            Err(status) => Err(status),
        }
    }

    /// Consume the inbound response, caring only whether it failed.
    pub fn take_errno(&mut self, table: ErrnoTable) -> Result<(), Status> {
        self.take_payload(table).map(|_| ())
    }

    pub fn scratch_create(&mut self) -> &mut CreateScratch {
        if !matches!(self.scratch, Scratch::Create(_)) {
            self.scratch = Scratch::Create(CreateScratch::default());
        }
        match &mut self.scratch {
            Scratch::Create(s) => s,
            _ => unreachable!(),
        }
    }

    pub fn scratch_read(&mut self) -> &mut ReadScratch {
        if !matches!(self.scratch, Scratch::Read(_)) {
            self.scratch = Scratch::Read(ReadScratch::default());
        }
        match &mut self.scratch {
            Scratch::Read(s) => s,
            _ => unreachable!(),
        }
    }

    pub fn scratch_write(&mut self) -> &mut WriteScratch {
        if !matches!(self.scratch, Scratch::Write(_)) {
            self.scratch = Scratch::Write(WriteScratch::default());
        }
        match &mut self.scratch {
            Scratch::Write(s) => s,
            _ => unreachable!(),
        }
    }

    pub fn scratch_rename(&mut self) -> &mut RenameScratch {
        if !matches!(self.scratch, Scratch::Rename(_)) {
            self.scratch = Scratch::Rename(RenameScratch::default());
        }
        match &mut self.scratch {
            Scratch::Rename(s) => s,
            _ => unreachable!(),
        }
    }

    pub fn scratch_dir(&mut self) -> &mut DirScratch {
        if !matches!(self.scratch, Scratch::Dir(_)) {
            self.scratch = Scratch::Dir(DirScratch::default());
        }
        match &mut self.scratch {
            Scratch::Dir(s) => s,
            _ => unreachable!(),
        }
    }

    pub fn scratch_forget(&mut self) -> &mut ForgetScratch {
        if !matches!(self.scratch, Scratch::Forget(_)) {
            self.scratch = Scratch::Forget(ForgetScratch::default());
        }
        match &mut self.scratch {
            Scratch::Forget(s) => s,
            _ => unreachable!(),
        }
    }
}

impl Correlated for RequestContext {
    fn token(&self) -> u64 {
        self.token
    }

    fn mark_final(&mut self) {
        self.is_final = true;
    }
}

impl HasCoro for RequestContext {
    fn coro(&mut self) -> &mut Coro {
        &mut self.coro
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        if let Some(finalizer) = self.finalizer.take() {
            finalizer(self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_table_handles_are_not_reused() {
        let table = FileTable::new();
        let file = OpenFile {
            ino: 2,
            remote_fh: 7,
            is_dir: false,
            is_reparse: false,
            delete_pending: false,
            path: "/a".to_owned(),
            parent: 1,
            name: "a".to_owned(),
            item: None,
        };
        let first = table.insert(file.clone());
        assert!(table.remove(first).is_some());
        let second = table.insert(file);
        assert_ne!(first, second);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn finalizer_runs_once_on_drop() {
        use std::sync::atomic::AtomicU32;
        use std::sync::Arc;

        let hits = Arc::new(AtomicU32::new(0));
        let mut ctx = RequestContext::new(1, OpKind::External, None);
        let counted = Arc::clone(&hits);
        ctx.finalizer = Some(Box::new(move |_| {
            counted.fetch_add(1, Ordering::Relaxed);
        }));
        drop(ctx);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn first_failure_wins() {
        let mut ctx = RequestContext::new(1, OpKind::External, None);
        ctx.fail(Status::NotFound);
        ctx.fail(Status::IoError);
        assert_eq!(ctx.status, Some(Status::NotFound));
    }
}
