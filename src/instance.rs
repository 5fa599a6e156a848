//! The volume instance: intake, dispatch, and session lifecycle.
//!
//! One [`Instance`] owns everything a mounted volume needs: the entry
//! cache, the open-file table, the pending-request queue, and the
//! negotiated session parameters. The host drives it through four entry
//! points: [`post`](Instance::post) submits operations,
//! [`next_message`](Instance::next_message) pulls outbound wire messages,
//! [`deliver_response`](Instance::deliver_response) feeds inbound ones,
//! and [`sweep`](Instance::sweep) runs periodic cache maintenance.
//!
//! Handlers always run on the thread that happens to hold the context:
//! the submitting thread for a fresh request, the transport thread for a
//! resumption. No locks are held across a handler entry.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::cache::{Entry, EntryCache, ForgetSink, Ticks};
use crate::config::VolumeParams;
use crate::context::{FileTable, OpKind, RequestContext};
use crate::coro::Flow;
use crate::error::Status;
use crate::ioq::Ioq;
use crate::ops;
use crate::proto::{self, errno::ErrnoTable, AttrOut, EntryOut, KERNEL_MINOR_VERSION};
use crate::request::{FsReply, FsRequest, FsResponse, ResponseSink, SecurityMapper, VolumeInfo};

const STATE_STARTING: u8 = 0;
const STATE_READY: u8 = 1;
const STATE_REJECTED: u8 = 2;
const STATE_STOPPED: u8 = 3;

/// Floor for negotiated transfer sizes; remotes announcing less are
/// brought up to it.
const MIN_TRANSFER: u32 = 4096;

/// Source of engine time. Swappable so expiry behavior is deterministic
/// under test.
pub trait Clock: Send + Sync {
    fn now(&self) -> Ticks;
}

/// Wall-clock-independent default clock.
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Ticks {
        self.origin.elapsed().as_nanos() as Ticks
    }
}

/// One mounted volume.
pub struct Instance {
    config: VolumeParams,
    pub(crate) cache: Arc<EntryCache>,
    pub(crate) files: FileTable,
    ioq: Ioq<RequestContext>,
    security: Arc<dyn SecurityMapper>,
    sink: Arc<dyn ResponseSink>,
    clock: Arc<dyn Clock>,
    next_token: AtomicU64,
    state: AtomicU8,
    /// Signalled on every session-state transition.
    changed: Notify,
    /// Requests submitted before the INIT exchange finished.
    parked: Mutex<Vec<Box<RequestContext>>>,
    minor: AtomicU32,
    max_write: AtomicU32,
    /// Last volume-information result with its fetch time.
    volume_info: Mutex<Option<(Ticks, VolumeInfo)>>,
}

impl Instance {
    /// Create the instance and open the session: the INIT request is
    /// already staged when this returns, waiting in
    /// [`next_message`](Self::next_message).
    #[must_use]
    pub fn new(
        config: VolumeParams,
        security: Arc<dyn SecurityMapper>,
        sink: Arc<dyn ResponseSink>,
    ) -> Self {
        Self::with_clock(config, security, sink, Arc::new(MonotonicClock::default()))
    }

    #[must_use]
    pub fn with_clock(
        config: VolumeParams,
        security: Arc<dyn SecurityMapper>,
        sink: Arc<dyn ResponseSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let config = config.validated();
        let cache = Arc::new(EntryCache::new(
            config.cache_capacity,
            config.case_insensitive,
        ));
        let instance = Self {
            config,
            cache,
            files: FileTable::new(),
            ioq: Ioq::new(),
            security,
            sink,
            clock,
            next_token: AtomicU64::new(1),
            state: AtomicU8::new(STATE_STARTING),
            changed: Notify::new(),
            parked: Mutex::new(Vec::new()),
            minor: AtomicU32::new(KERNEL_MINOR_VERSION),
            max_write: AtomicU32::new(MIN_TRANSFER),
            volume_info: Mutex::new(None),
        };
        let ctx = instance.make_context(OpKind::Init, None);
        instance.run(ctx);
        instance
    }

    fn lock_parked(&self) -> MutexGuard<'_, Vec<Box<RequestContext>>> {
        self.parked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn make_context(&self, kind: OpKind, request: Option<FsRequest>) -> Box<RequestContext> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut ctx = RequestContext::new(token, kind, request);
        let cache = Arc::clone(&self.cache);
        // Runs on every destruction path, including queue teardown.
        ctx.finalizer = Some(Box::new(move |c| {
            if let Some(item) = c.walk.item.take() {
                cache.dereference_item(item);
            }
            if let Some(gen) = c.gen_ref.take() {
                cache.dereference_gen(gen);
            }
        }));
        ctx
    }

    /// Submit one host operation. Responses arrive through the sink,
    /// possibly before this returns (cache-only operations never park).
    pub fn post(&self, request: FsRequest) {
        match self.state.load(Ordering::Acquire) {
            STATE_STARTING => {
                let ctx = self.make_context(OpKind::External, Some(request));
                self.lock_parked().push(ctx);
                // The handshake may have finished while parking.
                if self.state.load(Ordering::Acquire) != STATE_STARTING {
                    self.unpark();
                }
            }
            STATE_READY => {
                let ctx = self.make_context(OpKind::External, Some(request));
                self.run(ctx);
            }
            STATE_REJECTED => self.sink.deliver(FsResponse {
                hint: request.hint,
                result: Err(Status::AccessDenied),
            }),
            _ => self.sink.deliver(FsResponse {
                hint: request.hint,
                result: Err(Status::Cancelled),
            }),
        }
    }

    /// Enter (or re-enter) the context's handler and route the outcome.
    fn run(&self, mut ctx: Box<RequestContext>) {
        match ops::dispatch(self, &mut ctx) {
            Flow::Suspended => {
                if ctx.out.is_none() {
                    warn!(token = ctx.token, "handler suspended without a message");
                    ctx.fail(Status::IoError);
                    self.finish(ctx);
                    return;
                }
                if let Err(mut ctx) = self.ioq.post_pending(ctx) {
                    ctx.fail(Status::Cancelled);
                    self.finish(ctx);
                }
            }
            Flow::Complete => self.finish(ctx),
        }
    }

    /// Deliver the terminal outcome and destroy the context.
    fn finish(&self, mut ctx: Box<RequestContext>) {
        if let Some(request) = ctx.request.as_ref() {
            let result = match ctx.status.take() {
                Some(status) => {
                    if !status.is_expected() {
                        warn!(
                            token = ctx.token,
                            op = request.op.kind_name(),
                            %status,
                            "operation failed"
                        );
                    }
                    Err(status)
                }
                None => Ok(ctx.reply.take().unwrap_or(FsReply::Unit)),
            };
            self.sink.deliver(FsResponse {
                hint: request.hint,
                result,
            });
        }
    }

    /// Pull the next outbound wire message, if any is staged.
    ///
    /// Fire-and-forget turns (FORGET) resume their handler immediately;
    /// everything else parks in the processing table until
    /// [`deliver_response`](Self::deliver_response) matches it.
    #[must_use]
    pub fn next_message(&self) -> Option<Bytes> {
        loop {
            let mut ctx = self.ioq.next_pending()?;
            let Some(message) = ctx.out.take() else {
                warn!(token = ctx.token, "pending context without a message");
                ctx.fail(Status::IoError);
                self.finish(ctx);
                continue;
            };
            if ctx.fire_and_forget {
                ctx.fire_and_forget = false;
                self.run(ctx);
                trace_outbound(&message);
                return Some(message);
            }
            if self.ioq.start_processing(ctx) {
                trace_outbound(&message);
                return Some(message);
            }
            // Raced the shutdown marker; the context is gone and its
            // message must not go out.
        }
    }

    /// Feed one inbound wire response. Malformed or stale responses are
    /// logged and discarded.
    pub fn deliver_response(&self, buf: Bytes) {
        let response = match proto::decode_response(buf) {
            Ok(response) => response,
            Err(err) => {
                warn!(%err, "malformed response discarded");
                return;
            }
        };
        let Some(mut ctx) = self.ioq.end_processing(response.unique) else {
            debug!(token = response.unique, "stale response discarded");
            return;
        };
        debug!(token = response.unique, errno = response.errno, "message in");
        ctx.response = Some(response);
        self.run(ctx);
    }

    /// Ordered shutdown: reject new work, let in-flight exchanges drain,
    /// send DESTROY as the final turn.
    pub fn stop(&self) {
        if self.ioq.stopped() {
            return;
        }
        let mut ctx = self.make_context(OpKind::Destroy, None);
        match ops::dispatch(self, &mut ctx) {
            Flow::Suspended => self.ioq.post_pending_and_stop(ctx),
            Flow::Complete => {
                self.finish(ctx);
                self.mark_stopped();
            }
        }
        let parked = std::mem::take(&mut *self.lock_parked());
        for mut ctx in parked {
            ctx.fail(Status::Cancelled);
            self.finish(ctx);
        }
    }

    /// Periodic maintenance: evict expired entries and drain cleared
    /// forget records into FORGET turns.
    pub fn sweep(&self) {
        self.cache.expire(self.now(), self);
    }

    /// Wait until the session handshake resolves. Cancellable by
    /// dropping the future.
    pub async fn ready(&self) -> Result<(), Status> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.state.load(Ordering::Acquire) {
                STATE_STARTING => notified.await,
                STATE_READY => return Ok(()),
                STATE_REJECTED => return Err(Status::AccessDenied),
                _ => return Err(Status::Cancelled),
            }
        }
    }

    /// Whether an ordered shutdown has been initiated.
    #[must_use]
    pub fn stopping(&self) -> bool {
        self.ioq.stopped()
    }

    pub(crate) fn session_ready(&self, minor: u32, max_write: u32) {
        self.minor.store(minor, Ordering::Release);
        self.max_write
            .store(max_write.max(MIN_TRANSFER), Ordering::Release);
        self.state.store(STATE_READY, Ordering::Release);
        self.changed.notify_waiters();
        self.unpark();
    }

    pub(crate) fn reject_session(&self) {
        self.state.store(STATE_REJECTED, Ordering::Release);
        self.changed.notify_waiters();
        self.unpark();
    }

    pub(crate) fn mark_stopped(&self) {
        self.state.store(STATE_STOPPED, Ordering::Release);
        self.changed.notify_waiters();
    }

    /// Release everything parked behind the handshake, according to how
    /// the handshake ended.
    fn unpark(&self) {
        let parked = std::mem::take(&mut *self.lock_parked());
        if parked.is_empty() {
            return;
        }
        let state = self.state.load(Ordering::Acquire);
        for mut ctx in parked {
            match state {
                STATE_READY => self.run(ctx),
                STATE_REJECTED => {
                    ctx.fail(Status::AccessDenied);
                    self.finish(ctx);
                }
                _ => {
                    ctx.fail(Status::Cancelled);
                    self.finish(ctx);
                }
            }
        }
    }

    pub(crate) fn now(&self) -> Ticks {
        self.clock.now()
    }

    pub(crate) fn config(&self) -> &VolumeParams {
        &self.config
    }

    pub(crate) fn errno_table(&self) -> ErrnoTable {
        self.config.errno_table
    }

    pub(crate) fn security(&self) -> &dyn SecurityMapper {
        self.security.as_ref()
    }

    pub(crate) fn minor(&self) -> u32 {
        self.minor.load(Ordering::Acquire)
    }

    pub(crate) fn max_write(&self) -> u32 {
        self.max_write.load(Ordering::Acquire)
    }

    pub(crate) fn max_read(&self) -> u32 {
        // The transfer cap is symmetric.
        self.max_write()
    }

    /// Build an [`Entry`] from a wire reply, substituting the configured
    /// validity when the remote reports none.
    pub(crate) fn make_entry(&self, out: &EntryOut) -> Entry {
        let mut entry = Entry::from_entry_out(out);
        if entry.entry_valid == 0 {
            entry.entry_valid = self.config.entry_timeout;
        }
        if entry.attr_valid == 0 {
            entry.attr_valid = self.config.attr_timeout;
        }
        entry
    }

    /// Like [`make_entry`](Self::make_entry), for bindings discovered
    /// through directory enumeration: their validity is additionally
    /// capped by the configured directory timeout.
    pub(crate) fn make_listed_entry(&self, out: &EntryOut) -> Entry {
        let mut entry = self.make_entry(out);
        entry.entry_valid = entry.entry_valid.min(self.config.dir_timeout);
        entry.attr_valid = entry.attr_valid.min(self.config.dir_timeout);
        entry
    }

    /// The last volume-information result, while still within its
    /// configured lifetime.
    pub(crate) fn cached_volume_info(&self) -> Option<VolumeInfo> {
        let guard = self
            .volume_info
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (stamp, info) = guard.as_ref()?;
        (self.now() < stamp.saturating_add(self.config.volume_timeout)).then(|| info.clone())
    }

    pub(crate) fn store_volume_info(&self, info: VolumeInfo) {
        *self
            .volume_info
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some((self.now(), info));
    }

    /// Synthesize the root's cache entry from a GETATTR reply.
    pub(crate) fn root_entry(&self, out: &AttrOut) -> Entry {
        let valid = out
            .attr_valid
            .saturating_mul(1_000_000_000)
            .saturating_add(u64::from(out.attr_valid_nsec));
        let mut attr = out.attr;
        attr.ino = proto::ROOT_ID;
        let valid = if valid == 0 {
            self.config.entry_timeout
        } else {
            valid
        };
        Entry {
            ino: proto::ROOT_ID,
            generation: 0,
            attr,
            entry_valid: valid,
            attr_valid: valid,
        }
    }
}

/// Debug-trace one outbound message by its decoded opcode.
fn trace_outbound(message: &Bytes) {
    if message.len() < proto::REQUEST_HEADER_LEN {
        return;
    }
    let raw = u32::from_le_bytes(message[4..8].try_into().unwrap_or([0; 4]));
    let token = u64::from_le_bytes(message[8..16].try_into().unwrap_or([0; 8]));
    match proto::Opcode::try_from(raw) {
        Ok(opcode) => debug!(token, ?opcode, "message out"),
        Err(err) => debug!(token, %err, "message out"),
    }
}

impl ForgetSink for Instance {
    /// Turn cleared forget records into a forget-draining context. While
    /// the session is not ready (or is shutting down) nothing is
    /// accepted, and the cache requeues the records for a later sweep.
    fn notify_forget(&self, batch: &mut VecDeque<(u64, u64)>) {
        if self.state.load(Ordering::Acquire) != STATE_READY || self.ioq.stopped() {
            return;
        }
        let mut ctx = self.make_context(OpKind::Forget, None);
        ctx.scratch_forget().batch = std::mem::take(batch);
        self.run(ctx);
    }
}
