//! Pending-request queue.
//!
//! Matches asynchronous wire responses to their request context by
//! correlation token and serializes per-volume outbound progress: at most
//! one context is handed out by [`Ioq::next_pending`] to fill the single
//! outbound channel at a time, and an ordered shutdown handshake lets the
//! engine drain every in-flight exchange before the final DESTROY turn.
//!
//! Correlation tokens are explicit monotonically increasing integers that
//! are never reused while a response referencing them could still arrive;
//! the queue's lifecycle rules (a context is either pending, processing,
//! or destroyed) guarantee that.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rustc_hash::FxHashMap;
use tracing::debug;

/// Items the queue can track: anything with a correlation token.
///
/// Dropping an item must be safe at any lifecycle stage — the queue drops
/// contexts it rejects or still owns at teardown, and relies on the item's
/// own `Drop` to run its finalizer.
pub trait Correlated {
    fn token(&self) -> u64;

    /// Called when this item turns out to be the designated final context
    /// of an ordered shutdown, so its handler can tell.
    fn mark_final(&mut self) {}
}

#[derive(Debug)]
struct IoqInner<T> {
    /// Contexts waiting to be sent, in arrival order.
    pending: VecDeque<Box<T>>,
    /// Contexts sent and awaiting a matching response, by token.
    processing: FxHashMap<u64, Box<T>>,
    /// Token of the designated final context, once shutdown is initiated.
    stop: Option<u64>,
}

/// The pending-request queue. One per volume instance.
#[derive(Debug)]
pub struct Ioq<T: Correlated> {
    inner: Mutex<IoqInner<T>>,
}

impl<T: Correlated> Default for Ioq<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Correlated> Ioq<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(IoqInner {
                pending: VecDeque::new(),
                processing: FxHashMap::default(),
                stop: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, IoqInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a context to be sent as a fresh outbound request.
    ///
    /// Once shutdown has designated a final context the queue accepts
    /// nothing more; the rejected context is handed back so the caller can
    /// fail it before destroying it.
    pub fn post_pending(&self, ctx: Box<T>) -> Result<(), Box<T>> {
        let mut inner = self.lock();
        if inner.stop.is_some() {
            drop(inner);
            debug!(token = ctx.token(), "request posted after shutdown");
            return Err(ctx);
        }
        inner.pending.push_back(ctx);
        Ok(())
    }

    /// Atomically clear the pending queue and install `ctx` as the
    /// one-and-only remaining pending item and the shutdown marker.
    ///
    /// Implements "drain in-flight work, then send the final turn, then
    /// accept no more": every later [`post_pending`](Self::post_pending)
    /// fails, and the final context is only handed out once the
    /// processing list has emptied.
    pub fn post_pending_and_stop(&self, ctx: Box<T>) {
        let dropped = {
            let mut inner = self.lock();
            inner.stop = Some(ctx.token());
            let dropped = std::mem::take(&mut inner.pending);
            inner.pending.push_back(ctx);
            dropped
        };
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "shutdown cleared pending requests");
        }
        drop(dropped); // finalizers run outside the lock
    }

    /// Pop the next context to become the outbound wire message.
    ///
    /// Withheld while shutdown has been requested and responses are still
    /// outstanding, which forces the caller to wait for drainage before
    /// the final turn goes out.
    #[must_use]
    pub fn next_pending(&self) -> Option<Box<T>> {
        let mut inner = self.lock();
        if inner.stop.is_some() && !inner.processing.is_empty() {
            return None;
        }
        inner.pending.pop_front()
    }

    /// Move a context from "about to send" to "awaiting a matching
    /// response".
    ///
    /// Returns `true` if the context is now awaiting its response, `false`
    /// if its construction raced a shutdown and it was destroyed. The
    /// designated final context is marked so its handler can distinguish
    /// itself.
    pub fn start_processing(&self, mut ctx: Box<T>) -> bool {
        let mut inner = self.lock();
        match inner.stop {
            Some(token) if token != ctx.token() => {
                drop(inner);
                debug!(token = ctx.token(), "context raced shutdown; dropped");
                false
            }
            stop => {
                if stop.is_some() {
                    ctx.mark_final();
                }
                let prev = inner.processing.insert(ctx.token(), ctx);
                debug_assert!(prev.is_none(), "correlation token reused in flight");
                true
            }
        }
    }

    /// Retrieve the in-flight context matching an inbound response.
    ///
    /// `None` for stale, duplicate, or bogus tokens — tolerated silently
    /// by design, since the remote side may answer a request the engine
    /// has already given up on.
    #[must_use]
    pub fn end_processing(&self, token: u64) -> Option<Box<T>> {
        self.lock().processing.remove(&token)
    }

    /// Whether an ordered shutdown has been initiated.
    #[must_use]
    pub fn stopped(&self) -> bool {
        self.lock().stop.is_some()
    }
}

impl<T: Correlated> Drop for Ioq<T> {
    /// Destroys every context still queued in either list; their own
    /// `Drop` impls run the finalizers.
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        inner.pending.clear();
        inner.processing.clear();
    }
}
