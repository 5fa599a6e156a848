#![allow(clippy::unwrap_used, missing_docs)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fusebridge::ioq::{Correlated, Ioq};

#[derive(Debug)]
struct TestCtx {
    token: u64,
    is_final: bool,
    dropped: Option<Arc<AtomicUsize>>,
}

impl TestCtx {
    fn new(token: u64) -> Box<Self> {
        Box::new(Self {
            token,
            is_final: false,
            dropped: None,
        })
    }

    /// A context whose destruction bumps `counter`, standing in for the
    /// finalizer a real context runs on drop.
    fn tracked(token: u64, counter: &Arc<AtomicUsize>) -> Box<Self> {
        Box::new(Self {
            token,
            is_final: false,
            dropped: Some(Arc::clone(counter)),
        })
    }
}

impl Correlated for TestCtx {
    fn token(&self) -> u64 {
        self.token
    }

    fn mark_final(&mut self) {
        self.is_final = true;
    }
}

impl Drop for TestCtx {
    fn drop(&mut self) {
        if let Some(counter) = &self.dropped {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[test]
fn pending_is_fifo() {
    let ioq: Ioq<TestCtx> = Ioq::new();
    for token in 1..=3 {
        ioq.post_pending(TestCtx::new(token)).unwrap();
    }
    for token in 1..=3 {
        assert_eq!(ioq.next_pending().unwrap().token, token);
    }
    assert!(ioq.next_pending().is_none());
}

#[test]
fn round_trip_through_processing() {
    let ioq: Ioq<TestCtx> = Ioq::new();
    ioq.post_pending(TestCtx::new(5)).unwrap();
    let ctx = ioq.next_pending().unwrap();
    assert!(ioq.start_processing(ctx));

    let ctx = ioq.end_processing(5).expect("context was in flight");
    assert_eq!(ctx.token, 5);
    assert!(!ctx.is_final);
    // A second retrieval of the same token finds nothing.
    assert!(ioq.end_processing(5).is_none());
}

#[test]
fn stale_tokens_are_tolerated() {
    let ioq: Ioq<TestCtx> = Ioq::new();
    assert!(ioq.end_processing(77).is_none());
}

#[test]
fn shutdown_clears_pending_and_installs_the_final_context() {
    let dropped = Arc::new(AtomicUsize::new(0));
    let ioq: Ioq<TestCtx> = Ioq::new();
    ioq.post_pending(TestCtx::tracked(1, &dropped)).unwrap();
    ioq.post_pending(TestCtx::tracked(2, &dropped)).unwrap();

    ioq.post_pending_and_stop(TestCtx::new(9));
    assert!(ioq.stopped());
    assert_eq!(
        dropped.load(Ordering::Relaxed),
        2,
        "queued contexts are destroyed by the shutdown"
    );

    // Nothing in flight, so the final context comes out at once and is
    // marked as such.
    let ctx = ioq.next_pending().unwrap();
    assert_eq!(ctx.token, 9);
    assert!(ioq.start_processing(ctx));
    assert!(ioq.end_processing(9).unwrap().is_final);
}

#[test]
fn final_turn_waits_for_in_flight_responses() {
    let ioq: Ioq<TestCtx> = Ioq::new();
    ioq.post_pending(TestCtx::new(1)).unwrap();
    let in_flight = ioq.next_pending().unwrap();
    assert!(ioq.start_processing(in_flight));

    ioq.post_pending_and_stop(TestCtx::new(2));
    assert!(
        ioq.next_pending().is_none(),
        "final context is withheld while a response is outstanding"
    );

    assert!(ioq.end_processing(1).is_some());
    assert_eq!(ioq.next_pending().unwrap().token, 2);
}

#[test]
fn post_after_shutdown_hands_the_context_back() {
    let ioq: Ioq<TestCtx> = Ioq::new();
    ioq.post_pending_and_stop(TestCtx::new(1));

    let rejected = ioq
        .post_pending(TestCtx::new(42))
        .expect_err("queue accepts nothing after shutdown");
    assert_eq!(rejected.token, 42, "caller gets the context back to fail it");
}

#[test]
fn context_racing_shutdown_is_destroyed() {
    let dropped = Arc::new(AtomicUsize::new(0));
    let ioq: Ioq<TestCtx> = Ioq::new();
    ioq.post_pending(TestCtx::tracked(1, &dropped)).unwrap();
    let racer = ioq.next_pending().unwrap();

    // Shutdown lands between next_pending and start_processing.
    ioq.post_pending_and_stop(TestCtx::new(2));
    assert!(!ioq.start_processing(racer));
    assert_eq!(dropped.load(Ordering::Relaxed), 1);
    assert!(ioq.end_processing(1).is_none());
}

#[test]
fn teardown_destroys_everything_still_queued() {
    let dropped = Arc::new(AtomicUsize::new(0));
    {
        let ioq: Ioq<TestCtx> = Ioq::new();
        ioq.post_pending(TestCtx::tracked(1, &dropped)).unwrap();
        ioq.post_pending(TestCtx::tracked(2, &dropped)).unwrap();
        let ctx = ioq.next_pending().unwrap();
        assert!(ioq.start_processing(ctx));
    }
    assert_eq!(dropped.load(Ordering::Relaxed), 2);
}
