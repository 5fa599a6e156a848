//! Resumption-stack coroutine engine.
//!
//! Operation handlers perform several send-message-then-await-response
//! cycles without a dedicated thread per request. A handler is a plain
//! function re-invoked by the dispatcher; its progress lives in a small
//! fixed-depth stack of resume points, one slot per nesting level of
//! sub-handler calls. Suspending a nested handler transparently suspends
//! every caller up the chain, because each caller re-enters the same
//! `awaited` call until the sub-handler completes.
//!
//! Handlers are written as a `loop { match coro.point() { ... } }`:
//! falling through to the next point is a `jump`, returning
//! [`Flow::Suspended`] after recording the next point is a yield, and
//! returning [`Flow::Complete`] finishes the current nesting level.

/// Maximum nesting depth of sub-handler calls.
pub const MAX_DEPTH: usize = 8;

/// Outcome of one handler re-entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// The handler emitted an outbound message (or is otherwise waiting)
    /// and must be re-entered when the awaited response arrives.
    Suspended,
    /// The current nesting level reached its terminal state.
    Complete,
}

/// Per-request resumption state.
#[derive(Debug, Clone)]
pub struct Coro {
    frames: [u16; MAX_DEPTH],
    level: usize,
}

impl Default for Coro {
    fn default() -> Self {
        Self::new()
    }
}

impl Coro {
    #[must_use]
    pub fn new() -> Self {
        Self {
            frames: [0; MAX_DEPTH],
            level: 0,
        }
    }

    /// Resume point of the handler at the current nesting level.
    #[must_use]
    pub fn point(&self) -> u16 {
        self.frames[self.level]
    }

    /// Move the current level to `point` without suspending.
    pub fn jump(&mut self, point: u16) {
        self.frames[self.level] = point;
    }

    /// Record `point` as the resume target and suspend.
    #[must_use]
    pub fn suspend(&mut self, point: u16) -> Flow {
        self.frames[self.level] = point;
        Flow::Suspended
    }

    fn push(&mut self) {
        assert!(self.level + 1 < MAX_DEPTH, "coroutine nesting too deep");
        self.level += 1;
    }

    fn pop(&mut self, flow: Flow) {
        debug_assert!(self.level > 0, "pop below the root frame");
        if flow == Flow::Complete {
            // Reset the frame so a sequential sibling await starts fresh.
            self.frames[self.level] = 0;
        }
        self.level -= 1;
    }
}

/// Anything carrying a [`Coro`]; lets `awaited` nest sub-handlers over an
/// arbitrary context type.
pub trait HasCoro {
    fn coro(&mut self) -> &mut Coro;
}

/// Run `sub` one nesting level deeper.
///
/// If `sub` suspends, the caller must return [`Flow::Suspended`] without
/// advancing its own resume point, so the next re-entry reaches this same
/// call and resumes the sub-handler where it left off. On
/// [`Flow::Complete`] the sub-frame is reset and the caller advances.
pub fn awaited<C: HasCoro>(ctx: &mut C, sub: impl FnOnce(&mut C) -> Flow) -> Flow {
    ctx.coro().push();
    let flow = sub(ctx);
    ctx.coro().pop(flow);
    flow
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        coro: Coro,
        log: Vec<&'static str>,
        loops: u16,
    }

    impl HasCoro for Fixture {
        fn coro(&mut self) -> &mut Coro {
            &mut self.coro
        }
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                coro: Coro::new(),
                log: Vec::new(),
                loops: 0,
            }
        }

        fn drive(&mut self, handler: fn(&mut Fixture) -> Flow) -> usize {
            let mut entries = 0;
            loop {
                entries += 1;
                if handler(self) == Flow::Complete {
                    return entries;
                }
            }
        }
    }

    fn yields_twice(f: &mut Fixture) -> Flow {
        loop {
            match f.coro.point() {
                0 => {
                    f.log.push("a");
                    return f.coro.suspend(1);
                }
                1 => {
                    f.log.push("b");
                    return f.coro.suspend(2);
                }
                _ => {
                    f.log.push("c");
                    return Flow::Complete;
                }
            }
        }
    }

    fn breaks_immediately(f: &mut Fixture) -> Flow {
        f.log.push("sub-break");
        Flow::Complete
    }

    fn loop_yield(f: &mut Fixture) -> Flow {
        loop {
            match f.coro.point() {
                0 => {
                    if f.loops == 3 {
                        return Flow::Complete;
                    }
                    f.loops += 1;
                    f.log.push("iter");
                    return f.coro.suspend(0);
                }
                _ => unreachable!(),
            }
        }
    }

    fn awaits_yielder(f: &mut Fixture) -> Flow {
        loop {
            match f.coro.point() {
                0 => {
                    if awaited(f, yields_twice) == Flow::Suspended {
                        return Flow::Suspended;
                    }
                    f.coro.jump(1);
                }
                1 => {
                    if awaited(f, breaks_immediately) == Flow::Suspended {
                        return Flow::Suspended;
                    }
                    f.coro.jump(2);
                }
                _ => {
                    f.log.push("outer-done");
                    return Flow::Complete;
                }
            }
        }
    }

    fn nested_loop_await(f: &mut Fixture) -> Flow {
        loop {
            match f.coro.point() {
                0 => {
                    if f.loops == 2 {
                        return Flow::Complete;
                    }
                    f.coro.jump(1);
                }
                1 => {
                    if awaited(f, yields_twice) == Flow::Suspended {
                        return Flow::Suspended;
                    }
                    f.loops += 1;
                    f.coro.jump(0);
                }
                _ => unreachable!(),
            }
        }
    }

    #[test]
    fn n_yields_take_n_plus_one_entries() {
        let mut f = Fixture::new();
        assert_eq!(f.drive(yields_twice), 3);
        assert_eq!(f.log, ["a", "b", "c"]);
    }

    #[test]
    fn break_completes_in_one_entry() {
        let mut f = Fixture::new();
        assert_eq!(f.drive(breaks_immediately), 1);
    }

    #[test]
    fn loop_yield_counts_iterations() {
        let mut f = Fixture::new();
        assert_eq!(f.drive(loop_yield), 4);
        assert_eq!(f.log, ["iter", "iter", "iter"]);
    }

    #[test]
    fn await_propagates_suspension_to_caller() {
        let mut f = Fixture::new();
        // Sub yields twice: entries 1 and 2 suspend, entry 3 completes the
        // sub plus the immediate-break sibling and the outer handler.
        assert_eq!(f.drive(awaits_yielder), 3);
        assert_eq!(f.log, ["a", "b", "c", "sub-break", "outer-done"]);
    }

    #[test]
    fn sequential_awaits_reuse_the_sub_frame() {
        let mut f = Fixture::new();
        f.drive(awaits_yielder);
        // After completion, all frames are reset.
        assert_eq!(f.coro.level, 0);
        assert!(f.coro.frames.iter().skip(1).all(|&p| p == 0));
    }

    #[test]
    fn nested_loop_await_resumes_at_the_right_point() {
        let mut f = Fixture::new();
        // Two loop iterations, each awaiting a sub that suspends twice:
        // 2 * 2 suspensions + final completing entry.
        assert_eq!(f.drive(nested_loop_await), 5);
        assert_eq!(f.log, ["a", "b", "c", "a", "b", "c"]);
    }
}
