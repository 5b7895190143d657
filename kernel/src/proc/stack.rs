//! Private execution stacks for forked threads.

use alloc::boxed::Box;
use alloc::vec;
use derivative::Derivative;

use crate::arch::switch::Context;
use crate::config::{STACK_FENCEPOST, STACK_SIZE};

const WORD: u64 = core::mem::size_of::<u64>() as u64;

/// A `STACK_SIZE`-word buffer owned by exactly one thread.
///
/// The lowest word holds [`STACK_FENCEPOST`]. Stacks grow down, so a thread that runs off the end
/// clobbers that word first, and the next overflow check notices.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Stack {
    #[derivative(Debug = "ignore")]
    words: Box<[u64]>,
}

impl Stack {
    pub fn allocate() -> Self {
        let mut words = vec![0u64; STACK_SIZE].into_boxed_slice();
        words[0] = STACK_FENCEPOST;

        log::trace!(
            "Allocated stack at {:#x}, {} words",
            words.as_ptr() as usize,
            STACK_SIZE
        );

        Self { words }
    }

    /// Lowest address of the buffer, where the guard word lives.
    pub fn bottom(&self) -> u64 {
        self.words.as_ptr() as u64
    }

    /// One past the highest address of the buffer.
    pub fn end(&self) -> u64 {
        self.bottom() + self.words.len() as u64 * WORD
    }

    /// Initial stack pointer: 16-byte aligned, with a zeroed fake return address above it so
    /// backtraces stop cleanly.
    pub fn top(&self) -> u64 {
        (self.end() & !0xF) - 2 * WORD
    }

    /// True when `sp` points into the usable part of this stack.
    pub fn contains(&self, sp: u64) -> bool {
        sp > self.bottom() && sp <= self.end()
    }

    pub fn guard_intact(&self) -> bool {
        self.words[0] == STACK_FENCEPOST
    }

    /// Make `ctx` resume in the trampoline on this stack, which will call `entry(arg)`.
    pub fn prime(
        &mut self,
        ctx: &mut Context,
        entry: fn(usize),
        arg: usize,
        startup: extern "C" fn(),
        when_done: extern "C" fn() -> !,
    ) {
        let top = self.top();
        let slot = ((top - self.bottom()) / WORD) as usize;
        self.words[slot] = 0;
        self.words[slot + 1] = 0;

        ctx.prime(top, entry, arg, startup, when_done);
    }

    #[cfg(test)]
    pub(crate) fn smash_guard(&mut self) {
        self.words[0] = 0;
    }

    #[cfg(test)]
    pub(crate) fn scribble(&mut self, from_top: usize, value: u64) {
        let len = self.words.len();
        self.words[len - 1 - from_top] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::switch::slot;

    fn entry(_: usize) {}
    extern "C" fn startup() {}
    extern "C" fn done() -> ! {
        loop {}
    }

    #[test]
    fn fresh_stack_has_guard_and_aligned_top() {
        let stack = Stack::allocate();
        assert!(stack.guard_intact());
        assert_eq!(stack.top() % 16, 0);
        assert!(stack.contains(stack.top()));
        assert!(!stack.contains(stack.bottom()));
        assert!(!stack.contains(stack.end() + WORD));
        assert_eq!(stack.end() - stack.bottom(), STACK_SIZE as u64 * WORD);
    }

    #[test]
    fn prime_targets_this_stack() {
        let mut stack = Stack::allocate();
        let mut ctx = Context::empty();
        stack.prime(&mut ctx, entry, 7, startup, done);

        assert_eq!(ctx.stack_top, stack.top());
        assert_eq!(ctx.machine_state[slot::INITIAL_ARG], 7);
        assert!(stack.guard_intact());
    }

    #[test]
    fn writes_within_bounds_keep_the_guard() {
        let mut stack = Stack::allocate();
        for depth in 0..STACK_SIZE - 1 {
            stack.scribble(depth, 0xFFFF_FFFF_FFFF_FFFF);
        }
        assert!(stack.guard_intact());
    }

    #[test]
    fn writing_past_the_bound_is_detected() {
        let mut stack = Stack::allocate();
        stack.smash_guard();
        assert!(!stack.guard_intact());
    }
}
