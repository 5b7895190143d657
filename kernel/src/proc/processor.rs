//! Per-CPU switching state: which thread is on the CPU, who runs next, and which finished thread
//! is still waiting for its stack to be freed.
//!
//! Everything here is mutated with interrupts off. Bare metal keeps one [`Processor`] behind a
//! spin lock. Hosted builds keep one per host thread, so each host thread behaves as its own
//! uniprocessor and tests can run side by side.

use alloc::boxed::Box;
use alloc::sync::Arc;

use super::scheduler::{FifoScheduler, Scheduler};
use super::status::ThreadStatus;
use super::thread::Thread;
use crate::arch::interrupts::{self, InterruptGuard};
use crate::arch::switch;

pub struct Processor {
    current: Arc<Thread>,
    scheduler: Box<dyn Scheduler>,
    // A finished thread whose stack may still be the live one.
    to_be_destroyed: Option<Arc<Thread>>,
    idle: Option<fn()>,
}

impl Drop for Processor {
    fn drop(&mut self) {
        // The CPU is going away under whatever was running on it.
        self.current.set_status(ThreadStatus::Blocked);

        if let Some(finished) = self.to_be_destroyed.take() {
            finished.dispose();
        }
    }
}

#[cfg(target_os = "none")]
mod slot {
    use super::Processor;
    use spin::Mutex;

    static PROCESSOR: Mutex<Option<Processor>> = Mutex::new(None);

    pub fn with<R>(f: impl FnOnce(&mut Option<Processor>) -> R) -> R {
        f(&mut PROCESSOR.lock())
    }
}

#[cfg(not(target_os = "none"))]
mod slot {
    use super::Processor;
    use core::cell::RefCell;

    std::thread_local! {
        static PROCESSOR: RefCell<Option<Processor>> = const { RefCell::new(None) };
    }

    pub fn with<R>(f: impl FnOnce(&mut Option<Processor>) -> R) -> R {
        PROCESSOR.with(|cell| f(&mut cell.borrow_mut()))
    }
}

fn with_processor<R>(f: impl FnOnce(&mut Processor) -> R) -> R {
    let _guard = InterruptGuard::new();
    slot::with(|processor| match processor.as_mut() {
        Some(processor) => f(processor),
        None => panic!("thread operation before the processor was booted"),
    })
}

/// Adopt the caller's flow of execution as the bootstrap thread, with a FIFO ready queue.
pub fn boot(name: &str) -> Arc<Thread> {
    boot_with(name, Box::new(FifoScheduler::new()))
}

/// Like [`boot`], with a caller-chosen ready-queue policy. Booting again throws away the previous
/// processor state, including anything still on its ready queue.
pub fn boot_with(name: &str, scheduler: Box<dyn Scheduler>) -> Arc<Thread> {
    interrupts::disable();

    let main = Thread::bootstrap(name);
    let previous = slot::with(|processor| {
        processor.replace(Processor {
            current: main.clone(),
            scheduler,
            to_be_destroyed: None,
            idle: None,
        })
    });

    if let Some(previous) = previous {
        assert!(
            previous.current.is_bootstrap(),
            "re-booting from forked thread \"{}\"",
            previous.current
        );
        drop(previous);
    }

    interrupts::enable();
    log::info!("Processor booted, running \"{}\"", name);

    main
}

/// Whether [`boot`] has run on this CPU. Interrupt handlers check this before touching threads.
pub fn is_booted() -> bool {
    let _guard = InterruptGuard::new();
    slot::with(|processor| processor.is_some())
}

pub fn current() -> Arc<Thread> {
    with_processor(|p| p.current.clone())
}

pub fn is_current(thread: &Thread) -> bool {
    with_processor(|p| core::ptr::eq(Arc::as_ptr(&p.current), thread))
}

/// Mark `thread` Ready and queue it. This is how forked threads start and how sleepers are woken.
pub fn ready_to_run(thread: &Arc<Thread>) {
    let _guard = InterruptGuard::new();

    let status = thread.status();
    assert!(
        matches!(status, ThreadStatus::JustCreated | ThreadStatus::Blocked),
        "ready_to_run on thread \"{}\" which is {}",
        thread,
        status
    );
    assert!(
        !thread.is_finished() && (thread.has_stack() || thread.is_bootstrap()),
        "ready_to_run on thread \"{}\" which has nothing to run",
        thread
    );

    enqueue(thread);
}

/// Queue the running thread behind whatever is ready. Only `yield_cpu` does this.
pub(super) fn requeue_current(thread: &Arc<Thread>) {
    enqueue(thread);
}

fn enqueue(thread: &Arc<Thread>) {
    log::trace!("Putting thread \"{}\" on ready list", thread);
    thread.set_status(ThreadStatus::Ready);
    with_processor(|p| p.scheduler.enqueue(thread.clone()));
}

pub(super) fn find_next_to_run() -> Option<Arc<Thread>> {
    with_processor(|p| p.scheduler.next())
}

/// Number of threads waiting on the ready queue.
pub fn ready_count() -> usize {
    with_processor(|p| p.scheduler.len())
}

/// Called by `sleep` when nothing is ready. It runs with interrupts off and should either make a
/// thread ready (say, by servicing a pending timer) or halt until something does. Without one,
/// sleeping with an empty ready queue is fatal.
pub fn set_idle_handler(handler: fn()) {
    with_processor(|p| p.idle = Some(handler));
}

/// Timer interrupt entry: charge the tick to the running thread and let someone else go.
pub fn timer_tick() {
    let thread = current();
    let used = thread.charge_tick();
    log::trace!("Timer tick, \"{}\" has used {} ticks", thread, used);

    thread.yield_cpu();
}

pub fn print_ready() {
    with_processor(|p| p.scheduler.print());
}

/// Switch the CPU from the current thread to `next`.
///
/// The outgoing thread's status must already say where it is going (Ready or Blocked). When
/// `finishing`, the outgoing thread is parked in `to_be_destroyed` and this call never returns.
pub(super) fn run(next: Arc<Thread>, finishing: bool) {
    debug_assert!(!interrupts::are_enabled(), "switching with interrupts on");

    // Both stacks are checked before anything changes hands.
    next.check_overflow();
    with_processor(|p| p.current.check_overflow());

    let old = with_processor(|p| core::mem::replace(&mut p.current, next.clone()));
    old.save_user_state();

    next.set_status(ThreadStatus::Running);
    log::trace!("Switching from \"{}\" to \"{}\"", old, next);

    let old_ctx = old.context_ptr();
    let new_ctx = next.context_ptr();
    drop(next);

    // A finishing thread's frame is abandoned, so it must not own a reference to itself; the
    // `to_be_destroyed` slot keeps its control block alive until disposal.
    let keep = if finishing {
        drop(old);
        None
    } else {
        Some(old)
    };

    unsafe { switch::thread_switch(old_ctx, new_ctx) };

    // Switched back in, on our own stack again.
    dispose_pending();

    if let Some(me) = keep {
        log::trace!("Now in thread \"{}\"", me);
        me.restore_user_state();
    }
}

/// Block the current thread and switch to the next ready one, idling until there is one.
pub(super) fn block_current(finishing: bool) {
    assert!(
        !interrupts::are_enabled(),
        "sleep requires interrupts to be disabled by the caller"
    );

    with_processor(|p| p.current.set_status(ThreadStatus::Blocked));

    let next = loop {
        if let Some(next) = find_next_to_run() {
            break next;
        }

        match with_processor(|p| p.idle) {
            Some(idle) => idle(),
            None => {
                log::error!("No thread is ready and no idle handler is installed");
                panic!("sleep with an empty ready queue: no runnable threads");
            }
        }
    };

    run(next, finishing);
}

/// Finish the current thread. Its control block is parked until a different thread is running.
pub(super) fn finish_current() -> ! {
    interrupts::disable();

    // Whoever was parked before is not on the CPU, so it can go now.
    dispose_pending();

    with_processor(|p| {
        log::debug!("Finishing thread \"{}\"", p.current);
        p.current.mark_finished();
        p.to_be_destroyed = Some(p.current.clone());
    });

    block_current(true);
    unreachable!("a finished thread was switched back in");
}

fn dispose_pending() {
    if let Some(finished) = with_processor(|p| p.to_be_destroyed.take()) {
        finished.dispose();
    }
}

/// Startup hook run by the trampoline before a forked thread's function.
pub(super) extern "C" fn thread_begin() {
    dispose_pending();
    interrupts::enable();
}

/// Where the trampoline goes when a forked thread's function returns.
pub(super) extern "C" fn thread_exit() -> ! {
    finish_current()
}
