//! The thread control block.
//!
//! Forking takes two steps: build the block with [`Thread::new`], then give it something to run
//! with [`Thread::fork`]. Only the thread that is currently on the CPU may `yield_cpu`, `sleep`
//! or `finish` itself.

use alloc::string::String;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};

use derivative::Derivative;
use spin::{Mutex, MutexGuard};

use super::manager::{RawTid, Tid};
use super::processor;
use super::space::{AddressSpace, UserContext};
use super::stack::Stack;
use super::status::ThreadStatus;
use super::ThreadError;
use crate::arch::interrupts::InterruptGuard;
use crate::arch::switch::Context;
use crate::config::{DEFAULT_PRIORITY, MAX_PRIORITY, MIN_PRIORITY};

#[derive(Derivative)]
#[derivative(Debug)]
pub struct Thread {
    /// Saved stack pointer and registers. Meaningful only while the thread is off the CPU, and
    /// only touched with interrupts disabled.
    #[derivative(Debug = "ignore")]
    context: UnsafeCell<Context>,

    name: String,
    inner: Mutex<ThreadInner>,
}

#[derive(Debug)]
struct ThreadInner {
    status: ThreadStatus,
    priority: i32,

    // None once the thread has been disposed of.
    tid: Option<Tid>,
    // Assigned by whoever manages processes and users.
    pid: u64,
    uid: u64,

    used_time_slice: u64,

    // None for the bootstrap thread, and for a forked thread once it has been disposed of.
    stack: Option<Stack>,
    bootstrap: bool,
    finished: bool,

    user: Option<UserContext>,
}

// The context is only reached through raw pointers inside `thread_switch`, with interrupts off on
// the one CPU, so sharing the block between owners is sound.
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self::with_status(name, ThreadStatus::JustCreated, false))
    }

    /// Control block for the flow of execution that booted the processor. It keeps running on
    /// the stack it already has and never owns one.
    pub(super) fn bootstrap(name: &str) -> Arc<Self> {
        Arc::new(Self::with_status(name, ThreadStatus::Running, true))
    }

    fn with_status(name: &str, status: ThreadStatus, bootstrap: bool) -> Self {
        Self {
            context: UnsafeCell::new(Context::empty()),
            name: String::from(name),
            inner: Mutex::new(ThreadInner {
                status,
                priority: DEFAULT_PRIORITY,
                tid: Some(Tid::alloc()),
                pid: 0,
                uid: 0,
                used_time_slice: 0,
                stack: None,
                bootstrap,
                finished: false,
                user: None,
            }),
        }
    }

    /// Lock the mutable fields. Interrupts stay masked until the returned guard is gone, so a
    /// timer tick can never find the lock held by the thread it interrupted.
    fn lock(&self) -> Locked<'_> {
        let interrupts = InterruptGuard::new();
        Locked {
            inner: self.inner.lock(),
            _interrupts: interrupts,
        }
    }

    /// Make this thread run `func(arg)`: allocate and prime its stack, then hand it to the
    /// scheduler as `Ready`.
    ///
    /// Panics unless the thread is still `JustCreated`.
    pub fn fork(self: &Arc<Self>, func: fn(usize), arg: usize) {
        {
            let mut inner = self.lock();
            if inner.status != ThreadStatus::JustCreated || inner.bootstrap {
                log::error!("Refusing to fork \"{}\" twice", self.name);
                panic!(
                    "fork on thread \"{}\" which is {}, not JUST_CREATED",
                    self.name, inner.status
                );
            }

            let mut stack = Stack::allocate();
            // Nothing switches to this thread until it is enqueued below.
            let ctx = unsafe { &mut *self.context.get() };
            stack.prime(
                ctx,
                func,
                arg,
                processor::thread_begin,
                processor::thread_exit,
            );
            inner.stack = Some(stack);
        }

        log::trace!("Forking thread \"{}\" with arg {}", self.name, arg);
        processor::ready_to_run(self);
    }

    /// Give up the CPU if any other thread is ready; otherwise return straight away.
    pub fn yield_cpu(self: &Arc<Self>) {
        self.assert_current("yield_cpu");

        let _guard = InterruptGuard::new();
        log::trace!("Yielding thread \"{}\"", self.name);

        if let Some(next) = processor::find_next_to_run() {
            processor::requeue_current(self);
            processor::run(next, false);
        }
    }

    /// Block the current thread and run something else. Interrupts must already be off, and
    /// something must eventually call [`processor::ready_to_run`] on this thread or it never runs
    /// again.
    pub fn sleep(self: &Arc<Self>) {
        self.assert_current("sleep");
        processor::block_current(false);
    }

    /// Stop running this thread for good. Its stack is released by whichever thread runs next,
    /// once this one is no longer executing on it.
    pub fn finish(self: Arc<Self>) -> ! {
        self.assert_current("finish");
        // The processor keeps the thread alive until disposal; this frame is never resumed.
        drop(self);
        processor::finish_current()
    }

    /// Panics if the guard word at the bottom of the stack has been overwritten, or if the saved
    /// stack pointer of an off-CPU thread has left its stack.
    pub fn check_overflow(&self) {
        if self.has_overflowed() {
            log::error!("Stack overflow in thread \"{}\"", self.name);
            panic!("thread \"{}\" overflowed its stack", self.name);
        }
    }

    pub fn has_overflowed(&self) -> bool {
        let inner = self.lock();
        let Some(stack) = inner.stack.as_ref() else {
            return false;
        };

        if !stack.guard_intact() {
            return true;
        }

        // While Running the live stack pointer is in the CPU, not here.
        inner.status != ThreadStatus::Running
            && !stack.contains(unsafe { (*self.context.get()).stack_top })
    }

    pub fn status(&self) -> ThreadStatus {
        self.lock().status
    }

    pub fn set_status(&self, status: ThreadStatus) {
        self.lock().status = status;
    }

    pub fn status_label(&self) -> &'static str {
        self.status().label()
    }

    pub fn priority(&self) -> i32 {
        self.lock().priority
    }

    /// Accepts `MIN_PRIORITY..=MAX_PRIORITY`; anything else leaves the priority alone.
    pub fn set_priority(&self, priority: i32) -> Result<(), ThreadError> {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
            log::warn!(
                "Rejected priority {} for thread \"{}\"",
                priority,
                self.name
            );
            return Err(ThreadError::InvalidPriority(priority));
        }

        self.lock().priority = priority;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kernel thread id, or `None` once the thread has been disposed of.
    pub fn tid(&self) -> Option<RawTid> {
        self.lock().tid.as_ref().map(Tid::raw)
    }

    pub fn pid(&self) -> u64 {
        self.lock().pid
    }

    pub fn uid(&self) -> u64 {
        self.lock().uid
    }

    pub fn set_ids(&self, pid: u64, uid: u64) {
        let mut inner = self.lock();
        inner.pid = pid;
        inner.uid = uid;
    }

    pub fn used_time_slice(&self) -> u64 {
        self.lock().used_time_slice
    }

    pub fn charge_tick(&self) -> u64 {
        let mut inner = self.lock();
        inner.used_time_slice += 1;
        inner.used_time_slice
    }

    pub fn reset_time_slice(&self) {
        self.lock().used_time_slice = 0;
    }

    pub fn has_stack(&self) -> bool {
        self.lock().stack.is_some()
    }

    pub fn is_bootstrap(&self) -> bool {
        self.lock().bootstrap
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    /// Debug dump of the name.
    pub fn print(&self) {
        crate::kprint!("{}\t ", self.name);
    }

    /// Associate a user address space. The space is owned by the memory manager, not the thread.
    pub fn attach_space(&self, space: &'static dyn AddressSpace) {
        self.lock().user = Some(UserContext::new(space));
    }

    pub fn space(&self) -> Option<&'static dyn AddressSpace> {
        self.lock().user.as_ref().map(|user| user.space)
    }

    /// The address-space callbacks run without the block locked, so they may call back into
    /// this thread.
    pub fn save_user_state(&self) {
        let Some(mut user) = self.lock().user else {
            return;
        };

        user.save();
        if let Some(kept) = self.lock().user.as_mut() {
            kept.registers = user.registers;
        }
    }

    pub fn restore_user_state(&self) {
        let user = self.lock().user;
        if let Some(user) = user {
            user.restore();
        }
    }

    pub fn user_register(&self, index: usize) -> Option<u64> {
        let inner = self.lock();
        inner.user.as_ref().and_then(|user| user.registers.get(index).copied())
    }

    pub fn set_user_register(&self, index: usize, value: u64) -> bool {
        let mut inner = self.lock();
        match inner.user.as_mut().and_then(|user| user.registers.get_mut(index)) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Saved stack pointer. Stale while the thread is Running.
    pub fn saved_stack_pointer(&self) -> u64 {
        let _guard = InterruptGuard::new();
        unsafe { (*self.context.get()).stack_top }
    }

    pub(super) fn context_ptr(&self) -> *mut Context {
        self.context.get()
    }

    pub(super) fn mark_finished(&self) {
        self.lock().finished = true;
    }

    /// Release the stack and tid of a thread that has stopped for good. Must not be called from
    /// code running on that stack.
    pub(super) fn dispose(&self) {
        let (stack, tid) = {
            let mut inner = self.lock();
            assert!(
                inner.status != ThreadStatus::Running,
                "disposing of thread \"{}\" while it is RUNNING",
                self.name
            );
            (inner.stack.take(), inner.tid.take())
        };

        log::trace!(
            "Disposing of thread \"{}\" (tid {:?}, stack {:#x})",
            self.name,
            tid,
            stack.as_ref().map_or(0, Stack::bottom)
        );
        drop(stack);
        drop(tid);
    }

    fn assert_current(&self, operation: &str) {
        if !processor::is_current(self) {
            log::error!(
                "{} called on \"{}\", which is not the running thread",
                operation,
                self.name
            );
            panic!(
                "{} on thread \"{}\" which is {}, not the current thread",
                operation,
                self.name,
                self.status()
            );
        }
    }

    #[cfg(test)]
    pub(crate) fn stack_bounds(&self) -> Option<(u64, u64)> {
        self.lock().stack.as_ref().map(|stack| (stack.bottom(), stack.end()))
    }

    #[cfg(test)]
    pub(crate) fn set_saved_stack_pointer(&self, sp: u64) {
        let _guard = InterruptGuard::new();
        unsafe { (*self.context.get()).stack_top = sp };
    }

    #[cfg(test)]
    pub(crate) fn smash_stack_guard(&self) {
        if let Some(stack) = self.lock().stack.as_mut() {
            stack.smash_guard();
        }
    }
}

// Fields are dropped in order: the lock is released before interrupts come back.
struct Locked<'a> {
    inner: MutexGuard<'a, ThreadInner>,
    _interrupts: InterruptGuard,
}

impl Deref for Locked<'_> {
    type Target = ThreadInner;

    fn deref(&self) -> &ThreadInner {
        &self.inner
    }
}

impl DerefMut for Locked<'_> {
    fn deref_mut(&mut self) -> &mut ThreadInner {
        &mut self.inner
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        let status = self.inner.get_mut().status;
        assert!(
            status != ThreadStatus::Running,
            "dropping thread \"{}\" while it is RUNNING",
            self.name
        );
    }
}

impl fmt::Display for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Adapter for walking a thread list with `for_each`.
pub fn thread_print(thread: &Arc<Thread>) {
    thread.print();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::space::UserRegisters;

    #[test]
    fn new_thread_is_just_created_without_stack() {
        let t = Thread::new("fresh");
        assert_eq!(t.status(), ThreadStatus::JustCreated);
        assert_eq!(t.status_label(), "JUST_CREATED");
        assert_eq!(t.priority(), DEFAULT_PRIORITY);
        assert_eq!(t.name(), "fresh");
        assert!(!t.has_stack());
        assert!(!t.is_bootstrap());
        assert!(t.tid().is_some());
        assert!(!t.has_overflowed());
    }

    #[test]
    fn every_priority_in_range_is_accepted() {
        let t = Thread::new("p");
        for p in MIN_PRIORITY..=MAX_PRIORITY {
            assert_eq!(t.set_priority(p), Ok(()));
            assert_eq!(t.priority(), p);
        }
    }

    #[test]
    fn out_of_range_priority_is_rejected_and_unchanged() {
        let t = Thread::new("p");
        t.set_priority(5).unwrap();
        for p in [0, -1, 11, i32::MIN, i32::MAX] {
            assert_eq!(t.set_priority(p), Err(ThreadError::InvalidPriority(p)));
            assert_eq!(t.priority(), 5);
        }
    }

    #[test]
    fn ids_and_time_slice_are_plain_data() {
        let t = Thread::new("ids");
        t.set_ids(3, 1000);
        assert_eq!((t.pid(), t.uid()), (3, 1000));

        assert_eq!(t.charge_tick(), 1);
        assert_eq!(t.charge_tick(), 2);
        assert_eq!(t.used_time_slice(), 2);
        t.reset_time_slice();
        assert_eq!(t.used_time_slice(), 0);
    }

    #[test]
    fn distinct_threads_get_distinct_tids() {
        let a = Thread::new("a");
        let b = Thread::new("b");
        assert_ne!(a.tid(), b.tid());
    }

    #[test]
    fn display_shows_name() {
        let t = Thread::new("shown");
        assert_eq!(std::format!("{}", t), "shown");
    }

    #[test]
    fn forked_stack_guard_is_checked() {
        crate::proc::boot("main");
        let t = Thread::new("deep");
        t.fork(|_| {}, 0);

        assert!(t.has_stack());
        assert!(!t.has_overflowed());
        t.check_overflow();

        t.smash_stack_guard();
        assert!(t.has_overflowed());
    }

    #[test]
    #[should_panic(expected = "overflowed its stack")]
    fn check_overflow_is_fatal_once_guard_is_gone() {
        crate::proc::boot("main");
        let t = Thread::new("deep");
        t.fork(|_| {}, 0);

        t.smash_stack_guard();
        t.check_overflow();
    }

    #[test]
    fn bootstrap_thread_never_reports_overflow() {
        let main = crate::proc::boot("main");
        assert!(main.is_bootstrap());
        assert!(!main.has_overflowed());
        main.check_overflow();
    }

    #[test]
    fn user_registers_need_a_space() {
        struct NoopSpace;
        impl AddressSpace for NoopSpace {
            fn save_state(&self) {}
            fn restore_state(&self) {}
            fn save_user_registers(&self, _: &mut UserRegisters) {}
            fn restore_user_registers(&self, _: &UserRegisters) {}
        }
        static SPACE: NoopSpace = NoopSpace;

        let t = Thread::new("user");
        assert!(t.space().is_none());
        assert!(!t.set_user_register(2, 9));
        assert_eq!(t.user_register(2), None);

        t.attach_space(&SPACE);
        assert!(t.space().is_some());
        assert!(t.set_user_register(2, 9));
        assert_eq!(t.user_register(2), Some(9));
        assert_eq!(t.user_register(crate::config::NUM_TOTAL_REGS), None);
    }

    #[test]
    fn field_lock_holds_off_the_timer() {
        use crate::arch::interrupts;

        let main = crate::proc::boot("main");
        assert!(interrupts::are_enabled());
        {
            let _fields = main.lock();
            assert!(!interrupts::are_enabled());
        }
        assert!(interrupts::are_enabled());

        // Nothing else is ready, so the tick is charged and the thread keeps the CPU.
        crate::proc::timer_tick();
        assert_eq!(main.used_time_slice(), 1);
        assert!(interrupts::are_enabled());
    }

    #[test]
    fn address_space_callbacks_may_touch_their_thread() {
        use core::cell::RefCell;

        std::thread_local! {
            static OWNER: RefCell<Option<Arc<Thread>>> = const { RefCell::new(None) };
        }

        struct LookbackSpace;
        impl AddressSpace for LookbackSpace {
            fn save_state(&self) {}
            fn restore_state(&self) {}
            fn save_user_registers(&self, regs: &mut UserRegisters) {
                regs[0] = OWNER.with(|o| o.borrow().as_ref().map_or(0, |t| t.pid()));
            }
            fn restore_user_registers(&self, regs: &UserRegisters) {
                OWNER.with(|o| {
                    if let Some(t) = o.borrow().as_ref() {
                        t.set_ids(regs[0] + 1, t.uid());
                    }
                });
            }
        }
        static SPACE: LookbackSpace = LookbackSpace;

        let t = Thread::new("user");
        t.set_ids(7, 0);
        t.attach_space(&SPACE);
        OWNER.with(|o| *o.borrow_mut() = Some(t.clone()));

        t.save_user_state();
        assert_eq!(t.user_register(0), Some(7));

        t.restore_user_state();
        assert_eq!(t.pid(), 8);

        OWNER.with(|o| o.borrow_mut().take());
    }

    #[test]
    fn saved_stack_pointer_outside_the_stack_is_corruption() {
        crate::proc::boot("main");
        let t = Thread::new("wild");
        t.fork(|_| {}, 0);
        assert_eq!(t.status(), ThreadStatus::Ready);

        let (bottom, end) = t.stack_bounds().unwrap();
        let primed = t.saved_stack_pointer();
        assert!(!t.has_overflowed());

        t.set_saved_stack_pointer(bottom - 8);
        assert!(t.has_overflowed());

        t.set_saved_stack_pointer(end + 8);
        assert!(t.has_overflowed());

        t.set_saved_stack_pointer(primed);
        assert!(!t.has_overflowed());
    }

    #[test]
    #[should_panic(expected = "thread \"smashed\" overflowed its stack")]
    fn switch_refuses_a_thread_with_a_broken_guard() {
        let main = crate::proc::boot("main");
        let t = Thread::new("smashed");
        t.fork(|_| {}, 0);

        t.smash_stack_guard();
        main.yield_cpu();
    }

    #[test]
    #[should_panic(expected = "thread \"strayed\" overflowed its stack")]
    fn switch_refuses_a_thread_whose_stack_pointer_strayed() {
        let main = crate::proc::boot("main");
        let t = Thread::new("strayed");
        t.fork(|_| {}, 0);

        let (bottom, _) = t.stack_bounds().unwrap();
        t.set_saved_stack_pointer(bottom - 64);
        main.yield_cpu();
    }
}
