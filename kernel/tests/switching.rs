//! Context-switching scenarios on the host. Every forked thread here runs on a real private stack
//! of the same host thread, so thread-local state is shared between them.

use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tcb_kernel::arch::interrupts::{self, InterruptGuard};
use tcb_kernel::proc::{self, AddressSpace, PriorityScheduler, UserRegisters};
use tcb_kernel::{Thread, ThreadStatus};

thread_local! {
    static EVENTS: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
    static THREADS: RefCell<Vec<Arc<Thread>>> = const { RefCell::new(Vec::new()) };
}

fn boot() -> Arc<Thread> {
    EVENTS.with(|e| e.borrow_mut().clear());
    THREADS.with(|t| t.borrow_mut().clear());
    let main = proc::boot("main");
    register(&main);
    main
}

fn register(thread: &Arc<Thread>) {
    THREADS.with(|t| t.borrow_mut().push(thread.clone()));
}

fn note(event: impl Into<String>) {
    EVENTS.with(|e| e.borrow_mut().push(event.into()));
}

fn events() -> Vec<String> {
    EVENTS.with(|e| e.borrow().clone())
}

fn status_of(name: &str) -> ThreadStatus {
    THREADS.with(|t| {
        t.borrow()
            .iter()
            .find(|thread| thread.name() == name)
            .map(|thread| thread.status())
            .unwrap_or(ThreadStatus::JustCreated)
    })
}

fn running_count() -> usize {
    THREADS.with(|t| {
        t.borrow()
            .iter()
            .filter(|thread| thread.status() == ThreadStatus::Running)
            .count()
    })
}

fn record_self(_: usize) {
    let me = proc::current();
    note(format!("{} {}", me.name(), me.status()));
}

#[test]
fn boot_adopts_caller_as_running_bootstrap_thread() {
    let main = boot();

    assert!(Arc::ptr_eq(&main, &proc::current()));
    assert!(main.is_bootstrap());
    assert!(!main.has_stack());
    assert_eq!(main.status(), ThreadStatus::Running);
    assert!(interrupts::are_enabled());
    assert_eq!(proc::processor::ready_count(), 0);
}

#[test]
fn fork_readies_and_switch_in_runs() {
    let main = boot();
    let a = Thread::new("a");
    register(&a);
    assert_eq!(a.status(), ThreadStatus::JustCreated);

    a.fork(record_self, 0);
    assert_eq!(a.status(), ThreadStatus::Ready);
    assert!(a.has_stack());
    assert_eq!(proc::processor::ready_count(), 1);

    main.yield_cpu();

    assert_eq!(events(), ["a RUNNING"]);
    assert_eq!(main.status(), ThreadStatus::Running);
    assert!(interrupts::are_enabled());
}

fn yield_to_b(_: usize) {
    note(format!("a runs, running={}", running_count()));
    proc::current().yield_cpu();
    note("a back");
}

fn observe_from_b(_: usize) {
    note(format!(
        "b sees a {} and b {}, running={}",
        status_of("a"),
        status_of("b"),
        running_count()
    ));
}

#[test]
fn yield_hands_cpu_to_next_ready_thread() {
    let main = boot();
    let a = Thread::new("a");
    let b = Thread::new("b");
    a.set_priority(5).unwrap();
    b.set_priority(3).unwrap();
    register(&a);
    register(&b);

    a.fork(yield_to_b, 0);
    b.fork(observe_from_b, 0);

    main.yield_cpu();
    // Main was queued behind b, so a gets one more turn before main comes back.
    while !a.is_finished() {
        main.yield_cpu();
    }

    assert_eq!(
        events(),
        [
            "a runs, running=1",
            "b sees a READY and b RUNNING, running=1",
            "a back"
        ]
    );
    assert_eq!(running_count(), 1);
    assert!(a.is_finished() && b.is_finished());
}

#[test]
fn yield_with_nothing_ready_is_a_no_op() {
    let main = boot();

    main.yield_cpu();
    main.yield_cpu();

    assert_eq!(main.status(), ThreadStatus::Running);
    assert!(Arc::ptr_eq(&main, &proc::current()));
    assert!(interrupts::are_enabled());
}

fn sleeper(_: usize) {
    let marker: u64 = 0xC0FFEE;
    let before = &marker as *const u64 as usize;
    note(format!("asleep at {:#x}", before));

    {
        let _guard = InterruptGuard::new();
        proc::current().sleep();
    }

    let after = &marker as *const u64 as usize;
    note(format!(
        "awake at {:#x} holding {:#x}, interrupts {}",
        after,
        std::hint::black_box(marker),
        interrupts::are_enabled()
    ));
}

#[test]
fn sleep_then_wake_resumes_with_same_stack_state() {
    let main = boot();
    let s = Thread::new("sleeper");
    s.fork(sleeper, 0);

    main.yield_cpu();
    assert_eq!(s.status(), ThreadStatus::Blocked);
    assert_eq!(proc::processor::ready_count(), 0);
    assert!(!s.has_overflowed());
    let saved_sp = s.saved_stack_pointer();

    // Nothing wakes it on its own.
    main.yield_cpu();
    assert_eq!(s.status(), ThreadStatus::Blocked);
    assert_eq!(s.saved_stack_pointer(), saved_sp);

    proc::ready_to_run(&s);
    assert_eq!(s.status(), ThreadStatus::Ready);
    main.yield_cpu();

    let log = events();
    assert_eq!(log.len(), 2);
    let addr = log[0].strip_prefix("asleep at ").unwrap();
    assert_eq!(
        log[1],
        format!("awake at {} holding 0xc0ffee, interrupts true", addr)
    );
    assert!(s.is_finished());
}

fn finisher(_: usize) {
    note("before finish");
    proc::current().finish();
}

#[test]
fn finish_never_returns_and_is_disposed_by_next_thread() {
    let main = boot();
    let f = Thread::new("finisher");
    f.fork(finisher, 0);
    let tid = f.tid();
    assert!(tid.is_some());

    main.yield_cpu();

    assert_eq!(events(), ["before finish"]);
    assert!(f.is_finished());
    assert_eq!(f.status(), ThreadStatus::Blocked);
    assert!(!f.has_stack());
    assert_eq!(f.tid(), None);
    assert_eq!(main.status(), ThreadStatus::Running);
}

fn just_returns(arg: usize) {
    note(arg.to_string());
}

#[test]
fn returning_from_entry_finishes_the_thread() {
    let main = boot();
    let threads: Vec<_> = (0..3)
        .map(|i| {
            let t = Thread::new("worker");
            t.fork(just_returns, i);
            t
        })
        .collect();

    main.yield_cpu();

    assert_eq!(events(), ["0", "1", "2"]);
    for t in &threads {
        assert!(t.is_finished());
        assert!(!t.has_stack());
    }
    assert_eq!(proc::processor::ready_count(), 0);
}

fn named(_: usize) {
    note(proc::current().name());
}

#[test]
fn priority_scheduler_runs_most_urgent_first() {
    EVENTS.with(|e| e.borrow_mut().clear());
    let main = proc::boot_with("main", Box::new(PriorityScheduler::new()));

    for (name, priority) in [("low", 9), ("high", 1), ("mid", 5)] {
        let t = Thread::new(name);
        t.set_priority(priority).unwrap();
        t.fork(named, 0);
    }

    main.yield_cpu();
    main.yield_cpu();

    assert_eq!(events(), ["high", "mid", "low"]);
}

#[test]
fn timer_tick_charges_and_preempts() {
    let main = boot();
    let t = Thread::new("ticked");
    t.fork(named, 0);

    proc::timer_tick();

    assert_eq!(main.used_time_slice(), 1);
    assert_eq!(events(), ["ticked"]);
}

thread_local! {
    static TO_WAKE: RefCell<Option<Arc<Thread>>> = const { RefCell::new(None) };
    static IDLE_CALLS: RefCell<usize> = const { RefCell::new(0) };
}

fn wake_pending() {
    IDLE_CALLS.with(|c| *c.borrow_mut() += 1);
    if let Some(thread) = TO_WAKE.with(|w| w.borrow_mut().take()) {
        proc::ready_to_run(&thread);
    }
}

#[test]
fn idle_handler_can_wake_the_sleeper_itself() {
    let main = boot();
    IDLE_CALLS.with(|c| *c.borrow_mut() = 0);
    TO_WAKE.with(|w| *w.borrow_mut() = Some(main.clone()));
    proc::set_idle_handler(wake_pending);

    {
        let _guard = InterruptGuard::new();
        main.sleep();
    }

    assert_eq!(IDLE_CALLS.with(|c| *c.borrow()), 1);
    assert_eq!(main.status(), ThreadStatus::Running);
    assert!(interrupts::are_enabled());
}

struct RecordingSpace {
    saves: AtomicUsize,
    restores: AtomicUsize,
    last_restored: AtomicU64,
}

impl AddressSpace for RecordingSpace {
    fn save_state(&self) {
        self.saves.fetch_add(1, Ordering::SeqCst);
    }

    fn restore_state(&self) {
        self.restores.fetch_add(1, Ordering::SeqCst);
    }

    fn save_user_registers(&self, regs: &mut UserRegisters) {
        regs[0] += 1;
    }

    fn restore_user_registers(&self, regs: &UserRegisters) {
        self.last_restored.store(regs[0], Ordering::SeqCst);
    }
}

static SPACE: RecordingSpace = RecordingSpace {
    saves: AtomicUsize::new(0),
    restores: AtomicUsize::new(0),
    last_restored: AtomicU64::new(0),
};

fn user_program(_: usize) {
    proc::current().yield_cpu();
}

#[test]
fn user_state_is_saved_and_restored_around_switches() {
    let main = boot();
    let u = Thread::new("user");
    u.attach_space(&SPACE);
    u.fork(user_program, 0);

    main.yield_cpu(); // u runs, yields back: one save
    assert_eq!(SPACE.saves.load(Ordering::SeqCst), 1);
    assert_eq!(SPACE.restores.load(Ordering::SeqCst), 0);

    main.yield_cpu(); // u resumes (restore), returns, finishes (save)
    assert_eq!(SPACE.saves.load(Ordering::SeqCst), 2);
    assert_eq!(SPACE.restores.load(Ordering::SeqCst), 1);
    assert_eq!(SPACE.last_restored.load(Ordering::SeqCst), 1);
    assert_eq!(u.user_register(0), Some(2));
    assert!(u.is_finished());
}

#[test]
fn self_test_interleaves_two_threads() {
    boot();

    let trace = proc::selftest::run();

    let expected: Vec<(usize, usize)> = (0..5).flat_map(|i| [(0, i), (1, i)]).collect();
    assert_eq!(trace, expected);
}

#[test]
fn booting_again_starts_from_a_clean_processor() {
    let first = boot();
    let stale = Thread::new("stale");
    stale.fork(named, 0);

    let second = proc::boot("main again");

    assert_eq!(first.status(), ThreadStatus::Blocked);
    assert_eq!(second.status(), ThreadStatus::Running);
    assert_eq!(proc::processor::ready_count(), 0);
    second.yield_cpu();
    assert!(events().is_empty());
}

// What the IRQ0 handler does once its end-of-interrupt is out.
fn timer_interrupt() {
    if proc::is_booted() {
        proc::timer_tick();
    }
}

#[test]
fn timer_ticks_before_boot_are_ignored() {
    std::thread::spawn(|| {
        assert!(!proc::is_booted());
        timer_interrupt();

        let main = proc::boot("main");
        assert!(proc::is_booted());
        timer_interrupt();
        assert_eq!(main.used_time_slice(), 1);
        assert_eq!(main.status(), ThreadStatus::Running);
    })
    .join()
    .unwrap();
}
