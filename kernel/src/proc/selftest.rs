//! Boot-time smoke test: two threads taking turns on the CPU.

use alloc::vec::Vec;
use spin::Mutex;

use super::processor;
use super::thread::Thread;

const LOOPS: usize = 5;

static TRACE: Mutex<Vec<(usize, usize)>> = Mutex::new(Vec::new());

fn simple_thread(which: usize) {
    for num in 0..LOOPS {
        crate::kprintln!("*** thread {} looped {} times", which, num);
        TRACE.lock().push((which, num));
        processor::current().yield_cpu();
    }
}

/// Fork a worker and ping-pong with it until it finishes. Returns `(thread, iteration)` pairs in
/// the order they ran. Must be called on a booted processor with nothing else ready.
pub fn run() -> Vec<(usize, usize)> {
    TRACE.lock().clear();

    let worker = Thread::new("forked thread");
    worker.fork(simple_thread, 1);

    simple_thread(0);
    while !worker.is_finished() {
        processor::current().yield_cpu();
    }

    log::info!("Self test done, worker stack released: {}", !worker.has_stack());
    core::mem::take(&mut *TRACE.lock())
}
