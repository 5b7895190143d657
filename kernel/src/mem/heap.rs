//! Kernel heap for bare-metal builds. Thread stacks and control blocks come from here.
//!
//! Hosted builds use the host allocator instead, so none of this is compiled there.

use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};
use linked_list_allocator::LockedHeap;

use crate::arch::interrupts::InterruptGuard;
use crate::config::STACK_SIZE;

// Room for a few dozen live stacks plus their control blocks.
const HEAP_SIZE: usize = 64 * STACK_SIZE * core::mem::size_of::<u64>();

#[repr(C, align(4096))]
struct Arena(UnsafeCell<[u8; HEAP_SIZE]>);

// Handed to the allocator exactly once, in `init`.
unsafe impl Sync for Arena {}

static ARENA: Arena = Arena(UnsafeCell::new([0; HEAP_SIZE]));

struct KernelHeap {
    inner: LockedHeap,
    ready: AtomicBool,
}

impl KernelHeap {
    const fn new() -> Self {
        Self {
            inner: LockedHeap::empty(),
            ready: AtomicBool::new(false),
        }
    }

    fn init(&self) {
        if self.ready.swap(true, Ordering::SeqCst) {
            log::warn!("Heap already initialized");
            return;
        }

        unsafe {
            self.inner.lock().init(ARENA.0.get().cast::<u8>(), HEAP_SIZE);
        }

        log::trace!(
            "Heap initialized at {:#x}, size {} KiB",
            ARENA.0.get() as usize,
            HEAP_SIZE / 1024,
        );
    }
}

// The timer path allocates when it grows the ready queue, so the heap lock is only ever held
// with interrupts masked.
unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let _guard = InterruptGuard::new();
        self.inner
            .lock()
            .allocate_first_fit(layout)
            .ok()
            .map_or(core::ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let _guard = InterruptGuard::new();
        unsafe {
            self.inner
                .lock()
                .deallocate(NonNull::new_unchecked(ptr), layout);
        }
    }
}

#[global_allocator]
static ALLOCATOR: KernelHeap = KernelHeap::new();

pub fn init() {
    ALLOCATOR.init();
}

/// Get heap statistics: (free, used)
pub fn heap_stats() -> (usize, usize) {
    let _guard = InterruptGuard::new();
    let inner = ALLOCATOR.inner.lock();
    (inner.free(), inner.used())
}
