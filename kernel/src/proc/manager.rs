use core::fmt;

use spin::Mutex;

use crate::arch::interrupts::InterruptGuard;
use crate::config::MAX_THREADS;

pub type RawTid = u64;

/// Thread ids live in a bitmap, one bit per id. Id 0 is the first thread booted.
pub struct Manager {
    tid_bitmap: [u64; MAX_THREADS / 64],
    live: usize,
}

impl Manager {
    pub const fn new() -> Self {
        Self {
            tid_bitmap: [0; MAX_THREADS / 64],
            live: 0,
        }
    }

    pub fn alloc(&mut self) -> Option<RawTid> {
        for (i, bitmap) in self.tid_bitmap.iter_mut().enumerate() {
            if *bitmap == u64::MAX {
                continue;
            }

            let j = bitmap.trailing_ones() as usize;
            *bitmap |= 1 << j;
            self.live += 1;

            return Some((i * 64 + j) as RawTid);
        }

        None
    }

    pub fn free(&mut self, tid: RawTid) {
        let (word, bit) = (tid as usize / 64, tid as usize % 64);
        assert!(
            self.tid_bitmap[word] & (1 << bit) != 0,
            "tid {} has already been released",
            tid
        );

        self.tid_bitmap[word] &= !(1 << bit);
        self.live -= 1;
    }

    pub fn live(&self) -> usize {
        self.live
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

static MANAGER: Mutex<Manager> = Mutex::new(Manager::new());

// Disposal frees tids on the timer path, so the bitmap is only touched with interrupts masked.
fn with_manager<R>(f: impl FnOnce(&mut Manager) -> R) -> R {
    let _guard = InterruptGuard::new();
    f(&mut MANAGER.lock())
}

/// Kernel-assigned thread id. Returned to the pool when dropped.
#[derive(PartialEq, Eq)]
pub struct Tid(RawTid);

impl Tid {
    pub fn alloc() -> Self {
        let raw = with_manager(Manager::alloc);
        match raw {
            Some(raw) => {
                log::trace!("Allocated tid {}", raw);
                Tid(raw)
            }
            None => panic!("No more TIDs available ({} threads live)", MAX_THREADS),
        }
    }

    pub fn raw(&self) -> RawTid {
        self.0
    }
}

impl Drop for Tid {
    fn drop(&mut self) {
        with_manager(|manager| manager.free(self.0));
    }
}

impl fmt::Debug for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tid({})", self.0)
    }
}

/// Number of thread ids currently handed out, across every processor.
pub fn live_threads() -> usize {
    with_manager(|manager| manager.live())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hands_out_lowest_free_id() {
        let mut manager = Manager::new();
        assert_eq!(manager.alloc(), Some(0));
        assert_eq!(manager.alloc(), Some(1));
        assert_eq!(manager.alloc(), Some(2));

        manager.free(1);
        assert_eq!(manager.alloc(), Some(1));
        assert_eq!(manager.live(), 3);
    }

    #[test]
    fn crosses_word_boundaries_and_runs_out() {
        let mut manager = Manager::new();
        for expected in 0..MAX_THREADS as RawTid {
            assert_eq!(manager.alloc(), Some(expected));
        }
        assert_eq!(manager.alloc(), None);

        manager.free(64);
        assert_eq!(manager.alloc(), Some(64));
    }

    #[test]
    fn bitmap_is_only_touched_with_interrupts_masked() {
        use crate::arch::interrupts;

        interrupts::enable();
        assert!(!with_manager(|_| interrupts::are_enabled()));
        assert!(interrupts::are_enabled());

        let tid = Tid::alloc();
        drop(tid);
        assert!(interrupts::are_enabled());
    }

    #[test]
    #[should_panic(expected = "already been released")]
    fn double_free_is_fatal() {
        let mut manager = Manager::new();
        let tid = manager.alloc().unwrap();
        manager.free(tid);
        manager.free(tid);
    }
}
