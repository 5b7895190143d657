//! Threads: control blocks, their stacks, and the switching core every scheduler and
//! synchronization primitive sits on top of.

pub mod manager;
pub mod processor;
pub mod scheduler;
pub mod selftest;
pub mod space;
pub mod stack;
pub mod status;
pub mod thread;

use core::fmt;

pub use processor::{
    boot, boot_with, current, is_booted, is_current, ready_to_run, set_idle_handler, timer_tick,
};
pub use scheduler::{FifoScheduler, PriorityScheduler, Scheduler};
pub use space::{AddressSpace, UserRegisters};
pub use status::ThreadStatus;
pub use thread::Thread;

/// Failures a caller is expected to handle. Contract violations panic instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadError {
    /// Priority outside `MIN_PRIORITY..=MAX_PRIORITY`.
    InvalidPriority(i32),
    /// Raw status byte that names none of the four states.
    UndefinedStatus(u8),
}

impl fmt::Display for ThreadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadError::InvalidPriority(p) => write!(
                f,
                "priority {} outside {}..={}",
                p,
                crate::config::MIN_PRIORITY,
                crate::config::MAX_PRIORITY
            ),
            ThreadError::UndefinedStatus(raw) => write!(f, "undefined thread status {}", raw),
        }
    }
}

impl core::error::Error for ThreadError {}
