//! Kernel-wide tunables. Everything here is fixed at compile time.

use log::LevelFilter;

/// Size of a thread's private execution stack, in machine words.
/// Deep recursion or large locals will run straight through the guard word, so keep frames small.
pub const STACK_SIZE: usize = 4 * 1024;

/// Register slots saved in a thread control block across a context switch.
/// Wide enough for the largest register file any supported port needs.
pub const MACHINE_STATE_SIZE: usize = 18;

/// Width of the user-mode register file kept for threads that run user programs.
pub const NUM_TOTAL_REGS: usize = 40;

/// Written at the lowest word of every private stack and checked on each switch.
pub const STACK_FENCEPOST: u64 = 0xdedbeef;

/// 1 is the most urgent priority, 10 the least.
pub const MIN_PRIORITY: i32 = 1;
pub const MAX_PRIORITY: i32 = 10;
pub const DEFAULT_PRIORITY: i32 = 5;

/// Upper bound on live thread ids.
pub const MAX_THREADS: usize = 1024;

#[cfg(feature = "debug_verbose")]
pub const LOG_LEVEL: LevelFilter = LevelFilter::Trace;

#[cfg(not(feature = "debug_verbose"))]
pub const LOG_LEVEL: LevelFilter = LevelFilter::Info;

/// Timer interrupts per second. Every tick charges the running thread and offers the CPU to the
/// next ready one.
pub const TIMER_HZ: u32 = 100;
