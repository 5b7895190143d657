//! Interrupt level control.
//!
//! Every thread-state transition that touches the ready queue or the current-thread record has to
//! run with interrupts off, otherwise a timer tick landing in the middle could enqueue a thread
//! twice or switch away with half-written state. On bare metal the level is the IF bit in RFLAGS.
//! Hosted builds cannot execute `cli`/`sti`, so they keep an emulated RFLAGS per host thread and
//! treat each host thread as its own uniprocessor.

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RFlags: u64 {
        const CARRY = 1 << 0;
        const RESERVED_1 = 1 << 1;
        const ZERO = 1 << 6;
        const SIGN = 1 << 7;
        const TRAP = 1 << 8;
        const INTERRUPT_ENABLE = 1 << 9;
        const DIRECTION = 1 << 10;
        const OVERFLOW = 1 << 11;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntStatus {
    Off,
    On,
}

impl From<RFlags> for IntStatus {
    fn from(flags: RFlags) -> Self {
        if flags.contains(RFlags::INTERRUPT_ENABLE) {
            IntStatus::On
        } else {
            IntStatus::Off
        }
    }
}

#[cfg(target_os = "none")]
mod backend {
    use super::RFlags;

    #[inline]
    pub fn read_rflags() -> RFlags {
        let value: u64;
        unsafe {
            core::arch::asm!("pushfq", "pop {}", out(reg) value, options(nomem, preserves_flags));
        }
        RFlags::from_bits_retain(value)
    }

    #[inline]
    pub fn cli() {
        unsafe {
            core::arch::asm!("cli", options(nomem, nostack));
        }
    }

    #[inline]
    pub fn sti() {
        unsafe {
            core::arch::asm!("sti", options(nomem, nostack));
        }
    }
}

#[cfg(not(target_os = "none"))]
mod backend {
    use super::RFlags;
    use core::cell::Cell;

    std::thread_local! {
        // Reset state of a real CPU: reserved bit 1 set, interrupts masked.
        static RFLAGS: Cell<RFlags> = const { Cell::new(RFlags::RESERVED_1) };
    }

    pub fn read_rflags() -> RFlags {
        RFLAGS.with(|flags| flags.get())
    }

    pub fn cli() {
        RFLAGS.with(|flags| flags.set(flags.get() - RFlags::INTERRUPT_ENABLE));
    }

    pub fn sti() {
        RFLAGS.with(|flags| flags.set(flags.get() | RFlags::INTERRUPT_ENABLE));
    }
}

pub use backend::read_rflags;

pub fn level() -> IntStatus {
    IntStatus::from(read_rflags())
}

pub fn are_enabled() -> bool {
    level() == IntStatus::On
}

pub fn enable() {
    backend::sti();
}

pub fn disable() {
    backend::cli();
}

/// Switch to `new` and hand back whatever level was in force before.
pub fn set_level(new: IntStatus) -> IntStatus {
    let old = level();
    match new {
        IntStatus::On => enable(),
        IntStatus::Off => disable(),
    }
    old
}

/// Masks interrupts for as long as it lives, then puts back the level it found.
///
/// A guard held across a context switch restores the level only once the owning thread is switched
/// back in, which is exactly what `yield_cpu` relies on.
#[must_use = "interrupts are re-enabled as soon as the guard is dropped"]
pub struct InterruptGuard {
    previous: IntStatus,
}

impl InterruptGuard {
    pub fn new() -> Self {
        Self {
            previous: set_level(IntStatus::Off),
        }
    }

    pub fn previous(&self) -> IntStatus {
        self.previous
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        set_level(self.previous);
    }
}
