//! Register-level context switching.
//!
//! A thread's switch state is kept in [`Context`], a `#[repr(C)]` block whose first field is the
//! saved stack pointer followed by a fixed array of register slots. [`thread_switch`] is the only
//! code that reads or writes it while the thread is off the CPU; the rest of the thread control
//! block never has to care about layout.
//!
//! Only the System V callee-saved registers are kept. Everything else is, by the calling
//! convention, already dead or spilled by the caller of `thread_switch`.

use crate::config::MACHINE_STATE_SIZE;
use core::arch::naked_asm;
use core::mem::offset_of;

/// Indices into [`Context::machine_state`].
pub mod slot {
    pub const RBX: usize = 0;
    pub const RBP: usize = 1;
    pub const R12: usize = 2;
    pub const R13: usize = 3;
    pub const R14: usize = 4;
    pub const R15: usize = 5;
    pub const PC: usize = 6;

    // The trampoline picks its work out of callee-saved registers.
    pub const INITIAL_PC: usize = R12;
    pub const INITIAL_ARG: usize = R13;
    pub const STARTUP_PC: usize = R14;
    pub const WHEN_DONE_PC: usize = R15;
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Context {
    /// Must stay first: `thread_switch` addresses it at offset 0.
    pub stack_top: u64,
    pub machine_state: [u64; MACHINE_STATE_SIZE],
}

const SP_OFFSET: usize = offset_of!(Context, stack_top);
const REGS_OFFSET: usize = offset_of!(Context, machine_state);

const fn reg(index: usize) -> usize {
    REGS_OFFSET + index * core::mem::size_of::<u64>()
}

impl Context {
    pub const fn empty() -> Self {
        Self {
            stack_top: 0,
            machine_state: [0; MACHINE_STATE_SIZE],
        }
    }

    /// Lay out the register image a never-run thread is switched into. Execution starts in
    /// [`thread_root`] on `stack_top`, which must be 16-byte aligned.
    pub fn prime(
        &mut self,
        stack_top: u64,
        entry: fn(usize),
        arg: usize,
        startup: extern "C" fn(),
        when_done: extern "C" fn() -> !,
    ) {
        debug_assert_eq!(stack_top % 16, 0, "initial stack pointer must be 16-byte aligned");

        *self = Self::empty();
        self.stack_top = stack_top;
        self.machine_state[slot::PC] = thread_root as usize as u64;
        self.machine_state[slot::INITIAL_PC] = entry as usize as u64;
        self.machine_state[slot::INITIAL_ARG] = arg as u64;
        self.machine_state[slot::STARTUP_PC] = startup as usize as u64;
        self.machine_state[slot::WHEN_DONE_PC] = when_done as usize as u64;
        // rbp = 0 terminates frame-pointer walks at the trampoline.
        self.machine_state[slot::RBP] = 0;
    }

    pub fn pc(&self) -> u64 {
        self.machine_state[slot::PC]
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::empty()
    }
}

/// Stop running on `old`'s state and resume `new`.
///
/// The return address is popped into `old`'s PC slot so that the stored stack pointer is the one
/// the caller will see after the call returns. Resuming is a jump to the stored PC with the stored
/// stack pointer, which is indistinguishable from `ret` for a thread that switched away earlier,
/// and lands in [`thread_root`] for one that never ran.
///
/// # Safety
/// - Interrupts must be disabled for the whole switch.
/// - `old` must be valid for writes and `new` for reads, and `new` must hold either a state saved
///   by an earlier `thread_switch` or one set up by [`Context::prime`].
/// - The stack `new` refers to must stay allocated until that thread switches away again.
#[unsafe(naked)]
pub unsafe extern "C" fn thread_switch(old: *mut Context, new: *const Context) {
    naked_asm!(
        "pop rax",
        "mov [rdi + {pc}], rax",
        "mov [rdi + {sp}], rsp",
        "mov [rdi + {rbx}], rbx",
        "mov [rdi + {rbp}], rbp",
        "mov [rdi + {r12}], r12",
        "mov [rdi + {r13}], r13",
        "mov [rdi + {r14}], r14",
        "mov [rdi + {r15}], r15",
        "mov rbx, [rsi + {rbx}]",
        "mov rbp, [rsi + {rbp}]",
        "mov r12, [rsi + {r12}]",
        "mov r13, [rsi + {r13}]",
        "mov r14, [rsi + {r14}]",
        "mov r15, [rsi + {r15}]",
        "mov rsp, [rsi + {sp}]",
        "jmp qword ptr [rsi + {pc}]",
        sp = const SP_OFFSET,
        pc = const reg(slot::PC),
        rbx = const reg(slot::RBX),
        rbp = const reg(slot::RBP),
        r12 = const reg(slot::R12),
        r13 = const reg(slot::R13),
        r14 = const reg(slot::R14),
        r15 = const reg(slot::R15),
    );
}

/// First frame of every forked thread:
///   call the startup hook (r14)
///   call the thread's function (r12) with its argument (r13)
///   call the when-done hook (r15), which never comes back
#[unsafe(naked)]
unsafe extern "C" fn thread_root() -> ! {
    naked_asm!(
        "call r14",
        "mov rdi, r12",
        "mov rsi, r13",
        "call {invoke}",
        "call r15",
        "ud2",
        invoke = sym invoke_entry,
    );
}

extern "C" fn invoke_entry(entry: usize, arg: usize) {
    // Round-trips the `fn(usize)` that `Context::prime` stored as an integer.
    let entry: fn(usize) = unsafe { core::mem::transmute::<usize, fn(usize)>(entry) };
    entry(arg);
}
