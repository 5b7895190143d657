//! Boundary to the memory-management subsystem, for threads that run user programs.
//!
//! Such a thread carries two register files: the kernel-mode one in its switch [`Context`] and a
//! user-mode one here. The address space itself is owned elsewhere; a thread only borrows it.
//!
//! [`Context`]: crate::arch::switch::Context

use derivative::Derivative;

use crate::config::NUM_TOTAL_REGS;

pub type UserRegisters = [u64; NUM_TOTAL_REGS];

/// Implemented by the memory-management subsystem.
pub trait AddressSpace: Sync {
    /// Called before a thread using this space is switched off the CPU.
    fn save_state(&self);

    /// Called once a thread using this space is back on the CPU.
    fn restore_state(&self);

    /// Copy the machine's user-mode registers into `regs`.
    fn save_user_registers(&self, regs: &mut UserRegisters);

    /// Load `regs` back into the machine's user-mode registers.
    fn restore_user_registers(&self, regs: &UserRegisters);
}

#[derive(Derivative, Clone, Copy)]
#[derivative(Debug)]
pub struct UserContext {
    pub registers: UserRegisters,
    #[derivative(Debug = "ignore")]
    pub space: &'static dyn AddressSpace,
}

impl UserContext {
    pub fn new(space: &'static dyn AddressSpace) -> Self {
        Self {
            registers: [0; NUM_TOTAL_REGS],
            space,
        }
    }

    /// Everything needed before the owning thread leaves the CPU.
    pub fn save(&mut self) {
        self.space.save_user_registers(&mut self.registers);
        self.space.save_state();
    }

    /// Everything needed once the owning thread is back on the CPU.
    pub fn restore(&self) {
        self.space.restore_user_registers(&self.registers);
        self.space.restore_state();
    }
}
