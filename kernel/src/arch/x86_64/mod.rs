#[cfg(target_os = "none")]
pub mod idt;
pub mod interrupts;
#[cfg(target_os = "none")]
pub mod pit;
pub mod serial;
pub mod switch;

pub use interrupts::{IntStatus, InterruptGuard};

/// Install interrupt handlers and start the timer. Interrupts themselves stay off until the
/// processor boots.
#[cfg(target_os = "none")]
pub fn init() {
    idt::init();
    pit::init();

    log::info!("Architecture initialized");
}

/// Stop the CPU until the next interrupt arrives.
#[cfg(target_os = "none")]
#[inline]
pub fn halt() {
    unsafe {
        core::arch::asm!("hlt", options(nomem, nostack));
    }
}

/// Hosted builds have no `hlt`; give the host scheduler the time slice instead.
#[cfg(not(target_os = "none"))]
#[inline]
pub fn halt() {
    std::thread::yield_now();
}

/// Read from port
#[cfg(target_os = "none")]
#[inline]
pub fn inb(port: u16) -> u8 {
    let value: u8;
    unsafe {
        core::arch::asm!(
            "in al, dx",
            out("al") value,
            in("dx") port,
            options(nomem, nostack)
        );
    }
    value
}

/// Write to port
#[cfg(target_os = "none")]
#[inline]
pub fn outb(port: u16, value: u8) {
    unsafe {
        core::arch::asm!(
            "out dx, al",
            in("dx") port,
            in("al") value,
            options(nomem, nostack)
        );
    }
}
