#![no_std]
#![cfg_attr(target_os = "none", no_main)]

extern crate alloc;

// Hosted builds (the test suite) run the same core on top of the host OS.
#[cfg(not(target_os = "none"))]
extern crate std;

pub mod arch;
pub mod config;
pub mod logging;
pub mod mem;
pub mod proc;

pub use proc::{Thread, ThreadError, ThreadStatus};

/// Entry point the boot stub jumps to once long mode is up.
#[cfg(target_os = "none")]
#[unsafe(no_mangle)]
pub extern "C" fn _start64(_multiboot_info: u64) -> ! {
    arch::serial::init();

    if logging::init(config::LOG_LEVEL).is_err() {
        crate::kprintln!("Logger was already installed");
    }

    mem::heap::init();
    let (free, used) = mem::heap::heap_stats();
    log::info!("Heap ready: {} KiB free, {} KiB used", free / 1024, used / 1024);

    arch::init();

    let main = proc::boot("main");
    log::info!("Booted thread \"{}\" (tid {:?})", main, main.tid());

    let trace = proc::selftest::run();
    log::info!("Self test ran {} slices", trace.len());

    arch::interrupts::disable();
    loop {
        arch::halt();
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    arch::interrupts::disable();
    log::error!("Kernel panic: {}", info);
    log::error!("System halted.");
    loop {
        arch::halt();
    }
}
