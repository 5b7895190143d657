//! 8254 Programmable Interval Timer, channel 0. Its output is wired to IRQ0, which drives
//! preemption through [`crate::proc::timer_tick`].

use super::outb;
use crate::config::TIMER_HZ;

const PIT_CHANNEL0: u16 = 0x40;
const PIT_CMD: u16 = 0x43;
/// Base oscillator frequency of the 8254 in Hz.
const PIT_FREQUENCY: u32 = 1_193_182;

const DIVISOR: u32 = PIT_FREQUENCY / TIMER_HZ;
const _: () = assert!(DIVISOR > 0 && DIVISOR <= u16::MAX as u32, "TIMER_HZ out of PIT range");

pub fn init() {
    // Channel 0, lobyte/hibyte, mode 3 (square wave), binary
    outb(PIT_CMD, 0x36);
    outb(PIT_CHANNEL0, (DIVISOR & 0xFF) as u8);
    outb(PIT_CHANNEL0, ((DIVISOR >> 8) & 0xFF) as u8);

    log::debug!("PIT channel 0 at {} Hz (divisor {})", TIMER_HZ, DIVISOR);
}
