//! Console sink for the logger and `kprint!`.
//!
//! Bare metal drives the first 16550 UART (COM1). Hosted builds stand in for the wire with the
//! process's standard error so test output interleaves with the harness.

use core::fmt::Write;
use spin::Mutex;

const COM1: u16 = 0x3F8;

pub static SERIAL: Mutex<Serial> = Mutex::new(Serial::new(COM1));

pub fn init() {
    SERIAL.lock().init();
}

pub struct Serial {
    port: u16,
}

#[cfg(target_os = "none")]
mod uart {
    use super::Serial;
    use crate::arch::x86_64::{inb, outb};

    const SERIAL_TEST_BYTE: u8 = 0xAE;

    const SERIAL_DATA_OFFSET: u16 = 0;
    const SERIAL_INTERRUPT_ENABLE_OFFSET: u16 = 1;
    const SERIAL_FCR_OFFSET: u16 = 2;
    const SERIAL_LCR_OFFSET: u16 = 3;
    const SERIAL_MCR_OFFSET: u16 = 4;
    const SERIAL_LSR_OFFSET: u16 = 5;

    // With DLAB set, offsets 0 and 1 address the baud rate divisor instead of data/IER.
    const SERIAL_LCR_DLAB: u8 = 0x80;
    const SERIAL_LCR_8N1: u8 = 0x03;
    const SERIAL_FCR_FIFO_14B_THRESHOLD: u8 = 0xC7;
    const SERIAL_LOOPBACK_ENABLE: u8 = 0x1E;
    const SERIAL_LOOPBACK_DISABLE: u8 = 0x0F;
    const SERIAL_LSR_TRANSMIT_EMPTY: u8 = 0x20;

    impl Serial {
        /// 115200 baud, 8N1, FIFOs on, UART interrupts off. Panics if the loopback self-test
        /// does not read back the byte it wrote.
        pub fn init(&self) {
            outb(self.port + SERIAL_INTERRUPT_ENABLE_OFFSET, 0x00);

            outb(self.port + SERIAL_LCR_OFFSET, SERIAL_LCR_DLAB);
            outb(self.port + SERIAL_DATA_OFFSET, 0x01);
            outb(self.port + SERIAL_INTERRUPT_ENABLE_OFFSET, 0x00);
            outb(self.port + SERIAL_LCR_OFFSET, SERIAL_LCR_8N1);

            outb(self.port + SERIAL_FCR_OFFSET, SERIAL_FCR_FIFO_14B_THRESHOLD);

            outb(self.port + SERIAL_MCR_OFFSET, SERIAL_LOOPBACK_ENABLE);
            outb(self.port + SERIAL_DATA_OFFSET, SERIAL_TEST_BYTE);

            let echoed = inb(self.port + SERIAL_DATA_OFFSET);
            if echoed != SERIAL_TEST_BYTE {
                panic!(
                    "Serial port self-test failed: expected 0x{:02X}, got 0x{:02X}",
                    SERIAL_TEST_BYTE, echoed
                );
            }

            outb(self.port + SERIAL_MCR_OFFSET, SERIAL_LOOPBACK_DISABLE);
        }

        pub fn write_byte(&self, byte: u8) {
            while inb(self.port + SERIAL_LSR_OFFSET) & SERIAL_LSR_TRANSMIT_EMPTY == 0 {}

            outb(self.port + SERIAL_DATA_OFFSET, byte);
        }
    }
}

#[cfg(not(target_os = "none"))]
mod uart {
    use super::Serial;
    use std::io::Write;

    impl Serial {
        pub fn init(&self) {}

        pub fn write_byte(&self, byte: u8) {
            // Nowhere better to report a failed diagnostic write.
            let _ = std::io::stderr().write_all(&[byte]);
        }
    }
}

impl Serial {
    pub const fn new(port: u16) -> Self {
        Serial { port }
    }

    pub fn write_string(&self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' && cfg!(target_os = "none") {
                self.write_byte(b'\r');
            }

            self.write_byte(byte);
        }
    }
}

impl Write for Serial {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.write_string(s);
        Ok(())
    }
}

impl core::fmt::Debug for Serial {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Serial")
            .field("port", &format_args!("0x{:04X}", self.port))
            .finish()
    }
}
