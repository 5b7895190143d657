//! The IDT is the Interrupt Descriptor Table
//! It tells the CPU where to jump for each of the 256 vectors. The kernel installs handlers for
//! the CPU exceptions, which report and halt, and for the timer IRQ, which preempts the running
//! thread. Every other PIC line stays masked.

use core::mem::size_of;

use spin::Once;

use super::{inb, interrupts, outb};
use crate::proc;

const PIC1_CMD: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_CMD: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;

/// First vector used by the remapped master PIC; the slave follows 8 vectors later.
pub const PIC1_OFFSET: u8 = 0x20;
pub const PIC2_OFFSET: u8 = PIC1_OFFSET + 8;

const PIC_EOI: u8 = 0x20;
const PIC_READ_ISR: u8 = 0x0B;

/// IDT entry type
/// An interrupt gate clears IF on entry, a trap gate leaves it alone.
#[derive(Clone, Copy)]
#[repr(u8)]
pub enum GateType {
    Interrupt = 0xE,
    Trap = 0xF,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct IdtEntry {
    offset_low: u16,
    selector: u16,
    ist: u8,
    type_attr: u8,
    offset_mid: u16,
    offset_high: u32,
    reserved: u32,
}

impl IdtEntry {
    const fn null() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            ist: 0,
            type_attr: 0,
            offset_mid: 0,
            offset_high: 0,
            reserved: 0,
        }
    }

    fn new(handler: u64, selector: u16, gate_type: GateType) -> Self {
        Self {
            offset_low: (handler & 0xFFFF) as u16,
            selector,
            ist: 0,
            type_attr: (1 << 7) | (gate_type as u8),
            offset_mid: ((handler >> 16) & 0xFFFF) as u16,
            offset_high: ((handler >> 32) & 0xFFFFFFFF) as u32,
            reserved: 0,
        }
    }
}

#[repr(C, packed)]
struct IdtDescriptor {
    size: u16,
    offset: u64,
}

#[repr(C, align(16))]
struct Idt {
    entries: [IdtEntry; 256],
}

static IDT: Once<Idt> = Once::new();

/// Saved register state and CPU-pushed frame for exceptions without an error code.
/// Layout reflects the stack after push_regs!() fires:
///   r15..rax  (pushed by push_regs, low → high address)
///   rip / cs / rflags / rsp / ss  (pushed by CPU)
#[repr(C)]
struct InterruptFrame {
    r15: u64,
    r14: u64,
    r13: u64,
    r12: u64,
    r11: u64,
    r10: u64,
    r9: u64,
    r8: u64,
    rbp: u64,
    rdi: u64,
    rsi: u64,
    rdx: u64,
    rcx: u64,
    rbx: u64,
    rax: u64,
    // CPU-pushed
    rip: u64,
    cs: u64,
    rflags: u64,
    rsp: u64,
    ss: u64,
}

/// Same as `InterruptFrame` but with an error code between the saved regs and the CPU frame.
#[repr(C)]
struct InterruptFrameWithError {
    r15: u64,
    r14: u64,
    r13: u64,
    r12: u64,
    r11: u64,
    r10: u64,
    r9: u64,
    r8: u64,
    rbp: u64,
    rdi: u64,
    rsi: u64,
    rdx: u64,
    rcx: u64,
    rbx: u64,
    rax: u64,
    // CPU-pushed
    error_code: u64,
    rip: u64,
    cs: u64,
    rflags: u64,
    rsp: u64,
    ss: u64,
}

macro_rules! push_regs {
    () => {
        "push rax; push rbx; push rcx; push rdx;
         push rsi; push rdi; push rbp;
         push r8; push r9; push r10; push r11;
         push r12; push r13; push r14; push r15;"
    };
}

macro_rules! pop_regs {
    () => {
        "pop r15; pop r14; pop r13; pop r12;
         pop r11; pop r10; pop r9; pop r8;
         pop rbp; pop rdi; pop rsi;
         pop rdx; pop rcx; pop rbx; pop rax;"
    };
}

fn halt() -> ! {
    log::error!("System halted.");
    interrupts::disable();
    loop {
        super::halt();
    }
}

fn report_thread() {
    if proc::is_booted() {
        log::error!("  in thread \"{}\"", proc::current());
    }
}

macro_rules! exception_no_error {
    ($name:ident, $msg:expr) => {
        paste::paste! {
            extern "C" fn [<$name _inner>](frame: *const InterruptFrame) -> ! {
                let f = unsafe { &*frame };
                log::error!(
                    concat!("Exception: ", $msg, "\n",
                            "  RIP={:#018x}  CS={:#06x}  RFLAGS={:#018x}\n",
                            "  RSP={:#018x}  SS={:#06x}\n",
                            "  RAX={:#018x}  RBX={:#018x}  RCX={:#018x}  RDX={:#018x}\n",
                            "  RSI={:#018x}  RDI={:#018x}  RBP={:#018x}\n",
                            "  R8 ={:#018x}  R9 ={:#018x}  R10={:#018x}  R11={:#018x}\n",
                            "  R12={:#018x}  R13={:#018x}  R14={:#018x}  R15={:#018x}"),
                    f.rip, f.cs, f.rflags,
                    f.rsp, f.ss,
                    f.rax, f.rbx, f.rcx, f.rdx,
                    f.rsi, f.rdi, f.rbp,
                    f.r8, f.r9, f.r10, f.r11,
                    f.r12, f.r13, f.r14, f.r15,
                );
                report_thread();
                halt();
            }

            #[unsafe(naked)]
            extern "C" fn $name() {
                core::arch::naked_asm!(
                    push_regs!(),
                    "mov rdi, rsp",
                    "call {inner}",
                    pop_regs!(),
                    "iretq",
                    inner = sym [<$name _inner>],
                );
            }
        }
    };
}

macro_rules! exception_with_error {
    ($name:ident, $msg:expr) => {
        paste::paste! {
            extern "C" fn [<$name _inner>](frame: *const InterruptFrameWithError) -> ! {
                let f = unsafe { &*frame };
                log::error!(
                    concat!("Exception: ", $msg, "\n",
                            "  Error Code : {:#018x}\n",
                            "  RIP={:#018x}  CS={:#06x}  RFLAGS={:#018x}\n",
                            "  RSP={:#018x}  SS={:#06x}\n",
                            "  RAX={:#018x}  RBX={:#018x}  RCX={:#018x}  RDX={:#018x}\n",
                            "  RSI={:#018x}  RDI={:#018x}  RBP={:#018x}\n",
                            "  R8 ={:#018x}  R9 ={:#018x}  R10={:#018x}  R11={:#018x}\n",
                            "  R12={:#018x}  R13={:#018x}  R14={:#018x}  R15={:#018x}"),
                    f.error_code,
                    f.rip, f.cs, f.rflags,
                    f.rsp, f.ss,
                    f.rax, f.rbx, f.rcx, f.rdx,
                    f.rsi, f.rdi, f.rbp,
                    f.r8, f.r9, f.r10, f.r11,
                    f.r12, f.r13, f.r14, f.r15,
                );
                report_thread();
                halt();
            }

            // The error code leaves the stack 8 bytes off the call alignment.
            #[unsafe(naked)]
            extern "C" fn $name() {
                core::arch::naked_asm!(
                    push_regs!(),
                    "mov rdi, rsp",
                    "sub rsp, 8",
                    "call {inner}",
                    "add rsp, 8",
                    pop_regs!(),
                    "add rsp, 8", // pop error code
                    "iretq",
                    inner = sym [<$name _inner>],
                );
            }
        }
    };
}

exception_no_error!(divide_error, "Divide Error");
exception_no_error!(debug, "Debug");
exception_no_error!(nmi, "NMI");
exception_no_error!(breakpoint, "Breakpoint");
exception_no_error!(overflow, "Overflow");
exception_no_error!(bound_range, "Bound Range Exceeded");
exception_no_error!(invalid_opcode, "Invalid Opcode");
exception_no_error!(device_not_available, "Device Not Available");
exception_no_error!(x87_fp_exception, "x87 FP Exception");
exception_no_error!(machine_check, "Machine Check");
exception_no_error!(simd_fp_exception, "SIMD FP Exception");
exception_no_error!(virtualization, "Virtualization Exception");

exception_with_error!(double_fault, "Double Fault");
exception_with_error!(invalid_tss, "Invalid TSS");
exception_with_error!(segment_not_present, "Segment Not Present");
exception_with_error!(stack_segment, "Stack Segment Fault");
exception_with_error!(general_protection, "General Protection Fault");
exception_with_error!(page_fault, "Page Fault");
exception_with_error!(alignment_check, "Alignment Check");

/// IRQ0. The end-of-interrupt goes out first: the tick may switch to another thread, and this
/// frame only returns once the interrupted thread is picked again.
extern "C" fn timer_interrupt() {
    send_eoi(0);

    if proc::is_booted() {
        proc::timer_tick();
    }
}

/// IRQ7 and IRQ15 also fire spuriously, with nothing in service. Those get no EOI from the PIC
/// that raised them.
extern "C" fn spurious_interrupt(irq: u8) {
    let (cmd, bit) = if irq < 8 { (PIC1_CMD, irq) } else { (PIC2_CMD, irq - 8) };

    outb(cmd, PIC_READ_ISR);
    if inb(cmd) & (1 << bit) != 0 {
        send_eoi(irq);
    } else if irq >= 8 {
        // The master did see the cascade line.
        outb(PIC1_CMD, PIC_EOI);
    }

    log::trace!("Spurious IRQ {}", irq);
}

macro_rules! irq_handler {
    ($name:ident, $handler:path) => {
        #[unsafe(naked)]
        extern "C" fn $name() {
            core::arch::naked_asm!(
                push_regs!(),
                "call {handler}",
                pop_regs!(),
                "iretq",
                handler = sym $handler,
            );
        }
    };
    ($name:ident, $handler:path, $irq:expr) => {
        #[unsafe(naked)]
        extern "C" fn $name() {
            core::arch::naked_asm!(
                push_regs!(),
                "mov rdi, {irq}",
                "call {handler}",
                pop_regs!(),
                "iretq",
                irq = const $irq,
                handler = sym $handler,
            );
        }
    };
}

irq_handler!(irq0, timer_interrupt);
irq_handler!(irq7, spurious_interrupt, 7u8);
irq_handler!(irq15, spurious_interrupt, 15u8);

/// Selector of the code segment the boot stub left us in.
fn code_selector() -> u16 {
    let cs: u16;
    unsafe {
        core::arch::asm!("mov {:x}, cs", out(reg) cs, options(nomem, nostack, preserves_flags));
    }
    cs
}

fn build() -> Idt {
    let cs = code_selector();
    let mut idt = Idt {
        entries: [IdtEntry::null(); 256],
    };

    let mut set = |vector: u8, handler: extern "C" fn()| {
        idt.entries[vector as usize] =
            IdtEntry::new(handler as *const () as u64, cs, GateType::Interrupt);
    };

    // CPU exceptions (0-31)
    set(0, divide_error);
    set(1, debug);
    set(2, nmi);
    set(3, breakpoint);
    set(4, overflow);
    set(5, bound_range);
    set(6, invalid_opcode);
    set(7, device_not_available);
    set(8, double_fault);
    set(10, invalid_tss);
    set(11, segment_not_present);
    set(12, stack_segment);
    set(13, general_protection);
    set(14, page_fault);
    set(16, x87_fp_exception);
    set(17, alignment_check);
    set(18, machine_check);
    set(19, simd_fp_exception);
    set(20, virtualization);

    // Hardware IRQs
    set(PIC1_OFFSET, irq0);
    set(PIC1_OFFSET + 7, irq7);
    set(PIC2_OFFSET + 7, irq15);

    idt
}

/// Load the IDT and remap the PIC. Must run before interrupts are first enabled.
pub fn init() {
    let idt = IDT.call_once(build);

    let idt_descriptor = IdtDescriptor {
        size: (size_of::<Idt>() - 1) as u16,
        offset: idt as *const Idt as u64,
    };

    unsafe {
        core::arch::asm!(
            "lidt [{}]",
            in(reg) &idt_descriptor,
            options(readonly, nostack, preserves_flags)
        );
    }

    init_pic();
    log::debug!("IDT loaded, PIC remapped to {:#x}/{:#x}", PIC1_OFFSET, PIC2_OFFSET);
}

/// Initialize PIC (Programmable Interrupt Controller)
/// This remaps the PIC's IRQs to interrupts 32-47, away from the CPU exceptions (0-31), and
/// leaves only the timer unmasked.
fn init_pic() {
    // ICW1: Initialize + ICW4 needed
    outb(PIC1_CMD, 0x11);
    outb(PIC2_CMD, 0x11);

    // ICW2: Vector offset
    outb(PIC1_DATA, PIC1_OFFSET);
    outb(PIC2_DATA, PIC2_OFFSET);

    // ICW3: Cascade identity
    outb(PIC1_DATA, 0x04); // IRQ2 has slave
    outb(PIC2_DATA, 0x02); // Slave identity

    // ICW4: 8086 mode
    outb(PIC1_DATA, 0x01);
    outb(PIC2_DATA, 0x01);

    // Masks: IRQ0 only
    outb(PIC1_DATA, 0xFE);
    outb(PIC2_DATA, 0xFF);
}

pub fn send_eoi(irq: u8) {
    if irq >= 8 {
        outb(PIC2_CMD, PIC_EOI);
    }
    outb(PIC1_CMD, PIC_EOI);
}
