//! Voluntary reschedule: a software interrupt a thread raises on itself
//! (`int RESCHED_VECTOR`) to give up the remainder of its timeslice, e.g.
//! from [`crate::sched::yield_now`] and [`crate::sched::sleep_ms`].
//!
//! Shares the exact save/restore shape of [`crate::interrupts::timer`]'s
//! handler — see that module's doc comment for why the `ctx` pointer is
//! captured where it is — but skips the timer's EOI and tick accounting.

use crate::gdt::KERNEL_CS_SEL;
use crate::interrupts::{GateType, Idt};
use crate::sched;

pub const RESCHED_VECTOR: u8 = 0xE1; // 225, immediately after the LAPIC timer

pub trait ReschedInterrupt {
    fn init_resched_gate(&mut self, handler: extern "C" fn()) -> &mut Self;
}

impl ReschedInterrupt for Idt {
    fn init_resched_gate(&mut self, handler: extern "C" fn()) -> &mut Self {
        self[usize::from(RESCHED_VECTOR)]
            .set_handler(handler)
            .selector(KERNEL_CS_SEL)
            .present(true)
            .gate_type(GateType::InterruptGate)
            // Software-triggered via `int`; DPL0 is fine since only kernel
            // code (the scheduler's own yield path) ever executes it, even
            // on behalf of a ring-3 thread that trapped into a syscall first.
            .dpl(0);
        self
    }
}

#[unsafe(naked)]
pub extern "C" fn resched_handler() {
    core::arch::naked_asm!(
        "cld",
        "push rax","push rbx","push rcx","push rdx","push rsi","push rdi","push rbp",
        "push r8","push r9","push r10","push r11","push r12","push r13","push r14","push r15",

        "mov r15, rsp",
        "mov rdi, r15",

        "mov r11, rsp",
        "and r11, 15",
        "cmp r11, 8",
        "je 2f",
        "sub rsp, 8",
        "2:",

        "call {rust_handler}",
        "mov rsp, rax",

        "pop r15","pop r14","pop r13","pop r12","pop r11","pop r10","pop r9","pop r8",
        "pop rbp","pop rdi","pop rsi","pop rdx","pop rcx","pop rbx","pop rax",
        "iretq",

        rust_handler = sym resched_handler_rust,
    )
}

extern "C" fn resched_handler_rust(ctx: u64) -> u64 {
    sched::on_yield(ctx)
}
