//! Remote TLB invalidation IPI.
//!
//! When one CPU unmaps a page that another CPU may have cached a translation
//! for, a local `invlpg`/CR3 reload only clears the issuing CPU's TLB.
//! [`crate::smp::shootdown_tlb`] broadcasts this vector to every other
//! online CPU, each of which invalidates the pending range and acks before
//! the issuer proceeds — see that module for the handshake.

use crate::apic;
use crate::gdt::KERNEL_CS_SEL;
use crate::interrupts::{GateType, Idt};
use crate::smp;

pub const TLB_SHOOTDOWN_VECTOR: u8 = 0xE2;

pub trait TlbShootdownInterrupt {
    fn init_tlb_shootdown_gate(&mut self, handler: extern "C" fn()) -> &mut Self;
}

impl TlbShootdownInterrupt for Idt {
    fn init_tlb_shootdown_gate(&mut self, handler: extern "C" fn()) -> &mut Self {
        self[usize::from(TLB_SHOOTDOWN_VECTOR)]
            .set_handler(handler)
            .selector(KERNEL_CS_SEL)
            .present(true)
            .kernel_only()
            .gate_type(GateType::InterruptGate);
        self
    }
}

#[unsafe(naked)]
pub extern "C" fn tlb_shootdown_handler() {
    core::arch::naked_asm!(
        "cld",
        "push rax","push rbx","push rcx","push rdx","push rsi","push rdi","push rbp",
        "push r8","push r9","push r10","push r11","push r12","push r13","push r14","push r15",

        "mov r11, rsp",
        "and r11, 15",
        "cmp r11, 8",
        "je 2f",
        "sub rsp, 8",
        "mov r11, 1",
        "jmp 3f",
        "2:",
        "xor r11, r11",
        "3:",

        "call {rust}",

        "test r11, r11",
        "jz 4f",
        "add rsp, 8",
        "4:",

        "pop r15","pop r14","pop r13","pop r12","pop r11","pop r10","pop r9","pop r8",
        "pop rbp","pop rdi","pop rsi","pop rdx","pop rcx","pop rbx","pop rax",
        "iretq",

        rust = sym tlb_shootdown_rust,
    )
}

extern "C" fn tlb_shootdown_rust() {
    smp::handle_shootdown_ipi();
    unsafe { apic::eoi_x2apic() };
}
