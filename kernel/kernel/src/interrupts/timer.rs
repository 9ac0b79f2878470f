#![allow(dead_code)]

use crate::apic;
use crate::gdt::KERNEL_CS_SEL;
use crate::interrupts::{GateType, Idt};
use crate::per_cpu::PerCpu;
use crate::sched;

pub const LAPIC_TIMER_VECTOR: u8 = 0xE0; // 224

pub trait TimerInterrupt {
    fn init_timer_gate(&mut self, handler: extern "C" fn()) -> &mut Self;
}

impl TimerInterrupt for Idt {
    fn init_timer_gate(&mut self, handler: extern "C" fn()) -> &mut Self {
        self[usize::from(LAPIC_TIMER_VECTOR)]
            .set_handler(handler)
            .selector(KERNEL_CS_SEL)
            .present(true)
            .kernel_only()
            .gate_type(GateType::InterruptGate);

        let e = &self[LAPIC_TIMER_VECTOR as usize];
        debug_assert_eq!(e.selector(), 0x08);
        debug_assert_eq!(e.raw_attr() & 7, 0);
        debug_assert_eq!(e.raw_attr() >> 8, 0x8E);

        self
    }
}

/// Tick entry. Saves the interrupted thread's full GPR state, hands the
/// scheduler a stable pointer to it (`ctx`, captured in `r15` right after
/// the last push — *before* the SysV alignment fixup below, since that
/// fixup only ever adjusts stack space *underneath* this pointer), and on
/// return unconditionally loads `rsp` from whatever context the scheduler
/// decided should run next. If that's the same thread, this is a no-op;
/// if not, execution resumes on a completely different kernel stack and
/// `iretq` returns to that thread's own saved `rip`/`cs`/`rflags`/`rsp`/`ss`.
#[unsafe(naked)]
pub extern "C" fn lapic_timer_handler() {
    core::arch::naked_asm!(
        "cld",
        "push rax","push rbx","push rcx","push rdx","push rsi","push rdi","push rbp",
        "push r8","push r9","push r10","push r11","push r12","push r13","push r14","push r15",

        // Stable ctx pointer: the address of the lowest saved GPR (r15),
        // captured before the scratch-alignment adjustment below touches
        // rsp further.
        "mov r15, rsp",
        "mov rdi, r15",

        // SysV requires RSP % 16 == 8 immediately before `call`.
        "mov r11, rsp",
        "and r11, 15",
        "cmp r11, 8",
        "je 2f",
        "sub rsp, 8",
        "2:",

        "call {rust_handler}", // extern "C" fn(ctx: u64) -> u64, returns next thread's ctx
        "mov rsp, rax",        // switch stacks (no-op if same thread continues)

        "pop r15","pop r14","pop r13","pop r12","pop r11","pop r10","pop r9","pop r8",
        "pop rbp","pop rdi","pop rsi","pop rdx","pop rcx","pop rbx","pop rax",
        "iretq",

        rust_handler = sym lapic_timer_handler_rust,
    )
}

extern "C" fn lapic_timer_handler_rust(ctx: u64) -> u64 {
    // EOI first to reduce chance of nesting storms.
    unsafe {
        apic::eoi_x2apic();
    }

    let p = PerCpu::current();
    p.ticks.fetch_add(1, core::sync::atomic::Ordering::Relaxed);

    sched::on_tick(ctx)
}
