//! Rust-side entry point an application processor lands in once
//! [`super::trampoline`] has taken it through real mode, protected mode, and
//! into long mode on its own (already-mapped) kernel stack.
//!
//! Mirrors [`crate::init::finish_interrupt_bringup`]'s BSP bring-up order —
//! GDT/TSS, GS base, IDT, LAPIC, scheduler registration — minus the one-time
//! global setup ([`crate::idt::init_idt_once`], [`crate::sched::init`]) the
//! BSP already did before sending any Startup IPI.

use crate::per_cpu::{self, PerCpu};
use crate::{apic, gdt, idt, msr, sched, smp};
use kernel_vmem::addresses::VirtualAddress;

/// Called by the trampoline's 64-bit tail with `rdi = cpu_id`, `rsi =
/// kstack_top`, `rdx = ist1_top` — the exact values [`super::bring_up_aps`]
/// wrote into this AP's `ApBootInfo` before the Startup IPI. Never returns:
/// it ends in [`crate::sched::run_idle_loop`].
///
/// # Safety
/// Must only be reached via the trampoline, exactly once, for the logical
/// `cpu_id` it was started with — paging and long mode are already active
/// (the trampoline loaded the kernel's own CR3 and set `EFER.LME`/`CR0.PG`),
/// but nothing CPU-local (GDT, TSS, GS base, IDTR) has been configured yet.
#[unsafe(no_mangle)]
pub extern "C" fn ap_entry_trampoline(cpu_id: u64, kstack_top: u64, ist1_top: u64) -> ! {
    let percpu: &'static mut PerCpu = unsafe { per_cpu::ap_percpu_mut(cpu_id as usize) };
    percpu.cpu_id = cpu_id as u32;
    percpu.kstack_top = VirtualAddress::new(kstack_top);
    percpu.ist_stacks[0] = VirtualAddress::new(ist1_top);

    gdt::init_gdt_and_tss(
        percpu,
        VirtualAddress::new(kstack_top),
        VirtualAddress::new(ist1_top),
    );

    // Safety: GDT/TSS are loaded, so segment state is sane before GS is repointed.
    unsafe { msr::init_gs_bases(percpu) };

    // Safety: the BSP already installed the shared IDT's contents; this CPU
    // only needs its own IDTR pointed at it.
    unsafe { idt::load_idt_on_this_cpu() };

    apic::init_lapic_and_set_cpu_id(percpu);
    smp::register_online_cpu(percpu.apic_id);
    apic::start_lapic_timer(smp::bsp_tsc_hz());

    // Safety: undoes the trampoline's `cli`, now that GDT/IDT/TSS are live.
    unsafe { core::arch::asm!("sti") };

    log::info!("AP {cpu_id} (APIC {:#x}) online", percpu.apic_id);

    sched::run_idle_loop()
}
