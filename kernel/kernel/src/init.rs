use crate::idt::{idt_update_in_place, init_idt_once};
use crate::init::boot_stack::boot_kstack_top;
use crate::interrupts::bp::BreakpointInterrupt;
use crate::interrupts::df::DfInterrupt;
use crate::interrupts::page_fault::PageFaultInterrupt;
use crate::interrupts::resched::ReschedInterrupt;
use crate::interrupts::spurious::SpuriousInterrupt;
use crate::interrupts::syscall::SyscallInterrupt;
use crate::interrupts::timer::TimerInterrupt;
use crate::interrupts::tlb_shootdown::TlbShootdownInterrupt;
use crate::interrupts::{self, Idt, Ist};
use crate::per_cpu::ist_stacks::{IST1_SIZE, ist_slot_for_cpu};
use crate::per_cpu::kernel_stacks::kstack_slot_for_cpu;
use crate::per_cpu::{self, PerCpu};
use crate::tracing::trace_boot_info;
use crate::{alloc, apic, gdt, kernel_main, msr, remap_boot_memory, tsc, tss};
use kernel_info::boot::KernelBootInfo;
use kernel_qemu::qemu_trace;

mod boot_stack;
pub use boot_stack::{BOOT_STACK, BOOT_STACK_SIZE};

/// The kernel entry point
///
/// # UEFI Interaction
/// The UEFI loader will jump here after `ExitBootServices`.
///
/// # ABI
/// The ABI is defined as `sysv64` (Rust's `extern "C"`), so the kernel is called
/// with the `boot_info` pointer in `RDI` (System V AMD64 ABI, as on Linux/x86_64).
///
/// # Naked function & Stack
/// This is a naked function in order to set up the stack ourselves. Without
/// the `naked` attribute (and the [`naked_asm`](core::arch::naked_asm) instruction), Rust
/// compiler would apply its own assumptions based on the C ABI and would attempt to
/// unwind the stack on the call into [`kernel_entry_on_boot_stack`]. Since we're clearing out the stack
/// here, this would cause UB.
#[unsafe(no_mangle)]
#[unsafe(naked)]
pub extern "C" fn _start_kernel(_boot_info: *const KernelBootInfo) {
    core::arch::naked_asm!(
        "cli",
        // save RDI (boot_info per SysV64)
        "mov r12, rdi",
        // Build our own kernel stack and establish a valid call frame for kernel_entry
        "lea rax, [rip + {stack_sym}]",
        "add rax, {stack_size}",
        // Align down to 16
        "and rax, -16",
        // Set RSP to the prepared value
        "mov rsp, rax",
        // Emulate a CALL by pushing a dummy return address (so RSP % 16 == 8 at entry)
        "push 0",
        "xor rbp, rbp",
        // Restore boot_info into the expected arg register (SysV/C ABI)
        "mov rdi, r12",
        // Jump to Rust entry and never return
        "jmp {rust_entry}",
        stack_sym = sym BOOT_STACK,
        stack_size = const BOOT_STACK_SIZE,
        rust_entry = sym kernel_entry_on_boot_stack,
    );
}

/// Kernel entry running on the boot stack ([`BOOT_STACK`]).
///
/// # Notes
/// * `no_mangle` is used so that [`_start_kernel`] can jump to it by name.
/// * It uses C ABI to have a defined convention when calling in from ASM.
/// * The [`_start_kernel`] function keeps `boot_info` in `RDI`, matching C ABI expectations.
#[unsafe(no_mangle)]
pub extern "C" fn kernel_entry_on_boot_stack(boot_info: *const KernelBootInfo) -> ! {
    qemu_trace!("Kernel reporting to QEMU!\n");

    let percpu = early_kernel_init_arch();
    qemu_trace!("Early kernel init done\n");

    // Enable interrupts (undo the earlier 'cli')
    unsafe { core::arch::asm!("sti") };

    let bi = unsafe { &*boot_info };
    trace_boot_info(bi);

    let fb_virt = remap_boot_memory(bi);

    finish_interrupt_bringup(percpu, bi.rsdp_addr);

    kernel_main(&fb_virt)
}

/// Install a bootstrap GDT/TSS/IDT good enough to take exceptions and the
/// `int 0x80` syscall gate before the virtual memory manager exists.
///
/// Runs on [`BOOT_STACK`], so `rsp0`/IST1 both point at it for now. Once the
/// VMM is up, [`finish_interrupt_bringup`] replaces them with dedicated,
/// guard-paged stacks and switches the fault handlers onto IST1.
fn early_kernel_init_arch() -> &'static mut PerCpu {
    let _ = crate::serial::SerialLogger::new(log::LevelFilter::Trace).init();
    log::info!("Kernel booting");

    qemu_trace!("Allocating boot kernel stack\n");
    let kstack_top = boot_kstack_top();

    // Safety: single-core, nothing else has observed BSP_PERCPU yet.
    let percpu = unsafe { per_cpu::bsp_percpu_mut() };

    qemu_trace!("Initializing GDT and TSS ...\n");
    gdt::init_gdt_and_tss(percpu, kstack_top, kstack_top);

    qemu_trace!("Pointing GS base at the BSP per-CPU block ...\n");
    // Safety: GDT/TSS are loaded, so segment state is sane before GS is repointed.
    unsafe { msr::init_gs_bases(percpu) };

    qemu_trace!("Initializing IDT ...\n");
    unsafe {
        init_idt_once(Idt::new());
    }

    qemu_trace!("Installing interrupt handlers ...\n");
    idt_update_in_place(|idt| {
        idt.init_breakpoint_gate(interrupts::bp::bp_handler);
        idt.init_df_gate_ist(interrupts::df::double_fault_handler, Ist::None);
        idt.init_page_fault_gate_ist(interrupts::page_fault::page_fault_handler, Ist::None);
        idt.init_spurious_interrupt_gate();
        idt.init_timer_gate(interrupts::timer::lapic_timer_handler);
        idt.init_resched_gate(interrupts::resched::resched_handler);
        idt.init_tlb_shootdown_gate(interrupts::tlb_shootdown::tlb_shootdown_handler);
        idt.init_syscall_gate(interrupts::int80_entry::int80_entry);
    });

    percpu
}

/// Replace the boot-stack-backed `rsp0`/IST1 with dedicated, guard-paged
/// stacks and bring up the local APIC timer.
///
/// Must run after [`remap_boot_memory`] has initialized the kernel VMM.
fn finish_interrupt_bringup(percpu: &mut PerCpu, rsdp_addr: u64) {
    qemu_trace!("Mapping dedicated kernel stack ...\n");
    let kstack = alloc::try_with_kernel_vmm(alloc::FlushTlb::OnSuccess, |vmm| {
        crate::per_cpu::stack::map_kernel_stack(
            vmm,
            kstack_slot_for_cpu(u64::from(percpu.cpu_id)),
            kernel_info::memory::KERNEL_STACK_SIZE as u64,
        )
    })
    .expect("map per-CPU kernel stack");
    tss::set_rsp0(percpu, kstack.top);
    percpu.kstack_top = kstack.top;

    qemu_trace!("Mapping IST1 stack ...\n");
    let (_, ist1_top) = alloc::try_with_kernel_vmm(alloc::FlushTlb::OnSuccess, |vmm| {
        crate::per_cpu::stack::map_ist_stack(
            vmm,
            ist_slot_for_cpu(u64::from(percpu.cpu_id), Ist::Ist1),
            IST1_SIZE,
        )
    })
    .expect("map IST1 stack");
    percpu.tss.ist1 = ist1_top;
    percpu.ist_stacks[0] = ist1_top;

    idt_update_in_place(|idt| {
        idt.init_df_gate_ist(interrupts::df::double_fault_handler, Ist::Ist1);
        idt.init_page_fault_gate_ist(interrupts::page_fault::page_fault_handler, Ist::Ist1);
    });

    qemu_trace!("Bringing up the local APIC ...\n");
    apic::init_lapic_and_set_cpu_id(percpu);
    crate::smp::register_online_cpu(percpu.apic_id);
    // Safety: CPL0, APIC base MSR accessible.
    let tsc_hz = unsafe { tsc::estimate_tsc_hz() };
    apic::start_lapic_timer(tsc_hz);
    crate::sched::init(tsc_hz);

    crate::smp::bring_up_aps(percpu.apic_id, rsdp_addr, tsc_hz);
}
