//! The real-mode → protected-mode → long-mode trampoline an application
//! processor runs immediately after a Startup IPI.
//!
//! An AP wakes up with `CS = vector << 8, IP = 0` and nothing else
//! architecturally guaranteed — no stack, no GDT, no paging. This blob is
//! copied verbatim to [`kernel_info::memory::TRAMPOLINE_PHYS_ADDR`] (the
//! Startup IPI's vector is that address divided by `0x1000`) and executed
//! there directly out of low physical memory, so every absolute memory
//! reference inside it is written as `TRAMPOLINE_PHYS_ADDR + (label -
//! ap_trampoline_start)` rather than relying on the linker to place the
//! section at its final address — this section is linked at the kernel's
//! normal high-half load address like any other `.rodata`, and only the
//! bytes (not the VA) end up mattering once they're copied down to
//! [`kernel_info::memory::TRAMPOLINE_PHYS_ADDR`].
//!
//! [`ApBootInfo`] is a second, plain-data blob placed directly after the
//! code and patched by [`super::bring_up_aps`] with the concrete CR3, stack,
//! entry point, and logical CPU id for the AP about to be started. The 64-bit
//! tail of the trampoline loads those fields into registers and jumps to
//! [`super::ap_entry::ap_entry_trampoline`].

use core::mem::size_of;

core::arch::global_asm!(
    r#"
    .intel_syntax noprefix
    .set TRAMPOLINE_BASE, {trampoline_base}

    .section .text.ap_trampoline,"ax",@progbits
    .balign 4096
    .globl ap_trampoline_start
ap_trampoline_start:
    .code16
    cli
    cld
    xor ax, ax
    mov ds, ax
    mov es, ax
    mov ss, ax
    mov sp, 0x0ff0

    lgdt [TRAMPOLINE_BASE + (ap_gdt32_ptr - ap_trampoline_start)]

    mov eax, cr0
    or eax, 1          # CR0.PE
    mov cr0, eax

    # Far jump reloads CS with the flat 32-bit code descriptor and flushes
    # the real-mode instruction prefetch queue. `0x66` widens the operand
    # (far jmp ptr16:32) while still assembling in 16-bit mode.
    .byte 0x66, 0xea
    .long TRAMPOLINE_BASE + (ap_pm32 - ap_trampoline_start)
    .word 0x08

    .code32
ap_pm32:
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov ss, ax
    mov fs, ax
    mov gs, ax

    mov eax, cr4
    or eax, 1 << 5     # CR4.PAE
    mov cr4, eax

    mov eax, [TRAMPOLINE_BASE + (ap_boot_info - ap_trampoline_start) + 0]
    mov cr3, eax

    mov ecx, 0xc0000080 # IA32_EFER
    rdmsr
    or eax, 1 << 8      # EFER.LME
    wrmsr

    mov eax, cr0
    or eax, 1 << 31     # CR0.PG
    mov cr0, eax

    .byte 0xea
    .long TRAMPOLINE_BASE + (ap_lm64 - ap_trampoline_start)
    .word 0x18

    .code64
ap_lm64:
    mov ax, 0x20
    mov ds, ax
    mov es, ax
    mov ss, ax
    mov fs, ax
    mov gs, ax

    mov rsp, [TRAMPOLINE_BASE + (ap_boot_info - ap_trampoline_start) + 8]
    mov rdi, [TRAMPOLINE_BASE + (ap_boot_info - ap_trampoline_start) + 24]
    mov rsi, [TRAMPOLINE_BASE + (ap_boot_info - ap_trampoline_start) + 8]
    mov rdx, [TRAMPOLINE_BASE + (ap_boot_info - ap_trampoline_start) + 32]
    mov rax, [TRAMPOLINE_BASE + (ap_boot_info - ap_trampoline_start) + 16]
    jmp rax

    .balign 8
ap_gdt32:
    .quad 0x0000000000000000 # null
    .quad 0x00cf9a000000ffff # 0x08: 32-bit flat code, G=1 D=1
    .quad 0x00cf92000000ffff # 0x10: 32-bit flat data
    .quad 0x00af9a000000ffff # 0x18: 64-bit flat code, L=1
    .quad 0x00cf92000000ffff # 0x20: data (selector only; base/limit unused in long mode)
ap_gdt32_end:

ap_gdt32_ptr:
    .word ap_gdt32_end - ap_gdt32 - 1
    .long TRAMPOLINE_BASE + (ap_gdt32 - ap_trampoline_start)

    .balign 8
    .globl ap_boot_info
ap_boot_info:
    .quad 0 # +0:  cr3
    .quad 0 # +8:  rsp / kstack_top
    .quad 0 # +16: entry (VA of ap_entry_trampoline)
    .quad 0 # +24: cpu_id
    .quad 0 # +32: ist1_top

    .globl ap_trampoline_end
ap_trampoline_end:
    .intel_syntax noprefix
"#,
    trampoline_base = const kernel_info::memory::TRAMPOLINE_PHYS_ADDR,
);

unsafe extern "C" {
    static ap_trampoline_start: u8;
    static ap_trampoline_end: u8;
    static ap_boot_info: u8;
}

/// Fields [`super::bring_up_aps`] patches into the copied trampoline's
/// `ap_boot_info` blob before sending a Startup IPI. Layout and field order
/// must match the `.quad` list after `ap_boot_info:` above exactly.
#[repr(C)]
pub struct ApBootInfo {
    pub cr3: u64,
    pub rsp: u64,
    pub entry: u64,
    pub cpu_id: u64,
    pub ist1_top: u64,
}

const _: () = assert!(size_of::<ApBootInfo>() == 5 * 8);

/// The trampoline's code + data as assembled, ready to be copied verbatim to
/// [`kernel_info::memory::TRAMPOLINE_PHYS_ADDR`].
pub fn trampoline_image() -> &'static [u8] {
    unsafe {
        let start = &ap_trampoline_start as *const u8 as usize;
        let end = &ap_trampoline_end as *const u8 as usize;
        core::slice::from_raw_parts(start as *const u8, end - start)
    }
}

/// Byte offset of `ap_boot_info` within [`trampoline_image`], so the caller
/// can locate it once copied to its runtime address.
pub fn boot_info_offset() -> usize {
    unsafe {
        let start = &ap_trampoline_start as *const u8 as usize;
        let info = &ap_boot_info as *const u8 as usize;
        info - start
    }
}
