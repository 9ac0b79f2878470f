//! A tiny embedded flat-binary userland thread, used to exercise the
//! scheduler's ring-3 spawn path ([`crate::sched::spawn_user_thread`])
//! without depending on the ELF-bundle loader in [`crate::userland`].

use kernel_alloc::vmm::AllocationTarget;
use kernel_memory_addresses::{PageSize, Size4K, VirtualAddress};
use kernel_vmem::VirtualMemoryPageBits;

// Writes a fixed string to the serial console via the write(fd, ptr, len)
// syscall, then spins forever.
core::arch::global_asm!(
    r#"
    .intel_syntax noprefix
    .section .user.text,"ax",@progbits
    .balign 16
    .globl _user_demo_start
_user_demo_start:
    lea rsi, [rip + demo_msg]
    mov rdi, 1
    mov rdx, demo_msg_len
    xor rax, rax        // Sysno::Write
    int 0x80
1:  jmp 1b
demo_msg:
    .ascii "hello from ring 3\n"
demo_msg_len = . - demo_msg
    .globl _user_demo_end
_user_demo_end:
"#
);

// Expose start/end as symbols we can take addresses of
unsafe extern "C" {
    static _user_demo_start: u8;
    static _user_demo_end: u8;
}

#[inline]
pub fn user_demo_bytes() -> &'static [u8] {
    unsafe {
        let start = &_user_demo_start as *const u8 as usize;
        let end = &_user_demo_end as *const u8 as usize;
        core::slice::from_raw_parts(start as *const u8, end - start)
    }
}

/// Map the embedded demo blob and a guard-paged stack into the current
/// address space, returning the entry point and initial stack top a
/// freshly spawned ring-3 thread should resume at.
///
/// Follows a map-anon-then-copy-then-reprotect-RX shape, just without any
/// ELF parsing: the blob already starts at offset 0 with no relocations to
/// apply.
pub fn load_demo_thread(vmm: &mut crate::alloc::KernelVmm) -> (VirtualAddress, VirtualAddress) {
    let code_base = VirtualAddress::new(kernel_info::memory::USER_DEMO_CODE_BASE);
    let bytes = user_demo_bytes();
    let code_len = (bytes.len() as u64).next_multiple_of(Size4K::SIZE);

    let nonleaf = VirtualMemoryPageBits::user_table_wb_exec();
    let temp_leaf_nx = VirtualMemoryPageBits::user_leaf_data_wb();

    vmm.map_anon_4k_pages(AllocationTarget::User, code_base, 0, code_len, nonleaf, temp_leaf_nx)
        .expect("map userland demo code");
    unsafe {
        vmm.copy_to_mapped_user(code_base, bytes)
            .expect("copy userland demo code");
    }

    let leaf_rx = VirtualMemoryPageBits::user_leaf_code_wb()
        .with_writable(false)
        .with_no_execute(false);
    vmm.make_region_rx(code_base, code_len, nonleaf, leaf_rx)
        .expect("make userland demo code executable");

    let stack_top = VirtualAddress::new(kernel_info::memory::USER_DEMO_STACK_TOP);
    let guard = Size4K::SIZE;
    let stack_size = Size4K::SIZE;
    let stack_base = VirtualAddress::new(stack_top.as_u64() - guard - stack_size);
    vmm.map_anon_4k_pages(
        AllocationTarget::User,
        stack_base,
        guard,
        stack_size,
        nonleaf.with_no_execute(true),
        VirtualMemoryPageBits::user_leaf_data_wb(),
    )
    .expect("map userland demo stack");

    (code_base, stack_top)
}
