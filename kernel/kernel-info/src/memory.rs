//! # Memory Layout

/// End of userspace VA range after which Kernel space begins.
pub const LAST_USERSPACE_ADDRESS: u64 = 0xffff_0000_0000_0000;

/// End of userspace VA range after which Kernel space begins.
pub const USERSPACE_END: u64 = 0xffff_0000_0000_0000;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything you map at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Where the kernel executes (VMA), matches your linker script.
///
/// # Kernel Build
/// This information is sourced in the kernel's `build.rs` to configure
/// the linker.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Where you place the bytes in *physical* memory (LMA) before paging.
///
/// # Kernel Build
/// This information is sourced in the kernel's `build.rs` to configure
/// the linker.
pub const PHYS_LOAD: u64 = 0x0010_0000; // 1 MiB

/// Keep a tiny identity map so the paging switch code remains executable
/// right after CR3 reload (and to let you pass low pointers if you want).
pub const IDENTITY_LOW_BYTES: u64 = 0x20_0000; // 2 MiB

/// Fixed physical (== virtual, once identity-mapped) load address for the
/// real-mode AP bring-up trampoline. An application processor starts
/// executing at `CS:IP = (TRAMPOLINE_PHYS_ADDR / 0x1000):0` in response to a
/// Startup IPI carrying vector `TRAMPOLINE_PHYS_ADDR / 0x1000`, so this must
/// stay 4 KiB-aligned and low enough to fit in a `u8` vector (< 0x100000).
/// Sits inside [`IDENTITY_LOW_BYTES`], clear of the BIOS data area/IVT in the
/// first KiB and below any firmware/VM MMIO typically living under 1 MiB.
pub const TRAMPOLINE_PHYS_ADDR: u64 = 0x0000_8000;

/// Base of the kernel heap's reserved virtual range. Sits between the HHDM
/// window and the kernel image itself so it can never collide with either as
/// both are sized up.
pub const HEAP_BASE: u64 = 0xffff_9000_0000_0000;

/// Size of the kernel heap's reserved virtual range. Only the prefix the
/// heap has actually grown into is backed by physical frames.
pub const HEAP_RESERVE_SIZE: u64 = 1024 * 1024 * 1024; // 1 GiB

/// How many bytes the heap grows by when it runs out of backed space.
pub const HEAP_GROW_STEP: u64 = 2 * 1024 * 1024; // 2 MiB

/// The size of the kernel stack in debug builds.
#[cfg(debug_assertions)]
pub const KERNEL_STACK_SIZE: usize = 32 * 1024;

/// The size of the kernel stack in release builds.
#[cfg(not(debug_assertions))]
pub const KERNEL_STACK_SIZE: usize = 32 * 1024;

/// Base of the region holding dynamically spawned kernel threads' stacks,
/// one guard-paged slot per thread. Disjoint from the per-CPU boot/IST
/// stack regions (`0xffff_ff00_...` / `0xffff_ff10_...`).
pub const KTHREAD_STACK_BASE: u64 = 0xffff_ff20_0000_0000;

/// Per-thread stride in the kernel-thread-stack region (guard page + stack).
pub const KTHREAD_STACK_STRIDE: u64 = 256 * 1024; // 256 KiB per thread slot

/// Default usable stack size handed to a freshly spawned kernel thread.
pub const KTHREAD_STACK_SIZE: u64 = 64 * 1024;

/// Upper bound on the number of live threads the scheduler tracks at once,
/// matching the "N≲256" sizing the sleeping-list and run-queue are designed
/// around.
pub const MAX_THREADS: usize = 256;

/// Upper bound on the number of live processes.
pub const MAX_PROCESSES: usize = 64;

/// Fixed load address for the embedded flat-binary userland demo thread.
pub const USER_DEMO_CODE_BASE: u64 = 0x0000_0000_0040_0000; // 4 MiB

/// Top of the demo thread's single-page stack.
pub const USER_DEMO_STACK_TOP: u64 = 0x0000_7fff_0000_0000;

const _: () = {
    assert!(KERNEL_STACK_SIZE.is_multiple_of(4096));
    assert!(HHDM_BASE >= LAST_USERSPACE_ADDRESS);
    assert!(KERNEL_BASE > HHDM_BASE);
    assert!(HEAP_BASE > HHDM_BASE);
    assert!(HEAP_BASE + HEAP_RESERVE_SIZE < KERNEL_BASE);
    assert!(HEAP_GROW_STEP.is_multiple_of(4096));
    assert!(KTHREAD_STACK_BASE > HEAP_BASE + HEAP_RESERVE_SIZE);
    assert!(KTHREAD_STACK_STRIDE.is_multiple_of(4096));
    assert!(KTHREAD_STACK_SIZE < KTHREAD_STACK_STRIDE);
    assert!(KTHREAD_STACK_BASE + (MAX_THREADS as u64) * KTHREAD_STACK_STRIDE < KERNEL_BASE);
    assert!(USER_DEMO_CODE_BASE.is_multiple_of(4096));
    assert!(USER_DEMO_STACK_TOP < LAST_USERSPACE_ADDRESS);
    assert!(USER_DEMO_STACK_TOP > USER_DEMO_CODE_BASE);
    assert!(TRAMPOLINE_PHYS_ADDR.is_multiple_of(4096));
    assert!(TRAMPOLINE_PHYS_ADDR + 4096 <= IDENTITY_LOW_BYTES);
    assert!(TRAMPOLINE_PHYS_ADDR / 0x1000 < 0x100);
};
