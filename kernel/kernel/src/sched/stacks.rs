//! Virtual layout and slot allocator for dynamically spawned kernel-thread
//! stacks.
//!
//! Mirrors [`crate::per_cpu::kernel_stacks`]'s guard-page-below-stack layout,
//! but over a region sized for up to [`MAX_THREADS`] *threads* rather than
//! CPUs, and with slots recycled on [`free_slot`] since threads come and go
//! at runtime (per-CPU stacks never do).
//!
//! ```text
//! KTHREAD_STACK_BASE + slot * KTHREAD_STACK_STRIDE
//!   -> [ guard (4 KiB, unmapped) ][ KTHREAD_STACK_SIZE mapped, RW|NX ]
//! ```

use crate::alloc::KernelVmm;
use kernel_alloc::vmm::{AllocationTarget, VmmError};
use kernel_info::memory::{KTHREAD_STACK_BASE, KTHREAD_STACK_SIZE, KTHREAD_STACK_STRIDE, MAX_THREADS};
use kernel_vmem::VirtualMemoryPageBits;
use kernel_vmem::addresses::{PageSize, Size4K, VirtualAddress, VirtualPage};

static SLOT_IN_USE: kernel_sync::SpinMutex<[bool; MAX_THREADS]> =
    kernel_sync::SpinMutex::from_raw(kernel_sync::RawSpin::new(), [false; MAX_THREADS]);

/// Reserve the next free stack slot index, without mapping anything yet.
fn reserve_slot() -> Option<usize> {
    let mut slots = SLOT_IN_USE.lock();
    let idx = slots.iter().position(|used| !used)?;
    slots[idx] = true;
    Some(idx)
}

fn slot_base(slot: usize) -> VirtualPage<Size4K> {
    let addr = VirtualAddress::new(KTHREAD_STACK_BASE + (slot as u64) * KTHREAD_STACK_STRIDE);
    addr.page()
}

/// Map a fresh kernel-thread stack into a free slot and return its top.
///
/// Returns `None` if every slot is occupied (i.e. `MAX_THREADS` live
/// thread stacks already exist).
pub fn alloc_stack(vmm: &mut KernelVmm) -> Result<Option<(usize, VirtualAddress)>, VmmError> {
    let Some(slot) = reserve_slot() else {
        return Ok(None);
    };

    let nonleaf = VirtualMemoryPageBits::new()
        .with_present(true)
        .with_writable(true)
        .with_user(false);
    let leaf = VirtualMemoryPageBits::new()
        .with_present(true)
        .with_writable(true)
        .with_no_execute(true)
        .with_user(false)
        .with_global(false);

    let guard_bytes = Size4K::SIZE;
    match vmm.map_anon_4k_pages(
        AllocationTarget::Kernel,
        slot_base(slot).base(),
        guard_bytes,
        KTHREAD_STACK_SIZE,
        nonleaf,
        leaf,
    ) {
        Ok(()) => {
            let base = VirtualAddress::new(slot_base(slot).base().as_u64() + guard_bytes);
            let top = VirtualAddress::new((base.as_u64() + KTHREAD_STACK_SIZE) & !0xFu64);
            Ok(Some((slot, top)))
        }
        Err(e) => {
            SLOT_IN_USE.lock()[slot] = false;
            Err(e)
        }
    }
}

/// Unmap a thread's kernel stack and return its slot to the free pool.
///
/// Called once a `zombie` thread is reaped.
pub fn free_stack(vmm: &mut KernelVmm, slot: usize) {
    let guard_bytes = Size4K::SIZE;
    let base = VirtualAddress::new(slot_base(slot).base().as_u64() + guard_bytes);
    vmm.unmap_anon_4k_pages(base, KTHREAD_STACK_SIZE);
    SLOT_IN_USE.lock()[slot] = false;
}
