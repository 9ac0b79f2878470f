//! # Kernel Memory Management
//!
//! This module provides the core memory management infrastructure for the kernel,
//! including physical frame allocation, virtual memory management, and page table
//! manipulation. It serves as the central interface between the kernel and the
//! underlying memory management subsystems.
//!
//! ## Architecture
//!
//! The memory management system is built on three key components:
//!
//! * **Physical Frame Allocator**: [`PhysAlloc`] is a buddy allocator over 4 KiB
//!   frames (orders 0..=10), seeded from the loader's compacted memory map
//! * **Physical Mapper**: [`HhdmPhysMapper`] provides Higher Half Direct Mapping (HHDM)
//!   for efficient access to physical memory from kernel virtual addresses
//! * **Virtual Memory Manager**: [`Vmm`] handles page table manipulation, mapping/unmapping
//!   operations, and address space management
//!
//! ## Key Types
//!
//! * [`KernelVmm`] - Type alias for the kernel's Virtual Memory Manager configured
//!   with the HHDM mapper and the buddy allocator
//! * [`KernelVm`] - Container holding the mapper and allocator with thread-safe access
//! * [`FlushTlb`] - Policy enum controlling when TLB flushes occur during operations
//!
//! ## Initialization
//!
//! Memory management is initialized in two phases:
//!
//! 1. **Physical Allocator Setup**: [`init_physical_memory_allocator_once`] creates
//!    the buddy allocator in a dedicated BSS section (`.bss.pmm`) and seeds its
//!    free lists from the loader's compacted memory map
//! 2. **VMM Initialization**: [`init_kernel_vmm`] combines the allocator and mapper
//!    into a globally accessible kernel VMM instance
//!
//! ## Usage Patterns
//!
//! The module provides two primary access patterns:
//!
//! * [`with_kernel_vmm`] - Execute operations with automatic VMM lifecycle management
//! * [`try_with_kernel_vmm`] - Execute fallible operations with configurable TLB flushing
//!
//! ## Safety
//!
//! This module contains extensive unsafe code for:
//! - Direct physical memory access via HHDM
//! - Page table manipulation and TLB management
//! - Static initialization of allocator structures
//! - Raw pointer operations for memory mapping
//!
//! All unsafe operations are carefully isolated behind safe abstractions and
//! documented for their safety requirements.
//!
//! ## Debugging
//!
//! The [`debug`] submodule provides utilities for inspecting page table state,
//! walking virtual address translations, and debugging memory management issues.

pub mod debug;

use core::mem::MaybeUninit;
use kernel_alloc::buddy::BuddyFrameAlloc;
use kernel_alloc::mmap::CompactedMemoryMap;
use kernel_alloc::phys_mapper::HhdmPhysMapper;
use kernel_alloc::vmm::Vmm;
use kernel_info::memory::PHYS_LOAD;
use kernel_sync::{RawSpin, SpinMutex, SyncOnceCell};
use kernel_vmem::ReservationList;
use kernel_vmem::addresses::PhysicalAddress;
use kernel_vmem::{PhysFrameAlloc, PhysMapper};

pub type PhysAlloc = BuddyFrameAlloc<HhdmPhysMapper>;
pub type KernelVmm<'alloc> = Vmm<'alloc, HhdmPhysMapper, PhysAlloc>;

pub struct KernelVm<M: PhysMapper, A: PhysFrameAlloc + 'static> {
    pub mapper: M,
    pub alloc: SpinMutex<&'static mut A>,
    /// Reservations for the kernel's own address space (shared by both
    /// kernel-half mappings and the process-less userland demo, which maps
    /// its ELF segments directly into this same address space for now).
    pub reservations: SpinMutex<ReservationList>,
}

#[unsafe(link_section = ".bss.pmm")]
static mut PMM: MaybeUninit<PhysAlloc> = MaybeUninit::uninit();

/// Construct the PMM in place and seed its free lists from the loader's
/// compacted memory map.
///
/// # Safety
/// Must run once, in early single-core init, before anything else observes
/// [`PMM`].
#[doc(alias = "init_pmm_once")]
#[allow(static_mut_refs)]
pub unsafe fn init_physical_memory_allocator_once(mmap: &CompactedMemoryMap) -> &'static mut PhysAlloc {
    let pmm = unsafe {
        PMM.write(BuddyFrameAlloc::new(HhdmPhysMapper));
        &mut *PMM.as_mut_ptr()
    };

    pmm.init_base(PhysicalAddress::new(PHYS_LOAD))
        .expect("PMM base must be 4 KiB aligned");
    let (win_start, win_end) = pmm.window();

    for region in mmap.free_regions() {
        let start = region.pa.max(win_start);
        let end = (region.pa + region.pages * 4096).min(win_end);
        if start >= end {
            continue;
        }
        let aligned_start = start.next_multiple_of(4096);
        let aligned_end = end - (end % 4096);
        if aligned_start >= aligned_end {
            continue;
        }
        let _ = pmm.add_region(PhysicalAddress::new(aligned_start), aligned_end - aligned_start);
    }

    pmm
}

static KVM: SyncOnceCell<KernelVm<HhdmPhysMapper, PhysAlloc>> = SyncOnceCell::new();

/// Call once in very early boot.
pub unsafe fn init_kernel_vmm(mapper: HhdmPhysMapper, alloc: &'static mut PhysAlloc) {
    let _ = KVM.get_or_init(|| KernelVm {
        mapper,
        alloc: SpinMutex::from_raw(RawSpin::new(), alloc),
        reservations: SpinMutex::new(ReservationList::new()),
    });
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[allow(dead_code)]
pub enum FlushTlb {
    Never,
    OnSuccess,
    Always,
}

#[inline]
pub fn with_kernel_vmm(f: impl FnOnce(&mut KernelVmm)) {
    let kvm = KVM.get().expect("Kernel VM not initialized");
    let mut alloc = kvm.alloc.lock();
    let mut reservations = kvm.reservations.lock();

    // Safety: CR3 points to a valid PML4; mapper is valid for kernel lifetime.
    let mut vmm = unsafe { Vmm::from_current(&kvm.mapper, *alloc, &mut reservations) };
    f(&mut vmm);
}

#[inline]
pub fn try_with_kernel_vmm<R, E>(
    flush: FlushTlb,
    f: impl FnOnce(&mut KernelVmm) -> Result<R, E>,
) -> Result<R, E> {
    let kvm = KVM.get().expect("Kernel VM not initialized");
    let mut alloc = kvm.alloc.lock();
    let mut reservations = kvm.reservations.lock();

    // Safety: CR3 points to a valid PML4; mapper is valid for kernel lifetime.
    let mut vmm = unsafe { Vmm::from_current(&kvm.mapper, *alloc, &mut reservations) };
    match f(&mut vmm) {
        Ok(r) => {
            if matches!(flush, FlushTlb::Always | FlushTlb::OnSuccess) {
                // The kernel VMM's upper-half mappings are shared by every
                // CPU's page tables, so a change here can leave stale
                // translations cached on CPUs other than this one.
                crate::smp::shootdown_full();
            }
            Ok(r)
        }
        Err(e) => {
            if matches!(flush, FlushTlb::Always) {
                crate::smp::shootdown_full();
            }
            Err(e)
        }
    }
}
