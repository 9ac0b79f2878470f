//! # Virtual Memory Support
//!
//! x86-64 4-level paging for the kernel's virtual memory manager.
//!
//! ## What you get
//! - An [`AddressSpace`](address_space::AddressSpace) wrapping a PML4 root and
//!   a [`MapSize`](address_space::MapSize)-directed `map_one`/`map_region`.
//! - Strongly-typed per-level page-table entries under [`page_table`].
//! - [`VirtualMemoryPageBits`], an ergonomic flags view shared across levels.
//! - A tiny allocator/mapper interface ([`PhysFrameAlloc`], [`PhysMapper`]).
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! Each 48-bit virtual address is divided into five fields:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! The CPU uses these fields as **indices** into four levels of page tables,
//! each level containing 512 (2⁹) entries of 8 bytes (64 bits) each.
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//!   │        │        │        │
//!   │        │        │        └───► PTE   (Page Table Entry)  → maps 4 KiB page
//!   │        │        └────────────► PDE   (Page Directory Entry) → PS=1 → 2 MiB page
//!   │        └─────────────────────► PDPTE (Page Directory Pointer Table Entry) → PS=1 → 1 GiB page
//!   └──────────────────────────────► PML4E (Page Map Level 4 Entry)
//! ```
//!
//! ### Levels and their roles
//!
//! | Level | Table name | Entry name | Description |
//! |:------|:------------|:-----------|:-------------|
//! | 1 | **PML4** (Page Map Level 4) | **PML4E** | Top-level table; each entry points to a PDPT. One PML4 table per address space, referenced by Control Register 3 ([`CR3`](https://wiki.osdev.org/CPU_Registers_x86#CR3)). |
//! | 2 | **PDPT** (Page Directory Pointer Table) | **PDPTE** | Each entry points to a PD. If `PS=1`, it directly maps a 1 GiB page (leaf). |
//! | 3 | **PD** (Page Directory) | **PDE** | Each entry points to a PT. If `PS=1`, it directly maps a 2 MiB page (leaf). |
//! | 4 | **PT** (Page Table) | **PTE** | Each entry maps a 4 KiB physical page (always a leaf). |
//!
//! ### Leaf vs. non-leaf entries
//!
//! - A **leaf entry** directly maps physical memory — it contains the physical base address
//!   and permission bits (present, writable, user, global, no-execute, etc.).
//!   - A **PTE** is always a leaf (maps 4 KiB).
//!   - A **PDE** with `PS=1` is a leaf (maps 2 MiB).
//!   - A **PDPTE** with `PS=1` is a leaf (maps 1 GiB).
//!
//! - A **non-leaf entry** points to the next lower table level and continues the walk.
//!   For example, a PML4E points to a PDPT, and a PDE with `PS=0` points to a PT.
//!
//! ### Offset
//!
//! - The final **Offset** field (bits 11–0) selects the byte inside the 4 KiB (or larger) page.
//!
//! ### Summary
//!
//! A canonical 48-bit virtual address is effectively:
//!
//! ```text
//! VA = [PML4:9] [PDPT:9] [PD:9] [PT:9] [Offset:12]
//! ```
//!
//! This creates a four-level translation tree that can map up to **256 TiB** of
//! virtual address space, using leaf pages of 1 GiB, 2 MiB, or 4 KiB depending
//! on which level the translation stops.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

pub mod address_space;
pub mod addresses;
mod bits;
pub mod page_table;

extern crate alloc;

pub use crate::address_space::AddressSpace;
pub use crate::address_space::reservation::{
    AllocationTarget, Reservation, ReservationError, ReservationList,
};
pub use crate::bits::VirtualMemoryPageBits;
use crate::addresses::{PhysicalAddress, PhysicalPage, Size4K};
use crate::page_table::pd::PageDirectory;
use crate::page_table::pdpt::PageDirectoryPointerTable;
use crate::page_table::pml4::PageMapLevel4;
use crate::page_table::pt::PageTable;
use crate::addresses::{PageSize, VirtualPage};
use kernel_registers::LoadRegisterUnsafe;
use kernel_registers::cr3::Cr3;

/// Re-export constants as info module.
pub use kernel_info::memory as info;

/// Minimal frame allocator used to obtain **physical** 4 KiB frames
/// for page tables.
///
/// The implementation decides where frames come from (buddy allocator,
/// bootstrap bump pool, etc.). Returned frames **must** be 4 KiB aligned.
pub trait PhysFrameAlloc {
    /// Allocate one 4 KiB *physical* frame for page tables. Must return page-aligned frames.
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>>;

    /// Return a 4 KiB physical frame previously obtained from `alloc_4k`.
    fn free_4k(&mut self, page: PhysicalPage<Size4K>);
}

/// Converts physical addresses to *temporarily* usable pointers in the current
/// virtual address space (e.g., via a higher-half direct map, HHDM).
///
/// Typical patterns:
/// - **Loader**: often identity-maps low memory; returns direct pointers.
/// - **Kernel**: uses HHDM; adds a constant offset before returning a pointer.
///
/// # Safety
/// - You must ensure `pa` is mapped as writable in the current page tables
///   for `&mut T`.
/// - Lifetime `'a` is purely borrow-checked; the mapping must remain valid
///   for `'a`.
/// - Type `T` must match the bytes at `pa` (no aliasing UB).
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable pointer in the current address space.
    ///
    /// # Safety
    /// `pa` must be mapped as writable and `T` must match the data stored there.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

/// Table-typed convenience wrappers over [`PhysMapper::phys_to_mut`].
///
/// Blanket-implemented for every [`PhysMapper`] so callers can name the table
/// type they want instead of repeating the raw pointer cast at each call site.
pub trait PhysMapperExt: PhysMapper {
    /// Map the PML4 at `page` into a mutable reference.
    ///
    /// # Safety
    /// `page` must hold a valid, writable [`PageMapLevel4`].
    fn pml4_mut(&self, page: PhysicalPage<Size4K>) -> &mut PageMapLevel4 {
        unsafe { self.phys_to_mut(page.base()) }
    }

    /// Map the PDPT at `page` into a mutable reference.
    ///
    /// # Safety
    /// `page` must hold a valid, writable [`PageDirectoryPointerTable`].
    fn pdpt_mut(&self, page: PhysicalPage<Size4K>) -> &mut PageDirectoryPointerTable {
        unsafe { self.phys_to_mut(page.base()) }
    }

    /// Map the PD at `page` into a mutable reference.
    ///
    /// # Safety
    /// `page` must hold a valid, writable [`PageDirectory`].
    fn pd_mut(&self, page: PhysicalPage<Size4K>) -> &mut PageDirectory {
        unsafe { self.phys_to_mut(page.base()) }
    }

    /// Map the PT at `page` into a mutable reference.
    ///
    /// # Safety
    /// `page` must hold a valid, writable [`PageTable`].
    fn pt_mut(&self, page: PhysicalPage<Size4K>) -> &mut PageTable {
        unsafe { self.phys_to_mut(page.base()) }
    }

    /// Zero a freshly allocated frame that will be used as a PDPT.
    fn zero_pdpt(&self, page: PhysicalPage<Size4K>) {
        *self.pdpt_mut(page) = PageDirectoryPointerTable::zeroed();
    }

    /// Zero a freshly allocated frame that will be used as a PD.
    fn zero_pd(&self, page: PhysicalPage<Size4K>) {
        *self.pd_mut(page) = PageDirectory::zeroed();
    }

    /// Zero a freshly allocated frame that will be used as a PT.
    fn zero_pt(&self, page: PhysicalPage<Size4K>) {
        *self.pt_mut(page) = PageTable::zeroed();
    }
}

impl<M: PhysMapper> PhysMapperExt for M {}

/// Read the physical base address of the PML4 currently loaded in CR3.
///
/// # Safety
/// Reading CR3 requires Ring 0.
#[inline]
#[must_use]
pub unsafe fn read_cr3_phys() -> PhysicalAddress {
    let cr3 = unsafe { Cr3::load_unsafe() };
    cr3.pml4_phys()
}

/// Invalidate the TLB entry for `page` on the local CPU via `invlpg`.
///
/// Affects only the calling CPU and only the given page. Use after editing
/// the **currently active** page tables; other cores need a TLB shootdown.
///
/// # Safety
/// Requires Ring 0.
#[inline]
pub unsafe fn invalidate_tlb_page<S: PageSize>(page: VirtualPage<S>) {
    let va = page.base().as_u64();
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va, options(nostack, preserves_flags));
    }
}

/// Align `x` down to the nearest multiple of `a`.
///
/// This returns the greatest value `y <= x` such that `y % a == 0`.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two** (e.g., 1, 2, 4, 8, …).
///   These bit-trick formulas rely on that property.
/// - No additional constraints on `x`.
///
/// ### Notes
/// - If `x` is already aligned to `a`, it is returned unchanged.
/// - For non power-of-two `a`, the result is meaningless.
/// - This function does not perform runtime checks for performance reasons.
///
/// ### Examples
/// ```rust
/// # use kernel_vmem::align_down;
/// assert_eq!(align_down(0,      4096), 0);
/// assert_eq!(align_down(1,      4096), 0);
/// assert_eq!(align_down(4095,   4096), 0);
/// assert_eq!(align_down(4096,   4096), 4096);
/// assert_eq!(align_down(8191,   4096), 4096);
/// assert_eq!(align_down(0x12345,   16), 0x12340);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// This returns the smallest value `y >= x` such that `y % a == 0`.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two**.
/// - `x + (a - 1)` must **not overflow** `u64`.
///   In debug builds, overflow panics; in release, it wraps (yielding a wrong result).
///   If you need saturating behavior, handle that before calling.
///
/// ### Notes
/// - If `x` is already aligned to `a`, it is returned unchanged.
/// - This function does not perform runtime checks for performance reasons.
///
/// ### Examples
/// ```rust
/// # use kernel_vmem::align_up;
/// assert_eq!(align_up(0,       4096), 0);
/// assert_eq!(align_up(1,       4096), 4096);
/// assert_eq!(align_up(4095,    4096), 4096);
/// assert_eq!(align_up(4096,    4096), 4096);
/// assert_eq!(align_up(4097,    4096), 8192);
/// assert_eq!(align_up(0x12345,   16), 0x12350);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_space::AddressSpace;
    use crate::addresses::{Size1G, Size2M, VirtualAddress};
    use alloc::vec::Vec;

    /// A trivial **bump** allocator: always hands out the next 4 KiB frame.
    ///
    /// Only keeps a cursor (`next`) and "bumps" it by 4096 on each alloc.
    /// No free list, no reuse; good enough for tests and the boot stage.
    struct BumpAlloc {
        next: u64,
        end: u64,
    }

    impl BumpAlloc {
        fn new(start: u64, end: u64) -> Self {
            Self { next: start, end }
        }
    }

    impl PhysFrameAlloc for BumpAlloc {
        fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
            if self.next + 4096 > self.end {
                return None;
            }
            let p = self.next;
            self.next += 4096;
            Some(PhysicalPage::from_addr(PhysicalAddress::new(p)))
        }

        fn free_4k(&mut self, _page: PhysicalPage<Size4K>) {}
    }

    /// A 4 KiB-aligned raw frame, used as "physical RAM" backing store in tests.
    #[repr(align(4096))]
    struct Aligned4K(#[allow(dead_code)] [u8; 4096]);

    impl Aligned4K {
        fn new_zeroed() -> Self {
            Self([0u8; 4096])
        }
    }

    /// A tiny in-memory "RAM" plus an HHDM-style mapper.
    ///
    /// Physical memory is a vector of 4 KiB-aligned frames; physical addresses
    /// are simple byte offsets from 0.
    struct TestPhys {
        frames: Vec<Aligned4K>,
    }

    impl TestPhys {
        fn with_frames(n: usize) -> Self {
            let mut v = Vec::with_capacity(n);
            for _ in 0..n {
                v.push(Aligned4K::new_zeroed());
            }
            Self { frames: v }
        }

        fn frame_mut_ptr(&self, idx: usize) -> *mut u8 {
            &self.frames[idx] as *const Aligned4K as *mut u8
        }
    }

    impl PhysMapper for TestPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            let idx = (pa.as_u64() >> 12) as usize;
            let off = pa.as_u64() & 0xfff;
            debug_assert_eq!(off, 0);
            unsafe { &mut *(self.frame_mut_ptr(idx) as *mut T) }
        }
    }

    fn kernel_rw() -> VirtualMemoryPageBits {
        VirtualMemoryPageBits {
            present: true,
            writable: true,
            ..Default::default()
        }
    }

    /// Build a fresh, explicitly-rooted address space without touching CR3
    /// (real kernel code goes through `AddressSpace::new`, which also clones
    /// the upper half from the currently active PML4 — not meaningful here).
    fn fresh_aspace<'m>(
        phys: &'m TestPhys,
        alloc: &mut BumpAlloc,
    ) -> AddressSpace<'m, TestPhys> {
        let root_pa = alloc.alloc_4k().unwrap();
        unsafe {
            *phys.phys_to_mut::<PageMapLevel4>(root_pa.base()) = PageMapLevel4::zeroed();
        }
        AddressSpace::from_root(phys, root_pa)
    }

    #[test]
    fn map_one_4k_creates_tables_and_leaf() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(0, 64u64 << 12);
        let aspace = fresh_aspace(&phys, &mut alloc);

        let va = VirtualAddress::new(0xffff_8000_0000_0000);
        let pa = PhysicalAddress::new(0x0000_0000_0030_0000);

        aspace
            .map_one::<_, Size4K>(&mut alloc, va, pa, kernel_rw(), kernel_rw())
            .expect("map_one");

        assert_eq!(aspace.query(va), Some(pa));
    }

    #[test]
    fn map_one_2m_sets_ps_bit() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(0, 64u64 << 12);
        let aspace = fresh_aspace(&phys, &mut alloc);

        let va = VirtualAddress::new(0xffff_8000_2000_0000);
        let pa = PhysicalAddress::new(0x0000_0000_0400_0000);

        aspace
            .map_one::<_, Size2M>(&mut alloc, va, pa, kernel_rw(), kernel_rw())
            .expect("map_one");

        assert_eq!(aspace.query(va), Some(pa));
    }

    #[test]
    fn map_one_1g_sets_ps_bit() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(0, 64u64 << 12);
        let aspace = fresh_aspace(&phys, &mut alloc);

        let va = VirtualAddress::new(0x0000_4000_0000_0000);
        let pa = PhysicalAddress::new(0x0000_0000_4000_0000);

        aspace
            .map_one::<_, Size1G>(&mut alloc, va, pa, kernel_rw(), kernel_rw())
            .expect("map_one");

        assert_eq!(aspace.query(va), Some(pa));
    }

    #[test]
    fn map_region_tiles_with_huge_pages_then_unmap_region_clears_it() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(0, 64u64 << 12);
        let aspace = fresh_aspace(&phys, &mut alloc);

        let virt_start = VirtualAddress::new(0xffff_8000_0000_0000);
        let phys_start = PhysicalAddress::new(0);
        let len = Size2M::SIZE + Size4K::SIZE;

        aspace
            .map_region(&mut alloc, virt_start, phys_start, len, kernel_rw(), kernel_rw())
            .expect("map_region");

        // A 2 MiB leaf followed by a single trailing 4 KiB page.
        assert_eq!(aspace.query(virt_start), Some(phys_start));
        let tail_va = VirtualAddress::new(virt_start.as_u64() + Size2M::SIZE);
        let tail_pa = PhysicalAddress::new(phys_start.as_u64() + Size2M::SIZE);
        assert_eq!(aspace.query(tail_va), Some(tail_pa));

        aspace.unmap_region(virt_start, len);

        assert_eq!(aspace.query(virt_start), None);
        assert_eq!(aspace.query(tail_va), None);
    }

    #[test]
    fn unmap_one_rejects_huge_leaves_and_missing_mappings() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(0, 64u64 << 12);
        let aspace = fresh_aspace(&phys, &mut alloc);

        let va = VirtualAddress::new(0xffff_8000_2000_0000);
        let pa = PhysicalAddress::new(0x0000_0000_0400_0000);
        aspace
            .map_one::<_, Size2M>(&mut alloc, va, pa, kernel_rw(), kernel_rw())
            .expect("map_one");

        assert!(aspace.unmap_one(va).is_err());
        assert_eq!(aspace.query(va), Some(pa));

        let unmapped_va = VirtualAddress::new(0xffff_8000_4000_0000);
        assert!(aspace.unmap_one(unmapped_va).is_err());
    }
}
