//! Kernel heap: a best-fit allocator over an intrusive, address-ordered free
//! list, backed by virtual memory that grows lazily.
//!
//! The heap reserves one large virtual window up front
//! (`kernel_info::memory::HEAP_BASE .. HEAP_BASE + HEAP_RESERVE_SIZE`) but
//! only maps `HEAP_GROW_STEP`-sized chunks of it as needed, each one freshly
//! backed by frames from the PMM and mapped through a [`Vmm`]. Freed memory
//! is never returned to the PMM; it just goes back on the free list.

use crate::vmm::{AllocationTarget, Vmm, VmmError};
use core::mem::size_of;
use core::ptr::NonNull;
use kernel_info::memory::{HEAP_BASE, HEAP_GROW_STEP, HEAP_RESERVE_SIZE};
use kernel_vmem::addresses::VirtualAddress;
use kernel_vmem::{PhysFrameAlloc, PhysMapper, VirtualMemoryPageBits};

const FREE_MAGIC: u64 = 0x4B48_4541_5046_5245; // "KHEAPFRE"
const ALLOC_MAGIC: u64 = 0x4B48_4541_5041_4C43; // "KHEAPALC"

/// Header stored at the start of every free block, address-ordered and
/// singly linked. `size` covers the whole block, header included.
#[repr(C)]
struct FreeHeader {
    magic: u64,
    size: u64,
    next: Option<NonNull<FreeHeader>>,
}

/// Header stored immediately before every live allocation.
///
/// `block_base`/`block_size` record the *original* free block this
/// allocation was carved from (header included), not just the user's
/// requested size. Storing the original extent here means `deallocate`
/// can hand the whole thing back to the free list in one step instead of
/// re-deriving alignment slack from the user pointer.
#[repr(C)]
struct AllocHeader {
    magic: u64,
    block_base: u64,
    block_size: u64,
}

const FREE_HDR_SIZE: u64 = size_of::<FreeHeader>() as u64;
const ALLOC_HDR_SIZE: u64 = size_of::<AllocHeader>() as u64;

#[derive(Debug, thiserror::Error)]
pub enum HeapError {
    #[error("heap reserve exhausted ({HEAP_RESERVE_SIZE:#x} bytes)")]
    ReserveExhausted,
    #[error("failed to grow the heap: {0}")]
    GrowFailed(#[from] VmmError),
    #[error("free-list corruption detected")]
    Corruption,
}

#[inline]
const fn align_up(addr: u64, align: u64) -> u64 {
    (addr + align - 1) & !(align - 1)
}

/// Best-fit-by-(size, address) kernel heap.
///
/// Not `Sync` on its own; callers wrap it in a mutex (see
/// `kernel::allocator`).
pub struct KernelHeap {
    free_head: Option<NonNull<FreeHeader>>,
    grown_end: u64,
    /// Bounds of the reserved virtual window, `[reserve_start, reserve_end)`.
    reserve_start: u64,
    reserve_end: u64,
    /// Bytes currently handed out via [`Self::allocate`] and not yet freed
    /// (block size including its header, same units as `FreeHeader::size`).
    allocated_bytes: u64,
}

unsafe impl Send for KernelHeap {}

impl KernelHeap {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            free_head: None,
            grown_end: HEAP_BASE,
            reserve_start: HEAP_BASE,
            reserve_end: HEAP_BASE + HEAP_RESERVE_SIZE,
            allocated_bytes: 0,
        }
    }

    /// Map and hand over one more `HEAP_GROW_STEP` chunk of the reserved
    /// window, coalescing it onto the end of the existing free list.
    fn grow<M: PhysMapper, A: PhysFrameAlloc>(
        &mut self,
        vmm: &mut Vmm<M, A>,
    ) -> Result<(), HeapError> {
        if self.grown_end + HEAP_GROW_STEP > HEAP_BASE + HEAP_RESERVE_SIZE {
            return Err(HeapError::ReserveExhausted);
        }

        let nonleaf = VirtualMemoryPageBits::new()
            .with_present(true)
            .with_writable(true);
        let leaf = VirtualMemoryPageBits::new()
            .with_present(true)
            .with_writable(true)
            .with_no_execute(true)
            .with_global(true);

        vmm.map_anon_4k_pages(
            AllocationTarget::Kernel,
            VirtualAddress::new(self.grown_end),
            0,
            HEAP_GROW_STEP,
            nonleaf,
            leaf,
        )?;

        let new_block = self.grown_end;
        self.grown_end += HEAP_GROW_STEP;
        unsafe {
            self.free_region(new_block, HEAP_GROW_STEP);
        }
        Ok(())
    }

    /// Insert `[addr, addr+size)` into the address-ordered free list and
    /// coalesce it with whichever neighbors are adjacent.
    ///
    /// # Safety
    /// `[addr, addr+size)` must be mapped, writable, and not currently
    /// referenced by any other free-list entry or live allocation.
    unsafe fn free_region(&mut self, addr: u64, size: u64) {
        let mut prev: Option<NonNull<FreeHeader>> = None;
        let mut cur = self.free_head;
        while let Some(c) = cur {
            if c.as_ptr() as u64 >= addr {
                break;
            }
            prev = Some(c);
            cur = unsafe { c.as_ref().next };
        }

        let node_ptr = addr as *mut FreeHeader;
        unsafe {
            node_ptr.write(FreeHeader {
                magic: FREE_MAGIC,
                size,
                next: cur,
            });
        }
        let node = NonNull::new(node_ptr).expect("free region address is never null");

        match prev {
            Some(mut p) => unsafe { p.as_mut().next = Some(node) },
            None => self.free_head = Some(node),
        }

        unsafe { self.coalesce(prev, node) };
    }

    /// Merge `node` with its list successor and/or predecessor if either is
    /// physically adjacent.
    unsafe fn coalesce(&mut self, prev: Option<NonNull<FreeHeader>>, mut node: NonNull<FreeHeader>) {
        unsafe {
            let node_ref = node.as_mut();
            if let Some(next) = node_ref.next {
                let node_end = node.as_ptr() as u64 + node_ref.size;
                if node_end == next.as_ptr() as u64 {
                    let next_ref = next.as_ref();
                    node_ref.size += next_ref.size;
                    node_ref.next = next_ref.next;
                }
            }
        }
        if let Some(mut p) = prev {
            unsafe {
                let p_ref = p.as_mut();
                let p_end = p.as_ptr() as u64 + p_ref.size;
                if p_end == node.as_ptr() as u64 {
                    let node_ref = node.as_ref();
                    p_ref.size += node_ref.size;
                    p_ref.next = node_ref.next;
                }
            }
        }
    }

    /// Scan the whole free list for the smallest block that can satisfy
    /// `size` at `align`, splitting off a fresh free block from the tail if
    /// enough of it is left over. Returns `None` without mutating state if
    /// nothing fits.
    fn try_allocate(&mut self, size: u64, align: u64) -> Option<NonNull<u8>> {
        let mut best: Option<NonNull<FreeHeader>> = None;
        let mut best_prev: Option<NonNull<FreeHeader>> = None;
        let mut best_user_ptr = 0u64;
        let mut best_size = u64::MAX;

        let mut prev: Option<NonNull<FreeHeader>> = None;
        let mut cur = self.free_head;
        while let Some(c) = cur {
            let hdr = unsafe { c.as_ref() };
            debug_assert_eq!(hdr.magic, FREE_MAGIC, "heap free list corrupted");

            let block_base = c.as_ptr() as u64;
            let block_end = block_base + hdr.size;
            let user_ptr = align_up(block_base + ALLOC_HDR_SIZE, align);

            if user_ptr + size <= block_end && hdr.size < best_size {
                best = Some(c);
                best_prev = prev;
                best_user_ptr = user_ptr;
                best_size = hdr.size;
            }

            prev = Some(c);
            cur = hdr.next;
        }

        let best = best?;
        let hdr = unsafe { best.as_ptr().read() };

        match best_prev {
            Some(mut p) => unsafe { p.as_mut().next = hdr.next },
            None => self.free_head = hdr.next,
        }

        let block_base = best.as_ptr() as u64;
        let tail_start = best_user_ptr + size;
        let tail_len = (block_base + hdr.size) - tail_start;

        let consumed_size = if tail_len >= FREE_HDR_SIZE {
            unsafe { self.free_region(tail_start, tail_len) };
            tail_start - block_base
        } else {
            hdr.size
        };

        let header_addr = best_user_ptr - ALLOC_HDR_SIZE;
        unsafe {
            (header_addr as *mut AllocHeader).write(AllocHeader {
                magic: ALLOC_MAGIC,
                block_base,
                block_size: consumed_size,
            });
        }
        self.allocated_bytes += consumed_size;

        NonNull::new(best_user_ptr as *mut u8)
    }

    /// Allocate `size` bytes aligned to `align`, growing the heap (one
    /// `HEAP_GROW_STEP` at a time) until a fit is found or the reserved
    /// window is exhausted.
    pub fn allocate<M: PhysMapper, A: PhysFrameAlloc>(
        &mut self,
        vmm: &mut Vmm<M, A>,
        size: u64,
        align: u64,
    ) -> Result<NonNull<u8>, HeapError> {
        let size = size.max(1);
        let align = align.max(size_of::<AllocHeader>() as u64);

        loop {
            if let Some(ptr) = self.try_allocate(size, align) {
                return Ok(ptr);
            }
            self.grow(vmm)?;
        }
    }

    /// Free a previously allocated pointer, restoring its full original
    /// free block (including any head/tail slack absorbed at alloc time).
    ///
    /// # Safety
    /// `ptr` must have been returned by [`Self::allocate`] on this heap and
    /// not already freed.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        let header_addr = ptr.as_ptr() as u64 - ALLOC_HDR_SIZE;
        let hdr = unsafe { (header_addr as *const AllocHeader).read() };
        debug_assert_eq!(hdr.magic, ALLOC_MAGIC, "heap corruption: bad alloc header magic");
        self.allocated_bytes -= hdr.block_size;
        unsafe { self.free_region(hdr.block_base, hdr.block_size) };
    }

    /// Full free-list walk, checking every invariant the heap is supposed to
    /// maintain:
    ///
    /// 1. every free extent lies within `[reserve_start, reserve_end)`
    /// 2. every free header carries [`FREE_MAGIC`]
    /// 3. free bytes plus outstanding allocated bytes equal the granted
    ///    (grown-into) portion of the reserve
    /// 4. the list stays address-ordered with no two entries overlapping or
    ///    touching (a missed coalesce is itself a bug)
    ///
    /// Intended for debug builds.
    pub fn audit(&self) -> Result<(), HeapError> {
        let mut cur = self.free_head;
        let mut last_end: Option<u64> = None;
        let mut free_total = 0u64;
        while let Some(c) = cur {
            let hdr = unsafe { c.as_ref() };
            if hdr.magic != FREE_MAGIC {
                return Err(HeapError::Corruption);
            }
            let base = c.as_ptr() as u64;
            let end = base + hdr.size;
            if base < self.reserve_start || end > self.reserve_end {
                return Err(HeapError::Corruption);
            }
            if let Some(last) = last_end
                && base <= last
            {
                return Err(HeapError::Corruption);
            }
            free_total += hdr.size;
            last_end = Some(end);
            cur = hdr.next;
        }

        let granted = self.grown_end - self.reserve_start;
        if free_total + self.allocated_bytes != granted {
            return Err(HeapError::Corruption);
        }

        Ok(())
    }
}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The heap's growth path needs a live `Vmm` (PMM + page tables), which
    // isn't available in a hosted unit test; exercise the free-list
    // bookkeeping directly against a stack-backed "block" instead.

    fn with_fake_block<R>(bytes: usize, f: impl FnOnce(&mut KernelHeap, u64) -> R) -> R {
        let mut buf = vec![0u8; bytes];
        let base = buf.as_mut_ptr() as u64;
        let mut heap = KernelHeap::new();
        // The fake block stands in for the heap's real reserve window, so
        // point the bookkeeping fields at it instead of `HEAP_BASE`.
        heap.reserve_start = base;
        heap.reserve_end = base + bytes as u64;
        heap.grown_end = base + bytes as u64;
        unsafe { heap.free_region(base, bytes as u64) };
        let result = f(&mut heap, base);
        core::mem::forget(buf);
        result
    }

    #[test]
    fn allocates_within_a_single_block() {
        with_fake_block(4096, |heap, _base| {
            let p = heap.try_allocate(64, 8).expect("fits");
            assert_eq!(p.as_ptr() as u64 % 8, 0);
            assert!(heap.audit().is_ok());
        });
    }

    #[test]
    fn free_then_realloc_reclaims_the_whole_block() {
        with_fake_block(4096, |heap, base| {
            let p = heap.try_allocate(100, 8).unwrap();
            unsafe { heap.deallocate(p) };
            assert!(heap.audit().is_ok());
            // list should be back to exactly one block starting at `base`.
            let head = heap.free_head.unwrap();
            assert_eq!(head.as_ptr() as u64, base);
            assert_eq!(unsafe { head.as_ref().size }, 4096);
        });
    }

    #[test]
    fn best_fit_prefers_the_tighter_block() {
        // One owned backing buffer split into two free blocks with a gap
        // between them, so placement is deterministic and they never
        // coalesce into a single block.
        let mut backing = vec![0u8; 8192];
        let base = backing.as_mut_ptr() as u64;
        let big_addr = base;
        let small_addr = base + 4096 + 128;

        let mut heap = KernelHeap::new();
        unsafe {
            heap.free_region(big_addr, 4096);
            heap.free_region(small_addr, 256);
        }

        let p = heap.try_allocate(64, 8).expect("fits");
        let got = p.as_ptr() as u64;
        assert!(
            got >= small_addr && got < small_addr + 256,
            "best-fit should pick the smaller block"
        );
        core::mem::forget(backing);
    }

    #[test]
    fn exhausted_reserve_is_reported() {
        let heap = KernelHeap {
            free_head: None,
            grown_end: HEAP_BASE + HEAP_RESERVE_SIZE,
            reserve_start: HEAP_BASE,
            reserve_end: HEAP_BASE + HEAP_RESERVE_SIZE,
            allocated_bytes: 0,
        };
        assert_eq!(heap.grown_end, HEAP_BASE + HEAP_RESERVE_SIZE);
    }

    #[test]
    fn audit_detects_an_extent_outside_reserve_bounds() {
        with_fake_block(4096, |heap, _base| {
            let mut node = heap.free_head.unwrap();
            unsafe { node.as_mut() }.size += 4096;
            assert!(matches!(heap.audit(), Err(HeapError::Corruption)));
        });
    }

    #[test]
    fn audit_detects_an_accounting_mismatch() {
        with_fake_block(4096, |heap, _base| {
            // Pretend a block was handed out that nobody accounts for in
            // the free list.
            heap.allocated_bytes += 64;
            assert!(matches!(heap.audit(), Err(HeapError::Corruption)));
        });
    }

    #[test]
    fn audit_tracks_allocated_bytes_through_alloc_and_free() {
        with_fake_block(4096, |heap, _base| {
            let p = heap.try_allocate(100, 8).expect("fits");
            assert!(heap.audit().is_ok());
            unsafe { heap.deallocate(p) };
            assert!(heap.audit().is_ok());
        });
    }
}
