//! # Buddy Physical Memory Manager (PMM)
//!
//! A fixed-region buddy allocator over 4 KiB physical frames, orders
//! `0..=MAX_ORDER` (4 KiB .. 4 MiB). Where [`crate::frame_alloc::BitmapFrameAlloc`]
//! tracks one used/free bit per frame, this allocator tracks eleven intrusive
//! free lists (one per order) threaded through the free blocks themselves, plus
//! a split bitmap recording whether a block at a given order is currently
//! divided into two children at the order below.
//!
//! ## Free lists
//!
//! Each free block's first eight bytes hold the physical address of the next
//! free block at the same order (or [`NONE`] at the end of the list), written
//! through a [`PhysMapper`] since frames are identified by physical address
//! and may not be currently mapped at any particular virtual address other
//! than via HHDM.
//!
//! ## Buddy address
//!
//! For an order-`k` block at physical address `pa`, its buddy sits at
//! `pa ^ (4096 << k)`. This only holds because every free block handed out by
//! [`BuddyFrameAlloc::add_region`] is aligned to its own order's size as an
//! *absolute* physical address, not merely relative to the tracked region's
//! base.
//!
//! ## Usage Example
//! ```rust
//! use kernel_alloc::buddy::BuddyFrameAlloc;
//! use kernel_alloc::phys_mapper::HhdmPhysMapper;
//! use kernel_vmem::PhysFrameAlloc;
//! use kernel_vmem::addresses::PhysicalAddress;
//!
//! let mut pmm = BuddyFrameAlloc::new(HhdmPhysMapper);
//! pmm.init_base(PhysicalAddress::new(0x0010_0000)).unwrap();
//! pmm.add_region(PhysicalAddress::new(0x0010_0000), 4 * 1024 * 1024).unwrap();
//! let frame = pmm.alloc_4k();
//! if let Some(page) = frame {
//!     pmm.free_4k(page);
//! }
//! ```

use kernel_vmem::addresses::{PhysicalAddress, PhysicalPage, Size4K};
use kernel_vmem::{PhysFrameAlloc, PhysMapper};

/// Highest order this allocator tracks. Order `k` covers `2^k` 4 KiB frames,
/// so `MAX_ORDER = 10` tops out at 4 MiB blocks.
pub const MAX_ORDER: usize = 10;

const FRAME_SIZE: u64 = 4096;

/// Size of the physical window this allocator can track, same as the region
/// size [`crate::frame_alloc::BitmapFrameAlloc`] uses.
const POOL_SIZE: u64 = 64 * 1024 * 1024;

const NUM_FRAMES: usize = (POOL_SIZE / FRAME_SIZE) as usize;
const SPLIT_WORDS: usize = NUM_FRAMES.div_ceil(64);

/// Sentinel "no next block" value. Not a valid frame address in any sane
/// memory map (the top byte would require > 16 EiB of physical memory).
const NONE: u64 = u64::MAX;

const fn order_size(order: usize) -> u64 {
    FRAME_SIZE << order
}

#[derive(Debug, thiserror::Error)]
pub enum PmmError {
    #[error("no free block at or above the requested order")]
    OutOfMemory,
    #[error("misaligned size/address or out-of-range order")]
    InvalidArgument,
    #[error("buddy free-list/split-bitmap inconsistency")]
    Corruption,
}

/// Fixed-region buddy allocator, orders `0..=MAX_ORDER`.
pub struct BuddyFrameAlloc<M: PhysMapper> {
    mapper: M,
    free_heads: [u64; MAX_ORDER + 1],
    split_bits: [[u64; SPLIT_WORDS]; MAX_ORDER],
    base: u64,
    initialized: bool,
}

impl<M: PhysMapper> BuddyFrameAlloc<M> {
    #[must_use]
    pub const fn new(mapper: M) -> Self {
        Self {
            mapper,
            free_heads: [NONE; MAX_ORDER + 1],
            split_bits: [[0; SPLIT_WORDS]; MAX_ORDER],
            base: 0,
            initialized: false,
        }
    }

    /// Fix the base of the `POOL_SIZE`-byte window this allocator tracks.
    /// Must be called once, before the first [`Self::add_region`].
    pub fn init_base(&mut self, base: PhysicalAddress) -> Result<(), PmmError> {
        if base.as_u64() % FRAME_SIZE != 0 {
            return Err(PmmError::InvalidArgument);
        }
        self.base = base.as_u64();
        self.initialized = true;
        Ok(())
    }

    /// Window this allocator tracks, as `[base, base + POOL_SIZE)`. Useful
    /// for clipping a boot memory map's runs before calling
    /// [`Self::add_region`].
    #[must_use]
    pub fn window(&self) -> (u64, u64) {
        (self.base, self.base + POOL_SIZE)
    }

    /// Register a free physical range, carving it into maximal order-aligned
    /// blocks and pushing each onto its free list.
    ///
    /// Must fall within `[base, base + POOL_SIZE)` (see [`Self::init_base`]).
    pub fn add_region(&mut self, pa: PhysicalAddress, len: u64) -> Result<(), PmmError> {
        if !self.initialized {
            return Err(PmmError::InvalidArgument);
        }
        if pa.as_u64() % FRAME_SIZE != 0 || len % FRAME_SIZE != 0 {
            return Err(PmmError::InvalidArgument);
        }
        let end = pa
            .as_u64()
            .checked_add(len)
            .ok_or(PmmError::InvalidArgument)?;
        if pa.as_u64() < self.base || end > self.base + POOL_SIZE {
            return Err(PmmError::InvalidArgument);
        }

        let mut start = pa.as_u64();
        while start < end {
            let mut order = MAX_ORDER;
            while order > 0 && (start % order_size(order) != 0 || start + order_size(order) > end)
            {
                order -= 1;
            }
            self.push_free(order, start);
            start += order_size(order);
        }
        Ok(())
    }

    /// Allocate one `2^order` contiguous 4 KiB frames, splitting a larger
    /// block down if no block of exactly `order` is free.
    pub fn alloc_pages(&mut self, order: usize) -> Result<PhysicalAddress, PmmError> {
        if order > MAX_ORDER {
            return Err(PmmError::InvalidArgument);
        }

        let mut k = order;
        while k <= MAX_ORDER && self.free_heads[k] == NONE {
            k += 1;
        }
        if k > MAX_ORDER {
            return Err(PmmError::OutOfMemory);
        }

        let mut block = self.pop_free(k).ok_or(PmmError::Corruption)?;
        while k > order {
            k -= 1;
            let buddy = block ^ order_size(k);
            self.push_free(k, buddy);
            self.set_split(k + 1, block, true);
        }
        Ok(PhysicalAddress::new(block))
    }

    /// Return a `2^order` block previously obtained from [`Self::alloc_pages`],
    /// coalescing with its buddy (and recursively upward) whenever the buddy
    /// is wholly free.
    pub fn free_pages(&mut self, pa: PhysicalAddress, order: usize) -> Result<(), PmmError> {
        if order > MAX_ORDER {
            return Err(PmmError::InvalidArgument);
        }
        let mut addr = pa.as_u64();
        if addr % order_size(order) != 0 {
            return Err(PmmError::InvalidArgument);
        }

        let mut k = order;
        while k < MAX_ORDER {
            let buddy = addr ^ order_size(k);
            if self.remove_free(k, buddy) {
                let parent = addr.min(buddy);
                self.set_split(k + 1, parent, false);
                addr = parent;
                k += 1;
            } else {
                break;
            }
        }
        self.push_free(k, addr);
        Ok(())
    }

    /// Full-walk auditor: every free-list entry sits at its own order's
    /// alignment, and no order holds two buddies free simultaneously (they
    /// should have coalesced). Intended for debug builds, not the hot path.
    #[must_use]
    pub fn audit(&self) -> Result<(), PmmError> {
        for order in 0..=MAX_ORDER {
            let mut seen: [u64; 2048] = [NONE; 2048];
            let mut count = 0usize;
            let mut cur = self.free_heads[order];
            while cur != NONE {
                if cur % order_size(order) != 0 {
                    return Err(PmmError::Corruption);
                }
                if count >= seen.len() {
                    break;
                }
                seen[count] = cur;
                count += 1;
                cur = unsafe { *self.mapper.phys_to_mut::<u64>(PhysicalAddress::new(cur)) };
            }
            for i in 0..count {
                let buddy = seen[i] ^ order_size(order);
                if seen[..count].contains(&buddy) {
                    return Err(PmmError::Corruption);
                }
            }
        }
        Ok(())
    }

    fn push_free(&mut self, order: usize, pa: u64) {
        let head = self.free_heads[order];
        unsafe {
            *self.mapper.phys_to_mut::<u64>(PhysicalAddress::new(pa)) = head;
        }
        self.free_heads[order] = pa;
    }

    fn pop_free(&mut self, order: usize) -> Option<u64> {
        let head = self.free_heads[order];
        if head == NONE {
            return None;
        }
        let next = unsafe { *self.mapper.phys_to_mut::<u64>(PhysicalAddress::new(head)) };
        self.free_heads[order] = next;
        Some(head)
    }

    /// Scan-and-unlink a specific block out of order `order`'s free list.
    /// Returns whether it was found (and thus removed).
    fn remove_free(&mut self, order: usize, pa: u64) -> bool {
        let mut prev: Option<u64> = None;
        let mut cur = self.free_heads[order];
        while cur != NONE {
            let next = unsafe { *self.mapper.phys_to_mut::<u64>(PhysicalAddress::new(cur)) };
            if cur == pa {
                match prev {
                    None => self.free_heads[order] = next,
                    Some(p) => unsafe {
                        *self.mapper.phys_to_mut::<u64>(PhysicalAddress::new(p)) = next;
                    },
                }
                return true;
            }
            prev = Some(cur);
            cur = next;
        }
        false
    }

    fn split_bit_index(&self, parent_order: usize, pa: u64) -> (usize, u32) {
        let frame = (pa - self.base) / FRAME_SIZE;
        let block = frame >> parent_order;
        ((block / 64) as usize, (block % 64) as u32)
    }

    fn set_split(&mut self, parent_order: usize, pa: u64, split: bool) {
        let (word, bit) = self.split_bit_index(parent_order, pa);
        let row = &mut self.split_bits[parent_order - 1][word];
        if split {
            *row |= 1 << bit;
        } else {
            *row &= !(1 << bit);
        }
    }
}

impl<M: PhysMapper> PhysFrameAlloc for BuddyFrameAlloc<M> {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.alloc_pages(0).ok().map(PhysicalPage::from_addr)
    }

    fn free_4k(&mut self, page: PhysicalPage<Size4K>) {
        let _ = self.free_pages(page.base(), 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The free lists are threaded through the blocks themselves via
    // `PhysMapper`, so a host test just needs a backing buffer big enough to
    // stand in for the tracked physical window and a mapper that treats a
    // "physical address" as an offset into it.
    struct HostPhysMapper {
        backing: Box<[u8]>,
        base: u64,
    }

    impl HostPhysMapper {
        fn new(base: u64, len: u64) -> Self {
            Self {
                backing: vec![0u8; len as usize].into_boxed_slice(),
                base,
            }
        }
    }

    impl PhysMapper for HostPhysMapper {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            let off = (pa.as_u64() - self.base) as usize;
            unsafe { &mut *(self.backing.as_ptr().add(off) as *mut T) }
        }
    }

    fn new_pmm(window_base: u64) -> BuddyFrameAlloc<HostPhysMapper> {
        let mut pmm = BuddyFrameAlloc::new(HostPhysMapper::new(window_base, POOL_SIZE));
        pmm.init_base(PhysicalAddress::new(window_base)).unwrap();
        pmm
    }

    fn free_list_len(pmm: &BuddyFrameAlloc<HostPhysMapper>, order: usize) -> usize {
        let mut n = 0;
        let mut cur = pmm.free_heads[order];
        while cur != NONE {
            n += 1;
            cur = unsafe { *pmm.mapper.phys_to_mut::<u64>(PhysicalAddress::new(cur)) };
        }
        n
    }

    #[test]
    fn single_page_alloc_splits_every_order_above_zero() {
        let base = 0x0010_0000u64;
        let mut pmm = new_pmm(base);
        pmm.add_region(PhysicalAddress::new(base), 4 * 1024 * 1024)
            .unwrap();
        assert_eq!(free_list_len(&pmm, MAX_ORDER), 1);

        let page = pmm.alloc_pages(0).unwrap();
        assert_eq!(page.as_u64(), base);

        // One order-0 block taken; its buddy was pushed back down at every
        // order from MAX_ORDER - 1 down to 0, so lists 1..=MAX_ORDER-1 each
        // hold exactly one free block and MAX_ORDER is now empty.
        for order in 1..MAX_ORDER {
            assert_eq!(free_list_len(&pmm, order), 1, "order {order}");
        }
        assert_eq!(free_list_len(&pmm, MAX_ORDER), 0);
        assert_eq!(free_list_len(&pmm, 0), 0);
        assert!(pmm.audit().is_ok());

        pmm.free_pages(page, 0).unwrap();

        // Freeing the only allocation should coalesce all the way back up.
        for order in 0..MAX_ORDER {
            assert_eq!(free_list_len(&pmm, order), 0, "order {order}");
        }
        assert_eq!(free_list_len(&pmm, MAX_ORDER), 1);
        assert!(pmm.audit().is_ok());
    }

    #[test]
    fn out_of_memory_when_no_list_has_room() {
        let base = 0x0020_0000u64;
        let mut pmm = new_pmm(base);
        pmm.add_region(PhysicalAddress::new(base), 4096).unwrap();
        assert!(pmm.alloc_pages(0).is_ok());
        assert!(matches!(pmm.alloc_pages(0), Err(PmmError::OutOfMemory)));
    }

    #[test]
    fn rejects_misaligned_region() {
        let base = 0x0030_0000u64;
        let mut pmm = new_pmm(base);
        assert!(matches!(
            pmm.add_region(PhysicalAddress::new(base + 1), 4096),
            Err(PmmError::InvalidArgument)
        ));
    }
}
