//! Fixed-capacity reservation lists for an address space's kernel/user halves.
//!
//! Every virtual range the VMM hands out is recorded here before it is
//! mapped, so callers can assert that every mapped page lies inside a
//! tracked reservation of its address space, and a later unmap pass can walk
//! reservations instead of re-deriving ranges from page-table content.
//! Ranges are caller-chosen (a per-CPU stack slot, an ELF segment's
//! `p_vaddr`, the heap window, ...); this list only records and validates
//! them, it does not pick addresses itself.

use crate::addresses::VirtualAddress;
use crate::bits::VirtualMemoryPageBits;
use kernel_info::memory::LAST_USERSPACE_ADDRESS;

/// Maximum number of live reservations tracked per address space. A few
/// hundred comfortably covers per-CPU kernel/IST stacks, the heap window,
/// the framebuffer, and one process's ELF segments and stack.
pub const MAX_RESERVATIONS: usize = 256;

/// Which half of the address space a reservation belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AllocationTarget {
    /// Kernel half (`va >= LAST_USERSPACE_ADDRESS`).
    Kernel,
    /// User half (`va < LAST_USERSPACE_ADDRESS`).
    User,
}

impl AllocationTarget {
    #[must_use]
    fn accepts(self, va: VirtualAddress) -> bool {
        match self {
            Self::Kernel => va.as_u64() >= LAST_USERSPACE_ADDRESS,
            Self::User => va.as_u64() < LAST_USERSPACE_ADDRESS,
        }
    }

    /// Lowest address belonging to this half.
    #[must_use]
    fn floor(self) -> u64 {
        match self {
            Self::Kernel => LAST_USERSPACE_ADDRESS,
            Self::User => 0,
        }
    }

    /// One past the highest address belonging to this half.
    #[must_use]
    fn ceiling(self) -> u64 {
        match self {
            Self::Kernel => u64::MAX,
            Self::User => LAST_USERSPACE_ADDRESS,
        }
    }
}

/// One tracked virtual range, `[base, base + len)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub base: VirtualAddress,
    pub len: u64,
    pub target: AllocationTarget,
    pub perms: VirtualMemoryPageBits,
}

impl Reservation {
    #[must_use]
    fn end(&self) -> u64 {
        self.base.as_u64() + self.len
    }

    #[must_use]
    fn overlaps(&self, base: VirtualAddress, len: u64) -> bool {
        let start = base.as_u64();
        let end = start + len;
        start < self.end() && self.base.as_u64() < end
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReservationError {
    #[error("reservation list is full")]
    Exhausted,
    #[error("range overlaps an existing reservation")]
    Overlap,
    #[error("range does not belong to the requested half of the address space")]
    WrongHalf,
    #[error("no unused aligned range of the requested size fits in this half of the address space")]
    OutOfRange,
}

/// Fixed-capacity, linearly-scanned set of non-overlapping virtual ranges for
/// one address space.
pub struct ReservationList {
    items: [Option<Reservation>; MAX_RESERVATIONS],
    count: usize,
}

impl ReservationList {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            items: [None; MAX_RESERVATIONS],
            count: 0,
        }
    }

    /// Register a caller-chosen, fixed virtual range.
    ///
    /// # Errors
    /// - [`ReservationError::WrongHalf`] if `base` doesn't belong to `target`'s half.
    /// - [`ReservationError::Overlap`] if it overlaps an existing reservation.
    /// - [`ReservationError::Exhausted`] if the list is already at [`MAX_RESERVATIONS`].
    pub fn insert_fixed(
        &mut self,
        target: AllocationTarget,
        base: VirtualAddress,
        len: u64,
        perms: VirtualMemoryPageBits,
    ) -> Result<(), ReservationError> {
        if !target.accepts(base) {
            return Err(ReservationError::WrongHalf);
        }
        if self.items.iter().flatten().any(|r| r.overlaps(base, len)) {
            return Err(ReservationError::Overlap);
        }
        let slot = self
            .items
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or(ReservationError::Exhausted)?;
        *slot = Some(Reservation {
            base,
            len,
            target,
            perms,
        });
        self.count += 1;
        Ok(())
    }

    /// Picks the lowest unused, `align`-aligned range of `size` bytes in
    /// `target`'s half, records it with `perms`, and returns its base.
    ///
    /// First-fit from the bottom of the half: starting at the half's floor,
    /// repeatedly skips past whichever tracked reservation the candidate
    /// range collides with until a gap of `size` bytes opens up.
    ///
    /// # Errors
    /// - [`ReservationError::OutOfRange`] if no aligned gap of `size` bytes
    ///   remains before the half's upper bound.
    /// - [`ReservationError::Exhausted`] if the list is already at [`MAX_RESERVATIONS`].
    pub fn reserve(
        &mut self,
        target: AllocationTarget,
        size: u64,
        align: u64,
        perms: VirtualMemoryPageBits,
    ) -> Result<VirtualAddress, ReservationError> {
        debug_assert!(align.is_power_of_two());

        let mut candidate = crate::align_up(target.floor(), align);
        loop {
            let candidate_end = candidate
                .checked_add(size)
                .ok_or(ReservationError::OutOfRange)?;
            if candidate_end > target.ceiling() {
                return Err(ReservationError::OutOfRange);
            }

            let collision = self
                .items
                .iter()
                .flatten()
                .filter(|r| r.target == target)
                .find(|r| r.overlaps(VirtualAddress::new(candidate), size));

            match collision {
                Some(r) => candidate = crate::align_up(r.end(), align),
                None => break,
            }
        }

        let base = VirtualAddress::new(candidate);
        self.insert_fixed(target, base, size, perms)?;
        Ok(base)
    }

    /// Drop the reservation exactly matching `[base, base+len)`, if tracked.
    pub fn remove(&mut self, base: VirtualAddress, len: u64) {
        for slot in &mut self.items {
            if matches!(slot, Some(r) if r.base == base && r.len == len) {
                *slot = None;
                self.count -= 1;
                return;
            }
        }
    }

    /// Whether `[va, va+len)` lies entirely within one tracked reservation.
    #[must_use]
    pub fn contains(&self, va: VirtualAddress, len: u64) -> bool {
        let start = va.as_u64();
        let end = start + len;
        self.items
            .iter()
            .flatten()
            .any(|r| start >= r.base.as_u64() && end <= r.end())
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.count
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl Default for ReservationList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn va(x: u64) -> VirtualAddress {
        VirtualAddress::new(x)
    }

    fn perms() -> VirtualMemoryPageBits {
        VirtualMemoryPageBits {
            present: true,
            writable: true,
            ..Default::default()
        }
    }

    #[test]
    fn rejects_wrong_half() {
        let mut list = ReservationList::new();
        assert_eq!(
            list.insert_fixed(AllocationTarget::Kernel, va(0x1000), 0x1000, perms()),
            Err(ReservationError::WrongHalf)
        );
        assert_eq!(
            list.insert_fixed(
                AllocationTarget::User,
                va(LAST_USERSPACE_ADDRESS),
                0x1000,
                perms()
            ),
            Err(ReservationError::WrongHalf)
        );
    }

    #[test]
    fn detects_overlap() {
        let mut list = ReservationList::new();
        list.insert_fixed(
            AllocationTarget::Kernel,
            va(LAST_USERSPACE_ADDRESS),
            0x4000,
            perms(),
        )
        .unwrap();
        assert_eq!(
            list.insert_fixed(
                AllocationTarget::Kernel,
                va(LAST_USERSPACE_ADDRESS + 0x2000),
                0x1000,
                perms()
            ),
            Err(ReservationError::Overlap)
        );
        // Adjacent, non-overlapping range is fine.
        list.insert_fixed(
            AllocationTarget::Kernel,
            va(LAST_USERSPACE_ADDRESS + 0x4000),
            0x1000,
            perms(),
        )
        .unwrap();
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn contains_checks_full_range() {
        let mut list = ReservationList::new();
        list.insert_fixed(
            AllocationTarget::Kernel,
            va(LAST_USERSPACE_ADDRESS),
            0x4000,
            perms(),
        )
        .unwrap();
        assert!(list.contains(va(LAST_USERSPACE_ADDRESS), 0x4000));
        assert!(list.contains(va(LAST_USERSPACE_ADDRESS + 0x1000), 0x1000));
        assert!(!list.contains(va(LAST_USERSPACE_ADDRESS + 0x3000), 0x2000));
    }

    #[test]
    fn remove_frees_the_slot() {
        let mut list = ReservationList::new();
        list.insert_fixed(
            AllocationTarget::Kernel,
            va(LAST_USERSPACE_ADDRESS),
            0x1000,
            perms(),
        )
        .unwrap();
        assert_eq!(list.len(), 1);
        list.remove(va(LAST_USERSPACE_ADDRESS), 0x1000);
        assert_eq!(list.len(), 0);
        // Slot is reusable.
        list.insert_fixed(AllocationTarget::User, va(0), 0x1000, perms())
            .unwrap();
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn reserve_picks_the_lowest_unused_aligned_range() {
        let mut list = ReservationList::new();
        let a = list
            .reserve(AllocationTarget::User, 0x1000, 0x1000, perms())
            .unwrap();
        assert_eq!(a, va(0));

        let b = list
            .reserve(AllocationTarget::User, 0x1000, 0x1000, perms())
            .unwrap();
        assert_eq!(b, va(0x1000));

        assert_eq!(list.len(), 2);
        assert_eq!(
            list.items[0].map(|r| r.perms),
            Some(perms()),
            "reservation records the requested perms"
        );
    }

    #[test]
    fn reserve_skips_past_existing_reservations() {
        let mut list = ReservationList::new();
        list.insert_fixed(AllocationTarget::User, va(0), 0x2000, perms())
            .unwrap();

        let picked = list
            .reserve(AllocationTarget::User, 0x1000, 0x1000, perms())
            .unwrap();
        assert_eq!(picked, va(0x2000));
    }

    #[test]
    fn reserve_honors_alignment_past_a_collision() {
        let mut list = ReservationList::new();
        // A small, unaligned reservation whose end (0x110) is not itself a
        // multiple of the requested alignment.
        list.insert_fixed(AllocationTarget::User, va(0x100), 0x10, perms())
            .unwrap();

        let picked = list
            .reserve(AllocationTarget::User, 0x1000, 0x4000, perms())
            .unwrap();
        assert_eq!(picked.as_u64() % 0x4000, 0);
        assert!(picked.as_u64() >= 0x110);
    }

    #[test]
    fn reserve_respects_the_kernel_half_floor() {
        let mut list = ReservationList::new();
        let picked = list
            .reserve(AllocationTarget::Kernel, 0x1000, 0x1000, perms())
            .unwrap();
        assert_eq!(picked, va(LAST_USERSPACE_ADDRESS));
    }

    #[test]
    fn reserve_reports_out_of_range_when_the_half_is_full() {
        let mut list = ReservationList::new();
        // The user half ends at `LAST_USERSPACE_ADDRESS`; nothing that size
        // can possibly fit.
        assert_eq!(
            list.reserve(AllocationTarget::User, LAST_USERSPACE_ADDRESS + 1, 1, perms()),
            Err(ReservationError::OutOfRange)
        );
    }
}
