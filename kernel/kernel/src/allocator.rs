//! Global heap allocator wiring.
//!
//! Reroutes Rust's `alloc` crate onto the kernel heap
//! ([`kernel_alloc::heap::KernelHeap`]), which grows itself lazily through
//! the kernel's VMM/PMM rather than reserving a fixed static array.

#![allow(unsafe_code)]

use crate::alloc::{FlushTlb, try_with_kernel_vmm};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use kernel_alloc::heap::KernelHeap;
use kernel_sync::{RawSpin, SpinMutex};

static HEAP: SpinMutex<KernelHeap> = SpinMutex::from_raw(RawSpin::new(), KernelHeap::new());

pub struct KernelAllocator;

#[global_allocator]
static GLOBAL_ALLOCATOR: KernelAllocator = KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut heap = HEAP.lock();
        try_with_kernel_vmm(FlushTlb::Never, |vmm| {
            heap.allocate(vmm, layout.size() as u64, layout.align() as u64)
        })
        .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        let mut heap = HEAP.lock();
        unsafe { heap.deallocate(ptr) };
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let p = unsafe { self.alloc(layout) };
        if !p.is_null() {
            unsafe { ptr::write_bytes(p, 0, layout.size()) };
        }
        p
    }
}
