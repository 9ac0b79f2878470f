//! # Virtual and Physical Memory Addresses
//!
//! Re-exports the shared address/page types from `kernel-memory-addresses`,
//! kept under this path so paging code only has to name one crate.

pub use kernel_memory_addresses::{
    MemoryAddress, MemoryAddressOffset, MemoryPage, PageSize, PhysicalAddress, PhysicalPage,
    Size1G, Size2M, Size4K, VirtualAddress, VirtualPage,
};
