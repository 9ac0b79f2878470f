//! # Kernel Entry Point

#![no_std]
#![no_main]
#![allow(unsafe_code)]

// Bring in the global allocator.
extern crate kernel_alloc;

pub mod alloc;
pub mod allocator;
pub mod apic;
pub mod cpuid;
pub mod framebuffer;
pub mod gdt;
pub mod idt;
pub mod init;
pub mod interrupts;
pub mod msr;
pub mod per_cpu;
pub mod ports;
pub mod privilege;
pub mod sched;
pub mod serial;
pub mod smap;
pub mod smp;
pub mod tracing;
pub mod tsc;
pub mod tss;
pub mod userland_demo;

use core::hint::spin_loop;
use kernel_alloc::mmap;
use kernel_alloc::phys_mapper::HhdmPhysMapper;
use kernel_info::boot::{BootPixelFormat, FramebufferInfo, KernelBootInfo};
use kernel_info::memory::HHDM_BASE;
use kernel_qemu::qemu_trace;
use kernel_sync::SyncOnceCell;
use kernel_vmem::VirtualMemoryPageBits;
use kernel_vmem::addresses::{PhysicalAddress, Size4K, VirtualAddress};

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    log::error!("kernel panic: {info}");
    loop {
        spin_loop();
    }
}

/// VA offset inside the HHDM window used for the framebuffer's own, separate
/// mapping (kept apart from the 1 GiB HHDM identity run so we can tag it NX
/// and writable independent of the bulk RAM mapping).
const FRAMEBUFFER_VA_OFFSET: u64 = 1u64 << 30; // 1 GiB into the HHDM region

/// Physical-memory bring-up: build the PMM from the loader's memory map,
/// stand up the kernel VMM over the HHDM physmap, and map the framebuffer
/// into it.
///
/// Runs once, after the bootstrap GDT/IDT are live but before any other
/// subsystem needs kernel memory management. Returns the [`FramebufferInfo`]
/// with `framebuffer_ptr` rewritten to its new kernel-virtual address.
fn remap_boot_memory(bi: &KernelBootInfo) -> FramebufferInfo {
    qemu_trace!("Compacting loader memory map ...\n");
    // Safety: the loader populated `bi.mmap` before `ExitBootServices`.
    let compacted =
        unsafe { mmap::compact_memory_map(&bi.mmap) }.expect("compact loader memory map");
    log::info!(
        "Memory map compacted to {} runs",
        compacted.regions().len()
    );

    qemu_trace!("Initializing physical memory allocator ...\n");
    let pmm = unsafe { alloc::init_physical_memory_allocator_once(&compacted) };

    // Safety: the loader's identity/HHDM mapping is still active; CR3 is valid.
    unsafe {
        alloc::init_kernel_vmm(HhdmPhysMapper, pmm);
    }

    let mut fb = bi.fb.clone();
    if matches!(fb.framebuffer_format, BootPixelFormat::BltOnly) {
        return fb;
    }

    let fb_pa = fb.framebuffer_ptr;
    let fb_len = fb.framebuffer_size;

    let page = Size4K::SIZE;
    let pa_start = fb_pa & !(page - 1);
    let pa_end = (fb_pa + fb_len).div_ceil(page) * page;

    let va_base = HHDM_BASE + FRAMEBUFFER_VA_OFFSET;
    let va_start = va_base + (fb_pa - pa_start);

    let leaf = VirtualMemoryPageBits::default()
        .with_present(true)
        .with_writable(true)
        .with_no_execute(true)
        .with_global(true);
    let nonleaf = VirtualMemoryPageBits::default()
        .with_present(true)
        .with_writable(true);

    alloc::try_with_kernel_vmm(alloc::FlushTlb::OnSuccess, |vmm| {
        vmm.map_region(
            VirtualAddress::new(va_start & !(page - 1)),
            PhysicalAddress::new(pa_start),
            pa_end - pa_start,
            nonleaf,
            leaf,
        )
    })
    .expect("map framebuffer into kernel address space");

    fb.framebuffer_ptr = va_start;
    fb
}

/// The framebuffer handed to [`kernel_main`] outlives it (the BSP idle loop
/// never returns), but [`framebuffer_worker`] runs as its own thread with no
/// access to that stack frame, so the info it needs is stashed here once.
static FB: SyncOnceCell<FramebufferInfo> = SyncOnceCell::new();

fn kernel_main(fb: &FramebufferInfo) -> ! {
    log::info!("Entering kernel main loop ...");
    match fb.framebuffer_format {
        BootPixelFormat::Rgb => log::info!("RGB framebuffer"),
        BootPixelFormat::Bgr => log::info!("BGR framebuffer"),
        BootPixelFormat::Bitmask => log::info!("Bitmask framebuffer"),
        BootPixelFormat::BltOnly => log::info!("BltOnly framebuffer"),
    }
    let _ = FB.get_or_init(|| fb.clone());

    // `load_demo_thread` only needs the kernel VMM's lock; `spawn_user_thread`
    // takes its own separately (to map the new thread's kernel stack) and
    // then the scheduler lock, so the two calls must not nest.
    let mut demo_entry = None;
    alloc::with_kernel_vmm(|vmm| {
        demo_entry = Some(userland_demo::load_demo_thread(vmm));
    });
    if let Some((entry, ustack_top)) = demo_entry {
        sched::spawn_user_thread(entry, ustack_top);
    }
    sched::spawn_kernel_thread(framebuffer_worker, 0);

    log::info!("Handing the BSP over to the idle loop");
    sched::run_idle_loop()
}

/// Kernel worker thread: repaints the framebuffer and yields its timeslice
/// between frames rather than busy-spinning.
extern "C" fn framebuffer_worker(_arg: u64) -> ! {
    loop {
        if let Some(fb) = FB.get() {
            unsafe { framebuffer::fill_solid(fb, 0, 120, 215) };
        }
        sched::sleep_ms(16);
    }
}
