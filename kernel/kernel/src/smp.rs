//! CPU registry, application-processor bring-up, and cross-CPU TLB
//! shootdown.
//!
//! Every online CPU — the BSP from [`crate::init::finish_interrupt_bringup`],
//! application processors from [`bring_up_aps`] — registers its x2APIC ID
//! here. [`shootdown_tlb`] broadcasts
//! [`crate::interrupts::tlb_shootdown::TLB_SHOOTDOWN_VECTOR`] to every
//! *other* online CPU and spins until each has acknowledged, matching the
//! "IPI-based TLB shootdown" behavior the VMM's `unmap` path assumes (see the
//! safety notes on [`kernel_alloc::vmm::Vmm::local_tlb_flush_all`]).
//!
//! Only one shootdown may be in flight across the whole machine at a time —
//! [`SHOOTDOWN_LOCK`] enforces that, since the pending range is a single
//! global slot rather than one per request.

mod ap_entry;
mod trampoline;

use crate::alloc::{FlushTlb, try_with_kernel_vmm};
use crate::interrupts::Ist;
use crate::per_cpu::{ist_stacks::ist_slot_for_cpu, kernel_stacks::kstack_slot_for_cpu};
use crate::tsc::rdtsc;
use crate::{apic, per_cpu};
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use kernel_acpi::PhysMapRo;
use kernel_acpi::madt::enumerate_lapics;
use kernel_acpi::rsdp::AcpiRoots;
use kernel_info::memory::{HHDM_BASE, MAX_THREADS, TRAMPOLINE_PHYS_ADDR};
use kernel_sync::{RawSpin, SpinMutex};
use kernel_vmem::VirtualMemoryPageBits;
use kernel_vmem::addresses::{PageSize, PhysicalAddress, Size4K, VirtualAddress, VirtualPage};
use kernel_vmem::invalidate_tlb_page;

/// Loose upper bound on logical CPUs; MADT entries beyond this are ignored.
pub const MAX_CPUS: usize = 32;

static ONLINE_APIC_IDS: SpinMutex<[Option<u32>; MAX_CPUS]> =
    SpinMutex::from_raw(RawSpin::new(), [None; MAX_CPUS]);

static SHOOTDOWN_LOCK: SpinMutex<()> = SpinMutex::from_raw(RawSpin::new(), ());
static PENDING_VA: AtomicU64 = AtomicU64::new(0);
static PENDING_BYTES: AtomicU64 = AtomicU64::new(0);
static ACKS_REMAINING: AtomicU32 = AtomicU32::new(0);

/// Record `apic_id` as an online CPU. Called once per CPU during its own
/// bring-up (BSP in [`crate::apic::init_lapic_and_set_cpu_id`]'s caller, APs
/// in their post-trampoline entry).
pub fn register_online_cpu(apic_id: u32) {
    let mut ids = ONLINE_APIC_IDS.lock();
    if ids.iter().flatten().any(|&id| id == apic_id) {
        return;
    }
    if let Some(slot) = ids.iter_mut().find(|s| s.is_none()) {
        *slot = Some(apic_id);
    }
}

/// Invalidate `[va_start, va_start + bytes)` on every online CPU, including
/// the caller's, then return once all have acknowledged.
///
/// Call this instead of [`kernel_alloc::vmm::Vmm::local_tlb_flush_all`]
/// whenever the unmapped range might be (or might have been) visible to
/// more than one CPU — today that is every kernel-space unmap, since the
/// kernel's upper-half mappings are shared by every CPU's PML4.
pub fn shootdown_tlb(va_start: VirtualAddress, bytes: u64) {
    let _guard = SHOOTDOWN_LOCK.lock_irq();

    let self_id = apic::x2apic_id();
    let mut targets = [0u32; MAX_CPUS];
    let mut n = 0;
    for id in ONLINE_APIC_IDS.lock().iter().flatten() {
        if *id != self_id {
            targets[n] = *id;
            n += 1;
        }
    }

    if n > 0 {
        PENDING_VA.store(va_start.as_u64(), Ordering::SeqCst);
        PENDING_BYTES.store(bytes, Ordering::SeqCst);
        ACKS_REMAINING.store(n as u32, Ordering::SeqCst);
        for &apic_id in &targets[..n] {
            unsafe {
                apic::send_ipi(apic_id, crate::interrupts::tlb_shootdown::TLB_SHOOTDOWN_VECTOR);
            }
        }
    }

    local_invalidate_range(va_start, bytes);

    while ACKS_REMAINING.load(Ordering::SeqCst) != 0 {
        core::hint::spin_loop();
    }
}

/// Sentinel `PENDING_BYTES` value meaning "reload CR3" rather than "invlpg
/// this specific range" — used by [`shootdown_full`] for the kernel VMM's
/// non-global unmaps, where tracking an exact VA range per call site isn't
/// worth it.
const FULL_FLUSH: u64 = u64::MAX;

/// Reload CR3 (flushing all non-global TLB entries) on every online CPU,
/// including the caller's, then return once all have acknowledged.
pub fn shootdown_full() {
    let _guard = SHOOTDOWN_LOCK.lock_irq();

    let self_id = apic::x2apic_id();
    let mut targets = [0u32; MAX_CPUS];
    let mut n = 0;
    for id in ONLINE_APIC_IDS.lock().iter().flatten() {
        if *id != self_id {
            targets[n] = *id;
            n += 1;
        }
    }

    if n > 0 {
        PENDING_BYTES.store(FULL_FLUSH, Ordering::SeqCst);
        ACKS_REMAINING.store(n as u32, Ordering::SeqCst);
        for &apic_id in &targets[..n] {
            unsafe {
                apic::send_ipi(apic_id, crate::interrupts::tlb_shootdown::TLB_SHOOTDOWN_VECTOR);
            }
        }
    }

    local_flush_all();

    while ACKS_REMAINING.load(Ordering::SeqCst) != 0 {
        core::hint::spin_loop();
    }
}

/// Invoked by the TLB-shootdown IPI handler on a remote CPU: invalidate the
/// pending range (or do a full flush, for [`shootdown_full`] requests) and
/// acknowledge.
pub fn handle_shootdown_ipi() {
    let bytes = PENDING_BYTES.load(Ordering::SeqCst);
    if bytes == FULL_FLUSH {
        local_flush_all();
    } else {
        let va = VirtualAddress::new(PENDING_VA.load(Ordering::SeqCst));
        local_invalidate_range(va, bytes);
    }
    ACKS_REMAINING.fetch_sub(1, Ordering::SeqCst);
}

fn local_invalidate_range(va_start: VirtualAddress, bytes: u64) {
    let page_size = Size4K::SIZE;
    let mut addr = va_start.as_u64() & !(page_size - 1);
    let end = va_start.as_u64() + bytes;
    while addr < end {
        let page: VirtualPage<Size4K> = VirtualAddress::new(addr).page();
        unsafe { invalidate_tlb_page(page) };
        addr += page_size;
    }
}

fn local_flush_all() {
    unsafe {
        let cr3: u64;
        core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
    }
}

const _: () = assert!(MAX_CPUS <= MAX_THREADS);

/// TSC Hz the BSP calibrated in [`crate::init::finish_interrupt_bringup`],
/// cached here so application processors can program their own LAPIC timer
/// without racing the BSP over the PIT ([`crate::tsc::estimate_tsc_hz`]'s
/// fallback path is not safe to run concurrently on more than one CPU).
static BSP_TSC_HZ: AtomicU64 = AtomicU64::new(0);

/// The BSP's calibrated TSC frequency, set once by [`bring_up_aps`] before
/// starting any AP.
pub fn bsp_tsc_hz() -> u64 {
    BSP_TSC_HZ.load(Ordering::Relaxed)
}

/// Is `apic_id` registered as online (see [`register_online_cpu`])?
fn is_online(apic_id: u32) -> bool {
    ONLINE_APIC_IDS.lock().iter().flatten().any(|&id| id == apic_id)
}

fn read_cr3() -> u64 {
    let cr3: u64;
    unsafe {
        core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
    }
    cr3
}

/// Busy-wait roughly `us` microseconds using the calibrated TSC.
fn busy_wait_us(tsc_hz: u64, us: u64) {
    let ticks = (tsc_hz / 1_000_000).max(1) * us;
    let target = rdtsc() + ticks;
    while rdtsc() < target {
        core::hint::spin_loop();
    }
}

/// [`kernel_acpi::PhysMapRo`] adapter over the kernel's HHDM window, mirroring
/// [`kernel_alloc::phys_mapper::HhdmPhysMapper`] but returning a byte slice
/// (the shape the ACPI table walk needs) instead of a typed reference.
struct HhdmAcpiMapper;

impl PhysMapRo for HhdmAcpiMapper {
    unsafe fn map_ro<'a>(&self, paddr: u64, len: usize) -> &'a [u8] {
        unsafe { core::slice::from_raw_parts((HHDM_BASE + paddr) as *const u8, len) }
    }
}

/// Map [`TRAMPOLINE_PHYS_ADDR`]'s page 1:1 (VA == PA) into the kernel address
/// space so the AP can execute it directly out of low physical memory both
/// before and after loading the kernel's CR3.
fn map_trampoline_identity() {
    let va = VirtualAddress::new(TRAMPOLINE_PHYS_ADDR);
    let pa = PhysicalAddress::new(TRAMPOLINE_PHYS_ADDR);
    let bits = VirtualMemoryPageBits::new().with_present(true).with_writable(true);

    try_with_kernel_vmm(FlushTlb::OnSuccess, |vmm| {
        vmm.map_region(va, pa, Size4K::SIZE, bits, bits)
    })
    .expect("identity-map AP trampoline page");
}

/// Bring up every enabled application processor the MADT describes.
///
/// Parses the MADT (reached via `rsdp_addr`, the physical address the UEFI
/// loader passed in [`kernel_info::boot::KernelBootInfo::rsdp_addr`]),
/// identity-maps and fills in the [`trampoline`] blob once, then for each AP
/// (every enabled Local APIC/x2APIC entry other than `bsp_apic_id`): maps a
/// dedicated kernel + IST1 stack, patches that AP's `ApBootInfo`, and runs
/// the INIT-SIPI-SIPI sequence, waiting (with a timeout) for it to register
/// itself online before moving on to the next one.
///
/// Must run after [`crate::sched::init`] (APs rely on the global scheduler
/// and its calibrated TSC-ticks-per-ms already being live) and after the
/// kernel VMM exists. `rsdp_addr` and `tsc_hz` are the values
/// [`crate::init::finish_interrupt_bringup`] already has on hand from the
/// loader's boot info and the BSP's own TSC calibration.
pub fn bring_up_aps(bsp_apic_id: u32, rsdp_addr: u64, tsc_hz: u64) {
    if rsdp_addr == 0 {
        log::warn!("no RSDP handed from the loader; staying single-CPU");
        return;
    }

    BSP_TSC_HZ.store(tsc_hz, Ordering::Relaxed);

    let roots = match unsafe { AcpiRoots::parse(&HhdmAcpiMapper, rsdp_addr) } {
        Some(roots) => roots,
        None => {
            log::warn!("RSDP at {rsdp_addr:#x} failed validation; staying single-CPU");
            return;
        }
    };

    let lapics = unsafe { enumerate_lapics(&HhdmAcpiMapper, &roots) };
    if lapics.is_empty() {
        log::warn!("MADT reported no Local APICs; staying single-CPU");
        return;
    }

    map_trampoline_identity();
    let image = trampoline::trampoline_image();
    let info_off = trampoline::boot_info_offset();
    unsafe {
        core::ptr::copy_nonoverlapping(
            image.as_ptr(),
            TRAMPOLINE_PHYS_ADDR as *mut u8,
            image.len(),
        );
    }

    let cr3 = read_cr3();
    let sipi_vector = (TRAMPOLINE_PHYS_ADDR / 0x1000) as u8;
    let mut next_cpu_id: usize = 1;

    for entry in lapics.iter() {
        if !entry.enabled || entry.apic_id == bsp_apic_id {
            continue;
        }
        if next_cpu_id > per_cpu::MAX_APS {
            log::warn!(
                "MADT describes more CPUs than MAX_APS ({}); ignoring APIC {:#x}",
                per_cpu::MAX_APS,
                entry.apic_id
            );
            continue;
        }
        let cpu_id = next_cpu_id as u64;
        next_cpu_id += 1;

        let kstack = try_with_kernel_vmm(FlushTlb::OnSuccess, |vmm| {
            crate::per_cpu::stack::map_kernel_stack(
                vmm,
                kstack_slot_for_cpu(cpu_id),
                kernel_info::memory::KERNEL_STACK_SIZE as u64,
            )
        })
        .expect("map AP kernel stack");
        let (_, ist1_top) = try_with_kernel_vmm(FlushTlb::OnSuccess, |vmm| {
            crate::per_cpu::stack::map_ist_stack(
                vmm,
                ist_slot_for_cpu(cpu_id, Ist::Ist1),
                crate::per_cpu::ist_stacks::IST1_SIZE,
            )
        })
        .expect("map AP IST1 stack");

        // Safety: `map_trampoline_identity` made this page present/writable.
        let info = unsafe {
            &mut *((TRAMPOLINE_PHYS_ADDR as usize + info_off) as *mut trampoline::ApBootInfo)
        };
        info.cr3 = cr3;
        info.rsp = kstack.top.as_u64();
        info.entry = ap_entry::ap_entry_trampoline as usize as u64;
        info.cpu_id = cpu_id;
        info.ist1_top = ist1_top.as_u64();

        log::info!("starting AP {cpu_id} (APIC {:#x})", entry.apic_id);
        unsafe {
            apic::send_init_ipi(entry.apic_id);
        }
        busy_wait_us(tsc_hz, 10_000);
        unsafe {
            apic::send_startup_ipi(entry.apic_id, sipi_vector);
        }
        busy_wait_us(tsc_hz, 200);
        unsafe {
            apic::send_startup_ipi(entry.apic_id, sipi_vector);
        }

        let deadline = rdtsc() + tsc_hz / 10; // 100ms
        while !is_online(entry.apic_id) && rdtsc() < deadline {
            core::hint::spin_loop();
        }
        if !is_online(entry.apic_id) {
            log::warn!("AP {cpu_id} (APIC {:#x}) did not come online in time", entry.apic_id);
        }
    }
}
