//! Multiple APIC Description Table (MADT) parsing: enumerates the Local
//! APICs (one per logical CPU) the firmware reports, the input SMP bring-up
//! needs to know how many application processors exist and which APIC IDs
//! to target with INIT-SIPI-SIPI.

use crate::PhysMapRo;
use crate::rsdp::AcpiRoots;

/// Upper bound on the number of CPUs a single MADT is expected to describe.
/// Matches [`kernel_info::memory::MAX_THREADS`]'s order of magnitude; this
/// crate has no dependency on `kernel-info`, so the bound is repeated here.
pub const MAX_LAPICS: usize = 32;

#[repr(C, packed)]
struct SdtHeader {
    signature: [u8; 4],
    length: u32,
    revision: u8,
    checksum: u8,
    oem_id: [u8; 6],
    oem_table_id: [u8; 8],
    oem_revision: u32,
    creator_id: u32,
    creator_revision: u32,
}

/// One Local APIC (or x2APIC) entry discovered in the MADT.
#[derive(Copy, Clone, Debug)]
pub struct LapicEntry {
    pub acpi_processor_id: u32,
    pub apic_id: u32,
    /// The "enabled" bit of the entry's flags field — a disabled entry is a
    /// CPU socket the firmware knows about but that isn't usable.
    pub enabled: bool,
}

#[derive(Default)]
pub struct LapicList {
    items: [Option<LapicEntry>; MAX_LAPICS],
    len: usize,
}

impl LapicList {
    const fn new() -> Self {
        Self {
            items: [None; MAX_LAPICS],
            len: 0,
        }
    }

    fn push(&mut self, e: LapicEntry) {
        if self.len < MAX_LAPICS {
            self.items[self.len] = Some(e);
            self.len += 1;
        }
    }

    #[must_use]
    pub fn iter(&self) -> impl Iterator<Item = &LapicEntry> {
        self.items[..self.len].iter().filter_map(Option::as_ref)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Locate and parse the MADT reachable from `roots`, returning every Local
/// APIC / x2APIC entry it describes (enabled or not).
///
/// # Safety
/// `mapper` must be able to map the RSDT/XSDT and every table it points to;
/// `roots` must have come from a successfully validated [`AcpiRoots::parse`].
#[must_use]
pub unsafe fn enumerate_lapics(mapper: &impl PhysMapRo, roots: &AcpiRoots) -> LapicList {
    let mut out = LapicList::new();
    let Some(madt_addr) = (unsafe { find_table(mapper, roots, b"APIC") }) else {
        return out;
    };

    let header_bytes = unsafe { mapper.map_ro(madt_addr, size_of::<SdtHeader>()) };
    if header_bytes.len() < size_of::<SdtHeader>() {
        return out;
    }
    let header = unsafe { (header_bytes.as_ptr() as *const SdtHeader).read_unaligned() };
    let total_len = header.length as usize;
    if total_len < size_of::<SdtHeader>() + 8 {
        return out;
    }

    let table = unsafe { mapper.map_ro(madt_addr, total_len) };
    if table.len() < total_len {
        return out;
    }

    // Fixed MADT header past the common SDT header: local_apic_addr(u32), flags(u32).
    let mut cursor = size_of::<SdtHeader>() + 8;
    while cursor + 2 <= table.len() {
        let entry_type = table[cursor];
        let entry_len = table[cursor + 1] as usize;
        if entry_len < 2 || cursor + entry_len > table.len() {
            break;
        }
        let body = &table[cursor + 2..cursor + entry_len];

        match entry_type {
            // Processor Local APIC: acpi_id(u8), apic_id(u8), flags(u32).
            0 if body.len() >= 6 => {
                let flags = u32::from_le_bytes([body[2], body[3], body[4], body[5]]);
                out.push(LapicEntry {
                    acpi_processor_id: u32::from(body[0]),
                    apic_id: u32::from(body[1]),
                    enabled: flags & 1 != 0,
                });
            }
            // Processor Local x2APIC: reserved(u16), x2apic_id(u32), flags(u32), acpi_id(u32).
            9 if body.len() >= 14 => {
                let x2apic_id = u32::from_le_bytes([body[2], body[3], body[4], body[5]]);
                let flags = u32::from_le_bytes([body[6], body[7], body[8], body[9]]);
                let acpi_id = u32::from_le_bytes([body[10], body[11], body[12], body[13]]);
                out.push(LapicEntry {
                    acpi_processor_id: acpi_id,
                    apic_id: x2apic_id,
                    enabled: flags & 1 != 0,
                });
            }
            _ => {}
        }

        cursor += entry_len;
    }

    out
}

/// Walk the RSDT (32-bit entries) or XSDT (64-bit entries) looking for a
/// table whose 4-byte signature matches `signature`.
unsafe fn find_table(mapper: &impl PhysMapRo, roots: &AcpiRoots, signature: &[u8; 4]) -> Option<u64> {
    if let Some(xsdt_addr) = roots.xsdt_addr {
        return unsafe { find_in_sdt(mapper, xsdt_addr, signature, 8) };
    }
    if let Some(rsdt_addr) = roots.rsdt_addr {
        return unsafe { find_in_sdt(mapper, u64::from(rsdt_addr), signature, 4) };
    }
    None
}

unsafe fn find_in_sdt(
    mapper: &impl PhysMapRo,
    sdt_addr: u64,
    signature: &[u8; 4],
    entry_size: usize,
) -> Option<u64> {
    let header_bytes = unsafe { mapper.map_ro(sdt_addr, size_of::<SdtHeader>()) };
    if header_bytes.len() < size_of::<SdtHeader>() {
        return None;
    }
    let header = unsafe { (header_bytes.as_ptr() as *const SdtHeader).read_unaligned() };
    let total_len = header.length as usize;
    let table = unsafe { mapper.map_ro(sdt_addr, total_len) };
    if table.len() < total_len {
        return None;
    }

    let entries = &table[size_of::<SdtHeader>()..];
    for chunk in entries.chunks_exact(entry_size) {
        let entry_addr = if entry_size == 8 {
            u64::from_le_bytes(chunk.try_into().ok()?)
        } else {
            u64::from(u32::from_le_bytes(chunk.try_into().ok()?))
        };
        let entry_sig_bytes = unsafe { mapper.map_ro(entry_addr, 4) };
        if entry_sig_bytes.len() == 4 && entry_sig_bytes == signature {
            return Some(entry_addr);
        }
    }
    None
}
