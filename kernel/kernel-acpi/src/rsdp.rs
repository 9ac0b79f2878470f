//! RSDP/XSDP discovery: the very first ACPI structure the kernel must find,
//! handed to it (indirectly) via the UEFI configuration table.

use crate::PhysMapRo;

const RSDP_SIGNATURE: &[u8; 8] = b"RSD PTR ";

/// Legacy ACPI 1.0 RSDP, 20 bytes.
#[repr(C, packed)]
struct RsdpV1 {
    signature: [u8; 8],
    checksum: u8,
    oem_id: [u8; 6],
    revision: u8,
    rsdt_address: u32,
}

/// ACPI 2.0+ extension appended after the 20-byte `RsdpV1` prefix, bringing
/// the total to 36 bytes.
#[repr(C, packed)]
struct RsdpV2Ext {
    length: u32,
    xsdt_address: u64,
    extended_checksum: u8,
    reserved: [u8; 3],
}

/// The roots of the ACPI table tree, found and validated once at boot.
#[derive(Copy, Clone, Debug, Default)]
pub struct AcpiRoots {
    /// Present on ACPI 1.0 firmware (and often still populated on 2.0+ for
    /// compatibility), a 32-bit physical pointer to the RSDT.
    pub rsdt_addr: Option<u32>,
    /// Present on ACPI 2.0+ firmware, a 64-bit physical pointer to the XSDT.
    /// Prefer this over `rsdt_addr` when both are set.
    pub xsdt_addr: Option<u64>,
}

impl AcpiRoots {
    /// Validate and parse the RSDP/XSDP at `rsdp_paddr`.
    ///
    /// # Safety
    /// `rsdp_paddr` must be the physical address the firmware reported for
    /// the RSDP (from the UEFI configuration table's ACPI GUID entry), and
    /// `mapper` must be able to map at least 36 bytes starting there.
    #[must_use]
    pub unsafe fn parse(mapper: &impl PhysMapRo, rsdp_paddr: u64) -> Option<Self> {
        let v1_bytes = unsafe { mapper.map_ro(rsdp_paddr, size_of::<RsdpV1>()) };
        if v1_bytes.len() < size_of::<RsdpV1>() {
            return None;
        }
        if &v1_bytes[0..8] != RSDP_SIGNATURE {
            return None;
        }
        if crate::sum(v1_bytes) != 0 {
            return None;
        }

        // Safety: length and signature validated above; layout matches the spec.
        let v1 = unsafe { (v1_bytes.as_ptr() as *const RsdpV1).read_unaligned() };
        let rsdt_addr = Some(v1.rsdt_address).filter(|&a| a != 0);

        if v1.revision < 2 {
            return Some(Self {
                rsdt_addr,
                xsdt_addr: None,
            });
        }

        let full_len = size_of::<RsdpV1>() + size_of::<RsdpV2Ext>();
        let full_bytes = unsafe { mapper.map_ro(rsdp_paddr, full_len) };
        if full_bytes.len() < full_len {
            return Some(Self {
                rsdt_addr,
                xsdt_addr: None,
            });
        }
        if crate::sum(full_bytes) != 0 {
            return Some(Self {
                rsdt_addr,
                xsdt_addr: None,
            });
        }

        let ext = unsafe {
            (full_bytes[size_of::<RsdpV1>()..].as_ptr() as *const RsdpV2Ext).read_unaligned()
        };
        let xsdt_addr = Some(ext.xsdt_address).filter(|&a| a != 0);

        Some(Self {
            rsdt_addr,
            xsdt_addr,
        })
    }
}
