//! Bitness-polymorphic overlays for the broker runtime's internal structures.
//!
//! The broker ships one logical layout per structure, physically instantiated
//! with either 32-bit or 64-bit pointer fields. Each structure kind therefore
//! comes as a pair of `#[repr(C)]` layouts plus one capability trait exposing
//! only semantic accessors; the width decision is made exactly once, when a
//! layout is selected for decoding, and narrow pointers are widened to `u64`
//! before any caller sees them. Padding is spelled out so the Rust layouts are
//! byte-for-byte the MSVC layouts.

use uuid::Uuid;

use crate::mem::{Pod, VirtualMemory, VirtualMemoryExt};

// =============================================================================
// Page allocator control block (CInternalPageAllocator)
// =============================================================================

/// Free-list entry embedded in the allocator control block.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PageEntry64 {
    pub next: u64,
    pub flag: i32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct PageEntry32 {
    pub next: u32,
    pub flag: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct PageAllocator64 {
    pub page_count: i32,
    pub pad0: u32,
    pub page_list_start: u64,
    pub page_list_end: u64,
    pub flags: i32,
    pub pad1: u32,
    pub list_head: PageEntry64,
    pub entry_count: u64,
    pub bytes_per_entry: u64,
    pub entries_per_page: u16,
    pub pad2: [u16; 3],
    pub lock: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct PageAllocator32 {
    pub page_count: i32,
    pub page_list_start: u32,
    pub page_list_end: u32,
    pub flags: i32,
    pub list_head: PageEntry32,
    pub entry_count: u32,
    pub bytes_per_entry: u32,
    pub entries_per_page: u16,
    pub pad0: u16,
    pub lock: u32,
}

unsafe impl Pod for PageAllocator64 {}
unsafe impl Pod for PageAllocator32 {}

/// Width-independent view of an allocator control block.
pub trait PageAllocatorView: Pod {
    fn page_count(&self) -> u32;
    fn entry_size(&self) -> u32;
    fn entries_per_page(&self) -> u32;
    /// Read the page-base array this control block points at, each base
    /// widened to 64 bits.
    fn read_page_bases<M: VirtualMemory>(&self, mem: &M) -> Option<Vec<u64>>;
}

impl PageAllocatorView for PageAllocator64 {
    fn page_count(&self) -> u32 {
        self.page_count.max(0) as u32
    }

    fn entry_size(&self) -> u32 {
        self.bytes_per_entry as u32
    }

    fn entries_per_page(&self) -> u32 {
        u32::from(self.entries_per_page)
    }

    fn read_page_bases<M: VirtualMemory>(&self, mem: &M) -> Option<Vec<u64>> {
        mem.read_array::<u64>(self.page_list_start, self.page_count() as usize)
    }
}

impl PageAllocatorView for PageAllocator32 {
    fn page_count(&self) -> u32 {
        self.page_count.max(0) as u32
    }

    fn entry_size(&self) -> u32 {
        self.bytes_per_entry
    }

    fn entries_per_page(&self) -> u32 {
        u32::from(self.entries_per_page)
    }

    fn read_page_bases<M: VirtualMemory>(&self, mem: &M) -> Option<Vec<u64>> {
        let narrow = mem.read_array::<u32>(u64::from(self.page_list_start), self.page_count() as usize)?;
        Some(narrow.into_iter().map(u64::from).collect())
    }
}

// =============================================================================
// IPID table records (IPIDEntry)
// =============================================================================

#[repr(C)]
#[derive(Clone, Copy)]
pub struct IpidEntry64 {
    pub next_ipid: u64,
    pub flags: u32,
    pub strong_refs: i32,
    pub weak_refs: i32,
    pub private_refs: i32,
    pub interface_ptr: u64,
    pub stub_ptr: u64,
    pub oxid_entry: u64,
    pub ipid: [u8; 16],
    pub iid: [u8; 16],
    pub channel: u64,
    pub irc_entry: u64,
    pub oid_flink: u64,
    pub oid_blink: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct IpidEntry32 {
    pub next_ipid: u32,
    pub flags: u32,
    pub strong_refs: i32,
    pub weak_refs: i32,
    pub private_refs: i32,
    pub interface_ptr: u32,
    pub stub_ptr: u32,
    pub oxid_entry: u32,
    pub ipid: [u8; 16],
    pub iid: [u8; 16],
    pub channel: u32,
    pub irc_entry: u32,
    pub oid_flink: u32,
    pub oid_blink: u32,
}

unsafe impl Pod for IpidEntry64 {}
unsafe impl Pod for IpidEntry32 {}

/// Width-independent view of one IPID table slot.
pub trait IpidEntryView: Pod {
    /// Execution-context record layout matching this entry's width.
    type OxidEntry: OxidEntryView;

    fn flags(&self) -> u32;
    fn interface_ptr(&self) -> u64;
    fn stub_ptr(&self) -> u64;
    fn ipid(&self) -> Uuid;
    fn iid(&self) -> Uuid;
    fn strong_refs(&self) -> i32;
    fn weak_refs(&self) -> i32;
    fn private_refs(&self) -> i32;
    fn oxid_entry_addr(&self) -> u64;
}

impl IpidEntryView for IpidEntry64 {
    type OxidEntry = OxidEntry64;

    fn flags(&self) -> u32 {
        self.flags
    }

    fn interface_ptr(&self) -> u64 {
        self.interface_ptr
    }

    fn stub_ptr(&self) -> u64 {
        self.stub_ptr
    }

    fn ipid(&self) -> Uuid {
        Uuid::from_bytes_le(self.ipid)
    }

    fn iid(&self) -> Uuid {
        Uuid::from_bytes_le(self.iid)
    }

    fn strong_refs(&self) -> i32 {
        self.strong_refs
    }

    fn weak_refs(&self) -> i32 {
        self.weak_refs
    }

    fn private_refs(&self) -> i32 {
        self.private_refs
    }

    fn oxid_entry_addr(&self) -> u64 {
        self.oxid_entry
    }
}

impl IpidEntryView for IpidEntry32 {
    type OxidEntry = OxidEntry32;

    fn flags(&self) -> u32 {
        self.flags
    }

    fn interface_ptr(&self) -> u64 {
        u64::from(self.interface_ptr)
    }

    fn stub_ptr(&self) -> u64 {
        u64::from(self.stub_ptr)
    }

    fn ipid(&self) -> Uuid {
        Uuid::from_bytes_le(self.ipid)
    }

    fn iid(&self) -> Uuid {
        Uuid::from_bytes_le(self.iid)
    }

    fn strong_refs(&self) -> i32 {
        self.strong_refs
    }

    fn weak_refs(&self) -> i32 {
        self.weak_refs
    }

    fn private_refs(&self) -> i32 {
        self.private_refs
    }

    fn oxid_entry_addr(&self) -> u64 {
        u64::from(self.oxid_entry)
    }
}

// =============================================================================
// Execution-context records (OXIDEntry)
// =============================================================================

/// COM runtime version pair carried inside the OXID record.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ComVersion {
    pub major: u16,
    pub minor: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct OxidEntry64 {
    pub next: u64,
    pub prev: u64,
    pub pid: u32,
    pub tid: u32,
    pub moxid: [u8; 16],
    pub mid: i64,
    pub ipid_rundown: [u8; 16],
    pub flags: u32,
    pub pad0: u32,
    pub server_sta_hwnd: u64,
    pub parent_apartment: u64,
    pub shared_default_handle: u64,
    pub auth_id: u64,
    pub binding: u64,
    pub authn_hint: u32,
    pub authn_svc: u32,
    pub mid_entry: u64,
    pub rusta: u64,
    pub refs: u32,
    pub pad1: u32,
    pub complete_event: u64,
    pub call_count: u32,
    pub resolver_refs: u32,
    pub expired_time: u32,
    pub version: ComVersion,
    pub appcontainer_sd: u64,
    pub marshaled_target_info_len: u32,
    pub pad2: u32,
    pub marshaled_target_info: u64,
    pub server_package_full_name: u64,
    pub process_identifier: [u8; 16],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct OxidEntry32 {
    pub next: u32,
    pub prev: u32,
    pub pid: u32,
    pub tid: u32,
    pub moxid: [u8; 16],
    pub mid: i64,
    pub ipid_rundown: [u8; 16],
    pub flags: u32,
    pub server_sta_hwnd: u32,
    pub parent_apartment: u32,
    pub shared_default_handle: u32,
    pub auth_id: u32,
    pub binding: u32,
    pub authn_hint: u32,
    pub authn_svc: u32,
    pub mid_entry: u32,
    pub rusta: u32,
    pub refs: u32,
    pub complete_event: u32,
    pub call_count: u32,
    pub resolver_refs: u32,
    pub expired_time: u32,
    pub version: ComVersion,
    pub appcontainer_sd: u32,
    pub marshaled_target_info_len: u32,
    pub marshaled_target_info: u32,
    pub server_package_full_name: u32,
    pub process_identifier: [u8; 16],
}

unsafe impl Pod for OxidEntry64 {}
unsafe impl Pod for OxidEntry32 {}

/// Width-independent view of one execution-context record.
pub trait OxidEntryView: Pod {
    fn pid(&self) -> u32;
    fn tid(&self) -> u32;
    fn moxid(&self) -> Uuid;
    fn mid(&self) -> i64;
    fn server_sta_hwnd(&self) -> u64;
}

impl OxidEntryView for OxidEntry64 {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn tid(&self) -> u32 {
        self.tid
    }

    fn moxid(&self) -> Uuid {
        Uuid::from_bytes_le(self.moxid)
    }

    fn mid(&self) -> i64 {
        self.mid
    }

    fn server_sta_hwnd(&self) -> u64 {
        self.server_sta_hwnd
    }
}

impl OxidEntryView for OxidEntry32 {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn tid(&self) -> u32 {
        self.tid
    }

    fn moxid(&self) -> Uuid {
        Uuid::from_bytes_le(self.moxid)
    }

    fn mid(&self) -> i64 {
        self.mid
    }

    fn server_sta_hwnd(&self) -> u64 {
        u64::from(self.server_sta_hwnd)
    }
}

// =============================================================================
// Security descriptor layouts
// =============================================================================

bitflags::bitflags! {
    /// Control word of a security descriptor header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SdControl: u16 {
        const OWNER_DEFAULTED = 0x0001;
        const GROUP_DEFAULTED = 0x0002;
        const DACL_PRESENT = 0x0004;
        const DACL_DEFAULTED = 0x0008;
        const SACL_PRESENT = 0x0010;
        const SACL_DEFAULTED = 0x0020;
        const DACL_AUTO_INHERIT_REQ = 0x0100;
        const SACL_AUTO_INHERIT_REQ = 0x0200;
        const DACL_AUTO_INHERITED = 0x0400;
        const SACL_AUTO_INHERITED = 0x0800;
        const DACL_PROTECTED = 0x1000;
        const SACL_PROTECTED = 0x2000;
        const RM_CONTROL_VALID = 0x4000;
        const SELF_RELATIVE = 0x8000;
    }
}

/// First four bytes of every security descriptor encoding.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SecurityDescriptorHeader {
    pub revision: u8,
    pub sbz1: u8,
    pub control: u16,
}

unsafe impl Pod for SecurityDescriptorHeader {}

impl SecurityDescriptorHeader {
    pub fn control(&self) -> SdControl {
        SdControl::from_bits_retain(self.control)
    }
}

/// Self-relative encoding: sub-components live at offsets from the
/// descriptor's own base address. One layout serves both widths.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SdRelative {
    pub header: SecurityDescriptorHeader,
    pub owner: u32,
    pub group: u32,
    pub sacl: u32,
    pub dacl: u32,
}

/// Absolute encoding with 64-bit pointers.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SdAbsolute64 {
    pub header: SecurityDescriptorHeader,
    pub pad0: u32,
    pub owner: u64,
    pub group: u64,
    pub sacl: u64,
    pub dacl: u64,
}

/// Absolute encoding with 32-bit pointers.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SdAbsolute32 {
    pub header: SecurityDescriptorHeader,
    pub owner: u32,
    pub group: u32,
    pub sacl: u32,
    pub dacl: u32,
}

unsafe impl Pod for SdRelative {}
unsafe impl Pod for SdAbsolute64 {}
unsafe impl Pod for SdAbsolute32 {}

/// Width- and encoding-independent view of a security descriptor's
/// sub-component locations. Absent components report address zero.
pub trait SecurityDescriptorView: Pod {
    fn owner(&self, base: u64) -> u64;
    fn group(&self, base: u64) -> u64;
    fn sacl(&self, base: u64) -> u64;
    fn dacl(&self, base: u64) -> u64;
}

fn relative_at(base: u64, offset: u32) -> u64 {
    if offset == 0 {
        0
    } else {
        base.wrapping_add(u64::from(offset))
    }
}

impl SecurityDescriptorView for SdRelative {
    fn owner(&self, base: u64) -> u64 {
        relative_at(base, self.owner)
    }

    fn group(&self, base: u64) -> u64 {
        relative_at(base, self.group)
    }

    fn sacl(&self, base: u64) -> u64 {
        relative_at(base, self.sacl)
    }

    fn dacl(&self, base: u64) -> u64 {
        relative_at(base, self.dacl)
    }
}

impl SecurityDescriptorView for SdAbsolute64 {
    fn owner(&self, _base: u64) -> u64 {
        self.owner
    }

    fn group(&self, _base: u64) -> u64 {
        self.group
    }

    fn sacl(&self, _base: u64) -> u64 {
        self.sacl
    }

    fn dacl(&self, _base: u64) -> u64 {
        self.dacl
    }
}

impl SecurityDescriptorView for SdAbsolute32 {
    fn owner(&self, _base: u64) -> u64 {
        u64::from(self.owner)
    }

    fn group(&self, _base: u64) -> u64 {
        u64::from(self.group)
    }

    fn sacl(&self, _base: u64) -> u64 {
        u64::from(self.sacl)
    }

    fn dacl(&self, _base: u64) -> u64 {
        u64::from(self.dacl)
    }
}

// =============================================================================
// SID and ACL headers
// =============================================================================

/// Leading bytes of a SID; the full SID is `8 + rid_count * 4` bytes.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SidHeader {
    pub revision: u8,
    pub rid_count: u8,
}

/// Fixed ACL header; the full ACL is `size` bytes as declared by itself.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct AclHeader {
    pub revision: u8,
    pub sbz1: u8,
    pub size: u16,
    pub ace_count: u16,
    pub sbz2: u16,
}

unsafe impl Pod for SidHeader {}
unsafe impl Pod for AclHeader {}
