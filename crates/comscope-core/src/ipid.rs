//! The broker's global interface-pointer-ID (IPID) table: per-slot decoding
//! into [`IpidEntry`] values and the marshaled object-reference encoding.

use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::mem::{decode, PointerWidth, VirtualMemory, VirtualMemoryExt};
use crate::overlay::{IpidEntry32, IpidEntry64, IpidEntryView, OxidEntryView};
use crate::pagealloc::PageAllocatorSnapshot;
use crate::symbols::SymbolResolver;

/// Slot value the allocator stores in freed or never-used entries.
pub const VACANT_SLOT_SENTINEL: u32 = 0xF1EE_F1EE;

bitflags::bitflags! {
    /// Status flags of one IPID table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub struct IpidFlags: u32 {
        const CONNECTING = 0x1;
        const DISCONNECTED = 0x2;
        const SERVER_ENTRY = 0x4;
        const NO_PING = 0x8;
        const COPY = 0x10;
        const VACANT = 0x80;
        const NON_NDR_STUB = 0x100;
        const NON_NDR_PROXY = 0x200;
        const NOTIFY_ACT = 0x400;
        const TRIED_ASYNC = 0x800;
        const ASYNC_SERVER = 0x1000;
        const DEACTIVATED = 0x2000;
        const WEAK_REF_CACHE = 0x4000;
        const STRONG_REF_CACHE = 0x8000;
        const UNSECURE_CALLS_ALLOWED = 0x10000;
    }
}

/// One live cross-process interface registration.
#[derive(Debug, Clone, Serialize)]
pub struct IpidEntry {
    /// Interface pointer identifier.
    pub ipid: Uuid,
    /// Interface id the registration exposes.
    pub iid: Uuid,
    pub flags: IpidFlags,
    /// Raw interface pointer inside the target.
    pub interface_ptr: u64,
    /// Module-relative label of the interface's vtable, when resolvable.
    pub interface_vtable: Option<String>,
    /// Raw stub pointer inside the target.
    pub stub_ptr: u64,
    /// Module-relative label of the stub's vtable, when resolvable.
    pub stub_vtable: Option<String>,
    /// Object-exporter identifier of the owning execution context.
    pub oxid: Uuid,
    pub strong_refs: i32,
    pub weak_refs: i32,
    pub private_refs: i32,
    /// Window handle of the owning context's single-threaded-apartment host.
    pub server_sta_hwnd: u64,
}

impl IpidEntry {
    /// An entry is running unless it has been disconnected or deactivated.
    pub fn is_running(&self) -> bool {
        !self
            .flags
            .intersects(IpidFlags::DISCONNECTED | IpidFlags::DEACTIVATED)
    }

    /// Apartment identifier embedded in the IPID itself.
    pub fn apartment_id(&self) -> i16 {
        let bytes = self.ipid.to_bytes_le();
        i16::from_le_bytes([bytes[4], bytes[5]])
    }

    /// Serialize this registration as a connectable object reference.
    ///
    /// The layout is consumed by external tooling and is load-bearing down to
    /// the byte: 4-byte ASCII signature, version 1, the IID, a zero dword, a
    /// one dword, the OXID truncated to its first 8 bytes, 8 freshly random
    /// object-id bytes, the IPID, and a trailing zero dword — 68 bytes total.
    pub fn to_objref(&self) -> Result<Vec<u8>> {
        let mut blob = Vec::with_capacity(68);
        blob.extend_from_slice(b"MEOW");
        blob.extend_from_slice(&1u32.to_le_bytes());
        blob.extend_from_slice(&self.iid.to_bytes_le());
        blob.extend_from_slice(&0u32.to_le_bytes());
        blob.extend_from_slice(&1u32.to_le_bytes());
        blob.extend_from_slice(&self.oxid.to_bytes_le()[..8]);
        let mut oid = [0u8; 8];
        getrandom::getrandom(&mut oid)?;
        blob.extend_from_slice(&oid);
        blob.extend_from_slice(&self.ipid.to_bytes_le());
        blob.extend_from_slice(&0u32.to_le_bytes());
        Ok(blob)
    }
}

/// Walk the IPID table rooted at `table_addr` and decode every live slot.
///
/// `table_addr` is the address of the table's page allocator control block
/// (`CIPIDTable::_palloc`). Slots whose flag word is zero or the vacant
/// sentinel are skipped; everything else becomes one [`IpidEntry`], in page
/// order then slot order. The ordering is reproducible but carries no
/// semantic meaning.
pub fn parse_ipid_entries<M, R>(
    mem: &M,
    resolver: &mut R,
    width: PointerWidth,
    table_addr: u64,
) -> Vec<IpidEntry>
where
    M: VirtualMemory,
    R: SymbolResolver + ?Sized,
{
    match width {
        PointerWidth::Bits64 => parse_with::<IpidEntry64, M, R>(mem, resolver, width, table_addr),
        PointerWidth::Bits32 => parse_with::<IpidEntry32, M, R>(mem, resolver, width, table_addr),
    }
}

fn parse_with<E, M, R>(
    mem: &M,
    resolver: &mut R,
    width: PointerWidth,
    table_addr: u64,
) -> Vec<IpidEntry>
where
    E: IpidEntryView,
    M: VirtualMemory,
    R: SymbolResolver + ?Sized,
{
    let palloc = PageAllocatorSnapshot::read(mem, table_addr, width);
    // A smaller-than-layout entry size means the runtime's record no longer
    // matches this overlay; degrade to "nothing found" rather than misread.
    if palloc.pages().is_empty() || palloc.entry_size() < std::mem::size_of::<E>() {
        debug!(
            pages = palloc.pages().len(),
            entry_size = palloc.entry_size(),
            "IPID table empty or layout mismatch"
        );
        return Vec::new();
    }

    let mut entries = Vec::new();
    for &page in palloc.pages() {
        // One read per page: fewer round trips, and a partially unmapped page
        // costs that page alone, not the whole table.
        let Some(buf) = mem.read_buffer(page, palloc.entries_per_page() * palloc.entry_size())
        else {
            debug!(page = format!("0x{page:X}"), "IPID table page unreadable");
            continue;
        };
        for slot in 0..palloc.entries_per_page() {
            let Some(raw) = decode::<E>(&buf[slot * palloc.entry_size()..]) else {
                continue;
            };
            if raw.flags() == 0 || raw.flags() == VACANT_SLOT_SENTINEL {
                continue;
            }
            entries.push(decode_entry(&raw, mem, resolver, width));
        }
    }
    entries
}

fn decode_entry<E, M, R>(raw: &E, mem: &M, resolver: &mut R, width: PointerWidth) -> IpidEntry
where
    E: IpidEntryView,
    M: VirtualMemory,
    R: SymbolResolver + ?Sized,
{
    // One follow-up read for the owning execution context; an unreadable
    // record leaves the exporter fields at their zero values.
    let (oxid, server_sta_hwnd) = match mem.read_struct::<E::OxidEntry>(raw.oxid_entry_addr()) {
        Some(entry) => (entry.moxid(), entry.server_sta_hwnd()),
        None => (Uuid::nil(), 0),
    };

    IpidEntry {
        ipid: raw.ipid(),
        iid: raw.iid(),
        flags: IpidFlags::from_bits_retain(raw.flags()),
        interface_ptr: raw.interface_ptr(),
        interface_vtable: vtable_label(mem, resolver, width, raw.interface_ptr()),
        stub_ptr: raw.stub_ptr(),
        stub_vtable: vtable_label(mem, resolver, width, raw.stub_ptr()),
        oxid,
        strong_refs: raw.strong_refs(),
        weak_refs: raw.weak_refs(),
        private_refs: raw.private_refs(),
        server_sta_hwnd,
    }
}

/// Label the vtable a COM object pointer leads to: the first machine word of
/// the object is the vtable pointer. Null object pointers stay unlabeled.
fn vtable_label<M, R>(
    mem: &M,
    resolver: &mut R,
    width: PointerWidth,
    object_ptr: u64,
) -> Option<String>
where
    M: VirtualMemory,
    R: SymbolResolver + ?Sized,
{
    if object_ptr == 0 {
        return None;
    }
    let vtable = mem.read_pointer(object_ptr, width)?;
    Some(resolver.label_for_address(vtable))
}
