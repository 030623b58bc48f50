//! Walker for the broker's internal slab ("page") allocator.

use tracing::debug;

use crate::mem::{PointerWidth, VirtualMemory, VirtualMemoryExt};
use crate::overlay::{PageAllocator32, PageAllocator64, PageAllocatorView};

/// Decoded shape of one page allocator: where its pages live and how the
/// slots inside each page are cut. Transient; only used while walking a table.
#[derive(Debug, Clone, Default)]
pub struct PageAllocatorSnapshot {
    pages: Vec<u64>,
    entry_size: usize,
    entries_per_page: usize,
}

impl PageAllocatorSnapshot {
    /// Decode the control block at `control_block` and the page-base array it
    /// points at. An unreadable control block or page list yields an empty
    /// snapshot: the target may legitimately hold zero entries, or may have
    /// been rewritten between symbol lookup and this read.
    pub fn read<M: VirtualMemory>(
        mem: &M,
        control_block: u64,
        width: PointerWidth,
    ) -> PageAllocatorSnapshot {
        match width {
            PointerWidth::Bits64 => Self::read_with::<PageAllocator64, M>(mem, control_block),
            PointerWidth::Bits32 => Self::read_with::<PageAllocator32, M>(mem, control_block),
        }
    }

    fn read_with<A: PageAllocatorView, M: VirtualMemory>(
        mem: &M,
        control_block: u64,
    ) -> PageAllocatorSnapshot {
        let Some(alloc) = mem.read_struct::<A>(control_block) else {
            debug!(
                address = format!("0x{control_block:X}"),
                "allocator control block unreadable"
            );
            return PageAllocatorSnapshot::default();
        };
        let Some(pages) = alloc.read_page_bases(mem) else {
            debug!(
                address = format!("0x{control_block:X}"),
                pages = alloc.page_count(),
                "allocator page list unreadable"
            );
            return PageAllocatorSnapshot::default();
        };
        PageAllocatorSnapshot {
            pages,
            entry_size: alloc.entry_size() as usize,
            entries_per_page: alloc.entries_per_page() as usize,
        }
    }

    /// Page base addresses in table order.
    pub fn pages(&self) -> &[u64] {
        &self.pages
    }

    /// Bytes per slot, as declared by the control block.
    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    /// Slots per page, as declared by the control block.
    pub fn entries_per_page(&self) -> usize {
        self.entries_per_page
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeMemory;

    const CONTROL_BLOCK: u64 = 0x10_0000;
    const PAGE_LIST: u64 = 0x20_0000;

    fn control_block_64(pages: i32, entry_size: u64, per_page: u16) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&pages.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&PAGE_LIST.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes()); // page list end
        bytes.extend_from_slice(&0u32.to_le_bytes()); // flags
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 16]); // free list head
        bytes.extend_from_slice(&0u64.to_le_bytes()); // entry count
        bytes.extend_from_slice(&entry_size.to_le_bytes());
        bytes.extend_from_slice(&per_page.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 6]);
        bytes.extend_from_slice(&0u64.to_le_bytes()); // lock
        bytes
    }

    #[test]
    fn decodes_pages_and_slot_shape() {
        let mut image = FakeMemory::new();
        image.put(CONTROL_BLOCK, &control_block_64(2, 112, 0x56));
        let mut list = Vec::new();
        list.extend_from_slice(&0x30_0000u64.to_le_bytes());
        list.extend_from_slice(&0x40_0000u64.to_le_bytes());
        image.put(PAGE_LIST, &list);

        let snapshot = PageAllocatorSnapshot::read(&image, CONTROL_BLOCK, PointerWidth::Bits64);
        assert_eq!(snapshot.pages(), &[0x30_0000, 0x40_0000]);
        assert_eq!(snapshot.entry_size(), 112);
        assert_eq!(snapshot.entries_per_page(), 0x56);
    }

    #[test]
    fn unreadable_control_block_yields_empty_snapshot() {
        let image = FakeMemory::new();
        let snapshot = PageAllocatorSnapshot::read(&image, CONTROL_BLOCK, PointerWidth::Bits64);
        assert!(snapshot.pages().is_empty());
        assert_eq!(snapshot.entry_size(), 0);
    }

    #[test]
    fn unreadable_page_list_yields_empty_snapshot() {
        let mut image = FakeMemory::new();
        image.put(CONTROL_BLOCK, &control_block_64(4, 112, 0x56));
        // PAGE_LIST itself left unmapped.
        let snapshot = PageAllocatorSnapshot::read(&image, CONTROL_BLOCK, PointerWidth::Bits64);
        assert!(snapshot.pages().is_empty());
    }

    #[test]
    fn narrow_control_block_widens_page_bases() {
        let mut image = FakeMemory::new();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1i32.to_le_bytes());
        bytes.extend_from_slice(&(PAGE_LIST as u32).to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes()); // page list end
        bytes.extend_from_slice(&0u32.to_le_bytes()); // flags
        bytes.extend_from_slice(&[0u8; 8]); // free list head
        bytes.extend_from_slice(&0u32.to_le_bytes()); // entry count
        bytes.extend_from_slice(&80u32.to_le_bytes()); // bytes per entry
        bytes.extend_from_slice(&0x30u16.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 2]);
        bytes.extend_from_slice(&0u32.to_le_bytes()); // lock
        image.put(CONTROL_BLOCK, &bytes);
        image.put_u32(PAGE_LIST, 0x8070_6050);

        let snapshot = PageAllocatorSnapshot::read(&image, CONTROL_BLOCK, PointerWidth::Bits32);
        assert_eq!(snapshot.pages(), &[0x8070_6050]);
        assert_eq!(snapshot.entry_size(), 80);
        assert_eq!(snapshot.entries_per_page(), 0x30);
    }
}
