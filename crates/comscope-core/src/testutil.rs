//! Test fixtures: a fabricated remote-memory image and a scripted symbol
//! resolver, so the table walkers and reconstructors can be exercised without
//! a live target.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use uuid::Uuid;

use crate::mem::VirtualMemory;
use crate::symbols::SymbolResolver;

/// Sparse address-space image. Reads crossing a region boundary fail, the same
/// way a partially unmapped remote range fails as a whole.
#[derive(Default)]
pub struct FakeMemory {
    regions: BTreeMap<u64, Vec<u8>>,
}

impl FakeMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, addr: u64, bytes: &[u8]) {
        self.regions.insert(addr, bytes.to_vec());
    }

    pub fn put_u16(&mut self, addr: u64, value: u16) {
        self.put(addr, &value.to_le_bytes());
    }

    pub fn put_u32(&mut self, addr: u64, value: u32) {
        self.put(addr, &value.to_le_bytes());
    }

    pub fn put_u64(&mut self, addr: u64, value: u64) {
        self.put(addr, &value.to_le_bytes());
    }

    pub fn put_guid(&mut self, addr: u64, value: Uuid) {
        self.put(addr, &value.to_bytes_le());
    }

    /// Store a NUL-terminated UTF-16 string.
    pub fn put_utf16(&mut self, addr: u64, text: &str) {
        let mut bytes = Vec::new();
        for unit in text.encode_utf16().chain(std::iter::once(0)) {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        self.put(addr, &bytes);
    }
}

impl VirtualMemory for FakeMemory {
    fn read_into(&self, addr: u64, buf: &mut [u8]) -> bool {
        if buf.is_empty() {
            return true;
        }
        let Some((&base, bytes)) = self.regions.range(..=addr).next_back() else {
            return false;
        };
        let offset = (addr - base) as usize;
        let end = offset + buf.len();
        if end > bytes.len() {
            return false;
        }
        buf.copy_from_slice(&bytes[offset..end]);
        true
    }
}

/// Resolver backed by a fixed name table, counting lookups per name.
#[derive(Default)]
pub struct ScriptedResolver {
    symbols: BTreeMap<String, u64>,
    lookups: AtomicUsize,
}

impl ScriptedResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, name: &str, address: u64) {
        self.symbols.insert(name.to_string(), address);
    }

    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }
}

impl SymbolResolver for ScriptedResolver {
    fn address_of_symbol(&mut self, name: &str) -> Option<u64> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        self.symbols.get(name).copied()
    }

    fn label_for_address(&mut self, address: u64) -> String {
        self.symbols
            .iter()
            .find(|(_, &a)| a == address)
            .map(|(name, _)| format!("fake+{name}"))
            .unwrap_or_else(|| format!("0x{address:X}"))
    }
}
