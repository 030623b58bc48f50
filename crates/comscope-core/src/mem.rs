//! Remote virtual memory access.
//!
//! Everything downstream of the process handle consumes memory through the
//! [`VirtualMemory`] trait, so the table walkers and the security-descriptor
//! reconstructor can be driven by a live process on Windows or by a fabricated
//! in-memory image in tests. A remote process is an adversarial byte source:
//! every read is fallible and every declared length is validated by the caller
//! before it is trusted.

use std::mem::{size_of, MaybeUninit};

/// Pointer width of an inspected process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum PointerWidth {
    Bits32,
    Bits64,
}

impl PointerWidth {
    /// Size in bytes of one pointer-sized value in the target.
    pub fn byte_size(self) -> usize {
        match self {
            PointerWidth::Bits32 => 4,
            PointerWidth::Bits64 => 8,
        }
    }

    pub fn bits(self) -> u32 {
        match self {
            PointerWidth::Bits32 => 32,
            PointerWidth::Bits64 => 64,
        }
    }
}

/// Marker for plain-old-data structure overlays.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` with explicit padding fields and must be
/// valid for every possible bit pattern, so that a value may be materialized
/// directly from untrusted remote bytes.
pub unsafe trait Pod: Copy + 'static {}

unsafe impl Pod for u8 {}
unsafe impl Pod for u16 {}
unsafe impl Pod for u32 {}
unsafe impl Pod for u64 {}
unsafe impl Pod for i32 {}
unsafe impl Pod for i64 {}
unsafe impl Pod for [u8; 16] {}

/// Overlay a `T` on a byte buffer. `None` when the buffer is too short.
pub fn decode<T: Pod>(buf: &[u8]) -> Option<T> {
    if buf.len() < size_of::<T>() {
        return None;
    }
    // Length checked above; Pod guarantees any bit pattern is valid.
    Some(unsafe { std::ptr::read_unaligned(buf.as_ptr().cast::<T>()) })
}

/// Byte-level read access to another process's address space.
pub trait VirtualMemory {
    /// Read exactly `buf.len()` bytes at `addr`. Returns `false` when any part
    /// of the range is unmapped or otherwise unreadable; the buffer contents
    /// are unspecified in that case.
    fn read_into(&self, addr: u64, buf: &mut [u8]) -> bool;
}

/// Longest UTF-16 string the string reader will pull out of a target before
/// assuming the terminator is missing.
const MAX_REMOTE_STRING_CHARS: usize = 32 * 1024;

/// Typed convenience readers over [`VirtualMemory`].
pub trait VirtualMemoryExt: VirtualMemory {
    /// Read `len` bytes as an owned buffer.
    fn read_buffer(&self, addr: u64, len: usize) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; len];
        if self.read_into(addr, &mut buf) {
            Some(buf)
        } else {
            None
        }
    }

    /// Read one `T` structure at `addr`.
    fn read_struct<T: Pod>(&self, addr: u64) -> Option<T> {
        let mut value = MaybeUninit::<T>::uninit();
        let raw = unsafe {
            std::slice::from_raw_parts_mut(value.as_mut_ptr().cast::<u8>(), size_of::<T>())
        };
        if self.read_into(addr, raw) {
            Some(unsafe { value.assume_init() })
        } else {
            None
        }
    }

    /// Read `count` consecutive `T` values starting at `addr`.
    fn read_array<T: Pod>(&self, addr: u64, count: usize) -> Option<Vec<T>> {
        let bytes = self.read_buffer(addr, count.checked_mul(size_of::<T>())?)?;
        let mut out = Vec::with_capacity(count);
        for chunk in bytes.chunks_exact(size_of::<T>()) {
            // Chunk length equals size_of::<T>() by construction.
            out.push(unsafe { std::ptr::read_unaligned(chunk.as_ptr().cast::<T>()) });
        }
        Some(out)
    }

    /// Read one pointer-sized value, widened to 64 bits.
    fn read_pointer(&self, addr: u64, width: PointerWidth) -> Option<u64> {
        match width {
            PointerWidth::Bits64 => self.read_struct::<u64>(addr),
            PointerWidth::Bits32 => self.read_struct::<u32>(addr).map(u64::from),
        }
    }

    /// Read a NUL-terminated UTF-16 string. Unreadable or unterminated
    /// strings yield what was decodable, possibly the empty string.
    fn read_utf16_string(&self, addr: u64) -> String {
        let mut units = Vec::new();
        let mut cursor = addr;
        while units.len() < MAX_REMOTE_STRING_CHARS {
            match self.read_struct::<u16>(cursor) {
                Some(0) | None => break,
                Some(unit) => units.push(unit),
            }
            cursor += 2;
        }
        String::from_utf16_lossy(&units)
    }
}

impl<M: VirtualMemory + ?Sized> VirtualMemoryExt for M {}
