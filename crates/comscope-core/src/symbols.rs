//! Symbol resolution: the resolver boundary, the width-keyed address cache,
//! and the DbgHelp-backed live implementation.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::mem::PointerWidth;

/// Debug-symbol resolution for one target process.
///
/// Implementations map a qualified `module!symbol` name to a virtual address
/// in the target, and map an address back to a module-relative label. They
/// cache nothing themselves; see [`SymbolCache`].
pub trait SymbolResolver {
    /// Address of `name` in the target, or `None` when the symbol is unknown.
    fn address_of_symbol(&mut self, name: &str) -> Option<u64>;

    /// Human-readable `module+0xOFFSET` label for `address`, falling back to
    /// a bare hex rendering when the address is in no known module.
    fn label_for_address(&mut self, address: u64) -> String;
}

/// Qualified `module!symbol` name.
pub fn qualified_symbol(module: &str, symbol: &str) -> String {
    format!("{module}!{symbol}")
}

/// Width-keyed symbol-address cache.
///
/// Addresses are only meaningful against the resolver instance (and therefore
/// target binary) they were resolved with; the cache is owned by an analysis
/// session and must not outlive it. Only successful resolutions are stored, so
/// a symbol that fails before debug information finishes loading is retried on
/// the next lookup.
#[derive(Default)]
pub struct SymbolCache {
    narrow: Mutex<HashMap<String, u64>>,
    wide: Mutex<HashMap<String, u64>>,
}

impl SymbolCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `name`, consulting the cache for `width` first.
    pub fn resolve<R: SymbolResolver + ?Sized>(
        &self,
        width: PointerWidth,
        resolver: &mut R,
        name: &str,
    ) -> Option<u64> {
        let map = match width {
            PointerWidth::Bits32 => &self.narrow,
            PointerWidth::Bits64 => &self.wide,
        };
        let mut map = match map.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(&address) = map.get(name) {
            return Some(address);
        }
        let address = resolver.address_of_symbol(name)?;
        if address != 0 {
            map.insert(name.to_string(), address);
            Some(address)
        } else {
            None
        }
    }
}

#[cfg(windows)]
pub use dbghelp::DbgHelpResolver;

#[cfg(windows)]
mod dbghelp {
    use std::sync::Mutex;

    use tracing::{debug, warn};
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::System::Diagnostics::Debug::{
        SymCleanup, SymFromNameW, SymGetModuleInfoW64, SymInitializeW, SymSetOptions,
        IMAGEHLP_MODULEW64, SYMBOL_INFOW, SYMOPT_DEFERRED_LOADS, SYMOPT_UNDNAME,
    };

    use super::SymbolResolver;
    use crate::error::{Error, Result};

    /// DbgHelp keeps global state and is not thread-safe; all calls across all
    /// resolver instances are serialized behind this lock.
    static DBGHELP_LOCK: Mutex<()> = Mutex::new(());

    /// Wide characters reserved for symbol names returned by DbgHelp.
    const MAX_NAME_CHARS: usize = 1024;

    /// Live resolver bound to one open process.
    ///
    /// The process handle doubles as the DbgHelp session identifier, so two
    /// resolvers on two different handles coexist. The caller keeps the handle
    /// open for the resolver's lifetime.
    pub struct DbgHelpResolver {
        process: HANDLE,
    }

    impl DbgHelpResolver {
        /// Start a symbol session for `process`, invading it so every loaded
        /// module's symbols are available.
        pub fn new(process: HANDLE) -> Result<Self> {
            let _guard = lock();
            unsafe {
                SymSetOptions(SYMOPT_UNDNAME | SYMOPT_DEFERRED_LOADS);
                SymInitializeW(process, PCWSTR::null(), true)
                    .map_err(|e| Error::SymbolEngine(format!("SymInitializeW failed: {e}")))?;
            }
            Ok(Self { process })
        }
    }

    fn lock() -> std::sync::MutexGuard<'static, ()> {
        match DBGHELP_LOCK.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    impl SymbolResolver for DbgHelpResolver {
        fn address_of_symbol(&mut self, name: &str) -> Option<u64> {
            let _guard = lock();
            let wide: Vec<u16> = name.encode_utf16().chain(std::iter::once(0)).collect();

            // SYMBOL_INFOW carries a trailing name array; reserve it behind
            // the fixed part in an alignment-correct buffer.
            let words =
                (std::mem::size_of::<SYMBOL_INFOW>() + MAX_NAME_CHARS * 2).div_ceil(8);
            let mut buffer = vec![0u64; words];
            let symbol = buffer.as_mut_ptr().cast::<SYMBOL_INFOW>();
            unsafe {
                (*symbol).SizeOfStruct = std::mem::size_of::<SYMBOL_INFOW>() as u32;
                (*symbol).MaxNameLen = MAX_NAME_CHARS as u32;
                if SymFromNameW(self.process, PCWSTR(wide.as_ptr()), symbol).is_err() {
                    debug!(symbol = name, "symbol not found");
                    return None;
                }
                Some((*symbol).Address)
            }
        }

        fn label_for_address(&mut self, address: u64) -> String {
            let _guard = lock();
            let mut module = IMAGEHLP_MODULEW64 {
                SizeOfStruct: std::mem::size_of::<IMAGEHLP_MODULEW64>() as u32,
                ..Default::default()
            };
            unsafe {
                if SymGetModuleInfoW64(self.process, address, &mut module).is_ok() {
                    let len = module
                        .ModuleName
                        .iter()
                        .position(|&c| c == 0)
                        .unwrap_or(module.ModuleName.len());
                    let name = String::from_utf16_lossy(&module.ModuleName[..len]);
                    return format!("{name}+0x{:X}", address - module.BaseOfImage);
                }
            }
            format!("0x{address:X}")
        }
    }

    impl Drop for DbgHelpResolver {
        fn drop(&mut self) {
            let _guard = lock();
            unsafe {
                if let Err(e) = SymCleanup(self.process) {
                    warn!(error = %e, "SymCleanup failed");
                }
            }
        }
    }
}
