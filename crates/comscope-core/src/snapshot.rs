//! The per-process snapshot value object and its assembler.

use serde::Serialize;
use uuid::Uuid;

use crate::ipid::IpidEntry;
use crate::mem::{PointerWidth, VirtualMemory, VirtualMemoryExt};
use crate::symbols::{SymbolCache, SymbolResolver};

/// RPC authentication level the broker was configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuthnLevel {
    Default,
    None,
    Connect,
    Call,
    Pkt,
    PktIntegrity,
    PktPrivacy,
    Unknown(u32),
}

impl From<u32> for AuthnLevel {
    fn from(value: u32) -> Self {
        match value {
            0 => AuthnLevel::Default,
            1 => AuthnLevel::None,
            2 => AuthnLevel::Connect,
            3 => AuthnLevel::Call,
            4 => AuthnLevel::Pkt,
            5 => AuthnLevel::PktIntegrity,
            6 => AuthnLevel::PktPrivacy,
            other => AuthnLevel::Unknown(other),
        }
    }
}

/// RPC impersonation level the broker grants its callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ImpLevel {
    Default,
    Anonymous,
    Identify,
    Impersonate,
    Delegate,
    Unknown(u32),
}

impl From<u32> for ImpLevel {
    fn from(value: u32) -> Self {
        match value {
            0 => ImpLevel::Default,
            1 => ImpLevel::Anonymous,
            2 => ImpLevel::Identify,
            3 => ImpLevel::Impersonate,
            4 => ImpLevel::Delegate,
            other => ImpLevel::Unknown(other),
        }
    }
}

bitflags::bitflags! {
    /// Authentication capability bits (`EOAC_*`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub struct AuthnCapabilities: u32 {
        const MUTUAL_AUTH = 0x1;
        const SECURE_REFS = 0x2;
        const ACCESS_CONTROL = 0x4;
        const APPID = 0x8;
        const DYNAMIC = 0x10;
        const STATIC_CLOAKING = 0x20;
        const DYNAMIC_CLOAKING = 0x40;
        const ANY_AUTHORITY = 0x80;
        const MAKE_FULLSIC = 0x100;
        const REQUIRE_FULLSIC = 0x200;
        const AUTO_IMPERSONATE = 0x400;
        const DEFAULT = 0x800;
        const DISABLE_AAA = 0x1000;
        const NO_CUSTOM_MARSHAL = 0x2000;
    }
}

/// Shared state of one analysis run: the width-keyed symbol caches plus the
/// broker module names to try when qualifying symbols. Cached addresses are
/// only meaningful while the targets they came from keep the broker module at
/// the same base, which holds within one logged-on session.
pub struct AnalysisSession {
    cache: SymbolCache,
    broker_modules: Vec<String>,
}

impl Default for AnalysisSession {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalysisSession {
    pub fn new() -> Self {
        // combase hosts the broker on anything modern; ole32 covers targets
        // still routing through the legacy module.
        Self::with_broker_modules(vec!["combase".to_string(), "ole32".to_string()])
    }

    pub fn with_broker_modules(broker_modules: Vec<String>) -> Self {
        let broker_modules = if broker_modules.is_empty() {
            vec!["combase".to_string()]
        } else {
            broker_modules
        };
        Self {
            cache: SymbolCache::new(),
            broker_modules,
        }
    }

    pub fn cache(&self) -> &SymbolCache {
        &self.cache
    }

    pub fn broker_modules(&self) -> &[String] {
        &self.broker_modules
    }
}

/// Everything comscope can say about one broker-hosting process, captured at
/// a single point in time. Never mutated after assembly; the process and
/// symbol handles it was built from are closed before it is handed out.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSnapshot {
    pub pid: u32,
    pub executable_path: String,
    pub pointer_width: PointerWidth,
    pub ipids: Vec<IpidEntry>,
    /// Application identity the process registered, nil when none.
    pub app_id: Uuid,
    /// SDDL form of the process access permissions, empty when unreadable.
    pub access_permissions: String,
    /// SDDL form of the LRPC endpoint permissions, empty when unreadable.
    pub lrpc_permissions: String,
    pub user: String,
    pub user_sid: String,
    pub rpc_endpoint: String,
    pub capabilities: AuthnCapabilities,
    pub authn_level: AuthnLevel,
    pub imp_level: ImpLevel,
    /// Raw pointer to the broker's custom access-control object.
    pub access_control: u64,
    /// Window handle of the main single-threaded-apartment host.
    pub sta_main_hwnd: u64,
}

impl ProcessSnapshot {
    /// Executable name without directory or extension. Paths come from the
    /// target system, so both separator styles are handled explicitly.
    pub fn name(&self) -> String {
        let file = self
            .executable_path
            .rsplit(['\\', '/'])
            .next()
            .unwrap_or_default();
        match file.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem.to_string(),
            _ => file.to_string(),
        }
    }
}

// =============================================================================
// Scalar symbol reads
// =============================================================================

/// Read a 32-bit value stored at a named symbol; zero when the symbol does
/// not resolve or the slot is unreadable.
pub fn read_symbol_u32<M, R>(
    mem: &M,
    cache: &SymbolCache,
    resolver: &mut R,
    width: PointerWidth,
    name: &str,
) -> u32
where
    M: VirtualMemory,
    R: SymbolResolver + ?Sized,
{
    cache
        .resolve(width, resolver, name)
        .and_then(|addr| mem.read_struct::<u32>(addr))
        .unwrap_or(0)
}

/// Read a pointer-sized value stored at a named symbol, widened to 64 bits.
pub fn read_symbol_pointer<M, R>(
    mem: &M,
    cache: &SymbolCache,
    resolver: &mut R,
    width: PointerWidth,
    name: &str,
) -> u64
where
    M: VirtualMemory,
    R: SymbolResolver + ?Sized,
{
    cache
        .resolve(width, resolver, name)
        .and_then(|addr| mem.read_pointer(addr, width))
        .unwrap_or(0)
}

/// Read a GUID stored at a named symbol; nil when unavailable.
pub fn read_symbol_guid<M, R>(
    mem: &M,
    cache: &SymbolCache,
    resolver: &mut R,
    width: PointerWidth,
    name: &str,
) -> Uuid
where
    M: VirtualMemory,
    R: SymbolResolver + ?Sized,
{
    cache
        .resolve(width, resolver, name)
        .and_then(|addr| mem.read_struct::<[u8; 16]>(addr))
        .map(Uuid::from_bytes_le)
        .unwrap_or(Uuid::nil())
}

/// Read a NUL-terminated UTF-16 string embedded at a named symbol.
pub fn read_symbol_string<M, R>(
    mem: &M,
    cache: &SymbolCache,
    resolver: &mut R,
    width: PointerWidth,
    name: &str,
) -> String
where
    M: VirtualMemory,
    R: SymbolResolver + ?Sized,
{
    cache
        .resolve(width, resolver, name)
        .map(|addr| mem.read_utf16_string(addr))
        .unwrap_or_default()
}

/// The broker registers its RPC endpoint under an `OLE` prefix; an absent or
/// blank endpoint stays empty.
pub fn normalize_endpoint(raw: &str) -> String {
    if raw.trim().is_empty() {
        String::new()
    } else {
        format!("OLE{raw}")
    }
}

#[cfg(windows)]
pub use assemble::{scan_processes, ScanProgress};

#[cfg(windows)]
mod assemble {
    use tracing::{debug, info, warn};

    use super::*;
    use crate::ipid::parse_ipid_entries;
    use crate::process::{enable_debug_privilege, list_pids, ProcessHandle};
    use crate::security::read_security_descriptor;
    use crate::symbols::{qualified_symbol, DbgHelpResolver};

    /// Progress callback for a system-wide scan: pid, index, total.
    pub type ScanProgress<'a> = &'a mut dyn FnMut(u32, usize, usize);

    impl ProcessSnapshot {
        /// Parse one target process.
        ///
        /// Returns `None`, never an error, when the target cannot be opened,
        /// runs an architecture this build cannot introspect, or the symbol
        /// engine cannot bind to it; a scan over many processes skips such
        /// targets and continues.
        pub fn parse(session: &AnalysisSession, pid: u32) -> Option<ProcessSnapshot> {
            let process = match ProcessHandle::open(pid) {
                Ok(process) => process,
                Err(e) => {
                    debug!(pid, error = %e, "cannot open target");
                    return None;
                }
            };
            let width = match process.pointer_width() {
                Ok(width) => width,
                Err(e) => {
                    debug!(pid, error = %e, "cannot determine target width");
                    return None;
                }
            };
            if width == PointerWidth::Bits64 && cfg!(target_pointer_width = "32") {
                let mismatch = crate::Error::ArchitectureMismatch { target: 64, host: 32 };
                debug!(pid, error = %mismatch, "skipping target");
                return None;
            }

            let mut resolver = match DbgHelpResolver::new(process.raw()) {
                Ok(resolver) => resolver,
                Err(e) => {
                    debug!(pid, error = %e, "cannot bind symbol engine");
                    return None;
                }
            };
            let cache = session.cache();

            // The broker module determines every qualified symbol name below;
            // whichever module resolves the IPID table owns the runtime.
            let mut broker = session.broker_modules().first().map(String::as_str)?;
            let mut ipid_table = None;
            for module in session.broker_modules() {
                let name = qualified_symbol(module, "CIPIDTable::_palloc");
                if let Some(addr) = cache.resolve(width, &mut resolver, &name) {
                    broker = module.as_str();
                    ipid_table = Some(addr);
                    break;
                }
            }

            let ipids = match ipid_table {
                Some(table) => parse_ipid_entries(&process, &mut resolver, width, table),
                None => {
                    debug!(pid, "IPID table symbol not found");
                    Vec::new()
                }
            };
            info!(pid, entries = ipids.len(), broker, "parsed broker state");

            let sym = |name: &str| qualified_symbol(broker, name);
            let (user, user_sid) = process.token_user().unwrap_or_default();
            let endpoint =
                read_symbol_string(&process, cache, &mut resolver, width, &sym("gwszLRPCEndPoint"));

            let snapshot = ProcessSnapshot {
                pid,
                executable_path: process.executable_path(),
                pointer_width: width,
                ipids,
                app_id: read_symbol_guid(&process, cache, &mut resolver, width, &sym("g_AppId")),
                access_permissions: read_security_descriptor(
                    &process,
                    cache,
                    &mut resolver,
                    width,
                    &sym("gSecDesc"),
                ),
                lrpc_permissions: read_security_descriptor(
                    &process,
                    cache,
                    &mut resolver,
                    width,
                    &sym("gLrpcSecurityDescriptor"),
                ),
                user,
                user_sid,
                rpc_endpoint: normalize_endpoint(&endpoint),
                capabilities: AuthnCapabilities::from_bits_retain(read_symbol_u32(
                    &process,
                    cache,
                    &mut resolver,
                    width,
                    &sym("gCapabilities"),
                )),
                authn_level: AuthnLevel::from(read_symbol_u32(
                    &process,
                    cache,
                    &mut resolver,
                    width,
                    &sym("gAuthnLevel"),
                )),
                imp_level: ImpLevel::from(read_symbol_u32(
                    &process,
                    cache,
                    &mut resolver,
                    width,
                    &sym("gImpLevel"),
                )),
                access_control: read_symbol_pointer(
                    &process,
                    cache,
                    &mut resolver,
                    width,
                    &sym("gAccessControl"),
                ),
                sta_main_hwnd: read_symbol_pointer(
                    &process,
                    cache,
                    &mut resolver,
                    width,
                    &sym("ghwndOleMainThread"),
                ),
            };

            // Remote handles go before the snapshot does.
            drop(resolver);
            drop(process);
            Some(snapshot)
        }
    }

    /// Parse every other process on the system, skipping the ones that cannot
    /// be opened or hold no broker state. Debug privilege is acquired once up
    /// front; failure to get it only narrows which targets will open.
    pub fn scan_processes(
        session: &AnalysisSession,
        mut progress: Option<ScanProgress<'_>>,
    ) -> Vec<ProcessSnapshot> {
        if let Err(e) = enable_debug_privilege() {
            warn!(error = %e, "continuing scan without debug privilege");
        }
        let pids = match list_pids() {
            Ok(pids) => pids,
            Err(e) => {
                warn!(error = %e, "process enumeration failed");
                return Vec::new();
            }
        };

        let own_pid = std::process::id();
        let targets: Vec<u32> = pids.into_iter().filter(|&p| p != 0 && p != own_pid).collect();
        let total = targets.len();

        let mut snapshots = Vec::new();
        for (index, pid) in targets.into_iter().enumerate() {
            if let Some(report) = progress.as_mut() {
                report(pid, index, total);
            }
            if let Some(snapshot) = ProcessSnapshot::parse(session, pid) {
                snapshots.push(snapshot);
            }
        }
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeMemory, ScriptedResolver};

    fn fixture() -> (FakeMemory, ScriptedResolver, SymbolCache) {
        (FakeMemory::new(), ScriptedResolver::new(), SymbolCache::new())
    }

    #[test]
    fn unresolved_scalars_default_to_zero_values() {
        let (image, mut resolver, cache) = fixture();
        let w = PointerWidth::Bits64;
        assert_eq!(
            read_symbol_u32(&image, &cache, &mut resolver, w, "combase!gAuthnLevel"),
            0
        );
        assert_eq!(
            read_symbol_pointer(&image, &cache, &mut resolver, w, "combase!gAccessControl"),
            0
        );
        assert!(read_symbol_guid(&image, &cache, &mut resolver, w, "combase!g_AppId").is_nil());
        assert_eq!(
            read_symbol_string(&image, &cache, &mut resolver, w, "combase!gwszLRPCEndPoint"),
            ""
        );
    }

    #[test]
    fn scalars_read_through_resolved_symbols() {
        let (mut image, mut resolver, cache) = fixture();
        resolver.define("combase!gAuthnLevel", 0x1000);
        resolver.define("combase!gAccessControl", 0x2000);
        resolver.define("combase!g_AppId", 0x3000);
        resolver.define("combase!gwszLRPCEndPoint", 0x4000);
        image.put_u32(0x1000, 6);
        image.put_u64(0x2000, 0x7FFE_0000_1234);
        let app_id: uuid::Uuid = "a61c8cdb-0f4c-41f0-9066-b26c8fca0a2d".parse().unwrap();
        image.put_guid(0x3000, app_id);
        image.put_utf16(0x4000, "1A2B3C");

        let w = PointerWidth::Bits64;
        assert_eq!(
            read_symbol_u32(&image, &cache, &mut resolver, w, "combase!gAuthnLevel"),
            6
        );
        assert_eq!(
            read_symbol_pointer(&image, &cache, &mut resolver, w, "combase!gAccessControl"),
            0x7FFE_0000_1234
        );
        assert_eq!(
            read_symbol_guid(&image, &cache, &mut resolver, w, "combase!g_AppId"),
            app_id
        );
        assert_eq!(
            read_symbol_string(&image, &cache, &mut resolver, w, "combase!gwszLRPCEndPoint"),
            "1A2B3C"
        );
    }

    #[test]
    fn narrow_targets_read_narrow_pointers() {
        let (mut image, mut resolver, cache) = fixture();
        resolver.define("ole32!gAccessControl", 0x1000);
        image.put_u32(0x1000, 0x00C0_FFEE);
        assert_eq!(
            read_symbol_pointer(
                &image,
                &cache,
                &mut resolver,
                PointerWidth::Bits32,
                "ole32!gAccessControl"
            ),
            0x00C0_FFEE
        );
    }

    #[test]
    fn endpoint_gets_ole_prefix_only_when_present() {
        assert_eq!(normalize_endpoint("1A2B3C"), "OLE1A2B3C");
        assert_eq!(normalize_endpoint(""), "");
        assert_eq!(normalize_endpoint("   "), "");
    }

    #[test]
    fn policy_enums_decode_raw_values() {
        assert_eq!(AuthnLevel::from(6), AuthnLevel::PktPrivacy);
        assert_eq!(AuthnLevel::from(42), AuthnLevel::Unknown(42));
        assert_eq!(ImpLevel::from(3), ImpLevel::Impersonate);
        assert_eq!(ImpLevel::from(9), ImpLevel::Unknown(9));
    }

    #[test]
    fn snapshot_name_is_the_file_stem() {
        let snapshot = ProcessSnapshot {
            pid: 4242,
            executable_path: r"C:\Windows\System32\svchost.exe".to_string(),
            pointer_width: PointerWidth::Bits64,
            ipids: Vec::new(),
            app_id: uuid::Uuid::nil(),
            access_permissions: String::new(),
            lrpc_permissions: String::new(),
            user: String::new(),
            user_sid: String::new(),
            rpc_endpoint: String::new(),
            capabilities: AuthnCapabilities::empty(),
            authn_level: AuthnLevel::Default,
            imp_level: ImpLevel::Default,
            access_control: 0,
            sta_main_hwnd: 0,
        };
        assert_eq!(snapshot.name(), "svchost");
    }

    #[cfg(windows)]
    #[test]
    fn unopenable_pid_yields_absence_not_a_fault() {
        let session = AnalysisSession::new();
        // Pid 0 is the idle pseudo-process and can never be opened for reads.
        assert!(ProcessSnapshot::parse(&session, 0).is_none());
    }
}
