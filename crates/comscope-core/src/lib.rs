//! Read-only introspection of the COM broker runtime inside live processes.
//!
//! comscope opens a target process, locates the broker's undocumented runtime
//! tables through debug symbols, overlays architecture-correct structure
//! layouts on its memory and reconstructs the live cross-process interface
//! registrations plus the security context each object exporter runs under.
//! Nothing is ever written to the target and no code executes inside it.
//!
//! The platform-neutral core (structure overlays, the page-allocator walker,
//! the IPID table parser, the security-descriptor reconstructor) is driven
//! through the [`mem::VirtualMemory`] and [`symbols::SymbolResolver`] traits;
//! the live implementations of those traits are Windows-only.
//!
//! # Typical use
//!
//! ```no_run
//! # #[cfg(windows)] {
//! use comscope_core::{AnalysisSession, ProcessSnapshot};
//!
//! let session = AnalysisSession::new();
//! if let Some(snapshot) = ProcessSnapshot::parse(&session, 1234) {
//!     for entry in &snapshot.ipids {
//!         println!("{} {} running={}", entry.ipid, entry.iid, entry.is_running());
//!     }
//! }
//! # }
//! ```

pub mod error;
pub mod ipid;
pub mod mem;
pub mod overlay;
pub mod pagealloc;
pub mod security;
pub mod snapshot;
pub mod symbols;

#[cfg(windows)]
pub mod process;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{Error, Result};
pub use ipid::{parse_ipid_entries, IpidEntry, IpidFlags};
pub use mem::{PointerWidth, VirtualMemory, VirtualMemoryExt};
pub use pagealloc::PageAllocatorSnapshot;
pub use security::{ReconstructedSecurityDescriptor, NO_ACCESS_CONTROL};
pub use snapshot::{AnalysisSession, AuthnCapabilities, AuthnLevel, ImpLevel, ProcessSnapshot};
pub use symbols::{SymbolCache, SymbolResolver};

#[cfg(windows)]
pub use process::{enable_debug_privilege, find_process_by_name, list_pids, ProcessHandle};
#[cfg(windows)]
pub use snapshot::scan_processes;
#[cfg(windows)]
pub use symbols::DbgHelpResolver;
