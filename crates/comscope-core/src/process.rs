//! Live process access: handle lifetime, remote reads, token identity,
//! debug-privilege elevation and process enumeration.

use std::ffi::c_void;

use tracing::{debug, warn};
use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{
    CloseHandle, GetLastError, LocalFree, BOOL, HANDLE, HLOCAL, LUID,
};
use windows::Win32::Security::Authorization::ConvertSidToStringSidW;
use windows::Win32::Security::{
    AdjustTokenPrivileges, GetTokenInformation, LookupAccountSidW, LookupPrivilegeValueW,
    TokenUser, LUID_AND_ATTRIBUTES, SE_PRIVILEGE_ENABLED, SID_NAME_USE,
    TOKEN_ADJUST_PRIVILEGES, TOKEN_PRIVILEGES, TOKEN_QUERY, TOKEN_USER,
};
use windows::Win32::System::Diagnostics::Debug::ReadProcessMemory;
use windows::Win32::System::ProcessStatus::EnumProcesses;
use windows::Win32::System::Threading::{
    GetCurrentProcess, IsWow64Process, OpenProcess, OpenProcessToken,
    QueryFullProcessImageNameW, PROCESS_NAME_WIN32, PROCESS_QUERY_INFORMATION, PROCESS_VM_READ,
};

use crate::error::{Error, Result};
use crate::mem::{PointerWidth, VirtualMemory};

/// ERROR_NOT_ALL_ASSIGNED: the privilege exists but the token does not hold it.
const NOT_ALL_ASSIGNED: u32 = 1300;

/// RAII process handle opened for read-only inspection.
pub struct ProcessHandle {
    handle: HANDLE,
    pid: u32,
}

impl ProcessHandle {
    /// Open `pid` with query and VM-read rights.
    pub fn open(pid: u32) -> Result<Self> {
        let handle = unsafe { OpenProcess(PROCESS_QUERY_INFORMATION | PROCESS_VM_READ, false, pid) }
            .map_err(|e| Error::ProcessOpen {
                pid,
                message: e.to_string(),
            })?;
        Ok(Self { handle, pid })
    }

    /// Raw handle for Windows API calls; the wrapper retains ownership.
    pub fn raw(&self) -> HANDLE {
        self.handle
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Pointer width of the target.
    pub fn pointer_width(&self) -> Result<PointerWidth> {
        let mut wow64 = BOOL(0);
        unsafe { IsWow64Process(self.handle, &mut wow64) }?;
        if wow64.as_bool() {
            return Ok(PointerWidth::Bits32);
        }
        // Not emulated: the target runs at the operating system's own width.
        if os_is_64_bit()? {
            Ok(PointerWidth::Bits64)
        } else {
            Ok(PointerWidth::Bits32)
        }
    }

    /// Full Win32 path of the main executable; empty when unavailable.
    pub fn executable_path(&self) -> String {
        let mut buf = [0u16; 1024];
        let mut len = buf.len() as u32;
        let ok = unsafe {
            QueryFullProcessImageNameW(
                self.handle,
                PROCESS_NAME_WIN32,
                PWSTR(buf.as_mut_ptr()),
                &mut len,
            )
        };
        match ok {
            Ok(()) => String::from_utf16_lossy(&buf[..len as usize]),
            Err(e) => {
                debug!(pid = self.pid, error = %e, "QueryFullProcessImageNameW failed");
                String::new()
            }
        }
    }

    /// `(DOMAIN\name, SID string)` of the account the target runs as.
    pub fn token_user(&self) -> Result<(String, String)> {
        let mut token = HANDLE::default();
        unsafe { OpenProcessToken(self.handle, TOKEN_QUERY, &mut token) }?;
        let token = HandleGuard(token);

        unsafe {
            let mut size = 0u32;
            let _ = GetTokenInformation(token.0, TokenUser, None, 0, &mut size);
            if size == 0 {
                return Err(Error::Other("GetTokenInformation reported no size".into()));
            }
            let mut buffer = vec![0u8; size as usize];
            GetTokenInformation(
                token.0,
                TokenUser,
                Some(buffer.as_mut_ptr() as *mut c_void),
                size,
                &mut size,
            )?;
            let token_user = &*(buffer.as_ptr() as *const TOKEN_USER);

            let mut sid_text = PWSTR::null();
            ConvertSidToStringSidW(token_user.User.Sid, &mut sid_text)?;
            let sid_text = LocalPwstr(sid_text);
            let sid = sid_text.0.to_string().unwrap_or_default();

            let mut name_buf = [0u16; 256];
            let mut domain_buf = [0u16; 256];
            let mut name_len = name_buf.len() as u32;
            let mut domain_len = domain_buf.len() as u32;
            let mut sid_use = SID_NAME_USE::default();
            let user = if LookupAccountSidW(
                PCWSTR::null(),
                token_user.User.Sid,
                PWSTR(name_buf.as_mut_ptr()),
                &mut name_len,
                PWSTR(domain_buf.as_mut_ptr()),
                &mut domain_len,
                &mut sid_use,
            )
            .is_ok()
            {
                let name = String::from_utf16_lossy(&name_buf[..name_len as usize]);
                let domain = String::from_utf16_lossy(&domain_buf[..domain_len as usize]);
                if domain.is_empty() {
                    name
                } else {
                    format!("{domain}\\{name}")
                }
            } else {
                String::new()
            };

            Ok((user, sid))
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.handle);
        }
    }
}

impl VirtualMemory for ProcessHandle {
    fn read_into(&self, addr: u64, buf: &mut [u8]) -> bool {
        if buf.is_empty() {
            return true;
        }
        let mut read = 0usize;
        let ok = unsafe {
            ReadProcessMemory(
                self.handle,
                addr as usize as *const c_void,
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
                Some(&mut read),
            )
        };
        // Short reads are failures: callers size every request exactly.
        ok.is_ok() && read == buf.len()
    }
}

struct HandleGuard(HANDLE);

impl Drop for HandleGuard {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

struct LocalPwstr(PWSTR);

impl Drop for LocalPwstr {
    fn drop(&mut self) {
        if !self.0.is_null() {
            let _ = unsafe { LocalFree(HLOCAL(self.0 .0 as isize)) };
        }
    }
}

fn os_is_64_bit() -> Result<bool> {
    if cfg!(target_pointer_width = "64") {
        return Ok(true);
    }
    // A 32-bit build only sees a 64-bit OS through its own emulation layer.
    let mut wow64 = BOOL(0);
    unsafe { IsWow64Process(GetCurrentProcess(), &mut wow64) }?;
    Ok(wow64.as_bool())
}

/// Grant this process `SeDebugPrivilege` so protected targets open.
///
/// One-time, process-wide; callers elevate before starting any parse. Holding
/// the privilege is not required, it only narrows which targets will open.
pub fn enable_debug_privilege() -> Result<()> {
    unsafe {
        let mut token = HANDLE::default();
        OpenProcessToken(
            GetCurrentProcess(),
            TOKEN_QUERY | TOKEN_ADJUST_PRIVILEGES,
            &mut token,
        )?;
        let token = HandleGuard(token);

        let name: Vec<u16> = "SeDebugPrivilege"
            .encode_utf16()
            .chain(std::iter::once(0))
            .collect();
        let mut luid = LUID::default();
        LookupPrivilegeValueW(PCWSTR::null(), PCWSTR(name.as_ptr()), &mut luid)?;

        let privileges = TOKEN_PRIVILEGES {
            PrivilegeCount: 1,
            Privileges: [LUID_AND_ATTRIBUTES {
                Luid: luid,
                Attributes: SE_PRIVILEGE_ENABLED,
            }],
        };
        AdjustTokenPrivileges(token.0, false, Some(&privileges), 0, None, None)?;

        // AdjustTokenPrivileges succeeds even when nothing was granted.
        if GetLastError().0 == NOT_ALL_ASSIGNED {
            warn!("SeDebugPrivilege not held; protected processes will not open");
        }
    }
    Ok(())
}

/// Every process id currently running.
pub fn list_pids() -> Result<Vec<u32>> {
    let mut pids = vec![0u32; 4096];
    let mut returned = 0u32;
    unsafe {
        EnumProcesses(
            pids.as_mut_ptr(),
            (pids.len() * std::mem::size_of::<u32>()) as u32,
            &mut returned,
        )?;
    }
    pids.truncate(returned as usize / std::mem::size_of::<u32>());
    Ok(pids)
}

/// Find a process by executable name, with or without the `.exe` suffix.
pub fn find_process_by_name(name: &str) -> Result<u32> {
    let search = name.to_lowercase();
    let search_exe = if search.ends_with(".exe") {
        search.clone()
    } else {
        format!("{search}.exe")
    };

    for pid in list_pids()? {
        if pid == 0 {
            continue;
        }
        let Ok(process) = ProcessHandle::open(pid) else {
            continue;
        };
        let path = process.executable_path().to_lowercase();
        let file = path.rsplit(['\\', '/']).next().unwrap_or_default();
        if file == search || file == search_exe {
            return Ok(pid);
        }
    }
    Err(Error::Other(format!("process '{name}' not found")))
}
