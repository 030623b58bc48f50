//! Reconstruction of security descriptors scattered across remote
//! allocations.
//!
//! The broker stores descriptors as a header plus owner SID, group SID, DACL
//! and SACL living in independent allocations (absolute form) or packed
//! behind offsets (self-relative form). Each sub-component is fetched and
//! validated on its own against its embedded header before any declared
//! length is trusted; a component that fails validation is dropped while the
//! rest of the descriptor survives.

use tracing::debug;

use crate::mem::{PointerWidth, VirtualMemory, VirtualMemoryExt};
use crate::overlay::{
    AclHeader, SdAbsolute32, SdAbsolute64, SdControl, SdRelative, SecurityDescriptorHeader,
    SecurityDescriptorView, SidHeader,
};

/// Descriptor string stored when the remote descriptor pointer itself was
/// readable but null: the object explicitly grants no access.
pub const NO_ACCESS_CONTROL: &str = "D:NO_ACCESS_CONTROL";

const SD_REVISION: u8 = 1;
const SID_REVISION: u8 = 1;
const MAX_ACL_REVISION: u8 = 4;

/// A descriptor reassembled into locally owned buffers, with the
/// self-relative control bit cleared since every component is now local.
#[derive(Debug, Clone)]
pub struct ReconstructedSecurityDescriptor {
    pub revision: u8,
    pub control: SdControl,
    pub owner: Option<Vec<u8>>,
    pub group: Option<Vec<u8>>,
    pub dacl: Option<Vec<u8>>,
    pub sacl: Option<Vec<u8>>,
}

/// Fetch and reassemble the descriptor at `address`. `None` when the header
/// is unreadable or carries an unknown revision.
pub fn reconstruct<M: VirtualMemory>(
    mem: &M,
    address: u64,
    width: PointerWidth,
) -> Option<ReconstructedSecurityDescriptor> {
    let header = mem.read_struct::<SecurityDescriptorHeader>(address)?;
    if header.revision != SD_REVISION {
        debug!(revision = header.revision, "unknown security descriptor revision");
        return None;
    }
    let control = header.control();

    let (owner_at, group_at, sacl_at, dacl_at) = if control.contains(SdControl::SELF_RELATIVE) {
        component_addresses(&mem.read_struct::<SdRelative>(address)?, address)
    } else {
        match width {
            PointerWidth::Bits64 => {
                component_addresses(&mem.read_struct::<SdAbsolute64>(address)?, address)
            }
            PointerWidth::Bits32 => {
                component_addresses(&mem.read_struct::<SdAbsolute32>(address)?, address)
            }
        }
    };

    Some(ReconstructedSecurityDescriptor {
        revision: header.revision,
        control: control.difference(SdControl::SELF_RELATIVE),
        owner: if control.contains(SdControl::OWNER_DEFAULTED) {
            None
        } else {
            read_sid(mem, owner_at)
        },
        group: if control.contains(SdControl::GROUP_DEFAULTED) {
            None
        } else {
            read_sid(mem, group_at)
        },
        dacl: if control.contains(SdControl::DACL_PRESENT) {
            read_acl(mem, dacl_at)
        } else {
            None
        },
        sacl: if control.contains(SdControl::SACL_PRESENT) {
            read_acl(mem, sacl_at)
        } else {
            None
        },
    })
}

fn component_addresses<V: SecurityDescriptorView>(view: &V, base: u64) -> (u64, u64, u64, u64) {
    (
        view.owner(base),
        view.group(base),
        view.sacl(base),
        view.dacl(base),
    )
}

/// Fetch one SID: validate the 8-byte header, then read the
/// `8 + rid_count * 4` bytes it declares.
fn read_sid<M: VirtualMemory>(mem: &M, address: u64) -> Option<Vec<u8>> {
    if address == 0 {
        return None;
    }
    let header = mem.read_struct::<SidHeader>(address)?;
    if header.revision != SID_REVISION {
        debug!(revision = header.revision, "rejecting SID with bad revision");
        return None;
    }
    mem.read_buffer(address, 8 + usize::from(header.rid_count) * 4)
}

/// Fetch one ACL: validate the fixed header, then read the size it declares.
fn read_acl<M: VirtualMemory>(mem: &M, address: u64) -> Option<Vec<u8>> {
    if address == 0 {
        return None;
    }
    let header = mem.read_struct::<AclHeader>(address)?;
    if header.revision > MAX_ACL_REVISION {
        debug!(revision = header.revision, "rejecting ACL with bad revision");
        return None;
    }
    if usize::from(header.size) < std::mem::size_of::<AclHeader>() {
        debug!(size = header.size, "rejecting ACL smaller than its own header");
        return None;
    }
    mem.read_buffer(address, usize::from(header.size))
}

#[cfg(windows)]
pub use sddl::{read_security_descriptor, to_sddl};

#[cfg(windows)]
mod sddl {
    use std::ffi::c_void;

    use windows::core::PWSTR;
    use windows::Win32::Foundation::{LocalFree, HLOCAL};
    use windows::Win32::Security::Authorization::{
        ConvertSecurityDescriptorToStringSecurityDescriptorW, SDDL_REVISION_1,
    };
    use windows::Win32::Security::{
        ACL, DACL_SECURITY_INFORMATION, GROUP_SECURITY_INFORMATION, LABEL_SECURITY_INFORMATION,
        OWNER_SECURITY_INFORMATION, PSECURITY_DESCRIPTOR, PSID, SECURITY_DESCRIPTOR,
        SECURITY_DESCRIPTOR_CONTROL,
    };

    use super::{reconstruct, ReconstructedSecurityDescriptor, NO_ACCESS_CONTROL};
    use crate::mem::{PointerWidth, VirtualMemory, VirtualMemoryExt};
    use crate::symbols::{SymbolCache, SymbolResolver};

    /// String returned by `ConvertSecurityDescriptorToStringSecurityDescriptorW`,
    /// freed on every exit path.
    struct LocalText(PWSTR);

    impl Drop for LocalText {
        fn drop(&mut self) {
            if !self.0.is_null() {
                let _ = unsafe { LocalFree(HLOCAL(self.0 .0 as isize)) };
            }
        }
    }

    /// Render a reconstructed descriptor in the security descriptor
    /// definition language, with the full information-class set.
    pub fn to_sddl(descriptor: &ReconstructedSecurityDescriptor) -> Option<String> {
        let mut absolute = SECURITY_DESCRIPTOR {
            Revision: descriptor.revision,
            Sbz1: 0,
            Control: SECURITY_DESCRIPTOR_CONTROL(descriptor.control.bits()),
            ..Default::default()
        };
        if let Some(owner) = &descriptor.owner {
            absolute.Owner = PSID(owner.as_ptr() as *mut c_void);
        }
        if let Some(group) = &descriptor.group {
            absolute.Group = PSID(group.as_ptr() as *mut c_void);
        }
        if let Some(dacl) = &descriptor.dacl {
            absolute.Dacl = dacl.as_ptr() as *mut ACL;
        }
        if let Some(sacl) = &descriptor.sacl {
            absolute.Sacl = sacl.as_ptr() as *mut ACL;
        }

        let mut text = PWSTR::null();
        unsafe {
            ConvertSecurityDescriptorToStringSecurityDescriptorW(
                PSECURITY_DESCRIPTOR(&mut absolute as *mut _ as *mut c_void),
                SDDL_REVISION_1,
                OWNER_SECURITY_INFORMATION
                    | GROUP_SECURITY_INFORMATION
                    | DACL_SECURITY_INFORMATION
                    | LABEL_SECURITY_INFORMATION,
                &mut text,
                None,
            )
            .ok()?;
        }
        let text = LocalText(text);
        unsafe { text.0.to_string().ok() }
    }

    /// Read the descriptor a named broker global points at.
    ///
    /// The symbol holds a *pointer to* the descriptor: an unresolvable symbol
    /// or unreadable slot yields the empty string, a readable null pointer
    /// yields [`NO_ACCESS_CONTROL`], and anything else is reconstructed and
    /// rendered (empty again if it fails validation).
    pub fn read_security_descriptor<M, R>(
        mem: &M,
        cache: &SymbolCache,
        resolver: &mut R,
        width: PointerWidth,
        symbol: &str,
    ) -> String
    where
        M: VirtualMemory,
        R: SymbolResolver + ?Sized,
    {
        let Some(slot) = cache.resolve(width, resolver, symbol) else {
            return String::new();
        };
        let Some(pointer) = mem.read_pointer(slot, width) else {
            return String::new();
        };
        if pointer == 0 {
            return NO_ACCESS_CONTROL.to_string();
        }
        reconstruct(mem, pointer, width)
            .and_then(|descriptor| to_sddl(&descriptor))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeMemory;

    const SD: u64 = 0x10_0000;
    const OWNER: u64 = 0x20_0000;
    const GROUP: u64 = 0x21_0000;
    const DACL: u64 = 0x22_0000;
    const SACL: u64 = 0x23_0000;

    fn sid_bytes(revision: u8, rids: &[u32]) -> Vec<u8> {
        let mut bytes = vec![revision, rids.len() as u8, 0, 0, 0, 0, 0, 5];
        for rid in rids {
            bytes.extend_from_slice(&rid.to_le_bytes());
        }
        bytes
    }

    fn acl_bytes(revision: u8, size: u16) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.push(revision);
        bytes.push(0);
        bytes.extend_from_slice(&size.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes()); // ace count
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.resize(bytes.len().max(usize::from(size)), 0xCC);
        bytes
    }

    fn absolute_sd_64(control: u16, owner: u64, group: u64, sacl: u64, dacl: u64) -> Vec<u8> {
        let mut bytes = vec![1u8, 0];
        bytes.extend_from_slice(&control.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&owner.to_le_bytes());
        bytes.extend_from_slice(&group.to_le_bytes());
        bytes.extend_from_slice(&sacl.to_le_bytes());
        bytes.extend_from_slice(&dacl.to_le_bytes());
        bytes
    }

    #[test]
    fn assembles_all_validated_components() {
        let mut image = FakeMemory::new();
        let control = (SdControl::DACL_PRESENT | SdControl::SACL_PRESENT).bits();
        image.put(SD, &absolute_sd_64(control, OWNER, GROUP, SACL, DACL));
        image.put(OWNER, &sid_bytes(1, &[32, 544]));
        image.put(GROUP, &sid_bytes(1, &[18]));
        image.put(DACL, &acl_bytes(2, 64));
        image.put(SACL, &acl_bytes(2, 16));

        let sd = reconstruct(&image, SD, PointerWidth::Bits64).unwrap();
        assert_eq!(sd.revision, 1);
        assert_eq!(sd.owner.as_deref(), Some(&sid_bytes(1, &[32, 544])[..]));
        assert_eq!(sd.group.as_deref(), Some(&sid_bytes(1, &[18])[..]));
        assert_eq!(sd.dacl.as_ref().map(Vec::len), Some(64));
        assert_eq!(sd.sacl.as_ref().map(Vec::len), Some(16));
    }

    #[test]
    fn same_bytes_in_reconstruct_deterministically() {
        let mut image = FakeMemory::new();
        image.put(
            SD,
            &absolute_sd_64(SdControl::DACL_PRESENT.bits(), OWNER, GROUP, 0, DACL),
        );
        image.put(OWNER, &sid_bytes(1, &[500]));
        image.put(GROUP, &sid_bytes(1, &[513]));
        image.put(DACL, &acl_bytes(2, 32));

        let first = reconstruct(&image, SD, PointerWidth::Bits64).unwrap();
        let second = reconstruct(&image, SD, PointerWidth::Bits64).unwrap();
        assert_eq!(first.owner, second.owner);
        assert_eq!(first.group, second.group);
        assert_eq!(first.dacl, second.dacl);
        assert_eq!(first.control, second.control);
    }

    #[test]
    fn unknown_header_revision_is_not_a_descriptor() {
        let mut image = FakeMemory::new();
        let mut bytes = absolute_sd_64(0, OWNER, GROUP, 0, 0);
        bytes[0] = 2;
        image.put(SD, &bytes);
        assert!(reconstruct(&image, SD, PointerWidth::Bits64).is_none());
    }

    #[test]
    fn self_relative_bit_is_cleared_on_output() {
        let mut image = FakeMemory::new();
        // Self-relative image: owner packed 20 bytes in, DACL 40 bytes in.
        let mut bytes = vec![1u8, 0];
        let control = SdControl::SELF_RELATIVE | SdControl::DACL_PRESENT;
        bytes.extend_from_slice(&control.bits().to_le_bytes());
        bytes.extend_from_slice(&20u32.to_le_bytes()); // owner offset
        bytes.extend_from_slice(&0u32.to_le_bytes()); // group offset
        bytes.extend_from_slice(&0u32.to_le_bytes()); // sacl offset
        bytes.extend_from_slice(&40u32.to_le_bytes()); // dacl offset
        bytes.extend_from_slice(&sid_bytes(1, &[544]));
        bytes.resize(40, 0);
        bytes.extend_from_slice(&acl_bytes(2, 12));
        image.put(SD, &bytes);

        let sd = reconstruct(&image, SD, PointerWidth::Bits64).unwrap();
        assert!(!sd.control.contains(SdControl::SELF_RELATIVE));
        assert_eq!(sd.owner.as_deref(), Some(&sid_bytes(1, &[544])[..]));
        assert_eq!(sd.dacl.as_ref().map(Vec::len), Some(12));
        assert_eq!(sd.group, None);
    }

    #[test]
    fn bad_sid_revision_drops_that_component_only() {
        let mut image = FakeMemory::new();
        image.put(
            SD,
            &absolute_sd_64(SdControl::DACL_PRESENT.bits(), OWNER, GROUP, 0, DACL),
        );
        image.put(OWNER, &sid_bytes(3, &[32])); // adversarial revision
        image.put(GROUP, &sid_bytes(1, &[18]));
        image.put(DACL, &acl_bytes(2, 16));

        let sd = reconstruct(&image, SD, PointerWidth::Bits64).unwrap();
        assert_eq!(sd.owner, None);
        assert!(sd.group.is_some());
        assert!(sd.dacl.is_some());
    }

    #[test]
    fn acl_declaring_less_than_its_header_is_rejected() {
        let mut image = FakeMemory::new();
        image.put(
            SD,
            &absolute_sd_64(SdControl::DACL_PRESENT.bits(), 0, 0, 0, DACL),
        );
        image.put(DACL, &acl_bytes(2, 4));
        let sd = reconstruct(&image, SD, PointerWidth::Bits64).unwrap();
        assert_eq!(sd.dacl, None);
    }

    #[test]
    fn acl_revision_above_four_is_rejected() {
        let mut image = FakeMemory::new();
        image.put(
            SD,
            &absolute_sd_64(SdControl::DACL_PRESENT.bits(), 0, 0, 0, DACL),
        );
        image.put(DACL, &acl_bytes(5, 16));
        let sd = reconstruct(&image, SD, PointerWidth::Bits64).unwrap();
        assert_eq!(sd.dacl, None);
    }

    #[test]
    fn owner_and_group_defaulted_bits_act_independently() {
        let mut image = FakeMemory::new();
        image.put(
            SD,
            &absolute_sd_64(SdControl::GROUP_DEFAULTED.bits(), OWNER, GROUP, 0, 0),
        );
        image.put(OWNER, &sid_bytes(1, &[32]));
        image.put(GROUP, &sid_bytes(1, &[18]));

        let sd = reconstruct(&image, SD, PointerWidth::Bits64).unwrap();
        assert!(sd.owner.is_some());
        assert_eq!(sd.group, None);

        image.put(
            SD,
            &absolute_sd_64(SdControl::OWNER_DEFAULTED.bits(), OWNER, GROUP, 0, 0),
        );
        let sd = reconstruct(&image, SD, PointerWidth::Bits64).unwrap();
        assert_eq!(sd.owner, None);
        assert!(sd.group.is_some());
    }

    // S-1-5-18 (Local System) and S-1-5-32-544 (Administrators): well-known
    // accounts with fixed SDDL abbreviations, so the rendered text is
    // deterministic on any machine.
    #[cfg(windows)]
    #[test]
    fn reconstructed_descriptor_renders_well_known_accounts() {
        let system = vec![1u8, 1, 0, 0, 0, 0, 0, 5, 18, 0, 0, 0];
        let admins = vec![1u8, 2, 0, 0, 0, 0, 0, 5, 32, 0, 0, 0, 32, 2, 0, 0];
        let descriptor = ReconstructedSecurityDescriptor {
            revision: 1,
            control: SdControl::empty(),
            owner: Some(system),
            group: Some(admins),
            dacl: None,
            sacl: None,
        };

        let first = to_sddl(&descriptor).expect("conversion");
        let second = to_sddl(&descriptor).expect("conversion");
        assert_eq!(first, second);
        assert!(first.contains("O:SY"), "got {first}");
        assert!(first.contains("G:BA"), "got {first}");
    }

    #[test]
    fn narrow_absolute_descriptor_uses_narrow_pointers() {
        let mut image = FakeMemory::new();
        let mut bytes = vec![1u8, 0, 0, 0];
        bytes.extend_from_slice(&(OWNER as u32).to_le_bytes());
        bytes.extend_from_slice(&(GROUP as u32).to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        image.put(SD, &bytes);
        image.put(OWNER, &sid_bytes(1, &[501]));
        image.put(GROUP, &sid_bytes(1, &[513]));

        let sd = reconstruct(&image, SD, PointerWidth::Bits32).unwrap();
        assert_eq!(sd.owner.as_deref(), Some(&sid_bytes(1, &[501])[..]));
        assert_eq!(sd.group.as_deref(), Some(&sid_bytes(1, &[513])[..]));
    }
}
