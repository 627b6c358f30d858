//! Memory protection abstraction consumed by the stack guard.
//!
//! Only the access-control contract is modeled: a unit maps numbered region
//! slots to address ranges with permissions, plus a global enable. How a
//! concrete unit encodes that into registers is entirely its own business.

use bitflags::bitflags;

bitflags! {
    /// Access permissions for a protection region.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RegionAccess: u8 {
        const READ = 1;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// One programmed protection region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GuardRegion {
    pub base: usize,
    pub size: usize,
    pub access: RegionAccess,
}

/// Access-control contract of a memory protection unit.
pub trait MemoryProtection {
    /// Number of configurable region slots; 0 means no unit is present.
    fn region_count(&self) -> usize;
    /// Programs `region` into `slot`, replacing whatever was there.
    fn configure_region(&mut self, slot: usize, region: GuardRegion);
    /// Invalidates `slot`.
    fn clear_region(&mut self, slot: usize);
    /// Globally enables or disables the protection.
    fn set_enabled(&mut self, enabled: bool);
    fn is_enabled(&self) -> bool;
}

/// Software stand-in for a protection unit, for host-side use and tests.
///
/// Real hardware raises a memory fault on a disallowed access; this
/// implementation exposes the same decision through
/// [`check_access`](SoftMpu::check_access).
#[derive(Clone, Debug)]
pub struct SoftMpu<const REGIONS: usize = 8> {
    regions: [Option<GuardRegion>; REGIONS],
    enabled: bool,
}

impl<const REGIONS: usize> SoftMpu<REGIONS> {
    pub const fn new() -> Self {
        SoftMpu { regions: [None; REGIONS], enabled: false }
    }

    /// Emulates an access: `false` means the access would fault.
    ///
    /// Addresses not covered by any region fall through to the background
    /// mapping, which permits everything.
    pub fn check_access(&self, addr: usize, write: bool) -> bool {
        if !self.enabled {
            return true;
        }
        for region in self.regions.iter().flatten() {
            if addr >= region.base && addr - region.base < region.size {
                let needed = if write { RegionAccess::WRITE } else { RegionAccess::READ };
                return region.access.contains(needed);
            }
        }
        true
    }
}

impl<const REGIONS: usize> Default for SoftMpu<REGIONS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const REGIONS: usize> MemoryProtection for SoftMpu<REGIONS> {
    fn region_count(&self) -> usize {
        REGIONS
    }

    fn configure_region(&mut self, slot: usize, region: GuardRegion) {
        self.regions[slot] = Some(region);
    }

    fn clear_region(&mut self, slot: usize) {
        self.regions[slot] = None;
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_unit_permits_everything() {
        let mut mpu = SoftMpu::<4>::new();
        mpu.configure_region(
            0,
            GuardRegion { base: 0x1000, size: 0x400, access: RegionAccess::empty() },
        );
        assert!(mpu.check_access(0x1000, true));
    }

    #[test]
    fn test_region_permissions() {
        let mut mpu = SoftMpu::<4>::new();
        mpu.configure_region(
            0,
            GuardRegion { base: 0x1000, size: 0x400, access: RegionAccess::READ },
        );
        mpu.set_enabled(true);

        assert!(mpu.check_access(0x1000, false));
        assert!(!mpu.check_access(0x1000, true));
        assert!(!mpu.check_access(0x13FF, true));
        // One past the region falls through to the background mapping.
        assert!(mpu.check_access(0x1400, true));
    }

    #[test]
    fn test_clear_region() {
        let mut mpu = SoftMpu::<2>::new();
        mpu.configure_region(
            1,
            GuardRegion { base: 0x2000, size: 0x100, access: RegionAccess::empty() },
        );
        mpu.set_enabled(true);
        assert!(!mpu.check_access(0x2000, false));
        mpu.clear_region(1);
        assert!(mpu.check_access(0x2000, false));
    }
}
