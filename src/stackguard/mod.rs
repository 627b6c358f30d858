//! Task-stack guarding built on a memory protection abstraction.
//!
//! Every registered task stack is mapped to one protection region. While
//! guarding is enabled, only the stack of the task last switched in is
//! writable; all other registered stacks are read-only, so a stray write
//! into a sleeping task's stack faults immediately instead of silently
//! corrupting it.
//!
//! The layer is advisory for the allocator and fully independent of it; it
//! shares only the bounded-wait locking discipline.

pub mod mpu;

pub use mpu::{GuardRegion, MemoryProtection, RegionAccess, SoftMpu};

use core::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, error};

/// Smallest supported guard region size in bytes.
pub const MIN_REGION_SIZE: usize = 32;

/// Default bounded wait for the stack guard mutex.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(100);

/// Errors of the stack guard layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum StackGuardError {
    /// The stack size is not a power of two of at least [`MIN_REGION_SIZE`].
    #[error("the stack size is not a supported region size")]
    InvalidRegionSize,
    /// The stack base is not aligned to the region size.
    #[error("the stack base is not aligned for the requested region size")]
    InvalidStackAlignment,
    /// Every region slot is already in use.
    #[error("no protection region is left to be configured")]
    NoRegionLeft,
    /// The protection unit reports zero configurable regions.
    #[error("no memory protection unit is available")]
    NoMpuAvailable,
    /// No guarded stack is registered under the given task id.
    #[error("no guarded stack is registered for the task")]
    TaskNotFound,
    /// The layer's mutex could not be acquired within the bounded wait.
    #[error("could not acquire the stack guard mutex")]
    MutexAcquireFailed,
}

/// Callback invoked with the faulting address when a guarded access is
/// detected.
pub type MemFaultHandler = fn(fault_address: usize);

struct TaskRegion {
    task_id: u32,
    region: GuardRegion,
}

struct GuardState<M> {
    mpu: M,
    /// Registered stack per region slot, mirroring the unit's slot table.
    slots: Vec<Option<TaskRegion>>,
}

/// Guards task stacks with the regions of a [`MemoryProtection`] unit.
pub struct StackGuard<M: MemoryProtection> {
    state: Mutex<GuardState<M>>,
    acquire_timeout: Duration,
    fault_handler: Option<MemFaultHandler>,
}

impl<M: MemoryProtection> StackGuard<M> {
    /// Takes ownership of `mpu`, disabling it and clearing all regions.
    pub fn new(mut mpu: M) -> Result<Self, StackGuardError> {
        let count = mpu.region_count();
        if count == 0 {
            return Err(StackGuardError::NoMpuAvailable);
        }
        mpu.set_enabled(false);
        for slot in 0..count {
            mpu.clear_region(slot);
        }
        let slots = (0..count).map(|_| None).collect();
        Ok(StackGuard {
            state: Mutex::new(GuardState { mpu, slots }),
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            fault_handler: None,
        })
    }

    /// Replaces the bounded wait used when acquiring the layer's mutex.
    pub fn set_acquire_timeout(&mut self, timeout: Duration) {
        self.acquire_timeout = timeout;
    }

    /// Installs a callback invoked when a guarded access is detected.
    pub fn set_fault_handler(&mut self, handler: MemFaultHandler) {
        self.fault_handler = Some(handler);
    }

    fn lock(&self) -> Result<MutexGuard<'_, GuardState<M>>, StackGuardError> {
        self.state.try_lock_for(self.acquire_timeout).ok_or_else(|| {
            error!("could not acquire the stack guard mutex");
            StackGuardError::MutexAcquireFailed
        })
    }

    /// Registers the stack `[stack_base, stack_base + stack_size)` of
    /// `task_id` as a guarded, initially read-only region.
    ///
    /// `stack_size` must be a power of two of at least [`MIN_REGION_SIZE`]
    /// and `stack_base` must be aligned to it.
    pub fn add_task(
        &self,
        task_id: u32,
        stack_base: usize,
        stack_size: usize,
    ) -> Result<(), StackGuardError> {
        if !stack_size.is_power_of_two() || stack_size < MIN_REGION_SIZE {
            return Err(StackGuardError::InvalidRegionSize);
        }
        if stack_base % stack_size != 0 {
            return Err(StackGuardError::InvalidStackAlignment);
        }
        let mut state = self.lock()?;
        let state = &mut *state;
        let Some(slot) = state.slots.iter().position(|slot| slot.is_none()) else {
            return Err(StackGuardError::NoRegionLeft);
        };
        let region = GuardRegion { base: stack_base, size: stack_size, access: RegionAccess::READ };
        state.mpu.configure_region(slot, region);
        state.slots[slot] = Some(TaskRegion { task_id, region });
        debug!(task_id, slot, "Registered guarded task stack.");
        Ok(())
    }

    /// Releases the region guarding `task_id`'s stack.
    pub fn remove_task(&self, task_id: u32) -> Result<(), StackGuardError> {
        let mut state = self.lock()?;
        let state = &mut *state;
        let Some(slot) = state
            .slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|entry| entry.task_id == task_id))
        else {
            return Err(StackGuardError::TaskNotFound);
        };
        state.mpu.clear_region(slot);
        state.slots[slot] = None;
        debug!(task_id, slot, "Removed guarded task stack.");
        Ok(())
    }

    /// Enables the protection for all registered stacks.
    pub fn guard(&self) -> Result<(), StackGuardError> {
        let mut state = self.lock()?;
        state.mpu.set_enabled(true);
        debug!("Stack guarding enabled.");
        Ok(())
    }

    /// Reprograms permissions on a task switch: the incoming task's stack
    /// becomes writable, every other registered stack read-only.
    pub fn task_switch_in(&self, task_id: u32) -> Result<(), StackGuardError> {
        let mut state = self.lock()?;
        let state = &mut *state;
        if !state
            .slots
            .iter()
            .flatten()
            .any(|entry| entry.task_id == task_id)
        {
            return Err(StackGuardError::TaskNotFound);
        }
        for (slot, entry) in state.slots.iter().enumerate() {
            if let Some(entry) = entry {
                let access = if entry.task_id == task_id {
                    RegionAccess::READ | RegionAccess::WRITE
                } else {
                    RegionAccess::READ
                };
                state.mpu.configure_region(slot, GuardRegion { access, ..entry.region });
            }
        }
        debug!(task_id, "Switched writable stack.");
        Ok(())
    }
}

impl<const REGIONS: usize> StackGuard<SoftMpu<REGIONS>> {
    /// Probes an access against the software unit, invoking the fault
    /// handler when the access would fault. Returns whether the access is
    /// allowed.
    pub fn probe_access(&self, addr: usize, write: bool) -> Result<bool, StackGuardError> {
        let state = self.lock()?;
        let allowed = state.mpu.check_access(addr, write);
        drop(state);
        if !allowed {
            error!(addr, write, "Guarded memory access detected.");
            if let Some(handler) = self.fault_handler {
                handler(addr);
            }
        }
        Ok(allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const STACK_A: usize = 0x1000;
    const STACK_B: usize = 0x2000;
    const STACK_SIZE: usize = 1024;

    fn new_guard() -> StackGuard<SoftMpu<4>> {
        StackGuard::new(SoftMpu::<4>::new()).unwrap()
    }

    #[test]
    fn test_no_mpu_available() {
        assert!(matches!(
            StackGuard::new(SoftMpu::<0>::new()),
            Err(StackGuardError::NoMpuAvailable)
        ));
    }

    #[test]
    fn test_add_task_validation() {
        let guard = new_guard();
        assert_eq!(
            guard.add_task(1, STACK_A, 48),
            Err(StackGuardError::InvalidRegionSize)
        );
        assert_eq!(
            guard.add_task(1, STACK_A, 16),
            Err(StackGuardError::InvalidRegionSize)
        );
        assert_eq!(
            guard.add_task(1, STACK_A + 4, STACK_SIZE),
            Err(StackGuardError::InvalidStackAlignment)
        );
        assert_eq!(guard.add_task(1, STACK_A, STACK_SIZE), Ok(()));
    }

    #[test]
    fn test_region_exhaustion() {
        let guard = StackGuard::new(SoftMpu::<2>::new()).unwrap();
        guard.add_task(1, 0x1000, 256).unwrap();
        guard.add_task(2, 0x2000, 256).unwrap();
        assert_eq!(
            guard.add_task(3, 0x3000, 256),
            Err(StackGuardError::NoRegionLeft)
        );
        guard.remove_task(1).unwrap();
        assert_eq!(guard.add_task(3, 0x3000, 256), Ok(()));
    }

    #[test]
    fn test_remove_unknown_task() {
        let guard = new_guard();
        assert_eq!(guard.remove_task(9), Err(StackGuardError::TaskNotFound));
    }

    #[test]
    fn test_switch_unknown_task() {
        let guard = new_guard();
        guard.add_task(1, STACK_A, STACK_SIZE).unwrap();
        assert_eq!(guard.task_switch_in(9), Err(StackGuardError::TaskNotFound));
    }

    #[test]
    fn test_guard_and_switch() {
        static FAULT_ADDR: AtomicUsize = AtomicUsize::new(0);

        fn on_fault(addr: usize) {
            FAULT_ADDR.store(addr, Ordering::SeqCst);
        }

        let mut guard = new_guard();
        guard.set_fault_handler(on_fault);
        guard.add_task(1, STACK_A, STACK_SIZE).unwrap();
        guard.add_task(2, STACK_B, STACK_SIZE).unwrap();

        // Nothing faults until guarding is enabled.
        assert_eq!(guard.probe_access(STACK_A, true), Ok(true));

        guard.guard().unwrap();
        assert_eq!(guard.probe_access(STACK_A, false), Ok(true));
        assert_eq!(guard.probe_access(STACK_A, true), Ok(false));
        assert_eq!(FAULT_ADDR.load(Ordering::SeqCst), STACK_A);

        guard.task_switch_in(1).unwrap();
        assert_eq!(guard.probe_access(STACK_A, true), Ok(true));
        assert_eq!(guard.probe_access(STACK_B, true), Ok(false));

        guard.task_switch_in(2).unwrap();
        assert_eq!(guard.probe_access(STACK_A, true), Ok(false));
        assert_eq!(guard.probe_access(STACK_B, true), Ok(true));

        // Unregistered addresses use the background mapping.
        assert_eq!(guard.probe_access(0x8000, true), Ok(true));
    }
}
