//! Suspend operation substitution
//!
//! For one suspend/resume cycle the kernel's suspend operations are swapped
//! for the Falcon ones. [`SuspendCoordinator::enter`] hands out a guard; the
//! original operations come back when the guard drops, on every path.

use core::sync::atomic::{AtomicBool, Ordering};

use spinning_top::Spinlock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FalconMode {
    /// CPU stays powered, devices off
    Standby,
    /// Suspend to RAM through the BIOS
    Mem,
}

/// Installed suspend operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendOps {
    /// The kernel's own suspend-to-RAM path
    Kernel,
    Falcon(FalconMode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendError {
    /// An earlier `enter` has not exited yet
    AlreadyActive,
    /// The power transition failed with this code
    Trigger(i32),
    /// Falcon is not usable
    NotReady,
}

impl core::fmt::Display for SuspendError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SuspendError::AlreadyActive => write!(f, "Suspend operations already substituted"),
            SuspendError::Trigger(rc) => write!(f, "Suspend transition failed ({})", rc),
            SuspendError::NotReady => write!(f, "Falcon not ready"),
        }
    }
}

struct State {
    active: SuspendOps,
    /// Operations to restore; `Some` while an enter is outstanding
    saved: Option<SuspendOps>,
    generation: u64,
}

pub struct SuspendCoordinator {
    state: Spinlock<State>,
    in_falcon: AtomicBool,
}

impl SuspendCoordinator {
    pub const fn new() -> Self {
        Self {
            state: Spinlock::new(State {
                active: SuspendOps::Kernel,
                saved: None,
                generation: 0,
            }),
            in_falcon: AtomicBool::new(false),
        }
    }

    pub fn active(&self) -> SuspendOps {
        self.state.lock().active
    }

    /// True while an `enter` is outstanding. Drivers check this to skip
    /// their own hardware reinit on resume.
    pub fn is_in_falcon(&self) -> bool {
        self.in_falcon.load(Ordering::Acquire)
    }

    /// Install `ops` and run `trigger` with them in place.
    ///
    /// If the trigger fails the substitution is undone before the error is
    /// returned. Otherwise the returned guard keeps `ops` installed until it
    /// is dropped or [`SuspendCoordinator::exit`] is called.
    pub fn enter<F>(&self, ops: SuspendOps, trigger: F) -> Result<SuspendGuard<'_>, SuspendError>
    where
        F: FnOnce(&SuspendOps) -> Result<(), SuspendError>,
    {
        let generation = {
            let mut state = self.state.lock();
            if state.saved.is_some() {
                return Err(SuspendError::AlreadyActive);
            }
            state.saved = Some(state.active);
            state.active = ops;
            state.generation += 1;
            state.generation
        };
        self.in_falcon.store(true, Ordering::Release);

        if let Err(e) = trigger(&ops) {
            log::warn!("[Falcon] suspend with {:?} failed: {}", ops, e);
            self.exit_generation(generation);
            return Err(e);
        }

        Ok(SuspendGuard {
            coordinator: self,
            generation,
        })
    }

    /// Restore the saved operations. No-op when nothing is outstanding.
    pub fn exit(&self) -> bool {
        let mut state = self.state.lock();
        self.restore(&mut state)
    }

    fn exit_generation(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            return false;
        }
        self.restore(&mut state)
    }

    fn restore(&self, state: &mut State) -> bool {
        let Some(saved) = state.saved.take() else {
            return false;
        };
        state.active = saved;
        self.in_falcon.store(false, Ordering::Release);
        true
    }
}

impl Default for SuspendCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps the substituted operations installed
#[must_use = "dropping the guard restores the original suspend operations"]
pub struct SuspendGuard<'a> {
    coordinator: &'a SuspendCoordinator,
    generation: u64,
}

impl SuspendGuard<'_> {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn exit(self) {}
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.exit_generation(self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPS_A: SuspendOps = SuspendOps::Falcon(FalconMode::Mem);
    const OPS_B: SuspendOps = SuspendOps::Falcon(FalconMode::Standby);

    #[test]
    fn test_exit_without_enter_is_noop() {
        let coord = SuspendCoordinator::new();
        assert!(!coord.exit());
        assert_eq!(coord.active(), SuspendOps::Kernel);
        assert!(!coord.is_in_falcon());
    }

    #[test]
    fn test_pairing() {
        let coord = SuspendCoordinator::new();
        let guard = coord.enter(OPS_A, |_| Ok(())).unwrap();
        assert_eq!(coord.active(), OPS_A);
        assert!(coord.is_in_falcon());

        let mut triggered = false;
        let second = coord.enter(OPS_B, |_| {
            triggered = true;
            Ok(())
        });
        assert!(matches!(second, Err(SuspendError::AlreadyActive)));
        assert!(!triggered);
        assert_eq!(coord.active(), OPS_A);

        assert!(coord.exit());
        assert_eq!(coord.active(), SuspendOps::Kernel);
        assert!(!coord.is_in_falcon());
        assert!(!coord.exit());
        drop(guard);
        assert_eq!(coord.active(), SuspendOps::Kernel);
    }

    #[test]
    fn test_trigger_sees_installed_ops() {
        let coord = SuspendCoordinator::new();
        let guard = coord
            .enter(OPS_B, |ops| {
                assert_eq!(*ops, OPS_B);
                assert_eq!(coord.active(), OPS_B);
                assert!(coord.is_in_falcon());
                Ok(())
            })
            .unwrap();
        guard.exit();
        assert_eq!(coord.active(), SuspendOps::Kernel);
    }

    #[test]
    fn test_failed_trigger_restores() {
        let coord = SuspendCoordinator::new();
        let result = coord.enter(OPS_A, |_| Err(SuspendError::Trigger(-16)));
        assert!(matches!(result, Err(SuspendError::Trigger(-16))));
        assert_eq!(coord.active(), SuspendOps::Kernel);
        assert!(!coord.is_in_falcon());
        assert!(coord.enter(OPS_A, |_| Ok(())).is_ok());
    }

    #[test]
    fn test_stale_guard_does_not_undo_newer_enter() {
        let coord = SuspendCoordinator::new();
        let stale = coord.enter(OPS_A, |_| Ok(())).unwrap();
        coord.exit();
        let fresh = coord.enter(OPS_B, |_| Ok(())).unwrap();
        assert_ne!(stale.generation(), fresh.generation());

        drop(stale);
        assert_eq!(coord.active(), OPS_B);
        assert!(coord.is_in_falcon());

        drop(fresh);
        assert_eq!(coord.active(), SuspendOps::Kernel);
    }
}
