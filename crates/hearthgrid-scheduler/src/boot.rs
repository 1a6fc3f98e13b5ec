//! Boot admission: the fleet-wide boot slot and the load heuristic.
//!
//! Server boots are CPU- and IO-heavy, so at most one workload may be
//! booting at any time. The slot is a single in-memory token: it is empty
//! after a control-plane restart, and a holder that outlives `slot_ttl`
//! (a boot that crashed without releasing) is reclaimed by the next
//! reservation.
//!
//! `can_boot` is a coarse pre-check on host load per core. Heavy boots
//! (large RAM bookings) get a stricter threshold.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use sysinfo::System;
use tracing::{debug, warn};

use hearthgrid_state::WorkloadId;

/// Thresholds for boot admission.
#[derive(Debug, Clone)]
pub struct BootConfig {
    /// Refuse any boot above this 1-minute load per core.
    pub max_load_per_core: f64,
    /// Refuse heavy boots above this load per core.
    pub heavy_load_per_core: f64,
    /// Bookings at or above this size count as heavy (MB).
    pub heavy_boot_ram_mb: u64,
    /// A slot held longer than this is considered abandoned.
    pub slot_ttl: Duration,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            max_load_per_core: 0.90,
            heavy_load_per_core: 0.70,
            heavy_boot_ram_mb: 8192,
            slot_ttl: Duration::from_secs(300),
        }
    }
}

/// Source of the current host load.
pub trait LoadProbe: Send + Sync {
    /// 1-minute load average divided by core count, or `None` when unknown.
    fn load_per_core(&self) -> Option<f64>;
}

/// Host load from `sysinfo`. The core count is read once.
#[derive(Debug, Clone)]
pub struct SystemLoadProbe {
    cores: usize,
}

impl SystemLoadProbe {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        Self {
            cores: sys.cpus().len(),
        }
    }

    pub fn cores(&self) -> usize {
        self.cores
    }
}

impl Default for SystemLoadProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadProbe for SystemLoadProbe {
    fn load_per_core(&self) -> Option<f64> {
        per_core(System::load_average().one, self.cores)
    }
}

fn per_core(load: f64, cores: usize) -> Option<f64> {
    if cores == 0 || !load.is_finite() || load < 0.0 {
        return None;
    }
    Some(load / cores as f64)
}

/// Outcome of [`BootAdmissionController::can_boot`].
#[derive(Debug, Clone, PartialEq)]
pub struct BootVerdict {
    pub allowed: bool,
    pub reason: String,
}

impl BootVerdict {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

#[derive(Debug)]
struct BootSlot {
    workload_id: WorkloadId,
    acquired_at: Instant,
}

/// Serializes server boots across the fleet.
pub struct BootAdmissionController {
    slot: Mutex<Option<BootSlot>>,
    probe: Box<dyn LoadProbe>,
    config: BootConfig,
}

impl BootAdmissionController {
    pub fn new(config: BootConfig) -> Self {
        Self::with_probe(config, Box::new(SystemLoadProbe::new()))
    }

    pub fn with_probe(config: BootConfig, probe: Box<dyn LoadProbe>) -> Self {
        Self {
            slot: Mutex::new(None),
            probe,
            config,
        }
    }

    pub fn config(&self) -> &BootConfig {
        &self.config
    }

    /// Try to take the boot slot for `workload_id`.
    ///
    /// Returns false if another workload holds it. Re-reserving by the
    /// current holder succeeds; an expired holder is evicted.
    pub fn reserve_boot_slot(&self, workload_id: &str) -> bool {
        let mut slot = self.lock();
        if let Some(held) = slot.as_ref() {
            if held.workload_id == workload_id {
                return true;
            }
            let age = held.acquired_at.elapsed();
            if age < self.config.slot_ttl {
                debug!(
                    workload_id,
                    holder = %held.workload_id,
                    "boot slot busy"
                );
                return false;
            }
            warn!(
                holder = %held.workload_id,
                held_secs = age.as_secs(),
                "reclaiming stale boot slot"
            );
        }
        *slot = Some(BootSlot {
            workload_id: workload_id.to_string(),
            acquired_at: Instant::now(),
        });
        debug!(workload_id, "boot slot reserved");
        true
    }

    /// Release the slot if `workload_id` holds it.
    ///
    /// Releasing a slot held by someone else (e.g. after TTL reclaim) is
    /// ignored.
    pub fn release_boot_slot(&self, workload_id: &str) {
        let mut slot = self.lock();
        match slot.as_ref() {
            Some(held) if held.workload_id == workload_id => {
                *slot = None;
                debug!(workload_id, "boot slot released");
            }
            Some(held) => {
                warn!(
                    workload_id,
                    holder = %held.workload_id,
                    "ignoring boot slot release by non-holder"
                );
            }
            None => {}
        }
    }

    /// Current holder of the slot, if any (expired holders included).
    pub fn holder(&self) -> Option<WorkloadId> {
        self.lock().as_ref().map(|s| s.workload_id.clone())
    }

    /// Whether the slot is free or reclaimable.
    pub fn is_available(&self) -> bool {
        match self.lock().as_ref() {
            None => true,
            Some(held) => held.acquired_at.elapsed() >= self.config.slot_ttl,
        }
    }

    /// Coarse host-load check for booting a workload of `ram_mb`.
    ///
    /// An unreadable load is treated as idle.
    pub fn can_boot(&self, ram_mb: u64) -> BootVerdict {
        let Some(load) = self.probe.load_per_core() else {
            return BootVerdict::allow("host load unknown");
        };

        let heavy = ram_mb >= self.config.heavy_boot_ram_mb;
        if load > self.config.max_load_per_core {
            return BootVerdict::deny(format!(
                "host load {load:.2}/core exceeds {:.2}",
                self.config.max_load_per_core
            ));
        }
        if heavy && load > self.config.heavy_load_per_core {
            return BootVerdict::deny(format!(
                "host load {load:.2}/core exceeds {:.2} for a {ram_mb} MB boot",
                self.config.heavy_load_per_core
            ));
        }
        BootVerdict::allow(format!("host load {load:.2}/core"))
    }

    fn lock(&self) -> MutexGuard<'_, Option<BootSlot>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    use crate::testing::StaticLoad;

    fn controller(load: Option<f64>) -> BootAdmissionController {
        BootAdmissionController::with_probe(BootConfig::default(), Box::new(StaticLoad(load)))
    }

    #[test]
    fn slot_is_exclusive() {
        let boot = controller(None);
        assert!(boot.reserve_boot_slot("a"));
        assert!(!boot.reserve_boot_slot("b"));
        assert_eq!(boot.holder().as_deref(), Some("a"));

        boot.release_boot_slot("a");
        assert!(boot.holder().is_none());
        assert!(boot.reserve_boot_slot("b"));
    }

    #[test]
    fn reserve_is_reentrant_for_holder() {
        let boot = controller(None);
        assert!(boot.reserve_boot_slot("a"));
        assert!(boot.reserve_boot_slot("a"));
    }

    #[test]
    fn release_by_non_holder_is_ignored() {
        let boot = controller(None);
        assert!(boot.reserve_boot_slot("a"));
        boot.release_boot_slot("b");
        assert_eq!(boot.holder().as_deref(), Some("a"));
    }

    #[test]
    fn release_when_empty_is_noop() {
        let boot = controller(None);
        boot.release_boot_slot("a");
        assert!(boot.is_available());
    }

    #[test]
    fn stale_slot_is_reclaimed() {
        let config = BootConfig {
            slot_ttl: Duration::ZERO,
            ..BootConfig::default()
        };
        let boot = BootAdmissionController::with_probe(config, Box::new(StaticLoad(None)));
        assert!(boot.reserve_boot_slot("crashed"));
        assert!(boot.is_available());
        assert!(boot.reserve_boot_slot("next"));
        assert_eq!(boot.holder().as_deref(), Some("next"));
    }

    #[test]
    fn concurrent_reservations_admit_exactly_one() {
        let boot = Arc::new(controller(None));
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let boot = Arc::clone(&boot);
                thread::spawn(move || boot.reserve_boot_slot(&format!("w{i}")))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn can_boot_thresholds() {
        assert!(controller(Some(0.5)).can_boot(16384).allowed);
        assert!(controller(Some(0.8)).can_boot(2048).allowed);

        let heavy = controller(Some(0.8)).can_boot(8192);
        assert!(!heavy.allowed);
        assert!(heavy.reason.contains("8192 MB"));

        assert!(!controller(Some(0.95)).can_boot(512).allowed);
        assert!(controller(None).can_boot(65536).allowed);
    }

    #[test]
    fn load_is_divided_across_cores() {
        assert_eq!(per_core(3.0, 4), Some(0.75));
        assert_eq!(per_core(0.0, 8), Some(0.0));
        assert!(per_core(1.0, 0).is_none());
        assert!(per_core(f64::NAN, 4).is_none());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn host_load_is_read_per_core() {
        let probe = SystemLoadProbe::new();
        assert!(probe.cores() > 0);
        let load = probe.load_per_core().unwrap();
        assert!(load >= 0.0);
    }
}
