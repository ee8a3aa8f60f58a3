use std::path::Path;

use log::{debug, error, info};

use crate::config::DaemonConfig;
use crate::util::{clamp, strmemsize};

// Static carve-up of host RAM, done once at startup. The host/sys/user slices
// get fixed reservations and whatever is left is the pool the balancing
// policy hands out to VEs.

#[derive(Debug, Clone, Copy)]
pub struct HostInventory {
    pub total_ram: u64,
    pub host_reserve: u64,
    pub sys_reserve: u64,
    pub user_reserve: u64,
    pub ve_pool: u64,
}

fn reservation(cfg: &DaemonConfig, slice: &str, total: u64, defaults: (f64, u64, u64)) -> u64 {
    let share = cfg.get_f64(&format!("Host.{}.Share", slice), defaults.0, 0.0, 1.0);
    let min = cfg.get_u64(&format!("Host.{}.Min", slice), defaults.1);
    let max = cfg.get_u64(&format!("Host.{}.Max", slice), defaults.2);
    clamp((total as f64 * share) as u64, min, max)
}

impl HostInventory {
    pub fn probe(cfg: &DaemonConfig) -> Self {
        use sysinfo::{System, SystemExt};
        let mut sys = System::new();
        sys.refresh_memory();
        Self::with_total_ram(sys.total_memory(), cfg)
    }

    pub fn with_total_ram(total_ram: u64, cfg: &DaemonConfig) -> Self {
        let host_reserve =
            reservation(cfg, "HostMem", total_ram, (0.04, 128 << 20, 320 << 20));
        let sys_reserve = reservation(cfg, "SysMem", total_ram, (0.04, 128 << 20, 320 << 20));
        let user_reserve = reservation(cfg, "UserMem", total_ram, (0.02, 32 << 20, 128 << 20));
        let reserved = host_reserve + sys_reserve + user_reserve;
        let ve_pool = match total_ram.checked_sub(reserved) {
            Some(pool) => pool,
            None => {
                error!(
                    "host reservations ({}) exceed total ram ({}), no memory left for VEs",
                    strmemsize(reserved),
                    strmemsize(total_ram)
                );
                0
            }
        };
        Self {
            total_ram,
            host_reserve,
            sys_reserve,
            user_reserve,
            ve_pool,
        }
    }

    pub fn mem_available(&self) -> u64 {
        self.ve_pool
    }

    /// Push the sys/user reservations down to their control slices.
    /// Best-effort: a missing slice is normal on hosts that don't run one.
    pub fn apply_slice_reservations(&self, cgroup_root: &Path) {
        for (name, value) in [
            ("system.slice", self.sys_reserve),
            ("user.slice", self.user_reserve),
        ] {
            let cg = match mbcg::MemCg::open(cgroup_root, name) {
                Ok(cg) => cg,
                Err(e) => {
                    debug!("skipping reservation for {}: {}", name, e);
                    continue;
                }
            };
            match cg
                .write_mem_low(value)
                .and_then(|_| cg.write_oom_guarantee(value))
            {
                Ok(()) => info!("reserved {} for {}", strmemsize(value), name),
                Err(e) => error!("failed to set reservation for {}: {}", name, e),
            }
        }
    }
}
