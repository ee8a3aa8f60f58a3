use std::time::Duration;

use crate::ldmgr::policies::simple::{NoOpPolicy, StaticPolicy};
use crate::ldmgr::policies::wfb::{WfbMem, WfbPolicy};
use crate::ve::Ve;

/// A balancing policy decides, per cycle, how much memory each active VE
/// should be targeted at. The load manager owns exactly one policy instance
/// and calls it from the worker thread only, so policies keep their per-VE
/// working data inside each VE's `policy_mem` without any locking.
pub trait BalancePolicy: Send {
    fn name(&self) -> &'static str;

    /// Time between periodic balance cycles.
    fn timeout(&self) -> Duration;

    fn ve_activated(&self, _ve: &mut Ve) {}

    fn ve_deactivated(&self, _ve: &mut Ve) {}

    fn ve_config_updated(&self, _ve: &mut Ve) {}

    /// Compute target quotas for the given active VEs, returned in input
    /// order. `mem_avail` is the pool to distribute; `stats_updated` says
    /// whether the stats snapshots were refreshed for this cycle (periodic
    /// rebalance) or carried over (event-driven settle).
    fn balance(&self, ves: &mut [&mut Ve], mem_avail: u64, stats_updated: bool) -> Vec<u64>;
}

/// Per-VE scratch area owned by the installed policy. Tagged by policy so a
/// policy never mistakes another's leftovers for its own.
#[derive(Debug, Clone, Default)]
pub enum PolicyMem {
    #[default]
    None,
    Wfb(WfbMem),
}

pub fn make_policy(name: &str, interval: Duration) -> Option<Box<dyn BalancePolicy>> {
    Some(match name {
        "wfb" => Box::new(WfbPolicy::new(interval)),
        "static" => Box::new(StaticPolicy::new(interval)),
        "noop" => Box::new(NoOpPolicy::new(interval)),
        _ => return None,
    })
}
