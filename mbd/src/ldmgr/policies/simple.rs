use std::time::Duration;

use crate::ldmgr::policy::BalancePolicy;
use crate::ve::Ve;

/// Static policy: each VE gets a share proportional to its configured limit,
/// never less than its guarantee. No feedback, no per-VE state.
pub struct StaticPolicy {
    interval: Duration,
}

impl StaticPolicy {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl BalancePolicy for StaticPolicy {
    fn name(&self) -> &'static str {
        "static"
    }

    fn timeout(&self) -> Duration {
        self.interval
    }

    fn balance(&self, ves: &mut [&mut Ve], mem_avail: u64, _stats_updated: bool) -> Vec<u64> {
        // host not overcommitted: everyone gets their limit
        let sum_lim: u128 = ves.iter().map(|ve| ve.effective_limit() as u128).sum();
        if sum_lim <= mem_avail as u128 {
            return ves.iter().map(|ve| ve.effective_limit()).collect();
        }

        // overcommitted: guarantees first, the rest split proportionally to
        // the limit overhang
        let sum_guar: u128 = ves.iter().map(|ve| ve.config().guarantee as u128).sum();
        let excess = (mem_avail as u128).saturating_sub(sum_guar);
        ves.iter()
            .map(|ve| {
                let guar = ve.config().guarantee;
                let eff = ve.effective_limit();
                let overhang = (eff.saturating_sub(guar)) as u128;
                guar + (excess * overhang / (sum_lim - sum_guar + 1)) as u64
            })
            .collect()
    }
}

/// No-op policy: quotas are the configured limits, the host kernel is on its
/// own to sort out the rest.
pub struct NoOpPolicy {
    interval: Duration,
}

impl NoOpPolicy {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl BalancePolicy for NoOpPolicy {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn timeout(&self) -> Duration {
        self.interval
    }

    fn balance(&self, ves: &mut [&mut Ve], _mem_avail: u64, _stats_updated: bool) -> Vec<u64> {
        ves.iter().map(|ve| ve.config().limit).collect()
    }
}
