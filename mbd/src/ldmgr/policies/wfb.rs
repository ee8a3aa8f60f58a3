use std::time::Duration;

use log::{debug, warn};
use mbstats::{Ema, IoStats, MemStats};

use crate::ldmgr::policy::{BalancePolicy, PolicyMem};
use crate::util::{clamp, strmemsize};
use crate::ve::Ve;

// Weighted feedback-based policy. Whenever a VE looks like it needs more
// memory (io/pgflt counters over threshold with little free memory) its quota
// grows a notch; the global settlement then reclaims the difference from the
// other VEs inversely proportionally to their weights, so idle VEs give
// memory back before busy ones do.

const MIN_WEIGHT: f64 = 1.0;
const MAX_WEIGHT: f64 = 20.0;
const BASE_WEIGHT: f64 = 10.0;

const AVG_WINDOW: u32 = 10;

const QUOTA_INC: f64 = 0.10;

const MEM_LOW: f64 = 0.10;
const MEM_LOW_MIN: u64 = 192 << 20;
const MEM_LOW_MAX: u64 = 768 << 20;

const IO_THRESH: i64 = 20;
const PGFLT_THRESH: i64 = 20;

const IO_REWARD: f64 = 4.0;
const PGFLT_REWARD: f64 = 8.0;
const UNUSED_FINE: f64 = 8.0;

// settlement residuals below this aren't worth redistributing
const RESIDUAL: u64 = 16 << 20;

#[derive(Debug, Clone)]
pub struct WfbMem {
    pub quota: u64,
    weight: f64,
    unused: u64,
    io: i64,
    io_ema: Ema,
    pgflt: i64,
    pgflt_ema: Ema,
}

impl WfbMem {
    fn new(guarantee: u64) -> Self {
        Self {
            quota: guarantee,
            weight: BASE_WEIGHT,
            unused: 0,
            io: 0,
            io_ema: Ema::new(AVG_WINDOW),
            pgflt: 0,
            pgflt_ema: Ema::new(AVG_WINDOW),
        }
    }

    fn update(&mut self, mem: &MemStats, io: &IoStats, guarantee: u64, eff_limit: u64) {
        // free memory as seen by the guest; fall back to rss when the guest
        // doesn't report it
        self.unused = if mem.memfree >= 0 {
            (mem.memfree as u64).min(self.quota)
        } else {
            self.quota.saturating_sub(mem.rss.max(0) as u64)
        };

        self.io = io.rd_req.max(0) + io.wr_req.max(0);
        self.io_ema.update(self.io as f64);

        self.pgflt = mem.majflt.max(0);
        self.pgflt_ema.update(self.pgflt as f64);

        // a VE struggling to reclaim down to its quota isn't pushed harder
        // than what it already holds
        if mem.actual >= 0 {
            self.quota = self.quota.max(mem.actual as u64);
        }

        // high io/pgflt rate and not much free memory reads as thrashing:
        // grow the quota a notch
        let mem_low = clamp(
            (eff_limit as f64 * MEM_LOW) as u64,
            MEM_LOW_MIN,
            MEM_LOW_MAX,
        );
        if self.unused <= mem_low && (self.io > IO_THRESH || self.pgflt > PGFLT_THRESH) {
            self.quota += (eff_limit as f64 * QUOTA_INC).round() as u64;
        }

        self.quota = clamp(self.quota, guarantee, eff_limit);

        let mut weight = BASE_WEIGHT;
        // fine for memory left completely unused
        weight -= self.unused as f64 * UNUSED_FINE / (self.quota + 1) as f64;
        // reward for pressure, instant and averaged
        if self.io > IO_THRESH {
            weight += IO_REWARD;
        }
        if self.io_ema.get() > IO_THRESH as f64 {
            weight += IO_REWARD / 2.0;
        }
        if self.pgflt > PGFLT_THRESH {
            weight += PGFLT_REWARD;
        }
        if self.pgflt_ema.get() > PGFLT_THRESH as f64 {
            weight += PGFLT_REWARD / 2.0;
        }
        self.weight = weight.clamp(MIN_WEIGHT, MAX_WEIGHT);
    }

    // Normalized by quota so a grant doesn't blow up a tiny VE at once.
    fn forward_weight(&self, eff_limit: u64) -> f64 {
        if self.quota >= eff_limit {
            // can't consume any more
            return 0.0;
        }
        self.weight / (self.quota + 1) as f64
    }

    fn inverse_weight(&self, guarantee: u64) -> f64 {
        if self.quota <= guarantee {
            // nothing left to reclaim
            return 0.0;
        }
        self.quota as f64 / self.weight
    }
}

fn wfb_mem(ve: &mut Ve) -> &mut WfbMem {
    if !matches!(ve.policy_mem, PolicyMem::Wfb(_)) {
        ve.policy_mem = PolicyMem::Wfb(WfbMem::new(ve.config().guarantee));
    }
    let PolicyMem::Wfb(m) = &mut ve.policy_mem else {
        unreachable!()
    };
    m
}

fn quota_of(ve: &Ve) -> u64 {
    match &ve.policy_mem {
        PolicyMem::Wfb(m) => m.quota,
        PolicyMem::None => ve.config().guarantee,
    }
}

pub struct WfbPolicy {
    interval: Duration,
}

impl WfbPolicy {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    fn grant_quota(ves: &mut [&mut Ve], mut value: u64) {
        loop {
            let denom: f64 = ves
                .iter()
                .map(|ve| match &ve.policy_mem {
                    PolicyMem::Wfb(m) => m.forward_weight(ve.effective_limit()),
                    PolicyMem::None => 0.0,
                })
                .sum();
            if denom <= 0.0 {
                return;
            }
            let mut left: u64 = 0;
            for ve in ves.iter_mut() {
                let eff = ve.effective_limit();
                let m = wfb_mem(ve);
                let w = m.forward_weight(eff);
                if w <= 0.0 {
                    continue;
                }
                m.quota += (value as f64 * w / denom) as u64;
                if m.quota > eff {
                    left += m.quota - eff;
                    m.quota = eff;
                }
            }
            if left <= RESIDUAL {
                return;
            }
            value = left;
        }
    }

    fn subtract_quota(ves: &mut [&mut Ve], mut value: u64) {
        loop {
            let denom: f64 = ves
                .iter()
                .map(|ve| match &ve.policy_mem {
                    PolicyMem::Wfb(m) => m.inverse_weight(ve.config().guarantee),
                    PolicyMem::None => 0.0,
                })
                .sum();
            if denom <= 0.0 {
                return;
            }
            let mut left: u64 = 0;
            for ve in ves.iter_mut() {
                let guarantee = ve.config().guarantee;
                let m = wfb_mem(ve);
                let w = m.inverse_weight(guarantee);
                if w <= 0.0 {
                    continue;
                }
                let cut = (value as f64 * w / denom) as u64;
                let new = m.quota.saturating_sub(cut);
                if new < guarantee {
                    left += guarantee - new;
                    m.quota = guarantee;
                } else {
                    m.quota = new;
                }
            }
            if left <= RESIDUAL {
                return;
            }
            value = left;
        }
    }
}

impl BalancePolicy for WfbPolicy {
    fn name(&self) -> &'static str {
        "wfb"
    }

    fn timeout(&self) -> Duration {
        self.interval
    }

    fn ve_activated(&self, ve: &mut Ve) {
        ve.policy_mem = PolicyMem::Wfb(WfbMem::new(ve.config().guarantee));
    }

    fn ve_deactivated(&self, ve: &mut Ve) {
        ve.policy_mem = PolicyMem::None;
    }

    fn ve_config_updated(&self, ve: &mut Ve) {
        let guarantee = ve.config().guarantee;
        let eff = ve.effective_limit();
        if let PolicyMem::Wfb(m) = &mut ve.policy_mem {
            m.quota = clamp(m.quota, guarantee, eff);
        }
    }

    fn balance(&self, ves: &mut [&mut Ve], mem_avail: u64, stats_updated: bool) -> Vec<u64> {
        if stats_updated {
            for ve in ves.iter_mut() {
                let mem = *ve.mem_stats();
                let io = *ve.io_stats();
                let guarantee = ve.config().guarantee;
                let eff = ve.effective_limit();
                let m = wfb_mem(ve);
                m.update(&mem, &io, guarantee, eff);
                let (quota, weight, unused, io, pgflt) =
                    (m.quota, m.weight, m.unused, m.io, m.pgflt);
                debug!(
                    "{}: quota:{} weight:{:.2} unused:{} io:{} pgflt:{}",
                    ve,
                    strmemsize(quota),
                    weight,
                    strmemsize(unused),
                    io,
                    pgflt
                );
            }
        }

        let sum: u128 = ves.iter().map(|ve| quota_of(ve) as u128).sum();
        if sum < mem_avail as u128 {
            Self::grant_quota(ves, (mem_avail as u128 - sum) as u64);
        } else if sum > mem_avail as u128 {
            let deficit = (sum - mem_avail as u128).min(u64::MAX as u128) as u64;
            Self::subtract_quota(ves, deficit);
        }

        // Rounding can leave the sum above the pool, which would dilute the
        // memory protections; scale everything down proportionally. The
        // guarantees aren't preserved on this path.
        let sum: u128 = ves.iter().map(|ve| quota_of(ve) as u128).sum();
        if sum > mem_avail as u128 {
            warn!(
                "quota sum {} still exceeds pool {}, scaling down",
                sum, mem_avail
            );
            for ve in ves.iter_mut() {
                let m = wfb_mem(ve);
                m.quota = (m.quota as u128 * mem_avail as u128 / sum) as u64;
            }
        }

        ves.iter().map(|ve| quota_of(ve)).collect()
    }
}
