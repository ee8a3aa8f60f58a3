use std::path::Path;

use log::debug;
use mbstats::{RawIoStats, RawMemStats};

use crate::ve::monitor::{ApiClient, Monitor, MonitorError};

// Virtual machine backend. Statistics and the balloon lever go through the
// per-VM monitor socket. The hard ceiling can only be hotplugged upward;
// shrinking is the policy's job via the balloon, so a lower request is
// recorded and skipped.

const VAL_MAX: u64 = i64::MAX as u64;

pub struct VmBackend {
    name: String,
    monitor: Box<dyn Monitor>,
}

impl VmBackend {
    pub fn new(name: &str, monitor: Box<dyn Monitor>) -> Self {
        Self {
            name: name.to_string(),
            monitor,
        }
    }

    pub fn connect(run_dir: impl AsRef<Path>, name: &str) -> Self {
        Self::new(name, Box::new(ApiClient::for_vm(run_dir, name)))
    }

    pub fn fetch_stats(&mut self) -> Result<(RawMemStats, RawIoStats), MonitorError> {
        let b = self.monitor.balloon_stats()?;
        let io = self.monitor.io_stats()?;
        let mem = RawMemStats {
            actual: b.actual,
            rss: b.rss,
            memtotal: b.memtotal,
            memfree: b.memfree,
            memavail: b.memavail,
            committed: b.committed,
            wss: b.wss,
            swapin: b.swapin,
            swapout: b.swapout,
            minflt: b.minflt,
            majflt: b.majflt,
        };
        Ok((mem, io))
    }

    // The host-side protection floor doesn't reach into a guest; the balloon
    // target set by set_mem_high is the only lever.
    pub fn set_mem_low(&mut self, _val: u64) -> Result<(), MonitorError> {
        Ok(())
    }

    pub fn set_mem_high(&mut self, val: u64) -> Result<(), MonitorError> {
        self.monitor.resize(val.min(VAL_MAX))
    }

    pub fn set_mem_max(&mut self, val: u64) -> Result<(), MonitorError> {
        let val = val.min(VAL_MAX);
        let cur = self.monitor.max_mem()?;
        if val > cur {
            self.monitor.grow_max_mem(val)?;
        } else if val < cur {
            debug!(
                "vm {}: memory hotunplug not supported, keeping max at {}",
                self.name, cur
            );
        }
        Ok(())
    }

    // Guest swap is not governed from the host.
    pub fn set_swap_max(&mut self, _val: u64) -> Result<(), MonitorError> {
        Ok(())
    }
}
