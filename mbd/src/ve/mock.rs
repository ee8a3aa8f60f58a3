use std::sync::{Arc, Mutex, MutexGuard};

use mbstats::{RawIoStats, RawMemStats};

use crate::ve::VeError;

// Test backend with scripted stats and per-knob failure injection. The state
// is shared so a test can flip failures or advance counters after the VE has
// been handed to the load manager.

#[derive(Debug, Default)]
pub struct MockState {
    pub mem: RawMemStats,
    pub io: RawIoStats,
    /// added to the io counters on every fetch, so a VE can look steadily busy
    pub io_step: RawIoStats,
    /// added to the cumulative major fault counter on every fetch
    pub majflt_step: i64,
    pub fail_fetch: bool,
    pub fail_low: bool,
    pub fail_high: bool,
    pub fail_max: bool,
    pub fail_swap: bool,
    pub low: u64,
    pub high: u64,
    pub max: u64,
    pub swap: u64,
    pub fetches: u32,
}

#[derive(Clone)]
pub struct MockBackend(Arc<Mutex<MockState>>);

impl MockBackend {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(MockState::default())))
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.0.lock().unwrap()
    }

    pub fn fetch_stats(&mut self) -> Result<(RawMemStats, RawIoStats), VeError> {
        let mut s = self.state();
        if s.fail_fetch {
            return Err(VeError::Injected("fetch"));
        }
        s.fetches += 1;
        s.io.rd_req += s.io_step.rd_req;
        s.io.rd_bytes += s.io_step.rd_bytes;
        s.io.wr_req += s.io_step.wr_req;
        s.io.wr_bytes += s.io_step.wr_bytes;
        s.mem.majflt += s.majflt_step;
        Ok((s.mem, s.io))
    }

    pub fn set_mem_low(&mut self, val: u64) -> Result<(), VeError> {
        let mut s = self.state();
        if s.fail_low {
            return Err(VeError::Injected("mem_low"));
        }
        s.low = val;
        Ok(())
    }

    pub fn set_mem_high(&mut self, val: u64) -> Result<(), VeError> {
        let mut s = self.state();
        if s.fail_high {
            return Err(VeError::Injected("mem_high"));
        }
        s.high = val;
        Ok(())
    }

    pub fn set_mem_max(&mut self, val: u64) -> Result<(), VeError> {
        let mut s = self.state();
        if s.fail_max {
            return Err(VeError::Injected("mem_max"));
        }
        s.max = val;
        Ok(())
    }

    pub fn set_swap_max(&mut self, val: u64) -> Result<(), VeError> {
        let mut s = self.state();
        if s.fail_swap {
            return Err(VeError::Injected("swap_max"));
        }
        s.swap = val;
        Ok(())
    }
}
