use std::fmt;

use bincode::{Decode, Encode};
use mbstats::{IoStats, IoTracker, MemStats, MemTracker};

use crate::error::MbdError;
use crate::ldmgr::policy::PolicyMem;
use crate::util::strmemsize;
use crate::ve::ct::CtBackend;
use crate::ve::monitor::MonitorError;
use crate::ve::vm::VmBackend;

pub mod ct;
#[cfg(test)]
pub mod mock;
pub mod monitor;
pub mod vm;

/// Sentinel for "no limit". Translated to the kernel's unlimited
/// representation at the knob layer.
pub const UNLIMITED: u64 = u64::MAX;

const CONFIG_VAL_MAX: u64 = i64::MAX as u64;

#[derive(Debug, thiserror::Error)]
pub enum VeError {
    Cgroup(#[from] mbcg::Error),
    Monitor(#[from] MonitorError),
    #[cfg(test)]
    Injected(&'static str),
}

impl fmt::Display for VeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum VeType {
    Ct,
    Vm,
    VmLinux,
    VmWindows,
}

impl VeType {
    pub fn from_tag(tag: u32) -> Option<Self> {
        Some(match tag {
            0 => VeType::Ct,
            1 => VeType::Vm,
            2 => VeType::VmLinux,
            3 => VeType::VmWindows,
            _ => return None,
        })
    }

    pub fn tag(self) -> u32 {
        match self {
            VeType::Ct => 0,
            VeType::Vm => 1,
            VeType::VmLinux => 2,
            VeType::VmWindows => 3,
        }
    }

    pub fn is_vm(self) -> bool {
        !matches!(self, VeType::Ct)
    }
}

impl fmt::Display for VeType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            VeType::Ct => "CT",
            VeType::Vm => "VM",
            VeType::VmLinux => "VM_LIN",
            VeType::VmWindows => "VM_WIN",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct VeConfig {
    pub guarantee: u64,
    pub limit: u64,
    pub swap: u64,
}

impl Default for VeConfig {
    fn default() -> Self {
        Self {
            guarantee: 0,
            limit: UNLIMITED,
            swap: UNLIMITED,
        }
    }
}

impl VeConfig {
    /// Clamp ingested values into the kernel-representable range and check
    /// the one structural invariant. UNLIMITED passes through for the
    /// limits; a guarantee is always a concrete number.
    pub fn sanitized(self) -> Result<Self, MbdError> {
        fn limit_val(v: u64) -> u64 {
            if v == UNLIMITED { UNLIMITED } else { v.min(CONFIG_VAL_MAX) }
        }
        let cfg = Self {
            guarantee: self.guarantee.min(CONFIG_VAL_MAX),
            limit: limit_val(self.limit),
            swap: limit_val(self.swap),
        };
        if cfg.guarantee > cfg.limit {
            return Err(MbdError::InvalidVeConfig);
        }
        Ok(cfg)
    }

    pub fn effective_limit(&self, total_ram: u64) -> u64 {
        self.limit.min(total_ram)
    }
}

impl fmt::Display for VeConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "(guarantee={}, limit={}, swap={})",
            strmemsize(self.guarantee),
            strmemsize(self.limit),
            strmemsize(self.swap)
        )
    }
}

/// A partial config; unset fields keep the VE's current value.
#[derive(Debug, Clone, Copy, Default, Encode, Decode)]
pub struct VeConfigPatch {
    pub guarantee: Option<u64>,
    pub limit: Option<u64>,
    pub swap: Option<u64>,
}

impl VeConfigPatch {
    pub fn apply(self, base: VeConfig) -> VeConfig {
        VeConfig {
            guarantee: self.guarantee.unwrap_or(base.guarantee),
            limit: self.limit.unwrap_or(base.limit),
            swap: self.swap.unwrap_or(base.swap),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct VeInfo {
    pub name: String,
    pub ve_type: VeType,
    pub active: bool,
    pub config: VeConfig,
}

pub fn ve_name_ok(name: &str) -> bool {
    !name.is_empty() && !name.contains('/')
}

/// The two kinds of entity under management, dispatching the shared
/// knob/stat contract.
pub enum Backend {
    Ct(CtBackend),
    Vm(VmBackend),
    #[cfg(test)]
    Mock(mock::MockBackend),
}

impl Backend {
    fn fetch_stats(&mut self) -> Result<(mbstats::RawMemStats, mbstats::RawIoStats), VeError> {
        match self {
            Backend::Ct(b) => Ok(b.fetch_stats()?),
            Backend::Vm(b) => Ok(b.fetch_stats()?),
            #[cfg(test)]
            Backend::Mock(b) => b.fetch_stats(),
        }
    }

    fn set_mem_low(&mut self, val: u64) -> Result<(), VeError> {
        match self {
            Backend::Ct(b) => Ok(b.set_mem_low(val)?),
            Backend::Vm(b) => Ok(b.set_mem_low(val)?),
            #[cfg(test)]
            Backend::Mock(b) => b.set_mem_low(val),
        }
    }

    fn set_mem_high(&mut self, val: u64) -> Result<(), VeError> {
        match self {
            Backend::Ct(b) => Ok(b.set_mem_high(val)?),
            Backend::Vm(b) => Ok(b.set_mem_high(val)?),
            #[cfg(test)]
            Backend::Mock(b) => b.set_mem_high(val),
        }
    }

    fn set_mem_max(&mut self, val: u64) -> Result<(), VeError> {
        match self {
            Backend::Ct(b) => Ok(b.set_mem_max(val)?),
            Backend::Vm(b) => Ok(b.set_mem_max(val)?),
            #[cfg(test)]
            Backend::Mock(b) => b.set_mem_max(val),
        }
    }

    fn set_swap_max(&mut self, val: u64) -> Result<(), VeError> {
        match self {
            Backend::Ct(b) => Ok(b.set_swap_max(val)?),
            Backend::Vm(b) => Ok(b.set_swap_max(val)?),
            #[cfg(test)]
            Backend::Mock(b) => b.set_swap_max(val),
        }
    }
}

pub struct Ve {
    name: String,
    ty: VeType,
    config: VeConfig,
    total_ram: u64,
    active: bool,
    need_apply_config: bool,
    backend: Backend,
    mem: MemTracker,
    io: IoTracker,
    /// Policy-owned scratch area; nothing else reads or writes it.
    pub policy_mem: PolicyMem,
}

impl Ve {
    pub fn new(name: String, ty: VeType, config: VeConfig, total_ram: u64, backend: Backend) -> Self {
        Self {
            name,
            ty,
            config,
            total_ram,
            active: false,
            need_apply_config: true,
            backend,
            mem: MemTracker::new(),
            io: IoTracker::new(),
            policy_mem: PolicyMem::None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ve_type(&self) -> VeType {
        self.ty
    }

    pub fn config(&self) -> VeConfig {
        self.config
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn effective_limit(&self) -> u64 {
        self.config.effective_limit(self.total_ram)
    }

    pub fn mem_stats(&self) -> &MemStats {
        &self.mem.stats
    }

    pub fn io_stats(&self) -> &IoStats {
        &self.io.stats
    }

    pub fn info(&self) -> VeInfo {
        VeInfo {
            name: self.name.clone(),
            ve_type: self.ty,
            active: self.active,
            config: self.config,
        }
    }

    /// Update the config. For an active VE the hard limits are pushed to the
    /// knobs right away and a failure leaves the old config in place; for an
    /// inactive VE application is deferred until activation.
    pub fn set_config(&mut self, config: VeConfig) -> Result<(), VeError> {
        if self.active {
            self.backend.set_mem_max(config.limit)?;
            self.backend.set_swap_max(config.swap)?;
        } else {
            self.need_apply_config = true;
        }
        self.config = config;
        Ok(())
    }

    /// Mark the VE active, applying any config that was set while it was
    /// inactive.
    pub fn activate(&mut self) -> Result<(), VeError> {
        if self.need_apply_config {
            self.backend.set_mem_max(self.config.limit)?;
            self.backend.set_swap_max(self.config.swap)?;
            self.need_apply_config = false;
        }
        self.active = true;
        Ok(())
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }

    /// Fetch a fresh stats snapshot. On failure the previous snapshot stays
    /// in place.
    pub fn update_stats(&mut self) -> Result<(), VeError> {
        let (mem, io) = self.backend.fetch_stats()?;
        self.mem.update(mem);
        self.io.update(io);
        Ok(())
    }

    /// Push one balance result to the knobs.
    pub fn apply_bounds(
        &mut self,
        low: u64,
        high: u64,
        max: u64,
        swap_max: u64,
    ) -> Result<(), VeError> {
        self.backend.set_mem_low(low)?;
        self.backend.set_mem_high(high)?;
        self.backend.set_mem_max(max)?;
        self.backend.set_swap_max(swap_max)?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn feed_stats(
        &mut self,
        mem: mbstats::RawMemStats,
        io: mbstats::RawIoStats,
        at: std::time::Instant,
    ) {
        self.mem.update_at(mem, at);
        self.io.update_at(io, at);
    }
}

impl fmt::Display for Ve {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} '{}'", self.ty, self.name)
    }
}
