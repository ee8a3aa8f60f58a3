use std::path::PathBuf;

use log::debug;
use mbcg::{BlkCg, MemCg};
use mbstats::{RawIoStats, RawMemStats, UNAVAILABLE};

// Container backend. Everything goes through the memory cgroup; block io
// counters come from the blkio controller when it is mounted. Cgroup handles
// are opened lazily because a container is usually registered before its
// cgroup exists, and a failed operation drops the cached handle so a
// restarted container gets a fresh one.

pub struct CtBackend {
    name: String,
    cgroup_root: PathBuf,
    blkio_root: PathBuf,
    memcg: Option<MemCg>,
    blkcg: Option<BlkCg>,
}

impl CtBackend {
    pub fn new(cgroup_root: PathBuf, blkio_root: PathBuf, name: &str) -> Self {
        Self {
            name: name.to_string(),
            cgroup_root,
            blkio_root,
            memcg: None,
            blkcg: None,
        }
    }

    fn with_memcg<T>(
        &mut self,
        f: impl FnOnce(&MemCg) -> Result<T, mbcg::Error>,
    ) -> Result<T, mbcg::Error> {
        if self.memcg.is_none() {
            self.memcg = Some(MemCg::open(&self.cgroup_root, &self.name)?);
        }
        let r = f(self.memcg.as_ref().unwrap()); // just populated
        if r.is_err() {
            self.memcg = None;
        }
        r
    }

    fn read_io(&mut self) -> Result<RawIoStats, mbcg::Error> {
        if self.blkcg.is_none() {
            self.blkcg = Some(BlkCg::open(&self.blkio_root, &self.name)?);
        }
        let cg = self.blkcg.as_ref().unwrap(); // just populated
        let r = (|| {
            let (rd_req, wr_req) = cg.read_io_serviced()?;
            let (rd_bytes, wr_bytes) = cg.read_io_service_bytes()?;
            Ok(RawIoStats {
                rd_req,
                rd_bytes,
                wr_req,
                wr_bytes,
            })
        })();
        if r.is_err() {
            self.blkcg = None;
        }
        r
    }

    pub fn fetch_stats(&mut self) -> Result<(RawMemStats, RawIoStats), mbcg::Error> {
        let (usage, limit, stat) = self.with_memcg(|cg| {
            Ok((
                cg.read_mem_current()?,
                cg.read_mem_max()?,
                cg.read_mem_stat()?,
            ))
        })?;

        let limited = limit < i64::MAX as u64;
        let limit_or_unavail = if limited { limit as i64 } else { UNAVAILABLE };
        let get = |k: &str| stat.get(k).copied().unwrap_or(UNAVAILABLE);

        let mem = RawMemStats {
            // what's committed to a container is its memory limit
            actual: limit_or_unavail,
            rss: get("total_rss"),
            memtotal: limit_or_unavail,
            memfree: if limited {
                limit.saturating_sub(usage) as i64
            } else {
                UNAVAILABLE
            },
            memavail: UNAVAILABLE,
            committed: UNAVAILABLE,
            wss: UNAVAILABLE,
            swapin: get("pswpin"),
            swapout: get("pswpout"),
            minflt: get("pgfault"),
            majflt: get("pgmajfault"),
        };

        let io = match self.read_io() {
            Ok(io) => io,
            Err(e) => {
                debug!("ct {}: no blkio stats: {}", self.name, e);
                RawIoStats {
                    rd_req: UNAVAILABLE,
                    rd_bytes: UNAVAILABLE,
                    wr_req: UNAVAILABLE,
                    wr_bytes: UNAVAILABLE,
                }
            }
        };

        Ok((mem, io))
    }

    pub fn set_mem_low(&mut self, val: u64) -> Result<(), mbcg::Error> {
        self.with_memcg(|cg| cg.write_mem_low(val))
    }

    pub fn set_mem_high(&mut self, val: u64) -> Result<(), mbcg::Error> {
        self.with_memcg(|cg| cg.write_mem_high(val))
    }

    pub fn set_mem_max(&mut self, val: u64) -> Result<(), mbcg::Error> {
        self.with_memcg(|cg| cg.write_mem_max(val))
    }

    pub fn set_swap_max(&mut self, val: u64) -> Result<(), mbcg::Error> {
        self.with_memcg(|cg| cg.write_swap_max(val))
    }
}
