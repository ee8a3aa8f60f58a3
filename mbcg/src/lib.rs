use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;

use log::error;
use rustix::fd::OwnedFd;
use rustix::fs::{Mode, OFlags, ResolveFlags};

// Write-through layer for the kernel memory controller. A MemCg wraps an open
// cgroup directory fd and reads/writes the control files through openat2 with
// RESOLVE_BENEATH so a hostile cgroup name can't escape the hierarchy.
//
// The one tricky invariant lives in write_mem_max/write_swap_max: the kernel
// rejects a mem limit above the combined mem+swap limit, so raising mem must
// write memsw first and lowering mem must write mem first. The swap gap is
// preserved across a mem limit change.

pub const UNLIMITED: u64 = u64::MAX;

// largest value the kernel accepts in a limit file
const VAL_MAX: u64 = i64::MAX as u64;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    BadName,
    Errno(#[from] rustix::io::Errno),
    Io(#[from] std::io::Error),
    Parse(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

fn name_ok(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && name != "." && name != ".."
}

fn open_group(root: impl AsRef<Path>, name: &str) -> Result<OwnedFd, Error> {
    if !name_ok(name) {
        return Err(Error::BadName);
    }
    let root = rustix::fs::open(
        root.as_ref(),
        OFlags::DIRECTORY | OFlags::RDONLY | OFlags::CLOEXEC,
        Mode::empty(),
    )?;
    let dir = rustix::fs::openat2(
        &root,
        name,
        OFlags::DIRECTORY | OFlags::RDONLY | OFlags::CLOEXEC,
        Mode::empty(),
        ResolveFlags::BENEATH,
    )?;
    Ok(dir)
}

fn read_file(dir: &OwnedFd, file: &str) -> Result<String, Error> {
    let fd = rustix::fs::openat2(
        dir,
        file,
        OFlags::RDONLY | OFlags::CLOEXEC,
        Mode::empty(),
        ResolveFlags::BENEATH,
    )?;
    let mut f: std::fs::File = fd.into();
    let mut buf = String::new();
    f.read_to_string(&mut buf)?;
    Ok(buf)
}

fn write_file(dir: &OwnedFd, file: &str, val: &str) -> Result<(), Error> {
    let fd = rustix::fs::openat2(
        dir,
        file,
        OFlags::WRONLY | OFlags::TRUNC | OFlags::CLOEXEC,
        Mode::empty(),
        ResolveFlags::BENEATH,
    )?;
    let mut f: std::fs::File = fd.into();
    f.write_all(val.as_bytes())?;
    Ok(())
}

fn read_u64(dir: &OwnedFd, file: &str) -> Result<u64, Error> {
    let s = read_file(dir, file)?;
    s.trim()
        .parse()
        .map_err(|_| Error::Parse(format!("{}: {:?}", file, s.trim())))
}

fn write_limit(dir: &OwnedFd, file: &str, val: u64) -> Result<(), Error> {
    write_file(dir, file, &val.min(VAL_MAX).to_string())
}

pub struct MemCg {
    name: String,
    dir: OwnedFd,
}

impl MemCg {
    pub fn open(root: impl AsRef<Path>, name: &str) -> Result<Self, Error> {
        let dir = open_group(root, name)?;
        Ok(Self {
            name: name.to_string(),
            dir,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn read_mem_current(&self) -> Result<u64, Error> {
        read_u64(&self.dir, "memory.usage_in_bytes")
    }

    /// Parse memory.stat into a key -> value map. Lines that don't parse are
    /// skipped, matching what the kernel promises about the file anyway.
    pub fn read_mem_stat(&self) -> Result<BTreeMap<String, i64>, Error> {
        let raw = read_file(&self.dir, "memory.stat")?;
        let mut kv = BTreeMap::new();
        for line in raw.lines() {
            let mut it = line.split_whitespace();
            let (Some(k), Some(v)) = (it.next(), it.next()) else {
                continue;
            };
            if let Ok(v) = v.parse::<i64>() {
                kv.insert(k.to_string(), v);
            }
        }
        Ok(kv)
    }

    pub fn write_mem_low(&self, val: u64) -> Result<(), Error> {
        write_limit(&self.dir, "memory.low", val)
    }

    pub fn write_mem_high(&self, val: u64) -> Result<(), Error> {
        write_limit(&self.dir, "memory.high", val)
    }

    pub fn write_oom_guarantee(&self, val: u64) -> Result<(), Error> {
        write_limit(&self.dir, "memory.oom_guarantee", val)
    }

    pub fn read_mem_max(&self) -> Result<u64, Error> {
        read_u64(&self.dir, "memory.limit_in_bytes")
    }

    pub fn read_memsw_max(&self) -> Result<u64, Error> {
        read_u64(&self.dir, "memory.memsw.limit_in_bytes")
    }

    /// Change the hard memory limit, keeping the current swap gap. Raising
    /// goes memsw-then-mem, lowering goes mem-then-memsw. On the lowering
    /// path the memsw write is best-effort: the kernel may refuse to shrink
    /// below current usage and the mem limit is already in place.
    pub fn write_mem_max(&self, val: u64) -> Result<(), Error> {
        let mem = self.read_mem_max()?;
        let memsw = self.read_memsw_max()?;
        let swap_gap = memsw.saturating_sub(mem);
        let new_memsw = val.saturating_add(swap_gap);
        if val > mem {
            write_limit(&self.dir, "memory.memsw.limit_in_bytes", new_memsw)?;
            write_limit(&self.dir, "memory.limit_in_bytes", val)?;
        } else {
            write_limit(&self.dir, "memory.limit_in_bytes", val)?;
            if let Err(e) = write_limit(&self.dir, "memory.memsw.limit_in_bytes", new_memsw) {
                error!("memcg {}: memsw shrink to {} refused: {}", self.name, new_memsw, e);
            }
        }
        Ok(())
    }

    /// Set the hard swap limit by writing combined mem+swap.
    pub fn write_swap_max(&self, val: u64) -> Result<(), Error> {
        let mem = self.read_mem_max()?;
        write_limit(
            &self.dir,
            "memory.memsw.limit_in_bytes",
            mem.saturating_add(val),
        )
    }
}

pub struct BlkCg {
    dir: OwnedFd,
}

impl BlkCg {
    pub fn open(root: impl AsRef<Path>, name: &str) -> Result<Self, Error> {
        let dir = open_group(root, name)?;
        Ok(Self { dir })
    }

    fn read_io_stat(&self, file: &str) -> Result<(i64, i64), Error> {
        // lines look like "8:0 Read 1234"; sum per op across devices
        let raw = read_file(&self.dir, file)?;
        let mut rd = 0i64;
        let mut wr = 0i64;
        for line in raw.lines() {
            let fields: Vec<_> = line.split_whitespace().collect();
            let [_, op, v] = fields[..] else { continue };
            let Ok(v) = v.parse::<i64>() else { continue };
            match op {
                "Read" => rd += v,
                "Write" => wr += v,
                _ => {}
            }
        }
        Ok((rd, wr))
    }

    /// Total read and write requests issued by this cgroup.
    pub fn read_io_serviced(&self) -> Result<(i64, i64), Error> {
        self.read_io_stat("blkio.io_serviced")
    }

    /// Total bytes read and written by this cgroup.
    pub fn read_io_service_bytes(&self) -> Result<(i64, i64), Error> {
        self.read_io_stat("blkio.io_service_bytes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fake_memcg(dir: &Path, name: &str) {
        let d = dir.join(name);
        fs::create_dir(&d).unwrap();
        for (f, v) in [
            ("memory.usage_in_bytes", "0"),
            ("memory.stat", ""),
            ("memory.low", "0"),
            ("memory.high", "9223372036854775807"),
            ("memory.oom_guarantee", "0"),
            ("memory.limit_in_bytes", "9223372036854775807"),
            ("memory.memsw.limit_in_bytes", "9223372036854775807"),
        ] {
            fs::write(d.join(f), v).unwrap();
        }
    }

    fn read(dir: &Path, name: &str, file: &str) -> u64 {
        fs::read_to_string(dir.join(name).join(file))
            .unwrap()
            .trim()
            .parse()
            .unwrap()
    }

    #[test]
    fn bad_names_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(MemCg::open(tmp.path(), ""), Err(Error::BadName)));
        assert!(matches!(
            MemCg::open(tmp.path(), "a/b"),
            Err(Error::BadName)
        ));
        assert!(matches!(MemCg::open(tmp.path(), ".."), Err(Error::BadName)));
    }

    #[test]
    fn limit_writes_clamp_unlimited() {
        let tmp = tempfile::tempdir().unwrap();
        fake_memcg(tmp.path(), "ve1");
        let cg = MemCg::open(tmp.path(), "ve1").unwrap();
        cg.write_mem_low(UNLIMITED).unwrap();
        assert_eq!(read(tmp.path(), "ve1", "memory.low"), VAL_MAX);
    }

    #[test]
    fn mem_max_preserves_swap_gap() {
        let tmp = tempfile::tempdir().unwrap();
        fake_memcg(tmp.path(), "ve1");
        let cg = MemCg::open(tmp.path(), "ve1").unwrap();

        let g = 1u64 << 30;
        fs::write(tmp.path().join("ve1/memory.limit_in_bytes"), g.to_string()).unwrap();
        fs::write(
            tmp.path().join("ve1/memory.memsw.limit_in_bytes"),
            (g + g / 2).to_string(),
        )
        .unwrap();

        // grow
        cg.write_mem_max(2 * g).unwrap();
        assert_eq!(read(tmp.path(), "ve1", "memory.limit_in_bytes"), 2 * g);
        assert_eq!(
            read(tmp.path(), "ve1", "memory.memsw.limit_in_bytes"),
            2 * g + g / 2
        );

        // shrink
        cg.write_mem_max(g / 2).unwrap();
        assert_eq!(read(tmp.path(), "ve1", "memory.limit_in_bytes"), g / 2);
        assert_eq!(
            read(tmp.path(), "ve1", "memory.memsw.limit_in_bytes"),
            g
        );
    }

    #[test]
    fn swap_max_writes_combined() {
        let tmp = tempfile::tempdir().unwrap();
        fake_memcg(tmp.path(), "ve1");
        let cg = MemCg::open(tmp.path(), "ve1").unwrap();
        let g = 1u64 << 30;
        fs::write(tmp.path().join("ve1/memory.limit_in_bytes"), g.to_string()).unwrap();
        cg.write_swap_max(g).unwrap();
        assert_eq!(
            read(tmp.path(), "ve1", "memory.memsw.limit_in_bytes"),
            2 * g
        );
    }

    #[test]
    fn mem_stat_parses() {
        let tmp = tempfile::tempdir().unwrap();
        fake_memcg(tmp.path(), "ve1");
        fs::write(
            tmp.path().join("ve1/memory.stat"),
            "total_rss 4096\npgmajfault 7\nnot a number x\n",
        )
        .unwrap();
        let cg = MemCg::open(tmp.path(), "ve1").unwrap();
        let kv = cg.read_mem_stat().unwrap();
        assert_eq!(kv.get("total_rss"), Some(&4096));
        assert_eq!(kv.get("pgmajfault"), Some(&7));
        assert_eq!(kv.get("not"), None);
    }

    #[test]
    fn blkio_sums_devices() {
        let tmp = tempfile::tempdir().unwrap();
        let d = tmp.path().join("ve1");
        fs::create_dir(&d).unwrap();
        fs::write(
            d.join("blkio.io_serviced"),
            "8:0 Read 100\n8:0 Write 200\n8:16 Read 11\n8:16 Write 22\nTotal 333\n",
        )
        .unwrap();
        let cg = BlkCg::open(tmp.path(), "ve1").unwrap();
        assert_eq!(cg.read_io_serviced().unwrap(), (111, 222));
    }
}
