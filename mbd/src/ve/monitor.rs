use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use http::{Method, StatusCode};
use serde::Deserialize;
use serde_json::json;

use mbstats::RawIoStats;

// Per-VM monitor client. The hypervisor side exposes an API socket speaking
// one-request-per-connection HTTP/1.1 with JSON bodies, which is how we drive
// it for balloon statistics and resize. Everything is behind the Monitor
// trait so the VM backend can be exercised without a hypervisor around.

const API_PREFIX: &str = "/api/v1";
const IO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    Io(#[from] std::io::Error),
    Json(#[from] serde_json::Error),
    BadResponse,
    Status(StatusCode),
    EmptyBody,
}

impl std::fmt::Display for MonitorError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

fn unavail() -> i64 {
    mbstats::UNAVAILABLE
}

/// Guest memory figures as reported by the balloon driver, in bytes. Fields
/// the guest driver doesn't provide come back as -1.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BalloonStats {
    #[serde(default = "unavail")]
    pub actual: i64,
    #[serde(default = "unavail")]
    pub rss: i64,
    #[serde(default = "unavail")]
    pub memtotal: i64,
    #[serde(default = "unavail")]
    pub memfree: i64,
    #[serde(default = "unavail")]
    pub memavail: i64,
    #[serde(default = "unavail")]
    pub committed: i64,
    #[serde(default = "unavail")]
    pub wss: i64,
    #[serde(default = "unavail")]
    pub swapin: i64,
    #[serde(default = "unavail")]
    pub swapout: i64,
    #[serde(default = "unavail")]
    pub minflt: i64,
    #[serde(default = "unavail")]
    pub majflt: i64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct WireIoStats {
    #[serde(default = "unavail")]
    rd_req: i64,
    #[serde(default = "unavail")]
    rd_bytes: i64,
    #[serde(default = "unavail")]
    wr_req: i64,
    #[serde(default = "unavail")]
    wr_bytes: i64,
}

#[derive(Debug, Deserialize)]
struct WireMaxMem {
    max: u64,
}

pub trait Monitor: Send {
    fn balloon_stats(&mut self) -> Result<BalloonStats, MonitorError>;
    fn io_stats(&mut self) -> Result<RawIoStats, MonitorError>;
    /// Ask the balloon to move guest allocation toward `bytes`.
    fn resize(&mut self, bytes: u64) -> Result<(), MonitorError>;
    fn max_mem(&mut self) -> Result<u64, MonitorError>;
    /// Hotplug the hard ceiling up to `bytes`.
    fn grow_max_mem(&mut self, bytes: u64) -> Result<(), MonitorError>;
}

pub struct ApiClient {
    socket: PathBuf,
}

impl ApiClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    pub fn for_vm(run_dir: impl AsRef<Path>, name: &str) -> Self {
        Self::new(run_dir.as_ref().join(format!("{}.sock", name)))
    }

    fn call(
        &self,
        method: Method,
        command: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<Option<serde_json::Value>, MonitorError> {
        let mut stream = UnixStream::connect(&self.socket)?;
        stream.set_read_timeout(Some(IO_TIMEOUT))?;
        stream.set_write_timeout(Some(IO_TIMEOUT))?;

        let body = body.map(|b| b.to_string()).unwrap_or_default();
        let request = format!(
            "{} {}/{} HTTP/1.1\r\nHost: localhost\r\nAccept: application/json\r\n\
             Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            method,
            API_PREFIX,
            command,
            body.len(),
            body
        );
        stream.write_all(request.as_bytes())?;

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw)?;
        let raw = String::from_utf8(raw).map_err(|_| MonitorError::BadResponse)?;

        let (head, payload) = raw.split_once("\r\n\r\n").ok_or(MonitorError::BadResponse)?;
        let status = head
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse::<u16>().ok())
            .and_then(|code| StatusCode::from_u16(code).ok())
            .ok_or(MonitorError::BadResponse)?;
        if !status.is_success() {
            return Err(MonitorError::Status(status));
        }
        if payload.trim().is_empty() {
            Ok(None)
        } else {
            Ok(Some(serde_json::from_str(payload.trim())?))
        }
    }

    fn get<T: serde::de::DeserializeOwned>(&self, command: &str) -> Result<T, MonitorError> {
        let v = self
            .call(Method::GET, command, None)?
            .ok_or(MonitorError::EmptyBody)?;
        Ok(serde_json::from_value(v)?)
    }

    fn put(&self, command: &str, body: serde_json::Value) -> Result<(), MonitorError> {
        self.call(Method::PUT, command, Some(&body))?;
        Ok(())
    }
}

impl Monitor for ApiClient {
    fn balloon_stats(&mut self) -> Result<BalloonStats, MonitorError> {
        self.get("vm.mem-stats")
    }

    fn io_stats(&mut self) -> Result<RawIoStats, MonitorError> {
        let w: WireIoStats = self.get("vm.io-stats")?;
        Ok(RawIoStats {
            rd_req: w.rd_req,
            rd_bytes: w.rd_bytes,
            wr_req: w.wr_req,
            wr_bytes: w.wr_bytes,
        })
    }

    fn resize(&mut self, bytes: u64) -> Result<(), MonitorError> {
        self.put("vm.resize", json!({ "target": bytes }))
    }

    fn max_mem(&mut self) -> Result<u64, MonitorError> {
        let w: WireMaxMem = self.get("vm.max-mem")?;
        Ok(w.max)
    }

    fn grow_max_mem(&mut self, bytes: u64) -> Result<(), MonitorError> {
        self.put("vm.max-mem", json!({ "max": bytes }))
    }
}
