use std::path::Path;

use log::{info, warn};
use serde_json::Value;

// Daemon configuration is a JSON object looked up by dotted path, e.g.
// "Host.SysMem.Share". An absent option silently takes the built-in default;
// a present option with the wrong type or out-of-range value is reported and
// then falls back, so a typo'd config never takes the daemon down.

pub struct DaemonConfig {
    root: Value,
}

impl DaemonConfig {
    pub fn empty() -> Self {
        Self { root: Value::Null }
    }

    pub fn from_value(root: Value) -> Self {
        Self { root }
    }

    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) => {
                warn!("error reading config file {}: {}", path.display(), e);
                return Self::empty();
            }
        };
        match serde_json::from_str(&data) {
            Ok(root) => {
                info!("loaded config from {}", path.display());
                Self { root }
            }
            Err(e) => {
                warn!("error parsing config file {}: {}", path.display(), e);
                Self::empty()
            }
        }
    }

    fn lookup(&self, name: &str) -> Option<&Value> {
        let mut v = &self.root;
        for key in name.split('.') {
            v = v.as_object()?.get(key)?;
        }
        Some(v)
    }

    pub fn get_str(&self, name: &str, default: &str) -> String {
        match self.lookup(name) {
            None => default.to_string(),
            Some(Value::String(s)) => s.clone(),
            Some(v) => {
                warn!("config option {}: expected string, got {}", name, v);
                default.to_string()
            }
        }
    }

    pub fn get_u64(&self, name: &str, default: u64) -> u64 {
        match self.lookup(name) {
            None => default,
            Some(v) => match v.as_u64() {
                Some(n) => n,
                None => {
                    warn!("config option {}: expected unsigned integer, got {}", name, v);
                    default
                }
            },
        }
    }

    pub fn get_f64(&self, name: &str, default: f64, min: f64, max: f64) -> f64 {
        match self.lookup(name) {
            None => default,
            Some(v) => match v.as_f64() {
                Some(n) if n >= min && n <= max => n,
                Some(n) => {
                    warn!(
                        "config option {}: {} out of range [{}, {}]",
                        name, n, min, max
                    );
                    default
                }
                None => {
                    warn!("config option {}: expected number, got {}", name, v);
                    default
                }
            },
        }
    }
}
