use std::io;
use std::path::PathBuf;

use bincode::{Decode, Encode};
use log::error;

// Registry persistence. The worker rewrites the whole file on every
// successful mutation so a daemon restart finds its VEs again. Writes go to a
// _tmp sibling first and rename into place; a load that finds no file, bad
// magic, or a corrupt tail logs and starts empty rather than refusing to run.

const MAGIC: &[u8; 4] = b"MBDS";
const VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StateRecord {
    pub name: String,
    pub ve_type: u32,
    pub guarantee: u64,
    pub limit: u64,
    pub swap: u64,
}

pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut os = self.path.clone().into_os_string();
        os.push("_tmp");
        os.into()
    }

    pub fn save(&self, records: &[StateRecord]) -> io::Result<()> {
        let body = bincode::encode_to_vec((VERSION, records), bincode::config::standard())
            .map_err(io::Error::other)?;
        let mut buf = Vec::with_capacity(MAGIC.len() + body.len());
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&body);

        let tmp = self.tmp_path();
        std::fs::write(&tmp, &buf)?;
        std::fs::rename(&tmp, &self.path)
    }

    pub fn load(&self) -> Vec<StateRecord> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // we may have died after writing _tmp but before the rename;
                // adopt it if it's there, otherwise this is a fresh start
                if std::fs::rename(self.tmp_path(), &self.path).is_err() {
                    return Vec::new();
                }
                match std::fs::read(&self.path) {
                    Ok(data) => data,
                    Err(_) => return Vec::new(),
                }
            }
            Err(e) => {
                error!("failed to read state file {}: {}", self.path.display(), e);
                return Vec::new();
            }
        };

        if data.len() < MAGIC.len() || &data[..MAGIC.len()] != MAGIC {
            error!(
                "state file {}: bad magic, starting empty",
                self.path.display()
            );
            return Vec::new();
        }
        match bincode::decode_from_slice::<(u32, Vec<StateRecord>), _>(
            &data[MAGIC.len()..],
            bincode::config::standard(),
        ) {
            Ok(((VERSION, records), _)) => records,
            Ok(((version, _), _)) => {
                error!(
                    "state file {}: unhandled version {}, starting empty",
                    self.path.display(),
                    version
                );
                Vec::new()
            }
            Err(e) => {
                error!(
                    "state file {}: corrupt ({}), starting empty",
                    self.path.display(),
                    e
                );
                Vec::new()
            }
        }
    }
}
