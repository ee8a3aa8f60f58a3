use std::path::Path;

use bincode::{Decode, Encode};
use tokio_seqpacket::UnixSeqpacket;

use crate::ve::{VeConfig, VeConfigPatch, VeInfo};

// Wire format for the control socket: one bincode-encoded request per
// seqpacket connection, one response back. The integer codes in Response::Err
// are the canonical set from crate::error.

pub const DEFAULT_SOCKET: &str = "/run/mbd.sock";

// plenty for a few hundred registered VEs in one List response
pub const WIRE_BUF: usize = 64 << 10;

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    Io(#[from] std::io::Error),
    Encode(#[from] bincode::error::EncodeError),
    Decode(#[from] bincode::error::DecodeError),
    EmptyRequest,
}

impl std::fmt::Display for ProtoError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Encode, Decode)]
pub enum Request {
    Register {
        name: String,
        ve_type: u32,
        config: VeConfig,
        force: bool,
    },
    Activate {
        name: String,
    },
    Deactivate {
        name: String,
    },
    Update {
        name: String,
        patch: VeConfigPatch,
        force: bool,
    },
    Unregister {
        name: String,
    },
    List,
}

#[derive(Debug, Encode, Decode)]
pub enum Response {
    Ok,
    Err { code: u32 },
    VeList { ves: Vec<VeInfo> },
}

/// Send one request to the daemon and wait for its response.
pub async fn request(socket: impl AsRef<Path>, req: &Request) -> Result<Response, ProtoError> {
    let conn = UnixSeqpacket::connect(socket).await?;
    let mut buf = vec![0u8; WIRE_BUF];
    let n = bincode::encode_into_slice(req, &mut buf, bincode::config::standard())?;
    conn.send(&buf[..n]).await?;

    let n = conn.recv(&mut buf).await?;
    let (resp, _) = bincode::decode_from_slice(&buf[..n], bincode::config::standard())?;
    Ok(resp)
}
