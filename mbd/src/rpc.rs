use std::sync::Arc;

use log::{debug, error};
use tokio_seqpacket::{UnixSeqpacket, UnixSeqpacketListener};

use crate::ldmgr::LoadManager;
use crate::proto::{ProtoError, Request, Response, WIRE_BUF};

// Control socket server: accept, decode one request, run it against the load
// manager, send the response. Lifecycle operations park their task on the
// worker's reply handle; List is answered from the registry snapshot without
// touching the worker.

pub async fn serve(listener: &mut UnixSeqpacketListener, mgr: Arc<LoadManager>) {
    loop {
        match listener.accept().await {
            Ok(conn) => {
                let mgr = mgr.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_conn(&conn, &mgr).await {
                        error!("rpc connection error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("accept {}", e);
            }
        }
    }
}

async fn handle_conn(conn: &UnixSeqpacket, mgr: &LoadManager) -> Result<(), ProtoError> {
    let mut buf = vec![0u8; WIRE_BUF];
    let n = conn.recv(&mut buf).await?;
    if n == 0 {
        return Err(ProtoError::EmptyRequest);
    }
    let (req, _) = bincode::decode_from_slice(&buf[..n], bincode::config::standard())?;
    debug!("rpc request {:?}", req);

    let resp = dispatch(mgr, req).await;
    let n = bincode::encode_into_slice(&resp, &mut buf, bincode::config::standard())?;
    conn.send(&buf[..n]).await?;
    Ok(())
}

async fn dispatch(mgr: &LoadManager, req: Request) -> Response {
    let result = match req {
        Request::Register {
            name,
            ve_type,
            config,
            force,
        } => mgr.register_ve(&name, ve_type, config, force).await,
        Request::Activate { name } => mgr.activate_ve(&name).await,
        Request::Deactivate { name } => mgr.deactivate_ve(&name).await,
        Request::Update { name, patch, force } => mgr.update_ve(&name, patch, force).await,
        Request::Unregister { name } => mgr.unregister_ve(&name).await,
        Request::List => {
            return Response::VeList {
                ves: mgr.get_all_registered_ves(),
            };
        }
    };
    match result {
        Ok(()) => Response::Ok,
        Err(e) => Response::Err { code: e.code() },
    }
}
