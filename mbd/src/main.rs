use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::info;
use tokio_seqpacket::UnixSeqpacketListener;

use mbd::config::DaemonConfig;
use mbd::host::HostInventory;
use mbd::ldmgr::policy::make_policy;
use mbd::ldmgr::state::StateFile;
use mbd::ldmgr::{LoadManager, MakeBackend};
use mbd::proto;
use mbd::rpc;
use mbd::ve::ct::CtBackend;
use mbd::ve::vm::VmBackend;
use mbd::ve::{Backend, VeType};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(long, default_value = "/etc/mbd/config.json")]
    config: PathBuf,

    #[arg(long, default_value = proto::DEFAULT_SOCKET)]
    socket: PathBuf,

    #[arg(long, default_value = "/sys/fs/cgroup/memory")]
    cgroup_root: PathBuf,

    #[arg(long, default_value = "/sys/fs/cgroup/blkio")]
    blkio_root: PathBuf,

    /// Directory holding the per-VM monitor sockets (<name>.sock).
    #[arg(long, default_value = "/run/mbd/monitors")]
    monitor_dir: PathBuf,

    #[arg(long, default_value = "/var/lib/mbd/state")]
    state_file: PathBuf,

    /// Override LoadManager.Policy from the config file.
    #[arg(long)]
    policy: Option<String>,
}

fn make_backend_factory(args: &Args) -> MakeBackend {
    let cgroup_root = args.cgroup_root.clone();
    let blkio_root = args.blkio_root.clone();
    let monitor_dir = args.monitor_dir.clone();
    Box::new(move |name, ty| {
        Ok(match ty {
            VeType::Ct => Backend::Ct(CtBackend::new(
                cgroup_root.clone(),
                blkio_root.clone(),
                name,
            )),
            VeType::Vm | VeType::VmLinux | VeType::VmWindows => {
                Backend::Vm(VmBackend::connect(&monitor_dir, name))
            }
        })
    })
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let ctrl_c = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            log::error!("failed to install SIGTERM handler: {}", e);
            let _ = ctrl_c.await;
        }
    }
}

async fn main_(args: Args) -> anyhow::Result<()> {
    let cfg = DaemonConfig::load(&args.config);

    let interval = Duration::from_millis(cfg.get_u64("LoadManager.IntervalMs", 5000));
    let policy_name = args
        .policy
        .clone()
        .unwrap_or_else(|| cfg.get_str("LoadManager.Policy", "wfb"));
    let policy = make_policy(&policy_name, interval)
        .with_context(|| format!("unknown policy {:?}", policy_name))?;
    info!("using policy {:?}, interval {:?}", policy_name, interval);

    let host = Arc::new(HostInventory::probe(&cfg));
    info!(
        "{} bytes of {} available for VEs",
        host.mem_available(),
        host.total_ram
    );
    host.apply_slice_reservations(&args.cgroup_root);

    let factory = make_backend_factory(&args);
    if let Some(dir) = args.state_file.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating state dir {}", dir.display()))?;
    }
    let state = StateFile::new(&args.state_file);
    let mgr = Arc::new(LoadManager::start(policy, host, factory, Some(state)));

    // a socket left over from a previous run would fail the bind
    let _ = std::fs::remove_file(&args.socket);
    let mut listener = UnixSeqpacketListener::bind_with_backlog(&args.socket, 10)
        .with_context(|| format!("binding {}", args.socket.display()))?;
    info!("listening on {}", args.socket.display());

    tokio::select! {
        _ = rpc::serve(&mut listener, mgr.clone()) => {}
        _ = shutdown_signal() => {
            info!("signal received, shutting down");
        }
    }

    mgr.shutdown().await;
    let _ = std::fs::remove_file(&args.socket);
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(e) = main_(args).await {
        eprintln!("mbd: {:#}", e);
        std::process::exit(1);
    }
}
