use std::path::PathBuf;

use clap::{Parser, Subcommand};

use mbd::error::strerror;
use mbd::proto::{self, Request, Response};
use mbd::util::{parse_memsize, strmemsize};
use mbd::ve::{VeConfig, VeConfigPatch};

// Control client. Memory sizes take K/M/G suffixes ("512M"), "unlim" means
// no limit. Exit code is the daemon's error code.

fn parse_ve_type(s: &str) -> Result<u32, String> {
    match s {
        "ct" => Ok(0),
        "vm" => Ok(1),
        "vm-linux" => Ok(2),
        "vm-windows" => Ok(3),
        _ => Err(format!("unknown VE type {:?}", s)),
    }
}

#[derive(Parser, Debug)]
#[command(version, about = "control client for the mbd memory balancer")]
struct Args {
    #[arg(long, default_value = proto::DEFAULT_SOCKET)]
    socket: PathBuf,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Register a VE
    Register {
        name: String,
        #[arg(long = "type", value_parser = parse_ve_type, default_value = "ct")]
        ve_type: u32,
        #[arg(long, value_parser = parse_memsize, default_value = "0")]
        guarantee: u64,
        #[arg(long, value_parser = parse_memsize, default_value = "unlim")]
        limit: u64,
        #[arg(long, value_parser = parse_memsize, default_value = "unlim")]
        swap: u64,
        /// Skip the guarantee admission check
        #[arg(long)]
        force: bool,
    },
    /// Let the daemon start tuning a registered VE
    Activate { name: String },
    /// Stop tuning a VE without forgetting it
    Deactivate { name: String },
    /// Remove a VE from management
    Unregister { name: String },
    /// Change config fields of a registered VE
    Update {
        name: String,
        #[arg(long, value_parser = parse_memsize)]
        guarantee: Option<u64>,
        #[arg(long, value_parser = parse_memsize)]
        limit: Option<u64>,
        #[arg(long, value_parser = parse_memsize)]
        swap: Option<u64>,
        #[arg(long)]
        force: bool,
    },
    /// List registered VEs
    List,
}

fn to_request(cmd: Cmd) -> Request {
    match cmd {
        Cmd::Register {
            name,
            ve_type,
            guarantee,
            limit,
            swap,
            force,
        } => Request::Register {
            name,
            ve_type,
            config: VeConfig {
                guarantee,
                limit,
                swap,
            },
            force,
        },
        Cmd::Activate { name } => Request::Activate { name },
        Cmd::Deactivate { name } => Request::Deactivate { name },
        Cmd::Unregister { name } => Request::Unregister { name },
        Cmd::Update {
            name,
            guarantee,
            limit,
            swap,
            force,
        } => Request::Update {
            name,
            patch: VeConfigPatch {
                guarantee,
                limit,
                swap,
            },
            force,
        },
        Cmd::List => Request::List,
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init();
    let args = Args::parse();
    match proto::request(&args.socket, &to_request(args.cmd)).await {
        Ok(Response::Ok) => {}
        Ok(Response::Err { code }) => {
            eprintln!("mbctl: {}", strerror(code));
            std::process::exit(code.min(255) as i32);
        }
        Ok(Response::VeList { ves }) => {
            println!(
                "{:<24} {:<8} {:<7} {:>10} {:>10} {:>10}",
                "NAME", "TYPE", "ACTIVE", "GUARANTEE", "LIMIT", "SWAP"
            );
            for ve in ves {
                println!(
                    "{:<24} {:<8} {:<7} {:>10} {:>10} {:>10}",
                    ve.name,
                    ve.ve_type.to_string(),
                    if ve.active { "yes" } else { "no" },
                    strmemsize(ve.config.guarantee),
                    strmemsize(ve.config.limit),
                    strmemsize(ve.config.swap)
                );
            }
        }
        Err(e) => {
            eprintln!("mbctl: {}", e);
            std::process::exit(1);
        }
    }
}
