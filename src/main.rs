//! vpcctl - software-defined VPCs on a single Linux host
//!
//! Provisions and tears down virtual networks built from bridges, network
//! namespaces and veth pairs, with NAT and per-subnet packet filtering,
//! keeping a persisted record of every VPC in step with kernel state.

mod cli;
mod config;
mod driver;
mod engine;
mod error;
mod firewall;
mod model;
mod store;

use cli::{Cli, Commands};
use driver::IpCommandDriver;
use engine::Engine;
use error::Result;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Uid;
use std::time::Duration;
use store::DirStore;
use tracing_subscriber::EnvFilter;

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

extern "C" fn on_interrupt(_: nix::libc::c_int) {
    // Only async-signal-safe calls allowed here: raw write, then _exit
    const MSG: &[u8] = b"\nOperation cancelled\n";
    unsafe {
        nix::libc::write(2, MSG.as_ptr().cast(), MSG.len());
        nix::libc::_exit(130);
    }
}

fn install_interrupt_handler() {
    let action = SigAction::new(
        SigHandler::Handler(on_interrupt),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        let _ = signal::sigaction(Signal::SIGINT, &action);
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "vpcctl=debug" } else { "vpcctl=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();

    // Completion needs neither config nor privileges
    if let Commands::Completion { shell } = &cli.command {
        Cli::generate_completion(*shell);
        return Ok(());
    }

    init_tracing(cli.verbose);
    install_interrupt_handler();

    let cfg = config::load(&cli.config)?;

    // Kernel mutations and namespace entry need root; listing does not
    if !matches!(cli.command, Commands::ListVpcs { .. }) && !Uid::effective().is_root() {
        eprintln!("vpcctl must be run as root");
        std::process::exit(1);
    }

    let store = DirStore::open(&cfg.state_dir)?;
    let driver = IpCommandDriver::new(Duration::from_secs(cfg.command_timeout));
    let engine = Engine::new(Box::new(driver), Box::new(store));

    match cli.command {
        Commands::CreateVpc { name, cidr } => engine.create_vpc(&name, &cidr)?,
        Commands::DeleteVpc { name } => engine.delete_vpc(&name)?,
        Commands::CreateSubnet {
            vpc,
            name,
            cidr,
            kind,
        } => engine.create_subnet(&vpc, &name, &cidr, kind)?,
        Commands::DeleteSubnet { vpc, name } => engine.delete_subnet(&vpc, &name)?,
        Commands::SetupNat {
            vpc,
            subnet,
            interface,
        } => {
            let iface = interface.unwrap_or(cfg.host_interface);
            engine.setup_nat(&vpc, &subnet, &iface)?;
        }
        Commands::Exec {
            vpc,
            subnet,
            command,
        } => {
            let output = engine.exec(&vpc, &subnet, &command)?;
            if !output.stdout.is_empty() {
                print!("{}", output.stdout);
            }
            if !output.stderr.is_empty() {
                eprint!("{}", output.stderr);
            }
            // The in-namespace command's exit code is the CLI exit code
            std::process::exit(output.code);
        }
        Commands::ListVpcs { json } => print_vpcs(&engine.list_vpcs()?, json),
        Commands::ApplyFirewall {
            vpc,
            subnet,
            rules_file,
        } => engine.apply_firewall(&vpc, &subnet, rules_file.as_deref())?,
        Commands::Completion { .. } => unreachable!("handled above"),
    }

    Ok(())
}

fn print_vpcs(vpcs: &[model::Vpc], json: bool) {
    if json {
        println!("{}", serde_json::to_string_pretty(vpcs).unwrap());
        return;
    }

    if vpcs.is_empty() {
        println!("No VPCs found");
        return;
    }

    for vpc in vpcs {
        println!("\nVPC: {} ({})", vpc.name, vpc.cidr);
        println!("Bridge: {}", vpc.bridge);
        println!("Subnets:");
        for (name, subnet) in &vpc.subnets {
            println!("  - {}: {} ({})", name, subnet.cidr, subnet.kind);
        }
    }
}
