//! Command-line interface for vpcctl
//!
//! Uses clap with derive for type-safe CLI parsing

use crate::model::SubnetKind;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// vpcctl - manage software-defined VPCs on a single Linux host
#[derive(Parser)]
#[command(name = "vpcctl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/vpcctl.toml")]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Create a new VPC with its bridge
    CreateVpc {
        /// VPC name
        name: String,

        /// VPC CIDR block (e.g., 10.0.0.0/16)
        cidr: String,
    },

    /// Delete a VPC and all its resources
    DeleteVpc {
        /// VPC name
        name: String,
    },

    /// Create a subnet inside a VPC
    CreateSubnet {
        /// VPC name
        vpc: String,

        /// Subnet name
        name: String,

        /// Subnet CIDR (e.g., 10.0.1.0/24)
        cidr: String,

        /// Subnet type
        #[arg(long = "type", value_enum, default_value_t = SubnetKind::Private)]
        kind: SubnetKind,
    },

    /// Delete a subnet
    DeleteSubnet {
        /// VPC name
        vpc: String,

        /// Subnet name
        name: String,
    },

    /// Set up NAT so a VPC can reach the outside world
    SetupNat {
        /// VPC name
        vpc: String,

        /// Public subnet name
        subnet: String,

        /// Host interface for NAT (defaults to the configured interface)
        #[arg(short, long)]
        interface: Option<String>,
    },

    /// Execute a command inside a subnet's namespace
    Exec {
        /// VPC name
        vpc: String,

        /// Subnet name
        subnet: String,

        /// Command line to execute (shell-interpreted)
        command: String,
    },

    /// List all VPCs and their subnets
    ListVpcs {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Apply firewall rules inside a subnet's namespace
    ApplyFirewall {
        /// VPC name
        vpc: String,

        /// Subnet name
        subnet: String,

        /// JSON file with ingress rules
        #[arg(long)]
        rules_file: Option<PathBuf>,
    },

    /// Generate shell completion scripts
    Completion {
        /// Shell to generate completion for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Generate shell completion scripts
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "vpcctl", &mut std::io::stdout());
    }
}
