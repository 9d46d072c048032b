use clap::{Parser, Subcommand};
use std::net::Ipv4Addr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "scratchvm",
    version,
    about = "Disposable test VMs on UTM: build a template, clone it, run tests"
)]
pub struct Cli {
    /// Path to config file [default: scratchvm.toml, optional]
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only print failures and the final summary
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Install a fresh template VM from an ISO, unattended
    CreateTemplate {
        /// Template name (overrides config)
        #[arg(long)]
        name: Option<String>,

        /// Local ISO path or http(s) URL
        #[arg(long)]
        iso: Option<String>,

        /// Memory, e.g. 2048 (MiB) or 4G
        #[arg(long)]
        ram: Option<String>,

        /// Virtual CPU count
        #[arg(long)]
        cpu: Option<u32>,

        /// Disk size, e.g. 8 (GiB) or 20G
        #[arg(long)]
        disk: Option<String>,

        /// Root password set by the installer
        #[arg(long)]
        password: Option<String>,

        /// SSH key pair name under the key directory
        #[arg(long)]
        ssh: Option<String>,

        /// Network mode: shared, bridged or host
        #[arg(long)]
        network: Option<String>,

        /// Delete an existing VM with the same name first
        #[arg(long)]
        force: bool,
    },

    /// Clone the template into a new VM and boot it
    Clone {
        /// Name of the new VM (default: scratch-<timestamp>)
        name: Option<String>,

        /// Template to clone (overrides config)
        #[arg(long)]
        template: Option<String>,

        /// Memory, e.g. 2048 (MiB) or 4G
        #[arg(long)]
        ram: Option<String>,

        /// Virtual CPU count
        #[arg(long)]
        cpu: Option<u32>,

        /// SSH key pair name under the key directory
        #[arg(long)]
        ssh: Option<String>,

        /// Delete an existing VM with the same name first
        #[arg(long)]
        force: bool,

        /// Provision the clone and run tests from this git repository
        #[arg(long)]
        repo: Option<String>,

        /// Test command to run in the checkout (implies provisioning)
        #[arg(long)]
        command: Option<String>,
    },

    /// Provision a running VM and run a test command in it
    ProvisionForTesting {
        /// VM name, recorded with the result
        #[arg(long)]
        name: String,

        /// Guest IPv4 address
        #[arg(long)]
        ip: Ipv4Addr,

        /// SSH key pair name under the key directory
        #[arg(long)]
        ssh: Option<String>,

        /// Git repository to clone into the guest
        #[arg(long)]
        repo: Option<String>,

        /// Test command (default: make test)
        #[arg(long)]
        command: Option<String>,

        /// Root password, used to inject the SSH key when given
        #[arg(long)]
        password: Option<String>,
    },

    /// List VMs known to the hypervisor
    List,

    /// Stop (if running) and delete a VM
    Destroy {
        name: String,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// List recorded test results
    Results {
        /// Only show failed runs
        #[arg(long)]
        failed: bool,
    },
}
