mod cli;
mod config;
mod datastore;
mod network;
mod storage;
mod util;
mod vm;

#[cfg(test)]
mod testutil;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nasvm", about = "bhyve VM lifecycle supervisor")]
struct Cli {
    /// Path to config file (TOML).
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the listed VMs and every autostart VM, supervise them until
    /// SIGINT/SIGTERM, then stop them all.
    Run {
        /// VM ids to start in addition to the autostart set.
        ids: Vec<u64>,
    },
    /// Print whether a VM is running.
    Status { id: u64 },
    /// Print the bhyve command line for a VM without launching it.
    Args { id: u64 },
    /// Verify host prerequisites. Exits 0 if all pass.
    Check,
    /// Print the web console URLs of a VM.
    VncWeb { id: u64 },
    /// Print the serial console device of a running VM.
    Console { id: u64 },
    /// Print the host interfaces a VM's NICs attach to.
    Interfaces { id: u64 },
    /// Clone a VM and its zvol disks.
    Clone { id: u64 },
    /// Create a VM from a JSON definition.
    Create {
        #[arg(long)]
        file: PathBuf,
    },
    /// Add a device (JSON) to a VM.
    AddDevice {
        id: u64,
        #[arg(long)]
        file: PathBuf,
    },
    /// Replace the attributes of a VM's devices from a JSON list.
    UpdateDevices {
        id: u64,
        #[arg(long)]
        file: PathBuf,
    },
    /// Stop a VM if running and delete it.
    Delete { id: u64 },
    /// List all VMs.
    List,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        // VM errors carry an errno-style code for scripts driving the CLI.
        let code = e
            .downcast_ref::<vm::VmError>()
            .and_then(vm::VmError::errno)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = cli::load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Check => cli::run_check(&config),
        command => {
            let host = cli::Host::build(&config).await?;
            dispatch(&host, command).await
        }
    }
}

async fn dispatch(host: &cli::Host, command: Commands) -> Result<()> {
    match command {
        Commands::Run { ids } => cli::run_daemon(host, &ids).await,
        Commands::Status { id } => cli::run_status(host, id).await,
        Commands::Args { id } => cli::run_args(host, id).await,
        Commands::Check => cli::run_check(&host.config),
        Commands::VncWeb { id } => cli::run_vnc_web(host, id).await,
        Commands::Console { id } => cli::run_console(host, id).await,
        Commands::Interfaces { id } => cli::run_interfaces(host, id).await,
        Commands::Clone { id } => cli::run_clone(host, id).await,
        Commands::Create { file } => cli::run_create(host, &file).await,
        Commands::AddDevice { id, file } => cli::run_add_device(host, id, &file).await,
        Commands::UpdateDevices { id, file } => cli::run_update_devices(host, id, &file).await,
        Commands::Delete { id } => cli::run_delete(host, id).await,
        Commands::List => cli::run_list(host).await,
    }
}
