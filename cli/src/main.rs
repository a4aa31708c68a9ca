mod client_cli;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use client_cli::ClientCli;

/// Connect to a remote job server over mutual TLS.
#[derive(Debug, Parser)]
struct Cli {
    /// The address of the server in host:port form.
    #[arg(short = 's', long, default_value = "localhost:16000")]
    server: String,
    /// Directory holding root_ca.pem, client.pem and client.key.
    #[arg(short = 'c', long, default_value = "./certs/client")]
    certs_dir: PathBuf,
    /// Server name expected on the server certificate.
    #[arg(long, default_value = "localhost")]
    domain: String,
    /// The sub-command to issue.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Launch a command on the server and print its job id.
    Launch {
        command: String,
        /// Arguments passed to the command verbatim.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// List your jobs, newest first.
    List,
    /// Show one job's status.
    Status { job_id: String },
    /// Send the uncatchable kill to a running job's process group.
    Terminate { job_id: String },
    /// Stream a job's output until it terminates or you detach.
    Attach { job_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut client = ClientCli::connect(&cli.server, &cli.certs_dir, &cli.domain).await?;
    match cli.command {
        Command::Launch { command, args } => client.launch(&command, args).await,
        Command::List => client.list().await,
        Command::Status { job_id } => client.status(&job_id).await,
        Command::Terminate { job_id } => client.terminate(&job_id).await,
        Command::Attach { job_id } => client.attach(&job_id).await,
    }
}
