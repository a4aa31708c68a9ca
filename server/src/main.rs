mod interceptors;
mod services;

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use joblib::{defaults, hostprobe, IoLimit, JobOptions, JobRegistry, ResourceLimits};
use protobuf::remote_jobs_server::RemoteJobsServer;
use services::jobservice::RemoteJobsService;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tracing::info;

/// Multi-tenant job runner behind mutually-authenticated gRPC.
#[derive(Debug, Parser)]
struct Args {
    /// Listen address in address:port form.
    #[arg(short = 'a', long, default_value = "0.0.0.0:16000")]
    address: String,
    /// Directory holding root_ca.pem, server.pem and server.key.
    #[arg(short = 'c', long, default_value = "./certs/server")]
    certs_dir: PathBuf,
    /// Base directory under which per-job chroot roots are created.
    #[arg(long, default_value = ".")]
    root_base: PathBuf,
    /// Per-job memory limit in KiB; 0 leaves the knob unset.
    #[arg(long, default_value_t = defaults::MEMORY_KIB)]
    memory_kib: u64,
    /// Per-job CPU quota per period, in milliseconds.
    #[arg(long, default_value_t = defaults::CPU_QUOTA_MS)]
    cpu_quota_ms: u64,
    #[arg(long, default_value_t = defaults::CPU_PERIOD_MS)]
    cpu_period_ms: u64,
    /// Per-job read bandwidth in bytes/s on the device backing root-base.
    #[arg(long, default_value_t = defaults::IO_RBPS)]
    io_rbps: u64,
    /// Per-job write bandwidth in bytes/s on the device backing root-base.
    #[arg(long, default_value_t = defaults::IO_WBPS)]
    io_wbps: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
    let args = Args::parse();

    // The io.max limit binds to the device backing the chroot area.
    let mount = hostprobe::filesystem_mount(&args.root_base).context("probe root-base mount")?;
    let (major, minor) = hostprobe::device_numbers(&mount).context("probe device numbers")?;
    info!(mount = %mount.display(), major, minor, "probed root-base device");

    let options = JobOptions {
        limits: ResourceLimits {
            cpu_quota_ms: args.cpu_quota_ms,
            cpu_period_ms: args.cpu_period_ms,
            memory_kib: args.memory_kib,
            io: Some(IoLimit {
                major,
                minor,
                rbps: args.io_rbps,
                wbps: args.io_wbps,
            }),
        },
        root_base: Some(args.root_base),
        isolate_pid: true,
        isolate_net: true,
    };
    let registry = Arc::new(JobRegistry::new(options));

    let ca = std::fs::read(args.certs_dir.join("root_ca.pem")).context("read root_ca.pem")?;
    let cert = std::fs::read(args.certs_dir.join("server.pem")).context("read server.pem")?;
    let key = std::fs::read(args.certs_dir.join("server.key")).context("read server.key")?;
    let tls = ServerTlsConfig::new()
        .identity(Identity::from_pem(cert, key))
        .client_ca_root(Certificate::from_pem(ca));

    let addr: SocketAddr = args.address.parse().context("parse listen address")?;
    info!(%addr, "server listening");
    serve(addr, tls, Arc::clone(&registry), shutdown_signal()).await?;

    // The shutdown hook translates into finish() on every job of every
    // tenant before the process exits.
    registry.shutdown().await;
    info!("server stopped");
    Ok(())
}

async fn serve(
    addr: SocketAddr,
    tls: ServerTlsConfig,
    registry: Arc<JobRegistry>,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let service = RemoteJobsServer::with_interceptor(
        RemoteJobsService::new(registry),
        interceptors::cert::extract_peer_identity,
    );
    Server::builder()
        .tls_config(tls)
        .context("apply TLS config")?
        .add_service(service)
        .serve_with_shutdown(addr, shutdown)
        .await
        .context("serve")?;
    Ok(())
}

async fn shutdown_signal() {
    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
    info!("shutdown signal received");
}
