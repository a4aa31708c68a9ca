use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use protobuf::remote_jobs_client::RemoteJobsClient;
use protobuf::{
    AttachJobRequest, GetJobStatusRequest, JobStatus, LaunchJobRequest, ListJobsRequest,
    TerminateJobRequest,
};
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};

pub struct ClientCli {
    inner: RemoteJobsClient<Channel>,
}

impl ClientCli {
    pub async fn connect(server: &str, certs_dir: &Path, domain: &str) -> Result<Self> {
        let ca = tokio::fs::read(certs_dir.join("root_ca.pem"))
            .await
            .context("read root_ca.pem")?;
        let cert = tokio::fs::read(certs_dir.join("client.pem"))
            .await
            .context("read client.pem")?;
        let key = tokio::fs::read(certs_dir.join("client.key"))
            .await
            .context("read client.key")?;
        let tls = ClientTlsConfig::new()
            .domain_name(domain)
            .ca_certificate(Certificate::from_pem(ca))
            .identity(Identity::from_pem(cert, key));
        let channel = Channel::from_shared(format!("https://{server}"))
            .context("parse server address")?
            .tls_config(tls)
            .context("apply TLS config")?
            .connect()
            .await
            .context("connect to server")?;
        Ok(ClientCli {
            inner: RemoteJobsClient::new(channel),
        })
    }

    pub async fn launch(&mut self, command: &str, args: Vec<String>) -> Result<()> {
        let resp = self
            .inner
            .launch_job(LaunchJobRequest {
                command: command.to_string(),
                args,
            })
            .await?;
        println!("{}", resp.into_inner().id);
        Ok(())
    }

    pub async fn list(&mut self) -> Result<()> {
        let resp = self.inner.list_jobs(ListJobsRequest {}).await?;
        for job in resp.into_inner().jobs {
            print_status(&job);
        }
        Ok(())
    }

    pub async fn status(&mut self, job_id: &str) -> Result<()> {
        let resp = self
            .inner
            .get_job_status(GetJobStatusRequest {
                id: job_id.to_string(),
            })
            .await?;
        if let Some(job) = resp.into_inner().job {
            print_status(&job);
        }
        Ok(())
    }

    pub async fn terminate(&mut self, job_id: &str) -> Result<()> {
        self.inner
            .terminate_job(TerminateJobRequest {
                id: job_id.to_string(),
            })
            .await?;
        println!("terminated {job_id}");
        Ok(())
    }

    /// Streams frames to the local stdout/stderr until the job terminates
    /// or the server closes the stream.
    pub async fn attach(&mut self, job_id: &str) -> Result<()> {
        let mut stream = self
            .inner
            .attach_job(AttachJobRequest {
                id: job_id.to_string(),
            })
            .await?
            .into_inner();
        let mut stdout = std::io::stdout();
        let mut stderr = std::io::stderr();
        while let Some(resp) = stream.message().await? {
            if let Some(frame) = resp.frame {
                if frame.is_stderr {
                    stderr.write_all(&frame.data)?;
                    stderr.flush()?;
                } else {
                    stdout.write_all(&frame.data)?;
                    stdout.flush()?;
                }
            }
        }
        Ok(())
    }
}

fn print_status(job: &JobStatus) {
    let start = job
        .start_ts
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "-".into());
    let end = job
        .end_ts
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "-".into());
    let state = if job.end_ts.is_some() {
        format!("exit_code={} exit_error={:?}", job.exit_code, job.exit_error)
    } else {
        "running".to_string()
    };
    println!(
        "{} {} {:?} start={} end={} {}",
        job.id, job.command, job.args, start, end, state
    );
}
