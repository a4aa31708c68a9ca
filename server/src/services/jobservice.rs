//! Translation between the wire service and the job registry: every RPC
//! is scoped by the tenant identity the cert interceptor injected.

use std::pin::Pin;
use std::sync::Arc;

use joblib::{Error as JobError, JobRegistry, OutputFrame, StreamOrigin};
use protobuf::remote_jobs_server::RemoteJobs;
use protobuf::{
    AttachJobRequest, AttachJobResponse, GetJobStatusRequest, GetJobStatusResponse,
    LaunchJobRequest, LaunchJobResponse, ListJobsRequest, ListJobsResponse, StreamFrame,
    TerminateJobRequest, TerminateJobResponse,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tonic::{Request, Response, Status};
use tracing::debug;
use uuid::Uuid;

use crate::interceptors::cert::TenantExtension;

/// Subscriber channels are small and bounded on purpose: a slow remote
/// client exerts backpressure through the multiplexer all the way to the
/// child process.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 16;

pub struct RemoteJobsService {
    registry: Arc<JobRegistry>,
}

impl RemoteJobsService {
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        RemoteJobsService { registry }
    }
}

fn tenant_of<T>(req: &Request<T>) -> Result<String, Status> {
    req.extensions()
        .get::<TenantExtension>()
        .map(|ext| ext.tenant.clone())
        .ok_or_else(|| Status::unauthenticated("request has no authenticated identity"))
}

fn parse_job_id(id: &str) -> Result<Uuid, Status> {
    Uuid::parse_str(id).map_err(|err| Status::invalid_argument(format!("invalid job id: {err}")))
}

fn into_status(err: JobError) -> Status {
    match err {
        JobError::NotFound => Status::not_found("no such job"),
        JobError::InvalidState { .. } => Status::failed_precondition("job already terminated"),
        JobError::CapacityExhausted => Status::resource_exhausted(err.to_string()),
        JobError::PolicyViolation(_) => Status::failed_precondition(err.to_string()),
        JobError::HostResource { .. } | JobError::Startup(_) => Status::internal(err.to_string()),
    }
}

fn into_proto(snap: joblib::JobSnapshot) -> protobuf::JobStatus {
    protobuf::JobStatus {
        id: snap.id.to_string(),
        command: snap.command,
        args: snap.args,
        start_ts: Some(snap.start_ts.into()),
        end_ts: snap.end_ts.map(Into::into),
        exit_error: snap.exit_error,
        exit_code: snap.exit_code,
    }
}

#[tonic::async_trait]
impl RemoteJobs for RemoteJobsService {
    type AttachJobStream = Pin<Box<dyn Stream<Item = Result<AttachJobResponse, Status>> + Send>>;

    async fn launch_job(
        &self,
        req: Request<LaunchJobRequest>,
    ) -> Result<Response<LaunchJobResponse>, Status> {
        let tenant = tenant_of(&req)?;
        let LaunchJobRequest { command, args } = req.into_inner();
        if command.is_empty() {
            return Err(Status::invalid_argument("command must not be empty"));
        }
        let id = self.registry.launch(&tenant, &command, args);
        Ok(Response::new(LaunchJobResponse { id: id.to_string() }))
    }

    async fn list_jobs(
        &self,
        req: Request<ListJobsRequest>,
    ) -> Result<Response<ListJobsResponse>, Status> {
        let tenant = tenant_of(&req)?;
        let jobs = self
            .registry
            .list(&tenant)
            .into_iter()
            .map(into_proto)
            .collect();
        Ok(Response::new(ListJobsResponse { jobs }))
    }

    async fn get_job_status(
        &self,
        req: Request<GetJobStatusRequest>,
    ) -> Result<Response<GetJobStatusResponse>, Status> {
        let tenant = tenant_of(&req)?;
        let id = parse_job_id(&req.get_ref().id)?;
        let snap = self.registry.status(&tenant, id).map_err(into_status)?;
        Ok(Response::new(GetJobStatusResponse {
            job: Some(into_proto(snap)),
        }))
    }

    async fn terminate_job(
        &self,
        req: Request<TerminateJobRequest>,
    ) -> Result<Response<TerminateJobResponse>, Status> {
        let tenant = tenant_of(&req)?;
        let id = parse_job_id(&req.get_ref().id)?;
        self.registry.terminate(&tenant, id).map_err(into_status)?;
        Ok(Response::new(TerminateJobResponse {}))
    }

    async fn attach_job(
        &self,
        req: Request<AttachJobRequest>,
    ) -> Result<Response<Self::AttachJobStream>, Status> {
        let tenant = tenant_of(&req)?;
        let id = parse_job_id(&req.get_ref().id)?;

        let (stdout_tx, mut stdout_rx) = mpsc::channel::<OutputFrame>(SUBSCRIBER_CHANNEL_CAPACITY);
        let (stderr_tx, mut stderr_rx) = mpsc::channel::<OutputFrame>(SUBSCRIBER_CHANNEL_CAPACITY);
        let subscriber = self
            .registry
            .attach(&tenant, id, stdout_tx, stderr_tx)
            .map_err(into_status)?;

        let (out_tx, out_rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            let mut stdout_open = true;
            let mut stderr_open = true;
            while stdout_open || stderr_open {
                let frame = tokio::select! {
                    frame = stdout_rx.recv(), if stdout_open => {
                        match frame {
                            Some(frame) => frame,
                            None => {
                                stdout_open = false;
                                continue;
                            }
                        }
                    }
                    frame = stderr_rx.recv(), if stderr_open => {
                        match frame {
                            Some(frame) => frame,
                            None => {
                                stderr_open = false;
                                continue;
                            }
                        }
                    }
                };
                let resp = AttachJobResponse {
                    frame: Some(StreamFrame {
                        data: frame.data.to_vec(),
                        is_stderr: frame.origin == StreamOrigin::Stderr,
                    }),
                };
                if out_tx.send(Ok(resp)).await.is_err() {
                    // The caller went away; withdraw the subscriber so the
                    // multiplexer stops paying for it.
                    debug!(job = %id, subscriber, "attach stream dropped by client");
                    let _ = registry.detach(&tenant, id, subscriber);
                    break;
                }
            }
        });

        Ok(Response::new(
            Box::pin(ReceiverStream::new(out_rx)) as Self::AttachJobStream
        ))
    }
}
