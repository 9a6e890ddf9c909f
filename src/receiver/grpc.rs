use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use opentelemetry_proto::tonic::collector::logs::v1::logs_service_server::{
    LogsService, LogsServiceServer,
};
use opentelemetry_proto::tonic::collector::logs::v1::{
    ExportLogsServiceRequest, ExportLogsServiceResponse,
};
use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_server::{
    MetricsService, MetricsServiceServer,
};
use opentelemetry_proto::tonic::collector::metrics::v1::{
    ExportMetricsServiceRequest, ExportMetricsServiceResponse,
};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{error, info, warn};

use crate::config::ReceiverConfig;
use crate::state::MemoryStore;

use super::{extract_metrics, process_log_export, PortMapper};

/// OTLP/gRPC receiver serving MetricsService and LogsService on one port.
pub struct GrpcReceiver {
    cfg: ReceiverConfig,
    store: Arc<MemoryStore>,
    port_mapper: Option<Arc<dyn PortMapper>>,
    cancel: CancellationToken,
    serve_task: Option<tokio::task::JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl GrpcReceiver {
    pub fn new(
        cfg: ReceiverConfig,
        store: Arc<MemoryStore>,
        port_mapper: Option<Arc<dyn PortMapper>>,
    ) -> Self {
        Self {
            cfg,
            store,
            port_mapper,
            cancel: CancellationToken::new(),
            serve_task: None,
            local_addr: None,
        }
    }

    /// Binds the listener and starts serving. A bind conflict is fatal with
    /// a diagnostic naming the port.
    pub async fn start(&mut self, cancel: CancellationToken) -> Result<()> {
        let addr = format!("{}:{}", self.cfg.bind, self.cfg.grpc_port);

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|_| anyhow!("port {} already in use", self.cfg.grpc_port))?;
        let local_addr = listener.local_addr().context("getting gRPC local address")?;
        self.local_addr = Some(local_addr);
        self.cancel = cancel.clone();

        let metrics_service = OtlpMetricsService {
            store: Arc::clone(&self.store),
            port_mapper: self.port_mapper.clone(),
        };
        let logs_service = OtlpLogsService {
            store: Arc::clone(&self.store),
            port_mapper: self.port_mapper.clone(),
        };

        info!(addr = %local_addr, "OTLP gRPC receiver listening");

        let serve_task = tokio::spawn(async move {
            let result = tonic::transport::Server::builder()
                .add_service(MetricsServiceServer::new(metrics_service))
                .add_service(LogsServiceServer::new(logs_service))
                .serve_with_incoming_shutdown(
                    TcpListenerStream::new(listener),
                    cancel.cancelled_owned(),
                )
                .await;

            if let Err(e) = result {
                error!(error = %e, "gRPC server stopped");
            }
        });
        self.serve_task = Some(serve_task);

        Ok(())
    }

    /// Signals shutdown and waits for in-flight RPCs to drain.
    pub async fn stop(&mut self) {
        self.cancel.cancel();

        if let Some(task) = self.serve_task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "gRPC serve task join failed");
            }
        }
    }

    /// The bound listener address, once started. Useful for ephemeral-port
    /// tests.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

/// MetricsService handler. Separate from the logs handler because both
/// services define an `export` method with different request types.
struct OtlpMetricsService {
    store: Arc<MemoryStore>,
    port_mapper: Option<Arc<dyn PortMapper>>,
}

#[tonic::async_trait]
impl MetricsService for OtlpMetricsService {
    async fn export(
        &self,
        request: Request<ExportMetricsServiceRequest>,
    ) -> Result<Response<ExportMetricsServiceResponse>, Status> {
        let source_port = source_port_of(&request);
        let req = request.into_inner();

        for rm in &req.resource_metrics {
            for sm in &rm.scope_metrics {
                extract_metrics(
                    &self.store,
                    rm.resource.as_ref(),
                    &sm.metrics,
                    source_port,
                    self.port_mapper.as_deref(),
                );
            }
        }

        Ok(Response::new(ExportMetricsServiceResponse::default()))
    }
}

/// LogsService handler.
struct OtlpLogsService {
    store: Arc<MemoryStore>,
    port_mapper: Option<Arc<dyn PortMapper>>,
}

#[tonic::async_trait]
impl LogsService for OtlpLogsService {
    async fn export(
        &self,
        request: Request<ExportLogsServiceRequest>,
    ) -> Result<Response<ExportLogsServiceResponse>, Status> {
        let source_port = source_port_of(&request);
        let req = request.into_inner();

        process_log_export(&self.store, self.port_mapper.as_deref(), &req, source_port);

        Ok(Response::new(ExportLogsServiceResponse::default()))
    }
}

/// The peer's ephemeral TCP port, or 0 when the transport does not expose it.
fn source_port_of<T>(request: &Request<T>) -> u16 {
    request.remote_addr().map(|addr| addr.port()).unwrap_or(0)
}
