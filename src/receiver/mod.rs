//! OTLP ingest endpoints.
//!
//! Two listeners accept telemetry from Claude Code instances: a gRPC server
//! carrying the OTLP MetricsService and LogsService (default port 4317) and
//! an HTTP server accepting `POST /v1/logs` (default port 4318). Both extract
//! the `session.id` attribute, write flattened metrics/events into the state
//! store, and record the peer's TCP source port for PID correlation.

pub mod grpc;
pub mod http;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, KeyValue};
use opentelemetry_proto::tonic::metrics::v1::{metric, number_data_point, Metric as OtlpMetric};
use opentelemetry_proto::tonic::resource::v1::Resource;
use tokio_util::sync::CancellationToken;

use crate::config::ReceiverConfig;
use crate::state::{Event, MemoryStore, Metric};

pub use self::grpc::GrpcReceiver;
pub use self::http::HttpReceiver;

/// Records the mapping between inbound connection source ports and session
/// ids for PID correlation. Implementations must be safe for concurrent use.
pub trait PortMapper: Send + Sync {
    fn record_source_port(&self, source_port: u16, session_id: &str);
}

/// Manages both OTLP listeners as one unit.
pub struct Receiver {
    grpc: GrpcReceiver,
    http: HttpReceiver,
}

impl Receiver {
    /// Creates both receivers. `port_mapper` may be None when PID
    /// correlation is not wanted.
    pub fn new(
        cfg: ReceiverConfig,
        store: Arc<MemoryStore>,
        port_mapper: Option<Arc<dyn PortMapper>>,
    ) -> Self {
        Self {
            grpc: GrpcReceiver::new(cfg.clone(), Arc::clone(&store), port_mapper.clone()),
            http: HttpReceiver::new(cfg, store, port_mapper),
        }
    }

    /// Binds and starts both listeners. A port conflict on either endpoint
    /// is fatal; a failed HTTP bind tears the gRPC listener back down.
    pub async fn start(&mut self, cancel: CancellationToken) -> Result<()> {
        self.grpc.start(cancel.child_token()).await?;

        if let Err(e) = self.http.start(cancel.child_token()).await {
            self.grpc.stop().await;
            return Err(e);
        }

        Ok(())
    }

    /// Drains in-flight requests and shuts both listeners down.
    pub async fn stop(&mut self) {
        self.grpc.stop().await;
        self.http.stop().await;
    }

    /// Local gRPC listener address, once started. Useful with ephemeral
    /// test ports.
    pub fn grpc_addr(&self) -> Option<std::net::SocketAddr> {
        self.grpc.local_addr()
    }

    /// Local HTTP listener address, once started.
    pub fn http_addr(&self) -> Option<std::net::SocketAddr> {
        self.http.local_addr()
    }
}

/// Searches for `session.id` in resource attributes first, then in the
/// per-datapoint / per-record attributes. Returns an empty string when the
/// key is absent (the store re-keys that to the unknown bucket).
fn extract_session_id(resource: Option<&Resource>, attrs: &[KeyValue]) -> String {
    if let Some(resource) = resource {
        for kv in &resource.attributes {
            if kv.key == "session.id" {
                return any_value_to_string(kv.value.as_ref());
            }
        }
    }

    for kv in attrs {
        if kv.key == "session.id" {
            return any_value_to_string(kv.value.as_ref());
        }
    }

    String::new()
}

/// Converts OTLP KeyValue pairs to a plain string map. Non-scalar values get
/// a best-effort string representation.
fn kv_to_map(kvs: &[KeyValue]) -> HashMap<String, String> {
    kvs.iter()
        .map(|kv| (kv.key.clone(), any_value_to_string(kv.value.as_ref())))
        .collect()
}

/// Stringifies an OTLP AnyValue. Scalars map to their canonical text form;
/// composites fall back to their debug representation.
fn any_value_to_string(v: Option<&AnyValue>) -> String {
    let Some(value) = v.and_then(|v| v.value.as_ref()) else {
        return String::new();
    };

    match value {
        any_value::Value::StringValue(s) => s.clone(),
        any_value::Value::IntValue(i) => i.to_string(),
        any_value::Value::DoubleValue(d) => d.to_string(),
        any_value::Value::BoolValue(b) => b.to_string(),
        other => format!("{other:?}"),
    }
}

/// Converts a `time_unix_nano` value to wall time, substituting now for the
/// zero sentinel.
fn resolve_timestamp(time_unix_nano: u64) -> SystemTime {
    if time_unix_nano == 0 {
        SystemTime::now()
    } else {
        UNIX_EPOCH + Duration::from_nanos(time_unix_nano)
    }
}

/// Flattens Sum and Gauge data points into store metrics under the extracted
/// session id. Histograms and exponential histograms are ignored.
fn extract_metrics(
    store: &MemoryStore,
    resource: Option<&Resource>,
    metrics: &[OtlpMetric],
    source_port: u16,
    port_mapper: Option<&dyn PortMapper>,
) {
    for m in metrics {
        let data_points = match &m.data {
            Some(metric::Data::Sum(sum)) => &sum.data_points,
            Some(metric::Data::Gauge(gauge)) => &gauge.data_points,
            _ => continue,
        };

        for dp in data_points {
            let session_id = extract_session_id(resource, &dp.attributes);

            if let Some(mapper) = port_mapper {
                if !session_id.is_empty() && source_port > 0 {
                    mapper.record_source_port(source_port, &session_id);
                }
            }

            let value = match dp.value {
                Some(number_data_point::Value::AsDouble(d)) => d,
                Some(number_data_point::Value::AsInt(i)) => i as f64,
                None => 0.0,
            };

            store.add_metric(
                &session_id,
                Metric {
                    name: m.name.clone(),
                    value,
                    attributes: kv_to_map(&dp.attributes),
                    timestamp: resolve_timestamp(dp.time_unix_nano),
                },
            );
        }
    }
}

/// Extracts events from a logs export request and stores them. Shared by the
/// gRPC and HTTP paths.
fn process_log_export(
    store: &MemoryStore,
    port_mapper: Option<&dyn PortMapper>,
    req: &ExportLogsServiceRequest,
    source_port: u16,
) {
    for rl in &req.resource_logs {
        let resource = rl.resource.as_ref();

        for sl in &rl.scope_logs {
            for lr in &sl.log_records {
                let session_id = extract_session_id(resource, &lr.attributes);

                if let Some(mapper) = port_mapper {
                    if !session_id.is_empty() && source_port > 0 {
                        mapper.record_source_port(source_port, &session_id);
                    }
                }

                // Event name: the explicit field, falling back to a string body.
                let mut name = lr.event_name.clone();
                if name.is_empty() {
                    if let Some(any_value::Value::StringValue(s)) =
                        lr.body.as_ref().and_then(|b| b.value.as_ref())
                    {
                        name = s.clone();
                    }
                }

                store.add_event(
                    &session_id,
                    Event {
                        name,
                        attributes: kv_to_map(&lr.attributes),
                        timestamp: resolve_timestamp(lr.time_unix_nano),
                    },
                );
            }
        }
    }
}
