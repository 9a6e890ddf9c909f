use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, KeyValue};
use opentelemetry_proto::tonic::logs::v1::{LogRecord, ResourceLogs, ScopeLogs};
use opentelemetry_proto::tonic::resource::v1::Resource;
use prost::Message;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tracing::{error, info, warn};

use crate::config::ReceiverConfig;
use crate::state::MemoryStore;

use super::{process_log_export, PortMapper};

/// Per-request read/write deadline on the HTTP endpoint.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long in-flight requests get to drain on shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// OTLP/HTTP receiver accepting `POST /v1/logs` as protobuf or JSON.
pub struct HttpReceiver {
    cfg: ReceiverConfig,
    store: Arc<MemoryStore>,
    port_mapper: Option<Arc<dyn PortMapper>>,
    cancel: CancellationToken,
    serve_task: Option<tokio::task::JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

struct HttpState {
    store: Arc<MemoryStore>,
    port_mapper: Option<Arc<dyn PortMapper>>,
}

impl HttpReceiver {
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
        let addr = format!("{}:{}", self.cfg.bind, self.cfg.http_port);

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|_| anyhow!("port {} already in use", self.cfg.http_port))?;
        let local_addr = listener.local_addr().context("getting HTTP local address")?;
        self.local_addr = Some(local_addr);
        self.cancel = cancel.clone();

        let state = Arc::new(HttpState {
            store: Arc::clone(&self.store),
            port_mapper: self.port_mapper.clone(),
        });

        let app = Router::new()
            .route("/v1/logs", post(handle_logs))
            .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
            .with_state(state);

        info!(addr = %local_addr, "OTLP HTTP receiver listening");

        let serve_task = tokio::spawn(async move {
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await;

            if let Err(e) = result {
                error!(error = %e, "HTTP server stopped");
            }
        });
        self.serve_task = Some(serve_task);

        Ok(())
    }

    /// Signals shutdown and waits up to the drain deadline for in-flight
    /// requests to complete.
    pub async fn stop(&mut self) {
        self.cancel.cancel();

        if let Some(task) = self.serve_task.take() {
            match tokio::time::timeout(SHUTDOWN_DEADLINE, task).await {
                Ok(Err(e)) => warn!(error = %e, "HTTP serve task join failed"),
                Err(_) => warn!("HTTP server forced shutdown after drain deadline"),
                Ok(Ok(())) => {}
            }
        }
    }

    /// The bound listener address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

/// POST /v1/logs. Decode failures are connection-local: the client gets a
/// 400 with a brief diagnostic and the server keeps running.
async fn handle_logs(
    State(state): State<Arc<HttpState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let req = match decode_logs_request(content_type, &body) {
        Ok(req) => req,
        Err(e) => {
            warn!(error = %e, "HTTP receiver: decoding payload");
            return (StatusCode::BAD_REQUEST, format!("invalid payload: {e}")).into_response();
        }
    };

    process_log_export(
        &state.store,
        state.port_mapper.as_deref(),
        &req,
        peer.port(),
    );

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        "{}",
    )
        .into_response()
}

/// Parses the request body by content type: `application/json` gets the JSON
/// mapping, everything else (including an absent header) decodes as protobuf.
fn decode_logs_request(content_type: &str, body: &[u8]) -> Result<ExportLogsServiceRequest> {
    if content_type.starts_with("application/json") {
        let raw: JsonExportLogsRequest =
            serde_json::from_slice(body).context("JSON decode")?;
        Ok(raw.into_proto())
    } else {
        ExportLogsServiceRequest::decode(body).context("protobuf decode")
    }
}

// JSON mirror of the OTLP/HTTP logs payload, restricted to the scalar subset
// the emitter produces. `intValue` and `timeUnixNano` arrive as JSON strings
// per the OTLP encoding, but bare numbers are accepted too.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonExportLogsRequest {
    #[serde(default)]
    resource_logs: Vec<JsonResourceLogs>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonResourceLogs {
    resource: Option<JsonResource>,
    #[serde(default)]
    scope_logs: Vec<JsonScopeLogs>,
}

#[derive(Debug, Deserialize)]
struct JsonResource {
    #[serde(default)]
    attributes: Vec<JsonKeyValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonScopeLogs {
    #[serde(default)]
    log_records: Vec<JsonLogRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonLogRecord {
    #[serde(default)]
    time_unix_nano: Option<StringOrNumber>,
    #[serde(default)]
    event_name: String,
    body: Option<JsonAnyValue>,
    #[serde(default)]
    attributes: Vec<JsonKeyValue>,
}

#[derive(Debug, Deserialize)]
struct JsonKeyValue {
    key: String,
    value: JsonAnyValue,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonAnyValue {
    string_value: Option<String>,
    int_value: Option<StringOrNumber>,
    double_value: Option<f64>,
    bool_value: Option<bool>,
}

/// OTLP JSON encodes 64-bit integers as strings; accept both forms.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    Number(i64),
    Text(String),
}

impl StringOrNumber {
    fn as_i64(&self) -> i64 {
        match self {
            StringOrNumber::Number(n) => *n,
            StringOrNumber::Text(s) => s.parse().unwrap_or(0),
        }
    }
}

impl JsonExportLogsRequest {
    fn into_proto(self) -> ExportLogsServiceRequest {
        ExportLogsServiceRequest {
            resource_logs: self
                .resource_logs
                .into_iter()
                .map(|rl| ResourceLogs {
                    resource: rl.resource.map(|r| Resource {
                        attributes: r.attributes.into_iter().map(JsonKeyValue::into_proto).collect(),
                        ..Default::default()
                    }),
                    scope_logs: rl
                        .scope_logs
                        .into_iter()
                        .map(|sl| ScopeLogs {
                            log_records: sl
                                .log_records
                                .into_iter()
                                .map(JsonLogRecord::into_proto)
                                .collect(),
                            ..Default::default()
                        })
                        .collect(),
                    ..Default::default()
                })
                .collect(),
        }
    }
}

impl JsonLogRecord {
    fn into_proto(self) -> LogRecord {
        LogRecord {
            time_unix_nano: self
                .time_unix_nano
                .map(|t| t.as_i64().max(0) as u64)
                .unwrap_or(0),
            event_name: self.event_name,
            body: self.body.map(JsonAnyValue::into_proto),
            attributes: self.attributes.into_iter().map(JsonKeyValue::into_proto).collect(),
            ..Default::default()
        }
    }
}

impl JsonKeyValue {
    fn into_proto(self) -> KeyValue {
        KeyValue {
            key: self.key,
            value: Some(self.value.into_proto()),
        }
    }
}

impl JsonAnyValue {
    fn into_proto(self) -> AnyValue {
        let value = if let Some(s) = self.string_value {
            any_value::Value::StringValue(s)
        } else if let Some(i) = self.int_value {
            any_value::Value::IntValue(i.as_i64())
        } else if let Some(d) = self.double_value {
            any_value::Value::DoubleValue(d)
        } else if let Some(b) = self.bool_value {
            any_value::Value::BoolValue(b)
        } else {
            any_value::Value::StringValue(String::new())
        };

        AnyValue { value: Some(value) }
    }
}
