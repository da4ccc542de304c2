// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Callback gateway.
//!
//! The HTTP endpoint method containers reach through `SDK_CALLBACK_URL`. It
//! runs on its own thread with a single-threaded runtime and talks to the
//! orchestrator only through two queues: `submit` messages go out, `output`
//! and `prov` messages come back in. Sharing nothing else with the
//! orchestrator, a thread isolates it as well as a child process would: long
//! sync calls and slow clients block neither the watch loop nor its runtime,
//! and stopping the thread drops whatever requests are still in flight.
//!
//! One route, `POST /`, with a JSON-RPC style body `{method, params}`:
//!
//! | method                | behaviour                                        | auth |
//! |-----------------------|--------------------------------------------------|------|
//! | `module._name_submit` | submit `module.name` as a subjob, return its id  | yes  |
//! | `module._check_job`   | `{finished: 0}` or the output with `finished: 1` | no   |
//! | `module.get_provenance` | latest provenance snapshot                     | no   |
//! | anything else         | submit and wait for the output                   | yes  |

use std::collections::HashMap;
use std::future::IntoFuture;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, UdpSocket};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::job::{JobError, JobParams};
use crate::message::{Message, MessageReceiver, MessageSender};

/// Errors answered with an HTTP error status.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// Missing or wrong token.
    #[error("Unauthorized")]
    Unauthorized,

    /// Malformed request.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The orchestrator is no longer accepting submissions.
    #[error("Job runner is shutting down")]
    Unavailable,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match self {
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Gateway settings.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Token submissions must carry.
    pub token: String,
    /// Accept submissions without a token.
    pub bypass_token: bool,
    /// Polling interval of synchronous calls.
    pub sync_poll_interval: Duration,
    /// Upper bound of a synchronous call.
    pub sync_call_timeout: Duration,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State owned by one gateway instance.
pub struct GatewayState {
    settings: GatewaySettings,
    to_runner: MessageSender,
    inbox: Mutex<MessageReceiver>,
    outputs: Mutex<HashMap<String, Value>>,
    prov: Mutex<Option<Value>>,
}

impl GatewayState {
    /// Create gateway state around the two queues.
    pub fn new(settings: GatewaySettings, to_runner: MessageSender, inbox: MessageReceiver) -> Self {
        Self {
            settings,
            to_runner,
            inbox: Mutex::new(inbox),
            outputs: Mutex::new(HashMap::new()),
            prov: Mutex::new(None),
        }
    }

    /// Merge every pending `output`/`prov` message without blocking.
    pub fn drain(&self) {
        let mut inbox = lock(&self.inbox);
        while let Ok(message) = inbox.try_recv() {
            match message {
                Message::Output { job_id, payload } => {
                    lock(&self.outputs).insert(job_id, payload);
                }
                Message::Prov(snapshot) => *lock(&self.prov) = Some(snapshot),
                other => debug!(kind = other.kind(), "Ignoring message on gateway queue"),
            }
        }
    }

    /// Output of a finished job.
    pub fn output(&self, job_id: &str) -> Option<Value> {
        lock(&self.outputs).get(job_id).cloned()
    }

    /// Latest provenance snapshot.
    pub fn provenance(&self) -> Option<Value> {
        lock(&self.prov).clone()
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<(), GatewayError> {
        if self.settings.bypass_token {
            return Ok(());
        }
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.strip_prefix("Bearer ").unwrap_or(v).trim());
        match token {
            Some(t) if t == self.settings.token => Ok(()),
            _ => Err(GatewayError::Unauthorized),
        }
    }

    fn submit(&self, params: JobParams) -> Result<String, GatewayError> {
        let job_id = uuid::Uuid::new_v4().to_string();
        info!(job_id = %job_id, method = %params.method, "Subjob submitted");
        self.to_runner
            .send(Message::Submit {
                job_id: job_id.clone(),
                params,
            })
            .map_err(|_| GatewayError::Unavailable)?;
        Ok(job_id)
    }

    async fn wait_for(&self, job_id: &str) -> Value {
        let poll = async {
            loop {
                self.drain();
                if let Some(output) = self.output(job_id) {
                    return output;
                }
                tokio::time::sleep(self.settings.sync_poll_interval).await;
            }
        };
        match tokio::time::timeout(self.settings.sync_call_timeout, poll).await {
            Ok(output) => output,
            Err(_) => {
                warn!(job_id = %job_id, "Synchronous call timed out");
                JobError::timeout(job_id).into_payload()
            }
        }
    }
}

/// Parameters of a subjob submitted as `method` with the request body `data`.
fn subjob_params(method: String, data: &Value) -> JobParams {
    let service_ver = data
        .get("service_ver")
        .or_else(|| data.get("context").and_then(|c| c.get("service_ver")))
        .and_then(Value::as_str)
        .map(str::to_string);
    JobParams {
        method,
        params: data.get("params").cloned().unwrap_or_else(|| json!([])),
        service_ver,
        ..Default::default()
    }
}

fn with_finished(output: Option<Value>) -> Value {
    match output {
        Some(Value::Object(mut map)) => {
            map.insert("finished".to_string(), json!(1));
            Value::Object(map)
        }
        Some(other) => json!({ "finished": 1, "output": other }),
        None => json!({ "finished": 0 }),
    }
}

async fn process_rpc(
    state: &GatewayState,
    headers: &HeaderMap,
    data: Value,
) -> Result<Value, GatewayError> {
    let method = data
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::BadRequest("Missing method".to_string()))?;
    let (module, name) = method
        .split_once('.')
        .ok_or_else(|| GatewayError::BadRequest(format!("Invalid method: {}", method)))?;

    if let Some(inner) = name.strip_prefix('_').and_then(|n| n.strip_suffix("_submit")) {
        state.authorize(headers)?;
        let job_id = state.submit(subjob_params(format!("{}.{}", module, inner), &data))?;
        return Ok(json!({ "result": [job_id] }));
    }

    if name.starts_with("_check_job") {
        let job_id = data
            .get("params")
            .and_then(|p| p.get(0))
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::BadRequest("Missing job id".to_string()))?;
        state.drain();
        return Ok(json!({ "result": [with_finished(state.output(job_id))] }));
    }

    if name.starts_with("get_provenance") {
        state.drain();
        return Ok(json!({ "result": [state.provenance()] }));
    }

    state.authorize(headers)?;
    let job_id = state.submit(subjob_params(method.to_string(), &data))?;
    Ok(with_finished(Some(state.wait_for(&job_id).await)))
}

async fn root_get() -> Json<Value> {
    Json(json!({}))
}

async fn root_post(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, GatewayError> {
    let data: Value = match serde_json::from_slice(&body) {
        Ok(data @ Value::Object(_)) if data.get("method").is_some() => data,
        _ => return Ok(Json(json!({}))),
    };
    process_rpc(&state, &headers, data).await.map(Json)
}

/// The gateway router.
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/", get(root_get).post(root_post))
        .with_state(state)
}

/// Bind the gateway listener. Port 0 picks a free port.
pub fn bind(port: u16) -> std::io::Result<TcpListener> {
    TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
}

/// Address of the interface used for outbound traffic.
///
/// Connecting a UDP socket sends nothing, it only selects a route.
pub fn outward_ip() -> std::io::Result<IpAddr> {
    let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
    socket.connect(SocketAddr::from((Ipv4Addr::new(8, 8, 8, 8), 80)))?;
    Ok(socket.local_addr()?.ip())
}

/// A running gateway.
#[derive(Debug)]
pub struct GatewayHandle {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl GatewayHandle {
    /// Local address the gateway listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop serving and wait for the gateway thread to exit.
    ///
    /// Requests in flight, including synchronous calls still waiting for
    /// their subjob, are dropped.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => debug!("Gateway stopped"),
                _ => warn!("Gateway thread did not exit cleanly"),
            }
        }
    }
}

impl Drop for GatewayHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Start the gateway on `listener` in a dedicated thread.
pub fn start(listener: TcpListener, state: GatewayState) -> std::io::Result<GatewayHandle> {
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let app = router(Arc::new(state));

    let thread = std::thread::Builder::new()
        .name("callback-gateway".to_string())
        .spawn(move || {
            let result = runtime.block_on(async move {
                let listener = tokio::net::TcpListener::from_std(listener)?;
                info!(addr = %addr, "Callback gateway listening");
                tokio::select! {
                    served = axum::serve(listener, app).into_future() => served,
                    _ = shutdown_rx => Ok(()),
                }
            });
            if let Err(e) = result {
                error!(addr = %addr, error = %e, "Callback gateway failed");
            }
        })?;

    Ok(GatewayHandle {
        addr,
        shutdown: Some(shutdown_tx),
        thread: Some(thread),
    })
}
