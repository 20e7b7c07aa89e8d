//! Newline-delimited JSON protocol. One request per line in, one response per line out.

use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

use crate::api::{ApiError, BookingApi, ReserveBody};
use crate::limits::MAX_LINE_LEN;
use crate::observability;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("framing: {0}")]
    Codec(#[from] LinesCodecError),

    #[error("encoding: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Reserve(ReserveBody),
    Get { id: String },
    Cancel { id: String },
    Confirm { id: String },
    ListByRequester { requester_id: String },
    ListByResource { resource_id: String },
    ListAll,
    Stats,
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub status: u16,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn success(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(err: &ApiError) -> Self {
        Self::error(err.kind(), err.status_code(), err.to_string())
    }

    fn error(kind: &str, status: u16, message: String) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(ErrorBody {
                kind: kind.to_string(),
                status,
                message,
            }),
        }
    }

    fn status(&self) -> u16 {
        self.error.as_ref().map_or(200, |e| e.status)
    }
}

/// Serve one connection until the peer hangs up.
pub async fn process_connection(socket: TcpStream, api: Arc<BookingApi>) -> Result<(), WireError> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));

    while let Some(frame) = framed.next().await {
        let line = match frame {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                // The codec stops yielding after an error, so answer and hang up.
                let err = ApiError::BadRequest(format!("line exceeds {MAX_LINE_LEN} bytes"));
                framed.send(serde_json::to_string(&Response::failure(&err))?).await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_line(&api, &line).await;
        framed.send(serde_json::to_string(&response)?).await?;
    }
    Ok(())
}

/// Parse and execute a single request line. Never fails: errors become responses.
pub async fn handle_line(api: &BookingApi, line: &str) -> Response {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            debug!("malformed request: {e}");
            metrics::counter!(observability::REQUESTS_TOTAL, "op" => "invalid", "status" => "400")
                .increment(1);
            return Response::failure(&ApiError::BadRequest(format!("malformed request: {e}")));
        }
    };

    let op = observability::request_label(&request);
    let started = Instant::now();
    let response = dispatch(api, request).await;

    let status = response.status();
    if status >= 500 {
        warn!(op, status, error = ?response.error, "request failed");
    }
    metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => status.to_string())
        .increment(1);
    metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
    response
}

async fn dispatch(api: &BookingApi, request: Request) -> Response {
    match request {
        Request::Reserve(body) => respond(api.reserve(body).await),
        Request::Get { id } => respond(api.get(&id).await),
        Request::Cancel { id } => respond(api.cancel(&id).await),
        Request::Confirm { id } => respond(api.confirm(&id).await),
        Request::ListByRequester { requester_id } => {
            respond(api.list_for_requester(&requester_id).await)
        }
        Request::ListByResource { resource_id } => {
            respond(api.list_for_resource(&resource_id).await)
        }
        Request::ListAll => respond(api.list_all().await),
        Request::Stats => respond(api.stats().await),
        Request::Ping => Response::success(Value::String("pong".into())),
    }
}

fn respond<T: Serialize>(result: Result<T, ApiError>) -> Response {
    match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(data) => Response::success(data),
            Err(e) => Response::error("internal", 500, format!("response encoding failed: {e}")),
        },
        Err(e) => Response::failure(&e),
    }
}
