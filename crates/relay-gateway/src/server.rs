//! HTTP control surface.
//!
//! Thin translation layer: every route parses and validates input, forwards
//! one action through the supervisor, and maps the typed error onto an HTTP
//! status with a `{error: {code, message}}` envelope. No session state lives
//! here.

use std::net::SocketAddr;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use relay_core::errors::ActionError;
use relay_core::ids::SessionId;
use relay_core::ipc::Action;

use crate::supervisor::Supervisor;

pub struct GatewayServer {
    listener: tokio::net::TcpListener,
    addr: SocketAddr,
    router: Router,
}

impl GatewayServer {
    pub async fn bind(addr: SocketAddr, supervisor: Supervisor) -> anyhow::Result<Self> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        Ok(Self {
            listener,
            addr,
            router: router(supervisor),
        })
    }

    /// Bound address; differs from the requested one when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        info!(addr = %self.addr, "listening");
        axum::serve(self.listener, self.router).await?;
        Ok(())
    }
}

pub fn router(supervisor: Supervisor) -> Router {
    Router::new()
        .route("/sessions/{id}/start", post(start_session))
        .route("/sessions/{id}/messages", post(send_message))
        .route("/sessions/{id}/media", post(send_media))
        .route("/sessions/{id}", get(get_session).delete(disconnect_session))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(supervisor)
}

struct ApiError(ActionError);

impl From<ActionError> for ApiError {
    fn from(e: ActionError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            "invalid_request" => StatusCode::BAD_REQUEST,
            "not_found" => StatusCode::NOT_FOUND,
            "logged_out" => StatusCode::GONE,
            "recipient_unreachable" => StatusCode::UNPROCESSABLE_ENTITY,
            "not_available" | "worker_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
            "not_connected" | "ipc_timeout" | "transport_timeout" => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "error": {
                "code": self.0.kind(),
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

#[derive(Deserialize)]
struct SendTextBody {
    to: String,
    text: String,
}

#[derive(Deserialize)]
struct SendMediaBody {
    to: String,
    /// Base64-encoded payload.
    bytes: String,
    caption: Option<String>,
}

async fn start_session(
    State(sup): State<Supervisor>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let value = sup.forward(SessionId::from_raw(id), Action::Start).await?;
    Ok(Json(value))
}

async fn get_session(
    State(sup): State<Supervisor>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let value = sup
        .forward(SessionId::from_raw(id), Action::GetStatus)
        .await?;
    Ok(Json(value))
}

async fn disconnect_session(
    State(sup): State<Supervisor>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let value = sup
        .forward(SessionId::from_raw(id), Action::Disconnect)
        .await?;
    Ok(Json(value))
}

async fn send_message(
    State(sup): State<Supervisor>,
    Path(id): Path<String>,
    Json(body): Json<SendTextBody>,
) -> Result<Json<Value>, ApiError> {
    require_non_empty("to", &body.to)?;
    require_non_empty("text", &body.text)?;

    let value = sup
        .forward(
            SessionId::from_raw(id),
            Action::SendText {
                to: body.to,
                text: body.text,
            },
        )
        .await?;
    Ok(Json(value))
}

async fn send_media(
    State(sup): State<Supervisor>,
    Path(id): Path<String>,
    Json(body): Json<SendMediaBody>,
) -> Result<Json<Value>, ApiError> {
    require_non_empty("to", &body.to)?;
    let bytes = BASE64
        .decode(body.bytes.as_bytes())
        .map_err(|_| ActionError::InvalidRequest("'bytes' is not valid base64".into()))?;
    if bytes.is_empty() {
        return Err(ActionError::InvalidRequest("'bytes' must be non-empty".into()).into());
    }

    let value = sup
        .forward(
            SessionId::from_raw(id),
            Action::SendMedia {
                to: body.to,
                bytes: Bytes::from(bytes),
                caption: body.caption,
            },
        )
        .await?;
    Ok(Json(value))
}

async fn health(State(sup): State<Supervisor>) -> Json<Value> {
    Json(serde_json::to_value(sup.health()).unwrap_or_else(|_| json!({"status": "ok"})))
}

fn require_non_empty(field: &str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ActionError::InvalidRequest(format!("'{field}' must be non-empty")).into());
    }
    Ok(())
}
