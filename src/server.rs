use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ApiError, Error};
use crate::proxy::{BedrockProxy, ProxyBody};

/// Creation date reported for every listed model.
const MODEL_CREATED_AT: &str = "2025-02-19T00:00:00Z";

/// Shared server state passed to all request handlers.
///
/// Read-only after startup apart from the signer's key cache.
pub struct ServerState {
    pub config: Config,
    pub proxy: BedrockProxy,
}

impl ServerState {
    pub fn new(config: Config) -> Self {
        let proxy = BedrockProxy::new(&config.bedrock, config.logging.log_requests);
        Self { config, proxy }
    }
}

/// Handle an incoming TCP connection.
///
/// Serves HTTP/1.1 and routes requests to the appropriate handler.
pub async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req| {
        let state = state.clone();
        let remote = remote_addr;
        async move { handle_request(req, state, remote).await }
    });

    http1::Builder::new()
        .keep_alive(true)
        .serve_connection(io, service)
        .await?;

    Ok(())
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<ServerState>,
    remote_addr: SocketAddr,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let request_id = generate_request_id();

    debug!(
        method = %method,
        path = %path,
        remote = %remote_addr,
        request_id = %request_id,
        "Received request"
    );

    let start = std::time::Instant::now();

    let response = if requires_api_key(&path) && !api_key_matches(&req, &state.config) {
        warn!(
            remote = %remote_addr,
            request_id = %request_id,
            "Unauthorized request - invalid API key"
        );
        Err(Error::Api(ApiError::Unauthorized))
    } else {
        match (&method, path.as_str()) {
            (&Method::POST, "/v1/messages") | (&Method::POST, "/messages") => {
                handle_messages(req, &state, &request_id).await
            }
            (_, "/v1/messages") | (_, "/messages") => Err(Error::Api(ApiError::MethodNotAllowed {
                method: method.to_string(),
            })),

            (&Method::GET, "/v1/models") => handle_models(&state.config),

            (&Method::GET, "/health") | (&Method::GET, "/") => {
                Ok(json_response(StatusCode::OK, r#"{"status":"ok"}"#.to_string()))
            }

            _ => Ok(json_response(
                StatusCode::NOT_FOUND,
                r#"{"type":"error","error":{"type":"not_found_error","message":"Not found"}}"#
                    .to_string(),
            )),
        }
    };

    let duration = start.elapsed();

    match response {
        Ok(resp) => {
            let status = resp.status().as_u16();
            if status >= 400 {
                warn!(
                    method = %method,
                    path = %path,
                    status = status,
                    duration_ms = duration.as_millis(),
                    request_id = %request_id,
                    "Request failed"
                );
            } else {
                info!(
                    method = %method,
                    path = %path,
                    status = status,
                    duration_ms = duration.as_millis(),
                    request_id = %request_id,
                    "Request completed"
                );
            }
            Ok(resp)
        }
        Err(e) => {
            let resp = error_to_response(&e, &request_id);
            warn!(
                method = %method,
                path = %path,
                status = resp.status().as_u16(),
                duration_ms = duration.as_millis(),
                request_id = %request_id,
                error = %e,
                "Request error"
            );
            Ok(resp)
        }
    }
}

fn requires_api_key(path: &str) -> bool {
    path.starts_with("/v1/") || path == "/messages"
}

fn api_key_matches<B>(req: &Request<B>, config: &Config) -> bool {
    let Some(expected_key) = config.server.api_key.as_deref() else {
        return true;
    };

    let auth_header = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok());
    let x_api_key = req.headers().get("x-api-key").and_then(|v| v.to_str().ok());

    let provided_key = x_api_key.or_else(|| auth_header.and_then(|h| h.strip_prefix("Bearer ")));
    provided_key == Some(expected_key)
}

fn generate_request_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("req_{:016x}", nanos)
}

async fn handle_messages(
    req: Request<hyper::body::Incoming>,
    state: &ServerState,
    request_id: &str,
) -> Result<Response<ProxyBody>, Error> {
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.contains("application/json") {
        return Err(Error::Api(ApiError::InvalidRequest {
            message: "Content-Type must be application/json".to_string(),
        }));
    }

    let mut response = state.proxy.handle(req, request_id).await?;
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    Ok(response)
}

#[derive(Debug, Serialize)]
struct ModelInfo {
    #[serde(rename = "type")]
    kind: &'static str,
    id: String,
    display_name: String,
    created_at: &'static str,
}

#[derive(Debug, Serialize)]
struct ModelList {
    data: Vec<ModelInfo>,
    has_more: bool,
    first_id: Option<String>,
    last_id: Option<String>,
}

fn handle_models(config: &Config) -> Result<Response<ProxyBody>, Error> {
    let mut ids: Vec<&String> = config.bedrock.model_mappings.keys().collect();
    ids.sort();

    let data: Vec<ModelInfo> = ids
        .into_iter()
        .map(|id| ModelInfo {
            kind: "model",
            id: id.clone(),
            display_name: id.clone(),
            created_at: MODEL_CREATED_AT,
        })
        .collect();

    let list = ModelList {
        first_id: data.first().map(|m| m.id.clone()),
        last_id: data.last().map(|m| m.id.clone()),
        has_more: false,
        data,
    };

    let body = serde_json::to_string(&list)?;
    Ok(json_response(StatusCode::OK, body))
}

fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn json_response(status: StatusCode, body: String) -> Response<ProxyBody> {
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

fn error_to_response(error: &Error, request_id: &str) -> Response<ProxyBody> {
    let (status, error_type, message) = match error {
        Error::MalformedRequest(message) => (
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            message.clone(),
        ),
        Error::Api(ApiError::InvalidRequest { message }) => (
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            message.clone(),
        ),
        Error::Api(ApiError::RequestTooLarge { size, max }) => (
            StatusCode::PAYLOAD_TOO_LARGE,
            "request_too_large",
            format!(
                "Request body too large: {} bytes (max: {} bytes)",
                size, max
            ),
        ),
        Error::Api(ApiError::MethodNotAllowed { method }) => (
            StatusCode::METHOD_NOT_ALLOWED,
            "invalid_request_error",
            format!("Method {} not allowed", method),
        ),
        Error::Api(ApiError::Unauthorized) => (
            StatusCode::UNAUTHORIZED,
            "authentication_error",
            "Invalid or missing API key".to_string(),
        ),
        e if e.is_gateway_failure() => (
            StatusCode::BAD_GATEWAY,
            "api_error",
            "Bad gateway: upstream request failed".to_string(),
        ),
        e => (StatusCode::INTERNAL_SERVER_ERROR, "api_error", e.to_string()),
    };

    let body = json!({
        "type": "error",
        "error": {
            "type": error_type,
            "message": message,
        },
        "request_id": request_id,
    });

    let mut response = json_response(status, body.to_string());
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}
