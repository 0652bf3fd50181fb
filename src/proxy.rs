use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Method, Request, Response, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use std::fmt::Display;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::BedrockConfig;
use crate::endpoint::{resolve_url, resolve_url_at};
use crate::error::{ApiError, AuthError, Error, Result};
use crate::sigv4::{Credentials, SigV4Signer, SigV4Timestamp};
use crate::transcode::SseTranscoder;
use crate::transform::{Transformed, Transformer};

/// Largest inbound request body accepted.
pub const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

const EVENT_STREAM: &str = "application/vnd.amazon.eventstream";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Body type of every response the server writes.
pub type ProxyBody = UnsyncBoxBody<Bytes, Error>;

type HttpsClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Headers that describe a single connection and are never forwarded.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Whether the client asked for the connection to end after this exchange.
fn requests_close(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"))
}

/// Upstream response, tagged by how it is relayed to the client.
pub enum Reply<B> {
    /// Copied through as is.
    Complete(Response<B>),
    /// Event stream to transcode into SSE.
    Streaming(Response<B>),
}

impl<B> Reply<B>
where
    B: Body<Data = Bytes> + Unpin + Send + 'static,
    B::Error: Display,
{
    pub fn classify(response: Response<B>, requested_stream: bool) -> Self {
        if requested_stream && response.status().is_success() {
            Reply::Streaming(response)
        } else {
            Reply::Complete(response)
        }
    }

    pub fn into_response(self) -> Response<ProxyBody> {
        match self {
            Reply::Complete(upstream) => {
                let (parts, body) = upstream.into_parts();
                let mut response = Response::new(
                    body.map_err(|e| Error::Upstream(e.to_string()))
                        .boxed_unsync(),
                );
                *response.status_mut() = parts.status;
                copy_headers(&parts.headers, response.headers_mut(), &[]);
                response
            }
            Reply::Streaming(upstream) => {
                let (parts, body) = upstream.into_parts();
                let mut response = Response::new(SseTranscoder::new(body).boxed_unsync());
                *response.status_mut() = parts.status;
                let headers = response.headers_mut();
                copy_headers(
                    &parts.headers,
                    headers,
                    &[header::CONTENT_TYPE, header::CACHE_CONTROL, header::CONTENT_LENGTH],
                );
                headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
                headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
                headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
                response
            }
        }
    }
}

fn copy_headers(from: &HeaderMap, to: &mut HeaderMap, skip: &[HeaderName]) {
    for (name, value) in from {
        if is_hop_by_hop(name) || skip.contains(name) {
            continue;
        }
        to.append(name.clone(), value.clone());
    }
}

/// Translates one Anthropic Messages request into a signed Bedrock
/// invocation and relays the answer.
///
/// Nothing is retried: a transport failure or timeout is reported to the
/// client as a bad gateway.
pub struct BedrockProxy {
    client: HttpsClient,
    signer: SigV4Signer,
    transformer: Transformer,
    config: BedrockConfig,
    timeout: Duration,
    log_requests: bool,
}

impl BedrockProxy {
    pub fn new(config: &BedrockConfig, log_requests: bool) -> Self {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(CONNECT_TIMEOUT));

        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            client,
            signer: SigV4Signer::bedrock(config.region.clone()),
            transformer: Transformer::new(config.clone()),
            timeout: Duration::from_secs(config.timeout_secs),
            config: config.clone(),
            log_requests,
        }
    }

    fn credentials(&self) -> std::result::Result<Credentials, AuthError> {
        Credentials::new(
            self.config.access_key.clone(),
            self.config.secret_key.clone(),
            self.config.session_token.clone(),
        )
    }

    /// Run the full request lifecycle.
    pub async fn handle<B>(&self, request: Request<B>, request_id: &str) -> Result<Response<ProxyBody>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let header_str = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let content_type = header_str("content-type").unwrap_or_default();
        let version_hint = header_str("anthropic-version");
        let client_closes = requests_close(request.headers());

        let body = read_body_limited(request.into_body(), MAX_BODY_SIZE).await?;
        let (upstream_request, transformed) = self.build_upstream_request(
            &body,
            &content_type,
            version_hint.as_deref(),
            &SigV4Timestamp::now(),
        )?;

        if self.log_requests {
            info!(
                request_id = %request_id,
                "Bedrock request body:\n{}",
                String::from_utf8_lossy(&transformed.body)
            );
        }

        let start = Instant::now();
        let upstream = self.dispatch(upstream_request).await?;
        let status = upstream.status();

        if self.log_requests || !status.is_success() {
            info!(
                request_id = %request_id,
                model = %transformed.model,
                status = status.as_u16(),
                latency_ms = start.elapsed().as_millis() as u64,
                "Bedrock responded"
            );
        }

        let mut response = Reply::classify(upstream, transformed.stream).into_response();
        if client_closes {
            response.headers_mut().remove(header::CONNECTION);
        }
        Ok(response)
    }

    /// Transform, address and sign. The returned request carries exactly
    /// the bytes that were signed.
    pub fn build_upstream_request(
        &self,
        body: &[u8],
        content_type: &str,
        version_hint: Option<&str>,
        timestamp: &SigV4Timestamp,
    ) -> Result<(Request<Full<Bytes>>, Transformed)> {
        let transformed = self.transformer.transform(body, content_type, version_hint)?;
        let credentials = self.credentials()?;

        let url = match &self.config.endpoint_url {
            Some(base) => resolve_url_at(base, &transformed.model, transformed.stream),
            None => resolve_url(&self.config.region, &transformed.model, transformed.stream),
        };
        let uri: Uri = url
            .parse()
            .map_err(|e| AuthError::Signing(format!("invalid Bedrock URL '{}': {}", url, e)))?;

        let accept = if transformed.stream {
            EVENT_STREAM
        } else {
            "application/json"
        };
        let headers = [("content-type", "application/json"), ("accept", accept)];

        let signed = self.signer.sign(
            &credentials,
            "POST",
            &uri,
            &headers,
            &transformed.body,
            timestamp,
        )?;

        debug!(
            model = %transformed.model,
            stream = transformed.stream,
            url = %uri,
            digest = %transformed.digest,
            signed_headers = %signed.signed_headers,
            "Signed Bedrock request"
        );
        trace!(canonical_request = %signed.canonical_request, "SigV4 canonical request");

        let mut builder = Request::builder().method(Method::POST).uri(uri);
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        let request = signed
            .apply(builder)
            .body(Full::new(transformed.body.clone()))
            .map_err(|e| AuthError::Signing(format!("failed to build request: {}", e)))?;

        Ok((request, transformed))
    }

    async fn dispatch(
        &self,
        request: Request<Full<Bytes>>,
    ) -> Result<Response<hyper::body::Incoming>> {
        match tokio::time::timeout(self.timeout, self.client.request(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                warn!(error = %e, "Bedrock request failed");
                Err(Error::Upstream(e.to_string()))
            }
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs(), "Bedrock request timed out");
                Err(Error::Timeout(self.timeout))
            }
        }
    }
}

/// Collect a request body, refusing anything over `max_size` bytes.
pub async fn read_body_limited<B>(body: B, max_size: usize) -> Result<Bytes>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    if let Some(declared) = body.size_hint().exact()
        && declared as usize > max_size
    {
        return Err(ApiError::RequestTooLarge {
            size: declared as usize,
            max: max_size,
        }
        .into());
    }

    match Limited::new(body, max_size).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            // Size unknown up front (chunked); report the first byte past the limit.
            Err(ApiError::RequestTooLarge {
                size: max_size + 1,
                max: max_size,
            }
            .into())
        }
        Err(e) => Err(ApiError::InvalidRequest {
            message: format!("failed to read request body: {}", e),
        }
        .into()),
    }
}
