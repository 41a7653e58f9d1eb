use std::io;
use std::sync::Arc;
use std::time::Duration;

use actix_web::http::header::AUTHORIZATION;
use actix_web::http::{Method, StatusCode};
use actix_web::{web, App, HttpRequest, HttpResponse, HttpResponseBuilder, HttpServer};
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use serde::Deserialize;
use tracing::debug;

use crate::conversion::{to_chat_response, to_messages_request};
use crate::ledger::Ledger;
use crate::models::anthropic::{MessagesResponse, Usage};
use crate::models::openai::ChatCompletionRequest;
use crate::pricing::PricingTable;
use crate::sse::{ExchangeRecorder, NativeTap, TranslatedStream, UsageCapture};
use crate::util::error_response;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Hop-by-hop headers (plus Host), never copied in either direction.
const HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub http: reqwest::Client,
    pub target: String,
    pub pricing: Arc<PricingTable>,
    pub ledger: Arc<Ledger>,
}

impl AppState {
    pub fn new(target: String, timeout: Duration, pricing: Arc<PricingTable>, ledger: Arc<Ledger>) -> Self {
        Self {
            http: build_http_client(timeout),
            target,
            pricing,
            ledger,
        }
    }
}

/// Upstream client: bounded by the configured proxy timeout, redirects
/// handed back to the caller instead of being followed.
pub fn build_http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::none())
        .user_agent(concat!("tollgate/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Route table: POST `/v1/chat/completions` → translated, POST
/// `/v1/messages` → native, everything else → generic passthrough.
pub fn config_routes(cfg: &mut web::ServiceConfig) {
    cfg.default_service(web::to(dispatch));
}

/// Bind the proxy on `0.0.0.0:<port>`. Graceful shutdown (via the returned
/// server's handle) drains in-flight connections for up to five seconds.
pub fn bind(state: AppState, port: u16) -> io::Result<actix_web::dev::Server> {
    let data = web::Data::new(state);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .configure(config_routes)
    })
    .bind(("0.0.0.0", port))?
    .disable_signals()
    .shutdown_timeout(5)
    .run();
    Ok(server)
}

async fn dispatch(
    state: web::Data<AppState>,
    req: HttpRequest,
    payload: web::Payload,
) -> HttpResponse {
    if req.method() == Method::POST && req.path().starts_with("/v1/chat/completions") {
        chat_completions(&state, &req, payload).await
    } else if req.method() == Method::POST && req.path().starts_with("/v1/messages") {
        messages(&state, &req, payload).await
    } else {
        passthrough(&state, &req, payload).await
    }
}

/// Translated surface: decode the OpenAI request, post the native
/// equivalent upstream, convert the reply back (streaming or not).
async fn chat_completions(
    state: &AppState,
    req: &HttpRequest,
    payload: web::Payload,
) -> HttpResponse {
    let body = match read_body(payload).await {
        Ok(body) => body,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "failed to read request body"),
    };

    let oai_req: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "invalid JSON"),
    };

    let recorder = ExchangeRecorder::new(
        state.ledger.clone(),
        state.pricing.clone(),
        oai_req.model.clone(),
    );
    let native_req = to_messages_request(&oai_req);

    let mut upstream = state
        .http
        .post(format!("{}/v1/messages", state.target))
        .header("content-type", "application/json")
        .header("anthropic-version", ANTHROPIC_VERSION)
        .json(&native_req);
    if let Some(key) = bearer_token(req) {
        upstream = upstream.header("x-api-key", key);
    }

    let resp = match upstream.send().await {
        Ok(resp) => resp,
        Err(err) => {
            let msg = err.to_string();
            recorder.finish_error(msg.clone(), 0);
            return error_response(StatusCode::BAD_GATEWAY, &msg);
        }
    };

    let status = resp.status();
    if status.as_u16() >= 400 {
        // Mirror the upstream error verbatim; the stream never began.
        let bytes = resp.bytes().await.unwrap_or_default();
        recorder.finish_error(format!("upstream {}", status.as_u16()), status.as_u16());
        return HttpResponse::build(mirror_status(status))
            .insert_header(("content-type", "application/json"))
            .body(bytes);
    }

    if oai_req.stream && is_event_stream(resp.headers()) {
        let bytes = Box::pin(resp.bytes_stream().map_err(io_err));
        let stream = TranslatedStream::new(bytes, oai_req.model, recorder, status.as_u16());
        return HttpResponse::Ok()
            .insert_header(("content-type", "text/event-stream"))
            .insert_header(("cache-control", "no-cache"))
            .insert_header(("connection", "keep-alive"))
            .streaming(stream);
    }

    let bytes = match resp.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => {
            recorder.finish_error(err.to_string(), 0);
            return error_response(StatusCode::BAD_GATEWAY, "failed to read upstream response");
        }
    };

    let native: MessagesResponse = match serde_json::from_slice(&bytes) {
        Ok(native) => native,
        Err(err) => {
            // 200 with a body we cannot make sense of: hand it over
            // untouched rather than wrap garbage in an OpenAI envelope.
            debug!(%err, "upstream body is not a messages response; forwarding verbatim");
            return HttpResponse::build(mirror_status(status))
                .insert_header(("content-type", "application/json"))
                .body(bytes);
        }
    };

    recorder.finish(&usage_capture(&native.id, &native.usage), status.as_u16());
    HttpResponse::Ok().json(to_chat_response(&native))
}

#[derive(Debug, Default, Deserialize)]
struct BodyPeek {
    #[serde(default)]
    model: String,
    #[serde(default)]
    stream: bool,
}

#[derive(Debug, Default, Deserialize)]
struct UsageEnvelope {
    #[serde(default)]
    usage: Usage,
}

/// Native surface: forward the body unchanged, then extract usage from the
/// response (streaming or buffered).
async fn messages(state: &AppState, req: &HttpRequest, payload: web::Payload) -> HttpResponse {
    let body = match read_body(payload).await {
        Ok(body) => body,
        Err(_) => return HttpResponse::BadRequest().body("failed to read request body"),
    };

    // Small peek for the model name and the streaming flag; the body itself
    // goes upstream byte-for-byte.
    let peek: BodyPeek = serde_json::from_slice(&body).unwrap_or_default();
    let recorder = ExchangeRecorder::new(state.ledger.clone(), state.pricing.clone(), peek.model);

    let url = upstream_url(&state.target, req.path(), req.query_string());
    let resp = match state
        .http
        .post(&url)
        .headers(forward_request_headers(req.headers()))
        .body(body.to_vec())
        .send()
        .await
    {
        Ok(resp) => resp,
        Err(err) => {
            let msg = err.to_string();
            recorder.finish_error(msg.clone(), 0);
            return HttpResponse::BadGateway().body(format!("upstream error: {msg}"));
        }
    };

    let status = resp.status();
    let mut builder = HttpResponse::build(mirror_status(status));
    copy_response_headers(&mut builder, resp.headers());

    if peek.stream && is_event_stream(resp.headers()) {
        let bytes = Box::pin(resp.bytes_stream().map_err(io_err));
        return builder.streaming(NativeTap::new(bytes, recorder, status.as_u16()));
    }

    let bytes = match resp.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => {
            recorder.finish_error(err.to_string(), 0);
            return HttpResponse::BadGateway().body("failed to read upstream response");
        }
    };

    if let Ok(envelope) = serde_json::from_slice::<UsageEnvelope>(&bytes) {
        recorder.finish(&usage_capture("", &envelope.usage), status.as_u16());
    }
    builder.body(bytes)
}

/// Everything else: same method, path, query, body and headers upstream,
/// response streamed back. No ledger entry.
async fn passthrough(state: &AppState, req: &HttpRequest, payload: web::Payload) -> HttpResponse {
    let body = match read_body(payload).await {
        Ok(body) => body,
        Err(_) => return HttpResponse::BadRequest().body("failed to read request body"),
    };

    let url = upstream_url(&state.target, req.path(), req.query_string());
    let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes())
        .unwrap_or(reqwest::Method::GET);

    let resp = match state
        .http
        .request(method, &url)
        .headers(forward_request_headers(req.headers()))
        .body(body.to_vec())
        .send()
        .await
    {
        Ok(resp) => resp,
        Err(err) => {
            return HttpResponse::BadGateway().body(format!("upstream error: {err}"));
        }
    };

    let mut builder = HttpResponse::build(mirror_status(resp.status()));
    copy_response_headers(&mut builder, resp.headers());
    builder.streaming(resp.bytes_stream().map_err(io_err))
}

async fn read_body(mut payload: web::Payload) -> Result<Bytes, actix_web::error::PayloadError> {
    let mut body = web::BytesMut::new();
    while let Some(chunk) = payload.next().await {
        body.extend_from_slice(&chunk?);
    }
    Ok(body.freeze())
}

/// Client bearer credential with the `Bearer ` prefix stripped exactly once.
fn bearer_token(req: &HttpRequest) -> Option<&str> {
    req.headers()
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn usage_capture(message_id: &str, usage: &Usage) -> UsageCapture {
    UsageCapture {
        message_id: message_id.to_string(),
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cache_read: usage.cache_read_input_tokens,
        cache_write: usage.cache_creation_input_tokens,
    }
}

fn upstream_url(target: &str, path: &str, query: &str) -> String {
    if query.is_empty() {
        format!("{target}{path}")
    } else {
        format!("{target}{path}?{query}")
    }
}

fn is_hop_header(name: &str) -> bool {
    HOP_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h))
}

fn is_event_stream(headers: &reqwest::header::HeaderMap) -> bool {
    headers
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("text/event-stream"))
        .unwrap_or(false)
}

fn mirror_status(status: reqwest::StatusCode) -> StatusCode {
    StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY)
}

fn io_err(err: reqwest::Error) -> io::Error {
    io::Error::other(err.to_string())
}

/// Copy client headers onto the upstream request. Hop-by-hop headers are
/// dropped; Content-Length is re-derived by the client from the body.
fn forward_request_headers(src: &actix_web::http::header::HeaderMap) -> reqwest::header::HeaderMap {
    let mut dst = reqwest::header::HeaderMap::new();
    for (name, value) in src.iter() {
        if is_hop_header(name.as_str()) || name.as_str().eq_ignore_ascii_case("content-length") {
            continue;
        }
        if let (Ok(n), Ok(v)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            dst.append(n, v);
        }
    }
    dst
}

/// Copy upstream headers onto the client response, same filtering rules.
fn copy_response_headers(builder: &mut HttpResponseBuilder, headers: &reqwest::header::HeaderMap) {
    for (name, value) in headers.iter() {
        if is_hop_header(name.as_str()) || name.as_str().eq_ignore_ascii_case("content-length") {
            continue;
        }
        builder.append_header((name.as_str(), value.as_bytes()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn bearer_prefix_stripped_exactly_once() {
        let req = TestRequest::default()
            .insert_header(("Authorization", "Bearer sk-ant-123"))
            .to_http_request();
        assert_eq!(bearer_token(&req), Some("sk-ant-123"));

        let req = TestRequest::default()
            .insert_header(("Authorization", "Bearer Bearer X"))
            .to_http_request();
        assert_eq!(bearer_token(&req), Some("Bearer X"));

        let req = TestRequest::default()
            .insert_header(("Authorization", "Basic abc"))
            .to_http_request();
        assert_eq!(bearer_token(&req), None);

        let req = TestRequest::default().to_http_request();
        assert_eq!(bearer_token(&req), None);
    }

    #[test]
    fn upstream_url_appends_query_only_when_present() {
        assert_eq!(
            upstream_url("https://api.anthropic.com", "/v1/messages", ""),
            "https://api.anthropic.com/v1/messages"
        );
        assert_eq!(
            upstream_url("http://127.0.0.1:9", "/v1/models", "limit=5&after=x"),
            "http://127.0.0.1:9/v1/models?limit=5&after=x"
        );
    }

    #[test]
    fn hop_headers_are_filtered_case_insensitively() {
        for name in ["Connection", "keep-alive", "TRANSFER-ENCODING", "Host", "Te"] {
            assert!(is_hop_header(name), "{name} should be hop-by-hop");
        }
        for name in ["content-type", "x-api-key", "anthropic-version", "accept"] {
            assert!(!is_hop_header(name), "{name} should be forwarded");
        }
    }

    #[test]
    fn forwarded_headers_drop_hop_set() {
        let req = TestRequest::default()
            .insert_header(("connection", "close"))
            .insert_header(("x-api-key", "k"))
            .insert_header(("anthropic-version", "2023-06-01"))
            .to_http_request();
        let headers = forward_request_headers(req.headers());
        assert!(headers.get("connection").is_none());
        assert_eq!(headers.get("x-api-key").unwrap(), "k");
        assert_eq!(headers.get("anthropic-version").unwrap(), "2023-06-01");
    }
}
