use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::Uri;
use axum::response::Response;
use axum::routing::{get, post};
use bytes::Bytes;
use futures_util::StreamExt;
use http::{HeaderMap, HeaderValue, StatusCode};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use ctxgate_common::PassthroughError;
use ctxgate_compact::{CapturedAuth, conversation_fingerprint};
use ctxgate_cost::CostDirection;
use ctxgate_protocol::usage::UsageDelta;
use ctxgate_protocol::{Envelope, ErrorKind, FrameDecoder, UsageMeter, WireShape};
use ctxgate_provider::auth::{AuthHandler, DetectedAuth};
use ctxgate_provider::{ProviderAdapter, adapter_for};

use crate::classify::classify_inference;
use crate::state::GatewayState;
use crate::telemetry::Event;
use crate::upstream::forward_headers;

const GATEWAY_REQUEST_ID_HEADER: &str = "x-gateway-request-id";
const AUTH_HEADER_NAMES: &[&str] = &["authorization", "x-api-key", "x-goog-api-key"];

pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/v1/messages", post(inference))
        .route("/v1/chat/completions", post(inference))
        .route("/v1beta/models/{*rest}", post(inference))
        .route("/health", get(health))
        .route("/api/status", get(api_status))
        .with_state(state)
}

async fn health() -> Response {
    json_response(StatusCode::OK, serde_json::json!({ "ok": true }))
}

async fn api_status(State(state): State<Arc<GatewayState>>) -> Response {
    let snapshot = state.status.snapshot();
    json_response(
        StatusCode::OK,
        serde_json::to_value(snapshot).unwrap_or_default(),
    )
}

async fn inference(
    State(state): State<Arc<GatewayState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(route) = classify_inference(uri.path(), uri.query()) else {
        return plain_error(StatusCode::NOT_FOUND, "unknown route");
    };
    let provider = route.provider;
    let caps = provider.caps();
    let adapter = adapter_for(provider);
    let trace_id = Uuid::new_v4().to_string();
    let started = Instant::now();

    // Step 1: parse the minimum out of the envelope; the raw body rides
    // along for bit-exact passthrough.
    let mut envelope = match Envelope::parse(caps.shape, body.clone()) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(event = "request.parse_failed", trace_id = %trace_id, error = %err);
            return adapter_error(
                adapter,
                StatusCode::BAD_REQUEST,
                ErrorKind::InvalidRequest,
                &format!("invalid request body: {err}"),
            );
        }
    };
    if let Some(model) = route.path_model.as_deref() {
        envelope.set_model_hint(model);
    }
    let is_stream = envelope.stream() || route.path_stream;
    let model = envelope.model().unwrap_or("unknown").to_string();
    info!(
        event = "request.received",
        trace_id = %trace_id,
        provider = %provider,
        model = %model,
        is_stream,
        messages = envelope.messages().len(),
    );

    // Step 2: capture inbound auth before any rewrite can touch it.
    let Some(auth_handler) = state.auth.get(provider) else {
        return adapter_error(
            adapter,
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Internal,
            "no auth handler registered",
        );
    };
    let detected = auth_handler.detect_auth(&headers);
    auth_handler.capture_inbound(&headers);
    let endpoint = state.endpoint_for(provider);
    let captured = capture_auth(&headers, &endpoint);
    if let Some(captured) = captured.clone() {
        state.captured_auth.store(Some(Arc::new(captured)));
    }

    // Step 3: admission against the cost caps, before any upstream call.
    if let ctxgate_cost::Admission::Denied { cap } = state.cost.admit() {
        warn!(event = "request.admission_denied", trace_id = %trace_id, cap = %cap);
        return adapter_error(
            adapter,
            StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::RateLimited,
            &format!("gateway {cap} cost cap exceeded"),
        );
    }

    // Step 4: preemptive splice before the pipes read the messages array.
    let fingerprint =
        conversation_fingerprint(&envelope, state.config.compaction.fingerprint_messages);
    let global_auth = state
        .captured_auth
        .load_full()
        .map(|auth| auth.as_ref().clone());
    let compaction = state
        .compactor
        .process(&mut envelope, captured, global_auth);
    if let Some(spliced) = compaction.spliced {
        state.savings.add_compaction(spliced.saved_bytes);
    }
    if compaction.scheduled || compaction.spliced.is_some() {
        state.events.emit(Event::HistoryCompaction {
            fingerprint: fingerprint.clone(),
            usage_pct: compaction.usage_pct,
            scheduled: compaction.scheduled,
            spliced_messages: compaction
                .spliced
                .map(|s| s.dropped_messages)
                .unwrap_or(0),
            saved_bytes: compaction.spliced.map(|s| s.saved_bytes).unwrap_or(0),
        });
    }

    // Step 5: tool-discovery pipe.
    let discovery = state.tool_discovery.apply(&mut envelope, &fingerprint).await;
    if discovery.kept_tools < discovery.original_tools {
        state.savings.add_tool_discovery(discovery.saved_bytes);
        state.events.emit(Event::ToolDiscoveryFiltered {
            trace_id: trace_id.clone(),
            original_tools: discovery.original_tools,
            kept_tools: discovery.kept_tools,
            saved_bytes: discovery.saved_bytes,
        });
    }

    // Tool outputs are compressed on the inbound path; outbound responses
    // only get metered.
    let output = state.tool_output.apply(&mut envelope).await;
    if output.candidates > 0 {
        state.savings.add_tool_output(output.saved_bytes);
        state.events.emit(Event::ToolOutputCompressed {
            trace_id: trace_id.clone(),
            candidates: output.candidates,
            compressed: output.compressed,
            saved_bytes: output.saved_bytes,
        });
    }

    // Step 6: auth injection. An unconfigured handler leaves the inbound
    // credentials in place and the gateway stays transparent.
    let base_headers = forward_headers(&headers);
    let primary_auth = match auth_handler.outbound_headers().await {
        Some(headers) => headers,
        None => {
            let inbound = inbound_auth_headers(&headers);
            if inbound.is_empty() {
                return adapter_error(
                    adapter,
                    StatusCode::UNAUTHORIZED,
                    ErrorKind::AuthFailed,
                    "no usable credentials for upstream",
                );
            }
            inbound
        }
    };

    let outgoing_body = adapter.format_request(&envelope);
    let url = build_url(&endpoint, uri.path(), uri.query());
    let est_input_tokens = outgoing_body.len() as u64 / 4;

    // Steps 7-8: dispatch, classify, one-shot fallback replay.
    let (response, fallback_used) = match dispatch_with_fallback(
        &state,
        auth_handler.as_ref(),
        detected,
        &url,
        &base_headers,
        primary_auth,
        outgoing_body,
        &trace_id,
    )
    .await
    {
        Ok(result) => result,
        Err(response) => return response,
    };

    // Steps 9-10: metering, then hand the bytes back to the client.
    let status = response.status();
    if is_stream && status.is_success() {
        stream_response(
            state,
            caps.shape,
            provider.name().to_string(),
            model,
            trace_id,
            status,
            response,
            est_input_tokens,
            fallback_used,
            started,
        )
    } else {
        buffered_response(
            state,
            caps.shape,
            provider.name().to_string(),
            model,
            trace_id,
            status,
            response,
            est_input_tokens,
            fallback_used,
            started,
        )
        .await
    }
}

/// Primary attempt plus at most one API-key replay when the provider's
/// fallback set matches. Errors come back as ready-made client responses.
#[allow(clippy::too_many_arguments)]
async fn dispatch_with_fallback(
    state: &Arc<GatewayState>,
    auth_handler: &dyn AuthHandler,
    detected: DetectedAuth,
    url: &str,
    base_headers: &HeaderMap,
    primary_auth: HeaderMap,
    body: Bytes,
    trace_id: &str,
) -> Result<(wreq::Response, bool), Response> {
    let mut first_headers = base_headers.clone();
    first_headers.extend(primary_auth);
    let first = state
        .upstream
        .post(url, first_headers, body.clone())
        .await
        .map_err(upstream_error_response)?;

    let status = first.status();
    if status.is_success() {
        return Ok((first, false));
    }

    let error_headers = first.headers().clone();
    let error_body = first.bytes().await.unwrap_or_default();
    let error_text = String::from_utf8_lossy(&error_body).to_string();

    // A request that already arrived with an API key is not eligible.
    let eligible = detected != DetectedAuth::ApiKey;
    if eligible && auth_handler.should_fallback(status, &error_text) {
        if let Some(fallback_auth) = auth_handler.fallback_headers() {
            info!(
                event = "request.fallback_attempt",
                trace_id = %trace_id,
                status = %status.as_u16(),
            );
            let mut retry_headers = base_headers.clone();
            retry_headers.extend(fallback_auth);
            let second = state
                .upstream
                .post(url, retry_headers, body)
                .await
                .map_err(upstream_error_response)?;
            let second_status = second.status();
            auth_handler.note_fallback_result(second_status.is_success());
            if second_status.is_success() {
                return Ok((second, true));
            }
            // Second failure is surfaced verbatim.
            let headers = second.headers().clone();
            let body = second.bytes().await.unwrap_or_default();
            return Err(passthrough_response(second_status, headers, body));
        }
    }

    Err(passthrough_response(status, error_headers, error_body))
}

/// Streaming passthrough: frames go to the client verbatim while a bounded
/// side-channel feeds the usage sniffer. Backpressure drops metering
/// chunks, never client bytes.
#[allow(clippy::too_many_arguments)]
fn stream_response(
    state: Arc<GatewayState>,
    shape: WireShape,
    provider: String,
    model: String,
    trace_id: String,
    status: StatusCode,
    response: wreq::Response,
    est_input_tokens: u64,
    fallback_used: bool,
    started: Instant,
) -> Response {
    let (meter_tx, mut meter_rx) = mpsc::channel::<Bytes>(64);
    {
        let state = state.clone();
        let trace_id = trace_id.clone();
        tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            let mut meter = UsageMeter::new(shape);
            let mut output_bytes = 0u64;
            while let Some(chunk) = meter_rx.recv().await {
                output_bytes += chunk.len() as u64;
                for payload in decoder.push(&chunk) {
                    if let Ok(value) = serde_json::from_str::<Value>(&payload) {
                        meter.observe(&value);
                    }
                }
            }
            for payload in decoder.finish() {
                if let Ok(value) = serde_json::from_str::<Value>(&payload) {
                    meter.observe(&value);
                }
            }
            record_usage(
                &state,
                &provider,
                &model,
                meter.finalize(),
                est_input_tokens,
                output_bytes / 4,
                &trace_id,
                status,
                true,
                fallback_used,
                started,
            );
        });
    }

    let upstream_headers = response.headers().clone();
    let forwarded = response.bytes_stream().map(move |item| match item {
        Ok(chunk) => {
            // Metering is best-effort; a full channel drops the copy.
            let _ = meter_tx.try_send(chunk.clone());
            Ok(chunk)
        }
        Err(err) => Err(std::io::Error::other(err.to_string())),
    });

    let mut resp = Response::new(Body::from_stream(forwarded));
    *resp.status_mut() = status;
    extend_response_headers(resp.headers_mut(), &upstream_headers);
    set_request_id(resp.headers_mut(), &trace_id);
    resp
}

#[allow(clippy::too_many_arguments)]
async fn buffered_response(
    state: Arc<GatewayState>,
    shape: WireShape,
    provider: String,
    model: String,
    trace_id: String,
    status: StatusCode,
    response: wreq::Response,
    est_input_tokens: u64,
    fallback_used: bool,
    started: Instant,
) -> Response {
    let upstream_headers = response.headers().clone();
    let body = match response.bytes().await {
        Ok(body) => body,
        Err(err) => return upstream_error_response(PassthroughError::bad_gateway(err.to_string())),
    };

    let usage = serde_json::from_slice::<Value>(&body)
        .ok()
        .and_then(|value| ctxgate_protocol::usage::extract_usage(shape, &value));
    record_usage(
        &state,
        &provider,
        &model,
        usage,
        est_input_tokens,
        body.len() as u64 / 4,
        &trace_id,
        status,
        false,
        fallback_used,
        started,
    );

    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;
    extend_response_headers(resp.headers_mut(), &upstream_headers);
    set_request_id(resp.headers_mut(), &trace_id);
    resp
}

/// Counters update exactly once per request, after the terminal frame.
/// Absent usage falls back to a byte-ratio estimate flagged in the ledger.
#[allow(clippy::too_many_arguments)]
fn record_usage(
    state: &Arc<GatewayState>,
    provider: &str,
    model: &str,
    usage: Option<UsageDelta>,
    est_input_tokens: u64,
    est_output_tokens: u64,
    trace_id: &str,
    status: StatusCode,
    is_stream: bool,
    fallback_used: bool,
    started: Instant,
) {
    let (input, output, cache_read, cache_write, estimated) = match usage {
        Some(usage) => (
            usage.input_tokens.unwrap_or(0),
            usage.output_tokens.unwrap_or(0),
            usage.cache_read_tokens.unwrap_or(0),
            usage.cache_write_tokens.unwrap_or(0),
            false,
        ),
        None => (est_input_tokens, est_output_tokens, 0, 0, true),
    };
    let entry = state.cost.record(
        provider,
        model,
        input,
        output,
        cache_read,
        cache_write,
        CostDirection::Inference,
        estimated,
    );
    info!(
        event = "request.completed",
        trace_id = %trace_id,
        provider = %provider,
        model = %model,
        status = %status.as_u16(),
        is_stream,
        fallback_used,
        estimated,
        cost_usd = entry.cost_usd,
        elapsed_ms = started.elapsed().as_millis(),
    );
    state.events.emit(Event::RequestCompleted {
        trace_id: trace_id.to_string(),
        provider: provider.to_string(),
        model: model.to_string(),
        status: status.as_u16(),
        is_stream,
        elapsed_ms: started.elapsed().as_millis() as u64,
        cost_usd: entry.cost_usd,
        fallback_used,
    });
}

fn capture_auth(headers: &HeaderMap, endpoint: &str) -> Option<CapturedAuth> {
    let mut captured = Vec::new();
    for name in AUTH_HEADER_NAMES {
        if let Some(value) = headers.get(*name).and_then(|v| v.to_str().ok()) {
            captured.push((name.to_string(), value.to_string()));
        }
    }
    if captured.is_empty() {
        return None;
    }
    Some(CapturedAuth {
        endpoint: Some(endpoint.to_string()),
        headers: captured,
    })
}

fn inbound_auth_headers(headers: &HeaderMap) -> HeaderMap {
    let mut auth = HeaderMap::new();
    for name in AUTH_HEADER_NAMES {
        if let Some(value) = headers.get(*name)
            && let Ok(header_name) = http::header::HeaderName::from_bytes(name.as_bytes())
        {
            auth.insert(header_name, value.clone());
        }
    }
    auth
}

fn build_url(endpoint: &str, path: &str, query: Option<&str>) -> String {
    let endpoint = endpoint.trim_end_matches('/');
    match query {
        Some(query) if !query.is_empty() => format!("{endpoint}{path}?{query}"),
        _ => format!("{endpoint}{path}"),
    }
}

fn extend_response_headers(target: &mut HeaderMap, upstream: &HeaderMap) {
    for (name, value) in upstream.iter() {
        if matches!(name.as_str(), "content-length" | "transfer-encoding" | "connection") {
            continue;
        }
        target.append(name.clone(), value.clone());
    }
}

fn set_request_id(headers: &mut HeaderMap, trace_id: &str) {
    if let Ok(value) = HeaderValue::from_str(trace_id) {
        headers.insert(GATEWAY_REQUEST_ID_HEADER, value);
    }
}

fn adapter_error(
    adapter: &dyn ProviderAdapter,
    status: StatusCode,
    kind: ErrorKind,
    message: &str,
) -> Response {
    let body = adapter.build_error(kind, message);
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    resp
}

fn upstream_error_response(err: PassthroughError) -> Response {
    let mut resp = Response::new(Body::from(err.body));
    *resp.status_mut() = err.status;
    resp.headers_mut().extend(err.headers);
    resp
}

fn passthrough_response(status: StatusCode, headers: HeaderMap, body: Bytes) -> Response {
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;
    extend_response_headers(resp.headers_mut(), &headers);
    resp
}

fn plain_error(status: StatusCode, message: &str) -> Response {
    let mut resp = Response::new(Body::from(message.to_string()));
    *resp.status_mut() = status;
    resp
}

fn json_response(status: StatusCode, value: Value) -> Response {
    let body = serde_json::to_vec(&value).unwrap_or_default();
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    resp
}
