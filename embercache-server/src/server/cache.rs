use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use embercache_core::constants::{
    DEFAULT_PROMISE_TTL, DEFAULT_VALUE_TTL, HEADER_DRY_RUN, HEADER_PROMISE_TTL,
    HEADER_RETRY_AFTER, HEADER_SIZE, HEADER_SUPERHOT, HEADER_TTL, MAX_VALUE_SIZE_BYTES,
};
use embercache_core::{CacheError, StoredEntry};
use http_body_util::{BodyExt, Limited};

use super::{response_error, HealthResponse, ServerState};

pub(crate) async fn health(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        node_id: state.node_id.clone(),
    })
}

/// GET /cache/{key}: 200 with the value on a hit, 404 on a miss. An expired
/// entry reads exactly like a miss.
pub(crate) async fn cache_get(
    State(state): State<Arc<ServerState>>,
    Path(key): Path<String>,
) -> Response {
    match state.storage.get(&key) {
        Ok(entry) => entry_response(&entry, true),
        Err(CacheError::KeyNotFound) => StatusCode::NOT_FOUND.into_response(),
        Err(error @ (CacheError::KeyTooShort | CacheError::KeyTooLong)) => {
            response_error(StatusCode::BAD_REQUEST, error.to_string())
        }
        Err(error) => response_error(StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
    }
}

/// POST /cache/{key}: admission decision for an upload.
///
/// 200 the key exists (metadata only, re-read with GET); 202 promise granted;
/// 409 another writer holds the promise; 507 the value can never fit; 400 on
/// header validation failures.
pub(crate) async fn cache_intend(
    State(state): State<Arc<ServerState>>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Response {
    match state.storage.get(&key) {
        Ok(entry) => return entry_response(&entry, false),
        Err(CacheError::KeyNotFound) => {}
        Err(error @ (CacheError::KeyTooShort | CacheError::KeyTooLong)) => {
            return response_error(StatusCode::BAD_REQUEST, error.to_string())
        }
        Err(error) => return response_error(StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
    }

    let size_hint = match headers.get(HEADER_SIZE) {
        None => None,
        Some(raw) => match raw.to_str().ok().and_then(|v| v.parse::<i64>().ok()) {
            Some(size) if size >= 0 => Some(size),
            _ => {
                return response_error(
                    StatusCode::BAD_REQUEST,
                    format!("invalid {HEADER_SIZE} header: must be a non-negative integer"),
                )
            }
        },
    };

    if let Some(size) = size_hint {
        if !state.storage.can_fit(key.len(), size as usize) {
            return response_error(
                StatusCode::INSUFFICIENT_STORAGE,
                "value too large for storage capacity",
            );
        }
    }

    let promise_ttl = match parse_millis_header(&headers, HEADER_PROMISE_TTL) {
        Ok(ttl) => ttl.unwrap_or(DEFAULT_PROMISE_TTL),
        Err(response) => return response,
    };

    let dry_run = headers
        .get(HEADER_DRY_RUN)
        .and_then(|value| value.to_str().ok())
        == Some("true");

    if state.promises.get(&key).is_some() {
        return conflict_response(&state, &key);
    }

    if dry_run {
        return accepted_response(promise_ttl);
    }

    if !state.promises.create(&key, size_hint.unwrap_or(-1), promise_ttl) {
        // Lost the race: another writer claimed the key between the check
        // above and the create.
        return conflict_response(&state, &key);
    }

    accepted_response(promise_ttl)
}

/// PUT /cache/{key}: upload under a previously granted promise.
///
/// 200 stored; 409 no promise or declared size mismatch; 411 missing length;
/// 413 over the hard cap; 507 transient capacity exhaustion; 400 on invalid
/// TTL or a truncated body. Terminal failures release the promise; transient
/// ones leave it so the writer can retry.
pub(crate) async fn cache_upload(
    State(state): State<Arc<ServerState>>,
    Path(key): Path<String>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();

    let Some(declared_len) = content_length(&parts.headers) else {
        return response_error(StatusCode::LENGTH_REQUIRED, "content-length required");
    };

    if declared_len > MAX_VALUE_SIZE_BYTES as u64 {
        return response_error(
            StatusCode::PAYLOAD_TOO_LARGE,
            "payload exceeds maximum allowed size",
        );
    }

    let Some(promise) = state.promises.get(&key) else {
        return response_error(
            StatusCode::CONFLICT,
            "no active promise for this key; call POST first",
        );
    };

    if promise.size >= 0 && declared_len as i64 != promise.size {
        // Terminal: the same PUT can never match. Release the slot for the
        // next writer.
        state.promises.fulfill(&key);
        return response_error(
            StatusCode::CONFLICT,
            "content-length does not match promised size",
        );
    }

    // Hard cap regardless of the declared length; clients can lie.
    let value = match Limited::new(body, MAX_VALUE_SIZE_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(error) => {
            if error.downcast_ref::<http_body_util::LengthLimitError>().is_some() {
                state.promises.fulfill(&key);
                return response_error(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    "payload exceeds maximum allowed size",
                );
            }
            // Transport hiccup; the promise stays so the client can retry.
            return response_error(StatusCode::BAD_REQUEST, "failed to read request body");
        }
    };

    if value.len() as u64 != declared_len {
        // Truncated upload; also retryable under the same promise.
        return response_error(StatusCode::BAD_REQUEST, "incomplete request body");
    }

    let value_ttl = match parse_millis_header(&parts.headers, HEADER_TTL) {
        Ok(ttl) => ttl.unwrap_or(DEFAULT_VALUE_TTL),
        Err(response) => return response,
    };

    match state.storage.put(&key, value, value_ttl) {
        Ok(()) => {
            state.promises.fulfill(&key);
            StatusCode::OK.into_response()
        }
        Err(error) => storage_put_error(&state, &key, error),
    }
}

fn storage_put_error(state: &ServerState, key: &str, error: CacheError) -> Response {
    let (status, terminal) = match error {
        // Transient: other keys expiring or getting evicted may make room.
        CacheError::MemoryLimitExceeded => (StatusCode::INSUFFICIENT_STORAGE, false),
        CacheError::ObjectTooLarge => (StatusCode::PAYLOAD_TOO_LARGE, true),
        CacheError::KeyTooShort | CacheError::KeyTooLong | CacheError::ValueTooShort => {
            (StatusCode::BAD_REQUEST, true)
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, false),
    };

    if terminal {
        state.promises.fulfill(key);
    }
    response_error(status, error.to_string())
}

fn entry_response(entry: &StoredEntry, include_body: bool) -> Response {
    let headers = [
        (HEADER_SIZE, entry.size.to_string()),
        (HEADER_TTL, entry.remaining_ttl.as_millis().to_string()),
        (HEADER_SUPERHOT, "false".to_string()),
    ];

    if include_body {
        (StatusCode::OK, headers, entry.value.clone()).into_response()
    } else {
        (StatusCode::OK, headers).into_response()
    }
}

fn accepted_response(promise_ttl: Duration) -> Response {
    (
        StatusCode::ACCEPTED,
        [(HEADER_PROMISE_TTL, promise_ttl.as_millis().to_string())],
    )
        .into_response()
}

fn conflict_response(state: &ServerState, key: &str) -> Response {
    let remaining = state.promises.remaining_ttl(key);
    (
        StatusCode::CONFLICT,
        [
            (HEADER_PROMISE_TTL, remaining.as_millis().to_string()),
            (HEADER_RETRY_AFTER, (remaining.as_secs() + 1).to_string()),
        ],
    )
        .into_response()
}

/// Positive-milliseconds header used for both value and promise TTLs.
/// Returns `Ok(None)` when absent, a 400 response when malformed.
fn parse_millis_header(
    headers: &HeaderMap,
    name: &'static str,
) -> Result<Option<Duration>, Response> {
    let Some(raw) = headers.get(name) else {
        return Ok(None);
    };

    match raw.to_str().ok().and_then(|v| v.parse::<i64>().ok()) {
        Some(millis) if millis > 0 => Ok(Some(Duration::from_millis(millis as u64))),
        _ => Err(response_error(
            StatusCode::BAD_REQUEST,
            format!("invalid {name} header: must be a positive integer (milliseconds)"),
        )),
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}
