//! Minimal HTTP binding for the hub RPC surface.
//!
//! `POST /modeloman.v1.ModeloManHub/<Method>` with a JSON object body.
//! This file is the entire transport: everything else (auth, limits,
//! idempotency, dispatch) happens inside [`HubRpc::handle`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode as HttpStatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{Map, Value, json};

use crate::rpc::RequestMetadata;
use crate::rpc::interceptors::{HubRpc, StatusCode};

pub fn router(rpc: Arc<HubRpc>) -> Router {
    Router::new()
        .route("/{service}/{method}", post(handle_rpc))
        .with_state(rpc)
}

async fn handle_rpc(
    State(rpc): State<Arc<HubRpc>>,
    Path((service, method)): Path<(String, String)>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Response {
    let full_method = format!("/{service}/{method}");
    let metadata = request_metadata(&headers, addr);
    let payload = match body {
        Some(Json(value)) => value,
        None => Value::Object(Map::new()),
    };

    match rpc.handle(&full_method, &metadata, payload).await {
        Ok(value) => (HttpStatusCode::OK, Json(value)).into_response(),
        Err(status) => (
            http_code(status.code),
            Json(json!({
                "code": status.code.as_str(),
                "message": status.message,
            })),
        )
            .into_response(),
    }
}

fn request_metadata(headers: &HeaderMap, addr: SocketAddr) -> RequestMetadata {
    let mut map = HashMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            map.insert(name.as_str().to_string(), value.to_string());
        }
    }
    RequestMetadata::new(map, addr.ip().to_string())
}

fn http_code(code: StatusCode) -> HttpStatusCode {
    match code {
        StatusCode::Ok => HttpStatusCode::OK,
        StatusCode::InvalidArgument => HttpStatusCode::BAD_REQUEST,
        StatusCode::NotFound => HttpStatusCode::NOT_FOUND,
        StatusCode::AlreadyExists => HttpStatusCode::CONFLICT,
        StatusCode::Unauthenticated => HttpStatusCode::UNAUTHORIZED,
        StatusCode::PermissionDenied => HttpStatusCode::FORBIDDEN,
        StatusCode::FailedPrecondition => HttpStatusCode::PRECONDITION_FAILED,
        StatusCode::ResourceExhausted => HttpStatusCode::TOO_MANY_REQUESTS,
        StatusCode::Internal => HttpStatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_code_mapping() {
        assert_eq!(http_code(StatusCode::Ok), HttpStatusCode::OK);
        assert_eq!(http_code(StatusCode::AlreadyExists), HttpStatusCode::CONFLICT);
        assert_eq!(
            http_code(StatusCode::ResourceExhausted),
            HttpStatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            http_code(StatusCode::Unauthenticated),
            HttpStatusCode::UNAUTHORIZED
        );
    }
}
