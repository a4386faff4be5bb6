// ============================================================================
// BULK ENDPOINT
// ============================================================================
// Bulk endpoint: several API calls in one request.
// ============================================================================

use std::collections::BTreeMap;

use axum::body::{to_bytes, Body};
use axum::extract::State;
use axum::http::header::{CONTENT_TYPE, LOCATION};
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::Json;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tower::ServiceExt;
use tracing::{debug, error};

use super::{router, ApiResult, AppState, JsonBody};
use crate::REQUESTOR_HEADER;

#[derive(Debug, Deserialize)]
pub struct BulkRequest {
    pub endpoint: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub data: Option<Value>,
}

fn default_method() -> String {
    "GET".into()
}

#[derive(Debug, Serialize)]
pub struct BulkResponse {
    pub status: u16,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    pub data: Value,
}

impl BulkResponse {
    fn failed(status: StatusCode) -> Self {
        Self {
            status: status.as_u16(),
            headers: BTreeMap::new(),
            data: Value::Null,
        }
    }
}

fn param_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Path and query of a sub-request, relative to the API mount point.
fn target(prefix: &str, entry: &BulkRequest) -> Option<String> {
    let mut url = Url::parse("http://bulk.invalid").ok()?;
    url.set_path(&format!("{}/{}", prefix, entry.endpoint.trim_start_matches('/')));
    if !entry.params.is_empty() {
        let mut query = url.query_pairs_mut();
        for (key, value) in &entry.params {
            query.append_pair(key, &param_value(value));
        }
    }

    Some(match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    })
}

/// Run the sub-requests in order against the same router.
pub async fn execute(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(entries): JsonBody<Vec<BulkRequest>>,
) -> ApiResult<Json<Vec<BulkResponse>>> {
    let prefix = state.prefix();
    let app = router(state);
    let mut results = Vec::with_capacity(entries.len());

    for entry in entries {
        let method = match Method::from_bytes(entry.method.to_ascii_uppercase().as_bytes()) {
            Ok(method) => method,
            Err(_) => {
                results.push(BulkResponse::failed(StatusCode::METHOD_NOT_ALLOWED));
                continue;
            }
        };
        let Some(uri) = target(&prefix, &entry) else {
            results.push(BulkResponse::failed(StatusCode::BAD_REQUEST));
            continue;
        };

        let mut builder = Request::builder().method(method.clone()).uri(&uri);
        if let Some(requestor) = headers.get(REQUESTOR_HEADER) {
            builder = builder.header(REQUESTOR_HEADER, requestor);
        }
        let body = if [Method::POST, Method::PUT, Method::PATCH].contains(&method) {
            builder = builder.header(CONTENT_TYPE, "application/json");
            Body::from(entry.data.unwrap_or(Value::Null).to_string())
        } else {
            Body::empty()
        };
        let request = match builder.body(body) {
            Ok(request) => request,
            Err(e) => {
                error!(target: "facette::api", uri = %uri, error = %e, "Unable to build bulk sub-request");
                results.push(BulkResponse::failed(StatusCode::INTERNAL_SERVER_ERROR));
                continue;
            }
        };

        let response = match app.clone().oneshot(request).await {
            Ok(response) => response,
            Err(infallible) => match infallible {},
        };
        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter(|(name, _)| name.as_str().starts_with("x-") || *name == LOCATION)
            .filter_map(|(name, value)| Some((name.to_string(), value.to_str().ok()?.to_string())))
            .collect();
        let data = match to_bytes(response.into_body(), usize::MAX).await {
            Ok(bytes) if !bytes.is_empty() => serde_json::from_slice(&bytes).unwrap_or(Value::Null),
            _ => Value::Null,
        };

        debug!(target: "facette::api", method = %method, uri = %uri, status = status.as_u16(), "Bulk sub-request");
        results.push(BulkResponse {
            status: status.as_u16(),
            headers,
            data,
        });
    }

    Ok(Json(results))
}

#[cfg(test)]
mod tests {
    use super::super::testing::{call, state};
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_target() {
        let entry = BulkRequest {
            endpoint: "/catalog/sources".into(),
            method: "GET".into(),
            params: serde_json::from_value(json!({"filter": "glob:host*", "limit": 10})).unwrap(),
            data: None,
        };
        assert_eq!(
            target("/api/v1", &entry).unwrap(),
            "/api/v1/catalog/sources?filter=glob%3Ahost*&limit=10"
        );
    }

    #[tokio::test]
    async fn test_bulk() {
        let state = state();
        let body = json!([
            {"endpoint": "library/graphs", "method": "POST", "data": {"name": "g1"}},
            {"endpoint": "library/graphs", "params": {"fields": "name"}},
            {"endpoint": "library/graphs/unknown"},
            {"endpoint": "catalog"},
        ]);

        let response = call(&state, Method::POST, "/api/v1/bulk", Some(body)).await;
        assert_eq!(response.status, StatusCode::OK);
        let results = response.body.as_array().unwrap();
        assert_eq!(results[0]["status"], json!(201));
        assert!(results[0]["headers"]["location"].is_string());
        assert_eq!(results[1]["data"], json!([{"name": "g1"}]));
        assert_eq!(results[1]["headers"]["x-total-records"], json!("1"));
        assert_eq!(results[2]["status"], json!(404));
        assert_eq!(results[3]["data"]["metrics"], json!(0));
    }
}
