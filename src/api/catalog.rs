// ============================================================================
// CATALOG ENDPOINTS
// ============================================================================
// Catalog browsing endpoints.
// ============================================================================

use std::collections::{BTreeMap, BTreeSet};

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{json, Value};

use super::{ApiError, ApiResult, AppState, Params};
use crate::catalog::Searcher;
use crate::error::ErrorKind;
use crate::pattern;
use crate::TOTAL_RECORDS_HEADER;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/catalog", get(summary))
        .route("/catalog/{kind}", get(list))
        .route("/catalog/{kind}/{*name}", get(details))
}

/// Entry counts, or the whole `{origin: {source: [metric]}}` tree with `tree=1`.
async fn summary(State(state): State<AppState>, params: Params) -> Json<Value> {
    let index = state.catalog.snapshot();

    if params.flag("tree") {
        let tree: BTreeMap<&str, BTreeMap<&str, Vec<&str>>> = index
            .origins()
            .map(|origin| {
                let sources = origin
                    .sources
                    .values()
                    .map(|source| {
                        let metrics = source.metrics.keys().map(String::as_str).collect();
                        (source.name.as_str(), metrics)
                    })
                    .collect();
                (origin.name.as_str(), sources)
            })
            .collect();
        return Json(json!(tree));
    }

    Json(json!({
        "origins": index.origin_count(),
        "sources": index.source_count(),
        "metrics": index.metric_count(),
    }))
}

/// Sorted unique names of one entry type.
async fn list(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    params: Params,
) -> ApiResult<impl IntoResponse> {
    let filter = params.get("filter").unwrap_or_default();
    if pattern::validate(filter).is_err() {
        return Err(ApiError::new(ErrorKind::InvalidFilter));
    }
    let origin = params.get("origin").unwrap_or_default();
    let source = params.get("source").unwrap_or_default();

    let searcher = Searcher::new(&state.catalog);
    let names: BTreeSet<String> = match kind.as_str() {
        "origins" => searcher
            .origins(filter, None)
            .iter()
            .map(|o| o.name.clone())
            .collect(),
        "sources" => searcher
            .sources(origin, filter, None)
            .iter()
            .map(|s| s.name.clone())
            .collect(),
        "metrics" => searcher
            .metrics(origin, source, filter, None)
            .iter()
            .map(|m| m.name.clone())
            .collect(),
        _ => return Err(ApiError::new(ErrorKind::UnknownEndpoint)),
    };

    let total = names.len();
    let page: Vec<String> = names
        .into_iter()
        .skip(params.usize("offset")?.unwrap_or(0))
        .take(params.usize("limit")?.unwrap_or(usize::MAX))
        .collect();

    Ok(([(TOTAL_RECORDS_HEADER, total.to_string())], Json(page)))
}

#[derive(Debug, Serialize)]
struct Details {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    origins: Option<BTreeSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sources: Option<BTreeSet<String>>,
    providers: BTreeSet<String>,
}

async fn details(
    State(state): State<AppState>,
    Path((kind, name)): Path<(String, String)>,
) -> ApiResult<Json<Details>> {
    let index = state.catalog.snapshot();
    let not_found = || ApiError::new(ErrorKind::NotFound);

    let details = match kind.as_str() {
        "origins" => {
            let origin = index.origin(&name).ok_or_else(not_found)?;
            Details {
                name,
                origins: None,
                sources: None,
                providers: origin.providers.clone(),
            }
        }
        "sources" => {
            let (mut origins, mut providers) = (BTreeSet::new(), BTreeSet::new());
            for origin in index.origins() {
                if let Some(source) = origin.sources.get(&name) {
                    origins.insert(origin.name.clone());
                    providers.extend(source.providers.iter().cloned());
                }
            }
            if origins.is_empty() {
                return Err(not_found());
            }
            Details {
                name,
                origins: Some(origins),
                sources: None,
                providers,
            }
        }
        "metrics" => {
            let (mut origins, mut sources, mut providers) =
                (BTreeSet::new(), BTreeSet::new(), BTreeSet::new());
            for origin in index.origins() {
                for source in origin.sources.values() {
                    if let Some(metric) = source.metrics.get(&name) {
                        origins.insert(origin.name.clone());
                        sources.insert(source.name.clone());
                        providers.extend(metric.providers.iter().cloned());
                    }
                }
            }
            if origins.is_empty() {
                return Err(not_found());
            }
            Details {
                name,
                origins: Some(origins),
                sources: Some(sources),
                providers,
            }
        }
        _ => return Err(ApiError::new(ErrorKind::UnknownEndpoint)),
    };

    Ok(Json(details))
}

#[cfg(test)]
mod tests {
    use super::super::testing::{call, state};
    use super::super::AppState;
    use crate::catalog::Record;
    use crate::connector::testing::MemoryConnector;
    use axum::http::{Method, StatusCode};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn populated() -> AppState {
        let state = state();
        let connector = Arc::new(MemoryConnector::new("primary"));
        state.catalog.replace_provider_set(
            connector.clone().handle("primary", 0),
            vec![
                Record::new("collectd", "host1", "cpu.idle"),
                Record::new("collectd", "host1", "cpu.user"),
                Record::new("collectd", "host2", "cpu.idle"),
                Record::new("graphite", "host2", "load.shortterm"),
            ],
        );
        state
    }

    #[tokio::test]
    async fn test_summary_and_tree() {
        let state = populated();

        let response = call(&state, Method::GET, "/api/v1/catalog", None).await;
        assert_eq!(response.body, json!({"origins": 2, "sources": 3, "metrics": 4}));

        let response = call(&state, Method::GET, "/api/v1/catalog?tree=1", None).await;
        assert_eq!(
            response.body,
            json!({
                "collectd": {"host1": ["cpu.idle", "cpu.user"], "host2": ["cpu.idle"]},
                "graphite": {"host2": ["load.shortterm"]},
            })
        );
    }

    #[tokio::test]
    async fn test_list() {
        let state = populated();

        let response = call(&state, Method::GET, "/api/v1/catalog/sources", None).await;
        assert_eq!(response.body, json!(["host1", "host2"]));
        assert_eq!(response.headers["x-total-records"], "2");

        let response = call(&state, Method::GET, "/api/v1/catalog/metrics?filter=glob:cpu.*&limit=1", None).await;
        assert_eq!(response.body, json!(["cpu.idle"]));
        assert_eq!(response.headers["x-total-records"], "2");

        let response = call(&state, Method::GET, "/api/v1/catalog/metrics?origin=graphite", None).await;
        assert_eq!(response.body, json!(["load.shortterm"]));

        let response = call(&state, Method::GET, "/api/v1/catalog/origins?filter=regexp:(", None).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(response.body["message"], json!("invalid filter"));

        let response = call(&state, Method::GET, "/api/v1/catalog/unknown", None).await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_details() {
        let state = populated();

        let response = call(&state, Method::GET, "/api/v1/catalog/sources/host2", None).await;
        assert_eq!(
            response.body,
            json!({"name": "host2", "origins": ["collectd", "graphite"], "providers": ["primary"]})
        );

        let response = call(&state, Method::GET, "/api/v1/catalog/metrics/cpu.idle", None).await;
        assert_eq!(response.body["sources"], json!(["host1", "host2"]));

        let response = call(&state, Method::GET, "/api/v1/catalog/origins/unknown", None).await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }
}
