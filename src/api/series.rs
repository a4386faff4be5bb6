// ============================================================================
// SERIES ENDPOINTS
// ============================================================================
// Series expansion and points endpoints.
// ============================================================================

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};

use super::{ApiResult, AppState, JsonBody, Params};
use crate::catalog::Searcher;
use crate::expand::expand_series;
use crate::points::{PointsRequest, PointsResponse};
use crate::storage::SeriesEntry;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/series/expand", post(expand))
        .route("/series/points", post(points))
}

/// Expand the source and metric groups of each series; one result list per
/// input series.
async fn expand(
    State(state): State<AppState>,
    JsonBody(series): JsonBody<Vec<SeriesEntry>>,
) -> Json<Vec<Vec<SeriesEntry>>> {
    let searcher = Searcher::new(&state.catalog);
    Json(
        series
            .iter()
            .map(|s| expand_series(&state.store, &searcher, s, false))
            .collect(),
    )
}

async fn points(
    State(state): State<AppState>,
    params: Params,
    JsonBody(request): JsonBody<PointsRequest>,
) -> ApiResult<Json<PointsResponse>> {
    let response = state.points.execute(request, params.flag("normalize")).await?;
    Ok(Json(response))
}
