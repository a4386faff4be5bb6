// ============================================================================
// LIBRARY & PROVIDER ENDPOINTS
// ============================================================================
// CRUD over the stored items. Handlers are generic over the item type; the
// `Resource` trait carries the per-type hooks (template expansion, provider
// worker lifecycle).
// ============================================================================

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::header::LOCATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{ApiError, ApiResult, AppState, JsonBody, Params};
use crate::error::{ErrorKind, StorageError, StorageResult};
use crate::expand::{expand_collection, expand_graph};
use crate::storage::{
    Collection, CollectionTree, Entity, Graph, ItemType, ListQuery, MetricGroup, Provider,
    SourceGroup, Store, ITEM_COLUMNS,
};
use crate::template;
use crate::{CONFIRM_HEADER, TOTAL_RECORDS_HEADER};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/library", get(summary))
        .route("/library/parse", post(parse))
        .route("/library/search", post(search))
        .route("/library/collections/tree", get(tree))
        .route(
            "/library/{kind}",
            get(list_items).post(create_item).delete(delete_items),
        )
        .route(
            "/library/{kind}/{id}",
            get(get_item)
                .put(update_item)
                .patch(patch_item)
                .delete(delete_item),
        )
        .route(
            "/providers",
            get(list_providers).post(create_provider).delete(delete_providers),
        )
        .route(
            "/providers/{id}",
            get(get_provider)
                .put(update_provider)
                .patch(patch_provider)
                .delete(delete_provider),
        )
        .route("/providers/{id}/refresh", post(refresh_provider))
}

// ----------------------------------------------------------------------------
// Per-type hooks
// ----------------------------------------------------------------------------

#[async_trait]
pub trait Resource: Entity {
    /// Fields returned by listings without `fields`.
    fn default_fields() -> &'static [&'static str] {
        &ITEM_COLUMNS
    }

    /// Resolve templates and links, for `expand=1`.
    fn expand(self, _store: &Store) -> StorageResult<Self> {
        Ok(self)
    }

    async fn saved(&self, _state: &AppState, _created: bool) {}

    async fn deleted(&self, _state: &AppState) {}
}

#[async_trait]
impl Resource for Graph {
    fn expand(self, store: &Store) -> StorageResult<Self> {
        expand_graph(store, self, None)
    }
}

#[async_trait]
impl Resource for Collection {
    fn expand(self, store: &Store) -> StorageResult<Self> {
        expand_collection(store, self, None)
    }
}

#[async_trait]
impl Resource for SourceGroup {}

#[async_trait]
impl Resource for MetricGroup {}

#[async_trait]
impl Resource for Provider {
    fn default_fields() -> &'static [&'static str] {
        &["id", "name", "description", "created", "modified", "enabled"]
    }

    async fn saved(&self, state: &AppState, created: bool) {
        let result = if created {
            state.poller.start_worker(self).await
        } else {
            state.poller.stop_worker(self, true).await
        };
        if let Err(e) = result {
            warn!(target: "facette::api", provider = %self.item.name, error = %e, "Unable to start provider worker");
        }
    }

    async fn deleted(&self, state: &AppState) {
        if let Err(e) = state.poller.stop_worker(self, false).await {
            warn!(target: "facette::api", provider = %self.item.name, error = %e, "Unable to stop provider worker");
        }
    }
}

macro_rules! dispatch {
    ($kind:expr, $handler:ident($($arg:expr),*)) => {
        match $kind {
            ItemType::Collections => $handler::<Collection>($($arg),*).await,
            ItemType::Graphs => $handler::<Graph>($($arg),*).await,
            ItemType::SourceGroups => $handler::<SourceGroup>($($arg),*).await,
            ItemType::MetricGroups => $handler::<MetricGroup>($($arg),*).await,
            ItemType::Providers => $handler::<Provider>($($arg),*).await,
        }
    };
}

fn library_kind(value: &str) -> ApiResult<ItemType> {
    value
        .parse::<ItemType>()
        .ok()
        .filter(|kind| ItemType::LIBRARY.contains(kind))
        .ok_or(ApiError::new(ErrorKind::UnknownEndpoint))
}

fn location(state: &AppState, kind: ItemType, id: &str) -> String {
    match kind {
        ItemType::Providers => format!("{}/providers/{}", state.prefix(), id),
        kind => format!("{}/library/{}/{}", state.prefix(), kind, id),
    }
}

fn to_json<T: Serialize>(value: &T) -> ApiResult<Value> {
    Ok(serde_json::to_value(value).map_err(StorageError::from)?)
}

fn from_json<T: Entity>(value: Value) -> ApiResult<T> {
    serde_json::from_value(value).map_err(|e| {
        debug!(target: "facette::api", kind = %T::TYPE, error = %e, "Unable to decode item");
        ApiError::new(ErrorKind::InvalidJson)
    })
}

/// Shallow merge of `patch` onto `base`; both must be objects.
fn merge(base: &mut Value, patch: Value) -> ApiResult<()> {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            base.extend(patch);
            Ok(())
        }
        _ => Err(ApiError::new(ErrorKind::InvalidJson)),
    }
}

fn project(value: Value, fields: &[String]) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(key, _)| fields.iter().any(|f| f == key))
                .collect(),
        ),
        other => other,
    }
}

// ----------------------------------------------------------------------------
// Generic handlers
// ----------------------------------------------------------------------------

async fn list<T: Resource>(state: AppState, params: Params) -> ApiResult<Response> {
    let mut query = ListQuery::new();
    if let Some(filter) = params.get("filter") {
        query = query.filter("name", filter)?;
    }

    if T::TYPE.has_template() {
        match params.get("kind").unwrap_or("all") {
            "all" => {}
            "raw" => query = query.filter("template", "false")?,
            "template" => query = query.filter("template", "true")?,
            _ => return Err(ApiError::new(ErrorKind::InvalidParameter)),
        }
        if let Some(link) = params.get("link") {
            query = query.filter("link", link)?;
        }
    }
    if T::TYPE == ItemType::Collections {
        if let Some(parent) = params.get("parent") {
            query = query.filter("parent", parent)?;
        }
    }

    let sort = params.list("sort");
    let query = query
        .sort(if sort.is_empty() { vec!["name".to_string()] } else { sort })
        .page(params.usize("offset")?.unwrap_or(0), params.usize("limit")?);

    let (items, total) = state.store.list::<T>(&query)?;

    let mut fields = params.list("fields");
    if fields.is_empty() {
        fields = T::default_fields().iter().map(|f| f.to_string()).collect();
    }
    let body = items
        .iter()
        .map(|item| to_json(item).map(|value| project(value, &fields)))
        .collect::<ApiResult<Vec<Value>>>()?;

    Ok(([(TOTAL_RECORDS_HEADER, total.to_string())], Json(body)).into_response())
}

async fn create<T: Resource>(state: AppState, params: Params, body: Value) -> ApiResult<Response> {
    state.check_writable()?;

    let body = match params.get("inherit") {
        Some(source) => {
            let mut base = to_json(&state.store.resolve::<T>(source)?)?;
            if let Value::Object(map) = &mut base {
                for key in ["id", "created", "modified", "alias"] {
                    map.remove(key);
                }
            }
            merge(&mut base, body)?;
            base
        }
        None => body,
    };

    let mut item: T = from_json(body)?;
    {
        let meta = item.item_mut();
        meta.id.clear();
        meta.created = Default::default();
    }

    let item = state.store.save(item)?;
    item.saved(&state, true).await;

    info!(target: "facette::api", kind = %T::TYPE, id = %item.item().id, name = %item.item().name, "Item created");
    let url = location(&state, T::TYPE, &item.item().id);
    Ok((StatusCode::CREATED, [(LOCATION, url)]).into_response())
}

async fn get_one<T: Resource>(state: AppState, id: String, params: Params) -> ApiResult<Response> {
    let mut item = state.store.resolve::<T>(&id)?;
    if params.flag("expand") {
        item = item.expand(&state.store)?;
    }

    let fields = params.list("fields");
    let mut body = to_json(&item)?;
    if !fields.is_empty() {
        body = project(body, &fields);
    }
    Ok(Json(body).into_response())
}

async fn update<T: Resource>(state: AppState, id: String, body: Value) -> ApiResult<Response> {
    state.check_writable()?;
    let existing = state.store.resolve::<T>(&id)?;

    let mut item: T = from_json(body)?;
    item.item_mut().id = existing.item().id.clone();

    let item = state.store.save(item)?;
    item.saved(&state, false).await;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn patch<T: Resource>(state: AppState, id: String, body: Value) -> ApiResult<Response> {
    state.check_writable()?;
    let existing = state.store.resolve::<T>(&id)?;

    let mut merged = to_json(&existing)?;
    merge(&mut merged, body)?;
    let mut item: T = from_json(merged)?;
    item.item_mut().id = existing.item().id.clone();

    let item = state.store.save(item)?;
    item.saved(&state, false).await;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn delete_one<T: Resource>(state: AppState, id: String) -> ApiResult<Response> {
    state.check_writable()?;
    let existing = state.store.resolve::<T>(&id)?;

    let removed = state.store.delete::<T>(&existing.item().id)?;
    removed.deleted(&state).await;

    info!(target: "facette::api", kind = %T::TYPE, id = %removed.item().id, "Item deleted");
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn delete_all<T: Resource>(state: AppState, headers: HeaderMap) -> ApiResult<Response> {
    state.check_writable()?;
    let confirmed = headers
        .get(CONFIRM_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "1")
        .unwrap_or(false);
    if !confirmed {
        return Err(ApiError::new(ErrorKind::Forbidden));
    }

    let items: Vec<T> = state.store.read(|library| T::table(library).values().cloned().collect());
    state.store.delete_all::<T>()?;
    for item in &items {
        item.deleted(&state).await;
    }

    Ok(StatusCode::NO_CONTENT.into_response())
}

// ----------------------------------------------------------------------------
// Library routes
// ----------------------------------------------------------------------------

async fn summary(State(state): State<AppState>) -> Json<BTreeMap<&'static str, usize>> {
    Json(
        ItemType::LIBRARY
            .iter()
            .map(|kind| (kind.as_str(), state.store.count(*kind)))
            .collect(),
    )
}

async fn list_items(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    params: Params,
) -> ApiResult<Response> {
    dispatch!(library_kind(&kind)?, list(state, params))
}

async fn create_item(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    params: Params,
    JsonBody(body): JsonBody<Value>,
) -> ApiResult<Response> {
    dispatch!(library_kind(&kind)?, create(state, params, body))
}

async fn delete_items(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    dispatch!(library_kind(&kind)?, delete_all(state, headers))
}

async fn get_item(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
    params: Params,
) -> ApiResult<Response> {
    dispatch!(library_kind(&kind)?, get_one(state, id, params))
}

async fn update_item(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
    JsonBody(body): JsonBody<Value>,
) -> ApiResult<Response> {
    dispatch!(library_kind(&kind)?, update(state, id, body))
}

async fn patch_item(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
    JsonBody(body): JsonBody<Value>,
) -> ApiResult<Response> {
    dispatch!(library_kind(&kind)?, patch(state, id, body))
}

async fn delete_item(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> ApiResult<Response> {
    dispatch!(library_kind(&kind)?, delete_one(state, id))
}

#[derive(Debug, Deserialize)]
struct ParseRequest {
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(values) => values.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

/// Template placeholders used by a stored item or a raw document.
async fn parse(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<ParseRequest>,
) -> ApiResult<Json<Vec<String>>> {
    let document = match (request.data, request.id) {
        (Some(data), _) => data,
        (None, Some(id)) => {
            let kind = request
                .kind
                .as_deref()
                .map(library_kind)
                .transpose()?
                .ok_or(ApiError::new(ErrorKind::InvalidParameter))?;
            match kind {
                ItemType::Graphs => to_json(&state.store.resolve::<Graph>(&id)?)?,
                ItemType::Collections => to_json(&state.store.resolve::<Collection>(&id)?)?,
                ItemType::SourceGroups => to_json(&state.store.resolve::<SourceGroup>(&id)?)?,
                ItemType::MetricGroups => to_json(&state.store.resolve::<MetricGroup>(&id)?)?,
                ItemType::Providers => to_json(&state.store.resolve::<Provider>(&id)?)?,
            }
        }
        (None, None) => return Err(ApiError::new(ErrorKind::InvalidParameter)),
    };

    let mut strings = Vec::new();
    collect_strings(&document, &mut strings);

    let mut keys = BTreeSet::new();
    for text in strings {
        keys.extend(template::parse(text)?);
    }
    Ok(Json(keys.into_iter().collect()))
}

#[derive(Debug, Default, Deserialize)]
struct SearchRequest {
    #[serde(default)]
    types: Vec<String>,
    #[serde(default)]
    terms: BTreeMap<String, String>,
}

async fn search(
    State(state): State<AppState>,
    params: Params,
    JsonBody(request): JsonBody<SearchRequest>,
) -> ApiResult<Response> {
    let types = if request.types.is_empty() {
        ItemType::LIBRARY.to_vec()
    } else {
        request
            .types
            .iter()
            .map(|t| t.parse::<ItemType>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| ApiError::new(ErrorKind::InvalidParameter))?
    };

    let mut query = ListQuery::new();
    for (field, pattern) in &request.terms {
        query = query.filter(field, pattern)?;
    }
    let sort = params.list("sort");
    let query = query
        .sort(if sort.is_empty() { vec!["name".to_string()] } else { sort })
        .page(params.usize("offset")?.unwrap_or(0), params.usize("limit")?);

    let (items, total) = state.store.search(&types, &query)?;
    Ok(([(TOTAL_RECORDS_HEADER, total.to_string())], Json(items)).into_response())
}

async fn tree(State(state): State<AppState>, params: Params) -> ApiResult<Json<CollectionTree>> {
    Ok(Json(state.store.collection_tree(params.get("parent"))?))
}

// ----------------------------------------------------------------------------
// Provider routes
// ----------------------------------------------------------------------------

async fn list_providers(State(state): State<AppState>, params: Params) -> ApiResult<Response> {
    list::<Provider>(state, params).await
}

async fn create_provider(
    State(state): State<AppState>,
    params: Params,
    JsonBody(body): JsonBody<Value>,
) -> ApiResult<Response> {
    create::<Provider>(state, params, body).await
}

async fn delete_providers(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Response> {
    delete_all::<Provider>(state, headers).await
}

async fn get_provider(
    State(state): State<AppState>,
    Path(id): Path<String>,
    params: Params,
) -> ApiResult<Response> {
    get_one::<Provider>(state, id, params).await
}

async fn update_provider(
    State(state): State<AppState>,
    Path(id): Path<String>,
    JsonBody(body): JsonBody<Value>,
) -> ApiResult<Response> {
    update::<Provider>(state, id, body).await
}

async fn patch_provider(
    State(state): State<AppState>,
    Path(id): Path<String>,
    JsonBody(body): JsonBody<Value>,
) -> ApiResult<Response> {
    patch::<Provider>(state, id, body).await
}

async fn delete_provider(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
    delete_one::<Provider>(state, id).await
}

async fn refresh_provider(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    let provider = state.store.resolve::<Provider>(&id)?;
    if !state.poller.refresh(&provider.item.id) {
        debug!(target: "facette::api", provider = %provider.item.name, "Provider has no running worker");
    }
    Ok(StatusCode::NO_CONTENT)
}
