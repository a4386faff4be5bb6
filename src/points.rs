// ============================================================================
// POINTS ENGINE
// ============================================================================
// Turns a graph definition into plotted series:
//
//   load + expand graph -> expand group series (existing metrics only)
//     -> batch series per provider -> fetch batches concurrently
//     -> put results back per (group, series)
//     -> scale, normalize, apply operator, group scale, summarize
//
// Upstream failures never fail the request: the affected series come back
// empty and the error is logged.
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::catalog::{Catalog, Searcher};
use crate::config::MAX_SAMPLE;
use crate::connector::{Attributes, Connector, PointsQuery, QuerySeries};
use crate::error::{FacetteError, FacetteResult, TimeRangeError};
use crate::expand::{expand_graph, expand_series};
use crate::series::{normalize, Series};
use crate::storage::{Graph, SeriesGroup, Store};
use crate::timerange;

/// Message returned when no series could be resolved.
pub const NO_DATA: &str = "No data";

// ----------------------------------------------------------------------------
// Request & Response
// ----------------------------------------------------------------------------

/// Points request. Either `id` (identifier or alias of a stored graph) or an
/// inline `graph` is required.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PointsRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<Graph>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Attributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sample: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointsResponse {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub series: Vec<Series>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub options: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Compute the `[start, end]` window of a request.
///
/// Explicit bounds must come in pairs and exclude `range`. Otherwise `range`
/// (or the graph range, or `default_range`) is applied to `time` (default
/// `now`): a negative range ends at `time`, a positive one starts there.
pub fn resolve_window(
    request: &PointsRequest,
    graph_range: Option<&str>,
    default_range: &str,
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), TimeRangeError> {
    let invalid = |input: &str| TimeRangeError::InvalidRange {
        input: input.to_string(),
    };
    let range = request.range.as_deref().filter(|r| !r.is_empty());

    let (start, end) = match (request.start_time, request.end_time) {
        (None, None) => {
            let time = request.time.unwrap_or(now);
            let range = range.or(graph_range).unwrap_or(default_range);
            let shifted = timerange::apply(time, range)?;
            if range.trim_start().starts_with('-') {
                (shifted, time)
            } else {
                (time, shifted)
            }
        }
        (Some(start), Some(end)) if range.is_none() => (start, end),
        _ => return Err(invalid(range.unwrap_or("start_time/end_time"))),
    };

    if end <= start {
        return Err(invalid(range.unwrap_or("start_time/end_time")));
    }
    Ok((start, end))
}

// ----------------------------------------------------------------------------
// Dispatch
// ----------------------------------------------------------------------------

/// Series sent to one provider, with the `(group, series)` slot of each.
struct Batch {
    connector: Arc<dyn Connector>,
    provider: String,
    series: Vec<QuerySeries>,
    slots: Vec<(usize, usize)>,
}

fn option_f64(options: &Map<String, Value>, key: &str) -> Option<f64> {
    options.get(key).and_then(Value::as_f64)
}

fn option_bool(options: &Map<String, Value>, key: &str) -> Option<bool> {
    options.get(key).and_then(Value::as_bool)
}

fn percentiles(options: &Map<String, Value>) -> Vec<f64> {
    options
        .get("percentiles")
        .and_then(Value::as_array)
        .map(|values| values.iter().filter_map(Value::as_f64).collect())
        .unwrap_or_default()
}

// ----------------------------------------------------------------------------
// Engine
// ----------------------------------------------------------------------------

pub struct PointsEngine {
    store: Arc<Store>,
    catalog: Arc<Catalog>,
    default_range: String,
    default_sample: usize,
}

impl PointsEngine {
    pub fn new(
        store: Arc<Store>,
        catalog: Arc<Catalog>,
        default_range: impl Into<String>,
        default_sample: usize,
    ) -> Self {
        Self {
            store,
            catalog,
            default_range: default_range.into(),
            default_sample,
        }
    }

    /// Execute `request`. `force_normalize` normalizes operator-less groups too.
    pub async fn execute(&self, request: PointsRequest, force_normalize: bool) -> FacetteResult<PointsResponse> {
        let graph = match (&request.id, &request.graph) {
            (Some(id), _) if !id.is_empty() => self.store.resolve::<Graph>(id)?,
            (_, Some(graph)) => graph.clone(),
            _ => return Err(FacetteError::invalid_parameter("either id or graph is required")),
        };
        let mut graph = expand_graph(&self.store, graph, Some(&request.attributes))?;

        let graph_range = graph.options.get("range").and_then(Value::as_str).map(str::to_string);
        let (start, end) = resolve_window(&request, graph_range.as_deref(), &self.default_range, Utc::now())?;
        let mut sample = if request.sample == 0 {
            self.default_sample
        } else {
            request.sample
        };
        if sample > MAX_SAMPLE {
            return Err(FacetteError::invalid_parameter(format!(
                "sample must be between 1 and {}",
                MAX_SAMPLE
            )));
        }

        // One snapshot for the whole request
        let searcher = Searcher::new(&self.catalog);
        for group in graph.groups.iter_mut() {
            group.series = group
                .series
                .iter()
                .flat_map(|s| expand_series(&self.store, &searcher, s, true))
                .collect();
        }

        let (mut data, resolved) = self.fetch(&graph.groups, &searcher, start, end, sample).await;

        let longest = data.iter().flatten().map(|s| s.points.len()).max().unwrap_or(0);
        if longest > 0 && sample > longest {
            sample = longest;
        }

        let percentiles = percentiles(&graph.options);
        let mut series = Vec::new();

        for (index, group) in graph.groups.iter().enumerate() {
            let group_data = std::mem::take(&mut data[index]);
            series.extend(self.process_group(
                group,
                group_data,
                &resolved[index],
                (start, end, sample),
                force_normalize,
                &percentiles,
            ));
        }

        let mut options = graph.options.clone();
        options
            .entry("title")
            .or_insert_with(|| Value::String(graph.item.name.clone()));

        let message = series.is_empty().then(|| NO_DATA.to_string());
        Ok(PointsResponse {
            start,
            end,
            series,
            options,
            message,
        })
    }

    /// Fetch every resolvable series. Returns the data indexed by group and
    /// series, and whether each series exists in the catalog.
    async fn fetch(
        &self,
        groups: &[SeriesGroup],
        searcher: &Searcher,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        sample: usize,
    ) -> (Vec<Vec<Series>>, Vec<Vec<bool>>) {
        let mut data: Vec<Vec<Series>> = groups
            .iter()
            .map(|g| g.series.iter().map(|s| Series::new(s.name.clone(), Vec::new())).collect())
            .collect();
        let mut resolved: Vec<Vec<bool>> = groups.iter().map(|g| vec![false; g.series.len()]).collect();

        let mut batches: BTreeMap<String, Batch> = BTreeMap::new();
        for (i, group) in groups.iter().enumerate() {
            for (j, entry) in group.series.iter().enumerate() {
                if !entry.is_valid() {
                    warn!(target: "facette::points", series = %entry, "Invalid series");
                    continue;
                }
                let Some(metric) = searcher.index().metric(&entry.origin, &entry.source, &entry.metric) else {
                    warn!(target: "facette::points", series = %entry, "Unable to find series metric");
                    continue;
                };
                resolved[i][j] = true;

                let batch = batches
                    .entry(metric.provider.id.clone())
                    .or_insert_with(|| Batch {
                        connector: metric.connector().clone(),
                        provider: metric.provider.name.clone(),
                        series: Vec::new(),
                        slots: Vec::new(),
                    });
                batch.series.push(QuerySeries {
                    name: entry.name.clone(),
                    origin: metric.original_origin.clone(),
                    source: metric.original_source.clone(),
                    metric: metric.original_name.clone(),
                    attributes: metric.attributes.clone(),
                });
                batch.slots.push((i, j));
            }
        }

        let results = join_all(batches.into_values().map(|batch| async move {
            let query = PointsQuery {
                start,
                end,
                sample,
                series: batch.series.clone(),
            };
            let result = batch.connector.points(&query).await;
            (batch, result)
        }))
        .await;

        for (batch, result) in results {
            let points = match result {
                Ok(points) => points,
                Err(e) => {
                    warn!(target: "facette::points", provider = %batch.provider, error = %e, "Unable to fetch points");
                    continue;
                }
            };
            if points.len() != batch.slots.len() {
                warn!(
                    target: "facette::points",
                    provider = %batch.provider,
                    expected = batch.slots.len(),
                    received = points.len(),
                    "Unexpected series count in points response"
                );
                continue;
            }

            for ((i, j), series) in batch.slots.into_iter().zip(points) {
                data[i][j].points = series.points;
            }
        }

        (data, resolved)
    }

    fn process_group(
        &self,
        group: &SeriesGroup,
        data: Vec<Series>,
        resolved: &[bool],
        (start, end, sample): (DateTime<Utc>, DateTime<Utc>, usize),
        force_normalize: bool,
        percentiles: &[f64],
    ) -> Vec<Series> {
        // Series unknown to the catalog are dropped, failed fetches stay empty
        let mut series: Vec<Series> = data
            .into_iter()
            .zip(group.series.iter())
            .zip(resolved)
            .filter(|(_, resolved)| **resolved)
            .map(|((mut s, entry), _)| {
                s.name = entry.name.clone();
                s.options = entry.options.clone();
                if let Some(scale) = option_f64(&entry.options, "scale") {
                    s.scale(scale);
                }
                s
            })
            .collect();
        if series.is_empty() {
            return series;
        }

        if !group.operator.is_none() || force_normalize {
            if option_bool(&group.options, "zero_nulls").unwrap_or(false) {
                series.iter_mut().for_each(Series::zero_nulls);
            }

            let interpolate = option_bool(&group.options, "interpolate").unwrap_or(true);
            match normalize(&series, start, end, sample, group.consolidate, interpolate) {
                Ok(normalized) => series = normalized,
                Err(e) => {
                    warn!(target: "facette::points", group = %group.name, error = %e, "Unable to normalize series");
                    return Vec::new();
                }
            }

            match group.operator.apply(&series) {
                Ok(Some(mut combined)) => {
                    combined.name = group.name.clone();
                    combined.options = group.options.clone();
                    series = vec![combined];
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(target: "facette::points", group = %group.name, error = %e, "Unable to apply group operator");
                    return Vec::new();
                }
            }
        }

        let scale = option_f64(&group.options, "scale").filter(|s| *s != 0.0);
        for s in series.iter_mut() {
            if let Some(scale) = scale {
                s.scale(scale);
            }
            s.summarize(percentiles);
        }

        debug!(target: "facette::points", group = %group.name, series = series.len(), "Processed group");
        series
    }
}
