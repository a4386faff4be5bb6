// ============================================================================
// FACETTE CONNECTOR
// ============================================================================
// Driver federating another gateway instance.
// ============================================================================

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use super::{emit, fetch_json, http_client, Connector, ConnectorContext, PointsQuery, Settings};
use crate::catalog::Record;
use crate::error::{ConnectorError, ConnectorResult};
use crate::series::Series;

type CatalogTree = BTreeMap<String, BTreeMap<String, Vec<String>>>;

#[derive(Debug, Serialize)]
struct RemoteSeries<'a> {
    name: String,
    origin: &'a str,
    source: &'a str,
    metric: &'a str,
}

#[derive(Debug, Serialize)]
struct RemoteGroup<'a> {
    name: &'static str,
    series: Vec<RemoteSeries<'a>>,
}

#[derive(Debug, Serialize)]
struct RemoteGraph<'a> {
    name: &'static str,
    groups: Vec<RemoteGroup<'a>>,
}

#[derive(Debug, Serialize)]
struct RemotePointsRequest<'a> {
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    sample: usize,
    graph: RemoteGraph<'a>,
}

#[derive(Debug, Deserialize)]
struct RemotePointsResponse {
    #[serde(default)]
    series: Vec<Series>,
}

pub struct FacetteConnector {
    name: String,
    url: String,
    requestor: String,
    client: reqwest::Client,
}

impl FacetteConnector {
    pub(crate) fn new(context: &ConnectorContext, settings: &Settings<'_>) -> ConnectorResult<Self> {
        Ok(Self {
            name: context.provider.clone(),
            url: settings.url()?,
            requestor: context.instance_id.clone(),
            client: http_client(context, settings)?,
        })
    }
}

fn tree_records(tree: CatalogTree) -> impl Iterator<Item = Record> {
    tree.into_iter().flat_map(|(origin, sources)| {
        sources.into_iter().flat_map(move |(source, metrics)| {
            let origin = origin.clone();
            metrics
                .into_iter()
                .map(move |metric| Record::new(origin.clone(), source.clone(), metric))
        })
    })
}

fn points_request(query: &PointsQuery) -> ConnectorResult<RemotePointsRequest<'_>> {
    if query.series.is_empty() {
        return Err(ConnectorError::EmptyQuery);
    }

    let series = query
        .series
        .iter()
        .enumerate()
        .map(|(i, s)| RemoteSeries {
            name: format!("series{}", i),
            origin: &s.origin,
            source: &s.source,
            metric: &s.metric,
        })
        .collect();

    Ok(RemotePointsRequest {
        start_time: query.start,
        end_time: query.end,
        sample: query.sample,
        graph: RemoteGraph {
            name: "facette",
            groups: vec![RemoteGroup {
                name: "group0",
                series,
            }],
        },
    })
}

/// Put remote results back at the index encoded in their `series{i}` name.
fn align(query: &PointsQuery, response: RemotePointsResponse) -> Vec<Series> {
    let mut by_name: HashMap<String, Series> = response
        .series
        .into_iter()
        .map(|s| (s.name.clone(), s))
        .collect();

    query
        .series
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let mut series = by_name.remove(&format!("series{}", i)).unwrap_or_default();
            series.name = s.name.clone();
            series
        })
        .collect()
}

#[async_trait]
impl Connector for FacetteConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "facette"
    }

    async fn refresh(&self, output: &mpsc::Sender<Record>) -> ConnectorResult<()> {
        let tree: CatalogTree = fetch_json(
            &self.name,
            self.client
                .get(format!("{}{}/catalog", self.url, crate::API_PREFIX))
                .query(&[("tree", "1")])
                .header(crate::REQUESTOR_HEADER, &self.requestor),
        )
        .await?;

        debug!(target: "facette::connector::facette", provider = %self.name, origins = tree.len(), "Fetched remote catalog");

        for record in tree_records(tree) {
            emit(output, record).await?;
        }
        Ok(())
    }

    async fn points(&self, query: &PointsQuery) -> ConnectorResult<Vec<Series>> {
        let request = points_request(query)?;
        let response: RemotePointsResponse = fetch_json(
            &self.name,
            self.client
                .post(format!("{}{}/series/points", self.url, crate::API_PREFIX))
                .header(crate::REQUESTOR_HEADER, &self.requestor)
                .json(&request),
        )
        .await?;

        Ok(align(query, response))
    }
}
