// ============================================================================
// EXPANDERS
// ============================================================================
// Resolution of stored library items into what the points engine and the
// UI consume:
// - graphs: linked instances take their template definition, placeholders
//   are rendered with the instance attributes
// - collections: same for linked collections, entries get their graph title
// - series: `group:<id>` sources and metrics become concrete catalog names
// ============================================================================

use std::collections::BTreeSet;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::catalog::Searcher;
use crate::connector::Attributes;
use crate::error::{StorageError, StorageResult};
use crate::pattern;
use crate::storage::{Collection, Column, Graph, SeriesEntry, SourceGroup, MetricGroup, Store};
use crate::template;

/// Copy every key of `src` into `dst`, replacing existing ones.
fn merge(dst: &mut Map<String, Value>, src: &Map<String, Value>) {
    for (key, value) in src {
        dst.insert(key.clone(), value.clone());
    }
}

fn render_title(options: &mut Map<String, Value>, attributes: &Attributes) -> StorageResult<()> {
    if let Some(Value::String(title)) = options.get("title") {
        let rendered = template::render(title, attributes)?;
        options.insert("title".into(), Value::String(rendered));
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Graphs
// ----------------------------------------------------------------------------

/// Resolve `graph` into a self-contained definition. `overrides` take
/// precedence over the stored instance attributes.
pub fn expand_graph(store: &Store, graph: Graph, overrides: Option<&Attributes>) -> StorageResult<Graph> {
    let mut attributes = graph.attributes.clone();
    if let Some(overrides) = overrides {
        merge(&mut attributes, overrides);
    }

    let mut expanded = match graph.link.as_deref().filter(|l| !l.is_empty()) {
        Some(link) => {
            let mut resolved: Graph = store.get(Column::Id, link).map_err(|e| match e {
                StorageError::NotFound => StorageError::unknown_reference(link),
                other => other,
            })?;

            merge(&mut resolved.attributes, &attributes);
            merge(&mut resolved.options, &graph.options);
            resolved.item = graph.item;
            resolved.alias = graph.alias;
            resolved.link = graph.link;
            resolved.template = false;
            resolved
        }
        None if graph.template => Graph {
            attributes: attributes.clone(),
            ..graph
        },
        None => return Ok(graph),
    };

    let attributes = expanded.attributes.clone();
    render_title(&mut expanded.options, &attributes)?;

    for series in expanded.groups.iter_mut().flat_map(|g| g.series.iter_mut()) {
        series.name = template::render(&series.name, &attributes)?;
        series.origin = template::render(&series.origin, &attributes)?;
        series.source = template::render(&series.source, &attributes)?;
        series.metric = template::render(&series.metric, &attributes)?;
    }

    debug!(target: "facette::expand", graph = %expanded.item.name, "Expanded graph");
    Ok(expanded)
}

// ----------------------------------------------------------------------------
// Collections
// ----------------------------------------------------------------------------

/// Resolve `collection` and annotate each entry with its rendered graph title.
pub fn expand_collection(
    store: &Store,
    collection: Collection,
    overrides: Option<&Attributes>,
) -> StorageResult<Collection> {
    let mut collection = collection;
    if let Some(overrides) = overrides {
        merge(&mut collection.attributes, overrides);
    }

    if let Some(link) = collection.link.clone().filter(|l| !l.is_empty()) {
        let mut resolved: Collection = store.get(Column::Id, &link).map_err(|e| match e {
            StorageError::NotFound => StorageError::unknown_reference(&link),
            other => other,
        })?;

        merge(&mut resolved.attributes, &collection.attributes);
        merge(&mut resolved.options, &collection.options);
        resolved.item = collection.item;
        resolved.alias = collection.alias;
        resolved.parent = collection.parent;
        resolved.link = Some(link);
        resolved.template = false;
        render_title(&mut resolved.options, &resolved.attributes.clone())?;

        collection = resolved;
    }

    for entry in collection.entries.iter_mut() {
        let mut attributes = collection.attributes.clone();
        merge(&mut attributes, &entry.attributes);

        let graph: Graph = match store.get(Column::Id, &entry.graph) {
            Ok(graph) => graph,
            Err(StorageError::NotFound) => {
                warn!(target: "facette::expand", graph = %entry.graph, "Collection entry references a missing graph");
                continue;
            }
            Err(e) => return Err(e),
        };

        let graph = expand_graph(store, graph, Some(&attributes))?;
        if let Some(title) = graph.options.get("title") {
            entry.options.insert("title".into(), title.clone());
        }
    }

    Ok(collection)
}

// ----------------------------------------------------------------------------
// Series
// ----------------------------------------------------------------------------

/// Matches of a pattern list against `names`. An invalid pattern aborts the
/// expansion.
fn matching<'a>(patterns: &[String], names: impl Iterator<Item = &'a str>) -> Option<BTreeSet<String>> {
    let compiled = patterns
        .iter()
        .map(|p| pattern::Pattern::parse(p))
        .collect::<Result<Vec<_>, _>>();

    let compiled = match compiled {
        Ok(compiled) => compiled,
        Err(e) => {
            warn!(target: "facette::expand", error = %e, "Invalid group pattern");
            return None;
        }
    };

    Some(
        names
            .filter(|name| compiled.iter().any(|p| p.matches(name)))
            .map(str::to_string)
            .collect(),
    )
}

/// Expand the source and metric group references of `series` against the
/// catalog. With `exist_only`, group metrics are only kept for the sources
/// retained by the source step.
///
/// The result is sorted by source then metric; an expanded series is named
/// `<source> (<metric>)`. A missing group yields no series.
pub fn expand_series(
    store: &Store,
    searcher: &Searcher,
    series: &SeriesEntry,
    exist_only: bool,
) -> Vec<SeriesEntry> {
    let mut grouped = false;

    let sources: BTreeSet<String> = match series.source.strip_prefix(crate::GROUP_PREFIX) {
        Some(id) => {
            grouped = true;
            let group: SourceGroup = match store.get(Column::Id, id) {
                Ok(group) => group,
                Err(e) => {
                    warn!(target: "facette::expand", group = id, error = %e, "Unable to expand source group");
                    return Vec::new();
                }
            };
            let candidates = searcher.sources(&series.origin, "", None);
            match matching(&group.patterns, candidates.iter().map(|s| s.name.as_str())) {
                Some(matches) => matches,
                None => return Vec::new(),
            }
        }
        None => BTreeSet::from([series.source.clone()]),
    };

    let metrics: BTreeSet<String> = match series.metric.strip_prefix(crate::GROUP_PREFIX) {
        Some(id) => {
            grouped = true;
            let group: MetricGroup = match store.get(Column::Id, id) {
                Ok(group) => group,
                Err(e) => {
                    warn!(target: "facette::expand", group = id, error = %e, "Unable to expand metric group");
                    return Vec::new();
                }
            };
            let candidates = searcher.metrics(&series.origin, "", "", None);
            let names = candidates
                .iter()
                .filter(|m| !exist_only || sources.contains(&m.source))
                .map(|m| m.name.as_str());
            match matching(&group.patterns, names) {
                Some(matches) => matches,
                None => return Vec::new(),
            }
        }
        None => BTreeSet::from([series.metric.clone()]),
    };

    let mut out = Vec::with_capacity(sources.len() * metrics.len());
    for source in &sources {
        for metric in &metrics {
            out.push(SeriesEntry {
                name: if grouped {
                    format!("{} ({})", source, metric)
                } else {
                    series.name.clone()
                },
                origin: series.origin.clone(),
                source: source.clone(),
                metric: metric.clone(),
                options: series.options.clone(),
            });
        }
    }

    out
}
