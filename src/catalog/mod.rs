// ============================================================================
// CATALOG
// ============================================================================
// In-memory `origin → source → metric` index of everything the configured
// providers expose:
// - each provider owns the record set produced by its last refresh
// - sets are replaced atomically, readers load an immutable snapshot
// - a triple produced by several providers belongs to the one with the
//   highest priority, ties going to the provider registered first
// ============================================================================

pub mod filter;
pub mod searcher;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::connector::{Attributes, Connector};

pub use filter::{FilterChain, ProviderFilter, Rule};
pub use searcher::Searcher;

// ----------------------------------------------------------------------------
// Records
// ----------------------------------------------------------------------------

/// A single `(origin, source, metric)` produced by a connector refresh.
///
/// The `original_*` fields keep the names as the upstream knows them; the
/// filter chain only ever rewrites the canonical ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub origin: String,
    pub source: String,
    pub metric: String,
    pub original_origin: String,
    pub original_source: String,
    pub original_metric: String,
    pub attributes: Attributes,
}

impl Record {
    pub fn new(
        origin: impl Into<String>,
        source: impl Into<String>,
        metric: impl Into<String>,
    ) -> Self {
        let (origin, source, metric) = (origin.into(), source.into(), metric.into());
        Self {
            original_origin: origin.clone(),
            original_source: source.clone(),
            original_metric: metric.clone(),
            origin,
            source,
            metric,
            attributes: Attributes::new(),
        }
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn is_valid(&self) -> bool {
        !self.origin.is_empty() && !self.source.is_empty() && !self.metric.is_empty()
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{origin: {:?}, source: {:?}, metric: {:?}}}", self.origin, self.source, self.metric)
    }
}

// ----------------------------------------------------------------------------
// Provider handles
// ----------------------------------------------------------------------------

/// Identity of a provider as seen by catalog entries.
pub struct ProviderHandle {
    pub id: String,
    pub name: String,
    pub priority: i32,
    pub connector: Arc<dyn Connector>,
}

impl ProviderHandle {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        priority: i32,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            priority,
            connector,
        }
    }
}

impl fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("connector", &self.connector.kind())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Catalog entries
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Origin {
    pub name: String,
    #[serde(skip)]
    pub original_name: String,
    #[serde(skip)]
    pub sources: BTreeMap<String, Arc<Source>>,
    /// Names of every provider that produced this origin.
    pub providers: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Source {
    pub name: String,
    #[serde(skip)]
    pub original_name: String,
    #[serde(skip)]
    pub origin: String,
    #[serde(skip)]
    pub metrics: BTreeMap<String, Arc<Metric>>,
    pub providers: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct Metric {
    pub name: String,
    pub origin: String,
    pub source: String,
    pub original_name: String,
    pub original_origin: String,
    pub original_source: String,
    pub attributes: Attributes,
    /// Provider answering points queries for this metric.
    pub provider: Arc<ProviderHandle>,
    pub providers: BTreeSet<String>,
}

impl Metric {
    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.provider.connector
    }
}

/// Immutable view of the catalog at one point in time.
#[derive(Debug, Default)]
pub struct CatalogIndex {
    origins: BTreeMap<String, Arc<Origin>>,
    source_count: usize,
    metric_count: usize,
}

impl CatalogIndex {
    pub fn origins(&self) -> impl Iterator<Item = &Arc<Origin>> {
        self.origins.values()
    }

    pub fn origin(&self, name: &str) -> Option<&Arc<Origin>> {
        self.origins.get(name)
    }

    pub fn source(&self, origin: &str, name: &str) -> Option<&Arc<Source>> {
        self.origin(origin)?.sources.get(name)
    }

    pub fn metric(&self, origin: &str, source: &str, name: &str) -> Option<&Arc<Metric>> {
        self.source(origin, source)?.metrics.get(name)
    }

    pub fn origin_exists(&self, name: &str) -> bool {
        self.origin(name).is_some()
    }

    pub fn source_exists(&self, origin: &str, name: &str) -> bool {
        self.source(origin, name).is_some()
    }

    pub fn metric_exists(&self, origin: &str, source: &str, name: &str) -> bool {
        self.metric(origin, source, name).is_some()
    }

    pub fn origin_count(&self) -> usize {
        self.origins.len()
    }

    pub fn source_count(&self) -> usize {
        self.source_count
    }

    pub fn metric_count(&self) -> usize {
        self.metric_count
    }

    fn build<'a>(sets: impl Iterator<Item = &'a ProviderSet>) -> Self {
        let mut ordered: Vec<&ProviderSet> = sets.collect();
        ordered.sort_by(|a, b| {
            b.handle
                .priority
                .cmp(&a.handle.priority)
                .then(a.sequence.cmp(&b.sequence))
        });

        let mut origins: BTreeMap<String, Origin> = BTreeMap::new();
        let mut sources: BTreeMap<(String, String), Source> = BTreeMap::new();
        let mut metrics: BTreeMap<(String, String, String), Metric> = BTreeMap::new();

        for set in ordered {
            let provider = &set.handle.name;

            for record in &set.records {
                origins
                    .entry(record.origin.clone())
                    .or_insert_with(|| Origin {
                        name: record.origin.clone(),
                        original_name: record.original_origin.clone(),
                        sources: BTreeMap::new(),
                        providers: BTreeSet::new(),
                    })
                    .providers
                    .insert(provider.clone());

                sources
                    .entry((record.origin.clone(), record.source.clone()))
                    .or_insert_with(|| Source {
                        name: record.source.clone(),
                        original_name: record.original_source.clone(),
                        origin: record.origin.clone(),
                        metrics: BTreeMap::new(),
                        providers: BTreeSet::new(),
                    })
                    .providers
                    .insert(provider.clone());

                metrics
                    .entry((record.origin.clone(), record.source.clone(), record.metric.clone()))
                    .or_insert_with(|| Metric {
                        name: record.metric.clone(),
                        origin: record.origin.clone(),
                        source: record.source.clone(),
                        original_name: record.original_metric.clone(),
                        original_origin: record.original_origin.clone(),
                        original_source: record.original_source.clone(),
                        attributes: record.attributes.clone(),
                        provider: set.handle.clone(),
                        providers: BTreeSet::new(),
                    })
                    .providers
                    .insert(provider.clone());
            }
        }

        let metric_count = metrics.len();
        let source_count = sources.len();

        for ((origin, source, name), metric) in metrics {
            if let Some(entry) = sources.get_mut(&(origin, source)) {
                entry.metrics.insert(name, Arc::new(metric));
            }
        }
        for ((origin, name), source) in sources {
            if let Some(entry) = origins.get_mut(&origin) {
                entry.sources.insert(name, Arc::new(source));
            }
        }

        Self {
            origins: origins
                .into_iter()
                .map(|(name, origin)| (name, Arc::new(origin)))
                .collect(),
            source_count,
            metric_count,
        }
    }
}

// ----------------------------------------------------------------------------
// Catalog
// ----------------------------------------------------------------------------

struct ProviderSet {
    handle: Arc<ProviderHandle>,
    sequence: u64,
    records: Vec<Record>,
}

#[derive(Default)]
struct Registry {
    sets: BTreeMap<String, ProviderSet>,
    next_sequence: u64,
}

impl Registry {
    fn set_mut(&mut self, handle: Arc<ProviderHandle>) -> &mut ProviderSet {
        let sequence = self.next_sequence;
        let set = self
            .sets
            .entry(handle.id.clone())
            .or_insert_with(|| ProviderSet {
                handle: handle.clone(),
                sequence,
                records: Vec::new(),
            });
        if set.sequence == sequence {
            self.next_sequence += 1;
        }
        set.handle = handle;
        set
    }
}

/// Shared catalog. Writers serialize on the registry, readers never lock.
pub struct Catalog {
    registry: Mutex<Registry>,
    index: ArcSwap<CatalogIndex>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            index: ArcSwap::from_pointee(CatalogIndex::default()),
        }
    }

    /// Current snapshot. It stays valid, and unchanged, for as long as it is held.
    pub fn snapshot(&self) -> Arc<CatalogIndex> {
        self.index.load_full()
    }

    /// Add a single record to the set owned by `provider`.
    pub fn insert(&self, provider: Arc<ProviderHandle>, record: Record) {
        if !record.is_valid() {
            return;
        }
        let mut registry = self.registry.lock();
        registry.set_mut(provider).records.push(record);
        self.publish(&registry);
    }

    /// Replace every record owned by `provider` with `records`.
    pub fn replace_provider_set(&self, provider: Arc<ProviderHandle>, records: Vec<Record>) {
        let records: Vec<Record> = records.into_iter().filter(Record::is_valid).collect();
        let mut registry = self.registry.lock();

        debug!(
            target: "facette::catalog",
            provider = %provider.name,
            records = records.len(),
            "Replacing provider set"
        );

        registry.set_mut(provider).records = records;
        self.publish(&registry);
    }

    /// Drop the set owned by a provider.
    pub fn remove_provider(&self, provider_id: &str) {
        let mut registry = self.registry.lock();
        if registry.sets.remove(provider_id).is_some() {
            debug!(target: "facette::catalog", provider_id, "Removed provider set");
            self.publish(&registry);
        }
    }

    pub fn provider_record_count(&self, provider_id: &str) -> usize {
        self.registry
            .lock()
            .sets
            .get(provider_id)
            .map(|set| set.records.len())
            .unwrap_or(0)
    }

    fn publish(&self, registry: &Registry) {
        self.index
            .store(Arc::new(CatalogIndex::build(registry.sets.values())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::testing::MemoryConnector;
    use pretty_assertions::assert_eq;

    fn handle(id: &str, priority: i32) -> Arc<ProviderHandle> {
        Arc::new(ProviderHandle::new(
            id,
            id,
            priority,
            Arc::new(MemoryConnector::new(id)),
        ))
    }

    #[test]
    fn test_insert_and_lookup() {
        let catalog = Catalog::new();
        let provider = handle("p1", 0);
        catalog.insert(provider.clone(), Record::new("collectd", "host1", "load.shortterm"));
        catalog.insert(provider, Record::new("collectd", "host1", "load.midterm"));

        let index = catalog.snapshot();
        assert!(index.origin_exists("collectd"));
        assert!(index.source_exists("collectd", "host1"));
        assert!(index.metric_exists("collectd", "host1", "load.midterm"));
        assert!(!index.metric_exists("collectd", "host2", "load.midterm"));
        assert_eq!(index.metric_count(), 2);
    }

    #[test]
    fn test_invalid_records_are_ignored() {
        let catalog = Catalog::new();
        catalog.insert(handle("p1", 0), Record::new("", "host1", "cpu"));
        assert_eq!(catalog.snapshot().origin_count(), 0);
    }

    #[test]
    fn test_replace_provider_set() {
        let catalog = Catalog::new();
        let provider = handle("p1", 0);
        catalog.replace_provider_set(
            provider.clone(),
            vec![Record::new("o", "s1", "m1"), Record::new("o", "s1", "m2")],
        );
        let before = catalog.snapshot();

        catalog.replace_provider_set(provider, vec![Record::new("o", "s2", "m3")]);
        let after = catalog.snapshot();

        assert_eq!(before.metric_count(), 2);
        assert!(before.metric_exists("o", "s1", "m1"));
        assert_eq!(after.metric_count(), 1);
        assert!(!after.source_exists("o", "s1"));
        assert!(after.metric_exists("o", "s2", "m3"));
    }

    #[test]
    fn test_priority_ownership() {
        let catalog = Catalog::new();
        let low = handle("low", 1);
        let high = handle("high", 10);

        catalog.replace_provider_set(low.clone(), vec![Record::new("o", "s", "m")]);
        catalog.replace_provider_set(high.clone(), vec![Record::new("o", "s", "m")]);
        assert_eq!(catalog.snapshot().metric("o", "s", "m").unwrap().provider.id, "high");

        // Refreshing the lower provider afterwards does not steal the metric
        catalog.replace_provider_set(low, vec![Record::new("o", "s", "m")]);
        let index = catalog.snapshot();
        let metric = index.metric("o", "s", "m").unwrap();
        assert_eq!(metric.provider.id, "high");
        assert_eq!(metric.providers.len(), 2);

        catalog.remove_provider("high");
        assert_eq!(catalog.snapshot().metric("o", "s", "m").unwrap().provider.id, "low");
    }

    #[test]
    fn test_priority_ties_go_to_first_registration() {
        let catalog = Catalog::new();
        let first = handle("first", 5);
        let second = handle("second", 5);

        catalog.replace_provider_set(first.clone(), vec![Record::new("o", "s", "m")]);
        catalog.replace_provider_set(second, vec![Record::new("o", "s", "m")]);
        catalog.replace_provider_set(first, vec![Record::new("o", "s", "m")]);

        assert_eq!(catalog.snapshot().metric("o", "s", "m").unwrap().provider.id, "first");
    }

    #[test]
    fn test_originals_are_kept() {
        let catalog = Catalog::new();
        let mut record = Record::new("origin1", "host1_example_net", "cpu");
        record.source = "host1.example.net".into();
        catalog.insert(handle("p1", 0), record);

        let index = catalog.snapshot();
        let metric = index.metric("origin1", "host1.example.net", "cpu").unwrap();
        assert_eq!(metric.original_source, "host1_example_net");
        assert_eq!(
            index.source("origin1", "host1.example.net").unwrap().original_name,
            "host1_example_net"
        );
    }

    #[test]
    fn test_replace_is_atomic_for_readers() {
        let catalog = Arc::new(Catalog::new());
        let provider = handle("p1", 0);
        let set_a: Vec<Record> = (0..50).map(|i| Record::new("o", "a", format!("m{}", i))).collect();
        let set_b: Vec<Record> = (0..50).map(|i| Record::new("o", "b", format!("m{}", i))).collect();
        catalog.replace_provider_set(provider.clone(), set_a.clone());

        let reader = {
            let catalog = catalog.clone();
            std::thread::spawn(move || {
                for _ in 0..2_000 {
                    let index = catalog.snapshot();
                    let a = index.source("o", "a").map(|s| s.metrics.len()).unwrap_or(0);
                    let b = index.source("o", "b").map(|s| s.metrics.len()).unwrap_or(0);
                    assert!((a == 50 && b == 0) || (a == 0 && b == 50), "mixed snapshot {}/{}", a, b);
                }
            })
        };

        for i in 0..200 {
            let set = if i % 2 == 0 { set_b.clone() } else { set_a.clone() };
            catalog.replace_provider_set(provider.clone(), set);
        }
        reader.join().unwrap();
    }
}
