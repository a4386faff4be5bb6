// ============================================================================
// CATALOG SEARCHER
// ============================================================================
// Pattern lookups over a catalog snapshot.
// ============================================================================

use std::sync::Arc;

use super::{Catalog, CatalogIndex, Metric, Origin, Source};
use crate::pattern::Pattern;

/// Name filter of one lookup level. An empty string selects everything and an
/// invalid pattern selects nothing.
enum Selector {
    All,
    Pattern(Pattern),
    Nothing,
}

impl Selector {
    fn new(input: &str) -> Self {
        if input.is_empty() {
            return Selector::All;
        }
        match Pattern::parse(input) {
            Ok(pattern) => Selector::Pattern(pattern),
            Err(_) => Selector::Nothing,
        }
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            Selector::All => true,
            Selector::Pattern(pattern) => pattern.matches(name),
            Selector::Nothing => false,
        }
    }

    fn literal(&self) -> Option<&str> {
        match self {
            Selector::Pattern(Pattern::Literal(value)) => Some(value),
            _ => None,
        }
    }
}

/// Read-only search façade. Every searcher works on the snapshot taken at
/// construction, so all its answers are consistent with each other.
#[derive(Debug, Clone)]
pub struct Searcher {
    index: Arc<CatalogIndex>,
}

impl Searcher {
    pub fn new(catalog: &Catalog) -> Self {
        Self {
            index: catalog.snapshot(),
        }
    }

    pub fn from_index(index: Arc<CatalogIndex>) -> Self {
        Self { index }
    }

    pub fn index(&self) -> &CatalogIndex {
        &self.index
    }

    /// Origins whose name matches `name`; `limit` of `None` means unlimited.
    pub fn origins(&self, name: &str, limit: Option<usize>) -> Vec<Arc<Origin>> {
        let selector = Selector::new(name);
        if let Some(literal) = selector.literal() {
            return self.index.origin(literal).cloned().into_iter().collect();
        }

        self.index
            .origins()
            .filter(|o| selector.matches(&o.name))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Sources matching `name` under the origins matching `origin`.
    pub fn sources(&self, origin: &str, name: &str, limit: Option<usize>) -> Vec<Arc<Source>> {
        let selector = Selector::new(name);

        self.origins(origin, None)
            .iter()
            .flat_map(|o| o.sources.values())
            .filter(|s| selector.matches(&s.name))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Metrics matching `name` under the matching origins and sources.
    pub fn metrics(
        &self,
        origin: &str,
        source: &str,
        name: &str,
        limit: Option<usize>,
    ) -> Vec<Arc<Metric>> {
        let selector = Selector::new(name);

        self.sources(origin, source, None)
            .iter()
            .flat_map(|s| s.metrics.values())
            .filter(|m| selector.matches(&m.name))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub fn origin_exists(&self, name: &str) -> bool {
        self.index.origin_exists(name)
    }

    pub fn source_exists(&self, origin: &str, name: &str) -> bool {
        self.index.source_exists(origin, name)
    }

    pub fn metric_exists(&self, origin: &str, source: &str, name: &str) -> bool {
        self.index.metric_exists(origin, source, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ProviderHandle, Record};
    use crate::connector::testing::MemoryConnector;
    use pretty_assertions::assert_eq;

    fn catalog() -> Catalog {
        let catalog = Catalog::new();
        let provider = Arc::new(ProviderHandle::new(
            "p1",
            "p1",
            0,
            Arc::new(MemoryConnector::new("p1")),
        ));
        catalog.replace_provider_set(
            provider,
            vec![
                Record::new("test", "source1", "database1/test"),
                Record::new("test", "source1", "database2/test"),
                Record::new("test", "source2", "database1/test"),
                Record::new("other", "HostA", "cpu.idle"),
            ],
        );
        catalog
    }

    fn names<T, F: Fn(&T) -> String>(items: &[T], f: F) -> Vec<String> {
        items.iter().map(f).collect()
    }

    #[test]
    fn test_origins() {
        let searcher = Searcher::new(&catalog());
        assert_eq!(names(&searcher.origins("", None), |o| o.name.clone()), vec!["other", "test"]);
        assert_eq!(searcher.origins("test", None).len(), 1);
        assert_eq!(searcher.origins("glob:t*", None).len(), 1);
        assert_eq!(searcher.origins("", Some(1)).len(), 1);
        assert!(searcher.origins("missing", None).is_empty());
    }

    #[test]
    fn test_sources() {
        let searcher = Searcher::new(&catalog());
        assert_eq!(
            names(&searcher.sources("test", "glob:source*", None), |s| s.name.clone()),
            vec!["source1", "source2"]
        );
        assert_eq!(searcher.sources("", "glob:hosta", None).len(), 1);
        assert_eq!(searcher.sources("", "regexp:source[0-9]", None).len(), 2);
        assert!(searcher.sources("", "regexp:(", None).is_empty());
    }

    #[test]
    fn test_metrics() {
        let searcher = Searcher::new(&catalog());
        assert_eq!(searcher.metrics("test", "source1", "", None).len(), 2);
        assert_eq!(searcher.metrics("test", "", "database1/test", None).len(), 2);
        assert_eq!(searcher.metrics("", "", "glob:database*/test", Some(2)).len(), 2);

        let metric = &searcher.metrics("test", "source2", "database1/test", Some(1))[0];
        assert_eq!(metric.source, "source2");
        assert_eq!(metric.provider.id, "p1");
    }

    #[test]
    fn test_searcher_keeps_its_snapshot() {
        let catalog = catalog();
        let searcher = Searcher::new(&catalog);
        catalog.remove_provider("p1");

        assert!(searcher.origin_exists("test"));
        assert!(!Searcher::new(&catalog).origin_exists("test"));
    }
}
