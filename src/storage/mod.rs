// ============================================================================
// LIBRARY STORAGE
// ============================================================================
// Typed store of the persistent library items (providers, groups, graphs,
// collections):
// - every mutation runs under one write lock and is validated first
// - the whole library is optionally persisted as a JSON snapshot file
// - referential rules: template links, collection parents (no cycles),
//   collection entries, cascade deletion of child collections
// ============================================================================

pub mod item;
pub mod query;
pub mod tree;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{SubsecRound, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::catalog::filter::{Action, Target};
use crate::error::{StorageError, StorageResult};
use crate::template;

pub use item::{
    is_valid_name, Collection, CollectionEntry, Graph, Item, ItemType, MetricGroup, Provider,
    SeriesEntry, SeriesGroup, SourceGroup,
};
pub use query::{Column, ListQuery, SearchItem, ITEM_COLUMNS};
pub use tree::{CollectionTree, TreeEntry};

// ----------------------------------------------------------------------------
// Library
// ----------------------------------------------------------------------------

/// Every stored item, keyed by identifier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Library {
    #[serde(default)]
    pub providers: BTreeMap<String, Provider>,
    #[serde(default)]
    pub sourcegroups: BTreeMap<String, SourceGroup>,
    #[serde(default)]
    pub metricgroups: BTreeMap<String, MetricGroup>,
    #[serde(default)]
    pub graphs: BTreeMap<String, Graph>,
    #[serde(default)]
    pub collections: BTreeMap<String, Collection>,
}

impl Library {
    pub fn count(&self, kind: ItemType) -> usize {
        match kind {
            ItemType::Providers => self.providers.len(),
            ItemType::SourceGroups => self.sourcegroups.len(),
            ItemType::MetricGroups => self.metricgroups.len(),
            ItemType::Graphs => self.graphs.len(),
            ItemType::Collections => self.collections.len(),
        }
    }

    fn items(&self, kind: ItemType) -> Vec<Item> {
        match kind {
            ItemType::Providers => self.providers.values().map(|i| i.item.clone()).collect(),
            ItemType::SourceGroups => self.sourcegroups.values().map(|i| i.item.clone()).collect(),
            ItemType::MetricGroups => self.metricgroups.values().map(|i| i.item.clone()).collect(),
            ItemType::Graphs => self.graphs.values().map(|i| i.item.clone()).collect(),
            ItemType::Collections => self.collections.values().map(|i| i.item.clone()).collect(),
        }
    }

    /// Whether `alias` is taken by a collection, graph or provider other than
    /// `(kind, id)`.
    fn alias_taken(&self, alias: &str, kind: ItemType, id: &str) -> bool {
        let taken = |owner: ItemType, other_alias: Option<&str>, other_id: &str| {
            other_alias == Some(alias) && !(owner == kind && other_id == id)
        };

        self.graphs
            .values()
            .any(|g| taken(ItemType::Graphs, g.alias.as_deref(), &g.item.id))
            || self
                .collections
                .values()
                .any(|c| taken(ItemType::Collections, c.alias.as_deref(), &c.item.id))
            || self
                .providers
                .values()
                .any(|p| taken(ItemType::Providers, p.alias.as_deref(), &p.item.id))
    }

    /// Identifiers of every collection below `id`.
    fn descendants(&self, id: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut pending = vec![id.to_string()];

        while let Some(current) = pending.pop() {
            for child in self.collections.values() {
                if child.parent_id() == Some(current.as_str()) && found.insert(child.item.id.clone()) {
                    pending.push(child.item.id.clone());
                }
            }
        }

        found
    }
}

// ----------------------------------------------------------------------------
// Entity trait
// ----------------------------------------------------------------------------

/// A storable item type.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const TYPE: ItemType;

    /// Columns accepted for sorting.
    const COLUMNS: &'static [&'static str];

    fn item(&self) -> &Item;

    fn item_mut(&mut self) -> &mut Item;

    fn alias(&self) -> Option<&str> {
        None
    }

    fn set_alias(&mut self, _alias: Option<String>) {}

    fn table(library: &Library) -> &BTreeMap<String, Self>;

    fn table_mut(library: &mut Library) -> &mut BTreeMap<String, Self>;

    /// Type-specific validation, run with the library as it is before the save.
    fn check(&self, _library: &Library) -> StorageResult<()> {
        Ok(())
    }

    /// Referential cleanup before `id` is removed.
    fn before_delete(_library: &mut Library, _id: &str) -> StorageResult<()> {
        Ok(())
    }
}

fn check_pattern(pattern: &str) -> StorageResult<()> {
    crate::pattern::validate(pattern).map_err(|e| StorageError::InvalidPattern {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}

impl Entity for Provider {
    const TYPE: ItemType = ItemType::Providers;
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "name",
        "description",
        "created",
        "modified",
        "alias",
        "connector",
        "refresh_interval",
        "priority",
        "enabled",
    ];

    fn item(&self) -> &Item {
        &self.item
    }

    fn item_mut(&mut self) -> &mut Item {
        &mut self.item
    }

    fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    fn set_alias(&mut self, alias: Option<String>) {
        self.alias = alias;
    }

    fn table(library: &Library) -> &BTreeMap<String, Self> {
        &library.providers
    }

    fn table_mut(library: &mut Library) -> &mut BTreeMap<String, Self> {
        &mut library.providers
    }

    fn check(&self, _library: &Library) -> StorageResult<()> {
        if self.connector.is_empty() {
            return Err(StorageError::missing_field("connector"));
        }
        if !crate::connector::is_supported(&self.connector) {
            return Err(StorageError::invalid_value(
                "connector",
                format!("unsupported connector '{}'", self.connector),
            ));
        }

        for filter in &self.filters {
            if Action::parse(&filter.action).is_none() {
                return Err(StorageError::invalid_value(
                    "filters",
                    format!("unknown action '{}'", filter.action),
                ));
            }
            if Target::parse(&filter.target).is_none() {
                return Err(StorageError::invalid_value(
                    "filters",
                    format!("unknown target '{}'", filter.target),
                ));
            }
            regex::Regex::new(&filter.pattern).map_err(|e| StorageError::InvalidPattern {
                pattern: filter.pattern.clone(),
                message: e.to_string(),
            })?;
        }

        Ok(())
    }
}

impl Entity for SourceGroup {
    const TYPE: ItemType = ItemType::SourceGroups;
    const COLUMNS: &'static [&'static str] = &ITEM_COLUMNS;

    fn item(&self) -> &Item {
        &self.item
    }

    fn item_mut(&mut self) -> &mut Item {
        &mut self.item
    }

    fn table(library: &Library) -> &BTreeMap<String, Self> {
        &library.sourcegroups
    }

    fn table_mut(library: &mut Library) -> &mut BTreeMap<String, Self> {
        &mut library.sourcegroups
    }

    fn check(&self, _library: &Library) -> StorageResult<()> {
        if self.patterns.is_empty() {
            return Err(StorageError::missing_field("patterns"));
        }
        self.patterns.iter().try_for_each(|p| check_pattern(p))
    }
}

impl Entity for MetricGroup {
    const TYPE: ItemType = ItemType::MetricGroups;
    const COLUMNS: &'static [&'static str] = &ITEM_COLUMNS;

    fn item(&self) -> &Item {
        &self.item
    }

    fn item_mut(&mut self) -> &mut Item {
        &mut self.item
    }

    fn table(library: &Library) -> &BTreeMap<String, Self> {
        &library.metricgroups
    }

    fn table_mut(library: &mut Library) -> &mut BTreeMap<String, Self> {
        &mut library.metricgroups
    }

    fn check(&self, _library: &Library) -> StorageResult<()> {
        self.patterns.iter().try_for_each(|p| check_pattern(p))
    }
}

impl Entity for Graph {
    const TYPE: ItemType = ItemType::Graphs;
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "name",
        "description",
        "created",
        "modified",
        "alias",
        "link",
        "template",
    ];

    fn item(&self) -> &Item {
        &self.item
    }

    fn item_mut(&mut self) -> &mut Item {
        &mut self.item
    }

    fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    fn set_alias(&mut self, alias: Option<String>) {
        self.alias = alias;
    }

    fn table(library: &Library) -> &BTreeMap<String, Self> {
        &library.graphs
    }

    fn table_mut(library: &mut Library) -> &mut BTreeMap<String, Self> {
        &mut library.graphs
    }

    fn check(&self, library: &Library) -> StorageResult<()> {
        if let Some(link) = self.link.as_deref().filter(|l| !l.is_empty()) {
            if self.template {
                return Err(StorageError::invalid_value("link", "a template cannot be linked"));
            }
            if !self.groups.is_empty() || !self.options.is_empty() {
                return Err(StorageError::invalid_value(
                    "groups",
                    "a linked graph only carries its link and attributes",
                ));
            }
            match library.graphs.get(link) {
                Some(target) if target.template && target.item.id != self.item.id => {}
                Some(_) => return Err(StorageError::invalid_value("link", "linked graph is not a template")),
                None => return Err(StorageError::unknown_reference(link)),
            }
            return Ok(());
        }

        if self.template && !self.attributes.is_empty() {
            return Err(StorageError::invalid_value("attributes", "a template cannot carry attributes"));
        }

        if let Some(title) = self.title() {
            template::parse(title)?;
        }

        for series in self.groups.iter().flat_map(|g| g.series.iter()) {
            for field in [&series.name, &series.origin, &series.source, &series.metric] {
                template::parse(field)?;
            }

            if self.template {
                continue;
            }
            if let Some(id) = series.source.strip_prefix(crate::GROUP_PREFIX) {
                if !library.sourcegroups.contains_key(id) {
                    return Err(StorageError::unknown_reference(id));
                }
            }
            if let Some(id) = series.metric.strip_prefix(crate::GROUP_PREFIX) {
                if !library.metricgroups.contains_key(id) {
                    return Err(StorageError::unknown_reference(id));
                }
            }
        }

        Ok(())
    }

    fn before_delete(library: &mut Library, id: &str) -> StorageResult<()> {
        if let Some(instance) = library.graphs.values().find(|g| g.link.as_deref() == Some(id)) {
            return Err(StorageError::Referenced {
                by: instance.item.name.clone(),
            });
        }
        for collection in library.collections.values_mut() {
            collection.entries.retain(|e| e.graph != id);
        }
        Ok(())
    }
}

impl Entity for Collection {
    const TYPE: ItemType = ItemType::Collections;
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "name",
        "description",
        "created",
        "modified",
        "alias",
        "link",
        "parent",
        "template",
    ];

    fn item(&self) -> &Item {
        &self.item
    }

    fn item_mut(&mut self) -> &mut Item {
        &mut self.item
    }

    fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    fn set_alias(&mut self, alias: Option<String>) {
        self.alias = alias;
    }

    fn table(library: &Library) -> &BTreeMap<String, Self> {
        &library.collections
    }

    fn table_mut(library: &mut Library) -> &mut BTreeMap<String, Self> {
        &mut library.collections
    }

    fn check(&self, library: &Library) -> StorageResult<()> {
        let id = self.item.id.as_str();

        if let Some(link) = self.link.as_deref().filter(|l| !l.is_empty()) {
            if self.template {
                return Err(StorageError::invalid_value("link", "a template cannot be linked"));
            }
            match library.collections.get(link) {
                Some(target) if target.template && target.item.id != id => {}
                Some(_) => {
                    return Err(StorageError::invalid_value("link", "linked collection is not a template"))
                }
                None => return Err(StorageError::unknown_reference(link)),
            }
        } else if self.template && !self.attributes.is_empty() {
            return Err(StorageError::invalid_value("attributes", "a template cannot carry attributes"));
        }

        if let Some(title) = self.title() {
            template::parse(title)?;
        }

        for entry in &self.entries {
            if !library.graphs.contains_key(&entry.graph) {
                return Err(StorageError::unknown_reference(&entry.graph));
            }
        }

        // Walk up the parent chain, it must never come back to this collection
        let mut visited = BTreeSet::new();
        let mut current = self.parent_id();
        while let Some(parent) = current {
            if parent == id || !visited.insert(parent) {
                return Err(StorageError::CircularReference { id: id.to_string() });
            }
            current = match library.collections.get(parent) {
                Some(collection) => collection.parent_id(),
                None => return Err(StorageError::unknown_reference(parent)),
            };
        }

        Ok(())
    }

    fn before_delete(library: &mut Library, id: &str) -> StorageResult<()> {
        if let Some(instance) = library
            .collections
            .values()
            .find(|c| c.link.as_deref() == Some(id))
        {
            return Err(StorageError::Referenced {
                by: instance.item.name.clone(),
            });
        }
        for child in library.descendants(id) {
            library.collections.remove(&child);
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Store
// ----------------------------------------------------------------------------

pub struct Store {
    library: RwLock<Library>,
    path: Option<PathBuf>,
}

impl Default for Store {
    fn default() -> Self {
        Self::memory()
    }
}

impl Store {
    /// Store without persistence.
    pub fn memory() -> Self {
        Self {
            library: RwLock::new(Library::default()),
            path: None,
        }
    }

    /// Open a store persisted at `path`, loading the existing snapshot if any.
    pub fn open(path: Option<&Path>) -> StorageResult<Self> {
        let Some(path) = path else {
            return Ok(Self::memory());
        };

        let library = if path.exists() {
            let data = fs::read(path).map_err(|e| persistence_error(path, e))?;
            let library: Library = serde_json::from_slice(&data)?;
            info!(
                target: "facette::storage",
                path = %path.display(),
                providers = library.providers.len(),
                graphs = library.graphs.len(),
                collections = library.collections.len(),
                "Loaded library snapshot"
            );
            library
        } else {
            Library::default()
        };

        Ok(Self {
            library: RwLock::new(library),
            path: Some(path.to_path_buf()),
        })
    }

    /// Run `f` against a consistent view of the library.
    pub fn read<R>(&self, f: impl FnOnce(&Library) -> R) -> R {
        f(&self.library.read())
    }

    /// Insert or update `item`, returning it as stored.
    pub fn save<T: Entity>(&self, mut item: T) -> StorageResult<T> {
        let mut library = self.library.write();

        {
            let meta = item.item_mut();
            meta.id = if meta.id.is_empty() {
                Uuid::new_v4().to_string()
            } else {
                Uuid::parse_str(&meta.id)
                    .map_err(|_| StorageError::InvalidId { id: meta.id.clone() })?
                    .to_string()
            };

            if meta.name.is_empty() {
                return Err(StorageError::missing_field("name"));
            }
            if !is_valid_name(&meta.name) {
                return Err(StorageError::InvalidName {
                    name: meta.name.clone(),
                });
            }
            if meta.description.as_deref() == Some("") {
                meta.description = None;
            }
        }

        match item.alias().map(str::to_string) {
            Some(alias) if alias.is_empty() => item.set_alias(None),
            Some(alias) if !is_valid_name(&alias) => return Err(StorageError::InvalidAlias { alias }),
            Some(alias) if library.alias_taken(&alias, T::TYPE, &item.item().id) => {
                return Err(StorageError::Conflict {
                    field: "alias".into(),
                })
            }
            _ => {}
        }

        let id = item.item().id.clone();
        let table = T::table(&library);
        if table
            .values()
            .any(|other| other.item().name == item.item().name && other.item().id != id)
        {
            return Err(StorageError::Conflict {
                field: "name".into(),
            });
        }

        let now = Utc::now().trunc_subsecs(0);
        let existing_created = table.get(&id).map(|existing| existing.item().created);
        {
            let meta = item.item_mut();
            match existing_created {
                Some(created) => meta.created = created,
                None if !meta.has_created() => meta.created = now,
                None => {}
            }
            meta.modified = now;
        }

        item.check(&library)?;

        let previous = T::table_mut(&mut library).insert(id.clone(), item.clone());
        if let Err(e) = self.persist(&library) {
            let table = T::table_mut(&mut library);
            match previous {
                Some(previous) => table.insert(id, previous),
                None => table.remove(&id),
            };
            return Err(e);
        }

        debug!(target: "facette::storage", kind = %T::TYPE, id = %id, name = %item.item().name, "Saved item");
        Ok(item)
    }

    pub fn get<T: Entity>(&self, column: Column, value: &str) -> StorageResult<T> {
        let library = self.library.read();
        let table = T::table(&library);

        let found = match column {
            Column::Id => table.get(value),
            Column::Name => table.values().find(|i| i.item().name == value),
            Column::Alias => table.values().find(|i| i.alias() == Some(value)),
        };

        found.cloned().ok_or(StorageError::NotFound)
    }

    /// Fetch by identifier, falling back to alias lookup for aliased types.
    pub fn resolve<T: Entity>(&self, id_or_alias: &str) -> StorageResult<T> {
        match Uuid::parse_str(id_or_alias) {
            Ok(id) => self.get(Column::Id, &id.to_string()),
            Err(_) if T::TYPE.has_alias() => self.get(Column::Alias, id_or_alias),
            Err(_) => Err(StorageError::NotFound),
        }
    }

    pub fn list<T: Entity>(&self, query: &ListQuery) -> StorageResult<(Vec<T>, usize)> {
        let items: Vec<T> = T::table(&self.library.read()).values().cloned().collect();
        query.apply(items, T::COLUMNS)
    }

    /// Items of several types matching `query`.
    pub fn search(&self, types: &[ItemType], query: &ListQuery) -> StorageResult<(Vec<SearchItem>, usize)> {
        let items: Vec<SearchItem> = {
            let library = self.library.read();
            types
                .iter()
                .flat_map(|kind| {
                    library
                        .items(*kind)
                        .into_iter()
                        .map(|item| SearchItem { kind: *kind, item })
                })
                .collect()
        };

        let mut columns = ITEM_COLUMNS.to_vec();
        columns.push("type");
        query.apply(items, &columns)
    }

    /// Remove the item `id`, returning it.
    pub fn delete<T: Entity>(&self, id: &str) -> StorageResult<T> {
        let mut library = self.library.write();
        if !T::table(&library).contains_key(id) {
            return Err(StorageError::NotFound);
        }

        let snapshot = library.clone();
        T::before_delete(&mut library, id)?;
        let removed = T::table_mut(&mut library).remove(id).ok_or(StorageError::NotFound)?;

        if let Err(e) = self.persist(&library) {
            *library = snapshot;
            return Err(e);
        }

        debug!(target: "facette::storage", kind = %T::TYPE, id, "Deleted item");
        Ok(removed)
    }

    /// Remove every item of type `T`, returning how many were removed.
    pub fn delete_all<T: Entity>(&self) -> StorageResult<usize> {
        let mut library = self.library.write();
        let snapshot = library.clone();

        let removed = T::table_mut(&mut library).len();
        T::table_mut(&mut library).clear();
        if T::TYPE == ItemType::Graphs {
            for collection in library.collections.values_mut() {
                collection.entries.clear();
            }
        }

        if let Err(e) = self.persist(&library) {
            *library = snapshot;
            return Err(e);
        }

        info!(target: "facette::storage", kind = %T::TYPE, removed, "Deleted all items");
        Ok(removed)
    }

    pub fn count(&self, kind: ItemType) -> usize {
        self.library.read().count(kind)
    }

    fn persist(&self, library: &Library) -> StorageResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| persistence_error(path, e))?;
        }

        let data = serde_json::to_vec_pretty(library)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data).map_err(|e| persistence_error(path, e))?;
        fs::rename(&tmp, path).map_err(|e| persistence_error(path, e))
    }
}

fn persistence_error(path: &Path, error: std::io::Error) -> StorageError {
    StorageError::Persistence {
        path: path.to_path_buf(),
        message: error.to_string(),
    }
}
