use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::model::{EliminatedLinkedItem, EliminationKind, ExternalDependency, ItemKind, LinkedItem};
use crate::KernelError;

/// Records produced by one ingestion source in one refresh cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct SourceBatch {
    #[serde(default)]
    pub live: BTreeMap<ItemKind, Vec<LinkedItem>>,
    #[serde(default)]
    pub eliminated: BTreeMap<ItemKind, Vec<EliminatedLinkedItem>>,
    #[serde(default)]
    pub dependencies: Vec<ExternalDependency>,
}

impl SourceBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_live(&mut self, item: LinkedItem) {
        self.live.entry(item.kind()).or_default().push(item);
    }

    pub fn push_eliminated(&mut self, item: EliminatedLinkedItem) {
        self.eliminated.entry(item.kind()).or_default().push(item);
    }

    pub fn push_dependency(&mut self, dependency: ExternalDependency) {
        self.dependencies.push(dependency);
    }

    /// Live plus eliminated records. Dependencies are not records and are not counted.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.live.values().map(Vec::len).sum::<usize>()
            + self.eliminated.values().map(Vec::len).sum::<usize>()
    }
}

/// Read access shared by the live aggregator and frozen checkpoints.
pub trait RecordView {
    fn get_all(&self, kind: ItemKind) -> &[LinkedItem];

    fn get_all_eliminated(&self, kind: ItemKind) -> &[EliminatedLinkedItem];

    /// Dependencies in merge order, across all sources.
    fn external_dependencies(&self) -> &[ExternalDependency];

    fn get_by_kind_and_id(&self, kind: ItemKind, id: &str) -> Option<&LinkedItem> {
        self.get_all(kind).iter().find(|item| item.id() == id)
    }

    /// First live record with `id`, searching kinds in [`ItemKind::LOOKUP_ORDER`].
    fn get_by_id(&self, id: &str) -> Option<&LinkedItem> {
        ItemKind::LOOKUP_ORDER.into_iter().find_map(|kind| self.get_by_kind_and_id(kind, id))
    }

    fn get_eliminated_by_kind_and_id(
        &self,
        kind: ItemKind,
        id: &str,
    ) -> Option<&EliminatedLinkedItem> {
        self.get_all_eliminated(kind).iter().find(|item| item.id() == id)
    }

    fn get_eliminated_by_id(&self, id: &str) -> Option<&EliminatedLinkedItem> {
        ItemKind::LOOKUP_ORDER
            .into_iter()
            .find_map(|kind| self.get_eliminated_by_kind_and_id(kind, id))
    }

    fn live_count(&self) -> usize {
        ItemKind::ALL.into_iter().map(|kind| self.get_all(kind).len()).sum()
    }

    fn eliminated_count(&self) -> usize {
        ItemKind::ALL.into_iter().map(|kind| self.get_all_eliminated(kind).len()).sum()
    }
}

/// Canonical record store for one build. Owns every live and eliminated record.
#[derive(Debug, Clone, Default)]
pub struct RecordAggregator {
    live: BTreeMap<ItemKind, Vec<LinkedItem>>,
    eliminated: BTreeMap<ItemKind, Vec<EliminatedLinkedItem>>,
    dependencies: Vec<ExternalDependency>,
    origins: BTreeMap<(ItemKind, String), String>,
    collisions: BTreeSet<String>,
}

impl RecordAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn contains(&self, kind: ItemKind, id: &str) -> bool {
        self.get_by_kind_and_id(kind, id).is_some()
            || self.get_eliminated_by_kind_and_id(kind, id).is_some()
    }

    /// Merge one source's batch. The batch is validated as a whole before anything is
    /// appended, so a rejected batch leaves the aggregator untouched.
    ///
    /// # Errors
    /// Returns [`KernelError::DuplicateId`] when an ID repeats within a kind, and
    /// [`KernelError::Validation`] when a record is malformed or filed under the wrong kind.
    pub fn merge_source(
        &mut self,
        source_name: &str,
        batch: SourceBatch,
    ) -> Result<(), KernelError> {
        let mut incoming: BTreeSet<(ItemKind, &str)> = BTreeSet::new();
        let live_records = batch.live.iter().flat_map(|(kind, items)| {
            items.iter().map(move |item| (*kind, item))
        });
        let eliminated_records = batch.eliminated.iter().flat_map(|(kind, items)| {
            items.iter().map(move |item| (*kind, item.linked_item()))
        });

        for (bucket, item) in live_records.chain(eliminated_records) {
            if item.kind() != bucket {
                return Err(KernelError::Validation(format!(
                    "source `{source_name}` filed {} record `{}` under {bucket}",
                    item.kind(),
                    item.id()
                )));
            }
            item.item.validate()?;
            if self.contains(bucket, item.id()) || !incoming.insert((bucket, item.id())) {
                return Err(KernelError::DuplicateId { id: item.id().to_string(), kind: bucket });
            }
        }
        for dependency in &batch.dependencies {
            dependency.validate()?;
        }

        let SourceBatch { live, eliminated, dependencies } = batch;
        for (kind, items) in live {
            for item in items {
                self.track_origin(source_name, kind, item.id());
                self.live.entry(kind).or_default().push(item);
            }
        }
        for (kind, items) in eliminated {
            for item in items {
                self.track_origin(source_name, kind, item.id());
                self.eliminated.entry(kind).or_default().push(item);
            }
        }
        self.dependencies.extend(dependencies);

        Ok(())
    }

    fn track_origin(&mut self, source_name: &str, kind: ItemKind, id: &str) {
        let clashes = ItemKind::ALL
            .into_iter()
            .filter(|other| *other != kind && self.contains(*other, id))
            .collect::<Vec<_>>();
        if !clashes.is_empty() {
            tracing::warn!(
                "record id `{}` from source `{}` ({}) is also used by {:?}; lookups by id \
                 resolve in priority order",
                id,
                source_name,
                kind,
                clashes
            );
            self.collisions.insert(id.to_string());
        }
        self.origins.insert((kind, id.to_string()), source_name.to_string());
    }

    /// Move a live record into the eliminated list of its kind.
    ///
    /// # Errors
    /// Returns [`KernelError::NotFound`] when `id` is not present in any live list.
    pub fn eliminate(
        &mut self,
        id: &str,
        reason: &str,
        elimination_kind: EliminationKind,
    ) -> Result<ItemKind, KernelError> {
        let kind = ItemKind::LOOKUP_ORDER
            .into_iter()
            .find(|kind| self.get_by_kind_and_id(*kind, id).is_some())
            .ok_or_else(|| KernelError::NotFound(format!("no live record with id `{id}`")))?;
        self.eliminate_in(kind, id, reason, elimination_kind)?;
        Ok(kind)
    }

    /// Kind-qualified variant of [`RecordAggregator::eliminate`].
    ///
    /// # Errors
    /// Returns [`KernelError::NotFound`] when `id` is not live within `kind`.
    pub fn eliminate_in(
        &mut self,
        kind: ItemKind,
        id: &str,
        reason: &str,
        elimination_kind: EliminationKind,
    ) -> Result<(), KernelError> {
        let items = self.live.entry(kind).or_default();
        let position = items.iter().position(|item| item.id() == id).ok_or_else(|| {
            KernelError::NotFound(format!("no live {kind} record with id `{id}`"))
        })?;
        let item = items.remove(position);
        self.eliminated
            .entry(kind)
            .or_default()
            .push(EliminatedLinkedItem::new(item, reason, elimination_kind));
        Ok(())
    }

    /// Name of the source that contributed a record.
    #[must_use]
    pub fn origin_of(&self, kind: ItemKind, id: &str) -> Option<&str> {
        self.origins.get(&(kind, id.to_string())).map(String::as_str)
    }

    /// IDs that occur in more than one record kind.
    #[must_use]
    pub fn id_collisions(&self) -> &BTreeSet<String> {
        &self.collisions
    }

    pub(crate) fn live_mut(&mut self, kind: ItemKind) -> &mut Vec<LinkedItem> {
        self.live.entry(kind).or_default()
    }
}

impl RecordView for RecordAggregator {
    fn get_all(&self, kind: ItemKind) -> &[LinkedItem] {
        self.live.get(&kind).map(Vec::as_slice).unwrap_or_default()
    }

    fn get_all_eliminated(&self, kind: ItemKind) -> &[EliminatedLinkedItem] {
        self.eliminated.get(&kind).map(Vec::as_slice).unwrap_or_default()
    }

    fn external_dependencies(&self) -> &[ExternalDependency] {
        &self.dependencies
    }
}
