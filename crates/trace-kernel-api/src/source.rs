use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use trace_kernel_core::{EliminatedLinkedItem, EliminationKind, ItemKind, SourceBatch};

/// A record a source has been told to stop returning as live.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WithdrawnRecord {
    pub kind: ItemKind,
    pub id: String,
    pub reason: String,
    pub elimination_kind: EliminationKind,
}

/// Capability implemented by every ingestion plugin.
pub trait IngestionSource: Send {
    fn name(&self) -> &str;

    /// Produce this cycle's records.
    ///
    /// # Errors
    /// Returns an error when the backing system cannot be read.
    fn refresh(&mut self) -> Result<SourceBatch>;

    /// Mark a previously returned record as withdrawn so later refreshes report it as
    /// eliminated instead of live.
    ///
    /// # Errors
    /// Returns an error when the source cannot record the withdrawal.
    fn withdraw(&mut self, record: WithdrawnRecord) -> Result<()>;
}

pub type SourceFactory = Box<dyn Fn() -> Result<Box<dyn IngestionSource>> + Send + Sync>;

/// Named ingestion source constructors, selected by configuration.
#[derive(Default)]
pub struct SourceRegistry {
    factories: BTreeMap<String, SourceFactory>,
}

impl SourceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns an error when `name` is already registered.
    pub fn register(&mut self, name: &str, factory: SourceFactory) -> Result<()> {
        if self.factories.contains_key(name) {
            return Err(anyhow!("ingestion source `{name}` is already registered"));
        }
        self.factories.insert(name.to_string(), factory);
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Build the configured sources in the order given.
    ///
    /// # Errors
    /// Returns an error for an unknown name or a failing factory.
    pub fn instantiate(&self, names: &[String]) -> Result<Vec<Box<dyn IngestionSource>>> {
        names
            .iter()
            .map(|name| {
                let factory = self.factories.get(name).ok_or_else(|| {
                    anyhow!(
                        "unknown ingestion source `{name}`; registered sources: {}",
                        self.names().collect::<Vec<_>>().join(", ")
                    )
                })?;
                factory().with_context(|| format!("failed to create ingestion source `{name}`"))
            })
            .collect()
    }
}

/// Move withdrawn records from the live lists into the eliminated lists.
fn apply_withdrawals(mut batch: SourceBatch, withdrawn: &[WithdrawnRecord]) -> SourceBatch {
    for record in withdrawn {
        let Some(items) = batch.live.get_mut(&record.kind) else {
            continue;
        };
        let Some(position) = items.iter().position(|item| item.id() == record.id) else {
            continue;
        };
        let item = items.remove(position);
        batch.push_eliminated(EliminatedLinkedItem::new(
            item,
            record.reason.clone(),
            record.elimination_kind,
        ));
    }
    batch
}

/// In-memory source, mostly for tests and embedding.
#[derive(Debug, Clone)]
pub struct StaticSource {
    name: String,
    batch: SourceBatch,
    withdrawn: Vec<WithdrawnRecord>,
}

impl StaticSource {
    #[must_use]
    pub fn new(name: &str, batch: SourceBatch) -> Self {
        Self { name: name.to_string(), batch, withdrawn: Vec::new() }
    }

    /// Registry factory producing a fresh copy of `batch` per instantiation.
    #[must_use]
    pub fn factory(name: &str, batch: SourceBatch) -> SourceFactory {
        let name = name.to_string();
        Box::new(move || -> Result<Box<dyn IngestionSource>> {
            Ok(Box::new(Self::new(&name, batch.clone())))
        })
    }

    #[must_use]
    pub fn withdrawn(&self) -> &[WithdrawnRecord] {
        &self.withdrawn
    }
}

impl IngestionSource for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn refresh(&mut self) -> Result<SourceBatch> {
        Ok(apply_withdrawals(self.batch.clone(), &self.withdrawn))
    }

    fn withdraw(&mut self, record: WithdrawnRecord) -> Result<()> {
        if !self.withdrawn.contains(&record) {
            self.withdrawn.push(record);
        }
        Ok(())
    }
}

/// Reads a JSON-encoded [`SourceBatch`] on every refresh.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    name: String,
    path: PathBuf,
    withdrawn: Vec<WithdrawnRecord>,
}

impl JsonFileSource {
    #[must_use]
    pub fn new(name: &str, path: PathBuf) -> Self {
        Self { name: name.to_string(), path, withdrawn: Vec::new() }
    }

    #[must_use]
    pub fn factory(name: &str, path: PathBuf) -> SourceFactory {
        let name = name.to_string();
        Box::new(move || -> Result<Box<dyn IngestionSource>> {
            Ok(Box::new(Self::new(&name, path.clone())))
        })
    }
}

impl IngestionSource for JsonFileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn refresh(&mut self) -> Result<SourceBatch> {
        let bytes = fs::read(&self.path)
            .with_context(|| format!("failed to read source file {}", self.path.display()))?;
        let batch: SourceBatch = serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse source file {}", self.path.display()))?;
        Ok(apply_withdrawals(batch, &self.withdrawn))
    }

    fn withdraw(&mut self, record: WithdrawnRecord) -> Result<()> {
        if !self.withdrawn.contains(&record) {
            self.withdrawn.push(record);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::{Duration, OffsetDateTime};
    use trace_kernel_core::{Item, LinkedItem};

    fn fixture_batch() -> SourceBatch {
        let mut batch = SourceBatch::new();
        for id in ["RISK-1", "RISK-2"] {
            batch.push_live(LinkedItem::new(Item::new(
                id,
                ItemKind::Risk,
                OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000),
            )));
        }
        batch
    }

    // Test IDs: TSRC-001
    #[test]
    fn withdrawn_records_come_back_eliminated() -> Result<()> {
        let mut source = StaticSource::new("risks", fixture_batch());
        source.withdraw(WithdrawnRecord {
            kind: ItemKind::Risk,
            id: "RISK-1".to_string(),
            reason: "linked item(s) SWR-1 are no longer part of the record set".to_string(),
            elimination_kind: EliminationKind::LinkedItemMissing,
        })?;

        let batch = source.refresh()?;

        let live = batch.live.get(&ItemKind::Risk).map(Vec::len);
        assert_eq!(live, Some(1));
        let eliminated = batch.eliminated.get(&ItemKind::Risk).cloned().unwrap_or_default();
        assert_eq!(eliminated.len(), 1);
        assert_eq!(eliminated[0].id(), "RISK-1");
        assert_eq!(eliminated[0].elimination_kind(), EliminationKind::LinkedItemMissing);
        assert_eq!(source.withdrawn().len(), 1);
        Ok(())
    }

    // Test IDs: TSRC-002
    #[test]
    fn registry_rejects_unknown_and_duplicate_names() -> Result<()> {
        let mut registry = SourceRegistry::new();
        registry.register("risks", StaticSource::factory("risks", fixture_batch()))?;

        let duplicate = registry.register(
            "risks",
            Box::new(|| -> Result<Box<dyn IngestionSource>> { Err(anyhow!("unused")) }),
        );
        assert!(duplicate.is_err());

        let Err(err) = registry.instantiate(&["risks".to_string(), "jira".to_string()]) else {
            return Err(anyhow!("expected unknown source to fail"));
        };
        assert!(err
            .to_string()
            .contains("unknown ingestion source `jira`; registered sources: risks"));

        let sources = registry.instantiate(&["risks".to_string()])?;
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].name(), "risks");
        Ok(())
    }
}
