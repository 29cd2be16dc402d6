use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::aggregator::RecordView;
use crate::model::{EliminatedLinkedItem, ExternalDependency, ItemKind, LinkedItem};
use crate::KernelError;

pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// Serialized form of a checkpoint. Field names are part of the file format.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CheckpointDocument {
    pub format_version: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default)]
    pub live: BTreeMap<ItemKind, Vec<LinkedItem>>,
    #[serde(default)]
    pub eliminated: BTreeMap<ItemKind, Vec<EliminatedLinkedItem>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<ExternalDependency>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RefreshSummary {
    pub replaced: usize,
    pub inserted: usize,
    pub removed: usize,
    /// Requested IDs found neither live nor in the checkpoint.
    pub absent: usize,
}

/// Frozen baseline of every record kind, refreshed only for explicitly listed IDs.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CheckpointStore {
    document: CheckpointDocument,
}

impl CheckpointStore {
    /// Freeze the current contents of `view`.
    #[must_use]
    pub fn capture<V: RecordView + ?Sized>(view: &V, created_at: OffsetDateTime) -> Self {
        let mut live = BTreeMap::new();
        let mut eliminated = BTreeMap::new();
        for kind in ItemKind::ALL {
            let records = view.get_all(kind);
            if !records.is_empty() {
                live.insert(kind, records.to_vec());
            }
            let removed = view.get_all_eliminated(kind);
            if !removed.is_empty() {
                eliminated.insert(kind, removed.to_vec());
            }
        }

        Self {
            document: CheckpointDocument {
                format_version: CHECKPOINT_FORMAT_VERSION,
                created_at,
                live,
                eliminated,
                dependencies: view.external_dependencies().to_vec(),
            },
        }
    }

    /// Deserialize and validate a checkpoint.
    ///
    /// # Errors
    /// Returns [`KernelError::Checkpoint`] when the document cannot be parsed or has an
    /// unsupported version, [`KernelError::Validation`] when a record is filed under the
    /// wrong kind, and [`KernelError::DuplicateId`] when an ID repeats within a kind.
    pub fn load(serialized: &str) -> Result<Self, KernelError> {
        let document: CheckpointDocument = serde_json::from_str(serialized)
            .map_err(|err| KernelError::Checkpoint(format!("invalid checkpoint JSON: {err}")))?;
        Self::from_document(document)
    }

    /// Validate an already deserialized checkpoint.
    ///
    /// # Errors
    /// See [`CheckpointStore::load`].
    pub fn from_document(document: CheckpointDocument) -> Result<Self, KernelError> {
        if document.format_version == 0 || document.format_version > CHECKPOINT_FORMAT_VERSION {
            return Err(KernelError::Checkpoint(format!(
                "unsupported checkpoint format version {}; supported range is \
                 1..={CHECKPOINT_FORMAT_VERSION}",
                document.format_version
            )));
        }

        for kind in ItemKind::ALL {
            let live = document.live.get(&kind).map(Vec::as_slice).unwrap_or_default();
            let eliminated = document
                .eliminated
                .get(&kind)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let mut seen = BTreeSet::new();
            let frozen = eliminated.iter().map(EliminatedLinkedItem::linked_item);
            for item in live.iter().chain(frozen) {
                if item.kind() != kind {
                    return Err(KernelError::Validation(format!(
                        "checkpoint files {} record `{}` under {kind}",
                        item.kind(),
                        item.id()
                    )));
                }
                if !seen.insert(item.id()) {
                    return Err(KernelError::DuplicateId { id: item.id().to_string(), kind });
                }
            }
        }
        for dependency in &document.dependencies {
            dependency.validate()?;
        }

        Ok(Self { document })
    }

    #[must_use]
    pub fn document(&self) -> &CheckpointDocument {
        &self.document
    }

    #[must_use]
    pub fn created_at(&self) -> OffsetDateTime {
        self.document.created_at
    }

    /// Serialize every live and eliminated list.
    ///
    /// # Errors
    /// Returns [`KernelError::Checkpoint`] when serialization fails.
    pub fn to_json(&self) -> Result<String, KernelError> {
        serde_json::to_string_pretty(&self.document).map_err(|err| {
            KernelError::Checkpoint(format!("failed to serialize checkpoint: {err}"))
        })
    }

    /// Resynchronize the listed IDs against live data. A live record replaces the frozen
    /// one in place or is appended when new; an ID no longer live is dropped from the
    /// frozen live list. Records are matched by ID within the listed kind only.
    /// Eliminated lists and external dependencies stay as captured.
    pub fn apply_selective_refresh<V: RecordView + ?Sized>(
        &mut self,
        ids_by_kind: &BTreeMap<ItemKind, Vec<String>>,
        live: &V,
    ) -> RefreshSummary {
        let mut summary = RefreshSummary::default();

        for (kind, ids) in ids_by_kind {
            let frozen = self.document.live.entry(*kind).or_default();
            for id in ids {
                let position = frozen.iter().position(|item| item.id() == id);
                match (live.get_by_kind_and_id(*kind, id), position) {
                    (Some(fresh), Some(index)) => {
                        frozen[index] = fresh.clone();
                        summary.replaced += 1;
                    }
                    (Some(fresh), None) => {
                        frozen.push(fresh.clone());
                        summary.inserted += 1;
                    }
                    (None, Some(index)) => {
                        frozen.remove(index);
                        summary.removed += 1;
                    }
                    (None, None) => summary.absent += 1,
                }
            }
            if frozen.is_empty() {
                self.document.live.remove(kind);
            }
        }

        tracing::debug!(
            replaced = summary.replaced,
            inserted = summary.inserted,
            removed = summary.removed,
            absent = summary.absent,
            "checkpoint selective refresh applied"
        );
        summary
    }
}

impl RecordView for CheckpointStore {
    fn get_all(&self, kind: ItemKind) -> &[LinkedItem] {
        self.document.live.get(&kind).map(Vec::as_slice).unwrap_or_default()
    }

    fn get_all_eliminated(&self, kind: ItemKind) -> &[EliminatedLinkedItem] {
        self.document.eliminated.get(&kind).map(Vec::as_slice).unwrap_or_default()
    }

    fn external_dependencies(&self) -> &[ExternalDependency] {
        &self.document.dependencies
    }
}
