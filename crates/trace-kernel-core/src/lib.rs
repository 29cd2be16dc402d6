mod aggregator;
mod checkpoint;
mod consistency;
mod model;
mod trace;

pub use aggregator::{RecordAggregator, RecordView, SourceBatch};
pub use checkpoint::{
    CheckpointDocument, CheckpointStore, RefreshSummary, CHECKPOINT_FORMAT_VERSION,
};
pub use consistency::{
    enforce_link_consistency, ChangeLog, ConsistencyOptions, Elimination, LinkChange,
};
pub use model::{
    EliminatedLinkedItem, EliminationKind, ExternalDependency, Item, ItemKind, ItemLink, LinkType,
    LinkedItem,
};
pub use trace::{
    DocumentTraces, IssueType, RawEntity, RawFilter, RawTrace, RawTraceConfig, TraceAnalyzer,
    TraceColumn, TraceConfig, TraceEntity, TraceEntityKind, TraceIssue, TraceMatrix, TraceMode,
    TraceSpecification, TraceTag,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error("configuration error at `{key}`: {message}")]
    Config { key: String, message: String },
    #[error(
        "data integrity error: {kind} record `{source_id}` links to `{target_id}` \
         ({link_type}) which is neither live nor eliminated"
    )]
    DataIntegrity { source_id: String, kind: ItemKind, target_id: String, link_type: LinkType },
    #[error("duplicate id `{id}` within {kind} records")]
    DuplicateId { id: String, kind: ItemKind },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
}

impl KernelError {
    pub(crate) fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config { key: key.into(), message: message.into() }
    }
}
