use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::aggregator::RecordView;
use crate::model::{ItemKind, ItemLink, LinkType, LinkedItem};
use crate::KernelError;

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RawEntity {
    pub id: String,
    #[serde(default, alias = "title")]
    pub name: String,
    #[serde(default)]
    pub abbreviation: String,
}

/// A filter written either as one (comma separated) string or as a list.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum RawFilter {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RawTrace {
    pub target: String,
    #[serde(default)]
    pub forward: Option<RawFilter>,
    #[serde(default)]
    pub backward: Option<RawFilter>,
    #[serde(default)]
    pub link_type: Option<String>,
}

/// Trace configuration as written on disk, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RawTraceConfig {
    #[serde(default)]
    pub truth: Vec<RawEntity>,
    #[serde(default)]
    pub documents: Vec<RawEntity>,
    #[serde(default, with = "ordered_traces")]
    pub traces: Vec<(String, Vec<RawTrace>)>,
}

/// Keeps the `traces` map in file order.
mod ordered_traces {
    use std::fmt;

    use serde::de::{MapAccess, Visitor};
    use serde::ser::SerializeMap;
    use serde::{Deserializer, Serializer};

    use super::RawTrace;

    type Groups = Vec<(String, Vec<RawTrace>)>;

    pub(super) fn serialize<S: Serializer>(
        groups: &[(String, Vec<RawTrace>)],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(groups.len()))?;
        for (source, traces) in groups {
            map.serialize_entry(source, traces)?;
        }
        map.end()
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Groups, D::Error> {
        struct GroupsVisitor;

        impl<'de> Visitor<'de> for GroupsVisitor {
            type Value = Groups;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map from truth entity to its list of traces")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Groups, A::Error> {
                let mut groups = Vec::new();
                while let Some(entry) = access.next_entry::<String, Vec<RawTrace>>()? {
                    groups.push(entry);
                }
                Ok(groups)
            }
        }

        deserializer.deserialize_map(GroupsVisitor)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TraceEntityKind {
    Truth(ItemKind),
    Document,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TraceEntity {
    pub id: String,
    pub name: String,
    pub abbreviation: String,
    pub kind: TraceEntityKind,
}

impl TraceEntity {
    #[must_use]
    pub fn record_kind(&self) -> Option<ItemKind> {
        match self.kind {
            TraceEntityKind::Truth(kind) => Some(kind),
            TraceEntityKind::Document => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TraceMode {
    Complete,
    Optional,
    Categories(BTreeSet<String>),
}

impl TraceMode {
    /// Interpret a configured filter. Absent or empty means complete, a leading `ALL`
    /// means complete, a leading `OPTIONAL` means no requirement, anything else is a
    /// category list.
    ///
    /// # Errors
    /// Returns [`KernelError::Config`] naming `key` when the category list has blank entries.
    pub fn from_raw(raw: Option<&RawFilter>, key: &str) -> Result<Self, KernelError> {
        let values = match raw {
            None => return Ok(Self::Complete),
            Some(RawFilter::One(value)) => {
                value.split(',').map(|part| part.trim().to_string()).collect::<Vec<_>>()
            }
            Some(RawFilter::Many(values)) => {
                values.iter().map(|value| value.trim().to_string()).collect::<Vec<_>>()
            }
        };

        let Some(first) = values.first() else {
            return Ok(Self::Complete);
        };
        if first.eq_ignore_ascii_case("ALL") {
            return Ok(Self::Complete);
        }
        if first.eq_ignore_ascii_case("OPTIONAL") {
            return Ok(Self::Optional);
        }
        if values.iter().any(String::is_empty) {
            return Err(KernelError::config(key, "category list contains an empty entry"));
        }

        Ok(Self::Categories(values.into_iter().collect()))
    }

    /// Whether a record with `category` takes part in this trace.
    #[must_use]
    pub fn in_scope(&self, category: &str) -> bool {
        match self {
            Self::Complete | Self::Optional => true,
            Self::Categories(selected) => selected.contains(category),
        }
    }

    #[must_use]
    pub fn reports_missing(&self) -> bool {
        !matches!(self, Self::Optional)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TraceSpecification {
    pub source: String,
    pub target: String,
    pub forward: TraceMode,
    /// Only meaningful for record targets.
    pub backward: TraceMode,
    pub link_type: Option<LinkType>,
}

/// Validated trace configuration. Entities and trace groups keep their configured order.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct TraceConfig {
    entities: Vec<TraceEntity>,
    entity_index: BTreeMap<String, usize>,
    traces: Vec<(String, Vec<TraceSpecification>)>,
    trace_index: BTreeMap<String, usize>,
}

impl TraceConfig {
    /// Validate a raw configuration.
    ///
    /// # Errors
    /// Returns [`KernelError::Config`] naming the offending key when an entity is
    /// malformed or not unique, when a trace refers to an unknown entity, or when a
    /// filter or link type cannot be parsed.
    pub fn from_raw(raw: &RawTraceConfig) -> Result<Self, KernelError> {
        let mut config = Self::default();

        for (position, entity) in raw.truth.iter().enumerate() {
            let key = format!("truth[{position}]");
            let Some(kind) = ItemKind::parse(&entity.id) else {
                return Err(KernelError::config(
                    format!("{key}.id"),
                    format!("`{}` does not name a record kind", entity.id),
                ));
            };
            if let Some(existing) =
                config.entities.iter().find(|other| other.record_kind() == Some(kind))
            {
                return Err(KernelError::config(
                    format!("{key}.id"),
                    format!("record kind {kind} is already configured as `{}`", existing.id),
                ));
            }
            config.add_entity(entity, TraceEntityKind::Truth(kind), &key)?;
        }

        for (position, entity) in raw.documents.iter().enumerate() {
            let key = format!("documents[{position}]");
            config.add_entity(entity, TraceEntityKind::Document, &key)?;
        }

        for (source_handle, raw_traces) in &raw.traces {
            let group_key = format!("traces.{source_handle}");
            let Some(source) = config.resolve(source_handle).cloned() else {
                return Err(KernelError::config(group_key, "unknown trace source entity"));
            };
            if source.record_kind().is_none() {
                return Err(KernelError::config(group_key, "trace sources must be truth entities"));
            }
            if config.trace_index.contains_key(&source.id) {
                return Err(KernelError::config(
                    group_key,
                    format!("traces for `{}` are configured more than once", source.id),
                ));
            }

            let mut specifications: Vec<TraceSpecification> = Vec::new();
            for (position, raw_trace) in raw_traces.iter().enumerate() {
                let key = format!("{group_key}[{position}]");
                let specification =
                    config.specification(&source, raw_trace, &key, &specifications)?;
                specifications.push(specification);
            }

            config.trace_index.insert(source.id.clone(), config.traces.len());
            config.traces.push((source.id, specifications));
        }

        Ok(config)
    }

    fn add_entity(
        &mut self,
        raw: &RawEntity,
        kind: TraceEntityKind,
        key: &str,
    ) -> Result<(), KernelError> {
        let id = raw.id.trim();
        if id.is_empty() {
            return Err(KernelError::config(format!("{key}.id"), "entity id MUST be non-empty"));
        }
        let name = if raw.name.trim().is_empty() { id } else { raw.name.trim() };
        let abbreviation =
            if raw.abbreviation.trim().is_empty() { id } else { raw.abbreviation.trim() };

        for existing in &self.entities {
            let clash = if existing.id == id {
                Some(("id", id))
            } else if existing.name == name {
                Some(("name", name))
            } else if existing.abbreviation == abbreviation {
                Some(("abbreviation", abbreviation))
            } else {
                None
            };
            if let Some((field, value)) = clash {
                return Err(KernelError::config(
                    format!("{key}.{field}"),
                    format!("duplicate {field} `{value}` (already used by `{}`)", existing.id),
                ));
            }
        }

        self.entity_index.insert(id.to_string(), self.entities.len());
        self.entities.push(TraceEntity {
            id: id.to_string(),
            name: name.to_string(),
            abbreviation: abbreviation.to_string(),
            kind,
        });
        Ok(())
    }

    fn specification(
        &self,
        source: &TraceEntity,
        raw: &RawTrace,
        key: &str,
        earlier: &[TraceSpecification],
    ) -> Result<TraceSpecification, KernelError> {
        let Some(target) = self.resolve(&raw.target) else {
            return Err(KernelError::config(
                format!("{key}.target"),
                format!("unknown trace target `{}`", raw.target),
            ));
        };
        if target.id == source.id {
            return Err(KernelError::config(
                format!("{key}.target"),
                "an entity cannot trace to itself",
            ));
        }
        if earlier.iter().any(|spec| spec.target == target.id) {
            return Err(KernelError::config(
                format!("{key}.target"),
                format!("duplicate trace target `{}`", target.id),
            ));
        }

        let is_document = target.record_kind().is_none();
        if is_document && raw.backward.is_some() {
            return Err(KernelError::config(
                format!("{key}.backward"),
                "backward filters only apply to record targets",
            ));
        }
        if is_document && raw.link_type.is_some() {
            return Err(KernelError::config(
                format!("{key}.link_type"),
                "link types only apply to record targets",
            ));
        }

        let link_type = raw
            .link_type
            .as_deref()
            .map(|value| LinkType::parse(value, &format!("{key}.link_type")))
            .transpose()?;

        Ok(TraceSpecification {
            source: source.id.clone(),
            target: target.id.clone(),
            forward: TraceMode::from_raw(raw.forward.as_ref(), &format!("{key}.forward"))?,
            backward: TraceMode::from_raw(raw.backward.as_ref(), &format!("{key}.backward"))?,
            link_type,
        })
    }

    #[must_use]
    pub fn entities(&self) -> &[TraceEntity] {
        &self.entities
    }

    #[must_use]
    pub fn entity(&self, id: &str) -> Option<&TraceEntity> {
        self.entity_index.get(id).map(|index| &self.entities[*index])
    }

    /// Find an entity by id, then by name, then by abbreviation.
    #[must_use]
    pub fn resolve(&self, handle: &str) -> Option<&TraceEntity> {
        let handle = handle.trim();
        self.entity(handle)
            .or_else(|| self.entities.iter().find(|entity| entity.name == handle))
            .or_else(|| self.entities.iter().find(|entity| entity.abbreviation == handle))
    }

    #[must_use]
    pub fn specifications(&self, source_id: &str) -> &[TraceSpecification] {
        self.trace_index
            .get(source_id)
            .map(|index| self.traces[*index].1.as_slice())
            .unwrap_or_default()
    }

    /// Truth entities with configured traces, in configured order.
    pub fn trace_sources(&self) -> impl Iterator<Item = &str> {
        self.traces.iter().map(|(source, _)| source.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TraceTag {
    pub entity_id: String,
    pub item_id: String,
}

/// Trace tags found in generated documents, keyed by document entity id.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct DocumentTraces {
    tags: BTreeMap<String, Vec<TraceTag>>,
}

impl DocumentTraces {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `document` references record `item_id` of `entity`. Both may be
    /// named by id, name or abbreviation.
    ///
    /// # Errors
    /// Returns [`KernelError::Config`] when the document or entity is unknown, or when the
    /// tag carries no item id.
    pub fn add_trace_tag(
        &mut self,
        config: &TraceConfig,
        document: &str,
        entity: &str,
        item_id: &str,
    ) -> Result<(), KernelError> {
        let key = format!("documents.{document}.tags");
        let Some(document) = config.resolve(document).filter(|found| found.record_kind().is_none())
        else {
            return Err(KernelError::config(key, "unknown document entity"));
        };
        let Some(entity) = config.resolve(entity).filter(|found| found.record_kind().is_some())
        else {
            return Err(KernelError::config(key, format!("unknown truth entity `{entity}`")));
        };
        let item_id = item_id.trim();
        if item_id.is_empty() {
            return Err(KernelError::config(key, "trace tag is missing its ID parameter"));
        }

        self.tags.entry(document.id.clone()).or_default().push(TraceTag {
            entity_id: entity.id.clone(),
            item_id: item_id.to_string(),
        });
        Ok(())
    }

    #[must_use]
    pub fn tags_for(&self, document_id: &str) -> &[TraceTag] {
        self.tags.get(document_id).map(Vec::as_slice).unwrap_or_default()
    }

    #[must_use]
    pub fn tag_count(&self) -> usize {
        self.tags.values().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    Missing,
    Extra,
    PossiblyMissing,
    PossiblyExtra,
}

impl IssueType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Extra => "extra",
            Self::PossiblyMissing => "possibly_missing",
            Self::PossiblyExtra => "possibly_extra",
        }
    }
}

impl Display for IssueType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One deviation between expected and realized links.
///
/// For `Missing` and `PossiblyMissing`, `record_id` is the record lacking links. For
/// `Extra`, it is the referenced truth id and `linked_id` names the dependent record
/// holding the reference, when there is one. `truth_eliminated` marks an `Extra` whose
/// truth record was filtered or cascaded out rather than never known.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TraceIssue {
    pub source: String,
    pub target: String,
    pub record_id: String,
    pub issue_type: IssueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_id: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truth_eliminated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TraceColumn {
    pub target: String,
    /// Matched record ids, one row per truth record.
    pub rows: Vec<Vec<String>>,
    pub issues: Vec<TraceIssue>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TraceMatrix {
    pub source: String,
    pub truth_ids: Vec<String>,
    pub columns: Vec<TraceColumn>,
}

impl TraceMatrix {
    #[must_use]
    pub fn column(&self, target: &str) -> Option<&TraceColumn> {
        self.columns.iter().find(|column| column.target == target)
    }

    pub fn issues(&self) -> impl Iterator<Item = &TraceIssue> {
        self.columns.iter().flat_map(|column| column.issues.iter())
    }
}

fn push_issue(issues: &mut Vec<TraceIssue>, issue: TraceIssue) {
    if !issues.contains(&issue) {
        issues.push(issue);
    }
}

fn link_matches(link: &ItemLink, expected: Option<LinkType>) -> bool {
    match expected {
        Some(link_type) => link.link_type == link_type,
        None => true,
    }
}

/// Read-only trace analysis over a settled record set.
#[derive(Debug)]
pub struct TraceAnalyzer<'a, V: RecordView + ?Sized> {
    config: &'a TraceConfig,
    records: &'a V,
    documents: &'a DocumentTraces,
}

impl<'a, V: RecordView + ?Sized> TraceAnalyzer<'a, V> {
    #[must_use]
    pub fn new(config: &'a TraceConfig, records: &'a V, documents: &'a DocumentTraces) -> Self {
        Self { config, records, documents }
    }

    /// Analyze every configured trace of one truth entity.
    ///
    /// # Errors
    /// Returns [`KernelError::NotFound`] when `source` is not a configured truth entity.
    pub fn analyze(&self, source: &str) -> Result<TraceMatrix, KernelError> {
        let Some(entity) = self.config.resolve(source) else {
            return Err(KernelError::NotFound(format!("trace entity `{source}`")));
        };
        let Some(source_kind) = entity.record_kind() else {
            return Err(KernelError::NotFound(format!("truth entity `{source}`")));
        };
        let truth = self.records.get_all(source_kind);

        let mut columns = Vec::new();
        for spec in self.config.specifications(&entity.id) {
            let Some(target) = self.config.entity(&spec.target) else {
                return Err(KernelError::NotFound(format!("trace entity `{}`", spec.target)));
            };
            let column = match target.record_kind() {
                None => self.document_column(spec, source_kind, truth),
                Some(target_kind) => self.record_column(spec, source_kind, truth, target_kind),
            };
            columns.push(column);
        }

        Ok(TraceMatrix {
            source: entity.id.clone(),
            truth_ids: truth.iter().map(|record| record.id().to_string()).collect(),
            columns,
        })
    }

    /// Analyze every truth entity with configured traces, in configured order.
    ///
    /// # Errors
    /// Propagates [`TraceAnalyzer::analyze`] failures.
    pub fn analyze_all(&self) -> Result<Vec<TraceMatrix>, KernelError> {
        self.config.trace_sources().map(|source| self.analyze(source)).collect()
    }

    fn issue(spec: &TraceSpecification, record_id: &str, issue_type: IssueType) -> TraceIssue {
        TraceIssue {
            source: spec.source.clone(),
            target: spec.target.clone(),
            record_id: record_id.to_string(),
            issue_type,
            linked_id: None,
            truth_eliminated: false,
        }
    }

    fn document_column(
        &self,
        spec: &TraceSpecification,
        source_kind: ItemKind,
        truth: &[LinkedItem],
    ) -> TraceColumn {
        let tags = self
            .documents
            .tags_for(&spec.target)
            .iter()
            .filter(|tag| tag.entity_id == spec.source)
            .collect::<Vec<_>>();
        let mut issues = Vec::new();
        let mut rows = Vec::with_capacity(truth.len());

        for record in truth {
            if !spec.forward.in_scope(record.category()) {
                rows.push(Vec::new());
            } else if tags.iter().any(|tag| tag.item_id == record.id()) {
                rows.push(vec![record.id().to_string()]);
            } else {
                if spec.forward.reports_missing() {
                    push_issue(&mut issues, Self::issue(spec, record.id(), IssueType::Missing));
                }
                rows.push(Vec::new());
            }
        }

        for tag in tags {
            if truth.iter().any(|record| record.id() == tag.item_id) {
                continue;
            }
            let mut issue = Self::issue(spec, &tag.item_id, IssueType::Extra);
            issue.truth_eliminated =
                self.records.get_eliminated_by_kind_and_id(source_kind, &tag.item_id).is_some();
            push_issue(&mut issues, issue);
        }

        TraceColumn { target: spec.target.clone(), rows, issues }
    }

    fn record_column(
        &self,
        spec: &TraceSpecification,
        source_kind: ItemKind,
        truth: &[LinkedItem],
        target_kind: ItemKind,
    ) -> TraceColumn {
        let mut issues = Vec::new();
        let mut rows = Vec::with_capacity(truth.len());

        for record in truth {
            if !spec.forward.in_scope(record.category()) {
                rows.push(Vec::new());
                continue;
            }
            let mut matched: Vec<String> = Vec::new();
            for link in record.links.iter().filter(|link| link_matches(link, spec.link_type)) {
                if self.records.get_by_kind_and_id(target_kind, &link.target_id).is_some()
                    && !matched.contains(&link.target_id)
                {
                    matched.push(link.target_id.clone());
                }
            }
            // A truth record without family may be a root or leaf of the hierarchy.
            if matched.is_empty() && spec.forward.reports_missing() {
                push_issue(&mut issues, Self::issue(spec, record.id(), IssueType::PossiblyMissing));
            }
            rows.push(matched);
        }

        let back_type = spec.link_type.map(LinkType::complement);
        for dependent in self.records.get_all(target_kind) {
            let mut family = 0_usize;
            for link in dependent.links.iter().filter(|link| link_matches(link, back_type)) {
                if self.records.get_by_kind_and_id(source_kind, &link.target_id).is_some() {
                    family += 1;
                    continue;
                }
                let truth_eliminated = self
                    .records
                    .get_eliminated_by_kind_and_id(source_kind, &link.target_id)
                    .is_some();
                if !truth_eliminated
                    && (self.records.get_by_id(&link.target_id).is_some()
                        || self.records.get_eliminated_by_id(&link.target_id).is_some())
                {
                    continue;
                }
                let mut issue = Self::issue(spec, &link.target_id, IssueType::Extra);
                issue.linked_id = Some(dependent.id().to_string());
                issue.truth_eliminated = truth_eliminated;
                push_issue(&mut issues, issue);
            }

            if family == 0
                && spec.backward.reports_missing()
                && spec.backward.in_scope(dependent.category())
            {
                push_issue(
                    &mut issues,
                    Self::issue(spec, dependent.id(), IssueType::PossiblyMissing),
                );
            }
        }

        TraceColumn { target: spec.target.clone(), rows, issues }
    }
}
