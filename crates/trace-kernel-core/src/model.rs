use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::KernelError;

/// Lowercases a configuration token and drops `_`, `-` and spaces so that
/// `SoftwareRequirement`, `software_requirement` and `software-requirement` compare equal.
pub(crate) fn normalize_token(value: &str) -> String {
    value
        .trim()
        .chars()
        .filter(|ch| !matches!(ch, '_' | '-' | ' '))
        .map(|ch| ch.to_ascii_lowercase())
        .collect()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    SystemRequirement,
    SoftwareRequirement,
    DocumentationRequirement,
    DocContent,
    SoftwareSystemTest,
    UnitTest,
    Anomaly,
    Soup,
    Risk,
    TestResult,
}

impl ItemKind {
    pub const ALL: [Self; 10] = [
        Self::SystemRequirement,
        Self::SoftwareRequirement,
        Self::DocumentationRequirement,
        Self::DocContent,
        Self::SoftwareSystemTest,
        Self::UnitTest,
        Self::Anomaly,
        Self::Soup,
        Self::Risk,
        Self::TestResult,
    ];

    /// Search order used by lookups that do not name a kind. The first kind holding
    /// a matching ID wins.
    pub const LOOKUP_ORDER: [Self; 10] = [
        Self::SoftwareRequirement,
        Self::SystemRequirement,
        Self::DocumentationRequirement,
        Self::DocContent,
        Self::SoftwareSystemTest,
        Self::UnitTest,
        Self::Anomaly,
        Self::Soup,
        Self::Risk,
        Self::TestResult,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SystemRequirement => "system_requirement",
            Self::SoftwareRequirement => "software_requirement",
            Self::DocumentationRequirement => "documentation_requirement",
            Self::DocContent => "doc_content",
            Self::SoftwareSystemTest => "software_system_test",
            Self::UnitTest => "unit_test",
            Self::Anomaly => "anomaly",
            Self::Soup => "soup",
            Self::Risk => "risk",
            Self::TestResult => "test_result",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let wanted = normalize_token(value);
        Self::ALL.into_iter().find(|kind| normalize_token(kind.as_str()) == wanted)
    }
}

impl Display for ItemKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    Parent,
    Child,
    Related,
    Tests,
    TestedBy,
    Predecessor,
    Successor,
    Duplicate,
    Affects,
    AffectedBy,
    Risk,
    RiskControl,
    DocumentedBy,
    Doc,
    UnitTests,
    UnitTest,
    Result,
    ResultOf,
    None,
}

impl LinkType {
    pub const ALL: [Self; 19] = [
        Self::Parent,
        Self::Child,
        Self::Related,
        Self::Tests,
        Self::TestedBy,
        Self::Predecessor,
        Self::Successor,
        Self::Duplicate,
        Self::Affects,
        Self::AffectedBy,
        Self::Risk,
        Self::RiskControl,
        Self::DocumentedBy,
        Self::Doc,
        Self::UnitTests,
        Self::UnitTest,
        Self::Result,
        Self::ResultOf,
        Self::None,
    ];

    /// Link type expected on the reverse edge. `None` maps to itself and never
    /// produces a back-link.
    #[must_use]
    pub fn complement(self) -> Self {
        match self {
            Self::Parent => Self::Child,
            Self::Child => Self::Parent,
            Self::Related => Self::Related,
            Self::Tests => Self::TestedBy,
            Self::TestedBy => Self::Tests,
            Self::Predecessor => Self::Successor,
            Self::Successor => Self::Predecessor,
            Self::Duplicate => Self::Duplicate,
            Self::Affects => Self::AffectedBy,
            Self::AffectedBy => Self::Affects,
            Self::Risk => Self::RiskControl,
            Self::RiskControl => Self::Risk,
            Self::DocumentedBy => Self::Doc,
            Self::Doc => Self::DocumentedBy,
            Self::UnitTests => Self::UnitTest,
            Self::UnitTest => Self::UnitTests,
            Self::Result => Self::ResultOf,
            Self::ResultOf => Self::Result,
            Self::None => Self::None,
        }
    }

    #[must_use]
    pub fn is_pairable(self) -> bool {
        self != Self::None
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Parent => "parent",
            Self::Child => "child",
            Self::Related => "related",
            Self::Tests => "tests",
            Self::TestedBy => "tested_by",
            Self::Predecessor => "predecessor",
            Self::Successor => "successor",
            Self::Duplicate => "duplicate",
            Self::Affects => "affects",
            Self::AffectedBy => "affected_by",
            Self::Risk => "risk",
            Self::RiskControl => "risk_control",
            Self::DocumentedBy => "documented_by",
            Self::Doc => "doc",
            Self::UnitTests => "unit_tests",
            Self::UnitTest => "unit_test",
            Self::Result => "result",
            Self::ResultOf => "result_of",
            Self::None => "none",
        }
    }

    /// Parse a configured link type name, ignoring case, `_` and `-`.
    ///
    /// # Errors
    /// Returns [`KernelError::Config`] naming `key` when the value is not a known link type.
    pub fn parse(value: &str, key: &str) -> Result<Self, KernelError> {
        let wanted = normalize_token(value);
        Self::ALL
            .into_iter()
            .find(|link_type| normalize_token(link_type.as_str()) == wanted)
            .ok_or_else(|| KernelError::config(key, format!("unknown link type `{value}`")))
    }
}

impl Display for LinkType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Item {
    pub id: String,
    pub kind: ItemKind,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub revision: String,
    #[serde(default)]
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
    #[serde(default)]
    pub link: Option<String>,
}

impl Item {
    #[must_use]
    pub fn new(id: impl Into<String>, kind: ItemKind, last_updated: OffsetDateTime) -> Self {
        Self {
            id: id.into(),
            kind,
            title: String::new(),
            category: String::new(),
            revision: String::new(),
            status: String::new(),
            last_updated,
            link: None,
        }
    }

    /// Validate the structural rules every ingested record must satisfy.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when the ID is empty or contains whitespace,
    /// or when an external link is present but blank.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.id.trim().is_empty() {
            return Err(KernelError::Validation(format!(
                "{} record id MUST be non-empty",
                self.kind
            )));
        }

        if self.id.chars().any(char::is_whitespace) {
            return Err(KernelError::Validation(format!(
                "record id `{}` MUST NOT contain whitespace",
                self.id
            )));
        }

        if let Some(link) = &self.link {
            if link.trim().is_empty() {
                return Err(KernelError::Validation(format!(
                    "record `{}` has an empty external link",
                    self.id
                )));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ItemLink {
    pub target_id: String,
    pub link_type: LinkType,
}

impl ItemLink {
    #[must_use]
    pub fn new(target_id: impl Into<String>, link_type: LinkType) -> Self {
        Self { target_id: target_id.into(), link_type }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LinkedItem {
    pub item: Item,
    #[serde(default)]
    pub links: Vec<ItemLink>,
}

impl LinkedItem {
    #[must_use]
    pub fn new(item: Item) -> Self {
        Self { item, links: Vec::new() }
    }

    #[must_use]
    pub fn with_link(mut self, target_id: impl Into<String>, link_type: LinkType) -> Self {
        self.links.push(ItemLink::new(target_id, link_type));
        self
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.item.id
    }

    #[must_use]
    pub fn kind(&self) -> ItemKind {
        self.item.kind
    }

    #[must_use]
    pub fn category(&self) -> &str {
        &self.item.category
    }

    #[must_use]
    pub fn has_link(&self, target_id: &str, link_type: LinkType) -> bool {
        self.links.iter().any(|link| link.target_id == target_id && link.link_type == link_type)
    }

    /// Remove every link toward `target_id` and return how many were dropped.
    pub fn remove_links_to(&mut self, target_id: &str) -> usize {
        let before = self.links.len();
        self.links.retain(|link| link.target_id != target_id);
        before - self.links.len()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EliminationKind {
    FilteredOut,
    LinkedItemMissing,
    IgnoredLinkTarget,
}

impl EliminationKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FilteredOut => "filtered_out",
            Self::LinkedItemMissing => "linked_item_missing",
            Self::IgnoredLinkTarget => "ignored_link_target",
        }
    }
}

impl Display for EliminationKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frozen copy of a record at the moment it left the live set.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EliminatedLinkedItem {
    item: LinkedItem,
    reason: String,
    elimination_kind: EliminationKind,
}

impl EliminatedLinkedItem {
    #[must_use]
    pub fn new(
        item: LinkedItem,
        reason: impl Into<String>,
        elimination_kind: EliminationKind,
    ) -> Self {
        Self { item, reason: reason.into(), elimination_kind }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        self.item.id()
    }

    #[must_use]
    pub fn kind(&self) -> ItemKind {
        self.item.kind()
    }

    #[must_use]
    pub fn linked_item(&self) -> &LinkedItem {
        &self.item
    }

    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }

    #[must_use]
    pub fn elimination_kind(&self) -> EliminationKind {
        self.elimination_kind
    }
}

/// Third-party package a source reports alongside its records. Dependencies carry
/// no links and take no part in consistency enforcement.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ExternalDependency {
    pub name: String,
    #[serde(default)]
    pub version: String,
    /// Set when the source saw more than one version of the package requested.
    #[serde(default)]
    pub conflict: bool,
}

impl ExternalDependency {
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self { name: name.into(), version: version.into(), conflict: false }
    }

    /// # Errors
    /// Returns [`KernelError::Validation`] when the package name is blank.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.name.trim().is_empty() {
            return Err(KernelError::Validation(format!(
                "external dependency name MUST be non-empty (version `{}`)",
                self.version
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use time::Duration;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    // Test IDs: TMOD-001
    #[test]
    fn complement_is_total_and_involutive() {
        for link_type in LinkType::ALL {
            assert_eq!(link_type.complement().complement(), link_type, "{link_type}");
        }
        assert_eq!(LinkType::None.complement(), LinkType::None);
        assert!(!LinkType::None.is_pairable());
    }

    // Test IDs: TMOD-002
    #[test]
    fn only_related_duplicate_and_none_are_self_paired() {
        let self_paired = LinkType::ALL
            .into_iter()
            .filter(|link_type| link_type.complement() == *link_type)
            .collect::<Vec<_>>();
        assert_eq!(self_paired, vec![LinkType::Related, LinkType::Duplicate, LinkType::None]);
        assert_eq!(LinkType::DocumentedBy.complement(), LinkType::Doc);
        assert_eq!(LinkType::UnitTests.complement(), LinkType::UnitTest);
    }

    // Test IDs: TMOD-003
    #[test]
    fn link_type_parse_ignores_case_and_separators() {
        for raw in ["TestedBy", "tested_by", "TESTED-BY"] {
            match LinkType::parse(raw, "traces.x[0].link_type") {
                Ok(parsed) => assert_eq!(parsed, LinkType::TestedBy),
                Err(err) => panic!("expected {raw} to parse: {err}"),
            }
        }

        let Err(err) = LinkType::parse("sibling", "traces.x[0].link_type") else {
            panic!("expected unknown link type to fail");
        };
        assert_eq!(
            err,
            KernelError::Config {
                key: "traces.x[0].link_type".to_string(),
                message: "unknown link type `sibling`".to_string(),
            }
        );
    }

    // Test IDs: TMOD-004
    #[test]
    fn item_kind_parse_accepts_display_and_snake_case_names() {
        assert_eq!(ItemKind::parse("SoftwareRequirement"), Some(ItemKind::SoftwareRequirement));
        assert_eq!(ItemKind::parse("software_requirement"), Some(ItemKind::SoftwareRequirement));
        assert_eq!(ItemKind::parse("SOUP"), Some(ItemKind::Soup));
        assert_eq!(ItemKind::parse("Requirement"), None);
    }

    // Test IDs: TMOD-005
    #[test]
    fn validate_rejects_blank_and_whitespace_ids() {
        let mut item = Item::new("  ", ItemKind::Risk, fixture_time());
        assert!(matches!(item.validate(), Err(KernelError::Validation(_))));

        item.id = "RISK 1".to_string();
        let Err(err) = item.validate() else {
            panic!("expected whitespace id to fail");
        };
        assert!(err.to_string().contains("MUST NOT contain whitespace"));

        item.id = "RISK-1".to_string();
        item.link = Some(String::new());
        assert!(matches!(item.validate(), Err(KernelError::Validation(_))));

        item.link = Some("https://tracker.example/RISK-1".to_string());
        assert_eq!(item.validate(), Ok(()));
    }

    // Test IDs: TMOD-006
    #[test]
    fn test_results_parse_and_sort_last_in_lookup_order() {
        assert_eq!(ItemKind::parse("TestResult"), Some(ItemKind::TestResult));
        assert_eq!(ItemKind::parse("test-result"), Some(ItemKind::TestResult));
        assert_eq!(ItemKind::LOOKUP_ORDER.last(), Some(&ItemKind::TestResult));
        assert_eq!(LinkType::ResultOf.complement(), LinkType::Result);
    }

    // Test IDs: TMOD-007
    #[test]
    fn eliminated_item_serializes_kind_and_reason() {
        let record =
            LinkedItem::new(Item::new("SWR-9", ItemKind::SoftwareRequirement, fixture_time()));
        let eliminated =
            EliminatedLinkedItem::new(record, "filtered by release", EliminationKind::FilteredOut);

        let json = match serde_json::to_value(&eliminated) {
            Ok(value) => value,
            Err(err) => panic!("failed to serialize eliminated item: {err}"),
        };
        assert_eq!(json["elimination_kind"], "filtered_out");
        assert_eq!(json["reason"], "filtered by release");
        assert_eq!(json["item"]["item"]["kind"], "software_requirement");
        assert_eq!(json["item"]["item"]["last_updated"], "2023-11-14T22:13:20Z");
    }

    // Test IDs: TMOD-009
    #[test]
    fn external_dependency_requires_a_name_and_defaults_optional_fields() {
        let parsed: ExternalDependency = match serde_json::from_str(r#"{"name":"openssl"}"#) {
            Ok(dependency) => dependency,
            Err(err) => panic!("failed to parse dependency: {err}"),
        };
        assert_eq!(parsed, ExternalDependency::new("openssl", ""));
        assert_eq!(parsed.validate(), Ok(()));

        let blank = ExternalDependency { conflict: true, ..ExternalDependency::new(" ", "1.0") };
        assert!(matches!(blank.validate(), Err(KernelError::Validation(_))));
    }

    // Test IDs: TMOD-008
    proptest! {
        #[test]
        fn property_complement_round_trips_for_every_variant(
            index in 0_usize..LinkType::ALL.len()
        ) {
            let link_type = LinkType::ALL[index];
            prop_assert_eq!(link_type.complement().complement(), link_type);
            prop_assert_eq!(LinkType::parse(link_type.as_str(), "key"), Ok(link_type));
        }
    }
}
