use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::aggregator::{RecordAggregator, RecordView};
use crate::model::{EliminationKind, ItemKind, ItemLink, LinkType};
use crate::KernelError;

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ConsistencyOptions {
    /// Link targets that are known to be outside the record set. Links to them are
    /// dropped instead of being reported as integrity errors.
    #[serde(default)]
    pub ignored_targets: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LinkChange {
    pub kind: ItemKind,
    pub item_id: String,
    pub target_id: String,
    pub link_type: LinkType,
    pub pass: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Elimination {
    pub kind: ItemKind,
    pub item_id: String,
    pub elimination_kind: EliminationKind,
    pub reason: String,
    pub pass: usize,
}

/// What one run of [`enforce_link_consistency`] changed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChangeLog {
    pub passes: usize,
    pub added_links: Vec<LinkChange>,
    pub removed_links: Vec<LinkChange>,
    pub eliminations: Vec<Elimination>,
}

impl ChangeLog {
    /// True when the run left every record untouched.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.added_links.is_empty() && self.removed_links.is_empty() && self.eliminations.is_empty()
    }
}

#[derive(Debug, Default)]
struct LostReferences {
    eliminated: Vec<String>,
    ignored: Vec<String>,
}

impl LostReferences {
    fn elimination(&self) -> (EliminationKind, String) {
        if self.eliminated.is_empty() {
            (
                EliminationKind::IgnoredLinkTarget,
                format!("linked only to ignored item(s) {}", self.ignored.join(", ")),
            )
        } else {
            let mut targets = self.eliminated.clone();
            targets.extend(self.ignored.iter().cloned());
            (
                EliminationKind::LinkedItemMissing,
                format!(
                    "linked item(s) {} are no longer part of the record set",
                    targets.join(", ")
                ),
            )
        }
    }
}

/// Positions of live records at the start of a pass, resolved in lookup priority order.
fn snapshot_live_positions(aggregator: &RecordAggregator) -> BTreeMap<String, (ItemKind, usize)> {
    let mut positions = BTreeMap::new();
    for kind in ItemKind::LOOKUP_ORDER {
        for (index, item) in aggregator.get_all(kind).iter().enumerate() {
            positions.entry(item.id().to_string()).or_insert((kind, index));
        }
    }
    positions
}

fn snapshot_eliminated_ids(aggregator: &RecordAggregator) -> BTreeSet<String> {
    ItemKind::ALL
        .into_iter()
        .flat_map(|kind| {
            aggregator.get_all_eliminated(kind).iter().map(|item| item.id().to_string())
        })
        .collect()
}

/// Make every pairable link symmetric and cascade eliminations until a fixed point.
///
/// Each pass walks every live record's links against a snapshot of the live and
/// eliminated IDs. A link to a live record gets its complementary back-link. A link
/// to an eliminated record is kept but flags its owner. A link to an ignored target
/// is removed and flags its owner. After the pass, flagged records without a link
/// to any live record are eliminated, and the loop repeats while eliminations occur.
///
/// # Errors
/// Returns [`KernelError::DataIntegrity`] for a link whose target is neither live,
/// eliminated, nor ignored. The aggregator may hold back-links added by earlier
/// passes when this happens; callers abort the build.
pub fn enforce_link_consistency(
    aggregator: &mut RecordAggregator,
    options: &ConsistencyOptions,
) -> Result<ChangeLog, KernelError> {
    let mut log = ChangeLog::default();

    loop {
        log.passes += 1;
        let pass = log.passes;
        let positions = snapshot_live_positions(aggregator);
        let eliminated_ids = snapshot_eliminated_ids(aggregator);
        let mut flagged: BTreeMap<(ItemKind, String), LostReferences> = BTreeMap::new();
        let added_before = log.added_links.len();

        for kind in ItemKind::ALL {
            let count = aggregator.get_all(kind).len();
            for index in 0..count {
                let (source_id, links) = {
                    let source = &aggregator.get_all(kind)[index];
                    (source.id().to_string(), source.links.clone())
                };

                for ItemLink { target_id, link_type } in links {
                    if options.ignored_targets.contains(&target_id) {
                        aggregator.live_mut(kind)[index].remove_links_to(&target_id);
                        log.removed_links.push(LinkChange {
                            kind,
                            item_id: source_id.clone(),
                            target_id: target_id.clone(),
                            link_type,
                            pass,
                        });
                        let entry = flagged.entry((kind, source_id.clone())).or_default();
                        entry.ignored.push(target_id);
                    } else if let Some((target_kind, target_index)) = positions.get(&target_id) {
                        let complement = link_type.complement();
                        if !complement.is_pairable() {
                            continue;
                        }
                        let target = &mut aggregator.live_mut(*target_kind)[*target_index];
                        if !target.has_link(&source_id, complement) {
                            target.links.push(ItemLink::new(source_id.clone(), complement));
                            log.added_links.push(LinkChange {
                                kind: *target_kind,
                                item_id: target_id,
                                target_id: source_id.clone(),
                                link_type: complement,
                                pass,
                            });
                        }
                    } else if eliminated_ids.contains(&target_id) {
                        let entry = flagged.entry((kind, source_id.clone())).or_default();
                        entry.eliminated.push(target_id);
                    } else {
                        return Err(KernelError::DataIntegrity {
                            source_id,
                            kind,
                            target_id,
                            link_type,
                        });
                    }
                }
            }
        }

        let doomed = flagged
            .into_iter()
            .filter(|((kind, id), _)| {
                aggregator.get_by_kind_and_id(*kind, id).is_some_and(|item| {
                    !item.links.iter().any(|link| positions.contains_key(&link.target_id))
                })
            })
            .collect::<Vec<_>>();

        for ((kind, id), lost) in &doomed {
            let (elimination_kind, reason) = lost.elimination();
            aggregator.eliminate_in(*kind, id, &reason, elimination_kind)?;
            log.eliminations.push(Elimination {
                kind: *kind,
                item_id: id.clone(),
                elimination_kind,
                reason,
                pass,
            });
        }

        tracing::debug!(
            pass,
            added_links = log.added_links.len() - added_before,
            eliminations = doomed.len(),
            "link consistency pass complete"
        );

        if doomed.is_empty() {
            return Ok(log);
        }
    }
}
