//! Matcher - assigns fetched candidate models to the items that asked
//!
//! Getter groups are tried in declared order. The first group that
//! matches any candidate decides: every candidate matching that group
//! belongs to the item.

use super::keeper::{ProcessKeeper, TrackId};
use crate::adapter::{Adapter, ForeignKeys, Model};
use crate::item::{Item, ItemGraph};
use crate::{Error, Result};

/// Outcome of testing one getter group against one model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupMatch {
    Matched,
    Mismatch,
    /// The item lacks a field of the group or a relation is unresolved
    Unusable,
}

/// Test a getter group of `item` against `model`.
///
/// Relation fields compare against resolved foreign models; an x-to-many
/// field matches when any resolved child is related to the model.
pub(crate) fn group_matches<A: Adapter>(
    adapter: &A,
    item: &Item,
    fkeys: &ForeignKeys<A::Model>,
    group: &[String],
    model: &A::Model,
) -> Result<GroupMatch> {
    let class = item.class();
    for field in group {
        if !item.contains(field) {
            return Ok(GroupMatch::Unusable);
        }
        let Some(rel) = class.get_relation(field) else {
            let wanted = item.scalar(field).cloned().unwrap_or_default();
            if model.get_field(field) != wanted {
                return Ok(GroupMatch::Mismatch);
            }
            continue;
        };
        let Some(resolved) = fkeys.get(field).filter(|r| !r.is_empty()) else {
            return Ok(GroupMatch::Unusable);
        };
        if rel.relation_type.is_x_to_one() {
            if model.get_relation(field) != resolved[0] {
                return Ok(GroupMatch::Mismatch);
            }
        } else {
            let children: Vec<A::Model> = resolved.iter().flatten().cloned().collect();
            if children.is_empty() {
                return Ok(GroupMatch::Unusable);
            }
            if adapter.related_x_to_many_contains(model, field, &children)?.is_empty() {
                return Ok(GroupMatch::Mismatch);
            }
        }
    }
    Ok(GroupMatch::Matched)
}

/// Match candidates to the tracks of one batch.
///
/// Returns the tracks that matched and, for each, its models. More than
/// one distinct model for an item without `allow_multi_update` is an
/// error.
pub(crate) fn match_models<A: Adapter>(
    adapter: &A,
    graph: &ItemGraph,
    keeper: &ProcessKeeper<A::Model>,
    batch: &[TrackId],
    candidates: &[A::Model],
) -> Result<(Vec<TrackId>, Vec<Vec<A::Model>>)> {
    let mut tracks = Vec::new();
    let mut models = Vec::new();

    for &track_id in batch {
        let track = keeper.get(track_id);
        let item = graph.item(track.item);
        let class = item.class();

        let mut matched: Vec<A::Model> = Vec::new();
        for group in &class.getters {
            for candidate in candidates {
                if matched.contains(candidate) {
                    continue;
                }
                if group_matches(adapter, item, &track.fkeys, group, candidate)? == GroupMatch::Matched {
                    matched.push(candidate.clone());
                }
            }
            if !matched.is_empty() {
                break;
            }
        }

        if matched.len() > 1 && !class.allow_multi_update {
            return Err(Error::PersistMultipleItemsMatch {
                class: class.name.clone(),
                item: track.item,
                count: matched.len(),
            });
        }
        if !matched.is_empty() {
            tracing::trace!("{} {} matched {} models", class.name, track.item, matched.len());
            tracks.push(track_id);
            models.push(matched);
        }
    }
    Ok((tracks, models))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::memory::MemoryAdapter;
    use crate::adapter::record::Record;
    use crate::adapter::schema::{Catalog, ModelSchema};
    use crate::item::ItemClass;
    use crate::relation::RelationType;
    use crate::value::Value;
    use std::rc::Rc;

    fn adapter() -> MemoryAdapter {
        MemoryAdapter::new(
            Catalog::new()
                .with(
                    ModelSchema::new("person")
                        .fields(&["email", "code", "name"])
                        .many_to_many("tags", "tag", Some("people"), "person_tags"),
                )
                .with(
                    ModelSchema::new("tag")
                        .field("label")
                        .many_to_many("people", "person", Some("tags"), "person_tags"),
                ),
        )
    }

    fn person_class() -> ItemClass {
        ItemClass::new("Person", "person")
            .fields(&["email", "code", "name"])
            .relation("tags", RelationType::ManyToMany, "Tag", Some("people"))
    }

    fn run(
        adapter: &MemoryAdapter,
        class: ItemClass,
        fill: impl Fn(&mut ItemGraph, crate::item::ItemId),
        fkeys: Vec<(&str, Vec<Option<Record>>)>,
    ) -> Result<(Vec<TrackId>, Vec<Vec<Record>>)> {
        let class = Rc::new(class);
        let mut graph = ItemGraph::new();
        let id = graph.add(&class);
        fill(&mut graph, id);
        let structure = graph.flatten(&[id]);
        let mut keeper = ProcessKeeper::build(&graph, &structure);
        let track = keeper.track_of(id).unwrap();
        for (fkey, models) in fkeys {
            for m in models {
                keeper.get_mut(track).push_fkey(fkey, m);
            }
        }
        let candidates = adapter.rows("person");
        match_models(adapter, &graph, &keeper, &[track], &candidates)
    }

    #[test]
    fn test_first_matching_group_wins() {
        let adapter = adapter();
        let by_email = adapter
            .insert("person", &[("email", Value::from("x")), ("code", Value::Int(1))])
            .unwrap();
        adapter
            .insert("person", &[("email", Value::from("y")), ("code", Value::Int(2))])
            .unwrap();

        let class = person_class().getter(&["email"]).getter(&["code"]);
        let (_, models) = run(
            &adapter,
            class,
            |g, id| {
                g.set(id, "email", "x").unwrap();
                g.set(id, "code", 2).unwrap();
            },
            vec![],
        )
        .unwrap();
        assert_eq!(models, vec![vec![by_email]]);
    }

    #[test]
    fn test_ambiguous_match_is_an_error() {
        let adapter = adapter();
        adapter.insert("person", &[("name", Value::from("sam"))]).unwrap();
        adapter.insert("person", &[("name", Value::from("sam"))]).unwrap();

        let class = person_class().getter(&["name"]);
        let result = run(&adapter, class.clone(), |g, id| g.set(id, "name", "sam").unwrap(), vec![]);
        assert!(matches!(result, Err(Error::PersistMultipleItemsMatch { count: 2, .. })));

        let (_, models) = run(&adapter, class.multi_update(), |g, id| g.set(id, "name", "sam").unwrap(), vec![])
            .unwrap();
        assert_eq!(models[0].len(), 2);
    }

    #[test]
    fn test_unresolved_relation_disqualifies_group() {
        let adapter = adapter();
        adapter.insert("person", &[("name", Value::from("sam"))]).unwrap();
        let class = person_class().getter(&["name", "tags"]);
        let (tracks, _) = run(&adapter, class, |g, id| g.set(id, "name", "sam").unwrap(), vec![]).unwrap();
        assert!(tracks.is_empty());
    }

    #[test]
    fn test_x_to_many_getter_matches_any_child() {
        let adapter = adapter();
        let person = adapter.insert("person", &[("name", Value::from("sam"))]).unwrap();
        let t1 = adapter.insert("tag", &[("label", Value::from("t1"))]).unwrap();
        let t2 = adapter.insert("tag", &[("label", Value::from("t2"))]).unwrap();
        adapter.add_related_models(&person, "tags", &[t1.clone()]).unwrap();

        let tag_class = Rc::new(ItemClass::new("Tag", "tag").field("label"));
        let class = person_class().getter(&["name", "tags"]);
        let (_, models) = run(
            &adapter,
            class,
            |g, id| {
                g.set(id, "name", "sam").unwrap();
                let a = g.add(&tag_class);
                let b = g.add(&tag_class);
                g.link(id, "tags", a).unwrap();
                g.link(id, "tags", b).unwrap();
            },
            vec![("tags", vec![Some(t1), Some(t2)])],
        )
        .unwrap();
        assert_eq!(models, vec![vec![person]]);
    }
}
