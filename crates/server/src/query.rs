// Query evaluation against the document store.
//
// Filters are conjunctions of field predicates. A missing field under any
// predicate is treated as non-matching, never as an error.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use trellis_common::query::{
    AggregateFn, AggregateGroup, AggregateResult, AggregateSpec, FieldPredicate, PredicateOp,
    QuerySpec, SortSpec,
};
use trellis_common::types::{Document, FieldKey, FieldValue, Fields};

use crate::index::IndexRegistry;
use crate::store::DocumentStore;

/// Outcome of one query: a document list or an aggregate summary.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    Documents(Vec<Document>),
    Aggregate(AggregateResult),
}

/// Run `spec` against one collection.
pub fn execute(
    store: &DocumentStore,
    indexes: &IndexRegistry,
    collection: &str,
    spec: &QuerySpec,
) -> QueryOutput {
    let mut matched: Vec<Document> = match indexes.candidates(collection, &spec.filter) {
        Some(ids) => ids
            .iter()
            .filter_map(|id| {
                store.fields(&trellis_common::types::DocPath::new(collection, id.clone())).map(
                    |fields| Document::new(id.clone(), fields.clone()),
                )
            })
            .filter(|doc| matches(&doc.fields, &spec.filter))
            .collect(),
        None => store
            .documents_in(collection)
            .into_iter()
            .filter(|doc| matches(&doc.fields, &spec.filter))
            .collect(),
    };

    if let Some(aggregate) = &spec.aggregate {
        return QueryOutput::Aggregate(aggregate_documents(&matched, aggregate));
    }

    sort_documents(&mut matched, &spec.sort);
    let offset = spec.offset.unwrap_or(0);
    let matched: Vec<Document> = match spec.limit {
        Some(limit) => matched.into_iter().skip(offset).take(limit).collect(),
        None => matched.into_iter().skip(offset).collect(),
    };
    QueryOutput::Documents(matched)
}

/// Whether a field map satisfies every predicate of a conjunction.
pub fn matches(fields: &Fields, filter: &[FieldPredicate]) -> bool {
    filter.iter().all(|predicate| predicate_matches(fields, predicate))
}

fn predicate_matches(fields: &Fields, predicate: &FieldPredicate) -> bool {
    let Some(value) = fields.get(&predicate.field) else {
        return false;
    };

    match predicate.op {
        PredicateOp::Eq => value.compare(&predicate.value) == Ordering::Equal,
        PredicateOp::Ne => value.compare(&predicate.value) != Ordering::Equal,
        PredicateOp::Gt => value.compare(&predicate.value) == Ordering::Greater,
        PredicateOp::Lt => value.compare(&predicate.value) == Ordering::Less,
        PredicateOp::In => predicate
            .value
            .as_array()
            .is_some_and(|wanted| wanted.iter().any(|w| value.compare(w) == Ordering::Equal)),
        PredicateOp::NotIn => predicate
            .value
            .as_array()
            .is_some_and(|wanted| wanted.iter().all(|w| value.compare(w) != Ordering::Equal)),
        PredicateOp::ArrayContains => value
            .as_array()
            .is_some_and(|items| {
                items.iter().any(|item| item.compare(&predicate.value) == Ordering::Equal)
            }),
        PredicateOp::ArrayContainsAny => contains_of(value, &predicate.value, false),
        PredicateOp::ArrayContainsAll => contains_of(value, &predicate.value, true),
    }
}

fn contains_of(value: &FieldValue, wanted: &FieldValue, all: bool) -> bool {
    let (Some(items), Some(wanted)) = (value.as_array(), wanted.as_array()) else {
        return false;
    };
    let held = |w: &FieldValue| items.iter().any(|item| item.compare(w) == Ordering::Equal);
    if all {
        !wanted.is_empty() && wanted.iter().all(held)
    } else {
        wanted.iter().any(held)
    }
}

/// Sort in place by the given keys, doc id breaking every remaining tie.
///
/// Missing sort fields order before present ones so they cluster at the
/// start of an ascending scan.
pub fn sort_documents(documents: &mut [Document], sort: &[SortSpec]) {
    documents.sort_by(|a, b| {
        for key in sort {
            let ordering = match (a.fields.get(&key.field), b.fields.get(&key.field)) {
                (Some(left), Some(right)) => left.compare(right),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            let ordering = if key.ascending { ordering } else { ordering.reverse() };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        a.id.cmp(&b.id)
    });
}

/// Group the matched set and fold the numeric ops per group.
///
/// Documents missing the groupBy field fall into the null group. Numeric
/// ops skip non-numeric values; a group gets an op entry only when at least
/// one member contributed a number.
pub fn aggregate_documents(documents: &[Document], spec: &AggregateSpec) -> AggregateResult {
    let mut grouped: BTreeMap<FieldKey, Vec<&Document>> = BTreeMap::new();
    for doc in documents {
        let key = doc
            .fields
            .get(&spec.group_by)
            .map(FieldKey::of)
            .unwrap_or(FieldKey::Null);
        grouped.entry(key).or_default().push(doc);
    }

    let groups: Vec<AggregateGroup> = grouped
        .into_iter()
        .map(|(key, members)| {
            let mut values = BTreeMap::new();
            for op in &spec.ops {
                let numbers: Vec<f64> = members
                    .iter()
                    .filter_map(|doc| doc.fields.get(&op.field).and_then(FieldValue::as_f64))
                    .collect();
                if numbers.is_empty() {
                    continue;
                }
                let folded = match op.op {
                    AggregateFn::Sum => numbers.iter().sum(),
                    AggregateFn::Avg => numbers.iter().sum::<f64>() / numbers.len() as f64,
                    AggregateFn::Min => numbers.iter().copied().fold(f64::INFINITY, f64::min),
                    AggregateFn::Max => {
                        numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max)
                    }
                };
                values.insert(op.output_field(), folded);
            }
            AggregateGroup { group: key.to_value(), count: members.len() as u64, values }
        })
        .collect();

    let size = groups.len();
    AggregateResult { groups, size, empty: size == 0 }
}
