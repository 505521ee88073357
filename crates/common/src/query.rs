// Query, sort, and aggregate specifications carried on the wire.
//
// These are pure data; evaluation lives in the server's query engine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::FieldValue;

/// Full specification of one query or live subscription.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QuerySpec {
    /// Conjunction of field predicates; empty matches everything.
    pub filter: Vec<FieldPredicate>,
    pub sort: Vec<SortSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<AggregateSpec>,
}

impl QuerySpec {
    pub fn is_aggregate(&self) -> bool {
        self.aggregate.is_some()
    }
}

/// One predicate over a single field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldPredicate {
    pub field: String,
    pub op: PredicateOp,
    pub value: FieldValue,
}

impl FieldPredicate {
    pub fn new(field: impl Into<String>, op: PredicateOp, value: impl Into<FieldValue>) -> Self {
        Self { field: field.into(), op, value: value.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PredicateOp {
    Eq,
    Ne,
    Gt,
    Lt,
    In,
    NotIn,
    ArrayContains,
    ArrayContainsAny,
    ArrayContainsAll,
}

/// One sort key; earlier entries take precedence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortSpec {
    pub field: String,
    #[serde(default = "default_ascending")]
    pub ascending: bool,
}

impl SortSpec {
    pub fn asc(field: impl Into<String>) -> Self {
        Self { field: field.into(), ascending: true }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self { field: field.into(), ascending: false }
    }
}

fn default_ascending() -> bool {
    true
}

/// Grouped aggregation over the filtered set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateSpec {
    /// Documents group by the exact value of this field; a missing field
    /// groups under null.
    pub group_by: String,
    #[serde(default)]
    pub ops: Vec<AggregateOp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateOp {
    pub op: AggregateFn,
    pub field: String,
}

impl AggregateOp {
    /// Output key for this op inside a group entry, e.g. `sum_points`.
    pub fn output_field(&self) -> String {
        format!("{}_{}", self.op.as_str(), self.field)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFn {
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFn {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::Min => "min",
            Self::Max => "max",
        }
    }
}

/// Result of an aggregate query or subscription refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateResult {
    pub groups: Vec<AggregateGroup>,
    pub size: usize,
    pub empty: bool,
}

/// One group entry: the grouping value, the member count, and one numeric
/// entry per requested op keyed `<op>_<field>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateGroup {
    pub group: FieldValue,
    pub count: u64,
    #[serde(flatten)]
    pub values: BTreeMap<String, f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicate_ops_use_kebab_case_on_the_wire() {
        let spec = FieldPredicate::new("tags", PredicateOp::ArrayContainsAny, "x");
        let encoded = serde_json::to_value(&spec).expect("predicate should serialize");
        assert_eq!(encoded["op"], "array-contains-any");
    }

    #[test]
    fn sort_defaults_to_ascending() {
        let decoded: SortSpec =
            serde_json::from_str(r#"{"field":"order"}"#).expect("sort spec should parse");
        assert!(decoded.ascending);
    }

    #[test]
    fn aggregate_group_flattens_op_values() {
        let group = AggregateGroup {
            group: FieldValue::from("done"),
            count: 3,
            values: BTreeMap::from([("sum_points".to_string(), 8.0)]),
        };
        let encoded = serde_json::to_value(&group).expect("group should serialize");
        assert_eq!(encoded["group"], "done");
        assert_eq!(encoded["count"], 3);
        assert_eq!(encoded["sum_points"], 8.0);
    }

    #[test]
    fn aggregate_op_names_its_output_field() {
        let op = AggregateOp { op: AggregateFn::Avg, field: "points".to_string() };
        assert_eq!(op.output_field(), "avg_points");
    }
}
