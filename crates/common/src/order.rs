// Fractional ordering for sibling sequencing.
//
// Order values are plain f64 sort keys; inserting or moving between two
// siblings takes their midpoint, so no neighbor ever needs renumbering.

use std::cmp::Ordering;

/// Compute the order value for a document placed between two siblings.
///
/// `prev` is the sibling immediately before the target position, `next` the
/// one immediately after; either may be absent at the edges of the list.
pub fn order_between(prev: Option<f64>, next: Option<f64>) -> f64 {
    match (prev, next) {
        (Some(prev), Some(next)) => (prev + next) / 2.0,
        (Some(prev), None) => prev + 1.0,
        (None, Some(next)) => next - 1.0,
        (None, None) => 1.0,
    }
}

/// Total sibling order: by order value, with the document id breaking
/// numeric ties so concurrent inserts at the same midpoint stay stable
/// across replicas.
pub fn sibling_cmp(a_order: f64, a_id: &str, b_order: f64, b_id: &str) -> Ordering {
    a_order.total_cmp(&b_order).then_with(|| a_id.cmp(b_id))
}
