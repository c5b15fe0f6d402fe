//! Computes inserted/updated/deleted sets between two successive
//! materialized views of a collection, the shape every reactive sink
//! consumes ([`crate::binding::ReactiveSink`]).

use serde_json::Value;
use std::collections::HashMap;

/// The observable effect of a merge or local mutation on a collection's
/// materialized view.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delta {
    pub inserted: Vec<(String, Value)>,
    pub updated: Vec<(String, Value)>,
    pub deleted: Vec<String>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// Diffs `before` against `after`, both keyed by document id.
///
/// An id present in both but with an unequal value is `updated`; present
/// only in `after` is `inserted`; present only in `before` is `deleted`.
/// Unchanged ids produce no entry — this is what keeps a reactive sink from
/// re-rendering documents nothing touched.
pub fn compute_delta(before: &HashMap<String, Value>, after: &HashMap<String, Value>) -> Delta {
    let mut delta = Delta::default();

    for (id, after_value) in after {
        match before.get(id) {
            None => delta.inserted.push((id.clone(), after_value.clone())),
            Some(before_value) if before_value != after_value => {
                delta.updated.push((id.clone(), after_value.clone()))
            }
            Some(_) => {}
        }
    }

    for id in before.keys() {
        if !after.contains_key(id) {
            delta.deleted.push(id.clone());
        }
    }

    delta
}
