//! Batch list updates shared by the requirements and plan tools.
//!
//! A batch behaves as if edits are applied first, then deletes (highest
//! index first), then inserts (lowest index first, positions interpreted
//! against the list after deletes).

use serde::{Deserialize, Serialize};

/// Replace the item at `index` with `value`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemEdit<T> {
    pub index: usize,
    pub value: T,
}

/// One incremental batch over an ordered list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListUpdate<T> {
    #[serde(default = "Vec::new")]
    pub edits: Vec<ItemEdit<T>>,
    #[serde(default)]
    pub deletes: Vec<usize>,
    #[serde(default = "Vec::new")]
    pub inserts: Vec<ItemEdit<T>>,
}

impl<T> Default for ListUpdate<T> {
    fn default() -> Self {
        Self {
            edits: Vec::new(),
            deletes: Vec::new(),
            inserts: Vec::new(),
        }
    }
}

impl<T: Clone> ListUpdate<T> {
    pub fn is_empty(&self) -> bool {
        self.edits.is_empty() && self.deletes.is_empty() && self.inserts.is_empty()
    }

    /// Apply the batch to `items`, returning the new list. Out-of-range
    /// edits and deletes are ignored; insert positions clamp to the end.
    pub fn apply(&self, items: &[T]) -> Vec<T> {
        let mut result: Vec<T> = items.to_vec();

        for edit in &self.edits {
            if let Some(slot) = result.get_mut(edit.index) {
                *slot = edit.value.clone();
            }
        }

        let mut deletes = self.deletes.clone();
        deletes.sort_unstable_by(|a, b| b.cmp(a));
        deletes.dedup();
        for index in deletes {
            if index < result.len() {
                result.remove(index);
            }
        }

        let mut inserts: Vec<&ItemEdit<T>> = self.inserts.iter().collect();
        inserts.sort_by_key(|e| e.index);
        for insert in inserts {
            let at = insert.index.min(result.len());
            result.insert(at, insert.value.clone());
        }

        result
    }
}
