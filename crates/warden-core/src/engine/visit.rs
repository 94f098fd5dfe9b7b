use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::tuple::EntityRef;

/// Sub-problem identity inside one request. The query subject is fixed for
/// the request, so it is not part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct VisitKey {
    pub entity: EntityRef,
    pub relation: String,
}

impl VisitKey {
    pub(crate) fn new(entity: &EntityRef, relation: &str) -> Self {
        Self {
            entity: entity.clone(),
            relation: relation.to_string(),
        }
    }
}

/// Ancestors of the sub-problem being evaluated, innermost first.
#[derive(Debug, Clone, Default)]
pub(crate) struct Path(Option<Arc<PathNode>>);

#[derive(Debug)]
struct PathNode {
    key: VisitKey,
    parent: Option<Arc<PathNode>>,
}

impl Path {
    pub(crate) fn push(&self, key: VisitKey) -> Self {
        Self(Some(Arc::new(PathNode {
            key,
            parent: self.0.clone(),
        })))
    }

    pub(crate) fn contains(&self, key: &VisitKey) -> bool {
        let mut node = self.0.as_deref();
        while let Some(current) = node {
            if current.key == *key {
                return true;
            }
            node = current.parent.as_deref();
        }
        false
    }
}

/// Memo of resolved sub-problems, shared by every branch of one request.
#[derive(Debug)]
pub(crate) struct VisitMap<K, V> {
    entries: Mutex<HashMap<K, V>>,
}

impl<K: Eq + Hash, V: Clone> VisitMap<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn get(&self, key: &K) -> Option<V> {
        self.entries.lock().get(key).cloned()
    }

    pub(crate) fn insert(&self, key: K, value: V) {
        self.entries.lock().insert(key, value);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
