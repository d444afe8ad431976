use crate::idmap::LabelId;
use std::collections::HashMap;

/// Mutable name<->id table for node labels and relationship types. Ids are
/// assigned densely starting at 0 in creation order; callers take a
/// [`LabelSnapshot`] to hand readers a stable, `Arc`-shared view.
#[derive(Debug, Default)]
pub struct LabelInterner {
    names: Vec<String>,
    ids: HashMap<String, LabelId>,
}

impl LabelInterner {
    pub fn new() -> Self {
        Self {
            names: Vec::new(),
            ids: HashMap::new(),
        }
    }

    pub fn get_id(&self, name: &str) -> Option<LabelId> {
        self.ids.get(name).copied()
    }

    pub fn get_name(&self, id: LabelId) -> Option<&str> {
        self.names.get(id as usize).map(String::as_str)
    }

    /// Next id that would be assigned by `get_or_create` for a new name.
    pub fn next_id(&self) -> LabelId {
        self.names.len() as LabelId
    }

    pub fn get_or_create(&mut self, name: &str) -> LabelId {
        if let Some(id) = self.ids.get(name) {
            return *id;
        }
        let id = self.next_id();
        self.names.push(name.to_string());
        self.ids.insert(name.to_string(), id);
        id
    }

    pub fn snapshot(&self) -> LabelSnapshot {
        LabelSnapshot {
            names: self.names.clone(),
            ids: self.ids.clone(),
        }
    }
}

/// Immutable point-in-time copy of a [`LabelInterner`], `Arc`-shared into
/// read-only snapshots so concurrent readers never block writers.
#[derive(Debug, Default)]
pub struct LabelSnapshot {
    names: Vec<String>,
    ids: HashMap<String, LabelId>,
}

impl LabelSnapshot {
    pub fn get_id(&self, name: &str) -> Option<LabelId> {
        self.ids.get(name).copied()
    }

    pub fn get_name(&self, id: LabelId) -> Option<&str> {
        self.names.get(id as usize).map(String::as_str)
    }

    pub fn iter_ids(&self) -> impl Iterator<Item = LabelId> + '_ {
        0..self.names.len() as LabelId
    }
}

#[cfg(test)]
mod tests {
    use super::LabelInterner;

    #[test]
    fn get_or_create_assigns_dense_ids_in_order() {
        let mut interner = LabelInterner::new();
        assert_eq!(interner.get_or_create("Person"), 0);
        assert_eq!(interner.get_or_create("City"), 1);
        assert_eq!(interner.get_or_create("Person"), 0);
        assert_eq!(interner.get_id("City"), Some(1));
        assert_eq!(interner.get_id("Missing"), None);
    }

    #[test]
    fn snapshot_is_independent_of_later_mutation() {
        let mut interner = LabelInterner::new();
        interner.get_or_create("Person");
        let snapshot = interner.snapshot();
        interner.get_or_create("City");

        assert_eq!(snapshot.get_id("Person"), Some(0));
        assert_eq!(snapshot.get_id("City"), None);
        assert_eq!(interner.get_id("City"), Some(1));
    }

    #[test]
    fn next_id_tracks_placeholder_gap_filling() {
        let mut interner = LabelInterner::new();
        interner.get_or_create("A");
        assert_eq!(interner.next_id(), 1);
        while interner.next_id() < 3 {
            interner.get_or_create(&format!("__placeholder_{}", interner.next_id()));
        }
        assert_eq!(interner.get_or_create("B"), 3);
    }
}
