use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;

use super::{IndexKey, KeyPart, Record};

type IndexEntry = (IndexKey, String);

/// Rows of one record type plus their secondary indexes.
pub(crate) struct Table<R> {
    rows: BTreeMap<String, R>,
    indexes: BTreeMap<&'static str, BTreeSet<IndexEntry>>,
}

/// Bounds covering every index key that starts with `prefix`.
pub(crate) fn prefix_bounds(prefix: &[KeyPart]) -> (Bound<IndexEntry>, Bound<IndexEntry>) {
    let lo = (prefix.to_vec(), String::new());
    let mut upper = prefix.to_vec();
    upper.push(KeyPart::Max);
    (Bound::Included(lo), Bound::Excluded((upper, String::new())))
}

impl<R: Record> Table<R> {
    pub(crate) fn new() -> Self {
        Self {
            rows: BTreeMap::new(),
            indexes: BTreeMap::new(),
        }
    }

    pub(crate) fn get(&self, id: &str) -> Option<&R> {
        self.rows.get(id)
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.rows.contains_key(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }

    pub(crate) fn rows(&self) -> impl DoubleEndedIterator<Item = &R> {
        self.rows.values()
    }

    pub(crate) fn insert(&mut self, row: R) {
        let id = row.id().to_string();
        self.remove(&id);
        for (name, key) in row.index_keys() {
            self.indexes
                .entry(name)
                .or_default()
                .insert((key, id.clone()));
        }
        self.rows.insert(id, row);
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<R> {
        let row = self.rows.remove(id)?;
        for (name, key) in row.index_keys() {
            if let Some(set) = self.indexes.get_mut(name) {
                set.remove(&(key, id.to_string()));
            }
        }
        Some(row)
    }

    /// Index entries under `prefix`, ascending by (key, id).
    pub(crate) fn range<'a>(
        &'a self,
        index: &str,
        prefix: &[KeyPart],
    ) -> impl DoubleEndedIterator<Item = (&'a IndexKey, &'a R)> + 'a {
        let bounds = prefix_bounds(prefix);
        let rows = &self.rows;
        self.indexes
            .get(index)
            .into_iter()
            .flat_map(move |set| set.range(bounds.clone()))
            .filter_map(move |(key, id)| rows.get(id).map(|r| (key, r)))
    }
}

/// Type-erased table so tables of different record types share one map.
pub(crate) trait AnyTable: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn len(&self) -> usize;
}

impl<R: Record> AnyTable for Table<R> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn len(&self) -> usize {
        self.rows.len()
    }
}

#[derive(Default)]
pub(crate) struct Tables {
    map: HashMap<&'static str, Box<dyn AnyTable>>,
}

impl Tables {
    pub(crate) fn get<R: Record>(&self) -> Option<&Table<R>> {
        self.map
            .get(R::TABLE)
            .and_then(|t| t.as_any().downcast_ref::<Table<R>>())
    }

    pub(crate) fn get_or_create<R: Record>(&mut self) -> &mut Table<R> {
        let table = self
            .map
            .entry(R::TABLE)
            .or_insert_with(|| Box::new(Table::<R>::new()));
        match table.as_any_mut().downcast_mut::<Table<R>>() {
            Some(t) => t,
            None => panic!(
                "memdb table {} is used by more than one record type",
                R::TABLE
            ),
        }
    }

    pub(crate) fn sizes(&self) -> Vec<(&'static str, usize)> {
        let mut sizes: Vec<_> = self.map.iter().map(|(k, t)| (*k, t.len())).collect();
        sizes.sort();
        sizes
    }
}
