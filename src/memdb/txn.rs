use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::PoisonError;

use super::table::Tables;
use super::{IndexKey, KeyPart, MemDb, Record};

/// Staged rows for one table: `Some` is an upsert, `None` a delete.
struct Overlay<R> {
    rows: BTreeMap<String, Option<R>>,
}

trait AnyOverlay: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn is_empty(&self) -> bool;
    fn apply(self: Box<Self>, tables: &mut Tables);
}

impl<R: Record> AnyOverlay for Overlay<R> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn apply(self: Box<Self>, tables: &mut Tables) {
        let table = tables.get_or_create::<R>();
        for (id, row) in self.rows {
            match row {
                Some(row) => table.insert(row),
                None => {
                    table.remove(&id);
                }
            }
        }
    }
}

/// Write transaction over a [`MemDb`].
///
/// Reads go to the overlay first and fall through to the committed tables, so a
/// transaction always sees its own writes. Reads return owned rows: the transaction
/// may live across `.await` points and never holds the table lock between calls.
pub struct MemTxn {
    db: MemDb,
    overlays: HashMap<&'static str, Box<dyn AnyOverlay>>,
}

impl MemTxn {
    pub(super) fn new(db: MemDb) -> Self {
        Self {
            db,
            overlays: HashMap::new(),
        }
    }

    fn overlay<R: Record>(&self) -> Option<&Overlay<R>> {
        self.overlays
            .get(R::TABLE)
            .and_then(|o| o.as_any().downcast_ref::<Overlay<R>>())
    }

    fn overlay_mut<R: Record>(&mut self) -> &mut Overlay<R> {
        let overlay = self.overlays.entry(R::TABLE).or_insert_with(|| {
            Box::new(Overlay::<R> {
                rows: BTreeMap::new(),
            })
        });
        match overlay.as_any_mut().downcast_mut::<Overlay<R>>() {
            Some(o) => o,
            None => panic!(
                "memdb table {} is used by more than one record type",
                R::TABLE
            ),
        }
    }

    fn with_tables<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        let tables = self
            .db
            .inner
            .tables
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        f(&tables)
    }

    pub fn insert<R: Record>(&mut self, row: R) {
        let id = row.id().to_string();
        self.overlay_mut::<R>().rows.insert(id, Some(row));
    }

    pub fn delete<R: Record>(&mut self, id: &str) {
        self.overlay_mut::<R>().rows.insert(id.to_string(), None);
    }

    pub fn get<R: Record>(&self, id: &str) -> Option<R> {
        if let Some(staged) = self.overlay::<R>().and_then(|o| o.rows.get(id)) {
            return staged.clone();
        }
        self.with_tables(|t| t.get::<R>().and_then(|t| t.get(id)).cloned())
    }

    pub fn len<R: Record>(&self) -> usize {
        let (base, existing) = self.with_tables(|t| {
            let table = t.get::<R>();
            let base = table.map(|t| t.len()).unwrap_or(0);
            let existing: HashSet<String> = self
                .overlay::<R>()
                .map(|o| {
                    o.rows
                        .keys()
                        .filter(|id| table.is_some_and(|t| t.contains(id)))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            (base, existing)
        });
        let Some(overlay) = self.overlay::<R>() else {
            return base;
        };
        let mut len = base;
        for (id, row) in &overlay.rows {
            match (row.is_some(), existing.contains(id)) {
                (true, false) => len += 1,
                (false, true) => len -= 1,
                _ => {}
            }
        }
        len
    }

    /// Rows under `prefix` of `index`, merged with staged writes, ascending by
    /// (key, id). Each row appears at most once.
    pub fn prefix<R: Record>(&self, index: &str, prefix: &[KeyPart]) -> Vec<R> {
        let mut hits = self.merged::<R>(index, prefix);
        hits.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
        dedupe(hits)
    }

    /// Same as `prefix` but descending.
    pub fn prefix_rev<R: Record>(&self, index: &str, prefix: &[KeyPart]) -> Vec<R> {
        let mut hits = self.merged::<R>(index, prefix);
        hits.sort_by(|a, b| (&b.0, &b.1).cmp(&(&a.0, &a.1)));
        dedupe(hits)
    }

    pub fn first<R: Record>(&self, index: &str, prefix: &[KeyPart]) -> Option<R> {
        self.prefix::<R>(index, prefix).into_iter().next()
    }

    /// Every row of the table, merged with staged writes, ordered by id.
    pub fn all<R: Record>(&self) -> Vec<R> {
        let overlay = self.overlay::<R>();
        let mut rows: BTreeMap<String, R> = self.with_tables(|t| {
            t.get::<R>()
                .map(|t| {
                    t.rows()
                        .map(|r| (r.id().to_string(), r.clone()))
                        .collect()
                })
                .unwrap_or_default()
        });
        if let Some(o) = overlay {
            for (id, row) in &o.rows {
                match row {
                    Some(r) => {
                        rows.insert(id.clone(), r.clone());
                    }
                    None => {
                        rows.remove(id);
                    }
                }
            }
        }
        rows.into_values().collect()
    }

    fn merged<R: Record>(&self, index: &str, prefix: &[KeyPart]) -> Vec<(IndexKey, String, R)> {
        let overlay = self.overlay::<R>();
        let mut hits: Vec<(IndexKey, String, R)> = self.with_tables(|t| {
            t.get::<R>()
                .map(|t| {
                    t.range(index, prefix)
                        .filter(|(_, r)| overlay.map_or(true, |o| !o.rows.contains_key(r.id())))
                        .map(|(k, r)| (k.clone(), r.id().to_string(), r.clone()))
                        .collect()
                })
                .unwrap_or_default()
        });
        if let Some(o) = overlay {
            for (id, row) in &o.rows {
                let Some(row) = row else { continue };
                for (name, key) in row.index_keys() {
                    if name == index && key.starts_with(prefix) {
                        hits.push((key, id.clone(), row.clone()));
                    }
                }
            }
        }
        hits
    }

    /// True if nothing has been staged.
    pub fn is_empty(&self) -> bool {
        self.overlays.values().all(|o| o.is_empty())
    }

    /// Apply every staged write atomically and wake watchers of the touched tables.
    pub fn commit(self) -> Vec<&'static str> {
        let mut touched = Vec::new();
        {
            let mut tables = self
                .db
                .inner
                .tables
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            for (name, overlay) in self.overlays {
                if overlay.is_empty() {
                    continue;
                }
                overlay.apply(&mut tables);
                touched.push(name);
            }
        }
        self.db.bump(&touched);
        touched
    }
}

fn dedupe<R>(hits: Vec<(IndexKey, String, R)>) -> Vec<R> {
    let mut seen = HashSet::new();
    hits.into_iter()
        .filter(|(_, id, _)| seen.insert(id.clone()))
        .map(|(_, _, r)| r)
        .collect()
}
