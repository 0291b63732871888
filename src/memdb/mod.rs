//! In-memory, multi-index record store with snapshot reads and watchable tables.
//!
//! Nothing here is durable. The state store rebuilds every table from slatedb at
//! startup and then applies each committed durable write here as well.
//!
//! Readers call [`MemDb::view`] and get a consistent [`Snapshot`] for the duration of
//! the closure. Writers stage changes in a [`MemTxn`] overlay and apply them in one
//! step with [`MemTxn::commit`], which also wakes every [`WatchSet`] registered on a
//! touched table.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::watch;

mod table;
mod txn;
mod watch_set;

pub use txn::MemTxn;
pub use watch_set::WatchSet;

use table::Tables;

/// One component of a compound index key.
///
/// Variant order matters: `Max` sorts after every other part and is only used as a
/// range bound, never stored.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyPart {
    Int(i64),
    Str(String),
    Max,
}

pub type IndexKey = Vec<KeyPart>;

impl From<i64> for KeyPart {
    fn from(v: i64) -> Self {
        KeyPart::Int(v)
    }
}

impl From<u64> for KeyPart {
    fn from(v: u64) -> Self {
        KeyPart::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<bool> for KeyPart {
    fn from(v: bool) -> Self {
        KeyPart::Int(v as i64)
    }
}

impl From<&str> for KeyPart {
    fn from(v: &str) -> Self {
        KeyPart::Str(v.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(v: String) -> Self {
        KeyPart::Str(v)
    }
}

/// Build an `IndexKey` from heterogeneous parts: `key![state, "deploy", 10i64]`.
#[macro_export]
macro_rules! key {
    ($($part:expr),* $(,)?) => {
        vec![$($crate::memdb::KeyPart::from($part)),*]
    };
}

/// A row type stored in the memory index.
pub trait Record: Clone + Send + Sync + 'static {
    /// Table name; also the label used for watches and metrics.
    const TABLE: &'static str;

    fn id(&self) -> &str;

    /// Every `(index name, key)` pair this row is reachable under. An index may appear
    /// more than once for multi-valued fields.
    fn index_keys(&self) -> Vec<(&'static str, IndexKey)>;
}

#[derive(Clone, Default)]
pub struct MemDb {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    tables: RwLock<Tables>,
    revisions: Mutex<HashMap<&'static str, watch::Sender<u64>>>,
}

impl MemDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against a consistent snapshot. Keep the closure short: commits wait for it.
    pub fn view<T>(&self, f: impl FnOnce(&Snapshot<'_>) -> T) -> T {
        let tables = self
            .inner
            .tables
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let snap = Snapshot {
            tables: &tables,
            db: self,
        };
        f(&snap)
    }

    /// Start a write transaction. Nothing is visible to readers until `commit`.
    pub fn txn(&self) -> MemTxn {
        MemTxn::new(self.clone())
    }

    /// Row counts per table, sorted by table name.
    pub fn sizes(&self) -> Vec<(&'static str, usize)> {
        self.inner
            .tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .sizes()
    }

    fn subscribe(&self, table: &'static str) -> watch::Receiver<u64> {
        let mut revisions = self
            .inner
            .revisions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        revisions
            .entry(table)
            .or_insert_with(|| watch::channel(0).0)
            .subscribe()
    }

    fn bump(&self, tables: &[&'static str]) {
        let revisions = self
            .inner
            .revisions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for table in tables {
            if let Some(tx) = revisions.get(table) {
                tx.send_modify(|rev| *rev += 1);
            }
        }
    }
}

/// Read-only view of every table, valid for the duration of [`MemDb::view`].
pub struct Snapshot<'a> {
    tables: &'a Tables,
    db: &'a MemDb,
}

impl<'a> Snapshot<'a> {
    pub fn get<R: Record>(&self, id: &str) -> Option<&'a R> {
        self.tables.get::<R>()?.get(id)
    }

    pub fn len<R: Record>(&self) -> usize {
        self.tables.get::<R>().map(|t| t.len()).unwrap_or(0)
    }

    /// All rows ordered by id.
    pub fn all<R: Record>(&self) -> impl DoubleEndedIterator<Item = &'a R> + 'a {
        self.tables.get::<R>().into_iter().flat_map(|t| t.rows())
    }

    /// Rows whose `index` key starts with `prefix`, ascending by (key, id).
    ///
    /// A row indexed under several matching keys of a multi-valued index is yielded
    /// once per key.
    pub fn prefix<R: Record>(
        &self,
        index: &str,
        prefix: &[KeyPart],
    ) -> impl DoubleEndedIterator<Item = &'a R> + 'a {
        let tables: &'a Tables = self.tables;
        tables
            .get::<R>()
            .map(|t| t.range(index, prefix))
            .into_iter()
            .flatten()
            .map(|(_, r)| r)
    }

    /// Same as `prefix` but descending.
    pub fn prefix_rev<R: Record>(
        &self,
        index: &str,
        prefix: &[KeyPart],
    ) -> impl Iterator<Item = &'a R> + 'a {
        self.prefix::<R>(index, prefix).rev()
    }

    pub fn first<R: Record>(&self, index: &str, prefix: &[KeyPart]) -> Option<&'a R> {
        self.prefix::<R>(index, prefix).next()
    }

    /// Register `ws` to fire on the next commit touching `R`'s table.
    pub fn watch<R: Record>(&self, ws: &mut WatchSet) {
        ws.add(self.db.subscribe(R::TABLE));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: String,
        group: String,
        rank: i64,
        tags: Vec<String>,
    }

    impl Record for Item {
        const TABLE: &'static str = "items";

        fn id(&self) -> &str {
            &self.id
        }

        fn index_keys(&self) -> Vec<(&'static str, IndexKey)> {
            let mut keys = vec![("group", key![self.group.as_str(), self.rank])];
            for tag in &self.tags {
                keys.push(("tag", key![tag.as_str()]));
            }
            keys
        }
    }

    fn item(id: &str, group: &str, rank: i64, tags: &[&str]) -> Item {
        Item {
            id: id.to_string(),
            group: group.to_string(),
            rank,
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn ids<'a>(rows: impl Iterator<Item = &'a Item>) -> Vec<&'a str> {
        rows.map(|r| r.id.as_str()).collect()
    }

    fn seeded() -> MemDb {
        let db = MemDb::new();
        let mut txn = db.txn();
        txn.insert(item("a", "g1", 3, &["x"]));
        txn.insert(item("b", "g1", 1, &["x", "y"]));
        txn.insert(item("c", "g2", 2, &[]));
        txn.insert(item("d", "g10", 0, &[]));
        txn.commit();
        db
    }

    #[test]
    fn prefix_scans_in_key_order() {
        let db = seeded();
        db.view(|snap| {
            assert_eq!(ids(snap.prefix::<Item>("group", &key!["g1"])), vec!["b", "a"]);
            assert_eq!(ids(snap.prefix_rev::<Item>("group", &key!["g1"])), vec!["a", "b"]);
            // string parts compare whole, so "g1" does not match "g10"
            assert_eq!(ids(snap.prefix::<Item>("group", &key!["g10"])), vec!["d"]);
            assert_eq!(ids(snap.prefix::<Item>("tag", &key!["x"])), vec!["a", "b"]);
            assert_eq!(snap.prefix::<Item>("group", &[]).count(), 4);
            assert_eq!(snap.len::<Item>(), 4);
        });
    }

    #[test]
    fn reinsert_replaces_index_entries() {
        let db = seeded();
        let mut txn = db.txn();
        txn.insert(item("a", "g2", 9, &[]));
        txn.commit();
        db.view(|snap| {
            assert_eq!(ids(snap.prefix::<Item>("group", &key!["g1"])), vec!["b"]);
            assert_eq!(ids(snap.prefix::<Item>("group", &key!["g2"])), vec!["c", "a"]);
            assert_eq!(ids(snap.prefix::<Item>("tag", &key!["x"])), vec!["b"]);
        });
    }

    #[test]
    fn txn_reads_its_own_writes() {
        let db = seeded();
        let mut txn = db.txn();
        txn.insert(item("e", "g1", 2, &[]));
        txn.delete::<Item>("b");
        txn.insert(item("a", "g1", 0, &[]));

        assert!(txn.get::<Item>("b").is_none());
        assert_eq!(txn.get::<Item>("e").map(|r| r.rank), Some(2));
        let rows = txn.prefix::<Item>("group", &key!["g1"]);
        let got: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(got, vec!["a", "e"]);
        assert_eq!(txn.len::<Item>(), 4);

        // not visible before commit
        db.view(|snap| assert!(snap.get::<Item>("e").is_none()));
        txn.commit();
        db.view(|snap| {
            assert!(snap.get::<Item>("b").is_none());
            assert_eq!(ids(snap.prefix::<Item>("group", &key!["g1"])), vec!["a", "e"]);
        });
    }

    #[test]
    fn dropped_txn_discards_changes() {
        let db = seeded();
        {
            let mut txn = db.txn();
            txn.delete::<Item>("a");
        }
        db.view(|snap| assert!(snap.get::<Item>("a").is_some()));
    }

    #[test]
    fn merged_prefix_dedupes_multi_valued_rows() {
        let db = MemDb::new();
        let mut txn = db.txn();
        txn.insert(item("m", "g", 0, &["k1", "k2"]));
        let rows = txn.prefix::<Item>("tag", &[]);
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn watch_fires_on_commit_to_watched_table() {
        let db = seeded();
        let mut ws = WatchSet::new();
        db.view(|snap| snap.watch::<Item>(&mut ws));
        assert!(!ws.wait_timeout(Duration::from_millis(20)).await);

        let writer = db.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let mut txn = writer.txn();
            txn.insert(item("z", "g3", 0, &[]));
            txn.commit();
        });
        assert!(ws.wait_timeout(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn empty_commit_does_not_fire() {
        let db = seeded();
        let mut ws = WatchSet::new();
        db.view(|snap| snap.watch::<Item>(&mut ws));
        db.txn().commit();
        assert!(!ws.wait_timeout(Duration::from_millis(20)).await);
    }
}
