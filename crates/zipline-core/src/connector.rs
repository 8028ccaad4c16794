//! Registry of live connections.
//!
//! The connector is the single source of truth for which connections exist.
//! It stores entries by connection id, keeps a secondary index by observed
//! tag, and does no I/O: no method ever blocks on the network.
//!
//! One coarse `RwLock` guards the whole registry. Lookups take the read lock,
//! so concurrent dispatch tasks do not serialize against each other, and the
//! lock is never held across an await point.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use zipline_proto::Tag;

use crate::{connection::Peer, error::RegistryError};

struct Inner<T> {
    closed: bool,
    entries: HashMap<String, Arc<T>>,
    by_tag: HashMap<Tag, BTreeSet<String>>,
}

impl<T: Peer> Inner<T> {
    fn unindex(&mut self, entry: &T) {
        for tag in entry.observe_data_tags() {
            if let Some(ids) = self.by_tag.get_mut(tag) {
                ids.remove(entry.id());
                if ids.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }
    }

    fn index(&mut self, entry: &T) {
        for tag in entry.observe_data_tags() {
            self.by_tag.entry(*tag).or_default().insert(entry.id().to_string());
        }
    }
}

/// Concurrent map from connection id to connection.
pub struct Connector<T> {
    inner: RwLock<Inner<T>>,
}

impl<T: Peer> Connector<T> {
    /// Empty, open registry.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner { closed: false, entries: HashMap::new(), by_tag: HashMap::new() }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner<T>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner<T>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert `conn` under its id, replacing any entry with the same id.
    ///
    /// Returns the replaced entry; closing it is the caller's job.
    pub fn add(&self, conn: Arc<T>) -> Result<Option<Arc<T>>, RegistryError> {
        let mut inner = self.write();
        if inner.closed {
            return Err(RegistryError::Closed);
        }

        let previous = inner.entries.insert(conn.id().to_string(), Arc::clone(&conn));
        if let Some(prev) = &previous {
            inner.unindex(prev);
        }
        inner.index(&conn);
        Ok(previous)
    }

    /// Remove the entry for `id`. Absent ids are a no-op returning `None`.
    pub fn remove(&self, id: &str) -> Result<Option<Arc<T>>, RegistryError> {
        let mut inner = self.write();
        if inner.closed {
            return Err(RegistryError::Closed);
        }

        let removed = inner.entries.remove(id);
        if let Some(entry) = &removed {
            inner.unindex(entry);
        }
        Ok(removed)
    }

    /// Remove `conn` only if it is still the entry registered under its id.
    ///
    /// A connection that was superseded by a newer one with the same id must
    /// not evict its replacement on the way out.
    pub fn remove_entry(&self, conn: &Arc<T>) -> Result<bool, RegistryError> {
        let mut inner = self.write();
        if inner.closed {
            return Err(RegistryError::Closed);
        }

        let current = inner.entries.get(conn.id()).is_some_and(|e| Arc::ptr_eq(e, conn));
        if current {
            inner.entries.remove(conn.id());
            inner.unindex(conn);
        }
        Ok(current)
    }

    /// Entry registered under `id`.
    pub fn get(&self, id: &str) -> Option<Arc<T>> {
        self.read().entries.get(id).cloned()
    }

    /// Every entry matching `predicate`, in id order.
    pub fn find(&self, predicate: impl Fn(&T) -> bool) -> Vec<Arc<T>> {
        let inner = self.read();
        let mut found: Vec<_> = inner.entries.values().filter(|e| predicate(e)).cloned().collect();
        found.sort_by(|a, b| a.id().cmp(b.id()));
        found
    }

    /// Entries observing `tag`, in id order.
    pub fn by_tag(&self, tag: Tag) -> Vec<Arc<T>> {
        let inner = self.read();
        inner
            .by_tag
            .get(&tag)
            .map(|ids| ids.iter().filter_map(|id| inner.entries.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    /// Entries named `name`, in id order.
    pub fn by_name(&self, name: &str) -> Vec<Arc<T>> {
        self.find(|e| e.name() == name)
    }

    /// Point-in-time map of id to name.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.read().entries.iter().map(|(id, e)| (id.clone(), e.name().to_string())).collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    /// Whether [`Connector::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.read().closed
    }

    /// Drop every entry and refuse further mutation.
    ///
    /// Returns the dropped entries so the caller can close them.
    pub fn close(&self) -> Vec<Arc<T>> {
        let mut inner = self.write();
        inner.closed = true;
        inner.by_tag.clear();
        inner.entries.drain().map(|(_, e)| e).collect()
    }
}

impl<T: Peer> Default for Connector<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use zipline_proto::{HandshakeFrame, Metadata};

    use super::*;
    use crate::connection::ConnectionInfo;

    fn peer(id: &str, name: &str, tags: &[Tag]) -> Arc<ConnectionInfo> {
        let handshake = HandshakeFrame {
            name: name.into(),
            observe_data_tags: tags.to_vec(),
            ..Default::default()
        };
        Arc::new(ConnectionInfo::from_handshake(id, &handshake, Metadata::new()))
    }

    fn ids(entries: &[Arc<ConnectionInfo>]) -> Vec<&str> {
        entries.iter().map(|e| e.id()).collect()
    }

    #[test]
    fn add_get_remove() {
        let connector = Connector::new();
        assert!(connector.add(peer("a", "src", &[1])).unwrap().is_none());

        assert_eq!(connector.get("a").unwrap().name(), "src");
        assert!(connector.remove("a").unwrap().is_some());
        assert!(connector.get("a").is_none());
        assert!(connector.remove("a").unwrap().is_none());
    }

    #[test]
    fn add_same_id_replaces_and_reindexes() {
        let connector = Connector::new();
        let first = peer("a", "sfn", &[1]);
        connector.add(Arc::clone(&first)).unwrap();

        let replaced = connector.add(peer("a", "sfn", &[2])).unwrap().unwrap();
        assert!(Arc::ptr_eq(&replaced, &first));
        assert!(connector.by_tag(1).is_empty());
        assert_eq!(ids(&connector.by_tag(2)), ["a"]);
        assert_eq!(connector.len(), 1);
    }

    #[test]
    fn remove_entry_ignores_superseded_connection() {
        let connector = Connector::new();
        let old = peer("a", "sfn", &[1]);
        connector.add(Arc::clone(&old)).unwrap();
        let new = peer("a", "sfn", &[1]);
        connector.add(Arc::clone(&new)).unwrap();

        assert!(!connector.remove_entry(&old).unwrap());
        assert!(Arc::ptr_eq(&connector.get("a").unwrap(), &new));
        assert!(connector.remove_entry(&new).unwrap());
        assert!(connector.is_empty());
    }

    #[test]
    fn lookups_by_tag_name_and_predicate() {
        let connector = Connector::new();
        connector.add(peer("c", "sfn-1", &[0x10])).unwrap();
        connector.add(peer("a", "sfn-1", &[0x10, 0x11])).unwrap();
        connector.add(peer("b", "sfn-2", &[0x11])).unwrap();

        assert_eq!(ids(&connector.by_tag(0x10)), ["a", "c"]);
        assert_eq!(ids(&connector.by_tag(0x11)), ["a", "b"]);
        assert_eq!(ids(&connector.by_name("sfn-1")), ["a", "c"]);
        assert_eq!(ids(&connector.find(|e| e.name() == "sfn-2" && e.observes(0x11))), ["b"]);

        let snapshot = connector.snapshot();
        assert_eq!(snapshot.get("b").map(String::as_str), Some("sfn-2"));
        assert_eq!(snapshot.len(), 3);
    }

    #[test]
    fn closed_registry_refuses_mutation() {
        let connector = Connector::new();
        connector.add(peer("a", "src", &[1])).unwrap();

        let drained = connector.close();
        assert_eq!(ids(&drained), ["a"]);
        assert!(connector.is_closed());
        assert!(connector.get("a").is_none());
        assert_eq!(connector.add(peer("b", "src", &[1])), Err(RegistryError::Closed));
        assert_eq!(connector.remove("a"), Err(RegistryError::Closed));
    }

    #[test]
    fn concurrent_adds_and_removes() {
        let connector = Arc::new(Connector::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let connector = Arc::clone(&connector);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let id = format!("{t}-{i}");
                        connector.add(peer(&id, "sfn", &[t])).unwrap();
                        if i % 2 == 0 {
                            connector.remove(&id).unwrap();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(connector.len(), 8 * 50);
        for t in 0..8 {
            assert_eq!(connector.by_tag(t).len(), 50);
        }
    }

    proptest::proptest! {
        #[test]
        fn tag_index_tracks_entries(
            ops in proptest::collection::vec((0..6u8, proptest::collection::vec(0..4u32, 0..3), proptest::bool::ANY), 1..50)
        ) {
            let connector = Connector::new();
            let mut model: BTreeMap<String, Vec<Tag>> = BTreeMap::new();
            for (n, tags, add) in ops {
                let id = format!("conn-{n}");
                if add {
                    connector.add(peer(&id, "sfn", &tags)).unwrap();
                    model.insert(id, tags);
                } else {
                    connector.remove(&id).unwrap();
                    model.remove(&id);
                }
            }

            proptest::prop_assert_eq!(connector.len(), model.len());
            for tag in 0..4u32 {
                let expected: Vec<&str> = model
                    .iter()
                    .filter(|(_, tags)| tags.contains(&tag))
                    .map(|(id, _)| id.as_str())
                    .collect();
                let found = connector.by_tag(tag);
                proptest::prop_assert_eq!(ids(&found), expected);
            }
        }
    }
}
