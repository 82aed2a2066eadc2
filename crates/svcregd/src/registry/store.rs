//! Registry storage and operations.

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use svcreg_core::{Endpoint, ListFilter, RegistrationEntry, ServiceName, Tag};

// ============================================================================
// Keys and Ownership
// ============================================================================

/// Identifier of one client connection, unique for the daemon's lifetime
/// and carried across handoffs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Stable handle to one registry entry.
///
/// Ordered by `(service, user)` first so all entries sharing an identity
/// are adjacent; `seq` is unique per registry and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryKey {
    pub service: ServiceName,
    pub user: u32,
    pub seq: u64,
}

/// The connection and tag an entry was committed under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub connection: ConnectionId,
    pub tag: Tag,
}

impl Owner {
    pub fn new(connection: ConnectionId, tag: Tag) -> Self {
        Self { connection, tag }
    }
}

/// One registry row with its key and owner, as carried by snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryRecord {
    pub key: EntryKey,
    pub entry: RegistrationEntry,
    pub owner: Owner,
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Debug)]
struct Stored {
    entry: RegistrationEntry,
    owner: Owner,
}

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<EntryKey, Stored>,
    next_seq: u64,
}

impl Inner {
    fn identity_range<'a>(
        &'a self,
        service: &ServiceName,
        user: u32,
    ) -> impl Iterator<Item = (&'a EntryKey, &'a Stored)> + 'a {
        let start = EntryKey {
            service: service.clone(),
            user,
            seq: 0,
        };
        let end = EntryKey {
            service: service.clone(),
            user,
            seq: u64::MAX,
        };
        self.entries.range(start..=end)
    }
}

/// Ordered multiset of registrations.
///
/// Every operation takes the internal lock for its own duration only and
/// never blocks on anything else while holding it.
#[derive(Debug, Default)]
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a batch of entries all-or-nothing.
    ///
    /// The batch is rejected (`None`, registry untouched) if any entry
    /// shares `(service, user)` with an existing entry and either side is
    /// exclusive. Entries within the batch are not checked against each
    /// other. Before inserting, any existing entry with the same pid but a
    /// different recorded executable has its executable cleared.
    pub fn insert_batch(
        &self,
        entries: Vec<RegistrationEntry>,
        owner: &Owner,
    ) -> Option<Vec<EntryKey>> {
        let mut inner = self.inner.write();

        for entry in &entries {
            let conflict = inner
                .identity_range(&entry.service, entry.user)
                .any(|(_, stored)| stored.entry.conflicts_with(entry));
            if conflict {
                debug!(
                    connection = %owner.connection,
                    tag = %owner.tag,
                    service = %entry.service,
                    user = entry.user,
                    "Batch rejected: exclusive registration conflict"
                );
                return None;
            }
        }

        for entry in entries.iter().filter(|e| e.has_executable()) {
            for stored in inner.entries.values_mut() {
                if stored.entry.pid == entry.pid
                    && stored.entry.has_executable()
                    && stored.entry.executable != entry.executable
                {
                    debug!(
                        pid = entry.pid,
                        stale = %stored.entry.executable,
                        "Clearing executable recorded for a recycled pid"
                    );
                    stored.entry.executable.clear();
                }
            }
        }

        let mut keys = Vec::with_capacity(entries.len());
        for entry in entries {
            let key = EntryKey {
                service: entry.service.clone(),
                user: entry.user,
                seq: inner.next_seq,
            };
            inner.next_seq += 1;
            inner.entries.insert(
                key.clone(),
                Stored {
                    entry,
                    owner: owner.clone(),
                },
            );
            keys.push(key);
        }
        Some(keys)
    }

    /// Removes at most one entry among `handles` matching `service` and
    /// `endpoint`, returning its key.
    pub fn remove(
        &self,
        handles: &[EntryKey],
        service: &ServiceName,
        endpoint: &Endpoint,
    ) -> Option<EntryKey> {
        let mut inner = self.inner.write();
        let key = handles.iter().find(|key| {
            &key.service == service
                && inner
                    .entries
                    .get(key)
                    .is_some_and(|stored| &stored.entry.endpoint == endpoint)
        })?;
        inner.entries.remove(key);
        Some(key.clone())
    }

    /// Removes every entry among `handles`, returning how many existed.
    pub fn remove_all(&self, handles: &[EntryKey]) -> usize {
        let mut inner = self.inner.write();
        handles
            .iter()
            .filter(|key| inner.entries.remove(key).is_some())
            .count()
    }

    /// Returns the entries matching `filter`, ordered by `(service, user)`
    /// and then by insertion.
    pub fn list(&self, filter: &ListFilter) -> Vec<RegistrationEntry> {
        let inner = self.inner.read();
        inner
            .entries
            .values()
            .filter(|stored| filter.matches(&stored.entry))
            .map(|stored| stored.entry.clone())
            .collect()
    }

    pub fn get(&self, key: &EntryKey) -> Option<RegistrationEntry> {
        self.inner.read().entries.get(key).map(|s| s.entry.clone())
    }

    pub fn contains(&self, key: &EntryKey) -> bool {
        self.inner.read().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// Returns every record owned by `connection`.
    pub fn owned_by(&self, connection: ConnectionId) -> Vec<RegistryRecord> {
        let inner = self.inner.read();
        inner
            .entries
            .iter()
            .filter(|(_, stored)| stored.owner.connection == connection)
            .map(|(key, stored)| RegistryRecord {
                key: key.clone(),
                entry: stored.entry.clone(),
                owner: stored.owner.clone(),
            })
            .collect()
    }

    /// Copies out every record with its key and owner.
    pub fn snapshot(&self) -> Vec<RegistryRecord> {
        let inner = self.inner.read();
        inner
            .entries
            .iter()
            .map(|(key, stored)| RegistryRecord {
                key: key.clone(),
                entry: stored.entry.clone(),
                owner: stored.owner.clone(),
            })
            .collect()
    }

    /// Replaces the contents with `records`, keeping their keys so that
    /// inherited connection handles stay valid.
    pub fn restore(&self, records: Vec<RegistryRecord>) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        let mut next_seq = 0;
        for record in records {
            next_seq = next_seq.max(record.key.seq.saturating_add(1));
            inner.entries.insert(
                record.key,
                Stored {
                    entry: record.entry,
                    owner: record.owner,
                },
            );
        }
        inner.next_seq = next_seq;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(service: &str, user: u32, pid: u32, endpoint: &str, exclusive: bool) -> RegistrationEntry {
        RegistrationEntry {
            service: ServiceName::new(service).unwrap(),
            user,
            pid,
            executable: String::new(),
            endpoint: Endpoint::parse(endpoint).unwrap(),
            exclusive,
        }
    }

    fn owner(connection: u64, tag: &str) -> Owner {
        Owner::new(ConnectionId(connection), Tag::new(tag).unwrap())
    }

    #[test]
    fn test_insert_and_list() {
        let registry = Registry::new();
        let keys = registry
            .insert_batch(
                vec![entry("mail", 1000, 1, "25", true), entry("mail", 1000, 1, "26", false)],
                &owner(1, "T1"),
            )
            .unwrap();

        assert_eq!(keys.len(), 2);
        assert_eq!(registry.len(), 2);
        let listed = registry.list(&ListFilter::all());
        assert_eq!(listed[0].endpoint, Endpoint::Port(25));
        assert_eq!(listed[1].endpoint, Endpoint::Port(26));
    }

    #[test]
    fn test_exclusive_conflict_rejects_whole_batch() {
        let registry = Registry::new();
        registry
            .insert_batch(vec![entry("mail", 1000, 1, "25", true)], &owner(1, "T1"))
            .unwrap();

        let result = registry.insert_batch(
            vec![entry("ipp", 1000, 2, "631", false), entry("mail", 1000, 2, "27", false)],
            &owner(2, "T2"),
        );
        assert!(result.is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_other_user_does_not_conflict() {
        let registry = Registry::new();
        registry
            .insert_batch(vec![entry("mail", 1000, 1, "25", true)], &owner(1, "T1"))
            .unwrap();
        assert!(registry
            .insert_batch(vec![entry("mail", 1001, 2, "25", true)], &owner(2, "T1"))
            .is_some());
    }

    #[test]
    fn test_remove_only_touches_given_handles() {
        let registry = Registry::new();
        let mine = registry
            .insert_batch(vec![entry("mail", 1000, 1, "25", false)], &owner(1, "T1"))
            .unwrap();
        let theirs = registry
            .insert_batch(vec![entry("mail", 1000, 2, "25", false)], &owner(2, "T1"))
            .unwrap();

        let service = ServiceName::new("mail").unwrap();
        let removed = registry.remove(&mine, &service, &Endpoint::Port(25));
        assert_eq!(removed.as_ref(), mine.first());
        assert!(registry.contains(&theirs[0]));
        assert!(registry.remove(&mine, &service, &Endpoint::Port(25)).is_none());
    }

    #[test]
    fn test_remove_all_counts_existing() {
        let registry = Registry::new();
        let keys = registry
            .insert_batch(
                vec![entry("a", 1, 1, "1", false), entry("b", 1, 1, "2", false)],
                &owner(1, "T"),
            )
            .unwrap();
        assert_eq!(registry.remove_all(&keys), 2);
        assert_eq!(registry.remove_all(&keys), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_recycled_pid_clears_older_executable() {
        let registry = Registry::new();
        let mut old = entry("mail", 1000, 42, "25", false);
        old.executable = "/usr/sbin/old".to_string();
        let old_keys = registry.insert_batch(vec![old], &owner(1, "T1")).unwrap();

        let mut new = entry("ipp", 1000, 42, "631", false);
        new.executable = "/usr/sbin/new".to_string();
        registry.insert_batch(vec![new], &owner(2, "T1")).unwrap();

        assert_eq!(registry.get(&old_keys[0]).unwrap().executable, "");
    }

    #[test]
    fn test_snapshot_restore_keeps_keys_and_sequence() {
        let registry = Registry::new();
        let keys = registry
            .insert_batch(vec![entry("mail", 1000, 1, "25", false)], &owner(3, "T1"))
            .unwrap();

        let restored = Registry::new();
        restored.restore(registry.snapshot());
        assert!(restored.contains(&keys[0]));
        assert_eq!(restored.owned_by(ConnectionId(3)).len(), 1);

        let fresh = restored
            .insert_batch(vec![entry("mail", 1000, 1, "26", false)], &owner(3, "T2"))
            .unwrap();
        assert!(fresh[0].seq > keys[0].seq);
    }
}
