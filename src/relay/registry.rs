//! Which connection owns which announced file.

use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};

use super::hub::HistoryHandle;
use super::ConnId;
use crate::protocol::FileId;

/// One announced file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRecord {
    pub owner: ConnId,
    /// The announcement's history entry, removed when the file goes away
    pub history: Option<HistoryHandle>,
}

#[derive(Debug, Default)]
struct RegistryState {
    files: HashMap<FileId, FileRecord>,
    owned: HashMap<ConnId, BTreeSet<FileId>>,
}

#[derive(Debug, Default)]
pub struct FileRegistry {
    state: RwLock<RegistryState>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `owner` as the source of `id`. A second registration of the
    /// same id replaces the first, including its owner's back-reference,
    /// and hands back the replaced record so its announcement can be dropped.
    pub fn register(&self, owner: ConnId, id: FileId, history: Option<HistoryHandle>) -> Option<FileRecord> {
        let mut state = self.state.write();

        let previous = state.files.insert(id, FileRecord { owner, history });
        if let Some(prev) = previous.filter(|p| p.owner != owner) {
            if let Some(ids) = state.owned.get_mut(&prev.owner) {
                ids.remove(&id);
                if ids.is_empty() {
                    state.owned.remove(&prev.owner);
                }
            }
        }
        state.owned.entry(owner).or_default().insert(id);
        previous
    }

    pub fn owner_of(&self, id: FileId) -> Option<ConnId> {
        self.state.read().files.get(&id).map(|r| r.owner)
    }

    pub fn get(&self, id: FileId) -> Option<FileRecord> {
        self.state.read().files.get(&id).copied()
    }

    /// Remove every file owned by `owner`, in ascending id order.
    pub fn release_all(&self, owner: ConnId) -> Vec<(FileId, Option<HistoryHandle>)> {
        let mut state = self.state.write();
        let Some(ids) = state.owned.remove(&owner) else {
            return Vec::new();
        };

        ids.into_iter()
            .filter_map(|id| state.files.remove(&id).map(|r| (id, r.history)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::hub::BroadcastHub;
    use bytes::Bytes;

    fn handle(hub: &BroadcastHub) -> Option<HistoryHandle> {
        hub.publish(Bytes::from_static(b"x"), true).handle
    }

    #[test]
    fn test_register_and_lookup() {
        let hub = BroadcastHub::new(10);
        let registry = FileRegistry::new();
        let h = handle(&hub);

        registry.register(ConnId(1), FileId(7), h);

        assert_eq!(registry.owner_of(FileId(7)), Some(ConnId(1)));
        assert_eq!(registry.get(FileId(7)).unwrap().history, h);
        assert_eq!(registry.owner_of(FileId(8)), None);
    }

    #[test]
    fn test_release_all_removes_only_that_owner() {
        let registry = FileRegistry::new();
        registry.register(ConnId(1), FileId(9), None);
        registry.register(ConnId(1), FileId(7), None);
        registry.register(ConnId(2), FileId(8), None);

        let released = registry.release_all(ConnId(1));

        assert_eq!(released, vec![(FileId(7), None), (FileId(9), None)]);
        assert_eq!(registry.owner_of(FileId(7)), None);
        assert_eq!(registry.owner_of(FileId(8)), Some(ConnId(2)));
        assert!(registry.release_all(ConnId(1)).is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_reregister_last_writer_wins() {
        let hub = BroadcastHub::new(10);
        let registry = FileRegistry::new();
        let first = handle(&hub);
        assert_eq!(registry.register(ConnId(1), FileId(3), first), None);

        let replaced = registry.register(ConnId(2), FileId(3), None).unwrap();
        assert_eq!(replaced.owner, ConnId(1));
        assert_eq!(replaced.history, first);

        assert_eq!(registry.owner_of(FileId(3)), Some(ConnId(2)));
        // the first owner leaving must not take the file with it
        assert!(registry.release_all(ConnId(1)).is_empty());
        assert_eq!(registry.owner_of(FileId(3)), Some(ConnId(2)));
        assert_eq!(registry.release_all(ConnId(2)), vec![(FileId(3), None)]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reregister_same_owner_returns_old_handle() {
        let hub = BroadcastHub::new(10);
        let registry = FileRegistry::new();
        let first = handle(&hub);
        let second = handle(&hub);

        registry.register(ConnId(1), FileId(4), first);
        let replaced = registry.register(ConnId(1), FileId(4), second).unwrap();

        assert_eq!(replaced.history, first);
        assert_eq!(registry.release_all(ConnId(1)), vec![(FileId(4), second)]);
    }
}
