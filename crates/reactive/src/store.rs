use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use indexmap::IndexMap;
use parking_lot::Mutex;
use snafu::{OptionExt, ResultExt};
use trickle_storage::KeyValueStore;

use super::codec::StoreCodec;
use super::error::{CodecSnafu, NotPersistentSnafu, StorageSnafu, StoreResult};
use super::observable::{Change, ObservableValue, Subscription};

/// Immutable view of the store emitted to observers.
///
/// Every mutation emits a fresh map, so holding a snapshot is always safe.
pub type Snapshot<K, V> = Arc<IndexMap<K, V>>;

/// How a store talks to durable storage.
pub struct StoreOptions<K, V> {
    pub storage_key: String,
    pub auto_save: bool,
    pub backend: Arc<dyn KeyValueStore>,
    pub codec: Arc<dyn StoreCodec<K, V>>,
}

impl<K, V> StoreOptions<K, V> {
    pub fn new(
        storage_key: impl Into<String>,
        backend: Arc<dyn KeyValueStore>,
        codec: impl StoreCodec<K, V> + 'static,
    ) -> Self {
        Self {
            storage_key: storage_key.into(),
            auto_save: false,
            backend,
            codec: Arc::new(codec),
        }
    }

    pub fn with_auto_save(mut self, auto_save: bool) -> Self {
        self.auto_save = auto_save;
        self
    }
}

struct Persistence<K, V> {
    storage_key: String,
    backend: Arc<dyn KeyValueStore>,
    codec: Arc<dyn StoreCodec<K, V>>,
}

impl<K, V> Clone for Persistence<K, V> {
    fn clone(&self) -> Self {
        Self {
            storage_key: self.storage_key.clone(),
            backend: Arc::clone(&self.backend),
            codec: Arc::clone(&self.codec),
        }
    }
}

/// Outcome of reading the stored mapping on construction.
enum Restored<K, V> {
    Found(IndexMap<K, V>),
    Absent,
    Malformed,
    /// The backend could not be read; whatever it holds may still be valid.
    ReadFailed,
}

impl<K, V> Persistence<K, V> {
    fn restore(&self) -> Restored<K, V> {
        let raw = match self.backend.get(&self.storage_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Restored::Absent,
            Err(error) => {
                tracing::warn!(
                    storage_key = %self.storage_key,
                    error = %error,
                    "failed to read stored value; using defaults without overwriting it"
                );
                return Restored::ReadFailed;
            }
        };

        match self.codec.decode(&raw) {
            Ok(entries) => Restored::Found(entries),
            Err(error) => {
                tracing::warn!(
                    storage_key = %self.storage_key,
                    error = %error,
                    "stored value is malformed; using defaults"
                );
                Restored::Malformed
            }
        }
    }

    fn write(&self, entries: &IndexMap<K, V>) -> StoreResult<()> {
        let encoded = self.codec.encode(entries).context(CodecSnafu {
            stage: "store-write-encode",
        })?;
        self.backend
            .set(&self.storage_key, &encoded)
            .context(StorageSnafu {
                stage: "store-write-backend",
            })?;
        tracing::trace!(
            storage_key = %self.storage_key,
            entries = entries.len(),
            bytes = encoded.len(),
            "persisted store snapshot"
        );
        Ok(())
    }
}

/// Observable ordered mapping with optional persistence.
pub struct ReactiveStore<K, V> {
    state: ObservableValue<Snapshot<K, V>>,
    persistence: Option<Persistence<K, V>>,
    auto_save: Mutex<Option<Subscription>>,
}

impl<K, V> ReactiveStore<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Store without persistence.
    pub fn new(initial: IndexMap<K, V>) -> Self {
        Self {
            state: ObservableValue::new(Arc::new(initial)),
            persistence: None,
            auto_save: Mutex::new(None),
        }
    }

    /// Store that restores from, and optionally saves to, `options.backend`.
    ///
    /// A missing, unreadable or malformed stored value falls back to `default`;
    /// construction never fails. When the backend could not be read, auto-save
    /// holds off until the first mutation so the stored value is not replaced
    /// by the default.
    pub fn with_options(default: IndexMap<K, V>, options: StoreOptions<K, V>) -> Self {
        if options.storage_key.trim().is_empty() {
            tracing::debug!("store created with a blank storage key; persistence disabled");
            return Self::new(default);
        }

        let persistence = Persistence {
            storage_key: options.storage_key,
            backend: options.backend,
            codec: options.codec,
        };
        let restored = persistence.restore();
        let read_failed = matches!(restored, Restored::ReadFailed);
        let initial = match restored {
            Restored::Found(entries) => entries,
            Restored::Absent | Restored::Malformed | Restored::ReadFailed => default,
        };

        let store = Self {
            state: ObservableValue::new(Arc::new(initial)),
            persistence: Some(persistence),
            auto_save: Mutex::new(None),
        };
        if options.auto_save {
            store.enable_auto_save(!read_failed);
        }
        store
    }

    pub fn snapshot(&self) -> Snapshot<K, V> {
        self.state.get()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.state.current().get(key).cloned()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.state.current().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.state.current().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.current().is_empty()
    }

    /// Inserts or replaces `key`. A replaced key keeps its position.
    pub fn set(&self, key: K, value: V) {
        self.mutate(|entries| {
            entries.insert(key, value);
        });
    }

    /// Removes `key`, preserving the order of the remaining entries.
    ///
    /// Emits even when the key was absent so observers can rely on one
    /// emission per call.
    pub fn delete(&self, key: &K) -> Option<V> {
        self.mutate(|entries| entries.shift_remove(key)).flatten()
    }

    /// Applies `edit` to the entry under `key`. Returns `false` without
    /// emitting when the key is absent.
    pub fn update_entry(&self, key: &K, edit: impl FnOnce(&mut V)) -> bool {
        if !self.contains_key(key) {
            return false;
        }

        self.mutate(|entries| match entries.get_mut(key) {
            Some(value) => {
                edit(value);
                true
            }
            None => false,
        })
        .unwrap_or(false)
    }

    pub fn replace_all(&self, entries: IndexMap<K, V>) {
        self.state.set(Arc::new(entries));
    }

    /// Re-emits the current mapping as a fresh copy.
    pub fn touch(&self) {
        self.mutate(|_| ());
    }

    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&Snapshot<K, V>) + Send + Sync + 'static,
    {
        self.state.subscribe(move |change| observer(change.value()))
    }

    pub fn storage_key(&self) -> Option<&str> {
        self.persistence
            .as_ref()
            .map(|persistence| persistence.storage_key.as_str())
    }

    pub fn auto_save_enabled(&self) -> bool {
        self.auto_save.lock().is_some()
    }

    /// Turns auto-persistence on or off and returns the resulting state.
    ///
    /// Enabling writes the current mapping right away. Stores without a
    /// storage key can never auto-save.
    pub fn set_auto_save(&self, enable: bool) -> bool {
        if !enable {
            *self.auto_save.lock() = None;
            return false;
        }
        self.enable_auto_save(true)
    }

    fn enable_auto_save(&self, write_now: bool) -> bool {
        let mut auto_save = self.auto_save.lock();
        if auto_save.is_some() {
            return true;
        }
        let Some(persistence) = self.persistence.clone() else {
            tracing::debug!("auto-save requested on a store without persistence");
            return false;
        };

        // The subscription replays the current mapping first.
        let skip_replay = AtomicBool::new(!write_now);
        *auto_save = Some(self.state.subscribe(move |change| {
            if skip_replay.swap(false, Ordering::Relaxed) {
                return;
            }
            if let Change::Next(entries) = change
                && let Err(error) = persistence.write(entries)
            {
                tracing::warn!(
                    storage_key = %persistence.storage_key,
                    error = %error,
                    "auto-save failed"
                );
            }
        }));
        true
    }

    /// Writes the current mapping to storage.
    pub fn save_to_storage(&self) -> StoreResult<()> {
        let persistence = self.persistence.as_ref().context(NotPersistentSnafu {
            stage: "store-save-to-storage",
        })?;
        persistence.write(&self.state.current())
    }

    /// Replaces the mapping with the stored one and emits it.
    ///
    /// Returns `Ok(false)` when nothing usable is stored; backend failures are
    /// reported, malformed data is only logged.
    pub fn reload_from_storage(&self) -> StoreResult<bool> {
        let persistence = self.persistence.as_ref().context(NotPersistentSnafu {
            stage: "store-reload-from-storage",
        })?;
        let raw = persistence
            .backend
            .get(&persistence.storage_key)
            .context(StorageSnafu {
                stage: "store-reload-read",
            })?;
        let Some(raw) = raw else {
            return Ok(false);
        };

        match persistence.codec.decode(&raw) {
            Ok(entries) => {
                self.replace_all(entries);
                Ok(true)
            }
            Err(error) => {
                tracing::warn!(
                    storage_key = %persistence.storage_key,
                    error = %error,
                    "ignoring malformed stored value on reload"
                );
                Ok(false)
            }
        }
    }

    // Copy-on-write: `make_mut` clones the map because the published snapshot
    // is still shared with observers.
    fn mutate<R>(&self, edit: impl FnOnce(&mut IndexMap<K, V>) -> R) -> Option<R> {
        self.state.update(|snapshot| edit(Arc::make_mut(snapshot)))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use trickle_storage::{MemoryKvStore, StorageError, StorageResult};

    use super::*;
    use crate::codec::JsonPairsCodec;

    const KEY: &str = "llm-messages";

    fn persistent_store(
        backend: &Arc<MemoryKvStore>,
        auto_save: bool,
    ) -> ReactiveStore<String, String> {
        let backend: Arc<dyn KeyValueStore> = backend.clone();
        ReactiveStore::with_options(
            IndexMap::new(),
            StoreOptions::new(KEY, backend, JsonPairsCodec).with_auto_save(auto_save),
        )
    }

    fn entries(pairs: &[(&str, &str)]) -> IndexMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[derive(Clone, Debug)]
    enum Op {
        Set(String, String),
        Delete(String),
    }

    fn set(key: &str, value: &str) -> Op {
        Op::Set(key.to_string(), value.to_string())
    }

    fn delete(key: &str) -> Op {
        Op::Delete(key.to_string())
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        // A small key space so sequences revisit and delete existing keys.
        let key = "[a-e]";
        prop_oneof![
            3 => (key, "[a-z]{0,4}").prop_map(|(key, value)| Op::Set(key, value)),
            1 => key.prop_map(Op::Delete),
        ]
    }

    /// Runs `ops` against a store and against a plain map, returning the last
    /// emitted snapshot and the replayed map.
    fn run_ops(ops: Vec<Op>) -> (IndexMap<String, String>, IndexMap<String, String>) {
        let store = ReactiveStore::new(IndexMap::new());
        let last = Arc::new(Mutex::new(Snapshot::default()));
        let sink = Arc::clone(&last);
        let _subscription = store.subscribe(move |snapshot| *sink.lock() = Arc::clone(snapshot));

        let mut replayed = IndexMap::new();
        for op in ops {
            match op {
                Op::Set(key, value) => {
                    store.set(key.clone(), value.clone());
                    replayed.insert(key, value);
                }
                Op::Delete(key) => {
                    store.delete(&key);
                    replayed.shift_remove(&key);
                }
            }
        }

        let emitted = IndexMap::clone(&last.lock());
        (emitted, replayed)
    }

    #[test]
    fn emitted_mapping_matches_replay_on_empty_mapping() {
        let ops = vec![
            set("1", "a"),
            set("2", "b"),
            set("1", "c"),
            delete("2"),
            delete("9"),
            set("3", "d"),
            set("2", "e"),
        ];

        let (emitted, replayed) = run_ops(ops);
        assert_eq!(emitted, replayed);
        assert_eq!(
            replayed.keys().cloned().collect::<Vec<_>>(),
            vec!["1".to_string(), "3".to_string(), "2".to_string()]
        );
    }

    proptest! {
        #[test]
        fn any_op_sequence_emits_its_replay(ops in prop::collection::vec(arb_op(), 0..40)) {
            let (emitted, replayed) = run_ops(ops);
            prop_assert_eq!(emitted, replayed);
        }
    }

    #[test]
    fn earlier_snapshots_are_not_mutated() {
        let store = ReactiveStore::new(entries(&[("1", "a")]));
        let before = store.snapshot();

        store.set("2".to_string(), "b".to_string());
        store.delete(&"1".to_string());

        assert_eq!(*before, entries(&[("1", "a")]));
        assert_eq!(*store.snapshot(), entries(&[("2", "b")]));
    }

    #[test]
    fn every_mutation_emits_once_in_call_order() {
        let store = ReactiveStore::new(IndexMap::new());
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&sizes);
        let _subscription = store.subscribe(move |snapshot| sink.lock().push(snapshot.len()));

        store.set("1".to_string(), "a".to_string());
        store.set("2".to_string(), "b".to_string());
        store.delete(&"1".to_string());
        assert!(!store.update_entry(&"missing".to_string(), |_| {}));
        assert!(store.update_entry(&"2".to_string(), |value| value.push('!')));

        assert_eq!(*sizes.lock(), vec![0, 1, 2, 1, 1]);
        assert_eq!(store.get(&"2".to_string()).as_deref(), Some("b!"));
    }

    #[test]
    fn restores_stored_value_on_construction() {
        let backend = Arc::new(MemoryKvStore::new().with_entry(KEY, r#"[["1","hello"]]"#));
        let store = persistent_store(&backend, false);

        assert_eq!(*store.snapshot(), entries(&[("1", "hello")]));
        assert_eq!(store.storage_key(), Some(KEY));
    }

    #[test]
    fn malformed_stored_value_falls_back_to_default() {
        let backend = Arc::new(MemoryKvStore::new().with_entry(KEY, "{not json"));
        let backend_handle: Arc<dyn KeyValueStore> = backend.clone();
        let store = ReactiveStore::with_options(
            entries(&[("0", "welcome")]),
            StoreOptions::new(KEY, backend_handle, JsonPairsCodec),
        );

        assert_eq!(*store.snapshot(), entries(&[("0", "welcome")]));
        // Nothing is written back until a save happens.
        assert_eq!(backend.get(KEY).unwrap().as_deref(), Some("{not json"));
    }

    #[test]
    fn auto_save_writes_every_emission() {
        let backend = Arc::new(MemoryKvStore::new());
        let store = persistent_store(&backend, true);
        assert!(store.auto_save_enabled());
        assert_eq!(backend.get(KEY).unwrap().as_deref(), Some("[]"));

        store.set("1".to_string(), "a".to_string());
        assert_eq!(backend.get(KEY).unwrap().as_deref(), Some(r#"[["1","a"]]"#));

        store.delete(&"1".to_string());
        assert_eq!(backend.get(KEY).unwrap().as_deref(), Some("[]"));
    }

    /// Fails the first read, then behaves like the wrapped store.
    struct FlakyReadStore {
        inner: MemoryKvStore,
        failed_once: AtomicBool,
    }

    impl KeyValueStore for FlakyReadStore {
        fn get(&self, key: &str) -> StorageResult<Option<String>> {
            if !self.failed_once.swap(true, Ordering::SeqCst) {
                return Err(StorageError::InvariantViolation {
                    stage: "flaky-read",
                    details: "database is locked".to_string(),
                });
            }
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> StorageResult<()> {
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) -> StorageResult<()> {
            self.inner.remove(key)
        }
    }

    #[test]
    fn failed_restore_read_does_not_overwrite_stored_value() {
        let backend = Arc::new(FlakyReadStore {
            inner: MemoryKvStore::new().with_entry(KEY, r#"[["1","precious"]]"#),
            failed_once: AtomicBool::new(false),
        });
        let backend_handle: Arc<dyn KeyValueStore> = backend.clone();
        let store: ReactiveStore<String, String> = ReactiveStore::with_options(
            IndexMap::new(),
            StoreOptions::new(KEY, backend_handle, JsonPairsCodec).with_auto_save(true),
        );

        assert!(store.is_empty());
        assert!(store.auto_save_enabled());
        assert_eq!(
            backend.get(KEY).unwrap().as_deref(),
            Some(r#"[["1","precious"]]"#)
        );

        store.set("2".to_string(), "b".to_string());
        assert_eq!(backend.get(KEY).unwrap().as_deref(), Some(r#"[["2","b"]]"#));
    }

    #[test]
    fn auto_save_keeps_the_latest_value_when_an_observer_sets_again() {
        let backend = Arc::new(MemoryKvStore::new());
        let store = Arc::new(persistent_store(&backend, false));

        let handle = Arc::clone(&store);
        let _follow_up = store.subscribe(move |snapshot| {
            if snapshot.len() == 1 {
                handle.set("2".to_string(), "b".to_string());
            }
        });
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&sizes);
        let _late = store.subscribe(move |snapshot| sink.lock().push(snapshot.len()));
        assert!(store.set_auto_save(true));

        store.set("1".to_string(), "a".to_string());

        assert_eq!(store.len(), 2);
        assert_eq!(*sizes.lock(), vec![0, 1, 2]);
        assert_eq!(
            backend.get(KEY).unwrap().as_deref(),
            Some(r#"[["1","a"],["2","b"]]"#)
        );
    }

    #[test]
    fn disabling_auto_save_stops_writes() {
        let backend = Arc::new(MemoryKvStore::new());
        let store = persistent_store(&backend, true);

        assert!(!store.set_auto_save(false));
        store.set("1".to_string(), "a".to_string());
        assert_eq!(backend.get(KEY).unwrap().as_deref(), Some("[]"));

        store.save_to_storage().unwrap();
        assert_eq!(backend.get(KEY).unwrap().as_deref(), Some(r#"[["1","a"]]"#));
    }

    #[test]
    fn in_memory_store_cannot_persist() {
        let store: ReactiveStore<String, String> = ReactiveStore::new(IndexMap::new());
        assert!(!store.set_auto_save(true));
        assert!(store.save_to_storage().is_err());
        assert!(store.reload_from_storage().is_err());
        assert_eq!(store.storage_key(), None);
    }

    #[test]
    fn reload_replaces_mapping_when_storage_changed() {
        let backend = Arc::new(MemoryKvStore::new());
        let store = persistent_store(&backend, false);

        assert!(!store.reload_from_storage().unwrap());

        backend.set(KEY, r#"[["2","b"],["1","a"]]"#).unwrap();
        assert!(store.reload_from_storage().unwrap());
        assert_eq!(*store.snapshot(), entries(&[("2", "b"), ("1", "a")]));

        backend.set(KEY, "garbage").unwrap();
        assert!(!store.reload_from_storage().unwrap());
        assert_eq!(store.len(), 2);
    }
}
