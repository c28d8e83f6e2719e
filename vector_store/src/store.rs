use std::{
    collections::{HashMap, HashSet},
    fs::{self, OpenOptions},
    io::ErrorKind,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::{
    Key, Layout, Result, StoreConfig, StoreErr,
    cache::CacheTier,
    codec::{self, LAYOUT_FILE, OWNER_FILE},
    layout::LayoutRecord,
};

/// An out-of-core mapping from keys to vectors.
///
/// At most `capacity` vectors stay resident, the least recently touched ones are
/// written back to the store directory before leaving memory. `prefetch` schedules
/// reads on a fixed pool of background readers so later `get` calls find the
/// vectors already resident.
///
/// The store exclusively owns its directory for as long as it lives.
pub struct VectorStore {
    shared: Arc<Shared>,
    fetcher: ThreadPool,
}

/// The state reachable from both the owning thread and the background readers.
struct Shared {
    dir: PathBuf,
    layout: Layout,
    capacity: NonZeroUsize,
    debug_logging: bool,
    state: Mutex<State>,
    loaded: Condvar,
}

#[derive(Default)]
struct State {
    cache: CacheTier,
    persisted: HashSet<Key>,
    /// Keys with a read in flight, each read holds the ticket it was issued with.
    /// A `set` revokes the ticket so a slower read can never overwrite a newer value.
    loading: HashMap<Key, u64>,
    next_ticket: u64,
    fetch_errors: Vec<StoreErr>,
    /// Keys written since the last durability barrier.
    unsynced: HashSet<Key>,
}

impl State {
    fn begin_load(&mut self, key: Key) -> u64 {
        self.next_ticket += 1;
        self.loading.insert(key, self.next_ticket);
        self.next_ticket
    }
}

impl VectorStore {
    /// Opens a `VectorStore` over `dir`, creating it when missing.
    ///
    /// Vectors already persisted in `dir` become visible through `contains` and `get`.
    ///
    /// # Arguments
    /// * `dir` - The persistent directory, exclusively owned by this store.
    /// * `layout` - The fixed shape of every vector.
    /// * `config` - Capacity, fetch concurrency and logging settings.
    ///
    /// # Returns
    /// A new `VectorStore` or an error if the directory is in use, unreadable or
    /// holds vectors of a different layout.
    pub fn open(dir: impl Into<PathBuf>, layout: Layout, config: &StoreConfig) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(StoreErr::io(&dir))?;

        let owner = dir.join(OWNER_FILE);
        match OpenOptions::new().write(true).create_new(true).open(&owner) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(StoreErr::DirectoryInUse { path: dir });
            }
            Err(e) => return Err(StoreErr::io(&owner)(e)),
        }

        let prepared = Self::prepare_dir(&dir, &layout);
        let persisted = match prepared {
            Ok(persisted) => persisted,
            Err(e) => {
                let _ = fs::remove_file(&owner);
                return Err(e);
            }
        };

        let fetcher = ThreadPoolBuilder::new()
            .num_threads(config.fetch_threads.get())
            .thread_name(|i| format!("vector-fetch-{i}"))
            .build()
            .map_err(|e| {
                let _ = fs::remove_file(&owner);
                StoreErr::FetchPool(e.to_string())
            })?;

        info!(
            capacity = config.capacity.get(),
            fetch_threads = config.fetch_threads.get(),
            persisted = persisted.len();
            "opened vector store at {}",
            dir.display()
        );

        let state = State {
            unsynced: persisted.clone(),
            persisted,
            ..State::default()
        };

        let shared = Shared {
            dir,
            layout,
            capacity: config.capacity,
            debug_logging: config.debug_logging,
            state: Mutex::new(state),
            loaded: Condvar::new(),
        };

        Ok(Self {
            shared: Arc::new(shared),
            fetcher,
        })
    }

    /// Validates or writes the layout record and collects the persisted keys.
    fn prepare_dir(dir: &Path, layout: &Layout) -> Result<HashSet<Key>> {
        let record = layout.record();
        let path = dir.join(LAYOUT_FILE);

        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<LayoutRecord>(&bytes)?.check(&record)?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let bytes = serde_json::to_vec(&record)?;
                fs::write(&path, bytes).map_err(StoreErr::io(&path))?;
            }
            Err(e) => return Err(StoreErr::io(&path)(e)),
        }

        Ok(codec::scan_keys(dir)?.into_iter().collect())
    }

    /// Returns the persistent directory of this store.
    pub fn dir(&self) -> &Path {
        &self.shared.dir
    }

    pub fn layout(&self) -> &Layout {
        &self.shared.layout
    }

    /// Returns the maximum amount of resident vectors.
    pub fn capacity(&self) -> NonZeroUsize {
        self.shared.capacity
    }

    /// Returns whether `key` was ever set, either resident or persisted.
    pub fn contains(&self, key: Key) -> bool {
        let state = self.shared.state.lock();
        state.cache.contains(key) || state.persisted.contains(&key)
    }

    /// Returns every key that was ever set, in ascending order.
    pub fn keys(&self) -> Vec<Key> {
        let state = self.shared.state.lock();
        let mut keys: Vec<Key> = state
            .persisted
            .iter()
            .copied()
            .chain(state.cache.keys())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        keys.sort_unstable();
        keys
    }

    /// Returns the amount of resident vectors.
    pub fn resident(&self) -> usize {
        self.shared.state.lock().cache.len()
    }

    /// Returns the current value of `key`.
    ///
    /// If a background read of `key` is in flight this waits for it, otherwise a
    /// non resident key is read synchronously.
    ///
    /// # Returns
    /// The full length vector, `NotFound` if the key was never set or the error of
    /// the failed read.
    pub fn get(&self, key: Key) -> Result<Vec<f32>> {
        let shared = &self.shared;
        let mut state = shared.state.lock();

        loop {
            if let Some(stored) = state.cache.touch(key) {
                return Ok(shared.layout.expand(stored));
            }

            if state.loading.contains_key(&key) {
                shared.loaded.wait(&mut state);
                continue;
            }

            if !state.persisted.contains(&key) {
                return Err(StoreErr::NotFound { key });
            }

            let ticket = state.begin_load(key);
            let loaded = MutexGuard::unlocked(&mut state, || shared.read(key));
            let outcome = shared.complete_load(&mut state, key, ticket, loaded);
            shared.loaded.notify_all();
            outcome?;
        }
    }

    /// Upserts `vector` as the value of `key` and marks it dirty.
    ///
    /// Nothing is written unless an eviction is needed to stay within capacity.
    ///
    /// # Returns
    /// A `ShapeMismatch` for a vector of the wrong length or the error of a failed
    /// write-back.
    pub fn set(&self, key: Key, vector: &[f32]) -> Result<()> {
        let shared = &self.shared;
        let stored = shared.layout.compact(vector)?;

        let mut state = shared.state.lock();
        let revoked = state.loading.remove(&key).is_some();
        let outcome = shared.insert(&mut state, key, stored, true);

        if revoked {
            shared.loaded.notify_all();
        }

        outcome
    }

    /// Forgets `key`, both its resident value and its stored file.
    ///
    /// # Returns
    /// The error of a failed file removal, the key is then still persisted.
    pub fn discard(&self, key: Key) -> Result<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock();

        if state.loading.remove(&key).is_some() {
            shared.loaded.notify_all();
        }
        state.cache.remove(key);

        if state.persisted.contains(&key) {
            let path = codec::key_path(&shared.dir, key);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(StoreErr::io(&path)(e)),
            }
            state.persisted.remove(&key);
            state.unsynced.remove(&key);
        }

        Ok(())
    }

    /// Schedules background reads for every persisted, non resident key in `keys`.
    ///
    /// It never blocks on storage, failed reads are kept for `wait_fetches`.
    pub fn prefetch<I>(&self, keys: I)
    where
        I: IntoIterator<Item = Key>,
    {
        let mut state = self.shared.state.lock();
        let mut scheduled = 0;

        for key in keys {
            if state.cache.contains(key)
                || state.loading.contains_key(&key)
                || !state.persisted.contains(&key)
            {
                continue;
            }

            let ticket = state.begin_load(key);
            let shared = Arc::clone(&self.shared);
            self.fetcher.spawn(move || shared.background_load(key, ticket));
            scheduled += 1;
        }

        if self.shared.debug_logging && scheduled > 0 {
            debug!(scheduled = scheduled; "prefetch scheduled");
        }
    }

    /// Blocks until every in-flight read completes.
    ///
    /// # Returns
    /// The first background read failure since the last call, if any.
    pub fn wait_fetches(&self) -> Result<()> {
        let mut state = self.shared.wait_idle();
        let mut errors = std::mem::take(&mut state.fetch_errors);

        match errors.len() {
            0 => Ok(()),
            _ => Err(errors.swap_remove(0)),
        }
    }

    /// Writes every dirty resident vector to the store directory.
    ///
    /// # Arguments
    /// * `persist` - Also forces every file written since the last barrier and the
    ///   directory itself to durable storage, required before copying the directory
    ///   elsewhere.
    pub fn flush_all(&self, persist: bool) -> Result<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock();

        let dirty = state.cache.dirty_keys();
        for &key in &dirty {
            if let Some(entry) = state.cache.get(key) {
                codec::write_vector(&codec::key_path(&shared.dir, key), &entry.data)?;
            }
            state.cache.mark_clean(key);
            state.persisted.insert(key);
            state.unsynced.insert(key);
        }

        let mut synced = 0;
        if persist {
            let unsynced: Vec<Key> = state.unsynced.iter().copied().collect();
            for key in unsynced {
                codec::sync_file(&codec::key_path(&shared.dir, key))?;
                state.unsynced.remove(&key);
                synced += 1;
            }
            codec::sync_dir(&shared.dir)?;
        }

        if shared.debug_logging {
            debug!(written = dirty.len(), synced = synced; "flushed vector store");
        }

        Ok(())
    }

    /// Drops every resident vector without writing it back.
    ///
    /// In-flight background reads are awaited first. Call `flush_all` before this
    /// when the resident values must survive.
    pub fn release(&self) {
        let mut state = self.shared.wait_idle();
        let dropped = state.cache.len();

        state.cache.clear();
        state.fetch_errors.clear();

        info!(dropped = dropped; "released vector store at {}", self.shared.dir.display());
    }

    /// Copies the whole store directory into `<dir>_epoch_<epoch>`.
    ///
    /// Every dirty vector is written and synced before copying.
    ///
    /// # Returns
    /// The path of the snapshot directory.
    pub fn snapshot(&self, epoch: usize) -> Result<PathBuf> {
        self.flush_all(true)?;

        let mut name = self.shared.dir.as_os_str().to_os_string();
        name.push(format!("_epoch_{epoch}"));
        let target = PathBuf::from(name);

        codec::copy_dir(&self.shared.dir, &target)?;
        info!(epoch = epoch; "snapshot written to {}", target.display());

        Ok(target)
    }
}

impl Shared {
    fn read(&self, key: Key) -> Result<Box<[f32]>> {
        codec::read_vector(&codec::key_path(&self.dir, key), self.layout.stored_len())
    }

    fn background_load(&self, key: Key, ticket: u64) {
        let loaded = self.read(key);

        let mut state = self.state.lock();
        if let Err(e) = self.complete_load(&mut state, key, ticket, loaded) {
            warn!(key = key; "background read failed: {e}");
            state.fetch_errors.push(e);
        }

        drop(state);
        self.loaded.notify_all();
    }

    /// Settles a read issued with `ticket`, results of revoked tickets are discarded.
    fn complete_load(
        &self,
        state: &mut State,
        key: Key,
        ticket: u64,
        loaded: Result<Box<[f32]>>,
    ) -> Result<()> {
        let current = state.loading.get(&key) == Some(&ticket);
        if !current {
            return Ok(());
        }

        state.loading.remove(&key);
        let data = loaded?;

        if self.debug_logging {
            debug!(key = key; "loaded vector");
        }

        self.insert(state, key, data, false)
    }

    /// Evicts least recently touched entries until `key` fits, then inserts it.
    ///
    /// Dirty victims are written before leaving memory. A failed write keeps the
    /// victim resident, leaves the previous value of `key` in place and surfaces the
    /// error.
    fn insert(&self, state: &mut State, key: Key, data: Box<[f32]>, dirty: bool) -> Result<()> {
        if !state.cache.contains(key) {
            while state.cache.len() >= self.capacity.get() {
                let Some(victim) = state.cache.lru() else {
                    break;
                };
                self.evict(state, victim)?;
            }
        }

        state.cache.put(key, data, dirty);
        Ok(())
    }

    fn evict(&self, state: &mut State, victim: Key) -> Result<()> {
        if let Some(entry) = state.cache.get(victim).filter(|entry| entry.dirty) {
            codec::write_vector(&codec::key_path(&self.dir, victim), &entry.data)?;
            state.persisted.insert(victim);
            state.unsynced.insert(victim);
        }

        state.cache.remove(victim);

        if self.debug_logging {
            debug!(key = victim; "evicted vector");
        }
        Ok(())
    }

    fn wait_idle(&self) -> MutexGuard<'_, State> {
        let mut state = self.state.lock();
        while !state.loading.is_empty() {
            self.loaded.wait(&mut state);
        }
        state
    }
}

impl Drop for VectorStore {
    fn drop(&mut self) {
        drop(self.shared.wait_idle());

        let owner = self.shared.dir.join(OWNER_FILE);
        if let Err(e) = fs::remove_file(&owner) {
            warn!("failed to remove owner marker {}: {e}", owner.display());
        }
    }
}
