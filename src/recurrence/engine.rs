use std::{num::NonZeroUsize, path::PathBuf};

use log::{debug, info, warn};
use ndarray::Array1;
use vector_store::{Key, StoreErr, VectorStore};

use super::{Coefficients, PendingQueue, SampleState};
use crate::{HyperGradErr, Result};

/// Tracks the momentum-SGD recurrence of every training sample while only touching
/// the samples present in each mini-batch.
///
/// A sample missing from a batch gets the batch's coefficients queued instead of an
/// update, the queue is folded into its stored state the next time it is touched.
/// Calls for one key must never run concurrently, the engine is driven from a single
/// coordinating thread.
pub struct LazyRecurrence {
    momentum: VectorStore,
    hyper: VectorStore,
    pending: Vec<PendingQueue>,
}

impl LazyRecurrence {
    /// Creates a new `LazyRecurrence` with an empty queue for every key.
    ///
    /// # Arguments
    /// * `momentum` - The store holding each sample's momentum term.
    /// * `hyper` - The store holding each sample's hyper-gradient.
    /// * `keys` - The training set size, valid keys are `0..keys`.
    ///
    /// # Returns
    /// A new engine or a `ShapeMismatch` if both stores don't share a layout.
    pub fn new(momentum: VectorStore, hyper: VectorStore, keys: usize) -> Result<Self> {
        if momentum.layout() != hyper.layout() {
            return Err(StoreErr::ShapeMismatch {
                what: "momentum and hyper-gradient layouts",
                got: momentum.layout().stored_len(),
                expected: hyper.layout().stored_len(),
            }
            .into());
        }

        Ok(Self {
            momentum,
            hyper,
            pending: vec![PendingQueue::default(); keys],
        })
    }

    /// Returns the training set size.
    pub fn keys(&self) -> usize {
        self.pending.len()
    }

    /// Returns the full length of the tracked vectors.
    pub fn dim(&self) -> usize {
        self.hyper.layout().dim()
    }

    pub fn momentum_store(&self) -> &VectorStore {
        &self.momentum
    }

    pub fn hyper_store(&self) -> &VectorStore {
        &self.hyper
    }

    /// Returns the steps `key` still has to catch up on.
    pub fn pending(&self, key: Key) -> Result<&PendingQueue> {
        self.check_key(key)?;
        Ok(&self.pending[key])
    }

    /// Reads the stored state of `key`, without applying its queued steps.
    pub fn state(&self, key: Key) -> Result<SampleState> {
        self.check_key(key)?;

        Ok(SampleState {
            momentum: load(&self.momentum, key)?,
            hyper: load(&self.hyper, key)?,
        })
    }

    /// Issues background reads of both states of every key in `keys`.
    pub fn prefetch(&self, keys: &[Key]) {
        self.momentum.prefetch(keys.iter().copied());
        self.hyper.prefetch(keys.iter().copied());
    }

    /// Queues a skipped step for `key`.
    pub fn enqueue(&mut self, key: Key, coefficients: Coefficients) -> Result<()> {
        self.check_key(key)?;
        self.pending[key].push(coefficients);
        Ok(())
    }

    /// Queues a skipped step for every key not flagged in `touched`.
    ///
    /// # Arguments
    /// * `touched` - One flag per key, `true` for the keys of the current batch.
    /// * `coefficients` - The current step's coefficients.
    pub fn enqueue_untouched(&mut self, touched: &[bool], coefficients: Coefficients) -> Result<()> {
        if touched.len() != self.keys() {
            return Err(StoreErr::ShapeMismatch {
                what: "touched flags",
                got: touched.len(),
                expected: self.keys(),
            }
            .into());
        }

        self.pending
            .iter_mut()
            .zip(touched)
            .filter(|(_, touched)| !**touched)
            .for_each(|(queue, _)| queue.push(coefficients));

        Ok(())
    }

    /// Applies every queued step of `key` in order and stores the result.
    pub fn drain(&mut self, key: Key) -> Result<()> {
        self.check_key(key)?;
        if self.pending[key].is_empty() {
            return Ok(());
        }

        let (before, state) = self.catch_up(key)?;
        self.commit(key, before, &state)
    }

    /// Updates `key` with the gradient it contributed to the current step.
    ///
    /// Queued steps are applied first, then the gradient is scaled by
    /// `training set size / batch_size` and folded into both states.
    ///
    /// # Arguments
    /// * `key` - A sample present in the current batch.
    /// * `gradient` - The sample's gradient, of the tracked vectors' full length.
    /// * `batch_size` - The size of the current batch.
    /// * `coefficients` - The current step's coefficients.
    pub fn direct_update(
        &mut self,
        key: Key,
        gradient: &[f32],
        batch_size: NonZeroUsize,
        coefficients: Coefficients,
    ) -> Result<()> {
        self.check_key(key)?;
        self.check_dim(gradient)?;

        let (before, mut state) = self.catch_up(key)?;
        let scale = self.keys() as f32 / batch_size.get() as f32;
        state.step(Array1::from_iter(gradient.iter().map(|g| g * scale)), coefficients);

        self.commit(key, before, &state)
    }

    /// Drains every key with queued steps.
    ///
    /// Keys are visited in ascending order, each chunk's states are prefetched
    /// while the previous chunk is drained.
    ///
    /// # Returns
    /// The amount of drained keys.
    pub fn drain_all(&mut self) -> Result<usize> {
        let keys: Vec<Key> = (0..self.keys())
            .filter(|&key| !self.pending[key].is_empty())
            .collect();

        info!(keys = keys.len(); "draining queued steps");

        let chunk_size = (self.hyper.capacity().get() / 2).max(1);
        let chunks: Vec<&[Key]> = keys.chunks(chunk_size).collect();

        if let Some(first) = chunks.first() {
            self.prefetch(first);
        }

        for (i, chunk) in chunks.iter().enumerate() {
            if let Some(next) = chunks.get(i + 1) {
                self.prefetch(next);
            }

            for &key in chunk.iter() {
                self.drain(key)?;
            }
        }

        self.momentum.wait_fetches()?;
        self.hyper.wait_fetches()?;

        info!(keys = keys.len(); "drained queued steps");
        Ok(keys.len())
    }

    /// Drains every key and copies both store directories into epoch tagged siblings.
    ///
    /// # Returns
    /// The momentum and hyper-gradient snapshot directories.
    pub fn snapshot(&mut self, epoch: usize) -> Result<(PathBuf, PathBuf)> {
        self.drain_all()?;

        let hyper = self.hyper.snapshot(epoch)?;
        let momentum = self.momentum.snapshot(epoch)?;

        Ok((momentum, hyper))
    }

    /// Drains every key, makes the hyper-gradients durable and releases both stores.
    ///
    /// Momentum terms are only needed while training, so they are dropped unflushed.
    pub fn finish(&mut self) -> Result<()> {
        self.drain_all()?;
        self.hyper.flush_all(true)?;

        self.hyper.release();
        self.momentum.release();
        Ok(())
    }

    /// Loads the state of `key` and applies its queued steps without storing it.
    ///
    /// # Returns
    /// The stored momentum term next to the caught up state.
    fn catch_up(&self, key: Key) -> Result<(Option<Array1<f32>>, SampleState)> {
        let mut state = self.state(key)?;
        let before = state.momentum.clone();
        let queue = &self.pending[key];

        for coefficients in queue.iter() {
            state.advance(coefficients);
        }

        if !queue.is_empty() {
            debug!(key = key, steps = queue.len(); "caught up queued steps");
        }

        Ok((before, state))
    }

    /// Stores both terms of `state` and clears the queue of `key`.
    ///
    /// Either everything is committed or the stores keep their previous values and
    /// the queue is left as is.
    fn commit(&mut self, key: Key, before: Option<Array1<f32>>, state: &SampleState) -> Result<()> {
        if let Some(momentum) = &state.momentum {
            save(&self.momentum, key, momentum)?;
        }

        let saved = match &state.hyper {
            Some(hyper) => save(&self.hyper, key, hyper),
            None => Ok(()),
        };

        if let Err(e) = saved {
            if state.momentum.is_some() {
                let restored = match &before {
                    Some(momentum) => save(&self.momentum, key, momentum),
                    None => self.momentum.discard(key).map_err(HyperGradErr::from),
                };

                if let Err(restore) = restored {
                    warn!(key = key; "failed to restore momentum term: {restore}");
                }
            }
            return Err(e);
        }

        self.pending[key].clear();
        Ok(())
    }

    fn check_key(&self, key: Key) -> Result<()> {
        if key >= self.keys() {
            return Err(HyperGradErr::KeyOutOfRange {
                key,
                keys: self.keys(),
            });
        }
        Ok(())
    }

    fn check_dim(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dim() {
            return Err(StoreErr::ShapeMismatch {
                what: "instance gradient",
                got: vector.len(),
                expected: self.dim(),
            }
            .into());
        }
        Ok(())
    }
}

fn load(store: &VectorStore, key: Key) -> Result<Option<Array1<f32>>> {
    if !store.contains(key) {
        return Ok(None);
    }

    Ok(Some(Array1::from(store.get(key)?)))
}

fn save(store: &VectorStore, key: Key, vector: &Array1<f32>) -> Result<()> {
    match vector.as_slice() {
        Some(slice) => store.set(key, slice)?,
        None => store.set(key, &vector.to_vec())?,
    }
    Ok(())
}
